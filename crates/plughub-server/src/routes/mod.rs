//! API routes

use axum::Router;

use crate::AppState;

pub(crate) mod marketplace;
pub(crate) mod plugins;

/// Build the API router with all endpoints
pub fn api_router() -> Router<AppState> {
    Router::new()
        .nest("/plugin-system", plugins::router())
        .nest("/marketplace", marketplace::router())
}
