//! Plugin administration endpoints and the plugin route mount

use axum::{
    extract::{Path, Request, State},
    response::Response,
    routing::{get, post},
    Json, Router,
};

use plughub_core::plugins::{
    PluginConfig, PluginDetails, PluginRoute, PluginStatus, PluginSystemMetrics,
    UnregisterOutcome,
};
use plughub_core::PluginSystemConfig;

use crate::auth::{Caller, ADMIN_CAPABILITY};
use crate::error::AppError;
use crate::types::{HealthCheckResponse, PluginSummary};
use crate::AppState;

/// Build the plugin-system router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/plugins", get(list_plugins))
        .route("/plugins/:id", get(get_plugin).delete(unregister_plugin))
        .route("/plugins/:id/enable", post(enable_plugin))
        .route("/plugins/:id/disable", post(disable_plugin))
        .route("/plugins/:id/status", get(plugin_status))
        .route("/plugins/:id/config", axum::routing::put(update_config))
        .route("/plugins/:id/health", post(check_health))
        .route("/routes", get(list_routes))
        .route("/metrics", get(metrics))
        .route("/config", get(system_config))
}

/// List every known plugin with its state and routes
pub async fn list_plugins(State(state): State<AppState>) -> Json<Vec<PluginSummary>> {
    let summaries = state
        .manager
        .get_plugins()
        .into_iter()
        .map(|plugin| {
            let health = state
                .manager
                .get_status(plugin.id())
                .map(|status| status.health)
                .unwrap_or_default();
            let routes = state.manager.routes_for(plugin.id());
            PluginSummary::new(plugin, health, &routes)
        })
        .collect();
    Json(summaries)
}

/// Hand a request under `/api/plugins/` to the route binder
pub async fn dispatch(State(state): State<AppState>, request: Request) -> Response {
    state.manager.binder().dispatch(request).await
}

async fn get_plugin(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<PluginDetails>, AppError> {
    Ok(Json(state.manager.plugin_details(&id)?))
}

async fn enable_plugin(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(id): Path<String>,
) -> Result<Json<PluginStatus>, AppError> {
    caller.require(ADMIN_CAPABILITY)?;
    state.manager.enable(&id).await?;
    Ok(Json(state.manager.get_status(&id)?))
}

async fn disable_plugin(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(id): Path<String>,
) -> Result<Json<PluginStatus>, AppError> {
    caller.require(ADMIN_CAPABILITY)?;
    state.manager.disable(&id).await?;
    Ok(Json(state.manager.get_status(&id)?))
}

async fn unregister_plugin(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(id): Path<String>,
) -> Result<Json<UnregisterOutcome>, AppError> {
    caller.require(ADMIN_CAPABILITY)?;
    Ok(Json(state.manager.unregister(&id).await?))
}

async fn plugin_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<PluginStatus>, AppError> {
    Ok(Json(state.manager.get_status(&id)?))
}

async fn update_config(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(id): Path<String>,
    Json(config): Json<PluginConfig>,
) -> Result<Json<PluginDetails>, AppError> {
    caller.require(ADMIN_CAPABILITY)?;
    state.manager.update_config(&id, config).await?;
    Ok(Json(state.manager.plugin_details(&id)?))
}

/// Run one health check now, outside the supervisor schedule
async fn check_health(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(id): Path<String>,
) -> Result<Json<HealthCheckResponse>, AppError> {
    caller.require(ADMIN_CAPABILITY)?;
    let health = state.supervisor.check_now(&id).await?;
    Ok(Json(HealthCheckResponse {
        plugin_id: id,
        health,
    }))
}

async fn list_routes(State(state): State<AppState>) -> Json<Vec<PluginRoute>> {
    Json(state.manager.binder().routes())
}

async fn metrics(State(state): State<AppState>) -> Json<PluginSystemMetrics> {
    Json(state.manager.system_metrics())
}

async fn system_config(State(state): State<AppState>) -> Json<PluginSystemConfig> {
    Json((*state.config).clone())
}
