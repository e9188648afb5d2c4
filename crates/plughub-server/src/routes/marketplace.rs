//! Marketplace endpoints: catalog listings and plugin artifacts

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use uuid::Uuid;

use plughub_core::distribution::{read_manifest, validate_key, ArtifactJob, JobState};
use plughub_core::plugins::{
    validator, InstallMethod, InstallOptions, InstalledPlugin, MarketplacePlugin,
};
use plughub_core::storage::MarketplaceStore;

use crate::auth::{Caller, ADMIN_CAPABILITY};
use crate::error::AppError;
use crate::types::{ArtifactUrlResponse, RatingRequest};
use crate::AppState;

/// Build the marketplace router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/plugins", get(list_listings))
        .route("/plugins/:id", get(get_listing))
        .route("/plugins/:id/install", post(install_plugin))
        .route("/plugins/:id/rating", post(rate_plugin))
        .route(
            "/artifacts/:key",
            get(download_artifact)
                .post(upload_artifact)
                .delete(delete_artifact),
        )
        .route("/artifacts/:key/url", get(artifact_url))
        .route("/jobs", get(list_jobs))
        .route("/jobs/:id", get(get_job))
}

async fn list_listings(State(state): State<AppState>) -> Result<Json<Vec<MarketplacePlugin>>, AppError> {
    Ok(Json(MarketplaceStore::new(&state.db).list()?))
}

async fn get_listing(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<MarketplacePlugin>, AppError> {
    MarketplaceStore::new(&state.db)
        .get(&id)?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("marketplace plugin '{}' not found", id)))
}

/// Install a catalog plugin and count the install
async fn install_plugin(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<InstalledPlugin>), AppError> {
    caller.require(ADMIN_CAPABILITY)?;

    let plugin = state
        .manager
        .catalog()
        .instantiate(&id)
        .ok_or_else(|| AppError::NotFound(format!("no installable plugin '{}'", id)))?;
    let metadata = plugin.metadata();

    state
        .manager
        .install(
            plugin,
            InstallOptions {
                install_method: InstallMethod::Marketplace,
                ..Default::default()
            },
        )
        .await?;

    let store = MarketplaceStore::new(&state.db);
    if store.get(&id)?.is_none() {
        store.upsert(&MarketplacePlugin::from_metadata(&metadata))?;
    }
    store.increment_installs(&id)?;

    let installed = state
        .manager
        .get_plugin(&id)
        .ok_or_else(|| AppError::Internal(format!("plugin '{}' vanished after install", id)))?;
    Ok((StatusCode::CREATED, Json(installed)))
}

async fn rate_plugin(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(id): Path<String>,
    Json(request): Json<RatingRequest>,
) -> Result<Json<MarketplacePlugin>, AppError> {
    caller.require(ADMIN_CAPABILITY)?;
    let store = MarketplaceStore::new(&state.db);
    if store.get(&id)?.is_none() {
        return Err(AppError::NotFound(format!("marketplace plugin '{}' not found", id)));
    }
    store
        .set_rating(&id, request.rating)
        .map_err(|e| AppError::BadRequest(e.to_string()))?;
    get_listing(State(state), Path(id)).await
}

/// Queue an upload; the body is a `.tar.gz` with `plugin.yml` at its root.
///
/// The manifest is checked before anything is stored. Its listing is created,
/// or moved to the new version; re-uploading a listed version is a conflict.
async fn upload_artifact(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(key): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, Json<ArtifactJob>), AppError> {
    caller.require(ADMIN_CAPABILITY)?;
    validate_key(&key)?;
    if body.is_empty() {
        return Err(AppError::BadRequest("artifact body is empty".to_string()));
    }

    let metadata = read_manifest(&body)?;
    validator::validate_metadata(&metadata, state.manager.host_version())?;

    let store = MarketplaceStore::new(&state.db);
    let mut listing = match store.get(&metadata.id)? {
        Some(existing) if existing.version == metadata.version => {
            return Err(AppError::Conflict(format!(
                "{} {} is already published",
                metadata.id, metadata.version
            )));
        }
        Some(existing) => existing,
        None => MarketplacePlugin::from_metadata(&metadata),
    };
    listing.name = metadata.name.clone();
    listing.version = metadata.version.clone();
    listing.description = metadata.description.clone();
    listing.author = metadata.author.clone();
    listing.artifact_key = Some(key.clone());
    store.upsert(&listing)?;

    let job = state.jobs.submit_upload(&key, body)?;
    tracing::info!(
        plugin_id = %metadata.id,
        version = %metadata.version,
        key = %key,
        job_id = %job.id,
        "Queued plugin upload"
    );
    Ok((StatusCode::ACCEPTED, Json(job)))
}

async fn delete_artifact(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(key): Path<String>,
) -> Result<(StatusCode, Json<ArtifactJob>), AppError> {
    caller.require(ADMIN_CAPABILITY)?;
    let job = state.jobs.submit_delete(&key)?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

async fn download_artifact(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Response, AppError> {
    let data = state.artifacts.download_file(&key).await?;

    let store = MarketplaceStore::new(&state.db);
    if let Some(listing) = store.find_by_artifact(&key)? {
        store.increment_downloads(&listing.plugin_id)?;
    }

    let disposition = format!("attachment; filename=\"{}\"", key);
    Ok((
        [
            (header::CONTENT_TYPE, content_type_for(&key).to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        data,
    )
        .into_response())
}

async fn artifact_url(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<ArtifactUrlResponse>, AppError> {
    let url = state.artifacts.get_file_url(&key)?;
    Ok(Json(ArtifactUrlResponse { key, url }))
}

async fn list_jobs(State(state): State<AppState>) -> Json<Vec<ArtifactJob>> {
    Json(state.jobs.list())
}

async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ArtifactJob>, AppError> {
    state
        .jobs
        .get(id)
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("job '{}' not found", id)))
}

/// Point the listing that claimed a finished upload at its public URL.
pub(crate) fn link_uploaded_artifact(db: &plughub_core::storage::Database, job: &ArtifactJob) {
    let url = match &job.state {
        JobState::Succeeded { url: Some(url) } => url,
        _ => return,
    };

    let store = MarketplaceStore::new(db);
    let listing = match store.find_by_artifact(&job.key) {
        Ok(Some(listing)) => listing,
        Ok(None) => {
            tracing::debug!(key = %job.key, "Uploaded artifact has no marketplace listing");
            return;
        }
        Err(e) => {
            tracing::warn!(key = %job.key, error = %e, "Marketplace lookup failed");
            return;
        }
    };
    if let Err(e) = store.set_artifact(&listing.plugin_id, &job.key, url) {
        tracing::warn!(plugin_id = %listing.plugin_id, error = %e, "Failed to link artifact");
    }
}

fn content_type_for(key: &str) -> &'static str {
    if key.ends_with(".tar.gz") || key.ends_with(".tgz") {
        "application/gzip"
    } else if key.ends_with(".zip") {
        "application/zip"
    } else {
        "application/octet-stream"
    }
}
