//! PlugHub Server
//!
//! Self-hosted API server for the plugin runtime and the plugin marketplace.
//! This is a library crate; the server is started via `start_server()`.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::State,
    http::Method,
    middleware,
    routing::{any, get},
    Json, Router,
};
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use plughub_core::distribution::{self, ArtifactJob, ArtifactJobs, ArtifactStore};
use plughub_core::paths;
use plughub_core::plugins::{
    FileRegistry, HealthSupervisor, MarketplacePlugin, PluginCatalog, PluginEvent, PluginManager,
    PluginRegistry,
};
use plughub_core::storage::{Database, MarketplaceStore, SharedDatabase, SqliteRegistry};
use plughub_core::{PluginSystemConfig, RegistryBackend};

pub mod auth;
pub mod builtin;
pub mod error;
pub mod routes;
pub mod types;

use types::HealthResponse;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<PluginManager>,
    pub supervisor: Arc<HealthSupervisor>,
    pub artifacts: Arc<dyn ArtifactStore>,
    /// Background upload/delete jobs against `artifacts`.
    pub jobs: ArtifactJobs,
    pub db: SharedDatabase,
    pub config: Arc<PluginSystemConfig>,
}

impl AppState {
    /// Wire the runtime together. Nothing is loaded until `initialize`.
    pub fn new(
        config: PluginSystemConfig,
        db: SharedDatabase,
        catalog: PluginCatalog,
    ) -> anyhow::Result<Self> {
        config.validate()?;

        let registry: Arc<dyn PluginRegistry> = match config.registry {
            RegistryBackend::Sqlite => Arc::new(SqliteRegistry::new(db.clone())),
            RegistryBackend::File => Arc::new(FileRegistry::in_dir(&config.plugins_dir)),
        };

        let artifacts = distribution::from_config(&config.distribution)?;
        tracing::info!(backend = artifacts.backend_name(), "Artifact store ready");

        let hook_db = db.clone();
        let jobs = ArtifactJobs::new(artifacts.clone(), config.distribution.operation_timeout())
            .with_hook(Arc::new(move |job: &ArtifactJob| {
                routes::marketplace::link_uploaded_artifact(&hook_db, job)
            }));

        let manager = Arc::new(PluginManager::new(config.clone(), registry, catalog));
        let supervisor = Arc::new(HealthSupervisor::new(manager.clone(), config.health.clone()));

        Ok(Self {
            manager,
            supervisor,
            artifacts,
            jobs,
            db,
            config: Arc::new(config),
        })
    }

    /// Publish catalog listings and bring persisted plugins back.
    pub async fn initialize(&self) -> anyhow::Result<()> {
        let store = MarketplaceStore::new(&self.db);
        for id in self.manager.catalog().ids() {
            if store.get(&id)?.is_some() {
                continue;
            }
            if let Some(plugin) = self.manager.catalog().instantiate(&id) {
                store.upsert(&MarketplacePlugin::from_metadata(&plugin.metadata()))?;
            }
        }

        let report = self.manager.restore().await?;
        for (plugin_id, error) in &report.failed {
            tracing::warn!(plugin_id = %plugin_id, "Plugin failed to restore: {}", error);
        }
        Ok(())
    }
}

/// Open the on-disk database and build initialized state with the built-in catalog.
pub async fn build_state(config: PluginSystemConfig) -> anyhow::Result<AppState> {
    let db = Arc::new(Database::new(&paths::database_path())?);
    let state = AppState::new(config, db, builtin::catalog())?;
    state.initialize().await?;
    Ok(state)
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PATCH,
            Method::PUT,
            Method::DELETE,
        ])
        .allow_headers(Any);

    // Plugin routes stay at the root so the binder sees the full `/api/plugins/...` path.
    Router::new()
        .route("/health", get(health))
        .route("/api/plugins", get(routes::plugins::list_plugins))
        .route("/api/plugins/*rest", any(routes::plugins::dispatch))
        .nest("/api", routes::api_router())
        .layer(middleware::from_fn(auth::caller_context))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the PlugHub server and block until ctrl-c.
pub async fn start_server(config: PluginSystemConfig) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port).parse()?;
    let state = build_state(config).await?;

    let cancel = CancellationToken::new();
    let supervisor = tokio::spawn(state.supervisor.clone().run(cancel.clone()));
    spawn_event_logger(&state.manager, cancel.clone());

    let manager = state.manager.clone();
    let app = build_router(state);

    tracing::info!("PlugHub server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    cancel.cancel();
    if let Err(e) = supervisor.await {
        tracing::warn!("Health supervisor ended abnormally: {}", e);
    }
    manager.shutdown().await;
    tracing::info!("PlugHub server stopped");

    Ok(())
}

fn spawn_event_logger(manager: &PluginManager, cancel: CancellationToken) {
    let mut events = manager.subscribe();
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(PluginEvent::BecameUnhealthy {
                    plugin_id,
                    consecutive_failures,
                    last_error,
                }) => tracing::warn!(
                    plugin_id = %plugin_id,
                    failures = consecutive_failures,
                    "Plugin unhealthy: {:?}",
                    last_error
                ),
                Ok(PluginEvent::Error { plugin_id, error }) => {
                    tracing::warn!(plugin_id = %plugin_id, code = error.code.as_str(), "{}", error.message)
                }
                Ok(event) => tracing::debug!(?event, "Plugin event"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Plugin event logger lagged, skipped {} events", skipped)
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        plugins: state.manager.get_plugins().len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
        response::Response,
    };
    use serde_json::Value;
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;

    async fn test_state() -> (AppState, TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = PluginSystemConfig::default();
        config.plugins_dir = dir.path().join("plugins");
        config.distribution.local.root = dir.path().join("artifacts");
        config.distribution.local.public_base_url = Some("https://cdn.example.com".to_string());

        let db = Arc::new(Database::in_memory().expect("db"));
        let state = AppState::new(config, db, builtin::catalog()).expect("state");
        state.initialize().await.expect("initialize");
        (state, dir)
    }

    async fn send(app: &Router, request: Request<Body>) -> Response {
        app.clone().oneshot(request).await.expect("response")
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), 1024 * 1024).await.expect("body");
        serde_json::from_slice(&bytes).expect("json")
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).expect("request")
    }

    fn post(uri: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .body(Body::empty())
            .expect("request")
    }

    #[tokio::test]
    async fn health_reports_builtin_plugins() {
        let (state, _dir) = test_state().await;
        let app = build_router(state);

        let response = send(&app, get("/health")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["plugins"], 2);
    }

    #[tokio::test]
    async fn plugin_route_follows_enable_state() {
        let (state, _dir) = test_state().await;
        let app = build_router(state);

        let response = send(&app, get("/api/plugins/echo/ping")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["pong"], true);

        let response = send(&app, post("/api/plugin-system/plugins/echo/disable")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["state"], "disabled");

        let response = send(&app, get("/api/plugins/echo/ping")).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        // Other plugins keep serving.
        let response = send(&app, get("/api/plugins/cluster-info/summary")).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn plugin_list_includes_routes() {
        let (state, _dir) = test_state().await;
        let app = build_router(state);

        let body = json_body(send(&app, get("/api/plugins")).await).await;
        let plugins = body.as_array().expect("array");
        assert_eq!(plugins.len(), 2);
        let echo = plugins
            .iter()
            .find(|p| p["id"] == "echo")
            .expect("echo listed");
        assert_eq!(echo["routes"].as_array().map(Vec::len), Some(2));
    }

    #[tokio::test]
    async fn endpoint_permissions_use_caller_capabilities() {
        let (state, _dir) = test_state().await;
        let app = build_router(state);

        let denied = Request::builder()
            .uri("/api/plugins/cluster-info/summary")
            .header(auth::CAPABILITIES_HEADER, "pod.read")
            .body(Body::empty())
            .expect("request");
        assert_eq!(send(&app, denied).await.status(), StatusCode::FORBIDDEN);

        let allowed = Request::builder()
            .uri("/api/plugins/cluster-info/summary")
            .header(auth::CAPABILITIES_HEADER, "cluster.read")
            .body(Body::empty())
            .expect("request");
        let response = send(&app, allowed).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["cluster"], "local");
    }

    #[tokio::test]
    async fn admin_endpoints_require_admin_capability() {
        let (state, _dir) = test_state().await;
        let app = build_router(state);

        let request = Request::builder()
            .method("POST")
            .uri("/api/plugin-system/plugins/echo/disable")
            .header(auth::CAPABILITIES_HEADER, "cluster.read")
            .body(Body::empty())
            .expect("request");
        let response = send(&app, request).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(json_body(response).await["code"], "FORBIDDEN");

        let request = Request::builder()
            .method("POST")
            .uri("/api/plugin-system/plugins/echo/disable")
            .header(auth::CAPABILITIES_HEADER, "admin.all")
            .body(Body::empty())
            .expect("request");
        assert_eq!(send(&app, request).await.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn health_checks_and_ratings_require_admin_capability() {
        let (state, _dir) = test_state().await;
        let app = build_router(state);

        let request = Request::builder()
            .method("POST")
            .uri("/api/plugin-system/plugins/echo/health")
            .header(auth::CAPABILITIES_HEADER, "cluster.read")
            .body(Body::empty())
            .expect("request");
        assert_eq!(send(&app, request).await.status(), StatusCode::FORBIDDEN);

        let request = Request::builder()
            .method("POST")
            .uri("/api/marketplace/plugins/echo/rating")
            .header(auth::CAPABILITIES_HEADER, "cluster.read")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"rating":4.5}"#))
            .expect("request");
        assert_eq!(send(&app, request).await.status(), StatusCode::FORBIDDEN);

        let request = Request::builder()
            .method("POST")
            .uri("/api/plugin-system/plugins/echo/health")
            .header(auth::CAPABILITIES_HEADER, "admin.all")
            .body(Body::empty())
            .expect("request");
        assert_eq!(send(&app, request).await.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_plugin_is_not_found() {
        let (state, _dir) = test_state().await;
        let app = build_router(state);

        let response = send(&app, get("/api/plugin-system/plugins/nope/status")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    fn plugin_archive(manifest: &str) -> Vec<u8> {
        use flate2::{write::GzEncoder, Compression};

        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        for (path, content) in [("plugin.yml", manifest), ("README.md", "echo plugin")] {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            builder
                .append_data(&mut header, path, content.as_bytes())
                .expect("append");
        }
        builder.into_inner().expect("tar").finish().expect("gzip")
    }

    fn echo_manifest(version: &str) -> String {
        format!(
            "id: echo\nname: Echo\nversion: {version}\nauthor: PlugHub\n\
             description: Echo, repackaged\nendpoints:\n  - method: GET\n    path: /ping\n    handler: ping\n"
        )
    }

    fn upload(key: &str, body: Vec<u8>) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(format!("/api/marketplace/artifacts/{}", key))
            .body(Body::from(body))
            .expect("request")
    }

    #[tokio::test]
    async fn artifact_upload_links_marketplace_listing() {
        let (state, _dir) = test_state().await;
        let jobs = state.jobs.clone();
        let app = build_router(state);
        let archive = plugin_archive(&echo_manifest("9.0.0"));

        let response = send(&app, upload("echo.tar.gz", archive.clone())).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let job = json_body(response).await;
        let id: uuid::Uuid = job["id"].as_str().expect("id").parse().expect("uuid");

        let done = jobs
            .wait(id, Duration::from_secs(5))
            .await
            .expect("job exists");
        assert!(done.state.is_finished());

        let body = json_body(send(&app, get("/api/marketplace/artifacts/echo.tar.gz/url")).await).await;
        assert_eq!(body["url"], "https://cdn.example.com/echo/echo.tar.gz");

        let listing = json_body(send(&app, get("/api/marketplace/plugins/echo")).await).await;
        assert_eq!(listing["version"], "9.0.0");
        assert_eq!(listing["description"], "Echo, repackaged");
        assert_eq!(listing["artifact_key"], "echo.tar.gz");
        assert_eq!(listing["download_url"], "https://cdn.example.com/echo/echo.tar.gz");

        let response = send(&app, get("/api/marketplace/artifacts/echo.tar.gz")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), 1024 * 1024).await.expect("body");
        assert_eq!(&bytes[..], &archive[..]);

        let listing = json_body(send(&app, get("/api/marketplace/plugins/echo")).await).await;
        assert_eq!(listing["downloads"], 1);
    }

    #[tokio::test]
    async fn upload_without_manifest_is_rejected() {
        let (state, _dir) = test_state().await;
        let jobs = state.jobs.clone();
        let app = build_router(state);

        let response = send(&app, upload("echo.tar.gz", b"archive-bytes".to_vec())).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["code"], "INVALID_ARCHIVE");

        let invalid = plugin_archive("id: echo\nname: Echo\nversion: not-semver\nauthor: PlugHub\n");
        let response = send(&app, upload("echo.tar.gz", invalid)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        assert!(jobs.list().is_empty());
        let listing = json_body(send(&app, get("/api/marketplace/plugins/echo")).await).await;
        assert_eq!(listing["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn upload_of_listed_version_conflicts() {
        let (state, _dir) = test_state().await;
        let jobs = state.jobs.clone();
        let app = build_router(state);

        // The built-in listing already carries the crate version.
        let archive = plugin_archive(&echo_manifest(env!("CARGO_PKG_VERSION")));
        let response = send(&app, upload("echo.tar.gz", archive)).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(json_body(response).await["code"], "CONFLICT");
        assert!(jobs.list().is_empty());

        let first = send(&app, upload("echo.tar.gz", plugin_archive(&echo_manifest("2.0.0")))).await;
        assert_eq!(first.status(), StatusCode::ACCEPTED);
        let again = send(&app, upload("echo-2.tar.gz", plugin_archive(&echo_manifest("2.0.0")))).await;
        assert_eq!(again.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn invalid_artifact_key_is_rejected() {
        let (state, _dir) = test_state().await;
        let app = build_router(state);

        let request = Request::builder()
            .method("POST")
            .uri("/api/marketplace/artifacts/.hidden.tar.gz")
            .body(Body::from("x"))
            .expect("request");
        let response = send(&app, request).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["code"], "INVALID_ARTIFACT_KEY");
    }
}
