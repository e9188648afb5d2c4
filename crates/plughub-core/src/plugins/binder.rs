//! Route binder: mounts plugin endpoints behind a per-request guard.
//!
//! The live route table is an axum `Router` snapshot, rebuilt and swapped on every
//! bind/unbind. Request tasks clone the current snapshot and never wait on a rebuild.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::Request,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{MethodFilter, MethodRouter},
    Json, Router,
};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use tokio::sync::Semaphore;
use tower::ServiceExt;

use super::contract::{CallerCapabilities, Plugin, PluginHandler};
use super::types::{PluginError, PluginErrorCode, PluginRoute};
use crate::error::PluginSystemError;

/// Mount point for every plugin route.
pub const PLUGIN_ROUTE_PREFIX: &str = "/api/plugins";

const MAX_RECENT_ERRORS: usize = 10;

/// Resolve a declared endpoint path to the path it is served under.
///
/// Paths already under `/api/plugins/` are kept; anything else is mounted
/// below `/api/plugins/{plugin_id}`.
pub fn resolve_route_path(plugin_id: &str, declared: &str) -> String {
    let prefixed = format!("{}/", PLUGIN_ROUTE_PREFIX);
    if declared.starts_with(&prefixed) {
        return declared.to_string();
    }
    let trimmed = declared.trim_start_matches('/');
    if trimmed.is_empty() {
        format!("{}/{}", PLUGIN_ROUTE_PREFIX, plugin_id)
    } else {
        format!("{}/{}/{}", PLUGIN_ROUTE_PREFIX, plugin_id, trimmed)
    }
}

/// Handlers of an initialized plugin instance.
pub struct LivePlugin {
    pub plugin: Arc<dyn Plugin>,
    pub handlers: HashMap<String, PluginHandler>,
}

/// Per-plugin runtime switchboard read on every request.
///
/// `enabled` is the single in-memory source of truth for whether the plugin's
/// routes may reach its handlers.
pub struct PluginGate {
    plugin_id: String,
    enabled: AtomicBool,
    live: RwLock<Option<Arc<LivePlugin>>>,
    request_count: AtomicU64,
    error_count: AtomicU64,
    recent_errors: Mutex<VecDeque<PluginError>>,
}

impl PluginGate {
    pub fn new(plugin_id: &str, enabled: bool) -> Arc<Self> {
        Arc::new(Self {
            plugin_id: plugin_id.to_string(),
            enabled: AtomicBool::new(enabled),
            live: RwLock::new(None),
            request_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            recent_errors: Mutex::new(VecDeque::with_capacity(MAX_RECENT_ERRORS)),
        })
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub(crate) fn attach(&self, live: Arc<LivePlugin>) {
        *self.live.write() = Some(live);
    }

    pub(crate) fn detach(&self) -> Option<Arc<LivePlugin>> {
        self.live.write().take()
    }

    pub fn live(&self) -> Option<Arc<LivePlugin>> {
        self.live.read().clone()
    }

    pub fn is_serving(&self) -> bool {
        self.live.read().is_some()
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }

    pub fn record_error(&self, error: PluginError) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
        let mut recent = self.recent_errors.lock();
        if recent.len() == MAX_RECENT_ERRORS {
            recent.pop_front();
        }
        recent.push_back(error);
    }

    /// Up to `limit` most recent errors, oldest first.
    pub fn recent_errors(&self, limit: usize) -> Vec<PluginError> {
        let recent = self.recent_errors.lock();
        let skip = recent.len().saturating_sub(limit);
        recent.iter().skip(skip).cloned().collect()
    }
}

#[derive(Clone)]
struct Binding {
    gate: Arc<PluginGate>,
    routes: Vec<PluginRoute>,
}

#[derive(Clone)]
struct CallLimits {
    permits: Arc<Semaphore>,
    timeout: Duration,
}

/// A `(method, path)` already owned by another plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteConflict {
    pub existing: String,
    pub method: String,
    pub path: String,
}

pub struct RouteBinder {
    bindings: Mutex<BTreeMap<String, Binding>>,
    snapshot: RwLock<Router>,
    limits: CallLimits,
}

impl RouteBinder {
    pub fn new(max_concurrent_calls: usize, call_timeout: Duration) -> Self {
        Self {
            bindings: Mutex::new(BTreeMap::new()),
            snapshot: RwLock::new(empty_router()),
            limits: CallLimits {
                permits: Arc::new(Semaphore::new(max_concurrent_calls.max(1))),
                timeout: call_timeout,
            },
        }
    }

    /// First route in `routes` already bound by a different plugin.
    pub fn find_conflict(&self, plugin_id: &str, routes: &[PluginRoute]) -> Option<RouteConflict> {
        find_conflict(&self.bindings.lock(), plugin_id, routes)
    }

    /// Bind (or rebind) all routes of one plugin and publish a new snapshot.
    ///
    /// Nothing changes when the candidate route table cannot be built.
    pub fn bind(
        &self,
        gate: Arc<PluginGate>,
        routes: Vec<PluginRoute>,
    ) -> Result<(), PluginSystemError> {
        let plugin_id = gate.plugin_id().to_string();
        let mut bindings = self.bindings.lock();

        if let Some(conflict) = find_conflict(&bindings, &plugin_id, &routes) {
            return Err(PluginSystemError::Collision {
                existing: conflict.existing,
                incoming: plugin_id,
                message: format!("route {} {} is already registered", conflict.method, conflict.path),
            });
        }

        let mut candidate = bindings.clone();
        candidate.insert(plugin_id.clone(), Binding { gate, routes });
        let router = build_router(&candidate, &self.limits)
            .map_err(|message| PluginSystemError::routing(&plugin_id, message))?;

        let count = candidate.get(&plugin_id).map_or(0, |b| b.routes.len());
        *bindings = candidate;
        *self.snapshot.write() = router;

        tracing::info!(plugin_id = %plugin_id, routes = count, "Bound plugin routes");
        Ok(())
    }

    /// Remove every route of a plugin. Returns false if it had none bound.
    pub fn unbind(&self, plugin_id: &str) -> bool {
        let mut bindings = self.bindings.lock();
        if bindings.remove(plugin_id).is_none() {
            return false;
        }

        match build_router(&bindings, &self.limits) {
            Ok(router) => *self.snapshot.write() = router,
            Err(message) => {
                // The gate of the removed plugin is already closed, so its routes
                // stay unreachable even with the previous snapshot.
                tracing::error!(plugin_id = %plugin_id, error = %message, "Failed to rebuild routes after unbind");
            }
        }

        tracing::info!(plugin_id = %plugin_id, "Unbound plugin routes");
        true
    }

    pub fn is_bound(&self, plugin_id: &str) -> bool {
        self.bindings.lock().contains_key(plugin_id)
    }

    pub fn routes(&self) -> Vec<PluginRoute> {
        self.bindings
            .lock()
            .values()
            .flat_map(|binding| binding.routes.iter().cloned())
            .collect()
    }

    pub fn routes_for(&self, plugin_id: &str) -> Vec<PluginRoute> {
        self.bindings
            .lock()
            .get(plugin_id)
            .map(|binding| binding.routes.clone())
            .unwrap_or_default()
    }

    /// Current route table. Cheap to clone.
    pub fn router(&self) -> Router {
        self.snapshot.read().clone()
    }

    /// Route a request through the current snapshot.
    pub async fn dispatch(&self, request: Request) -> Response {
        let router = self.router();
        match router.oneshot(request).await {
            Ok(response) => response,
            Err(never) => match never {},
        }
    }
}

fn find_conflict(
    bindings: &BTreeMap<String, Binding>,
    plugin_id: &str,
    routes: &[PluginRoute],
) -> Option<RouteConflict> {
    bindings
        .iter()
        .filter(|(owner, _)| owner.as_str() != plugin_id)
        .find_map(|(owner, binding)| {
            routes.iter().find_map(|route| {
                binding
                    .routes
                    .iter()
                    .find(|bound| {
                        bound.path == route.path && bound.method.eq_ignore_ascii_case(&route.method)
                    })
                    .map(|bound| RouteConflict {
                        existing: owner.clone(),
                        method: bound.method.to_ascii_uppercase(),
                        path: bound.path.clone(),
                    })
            })
        })
}

fn method_filter(method: &str) -> Option<MethodFilter> {
    match method.to_ascii_uppercase().as_str() {
        "GET" => Some(MethodFilter::GET),
        "POST" => Some(MethodFilter::POST),
        "PUT" => Some(MethodFilter::PUT),
        "PATCH" => Some(MethodFilter::PATCH),
        "DELETE" => Some(MethodFilter::DELETE),
        "HEAD" => Some(MethodFilter::HEAD),
        "OPTIONS" => Some(MethodFilter::OPTIONS),
        _ => None,
    }
}

fn empty_router() -> Router {
    Router::new().fallback(no_route)
}

/// Build a route table from bindings. axum panics on conflicting or malformed
/// routes; those panics are turned into an error.
fn build_router(bindings: &BTreeMap<String, Binding>, limits: &CallLimits) -> Result<Router, String> {
    let mut by_path: BTreeMap<String, Vec<(MethodFilter, BoundEndpoint)>> = BTreeMap::new();

    for binding in bindings.values() {
        for route in &binding.routes {
            let filter = method_filter(&route.method)
                .ok_or_else(|| format!("unsupported HTTP method '{}'", route.method))?;
            by_path.entry(route.path.clone()).or_default().push((
                filter,
                BoundEndpoint {
                    gate: binding.gate.clone(),
                    handler: route.handler.clone(),
                    permissions: route.permissions.clone().into(),
                    limits: limits.clone(),
                },
            ));
        }
    }

    std::panic::catch_unwind(AssertUnwindSafe(move || {
        by_path
            .into_iter()
            .fold(empty_router(), |router, (path, endpoints)| {
                let method_router = endpoints.into_iter().fold(
                    MethodRouter::new(),
                    |method_router, (filter, endpoint)| {
                        method_router.on(filter, move |request: Request| endpoint.clone().call(request))
                    },
                );
                router.route(&path, method_router)
            })
    }))
    .map_err(|panic| format!("invalid route table: {}", panic_message(panic.as_ref())))
}

#[derive(Clone)]
struct BoundEndpoint {
    gate: Arc<PluginGate>,
    handler: String,
    permissions: Arc<[String]>,
    limits: CallLimits,
}

impl BoundEndpoint {
    async fn call(self, request: Request) -> Response {
        let gate = &self.gate;
        let plugin_id = gate.plugin_id();

        if !gate.is_enabled() {
            return guard_response(
                StatusCode::FORBIDDEN,
                "PLUGIN_DISABLED",
                plugin_id,
                format!("Plugin '{}' is disabled", plugin_id),
            );
        }

        let Some(live) = gate.live() else {
            return guard_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "PLUGIN_UNAVAILABLE",
                plugin_id,
                format!("Plugin '{}' is not loaded", plugin_id),
            );
        };

        if let Some(caller) = request.extensions().get::<CallerCapabilities>() {
            if let Some(missing) = self.permissions.iter().find(|p| !caller.allows(p)) {
                return guard_response(
                    StatusCode::FORBIDDEN,
                    PluginErrorCode::PermissionDenied.as_str(),
                    plugin_id,
                    format!("Missing capability '{}' for plugin '{}'", missing, plugin_id),
                );
            }
        }

        let _permit = match tokio::time::timeout(
            self.limits.timeout,
            self.limits.permits.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            _ => {
                return guard_response(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "PLUGIN_BUSY",
                    plugin_id,
                    "Too many concurrent plugin calls".to_string(),
                );
            }
        };

        let (parts, body) = request.into_parts();
        if let Err(err) = live.plugin.validate_request(&parts) {
            let error = live.plugin.handle_error(&err);
            gate.record_error(error);
            return guard_response(
                StatusCode::FORBIDDEN,
                PluginErrorCode::PermissionDenied.as_str(),
                plugin_id,
                format!("Request rejected by plugin '{}': {}", plugin_id, err),
            );
        }
        let request = Request::from_parts(parts, body);

        let Some(handler) = live.handlers.get(&self.handler).cloned() else {
            return guard_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                PluginErrorCode::Internal.as_str(),
                plugin_id,
                format!("Handler '{}' is not available", self.handler),
            );
        };

        let future = match std::panic::catch_unwind(AssertUnwindSafe(|| handler(request))) {
            Ok(future) => future,
            Err(panic) => return self.handler_panicked(panic_message(panic.as_ref())),
        };

        match tokio::time::timeout(self.limits.timeout, AssertUnwindSafe(future).catch_unwind()).await
        {
            Ok(Ok(response)) => {
                gate.request_count.fetch_add(1, Ordering::Relaxed);
                response
            }
            Ok(Err(panic)) => self.handler_panicked(panic_message(panic.as_ref())),
            Err(_) => {
                let message = format!(
                    "Handler '{}' timed out after {}s",
                    self.handler,
                    self.limits.timeout.as_secs()
                );
                tracing::warn!(plugin_id = %plugin_id, handler = %self.handler, "Plugin handler timed out");
                gate.record_error(PluginError::new(PluginErrorCode::Timeout, message.clone()));
                guard_response(
                    StatusCode::GATEWAY_TIMEOUT,
                    PluginErrorCode::Timeout.as_str(),
                    plugin_id,
                    message,
                )
            }
        }
    }

    fn handler_panicked(&self, detail: String) -> Response {
        let plugin_id = self.gate.plugin_id();
        tracing::error!(plugin_id = %plugin_id, handler = %self.handler, panic = %detail, "Plugin handler panicked");
        self.gate.record_error(
            PluginError::new(
                PluginErrorCode::Internal,
                format!("handler '{}' panicked", self.handler),
            )
            .with_details(detail),
        );
        guard_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            PluginErrorCode::Internal.as_str(),
            plugin_id,
            format!("Plugin '{}' failed to handle the request", plugin_id),
        )
    }
}

fn guard_response(status: StatusCode, code: &str, plugin_id: &str, message: String) -> Response {
    (
        status,
        Json(json!({
            "error": message,
            "code": code,
            "plugin_id": plugin_id,
        })),
    )
        .into_response()
}

async fn no_route() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": "No plugin route matches this path",
            "code": "NOT_FOUND",
        })),
    )
        .into_response()
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
