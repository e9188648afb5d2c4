//! Capability interface every plugin implements, plus the compiled-in catalog.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use axum::extract::Request;
use axum::http::request::Parts;
use axum::response::Response;
use futures::future::BoxFuture;

use super::types::{PluginConfig, PluginError, PluginErrorCode, PluginMetadata, PluginStatus};

/// Request handler contributed by a plugin.
///
/// Called concurrently from many request tasks once `initialize` succeeded.
pub type PluginHandler = Arc<dyn Fn(Request) -> BoxFuture<'static, Response> + Send + Sync>;

/// Wrap an async function as a `PluginHandler`.
pub fn handler<F, Fut>(f: F) -> PluginHandler
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send + 'static,
{
    Arc::new(move |request| Box::pin(f(request)))
}

/// Capabilities held by the caller of a request.
///
/// Inserted into request extensions by the host's auth layer. When absent the
/// host runs in single-tenant mode and endpoint permissions are not enforced.
#[derive(Debug, Clone, Default)]
pub struct CallerCapabilities(pub Vec<String>);

impl CallerCapabilities {
    pub fn allows(&self, capability: &str) -> bool {
        self.0.iter().any(|held| held == capability || held == "admin.all")
    }
}

#[async_trait]
pub trait Plugin: Send + Sync {
    /// Pure, side-effect free description of the plugin.
    fn metadata(&self) -> PluginMetadata;

    /// Called once before the plugin accepts traffic.
    async fn initialize(&self, config: &PluginConfig) -> Result<()>;

    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }

    /// Handler map keyed by the names declared in `metadata().endpoints`.
    fn handlers(&self) -> HashMap<String, PluginHandler>;

    /// Static self-check run before `initialize`.
    fn validate(&self) -> Result<()> {
        Ok(())
    }

    /// Cheap liveness check. May be called concurrently.
    async fn health(&self) -> Result<()> {
        Ok(())
    }

    /// Plugin-reported status. The manager overlays lifecycle, health and counters.
    fn status(&self) -> PluginStatus {
        PluginStatus::default()
    }

    fn handle_error(&self, err: &anyhow::Error) -> PluginError {
        PluginError::new(PluginErrorCode::Internal, err.to_string())
    }

    async fn on_config_change(&self, _config: &PluginConfig) -> Result<()> {
        Ok(())
    }

    fn metrics(&self) -> HashMap<String, serde_json::Value> {
        HashMap::new()
    }

    fn permissions(&self) -> Vec<String> {
        self.metadata().permissions
    }

    /// Per-request hook to reject requests exceeding the plugin's capability set.
    fn validate_request(&self, _parts: &Parts) -> Result<()> {
        Ok(())
    }

    async fn on_load(&self) -> Result<()> {
        Ok(())
    }

    async fn on_unload(&self) -> Result<()> {
        Ok(())
    }
}

pub type PluginFactory = Arc<dyn Fn() -> Arc<dyn Plugin> + Send + Sync>;

/// Plugins the host knows how to construct, keyed by plugin id.
///
/// Composed explicitly at startup and handed to the manager, which uses it to
/// instantiate persisted plugins after a restart.
#[derive(Clone, Default)]
pub struct PluginCatalog {
    factories: BTreeMap<String, PluginFactory>,
}

impl PluginCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, plugin_id: &str, factory: F) -> &mut Self
    where
        F: Fn() -> Arc<dyn Plugin> + Send + Sync + 'static,
    {
        self.factories
            .insert(plugin_id.to_string(), Arc::new(factory));
        self
    }

    pub fn with<F>(mut self, plugin_id: &str, factory: F) -> Self
    where
        F: Fn() -> Arc<dyn Plugin> + Send + Sync + 'static,
    {
        self.register(plugin_id, factory);
        self
    }

    pub fn contains(&self, plugin_id: &str) -> bool {
        self.factories.contains_key(plugin_id)
    }

    pub fn instantiate(&self, plugin_id: &str) -> Option<Arc<dyn Plugin>> {
        self.factories.get(plugin_id).map(|factory| factory())
    }

    pub fn ids(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl std::fmt::Debug for PluginCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginCatalog")
            .field("plugins", &self.ids())
            .finish()
    }
}
