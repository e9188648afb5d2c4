//! Plugins compiled into the server.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Result};
use async_trait::async_trait;
use axum::{
    body::to_bytes,
    extract::Request,
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde_json::{json, Value};
use tokio::sync::RwLock;

use plughub_core::plugins::{
    handler, EndpointConfig, Plugin, PluginCatalog, PluginConfig, PluginHandler, PluginMetadata,
};

const MAX_ECHO_BODY: usize = 64 * 1024;

/// Catalog of every built-in plugin.
pub fn catalog() -> PluginCatalog {
    PluginCatalog::new()
        .with(EchoPlugin::ID, || Arc::new(EchoPlugin::default()))
        .with(ClusterInfoPlugin::ID, || Arc::new(ClusterInfoPlugin::new()))
}

/// Echoes requests back; handy for checking routing end to end.
#[derive(Default)]
pub struct EchoPlugin {
    greeting: Arc<RwLock<String>>,
}

impl EchoPlugin {
    pub const ID: &'static str = "echo";
}

#[async_trait]
impl Plugin for EchoPlugin {
    fn metadata(&self) -> PluginMetadata {
        PluginMetadata::new(Self::ID, "Echo", env!("CARGO_PKG_VERSION"), "PlugHub")
            .with_description("Echoes request payloads back to the caller")
            .with_endpoint("GET", "/ping", "ping")
            .with_endpoint("POST", "/echo", "echo")
    }

    async fn initialize(&self, config: &PluginConfig) -> Result<()> {
        self.on_config_change(config).await
    }

    fn handlers(&self) -> HashMap<String, PluginHandler> {
        let greeting = self.greeting.clone();
        let ping = handler(move |_request: Request| {
            let greeting = greeting.clone();
            async move {
                let greeting = greeting.read().await.clone();
                Json(json!({ "pong": true, "greeting": greeting })).into_response()
            }
        });

        let echo = handler(|request: Request| async move {
            let headers = request.headers().clone();
            match to_bytes(request.into_body(), MAX_ECHO_BODY).await {
                Ok(body) => {
                    let payload = serde_json::from_slice::<Value>(&body)
                        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&body).into_owned()));
                    let content_type = headers
                        .get(axum::http::header::CONTENT_TYPE)
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                    Json(json!({ "echo": payload, "content_type": content_type })).into_response()
                }
                Err(_) => (
                    StatusCode::PAYLOAD_TOO_LARGE,
                    Json(json!({ "error": "body too large" })),
                )
                    .into_response(),
            }
        });

        HashMap::from([("ping".to_string(), ping), ("echo".to_string(), echo)])
    }

    async fn on_config_change(&self, config: &PluginConfig) -> Result<()> {
        let greeting = match config.get("greeting") {
            None => "hello".to_string(),
            Some(Value::String(s)) => s.clone(),
            Some(other) => bail!("greeting must be a string, got {}", other),
        };
        *self.greeting.write().await = greeting;
        Ok(())
    }
}

/// Read-only cluster summary scoped by the `cluster.read` capability.
pub struct ClusterInfoPlugin {
    started: Instant,
    cluster_name: Arc<RwLock<String>>,
    served: Arc<AtomicU64>,
}

impl ClusterInfoPlugin {
    pub const ID: &'static str = "cluster-info";

    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            cluster_name: Arc::new(RwLock::new("local".to_string())),
            served: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl Default for ClusterInfoPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Plugin for ClusterInfoPlugin {
    fn metadata(&self) -> PluginMetadata {
        let mut summary = EndpointConfig::new("GET", "/summary", "summary");
        summary.description = "Cluster name and plugin uptime".to_string();
        summary.permissions = vec!["cluster.read".to_string()];

        let mut metadata = PluginMetadata::new(
            Self::ID,
            "Cluster Info",
            env!("CARGO_PKG_VERSION"),
            "PlugHub",
        )
        .with_description("Summarizes the cluster this host manages")
        .with_permission("cluster.read");
        metadata.tags = vec!["cluster".to_string(), "read-only".to_string()];
        metadata.endpoints.push(summary);
        metadata
    }

    async fn initialize(&self, config: &PluginConfig) -> Result<()> {
        if let Some(name) = config.get("cluster_name") {
            let Some(name) = name.as_str() else {
                bail!("cluster_name must be a string");
            };
            *self.cluster_name.write().await = name.to_string();
        }
        Ok(())
    }

    fn handlers(&self) -> HashMap<String, PluginHandler> {
        let cluster_name = self.cluster_name.clone();
        let served = self.served.clone();
        let started = self.started;

        let summary = handler(move |_request: Request| {
            let cluster_name = cluster_name.clone();
            let served = served.clone();
            async move {
                served.fetch_add(1, Ordering::Relaxed);
                let cluster = cluster_name.read().await.clone();
                Json(json!({
                    "cluster": cluster,
                    "uptime_secs": started.elapsed().as_secs(),
                }))
                .into_response()
            }
        });

        HashMap::from([("summary".to_string(), summary)])
    }

    fn metrics(&self) -> HashMap<String, Value> {
        HashMap::from([(
            "summaries_served".to_string(),
            json!(self.served.load(Ordering::Relaxed)),
        )])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plughub_core::plugins::validator::validate_metadata;

    #[test]
    fn builtin_metadata_is_valid() {
        let host = semver::Version::parse(plughub_core::HOST_VERSION).expect("host version");
        for id in catalog().ids() {
            let plugin = catalog().instantiate(&id).expect("instantiate");
            validate_metadata(&plugin.metadata(), &host).expect("valid metadata");
        }
    }

    #[tokio::test]
    async fn echo_rejects_non_string_greeting() {
        let plugin = EchoPlugin::default();
        let config: PluginConfig =
            serde_json::from_value(json!({ "greeting": 42 })).expect("config");
        assert!(plugin.initialize(&config).await.is_err());
    }
}
