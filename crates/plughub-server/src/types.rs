//! Request/response types for the HTTP API

use serde::{Deserialize, Serialize};

use plughub_core::plugins::{HealthState, InstalledPlugin, LifecycleState, PluginRoute};

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub plugins: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RouteSummary {
    pub method: String,
    pub path: String,
}

impl From<&PluginRoute> for RouteSummary {
    fn from(route: &PluginRoute) -> Self {
        Self {
            method: route.method.clone(),
            path: route.path.clone(),
        }
    }
}

/// One row of the plugin list.
#[derive(Debug, Serialize, Deserialize)]
pub struct PluginSummary {
    pub id: String,
    pub name: String,
    pub version: String,
    pub description: String,
    pub enabled: bool,
    pub state: LifecycleState,
    pub health: HealthState,
    pub routes: Vec<RouteSummary>,
}

impl PluginSummary {
    pub fn new(plugin: InstalledPlugin, health: HealthState, routes: &[PluginRoute]) -> Self {
        Self {
            id: plugin.metadata.id,
            name: plugin.metadata.name,
            version: plugin.metadata.version,
            description: plugin.metadata.description,
            enabled: plugin.enabled,
            state: plugin.status,
            health,
            routes: routes.iter().map(RouteSummary::from).collect(),
        }
    }
}

#[derive(Serialize)]
pub struct HealthCheckResponse {
    pub plugin_id: String,
    pub health: HealthState,
}

#[derive(Serialize)]
pub struct ArtifactUrlResponse {
    pub key: String,
    pub url: String,
}

#[derive(Deserialize)]
pub struct RatingRequest {
    pub rating: f64,
}
