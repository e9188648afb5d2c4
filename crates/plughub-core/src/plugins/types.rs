use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Configuration table handed to `Plugin::initialize` and `Plugin::on_config_change`.
pub type PluginConfig = serde_json::Map<String, serde_json::Value>;

fn default_true() -> bool {
    true
}

/// Identity and declared surface of a packaged plugin version.
///
/// Immutable once packaged; keyed by `(id, version)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginMetadata {
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    pub author: String,
    #[serde(default)]
    pub license: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub homepage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_host_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_host_version: Option<String>,
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<PluginDependency>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_schema: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl PluginMetadata {
    /// Minimal metadata, mostly useful for compiled-in plugins and tests.
    pub fn new(id: &str, name: &str, version: &str, author: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            version: version.to_string(),
            description: String::new(),
            author: author.to_string(),
            license: String::new(),
            homepage: None,
            repository: None,
            tags: Vec::new(),
            min_host_version: None,
            max_host_version: None,
            endpoints: Vec::new(),
            permissions: Vec::new(),
            dependencies: Vec::new(),
            config_schema: None,
            build_time: None,
            checksum: None,
        }
    }

    pub fn with_endpoint(mut self, method: &str, path: &str, handler: &str) -> Self {
        self.endpoints.push(EndpointConfig::new(method, path, handler));
        self
    }

    pub fn with_permission(mut self, permission: &str) -> Self {
        self.permissions.push(permission.to_string());
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }
}

/// A declared `(method, path, handler)` triple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub method: String,
    pub path: String,
    pub handler: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub auth_required: bool,
    /// Capabilities a caller must hold to reach this endpoint.
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Requests per minute, informational.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<u32>,
}

impl EndpointConfig {
    pub fn new(method: &str, path: &str, handler: &str) -> Self {
        Self {
            method: method.to_string(),
            path: path.to_string(),
            handler: handler.to_string(),
            description: String::new(),
            auth_required: false,
            permissions: Vec::new(),
            rate_limit: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginDependency {
    pub name: String,
    /// Semver requirement, e.g. `^1.2`.
    pub version: String,
    #[serde(default = "default_true")]
    pub required: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstallMethod {
    #[default]
    Manual,
    Marketplace,
}

impl InstallMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Marketplace => "marketplace",
        }
    }
}

impl std::str::FromStr for InstallMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(Self::Manual),
            "marketplace" => Ok(Self::Marketplace),
            other => Err(format!("unknown install method: {}", other)),
        }
    }
}

/// Per-plugin lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Unloaded,
    Validating,
    Loaded,
    Enabled,
    Disabled,
    Unloading,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unloaded => "unloaded",
            Self::Validating => "validating",
            Self::Loaded => "loaded",
            Self::Enabled => "enabled",
            Self::Disabled => "disabled",
            Self::Unloading => "unloading",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LifecycleState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unloaded" => Ok(Self::Unloaded),
            "validating" => Ok(Self::Validating),
            "loaded" => Ok(Self::Loaded),
            "enabled" => Ok(Self::Enabled),
            "disabled" => Ok(Self::Disabled),
            "unloading" => Ok(Self::Unloading),
            other => Err(format!("unknown lifecycle state: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Unhealthy,
    Degraded,
    #[default]
    Unknown,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::Degraded => "degraded",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PluginErrorCode {
    #[serde(rename = "PLUGIN_NOT_FOUND")]
    NotFound,
    #[serde(rename = "PLUGIN_ALREADY_EXISTS")]
    AlreadyExists,
    #[serde(rename = "PLUGIN_INVALID_METADATA")]
    InvalidMetadata,
    #[serde(rename = "PLUGIN_LOAD_FAILED")]
    LoadFailed,
    #[serde(rename = "PLUGIN_INIT_FAILED")]
    InitFailed,
    #[serde(rename = "PLUGIN_DEPENDENCY_MISSING")]
    DependencyMissing,
    #[serde(rename = "PLUGIN_PERMISSION_DENIED")]
    PermissionDenied,
    #[serde(rename = "PLUGIN_HEALTH_CHECK_FAILED")]
    HealthCheckFailed,
    #[serde(rename = "PLUGIN_TIMEOUT")]
    Timeout,
    #[serde(rename = "PLUGIN_INTERNAL_ERROR")]
    Internal,
    #[serde(rename = "PLUGIN_CONFIG_INVALID")]
    ConfigInvalid,
    #[serde(rename = "PLUGIN_ROUTE_COLLISION")]
    RouteCollision,
}

impl PluginErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "PLUGIN_NOT_FOUND",
            Self::AlreadyExists => "PLUGIN_ALREADY_EXISTS",
            Self::InvalidMetadata => "PLUGIN_INVALID_METADATA",
            Self::LoadFailed => "PLUGIN_LOAD_FAILED",
            Self::InitFailed => "PLUGIN_INIT_FAILED",
            Self::DependencyMissing => "PLUGIN_DEPENDENCY_MISSING",
            Self::PermissionDenied => "PLUGIN_PERMISSION_DENIED",
            Self::HealthCheckFailed => "PLUGIN_HEALTH_CHECK_FAILED",
            Self::Timeout => "PLUGIN_TIMEOUT",
            Self::Internal => "PLUGIN_INTERNAL_ERROR",
            Self::ConfigInvalid => "PLUGIN_CONFIG_INVALID",
            Self::RouteCollision => "PLUGIN_ROUTE_COLLISION",
        }
    }
}

impl fmt::Display for PluginErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured error record kept in a plugin's error history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginError {
    pub code: PluginErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl PluginError {
    pub fn new(code: PluginErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginStatus {
    pub state: LifecycleState,
    pub health: HealthState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_check: Option<DateTime<Utc>>,
    pub request_count: u64,
    pub error_count: u64,
    /// Most recent errors, newest last.
    #[serde(default)]
    pub last_errors: Vec<PluginError>,
    pub uptime_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_time_ms: Option<u64>,
    /// Plugin-reported memory usage in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_usage: Option<u64>,
}

impl Default for PluginStatus {
    fn default() -> Self {
        Self {
            state: LifecycleState::Unloaded,
            health: HealthState::Unknown,
            last_check: None,
            request_count: 0,
            error_count: 0,
            last_errors: Vec::new(),
            uptime_secs: 0,
            load_time_ms: None,
            memory_usage: None,
        }
    }
}

/// A plugin installation owned by the manager; one row per installation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstalledPlugin {
    pub metadata: PluginMetadata,
    #[serde(default)]
    pub install_method: InstallMethod,
    pub enabled: bool,
    pub status: LifecycleState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_time_ms: Option<u64>,
    #[serde(default)]
    pub config: PluginConfig,
    pub installed_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InstalledPlugin {
    pub fn id(&self) -> &str {
        &self.metadata.id
    }
}

/// Denormalized route record used to rebuild routing without running plugin code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginRoute {
    pub plugin_id: String,
    pub method: String,
    /// Fully resolved path, including the `/api/plugins` prefix.
    pub path: String,
    pub handler: String,
    #[serde(default)]
    pub permissions: Vec<String>,
}

/// Publish-facing catalog record; a view over `PluginMetadata`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketplacePlugin {
    pub plugin_id: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    pub author: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(default)]
    pub featured: bool,
    #[serde(default)]
    pub verified: bool,
    #[serde(default)]
    pub price: f64,
    #[serde(default)]
    pub rating: f64,
    #[serde(default)]
    pub downloads: u64,
    #[serde(default)]
    pub installs: u64,
    pub updated_at: DateTime<Utc>,
}

impl MarketplacePlugin {
    pub fn from_metadata(metadata: &PluginMetadata) -> Self {
        Self {
            plugin_id: metadata.id.clone(),
            name: metadata.name.clone(),
            version: metadata.version.clone(),
            description: metadata.description.clone(),
            author: metadata.author.clone(),
            artifact_key: None,
            download_url: None,
            featured: false,
            verified: false,
            price: 0.0,
            rating: 0.0,
            downloads: 0,
            installs: 0,
            updated_at: Utc::now(),
        }
    }
}

/// Aggregate counters across every known plugin.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PluginSystemMetrics {
    pub total_plugins: usize,
    pub enabled_plugins: usize,
    pub loaded_plugins: usize,
    pub healthy_plugins: usize,
    pub unhealthy_plugins: usize,
    pub total_requests: u64,
    pub total_errors: u64,
}
