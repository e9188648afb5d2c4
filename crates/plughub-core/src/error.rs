//! Error taxonomy for the plugin runtime and artifact distribution

use thiserror::Error;

use crate::plugins::types::{LifecycleState, PluginErrorCode};

/// Errors surfaced by the plugin manager, registry and route binder.
///
/// Every variant is scoped to a single plugin; none of them is fatal to the host.
#[derive(Debug, Clone, Error)]
pub enum PluginSystemError {
    #[error("invalid plugin '{plugin_id}': {message}")]
    Validation { plugin_id: String, message: String },

    #[error("plugin '{plugin_id}' declares unsupported permissions: {message}")]
    Permission { plugin_id: String, message: String },

    #[error("{message} (conflicting plugins: '{existing}' and '{incoming}')")]
    Collision {
        existing: String,
        incoming: String,
        message: String,
    },

    #[error("plugin '{plugin_id}' failed to initialize: {message}")]
    Initialization { plugin_id: String, message: String },

    #[error("health check for plugin '{plugin_id}' timed out after {timeout_ms}ms")]
    HealthCheckTimeout { plugin_id: String, timeout_ms: u64 },

    #[error("route binding failed for plugin '{plugin_id}': {message}")]
    Routing { plugin_id: String, message: String },

    #[error("plugin '{0}' not found")]
    NotFound(String),

    #[error("plugin '{plugin_id}' cannot move from {from} to {to}")]
    InvalidState {
        plugin_id: String,
        from: LifecycleState,
        to: LifecycleState,
    },

    #[error("plugin '{plugin_id}' is unavailable: {message}")]
    Unavailable { plugin_id: String, message: String },

    #[error("registry storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Distribution(#[from] DistributionError),
}

impl PluginSystemError {
    pub fn validation(plugin_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            plugin_id: plugin_id.into(),
            message: message.into(),
        }
    }

    pub fn routing(plugin_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Routing {
            plugin_id: plugin_id.into(),
            message: message.into(),
        }
    }

    pub fn initialization(plugin_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Initialization {
            plugin_id: plugin_id.into(),
            message: message.into(),
        }
    }

    /// Wrap a storage failure, keeping the whole context chain in the message.
    pub fn storage(err: anyhow::Error) -> Self {
        Self::Storage(format!("{:#}", err))
    }

    /// Structured error code used in `PluginError` records and API responses.
    pub fn code(&self) -> PluginErrorCode {
        match self {
            Self::Validation { .. } => PluginErrorCode::InvalidMetadata,
            Self::Permission { .. } => PluginErrorCode::PermissionDenied,
            Self::Collision { .. } => PluginErrorCode::RouteCollision,
            Self::Initialization { .. } => PluginErrorCode::InitFailed,
            Self::HealthCheckTimeout { .. } => PluginErrorCode::Timeout,
            Self::Routing { .. } => PluginErrorCode::LoadFailed,
            Self::NotFound(_) => PluginErrorCode::NotFound,
            Self::InvalidState { .. } | Self::Unavailable { .. } => PluginErrorCode::LoadFailed,
            Self::Storage(_) | Self::Distribution(_) => PluginErrorCode::Internal,
        }
    }
}

/// Errors from the artifact distribution backends.
///
/// Mutating operations run in a throwaway workspace, so any of these leaves
/// the backing store untouched unless the final push already landed.
#[derive(Debug, Clone, Error)]
pub enum DistributionError {
    #[error("invalid artifact key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("failed to clone artifact repository: {0}")]
    Clone(String),

    #[error("failed to write artifact '{key}': {message}")]
    Write { key: String, message: String },

    #[error("failed to commit artifact change: {0}")]
    Commit(String),

    #[error("failed to push artifact change: {0}")]
    Push(String),

    #[error("concurrent change to artifact '{key}' was pushed first; retry the operation")]
    PushConflict { key: String },

    #[error("failed to delete artifact '{key}': {message}")]
    Delete { key: String, message: String },

    #[error("artifact '{0}' not found")]
    NotFound(String),

    #[error("artifact storage I/O error: {0}")]
    Io(String),

    #[error("{operation} timed out after {secs}s")]
    Timeout { operation: String, secs: u64 },

    #[error("invalid distribution config: {0}")]
    Config(String),

    #[error("invalid plugin archive: {0}")]
    InvalidArchive(String),
}

impl DistributionError {
    pub fn invalid_key(key: &str, reason: impl Into<String>) -> Self {
        Self::InvalidKey {
            key: key.to_string(),
            reason: reason.into(),
        }
    }

    /// True when the failure came from key validation, before any I/O.
    pub fn is_invalid_key(&self) -> bool {
        matches!(self, Self::InvalidKey { .. })
    }
}
