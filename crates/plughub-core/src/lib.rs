//! PlugHub Core
//!
//! Plugin runtime and distribution subsystem:
//! - Plugin contract and catalog of compiled-in plugins
//! - Persistent registry (SQLite or file backed)
//! - Plugin manager with an explicit lifecycle state machine
//! - Route binder that mounts plugin endpoints behind a per-request guard
//! - Health supervisor
//! - Git-backed artifact distribution for the marketplace

pub mod config;
pub mod distribution;
pub mod error;
pub mod paths;
pub mod plugins;
pub mod storage;

pub use config::{PluginSystemConfig, RegistryBackend};
pub use error::{DistributionError, PluginSystemError};
pub use plugins::{PluginCatalog, PluginManager};

/// Version of the host runtime, checked against plugin compatibility ranges.
pub const HOST_VERSION: &str = env!("CARGO_PKG_VERSION");
