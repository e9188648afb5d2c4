//! Plugin runtime
//!
//! Contract, validation, lifecycle, routing and health supervision of
//! compiled-in plugins.

pub mod binder;
pub mod contract;
pub mod health;
pub mod lifecycle;
pub mod manager;
pub mod registry;
pub mod types;
pub mod validator;

pub use binder::{resolve_route_path, PluginGate, RouteBinder, PLUGIN_ROUTE_PREFIX};
pub use contract::{handler, CallerCapabilities, Plugin, PluginCatalog, PluginFactory, PluginHandler};
pub use health::{HealthOutcome, HealthSupervisor};
pub use manager::{
    InstallOptions, PluginDetails, PluginEvent, PluginManager, RestoreReport, UnregisterOutcome,
};
pub use registry::{FileRegistry, PluginRegistry, RegistryEntry};
pub use types::*;
