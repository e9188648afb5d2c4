use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::FutureExt;
use parking_lot::RwLock;
use semver::Version;
use serde::Serialize;
use tokio::sync::{broadcast, Mutex};

use super::binder::{resolve_route_path, LivePlugin, PluginGate, RouteBinder};
use super::contract::{Plugin, PluginCatalog, PluginHandler};
use super::health::{describe, HealthOutcome, HealthRecord, HealthTransition};
use super::lifecycle::transition;
use super::registry::{PluginRegistry, RegistryEntry};
use super::types::{
    HealthState, InstallMethod, InstalledPlugin, LifecycleState, PluginConfig, PluginError,
    PluginErrorCode, PluginMetadata, PluginRoute, PluginStatus, PluginSystemMetrics,
};
use super::validator;
use crate::config::PluginSystemConfig;
use crate::error::PluginSystemError;
use crate::HOST_VERSION;

const STATUS_ERROR_LIMIT: usize = 5;
const EVENT_CAPACITY: usize = 256;

/// Lifecycle notifications for operators and host tooling.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PluginEvent {
    Registered {
        plugin_id: String,
        version: String,
    },
    Enabled {
        plugin_id: String,
    },
    Disabled {
        plugin_id: String,
    },
    Unregistered {
        plugin_id: String,
        cleanup_error: Option<String>,
    },
    BecameUnhealthy {
        plugin_id: String,
        consecutive_failures: u32,
        last_error: Option<String>,
    },
    Recovered {
        plugin_id: String,
    },
    Error {
        plugin_id: String,
        error: PluginError,
    },
}

#[derive(Debug, Clone, Default)]
pub struct InstallOptions {
    pub install_method: InstallMethod,
    pub install_path: Option<PathBuf>,
    /// Overrides the configured and persisted plugin config.
    pub config: Option<PluginConfig>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnregisterOutcome {
    pub plugin_id: String,
    /// Failure from `on_unload`/`cleanup`; reported, not fatal.
    pub cleanup_error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RestoreReport {
    /// Entries whose routes were rebound from the registry.
    pub restored: Vec<String>,
    /// Restored entries instantiated from the catalog.
    pub loaded: Vec<String>,
    /// Catalog plugins installed for the first time.
    pub installed: Vec<String>,
    pub failed: Vec<(String, String)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PluginDetails {
    pub plugin: InstalledPlugin,
    pub status: PluginStatus,
    pub routes: Vec<PluginRoute>,
    pub permissions: Vec<String>,
    pub metrics: HashMap<String, serde_json::Value>,
}

struct PluginSlot {
    installed: InstalledPlugin,
    state: LifecycleState,
    gate: Arc<PluginGate>,
    routes: Vec<PluginRoute>,
    health: HealthRecord,
    loaded_at: Option<Instant>,
}

impl PluginSlot {
    fn snapshot(&self) -> InstalledPlugin {
        let mut installed = self.installed.clone();
        installed.enabled = self.gate.is_enabled();
        installed.status = self.state;
        installed
    }
}

/// Previous slot of a plugin that is registered again (restored, not yet loaded).
struct PriorSlot {
    installed: InstalledPlugin,
    gate: Arc<PluginGate>,
    routes: Vec<PluginRoute>,
}

struct Prepared {
    routes: Vec<PluginRoute>,
    handlers: HashMap<String, PluginHandler>,
    config: PluginConfig,
}

/// Process-wide authority over plugin lifecycle.
///
/// Lifecycle mutations are serialized by `lifecycle`; request-path reads only
/// touch the per-plugin gates held by the route binder.
pub struct PluginManager {
    config: PluginSystemConfig,
    registry: Arc<dyn PluginRegistry>,
    catalog: PluginCatalog,
    binder: Arc<RouteBinder>,
    slots: RwLock<HashMap<String, PluginSlot>>,
    lifecycle: Mutex<()>,
    events: broadcast::Sender<PluginEvent>,
    host_version: Version,
}

impl PluginManager {
    pub fn new(
        config: PluginSystemConfig,
        registry: Arc<dyn PluginRegistry>,
        catalog: PluginCatalog,
    ) -> Self {
        let binder = Arc::new(RouteBinder::new(
            config.max_concurrent_calls,
            config.plugin_timeout(),
        ));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let host_version = Version::parse(HOST_VERSION).unwrap_or_else(|_| Version::new(0, 0, 0));

        Self {
            config,
            registry,
            catalog,
            binder,
            slots: RwLock::new(HashMap::new()),
            lifecycle: Mutex::new(()),
            events,
            host_version,
        }
    }

    pub fn with_host_version(mut self, version: Version) -> Self {
        self.host_version = version;
        self
    }

    pub fn config(&self) -> &PluginSystemConfig {
        &self.config
    }

    pub fn host_version(&self) -> &Version {
        &self.host_version
    }

    pub fn catalog(&self) -> &PluginCatalog {
        &self.catalog
    }

    pub fn binder(&self) -> Arc<RouteBinder> {
        self.binder.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PluginEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: PluginEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Register a manually installed plugin.
    pub async fn register(&self, plugin: Arc<dyn Plugin>) -> Result<(), PluginSystemError> {
        self.install(plugin, InstallOptions::default()).await
    }

    pub async fn install(
        &self,
        plugin: Arc<dyn Plugin>,
        options: InstallOptions,
    ) -> Result<(), PluginSystemError> {
        let _guard = self.lifecycle.lock().await;
        self.load_locked(plugin, options, None).await
    }

    /// Validate, initialize and bind a plugin. Caller holds the lifecycle lock.
    ///
    /// `enable` overrides the enabled flag carried over from a restored entry. The
    /// flag is persisted and the gate opened only once every load step succeeded.
    async fn load_locked(
        &self,
        plugin: Arc<dyn Plugin>,
        options: InstallOptions,
        enable: Option<bool>,
    ) -> Result<(), PluginSystemError> {
        let started = Instant::now();
        let metadata = guarded(|| plugin.metadata()).map_err(|panic| {
            PluginSystemError::validation("<unknown>", format!("metadata() panicked: {}", panic))
        })?;
        let plugin_id = metadata.id.clone();

        let prior = {
            let slots = self.slots.read();
            match slots.get(&plugin_id) {
                Some(slot) if slot.state == LifecycleState::Unloaded => Some(PriorSlot {
                    installed: slot.installed.clone(),
                    gate: slot.gate.clone(),
                    routes: slot.routes.clone(),
                }),
                Some(slot) => {
                    return Err(PluginSystemError::Collision {
                        existing: plugin_id.clone(),
                        incoming: plugin_id.clone(),
                        message: format!(
                            "plugin id '{}' is already registered (version {})",
                            plugin_id, slot.installed.metadata.version
                        ),
                    });
                }
                None => None,
            }
        };

        transition(&plugin_id, LifecycleState::Unloaded, LifecycleState::Validating)?;

        let prepared = match self
            .prepare(&plugin, &metadata, &options, prior.as_ref())
            .await
        {
            Ok(prepared) => prepared,
            Err(err) => {
                transition(&plugin_id, LifecycleState::Validating, LifecycleState::Unloaded)?;
                self.report_failure(&plugin_id, &err);
                return Err(err);
            }
        };
        transition(&plugin_id, LifecycleState::Validating, LifecycleState::Loaded)?;

        let enabled =
            enable.unwrap_or_else(|| prior.as_ref().map_or(true, |p| p.installed.enabled));
        let gate = match &prior {
            Some(prior) => prior.gate.clone(),
            None => PluginGate::new(&plugin_id, enabled),
        };

        if let Err(err) = self.binder.bind(gate.clone(), prepared.routes.clone()) {
            self.abort_load(&plugin, &plugin_id).await;
            self.report_failure(&plugin_id, &err);
            return Err(err);
        }

        if let Err(message) = self.bounded("on_load", plugin.on_load()).await {
            self.rollback_binding(&plugin_id, prior.as_ref());
            self.abort_load(&plugin, &plugin_id).await;
            let err = PluginSystemError::initialization(&plugin_id, message);
            self.report_failure(&plugin_id, &err);
            return Err(err);
        }

        let final_state = if enabled {
            LifecycleState::Enabled
        } else {
            LifecycleState::Disabled
        };
        let now = Utc::now();
        let installed = InstalledPlugin {
            metadata: metadata.clone(),
            install_method: prior
                .as_ref()
                .map_or(options.install_method, |p| p.installed.install_method),
            enabled,
            status: final_state,
            install_path: options
                .install_path
                .clone()
                .or_else(|| prior.as_ref().and_then(|p| p.installed.install_path.clone())),
            load_time_ms: Some(started.elapsed().as_millis() as u64),
            config: prepared.config.clone(),
            installed_at: prior.as_ref().map_or(now, |p| p.installed.installed_at),
            updated_at: now,
        };

        let entry = RegistryEntry {
            plugin: installed.clone(),
            routes: prepared.routes.clone(),
        };
        if let Err(err) = self.registry.persist(&entry) {
            self.rollback_binding(&plugin_id, prior.as_ref());
            self.abort_load(&plugin, &plugin_id).await;
            let err = PluginSystemError::storage(err);
            self.report_failure(&plugin_id, &err);
            return Err(err);
        }

        gate.set_enabled(enabled);
        gate.attach(Arc::new(LivePlugin {
            plugin: plugin.clone(),
            handlers: prepared.handlers,
        }));
        let state = transition(&plugin_id, LifecycleState::Loaded, final_state)?;

        let previous_health = self
            .slots
            .read()
            .get(&plugin_id)
            .map(|slot| slot.health.clone())
            .unwrap_or_default();
        self.slots.write().insert(
            plugin_id.clone(),
            PluginSlot {
                installed,
                state,
                gate,
                routes: prepared.routes,
                health: previous_health,
                loaded_at: Some(Instant::now()),
            },
        );

        tracing::info!(
            plugin_id = %plugin_id,
            version = %metadata.version,
            enabled,
            load_time_ms = started.elapsed().as_millis() as u64,
            "Plugin registered"
        );
        self.emit(PluginEvent::Registered {
            plugin_id,
            version: metadata.version,
        });
        Ok(())
    }

    /// Everything that happens in the `Validating` state, ending with `initialize`.
    async fn prepare(
        &self,
        plugin: &Arc<dyn Plugin>,
        metadata: &PluginMetadata,
        options: &InstallOptions,
        prior: Option<&PriorSlot>,
    ) -> Result<Prepared, PluginSystemError> {
        let plugin_id = metadata.id.as_str();

        validator::validate_metadata(metadata, &self.host_version)?;

        let registered: Vec<(String, String)> = self
            .slots
            .read()
            .values()
            .filter(|slot| slot.state.is_live())
            .map(|slot| {
                (
                    slot.installed.metadata.id.clone(),
                    slot.installed.metadata.version.clone(),
                )
            })
            .collect();
        validator::check_dependencies(metadata, &registered)?;

        match guarded(|| plugin.validate()) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                return Err(PluginSystemError::validation(
                    plugin_id,
                    format!("self-check failed: {:#}", err),
                ))
            }
            Err(panic) => {
                return Err(PluginSystemError::validation(
                    plugin_id,
                    format!("validate() panicked: {}", panic),
                ))
            }
        }

        let config = options
            .config
            .clone()
            .or_else(|| {
                prior
                    .map(|p| p.installed.config.clone())
                    .filter(|config| !config.is_empty())
            })
            .unwrap_or_else(|| self.config.plugin_config(plugin_id));
        validator::validate_config(plugin_id, &config)?;

        let routes: Vec<PluginRoute> = metadata
            .endpoints
            .iter()
            .map(|endpoint| PluginRoute {
                plugin_id: plugin_id.to_string(),
                method: endpoint.method.to_ascii_uppercase(),
                path: resolve_route_path(plugin_id, &endpoint.path),
                handler: endpoint.handler.clone(),
                permissions: endpoint.permissions.clone(),
            })
            .collect();

        if let Some(conflict) = self.binder.find_conflict(plugin_id, &routes) {
            return Err(PluginSystemError::Collision {
                message: format!(
                    "route {} {} is already registered",
                    conflict.method, conflict.path
                ),
                existing: conflict.existing,
                incoming: plugin_id.to_string(),
            });
        }

        let handlers = guarded(|| plugin.handlers()).map_err(|panic| {
            PluginSystemError::routing(plugin_id, format!("handlers() panicked: {}", panic))
        })?;
        for route in &routes {
            if !handlers.contains_key(&route.handler) {
                return Err(PluginSystemError::routing(
                    plugin_id,
                    format!(
                        "endpoint {} {} references unknown handler '{}'",
                        route.method, route.path, route.handler
                    ),
                ));
            }
        }

        self.bounded("initialize", plugin.initialize(&config))
            .await
            .map_err(|message| PluginSystemError::initialization(plugin_id, message))?;

        Ok(Prepared {
            routes,
            handlers,
            config,
        })
    }

    /// Undo a partially loaded plugin: run cleanup and walk back to `Unloaded`.
    async fn abort_load(&self, plugin: &Arc<dyn Plugin>, plugin_id: &str) {
        if let Err(message) = self.bounded("cleanup", plugin.cleanup()).await {
            tracing::warn!(plugin_id = %plugin_id, error = %message, "Cleanup after failed load failed");
        }
        let _ = transition(plugin_id, LifecycleState::Loaded, LifecycleState::Unloading)
            .and_then(|state| transition(plugin_id, state, LifecycleState::Unloaded));
    }

    fn rollback_binding(&self, plugin_id: &str, prior: Option<&PriorSlot>) {
        match prior {
            Some(prior) => {
                if let Err(err) = self.binder.bind(prior.gate.clone(), prior.routes.clone()) {
                    tracing::error!(plugin_id = %plugin_id, error = %err, "Failed to restore previous routes");
                    self.binder.unbind(plugin_id);
                }
            }
            None => {
                self.binder.unbind(plugin_id);
            }
        }
    }

    fn report_failure(&self, plugin_id: &str, err: &PluginSystemError) {
        tracing::warn!(plugin_id = %plugin_id, error = %err, "Plugin activation failed");
        let error = PluginError::new(err.code(), err.to_string());
        if let Some(slot) = self.slots.read().get(plugin_id) {
            slot.gate.record_error(error.clone());
        }
        self.emit(PluginEvent::Error {
            plugin_id: plugin_id.to_string(),
            error,
        });
    }

    /// Run a plugin hook under the configured timeout, containing panics.
    async fn bounded<F>(&self, hook: &str, fut: F) -> Result<(), String>
    where
        F: Future<Output = anyhow::Result<()>>,
    {
        let timeout = self.config.plugin_timeout();
        match tokio::time::timeout(timeout, AssertUnwindSafe(fut).catch_unwind()).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(err))) => Err(format!("{} failed: {:#}", hook, err)),
            Ok(Err(_)) => Err(format!("{} panicked", hook)),
            Err(_) => Err(format!("{} timed out after {}s", hook, timeout.as_secs())),
        }
    }

    pub async fn enable(&self, plugin_id: &str) -> Result<(), PluginSystemError> {
        let _guard = self.lifecycle.lock().await;
        self.set_enabled_locked(plugin_id, true).await
    }

    pub async fn disable(&self, plugin_id: &str) -> Result<(), PluginSystemError> {
        let _guard = self.lifecycle.lock().await;
        self.set_enabled_locked(plugin_id, false).await
    }

    /// Persist the flag first, then flip the gate and the slot together.
    async fn set_enabled_locked(
        &self,
        plugin_id: &str,
        enabled: bool,
    ) -> Result<(), PluginSystemError> {
        let (state, mut installed, gate) = {
            let slots = self.slots.read();
            let slot = slots
                .get(plugin_id)
                .ok_or_else(|| PluginSystemError::NotFound(plugin_id.to_string()))?;
            (slot.state, slot.installed.clone(), slot.gate.clone())
        };

        if enabled && state == LifecycleState::Unloaded {
            return self.activate_restored(plugin_id, &installed).await;
        }
        if gate.is_enabled() == enabled && state != LifecycleState::Loaded {
            return Ok(());
        }

        let target = if enabled {
            LifecycleState::Enabled
        } else {
            LifecycleState::Disabled
        };
        let next_state = if state.is_live() {
            transition(plugin_id, state, target)?
        } else if state == LifecycleState::Unloaded {
            state
        } else {
            return Err(PluginSystemError::InvalidState {
                plugin_id: plugin_id.to_string(),
                from: state,
                to: target,
            });
        };

        installed.enabled = enabled;
        installed.status = if state.is_live() { next_state } else { target };
        installed.updated_at = Utc::now();
        self.registry
            .update(&installed)
            .map_err(PluginSystemError::storage)?;

        {
            let mut slots = self.slots.write();
            if let Some(slot) = slots.get_mut(plugin_id) {
                slot.installed = installed.clone();
                slot.state = next_state;
                slot.gate.set_enabled(enabled);
            }
        }

        self.announce_enabled(plugin_id, enabled);
        Ok(())
    }

    /// Instantiate a restored entry from the catalog and load it enabled.
    ///
    /// Nothing is persisted and the gate stays as it was when loading fails.
    async fn activate_restored(
        &self,
        plugin_id: &str,
        installed: &InstalledPlugin,
    ) -> Result<(), PluginSystemError> {
        let plugin = self.catalog.instantiate(plugin_id).ok_or_else(|| {
            PluginSystemError::Unavailable {
                plugin_id: plugin_id.to_string(),
                message: "enabled, but no compiled-in implementation is available".to_string(),
            }
        })?;
        self.load_locked(
            plugin,
            InstallOptions {
                install_method: installed.install_method,
                install_path: installed.install_path.clone(),
                config: None,
            },
            Some(true),
        )
        .await?;
        self.announce_enabled(plugin_id, true);
        Ok(())
    }

    fn announce_enabled(&self, plugin_id: &str, enabled: bool) {
        if enabled {
            tracing::info!(plugin_id = %plugin_id, "Plugin enabled");
            self.emit(PluginEvent::Enabled {
                plugin_id: plugin_id.to_string(),
            });
        } else {
            tracing::info!(plugin_id = %plugin_id, "Plugin disabled");
            self.emit(PluginEvent::Disabled {
                plugin_id: plugin_id.to_string(),
            });
        }
    }

    /// Tear down a plugin: close its routes, run `on_unload` and `cleanup`,
    /// then drop its routes and registry entry.
    ///
    /// Hook failures are returned in the outcome; the plugin is removed regardless.
    pub async fn unregister(&self, plugin_id: &str) -> Result<UnregisterOutcome, PluginSystemError> {
        let _guard = self.lifecycle.lock().await;

        let (state, gate) = {
            let slots = self.slots.read();
            let slot = slots
                .get(plugin_id)
                .ok_or_else(|| PluginSystemError::NotFound(plugin_id.to_string()))?;
            (slot.state, slot.gate.clone())
        };

        let live = state.is_live();
        if live {
            let next = transition(plugin_id, state, LifecycleState::Unloading)?;
            if let Some(slot) = self.slots.write().get_mut(plugin_id) {
                slot.state = next;
            }
        }

        gate.set_enabled(false);
        let instance = gate.detach();

        let mut failures = Vec::new();
        if let Some(instance) = instance {
            if let Err(message) = self.bounded("on_unload", instance.plugin.on_unload()).await {
                failures.push(message);
            }
            if let Err(message) = self.bounded("cleanup", instance.plugin.cleanup()).await {
                failures.push(message);
            }
        }

        self.binder.unbind(plugin_id);
        self.slots.write().remove(plugin_id);
        if live {
            transition(plugin_id, LifecycleState::Unloading, LifecycleState::Unloaded)?;
        }

        let cleanup_error = if failures.is_empty() {
            None
        } else {
            Some(failures.join("; "))
        };
        if let Some(message) = &cleanup_error {
            tracing::warn!(plugin_id = %plugin_id, error = %message, "Plugin cleanup failed; removed anyway");
            self.emit(PluginEvent::Error {
                plugin_id: plugin_id.to_string(),
                error: PluginError::new(PluginErrorCode::Internal, message.clone()),
            });
        }

        self.registry
            .delete(plugin_id)
            .map_err(PluginSystemError::storage)?;

        tracing::info!(plugin_id = %plugin_id, "Plugin unregistered");
        self.emit(PluginEvent::Unregistered {
            plugin_id: plugin_id.to_string(),
            cleanup_error: cleanup_error.clone(),
        });

        Ok(UnregisterOutcome {
            plugin_id: plugin_id.to_string(),
            cleanup_error,
        })
    }

    /// Rebind persisted routes, then autoload.
    ///
    /// Routes are bound from registry rows before any plugin code runs: disabled
    /// plugins answer 403 and enabled-but-unloaded ones 503 until loaded.
    pub async fn restore(&self) -> Result<RestoreReport, PluginSystemError> {
        let _guard = self.lifecycle.lock().await;
        let mut report = RestoreReport::default();

        let entries = self.registry.load().map_err(PluginSystemError::storage)?;
        for entry in entries {
            let plugin_id = entry.plugin.id().to_string();
            if self.slots.read().contains_key(&plugin_id) {
                continue;
            }

            let gate = PluginGate::new(&plugin_id, entry.plugin.enabled);
            if let Err(err) = self.binder.bind(gate.clone(), entry.routes.clone()) {
                tracing::error!(plugin_id = %plugin_id, error = %err, "Failed to restore plugin routes");
                report.failed.push((plugin_id, err.to_string()));
                continue;
            }

            self.slots.write().insert(
                plugin_id.clone(),
                PluginSlot {
                    installed: entry.plugin,
                    state: LifecycleState::Unloaded,
                    gate,
                    routes: entry.routes,
                    health: HealthRecord::default(),
                    loaded_at: None,
                },
            );
            report.restored.push(plugin_id);
        }

        if self.config.autoload {
            let enabled_restored: Vec<(String, InstalledPlugin)> = {
                let slots = self.slots.read();
                report
                    .restored
                    .iter()
                    .filter_map(|id| slots.get(id).map(|slot| (id.clone(), slot.installed.clone())))
                    .filter(|(_, installed)| installed.enabled)
                    .collect()
            };

            for (plugin_id, installed) in enabled_restored {
                let Some(plugin) = self.catalog.instantiate(&plugin_id) else {
                    tracing::warn!(plugin_id = %plugin_id, "No implementation for persisted plugin; routes answer 503");
                    continue;
                };
                let options = InstallOptions {
                    install_method: installed.install_method,
                    install_path: installed.install_path,
                    config: None,
                };
                match self.load_locked(plugin, options, None).await {
                    Ok(()) => report.loaded.push(plugin_id),
                    Err(err) => report.failed.push((plugin_id, err.to_string())),
                }
            }

            for plugin_id in self.catalog.ids() {
                if self.slots.read().contains_key(&plugin_id) {
                    continue;
                }
                let Some(plugin) = self.catalog.instantiate(&plugin_id) else {
                    continue;
                };
                match self.load_locked(plugin, InstallOptions::default(), None).await {
                    Ok(()) => report.installed.push(plugin_id),
                    Err(err) => report.failed.push((plugin_id, err.to_string())),
                }
            }
        }

        tracing::info!(
            restored = report.restored.len(),
            loaded = report.loaded.len(),
            installed = report.installed.len(),
            failed = report.failed.len(),
            "Plugin registry restored"
        );
        Ok(report)
    }

    /// Unload every live plugin without touching the registry.
    pub async fn shutdown(&self) {
        let _guard = self.lifecycle.lock().await;

        let live: Vec<(String, LifecycleState, Arc<PluginGate>)> = self
            .slots
            .read()
            .iter()
            .filter(|(_, slot)| slot.state.is_live())
            .map(|(id, slot)| (id.clone(), slot.state, slot.gate.clone()))
            .collect();

        for (plugin_id, state, gate) in live {
            if transition(&plugin_id, state, LifecycleState::Unloading).is_err() {
                continue;
            }
            if let Some(instance) = gate.detach() {
                if let Err(message) = self.bounded("on_unload", instance.plugin.on_unload()).await {
                    tracing::warn!(plugin_id = %plugin_id, error = %message, "on_unload failed during shutdown");
                }
                if let Err(message) = self.bounded("cleanup", instance.plugin.cleanup()).await {
                    tracing::warn!(plugin_id = %plugin_id, error = %message, "cleanup failed during shutdown");
                }
            }
            if let Some(slot) = self.slots.write().get_mut(&plugin_id) {
                slot.state = LifecycleState::Unloaded;
                slot.loaded_at = None;
            }
        }

        tracing::info!("Plugin manager shut down");
    }

    /// Snapshot of every known plugin, sorted by id.
    pub fn get_plugins(&self) -> Vec<InstalledPlugin> {
        let mut plugins: Vec<InstalledPlugin> =
            self.slots.read().values().map(PluginSlot::snapshot).collect();
        plugins.sort_by(|a, b| a.metadata.id.cmp(&b.metadata.id));
        plugins
    }

    pub fn get_plugin(&self, plugin_id: &str) -> Option<InstalledPlugin> {
        self.slots.read().get(plugin_id).map(PluginSlot::snapshot)
    }

    pub fn routes_for(&self, plugin_id: &str) -> Vec<PluginRoute> {
        self.slots
            .read()
            .get(plugin_id)
            .map(|slot| slot.routes.clone())
            .unwrap_or_default()
    }

    pub fn is_enabled(&self, plugin_id: &str) -> bool {
        self.slots
            .read()
            .get(plugin_id)
            .is_some_and(|slot| slot.gate.is_enabled())
    }

    pub fn get_status(&self, plugin_id: &str) -> Result<PluginStatus, PluginSystemError> {
        let (state, health, gate, load_time_ms, loaded_at) = {
            let slots = self.slots.read();
            let slot = slots
                .get(plugin_id)
                .ok_or_else(|| PluginSystemError::NotFound(plugin_id.to_string()))?;
            (
                slot.state,
                slot.health.clone(),
                slot.gate.clone(),
                slot.installed.load_time_ms,
                slot.loaded_at,
            )
        };

        let mut status = gate
            .live()
            .and_then(|live| guarded(|| live.plugin.status()).ok())
            .unwrap_or_default();
        status.state = state;
        status.health = health.state;
        status.last_check = health.last_check;
        status.request_count = gate.request_count();
        status.error_count = gate.error_count();
        status.last_errors = gate.recent_errors(STATUS_ERROR_LIMIT);
        status.uptime_secs = loaded_at.map_or(0, |at| at.elapsed().as_secs());
        status.load_time_ms = load_time_ms;
        Ok(status)
    }

    pub fn plugin_details(&self, plugin_id: &str) -> Result<PluginDetails, PluginSystemError> {
        let (plugin, routes, gate) = {
            let slots = self.slots.read();
            let slot = slots
                .get(plugin_id)
                .ok_or_else(|| PluginSystemError::NotFound(plugin_id.to_string()))?;
            (slot.snapshot(), slot.routes.clone(), slot.gate.clone())
        };
        let status = self.get_status(plugin_id)?;

        let (permissions, metrics) = match gate.live() {
            Some(live) => (
                guarded(|| live.plugin.permissions())
                    .unwrap_or_else(|_| plugin.metadata.permissions.clone()),
                guarded(|| live.plugin.metrics()).unwrap_or_default(),
            ),
            None => (plugin.metadata.permissions.clone(), HashMap::new()),
        };

        Ok(PluginDetails {
            plugin,
            status,
            routes,
            permissions,
            metrics,
        })
    }

    /// Validate and apply a new configuration table to a plugin.
    pub async fn update_config(
        &self,
        plugin_id: &str,
        config: PluginConfig,
    ) -> Result<(), PluginSystemError> {
        let _guard = self.lifecycle.lock().await;
        validator::validate_config(plugin_id, &config)?;

        let (mut installed, gate) = {
            let slots = self.slots.read();
            let slot = slots
                .get(plugin_id)
                .ok_or_else(|| PluginSystemError::NotFound(plugin_id.to_string()))?;
            (slot.installed.clone(), slot.gate.clone())
        };

        if let Some(live) = gate.live() {
            self.bounded("on_config_change", live.plugin.on_config_change(&config))
                .await
                .map_err(|message| {
                    PluginSystemError::validation(plugin_id, format!("configuration rejected: {}", message))
                })?;
        }

        installed.config = config;
        installed.enabled = gate.is_enabled();
        installed.updated_at = Utc::now();
        self.registry
            .update(&installed)
            .map_err(PluginSystemError::storage)?;

        if let Some(slot) = self.slots.write().get_mut(plugin_id) {
            slot.installed = installed;
        }
        tracing::info!(plugin_id = %plugin_id, "Plugin configuration updated");
        Ok(())
    }

    pub fn system_metrics(&self) -> PluginSystemMetrics {
        let slots = self.slots.read();
        let mut metrics = PluginSystemMetrics {
            total_plugins: slots.len(),
            ..Default::default()
        };
        for slot in slots.values() {
            if slot.gate.is_enabled() {
                metrics.enabled_plugins += 1;
            }
            if slot.state.is_live() {
                metrics.loaded_plugins += 1;
            }
            match slot.health.state {
                HealthState::Healthy => metrics.healthy_plugins += 1,
                HealthState::Unhealthy => metrics.unhealthy_plugins += 1,
                _ => {}
            }
            metrics.total_requests += slot.gate.request_count();
            metrics.total_errors += slot.gate.error_count();
        }
        metrics
    }

    /// Live plugins eligible for health checks (`Loaded` or `Enabled`).
    pub fn health_targets(&self) -> Vec<(String, Arc<dyn Plugin>)> {
        self.slots
            .read()
            .iter()
            .filter(|(_, slot)| {
                matches!(slot.state, LifecycleState::Loaded | LifecycleState::Enabled)
            })
            .filter_map(|(id, slot)| slot.gate.live().map(|live| (id.clone(), live.plugin.clone())))
            .collect()
    }

    pub fn live_instance(&self, plugin_id: &str) -> Result<Arc<dyn Plugin>, PluginSystemError> {
        let slots = self.slots.read();
        let slot = slots
            .get(plugin_id)
            .ok_or_else(|| PluginSystemError::NotFound(plugin_id.to_string()))?;
        slot.gate
            .live()
            .map(|live| live.plugin.clone())
            .ok_or_else(|| PluginSystemError::Unavailable {
                plugin_id: plugin_id.to_string(),
                message: "plugin is not loaded".to_string(),
            })
    }

    /// Record a health check result. Returns the resulting health, or `None` if
    /// the plugin vanished meanwhile.
    pub fn apply_health(
        &self,
        plugin_id: &str,
        outcome: &HealthOutcome,
        threshold: u32,
    ) -> Option<HealthState> {
        let (change, record, gate) = {
            let mut slots = self.slots.write();
            let slot = slots.get_mut(plugin_id)?;
            let change = slot.health.observe(outcome, threshold);
            (change, slot.health.clone(), slot.gate.clone())
        };

        if !outcome.is_success() {
            let code = match outcome {
                HealthOutcome::TimedOut(_) => PluginErrorCode::Timeout,
                _ => PluginErrorCode::HealthCheckFailed,
            };
            let message = describe(outcome);
            tracing::warn!(
                plugin_id = %plugin_id,
                consecutive_failures = record.consecutive_failures,
                error = %message,
                "Plugin health check failed"
            );
            gate.record_error(PluginError::new(code, message));
        }

        match change {
            HealthTransition::BecameUnhealthy => {
                tracing::error!(
                    plugin_id = %plugin_id,
                    consecutive_failures = record.consecutive_failures,
                    "Plugin is unhealthy"
                );
                self.emit(PluginEvent::BecameUnhealthy {
                    plugin_id: plugin_id.to_string(),
                    consecutive_failures: record.consecutive_failures,
                    last_error: record.last_error.clone(),
                });
            }
            HealthTransition::Recovered => {
                tracing::info!(plugin_id = %plugin_id, "Plugin recovered");
                self.emit(PluginEvent::Recovered {
                    plugin_id: plugin_id.to_string(),
                });
            }
            HealthTransition::Unchanged => {}
        }

        Some(record.state)
    }
}

/// Call plugin code that may panic.
fn guarded<T>(f: impl FnOnce() -> T) -> Result<T, String> {
    std::panic::catch_unwind(AssertUnwindSafe(f)).map_err(|panic| {
        panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string())
    })
}
