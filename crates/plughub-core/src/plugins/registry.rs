//! Storage-agnostic plugin registry.
//!
//! The manager only talks to `PluginRegistry`; `SqliteRegistry` (in `storage`) is
//! the primary backend and `FileRegistry` keeps a single JSON document on disk.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::types::{InstalledPlugin, PluginRoute};

/// An installation plus the routes needed to rebind it without running plugin code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub plugin: InstalledPlugin,
    #[serde(default)]
    pub routes: Vec<PluginRoute>,
}

pub trait PluginRegistry: Send + Sync {
    /// Every persisted entry, used to rebuild routing at startup.
    fn load(&self) -> Result<Vec<RegistryEntry>>;

    /// Insert or replace an entry and its routes.
    fn persist(&self, entry: &RegistryEntry) -> Result<()>;

    fn get(&self, plugin_id: &str) -> Result<Option<RegistryEntry>>;

    fn list(&self) -> Result<Vec<InstalledPlugin>>;

    fn exists(&self, plugin_id: &str) -> Result<bool>;

    /// Update installation fields of an existing entry; routes are left alone.
    fn update(&self, plugin: &InstalledPlugin) -> Result<()>;

    /// Returns false when nothing was stored under `plugin_id`.
    fn delete(&self, plugin_id: &str) -> Result<bool>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryDocument {
    #[serde(default = "default_document_version")]
    version: u32,
    #[serde(default)]
    plugins: BTreeMap<String, RegistryEntry>,
}

fn default_document_version() -> u32 {
    1
}

/// File-backed registry stored at `<plugins_dir>/registry.json`.
pub struct FileRegistry {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileRegistry {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }

    pub fn in_dir(plugins_dir: &Path) -> Self {
        Self::new(plugins_dir.join("registry.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_document(&self) -> Result<RegistryDocument> {
        if !self.path.exists() {
            return Ok(RegistryDocument {
                version: default_document_version(),
                plugins: BTreeMap::new(),
            });
        }
        read_json(&self.path)
    }

    fn write_document(&self, document: &RegistryDocument) -> Result<()> {
        let content =
            serde_json::to_string_pretty(document).context("failed to serialize registry")?;
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;

        // Readers see either the old or the new document, never a partial one.
        let mut tmp = tempfile::NamedTempFile::new_in(parent)
            .with_context(|| format!("failed to stage registry in {}", parent.display()))?;
        tmp.write_all(content.as_bytes())
            .and_then(|_| tmp.as_file().sync_all())
            .context("failed to write registry")?;
        tmp.persist(&self.path)
            .map_err(|e| e.error)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }

    fn modify<T>(&self, f: impl FnOnce(&mut RegistryDocument) -> Result<T>) -> Result<T> {
        let _guard = self.write_lock.lock();
        let mut document = self.read_document()?;
        let result = f(&mut document)?;
        self.write_document(&document)?;
        Ok(result)
    }
}

impl PluginRegistry for FileRegistry {
    fn load(&self) -> Result<Vec<RegistryEntry>> {
        Ok(self.read_document()?.plugins.into_values().collect())
    }

    fn persist(&self, entry: &RegistryEntry) -> Result<()> {
        self.modify(|document| {
            document
                .plugins
                .insert(entry.plugin.id().to_string(), entry.clone());
            Ok(())
        })
    }

    fn get(&self, plugin_id: &str) -> Result<Option<RegistryEntry>> {
        Ok(self.read_document()?.plugins.remove(plugin_id))
    }

    fn list(&self) -> Result<Vec<InstalledPlugin>> {
        Ok(self
            .read_document()?
            .plugins
            .into_values()
            .map(|entry| entry.plugin)
            .collect())
    }

    fn exists(&self, plugin_id: &str) -> Result<bool> {
        Ok(self.read_document()?.plugins.contains_key(plugin_id))
    }

    fn update(&self, plugin: &InstalledPlugin) -> Result<()> {
        self.modify(|document| match document.plugins.get_mut(plugin.id()) {
            Some(entry) => {
                entry.plugin = plugin.clone();
                Ok(())
            }
            None => bail!("plugin '{}' is not in the registry", plugin.id()),
        })
    }

    fn delete(&self, plugin_id: &str) -> Result<bool> {
        self.modify(|document| Ok(document.plugins.remove(plugin_id).is_some()))
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes =
        std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("failed to parse {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::types::{InstallMethod, LifecycleState, PluginMetadata};
    use chrono::Utc;
    use tempfile::tempdir;

    fn sample_entry(id: &str) -> RegistryEntry {
        let metadata = PluginMetadata::new(id, "Sample", "1.0.0", "tests")
            .with_endpoint("GET", "/data", "get_data");
        RegistryEntry {
            plugin: InstalledPlugin {
                metadata,
                install_method: InstallMethod::Manual,
                enabled: true,
                status: LifecycleState::Enabled,
                install_path: None,
                load_time_ms: Some(3),
                config: Default::default(),
                installed_at: Utc::now(),
                updated_at: Utc::now(),
            },
            routes: vec![PluginRoute {
                plugin_id: id.to_string(),
                method: "GET".to_string(),
                path: format!("/api/plugins/{}/data", id),
                handler: "get_data".to_string(),
                permissions: Vec::new(),
            }],
        }
    }

    #[test]
    fn persists_across_instances() {
        let dir = tempdir().expect("tempdir");
        let registry = FileRegistry::in_dir(dir.path());
        registry.persist(&sample_entry("alpha")).expect("persist");
        registry.persist(&sample_entry("beta")).expect("persist");

        let reopened = FileRegistry::in_dir(dir.path());
        let entries = reopened.load().expect("load");
        assert_eq!(entries.len(), 2);
        assert!(reopened.exists("alpha").expect("exists"));
        assert_eq!(
            reopened.get("beta").expect("get").expect("beta").routes[0].path,
            "/api/plugins/beta/data"
        );
    }

    #[test]
    fn update_and_delete() {
        let dir = tempdir().expect("tempdir");
        let registry = FileRegistry::in_dir(dir.path());
        let mut entry = sample_entry("alpha");
        registry.persist(&entry).expect("persist");

        entry.plugin.enabled = false;
        entry.plugin.status = LifecycleState::Disabled;
        registry.update(&entry.plugin).expect("update");
        let stored = registry.get("alpha").expect("get").expect("alpha");
        assert!(!stored.plugin.enabled);
        assert_eq!(stored.routes.len(), 1);

        assert!(registry.delete("alpha").expect("delete"));
        assert!(!registry.delete("alpha").expect("second delete"));
        assert!(registry.list().expect("list").is_empty());

        let missing = sample_entry("ghost");
        assert!(registry.update(&missing.plugin).is_err());
    }

    #[test]
    fn writes_leave_only_the_registry_document() {
        let dir = tempdir().expect("tempdir");
        let registry = FileRegistry::in_dir(dir.path());
        for id in ["alpha", "beta", "gamma"] {
            registry.persist(&sample_entry(id)).expect("persist");
        }
        registry.delete("beta").expect("delete");

        let files: Vec<_> = std::fs::read_dir(dir.path())
            .expect("read dir")
            .map(|entry| entry.expect("entry").file_name())
            .collect();
        assert_eq!(files.len(), 1, "{files:?}");
        assert_eq!(registry.list().expect("list").len(), 2);
    }
}
