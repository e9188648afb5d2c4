//! SQLite-backed plugin registry
//!
//! - `plugin_details`: immutable metadata per (plugin_id, version)
//! - `installed_plugins`: one row per installation
//! - `plugin_routes`: denormalized routes, unique per (method, path)

use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::database::SharedDatabase;
use crate::plugins::registry::{PluginRegistry, RegistryEntry};
use crate::plugins::types::{InstalledPlugin, PluginMetadata, PluginRoute};

const SELECT_INSTALLED: &str = "SELECT i.plugin_id, i.install_method, i.enabled, i.status,
        i.install_path, i.load_time_ms, i.config, i.installed_at, i.updated_at, d.metadata
     FROM installed_plugins i
     JOIN plugin_details d ON d.plugin_id = i.plugin_id AND d.version = i.version";

pub struct SqliteRegistry {
    db: SharedDatabase,
}

impl SqliteRegistry {
    pub fn new(db: SharedDatabase) -> Self {
        Self { db }
    }

    fn routes_for(&self, plugin_id: &str) -> Result<Vec<PluginRoute>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT plugin_id, method, path, handler, permissions
             FROM plugin_routes WHERE plugin_id = ?1 ORDER BY path, method",
        )?;
        let rows = stmt.query_map([plugin_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut routes = Vec::new();
        for row in rows {
            let (plugin_id, method, path, handler, permissions) = row?;
            routes.push(PluginRoute {
                plugin_id,
                method,
                path,
                handler,
                permissions: serde_json::from_str(&permissions)
                    .context("invalid route permissions")?,
            });
        }
        Ok(routes)
    }

    fn query_installed(&self, filter: Option<&str>) -> Result<Vec<InstalledPlugin>> {
        let conn = self.db.conn();
        let rows: Vec<InstalledRow> = match filter {
            Some(plugin_id) => {
                let sql = format!("{} WHERE i.plugin_id = ?1", SELECT_INSTALLED);
                conn.query_row(&sql, [plugin_id], InstalledRow::from_row)
                    .optional()?
                    .into_iter()
                    .collect()
            }
            None => {
                let sql = format!("{} ORDER BY i.plugin_id", SELECT_INSTALLED);
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map([], InstalledRow::from_row)?;
                let collected = rows.collect::<rusqlite::Result<Vec<_>>>()?;
                collected
            }
        };
        drop(conn);

        rows.into_iter().map(InstalledRow::into_plugin).collect()
    }
}

impl PluginRegistry for SqliteRegistry {
    fn load(&self) -> Result<Vec<RegistryEntry>> {
        let plugins = self.query_installed(None)?;
        plugins
            .into_iter()
            .map(|plugin| {
                let routes = self.routes_for(plugin.id())?;
                Ok(RegistryEntry { plugin, routes })
            })
            .collect()
    }

    fn persist(&self, entry: &RegistryEntry) -> Result<()> {
        let plugin = &entry.plugin;
        let metadata = &plugin.metadata;
        let metadata_json = serde_json::to_string(metadata).context("serialize metadata")?;
        let config_json = serde_json::to_string(&plugin.config).context("serialize config")?;
        let install_path = plugin
            .install_path
            .as_ref()
            .map(|p| p.to_string_lossy().to_string());

        let mut conn = self.db.conn();
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO plugin_details (plugin_id, version, name, author, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (plugin_id, version) DO NOTHING",
            params![
                metadata.id,
                metadata.version,
                metadata.name,
                metadata.author,
                metadata_json,
                Utc::now().to_rfc3339()
            ],
        )?;

        // Details are immutable per (plugin_id, version)
        let stored: String = tx.query_row(
            "SELECT metadata FROM plugin_details WHERE plugin_id = ?1 AND version = ?2",
            params![metadata.id, metadata.version],
            |row| row.get(0),
        )?;
        let stored: serde_json::Value =
            serde_json::from_str(&stored).context("invalid stored metadata")?;
        if stored != serde_json::to_value(metadata)? {
            bail!(
                "metadata for {} {} is already registered and differs",
                metadata.id,
                metadata.version
            );
        }

        tx.execute(
            "INSERT INTO installed_plugins (plugin_id, version, install_method, enabled, status,
                install_path, load_time_ms, config, installed_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT (plugin_id) DO UPDATE SET
                version = excluded.version, install_method = excluded.install_method,
                enabled = excluded.enabled, status = excluded.status,
                install_path = excluded.install_path, load_time_ms = excluded.load_time_ms,
                config = excluded.config, updated_at = excluded.updated_at",
            params![
                metadata.id,
                metadata.version,
                plugin.install_method.as_str(),
                plugin.enabled,
                plugin.status.as_str(),
                install_path,
                plugin.load_time_ms.map(|ms| ms as i64),
                config_json,
                plugin.installed_at.to_rfc3339(),
                plugin.updated_at.to_rfc3339()
            ],
        )?;

        tx.execute(
            "DELETE FROM plugin_routes WHERE plugin_id = ?1",
            [&metadata.id],
        )?;
        for route in &entry.routes {
            tx.execute(
                "INSERT INTO plugin_routes (plugin_id, method, path, handler, permissions)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    route.plugin_id,
                    route.method,
                    route.path,
                    route.handler,
                    serde_json::to_string(&route.permissions)?
                ],
            )
            .with_context(|| format!("route {} {} is already persisted", route.method, route.path))?;
        }

        tx.commit()?;
        tracing::info!(
            plugin_id = %metadata.id,
            version = %metadata.version,
            routes = entry.routes.len(),
            "Persisted plugin"
        );
        Ok(())
    }

    fn get(&self, plugin_id: &str) -> Result<Option<RegistryEntry>> {
        let Some(plugin) = self.query_installed(Some(plugin_id))?.into_iter().next() else {
            return Ok(None);
        };
        let routes = self.routes_for(plugin_id)?;
        Ok(Some(RegistryEntry { plugin, routes }))
    }

    fn list(&self) -> Result<Vec<InstalledPlugin>> {
        self.query_installed(None)
    }

    fn exists(&self, plugin_id: &str) -> Result<bool> {
        let found: Option<i64> = self
            .db
            .conn()
            .query_row(
                "SELECT 1 FROM installed_plugins WHERE plugin_id = ?1",
                [plugin_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn update(&self, plugin: &InstalledPlugin) -> Result<()> {
        let config_json = serde_json::to_string(&plugin.config).context("serialize config")?;
        let rows = self.db.conn().execute(
            "UPDATE installed_plugins SET enabled = ?2, status = ?3, load_time_ms = ?4,
                config = ?5, updated_at = ?6
             WHERE plugin_id = ?1",
            params![
                plugin.id(),
                plugin.enabled,
                plugin.status.as_str(),
                plugin.load_time_ms.map(|ms| ms as i64),
                config_json,
                plugin.updated_at.to_rfc3339()
            ],
        )?;
        if rows == 0 {
            bail!("plugin '{}' is not in the registry", plugin.id());
        }
        Ok(())
    }

    fn delete(&self, plugin_id: &str) -> Result<bool> {
        let rows = self
            .db
            .conn()
            .execute("DELETE FROM installed_plugins WHERE plugin_id = ?1", [plugin_id])?;
        if rows > 0 {
            tracing::info!(plugin_id = %plugin_id, "Deleted plugin from registry");
        }
        Ok(rows > 0)
    }
}

/// Raw row from the installed/details join
struct InstalledRow {
    plugin_id: String,
    install_method: String,
    enabled: bool,
    status: String,
    install_path: Option<String>,
    load_time_ms: Option<i64>,
    config: String,
    installed_at: String,
    updated_at: String,
    metadata: String,
}

impl InstalledRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            plugin_id: row.get(0)?,
            install_method: row.get(1)?,
            enabled: row.get(2)?,
            status: row.get(3)?,
            install_path: row.get(4)?,
            load_time_ms: row.get(5)?,
            config: row.get(6)?,
            installed_at: row.get(7)?,
            updated_at: row.get(8)?,
            metadata: row.get(9)?,
        })
    }

    fn into_plugin(self) -> Result<InstalledPlugin> {
        let metadata: PluginMetadata = serde_json::from_str(&self.metadata)
            .with_context(|| format!("invalid stored metadata for {}", self.plugin_id))?;

        Ok(InstalledPlugin {
            metadata,
            install_method: self.install_method.parse().map_err(|e: String| anyhow!(e))?,
            enabled: self.enabled,
            status: self.status.parse().map_err(|e: String| anyhow!(e))?,
            install_path: self.install_path.map(PathBuf::from),
            load_time_ms: self.load_time_ms.map(|ms| ms.max(0) as u64),
            config: serde_json::from_str(&self.config)
                .with_context(|| format!("invalid stored config for {}", self.plugin_id))?,
            installed_at: parse_timestamp(&self.installed_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("invalid timestamp '{}'", value))
}
