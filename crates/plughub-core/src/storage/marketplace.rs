//! Marketplace catalog storage
//!
//! Publish-facing records layered over plugin metadata: featured/verified flags,
//! price, rating, and download/install counters.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Row};

use super::database::Database;
use crate::plugins::types::MarketplacePlugin;

const SELECT_MARKETPLACE: &str = "SELECT plugin_id, name, version, description, author,
        artifact_key, download_url, featured, verified, price, rating, downloads, installs,
        updated_at
     FROM marketplace_plugins";

/// SQLite-backed marketplace store
pub struct MarketplaceStore<'a> {
    db: &'a Database,
}

impl<'a> MarketplaceStore<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// List catalog entries, featured first.
    pub fn list(&self) -> Result<Vec<MarketplacePlugin>> {
        let conn = self.db.conn();
        let sql = format!(
            "{} ORDER BY featured DESC, installs DESC, plugin_id",
            SELECT_MARKETPLACE
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], row_to_plugin)?;
        let plugins = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(plugins)
    }

    pub fn get(&self, plugin_id: &str) -> Result<Option<MarketplacePlugin>> {
        let sql = format!("{} WHERE plugin_id = ?1", SELECT_MARKETPLACE);
        let result = self.db.conn().query_row(&sql, [plugin_id], row_to_plugin);

        match result {
            Ok(plugin) => Ok(Some(plugin)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Find the catalog entry that publishes `artifact_key`.
    pub fn find_by_artifact(&self, artifact_key: &str) -> Result<Option<MarketplacePlugin>> {
        let sql = format!("{} WHERE artifact_key = ?1", SELECT_MARKETPLACE);
        let result = self.db.conn().query_row(&sql, [artifact_key], row_to_plugin);

        match result {
            Ok(plugin) => Ok(Some(plugin)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Insert or update a catalog entry. Counters and rating are preserved on update.
    pub fn upsert(&self, plugin: &MarketplacePlugin) -> Result<()> {
        self.db.conn().execute(
            "INSERT INTO marketplace_plugins (plugin_id, name, version, description, author,
                artifact_key, download_url, featured, verified, price, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT (plugin_id) DO UPDATE SET
                name = excluded.name, version = excluded.version,
                description = excluded.description, author = excluded.author,
                artifact_key = COALESCE(excluded.artifact_key, marketplace_plugins.artifact_key),
                download_url = COALESCE(excluded.download_url, marketplace_plugins.download_url),
                featured = excluded.featured, verified = excluded.verified,
                price = excluded.price, updated_at = excluded.updated_at",
            params![
                plugin.plugin_id,
                plugin.name,
                plugin.version,
                plugin.description,
                plugin.author,
                plugin.artifact_key,
                plugin.download_url,
                plugin.featured,
                plugin.verified,
                plugin.price,
                Utc::now().to_rfc3339()
            ],
        )?;

        tracing::debug!(plugin_id = %plugin.plugin_id, "Upserted marketplace plugin");
        Ok(())
    }

    /// Point a catalog entry at a published artifact.
    pub fn set_artifact(&self, plugin_id: &str, artifact_key: &str, download_url: &str) -> Result<()> {
        let rows = self.db.conn().execute(
            "UPDATE marketplace_plugins SET artifact_key = ?2, download_url = ?3, updated_at = ?4
             WHERE plugin_id = ?1",
            params![plugin_id, artifact_key, download_url, Utc::now().to_rfc3339()],
        )?;
        if rows == 0 {
            bail!("marketplace plugin '{}' not found", plugin_id);
        }
        Ok(())
    }

    pub fn increment_downloads(&self, plugin_id: &str) -> Result<()> {
        self.db.conn().execute(
            "UPDATE marketplace_plugins SET downloads = downloads + 1 WHERE plugin_id = ?1",
            [plugin_id],
        )?;
        Ok(())
    }

    pub fn increment_installs(&self, plugin_id: &str) -> Result<()> {
        self.db.conn().execute(
            "UPDATE marketplace_plugins SET installs = installs + 1 WHERE plugin_id = ?1",
            [plugin_id],
        )?;
        Ok(())
    }

    pub fn set_rating(&self, plugin_id: &str, rating: f64) -> Result<()> {
        if !(0.0..=5.0).contains(&rating) {
            bail!("rating must be between 0 and 5, got {}", rating);
        }
        let rows = self.db.conn().execute(
            "UPDATE marketplace_plugins SET rating = ?2 WHERE plugin_id = ?1",
            params![plugin_id, rating],
        )?;
        if rows == 0 {
            bail!("marketplace plugin '{}' not found", plugin_id);
        }
        Ok(())
    }

    pub fn delete(&self, plugin_id: &str) -> Result<bool> {
        let rows = self
            .db
            .conn()
            .execute("DELETE FROM marketplace_plugins WHERE plugin_id = ?1", [plugin_id])
            .with_context(|| format!("failed to delete marketplace plugin {}", plugin_id))?;
        Ok(rows > 0)
    }
}

fn row_to_plugin(row: &Row<'_>) -> rusqlite::Result<MarketplacePlugin> {
    let updated_at: String = row.get(13)?;
    Ok(MarketplacePlugin {
        plugin_id: row.get(0)?,
        name: row.get(1)?,
        version: row.get(2)?,
        description: row.get(3)?,
        author: row.get(4)?,
        artifact_key: row.get(5)?,
        download_url: row.get(6)?,
        featured: row.get(7)?,
        verified: row.get(8)?,
        price: row.get(9)?,
        rating: row.get(10)?,
        downloads: row.get::<_, i64>(11)?.max(0) as u64,
        installs: row.get::<_, i64>(12)?.max(0) as u64,
        updated_at: DateTime::parse_from_rfc3339(&updated_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}
