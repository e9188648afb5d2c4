//! SQLite connection and schema migrations

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::Connection;

pub type SharedDatabase = Arc<Database>;

const SCHEMA_VERSION: i64 = 1;

/// Single SQLite connection guarded by a mutex.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) the database at `path` and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::from_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.run_migrations()?;
        Ok(db)
    }

    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn();
        let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if version >= SCHEMA_VERSION {
            return Ok(());
        }

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS plugin_details (
                plugin_id TEXT NOT NULL,
                version TEXT NOT NULL,
                name TEXT NOT NULL,
                author TEXT NOT NULL,
                metadata TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE (plugin_id, version)
            );

            CREATE TABLE IF NOT EXISTS installed_plugins (
                plugin_id TEXT PRIMARY KEY,
                version TEXT NOT NULL,
                install_method TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                status TEXT NOT NULL,
                install_path TEXT,
                load_time_ms INTEGER,
                config TEXT NOT NULL DEFAULT '{}',
                installed_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                FOREIGN KEY (plugin_id, version) REFERENCES plugin_details (plugin_id, version)
            );

            CREATE TABLE IF NOT EXISTS plugin_routes (
                plugin_id TEXT NOT NULL REFERENCES installed_plugins (plugin_id) ON DELETE CASCADE,
                method TEXT NOT NULL,
                path TEXT NOT NULL,
                handler TEXT NOT NULL,
                permissions TEXT NOT NULL DEFAULT '[]',
                PRIMARY KEY (method, path)
            );

            CREATE INDEX IF NOT EXISTS idx_plugin_routes_plugin ON plugin_routes (plugin_id);

            CREATE TABLE IF NOT EXISTS marketplace_plugins (
                plugin_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                version TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                author TEXT NOT NULL,
                artifact_key TEXT,
                download_url TEXT,
                featured INTEGER NOT NULL DEFAULT 0,
                verified INTEGER NOT NULL DEFAULT 0,
                price REAL NOT NULL DEFAULT 0,
                rating REAL NOT NULL DEFAULT 0,
                downloads INTEGER NOT NULL DEFAULT 0,
                installs INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL
            );",
        )
        .context("failed to create plugin tables")?;

        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        tracing::debug!(version = SCHEMA_VERSION, "Applied database migrations");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn migrations_are_idempotent() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("plughub.db");
        Database::new(&path).expect("first open");
        let db = Database::new(&path).expect("second open");

        let tables: i64 = db
            .conn()
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'
                 AND name IN ('plugin_details', 'installed_plugins', 'plugin_routes', 'marketplace_plugins')",
                [],
                |row| row.get(0),
            )
            .expect("count tables");
        assert_eq!(tables, 4);
    }
}
