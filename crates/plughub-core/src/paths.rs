//! Centralized path utilities
//!
//! All application paths in one place for consistency

use std::path::PathBuf;

const CONFIG_DIR_NAME: &str = ".plughub";

/// Get the plughub config directory (~/.plughub)
pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(CONFIG_DIR_NAME)
}

/// Get the default config file (~/.plughub/config.toml)
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// Get the SQLite registry database (~/.plughub/plughub.db)
pub fn database_path() -> PathBuf {
    config_dir().join("plughub.db")
}

/// Get the default plugins directory (~/.plughub/plugins)
pub fn plugins_dir() -> PathBuf {
    config_dir().join("plugins")
}

/// Get the default local artifact directory (~/.plughub/artifacts)
/// Used by the filesystem distribution backend
pub fn artifacts_dir() -> PathBuf {
    config_dir().join("artifacts")
}
