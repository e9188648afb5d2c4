//! Plugin system configuration
//!
//! Loaded from `~/.plughub/config.toml` (or `PLUGHUB_CONFIG`). Every field has a
//! default so a missing file yields a working local setup.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::paths;
use crate::plugins::types::PluginConfig;

fn default_true() -> bool {
    true
}

fn default_plugin_timeout_secs() -> u64 {
    30
}

fn default_max_concurrent_calls() -> usize {
    100
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginSystemConfig {
    #[serde(default = "paths::plugins_dir")]
    pub plugins_dir: PathBuf,
    #[serde(default = "default_true")]
    pub autoload: bool,
    #[serde(default = "default_plugin_timeout_secs")]
    pub plugin_timeout_secs: u64,
    #[serde(default = "default_max_concurrent_calls")]
    pub max_concurrent_calls: usize,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Where installations are persisted.
    #[serde(default)]
    pub registry: RegistryBackend,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub distribution: DistributionConfig,
    #[serde(default)]
    pub server: ServerSection,
    /// Per-plugin configuration tables, keyed by plugin id.
    #[serde(default)]
    pub plugins: HashMap<String, PluginConfig>,
}

impl Default for PluginSystemConfig {
    fn default() -> Self {
        Self {
            plugins_dir: paths::plugins_dir(),
            autoload: true,
            plugin_timeout_secs: default_plugin_timeout_secs(),
            max_concurrent_calls: default_max_concurrent_calls(),
            log_level: default_log_level(),
            registry: RegistryBackend::default(),
            health: HealthConfig::default(),
            distribution: DistributionConfig::default(),
            server: ServerSection::default(),
            plugins: HashMap::new(),
        }
    }
}

impl PluginSystemConfig {
    /// Load config from `PLUGHUB_CONFIG` or the default path, then apply env overrides.
    pub fn load() -> Result<Self> {
        let path = std::env::var("PLUGHUB_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| paths::config_path());
        let mut config = Self::load_from(&path)?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Read a config file. A missing file yields defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
    }

    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("PLUGIN_DIR").filter(|v| !v.trim().is_empty()) {
            self.plugins_dir = PathBuf::from(dir);
        }
        if let Some(port) = lookup("PLUGHUB_PORT") {
            self.server.port = port
                .trim()
                .parse()
                .with_context(|| format!("PLUGHUB_PORT is not a valid port: {}", port))?;
        }
        if let Some(level) = lookup("PLUGHUB_LOG").filter(|v| !v.trim().is_empty()) {
            self.log_level = level;
        }
        if let Some(token) = lookup("PLUGHUB_GIT_TOKEN").filter(|v| !v.trim().is_empty()) {
            if let Some(git) = self.distribution.git.as_mut() {
                git.access_token = Some(token);
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.plugin_timeout_secs == 0 {
            bail!("plugin_timeout_secs must be greater than zero");
        }
        if self.max_concurrent_calls == 0 {
            bail!("max_concurrent_calls must be greater than zero");
        }
        if self.health.unhealthy_threshold == 0 {
            bail!("health.unhealthy_threshold must be greater than zero");
        }
        if self.distribution.backend == DistributionBackend::Git && self.distribution.git.is_none()
        {
            bail!("distribution.backend is 'git' but [distribution.git] is missing");
        }
        Ok(())
    }

    pub fn plugin_timeout(&self) -> Duration {
        Duration::from_secs(self.plugin_timeout_secs)
    }

    /// Configuration table for a plugin, empty when none is configured.
    pub fn plugin_config(&self, plugin_id: &str) -> PluginConfig {
        self.plugins.get(plugin_id).cloned().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistryBackend {
    /// Tables in `plughub.db`.
    #[default]
    Sqlite,
    /// `registry.json` under `plugins_dir`.
    File,
}

fn default_interval_secs() -> u64 {
    30
}

fn default_check_timeout_secs() -> u64 {
    5
}

fn default_unhealthy_threshold() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_check_timeout_secs")]
    pub timeout_secs: u64,
    /// Consecutive failures before a plugin is reported unhealthy.
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            timeout_secs: default_check_timeout_secs(),
            unhealthy_threshold: default_unhealthy_threshold(),
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistributionBackend {
    Git,
    #[default]
    Local,
}

fn default_operation_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributionConfig {
    #[serde(default)]
    pub backend: DistributionBackend,
    /// Upper bound for one background upload/delete job.
    #[serde(default = "default_operation_timeout_secs")]
    pub operation_timeout_secs: u64,
    #[serde(default)]
    pub git: Option<GitDistributionConfig>,
    #[serde(default)]
    pub local: LocalDistributionConfig,
}

impl Default for DistributionConfig {
    fn default() -> Self {
        Self {
            backend: DistributionBackend::default(),
            operation_timeout_secs: default_operation_timeout_secs(),
            git: None,
            local: LocalDistributionConfig::default(),
        }
    }
}

impl DistributionConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs.max(1))
    }
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_author_name() -> String {
    "PlugHub".to_string()
}

fn default_author_email() -> String {
    "plughub@users.noreply.github.com".to_string()
}

fn default_clone_depth() -> u32 {
    1
}

fn default_push_retries() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitDistributionConfig {
    /// Remote repository, e.g. `https://github.com/org/plugins.git`.
    pub remote_url: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default, skip_serializing)]
    pub access_token: Option<String>,
    /// Raw-content base, e.g. `https://raw.githubusercontent.com/org/plugins/main`.
    pub public_base_url: String,
    #[serde(default = "default_author_name")]
    pub author_name: String,
    #[serde(default = "default_author_email")]
    pub author_email: String,
    #[serde(default = "default_clone_depth")]
    pub clone_depth: u32,
    #[serde(default = "default_push_retries")]
    pub push_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalDistributionConfig {
    #[serde(default = "paths::artifacts_dir")]
    pub root: PathBuf,
    /// Defaults to a `file://` URL of `root`.
    #[serde(default)]
    pub public_base_url: Option<String>,
}

impl Default for LocalDistributionConfig {
    fn default() -> Self {
        Self {
            root: paths::artifacts_dir(),
            public_base_url: None,
        }
    }
}

fn default_port() -> u16 {
    8080
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: default_bind(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempdir().expect("tempdir");
        let config = PluginSystemConfig::load_from(&dir.path().join("absent.toml"))
            .expect("defaults should load");

        assert!(config.autoload);
        assert_eq!(config.plugin_timeout_secs, 30);
        assert_eq!(config.max_concurrent_calls, 100);
        assert_eq!(config.health.unhealthy_threshold, 3);
        assert_eq!(config.distribution.backend, DistributionBackend::Local);
        assert_eq!(config.registry, RegistryBackend::Sqlite);
    }

    #[test]
    fn parses_git_backend_and_plugin_tables() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
autoload = false
plugin_timeout_secs = 10
registry = "file"

[health]
interval_secs = 15

[distribution]
backend = "git"

[distribution.git]
remote_url = "https://example.com/org/plugins.git"
public_base_url = "https://raw.example.com/org/plugins/main"

[plugins.echo]
greeting = "hi"
"#,
        )
        .expect("write config");

        let config = PluginSystemConfig::load_from(&path).expect("config should parse");
        config.validate().expect("config should be valid");

        assert!(!config.autoload);
        assert_eq!(config.registry, RegistryBackend::File);
        assert_eq!(config.health.interval_secs, 15);
        assert_eq!(config.health.timeout_secs, 5);
        let git = config.distribution.git.as_ref().expect("git section");
        assert_eq!(git.branch, "main");
        assert_eq!(git.clone_depth, 1);
        assert_eq!(
            config.plugin_config("echo").get("greeting"),
            Some(&serde_json::json!("hi"))
        );
        assert!(config.plugin_config("missing").is_empty());
    }

    #[test]
    fn env_overrides_take_precedence() {
        let mut config = PluginSystemConfig::default();
        config.distribution.git = Some(GitDistributionConfig {
            remote_url: "https://example.com/repo.git".to_string(),
            branch: default_branch(),
            access_token: None,
            public_base_url: "https://raw.example.com".to_string(),
            author_name: default_author_name(),
            author_email: default_author_email(),
            clone_depth: 1,
            push_retries: 3,
        });

        config
            .apply_env_overrides(|key| match key {
                "PLUGIN_DIR" => Some("/srv/plugins".to_string()),
                "PLUGHUB_PORT" => Some("9090".to_string()),
                "PLUGHUB_GIT_TOKEN" => Some("secret".to_string()),
                _ => None,
            })
            .expect("overrides apply");

        assert_eq!(config.plugins_dir, PathBuf::from("/srv/plugins"));
        assert_eq!(config.server.port, 9090);
        assert_eq!(
            config.distribution.git.and_then(|g| g.access_token),
            Some("secret".to_string())
        );
    }

    #[test]
    fn rejects_git_backend_without_section() {
        let mut config = PluginSystemConfig::default();
        config.distribution.backend = DistributionBackend::Git;
        assert!(config.validate().is_err());
    }
}
