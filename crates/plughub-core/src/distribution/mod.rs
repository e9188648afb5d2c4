//! Artifact distribution
//!
//! Plugin archives are addressed by a `key` (the archive file name) and stored
//! under a directory named after the key's base name:
//! `<root>/<base>/<key>`, e.g. `monitor/monitor.tar.gz`.

pub mod git;
pub mod jobs;
pub mod local;
pub mod manifest;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::config::{DistributionBackend, DistributionConfig};
use crate::error::DistributionError;

pub use git::GitArtifactStore;
pub use jobs::{ArtifactJob, ArtifactJobs, JobKind, JobState};
pub use local::LocalArtifactStore;
pub use manifest::read_manifest;

const MAX_KEY_LEN: usize = 200;

/// Durable storage for plugin archives.
///
/// Every operation validates the key before doing any I/O.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store `data` under `key`, replacing any previous artifact.
    async fn upload_file(&self, key: &str, data: Bytes) -> Result<(), DistributionError>;

    /// Public URL of `key`. Pure: no I/O, same key gives the same URL.
    fn get_file_url(&self, key: &str) -> Result<String, DistributionError>;

    async fn delete_file(&self, key: &str) -> Result<(), DistributionError>;

    async fn download_file(&self, key: &str) -> Result<Bytes, DistributionError>;

    fn backend_name(&self) -> &'static str;
}

/// Reject keys that could escape the artifact root.
pub fn validate_key(key: &str) -> Result<(), DistributionError> {
    if key.trim().is_empty() {
        return Err(DistributionError::invalid_key(key, "key is empty"));
    }
    if key.contains("..") {
        return Err(DistributionError::invalid_key(key, "path traversal is not allowed"));
    }
    if key.starts_with('/') {
        return Err(DistributionError::invalid_key(key, "absolute paths are not allowed"));
    }
    if key.contains('/') || key.contains('\\') {
        return Err(DistributionError::invalid_key(key, "key must be a single file name"));
    }
    if key.starts_with('.') {
        return Err(DistributionError::invalid_key(key, "hidden file names are not allowed"));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(DistributionError::invalid_key(
            key,
            format!("key exceeds {} bytes", MAX_KEY_LEN),
        ));
    }
    if key.chars().any(|c| c.is_control()) {
        return Err(DistributionError::invalid_key(key, "key contains control characters"));
    }
    if artifact_base_name(key).is_empty() {
        return Err(DistributionError::invalid_key(key, "key has no base name"));
    }
    Ok(())
}

/// `monitor.tar.gz` -> `monitor`, `monitor.zip` -> `monitor`, `monitor` -> `monitor`.
pub fn artifact_base_name(key: &str) -> &str {
    if let Some(base) = key.strip_suffix(".tar.gz") {
        return base;
    }
    if let Some(base) = key.strip_suffix(".tgz") {
        return base;
    }
    match key.rfind('.') {
        Some(0) | None => key,
        Some(idx) => &key[..idx],
    }
}

/// Relative location of an artifact inside a store: `<base>/<key>`.
pub fn artifact_path(key: &str) -> String {
    format!("{}/{}", artifact_base_name(key), key)
}

/// `<base_url>/<base>/<key>`, with any trailing slash on `base_url` dropped.
pub fn artifact_url(base_url: &str, key: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), artifact_path(key))
}

/// Build the store selected by `config.backend`.
pub fn from_config(config: &DistributionConfig) -> Result<Arc<dyn ArtifactStore>, DistributionError> {
    match config.backend {
        DistributionBackend::Git => {
            let git = config.git.clone().ok_or_else(|| {
                DistributionError::Config("backend is 'git' but [distribution.git] is missing".to_string())
            })?;
            Ok(Arc::new(GitArtifactStore::new(git)?))
        }
        DistributionBackend::Local => Ok(Arc::new(LocalArtifactStore::new(
            config.local.root.clone(),
            config.local.public_base_url.clone(),
        )?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_name_strips_archive_suffixes() {
        assert_eq!(artifact_base_name("monitor.tar.gz"), "monitor");
        assert_eq!(artifact_base_name("monitor.tgz"), "monitor");
        assert_eq!(artifact_base_name("monitor-1.2.0.zip"), "monitor-1.2.0");
        assert_eq!(artifact_base_name("monitor"), "monitor");
        assert_eq!(artifact_base_name(".hidden"), ".hidden");
    }

    #[test]
    fn url_is_deterministic_and_distinct_per_key() {
        let base = "https://raw.githubusercontent.com/org/plugins/main/";
        let first = artifact_url(base, "monitor.tar.gz");
        assert_eq!(
            first,
            "https://raw.githubusercontent.com/org/plugins/main/monitor/monitor.tar.gz"
        );
        assert_eq!(first, artifact_url(base, "monitor.tar.gz"));
        assert_ne!(first, artifact_url(base, "monitor.tgz"));
        assert_ne!(first, artifact_url(base, "logger.tar.gz"));
    }

    #[test]
    fn unsafe_keys_are_rejected() {
        for key in [
            "",
            "../escape.tar.gz",
            "/abs.tar.gz",
            "nested/dir.tar.gz",
            "win\\path.tar.gz",
            "a..b.tar.gz",
            ".tar.gz",
            ".git",
        ] {
            let err = validate_key(key).expect_err(key);
            assert!(err.is_invalid_key(), "{key}: {err}");
        }
        validate_key("plugin-monitor.tar.gz").expect("valid key");
    }
}
