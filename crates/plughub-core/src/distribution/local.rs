//! Filesystem artifact store for development and single-node setups.

use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use url::Url;

use super::{artifact_base_name, artifact_url, validate_key, ArtifactStore};
use crate::error::DistributionError;

pub struct LocalArtifactStore {
    root: PathBuf,
    public_base_url: String,
}

impl LocalArtifactStore {
    /// `public_base_url` defaults to the `file://` URL of `root`.
    pub fn new(root: PathBuf, public_base_url: Option<String>) -> Result<Self, DistributionError> {
        let root = if root.is_absolute() {
            root
        } else {
            std::env::current_dir()
                .map_err(|e| DistributionError::Io(e.to_string()))?
                .join(root)
        };

        let public_base_url = match public_base_url {
            Some(url) => url,
            None => Url::from_directory_path(&root)
                .map_err(|_| {
                    DistributionError::Config(format!(
                        "cannot derive a file URL from {}",
                        root.display()
                    ))
                })?
                .to_string(),
        };

        Ok(Self {
            root,
            public_base_url,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn file_path(&self, key: &str) -> PathBuf {
        self.root.join(artifact_base_name(key)).join(key)
    }
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn upload_file(&self, key: &str, data: Bytes) -> Result<(), DistributionError> {
        validate_key(key)?;
        let path = self.file_path(key);
        let owned_key = key.to_string();

        tokio::task::spawn_blocking(move || write_atomic(&path, &data))
            .await
            .map_err(|e| DistributionError::Io(e.to_string()))?
            .map_err(|e| DistributionError::Write {
                key: owned_key,
                message: e.to_string(),
            })?;

        tracing::info!(key = %key, backend = "local", "Artifact stored");
        Ok(())
    }

    fn get_file_url(&self, key: &str) -> Result<String, DistributionError> {
        validate_key(key)?;
        Ok(artifact_url(&self.public_base_url, key))
    }

    async fn delete_file(&self, key: &str) -> Result<(), DistributionError> {
        validate_key(key)?;
        let path = self.file_path(key);

        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DistributionError::NotFound(key.to_string()));
            }
            Err(e) => {
                return Err(DistributionError::Delete {
                    key: key.to_string(),
                    message: e.to_string(),
                })
            }
        }

        // Drop the per-artifact directory once empty.
        if let Some(dir) = path.parent() {
            let _ = tokio::fs::remove_dir(dir).await;
        }

        tracing::info!(key = %key, backend = "local", "Artifact deleted");
        Ok(())
    }

    async fn download_file(&self, key: &str) -> Result<Bytes, DistributionError> {
        validate_key(key)?;
        match tokio::fs::read(self.file_path(key)).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(DistributionError::NotFound(key.to_string()))
            }
            Err(e) => Err(DistributionError::Io(e.to_string())),
        }
    }

    fn backend_name(&self) -> &'static str {
        "local"
    }
}

/// Readers see either the previous file or the complete new one.
fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "no parent directory"))?;
    std::fs::create_dir_all(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn round_trip_through_url() {
        let dir = tempdir().expect("tempdir");
        let store = LocalArtifactStore::new(dir.path().to_path_buf(), None).expect("store");
        let data = Bytes::from_static(b"\x1f\x8b archive bytes");

        store.upload_file("foo.tar.gz", data.clone()).await.expect("upload");

        let url = store.get_file_url("foo.tar.gz").expect("url");
        assert_eq!(url, store.get_file_url("foo.tar.gz").expect("url again"));
        let path = Url::parse(&url)
            .expect("file url")
            .to_file_path()
            .expect("file path");
        assert_eq!(std::fs::read(path).expect("read"), data.to_vec());
        assert_eq!(store.download_file("foo.tar.gz").await.expect("download"), data);
    }

    #[tokio::test]
    async fn upload_replaces_and_delete_removes() {
        let dir = tempdir().expect("tempdir");
        let store = LocalArtifactStore::new(
            dir.path().to_path_buf(),
            Some("https://cdn.example.com/plugins/".to_string()),
        )
        .expect("store");

        store
            .upload_file("monitor.tar.gz", Bytes::from_static(b"v1"))
            .await
            .expect("v1");
        store
            .upload_file("monitor.tar.gz", Bytes::from_static(b"v2"))
            .await
            .expect("v2");
        assert_eq!(
            store.download_file("monitor.tar.gz").await.expect("download"),
            Bytes::from_static(b"v2")
        );
        assert_eq!(
            store.get_file_url("monitor.tar.gz").expect("url"),
            "https://cdn.example.com/plugins/monitor/monitor.tar.gz"
        );

        store.delete_file("monitor.tar.gz").await.expect("delete");
        assert!(!dir.path().join("monitor").exists());
        assert!(matches!(
            store.delete_file("monitor.tar.gz").await,
            Err(DistributionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn traversal_keys_never_touch_disk() {
        let dir = tempdir().expect("tempdir");
        let store = LocalArtifactStore::new(dir.path().join("store"), None).expect("store");

        for key in ["../escape.tar.gz", "/abs.tar.gz"] {
            let err = store
                .upload_file(key, Bytes::from_static(b"x"))
                .await
                .expect_err(key);
            assert!(err.is_invalid_key());
        }
        assert!(!dir.path().join("store").exists());
        assert!(!dir.path().join("escape.tar.gz").exists());
    }
}
