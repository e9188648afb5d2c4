//! Package manifests
//!
//! A plugin archive is a gzip-compressed tarball with a `plugin.yml` (or
//! `plugin.yaml`) at its root. The manifest is the packaged version's
//! `PluginMetadata` in YAML.

use std::io::Read;
use std::path::{Component, Path};

use flate2::read::GzDecoder;

use crate::error::DistributionError;
use crate::plugins::types::PluginMetadata;

const MANIFEST_NAMES: [&str; 2] = ["plugin.yml", "plugin.yaml"];
const MAX_MANIFEST_BYTES: u64 = 64 * 1024;

/// Read the manifest of a `.tar.gz` archive held in memory, without unpacking
/// anything to disk.
pub fn read_manifest(archive: &[u8]) -> Result<PluginMetadata, DistributionError> {
    let mut tar = tar::Archive::new(GzDecoder::new(archive));
    let entries = tar.entries().map_err(unreadable)?;

    for entry in entries {
        let mut entry = entry.map_err(unreadable)?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let is_manifest = is_manifest_path(&entry.path().map_err(unreadable)?);
        if !is_manifest {
            continue;
        }
        if entry.size() > MAX_MANIFEST_BYTES {
            return Err(DistributionError::InvalidArchive(format!(
                "plugin.yml exceeds {} bytes",
                MAX_MANIFEST_BYTES
            )));
        }

        let mut content = String::new();
        entry.read_to_string(&mut content).map_err(|e| {
            DistributionError::InvalidArchive(format!("plugin.yml is not readable text: {}", e))
        })?;
        return parse_manifest(&content);
    }

    Err(DistributionError::InvalidArchive(
        "archive has no plugin.yml at its root".to_string(),
    ))
}

pub fn parse_manifest(content: &str) -> Result<PluginMetadata, DistributionError> {
    serde_yaml::from_str(content)
        .map_err(|e| DistributionError::InvalidArchive(format!("invalid plugin.yml: {}", e)))
}

/// `plugin.yml` or `./plugin.yml`; nested copies and macOS `._` forks don't count.
fn is_manifest_path(path: &Path) -> bool {
    let mut parts = path.components().filter(|c| !matches!(c, Component::CurDir));
    match (parts.next(), parts.next()) {
        (Some(Component::Normal(name)), None) => name
            .to_str()
            .is_some_and(|name| MANIFEST_NAMES.contains(&name)),
        _ => false,
    }
}

fn unreadable(err: std::io::Error) -> DistributionError {
    DistributionError::InvalidArchive(format!("not a readable .tar.gz archive: {}", err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::{write::GzEncoder, Compression};

    const MANIFEST: &str = "\
id: cluster-monitor
name: Cluster Monitor
version: 1.2.0
author: ops
description: Watches cluster health
endpoints:
  - method: GET
    path: /status
    handler: status
    permissions: [cluster.read]
permissions:
  - cluster.read
";

    fn archive(files: &[(&str, &str)]) -> Vec<u8> {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        for (path, content) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            builder
                .append_data(&mut header, path, content.as_bytes())
                .expect("append");
        }
        builder
            .into_inner()
            .expect("tar")
            .finish()
            .expect("gzip")
    }

    #[test]
    fn reads_manifest_from_archive_root() {
        let data = archive(&[
            ("README.md", "# monitor"),
            ("./plugin.yml", MANIFEST),
            ("bin/monitor", "binary"),
        ]);

        let metadata = read_manifest(&data).expect("manifest");
        assert_eq!(metadata.id, "cluster-monitor");
        assert_eq!(metadata.version, "1.2.0");
        assert_eq!(metadata.endpoints.len(), 1);
        assert_eq!(metadata.endpoints[0].permissions, vec!["cluster.read".to_string()]);
        assert_eq!(metadata.permissions, vec!["cluster.read".to_string()]);
    }

    #[test]
    fn yaml_extension_is_accepted() {
        let data = archive(&[("plugin.yaml", MANIFEST)]);
        assert_eq!(read_manifest(&data).expect("manifest").name, "Cluster Monitor");
    }

    #[test]
    fn archives_without_root_manifest_are_rejected() {
        let nested = archive(&[("monitor/plugin.yml", MANIFEST), ("._plugin.yml", "junk")]);
        let err = read_manifest(&nested).expect_err("nested manifest");
        assert!(err.to_string().contains("no plugin.yml"), "{err}");
    }

    #[test]
    fn malformed_input_is_rejected() {
        let err = read_manifest(b"definitely not gzip").expect_err("not an archive");
        assert!(matches!(err, DistributionError::InvalidArchive(_)), "{err}");

        let missing_fields = archive(&[("plugin.yml", "name: Nameless\n")]);
        let err = read_manifest(&missing_fields).expect_err("incomplete manifest");
        assert!(err.to_string().contains("invalid plugin.yml"), "{err}");
    }
}
