//! Static checks on plugin metadata and configuration.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;
use semver::{Version, VersionReq};

use super::types::{PluginConfig, PluginMetadata};
use crate::error::PluginSystemError;

const MAX_ENDPOINTS: usize = 50;
const MAX_DEPENDENCIES: usize = 20;
const MAX_PERMISSIONS: usize = 30;
const MAX_NAME_LEN: usize = 100;
const MAX_DESCRIPTION_LEN: usize = 500;
const MAX_CONFIG_STRING_LEN: usize = 1000;

const SUPPORTED_METHODS: &[&str] = &["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS"];

const PERMISSION_RESOURCES: &[&str] = &[
    "cluster",
    "configmap",
    "secret",
    "namespace",
    "deployment",
    "service",
    "ingress",
    "pod",
    "node",
];
const PERMISSION_ACTIONS: &[&str] = &["read", "write", "delete"];
const SYSTEM_PERMISSIONS: &[&str] = &["admin.all", "system.metrics", "system.logs"];

static PLUGIN_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9_-]{3,50}$").expect("valid plugin id regex"));
static HANDLER_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z][a-zA-Z0-9_]*$").expect("valid handler regex"));
static PERMISSION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z0-9_]+\.[a-zA-Z0-9_]+$").expect("valid permission regex")
});
static CONFIG_KEY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z][a-zA-Z0-9_.]*$").expect("valid config key regex"));

/// True when `permission` is one of the capabilities a plugin may declare.
pub fn is_allowed_permission(permission: &str) -> bool {
    if SYSTEM_PERMISSIONS.contains(&permission) {
        return true;
    }
    match permission.split_once('.') {
        Some((resource, action)) => {
            PERMISSION_RESOURCES.contains(&resource) && PERMISSION_ACTIONS.contains(&action)
        }
        None => false,
    }
}

pub fn is_valid_plugin_id(id: &str) -> bool {
    PLUGIN_ID_RE.is_match(id)
}

/// Validate everything that can be checked without other plugins.
///
/// Permission problems are reported as `Permission`, everything else as `Validation`.
pub fn validate_metadata(
    metadata: &PluginMetadata,
    host_version: &Version,
) -> Result<(), PluginSystemError> {
    let id = metadata.id.as_str();
    let invalid = |message: String| PluginSystemError::validation(id, message);

    if id.is_empty() {
        return Err(invalid("plugin ID is required".to_string()));
    }
    if !is_valid_plugin_id(id) {
        return Err(invalid(
            "plugin ID must be 3-50 alphanumeric characters, dashes, or underscores".to_string(),
        ));
    }
    if metadata.name.trim().is_empty() {
        return Err(invalid("plugin name is required".to_string()));
    }
    if metadata.name.chars().count() > MAX_NAME_LEN {
        return Err(invalid(format!(
            "plugin name exceeds {} characters",
            MAX_NAME_LEN
        )));
    }
    if metadata.author.trim().is_empty() {
        return Err(invalid("plugin author is required".to_string()));
    }
    if metadata.description.chars().count() > MAX_DESCRIPTION_LEN {
        return Err(invalid(format!(
            "plugin description exceeds {} characters",
            MAX_DESCRIPTION_LEN
        )));
    }
    Version::parse(&metadata.version).map_err(|e| {
        invalid(format!(
            "plugin version '{}' is not semantic versioning: {}",
            metadata.version, e
        ))
    })?;

    validate_compatibility(metadata, host_version).map_err(invalid)?;
    validate_endpoints(metadata).map_err(invalid)?;
    validate_dependencies(metadata).map_err(invalid)?;
    validate_permissions(metadata).map_err(|message| PluginSystemError::Permission {
        plugin_id: id.to_string(),
        message,
    })?;

    Ok(())
}

fn validate_compatibility(metadata: &PluginMetadata, host: &Version) -> Result<(), String> {
    let parse = |label: &str, raw: &Option<String>| -> Result<Option<Version>, String> {
        raw.as_deref()
            .map(|v| {
                Version::parse(v).map_err(|e| format!("{} '{}' is not a valid version: {}", label, v, e))
            })
            .transpose()
    };

    let min = parse("min_host_version", &metadata.min_host_version)?;
    let max = parse("max_host_version", &metadata.max_host_version)?;

    if let (Some(min), Some(max)) = (&min, &max) {
        if min > max {
            return Err(format!(
                "min_host_version {} is greater than max_host_version {}",
                min, max
            ));
        }
    }
    if let Some(min) = &min {
        if host < min {
            return Err(format!("requires host version >= {}, running {}", min, host));
        }
    }
    if let Some(max) = &max {
        if host > max {
            return Err(format!("requires host version <= {}, running {}", max, host));
        }
    }
    Ok(())
}

fn validate_endpoints(metadata: &PluginMetadata) -> Result<(), String> {
    let endpoints = &metadata.endpoints;
    if endpoints.is_empty() {
        return Err("at least one endpoint is required".to_string());
    }
    if endpoints.len() > MAX_ENDPOINTS {
        return Err(format!(
            "too many endpoints ({}), maximum allowed is {}",
            endpoints.len(),
            MAX_ENDPOINTS
        ));
    }

    let mut seen_routes = HashSet::new();
    let mut seen_handlers = HashSet::new();

    for (i, endpoint) in endpoints.iter().enumerate() {
        let method = endpoint.method.to_ascii_uppercase();
        if !SUPPORTED_METHODS.contains(&method.as_str()) {
            return Err(format!(
                "endpoint {}: unsupported HTTP method '{}'",
                i, endpoint.method
            ));
        }

        validate_endpoint_path(&endpoint.path).map_err(|e| format!("endpoint {}: {}", i, e))?;

        if !HANDLER_NAME_RE.is_match(&endpoint.handler) {
            return Err(format!(
                "endpoint {}: invalid handler name '{}'",
                i, endpoint.handler
            ));
        }
        if !seen_routes.insert((method.clone(), endpoint.path.clone())) {
            return Err(format!(
                "endpoint {}: duplicate route '{} {}'",
                i, method, endpoint.path
            ));
        }
        if !seen_handlers.insert(endpoint.handler.as_str()) {
            return Err(format!(
                "endpoint {}: duplicate handler name '{}'",
                i, endpoint.handler
            ));
        }
        for permission in &endpoint.permissions {
            if !PERMISSION_RE.is_match(permission) {
                return Err(format!(
                    "endpoint {}: invalid permission format '{}'",
                    i, permission
                ));
            }
        }
    }
    Ok(())
}

fn validate_endpoint_path(path: &str) -> Result<(), String> {
    if path.is_empty() {
        return Err("path is required".to_string());
    }
    if !path.starts_with('/') {
        return Err(format!("path '{}' must start with '/'", path));
    }
    if path.contains("..") || path.contains("//") {
        return Err(format!("path '{}' contains traversal or empty segments", path));
    }
    if path.chars().any(char::is_whitespace) {
        return Err(format!("path '{}' contains whitespace", path));
    }
    Ok(())
}

fn validate_dependencies(metadata: &PluginMetadata) -> Result<(), String> {
    if metadata.dependencies.len() > MAX_DEPENDENCIES {
        return Err(format!(
            "too many dependencies ({}), maximum allowed is {}",
            metadata.dependencies.len(),
            MAX_DEPENDENCIES
        ));
    }
    for dependency in &metadata.dependencies {
        if dependency.name.trim().is_empty() {
            return Err("dependency name cannot be empty".to_string());
        }
        VersionReq::parse(&dependency.version).map_err(|e| {
            format!(
                "dependency '{}' has invalid version requirement '{}': {}",
                dependency.name, dependency.version, e
            )
        })?;
    }
    Ok(())
}

fn validate_permissions(metadata: &PluginMetadata) -> Result<(), String> {
    if metadata.permissions.len() > MAX_PERMISSIONS {
        return Err(format!(
            "too many permissions ({}), maximum allowed is {}",
            metadata.permissions.len(),
            MAX_PERMISSIONS
        ));
    }
    for permission in &metadata.permissions {
        if !PERMISSION_RE.is_match(permission) {
            return Err(format!("invalid permission format '{}'", permission));
        }
        if !is_allowed_permission(permission) {
            return Err(format!("permission '{}' is not allowed", permission));
        }
    }
    Ok(())
}

/// Check that every required dependency is satisfied.
///
/// A dependency matches a registered plugin `(id, version)` whose version meets the
/// requirement, or an executable of the same name on `PATH`.
pub fn check_dependencies(
    metadata: &PluginMetadata,
    registered: &[(String, String)],
) -> Result<(), PluginSystemError> {
    for dependency in metadata.dependencies.iter().filter(|d| d.required) {
        let requirement = VersionReq::parse(&dependency.version).map_err(|e| {
            PluginSystemError::validation(&metadata.id, format!("dependency '{}': {}", dependency.name, e))
        })?;

        let satisfied_by_plugin = registered.iter().any(|(id, version)| {
            id == &dependency.name
                && Version::parse(version)
                    .map(|v| requirement.matches(&v))
                    .unwrap_or(false)
        });

        if !satisfied_by_plugin && which::which(&dependency.name).is_err() {
            return Err(PluginSystemError::validation(
                &metadata.id,
                format!(
                    "required dependency '{}' ({}) is not available",
                    dependency.name, dependency.version
                ),
            ));
        }
    }
    Ok(())
}

/// Validate a plugin configuration table: key format, no nulls, bounded strings.
pub fn validate_config(plugin_id: &str, config: &PluginConfig) -> Result<(), PluginSystemError> {
    validate_config_map(config)
        .map_err(|message| PluginSystemError::validation(plugin_id, format!("config: {}", message)))
}

fn validate_config_map(config: &PluginConfig) -> Result<(), String> {
    for (key, value) in config {
        if !CONFIG_KEY_RE.is_match(key) {
            return Err(format!("invalid configuration key format: '{}'", key));
        }
        match value {
            serde_json::Value::Null => {
                return Err(format!("value for key '{}' cannot be null", key));
            }
            serde_json::Value::String(s) if s.chars().count() > MAX_CONFIG_STRING_LEN => {
                return Err(format!(
                    "string value for key '{}' exceeds {} characters",
                    key, MAX_CONFIG_STRING_LEN
                ));
            }
            serde_json::Value::Object(nested) => {
                validate_config_map(nested).map_err(|e| format!("in '{}': {}", key, e))?;
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::types::PluginDependency;

    fn host() -> Version {
        Version::parse("1.4.0").expect("host version")
    }

    fn metadata(id: &str) -> PluginMetadata {
        PluginMetadata::new(id, "Sample", "1.0.0", "tests").with_endpoint("GET", "/data", "get_data")
    }

    #[test]
    fn accepts_well_formed_metadata() {
        let meta = metadata("sample-plugin").with_permission("cluster.read");
        validate_metadata(&meta, &host()).expect("metadata should be valid");
    }

    #[test]
    fn rejects_bad_ids_and_versions() {
        assert!(validate_metadata(&metadata("ab"), &host()).is_err());
        assert!(validate_metadata(&metadata("has space"), &host()).is_err());

        let mut meta = metadata("sample");
        meta.version = "1.0".to_string();
        assert!(matches!(
            validate_metadata(&meta, &host()),
            Err(PluginSystemError::Validation { .. })
        ));
    }

    #[test]
    fn unknown_permission_is_a_permission_error() {
        let meta = metadata("sample").with_permission("cluster.explode");
        assert!(matches!(
            validate_metadata(&meta, &host()),
            Err(PluginSystemError::Permission { .. })
        ));

        assert!(is_allowed_permission("secret.delete"));
        assert!(is_allowed_permission("system.logs"));
        assert!(!is_allowed_permission("system.shutdown"));
    }

    #[test]
    fn rejects_duplicate_routes_and_handlers() {
        let meta = metadata("sample").with_endpoint("get", "/data", "other_handler");
        let err = validate_metadata(&meta, &host()).expect_err("duplicate route");
        assert!(err.to_string().contains("duplicate route"));

        let meta = metadata("sample").with_endpoint("POST", "/data", "get_data");
        let err = validate_metadata(&meta, &host()).expect_err("duplicate handler");
        assert!(err.to_string().contains("duplicate handler"));
    }

    #[test]
    fn rejects_unsafe_paths_and_methods() {
        let bad_paths = ["data", "/a/../b", "/a//b", "/a b"];
        for path in bad_paths {
            let meta = PluginMetadata::new("sample", "Sample", "1.0.0", "tests")
                .with_endpoint("GET", path, "handler");
            assert!(validate_metadata(&meta, &host()).is_err(), "{path} accepted");
        }

        let meta = PluginMetadata::new("sample", "Sample", "1.0.0", "tests")
            .with_endpoint("TRACE", "/data", "handler");
        assert!(validate_metadata(&meta, &host()).is_err());

        let meta = PluginMetadata::new("sample", "Sample", "1.0.0", "tests");
        assert!(validate_metadata(&meta, &host()).is_err());
    }

    #[test]
    fn enforces_host_compatibility_range() {
        let mut meta = metadata("sample");
        meta.min_host_version = Some("1.0.0".to_string());
        meta.max_host_version = Some("1.9.9".to_string());
        validate_metadata(&meta, &host()).expect("host within range");

        meta.min_host_version = Some("2.0.0".to_string());
        meta.max_host_version = None;
        let err = validate_metadata(&meta, &host()).expect_err("host too old");
        assert!(err.to_string().contains(">= 2.0.0"));
    }

    #[test]
    fn required_dependency_must_be_registered_with_matching_version() {
        let mut meta = metadata("consumer");
        meta.dependencies.push(PluginDependency {
            name: "provider-plugin-that-is-not-a-binary".to_string(),
            version: "^1.2".to_string(),
            required: true,
        });

        let registered = vec![(
            "provider-plugin-that-is-not-a-binary".to_string(),
            "1.3.0".to_string(),
        )];
        check_dependencies(&meta, &registered).expect("dependency satisfied");

        let outdated = vec![(
            "provider-plugin-that-is-not-a-binary".to_string(),
            "1.1.0".to_string(),
        )];
        assert!(check_dependencies(&meta, &outdated).is_err());

        meta.dependencies[0].required = false;
        check_dependencies(&meta, &[]).expect("optional dependency ignored");
    }

    #[test]
    fn validates_config_keys_and_values() {
        let good: PluginConfig = serde_json::from_value(serde_json::json!({
            "namespace": "default",
            "limits": { "max.items": 10 }
        }))
        .expect("config map");
        validate_config("sample", &good).expect("config should be valid");

        let bad_key: PluginConfig =
            serde_json::from_value(serde_json::json!({ "9lives": true })).expect("config map");
        assert!(validate_config("sample", &bad_key).is_err());

        let null_value: PluginConfig =
            serde_json::from_value(serde_json::json!({ "nested": { "key": null } }))
                .expect("config map");
        assert!(validate_config("sample", &null_value).is_err());
    }
}
