//! Plugin manifest parsing.
//!
//! Each plugin is described by a JSON manifest document (camelCase field
//! names on the wire) carrying its identity, entry point, declared
//! dependencies, permissions, and host-version compatibility range. The
//! manifest is immutable once fetched and is authoritative for the
//! plugin's identity: the evaluated module never overrides it.

use crate::error::{PluginError, PluginResult};
use crate::permission::PermissionSet;
use serde::{Deserialize, Serialize};
use url::Url;

/// Plugin manifest structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginManifest {
    /// Entry point path, resolved relative to the manifest's own URL.
    pub entry: String,

    /// Plugin identity and descriptive metadata.
    pub metadata: PluginMetadata,

    /// Host facilities the plugin depends on.
    #[serde(default)]
    pub dependencies: PluginDependencies,

    /// Declared permission strings (see [`crate::permission::Permission`]).
    #[serde(default)]
    pub permissions: Vec<String>,

    /// Host versions this plugin supports.
    pub compatible_versions: CompatibleVersions,
}

/// Plugin identity metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginMetadata {
    /// Unique identifier for the plugin.
    pub id: String,

    /// Human-readable name.
    pub name: String,

    /// Version string.
    pub version: String,

    /// Plugin description.
    #[serde(default)]
    pub description: Option<String>,

    /// Plugin author.
    #[serde(default)]
    pub author: Option<PluginAuthor>,
}

/// Plugin author details.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginAuthor {
    pub name: String,

    #[serde(default)]
    pub email: Option<String>,

    #[serde(default)]
    pub url: Option<String>,
}

/// Host facilities a plugin declares a dependency on.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginDependencies {
    /// Expose the host's UI bindings to the plugin sandbox (best-effort).
    #[serde(default)]
    pub ui: bool,
}

/// Host-version range a plugin is compatible with.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompatibleVersions {
    /// Minimum supported host version (inclusive).
    pub min: String,

    /// Maximum supported host version (inclusive), unbounded if absent.
    #[serde(default)]
    pub max: Option<String>,
}

impl CompatibleVersions {
    /// Check whether a host version falls inside the declared range.
    ///
    /// Versions compare as dotted numeric components; a missing component
    /// counts as zero and anything after a `-` is ignored.
    pub fn accepts(&self, host_version: &str) -> bool {
        let host = parse_version(host_version);
        if host < parse_version(&self.min) {
            return false;
        }
        if let Some(max) = &self.max {
            if host > parse_version(max) {
                return false;
            }
        }
        true
    }
}

fn parse_version(version: &str) -> Vec<u64> {
    let base = version.split('-').next().unwrap_or(version);
    let mut parts: Vec<u64> = base
        .split('.')
        .map(|p| p.trim().parse().unwrap_or(0))
        .collect();
    while parts.len() < 3 {
        parts.push(0);
    }
    parts
}

impl PluginManifest {
    /// Parse a manifest from a JSON string.
    pub fn from_str(content: &str) -> PluginResult<Self> {
        let manifest: PluginManifest = serde_json::from_str(content)
            .map_err(|e| PluginError::InvalidManifest(e.to_string()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Validate the manifest for required fields.
    pub fn validate(&self) -> PluginResult<()> {
        if self.metadata.id.is_empty() {
            return Err(PluginError::InvalidManifest(
                "plugin id cannot be empty".to_string(),
            ));
        }
        if self.metadata.name.is_empty() {
            return Err(PluginError::InvalidManifest(
                "plugin name cannot be empty".to_string(),
            ));
        }
        if self.metadata.version.is_empty() {
            return Err(PluginError::InvalidManifest(
                "plugin version cannot be empty".to_string(),
            ));
        }
        if self.entry.is_empty() {
            return Err(PluginError::InvalidManifest(
                "entry point cannot be empty".to_string(),
            ));
        }
        // Entry is always resolved against the manifest URL.
        if Url::parse(&self.entry).is_ok() {
            return Err(PluginError::InvalidManifest(format!(
                "entry must be a relative path, got absolute URL '{}'",
                self.entry
            )));
        }
        Ok(())
    }

    /// The permission set declared by this manifest.
    pub fn permission_set(&self) -> PermissionSet {
        PermissionSet::from_strings(&self.permissions)
    }

    /// The plugin's id.
    pub fn id(&self) -> &str {
        &self.metadata.id
    }
}
