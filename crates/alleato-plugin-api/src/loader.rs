//! Plugin loading from a manifest URL or from in-memory source.
//!
//! The URL path fetches the manifest, resolves the entry relative to the
//! manifest's own URL, fetches the entry source under a size ceiling, and
//! evaluates it in a sandbox built for that manifest. The in-memory path
//! skips the network and the size ceiling, which only guards fetched code.

use crate::host::PluginHost;
use crate::plugin::Plugin;
use alleato_plugin_runtime::{
    Evaluator, HostEnvironment, LoaderOptions, PluginError, PluginManifest, PluginResult,
    SandboxBuilder, ScriptModule,
};
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;
use uuid::Uuid;

/// Ceiling on fetched entry source, in bytes.
pub const MAX_SOURCE_BYTES: usize = 5 * 1024 * 1024;

/// Loads plugins into evaluated, validated [`Plugin`] instances.
pub struct PluginLoader {
    client: reqwest::Client,

    /// Bindings the embedding host offers to sandboxes.
    environment: Arc<HostEnvironment>,
}

impl PluginLoader {
    /// A loader over the default host environment.
    pub fn new() -> Self {
        Self::with_environment(Arc::new(HostEnvironment::with_defaults()))
    }

    /// A loader over a caller-assembled host environment.
    pub fn with_environment(environment: Arc<HostEnvironment>) -> Self {
        Self {
            client: reqwest::Client::new(),
            environment,
        }
    }

    /// Load a plugin from a manifest URL.
    pub async fn load(&self, manifest_url: &str, options: &LoaderOptions) -> PluginResult<Plugin> {
        let base = Url::parse(manifest_url).map_err(|e| PluginError::Load {
            plugin_id: None,
            message: format!("invalid manifest URL '{manifest_url}': {e}"),
        })?;

        debug!(url = %base, "fetching plugin manifest");
        let manifest_text = self.fetch_text(&base, None, options).await?;
        // A manifest that fails to parse or validate is still a URL-path
        // failure: surface it under the loader's catch-all code.
        let manifest = PluginManifest::from_str(&manifest_text).map_err(|e| PluginError::Load {
            plugin_id: None,
            message: e.to_string(),
        })?;

        let entry_url = base.join(&manifest.entry).map_err(|e| PluginError::Load {
            plugin_id: Some(manifest.id().to_string()),
            message: format!("cannot resolve entry '{}': {e}", manifest.entry),
        })?;

        debug!(plugin = manifest.id(), url = %entry_url, "fetching plugin entry");
        let source = self
            .fetch_source(&entry_url, manifest.id(), options)
            .await?;

        let plugin = self.load_from_bytes(&source, manifest, options).await?;
        info!(
            plugin = plugin.id(),
            version = plugin.version(),
            hooks = plugin.hook_names().len(),
            "loaded plugin"
        );
        Ok(plugin)
    }

    /// Load a plugin from in-memory source under an already-parsed
    /// manifest.
    pub async fn load_from_code(
        &self,
        source: &str,
        manifest: PluginManifest,
        options: &LoaderOptions,
    ) -> PluginResult<Plugin> {
        self.load_from_bytes(source.as_bytes(), manifest, options)
            .await
    }

    /// Build a plugin from source text and a manifest assembled by the
    /// caller, without any network access.
    pub async fn create_inline_plugin(
        &self,
        source: &str,
        manifest_json: &str,
    ) -> PluginResult<Plugin> {
        let manifest = PluginManifest::from_str(manifest_json)?;
        self.load_from_code(source, manifest, &LoaderOptions::default())
            .await
    }

    async fn load_from_bytes(
        &self,
        bytes: &[u8],
        manifest: PluginManifest,
        options: &LoaderOptions,
    ) -> PluginResult<Plugin> {
        let plugin_id = manifest.id().to_string();

        let module = ScriptModule::parse(bytes).map_err(|e| PluginError::Evaluation {
            plugin_id: plugin_id.clone(),
            message: e.to_string(),
        })?;

        let host = Arc::new(
            PluginHost::new(plugin_id.clone(), manifest.permission_set())
                .with_fetch_timeout(options.fetch_timeout()),
        );

        let sandbox = SandboxBuilder::new(&self.environment, &manifest, options)
            .build(host.fetch_binding())?;
        let evaluator = Arc::new(Evaluator::new(Arc::new(module), sandbox));

        let exports = evaluator.evaluate_module().await.map_err(|e| match e {
            PluginError::Script(message) => PluginError::Evaluation {
                plugin_id: plugin_id.clone(),
                message,
            },
            other => other,
        })?;

        Plugin::from_exports(manifest, host, evaluator, exports)
    }

    // Non-success HTTP status is a fetch failure; anything below that
    // (connect, timeout, interrupted body) never produced a status and
    // falls under the loader's catch-all code.
    async fn fetch_text(
        &self,
        url: &Url,
        plugin_id: Option<&str>,
        options: &LoaderOptions,
    ) -> PluginResult<String> {
        let network_err = |e: reqwest::Error| PluginError::Load {
            plugin_id: plugin_id.map(str::to_string),
            message: e.to_string(),
        };

        let response = self
            .client
            .get(url.clone())
            .timeout(options.fetch_timeout())
            .send()
            .await
            .map_err(network_err)?;

        if !response.status().is_success() {
            return Err(PluginError::Fetch {
                plugin_id: plugin_id.map(str::to_string),
                status: response.status().to_string(),
            });
        }
        response.text().await.map_err(network_err)
    }

    async fn fetch_source(
        &self,
        url: &Url,
        plugin_id: &str,
        options: &LoaderOptions,
    ) -> PluginResult<Vec<u8>> {
        let network_err = |e: reqwest::Error| PluginError::Load {
            plugin_id: Some(plugin_id.to_string()),
            message: e.to_string(),
        };

        let response = self
            .client
            .get(url.clone())
            .timeout(options.fetch_timeout())
            .send()
            .await
            .map_err(network_err)?;

        if !response.status().is_success() {
            return Err(PluginError::Fetch {
                plugin_id: Some(plugin_id.to_string()),
                status: response.status().to_string(),
            });
        }

        // Checked both from the declared length and from the actual body:
        // a missing or lying Content-Length does not bypass the ceiling.
        if let Some(length) = response.content_length() {
            if length as usize > MAX_SOURCE_BYTES {
                return Err(PluginError::SizeLimitExceeded {
                    plugin_id: plugin_id.to_string(),
                });
            }
        }

        let bytes = response.bytes().await.map_err(network_err)?;
        if bytes.len() > MAX_SOURCE_BYTES {
            return Err(PluginError::SizeLimitExceeded {
                plugin_id: plugin_id.to_string(),
            });
        }
        Ok(bytes.to_vec())
    }
}

impl Default for PluginLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// A manifest for a throwaway test plugin, with a collision-free id of
/// the form `test-<name>-<uuid>`.
pub fn test_manifest(name: &str) -> PluginManifest {
    PluginManifest {
        entry: "plugin.apm".to_string(),
        metadata: alleato_plugin_runtime::PluginMetadata {
            id: format!("test-{name}-{}", Uuid::new_v4()),
            name: name.to_string(),
            version: "1.0.0".to_string(),
            description: None,
            author: None,
        },
        dependencies: alleato_plugin_runtime::manifest::PluginDependencies::default(),
        permissions: vec![],
        compatible_versions: alleato_plugin_runtime::CompatibleVersions {
            min: "1.0.0".to_string(),
            max: None,
        },
    }
}

/// A plugin with no handlers and a generated id, for registry tests and
/// host-side experiments. Attach handlers with
/// [`Plugin::with_native_hook`].
pub fn create_test_plugin(name: &str) -> Plugin {
    Plugin::empty(test_manifest(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest_json() -> String {
        serde_json::json!({
            "entry": "plugin.apm",
            "metadata": { "id": "inline-1", "name": "Inline", "version": "1.0.0" },
            "compatibleVersions": { "min": "1.0.0" }
        })
        .to_string()
    }

    fn exporting_source(priority: i64) -> String {
        serde_json::json!({
            "version": 1,
            "constants": [
                { "type": "String", "value": "priority" },
                { "type": "Int", "value": priority }
            ],
            "functions": [
                {
                    "name": "main",
                    "params": [],
                    "instructions": [
                        { "op": "LoadGlobal", "name": "exports" },
                        { "op": "LoadConst", "index": 0 },
                        { "op": "LoadConst", "index": 1 },
                        { "op": "SetIndex" }
                    ],
                    "local_count": 0
                },
                { "name": "noop", "params": [], "instructions": [], "local_count": 0 }
            ],
            "entry_point": "main"
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_create_inline_plugin() {
        let loader = PluginLoader::new();
        let plugin = loader
            .create_inline_plugin(&exporting_source(3), &manifest_json())
            .await
            .unwrap();
        assert_eq!(plugin.id(), "inline-1");
        assert_eq!(plugin.priority(), 3);
    }

    #[tokio::test]
    async fn test_malformed_source_is_evaluation_error() {
        let loader = PluginLoader::new();
        let err = loader
            .create_inline_plugin("not a module", &manifest_json())
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some("EVALUATION_ERROR"));
        assert_eq!(err.plugin_id(), Some("inline-1"));
    }

    #[tokio::test]
    async fn test_invalid_manifest_url() {
        let loader = PluginLoader::new();
        let err = loader
            .load("not a url", &LoaderOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some("LOAD_ERROR"));
        // No manifest was parsed, so there is no id to report.
        assert_eq!(err.plugin_id(), None);
        assert!(err.to_string().contains("not a url"));
    }

    #[tokio::test]
    async fn test_inline_bad_manifest_is_plain_error() {
        let loader = PluginLoader::new();
        let err = loader
            .create_inline_plugin(&exporting_source(0), "{ not json")
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::InvalidManifest(_)));
        assert_eq!(err.code(), None);
    }

    #[tokio::test]
    async fn test_minimal_exports_round_trip() {
        let source = serde_json::json!({
            "version": 1,
            "constants": [{ "type": "String", "value": "hooks" }],
            "functions": [{
                "name": "main",
                "params": [],
                "instructions": [
                    { "op": "LoadGlobal", "name": "module" },
                    { "op": "LoadConst", "index": 0 },
                    { "op": "MakeObject", "count": 0 },
                    { "op": "MakeObject", "count": 1 },
                    { "op": "SetProperty", "name": "exports" }
                ],
                "local_count": 0
            }],
            "entry_point": "main"
        })
        .to_string();
        let manifest = PluginManifest::from_str(
            r#"{
                "entry": "plugin.apm",
                "metadata": { "id": "p", "name": "P", "version": "1.0.0" },
                "compatibleVersions": { "min": "1.0.0" }
            }"#,
        )
        .unwrap();

        let loader = PluginLoader::new();
        let plugin = loader
            .load_from_code(&source, manifest, &LoaderOptions::default())
            .await
            .unwrap();
        assert_eq!(plugin.id(), "p");
        assert!(plugin.hook_names().is_empty());
        assert_eq!(plugin.priority(), 0);
    }

    #[test]
    fn test_test_plugin_ids_are_unique() {
        let a = create_test_plugin("audit");
        let b = create_test_plugin("audit");
        assert!(a.id().starts_with("test-audit-"));
        assert_ne!(a.id(), b.id());
    }

    #[tokio::test]
    async fn test_size_limit_is_fetch_path_only() {
        // An inline source larger than the ceiling still loads.
        let mut source = exporting_source(0);
        let padding = format!(
            ", \"padding\": \"{}\"",
            "x".repeat(MAX_SOURCE_BYTES)
        );
        source.insert_str(source.len() - 1, &padding);

        let loader = PluginLoader::new();
        let plugin = loader
            .create_inline_plugin(&source, &manifest_json())
            .await
            .unwrap();
        assert_eq!(plugin.id(), "inline-1");
    }
}
