//! Plugin registry: installation, lifecycle transitions, and hook
//! dispatch.
//!
//! The registry is an explicit store owned by the embedding host; there
//! is no process-wide singleton. Hooks dispatch to enabled plugins in
//! descending priority order, and one handler's failure never prevents
//! the remaining handlers from running.

use crate::plugin::{LifecyclePhase, Plugin};
use alleato_plugin_runtime::{PluginError, PluginResult, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Whether an installed plugin participates in hook dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginStatus {
    Enabled,
    Disabled,
}

struct PluginEntry {
    plugin: Arc<Plugin>,
    status: PluginStatus,
}

/// The result of one handler in a hook dispatch.
#[derive(Debug)]
pub struct HookOutcome {
    pub plugin_id: String,
    pub value: Value,
}

/// Registry of installed plugins for one host.
pub struct PluginRegistry {
    /// Version string plugins are matched against at install time.
    host_version: String,

    /// Installed plugins by id.
    plugins: HashMap<String, PluginEntry>,
}

impl PluginRegistry {
    /// Create a registry for a host reporting the given version.
    pub fn new(host_version: impl Into<String>) -> Self {
        Self {
            host_version: host_version.into(),
            plugins: HashMap::new(),
        }
    }

    pub fn host_version(&self) -> &str {
        &self.host_version
    }

    /// Install a plugin: reject duplicates and incompatible version
    /// ranges, run `onInstall`, and enable it.
    ///
    /// A failing `onInstall` leaves the registry unchanged.
    pub async fn install(&mut self, plugin: Plugin) -> PluginResult<()> {
        let id = plugin.id().to_string();
        if self.plugins.contains_key(&id) {
            return Err(PluginError::Load {
                plugin_id: Some(id),
                message: "plugin is already installed".to_string(),
            });
        }
        self.check_compatibility(&plugin)?;

        let api = plugin.host.api_object();
        plugin.run_lifecycle(LifecyclePhase::Install, vec![api]).await?;

        info!(plugin = %id, version = plugin.version(), "installed plugin");
        self.plugins.insert(
            id,
            PluginEntry {
                plugin: Arc::new(plugin),
                status: PluginStatus::Enabled,
            },
        );
        Ok(())
    }

    /// Enable a plugin. Runs `onEnable` first; a failing handler leaves
    /// the plugin disabled.
    pub async fn enable(&mut self, id: &str) -> PluginResult<()> {
        let plugin = self.get_required(id)?;
        if self.status(id) == Some(PluginStatus::Enabled) {
            return Ok(());
        }

        let api = plugin.host.api_object();
        plugin.run_lifecycle(LifecyclePhase::Enable, vec![api]).await?;

        if let Some(entry) = self.plugins.get_mut(id) {
            entry.status = PluginStatus::Enabled;
        }
        info!(plugin = %id, "enabled plugin");
        Ok(())
    }

    /// Disable a plugin. `onDisable` failures are logged, and the plugin
    /// is disabled regardless, so a faulty handler cannot keep itself
    /// running.
    pub async fn disable(&mut self, id: &str) -> PluginResult<()> {
        let plugin = self.get_required(id)?;

        let api = plugin.host.api_object();
        if let Err(e) = plugin.run_lifecycle(LifecyclePhase::Disable, vec![api]).await {
            warn!(plugin = %id, error = %e, "onDisable handler failed");
        }

        if let Some(entry) = self.plugins.get_mut(id) {
            entry.status = PluginStatus::Disabled;
        }
        info!(plugin = %id, "disabled plugin");
        Ok(())
    }

    /// Uninstall a plugin. `onUninstall` failures are logged, and the
    /// plugin is removed regardless.
    pub async fn uninstall(&mut self, id: &str) -> PluginResult<()> {
        let plugin = self.get_required(id)?;

        let api = plugin.host.api_object();
        if let Err(e) = plugin
            .run_lifecycle(LifecyclePhase::Uninstall, vec![api])
            .await
        {
            warn!(plugin = %id, error = %e, "onUninstall handler failed");
        }

        self.plugins.remove(id);
        info!(plugin = %id, "uninstalled plugin");
        Ok(())
    }

    /// Replace an installed plugin with a new build. Runs the incoming
    /// plugin's `onUpdate` with the previous version string; a failing
    /// handler keeps the old plugin in place. The enabled/disabled state
    /// carries over.
    pub async fn update(&mut self, plugin: Plugin) -> PluginResult<()> {
        let id = plugin.id().to_string();
        let previous = self.get_required(&id)?;
        let previous_version = previous.version().to_string();
        self.check_compatibility(&plugin)?;

        let api = plugin.host.api_object();
        plugin
            .run_lifecycle(
                LifecyclePhase::Update,
                vec![Value::string(previous_version.clone()), api],
            )
            .await?;

        let status = self.status(&id).unwrap_or(PluginStatus::Enabled);
        info!(
            plugin = %id,
            from = %previous_version,
            to = plugin.version(),
            "updated plugin"
        );
        self.plugins.insert(
            id,
            PluginEntry {
                plugin: Arc::new(plugin),
                status,
            },
        );
        Ok(())
    }

    /// Dispatch a hook to every enabled plugin that registered it, in
    /// descending priority order (ties break on plugin id for a stable
    /// order). Handler failures are logged and skipped.
    pub async fn execute_hooks(&self, hook: &str, context: &Value) -> Vec<HookOutcome> {
        let mut targets: Vec<&Arc<Plugin>> = self
            .plugins
            .values()
            .filter(|entry| entry.status == PluginStatus::Enabled)
            .map(|entry| &entry.plugin)
            .filter(|plugin| plugin.has_hook(hook))
            .collect();
        targets.sort_by(|a, b| {
            b.priority()
                .cmp(&a.priority())
                .then_with(|| a.id().cmp(b.id()))
        });

        let mut outcomes = Vec::new();
        for plugin in targets {
            let Some(handler) = plugin.hook(hook) else {
                continue;
            };
            let api = plugin.host.api_object();
            match handler.invoke(vec![context.clone(), api]).await {
                Ok(value) => outcomes.push(HookOutcome {
                    plugin_id: plugin.id().to_string(),
                    value,
                }),
                Err(e) => {
                    warn!(plugin = plugin.id(), hook, error = %e, "hook handler failed");
                }
            }
        }
        outcomes
    }

    pub fn get(&self, id: &str) -> Option<&Arc<Plugin>> {
        self.plugins.get(id).map(|entry| &entry.plugin)
    }

    pub fn status(&self, id: &str) -> Option<PluginStatus> {
        self.plugins.get(id).map(|entry| entry.status)
    }

    pub fn is_enabled(&self, id: &str) -> bool {
        self.status(id) == Some(PluginStatus::Enabled)
    }

    pub fn plugin_ids(&self) -> Vec<String> {
        self.plugins.keys().cloned().collect()
    }

    pub fn plugin_count(&self) -> usize {
        self.plugins.len()
    }

    /// List installed plugins.
    pub fn list(&self) -> Vec<PluginInfo> {
        self.plugins
            .values()
            .map(|entry| PluginInfo {
                id: entry.plugin.id().to_string(),
                name: entry.plugin.name().to_string(),
                version: entry.plugin.version().to_string(),
                status: entry.status,
            })
            .collect()
    }

    fn get_required(&self, id: &str) -> PluginResult<Arc<Plugin>> {
        self.plugins
            .get(id)
            .map(|entry| Arc::clone(&entry.plugin))
            .ok_or_else(|| PluginError::NotFound(id.to_string()))
    }

    fn check_compatibility(&self, plugin: &Plugin) -> PluginResult<()> {
        let range = &plugin.manifest.compatible_versions;
        if range.accepts(&self.host_version) {
            return Ok(());
        }
        let required = match &range.max {
            Some(max) => format!("{} to {}", range.min, max),
            None => format!("{} or newer", range.min),
        };
        Err(PluginError::Incompatible {
            plugin_id: plugin.id().to_string(),
            required,
            host_version: self.host_version.clone(),
        })
    }
}

/// Information about an installed plugin.
#[derive(Debug, Clone)]
pub struct PluginInfo {
    pub id: String,
    pub name: String,
    pub version: String,
    pub status: PluginStatus,
}
