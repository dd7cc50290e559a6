//! Plugin instances and the structural validation of evaluated exports.
//!
//! A module that evaluated cleanly still has to look like a plugin: an
//! object whose `hooks` and `lifecycle` entries are callable, with
//! lifecycle keys drawn from the known phase names. Identity always comes
//! from the manifest; nothing the module exports can override it.

use crate::host::PluginHost;
use alleato_plugin_runtime::{
    Evaluator, HostFunction, PluginError, PluginManifest, PluginResult, PermissionSet, Value,
};
use std::collections::HashMap;
use std::sync::Arc;

/// The lifecycle phases a plugin may handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecyclePhase {
    Install,
    Enable,
    Disable,
    Uninstall,
    Update,
}

impl LifecyclePhase {
    pub const ALL: [LifecyclePhase; 5] = [
        LifecyclePhase::Install,
        LifecyclePhase::Enable,
        LifecyclePhase::Disable,
        LifecyclePhase::Uninstall,
        LifecyclePhase::Update,
    ];

    /// The export key for this phase.
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecyclePhase::Install => "onInstall",
            LifecyclePhase::Enable => "onEnable",
            LifecyclePhase::Disable => "onDisable",
            LifecyclePhase::Uninstall => "onUninstall",
            LifecyclePhase::Update => "onUpdate",
        }
    }

    /// Parse an export key into a phase.
    pub fn parse(key: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|p| p.as_str() == key)
    }
}

/// A callable registered by a plugin, either script or native.
#[derive(Clone)]
pub enum Handler {
    /// A function exported by the plugin's evaluated module.
    Script {
        evaluator: Arc<Evaluator>,
        callee: Value,
    },

    /// A host-side function, used by inline and test plugins.
    Native(Arc<dyn HostFunction>),
}

impl Handler {
    pub fn native(function: impl HostFunction + 'static) -> Self {
        Handler::Native(Arc::new(function))
    }

    /// Invoke the handler.
    pub async fn invoke(&self, args: Vec<Value>) -> PluginResult<Value> {
        match self {
            Handler::Script { evaluator, callee } => evaluator.call_value(callee, args).await,
            Handler::Native(function) => function.invoke(args).await,
        }
    }
}

/// Lifecycle handlers keyed by phase.
#[derive(Clone, Default)]
pub struct Lifecycle {
    handlers: HashMap<LifecyclePhase, Handler>,
}

impl Lifecycle {
    pub fn get(&self, phase: LifecyclePhase) -> Option<&Handler> {
        self.handlers.get(&phase)
    }

    pub fn set(&mut self, phase: LifecyclePhase, handler: Handler) {
        self.handlers.insert(phase, handler);
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// A loaded, validated plugin.
pub struct Plugin {
    /// The manifest the plugin was loaded under. Authoritative for
    /// identity.
    pub manifest: PluginManifest,

    /// Host services bound to this plugin.
    pub host: Arc<PluginHost>,

    /// Hook handlers by hook name.
    hooks: HashMap<String, Handler>,

    /// UI component factories by slot name.
    components: HashMap<String, Handler>,

    /// Lifecycle handlers.
    lifecycle: Lifecycle,

    /// Dispatch priority; higher runs earlier.
    priority: i64,
}

impl std::fmt::Debug for Plugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plugin")
            .field("manifest", &self.manifest)
            .field("hooks", &self.hooks.keys().collect::<Vec<_>>())
            .field("components", &self.components.keys().collect::<Vec<_>>())
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

impl Plugin {
    /// A plugin with no handlers, for building test and inline plugins.
    pub fn empty(manifest: PluginManifest) -> Self {
        let host = Arc::new(PluginHost::new(
            manifest.id().to_string(),
            manifest.permission_set(),
        ));
        Self {
            manifest,
            host,
            hooks: HashMap::new(),
            components: HashMap::new(),
            lifecycle: Lifecycle::default(),
            priority: 0,
        }
    }

    /// Validate evaluated module exports into a plugin.
    pub fn from_exports(
        manifest: PluginManifest,
        host: Arc<PluginHost>,
        evaluator: Arc<Evaluator>,
        exports: Value,
    ) -> PluginResult<Self> {
        let exports = exports
            .as_object()
            .ok_or_else(|| {
                PluginError::Validation(format!(
                    "plugin must evaluate to an object, got {}",
                    exports.type_name()
                ))
            })?
            .clone();

        let mut hooks = HashMap::new();
        if let Some(exported) = exports.get("hooks") {
            let exported = exported.as_object().ok_or_else(|| {
                PluginError::Validation("hooks must be an object".to_string())
            })?;
            for (name, value) in exported.entries() {
                if !value.is_callable() {
                    return Err(PluginError::Validation(format!(
                        "hook '{name}' is not a function"
                    )));
                }
                hooks.insert(
                    name,
                    Handler::Script {
                        evaluator: Arc::clone(&evaluator),
                        callee: value,
                    },
                );
            }
        }

        let mut components = HashMap::new();
        if let Some(exported) = exports.get("components") {
            let exported = exported.as_object().ok_or_else(|| {
                PluginError::Validation("components must be an object".to_string())
            })?;
            for (name, value) in exported.entries() {
                // Null slots are tolerated and dropped.
                if value.is_null() {
                    continue;
                }
                if !value.is_callable() {
                    return Err(PluginError::Validation(format!(
                        "component '{name}' is not a function"
                    )));
                }
                components.insert(
                    name,
                    Handler::Script {
                        evaluator: Arc::clone(&evaluator),
                        callee: value,
                    },
                );
            }
        }

        let mut lifecycle = Lifecycle::default();
        if let Some(exported) = exports.get("lifecycle") {
            let exported = exported.as_object().ok_or_else(|| {
                PluginError::Validation("lifecycle must be an object".to_string())
            })?;
            for (key, value) in exported.entries() {
                let phase = LifecyclePhase::parse(&key).ok_or_else(|| {
                    PluginError::Validation(format!("unknown lifecycle method: {key}"))
                })?;
                if !value.is_callable() {
                    return Err(PluginError::Validation(format!(
                        "lifecycle method '{key}' is not a function"
                    )));
                }
                lifecycle.set(
                    phase,
                    Handler::Script {
                        evaluator: Arc::clone(&evaluator),
                        callee: value,
                    },
                );
            }
        }

        let priority = match exports.get("priority") {
            None | Some(Value::Null) => 0,
            Some(Value::Int(p)) => p,
            Some(other) => {
                return Err(PluginError::Validation(format!(
                    "priority must be an integer, got {}",
                    other.type_name()
                )))
            }
        };

        Ok(Self {
            manifest,
            host,
            hooks,
            components,
            lifecycle,
            priority,
        })
    }

    /// Register a native hook handler. For test and inline plugins.
    pub fn with_native_hook(
        mut self,
        name: impl Into<String>,
        function: impl HostFunction + 'static,
    ) -> Self {
        self.hooks.insert(name.into(), Handler::native(function));
        self
    }

    /// Register a native lifecycle handler. For test and inline plugins.
    pub fn with_native_lifecycle(
        mut self,
        phase: LifecyclePhase,
        function: impl HostFunction + 'static,
    ) -> Self {
        self.lifecycle.set(phase, Handler::native(function));
        self
    }

    /// Set the dispatch priority.
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn id(&self) -> &str {
        self.manifest.id()
    }

    pub fn name(&self) -> &str {
        &self.manifest.metadata.name
    }

    pub fn version(&self) -> &str {
        &self.manifest.metadata.version
    }

    pub fn permissions(&self) -> PermissionSet {
        self.manifest.permission_set()
    }

    pub fn priority(&self) -> i64 {
        self.priority
    }

    pub fn hook(&self, name: &str) -> Option<&Handler> {
        self.hooks.get(name)
    }

    pub fn has_hook(&self, name: &str) -> bool {
        self.hooks.contains_key(name)
    }

    pub fn hook_names(&self) -> Vec<String> {
        self.hooks.keys().cloned().collect()
    }

    pub fn component(&self, name: &str) -> Option<&Handler> {
        self.components.get(name)
    }

    pub fn component_names(&self) -> Vec<String> {
        self.components.keys().cloned().collect()
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    /// Run a lifecycle handler if the plugin registered one.
    pub async fn run_lifecycle(&self, phase: LifecyclePhase, args: Vec<Value>) -> PluginResult<Value> {
        match self.lifecycle.get(phase) {
            Some(handler) => handler.invoke(args).await,
            None => Ok(Value::Null),
        }
    }
}
