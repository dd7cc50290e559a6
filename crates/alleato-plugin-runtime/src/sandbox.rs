//! Sandbox construction for plugin evaluation.
//!
//! A sandbox is the flat table of named bindings visible to evaluated
//! plugin code; the evaluator resolves free names against it and nothing
//! else. Bindings are copied from a [`HostEnvironment`], an explicit
//! registry of what the embedding host actually provides, filtered
//! through a fixed allow-list. This is name-based capability restriction
//! by explicit injection, not an isolate: a leaked reference inside a
//! binding still reaches whatever that binding closes over. Strong
//! isolation is a non-goal of this mechanism.

use crate::error::{PluginError, PluginResult};
use crate::manifest::PluginManifest;
use crate::value::{HostFunction, NativeFunction, Value};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Fetch-stage timeout applied when the caller does not override it.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_millis(5000);

/// Binding names copied into every sandbox when the environment provides
/// them. Names absent from the environment are silently omitted, never
/// invented.
pub const SAFE_GLOBALS: &[&str] = &[
    "log",
    "warn",
    "error",
    "now_millis",
    "delay",
    "json_parse",
    "json_stringify",
];

/// Bindings exposed only when the manifest declares `dependencies.ui`.
/// Copied best-effort; no validation that the host registered them.
pub const UI_GLOBALS: &[&str] = &["ui"];

/// Per-load options.
#[derive(Debug, Clone, Default)]
pub struct LoaderOptions {
    /// Fetch-stage timeout. Evaluation itself is never timed out.
    pub timeout: Option<Duration>,

    /// Reserved; not enforced.
    pub memory_limit: Option<usize>,

    /// Extra environment bindings to expose beyond [`SAFE_GLOBALS`].
    pub allowed_globals: Vec<String>,
}

impl LoaderOptions {
    /// Effective fetch timeout.
    pub fn fetch_timeout(&self) -> Duration {
        self.timeout.unwrap_or(DEFAULT_FETCH_TIMEOUT)
    }
}

/// Registry of the named bindings the embedding host provides.
///
/// The sandbox builder probes this registry instead of any ambient global
/// scope: a binding either exists here or it does not exist at all.
#[derive(Default)]
pub struct HostEnvironment {
    bindings: BTreeMap<String, Value>,
}

impl HostEnvironment {
    /// An empty environment. Sandboxes built from it expose only the
    /// plugin-specific bindings.
    pub fn new() -> Self {
        Self::default()
    }

    /// An environment with the standard host bindings registered.
    pub fn with_defaults() -> Self {
        let mut env = Self::new();
        env.register_function(LogFn { level: LogLevel::Info, name: "log" });
        env.register_function(LogFn { level: LogLevel::Warn, name: "warn" });
        env.register_function(LogFn { level: LogLevel::Error, name: "error" });
        env.register_function(NowMillisFn);
        env.register_function(DelayFn);
        env.register("json_parse", Value::host(NativeFunction::new("json_parse", json_parse)));
        env.register(
            "json_stringify",
            Value::host(NativeFunction::new("json_stringify", json_stringify)),
        );
        env
    }

    /// Register a binding under an explicit name.
    pub fn register(&mut self, name: impl Into<String>, value: Value) {
        self.bindings.insert(name.into(), value);
    }

    /// Register a host function under its own name.
    pub fn register_function(&mut self, function: impl HostFunction + 'static) {
        let name = function.name().to_string();
        self.bindings.insert(name, Value::host(function));
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.bindings.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.bindings.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.bindings.keys().map(String::as_str)
    }
}

/// The bindings visible to one evaluated module.
#[derive(Default)]
pub struct Sandbox {
    bindings: BTreeMap<String, Value>,
}

impl Sandbox {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.bindings.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.bindings.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.bindings.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

/// Builds the sandbox for one plugin load.
pub struct SandboxBuilder<'a> {
    environment: &'a HostEnvironment,
    manifest: &'a PluginManifest,
    options: &'a LoaderOptions,
}

impl<'a> SandboxBuilder<'a> {
    pub fn new(
        environment: &'a HostEnvironment,
        manifest: &'a PluginManifest,
        options: &'a LoaderOptions,
    ) -> Self {
        Self {
            environment,
            manifest,
            options,
        }
    }

    /// Assemble the binding table: allow-listed environment bindings,
    /// caller extras (no overwrite), then the plugin-specific bindings:
    /// `plugin_metadata` and the permission-gated `fetch`.
    pub fn build(self, fetch: Value) -> PluginResult<Sandbox> {
        let mut bindings = BTreeMap::new();

        for name in SAFE_GLOBALS {
            if let Some(value) = self.environment.get(name) {
                bindings.insert(name.to_string(), value.clone());
            }
        }

        for name in &self.options.allowed_globals {
            if bindings.contains_key(name) {
                continue;
            }
            if let Some(value) = self.environment.get(name) {
                bindings.insert(name.clone(), value.clone());
            }
        }

        let metadata = serde_json::to_value(&self.manifest.metadata)?;
        bindings.insert("plugin_metadata".to_string(), Value::from_json(&metadata));
        bindings.insert("fetch".to_string(), fetch);

        if self.manifest.dependencies.ui {
            for name in UI_GLOBALS {
                if let Some(value) = self.environment.get(name) {
                    bindings.entry(name.to_string()).or_insert_with(|| value.clone());
                }
            }
        }

        Ok(Sandbox { bindings })
    }
}

// ---------------------------------------------------------------------------
// Default host bindings
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
enum LogLevel {
    Info,
    Warn,
    Error,
}

struct LogFn {
    level: LogLevel,
    name: &'static str,
}

#[async_trait]
impl HostFunction for LogFn {
    fn name(&self) -> &str {
        self.name
    }

    async fn invoke(&self, args: Vec<Value>) -> PluginResult<Value> {
        let message = args
            .iter()
            .map(Value::to_log_string)
            .collect::<Vec<_>>()
            .join(" ");
        match self.level {
            LogLevel::Info => tracing::info!(target: "plugin", "{}", message),
            LogLevel::Warn => tracing::warn!(target: "plugin", "{}", message),
            LogLevel::Error => tracing::error!(target: "plugin", "{}", message),
        }
        Ok(Value::Null)
    }
}

struct NowMillisFn;

#[async_trait]
impl HostFunction for NowMillisFn {
    fn name(&self) -> &str {
        "now_millis"
    }

    async fn invoke(&self, _args: Vec<Value>) -> PluginResult<Value> {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64;
        Ok(Value::Int(millis))
    }
}

/// Timer binding: suspends the calling plugin for the given milliseconds.
struct DelayFn;

#[async_trait]
impl HostFunction for DelayFn {
    fn name(&self) -> &str {
        "delay"
    }

    async fn invoke(&self, args: Vec<Value>) -> PluginResult<Value> {
        let millis = match args.first() {
            Some(Value::Int(ms)) if *ms >= 0 => *ms as u64,
            Some(other) => {
                return Err(PluginError::Script(format!(
                    "delay expects a non-negative integer, got {}",
                    other.type_name()
                )))
            }
            None => 0,
        };
        tokio::time::sleep(Duration::from_millis(millis)).await;
        Ok(Value::Null)
    }
}

fn json_parse(args: Vec<Value>) -> PluginResult<Value> {
    let text = args
        .first()
        .ok_or_else(|| PluginError::Script("json_parse expects one argument".to_string()))?
        .expect_str("json_parse argument")?;
    let json: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| PluginError::Script(format!("json_parse: {e}")))?;
    Ok(Value::from_json(&json))
}

fn json_stringify(args: Vec<Value>) -> PluginResult<Value> {
    let value = args.first().cloned().unwrap_or(Value::Null);
    Ok(Value::String(value.to_json().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_manifest(ui: bool) -> PluginManifest {
        let json = format!(
            r#"{{
                "entry": "plugin.apm",
                "metadata": {{ "id": "p1", "name": "P1", "version": "1.0.0" }},
                "dependencies": {{ "ui": {ui} }},
                "compatibleVersions": {{ "min": "1.0.0" }}
            }}"#
        );
        PluginManifest::from_str(&json).unwrap()
    }

    fn noop_fetch() -> Value {
        Value::host(NativeFunction::new("fetch", |_args| Ok(Value::Null)))
    }

    #[test]
    fn test_safe_globals_copied_only_if_present() {
        let env = HostEnvironment::with_defaults();
        let options = LoaderOptions::default();
        let manifest = sample_manifest(false);

        let sandbox = SandboxBuilder::new(&env, &manifest, &options)
            .build(noop_fetch())
            .unwrap();

        for name in SAFE_GLOBALS {
            assert!(sandbox.contains(name), "missing safe global {name}");
        }

        // Empty environment: nothing from the allow-list appears.
        let empty = HostEnvironment::new();
        let sandbox = SandboxBuilder::new(&empty, &manifest, &options)
            .build(noop_fetch())
            .unwrap();
        for name in SAFE_GLOBALS {
            assert!(!sandbox.contains(name));
        }
        // The plugin-specific bindings are always injected.
        assert!(sandbox.contains("plugin_metadata"));
        assert!(sandbox.contains("fetch"));
        assert_eq!(sandbox.len(), 2);
    }

    #[test]
    fn test_allowed_globals_probe_without_overwrite() {
        let mut env = HostEnvironment::with_defaults();
        env.register("custom", Value::Int(7));
        let manifest = sample_manifest(false);

        let options = LoaderOptions {
            allowed_globals: vec![
                "custom".to_string(),
                "does_not_exist".to_string(),
                "log".to_string(),
            ],
            ..Default::default()
        };

        let sandbox = SandboxBuilder::new(&env, &manifest, &options)
            .build(noop_fetch())
            .unwrap();

        assert_eq!(sandbox.get("custom"), Some(&Value::Int(7)));
        assert!(!sandbox.contains("does_not_exist"));
        // "log" was already present from the allow-list pass.
        assert!(sandbox.contains("log"));
    }

    #[test]
    fn test_plugin_metadata_binding() {
        let env = HostEnvironment::new();
        let options = LoaderOptions::default();
        let manifest = sample_manifest(false);

        let sandbox = SandboxBuilder::new(&env, &manifest, &options)
            .build(noop_fetch())
            .unwrap();

        let metadata = sandbox.get("plugin_metadata").unwrap();
        let obj = metadata.as_object().unwrap();
        assert_eq!(obj.get("id"), Some(Value::string("p1")));
        assert_eq!(obj.get("version"), Some(Value::string("1.0.0")));
    }

    #[test]
    fn test_ui_bindings_gated_on_dependency() {
        let mut env = HostEnvironment::new();
        env.register("ui", Value::object());

        let options = LoaderOptions::default();

        let no_ui = sample_manifest(false);
        let sandbox = SandboxBuilder::new(&env, &no_ui, &options)
            .build(noop_fetch())
            .unwrap();
        assert!(!sandbox.contains("ui"));

        let with_ui = sample_manifest(true);
        let sandbox = SandboxBuilder::new(&env, &with_ui, &options)
            .build(noop_fetch())
            .unwrap();
        assert!(sandbox.contains("ui"));

        // Best-effort: a host that never registered "ui" produces a
        // sandbox without it, not an error.
        let bare = HostEnvironment::new();
        let sandbox = SandboxBuilder::new(&bare, &with_ui, &options)
            .build(noop_fetch())
            .unwrap();
        assert!(!sandbox.contains("ui"));
    }

    #[tokio::test]
    async fn test_json_bindings() {
        let env = HostEnvironment::with_defaults();

        let parse = env.get("json_parse").unwrap();
        let Value::Host(parse) = parse else { panic!("expected host fn") };
        let parsed = parse
            .invoke(vec![Value::string(r#"{"a": [1, 2]}"#)])
            .await
            .unwrap();
        let obj = parsed.as_object().unwrap();
        assert!(matches!(obj.get("a"), Some(Value::Array(_))));

        let stringify = env.get("json_stringify").unwrap();
        let Value::Host(stringify) = stringify else { panic!("expected host fn") };
        let text = stringify.invoke(vec![parsed]).await.unwrap();
        assert_eq!(text.as_str(), Some(r#"{"a":[1,2]}"#));
    }

    #[test]
    fn test_default_timeout() {
        assert_eq!(LoaderOptions::default().fetch_timeout(), DEFAULT_FETCH_TIMEOUT);
        let options = LoaderOptions {
            timeout: Some(Duration::from_millis(250)),
            ..Default::default()
        };
        assert_eq!(options.fetch_timeout(), Duration::from_millis(250));
    }
}
