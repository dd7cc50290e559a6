//! Host-side services exposed to plugins.
//!
//! Every outward-reaching binding a plugin can call funnels through a
//! [`PluginHost`]: restricted fetch, plugin-scoped storage, and
//! notifications. All calls are permission-checked at call time against
//! the manifest's declared permissions, so a revoked binding cannot be
//! stashed and replayed with wider powers than the declaration grants.

use alleato_plugin_runtime::{
    HostFunction, Obj, Permission, PermissionSet, PluginError, PluginResult, Value,
    DEFAULT_FETCH_TIMEOUT,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use url::Url;

/// Hostnames a plugin may fetch from without the `access:api` permission.
///
/// Matching is on the hostname alone; ports and schemes never enter into
/// it.
pub const DEFAULT_ALLOWED_HOSTS: &[&str] = &["api.alleato.com", "localhost", "127.0.0.1"];

/// Header identifying the calling plugin on every outbound request.
pub const PLUGIN_ID_HEADER: &str = "X-Plugin-ID";

/// Host services for one plugin.
pub struct PluginHost {
    /// Plugin this host instance serves.
    plugin_id: String,

    /// Permissions granted by the plugin's manifest.
    permissions: PermissionSet,

    /// HTTP client for restricted fetch.
    client: reqwest::Client,

    /// Hostnames reachable without `access:api`.
    allowed_hosts: Vec<String>,

    /// Per-request timeout for restricted fetch.
    fetch_timeout: Duration,

    /// Plugin-scoped key-value storage.
    storage: Arc<RwLock<HashMap<String, Value>>>,
}

impl PluginHost {
    /// Create a host for a plugin with the given granted permissions.
    pub fn new(plugin_id: impl Into<String>, permissions: PermissionSet) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            permissions,
            client: reqwest::Client::new(),
            allowed_hosts: DEFAULT_ALLOWED_HOSTS.iter().map(|h| h.to_string()).collect(),
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            storage: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Override the fetch allow-list.
    pub fn with_allowed_hosts(mut self, hosts: Vec<String>) -> Self {
        self.allowed_hosts = hosts;
        self
    }

    /// Override the per-request fetch timeout.
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn permissions(&self) -> &PermissionSet {
        &self.permissions
    }

    /// Check that a permission is granted.
    fn check_permission(&self, permission: Permission) -> PluginResult<()> {
        if self.permissions.has(&permission) {
            Ok(())
        } else {
            Err(PluginError::MissingPermission(
                permission.as_str().to_string(),
            ))
        }
    }

    /// Decide whether a URL may be fetched. Evaluated fresh on every call;
    /// `access:api` lifts the allow-list entirely.
    fn check_host(&self, url: &Url) -> PluginResult<()> {
        if self.permissions.has(&Permission::ApiAccess) {
            return Ok(());
        }
        let hostname = url.host_str().unwrap_or_default();
        if self.allowed_hosts.iter().any(|h| h == hostname) {
            Ok(())
        } else {
            Err(PluginError::ForbiddenHost {
                plugin_id: self.plugin_id.clone(),
                hostname: hostname.to_string(),
            })
        }
    }

    /// Restricted fetch: the one network primitive plugins get.
    ///
    /// `options` may carry `method`, `headers`, and `body`. The
    /// [`PLUGIN_ID_HEADER`] is set after caller headers, so a plugin
    /// cannot spoof another's identity.
    pub async fn fetch(&self, url: &str, options: Option<&Obj>) -> PluginResult<Value> {
        let url = Url::parse(url).map_err(|e| PluginError::Fetch {
            plugin_id: Some(self.plugin_id.clone()),
            status: format!("invalid URL: {e}"),
        })?;
        self.check_host(&url)?;

        let method = match options.and_then(|o| o.get("method")) {
            Some(value) => {
                let name = value.expect_str("fetch method")?.to_uppercase();
                reqwest::Method::from_bytes(name.as_bytes()).map_err(|_| {
                    PluginError::Script(format!("invalid fetch method '{name}'"))
                })?
            }
            None => reqwest::Method::GET,
        };

        let mut request = self.client.request(method, url).timeout(self.fetch_timeout);

        if let Some(headers) = options.and_then(|o| o.get("headers")) {
            let headers = headers
                .as_object()
                .ok_or_else(|| PluginError::Script("fetch headers must be an object".to_string()))?;
            for (name, value) in headers.entries() {
                request = request.header(name.as_str(), value.to_log_string());
            }
        }
        request = request.header(PLUGIN_ID_HEADER, self.plugin_id.as_str());

        if let Some(body) = options.and_then(|o| o.get("body")) {
            request = request.body(body.expect_str("fetch body")?.to_string());
        }

        let response = request.send().await.map_err(|e| PluginError::Fetch {
            plugin_id: Some(self.plugin_id.clone()),
            status: e.to_string(),
        })?;

        let status = response.status();
        let headers = Obj::new();
        for (name, value) in response.headers() {
            headers.set(
                name.as_str(),
                Value::string(value.to_str().unwrap_or_default()),
            );
        }
        let body = response.text().await.map_err(|e| PluginError::Fetch {
            plugin_id: Some(self.plugin_id.clone()),
            status: format!("failed to read response: {e}"),
        })?;

        let result = Obj::new();
        result.set("status", Value::Int(status.as_u16() as i64));
        result.set("ok", Value::Bool(status.is_success()));
        result.set("headers", Value::Object(headers));
        result.set("body", Value::String(body));
        Ok(Value::Object(result))
    }

    /// Read a value from plugin-scoped storage.
    ///
    /// Requires `access:storage`.
    pub async fn storage_get(&self, key: &str) -> PluginResult<Value> {
        self.check_permission(Permission::Storage)?;
        let storage = self.storage.read().await;
        Ok(storage.get(key).cloned().unwrap_or(Value::Null))
    }

    /// Write a value to plugin-scoped storage.
    ///
    /// Requires `access:storage`.
    pub async fn storage_set(&self, key: &str, value: Value) -> PluginResult<()> {
        self.check_permission(Permission::Storage)?;
        let mut storage = self.storage.write().await;
        storage.insert(key.to_string(), value);
        Ok(())
    }

    /// Remove a value from plugin-scoped storage.
    ///
    /// Requires `access:storage`.
    pub async fn storage_remove(&self, key: &str) -> PluginResult<Value> {
        self.check_permission(Permission::Storage)?;
        let mut storage = self.storage.write().await;
        Ok(storage.remove(key).unwrap_or(Value::Null))
    }

    /// Drop everything in plugin-scoped storage.
    ///
    /// Requires `access:storage`.
    pub async fn storage_clear(&self) -> PluginResult<()> {
        self.check_permission(Permission::Storage)?;
        let mut storage = self.storage.write().await;
        storage.clear();
        Ok(())
    }

    /// Surface a notification to the user.
    ///
    /// Requires `access:notifications`.
    pub fn notify(&self, title: &str, message: &str) -> PluginResult<()> {
        self.check_permission(Permission::Notifications)?;
        tracing::info!(
            target: "notifications",
            plugin = %self.plugin_id,
            title = %title,
            "{}", message
        );
        Ok(())
    }

    /// The restricted fetch function as a sandbox binding.
    pub fn fetch_binding(self: &Arc<Self>) -> Value {
        Value::Host(Arc::new(FetchFn {
            host: Arc::clone(self),
        }))
    }

    /// The per-dispatch API object handed to hook and lifecycle handlers.
    ///
    /// Built fresh for every dispatch; handlers that stash it keep only
    /// functions that re-check permissions on use.
    pub fn api_object(self: &Arc<Self>) -> Value {
        let storage = Obj::new();
        storage.set(
            "get",
            Value::Host(Arc::new(StorageGetFn { host: Arc::clone(self) })),
        );
        storage.set(
            "set",
            Value::Host(Arc::new(StorageSetFn { host: Arc::clone(self) })),
        );
        storage.set(
            "delete",
            Value::Host(Arc::new(StorageDeleteFn { host: Arc::clone(self) })),
        );
        storage.set(
            "clear",
            Value::Host(Arc::new(StorageClearFn { host: Arc::clone(self) })),
        );

        let ui = Obj::new();
        ui.set(
            "notify",
            Value::Host(Arc::new(NotifyFn { host: Arc::clone(self) })),
        );

        let api = Obj::new();
        api.set("fetch", self.fetch_binding());
        api.set("storage", Value::Object(storage));
        api.set("ui", Value::Object(ui));
        api.set(
            "log",
            Value::Host(Arc::new(ApiLogFn { host: Arc::clone(self) })),
        );
        api.set("now", Value::Host(Arc::new(NowFn)));
        Value::Object(api)
    }
}

struct FetchFn {
    host: Arc<PluginHost>,
}

#[async_trait]
impl HostFunction for FetchFn {
    fn name(&self) -> &str {
        "fetch"
    }

    async fn invoke(&self, args: Vec<Value>) -> PluginResult<Value> {
        let url = args
            .first()
            .ok_or_else(|| PluginError::Script("fetch expects a URL".to_string()))?
            .expect_str("fetch URL")?;
        let options = args.get(1).and_then(Value::as_object);
        self.host.fetch(url, options).await
    }
}

struct StorageGetFn {
    host: Arc<PluginHost>,
}

#[async_trait]
impl HostFunction for StorageGetFn {
    fn name(&self) -> &str {
        "get"
    }

    async fn invoke(&self, args: Vec<Value>) -> PluginResult<Value> {
        let key = args
            .first()
            .ok_or_else(|| PluginError::Script("storage.get expects a key".to_string()))?
            .expect_str("storage key")?;
        self.host.storage_get(key).await
    }
}

struct StorageSetFn {
    host: Arc<PluginHost>,
}

#[async_trait]
impl HostFunction for StorageSetFn {
    fn name(&self) -> &str {
        "set"
    }

    async fn invoke(&self, args: Vec<Value>) -> PluginResult<Value> {
        let key = args
            .first()
            .ok_or_else(|| PluginError::Script("storage.set expects a key".to_string()))?
            .expect_str("storage key")?
            .to_string();
        let value = args.get(1).cloned().unwrap_or(Value::Null);
        self.host.storage_set(&key, value).await?;
        Ok(Value::Null)
    }
}

struct StorageDeleteFn {
    host: Arc<PluginHost>,
}

#[async_trait]
impl HostFunction for StorageDeleteFn {
    fn name(&self) -> &str {
        "delete"
    }

    async fn invoke(&self, args: Vec<Value>) -> PluginResult<Value> {
        let key = args
            .first()
            .ok_or_else(|| PluginError::Script("storage.delete expects a key".to_string()))?
            .expect_str("storage key")?;
        self.host.storage_remove(key).await
    }
}

struct StorageClearFn {
    host: Arc<PluginHost>,
}

#[async_trait]
impl HostFunction for StorageClearFn {
    fn name(&self) -> &str {
        "clear"
    }

    async fn invoke(&self, _args: Vec<Value>) -> PluginResult<Value> {
        self.host.storage_clear().await?;
        Ok(Value::Null)
    }
}

struct NowFn;

#[async_trait]
impl HostFunction for NowFn {
    fn name(&self) -> &str {
        "now"
    }

    async fn invoke(&self, _args: Vec<Value>) -> PluginResult<Value> {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64;
        Ok(Value::Int(millis))
    }
}

struct NotifyFn {
    host: Arc<PluginHost>,
}

#[async_trait]
impl HostFunction for NotifyFn {
    fn name(&self) -> &str {
        "notify"
    }

    async fn invoke(&self, args: Vec<Value>) -> PluginResult<Value> {
        let title = args
            .first()
            .ok_or_else(|| PluginError::Script("notify expects a title".to_string()))?
            .expect_str("notification title")?;
        let message = args
            .get(1)
            .map(Value::to_log_string)
            .unwrap_or_default();
        self.host.notify(title, &message)?;
        Ok(Value::Null)
    }
}

struct ApiLogFn {
    host: Arc<PluginHost>,
}

#[async_trait]
impl HostFunction for ApiLogFn {
    fn name(&self) -> &str {
        "log"
    }

    async fn invoke(&self, args: Vec<Value>) -> PluginResult<Value> {
        let message = args
            .iter()
            .map(Value::to_log_string)
            .collect::<Vec<_>>()
            .join(" ");
        tracing::info!(target: "plugin", plugin = %self.host.plugin_id, "{}", message);
        Ok(Value::Null)
    }
}
