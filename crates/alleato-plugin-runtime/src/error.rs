//! Error types for the plugin runtime.

use thiserror::Error;

/// Errors that can occur while loading or running a plugin.
///
/// The variants that correspond to a wire-visible failure class expose a
/// machine-readable code through [`PluginError::code`]; the rest (script
/// faults, structural validation) carry only a descriptive message.
#[derive(Error, Debug)]
pub enum PluginError {
    /// Manifest or entry fetch returned a non-success HTTP status.
    #[error("failed to fetch plugin: {status}")]
    Fetch {
        plugin_id: Option<String>,
        status: String,
    },

    /// Fetched entry source exceeds the size ceiling.
    #[error("plugin code exceeds maximum size limit")]
    SizeLimitExceeded { plugin_id: String },

    /// Parsing or executing the plugin module failed.
    #[error("plugin evaluation failed: {message}")]
    Evaluation { plugin_id: String, message: String },

    /// Catch-all for failures on the URL-load path not classified above,
    /// including network-level failures before any HTTP status exists.
    /// The plugin id is unknown until the manifest has been parsed.
    #[error("failed to load plugin: {message}")]
    Load {
        plugin_id: Option<String>,
        message: String,
    },

    /// Manifest failed to parse or carried invalid fields.
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    /// Script module document is structurally invalid.
    #[error("invalid script module: {0}")]
    Module(String),

    /// A fault raised by the evaluator while running script code.
    #[error("script error: {0}")]
    Script(String),

    /// The evaluated exports failed structural validation.
    #[error("{0}")]
    Validation(String),

    /// Restricted fetch refused a hostname outside the allow-list.
    #[error("plugin {plugin_id} is not allowed to fetch from {hostname}")]
    ForbiddenHost {
        plugin_id: String,
        hostname: String,
    },

    /// A host call required a permission the plugin did not declare.
    #[error("missing permission: {0}")]
    MissingPermission(String),

    /// Plugin declares a compatible-version range the host falls outside of.
    #[error("plugin {plugin_id} requires host version {required}, host is {host_version}")]
    Incompatible {
        plugin_id: String,
        required: String,
        host_version: String,
    },

    /// Plugin is not present in the registry.
    #[error("plugin not found: {0}")]
    NotFound(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PluginError {
    /// Machine-readable error code, when the failure class defines one.
    pub fn code(&self) -> Option<&'static str> {
        match self {
            PluginError::Fetch { .. } => Some("FETCH_ERROR"),
            PluginError::SizeLimitExceeded { .. } => Some("SIZE_LIMIT_EXCEEDED"),
            PluginError::Evaluation { .. } => Some("EVALUATION_ERROR"),
            PluginError::Load { .. } => Some("LOAD_ERROR"),
            _ => None,
        }
    }

    /// The plugin this error belongs to, when known.
    pub fn plugin_id(&self) -> Option<&str> {
        match self {
            PluginError::Fetch { plugin_id, .. } | PluginError::Load { plugin_id, .. } => {
                plugin_id.as_deref()
            }
            PluginError::SizeLimitExceeded { plugin_id }
            | PluginError::Evaluation { plugin_id, .. }
            | PluginError::ForbiddenHost { plugin_id, .. }
            | PluginError::Incompatible { plugin_id, .. } => Some(plugin_id),
            _ => None,
        }
    }
}

/// Result type for plugin runtime operations.
pub type PluginResult<T> = std::result::Result<T, PluginError>;
