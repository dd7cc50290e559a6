//! # alleato-plugin-api
//!
//! Plugin loading, host API, and registry for Alleato plugins.
//!
//! This crate sits on top of `alleato-plugin-runtime` and provides the
//! host-facing surface:
//!
//! - [`PluginLoader`]: fetch a manifest and entry source, evaluate the
//!   module in a sandbox, and validate the exports into a [`Plugin`]
//! - [`PluginHost`]: restricted fetch, plugin-scoped storage, and
//!   notifications, permission-checked per call
//! - [`PluginRegistry`]: installation, lifecycle transitions, and
//!   priority-ordered hook dispatch
//!
//! ## Loading a plugin
//!
//! ```no_run
//! use alleato_plugin_api::{PluginLoader, PluginRegistry};
//! use alleato_plugin_runtime::LoaderOptions;
//!
//! # async fn demo() -> alleato_plugin_runtime::PluginResult<()> {
//! let loader = PluginLoader::new();
//! let plugin = loader
//!     .load("https://plugins.alleato.com/audit/manifest.json", &LoaderOptions::default())
//!     .await?;
//!
//! let mut registry = PluginRegistry::new("1.4.0");
//! registry.install(plugin).await?;
//! # Ok(())
//! # }
//! ```

pub mod host;
pub mod loader;
pub mod plugin;
pub mod registry;

pub use host::{PluginHost, DEFAULT_ALLOWED_HOSTS, PLUGIN_ID_HEADER};
pub use loader::{create_test_plugin, test_manifest, PluginLoader, MAX_SOURCE_BYTES};
pub use plugin::{Handler, Lifecycle, LifecyclePhase, Plugin};
pub use registry::{HookOutcome, PluginInfo, PluginRegistry, PluginStatus};
