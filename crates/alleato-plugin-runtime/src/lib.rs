//! # alleato-plugin-runtime
//!
//! Sandboxed script runtime for evaluating Alleato plugins.
//!
//! This crate provides:
//! - Plugin manifest parsing and validation
//! - The `.apm` script-module format and its structural checks
//! - Sandbox construction from an explicit host environment
//! - A frame-stack evaluator executing modules under that sandbox
//! - Permission parsing for the host-side capability checks
//!
//! ## Security Model
//!
//! Evaluated code resolves free names against its sandbox and nothing
//! else; the sandbox is assembled from a fixed allow-list plus bindings
//! the loader injects per plugin. Declared permissions gate what those
//! injected bindings are willing to do. This is restriction by explicit
//! injection, not an isolate.

pub mod error;
pub mod interpreter;
pub mod manifest;
pub mod permission;
pub mod sandbox;
pub mod script;
pub mod value;

pub use error::{PluginError, PluginResult};
pub use interpreter::{Evaluator, MAX_CALL_DEPTH};
pub use manifest::{CompatibleVersions, PluginManifest, PluginMetadata};
pub use permission::{Permission, PermissionSet};
pub use sandbox::{
    HostEnvironment, LoaderOptions, Sandbox, SandboxBuilder, DEFAULT_FETCH_TIMEOUT, SAFE_GLOBALS,
};
pub use script::{Constant, Function, Instruction, ScriptModule};
pub use value::{Arr, HostFunction, NativeFunction, Obj, Value};
