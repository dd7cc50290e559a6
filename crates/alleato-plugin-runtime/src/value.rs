//! Dynamic values exchanged between the host and evaluated plugin code.
//!
//! Objects and arrays have reference semantics (shared, mutable), so a
//! module body can build up `module.exports` incrementally the way the
//! wire format expects. Equality on them is identity, not structure.

use crate::error::{PluginError, PluginResult};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A host-provided function exposed to plugin code.
///
/// This is the complete capability boundary: the only way evaluated code
/// reaches the outside world is by calling a value of this type that was
/// explicitly placed in its sandbox or handed to it as an argument.
#[async_trait]
pub trait HostFunction: Send + Sync {
    /// Binding name the function is known by.
    fn name(&self) -> &str;

    /// Invoke the function with evaluated arguments.
    async fn invoke(&self, args: Vec<Value>) -> PluginResult<Value>;
}

/// Convenience wrapper turning a synchronous closure into a [`HostFunction`].
pub struct NativeFunction<F> {
    name: String,
    f: F,
}

impl<F> NativeFunction<F>
where
    F: Fn(Vec<Value>) -> PluginResult<Value> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self { name: name.into(), f }
    }
}

#[async_trait]
impl<F> HostFunction for NativeFunction<F>
where
    F: Fn(Vec<Value>) -> PluginResult<Value> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, args: Vec<Value>) -> PluginResult<Value> {
        (self.f)(args)
    }
}

fn relock<'a, T>(guard: Result<MutexGuard<'a, T>, PoisonError<MutexGuard<'a, T>>>) -> MutexGuard<'a, T> {
    guard.unwrap_or_else(PoisonError::into_inner)
}

/// A shared, mutable string-keyed object.
#[derive(Clone, Default)]
pub struct Obj(Arc<Mutex<BTreeMap<String, Value>>>);

impl Obj {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        relock(self.0.lock()).get(key).cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: Value) {
        relock(self.0.lock()).insert(key.into(), value);
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        relock(self.0.lock()).remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        relock(self.0.lock()).contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        relock(self.0.lock()).keys().cloned().collect()
    }

    /// Snapshot of the entries at the time of the call.
    pub fn entries(&self) -> Vec<(String, Value)> {
        relock(self.0.lock())
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        relock(self.0.lock()).len()
    }

    pub fn is_empty(&self) -> bool {
        relock(self.0.lock()).is_empty()
    }

    pub fn ptr_eq(&self, other: &Obj) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl FromIterator<(String, Value)> for Obj {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Self(Arc::new(Mutex::new(iter.into_iter().collect())))
    }
}

/// A shared, mutable array.
#[derive(Clone, Default)]
pub struct Arr(Arc<Mutex<Vec<Value>>>);

impl Arr {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, index: usize) -> Option<Value> {
        relock(self.0.lock()).get(index).cloned()
    }

    pub fn set(&self, index: usize, value: Value) -> bool {
        let mut items = relock(self.0.lock());
        let len = items.len();
        match items.get_mut(index) {
            Some(slot) => {
                *slot = value;
                true
            }
            None if index == len => {
                items.push(value);
                true
            }
            None => false,
        }
    }

    pub fn push(&self, value: Value) {
        relock(self.0.lock()).push(value);
    }

    pub fn items(&self) -> Vec<Value> {
        relock(self.0.lock()).clone()
    }

    pub fn len(&self) -> usize {
        relock(self.0.lock()).len()
    }

    pub fn is_empty(&self) -> bool {
        relock(self.0.lock()).is_empty()
    }

    pub fn ptr_eq(&self, other: &Arr) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl FromIterator<Value> for Arr {
    fn from_iter<T: IntoIterator<Item = Value>>(iter: T) -> Self {
        Self(Arc::new(Mutex::new(iter.into_iter().collect())))
    }
}

/// A dynamic runtime value.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(Arr),
    Object(Obj),
    /// A module-defined function, referenced by name.
    Function(String),
    /// A host-provided function.
    Host(Arc<dyn HostFunction>),
}

impl Value {
    pub fn string(s: impl Into<String>) -> Self {
        Value::String(s.into())
    }

    pub fn object() -> Self {
        Value::Object(Obj::new())
    }

    pub fn host(f: impl HostFunction + 'static) -> Self {
        Value::Host(Arc::new(f))
    }

    /// Whether the value can be invoked.
    pub fn is_callable(&self) -> bool {
        matches!(self, Value::Function(_) | Value::Host(_))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Truthiness: null, false, zero, and the empty string are falsy.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::String(s) => !s.is_empty(),
            Value::Array(_) | Value::Object(_) | Value::Function(_) | Value::Host(_) => true,
        }
    }

    /// Name of the value's type, for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Function(_) => "function",
            Value::Host(_) => "function",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Obj> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    /// Coerce a required string argument, for host-call implementations.
    pub fn expect_str(&self, what: &str) -> PluginResult<&str> {
        self.as_str()
            .ok_or_else(|| PluginError::Script(format!("{what} must be a string, got {}", self.type_name())))
    }

    /// Convert a JSON document into a value tree.
    pub fn from_json(json: &serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(items) => {
                Value::Array(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Convert the value into JSON. Functions become null.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null | Value::Function(_) | Value::Host(_) => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::Number((*i).into()),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Array(items) => {
                serde_json::Value::Array(items.items().iter().map(Value::to_json).collect())
            }
            Value::Object(obj) => serde_json::Value::Object(
                obj.entries()
                    .into_iter()
                    .map(|(k, v)| (k, v.to_json()))
                    .collect(),
            ),
        }
    }

    /// Render the value for log output.
    pub fn to_log_string(&self) -> String {
        match self {
            Value::String(s) => s.clone(),
            Value::Function(name) => format!("[function {name}]"),
            Value::Host(f) => format!("[function {}]", f.name()),
            other => other.to_json().to_string(),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
                *a as f64 == *b
            }
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a.ptr_eq(b),
            (Value::Object(a), Value::Object(b)) => a.ptr_eq(b),
            (Value::Function(a), Value::Function(b)) => a == b,
            (Value::Host(a), Value::Host(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "Null"),
            Value::Bool(b) => write!(f, "Bool({b})"),
            Value::Int(i) => write!(f, "Int({i})"),
            Value::Float(x) => write!(f, "Float({x})"),
            Value::String(s) => write!(f, "String({s:?})"),
            Value::Array(items) => write!(f, "Array(len={})", items.len()),
            Value::Object(obj) => write!(f, "Object(keys={:?})", obj.keys()),
            Value::Function(name) => write!(f, "Function({name})"),
            Value::Host(func) => write!(f, "Host({})", func.name()),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truthiness() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::Bool(false).is_truthy());
        assert!(!Value::Int(0).is_truthy());
        assert!(!Value::string("").is_truthy());
        assert!(Value::string("x").is_truthy());
        assert!(Value::object().is_truthy());
        assert!(Value::Function("f".into()).is_truthy());
    }

    #[test]
    fn test_object_reference_semantics() {
        let obj = Obj::new();
        let alias = Value::Object(obj.clone());
        obj.set("k", Value::Int(1));

        match &alias {
            Value::Object(o) => assert_eq!(o.get("k"), Some(Value::Int(1))),
            other => panic!("expected object, got {other:?}"),
        }
    }

    #[test]
    fn test_equality_is_identity_for_objects() {
        let a = Obj::new();
        let b = Obj::new();
        assert_ne!(Value::Object(a.clone()), Value::Object(b));
        assert_eq!(Value::Object(a.clone()), Value::Object(a));
    }

    #[test]
    fn test_json_round_trip() {
        let json: serde_json::Value = serde_json::from_str(
            r#"{"a": 1, "b": [true, null, "x"], "c": {"d": 2.5}}"#,
        )
        .unwrap();
        let value = Value::from_json(&json);
        assert_eq!(value.to_json(), json);
    }

    #[test]
    fn test_functions_serialize_as_null() {
        let obj = Obj::new();
        obj.set("handler", Value::Function("onPing".into()));
        let json = Value::Object(obj).to_json();
        assert_eq!(json["handler"], serde_json::Value::Null);
    }

    #[test]
    fn test_array_set_appends_at_len() {
        let arr = Arr::new();
        assert!(arr.set(0, Value::Int(1)));
        assert!(arr.set(1, Value::Int(2)));
        assert!(!arr.set(5, Value::Int(3)));
        assert_eq!(arr.len(), 2);
    }
}
