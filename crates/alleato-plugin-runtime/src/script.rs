//! Plugin script-module format and loader.
//!
//! Plugin entry sources are module documents in the `.apm` format:
//!
//! ```text
//! +----------------+
//! | Magic (4 bytes)|  "APM\x01" (version 1, optional framing)
//! +----------------+
//! | JSON body      |  { version, constants, functions, entry_point }
//! +----------------+
//! ```
//!
//! The JSON body may also be shipped bare (no magic), which is the form
//! produced by development tooling. The loader performs no analysis of
//! the module beyond the structural checks in [`ScriptModule::validate`]:
//! function bodies are trusted to be well-formed instruction lists once
//! their indices and jump targets are in range.

use crate::error::{PluginError, PluginResult};
use crate::value::Value;
use serde::{Deserialize, Serialize};

/// Magic bytes for framed plugin module files.
pub const MAGIC: &[u8; 4] = b"APM\x01";

/// A parsed plugin module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptModule {
    /// Version of the module format.
    pub version: u8,

    /// Constant pool.
    #[serde(default)]
    pub constants: Vec<Constant>,

    /// Function definitions.
    pub functions: Vec<Function>,

    /// Function executed when the module is evaluated.
    pub entry_point: String,
}

/// A constant value in the constant pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Constant {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl Constant {
    /// Materialize the constant as a runtime value.
    pub fn to_value(&self) -> Value {
        match self {
            Constant::Null => Value::Null,
            Constant::Bool(b) => Value::Bool(*b),
            Constant::Int(i) => Value::Int(*i),
            Constant::Float(f) => Value::Float(*f),
            Constant::String(s) => Value::String(s.clone()),
        }
    }
}

/// A function definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Function {
    /// Function name.
    pub name: String,

    /// Parameter names.
    pub params: Vec<String>,

    /// Instruction list.
    pub instructions: Vec<Instruction>,

    /// Number of local variable slots beyond the parameters.
    #[serde(default)]
    pub local_count: usize,
}

impl Function {
    /// Total local slots (parameters first, then scratch locals).
    pub fn frame_size(&self) -> usize {
        self.params.len() + self.local_count
    }
}

/// A module instruction.
///
/// Jump offsets are relative to the index of the jump instruction itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum Instruction {
    /// Load a constant from the pool.
    LoadConst { index: usize },

    /// Load a local variable.
    LoadLocal { index: usize },

    /// Store to a local variable.
    StoreLocal { index: usize },

    /// Load a name: module functions first, then module globals, then
    /// sandbox bindings.
    LoadGlobal { name: String },

    /// Store to a module global.
    StoreGlobal { name: String },

    /// Call a module function or sandbox binding by name.
    Call { name: String, arg_count: usize },

    /// Call a property of the object on the stack.
    CallMethod { name: String, arg_count: usize },

    /// Return from the current function.
    Return,

    /// Unconditional relative jump.
    Jump { offset: i32 },

    /// Relative jump if the popped value is falsy.
    JumpIfFalse { offset: i32 },

    /// Pop the top of the stack.
    Pop,

    /// Duplicate the top of the stack.
    Dup,

    Add,
    Sub,
    Mul,
    Div,

    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,

    Not,
    And,
    Or,

    /// Create an array from N items on the stack.
    MakeArray { count: usize },

    /// Create an object from N key-value pairs on the stack.
    MakeObject { count: usize },

    /// Get a property from the object on the stack.
    GetProperty { name: String },

    /// Set a property on the object on the stack.
    SetProperty { name: String },

    /// Index into an array or object.
    GetIndex,

    /// Store into an array or object by index.
    SetIndex,

    /// Resolve an awaited value. Host calls complete eagerly, so this is
    /// a no-op retained for format compatibility.
    Await,

    /// No operation.
    Nop,
}

impl ScriptModule {
    /// Parse a module from raw bytes (framed or bare JSON).
    pub fn parse(bytes: &[u8]) -> PluginResult<Self> {
        let body = if bytes.len() >= 4 && &bytes[0..4] == MAGIC {
            &bytes[4..]
        } else {
            bytes
        };
        let content = std::str::from_utf8(body)
            .map_err(|e| PluginError::Module(format!("invalid UTF-8: {e}")))?;
        let module: ScriptModule = serde_json::from_str(content)
            .map_err(|e| PluginError::Module(format!("invalid module JSON: {e}")))?;
        module.validate()?;
        Ok(module)
    }

    /// Parse a module from source text.
    pub fn from_source(source: &str) -> PluginResult<Self> {
        Self::parse(source.as_bytes())
    }

    /// Look up a function by name.
    pub fn function(&self, name: &str) -> Option<(usize, &Function)> {
        self.functions
            .iter()
            .enumerate()
            .find(|(_, f)| f.name == name)
    }

    /// Fetch a constant by pool index.
    pub fn constant(&self, index: usize) -> PluginResult<Value> {
        self.constants
            .get(index)
            .map(Constant::to_value)
            .ok_or_else(|| PluginError::Script(format!("constant index {index} out of range")))
    }

    /// Validate the module structure.
    pub fn validate(&self) -> PluginResult<()> {
        if self.version != 1 {
            return Err(PluginError::Module(format!(
                "unsupported module version: {}",
                self.version
            )));
        }

        if self.function(&self.entry_point).is_none() {
            return Err(PluginError::Module(format!(
                "entry point function '{}' not found",
                self.entry_point
            )));
        }

        for function in &self.functions {
            self.validate_function(function)?;
        }
        Ok(())
    }

    fn validate_function(&self, function: &Function) -> PluginResult<()> {
        let len = function.instructions.len() as i64;
        let frame_size = function.frame_size();

        for (i, instruction) in function.instructions.iter().enumerate() {
            match instruction {
                Instruction::LoadConst { index } => {
                    if *index >= self.constants.len() {
                        return Err(PluginError::Module(format!(
                            "function '{}': constant index {} out of range",
                            function.name, index
                        )));
                    }
                }
                Instruction::LoadLocal { index } | Instruction::StoreLocal { index } => {
                    if *index >= frame_size {
                        return Err(PluginError::Module(format!(
                            "function '{}': local index {} out of range",
                            function.name, index
                        )));
                    }
                }
                Instruction::Jump { offset } | Instruction::JumpIfFalse { offset } => {
                    let target = i as i64 + *offset as i64;
                    // A target equal to the instruction count falls off the
                    // end, which returns null.
                    if target < 0 || target > len {
                        return Err(PluginError::Module(format!(
                            "function '{}': jump target {} out of range",
                            function.name, target
                        )));
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_module() -> ScriptModule {
        ScriptModule {
            version: 1,
            constants: vec![Constant::String("hello".to_string()), Constant::Int(42)],
            functions: vec![Function {
                name: "main".to_string(),
                params: vec![],
                instructions: vec![
                    Instruction::LoadConst { index: 1 },
                    Instruction::Return,
                ],
                local_count: 0,
            }],
            entry_point: "main".to_string(),
        }
    }

    #[test]
    fn test_parse_bare_json() {
        let json = serde_json::to_vec(&sample_module()).unwrap();
        let module = ScriptModule::parse(&json).unwrap();
        assert_eq!(module.version, 1);
        assert_eq!(module.entry_point, "main");
        assert_eq!(module.constants.len(), 2);
    }

    #[test]
    fn test_parse_framed() {
        let mut bytes = MAGIC.to_vec();
        bytes.extend(serde_json::to_vec(&sample_module()).unwrap());
        let module = ScriptModule::parse(&bytes).unwrap();
        assert_eq!(module.entry_point, "main");
    }

    #[test]
    fn test_parse_garbage() {
        let result = ScriptModule::parse(b"not a module");
        assert!(matches!(result, Err(PluginError::Module(_))));
    }

    #[test]
    fn test_wrong_version_rejected() {
        let mut module = sample_module();
        module.version = 9;
        assert!(matches!(module.validate(), Err(PluginError::Module(_))));
    }

    #[test]
    fn test_missing_entry_point_rejected() {
        let mut module = sample_module();
        module.entry_point = "nonexistent".to_string();
        assert!(matches!(module.validate(), Err(PluginError::Module(_))));
    }

    #[test]
    fn test_constant_index_out_of_range_rejected() {
        let mut module = sample_module();
        module.functions[0].instructions[0] = Instruction::LoadConst { index: 7 };
        assert!(matches!(module.validate(), Err(PluginError::Module(_))));
    }

    #[test]
    fn test_jump_target_out_of_range_rejected() {
        let mut module = sample_module();
        module.functions[0]
            .instructions
            .push(Instruction::Jump { offset: -10 });
        assert!(matches!(module.validate(), Err(PluginError::Module(_))));
    }

    #[test]
    fn test_local_index_checked_against_frame_size() {
        let mut module = sample_module();
        module.functions[0].instructions[0] = Instruction::LoadLocal { index: 0 };
        assert!(matches!(module.validate(), Err(PluginError::Module(_))));

        module.functions[0].local_count = 1;
        assert!(module.validate().is_ok());
    }
}
