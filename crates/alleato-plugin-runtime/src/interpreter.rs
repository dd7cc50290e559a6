//! Sandboxed evaluation of plugin modules.
//!
//! The evaluator is a small frame-stack machine. A module executes with
//! exactly two name scopes: its own module globals (seeded with a fresh
//! `module`/`exports` pair) and the sandbox bindings it was given. There
//! is no third scope; an unresolved name is an error, which is the whole
//! enforcement mechanism of the sandbox.
//!
//! Host calls are awaited inline. There is no evaluation-time timeout or
//! preemption: a module that loops forever occupies its task until the
//! caller drops it. Only the fetch stage of loading is cancellable.

use crate::error::{PluginError, PluginResult};
use crate::sandbox::Sandbox;
use crate::script::{Instruction, ScriptModule};
use crate::value::{Obj, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Frame pushes beyond this fail the evaluation.
pub const MAX_CALL_DEPTH: usize = 64;

struct Frame {
    func: usize,
    ip: usize,
    locals: Vec<Value>,
    stack: Vec<Value>,
}

/// Executes one module under one sandbox.
///
/// The evaluator owns the module's global scope, so it outlives the
/// initial evaluation: hook dispatch calls back into the same instance
/// and observes any module-level state the plugin set up.
pub struct Evaluator {
    module: Arc<ScriptModule>,
    sandbox: Sandbox,
    globals: Mutex<BTreeMap<String, Value>>,
}

impl Evaluator {
    /// Create an evaluator with a fresh module scope.
    pub fn new(module: Arc<ScriptModule>, sandbox: Sandbox) -> Self {
        let exports = Value::object();
        let module_obj = Obj::new();
        module_obj.set("exports", exports.clone());

        let mut globals = BTreeMap::new();
        globals.insert("module".to_string(), Value::Object(module_obj));
        globals.insert("exports".to_string(), exports);

        Self {
            module,
            sandbox,
            globals: Mutex::new(globals),
        }
    }

    pub fn module(&self) -> &Arc<ScriptModule> {
        &self.module
    }

    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    /// Read a module global.
    pub fn global(&self, name: &str) -> Option<Value> {
        self.lock_globals().get(name).cloned()
    }

    /// Run the module's entry function and extract its exports:
    /// `module.exports.default` if present and non-null, else
    /// `module.exports`.
    pub async fn evaluate_module(&self) -> PluginResult<Value> {
        self.call_function(&self.module.entry_point.clone(), vec![]).await?;

        let exports = self
            .global("module")
            .as_ref()
            .and_then(Value::as_object)
            .and_then(|module| module.get("exports"))
            .unwrap_or(Value::Null);

        if let Value::Object(obj) = &exports {
            if let Some(default) = obj.get("default") {
                if !default.is_null() {
                    return Ok(default);
                }
            }
        }
        Ok(exports)
    }

    /// Call a module function by name.
    pub async fn call_function(&self, name: &str, args: Vec<Value>) -> PluginResult<Value> {
        let (index, _) = self
            .module
            .function(name)
            .ok_or_else(|| PluginError::Script(format!("function '{name}' is not defined")))?;
        self.run(index, args).await
    }

    /// Call a callable value (module function or host function).
    pub async fn call_value(&self, callee: &Value, args: Vec<Value>) -> PluginResult<Value> {
        match callee {
            Value::Function(name) => self.call_function(name, args).await,
            Value::Host(function) => function.invoke(args).await,
            other => Err(PluginError::Script(format!(
                "value of type {} is not callable",
                other.type_name()
            ))),
        }
    }

    fn lock_globals(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Value>> {
        self.globals.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn make_frame(&self, func: usize, mut args: Vec<Value>) -> Frame {
        let function = &self.module.functions[func];
        // Extra arguments are dropped, missing ones read as null.
        args.truncate(function.params.len());
        let mut locals = args;
        locals.resize(function.frame_size(), Value::Null);
        Frame {
            func,
            ip: 0,
            locals,
            stack: Vec::new(),
        }
    }

    fn push_frame(&self, frames: &mut Vec<Frame>, func: usize, args: Vec<Value>) -> PluginResult<()> {
        if frames.len() >= MAX_CALL_DEPTH {
            return Err(PluginError::Script(format!(
                "maximum call depth of {MAX_CALL_DEPTH} exceeded"
            )));
        }
        frames.push(self.make_frame(func, args));
        Ok(())
    }

    /// Resolve a `Call` target: module functions shadow bindings.
    fn resolve_call(&self, name: &str) -> PluginResult<CallTarget> {
        if let Some((index, _)) = self.module.function(name) {
            return Ok(CallTarget::Module(index));
        }
        let bound = self
            .lock_globals()
            .get(name)
            .cloned()
            .or_else(|| self.sandbox.get(name).cloned());
        match bound {
            Some(Value::Function(target)) => {
                let (index, _) = self.module.function(&target).ok_or_else(|| {
                    PluginError::Script(format!("function '{target}' is not defined"))
                })?;
                Ok(CallTarget::Module(index))
            }
            Some(Value::Host(function)) => Ok(CallTarget::Host(function)),
            Some(other) => Err(PluginError::Script(format!(
                "'{name}' is not a function (got {})",
                other.type_name()
            ))),
            None => Err(PluginError::Script(format!(
                "'{name}' is not defined in the plugin sandbox"
            ))),
        }
    }

    async fn run(&self, entry: usize, args: Vec<Value>) -> PluginResult<Value> {
        let mut frames = vec![self.make_frame(entry, args)];

        loop {
            // Falling off the end of a function returns null.
            let finished = {
                let frame = top(&mut frames)?;
                frame.ip >= self.module.functions[frame.func].instructions.len()
            };
            if finished {
                if let Some(result) = pop_frame(&mut frames, Value::Null) {
                    return Ok(result);
                }
                continue;
            }

            let (op, at) = {
                let frame = top(&mut frames)?;
                let function = &self.module.functions[frame.func];
                let op = function.instructions[frame.ip].clone();
                let at = frame.ip;
                frame.ip += 1;
                (op, at)
            };

            match op {
                Instruction::LoadConst { index } => {
                    let value = self.module.constant(index)?;
                    top(&mut frames)?.stack.push(value);
                }
                Instruction::LoadLocal { index } => {
                    let frame = top(&mut frames)?;
                    let value = frame.locals[index].clone();
                    frame.stack.push(value);
                }
                Instruction::StoreLocal { index } => {
                    let frame = top(&mut frames)?;
                    let value = pop(&mut frame.stack)?;
                    frame.locals[index] = value;
                }
                Instruction::LoadGlobal { name } => {
                    // Module functions shadow bindings, as in `Call`.
                    let value = if self.module.function(&name).is_some() {
                        Value::Function(name)
                    } else {
                        self.lock_globals()
                            .get(&name)
                            .cloned()
                            .or_else(|| self.sandbox.get(&name).cloned())
                            .ok_or_else(|| {
                                PluginError::Script(format!(
                                    "'{name}' is not defined in the plugin sandbox"
                                ))
                            })?
                    };
                    top(&mut frames)?.stack.push(value);
                }
                Instruction::StoreGlobal { name } => {
                    let value = pop(&mut top(&mut frames)?.stack)?;
                    self.lock_globals().insert(name, value);
                }
                Instruction::Call { name, arg_count } => {
                    let args = pop_n(&mut top(&mut frames)?.stack, arg_count)?;
                    match self.resolve_call(&name)? {
                        CallTarget::Module(index) => self.push_frame(&mut frames, index, args)?,
                        CallTarget::Host(function) => {
                            let result = function.invoke(args).await?;
                            top(&mut frames)?.stack.push(result);
                        }
                    }
                }
                Instruction::CallMethod { name, arg_count } => {
                    let (receiver, args) = {
                        let frame = top(&mut frames)?;
                        let args = pop_n(&mut frame.stack, arg_count)?;
                        let receiver = pop(&mut frame.stack)?;
                        (receiver, args)
                    };
                    let method = receiver
                        .as_object()
                        .ok_or_else(|| {
                            PluginError::Script(format!(
                                "cannot call method '{name}' on {}",
                                receiver.type_name()
                            ))
                        })?
                        .get(&name);
                    match method {
                        Some(Value::Host(function)) => {
                            let result = function.invoke(args).await?;
                            top(&mut frames)?.stack.push(result);
                        }
                        Some(Value::Function(target)) => {
                            let (index, _) = self.module.function(&target).ok_or_else(|| {
                                PluginError::Script(format!(
                                    "function '{target}' is not defined"
                                ))
                            })?;
                            self.push_frame(&mut frames, index, args)?;
                        }
                        _ => {
                            return Err(PluginError::Script(format!(
                                "object has no method '{name}'"
                            )))
                        }
                    }
                }
                Instruction::Return => {
                    let value = top(&mut frames)?.stack.pop().unwrap_or(Value::Null);
                    if let Some(result) = pop_frame(&mut frames, value) {
                        return Ok(result);
                    }
                }
                Instruction::Jump { offset } => {
                    top(&mut frames)?.ip = jump_target(at, offset);
                }
                Instruction::JumpIfFalse { offset } => {
                    let frame = top(&mut frames)?;
                    let condition = pop(&mut frame.stack)?;
                    if !condition.is_truthy() {
                        frame.ip = jump_target(at, offset);
                    }
                }
                Instruction::Pop => {
                    pop(&mut top(&mut frames)?.stack)?;
                }
                Instruction::Dup => {
                    let frame = top(&mut frames)?;
                    let value = frame
                        .stack
                        .last()
                        .cloned()
                        .ok_or_else(|| PluginError::Script("stack underflow".to_string()))?;
                    frame.stack.push(value);
                }
                Instruction::Add => binary(&mut frames, add)?,
                Instruction::Sub => binary(&mut frames, |a, b| numeric(a, b, "-", |x, y| x.wrapping_sub(y), |x, y| x - y))?,
                Instruction::Mul => binary(&mut frames, |a, b| numeric(a, b, "*", |x, y| x.wrapping_mul(y), |x, y| x * y))?,
                Instruction::Div => binary(&mut frames, divide)?,
                Instruction::Eq => binary(&mut frames, |a, b| Ok(Value::Bool(a == b)))?,
                Instruction::Ne => binary(&mut frames, |a, b| Ok(Value::Bool(a != b)))?,
                Instruction::Lt => binary(&mut frames, |a, b| compare(a, b, "<", |o| o.is_lt()))?,
                Instruction::Le => binary(&mut frames, |a, b| compare(a, b, "<=", |o| o.is_le()))?,
                Instruction::Gt => binary(&mut frames, |a, b| compare(a, b, ">", |o| o.is_gt()))?,
                Instruction::Ge => binary(&mut frames, |a, b| compare(a, b, ">=", |o| o.is_ge()))?,
                Instruction::Not => {
                    let frame = top(&mut frames)?;
                    let value = pop(&mut frame.stack)?;
                    frame.stack.push(Value::Bool(!value.is_truthy()));
                }
                Instruction::And => binary(&mut frames, |a, b| {
                    Ok(Value::Bool(a.is_truthy() && b.is_truthy()))
                })?,
                Instruction::Or => binary(&mut frames, |a, b| {
                    Ok(Value::Bool(a.is_truthy() || b.is_truthy()))
                })?,
                Instruction::MakeArray { count } => {
                    let frame = top(&mut frames)?;
                    let items = pop_n(&mut frame.stack, count)?;
                    frame.stack.push(Value::Array(items.into_iter().collect()));
                }
                Instruction::MakeObject { count } => {
                    let frame = top(&mut frames)?;
                    let object = Obj::new();
                    // Pairs were pushed key-then-value.
                    for _ in 0..count {
                        let value = pop(&mut frame.stack)?;
                        let key = pop(&mut frame.stack)?;
                        let key = key
                            .as_str()
                            .ok_or_else(|| {
                                PluginError::Script(format!(
                                    "object key must be a string, got {}",
                                    key.type_name()
                                ))
                            })?
                            .to_string();
                        object.set(key, value);
                    }
                    frame.stack.push(Value::Object(object));
                }
                Instruction::GetProperty { name } => {
                    let frame = top(&mut frames)?;
                    let target = pop(&mut frame.stack)?;
                    let value = get_property(&target, &name)?;
                    frame.stack.push(value);
                }
                Instruction::SetProperty { name } => {
                    let frame = top(&mut frames)?;
                    let value = pop(&mut frame.stack)?;
                    let target = pop(&mut frame.stack)?;
                    match target {
                        Value::Object(obj) => obj.set(name, value),
                        other => {
                            return Err(PluginError::Script(format!(
                                "cannot set property '{name}' on {}",
                                other.type_name()
                            )))
                        }
                    }
                }
                Instruction::GetIndex => {
                    let frame = top(&mut frames)?;
                    let index = pop(&mut frame.stack)?;
                    let target = pop(&mut frame.stack)?;
                    frame.stack.push(get_index(&target, &index)?);
                }
                Instruction::SetIndex => {
                    let frame = top(&mut frames)?;
                    let value = pop(&mut frame.stack)?;
                    let index = pop(&mut frame.stack)?;
                    let target = pop(&mut frame.stack)?;
                    set_index(&target, &index, value)?;
                }
                Instruction::Await | Instruction::Nop => {}
            }
        }
    }
}

enum CallTarget {
    Module(usize),
    Host(Arc<dyn crate::value::HostFunction>),
}

fn top<'a>(frames: &'a mut Vec<Frame>) -> PluginResult<&'a mut Frame> {
    frames
        .last_mut()
        .ok_or_else(|| PluginError::Script("call stack underflow".to_string()))
}

/// Pop the current frame, handing `value` to the caller. Returns the final
/// result when the outermost frame finished.
fn pop_frame(frames: &mut Vec<Frame>, value: Value) -> Option<Value> {
    frames.pop();
    match frames.last_mut() {
        Some(caller) => {
            caller.stack.push(value);
            None
        }
        None => Some(value),
    }
}

fn pop(stack: &mut Vec<Value>) -> PluginResult<Value> {
    stack
        .pop()
        .ok_or_else(|| PluginError::Script("stack underflow".to_string()))
}

/// Pop `count` values, returned in push order.
fn pop_n(stack: &mut Vec<Value>, count: usize) -> PluginResult<Vec<Value>> {
    if stack.len() < count {
        return Err(PluginError::Script("stack underflow".to_string()));
    }
    Ok(stack.split_off(stack.len() - count))
}

fn jump_target(at: usize, offset: i32) -> usize {
    // Static validation keeps the target in range.
    (at as i64 + offset as i64) as usize
}

fn binary(
    frames: &mut Vec<Frame>,
    op: impl FnOnce(Value, Value) -> PluginResult<Value>,
) -> PluginResult<()> {
    let frame = top(frames)?;
    let b = pop(&mut frame.stack)?;
    let a = pop(&mut frame.stack)?;
    let result = op(a, b)?;
    frame.stack.push(result);
    Ok(())
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Int(i) => Some(*i as f64),
        Value::Float(f) => Some(*f),
        _ => None,
    }
}

fn numeric(
    a: Value,
    b: Value,
    op: &str,
    int_op: impl FnOnce(i64, i64) -> i64,
    float_op: impl FnOnce(f64, f64) -> f64,
) -> PluginResult<Value> {
    match (&a, &b) {
        (Value::Int(x), Value::Int(y)) => Ok(Value::Int(int_op(*x, *y))),
        _ => match (as_number(&a), as_number(&b)) {
            (Some(x), Some(y)) => Ok(Value::Float(float_op(x, y))),
            _ => Err(PluginError::Script(format!(
                "cannot apply '{op}' to {} and {}",
                a.type_name(),
                b.type_name()
            ))),
        },
    }
}

fn add(a: Value, b: Value) -> PluginResult<Value> {
    // String concatenation wins when either side is a string.
    if matches!(a, Value::String(_)) || matches!(b, Value::String(_)) {
        return Ok(Value::String(format!(
            "{}{}",
            a.to_log_string(),
            b.to_log_string()
        )));
    }
    numeric(a, b, "+", |x, y| x.wrapping_add(y), |x, y| x + y)
}

fn divide(a: Value, b: Value) -> PluginResult<Value> {
    match (&a, &b) {
        (Value::Int(_), Value::Int(0)) => {
            Err(PluginError::Script("division by zero".to_string()))
        }
        (Value::Int(x), Value::Int(y)) => x
            .checked_div(*y)
            .map(Value::Int)
            .ok_or_else(|| PluginError::Script("integer overflow in division".to_string())),
        _ => numeric(a, b, "/", |x, y| x.wrapping_div(y), |x, y| x / y),
    }
}

fn compare(
    a: Value,
    b: Value,
    op: &str,
    check: impl FnOnce(std::cmp::Ordering) -> bool,
) -> PluginResult<Value> {
    let ordering = match (&a, &b) {
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => match (as_number(&a), as_number(&b)) {
            (Some(x), Some(y)) => x.partial_cmp(&y),
            _ => None,
        },
    };
    match ordering {
        Some(ordering) => Ok(Value::Bool(check(ordering))),
        None => Err(PluginError::Script(format!(
            "cannot compare {} {op} {}",
            a.type_name(),
            b.type_name()
        ))),
    }
}

fn get_property(target: &Value, name: &str) -> PluginResult<Value> {
    match target {
        Value::Object(obj) => Ok(obj.get(name).unwrap_or(Value::Null)),
        Value::Array(items) if name == "length" => Ok(Value::Int(items.len() as i64)),
        Value::String(s) if name == "length" => Ok(Value::Int(s.chars().count() as i64)),
        other => Err(PluginError::Script(format!(
            "cannot read property '{name}' of {}",
            other.type_name()
        ))),
    }
}

fn get_index(target: &Value, index: &Value) -> PluginResult<Value> {
    match (target, index) {
        (Value::Array(items), Value::Int(i)) => {
            if *i < 0 {
                return Ok(Value::Null);
            }
            Ok(items.get(*i as usize).unwrap_or(Value::Null))
        }
        (Value::Object(obj), Value::String(key)) => Ok(obj.get(key).unwrap_or(Value::Null)),
        (Value::String(s), Value::Int(i)) => {
            if *i < 0 {
                return Ok(Value::Null);
            }
            Ok(s.chars()
                .nth(*i as usize)
                .map(|c| Value::String(c.to_string()))
                .unwrap_or(Value::Null))
        }
        (target, index) => Err(PluginError::Script(format!(
            "cannot index {} with {}",
            target.type_name(),
            index.type_name()
        ))),
    }
}

fn set_index(target: &Value, index: &Value, value: Value) -> PluginResult<()> {
    match (target, index) {
        (Value::Array(items), Value::Int(i)) => {
            if *i < 0 || !items.set(*i as usize, value) {
                return Err(PluginError::Script(format!(
                    "array index {i} out of bounds"
                )));
            }
            Ok(())
        }
        (Value::Object(obj), Value::String(key)) => {
            obj.set(key.clone(), value);
            Ok(())
        }
        (target, index) => Err(PluginError::Script(format!(
            "cannot index {} with {}",
            target.type_name(),
            index.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::{Constant, Function};
    use crate::value::NativeFunction;
    use std::sync::Mutex as StdMutex;

    fn module_of(constants: Vec<Constant>, functions: Vec<Function>) -> Arc<ScriptModule> {
        let entry_point = functions[0].name.clone();
        let module = ScriptModule {
            version: 1,
            constants,
            functions,
            entry_point,
        };
        module.validate().unwrap();
        Arc::new(module)
    }

    fn eval(module: Arc<ScriptModule>) -> Evaluator {
        Evaluator::new(module, Sandbox::default())
    }

    #[tokio::test]
    async fn test_arithmetic() {
        let module = module_of(
            vec![Constant::Int(20), Constant::Int(4)],
            vec![Function {
                name: "main".into(),
                params: vec![],
                instructions: vec![
                    Instruction::LoadConst { index: 0 },
                    Instruction::LoadConst { index: 1 },
                    Instruction::Add,
                    Instruction::LoadConst { index: 1 },
                    Instruction::Div,
                    Instruction::Return,
                ],
                local_count: 0,
            }],
        );
        let result = eval(module).call_function("main", vec![]).await.unwrap();
        assert_eq!(result, Value::Int(6));
    }

    #[tokio::test]
    async fn test_division_by_zero() {
        let module = module_of(
            vec![Constant::Int(1), Constant::Int(0)],
            vec![Function {
                name: "main".into(),
                params: vec![],
                instructions: vec![
                    Instruction::LoadConst { index: 0 },
                    Instruction::LoadConst { index: 1 },
                    Instruction::Div,
                    Instruction::Return,
                ],
                local_count: 0,
            }],
        );
        let err = eval(module).call_function("main", vec![]).await.unwrap_err();
        assert!(err.to_string().contains("division by zero"));
    }

    #[tokio::test]
    async fn test_string_concat() {
        let module = module_of(
            vec![Constant::String("n = ".into()), Constant::Int(3)],
            vec![Function {
                name: "main".into(),
                params: vec![],
                instructions: vec![
                    Instruction::LoadConst { index: 0 },
                    Instruction::LoadConst { index: 1 },
                    Instruction::Add,
                    Instruction::Return,
                ],
                local_count: 0,
            }],
        );
        let result = eval(module).call_function("main", vec![]).await.unwrap();
        assert_eq!(result, Value::string("n = 3"));
    }

    #[tokio::test]
    async fn test_loop_with_locals_and_jumps() {
        // sum = 0; i = 1; while i <= 5 { sum += i; i += 1 } return sum
        let module = module_of(
            vec![Constant::Int(0), Constant::Int(1), Constant::Int(5)],
            vec![Function {
                name: "main".into(),
                params: vec![],
                instructions: vec![
                    // 0: sum = 0
                    Instruction::LoadConst { index: 0 },
                    Instruction::StoreLocal { index: 0 },
                    // 2: i = 1
                    Instruction::LoadConst { index: 1 },
                    Instruction::StoreLocal { index: 1 },
                    // 4: loop head: i <= 5 ?
                    Instruction::LoadLocal { index: 1 },
                    Instruction::LoadConst { index: 2 },
                    Instruction::Le,
                    Instruction::JumpIfFalse { offset: 11 }, // -> 18
                    // 8: sum += i
                    Instruction::LoadLocal { index: 0 },
                    Instruction::LoadLocal { index: 1 },
                    Instruction::Add,
                    Instruction::StoreLocal { index: 0 },
                    // 12: i += 1
                    Instruction::LoadLocal { index: 1 },
                    Instruction::LoadConst { index: 1 },
                    Instruction::Add,
                    Instruction::StoreLocal { index: 1 },
                    // 16: back to loop head
                    Instruction::Jump { offset: -12 }, // -> 4
                    Instruction::Nop,
                    // 18: return sum
                    Instruction::LoadLocal { index: 0 },
                    Instruction::Return,
                ],
                local_count: 2,
            }],
        );
        let result = eval(module).call_function("main", vec![]).await.unwrap();
        assert_eq!(result, Value::Int(15));
    }

    #[tokio::test]
    async fn test_module_function_call_with_args() {
        let module = module_of(
            vec![Constant::Int(7), Constant::Int(5)],
            vec![
                Function {
                    name: "main".into(),
                    params: vec![],
                    instructions: vec![
                        Instruction::LoadConst { index: 0 },
                        Instruction::LoadConst { index: 1 },
                        Instruction::Call { name: "sub".into(), arg_count: 2 },
                        Instruction::Return,
                    ],
                    local_count: 0,
                },
                Function {
                    name: "sub".into(),
                    params: vec!["a".into(), "b".into()],
                    instructions: vec![
                        Instruction::LoadLocal { index: 0 },
                        Instruction::LoadLocal { index: 1 },
                        Instruction::Sub,
                        Instruction::Return,
                    ],
                    local_count: 0,
                },
            ],
        );
        let result = eval(module).call_function("main", vec![]).await.unwrap();
        assert_eq!(result, Value::Int(2));
    }

    #[tokio::test]
    async fn test_host_function_call() {
        let seen: Arc<StdMutex<Vec<String>>> = Arc::default();
        let record = {
            let seen = seen.clone();
            NativeFunction::new("record", move |args: Vec<Value>| {
                let mut seen = seen.lock().unwrap();
                for arg in &args {
                    seen.push(arg.to_log_string());
                }
                Ok(Value::string("ok"))
            })
        };

        let mut env = crate::sandbox::HostEnvironment::new();
        env.register_function(record);
        let manifest = crate::manifest::PluginManifest::from_str(
            r#"{
                "entry": "x.apm",
                "metadata": { "id": "t", "name": "T", "version": "1.0.0" },
                "compatibleVersions": { "min": "1.0.0" }
            }"#,
        )
        .unwrap();
        let options = crate::sandbox::LoaderOptions {
            allowed_globals: vec!["record".to_string()],
            ..Default::default()
        };
        let sandbox = crate::sandbox::SandboxBuilder::new(&env, &manifest, &options)
            .build(Value::host(NativeFunction::new("fetch", |_| Ok(Value::Null))))
            .unwrap();

        let module = module_of(
            vec![Constant::String("hello".into())],
            vec![Function {
                name: "main".into(),
                params: vec![],
                instructions: vec![
                    Instruction::LoadConst { index: 0 },
                    Instruction::Call { name: "record".into(), arg_count: 1 },
                    Instruction::Return,
                ],
                local_count: 0,
            }],
        );

        let evaluator = Evaluator::new(module, sandbox);
        let result = evaluator.call_function("main", vec![]).await.unwrap();
        assert_eq!(result, Value::string("ok"));
        assert_eq!(seen.lock().unwrap().as_slice(), ["hello"]);
    }

    #[tokio::test]
    async fn test_unknown_global_is_an_error() {
        let module = module_of(
            vec![],
            vec![Function {
                name: "main".into(),
                params: vec![],
                instructions: vec![
                    Instruction::LoadGlobal { name: "document".into() },
                    Instruction::Return,
                ],
                local_count: 0,
            }],
        );
        let err = eval(module).call_function("main", vec![]).await.unwrap_err();
        assert!(err
            .to_string()
            .contains("'document' is not defined in the plugin sandbox"));
    }

    #[tokio::test]
    async fn test_module_exports_pattern() {
        // module.exports = { answer: 42 }
        let module = module_of(
            vec![Constant::String("answer".into()), Constant::Int(42)],
            vec![Function {
                name: "main".into(),
                params: vec![],
                instructions: vec![
                    Instruction::LoadGlobal { name: "module".into() },
                    Instruction::LoadConst { index: 0 },
                    Instruction::LoadConst { index: 1 },
                    Instruction::MakeObject { count: 1 },
                    Instruction::SetProperty { name: "exports".into() },
                ],
                local_count: 0,
            }],
        );
        let exports = eval(module).evaluate_module().await.unwrap();
        let obj = exports.as_object().unwrap();
        assert_eq!(obj.get("answer"), Some(Value::Int(42)));
    }

    #[tokio::test]
    async fn test_exports_alias_is_same_object() {
        // exports.answer = 1  (through the seeded alias, not module.exports)
        let module = module_of(
            vec![Constant::Int(1)],
            vec![Function {
                name: "main".into(),
                params: vec![],
                instructions: vec![
                    Instruction::LoadGlobal { name: "exports".into() },
                    Instruction::LoadConst { index: 0 },
                    Instruction::SetProperty { name: "answer".into() },
                ],
                local_count: 0,
            }],
        );
        let exports = eval(module).evaluate_module().await.unwrap();
        assert_eq!(exports.as_object().unwrap().get("answer"), Some(Value::Int(1)));
    }

    #[tokio::test]
    async fn test_default_export_unwrapped() {
        // module.exports = { default: { kind: "d" } }
        let module = module_of(
            vec![
                Constant::String("default".into()),
                Constant::String("kind".into()),
                Constant::String("d".into()),
            ],
            vec![Function {
                name: "main".into(),
                params: vec![],
                instructions: vec![
                    Instruction::LoadGlobal { name: "module".into() },
                    Instruction::LoadConst { index: 0 },
                    Instruction::LoadConst { index: 1 },
                    Instruction::LoadConst { index: 2 },
                    Instruction::MakeObject { count: 1 },
                    Instruction::MakeObject { count: 1 },
                    Instruction::SetProperty { name: "exports".into() },
                ],
                local_count: 0,
            }],
        );
        let exports = eval(module).evaluate_module().await.unwrap();
        assert_eq!(
            exports.as_object().unwrap().get("kind"),
            Some(Value::string("d"))
        );
    }

    #[tokio::test]
    async fn test_call_depth_limit() {
        let module = module_of(
            vec![],
            vec![Function {
                name: "main".into(),
                params: vec![],
                instructions: vec![
                    Instruction::Call { name: "main".into(), arg_count: 0 },
                    Instruction::Return,
                ],
                local_count: 0,
            }],
        );
        let err = eval(module).call_function("main", vec![]).await.unwrap_err();
        assert!(err.to_string().contains("maximum call depth"));
    }

    #[tokio::test]
    async fn test_arrays_and_indexing() {
        let module = module_of(
            vec![Constant::Int(10), Constant::Int(20), Constant::Int(1)],
            vec![Function {
                name: "main".into(),
                params: vec![],
                instructions: vec![
                    Instruction::LoadConst { index: 0 },
                    Instruction::LoadConst { index: 1 },
                    Instruction::MakeArray { count: 2 },
                    Instruction::LoadConst { index: 2 },
                    Instruction::GetIndex,
                    Instruction::Return,
                ],
                local_count: 0,
            }],
        );
        let result = eval(module).call_function("main", vec![]).await.unwrap();
        assert_eq!(result, Value::Int(20));
    }

    #[tokio::test]
    async fn test_missing_args_read_as_null() {
        let module = module_of(
            vec![],
            vec![Function {
                name: "main".into(),
                params: vec!["a".into()],
                instructions: vec![
                    Instruction::LoadLocal { index: 0 },
                    Instruction::Return,
                ],
                local_count: 0,
            }],
        );
        let result = eval(module).call_function("main", vec![]).await.unwrap();
        assert_eq!(result, Value::Null);
    }

    #[tokio::test]
    async fn test_call_value_rejects_non_callable() {
        let module = module_of(
            vec![],
            vec![Function {
                name: "main".into(),
                params: vec![],
                instructions: vec![Instruction::Return],
                local_count: 0,
            }],
        );
        let evaluator = eval(module);
        let err = evaluator
            .call_value(&Value::Int(1), vec![])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not callable"));
    }
}
