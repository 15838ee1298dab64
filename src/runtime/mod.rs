use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::rc::Rc;

use crate::interpreter::Closure;
use crate::object::{Record, Shape};
use crate::vm::{Code, Dictionary, VmConfig};

pub mod builtins;

// ---- Values ----

/// Caller-visible runtime value.
///
/// This is what native built-ins, the interpreter and the embedding host
/// see. Inside the VM values travel as 32-bit `Tagged` words and are only
/// decoded into this form at the boundaries.
#[derive(Clone)]
pub enum Value {
    Undefined,
    Int(i32),
    Str(Rc<str>),
    Function(Rc<Function>),
    Shape(Rc<Shape>),
    Record(Rc<Record>),
    /// The global environment seen as an object. Bound to the name
    /// `global`; its fields are the global bindings.
    Global,
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Int(_) => "integer",
            Value::Str(_) => "string",
            Value::Function(_) => "function",
            Value::Shape(_) => "shape",
            Value::Record(_) | Value::Global => "object",
        }
    }

    pub fn bool(b: bool) -> Value {
        Value::Int(b as i32)
    }

    /// Branch rule shared by both engines: only the integer 0 is false.
    pub fn is_false(&self) -> bool {
        matches!(self, Value::Int(0))
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    /// Value equality as seen by `==`: integers and strings by content,
    /// everything else by identity.
    pub fn same(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) => true,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            (Value::Shape(a), Value::Shape(b)) => Rc::ptr_eq(a, b),
            (Value::Record(a), Value::Record(b)) => a.same(b),
            (Value::Global, Value::Global) => true,
            _ => false,
        }
    }

    pub fn as_function(&self) -> Option<&Rc<Function>> {
        match self {
            Value::Function(f) => Some(f),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        self.same(other)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(Rc::from(s))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => write!(f, "undefined"),
            Value::Int(n) => write!(f, "{n}"),
            Value::Str(s) => write!(f, "{s}"),
            Value::Function(func) => write!(f, "function {}", func.name()),
            Value::Shape(shape) => write!(f, "{shape}"),
            Value::Record(record) => write!(f, "{record}"),
            Value::Global => write!(f, "global"),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => write!(f, "{s:?}"),
            other => write!(f, "{other}"),
        }
    }
}

// ---- Functions ----

/// Host handler: output sink, receiver, arguments.
pub type NativeFn = Rc<dyn Fn(&mut dyn Write, &Value, &[Value]) -> Result<Value, Failure>>;

enum FunctionKind {
    Native(NativeFn),
    Bytecode(Rc<Code>),
    Closure(Closure),
}

/// Named first-class callable.
pub struct Function {
    name: String,
    kind: FunctionKind,
}

impl Function {
    pub fn native(
        name: impl Into<String>,
        handler: impl Fn(&mut dyn Write, &Value, &[Value]) -> Result<Value, Failure> + 'static,
    ) -> Rc<Function> {
        Rc::new(Function { name: name.into(), kind: FunctionKind::Native(Rc::new(handler)) })
    }

    pub fn bytecode(name: impl Into<String>, code: Code) -> Rc<Function> {
        Rc::new(Function { name: name.into(), kind: FunctionKind::Bytecode(Rc::new(code)) })
    }

    pub fn closure(name: impl Into<String>, closure: Closure) -> Rc<Function> {
        Rc::new(Function { name: name.into(), kind: FunctionKind::Closure(closure) })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The bytecode body, if this function was compiled for the VM.
    pub fn code(&self) -> Option<&Rc<Code>> {
        match &self.kind {
            FunctionKind::Bytecode(code) => Some(code),
            _ => None,
        }
    }

    /// Call with an explicit receiver (`this`). Bytecode bodies run on a
    /// fresh VM, closures on the interpreter, natives directly.
    ///
    /// VM and interpreter entries nest on the host stack and count against
    /// `VmConfig::call_depth_limit`.
    pub fn invoke(
        self: &Rc<Self>,
        rt: &mut Runtime,
        receiver: Value,
        args: &[Value],
    ) -> Result<Value, Failure> {
        if let FunctionKind::Native(handler) = &self.kind {
            return handler(rt.out.as_mut(), &receiver, args);
        }
        rt.enter_call()?;
        let result = match &self.kind {
            FunctionKind::Closure(closure) => crate::interpreter::call(rt, self, closure, receiver, args),
            _ => crate::vm::execute(rt, self, receiver, args),
        };
        rt.leave_call();
        result
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            FunctionKind::Native(_) => "native",
            FunctionKind::Bytecode(_) => "bytecode",
            FunctionKind::Closure(_) => "closure",
        };
        write!(f, "Function({} {kind})", self.name)
    }
}

// ---- Failures ----

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Stack,
    Heap,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Stack => write!(f, "stack"),
            Resource::Heap => write!(f, "heap"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ErrorKind {
    #[error("wrong number of arguments for {function}: expected {expected} but was {found}")]
    ArityMismatch { function: String, expected: usize, found: usize },
    #[error("unknown local variable {name}")]
    UndefinedVariable { name: String },
    #[error("type error: {found} is not a {expected}")]
    TypeMismatch { expected: &'static str, found: String },
    #[error("invalid field {field}")]
    InvalidField { field: String },
    #[error("division by zero")]
    DivisionByZero,
    #[error("{resource} exhausted (capacity {capacity})")]
    ResourceExhaustion { resource: Resource, capacity: usize },
    #[error("internal inconsistency: {detail}")]
    InternalInconsistency { detail: String },
}

impl ErrorKind {
    /// Stable diagnostic code, see `diagnostic::registry`.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::ArityMismatch { .. } => "SJS-E001",
            ErrorKind::UndefinedVariable { .. } => "SJS-E002",
            ErrorKind::TypeMismatch { .. } => "SJS-E003",
            ErrorKind::InvalidField { .. } => "SJS-E004",
            ErrorKind::DivisionByZero => "SJS-E005",
            ErrorKind::ResourceExhaustion { .. } => "SJS-E006",
            ErrorKind::InternalInconsistency { .. } => "SJS-E007",
        }
    }
}

/// Where a failure happened. Filled in innermost-first as the failure
/// propagates; later annotations never overwrite earlier ones.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Context {
    pub op: Option<&'static str>,
    pub function: Option<String>,
    pub line: Option<u32>,
}

impl Context {
    pub fn is_empty(&self) -> bool {
        self.op.is_none() && self.function.is_none() && self.line.is_none()
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return Ok(());
        }
        let mut parts = Vec::new();
        if let Some(op) = self.op {
            parts.push(format!("in {op}"));
        }
        if let Some(function) = &self.function {
            parts.push(format!("function {function}"));
        }
        if let Some(line) = self.line {
            parts.push(format!("line {line}"));
        }
        write!(f, " ({})", parts.join(", "))
    }
}

/// A program-fatal condition. Nothing in the language can catch it; it
/// aborts the run and surfaces to the embedder.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}{context}")]
pub struct Failure {
    pub kind: ErrorKind,
    pub context: Context,
}

impl Failure {
    pub fn new(kind: ErrorKind) -> Self {
        Failure { kind, context: Context::default() }
    }

    pub fn arity(function: &str, expected: usize, found: usize) -> Self {
        Failure::new(ErrorKind::ArityMismatch { function: function.to_string(), expected, found })
    }

    pub fn undefined_variable(name: &str) -> Self {
        Failure::new(ErrorKind::UndefinedVariable { name: name.to_string() })
    }

    pub fn type_mismatch(expected: &'static str, found: &Value) -> Self {
        let found = match found {
            Value::Str(s) => format!("\"{s}\""),
            other => format!("{other} ({})", other.type_name()),
        };
        Failure::new(ErrorKind::TypeMismatch { expected, found })
    }

    pub fn invalid_field(field: &str) -> Self {
        Failure::new(ErrorKind::InvalidField { field: field.to_string() })
    }

    pub fn exhausted(resource: Resource, capacity: usize) -> Self {
        Failure::new(ErrorKind::ResourceExhaustion { resource, capacity })
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Failure::new(ErrorKind::InternalInconsistency { detail: detail.into() })
    }

    pub fn with_op(mut self, op: &'static str) -> Self {
        self.context.op.get_or_insert(op);
        self
    }

    pub fn in_function(mut self, name: &str) -> Self {
        if self.context.function.is_none() {
            self.context.function = Some(name.to_string());
        }
        self
    }

    /// Line 0 means "unknown" and is ignored.
    pub fn at_line(mut self, line: u32) -> Self {
        if line != 0 {
            self.context.line.get_or_insert(line);
        }
        self
    }

    pub fn code(&self) -> &'static str {
        self.kind.code()
    }
}

impl From<ErrorKind> for Failure {
    fn from(kind: ErrorKind) -> Self {
        Failure::new(kind)
    }
}

// ---- Global environment ----

/// Process-wide name → value mapping. Names that are not local slots
/// resolve here at run time; unknown names read as `undefined`.
#[derive(Default)]
pub struct Globals {
    bindings: HashMap<String, Value>,
}

impl Globals {
    pub fn new() -> Self {
        Globals::default()
    }

    /// Globals pre-populated with the arithmetic, comparison and `print`
    /// built-ins, plus `global` bound to the environment itself.
    pub fn with_builtins() -> Self {
        let mut globals = Globals::new();
        builtins::install(&mut globals);
        globals.register("global", Value::Global);
        globals
    }

    pub fn register(&mut self, name: &str, value: Value) {
        self.bindings.insert(name.to_string(), value);
    }

    pub fn lookup(&self, name: &str) -> Value {
        self.bindings.get(name).cloned().unwrap_or(Value::Undefined)
    }
}

// ---- Runtime ----

/// Everything a program run owns: global environment, constant
/// dictionary, output sink and VM limits.
pub struct Runtime {
    pub globals: Globals,
    pub dict: Dictionary,
    pub config: VmConfig,
    out: Box<dyn Write>,
    heaps_created: u32,
    depth: usize,
}

impl Runtime {
    pub fn new(config: VmConfig) -> Self {
        Runtime::with_output(config, Box::new(std::io::stdout()))
    }

    pub fn with_output(config: VmConfig, out: Box<dyn Write>) -> Self {
        Runtime {
            globals: Globals::with_builtins(),
            dict: Dictionary::new(),
            config,
            out,
            heaps_created: 0,
            depth: 0,
        }
    }

    /// Nested `Function::invoke` calls currently active.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Stack exhaustion is reported against `stack_capacity`, the same
    /// limit the VM reports, so both engines fail alike.
    pub(crate) fn enter_call(&mut self) -> Result<(), Failure> {
        if self.depth >= self.config.call_depth_limit() {
            tracing::debug!(depth = self.depth, "call depth limit reached");
            return Err(Failure::exhausted(Resource::Stack, self.config.stack_capacity));
        }
        self.depth += 1;
        Ok(())
    }

    pub(crate) fn leave_call(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    /// `receiver.name` for a caller-visible receiver. Unknown fields read
    /// as `undefined`.
    pub fn get_field(&self, receiver: &Value, name: &str) -> Result<Value, Failure> {
        match receiver {
            Value::Record(record) => Ok(record.get(name).unwrap_or(Value::Undefined)),
            Value::Global => Ok(self.globals.lookup(name)),
            other => Err(Failure::type_mismatch("object", other)),
        }
    }

    /// `receiver.name = value`. Records only accept fields of their shape;
    /// the global object accepts any name.
    pub fn put_field(&mut self, receiver: &Value, name: &str, value: Value) -> Result<(), Failure> {
        match receiver {
            Value::Record(record) => {
                if record.set(name, value) { Ok(()) } else { Err(Failure::invalid_field(name)) }
            }
            Value::Global => {
                self.globals.register(name, value);
                Ok(())
            }
            other => Err(Failure::type_mismatch("object", other)),
        }
    }

    /// Fresh identity for a VM heap, so records can tell which heap they
    /// were materialized from.
    pub(crate) fn next_heap_id(&mut self) -> u32 {
        self.heaps_created += 1;
        self.heaps_created
    }
}

/// In-memory output sink. Clones share the same buffer, so one clone can be
/// handed to a `Runtime` while another reads what was printed.
#[derive(Clone, Default)]
pub struct Capture {
    buffer: Rc<RefCell<Vec<u8>>>,
}

impl Capture {
    pub fn new() -> Self {
        Capture::default()
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buffer.borrow()).into_owned()
    }

    pub fn lines(&self) -> Vec<String> {
        self.contents().lines().map(str::to_string).collect()
    }
}

impl Write for Capture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
