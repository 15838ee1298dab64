use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::ast::{Block, Expr, Literal, Script};
use crate::compiler::allocate_slots;
use crate::object::{Record, Shape, literal_layout};
use crate::runtime::{Failure, Function, Runtime, Value};

// ── Environment ─────────────────────────────────────────────────────

/// Variables of one function activation. Blocks do not open scopes: every
/// `var` in a body lives in its function's scope, as it does in the VM.
struct Scope {
    vars: RefCell<HashMap<String, Value>>,
    parent: Option<Rc<Scope>>,
}

impl Scope {
    fn new(parent: Option<Rc<Scope>>) -> Self {
        Scope { vars: RefCell::new(HashMap::new()), parent }
    }

    fn define(&self, name: &str, value: Value) {
        self.vars.borrow_mut().insert(name.to_string(), value);
    }

    fn lookup(&self, name: &str) -> Option<Value> {
        if let Some(value) = self.vars.borrow().get(name) {
            return Some(value.clone());
        }
        self.parent.as_ref()?.lookup(name)
    }

    /// Update the nearest definition. Returns false when there is none.
    fn assign(&self, name: &str, value: Value) -> bool {
        if let Some(slot) = self.vars.borrow_mut().get_mut(name) {
            *slot = value;
            return true;
        }
        match &self.parent {
            Some(parent) => parent.assign(name, value),
            None => false,
        }
    }

    /// Declare every `var` of `body` up front, as `undefined`. Names that
    /// are already bound (parameters, `this`) keep their value.
    fn hoist(&self, body: &Block) {
        let mut declared = Shape::new();
        for instr in &body.instrs {
            allocate_slots(instr, &mut declared);
        }
        let mut vars = self.vars.borrow_mut();
        for name in declared.names() {
            vars.entry(name.to_string()).or_insert(Value::Undefined);
        }
    }
}

/// A function literal evaluated by the interpreter, closed over the scope
/// it was created in.
pub struct Closure {
    params: Vec<String>,
    body: Block,
    scope: Rc<Scope>,
}

/// Result of executing an instruction.
enum Flow {
    Normal,
    Return(Value),
}

// Boxed: recursive frames carry a pointer, not a whole `Failure`.
type Result<T> = std::result::Result<T, Box<Failure>>;

fn at_line(failure: Box<Failure>, line: u32) -> Box<Failure> {
    Box::new((*failure).at_line(line))
}

// ── Entry points ────────────────────────────────────────────────────

/// Evaluate `script` directly over the tree. The top-level block behaves as
/// the body of a function `main` with an undefined receiver.
pub fn run(rt: &mut Runtime, script: &Script) -> std::result::Result<Value, Failure> {
    let scope = Rc::new(Scope::new(None));
    scope.define("this", Value::Undefined);
    scope.hoist(&script.body);
    rt.enter_call()?;
    let flow = exec_block(rt, &scope, &script.body);
    rt.leave_call();
    match flow.map_err(|e| (*e).in_function("main"))? {
        Flow::Normal => Ok(Value::Undefined),
        Flow::Return(value) => Ok(value),
    }
}

/// Invoke a closure; reached through `Function::invoke`.
pub fn call(
    rt: &mut Runtime,
    function: &Rc<Function>,
    closure: &Closure,
    receiver: Value,
    args: &[Value],
) -> std::result::Result<Value, Failure> {
    if args.len() != closure.params.len() {
        return Err(Failure::arity(function.name(), closure.params.len(), args.len()));
    }
    let scope = Rc::new(Scope::new(Some(closure.scope.clone())));
    scope.define("this", receiver);
    for (param, arg) in closure.params.iter().zip(args) {
        scope.define(param, arg.clone());
    }
    scope.hoist(&closure.body);
    tracing::trace!(function = %function.name(), argc = args.len(), depth = rt.depth(), "interpret call");
    let flow = exec_block(rt, &scope, &closure.body).map_err(|e| (*e).in_function(function.name()))?;
    Ok(match flow {
        Flow::Normal => Value::Undefined,
        Flow::Return(value) => value,
    })
}

// ── Instructions ────────────────────────────────────────────────────

fn exec_block(rt: &mut Runtime, scope: &Rc<Scope>, block: &Block) -> Result<Flow> {
    for instr in &block.instrs {
        if let Flow::Return(value) = exec(rt, scope, instr)? {
            return Ok(Flow::Return(value));
        }
    }
    Ok(Flow::Normal)
}

fn exec(rt: &mut Runtime, scope: &Rc<Scope>, expr: &Expr) -> Result<Flow> {
    exec_inner(rt, scope, expr).map_err(|e| at_line(e, expr.line()))
}

fn exec_inner(rt: &mut Runtime, scope: &Rc<Scope>, expr: &Expr) -> Result<Flow> {
    match expr {
        Expr::Block(block) => exec_block(rt, scope, block),
        Expr::LocalVarAssignment { name, expr, declaration, .. } => {
            exec_assign(rt, scope, name, expr, *declaration)?;
            Ok(Flow::Normal)
        }
        Expr::FieldAssignment { receiver, name, expr, .. } => {
            exec_put(rt, scope, receiver, name, expr)?;
            Ok(Flow::Normal)
        }
        Expr::If { condition, true_block, false_block, .. } => {
            if eval(rt, scope, condition)?.is_false() {
                exec_block(rt, scope, false_block)
            } else {
                exec_block(rt, scope, true_block)
            }
        }
        Expr::Return { expr, .. } => Ok(Flow::Return(eval(rt, scope, expr)?)),
        _ => {
            eval(rt, scope, expr)?;
            Ok(Flow::Normal)
        }
    }
}

fn exec_assign(rt: &mut Runtime, scope: &Rc<Scope>, name: &str, expr: &Expr, declaration: bool) -> Result<()> {
    let value = eval(rt, scope, expr)?;
    if declaration {
        scope.define(name, value);
    } else if !scope.assign(name, value) {
        return Err(Failure::undefined_variable(name).into());
    }
    Ok(())
}

fn exec_put(rt: &mut Runtime, scope: &Rc<Scope>, receiver: &Expr, name: &str, expr: &Expr) -> Result<()> {
    let receiver = eval(rt, scope, receiver)?;
    let value = eval(rt, scope, expr)?;
    Ok(rt.put_field(&receiver, name, value)?)
}

// ── Expressions ─────────────────────────────────────────────────────

fn eval(rt: &mut Runtime, scope: &Rc<Scope>, expr: &Expr) -> Result<Value> {
    eval_inner(rt, scope, expr).map_err(|e| at_line(e, expr.line()))
}

fn eval_inner(rt: &mut Runtime, scope: &Rc<Scope>, expr: &Expr) -> Result<Value> {
    match expr {
        Expr::Literal { value: Literal::Int(n), .. } => Ok(Value::Int(*n)),
        Expr::Literal { value: Literal::Str(s), .. } => Ok(Value::from(s.as_str())),
        Expr::LocalVarAccess { name, .. } => Ok(scope.lookup(name).unwrap_or_else(|| rt.globals.lookup(name))),
        Expr::Fun { name, parameters, body, .. } => Ok(eval_fun(rt, scope, name.as_deref(), parameters, body)),
        Expr::FunCall { qualifier, args, .. } => eval_call(rt, scope, qualifier, args),
        Expr::New { init, .. } => eval_new(rt, scope, init),
        Expr::FieldAccess { receiver, name, .. } => {
            let receiver = eval(rt, scope, receiver)?;
            Ok(rt.get_field(&receiver, name)?)
        }
        Expr::MethodCall { receiver, name, args, .. } => eval_method(rt, scope, receiver, name, args),
        Expr::Block(_)
        | Expr::LocalVarAssignment { .. }
        | Expr::FieldAssignment { .. }
        | Expr::If { .. }
        | Expr::Return { .. } => Err(Failure::internal("instruction used as a value").into()),
    }
}

/// Named literals also bind themselves as globals.
fn eval_fun(rt: &mut Runtime, scope: &Rc<Scope>, name: Option<&str>, params: &[String], body: &Block) -> Value {
    let closure = Closure { params: params.to_vec(), body: body.clone(), scope: scope.clone() };
    let function = Value::Function(Function::closure(name.unwrap_or("lambda"), closure));
    if let Some(name) = name {
        rt.globals.register(name, function.clone());
    }
    function
}

fn eval_call(rt: &mut Runtime, scope: &Rc<Scope>, qualifier: &Expr, args: &[Expr]) -> Result<Value> {
    let callee = eval(rt, scope, qualifier)?;
    let args = eval_all(rt, scope, args)?;
    invoke(rt, callee, Value::Undefined, &args)
}

fn eval_new(rt: &mut Runtime, scope: &Rc<Scope>, init: &[(String, Expr)]) -> Result<Value> {
    let (shape, keep) = literal_layout(init.iter().map(|(key, _)| key.as_str()));
    let mut fields = Vec::with_capacity(shape.len() as usize);
    for ((_, value), keep) in init.iter().zip(keep) {
        let value = eval(rt, scope, value)?;
        if keep {
            fields.push(value);
        }
    }
    Ok(Value::Record(Rc::new(Record::new(Rc::new(shape), fields))))
}

fn eval_method(rt: &mut Runtime, scope: &Rc<Scope>, receiver: &Expr, name: &str, args: &[Expr]) -> Result<Value> {
    let receiver = eval(rt, scope, receiver)?;
    let method = rt.get_field(&receiver, name)?;
    let args = eval_all(rt, scope, args)?;
    invoke(rt, method, receiver, &args)
}

fn eval_all(rt: &mut Runtime, scope: &Rc<Scope>, exprs: &[Expr]) -> Result<Vec<Value>> {
    exprs.iter().map(|e| eval(rt, scope, e)).collect()
}

fn invoke(rt: &mut Runtime, callee: Value, receiver: Value, args: &[Value]) -> Result<Value> {
    match callee {
        Value::Function(f) => Ok(f.invoke(rt, receiver, args)?),
        other => Err(Failure::type_mismatch("function", &other).into()),
    }
}
