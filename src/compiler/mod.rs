use std::rc::Rc;

use crate::ast::{Block, Expr, Literal, Script};
use crate::object::{Shape, literal_layout};
use crate::runtime::{Failure, Function, Value};
use crate::vm::tagged::Tagged;
use crate::vm::{
    Code, Dictionary, OP_CONST, OP_DUP, OP_FUNCALL, OP_GET, OP_GOTO, OP_JUMP_IF_FALSE, OP_LOAD,
    OP_LOOKUP, OP_NEW, OP_POP, OP_PUT, OP_REGISTER, OP_RET, OP_STORE, OP_SWAP,
};

const ANONYMOUS: &str = "lambda";

// ── Slot allocation ─────────────────────────────────────────────────

/// Give every `var` declared in `expr` a slot in `scope`. Walks blocks and
/// both branches of conditionals; function literals have their own scope
/// and are skipped. A name declared twice keeps its first slot.
pub fn allocate_slots(expr: &Expr, scope: &mut Shape) {
    match expr {
        Expr::Block(block) => allocate_block(block, scope),
        Expr::If { true_block, false_block, .. } => {
            allocate_block(true_block, scope);
            allocate_block(false_block, scope);
        }
        Expr::LocalVarAssignment { name, declaration: true, .. } => {
            scope.register(name);
        }
        _ => {}
    }
}

fn allocate_block(block: &Block, scope: &mut Shape) {
    for instr in &block.instrs {
        allocate_slots(instr, scope);
    }
}

// ── Entry points ────────────────────────────────────────────────────

/// Compile the top-level block as the zero-parameter function `main`.
pub fn compile_script(script: &Script, dict: &mut Dictionary) -> Result<Rc<Function>, Failure> {
    compile_function(Some("main"), &[], &script.body, dict, None)
}

/// Compile a function body. `enclosing` is the scope of the function the
/// literal appears in; it is only consulted to warn about outer locals,
/// which are not captured.
pub fn compile_function(
    name: Option<&str>,
    params: &[String],
    body: &Block,
    dict: &mut Dictionary,
    enclosing: Option<Rc<Shape>>,
) -> Result<Rc<Function>, Failure> {
    let name = name.unwrap_or(ANONYMOUS);

    let mut scope = match enclosing {
        Some(parent) => Shape::with_parent(parent),
        None => Shape::new(),
    };
    scope.register("this");
    for param in params {
        scope.push(param);
    }
    let param_count = scope.len();
    allocate_block(body, &mut scope);

    let mut emitter = Emitter {
        dict,
        scope: Rc::new(scope),
        function: name,
        instrs: Vec::new(),
        lines: Vec::new(),
        line: body.line,
    };
    emitter.block(body)?;
    emitter.emit_undefined();
    emitter.emit(OP_RET);

    let code = Code {
        instrs: emitter.instrs,
        lines: emitter.lines,
        param_count,
        slot_count: emitter.scope.len(),
    };
    tracing::debug!(
        function = name,
        params = param_count - 1,
        slots = code.slot_count,
        words = code.instrs.len(),
        "compiled"
    );
    Ok(Function::bytecode(name, code))
}

// ── Emitter ─────────────────────────────────────────────────────────

struct Emitter<'a> {
    dict: &'a mut Dictionary,
    scope: Rc<Shape>,
    function: &'a str,
    instrs: Vec<u32>,
    lines: Vec<u32>,
    /// Line of the innermost node with a known line.
    line: u32,
}

impl Emitter<'_> {
    fn emit(&mut self, word: u32) -> usize {
        let pos = self.instrs.len();
        self.instrs.push(word);
        self.lines.push(self.line);
        pos
    }

    fn emit_with(&mut self, op: u32, operand: u32) {
        self.emit(op);
        self.emit(operand);
    }

    fn emit_const(&mut self, value: Value) -> Result<(), Failure> {
        let tag = self.dict.register(value)?;
        self.emit_with(OP_CONST, tag.to_bits());
        Ok(())
    }

    fn emit_undefined(&mut self) {
        self.emit_with(OP_CONST, Tagged::UNDEFINED.to_bits());
    }

    fn emit_name(&mut self, op: u32, name: &str) -> Result<(), Failure> {
        let tag = self.dict.register(Value::from(name))?;
        self.emit_with(op, tag.to_bits());
        Ok(())
    }

    /// Emit `op` with a zero operand to be patched, returning the operand's
    /// position.
    fn emit_jump(&mut self, op: u32) -> usize {
        self.emit(op);
        self.emit(0)
    }

    fn patch(&mut self, pos: usize) {
        self.instrs[pos] = self.instrs.len() as u32;
    }

    fn fail(&self, failure: Failure) -> Failure {
        failure.in_function(self.function).at_line(self.line)
    }

    fn block(&mut self, block: &Block) -> Result<(), Failure> {
        for instr in &block.instrs {
            self.expr(instr)?;
            if !instr.is_instr() {
                self.emit(OP_POP);
            }
        }
        Ok(())
    }

    /// Compile an expression whose value is used.
    fn value(&mut self, expr: &Expr) -> Result<(), Failure> {
        if expr.is_instr() {
            return Err(self.fail(Failure::internal("instruction used as a value")));
        }
        self.expr(expr)
    }

    fn expr(&mut self, expr: &Expr) -> Result<(), Failure> {
        let saved = self.line;
        if expr.line() != 0 {
            self.line = expr.line();
        }
        let result = self.expr_inner(expr);
        self.line = saved;
        result
    }

    fn expr_inner(&mut self, expr: &Expr) -> Result<(), Failure> {
        match expr {
            Expr::Block(block) => self.block(block)?,

            Expr::Literal { value: Literal::Int(n), .. } => match Tagged::small_int(*n) {
                Some(tag) => self.emit_with(OP_CONST, tag.to_bits()),
                None => self.emit_const(Value::Int(*n))?,
            },
            Expr::Literal { value: Literal::Str(s), .. } => self.emit_const(Value::from(s.as_str()))?,

            Expr::LocalVarAccess { name, .. } => match self.scope.slot(name) {
                Some(slot) => self.emit_with(OP_LOAD, slot),
                None => {
                    if let Some((depth, _)) = self.scope.resolve(name) {
                        tracing::warn!(
                            name = %name,
                            function = self.function,
                            depth,
                            line = self.line,
                            "local of an enclosing function is not captured; resolving as global"
                        );
                    }
                    self.emit_name(OP_LOOKUP, name)?;
                }
            },

            Expr::LocalVarAssignment { name, expr, .. } => {
                let Some(slot) = self.scope.slot(name) else {
                    return Err(self.fail(Failure::undefined_variable(name)));
                };
                self.value(expr)?;
                self.emit_with(OP_STORE, slot);
            }

            Expr::Fun { name, parameters, body, .. } => {
                let function = compile_function(
                    name.as_deref(),
                    parameters,
                    body,
                    self.dict,
                    Some(self.scope.clone()),
                )?;
                self.emit_const(Value::Function(function))?;
                if let Some(name) = name {
                    self.emit(OP_DUP);
                    self.emit_name(OP_REGISTER, name)?;
                }
            }

            Expr::FunCall { qualifier, args, .. } => {
                self.value(qualifier)?;
                self.emit_undefined();
                for arg in args {
                    self.value(arg)?;
                }
                self.emit_with(OP_FUNCALL, args.len() as u32);
            }

            Expr::Return { expr, .. } => {
                self.value(expr)?;
                self.emit(OP_RET);
            }

            Expr::If { condition, true_block, false_block, .. } => {
                self.value(condition)?;
                let to_else = self.emit_jump(OP_JUMP_IF_FALSE);
                self.block(true_block)?;
                let to_end = self.emit_jump(OP_GOTO);
                self.patch(to_else);
                self.block(false_block)?;
                self.patch(to_end);
            }

            Expr::New { init, .. } => {
                let (shape, keep) = literal_layout(init.iter().map(|(key, _)| key.as_str()));
                for ((_, value), keep) in init.iter().zip(keep) {
                    self.value(value)?;
                    if !keep {
                        self.emit(OP_POP);
                    }
                }
                let tag = self.dict.register(Value::Shape(Rc::new(shape)))?;
                self.emit_with(OP_NEW, tag.to_bits());
            }

            Expr::FieldAccess { receiver, name, .. } => {
                self.value(receiver)?;
                self.emit_name(OP_GET, name)?;
            }

            Expr::FieldAssignment { receiver, name, expr, .. } => {
                self.value(receiver)?;
                self.value(expr)?;
                self.emit_name(OP_PUT, name)?;
            }

            Expr::MethodCall { receiver, name, args, .. } => {
                self.value(receiver)?;
                self.emit(OP_DUP);
                self.emit_name(OP_GET, name)?;
                self.emit(OP_SWAP);
                for arg in args {
                    self.value(arg)?;
                }
                self.emit_with(OP_FUNCALL, args.len() as u32);
            }
        }
        Ok(())
    }
}
