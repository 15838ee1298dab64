use std::collections::HashMap;
use std::rc::Rc;

use crate::ast::Script;
use crate::object::{HeapOrigin, Record};
use crate::runtime::{Failure, Function, Resource, Runtime, Value};

pub mod dictionary;
pub mod disasm;
pub mod heap;
pub mod tagged;

pub use dictionary::Dictionary;
use heap::{HEADER_SIZE, Heap};
use tagged::{INDEX_LIMIT, Tagged, Unpacked};

// ── Stack opcodes ───────────────────────────────────────────────────
//
// One u32 word per opcode, followed by at most one u32 operand.

pub(crate) const OP_CONST: u32 = 0; // tagged value
pub(crate) const OP_LOOKUP: u32 = 1; // name (dict)
pub(crate) const OP_REGISTER: u32 = 2; // name (dict)
pub(crate) const OP_LOAD: u32 = 3; // slot
pub(crate) const OP_STORE: u32 = 4; // slot
pub(crate) const OP_DUP: u32 = 5;
pub(crate) const OP_POP: u32 = 6;
pub(crate) const OP_SWAP: u32 = 7;
pub(crate) const OP_FUNCALL: u32 = 8; // argument count
pub(crate) const OP_RET: u32 = 9;
pub(crate) const OP_GOTO: u32 = 10; // label
pub(crate) const OP_JUMP_IF_FALSE: u32 = 11; // label
pub(crate) const OP_NEW: u32 = 12; // shape (dict)
pub(crate) const OP_GET: u32 = 13; // name (dict)
pub(crate) const OP_PUT: u32 = 14; // name (dict)

const MNEMONICS: [&str; 15] = [
    "CONST",
    "LOOKUP",
    "REGISTER",
    "LOAD",
    "STORE",
    "DUP",
    "POP",
    "SWAP",
    "FUNCALL",
    "RET",
    "GOTO",
    "JUMP_IF_FALSE",
    "NEW",
    "GET",
    "PUT",
];

pub(crate) fn mnemonic(op: u32) -> Option<&'static str> {
    MNEMONICS.get(op as usize).copied()
}

/// Whether `op` is followed by an operand word.
pub(crate) fn has_operand(op: u32) -> bool {
    !matches!(op, OP_DUP | OP_POP | OP_SWAP | OP_RET)
}

// ── Activation record ───────────────────────────────────────────────
//
// Frame layout, bp pointing at `this`:
//
//   bp-1            callee
//   bp              this (slot 0)
//   bp+1..          parameters, then locals
//   bp+slot_count   saved bp, saved pc, saved function
//   above           operand stack

const BP_OFFSET: usize = 0;
const PC_OFFSET: usize = 1;
const FUN_OFFSET: usize = 2;
const ACTIVATION_SIZE: usize = 3;

/// Cells below the first argument of a call: callee and receiver.
const FUNCALL_PREFIX: usize = 2;

// ── Code ────────────────────────────────────────────────────────────

/// Immutable compiled body of a function.
#[derive(Debug, Clone, Default)]
pub struct Code {
    pub instrs: Vec<u32>,
    /// Source line of each word in `instrs`.
    pub lines: Vec<u32>,
    /// Receiver included.
    pub param_count: u32,
    /// Receiver, parameters and locals.
    pub slot_count: u32,
}

impl Code {
    pub fn line_at(&self, pc: usize) -> u32 {
        self.lines.get(pc).copied().unwrap_or(0)
    }
}

// ── Configuration ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HeapPolicy {
    /// Fail the allocation with a heap exhaustion error.
    #[default]
    Abort,
    /// Double the heap, up to the reference limit.
    Grow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    /// Stack size in cells.
    pub stack_capacity: usize,
    /// Initial heap size in cells.
    pub heap_capacity: usize,
    pub heap_policy: HeapPolicy,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig { stack_capacity: 65_536, heap_capacity: 65_536, heap_policy: HeapPolicy::Abort }
    }
}

/// Hard ceiling on nested host calls, whatever the stack capacity.
pub const MAX_CALL_DEPTH: usize = 10_000;

/// Stack cells charged to one nested host call when deriving its limit.
const CELLS_PER_CALL: usize = 16;

impl VmConfig {
    /// How deeply `Function::invoke` may nest. The interpreter recurses on
    /// the host stack rather than the VM stack, so its depth is bounded in
    /// calls, scaled from `stack_capacity`.
    pub fn call_depth_limit(&self) -> usize {
        (self.stack_capacity / CELLS_PER_CALL).clamp(1, MAX_CALL_DEPTH)
    }
}

// ── Boundary encoding ───────────────────────────────────────────────

/// Encode a caller-visible value for the VM. Records that came out of this
/// heap go back to their reference; anything without an inline form is
/// interned in the dictionary.
pub fn encode_any(value: &Value, dict: &mut Dictionary, heap: &Heap) -> Result<Tagged, Failure> {
    match value {
        Value::Int(n) if *n >= 0 => Ok(Tagged::small(*n as u32)),
        Value::Record(record) => match record.origin() {
            Some(origin) if origin.heap == heap.id() => Tagged::reference(origin.index)
                .ok_or_else(|| Failure::internal("heap reference out of range")),
            _ => dict.register(value.clone()),
        },
        other => dict.register(other.clone()),
    }
}

/// Decode a VM word into a caller-visible value. Heap references become
/// records; objects reachable from the same reference share one record, so
/// cycles terminate.
pub fn decode_any(tagged: Tagged, dict: &Dictionary, heap: &Heap) -> Result<Value, Failure> {
    match tagged.unpack() {
        Unpacked::SmallInt(n) => Ok(Value::Int(n)),
        Unpacked::Dict(index) => dict
            .lookup(index)
            .cloned()
            .ok_or_else(|| Failure::internal(format!("dictionary index {index} out of range"))),
        Unpacked::Reference(reference) => materialize(reference, dict, heap),
    }
}

/// Objects whose record exists but whose fields are not filled in yet.
type Pending = Vec<(u32, Rc<Record>)>;

/// Copy the object graph reachable from `root` into records. Walks an
/// explicit worklist, so a long linked structure costs heap, not host
/// stack.
fn materialize(root: u32, dict: &Dictionary, heap: &Heap) -> Result<Value, Failure> {
    let mut seen = HashMap::new();
    let mut pending = Pending::new();
    let record = record_for(root, dict, heap, &mut seen, &mut pending)?;
    while let Some((reference, object)) = pending.pop() {
        for offset in 0..object.shape().len() {
            let cell = heap.field(reference, offset)?;
            let value = match cell.unpack() {
                Unpacked::Reference(inner) => {
                    Value::Record(record_for(inner, dict, heap, &mut seen, &mut pending)?)
                }
                _ => decode_any(cell, dict, heap)?,
            };
            object.set_at(offset, value);
        }
    }
    Ok(Value::Record(record))
}

/// The record standing for `reference`, created and queued on first sight.
fn record_for(
    reference: u32,
    dict: &Dictionary,
    heap: &Heap,
    seen: &mut HashMap<u32, Rc<Record>>,
    pending: &mut Pending,
) -> Result<Rc<Record>, Failure> {
    if let Some(record) = seen.get(&reference) {
        return Ok(record.clone());
    }
    let shape = dict.shape(heap.shape_of(reference)?)?;
    let origin = HeapOrigin { heap: heap.id(), index: reference };
    let record = Rc::new(Record::materialized(shape, origin));
    seen.insert(reference, record.clone());
    pending.push((reference, record.clone()));
    Ok(record)
}

// ── Entry points ────────────────────────────────────────────────────

/// Compile `script` as `main` and run it on a fresh VM.
pub fn run(rt: &mut Runtime, script: &Script) -> Result<Value, Failure> {
    let main = crate::compiler::compile_script(script, &mut rt.dict)?;
    main.invoke(rt, Value::Undefined, &[])
}

/// Run a bytecode function with an explicit receiver.
pub fn execute(
    rt: &mut Runtime,
    function: &Rc<Function>,
    receiver: Value,
    args: &[Value],
) -> Result<Value, Failure> {
    let code = function
        .code()
        .cloned()
        .ok_or_else(|| Failure::internal(format!("{} has no bytecode", function.name())))?;
    if code.param_count as usize != args.len() + 1 {
        return Err(Failure::arity(
            function.name(),
            code.param_count.saturating_sub(1) as usize,
            args.len(),
        ));
    }
    let mut vm = Vm::new(rt, function.clone(), code);
    vm.enter(receiver, args)?;
    let result = vm.execute()?;
    decode_any(result, &vm.rt.dict, &vm.heap)
}

// ── VM ──────────────────────────────────────────────────────────────

pub(crate) struct Vm<'rt> {
    rt: &'rt mut Runtime,
    stack: Vec<Tagged>,
    stack_capacity: usize,
    heap: Heap,
    pc: usize,
    bp: usize,
    function: Rc<Function>,
    code: Rc<Code>,
}

impl<'rt> Vm<'rt> {
    fn new(rt: &'rt mut Runtime, function: Rc<Function>, code: Rc<Code>) -> Self {
        let config = rt.config;
        let heap = Heap::new(rt.next_heap_id(), config.heap_capacity.min(INDEX_LIMIT as usize));
        let stack_capacity = config.stack_capacity.min(INDEX_LIMIT as usize);
        Vm {
            rt,
            stack: Vec::with_capacity(stack_capacity.min(1024)),
            stack_capacity,
            heap,
            pc: 0,
            bp: 0,
            function,
            code,
        }
    }

    /// Lay out the outermost call window `[callee, receiver, args...]` and
    /// its activation record. A saved pc of 0 marks the bottom frame.
    fn enter(&mut self, receiver: Value, args: &[Value]) -> Result<(), Failure> {
        let callee = self.rt.dict.register(Value::Function(self.function.clone()))?;
        self.push(callee)?;
        self.bp = self.stack.len();
        let receiver = encode_any(&receiver, &mut self.rt.dict, &self.heap)?;
        self.push(receiver)?;
        for arg in args {
            let arg = encode_any(arg, &mut self.rt.dict, &self.heap)?;
            self.push(arg)?;
        }
        let slot_count = self.code.slot_count;
        self.push_frame(self.bp, slot_count, [Tagged::small(0), Tagged::small(0), callee])
    }

    /// Fill the locals that are not parameters with `undefined`, then write
    /// the activation record. Expects the stack to end with the parameters.
    fn push_frame(&mut self, bp: usize, slot_count: u32, saved: [Tagged; ACTIVATION_SIZE]) -> Result<(), Failure> {
        let activation = bp + slot_count as usize;
        self.reserve(activation + ACTIVATION_SIZE)?;
        self.stack.resize(activation, Tagged::UNDEFINED);
        self.stack.extend_from_slice(&saved);
        Ok(())
    }

    fn reserve(&self, cells: usize) -> Result<(), Failure> {
        if cells > self.stack_capacity {
            return Err(Failure::exhausted(Resource::Stack, self.stack_capacity));
        }
        Ok(())
    }

    #[inline]
    fn push(&mut self, value: Tagged) -> Result<(), Failure> {
        if self.stack.len() >= self.stack_capacity {
            return Err(Failure::exhausted(Resource::Stack, self.stack_capacity));
        }
        self.stack.push(value);
        Ok(())
    }

    #[inline]
    fn pop(&mut self) -> Result<Tagged, Failure> {
        self.stack.pop().ok_or_else(|| Failure::internal("operand stack underflow"))
    }

    #[inline]
    fn peek(&self) -> Result<Tagged, Failure> {
        self.stack.last().copied().ok_or_else(|| Failure::internal("operand stack underflow"))
    }

    fn cell(&self, index: usize) -> Result<Tagged, Failure> {
        self.stack
            .get(index)
            .copied()
            .ok_or_else(|| Failure::internal(format!("stack cell {index} out of range")))
    }

    fn local(&self, slot: u32) -> Result<usize, Failure> {
        if slot >= self.code.slot_count {
            return Err(Failure::internal(format!("slot {slot} out of range")));
        }
        Ok(self.bp + slot as usize)
    }

    fn small(&self, index: usize) -> Result<usize, Failure> {
        self.cell(index)?
            .as_small_int()
            .map(|n| n as usize)
            .ok_or_else(|| Failure::internal("corrupt activation record"))
    }

    fn operand(&mut self) -> Result<u32, Failure> {
        let word = self
            .code
            .instrs
            .get(self.pc)
            .copied()
            .ok_or_else(|| Failure::internal("missing operand"))?;
        self.pc += 1;
        Ok(word)
    }

    fn name(&mut self) -> Result<Rc<str>, Failure> {
        let tag = Tagged::from_bits(self.operand()?);
        self.rt.dict.string(tag)
    }

    fn decode(&self, tagged: Tagged) -> Result<Value, Failure> {
        decode_any(tagged, &self.rt.dict, &self.heap)
    }

    fn encode(&mut self, value: &Value) -> Result<Tagged, Failure> {
        encode_any(value, &mut self.rt.dict, &self.heap)
    }

    /// Run until the bottom frame returns.
    fn execute(&mut self) -> Result<Tagged, Failure> {
        loop {
            let at = self.pc;
            let op = *self
                .code
                .instrs
                .get(at)
                .ok_or_else(|| Failure::internal(format!("pc {at} past end of code")))?;
            self.pc += 1;
            match self.step(op) {
                Ok(None) => {}
                Ok(Some(result)) => return Ok(result),
                Err(failure) => {
                    return Err(failure
                        .with_op(mnemonic(op).unwrap_or("?"))
                        .in_function(self.function.name())
                        .at_line(self.code.line_at(at)));
                }
            }
        }
    }

    /// Execute one instruction. Returns the result when the bottom frame
    /// returns.
    fn step(&mut self, op: u32) -> Result<Option<Tagged>, Failure> {
        match op {
            OP_CONST => {
                let value = Tagged::from_bits(self.operand()?);
                self.push(value)?;
            }
            OP_LOOKUP => {
                let name = self.name()?;
                let value = self.rt.globals.lookup(&name);
                let value = self.encode(&value)?;
                self.push(value)?;
            }
            OP_REGISTER => {
                let name = self.name()?;
                let value = self.pop()?;
                let value = self.decode(value)?;
                self.rt.globals.register(&name, value);
            }
            OP_LOAD => {
                let slot = self.operand()?;
                let value = self.cell(self.local(slot)?)?;
                self.push(value)?;
            }
            OP_STORE => {
                let slot = self.operand()?;
                let index = self.local(slot)?;
                let value = self.pop()?;
                let cell = self
                    .stack
                    .get_mut(index)
                    .ok_or_else(|| Failure::internal(format!("stack cell {index} out of range")))?;
                *cell = value;
            }
            OP_DUP => {
                let value = self.peek()?;
                self.push(value)?;
            }
            OP_POP => {
                self.pop()?;
            }
            OP_SWAP => {
                let first = self.pop()?;
                let second = self.pop()?;
                self.stack.push(first);
                self.stack.push(second);
            }
            OP_FUNCALL => {
                let argc = self.operand()? as usize;
                self.funcall(argc)?;
            }
            OP_RET => return self.ret(),
            OP_GOTO => {
                self.pc = self.operand()? as usize;
            }
            OP_JUMP_IF_FALSE => {
                let label = self.operand()? as usize;
                if self.pop()? == Tagged::FALSE {
                    self.pc = label;
                }
            }
            OP_NEW => {
                let tag = Tagged::from_bits(self.operand()?);
                self.new_object(tag)?;
            }
            OP_GET => {
                let name = self.name()?;
                let receiver = self.pop()?;
                let value = self.get_field(receiver, &name)?;
                self.push(value)?;
            }
            OP_PUT => {
                let name = self.name()?;
                let value = self.pop()?;
                let receiver = self.pop()?;
                self.put_field(receiver, &name, value)?;
            }
            _ => return Err(Failure::internal(format!("unknown opcode {op}"))),
        }
        Ok(None)
    }

    fn funcall(&mut self, argc: usize) -> Result<(), Failure> {
        let base_arg = self
            .stack
            .len()
            .checked_sub(argc + FUNCALL_PREFIX)
            .ok_or_else(|| Failure::internal("call window underflow"))?
            + FUNCALL_PREFIX;
        let qualifier = self.cell(base_arg - 2)?;
        let callee = match self.decode(qualifier)? {
            Value::Function(f) => f,
            other => return Err(Failure::type_mismatch("function", &other)),
        };

        let Some(code) = callee.code().cloned() else {
            return self.call_foreign(&callee, base_arg, argc);
        };

        if code.param_count as usize != argc + 1 {
            return Err(Failure::arity(
                callee.name(),
                code.param_count.saturating_sub(1) as usize,
                argc,
            ));
        }

        let caller = self.rt.dict.register(Value::Function(self.function.clone()))?;
        let mut saved = [Tagged::UNDEFINED; ACTIVATION_SIZE];
        saved[BP_OFFSET] = Tagged::small(self.bp as u32);
        saved[PC_OFFSET] = Tagged::small(self.pc as u32);
        saved[FUN_OFFSET] = caller;
        let bp = base_arg - 1;
        self.push_frame(bp, code.slot_count, saved)?;

        self.bp = bp;
        self.pc = 0;
        self.function = callee;
        self.code = code;

        if tracing::enabled!(tracing::Level::TRACE) {
            tracing::trace!(function = %self.function.name(), stack = %self.dump_stack(), "call");
        }
        Ok(())
    }

    /// Natives and interpreter closures run outside the VM: decode the
    /// window, invoke, encode the result in place of the window.
    fn call_foreign(&mut self, callee: &Rc<Function>, base_arg: usize, argc: usize) -> Result<(), Failure> {
        let receiver = self.decode(self.cell(base_arg - 1)?)?;
        let mut args = Vec::with_capacity(argc);
        for i in 0..argc {
            args.push(self.decode(self.cell(base_arg + i)?)?);
        }
        tracing::debug!(function = %callee.name(), argc, "native call");
        let result = callee.invoke(self.rt, receiver, &args)?;
        let result = self.encode(&result)?;
        self.stack.truncate(base_arg - FUNCALL_PREFIX);
        self.push(result)
    }

    fn ret(&mut self) -> Result<Option<Tagged>, Failure> {
        let result = self.pop()?;
        let activation = self.bp + self.code.slot_count as usize;
        let saved_pc = self.small(activation + PC_OFFSET)?;
        if saved_pc == 0 {
            return Ok(Some(result));
        }
        let saved_bp = self.small(activation + BP_OFFSET)?;
        let caller = self.rt.dict.function(self.cell(activation + FUN_OFFSET)?)?;
        let code = caller
            .code()
            .cloned()
            .ok_or_else(|| Failure::internal(format!("{} has no bytecode", caller.name())))?;

        self.stack.truncate(self.bp - 1);
        self.pc = saved_pc;
        self.bp = saved_bp;
        self.function = caller;
        self.code = code;
        self.push(result)?;

        if tracing::enabled!(tracing::Level::TRACE) {
            tracing::trace!(function = %self.function.name(), stack = %self.dump_stack(), "return");
        }
        Ok(None)
    }

    fn new_object(&mut self, tag: Tagged) -> Result<(), Failure> {
        let shape = self.rt.dict.shape(tag)?;
        let count = shape.len() as usize;
        let base = self
            .stack
            .len()
            .checked_sub(count)
            .ok_or_else(|| Failure::internal("missing field initializers"))?;
        if !self.heap.fits(count) {
            self.on_heap_exhausted(count)?;
        }
        let reference = self
            .heap
            .alloc(tag, &self.stack[base..])
            .ok_or_else(|| Failure::exhausted(Resource::Heap, self.heap.capacity()))?;
        self.stack.truncate(base);
        self.push(reference)
    }

    /// Called when an allocation of `field_count` fields does not fit.
    /// This is where a collector would run.
    pub(crate) fn on_heap_exhausted(&mut self, field_count: usize) -> Result<(), Failure> {
        tracing::warn!(
            used = self.heap.used(),
            capacity = self.heap.capacity(),
            policy = ?self.rt.config.heap_policy,
            "heap exhausted"
        );
        if tracing::enabled!(tracing::Level::TRACE) {
            tracing::trace!(heap = %self.dump_heap(), "heap at exhaustion");
        }
        match self.rt.config.heap_policy {
            HeapPolicy::Abort => Err(Failure::exhausted(Resource::Heap, self.heap.capacity())),
            HeapPolicy::Grow => {
                while !self.heap.fits(field_count) {
                    if !self.heap.grow() {
                        return Err(Failure::exhausted(Resource::Heap, self.heap.capacity()));
                    }
                }
                tracing::debug!(capacity = self.heap.capacity(), "heap grown");
                Ok(())
            }
        }
    }

    fn get_field(&mut self, receiver: Tagged, name: &str) -> Result<Tagged, Failure> {
        match receiver.unpack() {
            Unpacked::Reference(reference) => {
                let shape = self.rt.dict.shape(self.heap.shape_of(reference)?)?;
                match shape.slot(name) {
                    Some(offset) => self.heap.field(reference, offset),
                    None => Ok(Tagged::UNDEFINED),
                }
            }
            _ => {
                let receiver = self.decode(receiver)?;
                let value = self.rt.get_field(&receiver, name)?;
                self.encode(&value)
            }
        }
    }

    fn put_field(&mut self, receiver: Tagged, name: &str, value: Tagged) -> Result<(), Failure> {
        match receiver.unpack() {
            Unpacked::Reference(reference) => {
                let shape = self.rt.dict.shape(self.heap.shape_of(reference)?)?;
                let offset = shape.slot(name).ok_or_else(|| Failure::invalid_field(name))?;
                self.heap.set_field(reference, offset, value)
            }
            _ => {
                let receiver = self.decode(receiver)?;
                let value = self.decode(value)?;
                self.rt.put_field(&receiver, name, value)
            }
        }
    }

    /// One line per object: reference, shape, fields.
    fn dump_heap(&self) -> String {
        let cells = self.heap.cells();
        let mut out = String::new();
        let mut start = 0;
        while start + HEADER_SIZE <= cells.len() {
            let Ok(shape) = self.rt.dict.shape(cells[start]) else {
                out.push_str(&format!("\n@{start:<6} corrupt header {:?}", cells[start]));
                break;
            };
            let end = (start + HEADER_SIZE + shape.len() as usize).min(cells.len());
            out.push_str(&format!("\n@{start:<6} {shape} {:?}", &cells[start + HEADER_SIZE..end]));
            start = end;
        }
        out
    }

    fn dump_stack(&self) -> String {
        let mut out = String::new();
        for (i, cell) in self.stack.iter().enumerate() {
            let marker = if i == self.bp { "->" } else { "  " };
            let shown = match cell.unpack() {
                Unpacked::Reference(_) => String::new(),
                _ => self.decode(*cell).map(|v| format!(" {v:?}")).unwrap_or_default(),
            };
            out.push_str(&format!("\n{marker}{i:4} {cell:?}{shown}"));
        }
        out
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Expr, Script};
    use crate::runtime::{Capture, ErrorKind};

    fn runtime(config: VmConfig) -> (Runtime, Capture) {
        let capture = Capture::new();
        (Runtime::with_output(config, Box::new(capture.clone())), capture)
    }

    fn vm_run(body: Vec<Expr>) -> (Result<Value, Failure>, Capture) {
        let (mut rt, capture) = runtime(VmConfig::default());
        (run(&mut rt, &Script::new(body)), capture)
    }

    fn raw(words: Vec<u32>, slot_count: u32) -> Rc<Function> {
        let lines = (0..words.len() as u32).map(|i| i + 1).collect();
        Function::bytecode("raw", Code { instrs: words, lines, param_count: 1, slot_count })
    }

    fn small(n: u32) -> u32 {
        Tagged::small(n).to_bits()
    }

    fn fact() -> Expr {
        Expr::fun(
            Some("fact"),
            &["n"],
            vec![Expr::if_else(
                Expr::op("<", vec![Expr::var("n"), Expr::int(2)]),
                vec![Expr::ret(Expr::int(1))],
                vec![Expr::ret(Expr::op(
                    "*",
                    vec![
                        Expr::var("n"),
                        Expr::call(Expr::var("fact"), vec![Expr::op("-", vec![Expr::var("n"), Expr::int(1)])]),
                    ],
                ))],
            )],
        )
    }

    #[test]
    fn vm_const_ret() {
        let f = raw(vec![OP_CONST, small(42), OP_RET], 1);
        let (mut rt, _) = runtime(VmConfig::default());
        assert_eq!(f.invoke(&mut rt, Value::Undefined, &[]).unwrap(), Value::Int(42));
    }

    #[test]
    fn vm_receiver_is_slot_zero() {
        let f = raw(vec![OP_LOAD, 0, OP_RET], 1);
        let (mut rt, _) = runtime(VmConfig::default());
        assert_eq!(f.invoke(&mut rt, Value::from("me"), &[]).unwrap(), Value::from("me"));
    }

    #[test]
    fn vm_swap_and_pop() {
        let f = raw(vec![OP_CONST, small(1), OP_CONST, small(2), OP_SWAP, OP_POP, OP_RET], 1);
        let (mut rt, _) = runtime(VmConfig::default());
        assert_eq!(f.invoke(&mut rt, Value::Undefined, &[]).unwrap(), Value::Int(2));
    }

    #[test]
    fn vm_jump_if_false_pops_condition() {
        // the condition must not linger on top of the 5
        let f = raw(
            vec![
                OP_CONST, small(5), // 0
                OP_CONST, small(0), // 2
                OP_JUMP_IF_FALSE, 6, // 4
                OP_RET, // 6
            ],
            1,
        );
        let (mut rt, _) = runtime(VmConfig::default());
        assert_eq!(f.invoke(&mut rt, Value::Undefined, &[]).unwrap(), Value::Int(5));
    }

    #[test]
    fn vm_goto_skips() {
        let f = raw(
            vec![
                OP_CONST, small(1), // 0
                OP_JUMP_IF_FALSE, 8, // 2
                OP_CONST, small(7), // 4
                OP_GOTO, 10, // 6
                OP_CONST, small(9), // 8
                OP_RET, // 10
            ],
            1,
        );
        let (mut rt, _) = runtime(VmConfig::default());
        assert_eq!(f.invoke(&mut rt, Value::Undefined, &[]).unwrap(), Value::Int(7));
    }

    #[test]
    fn vm_unknown_opcode_is_internal() {
        let f = raw(vec![99], 1);
        let (mut rt, _) = runtime(VmConfig::default());
        let err = f.invoke(&mut rt, Value::Undefined, &[]).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::InternalInconsistency { .. }));
        assert_eq!(err.context.line, Some(1));
    }

    #[test]
    fn vm_fact() {
        let (result, capture) = vm_run(vec![
            fact(),
            Expr::op("print", vec![Expr::call(Expr::var("fact"), vec![Expr::int(5)])]),
        ]);
        assert!(result.unwrap().is_undefined());
        assert_eq!(capture.lines(), vec!["120"]);
    }

    #[test]
    fn vm_top_level_return() {
        let (result, _) = vm_run(vec![fact(), Expr::ret(Expr::call(Expr::var("fact"), vec![Expr::int(6)]))]);
        assert_eq!(result.unwrap(), Value::Int(720));
    }

    #[test]
    fn vm_negative_and_string_constants() {
        let (result, capture) = vm_run(vec![
            Expr::declare("x", Expr::op("-", vec![Expr::int(3), Expr::int(10)])),
            Expr::op("print", vec![Expr::var("x"), Expr::str("done")]),
            Expr::ret(Expr::var("x")),
        ]);
        assert_eq!(result.unwrap(), Value::Int(-7));
        assert_eq!(capture.lines(), vec!["-7 done"]);
    }

    #[test]
    fn vm_object_fields() {
        let (result, capture) = vm_run(vec![
            Expr::declare("o", Expr::new_object(vec![("x", Expr::int(1)), ("y", Expr::int(2))])),
            Expr::put(Expr::var("o"), "x", Expr::int(10)),
            Expr::op("print", vec![Expr::get(Expr::var("o"), "x"), Expr::get(Expr::var("o"), "y")]),
            Expr::op("print", vec![Expr::get(Expr::var("o"), "z")]),
            Expr::op("print", vec![Expr::var("o")]),
        ]);
        result.unwrap();
        assert_eq!(capture.lines(), vec!["10 2", "undefined", "{x: 10, y: 2}"]);
    }

    #[test]
    fn vm_put_unknown_field() {
        let (result, _) = vm_run(vec![
            Expr::declare("o", Expr::new_object(vec![("x", Expr::int(1))])),
            Expr::put(Expr::var("o"), "nope", Expr::int(2)).at(3),
        ]);
        let err = result.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidField { field: "nope".into() });
        assert_eq!(err.context.op, Some("PUT"));
        assert_eq!(err.context.line, Some(3));
        assert_eq!(err.context.function.as_deref(), Some("main"));
    }

    #[test]
    fn vm_get_on_integer_is_type_mismatch() {
        let (result, _) = vm_run(vec![Expr::ret(Expr::get(Expr::int(3), "x"))]);
        assert!(matches!(result.unwrap_err().kind, ErrorKind::TypeMismatch { .. }));
    }

    #[test]
    fn vm_method_call_binds_this() {
        let (result, _) = vm_run(vec![
            Expr::declare(
                "counter",
                Expr::new_object(vec![
                    ("n", Expr::int(41)),
                    (
                        "next",
                        Expr::fun(None, &[], vec![Expr::ret(Expr::op(
                            "+",
                            vec![Expr::get(Expr::var("this"), "n"), Expr::int(1)],
                        ))]),
                    ),
                ]),
            ),
            Expr::ret(Expr::method(Expr::var("counter"), "next", vec![])),
        ]);
        assert_eq!(result.unwrap(), Value::Int(42));
    }

    #[test]
    fn vm_calling_non_function() {
        let (result, _) = vm_run(vec![Expr::call(Expr::int(3), vec![])]);
        let err = result.unwrap_err();
        assert!(matches!(err.kind, ErrorKind::TypeMismatch { expected: "function", .. }));
        assert_eq!(err.context.op, Some("FUNCALL"));
    }

    #[test]
    fn vm_arity_mismatch() {
        let (result, _) = vm_run(vec![
            Expr::fun(Some("id"), &["x"], vec![Expr::ret(Expr::var("x"))]),
            Expr::call(Expr::var("id"), vec![Expr::int(1), Expr::int(2)]),
        ]);
        assert_eq!(
            result.unwrap_err().kind,
            ErrorKind::ArityMismatch { function: "id".into(), expected: 1, found: 2 }
        );
    }

    #[test]
    fn vm_stack_exhaustion() {
        let (mut rt, _) = runtime(VmConfig { stack_capacity: 64, ..VmConfig::default() });
        let script = Script::new(vec![
            Expr::fun(Some("loop"), &["n"], vec![Expr::ret(Expr::call(Expr::var("loop"), vec![Expr::var("n")]))]),
            Expr::call(Expr::var("loop"), vec![Expr::int(0)]),
        ]);
        let err = run(&mut rt, &script).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ResourceExhaustion { resource: Resource::Stack, capacity: 64 });
    }

    #[test]
    fn vm_heap_policies() {
        let body = || {
            vec![
                Expr::declare("a", Expr::new_object(vec![("x", Expr::int(1))])),
                Expr::declare("b", Expr::new_object(vec![("x", Expr::int(2))])),
                Expr::declare("c", Expr::new_object(vec![("x", Expr::int(3))])),
                Expr::ret(Expr::get(Expr::var("c"), "x")),
            ]
        };
        let (mut rt, _) = runtime(VmConfig { heap_capacity: 6, ..VmConfig::default() });
        let err = run(&mut rt, &Script::new(body())).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ResourceExhaustion { resource: Resource::Heap, capacity: 6 });
        assert_eq!(err.context.op, Some("NEW"));

        let config = VmConfig { heap_capacity: 6, heap_policy: HeapPolicy::Grow, ..VmConfig::default() };
        let (mut rt, _) = runtime(config);
        assert_eq!(run(&mut rt, &Script::new(body())).unwrap(), Value::Int(3));
    }

    #[test]
    fn vm_division_by_zero_carries_line() {
        let (result, _) = vm_run(vec![
            Expr::declare("x", Expr::int(1)).at(1),
            Expr::ret(Expr::op("/", vec![Expr::var("x"), Expr::int(0)]).at(2)).at(2),
        ]);
        let err = result.unwrap_err();
        assert_eq!(err.kind, ErrorKind::DivisionByZero);
        assert_eq!(err.context.op, Some("FUNCALL"));
        assert_eq!(err.context.line, Some(2));
    }

    #[test]
    fn call_depth_limit_scales_with_stack() {
        let limit = |stack_capacity| VmConfig { stack_capacity, ..VmConfig::default() }.call_depth_limit();
        assert_eq!(limit(1024), 64);
        assert_eq!(limit(VmConfig::default().stack_capacity), 4096);
        assert_eq!(limit(0), 1);
        assert_eq!(limit(usize::MAX), MAX_CALL_DEPTH);
    }

    #[test]
    fn vm_store_outside_the_stack_is_internal() {
        // the pops eat the frame down to the callee, so slot 0 is gone
        let f = raw(vec![OP_POP, OP_POP, OP_POP, OP_POP, OP_CONST, small(1), OP_STORE, 0, OP_RET], 1);
        let (mut rt, _) = runtime(VmConfig::default());
        let err = f.invoke(&mut rt, Value::Undefined, &[]).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::InternalInconsistency { .. }), "{err}");
        assert_eq!(err.context.op, Some("STORE"));
        assert_eq!(err.context.line, Some(7));
    }

    #[test]
    fn vm_returns_restore_caller_stack_depth() {
        let (mut rt, _) = runtime(VmConfig::default());
        let script = Script::new(vec![fact(), Expr::ret(Expr::call(Expr::var("fact"), vec![Expr::int(6)]))]);
        let main = crate::compiler::compile_script(&script, &mut rt.dict).unwrap();
        let code = main.code().cloned().unwrap();
        let mut vm = Vm::new(&mut rt, main.clone(), code);
        vm.enter(Value::Undefined, &[]).unwrap();

        // stack depth below the callee cell of each active bytecode call
        let mut windows = Vec::new();
        let mut returns = 0;
        let result = loop {
            let op = vm.code.instrs[vm.pc];
            let argc = if op == OP_FUNCALL { vm.code.instrs[vm.pc + 1] as usize } else { 0 };
            let window = vm.stack.len() - argc - FUNCALL_PREFIX;
            let bp = vm.bp;
            vm.pc += 1;
            if let Some(result) = vm.step(op).unwrap() {
                break result;
            }
            match op {
                OP_FUNCALL if vm.bp != bp => windows.push(window),
                OP_FUNCALL => assert_eq!(vm.stack.len(), window + 1, "native call leaves one result"),
                OP_RET => {
                    let window = windows.pop().expect("return without a matching call");
                    assert_eq!(vm.stack.len(), window + 1, "return leaves only the result");
                    returns += 1;
                }
                _ => {}
            }
        };
        assert_eq!(returns, 6);
        assert!(windows.is_empty());
        assert_eq!(vm.decode(result).unwrap(), Value::Int(720));
    }

    #[test]
    fn vm_global_object() {
        let (result, capture) = vm_run(vec![
            Expr::put(Expr::var("global"), "x", Expr::int(3)),
            Expr::op("print", vec![Expr::var("x"), Expr::get(Expr::var("global"), "x")]),
            Expr::method(Expr::var("global"), "print", vec![Expr::str("via global")]),
            Expr::ret(Expr::op("==", vec![Expr::var("global"), Expr::get(Expr::var("global"), "global")])),
        ]);
        assert_eq!(capture.lines(), vec!["3 3", "via global"]);
        assert_eq!(result.unwrap(), Value::Int(1));
    }

    #[test]
    fn vm_heap_dump_lists_objects() {
        let (mut rt, _) = runtime(VmConfig::default());
        let main = crate::compiler::compile_script(
            &Script::new(vec![
                Expr::declare("a", Expr::new_object(vec![("x", Expr::int(1))])),
                Expr::declare("b", Expr::new_object(vec![("p", Expr::var("a")), ("q", Expr::int(2))])),
                Expr::ret(Expr::var("b")),
            ]),
            &mut rt.dict,
        )
        .unwrap();
        let code = main.code().cloned().unwrap();
        let mut vm = Vm::new(&mut rt, main.clone(), code);
        vm.enter(Value::Undefined, &[]).unwrap();
        vm.execute().unwrap();
        let dump = vm.dump_heap();
        let lines: Vec<&str> = dump.lines().filter(|l| !l.is_empty()).collect();
        assert_eq!(lines.len(), 2, "{dump}");
        assert!(lines[0].starts_with("@0 ") && lines[0].contains("shape{x: 0}"), "{dump}");
        assert!(lines[1].starts_with("@3 ") && lines[1].contains("[@0, #2]"), "{dump}");
    }

    #[test]
    fn decoding_a_long_chain_uses_no_recursion() {
        const LEN: u32 = 10_000;
        let mut dict = Dictionary::new();
        let mut heap = Heap::new(3, LEN as usize * 3);
        let shape = Rc::new(crate::object::Shape::from_names(["next"]));
        let shape_tag = dict.register(Value::Shape(shape)).unwrap();
        for _ in 0..LEN {
            heap.alloc(shape_tag, &[Tagged::UNDEFINED]).unwrap();
        }
        for i in 0..LEN - 1 {
            heap.set_field(i * 3, 0, Tagged::reference((i + 1) * 3).unwrap()).unwrap();
        }

        let mut chain = Vec::new();
        let mut at = decode_any(Tagged::reference(0).unwrap(), &dict, &heap).unwrap();
        while let Value::Record(record) = at {
            at = record.get("next").unwrap_or(Value::Undefined);
            chain.push(record);
        }
        assert_eq!(chain.len(), LEN as usize);
        assert_eq!(chain[chain.len() - 1].origin(), Some(HeapOrigin { heap: 3, index: (LEN - 1) * 3 }));
        // unlink front to back so dropping the chain stays shallow
        for record in &chain {
            record.set("next", Value::Undefined);
        }
    }

    #[test]
    fn heap_records_round_trip_by_reference() {
        let mut dict = Dictionary::new();
        let mut heap = Heap::new(7, 32);
        let shape = Rc::new(crate::object::Shape::from_names(["next"]));
        let shape_tag = dict.register(Value::Shape(shape)).unwrap();
        // a single object pointing at itself
        let r = heap.alloc(shape_tag, &[Tagged::UNDEFINED]).unwrap();
        heap.set_field(0, 0, r).unwrap();

        let value = decode_any(r, &dict, &heap).unwrap();
        let Value::Record(record) = &value else { panic!("expected record, got {value:?}") };
        let Some(Value::Record(inner)) = record.get("next") else { panic!("expected nested record") };
        assert!(Rc::ptr_eq(record, &inner));
        assert_eq!(encode_any(&value, &mut dict, &heap).unwrap(), r);

        // a different heap interns the record instead
        let other = Heap::new(8, 4);
        let tag = encode_any(&value, &mut dict, &other).unwrap();
        assert!(tag.as_dict().is_some());
        record.set("next", Value::Undefined);
    }

    #[test]
    fn encode_negative_goes_through_dictionary() {
        let mut dict = Dictionary::new();
        let heap = Heap::new(1, 0);
        let t = encode_any(&Value::Int(-5), &mut dict, &heap).unwrap();
        assert!(t.as_dict().is_some());
        assert_eq!(decode_any(t, &dict, &heap).unwrap(), Value::Int(-5));
        assert_eq!(encode_any(&Value::Undefined, &mut dict, &heap).unwrap(), Tagged::UNDEFINED);
    }
}
