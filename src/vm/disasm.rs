//! Bytecode listing for `stackjs disasm` and debugging.

use std::fmt::Write;
use std::rc::Rc;

use super::tagged::{Tagged, Unpacked};
use super::{Code, Dictionary, OP_CONST, OP_FUNCALL, OP_GOTO, OP_JUMP_IF_FALSE, OP_LOAD, OP_NEW, OP_STORE};
use super::{has_operand, mnemonic};
use crate::runtime::{Function, Value};

/// Disassemble `function` followed by every bytecode function it loads
/// as a constant, depth first.
pub fn disassemble(function: &Rc<Function>, dict: &Dictionary) -> String {
    let mut output = String::new();
    let mut done: Vec<Rc<Function>> = Vec::new();
    disassemble_into(function, dict, &mut output, &mut done);
    output
}

fn disassemble_into(function: &Rc<Function>, dict: &Dictionary, output: &mut String, done: &mut Vec<Rc<Function>>) {
    let Some(code) = function.code() else { return };
    if done.iter().any(|f| Rc::ptr_eq(f, function)) {
        return;
    }
    done.push(function.clone());

    if !output.is_empty() {
        output.push('\n');
    }
    let _ = writeln!(
        output,
        "== {} (params: {}, slots: {}) ==",
        function.name(),
        code.param_count.saturating_sub(1),
        code.slot_count
    );

    let mut nested = Vec::new();
    let mut offset = 0;
    while offset < code.instrs.len() {
        offset = disassemble_instruction(code, offset, dict, output, &mut nested);
    }
    for f in nested {
        disassemble_into(&f, dict, output, done);
    }
}

/// Write one instruction and return the offset of the next.
fn disassemble_instruction(
    code: &Code,
    offset: usize,
    dict: &Dictionary,
    output: &mut String,
    nested: &mut Vec<Rc<Function>>,
) -> usize {
    let _ = write!(output, "{offset:04} ");

    let line = code.line_at(offset);
    if offset > 0 && line == code.line_at(offset - 1) {
        let _ = write!(output, "   | ");
    } else {
        let _ = write!(output, "{line:4} ");
    }

    let op = code.instrs[offset];
    let Some(name) = mnemonic(op) else {
        let _ = writeln!(output, "Unknown opcode {op}");
        return offset + 1;
    };
    if !has_operand(op) {
        let _ = writeln!(output, "{name}");
        return offset + 1;
    }
    let Some(&operand) = code.instrs.get(offset + 1) else {
        let _ = writeln!(output, "{name:<14} <missing operand>");
        return offset + 1;
    };

    let shown = match op {
        OP_LOAD | OP_STORE => format!("slot {operand}"),
        OP_FUNCALL => format!("argc {operand}"),
        OP_GOTO | OP_JUMP_IF_FALSE => format!("-> {operand:04}"),
        OP_CONST => constant(Tagged::from_bits(operand), dict, nested),
        OP_NEW => match dict.shape(Tagged::from_bits(operand)) {
            Ok(shape) => shape.to_string(),
            Err(_) => format!("<bad shape {operand:#x}>"),
        },
        _ => match dict.string(Tagged::from_bits(operand)) {
            Ok(s) => s.to_string(),
            Err(_) => format!("<bad name {operand:#x}>"),
        },
    };
    let _ = writeln!(output, "{name:<14} {shown}");
    offset + 2
}

fn constant(tagged: Tagged, dict: &Dictionary, nested: &mut Vec<Rc<Function>>) -> String {
    match tagged.unpack() {
        Unpacked::SmallInt(n) => n.to_string(),
        Unpacked::Reference(r) => format!("@{r}"),
        Unpacked::Dict(i) => match dict.lookup(i) {
            Some(Value::Function(f)) => {
                if f.code().is_some() {
                    nested.push(f.clone());
                }
                format!("<fn {}>", f.name())
            }
            Some(value @ Value::Str(_)) => format!("{value:?}"),
            Some(value) => value.to_string(),
            None => format!("<bad constant d{i}>"),
        },
    }
}
