use std::io::Write;

use super::{ErrorKind, Failure, Function, Globals, Value};

type BinaryOp = fn(&Value, &Value) -> Result<Value, Failure>;

const BINARY: &[(&str, BinaryOp)] = &[
    ("+", add),
    ("-", sub),
    ("*", mul),
    ("/", div),
    ("%", rem),
    ("==", eq),
    ("!=", ne),
    ("<", lt),
    ("<=", le),
    (">", gt),
    (">=", ge),
];

/// Register every built-in in `globals`.
pub fn install(globals: &mut Globals) {
    for &(name, op) in BINARY {
        let f = Function::native(name, move |_out, _this, args| binary(name, op, args));
        globals.register(name, Value::Function(f));
    }
    globals.register("print", Value::Function(Function::native("print", print)));
}

fn binary(name: &str, op: BinaryOp, args: &[Value]) -> Result<Value, Failure> {
    match args {
        [a, b] => op(a, b),
        _ => Err(Failure::arity(name, 2, args.len())),
    }
}

fn ints(a: &Value, b: &Value) -> Result<(i32, i32), Failure> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Ok((*x, *y)),
        (Value::Int(_), other) | (other, _) => Err(Failure::type_mismatch("integer", other)),
    }
}

fn add(a: &Value, b: &Value) -> Result<Value, Failure> {
    let (x, y) = ints(a, b)?;
    Ok(Value::Int(x.wrapping_add(y)))
}

fn sub(a: &Value, b: &Value) -> Result<Value, Failure> {
    let (x, y) = ints(a, b)?;
    Ok(Value::Int(x.wrapping_sub(y)))
}

fn mul(a: &Value, b: &Value) -> Result<Value, Failure> {
    let (x, y) = ints(a, b)?;
    Ok(Value::Int(x.wrapping_mul(y)))
}

fn div(a: &Value, b: &Value) -> Result<Value, Failure> {
    let (x, y) = ints(a, b)?;
    if y == 0 {
        return Err(ErrorKind::DivisionByZero.into());
    }
    Ok(Value::Int(x.wrapping_div(y)))
}

fn rem(a: &Value, b: &Value) -> Result<Value, Failure> {
    let (x, y) = ints(a, b)?;
    if y == 0 {
        return Err(ErrorKind::DivisionByZero.into());
    }
    Ok(Value::Int(x.wrapping_rem(y)))
}

fn eq(a: &Value, b: &Value) -> Result<Value, Failure> {
    Ok(Value::bool(a.same(b)))
}

fn ne(a: &Value, b: &Value) -> Result<Value, Failure> {
    Ok(Value::bool(!a.same(b)))
}

fn compare(a: &Value, b: &Value) -> Result<std::cmp::Ordering, Failure> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Ok(x.cmp(y)),
        (Value::Str(x), Value::Str(y)) => Ok(x.cmp(y)),
        (Value::Int(_), other) => Err(Failure::type_mismatch("integer", other)),
        (Value::Str(_), other) => Err(Failure::type_mismatch("string", other)),
        (other, _) => Err(Failure::type_mismatch("integer or string", other)),
    }
}

fn lt(a: &Value, b: &Value) -> Result<Value, Failure> {
    Ok(Value::bool(compare(a, b)?.is_lt()))
}

fn le(a: &Value, b: &Value) -> Result<Value, Failure> {
    Ok(Value::bool(compare(a, b)?.is_le()))
}

fn gt(a: &Value, b: &Value) -> Result<Value, Failure> {
    Ok(Value::bool(compare(a, b)?.is_gt()))
}

fn ge(a: &Value, b: &Value) -> Result<Value, Failure> {
    Ok(Value::bool(compare(a, b)?.is_ge()))
}

fn print(out: &mut dyn Write, _this: &Value, args: &[Value]) -> Result<Value, Failure> {
    let line = args.iter().map(Value::to_string).collect::<Vec<_>>().join(" ");
    writeln!(out, "{line}").map_err(|e| Failure::internal(format!("print: {e}")))?;
    Ok(Value::Undefined)
}
