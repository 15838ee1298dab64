use std::rc::Rc;

use stackjs::ast::{Expr, Script};
use stackjs::runtime::{Capture, ErrorKind, Failure, Resource, Runtime, Value};
use stackjs::vm::{Dictionary, HeapPolicy, VmConfig};

// --- Helpers ---

struct Outcome<T = Value> {
    result: Result<T, Failure>,
    output: Vec<String>,
}

/// Host stack for interpreter runs, as the CLI gives its run thread.
const INTERPRETER_STACK: usize = 64 * 1024 * 1024;

fn run_with(config: VmConfig, script: &Script, engine: fn(&mut Runtime, &Script) -> Result<Value, Failure>) -> Outcome {
    let capture = Capture::new();
    let mut rt = Runtime::with_output(config, Box::new(capture.clone()));
    let result = engine(&mut rt, script);
    Outcome { result, output: capture.lines() }
}

/// The interpreter recurses on the host stack, so it runs on a thread of
/// its own. Values hold `Rc`s and stay behind; the result comes back
/// rendered.
fn ast_with(config: VmConfig, script: &Script) -> Outcome<String> {
    std::thread::scope(|scope| {
        std::thread::Builder::new()
            .name("interpreter".to_string())
            .stack_size(INTERPRETER_STACK)
            .spawn_scoped(scope, || {
                let out = run_with(config, script, stackjs::interpreter::run);
                Outcome { result: out.result.map(|value| value.to_string()), output: out.output }
            })
            .expect("spawn interpreter thread")
            .join()
            .expect("interpreter thread panicked")
    })
}

/// Run on both engines under `config` and require identical output and
/// result.
fn agree_with(config: VmConfig, body: Vec<Expr>) -> Outcome {
    let script = Script::new(body);
    let on_vm = run_with(config, &script, stackjs::vm::run);
    let on_ast = ast_with(config, &script);
    assert_eq!(on_vm.output, on_ast.output, "engines printed different output");
    match (&on_vm.result, &on_ast.result) {
        (Ok(a), Ok(b)) => assert_eq!(&a.to_string(), b, "engines returned different values"),
        (Err(a), Err(b)) => assert_eq!(a.kind, b.kind, "engines failed differently"),
        (a, b) => panic!("engines disagree: vm {a:?}, ast {b:?}"),
    }
    on_vm
}

fn agree(body: Vec<Expr>) -> Outcome {
    agree_with(VmConfig::default(), body)
}

fn print(args: Vec<Expr>) -> Expr {
    Expr::op("print", args)
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

// --- Cross-engine equivalence ---

#[test]
fn fact_printed() {
    let out = agree(vec![fact(), print(vec![Expr::call(Expr::var("fact"), vec![Expr::int(5)])])]);
    assert_eq!(out.output, vec!["120"]);
    assert!(out.result.unwrap().is_undefined());
}

#[test]
fn fact_returned() {
    let out = agree(vec![fact(), Expr::ret(Expr::call(Expr::var("fact"), vec![Expr::int(10)]))]);
    assert_eq!(out.result.unwrap(), Value::Int(3_628_800));
}

#[test]
fn arithmetic_and_negative_results() {
    let out = agree(vec![
        print(vec![Expr::op("-", vec![Expr::int(3), Expr::int(10)])]),
        print(vec![Expr::op("/", vec![Expr::int(-7), Expr::int(2)])]),
        print(vec![Expr::op("%", vec![Expr::int(17), Expr::int(5)])]),
        print(vec![Expr::op("+", vec![Expr::int(i32::MAX), Expr::int(1)])]),
    ]);
    assert_eq!(out.output, vec!["-7", "-3", "2", "-2147483648"]);
}

#[test]
fn strings_print_and_compare() {
    let out = agree(vec![
        Expr::declare("s", Expr::str("hello")),
        print(vec![Expr::var("s"), Expr::str("world")]),
        print(vec![Expr::op("<", vec![Expr::str("abc"), Expr::str("abd")])]),
        print(vec![Expr::op("==", vec![Expr::var("s"), Expr::str("hello")])]),
    ]);
    assert_eq!(out.output, vec!["hello world", "1", "1"]);
}

#[test]
fn deep_recursion_unwinds_frames() {
    // sum(n) = n + sum(n - 1), sum(0) = 0
    let sum = Expr::fun(
        Some("sum"),
        &["n"],
        vec![Expr::if_else(
            Expr::op("==", vec![Expr::var("n"), Expr::int(0)]),
            vec![Expr::ret(Expr::int(0))],
            vec![Expr::ret(Expr::op(
                "+",
                vec![
                    Expr::var("n"),
                    Expr::call(Expr::var("sum"), vec![Expr::op("-", vec![Expr::var("n"), Expr::int(1)])]),
                ],
            ))],
        )],
    );
    let out = agree(vec![
        sum,
        print(vec![Expr::call(Expr::var("sum"), vec![Expr::int(1000)])]),
        print(vec![Expr::str("after")]),
    ]);
    assert_eq!(out.output, vec!["500500", "after"]);
}

#[test]
fn global_object_in_both() {
    let out = agree(vec![
        Expr::put(Expr::var("global"), "x", Expr::int(3)),
        print(vec![Expr::var("x"), Expr::get(Expr::var("global"), "x")]),
        Expr::method(Expr::var("global"), "print", vec![Expr::str("via global")]),
        Expr::declare("o", Expr::new_object(vec![("g", Expr::var("global"))])),
        Expr::put(Expr::get(Expr::var("o"), "g"), "y", Expr::int(4)),
        print(vec![Expr::var("y"), Expr::get(Expr::var("global"), "missing")]),
        Expr::ret(Expr::get(Expr::var("global"), "global")),
    ]);
    assert_eq!(out.output, vec!["3 3", "via global", "4 undefined"]);
    assert_eq!(out.result.unwrap(), Value::Global);
}

#[test]
fn objects_fields_and_methods() {
    let out = agree(vec![
        Expr::declare(
            "counter",
            Expr::new_object(vec![
                ("count", Expr::int(0)),
                (
                    "bump",
                    Expr::fun(None, &["by"], vec![
                        Expr::put(
                            Expr::var("this"),
                            "count",
                            Expr::op("+", vec![Expr::get(Expr::var("this"), "count"), Expr::var("by")]),
                        ),
                        Expr::ret(Expr::get(Expr::var("this"), "count")),
                    ]),
                ),
            ]),
        ),
        Expr::method(Expr::var("counter"), "bump", vec![Expr::int(2)]),
        print(vec![Expr::method(Expr::var("counter"), "bump", vec![Expr::int(3)])]),
        print(vec![Expr::get(Expr::var("counter"), "count")]),
    ]);
    assert_eq!(out.output, vec!["5", "5"]);
}

#[test]
fn objects_are_shared_by_reference() {
    let out = agree(vec![
        Expr::declare("a", Expr::new_object(vec![("x", Expr::int(1))])),
        Expr::declare("b", Expr::var("a")),
        Expr::put(Expr::var("b"), "x", Expr::int(9)),
        print(vec![Expr::get(Expr::var("a"), "x")]),
        print(vec![Expr::op("==", vec![Expr::var("a"), Expr::var("b")])]),
        print(vec![Expr::op(
            "==",
            vec![Expr::var("a"), Expr::new_object(vec![("x", Expr::int(9))])],
        )]),
    ]);
    assert_eq!(out.output, vec!["9", "1", "0"]);
}

#[test]
fn unknown_field_fails_in_both() {
    let out = agree(vec![
        Expr::declare("o", Expr::new_object(vec![("x", Expr::int(1))])),
        Expr::put(Expr::var("o"), "y", Expr::int(2)),
    ]);
    assert_eq!(out.result.unwrap_err().kind, ErrorKind::InvalidField { field: "y".into() });
}

#[test]
fn control_flow_and_truthiness() {
    let out = agree(vec![
        Expr::if_else(Expr::int(0), vec![print(vec![Expr::str("zero")])], vec![print(vec![Expr::str("else")])]),
        Expr::if_else(Expr::str(""), vec![print(vec![Expr::str("empty string")])], vec![]),
        Expr::if_else(Expr::var("nothing"), vec![print(vec![Expr::str("undefined")])], vec![]),
        Expr::if_else(Expr::int(-1), vec![print(vec![Expr::str("negative")])], vec![]),
    ]);
    assert_eq!(out.output, vec!["else", "empty string", "undefined", "negative"]);
}

#[test]
fn return_inside_branch_stops_the_function() {
    let out = agree(vec![
        Expr::fun(Some("sign"), &["n"], vec![
            Expr::if_else(Expr::op("<", vec![Expr::var("n"), Expr::int(0)]), vec![Expr::ret(Expr::int(-1))], vec![]),
            Expr::if_else(Expr::op(">", vec![Expr::var("n"), Expr::int(0)]), vec![Expr::ret(Expr::int(1))], vec![]),
            Expr::ret(Expr::int(0)),
        ]),
        print(vec![
            Expr::call(Expr::var("sign"), vec![Expr::int(-4)]),
            Expr::call(Expr::var("sign"), vec![Expr::int(0)]),
            Expr::call(Expr::var("sign"), vec![Expr::int(8)]),
        ]),
    ]);
    assert_eq!(out.output, vec!["-1 0 1"]);
}

#[test]
fn arity_mismatch_in_both() {
    let out = agree(vec![fact(), Expr::call(Expr::var("fact"), vec![Expr::int(1), Expr::int(2)])]);
    assert_eq!(
        out.result.unwrap_err().kind,
        ErrorKind::ArityMismatch { function: "fact".into(), expected: 1, found: 2 }
    );

    let out = agree(vec![Expr::op("+", vec![Expr::int(1)])]);
    assert!(matches!(out.result.unwrap_err().kind, ErrorKind::ArityMismatch { expected: 2, found: 1, .. }));
}

#[test]
fn output_before_failure_is_kept() {
    let out = agree(vec![
        print(vec![Expr::str("before")]),
        Expr::op("/", vec![Expr::int(1), Expr::int(0)]),
        print(vec![Expr::str("after")]),
    ]);
    assert_eq!(out.output, vec!["before"]);
    assert_eq!(out.result.unwrap_err().kind, ErrorKind::DivisionByZero);
}

// --- Interning ---

#[test]
fn interning_is_idempotent() {
    let mut dict = Dictionary::new();
    let a = dict.register(Value::from("name")).unwrap();
    let b = dict.register(Value::from("name")).unwrap();
    assert_eq!(a, b);

    let shape = Rc::new(stackjs::object::Shape::from_names(["x"]));
    let s1 = dict.register(Value::Shape(shape.clone())).unwrap();
    let s2 = dict.register(Value::Shape(shape.clone())).unwrap();
    assert_eq!(s1, s2);
    match dict.shape(s1) {
        Ok(found) => assert!(Rc::ptr_eq(&found, &shape)),
        Err(e) => panic!("{e}"),
    }

    let other = Rc::new(stackjs::object::Shape::from_names(["x"]));
    assert_ne!(dict.register(Value::Shape(other)).unwrap(), s1);
}

// --- Resource limits ---

#[test]
fn unbounded_recursion_exhausts_the_stack() {
    let script = Script::new(vec![
        Expr::fun(Some("down"), &["n"], vec![Expr::ret(Expr::call(Expr::var("down"), vec![Expr::var("n")]))]),
        Expr::call(Expr::var("down"), vec![Expr::int(1)]),
    ]);
    let config = VmConfig { stack_capacity: 1024, ..VmConfig::default() };
    let out = run_with(config, &script, stackjs::vm::run);
    let err = out.result.unwrap_err();
    assert_eq!(err.kind, ErrorKind::ResourceExhaustion { resource: Resource::Stack, capacity: 1024 });
    assert_eq!(err.context.function.as_deref(), Some("down"));
}

#[test]
fn unbounded_recursion_fails_alike_in_both() {
    let config = VmConfig { stack_capacity: 1024, ..VmConfig::default() };
    let out = agree_with(config, vec![
        print(vec![Expr::str("start")]),
        Expr::fun(Some("down"), &["n"], vec![Expr::ret(Expr::call(Expr::var("down"), vec![Expr::var("n")]))]),
        Expr::call(Expr::var("down"), vec![Expr::int(1)]),
    ]);
    assert_eq!(out.output, vec!["start"]);
    assert_eq!(
        out.result.unwrap_err().kind,
        ErrorKind::ResourceExhaustion { resource: Resource::Stack, capacity: 1024 }
    );
}

#[test]
fn heap_policy_decides_exhaustion() {
    let many: Vec<Expr> = (0..20)
        .map(|i| Expr::declare(format!("o{i}"), Expr::new_object(vec![("v", Expr::int(i))])))
        .chain([Expr::ret(Expr::get(Expr::var("o19"), "v"))])
        .collect();
    let script = Script::new(many);

    let abort = VmConfig { heap_capacity: 16, heap_policy: HeapPolicy::Abort, ..VmConfig::default() };
    let err = run_with(abort, &script, stackjs::vm::run).result.unwrap_err();
    assert_eq!(err.kind, ErrorKind::ResourceExhaustion { resource: Resource::Heap, capacity: 16 });
    assert_eq!(err.context.op, Some("NEW"));

    let grow = VmConfig { heap_capacity: 16, heap_policy: HeapPolicy::Grow, ..VmConfig::default() };
    assert_eq!(run_with(grow, &script, stackjs::vm::run).result.unwrap(), Value::Int(19));
}
