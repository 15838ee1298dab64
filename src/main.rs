use std::io::Write;
use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{EnvFilter, fmt};

use stackjs::ast::Script;
use stackjs::diagnostic::{Diagnostic, ansi, json, registry};
use stackjs::runtime::{Failure, Runtime, Value};
use stackjs::vm::{HeapPolicy, VmConfig};

#[derive(Parser, Debug)]
#[command(name = "stackjs", version)]
#[command(about = "Run JSON program trees on the stackjs VM or the reference interpreter")]
struct Cli {
    /// Log every call and return with a stack dump (overrides RUST_LOG)
    #[arg(long, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute a program and print its result
    Run {
        /// Program tree as JSON
        path: PathBuf,

        #[arg(long, value_enum, default_value = "vm")]
        engine: Engine,

        /// Operand stack capacity in cells
        #[arg(long, default_value_t = VmConfig::default().stack_capacity)]
        stack_size: usize,

        /// Heap capacity in cells
        #[arg(long, default_value_t = VmConfig::default().heap_capacity)]
        heap_size: usize,

        /// Double the heap when it fills instead of failing
        #[arg(long)]
        grow_heap: bool,

        /// Report failures as JSON on stderr
        #[arg(long)]
        json: bool,
    },
    /// Print the bytecode listing for a program
    Disasm {
        path: PathBuf,
    },
    /// Explain a diagnostic code such as SJS-E001
    Explain {
        code: String,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Engine {
    /// Bytecode compiler and stack VM
    Vm,
    /// Tree-walking reference interpreter
    Ast,
}

fn init_logging(trace: bool) {
    let filter = if trace {
        EnvFilter::new("stackjs=trace")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load(path: &Path) -> Script {
    let source = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error reading {}: {}", path.display(), e);
            process::exit(1);
        }
    };
    match Script::from_json(&source) {
        Ok(script) => script,
        Err(e) => {
            eprintln!("Invalid program tree in {}: {}", path.display(), e);
            process::exit(1);
        }
    }
}

/// Host stack reserved per nested call. The interpreter recurses on the
/// host stack, so the run thread is sized from the call depth limit.
const HOST_STACK_PER_CALL: usize = 64 * 1024;
const MIN_HOST_STACK: usize = 8 * 1024 * 1024;

/// Run `script` on its own thread and print a defined result.
fn execute(script: Script, engine: Engine, config: VmConfig) -> Result<(), Failure> {
    let stack_size = config.call_depth_limit().saturating_mul(HOST_STACK_PER_CALL).max(MIN_HOST_STACK);
    let worker = std::thread::Builder::new()
        .name("stackjs-run".to_string())
        .stack_size(stack_size)
        .spawn(move || -> Result<(), Failure> {
            let mut rt = Runtime::new(config);
            let result = match engine {
                Engine::Vm => stackjs::vm::run(&mut rt, &script),
                Engine::Ast => stackjs::interpreter::run(&mut rt, &script),
            };
            match result? {
                Value::Undefined => {}
                value => println!("{value}"),
            }
            Ok(())
        });
    match worker {
        Ok(handle) => handle.join().unwrap_or_else(|_| Err(Failure::internal("run thread panicked"))),
        Err(e) => Err(Failure::internal(format!("cannot start run thread: {e}"))),
    }
}

fn report(failure: &Failure, as_json: bool) -> ! {
    let _ = std::io::stdout().flush();
    let d = Diagnostic::from(failure);
    if as_json {
        eprintln!("{}", json::render(&d));
    } else {
        let renderer = ansi::AnsiRenderer { use_color: ansi::use_color() };
        eprint!("{}", renderer.render(&d));
    }
    process::exit(1);
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.trace);

    match cli.command {
        Command::Run { path, engine, stack_size, heap_size, grow_heap, json: as_json } => {
            let script = load(&path);
            let config = VmConfig {
                stack_capacity: stack_size,
                heap_capacity: heap_size,
                heap_policy: if grow_heap { HeapPolicy::Grow } else { HeapPolicy::Abort },
            };
            if let Err(e) = execute(script, engine, config) {
                report(&e, as_json);
            }
        }
        Command::Disasm { path } => {
            let script = load(&path);
            let mut rt = Runtime::new(VmConfig::default());
            match stackjs::compiler::compile_script(&script, &mut rt.dict) {
                Ok(main) => print!("{}", stackjs::vm::disasm::disassemble(&main, &rt.dict)),
                Err(e) => report(&e, false),
            }
        }
        Command::Explain { code } => match registry::lookup(&code) {
            Some(entry) => print!("{}", entry.long),
            None => {
                eprintln!("Unknown diagnostic code '{code}'");
                process::exit(1);
            }
        },
    }
}
