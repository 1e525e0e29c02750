use std::io;
use std::path::{Path, PathBuf};

use goomsl::{
    ExternalCall, JitConfig, Value, Vm, VmConfig, VmResult, render_compile_error,
    render_runtime_fault,
};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tracing::info;

const DEFAULT_SOURCE: &str = "demos/spiral.gsl";

#[derive(Debug, Clone, PartialEq, Eq)]
struct CliConfig {
    source: Option<String>,
    repl: bool,
    no_jit: bool,
    dump_flow: bool,
    jit_dump: bool,
    max_call_depth: Option<usize>,
    assignments: Vec<(String, String)>,
    print: Vec<String>,
    help: bool,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            source: None,
            repl: false,
            no_jit: false,
            dump_flow: false,
            jit_dump: false,
            max_call_depth: None,
            assignments: Vec::new(),
            print: Vec::new(),
            help: false,
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    goomsl::logging::init()?;
    let args: Vec<String> = std::env::args().skip(1).collect();
    let cli = parse_cli_args(&args).map_err(io::Error::other)?;
    if cli.help {
        print_usage();
        return Ok(());
    }
    if cli.repl {
        return run_repl(&cli);
    }

    let source_path = resolve_source_path(cli.source.as_deref())?;
    let source = std::fs::read_to_string(&source_path)?;
    let file_name = source_path.display().to_string();
    let mut vm = build_vm(&cli);
    if let Err(err) = vm.compile(&source) {
        return Err(io::Error::other(render_compile_error(&file_name, &source, &err)).into());
    }

    for (name, raw) in &cli.assignments {
        let value = parse_assignment(&vm, name, raw).map_err(io::Error::other)?;
        vm.set_global(name, value)?;
    }
    if cli.dump_flow
        && let Some(program) = vm.program()
    {
        print!("{}", program.disassemble());
    }

    let backend = vm
        .execute()
        .map_err(|fault| io::Error::other(render_runtime_fault(&fault)))?;
    info!(?backend, script = %file_name, "script finished");

    print_globals(&vm, &cli.print)?;
    if cli.jit_dump {
        println!("{}", vm.dump_jit_info());
    }
    Ok(())
}

fn parse_cli_args(args: &[String]) -> Result<CliConfig, String> {
    let mut cfg = CliConfig::default();
    let mut index = 0usize;

    if let Some(first) = args.first()
        && first == "repl"
    {
        cfg.repl = true;
        index = 1;
    }

    while index < args.len() {
        match args[index].as_str() {
            "-h" | "--help" => {
                cfg.help = true;
                index += 1;
            }
            "--no-jit" => {
                cfg.no_jit = true;
                index += 1;
            }
            "--dump-flow" => {
                cfg.dump_flow = true;
                index += 1;
            }
            "--jit-dump" => {
                cfg.jit_dump = true;
                index += 1;
            }
            "--max-call-depth" => {
                let raw = args
                    .get(index + 1)
                    .ok_or_else(|| "missing value for --max-call-depth".to_string())?;
                let value = raw
                    .parse::<usize>()
                    .map_err(|_| format!("invalid --max-call-depth value '{raw}'"))?;
                cfg.max_call_depth = Some(value);
                index += 2;
            }
            "--set" => {
                let raw = args
                    .get(index + 1)
                    .ok_or_else(|| "missing value for --set".to_string())?;
                let (name, value) = raw
                    .split_once('=')
                    .filter(|(name, value)| !name.is_empty() && !value.is_empty())
                    .ok_or_else(|| format!("--set expects NAME=VALUE, got '{raw}'"))?;
                cfg.assignments.push((name.to_string(), value.to_string()));
                index += 2;
            }
            "--print" => {
                let name = args
                    .get(index + 1)
                    .ok_or_else(|| "missing value for --print".to_string())?;
                cfg.print.push(name.clone());
                index += 2;
            }
            value if value.starts_with('-') => {
                return Err(format!("unknown flag '{value}'"));
            }
            path => {
                if cfg.source.is_some() {
                    return Err("multiple source paths provided".to_string());
                }
                cfg.source = Some(path.to_string());
                index += 1;
            }
        }
    }

    if cfg.repl
        && (cfg.source.is_some()
            || cfg.dump_flow
            || !cfg.assignments.is_empty()
            || !cfg.print.is_empty())
    {
        return Err(
            "repl mode cannot be combined with a source path or --dump-flow/--set/--print"
                .to_string(),
        );
    }
    Ok(cfg)
}

fn resolve_source_path(arg: Option<&str>) -> Result<PathBuf, io::Error> {
    let rel = arg.unwrap_or(DEFAULT_SOURCE);
    let provided = PathBuf::from(rel);
    if provided.is_absolute() {
        return Ok(provided);
    }

    let cwd_path = std::env::current_dir()?.join(&provided);
    if cwd_path.exists() {
        return Ok(cwd_path);
    }

    Ok(Path::new(env!("CARGO_MANIFEST_DIR")).join(provided))
}

fn build_vm(cli: &CliConfig) -> Vm {
    let mut config = VmConfig::default();
    if let Some(depth) = cli.max_call_depth {
        config.max_call_depth = depth;
    }
    if cli.no_jit {
        config.jit = JitConfig {
            enabled: false,
            ..config.jit
        };
    }
    let mut vm = Vm::with_config(config);
    vm.bind_external("print_int", print_first_arg);
    vm.bind_external("print_float", print_first_arg);
    vm
}

fn print_first_arg(call: &mut ExternalCall<'_>) -> VmResult<()> {
    match call.args()?.first() {
        Some(value) => println!("{value}"),
        None => println!(),
    }
    Ok(())
}

/// Parses `raw` as the declared type of global `name`.
fn parse_assignment(vm: &Vm, name: &str, raw: &str) -> Result<Value, String> {
    let current = vm
        .global(name)
        .ok_or_else(|| format!("--set: unknown global '{name}'"))?;
    let invalid = || format!("--set: '{raw}' is not a valid value for '{name}'");
    match current {
        Value::Int(_) => raw.parse().map(Value::Int).map_err(|_| invalid()),
        Value::Float(_) => raw.parse().map(Value::Float).map_err(|_| invalid()),
        Value::Pointer(_) => raw.parse().map(Value::Pointer).map_err(|_| invalid()),
        Value::Struct(_) => Err(format!("--set: struct global '{name}' cannot be assigned")),
    }
}

/// Compiler temporaries start with `_` and are hidden.
fn visible_globals(vm: &Vm) -> Vec<(String, Value)> {
    vm.globals()
        .into_iter()
        .filter(|(name, _)| !name.starts_with('_'))
        .collect()
}

fn print_globals(vm: &Vm, selected: &[String]) -> Result<(), io::Error> {
    if selected.is_empty() {
        for (name, value) in visible_globals(vm) {
            println!("{name} = {value}");
        }
        return Ok(());
    }
    for name in selected {
        let value = vm
            .global(name)
            .ok_or_else(|| io::Error::other(format!("--print: unknown global '{name}'")))?;
        println!("{name} = {value}");
    }
    Ok(())
}

fn print_usage() {
    println!("Usage:");
    println!("  goomsl-run [script.gsl]       (defaults to {DEFAULT_SOURCE})");
    println!("  goomsl-run repl [--no-jit] [--max-call-depth <n>]");
    println!(
        "  goomsl-run [--no-jit] [--dump-flow] [--jit-dump] [--max-call-depth <n>] [script.gsl]"
    );
    println!("  goomsl-run --set <name=value> ... --print <name> ... [script.gsl]");
    println!("natives: print_int, print_float (declare them with 'extern void ...')");
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ReplAction {
    Continue,
    Break,
}

#[derive(Default)]
struct ReplSession {
    lines: Vec<String>,
}

fn run_repl(cli: &CliConfig) -> Result<(), Box<dyn std::error::Error>> {
    println!("goomsl REPL");
    println!("type script lines, then :run; :help lists commands");
    let mut editor = DefaultEditor::new()?;
    let mut session = ReplSession::default();
    let mut vm = build_vm(cli);
    loop {
        match editor.readline("gsl> ") {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(line);
                if let Some(action) = handle_repl_command(line, &mut session, &mut vm, cli) {
                    if action == ReplAction::Break {
                        break;
                    }
                    continue;
                }
                session.lines.push(line.to_string());
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => {
                println!("bye");
                break;
            }
            Err(err) => {
                return Err(Box::new(io::Error::other(err.to_string())));
            }
        }
    }
    Ok(())
}

fn handle_repl_command(
    line: &str,
    session: &mut ReplSession,
    vm: &mut Vm,
    cli: &CliConfig,
) -> Option<ReplAction> {
    match line {
        ":quit" | ":exit" => Some(ReplAction::Break),
        ":help" => {
            println!("commands:");
            println!("  :run       compile and run the lines entered so far");
            println!("  :globals   show globals after the last run");
            println!("  :flow      show the compiled instruction flow");
            println!("  :reset     forget all lines");
            println!("  :quit      quit repl");
            Some(ReplAction::Continue)
        }
        ":run" => {
            let source = session.lines.join("\n");
            match vm.compile(&source) {
                Ok(_) => match vm.execute() {
                    Ok(backend) => println!("=> ok ({backend:?})"),
                    Err(fault) => println!("{}", render_runtime_fault(&fault)),
                },
                Err(err) => println!("{}", render_compile_error("<repl>", &source, &err)),
            }
            Some(ReplAction::Continue)
        }
        ":globals" => {
            for (name, value) in visible_globals(vm) {
                println!("{name} = {value}");
            }
            Some(ReplAction::Continue)
        }
        ":flow" => {
            match vm.program() {
                Some(program) => print!("{}", program.disassemble()),
                None => println!("nothing compiled yet"),
            }
            Some(ReplAction::Continue)
        }
        ":reset" => {
            session.lines.clear();
            *vm = build_vm(cli);
            Some(ReplAction::Continue)
        }
        _ if line.starts_with(':') => {
            println!("unknown command: {line}");
            Some(ReplAction::Continue)
        }
        _ => None,
    }
}
