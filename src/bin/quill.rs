// Quill CLI - Command Line Interface
// Usage: quill [FILE] [OPTIONS]

use clap::Parser;
use colored::*;
use std::fs;
use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, EnvFilter};

use quill_core::binary;
use quill_core::compiler::{parse, Bytecode, ParseTrace};
use quill_core::error::{ExecStatus, QuillError};
use quill_core::vm::{execute, Execution, Value};

/// Quill - A statically typed scripting language
#[derive(Parser)]
#[command(name = "quill")]
#[command(author = "quillproject")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "A statically typed scripting language with a bytecode VM", long_about = None)]
struct Cli {
    /// Source file to run (.ql or .qlc)
    file: Option<PathBuf>,

    /// Debug options: asm, trace, vars (comma-separated)
    #[arg(short = 'd', long = "debug", value_delimiter = ',')]
    debug: Option<Vec<String>>,

    /// Execute inline code
    #[arg(short = 'e', long = "exec")]
    exec: Option<String>,

    /// Compile to .qlc instead of running
    #[arg(short = 'c', long = "compile")]
    compile: bool,

    /// Check for errors without running
    #[arg(long = "check")]
    check: bool,

    /// Print the final variable state as JSON
    #[arg(long = "json")]
    json: bool,

    /// Output path for compiled file (requires -c)
    #[arg(short = 'o', long = "output")]
    output: Option<PathBuf>,
}

fn main() {
    init_logging();
    let cli = Cli::parse();

    let debug = DebugFlags::from_options(&cli.debug);

    let result = if let Some(code) = cli.exec {
        handle_exec(&code, &debug, cli.json)
    } else if let Some(path) = cli.file {
        if cli.check {
            handle_check(&path, &debug)
        } else if cli.compile {
            handle_compile(&path, &debug, cli.output)
        } else {
            handle_run(&path, &debug, cli.json)
        }
    } else {
        Err(format!(
            "{} No input. Pass a file or use -e <code>",
            "!".yellow()
        ))
    };

    if let Err(e) = result {
        eprintln!("{}", e);
        std::process::exit(1);
    }
}

/// `QUILL_LOG` takes an env-filter directive, e.g. `QUILL_LOG=quill_core=trace`
fn init_logging() {
    let filter = EnvFilter::try_from_env("QUILL_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[derive(Default, Clone)]
struct DebugFlags {
    asm: bool,
    trace: bool,
    vars: bool,
}

impl DebugFlags {
    fn from_options(opts: &Option<Vec<String>>) -> Self {
        let mut flags = Self::default();
        if let Some(opts) = opts {
            for opt in opts {
                match opt.as_str() {
                    "asm" => flags.asm = true,
                    "trace" => flags.trace = true,
                    "vars" => flags.vars = true,
                    _ => eprintln!("{} Unknown debug option: {}", "!".yellow(), opt),
                }
            }
        }
        flags
    }
}

fn read_source(path: &Path) -> Result<String, String> {
    fs::read_to_string(path).map_err(|e| format!("Error reading file '{}': {}", path.display(), e))
}

/// Compile source text, printing the diagnostic tree on failure when asked
fn compile_source(source: &str, file_name: &str, debug: &DebugFlags) -> Result<Bytecode, String> {
    let compilation = parse(source);
    if !compilation.is_ok() {
        if debug.trace {
            print_trace(&compilation.trace)?;
        }
        return Err(compilation.trace.to_error(file_name, source).format());
    }
    if debug.asm {
        println!("{}", "-- Bytecode --".cyan());
        print!("{}", compilation.bytecode.disassemble());
        println!();
    }
    Ok(compilation.bytecode)
}

/// Check file for errors without running
fn handle_check(path: &Path, debug: &DebugFlags) -> Result<(), String> {
    let source = read_source(path)?;
    let file_name = path.to_string_lossy().to_string();
    compile_source(&source, &file_name, debug)?;

    println!("{} No errors found in {}", "✓".green(), path.display());
    Ok(())
}

fn handle_compile(path: &Path, debug: &DebugFlags, output: Option<PathBuf>) -> Result<(), String> {
    let source = read_source(path)?;
    let file_name = path.to_string_lossy().to_string();
    let bytecode = compile_source(&source, &file_name, debug)?;

    let output_path = output.unwrap_or_else(|| path.with_extension("qlc"));

    let bytes = binary::serialize(&bytecode);
    fs::write(&output_path, bytes).map_err(|e| format!("Error writing file: {}", e))?;
    println!("{} Compiled to {}", "✓".green(), output_path.display());

    Ok(())
}

fn handle_run(path: &Path, debug: &DebugFlags, json: bool) -> Result<(), String> {
    let file_name = path.to_string_lossy().to_string();
    let data =
        fs::read(path).map_err(|e| format!("Error reading file '{}': {}", path.display(), e))?;

    let bytecode = if binary::is_binary(&data) {
        let bytecode = binary::deserialize(&data)?;
        if debug.asm {
            print!("{}", bytecode.disassemble());
        }
        bytecode
    } else {
        let source = String::from_utf8(data)
            .map_err(|e| format!("Error reading file '{}': {}", path.display(), e))?;
        compile_source(&source, &file_name, debug)?
    };

    report(&execute(&bytecode), &file_name, debug, json)
}

fn handle_exec(code: &str, debug: &DebugFlags, json: bool) -> Result<(), String> {
    let bytecode = compile_source(code, "<exec>", debug)?;
    report(&execute(&bytecode), "<exec>", debug, json)
}

/// Print the requested views of a finished run and turn a fault into an error report
fn report(execution: &Execution, file_name: &str, debug: &DebugFlags, json: bool) -> Result<(), String> {
    if debug.vars {
        print_variables(execution)?;
    }
    if json {
        let text = serde_json::to_string_pretty(execution).map_err(|e| e.to_string())?;
        println!("{}", text);
    }

    match execution.status {
        ExecStatus::Failed(err) => Err(QuillError::from_exec(err, file_name).format()),
        _ => Ok(()),
    }
}

// ==================== Tree views ====================

fn print_trace(trace: &ParseTrace) -> Result<(), String> {
    let mut tree = ptree::TreeBuilder::new(trace.label());
    for child in &trace.children {
        build_trace_tree(&mut tree, child);
    }
    ptree::print_tree(&tree.build()).map_err(|e| e.to_string())
}

fn build_trace_tree(tree: &mut ptree::TreeBuilder, node: &ParseTrace) {
    if node.children.is_empty() {
        tree.add_empty_child(node.label());
        return;
    }
    tree.begin_child(node.label());
    for child in &node.children {
        build_trace_tree(tree, child);
    }
    tree.end_child();
}

fn print_variables(execution: &Execution) -> Result<(), String> {
    let mut tree = ptree::TreeBuilder::new(format!("Variables ({})", execution.status));
    for var in &execution.variables {
        let label = format!("{} {} {}", var.qualified_name(), var.kind, var.ty);
        match &var.value {
            Some(value) => build_value_tree(&mut tree, label, value),
            None => {
                tree.add_empty_child(label);
            }
        }
    }
    ptree::print_tree(&tree.build()).map_err(|e| e.to_string())
}

fn build_value_tree(tree: &mut ptree::TreeBuilder, label: String, value: &Value) {
    match value {
        Value::Array(array) => {
            tree.begin_child(format!("{} ({} elements)", label, array.len()));
            for element in array.elements() {
                let indexes = element
                    .indexes
                    .iter()
                    .map(|v| v.to_string())
                    .collect::<Vec<_>>()
                    .join(",");
                build_value_tree(tree, format!("[{}]", indexes), &element.value);
            }
            tree.end_child();
        }
        scalar => {
            tree.add_empty_child(format!("{} = {}", label, scalar));
        }
    }
}
