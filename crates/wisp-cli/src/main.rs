//! Command-line driver for the wisp language (spec §6 "External interfaces").
//!
//! This binary is the external collaborator spec.md §1 names as out of
//! scope for the CORE redesign: the REPL loop, the file reader, and the
//! process exit codes. It is still built with the reference codebase's own
//! driver stack (`clap`, `rustyline`, `tracing-subscriber`) rather than
//! hand-rolled argument parsing, since the ambient stack is never a
//! non-goal (SPEC_FULL.md §8).

mod repl;

use std::fs;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use wisp_runtime::config::FileConfig;
use wisp_runtime::vm::InterpretError;
use wisp_runtime::{Vm, VmConfig};

/// Exit codes (spec §6).
const EXIT_OK: u8 = 0;
const EXIT_USAGE: u8 = 64;
const EXIT_COMPILE_ERROR: u8 = 65;
const EXIT_RUNTIME_ERROR: u8 = 70;
const EXIT_IO_ERROR: u8 = 74;

#[derive(Parser, Debug)]
#[command(name = "wisp", version, about = "The wisp scripting language")]
struct Cli {
    /// Increase log verbosity; repeatable (-v, -vv). Overridden by RUST_LOG.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Run a collection before every allocation (spec §4.5 "stress" mode).
    #[arg(long)]
    gc_stress: bool,

    /// Script to execute. Omit to start the interactive REPL.
    ///
    /// A `Vec` rather than `Option<String>` so that passing more than one
    /// script name is detected as the spec's own usage error (exit 64)
    /// instead of clap's generic argument-count error.
    script: Vec<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    install_logging(cli.verbose);

    let config = load_config(cli.gc_stress);

    match cli.script.as_slice() {
        [] => run_repl(config),
        [path] => run_file(path, config),
        _ => {
            eprintln!("Usage: wisp [script]");
            ExitCode::from(EXIT_USAGE)
        }
    }
}

fn install_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Loads `wisp.toml` from the current directory if present (SPEC_FULL.md
/// §8.3); a missing or unreadable file silently falls back to defaults,
/// since this override is pure ambient convenience, never required to run
/// a script.
fn load_config(gc_stress: bool) -> VmConfig {
    let base = VmConfig::new().with_gc_stress(gc_stress);
    match fs::read_to_string("wisp.toml") {
        Ok(contents) => match FileConfig::parse(&contents) {
            Ok(file) => file.apply(base),
            Err(e) => {
                tracing::warn!(error = %e, "ignoring malformed wisp.toml");
                base
            }
        },
        Err(_) => base,
    }
}

fn run_file(path: &str, config: VmConfig) -> ExitCode {
    let source = match fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Could not read file \"{path}\": {e}");
            return ExitCode::from(EXIT_IO_ERROR);
        }
    };

    let mut vm = Vm::with_config(config);
    match vm.interpret(&source) {
        Ok(()) => ExitCode::from(EXIT_OK),
        Err(InterpretError::Compile(err)) => {
            for diagnostic in err.diagnostics() {
                eprintln!("{diagnostic}");
            }
            ExitCode::from(EXIT_COMPILE_ERROR)
        }
        // The VM has already written the runtime diagnostic and stack
        // trace to the error sink by the time `interpret` returns (spec §7).
        Err(InterpretError::Runtime(_)) => ExitCode::from(EXIT_RUNTIME_ERROR),
    }
}

fn run_repl(config: VmConfig) -> ExitCode {
    repl::run(config)
}
