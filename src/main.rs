//! CLI entry point for lab-bench
//!
//! Starts a console over the instruments on the bench:
//! - scans every enabled transport and binds known models to their aliases
//! - reads commands from stdin (`bench> ` prompt) or from a script file
//! - on exit, Ctrl+C or end of input, drives every instrument to its safe
//!   state and closes all connections
//!
//! # Usage
//!
//! Interactive, against real hardware:
//! ```bash
//! lab-bench --config config/lab_bench.toml
//! ```
//!
//! Against the simulated demo bench:
//! ```bash
//! lab-bench --mock --script bring_up.bench
//! ```
//!
//! Exit codes: 0 on a clean exit, 1 if an instrument did not reach its safe
//! state, 2 if the console could not start.

use anyhow::{Context, Result};
use clap::Parser;
use lab_bench::config::{BenchConfig, DEFAULT_CONFIG_PATH};
use lab_bench::error::{BenchError, BenchResult};
use lab_bench::interpreter::{Interpreter, Reply};
use lab_bench::logging;
use lab_bench::transport::sim::SimulatedBench;
use lab_bench::transport::{BackendSet, TransportBackend};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

#[cfg(feature = "instrument_serial")]
use lab_bench::transport::serial::SerialBackend;

#[derive(Parser)]
#[command(name = "lab-bench")]
#[command(about = "Interactive console for bench instruments", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Use the simulated demo bench instead of real transports
    #[arg(long)]
    mock: bool,

    /// Read commands from a file instead of stdin
    #[arg(long)]
    script: Option<PathBuf>,

    /// Override the configured log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Skip the startup scan
    #[arg(long)]
    no_scan: bool,
}

/// How the command loop ended.
enum LoopEnd {
    Finished,
    Interrupted,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("❌ {e:#}");
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let mut config = BenchConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(level) = cli.log_level {
        config.application.log_level = level;
        config.validate()?;
    }
    logging::init_from_config(&config)?;

    let Some(backend) = build_backend(cli.mock) else {
        eprintln!("❌ No transport backend is available in this build");
        eprintln!("   Rebuild with --features instrument_serial, or run with --mock");
        return Ok(ExitCode::from(2));
    };

    println!("🔬 {} ({} transport)", config.application.name, backend.name());
    let mut repl = Interpreter::new(backend, config);

    if !cli.no_scan {
        println!("🔍 Scanning...");
        match repl.startup().await {
            Ok(text) => println!("{text}"),
            Err(BenchError::NoTransport) => {
                eprintln!("❌ None of the configured transports is available");
                return Ok(ExitCode::from(2));
            }
            Err(e) => eprintln!("⚠️  {e}"),
        }
    }

    let end = match &cli.script {
        Some(path) => run_script(&mut repl, path).await?,
        None => run_console(&mut repl).await?,
    };
    if matches!(end, LoopEnd::Interrupted) {
        info!("Interrupted by operator");
        println!();
        println!("⚠️  Interrupted");
    }

    println!("🛑 Driving instruments to safe state...");
    let report = repl.shutdown().await;
    if report.is_clean() {
        println!("👋 All instruments safe, connections closed");
        Ok(ExitCode::SUCCESS)
    } else {
        for (alias, error) in &report.failures {
            eprintln!("❌ '{alias}' did not reach its safe state: {error}");
        }
        Ok(ExitCode::from(1))
    }
}

fn build_backend(mock: bool) -> Option<Arc<dyn TransportBackend>> {
    if mock {
        return Some(Arc::new(SimulatedBench::demo()));
    }
    let set = BackendSet::new();
    #[cfg(feature = "instrument_serial")]
    let set = set.with(Arc::new(SerialBackend::new()));
    if set.is_empty() {
        None
    } else {
        Some(Arc::new(set))
    }
}

/// Print a dispatch result. Returns `false` when the operator asked to exit.
fn show(result: BenchResult<Reply>) -> bool {
    match result {
        Ok(Reply::Exit) => false,
        Ok(Reply::Empty) => true,
        Ok(Reply::Text(text)) => {
            println!("{text}");
            true
        }
        Err(e) => {
            eprintln!("❌ {}: {e}", e.kind());
            true
        }
    }
}

async fn run_console(repl: &mut Interpreter) -> Result<LoopEnd> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("bench> ");
        std::io::stdout().flush()?;

        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(LoopEnd::Interrupted),
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            println!();
            return Ok(LoopEnd::Finished);
        };

        let result = tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(LoopEnd::Interrupted),
            result = repl.execute(&line) => result,
        };
        if !show(result) {
            return Ok(LoopEnd::Finished);
        }
    }
}

async fn run_script(repl: &mut Interpreter, path: &Path) -> Result<LoopEnd> {
    let script = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading script {}", path.display()))?;
    println!("📜 Running {}", path.display());

    for line in script.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        println!("bench> {line}");
        let result = tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(LoopEnd::Interrupted),
            result = repl.execute(line) => result,
        };
        if let Err(e) = &result {
            warn!(line, error = %e, "Script line failed");
        }
        if !show(result) {
            break;
        }
    }
    Ok(LoopEnd::Finished)
}
