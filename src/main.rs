mod cli;
mod error;
mod event;
mod oracle;
mod output;
mod supervisor;
mod syscalls;
mod tracer;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use cli::Cli;
use event::Backend;
use oracle::{OracleClient, OracleConfig};
use output::{JsonlSink, OutputManager, TerminalSink};
use supervisor::Supervisor;
use tracer::Tracer;

fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    if cli.no_color {
        colored::control::set_override(false);
    }

    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("warden: {e:#}");
            std::process::exit(1);
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<i32> {
    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let flag = Arc::clone(&shutdown);
        ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))
            .context("installing the interrupt handler")?;
    }

    let mut output = OutputManager::new();
    output.add_sink(Box::new(TerminalSink::new(cli.verbose)));
    if let Some(path) = &cli.output {
        let sink = JsonlSink::create(path)
            .with_context(|| format!("opening event log {}", path.display()))?;
        output.add_sink(Box::new(sink));
    }

    let oracle = if cli.trace_only {
        None
    } else {
        let config = OracleConfig::from_env();
        Some(OracleClient::connect(&config).context("connecting to the policy oracle")?)
    };

    let timeout = (cli.timeout > 0).then(|| Duration::from_secs(cli.timeout));

    let code = match cli.backend {
        Backend::Ptrace => {
            Tracer::new(cli.command, oracle, output, timeout, shutdown).run()?
        }
        Backend::Notify => {
            Supervisor::new(cli.command, oracle, output, timeout, shutdown).run()?
        }
    };
    Ok(code)
}
