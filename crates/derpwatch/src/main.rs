//! derpwatch — runs `derpprobe` and reports per-node relay health.
//!
//! # Usage
//!
//! ```text
//! derpwatch once --pretty
//! derpwatch watch --interval 60 --config /etc/derpwatch.toml
//! ```
//!
//! Results go to stdout as JSON; logs go to stderr.

use std::future::Future;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use derpwatch_core::{ProbeConfig, ProbeCycleResult};
use derpwatch_health::Engine;

#[derive(Parser)]
#[command(
    name = "derpwatch",
    about = "derpwatch — DERP relay health from derpprobe runs",
    version,
    propagate_version = true
)]
struct Cli {
    /// Probe config file (TOML). DERPPROBE_* variables override it.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a single probe cycle and print the result.
    ///
    /// Exits non-zero when the cycle is not ok.
    Once {
        /// Pretty-print the JSON result.
        #[arg(long)]
        pretty: bool,
    },
    /// Run probe cycles back to back, one JSON line per cycle.
    Watch {
        /// Seconds to wait between cycles.
        #[arg(short, long, default_value = "60")]
        interval: u64,
    },
}

fn init_tracing(json: bool) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new("info,derpwatch=debug"))?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

fn render(result: &ProbeCycleResult, pretty: bool) -> anyhow::Result<String> {
    let json = if pretty {
        serde_json::to_string_pretty(result)?
    } else {
        serde_json::to_string(result)?
    };
    Ok(json)
}

/// Run cycles until `shutdown` resolves, which may interrupt a running
/// cycle. Returns the number of completed cycles.
async fn watch(
    engine: &mut Engine,
    interval: Duration,
    shutdown: impl Future,
) -> anyhow::Result<usize> {
    tokio::pin!(shutdown);
    let mut cycles = 0;
    loop {
        let result = tokio::select! {
            result = engine.run_cycle() => result,
            _ = &mut shutdown => break,
        };
        cycles += 1;
        println!("{}", render(&result, false)?);

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = &mut shutdown => break,
        }
    }
    info!(cycles, "shutdown signal received");
    Ok(cycles)
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs)?;

    let config = ProbeConfig::load(cli.config.as_deref()).context("failed to load probe config")?;
    let mut engine = Engine::new(&config);
    info!(
        binary = %engine.command().program,
        args = ?engine.command().args,
        timeout_ms = engine.command().timeout.as_millis() as u64,
        "derpwatch configured"
    );

    match cli.command {
        Command::Once { pretty } => {
            let result = engine.run_cycle().await;
            println!("{}", render(&result, pretty)?);
            Ok(if result.ok {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::Watch { interval } => {
            watch(&mut engine, Duration::from_secs(interval), tokio::signal::ctrl_c()).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
