//! `alertscript` CLI: try a script against a simulated alert event.
//!
//! Usage:
//!   alertscript [-n] [-e TYPE] <script.js|->
//!   alertscript --data event.json --data-name event <script.js>
//!
//! Runs with typical production settings (soft timeout 1s, two outbound
//! requests); production hosts may vary.

use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use alertscript_runner::bindings::resolve_env;
use alertscript_runner::{CapRegistry, Logger, RunConfig, Sandbox, TracingLogger};
use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use serde_json::Value;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const ALIASES: &[(&str, &str)] = &[
    ("web", "std/web"),
    ("hex", "std/encoding/hex"),
    ("base64", "std/encoding/base64"),
    ("hash", "std/crypto/hash"),
    ("hmac", "std/crypto/hmac"),
];

#[derive(Parser)]
#[command(name = "alertscript", version, about = "Run an alertscript against a simulated event")]
struct Cli {
    /// Script file (or - for stdin)
    script: String,
    /// Dry run: do not perform network requests
    #[arg(short = 'n', long = "dry-run")]
    dry_run: bool,
    /// Type of the simulated event
    #[arg(short = 'e', long = "event-type", default_value = "yes")]
    event_type: String,
    /// JSON file to bind instead of the simulated event (`env:VAR` strings are resolved)
    #[arg(long)]
    data: Option<PathBuf>,
    /// Global name the data is bound to
    #[arg(long, default_value = "event")]
    data_name: String,
    /// Soft timeout: active script time, I/O wait excluded
    #[arg(long, default_value_t = 1000)]
    timeout_ms: u64,
    /// Hard timeout: wall-clock ceiling (0 = default)
    #[arg(long, default_value_t = 0)]
    hard_timeout_ms: u64,
    /// Per-request network timeout (0 = default)
    #[arg(long, default_value_t = 0)]
    net_timeout_ms: u64,
    /// Maximum number of outbound network requests
    #[arg(long, default_value_t = 2)]
    net_max: u32,
    /// Correlation string attached to outbound requests
    #[arg(long)]
    trace: Option<String>,
    /// Print capability diagnostics
    #[arg(short, long)]
    verbose: bool,
    /// Send script output to the log stream (stderr) instead of stdout
    #[arg(long)]
    log_tracing: bool,
}

/// The event a production host would bind.
#[derive(Serialize)]
struct SimulatedEvent<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    ehls1: &'a str,
    request_ip: &'a str,
    click_ip: &'a str,
    device: &'a str,
    id: &'a str,
    refid: &'a str,
    auth: &'a str,
    testmode: bool,
    country: &'a str,
}

impl<'a> SimulatedEvent<'a> {
    fn new(kind: &'a str) -> Self {
        Self {
            kind,
            ehls1: "b84c4c03b2af4050ac2d3b105e58adf83fa5af05",
            request_ip: "192.0.2.123",
            click_ip: "2001:db8:0:0:0:0:0:7b",
            device: "",
            id: "aGVsbG8gd29ybGQK",
            refid: "f6b9743c-32a1-4d00-81bb-b8a62b947552",
            auth: "SSBsb3ZlIGJhc2U2NCBlbmNvZGVkIGF1dGggdG9rZW5z",
            testmode: true,
            country: "US",
        }
    }
}

/// Prints script output to stdout.
struct ConsoleLogger {
    verbose: bool,
}

impl Logger for ConsoleLogger {
    fn verbose(&self, msg: &str) {
        println!("{msg}");
    }

    fn debug(&self, msg: &str) {
        if self.verbose {
            println!("[diag]> {msg}");
        }
    }

    fn error(&self, msg: &str) {
        println!("[error]> {msg}");
    }
}

fn registry() -> Result<CapRegistry> {
    let mut reg = CapRegistry::new();
    alertscript_std::register(&mut reg)?;
    cap_s3::register(&mut reg)?;
    cap_slack::register(&mut reg)?;
    cap_twilio::register(&mut reg)?;
    cap_sendgrid::register(&mut reg)?;
    cap_mailchimp::register(&mut reg)?;
    Ok(reg)
}

fn read_script(path: &str) -> Result<String> {
    if path == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("cannot read script from stdin")?;
        return Ok(buf);
    }
    std::fs::read_to_string(path).with_context(|| format!("cannot open file '{path}'"))
}

fn event_data(cli: &Cli) -> Result<Value> {
    match &cli.data {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("cannot open file '{}'", path.display()))?;
            let data: Value = serde_json::from_str(&raw)
                .with_context(|| format!("invalid JSON in '{}'", path.display()))?;
            resolve_env(&data)
        }
        None => Ok(serde_json::to_value(SimulatedEvent::new(&cli.event_type))?),
    }
}

fn script_logger(cli: &Cli) -> Arc<dyn Logger> {
    if cli.log_tracing {
        return Arc::new(TracingLogger::tagged(cli.script.clone()));
    }
    Arc::new(ConsoleLogger {
        verbose: cli.verbose,
    })
}

fn build_config(cli: &Cli) -> Result<RunConfig> {
    let script = read_script(&cli.script)?;
    let data = event_data(cli)?;

    let mut cf = RunConfig::new(script)
        .with_data(cli.data_name.clone(), data)
        .with_timeout(Duration::from_millis(cli.timeout_ms))
        .with_hard_timeout(Duration::from_millis(cli.hard_timeout_ms))
        .with_net_timeout(Duration::from_millis(cli.net_timeout_ms))
        .with_net_max(cli.net_max)
        .with_dry_run(cli.dry_run)
        .with_logger(script_logger(cli))
        .without_aliases();
    for (global, module) in ALIASES {
        cf = cf.with_alias(*global, *module);
    }
    if let Some(trace) = &cli.trace {
        cf = cf.with_trace(trace.clone());
    }
    Ok(cf)
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = match (cli.log_tracing, cli.verbose) {
        (true, true) => "alertscript=warn,alertscript::script=debug",
        (true, false) => "alertscript=warn,alertscript::script=info",
        _ => "alertscript=warn",
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cf = match build_config(&cli) {
        Ok(cf) => cf,
        Err(e) => {
            println!("ERROR: {e:#}");
            return ExitCode::FAILURE;
        }
    };
    let sandbox = match registry() {
        Ok(reg) => Sandbox::new(Arc::new(reg)),
        Err(e) => {
            println!("ERROR: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    let report = sandbox.run(cf);
    tracing::debug!(run_id = %report.run_id, stats = ?report.stats, "alertscript.done");
    let value = match report.result {
        Ok(value) => value,
        Err(e) => {
            println!("ERROR: {e}");
            return ExitCode::FAILURE;
        }
    };
    match serde_json::to_string_pretty(&value) {
        Ok(out) => {
            println!("{out}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            println!("ERROR: {e}");
            ExitCode::FAILURE
        }
    }
}
