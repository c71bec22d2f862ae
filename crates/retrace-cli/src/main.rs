//! Retrace - distributed trace monitoring
//!
//! Drives the probe and the reconstruction stage from the command line.

use anyhow::Context;
use clap::{Parser, Subcommand};
use retrace_core::config::MonitorConfig;
use retrace_core::event::ExecutionEvent;
use retrace_core::port::AnalysisStage;
use retrace_core::time::{SystemTimeSource, TimeSource};
use retrace_core::trace::{MessageKind, MessageTrace};
use retrace_probe::{ProbeController, SessionRegistry};
use retrace_reconstruct::ReconstructionStage;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "retrace")]
#[command(version)]
#[command(about = "Distributed trace monitoring and reconstruction", long_about = None)]
struct Cli {
    /// Increase verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Path to configuration file
    #[arg(short, long, global = true, env = "RETRACE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a synthetic workload through the probe and reconstruct its traces
    Simulate {
        /// Number of request trees to simulate
        #[arg(short, long, default_value = "10")]
        traces: u64,

        /// Also inject a trace that violates stack discipline
        #[arg(long)]
        broken: bool,

        /// Write reconstructed message traces as JSONL instead of printing
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Validate the configuration and print the effective settings
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.clone());

    // CLI verbose flag takes precedence over the configured level
    let log_level = if cli.verbose > 0 {
        match cli.verbose {
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    } else {
        match config.monitor.log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        }
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Simulate {
            traces,
            broken,
            output,
        } => simulate_command(config, traces, broken, output).await,
        Commands::Check => check_command(&config),
    }
}

/// Load configuration from file, with fallback to defaults
fn load_config(cli_path: Option<PathBuf>) -> MonitorConfig {
    match cli_path {
        Some(path) => match MonitorConfig::load(&path) {
            Ok(config) => {
                info!(path = %path.display(), "configuration loaded");
                config
            }
            Err(err) => {
                warn!(%err, "failed to load configuration, using defaults");
                MonitorConfig::default()
            }
        },
        None => MonitorConfig::default(),
    }
}

async fn simulate_command(
    config: MonitorConfig,
    traces: u64,
    broken: bool,
    output: Option<PathBuf>,
) -> anyhow::Result<()> {
    let mut stage = ReconstructionStage::new(&config.reconstruction);
    let mut message_traces = stage
        .subscribe_message_traces()
        .context("stage already started")?;
    let mut invalid_traces = stage
        .subscribe_invalid_traces()
        .context("stage already started")?;
    let mut incomplete_traces = stage
        .subscribe_incomplete_traces()
        .context("stage already started")?;
    let input = stage.take_input().context("input already taken")?;
    let injector = input.clone();
    stage.start().await?;

    let (probe, mut events) = ProbeController::new(&config.probe, Arc::new(SystemTimeSource));

    // bridge the probe's event stream into the stage input
    let forwarder = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if input.send(event).await.is_err() {
                break;
            }
        }
    });

    let printer = tokio::spawn(async move {
        let mut writer = match output {
            Some(path) => {
                let file = std::fs::File::create(&path)
                    .with_context(|| format!("cannot create {}", path.display()))?;
                info!(path = %path.display(), "writing message traces");
                Some(std::io::BufWriter::new(file))
            }
            None => None,
        };
        while let Some(trace) = message_traces.recv().await {
            match writer.as_mut() {
                Some(w) => {
                    serde_json::to_writer(&mut *w, &trace)?;
                    writeln!(w)?;
                }
                None => print_message_trace(&trace),
            }
        }
        if let Some(mut w) = writer {
            w.flush()?;
        }
        Ok::<(), anyhow::Error>(())
    });
    let invalid_reporter = tokio::spawn(async move {
        while let Some(bad) = invalid_traces.recv().await {
            warn!(
                trace_id = bad.trace.trace_id(),
                reason = ?bad.reason,
                "invalid trace"
            );
        }
    });
    let incomplete_reporter = tokio::spawn(async move {
        while let Some(lost) = incomplete_traces.recv().await {
            warn!(
                trace_id = lost.trace.trace_id(),
                events = lost.trace.len(),
                reason = ?lost.reason,
                "incomplete trace"
            );
        }
    });

    info!(traces, "simulating bookstore workload");
    let workload_probe = Arc::clone(&probe);
    tokio::task::spawn_blocking(move || {
        for _ in 0..traces {
            SessionRegistry::begin_session();
            run_bookstore_request(&workload_probe);
            SessionRegistry::unset_session();
        }
    })
    .await?;

    if broken {
        inject_broken_trace(&injector).await?;
    }
    drop(injector);

    // closing the probe closes the stage input, which drains pending traces
    drop(probe);
    forwarder.await?;
    printer.await??;
    invalid_reporter.await?;
    incomplete_reporter.await?;
    stage.stop(false).await?;

    let snapshot = stage.metrics().snapshot();
    println!();
    println!("  events received   {}", snapshot.events_received);
    println!("  traces valid      {}", snapshot.traces_valid);
    println!("  traces invalid    {}", snapshot.traces_invalid);
    println!("  traces timed out  {}", snapshot.traces_timed_out);
    println!("  traces flushed    {}", snapshot.traces_flushed);
    println!();

    Ok(())
}

/// One monitored request tree: searchBook calling into catalog and crm
fn run_bookstore_request(probe: &Arc<ProbeController>) {
    let Some(root) = probe.enter("bookstore", "searchBook()") else {
        return;
    };
    if let Some(catalog) = probe.enter("catalog", "getBook()") {
        std::thread::sleep(Duration::from_micros(200));
        catalog.exit();
    }
    if let Some(crm) = probe.enter("crm", "getOrders()") {
        if let Some(nested) = probe.enter("catalog", "getBook()") {
            std::thread::sleep(Duration::from_micros(100));
            nested.exit();
        }
        crm.exit();
    }
    root.exit();
}

/// Feed the stage a trace whose second event skips a stack level
async fn inject_broken_trace(
    input: &tokio::sync::mpsc::Sender<ExecutionEvent>,
) -> anyhow::Result<()> {
    let time = SystemTimeSource;
    let now = time.now_nanos();
    let trace_id = i64::MAX - 1;
    let skewed = ExecutionEvent {
        trace_id,
        eoi: 1,
        ess: 3,
        session_id: "broken".to_string(),
        hostname: "sim".to_string(),
        component: "catalog".to_string(),
        operation: "getBook()".to_string(),
        tin: now + 1_000,
        tout: now + 2_000,
        failure: None,
    };
    let root = ExecutionEvent {
        trace_id,
        eoi: 0,
        ess: 0,
        session_id: "broken".to_string(),
        hostname: "sim".to_string(),
        component: "bookstore".to_string(),
        operation: "searchBook()".to_string(),
        tin: now,
        tout: now + 3_000,
        failure: None,
    };
    input.send(skewed).await.context("stage input closed")?;
    input.send(root).await.context("stage input closed")?;
    Ok(())
}

/// Render a message trace as an indented call/reply listing
fn print_message_trace(trace: &MessageTrace) {
    println!("trace {}", trace.trace_id);
    let mut depth = 0usize;
    for message in &trace.messages {
        match message.kind {
            MessageKind::Call => {
                let callee = message
                    .receiver
                    .as_ref()
                    .map(|r| format!("{}.{}", r.component, r.operation))
                    .unwrap_or_else(|| "$".to_string());
                println!("{:indent$}-> {}", "", callee, indent = depth * 2);
                depth += 1;
            }
            MessageKind::Reply => {
                depth = depth.saturating_sub(1);
                let caller = message
                    .receiver
                    .as_ref()
                    .map(|r| format!("{}.{}", r.component, r.operation))
                    .unwrap_or_else(|| "$".to_string());
                println!("{:indent$}<- {}", "", caller, indent = depth * 2);
            }
        }
    }
}

fn check_command(config: &MonitorConfig) -> anyhow::Result<()> {
    config.validate()?;
    let rendered = toml::to_string_pretty(config)?;
    println!("{rendered}");
    Ok(())
}
