//! pos-runtime Simulator
//!
//! Drives a simulated receipt printer through the engine and prints every
//! event the sessions receive.

use anyhow::{Context, Result};
use clap::Parser;
use common::setup_logging;
use engine::{DeviceIndex, Driver, Event, EventBridge, EventSink, create_event_bridge};
use simulator::config::SimulatorConfig;
use simulator::printer::{Mechanism, PrinterClass};
use simulator::scenario::run_session;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::task::JoinSet;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "pos-sim")]
#[command(author, version, about = "POS runtime simulator - print receipts on a fake printer")]
#[command(long_about = "
Opens one or more sessions on a simulated receipt printer, prints a few
receipts from each and reports every delivered event.

EXAMPLES:
    # Run with default config
    pos-sim

    # Run with custom config
    pos-sim --config /path/to/simulator.toml

    # Emit events as JSON lines
    pos-sim --json

    # Run with debug logging
    pos-sim --log-level debug

CONFIGURATION:
    The simulator looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/pos-runtime/simulator.toml
    3. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Print events as JSON lines
    #[arg(long)]
    json: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = SimulatorConfig::default();
        let path = SimulatorConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        SimulatorConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        SimulatorConfig::load_or_default()
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.logging.level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("pos-runtime Simulator v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    let mechanism = Mechanism::start(config.printer.output_path())
        .context("Failed to start printer mechanism")?;
    let result = run(&config, mechanism.clone(), args.json).await;

    info!("Shutting down printer...");
    mechanism.shutdown();
    result
}

/// Open the sessions, run their scenarios and report events until done
async fn run(config: &SimulatorConfig, mechanism: Arc<Mechanism>, json: bool) -> Result<()> {
    let driver = Driver::new("pos-sim", Arc::new(PrinterClass), config.engine.clone());
    let (bridge, sink) = create_event_bridge(64);
    let sink: Arc<dyn EventSink> = Arc::new(sink);

    let mut workers = JoinSet::new();
    for n in 1..=config.printer.sessions {
        let session = driver.open_session(DeviceIndex(0), format!("printer{}", n), sink.clone());
        let mechanism = mechanism.clone();
        let settings = config.printer.clone();
        workers.spawn_blocking(move || run_session(session, mechanism, settings));
    }

    let mut failed = 0;
    loop {
        tokio::select! {
            event = bridge.recv_event() => match event {
                Ok(event) => report(&event, json)?,
                Err(e) => {
                    error!("Event bridge closed: {}", e);
                    break;
                }
            },
            done = workers.join_next() => match done {
                Some(Ok(Ok(()))) => {}
                Some(Ok(Err(e))) => {
                    error!("Session failed: {:#}", e);
                    failed += 1;
                }
                Some(Err(e)) => {
                    error!("Session task panicked: {}", e);
                    failed += 1;
                }
                None => break,
            },
            _ = signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
                break;
            }
        }
    }

    drain_remaining(&bridge, json)?;
    info!("{} sessions finished, {} failed", config.printer.sessions, failed);
    Ok(())
}

fn drain_remaining(bridge: &EventBridge, json: bool) -> Result<()> {
    while let Some(event) = bridge.try_recv_event() {
        report(&event, json)?;
    }
    Ok(())
}

fn report(event: &Event, json: bool) -> Result<()> {
    if json {
        let line = serde_json::to_string(event).context("Failed to serialize event")?;
        println!("{}", line);
        return Ok(());
    }

    match event {
        Event::Data(data) => println!("[{}] data status={} {} bytes", data.source, data.status, data.payload.len()),
        Event::Error(err) => println!(
            "[{}] error {} ({:?}) -> {:?}: {}",
            err.source, err.code, err.locus, err.response, err.message
        ),
        Event::Status(status) => println!("[{}] status {}", status.source, status.status),
        Event::OutputComplete(done) => {
            println!("[{}] output {} complete", done.source, done.output_id)
        }
        Event::DirectIo(direct_io) => println!(
            "[{}] direct io command={} data={}",
            direct_io.source,
            direct_io.command,
            direct_io.data()
        ),
        Event::Transition(transition) => println!(
            "[{}] transition data={} {}",
            transition.source,
            transition.data(),
            transition.text()
        ),
    }
    Ok(())
}
