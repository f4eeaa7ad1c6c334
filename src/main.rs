// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! GNSS Logger CLI
//!
//! Read NMEA sentences from a serial GNSS receiver and persist position
//! fixes to PostgreSQL, buffering locally while the uplink is down.
//!
//! # Usage
//!
//! ```bash
//! # Run the logger (credentials via environment)
//! export DB_HOST=db.example.net DB_NAME=gnss DB_USER=gnss DB_PASSWORD=secret
//! gnss-logger --serial-port /dev/serial0 --baud-rate 9600
//!
//! # Simulated receiver, no hardware needed
//! gnss-logger --fake
//!
//! # One-shot connectivity diagnostic
//! gnss-logger check
//!
//! # Drain the local buffer and exit
//! gnss-logger flush
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gnss_logger::{
    Config, Connectivity, DurableBuffer, FakeLineSource, IngestLoop, LineSource, SerialLineSource,
    StopHandle,
};
use std::path::PathBuf;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "gnss-logger")]
#[command(author = "naskel.com")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Field GNSS data logger - NMEA ingest with offline-durable PostgreSQL storage")]
#[command(long_about = None)]
struct Cli {
    /// Serial device the GNSS receiver is attached to
    #[arg(long, env = "SERIAL_PORT", default_value = "/dev/serial0")]
    serial_port: String,

    /// Serial baud rate
    #[arg(long, env = "BAUD_RATE", default_value = "9600")]
    baud_rate: u32,

    /// Database host
    #[arg(long, env = "DB_HOST")]
    db_host: String,

    /// Database port
    #[arg(long, env = "DB_PORT", default_value = "5432")]
    db_port: u16,

    /// Database name
    #[arg(long, env = "DB_NAME")]
    db_name: String,

    /// Database user
    #[arg(long, env = "DB_USER")]
    db_user: String,

    /// Database password
    #[arg(long, env = "DB_PASSWORD", hide_env_values = true)]
    db_password: String,

    /// Local durable buffer file
    #[arg(long, env = "BUFFER_FILE", default_value = "buffer.csv")]
    buffer_file: PathBuf,

    /// Reachability probe host (defaults to the database host)
    #[arg(long, env = "PROBE_HOST")]
    probe_host: Option<String>,

    /// Reachability probe port (defaults to the database port)
    #[arg(long, env = "PROBE_PORT")]
    probe_port: Option<u16>,

    /// Probe timeout in seconds (0 disables the probe)
    #[arg(long, env = "PROBE_TIMEOUT", default_value = "3")]
    probe_timeout: u64,

    /// Seconds between buffer flush attempts
    #[arg(long, env = "FLUSH_INTERVAL", default_value = "30")]
    flush_interval: u64,

    /// Use a simulated receiver instead of serial hardware
    #[arg(long)]
    fake: bool,

    /// Verbose mode (show internal logs)
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Probe connectivity, open a session and report the server version
    Check,
    /// Drain the local buffer into the database once and exit
    Flush,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup tracing for internal logs
    let filter = if cli.verbose {
        EnvFilter::new("gnss_logger=debug")
    } else {
        EnvFilter::new("gnss_logger=info")
    };

    fmt().with_env_filter(filter).with_target(false).init();

    let config = build_config(&cli);

    match cli.command {
        Some(Command::Check) => run_check(config),
        Some(Command::Flush) => run_flush(config),
        None => run_logger(config, cli.fake),
    }
}

fn build_config(cli: &Cli) -> Config {
    let mut builder = Config::builder()
        .device(&cli.serial_port)
        .baud(cli.baud_rate)
        .db_host(&cli.db_host)
        .db_port(cli.db_port)
        .db_name(&cli.db_name)
        .db_user(&cli.db_user)
        .db_password(&cli.db_password)
        .buffer_file(&cli.buffer_file)
        .probe_timeout_secs(cli.probe_timeout)
        .flush_interval_secs(cli.flush_interval);

    if let Some(ref host) = cli.probe_host {
        builder = builder.probe_host(host);
    }
    if let Some(port) = cli.probe_port {
        builder = builder.probe_port(port);
    }

    builder.build()
}

fn run_logger(config: Config, fake: bool) -> Result<()> {
    tracing::info!(
        device = %config.device,
        baud = config.baud,
        db_host = %config.db_host,
        buffer = %config.buffer_file.display(),
        "Starting GNSS logger"
    );

    let mut source: Box<dyn LineSource> = if fake {
        tracing::info!("using simulated GNSS receiver");
        Box::new(FakeLineSource::new())
    } else {
        Box::new(SerialLineSource::open(&config.device, config.baud)?)
    };

    let buffer = DurableBuffer::new(&config.buffer_file);
    let connectivity = Connectivity::new(config.clone())?;
    let mut ingest = IngestLoop::new(config, buffer, connectivity);

    // Setup Ctrl+C handler
    ctrlc_handler(ingest.stop_handle());

    ingest.run(source.as_mut()).context("GNSS logger error")?;

    let stats = ingest.stats();
    tracing::info!(
        fixes = stats.fixes_parsed,
        live_inserts = stats.live_inserts,
        buffered = stats.buffered,
        replayed = stats.replayed,
        "Logger shutdown complete"
    );

    Ok(())
}

fn run_check(config: Config) -> Result<()> {
    let buffer = DurableBuffer::new(&config.buffer_file);
    let pending = buffer.pending().context("failed to read local buffer")?;
    println!("Buffer:   {} pending record(s) in {}", pending, config.buffer_file.display());

    let connectivity = Connectivity::new(config.clone())?;
    let mut session = connectivity
        .open_session()
        .context("database unreachable")?;
    let version = session.server_version()?;
    session.close();

    println!("Database: {}:{}/{} reachable", config.db_host, config.db_port, config.db_name);
    println!("Server:   {version}");
    Ok(())
}

fn run_flush(config: Config) -> Result<()> {
    let buffer = DurableBuffer::new(&config.buffer_file);
    let pending = buffer.pending().context("failed to read local buffer")?;
    if pending == 0 {
        println!("Buffer is empty, nothing to flush");
        return Ok(());
    }

    let connectivity = Connectivity::new(config)?;
    let mut session = connectivity
        .open_session()
        .context("database unreachable")?;
    let stats = buffer.replay(&mut session).context("buffer flush failed")?;
    session.close();

    println!(
        "Flushed {} record(s), {} duplicate(s) dropped, {} remaining",
        stats.accepted, stats.duplicates, stats.remaining
    );
    Ok(())
}

fn ctrlc_handler(stop_handle: StopHandle) {
    if let Err(e) = ctrlc::set_handler(move || {
        tracing::info!("Received interrupt, shutting down...");
        stop_handle.stop();
    }) {
        tracing::warn!("Failed to set Ctrl+C handler: {e}");
    }
}
