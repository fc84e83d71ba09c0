// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! tcp-hb - TCP heartbeat probe
//!
//! # Usage
//!
//! ```bash
//! # Echo server on the default port (8080), dropping every 5th heartbeat
//! tcp-hb server
//!
//! # Client sending a heartbeat every second, 5s timeout
//! tcp-hb client --server localhost --port 8080 --interval 1 --timeout 5
//!
//! # Bounded run with JSON summary
//! tcp-hb client --count 100 --json
//! ```

use clap::{Parser, Subcommand};
use colored::*;
use std::path::PathBuf;
use tcp_hb::{ClientConfig, HeartbeatClient, HeartbeatServer, ServerConfig, StatsSnapshot};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

/// TCP heartbeat probe - liveness and round-trip latency
#[derive(Parser, Debug)]
#[command(name = "tcp-hb")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    mode: Mode,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Send heartbeats and report RTT and loss
    Client {
        /// Server address
        #[arg(short, long, default_value = "localhost")]
        server: String,

        /// Server port
        #[arg(short, long, default_value = "8080")]
        port: u16,

        /// Interval between heartbeats in seconds
        #[arg(short, long, default_value = "1")]
        interval: u64,

        /// Seconds before an unanswered heartbeat counts as lost
        #[arg(short, long, default_value = "5")]
        timeout: u64,

        /// Receiver wait bound in seconds
        #[arg(long, default_value = "5")]
        read_timeout: u64,

        /// Stop after this many heartbeats (default: run until Ctrl+C)
        #[arg(short = 'n', long)]
        count: Option<u64>,

        /// Print the final statistics as JSON
        #[arg(long)]
        json: bool,

        /// Configuration file (JSON format), replaces the flags above
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Echo heartbeats back, dropping some on purpose
    Server {
        /// Listen address
        #[arg(short, long, default_value = "localhost")]
        listen: String,

        /// Listen port
        #[arg(short, long, default_value = "8080")]
        port: u16,

        /// Drop every n-th heartbeat (0 = never)
        #[arg(long, default_value = "5")]
        drop_every: u32,

        /// Configuration file (JSON format), replaces the flags above
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(e) = run(args).await {
        eprintln!("{}: {}", "Error".red().bold(), e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    init_logging(&args.log_level)?;

    // Ctrl+C drains the client / stops the server
    let cancel = CancellationToken::new();
    let signal = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupt received, shutting down...");
                signal.cancel();
            }
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
    });

    match args.mode {
        Mode::Client {
            server,
            port,
            interval,
            timeout,
            read_timeout,
            count,
            json,
            config,
        } => {
            let config = if let Some(path) = config {
                info!("Loading config from {:?}", path);
                ClientConfig::from_file(&path)?
            } else {
                ClientConfig {
                    server_address: server,
                    port,
                    interval_ms: interval.saturating_mul(1_000),
                    timeout_ms: timeout.saturating_mul(1_000),
                    read_timeout_ms: read_timeout.saturating_mul(1_000),
                    max_heartbeats: count,
                }
            };
            run_client(config, json, cancel).await
        }
        Mode::Server {
            listen,
            port,
            drop_every,
            config,
        } => {
            let config = if let Some(path) = config {
                info!("Loading config from {:?}", path);
                ServerConfig::from_file(&path)?
            } else {
                ServerConfig {
                    listen_address: listen,
                    port,
                    drop_every,
                }
            };
            run_server(config, cancel).await
        }
    }
}

async fn run_client(
    config: ClientConfig,
    json: bool,
    cancel: CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        "client mode: {}, interval: {}ms, timeout: {}ms",
        config.server_endpoint(),
        config.interval_ms,
        config.timeout_ms
    );

    let client = HeartbeatClient::new(config)?;
    match client.connect(cancel).await {
        Ok(snapshot) => {
            print_report(&snapshot, json)?;
            Ok(())
        }
        Err(e) => {
            print_report(&client.stats(), json)?;
            Err(e.into())
        }
    }
}

async fn run_server(
    config: ServerConfig,
    cancel: CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        "server mode: {}, drop every: {}",
        config.listen_endpoint(),
        config.drop_every
    );

    let server = HeartbeatServer::bind(config).await?;
    server.run(cancel).await?;

    let stats = server.stats();
    info!(
        connections = stats.connections,
        requests = stats.requests,
        echoed = stats.echoed,
        dropped = stats.dropped,
        "Server stopped"
    );
    Ok(())
}

fn print_report(snapshot: &StatsSnapshot, json: bool) -> Result<(), serde_json::Error> {
    if json {
        println!("{}", serde_json::to_string(snapshot)?);
        return Ok(());
    }

    println!();
    println!("{}", "=== Heartbeat Statistics ===".bold());
    println!("{}", snapshot);
    if snapshot.total_acked > 0 {
        println!(
            "{} min={:.1} avg={:.1} max={:.1} us",
            "RTT:".cyan(),
            snapshot.rtt_min_us,
            snapshot.rtt_mean_us,
            snapshot.rtt_max_us
        );
    }
    Ok(())
}

fn init_logging(log_level: &str) -> Result<(), Box<dyn std::error::Error>> {
    let level = match log_level {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_thread_ids(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}
