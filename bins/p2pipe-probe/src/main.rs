//! p2pipe probe
//!
//! Diagnostic CLI for the p2pipe network layer: learn the public endpoint,
//! find a peer by code phrase, punch through NAT and exchange a greeting.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use p2pipe_net::p2p::MappingBehavior;
use p2pipe_net::{
    Endpoint, HolePuncher, ReliableTransport, RendezvousHash, Resolver, StunClient,
};

mod config;

use config::ProbeConfig;

/// p2pipe probe - NAT traversal diagnostics
#[derive(Parser)]
#[command(name = "p2pipe-probe")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "~/.p2pipe/probe.toml")]
    config: PathBuf,

    /// Log level (overrides the config file)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show this host's public endpoint
    Stun {
        /// Query only this server instead of the configured list
        #[arg(short, long)]
        server: Option<String>,

        /// Also check whether the NAT maps per destination
        #[arg(short, long)]
        mapping: bool,
    },

    /// Connect to a peer sharing a code phrase and exchange a greeting
    Punch {
        /// Code phrase both sides agreed on
        #[arg(short, long)]
        code: String,

        /// Peer's public endpoint (skips local discovery)
        #[arg(long)]
        peer: Option<Endpoint>,

        /// Local UDP port (default: from config)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Show configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = expand_path(&cli.config)?;
    let config = ProbeConfig::load_or_create(&config_path).await?;

    // Initialize logging
    let level = cli.log_level.as_deref().unwrap_or(&config.logging.level);
    let log_level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    config.validate()?;

    match cli.command {
        Commands::Stun { server, mapping } => cmd_stun(config, server, mapping).await,
        Commands::Punch { code, peer, port } => {
            if let Err(e) = cmd_punch(config, code, peer, port).await {
                eprintln!("could not establish connection: {:#}", e);
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::Config => cmd_config(config),
    }
}

async fn cmd_stun(config: ProbeConfig, server: Option<String>, mapping: bool) -> Result<()> {
    let servers = match server {
        Some(server) => vec![server],
        None => config.network.stun.servers.clone(),
    };

    let client = StunClient::new("0.0.0.0:0")
        .await?
        .with_timeout(config.network.stun.timeout);

    let endpoint = client
        .query_first(&servers)
        .await
        .context("STUN discovery failed")?;
    println!("Public endpoint: {}", endpoint);

    if mapping {
        let behavior = client
            .mapping_behavior(&servers)
            .await
            .context("Mapping test needs two reachable STUN servers")?;
        let description = match behavior {
            MappingBehavior::NoNat => "no NAT (public address)",
            MappingBehavior::EndpointIndependent => "endpoint-independent (hole punching should work)",
            MappingBehavior::EndpointDependent => "endpoint-dependent (hole punching will likely fail)",
        };
        println!("Mapping: {}", description);
    }

    Ok(())
}

async fn cmd_punch(
    config: ProbeConfig,
    code: String,
    peer: Option<Endpoint>,
    port: Option<u16>,
) -> Result<()> {
    let network = config.network;
    let session = config.session;

    let port = port.unwrap_or(network.listen_port);
    let mut transport = ReliableTransport::bind(([0, 0, 0, 0], port).into(), network.transport.clone())
        .context("Failed to bind transport socket")?;
    let local_port = transport.local_addr().port();
    info!("Transport listening on port {}", local_port);

    let hash = RendezvousHash::from_code(&code);
    let mut resolver = Resolver::new(network.stun.clone(), network.mdns.clone());

    match resolver.query_public_endpoint_for(&transport).await {
        Ok(endpoint) => println!("Public endpoint: {} (give this to your peer)", endpoint),
        Err(e) => warn!("Public endpoint unknown: {}", e),
    }

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let remote = match peer {
        Some(peer) => peer,
        None => {
            resolver.start_local_discovery(hash, local_port)?;
            println!("Looking for a local peer with the same code...");
            wait_for_local_peer(&mut resolver, &hash, session.discovery_timeout, &cancel).await?
        }
    };
    resolver.stop_local_discovery();

    let puncher = HolePuncher::new(network.hole_punch.clone());
    let result = puncher.punch(&mut transport, remote, &cancel).await?;
    println!(
        "Connected to {} after {} attempts ({:?})",
        result.peer, result.attempts, result.elapsed
    );

    transport
        .send_with_cancel(session.greeting.as_bytes(), &cancel)
        .await
        .context("Failed to send greeting")?;

    let reply = wait_for_message(&mut transport, session.greeting_timeout, &cancel).await?;
    println!("Peer says: {}", String::from_utf8_lossy(&reply));

    transport.close()?;

    let stats = transport.stats();
    println!(
        "Traffic: {} sent, {} received, {} retransmissions{}",
        format_bytes(stats.bytes_sent),
        format_bytes(stats.bytes_received),
        stats.retransmissions,
        stats
            .rtt()
            .map(|rtt| format!(", RTT {:?}", rtt))
            .unwrap_or_default()
    );

    Ok(())
}

async fn wait_for_local_peer(
    resolver: &mut Resolver,
    hash: &RendezvousHash,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<Endpoint> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(endpoint) = resolver.poll_local_peer(hash)? {
            println!("Found local peer at {}", endpoint);
            return Ok(endpoint);
        }
        if Instant::now() >= deadline {
            anyhow::bail!("No local peer announced this code within {:?}", timeout);
        }

        tokio::select! {
            _ = cancel.cancelled() => anyhow::bail!("Interrupted"),
            _ = tokio::time::sleep(Duration::from_millis(250)) => {}
        }
    }
}

async fn wait_for_message(
    transport: &mut ReliableTransport,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<Vec<u8>> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(payload) = transport.recv()? {
            return Ok(payload.to_vec());
        }
        if Instant::now() >= deadline {
            anyhow::bail!("Peer sent nothing within {:?}", timeout);
        }

        tokio::select! {
            _ = cancel.cancelled() => anyhow::bail!("Interrupted"),
            _ = tokio::time::sleep(Duration::from_millis(5)) => {}
        }
    }
}

fn cmd_config(config: ProbeConfig) -> Result<()> {
    let toml = toml::to_string_pretty(&config)?;
    println!("{}", toml);
    Ok(())
}

// Helper functions

fn expand_path(path: &PathBuf) -> Result<PathBuf> {
    let path_str = path.to_string_lossy();
    if let Some(rest) = path_str.strip_prefix("~/") {
        let home = directories::BaseDirs::new()
            .context("Failed to get home directory")?
            .home_dir()
            .to_path_buf();
        Ok(home.join(rest))
    } else {
        Ok(path.clone())
    }
}

fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;

    if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
