//! RCS broker daemon.
//!
//! ```bash
//! # Listen on the default port and announce over UDP
//! rcs-server
//!
//! # Custom port, no discovery, log to a file
//! rcs-server --port 9000 --no-udp --log /var/log/rcs.log
//!
//! # Load settings from TOML; flags still override them
//! rcs-server --config broker.toml --log-level debug
//! ```

use anyhow::Context;
use clap::Parser;
use rcs_daemon::{Broker, BrokerConfig};
use std::fs::OpenOptions;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Robot Communication System message broker
#[derive(Parser, Debug)]
#[command(name = "rcs-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TCP port to listen on [default: 8850]
    #[arg(short, long, env = "RCS_PORT")]
    port: Option<u16>,

    /// Bind address [default: 0.0.0.0]
    #[arg(short, long, env = "RCS_BIND")]
    bind: Option<IpAddr>,

    /// Configuration file (TOML)
    #[arg(short, long, env = "RCS_CONFIG")]
    config: Option<PathBuf>,

    /// Do not announce the broker over UDP
    #[arg(long)]
    no_udp: bool,

    /// UDP port for announcements [default: 8849]
    #[arg(long)]
    discovery_port: Option<u16>,

    /// Append logs to this file instead of stderr
    #[arg(short, long)]
    log: Option<PathBuf>,

    /// Log level or filter directive (overridden by RUST_LOG)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level, args.log.as_deref())?;

    let config = load_config(&args)?;
    let broker = Broker::bind(config.clone())
        .await
        .context("failed to start broker")?;

    info!("+----------------------------------------------------+");
    info!("|       RCS broker v{:33} |", env!("CARGO_PKG_VERSION"));
    info!("+----------------------------------------------------+");
    info!("|  Listen:   {:39} |", broker.local_addr());
    info!(
        "|  Discover: {:39} |",
        if config.announce {
            format!("UDP {}", config.discovery_port)
        } else {
            "disabled".to_string()
        }
    );
    info!("+----------------------------------------------------+");

    let handle = broker.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown signal received, stopping broker...");
        handle.shutdown();
    });

    broker.run().await?;

    info!("broker stopped");
    Ok(())
}

fn init_logging(level: &str, file: Option<&Path>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .with_context(|| format!("invalid log level '{level}'"))?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("cannot open log file {}", path.display()))?;
            builder.with_ansi(false).with_writer(Mutex::new(file)).init();
        }
        None => builder.init(),
    }
    Ok(())
}

fn load_config(args: &Args) -> anyhow::Result<BrokerConfig> {
    let mut config = match &args.config {
        Some(path) => {
            info!("loading config from {}", path.display());
            BrokerConfig::from_file(path)
                .with_context(|| format!("cannot load config {}", path.display()))?
        }
        None => BrokerConfig::default(),
    };

    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(bind) = args.bind {
        config.bind_address = bind;
    }
    if let Some(port) = args.discovery_port {
        config.discovery_port = port;
    }
    if args.no_udp {
        config.announce = false;
    }
    Ok(config)
}
