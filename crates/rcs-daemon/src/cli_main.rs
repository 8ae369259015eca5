//! Command-line peer for an RCS broker.
//!
//! ```bash
//! rcs --host 10.0.0.2 get arm temp
//! rcs push arm speed '{"mps": 0.5}'
//! rcs broadcast estop true
//! rcs --name monitor listen
//! ```
//!
//! Without `--host` the broker is found through its UDP announcements.

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use rcs_client::{Peer, PeerEvent, PeerOptions, ReturnKind};
use rcs_core::{DEFAULT_DISCOVERY_PORT, DEFAULT_PORT};
use serde_json::{Value, json};
use std::time::Duration;
use tokio::sync::broadcast::{Receiver, error::RecvError};
use tracing_subscriber::EnvFilter;

/// Talk to peers on a Robot Communication System broker
#[derive(Parser, Debug)]
#[command(name = "rcs")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Name to register with the broker
    #[arg(short, long, env = "RCS_NAME", default_value = "rcs-cli")]
    name: String,

    /// Broker host; omit to wait for a UDP announcement
    #[arg(long, env = "RCS_HOST")]
    host: Option<String>,

    /// Broker TCP port
    #[arg(short, long, env = "RCS_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// UDP port announcements arrive on
    #[arg(long, default_value_t = DEFAULT_DISCOVERY_PORT)]
    discovery_port: u16,

    /// Seconds to wait for the broker and for replies
    #[arg(short, long, default_value = "5")]
    timeout: u64,

    /// Log level or filter directive (overridden by RUST_LOG)
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Read a variable from another peer
    Get { target: String, var: String },
    /// Write a JSON value to another peer's variable
    Push {
        target: String,
        var: String,
        value: String,
    },
    /// Send a JSON payload to every other peer
    Broadcast { name: String, payload: String },
    /// Print broadcasts and returns as JSON lines until interrupted
    Listen,
}

/// How long to stay connected after a fire-and-forget send, so the frame
/// is flushed and an error return can still arrive.
const GRACE: Duration = Duration::from_millis(300);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .with_context(|| format!("invalid log level '{}'", cli.log_level))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let timeout = Duration::from_secs(cli.timeout);
    let peer = connect(&cli, timeout).await?;
    let mut events = peer.subscribe();

    let result = match cli.command {
        Command::Get { target, var } => {
            if !peer.get(&target, &var) {
                bail!("not connected");
            }
            let value = wait_value(&mut events, &target, &var, timeout).await?;
            println!("{value}");
            Ok(())
        }
        Command::Push { target, var, value } => {
            let value = parse_json(&value);
            if !peer.push(&target, &var, value) {
                bail!("not connected");
            }
            expect_no_error(&mut events, Some(&target)).await
        }
        Command::Broadcast { name, payload } => {
            let payload = parse_json(&payload);
            if !peer.broadcast(&name, payload) {
                bail!("not connected");
            }
            expect_no_error(&mut events, None).await
        }
        Command::Listen => listen(&mut events).await,
    };

    peer.close();
    result
}

async fn connect(cli: &Cli, timeout: Duration) -> anyhow::Result<Peer> {
    let options = PeerOptions {
        port: cli.port,
        discovery_port: cli.discovery_port,
        connect_timeout: timeout,
        ..Default::default()
    };
    let peer = match &cli.host {
        Some(host) => Peer::connect(&cli.name, format!("{host}:{}", cli.port), options)
            .await
            .with_context(|| format!("cannot connect to {host}:{}", cli.port))?,
        None => {
            let peer = Peer::discover(&cli.name, options)?;
            peer.wait_connected(Some(timeout))
                .await
                .context("no broker found")?;
            peer
        }
    };
    Ok(peer)
}

/// Values that are not JSON are sent as strings.
fn parse_json(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

async fn next_event(events: &mut Receiver<PeerEvent>) -> anyhow::Result<PeerEvent> {
    loop {
        match events.recv().await {
            Ok(event) => return Ok(event),
            Err(RecvError::Lagged(n)) => tracing::warn!("missed {} events", n),
            Err(RecvError::Closed) => bail!("peer closed"),
        }
    }
}

fn error_text(payload: &Value) -> String {
    match payload.get("error") {
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
        None => payload.to_string(),
    }
}

async fn wait_value(
    events: &mut Receiver<PeerEvent>,
    target: &str,
    var: &str,
    timeout: Duration,
) -> anyhow::Result<Value> {
    tokio::time::timeout(timeout, value_reply(events, target, var))
        .await
        .with_context(|| format!("no reply from '{target}' within {timeout:?}"))?
}

async fn value_reply(
    events: &mut Receiver<PeerEvent>,
    target: &str,
    var: &str,
) -> anyhow::Result<Value> {
    loop {
        match next_event(events).await? {
            PeerEvent::Return {
                kind: ReturnKind::Value { from, var: got },
                payload,
            } if from == target && got == var => return Ok(payload),
            PeerEvent::Return {
                kind: ReturnKind::Client { from },
                payload,
            } if from == target => bail!("{}: {}", target, error_text(&payload)),
            PeerEvent::Return {
                kind: ReturnKind::Server,
                payload,
            } => bail!("broker: {}", error_text(&payload)),
            PeerEvent::Disconnected => bail!("disconnected from broker"),
            _ => {}
        }
    }
}

/// Succeeds if no error return arrives within [`GRACE`].
async fn expect_no_error(
    events: &mut Receiver<PeerEvent>,
    target: Option<&str>,
) -> anyhow::Result<()> {
    match tokio::time::timeout(GRACE, first_error(events, target)).await {
        Ok(result) => result,
        Err(_) => Ok(()),
    }
}

async fn first_error(events: &mut Receiver<PeerEvent>, target: Option<&str>) -> anyhow::Result<()> {
    loop {
        match next_event(events).await? {
            PeerEvent::Return {
                kind: ReturnKind::Client { from },
                payload,
            } if Some(from.as_str()) == target => bail!("{}: {}", from, error_text(&payload)),
            PeerEvent::Return {
                kind: ReturnKind::Server,
                payload,
            } => bail!("broker: {}", error_text(&payload)),
            PeerEvent::Disconnected => bail!("disconnected from broker"),
            _ => {}
        }
    }
}

async fn listen(events: &mut Receiver<PeerEvent>) -> anyhow::Result<()> {
    loop {
        let event = tokio::select! {
            event = next_event(events) => event?,
            _ = tokio::signal::ctrl_c() => return Ok(()),
        };
        let line = match event {
            PeerEvent::Broadcast {
                from,
                name,
                payload,
            } => json!({"event": "broadcast", "from": from, "name": name, "payload": payload}),
            PeerEvent::Return { kind, payload } => {
                let (origin, from) = match kind {
                    ReturnKind::Value { from, .. } => ("value", Some(from)),
                    ReturnKind::Server => ("server", None),
                    ReturnKind::Client { from } => ("client", Some(from)),
                };
                json!({"event": "return", "kind": origin, "from": from, "payload": payload})
            }
            PeerEvent::Disconnected => bail!("disconnected from broker"),
            PeerEvent::Connected => continue,
        };
        println!("{line}");
    }
}
