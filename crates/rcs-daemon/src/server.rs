//! Broker core: accepts peers, enforces unique names and routes messages.

use crate::announcer::Announcer;
use crate::config::{BrokerConfig, ConfigError};
use crate::registry::Registry;
use parking_lot::Mutex;
use rcs_core::{Connection, ConnectionState, Handler, Inbound, Message, unknown_peer_error};
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

/// Error text sent to a peer whose name is already registered.
pub const ERROR_DUPLICATE_NAME: &str = "duplicate name";

/// Registry changes, for observers of the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    PeerConnected { name: String, addr: SocketAddr },
    PeerDisconnected { name: String },
}

/// Connection handler shared by every accepted socket.
struct Router {
    registry: Mutex<Registry>,
    /// Accepted connections that have not named themselves yet, by id.
    handshaking: Mutex<HashMap<u64, Connection>>,
    events: broadcast::Sender<BrokerEvent>,
}

impl Router {
    fn track(&self, conn: Connection) {
        let id = conn.id();
        self.handshaking.lock().insert(id, conn.clone());
        // It may have been named or closed before it was tracked.
        if conn.state() != ConnectionState::AwaitingName {
            self.handshaking.lock().remove(&id);
        }
    }

    fn close_all(&self) {
        let unnamed: Vec<Connection> = self.handshaking.lock().drain().map(|(_, c)| c).collect();
        let named: Vec<Connection> = self.registry.lock().connections().cloned().collect();
        debug!(
            "closing {} named and {} unnamed connection(s)",
            named.len(),
            unnamed.len()
        );
        for conn in named.into_iter().chain(unnamed) {
            conn.close();
        }
    }

    fn register(&self, conn: &Connection, name: String) {
        let mut registry = self.registry.lock();
        if registry.contains(&name) {
            drop(registry);
            warn!(
                "rejecting {}: name '{}' is already registered",
                conn.peer_addr(),
                name
            );
            let reply = json!({"error": ERROR_DUPLICATE_NAME, "disconnect": true});
            if let Err(e) = conn.send(Message::server_return(reply)) {
                debug!("{}: could not send rejection: {}", conn.peer_addr(), e);
            }
            return;
        }
        if !conn.mark_named(name.clone()) {
            return;
        }
        self.handshaking.lock().remove(&conn.id());
        registry.insert(&name, conn.clone());
        let count = registry.len();
        drop(registry);

        info!("new peer '{}' from {} ({} connected)", name, conn.peer_addr(), count);
        let _ = self.events.send(BrokerEvent::PeerConnected {
            name,
            addr: conn.peer_addr(),
        });
    }

    fn broadcast(&self, from: String, name: String, payload: serde_json::Value) {
        let targets: Vec<Connection> = self.registry.lock().others(&from).cloned().collect();
        debug!(
            "broadcast '{}' from '{}' to {} peer(s)",
            name,
            from,
            targets.len()
        );
        let msg = Message::Broadcast {
            from: Some(from),
            name,
            payload,
        };
        for target in targets {
            if let Err(e) = target.send(msg.clone()) {
                warn!("failed to forward broadcast to {}: {}", target.label(), e);
            }
        }
    }

    /// Deliver `msg` to `to`, or tell the sender that `to` is unknown.
    fn forward(&self, sender: &Connection, to: &str, msg: Message) {
        let target = self.registry.lock().get(to).cloned();
        match target {
            Some(target) => {
                let kind = msg.kind();
                if let Err(e) = target.send(msg) {
                    warn!("failed to forward {} to '{}': {}", kind, to, e);
                }
            }
            None => {
                warn!(
                    "{}: {} addressed to unknown peer '{}'",
                    sender.label(),
                    msg.kind(),
                    to
                );
                let reply = json!({"error": unknown_peer_error(to)});
                if let Err(e) = sender.send(Message::server_return(reply)) {
                    warn!("{}: could not send routing error: {}", sender.label(), e);
                }
            }
        }
    }
}

impl Handler for Router {
    fn on_message(&self, conn: &Connection, inbound: Inbound) {
        match inbound {
            Inbound::Head { name } => self.register(conn, name),
            Inbound::Broadcast {
                from,
                name,
                payload,
            } => self.broadcast(from, name, payload),
            Inbound::RoutePush {
                from,
                to,
                var,
                value,
            } => self.forward(conn, &to, Message::push(from, var, value)),
            Inbound::RouteGet { from, to, var } => self.forward(conn, &to, Message::get(from, var)),
            Inbound::RouteReturn { from, to, payload } => {
                self.forward(conn, &to, Message::client_return(from, payload))
            }
            other => debug!("{}: ignoring {:?}", conn.label(), other),
        }
    }

    fn on_closed(&self, conn: &Connection) {
        self.handshaking.lock().remove(&conn.id());
        let Some(name) = conn.name() else {
            debug!("unnamed connection from {} closed", conn.peer_addr());
            return;
        };
        let removed = self.registry.lock().remove(&name, conn.id()).is_some();
        if removed {
            info!("peer '{}' disconnected", name);
            let _ = self.events.send(BrokerEvent::PeerDisconnected { name });
        }
    }
}

/// The message broker.
#[derive(Clone)]
pub struct Broker {
    config: Arc<BrokerConfig>,
    listener: Arc<Mutex<Option<TcpListener>>>,
    local_addr: SocketAddr,
    router: Arc<Router>,
    shutdown: Arc<watch::Sender<bool>>,
    running: Arc<AtomicBool>,
}

impl Broker {
    /// Validate `config` and bind the listening socket.
    pub async fn bind(config: BrokerConfig) -> Result<Self, BrokerError> {
        config.validate()?;

        let addr = config.listen_addr();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| BrokerError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;
        let (events, _) = broadcast::channel(256);
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            config: Arc::new(config),
            listener: Arc::new(Mutex::new(Some(listener))),
            local_addr,
            router: Arc::new(Router {
                registry: Mutex::new(Registry::new()),
                handshaking: Mutex::new(HashMap::new()),
                events,
            }),
            shutdown: Arc::new(shutdown),
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Accept peers until [`Broker::shutdown`] is called.
    pub async fn run(&self) -> Result<(), BrokerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(BrokerError::AlreadyRunning);
        }
        let Some(listener) = self.listener.lock().take() else {
            return Err(BrokerError::AlreadyRunning);
        };

        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow_and_update() {
            return Ok(());
        }

        if self.config.announce {
            let announcer = Announcer::broadcast(
                self.config.discovery_port,
                self.config.announce_interval(),
            );
            let stop = self.shutdown.subscribe();
            tokio::spawn(async move {
                if let Err(e) = announcer.run(stop).await {
                    error!("announcer failed: {}", e);
                }
            });
        }

        info!("broker listening on {}", self.local_addr);
        let options = self.config.connection_options();
        let handler: Arc<dyn Handler> = self.router.clone();

        loop {
            tokio::select! {
                result = listener.accept() => match result {
                    Ok((stream, peer_addr)) => {
                        debug!("new connection from {}", peer_addr);
                        match Connection::accept(stream, &options, handler.clone()) {
                            Ok(conn) => self.router.track(conn),
                            Err(e) => warn!("failed to set up connection from {}: {}", peer_addr, e),
                        }
                    }
                    Err(e) => error!("accept error: {}", e),
                },
                _ = shutdown.changed() => {
                    info!("shutdown requested");
                    break;
                }
            }
        }

        self.router.close_all();
        Ok(())
    }

    /// Stop accepting and announcing, then close every connection, named
    /// or still in its handshake.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_names(&self) -> Vec<String> {
        self.router.registry.lock().names()
    }

    pub fn peer_count(&self) -> usize {
        self.router.registry.lock().len()
    }

    /// Close the connection of `name`. The registry entry goes away once the
    /// connection task has shut down.
    pub fn disconnect(&self, name: &str) -> bool {
        let conn = self.router.registry.lock().get(name).cloned();
        match conn {
            Some(conn) => {
                info!("disconnecting peer '{}'", name);
                conn.close();
                true
            }
            None => false,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.router.events.subscribe()
    }
}

/// Broker errors.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("broker already running")]
    AlreadyRunning,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
