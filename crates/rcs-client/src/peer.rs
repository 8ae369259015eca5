//! Broker-connected peer.
//!
//! A [`Peer`] owns at most one broker [`Connection`]. Incoming requests are
//! answered from the peer's [`Variables`] on the connection task; everything
//! else the application may care about is published as a [`PeerEvent`].

use crate::error::PeerError;
use crate::variables::{self, Variable, Variables};
use parking_lot::{Mutex, RwLock};
use rcs_core::discovery::{self, Advertisement, HostEntry};
use rcs_core::{
    Connection, ConnectionOptions, ConnectionState, DEFAULT_DISCOVERY_PORT, DEFAULT_PORT,
    Handler, Inbound, Message, unknown_peer_name,
};
use serde_json::Value;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpStream, ToSocketAddrs, UdpSocket};
use tokio::sync::{Notify, broadcast, watch};
use tracing::{debug, error, info, warn};

/// Peer configuration.
#[derive(Debug, Clone)]
pub struct PeerOptions {
    /// Broker TCP port used after discovery.
    pub port: u16,
    /// UDP port advertisements arrive on.
    pub discovery_port: u16,
    pub connect_timeout: Duration,
    pub connection: ConnectionOptions,
    /// Events buffered per subscriber before the slowest one lags.
    pub event_capacity: usize,
}

impl Default for PeerOptions {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            discovery_port: DEFAULT_DISCOVERY_PORT,
            connect_timeout: Duration::from_secs(5),
            connection: ConnectionOptions::default(),
            event_capacity: 64,
        }
    }
}

/// Origin of a [`PeerEvent::Return`].
#[derive(Debug, Clone, PartialEq)]
pub enum ReturnKind {
    /// Reply to a GET this peer issued.
    Value { from: String, var: String },
    /// Result or error from the broker.
    Server,
    /// Result or error from another peer.
    Client { from: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    Connected,
    Disconnected,
    Broadcast {
        from: String,
        name: String,
        payload: Value,
    },
    Return { kind: ReturnKind, payload: Value },
}

#[derive(Debug, Clone, PartialEq)]
enum Status {
    Waiting,
    Connected,
    Disconnected,
    Failed(String),
}

struct Inner {
    name: String,
    options: PeerOptions,
    variables: RwLock<Variables>,
    /// Outstanding GETs by (target, var).
    pending: Mutex<HashMap<(String, String), usize>>,
    connection: Mutex<Option<Connection>>,
    status: watch::Sender<Status>,
    events: broadcast::Sender<PeerEvent>,
    shutdown: Notify,
}

impl Inner {
    fn new(name: &str, options: PeerOptions) -> Result<Arc<Self>, PeerError> {
        if name.is_empty() {
            return Err(PeerError::EmptyName);
        }
        let (status, _) = watch::channel(Status::Waiting);
        let (events, _) = broadcast::channel(options.event_capacity.max(1));
        Ok(Arc::new(Self {
            name: name.to_string(),
            options,
            variables: RwLock::new(Variables::default()),
            pending: Mutex::new(HashMap::new()),
            connection: Mutex::new(None),
            status,
            events,
            shutdown: Notify::new(),
        }))
    }

    fn attach(self: &Arc<Self>, stream: TcpStream) -> Result<(), PeerError> {
        let handler: Arc<dyn Handler> = self.clone();
        let conn = Connection::open(stream, &self.name, &self.options.connection, handler)?;
        info!("'{}' connected to broker at {}", self.name, conn.peer_addr());
        *self.connection.lock() = Some(conn);

        let connected = self.status.send_if_modified(|status| {
            if *status == Status::Waiting {
                *status = Status::Connected;
                true
            } else {
                false
            }
        });
        if connected {
            self.emit(PeerEvent::Connected);
        }
        Ok(())
    }

    fn emit(&self, event: PeerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn send(&self, msg: Message) -> bool {
        let conn = self.connection.lock().clone();
        let Some(conn) = conn.filter(|c| c.state() == ConnectionState::Named) else {
            debug!("'{}' not connected, skipping {}", self.name, msg.kind());
            return false;
        };
        match conn.send(msg) {
            Ok(()) => true,
            Err(e) => {
                warn!("'{}': {}", self.name, e);
                false
            }
        }
    }

    fn reply(&self, conn: &Connection, msg: Message) {
        if let Err(e) = conn.send(msg) {
            warn!("'{}': failed to queue reply: {}", self.name, e);
        }
    }

    fn lookup(&self, var: &str) -> Option<Variable> {
        self.variables.read().lookup(var)
    }

    /// Consume one outstanding GET for (from, var), if any.
    fn take_pending(&self, from: &str, var: &str) -> bool {
        let key = (from.to_string(), var.to_string());
        let mut pending = self.pending.lock();
        match pending.get_mut(&key) {
            Some(count) => {
                *count -= 1;
                if *count == 0 {
                    pending.remove(&key);
                }
                true
            }
            None => false,
        }
    }

    /// Forget every outstanding GET addressed to `target`.
    fn drop_pending_to(&self, target: &str) {
        self.pending.lock().retain(|(to, _), _| to != target);
    }

    fn add_pending(&self, target: &str, var: &str) {
        *self
            .pending
            .lock()
            .entry((target.to_string(), var.to_string()))
            .or_insert(0) += 1;
    }
}

impl Handler for Inner {
    fn on_message(&self, conn: &Connection, inbound: Inbound) {
        match inbound {
            Inbound::Broadcast {
                from,
                name,
                payload,
            } => {
                debug!("'{}' received broadcast '{}' from '{}'", self.name, name, from);
                self.emit(PeerEvent::Broadcast {
                    from,
                    name,
                    payload,
                });
            }
            Inbound::Get { from, var } => {
                let reply = variables::reply_to_get(self.lookup(&var), &from, &var);
                self.reply(conn, reply);
            }
            Inbound::Push { from, var, value } => {
                let entry = self.lookup(&var);
                if self.take_pending(&from, &var) {
                    if let Some(setter) = entry.as_ref().and_then(Variable::setter) {
                        setter(from.as_str(), value.clone());
                    }
                    self.emit(PeerEvent::Return {
                        kind: ReturnKind::Value { from, var },
                        payload: value,
                    });
                } else if let Some(reply) = variables::apply_push(entry, &from, &var, value) {
                    self.reply(conn, reply);
                }
            }
            Inbound::ServerReturn { payload } => {
                if let Some(reason) = payload.get("error") {
                    warn!("'{}': broker error: {}", self.name, reason);
                }
                if let Some(target) = payload
                    .get("error")
                    .and_then(Value::as_str)
                    .and_then(unknown_peer_name)
                {
                    self.drop_pending_to(target);
                }
                let disconnect = payload
                    .get("disconnect")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                self.emit(PeerEvent::Return {
                    kind: ReturnKind::Server,
                    payload,
                });
                if disconnect {
                    warn!("'{}': broker asked us to disconnect", self.name);
                    conn.close();
                }
            }
            Inbound::ClientReturn { from, payload } => {
                if let Some(reason) = payload.get("error") {
                    warn!("'{}': error from '{}': {}", self.name, from, reason);
                }
                // The only way a GET fails on the target; no PUSH reply follows.
                let error = payload.get("error").and_then(Value::as_str);
                let var = payload.get("var").and_then(Value::as_str);
                if let (Some(variables::ERROR_NOT_REGISTERED), Some(var)) = (error, var) {
                    self.take_pending(&from, var);
                }
                self.emit(PeerEvent::Return {
                    kind: ReturnKind::Client { from },
                    payload,
                });
            }
            other => debug!("'{}': ignoring {:?}", self.name, other),
        }
    }

    fn on_closed(&self, conn: &Connection) {
        {
            let mut current = self.connection.lock();
            if current.as_ref().is_some_and(|c| c.id() == conn.id()) {
                *current = None;
            }
        }
        self.pending.lock().clear();
        self.status.send_replace(Status::Disconnected);
        warn!("'{}' lost connection to broker", self.name);
        self.emit(PeerEvent::Disconnected);
    }
}

/// A named participant on the bus.
///
/// Cloning is cheap; all clones share one connection. Call [`Peer::close`]
/// to release the connection and stop discovery.
#[derive(Clone)]
pub struct Peer {
    inner: Arc<Inner>,
}

impl Peer {
    /// Connect directly to a broker at `addr`.
    pub async fn connect(
        name: &str,
        addr: impl ToSocketAddrs,
        options: PeerOptions,
    ) -> Result<Self, PeerError> {
        let inner = Inner::new(name, options)?;
        let stream = connect_with_timeout(addr, inner.options.connect_timeout).await?;
        inner.attach(stream)?;
        Ok(Self { inner })
    }

    /// Wait for a broker advertisement on a subnet this host shares, then
    /// connect to it in the background. Use [`Peer::wait_connected`] to block
    /// until that happens.
    ///
    /// Must be called from within a tokio runtime.
    pub fn discover(name: &str, options: PeerOptions) -> Result<Self, PeerError> {
        Self::start_discovery(name, options, None)
    }

    /// Discovery against a fixed set of local interfaces.
    #[cfg(test)]
    pub(crate) fn discover_on(
        name: &str,
        options: PeerOptions,
        local: Vec<HostEntry>,
    ) -> Result<Self, PeerError> {
        Self::start_discovery(name, options, Some(local))
    }

    /// `local: None` lists this host's interfaces on the discovery task.
    fn start_discovery(
        name: &str,
        options: PeerOptions,
        local: Option<Vec<HostEntry>>,
    ) -> Result<Self, PeerError> {
        let inner = Inner::new(name, options)?;
        let port = inner.options.discovery_port;
        let socket = bind_discovery_socket(port)?;
        info!("'{}' waiting for broker advertisements on UDP {}", name, port);
        tokio::spawn(discovery_loop(inner.clone(), socket, local));
        Ok(Self { inner })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.status.borrow() == Status::Connected
    }

    /// Wait until the peer is connected.
    ///
    /// `None` waits indefinitely. Fails if discovery could not connect or the
    /// connection was lost before this call observed it.
    pub async fn wait_connected(&self, timeout: Option<Duration>) -> Result<(), PeerError> {
        let mut status = self.inner.status.subscribe();
        let wait = async move {
            loop {
                let current = status.borrow_and_update().clone();
                match current {
                    Status::Connected => return Ok(()),
                    Status::Failed(reason) => return Err(PeerError::Discovery(reason)),
                    Status::Disconnected => return Err(PeerError::Disconnected),
                    Status::Waiting => {}
                }
                if status.changed().await.is_err() {
                    return Err(PeerError::Disconnected);
                }
            }
        };
        match timeout {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .map_err(|_| PeerError::WaitTimeout(limit))?,
            None => wait.await,
        }
    }

    /// Expose a variable to remote GET/PUSH. Replaces any previous
    /// registration under `name`.
    pub fn register(&self, name: impl Into<String>, variable: Variable) -> Option<Variable> {
        self.inner.variables.write().register(name, variable)
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.inner.variables.write().unregister(name)
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.inner.variables.read().contains(name)
    }

    /// Names of the locally registered variables, sorted.
    pub fn variable_names(&self) -> Vec<String> {
        self.inner.variables.read().names()
    }

    /// Send a broadcast to every other peer. Returns `false` if it was not
    /// queued.
    pub fn broadcast(&self, name: &str, payload: Value) -> bool {
        self.inner.send(Message::broadcast(name, payload))
    }

    /// Ask `target` for the value of `var`. The answer arrives as a
    /// [`PeerEvent::Return`] with [`ReturnKind::Value`], or as a client or
    /// server error return.
    pub fn get(&self, target: &str, var: &str) -> bool {
        self.inner.add_pending(target, var);
        let sent = self.inner.send(Message::get(target, var));
        if !sent {
            self.inner.take_pending(target, var);
        }
        sent
    }

    /// Write `value` to `var` on `target`.
    pub fn push(&self, target: &str, var: &str, value: Value) -> bool {
        self.inner.send(Message::push(target, var, value))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.inner.events.subscribe()
    }

    /// Stop discovery and close the broker connection.
    pub fn close(&self) {
        self.inner.shutdown.notify_one();
        self.inner.status.send_if_modified(|status| {
            if *status == Status::Waiting {
                *status = Status::Disconnected;
                true
            } else {
                false
            }
        });
        let conn = self.inner.connection.lock().clone();
        if let Some(conn) = conn {
            conn.close();
        }
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("name", &self.inner.name)
            .field("status", &*self.inner.status.borrow())
            .finish()
    }
}

async fn connect_with_timeout(
    addr: impl ToSocketAddrs,
    limit: Duration,
) -> Result<TcpStream, PeerError> {
    match tokio::time::timeout(limit, TcpStream::connect(addr)).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(PeerError::ConnectTimeout(limit)),
    }
}

fn bind_discovery_socket(port: u16) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}

async fn discovery_loop(inner: Arc<Inner>, socket: UdpSocket, local: Option<Vec<HostEntry>>) {
    let local = match local {
        Some(local) => local,
        None => tokio::task::spawn_blocking(discovery::local_entries)
            .await
            .unwrap_or_default(),
    };
    if local.is_empty() {
        warn!("no usable local IPv4 interface, advertisements cannot match");
    }

    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let (len, from) = tokio::select! {
            received = socket.recv_from(&mut buf) => match received {
                Ok(received) => received,
                Err(e) => {
                    warn!("discovery receive failed: {}", e);
                    continue;
                }
            },
            _ = inner.shutdown.notified() => {
                debug!("'{}' discovery stopped", inner.name);
                return;
            }
        };

        let advertisement = match Advertisement::from_slice(&buf[..len]) {
            Ok(advertisement) => advertisement,
            Err(e) => {
                warn!("ignoring malformed advertisement from {}: {}", from, e);
                continue;
            }
        };

        let Some(ip) = advertisement.reachable_from(&local).into_iter().next() else {
            debug!("advertisement from {} shares no subnet with this host", from);
            continue;
        };

        let addr = SocketAddr::from((ip, inner.options.port));
        info!("broker advertised at {}, connecting", addr);
        let result = match connect_with_timeout(addr, inner.options.connect_timeout).await {
            Ok(stream) => inner.attach(stream),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            error!("'{}': connecting to {} failed: {}", inner.name, addr, e);
            inner
                .status
                .send_replace(Status::Failed(format!("{addr}: {e}")));
        }
        return;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variables::{ERROR_NOT_REGISTERED, ERROR_READ_ONLY};
    use bytes::BytesMut;
    use rcs_core::{decode_frames, encode_frame};
    use serde_json::json;
    use std::collections::VecDeque;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const WAIT: Duration = Duration::from_secs(5);

    /// Broker end of a single peer connection, driven by hand.
    struct FakeBroker {
        stream: TcpStream,
        buf: BytesMut,
        queued: VecDeque<Message>,
    }

    impl FakeBroker {
        fn new(stream: TcpStream) -> Self {
            Self {
                stream,
                buf: BytesMut::new(),
                queued: VecDeque::new(),
            }
        }

        async fn recv(&mut self) -> Message {
            loop {
                if let Some(msg) = self.queued.pop_front() {
                    return msg;
                }
                let n = tokio::time::timeout(WAIT, self.stream.read_buf(&mut self.buf))
                    .await
                    .unwrap()
                    .unwrap();
                assert!(n > 0, "peer closed the connection");
                self.queued.extend(decode_frames(&mut self.buf));
            }
        }

        async fn send(&mut self, msg: Message) {
            self.stream
                .write_all(&encode_frame(&msg).unwrap())
                .await
                .unwrap();
        }
    }

    async fn connected_peer() -> (Peer, FakeBroker) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (peer, accepted) = tokio::join!(
            Peer::connect("A", addr, PeerOptions::default()),
            listener.accept()
        );
        let mut broker = FakeBroker::new(accepted.unwrap().0);
        assert_eq!(broker.recv().await, Message::head("A"));
        (peer.unwrap(), broker)
    }

    async fn next_event(rx: &mut broadcast::Receiver<PeerEvent>) -> PeerEvent {
        tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap()
    }

    fn free_udp_port() -> u16 {
        std::net::UdpSocket::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    async fn announce(port: u16, advertisement: &Advertisement) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket
            .send_to(&advertisement.to_vec().unwrap(), ("127.0.0.1", port))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn empty_name_rejected() {
        let err = Peer::connect("", "127.0.0.1:1", PeerOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PeerError::EmptyName));
    }

    #[tokio::test]
    async fn connect_sends_head() {
        let (peer, _broker) = connected_peer().await;
        assert!(peer.is_connected());
        assert_eq!(peer.name(), "A");
        peer.wait_connected(Some(WAIT)).await.unwrap();
    }

    #[tokio::test]
    async fn get_answered_by_getter() {
        let (peer, mut broker) = connected_peer().await;
        peer.register("temp", Variable::read_only(|_| json!({"c": 21})));

        broker.send(Message::get("B", "temp")).await;
        assert_eq!(
            broker.recv().await,
            Message::push("B", "temp", json!({"c": 21}))
        );
    }

    #[tokio::test]
    async fn unregistered_variable_stops_answering() {
        let (peer, mut broker) = connected_peer().await;
        peer.register("temp", Variable::read_only(|_| json!(1)));
        peer.register("mode", Variable::read_only(|_| json!("auto")));
        assert_eq!(peer.variable_names(), vec!["mode", "temp"]);

        assert!(peer.unregister("temp"));
        assert!(!peer.is_registered("temp"));
        assert!(peer.is_registered("mode"));

        broker.send(Message::get("B", "temp")).await;
        assert_eq!(
            broker.recv().await,
            Message::client_return("B", json!({"error": ERROR_NOT_REGISTERED, "var": "temp"}))
        );
    }

    #[tokio::test]
    async fn get_of_unregistered_variable() {
        let (_peer, mut broker) = connected_peer().await;

        broker.send(Message::get("B", "nothing")).await;
        assert_eq!(
            broker.recv().await,
            Message::client_return("B", json!({"error": ERROR_NOT_REGISTERED, "var": "nothing"}))
        );
    }

    #[tokio::test]
    async fn push_to_read_only_variable() {
        let (peer, mut broker) = connected_peer().await;
        peer.register("temp", Variable::read_only(|_| json!(0)));

        broker.send(Message::push("B", "temp", json!(5))).await;
        assert_eq!(
            broker.recv().await,
            Message::client_return("B", json!({"error": ERROR_READ_ONLY, "var": "temp"}))
        );
    }

    #[tokio::test]
    async fn push_calls_setter() {
        let (peer, mut broker) = connected_peer().await;
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        peer.register(
            "speed",
            Variable::new().with_setter(move |from, value| {
                let _ = tx.send((from.to_string(), value));
            }),
        );

        broker.send(Message::push("B", "speed", json!(3))).await;
        assert_eq!(rx.recv().await, Some(("B".to_string(), json!(3))));
    }

    #[tokio::test]
    async fn get_reply_is_a_value_return() {
        let (peer, mut broker) = connected_peer().await;
        let mut events = peer.subscribe();

        assert!(peer.get("B", "temp"));
        assert_eq!(broker.recv().await, Message::get("B", "temp"));

        broker.send(Message::push("B", "temp", json!({"c": 21}))).await;
        assert_eq!(
            next_event(&mut events).await,
            PeerEvent::Return {
                kind: ReturnKind::Value {
                    from: "B".into(),
                    var: "temp".into(),
                },
                payload: json!({"c": 21}),
            }
        );

        // The reply must not have produced an error; the next frame the
        // broker sees answers this probe.
        broker.send(Message::get("B", "probe")).await;
        assert_eq!(
            broker.recv().await,
            Message::client_return("B", json!({"error": ERROR_NOT_REGISTERED, "var": "probe"}))
        );
    }

    #[tokio::test]
    async fn failed_get_leaves_later_push_alone() {
        let (peer, mut broker) = connected_peer().await;

        assert!(peer.get("B", "temp"));
        assert_eq!(broker.recv().await, Message::get("B", "temp"));
        broker
            .send(Message::client_return(
                "B",
                json!({"error": ERROR_NOT_REGISTERED, "var": "temp"}),
            ))
            .await;

        peer.register("temp", Variable::read_only(|_| json!(0)));
        broker.send(Message::push("B", "temp", json!(5))).await;
        assert_eq!(
            broker.recv().await,
            Message::client_return("B", json!({"error": ERROR_READ_ONLY, "var": "temp"}))
        );
    }

    #[tokio::test]
    async fn get_to_unknown_peer_is_forgotten() {
        let (peer, mut broker) = connected_peer().await;

        assert!(peer.get("B", "temp"));
        assert!(peer.get("C", "temp"));
        assert_eq!(broker.recv().await, Message::get("B", "temp"));
        assert_eq!(broker.recv().await, Message::get("C", "temp"));
        broker
            .send(Message::server_return(
                json!({"error": rcs_core::unknown_peer_error("B")}),
            ))
            .await;

        peer.register("temp", Variable::read_only(|_| json!(0)));
        broker.send(Message::push("B", "temp", json!(5))).await;
        assert_eq!(
            broker.recv().await,
            Message::client_return("B", json!({"error": ERROR_READ_ONLY, "var": "temp"}))
        );

        // The GET to C is still outstanding.
        let mut events = peer.subscribe();
        broker.send(Message::push("C", "temp", json!(7))).await;
        assert_eq!(
            next_event(&mut events).await,
            PeerEvent::Return {
                kind: ReturnKind::Value {
                    from: "C".into(),
                    var: "temp".into(),
                },
                payload: json!(7),
            }
        );
    }

    #[tokio::test]
    async fn broadcast_and_returns_surface_as_events() {
        let (peer, mut broker) = connected_peer().await;
        let mut events = peer.subscribe();

        broker
            .send(Message::Broadcast {
                from: Some("B".into()),
                name: "pose".into(),
                payload: json!([1, 2]),
            })
            .await;
        broker
            .send(Message::client_return("B", json!({"ok": true})))
            .await;
        broker
            .send(Message::server_return(json!({"error": "not find client 'C'"})))
            .await;

        assert_eq!(
            next_event(&mut events).await,
            PeerEvent::Broadcast {
                from: "B".into(),
                name: "pose".into(),
                payload: json!([1, 2]),
            }
        );
        assert_eq!(
            next_event(&mut events).await,
            PeerEvent::Return {
                kind: ReturnKind::Client { from: "B".into() },
                payload: json!({"ok": true}),
            }
        );
        assert_eq!(
            next_event(&mut events).await,
            PeerEvent::Return {
                kind: ReturnKind::Server,
                payload: json!({"error": "not find client 'C'"}),
            }
        );
        assert!(peer.is_connected());
    }

    #[tokio::test]
    async fn disconnect_instruction_closes() {
        let (peer, mut broker) = connected_peer().await;
        let mut events = peer.subscribe();
        let payload = json!({"error": "duplicate name", "disconnect": true});

        broker.send(Message::server_return(payload.clone())).await;
        assert_eq!(
            next_event(&mut events).await,
            PeerEvent::Return {
                kind: ReturnKind::Server,
                payload,
            }
        );
        assert_eq!(next_event(&mut events).await, PeerEvent::Disconnected);
        assert!(!peer.is_connected());
        assert!(!peer.broadcast("n", json!(1)));
        assert!(!peer.get("B", "temp"));
        assert!(matches!(
            peer.wait_connected(Some(WAIT)).await,
            Err(PeerError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn discovery_connects_on_shared_subnet() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let discovery_port = free_udp_port();
        let options = PeerOptions {
            port: listener.local_addr().unwrap().port(),
            discovery_port,
            ..Default::default()
        };
        let local = vec![HostEntry::with_prefix(Ipv4Addr::LOCALHOST, 8)];
        let peer = Peer::discover_on("A", options, local).unwrap();
        assert!(!peer.is_connected());

        let advertisement = Advertisement::new(vec![
            HostEntry::with_prefix(Ipv4Addr::new(10, 0, 1, 9), 24),
            HostEntry::with_prefix(Ipv4Addr::LOCALHOST, 8),
        ]);
        announce(discovery_port, &advertisement).await;

        let (stream, _) = tokio::time::timeout(WAIT, listener.accept())
            .await
            .unwrap()
            .unwrap();
        peer.wait_connected(Some(WAIT)).await.unwrap();
        let mut broker = FakeBroker::new(stream);
        assert_eq!(broker.recv().await, Message::head("A"));
        peer.close();
    }

    #[tokio::test]
    async fn discover_then_close() {
        let options = PeerOptions {
            discovery_port: free_udp_port(),
            ..Default::default()
        };
        // Interfaces are listed on the discovery task, not here.
        let peer = Peer::discover("A", options).unwrap();
        assert!(!peer.is_connected());

        peer.close();
        assert!(matches!(
            peer.wait_connected(Some(WAIT)).await,
            Err(PeerError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn discovery_ignores_other_subnets() {
        let discovery_port = free_udp_port();
        let options = PeerOptions {
            discovery_port,
            ..Default::default()
        };
        let local = vec![HostEntry::with_prefix(Ipv4Addr::new(10, 0, 0, 5), 24)];
        let peer = Peer::discover_on("A", options, local).unwrap();

        let advertisement =
            Advertisement::new(vec![HostEntry::with_prefix(Ipv4Addr::new(10, 0, 1, 9), 24)]);
        announce(discovery_port, &advertisement).await;

        let limit = Duration::from_millis(300);
        assert!(matches!(
            peer.wait_connected(Some(limit)).await,
            Err(PeerError::WaitTimeout(_))
        ));
        peer.close();
    }

    #[tokio::test]
    async fn discovery_connect_failure_is_fatal() {
        let closed_port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let discovery_port = free_udp_port();
        let options = PeerOptions {
            port: closed_port,
            discovery_port,
            ..Default::default()
        };
        let local = vec![HostEntry::with_prefix(Ipv4Addr::LOCALHOST, 8)];
        let peer = Peer::discover_on("A", options, local).unwrap();

        let advertisement = Advertisement::new(vec![HostEntry::with_prefix(Ipv4Addr::LOCALHOST, 8)]);
        announce(discovery_port, &advertisement).await;

        assert!(matches!(
            peer.wait_connected(Some(WAIT)).await,
            Err(PeerError::Discovery(_))
        ));
    }
}
