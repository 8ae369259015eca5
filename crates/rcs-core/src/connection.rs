//! Connection actor.
//!
//! Every socket is owned by one tokio task that reads frames, dispatches them
//! to the owner's [`Handler`] and is the only writer on the socket. Other
//! contexts talk to it through a cloneable [`Connection`] handle: outbound
//! messages are queued to the task, never written directly.

use crate::codec::{DEFAULT_MAX_BUFFER, FrameCodec};
use crate::{ConnectionState, Message};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{Notify, mpsc};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, warn};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Which end of the protocol a connection serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Accepted by the broker; unnamed until the peer sends HEAD.
    Broker,
    /// Opened by a peer; named from the start.
    Peer,
}

/// Tunables for a connection.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// How long a broker-side connection may stay unnamed.
    pub handshake_timeout: Duration,
    /// How long a single frame write may stall, see [`Connection::send`].
    pub write_timeout: Duration,
    /// Outbound queue depth.
    pub queue_capacity: usize,
    /// Receive buffer cap, see [`FrameCodec::new`].
    pub max_buffer: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_millis(100),
            queue_capacity: 256,
            max_buffer: DEFAULT_MAX_BUFFER,
        }
    }
}

/// A decoded message, interpreted for the role of the connection it arrived on.
///
/// Broker-side variants carry both ends of a routed request; `from` is always
/// the name the connection registered with, never a value taken from the
/// message. Peer-side variants carry the originating peer as stamped by the
/// broker.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Broker side: handshake.
    Head { name: String },
    /// Either side: a broadcast.
    Broadcast {
        from: String,
        name: String,
        payload: Value,
    },
    /// Broker side: a PUSH to forward to `to`.
    RoutePush {
        from: String,
        to: String,
        var: String,
        value: Value,
    },
    /// Broker side: a GET to forward to `to`.
    RouteGet {
        from: String,
        to: String,
        var: String,
    },
    /// Broker side: a client return to forward to `to`.
    RouteReturn {
        from: String,
        to: String,
        payload: Value,
    },
    /// Peer side: a remote write.
    Push {
        from: String,
        var: String,
        value: Value,
    },
    /// Peer side: a remote read.
    Get { from: String, var: String },
    /// Peer side: a broker result.
    ServerReturn { payload: Value },
    /// Peer side: a result from another peer.
    ClientReturn { from: String, payload: Value },
}

impl Inbound {
    /// Dispatch table from (role, message kind) to inbound event.
    ///
    /// `sender` is the registered name of a broker-side connection. Returns
    /// `None` for messages that have no meaning in the given role or state.
    pub fn classify(role: Role, sender: Option<&str>, msg: Message) -> Option<Self> {
        match role {
            Role::Broker => match (sender, msg) {
                (None, Message::Head { name }) if !name.is_empty() => Some(Self::Head { name }),
                (Some(from), Message::Broadcast { name, payload, .. }) => Some(Self::Broadcast {
                    from: from.to_string(),
                    name,
                    payload,
                }),
                (Some(from), Message::Push { peer, var, value }) => Some(Self::RoutePush {
                    from: from.to_string(),
                    to: peer,
                    var,
                    value,
                }),
                (Some(from), Message::Get { peer, var }) => Some(Self::RouteGet {
                    from: from.to_string(),
                    to: peer,
                    var,
                }),
                (Some(from), Message::ClientReturn { peer, payload }) => Some(Self::RouteReturn {
                    from: from.to_string(),
                    to: peer,
                    payload,
                }),
                _ => None,
            },
            Role::Peer => match msg {
                Message::Head { .. } => None,
                Message::Broadcast {
                    from,
                    name,
                    payload,
                } => Some(Self::Broadcast {
                    from: from.unwrap_or_default(),
                    name,
                    payload,
                }),
                Message::Push { peer, var, value } => Some(Self::Push {
                    from: peer,
                    var,
                    value,
                }),
                Message::Get { peer, var } => Some(Self::Get { from: peer, var }),
                Message::ServerReturn { payload } => Some(Self::ServerReturn { payload }),
                Message::ClientReturn { peer, payload } => {
                    Some(Self::ClientReturn { from: peer, payload })
                }
            },
        }
    }
}

/// Owner-side reaction to connection events.
///
/// Both methods run synchronously on the connection's own task, so they must
/// not block; replies go through [`Connection::send`].
pub trait Handler: Send + Sync + 'static {
    /// A message arrived and was classified for this connection's role.
    fn on_message(&self, conn: &Connection, inbound: Inbound);

    /// The connection closed. Called exactly once, after which the socket is
    /// released.
    fn on_closed(&self, conn: &Connection);
}

struct Status {
    state: ConnectionState,
    name: Option<String>,
}

struct Shared {
    id: u64,
    role: Role,
    peer_addr: SocketAddr,
    status: Mutex<Status>,
    outbound: mpsc::Sender<Message>,
    close: Notify,
}

/// Handle to a live connection task.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// Take over an accepted socket. The connection stays unnamed until the
    /// owner calls [`Connection::mark_named`], and closes itself if that has
    /// not happened within the handshake timeout.
    pub fn accept(
        stream: TcpStream,
        options: &ConnectionOptions,
        handler: Arc<dyn Handler>,
    ) -> std::io::Result<Self> {
        Self::spawn(stream, Role::Broker, None, options, handler)
    }

    /// Take over a socket this process opened. HEAD with `name` is the first
    /// frame written.
    pub fn open(
        stream: TcpStream,
        name: &str,
        options: &ConnectionOptions,
        handler: Arc<dyn Handler>,
    ) -> std::io::Result<Self> {
        Self::spawn(stream, Role::Peer, Some(name.to_string()), options, handler)
    }

    fn spawn(
        stream: TcpStream,
        role: Role,
        name: Option<String>,
        options: &ConnectionOptions,
        handler: Arc<dyn Handler>,
    ) -> std::io::Result<Self> {
        let peer_addr = stream.peer_addr()?;
        let (outbound, outbound_rx) = mpsc::channel(options.queue_capacity.max(1));
        let state = if name.is_some() {
            ConnectionState::Named
        } else {
            ConnectionState::AwaitingName
        };

        let conn = Self {
            shared: Arc::new(Shared {
                id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
                role,
                peer_addr,
                status: Mutex::new(Status {
                    state,
                    name: name.clone(),
                }),
                outbound,
                close: Notify::new(),
            }),
        };

        if let Some(name) = name {
            conn.send(Message::head(name))
                .map_err(|e| std::io::Error::other(e.to_string()))?;
        }

        debug!("{} connection to {} started", role_label(role), peer_addr);
        tokio::spawn(run(conn.clone(), stream, outbound_rx, options.clone(), handler));
        Ok(conn)
    }

    /// Process-unique id of this connection.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.shared.peer_addr
    }

    /// The peer name, once known.
    pub fn name(&self) -> Option<String> {
        self.shared.status.lock().name.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.status.lock().state
    }

    /// Complete the handshake of an unnamed connection.
    ///
    /// Returns `false` if the connection is already named or closed.
    pub fn mark_named(&self, name: impl Into<String>) -> bool {
        let mut status = self.shared.status.lock();
        if status.state != ConnectionState::AwaitingName {
            return false;
        }
        status.state = ConnectionState::Named;
        status.name = Some(name.into());
        true
    }

    /// Queue a message for the connection's writer.
    ///
    /// Fails with [`ConnectionError::Backlogged`] when the queue is full,
    /// which happens once the remote stops reading and every write runs into
    /// the write timeout.
    pub fn send(&self, msg: Message) -> Result<(), ConnectionError> {
        if self.state() == ConnectionState::Closed {
            return Err(ConnectionError::Closed);
        }
        self.shared.outbound.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(msg) => {
                error!(
                    "{}: outbound queue full, dropping {}",
                    self.label(),
                    msg.kind()
                );
                ConnectionError::Backlogged
            }
            mpsc::error::TrySendError::Closed(_) => ConnectionError::Closed,
        })
    }

    /// Ask the connection task to close the socket.
    pub fn close(&self) {
        self.shared.close.notify_one();
    }

    /// Name if known, otherwise the remote address.
    pub fn label(&self) -> String {
        match self.name() {
            Some(name) => name,
            None => self.peer_addr().to_string(),
        }
    }

    fn set_closed(&self) {
        self.shared.status.lock().state = ConnectionState::Closed;
    }

    fn dispatch(&self, msg: Message, handler: &dyn Handler) {
        let kind = msg.kind();
        debug!("{}: received {}", self.label(), kind);

        let sender = match self.role() {
            Role::Broker => self.name(),
            Role::Peer => None,
        };
        match Inbound::classify(self.role(), sender.as_deref(), msg) {
            Some(inbound) => handler.on_message(self, inbound),
            None => warn!(
                "{}: ignoring {} in state {:?}",
                self.label(),
                kind,
                self.state()
            ),
        }
    }

    /// Write one frame, giving the socket `timeout` to accept it.
    ///
    /// A frame that times out before reaching the codec buffer is dropped.
    /// One that reached the buffer stays there and is flushed with the next
    /// write, so it arrives late but intact.
    async fn write(
        &self,
        sink: &mut FramedWrite<OwnedWriteHalf, FrameCodec>,
        msg: Message,
        timeout: Duration,
    ) {
        let kind = msg.kind();
        let mut buffered = false;
        let outcome = tokio::time::timeout(timeout, async {
            sink.feed(msg).await?;
            buffered = true;
            sink.flush().await
        })
        .await;
        match outcome {
            Ok(Ok(())) => debug!("{}: sent {}", self.label(), kind),
            Ok(Err(e)) => error!("{}: failed to write {}: {}", self.label(), kind, e),
            Err(_) if buffered => warn!(
                "{}: flush of {} stalled for {:?}, delivery delayed",
                self.label(),
                kind,
                timeout
            ),
            Err(_) => error!(
                "{}: write of {} timed out after {:?}, dropped",
                self.label(),
                kind,
                timeout
            ),
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = self.shared.status.lock();
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("role", &self.shared.role)
            .field("peer_addr", &self.shared.peer_addr)
            .field("state", &status.state)
            .field("name", &status.name)
            .finish()
    }
}

fn role_label(role: Role) -> &'static str {
    match role {
        Role::Broker => "broker-side",
        Role::Peer => "peer-side",
    }
}

async fn run(
    conn: Connection,
    stream: TcpStream,
    mut outbound: mpsc::Receiver<Message>,
    options: ConnectionOptions,
    handler: Arc<dyn Handler>,
) {
    let (reader, writer) = stream.into_split();
    let mut frames = FramedRead::new(reader, FrameCodec::new(options.max_buffer));
    let mut sink = FramedWrite::new(writer, FrameCodec::new(options.max_buffer));

    let handshake = tokio::time::sleep(options.handshake_timeout);
    tokio::pin!(handshake);

    loop {
        let awaiting = conn.state() == ConnectionState::AwaitingName;
        tokio::select! {
            frame = frames.next() => match frame {
                Some(Ok(msg)) => conn.dispatch(msg, handler.as_ref()),
                Some(Err(e)) => {
                    warn!("{}: read error: {}", conn.label(), e);
                    break;
                }
                None => {
                    debug!("{}: remote closed the connection", conn.label());
                    break;
                }
            },
            Some(msg) = outbound.recv() => {
                conn.write(&mut sink, msg, options.write_timeout).await;
            }
            _ = &mut handshake, if awaiting => {
                warn!(
                    "no HEAD from {} within {:?}, closing",
                    conn.peer_addr(),
                    options.handshake_timeout
                );
                break;
            }
            _ = conn.shared.close.notified() => {
                debug!("{}: close requested", conn.label());
                break;
            }
        }
    }

    conn.set_closed();
    outbound.close();
    while outbound.try_recv().is_ok() {}
    warn!("{}: disconnected", conn.label());
    handler.on_closed(&conn);
}

/// Errors returned when queueing a message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("connection is closed")]
    Closed,
    #[error("outbound queue is full")]
    Backlogged,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::decode_frames;
    use bytes::BytesMut;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[derive(Debug, PartialEq)]
    enum Record {
        Message(Inbound),
        Closed(Option<String>),
    }

    struct Recorder {
        tx: mpsc::UnboundedSender<Record>,
        accept_head: bool,
    }

    impl Handler for Recorder {
        fn on_message(&self, conn: &Connection, inbound: Inbound) {
            if let (true, Inbound::Head { name }) = (self.accept_head, &inbound) {
                conn.mark_named(name.clone());
            }
            let _ = self.tx.send(Record::Message(inbound));
        }

        fn on_closed(&self, conn: &Connection) {
            let _ = self.tx.send(Record::Closed(conn.name()));
        }
    }

    fn recorder(accept_head: bool) -> (Arc<Recorder>, mpsc::UnboundedReceiver<Record>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Recorder { tx, accept_head }), rx)
    }

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), server.unwrap().0)
    }

    async fn read_messages(stream: &mut TcpStream, count: usize) -> Vec<Message> {
        let mut buf = BytesMut::new();
        let mut out = Vec::new();
        while out.len() < count {
            let mut chunk = [0u8; 1024];
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "stream closed early");
            buf.extend_from_slice(&chunk[..n]);
            out.extend(decode_frames(&mut buf));
        }
        out
    }

    #[test]
    fn broker_side_requires_name() {
        let msg = Message::push("B", "v", json!(1));
        assert_eq!(Inbound::classify(Role::Broker, None, msg.clone()), None);
        assert_eq!(
            Inbound::classify(Role::Broker, Some("A"), msg),
            Some(Inbound::RoutePush {
                from: "A".into(),
                to: "B".into(),
                var: "v".into(),
                value: json!(1),
            })
        );
    }

    #[test]
    fn broker_side_head_only_once() {
        assert_eq!(
            Inbound::classify(Role::Broker, None, Message::head("A")),
            Some(Inbound::Head { name: "A".into() })
        );
        assert_eq!(
            Inbound::classify(Role::Broker, Some("A"), Message::head("B")),
            None
        );
        assert_eq!(Inbound::classify(Role::Broker, None, Message::head("")), None);
    }

    #[test]
    fn broker_side_broadcast_ignores_claimed_sender() {
        let msg = Message::Broadcast {
            from: Some("spoof".into()),
            name: "n".into(),
            payload: json!({}),
        };
        assert_eq!(
            Inbound::classify(Role::Broker, Some("A"), msg),
            Some(Inbound::Broadcast {
                from: "A".into(),
                name: "n".into(),
                payload: json!({}),
            })
        );
    }

    #[test]
    fn peer_side_directional_field_is_origin() {
        assert_eq!(
            Inbound::classify(Role::Peer, None, Message::get("B", "temp")),
            Some(Inbound::Get {
                from: "B".into(),
                var: "temp".into(),
            })
        );
        assert_eq!(
            Inbound::classify(Role::Peer, None, Message::client_return("B", json!(1))),
            Some(Inbound::ClientReturn {
                from: "B".into(),
                payload: json!(1),
            })
        );
        assert_eq!(Inbound::classify(Role::Peer, None, Message::head("x")), None);
    }

    #[tokio::test]
    async fn open_sends_head_first() {
        let (client, mut server) = socket_pair().await;
        let (handler, _rx) = recorder(false);
        let conn = Connection::open(client, "arm", &ConnectionOptions::default(), handler).unwrap();
        assert_eq!(conn.state(), ConnectionState::Named);
        assert_eq!(conn.name().as_deref(), Some("arm"));

        conn.send(Message::broadcast("hello", json!(1))).unwrap();
        let received = read_messages(&mut server, 2).await;
        assert_eq!(received[0], Message::head("arm"));
        assert_eq!(received[1], Message::broadcast("hello", json!(1)));
    }

    #[tokio::test]
    async fn handshake_then_dispatch() {
        let (mut client, server) = socket_pair().await;
        let (handler, mut rx) = recorder(true);
        let conn = Connection::accept(server, &ConnectionOptions::default(), handler).unwrap();
        assert_eq!(conn.state(), ConnectionState::AwaitingName);

        let mut bytes = crate::encode_frame(&Message::head("A")).unwrap();
        bytes.extend(crate::encode_frame(&Message::get("B", "temp")).unwrap());
        client.write_all(&bytes).await.unwrap();

        assert_eq!(
            rx.recv().await,
            Some(Record::Message(Inbound::Head { name: "A".into() }))
        );
        assert_eq!(
            rx.recv().await,
            Some(Record::Message(Inbound::RouteGet {
                from: "A".into(),
                to: "B".into(),
                var: "temp".into(),
            }))
        );
        assert_eq!(conn.state(), ConnectionState::Named);

        drop(client);
        assert_eq!(rx.recv().await, Some(Record::Closed(Some("A".into()))));
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(
            conn.send(Message::head("x")),
            Err(ConnectionError::Closed)
        );
    }

    #[tokio::test]
    async fn handshake_timeout_closes() {
        let (_client, server) = socket_pair().await;
        let (handler, mut rx) = recorder(false);
        let options = ConnectionOptions {
            handshake_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let conn = Connection::accept(server, &options, handler).unwrap();

        assert_eq!(rx.recv().await, Some(Record::Closed(None)));
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn unnamed_traffic_is_ignored() {
        let (mut client, server) = socket_pair().await;
        let (handler, mut rx) = recorder(false);
        let _conn = Connection::accept(server, &ConnectionOptions::default(), handler).unwrap();

        client
            .write_all(&crate::encode_frame(&Message::broadcast("n", json!(1))).unwrap())
            .await
            .unwrap();
        client.shutdown().await.unwrap();

        assert_eq!(rx.recv().await, Some(Record::Closed(None)));
    }

    #[tokio::test]
    async fn stalled_remote_backlogs_queue() {
        let (client, mut server) = socket_pair().await;
        let (handler, _rx) = recorder(false);
        let options = ConnectionOptions {
            write_timeout: Duration::from_millis(20),
            queue_capacity: 1,
            ..Default::default()
        };
        let conn = Connection::open(client, "arm", &options, handler).unwrap();
        let bulk = "x".repeat(256 * 1024);

        // The server side never reads until the queue overflows.
        let sent = tokio::time::timeout(Duration::from_secs(20), async {
            let mut sent = 0u64;
            loop {
                match conn.send(Message::broadcast("bulk", json!({"seq": sent, "data": bulk}))) {
                    Ok(()) => sent += 1,
                    Err(e) => {
                        assert_eq!(e, ConnectionError::Backlogged);
                        break sent;
                    }
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("queue never backlogged");
        assert!(sent > 0);
        assert_ne!(conn.state(), ConnectionState::Closed);

        // What did get through is still a clean frame stream.
        let received = read_messages(&mut server, 3).await;
        assert_eq!(received[0], Message::head("arm"));
        for (seq, msg) in received[1..].iter().enumerate() {
            match msg {
                Message::Broadcast { payload, .. } => assert_eq!(payload["seq"], json!(seq)),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn close_notifies_once() {
        let (_client, server) = socket_pair().await;
        let (handler, mut rx) = recorder(false);
        let conn = Connection::accept(server, &ConnectionOptions::default(), handler).unwrap();

        conn.close();
        conn.close();
        assert_eq!(rx.recv().await, Some(Record::Closed(None)));
        drop(conn);
        assert_eq!(rx.recv().await, None);
    }
}
