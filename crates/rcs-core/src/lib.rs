//! Core types for the Robot Communication System.
//!
//! This crate provides the protocol primitives shared by the broker and its
//! peers: the message model, the checksummed frame codec, the connection
//! actor that owns a socket, and the discovery advertisement format.

pub mod codec;
pub mod connection;
pub mod discovery;
mod message;

pub use codec::{FrameCodec, FrameError, decode_frames, encode_frame};
pub use connection::{Connection, ConnectionError, ConnectionOptions, Handler, Inbound, Role};
pub use discovery::{Advertisement, HostEntry};
pub use message::{
    Message, MessageKind, ProtocolError, unknown_peer_error, unknown_peer_name,
};

/// Default broker TCP port.
pub const DEFAULT_PORT: u16 = 8850;

/// Default UDP port for discovery advertisements.
pub const DEFAULT_DISCOVERY_PORT: u16 = 8849;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepted, waiting for the peer's HEAD.
    AwaitingName,
    /// Handshake complete.
    Named,
    /// Socket released.
    Closed,
}
