use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by a [`Peer`](crate::Peer).
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("peer name must not be empty")]
    EmptyName,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The TCP connect to the broker did not complete in time.
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// Discovery found a broker but could not connect to it.
    #[error("discovery failed: {0}")]
    Discovery(String),

    #[error("not connected within {0:?}")]
    WaitTimeout(Duration),

    #[error("disconnected from broker")]
    Disconnected,
}
