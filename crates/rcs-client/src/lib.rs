//! Peer side of the Robot Communication System.
//!
//! A [`Peer`] connects to a broker, either directly or by listening for the
//! broker's UDP advertisements, and then exchanges broadcasts and named
//! variables with the other peers on that broker.

mod error;
mod peer;
pub mod variables;

pub use error::PeerError;
pub use peer::{Peer, PeerEvent, PeerOptions, ReturnKind};
pub use variables::{Variable, Variables};
