//! Message broker for the Robot Communication System.
//!
//! The [`Broker`] accepts TCP connections from peers, registers each under
//! the name it declares in its HEAD frame and routes broadcasts, variable
//! reads/writes and their returns between them. An [`Announcer`] lets peers
//! on the local network find the broker without configuration.

pub mod announcer;
pub mod config;
mod registry;
pub mod server;

pub use announcer::Announcer;
pub use config::{BrokerConfig, ConfigError};
pub use server::{Broker, BrokerError, BrokerEvent, ERROR_DUPLICATE_NAME};
