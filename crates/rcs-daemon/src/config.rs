//! Broker configuration.

use rcs_core::codec::DEFAULT_MAX_BUFFER;
use rcs_core::{ConnectionOptions, DEFAULT_DISCOVERY_PORT, DEFAULT_PORT};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Broker configuration, loadable from a TOML file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Address to bind to (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,

    /// TCP port to listen on (default: 8850, 0 picks a free port)
    #[serde(default = "default_port")]
    pub port: u16,

    /// How long a new connection may stay unnamed
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,

    /// Per-frame write deadline
    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,

    /// Outbound queue depth per connection
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Receive buffer cap per connection (bytes)
    #[serde(default = "default_max_buffer")]
    pub max_buffer: usize,

    /// Broadcast UDP advertisements so peers can find the broker
    #[serde(default = "default_true")]
    pub announce: bool,

    /// UDP port advertisements are sent to
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,

    #[serde(default = "default_announce_interval")]
    pub announce_interval_ms: u64,
}

fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_handshake_timeout() -> u64 {
    10_000
}

fn default_write_timeout() -> u64 {
    100
}

fn default_queue_capacity() -> usize {
    256
}

fn default_max_buffer() -> usize {
    DEFAULT_MAX_BUFFER
}

fn default_true() -> bool {
    true
}

fn default_discovery_port() -> u16 {
    DEFAULT_DISCOVERY_PORT
}

fn default_announce_interval() -> u64 {
    1_000
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            handshake_timeout_ms: default_handshake_timeout(),
            write_timeout_ms: default_write_timeout(),
            queue_capacity: default_queue_capacity(),
            max_buffer: default_max_buffer(),
            announce: true,
            discovery_port: default_discovery_port(),
            announce_interval_ms: default_announce_interval(),
        }
    }
}

impl BrokerConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn announce_interval(&self) -> Duration {
        Duration::from_millis(self.announce_interval_ms)
    }

    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            handshake_timeout: self.handshake_timeout(),
            write_timeout: self.write_timeout(),
            queue_capacity: self.queue_capacity,
            max_buffer: self.max_buffer,
        }
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.handshake_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "handshake_timeout_ms cannot be 0".into(),
            ));
        }
        if self.write_timeout_ms == 0 {
            return Err(ConfigError::Invalid("write_timeout_ms cannot be 0".into()));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid("queue_capacity cannot be 0".into()));
        }
        if self.max_buffer == 0 {
            return Err(ConfigError::Invalid("max_buffer cannot be 0".into()));
        }
        if self.announce {
            if self.discovery_port == 0 {
                return Err(ConfigError::Invalid(
                    "discovery_port cannot be 0 when announcing".into(),
                ));
            }
            if self.announce_interval_ms == 0 {
                return Err(ConfigError::Invalid(
                    "announce_interval_ms cannot be 0 when announcing".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Configuration error types.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value: {0}")]
    Invalid(String),
}
