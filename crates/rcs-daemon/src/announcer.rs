//! Periodic UDP advertisement of the broker's interfaces.

use rcs_core::discovery::{self, Advertisement};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub struct Announcer {
    target: SocketAddr,
    interval: Duration,
}

impl Announcer {
    /// Announce to the limited broadcast address on `port`.
    pub fn broadcast(port: u16, interval: Duration) -> Self {
        Self::new(SocketAddr::from((Ipv4Addr::BROADCAST, port)), interval)
    }

    pub fn new(target: SocketAddr, interval: Duration) -> Self {
        Self { target, interval }
    }

    /// Send one advertisement per interval until `shutdown` turns true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> io::Result<()> {
        let socket = bind_broadcast_socket()?;
        let mut ticker = tokio::time::interval(self.interval);
        let mut failing = false;
        info!("announcing on UDP {} every {:?}", self.target, self.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let hosts = tokio::task::spawn_blocking(discovery::local_entries)
                        .await
                        .unwrap_or_default();
                    let body = Advertisement::new(hosts).to_vec().map_err(io::Error::other)?;
                    match socket.send_to(&body, self.target).await {
                        Ok(_) => {
                            if failing {
                                info!("announcements to {} resumed", self.target);
                            }
                            failing = false;
                        }
                        Err(e) if !failing => {
                            warn!("failed to announce to {}: {}", self.target, e);
                            failing = true;
                        }
                        Err(e) => debug!("failed to announce to {}: {}", self.target, e),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("announcer stopped");
                        return Ok(());
                    }
                }
            }
        }
    }
}

fn bind_broadcast_socket() -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0));
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}
