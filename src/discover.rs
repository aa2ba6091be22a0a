//! LAN discovery via UDP broadcast
//!
//! The server announces its transfer ports with an offer datagram on a fixed
//! interval. Clients take the first well-formed offer they hear.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Result, SpeedError};
use crate::net;
use crate::protocol::{DEFAULT_DISCOVERY_PORT, OfferMessage, ServerEndpoint};

pub const DEFAULT_BROADCAST_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    pub discovery_port: u16,
    /// Destination of offers. Tests point this at loopback.
    pub target: IpAddr,
    pub interval: Duration,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            discovery_port: DEFAULT_DISCOVERY_PORT,
            target: IpAddr::V4(Ipv4Addr::BROADCAST),
            interval: DEFAULT_BROADCAST_INTERVAL,
        }
    }
}

/// Periodic offer sender. Runs until [`Broadcaster::stop`] or drop.
pub struct Broadcaster {
    stop_tx: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl Broadcaster {
    pub fn start(offer: OfferMessage, config: &BroadcastConfig) -> Result<Self> {
        let socket = net::create_broadcast_socket()?;
        let dest = SocketAddr::new(config.target, config.discovery_port);
        let (stop_tx, stop_rx) = watch::channel(false);

        info!(
            "Broadcasting offers to {} every {:?} (tcp {}, udp {})",
            dest, config.interval, offer.tcp_port, offer.udp_port
        );
        let handle = tokio::spawn(broadcast_loop(socket, dest, offer, config.interval, stop_rx));

        Ok(Self {
            stop_tx,
            handle: Some(handle),
        })
    }

    pub async fn stop(mut self) {
        let _ = self.stop_tx.send(true);
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for Broadcaster {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

async fn broadcast_loop(
    socket: UdpSocket,
    dest: SocketAddr,
    offer: OfferMessage,
    period: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let frame = offer.encode();
    let mut ticker = tokio::time::interval(period);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = socket.send_to(&frame, dest).await {
                    warn!("Offer broadcast to {} failed: {}", dest, e);
                }
            }
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    debug!("Broadcaster stopped");
                    break;
                }
            }
        }
    }
}

/// Listen on `port` for the first valid offer.
pub async fn discover(port: u16, timeout: Duration) -> Result<ServerEndpoint> {
    let socket = net::create_discovery_listener(port)?;
    info!("Listening for offers on port {}...", port);
    listen_for_offer(&socket, timeout).await
}

/// Wait on an already-bound socket for the first valid offer. Malformed
/// datagrams are skipped.
pub async fn listen_for_offer(socket: &UdpSocket, timeout: Duration) -> Result<ServerEndpoint> {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut buffer = [0u8; 1024];

    loop {
        let (n, from) = match tokio::time::timeout_at(deadline, socket.recv_from(&mut buffer)).await
        {
            Ok(result) => result?,
            Err(_) => return Err(SpeedError::DiscoveryTimeout(timeout)),
        };

        match OfferMessage::decode(&buffer[..n]) {
            Ok(offer) => {
                let server = ServerEndpoint {
                    ip: net::normalize_ip(from.ip()),
                    tcp_port: offer.tcp_port,
                    udp_port: offer.udp_port,
                };
                info!("Received offer from {}", server);
                return Ok(server);
            }
            Err(e) => {
                debug!("Ignoring datagram from {}: {}", from, e);
            }
        }
    }
}
