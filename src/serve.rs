//! Server mode implementation
//!
//! Runs three independent loops: the offer broadcaster, the TCP accept loop
//! and the UDP request loop. Every accepted connection and every UDP request
//! is served on its own task.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::discover::{BroadcastConfig, Broadcaster};
use crate::net;
use crate::protocol::{DEFAULT_TCP_PORT, DEFAULT_UDP_PORT, OfferMessage, RequestMessage};
use crate::tcp::{self, TcpConfig};
use crate::udp::{self, UdpSendConfig};

/// Largest datagram the request loop reads; requests are 13 bytes.
const REQUEST_BUFFER_SIZE: usize = 1024;
/// Back-off after a failed accept, e.g. when out of file descriptors
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_ip: IpAddr,
    /// 0 picks an ephemeral port
    pub tcp_port: u16,
    /// 0 picks an ephemeral port
    pub udp_port: u16,
    /// `None` disables offer broadcasting
    pub broadcast: Option<BroadcastConfig>,
    pub tcp: TcpConfig,
    pub udp: UdpSendConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            tcp_port: DEFAULT_TCP_PORT,
            udp_port: DEFAULT_UDP_PORT,
            broadcast: Some(BroadcastConfig::default()),
            tcp: TcpConfig::default(),
            udp: UdpSendConfig::default(),
        }
    }
}

/// Count of transfers in flight, for display only
#[derive(Debug, Default)]
pub struct ActiveConnections(AtomicUsize);

impl ActiveConnections {
    pub fn current(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }

    fn enter(self: &Arc<Self>) -> ActiveGuard {
        self.0.fetch_add(1, Ordering::Relaxed);
        ActiveGuard(self.clone())
    }
}

struct ActiveGuard(Arc<ActiveConnections>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.0.fetch_sub(1, Ordering::Relaxed);
    }
}

pub struct Server {
    config: ServerConfig,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    /// Bind both service sockets and start all loops.
    ///
    /// Bind failures are returned here; nothing is started in that case.
    pub async fn start(&self) -> anyhow::Result<ServerHandle> {
        let listener = net::create_tcp_listener(SocketAddr::new(
            self.config.bind_ip,
            self.config.tcp_port,
        ))?;
        let udp_socket = Arc::new(net::create_udp_socket(SocketAddr::new(
            self.config.bind_ip,
            self.config.udp_port,
        ))?);

        let tcp_addr = listener.local_addr()?;
        let udp_addr = udp_socket.local_addr()?;

        let broadcaster = match &self.config.broadcast {
            Some(broadcast) => {
                let offer = OfferMessage {
                    udp_port: udp_addr.port(),
                    tcp_port: tcp_addr.port(),
                };
                Some(Broadcaster::start(offer, broadcast)?)
            }
            None => None,
        };

        let active = Arc::new(ActiveConnections::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let tcp_task = tokio::spawn(accept_loop(
            listener,
            Arc::new(self.config.tcp.clone()),
            active.clone(),
            shutdown_rx.clone(),
        ));
        let udp_task = tokio::spawn(udp_request_loop(
            udp_socket,
            Arc::new(self.config.udp.clone()),
            active.clone(),
            shutdown_rx,
        ));

        Ok(ServerHandle {
            tcp_addr,
            udp_addr,
            active,
            shutdown_tx,
            tasks: vec![tcp_task, udp_task],
            broadcaster,
        })
    }

    /// Serve until Ctrl-C.
    pub async fn run(&self) -> anyhow::Result<()> {
        let handle = self.start().await?;
        info!(
            "Server started, listening on IP address {}",
            net::primary_ipv4()
        );

        tokio::signal::ctrl_c().await?;
        info!("Shutting down server");
        handle.shutdown().await;
        Ok(())
    }
}

/// A running server. Dropping it without [`ServerHandle::shutdown`] leaves
/// the loops running until the runtime exits.
pub struct ServerHandle {
    tcp_addr: SocketAddr,
    udp_addr: SocketAddr,
    active: Arc<ActiveConnections>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    broadcaster: Option<Broadcaster>,
}

impl ServerHandle {
    pub fn tcp_addr(&self) -> SocketAddr {
        self.tcp_addr
    }

    pub fn udp_addr(&self) -> SocketAddr {
        self.udp_addr
    }

    pub fn active_connections(&self) -> usize {
        self.active.current()
    }

    /// Stop broadcasting and accepting. Transfers already running finish on
    /// their own.
    pub async fn shutdown(mut self) {
        if let Some(broadcaster) = self.broadcaster.take() {
            broadcaster.stop().await;
        }
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        debug!("Server loops stopped");
    }
}

async fn accept_loop(
    listener: TcpListener,
    config: Arc<TcpConfig>,
    active: Arc<ActiveConnections>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut next_connection: u32 = 0;

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("TCP accept error: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                };

                next_connection = next_connection.wrapping_add(1);
                let connection = next_connection;
                let guard = active.enter();
                info!(
                    "TCP connection #{} from {} ({} active)",
                    connection,
                    peer,
                    active.current()
                );

                let config = config.clone();
                tokio::spawn(async move {
                    let _guard = guard;
                    tcp::serve_connection(stream, peer, connection, &config).await;
                });
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

async fn udp_request_loop(
    socket: Arc<UdpSocket>,
    config: Arc<UdpSendConfig>,
    active: Arc<ActiveConnections>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buffer = [0u8; REQUEST_BUFFER_SIZE];
    let mut next_connection: u32 = 0;

    loop {
        tokio::select! {
            received = socket.recv_from(&mut buffer) => {
                let (n, peer) = match received {
                    Ok(received) => received,
                    Err(e) => {
                        // Unconnected UDP sockets can surface ICMP errors from
                        // earlier sends on some platforms; keep serving.
                        warn!("UDP receive error: {}", e);
                        continue;
                    }
                };

                let request = match RequestMessage::decode(&buffer[..n]) {
                    Ok(request) => request,
                    Err(e) => {
                        debug!("Ignoring datagram from {}: {}", peer, e);
                        continue;
                    }
                };
                if request.file_size == 0 {
                    warn!("Ignoring zero-byte UDP request from {}", peer);
                    continue;
                }

                next_connection = next_connection.wrapping_add(1);
                let connection = next_connection;
                let guard = active.enter();
                info!(
                    "UDP request #{} from {} for {} bytes ({} active)",
                    connection,
                    peer,
                    request.file_size,
                    active.current()
                );

                let socket = socket.clone();
                let config = config.clone();
                tokio::spawn(async move {
                    let _guard = guard;
                    udp::send_segments(socket, peer, request.file_size, connection, &config).await;
                });
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
