//! Client mode implementation
//!
//! Locates a server (explicitly or by listening for offers), then runs N TCP
//! and M UDP transfers concurrently and collects one result per connection.

use std::net::SocketAddr;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::discover;
use crate::error::{Result, SpeedError};
use crate::protocol::{DEFAULT_DISCOVERY_PORT, Protocol, RunReport, ServerEndpoint, TransferResult};
use crate::stats::{ConnectionSession, Role};
use crate::tcp::{self, TcpConfig};
use crate::udp::{self, UdpReceiveConfig};

pub const DEFAULT_FILE_SIZE: u64 = 1_000_000;
pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Skip discovery and use this server
    pub server: Option<ServerEndpoint>,
    pub discovery_port: u16,
    pub discovery_timeout: Duration,
    /// Bytes requested by every connection
    pub file_size: u64,
    pub tcp_connections: u32,
    pub udp_connections: u32,
    pub tcp: TcpConfig,
    pub udp: UdpReceiveConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: None,
            discovery_port: DEFAULT_DISCOVERY_PORT,
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
            file_size: DEFAULT_FILE_SIZE,
            tcp_connections: 1,
            udp_connections: 1,
            tcp: TcpConfig::default(),
            udp: UdpReceiveConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<()> {
        if self.file_size == 0 {
            return Err(SpeedError::InvalidConfig(
                "file size must be greater than 0".to_string(),
            ));
        }
        if self.tcp_connections == 0 && self.udp_connections == 0 {
            return Err(SpeedError::InvalidConfig(
                "at least one TCP or UDP connection is required".to_string(),
            ));
        }
        Ok(())
    }
}

pub struct Client {
    config: ClientConfig,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// The configured server, or the first one heard on the discovery port.
    pub async fn locate_server(&self) -> Result<ServerEndpoint> {
        match self.config.server {
            Some(server) => Ok(server),
            None => {
                discover::discover(self.config.discovery_port, self.config.discovery_timeout).await
            }
        }
    }

    /// Locate the server and run one round of transfers.
    ///
    /// Each result is forwarded to `progress_tx` as soon as its connection
    /// finishes. Only configuration and discovery failures are returned as
    /// errors; per-connection failures are part of the report.
    pub async fn run(&self, progress_tx: Option<mpsc::Sender<TransferResult>>) -> Result<RunReport> {
        self.config.validate()?;
        let server = self.locate_server().await?;
        Ok(self.run_against(server, progress_tx).await)
    }

    pub async fn run_against(
        &self,
        server: ServerEndpoint,
        progress_tx: Option<mpsc::Sender<TransferResult>>,
    ) -> RunReport {
        let tcp_addr = SocketAddr::new(server.ip, server.tcp_port);
        let udp_addr = SocketAddr::new(server.ip, server.udp_port);
        let file_size = self.config.file_size;

        info!(
            "Starting {} TCP and {} UDP transfers of {} bytes against {}",
            self.config.tcp_connections, self.config.udp_connections, file_size, server
        );

        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<TransferResult>();
        let mut tasks: Vec<(Protocol, u32, JoinHandle<()>)> = Vec::new();

        for connection in 1..=self.config.tcp_connections {
            let done_tx = done_tx.clone();
            let config = self.config.tcp.clone();
            let handle = tokio::spawn(async move {
                let result = tcp::receive_file(connection, tcp_addr, file_size, &config).await;
                let _ = done_tx.send(result);
            });
            tasks.push((Protocol::Tcp, connection, handle));
        }

        for connection in 1..=self.config.udp_connections {
            let done_tx = done_tx.clone();
            let config = self.config.udp.clone();
            let handle = tokio::spawn(async move {
                let result = udp::receive_segments(connection, udp_addr, file_size, &config).await;
                let _ = done_tx.send(result);
            });
            tasks.push((Protocol::Udp, connection, handle));
        }
        drop(done_tx);

        let mut results = Vec::with_capacity(tasks.len());
        while let Some(result) = done_rx.recv().await {
            debug!(
                "{} #{} finished ({}/{})",
                result.protocol,
                result.connection,
                results.len() + 1,
                tasks.len()
            );
            if let Some(tx) = &progress_tx {
                let _ = tx.send(result.clone()).await;
            }
            results.push(result);
        }

        // The channel closes once every task has ended. A task that panicked
        // never reported, so record it as failed rather than dropping it.
        for (protocol, connection, handle) in tasks {
            if let Err(e) = handle.await {
                let reported = results
                    .iter()
                    .any(|r| r.protocol == protocol && r.connection == connection);
                if !reported {
                    warn!("{} #{} task ended without a result: {}", protocol, connection, e);
                    let result = ConnectionSession::new(connection, protocol, Role::Client)
                        .fail(format!("task ended without a result: {}", e));
                    if let Some(tx) = &progress_tx {
                        let _ = tx.send(result.clone()).await;
                    }
                    results.push(result);
                }
            }
        }

        results.sort_by_key(|r| (r.protocol, r.connection));

        RunReport {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            server,
            file_size,
            results,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(ClientConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_file_size_rejected() {
        let config = ClientConfig {
            file_size: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(SpeedError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_no_connections_rejected() {
        let config = ClientConfig {
            tcp_connections: 0,
            udp_connections: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_explicit_server_skips_discovery() {
        let server = ServerEndpoint {
            ip: "127.0.0.1".parse().unwrap(),
            tcp_port: 1,
            udp_port: 2,
        };
        let client = Client::new(ClientConfig {
            server: Some(server),
            discovery_timeout: Duration::from_millis(1),
            ..Default::default()
        });
        assert_eq!(client.locate_server().await.unwrap(), server);
    }
}
