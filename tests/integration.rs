//! Integration tests for dualspeed

use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;
use tokio::time::timeout;

use dualspeed::client::{Client, ClientConfig};
use dualspeed::discover::BroadcastConfig;
use dualspeed::protocol::{Outcome, Protocol, ServerEndpoint};
use dualspeed::serve::{Server, ServerConfig, ServerHandle};
use dualspeed::udp::{UdpReceiveConfig, UdpSendConfig};
use dualspeed::SpeedError;

// Discovery ports can't be ephemeral, so each test gets its own
static PORT_COUNTER: AtomicU16 = AtomicU16::new(23000);

fn get_test_port() -> u16 {
    PORT_COUNTER.fetch_add(10, Ordering::SeqCst)
}

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

async fn start_test_server(broadcast: Option<BroadcastConfig>) -> ServerHandle {
    let config = ServerConfig {
        bind_ip: LOCALHOST,
        tcp_port: 0,
        udp_port: 0,
        broadcast,
        udp: UdpSendConfig {
            pace: Some(Duration::from_micros(50)),
            ..Default::default()
        },
        ..Default::default()
    };
    Server::new(config).start().await.unwrap()
}

fn endpoint(handle: &ServerHandle) -> ServerEndpoint {
    ServerEndpoint {
        ip: LOCALHOST,
        tcp_port: handle.tcp_addr().port(),
        udp_port: handle.udp_addr().port(),
    }
}

#[tokio::test]
async fn test_tcp_single_connection() {
    let server = start_test_server(None).await;

    let config = ClientConfig {
        server: Some(endpoint(&server)),
        file_size: 1_000_000,
        tcp_connections: 1,
        udp_connections: 0,
        ..Default::default()
    };

    let client = Client::new(config);
    let report = timeout(Duration::from_secs(10), client.run(None))
        .await
        .expect("Test should complete")
        .expect("Test should succeed");

    assert_eq!(report.results.len(), 1);
    let result = &report.results[0];
    assert_eq!(result.protocol, Protocol::Tcp);
    assert_eq!(result.outcome, Outcome::Completed);
    assert_eq!(result.bytes, 1_000_000);
    assert!(result.bits_per_second.is_finite());
    assert!(result.bits_per_second > 0.0);
    assert!(result.udp.is_none());

    server.shutdown().await;
}

#[tokio::test]
async fn test_udp_single_connection() {
    let server = start_test_server(None).await;

    let config = ClientConfig {
        server: Some(endpoint(&server)),
        file_size: 100 * 1024,
        tcp_connections: 0,
        udp_connections: 1,
        ..Default::default()
    };

    let report = timeout(Duration::from_secs(10), Client::new(config).run(None))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(report.results.len(), 1);
    let result = &report.results[0];
    assert_eq!(result.protocol, Protocol::Udp);
    let delivery = result.udp.as_ref().expect("UDP result carries delivery stats");
    assert_eq!(delivery.segments_expected, 100);
    assert!(delivery.segments_received > 0);
    assert!(delivery.success_rate > 0.0 && delivery.success_rate <= 1.0);

    server.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_mixed_connections() {
    let server = start_test_server(None).await;

    let config = ClientConfig {
        server: Some(endpoint(&server)),
        file_size: 64 * 1024,
        tcp_connections: 5,
        udp_connections: 5,
        ..Default::default()
    };

    let (tx, mut rx) = tokio::sync::mpsc::channel(100);
    let report = timeout(Duration::from_secs(20), Client::new(config).run(Some(tx)))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(report.results.len(), 10);
    let tcp: Vec<_> = report
        .results
        .iter()
        .filter(|r| r.protocol == Protocol::Tcp)
        .collect();
    let udp: Vec<_> = report
        .results
        .iter()
        .filter(|r| r.protocol == Protocol::Udp)
        .collect();
    assert_eq!(tcp.len(), 5);
    assert_eq!(udp.len(), 5);

    let tcp_ids: Vec<u32> = tcp.iter().map(|r| r.connection).collect();
    assert_eq!(tcp_ids, vec![1, 2, 3, 4, 5]);
    assert!(tcp.iter().all(|r| r.bytes == 64 * 1024));

    // Every result was also streamed as it finished
    let mut streamed = 0;
    while rx.try_recv().is_ok() {
        streamed += 1;
    }
    assert_eq!(streamed, 10);

    server.shutdown().await;
}

#[tokio::test]
async fn test_discovery_end_to_end() {
    let discovery_port = get_test_port();
    let server = start_test_server(Some(BroadcastConfig {
        discovery_port,
        target: LOCALHOST,
        interval: Duration::from_millis(100),
    }))
    .await;

    let config = ClientConfig {
        discovery_port,
        discovery_timeout: Duration::from_secs(5),
        file_size: 10_000,
        tcp_connections: 1,
        udp_connections: 1,
        ..Default::default()
    };

    let report = timeout(Duration::from_secs(15), Client::new(config).run(None))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(report.server.tcp_port, server.tcp_addr().port());
    assert_eq!(report.server.udp_port, server.udp_addr().port());
    assert_eq!(report.results.len(), 2);

    server.shutdown().await;
}

#[tokio::test]
async fn test_discovery_timeout_without_server() {
    let config = ClientConfig {
        discovery_port: get_test_port(),
        discovery_timeout: Duration::from_millis(300),
        ..Default::default()
    };

    let result = Client::new(config).run(None).await;
    assert!(matches!(result, Err(SpeedError::DiscoveryTimeout(_))));
}

#[tokio::test]
async fn test_unreachable_server_reports_failures() {
    // Grab a port and free it so nothing is listening there
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let silent = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();

    let config = ClientConfig {
        server: Some(ServerEndpoint {
            ip: LOCALHOST,
            tcp_port: port,
            udp_port: silent.local_addr().unwrap().port(),
        }),
        file_size: 1000,
        tcp_connections: 2,
        udp_connections: 1,
        udp: UdpReceiveConfig {
            silence_timeout: Duration::from_millis(200),
            ..Default::default()
        },
        ..Default::default()
    };

    let report = timeout(Duration::from_secs(10), Client::new(config).run(None))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(report.results.len(), 3);
    assert!(report.results.iter().all(|r| !r.is_success()));
    assert!(report.results.iter().all(|r| r.bits_per_second == 0.0));
}

#[tokio::test]
async fn test_server_survives_malformed_requests() {
    let server = start_test_server(None).await;

    // Garbage on both service ports
    let probe = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    probe.send_to(b"hello", server.udp_addr()).await.unwrap();
    {
        use tokio::io::AsyncWriteExt;
        let mut stream = tokio::net::TcpStream::connect(server.tcp_addr()).await.unwrap();
        stream.write_all(&[0u8; 13]).await.unwrap();
    }

    let config = ClientConfig {
        server: Some(endpoint(&server)),
        file_size: 5000,
        tcp_connections: 1,
        udp_connections: 1,
        ..Default::default()
    };
    let report = timeout(Duration::from_secs(10), Client::new(config).run(None))
        .await
        .unwrap()
        .unwrap();

    let tcp = report
        .results
        .iter()
        .find(|r| r.protocol == Protocol::Tcp)
        .unwrap();
    assert_eq!(tcp.bytes, 5000);
    assert!(tcp.is_success());

    server.shutdown().await;
}

#[tokio::test]
async fn test_invalid_config_rejected() {
    let config = ClientConfig {
        file_size: 0,
        ..Default::default()
    };
    let result = Client::new(config).run(None).await;
    assert!(matches!(result, Err(SpeedError::InvalidConfig(_))));

    let config = ClientConfig {
        tcp_connections: 0,
        udp_connections: 0,
        ..Default::default()
    };
    let result = Client::new(config).run(None).await;
    assert!(matches!(result, Err(SpeedError::InvalidConfig(_))));
}
