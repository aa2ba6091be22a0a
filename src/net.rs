//! Socket construction helpers.
//!
//! Uses socket2 so address reuse, broadcast and buffer sizes can be set
//! before the socket is handed to tokio.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use socket2::{Domain, Protocol, SockAddr, SockRef, Socket, Type};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tracing::{debug, info};

fn domain_for(addr: &SocketAddr) -> Domain {
    if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    }
}

fn into_tokio_udp(socket: Socket) -> io::Result<UdpSocket> {
    socket.set_nonblocking(true)?;
    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket)
}

/// Create a TCP listener for the transfer service
pub fn create_tcp_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(domain_for(&addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&SockAddr::from(addr))?;
    socket.listen(1024)?;

    socket.set_nonblocking(true)?;
    let std_listener: std::net::TcpListener = socket.into();
    let listener = TcpListener::from_std(std_listener)?;

    info!("TCP listening on {}", listener.local_addr()?);
    Ok(listener)
}

/// Create the UDP socket that receives transfer requests
pub fn create_udp_socket(addr: SocketAddr) -> io::Result<UdpSocket> {
    let socket = Socket::new(domain_for(&addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&SockAddr::from(addr))?;
    let udp = into_tokio_udp(socket)?;

    info!("UDP listening on {}", udp.local_addr()?);
    Ok(udp)
}

/// Create an ephemeral socket allowed to send to broadcast addresses
pub fn create_broadcast_socket() -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_broadcast(true)?;
    socket.set_reuse_address(true)?;
    socket.bind(&SockAddr::from(SocketAddr::new(
        IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        0,
    )))?;
    into_tokio_udp(socket)
}

/// Bind the discovery port. Several listeners on one host may share it.
pub fn create_discovery_listener(port: u16) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuse_port(true)?;
    socket.set_broadcast(true)?;
    socket.bind(&SockAddr::from(SocketAddr::new(
        IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        port,
    )))?;

    debug!("Discovery listener bound to port {}", port);
    into_tokio_udp(socket)
}

/// Create an ephemeral UDP socket matching the address family of `remote`,
/// optionally with an enlarged receive buffer.
pub fn create_udp_socket_for_remote(
    remote: SocketAddr,
    recv_buffer: Option<usize>,
) -> io::Result<UdpSocket> {
    let socket = Socket::new(domain_for(&remote), Type::DGRAM, Some(Protocol::UDP))?;

    if let Some(size) = recv_buffer
        && let Err(e) = socket.set_recv_buffer_size(size)
    {
        debug!("Failed to set SO_RCVBUF to {}: {}", size, e);
    }

    let bind_addr = match remote {
        SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED), 0),
    };
    socket.bind(&SockAddr::from(bind_addr))?;
    into_tokio_udp(socket)
}

/// Apply TCP_NODELAY and socket buffer sizes to a connected stream
pub fn configure_stream(
    stream: &TcpStream,
    nodelay: bool,
    buffer_size: Option<usize>,
) -> io::Result<()> {
    stream.set_nodelay(nodelay)?;

    if let Some(size) = buffer_size {
        let sock = SockRef::from(stream);
        if let Err(e) = sock.set_send_buffer_size(size) {
            debug!("Failed to set SO_SNDBUF to {}: {}", size, e);
        }
        if let Err(e) = sock.set_recv_buffer_size(size) {
            debug!("Failed to set SO_RCVBUF to {}: {}", size, e);
        }
    }

    Ok(())
}

/// Best guess at this host's primary IPv4 address, for display.
///
/// Connecting a UDP socket sends nothing; it only makes the kernel pick a
/// route and therefore a source address.
pub fn primary_ipv4() -> IpAddr {
    let probe = || -> io::Result<IpAddr> {
        let socket = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80))?;
        Ok(socket.local_addr()?.ip())
    };
    probe().unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}

/// Convert IPv4-mapped IPv6 to IPv4 if applicable
pub fn normalize_ip(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(addr),
        IpAddr::V4(_) => addr,
    }
}
