//! TCP data transfer
//!
//! The client sends one request header and then reads exactly the requested
//! number of bytes; the server streams filler bytes and closes.

use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::error::{Result, SpeedError};
use crate::net;
use crate::protocol::{Protocol, REQUEST_LEN, RequestMessage, TransferResult};
use crate::stats::{ConnectionSession, ConnectionState, Role, bytes_to_human};

const DEFAULT_BUFFER_SIZE: usize = 128 * 1024; // 128 KB
const FILLER_BYTE: u8 = b'0';

#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Size of each read/write call
    pub buffer_size: usize,
    pub nodelay: bool,
    /// SO_SNDBUF/SO_RCVBUF override
    pub window_size: Option<usize>,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            nodelay: false,
            window_size: None,
        }
    }
}

/// Server side of one TCP session: read the request, stream the payload.
pub async fn serve_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    connection: u32,
    config: &TcpConfig,
) -> TransferResult {
    let mut session = ConnectionSession::new(connection, Protocol::Tcp, Role::Server);

    match send_file(&mut stream, &mut session, config).await {
        Ok(()) => {
            info!(
                "TCP transfer #{} to {} complete: {}",
                connection,
                peer,
                bytes_to_human(session.bytes())
            );
            session.finish()
        }
        Err(e) => {
            warn!("TCP transfer #{} to {} failed: {}", connection, peer, e);
            session.fail(e)
        }
    }
}

async fn send_file(
    stream: &mut TcpStream,
    session: &mut ConnectionSession,
    config: &TcpConfig,
) -> Result<()> {
    net::configure_stream(stream, config.nodelay, config.window_size)?;
    session.advance(ConnectionState::AwaitingHeader);

    let mut header = [0u8; REQUEST_LEN];
    if let Err(e) = stream.read_exact(&mut header).await {
        return Err(match e.kind() {
            std::io::ErrorKind::UnexpectedEof => {
                SpeedError::MalformedMessage("connection closed before request header".into())
            }
            _ => e.into(),
        });
    }
    let request = RequestMessage::decode(&header)?;
    if request.file_size == 0 {
        return Err(SpeedError::EmptyRequest);
    }

    session.advance(ConnectionState::Transferring);
    session.start_clock();
    debug!(
        "TCP #{} sending {} bytes",
        session.connection, request.file_size
    );

    let buffer = vec![FILLER_BYTE; config.buffer_size.max(1)];
    let mut remaining = request.file_size;
    while remaining > 0 {
        let chunk = remaining.min(buffer.len() as u64) as usize;
        stream.write_all(&buffer[..chunk]).await?;
        session.add_bytes(chunk as u64);
        remaining -= chunk as u64;
    }
    session.mark_progress();

    stream.shutdown().await?;
    Ok(())
}

/// Client side of one TCP session.
///
/// The clock starts at connect and stops at the last byte received.
pub async fn receive_file(
    connection: u32,
    addr: SocketAddr,
    file_size: u64,
    config: &TcpConfig,
) -> TransferResult {
    let mut session = ConnectionSession::new(connection, Protocol::Tcp, Role::Client);

    match fetch(addr, file_size, &mut session, config).await {
        Ok(()) => session.finish(),
        Err(e) => {
            warn!("TCP transfer #{} failed: {}", connection, e);
            session.fail(e)
        }
    }
}

async fn fetch(
    addr: SocketAddr,
    file_size: u64,
    session: &mut ConnectionSession,
    config: &TcpConfig,
) -> Result<()> {
    let mut stream = TcpStream::connect(addr)
        .await
        .map_err(|source| SpeedError::ConnectFailure { addr, source })?;
    session.start_clock();
    net::configure_stream(&stream, config.nodelay, config.window_size)?;

    stream
        .write_all(&RequestMessage { file_size }.encode())
        .await?;
    session.advance(ConnectionState::AwaitingHeader);

    let mut buffer = vec![0u8; config.buffer_size.max(1)];
    let mut received: u64 = 0;

    while received < file_size {
        let n = stream.read(&mut buffer).await?;
        if n == 0 {
            return Err(SpeedError::IncompleteTransfer {
                received,
                expected: file_size,
            });
        }
        if received == 0 {
            session.advance(ConnectionState::Transferring);
        }
        let accepted = (n as u64).min(file_size - received);
        received += accepted;
        session.add_bytes(accepted);
        session.mark_progress();
    }

    debug!(
        "TCP #{} received {} bytes",
        session.connection, received
    );
    Ok(())
}
