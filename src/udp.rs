//! UDP segment transfer and loss accounting
//!
//! The server answers a request with a burst of indexed segments and keeps no
//! state afterwards. The client counts distinct indices until it has them all
//! or the line goes quiet; whatever is missing by then is loss.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Result, SpeedError};
use crate::net;
use crate::protocol::{
    DEFAULT_SEGMENT_SIZE, Protocol, RequestMessage, SEGMENT_HEADER_LEN, SegmentHeader,
    TransferResult, decode_segment, segment_count,
};
use crate::stats::{ConnectionSession, ConnectionState, Role};

pub const DEFAULT_SILENCE_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_RECV_BUFFER: usize = 4 * 1024 * 1024;
const RECV_DATAGRAM_SIZE: usize = 65_536;
const FILLER_BYTE: u8 = b'0';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentRecord {
    New,
    Duplicate,
    /// Segment disagrees with the total announced by earlier segments
    Mismatch,
}

/// Receiver-side tracker of distinct segment indices.
///
/// Arrival order is irrelevant; a duplicate index is only counted once.
#[derive(Debug, Default)]
pub struct SegmentTracker {
    expected: Option<u64>,
    seen: HashSet<u64>,
    duplicates: u64,
}

impl SegmentTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, header: SegmentHeader) -> SegmentRecord {
        match self.expected {
            None => self.expected = Some(header.total_segments),
            Some(total) if total != header.total_segments => return SegmentRecord::Mismatch,
            Some(_) => {}
        }

        if self.seen.insert(header.index) {
            SegmentRecord::New
        } else {
            self.duplicates += 1;
            SegmentRecord::Duplicate
        }
    }

    pub fn received(&self) -> u64 {
        self.seen.len() as u64
    }

    pub fn expected(&self) -> Option<u64> {
        self.expected
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }

    pub fn is_complete(&self) -> bool {
        self.expected == Some(self.received())
    }
}

/// Server-side sending parameters
#[derive(Debug, Clone)]
pub struct UdpSendConfig {
    /// Payload bytes per segment
    pub segment_size: usize,
    /// Optional pause between segments. `None` sends as fast as possible.
    pub pace: Option<Duration>,
}

impl Default for UdpSendConfig {
    fn default() -> Self {
        Self {
            segment_size: DEFAULT_SEGMENT_SIZE,
            pace: None,
        }
    }
}

/// Client-side receiving parameters
#[derive(Debug, Clone)]
pub struct UdpReceiveConfig {
    /// Quiet period after which the transfer is considered over
    pub silence_timeout: Duration,
    /// SO_RCVBUF for the receiving socket
    pub recv_buffer: Option<usize>,
}

impl Default for UdpReceiveConfig {
    fn default() -> Self {
        Self {
            silence_timeout: DEFAULT_SILENCE_TIMEOUT,
            recv_buffer: Some(DEFAULT_RECV_BUFFER),
        }
    }
}

/// Send every segment of a `file_size`-byte transfer to `peer`.
///
/// No retransmission and no flow control: send errors are counted and the
/// burst continues.
pub async fn send_segments(
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    file_size: u64,
    connection: u32,
    config: &UdpSendConfig,
) -> TransferResult {
    let mut session = ConnectionSession::new(connection, Protocol::Udp, Role::Server);
    session.advance(ConnectionState::Transferring);

    let segment_size = config.segment_size.max(1);
    let total = segment_count(file_size, segment_size);
    let mut datagram = vec![FILLER_BYTE; SEGMENT_HEADER_LEN + segment_size];
    let mut send_errors: u64 = 0;

    debug!(
        "UDP #{} sending {} segments of {} bytes to {}",
        connection, total, segment_size, peer
    );

    for index in 0..total {
        let offset = index * segment_size as u64;
        let payload_len = (file_size - offset).min(segment_size as u64) as usize;
        SegmentHeader {
            total_segments: total,
            index,
        }
        .encode(&mut datagram);

        match socket
            .send_to(&datagram[..SEGMENT_HEADER_LEN + payload_len], peer)
            .await
        {
            Ok(_) => session.add_bytes(payload_len as u64),
            Err(e) => {
                if send_errors == 0 {
                    warn!("UDP #{} send to {} failed: {}", connection, peer, e);
                }
                send_errors += 1;
            }
        }

        if let Some(pause) = config.pace {
            tokio::time::sleep(pause).await;
        }
    }
    session.mark_progress();

    if send_errors > 0 {
        warn!(
            "UDP #{} to {}: {} of {} segments could not be sent",
            connection, peer, send_errors, total
        );
    }
    info!(
        "UDP transfer #{} to {} complete: {} segments",
        connection, peer, total
    );
    session.finish()
}

/// Client side of one UDP session: request `file_size` bytes from `addr`
/// and measure what arrives.
pub async fn receive_segments(
    connection: u32,
    addr: SocketAddr,
    file_size: u64,
    config: &UdpReceiveConfig,
) -> TransferResult {
    let mut session = ConnectionSession::new(connection, Protocol::Udp, Role::Client);

    match fetch(addr, file_size, &mut session, config).await {
        Ok(()) => session.finish(),
        Err(e) => {
            warn!("UDP transfer #{} failed: {}", connection, e);
            session.fail(e)
        }
    }
}

async fn fetch(
    addr: SocketAddr,
    file_size: u64,
    session: &mut ConnectionSession,
    config: &UdpReceiveConfig,
) -> Result<()> {
    let connect_failure = |source| SpeedError::ConnectFailure { addr, source };

    let socket =
        net::create_udp_socket_for_remote(addr, config.recv_buffer).map_err(connect_failure)?;
    session.start_clock();
    socket
        .send_to(&RequestMessage { file_size }.encode(), addr)
        .await
        .map_err(connect_failure)?;
    session.advance(ConnectionState::AwaitingHeader);

    let mut tracker = SegmentTracker::new();
    let mut buffer = vec![0u8; RECV_DATAGRAM_SIZE];

    // Completion is checked after every arrival, before waiting again, so a
    // final segment always beats a timeout that would fire at the same time.
    // Only a new segment from the server pushes the silence deadline back.
    let mut deadline = Instant::now() + config.silence_timeout;
    while !tracker.is_complete() {
        let n = match tokio::time::timeout_at(deadline, socket.recv_from(&mut buffer)).await {
            Ok(Ok((n, from))) => {
                if net::normalize_ip(from.ip()) != net::normalize_ip(addr.ip())
                    || from.port() != addr.port()
                {
                    debug!(
                        "UDP #{} ignoring datagram from {} (expected {})",
                        session.connection, from, addr
                    );
                    continue;
                }
                n
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                debug!(
                    "UDP #{} silent for {:?}, stopping",
                    session.connection, config.silence_timeout
                );
                break;
            }
        };

        let (header, payload) = match decode_segment(&buffer[..n]) {
            Ok(segment) => segment,
            Err(e) => {
                debug!("UDP #{} ignoring datagram: {}", session.connection, e);
                continue;
            }
        };

        match tracker.record(header) {
            SegmentRecord::New => {
                if tracker.received() == 1 {
                    session.advance(ConnectionState::Transferring);
                }
                session.add_bytes(payload.len() as u64);
                session.mark_progress();
                deadline = Instant::now() + config.silence_timeout;
            }
            SegmentRecord::Duplicate => {}
            SegmentRecord::Mismatch => {
                debug!(
                    "UDP #{} ignoring segment with total {} (expected {:?})",
                    session.connection,
                    header.total_segments,
                    tracker.expected()
                );
            }
        }
    }

    let Some(expected) = tracker.expected() else {
        return Err(SpeedError::NoResponse(config.silence_timeout));
    };
    session.record_segments(tracker.received(), expected);

    if tracker.duplicates() > 0 {
        debug!(
            "UDP #{} saw {} duplicate segments",
            session.connection,
            tracker.duplicates()
        );
    }
    Ok(())
}
