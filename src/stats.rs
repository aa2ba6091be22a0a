use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::debug;

use crate::protocol::{Outcome, Protocol, TransferResult, UdpDelivery};

/// Shortest duration a measurement can report. Transfers that finish below
/// clock resolution are clamped to this instead of dividing by zero.
pub const MIN_MEASURED_DURATION: Duration = Duration::from_nanos(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Created,
    AwaitingHeader,
    Transferring,
    Completed,
    Failed,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Completed | ConnectionState::Failed)
    }
}

/// Per-connection measurement state, owned by the task driving the connection.
pub struct ConnectionSession {
    pub connection: u32,
    pub protocol: Protocol,
    pub role: Role,
    state: ConnectionState,
    start_time: Instant,
    end_time: Option<Instant>,
    bytes: u64,
    segments_received: u64,
    segments_expected: Option<u64>,
}

impl ConnectionSession {
    pub fn new(connection: u32, protocol: Protocol, role: Role) -> Self {
        Self {
            connection,
            protocol,
            role,
            state: ConnectionState::Created,
            start_time: Instant::now(),
            end_time: None,
            bytes: 0,
            segments_received: 0,
            segments_expected: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Move to `next`. Terminal states are sticky.
    pub fn advance(&mut self, next: ConnectionState) {
        if self.state.is_terminal() {
            return;
        }
        debug!(
            "{} #{} ({:?}): {:?} -> {:?}",
            self.protocol, self.connection, self.role, self.state, next
        );
        self.state = next;
    }

    /// Restart the clock, e.g. once the connection is established.
    pub fn start_clock(&mut self) {
        self.start_time = Instant::now();
        self.end_time = None;
    }

    pub fn add_bytes(&mut self, bytes: u64) {
        self.bytes += bytes;
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Stamp the arrival of the most recent byte or datagram.
    pub fn mark_progress(&mut self) {
        self.end_time = Some(Instant::now());
    }

    pub fn record_segments(&mut self, received: u64, expected: u64) {
        self.segments_received = received;
        self.segments_expected = Some(expected);
    }

    /// Time from start to the last recorded progress, or to now if nothing
    /// arrived yet.
    pub fn elapsed(&self) -> Duration {
        self.end_time
            .unwrap_or_else(Instant::now)
            .saturating_duration_since(self.start_time)
    }

    pub fn finish(mut self) -> TransferResult {
        self.advance(ConnectionState::Completed);
        let duration = measured_duration(self.elapsed());
        TransferResult {
            connection: self.connection,
            protocol: self.protocol,
            outcome: Outcome::Completed,
            duration_secs: duration.as_secs_f64(),
            bytes: self.bytes,
            bits_per_second: bits_per_second(self.bytes, duration),
            udp: self.delivery(),
        }
    }

    /// Close the session as failed. Duration covers the time until failure.
    pub fn fail(mut self, reason: impl std::fmt::Display) -> TransferResult {
        self.advance(ConnectionState::Failed);
        TransferResult {
            connection: self.connection,
            protocol: self.protocol,
            outcome: Outcome::Failed {
                reason: reason.to_string(),
            },
            duration_secs: Instant::now()
                .saturating_duration_since(self.start_time)
                .as_secs_f64(),
            bytes: self.bytes,
            bits_per_second: 0.0,
            udp: None,
        }
    }

    fn delivery(&self) -> Option<UdpDelivery> {
        let expected = self.segments_expected?;
        Some(UdpDelivery {
            segments_received: self.segments_received,
            segments_expected: expected,
            success_rate: success_rate(self.segments_received, expected),
        })
    }
}

/// Clamp a measured duration to [`MIN_MEASURED_DURATION`].
pub fn measured_duration(elapsed: Duration) -> Duration {
    elapsed.max(MIN_MEASURED_DURATION)
}

pub fn bits_per_second(bytes: u64, duration: Duration) -> f64 {
    (bytes as f64 * 8.0) / measured_duration(duration).as_secs_f64()
}

/// `received / expected`, capped at 1.0
pub fn success_rate(received: u64, expected: u64) -> f64 {
    if expected == 0 {
        return 0.0;
    }
    (received as f64 / expected as f64).min(1.0)
}

/// Aggregate view over one protocol's results
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ProtocolSummary {
    pub connections: usize,
    pub failed: usize,
    pub bytes: u64,
    /// Sum of per-connection throughput; connections run concurrently
    pub aggregate_bits_per_second: f64,
    pub mean_bits_per_second: f64,
    pub longest_secs: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mean_success_rate: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct RunSummary {
    pub tcp: ProtocolSummary,
    pub udp: ProtocolSummary,
}

impl RunSummary {
    pub fn from_results(results: &[TransferResult]) -> Self {
        Self {
            tcp: summarize(results, Protocol::Tcp),
            udp: summarize(results, Protocol::Udp),
        }
    }

    pub fn failed(&self) -> usize {
        self.tcp.failed + self.udp.failed
    }
}

fn summarize(results: &[TransferResult], protocol: Protocol) -> ProtocolSummary {
    let mut summary = ProtocolSummary::default();
    let mut rates = Vec::new();

    for result in results.iter().filter(|r| r.protocol == protocol) {
        summary.connections += 1;
        summary.longest_secs = summary.longest_secs.max(result.duration_secs);
        if !result.is_success() {
            summary.failed += 1;
            continue;
        }
        summary.bytes += result.bytes;
        summary.aggregate_bits_per_second += result.bits_per_second;
        if let Some(rate) = result.packet_success_rate() {
            rates.push(rate);
        }
    }

    let completed = summary.connections - summary.failed;
    if completed > 0 {
        summary.mean_bits_per_second = summary.aggregate_bits_per_second / completed as f64;
    }
    if !rates.is_empty() {
        summary.mean_success_rate = Some(rates.iter().sum::<f64>() / rates.len() as f64);
    }
    summary
}

pub fn bytes_to_human(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

pub fn bps_to_human(bps: f64) -> String {
    if bps >= 1e9 {
        format!("{:.2} Gbps", bps / 1e9)
    } else if bps >= 1e6 {
        format!("{:.2} Mbps", bps / 1e6)
    } else if bps >= 1e3 {
        format!("{:.2} Kbps", bps / 1e3)
    } else {
        format!("{:.0} bps", bps)
    }
}
