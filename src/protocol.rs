//! Wire protocol and result types
//!
//! Every message starts with a 4-byte magic cookie followed by a one-byte
//! message type. All integers are big-endian.
//!
//! ```text
//! offer:    [cookie: u32][0x2][udp_port: u16][tcp_port: u16]
//! request:  [cookie: u32][0x3][file_size: u64]
//! payload:  [cookie: u32][0x4][total_segments: u64][index: u64][payload...]
//! ```

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, SpeedError};

pub const MAGIC_COOKIE: u32 = 0xabcd_dcba;

pub const DEFAULT_DISCOVERY_PORT: u16 = 13118;
pub const DEFAULT_TCP_PORT: u16 = 12345;
pub const DEFAULT_UDP_PORT: u16 = 13117;

/// Default number of payload bytes carried by one UDP segment
pub const DEFAULT_SEGMENT_SIZE: usize = 1024;
/// Largest segment payload that still fits in a single IPv4 UDP datagram
pub const MAX_SEGMENT_SIZE: usize = 65_507 - SEGMENT_HEADER_LEN;

const PREFIX_LEN: usize = 5;
pub const OFFER_LEN: usize = PREFIX_LEN + 4;
pub const REQUEST_LEN: usize = PREFIX_LEN + 8;
pub const SEGMENT_HEADER_LEN: usize = PREFIX_LEN + 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Offer = 0x2,
    Request = 0x3,
    Payload = 0x4,
}

impl TryFrom<u8> for MessageType {
    type Error = SpeedError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x2 => Ok(MessageType::Offer),
            0x3 => Ok(MessageType::Request),
            0x4 => Ok(MessageType::Payload),
            other => Err(SpeedError::MalformedMessage(format!(
                "unknown message type 0x{:x}",
                other
            ))),
        }
    }
}

/// Validate cookie, type and minimum length, in that order.
fn check_prefix(buf: &[u8], expected: MessageType, min_len: usize) -> Result<()> {
    if buf.len() < PREFIX_LEN {
        return Err(SpeedError::MalformedMessage(format!(
            "{} bytes is shorter than the message prefix",
            buf.len()
        )));
    }
    let cookie = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if cookie != MAGIC_COOKIE {
        return Err(SpeedError::MalformedMessage(format!(
            "bad magic cookie 0x{:08x}",
            cookie
        )));
    }
    let kind = MessageType::try_from(buf[4])?;
    if kind != expected {
        return Err(SpeedError::MalformedMessage(format!(
            "expected {:?}, got {:?}",
            expected, kind
        )));
    }
    if buf.len() < min_len {
        return Err(SpeedError::MalformedMessage(format!(
            "{:?} truncated: {} of {} bytes",
            expected,
            buf.len(),
            min_len
        )));
    }
    Ok(())
}

fn write_prefix(buf: &mut [u8], kind: MessageType) {
    buf[0..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    buf[4] = kind as u8;
}

fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([buf[at], buf[at + 1]])
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_be_bytes(bytes)
}

/// Server announcement of its transfer ports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OfferMessage {
    pub udp_port: u16,
    pub tcp_port: u16,
}

impl OfferMessage {
    pub fn encode(&self) -> [u8; OFFER_LEN] {
        let mut buf = [0u8; OFFER_LEN];
        write_prefix(&mut buf, MessageType::Offer);
        buf[5..7].copy_from_slice(&self.udp_port.to_be_bytes());
        buf[7..9].copy_from_slice(&self.tcp_port.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        check_prefix(buf, MessageType::Offer, OFFER_LEN)?;
        Ok(Self {
            udp_port: read_u16(buf, 5),
            tcp_port: read_u16(buf, 7),
        })
    }
}

/// Client request for `file_size` bytes.
///
/// A zero size decodes fine; rejecting it is up to the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestMessage {
    pub file_size: u64,
}

impl RequestMessage {
    pub fn encode(&self) -> [u8; REQUEST_LEN] {
        let mut buf = [0u8; REQUEST_LEN];
        write_prefix(&mut buf, MessageType::Request);
        buf[5..13].copy_from_slice(&self.file_size.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        check_prefix(buf, MessageType::Request, REQUEST_LEN)?;
        Ok(Self {
            file_size: read_u64(buf, 5),
        })
    }
}

/// Header of a UDP payload segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    pub total_segments: u64,
    pub index: u64,
}

impl SegmentHeader {
    pub fn encode(&self, buffer: &mut [u8]) {
        write_prefix(buffer, MessageType::Payload);
        buffer[5..13].copy_from_slice(&self.total_segments.to_be_bytes());
        buffer[13..21].copy_from_slice(&self.index.to_be_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        check_prefix(buf, MessageType::Payload, SEGMENT_HEADER_LEN)?;
        let header = Self {
            total_segments: read_u64(buf, 5),
            index: read_u64(buf, 13),
        };
        if header.index >= header.total_segments {
            return Err(SpeedError::MalformedMessage(format!(
                "segment index {} out of range for {} segments",
                header.index, header.total_segments
            )));
        }
        Ok(header)
    }
}

/// Split a datagram into its segment header and payload bytes.
pub fn decode_segment(buf: &[u8]) -> Result<(SegmentHeader, &[u8])> {
    let header = SegmentHeader::decode(buf)?;
    Ok((header, &buf[SEGMENT_HEADER_LEN..]))
}

/// Number of segments needed to carry `file_size` bytes.
pub fn segment_count(file_size: u64, segment_size: usize) -> u64 {
    file_size.div_ceil(segment_size.max(1) as u64)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "TCP"),
            Protocol::Udp => write!(f, "UDP"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Completed,
    Failed { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UdpDelivery {
    pub segments_received: u64,
    pub segments_expected: u64,
    /// Fraction in `0.0..=1.0`
    pub success_rate: f64,
}

/// Final measurement of a single connection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransferResult {
    /// 1-based index within its protocol
    pub connection: u32,
    pub protocol: Protocol,
    pub outcome: Outcome,
    pub duration_secs: f64,
    pub bytes: u64,
    pub bits_per_second: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub udp: Option<UdpDelivery>,
}

impl TransferResult {
    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Completed
    }

    pub fn packet_success_rate(&self) -> Option<f64> {
        self.udp.as_ref().map(|u| u.success_rate)
    }
}

/// Address and ports of the server a run was made against
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerEndpoint {
    pub ip: IpAddr,
    pub tcp_port: u16,
    pub udp_port: u16,
}

impl std::fmt::Display for ServerEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (tcp {}, udp {})", self.ip, self.tcp_port, self.udp_port)
    }
}

/// Everything one client run produced
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub server: ServerEndpoint,
    pub file_size: u64,
    pub results: Vec<TransferResult>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_roundtrip() {
        for file_size in [1u64, 1_000_000, u64::MAX] {
            let msg = RequestMessage { file_size };
            let decoded = RequestMessage::decode(&msg.encode()).unwrap();
            assert_eq!(decoded.file_size, file_size);
        }
    }

    #[test]
    fn test_request_layout() {
        let bytes = RequestMessage { file_size: 0x0102 }.encode();
        assert_eq!(&bytes[..4], &[0xab, 0xcd, 0xdc, 0xba]);
        assert_eq!(bytes[4], 0x3);
        assert_eq!(&bytes[5..], &[0, 0, 0, 0, 0, 0, 0x01, 0x02]);
    }

    #[test]
    fn test_zero_file_size_decodes() {
        let bytes = RequestMessage { file_size: 0 }.encode();
        assert_eq!(RequestMessage::decode(&bytes).unwrap().file_size, 0);
    }

    #[test]
    fn test_offer_layout() {
        let offer = OfferMessage {
            udp_port: 13117,
            tcp_port: 12345,
        };
        let bytes = offer.encode();
        assert_eq!(bytes.len(), 9);
        assert_eq!(bytes[4], 0x2);
        assert_eq!(&bytes[5..7], &13117u16.to_be_bytes());
        assert_eq!(OfferMessage::decode(&bytes).unwrap(), offer);
    }

    #[test]
    fn test_bad_cookie() {
        let mut bytes = RequestMessage { file_size: 10 }.encode();
        bytes[0] = 0x00;
        assert!(matches!(
            RequestMessage::decode(&bytes),
            Err(SpeedError::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_wrong_type() {
        let offer = OfferMessage {
            udp_port: 1,
            tcp_port: 2,
        }
        .encode();
        assert!(matches!(
            RequestMessage::decode(&offer),
            Err(SpeedError::MalformedMessage(_))
        ));

        let mut bytes = RequestMessage { file_size: 10 }.encode();
        bytes[4] = 0x7f;
        assert!(RequestMessage::decode(&bytes).is_err());
    }

    #[test]
    fn test_truncated_never_panics() {
        let full = RequestMessage { file_size: 42 }.encode();
        for len in 0..REQUEST_LEN {
            assert!(matches!(
                RequestMessage::decode(&full[..len]),
                Err(SpeedError::MalformedMessage(_))
            ));
        }
        let mut segment = [0u8; SEGMENT_HEADER_LEN];
        SegmentHeader {
            total_segments: 3,
            index: 1,
        }
        .encode(&mut segment);
        for len in 0..SEGMENT_HEADER_LEN {
            assert!(SegmentHeader::decode(&segment[..len]).is_err());
        }
    }

    #[test]
    fn test_segment_with_payload() {
        let mut datagram = vec![0u8; SEGMENT_HEADER_LEN + 4];
        SegmentHeader {
            total_segments: 10,
            index: 9,
        }
        .encode(&mut datagram);
        datagram[SEGMENT_HEADER_LEN..].copy_from_slice(b"abcd");

        let (header, payload) = decode_segment(&datagram).unwrap();
        assert_eq!(header.total_segments, 10);
        assert_eq!(header.index, 9);
        assert_eq!(payload, b"abcd");
    }

    #[test]
    fn test_segment_index_out_of_range() {
        let mut datagram = [0u8; SEGMENT_HEADER_LEN];
        SegmentHeader {
            total_segments: 4,
            index: 4,
        }
        .encode(&mut datagram);
        assert!(matches!(
            SegmentHeader::decode(&datagram),
            Err(SpeedError::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_segment_count() {
        assert_eq!(segment_count(0, 1024), 0);
        assert_eq!(segment_count(1, 1024), 1);
        assert_eq!(segment_count(1024, 1024), 1);
        assert_eq!(segment_count(1025, 1024), 2);
        assert_eq!(segment_count(102_400, 1024), 100);
    }

    #[test]
    fn test_protocol_display() {
        assert_eq!(Protocol::Tcp.to_string(), "TCP");
        assert_eq!(Protocol::Udp.to_string(), "UDP");
    }

    #[test]
    fn test_outcome_serialization() {
        let json = serde_json::to_string(&Outcome::Failed {
            reason: "closed".to_string(),
        })
        .unwrap();
        assert!(json.contains("\"status\":\"failed\""));
        assert!(json.contains("\"reason\":\"closed\""));
    }
}
