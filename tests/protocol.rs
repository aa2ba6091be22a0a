//! Wire format tests

use dualspeed::SpeedError;
use dualspeed::protocol::{
    MAGIC_COOKIE, OFFER_LEN, OfferMessage, Outcome, Protocol, REQUEST_LEN, RequestMessage,
    SEGMENT_HEADER_LEN, SegmentHeader, TransferResult, UdpDelivery, decode_segment,
    segment_count,
};

#[test]
fn test_offer_bytes() {
    let offer = OfferMessage {
        udp_port: 13117,
        tcp_port: 12345,
    };
    let bytes = offer.encode();

    assert_eq!(bytes.len(), OFFER_LEN);
    assert_eq!(
        bytes,
        [0xab, 0xcd, 0xdc, 0xba, 0x02, 0x33, 0x3d, 0x30, 0x39]
    );
}

#[test]
fn test_request_bytes() {
    let bytes = RequestMessage { file_size: 1_000_000 }.encode();

    assert_eq!(bytes.len(), REQUEST_LEN);
    assert_eq!(&bytes[..4], &MAGIC_COOKIE.to_be_bytes());
    assert_eq!(bytes[4], 0x03);
    assert_eq!(&bytes[5..], &1_000_000u64.to_be_bytes());
}

#[test]
fn test_offer_with_trailing_bytes_is_accepted() {
    let mut datagram = OfferMessage {
        udp_port: 1,
        tcp_port: 2,
    }
    .encode()
    .to_vec();
    datagram.extend_from_slice(b"extra");

    let offer = OfferMessage::decode(&datagram).unwrap();
    assert_eq!(offer.udp_port, 1);
    assert_eq!(offer.tcp_port, 2);
}

#[test]
fn test_wrong_message_kind_rejected() {
    let request = RequestMessage { file_size: 10 }.encode();
    assert!(matches!(
        OfferMessage::decode(&request),
        Err(SpeedError::MalformedMessage(_))
    ));
}

#[test]
fn test_segment_datagram() {
    let mut datagram = vec![0u8; SEGMENT_HEADER_LEN + 4];
    SegmentHeader {
        total_segments: 977,
        index: 976,
    }
    .encode(&mut datagram);
    datagram[SEGMENT_HEADER_LEN..].copy_from_slice(b"0000");

    let (header, payload) = decode_segment(&datagram).unwrap();
    assert_eq!(header.total_segments, 977);
    assert_eq!(header.index, 976);
    assert_eq!(payload, b"0000");
}

#[test]
fn test_segment_count_matches_file_size() {
    assert_eq!(segment_count(1_000_000, 1024), 977);
    assert_eq!(segment_count(1024, 1024), 1);
    assert_eq!(segment_count(1, 1024), 1);
}

#[test]
fn test_result_json_shape() {
    let result = TransferResult {
        connection: 3,
        protocol: Protocol::Udp,
        outcome: Outcome::Completed,
        duration_secs: 2.0,
        bytes: 2048,
        bits_per_second: 8192.0,
        udp: Some(UdpDelivery {
            segments_received: 2,
            segments_expected: 4,
            success_rate: 0.5,
        }),
    };

    let json = serde_json::to_value(&result).unwrap();
    assert_eq!(json["protocol"], "udp");
    assert_eq!(json["outcome"]["status"], "completed");
    assert_eq!(json["udp"]["success_rate"], 0.5);

    let back: TransferResult = serde_json::from_value(json).unwrap();
    assert_eq!(back, result);
}
