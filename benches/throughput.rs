//! Codec and tracking benchmarks

use criterion::{Criterion, black_box, criterion_group, criterion_main};

use dualspeed::protocol::{RequestMessage, SEGMENT_HEADER_LEN, SegmentHeader, decode_segment};
use dualspeed::udp::SegmentTracker;

fn bench_request_decode(c: &mut Criterion) {
    let bytes = RequestMessage { file_size: 1_000_000 }.encode();

    c.bench_function("request_decode", |b| {
        b.iter(|| RequestMessage::decode(black_box(&bytes)))
    });
}

fn bench_segment_header_encode(c: &mut Criterion) {
    let header = SegmentHeader {
        total_segments: 977,
        index: 500,
    };
    let mut buffer = [0u8; SEGMENT_HEADER_LEN + 1024];

    c.bench_function("segment_header_encode", |b| {
        b.iter(|| {
            header.encode(black_box(&mut buffer));
        })
    });
}

fn bench_segment_decode(c: &mut Criterion) {
    let mut buffer = [0u8; SEGMENT_HEADER_LEN + 1024];
    SegmentHeader {
        total_segments: 977,
        index: 500,
    }
    .encode(&mut buffer);

    c.bench_function("segment_decode", |b| {
        b.iter(|| decode_segment(black_box(&buffer)))
    });
}

fn bench_tracker_record(c: &mut Criterion) {
    c.bench_function("tracker_record_1000", |b| {
        b.iter(|| {
            let mut tracker = SegmentTracker::new();
            for index in 0..1000 {
                tracker.record(SegmentHeader {
                    total_segments: 1000,
                    index,
                });
            }
            black_box(tracker.received())
        })
    });
}

criterion_group!(
    benches,
    bench_request_decode,
    bench_segment_header_encode,
    bench_segment_decode,
    bench_tracker_record
);
criterion_main!(benches);
