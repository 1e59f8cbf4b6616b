use bacnet_engine::apdu::{Apdu, MaxApduSize, MaxSegments};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn encode_benchmark(c: &mut Criterion) {
    let apdu = Apdu::ConfirmedRequest {
        segmented: false,
        more_follows: false,
        segmented_response_accepted: true,
        max_segments: MaxSegments::SixtyFour,
        max_response_size: MaxApduSize::Up1476,
        invoke_id: 42,
        sequence_number: None,
        proposed_window_size: None,
        service_choice: 12,
        service_data: vec![0x0C, 0x02, 0x00, 0x00, 0x08, 0x19, 0x55],
    };
    c.bench_function("encode_confirmed_request", |b| {
        b.iter(|| black_box(&apdu).encode())
    });
}

fn decode_benchmark(c: &mut Criterion) {
    let frame = Apdu::ComplexAck {
        segmented: true,
        more_follows: true,
        invoke_id: 42,
        sequence_number: Some(3),
        proposed_window_size: Some(16),
        service_choice: 12,
        service_data: vec![0xAB; 480],
    }
    .encode();
    c.bench_function("decode_segmented_complex_ack", |b| {
        b.iter(|| Apdu::decode(black_box(&frame)).unwrap())
    });
}

criterion_group!(benches, encode_benchmark, decode_benchmark);
criterion_main!(benches);
