use criterion::{black_box, criterion_group, criterion_main, Criterion};
use niu_common::packet::{
    decode_response, decode_response_meta, write_response, PacketProtocol, ResponseMeta,
};
use serde::Serialize;

#[derive(Serialize)]
struct Message {
    room: &'static str,
    body: Vec<u8>,
}

fn bench_encode_request(c: &mut Criterion) {
    let proto = PacketProtocol::msgpack();
    let msg = Message {
        room: "lobby",
        body: vec![0xAB; 1024],
    };

    c.bench_function("encode_request_1kb", |b| {
        b.iter(|| black_box(proto.encode_request(0x10, 1, Some(&msg)).unwrap()));
    });
}

fn bench_response_meta(c: &mut Criterion) {
    let meta = ResponseMeta {
        msg_type: 0x10,
        request_id: 7,
        timestamp: 1,
        code: 0,
    };
    let bytes = write_response(&meta, &vec![0xAB; 1024]);

    c.bench_function("decode_response_meta_1kb", |b| {
        b.iter(|| black_box(decode_response_meta(&bytes).unwrap()));
    });
}

fn bench_decode_response(c: &mut Criterion) {
    let meta = ResponseMeta {
        msg_type: 0x10,
        request_id: 7,
        timestamp: 1,
        code: 0,
    };
    let bytes = write_response(&meta, &vec![0xAB; 64 * 1024]);

    c.bench_function("decode_response_64kb", |b| {
        b.iter(|| black_box(decode_response(&bytes).unwrap()));
    });
}

criterion_group!(
    benches,
    bench_encode_request,
    bench_response_meta,
    bench_decode_response,
);
criterion_main!(benches);
