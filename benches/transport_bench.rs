//! Transport hot-path benchmarks.
//!
//! Measures the packet codec and the sequence-indexed rings; these run
//! once per datagram on the wire.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use rdp::packet::{extension, Header, PacketType, HEADER_SIZE};
use rdp::ring::RingBuffer;
use rdp::seq::seq_before;
use rdp::MAX_PACKET_PAYLOAD;

fn bench_header_encode(c: &mut Criterion) {
    let mut header = Header::new(PacketType::Data, 0x1234, 100, 99);
    header.window = 256 * 1024;

    let mut group = c.benchmark_group("header_encode");
    group.throughput(Throughput::Bytes(HEADER_SIZE as u64));

    group.bench_function("base", |b| {
        b.iter(|| {
            let mut buf = Vec::with_capacity(HEADER_SIZE);
            black_box(&header).encode_into(&mut buf);
            black_box(buf)
        })
    });

    group.finish();
}

fn bench_header_decode(c: &mut Criterion) {
    let mut header = Header::new(PacketType::Data, 0x1234, 100, 99);
    header.window = 256 * 1024;
    let mut bytes = Vec::with_capacity(HEADER_SIZE);
    header.encode_into(&mut bytes);

    let mut group = c.benchmark_group("header_decode");
    group.throughput(Throughput::Bytes(bytes.len() as u64));

    group.bench_function("base", |b| {
        b.iter(|| black_box(Header::decode(black_box(&bytes)).unwrap()))
    });

    group.finish();
}

fn bench_extension_walk(c: &mut Criterion) {
    // A 16-byte selective-ack mask ahead of a full payload.
    let mut area = vec![extension::NONE, 16];
    area.extend_from_slice(&[0xaa; 16]);
    area.extend_from_slice(&vec![0x55u8; MAX_PACKET_PAYLOAD - 18]);

    c.bench_function("extension_walk_sack", |b| {
        b.iter(|| {
            let (sack, rest) =
                rdp::packet::split_extensions(extension::SELECTIVE_ACK, black_box(&area)).unwrap();
            black_box((sack, rest.len()))
        })
    });
}

fn bench_ring_put_take(c: &mut Criterion) {
    c.bench_function("ring_put_take_cycle", |b| {
        let mut ring: RingBuffer<Vec<u8>> = RingBuffer::new();
        let mut seq: u16 = 0;
        b.iter(|| {
            ring.put(seq, vec![0u8; 64]);
            let out = ring.take(seq);
            seq = seq.wrapping_add(1);
            black_box(out)
        })
    });
}

fn bench_ring_grow(c: &mut Criterion) {
    c.bench_function("ring_grow_to_4k", |b| {
        b.iter(|| {
            let mut ring: RingBuffer<u32> = RingBuffer::new();
            for i in 0..64u16 {
                ring.put(i, i as u32);
            }
            ring.ensure_size(4000, 4000);
            black_box(ring.mask())
        })
    });
}

fn bench_seq_compare(c: &mut Criterion) {
    c.bench_function("seq_before_sweep", |b| {
        b.iter(|| {
            let mut hits = 0u32;
            for i in 0..1024u16 {
                if seq_before(black_box(0xfff0), 0xfff0u16.wrapping_add(i)) {
                    hits += 1;
                }
            }
            black_box(hits)
        })
    });
}

criterion_group!(
    benches,
    bench_header_encode,
    bench_header_decode,
    bench_extension_walk,
    bench_ring_put_take,
    bench_ring_grow,
    bench_seq_compare,
);
criterion_main!(benches);
