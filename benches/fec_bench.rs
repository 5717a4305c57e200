use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use owsync::streaming::fec::{FecDecoder, FecEncoder};
use owsync::streaming::protocol::{overhead, Chunk};

const CHUNK_SIZE: usize = 8192;
const PATH: &str = "/data/bench/file.bin";

fn make_chunk(required: usize) -> Chunk {
    let len = (CHUNK_SIZE - overhead(PATH)) * required;
    Chunk {
        path: PATH.to_string(),
        hash: [0x5A; 32],
        data_offset: 0,
        data_padding: 0,
        share_index: 0,
        data: Bytes::from((0..len).map(|i| (i * 31) as u8).collect::<Vec<u8>>()),
    }
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("fec_encode");

    for (required, total) in [(5, 10), (10, 16), (20, 30)] {
        let encoder = FecEncoder::new(required, total).unwrap();
        let chunk = make_chunk(required);
        group.throughput(Throughput::Bytes(chunk.data.len() as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{}of{}", required, total)),
            &chunk,
            |b, chunk| b.iter(|| encoder.encode(black_box(chunk)).unwrap()),
        );
    }

    group.finish();
}

fn bench_decode_worst_case(c: &mut Criterion) {
    let mut group = c.benchmark_group("fec_decode_parity_only");

    for (required, total) in [(5, 10), (10, 20)] {
        let encoder = FecEncoder::new(required, total).unwrap();
        let decoder = FecDecoder::new(required, total).unwrap();
        let chunk = make_chunk(required);
        // Every data shard lost: the decoder rebuilds all of them from parity
        let parity: Vec<Chunk> = encoder.encode(&chunk).unwrap()[required..].to_vec();

        group.throughput(Throughput::Bytes(chunk.data.len() as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{}of{}", required, total)),
            &parity,
            |b, shares| b.iter(|| decoder.decode(black_box(shares)).unwrap()),
        );
    }

    group.finish();
}

fn bench_wire_codec(c: &mut Criterion) {
    let share = FecEncoder::new(5, 10).unwrap().encode(&make_chunk(5)).unwrap()[7].clone();
    let encoded = share.encode();

    c.bench_function("chunk_encode", |b| b.iter(|| black_box(&share).encode()));
    c.bench_function("chunk_decode", |b| {
        b.iter(|| Chunk::decode(black_box(encoded.clone())).unwrap())
    });
}

criterion_group!(benches, bench_encode, bench_decode_worst_case, bench_wire_codec);
criterion_main!(benches);
