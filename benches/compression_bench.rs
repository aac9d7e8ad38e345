use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use supchunk::{
    compress, decompress, single_filter, CParams, DParams, DecompressionContext, FilterSlot, Storage, SuperChunk,
    CODEC_LZ4, CODEC_ZSTD, FILTER_BITSHUFFLE, FILTER_SHUFFLE,
};

fn int_data(n: usize) -> Vec<u8> {
    (0..n as u32).flat_map(|v| (v / 7).to_le_bytes()).collect()
}

fn bench_compress(c: &mut Criterion) {
    let data = int_data(1 << 20);
    let mut group = c.benchmark_group("compress_4mb");
    group.throughput(Throughput::Bytes(data.len() as u64));
    for (name, codec, filter) in [
        ("lz4_shuffle", CODEC_LZ4, FILTER_SHUFFLE),
        ("lz4_bitshuffle", CODEC_LZ4, FILTER_BITSHUFFLE),
        ("zstd_shuffle", CODEC_ZSTD, FILTER_SHUFFLE),
    ] {
        for nthreads in [1usize, 4] {
            let params = CParams {
                codec,
                typesize: 4,
                nthreads,
                filters: single_filter(FilterSlot::new(filter, 0)),
                ..Default::default()
            };
            group.bench_with_input(BenchmarkId::new(name, nthreads), &params, |b, p| {
                b.iter(|| compress(p, black_box(&data)).unwrap())
            });
        }
    }
    group.finish();
}

fn bench_decompress(c: &mut Criterion) {
    let data = int_data(1 << 20);
    let chunk = compress(&CParams { typesize: 4, ..Default::default() }, &data).unwrap();
    let mut group = c.benchmark_group("decompress_4mb");
    group.throughput(Throughput::Bytes(data.len() as u64));
    group.bench_function("lz4_shuffle", |b| b.iter(|| decompress(black_box(&chunk)).unwrap()));
    let dctx = DecompressionContext::new(DParams { nthreads: 1, ..Default::default() }).unwrap();
    let mut out = vec![0u8; 400];
    group.bench_function("getitem_100", |b| {
        b.iter(|| dctx.getitem(black_box(&chunk), 500_000, 100, &mut out).unwrap())
    });
    group.finish();
}

fn bench_schunk_append(c: &mut Criterion) {
    let data = int_data(1 << 18);
    c.bench_function("schunk_append_16x1mb", |b| {
        b.iter(|| {
            let cparams = CParams { typesize: 4, ..Default::default() };
            let mut schunk = SuperChunk::new(Storage { cparams, ..Default::default() }).unwrap();
            for _ in 0..16 {
                schunk.append_buffer(black_box(&data)).unwrap();
            }
            schunk.to_buffer().unwrap()
        })
    });
}

criterion_group!(benches, bench_compress, bench_decompress, bench_schunk_append);
criterion_main!(benches);
