use std::borrow::Cow;
use std::sync::Arc;

use supchunk::codec::USER_CODEC_START;
use supchunk::{
    chunk_info, compress, decompress, register_codec, single_filter, CParams, Codec, CodecError,
    CompressionContext, DParams, DecompressionContext, ErrorKind, FilterSlot, Storage, SuperChunk,
    CODEC_LZ4, CODEC_RLE, CODEC_ZSTD, FILTER_BITSHUFFLE, FILTER_DELTA, FILTER_SHUFFLE, HEADER_SIZE,
};
use tempfile::NamedTempFile;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
    supchunk::initialize();
}

fn int32s(start: i32, n: i32) -> Vec<u8> {
    (start..start + n).flat_map(|v| v.to_le_bytes()).collect()
}

fn noisy(len: usize, seed: u64) -> Vec<u8> {
    let mut x = seed | 1;
    (0..len)
        .map(|_| {
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            x as u8
        })
        .collect()
}

/// Stores its input unchanged.
struct NoopCodec;

impl Codec for NoopCodec {
    fn name(&self) -> &str {
        "noop-test"
    }
    fn compress(&self, data: &[u8], _: u8, _: u8, _: usize) -> Result<Vec<u8>, CodecError> {
        Ok(data.to_vec())
    }
    fn decompress(&self, data: &[u8], _: u8, _: usize) -> Result<Vec<u8>, CodecError> {
        Ok(data.to_vec())
    }
}

#[test]
fn delete_first_chunk_keeps_second() {
    init();
    let cparams = CParams { typesize: 4, blocksize: 16, ..Default::default() };
    let mut schunk = SuperChunk::new(Storage { cparams, ..Default::default() }).unwrap();

    let first: Vec<u8> = (0..4).flat_map(|v: i32| [v; 4]).flat_map(|v| v.to_le_bytes()).collect();
    let second: Vec<u8> = (10..14).flat_map(|v: i32| [v; 4]).flat_map(|v| v.to_le_bytes()).collect();
    assert_eq!(first.len(), 64);
    assert_eq!(schunk.append_buffer(&first).unwrap(), 1);
    assert_eq!(schunk.append_buffer(&second).unwrap(), 2);

    assert_eq!(schunk.delete_chunk(0).unwrap(), 1);
    assert_eq!(schunk.nchunks(), 1);
    let chunk = schunk.get_chunk(0).unwrap();
    assert!(matches!(chunk, Cow::Borrowed(_)));
    assert_eq!(decompress(&chunk).unwrap(), second);
}

#[test]
fn user_codec_that_cannot_shrink_is_stored_memcpyed() {
    init();
    register_codec(200, Arc::new(NoopCodec)).unwrap();
    assert!(200 >= USER_CODEC_START);

    let src = noisy(1000, 7);
    let cparams = CParams { codec: 200, typesize: 1, ..Default::default() };
    let chunk = compress(&cparams, &src).unwrap();
    let info = chunk_info(&chunk).unwrap();
    assert!(info.is_memcpyed());
    assert_eq!(info.codec, 200);
    assert_eq!(chunk.len(), src.len() + HEADER_SIZE);
    assert_eq!(decompress(&chunk).unwrap(), src);
}

#[test]
fn roundtrip_across_codecs_filters_and_sizes() {
    init();
    let inputs = [Vec::new(), vec![5u8], int32s(0, 3), int32s(-500, 10_000), noisy(70_001, 3)];
    for codec in [CODEC_RLE, CODEC_LZ4, CODEC_ZSTD] {
        for filter in [FILTER_SHUFFLE, FILTER_BITSHUFFLE, FILTER_DELTA] {
            for clevel in [0u8, 1, 5, 9] {
                let cparams = CParams {
                    codec,
                    clevel,
                    typesize: 4,
                    filters: single_filter(FilterSlot::new(filter, 0)),
                    ..Default::default()
                };
                for src in &inputs {
                    let chunk = compress(&cparams, src).unwrap();
                    assert_eq!(&decompress(&chunk).unwrap(), src, "codec {codec} filter {filter} clevel {clevel}");
                }
            }
        }
    }
}

#[test]
fn compressed_size_never_exceeds_bound() {
    init();
    for len in [0usize, 1, 31, 32, 33, 1000, 65_536, 200_003] {
        let src = noisy(len, len as u64 + 11);
        for codec in [CODEC_LZ4, CODEC_ZSTD, CODEC_RLE] {
            let chunk = compress(&CParams { codec, typesize: 1, ..Default::default() }, &src).unwrap();
            assert!(chunk.len() <= src.len() + HEADER_SIZE, "len {len} codec {codec}: {}", chunk.len());
        }
    }
}

#[test]
fn thread_count_never_changes_output() {
    init();
    let src = int32s(0, 300_000);
    let base = CParams { typesize: 4, blocksize: 32 * 1024, ..Default::default() };
    let single = compress(&CParams { nthreads: 1, ..base.clone() }, &src).unwrap();
    for nthreads in [2, 3, 8] {
        let multi = compress(&CParams { nthreads, ..base.clone() }, &src).unwrap();
        assert_eq!(single, multi, "nthreads {nthreads}");
        let dctx = DecompressionContext::new(DParams { nthreads, ..Default::default() }).unwrap();
        assert_eq!(dctx.decompress(&multi).unwrap(), src);
    }
}

#[test]
fn zero_chunk_decodes_without_block_data() {
    init();
    let mut ctx = CompressionContext::new(CParams { typesize: 4, ..Default::default() }).unwrap();
    let chunk = ctx.chunk_zeros(1 << 20).unwrap();
    assert_eq!(chunk.len(), HEADER_SIZE);
    let out = decompress(&chunk).unwrap();
    assert_eq!(out.len(), 1 << 20);
    assert!(out.iter().all(|&b| b == 0));
}

#[test]
fn getitem_reads_only_requested_items() {
    init();
    let src = int32s(0, 50_000);
    let mut ctx = CompressionContext::new(CParams { typesize: 4, blocksize: 4096, ..Default::default() }).unwrap();
    let chunk = ctx.compress(&src).unwrap();
    assert_eq!(ctx.effective_blocksize(), 4096);
    let dctx = DecompressionContext::new(DParams::default()).unwrap();
    let mut out = vec![0u8; 400];
    dctx.getitem(&chunk, 12_345, 100, &mut out).unwrap();
    assert_eq!(out, int32s(12_345, 100));
}

#[test]
fn index_tracks_insert_update_delete() {
    init();
    let cparams = CParams { typesize: 4, ..Default::default() };
    let mut schunk = SuperChunk::new(Storage { cparams: cparams.clone(), ..Default::default() }).unwrap();
    let mut model: Vec<Vec<u8>> = Vec::new();
    for i in 0..6 {
        let raw = int32s(i * 1000, 256);
        schunk.append_buffer(&raw).unwrap();
        model.push(raw);
    }
    let raw = int32s(-7, 256);
    schunk.insert_chunk(2, compress(&cparams, &raw).unwrap()).unwrap();
    model.insert(2, raw);
    let raw = int32s(77, 256);
    schunk.update_chunk(5, compress(&cparams, &raw).unwrap()).unwrap();
    model[5] = raw;
    schunk.delete_chunk(0).unwrap();
    model.remove(0);
    schunk.delete_chunk(model.len() - 1).unwrap();
    model.pop();

    assert_eq!(schunk.nchunks(), model.len());
    for (i, want) in model.iter().enumerate() {
        let mut out = vec![0u8; 1024];
        schunk.decompress_chunk(i, &mut out).unwrap();
        assert_eq!(&out, want, "chunk {i}");
    }
    assert_eq!(schunk.recompute_totals().unwrap(), (schunk.nbytes(), schunk.cbytes()));

    let mut small = vec![0u8; 10];
    let err = schunk.decompress_chunk(0, &mut small).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BufferTooSmall);
    assert_eq!(schunk.delete_chunk(99).unwrap_err().kind(), ErrorKind::OutOfRange);
}

#[test]
fn frame_file_roundtrip() {
    init();
    let file = NamedTempFile::new().unwrap();
    let cparams = CParams { typesize: 8, codec: CODEC_ZSTD, clevel: 7, ..Default::default() };
    let mut schunk = SuperChunk::new(Storage { cparams, ..Default::default() }).unwrap();
    let data: Vec<u8> = (0..40_000u64).flat_map(|v| (v * v).to_le_bytes()).collect();
    for piece in data.chunks(64 * 1024) {
        schunk.append_buffer(piece).unwrap();
    }
    schunk.meta_add("dtype", b"<u8").unwrap();
    schunk.vlmeta_add("description", b"squares").unwrap();

    let len = schunk.to_file(file.path()).unwrap();
    assert_eq!(len, std::fs::metadata(file.path()).unwrap().len());
    assert_eq!(std::fs::read(file.path()).unwrap(), schunk.to_buffer().unwrap());

    let opened = SuperChunk::open(file.path()).unwrap();
    assert_eq!(opened.nchunks(), schunk.nchunks());
    assert_eq!(opened.cparams().codec, CODEC_ZSTD);
    assert_eq!(opened.meta_get("dtype").unwrap(), b"<u8");
    assert_eq!(opened.vlmeta_get("description").unwrap(), b"squares");
    for i in 0..opened.nchunks() {
        assert_eq!(opened.get_chunk(i).unwrap(), schunk.get_chunk(i).unwrap());
    }
    let mut all = vec![0u8; data.len()];
    opened.get_slice(0, opened.nitems(), &mut all).unwrap();
    assert_eq!(all, data);
    opened.close().unwrap();
}

#[test]
fn file_backed_container_persists_each_mutation() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("grow.frame");
    let storage = Storage {
        urlpath: Some(path.clone()),
        cparams: CParams { typesize: 4, ..Default::default() },
        ..Default::default()
    };
    let mut schunk = SuperChunk::new(storage).unwrap();
    schunk.append_buffer(&int32s(0, 1024)).unwrap();
    schunk.append_buffer(&int32s(1024, 1024)).unwrap();
    schunk.set_slice(1000, 1100, &int32s(-100, 100)).unwrap();
    schunk.vlmeta_add("note", b"patched").unwrap();

    // The file is complete without closing.
    let snapshot = SuperChunk::open(&path).unwrap();
    let mut out = vec![0u8; 400];
    snapshot.get_slice(1000, 1100, &mut out).unwrap();
    assert_eq!(out, int32s(-100, 100));
    assert_eq!(snapshot.vlmeta_get("note").unwrap(), b"patched");
    drop(snapshot);
    schunk.close().unwrap();

    supchunk::remove_urlpath(&path).unwrap();
    assert!(!path.exists());
    assert_eq!(supchunk::remove_urlpath(&path).unwrap_err().kind(), ErrorKind::NotFound);
}

#[test]
fn corrupt_frame_is_rejected() {
    init();
    let mut schunk = SuperChunk::new(Storage::default()).unwrap();
    schunk.append_buffer(&int32s(0, 4096)).unwrap();
    let mut frame = schunk.to_buffer().unwrap();
    let mid = frame.len() / 2;
    frame[mid] ^= 0x55;
    assert_eq!(SuperChunk::from_buffer(&frame).unwrap_err().kind(), ErrorKind::DataCorrupt);
    assert_eq!(SuperChunk::from_buffer(&frame[..10]).unwrap_err().kind(), ErrorKind::InvalidHeader);
}

#[test]
fn storage_loads_from_json() {
    init();
    let storage = Storage::from_json(
        r#"{"cparams": {"codec": 5, "clevel": 3, "typesize": 2, "splitmode": "never"}, "dparams": {"nthreads": 2}}"#,
    )
    .unwrap();
    assert!(storage.urlpath.is_none());
    let schunk = SuperChunk::new(storage).unwrap();
    assert_eq!(schunk.cparams().codec, CODEC_ZSTD);
    assert_eq!(schunk.typesize(), 2);
    assert_eq!(schunk.dparams().nthreads, 2);
    assert_eq!(schunk.cparams().filters, CParams::default().filters);
}
