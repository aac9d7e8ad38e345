//! Codec registry: numeric codec IDs mapped to encode/decode capabilities.
//!
//! # Identity rules
//! Every codec is identified by a one-byte ID.  That ID is written into
//! every chunk header and is the only thing a reader needs to pick the
//! decoder.  IDs below [`USER_CODEC_START`] are reserved for the built-in
//! codecs; IDs in `USER_CODEC_START..=255` are assignable by callers via
//! [`register_codec`].
//!
//! # Thread safety
//! The table is process-wide and guarded by an `RwLock`.  Registration is
//! expected to finish before concurrent compression begins; a codec
//! registered while other threads compress becomes visible to chunks
//! started after the write lock is released, never mid-chunk.

mod rle;

use std::collections::BTreeMap;
use std::io;
use std::sync::{Arc, OnceLock, RwLock};

use log::debug;
use thiserror::Error;

pub use rle::RleCodec;

// ── Frozen codec IDs ────────────────────────────────────────────────────────
//
// These values are permanent: they appear in every chunk header on disk.

/// Reference in-process run-length codec.
pub const CODEC_RLE:  u8 = 0;
/// LZ4 block format (no size prefix; the chunk header carries the size).
pub const CODEC_LZ4:  u8 = 1;
/// Zstandard.
pub const CODEC_ZSTD: u8 = 5;

/// First ID a caller may register.
pub const USER_CODEC_START: u8 = 160;

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum CodecError {
    /// The encoder could not fit its output in the capacity it was given.
    /// The block compressor treats this as "store raw", not as a failure.
    #[error("Compressed output exceeds capacity of {capacity} bytes")]
    Overflow { capacity: usize },
    #[error("Compression error: {0}")]
    Compression(String),
    /// Input is truncated or malformed.
    #[error("Corrupt compressed stream: {0}")]
    Corrupt(String),
    /// The stream is valid but decodes to more bytes than were expected.
    #[error("Decoded output needs {needed} bytes, only {available} available")]
    OutputTooSmall { needed: usize, available: usize },
    #[error("Codec id {0} is not registered")]
    UnknownCodec(u8),
    #[error("Codec id {0} is already registered")]
    AlreadyRegistered(u8),
    #[error("Codec id {0} is outside the user-assignable range {USER_CODEC_START}..=255")]
    ReservedId(u8),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

// ── Codec trait ──────────────────────────────────────────────────────────────

/// Encode/decode capability for one codec ID.
///
/// `compress` must return at most `capacity` bytes or fail with
/// [`CodecError::Overflow`].  `decompress` is handed the exact decoded
/// length the chunk header promises and must produce exactly that many
/// bytes.
pub trait Codec: Send + Sync {
    fn name(&self) -> &str;
    fn compress(&self, data: &[u8], level: u8, meta: u8, capacity: usize) -> Result<Vec<u8>, CodecError>;
    fn decompress(&self, data: &[u8], meta: u8, expected_len: usize) -> Result<Vec<u8>, CodecError>;
}

// ── Built-in codec implementations ──────────────────────────────────────────

pub struct Lz4Codec;
impl Codec for Lz4Codec {
    fn name(&self) -> &str { "lz4" }
    fn compress(&self, data: &[u8], _: u8, _: u8, capacity: usize) -> Result<Vec<u8>, CodecError> {
        let out = lz4_flex::block::compress(data);
        if out.len() > capacity {
            return Err(CodecError::Overflow { capacity });
        }
        Ok(out)
    }
    fn decompress(&self, data: &[u8], _: u8, expected_len: usize) -> Result<Vec<u8>, CodecError> {
        use lz4_flex::block::DecompressError;
        let out = lz4_flex::block::decompress(data, expected_len).map_err(|e| match e {
            DecompressError::OutputTooSmall { expected, actual } => {
                CodecError::OutputTooSmall { needed: expected, available: actual }
            }
            other => CodecError::Corrupt(other.to_string()),
        })?;
        if out.len() != expected_len {
            return Err(CodecError::Corrupt(format!(
                "lz4 stream decoded to {} bytes, expected {expected_len}", out.len()
            )));
        }
        Ok(out)
    }
}

pub struct ZstdCodec;
impl ZstdCodec {
    /// Map the 1–9 compression level onto zstd's 1–19 scale.
    fn zstd_level(level: u8) -> i32 {
        (i32::from(level) * 2 + 1).clamp(1, 19)
    }
}
impl Codec for ZstdCodec {
    fn name(&self) -> &str { "zstd" }
    fn compress(&self, data: &[u8], level: u8, _: u8, capacity: usize) -> Result<Vec<u8>, CodecError> {
        let out = zstd::bulk::compress(data, Self::zstd_level(level))
            .map_err(|e| CodecError::Compression(e.to_string()))?;
        if out.len() > capacity {
            return Err(CodecError::Overflow { capacity });
        }
        Ok(out)
    }
    fn decompress(&self, data: &[u8], _: u8, expected_len: usize) -> Result<Vec<u8>, CodecError> {
        let out = zstd::bulk::decompress(data, expected_len)
            .map_err(|e| CodecError::Corrupt(e.to_string()))?;
        if out.len() != expected_len {
            return Err(CodecError::Corrupt(format!(
                "zstd stream decoded to {} bytes, expected {expected_len}", out.len()
            )));
        }
        Ok(out)
    }
}

// ── Registry ─────────────────────────────────────────────────────────────────

type CodecTable = BTreeMap<u8, Arc<dyn Codec>>;

static REGISTRY: OnceLock<RwLock<CodecTable>> = OnceLock::new();

fn builtin_table() -> CodecTable {
    let mut table: CodecTable = BTreeMap::new();
    table.insert(CODEC_RLE,  Arc::new(RleCodec));
    table.insert(CODEC_LZ4,  Arc::new(Lz4Codec));
    table.insert(CODEC_ZSTD, Arc::new(ZstdCodec));
    table
}

fn registry() -> &'static RwLock<CodecTable> {
    REGISTRY.get_or_init(|| RwLock::new(builtin_table()))
}

/// Register a user codec under `id`.
///
/// Fails with [`CodecError::ReservedId`] below [`USER_CODEC_START`] and
/// with [`CodecError::AlreadyRegistered`] if `id` is taken.
pub fn register_codec(id: u8, codec: Arc<dyn Codec>) -> Result<(), CodecError> {
    if id < USER_CODEC_START {
        return Err(CodecError::ReservedId(id));
    }
    let mut table = registry().write().unwrap_or_else(|e| e.into_inner());
    if table.contains_key(&id) {
        return Err(CodecError::AlreadyRegistered(id));
    }
    debug!("registering codec '{}' under id {id}", codec.name());
    table.insert(id, codec);
    Ok(())
}

/// Resolve a codec ID to its implementation.
pub fn get_codec(id: u8) -> Result<Arc<dyn Codec>, CodecError> {
    let table = registry().read().unwrap_or_else(|e| e.into_inner());
    table.get(&id).cloned().ok_or(CodecError::UnknownCodec(id))
}

/// Human-readable name (for diagnostics only).
pub fn codec_name(id: u8) -> Option<String> {
    get_codec(id).ok().map(|c| c.name().to_owned())
}

/// Reverse lookup by name, case-insensitive.
pub fn codec_id_from_name(name: &str) -> Option<u8> {
    let wanted = name.to_lowercase();
    let table = registry().read().unwrap_or_else(|e| e.into_inner());
    table.iter()
        .find(|(_, c)| c.name().to_lowercase() == wanted)
        .map(|(id, _)| *id)
}

/// `(id, name)` for every registered codec in ID order.
pub fn registered_codecs() -> Vec<(u8, String)> {
    let table = registry().read().unwrap_or_else(|e| e.into_inner());
    table.iter().map(|(id, c)| (*id, c.name().to_owned())).collect()
}

pub(crate) fn ensure_builtins() {
    let _ = registry();
}

/// Drop every user-registered codec, keeping the built-ins.
pub(crate) fn clear_user_codecs() {
    let mut table = registry().write().unwrap_or_else(|e| e.into_inner());
    table.retain(|id, _| *id < USER_CODEC_START);
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Passthrough;
    impl Codec for Passthrough {
        fn name(&self) -> &str { "passthrough-test" }
        fn compress(&self, data: &[u8], _: u8, _: u8, capacity: usize) -> Result<Vec<u8>, CodecError> {
            if data.len() > capacity {
                return Err(CodecError::Overflow { capacity });
            }
            Ok(data.to_vec())
        }
        fn decompress(&self, data: &[u8], _: u8, _: usize) -> Result<Vec<u8>, CodecError> {
            Ok(data.to_vec())
        }
    }

    #[test]
    fn builtins_resolve() {
        for (id, name) in [(CODEC_RLE, "rle"), (CODEC_LZ4, "lz4"), (CODEC_ZSTD, "zstd")] {
            assert_eq!(get_codec(id).unwrap().name(), name);
            assert_eq!(codec_id_from_name(&name.to_uppercase()), Some(id));
        }
    }

    #[test]
    fn unknown_codec_is_not_found() {
        assert!(matches!(get_codec(99), Err(CodecError::UnknownCodec(99))));
    }

    #[test]
    fn register_rejects_reserved_and_duplicate_ids() {
        assert!(matches!(
            register_codec(CODEC_LZ4, Arc::new(Passthrough)),
            Err(CodecError::ReservedId(_))
        ));
        register_codec(251, Arc::new(Passthrough)).unwrap();
        assert!(matches!(
            register_codec(251, Arc::new(Passthrough)),
            Err(CodecError::AlreadyRegistered(251))
        ));
        assert_eq!(codec_name(251).as_deref(), Some("passthrough-test"));
    }

    #[test]
    fn lz4_and_zstd_roundtrip() {
        let data: Vec<u8> = b"the quick brown fox ".iter().cycle().take(4000).copied().collect();
        for id in [CODEC_LZ4, CODEC_ZSTD] {
            let c = get_codec(id).unwrap();
            let enc = c.compress(&data, 5, 0, data.len()).unwrap();
            assert!(enc.len() < data.len());
            assert_eq!(c.decompress(&enc, 0, data.len()).unwrap(), data);
        }
    }

    #[test]
    fn overflow_when_capacity_too_small() {
        let data: Vec<u8> = (0u8..=255).collect();
        let c = get_codec(CODEC_LZ4).unwrap();
        assert!(matches!(c.compress(&data, 5, 0, 16), Err(CodecError::Overflow { capacity: 16 })));
    }

    #[test]
    fn lz4_truncated_input_is_corrupt() {
        let data = vec![7u8; 2048];
        let c = get_codec(CODEC_LZ4).unwrap();
        let enc = c.compress(&data, 5, 0, data.len()).unwrap();
        let err = c.decompress(&enc[..enc.len() / 2], 0, data.len()).unwrap_err();
        assert!(matches!(err, CodecError::Corrupt(_) | CodecError::OutputTooSmall { .. }));
    }
}
