//! Chunked, compressed super-container.
//!
//! Data is cut into chunks; each chunk is cut into blocks that run
//! through a stack of byte filters and a codec, in parallel.  Chunks are
//! collected in a [`SuperChunk`] with named metadata and can be written
//! out as a single contiguous frame.
//!
//! Call [`initialize`] before registering user codecs or filters and
//! [`shutdown`] when done with them; the built-ins are always available.

pub mod error;
pub mod filter;
pub mod codec;
pub mod header;
pub mod params;
pub mod pool;
pub mod block;
pub mod context;
pub mod frame;
pub mod io_backend;
pub mod schunk;

pub use error::{Error, ErrorKind, Result};
pub use codec::{register_codec, Codec, CodecError, CODEC_LZ4, CODEC_RLE, CODEC_ZSTD};
pub use filter::{
    register_filter, single_filter, Filter, FilterError, FilterSlot, FilterStack, FILTER_BITSHUFFLE,
    FILTER_DELTA, FILTER_FLOATPRED, FILTER_NOOP, FILTER_SHUFFLE, FILTER_XORDELTA,
};
pub use header::{ChunkHeader, SpecialKind, HEADER_SIZE};
pub use params::{BlockHook, BlockInfo, CParams, DParams, Hook, SplitMode};
pub use pool::{nthreads, set_nthreads};
pub use context::{chunk_info, compress, decompress, CompressionContext, DecompressionContext};
pub use io_backend::{Backend, FileBackend, MemBackend, OpenMode, Stream};
pub use schunk::{remove_urlpath, Fill, Storage, SuperChunk};

/// Make the built-in codecs and filters available.  Idempotent.
pub fn initialize() {
    codec::ensure_builtins();
    filter::ensure_builtins();
    log::debug!("supchunk initialized with {} threads", pool::nthreads());
}

/// Drop user-registered codecs and filters and tear down worker pools.
/// Built-ins stay registered; a later [`initialize`] is not required.
pub fn shutdown() {
    codec::clear_user_codecs();
    filter::clear_user_filters();
    pool::clear_pools();
    log::debug!("supchunk shut down");
}
