//! Reusable compression and decompression contexts.
//!
//! A context owns a validated parameter set.  It can be reused for any
//! number of chunks and read back what the last call actually used
//! (notably the block size picked by the heuristic).

use log::trace;

use crate::block;
use crate::error::{Error, Result};
use crate::header::{ChunkHeader, SpecialKind, HEADER_SIZE};
use crate::params::{CParams, DParams};

// ── Compression ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CompressionContext {
    params:         CParams,
    last_blocksize: usize,
}

impl CompressionContext {
    pub fn new(params: CParams) -> Result<Self> {
        params.validate()?;
        Ok(Self { params, last_blocksize: 0 })
    }

    pub fn params(&self) -> &CParams {
        &self.params
    }

    /// Block size used by the most recent `compress*` call (0 before any).
    pub fn effective_blocksize(&self) -> usize {
        self.last_blocksize
    }

    pub fn compress(&mut self, src: &[u8]) -> Result<Vec<u8>> {
        let chunk = block::compress_chunk(&self.params, src)?;
        self.last_blocksize = ChunkHeader::parse(&chunk)?.blocksize as usize;
        Ok(chunk)
    }

    /// Compress into `dest`, returning the chunk length.  `dest` is left
    /// untouched when it is too small.
    pub fn compress_into(&mut self, src: &[u8], dest: &mut [u8]) -> Result<usize> {
        let chunk = self.compress(src)?;
        if dest.len() < chunk.len() {
            return Err(Error::too_small(chunk.len(), dest.len()));
        }
        dest[..chunk.len()].copy_from_slice(&chunk);
        Ok(chunk.len())
    }

    fn special(&mut self, nbytes: usize, kind: SpecialKind, value: Option<&[u8]>) -> Result<Vec<u8>> {
        let chunk = block::special_chunk(&self.params, nbytes, kind, value)?;
        trace!("built {kind:?} chunk for {nbytes} bytes");
        self.last_blocksize = nbytes;
        Ok(chunk)
    }

    pub fn chunk_zeros(&mut self, nbytes: usize) -> Result<Vec<u8>> {
        self.special(nbytes, SpecialKind::Zeros, None)
    }

    /// NaN-filled chunk; typesize must be 4 or 8.
    pub fn chunk_nans(&mut self, nbytes: usize) -> Result<Vec<u8>> {
        self.special(nbytes, SpecialKind::Nan, None)
    }

    /// Chunk whose every item equals `value` (`value.len() == typesize`).
    pub fn chunk_repeatval(&mut self, nbytes: usize, value: &[u8]) -> Result<Vec<u8>> {
        self.special(nbytes, SpecialKind::Value, Some(value))
    }

    /// Chunk with no defined contents.  Decompressing it into a caller
    /// buffer leaves that buffer as it was.
    pub fn chunk_uninit(&mut self, nbytes: usize) -> Result<Vec<u8>> {
        self.special(nbytes, SpecialKind::Uninit, None)
    }
}

// ── Decompression ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct DecompressionContext {
    params: DParams,
}

impl DecompressionContext {
    pub fn new(params: DParams) -> Result<Self> {
        params.validate()?;
        Ok(Self { params })
    }

    pub fn params(&self) -> &DParams {
        &self.params
    }

    pub fn decompress(&self, chunk: &[u8]) -> Result<Vec<u8>> {
        let nbytes = ChunkHeader::parse(chunk)?.nbytes as usize;
        let mut out = vec![0u8; nbytes];
        block::decompress_chunk(&self.params, chunk, &mut out)?;
        Ok(out)
    }

    pub fn decompress_into(&self, chunk: &[u8], dest: &mut [u8]) -> Result<usize> {
        block::decompress_chunk(&self.params, chunk, dest)
    }

    /// Decode `nitems` items starting at item `start` into `dest`.
    pub fn getitem(&self, chunk: &[u8], start: usize, nitems: usize, dest: &mut [u8]) -> Result<usize> {
        block::getitem(&self.params, chunk, start, nitems, dest)
    }
}

// ── One-shot helpers ─────────────────────────────────────────────────────────

pub fn compress(params: &CParams, src: &[u8]) -> Result<Vec<u8>> {
    CompressionContext::new(params.clone())?.compress(src)
}

pub fn decompress(chunk: &[u8]) -> Result<Vec<u8>> {
    DecompressionContext::new(DParams::default())?.decompress(chunk)
}

/// Validated header of `chunk`.
pub fn chunk_info(chunk: &[u8]) -> Result<ChunkHeader> {
    ChunkHeader::parse(chunk)
}

/// `(nbytes, cbytes, blocksize)` of a chunk, from its header alone.
pub fn cbuffer_sizes(chunk: &[u8]) -> Result<(usize, usize, usize)> {
    let h = ChunkHeader::parse(chunk)?;
    Ok((h.nbytes as usize, h.cbytes as usize, h.blocksize as usize))
}

/// Size of the header-only chunk the special constructors produce.
pub const fn special_chunk_len(typesize: usize, repeated_value: bool) -> usize {
    HEADER_SIZE + if repeated_value { typesize } else { 0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CODEC_ZSTD;

    #[test]
    fn context_reports_effective_blocksize() {
        let mut ctx = CompressionContext::new(CParams { typesize: 4, blocksize: 18, ..Default::default() }).unwrap();
        assert_eq!(ctx.effective_blocksize(), 0);
        let src: Vec<u8> = (0u32..16).flat_map(|v| v.to_le_bytes()).collect();
        let chunk = ctx.compress(&src).unwrap();
        assert_eq!(ctx.effective_blocksize(), 16);
        assert_eq!(decompress(&chunk).unwrap(), src);
    }

    #[test]
    fn invalid_params_fail_at_construction() {
        let err = CompressionContext::new(CParams { clevel: 12, ..Default::default() }).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::InvalidParameter);
        assert!(DecompressionContext::new(DParams { nthreads: 0, ..Default::default() }).is_err());
    }

    #[test]
    fn compress_into_checks_capacity() {
        let mut ctx = CompressionContext::new(CParams { codec: CODEC_ZSTD, ..Default::default() }).unwrap();
        let src = vec![3u8; 4096];
        let mut small = [0u8; 8];
        assert_eq!(ctx.compress_into(&src, &mut small).unwrap_err().kind(), crate::ErrorKind::BufferTooSmall);
        let mut dest = vec![0u8; src.len() + HEADER_SIZE];
        let n = ctx.compress_into(&src, &mut dest).unwrap();
        assert_eq!(cbuffer_sizes(&dest[..n]).unwrap().0, src.len());
    }

    #[test]
    fn special_constructors_are_header_only() {
        let mut ctx = CompressionContext::new(CParams { typesize: 8, ..Default::default() }).unwrap();
        assert_eq!(ctx.chunk_zeros(1 << 20).unwrap().len(), special_chunk_len(8, false));
        assert_eq!(ctx.chunk_repeatval(64, &1.5f64.to_le_bytes()).unwrap().len(), special_chunk_len(8, true));
        assert!(ctx.chunk_repeatval(64, &[1, 2]).is_err());

        let nans = ctx.chunk_nans(64).unwrap();
        let out = decompress(&nans).unwrap();
        assert!(out.chunks_exact(8).all(|c| f64::from_ne_bytes(c.try_into().unwrap()).is_nan()));

        let uninit = ctx.chunk_uninit(16).unwrap();
        let mut dest = [9u8; 16];
        DecompressionContext::new(DParams::default()).unwrap().decompress_into(&uninit, &mut dest).unwrap();
        assert_eq!(dest, [9u8; 16]);
    }
}
