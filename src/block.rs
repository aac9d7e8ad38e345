//! Block compressor/decompressor: one logical chunk in, one self-describing
//! compressed chunk out, and back.
//!
//! # Layout after the header
//! ```text
//! [offsets: u32 × nblocks]   only when nblocks > 1, absolute chunk offsets
//! [block 0 section][block 1 section]...
//! ```
//! A block section is one stream, or `typesize` byte-lane streams (plus one
//! for a trailing partial item) when the chunk is flagged split.  Each
//! stream is `u32 len | payload`; the top bit of `len` marks a stream
//! stored raw because the codec could not shrink it.
//!
//! A chunk whose encoding would not beat `HEADER_SIZE + nbytes` is written
//! memcpyed instead: header followed by the raw bytes.  That bounds every
//! chunk at `nbytes + HEADER_SIZE`.

use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use log::trace;

use crate::codec::{self, Codec, CodecError, CODEC_LZ4, CODEC_RLE, CODEC_ZSTD};
use crate::error::{Error, Result};
use crate::filter::{Pipeline, FILTER_SHUFFLE};
use crate::header::{host_flags, ChunkHeader, SpecialKind, FLAG_MEMCPYED, FLAG_SPLIT, HEADER_SIZE, MAX_CHUNK_NBYTES, VERSION};
use crate::params::{BlockInfo, CParams, DParams, Hook, SplitMode};
use crate::pool;

pub const STREAM_HEADER_SIZE: usize = 4;
pub const OFFSET_ENTRY_SIZE:  usize = 4;
const STREAM_MEMCOPY: u32 = 0x8000_0000;

/// Chunks smaller than this always use a single block.
pub const MIN_BUFFERSIZE: usize = 128;
/// Auto split needs at least this many items per block.
const MIN_SPLIT_ITEMS: usize = 32;

// ── Block size ───────────────────────────────────────────────────────────────

/// Block size for a chunk of `nbytes`.
///
/// `forced > 0` is honored (clamped to `nbytes`).  Otherwise the size
/// grows with `clevel`: 32 KiB at 1–3, 64 KiB at 4–5, 128 KiB at 6,
/// 256 KiB at 7–8, 512 KiB at 9, doubled for zstd; clevel 0 and chunks
/// under [`MIN_BUFFERSIZE`] use one block.  The result is rounded down to
/// a whole number of items.
pub fn compute_blocksize(clevel: u8, typesize: usize, codec: u8, nbytes: usize, forced: usize) -> usize {
    if nbytes == 0 {
        return 0;
    }
    let mut bs = if forced > 0 {
        forced
    } else if nbytes < MIN_BUFFERSIZE || clevel == 0 {
        nbytes
    } else {
        let base: usize = match clevel {
            1..=3 => 32 << 10,
            4 | 5 => 64 << 10,
            6     => 128 << 10,
            7 | 8 => 256 << 10,
            _     => 512 << 10,
        };
        if codec == CODEC_ZSTD { base * 2 } else { base }
    };
    bs = bs.min(nbytes);
    let ts = typesize.max(1);
    if ts > 1 && nbytes >= ts {
        bs = (bs / ts * ts).max(ts);
    }
    bs
}

fn use_split(cparams: &CParams, blocksize: usize) -> bool {
    let ts = cparams.typesize;
    match cparams.splitmode {
        SplitMode::Always => ts > 1,
        SplitMode::Never  => false,
        SplitMode::Auto   => {
            (2..=16).contains(&ts)
                && cparams.has_filter(FILTER_SHUFFLE)
                && matches!(cparams.codec, CODEC_RLE | CODEC_LZ4)
                && blocksize / ts >= MIN_SPLIT_ITEMS
        }
    }
}

/// `(start, len)` of every stream inside a block of `block_len` bytes.
fn stream_bounds(block_len: usize, typesize: usize, split: bool) -> Vec<(usize, usize)> {
    let lanes = if split { block_len / typesize.max(1) } else { 0 };
    if !split || typesize < 2 || lanes == 0 {
        return vec![(0, block_len)];
    }
    let mut bounds: Vec<(usize, usize)> = (0..typesize).map(|j| (j * lanes, lanes)).collect();
    let body = typesize * lanes;
    if body < block_len {
        bounds.push((body, block_len - body));
    }
    bounds
}

// ── Compression ──────────────────────────────────────────────────────────────

struct Encoder {
    pipeline:   Pipeline,
    codec:      Arc<dyn Codec>,
    codec_id:   u8,
    clevel:     u8,
    codec_meta: u8,
    typesize:   usize,
    split:      bool,
}

impl Encoder {
    fn encode_block(&self, nblock: usize, block: &[u8]) -> Result<Vec<u8>> {
        let filtered = self.pipeline.forward(block.to_vec())?;
        let bounds   = stream_bounds(filtered.len(), self.typesize, self.split);
        let mut out  = Vec::with_capacity(filtered.len() + bounds.len() * STREAM_HEADER_SIZE);
        for (start, len) in bounds {
            let stream   = &filtered[start..start + len];
            let capacity = len.saturating_sub(STREAM_HEADER_SIZE);
            let encoded  = if capacity == 0 {
                None
            } else {
                match self.codec.compress(stream, self.clevel, self.codec_meta, capacity) {
                    Ok(enc) if enc.len() <= capacity => Some(enc),
                    Ok(_) | Err(CodecError::Overflow { .. }) => None,
                    Err(e) => {
                        trace!("codec {} failed on block {nblock}, storing raw: {e}", self.codec_id);
                        None
                    }
                }
            };
            match encoded {
                Some(enc) => {
                    out.write_u32::<LittleEndian>(enc.len() as u32)?;
                    out.extend_from_slice(&enc);
                }
                None => {
                    out.write_u32::<LittleEndian>(len as u32 | STREAM_MEMCOPY)?;
                    out.extend_from_slice(stream);
                }
            }
        }
        Ok(out)
    }
}

fn base_header(cparams: &CParams, nbytes: usize, blocksize: usize) -> ChunkHeader {
    ChunkHeader {
        version:    VERSION,
        flags:      host_flags(),
        typesize:   cparams.typesize as u8,
        codec:      cparams.codec,
        codec_meta: cparams.codec_meta,
        clevel:     cparams.clevel,
        nbytes:     nbytes as u32,
        blocksize:  blocksize as u32,
        cbytes:     HEADER_SIZE as u32,
        filters:    cparams.filters,
    }
}

fn memcpyed_chunk(mut header: ChunkHeader, data: &[u8]) -> Vec<u8> {
    header.flags |= FLAG_MEMCPYED;
    header.flags &= !FLAG_SPLIT;
    header.cbytes = (HEADER_SIZE + data.len()) as u32;
    let mut out = Vec::with_capacity(HEADER_SIZE + data.len());
    out.extend_from_slice(&header.to_bytes());
    out.extend_from_slice(data);
    out
}

fn run_hook(hook: &Hook, nblock: usize, offset: usize, typesize: usize, src: &[u8]) -> Result<Vec<u8>> {
    let mut out = vec![0u8; src.len()];
    hook.0.process(&BlockInfo { nblock, offset, typesize, src }, &mut out)?;
    Ok(out)
}

/// Compress `src` into a new chunk.  `cparams` must already be validated.
pub(crate) fn compress_chunk(cparams: &CParams, src: &[u8]) -> Result<Vec<u8>> {
    let nbytes = src.len();
    if nbytes > MAX_CHUNK_NBYTES {
        return Err(Error::invalid(format!("source of {nbytes} bytes exceeds the chunk limit")));
    }
    let blocksize = compute_blocksize(cparams.clevel, cparams.typesize, cparams.codec, nbytes, cparams.blocksize);
    let mut header = base_header(cparams, nbytes, blocksize);
    if nbytes == 0 {
        return Ok(header.to_bytes().to_vec());
    }
    let nblocks  = nbytes.div_ceil(blocksize);
    let nthreads = cparams.nthreads;
    let span     = |i: usize| (i * blocksize, ((i + 1) * blocksize).min(nbytes));

    let prefiltered;
    let source: &[u8] = match &cparams.prefilter {
        Some(hook) => {
            let blocks = pool::map_blocks(nthreads, nblocks, |i| {
                let (s, e) = span(i);
                run_hook(hook, i, s, cparams.typesize, &src[s..e])
            })?;
            prefiltered = blocks.concat();
            &prefiltered
        }
        None => src,
    };

    if cparams.clevel == 0 {
        return Ok(memcpyed_chunk(header, source));
    }

    let split = use_split(cparams, blocksize);
    let encoder = Encoder {
        pipeline:   Pipeline::new(&cparams.filters, cparams.typesize)?,
        codec:      codec::get_codec(cparams.codec)?,
        codec_id:   cparams.codec,
        clevel:     cparams.clevel,
        codec_meta: cparams.codec_meta,
        typesize:   cparams.typesize,
        split,
    };
    let sections = pool::map_blocks(nthreads, nblocks, |i| {
        let (s, e) = span(i);
        encoder.encode_block(i, &source[s..e])
    })?;

    let index_len = if nblocks > 1 { nblocks * OFFSET_ENTRY_SIZE } else { 0 };
    let total = HEADER_SIZE + index_len + sections.iter().map(Vec::len).sum::<usize>();
    if total >= HEADER_SIZE + nbytes {
        trace!("chunk of {nbytes} bytes did not compress, storing memcpyed");
        return Ok(memcpyed_chunk(header, source));
    }

    if split {
        header.flags |= FLAG_SPLIT;
    }
    header.cbytes = total as u32;
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&header.to_bytes());
    if nblocks > 1 {
        let mut offset = HEADER_SIZE + index_len;
        for section in &sections {
            out.write_u32::<LittleEndian>(offset as u32)?;
            offset += section.len();
        }
    }
    for section in &sections {
        out.extend_from_slice(section);
    }
    trace!(
        "compressed {nbytes} -> {total} bytes in {nblocks} blocks (codec {}, split {split})",
        cparams.codec
    );
    Ok(out)
}

// ── Special chunks ───────────────────────────────────────────────────────────

/// Header-only chunk standing for `nbytes` of zeros, NaNs, a repeated
/// value or uninitialized memory.
pub(crate) fn special_chunk(cparams: &CParams, nbytes: usize, kind: SpecialKind, value: Option<&[u8]>) -> Result<Vec<u8>> {
    if nbytes > MAX_CHUNK_NBYTES {
        return Err(Error::invalid(format!("special chunk of {nbytes} bytes exceeds the chunk limit")));
    }
    let ts = cparams.typesize;
    match kind {
        SpecialKind::Nan if !matches!(ts, 4 | 8) => {
            return Err(Error::invalid(format!("NaN chunks need typesize 4 or 8, got {ts}")));
        }
        SpecialKind::Value => {
            let v = value.ok_or_else(|| Error::invalid("repeated-value chunk needs a value"))?;
            if ts == 0 || v.len() != ts {
                return Err(Error::invalid(format!("value of {} bytes does not match typesize {ts}", v.len())));
            }
        }
        _ => {}
    }
    let mut header = base_header(cparams, nbytes, nbytes);
    header.set_special(kind);
    let payload = if kind == SpecialKind::Value { value.unwrap_or(&[]) } else { &[] };
    header.cbytes = (HEADER_SIZE + payload.len()) as u32;
    let mut out = header.to_bytes().to_vec();
    out.extend_from_slice(payload);
    Ok(out)
}

fn nan_pattern(typesize: u8) -> Vec<u8> {
    if typesize == 4 { f32::NAN.to_ne_bytes().to_vec() } else { f64::NAN.to_ne_bytes().to_vec() }
}

/// Fill `dest` with the special value; `dest` starts at logical byte
/// `begin` of the chunk.
fn fill_special(header: &ChunkHeader, chunk: &[u8], kind: SpecialKind, begin: usize, dest: &mut [u8]) {
    match kind {
        SpecialKind::Zeros  => dest.fill(0),
        SpecialKind::Uninit => {}
        SpecialKind::Nan | SpecialKind::Value => {
            let pattern = if kind == SpecialKind::Nan {
                nan_pattern(header.typesize)
            } else {
                chunk[HEADER_SIZE..HEADER_SIZE + usize::from(header.typesize)].to_vec()
            };
            let phase = begin % pattern.len().max(1);
            for (d, p) in dest.iter_mut().zip(pattern.iter().cycle().skip(phase)) {
                *d = *p;
            }
        }
    }
}

// ── Decompression ────────────────────────────────────────────────────────────

struct Decoder<'a> {
    chunk:     &'a [u8],
    header:    &'a ChunkHeader,
    pipeline:  Option<Pipeline>,
    codec:     Option<Arc<dyn Codec>>,
    postfilter: Option<&'a Hook>,
}

impl<'a> Decoder<'a> {
    fn new(chunk: &'a [u8], header: &'a ChunkHeader, dparams: &'a DParams) -> Result<Self> {
        let (pipeline, codec) = if header.is_memcpyed() || header.special_kind().is_some() {
            (None, None)
        } else {
            (
                Some(Pipeline::new(&header.filters, usize::from(header.typesize))?),
                Some(codec::get_codec(header.codec)?),
            )
        };
        Ok(Self { chunk, header, pipeline, codec, postfilter: dparams.postfilter.as_ref() })
    }

    fn block_start(&self, nblock: usize) -> usize {
        nblock * self.header.blocksize as usize
    }

    fn section(&self, nblock: usize) -> Result<&'a [u8]> {
        let nblocks = self.header.nblocks();
        let cbytes  = self.header.cbytes as usize;
        if nblocks == 1 {
            return Ok(&self.chunk[HEADER_SIZE..cbytes]);
        }
        let index_end = HEADER_SIZE + nblocks * OFFSET_ENTRY_SIZE;
        if index_end > cbytes {
            return Err(Error::corrupt("offsets index runs past the end of the chunk"));
        }
        let entry = |i: usize| {
            let p = HEADER_SIZE + i * OFFSET_ENTRY_SIZE;
            LittleEndian::read_u32(&self.chunk[p..p + OFFSET_ENTRY_SIZE]) as usize
        };
        let start = entry(nblock);
        let end   = if nblock + 1 < nblocks { entry(nblock + 1) } else { cbytes };
        if start < index_end || start > end || end > cbytes {
            return Err(Error::corrupt(format!("block {nblock} has bad offsets {start}..{end}")));
        }
        Ok(&self.chunk[start..end])
    }

    /// Raw (unfiltered) contents of block `nblock`, before any postfilter.
    fn decode_block(&self, nblock: usize) -> Result<Vec<u8>> {
        let block_len = self.header.block_len(nblock);
        let start     = self.block_start(nblock);
        if self.header.is_memcpyed() {
            return Ok(self.chunk[HEADER_SIZE + start..HEADER_SIZE + start + block_len].to_vec());
        }
        let (Some(pipeline), Some(codec)) = (&self.pipeline, &self.codec) else {
            return Err(Error::corrupt("no decoder for this chunk"));
        };
        let section  = self.section(nblock)?;
        let bounds   = stream_bounds(block_len, usize::from(self.header.typesize), self.header.is_split());
        let mut filtered = vec![0u8; block_len];
        let mut pos = 0usize;
        for (s_start, s_len) in bounds {
            if pos + STREAM_HEADER_SIZE > section.len() {
                return Err(Error::corrupt(format!("block {nblock}: truncated stream header")));
            }
            let word = LittleEndian::read_u32(&section[pos..pos + STREAM_HEADER_SIZE]);
            pos += STREAM_HEADER_SIZE;
            let clen = (word & !STREAM_MEMCOPY) as usize;
            if pos + clen > section.len() {
                return Err(Error::corrupt(format!("block {nblock}: stream overruns its section")));
            }
            let payload = &section[pos..pos + clen];
            pos += clen;
            let target = &mut filtered[s_start..s_start + s_len];
            if word & STREAM_MEMCOPY != 0 {
                if clen != s_len {
                    return Err(Error::corrupt(format!(
                        "block {nblock}: raw stream of {clen} bytes, expected {s_len}"
                    )));
                }
                target.copy_from_slice(payload);
            } else {
                let decoded = codec
                    .decompress(payload, self.header.codec_meta, s_len)
                    .map_err(|e| match e {
                        CodecError::OutputTooSmall { .. } => Error::corrupt(format!(
                            "block {nblock}: stream decodes past its declared size ({e})"
                        )),
                        other => Error::from(other),
                    })?;
                if decoded.len() != s_len {
                    return Err(Error::corrupt(format!(
                        "block {nblock}: decoded {} bytes, expected {s_len}", decoded.len()
                    )));
                }
                target.copy_from_slice(&decoded);
            }
        }
        if pos != section.len() {
            return Err(Error::corrupt(format!("block {nblock}: {} trailing bytes", section.len() - pos)));
        }
        Ok(pipeline.backward(filtered)?)
    }

    /// Decoded block with the postfilter, if any, applied.
    fn finished_block(&self, nblock: usize) -> Result<Vec<u8>> {
        let raw = self.decode_block(nblock)?;
        match self.postfilter {
            Some(hook) => run_hook(hook, nblock, self.block_start(nblock), usize::from(self.header.typesize), &raw),
            None       => Ok(raw),
        }
    }
}

/// Decompress a whole chunk into `dest`, returning `nbytes`.
pub(crate) fn decompress_chunk(dparams: &DParams, chunk: &[u8], dest: &mut [u8]) -> Result<usize> {
    let header = ChunkHeader::parse(chunk)?;
    let nbytes = header.nbytes as usize;
    if dest.len() < nbytes {
        return Err(Error::too_small(nbytes, dest.len()));
    }
    if let Some(kind) = header.special_kind() {
        fill_special(&header, chunk, kind, 0, &mut dest[..nbytes]);
        return Ok(nbytes);
    }
    if nbytes == 0 {
        return Ok(0);
    }
    if header.is_memcpyed() && dparams.postfilter.is_none() {
        dest[..nbytes].copy_from_slice(&chunk[HEADER_SIZE..HEADER_SIZE + nbytes]);
        return Ok(nbytes);
    }
    let decoder = Decoder::new(chunk, &header, dparams)?;
    pool::for_each_span_mut(dparams.nthreads, &mut dest[..nbytes], header.blocksize as usize, |i, out| {
        let block = decoder.finished_block(i)?;
        out.copy_from_slice(&block);
        Ok(())
    })?;
    Ok(nbytes)
}

/// Decompress `nitems` items starting at item `start`, touching only the
/// blocks that overlap the range.  Returns the number of bytes written.
pub(crate) fn getitem(dparams: &DParams, chunk: &[u8], start: usize, nitems: usize, dest: &mut [u8]) -> Result<usize> {
    let header = ChunkHeader::parse(chunk)?;
    let item   = header.item_size();
    let nbytes = header.nbytes as usize;
    let first  = start.checked_mul(item);
    let last   = start.checked_add(nitems).and_then(|e| e.checked_mul(item));
    match (first, last) {
        (Some(b), Some(e)) if e <= nbytes => get_range(dparams, chunk, &header, b, e, dest),
        _ => Err(Error::out_of_range(format!(
            "items {start}..{} outside chunk of {} items", start.saturating_add(nitems), nbytes / item
        ))),
    }
}

/// Decompress the logical byte range `begin..end` of a chunk whose header
/// has already been parsed.
pub(crate) fn get_range(dparams: &DParams, chunk: &[u8], header: &ChunkHeader, begin: usize, end: usize, dest: &mut [u8]) -> Result<usize> {
    if begin > end || end > header.nbytes as usize {
        return Err(Error::out_of_range(format!("bytes {begin}..{end} outside chunk of {}", header.nbytes)));
    }
    let len = end - begin;
    if dest.len() < len {
        return Err(Error::too_small(len, dest.len()));
    }
    if len == 0 {
        return Ok(0);
    }
    if let Some(kind) = header.special_kind() {
        fill_special(header, chunk, kind, begin, &mut dest[..len]);
        return Ok(len);
    }
    if header.is_memcpyed() && dparams.postfilter.is_none() {
        dest[..len].copy_from_slice(&chunk[HEADER_SIZE + begin..HEADER_SIZE + end]);
        return Ok(len);
    }

    let bs          = header.blocksize as usize;
    let first_block = begin / bs;
    let last_block  = (end - 1) / bs;
    let decoder = Decoder::new(chunk, header, dparams)?;
    let blocks = pool::map_blocks(dparams.nthreads, last_block - first_block + 1, |k| {
        decoder.finished_block(first_block + k)
    })?;
    let mut written = 0usize;
    for (k, block) in blocks.iter().enumerate() {
        let block_start = (first_block + k) * bs;
        let from = begin.max(block_start) - block_start;
        let to   = end.min(block_start + block.len()) - block_start;
        dest[written..written + (to - from)].copy_from_slice(&block[from..to]);
        written += to - from;
    }
    Ok(written)
}
