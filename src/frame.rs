//! Contiguous serialized form of a super-chunk.
//!
//! ```text
//! ┌──────────────────────────────┐ 0
//! │ FrameHeader (80 B)           │
//! ├──────────────────────────────┤ index_off
//! │ u64 × nchunks chunk offsets  │ relative to the data section
//! ├──────────────────────────────┤ data_off = index_off + 8·nchunks
//! │ chunk 0 | chunk 1 | ...      │
//! ├──────────────────────────────┤ meta_off
//! │ fixed metalayers             │
//! ├──────────────────────────────┤ vlmeta_off
//! │ variable metalayers          │ content compressed
//! ├──────────────────────────────┤
//! │ Trailer (40 B)               │ crc32 covers everything above it
//! └──────────────────────────────┘ frame_len
//! ```
//!
//! Everything is little-endian.  The trailer is read first on open, so a
//! frame can be indexed without scanning its chunks.

use std::io::{self, Read, Seek, SeekFrom, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::debug;

use crate::error::{Error, Result};
use crate::filter::{FilterSlot, FilterStack, MAX_FILTERS};
use crate::header::ChunkHeader;
use crate::params::SplitMode;

pub const FRAME_MAGIC:       [u8; 8] = *b"SCHKFRM\0";
pub const FRAME_VERSION:     u32     = 1;
pub const FRAME_HEADER_SIZE: usize   = 80;
pub const TRAILER_MAGIC:     [u8; 4] = *b"SCKT";
pub const TRAILER_SIZE:      usize   = 40;

const CHUNKSIZE_UNSET: u64 = u64::MAX;
const CRC_READ_STEP:   usize = 64 * 1024;

// ── Header ───────────────────────────────────────────────────────────────────

/// Container-wide values persisted at the start of a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub nchunks:    u64,
    pub nbytes:     u64,
    pub cbytes:     u64,
    pub chunksize:  Option<u64>,
    pub typesize:   u8,
    pub codec:      u8,
    pub codec_meta: u8,
    pub clevel:     u8,
    pub splitmode:  SplitMode,
    pub filters:    FilterStack,
    pub blocksize:  u32,
}

fn splitmode_code(mode: SplitMode) -> u8 {
    match mode {
        SplitMode::Always => 0,
        SplitMode::Never  => 1,
        SplitMode::Auto   => 2,
    }
}

impl FrameHeader {
    pub fn write<W: Write>(&self, mut w: W) -> io::Result<()> {
        w.write_all(&FRAME_MAGIC)?;
        w.write_u32::<LittleEndian>(FRAME_VERSION)?;
        w.write_u32::<LittleEndian>(FRAME_HEADER_SIZE as u32)?;
        w.write_u64::<LittleEndian>(self.nchunks)?;
        w.write_u64::<LittleEndian>(self.nbytes)?;
        w.write_u64::<LittleEndian>(self.cbytes)?;
        w.write_u64::<LittleEndian>(self.chunksize.unwrap_or(CHUNKSIZE_UNSET))?;
        w.write_u8(self.typesize)?;
        w.write_u8(self.codec)?;
        w.write_u8(self.codec_meta)?;
        w.write_u8(self.clevel)?;
        w.write_u8(splitmode_code(self.splitmode))?;
        for slot in &self.filters {
            w.write_u8(slot.id)?;
        }
        for slot in &self.filters {
            w.write_u8(slot.meta)?;
        }
        w.write_u32::<LittleEndian>(self.blocksize)?;
        w.write_all(&[0u8; 11])?;
        Ok(())
    }

    pub fn read<R: Read>(mut r: R) -> Result<Self> {
        let mut magic = [0u8; 8];
        r.read_exact(&mut magic)?;
        if magic != FRAME_MAGIC {
            return Err(Error::header("bad frame magic"));
        }
        let version = r.read_u32::<LittleEndian>()?;
        if version == 0 || version > FRAME_VERSION {
            return Err(Error::header(format!("unsupported frame version {version}")));
        }
        let header_len = r.read_u32::<LittleEndian>()?;
        if header_len as usize != FRAME_HEADER_SIZE {
            return Err(Error::header(format!("frame header length {header_len}")));
        }
        let nchunks    = r.read_u64::<LittleEndian>()?;
        let nbytes     = r.read_u64::<LittleEndian>()?;
        let cbytes     = r.read_u64::<LittleEndian>()?;
        let chunksize  = r.read_u64::<LittleEndian>()?;
        let typesize   = r.read_u8()?;
        let codec      = r.read_u8()?;
        let codec_meta = r.read_u8()?;
        let clevel     = r.read_u8()?;
        let splitmode  = match r.read_u8()? {
            0 => SplitMode::Always,
            1 => SplitMode::Never,
            2 => SplitMode::Auto,
            other => return Err(Error::header(format!("unknown split mode {other}"))),
        };
        let mut filters = [FilterSlot::noop(); MAX_FILTERS];
        for slot in filters.iter_mut() {
            slot.id = r.read_u8()?;
        }
        for slot in filters.iter_mut() {
            slot.meta = r.read_u8()?;
        }
        let blocksize = r.read_u32::<LittleEndian>()?;
        let mut pad = [0u8; 11];
        r.read_exact(&mut pad)?;
        Ok(Self {
            nchunks,
            nbytes,
            cbytes,
            chunksize: (chunksize != CHUNKSIZE_UNSET).then_some(chunksize),
            typesize,
            codec,
            codec_meta,
            clevel,
            splitmode,
            filters,
            blocksize,
        })
    }
}

// ── Trailer ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trailer {
    pub index_off:  u64,
    pub meta_off:   u64,
    pub vlmeta_off: u64,
    pub crc32:      u32,
    pub frame_len:  u64,
}

impl Trailer {
    pub fn write<W: Write>(&self, mut w: W) -> io::Result<()> {
        w.write_u64::<LittleEndian>(self.index_off)?;
        w.write_u64::<LittleEndian>(self.meta_off)?;
        w.write_u64::<LittleEndian>(self.vlmeta_off)?;
        w.write_u32::<LittleEndian>(self.crc32)?;
        w.write_u64::<LittleEndian>(self.frame_len)?;
        w.write_all(&TRAILER_MAGIC)?;
        Ok(())
    }

    pub fn read<R: Read>(mut r: R) -> Result<Self> {
        let index_off  = r.read_u64::<LittleEndian>()?;
        let meta_off   = r.read_u64::<LittleEndian>()?;
        let vlmeta_off = r.read_u64::<LittleEndian>()?;
        let crc32      = r.read_u32::<LittleEndian>()?;
        let frame_len  = r.read_u64::<LittleEndian>()?;
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)?;
        if magic != TRAILER_MAGIC {
            return Err(Error::header("bad frame trailer magic"));
        }
        Ok(Self { index_off, meta_off, vlmeta_off, crc32, frame_len })
    }
}

// ── Writing ──────────────────────────────────────────────────────────────────

/// Counts and checksums everything written through it.
struct CrcWriter<W> {
    inner:   W,
    hasher:  crc32fast::Hasher,
    written: u64,
}

impl<W: Write> Write for CrcWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

fn write_meta_section<W: Write>(w: &mut W, entries: &[(String, Vec<u8>)]) -> io::Result<()> {
    w.write_u16::<LittleEndian>(entries.len() as u16)?;
    for (name, content) in entries {
        w.write_u8(name.len() as u8)?;
        w.write_all(name.as_bytes())?;
        w.write_u32::<LittleEndian>(content.len() as u32)?;
        w.write_all(content)?;
    }
    Ok(())
}

/// Where each piece of a frame ended up.
#[derive(Debug, Clone)]
pub struct FrameLayout {
    pub header:  FrameHeader,
    /// `(absolute offset, length)` of every chunk, in order.
    pub chunks:  Vec<(u64, u64)>,
    pub trailer: Trailer,
}

/// Write a whole frame.  `vlmeta` content must already be compressed.
pub fn write_frame<'a, W, I>(w: W, header: &FrameHeader, chunks: I, meta: &[(String, Vec<u8>)], vlmeta: &[(String, Vec<u8>)]) -> Result<FrameLayout>
where
    W: Write,
    I: IntoIterator<Item = &'a [u8]> + Clone,
{
    let mut w = CrcWriter { inner: w, hasher: crc32fast::Hasher::new(), written: 0 };
    header.write(&mut w)?;

    let index_off = w.written;
    let data_off  = index_off + header.nchunks * 8;
    let mut rel = 0u64;
    let mut placed = Vec::with_capacity(header.nchunks as usize);
    for chunk in chunks.clone() {
        w.write_u64::<LittleEndian>(rel)?;
        placed.push((data_off + rel, chunk.len() as u64));
        rel += chunk.len() as u64;
    }
    if placed.len() as u64 != header.nchunks {
        return Err(Error::invalid(format!(
            "frame header claims {} chunks, {} supplied", header.nchunks, placed.len()
        )));
    }
    for chunk in chunks {
        w.write_all(chunk)?;
    }

    let meta_off = w.written;
    write_meta_section(&mut w, meta)?;
    let vlmeta_off = w.written;
    write_meta_section(&mut w, vlmeta)?;

    let trailer = Trailer {
        index_off,
        meta_off,
        vlmeta_off,
        crc32:     w.hasher.clone().finalize(),
        frame_len: w.written + TRAILER_SIZE as u64,
    };
    trailer.write(&mut w.inner)?;
    w.flush()?;
    debug!("wrote frame: {} chunks, {} bytes", header.nchunks, trailer.frame_len);
    Ok(FrameLayout { header: header.clone(), chunks: placed, trailer })
}

// ── Reading ──────────────────────────────────────────────────────────────────

/// Everything needed to serve a frame except the chunk bytes themselves.
#[derive(Debug, Clone)]
pub struct ParsedFrame {
    pub layout: FrameLayout,
    pub meta:   Vec<(String, Vec<u8>)>,
    pub vlmeta: Vec<(String, Vec<u8>)>,
}

fn read_meta_section<R: Read>(mut r: R, what: &str) -> Result<Vec<(String, Vec<u8>)>> {
    let count = r.read_u16::<LittleEndian>()?;
    let mut entries = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        let name_len = usize::from(r.read_u8()?);
        let mut name = vec![0u8; name_len];
        r.read_exact(&mut name)?;
        let name = String::from_utf8(name).map_err(|_| Error::corrupt(format!("{what} name is not UTF-8")))?;
        let len = r.read_u32::<LittleEndian>()? as usize;
        let mut content = Vec::new();
        (&mut r).take(len as u64).read_to_end(&mut content)?;
        if content.len() != len {
            return Err(Error::corrupt(format!("{what} '{name}' is truncated")));
        }
        entries.push((name, content));
    }
    Ok(entries)
}

fn section<R: Read + Seek + ?Sized>(r: &mut R, start: u64, end: u64) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; (end - start) as usize];
    r.seek(SeekFrom::Start(start))?;
    r.read_exact(&mut buf)?;
    Ok(buf)
}

fn eof_as_corrupt(e: Error) -> Error {
    match e {
        Error::Io(io) if io.kind() == io::ErrorKind::UnexpectedEof => Error::corrupt("frame section is truncated"),
        other => other,
    }
}

/// Validate a frame and load its index and metadata.  Chunk bytes are
/// only touched by the checksum pass.
pub fn read_frame<R: Read + Seek + ?Sized>(r: &mut R) -> Result<ParsedFrame> {
    let len = r.seek(SeekFrom::End(0))?;
    if len < (FRAME_HEADER_SIZE + TRAILER_SIZE) as u64 {
        return Err(Error::header(format!("{len} bytes is too short for a frame")));
    }
    let trailer_off = len - TRAILER_SIZE as u64;
    r.seek(SeekFrom::Start(trailer_off))?;
    let trailer = Trailer::read(&mut *r)?;
    if trailer.frame_len != len {
        return Err(Error::header(format!("trailer says {} bytes, stream has {len}", trailer.frame_len)));
    }
    if trailer.index_off != FRAME_HEADER_SIZE as u64
        || trailer.meta_off < trailer.index_off
        || trailer.vlmeta_off < trailer.meta_off
        || trailer.vlmeta_off > trailer_off
    {
        return Err(Error::header("frame section offsets are out of order"));
    }

    r.seek(SeekFrom::Start(0))?;
    let mut hasher = crc32fast::Hasher::new();
    let mut remaining = trailer_off;
    let mut buf = vec![0u8; CRC_READ_STEP];
    while remaining > 0 {
        let step = remaining.min(CRC_READ_STEP as u64) as usize;
        r.read_exact(&mut buf[..step])?;
        hasher.update(&buf[..step]);
        remaining -= step as u64;
    }
    if hasher.finalize() != trailer.crc32 {
        return Err(Error::corrupt("frame checksum mismatch"));
    }

    r.seek(SeekFrom::Start(0))?;
    let header = FrameHeader::read(&mut *r)?;
    let data_off = header
        .nchunks
        .checked_mul(8)
        .and_then(|n| n.checked_add(trailer.index_off))
        .filter(|&d| d <= trailer.meta_off)
        .ok_or_else(|| Error::header(format!("index of {} chunks does not fit the frame", header.nchunks)))?;
    let index = section(r, trailer.index_off, data_off)?;
    let data_len = trailer.meta_off - data_off;
    let offsets: Vec<u64> = index
        .chunks_exact(8)
        .map(|e| u64::from_le_bytes([e[0], e[1], e[2], e[3], e[4], e[5], e[6], e[7]]))
        .collect();
    let mut chunks = Vec::with_capacity(offsets.len());
    for (i, &rel) in offsets.iter().enumerate() {
        let end = offsets.get(i + 1).copied().unwrap_or(data_len);
        if rel > end || end > data_len {
            return Err(Error::corrupt(format!("chunk {i} offset {rel} out of order")));
        }
        chunks.push((data_off + rel, end - rel));
    }

    let meta   = read_meta_section(&section(r, trailer.meta_off, trailer.vlmeta_off)?[..], "metalayer").map_err(eof_as_corrupt)?;
    let vlmeta = read_meta_section(&section(r, trailer.vlmeta_off, trailer_off)?[..], "vlmetalayer").map_err(eof_as_corrupt)?;
    debug!("opened frame: {} chunks, {len} bytes", header.nchunks);
    Ok(ParsedFrame { layout: FrameLayout { header, chunks, trailer }, meta, vlmeta })
}

/// Cross-check a stored chunk against the frame index entry that located it.
pub(crate) fn check_chunk(index: usize, chunk: &[u8]) -> Result<ChunkHeader> {
    let h = ChunkHeader::parse(chunk).map_err(|e| e.at_chunk(index))?;
    if h.cbytes as usize != chunk.len() {
        return Err(Error::corrupt(format!(
            "index gives {} bytes, header says {}", chunk.len(), h.cbytes
        )).at_chunk(index));
    }
    Ok(h)
}
