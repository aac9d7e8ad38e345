//! Super-chunk: an ordered, indexable sequence of compressed chunks plus
//! named metadata, optionally persisted as a frame.
//!
//! # Chunk sizes
//! The first chunk fixes `chunksize`.  Every chunk except the last must
//! decompress to exactly `chunksize` bytes; the last may be shorter, and
//! once it is, nothing can be appended after it.  Deleting the last chunk
//! of a container clears `chunksize` again.
//!
//! # Persistence
//! A container created with a `urlpath`, or opened from one, is backed by
//! a frame on an [`io_backend::Backend`].  Its chunks are then read from
//! the frame on demand, and every mutation rewrites the frame before
//! returning.  A mutation whose rewrite fails is undone in memory, so the
//! container stays at its previous state.

pub mod metalayer;

use std::borrow::Cow;
use std::fmt;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::block;
use crate::context::{CompressionContext, DecompressionContext};
use crate::error::{Error, Result};
use crate::frame::{self, FrameHeader};
use crate::header::{ChunkHeader, HEADER_SIZE};
use crate::io_backend::{Backend, FileBackend, OpenMode, Stream};
use crate::params::{CParams, DParams};
use crate::pool;

pub use metalayer::{
    LayerKind, MetaTable, MAX_METALAYERS, MAX_VLMETALAYERS, METALAYER_NAME_MAXLEN, VLMETALAYER_NAME_MAXLEN,
};

// ── Storage ──────────────────────────────────────────────────────────────────

/// How a new container is set up.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Storage {
    /// Persist as a frame at this path.  `None` keeps everything in memory.
    pub urlpath: Option<PathBuf>,
    pub cparams: CParams,
    pub dparams: DParams,
    /// Where `urlpath` lives; plain files when unset.
    #[serde(skip)]
    pub backend: Option<Arc<dyn Backend>>,
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Storage")
            .field("urlpath", &self.urlpath)
            .field("cparams", &self.cparams)
            .field("dparams", &self.dparams)
            .field("backend", &self.backend.as_ref().map(|b| b.name().to_owned()))
            .finish()
    }
}

impl Storage {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::invalid(format!("storage: {e}")))
    }
}

/// Value used by [`SuperChunk::fill_special`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Fill<'a> {
    Zeros,
    Nans,
    Uninit,
    Value(&'a [u8]),
}

// ── Chunk slots ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Store {
    Mem(Vec<u8>),
    Frame { offset: u64, len: u64 },
}

#[derive(Debug, Clone)]
struct Slot {
    nbytes: usize,
    store:  Store,
}

impl Slot {
    fn cbytes(&self) -> usize {
        match &self.store {
            Store::Mem(bytes)        => bytes.len(),
            Store::Frame { len, .. } => *len as usize,
        }
    }
}

struct Persist {
    path:    PathBuf,
    backend: Arc<dyn Backend>,
    stream:  Mutex<Box<dyn Stream>>,
}

// ── SuperChunk ───────────────────────────────────────────────────────────────

pub struct SuperChunk {
    cctx:      CompressionContext,
    dctx:      DecompressionContext,
    chunksize: Option<usize>,
    slots:     Vec<Slot>,
    nbytes:    u64,
    cbytes:    u64,
    meta:      MetaTable,
    vlmeta:    MetaTable,
    persist:   Option<Persist>,
}

impl fmt::Debug for SuperChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SuperChunk")
            .field("nchunks", &self.slots.len())
            .field("chunksize", &self.chunksize)
            .field("nbytes", &self.nbytes)
            .field("cbytes", &self.cbytes)
            .field("urlpath", &self.urlpath())
            .finish()
    }
}

#[derive(Clone, Copy)]
enum Placement {
    Append,
    Insert(usize),
    Update(usize),
}

impl SuperChunk {
    pub fn new(storage: Storage) -> Result<Self> {
        let mut schunk = Self::empty(storage.cparams, storage.dparams)?;
        if let Some(path) = storage.urlpath {
            let backend: Arc<dyn Backend> = storage.backend.unwrap_or_else(|| Arc::new(FileBackend));
            let stream  = backend.open(&path, OpenMode::Create)?;
            debug!("creating frame {} on {} backend", path.display(), backend.name());
            schunk.persist = Some(Persist { path, backend, stream: Mutex::new(stream) });
            schunk.sync()?;
        }
        Ok(schunk)
    }

    fn empty(cparams: CParams, dparams: DParams) -> Result<Self> {
        Ok(Self {
            cctx:      CompressionContext::new(cparams)?,
            dctx:      DecompressionContext::new(dparams)?,
            chunksize: None,
            slots:     Vec::new(),
            nbytes:    0,
            cbytes:    0,
            meta:      MetaTable::new(LayerKind::Fixed),
            vlmeta:    MetaTable::new(LayerKind::Variable),
            persist:   None,
        })
    }

    // ── Accessors ───────────────────────────────────────────────────────────

    pub fn nchunks(&self) -> usize {
        self.slots.len()
    }

    /// Sum of the logical sizes of all chunks.
    pub fn nbytes(&self) -> u64 {
        self.nbytes
    }

    /// Sum of the stored sizes of all chunks.
    pub fn cbytes(&self) -> u64 {
        self.cbytes
    }

    pub fn chunksize(&self) -> Option<usize> {
        self.chunksize
    }

    pub fn typesize(&self) -> usize {
        self.cctx.params().typesize
    }

    fn item_size(&self) -> usize {
        self.typesize().max(1)
    }

    /// Number of `typesize` items held by the container.
    pub fn nitems(&self) -> u64 {
        self.nbytes / self.item_size() as u64
    }

    pub fn cparams(&self) -> &CParams {
        self.cctx.params()
    }

    pub fn dparams(&self) -> &DParams {
        self.dctx.params()
    }

    pub fn urlpath(&self) -> Option<&Path> {
        self.persist.as_ref().map(|p| p.path.as_path())
    }

    /// Scan every chunk and return `(nbytes, cbytes)`.
    pub fn recompute_totals(&self) -> Result<(u64, u64)> {
        let mut nbytes = 0u64;
        let mut cbytes = 0u64;
        for i in 0..self.slots.len() {
            let chunk = self.get_chunk(i)?;
            let h = ChunkHeader::parse(&chunk).map_err(|e| e.at_chunk(i))?;
            nbytes += u64::from(h.nbytes);
            cbytes += chunk.len() as u64;
        }
        Ok((nbytes, cbytes))
    }

    // ── Slot bookkeeping ────────────────────────────────────────────────────

    fn check_placement(&self, at: Placement, nbytes: usize) -> Result<()> {
        let n = self.slots.len();
        let Some(cs) = self.chunksize else { return Ok(()) };
        let last_is_short = n > 0 && self.slots[n - 1].nbytes != cs;
        let tail = match at {
            Placement::Append    => true,
            Placement::Insert(i) => i == n,
            Placement::Update(i) => i + 1 == n,
        };
        if matches!(at, Placement::Append | Placement::Insert(_)) && tail && last_is_short {
            return Err(Error::invalid(format!(
                "cannot append after a short last chunk of {} bytes", self.slots[n - 1].nbytes
            )));
        }
        if tail && nbytes > cs {
            return Err(Error::invalid(format!("chunk of {nbytes} bytes exceeds chunksize {cs}")));
        }
        if !tail && nbytes != cs {
            return Err(Error::invalid(format!("chunk holds {nbytes} bytes, chunksize is {cs}")));
        }
        Ok(())
    }

    fn insert_slot(&mut self, index: usize, slot: Slot) {
        if self.slots.is_empty() {
            self.chunksize = Some(slot.nbytes);
        }
        self.nbytes += slot.nbytes as u64;
        self.cbytes += slot.cbytes() as u64;
        self.slots.insert(index, slot);
    }

    fn remove_slot(&mut self, index: usize) -> Slot {
        let slot = self.slots.remove(index);
        self.nbytes -= slot.nbytes as u64;
        self.cbytes -= slot.cbytes() as u64;
        if self.slots.is_empty() {
            self.chunksize = None;
        }
        slot
    }

    fn replace_slot(&mut self, index: usize, slot: Slot) -> Slot {
        self.nbytes = self.nbytes + slot.nbytes as u64 - self.slots[index].nbytes as u64;
        self.cbytes = self.cbytes + slot.cbytes() as u64 - self.slots[index].cbytes() as u64;
        std::mem::replace(&mut self.slots[index], slot)
    }

    fn validated_slot(&self, chunk: Vec<u8>) -> Result<Slot> {
        let h = ChunkHeader::parse(&chunk)?;
        if h.cbytes as usize != chunk.len() {
            return Err(Error::header(format!(
                "chunk declares cbytes {} but is {} bytes long", h.cbytes, chunk.len()
            )));
        }
        Ok(Slot { nbytes: h.nbytes as usize, store: Store::Mem(chunk) })
    }

    // ── Chunk operations ────────────────────────────────────────────────────

    /// Append a compressed chunk.  Returns the new number of chunks.
    pub fn append_chunk(&mut self, chunk: Vec<u8>) -> Result<usize> {
        let n = self.slots.len();
        let slot = self.validated_slot(chunk).map_err(|e| e.at_chunk(n))?;
        self.check_placement(Placement::Append, slot.nbytes).map_err(|e| e.at_chunk(n))?;
        self.materialize()?;
        let chunksize = self.chunksize;
        self.insert_slot(n, slot);
        self.commit(move |s| {
            s.remove_slot(n);
            s.chunksize = chunksize;
        })?;
        Ok(self.slots.len())
    }

    /// Compress `src` with the container's parameters and append it.
    pub fn append_buffer(&mut self, src: &[u8]) -> Result<usize> {
        let n = self.slots.len();
        let chunk = self.cctx.compress(src).map_err(|e| e.at_chunk(n))?;
        self.append_chunk(chunk)
    }

    /// Insert a chunk before `index` (`index == nchunks` appends).
    pub fn insert_chunk(&mut self, index: usize, chunk: Vec<u8>) -> Result<usize> {
        let n = self.slots.len();
        if index > n {
            return Err(Error::out_of_range(format!("insert position {index} past {n} chunks")));
        }
        let slot = self.validated_slot(chunk).map_err(|e| e.at_chunk(index))?;
        self.check_placement(Placement::Insert(index), slot.nbytes).map_err(|e| e.at_chunk(index))?;
        self.materialize()?;
        let chunksize = self.chunksize;
        self.insert_slot(index, slot);
        self.commit(move |s| {
            s.remove_slot(index);
            s.chunksize = chunksize;
        })?;
        Ok(self.slots.len())
    }

    /// Replace the chunk at `index`.
    pub fn update_chunk(&mut self, index: usize, chunk: Vec<u8>) -> Result<usize> {
        let n = self.slots.len();
        if index >= n {
            return Err(Error::out_of_range(format!("chunk {index} of {n}")));
        }
        let slot = self.validated_slot(chunk).map_err(|e| e.at_chunk(index))?;
        self.check_placement(Placement::Update(index), slot.nbytes).map_err(|e| e.at_chunk(index))?;
        self.materialize()?;
        let old = self.replace_slot(index, slot);
        self.commit(move |s| {
            s.replace_slot(index, old);
        })?;
        Ok(self.slots.len())
    }

    /// Remove the chunk at `index`, shifting later chunks down.
    pub fn delete_chunk(&mut self, index: usize) -> Result<usize> {
        let n = self.slots.len();
        if index >= n {
            return Err(Error::out_of_range(format!("chunk {index} of {n}")));
        }
        self.materialize()?;
        let chunksize = self.chunksize;
        let old = self.remove_slot(index);
        self.commit(move |s| {
            s.insert_slot(index, old);
            s.chunksize = chunksize;
        })?;
        Ok(self.slots.len())
    }

    /// Stored bytes of chunk `index`: borrowed when the chunk is held in
    /// memory, an owned copy when it had to be read from the frame.
    pub fn get_chunk(&self, index: usize) -> Result<Cow<'_, [u8]>> {
        let slot = self.slots.get(index).ok_or_else(|| {
            Error::out_of_range(format!("chunk {index} of {}", self.slots.len()))
        })?;
        match &slot.store {
            Store::Mem(bytes) => Ok(Cow::Borrowed(bytes)),
            Store::Frame { offset, len } => {
                let persist = self.persist.as_ref().ok_or_else(|| {
                    Error::corrupt("frame-resident chunk without a frame").at_chunk(index)
                })?;
                let mut buf = vec![0u8; *len as usize];
                let mut stream = persist.stream.lock().unwrap_or_else(|e| e.into_inner());
                stream.read_at(*offset, &mut buf).map_err(|e| Error::from(e).at_chunk(index))?;
                Ok(Cow::Owned(buf))
            }
        }
    }

    /// Decompress chunk `index` into `dest`, returning its logical size.
    pub fn decompress_chunk(&self, index: usize, dest: &mut [u8]) -> Result<usize> {
        let chunk = self.get_chunk(index)?;
        self.dctx.decompress_into(&chunk, dest).map_err(|e| e.at_chunk(index))
    }

    /// Read items `start..stop` into `dest`, decoding only the blocks that
    /// overlap the range.  Returns the number of bytes written.
    pub fn get_slice(&self, start: u64, stop: u64, dest: &mut [u8]) -> Result<usize> {
        let (begin, end) = self.byte_range(start, stop)?;
        let len = (end - begin) as usize;
        if dest.len() < len {
            return Err(Error::too_small(len, dest.len()));
        }
        let mut written = 0usize;
        for (index, from, to) in self.spans(begin, end)? {
            let chunk  = self.get_chunk(index)?;
            let header = ChunkHeader::parse(&chunk).map_err(|e| e.at_chunk(index))?;
            written += block::get_range(self.dparams(), &chunk, &header, from, to, &mut dest[written..])
                .map_err(|e| e.at_chunk(index))?;
        }
        Ok(written)
    }

    /// Overwrite items `start..stop` with `src`.  The range must lie inside
    /// the current items; every touched chunk is recompressed.
    pub fn set_slice(&mut self, start: u64, stop: u64, src: &[u8]) -> Result<()> {
        let (begin, end) = self.byte_range(start, stop)?;
        if src.len() as u64 != end - begin {
            return Err(Error::invalid(format!(
                "slice of {} items needs {} bytes, got {}", stop - start, end - begin, src.len()
            )));
        }
        let mut fresh = Vec::new();
        let mut consumed = 0usize;
        for (index, from, to) in self.spans(begin, end)? {
            let chunk = self.get_chunk(index)?;
            let mut raw = self.dctx.decompress(&chunk).map_err(|e| e.at_chunk(index))?;
            raw[from..to].copy_from_slice(&src[consumed..consumed + (to - from)]);
            consumed += to - from;
            let recompressed = self.cctx.compress(&raw).map_err(|e| e.at_chunk(index))?;
            fresh.push((index, self.validated_slot(recompressed)?));
        }
        self.materialize()?;
        let mut old = Vec::with_capacity(fresh.len());
        for (index, slot) in fresh {
            old.push((index, self.replace_slot(index, slot)));
        }
        self.commit(move |s| {
            for (index, slot) in old {
                s.replace_slot(index, slot);
            }
        })
    }

    fn byte_range(&self, start: u64, stop: u64) -> Result<(u64, u64)> {
        let nitems = self.nitems();
        if start > stop || stop > nitems {
            return Err(Error::out_of_range(format!("items {start}..{stop} outside 0..{nitems}")));
        }
        let item = self.item_size() as u64;
        Ok((start * item, stop * item))
    }

    /// `(chunk index, begin, end)` of each chunk piece covering the
    /// container byte range `begin..end`.
    fn spans(&self, begin: u64, end: u64) -> Result<Vec<(usize, usize, usize)>> {
        let mut spans = Vec::new();
        let Some(cs) = self.chunksize.filter(|&cs| cs > 0) else { return Ok(spans) };
        let cs = cs as u64;
        let mut pos = begin;
        while pos < end {
            let index       = (pos / cs) as usize;
            let chunk_start = index as u64 * cs;
            let slot = self.slots.get(index).ok_or_else(|| {
                Error::corrupt(format!("byte {pos} maps past the last of {} chunks", self.slots.len()))
            })?;
            let to = end.min(chunk_start + slot.nbytes as u64);
            if to <= pos {
                return Err(Error::corrupt(format!(
                    "chunk holds {} bytes, chunksize is {cs}", slot.nbytes
                )).at_chunk(index));
            }
            spans.push((index, (pos - chunk_start) as usize, (to - chunk_start) as usize));
            pos = to;
        }
        Ok(spans)
    }

    /// Append special chunks covering `nitems` items without materializing
    /// them.  The container must be empty; `chunksize` must be a positive
    /// multiple of the item size.
    pub fn fill_special(&mut self, nitems: u64, value: Fill<'_>, chunksize: usize) -> Result<usize> {
        if !self.slots.is_empty() {
            return Err(Error::invalid("fill_special needs an empty container"));
        }
        let item = self.item_size();
        if chunksize == 0 || chunksize % item != 0 {
            return Err(Error::invalid(format!("chunksize {chunksize} is not a multiple of item size {item}")));
        }
        let total = nitems
            .checked_mul(item as u64)
            .ok_or_else(|| Error::invalid(format!("{nitems} items overflow")))?;
        let full     = total / chunksize as u64;
        let leftover = (total % chunksize as u64) as usize;
        let mut make = |len: usize| match value {
            Fill::Zeros    => self.cctx.chunk_zeros(len),
            Fill::Nans     => self.cctx.chunk_nans(len),
            Fill::Uninit   => self.cctx.chunk_uninit(len),
            Fill::Value(v) => self.cctx.chunk_repeatval(len, v),
        };
        // All special chunks of one length are identical.
        let whole = if full > 0 { Some(make(chunksize)?) } else { None };
        let tail  = if leftover > 0 { Some(make(leftover)?) } else { None };

        self.materialize()?;
        if let Some(chunk) = whole {
            for _ in 0..full {
                let slot = self.validated_slot(chunk.clone())?;
                let n = self.slots.len();
                self.insert_slot(n, slot);
            }
        }
        if let Some(chunk) = tail {
            let slot = self.validated_slot(chunk)?;
            let n = self.slots.len();
            self.insert_slot(n, slot);
        }
        self.commit(|s| {
            while !s.slots.is_empty() {
                s.remove_slot(s.slots.len() - 1);
            }
        })?;
        Ok(self.slots.len())
    }

    // ── Metalayers ──────────────────────────────────────────────────────────

    fn change_meta<T>(&mut self, variable: bool, f: impl FnOnce(&mut MetaTable) -> Result<T>) -> Result<T> {
        self.materialize()?;
        let table  = if variable { &mut self.vlmeta } else { &mut self.meta };
        let before = table.clone();
        let out    = f(table)?;
        self.commit(move |s| {
            if variable { s.vlmeta = before } else { s.meta = before }
        })?;
        Ok(out)
    }

    pub fn meta_add(&mut self, name: &str, content: &[u8]) -> Result<usize> {
        let content = content.to_vec();
        self.change_meta(false, |t| t.add(name, content))
    }

    /// Replace a fixed metalayer with content of the same length.
    pub fn meta_update(&mut self, name: &str, content: &[u8]) -> Result<usize> {
        let content = content.to_vec();
        self.change_meta(false, |t| t.update(name, content))
    }

    pub fn meta_get(&self, name: &str) -> Result<&[u8]> {
        self.meta.get(name)
    }

    pub fn meta_exists(&self, name: &str) -> bool {
        self.meta.exists(name)
    }

    pub fn meta_names(&self) -> Vec<String> {
        self.meta.names()
    }

    fn vlmeta_cparams(&self) -> CParams {
        CParams { typesize: 1, nthreads: 1, prefilter: None, ..self.cparams().clone() }
    }

    fn vlmeta_dparams() -> DParams {
        DParams { nthreads: 1, postfilter: None }
    }

    fn compress_vlmeta(&self, name: &str, content: &[u8]) -> Result<Vec<u8>> {
        block::compress_chunk(&self.vlmeta_cparams(), content).map_err(|e| e.at_metalayer(name))
    }

    pub fn vlmeta_add(&mut self, name: &str, content: &[u8]) -> Result<usize> {
        let packed = self.compress_vlmeta(name, content)?;
        self.change_meta(true, |t| t.add(name, packed))
    }

    pub fn vlmeta_update(&mut self, name: &str, content: &[u8]) -> Result<usize> {
        let packed = self.compress_vlmeta(name, content)?;
        self.change_meta(true, |t| t.update(name, packed))
    }

    /// Decompressed content of a variable-length metalayer.
    pub fn vlmeta_get(&self, name: &str) -> Result<Vec<u8>> {
        let packed = self.vlmeta.get(name)?;
        let header = ChunkHeader::parse(packed).map_err(|e| e.at_metalayer(name))?;
        let mut out = vec![0u8; header.nbytes as usize];
        block::decompress_chunk(&Self::vlmeta_dparams(), packed, &mut out).map_err(|e| e.at_metalayer(name))?;
        Ok(out)
    }

    pub fn vlmeta_exists(&self, name: &str) -> bool {
        self.vlmeta.exists(name)
    }

    /// Remove a variable-length metalayer, returning how many remain.
    pub fn vlmeta_delete(&mut self, name: &str) -> Result<usize> {
        self.change_meta(true, |t| t.delete(name))
    }

    pub fn vlmeta_names(&self) -> Vec<String> {
        self.vlmeta.names()
    }

    // ── Frames ──────────────────────────────────────────────────────────────

    fn frame_header(&self) -> FrameHeader {
        let p = self.cparams();
        FrameHeader {
            nchunks:    self.slots.len() as u64,
            nbytes:     self.nbytes,
            cbytes:     self.cbytes,
            chunksize:  self.chunksize.map(|c| c as u64),
            typesize:   p.typesize as u8,
            codec:      p.codec,
            codec_meta: p.codec_meta,
            clevel:     p.clevel,
            splitmode:  p.splitmode,
            filters:    p.filters,
            blocksize:  p.blocksize as u32,
        }
    }

    fn collect_chunks(&self) -> Result<Vec<Cow<'_, [u8]>>> {
        (0..self.slots.len()).map(|i| self.get_chunk(i)).collect()
    }

    /// Serialize the whole container into one contiguous frame.
    pub fn to_buffer(&self) -> Result<Vec<u8>> {
        let chunks = self.collect_chunks()?;
        let mut out = Vec::with_capacity(self.cbytes as usize + 1024);
        frame::write_frame(
            &mut out,
            &self.frame_header(),
            chunks.iter().map(|c| &c[..]),
            self.meta.entries(),
            self.vlmeta.entries(),
        )?;
        Ok(out)
    }

    /// Write a frame to `path` on the local filesystem.  Returns its length.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<u64> {
        self.to_backend(path.as_ref(), &FileBackend)
    }

    pub fn to_backend(&self, path: &Path, backend: &dyn Backend) -> Result<u64> {
        let chunks = self.collect_chunks()?;
        let mut stream = backend.open(path, OpenMode::Create)?;
        let layout = frame::write_frame(
            &mut stream,
            &self.frame_header(),
            chunks.iter().map(|c| &c[..]),
            self.meta.entries(),
            self.vlmeta.entries(),
        )?;
        stream.close()?;
        Ok(layout.trailer.frame_len)
    }

    /// Open a frame file.  Later mutations are written back to it.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_backend(path, Arc::new(FileBackend))
    }

    pub fn open_with_backend<P: AsRef<Path>>(path: P, backend: Arc<dyn Backend>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut stream = backend.open(&path, OpenMode::ReadWrite)?;
        let parsed = frame::read_frame(&mut stream)?;
        let mut schunk = Self::from_parsed(&parsed)?;
        for (i, &(offset, len)) in parsed.layout.chunks.iter().enumerate() {
            if (len as usize) < HEADER_SIZE {
                return Err(Error::corrupt(format!("{len} bytes is too short for a chunk")).at_chunk(i));
            }
            let mut head = [0u8; HEADER_SIZE];
            stream.read_at(offset, &mut head).map_err(|e| Error::from(e).at_chunk(i))?;
            let h = ChunkHeader::read(&head[..]).map_err(|e| e.at_chunk(i))?;
            if u64::from(h.cbytes) != len {
                return Err(Error::corrupt(format!("index gives {len} bytes, header says {}", h.cbytes)).at_chunk(i));
            }
            let n = schunk.slots.len();
            schunk.insert_slot(n, Slot { nbytes: h.nbytes as usize, store: Store::Frame { offset, len } });
        }
        schunk.finish_open(&parsed.layout.header)?;
        debug!("opened {} with {} chunks", path.display(), schunk.slots.len());
        schunk.persist = Some(Persist { path, backend, stream: Mutex::new(stream) });
        Ok(schunk)
    }

    /// Load a frame held in memory.  The result is not tied to any path.
    pub fn from_buffer(bytes: &[u8]) -> Result<Self> {
        let parsed = frame::read_frame(&mut Cursor::new(bytes))?;
        let mut schunk = Self::from_parsed(&parsed)?;
        for (i, &(offset, len)) in parsed.layout.chunks.iter().enumerate() {
            let chunk = &bytes[offset as usize..(offset + len) as usize];
            let h = frame::check_chunk(i, chunk)?;
            let n = schunk.slots.len();
            schunk.insert_slot(n, Slot { nbytes: h.nbytes as usize, store: Store::Mem(chunk.to_vec()) });
        }
        schunk.finish_open(&parsed.layout.header)?;
        Ok(schunk)
    }

    fn from_parsed(parsed: &frame::ParsedFrame) -> Result<Self> {
        let h = &parsed.layout.header;
        let cparams = CParams {
            codec:      h.codec,
            codec_meta: h.codec_meta,
            clevel:     h.clevel,
            typesize:   usize::from(h.typesize),
            nthreads:   pool::nthreads(),
            blocksize:  h.blocksize as usize,
            splitmode:  h.splitmode,
            filters:    h.filters,
            prefilter:  None,
        };
        let mut schunk = Self::empty(cparams, DParams::default())?;
        schunk.meta   = MetaTable::from_entries(LayerKind::Fixed, parsed.meta.clone())?;
        schunk.vlmeta = MetaTable::from_entries(LayerKind::Variable, parsed.vlmeta.clone())?;
        Ok(schunk)
    }

    fn finish_open(&mut self, header: &FrameHeader) -> Result<()> {
        if header.nbytes != self.nbytes || header.cbytes != self.cbytes {
            return Err(Error::corrupt(format!(
                "frame totals {}/{} disagree with its chunks {}/{}",
                header.nbytes, header.cbytes, self.nbytes, self.cbytes
            )));
        }
        if self.chunksize.map(|cs| cs as u64) != header.chunksize {
            return Err(Error::corrupt(format!(
                "frame chunksize {:?}, first chunk holds {:?}", header.chunksize, self.chunksize
            )));
        }
        if let Some(cs) = self.chunksize {
            let last = self.slots.len() - 1;
            for (i, slot) in self.slots.iter().enumerate() {
                if slot.nbytes > cs || (i < last && slot.nbytes != cs) {
                    return Err(Error::corrupt(format!(
                        "chunk holds {} bytes, chunksize is {cs}", slot.nbytes
                    )).at_chunk(i));
                }
            }
        }
        Ok(())
    }

    /// Release the backing frame.  Every successful mutation has already
    /// been written to it.
    pub fn close(mut self) -> Result<()> {
        if let Some(p) = self.persist.take() {
            let mut stream = p.stream.into_inner().unwrap_or_else(|e| e.into_inner());
            stream.close()?;
        }
        Ok(())
    }

    // ── Persistence plumbing ────────────────────────────────────────────────

    /// Pull every frame-resident chunk into memory so the frame can be
    /// rewritten without losing data.
    fn materialize(&mut self) -> Result<()> {
        if self.persist.is_none() {
            return Ok(());
        }
        for i in 0..self.slots.len() {
            if matches!(self.slots[i].store, Store::Frame { .. }) {
                let bytes = self.get_chunk(i)?.into_owned();
                self.slots[i].store = Store::Mem(bytes);
            }
        }
        Ok(())
    }

    /// Rewrite the backing frame, or run `undo` if that fails.
    fn commit(&mut self, undo: impl FnOnce(&mut Self)) -> Result<()> {
        match self.sync() {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("frame rewrite failed, rolling back: {e}");
                undo(self);
                Err(e)
            }
        }
    }

    /// Rewrite the whole frame from the in-memory state, then serve chunks
    /// from the frame again.  Expects [`Self::materialize`] to have run.
    fn sync(&mut self) -> Result<()> {
        let Some(persist) = &self.persist else { return Ok(()) };
        let header = self.frame_header();
        let chunks = self.collect_chunks()?;
        let layout = {
            let mut stream = persist.stream.lock().unwrap_or_else(|e| e.into_inner());
            stream.truncate(0)?;
            stream.rewind()?;
            let layout = frame::write_frame(
                &mut *stream,
                &header,
                chunks.iter().map(|c| &c[..]),
                self.meta.entries(),
                self.vlmeta.entries(),
            )?;
            stream.flush()?;
            layout
        };
        drop(chunks);
        for (slot, (offset, len)) in self.slots.iter_mut().zip(layout.chunks) {
            slot.store = Store::Frame { offset, len };
        }
        debug!("synced {} ({} chunks)", persist.path.display(), self.slots.len());
        Ok(())
    }
}

/// Delete a persisted frame.
pub fn remove_urlpath<P: AsRef<Path>>(path: P) -> Result<()> {
    remove_with_backend(path, &FileBackend)
}

pub fn remove_with_backend<P: AsRef<Path>>(path: P, backend: &dyn Backend) -> Result<()> {
    let path = path.as_ref();
    if !backend.exists(path) {
        return Err(Error::NotFound(format!("{} does not exist", path.display())));
    }
    backend.remove(path)?;
    debug!("removed {}", path.display());
    Ok(())
}
