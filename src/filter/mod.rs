//! Reversible, size-preserving byte transforms applied to each block before
//! the codec runs.
//!
//! A chunk carries up to [`MAX_FILTERS`] filter slots.  On compression the
//! slots run left to right; on decompression they run right to left, each
//! through its exact inverse.  Slot `meta == 0` means "use the chunk's
//! typesize as element size"; any other value overrides it for that slot.
//!
//! Built-in filters live below [`USER_FILTER_START`]; callers may register
//! their own in `USER_FILTER_START..=255` with [`register_filter`].

pub mod delta;
pub mod shuffle;

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock, RwLock};

use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ── Frozen filter IDs ───────────────────────────────────────────────────────

pub const FILTER_NOOP:       u8 = 0;
pub const FILTER_SHUFFLE:    u8 = 1;
pub const FILTER_BITSHUFFLE: u8 = 2;
pub const FILTER_DELTA:      u8 = 3;
pub const FILTER_XORDELTA:   u8 = 4;
pub const FILTER_FLOATPRED:  u8 = 5;

pub const USER_FILTER_START: u8 = 160;

/// Number of filter slots in a chunk header.
pub const MAX_FILTERS: usize = 6;

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum FilterError {
    #[error("Filter id {0} is not registered")]
    UnknownFilter(u8),
    #[error("Filter id {0} is already registered")]
    AlreadyRegistered(u8),
    #[error("Filter id {0} is outside the user-assignable range {USER_FILTER_START}..=255")]
    ReservedId(u8),
    #[error("Filter '{filter}' needs a non-zero element size (typesize 0, meta 0)")]
    ZeroElementSize { filter: String },
    #[error("Filter '{filter}' failed: {reason}")]
    Failed { filter: String, reason: String },
}

// ── Filter slot ──────────────────────────────────────────────────────────────

/// One entry of a chunk's filter stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FilterSlot {
    pub id:   u8,
    pub meta: u8,
}

impl FilterSlot {
    pub const fn new(id: u8, meta: u8) -> Self {
        Self { id, meta }
    }

    pub const fn noop() -> Self {
        Self { id: FILTER_NOOP, meta: 0 }
    }
}

pub type FilterStack = [FilterSlot; MAX_FILTERS];

/// A stack with `slot` in the last position and no-ops elsewhere, which is
/// where blosc-style tools put their single default filter.
pub fn single_filter(slot: FilterSlot) -> FilterStack {
    let mut stack = [FilterSlot::noop(); MAX_FILTERS];
    stack[MAX_FILTERS - 1] = slot;
    stack
}

// ── Filter trait ─────────────────────────────────────────────────────────────

/// A size-preserving byte transform and its inverse.
///
/// `dest.len() == src.len()` always holds on entry.
pub trait Filter: Send + Sync {
    fn name(&self) -> &str;
    fn forward(&self, src: &[u8], dest: &mut [u8], typesize: usize, meta: u8) -> Result<(), FilterError>;
    fn backward(&self, src: &[u8], dest: &mut [u8], typesize: usize, meta: u8) -> Result<(), FilterError>;

    /// Reject parameter combinations before any block is touched.
    fn validate(&self, _typesize: usize, _meta: u8) -> Result<(), FilterError> {
        Ok(())
    }
}

/// Element size for element-wise filters.
pub(crate) fn element_size(name: &str, typesize: usize, meta: u8) -> Result<usize, FilterError> {
    let size = if meta != 0 { usize::from(meta) } else { typesize };
    if size == 0 {
        return Err(FilterError::ZeroElementSize { filter: name.to_owned() });
    }
    Ok(size)
}

pub struct NoopFilter;
impl Filter for NoopFilter {
    fn name(&self) -> &str { "noop" }
    fn forward(&self, src: &[u8], dest: &mut [u8], _: usize, _: u8) -> Result<(), FilterError> {
        dest.copy_from_slice(src);
        Ok(())
    }
    fn backward(&self, src: &[u8], dest: &mut [u8], _: usize, _: u8) -> Result<(), FilterError> {
        dest.copy_from_slice(src);
        Ok(())
    }
}

macro_rules! element_filter {
    ($ty:ident, $name:literal, $fwd:path, $bwd:path) => {
        pub struct $ty;
        impl Filter for $ty {
            fn name(&self) -> &str { $name }
            fn forward(&self, src: &[u8], dest: &mut [u8], typesize: usize, meta: u8) -> Result<(), FilterError> {
                $fwd(src, dest, element_size($name, typesize, meta)?);
                Ok(())
            }
            fn backward(&self, src: &[u8], dest: &mut [u8], typesize: usize, meta: u8) -> Result<(), FilterError> {
                $bwd(src, dest, element_size($name, typesize, meta)?);
                Ok(())
            }
            fn validate(&self, typesize: usize, meta: u8) -> Result<(), FilterError> {
                element_size($name, typesize, meta).map(|_| ())
            }
        }
    };
}

element_filter!(ShuffleFilter,    "shuffle",    shuffle::shuffle,     shuffle::unshuffle);
element_filter!(BitShuffleFilter, "bitshuffle", shuffle::bitshuffle,  shuffle::bitunshuffle);
element_filter!(DeltaFilter,      "delta",      delta::delta_encode,  delta::delta_decode);
element_filter!(XorDeltaFilter,   "xordelta",   delta::xor_encode,    delta::xor_decode);
element_filter!(FloatPredFilter,  "floatpred",  delta::floatpred_encode, delta::floatpred_decode);

// ── Registry ─────────────────────────────────────────────────────────────────

type FilterTable = BTreeMap<u8, Arc<dyn Filter>>;

static REGISTRY: OnceLock<RwLock<FilterTable>> = OnceLock::new();

fn builtin_table() -> FilterTable {
    let mut table: FilterTable = BTreeMap::new();
    table.insert(FILTER_NOOP,       Arc::new(NoopFilter));
    table.insert(FILTER_SHUFFLE,    Arc::new(ShuffleFilter));
    table.insert(FILTER_BITSHUFFLE, Arc::new(BitShuffleFilter));
    table.insert(FILTER_DELTA,      Arc::new(DeltaFilter));
    table.insert(FILTER_XORDELTA,   Arc::new(XorDeltaFilter));
    table.insert(FILTER_FLOATPRED,  Arc::new(FloatPredFilter));
    table
}

fn registry() -> &'static RwLock<FilterTable> {
    REGISTRY.get_or_init(|| RwLock::new(builtin_table()))
}

/// Register a user filter under `id` (`USER_FILTER_START..=255`).
pub fn register_filter(id: u8, filter: Arc<dyn Filter>) -> Result<(), FilterError> {
    if id < USER_FILTER_START {
        return Err(FilterError::ReservedId(id));
    }
    let mut table = registry().write().unwrap_or_else(|e| e.into_inner());
    if table.contains_key(&id) {
        return Err(FilterError::AlreadyRegistered(id));
    }
    debug!("registering filter '{}' under id {id}", filter.name());
    table.insert(id, filter);
    Ok(())
}

pub fn get_filter(id: u8) -> Result<Arc<dyn Filter>, FilterError> {
    let table = registry().read().unwrap_or_else(|e| e.into_inner());
    table.get(&id).cloned().ok_or(FilterError::UnknownFilter(id))
}

pub(crate) fn ensure_builtins() {
    let _ = registry();
}

pub(crate) fn clear_user_filters() {
    let mut table = registry().write().unwrap_or_else(|e| e.into_inner());
    table.retain(|id, _| *id < USER_FILTER_START);
}

/// Apply a single filter to a block.
pub fn forward(filter_id: u8, meta: u8, typesize: usize, input: &[u8]) -> Result<Vec<u8>, FilterError> {
    let filter = get_filter(filter_id)?;
    filter.validate(typesize, meta)?;
    let mut out = vec![0u8; input.len()];
    filter.forward(input, &mut out, typesize, meta)?;
    Ok(out)
}

/// Exact inverse of [`forward`].
pub fn backward(filter_id: u8, meta: u8, typesize: usize, input: &[u8]) -> Result<Vec<u8>, FilterError> {
    let filter = get_filter(filter_id)?;
    filter.validate(typesize, meta)?;
    let mut out = vec![0u8; input.len()];
    filter.backward(input, &mut out, typesize, meta)?;
    Ok(out)
}

// ── Pipeline ─────────────────────────────────────────────────────────────────

/// A filter stack resolved against the registry once per chunk, so the
/// per-block loop never takes the registry lock.
#[derive(Clone)]
pub struct Pipeline {
    stages:   Vec<(FilterSlot, Arc<dyn Filter>)>,
    typesize: usize,
}

impl Pipeline {
    pub fn new(stack: &FilterStack, typesize: usize) -> Result<Self, FilterError> {
        let mut stages = Vec::with_capacity(MAX_FILTERS);
        for slot in stack.iter().filter(|s| s.id != FILTER_NOOP) {
            let filter = get_filter(slot.id)?;
            filter.validate(typesize, slot.meta)?;
            stages.push((*slot, filter));
        }
        Ok(Self { stages, typesize })
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn forward(&self, block: Vec<u8>) -> Result<Vec<u8>, FilterError> {
        self.run(block, false)
    }

    pub fn backward(&self, block: Vec<u8>) -> Result<Vec<u8>, FilterError> {
        self.run(block, true)
    }

    fn run(&self, block: Vec<u8>, reverse: bool) -> Result<Vec<u8>, FilterError> {
        if self.stages.is_empty() {
            return Ok(block);
        }
        let mut cur     = block;
        let mut scratch = vec![0u8; cur.len()];
        let order: Box<dyn Iterator<Item = &(FilterSlot, Arc<dyn Filter>)>> = if reverse {
            Box::new(self.stages.iter().rev())
        } else {
            Box::new(self.stages.iter())
        };
        for (slot, filter) in order {
            if reverse {
                filter.backward(&cur, &mut scratch, self.typesize, slot.meta)?;
            } else {
                filter.forward(&cur, &mut scratch, self.typesize, slot.meta)?;
            }
            std::mem::swap(&mut cur, &mut scratch);
        }
        Ok(cur)
    }
}
