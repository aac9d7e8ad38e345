//! Compression and decompression parameters.
//!
//! Both parameter sets are plain data: they deserialize from JSON (hooks
//! excluded) and can be overridden from the environment with the
//! `SUPCHUNK_*` variables listed on [`CParams::apply_env`].

use std::fmt;
use std::sync::Arc;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::codec::{self, CODEC_LZ4};
use crate::error::{Error, Result};
use crate::filter::{
    single_filter, FilterSlot, FilterStack, Pipeline, FILTER_BITSHUFFLE, FILTER_NOOP, FILTER_SHUFFLE,
    MAX_FILTERS,
};
use crate::header::MAX_CHUNK_NBYTES;
use crate::pool;

pub const MAX_CLEVEL:   u8    = 9;
pub const MAX_TYPESIZE: usize = 255;

pub const DEFAULT_CLEVEL:   u8    = 5;
pub const DEFAULT_TYPESIZE: usize = 8;

/// Whether a block is compressed as one stream or as one stream per
/// byte lane of the item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SplitMode {
    Always,
    Never,
    #[default]
    Auto,
}

impl SplitMode {
    fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "always" => Some(SplitMode::Always),
            "never"  => Some(SplitMode::Never),
            "auto"   => Some(SplitMode::Auto),
            _        => None,
        }
    }
}

// ── Block hooks ──────────────────────────────────────────────────────────────

/// What a hook sees for one block.
pub struct BlockInfo<'a> {
    pub nblock:   usize,
    /// Byte offset of the block inside the chunk.
    pub offset:   usize,
    pub typesize: usize,
    pub src:      &'a [u8],
}

/// Per-block callback: fills `dest` (same length as `block.src`).
///
/// As a prefilter it produces the bytes that get filtered and compressed;
/// as a postfilter it rewrites each decoded block before it is returned.
pub trait BlockHook: Send + Sync {
    fn process(&self, block: &BlockInfo<'_>, dest: &mut [u8]) -> Result<()>;
}

impl<F> BlockHook for F
where
    F: Fn(&BlockInfo<'_>, &mut [u8]) -> Result<()> + Send + Sync,
{
    fn process(&self, block: &BlockInfo<'_>, dest: &mut [u8]) -> Result<()> {
        self(block, dest)
    }
}

#[derive(Clone)]
pub struct Hook(pub Arc<dyn BlockHook>);

impl Hook {
    pub fn new<H: BlockHook + 'static>(hook: H) -> Self {
        Hook(Arc::new(hook))
    }
}

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Hook(..)")
    }
}

// ── CParams ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CParams {
    pub codec:      u8,
    pub codec_meta: u8,
    /// 0 stores data uncompressed; 9 is the slowest, tightest setting.
    pub clevel:     u8,
    /// Item size in bytes; 0 means an untyped byte stream.
    pub typesize:   usize,
    pub nthreads:   usize,
    /// 0 selects the block size automatically.
    pub blocksize:  usize,
    pub splitmode:  SplitMode,
    pub filters:    FilterStack,
    #[serde(skip)]
    pub prefilter:  Option<Hook>,
}

impl Default for CParams {
    fn default() -> Self {
        Self {
            codec:      CODEC_LZ4,
            codec_meta: 0,
            clevel:     DEFAULT_CLEVEL,
            typesize:   DEFAULT_TYPESIZE,
            nthreads:   pool::nthreads(),
            blocksize:  0,
            splitmode:  SplitMode::Auto,
            filters:    single_filter(FilterSlot::new(FILTER_SHUFFLE, 0)),
            prefilter:  None,
        }
    }
}

impl CParams {
    /// Check every field, including that the codec and filters are
    /// registered and accept this typesize.
    pub fn validate(&self) -> Result<()> {
        if self.clevel > MAX_CLEVEL {
            return Err(Error::invalid(format!("clevel {} outside 0..={MAX_CLEVEL}", self.clevel)));
        }
        if self.typesize > MAX_TYPESIZE {
            return Err(Error::invalid(format!("typesize {} exceeds {MAX_TYPESIZE}", self.typesize)));
        }
        if self.blocksize > MAX_CHUNK_NBYTES {
            return Err(Error::invalid(format!("blocksize {} exceeds the format limit", self.blocksize)));
        }
        pool::check_nthreads(self.nthreads)?;
        codec::get_codec(self.codec)?;
        Pipeline::new(&self.filters, self.typesize)?;
        Ok(())
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::invalid(format!("cparams: {e}")))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::invalid(format!("cparams: {e}")))
    }

    pub fn has_filter(&self, id: u8) -> bool {
        self.filters.iter().any(|s| s.id == id)
    }

    /// Apply overrides from the process environment.
    ///
    /// | variable | value |
    /// |---|---|
    /// | `SUPCHUNK_CLEVEL` | 0–9 |
    /// | `SUPCHUNK_TYPESIZE` | 0–255 |
    /// | `SUPCHUNK_CODEC` | codec name, e.g. `zstd` |
    /// | `SUPCHUNK_NTHREADS` | 1–256 |
    /// | `SUPCHUNK_BLOCKSIZE` | bytes, 0 = auto |
    /// | `SUPCHUNK_SHUFFLE` | `noshuffle`, `shuffle`, `bitshuffle` |
    /// | `SUPCHUNK_SPLITMODE` | `always`, `never`, `auto` |
    ///
    /// Unparseable values are logged and ignored.
    pub fn apply_env(self) -> Self {
        self.apply_env_with(|key| std::env::var(key).ok())
    }

    pub fn apply_env_with<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(key: &str, value: &str) -> Option<T> {
            let v = value.trim().parse().ok();
            if v.is_none() {
                warn!("ignoring {key}={value:?}: not a number");
            }
            v
        }

        if let Some(v) = lookup("SUPCHUNK_CLEVEL").and_then(|v| parsed("SUPCHUNK_CLEVEL", &v)) {
            self.clevel = v;
        }
        if let Some(v) = lookup("SUPCHUNK_TYPESIZE").and_then(|v| parsed("SUPCHUNK_TYPESIZE", &v)) {
            self.typesize = v;
        }
        if let Some(v) = lookup("SUPCHUNK_NTHREADS").and_then(|v| parsed("SUPCHUNK_NTHREADS", &v)) {
            self.nthreads = v;
        }
        if let Some(v) = lookup("SUPCHUNK_BLOCKSIZE").and_then(|v| parsed("SUPCHUNK_BLOCKSIZE", &v)) {
            self.blocksize = v;
        }
        if let Some(name) = lookup("SUPCHUNK_CODEC") {
            match codec::codec_id_from_name(name.trim()) {
                Some(id) => self.codec = id,
                None     => warn!("ignoring SUPCHUNK_CODEC={name:?}: unknown codec"),
            }
        }
        if let Some(name) = lookup("SUPCHUNK_SHUFFLE") {
            let id = match name.trim().to_lowercase().as_str() {
                "noshuffle"  => Some(FILTER_NOOP),
                "shuffle"    => Some(FILTER_SHUFFLE),
                "bitshuffle" => Some(FILTER_BITSHUFFLE),
                _            => None,
            };
            match id {
                Some(id) => self.filters[MAX_FILTERS - 1] = FilterSlot::new(id, 0),
                None     => warn!("ignoring SUPCHUNK_SHUFFLE={name:?}"),
            }
        }
        if let Some(name) = lookup("SUPCHUNK_SPLITMODE") {
            match SplitMode::from_name(name.trim()) {
                Some(mode) => self.splitmode = mode,
                None       => warn!("ignoring SUPCHUNK_SPLITMODE={name:?}"),
            }
        }
        self
    }
}

// ── DParams ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DParams {
    pub nthreads:   usize,
    #[serde(skip)]
    pub postfilter: Option<Hook>,
}

impl Default for DParams {
    fn default() -> Self {
        Self { nthreads: pool::nthreads(), postfilter: None }
    }
}

impl DParams {
    pub fn validate(&self) -> Result<()> {
        pool::check_nthreads(self.nthreads)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::codec::CODEC_ZSTD;

    #[test]
    fn defaults_validate() {
        CParams::default().validate().unwrap();
        DParams::default().validate().unwrap();
    }

    #[test]
    fn out_of_range_fields_are_invalid_parameters() {
        let bad = [
            CParams { clevel: 10, ..Default::default() },
            CParams { typesize: 256, ..Default::default() },
            CParams { nthreads: 0, ..Default::default() },
        ];
        for p in bad {
            assert_eq!(p.validate().unwrap_err().kind(), crate::ErrorKind::InvalidParameter);
        }
        let p = CParams { codec: 120, ..Default::default() };
        assert_eq!(p.validate().unwrap_err().kind(), crate::ErrorKind::NotFound);
        let p = CParams { typesize: 0, ..Default::default() };
        assert_eq!(p.validate().unwrap_err().kind(), crate::ErrorKind::InvalidParameter);
    }

    #[test]
    fn json_config_fills_defaults() {
        let p = CParams::from_json(r#"{"codec": 5, "clevel": 9, "splitmode": "never"}"#).unwrap();
        assert_eq!(p.codec, CODEC_ZSTD);
        assert_eq!(p.clevel, 9);
        assert_eq!(p.splitmode, SplitMode::Never);
        assert_eq!(p.typesize, DEFAULT_TYPESIZE);
        let again = CParams::from_json(&p.to_json().unwrap()).unwrap();
        assert_eq!(again.filters, p.filters);
    }

    #[test]
    fn env_overrides() {
        let env: HashMap<&str, &str> = [
            ("SUPCHUNK_CLEVEL", "9"),
            ("SUPCHUNK_CODEC", "ZSTD"),
            ("SUPCHUNK_SHUFFLE", "bitshuffle"),
            ("SUPCHUNK_TYPESIZE", "four"),
            ("SUPCHUNK_SPLITMODE", "always"),
        ].into_iter().collect();
        let p = CParams::default().apply_env_with(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(p.clevel, 9);
        assert_eq!(p.codec, CODEC_ZSTD);
        assert_eq!(p.filters[MAX_FILTERS - 1].id, FILTER_BITSHUFFLE);
        assert_eq!(p.typesize, DEFAULT_TYPESIZE);
        assert_eq!(p.splitmode, SplitMode::Always);
    }
}
