//! Compressed-chunk header: 32 bytes, strictly little-endian.
//!
//! ```text
//! off  size  field
//!   0     2  magic          0xB2 0x5C
//!   2     1  version
//!   3     1  flags          0x01 memcpyed, 0x02 big-endian producer,
//!                           0x04 split streams, bits 4..6 special kind
//!   4     1  typesize
//!   5     1  codec id
//!   6     1  codec meta
//!   7     1  clevel
//!   8     4  nbytes         logical (uncompressed) length
//!  12     4  blocksize
//!  16     4  cbytes         physical length including this header
//!  20     6  filter ids
//!  26     6  filter metas
//! ```

use std::io::{self, Read, Write};

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::filter::{FilterSlot, FilterStack, MAX_FILTERS};

pub const MAGIC:       [u8; 2] = [0xB2, 0x5C];
pub const VERSION:     u8      = 1;
pub const HEADER_SIZE: usize   = 32;

/// Largest logical chunk length the 32-bit size fields can describe.
pub const MAX_CHUNK_NBYTES: usize = i32::MAX as usize;

pub const FLAG_MEMCPYED:   u8 = 0x01;
pub const FLAG_BIG_ENDIAN: u8 = 0x02;
pub const FLAG_SPLIT:      u8 = 0x04;
const SPECIAL_SHIFT: u8 = 4;
const SPECIAL_MASK:  u8 = 0x70;

/// Kind of header-only chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpecialKind {
    Zeros,
    Nan,
    Value,
    Uninit,
}

impl SpecialKind {
    fn code(self) -> u8 {
        match self {
            SpecialKind::Zeros  => 1,
            SpecialKind::Nan    => 2,
            SpecialKind::Value  => 3,
            SpecialKind::Uninit => 4,
        }
    }

    fn from_code(code: u8) -> Option<Option<Self>> {
        match code {
            0 => Some(None),
            1 => Some(Some(SpecialKind::Zeros)),
            2 => Some(Some(SpecialKind::Nan)),
            3 => Some(Some(SpecialKind::Value)),
            4 => Some(Some(SpecialKind::Uninit)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkHeader {
    pub version:    u8,
    pub flags:      u8,
    pub typesize:   u8,
    pub codec:      u8,
    pub codec_meta: u8,
    pub clevel:     u8,
    pub nbytes:     u32,
    pub blocksize:  u32,
    pub cbytes:     u32,
    pub filters:    FilterStack,
}

impl ChunkHeader {
    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_all(&MAGIC)?;
        writer.write_u8(self.version)?;
        writer.write_u8(self.flags)?;
        writer.write_u8(self.typesize)?;
        writer.write_u8(self.codec)?;
        writer.write_u8(self.codec_meta)?;
        writer.write_u8(self.clevel)?;
        writer.write_u32::<LittleEndian>(self.nbytes)?;
        writer.write_u32::<LittleEndian>(self.blocksize)?;
        writer.write_u32::<LittleEndian>(self.cbytes)?;
        for slot in &self.filters {
            writer.write_u8(slot.id)?;
        }
        for slot in &self.filters {
            writer.write_u8(slot.meta)?;
        }
        Ok(())
    }

    /// Read the raw fields without any consistency checks beyond the magic.
    pub fn read<R: Read>(mut reader: R) -> Result<Self> {
        let mut magic = [0u8; 2];
        reader.read_exact(&mut magic)?;
        if magic != MAGIC {
            return Err(Error::header(format!("bad chunk magic {:02x}{:02x}", magic[0], magic[1])));
        }
        let version    = reader.read_u8()?;
        let flags      = reader.read_u8()?;
        let typesize   = reader.read_u8()?;
        let codec      = reader.read_u8()?;
        let codec_meta = reader.read_u8()?;
        let clevel     = reader.read_u8()?;
        let nbytes     = reader.read_u32::<LittleEndian>()?;
        let blocksize  = reader.read_u32::<LittleEndian>()?;
        let cbytes     = reader.read_u32::<LittleEndian>()?;
        let mut filters = [FilterSlot::noop(); MAX_FILTERS];
        for slot in filters.iter_mut() {
            slot.id = reader.read_u8()?;
        }
        for slot in filters.iter_mut() {
            slot.meta = reader.read_u8()?;
        }
        Ok(Self { version, flags, typesize, codec, codec_meta, clevel, nbytes, blocksize, cbytes, filters })
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..2].copy_from_slice(&MAGIC);
        buf[2] = self.version;
        buf[3] = self.flags;
        buf[4] = self.typesize;
        buf[5] = self.codec;
        buf[6] = self.codec_meta;
        buf[7] = self.clevel;
        LittleEndian::write_u32(&mut buf[8..12], self.nbytes);
        LittleEndian::write_u32(&mut buf[12..16], self.blocksize);
        LittleEndian::write_u32(&mut buf[16..20], self.cbytes);
        for (i, slot) in self.filters.iter().enumerate() {
            buf[20 + i] = slot.id;
            buf[20 + MAX_FILTERS + i] = slot.meta;
        }
        buf
    }

    /// Parse and validate the header at the start of `chunk`.
    ///
    /// Checks magic, version, and that the size fields agree with each
    /// other and with the length of `chunk`.
    pub fn parse(chunk: &[u8]) -> Result<Self> {
        if chunk.len() < HEADER_SIZE {
            return Err(Error::header(format!(
                "chunk of {} bytes is shorter than the {HEADER_SIZE}-byte header", chunk.len()
            )));
        }
        let h = Self::read(&chunk[..HEADER_SIZE])?;
        if h.version == 0 || h.version > VERSION {
            return Err(Error::header(format!("unsupported chunk version {}", h.version)));
        }
        let kind = SpecialKind::from_code((h.flags & SPECIAL_MASK) >> SPECIAL_SHIFT)
            .ok_or_else(|| Error::header(format!("unknown special kind in flags {:#04x}", h.flags)))?;
        let cbytes = h.cbytes as usize;
        let nbytes = h.nbytes as usize;
        if cbytes < HEADER_SIZE || cbytes > chunk.len() {
            return Err(Error::header(format!(
                "declared cbytes {cbytes} inconsistent with buffer of {} bytes", chunk.len()
            )));
        }
        if nbytes > MAX_CHUNK_NBYTES {
            return Err(Error::header(format!("nbytes {nbytes} exceeds the format limit")));
        }

        match kind {
            Some(k) => {
                let expected = HEADER_SIZE + if k == SpecialKind::Value { usize::from(h.typesize) } else { 0 };
                if cbytes != expected {
                    return Err(Error::header(format!(
                        "special chunk declares cbytes {cbytes}, expected {expected}"
                    )));
                }
                if k == SpecialKind::Nan && !matches!(h.typesize, 4 | 8) {
                    return Err(Error::header(format!("NaN chunk with typesize {}", h.typesize)));
                }
            }
            None if h.is_memcpyed() => {
                if cbytes != HEADER_SIZE + nbytes {
                    return Err(Error::header(format!(
                        "memcpyed chunk declares cbytes {cbytes} for nbytes {nbytes}"
                    )));
                }
                if nbytes > 0 && (h.blocksize == 0 || h.blocksize > h.nbytes) {
                    return Err(Error::header(format!(
                        "memcpyed chunk has blocksize {} for nbytes {nbytes}", h.blocksize
                    )));
                }
            }
            None => {
                if nbytes == 0 {
                    if cbytes != HEADER_SIZE {
                        return Err(Error::header("empty chunk carries block data"));
                    }
                } else if h.blocksize == 0 || h.blocksize > h.nbytes {
                    return Err(Error::header(format!(
                        "blocksize {} inconsistent with nbytes {nbytes}", h.blocksize
                    )));
                }
            }
        }
        Ok(h)
    }

    pub fn is_memcpyed(&self) -> bool {
        self.flags & FLAG_MEMCPYED != 0
    }

    pub fn is_split(&self) -> bool {
        self.flags & FLAG_SPLIT != 0
    }

    pub fn special_kind(&self) -> Option<SpecialKind> {
        SpecialKind::from_code((self.flags & SPECIAL_MASK) >> SPECIAL_SHIFT).flatten()
    }

    pub(crate) fn set_special(&mut self, kind: SpecialKind) {
        self.flags = (self.flags & !SPECIAL_MASK) | (kind.code() << SPECIAL_SHIFT);
    }

    pub fn nblocks(&self) -> usize {
        if self.nbytes == 0 || self.blocksize == 0 {
            return 0;
        }
        (self.nbytes as usize).div_ceil(self.blocksize as usize)
    }

    /// Logical length of block `nblock`; the last one may be short.
    pub fn block_len(&self, nblock: usize) -> usize {
        let bs    = self.blocksize as usize;
        let start = nblock * bs;
        bs.min(self.nbytes as usize - start)
    }

    /// Item width used for range arithmetic; typesize 0 means bytes.
    pub fn item_size(&self) -> usize {
        usize::from(self.typesize.max(1))
    }
}

/// Flags every freshly produced chunk starts with.
pub(crate) fn host_flags() -> u8 {
    if cfg!(target_endian = "big") { FLAG_BIG_ENDIAN } else { 0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ChunkHeader {
        ChunkHeader {
            version:    VERSION,
            flags:      FLAG_SPLIT,
            typesize:   4,
            codec:      5,
            codec_meta: 0,
            clevel:     5,
            nbytes:     1000,
            blocksize:  256,
            cbytes:     40,
            filters:    crate::filter::single_filter(FilterSlot::new(1, 0)),
        }
    }

    #[test]
    fn header_roundtrip_preserves_fields() {
        let h = sample();
        let mut chunk = h.to_bytes().to_vec();
        chunk.extend_from_slice(&[0u8; 8]);
        let back = ChunkHeader::parse(&chunk).unwrap();
        assert_eq!(back, h);
        assert_eq!(back.nblocks(), 4);
        assert_eq!(back.block_len(3), 1000 - 768);
    }

    #[test]
    fn rejects_bad_magic_and_future_version() {
        let mut bytes = sample().to_bytes().to_vec();
        bytes.extend_from_slice(&[0u8; 8]);
        let mut bad = bytes.clone();
        bad[0] = 0;
        assert_eq!(ChunkHeader::parse(&bad).unwrap_err().kind(), crate::ErrorKind::InvalidHeader);
        let mut future = bytes;
        future[2] = VERSION + 1;
        assert_eq!(ChunkHeader::parse(&future).unwrap_err().kind(), crate::ErrorKind::InvalidHeader);
    }

    #[test]
    fn rejects_truncated_chunk() {
        let h = sample();
        // cbytes says 40 but only the header is present.
        let err = ChunkHeader::parse(&h.to_bytes()).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::InvalidHeader);
    }

    #[test]
    fn to_bytes_matches_streamed_write() {
        let h = sample();
        let mut streamed = Vec::new();
        h.write(&mut streamed).unwrap();
        assert_eq!(&h.to_bytes()[..], &streamed[..]);
    }

    #[test]
    fn memcpyed_chunk_needs_a_usable_blocksize() {
        let mut h = sample();
        h.flags = FLAG_MEMCPYED;
        h.nbytes = 64;
        h.cbytes = (HEADER_SIZE + 64) as u32;
        for bad in [0, 65] {
            h.blocksize = bad;
            let mut chunk = h.to_bytes().to_vec();
            chunk.resize(HEADER_SIZE + 64, 0);
            assert_eq!(ChunkHeader::parse(&chunk).unwrap_err().kind(), crate::ErrorKind::InvalidHeader);
        }
        h.blocksize = 16;
        let mut chunk = h.to_bytes().to_vec();
        chunk.resize(HEADER_SIZE + 64, 0);
        assert_eq!(ChunkHeader::parse(&chunk).unwrap().nblocks(), 4);
    }

    #[test]
    fn special_kind_lives_in_flags() {
        let mut h = sample();
        h.flags = 0;
        h.cbytes = HEADER_SIZE as u32;
        h.set_special(SpecialKind::Zeros);
        assert_eq!(h.special_kind(), Some(SpecialKind::Zeros));
        let back = ChunkHeader::parse(&h.to_bytes()).unwrap();
        assert_eq!(back.special_kind(), Some(SpecialKind::Zeros));
    }
}
