//! Reference in-process run-length codec.
//!
//! Paired with the shuffle filter this is enough to compress typed numeric
//! data well: shuffling turns slowly varying high-order bytes into long
//! runs.  The encoded format is a sequence of frames:
//! ```text
//! LIT frame: 0x00 <u16 LE count> <count raw bytes>
//! RUN frame: 0x01 <u16 LE count> <byte>
//! ```
//! Maximum frame length: 65535 bytes.

use super::{Codec, CodecError};

const FRAME_LIT: u8 = 0x00;
const FRAME_RUN: u8 = 0x01;
const MIN_RUN:   usize = 4;
const MAX_FRAME: usize = u16::MAX as usize;

pub struct RleCodec;

impl Codec for RleCodec {
    fn name(&self) -> &str { "rle" }

    fn compress(&self, data: &[u8], _: u8, _: u8, capacity: usize) -> Result<Vec<u8>, CodecError> {
        rle_encode(data, capacity).ok_or(CodecError::Overflow { capacity })
    }

    fn decompress(&self, data: &[u8], _: u8, expected_len: usize) -> Result<Vec<u8>, CodecError> {
        rle_decode(data, expected_len)
    }
}

/// Length of the run of `data[start]` beginning at `start`, capped at `cap`.
fn run_length(data: &[u8], start: usize, cap: usize) -> usize {
    let byte = data[start];
    data[start..].iter().take(cap).take_while(|&&b| b == byte).count()
}

/// Encode `data`, giving up with `None` as soon as the output would
/// exceed `capacity`.
pub fn rle_encode(data: &[u8], capacity: usize) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity((data.len() / 4 + 16).min(capacity));
    let mut i   = 0usize;

    while i < data.len() {
        let run_len = run_length(data, i, MAX_FRAME);
        if run_len >= MIN_RUN {
            if out.len() + 4 > capacity { return None; }
            out.push(FRAME_RUN);
            out.extend_from_slice(&(run_len as u16).to_le_bytes());
            out.push(data[i]);
            i += run_len;
            continue;
        }

        // Accumulate literals until a run worth encoding starts, or EOF.
        let lit_start = i;
        while i < data.len() && i - lit_start < MAX_FRAME {
            if run_length(data, i, MIN_RUN) >= MIN_RUN { break; }
            i += 1;
        }
        let lit_len = i - lit_start;
        if out.len() + 3 + lit_len > capacity { return None; }
        out.push(FRAME_LIT);
        out.extend_from_slice(&(lit_len as u16).to_le_bytes());
        out.extend_from_slice(&data[lit_start..i]);
    }
    Some(out)
}

/// Decode a buffer produced by [`rle_encode`] into exactly `expected_len` bytes.
pub fn rle_decode(data: &[u8], expected_len: usize) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::with_capacity(expected_len);
    let mut i   = 0usize;

    while i < data.len() {
        if i + 3 > data.len() {
            return Err(CodecError::Corrupt(format!("truncated frame header at byte {i}")));
        }
        let frame_type = data[i];
        let count = u16::from_le_bytes([data[i + 1], data[i + 2]]) as usize;
        i += 3;

        if out.len() + count > expected_len {
            return Err(CodecError::OutputTooSmall {
                needed:    out.len() + count,
                available: expected_len,
            });
        }
        match frame_type {
            FRAME_LIT => {
                if i + count > data.len() {
                    return Err(CodecError::Corrupt(format!("literal frame overruns input at byte {i}")));
                }
                out.extend_from_slice(&data[i..i + count]);
                i += count;
            }
            FRAME_RUN => {
                let byte = *data.get(i)
                    .ok_or_else(|| CodecError::Corrupt("run frame missing its byte".into()))?;
                out.resize(out.len() + count, byte);
                i += 1;
            }
            other => return Err(CodecError::Corrupt(format!("unknown frame type {other:#04x}"))),
        }
    }

    if out.len() != expected_len {
        return Err(CodecError::Corrupt(format!(
            "stream decoded to {} bytes, expected {expected_len}", out.len()
        )));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rle_roundtrip_random() {
        let data: Vec<u8> = (0u8..=255).cycle().take(4096).collect();
        let encoded = rle_encode(&data, usize::MAX).unwrap();
        assert_eq!(rle_decode(&encoded, data.len()).unwrap(), data);
    }

    #[test]
    fn rle_roundtrip_runs() {
        let mut data = vec![0xAAu8; 100_000];
        data.extend(vec![0xBBu8; 5000]);
        data.extend(b"hello world");
        let encoded = rle_encode(&data, usize::MAX).unwrap();
        assert!(encoded.len() < data.len() / 10, "RLE should heavily compress runs");
        assert_eq!(rle_decode(&encoded, data.len()).unwrap(), data);
    }

    #[test]
    fn rle_empty() {
        assert_eq!(rle_encode(&[], 0), Some(Vec::new()));
        assert_eq!(rle_decode(&[], 0).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn rle_gives_up_past_capacity() {
        let data: Vec<u8> = (0u8..=255).collect();
        assert_eq!(rle_encode(&data, 100), None);
    }

    #[test]
    fn rle_distinguishes_corrupt_from_too_small() {
        let encoded = rle_encode(&[9u8; 64], usize::MAX).unwrap();
        assert!(matches!(rle_decode(&encoded, 32), Err(CodecError::OutputTooSmall { .. })));
        assert!(matches!(rle_decode(&encoded[..2], 64), Err(CodecError::Corrupt(_))));
        assert!(matches!(rle_decode(&[0x07, 1, 0, 0], 1), Err(CodecError::Corrupt(_))));
    }
}
