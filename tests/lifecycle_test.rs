//! `shutdown` clears process-wide state, so it runs in its own test binary.

use std::sync::Arc;

use supchunk::codec::{get_codec, Codec, CodecError, RleCodec};
use supchunk::filter::{get_filter, Filter, FilterError};
use supchunk::{compress, decompress, register_codec, register_filter, single_filter, CParams, ErrorKind, FilterSlot};

/// Run-length coding under a user id.
struct UserRle;

impl Codec for UserRle {
    fn name(&self) -> &str {
        "user-rle"
    }
    fn compress(&self, data: &[u8], level: u8, meta: u8, capacity: usize) -> Result<Vec<u8>, CodecError> {
        RleCodec.compress(data, level, meta, capacity)
    }
    fn decompress(&self, data: &[u8], meta: u8, expected_len: usize) -> Result<Vec<u8>, CodecError> {
        RleCodec.decompress(data, meta, expected_len)
    }
}

struct AddOne;

impl Filter for AddOne {
    fn name(&self) -> &str {
        "add-one"
    }
    fn forward(&self, src: &[u8], dest: &mut [u8], _: usize, _: u8) -> Result<(), FilterError> {
        for (d, s) in dest.iter_mut().zip(src) {
            *d = s.wrapping_add(1);
        }
        Ok(())
    }
    fn backward(&self, src: &[u8], dest: &mut [u8], _: usize, _: u8) -> Result<(), FilterError> {
        for (d, s) in dest.iter_mut().zip(src) {
            *d = s.wrapping_sub(1);
        }
        Ok(())
    }
}

#[test]
fn shutdown_drops_user_registrations_only() {
    supchunk::initialize();
    register_codec(210, Arc::new(UserRle)).unwrap();
    register_filter(240, Arc::new(AddOne)).unwrap();

    let cparams = CParams {
        codec: 210,
        typesize: 1,
        filters: single_filter(FilterSlot::new(240, 0)),
        ..Default::default()
    };
    let src: Vec<u8> = (0..50u8).flat_map(|v| [v; 100]).collect();
    let chunk = compress(&cparams, &src).unwrap();
    assert!(!supchunk::chunk_info(&chunk).unwrap().is_memcpyed());
    assert_eq!(decompress(&chunk).unwrap(), src);

    supchunk::shutdown();
    assert!(get_codec(210).is_err());
    assert!(get_filter(240).is_err());
    let err = decompress(&chunk).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(compress(&cparams, &src).is_err());

    // Built-ins survive and the ids can be reused.
    let plain = compress(&CParams::default(), &src).unwrap();
    assert_eq!(decompress(&plain).unwrap(), src);
    supchunk::initialize();
    register_codec(210, Arc::new(UserRle)).unwrap();
    assert_eq!(decompress(&chunk).unwrap_err().kind(), ErrorKind::NotFound);
}
