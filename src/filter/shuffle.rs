//! Byte- and bit-shuffle kernels.
//!
//! Byte shuffle regroups a row-oriented stream of `elem`-byte items into
//! byte planes: all first bytes, then all second bytes, and so on.  Bit
//! shuffle goes one level further and emits bit planes, working on whole
//! groups of 8 items.  Bytes that do not fill a whole item (or group) are
//! copied through unchanged, so both kernels accept any input length.

pub fn shuffle(src: &[u8], dest: &mut [u8], elem: usize) {
    let n    = src.len() / elem;
    let body = n * elem;
    if elem == 1 || n == 0 {
        dest.copy_from_slice(src);
        return;
    }
    for (i, item) in src[..body].chunks_exact(elem).enumerate() {
        for (j, &b) in item.iter().enumerate() {
            dest[j * n + i] = b;
        }
    }
    dest[body..].copy_from_slice(&src[body..]);
}

pub fn unshuffle(src: &[u8], dest: &mut [u8], elem: usize) {
    let n    = src.len() / elem;
    let body = n * elem;
    if elem == 1 || n == 0 {
        dest.copy_from_slice(src);
        return;
    }
    for (i, item) in dest[..body].chunks_exact_mut(elem).enumerate() {
        for (j, b) in item.iter_mut().enumerate() {
            *b = src[j * n + i];
        }
    }
    dest[body..].copy_from_slice(&src[body..]);
}

/// Bit-plane transpose over `n` items, `n` a multiple of 8.
pub fn bitshuffle(src: &[u8], dest: &mut [u8], elem: usize) {
    let n         = src.len() / elem / 8 * 8;
    let body      = n * elem;
    let row_bytes = n / 8;
    dest[..body].fill(0);
    for (i, item) in src[..body].chunks_exact(elem).enumerate() {
        for (j, &byte) in item.iter().enumerate() {
            for k in 0..8 {
                if (byte >> k) & 1 == 1 {
                    let row = j * 8 + k;
                    dest[row * row_bytes + i / 8] |= 1 << (i % 8);
                }
            }
        }
    }
    dest[body..].copy_from_slice(&src[body..]);
}

pub fn bitunshuffle(src: &[u8], dest: &mut [u8], elem: usize) {
    let n         = src.len() / elem / 8 * 8;
    let body      = n * elem;
    let row_bytes = n / 8;
    dest[..body].fill(0);
    for row in 0..elem * 8 {
        let (j, k) = (row / 8, row % 8);
        let plane  = &src[row * row_bytes..(row + 1) * row_bytes];
        for i in 0..n {
            if (plane[i / 8] >> (i % 8)) & 1 == 1 {
                dest[i * elem + j] |= 1 << k;
            }
        }
    }
    dest[body..].copy_from_slice(&src[body..]);
}
