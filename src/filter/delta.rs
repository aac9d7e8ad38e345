//! Delta and XOR-delta kernels.
//!
//! Delta stores each item minus its predecessor (wrapping) and reverses by
//! cumulative sum.  Items of 1, 2, 4 or 8 bytes are treated as
//! little-endian integers; any other item size falls back to byte-wise
//! differences at a stride of `elem`.  XOR-delta is the same idea with
//! XOR, which needs no carry and so is always byte-wise.  The first item
//! and any trailing partial item are stored unchanged.
//!
//! The float predictor suits floating-point data: it regroups the bytes of
//! every item into planes, most significant byte first, then stores each
//! byte of that row minus the one before it.

fn read_le(bytes: &[u8]) -> u64 {
    bytes.iter().rev().fold(0u64, |acc, &b| (acc << 8) | u64::from(b))
}

fn write_le(value: u64, out: &mut [u8]) {
    for (i, o) in out.iter_mut().enumerate() {
        *o = (value >> (8 * i)) as u8;
    }
}

fn is_integer_width(elem: usize) -> bool {
    matches!(elem, 1 | 2 | 4 | 8)
}

fn mask(elem: usize) -> u64 {
    if elem >= 8 { u64::MAX } else { (1u64 << (8 * elem)) - 1 }
}

pub fn delta_encode(src: &[u8], dest: &mut [u8], elem: usize) {
    let body = src.len() / elem * elem;
    dest.copy_from_slice(src);
    if body <= elem {
        return;
    }
    if is_integer_width(elem) {
        let m = mask(elem);
        for start in (elem..body).step_by(elem) {
            let prev = read_le(&src[start - elem..start]);
            let cur  = read_le(&src[start..start + elem]);
            write_le(cur.wrapping_sub(prev) & m, &mut dest[start..start + elem]);
        }
    } else {
        for i in elem..body {
            dest[i] = src[i].wrapping_sub(src[i - elem]);
        }
    }
}

pub fn delta_decode(src: &[u8], dest: &mut [u8], elem: usize) {
    let body = src.len() / elem * elem;
    dest.copy_from_slice(src);
    if body <= elem {
        return;
    }
    if is_integer_width(elem) {
        let m = mask(elem);
        for start in (elem..body).step_by(elem) {
            let prev = read_le(&dest[start - elem..start]);
            let diff = read_le(&src[start..start + elem]);
            write_le(prev.wrapping_add(diff) & m, &mut dest[start..start + elem]);
        }
    } else {
        for i in elem..body {
            dest[i] = src[i].wrapping_add(dest[i - elem]);
        }
    }
}

pub fn xor_encode(src: &[u8], dest: &mut [u8], elem: usize) {
    let body = src.len() / elem * elem;
    dest.copy_from_slice(src);
    for i in elem..body {
        dest[i] = src[i] ^ src[i - elem];
    }
}

pub fn xor_decode(src: &[u8], dest: &mut [u8], elem: usize) {
    let body = src.len() / elem * elem;
    dest.copy_from_slice(src);
    for i in elem..body {
        dest[i] = src[i] ^ dest[i - elem];
    }
}

pub fn floatpred_encode(src: &[u8], dest: &mut [u8], elem: usize) {
    let body = src.len() / elem * elem;
    let n    = body / elem;
    dest.copy_from_slice(src);
    let mut row = vec![0u8; body];
    for (j, plane) in row.chunks_exact_mut(n.max(1)).take(elem).enumerate() {
        for (k, b) in plane.iter_mut().enumerate() {
            *b = src[k * elem + (elem - 1 - j)];
        }
    }
    let mut prev = 0u8;
    for (d, &b) in dest[..body].iter_mut().zip(&row) {
        *d = b.wrapping_sub(prev);
        prev = b;
    }
}

pub fn floatpred_decode(src: &[u8], dest: &mut [u8], elem: usize) {
    let body = src.len() / elem * elem;
    let n    = body / elem;
    dest.copy_from_slice(src);
    let mut row = Vec::with_capacity(body);
    let mut acc = 0u8;
    for &b in &src[..body] {
        acc = acc.wrapping_add(b);
        row.push(acc);
    }
    for (j, plane) in row.chunks_exact(n.max(1)).take(elem).enumerate() {
        for (k, &b) in plane.iter().enumerate() {
            dest[k * elem + (elem - 1 - j)] = b;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_of_arithmetic_sequence_is_constant() {
        let src: Vec<u8> = (100u32..110).flat_map(|v| v.to_le_bytes()).collect();
        let mut dest = vec![0u8; src.len()];
        delta_encode(&src, &mut dest, 4);
        assert_eq!(&dest[..4], &100u32.to_le_bytes());
        for item in dest[4..].chunks_exact(4) {
            assert_eq!(item, &1u32.to_le_bytes());
        }
        let mut back = vec![0u8; src.len()];
        delta_decode(&dest, &mut back, 4);
        assert_eq!(back, src);
    }

    #[test]
    fn delta_wraps_on_decreasing_values() {
        let src: Vec<u8> = [5u16, 3, 0, 65535].iter().flat_map(|v| v.to_le_bytes()).collect();
        let mut dest = vec![0u8; src.len()];
        delta_encode(&src, &mut dest, 2);
        assert_eq!(&dest[2..4], &(3u16.wrapping_sub(5)).to_le_bytes());
        let mut back = vec![0u8; src.len()];
        delta_decode(&dest, &mut back, 2);
        assert_eq!(back, src);
    }

    #[test]
    fn odd_item_sizes_roundtrip() {
        let src: Vec<u8> = (0u8..=200).rev().collect();
        for elem in [3usize, 5, 7, 12] {
            let mut enc = vec![0u8; src.len()];
            let mut dec = vec![0u8; src.len()];
            delta_encode(&src, &mut enc, elem);
            delta_decode(&enc, &mut dec, elem);
            assert_eq!(dec, src);
            xor_encode(&src, &mut enc, elem);
            xor_decode(&enc, &mut dec, elem);
            assert_eq!(dec, src);
            floatpred_encode(&src, &mut enc, elem);
            floatpred_decode(&enc, &mut dec, elem);
            assert_eq!(dec, src);
        }
    }

    #[test]
    fn floatpred_groups_byte_planes() {
        let values = [1.0f32, 1.5, 2.0, 2.5];
        let src: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).chain([9u8, 8]).collect();
        let mut enc = vec![0u8; src.len()];
        floatpred_encode(&src, &mut enc, 4);
        // Exponent bytes lead and differ little from item to item.
        assert_eq!(enc[0], 0x3F);
        assert_eq!(&enc[1..4], &[0, 1, 0]);
        assert_eq!(&enc[16..], &[9, 8]);
        let mut back = vec![0u8; src.len()];
        floatpred_decode(&enc, &mut back, 4);
        assert_eq!(back, src);
    }
}
