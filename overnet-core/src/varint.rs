//! LEB128 variable length unsigned integers: seven bits per byte, low bits
//! first, high bit set on every byte but the last.

/// Longest encoding of a `u64`.
pub const MAX_LEN: usize = 10;

pub fn wire_size_for(mut value: u64) -> usize {
    let mut n = 1;
    while value >= 0x80 {
        value >>= 7;
        n += 1;
    }
    n
}

pub fn write(mut value: u64, out: &mut Vec<u8>) {
    while value >= 0x80 {
        out.push((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

/// Read one varint from the front of `buf`, advancing it. Returns `None` on a
/// truncated or overlong (more than 64 bits) encoding; `buf` is left untouched
/// in that case.
pub fn read(buf: &mut &[u8]) -> Option<u64> {
    let mut value: u64 = 0;
    for (i, &byte) in buf.iter().enumerate().take(MAX_LEN) {
        let bits = u64::from(byte & 0x7f);
        if i == MAX_LEN - 1 && bits > 1 {
            return None;
        }
        value |= bits << (7 * i);
        if byte & 0x80 == 0 {
            *buf = &buf[i + 1..];
            return Some(value);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_at_boundaries() {
        assert_eq!(wire_size_for(0), 1);
        assert_eq!(wire_size_for(127), 1);
        assert_eq!(wire_size_for(128), 2);
        assert_eq!(wire_size_for(16_383), 2);
        assert_eq!(wire_size_for(16_384), 3);
        assert_eq!(wire_size_for(u64::from(u32::MAX)), 5);
        assert_eq!(wire_size_for(u64::MAX), MAX_LEN);
    }

    #[test]
    fn write_read_boundaries() {
        for v in [0u64, 1, 127, 128, 300, 16_384, u64::from(u32::MAX), u64::MAX] {
            let mut out = Vec::new();
            write(v, &mut out);
            assert_eq!(out.len(), wire_size_for(v));
            out.push(0xee);
            let mut cursor = out.as_slice();
            assert_eq!(read(&mut cursor), Some(v));
            assert_eq!(cursor, &[0xee]);
        }
    }

    #[test]
    fn known_encoding() {
        let mut out = Vec::new();
        write(300, &mut out);
        assert_eq!(out, vec![0xac, 0x02]);
    }

    #[test]
    fn truncated_is_rejected() {
        let data = [0x80u8, 0x80];
        let mut cursor = &data[..];
        assert_eq!(read(&mut cursor), None);
        assert_eq!(cursor.len(), 2);
        let mut empty: &[u8] = &[];
        assert_eq!(read(&mut empty), None);
    }

    #[test]
    fn overlong_is_rejected() {
        let data = [0xffu8, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x02];
        let mut cursor = &data[..];
        assert_eq!(read(&mut cursor), None);
    }
}
