//! Reference-counted byte ranges. Cutting a `Slice` never copies; the
//! sub-slice keeps the parent buffer alive.

use std::fmt;
use std::ops::{Deref, Range};

use bytes::{Bytes, BytesMut};

#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Slice(Bytes);

impl Slice {
    pub fn new() -> Self {
        Slice(Bytes::new())
    }

    pub fn from_static(bytes: &'static [u8]) -> Self {
        Slice(Bytes::from_static(bytes))
    }

    pub fn from_copied(bytes: &[u8]) -> Self {
        Slice(Bytes::copy_from_slice(bytes))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Zero-copy view of `range`.
    ///
    /// # Panics
    ///
    /// Panics if `range` is out of bounds.
    pub fn cut(&self, range: Range<usize>) -> Slice {
        Slice(self.0.slice(range))
    }

    /// Split off and return the first `offset` bytes, leaving the rest in `self`.
    pub fn take_until_offset(&mut self, offset: usize) -> Slice {
        Slice(self.0.split_to(offset.min(self.0.len())))
    }

    pub fn trim_begin(&mut self, n: usize) {
        let n = n.min(self.0.len());
        let _ = self.0.split_to(n);
    }

    pub fn trim_end(&mut self, n: usize) {
        let keep = self.0.len().saturating_sub(n);
        self.0.truncate(keep);
    }

    /// New slice holding `prefix` followed by `self`.
    pub fn with_prefix(&self, prefix: &[u8]) -> Slice {
        let mut out = BytesMut::with_capacity(prefix.len() + self.len());
        out.extend_from_slice(prefix);
        out.extend_from_slice(&self.0);
        Slice(out.freeze())
    }

    /// Concatenate slices. A single non-empty input is returned without copying.
    pub fn join<I: IntoIterator<Item = Slice>>(parts: I) -> Slice {
        let parts: Vec<Slice> = parts.into_iter().filter(|s| !s.is_empty()).collect();
        match parts.len() {
            0 => Slice::new(),
            1 => parts.into_iter().next().unwrap_or_default(),
            _ => {
                let total = parts.iter().map(Slice::len).sum();
                let mut out = BytesMut::with_capacity(total);
                for p in &parts {
                    out.extend_from_slice(p);
                }
                Slice(out.freeze())
            }
        }
    }

    /// Whether `self` points into the same memory as `other` (used to check
    /// that decoding hands out views rather than copies).
    pub fn is_view_of(&self, other: &Slice) -> bool {
        let outer = other.0.as_ptr_range();
        let inner = self.0.as_ptr_range();
        !self.is_empty() && inner.start >= outer.start && inner.end <= outer.end
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }
}

impl Deref for Slice {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for Slice {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for Slice {
    fn from(v: Vec<u8>) -> Self {
        Slice(Bytes::from(v))
    }
}

impl From<Bytes> for Slice {
    fn from(b: Bytes) -> Self {
        Slice(b)
    }
}

impl From<BytesMut> for Slice {
    fn from(b: BytesMut) -> Self {
        Slice(b.freeze())
    }
}

impl From<&'static str> for Slice {
    fn from(s: &'static str) -> Self {
        Slice(Bytes::from_static(s.as_bytes()))
    }
}

impl fmt::Debug for Slice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const SHOWN: usize = 16;
        write!(f, "Slice[{}]{{", self.len())?;
        for (i, b) in self.0.iter().take(SHOWN).enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{:02x}", b)?;
        }
        if self.len() > SHOWN {
            f.write_str(" ..")?;
        }
        f.write_str("}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cut_is_zero_copy() {
        let s = Slice::from(vec![1u8, 2, 3, 4, 5]);
        let mid = s.cut(1..4);
        assert_eq!(mid.as_bytes(), &[2, 3, 4]);
        assert!(mid.is_view_of(&s));
        assert!(!Slice::from_copied(&[2, 3, 4]).is_view_of(&s));
    }

    #[test]
    fn trim_and_take() {
        let mut s = Slice::from(vec![0u8, 1, 2, 3, 4, 5, 6]);
        s.trim_begin(1);
        s.trim_end(2);
        assert_eq!(s.as_bytes(), &[1, 2, 3, 4]);
        let head = s.take_until_offset(3);
        assert_eq!(head.as_bytes(), &[1, 2, 3]);
        assert_eq!(s.as_bytes(), &[4]);
        s.trim_end(10);
        assert!(s.is_empty());
    }

    #[test]
    fn prefix_and_join() {
        let s = Slice::from_static(b"world");
        assert_eq!(s.with_prefix(b"hello ").as_bytes(), b"hello world");
        let joined = Slice::join(vec![
            Slice::from_static(b"a"),
            Slice::new(),
            Slice::from_static(b"bc"),
        ]);
        assert_eq!(joined.as_bytes(), b"abc");
        let one = Slice::from(vec![9u8; 4]);
        assert!(Slice::join(vec![one.clone()]).is_view_of(&one));
    }

    #[test]
    fn debug_truncates() {
        let s = Slice::from(vec![0xabu8; 20]);
        let text = format!("{:?}", s);
        assert!(text.starts_with("Slice[20]{ab ab"));
        assert!(text.ends_with(" ..}"));
    }
}
