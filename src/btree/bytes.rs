//! # Borrowed-or-Owned Byte Ranges
//!
//! Keys and values inside a deserialized node start out as views into the
//! memory-mapped file — deserializing a page copies nothing. The mapping,
//! however, is replaced whenever the file grows, and a view into the old
//! mapping would dangle. `ByteRef` models this: a range is either *mapped*
//! (aliasing mmap memory) or *owned* (heap-backed), and the whole tree of
//! mapped ranges is converted to owned in one pass before any remap.
//!
//! ## Contract
//!
//! Constructing a mapped range is `unsafe`: the caller promises the range
//! will not be read after the mapping generation it aliases is replaced.
//! The engine upholds this by detaching every node (`Bucket::dereference_all`)
//! before the single place that remaps (`MmapFile::grow`).
//!
//! `ByteRef` is deliberately `!Send` and `!Sync` — the raw alias makes it
//! meaningless outside the single-writer engine that created it.

use std::cmp::Ordering;
use std::fmt;

#[derive(Clone)]
enum Repr {
    Mapped { ptr: *const u8, len: usize },
    Owned(Vec<u8>),
}

/// A byte range that either aliases the mmap or owns its storage.
#[derive(Clone)]
pub struct ByteRef {
    repr: Repr,
}

impl ByteRef {
    /// An empty owned range.
    pub const fn empty() -> Self {
        Self {
            repr: Repr::Owned(Vec::new()),
        }
    }

    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self {
            repr: Repr::Owned(bytes),
        }
    }

    /// Creates a range aliasing `bytes` without copying.
    ///
    /// # Safety
    ///
    /// `bytes` must point into storage that outlives every read of the
    /// returned range — in practice, the current mmap generation. The
    /// caller must guarantee `make_owned` runs (via the bucket's
    /// dereference pass) before that storage is unmapped or remapped.
    pub unsafe fn mapped(bytes: &[u8]) -> Self {
        Self {
            repr: Repr::Mapped {
                ptr: bytes.as_ptr(),
                len: bytes.len(),
            },
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        match &self.repr {
            // SAFETY: the construction contract guarantees the aliased
            // storage is still mapped; ptr/len came from a valid slice.
            Repr::Mapped { ptr, len } => unsafe { std::slice::from_raw_parts(*ptr, *len) },
            Repr::Owned(v) => v.as_slice(),
        }
    }

    pub fn len(&self) -> usize {
        match &self.repr {
            Repr::Mapped { len, .. } => *len,
            Repr::Owned(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_mapped(&self) -> bool {
        matches!(self.repr, Repr::Mapped { .. })
    }

    /// Replaces a mapped range with an owned copy of its bytes. Owned
    /// ranges are untouched.
    pub fn make_owned(&mut self) {
        if let Repr::Mapped { .. } = self.repr {
            self.repr = Repr::Owned(self.as_slice().to_vec());
        }
    }
}

impl Default for ByteRef {
    fn default() -> Self {
        Self::empty()
    }
}

impl From<Vec<u8>> for ByteRef {
    fn from(bytes: Vec<u8>) -> Self {
        Self::from_vec(bytes)
    }
}

impl PartialEq for ByteRef {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for ByteRef {}

impl PartialOrd for ByteRef {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ByteRef {
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_slice().cmp(other.as_slice())
    }
}

impl PartialEq<[u8]> for ByteRef {
    fn eq(&self, other: &[u8]) -> bool {
        self.as_slice() == other
    }
}

impl fmt::Debug for ByteRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_mapped() { "mapped" } else { "owned" };
        write!(f, "ByteRef({}, {:?})", kind, self.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owned_ranges_hold_their_bytes() {
        let r = ByteRef::from_vec(b"hello".to_vec());
        assert_eq!(r.as_slice(), b"hello");
        assert_eq!(r.len(), 5);
        assert!(!r.is_mapped());
    }

    #[test]
    fn mapped_ranges_alias_without_copying() {
        let backing = b"abcdef".to_vec();
        // SAFETY: backing outlives r within this test.
        let r = unsafe { ByteRef::mapped(&backing[1..4]) };

        assert!(r.is_mapped());
        assert_eq!(r.as_slice(), b"bcd");
        assert_eq!(r.as_slice().as_ptr(), backing[1..].as_ptr());
    }

    #[test]
    fn make_owned_detaches_from_the_backing() {
        let backing = b"xyz".to_vec();
        // SAFETY: backing outlives the mapped phase of r.
        let mut r = unsafe { ByteRef::mapped(&backing) };

        r.make_owned();
        drop(backing);

        assert!(!r.is_mapped());
        assert_eq!(r.as_slice(), b"xyz");
    }

    #[test]
    fn clones_of_mapped_ranges_stay_mapped() {
        let backing = b"pq".to_vec();
        // SAFETY: backing outlives both clones.
        let r = unsafe { ByteRef::mapped(&backing) };
        let c = r.clone();

        assert!(c.is_mapped());
        assert_eq!(c, r);
    }

    #[test]
    fn ordering_is_byte_lexicographic() {
        let a = ByteRef::from_vec(b"abc".to_vec());
        let b = ByteRef::from_vec(b"abd".to_vec());
        let prefix = ByteRef::from_vec(b"ab".to_vec());

        assert!(a < b);
        assert!(prefix < a);
        assert_eq!(a, ByteRef::from_vec(b"abc".to_vec()));
    }

    #[test]
    fn empty_is_empty() {
        let e = ByteRef::empty();
        assert!(e.is_empty());
        assert_eq!(e.len(), 0);
    }
}
