//! # Meta Pages
//!
//! The first two pages of a database file each hold a meta record: the
//! format version, the page size the file was created with, the high-water
//! page id, the last committed transaction id, and an integrity checksum.
//!
//! ## Meta Layout (32 bytes, after the page header)
//!
//! ```text
//! Offset  Size  Field      Description
//! ------  ----  ---------  ----------------------------------------
//! 0       4     version    Format version
//! 4       4     page_size  Page size the file was created with
//! 8       8     pgid       High-water mark (smallest never-allocated id)
//! 16      8     txid       Last committed transaction id
//! 24      8     checksum   FNV-1a/64 over the 24 bytes above
//! ```
//!
//! ## Dual-Meta Recovery
//!
//! The meta is replicated in pages 0 and 1. A commit overwrites only the
//! page selected by `txid % 2`, so a torn meta write leaves the sibling
//! intact. On open both copies are validated; the open fails only when both
//! are bad, and when both are good the higher `txid` wins.
//!
//! ## Checksum
//!
//! The checksum is FNV-1a/64 folded over exactly the bytes preceding the
//! `checksum` field. A stored checksum of zero marks an uninitialized meta
//! and is accepted.

use eyre::{ensure, Result};
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::META_VERSION;
use crate::errors::Error;

use super::page::{PageHeader, Pgid, Txid, META_PAGE_FLAG, PAGE_HEADER_SIZE};

pub const META_SIZE: usize = 32;

/// Byte span covered by the checksum: every field that precedes it.
const CHECKSUM_OFFSET: usize = 24;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a_64(data: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for &byte in data {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct Meta {
    version: U32,
    page_size: U32,
    pgid: U64,
    txid: U64,
    checksum: U64,
}

const _: () = assert!(std::mem::size_of::<Meta>() == META_SIZE);

impl Meta {
    pub fn new(page_size: u32) -> Self {
        Self {
            version: U32::new(META_VERSION),
            page_size: U32::new(page_size),
            pgid: U64::new(0),
            txid: U64::new(0),
            checksum: U64::new(0),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        ensure!(
            bytes.len() >= META_SIZE,
            "buffer too small for Meta: {} < {}",
            bytes.len(),
            META_SIZE
        );

        Self::ref_from_bytes(&bytes[..META_SIZE])
            .map_err(|e| eyre::eyre!("failed to read Meta: {:?}", e))
    }

    pub fn version(&self) -> u32 {
        self.version.get()
    }

    pub fn page_size(&self) -> u32 {
        self.page_size.get()
    }

    pub fn pgid(&self) -> Pgid {
        self.pgid.get()
    }

    pub fn set_pgid(&mut self, pgid: Pgid) {
        self.pgid = U64::new(pgid);
    }

    pub fn txid(&self) -> Txid {
        self.txid.get()
    }

    pub fn set_txid(&mut self, txid: Txid) {
        self.txid = U64::new(txid);
    }

    pub fn checksum(&self) -> u64 {
        self.checksum.get()
    }

    /// FNV-1a/64 over every field preceding `checksum`.
    pub fn sum64(&self) -> u64 {
        fnv1a_64(&self.as_bytes()[..CHECKSUM_OFFSET])
    }

    pub fn update_checksum(&mut self) {
        self.checksum = U64::new(self.sum64());
    }

    /// Checks the meta against the engine's format version and its own
    /// checksum. A zero checksum is uninitialized and accepted.
    pub fn validate(&self) -> Result<(), Error> {
        if self.version.get() != META_VERSION {
            return Err(Error::VersionMismatch);
        }
        if self.checksum.get() != 0 && self.checksum.get() != self.sum64() {
            return Err(Error::Checksum);
        }
        Ok(())
    }

    /// Stamps a page header and this meta (with a fresh checksum) into a
    /// page buffer.
    pub fn write_to_page(&self, buf: &mut [u8], id: Pgid) -> Result<()> {
        ensure!(
            buf.len() >= PAGE_HEADER_SIZE + META_SIZE,
            "buffer too small for meta page: {}",
            buf.len()
        );

        let header = PageHeader::from_bytes_mut(buf)?;
        header.set_id(id);
        header.set_flags(META_PAGE_FLAG);
        header.set_count(0);
        header.set_overflow(0);

        let mut meta = *self;
        meta.update_checksum();
        buf[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + META_SIZE].copy_from_slice(meta.as_bytes());

        Ok(())
    }
}

/// Returns the meta record stored in a meta page buffer.
pub fn meta_from_page(page: &[u8]) -> Result<&Meta> {
    ensure!(
        page.len() >= PAGE_HEADER_SIZE + META_SIZE,
        "page too small for meta: {}",
        page.len()
    );
    Meta::from_bytes(&page[PAGE_HEADER_SIZE..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_size_is_32_bytes() {
        assert_eq!(std::mem::size_of::<Meta>(), META_SIZE);
    }

    #[test]
    fn fnv1a_matches_known_vectors() {
        assert_eq!(fnv1a_64(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a_64(b"a"), 0xaf63_dc4c_8601_ec8c);
        assert_eq!(fnv1a_64(b"foobar"), 0x85944171f73967e8);
    }

    #[test]
    fn sum64_covers_exactly_the_bytes_before_the_checksum() {
        let mut meta = Meta::new(4096);
        meta.set_pgid(9);
        meta.set_txid(12);

        let expected = fnv1a_64(&meta.as_bytes()[..CHECKSUM_OFFSET]);
        assert_eq!(meta.sum64(), expected);

        // The checksum field itself must not contribute.
        meta.update_checksum();
        assert_eq!(meta.sum64(), expected);
    }

    #[test]
    fn flipping_any_covered_bit_changes_the_sum() {
        let mut meta = Meta::new(4096);
        meta.set_pgid(3);
        meta.set_txid(7);
        let baseline = meta.sum64();

        for byte in 0..CHECKSUM_OFFSET {
            for bit in 0..8 {
                let mut copy = meta;
                copy.as_mut_bytes()[byte] ^= 1 << bit;
                assert_ne!(
                    copy.sum64(),
                    baseline,
                    "flip of byte {} bit {} left the sum unchanged",
                    byte,
                    bit
                );
            }
        }
    }

    #[test]
    fn validate_accepts_fresh_meta_with_zero_checksum() {
        let meta = Meta::new(4096);
        assert_eq!(meta.checksum(), 0);
        assert!(meta.validate().is_ok());
    }

    #[test]
    fn validate_accepts_matching_checksum() {
        let mut meta = Meta::new(4096);
        meta.set_pgid(1);
        meta.update_checksum();
        assert!(meta.validate().is_ok());
    }

    #[test]
    fn validate_rejects_wrong_version() {
        let mut meta = Meta::new(4096);
        meta.version = U32::new(META_VERSION + 1);
        assert_eq!(meta.validate(), Err(Error::VersionMismatch));
    }

    #[test]
    fn validate_rejects_stale_checksum() {
        let mut meta = Meta::new(4096);
        meta.update_checksum();
        meta.set_pgid(99);
        assert_eq!(meta.validate(), Err(Error::Checksum));
    }

    #[test]
    fn write_to_page_stamps_header_and_checksum() {
        let mut buf = vec![0u8; 4096];
        let mut meta = Meta::new(4096);
        meta.set_pgid(1);
        meta.set_txid(5);
        meta.write_to_page(&mut buf, 1).unwrap();

        let header = PageHeader::from_bytes(&buf).unwrap();
        assert_eq!(header.id(), 1);
        assert!(header.is_meta());

        let stored = meta_from_page(&buf).unwrap();
        assert_eq!(stored.pgid(), 1);
        assert_eq!(stored.txid(), 5);
        assert_eq!(stored.checksum(), stored.sum64());
        assert!(stored.validate().is_ok());
    }
}
