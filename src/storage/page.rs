//! # Page Types and Header Layout
//!
//! This module defines the on-disk page structure. Every page begins with a
//! 16-byte header followed by a packed element directory and a trailing
//! variable-length key/value region.
//!
//! ## Page Header Layout (16 bytes)
//!
//! ```text
//! Offset  Size  Field     Description
//! ------  ----  --------  ----------------------------------------
//! 0       8     id        Page identifier (pgid)
//! 8       2     flags     Page kind (branch, leaf, meta, freelist)
//! 10      2     count     Number of elements in the directory
//! 12      4     overflow  Extra contiguous pages beyond this one
//! ```
//!
//! ## Element Directory
//!
//! Branch and leaf pages store a packed array of 16-byte elements starting
//! at offset 16. Each element locates its own key bytes through `pos`, the
//! byte delta from the element's own offset to the key; a leaf element's
//! value bytes follow the key immediately. Nothing may assume the data
//! region is laid out element-after-element — `pos` is the only contract.
//!
//! ```text
//! +------------------+
//! | Header (16 bytes)|
//! +------------------+
//! | Element 0        |  <- each element is 16 bytes
//! | Element 1        |
//! | ...              |
//! +------------------+
//! | key0 val0 key1.. |  <- reached via element.pos
//! +------------------+
//! ```
//!
//! ## Zero-Copy Access
//!
//! All three structs use `zerocopy` for safe transmutation from raw bytes,
//! so headers and elements are read directly from mmap'd pages without
//! copying. Multi-byte fields are little-endian on every platform.

use eyre::{ensure, Result};
use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// 64-bit page identifier. Pages 0 and 1 hold the two metas, page 2 the
/// initial freelist; an id of 0 inside a node means "not yet written".
pub type Pgid = u64;

/// 64-bit monotonically increasing transaction identifier.
pub type Txid = u64;

pub const BRANCH_PAGE_FLAG: u16 = 0x01;
pub const LEAF_PAGE_FLAG: u16 = 0x02;
pub const META_PAGE_FLAG: u16 = 0x04;
pub const FREELIST_PAGE_FLAG: u16 = 0x10;

pub const PAGE_HEADER_SIZE: usize = 16;
pub const BRANCH_PAGE_ELEMENT_SIZE: usize = 16;
pub const LEAF_PAGE_ELEMENT_SIZE: usize = 16;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct PageHeader {
    id: U64,
    flags: U16,
    count: U16,
    overflow: U32,
}

const _: () = assert!(std::mem::size_of::<PageHeader>() == PAGE_HEADER_SIZE);

impl PageHeader {
    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        ensure!(
            data.len() >= PAGE_HEADER_SIZE,
            "buffer too small for PageHeader: {} < {}",
            data.len(),
            PAGE_HEADER_SIZE
        );

        Self::ref_from_bytes(&data[..PAGE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to read PageHeader: {:?}", e))
    }

    pub fn from_bytes_mut(data: &mut [u8]) -> Result<&mut Self> {
        ensure!(
            data.len() >= PAGE_HEADER_SIZE,
            "buffer too small for PageHeader: {} < {}",
            data.len(),
            PAGE_HEADER_SIZE
        );

        Self::mut_from_bytes(&mut data[..PAGE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to read PageHeader: {:?}", e))
    }

    pub fn id(&self) -> Pgid {
        self.id.get()
    }

    pub fn set_id(&mut self, id: Pgid) {
        self.id = U64::new(id);
    }

    pub fn flags(&self) -> u16 {
        self.flags.get()
    }

    pub fn set_flags(&mut self, flags: u16) {
        self.flags = U16::new(flags);
    }

    pub fn count(&self) -> u16 {
        self.count.get()
    }

    pub fn set_count(&mut self, count: u16) {
        self.count = U16::new(count);
    }

    pub fn overflow(&self) -> u32 {
        self.overflow.get()
    }

    pub fn set_overflow(&mut self, overflow: u32) {
        self.overflow = U32::new(overflow);
    }

    pub fn is_branch(&self) -> bool {
        self.flags.get() & BRANCH_PAGE_FLAG != 0
    }

    pub fn is_leaf(&self) -> bool {
        self.flags.get() & LEAF_PAGE_FLAG != 0
    }

    pub fn is_meta(&self) -> bool {
        self.flags.get() & META_PAGE_FLAG != 0
    }

    pub fn is_freelist(&self) -> bool {
        self.flags.get() & FREELIST_PAGE_FLAG != 0
    }
}

/// Element of a branch page. `pos` is the offset from this element to its
/// key bytes; `pgid` addresses the child page.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct BranchPageElement {
    pos: U32,
    ksize: U32,
    pgid: U64,
}

const _: () = assert!(std::mem::size_of::<BranchPageElement>() == BRANCH_PAGE_ELEMENT_SIZE);

impl BranchPageElement {
    pub fn pos(&self) -> u32 {
        self.pos.get()
    }

    pub fn set_pos(&mut self, pos: u32) {
        self.pos = U32::new(pos);
    }

    pub fn ksize(&self) -> u32 {
        self.ksize.get()
    }

    pub fn set_ksize(&mut self, ksize: u32) {
        self.ksize = U32::new(ksize);
    }

    pub fn pgid(&self) -> Pgid {
        self.pgid.get()
    }

    pub fn set_pgid(&mut self, pgid: Pgid) {
        self.pgid = U64::new(pgid);
    }
}

/// Element of a leaf page. `pos` is the offset from this element to its key
/// bytes; the value bytes follow the key immediately.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct LeafPageElement {
    flags: U32,
    pos: U32,
    ksize: U32,
    vsize: U32,
}

const _: () = assert!(std::mem::size_of::<LeafPageElement>() == LEAF_PAGE_ELEMENT_SIZE);

impl LeafPageElement {
    pub fn flags(&self) -> u32 {
        self.flags.get()
    }

    pub fn set_flags(&mut self, flags: u32) {
        self.flags = U32::new(flags);
    }

    pub fn pos(&self) -> u32 {
        self.pos.get()
    }

    pub fn set_pos(&mut self, pos: u32) {
        self.pos = U32::new(pos);
    }

    pub fn ksize(&self) -> u32 {
        self.ksize.get()
    }

    pub fn set_ksize(&mut self, ksize: u32) {
        self.ksize = U32::new(ksize);
    }

    pub fn vsize(&self) -> u32 {
        self.vsize.get()
    }

    pub fn set_vsize(&mut self, vsize: u32) {
        self.vsize = U32::new(vsize);
    }
}

fn element_offset(index: usize, element_size: usize) -> usize {
    PAGE_HEADER_SIZE + index * element_size
}

/// Returns element `index` of a branch page.
pub fn branch_element(page: &[u8], index: usize) -> Result<&BranchPageElement> {
    let offset = element_offset(index, BRANCH_PAGE_ELEMENT_SIZE);
    ensure!(
        offset + BRANCH_PAGE_ELEMENT_SIZE <= page.len(),
        "branch element {} out of bounds (page len {})",
        index,
        page.len()
    );

    BranchPageElement::ref_from_bytes(&page[offset..offset + BRANCH_PAGE_ELEMENT_SIZE])
        .map_err(|e| eyre::eyre!("failed to read BranchPageElement: {:?}", e))
}

/// Returns element `index` of a branch page for mutation.
pub fn branch_element_mut(page: &mut [u8], index: usize) -> Result<&mut BranchPageElement> {
    let offset = element_offset(index, BRANCH_PAGE_ELEMENT_SIZE);
    ensure!(
        offset + BRANCH_PAGE_ELEMENT_SIZE <= page.len(),
        "branch element {} out of bounds (page len {})",
        index,
        page.len()
    );

    BranchPageElement::mut_from_bytes(&mut page[offset..offset + BRANCH_PAGE_ELEMENT_SIZE])
        .map_err(|e| eyre::eyre!("failed to read BranchPageElement: {:?}", e))
}

/// Returns element `index` of a leaf page.
pub fn leaf_element(page: &[u8], index: usize) -> Result<&LeafPageElement> {
    let offset = element_offset(index, LEAF_PAGE_ELEMENT_SIZE);
    ensure!(
        offset + LEAF_PAGE_ELEMENT_SIZE <= page.len(),
        "leaf element {} out of bounds (page len {})",
        index,
        page.len()
    );

    LeafPageElement::ref_from_bytes(&page[offset..offset + LEAF_PAGE_ELEMENT_SIZE])
        .map_err(|e| eyre::eyre!("failed to read LeafPageElement: {:?}", e))
}

/// Returns element `index` of a leaf page for mutation.
pub fn leaf_element_mut(page: &mut [u8], index: usize) -> Result<&mut LeafPageElement> {
    let offset = element_offset(index, LEAF_PAGE_ELEMENT_SIZE);
    ensure!(
        offset + LEAF_PAGE_ELEMENT_SIZE <= page.len(),
        "leaf element {} out of bounds (page len {})",
        index,
        page.len()
    );

    LeafPageElement::mut_from_bytes(&mut page[offset..offset + LEAF_PAGE_ELEMENT_SIZE])
        .map_err(|e| eyre::eyre!("failed to read LeafPageElement: {:?}", e))
}

/// Returns the key bytes of branch element `index`.
pub fn branch_key(page: &[u8], index: usize) -> Result<&[u8]> {
    let offset = element_offset(index, BRANCH_PAGE_ELEMENT_SIZE);
    let elem = branch_element(page, index)?;
    let start = offset + elem.pos() as usize;
    let end = start + elem.ksize() as usize;
    ensure!(
        end <= page.len(),
        "branch key {} out of bounds ({}..{} in page len {})",
        index,
        start,
        end,
        page.len()
    );
    Ok(&page[start..end])
}

/// Returns the key bytes of leaf element `index`.
pub fn leaf_key(page: &[u8], index: usize) -> Result<&[u8]> {
    let offset = element_offset(index, LEAF_PAGE_ELEMENT_SIZE);
    let elem = leaf_element(page, index)?;
    let start = offset + elem.pos() as usize;
    let end = start + elem.ksize() as usize;
    ensure!(
        end <= page.len(),
        "leaf key {} out of bounds ({}..{} in page len {})",
        index,
        start,
        end,
        page.len()
    );
    Ok(&page[start..end])
}

/// Returns the value bytes of leaf element `index`. The value follows the
/// key immediately.
pub fn leaf_value(page: &[u8], index: usize) -> Result<&[u8]> {
    let offset = element_offset(index, LEAF_PAGE_ELEMENT_SIZE);
    let elem = leaf_element(page, index)?;
    let start = offset + elem.pos() as usize + elem.ksize() as usize;
    let end = start + elem.vsize() as usize;
    ensure!(
        end <= page.len(),
        "leaf value {} out of bounds ({}..{} in page len {})",
        index,
        start,
        end,
        page.len()
    );
    Ok(&page[start..end])
}
