//! # In-Memory Nodes
//!
//! A `Node` is the mutable, deserialized counterpart of a branch or leaf
//! page. Deserializing copies nothing: every entry's key and value alias
//! the page bytes until a dereference pass owns them. Mutations edit the
//! sorted entry vector in place; the page is only rewritten when the node
//! is spilled at commit.
//!
//! ## Entries
//!
//! Each entry (`Inode`) carries the element flags, the child page id (for
//! branch entries), and the key/value ranges. Entries are kept unique and
//! strictly ascending by key at all times.
//!
//! ## Split Sizing
//!
//! `split_index` walks the entries accumulating serialized size and returns
//! the first index at which adding the next entry would cross the
//! threshold, while guaranteeing both halves keep at least
//! `MIN_KEYS_PER_PAGE` entries. An entry that lands exactly on the
//! threshold stays on the left. The arithmetic mirrors `size()`, which is
//! the exact number of bytes `write` produces.

use eyre::{ensure, Result};
use smallvec::SmallVec;

use crate::config::MIN_KEYS_PER_PAGE;
use crate::storage::{
    branch_element, branch_element_mut, branch_key, leaf_element, leaf_element_mut, leaf_key,
    leaf_value, PageHeader, Pgid, BRANCH_PAGE_ELEMENT_SIZE, BRANCH_PAGE_FLAG,
    LEAF_PAGE_ELEMENT_SIZE, LEAF_PAGE_FLAG, PAGE_HEADER_SIZE,
};

use super::bytes::ByteRef;
use super::NodeId;

/// One entry of a node: a key with either a value (leaf) or a child page
/// id (branch).
#[derive(Debug, Clone, Default)]
pub struct Inode {
    pub flags: u32,
    pub pgid: Pgid,
    pub key: ByteRef,
    pub value: ByteRef,
}

/// The in-memory form of a page.
#[derive(Debug, Default)]
pub struct Node {
    pub(crate) is_leaf: bool,
    pub(crate) unbalanced: bool,
    pub(crate) spilled: bool,
    /// First key observed when the node was loaded. Still locates the
    /// node's entry in its parent after in-place edits change
    /// `inodes[0].key`.
    pub(crate) key: ByteRef,
    pub(crate) pgid: Pgid,
    pub(crate) parent: Option<NodeId>,
    /// Materialized children, tracked only between load and spill.
    pub(crate) children: SmallVec<[NodeId; 8]>,
    pub(crate) inodes: Vec<Inode>,
}

impl Node {
    pub fn new(is_leaf: bool) -> Self {
        Self {
            is_leaf,
            ..Self::default()
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.is_leaf
    }

    pub fn pgid(&self) -> Pgid {
        self.pgid
    }

    pub fn inodes(&self) -> &[Inode] {
        &self.inodes
    }

    /// First entry key, or empty for a node with no entries.
    pub fn first_key(&self) -> &[u8] {
        self.inodes.first().map(|i| i.key.as_slice()).unwrap_or(&[])
    }

    pub(crate) fn page_element_size(&self) -> usize {
        if self.is_leaf {
            LEAF_PAGE_ELEMENT_SIZE
        } else {
            BRANCH_PAGE_ELEMENT_SIZE
        }
    }

    /// Minimum entries this node must keep: one for a leaf, two for a
    /// branch.
    pub(crate) fn min_keys(&self) -> usize {
        if self.is_leaf {
            1
        } else {
            2
        }
    }

    pub(crate) fn num_children(&self) -> usize {
        self.inodes.len()
    }

    /// Serialized size of the node in bytes.
    pub fn size(&self) -> usize {
        let elsz = self.page_element_size();
        self.inodes.iter().fold(PAGE_HEADER_SIZE, |sz, inode| {
            sz + elsz + inode.key.len() + inode.value.len()
        })
    }

    /// Whether the serialized node is smaller than `v`. Bails out early so
    /// large nodes don't pay for a full size computation.
    pub(crate) fn size_less_than(&self, v: usize) -> bool {
        let elsz = self.page_element_size();
        let mut sz = PAGE_HEADER_SIZE;
        for inode in &self.inodes {
            sz += elsz + inode.key.len() + inode.value.len();
            if sz >= v {
                return false;
            }
        }
        true
    }

    /// Finds the entry index where a page filled to `threshold` would end.
    /// Returns the index and the serialized size of the left part. Both
    /// halves are guaranteed at least `MIN_KEYS_PER_PAGE` entries.
    pub(crate) fn split_index(&self, threshold: usize) -> (usize, usize) {
        let mut sz = PAGE_HEADER_SIZE;
        let mut index = 0;

        for i in 0..self.inodes.len() - MIN_KEYS_PER_PAGE {
            index = i;
            let inode = &self.inodes[i];
            let elsize = self.page_element_size() + inode.key.len() + inode.value.len();

            // Strict comparison: an entry landing exactly on the threshold
            // stays on the left side.
            if index >= MIN_KEYS_PER_PAGE && sz + elsize > threshold {
                break;
            }

            sz += elsize;
        }

        (index, sz)
    }

    /// Inserts or replaces an entry.
    ///
    /// `old_key` is the key under which the entry was previously stored —
    /// identical to `key` for plain inserts, but different when a branch
    /// entry is re-keyed after its child's first key moved. The entry found
    /// at `old_key` (if any) is replaced wholesale; otherwise the new entry
    /// is inserted at its sorted position.
    pub fn put(&mut self, old_key: &[u8], key: ByteRef, value: ByteRef, pgid: Pgid, flags: u32) {
        let index = self
            .inodes
            .partition_point(|inode| inode.key.as_slice() < old_key);

        let inode = Inode {
            flags,
            pgid,
            key,
            value,
        };

        let exact =
            index < self.inodes.len() && self.inodes[index].key.as_slice() == old_key;
        if exact {
            self.inodes[index] = inode;
        } else {
            self.inodes.insert(index, inode);
        }
    }

    /// Removes an entry; missing keys are a silent no-op. A removal marks
    /// the node for the rebalance pass.
    pub fn del(&mut self, key: &[u8]) {
        let index = self
            .inodes
            .partition_point(|inode| inode.key.as_slice() < key);

        if index >= self.inodes.len() || self.inodes[index].key.as_slice() != key {
            return;
        }

        self.inodes.remove(index);
        self.unbalanced = true;
    }

    /// Deserializes a page into this node. Key and value ranges alias the
    /// page memory.
    ///
    /// # Safety
    ///
    /// `page` must stay valid until this node's ranges are owned (see
    /// `ByteRef::mapped`): either the page is part of the current mmap
    /// generation and the dereference pass runs before any remap, or the
    /// buffer simply outlives the node.
    pub unsafe fn read(&mut self, page: &[u8]) -> Result<()> {
        let header = PageHeader::from_bytes(page)?;
        self.pgid = header.id();
        self.is_leaf = header.flags() & LEAF_PAGE_FLAG != 0;

        let count = header.count() as usize;
        self.inodes = Vec::with_capacity(count);

        for i in 0..count {
            let inode = if self.is_leaf {
                let elem = leaf_element(page, i)?;
                Inode {
                    flags: elem.flags(),
                    pgid: 0,
                    key: ByteRef::mapped(leaf_key(page, i)?),
                    value: ByteRef::mapped(leaf_value(page, i)?),
                }
            } else {
                let elem = branch_element(page, i)?;
                Inode {
                    flags: 0,
                    pgid: elem.pgid(),
                    key: ByteRef::mapped(branch_key(page, i)?),
                    value: ByteRef::empty(),
                }
            };
            self.inodes.push(inode);
        }

        self.key = if count > 0 {
            self.inodes[0].key.clone()
        } else {
            ByteRef::empty()
        };

        Ok(())
    }

    /// Serializes the node into a page buffer. Elements are laid out in
    /// entry order; the data cursor starts right after the element
    /// directory and each element's `pos` records the delta back to its
    /// own offset.
    pub fn write(&self, buf: &mut [u8]) -> Result<()> {
        ensure!(
            self.size() <= buf.len(),
            "node ({} bytes) does not fit page buffer ({} bytes)",
            self.size(),
            buf.len()
        );
        ensure!(
            self.inodes.len() < 0xFFFF,
            "node has too many entries to serialize: {}",
            self.inodes.len()
        );

        {
            let header = PageHeader::from_bytes_mut(buf)?;
            let flag = if self.is_leaf {
                LEAF_PAGE_FLAG
            } else {
                BRANCH_PAGE_FLAG
            };
            header.set_flags(header.flags() | flag);
            header.set_count(self.inodes.len() as u16);
        }

        if self.inodes.is_empty() {
            return Ok(());
        }

        let elsz = self.page_element_size();
        let mut data_offset = PAGE_HEADER_SIZE + elsz * self.inodes.len();

        for (index, inode) in self.inodes.iter().enumerate() {
            let elem_offset = PAGE_HEADER_SIZE + index * elsz;
            let pos = (data_offset - elem_offset) as u32;

            if self.is_leaf {
                let elem = leaf_element_mut(buf, index)?;
                elem.set_pos(pos);
                elem.set_flags(inode.flags);
                elem.set_ksize(inode.key.len() as u32);
                elem.set_vsize(inode.value.len() as u32);
            } else {
                let elem = branch_element_mut(buf, index)?;
                elem.set_pos(pos);
                elem.set_ksize(inode.key.len() as u32);
                elem.set_pgid(inode.pgid);
            }

            let key = inode.key.as_slice();
            let value = inode.value.as_slice();
            buf[data_offset..data_offset + key.len()].copy_from_slice(key);
            buf[data_offset + key.len()..data_offset + key.len() + value.len()]
                .copy_from_slice(value);
            data_offset += key.len() + value.len();
        }

        Ok(())
    }

    /// Copies the node's own mapped ranges onto owned memory. Recursion
    /// through materialized children is driven by the bucket.
    pub(crate) fn dereference(&mut self) {
        self.key.make_owned();
        for inode in &mut self.inodes {
            inode.key.make_owned();
            inode.value.make_owned();
        }
    }
}
