//! # B+Tree Node Engine
//!
//! The mutable heart of the store: deserialized nodes, sorted in-place
//! edits, page-size-driven splits, the commit-time spill that rewrites a
//! dirty subtree onto freshly allocated pages, and the rebalance pass that
//! merges underfull siblings.
//!
//! ## Ownership Model
//!
//! Nodes form a tree with parent and child links, which in Rust is an arena
//! problem: the [`Bucket`] owns every node in a flat arena and hands out
//! [`NodeId`] indices. Parent/child references are ids, never borrows, so
//! the recursive algorithms stay free of lifetime gymnastics. The
//! authoritative child set of a branch is its entries' page ids; the
//! `children` list only tracks nodes that have been materialized this
//! transaction.
//!
//! ## The Transaction Seam
//!
//! The engine does not own pages. Everything it needs from the outside —
//! page lookup, contiguous allocation, freeing to the freelist, the
//! high-water mark — comes through the [`TxContext`] trait, implemented by
//! the write transaction (and by in-memory fakes in tests).
//!
//! ## Module Organization
//!
//! - `bytes`: borrowed-or-owned byte ranges and the dereference contract
//! - `node`: one node — layout math, sorted edits, (de)serialization
//! - `bucket`: the arena — materialization, split, spill, rebalance

mod bucket;
mod bytes;
mod node;

pub use bucket::Bucket;
pub use bytes::ByteRef;
pub use node::{Inode, Node};

use eyre::Result;

use crate::storage::{Pgid, Txid};

/// Index of a node in its bucket's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub(crate) usize);

/// Counters maintained across one write transaction.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TxStats {
    /// Nodes written out by the spill pass.
    pub spill: u64,
    /// Node splits performed.
    pub split: u64,
    /// Nodes visited by the rebalance pass.
    pub rebalance: u64,
    /// Nodes whose byte ranges were copied off the mapping.
    pub node_deref: u64,
}

/// Collaborators the node engine consumes from the active write
/// transaction.
pub trait TxContext {
    fn page_size(&self) -> usize;

    /// Smallest page id never yet allocated.
    fn high_water(&self) -> Pgid;

    fn txid(&self) -> Txid;

    /// Resolves a page — a dirty buffer of this transaction, or the mapped
    /// file.
    fn page(&self, id: Pgid) -> Result<&[u8]>;

    /// Mutable access to a dirty page buffer of this transaction.
    fn page_mut(&mut self, id: Pgid) -> Result<&mut [u8]>;

    /// Allocates a contiguous run of `count` pages and returns its first
    /// id. The page header is stamped with the id and `count - 1` overflow
    /// pages; the freelist is preferred over extending the file.
    fn allocate(&mut self, count: usize) -> Result<Pgid>;

    /// Returns a page (and its overflow span) to the freelist, tagged with
    /// this transaction's id.
    fn free(&mut self, id: Pgid) -> Result<()>;
}
