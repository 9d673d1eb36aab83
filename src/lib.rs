//! # Burrow - Embedded Single-File Key/Value Store
//!
//! Burrow persists ordered key/value data in one file, organized as a
//! copy-on-write B+tree over fixed-size pages. A writer builds a new tree
//! root off to the side and publishes it atomically; superseded pages are
//! recycled through a freelist once no snapshot needs them.
//!
//! ## Quick Start
//!
//! ```ignore
//! use burrow::Db;
//!
//! let mut db = Db::open("./data.db")?;
//!
//! let mut tx = db.begin_rw()?;
//! tx.put(b"greeting", b"hello")?;
//! tx.commit()?;
//!
//! let tx = db.begin_rw()?;
//! assert_eq!(tx.get(b"greeting")?, Some(b"hello".to_vec()));
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │        Public API (Db / Tx)         │
//! ├─────────────────────────────────────┤
//! │   Node Engine (bucket, spill,       │
//! │   split, rebalance, dereference)    │
//! ├─────────────────────────────────────┤
//! │   Page Formats (header, elements,   │
//! │   meta, freelist)                   │
//! ├─────────────────────────────────────┤
//! │      Memory-Mapped File I/O         │
//! └─────────────────────────────────────┘
//! ```
//!
//! ## File Format
//!
//! Pages 0 and 1 hold replicated meta records (version, page size,
//! high-water mark, transaction id, checksum); commits alternate between
//! them so a torn write is always recoverable from the sibling. Page 2
//! holds the initial freelist, page 3 the initial empty leaf. Everything
//! beyond grows on demand in contiguous spans.
//!
//! ## Concurrency Model
//!
//! Single writer, enforced by the borrow checker: a write transaction
//! holds `&mut Db` for its lifetime. The engine itself is not thread-safe
//! and performs no blocking operations; snapshot coordination for readers
//! belongs to an embedding layer.
//!
//! ## Module Overview
//!
//! - [`storage`]: page layouts, meta records, mmap, freelist
//! - [`btree`]: the in-memory node engine
//! - `db` / `tx`: the database handle and its write transaction

pub mod btree;
pub mod config;
pub mod errors;
pub mod storage;

mod db;
mod tx;

pub use btree::{Bucket, ByteRef, TxStats};
pub use db::Db;
pub use errors::Error;
pub use storage::{Meta, Pgid, Txid};
pub use tx::Tx;
