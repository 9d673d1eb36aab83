//! # Write Transactions
//!
//! A `Tx` is the single writer over a database handle. It owns a writable
//! copy of the meta (with the transaction id already advanced), the bucket
//! of materialized nodes, and the dirty pages allocated so far. Nothing
//! touches the file until [`Tx::commit`]; dropping the transaction (or
//! calling [`Tx::rollback`]) discards every change.
//!
//! ## Copy-on-Write
//!
//! Mutations never edit mapped pages. Edits land in materialized nodes; at
//! commit the spill pass serializes every touched node into freshly
//! allocated page buffers, returning the superseded pages to the freelist.
//! Readers of the previous root keep seeing consistent data because their
//! pages are not rewritten — they are only recycled once the freelist
//! releases them.
//!
//! ## Commit Sequence
//!
//! 1. Rebalance every materialized node (merges underfull siblings).
//! 2. Spill the root subtree onto fresh pages.
//! 3. Rewrite the freelist into a newly allocated span.
//! 4. Detach nodes from the mapping when it has to grow.
//! 5. Grow the mapping, copy the dirty pages in, stamp the meta into the
//!    `txid % 2` slot, sync.

use eyre::{bail, ensure, Result};
use hashbrown::HashMap;
use tracing::{debug, trace};

use crate::btree::{Bucket, ByteRef, NodeId, TxContext, TxStats};
use crate::db::Db;
use crate::storage::{
    branch_element, branch_key, leaf_key, leaf_value, Meta, PageHeader, Pgid, Txid,
};

/// The transaction state the node engine is allowed to see, kept apart
/// from the bucket so engine calls can borrow both sides at once.
struct TxInner<'db> {
    db: &'db mut Db,
    meta: Meta,
    /// Pages allocated by this transaction, keyed by their first page id.
    pages: HashMap<Pgid, Vec<u8>>,
}

impl TxInner<'_> {
    fn write_freelist(&mut self, pgid: Pgid) -> Result<()> {
        let Some(mut buf) = self.pages.remove(&pgid) else {
            bail!("freelist page {} was not allocated by this transaction", pgid);
        };
        self.db.freelist.write(&mut buf)?;
        self.pages.insert(pgid, buf);
        Ok(())
    }
}

impl TxContext for TxInner<'_> {
    fn page_size(&self) -> usize {
        self.db.page_size
    }

    fn high_water(&self) -> Pgid {
        self.meta.pgid()
    }

    fn txid(&self) -> Txid {
        self.meta.txid()
    }

    fn page(&self, id: Pgid) -> Result<&[u8]> {
        if let Some(buf) = self.pages.get(&id) {
            return Ok(buf.as_slice());
        }
        self.db.page(id)
    }

    fn page_mut(&mut self, id: Pgid) -> Result<&mut [u8]> {
        match self.pages.get_mut(&id) {
            Some(buf) => Ok(buf.as_mut_slice()),
            None => bail!("page {} is not writable in this transaction", id),
        }
    }

    fn allocate(&mut self, count: usize) -> Result<Pgid> {
        let id = match self.db.freelist.allocate(count) {
            0 => {
                // Nothing reusable; take the run past the high-water mark.
                let id = self.meta.pgid();
                self.meta.set_pgid(id + count as Pgid);
                id
            }
            id => id,
        };

        let mut buf = vec![0u8; count * self.db.page_size];
        {
            let header = PageHeader::from_bytes_mut(&mut buf)?;
            header.set_id(id);
            header.set_overflow(count as u32 - 1);
        }
        self.pages.insert(id, buf);
        trace!(pgid = id, count, "allocated pages");
        Ok(id)
    }

    fn free(&mut self, id: Pgid) -> Result<()> {
        let header = *PageHeader::from_bytes(self.page(id)?)?;
        self.db.freelist.free(self.meta.txid(), header);
        Ok(())
    }
}

enum Loc {
    Node(NodeId),
    Page(Pgid),
}

pub struct Tx<'db> {
    inner: TxInner<'db>,
    bucket: Bucket,
    stats: TxStats,
    root_pgid: Pgid,
    done: bool,
}

impl<'db> Tx<'db> {
    pub(crate) fn new(db: &'db mut Db, meta: Meta) -> Self {
        let root_pgid = db.root_pgid;
        Self {
            inner: TxInner {
                db,
                meta,
                pages: HashMap::new(),
            },
            bucket: Bucket::new(),
            stats: TxStats::default(),
            root_pgid,
            done: false,
        }
    }

    pub fn meta(&self) -> &Meta {
        &self.inner.meta
    }

    pub fn stats(&self) -> TxStats {
        self.stats
    }

    /// Split threshold override for pages written by this transaction.
    pub fn set_fill_percent(&mut self, fill_percent: f64) {
        self.bucket.fill_percent = fill_percent;
    }

    /// Inserts or replaces a key.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        ensure!(!self.done, "transaction already finished");
        ensure!(!key.is_empty(), "key required");

        let root = self.bucket.node(self.root_pgid, None, &mut self.inner)?;
        let leaf = self.bucket.node_for_key(root, key, &mut self.inner)?;
        self.bucket.node_mut(leaf).put(
            key,
            ByteRef::from(key.to_vec()),
            ByteRef::from(value.to_vec()),
            0,
            0,
        );
        Ok(())
    }

    /// Removes a key. Missing keys are a no-op.
    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        ensure!(!self.done, "transaction already finished");
        ensure!(!key.is_empty(), "key required");

        let root = self.bucket.node(self.root_pgid, None, &mut self.inner)?;
        let leaf = self.bucket.node_for_key(root, key, &mut self.inner)?;
        self.bucket.node_mut(leaf).del(key);
        Ok(())
    }

    /// Looks up a key, consulting materialized nodes before falling back
    /// to page walking.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        ensure!(!self.done, "transaction already finished");

        let mut loc = match self.bucket.root() {
            Some(id) => Loc::Node(id),
            None => Loc::Page(self.root_pgid),
        };

        loop {
            let child = match loc {
                Loc::Node(id) => {
                    let node = self.bucket.node_ref(id);
                    if node.is_leaf() {
                        let index = node
                            .inodes()
                            .partition_point(|inode| inode.key.as_slice() < key);
                        return Ok(node
                            .inodes()
                            .get(index)
                            .filter(|inode| inode.key.as_slice() == key)
                            .map(|inode| inode.value.as_slice().to_vec()));
                    }
                    if node.inodes().is_empty() {
                        return Ok(None);
                    }
                    let index = node
                        .inodes()
                        .partition_point(|inode| inode.key.as_slice() <= key)
                        .saturating_sub(1);
                    node.inodes()[index].pgid
                }
                Loc::Page(pgid) => {
                    let page = self.inner.page(pgid)?;
                    let header = PageHeader::from_bytes(page)?;
                    let count = header.count() as usize;

                    if header.is_leaf() {
                        let (mut lo, mut hi) = (0usize, count);
                        while lo < hi {
                            let mid = (lo + hi) / 2;
                            if leaf_key(page, mid)? < key {
                                lo = mid + 1;
                            } else {
                                hi = mid;
                            }
                        }
                        if lo < count && leaf_key(page, lo)? == key {
                            return Ok(Some(leaf_value(page, lo)?.to_vec()));
                        }
                        return Ok(None);
                    }

                    ensure!(header.is_branch(), "page {} is not a tree page", pgid);
                    if count == 0 {
                        return Ok(None);
                    }
                    let (mut lo, mut hi) = (0usize, count);
                    while lo < hi {
                        let mid = (lo + hi) / 2;
                        if branch_key(page, mid)? <= key {
                            lo = mid + 1;
                        } else {
                            hi = mid;
                        }
                    }
                    branch_element(page, lo.saturating_sub(1))?.pgid()
                }
            };

            loc = match self.bucket.lookup(child) {
                Some(id) => Loc::Node(id),
                None => Loc::Page(child),
            };
        }
    }

    /// Writes every change to the file and publishes the new meta. Returns
    /// the transaction's counters.
    pub fn commit(&mut self) -> Result<TxStats> {
        ensure!(!self.done, "transaction already finished");

        self.bucket
            .rebalance_all(&mut self.inner, &mut self.stats)?;

        let mut new_root = self.root_pgid;
        if let Some(root) = self.bucket.root() {
            self.bucket.spill(root, &mut self.inner, &mut self.stats)?;
            let top = self.bucket.root_of(root);
            self.bucket.set_root(top);
            new_root = self.bucket.node_ref(top).pgid();
        }

        // The freelist moves to a fresh span every commit; its old span is
        // recycled like any other page.
        let old_freelist = self.inner.db.freelist_pgid;
        self.inner.free(old_freelist)?;
        let count = self.inner.db.freelist.size().div_ceil(self.inner.db.page_size);
        let freelist_pgid = self.inner.allocate(count)?;
        self.inner.write_freelist(freelist_pgid)?;

        // Flushing past the mapping's end forces a remap; every mapped
        // range must be owned first.
        let need = self.inner.meta.pgid() * self.inner.db.page_size as u64;
        if need > self.inner.db.mmap.size() {
            self.bucket.dereference_all(&mut self.stats);
        }

        self.inner
            .db
            .write_commit(&self.inner.pages, &self.inner.meta)?;
        self.inner.db.root_pgid = new_root;
        self.inner.db.freelist_pgid = freelist_pgid;

        self.done = true;
        debug!(
            txid = self.inner.meta.txid(),
            root = new_root,
            spills = self.stats.spill,
            splits = self.stats.split,
            "transaction committed"
        );
        Ok(self.stats)
    }

    /// Abandons the transaction. Dirty pages are dropped and this
    /// transaction's pending frees are withdrawn.
    pub fn rollback(&mut self) -> Result<()> {
        ensure!(!self.done, "transaction already finished");
        self.abort();
        Ok(())
    }

    fn abort(&mut self) {
        self.inner.db.freelist.rollback(self.inner.meta.txid());
        self.done = true;
        trace!(txid = self.inner.meta.txid(), "transaction rolled back");
    }
}

impl Drop for Tx<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn tempdb() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        (dir, path)
    }

    #[test]
    fn put_and_get_within_a_transaction() {
        let (_dir, path) = tempdb();
        let mut db = Db::open(&path).unwrap();
        let mut tx = db.begin_rw().unwrap();

        tx.put(b"hello", b"world").unwrap();

        assert_eq!(tx.get(b"hello").unwrap(), Some(b"world".to_vec()));
        assert_eq!(tx.get(b"missing").unwrap(), None);
    }

    #[test]
    fn put_overwrites_an_existing_key() {
        let (_dir, path) = tempdb();
        let mut db = Db::open(&path).unwrap();
        let mut tx = db.begin_rw().unwrap();

        tx.put(b"k", b"first").unwrap();
        tx.put(b"k", b"second").unwrap();

        assert_eq!(tx.get(b"k").unwrap(), Some(b"second".to_vec()));
    }

    #[test]
    fn empty_keys_are_rejected() {
        let (_dir, path) = tempdb();
        let mut db = Db::open(&path).unwrap();
        let mut tx = db.begin_rw().unwrap();

        assert!(tx.put(b"", b"v").is_err());
        assert!(tx.delete(b"").is_err());
    }

    #[test]
    fn commit_publishes_to_later_transactions() {
        let (_dir, path) = tempdb();
        let mut db = Db::open(&path).unwrap();

        let mut tx = db.begin_rw().unwrap();
        tx.put(b"alpha", b"1").unwrap();
        tx.put(b"bravo", b"2").unwrap();
        tx.commit().unwrap();
        drop(tx);

        let tx = db.begin_rw().unwrap();
        assert_eq!(tx.get(b"alpha").unwrap(), Some(b"1".to_vec()));
        assert_eq!(tx.get(b"bravo").unwrap(), Some(b"2".to_vec()));
        assert_eq!(tx.meta().txid(), 2);
    }

    #[test]
    fn rollback_discards_changes() {
        let (_dir, path) = tempdb();
        let mut db = Db::open(&path).unwrap();

        let mut tx = db.begin_rw().unwrap();
        tx.put(b"ghost", b"boo").unwrap();
        tx.rollback().unwrap();
        drop(tx);

        let tx = db.begin_rw().unwrap();
        assert_eq!(tx.get(b"ghost").unwrap(), None);
    }

    #[test]
    fn dropping_an_uncommitted_transaction_discards_changes() {
        let (_dir, path) = tempdb();
        let mut db = Db::open(&path).unwrap();

        {
            let mut tx = db.begin_rw().unwrap();
            tx.put(b"ghost", b"boo").unwrap();
        }

        let tx = db.begin_rw().unwrap();
        assert_eq!(tx.get(b"ghost").unwrap(), None);
    }

    #[test]
    fn operations_fail_after_commit() {
        let (_dir, path) = tempdb();
        let mut db = Db::open(&path).unwrap();

        let mut tx = db.begin_rw().unwrap();
        tx.put(b"a", b"1").unwrap();
        tx.commit().unwrap();

        assert!(tx.put(b"b", b"2").is_err());
        assert!(tx.get(b"a").is_err());
        assert!(tx.commit().is_err());
        assert!(tx.rollback().is_err());
    }

    #[test]
    fn a_large_commit_splits_and_spills() {
        let (_dir, path) = tempdb();
        let mut db = Db::open(&path).unwrap();

        let mut tx = db.begin_rw().unwrap();
        for i in 0..500u32 {
            let key = format!("key{:05}", i);
            let value = format!("value{:05}", i);
            tx.put(key.as_bytes(), value.as_bytes()).unwrap();
        }
        let stats = tx.commit().unwrap();

        assert!(stats.split > 0, "expected at least one split: {:?}", stats);
        assert!(stats.spill > 2, "expected a spilled subtree: {:?}", stats);
        drop(tx);

        let tx = db.begin_rw().unwrap();
        for i in 0..500u32 {
            let key = format!("key{:05}", i);
            let value = format!("value{:05}", i);
            assert_eq!(
                tx.get(key.as_bytes()).unwrap(),
                Some(value.into_bytes()),
                "missing {}",
                key
            );
        }
    }

    #[test]
    fn reverse_insertion_order_reads_back_sorted() {
        let (_dir, path) = tempdb();
        let mut db = Db::open(&path).unwrap();

        let mut tx = db.begin_rw().unwrap();
        for i in (0..200u32).rev() {
            let key = format!("key{:05}", i);
            tx.put(key.as_bytes(), b"v").unwrap();
        }
        tx.commit().unwrap();
        drop(tx);

        let tx = db.begin_rw().unwrap();
        for i in 0..200u32 {
            let key = format!("key{:05}", i);
            assert!(tx.get(key.as_bytes()).unwrap().is_some(), "missing {}", key);
        }
    }

    #[test]
    fn deletes_across_commits_rebalance_the_tree() {
        let (_dir, path) = tempdb();
        let mut db = Db::open(&path).unwrap();

        let mut tx = db.begin_rw().unwrap();
        for i in 0..300u32 {
            let key = format!("key{:05}", i);
            let value = format!("value{:05}", i);
            tx.put(key.as_bytes(), value.as_bytes()).unwrap();
        }
        tx.commit().unwrap();
        drop(tx);

        let mut tx = db.begin_rw().unwrap();
        for i in 0..280u32 {
            let key = format!("key{:05}", i);
            tx.delete(key.as_bytes()).unwrap();
        }
        let stats = tx.commit().unwrap();
        assert!(stats.rebalance > 0, "expected rebalancing: {:?}", stats);
        drop(tx);

        let tx = db.begin_rw().unwrap();
        for i in 0..300u32 {
            let key = format!("key{:05}", i);
            let got = tx.get(key.as_bytes()).unwrap();
            if i < 280 {
                assert_eq!(got, None, "key {} should be gone", key);
            } else {
                assert!(got.is_some(), "key {} should survive", key);
            }
        }
    }

    #[test]
    fn delete_of_a_missing_key_commits_cleanly() {
        let (_dir, path) = tempdb();
        let mut db = Db::open(&path).unwrap();

        let mut tx = db.begin_rw().unwrap();
        tx.put(b"only", b"one").unwrap();
        tx.delete(b"not-there").unwrap();
        tx.commit().unwrap();
        drop(tx);

        let tx = db.begin_rw().unwrap();
        assert_eq!(tx.get(b"only").unwrap(), Some(b"one".to_vec()));
    }

    #[test]
    fn freed_pages_are_reused_by_later_commits() {
        let (_dir, path) = tempdb();
        let mut db = Db::open(&path).unwrap();

        for round in 0..5u32 {
            let mut tx = db.begin_rw().unwrap();
            tx.put(format!("round{}", round).as_bytes(), b"v").unwrap();
            tx.commit().unwrap();
        }

        // Every commit recycles the previous root and freelist pages, so
        // the file stays close to its minimum size.
        let pages = db.meta().pgid();
        assert!(pages < 12, "file grew more than expected: {} pages", pages);
    }

    #[test]
    fn an_empty_commit_still_advances_the_meta() {
        let (_dir, path) = tempdb();
        let mut db = Db::open(&path).unwrap();

        let mut tx = db.begin_rw().unwrap();
        let stats = tx.commit().unwrap();
        drop(tx);

        assert_eq!(stats.spill, 0);
        assert_eq!(stats.split, 0);
        assert_eq!(db.meta().txid(), 1);
    }

    #[test]
    fn update_commits_on_success_and_rolls_back_on_error() {
        let (_dir, path) = tempdb();
        let mut db = Db::open(&path).unwrap();

        db.update(|tx| tx.put(b"kept", b"1")).unwrap();

        let result = db.update(|tx| {
            tx.put(b"lost", b"2")?;
            eyre::bail!("boom")
        });
        assert!(result.is_err());

        let tx = db.begin_rw().unwrap();
        assert_eq!(tx.get(b"kept").unwrap(), Some(b"1".to_vec()));
        assert_eq!(tx.get(b"lost").unwrap(), None);
    }
}
