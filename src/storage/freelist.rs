//! # Freelist Management
//!
//! Tracks pages freed by committed transactions and hands them back to the
//! allocator before the file is extended. Pages freed by transaction `t`
//! stay *pending* until every reader observing a snapshot older than `t`
//! has finished; only then are they released for reuse.
//!
//! ## Structure
//!
//! - `ids`: sorted page ids that are free for allocation right now.
//! - `pending`: ids freed per transaction, awaiting reader advance.
//! - `cache`: membership set over both, guarding against double frees.
//!
//! ## Freelist Page Layout
//!
//! ```text
//! Offset  Size   Description
//! ------  -----  ----------------------------------------
//! 0       16     Standard page header (freelist flag)
//! 16      8*N    Sorted page ids, 8 bytes each
//! ```
//!
//! The header's 16-bit count field caps at 0xFFFF; a list of 0xFFFF or more
//! ids stores 0xFFFF in the header and the real count in the first 8-byte
//! slot, with the ids following it.

use eyre::{ensure, Result};
use hashbrown::{HashMap, HashSet};

use super::page::{PageHeader, Pgid, Txid, FREELIST_PAGE_FLAG, PAGE_HEADER_SIZE};

#[derive(Debug, Default)]
pub struct Freelist {
    /// Page ids free for allocation, sorted ascending.
    ids: Vec<Pgid>,
    /// Page ids freed per transaction, not yet releasable.
    pending: HashMap<Txid, Vec<Pgid>>,
    /// Every id in `ids` or `pending`.
    cache: HashSet<Pgid>,
}

/// Copies the sorted union of `a` and `b` into `dst`.
pub fn merge_pgids(dst: &mut Vec<Pgid>, a: &[Pgid], b: &[Pgid]) {
    if a.is_empty() {
        dst.extend_from_slice(b);
        return;
    }
    if b.is_empty() {
        dst.extend_from_slice(a);
        return;
    }

    // Lead starts at the lower value; copy the longest prefix of lead that
    // stays at or below follow's head, then swap roles.
    let (mut lead, mut follow) = if b[0] < a[0] { (b, a) } else { (a, b) };

    while !lead.is_empty() {
        let n = lead.partition_point(|&id| id <= follow[0]);
        dst.extend_from_slice(&lead[..n]);
        if n >= lead.len() {
            break;
        }
        let rest = &lead[n..];
        lead = follow;
        follow = rest;
    }

    dst.extend_from_slice(follow);
}

impl Freelist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of ids free for allocation right now.
    pub fn free_count(&self) -> usize {
        self.ids.len()
    }

    /// Number of ids freed but still held for readers.
    pub fn pending_count(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    pub fn count(&self) -> usize {
        self.free_count() + self.pending_count()
    }

    /// Whether the given id is known to the freelist.
    pub fn freed(&self, id: Pgid) -> bool {
        self.cache.contains(&id)
    }

    /// Returns the starting id of a contiguous run of `count` free pages,
    /// or 0 when no such run exists.
    pub fn allocate(&mut self, count: usize) -> Pgid {
        if count == 0 {
            return 0;
        }

        let mut initial: Pgid = 0;
        let mut previd: Pgid = 0;
        let mut found: Option<(usize, Pgid)> = None;
        for (i, &id) in self.ids.iter().enumerate() {
            if id <= 1 {
                panic!("invalid page allocation: {}", id);
            }

            // Reset the run on a gap.
            if previd == 0 || id - previd != 1 {
                initial = id;
            }

            if (id - initial) as usize + 1 == count {
                found = Some((i, initial));
                break;
            }

            previd = id;
        }

        let Some((end, initial)) = found else {
            return 0;
        };
        self.ids.drain(end + 1 - count..=end);
        for id in initial..initial + count as Pgid {
            self.cache.remove(&id);
        }
        initial
    }

    /// Records the page (and its overflow span) as freed by `txid`. The
    /// pages stay pending until `release` advances past that transaction.
    pub fn free(&mut self, txid: Txid, header: PageHeader) {
        let start = header.id();
        if start <= 1 {
            panic!("cannot free page {}", start);
        }

        let slot = self.pending.entry(txid).or_default();
        for id in start..=start + header.overflow() as Pgid {
            if !self.cache.insert(id) {
                panic!("page {} already freed", id);
            }
            slot.push(id);
        }
    }

    /// Moves every id freed by transactions at or before `txid` into the
    /// allocatable set.
    pub fn release(&mut self, txid: Txid) {
        let mut released: Vec<Pgid> = Vec::new();
        let done: Vec<Txid> = self
            .pending
            .keys()
            .copied()
            .filter(|&t| t <= txid)
            .collect();
        for t in done {
            if let Some(mut ids) = self.pending.remove(&t) {
                released.append(&mut ids);
            }
        }
        if released.is_empty() {
            return;
        }
        released.sort_unstable();

        let mut merged = Vec::with_capacity(self.ids.len() + released.len());
        merge_pgids(&mut merged, &self.ids, &released);
        self.ids = merged;
    }

    /// Discards the pending frees of an aborted transaction.
    pub fn rollback(&mut self, txid: Txid) {
        if let Some(ids) = self.pending.remove(&txid) {
            for id in ids {
                self.cache.remove(&id);
            }
        }
    }

    /// Every tracked id — allocatable and pending — in sorted order. This is
    /// what gets serialized, so a reload sees the full picture.
    fn copyall(&self) -> Vec<Pgid> {
        let mut pending: Vec<Pgid> = self
            .pending
            .values()
            .flat_map(|ids| ids.iter().copied())
            .collect();
        pending.sort_unstable();

        let mut all = Vec::with_capacity(self.ids.len() + pending.len());
        merge_pgids(&mut all, &self.ids, &pending);
        all
    }

    /// Serialized size in bytes, header included.
    pub fn size(&self) -> usize {
        let n = self.count();
        let escape = if n >= 0xFFFF { 8 } else { 0 };
        PAGE_HEADER_SIZE + escape + 8 * n
    }

    /// Serializes the freelist into a page buffer.
    pub fn write(&self, buf: &mut [u8]) -> Result<()> {
        ensure!(
            self.size() <= buf.len(),
            "freelist ({} bytes) does not fit page buffer ({} bytes)",
            self.size(),
            buf.len()
        );

        let ids = self.copyall();
        let header = PageHeader::from_bytes_mut(buf)?;
        header.set_flags(header.flags() | FREELIST_PAGE_FLAG);

        let mut offset = PAGE_HEADER_SIZE;
        if ids.len() < 0xFFFF {
            header.set_count(ids.len() as u16);
        } else {
            header.set_count(0xFFFF);
            buf[offset..offset + 8].copy_from_slice(&(ids.len() as u64).to_le_bytes());
            offset += 8;
        }

        for id in ids {
            buf[offset..offset + 8].copy_from_slice(&id.to_le_bytes());
            offset += 8;
        }

        Ok(())
    }

    /// Rebuilds the freelist from a serialized page. Pending state is not
    /// recorded on disk; everything loads as allocatable.
    pub fn read(&mut self, page: &[u8]) -> Result<()> {
        let header = PageHeader::from_bytes(page)?;
        ensure!(
            header.is_freelist(),
            "page {} is not a freelist page",
            header.id()
        );

        let mut offset = PAGE_HEADER_SIZE;
        let count = if header.count() == 0xFFFF {
            ensure!(page.len() >= offset + 8, "truncated freelist page");
            let real = u64::from_le_bytes(page[offset..offset + 8].try_into().unwrap());
            offset += 8;
            real as usize
        } else {
            header.count() as usize
        };

        ensure!(
            page.len() >= offset + 8 * count,
            "freelist page truncated: {} ids do not fit {} bytes",
            count,
            page.len()
        );

        self.ids.clear();
        self.pending.clear();
        self.cache.clear();
        for _ in 0..count {
            let id = u64::from_le_bytes(page[offset..offset + 8].try_into().unwrap());
            offset += 8;
            self.ids.push(id);
            self.cache.insert(id);
        }
        self.ids.sort_unstable();

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::FromZeros;

    fn header(id: Pgid, overflow: u32) -> PageHeader {
        let mut h = PageHeader::new_zeroed();
        h.set_id(id);
        h.set_overflow(overflow);
        h
    }

    #[test]
    fn free_and_release_make_pages_allocatable() {
        let mut fl = Freelist::new();
        fl.free(100, header(12, 0));
        assert_eq!(fl.free_count(), 0);
        assert_eq!(fl.pending_count(), 1);

        fl.release(100);
        assert_eq!(fl.free_count(), 1);
        assert_eq!(fl.allocate(1), 12);
    }

    #[test]
    fn free_records_overflow_span() {
        let mut fl = Freelist::new();
        fl.free(100, header(9, 3));
        fl.release(100);

        assert_eq!(fl.free_count(), 4);
        assert!(fl.freed(9));
        assert!(fl.freed(12));
        assert!(!fl.freed(13));
    }

    #[test]
    fn release_holds_back_newer_transactions() {
        let mut fl = Freelist::new();
        fl.free(5, header(10, 0));
        fl.free(9, header(20, 0));

        fl.release(7);
        assert_eq!(fl.free_count(), 1);
        assert!(fl.allocate(1) == 10);

        fl.release(9);
        assert_eq!(fl.allocate(1), 20);
    }

    #[test]
    #[should_panic(expected = "already freed")]
    fn double_free_panics() {
        let mut fl = Freelist::new();
        fl.free(1, header(7, 0));
        fl.free(2, header(7, 0));
    }

    #[test]
    #[should_panic(expected = "cannot free page")]
    fn freeing_a_meta_page_panics() {
        let mut fl = Freelist::new();
        fl.free(1, header(1, 0));
    }

    #[test]
    fn allocate_finds_contiguous_runs() {
        let mut fl = Freelist::new();
        for id in [3u64, 4, 5, 6, 7, 9, 12, 13, 18] {
            fl.free(1, header(id, 0));
        }
        fl.release(1);

        assert_eq!(fl.allocate(3), 3);
        assert_eq!(fl.allocate(1), 6);
        assert_eq!(fl.allocate(3), 0);
        assert_eq!(fl.allocate(2), 12);
        assert_eq!(fl.allocate(1), 7);
        assert_eq!(fl.allocate(1), 9);
        assert_eq!(fl.allocate(1), 18);
        assert_eq!(fl.allocate(1), 0);
    }

    #[test]
    fn allocate_zero_returns_nothing() {
        let mut fl = Freelist::new();
        assert_eq!(fl.allocate(0), 0);
    }

    #[test]
    fn rollback_discards_pending_frees() {
        let mut fl = Freelist::new();
        fl.free(4, header(11, 1));
        fl.rollback(4);

        fl.release(4);
        assert_eq!(fl.free_count(), 0);
        assert!(!fl.freed(11));

        // The ids can be freed again afterwards.
        fl.free(5, header(11, 1));
        fl.release(5);
        assert_eq!(fl.free_count(), 2);
    }

    #[test]
    fn merge_pgids_produces_sorted_union() {
        let mut dst = Vec::new();
        merge_pgids(&mut dst, &[4, 5, 6], &[1, 2]);
        assert_eq!(dst, vec![1, 2, 4, 5, 6]);

        dst.clear();
        merge_pgids(&mut dst, &[1, 3, 9], &[2, 4, 10, 11, 12]);
        assert_eq!(dst, vec![1, 2, 3, 4, 9, 10, 11, 12]);

        dst.clear();
        merge_pgids(&mut dst, &[], &[2, 3]);
        assert_eq!(dst, vec![2, 3]);

        dst.clear();
        merge_pgids(&mut dst, &[2, 3], &[]);
        assert_eq!(dst, vec![2, 3]);
    }

    #[test]
    fn merge_pgids_keeps_the_follow_tail() {
        // The follow side extends past everything in lead; its tail must
        // land in the output.
        let mut dst = Vec::new();
        merge_pgids(&mut dst, &[3, 4], &[5, 6, 7, 8, 9]);
        assert_eq!(dst, vec![3, 4, 5, 6, 7, 8, 9]);
    }

    #[test]
    fn write_read_roundtrip() {
        let mut fl = Freelist::new();
        for id in [5u64, 6, 9] {
            fl.free(3, header(id, 0));
        }
        fl.release(3);
        fl.free(4, header(20, 1));

        let mut buf = vec![0u8; 4096];
        {
            let h = PageHeader::from_bytes_mut(&mut buf).unwrap();
            h.set_id(2);
        }
        fl.write(&mut buf).unwrap();

        let header = PageHeader::from_bytes(&buf).unwrap();
        assert!(header.is_freelist());
        assert_eq!(header.count(), 5);

        let mut reloaded = Freelist::new();
        reloaded.read(&buf).unwrap();
        assert_eq!(reloaded.free_count(), 5);
        assert_eq!(reloaded.allocate(2), 5);
        assert_eq!(reloaded.allocate(2), 20);
    }

    #[test]
    fn size_accounts_for_the_count_escape() {
        let fl = Freelist::new();
        assert_eq!(fl.size(), PAGE_HEADER_SIZE);

        let mut fl = Freelist::new();
        fl.free(1, header(10, 2));
        assert_eq!(fl.size(), PAGE_HEADER_SIZE + 3 * 8);
    }
}
