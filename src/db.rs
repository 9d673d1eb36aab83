//! # Database Handle
//!
//! `Db` owns the file, its mapping, the freelist, and the current meta. A
//! fresh file is initialized with four pages — two meta copies, the
//! freelist page, and an empty leaf that serves as the tree root:
//!
//! ```text
//! Page 0   Meta copy A (txid-even commits land here)
//! Page 1   Meta copy B (txid-odd commits land here)
//! Page 2   Freelist
//! Page 3   Empty leaf root
//! ```
//!
//! ## Opening
//!
//! An existing file has both meta pages read and validated before mapping.
//! Failure is fatal only when both copies are bad — a torn meta write is
//! healed by its sibling, and the next commit overwrites the stale copy.
//! When both are valid the one with the higher transaction id wins. A file
//! too short to hold two meta pages is rejected as invalid outright.
//!
//! ## Writer Model
//!
//! One writer at a time, enforced at compile time: [`Db::begin_rw`] borrows
//! the handle mutably for the transaction's lifetime. Readers of prior
//! snapshots are coordinated by an embedding layer, not here; the freelist
//! keeps per-transaction pending sets so such a layer can hold pages back.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use eyre::{Result, WrapErr};
use hashbrown::HashMap;
use tracing::debug;

use crate::btree::TxStats;
use crate::config::{default_page_size, INIT_PAGE_COUNT};
use crate::errors::Error;
use crate::storage::{
    meta_from_page, Freelist, Meta, MmapFile, PageHeader, Pgid, FREELIST_PAGE_FLAG,
    LEAF_PAGE_FLAG,
};
use crate::tx::Tx;

#[derive(Debug)]
pub struct Db {
    path: PathBuf,
    pub(crate) mmap: MmapFile,
    pub(crate) page_size: usize,
    pub(crate) freelist: Freelist,
    pub(crate) meta: Meta,
    /// Page id of the current tree root. The meta record has no room for
    /// it, so it lives here; a reopened file starts back at the initial
    /// empty leaf.
    pub(crate) root_pgid: Pgid,
    /// Page span currently holding the serialized freelist.
    pub(crate) freelist_pgid: Pgid,
}

impl Db {
    /// Opens a database file, creating and initializing it when empty.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let page_size = default_page_size();

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open database file '{}'", path.display()))?;

        let len = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", path.display()))?
            .len();

        let meta = if len == 0 {
            let meta = Self::init(&mut file, page_size)?;
            debug!(path = %path.display(), page_size, "initialized database file");
            meta
        } else {
            Self::load_meta(&mut file, page_size)?
        };

        let mmap = MmapFile::map(file, page_size)?;

        Ok(Self {
            path: path.to_path_buf(),
            mmap,
            page_size,
            freelist: Freelist::new(),
            meta,
            root_pgid: 3,
            freelist_pgid: 2,
        })
    }

    /// Writes the initial four pages of a fresh database file.
    fn init(file: &mut File, page_size: usize) -> Result<Meta> {
        let mut buf = vec![0u8; page_size * INIT_PAGE_COUNT];

        let mut chosen = Meta::new(page_size as u32);
        for i in 0..2u64 {
            let offset = i as usize * page_size;
            let mut meta = Meta::new(page_size as u32);
            meta.set_pgid(i);
            meta.write_to_page(&mut buf[offset..offset + page_size], i)?;
            if i == 0 {
                chosen = meta;
            }
        }

        {
            let header = PageHeader::from_bytes_mut(&mut buf[page_size * 2..])?;
            header.set_id(2);
            header.set_flags(FREELIST_PAGE_FLAG);
        }
        {
            let header = PageHeader::from_bytes_mut(&mut buf[page_size * 3..])?;
            header.set_id(3);
            header.set_flags(LEAF_PAGE_FLAG);
        }

        file.write_all(&buf).wrap_err("failed to write initial pages")?;
        file.sync_all().wrap_err("failed to sync initial pages")?;

        Ok(chosen)
    }

    /// Reads and validates both meta pages of an existing file, returning
    /// the winner. Exactly `page_size` bytes are read per meta page.
    fn load_meta(file: &mut File, page_size: usize) -> Result<Meta> {
        let mut buf = vec![0u8; page_size * 2];
        file.seek(SeekFrom::Start(0))
            .wrap_err("failed to seek to meta pages")?;
        if file.read_exact(&mut buf).is_err() {
            return Err(Error::Invalid.into());
        }

        let meta0 = meta_from_page(&buf[..page_size])?;
        let meta1 = meta_from_page(&buf[page_size..])?;

        match (meta0.validate(), meta1.validate()) {
            // A single torn or stale copy is healed by its sibling.
            (Ok(()), Err(e1)) => {
                debug!(error = %e1, "meta page 1 invalid; recovered from meta page 0");
                Ok(*meta0)
            }
            (Err(e0), Ok(())) => {
                debug!(error = %e0, "meta page 0 invalid; recovered from meta page 1");
                Ok(*meta1)
            }
            (Ok(()), Ok(())) => {
                if meta1.txid() > meta0.txid() {
                    Ok(*meta1)
                } else {
                    Ok(*meta0)
                }
            }
            (Err(e0), Err(_)) => Err(e0.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// The current valid meta record.
    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    /// Resolves a page (with its overflow span) from the mapping.
    pub(crate) fn page(&self, id: Pgid) -> Result<&[u8]> {
        self.mmap.page(id)
    }

    /// Begins the write transaction. The exclusive borrow is the writer
    /// lock: no second writer, and no reads through this handle, until the
    /// transaction ends.
    pub fn begin_rw(&mut self) -> Result<Tx<'_>> {
        let mut meta = self.meta;
        meta.set_txid(meta.txid() + 1);

        // The initial metas predate any allocation bookkeeping; the
        // operative high-water mark is the file's page count.
        let file_pages = self.mmap.size() / self.page_size as u64;
        if meta.pgid() < file_pages {
            meta.set_pgid(file_pages);
        }

        // With reader coordination outside this handle, everything freed by
        // previous transactions is reusable now.
        self.freelist.release(meta.txid().saturating_sub(1));

        Ok(Tx::new(self, meta))
    }

    /// Applies a committed transaction's pages and meta to the file: grow
    /// the mapping if the high-water mark outran it, copy the dirty pages,
    /// stamp the meta into its alternating slot, and sync.
    pub(crate) fn write_commit(&mut self, pages: &HashMap<Pgid, Vec<u8>>, meta: &Meta) -> Result<()> {
        let need = meta.pgid() * self.page_size as u64;
        if need > self.mmap.size() {
            self.mmap.grow(need)?;
        }
        self.mmap.ensure_capacity(meta.pgid())?;

        for (&id, buf) in pages {
            let offset = id as usize * self.page_size;
            self.mmap
                .region_mut(offset, buf.len())?
                .copy_from_slice(buf);
        }

        let meta_pgid = meta.txid() % 2;
        let offset = meta_pgid as usize * self.page_size;
        let region = self.mmap.region_mut(offset, self.page_size)?;
        meta.write_to_page(region, meta_pgid)?;

        self.mmap.sync()?;
        self.meta = *meta;

        debug!(txid = meta.txid(), pages = pages.len(), "commit written");
        Ok(())
    }

    /// Convenience wrapper: run one closure inside a write transaction and
    /// commit it.
    pub fn update<F>(&mut self, f: F) -> Result<TxStats>
    where
        F: FnOnce(&mut Tx<'_>) -> Result<()>,
    {
        let mut tx = self.begin_rw()?;
        match f(&mut tx) {
            Ok(()) => tx.commit(),
            Err(e) => {
                tx.rollback()?;
                Err(e)
            }
        }
    }
}
