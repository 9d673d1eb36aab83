//! # Memory-Mapped File Storage
//!
//! `MmapFile` maps the whole database file into the process address space
//! and hands out page-sized slices of it. Reads are zero-copy; page faults
//! and caching are left to the OS.
//!
//! ## Safety Model
//!
//! A mapping becomes invalid when the file is grown and remapped. Growth
//! requires `&mut self`, so the borrow checker rejects any `&[u8]` page
//! reference held across a `grow()` call — no guards, epochs, or reference
//! counting. Raw aliases that deliberately escape this discipline (the node
//! engine's mapped byte ranges) are governed by the dereference protocol in
//! `btree::bytes` and must be detached before any remap.
//!
//! ## Growth Curve
//!
//! The mapping doubles from 32 KiB up to 1 GiB, then grows in 1 GiB steps,
//! rounded up to a page-size multiple and capped at 256 TiB. The file is
//! extended to match the mapping before remapping, so the mapped range is
//! always backed by the file.

use std::fs::File;

use eyre::{bail, ensure, Result, WrapErr};
use memmap2::MmapMut;
use tracing::debug;

use crate::config::{MAX_MAP_SIZE, MAX_MMAP_STEP, MIN_MMAP_SIZE};

use super::page::{PageHeader, Pgid};

/// Computes the mapping size for a requested minimum, following the growth
/// curve above. Fails when the request exceeds the maximum mapping size.
pub fn mmap_size(min_size: u64, page_size: usize) -> Result<u64> {
    // Double from 32 KiB until 1 GiB.
    let mut step = MIN_MMAP_SIZE;
    loop {
        if min_size <= step {
            return Ok(step);
        }
        if step == MAX_MMAP_STEP {
            break;
        }
        step <<= 1;
    }

    ensure!(min_size <= MAX_MAP_SIZE, "mmap too large");

    // Above 1 GiB, grow one step at a time.
    let mut size = min_size;
    let remainder = size % MAX_MMAP_STEP;
    if remainder > 0 {
        size += MAX_MMAP_STEP - remainder;
    }

    // Keep the mapping a multiple of the page size.
    let page_size = page_size as u64;
    if size % page_size != 0 {
        size = (size / page_size + 1) * page_size;
    }

    if size > MAX_MAP_SIZE {
        size = MAX_MAP_SIZE;
    }

    Ok(size)
}

#[derive(Debug)]
pub struct MmapFile {
    file: File,
    mmap: MmapMut,
    page_size: usize,
}

impl MmapFile {
    /// Maps an already-initialized database file.
    pub fn map(file: File, page_size: usize) -> Result<Self> {
        let len = file
            .metadata()
            .wrap_err("failed to stat database file")?
            .len();

        ensure!(
            len >= (page_size as u64) * 2,
            "file size {} too small for two meta pages",
            len
        );

        // SAFETY: MmapMut::map_mut is unsafe because externally modified
        // files yield undefined behavior. This is safe because:
        // 1. The file is opened read+write by this process for its lifetime
        //    and the format is not meant to be shared with other writers.
        // 2. The mapping's lifetime is tied to MmapFile, so it cannot be
        //    used after the struct (and the file handle) are dropped.
        // 3. All access goes through page()/page_mut(), which bounds-check.
        let mmap = unsafe { MmapMut::map_mut(&file).wrap_err("failed to memory-map file")? };

        Ok(Self {
            file,
            mmap,
            page_size,
        })
    }

    /// Current mapping size in bytes. Always equals the file size.
    pub fn size(&self) -> u64 {
        self.mmap.len() as u64
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Returns the full span of the page at `id`, including its overflow
    /// pages.
    pub fn page(&self, id: Pgid) -> Result<&[u8]> {
        let offset = (id as usize) * self.page_size;
        ensure!(
            offset + self.page_size <= self.mmap.len(),
            "page {} out of bounds (mapped {})",
            id,
            self.mmap.len()
        );

        let header = PageHeader::from_bytes(&self.mmap[offset..])?;
        let span = (header.overflow() as usize + 1) * self.page_size;
        ensure!(
            offset + span <= self.mmap.len(),
            "page {} overflow span {} out of bounds (mapped {})",
            id,
            span,
            self.mmap.len()
        );

        Ok(&self.mmap[offset..offset + span])
    }

    /// Mutable access to a single page-aligned region of `len` bytes.
    pub fn region_mut(&mut self, offset: usize, len: usize) -> Result<&mut [u8]> {
        ensure!(
            offset + len <= self.mmap.len(),
            "region {}..{} out of bounds (mapped {})",
            offset,
            offset + len,
            self.mmap.len()
        );
        Ok(&mut self.mmap[offset..offset + len])
    }

    /// Extends the file and remaps it so at least `min_size` bytes are
    /// addressable. No-op when the mapping is already large enough.
    ///
    /// Any raw aliases into the old mapping must have been detached by the
    /// caller before this is called.
    pub fn grow(&mut self, min_size: u64) -> Result<()> {
        if min_size <= self.mmap.len() as u64 {
            return Ok(());
        }

        let target = mmap_size(min_size, self.page_size)?;

        self.mmap
            .flush()
            .wrap_err("failed to flush mmap before grow")?;

        self.file
            .set_len(target)
            .wrap_err_with(|| format!("failed to extend file to {} bytes", target))?;

        // SAFETY: the old mapping is invalid after remap. This is safe
        // because:
        // 1. grow() takes &mut self, so no borrowed page slices exist.
        // 2. The node engine detaches its raw mapped ranges before any
        //    operation that can reach grow().
        // 3. The file was extended to `target` before remapping, so the new
        //    mapping is fully backed.
        self.mmap =
            unsafe { MmapMut::map_mut(&self.file).wrap_err("failed to remap file after grow")? };

        debug!(size = target, "grew database mapping");
        Ok(())
    }

    /// Flushes the mapping to disk.
    pub fn sync(&self) -> Result<()> {
        self.mmap.flush().wrap_err("failed to sync mmap to disk")
    }

    /// Fails when the mapping cannot hold `page_count` pages without a
    /// remap. Used to assert the dereference protocol was honored.
    pub fn ensure_capacity(&self, page_count: u64) -> Result<()> {
        let need = page_count * self.page_size as u64;
        if need > self.size() {
            bail!(
                "mapping too small: need {} bytes, mapped {}",
                need,
                self.size()
            );
        }
        Ok(())
    }
}
