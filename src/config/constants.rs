//! # Engine Constants
//!
//! Format constants are fixed by the on-disk layout and must never change
//! without a version bump; tuning constants control split/merge behavior and
//! mmap growth and are safe to adjust.

/// On-disk format version stamped into every meta page.
pub const META_VERSION: u32 = 1;

/// Minimum number of entries on either side of a split. A branch node below
/// this count cannot address its children unambiguously.
pub const MIN_KEYS_PER_PAGE: usize = 2;

/// Lower clamp for a bucket's fill percent.
pub const MIN_FILL_PERCENT: f64 = 0.1;

/// Upper clamp for a bucket's fill percent.
pub const MAX_FILL_PERCENT: f64 = 1.0;

/// Split threshold fraction applied when a bucket doesn't override it.
pub const DEFAULT_FILL_PERCENT: f64 = 0.5;

/// Largest supported mmap: 256 TiB.
pub const MAX_MAP_SIZE: u64 = 0xFFFF_FFFF_FFFF;

/// Largest single remap step: 1 GiB. Below this the mapping doubles.
pub const MAX_MMAP_STEP: u64 = 1 << 30;

/// Smallest mapping the growth curve will produce: 32 KiB.
pub const MIN_MMAP_SIZE: u64 = 1 << 15;

/// Pages written by `init`: two meta pages, the freelist page, and the
/// initial empty leaf.
pub const INIT_PAGE_COUNT: usize = 4;

const _: () = assert!(MIN_FILL_PERCENT < MAX_FILL_PERCENT);
const _: () = assert!(
    DEFAULT_FILL_PERCENT >= MIN_FILL_PERCENT && DEFAULT_FILL_PERCENT <= MAX_FILL_PERCENT
);
const _: () = assert!(MIN_MMAP_SIZE < MAX_MMAP_STEP);
const _: () = assert!(MAX_MMAP_STEP < MAX_MAP_SIZE);

/// Returns the OS page size, the default page size for new database files.
#[cfg(unix)]
pub fn default_page_size() -> usize {
    // SAFETY: sysconf with _SC_PAGESIZE has no preconditions; it only reads
    // kernel-provided configuration and cannot fault.
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz > 0 {
        sz as usize
    } else {
        4096
    }
}

/// Returns the default page size for new database files.
#[cfg(not(unix))]
pub fn default_page_size() -> usize {
    4096
}
