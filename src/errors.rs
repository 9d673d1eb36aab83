//! # Error Taxonomy
//!
//! Typed errors surfaced at the database boundary. All fallible functions in
//! the crate return `eyre::Result`; the variants below are the ones callers
//! can usefully match on, and they survive a `downcast_ref` through the
//! `eyre::Report` chain:
//!
//! ```ignore
//! match Db::open(path) {
//!     Err(report) if report.downcast_ref::<Error>() == Some(&Error::Checksum) => {
//!         // both meta pages failed their integrity check
//!     }
//!     other => { /* ... */ }
//! }
//! ```
//!
//! Everything else (I/O failures, mmap errors, short buffers) is reported as
//! a plain `eyre` error with context attached at the failure site.

use thiserror::Error as ThisError;

/// Errors produced by meta-page validation on open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ThisError)]
pub enum Error {
    /// The data file was created by a different format version.
    #[error("version mismatch")]
    VersionMismatch,

    /// A meta page checksum does not match its contents.
    #[error("checksum error")]
    Checksum,

    /// The meta region is too short or unreadable to be a database file.
    #[error("invalid database")]
    Invalid,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_survive_eyre_downcast() {
        let report: eyre::Report = Error::Checksum.into();
        assert_eq!(report.downcast_ref::<Error>(), Some(&Error::Checksum));
    }

    #[test]
    fn error_messages_are_stable() {
        assert_eq!(Error::VersionMismatch.to_string(), "version mismatch");
        assert_eq!(Error::Checksum.to_string(), "checksum error");
        assert_eq!(Error::Invalid.to_string(), "invalid database");
    }
}
