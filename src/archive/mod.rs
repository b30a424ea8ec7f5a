//! Fingerprinted artifact archives
//!
//! Each routing artifact on disk is a single-file archive: a fingerprint,
//! a bincode-encoded index of named entries, then the raw entry payloads.
//! Typed-array entries carry their element count in a sidecar entry named
//! `<name>.meta`; the reader folds those into the parent entry and never
//! reports them on their own.

pub mod reader;
pub mod writer;

pub use reader::{ArchiveEntry, ArchiveReader};
pub use writer::ArchiveWriter;

use serde::{Deserialize, Serialize};

/// Fingerprint at the start of every artifact archive
pub const ARCHIVE_FINGERPRINT: u64 = 0x5741594d41524b31; // "WAYMARK1"

/// Suffix of sidecar entries carrying element counts
pub const META_SUFFIX: &str = ".meta";

/// On-disk index record, one per entry (including `.meta` sidecars)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct IndexRecord {
    pub name: String,
    /// Offset of the payload relative to the end of the index
    pub offset: u64,
    pub byte_size: u64,
}
