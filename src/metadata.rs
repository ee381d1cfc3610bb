//! File metadata and the flatten rule for merging partition listings.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Metadata of one stored file.
///
/// Ordering is newest-wins: a larger timestamp compares greater, ties are
/// broken by the larger size. Broadcast queries keep the maximum per name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    /// File size in bytes
    pub size: u64,

    /// Modification time (Unix timestamp, seconds)
    pub timestamp: i64,
}

impl FileMetadata {
    pub fn new(size: u64, timestamp: i64) -> Self {
        Self { size, timestamp }
    }
}

impl Ord for FileMetadata {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.timestamp, self.size).cmp(&(other.timestamp, other.size))
    }
}

impl PartialOrd for FileMetadata {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Fold one listing entry into an accumulated map, retaining the maximum
/// metadata when the same name appears in several partitions.
pub fn merge_entry(acc: &mut HashMap<String, FileMetadata>, name: String, meta: FileMetadata) {
    acc.entry(name)
        .and_modify(|existing| {
            if meta > *existing {
                *existing = meta;
            }
        })
        .or_insert(meta);
}
