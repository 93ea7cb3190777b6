//! File descriptor and directory listing types

use super::OwnerId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Outcome of a successful create or write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDescriptor {
    /// Metadata store id, when a store assigned one
    pub id: Option<i64>,
    pub filename: String,
    /// Sandbox-relative location with `/` separators
    pub location: String,
    pub size: u64,
    pub owner: OwnerId,
    /// SHA-256 of the content now on disk, hex encoded
    pub sha256: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Directory,
    File,
}

/// One row of a directory listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListEntry {
    pub name: String,
    pub kind: EntryKind,
    /// Byte size for files, `None` for directories
    pub size: Option<u64>,
    pub modified: Option<chrono::DateTime<chrono::Utc>>,
    pub mime_type: Option<String>,
}

impl ListEntry {
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    /// Directories first, then by name
    pub fn listing_order(a: &Self, b: &Self) -> Ordering {
        match (a.is_dir(), b.is_dir()) {
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            _ => a.name.cmp(&b.name),
        }
    }
}
