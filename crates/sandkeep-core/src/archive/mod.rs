//! Archive bomb and zip slip protection
//!
//! This module provides:
//! - Metadata validation (entry count, compression ratio, total size)
//! - Contained, size-capped, rollback-on-failure extraction with bounded
//!   nested archive expansion
//! - Pre-flight accounted archive creation

mod create;
mod extract;
mod guard;

pub use guard::ArchiveGuard;

use crate::error::{ArchiveError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Ceilings applied to every archive operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveLimits {
    pub max_files: usize,
    pub max_ratio: f64,
    pub max_total_size: u64,
    pub max_recursion_depth: u32,
}

impl Default for ArchiveLimits {
    fn default() -> Self {
        Self {
            max_files: 1000,
            max_ratio: 100.0,
            max_total_size: 2 * 1024 * 1024 * 1024,
            max_recursion_depth: 5,
        }
    }
}

/// Declared metadata of one archive member
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// Name as stored, before any containment check
    pub name: String,
    pub uncompressed_size: u64,
    pub compressed_size: u64,
}

impl ArchiveEntry {
    pub fn new(name: impl Into<String>, uncompressed_size: u64, compressed_size: u64) -> Self {
        Self {
            name: name.into(),
            uncompressed_size,
            compressed_size,
        }
    }
}

/// Totals over the entries examined so far
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveValidationResult {
    pub file_count: usize,
    pub total_uncompressed: u64,
    pub total_compressed: u64,
}

/// Remaining archive expansions, the top-level archive included
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecursionBudget {
    remaining: u32,
    limit: u32,
}

impl RecursionBudget {
    pub fn new(limit: u32) -> Self {
        Self {
            remaining: limit,
            limit,
        }
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    /// Spend one level to expand `archive`; fails once the budget is exhausted
    pub fn descend(self, archive: &Path) -> Result<Self> {
        match self.remaining.checked_sub(1) {
            Some(remaining) => Ok(Self {
                remaining,
                limit: self.limit,
            }),
            None => Err(ArchiveError::RecursionLimit {
                archive: archive.to_path_buf(),
                limit: self.limit,
            }
            .into()),
        }
    }
}

/// Whether an entry name looks like an archive we expand
pub fn is_archive_name(name: &str) -> bool {
    name.to_ascii_lowercase().ends_with(".zip")
}
