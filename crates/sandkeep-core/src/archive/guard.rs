//! Declared-metadata validation

use super::{ArchiveEntry, ArchiveLimits, ArchiveValidationResult};
use crate::error::{ArchiveError, Result};
use crate::sandbox::FilenameValidator;
use std::fs::File;
use std::io::{Read, Seek};
use std::path::Path;
use tracing::debug;
use zip::ZipArchive;

/// Validates, extracts and creates archives within configured ceilings
#[derive(Debug, Clone)]
pub struct ArchiveGuard {
    limits: ArchiveLimits,
    names: FilenameValidator,
}

impl ArchiveGuard {
    pub fn new(limits: ArchiveLimits) -> Self {
        Self {
            limits,
            names: FilenameValidator::default(),
        }
    }

    /// Check extracted entry names with `names` instead of the default rules
    pub fn with_names(mut self, names: FilenameValidator) -> Self {
        self.names = names;
        self
    }

    pub fn limits(&self) -> &ArchiveLimits {
        &self.limits
    }

    pub fn names(&self) -> &FilenameValidator {
        &self.names
    }

    /// Reject an entry whose ratio is too high or whose sizes are degenerate
    pub fn check_entry(&self, entry: &ArchiveEntry) -> Result<()> {
        if entry.compressed_size > 0 {
            let ratio = entry.uncompressed_size as f64 / entry.compressed_size as f64;
            if ratio > self.limits.max_ratio {
                return Err(ArchiveError::RatioExceeded {
                    entry: entry.name.clone(),
                    ratio,
                    limit: self.limits.max_ratio,
                }
                .into());
            }
        } else if entry.uncompressed_size > 0 {
            return Err(ArchiveError::ZeroCompressedSize(entry.name.clone()).into());
        }
        Ok(())
    }

    /// Validate declared entry metadata, accumulating totals
    pub fn validate_entries<'a, I>(&self, entries: I) -> Result<ArchiveValidationResult>
    where
        I: IntoIterator<Item = &'a ArchiveEntry>,
    {
        let mut totals = ArchiveValidationResult::default();
        for entry in entries {
            self.absorb(&mut totals, entry)?;
        }
        Ok(totals)
    }

    /// Validate an archive file's central directory before extracting it
    pub fn validate_archive(&self, path: &Path) -> Result<ArchiveValidationResult> {
        let mut archive = ZipArchive::new(File::open(path)?)?;
        self.validate_zip(&mut archive)
    }

    pub(crate) fn validate_zip<R: Read + Seek>(
        &self,
        archive: &mut ZipArchive<R>,
    ) -> Result<ArchiveValidationResult> {
        let mut totals = ArchiveValidationResult::default();
        for index in 0..archive.len() {
            let file = archive.by_index(index)?;
            let entry = ArchiveEntry::new(file.name(), file.size(), file.compressed_size());
            self.absorb(&mut totals, &entry)?;
        }
        debug!(
            "Archive validated: {} entries, {} bytes uncompressed",
            totals.file_count, totals.total_uncompressed
        );
        Ok(totals)
    }

    fn absorb(&self, totals: &mut ArchiveValidationResult, entry: &ArchiveEntry) -> Result<()> {
        totals.file_count += 1;
        if totals.file_count > self.limits.max_files {
            return Err(ArchiveError::TooManyEntries {
                limit: self.limits.max_files,
            }
            .into());
        }

        self.check_entry(entry)?;

        totals.total_uncompressed = totals
            .total_uncompressed
            .saturating_add(entry.uncompressed_size);
        totals.total_compressed = totals.total_compressed.saturating_add(entry.compressed_size);

        if totals.total_uncompressed > self.limits.max_total_size {
            return Err(ArchiveError::TotalSizeExceeded {
                limit: self.limits.max_total_size,
            }
            .into());
        }
        Ok(())
    }
}

impl Default for ArchiveGuard {
    fn default() -> Self {
        Self::new(ArchiveLimits::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::test_support::{deflated, stored};
    use crate::error::{Error, ErrorKind};
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    fn guard(max_files: usize, max_ratio: f64, max_total_size: u64) -> ArchiveGuard {
        ArchiveGuard::new(ArchiveLimits {
            max_files,
            max_ratio,
            max_total_size,
            max_recursion_depth: 3,
        })
    }

    #[test]
    fn test_ratio_over_limit_rejected() {
        let guard = guard(10, 100.0, u64::MAX);
        let bomb = ArchiveEntry::new("bomb.bin", 100_000, 100);

        let err = guard.validate_entries([&bomb]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::QuotaExceeded);
        match err {
            Error::Archive(ArchiveError::RatioExceeded { ratio, .. }) => assert_eq!(ratio, 1000.0),
            other => panic!("expected RatioExceeded, got {:?}", other),
        }
    }

    #[test]
    fn test_ratio_at_limit_accepted() {
        let guard = guard(10, 100.0, u64::MAX);
        let entry = ArchiveEntry::new("text.log", 10_000, 100);
        assert!(guard.check_entry(&entry).is_ok());
    }

    #[test]
    fn test_zero_compressed_size() {
        let guard = guard(10, 100.0, u64::MAX);

        let degenerate = ArchiveEntry::new("weird", 10, 0);
        let err = guard.check_entry(&degenerate).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::QuotaExceeded);

        let empty = ArchiveEntry::new("empty", 0, 0);
        assert!(guard.check_entry(&empty).is_ok());
    }

    #[test]
    fn test_entry_count_limit() {
        let guard = guard(2, 100.0, u64::MAX);
        let entries: Vec<_> = (0..3)
            .map(|i| ArchiveEntry::new(format!("f{}", i), 1, 1))
            .collect();

        assert!(guard.validate_entries(&entries[..2]).is_ok());
        let err = guard.validate_entries(&entries).unwrap_err();
        assert!(matches!(
            err,
            Error::Archive(ArchiveError::TooManyEntries { limit: 2 })
        ));
    }

    #[test]
    fn test_total_size_limit() {
        let guard = guard(10, 100.0, 150);
        let entries = [
            ArchiveEntry::new("a", 100, 50),
            ArchiveEntry::new("b", 100, 50),
        ];

        let err = guard.validate_entries(&entries).unwrap_err();
        assert!(matches!(
            err,
            Error::Archive(ArchiveError::TotalSizeExceeded { limit: 150 })
        ));
    }

    #[test]
    fn test_totals_accumulate() {
        let guard = guard(10, 100.0, 1_000);
        let entries = [
            ArchiveEntry::new("a", 300, 100),
            ArchiveEntry::new("b", 200, 150),
            ArchiveEntry::new("dir/", 0, 0),
        ];

        let result = guard.validate_entries(&entries).unwrap();
        assert_eq!(
            result,
            ArchiveValidationResult {
                file_count: 3,
                total_uncompressed: 500,
                total_compressed: 250,
            }
        );
    }

    #[test]
    fn test_real_zip_bomb_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bomb.zip");
        let zeros = vec![0u8; 100_000];
        std::fs::write(&path, deflated(&[("zeros.bin", &zeros)])).unwrap();

        let err = guard(10, 100.0, u64::MAX).validate_archive(&path).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::QuotaExceeded);
    }

    #[test]
    fn test_validate_archive_reads_metadata() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ok.zip");
        std::fs::write(&path, stored(&[("a.txt", b"hello"), ("b.txt", b"world!")])).unwrap();

        let result = guard(10, 100.0, 1_000).validate_archive(&path).unwrap();
        assert_eq!(result.file_count, 2);
        assert_eq!(result.total_uncompressed, 11);
        assert_eq!(result.total_compressed, 11);
    }

    #[test]
    fn test_not_a_zip_is_malformed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fake.zip");
        std::fs::write(&path, b"definitely not a zip archive").unwrap();

        let err = ArchiveGuard::default().validate_archive(&path).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedArchive);
    }
}
