//! Contained extraction with nested archive expansion
//!
//! Every entry is checked twice: lexically against its stored name, then on
//! the canonical form of its target. Bytes are streamed in fixed chunks
//! against a running cap shared by the whole extraction, nested archives
//! included, so a lying header cannot push past `max_total_size`. On any
//! failure the files and directories this extraction created are removed.

use super::{is_archive_name, ArchiveGuard, RecursionBudget};
use crate::error::{ArchiveError, Error, Result, SandboxError};
use crate::sandbox::path::{canonicalize_lenient, is_within, normalize_relative};
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use zip::ZipArchive;

const CHUNK_SIZE: usize = 8192;

impl ArchiveGuard {
    /// Extract `archive` into `destination`, expanding nested archives.
    ///
    /// Returns the canonical paths of every file written. Nested archives are
    /// extracted into a directory named after the archive's stem, next to it.
    pub fn extract(&self, archive: &Path, destination: &Path) -> Result<Vec<PathBuf>> {
        let mut run = Extraction {
            guard: self,
            written: 0,
            files: Vec::new(),
            created_dirs: Vec::new(),
        };

        match run.execute(archive, destination) {
            Ok(()) => {
                info!(
                    "Extracted {:?}: {} files, {} bytes",
                    archive,
                    run.files.len(),
                    run.written
                );
                Ok(run.files)
            }
            Err(e) => {
                warn!("Extraction of {:?} failed, rolling back: {}", archive, e);
                run.rollback();
                Err(e)
            }
        }
    }
}

struct Extraction<'a> {
    guard: &'a ArchiveGuard,
    written: u64,
    files: Vec<PathBuf>,
    created_dirs: Vec<PathBuf>,
}

impl Extraction<'_> {
    fn execute(&mut self, archive: &Path, destination: &Path) -> Result<()> {
        // the top-level archive counts against the depth limit too
        let budget =
            RecursionBudget::new(self.guard.limits().max_recursion_depth).descend(archive)?;
        let mut pending = VecDeque::from([(
            archive.to_path_buf(),
            destination.to_path_buf(),
            budget,
        )]);

        while let Some((archive, destination, budget)) = pending.pop_front() {
            for nested in self.extract_one(&archive, &destination)? {
                let inner_budget = budget.descend(&nested)?;
                let inner_destination = nested_destination(&nested)?;
                debug!(
                    "Queueing nested archive {:?} ({} levels left)",
                    nested,
                    inner_budget.remaining()
                );
                pending.push_back((nested, inner_destination, inner_budget));
            }
        }
        Ok(())
    }

    /// Extract one archive level, returning the nested archives it wrote
    fn extract_one(&mut self, archive: &Path, destination: &Path) -> Result<Vec<PathBuf>> {
        let mut zip = ZipArchive::new(File::open(archive)?)?;
        self.guard.validate_zip(&mut zip)?;

        self.ensure_dir(destination)?;
        let root = destination.canonicalize()?;
        let mut nested = Vec::new();

        for index in 0..zip.len() {
            let mut entry = zip.by_index(index)?;
            let name = entry.name().to_string();

            let relative = normalize_relative(&name).map_err(|reason| {
                debug!("Rejected archive entry {:?}: {}", name, reason);
                escapes(&name)
            })?;
            if relative.as_os_str().is_empty() {
                continue;
            }
            for component in relative.components() {
                self.guard
                    .names()
                    .validate(&component.as_os_str().to_string_lossy())?;
            }

            let target = canonicalize_lenient(&root.join(&relative)).map_err(|e| {
                if e.kind() == io::ErrorKind::NotFound {
                    escapes(&name)
                } else {
                    Error::Io(e)
                }
            })?;
            if !is_within(&root, &target) {
                return Err(escapes(&name));
            }

            if entry.is_dir() {
                self.ensure_dir(&target)?;
                continue;
            }

            if let Some(parent) = target.parent() {
                self.ensure_dir(parent)?;
            }
            self.write_entry(&mut entry, &target)?;

            if is_archive_name(&name) {
                nested.push(target);
            }
        }

        Ok(nested)
    }

    fn write_entry<R: Read>(&mut self, entry: &mut R, target: &Path) -> Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(target)
            .map_err(|e| {
                if e.kind() == io::ErrorKind::AlreadyExists {
                    Error::Sandbox(SandboxError::AlreadyExists(
                        target.to_string_lossy().to_string(),
                    ))
                } else {
                    Error::Io(e)
                }
            })?;
        self.files.push(target.to_path_buf());

        let limit = self.guard.limits().max_total_size;
        let mut buffer = [0u8; CHUNK_SIZE];
        loop {
            let read = entry.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            if self.written + read as u64 > limit {
                return Err(ArchiveError::TotalSizeExceeded { limit }.into());
            }
            file.write_all(&buffer[..read])?;
            self.written += read as u64;
        }
        file.sync_all()?;
        Ok(())
    }

    /// Create `dir` and remember which ancestors did not exist before
    fn ensure_dir(&mut self, dir: &Path) -> Result<()> {
        let mut missing = Vec::new();
        let mut current = Some(dir);
        while let Some(path) = current {
            if path.exists() {
                break;
            }
            missing.push(path.to_path_buf());
            current = path.parent();
        }

        fs::create_dir_all(dir)?;
        self.created_dirs.extend(missing.into_iter().rev());
        Ok(())
    }

    fn rollback(&mut self) {
        for file in self.files.drain(..).rev() {
            if let Err(e) = fs::remove_file(&file) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!("Failed to remove extracted file {:?}: {}", file, e);
                }
            }
        }
        // deepest first; a directory something else wrote into stays
        for dir in self.created_dirs.drain(..).rev() {
            let _ = fs::remove_dir(&dir);
        }
    }
}

fn nested_destination(archive: &Path) -> Result<PathBuf> {
    match (archive.parent(), archive.file_stem()) {
        (Some(parent), Some(stem)) if Some(stem) != archive.file_name() => Ok(parent.join(stem)),
        _ => Err(ArchiveError::Malformed(format!(
            "cannot derive extraction directory for nested archive {:?}",
            archive
        ))
        .into()),
    }
}

fn escapes(name: &str) -> Error {
    Error::Archive(ArchiveError::EntryEscapes(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::test_support::{deflated, stored};
    use crate::archive::ArchiveLimits;
    use crate::error::ErrorKind;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    fn guard_with(max_total_size: u64, max_recursion_depth: u32) -> ArchiveGuard {
        ArchiveGuard::new(ArchiveLimits {
            max_files: 100,
            max_ratio: 100.0,
            max_total_size,
            max_recursion_depth,
        })
    }

    fn write_archive(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, bytes).unwrap();
        path
    }

    /// An archive nested `depth` levels below the top-level one
    fn nested_archive(depth: u32) -> Vec<u8> {
        let mut bytes = stored(&[("leaf.txt", b"bottom")]);
        for level in (1..=depth).rev() {
            let name = format!("level{}.zip", level);
            bytes = stored(&[(name.as_str(), &bytes)]);
        }
        bytes
    }

    #[test]
    fn test_extracts_files_and_directories() {
        let dir = tempdir().unwrap();
        let archive = write_archive(
            dir.path(),
            "bundle.zip",
            &deflated(&[
                ("docs/", b""),
                ("docs/readme.md", b"# hello"),
                ("top.txt", b"top level"),
            ]),
        );
        let out = dir.path().join("out");

        let files = ArchiveGuard::default().extract(&archive, &out).unwrap();

        assert_eq!(files.len(), 2);
        assert_eq!(fs::read_to_string(out.join("docs/readme.md")).unwrap(), "# hello");
        assert_eq!(fs::read_to_string(out.join("top.txt")).unwrap(), "top level");
        assert!(files.iter().all(|f| f.is_absolute()));
    }

    #[test]
    fn test_zip_slip_rejected() {
        let dir = tempdir().unwrap();
        let archive = write_archive(
            dir.path(),
            "evil.zip",
            &stored(&[("../../outside.txt", b"pwned")]),
        );
        let out = dir.path().join("a/b/out");

        let err = ArchiveGuard::default().extract(&archive, &out).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::SecurityViolation);
        assert!(!dir.path().join("a/outside.txt").exists());
        assert!(!dir.path().join("outside.txt").exists());
    }

    #[test]
    fn test_absolute_entry_rejected() {
        let dir = tempdir().unwrap();
        let archive = write_archive(dir.path(), "abs.zip", &stored(&[("/etc/evil", b"x")]));

        let err = ArchiveGuard::default()
            .extract(&archive, &dir.path().join("out"))
            .unwrap_err();
        assert!(err.is_security_violation());
    }

    #[test]
    fn test_failure_rolls_back_earlier_entries() {
        let dir = tempdir().unwrap();
        let archive = write_archive(
            dir.path(),
            "mixed.zip",
            &stored(&[("sub/good.txt", b"fine"), ("../bad.txt", b"nope")]),
        );
        let out = dir.path().join("out");

        let err = ArchiveGuard::default().extract(&archive, &out).unwrap_err();

        assert!(err.is_security_violation());
        assert!(!out.join("sub/good.txt").exists());
        assert!(!out.exists());
    }

    #[test]
    fn test_invalid_entry_names_rejected() {
        let dir = tempdir().unwrap();

        let names = ["CON", "docs/a?b.txt", "nul/inner.txt", "dir/x:y"];
        for (i, name) in names.into_iter().enumerate() {
            let archive = write_archive(
                dir.path(),
                &format!("bad{}.zip", i),
                &stored(&[("ok.txt", b"fine"), (name, b"x")]),
            );
            let out = dir.path().join(format!("out{}", i));

            let err = guard_with(u64::MAX, 3).extract(&archive, &out).unwrap_err();

            assert_eq!(err.kind(), ErrorKind::InvalidName, "entry {:?}", name);
            assert!(!out.exists());
        }
    }

    #[test]
    fn test_existing_file_not_overwritten() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("out");
        fs::create_dir_all(&out).unwrap();
        fs::write(out.join("keep.txt"), "original").unwrap();
        let archive = write_archive(dir.path(), "clash.zip", &stored(&[("keep.txt", b"new")]));

        let err = ArchiveGuard::default().extract(&archive, &out).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        assert_eq!(fs::read_to_string(out.join("keep.txt")).unwrap(), "original");
        assert!(out.exists());
    }

    #[test]
    fn test_nested_depth_boundary() {
        let dir = tempdir().unwrap();

        // a limit of 3 admits the top-level archive plus two nested levels
        let ok = write_archive(dir.path(), "ok.zip", &nested_archive(2));
        let files = guard_with(u64::MAX, 3)
            .extract(&ok, &dir.path().join("ok"))
            .unwrap();
        let leaf = dir.path().join("ok/level1/level2/leaf.txt");
        assert_eq!(fs::read_to_string(&leaf).unwrap(), "bottom");
        assert_eq!(files.len(), 3);

        let deep = write_archive(dir.path(), "deep.zip", &nested_archive(3));
        let err = guard_with(u64::MAX, 3)
            .extract(&deep, &dir.path().join("deep"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::QuotaExceeded);
        assert!(!dir.path().join("deep").exists());
    }

    #[test]
    fn test_zero_depth_rejects_flat_archive() {
        let dir = tempdir().unwrap();
        let flat = write_archive(dir.path(), "flat.zip", &stored(&[("a.txt", b"a")]));

        let err = guard_with(u64::MAX, 0)
            .extract(&flat, &dir.path().join("out"))
            .unwrap_err();

        assert!(matches!(
            err,
            Error::Archive(ArchiveError::RecursionLimit { limit: 0, .. })
        ));
        assert!(!dir.path().join("out").exists());
    }

    #[test]
    fn test_depth_one_rejects_any_nesting() {
        let dir = tempdir().unwrap();

        let flat = write_archive(dir.path(), "flat.zip", &nested_archive(0));
        let files = guard_with(u64::MAX, 1)
            .extract(&flat, &dir.path().join("flat"))
            .unwrap();
        assert_eq!(files.len(), 1);

        let nested = write_archive(dir.path(), "nested.zip", &nested_archive(1));
        let err = guard_with(u64::MAX, 1)
            .extract(&nested, &dir.path().join("nested"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::QuotaExceeded);
        assert!(!dir.path().join("nested").exists());
    }

    #[test]
    fn test_running_cap_spans_nested_archives() {
        let dir = tempdir().unwrap();
        let payload = [b'a'; 60];
        let inner = stored(&[("b.txt", &payload)]);
        let outer = stored(&[("a.txt", &payload), ("inner.zip", &inner)]);
        let archive = write_archive(dir.path(), "outer.zip", &outer);

        // each level's declared total fits, the sum of both does not
        let cap = 60 + inner.len() as u64 + 10;
        let err = guard_with(cap, 3)
            .extract(&archive, &dir.path().join("out"))
            .unwrap_err();

        assert!(matches!(
            err,
            Error::Archive(ArchiveError::TotalSizeExceeded { .. })
        ));
        assert!(!dir.path().join("out").exists());
    }

    #[test]
    fn test_bomb_rejected_before_writing() {
        let dir = tempdir().unwrap();
        let zeros = vec![0u8; 200_000];
        let archive = write_archive(dir.path(), "bomb.zip", &deflated(&[("zeros", &zeros)]));
        let out = dir.path().join("out");

        let err = ArchiveGuard::default().extract(&archive, &out).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::QuotaExceeded);
        assert!(!out.join("zeros").exists());
    }

    #[test]
    fn test_malformed_archive() {
        let dir = tempdir().unwrap();
        let archive = write_archive(dir.path(), "junk.zip", b"PK but not really");

        let err = ArchiveGuard::default()
            .extract(&archive, &dir.path().join("out"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedArchive);
    }

    #[test]
    fn test_nested_destination_uses_stem() {
        let dest = nested_destination(Path::new("/box/out/inner.zip")).unwrap();
        assert_eq!(dest, PathBuf::from("/box/out/inner"));

        assert!(nested_destination(Path::new("/box/out/.zip")).is_err());
    }
}
