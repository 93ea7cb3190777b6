//! Archive creation with pre-flight accounting

use super::{ArchiveGuard, ArchiveValidationResult};
use crate::error::{ArchiveError, Error, Result, SandboxError};
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

/// One file scheduled for inclusion
#[derive(Debug, Clone)]
struct PlannedFile {
    source: PathBuf,
    name: String,
    size: u64,
}

impl ArchiveGuard {
    /// Pack `sources` into a new zip at `destination`.
    ///
    /// Sources are walked and counted against the limits before anything is
    /// written. Symlinks inside directories are skipped, as is the
    /// destination itself. A partially written destination is deleted.
    pub fn create(&self, sources: &[PathBuf], destination: &Path) -> Result<ArchiveValidationResult> {
        let (plan, totals) = self.plan(sources, destination)?;

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(destination)
            .map_err(|e| {
                if e.kind() == io::ErrorKind::AlreadyExists {
                    Error::Sandbox(SandboxError::AlreadyExists(
                        destination.to_string_lossy().to_string(),
                    ))
                } else {
                    Error::Io(e)
                }
            })?;

        match write_archive(file, &plan) {
            Ok(()) => {
                info!(
                    "Created archive {:?}: {} files, {} bytes",
                    destination, totals.file_count, totals.total_uncompressed
                );
                Ok(totals)
            }
            Err(e) => {
                warn!("Archive creation failed, removing {:?}: {}", destination, e);
                if let Err(cleanup) = fs::remove_file(destination) {
                    warn!("Failed to remove partial archive {:?}: {}", destination, cleanup);
                }
                Err(e)
            }
        }
    }

    fn plan(
        &self,
        sources: &[PathBuf],
        destination: &Path,
    ) -> Result<(Vec<PlannedFile>, ArchiveValidationResult)> {
        let limits = self.limits();
        let mut totals = ArchiveValidationResult::default();
        let mut plan = Vec::new();
        let mut names = HashSet::new();

        let mut schedule = |source: &Path, name: String, size: u64| -> Result<()> {
            totals.file_count += 1;
            if totals.file_count > limits.max_files {
                return Err(ArchiveError::TooManyEntries {
                    limit: limits.max_files,
                }
                .into());
            }
            totals.total_uncompressed = totals.total_uncompressed.saturating_add(size);
            if totals.total_uncompressed > limits.max_total_size {
                return Err(ArchiveError::TotalSizeExceeded {
                    limit: limits.max_total_size,
                }
                .into());
            }
            if !names.insert(name.clone()) {
                return Err(SandboxError::AlreadyExists(name).into());
            }
            plan.push(PlannedFile {
                source: source.to_path_buf(),
                name,
                size,
            });
            Ok(())
        };

        for source in sources {
            let metadata = fs::metadata(source).map_err(|e| {
                if e.kind() == io::ErrorKind::NotFound {
                    Error::Archive(ArchiveError::SourceNotFound(
                        source.to_string_lossy().to_string(),
                    ))
                } else {
                    Error::Io(e)
                }
            })?;

            if metadata.is_file() {
                if source == destination {
                    continue;
                }
                let name = source
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .ok_or_else(|| {
                        ArchiveError::SourceNotFound(source.to_string_lossy().to_string())
                    })?;
                schedule(source, name, metadata.len())?;
                continue;
            }

            let base = source.parent().unwrap_or(source);
            for entry in WalkDir::new(source).follow_links(false).sort_by_file_name() {
                let entry = entry.map_err(walk_error)?;
                if !entry.file_type().is_file() || entry.path() == destination {
                    continue;
                }
                let relative = entry.path().strip_prefix(base).unwrap_or(entry.path());
                let name = archive_name(relative);
                let size = entry.metadata().map_err(walk_error)?.len();
                schedule(entry.path(), name, size)?;
            }
        }

        debug!(
            "Archive plan: {} files, {} bytes",
            totals.file_count, totals.total_uncompressed
        );
        Ok((plan, totals))
    }
}

fn write_archive(file: File, plan: &[PlannedFile]) -> Result<()> {
    let mut zip = ZipWriter::new(file);

    for planned in plan {
        let options = FileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .large_file(planned.size >= u64::from(u32::MAX));
        zip.start_file(planned.name.as_str(), options)?;

        // never copy more than was accounted for
        let mut source = File::open(&planned.source)?.take(planned.size);
        io::copy(&mut source, &mut zip)?;
    }

    let file = zip.finish()?;
    file.sync_all()?;
    Ok(())
}

/// Entry name with `/` separators regardless of platform
fn archive_name(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn walk_error(err: walkdir::Error) -> Error {
    let message = err.to_string();
    Error::Io(
        err.into_io_error()
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, message)),
    )
}
