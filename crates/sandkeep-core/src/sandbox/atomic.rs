//! Staging-file + rename content replacement
//!
//! Content is written to a sibling staging file, flushed, then renamed over
//! the target. Readers see either the old or the new file, never a partial
//! one. On failure the staging file is removed and the target is untouched.

use crate::error::{Result, SandboxError};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::debug;

/// Longest target-name prefix carried into a staging file name, leaving room
/// for the random part and suffix within common 255-byte name limits
const STAGING_PREFIX_MAX: usize = 200;

pub struct AtomicWriter;

impl AtomicWriter {
    /// Replace `target` with `content`, returning the new size
    pub fn replace(target: &Path, content: &[u8]) -> Result<u64> {
        Self::replace_with(target, |file| file.write_all(content))
    }

    /// Replace `target` with whatever `write` puts into the staging file.
    ///
    /// The staging file is deleted when dropped, so every early return
    /// leaves nothing behind.
    pub fn replace_with<F>(target: &Path, write: F) -> Result<u64>
    where
        F: FnOnce(&mut File) -> io::Result<()>,
    {
        let mut staging = Self::staging_file(target)?;
        debug!("Staging {:?} via {:?}", target, staging.path());

        if let Ok(existing) = fs::metadata(target) {
            staging.as_file().set_permissions(existing.permissions())?;
        }

        write(staging.as_file_mut())?;
        staging.as_file_mut().flush()?;
        staging.as_file().sync_all()?;
        let size = staging.as_file().metadata()?.len();

        staging.persist(target).map_err(|e| e.error)?;
        sync_parent(target);
        Ok(size)
    }

    /// Create the sibling staging file used while `target` is written
    pub fn staging_file(target: &Path) -> Result<NamedTempFile> {
        let name = target.file_name().ok_or_else(|| SandboxError::InvalidName {
            name: target.to_string_lossy().to_string(),
            reason: "path has no file name".to_string(),
        })?;
        let parent = match target.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };

        let name = name.to_string_lossy();
        let mut cut = name.len().min(STAGING_PREFIX_MAX);
        while !name.is_char_boundary(cut) {
            cut -= 1;
        }
        let prefix = format!("{}.", &name[..cut]);

        Ok(tempfile::Builder::new()
            .prefix(&prefix)
            .suffix(".tmp")
            .tempfile_in(parent)?)
    }
}

/// Persist the rename itself; best effort
fn sync_parent(target: &Path) {
    if !cfg!(unix) {
        return;
    }
    if let Some(parent) = target.parent() {
        if let Err(e) = File::open(parent).and_then(|dir| dir.sync_all()) {
            debug!("Could not sync directory {:?}: {}", parent, e);
        }
    }
}
