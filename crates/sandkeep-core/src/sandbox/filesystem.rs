//! File operations confined to the sandbox root
//!
//! Every operation resolves its paths first, then runs under the lock for
//! each resolved path. Only `list_directory` and `stat` skip locking.
//! Successful mutations that carry an owner are reported to the
//! [`MetadataRecorder`] while the lock is still held.

use super::atomic::AtomicWriter;
use super::filename::FilenameValidator;
use super::lock::{LockKey, LockManager};
use super::path::{is_missing, PathResolver, ResolvedPath, SandboxRoot};
use crate::archive::ArchiveGuard;
use crate::config::Config;
use crate::error::{Error, Result, SandboxError};
use crate::storage::MetadataRecorder;
use crate::types::*;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::fs::Metadata;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::task;
use tracing::{debug, info, warn};

/// The sandboxed operation surface
pub struct FileOperationEngine {
    resolver: PathResolver,
    names: FilenameValidator,
    locks: LockManager,
    archives: ArchiveGuard,
    recorder: Arc<dyn MetadataRecorder>,
    max_file_size: u64,
    max_upload_size: u64,
}

impl FileOperationEngine {
    /// Build an engine over the configured root, creating it if needed
    pub fn new(config: &Config, recorder: Arc<dyn MetadataRecorder>) -> Result<Self> {
        config.validate()?;
        let root = SandboxRoot::create(&config.sandbox.root)?;
        info!("Sandbox root: {:?}", root.path());
        let names = FilenameValidator::new(config.sandbox.max_filename_length);

        Ok(Self {
            resolver: PathResolver::new(root),
            locks: LockManager::new(config.locking.timeout()),
            archives: ArchiveGuard::new(config.archive.limits()).with_names(names.clone()),
            recorder,
            max_file_size: config.sandbox.max_file_size,
            max_upload_size: config.sandbox.max_upload_size,
            names,
        })
    }

    pub fn root(&self) -> &Path {
        self.resolver.root()
    }

    pub fn resolver(&self) -> &PathResolver {
        &self.resolver
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    // ===== Files =====

    /// Create a new file; fails if anything already exists at `path`
    pub async fn create_file(
        &self,
        path: &str,
        owner: OwnerId,
        content: &[u8],
    ) -> Result<FileDescriptor> {
        let target = self.resolve("create_file", path)?;
        let filename = self.validate_names("create_file", &target)?;
        self.check_upload(content.len())?;

        self.locks
            .with_lock(&target.lock_key(), || {
                self.create_file_locked(&target, filename, owner, content)
            })
            .await
    }

    async fn create_file_locked(
        &self,
        target: &ResolvedPath,
        filename: String,
        owner: OwnerId,
        content: &[u8],
    ) -> Result<FileDescriptor> {
        if path_exists(target.canonical()).await? {
            return Err(SandboxError::AlreadyExists(target.location()).into());
        }
        if let Some(parent) = target.canonical().parent() {
            fs::create_dir_all(parent).await?;
        }

        let size = self.replace(target.canonical(), content.to_vec()).await?;
        let id = self
            .record(OperationType::Create, target, &filename, Some(size), owner)
            .await?;

        info!("Created file {} ({} bytes)", target.location(), size);
        Ok(FileDescriptor {
            id,
            filename,
            location: target.location(),
            size,
            owner,
            sha256: sha256_hex(content),
        })
    }

    /// Read a whole file, refusing files above the read ceiling
    pub async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let target = self.resolve("read_file", path)?;

        self.locks
            .with_lock(&target.lock_key(), || self.read_file_locked(&target))
            .await
    }

    async fn read_file_locked(&self, target: &ResolvedPath) -> Result<Vec<u8>> {
        let metadata = file_metadata(target).await?;
        if metadata.len() > self.max_file_size {
            return Err(SandboxError::FileTooLarge {
                path: target.location(),
                size: metadata.len(),
                limit: self.max_file_size,
            }
            .into());
        }

        debug!("Reading file: {}", target.location());
        Ok(fs::read(target.canonical()).await?)
    }

    /// Read a file as UTF-8 text
    pub async fn read_text(&self, path: &str) -> Result<String> {
        let bytes = self.read_file(path).await?;
        String::from_utf8(bytes)
            .map_err(|_| Error::Sandbox(SandboxError::NotUtf8(path.to_string())))
    }

    /// Replace or append to an existing file.
    ///
    /// Appending reads the current content, concatenates, and atomically
    /// replaces the file, so readers never see a partial append.
    pub async fn write_file(
        &self,
        path: &str,
        content: &[u8],
        owner: OwnerId,
        append: bool,
    ) -> Result<FileDescriptor> {
        let target = self.resolve("write_file", path)?;
        self.check_upload(content.len())?;

        self.locks
            .with_lock(&target.lock_key(), || {
                self.write_file_locked(&target, content, owner, append)
            })
            .await
    }

    async fn write_file_locked(
        &self,
        target: &ResolvedPath,
        content: &[u8],
        owner: OwnerId,
        append: bool,
    ) -> Result<FileDescriptor> {
        let metadata = file_metadata(target).await?;

        let new_content = if append {
            let combined = metadata.len() + content.len() as u64;
            if combined > self.max_file_size {
                return Err(SandboxError::ContentTooLarge {
                    size: combined,
                    limit: self.max_file_size,
                }
                .into());
            }
            let mut existing = fs::read(target.canonical()).await?;
            existing.extend_from_slice(content);
            existing
        } else {
            content.to_vec()
        };

        let sha256 = sha256_hex(&new_content);
        let size = self.replace(target.canonical(), new_content).await?;
        let filename = target.file_name().unwrap_or_else(|| target.location());
        let id = self
            .record(OperationType::Modify, target, &filename, Some(size), owner)
            .await?;

        info!(
            "{} {} ({} bytes)",
            if append { "Appended to" } else { "Wrote" },
            target.location(),
            size
        );
        Ok(FileDescriptor {
            id,
            filename,
            location: target.location(),
            size,
            owner,
            sha256,
        })
    }

    /// Delete a regular file
    pub async fn delete_file(&self, path: &str, owner: OwnerId) -> Result<()> {
        let target = self.resolve("delete_file", path)?;
        self.refuse_root("delete_file", &target)?;

        self.locks
            .with_lock(&target.lock_key(), || self.delete_file_locked(&target, owner))
            .await
    }

    async fn delete_file_locked(&self, target: &ResolvedPath, owner: OwnerId) -> Result<()> {
        file_metadata(target).await?;
        fs::remove_file(target.canonical()).await?;

        let filename = target.file_name().unwrap_or_else(|| target.location());
        self.record(OperationType::Delete, target, &filename, None, owner)
            .await?;

        info!("Deleted file {}", target.location());
        Ok(())
    }

    // ===== Directories =====

    /// Create a directory and any missing parents
    pub async fn create_directory(&self, path: &str) -> Result<()> {
        let target = self.resolve("create_directory", path)?;
        self.validate_names("create_directory", &target)?;

        self.locks
            .with_lock(&target.lock_key(), || self.create_directory_locked(&target))
            .await
    }

    async fn create_directory_locked(&self, target: &ResolvedPath) -> Result<()> {
        if path_exists(target.canonical()).await? {
            return Err(SandboxError::AlreadyExists(target.location()).into());
        }
        fs::create_dir_all(target.canonical()).await?;
        info!("Created directory {}", target.location());
        Ok(())
    }

    /// Delete a directory; without `recursive` it must be empty
    pub async fn delete_directory(&self, path: &str, recursive: bool) -> Result<()> {
        let target = self.resolve("delete_directory", path)?;
        self.refuse_root("delete_directory", &target)?;

        self.locks
            .with_lock(&target.lock_key(), || {
                self.delete_directory_locked(&target, recursive)
            })
            .await
    }

    async fn delete_directory_locked(&self, target: &ResolvedPath, recursive: bool) -> Result<()> {
        directory_metadata(target).await?;

        if recursive {
            fs::remove_dir_all(target.canonical()).await?;
        } else {
            let mut children = fs::read_dir(target.canonical()).await?;
            if children.next_entry().await?.is_some() {
                return Err(SandboxError::DirectoryNotEmpty(target.location()).into());
            }
            fs::remove_dir(target.canonical()).await?;
        }

        info!(
            "Deleted directory {}{}",
            target.location(),
            if recursive { " recursively" } else { "" }
        );
        Ok(())
    }

    // ===== Move =====

    /// Move a file or directory; the destination must not exist
    pub async fn move_path(&self, source: &str, destination: &str) -> Result<()> {
        let from = self.resolve("move", source)?;
        let to = self.resolve("move", destination)?;
        self.refuse_root("move", &from)?;
        self.validate_names("move", &to)?;

        // both paths under one ordered acquisition
        self.locks
            .with_locks(&[from.lock_key(), to.lock_key()], || {
                self.move_locked(&from, &to)
            })
            .await
    }

    async fn move_locked(&self, from: &ResolvedPath, to: &ResolvedPath) -> Result<()> {
        if !path_exists(from.canonical()).await? {
            return Err(SandboxError::FileNotFound(from.location()).into());
        }
        if path_exists(to.canonical()).await? {
            return Err(SandboxError::AlreadyExists(to.location()).into());
        }
        if to.canonical().starts_with(from.canonical()) {
            return Err(SandboxError::InvalidName {
                name: to.location(),
                reason: "cannot move a directory into itself".to_string(),
            }
            .into());
        }

        if let Some(parent) = to.canonical().parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(from.canonical(), to.canonical()).await?;

        info!("Moved {} to {}", from.location(), to.location());
        Ok(())
    }

    // ===== Listing =====

    /// List a directory: directories first, then files, each by name.
    ///
    /// Takes no lock; the result is a point-in-time snapshot. Entries that
    /// vanish mid-listing, and symlinks leading out of the sandbox, are
    /// left out.
    pub async fn list_directory(&self, path: &str) -> Result<Vec<ListEntry>> {
        let target = self.resolve("list_directory", path)?;
        directory_metadata(&target).await?;

        debug!("Listing directory: {}", target.location());

        let mut entries = Vec::new();
        let mut read_dir = fs::read_dir(target.canonical()).await?;

        while let Some(entry) = read_dir.next_entry().await? {
            let entry_path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();

            let metadata = match self.entry_metadata(&entry_path).await {
                Some(metadata) => metadata,
                None => {
                    debug!("Skipping unlistable entry {:?}", entry_path);
                    continue;
                }
            };

            entries.push(list_entry(name, &entry_path, &metadata));
        }

        entries.sort_by(ListEntry::listing_order);
        Ok(entries)
    }

    /// Metadata for a single path
    pub async fn stat(&self, path: &str) -> Result<ListEntry> {
        let target = self.resolve("stat", path)?;

        let metadata = fs::metadata(target.canonical())
            .await
            .map_err(|e| {
            missing_or(e, target.canonical(), || {
                SandboxError::FileNotFound(target.location())
            })
        })?;

        let name = if target.is_root() {
            ".".to_string()
        } else {
            target.file_name().unwrap_or_else(|| target.location())
        };
        Ok(list_entry(name, target.canonical(), &metadata))
    }

    async fn entry_metadata(&self, entry_path: &Path) -> Option<Metadata> {
        let metadata = fs::symlink_metadata(entry_path).await.ok()?;
        if !metadata.file_type().is_symlink() {
            return Some(metadata);
        }

        let resolved = self.resolver.resolve_absolute(entry_path).ok()?;
        fs::metadata(resolved.canonical()).await.ok()
    }

    // ===== Archives =====

    /// Pack `sources` into a new zip archive at `destination`
    pub async fn create_archive(
        &self,
        destination: &str,
        sources: &[&str],
        owner: OwnerId,
    ) -> Result<PathBuf> {
        let target = self.resolve("create_archive", destination)?;
        let filename = self.validate_names("create_archive", &target)?;
        let sources = sources
            .iter()
            .map(|source| self.resolve("create_archive", source))
            .collect::<Result<Vec<_>>>()?;

        let mut keys: Vec<LockKey> = sources.iter().map(ResolvedPath::lock_key).collect();
        keys.push(target.lock_key());

        self.locks
            .with_locks(&keys, || {
                self.create_archive_locked(&target, filename, &sources, owner)
            })
            .await
    }

    async fn create_archive_locked(
        &self,
        target: &ResolvedPath,
        filename: String,
        sources: &[ResolvedPath],
        owner: OwnerId,
    ) -> Result<PathBuf> {
        if path_exists(target.canonical()).await? {
            return Err(SandboxError::AlreadyExists(target.location()).into());
        }
        if let Some(parent) = target.canonical().parent() {
            fs::create_dir_all(parent).await?;
        }

        let guard = self.archives.clone();
        let paths: Vec<PathBuf> = sources.iter().map(|s| s.canonical().to_path_buf()).collect();
        let destination = target.canonical().to_path_buf();
        let totals = task::spawn_blocking(move || guard.create(&paths, &destination)).await??;

        let size = fs::metadata(target.canonical()).await?.len();
        self.record(OperationType::Create, target, &filename, Some(size), owner)
            .await?;

        info!(
            "Created archive {} from {} files",
            target.location(),
            totals.file_count
        );
        Ok(target.canonical().to_path_buf())
    }

    /// Extract an archive into `destination`, returning the files written
    pub async fn extract_archive(&self, archive: &str, destination: &str) -> Result<Vec<PathBuf>> {
        let source = self.resolve("extract_archive", archive)?;
        let target = self.resolve("extract_archive", destination)?;

        self.locks
            .with_locks(&[source.lock_key(), target.lock_key()], || {
                self.extract_archive_locked(&source, &target)
            })
            .await
            .map_err(|e| security_event("extract_archive", archive, e))
    }

    async fn extract_archive_locked(
        &self,
        source: &ResolvedPath,
        target: &ResolvedPath,
    ) -> Result<Vec<PathBuf>> {
        file_metadata(source).await?;

        let guard = self.archives.clone();
        let archive = source.canonical().to_path_buf();
        let destination = target.canonical().to_path_buf();
        let files = task::spawn_blocking(move || guard.extract(&archive, &destination)).await??;

        info!(
            "Extracted {} into {} ({} files)",
            source.location(),
            target.location(),
            files.len()
        );
        Ok(files)
    }

    // ===== Helpers =====

    fn resolve(&self, operation: &'static str, path: &str) -> Result<ResolvedPath> {
        self.resolver
            .resolve(path)
            .map_err(|e| security_event(operation, path, e))
    }

    fn refuse_root(&self, operation: &'static str, target: &ResolvedPath) -> Result<()> {
        if target.is_root() {
            let err = SandboxError::SandboxRoot(target.requested().to_string()).into();
            return Err(security_event(operation, target.requested(), err));
        }
        Ok(())
    }

    /// Validate every component of a path about to be created, returning the
    /// final one
    fn validate_names(&self, operation: &'static str, target: &ResolvedPath) -> Result<String> {
        let mut last = None;
        for component in target.sandbox_relative().components() {
            let name = component.as_os_str().to_string_lossy();
            self.names.validate(&name)?;
            last = Some(name.into_owned());
        }

        match last {
            Some(name) => Ok(name),
            None => {
                let err = SandboxError::SandboxRoot(target.requested().to_string()).into();
                Err(security_event(operation, target.requested(), err))
            }
        }
    }

    fn check_upload(&self, size: usize) -> Result<()> {
        let size = size as u64;
        if size > self.max_upload_size {
            return Err(SandboxError::ContentTooLarge {
                size,
                limit: self.max_upload_size,
            }
            .into());
        }
        Ok(())
    }

    async fn replace(&self, target: &Path, content: Vec<u8>) -> Result<u64> {
        let target = target.to_path_buf();
        task::spawn_blocking(move || AtomicWriter::replace(&target, &content)).await?
    }

    async fn record(
        &self,
        operation: OperationType,
        target: &ResolvedPath,
        filename: &str,
        size: Option<u64>,
        owner: OwnerId,
    ) -> Result<Option<i64>> {
        let mutation = FileMutation {
            operation,
            filename: filename.to_string(),
            location: target.location(),
            size,
            owner,
        };
        let recorder = Arc::clone(&self.recorder);
        task::spawn_blocking(move || recorder.record(&mutation)).await?
    }
}

fn security_event(operation: &str, requested: &str, err: Error) -> Error {
    if err.is_security_violation() {
        warn!(
            target: "sandkeep::security",
            operation,
            requested,
            "Security violation: {}",
            err
        );
    }
    err
}

fn missing_or(e: io::Error, path: &Path, missing: impl FnOnce() -> SandboxError) -> Error {
    if is_missing(&e, path) {
        Error::Sandbox(missing())
    } else {
        Error::Io(e)
    }
}

async fn path_exists(path: &Path) -> Result<bool> {
    match fs::symlink_metadata(path).await {
        Ok(_) => Ok(true),
        Err(e) if is_missing(&e, path) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Metadata of an existing regular file, `NotFound` otherwise
async fn file_metadata(target: &ResolvedPath) -> Result<Metadata> {
    let metadata = fs::metadata(target.canonical())
        .await
        .map_err(|e| {
            missing_or(e, target.canonical(), || {
                SandboxError::FileNotFound(target.location())
            })
        })?;
    if !metadata.is_file() {
        return Err(SandboxError::FileNotFound(format!("{} is not a file", target.location())).into());
    }
    Ok(metadata)
}

/// Metadata of an existing directory, `NotFound` otherwise
async fn directory_metadata(target: &ResolvedPath) -> Result<Metadata> {
    let metadata = fs::metadata(target.canonical())
        .await
        .map_err(|e| {
            missing_or(e, target.canonical(), || {
                SandboxError::DirectoryNotFound(target.location())
            })
        })?;
    if !metadata.is_dir() {
        return Err(SandboxError::DirectoryNotFound(format!(
            "{} is not a directory",
            target.location()
        ))
        .into());
    }
    Ok(metadata)
}

fn list_entry(name: String, path: &Path, metadata: &Metadata) -> ListEntry {
    let is_dir = metadata.is_dir();
    ListEntry {
        name,
        kind: if is_dir {
            EntryKind::Directory
        } else {
            EntryKind::File
        },
        size: if is_dir { None } else { Some(metadata.len()) },
        modified: metadata.modified().ok().map(DateTime::<Utc>::from),
        mime_type: if is_dir {
            None
        } else {
            Some(mime_guess::from_path(path).first_or_octet_stream().to_string())
        },
    }
}

fn sha256_hex(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}
