//! Sandkeep Core Library
//!
//! This crate provides a sandboxed file-operation kernel, including:
//! - Path containment and filename validation
//! - Per-path locking with deadlock-free multi-path acquisition
//! - Atomic writes
//! - Zip bomb and zip slip defences for archive extraction and creation
//! - SQLite-backed file metadata and operation log
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     sandkeep-core                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  sandbox/      - Paths, names, locks, atomic writes, engine │
//! │  archive/      - Archive guard, extraction, creation        │
//! │  storage/      - SQLite database, queries, recorder         │
//! │  types/        - Shared type definitions                    │
//! │  config.rs     - TOML configuration and env overrides       │
//! │  logging.rs    - Tracing subscriber setup                   │
//! │  error.rs      - Error types                                │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod archive;
pub mod config;
pub mod error;
pub mod logging;
pub mod sandbox;
pub mod storage;
pub mod types;

// Re-export commonly used types
pub use error::{Error, ErrorKind, Result};
pub use types::*;

pub use config::Config;

// Re-export sandbox components
pub use sandbox::{
    AtomicWriter, FileOperationEngine, FilenameValidator, LockKey, LockManager, PathResolver,
    ResolvedPath, SandboxRoot,
};

// Re-export archive components
pub use archive::{ArchiveGuard, ArchiveLimits, ArchiveValidationResult};

// Re-export storage
pub use storage::{MetadataRecorder, NullRecorder, Storage};
