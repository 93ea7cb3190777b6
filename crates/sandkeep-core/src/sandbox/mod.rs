//! File system sandbox
//!
//! This module provides:
//! - Canonical path resolution confined to the sandbox root
//! - Filename validation
//! - Per-path locking with ordered multi-path acquisition
//! - Atomic file replacement
//! - The file operation engine tying them together

mod atomic;
mod filename;
mod filesystem;
mod lock;
pub(crate) mod path;

pub use atomic::AtomicWriter;
pub use filename::FilenameValidator;
pub use filesystem::FileOperationEngine;
pub use lock::{LockKey, LockManager, LockSet};
pub use path::{PathResolver, ResolvedPath, SandboxRoot};
