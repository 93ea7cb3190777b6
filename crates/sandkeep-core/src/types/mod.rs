//! Core type definitions for Sandkeep
//!
//! Shared value types returned by the operation engine and persisted by the
//! metadata store.

mod file_types;
mod operation_types;

pub use file_types::*;
pub use operation_types::*;

/// Authenticated owner identifier supplied by the identity collaborator
pub type OwnerId = i64;
