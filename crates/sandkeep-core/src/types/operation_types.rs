//! Mutation and audit log types

use super::OwnerId;
use serde::{Deserialize, Serialize};

/// Kind of mutation recorded in the operation log
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Create,
    Modify,
    Delete,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Modify => "modify",
            Self::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(Self::Create),
            "modify" => Some(Self::Modify),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

/// A successful mutation handed to the metadata store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMutation {
    pub operation: OperationType,
    pub filename: String,
    pub location: String,
    /// Size after the mutation; `None` for deletes
    pub size: Option<u64>,
    pub owner: OwnerId,
}

/// Persisted file record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub id: i64,
    pub filename: String,
    pub location: String,
    pub size: u64,
    pub owner: OwnerId,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Persisted operation log row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationRecord {
    pub id: i64,
    pub operation: OperationType,
    pub file_id: i64,
    pub owner: OwnerId,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}
