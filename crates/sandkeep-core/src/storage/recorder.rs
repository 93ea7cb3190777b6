//! Metadata recording for successful mutations

use super::{queries, Storage};
use crate::error::Result;
use crate::types::{FileMutation, OperationType};
use rusqlite::Connection;
use tracing::debug;

/// Receives every successful file mutation, exactly once.
///
/// Returns the id of the file record the mutation was attributed to, if any.
#[cfg_attr(test, mockall::automock)]
pub trait MetadataRecorder: Send + Sync {
    fn record(&self, mutation: &FileMutation) -> Result<Option<i64>>;
}

/// Recorder that keeps nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NullRecorder;

impl MetadataRecorder for NullRecorder {
    fn record(&self, _mutation: &FileMutation) -> Result<Option<i64>> {
        Ok(None)
    }
}

impl MetadataRecorder for Storage {
    fn record(&self, mutation: &FileMutation) -> Result<Option<i64>> {
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        let file_id = record_mutation(&tx, mutation)?;
        tx.commit()?;
        Ok(file_id)
    }
}

/// Apply one mutation to the file table and operation log on `conn`
pub fn record_mutation(conn: &Connection, mutation: &FileMutation) -> Result<Option<i64>> {
    let existing = queries::find_file_by_location(conn, &mutation.location)?;
    let size = mutation.size.unwrap_or(0);

    let file_id = match (mutation.operation, existing) {
        (OperationType::Create, _) => Some(queries::insert_file(
            conn,
            &mutation.filename,
            &mutation.location,
            size,
            mutation.owner,
        )?),
        (OperationType::Modify, Some(file)) => {
            queries::update_file_size(conn, file.id, size)?;
            Some(file.id)
        }
        // a file written before the store existed
        (OperationType::Modify, None) => Some(queries::insert_file(
            conn,
            &mutation.filename,
            &mutation.location,
            size,
            mutation.owner,
        )?),
        (OperationType::Delete, Some(file)) => {
            queries::mark_file_deleted(conn, file.id)?;
            Some(file.id)
        }
        (OperationType::Delete, None) => None,
    };

    if let Some(id) = file_id {
        queries::insert_operation(conn, mutation.operation, id, mutation.owner)?;
        debug!(
            "Recorded {} of {} (file {})",
            mutation.operation.as_str(),
            mutation.location,
            id
        );
    }

    Ok(file_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn mutation(operation: OperationType, location: &str, size: Option<u64>) -> FileMutation {
        FileMutation {
            operation,
            filename: location.rsplit('/').next().unwrap_or(location).to_string(),
            location: location.to_string(),
            size,
            owner: 3,
        }
    }

    #[test]
    fn test_lifecycle_is_logged() {
        let storage = Storage::in_memory().unwrap();

        let id = storage
            .record(&mutation(OperationType::Create, "docs/a.txt", Some(5)))
            .unwrap()
            .unwrap();
        let same = storage
            .record(&mutation(OperationType::Modify, "docs/a.txt", Some(9)))
            .unwrap();
        assert_eq!(same, Some(id));

        let conn = storage.connection().unwrap();
        assert_eq!(queries::get_file(&conn, id).unwrap().unwrap().size, 9);
        drop(conn);

        storage
            .record(&mutation(OperationType::Delete, "docs/a.txt", None))
            .unwrap();

        let conn = storage.connection().unwrap();
        let ops: Vec<_> = queries::list_file_operations(&conn, id, 10)
            .unwrap()
            .into_iter()
            .map(|o| o.operation)
            .collect();
        assert_eq!(
            ops,
            vec![
                OperationType::Delete,
                OperationType::Modify,
                OperationType::Create
            ]
        );
        assert!(queries::find_file_by_location(&conn, "docs/a.txt")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_delete_of_unknown_file_logs_nothing() {
        let storage = Storage::in_memory().unwrap();

        let id = storage
            .record(&mutation(OperationType::Delete, "ghost.txt", None))
            .unwrap();
        assert_eq!(id, None);

        let conn = storage.connection().unwrap();
        assert!(queries::list_owner_operations(&conn, 3, 10)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_null_recorder() {
        let id = NullRecorder
            .record(&mutation(OperationType::Create, "a", Some(1)))
            .unwrap();
        assert_eq!(id, None);
    }
}
