//! Database query implementations

use crate::error::Result;
use crate::types::*;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};

// ===== File Queries =====

/// Insert a new file row, returning its id
pub fn insert_file(
    conn: &Connection,
    filename: &str,
    location: &str,
    size: u64,
    owner: OwnerId,
) -> Result<i64> {
    conn.execute(
        r#"
        INSERT INTO files (filename, location, size, owner, created_at)
        VALUES (?, ?, ?, ?, ?)
        "#,
        params![
            filename,
            location,
            size as i64,
            owner,
            Utc::now().to_rfc3339(),
        ],
    )?;

    Ok(conn.last_insert_rowid())
}

/// Update the recorded size of a file
pub fn update_file_size(conn: &Connection, file_id: i64, size: u64) -> Result<()> {
    conn.execute(
        "UPDATE files SET size = ? WHERE id = ?",
        params![size as i64, file_id],
    )?;
    Ok(())
}

/// Mark a file as deleted; its operations stay queryable
pub fn mark_file_deleted(conn: &Connection, file_id: i64) -> Result<()> {
    conn.execute(
        "UPDATE files SET deleted_at = ? WHERE id = ?",
        params![Utc::now().to_rfc3339(), file_id],
    )?;
    Ok(())
}

/// Live file currently recorded at a sandbox-relative location
pub fn find_file_by_location(conn: &Connection, location: &str) -> Result<Option<FileRecord>> {
    let result = conn
        .query_row(
            r#"
            SELECT id, filename, location, size, owner, created_at
            FROM files
            WHERE location = ? AND deleted_at IS NULL
            ORDER BY id DESC
            LIMIT 1
            "#,
            params![location],
            file_from_row,
        )
        .optional()?;

    Ok(result)
}

/// Get file by ID, deleted or not
pub fn get_file(conn: &Connection, file_id: i64) -> Result<Option<FileRecord>> {
    let result = conn
        .query_row(
            r#"
            SELECT id, filename, location, size, owner, created_at
            FROM files
            WHERE id = ?
            "#,
            params![file_id],
            file_from_row,
        )
        .optional()?;

    Ok(result)
}

// ===== Operation Queries =====

/// Append an operation to the log
pub fn insert_operation(
    conn: &Connection,
    operation: OperationType,
    file_id: i64,
    owner: OwnerId,
) -> Result<i64> {
    conn.execute(
        r#"
        INSERT INTO operations (operation, file_id, owner, timestamp)
        VALUES (?, ?, ?, ?)
        "#,
        params![operation.as_str(), file_id, owner, Utc::now().to_rfc3339()],
    )?;

    Ok(conn.last_insert_rowid())
}

/// Operations performed by an owner, newest first
pub fn list_owner_operations(
    conn: &Connection,
    owner: OwnerId,
    limit: usize,
) -> Result<Vec<OperationRecord>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT id, operation, file_id, owner, timestamp
        FROM operations
        WHERE owner = ?
        ORDER BY id DESC
        LIMIT ?
        "#,
    )?;

    let operations = stmt
        .query_map(params![owner, limit as i64], operation_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(operations)
}

/// Operations on one file, newest first
pub fn list_file_operations(
    conn: &Connection,
    file_id: i64,
    limit: usize,
) -> Result<Vec<OperationRecord>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT id, operation, file_id, owner, timestamp
        FROM operations
        WHERE file_id = ?
        ORDER BY id DESC
        LIMIT ?
        "#,
    )?;

    let operations = stmt
        .query_map(params![file_id, limit as i64], operation_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(operations)
}

// ===== Helper Functions =====

fn file_from_row(row: &Row<'_>) -> rusqlite::Result<FileRecord> {
    Ok(FileRecord {
        id: row.get(0)?,
        filename: row.get(1)?,
        location: row.get(2)?,
        size: row.get::<_, i64>(3)?.max(0) as u64,
        owner: row.get(4)?,
        created_at: parse_timestamp(5, &row.get::<_, String>(5)?)?,
    })
}

fn operation_from_row(row: &Row<'_>) -> rusqlite::Result<OperationRecord> {
    let raw: String = row.get(1)?;
    let operation = OperationType::parse(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            Type::Text,
            format!("unknown operation type: {}", raw).into(),
        )
    })?;

    Ok(OperationRecord {
        id: row.get(0)?,
        operation,
        file_id: row.get(2)?,
        owner: row.get(3)?,
        timestamp: parse_timestamp(4, &row.get::<_, String>(4)?)?,
    })
}

fn parse_timestamp(column: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(e)))
}
