//! Database error types.

use thiserror::Error;

/// Database operation errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// Failed to open the database file.
    #[error("failed to open database at {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: rusqlite::Error,
    },

    /// Failed to execute a statement.
    #[error("query failed: {0}")]
    Query(#[from] rusqlite::Error),

    /// A stored row could not be decoded.
    #[error("corrupt row in {table}: {message}")]
    Corrupt { table: &'static str, message: String },

    /// A history entry did not follow the last stored sequence number.
    #[error("sequence conflict for {allocation_id}: expected {expected}, got {actual}")]
    SequenceConflict {
        allocation_id: String,
        expected: u64,
        actual: u64,
    },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
