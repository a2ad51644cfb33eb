use thiserror::Error;

/// Top-level error type for the ebb-core crate and dependents.
#[derive(Debug, Error)]
pub enum EbbError {
    /// An operation was invoked before `Database::open` completed or after
    /// the engine was closed.
    #[error("engine is not initialized")]
    NotInitialized,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// DDL failure during schema reconciliation; the migration transaction
    /// has been rolled back.
    #[error("schema migration failed: {0}")]
    SchemaMigration(String),

    /// Unique / foreign-key / check violation raised by SQLite.
    #[error("constraint violation on {table}: {source}")]
    Constraint {
        table: String,
        /// `system_id` of the offending row, when known.
        row_id: Option<String>,
        source: rusqlite::Error,
    },

    /// Adapter-level SQLite error; the original error code is preserved.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Unrecoverable failure while applying a server batch, after the
    /// constraint policy has been applied.
    #[error("merge failed: {0}")]
    Merge(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Convenience Result alias used across the workspace.
pub type Result<T> = std::result::Result<T, EbbError>;

impl EbbError {
    /// Classify a rusqlite error raised while writing to `table`: constraint
    /// violations become [`EbbError::Constraint`], everything else surfaces
    /// as [`EbbError::Storage`].
    pub fn from_write(table: &str, row_id: Option<&str>, err: rusqlite::Error) -> Self {
        if is_constraint_violation(&err) {
            EbbError::Constraint {
                table: table.to_string(),
                row_id: row_id.map(|s| s.to_string()),
                source: err,
            }
        } else {
            EbbError::Storage(err)
        }
    }

    pub fn is_constraint(&self) -> bool {
        matches!(self, EbbError::Constraint { .. })
    }
}

/// Return `true` when the underlying SQLite error code is a constraint
/// violation (unique, foreign key, not-null, check).
pub fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}
