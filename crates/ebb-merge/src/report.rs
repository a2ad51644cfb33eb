use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// ConstraintPolicy
// ---------------------------------------------------------------------------

/// What `bulk_load` does when a server row violates a local constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintPolicy {
    /// Propagate the violation; the whole batch rolls back.
    #[default]
    Throw,
    /// Count the row as skipped and keep applying the rest of the batch.
    Skip,
}

// ---------------------------------------------------------------------------
// MergeWarning / BulkLoadReport
// ---------------------------------------------------------------------------

/// A non-fatal problem encountered while applying one server row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeWarning {
    /// `system_id` of the offending row, when the row carried one.
    pub row_id: Option<String>,
    pub message: String,
}

impl MergeWarning {
    pub fn new(row_id: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            row_id: row_id.map(|s| s.to_string()),
            message: message.into(),
        }
    }
}

/// Outcome of one `bulk_load` batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BulkLoadReport {
    /// Rows that did not exist locally and were inserted.
    pub inserted: usize,
    /// Rows where at least one column survived the per-column LWW filter.
    pub updated: usize,
    /// Rows where every incoming column lost (or matched) the local state.
    pub unchanged: usize,
    /// Server tombstones applied as local deletes.
    pub deleted: usize,
    /// Rows dropped under [`ConstraintPolicy::Skip`] or for missing ids.
    pub skipped: usize,
    pub warnings: Vec<MergeWarning>,
}

impl BulkLoadReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows that mutated local state.
    pub fn changed(&self) -> usize {
        self.inserted + self.updated + self.deleted
    }

    pub fn warn(&mut self, row_id: Option<&str>, message: impl Into<String>) {
        self.warnings.push(MergeWarning::new(row_id, message));
    }
}
