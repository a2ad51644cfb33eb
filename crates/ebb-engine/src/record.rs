use ebb_core::schema::SYSTEM_ID;
use ebb_core::value::{Row, Value};

// ---------------------------------------------------------------------------
// FromValue
// ---------------------------------------------------------------------------

/// Typed extraction from a dynamic [`Value`] cell.
pub trait FromValue: Sized {
    fn from_value(value: &Value) -> Option<Self>;
}

impl FromValue for String {
    fn from_value(value: &Value) -> Option<Self> {
        value.as_text().map(str::to_string)
    }
}

impl FromValue for i64 {
    fn from_value(value: &Value) -> Option<Self> {
        value.as_integer()
    }
}

impl FromValue for f64 {
    fn from_value(value: &Value) -> Option<Self> {
        value.as_real()
    }
}

impl FromValue for bool {
    fn from_value(value: &Value) -> Option<Self> {
        value.as_integer().map(|i| i != 0)
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: &Value) -> Option<Self> {
        value.as_blob().map(|b| b.to_vec())
    }
}

impl FromValue for Value {
    fn from_value(value: &Value) -> Option<Self> {
        Some(value.clone())
    }
}

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// Application-facing view of one row.
///
/// A record carries its current field values plus an immutable snapshot of
/// the fields as they were when the record was read. `save` on the engine
/// diffs the two to issue the smallest possible UPDATE; a record without a
/// `system_id` routes to insert instead.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    table: String,
    fields: Row,
    snapshot: Row,
}

impl Record {
    /// A fresh, unsaved record for `table`.
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            fields: Row::new(),
            snapshot: Row::new(),
        }
    }

    /// A record hydrated from a queried row; the snapshot is the row as
    /// read.
    pub fn hydrated(table: impl Into<String>, fields: Row) -> Self {
        let snapshot = fields.clone();
        Self {
            table: table.into(),
            fields,
            snapshot,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn fields(&self) -> &Row {
        &self.fields
    }

    pub fn system_id(&self) -> Option<&str> {
        self.fields
            .get(SYSTEM_ID)
            .and_then(|v| v.as_text())
            .filter(|s| !s.is_empty())
    }

    /// `true` when the record has never been persisted.
    pub fn is_new(&self) -> bool {
        self.system_id().is_none()
    }

    pub fn value(&self, column: &str) -> Option<&Value> {
        self.fields.get(column)
    }

    pub fn get<T: FromValue>(&self, column: &str) -> Option<T> {
        self.fields.get(column).and_then(T::from_value)
    }

    pub fn set(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(column.into(), value.into());
    }

    /// Columns whose current value differs from the snapshot.
    pub fn changed_columns(&self) -> Row {
        self.fields
            .iter()
            .filter(|(name, value)| self.snapshot.get(*name) != Some(value))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }

    /// Replace the record's contents with a freshly-read row, resetting the
    /// snapshot. Called by the engine after a successful save.
    pub(crate) fn reload(&mut self, fields: Row) {
        self.snapshot = fields.clone();
        self.fields = fields;
    }
}
