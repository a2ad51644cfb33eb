use serde::{Deserialize, Serialize};

use crate::error::{EbbError, Result};
use crate::value::Value;

// ---------------------------------------------------------------------------
// System column names
// ---------------------------------------------------------------------------

/// GUID string; canonical row identity across nodes. Generated on local
/// insert when absent, unique and indexed on every table.
pub const SYSTEM_ID: &str = "system_id";
/// HLC string of the first insert.
pub const SYSTEM_CREATED_AT: &str = "system_created_at";
/// HLC string of the latest mutation.
pub const SYSTEM_VERSION: &str = "system_version";
/// 1 when the row was first written locally, 0 when it arrived from the
/// server.
pub const SYSTEM_IS_LOCAL_ORIGIN: &str = "system_is_local_origin";
/// Wire-level key marking an incoming server row as a deletion.
pub const SYSTEM_TOMBSTONE: &str = "system_tombstone";

/// Suffix of the per-LWW-column shadow holding the HLC of the last accepted
/// write.
pub const HLC_SHADOW_SUFFIX: &str = "__hlc";

pub fn system_columns() -> [&'static str; 4] {
    [
        SYSTEM_ID,
        SYSTEM_CREATED_AT,
        SYSTEM_VERSION,
        SYSTEM_IS_LOCAL_ORIGIN,
    ]
}

pub fn is_system_column(name: &str) -> bool {
    matches!(
        name,
        SYSTEM_ID | SYSTEM_CREATED_AT | SYSTEM_VERSION | SYSTEM_IS_LOCAL_ORIGIN
    )
}

/// `name` → `name__hlc`.
pub fn shadow_column(name: &str) -> String {
    format!("{name}{HLC_SHADOW_SUFFIX}")
}

pub fn is_shadow_column(name: &str) -> bool {
    name.ends_with(HLC_SHADOW_SUFFIX)
}

/// Inverse of [`shadow_column`]: `name__hlc` → `name`.
pub fn shadowed_column(name: &str) -> Option<&str> {
    name.strip_suffix(HLC_SHADOW_SUFFIX)
}

// ---------------------------------------------------------------------------
// ColumnType
// ---------------------------------------------------------------------------

/// Logical column type. Guid, Date, and FileSet are stored as TEXT; the
/// distinction matters to hosts and code generators, not to SQLite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Text,
    Integer,
    Real,
    Guid,
    Date,
    Blob,
    FileSet,
}

impl ColumnType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::Text => "text",
            ColumnType::Integer => "integer",
            ColumnType::Real => "real",
            ColumnType::Guid => "guid",
            ColumnType::Date => "date",
            ColumnType::Blob => "blob",
            ColumnType::FileSet => "fileset",
        }
    }

    /// SQLite storage type used in DDL.
    pub fn sql_type(&self) -> &'static str {
        match self {
            ColumnType::Text | ColumnType::Guid | ColumnType::Date | ColumnType::FileSet => "TEXT",
            ColumnType::Integer => "INTEGER",
            ColumnType::Real => "REAL",
            ColumnType::Blob => "BLOB",
        }
    }

    /// `true` when values of this type are stored as TEXT and therefore
    /// subject to `max_length` enforcement.
    pub fn is_textual(&self) -> bool {
        matches!(self.sql_type(), "TEXT")
    }
}

// ---------------------------------------------------------------------------
// ColumnDef
// ---------------------------------------------------------------------------

/// A single declared column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub col_type: ColumnType,
    pub not_null: bool,
    pub default: Option<Value>,
    /// Last-write-wins column: the migrator synthesizes a `<name>__hlc`
    /// shadow and the merge engine resolves concurrent writes per column.
    pub is_lww: bool,
    /// References the `system_id` of a row in another table.
    pub is_parent: bool,
    pub max_length: Option<u32>,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, col_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            col_type,
            not_null: false,
            default: None,
            is_lww: false,
            is_parent: false,
            max_length: None,
        }
    }

    pub fn text(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Text)
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Integer)
    }

    pub fn real(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Real)
    }

    pub fn guid(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Guid)
    }

    pub fn date(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Date)
    }

    pub fn blob(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Blob)
    }

    pub fn fileset(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::FileSet)
    }

    pub fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }

    pub fn lww(mut self) -> Self {
        self.is_lww = true;
        self
    }

    pub fn parent(mut self) -> Self {
        self.is_parent = true;
        self
    }

    pub fn default_value(mut self, v: impl Into<Value>) -> Self {
        self.default = Some(v.into());
        self
    }

    pub fn max_length(mut self, n: u32) -> Self {
        self.max_length = Some(n);
        self
    }

    /// Name of this column's HLC shadow, when it has one.
    pub fn shadow_name(&self) -> Option<String> {
        self.is_lww.then(|| shadow_column(&self.name))
    }
}

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyKind {
    Primary,
    Unique,
    Index,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    pub fn as_sql(&self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyColumn {
    pub name: String,
    pub order: SortOrder,
}

impl KeyColumn {
    pub fn asc(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            order: SortOrder::Asc,
        }
    }

    pub fn desc(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            order: SortOrder::Desc,
        }
    }
}

/// A declared key. Primary keys render inline in CREATE TABLE; unique keys
/// and plain indices become named indices, identified by the declared name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyDef {
    pub name: String,
    pub kind: KeyKind,
    pub columns: Vec<KeyColumn>,
}

impl KeyDef {
    pub fn new(name: impl Into<String>, kind: KeyKind, columns: Vec<KeyColumn>) -> Self {
        Self {
            name: name.into(),
            kind,
            columns,
        }
    }

    pub fn primary(columns: &[&str]) -> Self {
        Self::new(
            "primary",
            KeyKind::Primary,
            columns.iter().map(|c| KeyColumn::asc(*c)).collect(),
        )
    }

    pub fn unique(name: impl Into<String>, columns: &[&str]) -> Self {
        Self::new(
            name,
            KeyKind::Unique,
            columns.iter().map(|c| KeyColumn::asc(*c)).collect(),
        )
    }

    pub fn index(name: impl Into<String>, columns: &[&str]) -> Self {
        Self::new(
            name,
            KeyKind::Index,
            columns.iter().map(|c| KeyColumn::asc(*c)).collect(),
        )
    }
}

// ---------------------------------------------------------------------------
// TableDef / Schema
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableDef {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    pub keys: Vec<KeyDef>,
}

impl TableDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            keys: Vec::new(),
        }
    }

    pub fn column(mut self, column: ColumnDef) -> Self {
        self.columns.push(column);
        self
    }

    pub fn key(mut self, key: KeyDef) -> Self {
        self.keys.push(key);
        self
    }

    pub fn column_def(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn lww_columns(&self) -> impl Iterator<Item = &ColumnDef> {
        self.columns.iter().filter(|c| c.is_lww)
    }

    pub fn parent_columns(&self) -> impl Iterator<Item = &ColumnDef> {
        self.columns.iter().filter(|c| c.is_parent)
    }

    pub fn is_lww_column(&self, name: &str) -> bool {
        self.column_def(name).is_some_and(|c| c.is_lww)
    }

    pub fn primary_key(&self) -> Option<&KeyDef> {
        self.keys.iter().find(|k| k.kind == KeyKind::Primary)
    }

    /// Columns forming the declared primary key, falling back to
    /// `system_id` when none is declared.
    pub fn primary_key_columns(&self) -> Vec<&str> {
        match self.primary_key() {
            Some(key) => key.columns.iter().map(|c| c.name.as_str()).collect(),
            None => vec![SYSTEM_ID],
        }
    }

    /// `true` for declared columns, system columns, and shadows of declared
    /// LWW columns.
    pub fn is_known_column(&self, name: &str) -> bool {
        if is_system_column(name) || self.column_def(name).is_some() {
            return true;
        }
        shadowed_column(name).is_some_and(|base| self.is_lww_column(base))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Schema {
    pub tables: Vec<TableDef>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table(mut self, table: TableDef) -> Self {
        self.tables.push(table);
        self
    }

    pub fn table_def(&self, name: &str) -> Option<&TableDef> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Reject declarations the engine cannot host before any DDL runs:
    /// malformed identifiers, duplicates, collisions with synthesized
    /// columns, and keys over unknown columns.
    pub fn validate(&self) -> Result<()> {
        let mut seen_tables = std::collections::HashSet::new();
        for table in &self.tables {
            validate_identifier(&table.name)?;
            if !seen_tables.insert(table.name.as_str()) {
                return Err(EbbError::InvalidArgument(format!(
                    "duplicate table declaration: {}",
                    table.name
                )));
            }

            let mut seen_columns = std::collections::HashSet::new();
            for column in &table.columns {
                validate_identifier(&column.name)?;
                if is_system_column(&column.name) || is_shadow_column(&column.name) {
                    return Err(EbbError::InvalidArgument(format!(
                        "column name {} on table {} collides with a synthesized column",
                        column.name, table.name
                    )));
                }
                if !seen_columns.insert(column.name.as_str()) {
                    return Err(EbbError::InvalidArgument(format!(
                        "duplicate column {} on table {}",
                        column.name, table.name
                    )));
                }
            }

            let mut primaries = 0;
            for key in &table.keys {
                validate_identifier(&key.name)?;
                if key.kind == KeyKind::Primary {
                    primaries += 1;
                    if primaries > 1 {
                        return Err(EbbError::InvalidArgument(format!(
                            "table {} declares more than one primary key",
                            table.name
                        )));
                    }
                }
                if key.columns.is_empty() {
                    return Err(EbbError::InvalidArgument(format!(
                        "key {} on table {} has no columns",
                        key.name, table.name
                    )));
                }
                for kc in &key.columns {
                    if table.column_def(&kc.name).is_none() && kc.name != SYSTEM_ID {
                        return Err(EbbError::InvalidArgument(format!(
                            "key {} on table {} references unknown column {}",
                            key.name, table.name, kc.name
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// ASCII identifier: letters, digits, underscore; must not start with a
/// digit. Keeps generated SQL safe to assemble with plain quoting.
pub fn validate_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    };
    if !valid {
        return Err(EbbError::InvalidArgument(format!(
            "invalid identifier: {name:?}"
        )));
    }
    Ok(())
}
