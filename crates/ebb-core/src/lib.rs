pub mod db;
pub mod dirty;
pub mod error;
pub mod hlc;
pub mod migrate;
pub mod schema;
pub mod value;

pub use db::{DbConnection, DbPool};
pub use dirty::DirtyRow;
pub use error::{EbbError, Result};
pub use hlc::{Hlc, HlcClock};
pub use migrate::{migrate_schema, DriftWarning};
pub use schema::{ColumnDef, ColumnType, KeyColumn, KeyDef, KeyKind, Schema, SortOrder, TableDef};
pub use value::{Row, Value};
