use std::collections::HashMap;
use std::fmt;

use rusqlite::{Connection, OptionalExtension, Transaction};
use tracing::{debug, warn};

use crate::error::{EbbError, Result};
use crate::schema::{
    shadow_column, ColumnDef, KeyDef, KeyKind, Schema, TableDef, SYSTEM_CREATED_AT, SYSTEM_ID,
    SYSTEM_IS_LOCAL_ORIGIN, SYSTEM_VERSION,
};
use crate::value::Value;

/// Per-table upload cursors used by the sync orchestrator.
pub const SYNC_CURSORS_TABLE: &str = "__sync_cursors";

// ---------------------------------------------------------------------------
// Engine-owned metadata tables
// ---------------------------------------------------------------------------

/// DDL for the tables the engine itself owns. All statements use
/// `IF NOT EXISTS` so the migrator stays idempotent.
const META_TABLES: &str = "
CREATE TABLE IF NOT EXISTS __dirty_rows (
    table_name  TEXT    NOT NULL,
    row_id      TEXT    NOT NULL,
    hlc         TEXT    NOT NULL,
    is_full_row INTEGER NOT NULL DEFAULT 1,
    tombstone   INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (table_name, row_id)
);

CREATE INDEX IF NOT EXISTS idx_dirty_rows_order
    ON __dirty_rows (table_name, hlc);

CREATE TABLE IF NOT EXISTS __sync_cursors (
    table_name TEXT NOT NULL PRIMARY KEY,
    hlc        TEXT NOT NULL
);
";

// ---------------------------------------------------------------------------
// DriftWarning
// ---------------------------------------------------------------------------

/// A live column whose storage type no longer matches the declaration.
/// Reported, never auto-fixed: changing a column type in place would require
/// a destructive table rebuild.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriftWarning {
    pub table: String,
    pub column: String,
    pub declared: String,
    pub live: String,
}

impl fmt::Display for DriftWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}: declared {} but database has {}",
            self.table, self.column, self.declared, self.live
        )
    }
}

// ---------------------------------------------------------------------------
// Migration entry point
// ---------------------------------------------------------------------------

/// Reconcile the declared schema against the live catalog, forward only.
///
/// Missing tables are created with their system and shadow columns; missing
/// columns and indices are added to existing tables. Nothing is ever
/// dropped or renamed. The whole reconciliation runs inside one
/// transaction; any DDL failure rolls it back and surfaces as
/// [`EbbError::SchemaMigration`].
pub fn migrate_schema(conn: &mut Connection, schema: &Schema) -> Result<Vec<DriftWarning>> {
    schema.validate()?;

    let tx = conn.transaction().map_err(ddl_err)?;
    let mut warnings = Vec::new();

    for table in &schema.tables {
        if table_exists(&tx, &table.name)? {
            warnings.extend(add_missing_columns(&tx, table)?);
        } else {
            create_table(&tx, table)?;
        }
        ensure_indices(&tx, table)?;
        verify_shadows(&tx, table)?;
    }

    tx.execute_batch(META_TABLES).map_err(ddl_err)?;
    tx.commit().map_err(ddl_err)?;

    for w in &warnings {
        warn!(table = %w.table, column = %w.column, declared = %w.declared, live = %w.live,
              "schema drift: column type mismatch");
    }
    debug!(tables = schema.tables.len(), "schema reconciled");

    Ok(warnings)
}

fn ddl_err(e: rusqlite::Error) -> EbbError {
    EbbError::SchemaMigration(e.to_string())
}

// ---------------------------------------------------------------------------
// Catalog inspection
// ---------------------------------------------------------------------------

fn table_exists(tx: &Transaction<'_>, name: &str) -> Result<bool> {
    let count: i64 = tx.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [name],
        |r| r.get(0),
    )?;
    Ok(count > 0)
}

/// Live column name → declared storage type, from `PRAGMA table_info`.
fn live_columns(tx: &Transaction<'_>, table: &str) -> Result<HashMap<String, String>> {
    let mut stmt = tx.prepare("SELECT name, type FROM pragma_table_info(?1)")?;
    let rows = stmt.query_map([table], |r| {
        Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
    })?;
    let mut out = HashMap::new();
    for row in rows {
        let (name, col_type) = row?;
        out.insert(name, col_type);
    }
    Ok(out)
}

fn existing_index_sql(tx: &Transaction<'_>, name: &str) -> Result<Option<String>> {
    let sql: Option<Option<String>> = tx
        .query_row(
            "SELECT sql FROM sqlite_master WHERE type = 'index' AND name = ?1",
            [name],
            |r| r.get(0),
        )
        .optional()?;
    // Auto-indices (e.g. for inline PRIMARY KEY) have NULL sql.
    Ok(sql.flatten())
}

// ---------------------------------------------------------------------------
// DDL rendering
// ---------------------------------------------------------------------------

fn sql_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Real(f) => f.to_string(),
        Value::Text(s) => format!("'{}'", s.replace('\'', "''")),
        Value::Blob(b) => {
            let hex: String = b.iter().map(|byte| format!("{byte:02X}")).collect();
            format!("X'{hex}'")
        }
    }
}

/// Render one declared column. On the ALTER path a NOT NULL without a
/// default is dropped: SQLite cannot backfill existing rows.
fn column_ddl(column: &ColumnDef, for_alter: bool) -> String {
    let mut sql = format!("\"{}\" {}", column.name, column.col_type.sql_type());
    match (&column.default, column.not_null) {
        (Some(default), true) => {
            sql.push_str(&format!(" NOT NULL DEFAULT {}", sql_literal(default)));
        }
        (Some(default), false) => {
            sql.push_str(&format!(" DEFAULT {}", sql_literal(default)));
        }
        (None, true) if !for_alter => sql.push_str(" NOT NULL"),
        (None, _) => {}
    }
    sql
}

/// The four synthesized system columns. Defaults keep the ALTER path legal
/// on tables that already contain rows.
fn system_column_ddls() -> [(&'static str, &'static str); 4] {
    [
        (SYSTEM_ID, "\"system_id\" TEXT NOT NULL DEFAULT ''"),
        (
            SYSTEM_CREATED_AT,
            "\"system_created_at\" TEXT NOT NULL DEFAULT ''",
        ),
        (SYSTEM_VERSION, "\"system_version\" TEXT NOT NULL DEFAULT ''"),
        (
            SYSTEM_IS_LOCAL_ORIGIN,
            "\"system_is_local_origin\" INTEGER NOT NULL DEFAULT 1",
        ),
    ]
}

fn shadow_ddl(base: &str) -> String {
    format!("\"{}\" TEXT", shadow_column(base))
}

fn index_sql(table: &str, key: &KeyDef) -> String {
    let unique = match key.kind {
        KeyKind::Unique => "UNIQUE ",
        _ => "",
    };
    let cols: Vec<String> = key
        .columns
        .iter()
        .map(|c| format!("\"{}\" {}", c.name, c.order.as_sql()))
        .collect();
    format!(
        "CREATE {unique}INDEX \"{}\" ON \"{table}\" ({})",
        key.name,
        cols.join(", ")
    )
}

// ---------------------------------------------------------------------------
// Table creation / reconciliation
// ---------------------------------------------------------------------------

fn create_table(tx: &Transaction<'_>, table: &TableDef) -> Result<()> {
    let mut parts: Vec<String> = table
        .columns
        .iter()
        .map(|c| column_ddl(c, false))
        .collect();
    parts.extend(system_column_ddls().iter().map(|(_, ddl)| ddl.to_string()));
    parts.extend(table.lww_columns().map(|c| shadow_ddl(&c.name)));

    if let Some(pk) = table.primary_key() {
        let cols: Vec<String> = pk
            .columns
            .iter()
            .map(|c| format!("\"{}\" {}", c.name, c.order.as_sql()))
            .collect();
        parts.push(format!("PRIMARY KEY ({})", cols.join(", ")));
    }

    let sql = format!(
        "CREATE TABLE \"{}\" (\n    {}\n)",
        table.name,
        parts.join(",\n    ")
    );
    tx.execute(&sql, []).map_err(ddl_err)?;
    debug!(table = %table.name, "created table");
    Ok(())
}

fn add_missing_columns(tx: &Transaction<'_>, table: &TableDef) -> Result<Vec<DriftWarning>> {
    let live = live_columns(tx, &table.name)?;
    let mut warnings = Vec::new();

    let add = |ddl: String| -> Result<()> {
        tx.execute(
            &format!("ALTER TABLE \"{}\" ADD COLUMN {ddl}", table.name),
            [],
        )
        .map_err(ddl_err)?;
        Ok(())
    };

    for column in &table.columns {
        match live.get(&column.name) {
            None => add(column_ddl(column, true))?,
            Some(live_type) if !live_type.eq_ignore_ascii_case(column.col_type.sql_type()) => {
                warnings.push(DriftWarning {
                    table: table.name.clone(),
                    column: column.name.clone(),
                    declared: column.col_type.sql_type().to_string(),
                    live: live_type.clone(),
                });
            }
            Some(_) => {}
        }
    }

    for (name, ddl) in system_column_ddls() {
        if !live.contains_key(name) {
            add(ddl.to_string())?;
        }
    }

    for column in table.lww_columns() {
        if !live.contains_key(&shadow_column(&column.name)) {
            add(shadow_ddl(&column.name))?;
        }
    }

    Ok(warnings)
}

fn ensure_indices(tx: &Transaction<'_>, table: &TableDef) -> Result<()> {
    let mut specs: Vec<(String, String)> = Vec::new();

    for key in table.keys.iter().filter(|k| k.kind != KeyKind::Primary) {
        specs.push((key.name.clone(), index_sql(&table.name, key)));
    }

    let system_id_index = format!("uq_{}_system_id", table.name);
    specs.push((
        system_id_index.clone(),
        format!(
            "CREATE UNIQUE INDEX \"{system_id_index}\" ON \"{}\" (\"{SYSTEM_ID}\" ASC)",
            table.name
        ),
    ));

    for column in table.parent_columns() {
        let name = format!("idx_{}_{}", table.name, column.name);
        if specs.iter().any(|(n, _)| *n == name) {
            continue;
        }
        specs.push((
            name.clone(),
            format!(
                "CREATE INDEX \"{name}\" ON \"{}\" (\"{}\" ASC)",
                table.name, column.name
            ),
        ));
    }

    for (name, sql) in specs {
        match existing_index_sql(tx, &name)? {
            None => {
                tx.execute(&sql, []).map_err(ddl_err)?;
            }
            Some(existing) if existing == sql => {}
            Some(_) => {
                return Err(EbbError::SchemaMigration(format!(
                    "index {name} already exists with a different definition"
                )));
            }
        }
    }

    Ok(())
}

/// Post-DDL sanity check: every LWW column must have its shadow.
fn verify_shadows(tx: &Transaction<'_>, table: &TableDef) -> Result<()> {
    let live = live_columns(tx, &table.name)?;
    for column in table.lww_columns() {
        let shadow = shadow_column(&column.name);
        if !live.contains_key(&shadow) {
            return Err(EbbError::SchemaMigration(format!(
                "table {} is missing shadow column {shadow}",
                table.name
            )));
        }
    }
    Ok(())
}
