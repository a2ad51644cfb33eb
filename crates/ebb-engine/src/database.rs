use std::cell::{Cell, RefCell};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use tracing::debug;
use uuid::Uuid;

use ebb_core::db::{self, DbConnection, DbPool};
use ebb_core::dirty::{self, DirtyRow};
use ebb_core::error::{EbbError, Result};
use ebb_core::hlc::{Hlc, HlcClock};
use ebb_core::migrate::{migrate_schema, SYNC_CURSORS_TABLE};
use ebb_core::schema::{
    is_shadow_column, is_system_column, shadow_column, Schema, TableDef, SYSTEM_CREATED_AT,
    SYSTEM_ID, SYSTEM_IS_LOCAL_ORIGIN, SYSTEM_VERSION,
};
use ebb_core::value::{Row, Value};
use ebb_merge::{BulkLoadReport, ConstraintPolicy};

use crate::config::{DbConfig, DbLocation};
use crate::query::{execute_query, Query};
use crate::record::Record;
use crate::stream::{StreamId, StreamManager};

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

/// One engine instance: a schema-bound SQLite database with HLC-stamped
/// writes, dirty-row interception, server merge, and reactive query
/// streams.
///
/// All writes serialize on an internal lock so that the HLC stamp, the SQL
/// execution, and the dirty-row append of one write form a single critical
/// section. Reads and stream re-executions run on pooled connections.
pub struct Database {
    pool: DbPool,
    schema: Schema,
    clock: HlcClock,
    streams: StreamManager,
    write_lock: Mutex<()>,
    open: AtomicBool,
}

impl Database {
    /// Build the pool, reconcile the schema against the live catalog, and
    /// return an active engine.
    pub fn open(config: DbConfig, schema: Schema) -> Result<Self> {
        let clock = HlcClock::new(config.node_id.clone())?;
        let pool = match &config.location {
            DbLocation::File(path) => {
                let path = path.to_str().ok_or_else(|| {
                    EbbError::InvalidArgument(format!("non-UTF8 database path: {path:?}"))
                })?;
                db::create_pool(path, config.pool_size, config.busy_timeout)?
            }
            DbLocation::Memory => db::create_memory_pool(config.pool_size)?,
        };

        {
            let mut conn = pool
                .get()
                .map_err(|e| EbbError::Internal(e.to_string()))?;
            migrate_schema(&mut conn, &schema)?;
        }

        debug!(node_id = %config.node_id, tables = schema.tables.len(), "engine opened");
        Ok(Self {
            pool,
            schema,
            clock,
            streams: StreamManager::new(),
            write_lock: Mutex::new(()),
            open: AtomicBool::new(true),
        })
    }

    pub fn node_id(&self) -> &str {
        self.clock.node_id()
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Stop accepting operations. Pooled connections close as they drop.
    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    fn check_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(EbbError::NotInitialized)
        }
    }

    fn conn(&self) -> Result<DbConnection> {
        self.pool
            .get()
            .map_err(|e| EbbError::Internal(e.to_string()))
    }

    fn table_def(&self, name: &str) -> Result<&TableDef> {
        self.schema
            .table_def(name)
            .ok_or_else(|| EbbError::InvalidArgument(format!("unknown table: {name}")))
    }

    // -----------------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------------

    /// Run `f` against one transaction. Application mutations and their
    /// dirty markers commit or roll back together; stream notifications
    /// queued inside the transaction are delivered once, after commit.
    pub fn transaction<T>(&self, f: impl FnOnce(&Session<'_>) -> Result<T>) -> Result<T> {
        self.check_open()?;
        let guard = self
            .write_lock
            .lock()
            .map_err(|_| EbbError::Internal("engine write lock poisoned".into()))?;

        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        let session = Session {
            db: self,
            conn: &tx,
            touched: RefCell::new(BTreeSet::new()),
            savepoints: Cell::new(0),
        };

        let result = f(&session)?;
        let touched = session.touched.into_inner();
        tx.commit()?;
        drop(conn);
        drop(guard);

        for table in &touched {
            self.streams.notify_table_changed(table);
        }
        self.streams.pump(&self.pool);
        Ok(result)
    }

    // -----------------------------------------------------------------------
    // Write path
    // -----------------------------------------------------------------------

    /// Insert a row, stamping system columns and queueing it for upload.
    /// Returns the row's `system_id`.
    pub fn insert(&self, table: &str, values: Row) -> Result<String> {
        self.transaction(|session| session.insert(table, values))
    }

    pub fn insert_or_replace(&self, table: &str, values: Row) -> Result<String> {
        self.transaction(|session| session.insert_or_replace(table, values))
    }

    /// Update every row matching `where_clause` (unnumbered `?`
    /// placeholders bound from `args`; `None` matches all rows). Returns
    /// the changed-row count.
    pub fn update(
        &self,
        table: &str,
        values: Row,
        where_clause: Option<&str>,
        args: &[Value],
    ) -> Result<usize> {
        self.transaction(|session| session.update(table, values, where_clause, args))
    }

    pub fn delete(&self, table: &str, where_clause: Option<&str>, args: &[Value]) -> Result<usize> {
        self.transaction(|session| session.delete(table, where_clause, args))
    }

    /// Persist a record: insert when it has no `system_id`, otherwise a
    /// partial update of exactly the columns that changed since the record
    /// was read. The record is reloaded on success.
    pub fn save(&self, record: &mut Record) -> Result<String> {
        self.transaction(|session| session.save(record))
    }

    // -----------------------------------------------------------------------
    // Read path
    // -----------------------------------------------------------------------

    pub fn query(&self, query: &Query) -> Result<Vec<Record>> {
        self.check_open()?;
        self.table_def(&query.table)?;
        let conn = self.conn()?;
        execute_query(&conn, query)
    }

    pub fn query_one(&self, query: &Query) -> Result<Option<Record>> {
        Ok(self.query(query)?.into_iter().next())
    }

    // -----------------------------------------------------------------------
    // Merge
    // -----------------------------------------------------------------------

    /// Apply a batch of server rows with per-column LWW resolution. The
    /// whole batch runs in one transaction; affected streams are notified
    /// once.
    pub fn bulk_load(
        &self,
        table: &str,
        rows: &[Row],
        policy: ConstraintPolicy,
    ) -> Result<BulkLoadReport> {
        self.check_open()?;
        let table_def = self.table_def(table)?.clone();

        let guard = self
            .write_lock
            .lock()
            .map_err(|_| EbbError::Internal("engine write lock poisoned".into()))?;
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        let report = ebb_merge::bulk_load(&tx, &table_def, &self.clock, rows, policy)?;
        tx.commit()?;
        drop(conn);
        drop(guard);

        self.streams.notify_table_changed(table);
        self.streams.pump(&self.pool);
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Streams
    // -----------------------------------------------------------------------

    /// Register a live query. The subscriber receives the initial snapshot
    /// immediately and a new snapshot after every commit that changed the
    /// result set.
    pub fn stream(
        &self,
        query: Query,
        callback: impl Fn(Result<Vec<Record>>) + Send + Sync + 'static,
    ) -> Result<StreamId> {
        self.check_open()?;
        self.table_def(&query.table)?;
        let id = self.streams.register(query, callback);
        self.streams.pump(&self.pool);
        Ok(id)
    }

    /// Point an existing stream at a new query; equal signatures are a
    /// no-op so widget rebuilds don't churn.
    pub fn update_stream(&self, id: StreamId, query: Query) -> Result<bool> {
        self.check_open()?;
        self.table_def(&query.table)?;
        let changed = self.streams.update_query(id, query);
        if changed {
            self.streams.pump(&self.pool);
        }
        Ok(changed)
    }

    pub fn dispose_stream(&self, id: StreamId) {
        self.streams.dispose(id);
    }

    // -----------------------------------------------------------------------
    // Export
    // -----------------------------------------------------------------------

    /// Byte image of the database file, suitable for reopening.
    pub fn export_database(&self) -> Result<Vec<u8>> {
        self.check_open()?;
        let conn = self.conn()?;
        db::export_database(&conn)
    }

    // -----------------------------------------------------------------------
    // Sync support surface
    // -----------------------------------------------------------------------

    /// Up to `batch_size` queued outbound changes, oldest first per table.
    /// Entries stay queued until [`Database::clear_acked`].
    pub fn drain_dirty(&self, batch_size: usize) -> Result<Vec<DirtyRow>> {
        self.check_open()?;
        let conn = self.conn()?;
        dirty::drain(&conn, batch_size)
    }

    pub fn dirty_row(&self, table: &str, row_id: &str) -> Result<Option<DirtyRow>> {
        self.check_open()?;
        let conn = self.conn()?;
        dirty::get_dirty_row(&conn, table, row_id)
    }

    /// Clear the given drained entries whose PERSISTED hlc the ack covers.
    /// An entry superseded by a newer local write since the drain keeps its
    /// marker; that delta still needs to travel.
    pub fn clear_acked(&self, entries: &[DirtyRow], ack: &Hlc) -> Result<()> {
        self.check_open()?;
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| EbbError::Internal("engine write lock poisoned".into()))?;
        let conn = self.conn()?;
        for entry in entries {
            if let Some(current) = dirty::get_dirty_row(&conn, &entry.table, &entry.row_id)? {
                if current.hlc <= *ack {
                    dirty::clear_dirty(&conn, &entry.table, &entry.row_id)?;
                }
            }
        }
        Ok(())
    }

    /// Full current row for an upload payload.
    pub fn fetch_row(&self, table: &str, system_id: &str) -> Result<Option<Record>> {
        self.query_one(
            &Query::table(table).filter(format!("\"{SYSTEM_ID}\" = ?"), [system_id]),
        )
    }

    pub fn sync_cursor(&self, table: &str) -> Result<Option<Hlc>> {
        self.check_open()?;
        let conn = self.conn()?;
        let text: Option<String> = conn
            .query_row(
                &format!("SELECT hlc FROM \"{SYNC_CURSORS_TABLE}\" WHERE table_name = ?1"),
                params![table],
                |r| r.get(0),
            )
            .optional()?;
        text.map(|t| Hlc::parse(&t)).transpose()
    }

    pub fn set_sync_cursor(&self, table: &str, cursor: &Hlc) -> Result<()> {
        self.check_open()?;
        let conn = self.conn()?;
        conn.execute(
            &format!(
                "INSERT INTO \"{SYNC_CURSORS_TABLE}\" (table_name, hlc) VALUES (?1, ?2)
                 ON CONFLICT (table_name) DO UPDATE SET hlc = excluded.hlc"
            ),
            params![table, cursor.to_string()],
        )?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Write operations scoped to one open transaction. Obtained through
/// [`Database::transaction`]; composed work nests via [`Session::savepoint`].
pub struct Session<'a> {
    db: &'a Database,
    conn: &'a Connection,
    touched: RefCell<BTreeSet<String>>,
    savepoints: Cell<u32>,
}

impl Session<'_> {
    pub fn insert(&self, table: &str, values: Row) -> Result<String> {
        self.insert_impl(table, values, false)
    }

    pub fn insert_or_replace(&self, table: &str, values: Row) -> Result<String> {
        self.insert_impl(table, values, true)
    }

    fn insert_impl(&self, table_name: &str, mut values: Row, replace: bool) -> Result<String> {
        let table = self.db.table_def(table_name)?;
        validate_values(table, &values)?;

        let stamp = self.db.clock.now();

        let system_id = match nonempty_text(values.get(SYSTEM_ID)) {
            Some(existing) => existing.to_string(),
            None => Uuid::new_v4().to_string(),
        };
        values.insert(SYSTEM_ID.into(), Value::Text(system_id.clone()));
        if nonempty_text(values.get(SYSTEM_CREATED_AT)).is_none() {
            values.insert(SYSTEM_CREATED_AT.into(), (&stamp).into());
        }
        values.insert(SYSTEM_VERSION.into(), (&stamp).into());
        if !values.contains_key(SYSTEM_IS_LOCAL_ORIGIN) {
            values.insert(SYSTEM_IS_LOCAL_ORIGIN.into(), Value::Integer(1));
        }
        for column in table.lww_columns() {
            let shadow = shadow_column(&column.name);
            if nonempty_text(values.get(&shadow)).is_none() {
                values.insert(shadow, (&stamp).into());
            }
        }

        let verb = if replace { "INSERT OR REPLACE" } else { "INSERT" };
        let columns: Vec<String> = values.keys().map(|k| format!("\"{k}\"")).collect();
        let placeholders: Vec<&str> = values.keys().map(|_| "?").collect();
        let sql = format!(
            "{verb} INTO \"{table_name}\" ({}) VALUES ({})",
            columns.join(", "),
            placeholders.join(", ")
        );
        self.conn
            .execute(&sql, params_from_iter(values.values()))
            .map_err(|e| EbbError::from_write(table_name, Some(&system_id), e))?;

        dirty::mark_dirty(
            self.conn,
            &DirtyRow::new(table_name, system_id.clone(), stamp),
        )?;
        self.touched.borrow_mut().insert(table_name.to_string());
        Ok(system_id)
    }

    pub fn update(
        &self,
        table_name: &str,
        values: Row,
        where_clause: Option<&str>,
        args: &[Value],
    ) -> Result<usize> {
        let table = self.db.table_def(table_name)?;

        // The engine owns tracking fields; caller-supplied system columns
        // and shadows are stripped before validation.
        let mut set_map: Row = values
            .into_iter()
            .filter(|(name, _)| !is_system_column(name) && !is_shadow_column(name))
            .collect();
        validate_values(table, &set_map)?;
        if set_map.is_empty() {
            return Ok(0);
        }

        // Know which rows to mark dirty before mutating them.
        let targets = select_targets(self.conn, table_name, where_clause, args)?;
        if targets.is_empty() {
            return Ok(0);
        }

        let stamp = self.db.clock.now();
        let lww_updates: Vec<String> = set_map
            .keys()
            .filter(|name| table.is_lww_column(name))
            .map(|name| shadow_column(name))
            .collect();
        for shadow in lww_updates {
            set_map.insert(shadow, (&stamp).into());
        }
        set_map.insert(SYSTEM_VERSION.into(), (&stamp).into());

        let assignments: Vec<String> = set_map.keys().map(|k| format!("\"{k}\" = ?")).collect();
        let mut sql = format!(
            "UPDATE \"{table_name}\" SET {}",
            assignments.join(", ")
        );
        if let Some(where_clause) = where_clause {
            sql.push_str(" WHERE ");
            sql.push_str(where_clause);
        }
        let bound: Vec<&Value> = set_map.values().chain(args.iter()).collect();
        let changed = self
            .conn
            .execute(&sql, params_from_iter(bound))
            .map_err(|e| EbbError::from_write(table_name, None, e))?;

        for (system_id, local_origin) in targets {
            let mut entry = DirtyRow::new(table_name, system_id, stamp.clone());
            if !local_origin {
                entry = entry.partial();
            }
            dirty::mark_dirty(self.conn, &entry)?;
        }
        self.touched.borrow_mut().insert(table_name.to_string());
        Ok(changed)
    }

    pub fn delete(
        &self,
        table_name: &str,
        where_clause: Option<&str>,
        args: &[Value],
    ) -> Result<usize> {
        self.db.table_def(table_name)?;

        let targets = select_targets(self.conn, table_name, where_clause, args)?;
        if targets.is_empty() {
            return Ok(0);
        }
        let stamp = self.db.clock.now();

        let mut sql = format!("DELETE FROM \"{table_name}\"");
        if let Some(where_clause) = where_clause {
            sql.push_str(" WHERE ");
            sql.push_str(where_clause);
        }
        let changed = self
            .conn
            .execute(&sql, params_from_iter(args.iter()))
            .map_err(|e| EbbError::from_write(table_name, None, e))?;

        // The data rows are gone; the queue keeps tombstones until the
        // server acknowledges the deletes.
        for (system_id, local_origin) in targets {
            let mut entry = DirtyRow::new(table_name, system_id, stamp.clone()).tombstone();
            if !local_origin {
                entry = entry.partial();
            }
            dirty::mark_dirty(self.conn, &entry)?;
        }
        self.touched.borrow_mut().insert(table_name.to_string());
        Ok(changed)
    }

    pub fn query(&self, query: &Query) -> Result<Vec<Record>> {
        self.db.table_def(&query.table)?;
        execute_query(self.conn, query)
    }

    pub fn query_one(&self, query: &Query) -> Result<Option<Record>> {
        Ok(self.query(query)?.into_iter().next())
    }

    pub fn save(&self, record: &mut Record) -> Result<String> {
        let system_id = match record.system_id() {
            None => self.insert(record.table(), record.fields().clone())?,
            Some(system_id) => {
                let system_id = system_id.to_string();
                let changes = record.changed_columns();
                if !changes.is_empty() {
                    self.update(
                        record.table(),
                        changes,
                        Some(&format!("\"{SYSTEM_ID}\" = ?")),
                        &[Value::Text(system_id.clone())],
                    )?;
                }
                system_id
            }
        };

        // Reload so the handle reflects stamped system columns and the
        // snapshot matches the persisted state.
        let table = record.table().to_string();
        if let Some(fresh) = self.query_one(
            &Query::table(&table).filter(format!("\"{SYSTEM_ID}\" = ?"), [system_id.as_str()]),
        )? {
            record.reload(fresh.fields().clone());
        }
        Ok(system_id)
    }

    /// Nest composed work: rolls back to the savepoint on `Err` while the
    /// surrounding transaction stays usable.
    pub fn savepoint<T>(&self, f: impl FnOnce(&Session<'_>) -> Result<T>) -> Result<T> {
        let name = format!("ebb_sp_{}", self.savepoints.get());
        self.savepoints.set(self.savepoints.get() + 1);

        self.conn.execute_batch(&format!("SAVEPOINT {name}"))?;
        match f(self) {
            Ok(value) => {
                self.conn.execute_batch(&format!("RELEASE {name}"))?;
                Ok(value)
            }
            Err(err) => {
                self.conn
                    .execute_batch(&format!("ROLLBACK TO {name}; RELEASE {name}"))?;
                Err(err)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn nonempty_text(value: Option<&Value>) -> Option<&str> {
    value.and_then(|v| v.as_text()).filter(|s| !s.is_empty())
}

fn validate_values(table: &TableDef, values: &Row) -> Result<()> {
    for (name, value) in values {
        if !table.is_known_column(name) {
            return Err(EbbError::InvalidArgument(format!(
                "unknown column {name} on table {}",
                table.name
            )));
        }
        if let Some(column) = table.column_def(name) {
            if let (Some(max), Some(text)) = (column.max_length, value.as_text()) {
                if text.chars().count() > max as usize {
                    return Err(EbbError::InvalidArgument(format!(
                        "value for {}.{name} exceeds max length {max}",
                        table.name
                    )));
                }
            }
        }
    }
    Ok(())
}

/// `(system_id, is_local_origin)` of every row the mutation will touch.
fn select_targets(
    conn: &Connection,
    table: &str,
    where_clause: Option<&str>,
    args: &[Value],
) -> Result<Vec<(String, bool)>> {
    let mut sql = format!(
        "SELECT \"{SYSTEM_ID}\", \"{SYSTEM_IS_LOCAL_ORIGIN}\" FROM \"{table}\""
    );
    if let Some(where_clause) = where_clause {
        sql.push_str(" WHERE ");
        sql.push_str(where_clause);
    }
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(args.iter()), |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)? != 0))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use ebb_core::schema::{ColumnDef, KeyDef};

    fn schema() -> Schema {
        Schema::new()
            .table(
                TableDef::new("users")
                    .column(ColumnDef::text("name").lww())
                    .column(ColumnDef::text("email").lww().max_length(120))
                    .column(ColumnDef::integer("age"))
                    .key(KeyDef::unique("uq_users_email", &["email"])),
            )
            .table(
                TableDef::new("orders")
                    .column(ColumnDef::text("status").lww())
                    .column(ColumnDef::integer("total")),
            )
    }

    fn open_db() -> Database {
        Database::open(DbConfig::memory("n1").pool_size(4), schema()).unwrap()
    }

    fn row(pairs: &[(&str, Value)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    fn text(s: &str) -> Value {
        Value::Text(s.to_string())
    }

    #[test]
    fn insert_stamps_system_columns_and_marks_dirty() {
        let db = open_db();
        let sid = db
            .insert("users", row(&[("name", text("Alice"))]))
            .unwrap();
        assert!(!sid.is_empty());

        let record = db.fetch_row("users", &sid).unwrap().unwrap();
        assert_eq!(record.get::<i64>(SYSTEM_IS_LOCAL_ORIGIN), Some(1));

        let created: String = record.get(SYSTEM_CREATED_AT).unwrap();
        let version: String = record.get(SYSTEM_VERSION).unwrap();
        let name_hlc: String = record.get("name__hlc").unwrap();
        assert_eq!(created, version);
        assert_eq!(name_hlc, version);
        Hlc::parse(&version).unwrap();

        let entry = db.dirty_row("users", &sid).unwrap().unwrap();
        assert!(entry.is_full_row);
        assert!(!entry.tombstone);
        assert_eq!(entry.hlc, Hlc::parse(&version).unwrap());
    }

    #[test]
    fn inserted_rows_have_distinct_system_ids() {
        let db = open_db();
        for i in 0..25 {
            db.insert("users", row(&[("name", text(&format!("u{i}")))]))
                .unwrap();
        }
        let distinct: i64 = db
            .conn()
            .unwrap()
            .query_row(
                "SELECT COUNT(DISTINCT system_id) - COUNT(*) FROM users",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(distinct, 0);
    }

    #[test]
    fn versions_increase_with_commit_order() {
        let db = open_db();
        let a = db.insert("users", row(&[("name", text("a"))])).unwrap();
        let b = db.insert("users", row(&[("name", text("b"))])).unwrap();

        let va: String = db.fetch_row("users", &a).unwrap().unwrap().get(SYSTEM_VERSION).unwrap();
        let vb: String = db.fetch_row("users", &b).unwrap().unwrap().get(SYSTEM_VERSION).unwrap();
        assert!(Hlc::parse(&vb).unwrap() > Hlc::parse(&va).unwrap());
    }

    #[test]
    fn version_dominates_every_shadow() {
        let db = open_db();
        let sid = db
            .insert(
                "users",
                row(&[("name", text("a")), ("email", text("a@x"))]),
            )
            .unwrap();
        db.update(
            "users",
            row(&[("name", text("b"))]),
            Some("\"system_id\" = ?"),
            &[text(&sid)],
        )
        .unwrap();

        let record = db.fetch_row("users", &sid).unwrap().unwrap();
        let version = Hlc::parse(&record.get::<String>(SYSTEM_VERSION).unwrap()).unwrap();
        for shadow in ["name__hlc", "email__hlc"] {
            let hlc = Hlc::parse(&record.get::<String>(shadow).unwrap()).unwrap();
            assert!(version >= hlc, "{shadow} exceeds system_version");
        }
    }

    #[test]
    fn update_stamps_only_provided_lww_shadows() {
        let db = open_db();
        let sid = db
            .insert(
                "users",
                row(&[("name", text("a")), ("email", text("a@x"))]),
            )
            .unwrap();
        let before = db.fetch_row("users", &sid).unwrap().unwrap();
        let email_hlc_before: String = before.get("email__hlc").unwrap();

        let changed = db
            .update(
                "users",
                row(&[("name", text("b"))]),
                Some("\"system_id\" = ?"),
                &[text(&sid)],
            )
            .unwrap();
        assert_eq!(changed, 1);

        let after = db.fetch_row("users", &sid).unwrap().unwrap();
        assert_eq!(after.get::<String>("name").as_deref(), Some("b"));
        assert_eq!(
            after.get::<String>("email__hlc").as_deref(),
            Some(email_hlc_before.as_str())
        );
        assert_eq!(
            after.get::<String>("name__hlc"),
            after.get::<String>(SYSTEM_VERSION)
        );
    }

    #[test]
    fn update_on_server_origin_row_queues_partial_upload() {
        let db = open_db();
        db.bulk_load(
            "users",
            &[row(&[
                (SYSTEM_ID, text("srv-1")),
                ("name", text("remote")),
            ])],
            ConstraintPolicy::Throw,
        )
        .unwrap();

        db.update(
            "users",
            row(&[("name", text("edited"))]),
            Some("\"system_id\" = ?"),
            &[text("srv-1")],
        )
        .unwrap();

        let entry = db.dirty_row("users", "srv-1").unwrap().unwrap();
        assert!(!entry.is_full_row, "server-origin rows upload deltas only");
    }

    #[test]
    fn delete_queues_tombstones() {
        let db = open_db();
        let sid = db.insert("users", row(&[("name", text("a"))])).unwrap();

        let changed = db
            .delete("users", Some("\"system_id\" = ?"), &[text(&sid)])
            .unwrap();
        assert_eq!(changed, 1);

        assert!(db.fetch_row("users", &sid).unwrap().is_none());
        let entry = db.dirty_row("users", &sid).unwrap().unwrap();
        assert!(entry.tombstone);
        assert!(entry.is_full_row);
    }

    #[test]
    fn save_routes_new_records_to_insert() {
        let db = open_db();
        let mut record = Record::new("users");
        record.set("name", "Alice");

        let sid = db.save(&mut record).unwrap();
        assert_eq!(record.system_id(), Some(sid.as_str()));
        assert!(record.changed_columns().is_empty());
        assert!(record.get::<String>(SYSTEM_VERSION).is_some());
    }

    #[test]
    fn save_issues_a_partial_update_for_changed_columns() {
        let db = open_db();
        let sid = db
            .insert(
                "users",
                row(&[("name", text("a")), ("email", text("a@x"))]),
            )
            .unwrap();

        let mut record = db.fetch_row("users", &sid).unwrap().unwrap();
        let email_hlc_before: String = record.get("email__hlc").unwrap();
        record.set("name", "b");
        db.save(&mut record).unwrap();

        // Only name moved; the email shadow is untouched.
        let fresh = db.fetch_row("users", &sid).unwrap().unwrap();
        assert_eq!(fresh.get::<String>("name").as_deref(), Some("b"));
        assert_eq!(
            fresh.get::<String>("email__hlc").as_deref(),
            Some(email_hlc_before.as_str())
        );
        assert!(record.changed_columns().is_empty());
    }

    #[test]
    fn saving_an_unmodified_record_is_a_no_op() {
        let db = open_db();
        let sid = db.insert("users", row(&[("name", text("a"))])).unwrap();
        let mut record = db.fetch_row("users", &sid).unwrap().unwrap();
        let version_before: String = record.get(SYSTEM_VERSION).unwrap();

        db.save(&mut record).unwrap();
        let version_after: String = db
            .fetch_row("users", &sid)
            .unwrap()
            .unwrap()
            .get(SYSTEM_VERSION)
            .unwrap();
        assert_eq!(version_before, version_after);
    }

    #[test]
    fn failed_transaction_rolls_back_rows_and_dirty_markers() {
        let db = open_db();
        let result: Result<()> = db.transaction(|session| {
            session.insert("users", row(&[("name", text("ghost"))]))?;
            Err(EbbError::Internal("abort".into()))
        });
        assert!(result.is_err());

        let count: i64 = db
            .conn()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
        assert!(db.drain_dirty(10).unwrap().is_empty());
    }

    #[test]
    fn savepoint_failure_keeps_the_outer_transaction() {
        let db = open_db();
        db.transaction(|session| {
            session.insert("users", row(&[("name", text("keep"))]))?;
            let nested: Result<()> = session.savepoint(|inner| {
                inner.insert("users", row(&[("name", text("discard"))]))?;
                Err(EbbError::Internal("abort nested".into()))
            });
            assert!(nested.is_err());
            Ok(())
        })
        .unwrap();

        let names: Vec<String> = db
            .query(&Query::table("users"))
            .unwrap()
            .iter()
            .filter_map(|r| r.get::<String>("name"))
            .collect();
        assert_eq!(names, vec!["keep".to_string()]);
    }

    #[test]
    fn unknown_table_and_column_are_invalid_arguments() {
        let db = open_db();
        assert!(matches!(
            db.insert("missing", Row::new()),
            Err(EbbError::InvalidArgument(_))
        ));
        assert!(matches!(
            db.insert("users", row(&[("bogus", text("x"))])),
            Err(EbbError::InvalidArgument(_))
        ));
        assert!(matches!(
            db.query(&Query::table("missing")),
            Err(EbbError::InvalidArgument(_))
        ));
    }

    #[test]
    fn max_length_is_enforced() {
        let db = open_db();
        let long = "x".repeat(200);
        assert!(matches!(
            db.insert("users", row(&[("email", text(&long))])),
            Err(EbbError::InvalidArgument(_))
        ));
    }

    #[test]
    fn unique_violation_surfaces_as_constraint() {
        let db = open_db();
        db.insert("users", row(&[("email", text("dup@x"))])).unwrap();
        let err = db
            .insert("users", row(&[("email", text("dup@x"))]))
            .unwrap_err();
        assert!(err.is_constraint(), "got {err:?}");
    }

    #[test]
    fn closed_engine_rejects_operations() {
        let db = open_db();
        db.close();
        assert!(matches!(
            db.insert("users", Row::new()),
            Err(EbbError::NotInitialized)
        ));
        assert!(matches!(
            db.query(&Query::table("users")),
            Err(EbbError::NotInitialized)
        ));
    }

    #[test]
    fn streams_coalesce_transactional_writes() {
        let db = open_db();
        let emissions: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = emissions.clone();
        db.stream(
            Query::table("orders").filter("status = ?", ["open"]),
            move |result| {
                sink.lock().unwrap().push(result.map(|r| r.len()).unwrap_or(usize::MAX));
            },
        )
        .unwrap();

        // One standalone insert: exactly one re-execution.
        db.insert(
            "orders",
            row(&[("status", text("open")), ("total", Value::Integer(1))]),
        )
        .unwrap();

        // One hundred inserts in one transaction: exactly one more.
        db.transaction(|session| {
            for i in 0..100 {
                session.insert(
                    "orders",
                    row(&[("status", text("open")), ("total", Value::Integer(i))]),
                )?;
            }
            Ok(())
        })
        .unwrap();

        assert_eq!(*emissions.lock().unwrap(), vec![0, 1, 101]);
    }

    #[test]
    fn bulk_load_notifies_streams_but_never_dirties() {
        let db = open_db();
        let emissions: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = emissions.clone();
        db.stream(Query::table("users"), move |result| {
            sink.lock().unwrap().push(result.map(|r| r.len()).unwrap_or(usize::MAX));
        })
        .unwrap();

        db.bulk_load(
            "users",
            &[
                row(&[(SYSTEM_ID, text("srv-1")), ("name", text("a"))]),
                row(&[(SYSTEM_ID, text("srv-2")), ("name", text("b"))]),
            ],
            ConstraintPolicy::Throw,
        )
        .unwrap();

        assert_eq!(*emissions.lock().unwrap(), vec![0, 2]);
        assert!(db.drain_dirty(10).unwrap().is_empty());
    }

    #[test]
    fn clear_acked_respects_supersession() {
        let db = open_db();
        let sid = db.insert("users", row(&[("name", text("a"))])).unwrap();
        let drained = db.drain_dirty(10).unwrap();
        assert_eq!(drained.len(), 1);

        // A newer local write lands after the drain.
        db.update(
            "users",
            row(&[("name", text("b"))]),
            Some("\"system_id\" = ?"),
            &[text(&sid)],
        )
        .unwrap();

        // Acking the drained batch must NOT clear the superseding marker.
        db.clear_acked(&drained, &drained[0].hlc).unwrap();
        assert!(db.dirty_row("users", &sid).unwrap().is_some());

        // Acking past the new marker clears it.
        let newer = db.dirty_row("users", &sid).unwrap().unwrap();
        db.clear_acked(&[newer.clone()], &newer.hlc).unwrap();
        assert!(db.dirty_row("users", &sid).unwrap().is_none());
    }

    #[test]
    fn sync_cursor_round_trips() {
        let db = open_db();
        assert!(db.sync_cursor("users").unwrap().is_none());
        let cursor = Hlc::new(500, 2, "srv");
        db.set_sync_cursor("users", &cursor).unwrap();
        assert_eq!(db.sync_cursor("users").unwrap(), Some(cursor.clone()));

        let newer = Hlc::new(900, 0, "srv");
        db.set_sync_cursor("users", &newer).unwrap();
        assert_eq!(db.sync_cursor("users").unwrap(), Some(newer));
    }

    #[test]
    fn export_reopens_with_identical_rows_and_metadata() {
        let db = open_db();
        let sid = db
            .insert(
                "users",
                row(&[("name", text("Alice")), ("email", text("a@x"))]),
            )
            .unwrap();
        let original = db.fetch_row("users", &sid).unwrap().unwrap();

        let bytes = db.export_database().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("copy.db");
        std::fs::write(&path, &bytes).unwrap();

        let reopened = Database::open(DbConfig::file(&path, "n2"), schema()).unwrap();
        let restored = reopened.fetch_row("users", &sid).unwrap().unwrap();
        assert_eq!(restored.fields(), original.fields());
    }
}
