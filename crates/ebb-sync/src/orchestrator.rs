use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use ebb_core::dirty::DirtyRow;
use ebb_core::hlc::Hlc;
use ebb_core::schema::SYSTEM_VERSION;
use ebb_core::Result;
use ebb_engine::Database;
use ebb_merge::ConstraintPolicy;

use crate::retry::{ExponentialBackoff, RetryStrategy};
use crate::scheduler::TaskScheduler;
use crate::transport::{SyncAck, SyncTransport, UploadBatch, UploadEntry};

// ---------------------------------------------------------------------------
// Options / report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Upper bound on dirty rows drained into one upload batch.
    pub batch_size: usize,
    /// Constraint policy handed to `bulk_load` on the pull side.
    pub policy: ConstraintPolicy,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            batch_size: 100,
            policy: ConstraintPolicy::default(),
        }
    }
}

/// What one sync cycle accomplished.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncReport {
    /// Entries uploaded and acknowledged.
    pub pushed: usize,
    /// Server rows that mutated local state.
    pub pulled: usize,
}

// ---------------------------------------------------------------------------
// SyncOrchestrator
// ---------------------------------------------------------------------------

/// Drives the push/pull loop: the dirty-row queue feeds `send`, and every
/// `fetch` result goes through the merge engine. The orchestrator holds no
/// protocol state beyond the per-table cursors persisted in the engine.
pub struct SyncOrchestrator {
    db: Arc<Database>,
    transport: Box<dyn SyncTransport>,
    retry: Box<dyn RetryStrategy>,
    options: SyncOptions,
}

impl SyncOrchestrator {
    pub fn new(db: Arc<Database>, transport: impl SyncTransport + 'static) -> Self {
        Self {
            db,
            transport: Box::new(transport),
            retry: Box::new(ExponentialBackoff::default()),
            options: SyncOptions::default(),
        }
    }

    pub fn with_retry(mut self, retry: impl RetryStrategy + 'static) -> Self {
        self.retry = Box::new(retry);
        self
    }

    pub fn with_options(mut self, options: SyncOptions) -> Self {
        self.options = options;
        self
    }

    /// One full cycle: push queued local changes, then pull and merge
    /// server rows for every schema table.
    pub fn sync_cycle(&self) -> Result<SyncReport> {
        let pushed = self.push()?;
        let pulled = self.pull()?;
        debug!(pushed, pulled, "sync cycle complete");
        Ok(SyncReport { pushed, pulled })
    }

    /// Register the cycle as a named periodic task on the host's scheduler.
    pub fn register_periodic(
        self: Arc<Self>,
        scheduler: &mut TaskScheduler,
        interval: Duration,
        priority: i32,
    ) {
        scheduler.register("sync_cycle", priority, interval, move || {
            self.sync_cycle().map(|_| ())
        });
    }

    // -----------------------------------------------------------------------
    // Push
    // -----------------------------------------------------------------------

    fn push(&self) -> Result<usize> {
        let drained = self.db.drain_dirty(self.options.batch_size)?;
        if drained.is_empty() {
            return Ok(0);
        }

        let batch = self.build_batch(&drained)?;
        if batch.is_empty() {
            return Ok(0);
        }

        let ack = self.send_with_retry(&batch)?;
        self.db.clear_acked(&drained, &ack.hlc)?;
        Ok(batch.len())
    }

    fn build_batch(&self, drained: &[DirtyRow]) -> Result<UploadBatch> {
        let mut batch = UploadBatch::default();
        for entry in drained {
            let row = if entry.tombstone {
                None
            } else {
                match self.db.fetch_row(&entry.table, &entry.row_id)? {
                    Some(record) => Some(record.fields().clone()),
                    None => {
                        // The row vanished after the marker was written and
                        // before this drain; nothing sensible to upload.
                        warn!(table = %entry.table, row_id = %entry.row_id,
                              "dirty row has no backing data; skipping upload");
                        continue;
                    }
                }
            };
            batch.entries.push(UploadEntry {
                table: entry.table.clone(),
                row_id: entry.row_id.clone(),
                hlc: entry.hlc.clone(),
                is_full_row: entry.is_full_row,
                tombstone: entry.tombstone,
                row,
            });
        }
        Ok(batch)
    }

    fn send_with_retry(&self, batch: &UploadBatch) -> Result<SyncAck> {
        let mut attempt = 0u32;
        loop {
            match self.transport.send(batch) {
                Ok(ack) => return Ok(ack),
                Err(err) => {
                    attempt += 1;
                    match self.retry.next_delay(attempt) {
                        Some(delay) => {
                            warn!(attempt, error = %err, "upload failed; retrying");
                            std::thread::sleep(delay);
                        }
                        None => return Err(err),
                    }
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Pull
    // -----------------------------------------------------------------------

    fn pull(&self) -> Result<usize> {
        let tables: Vec<String> = self
            .db
            .schema()
            .tables
            .iter()
            .map(|t| t.name.clone())
            .collect();

        let mut applied = 0;
        for table in tables {
            let cursor = self.db.sync_cursor(&table)?;
            let rows = self.fetch_with_retry(&table, cursor.as_ref())?;
            if rows.is_empty() {
                continue;
            }

            let report = self.db.bulk_load(&table, &rows, self.options.policy)?;
            applied += report.changed();

            // Advance the cursor to the newest version the server handed us
            // so the next fetch resumes from there.
            let newest = rows
                .iter()
                .filter_map(|row| row.get(SYSTEM_VERSION))
                .filter_map(|v| v.as_text())
                .filter_map(|text| Hlc::parse(text).ok())
                .max();
            if let Some(newest) = newest {
                if cursor.as_ref().map_or(true, |c| newest > *c) {
                    self.db.set_sync_cursor(&table, &newest)?;
                }
            }
        }
        Ok(applied)
    }

    fn fetch_with_retry(
        &self,
        table: &str,
        last_seen: Option<&Hlc>,
    ) -> Result<Vec<ebb_core::Row>> {
        let mut attempt = 0u32;
        loop {
            match self.transport.fetch(table, last_seen) {
                Ok(rows) => return Ok(rows),
                Err(err) => {
                    attempt += 1;
                    match self.retry.next_delay(attempt) {
                        Some(delay) => {
                            warn!(attempt, table, error = %err, "fetch failed; retrying");
                            std::thread::sleep(delay);
                        }
                        None => return Err(err),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use ebb_core::schema::{ColumnDef, Schema, TableDef, SYSTEM_ID};
    use ebb_core::value::{Row, Value};
    use ebb_core::EbbError;
    use ebb_engine::DbConfig;

    fn schema() -> Schema {
        Schema::new().table(
            TableDef::new("users")
                .column(ColumnDef::text("name").lww())
                .column(ColumnDef::integer("age")),
        )
    }

    fn open_db() -> Arc<Database> {
        Arc::new(Database::open(DbConfig::memory("n1").pool_size(4), schema()).unwrap())
    }

    fn text(s: &str) -> Value {
        Value::Text(s.to_string())
    }

    fn row(pairs: &[(&str, Value)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[derive(Default)]
    struct MockTransport {
        server_rows: Mutex<HashMap<String, Vec<Row>>>,
        sent: Mutex<Vec<UploadBatch>>,
        fetch_calls: Mutex<Vec<(String, Option<Hlc>)>>,
        failing_sends: Mutex<u32>,
    }

    impl MockTransport {
        fn with_server_rows(table: &str, rows: Vec<Row>) -> Self {
            let transport = Self::default();
            transport
                .server_rows
                .lock()
                .unwrap()
                .insert(table.to_string(), rows);
            transport
        }

        fn fail_next_sends(self, count: u32) -> Self {
            *self.failing_sends.lock().unwrap() = count;
            self
        }
    }

    impl SyncTransport for Arc<MockTransport> {
        fn fetch(&self, table: &str, last_seen: Option<&Hlc>) -> Result<Vec<Row>> {
            self.fetch_calls
                .lock()
                .unwrap()
                .push((table.to_string(), last_seen.cloned()));
            Ok(self
                .server_rows
                .lock()
                .unwrap()
                .get(table)
                .cloned()
                .unwrap_or_default())
        }

        fn send(&self, batch: &UploadBatch) -> Result<SyncAck> {
            let mut failing = self.failing_sends.lock().unwrap();
            if *failing > 0 {
                *failing -= 1;
                return Err(EbbError::Internal("transport down".into()));
            }
            self.sent.lock().unwrap().push(batch.clone());
            let hlc = batch
                .max_hlc()
                .cloned()
                .unwrap_or_else(|| Hlc::new(0, 0, "srv"));
            Ok(SyncAck { hlc })
        }
    }

    fn orchestrator(db: Arc<Database>, transport: Arc<MockTransport>) -> SyncOrchestrator {
        SyncOrchestrator::new(db, transport).with_retry(crate::retry::NoRetry)
    }

    #[test]
    fn push_uploads_full_rows_and_clears_the_queue() {
        let db = open_db();
        db.insert("users", row(&[("name", text("Alice"))])).unwrap();
        db.insert("users", row(&[("name", text("Bob"))])).unwrap();

        let orchestrator = orchestrator(db.clone(), Arc::new(MockTransport::default()));
        let report = orchestrator.sync_cycle().unwrap();
        assert_eq!(report.pushed, 2);
        assert!(db.drain_dirty(10).unwrap().is_empty());
    }

    #[test]
    fn pushed_batches_carry_payload_and_tombstones() {
        let db = open_db();
        let keep = db.insert("users", row(&[("name", text("keep"))])).unwrap();
        let gone = db.insert("users", row(&[("name", text("gone"))])).unwrap();
        db.delete("users", Some("\"system_id\" = ?"), &[text(&gone)])
            .unwrap();

        let transport = Arc::new(MockTransport::default());
        let orchestrator = orchestrator(db.clone(), transport.clone());
        orchestrator.sync_cycle().unwrap();

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);

        let entries = &sent[0].entries;
        assert_eq!(entries.len(), 2);
        let keep_entry = entries.iter().find(|e| e.row_id == keep).unwrap();
        assert!(!keep_entry.tombstone);
        assert!(keep_entry.row.is_some());
        let gone_entry = entries.iter().find(|e| e.row_id == gone).unwrap();
        assert!(gone_entry.tombstone);
        assert!(gone_entry.row.is_none());
    }

    #[test]
    fn pull_merges_rows_and_advances_the_cursor() {
        let db = open_db();
        let server = vec![row(&[
            (SYSTEM_ID, text("srv-1")),
            ("name", text("remote")),
            (SYSTEM_VERSION, text("100:0:srv")),
        ])];
        let transport = Arc::new(MockTransport::with_server_rows("users", server));
        let orchestrator = orchestrator(db.clone(), transport);

        let report = orchestrator.sync_cycle().unwrap();
        assert_eq!(report.pulled, 1);
        assert!(db.fetch_row("users", "srv-1").unwrap().is_some());
        assert_eq!(
            db.sync_cursor("users").unwrap(),
            Some(Hlc::new(100, 0, "srv"))
        );
    }

    #[test]
    fn second_cycle_fetches_from_the_persisted_cursor() {
        let db = open_db();
        let server = vec![row(&[
            (SYSTEM_ID, text("srv-1")),
            (SYSTEM_VERSION, text("100:0:srv")),
        ])];
        let transport = Arc::new(MockTransport::with_server_rows("users", server));
        let orchestrator = orchestrator(db.clone(), transport.clone());

        orchestrator.sync_cycle().unwrap();
        orchestrator.sync_cycle().unwrap();

        let calls = transport.fetch_calls.lock().unwrap();
        assert_eq!(calls[0], ("users".to_string(), None));
        assert_eq!(
            calls[1],
            ("users".to_string(), Some(Hlc::new(100, 0, "srv")))
        );
    }

    #[test]
    fn failed_send_without_retry_keeps_the_queue() {
        let db = open_db();
        db.insert("users", row(&[("name", text("Alice"))])).unwrap();

        let transport = Arc::new(MockTransport::default().fail_next_sends(1));
        let orchestrator = orchestrator(db.clone(), transport);
        assert!(orchestrator.sync_cycle().is_err());
        assert_eq!(db.drain_dirty(10).unwrap().len(), 1);
    }

    #[test]
    fn retry_strategy_recovers_transient_send_failures() {
        let db = open_db();
        db.insert("users", row(&[("name", text("Alice"))])).unwrap();

        let transport = Arc::new(MockTransport::default().fail_next_sends(2));
        let orchestrator = SyncOrchestrator::new(db.clone(), transport.clone()).with_retry(
            ExponentialBackoff {
                base: Duration::ZERO,
                max_delay: Duration::ZERO,
                max_attempts: 5,
            },
        );

        let report = orchestrator.sync_cycle().unwrap();
        assert_eq!(report.pushed, 1);
        assert!(db.drain_dirty(10).unwrap().is_empty());
        assert_eq!(transport.sent.lock().unwrap().len(), 1);
    }

    #[test]
    fn periodic_registration_runs_through_the_scheduler() {
        let db = open_db();
        db.insert("users", row(&[("name", text("Alice"))])).unwrap();

        let orchestrator = Arc::new(orchestrator(db.clone(), Arc::new(MockTransport::default())));
        let mut scheduler = TaskScheduler::new();
        orchestrator.register_periodic(&mut scheduler, Duration::from_secs(60), 5);

        let ran = scheduler.run_due(std::time::Instant::now() + Duration::from_millis(1));
        assert_eq!(ran, 1);
        assert!(db.drain_dirty(10).unwrap().is_empty());
    }
}
