use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use tracing::warn;
use uuid::Uuid;

use ebb_core::db::DbPool;
use ebb_core::error::{EbbError, Result};

use crate::query::{execute_query, Query};
use crate::record::Record;

// ---------------------------------------------------------------------------
// Stream types
// ---------------------------------------------------------------------------

pub type StreamId = Uuid;

/// Subscriber callback. Receives the new result snapshot after each
/// re-execution that changed the result set, or the error when a
/// re-execution failed (the stream stays subscribed either way).
pub type StreamCallback = Arc<dyn Fn(Result<Vec<Record>>) + Send + Sync>;

struct StreamEntry {
    query: Query,
    signature: String,
    callback: StreamCallback,
    /// Result snapshot from the last successful execution; `None` until the
    /// first run, which therefore always emits.
    last: Option<Vec<Record>>,
}

// ---------------------------------------------------------------------------
// StreamManager
// ---------------------------------------------------------------------------

/// Engine-scoped registry of live queries.
///
/// The manager owns every stream entry; handles hold ids only. A table
/// write enqueues one pending re-execution per affected stream (coalesced),
/// and the engine pumps the queue after each commit, in commit order.
pub struct StreamManager {
    inner: Mutex<Inner>,
}

struct Inner {
    streams: HashMap<StreamId, StreamEntry>,
    by_table: HashMap<String, HashSet<StreamId>>,
    pending: VecDeque<StreamId>,
}

impl Default for StreamManager {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamManager {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                streams: HashMap::new(),
                by_table: HashMap::new(),
                pending: VecDeque::new(),
            }),
        }
    }

    /// Register a stream and queue its first execution.
    pub fn register(
        &self,
        query: Query,
        callback: impl Fn(Result<Vec<Record>>) + Send + Sync + 'static,
    ) -> StreamId {
        let id = Uuid::new_v4();
        let mut inner = self.lock();
        inner
            .by_table
            .entry(query.table.clone())
            .or_default()
            .insert(id);
        let signature = query.signature();
        inner.streams.insert(
            id,
            StreamEntry {
                query,
                signature,
                callback: Arc::new(callback),
                last: None,
            },
        );
        inner.pending.push_back(id);
        id
    }

    /// Swap the stream's query. Returns `false` without touching anything
    /// when the new query has the same signature — widget-driven rebuilds
    /// that re-ask the same question must not tear the stream down.
    pub fn update_query(&self, id: StreamId, query: Query) -> bool {
        let mut inner = self.lock();
        let Some(entry) = inner.streams.get(&id) else {
            return false;
        };
        let signature = query.signature();
        if entry.signature == signature {
            return false;
        }

        let old_table = entry.query.table.clone();
        if old_table != query.table {
            if let Some(ids) = inner.by_table.get_mut(&old_table) {
                ids.remove(&id);
                if ids.is_empty() {
                    inner.by_table.remove(&old_table);
                }
            }
            inner
                .by_table
                .entry(query.table.clone())
                .or_default()
                .insert(id);
        }

        let entry = inner.streams.get_mut(&id).expect("entry checked above");
        entry.query = query;
        entry.signature = signature;
        entry.last = None;
        if !inner.pending.contains(&id) {
            inner.pending.push_back(id);
        }
        true
    }

    /// Remove the stream, its reverse-index references, and any pending
    /// re-execution.
    pub fn dispose(&self, id: StreamId) {
        let mut inner = self.lock();
        if let Some(entry) = inner.streams.remove(&id) {
            if let Some(ids) = inner.by_table.get_mut(&entry.query.table) {
                ids.remove(&id);
                if ids.is_empty() {
                    inner.by_table.remove(&entry.query.table);
                }
            }
        }
        inner.pending.retain(|pending| *pending != id);
    }

    /// Queue a re-execution for every stream over `table`. A stream that is
    /// already pending is not queued twice.
    pub fn notify_table_changed(&self, table: &str) {
        let mut inner = self.lock();
        let Some(ids) = inner.by_table.get(table) else {
            return;
        };
        let mut to_queue: Vec<StreamId> = ids
            .iter()
            .filter(|id| !inner.pending.contains(*id))
            .copied()
            .collect();
        to_queue.sort(); // deterministic order for same-write fan-out
        inner.pending.extend(to_queue);
    }

    pub fn stream_count(&self) -> usize {
        self.lock().streams.len()
    }

    /// Drain the pending queue: re-execute each stream's SELECT on a pooled
    /// connection, diff against the cached snapshot, and emit when the
    /// result set changed. Runs on the engine's thread after commit; the
    /// mutex is released around SQL and callbacks so subscribers may call
    /// back into the engine.
    pub fn pump(&self, pool: &DbPool) {
        loop {
            let step = {
                let mut inner = self.lock();
                let Some(id) = inner.pending.pop_front() else {
                    break;
                };
                inner
                    .streams
                    .get(&id)
                    .map(|e| (id, e.query.clone(), e.callback.clone()))
            };
            let Some((id, query, callback)) = step else {
                continue; // disposed while pending
            };

            let result = pool
                .get()
                .map_err(|e| EbbError::Internal(e.to_string()))
                .and_then(|conn| execute_query(&conn, &query));

            match result {
                Ok(rows) => {
                    let emit = {
                        let mut inner = self.lock();
                        match inner.streams.get_mut(&id) {
                            None => None, // disposed mid-execution
                            Some(entry) if entry.last.as_ref() == Some(&rows) => None,
                            Some(entry) => {
                                entry.last = Some(rows.clone());
                                Some(rows)
                            }
                        }
                    };
                    if let Some(rows) = emit {
                        callback(Ok(rows));
                    }
                }
                Err(err) => {
                    warn!(table = %query.table, error = %err, "stream re-execution failed");
                    callback(Err(err));
                }
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("stream manager poisoned")
    }
}
