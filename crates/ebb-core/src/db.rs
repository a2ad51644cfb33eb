use std::time::Duration;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OpenFlags, Transaction};
use uuid::Uuid;

use crate::error::{EbbError, Result};

// ---------------------------------------------------------------------------
// Pool type aliases
// ---------------------------------------------------------------------------

pub type DbPool = Pool<SqliteConnectionManager>;
pub type DbConnection = r2d2::PooledConnection<SqliteConnectionManager>;

// ---------------------------------------------------------------------------
// Pool constructors
// ---------------------------------------------------------------------------

/// Open a connection pool backed by a file-based SQLite database.
///
/// Every connection enables foreign keys, WAL journaling, and the given
/// busy timeout.
pub fn create_pool(db_path: &str, max_size: u32, busy_timeout: Duration) -> Result<DbPool> {
    let manager = SqliteConnectionManager::file(db_path).with_init(move |conn| {
        conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA journal_mode = WAL;")?;
        conn.busy_timeout(busy_timeout)?;
        Ok(())
    });

    Pool::builder()
        .max_size(max_size)
        .build(manager)
        .map_err(|e| EbbError::Internal(e.to_string()))
}

/// Open a connection pool over a single shared in-memory SQLite database.
///
/// A named shared-cache URI makes every pooled connection see the same
/// database; the pool keeps connections alive so the database survives for
/// the pool's lifetime.
pub fn create_memory_pool(max_size: u32) -> Result<DbPool> {
    let uri = format!("file:ebbmem-{}?mode=memory&cache=shared", Uuid::new_v4());
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_URI
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;

    let manager = SqliteConnectionManager::file(uri)
        .with_flags(flags)
        .with_init(|conn| {
            conn.execute_batch("PRAGMA foreign_keys = ON;")?;
            Ok(())
        });

    Pool::builder()
        .max_size(max_size)
        .build(manager)
        .map_err(|e| EbbError::Internal(e.to_string()))
}

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

/// Execute `f` inside a transaction; commit on `Ok`, roll back on `Err`.
///
/// Uses an unchecked transaction so callers holding `&Connection` can
/// compose; the engine serializes writers above this layer.
pub fn with_tx<T>(
    conn: &Connection,
    f: impl FnOnce(&Transaction<'_>) -> Result<T>,
) -> Result<T> {
    let tx = conn.unchecked_transaction()?;
    let result = f(&tx)?;
    tx.commit()?;
    Ok(result)
}

// ---------------------------------------------------------------------------
// Export
// ---------------------------------------------------------------------------

/// Produce a byte image of the live database, suitable for writing to disk
/// and reopening. Runs the backup API against a scratch file so WAL content
/// is folded in.
pub fn export_database(conn: &Connection) -> Result<Vec<u8>> {
    let scratch = std::env::temp_dir().join(format!("ebb-export-{}.sqlite", Uuid::new_v4()));

    let result = (|| {
        let mut dst = Connection::open(&scratch)?;
        let backup = rusqlite::backup::Backup::new(conn, &mut dst)?;
        backup.run_to_completion(64, Duration::from_millis(5), None)?;
        drop(backup);
        dst.close().map_err(|(_, e)| EbbError::Storage(e))?;
        Ok(std::fs::read(&scratch)?)
    })();

    let _ = std::fs::remove_file(&scratch);
    result
}
