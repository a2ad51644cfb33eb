use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;
use crate::hlc::Hlc;

/// Durable queue of rows awaiting upload, colocated with the data so that
/// application writes and their dirty markers commit atomically.
pub const DIRTY_ROWS_TABLE: &str = "__dirty_rows";

// ---------------------------------------------------------------------------
// DirtyRow
// ---------------------------------------------------------------------------

/// One queued outbound change: the newest local mutation of a row that the
/// server has not acknowledged yet.
#[derive(Debug, Clone, PartialEq)]
pub struct DirtyRow {
    pub table: String,
    /// The row's `system_id`.
    pub row_id: String,
    /// HLC stamped on the mutation that queued this entry.
    pub hlc: Hlc,
    /// `true` when the whole row must be uploaded (the row originated
    /// locally); `false` when only changed columns need to travel.
    pub is_full_row: bool,
    /// Local delete awaiting upload; the data row itself is already gone.
    pub tombstone: bool,
}

impl DirtyRow {
    pub fn new(table: impl Into<String>, row_id: impl Into<String>, hlc: Hlc) -> Self {
        Self {
            table: table.into(),
            row_id: row_id.into(),
            hlc,
            is_full_row: true,
            tombstone: false,
        }
    }

    pub fn partial(mut self) -> Self {
        self.is_full_row = false;
        self
    }

    pub fn tombstone(mut self) -> Self {
        self.tombstone = true;
        self
    }
}

// ---------------------------------------------------------------------------
// Store operations
// ---------------------------------------------------------------------------

/// UPSERT a dirty marker. An existing entry is replaced only when the new
/// HLC is strictly newer; older or equal marks are no-ops so the queue
/// always describes the latest un-synced state of the row.
pub fn mark_dirty(conn: &Connection, entry: &DirtyRow) -> Result<()> {
    if let Some(existing) = get_dirty_row(conn, &entry.table, &entry.row_id)? {
        if entry.hlc <= existing.hlc {
            return Ok(());
        }
    }
    conn.execute(
        "INSERT INTO __dirty_rows (table_name, row_id, hlc, is_full_row, tombstone)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT (table_name, row_id) DO UPDATE SET
             hlc         = excluded.hlc,
             is_full_row = excluded.is_full_row,
             tombstone   = excluded.tombstone",
        params![
            entry.table,
            entry.row_id,
            entry.hlc.to_string(),
            entry.is_full_row as i64,
            entry.tombstone as i64,
        ],
    )?;
    Ok(())
}

pub fn get_dirty_row(conn: &Connection, table: &str, row_id: &str) -> Result<Option<DirtyRow>> {
    let row = conn
        .query_row(
            "SELECT table_name, row_id, hlc, is_full_row, tombstone
             FROM __dirty_rows
             WHERE table_name = ?1 AND row_id = ?2",
            params![table, row_id],
            row_to_entry,
        )
        .optional()?;

    match row {
        None => Ok(None),
        Some((table, row_id, hlc, is_full_row, tombstone)) => Ok(Some(DirtyRow {
            table,
            row_id,
            hlc: Hlc::parse(&hlc)?,
            is_full_row,
            tombstone,
        })),
    }
}

pub fn clear_dirty(conn: &Connection, table: &str, row_id: &str) -> Result<()> {
    conn.execute(
        "DELETE FROM __dirty_rows WHERE table_name = ?1 AND row_id = ?2",
        params![table, row_id],
    )?;
    Ok(())
}

pub fn dirty_count(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row("SELECT COUNT(*) FROM __dirty_rows", [], |r| r.get(0))?)
}

/// Return up to `batch_size` entries ordered by `(table_name, hlc)`.
///
/// Entries are NOT removed: the upload path clears them only once the
/// server acknowledges the batch. The SQL scan orders on the HLC text for
/// index locality; the batch is re-sorted on parsed HLCs because text order
/// diverges from causal order once logical counters reach two digits.
pub fn drain(conn: &Connection, batch_size: usize) -> Result<Vec<DirtyRow>> {
    let mut stmt = conn.prepare(
        "SELECT table_name, row_id, hlc, is_full_row, tombstone
         FROM __dirty_rows
         ORDER BY table_name ASC, hlc ASC
         LIMIT ?1",
    )?;
    let rows = stmt
        .query_map(params![batch_size as i64], row_to_entry)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut entries = Vec::with_capacity(rows.len());
    for (table, row_id, hlc, is_full_row, tombstone) in rows {
        entries.push(DirtyRow {
            table,
            row_id,
            hlc: Hlc::parse(&hlc)?,
            is_full_row,
            tombstone,
        });
    }
    entries.sort_by(|a, b| a.table.cmp(&b.table).then_with(|| a.hlc.cmp(&b.hlc)));
    Ok(entries)
}

type EntryRow = (String, String, String, bool, bool);

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<EntryRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get::<_, i64>(3)? != 0,
        row.get::<_, i64>(4)? != 0,
    ))
}
