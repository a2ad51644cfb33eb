use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use tracing::{debug, warn};

use ebb_core::dirty::{clear_dirty, get_dirty_row};
use ebb_core::error::{EbbError, Result};
use ebb_core::hlc::{Hlc, HlcClock};
use ebb_core::schema::{
    is_shadow_column, shadow_column, TableDef, SYSTEM_CREATED_AT, SYSTEM_ID,
    SYSTEM_IS_LOCAL_ORIGIN, SYSTEM_TOMBSTONE, SYSTEM_VERSION,
};
use ebb_core::value::{Row, Value};

use crate::plan::plan_update;
use crate::report::{BulkLoadReport, ConstraintPolicy};

// ---------------------------------------------------------------------------
// bulk_load
// ---------------------------------------------------------------------------

enum Outcome {
    Inserted,
    Updated,
    Unchanged,
    Deleted,
}

/// Apply a batch of server rows to `table` with per-column LWW resolution.
///
/// Runs against the caller's connection; the engine wraps the call in a
/// transaction so that under [`ConstraintPolicy::Throw`] a violation rolls
/// back the whole batch. Rows applied here never mark themselves dirty —
/// they came FROM the server — but each row reconciles any queued dirty
/// marker whose HLC the incoming `system_version` dominates.
pub fn bulk_load(
    conn: &Connection,
    table: &TableDef,
    clock: &HlcClock,
    rows: &[Row],
    policy: ConstraintPolicy,
) -> Result<BulkLoadReport> {
    let mut report = BulkLoadReport::new();

    for incoming in rows {
        let system_id = incoming
            .get(SYSTEM_ID)
            .and_then(|v| v.as_text())
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        let Some(system_id) = system_id else {
            report.warn(None, "incoming row has no system_id");
            report.skipped += 1;
            continue;
        };

        match apply_row(conn, table, clock, &system_id, incoming, &mut report) {
            Ok(Outcome::Inserted) => report.inserted += 1,
            Ok(Outcome::Updated) => report.updated += 1,
            Ok(Outcome::Unchanged) => report.unchanged += 1,
            Ok(Outcome::Deleted) => report.deleted += 1,
            Err(err) if policy == ConstraintPolicy::Skip && is_recoverable(&err) => {
                warn!(table = %table.name, row_id = %system_id, error = %err,
                      "skipping server row");
                report.warn(Some(&system_id), err.to_string());
                report.skipped += 1;
            }
            Err(err) if policy == ConstraintPolicy::Skip => {
                // The policy already absorbed everything it may absorb;
                // whatever failed here is not row-local.
                return Err(EbbError::Merge(format!("row {system_id}: {err}")));
            }
            Err(err) => return Err(err),
        }
    }

    debug!(
        table = %table.name,
        inserted = report.inserted,
        updated = report.updated,
        unchanged = report.unchanged,
        deleted = report.deleted,
        skipped = report.skipped,
        "bulk load applied"
    );
    Ok(report)
}

/// Failures the Skip policy may demote to per-row warnings: constraint
/// violations and malformed incoming HLCs. Anything else aborts the batch.
fn is_recoverable(err: &EbbError) -> bool {
    matches!(
        err,
        EbbError::Constraint { .. } | EbbError::InvalidArgument(_)
    )
}

fn apply_row(
    conn: &Connection,
    table: &TableDef,
    clock: &HlcClock,
    system_id: &str,
    incoming: &Row,
    report: &mut BulkLoadReport,
) -> Result<Outcome> {
    // Fold the server's row version into our clock so that every local
    // stamp issued from here on dominates it.
    if let Some(version_text) = hlc_text(incoming.get(SYSTEM_VERSION)) {
        clock.observe(&Hlc::parse(version_text)?);
    }

    // Server-side delete: remove the row and any queued upload for it.
    if incoming
        .get(SYSTEM_TOMBSTONE)
        .is_some_and(Value::is_truthy)
    {
        let changed = conn
            .execute(
                &format!(
                    "DELETE FROM \"{}\" WHERE \"{SYSTEM_ID}\" = ?1",
                    table.name
                ),
                params![system_id],
            )
            .map_err(|e| EbbError::from_write(&table.name, Some(system_id), e))?;
        clear_dirty(conn, &table.name, system_id)?;
        return Ok(if changed > 0 {
            Outcome::Deleted
        } else {
            Outcome::Unchanged
        });
    }

    let outcome = match fetch_local(conn, table, system_id)? {
        None => {
            insert_remote(conn, table, clock, system_id, incoming, report)?;
            Outcome::Inserted
        }
        Some(local) => {
            let plan = plan_update(table, &local, incoming)?;
            for column in &plan.ignored {
                report.warn(Some(system_id), format!("unknown column {column}"));
            }
            if plan.changes.is_empty() {
                Outcome::Unchanged
            } else {
                // Fold every accepted shadow into the clock so the fresh
                // system_version stamp dominates them all.
                for (name, value) in &plan.changes {
                    if is_shadow_column(name) {
                        if let Some(text) = value.as_text() {
                            clock.observe(&Hlc::parse(text)?);
                        }
                    }
                }
                update_remote(conn, table, clock, system_id, plan.changes)?;
                Outcome::Updated
            }
        }
    };

    reconcile_dirty(conn, &table.name, system_id, incoming)?;
    Ok(outcome)
}

// ---------------------------------------------------------------------------
// Row lookup
// ---------------------------------------------------------------------------

fn fetch_local(conn: &Connection, table: &TableDef, system_id: &str) -> Result<Option<Row>> {
    let sql = format!(
        "SELECT * FROM \"{}\" WHERE \"{SYSTEM_ID}\" = ?1",
        table.name
    );
    let mut stmt = conn.prepare(&sql)?;
    let names: Vec<String> = stmt
        .column_names()
        .iter()
        .map(|s| s.to_string())
        .collect();

    let row = stmt
        .query_row(params![system_id], |r| {
            let mut map = Row::new();
            for (i, name) in names.iter().enumerate() {
                map.insert(name.clone(), r.get::<_, Value>(i)?);
            }
            Ok(map)
        })
        .optional()?;
    Ok(row)
}

// ---------------------------------------------------------------------------
// Insert / update without dirty marking
// ---------------------------------------------------------------------------

fn insert_remote(
    conn: &Connection,
    table: &TableDef,
    clock: &HlcClock,
    system_id: &str,
    incoming: &Row,
    report: &mut BulkLoadReport,
) -> Result<()> {
    let mut values = Row::new();
    for (name, value) in incoming {
        if name == SYSTEM_TOMBSTONE {
            continue;
        }
        if !table.is_known_column(name) {
            report.warn(Some(system_id), format!("unknown column {name}"));
            continue;
        }
        values.insert(name.clone(), value.clone());
    }

    values.insert(SYSTEM_ID.into(), Value::Text(system_id.to_string()));
    values.insert(SYSTEM_IS_LOCAL_ORIGIN.into(), Value::Integer(0));

    if hlc_text(values.get(SYSTEM_VERSION)).is_none() {
        values.insert(SYSTEM_VERSION.into(), (&clock.now()).into());
    }
    if hlc_text(values.get(SYSTEM_CREATED_AT)).is_none() {
        values.insert(SYSTEM_CREATED_AT.into(), (&clock.now()).into());
    }
    for column in table.lww_columns() {
        let shadow = shadow_column(&column.name);
        if hlc_text(values.get(&shadow)).is_none() {
            values.insert(shadow, (&clock.now()).into());
        }
    }

    let columns: Vec<String> = values.keys().map(|k| format!("\"{k}\"")).collect();
    let placeholders: Vec<&str> = values.keys().map(|_| "?").collect();
    let sql = format!(
        "INSERT INTO \"{}\" ({}) VALUES ({})",
        table.name,
        columns.join(", "),
        placeholders.join(", ")
    );

    conn.execute(&sql, params_from_iter(values.values()))
        .map_err(|e| EbbError::from_write(&table.name, Some(system_id), e))?;
    Ok(())
}

fn update_remote(
    conn: &Connection,
    table: &TableDef,
    clock: &HlcClock,
    system_id: &str,
    mut changes: Row,
) -> Result<()> {
    changes.insert(SYSTEM_VERSION.into(), (&clock.now()).into());

    let assignments: Vec<String> = changes.keys().map(|k| format!("\"{k}\" = ?")).collect();
    let sql = format!(
        "UPDATE \"{}\" SET {} WHERE \"{SYSTEM_ID}\" = ?",
        table.name,
        assignments.join(", ")
    );

    let bound: Vec<Value> = changes
        .values()
        .cloned()
        .chain(std::iter::once(Value::Text(system_id.to_string())))
        .collect();

    conn.execute(&sql, params_from_iter(bound))
        .map_err(|e| EbbError::from_write(&table.name, Some(system_id), e))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Dirty reconciliation
// ---------------------------------------------------------------------------

/// Clear a queued dirty marker only when the server's row version dominates
/// it: anything less means the queue still holds a delta the server has not
/// seen, and clearing it would lose the upload.
fn reconcile_dirty(
    conn: &Connection,
    table_name: &str,
    system_id: &str,
    incoming: &Row,
) -> Result<()> {
    let Some(entry) = get_dirty_row(conn, table_name, system_id)? else {
        return Ok(());
    };
    let Some(version_text) = hlc_text(incoming.get(SYSTEM_VERSION)) else {
        return Ok(());
    };
    if Hlc::parse(version_text)? >= entry.hlc {
        clear_dirty(conn, table_name, system_id)?;
    }
    Ok(())
}

fn hlc_text(value: Option<&Value>) -> Option<&str> {
    value.and_then(|v| v.as_text()).filter(|s| !s.is_empty())
}
