use ebb_core::hlc::Hlc;
use ebb_core::schema::{
    is_shadow_column, shadow_column, TableDef, SYSTEM_ID, SYSTEM_IS_LOCAL_ORIGIN,
    SYSTEM_TOMBSTONE, SYSTEM_VERSION,
};
use ebb_core::value::{Row, Value};
use ebb_core::Result;

// ---------------------------------------------------------------------------
// UpdatePlan
// ---------------------------------------------------------------------------

/// The column-level outcome of comparing one incoming server row against
/// the local row with the same `system_id`.
#[derive(Debug, Clone, Default)]
pub struct UpdatePlan {
    /// Columns (and shadows) to write. Empty means the local row already
    /// dominates the incoming one.
    pub changes: Row,
    /// Incoming columns the local schema does not know; reported upstream
    /// as warnings.
    pub ignored: Vec<String>,
}

// ---------------------------------------------------------------------------
// plan_update
// ---------------------------------------------------------------------------

/// Decide, column by column, which incoming values win.
///
/// Rules:
/// - identity and bookkeeping columns (`system_id`, `system_version`,
///   `system_is_local_origin`, declared primary-key columns, shadows, and
///   the tombstone marker) are never written through this path;
/// - an LWW column whose incoming shadow is strictly newer than the local
///   shadow (or whose local shadow is absent) takes the incoming value and
///   shadow;
/// - an LWW column arriving WITHOUT a shadow is applied unconditionally —
///   a server that does not speak per-column HLC always wins;
/// - non-LWW columns are applied unconditionally.
///
/// Entries equal to the current local value are dropped at the end, so
/// re-applying a batch plans to an empty change set.
pub fn plan_update(table: &TableDef, local: &Row, incoming: &Row) -> Result<UpdatePlan> {
    let pk = table.primary_key_columns();
    let mut plan = UpdatePlan::default();

    for (name, value) in incoming {
        if name == SYSTEM_ID
            || name == SYSTEM_VERSION
            || name == SYSTEM_IS_LOCAL_ORIGIN
            || name == SYSTEM_TOMBSTONE
            || is_shadow_column(name)
            || pk.contains(&name.as_str())
        {
            continue;
        }
        if !table.is_known_column(name) {
            plan.ignored.push(name.clone());
            continue;
        }

        if table.is_lww_column(name) {
            let shadow = shadow_column(name);
            match hlc_text(incoming.get(&shadow)) {
                Some(remote_text) => {
                    let remote_hlc = Hlc::parse(remote_text)?;
                    let local_hlc = match hlc_text(local.get(&shadow)) {
                        Some(text) => Some(Hlc::parse(text)?),
                        None => None,
                    };
                    if local_hlc.map_or(true, |l| remote_hlc > l) {
                        plan.changes.insert(name.clone(), value.clone());
                        plan.changes
                            .insert(shadow, Value::Text(remote_hlc.to_string()));
                    }
                }
                // No shadow supplied: the server did not speak per-column
                // HLC for this write, so it wins outright.
                None => {
                    plan.changes.insert(name.clone(), value.clone());
                }
            }
        } else {
            plan.changes.insert(name.clone(), value.clone());
        }
    }

    plan.changes.retain(|k, v| local.get(k) != Some(v));
    Ok(plan)
}

/// A shadow cell counts as present only when it holds a non-empty string.
fn hlc_text(value: Option<&Value>) -> Option<&str> {
    value.and_then(|v| v.as_text()).filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ebb_core::schema::ColumnDef;

    fn users() -> TableDef {
        TableDef::new("users")
            .column(ColumnDef::text("name").lww())
            .column(ColumnDef::text("email").lww())
            .column(ColumnDef::integer("age"))
    }

    fn text(s: &str) -> Value {
        Value::Text(s.to_string())
    }

    fn local_row() -> Row {
        let mut row = Row::new();
        row.insert("name".into(), text("A"));
        row.insert("name__hlc".into(), text("100:0:N1"));
        row.insert("email".into(), text("a@x"));
        row.insert("email__hlc".into(), text("100:0:N1"));
        row.insert("age".into(), Value::Integer(30));
        row.insert(SYSTEM_ID.into(), text("sid-1"));
        row
    }

    #[test]
    fn newer_server_column_wins_older_loses() {
        // Scenario: name arrives newer, email arrives older.
        let mut incoming = Row::new();
        incoming.insert("name".into(), text("B"));
        incoming.insert("name__hlc".into(), text("200:0:N2"));
        incoming.insert("email".into(), text("b@x"));
        incoming.insert("email__hlc".into(), text("50:0:N2"));

        let plan = plan_update(&users(), &local_row(), &incoming).unwrap();
        assert_eq!(plan.changes.get("name"), Some(&text("B")));
        assert_eq!(plan.changes.get("name__hlc"), Some(&text("200:0:N2")));
        assert!(!plan.changes.contains_key("email"));
        assert!(!plan.changes.contains_key("email__hlc"));
    }

    #[test]
    fn missing_local_shadow_lets_server_win() {
        let mut local = local_row();
        local.remove("name__hlc");

        let mut incoming = Row::new();
        incoming.insert("name".into(), text("B"));
        incoming.insert("name__hlc".into(), text("1:0:N2"));

        let plan = plan_update(&users(), &local, &incoming).unwrap();
        assert_eq!(plan.changes.get("name"), Some(&text("B")));
    }

    #[test]
    fn missing_server_shadow_wins_unconditionally() {
        let mut incoming = Row::new();
        incoming.insert("name".into(), text("B"));

        let plan = plan_update(&users(), &local_row(), &incoming).unwrap();
        assert_eq!(plan.changes.get("name"), Some(&text("B")));
        // The local shadow is left alone.
        assert!(!plan.changes.contains_key("name__hlc"));
    }

    #[test]
    fn non_lww_columns_apply_unconditionally() {
        let mut incoming = Row::new();
        incoming.insert("age".into(), Value::Integer(31));

        let plan = plan_update(&users(), &local_row(), &incoming).unwrap();
        assert_eq!(plan.changes.get("age"), Some(&Value::Integer(31)));
    }

    #[test]
    fn equal_values_plan_to_nothing() {
        // Re-applying the same row must be a no-op.
        let mut incoming = Row::new();
        incoming.insert("name".into(), text("A"));
        incoming.insert("name__hlc".into(), text("100:0:N1"));
        incoming.insert("age".into(), Value::Integer(30));

        let plan = plan_update(&users(), &local_row(), &incoming).unwrap();
        assert!(plan.changes.is_empty(), "got {:?}", plan.changes);
    }

    #[test]
    fn same_value_with_newer_shadow_still_updates_shadow() {
        let mut incoming = Row::new();
        incoming.insert("name".into(), text("A"));
        incoming.insert("name__hlc".into(), text("300:0:N2"));

        let plan = plan_update(&users(), &local_row(), &incoming).unwrap();
        assert!(!plan.changes.contains_key("name"));
        assert_eq!(plan.changes.get("name__hlc"), Some(&text("300:0:N2")));
    }

    #[test]
    fn bookkeeping_columns_are_never_planned() {
        let mut incoming = Row::new();
        incoming.insert(SYSTEM_ID.into(), text("other"));
        incoming.insert(SYSTEM_VERSION.into(), text("999:0:N2"));
        incoming.insert(SYSTEM_IS_LOCAL_ORIGIN.into(), Value::Integer(1));
        incoming.insert(SYSTEM_TOMBSTONE.into(), Value::Integer(0));

        let plan = plan_update(&users(), &local_row(), &incoming).unwrap();
        assert!(plan.changes.is_empty());
    }

    #[test]
    fn unknown_columns_are_reported_not_planned() {
        let mut incoming = Row::new();
        incoming.insert("nickname".into(), text("Al"));

        let plan = plan_update(&users(), &local_row(), &incoming).unwrap();
        assert!(plan.changes.is_empty());
        assert_eq!(plan.ignored, vec!["nickname".to_string()]);
    }

    #[test]
    fn malformed_remote_shadow_is_an_error() {
        let mut incoming = Row::new();
        incoming.insert("name".into(), text("B"));
        incoming.insert("name__hlc".into(), text("not-an-hlc"));

        assert!(plan_update(&users(), &local_row(), &incoming).is_err());
    }
}
