use rusqlite::{params_from_iter, Connection};
use sha2::{Digest, Sha256};

use ebb_core::error::Result;
use ebb_core::value::{Row, Value};

use crate::record::Record;

// ---------------------------------------------------------------------------
// Query
// ---------------------------------------------------------------------------

/// Descriptor of a read against one table.
///
/// `where` and `order_by` are raw SQL fragments supplied by the host; the
/// where clause uses unnumbered `?` placeholders bound from `args` so that
/// generated clauses can prepend their own parameters elsewhere.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub table: String,
    pub where_clause: Option<String>,
    pub args: Vec<Value>,
    pub order_by: Option<String>,
    pub limit: Option<u32>,
}

impl Query {
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            where_clause: None,
            args: Vec::new(),
            order_by: None,
            limit: None,
        }
    }

    pub fn filter<I, V>(mut self, clause: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.where_clause = Some(clause.into());
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn order_by(mut self, clause: impl Into<String>) -> Self {
        self.order_by = Some(clause.into());
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn to_sql(&self) -> String {
        let mut sql = format!("SELECT * FROM \"{}\"", self.table);
        if let Some(where_clause) = &self.where_clause {
            sql.push_str(" WHERE ");
            sql.push_str(where_clause);
        }
        if let Some(order_by) = &self.order_by {
            sql.push_str(" ORDER BY ");
            sql.push_str(order_by);
        }
        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        sql
    }

    /// Digest of the rendered SQL plus bound parameters. Two queries with
    /// equal signatures are the same live question; re-registering a stream
    /// under an equal signature is a no-op, so widget rebuilds do not tear
    /// streams down.
    pub fn signature(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.to_sql().as_bytes());
        for arg in &self.args {
            hasher.update([0u8]);
            hasher.update(serde_json::to_string(arg).unwrap_or_default().as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// Run `query` on `conn` and hydrate each row into a [`Record`] carrying a
/// query-time snapshot.
pub fn execute_query(conn: &Connection, query: &Query) -> Result<Vec<Record>> {
    let sql = query.to_sql();
    let mut stmt = conn.prepare(&sql)?;
    let names: Vec<String> = stmt
        .column_names()
        .iter()
        .map(|s| s.to_string())
        .collect();

    let rows = stmt
        .query_map(params_from_iter(query.args.iter()), |r| {
            let mut map = Row::new();
            for (i, name) in names.iter().enumerate() {
                map.insert(name.clone(), r.get::<_, Value>(i)?);
            }
            Ok(map)
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(rows
        .into_iter()
        .map(|fields| Record::hydrated(&query.table, fields))
        .collect())
}
