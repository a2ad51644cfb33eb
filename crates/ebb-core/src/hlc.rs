use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{EbbError, Result};
use crate::value::Value;

// ---------------------------------------------------------------------------
// Hlc
// ---------------------------------------------------------------------------

/// Hybrid Logical Clock timestamp: physical wall-clock milliseconds, a
/// logical counter for same-millisecond causality, and the id of the node
/// that issued it.
///
/// The derived ordering is lexicographic on `(wall_ms, logical, node_id)`,
/// which is the engine-wide total order; node id byte order breaks exact
/// ties between nodes.
///
/// Wire form is `"<wall_ms>:<logical>:<node_id>"`, e.g.
/// `"1712345678901:0:node-a9f3b"`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Hlc {
    pub wall_ms: u64,
    pub logical: u32,
    pub node_id: String,
}

impl Hlc {
    pub fn new(wall_ms: u64, logical: u32, node_id: impl Into<String>) -> Self {
        Self {
            wall_ms,
            logical,
            node_id: node_id.into(),
        }
    }

    /// Parse the wire form, rejecting anything that is not exactly
    /// `wall:logical:node` with decimal integers and a colon-free node id.
    pub fn parse(s: &str) -> Result<Self> {
        let malformed = || EbbError::InvalidArgument(format!("malformed HLC timestamp: {s:?}"));

        let mut parts = s.splitn(3, ':');
        let wall = parts.next().ok_or_else(malformed)?;
        let logical = parts.next().ok_or_else(malformed)?;
        let node = parts.next().ok_or_else(malformed)?;

        let wall_ms: u64 = wall.parse().map_err(|_| malformed())?;
        let logical: u32 = logical.parse().map_err(|_| malformed())?;
        validate_node_id(node).map_err(|_| malformed())?;

        Ok(Self::new(wall_ms, logical, node))
    }
}

impl fmt::Display for Hlc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.wall_ms, self.logical, self.node_id)
    }
}

impl FromStr for Hlc {
    type Err = EbbError;

    fn from_str(s: &str) -> Result<Self> {
        Hlc::parse(s)
    }
}

impl From<Hlc> for String {
    fn from(hlc: Hlc) -> Self {
        hlc.to_string()
    }
}

impl TryFrom<String> for Hlc {
    type Error = EbbError;

    fn try_from(s: String) -> Result<Self> {
        Hlc::parse(&s)
    }
}

impl From<&Hlc> for Value {
    fn from(hlc: &Hlc) -> Self {
        Value::Text(hlc.to_string())
    }
}

/// Node ids are opaque ASCII without colons; anything else would corrupt the
/// wire form.
pub fn validate_node_id(node_id: &str) -> Result<()> {
    if node_id.is_empty() || !node_id.is_ascii() || node_id.contains(':') {
        return Err(EbbError::InvalidArgument(format!(
            "invalid HLC node id: {node_id:?}"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// HlcClock
// ---------------------------------------------------------------------------

/// Strictly monotone HLC source for one engine instance.
///
/// Every engine owns exactly one clock; the node id is fixed at
/// construction. `now` never returns a timestamp ≤ any previously returned
/// one, even when the wall clock jumps backwards.
pub struct HlcClock {
    node_id: String,
    last: Mutex<LastState>,
}

#[derive(Clone, Copy)]
struct LastState {
    wall_ms: u64,
    logical: u32,
}

impl HlcClock {
    pub fn new(node_id: impl Into<String>) -> Result<Self> {
        let node_id = node_id.into();
        validate_node_id(&node_id)?;
        Ok(Self {
            node_id,
            last: Mutex::new(LastState {
                wall_ms: 0,
                logical: 0,
            }),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Issue the next timestamp.
    pub fn now(&self) -> Hlc {
        self.tick(physical_now_ms())
    }

    /// Deterministic step function behind `now`: take `physical` as the
    /// wall-clock reading and advance past the last issued state.
    fn tick(&self, physical: u64) -> Hlc {
        let mut last = self.last.lock().expect("hlc clock poisoned");

        let (wall_ms, logical) = if physical > last.wall_ms {
            (physical, 0)
        } else if last.logical == u32::MAX {
            // Counter exhausted within one millisecond: borrow the next one.
            (last.wall_ms + 1, 0)
        } else {
            (last.wall_ms, last.logical + 1)
        };

        *last = LastState { wall_ms, logical };
        Hlc::new(wall_ms, logical, self.node_id.clone())
    }

    /// Fold a remote timestamp into the clock so that every subsequent
    /// `now` dominates it. Used when applying server rows whose HLCs the
    /// engine must respect.
    pub fn observe(&self, remote: &Hlc) -> Hlc {
        let physical = physical_now_ms();
        let mut last = self.last.lock().expect("hlc clock poisoned");

        let wall_ms = physical.max(last.wall_ms).max(remote.wall_ms);

        // Highest logical among the sources already sitting at the chosen
        // wall time; none means the physical clock alone is newest.
        let mut base: Option<u32> = None;
        if last.wall_ms == wall_ms {
            base = Some(last.logical);
        }
        if remote.wall_ms == wall_ms {
            base = Some(base.map_or(remote.logical, |b| b.max(remote.logical)));
        }

        let (wall_ms, logical) = match base {
            None => (wall_ms, 0),
            Some(u32::MAX) => (wall_ms + 1, 0),
            Some(b) => (wall_ms, b + 1),
        };

        *last = LastState { wall_ms, logical };
        Hlc::new(wall_ms, logical, self.node_id.clone())
    }
}

fn physical_now_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}
