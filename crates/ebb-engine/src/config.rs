use std::path::PathBuf;
use std::time::Duration;

use uuid::Uuid;

// ---------------------------------------------------------------------------
// DbConfig
// ---------------------------------------------------------------------------

/// Where the engine's SQLite database lives.
#[derive(Debug, Clone)]
pub enum DbLocation {
    File(PathBuf),
    /// A single shared in-memory database, private to one engine instance.
    Memory,
}

/// Engine construction parameters. There is no ambient configuration: every
/// engine instance is built from one of these, and nothing is read from the
/// environment.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub location: DbLocation,
    /// Stable id of this node; becomes the HLC node id on every stamp the
    /// engine issues. Opaque ASCII, no colons.
    pub node_id: String,
    pub pool_size: u32,
    pub busy_timeout: Duration,
}

impl DbConfig {
    pub fn file(path: impl Into<PathBuf>, node_id: impl Into<String>) -> Self {
        Self {
            location: DbLocation::File(path.into()),
            node_id: node_id.into(),
            ..Self::default()
        }
    }

    pub fn memory(node_id: impl Into<String>) -> Self {
        Self {
            location: DbLocation::Memory,
            node_id: node_id.into(),
            ..Self::default()
        }
    }

    pub fn pool_size(mut self, size: u32) -> Self {
        self.pool_size = size;
        self
    }

    pub fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            location: DbLocation::Memory,
            node_id: format!("node-{}", &Uuid::new_v4().simple().to_string()[..8]),
            pool_size: 8,
            busy_timeout: Duration::from_secs(5),
        }
    }
}
