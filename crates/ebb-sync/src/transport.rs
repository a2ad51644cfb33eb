use serde::{Deserialize, Serialize};

use ebb_core::hlc::Hlc;
use ebb_core::value::Row;
use ebb_core::Result;

// ---------------------------------------------------------------------------
// Upload batch
// ---------------------------------------------------------------------------

/// One outbound change as shipped to the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadEntry {
    pub table: String,
    /// The row's `system_id`.
    pub row_id: String,
    /// HLC of the queued local mutation.
    pub hlc: Hlc,
    /// `true` when the server should treat `row` as the complete row rather
    /// than a partial delta.
    pub is_full_row: bool,
    /// Local delete; `row` is absent.
    pub tombstone: bool,
    pub row: Option<Row>,
}

/// A batch built from drained dirty rows. The server must apply it
/// atomically.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploadBatch {
    pub entries: Vec<UploadEntry>,
}

impl UploadBatch {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Largest HLC carried by the batch; the natural ack watermark.
    pub fn max_hlc(&self) -> Option<&Hlc> {
        self.entries.iter().map(|e| &e.hlc).max()
    }
}

/// Server acknowledgement: every uploaded change with `hlc ≤ ack.hlc` is
/// durably applied remote-side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncAck {
    pub hlc: Hlc,
}

// ---------------------------------------------------------------------------
// SyncTransport
// ---------------------------------------------------------------------------

/// The app-supplied network boundary. The engine neither knows nor cares
/// how rows travel; it only sees row maps coming back from `fetch` (each a
/// candidate for `bulk_load`) and an ack watermark from `send`.
pub trait SyncTransport: Send + Sync {
    /// Server rows for `table` changed since `last_seen` (all rows when
    /// `None`).
    fn fetch(&self, table: &str, last_seen: Option<&Hlc>) -> Result<Vec<Row>>;

    /// Upload a batch; the server applies it atomically and acks a
    /// watermark.
    fn send(&self, batch: &UploadBatch) -> Result<SyncAck>;
}
