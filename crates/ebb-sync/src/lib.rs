pub mod orchestrator;
pub mod retry;
pub mod scheduler;
pub mod transport;

pub use orchestrator::{SyncOptions, SyncOrchestrator, SyncReport};
pub use retry::{ExponentialBackoff, NoRetry, RetryStrategy};
pub use scheduler::TaskScheduler;
pub use transport::{SyncAck, SyncTransport, UploadBatch, UploadEntry};
