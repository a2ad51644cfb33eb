pub mod config;
pub mod database;
pub mod query;
pub mod record;
pub mod stream;

pub use config::{DbConfig, DbLocation};
pub use database::{Database, Session};
pub use query::Query;
pub use record::{FromValue, Record};
pub use stream::{StreamCallback, StreamId, StreamManager};
