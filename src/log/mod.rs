//! The append-only transaction log: on-disk record format plus the file
//! handle that serializes commits and replays catch-up.

mod file;
mod record;

pub use file::{Log, TransactionRecord, WriteGuard};
pub use record::{Trailer, FILE_MAGIC, TRAILER_MAGIC};
