mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use crate::errors::Result;
use crate::model::{NewRawLogEntry, NewReading, RawLogEntry, Reading, RetainedMessage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// What happened to an insert against the (device_id, timestamp) natural key.
#[derive(Debug, Clone)]
pub enum InsertOutcome {
    Inserted(Reading),
    /// A reading with this key already exists; nothing was written.
    Duplicate,
}

/// Durable persistence boundary. Every method is safe to retry: inserts
/// dedupe on the natural key, the retained upsert is last-write-wins, and
/// `mark_processed` flips a flag at most once.
#[async_trait]
pub trait Store: Send + Sync {
    async fn insert_reading(&self, reading: &NewReading) -> Result<InsertOutcome>;

    /// Insert-or-replace keyed by topic.
    async fn upsert_retained(&self, message: &RetainedMessage) -> Result<()>;

    /// Appends an arrival record with `processed = false`. Returns the id.
    async fn append_raw_log(&self, entry: &NewRawLogEntry) -> Result<i64>;

    /// Compare-and-set `processed` from false to true. Returns false when the
    /// entry was already claimed (or does not exist), so concurrent
    /// processors cannot both win.
    async fn mark_processed(&self, id: i64) -> Result<bool>;

    /// Unprocessed log entries, oldest timestamp first, at most `limit`.
    async fn unprocessed_entries(&self, limit: i64) -> Result<Vec<RawLogEntry>>;

    /// All retained rows ordered by `updated_at` ascending, so replaying them
    /// in order reproduces last-write-wins.
    async fn retained_messages(&self) -> Result<Vec<RetainedMessage>>;

    async fn latest_reading(&self) -> Result<Option<Reading>>;

    /// Readings with `timestamp >= since`, ascending, at most `limit`.
    async fn readings_since(&self, since: DateTime<Utc>, limit: i64) -> Result<Vec<Reading>>;
}
