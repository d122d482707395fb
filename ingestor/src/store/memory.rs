use super::{InsertOutcome, Store};
use crate::errors::Result;
use crate::model::{NewRawLogEntry, NewReading, RawLogEntry, Reading, RetainedMessage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Mutex;

/// In-process store for development and tests. Same contract as Postgres:
/// natural-key dedup, processed-flag CAS, deterministic query ordering. One
/// lock over all tables keeps check-then-insert atomic.
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    readings: Vec<Reading>,
    retained: BTreeMap<String, RetainedMessage>,
    raw_log: Vec<RawLogEntry>,
    next_reading_id: i64,
    next_log_id: i64,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("memory store lock poisoned")
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_reading(&self, reading: &NewReading) -> Result<InsertOutcome> {
        let mut inner = self.lock();
        let exists = inner
            .readings
            .iter()
            .any(|r| r.device_id == reading.device_id && r.timestamp == reading.timestamp);
        if exists {
            return Ok(InsertOutcome::Duplicate);
        }
        inner.next_reading_id += 1;
        let stored = Reading {
            id: inner.next_reading_id,
            device_id: reading.device_id.clone(),
            location: reading.location.clone(),
            temperature: reading.temperature,
            humidity: reading.humidity,
            timestamp: reading.timestamp,
            received_at: reading.received_at,
        };
        inner.readings.push(stored.clone());
        Ok(InsertOutcome::Inserted(stored))
    }

    async fn upsert_retained(&self, message: &RetainedMessage) -> Result<()> {
        self.lock()
            .retained
            .insert(message.topic.clone(), message.clone());
        Ok(())
    }

    async fn append_raw_log(&self, entry: &NewRawLogEntry) -> Result<i64> {
        let mut inner = self.lock();
        inner.next_log_id += 1;
        let id = inner.next_log_id;
        inner.raw_log.push(RawLogEntry {
            id,
            topic: entry.topic.clone(),
            payload: entry.payload.clone(),
            qos: entry.qos,
            retain: entry.retain,
            timestamp: entry.timestamp,
            received_at: entry.received_at,
            device_id: entry.device_id.clone(),
            message_type: entry.message_type,
            processed: false,
        });
        Ok(id)
    }

    async fn mark_processed(&self, id: i64) -> Result<bool> {
        let mut inner = self.lock();
        match inner.raw_log.iter_mut().find(|e| e.id == id) {
            Some(entry) if !entry.processed => {
                entry.processed = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn unprocessed_entries(&self, limit: i64) -> Result<Vec<RawLogEntry>> {
        let inner = self.lock();
        let mut entries: Vec<RawLogEntry> = inner
            .raw_log
            .iter()
            .filter(|e| !e.processed)
            .cloned()
            .collect();
        entries.sort_by_key(|e| (e.timestamp, e.id));
        entries.truncate(limit.max(0) as usize);
        Ok(entries)
    }

    async fn retained_messages(&self) -> Result<Vec<RetainedMessage>> {
        let inner = self.lock();
        let mut messages: Vec<RetainedMessage> = inner.retained.values().cloned().collect();
        messages.sort_by_key(|m| m.updated_at);
        Ok(messages)
    }

    async fn latest_reading(&self) -> Result<Option<Reading>> {
        let inner = self.lock();
        Ok(inner
            .readings
            .iter()
            .max_by_key(|r| (r.timestamp, r.id))
            .cloned())
    }

    async fn readings_since(&self, since: DateTime<Utc>, limit: i64) -> Result<Vec<Reading>> {
        let inner = self.lock();
        let mut readings: Vec<Reading> = inner
            .readings
            .iter()
            .filter(|r| r.timestamp >= since)
            .cloned()
            .collect();
        readings.sort_by_key(|r| (r.timestamp, r.id));
        readings.truncate(limit.max(0) as usize);
        Ok(readings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MessageType;
    use tokio_test::block_on;

    fn reading(device_id: &str, ts: DateTime<Utc>) -> NewReading {
        NewReading {
            device_id: device_id.to_string(),
            location: "lab".to_string(),
            temperature: 22.0,
            humidity: 45.0,
            timestamp: ts,
            received_at: Utc::now(),
        }
    }

    fn log_entry(topic: &str, ts: DateTime<Utc>) -> NewRawLogEntry {
        NewRawLogEntry {
            topic: topic.to_string(),
            payload: "{}".to_string(),
            qos: 1,
            retain: false,
            timestamp: ts,
            received_at: Utc::now(),
            device_id: None,
            message_type: MessageType::Unknown,
        }
    }

    #[test]
    fn test_natural_key_dedup() {
        block_on(async {
            let store = MemoryStore::new();
            let ts = Utc::now();
            let first = store.insert_reading(&reading("dev-1", ts)).await.unwrap();
            assert!(matches!(first, InsertOutcome::Inserted(_)));
            let second = store.insert_reading(&reading("dev-1", ts)).await.unwrap();
            assert!(matches!(second, InsertOutcome::Duplicate));
            // Different device, same timestamp: distinct key.
            let third = store.insert_reading(&reading("dev-2", ts)).await.unwrap();
            assert!(matches!(third, InsertOutcome::Inserted(_)));
        });
    }

    #[test]
    fn test_mark_processed_flips_once() {
        block_on(async {
            let store = MemoryStore::new();
            let id = store
                .append_raw_log(&log_entry("sht20/data", Utc::now()))
                .await
                .unwrap();
            assert!(store.mark_processed(id).await.unwrap());
            assert!(!store.mark_processed(id).await.unwrap());
            assert!(!store.mark_processed(9999).await.unwrap());
        });
    }

    #[test]
    fn test_unprocessed_ordering_and_limit() {
        block_on(async {
            let store = MemoryStore::new();
            let base = Utc::now();
            store
                .append_raw_log(&log_entry("b", base + chrono::Duration::seconds(2)))
                .await
                .unwrap();
            store
                .append_raw_log(&log_entry("a", base))
                .await
                .unwrap();
            store
                .append_raw_log(&log_entry("c", base + chrono::Duration::seconds(4)))
                .await
                .unwrap();

            let entries = store.unprocessed_entries(2).await.unwrap();
            assert_eq!(entries.len(), 2);
            assert_eq!(entries[0].topic, "a");
            assert_eq!(entries[1].topic, "b");
        });
    }

    #[test]
    fn test_retained_rows_ordered_by_update() {
        block_on(async {
            let store = MemoryStore::new();
            let base = Utc::now();
            for (topic, offset) in [("z/data", 0), ("a/data", 2), ("m/data", 1)] {
                store
                    .upsert_retained(&RetainedMessage {
                        topic: topic.to_string(),
                        payload: "{}".to_string(),
                        qos: 0,
                        timestamp: base,
                        device_id: None,
                        updated_at: base + chrono::Duration::seconds(offset),
                    })
                    .await
                    .unwrap();
            }
            let topics: Vec<String> = store
                .retained_messages()
                .await
                .unwrap()
                .into_iter()
                .map(|m| m.topic)
                .collect();
            assert_eq!(topics, vec!["z/data", "m/data", "a/data"]);
        });
    }
}
