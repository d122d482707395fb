use crate::cache::RetainedCache;
use crate::errors::Result;
use crate::metrics::{
    DUPLICATES_TOTAL, INGEST_LATENCY_SECONDS, MESSAGES_TOTAL, PARSE_FAILURES_TOTAL,
    READINGS_ACCEPTED_TOTAL, REJECTED_TOTAL, RETAINED_CACHE_ENTRIES, STORE_FAILURES_TOTAL,
};
use crate::model::{
    InboundMessage, IngestOutcome, MessageType, NewRawLogEntry, RawLogEntry, RetainedMessage,
    TransportMeta,
};
use crate::normalize::{
    self, classify, device_id_hint, embedded_timestamp, parse_payload, ReadingDefaults,
    RejectReason,
};
use crate::store::{InsertOutcome, Store};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Runs every message through the same sequence regardless of transport:
/// append to the raw log, normalize, persist, mirror retained state, then
/// checkpoint the log entry. Store failures before the checkpoint propagate
/// and leave the entry unprocessed for recovery; replays converge because
/// every persistence step is idempotent.
pub struct Ingestor {
    store: Arc<dyn Store>,
    cache: Arc<RetainedCache>,
    defaults: ReadingDefaults,
}

impl Ingestor {
    pub fn new(
        store: Arc<dyn Store>,
        cache: Arc<RetainedCache>,
        defaults: ReadingDefaults,
    ) -> Self {
        Ingestor {
            store,
            cache,
            defaults,
        }
    }

    /// Entry point for live traffic. The message is logged before anything
    /// interprets it, so a crash after this call loses nothing.
    pub async fn ingest(
        &self,
        topic: &str,
        payload: &str,
        meta: &TransportMeta,
    ) -> Result<IngestOutcome> {
        MESSAGES_TOTAL.inc();
        debug!(
            "Ingesting message on topic {} ({} bytes, retain={}, client={:?})",
            topic,
            payload.len(),
            meta.retain,
            meta.client_id
        );

        let parsed = parse_payload(payload);
        let message_type = classify(topic, parsed.as_ref());
        let timestamp = embedded_timestamp(parsed.as_ref()).unwrap_or(meta.received_at);
        let accepted_at = Utc::now();

        let entry = NewRawLogEntry {
            topic: topic.to_string(),
            payload: payload.to_string(),
            qos: meta.qos,
            retain: meta.retain,
            timestamp,
            received_at: accepted_at,
            device_id: device_id_hint(topic, parsed.as_ref()),
            message_type,
        };
        let entry_id = self.store.append_raw_log(&entry).await?;

        self.process(
            entry_id,
            topic,
            payload,
            parsed.as_ref(),
            message_type,
            timestamp,
            meta.qos,
            meta.retain,
            accepted_at,
        )
        .await
    }

    /// Replays a logged entry, typically from the recovery backlog. Produces
    /// the same reading the live path would have: the entry's timestamp is
    /// the arrival fallback it recorded, so the natural key matches and
    /// dedup suppresses anything already persisted.
    pub async fn process_log_entry(&self, entry: &RawLogEntry) -> Result<IngestOutcome> {
        let parsed = parse_payload(&entry.payload);
        self.process(
            entry.id,
            &entry.topic,
            &entry.payload,
            parsed.as_ref(),
            entry.message_type,
            entry.timestamp,
            entry.qos,
            entry.retain,
            Utc::now(),
        )
        .await
    }

    /// Persists a reading from a retained message if it holds valid sensor
    /// data. No raw log entry is involved: this covers telemetry that was
    /// retained by the broker but whose original delivery was never logged.
    pub async fn backfill_retained(&self, message: &RetainedMessage) -> Result<Option<i64>> {
        let parsed = parse_payload(&message.payload);
        let message_type = classify(&message.topic, parsed.as_ref());
        let reading = match normalize::normalize(
            parsed.as_ref(),
            message_type,
            &message.topic,
            message.timestamp,
            Utc::now(),
            &self.defaults,
        ) {
            Ok(reading) => reading,
            // Non-telemetry or invalid retained payloads never become readings.
            Err(_) => return Ok(None),
        };
        match self.store.insert_reading(&reading).await? {
            InsertOutcome::Inserted(stored) => {
                debug!(
                    "Backfilled reading {} from retained topic {}",
                    stored.id, message.topic
                );
                Ok(Some(stored.id))
            }
            InsertOutcome::Duplicate => Ok(None),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn process(
        &self,
        entry_id: i64,
        topic: &str,
        payload: &str,
        parsed: Option<&Value>,
        message_type: MessageType,
        arrival: DateTime<Utc>,
        qos: i16,
        retain: bool,
        received_at: DateTime<Utc>,
    ) -> Result<IngestOutcome> {
        let reading = normalize::normalize(
            parsed,
            message_type,
            topic,
            arrival,
            received_at,
            &self.defaults,
        );

        match reading {
            Ok(reading) => {
                let (reading_id, duplicate) = match self.store.insert_reading(&reading).await? {
                    InsertOutcome::Inserted(stored) => {
                        READINGS_ACCEPTED_TOTAL.inc();
                        (Some(stored.id), false)
                    }
                    InsertOutcome::Duplicate => {
                        DUPLICATES_TOTAL.inc();
                        debug!(
                            "Duplicate reading for {} at {} suppressed",
                            reading.device_id, reading.timestamp
                        );
                        (None, true)
                    }
                };

                if retain {
                    self.mirror_retained(topic, payload, parsed, arrival, qos)
                        .await?;
                }
                self.checkpoint(entry_id).await;

                Ok(IngestOutcome {
                    accepted: true,
                    duplicate,
                    reading_id,
                    reason: None,
                })
            }
            Err(reason) => {
                match reason {
                    RejectReason::NotJson => {
                        PARSE_FAILURES_TOTAL.inc();
                        warn!("Undecodable payload on topic {}: logged as unknown", topic);
                    }
                    ref r if r.is_validation() => {
                        REJECTED_TOTAL.inc();
                        warn!("Rejected payload on topic {}: {}", topic, r);
                    }
                    ref r => debug!("No reading from topic {}: {}", topic, r),
                }

                // Retained non-sensor traffic still updates the topic mirror;
                // a rejected measurement must not, or stale-but-valid state
                // would be shadowed by garbage.
                if retain && !reason.is_validation() {
                    self.mirror_retained(topic, payload, parsed, arrival, qos)
                        .await?;
                }
                self.checkpoint(entry_id).await;

                Ok(IngestOutcome {
                    accepted: false,
                    duplicate: false,
                    reading_id: None,
                    reason: Some(reason.to_string()),
                })
            }
        }
    }

    /// Store upsert strictly before cache put: a crash between the two
    /// leaves the cache stale, which the next recovery pass corrects. The
    /// reverse order could persist state the store never saw.
    async fn mirror_retained(
        &self,
        topic: &str,
        payload: &str,
        parsed: Option<&Value>,
        timestamp: DateTime<Utc>,
        qos: i16,
    ) -> Result<()> {
        let message = RetainedMessage {
            topic: topic.to_string(),
            payload: payload.to_string(),
            qos,
            timestamp,
            device_id: device_id_hint(topic, parsed),
            updated_at: Utc::now(),
        };
        self.store.upsert_retained(&message).await?;
        self.cache.put(message);
        RETAINED_CACHE_ENTRIES.set(self.cache.len() as f64);
        Ok(())
    }

    /// Flips the log entry to processed. Failures here never change the
    /// outcome: the entry just stays in the recovery backlog and the next
    /// pass re-derives the same verdict.
    async fn checkpoint(&self, entry_id: i64) {
        match self.store.mark_processed(entry_id).await {
            Ok(true) => {}
            Ok(false) => debug!("Log entry {} was already claimed", entry_id),
            Err(e) => warn!(
                "Could not mark log entry {} processed, leaving for recovery: {}",
                entry_id, e
            ),
        }
    }
}

/// Drains the inbound channel. One of these runs for the life of the
/// process; transports stay thin and all interpretation happens here.
pub async fn run_worker(mut rx: mpsc::Receiver<InboundMessage>, ingestor: Arc<Ingestor>) {
    info!("Ingestion worker started");

    while let Some(message) = rx.recv().await {
        let start = Instant::now();
        match ingestor
            .ingest(&message.topic, &message.payload, &message.meta)
            .await
        {
            Ok(outcome) => {
                INGEST_LATENCY_SECONDS.observe(start.elapsed().as_secs_f64());
                if !outcome.accepted {
                    debug!(
                        "Message on {} not persisted: {}",
                        message.topic,
                        outcome.reason.as_deref().unwrap_or("unknown")
                    );
                }
            }
            Err(e) if e.is_retryable() => {
                STORE_FAILURES_TOTAL.inc();
                warn!(
                    "Ingest failed for topic {} (recovery will retry): {}",
                    message.topic, e
                );
            }
            Err(e) => {
                STORE_FAILURES_TOTAL.inc();
                error!("Ingest failed for topic {}: {}", message.topic, e);
            }
        }
    }

    info!("Ingestion worker stopped (channel closed)");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use tokio_test::block_on;

    fn setup() -> (Arc<MemoryStore>, Arc<RetainedCache>, Ingestor) {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(RetainedCache::new());
        let ingestor = Ingestor::new(
            store.clone(),
            cache.clone(),
            ReadingDefaults {
                device_id: "SHT20-001".to_string(),
                location: "Default Room".to_string(),
            },
        );
        (store, cache, ingestor)
    }

    fn meta(retain: bool) -> TransportMeta {
        TransportMeta {
            qos: 1,
            retain,
            received_at: Utc::now(),
            client_id: None,
        }
    }

    #[test]
    fn test_valid_message_becomes_reading() {
        block_on(async {
            let (store, _cache, ingestor) = setup();
            let outcome = ingestor
                .ingest("sht20/data", r#"{"temp": 25.5, "hum": 60.0}"#, &meta(false))
                .await
                .unwrap();

            assert!(outcome.accepted);
            assert!(!outcome.duplicate);
            assert!(outcome.reading_id.is_some());

            let latest = store.latest_reading().await.unwrap().unwrap();
            assert_eq!(latest.temperature, 25.5);
            assert_eq!(latest.device_id, "sht20");
            // The log entry is checkpointed.
            assert!(store.unprocessed_entries(10).await.unwrap().is_empty());
        });
    }

    #[test]
    fn test_out_of_range_rejected_but_logged() {
        block_on(async {
            let (store, cache, ingestor) = setup();
            let outcome = ingestor
                .ingest("sht20/data", r#"{"temp": 150.0, "hum": 60.0}"#, &meta(true))
                .await
                .unwrap();

            assert!(!outcome.accepted);
            let reason = outcome.reason.unwrap();
            assert!(reason.contains("temperature"));
            assert!(reason.contains("range"));

            assert!(store.latest_reading().await.unwrap().is_none());
            // Rejected measurements never shadow retained state.
            assert!(cache.is_empty());
            assert!(store.retained_messages().await.unwrap().is_empty());
            // Rejection is definitive: the entry is processed, not backlog.
            assert!(store.unprocessed_entries(10).await.unwrap().is_empty());
        });
    }

    #[test]
    fn test_duplicate_suppressed() {
        block_on(async {
            let (store, _cache, ingestor) = setup();
            let payload = r#"{"temp": 22.0, "hum": 50.0, "deviceId": "dev-9", "timestamp": "2024-06-01T12:00:00Z"}"#;

            let first = ingestor.ingest("sht20/data", payload, &meta(false)).await.unwrap();
            let second = ingestor.ingest("sht20/data", payload, &meta(false)).await.unwrap();

            assert!(first.accepted && !first.duplicate);
            assert!(second.accepted && second.duplicate);
            assert!(second.reading_id.is_none());

            let epoch = DateTime::<Utc>::UNIX_EPOCH;
            assert_eq!(store.readings_since(epoch, 100).await.unwrap().len(), 1);
        });
    }

    #[test]
    fn test_retained_sensor_message_mirrors_cache() {
        block_on(async {
            let (store, cache, ingestor) = setup();
            ingestor
                .ingest("sht20/data", r#"{"temp": 21.0, "hum": 40.0}"#, &meta(true))
                .await
                .unwrap();

            let cached = cache.get("sht20/data").unwrap();
            assert!(cached.payload.contains("21.0"));
            assert_eq!(store.retained_messages().await.unwrap().len(), 1);
        });
    }

    #[test]
    fn test_status_message_logged_and_mirrored_without_reading() {
        block_on(async {
            let (store, cache, ingestor) = setup();
            let outcome = ingestor
                .ingest("sht20/status", r#"{"status": "online"}"#, &meta(true))
                .await
                .unwrap();

            assert!(!outcome.accepted);
            assert!(outcome.reason.unwrap().contains("status"));
            assert!(store.latest_reading().await.unwrap().is_none());
            // Non-sensor retained traffic still updates the mirror.
            assert!(cache.get("sht20/status").is_some());
            assert!(store.unprocessed_entries(10).await.unwrap().is_empty());
        });
    }

    #[test]
    fn test_unparseable_payload_logged_as_unknown() {
        block_on(async {
            let (store, _cache, ingestor) = setup();
            let outcome = ingestor
                .ingest("sht20/data", "SENSOR ERR", &meta(false))
                .await
                .unwrap();

            assert!(!outcome.accepted);
            assert!(store.unprocessed_entries(10).await.unwrap().is_empty());
            assert!(store.latest_reading().await.unwrap().is_none());
        });
    }

    #[test]
    fn test_replayed_entry_matches_live_ingest() {
        block_on(async {
            let (store, _cache, ingestor) = setup();
            let arrival = Utc::now();
            // Payload embeds no timestamp, so the arrival instant recorded on
            // the log entry is the one that must survive replay.
            store
                .append_raw_log(&NewRawLogEntry {
                    topic: "sensor/dev-3/data".to_string(),
                    payload: r#"{"temp": 19.5, "hum": 33.0}"#.to_string(),
                    qos: 1,
                    retain: false,
                    timestamp: arrival,
                    received_at: arrival,
                    device_id: Some("dev-3".to_string()),
                    message_type: MessageType::SensorData,
                })
                .await
                .unwrap();

            let backlog = store.unprocessed_entries(10).await.unwrap();
            assert_eq!(backlog.len(), 1);
            let outcome = ingestor.process_log_entry(&backlog[0]).await.unwrap();
            assert!(outcome.accepted && !outcome.duplicate);

            let reading = store.latest_reading().await.unwrap().unwrap();
            assert_eq!(reading.timestamp, arrival);
            assert_eq!(reading.device_id, "dev-3");
            assert!(store.unprocessed_entries(10).await.unwrap().is_empty());

            // A second replay of the same entry dedupes on the natural key.
            let outcome = ingestor.process_log_entry(&backlog[0]).await.unwrap();
            assert!(outcome.accepted && outcome.duplicate);
        });
    }
}
