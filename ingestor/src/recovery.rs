use crate::cache::RetainedCache;
use crate::errors::Result;
use crate::ingest::Ingestor;
use crate::metrics::{RECOVERY_READINGS_TOTAL, RECOVERY_RUNS_TOTAL, RETAINED_CACHE_ENTRIES};
use crate::store::Store;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// What a recovery pass accomplished.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    pub completed: bool,
    /// Retained rows replayed into the cache.
    pub retained_applied: usize,
    /// Readings created from retained payloads the live path never logged.
    pub backfilled: usize,
    /// Backlog entries that reached a definitive verdict this pass.
    pub entries_processed: usize,
    /// New readings persisted by this pass, both steps combined.
    pub readings_created: usize,
}

/// Rebuilds derived state after a restart and drains whatever the live path
/// left behind. Safe to run at any time, any number of times: both steps are
/// idempotent, so overlapping triggers are simply serialized.
pub struct RecoveryProcessor {
    store: Arc<dyn Store>,
    cache: Arc<RetainedCache>,
    ingestor: Arc<Ingestor>,
    batch_size: i64,
    running: Mutex<()>,
}

impl RecoveryProcessor {
    pub fn new(
        store: Arc<dyn Store>,
        cache: Arc<RetainedCache>,
        ingestor: Arc<Ingestor>,
        batch_size: i64,
    ) -> Self {
        RecoveryProcessor {
            store,
            cache,
            ingestor,
            batch_size,
            running: Mutex::new(()),
        }
    }

    pub async fn recover(&self) -> Result<RecoveryReport> {
        let _guard = self.running.lock().await;
        RECOVERY_RUNS_TOTAL.inc();
        let mut report = RecoveryReport::default();

        // Step 1: replay the retained mirror into the cache, oldest write
        // first so last-write-wins reproduces the pre-restart state, and
        // backfill readings the live path missed.
        let retained = self.store.retained_messages().await?;
        for message in retained {
            self.cache.put(message.clone());
            report.retained_applied += 1;
            match self.ingestor.backfill_retained(&message).await {
                Ok(Some(_)) => {
                    report.backfilled += 1;
                    report.readings_created += 1;
                }
                Ok(None) => {}
                Err(e) => warn!("Backfill from retained topic {} failed: {}", message.topic, e),
            }
        }
        RETAINED_CACHE_ENTRIES.set(self.cache.len() as f64);

        // Step 2: drain the unprocessed backlog, oldest first. An entry that
        // fails on a store error stays unprocessed and the batch moves on;
        // rejection verdicts mark entries processed inside the replay.
        let backlog = self.store.unprocessed_entries(self.batch_size).await?;
        for entry in &backlog {
            match self.ingestor.process_log_entry(entry).await {
                Ok(outcome) => {
                    report.entries_processed += 1;
                    if outcome.accepted && !outcome.duplicate {
                        report.readings_created += 1;
                    }
                }
                Err(e) => warn!("Log entry {} left unprocessed: {}", entry.id, e),
            }
        }

        if report.readings_created > 0 {
            RECOVERY_READINGS_TOTAL.inc_by(report.readings_created as f64);
        }
        report.completed = true;
        debug!(
            "Recovery pass done: {} retained applied, {} backfilled, {} entries processed, {} readings created",
            report.retained_applied, report.backfilled, report.entries_processed, report.readings_created
        );
        Ok(report)
    }

    /// Periodic sweep. The interval also serves as the retry schedule for
    /// entries stranded by store outages.
    pub async fn run_periodic(&self, interval_secs: u64) {
        info!("Recovery sweep every {}s", interval_secs);
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
        // The immediate first tick is a harmless re-run of startup recovery.
        loop {
            ticker.tick().await;
            match self.recover().await {
                Ok(report) => {
                    if report.entries_processed > 0 || report.backfilled > 0 {
                        info!(
                            "Recovery sweep processed {} entries, backfilled {}",
                            report.entries_processed, report.backfilled
                        );
                    }
                }
                Err(e) => warn!("Recovery sweep failed, next tick retries: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MessageType, NewRawLogEntry, RetainedMessage};
    use crate::normalize::ReadingDefaults;
    use crate::store::MemoryStore;
    use chrono::{DateTime, Utc};
    use tokio_test::block_on;

    fn setup() -> (
        Arc<MemoryStore>,
        Arc<RetainedCache>,
        Arc<Ingestor>,
        RecoveryProcessor,
    ) {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(RetainedCache::new());
        let ingestor = Arc::new(Ingestor::new(
            store.clone(),
            cache.clone(),
            ReadingDefaults {
                device_id: "SHT20-001".to_string(),
                location: "Default Room".to_string(),
            },
        ));
        let recovery =
            RecoveryProcessor::new(store.clone(), cache.clone(), ingestor.clone(), 1000);
        (store, cache, ingestor, recovery)
    }

    fn retained(topic: &str, payload: &str, offset_secs: i64) -> RetainedMessage {
        let ts = Utc::now() + chrono::Duration::seconds(offset_secs);
        RetainedMessage {
            topic: topic.to_string(),
            payload: payload.to_string(),
            qos: 1,
            timestamp: ts,
            device_id: None,
            updated_at: ts,
        }
    }

    fn log_entry(topic: &str, payload: &str, mt: MessageType) -> NewRawLogEntry {
        NewRawLogEntry {
            topic: topic.to_string(),
            payload: payload.to_string(),
            qos: 1,
            retain: false,
            timestamp: Utc::now(),
            received_at: Utc::now(),
            device_id: None,
            message_type: mt,
        }
    }

    #[test]
    fn test_restart_recovery_rebuilds_cache_and_drains_backlog() {
        block_on(async {
            let (store, cache, _ingestor, recovery) = setup();

            // Simulates state left by a previous process: three retained
            // rows, two unprocessed log entries.
            store
                .upsert_retained(&retained(
                    "sht20/data",
                    r#"{"temp": 21.5, "hum": 48.0, "deviceId": "r-1"}"#,
                    0,
                ))
                .await
                .unwrap();
            store
                .upsert_retained(&retained("sht20/status", r#"{"status": "online"}"#, 1))
                .await
                .unwrap();
            store
                .upsert_retained(&retained("sensor/r-2/data", "not json", 2))
                .await
                .unwrap();

            store
                .append_raw_log(&log_entry(
                    "sensor/d-1/data",
                    r#"{"temp": 19.0, "hum": 50.0}"#,
                    MessageType::SensorData,
                ))
                .await
                .unwrap();
            store
                .append_raw_log(&log_entry(
                    "sensor/d-2/data",
                    r#"{"temp": 400.0, "hum": 50.0}"#,
                    MessageType::SensorData,
                ))
                .await
                .unwrap();

            let report = recovery.recover().await.unwrap();

            assert!(report.completed);
            assert_eq!(report.retained_applied, 3);
            assert_eq!(cache.len(), 3);
            // Only the valid retained telemetry payload backfills.
            assert_eq!(report.backfilled, 1);
            // Both entries reach a verdict; only the in-range one persists.
            assert_eq!(report.entries_processed, 2);
            assert_eq!(report.readings_created, 2);
            assert!(store.unprocessed_entries(10).await.unwrap().is_empty());

            let epoch = DateTime::<Utc>::UNIX_EPOCH;
            let readings = store.readings_since(epoch, 100).await.unwrap();
            assert_eq!(readings.len(), 2);
            assert!(readings.iter().any(|r| r.device_id == "r-1"));
            assert!(readings.iter().any(|r| r.device_id == "d-1"));
        });
    }

    #[test]
    fn test_recovery_is_idempotent() {
        block_on(async {
            let (store, cache, _ingestor, recovery) = setup();
            store
                .upsert_retained(&retained(
                    "sht20/data",
                    r#"{"temp": 21.5, "hum": 48.0}"#,
                    0,
                ))
                .await
                .unwrap();
            store
                .append_raw_log(&log_entry(
                    "sensor/d-1/data",
                    r#"{"temp": 19.0, "hum": 50.0}"#,
                    MessageType::SensorData,
                ))
                .await
                .unwrap();

            let first = recovery.recover().await.unwrap();
            assert_eq!(first.readings_created, 2);

            let second = recovery.recover().await.unwrap();
            assert!(second.completed);
            assert_eq!(second.readings_created, 0);
            assert_eq!(second.entries_processed, 0);
            assert_eq!(cache.len(), 1);

            let epoch = DateTime::<Utc>::UNIX_EPOCH;
            assert_eq!(store.readings_since(epoch, 100).await.unwrap().len(), 2);
        });
    }

    #[test]
    fn test_poison_entry_does_not_abort_batch() {
        block_on(async {
            let (store, _cache, _ingestor, recovery) = setup();
            store
                .append_raw_log(&log_entry("sht20/data", "garbage", MessageType::Unknown))
                .await
                .unwrap();
            store
                .append_raw_log(&log_entry(
                    "sht20/data",
                    r#"{"temp": 22.0, "hum": 51.0}"#,
                    MessageType::SensorData,
                ))
                .await
                .unwrap();

            let report = recovery.recover().await.unwrap();
            // The garbage entry is marked processed with no reading, the
            // valid one persists.
            assert_eq!(report.entries_processed, 2);
            assert_eq!(report.readings_created, 1);
            assert!(store.unprocessed_entries(10).await.unwrap().is_empty());
        });
    }

    #[test]
    fn test_batch_size_limits_one_pass() {
        block_on(async {
            let (store, _cache, ingestor, _recovery) = setup();
            let recovery = RecoveryProcessor::new(
                store.clone(),
                Arc::new(RetainedCache::new()),
                ingestor,
                2,
            );
            for i in 0..5 {
                store
                    .append_raw_log(&log_entry(
                        "sht20/data",
                        &format!(r#"{{"temp": {}.0, "hum": 50.0, "deviceId": "d-{}"}}"#, 20 + i, i),
                        MessageType::SensorData,
                    ))
                    .await
                    .unwrap();
            }

            let report = recovery.recover().await.unwrap();
            assert_eq!(report.entries_processed, 2);
            assert_eq!(store.unprocessed_entries(10).await.unwrap().len(), 3);

            // Next passes drain the rest.
            recovery.recover().await.unwrap();
            recovery.recover().await.unwrap();
            assert!(store.unprocessed_entries(10).await.unwrap().is_empty());
        });
    }
}
