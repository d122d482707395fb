use crate::cache::RetainedCache;
use crate::errors::Result;
use crate::model::{Bucket, BucketUnit, LatestValue, Source};
use crate::normalize::{humidity_field, parse_payload, temperature_field, validate};
use crate::store::Store;
use chrono::{DateTime, NaiveTime, Timelike, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Matches the fetch ceiling of the grouped-readings query; windows wider
/// than this many readings are aggregated from the oldest portion only.
const GROUPING_FETCH_LIMIT: i64 = 5000;

/// Read-side view over the retained cache and the durable store. The cache
/// answers first because a retained message can be newer than anything
/// persisted as a reading; the store is the fallback, and an empty system
/// reports explicit zero values rather than an error.
pub struct Reconciler {
    store: Arc<dyn Store>,
    cache: Arc<RetainedCache>,
    canonical_topic: String,
}

impl Reconciler {
    pub fn new(store: Arc<dyn Store>, cache: Arc<RetainedCache>, canonical_topic: String) -> Self {
        Reconciler {
            store,
            cache,
            canonical_topic,
        }
    }

    fn is_sensor_topic(&self, topic: &str) -> bool {
        topic == self.canonical_topic || topic.contains("/data")
    }

    /// Latest temperature and humidity, with provenance. Cache entries only
    /// count when they decode to an in-range measurement pair; among those,
    /// the freshest embedded timestamp wins, ties broken by topic order.
    pub async fn latest(&self, topic_filter: Option<&str>) -> Result<LatestValue> {
        let mut best: Option<(DateTime<Utc>, f64, f64)> = None;

        for message in self.cache.all() {
            let relevant = match topic_filter {
                Some(filter) => message.topic == filter || message.topic.contains(filter),
                None => self.is_sensor_topic(&message.topic),
            };
            if !relevant {
                continue;
            }
            let parsed = match parse_payload(&message.payload) {
                Some(v) => v,
                None => continue,
            };
            let (temperature, humidity) =
                match (temperature_field(&parsed), humidity_field(&parsed)) {
                    (Some(t), Some(h)) => (t, h),
                    _ => continue,
                };
            if validate(temperature, humidity).is_err() {
                continue;
            }
            match best {
                Some((ts, _, _)) if ts >= message.timestamp => {}
                _ => best = Some((message.timestamp, temperature, humidity)),
            }
        }

        if let Some((timestamp, temperature, humidity)) = best {
            return Ok(LatestValue {
                temperature,
                humidity,
                timestamp: Some(timestamp),
                source: Source::RetainedCache,
            });
        }

        if let Some(reading) = self.store.latest_reading().await? {
            return Ok(LatestValue {
                temperature: reading.temperature,
                humidity: reading.humidity,
                timestamp: Some(reading.timestamp),
                source: Source::DurableStore,
            });
        }

        Ok(LatestValue {
            temperature: 0.0,
            humidity: 0.0,
            timestamp: None,
            source: Source::None,
        })
    }

    /// Averages readings into fixed time buckets. Buckets holding no
    /// readings are omitted; output is ascending by bucket start.
    pub async fn grouped(
        &self,
        window_start: DateTime<Utc>,
        window_end: Option<DateTime<Utc>>,
        bucket_size: u32,
        unit: BucketUnit,
    ) -> Result<Vec<Bucket>> {
        let readings = self
            .store
            .readings_since(window_start, GROUPING_FETCH_LIMIT)
            .await?;

        let mut groups: BTreeMap<DateTime<Utc>, (f64, f64, u64)> = BTreeMap::new();
        for reading in readings {
            if let Some(end) = window_end {
                if reading.timestamp > end {
                    continue;
                }
            }
            let start = floor_to_bucket(reading.timestamp, bucket_size, unit);
            let slot = groups.entry(start).or_insert((0.0, 0.0, 0));
            slot.0 += reading.temperature;
            slot.1 += reading.humidity;
            slot.2 += 1;
        }

        Ok(groups
            .into_iter()
            .map(|(bucket_start, (temp_sum, hum_sum, count))| Bucket {
                bucket_start,
                avg_temperature: temp_sum / count as f64,
                avg_humidity: hum_sum / count as f64,
                count,
            })
            .collect())
    }
}

/// Floors a timestamp to its bucket start: minutes and hours floor to the
/// nearest multiple of `size` within the hour or day, days always floor to
/// midnight regardless of `size`.
pub fn floor_to_bucket(ts: DateTime<Utc>, size: u32, unit: BucketUnit) -> DateTime<Utc> {
    let size = size.max(1);
    match unit {
        BucketUnit::Minutes => {
            let minute = ts.minute() - ts.minute() % size.min(60);
            ts.with_minute(minute)
                .and_then(|t| t.with_second(0))
                .and_then(|t| t.with_nanosecond(0))
                .unwrap_or(ts)
        }
        BucketUnit::Hours => {
            let hour = ts.hour() - ts.hour() % size.min(24);
            ts.with_hour(hour)
                .and_then(|t| t.with_minute(0))
                .and_then(|t| t.with_second(0))
                .and_then(|t| t.with_nanosecond(0))
                .unwrap_or(ts)
        }
        BucketUnit::Days => ts.date_naive().and_time(NaiveTime::MIN).and_utc(),
    }
}
