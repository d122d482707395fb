use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A validated sensor observation, the unit of truth for analytics.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Reading {
    pub id: i64,
    pub device_id: String,
    pub location: String,
    pub temperature: f64,
    pub humidity: f64,
    /// Device-supplied when the payload embeds one, arrival instant otherwise.
    pub timestamp: DateTime<Utc>,
    /// Server-assigned accept instant.
    pub received_at: DateTime<Utc>,
}

/// A reading before the store assigns it an id.
#[derive(Debug, Clone)]
pub struct NewReading {
    pub device_id: String,
    pub location: String,
    pub temperature: f64,
    pub humidity: f64,
    pub timestamp: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
}

/// Last message seen on a topic with the retain flag set. One row per topic;
/// the payload is the raw string and may or may not be parseable telemetry.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RetainedMessage {
    pub topic: String,
    pub payload: String,
    pub qos: i16,
    pub timestamp: DateTime<Utc>,
    pub device_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Append-only record of every message the pipeline ever saw, processed or
/// not. The unprocessed subset is the recovery backlog.
#[derive(Debug, Clone, Serialize)]
pub struct RawLogEntry {
    pub id: i64,
    pub topic: String,
    pub payload: String,
    pub qos: i16,
    pub retain: bool,
    pub timestamp: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
    pub device_id: Option<String>,
    pub message_type: MessageType,
    pub processed: bool,
}

/// A log entry before the store assigns it an id. Entries always start
/// unprocessed.
#[derive(Debug, Clone)]
pub struct NewRawLogEntry {
    pub topic: String,
    pub payload: String,
    pub qos: i16,
    pub retain: bool,
    pub timestamp: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
    pub device_id: Option<String>,
    pub message_type: MessageType,
}

/// Classification assigned at arrival and recorded on the log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    SensorData,
    Status,
    Command,
    Unknown,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::SensorData => "sensor_data",
            MessageType::Status => "status",
            MessageType::Command => "command",
            MessageType::Unknown => "unknown",
        }
    }

    /// Inverse of `as_str`. Anything unrecognized maps to `Unknown` so old
    /// log rows never fail to load.
    pub fn parse(s: &str) -> MessageType {
        match s {
            "sensor_data" => MessageType::SensorData,
            "status" => MessageType::Status,
            "command" => MessageType::Command,
            _ => MessageType::Unknown,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message as handed over by a transport, before any interpretation.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: String,
    pub meta: TransportMeta,
}

/// Delivery metadata accompanying an inbound message.
#[derive(Debug, Clone)]
pub struct TransportMeta {
    pub qos: i16,
    pub retain: bool,
    /// Arrival instant at the transport edge. Used as the timestamp fallback
    /// for payloads that do not embed one.
    pub received_at: DateTime<Utc>,
    pub client_id: Option<String>,
}

/// What ingestion did with a message. `accepted` means the message passed
/// normalization; a duplicate is still accepted, just suppressed.
#[derive(Debug, Clone, Serialize)]
pub struct IngestOutcome {
    pub accepted: bool,
    pub duplicate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reading_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Where a reconciled latest value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    RetainedCache,
    DurableStore,
    None,
}

/// Latest externally-visible state for the sensor surface. Defaults to zero
/// values with `source: none` when neither cache nor store has anything.
#[derive(Debug, Clone, Serialize)]
pub struct LatestValue {
    pub temperature: f64,
    pub humidity: f64,
    pub timestamp: Option<DateTime<Utc>>,
    pub source: Source,
}

/// One aggregation bucket from the grouped-readings query. Buckets with no
/// readings are never materialized.
#[derive(Debug, Clone, Serialize)]
pub struct Bucket {
    pub bucket_start: DateTime<Utc>,
    pub avg_temperature: f64,
    pub avg_humidity: f64,
    pub count: u64,
}

/// Time unit for grouped-readings buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BucketUnit {
    Minutes,
    Hours,
    Days,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_round_trip() {
        for mt in [
            MessageType::SensorData,
            MessageType::Status,
            MessageType::Command,
            MessageType::Unknown,
        ] {
            assert_eq!(MessageType::parse(mt.as_str()), mt);
        }
    }

    #[test]
    fn test_message_type_parse_unrecognized() {
        assert_eq!(MessageType::parse("telemetry"), MessageType::Unknown);
        assert_eq!(MessageType::parse(""), MessageType::Unknown);
    }

    #[test]
    fn test_outcome_serialization_skips_empty_fields() {
        let outcome = IngestOutcome {
            accepted: true,
            duplicate: false,
            reading_id: Some(7),
            reason: None,
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["reading_id"], 7);
        assert!(json.get("reason").is_none());
    }
}
