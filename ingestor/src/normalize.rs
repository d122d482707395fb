use crate::model::{MessageType, NewReading};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::fmt;

pub const TEMP_MIN: f64 = -50.0;
pub const TEMP_MAX: f64 = 100.0;
pub const HUMIDITY_MIN: f64 = 0.0;
pub const HUMIDITY_MAX: f64 = 100.0;

/// Fallbacks applied when a payload carries no device identity of its own.
#[derive(Debug, Clone)]
pub struct ReadingDefaults {
    pub device_id: String,
    pub location: String,
}

/// Why a message did not become a reading. Rejections are definitive: the
/// same payload yields the same verdict on every replay.
#[derive(Debug, Clone, PartialEq)]
pub enum RejectReason {
    NotJson,
    NotSensorData(MessageType),
    MissingField(&'static str),
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
}

impl RejectReason {
    /// Validation rejections apply to sensor-shaped payloads whose values are
    /// unusable. Non-sensor traffic and undecodable payloads are expected, not
    /// invalid.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            RejectReason::MissingField(_) | RejectReason::OutOfRange { .. }
        )
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::NotJson => write!(f, "payload is not valid JSON"),
            RejectReason::NotSensorData(mt) => write!(f, "not sensor data (message type {})", mt),
            RejectReason::MissingField(field) => {
                write!(f, "{} missing or not numeric", field)
            }
            RejectReason::OutOfRange {
                field,
                value,
                min,
                max,
            } => write!(f, "{} {} out of range [{}, {}]", field, value, min, max),
        }
    }
}

/// Decodes a payload string as JSON. Any valid JSON value counts; field
/// extraction deals with non-objects by finding nothing.
pub fn parse_payload(payload: &str) -> Option<Value> {
    serde_json::from_str(payload).ok()
}

/// Classifies a message by topic suffix first, payload shape second.
/// Undecodable payloads are never typed by topic: they stay `Unknown` so the
/// raw log records them as such.
pub fn classify(topic: &str, parsed: Option<&Value>) -> MessageType {
    let value = match parsed {
        Some(v) => v,
        None => return MessageType::Unknown,
    };
    if topic.contains("/data") {
        MessageType::SensorData
    } else if topic.contains("/status") {
        MessageType::Status
    } else if topic.contains("/command") {
        MessageType::Command
    } else if temperature_field(value).is_some() {
        MessageType::SensorData
    } else {
        MessageType::Unknown
    }
}

/// Pulls a device id out of topic structure: `sensor/<id>/...` or the segment
/// preceding `data`.
pub fn device_id_from_topic(topic: &str) -> Option<String> {
    let segments: Vec<&str> = topic.split('/').collect();
    if segments.len() >= 3 && segments[0] == "sensor" && !segments[1].is_empty() {
        return Some(segments[1].to_string());
    }
    segments
        .iter()
        .position(|s| *s == "data")
        .filter(|&i| i > 0 && !segments[i - 1].is_empty())
        .map(|i| segments[i - 1].to_string())
}

/// Device id precedence: payload field, then topic structure.
pub fn device_id_hint(topic: &str, parsed: Option<&Value>) -> Option<String> {
    parsed
        .and_then(|v| v.get("deviceId"))
        .and_then(Value::as_str)
        .map(str::to_owned)
        .or_else(|| device_id_from_topic(topic))
}

/// Timestamp embedded in the payload, if present and parseable. Malformed
/// timestamps are treated as absent.
pub fn embedded_timestamp(parsed: Option<&Value>) -> Option<DateTime<Utc>> {
    parsed
        .and_then(|v| v.get("timestamp"))
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

pub fn temperature_field(value: &Value) -> Option<f64> {
    value
        .get("temp")
        .or_else(|| value.get("temperature"))
        .and_then(Value::as_f64)
}

pub fn humidity_field(value: &Value) -> Option<f64> {
    value
        .get("hum")
        .or_else(|| value.get("humidity"))
        .and_then(Value::as_f64)
}

/// Validates the physical plausibility of a measurement pair.
pub fn validate(temperature: f64, humidity: f64) -> Result<(), RejectReason> {
    if temperature < TEMP_MIN || temperature > TEMP_MAX {
        return Err(RejectReason::OutOfRange {
            field: "temperature",
            value: temperature,
            min: TEMP_MIN,
            max: TEMP_MAX,
        });
    }
    if humidity < HUMIDITY_MIN || humidity > HUMIDITY_MAX {
        return Err(RejectReason::OutOfRange {
            field: "humidity",
            value: humidity,
            min: HUMIDITY_MIN,
            max: HUMIDITY_MAX,
        });
    }
    Ok(())
}

/// Turns a classified message into a reading, or says why it cannot be one.
/// Pure: no clock reads, no side effects. `arrival` is the timestamp fallback
/// and `received_at` the server accept instant, both chosen by the caller so
/// replays reproduce the original reading exactly.
pub fn normalize(
    parsed: Option<&Value>,
    message_type: MessageType,
    topic: &str,
    arrival: DateTime<Utc>,
    received_at: DateTime<Utc>,
    defaults: &ReadingDefaults,
) -> Result<NewReading, RejectReason> {
    let value = match parsed {
        Some(v) => v,
        None => return Err(RejectReason::NotJson),
    };
    if message_type != MessageType::SensorData {
        return Err(RejectReason::NotSensorData(message_type));
    }

    let temperature =
        temperature_field(value).ok_or(RejectReason::MissingField("temperature"))?;
    let humidity = humidity_field(value).ok_or(RejectReason::MissingField("humidity"))?;
    validate(temperature, humidity)?;

    let device_id = value
        .get("deviceId")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .or_else(|| device_id_from_topic(topic))
        .unwrap_or_else(|| defaults.device_id.clone());
    let location = value
        .get("location")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .unwrap_or_else(|| defaults.location.clone());
    let timestamp = embedded_timestamp(parsed).unwrap_or(arrival);

    Ok(NewReading {
        device_id,
        location,
        temperature,
        humidity,
        timestamp,
        received_at,
    })
}
