use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;

/// Payload shape published by SHT20-class firmware: short field names with
/// the device identity and clock embedded.
#[derive(Debug, Clone, Serialize)]
pub struct SensorPayload {
    pub temp: f64,
    pub hum: f64,
    #[serde(rename = "deviceId")]
    pub device_id: String,
    pub location: String,
    pub timestamp: DateTime<Utc>,
}

impl SensorPayload {
    pub fn random(rng: &mut impl Rng, device_id: String, location: String) -> Self {
        let temp = if rng.gen_bool(0.05) {
            rng.gen_range(100.1..200.0) // 5% out of range, must be rejected downstream
        } else {
            rng.gen_range(15.0..35.0)
        };

        let hum = if rng.gen_bool(0.05) {
            rng.gen_range(100.1..150.0)
        } else {
            rng.gen_range(30.0..80.0)
        };

        SensorPayload {
            temp,
            hum,
            device_id,
            location,
            timestamp: Utc::now(),
        }
    }
}

/// Heartbeat published on the status topic, retained so the last known
/// state survives the device going quiet.
#[derive(Debug, Clone, Serialize)]
pub struct StatusPayload {
    pub status: &'static str,
    #[serde(rename = "deviceId")]
    pub device_id: String,
    pub uptime_secs: u64,
}

/// Garbage the way real devices produce it: firmware error strings,
/// truncated JSON, wrong value types.
pub fn malformed(rng: &mut impl Rng) -> String {
    const SAMPLES: [&str; 4] = [
        "SENSOR ERR",
        r#"{"temp": 25.1, "hum":"#,
        r#""21.5""#,
        r#"{"temp": "hot", "hum": "wet"}"#,
    ];
    SAMPLES[rng.gen_range(0..SAMPLES.len())].to_string()
}
