mod telemetry;

use clap::Parser;
use rand::Rng;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use serde::Serialize;
use std::time::Duration;
use telemetry::{malformed, SensorPayload, StatusPayload};
use tracing::{error, info, warn};

/// Publishes synthetic SHT20-style traffic: telemetry on the data topics,
/// retained state, status heartbeats and the occasional garbage payload.
#[derive(Parser, Debug)]
#[command(name = "simulator", about = "SHT20 sensor traffic generator")]
struct Args {
    #[arg(long, env = "MQTT_BROKER", default_value = "localhost")]
    broker: String,

    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    port: u16,

    /// Messages per second across all devices.
    #[arg(long, env = "MESSAGE_RATE", default_value_t = 10)]
    rate: u64,

    #[arg(long, env = "DEVICE_COUNT", default_value_t = 3)]
    devices: u64,

    /// Fraction of sensor messages published with the retain flag set.
    #[arg(long, env = "RETAIN_RATIO", default_value_t = 0.5)]
    retain_ratio: f64,

    /// Fraction of messages that are undecodable garbage.
    #[arg(long, env = "MALFORMED_RATIO", default_value_t = 0.05)]
    malformed_ratio: f64,

    /// Fraction of messages that are status heartbeats.
    #[arg(long, env = "STATUS_RATIO", default_value_t = 0.05)]
    status_ratio: f64,
}

fn encode<T: Serialize>(value: &T) -> Option<String> {
    match serde_json::to_string(value) {
        Ok(body) => Some(body),
        Err(e) => {
            error!("Failed to serialize payload: {}", e);
            None
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    info!("Starting sensor simulator");
    info!(
        "Broker: {}:{}, Rate: {} msg/s, Devices: {}",
        args.broker, args.port, args.rate, args.devices
    );

    let client_id = format!("sim-{}", uuid::Uuid::new_v4());

    let mut mqtt_options = MqttOptions::new(&client_id, &args.broker, args.port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_clean_session(true);

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 20000);

    // Spawn eventloop handler
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(_) => {}
                Err(e) => {
                    error!("MQTT eventloop error: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    });

    tokio::time::sleep(Duration::from_secs(2)).await;

    info!("Connected to MQTT broker, starting to publish");

    let mut rng = rand::thread_rng();
    let mut counter = 0u64;
    let started = std::time::Instant::now();
    let device_count = args.devices.max(1);

    // Bursts stay close to one second apart so low rates still pace evenly
    let burst_size = args.rate.clamp(1, 200);
    let burst_interval = Duration::from_millis(burst_size * 1000 / args.rate.max(1));

    info!(
        "Publishing in bursts of {} messages every {:?}",
        burst_size, burst_interval
    );

    loop {
        let burst_start = std::time::Instant::now();

        for _ in 0..burst_size {
            let device = counter % device_count;
            let device_id = format!("dev-{}", device);
            let roll: f64 = rng.gen();

            let (topic, body, retain) = if roll < args.malformed_ratio {
                (format!("sensor/{}/data", device_id), malformed(&mut rng), false)
            } else if roll < args.malformed_ratio + args.status_ratio {
                let status = StatusPayload {
                    status: "online",
                    device_id: device_id.clone(),
                    uptime_secs: started.elapsed().as_secs(),
                };
                let body = match encode(&status) {
                    Some(body) => body,
                    None => continue,
                };
                (format!("sensor/{}/status", device_id), body, true)
            } else {
                let payload = SensorPayload::random(
                    &mut rng,
                    device_id.clone(),
                    format!("Room {}", device),
                );
                let body = match encode(&payload) {
                    Some(body) => body,
                    None => continue,
                };
                // Device 0 doubles as the legacy sensor on the bare sht20 topic
                let topic = if device == 0 {
                    "sht20/data".to_string()
                } else {
                    format!("sensor/{}/data", device_id)
                };
                let retain = rng.gen_bool(args.retain_ratio.clamp(0.0, 1.0));
                (topic, body, retain)
            };

            match client.publish(&topic, QoS::AtLeastOnce, retain, body).await {
                Ok(_) => {
                    counter += 1;
                }
                Err(e) => {
                    warn!("Failed to publish to {}: {}", topic, e);
                }
            }
        }

        // Log progress periodically
        if counter % 1000 == 0 && counter > 0 {
            info!("Published {} messages", counter);
        }

        let elapsed = burst_start.elapsed();
        if elapsed < burst_interval {
            tokio::time::sleep(burst_interval - elapsed).await;
        } else if elapsed > burst_interval * 2 {
            warn!("Burst took {:?}, target was {:?} - broker may be saturated", elapsed, burst_interval);
        }
    }
}
