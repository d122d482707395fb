use crate::config::MqttConfig;
use crate::errors::{Error, Result};
use crate::metrics::CHANNEL_FULL_TOTAL;
use crate::model::{InboundMessage, TransportMeta};
use async_trait::async_trait;
use chrono::Utc;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Delivery side of the pipeline. A transport's only job is to push raw
/// messages onto the channel; everything that interprets them lives behind
/// the worker.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn run(&self, tx: mpsc::Sender<InboundMessage>) -> Result<()>;
}

/// Broker subscription over rumqttc. Uses a persistent session so QoS 1
/// backlog survives reconnects, and QoS 1 subscriptions for at-least-once
/// delivery; the store dedupes whatever arrives twice.
pub struct LiveTransport {
    config: MqttConfig,
    client_id: String,
}

impl LiveTransport {
    pub fn new(config: MqttConfig) -> Self {
        LiveTransport {
            client_id: format!("ingestor-{}", uuid::Uuid::new_v4()),
            config,
        }
    }
}

#[async_trait]
impl Transport for LiveTransport {
    async fn run(&self, tx: mpsc::Sender<InboundMessage>) -> Result<()> {
        info!(
            "Connecting to MQTT broker at {}:{}",
            self.config.broker, self.config.port
        );

        let mut mqtt_options =
            MqttOptions::new(&self.client_id, &self.config.broker, self.config.port);
        mqtt_options.set_keep_alive(std::time::Duration::from_secs(30));
        mqtt_options.set_clean_session(false);

        let (client, mut eventloop) = AsyncClient::new(mqtt_options, 10000);

        for topic in &self.config.topics {
            client
                .subscribe(topic, QoS::AtLeastOnce)
                .await
                .map_err(Error::Mqtt)?;
            info!("Subscribed to {} with QoS 1", topic);
        }

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let message = InboundMessage {
                        topic: publish.topic.clone(),
                        payload: String::from_utf8_lossy(&publish.payload).into_owned(),
                        meta: TransportMeta {
                            qos: qos_level(publish.qos),
                            retain: publish.retain,
                            received_at: Utc::now(),
                            client_id: None,
                        },
                    };
                    deliver(&tx, message).await?;
                }
                Ok(_) => {}
                Err(e) => {
                    error!("MQTT error: {}", e);
                    // rumqttc reconnects on its own; just pace the loop.
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
            }
        }
    }
}

/// Stands in for the broker in HTTP-only deployments. Parks forever so the
/// supervision loop in main treats it like any other transport.
pub struct NullTransport;

#[async_trait]
impl Transport for NullTransport {
    async fn run(&self, _tx: mpsc::Sender<InboundMessage>) -> Result<()> {
        info!("MQTT transport disabled; ingestion is HTTP-only");
        std::future::pending::<()>().await;
        Ok(())
    }
}

/// Non-blocking send first; on a full channel, count the backpressure event
/// and fall back to a blocking send so no message is dropped.
async fn deliver(tx: &mpsc::Sender<InboundMessage>, message: InboundMessage) -> Result<()> {
    match tx.try_send(message) {
        Ok(()) => Ok(()),
        Err(mpsc::error::TrySendError::Full(message)) => {
            CHANNEL_FULL_TOTAL.inc();
            debug!("Channel full, using blocking send");
            tx.send(message).await.map_err(|_| Error::ChannelSend)
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            error!("Channel closed, cannot deliver message");
            Err(Error::ChannelSend)
        }
    }
}

fn qos_level(qos: QoS) -> i16 {
    match qos {
        QoS::AtMostOnce => 0,
        QoS::AtLeastOnce => 1,
        QoS::ExactlyOnce => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qos_levels() {
        assert_eq!(qos_level(QoS::AtMostOnce), 0);
        assert_eq!(qos_level(QoS::AtLeastOnce), 1);
        assert_eq!(qos_level(QoS::ExactlyOnce), 2);
    }

    #[test]
    fn test_deliver_preserves_message() {
        tokio_test::block_on(async {
            let (tx, mut rx) = mpsc::channel(10);
            let message = InboundMessage {
                topic: "sht20/data".to_string(),
                payload: r#"{"temp": 25.0, "hum": 60.0}"#.to_string(),
                meta: TransportMeta {
                    qos: 1,
                    retain: true,
                    received_at: Utc::now(),
                    client_id: None,
                },
            };

            deliver(&tx, message).await.unwrap();

            let received = rx.recv().await.unwrap();
            assert_eq!(received.topic, "sht20/data");
            assert!(received.meta.retain);
        });
    }

    #[test]
    fn test_deliver_blocks_through_full_channel() {
        tokio_test::block_on(async {
            let (tx, mut rx) = mpsc::channel(1);
            let make = |n: u32| InboundMessage {
                topic: format!("sensor/dev-{}/data", n),
                payload: "{}".to_string(),
                meta: TransportMeta {
                    qos: 0,
                    retain: false,
                    received_at: Utc::now(),
                    client_id: None,
                },
            };

            deliver(&tx, make(1)).await.unwrap();
            // Channel is now full; the second deliver must wait for the
            // drain below rather than dropping the message.
            let tx2 = tx.clone();
            let pending = tokio::spawn(async move { deliver(&tx2, make(2)).await });

            let first = rx.recv().await.unwrap();
            assert_eq!(first.topic, "sensor/dev-1/data");
            pending.await.unwrap().unwrap();
            let second = rx.recv().await.unwrap();
            assert_eq!(second.topic, "sensor/dev-2/data");
        });
    }

    #[test]
    fn test_deliver_closed_channel_errors() {
        tokio_test::block_on(async {
            let (tx, rx) = mpsc::channel(1);
            drop(rx);
            let message = InboundMessage {
                topic: "sht20/data".to_string(),
                payload: "{}".to_string(),
                meta: TransportMeta {
                    qos: 0,
                    retain: false,
                    received_at: Utc::now(),
                    client_id: None,
                },
            };
            assert!(matches!(
                deliver(&tx, message).await,
                Err(Error::ChannelSend)
            ));
        });
    }
}
