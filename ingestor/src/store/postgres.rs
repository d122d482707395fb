use super::{InsertOutcome, Store};
use crate::errors::Result;
use crate::model::{
    MessageType, NewRawLogEntry, NewReading, RawLogEntry, Reading, RetainedMessage,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::time::Duration;
use tracing::info;

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<PgStore> {
        info!("Connecting to database...");
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;

        info!("Database connection established");
        info!("Running database migrations...");
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("Migrations completed");

        Ok(PgStore { pool })
    }
}

#[async_trait]
impl Store for PgStore {
    async fn insert_reading(&self, reading: &NewReading) -> Result<InsertOutcome> {
        let row = sqlx::query(
            r#"
            INSERT INTO readings (device_id, location, temperature, humidity, ts, received_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (device_id, ts) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(&reading.device_id)
        .bind(&reading.location)
        .bind(reading.temperature)
        .bind(reading.humidity)
        .bind(reading.timestamp)
        .bind(reading.received_at)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let id: i64 = row.try_get("id")?;
                Ok(InsertOutcome::Inserted(Reading {
                    id,
                    device_id: reading.device_id.clone(),
                    location: reading.location.clone(),
                    temperature: reading.temperature,
                    humidity: reading.humidity,
                    timestamp: reading.timestamp,
                    received_at: reading.received_at,
                }))
            }
            None => Ok(InsertOutcome::Duplicate),
        }
    }

    async fn upsert_retained(&self, message: &RetainedMessage) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO retained_messages (topic, payload, qos, ts, device_id, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (topic) DO UPDATE SET
                payload = EXCLUDED.payload,
                qos = EXCLUDED.qos,
                ts = EXCLUDED.ts,
                device_id = EXCLUDED.device_id,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&message.topic)
        .bind(&message.payload)
        .bind(message.qos)
        .bind(message.timestamp)
        .bind(&message.device_id)
        .bind(message.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn append_raw_log(&self, entry: &NewRawLogEntry) -> Result<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO raw_message_log
                (topic, payload, qos, retain_flag, ts, received_at, device_id, message_type, processed)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, FALSE)
            RETURNING id
            "#,
        )
        .bind(&entry.topic)
        .bind(&entry.payload)
        .bind(entry.qos)
        .bind(entry.retain)
        .bind(entry.timestamp)
        .bind(entry.received_at)
        .bind(&entry.device_id)
        .bind(entry.message_type.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get("id")?)
    }

    async fn mark_processed(&self, id: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE raw_message_log SET processed = TRUE WHERE id = $1 AND processed = FALSE",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn unprocessed_entries(&self, limit: i64) -> Result<Vec<RawLogEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, topic, payload, qos, retain_flag, ts, received_at,
                   device_id, message_type, processed
            FROM raw_message_log
            WHERE processed = FALSE
            ORDER BY ts ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(log_entry_from_row).collect()
    }

    async fn retained_messages(&self) -> Result<Vec<RetainedMessage>> {
        let messages = sqlx::query_as::<_, RetainedMessage>(
            r#"
            SELECT topic, payload, qos, ts AS timestamp, device_id, updated_at
            FROM retained_messages
            ORDER BY updated_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(messages)
    }

    async fn latest_reading(&self) -> Result<Option<Reading>> {
        let reading = sqlx::query_as::<_, Reading>(
            r#"
            SELECT id, device_id, location, temperature, humidity, ts AS timestamp, received_at
            FROM readings
            ORDER BY ts DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(reading)
    }

    async fn readings_since(&self, since: DateTime<Utc>, limit: i64) -> Result<Vec<Reading>> {
        let readings = sqlx::query_as::<_, Reading>(
            r#"
            SELECT id, device_id, location, temperature, humidity, ts AS timestamp, received_at
            FROM readings
            WHERE ts >= $1
            ORDER BY ts ASC
            LIMIT $2
            "#,
        )
        .bind(since)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(readings)
    }
}

fn log_entry_from_row(row: PgRow) -> Result<RawLogEntry> {
    let message_type: String = row.try_get("message_type")?;
    Ok(RawLogEntry {
        id: row.try_get("id")?,
        topic: row.try_get("topic")?,
        payload: row.try_get("payload")?,
        qos: row.try_get("qos")?,
        retain: row.try_get("retain_flag")?,
        timestamp: row.try_get("ts")?,
        received_at: row.try_get("received_at")?,
        device_id: row.try_get("device_id")?,
        message_type: MessageType::parse(&message_type),
        processed: row.try_get("processed")?,
    })
}
