use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("MQTT error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Channel send error")]
    ChannelSend,
}

impl Error {
    /// Whether the failure is connection-level trouble that can clear on its
    /// own, as opposed to being inherent to the message. Retryable errors
    /// leave raw log entries unprocessed so a later recovery pass picks them
    /// up.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Database(err) => is_transient_db_error(err),
            Error::StoreUnavailable(_) => true,
            Error::ChannelSend => true,
            _ => false,
        }
    }
}

fn is_transient_db_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Io(_) => true,
        sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db_err) => {
            // Connection exceptions and resource exhaustion per Postgres
            // error classes 08 and 53, plus "cannot connect now".
            matches!(
                db_err.code().as_deref(),
                Some("08000") | Some("08003") | Some("08006") | Some("57P03") | Some("53300")
            )
        }
        _ => false,
    }
}

pub type Result<T> = std::result::Result<T, Error>;
