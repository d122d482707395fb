use crate::cache::RetainedCache;
use crate::errors::Error;
use crate::ingest::Ingestor;
use crate::metrics::STORE_FAILURES_TOTAL;
use crate::model::{
    Bucket, BucketUnit, IngestOutcome, LatestValue, Reading, RetainedMessage, TransportMeta,
};
use crate::reconcile::Reconciler;
use crate::recovery::{RecoveryProcessor, RecoveryReport};
use crate::store::Store;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, warn};

#[derive(Clone)]
pub struct AppState {
    pub ingestor: Arc<Ingestor>,
    pub reconciler: Arc<Reconciler>,
    pub recovery: Arc<RecoveryProcessor>,
    pub cache: Arc<RetainedCache>,
    pub store: Arc<dyn Store>,
    pub canonical_topic: String,
}

/// Body of POST /api/mqtt/webhook: a bridged MQTT delivery. `payload` may be
/// a JSON object or a pre-encoded string; `timestamp` is the bridge's
/// capture instant, used as the arrival fallback.
#[derive(Debug, Deserialize)]
pub struct WebhookRequest {
    topic: String,
    payload: Value,
    qos: Option<i16>,
    retain: Option<bool>,
    timestamp: Option<DateTime<Utc>>,
    #[serde(rename = "clientId")]
    client_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    readings: Vec<Value>,
}

#[derive(Debug, Serialize)]
pub struct BatchResponse {
    total: usize,
    accepted: usize,
    duplicates: usize,
    rejected: usize,
}

#[derive(Debug, Deserialize)]
pub struct LatestQuery {
    topic: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReadingsQuery {
    since: Option<DateTime<Utc>>,
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct ReadingsResponse {
    data: Vec<Reading>,
    total: usize,
    limit: usize,
}

#[derive(Debug, Deserialize)]
pub struct GroupedQuery {
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    size: Option<u32>,
    unit: Option<BucketUnit>,
}

#[derive(Debug, Serialize)]
pub struct GroupedResponse {
    buckets: Vec<Bucket>,
    total: usize,
}

#[derive(Debug, Serialize)]
pub struct RetainedResponse {
    messages: Vec<RetainedMessage>,
    total: usize,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: &'static str,
    service: &'static str,
    timestamp: DateTime<Utc>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/mqtt/webhook", post(mqtt_webhook))
        .route("/api/sensor/data", post(sensor_data))
        .route("/api/sensor/batch", post(sensor_batch))
        .route("/api/latest", get(latest))
        .route("/api/readings", get(readings))
        .route("/api/grouped", get(grouped))
        .route("/api/mqtt/retain", get(retained_snapshot))
        .route("/api/recover", post(trigger_recovery))
        .route("/api/health", get(health))
        .with_state(state)
}

/// Bridged MQTT traffic enters here and flows through the same ingestion
/// sequence as a broker subscription.
async fn mqtt_webhook(
    State(state): State<AppState>,
    Json(request): Json<WebhookRequest>,
) -> Result<(StatusCode, Json<IngestOutcome>), AppError> {
    let payload = payload_string(&request.payload)?;
    let meta = TransportMeta {
        qos: request.qos.unwrap_or(0),
        retain: request.retain.unwrap_or(false),
        received_at: request.timestamp.unwrap_or_else(Utc::now),
        client_id: request.client_id,
    };
    debug!(
        "Webhook delivery on topic {} from client {:?}",
        request.topic, meta.client_id
    );
    let outcome = state.ingestor.ingest(&request.topic, &payload, &meta).await?;
    Ok(outcome_response(outcome))
}

/// Direct reading submission, attributed to the canonical topic. Never
/// retained: only the broker decides retained state.
async fn sensor_data(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<IngestOutcome>), AppError> {
    let payload = payload_string(&body)?;
    let meta = direct_meta();
    let outcome = state
        .ingestor
        .ingest(&state.canonical_topic, &payload, &meta)
        .await?;
    Ok(outcome_response(outcome))
}

async fn sensor_batch(
    State(state): State<AppState>,
    Json(request): Json<BatchRequest>,
) -> Result<Json<BatchResponse>, AppError> {
    let mut response = BatchResponse {
        total: request.readings.len(),
        accepted: 0,
        duplicates: 0,
        rejected: 0,
    };
    for body in &request.readings {
        let payload = payload_string(body)?;
        let outcome = state
            .ingestor
            .ingest(&state.canonical_topic, &payload, &direct_meta())
            .await?;
        if outcome.accepted {
            response.accepted += 1;
            if outcome.duplicate {
                response.duplicates += 1;
            }
        } else {
            response.rejected += 1;
        }
    }
    Ok(Json(response))
}

async fn latest(
    State(state): State<AppState>,
    Query(params): Query<LatestQuery>,
) -> Result<Json<LatestValue>, AppError> {
    let value = state.reconciler.latest(params.topic.as_deref()).await?;
    Ok(Json(value))
}

async fn readings(
    State(state): State<AppState>,
    Query(params): Query<ReadingsQuery>,
) -> Result<Json<ReadingsResponse>, AppError> {
    let limit = params.limit.unwrap_or(100).min(1000);
    let since = params
        .since
        .unwrap_or_else(|| Utc::now() - chrono::Duration::hours(3));
    let data = state.store.readings_since(since, limit as i64).await?;
    Ok(Json(ReadingsResponse {
        total: data.len(),
        data,
        limit,
    }))
}

async fn grouped(
    State(state): State<AppState>,
    Query(params): Query<GroupedQuery>,
) -> Result<Json<GroupedResponse>, AppError> {
    let start = params
        .start
        .unwrap_or_else(|| Utc::now() - chrono::Duration::hours(3));
    let buckets = state
        .reconciler
        .grouped(
            start,
            params.end,
            params.size.unwrap_or(15),
            params.unit.unwrap_or(BucketUnit::Minutes),
        )
        .await?;
    Ok(Json(GroupedResponse {
        total: buckets.len(),
        buckets,
    }))
}

async fn retained_snapshot(State(state): State<AppState>) -> Json<RetainedResponse> {
    let messages = state.cache.all();
    Json(RetainedResponse {
        total: messages.len(),
        messages,
    })
}

async fn trigger_recovery(
    State(state): State<AppState>,
) -> Result<Json<RecoveryReport>, AppError> {
    let report = state.recovery.recover().await?;
    Ok(Json(report))
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "ingestor",
        timestamp: Utc::now(),
    })
}

fn direct_meta() -> TransportMeta {
    TransportMeta {
        qos: 0,
        retain: false,
        received_at: Utc::now(),
        client_id: None,
    }
}

/// String payloads pass through untouched so the raw log records exactly
/// what was delivered; objects are re-encoded.
fn payload_string(value: &Value) -> Result<String, AppError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        other => serde_json::to_string(other).map_err(|e| AppError::from(Error::Json(e))),
    }
}

fn outcome_response(outcome: IngestOutcome) -> (StatusCode, Json<IngestOutcome>) {
    let status = if outcome.accepted {
        StatusCode::OK
    } else {
        StatusCode::BAD_REQUEST
    };
    (status, Json(outcome))
}

/// Store trouble maps to 503 with a retry hint; everything else is a plain
/// internal error.
#[derive(Debug)]
pub enum AppError {
    Retryable(Error),
    Internal(anyhow::Error),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    retryable: bool,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Retryable(e) => {
                STORE_FAILURES_TOTAL.inc();
                warn!("API error (retryable): {}", e);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(ErrorBody {
                        error: e.to_string(),
                        retryable: true,
                    }),
                )
                    .into_response()
            }
            AppError::Internal(e) => {
                error!("API error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Internal server error: {}", e),
                )
                    .into_response()
            }
        }
    }
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        if err.is_retryable() {
            AppError::Retryable(err)
        } else {
            AppError::Internal(err.into())
        }
    }
}
