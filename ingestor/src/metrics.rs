use lazy_static::lazy_static;
use prometheus::{Counter, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_messages_total",
        "Total messages entering the ingestion pipeline"
    ))
    .unwrap();
    pub static ref READINGS_ACCEPTED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_readings_accepted_total",
        "Total messages normalized into readings"
    ))
    .unwrap();
    pub static ref REJECTED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_rejected_total",
        "Total sensor payloads rejected by validation"
    ))
    .unwrap();
    pub static ref PARSE_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_parse_failures_total",
        "Total payloads that failed to decode as JSON"
    ))
    .unwrap();
    pub static ref DUPLICATES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_duplicates_total",
        "Total readings suppressed by natural-key dedup"
    ))
    .unwrap();
    pub static ref STORE_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_store_failures_total",
        "Total store operations that failed"
    ))
    .unwrap();
    pub static ref RECOVERY_RUNS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_recovery_runs_total",
        "Total recovery passes started"
    ))
    .unwrap();
    pub static ref RECOVERY_READINGS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_recovery_readings_total",
        "Total readings created by recovery passes"
    ))
    .unwrap();
    pub static ref RETAINED_CACHE_ENTRIES: Gauge = Gauge::with_opts(Opts::new(
        "ingestor_retained_cache_entries",
        "Topics currently held in the retained cache"
    ))
    .unwrap();
    pub static ref INGEST_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "ingestor_ingest_latency_seconds",
            "Time from dequeue to persisted outcome"
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0
        ])
    )
    .unwrap();
    pub static ref CHANNEL_FULL_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_channel_full_total",
        "Total number of times channel was full (backpressure events)"
    ))
    .unwrap();
}

pub fn init_metrics() {
    REGISTRY.register(Box::new(MESSAGES_TOTAL.clone())).unwrap();
    REGISTRY
        .register(Box::new(READINGS_ACCEPTED_TOTAL.clone()))
        .unwrap();
    REGISTRY.register(Box::new(REJECTED_TOTAL.clone())).unwrap();
    REGISTRY
        .register(Box::new(PARSE_FAILURES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(DUPLICATES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(STORE_FAILURES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(RECOVERY_RUNS_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(RECOVERY_READINGS_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(RETAINED_CACHE_ENTRIES.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(INGEST_LATENCY_SECONDS.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(CHANNEL_FULL_TOTAL.clone()))
        .unwrap();
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}
