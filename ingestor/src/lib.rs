//! MQTT sensor telemetry ingestion with retained-state reconciliation.
//!
//! Messages from broker subscriptions and HTTP surfaces flow through one
//! pipeline: append to a raw arrival log, normalize into readings, mirror
//! retained topic state, and checkpoint. Recovery replays the durable side
//! of that pipeline after restarts or store outages.

pub mod cache;
pub mod config;
pub mod errors;
pub mod ingest;
pub mod metrics;
pub mod model;
pub mod mqtt;
pub mod normalize;
pub mod reconcile;
pub mod recovery;
pub mod rest;
pub mod store;
