// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! HTTP surface for local collectors and monitoring consumers.
//!
//! Ingestion routes accept events and acknowledge the storage/forward
//! attempt without exposing internal record ids. Status and stats routes are
//! strictly read-only. The manual forward trigger rejects while the remote
//! endpoint is unreachable.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use telemetry_buffer::ingest::{IngestService, NewRecord};
use telemetry_buffer::monitor::{DrainTrigger, StatusHandle};
use telemetry_buffer::policy::{BufferConfig, PolicyEngine};
use telemetry_buffer::reaper::Reaper;
use telemetry_buffer::store::BufferStore;
use telemetry_buffer::{BufferError, DataType};
use tokio::sync::mpsc;
use tracing::{debug, error};

#[derive(Clone)]
pub struct AppState {
    pub policy: Arc<PolicyEngine>,
    pub store: BufferStore,
    pub status: StatusHandle,
    pub ingest: Arc<IngestService>,
    pub reaper: Arc<Reaper>,
    pub drain_tx: mpsc::Sender<DrainTrigger>,
}

pub fn make_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/ingest", post(ingest_generic))
        .route("/api/v1/ingest/{data_type}", post(ingest_typed))
        .route("/api/v1/status", get(status))
        .route("/api/v1/stats", get(stats))
        .route("/api/v1/cleanup", post(cleanup))
        .route("/api/v1/config", get(config_get).post(config_set))
        .route("/api/v1/forward", post(forward))
        .fallback(handler_not_found)
        .with_state(state)
}

async fn handler_not_found() -> Response {
    (StatusCode::NOT_FOUND, "Not Found").into_response()
}

/// One typed event as submitted by a collector.
#[derive(Debug, Deserialize)]
struct TypedEvent {
    service: Option<String>,
    timestamp: Option<DateTime<Utc>>,
    source_ip: Option<String>,
    event: Value,
}

async fn ingest_typed(
    State(state): State<AppState>,
    Path(data_type): Path<String>,
    Json(body): Json<TypedEvent>,
) -> Response {
    let data_type = match DataType::parse(&data_type) {
        Ok(dt) => dt,
        Err(e) => return error_response(&e),
    };
    let payload = match serde_json::to_vec(&body.event) {
        Ok(bytes) => bytes,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": format!("unserializable event: {e}")})),
            )
                .into_response()
        }
    };

    let record = NewRecord {
        service: body
            .service
            .unwrap_or_else(|| data_type.as_str().to_string()),
        data_type,
        timestamp: body.timestamp,
        source_ip: body.source_ip,
        payload,
    };

    match state.ingest.submit(record).await {
        Ok(()) => (StatusCode::ACCEPTED, Json(json!({"accepted": true}))).into_response(),
        Err(e) => error_response(&e),
    }
}

/// Heterogeneous array as emitted by a log/metrics pipeline. Missing fields
/// fall back to defaults; items with no usable data type are rejected.
async fn ingest_generic(
    State(state): State<AppState>,
    Json(events): Json<Vec<Value>>,
) -> Response {
    let mut accepted = 0usize;
    let mut rejected = 0usize;

    for event in events {
        match infer_record(&event) {
            Ok(record) => match state.ingest.submit(record).await {
                Ok(()) => accepted += 1,
                Err(e) => {
                    debug!("generic ingest item rejected: {e}");
                    rejected += 1;
                }
            },
            Err(e) => {
                debug!("generic ingest item unparsable: {e}");
                rejected += 1;
            }
        }
    }

    (
        StatusCode::ACCEPTED,
        Json(json!({"accepted": accepted, "rejected": rejected})),
    )
        .into_response()
}

/// Field inference for pipeline-shaped events.
fn infer_record(event: &Value) -> Result<NewRecord, BufferError> {
    let data_type = event
        .get("data_type")
        .or_else(|| event.get("source_type"))
        .and_then(Value::as_str)
        .ok_or_else(|| BufferError::UnsupportedDataType("<missing>".to_string()))?;
    let data_type = DataType::parse(data_type)?;

    let service = event
        .get("service")
        .and_then(Value::as_str)
        .unwrap_or("vector")
        .to_string();
    let timestamp = event
        .get("timestamp")
        .and_then(Value::as_str)
        .and_then(|t| t.parse::<DateTime<Utc>>().ok());
    let source_ip = event
        .get("source_ip")
        .or_else(|| event.get("host"))
        .and_then(Value::as_str)
        .map(String::from)
        .or_else(|| Some("unknown".to_string()));

    let payload = serde_json::to_vec(event)
        .map_err(|e| BufferError::Codec(format!("unserializable event: {e}")))?;

    Ok(NewRecord {
        service,
        data_type,
        timestamp,
        source_ip,
        payload,
    })
}

async fn status(State(state): State<AppState>) -> Response {
    let policy = state.policy.snapshot();
    let size_bytes = state.store.total_size_bytes();
    let cap_bytes = policy.cap_bytes();

    #[allow(clippy::expect_used)]
    let connectivity = state.status.read().expect("status lock poisoned").clone();

    let services = match per_service_stats(&state) {
        Ok(services) => services,
        Err(e) => return error_response(&e),
    };

    Json(json!({
        "enabled": policy.enabled,
        "fast_path_enabled": policy.fast_path_enabled,
        "buffer": {
            "size_bytes": size_bytes,
            "cap_bytes": cap_bytes,
            "percent_used": if cap_bytes == 0 { 0.0 } else {
                (size_bytes as f64 / cap_bytes as f64) * 100.0
            },
            "overflow_action": policy.overflow_action,
        },
        "connectivity": connectivity,
        "services": services,
    }))
    .into_response()
}

async fn stats(State(state): State<AppState>) -> Response {
    let services = match per_service_stats(&state) {
        Ok(services) => services,
        Err(e) => return error_response(&e),
    };

    let mut total_records = 0u64;
    let mut pending = 0u64;
    let mut forwarded = 0u64;
    for value in services.values() {
        total_records += value["total_records"].as_u64().unwrap_or(0);
        pending += value["pending_count"].as_u64().unwrap_or(0);
        forwarded += value["forwarded_count"].as_u64().unwrap_or(0);
    }

    Json(json!({
        "global": {
            "total_records": total_records,
            "pending_count": pending,
            "forwarded_count": forwarded,
            "total_size_bytes": state.store.total_size_bytes(),
        },
        "services": services,
    }))
    .into_response()
}

fn per_service_stats(state: &AppState) -> Result<BTreeMap<String, Value>, BufferError> {
    // Known services are the union of the policy document and everything
    // that ever wrote into the store.
    let policy = state.policy.snapshot();
    let mut names: Vec<String> = policy.services.keys().cloned().collect();
    names.extend(state.store.service_names()?);
    names.sort();
    names.dedup();

    let mut services = BTreeMap::new();
    for name in names {
        let stats = state.store.stats(&name)?;
        let counters = state.store.counters(&name)?;
        services.insert(
            name,
            json!({
                "total_records": stats.total_records,
                "total_size": stats.total_size,
                "oldest": stats.oldest,
                "newest": stats.newest,
                "forwarded_count": stats.forwarded_count,
                "pending_count": stats.pending_count,
                "cumulative": counters,
            }),
        );
    }
    Ok(services)
}

async fn cleanup(State(state): State<AppState>) -> Response {
    match state.reaper.sweep() {
        Ok(deleted) => Json(json!({"deleted": deleted})).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn config_get(State(state): State<AppState>) -> Response {
    Json(state.policy.snapshot().as_ref().clone()).into_response()
}

async fn config_set(
    State(state): State<AppState>,
    Json(config): Json<BufferConfig>,
) -> Response {
    match state.policy.update(config) {
        Ok(()) => Json(json!({"updated": true})).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn forward(State(state): State<AppState>) -> Response {
    #[allow(clippy::expect_used)]
    let connected = state.status.read().expect("status lock poisoned").connected;
    if !connected {
        return error_response(&BufferError::Disconnected);
    }

    // A full capacity-1 channel means a drain is already pending.
    match state.drain_tx.try_send(DrainTrigger::Manual) {
        Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => {
            (StatusCode::ACCEPTED, Json(json!({"triggered": true}))).into_response()
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            error!("drain worker is gone");
            error_response(&BufferError::Forward("drain worker unavailable".to_string()))
        }
    }
}

fn error_response(error: &BufferError) -> Response {
    let status = match error {
        BufferError::Disabled | BufferError::ServiceDisabled(_) => StatusCode::FORBIDDEN,
        BufferError::Overflow(_) => StatusCode::INSUFFICIENT_STORAGE,
        BufferError::UnsupportedDataType(_) | BufferError::Config(_) | BufferError::Codec(_) => {
            StatusCode::BAD_REQUEST
        }
        BufferError::Disconnected => StatusCode::CONFLICT,
        BufferError::Storage(_) | BufferError::Io(_) | BufferError::Forward(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(json!({"error": error.to_string()}))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infer_record_full_event() {
        let event = json!({
            "service": "fluent-bit",
            "data_type": "syslog",
            "timestamp": "2026-08-23T10:00:00Z",
            "source_ip": "10.1.2.3",
            "message": "link up",
        });
        let record = infer_record(&event).unwrap();
        assert_eq!(record.service, "fluent-bit");
        assert_eq!(record.data_type, DataType::Syslog);
        assert!(record.timestamp.is_some());
        assert_eq!(record.source_ip.as_deref(), Some("10.1.2.3"));
    }

    #[test]
    fn test_infer_record_fallbacks() {
        let event = json!({"source_type": "metrics", "value": 1.5});
        let record = infer_record(&event).unwrap();
        assert_eq!(record.service, "vector");
        assert_eq!(record.data_type, DataType::Metrics);
        assert!(record.timestamp.is_none());
        assert_eq!(record.source_ip.as_deref(), Some("unknown"));
    }

    #[test]
    fn test_infer_record_missing_type_is_rejected() {
        let event = json!({"service": "fluent-bit", "message": "no type"});
        let err = infer_record(&event).unwrap_err();
        assert!(matches!(err, BufferError::UnsupportedDataType(_)));
    }

    #[test]
    fn test_infer_record_unknown_type_is_rejected() {
        let event = json!({"data_type": "jaeger"});
        assert!(infer_record(&event).is_err());
    }

    #[test]
    fn test_infer_record_host_doubles_as_source_ip() {
        let event = json!({"data_type": "snmp", "host": "172.16.0.9"});
        let record = infer_record(&event).unwrap();
        assert_eq!(record.source_ip.as_deref(), Some("172.16.0.9"));
    }
}
