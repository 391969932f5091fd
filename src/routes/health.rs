use axum::{http::StatusCode, Json};
use serde_json::{json, Value};

use crate::services::metrics;

pub async fn health_check() -> (StatusCode, Json<Value>) {
    (StatusCode::OK, Json(json!({ "status": "ok" })))
}

pub async fn prometheus_metrics() -> String {
    metrics::render()
}
