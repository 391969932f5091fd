use axum::{extract::State, Json};
use serde_json::Value;

use crate::AppState;

/// Published verification key set for relying parties.
pub async fn jwks(State(state): State<AppState>) -> Json<Value> {
    Json(state.tokens.jwks())
}

pub async fn openid_configuration(State(state): State<AppState>) -> Json<Value> {
    Json(state.tokens.openid_configuration())
}
