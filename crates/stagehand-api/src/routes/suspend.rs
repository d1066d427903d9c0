//! Auxiliary-container suspend.

use axum::Json;
use axum::extract::State;
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct SuspendRequest {
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub log_key: String,
}

/// Remove exited containers matching the labels.
pub async fn suspend(
    State(state): State<AppState>,
    Json(req): Json<SuspendRequest>,
) -> Result<Json<Value>, ApiError> {
    state.engine.suspend(&req.labels).await?;
    Ok(Json(json!({})))
}
