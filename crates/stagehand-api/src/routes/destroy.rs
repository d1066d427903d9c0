//! Stage teardown.
//!
//! Order matters: the agent logfile upload happens first under its own
//! 60 s bound, then steps are cancelled, then the container sandbox is
//! removed. Upload errors end up in the response but never block the
//! teardown itself.

use axum::Json;
use axum::extract::State;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

use stagehand_engine::OsStats;
use stagehand_logs::remote::{LogSink, RemoteLine};

use crate::error::ApiError;
use crate::state::AppState;

/// Upper bound on the logfile upload.
const LOG_UPLOAD_TIMEOUT: Duration = Duration::from_secs(60);
/// Only the tail of the agent logfile is uploaded.
const LOG_UPLOAD_MAX_LINES: usize = 10_000;

#[derive(Debug, Default, Deserialize)]
pub struct DestroyRequest {
    /// Remote log key for the agent logfile; empty skips the upload.
    #[serde(default)]
    pub log_key: String,
    /// When set, also remove containers matching these labels. Covers
    /// leftovers from a previous agent run.
    #[serde(default)]
    pub labels: std::collections::HashMap<String, String>,
}

#[derive(Debug, Serialize)]
pub struct DestroyResponse {
    pub os_stats: OsStats,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error_msg: String,
}

pub async fn destroy(
    State(state): State<AppState>,
    req: Option<Json<DestroyRequest>>,
) -> Result<Json<DestroyResponse>, ApiError> {
    let req = req.map(|Json(r)| r).unwrap_or_default();

    // Teardown runs on its own task: dropping the request (client gone,
    // deadline hit) must not leave the stage half-destroyed.
    let work = tokio::spawn(destroy_inner(state, req));
    let response = work
        .await
        .map_err(|e| ApiError::Internal(format!("destroy task: {e}")))?;
    Ok(Json(response))
}

async fn destroy_inner(state: AppState, req: DestroyRequest) -> DestroyResponse {
    let stage = state.stage.write().await.take();

    let mut errors = Vec::new();
    let mut stats = OsStats::default();

    if let Some(stage) = stage {
        if !req.log_key.is_empty() {
            if let Some(client) = &stage.log_client {
                let upload = upload_agent_log(client.as_ref(), &req.log_key, &state.log_file);
                match tokio::time::timeout(LOG_UPLOAD_TIMEOUT, upload).await {
                    Ok(Ok(())) => info!("agent logfile uploaded"),
                    Ok(Err(e)) => {
                        warn!(error = %e, "agent logfile upload failed");
                        errors.push(format!("log upload: {e}"));
                    }
                    Err(_) => {
                        warn!("agent logfile upload timed out");
                        errors.push("log upload: timed out".to_string());
                    }
                }
            }
        }

        // Cancel every step task, then take the sandbox down.
        stage.teardown();
        state.steps.destroy().await;
        stats = stage.stats.aggregate();
    }

    state.engine.destroy().await;

    if !req.labels.is_empty() {
        if let Err(e) = state.engine.destroy_by_label(&req.labels).await {
            warn!(error = %e, "destroy by label failed");
            errors.push(format!("destroy by label: {e}"));
        }
    }

    info!(samples = stats.samples, "stage destroyed");
    DestroyResponse {
        os_stats: stats,
        error_msg: errors.join("; "),
    }
}

async fn upload_agent_log(
    sink: &dyn LogSink,
    key: &str,
    path: &str,
) -> stagehand_core::Result<()> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| stagehand_core::Error::Internal(format!("read {path}: {e}")))?;

    let lines: Vec<&str> = content.lines().collect();
    let skip = lines.len().saturating_sub(LOG_UPLOAD_MAX_LINES);
    let remote: Vec<RemoteLine> = lines
        .into_iter()
        .skip(skip)
        .enumerate()
        .map(|(pos, text)| RemoteLine {
            level: "info".to_string(),
            pos: pos as u64,
            out: format!("{text}\n"),
            time: chrono::Utc::now(),
        })
        .collect();

    sink.upload_blob(key, &remote).await
}
