//! Step start, poll, and stream.

use axum::Json;
use axum::body::Body;
use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::wrappers::ReceiverStream;

use stagehand_core::step::StepSpec;
use stagehand_engine::StepRecord;
use stagehand_logs::Line;

use crate::error::ApiError;
use crate::state::AppState;

pub async fn start_step(
    State(state): State<AppState>,
    Json(step): Json<StepSpec>,
) -> Result<Json<Value>, ApiError> {
    let stage = state
        .stage()
        .await
        .ok_or_else(|| ApiError::BadRequest("stage not set up".to_string()))?;
    state.steps.start(stage, step).await?;
    Ok(Json(json!({})))
}

#[derive(Debug, Deserialize)]
pub struct PollStepRequest {
    pub id: String,
    /// Absent waits for completion; zero returns immediately.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct OutputV2 {
    pub key: String,
    pub value: String,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Serialize)]
pub struct PollStepResponse {
    pub exited: bool,
    pub exit_code: i32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
    pub oom_killed: bool,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub outputs: HashMap<String, String>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub envs: HashMap<String, String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub artifact: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub output_v2: Vec<OutputV2>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub optimization_state: String,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub telemetry_data: Value,
}

impl From<StepRecord> for PollStepResponse {
    fn from(record: StepRecord) -> Self {
        use base64::{Engine as _, engine::general_purpose::STANDARD};

        let output_v2 = record
            .outputs
            .iter()
            .map(|(key, value)| OutputV2 {
                key: key.clone(),
                value: value.clone(),
                kind: "string".to_string(),
            })
            .collect();

        Self {
            exited: record.run.exited,
            exit_code: record.run.exit_code,
            error: record.error,
            oom_killed: record.run.oom_killed,
            outputs: record.outputs,
            envs: record.envs,
            artifact: if record.artifact.is_empty() {
                String::new()
            } else {
                STANDARD.encode(&record.artifact)
            },
            output_v2,
            optimization_state: record.optimization_state,
            telemetry_data: Value::Null,
        }
    }
}

pub async fn poll_step(
    State(state): State<AppState>,
    Json(req): Json<PollStepRequest>,
) -> Result<Json<PollStepResponse>, ApiError> {
    let timeout = req.timeout_secs.map(Duration::from_secs);
    let record = state.steps.poll(&req.id, timeout).await?;
    Ok(Json(PollStepResponse::from(record)))
}

#[derive(Debug, Deserialize)]
pub struct StreamOutputRequest {
    pub id: String,
    #[serde(default)]
    pub offset: u64,
}

/// Chunked raw log bytes: the retained snapshot first, then every batch
/// published until the buffer closes or the client goes away.
pub async fn stream_output(
    State(state): State<AppState>,
    Json(req): Json<StreamOutputRequest>,
) -> Result<Response, ApiError> {
    let handle = state.steps.stream(&req.id, req.offset)?;
    let tail = handle.tail;
    let mut sub = handle.sub;
    let snapshot = handle.snapshot;

    let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(64);
    tokio::spawn(async move {
        let chunk = render_lines(snapshot.iter());
        if !chunk.is_empty() && tx.send(chunk).await.is_err() {
            return;
        }
        while let Some(batch) = sub.rx.recv().await {
            // The channel was subscribed before the snapshot was taken,
            // so early batches can overlap it.
            let fresh = render_lines(batch.iter().filter(|l| l.seq >= tail));
            if !fresh.is_empty() && tx.send(fresh).await.is_err() {
                return;
            }
        }
    });

    let body = Body::from_stream(ReceiverStream::new(rx).map(Ok::<_, Infallible>));
    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], body).into_response())
}

fn render_lines<'a>(lines: impl Iterator<Item = &'a Line>) -> Bytes {
    let mut text = String::new();
    for line in lines {
        text.push_str(&line.text);
        text.push('\n');
    }
    Bytes::from(text)
}
