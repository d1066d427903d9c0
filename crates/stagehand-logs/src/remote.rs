//! Remote log service client and the per-step upload writer.
//!
//! The writer subscribes to a step's stream buffer and drains it on a
//! background task, batching lines by count or elapsed time. Upload
//! failures retry with exponential backoff; once the retry budget is
//! spent the error is recorded and later writes become no-ops.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::buffer::{Line, Subscription};
use stagehand_core::{Error, Result};

/// Lines per upload batch.
const MAX_BATCH_LINES: usize = 100;
/// Elapsed-time flush interval.
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);
/// Upload attempts before the writer gives up.
const MAX_ATTEMPTS: u32 = 3;
/// Base delay for exponential backoff between attempts.
const BACKOFF_BASE: Duration = Duration::from_millis(250);

/// Remote log service endpoint configuration, handed over at setup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogServiceConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub account_id: String,
    /// Skip the open/append protocol and upload one snapshot blob at
    /// close instead.
    #[serde(default)]
    pub skip_opening_stream: bool,
}

impl LogServiceConfig {
    pub fn is_configured(&self) -> bool {
        !self.url.is_empty()
    }
}

/// One line on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteLine {
    pub level: String,
    pub pos: u64,
    pub out: String,
    pub time: chrono::DateTime<chrono::Utc>,
}

impl From<&Line> for RemoteLine {
    fn from(line: &Line) -> Self {
        Self {
            level: "info".to_string(),
            pos: line.seq,
            out: format!("{}\n", line.text),
            time: chrono::Utc::now(),
        }
    }
}

/// Upload sink. The HTTP client implements this; tests substitute a
/// recording sink.
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn open(&self, key: &str) -> Result<()>;
    async fn write_batch(&self, key: &str, lines: &[RemoteLine]) -> Result<()>;
    async fn close_stream(&self, key: &str) -> Result<()>;
    async fn upload_blob(&self, key: &str, lines: &[RemoteLine]) -> Result<()>;
}

/// HTTP client for the remote log service.
pub struct LogServiceClient {
    http: reqwest::Client,
    cfg: LogServiceConfig,
}

impl LogServiceClient {
    pub fn new(cfg: LogServiceConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            cfg,
        }
    }

    pub fn config(&self) -> &LogServiceConfig {
        &self.cfg
    }

    fn endpoint(&self, path: &str, key: &str) -> String {
        format!(
            "{}/{}?accountID={}&key={}",
            self.cfg.url.trim_end_matches('/'),
            path,
            urlencoding::encode(&self.cfg.account_id),
            urlencoding::encode(key)
        )
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<()> {
        let resp = req
            .header("X-Api-Key", &self.cfg.token)
            .send()
            .await
            .map_err(|e| Error::Internal(format!("log service request: {e}")))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(Error::Internal(format!(
                "log service returned {}",
                resp.status()
            )))
        }
    }
}

#[async_trait]
impl LogSink for LogServiceClient {
    async fn open(&self, key: &str) -> Result<()> {
        self.send(self.http.post(self.endpoint("stream", key))).await
    }

    async fn write_batch(&self, key: &str, lines: &[RemoteLine]) -> Result<()> {
        self.send(self.http.put(self.endpoint("stream", key)).json(lines))
            .await
    }

    async fn close_stream(&self, key: &str) -> Result<()> {
        self.send(self.http.delete(self.endpoint("stream", key))).await
    }

    async fn upload_blob(&self, key: &str, lines: &[RemoteLine]) -> Result<()> {
        self.send(self.http.post(self.endpoint("blob", key)).json(lines))
            .await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterState {
    Created,
    Opened,
    Running,
    Closed,
}

/// Per-step uploader. Lifecycle: `open` → `start` → `close`.
pub struct RemoteLogWriter {
    sink: Arc<dyn LogSink>,
    key: String,
    skip_opening_stream: bool,
    state: WriterState,
    drain: Option<JoinHandle<Vec<RemoteLine>>>,
    error: Arc<parking_lot::Mutex<Option<String>>>,
}

impl RemoteLogWriter {
    pub fn new(sink: Arc<dyn LogSink>, key: impl Into<String>, skip_opening_stream: bool) -> Self {
        Self {
            sink,
            key: key.into(),
            skip_opening_stream,
            state: WriterState::Created,
            drain: None,
            error: Arc::new(parking_lot::Mutex::new(None)),
        }
    }

    /// Issue the create-stream call unless snapshot mode is on.
    pub async fn open(&mut self) -> Result<()> {
        if self.state != WriterState::Created {
            return Ok(());
        }
        if !self.skip_opening_stream {
            upload_with_retry(&self.error, || {
                let sink = Arc::clone(&self.sink);
                let key = self.key.clone();
                async move { sink.open(&key).await }
            })
            .await;
        }
        self.state = WriterState::Opened;
        Ok(())
    }

    /// Begin the background drain over a buffer subscription.
    pub fn start(&mut self, mut sub: Subscription) {
        if self.state != WriterState::Opened {
            warn!(key = %self.key, state = ?self.state, "remote writer started out of order");
        }
        self.state = WriterState::Running;

        let sink = Arc::clone(&self.sink);
        let key = self.key.clone();
        let error = Arc::clone(&self.error);
        let snapshot_mode = self.skip_opening_stream;

        self.drain = Some(tokio::spawn(async move {
            let mut batch: Vec<RemoteLine> = Vec::new();
            let mut all: Vec<RemoteLine> = Vec::new();
            let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    received = sub.rx.recv() => match received {
                        Some(lines) => {
                            for line in &lines {
                                batch.push(RemoteLine::from(line));
                            }
                            if snapshot_mode {
                                all.append(&mut batch);
                            } else if batch.len() >= MAX_BATCH_LINES {
                                flush(&*sink, &key, &mut batch, &error).await;
                            }
                        }
                        // Buffer closed; residue is flushed by close().
                        None => break,
                    },
                    _ = ticker.tick() => {
                        if !snapshot_mode && !batch.is_empty() {
                            flush(&*sink, &key, &mut batch, &error).await;
                        }
                    }
                }
            }

            if snapshot_mode {
                all.append(&mut batch);
                all
            } else {
                batch
            }
        }));
    }

    /// Drain, upload the residue (or the snapshot blob), release the
    /// stream. Idempotent.
    pub async fn close(&mut self) {
        if self.state == WriterState::Closed {
            return;
        }
        self.state = WriterState::Closed;

        let residue = match self.drain.take() {
            Some(handle) => match handle.await {
                Ok(lines) => lines,
                Err(e) => {
                    self.record_error(format!("drain task failed: {e}"));
                    Vec::new()
                }
            },
            None => Vec::new(),
        };

        if self.skip_opening_stream {
            if !residue.is_empty() {
                upload_with_retry(&self.error, || {
                    let sink = Arc::clone(&self.sink);
                    let key = self.key.clone();
                    let lines = residue.clone();
                    async move { sink.upload_blob(&key, &lines).await }
                })
                .await;
            }
            return;
        }

        if !residue.is_empty() {
            upload_with_retry(&self.error, || {
                let sink = Arc::clone(&self.sink);
                let key = self.key.clone();
                let lines = residue.clone();
                async move { sink.write_batch(&key, &lines).await }
            })
            .await;
        }
        upload_with_retry(&self.error, || {
            let sink = Arc::clone(&self.sink);
            let key = self.key.clone();
            async move { sink.close_stream(&key).await }
        })
        .await;
    }

    /// The first recorded upload error, if any.
    pub fn error(&self) -> Option<String> {
        self.error.lock().clone()
    }

    fn record_error(&self, msg: String) {
        let mut slot = self.error.lock();
        if slot.is_none() {
            *slot = Some(msg);
        }
    }
}

async fn flush(
    sink: &dyn LogSink,
    key: &str,
    batch: &mut Vec<RemoteLine>,
    error: &Arc<parking_lot::Mutex<Option<String>>>,
) {
    if batch.is_empty() || error.lock().is_some() {
        // After the retry budget is spent, writes become no-ops.
        batch.clear();
        return;
    }
    let lines = std::mem::take(batch);
    let mut attempt = 0u32;
    loop {
        match sink.write_batch(key, &lines).await {
            Ok(()) => {
                debug!(key, lines = lines.len(), "uploaded log batch");
                return;
            }
            Err(e) => {
                attempt += 1;
                if attempt >= MAX_ATTEMPTS {
                    warn!(key, error = %e, "log upload failed, disabling writer");
                    let mut slot = error.lock();
                    if slot.is_none() {
                        *slot = Some(e.to_string());
                    }
                    return;
                }
                tokio::time::sleep(BACKOFF_BASE * 2u32.pow(attempt - 1)).await;
            }
        }
    }
}

async fn upload_with_retry<F, Fut>(
    error: &Arc<parking_lot::Mutex<Option<String>>>,
    mut call: F,
) where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    if error.lock().is_some() {
        return;
    }
    let mut attempt = 0u32;
    loop {
        match call().await {
            Ok(()) => return,
            Err(e) => {
                attempt += 1;
                if attempt >= MAX_ATTEMPTS {
                    warn!(error = %e, "log service call failed after retries");
                    let mut slot = error.lock();
                    if slot.is_none() {
                        *slot = Some(e.to_string());
                    }
                    return;
                }
                tokio::time::sleep(BACKOFF_BASE * 2u32.pow(attempt - 1)).await;
            }
        }
    }
}
