//! Process-wide single-stage context.
//!
//! Setup creates one [`StageState`]; destroy drops it. Everything between
//! only reads, so the holder wraps it in a read-mostly lock.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use stagehand_logs::{LogServiceClient, LogServiceConfig};

use crate::stats::StatsCollector;

/// Test-intelligence service endpoint, consumed as an upload sink by the
/// steps that use it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TiConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub account_id: String,
    #[serde(default)]
    pub org_id: String,
    #[serde(default)]
    pub project_id: String,
}

/// Shared stage context. Secrets feed every step's masking pipeline; the
/// log client is shared by every step's remote writer.
pub struct StageState {
    pub secrets: Vec<Vec<u8>>,
    /// Enables the extra masking variants (URL/JSON/shell-expanded).
    pub mask_extra: bool,
    pub log_config: LogServiceConfig,
    pub ti_config: TiConfig,
    pub log_client: Option<Arc<LogServiceClient>>,
    pub stats: Arc<StatsCollector>,
    /// Root token; every step task holds a child of it.
    pub cancel: CancellationToken,
}

impl StageState {
    pub fn new(
        secrets: Vec<Vec<u8>>,
        mask_extra: bool,
        log_config: LogServiceConfig,
        ti_config: TiConfig,
    ) -> Arc<Self> {
        let log_client = log_config
            .is_configured()
            .then(|| Arc::new(LogServiceClient::new(log_config.clone())));
        let stats = Arc::new(StatsCollector::new());
        stats.start();

        Arc::new(Self {
            secrets,
            mask_extra,
            log_config,
            ti_config,
            log_client,
            stats,
            cancel: CancellationToken::new(),
        })
    }

    /// Cancel every step task and stop sampling. Called once by destroy.
    pub fn teardown(&self) {
        self.cancel.cancel();
        self.stats.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_log_client_only_when_configured() {
        let state = StageState::new(
            vec![],
            false,
            LogServiceConfig::default(),
            TiConfig::default(),
        );
        assert!(state.log_client.is_none());

        let state = StageState::new(
            vec![],
            false,
            LogServiceConfig {
                url: "https://logs.example.com".to_string(),
                ..Default::default()
            },
            TiConfig::default(),
        );
        assert!(state.log_client.is_some());
    }

    #[tokio::test]
    async fn test_teardown_cancels_children() {
        let state = StageState::new(
            vec![],
            false,
            LogServiceConfig::default(),
            TiConfig::default(),
        );
        let child = state.cancel.child_token();
        state.teardown();
        assert!(child.is_cancelled());
    }
}
