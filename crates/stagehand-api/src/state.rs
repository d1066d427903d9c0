//! Application state.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use stagehand_engine::{Engine, StageState, StepExecutor};

/// Shared application state. The stage slot is written only by setup and
/// destroy; everything else reads.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub steps: Arc<StepExecutor>,
    pub stage: Arc<RwLock<Option<Arc<StageState>>>>,
    /// Proxy envs from the process environment, merged into the pipeline
    /// at setup.
    pub proxy_envs: HashMap<String, String>,
    /// Agent logfile path uploaded by destroy.
    pub log_file: String,
}

impl AppState {
    pub fn new(proxy_envs: HashMap<String, String>, log_file: String) -> Self {
        let engine = Engine::new();
        let steps = StepExecutor::new(Arc::clone(&engine));
        Self {
            engine,
            steps,
            stage: Arc::new(RwLock::new(None)),
            proxy_envs,
            log_file,
        }
    }

    /// The current stage context, if setup has run.
    pub async fn stage(&self) -> Option<Arc<StageState>> {
        self.stage.read().await.clone()
    }
}
