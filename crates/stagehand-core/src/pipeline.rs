//! Stage-level pipeline configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::step::FileSpec;
use crate::volume::Volume;

/// Target platform of the worker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Platform {
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub arch: String,
}

impl Platform {
    pub fn is_windows(&self) -> bool {
        self.os.eq_ignore_ascii_case("windows")
    }
}

/// The stage network created at setup and shared by every container step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkSpec {
    pub id: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub options: HashMap<String, String>,
}

/// mTLS material handed over by the orchestrator at setup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MtlsMaterial {
    #[serde(default)]
    pub client_cert: String,
    #[serde(default)]
    pub client_key: String,
    #[serde(default)]
    pub ca_cert: String,
}

/// Stage-wide configuration. The `volumes` set is frozen at setup and
/// referenced by name from every step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub platform: Platform,
    #[serde(default)]
    pub envs: HashMap<String, String>,
    /// Stamped onto every container the stage creates, so a restarted
    /// agent can find and remove leftovers by label.
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub volumes: Vec<Volume>,
    #[serde(default)]
    pub network: NetworkSpec,
    #[serde(default)]
    pub files: Vec<FileSpec>,
    #[serde(default)]
    pub enable_tty: bool,
    #[serde(default)]
    pub mtls: MtlsMaterial,
    /// File tracking pids of host-executed steps.
    #[serde(default)]
    pub track_proc_file: String,
    /// Set false on hosts without a container runtime.
    #[serde(default = "default_true")]
    pub enable_docker_setup: bool,
    /// Proxy envs forwarded to the daemon when present.
    #[serde(default)]
    pub proxy_envs: HashMap<String, String>,
}

fn default_true() -> bool {
    true
}

impl PipelineConfig {
    /// Look up a declared volume by name.
    pub fn volume(&self, name: &str) -> Option<&Volume> {
        self.volumes.iter().find(|v| v.name() == name)
    }
}
