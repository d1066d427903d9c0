//! Step specifications and run results.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::volume::VolumeMount;

/// How eagerly the facade pulls a step's image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PullPolicy {
    /// Pull when the image is missing, or when the reference uses the
    /// `:latest` tag.
    #[default]
    Default,
    /// Always pull before create.
    Always,
    /// Pull only when the first create fails with image-not-found.
    IfNotExists,
    /// Never pull; a missing image fails the step.
    Never,
}

/// Registry credentials for a private image. Either username/password or
/// a pre-encoded `auth` blob, as the registry config supplies it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryAuth {
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Base64 `user:password`, used when the split fields are absent.
    #[serde(default)]
    pub auth: String,
}

/// A secret attached to a step. `value` is injected under `env`; when
/// `mask` is set the bytes also feed the output masking pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSecret {
    pub name: String,
    #[serde(default)]
    pub env: String,
    #[serde(with = "serde_bytes_b64", default)]
    pub value: Vec<u8>,
    #[serde(default)]
    pub mask: bool,
}

/// A file materialized before the step runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSpec {
    pub path: String,
    #[serde(default)]
    pub mode: u32,
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub is_dir: bool,
}

/// Container resource limits, passed through to the runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(default)]
    pub cpu_period: i64,
    #[serde(default)]
    pub cpu_quota: i64,
    #[serde(default)]
    pub cpu_shares: i64,
    #[serde(default)]
    pub cpu_set: Vec<String>,
    /// Memory limit in bytes, 0 for unlimited.
    #[serde(default)]
    pub mem_limit: i64,
    /// /dev/shm size in bytes, 0 for the runtime default.
    #[serde(default)]
    pub shm_size: i64,
}

/// A container port published on the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortBinding {
    pub container_port: u16,
    #[serde(default)]
    pub host_port: u16,
    #[serde(default)]
    pub host_ip: String,
}

/// One step of a stage. `id` is unique within the stage and keys every
/// later poll and stream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepSpec {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Executable plus leading arguments; the step command is appended.
    #[serde(default)]
    pub entrypoint: Vec<String>,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub envs: HashMap<String, String>,
    #[serde(default)]
    pub working_dir: String,
    #[serde(default)]
    pub secrets: Vec<StepSecret>,
    #[serde(default)]
    pub volumes: Vec<VolumeMount>,
    #[serde(default)]
    pub files: Vec<FileSpec>,
    /// Seconds; 0 disables the timeout.
    #[serde(default)]
    pub timeout: u64,
    /// Detached steps return from Start immediately and keep running.
    #[serde(default)]
    pub detach: bool,
    /// Prefer a graceful stop over kill when the step is torn down.
    #[serde(default)]
    pub soft_stop: bool,
    /// Keys scraped from the step's environment dump after exit.
    #[serde(default)]
    pub output_vars: Vec<String>,
    /// `KEY=VALUE` file written by the step; takes precedence over
    /// `output_vars` scraping.
    #[serde(default)]
    pub output_var_file: String,
    /// `KEY=VALUE` file of secrets exported by the step.
    #[serde(default)]
    pub secret_var_file: String,
    /// Scratch directory shared with the step; artifact bytes are loaded
    /// from a well-known path under it.
    #[serde(default)]
    pub scratch_dir: String,
    /// Remote log stream key; empty disables remote upload.
    #[serde(default)]
    pub log_key: String,

    // Container-only fields. An empty image selects host execution.
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub pull_policy: PullPolicy,
    #[serde(default)]
    pub auth: Option<RegistryAuth>,
    #[serde(default)]
    pub limits: ResourceLimits,
    #[serde(default)]
    pub dns: Vec<String>,
    #[serde(default)]
    pub extra_hosts: Vec<String>,
    #[serde(default)]
    pub port_bindings: Vec<PortBinding>,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default)]
    pub network: String,
    #[serde(default)]
    pub network_aliases: Vec<String>,
    #[serde(default)]
    pub user: String,
}

impl StepSpec {
    /// True when the step runs directly on the host.
    pub fn is_host(&self) -> bool {
        self.image.is_empty()
    }

    /// The full argv: entrypoint followed by the command.
    pub fn argv(&self) -> Vec<String> {
        let mut argv = self.entrypoint.clone();
        argv.extend(self.command.iter().cloned());
        argv
    }

    /// Secret byte values that must be masked in step output.
    pub fn masked_secrets(&self) -> Vec<Vec<u8>> {
        self.secrets
            .iter()
            .filter(|s| s.mask && !s.value.is_empty())
            .map(|s| s.value.clone())
            .collect()
    }
}

/// Terminal description of one run attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    pub exited: bool,
    pub exit_code: i32,
    #[serde(default)]
    pub oom_killed: bool,
}

impl RunState {
    pub fn exited(code: i32) -> Self {
        Self {
            exited: true,
            exit_code: code,
            oom_killed: false,
        }
    }

    /// The in-progress indicator returned for detached or still-running
    /// steps.
    pub fn running() -> Self {
        Self::default()
    }
}

mod serde_bytes_b64 {
    //! Secret bytes travel as base64 strings on the wire.

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        use base64::{Engine as _, engine::general_purpose::STANDARD};
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        use base64::{Engine as _, engine::general_purpose::STANDARD};
        let s = String::deserialize(de)?;
        STANDARD
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
