//! Volume variants.
//!
//! A stage declares its volumes once at setup; steps reference them by
//! name. The set of kinds is closed: the container facade dispatches on
//! the tag to decide between bind mounts, data volumes, tmpfs, device
//! mappings, and named pipes.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Prefix that marks a host path as a Windows named pipe.
pub const PIPE_PREFIX: &str = r"\\.\pipe\";

/// A volume declared at stage level.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Volume {
    /// A volume with no host backing. With `medium = "memory"` it becomes
    /// a tmpfs mount; otherwise a named data volume managed by the
    /// container runtime.
    EmptyDir {
        id: String,
        name: String,
        #[serde(default)]
        medium: String,
        /// Size limit in bytes, 0 for unlimited.
        #[serde(default)]
        size_limit: u64,
        #[serde(default)]
        labels: HashMap<String, String>,
    },
    /// A path on the worker host bind-mounted into step containers.
    HostPath {
        id: String,
        name: String,
        path: String,
        #[serde(default)]
        read_only: bool,
        /// Create the host path during stage setup if missing.
        #[serde(default)]
        create: bool,
        /// Remove the host path during stage destroy.
        #[serde(default)]
        remove: bool,
        #[serde(default)]
        labels: HashMap<String, String>,
    },
}

impl Volume {
    pub fn id(&self) -> &str {
        match self {
            Volume::EmptyDir { id, .. } => id,
            Volume::HostPath { id, .. } => id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Volume::EmptyDir { name, .. } => name,
            Volume::HostPath { name, .. } => name,
        }
    }

    /// A device mapping is a host path under `/dev/`.
    pub fn is_device(&self) -> bool {
        matches!(self, Volume::HostPath { path, .. } if path.starts_with("/dev/"))
    }

    /// A named pipe is a host path using the platform pipe prefix.
    pub fn is_named_pipe(&self) -> bool {
        matches!(self, Volume::HostPath { path, .. } if path.starts_with(PIPE_PREFIX))
    }

    /// A plain bind mount: host path that is neither a device nor a pipe.
    pub fn is_bind(&self) -> bool {
        matches!(self, Volume::HostPath { .. }) && !self.is_device() && !self.is_named_pipe()
    }

    /// A data volume is an empty-dir with a non-memory medium; it is
    /// materialized as a runtime-managed named volume at setup.
    pub fn is_data_volume(&self) -> bool {
        matches!(self, Volume::EmptyDir { medium, .. } if medium != "memory")
    }

    /// A tmpfs mount is an empty-dir with the memory medium.
    pub fn is_tmpfs(&self) -> bool {
        matches!(self, Volume::EmptyDir { medium, .. } if medium == "memory")
    }
}

/// A step-level reference mounting a declared volume at a path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeMount {
    /// Name of a stage-declared volume.
    pub name: String,
    /// Mount path inside the step container.
    pub path: String,
}
