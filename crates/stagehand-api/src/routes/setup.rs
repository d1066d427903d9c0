//! Stage setup.

use axum::Json;
use axum::extract::State;
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use tracing::info;

use stagehand_core::pipeline::{MtlsMaterial, NetworkSpec, PipelineConfig, Platform};
use stagehand_core::step::FileSpec;
use stagehand_core::volume::{PIPE_PREFIX, Volume};
use stagehand_engine::{StageState, TiConfig};
use stagehand_logs::LogServiceConfig;

use crate::error::ApiError;
use crate::state::AppState;

/// Shared workspace mounted into every container step, and reused as the
/// output-var/scratch location.
const STAGE_VOLUME_NAME: &str = "_stage";
const STAGE_VOLUME_PATH: &str = "/tmp/stagehand/workspace";

const SOCKET_VOLUME_NAME: &str = "_docker_socket";
const UNIX_SOCKET_PATH: &str = "/var/run/docker.sock";

#[derive(Debug, Default, Deserialize)]
pub struct SetupRequest {
    #[serde(default)]
    pub envs: HashMap<String, String>,
    /// Stamped onto every container the stage creates.
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub volumes: Vec<Volume>,
    #[serde(default)]
    pub secrets: Vec<String>,
    #[serde(default)]
    pub files: Vec<FileSpec>,
    #[serde(default)]
    pub network: NetworkSpec,
    #[serde(default)]
    pub platform: Platform,
    #[serde(default)]
    pub log_config: LogServiceConfig,
    #[serde(default)]
    pub ti_config: TiConfig,
    /// Bind-mount the container runtime socket into steps.
    #[serde(default)]
    pub mount_docker_socket: bool,
    #[serde(default)]
    pub tty: bool,
    #[serde(default)]
    pub mtls: MtlsMaterial,
    /// Enable the extra secret-masking variants.
    #[serde(default)]
    pub mask_extra: bool,
    #[serde(default)]
    pub track_proc_file: String,
    #[serde(default = "default_true")]
    pub enable_docker_setup: bool,
}

fn default_true() -> bool {
    true
}

pub async fn setup(
    State(state): State<AppState>,
    Json(req): Json<SetupRequest>,
) -> Result<Json<Value>, ApiError> {
    if state.stage().await.is_some() {
        return Err(ApiError::BadRequest("stage already set up".to_string()));
    }

    let mut volumes = req.volumes;
    volumes.push(Volume::HostPath {
        id: STAGE_VOLUME_NAME.to_string(),
        name: STAGE_VOLUME_NAME.to_string(),
        path: STAGE_VOLUME_PATH.to_string(),
        read_only: false,
        create: true,
        remove: false,
        labels: HashMap::new(),
    });
    if req.mount_docker_socket {
        let socket_path = if req.platform.is_windows() {
            format!("{PIPE_PREFIX}docker_engine")
        } else {
            UNIX_SOCKET_PATH.to_string()
        };
        volumes.push(Volume::HostPath {
            id: SOCKET_VOLUME_NAME.to_string(),
            name: SOCKET_VOLUME_NAME.to_string(),
            path: socket_path,
            read_only: false,
            create: false,
            remove: false,
            labels: HashMap::new(),
        });
    }

    let pipeline = PipelineConfig {
        platform: req.platform,
        envs: req.envs,
        labels: req.labels,
        volumes,
        network: req.network,
        files: req.files,
        enable_tty: req.tty,
        mtls: req.mtls,
        track_proc_file: req.track_proc_file,
        enable_docker_setup: req.enable_docker_setup,
        proxy_envs: state.proxy_envs.clone(),
    };

    state.engine.setup(pipeline).await.map_err(ApiError::from)?;

    let secrets = req.secrets.into_iter().map(String::into_bytes).collect();
    let stage = StageState::new(secrets, req.mask_extra, req.log_config, req.ti_config);
    *state.stage.write().await = Some(stage);

    info!("stage set up");
    Ok(Json(json!({})))
}
