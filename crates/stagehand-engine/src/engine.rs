//! Per-stage resource owner.
//!
//! Setup materializes declared files and volumes and prepares the
//! container facade; run dispatches each step to the host or container
//! backend; destroy tears the stage sandbox down best-effort.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use stagehand_core::pipeline::{PipelineConfig, Platform};
use stagehand_core::step::{FileSpec, StepSpec};
use stagehand_core::volume::Volume;
use stagehand_core::{Error, Result, RunState};
use stagehand_executor::{DockerEngine, HostEngine};
use stagehand_logs::StepLog;

/// The docker socket keeps its platform spelling on either platform.
const UNIX_DOCKER_SOCK: &str = "/var/run/docker.sock";
const WINDOWS_DOCKER_PIPE: &str = r"\\.\pipe\docker_engine";

struct StageSetup {
    pipeline: PipelineConfig,
    docker: Option<Arc<DockerEngine>>,
}

/// Owns the stage sandbox and chooses host vs container execution.
pub struct Engine {
    host: HostEngine,
    setup: Mutex<Option<StageSetup>>,
}

impl Engine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            host: HostEngine::new(),
            setup: Mutex::new(None),
        })
    }

    /// Prepare the stage: declared files and directories, host volume
    /// paths, and (unless disabled) the container facade's resources.
    pub async fn setup(&self, mut pipeline: PipelineConfig) -> Result<()> {
        if self.setup.lock().is_some() {
            return Err(Error::BadRequest("stage already set up".to_string()));
        }

        for file in &pipeline.files {
            materialize_file(file).await?;
        }

        for volume in &mut pipeline.volumes {
            if let Volume::HostPath {
                path, create, ..
            } = volume
            {
                *path = normalize_path(path, &pipeline.platform);
                let is_pipe = path.starts_with(r"\\.\pipe\");
                if *create && !is_pipe && !path.starts_with("/dev/") {
                    tokio::fs::create_dir_all(&path).await.map_err(|e| {
                        Error::Internal(format!("create volume path {path}: {e}"))
                    })?;
                    debug!(path = %path, "created host volume path");
                }
            }
        }

        let docker = if pipeline.enable_docker_setup {
            let docker = Arc::new(DockerEngine::new()?);
            docker.setup(&pipeline).await?;
            Some(docker)
        } else {
            info!("container runtime setup disabled");
            None
        };

        *self.setup.lock() = Some(StageSetup { pipeline, docker });
        Ok(())
    }

    /// Run one step. Stage envs are overlaid by step envs, secret envs
    /// are injected, and the step's own files are materialized first.
    pub async fn run(
        &self,
        cancel: CancellationToken,
        step: &StepSpec,
        out: Arc<StepLog>,
    ) -> Result<RunState> {
        let (pipeline, docker) = {
            let guard = self.setup.lock();
            let Some(setup) = guard.as_ref() else {
                return Err(Error::Internal("stage not set up".to_string()));
            };
            (setup.pipeline.clone(), setup.docker.clone())
        };

        for file in &step.files {
            materialize_file(file).await?;
        }

        let mut envs = pipeline.envs.clone();
        envs.extend(step.envs.clone());
        for secret in &step.secrets {
            if !secret.env.is_empty() {
                envs.insert(
                    secret.env.clone(),
                    String::from_utf8_lossy(&secret.value).into_owned(),
                );
            }
        }

        if step.is_host() {
            self.host
                .run(cancel, step, envs, &pipeline.track_proc_file, out)
                .await
        } else {
            let Some(docker) = docker else {
                return Err(Error::ExecutionFailed(
                    "container step on a host without a container runtime".to_string(),
                ));
            };
            docker.run(cancel, &pipeline, step, envs, out).await
        }
    }

    /// Stop a step's container out-of-band, for timeout enforcement.
    /// Host steps are aborted through their cancellation token instead.
    pub async fn abort_step(&self, step: &StepSpec) {
        if step.is_host() {
            return;
        }
        let docker = self.setup.lock().as_ref().and_then(|s| s.docker.clone());
        if let Some(docker) = docker {
            docker.abort(&step.name, step.soft_stop).await;
        }
    }

    /// Tear the stage down. Idempotent: the second call finds nothing.
    pub async fn destroy(&self) {
        let Some(setup) = self.setup.lock().take() else {
            debug!("destroy called with no stage set up");
            return;
        };

        if let Some(docker) = &setup.docker {
            docker.destroy(&setup.pipeline).await;
        }

        for volume in &setup.pipeline.volumes {
            if let Volume::HostPath {
                path, remove: true, ..
            } = volume
            {
                if let Err(e) = tokio::fs::remove_dir_all(path).await {
                    warn!(path = %path, error = %e, "host volume remove failed");
                }
            }
        }
    }

    /// Stateless teardown of containers matching the labels. Works with
    /// or without a live stage, for recovery after an agent restart.
    pub async fn destroy_by_label(&self, labels: &HashMap<String, String>) -> Result<()> {
        if labels.is_empty() {
            return Ok(());
        }
        let (pipeline, docker) = {
            let guard = self.setup.lock();
            match guard.as_ref() {
                Some(setup) => (setup.pipeline.clone(), setup.docker.clone()),
                None => (PipelineConfig::default(), None),
            }
        };
        let docker = match docker {
            Some(docker) => docker,
            None => Arc::new(DockerEngine::new()?),
        };
        docker.destroy_by_label(&pipeline, labels).await;
        Ok(())
    }

    /// Remove exited auxiliary containers matching the labels.
    pub async fn suspend(&self, labels: &HashMap<String, String>) -> Result<()> {
        let docker = self.setup.lock().as_ref().and_then(|s| s.docker.clone());
        match docker {
            Some(docker) => docker.suspend(labels).await,
            None => Ok(()),
        }
    }

    /// True once setup has completed and until destroy.
    pub fn is_set_up(&self) -> bool {
        self.setup.lock().is_some()
    }
}

async fn materialize_file(file: &FileSpec) -> Result<()> {
    if file.is_dir {
        tokio::fs::create_dir_all(&file.path)
            .await
            .map_err(|e| Error::Internal(format!("create dir {}: {e}", file.path)))?;
    } else {
        if let Some(parent) = std::path::Path::new(&file.path).parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Internal(format!("create dir {}: {e}", parent.display())))?;
        }
        tokio::fs::write(&file.path, file.data.as_bytes())
            .await
            .map_err(|e| Error::Internal(format!("write file {}: {e}", file.path)))?;
    }

    #[cfg(unix)]
    if file.mode != 0 {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&file.path, std::fs::Permissions::from_mode(file.mode))
            .await
            .map_err(|e| Error::Internal(format!("chmod {}: {e}", file.path)))?;
    }
    Ok(())
}

/// On windows stages, unix-style paths gain a `c:` drive prefix. The
/// docker socket and pipe are left alone so socket mounts keep working.
fn normalize_path(path: &str, platform: &Platform) -> String {
    if !platform.is_windows() {
        return path.to_string();
    }
    if path == UNIX_DOCKER_SOCK || path == WINDOWS_DOCKER_PIPE {
        return path.to_string();
    }
    if path.starts_with('/') {
        return format!("c:{path}");
    }
    path.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagehand_logs::{Replacer, StreamBuffer};

    fn windows() -> Platform {
        Platform {
            os: "windows".to_string(),
            arch: "amd64".to_string(),
        }
    }

    async fn engine_without_docker() -> Arc<Engine> {
        let engine = Engine::new();
        engine
            .setup(PipelineConfig {
                enable_docker_setup: false,
                ..Default::default()
            })
            .await
            .unwrap();
        engine
    }

    #[test]
    fn test_normalize_path_windows_quirk() {
        assert_eq!(normalize_path("/tmp/work", &windows()), "c:/tmp/work");
        assert_eq!(
            normalize_path("/var/run/docker.sock", &windows()),
            "/var/run/docker.sock"
        );
        assert_eq!(
            normalize_path(r"\\.\pipe\docker_engine", &windows()),
            r"\\.\pipe\docker_engine"
        );
        assert_eq!(normalize_path("d:/data", &windows()), "d:/data");
        assert_eq!(
            normalize_path("/tmp/work", &Platform::default()),
            "/tmp/work"
        );
    }

    #[tokio::test]
    async fn test_setup_materializes_files_and_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("conf/agent.txt");
        let dir_path = dir.path().join("workspace");

        let engine = Engine::new();
        engine
            .setup(PipelineConfig {
                enable_docker_setup: false,
                files: vec![
                    FileSpec {
                        path: file_path.to_string_lossy().into_owned(),
                        mode: 0o600,
                        data: "hello".to_string(),
                        is_dir: false,
                    },
                    FileSpec {
                        path: dir_path.to_string_lossy().into_owned(),
                        mode: 0,
                        data: String::new(),
                        is_dir: true,
                    },
                ],
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(std::fs::read_to_string(&file_path).unwrap(), "hello");
        assert!(dir_path.is_dir());
    }

    #[tokio::test]
    async fn test_double_setup_is_rejected() {
        let engine = engine_without_docker().await;
        let result = engine
            .setup(PipelineConfig {
                enable_docker_setup: false,
                ..Default::default()
            })
            .await;
        assert!(matches!(result, Err(Error::BadRequest(_))));
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let engine = engine_without_docker().await;
        engine.destroy().await;
        assert!(!engine.is_set_up());
        engine.destroy().await;
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_env_merge_step_overrides_stage() {
        let engine = Engine::new();
        let mut stage_envs = HashMap::new();
        stage_envs.insert("SHARED".to_string(), "stage".to_string());
        stage_envs.insert("STAGE_ONLY".to_string(), "yes".to_string());
        engine
            .setup(PipelineConfig {
                enable_docker_setup: false,
                envs: stage_envs,
                ..Default::default()
            })
            .await
            .unwrap();

        let buf = StreamBuffer::new();
        let out = StepLog::new(Replacer::new(vec![]), buf.clone());
        let mut step_envs = HashMap::new();
        step_envs.insert("SHARED".to_string(), "step".to_string());
        let step = StepSpec {
            id: "e1".to_string(),
            entrypoint: vec!["sh".to_string(), "-c".to_string()],
            command: vec!["echo $SHARED $STAGE_ONLY".to_string()],
            envs: step_envs,
            ..Default::default()
        };

        let state = engine
            .run(CancellationToken::new(), &step, out.clone())
            .await
            .unwrap();
        out.close();

        assert_eq!(state.exit_code, 0);
        let (lines, _) = buf.snapshot();
        assert!(lines.iter().any(|l| l.text == "step yes"));
    }

    #[tokio::test]
    async fn test_container_step_without_runtime_fails() {
        let engine = engine_without_docker().await;
        let buf = StreamBuffer::new();
        let out = StepLog::new(Replacer::new(vec![]), buf);
        let step = StepSpec {
            id: "e2".to_string(),
            image: "alpine:3".to_string(),
            ..Default::default()
        };
        let result = engine.run(CancellationToken::new(), &step, out).await;
        assert!(matches!(result, Err(Error::ExecutionFailed(_))));
    }

    #[tokio::test]
    async fn test_run_before_setup_fails() {
        let engine = Engine::new();
        let buf = StreamBuffer::new();
        let out = StepLog::new(Replacer::new(vec![]), buf);
        let step = StepSpec {
            id: "e3".to_string(),
            ..Default::default()
        };
        let result = engine.run(CancellationToken::new(), &step, out).await;
        assert!(matches!(result, Err(Error::Internal(_))));
    }
}
