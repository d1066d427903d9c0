//! Docker container facade.
//!
//! Owns every container, volume, and network created for the stage. The
//! engine is the single mutator; destroy makes best-effort progress and
//! swallows individual cleanup failures.

use bollard::Docker;
use bollard::auth::DockerCredentials;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogsOptions, NetworkingConfig,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{
    ContainerStateStatusEnum, DeviceMapping, EndpointSettings, HostConfig, Mount,
    MountTypeEnum, MountVolumeOptions, MountTmpfsOptions, PortBinding as DockerPortBinding,
};
use bollard::network::{CreateNetworkOptions, InspectNetworkOptions};
use bollard::volume::{CreateVolumeOptions, RemoveVolumeOptions};
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use stagehand_core::pipeline::PipelineConfig;
use stagehand_core::step::{PullPolicy, StepSpec};
use stagehand_core::volume::Volume;
use stagehand_core::{Error, Result, RunState};
use stagehand_logs::StepLog;

/// Grace window for soft stop, and the cap on the post-stop status poll.
const SOFT_STOP_GRACE: Duration = Duration::from_secs(30);
/// Image pull attempts for retryable failures.
const MAX_PULL_ATTEMPTS: u32 = 3;
/// Container start attempts.
const MAX_START_ATTEMPTS: u32 = 3;
const START_RETRY_DELAY: Duration = Duration::from_millis(500);
const PULL_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Registry prefix treated as an override; when pulling an overridden
/// reference fails retryably, the facade falls back once to the
/// original reference. External toggle, not part of the facade contract.
const REGISTRY_OVERRIDE_ENV: &str = "STAGEHAND_REGISTRY_OVERRIDE";

#[derive(Debug, Clone)]
struct OwnedContainer {
    id: String,
    name: String,
    soft_stop: bool,
}

/// Facade over the Docker engine API for one stage.
pub struct DockerEngine {
    client: Docker,
    containers: Mutex<Vec<OwnedContainer>>,
}

impl DockerEngine {
    /// Connect to the local daemon.
    pub fn new() -> Result<Self> {
        let client = Docker::connect_with_local_defaults()
            .map_err(|e| Error::Internal(format!("docker connect: {e}")))?;
        Ok(Self::with_client(client))
    }

    pub fn with_client(client: Docker) -> Self {
        Self {
            client,
            containers: Mutex::new(Vec::new()),
        }
    }

    pub async fn ping(&self) -> bool {
        self.client.ping().await.is_ok()
    }

    /// Create the stage's named volumes and its network. Idempotent: the
    /// network is inspected first, and create races are retried.
    pub async fn setup(&self, pipeline: &PipelineConfig) -> Result<()> {
        for volume in &pipeline.volumes {
            if let Volume::EmptyDir {
                name, labels, ..
            } = volume
            {
                if !volume.is_data_volume() {
                    continue;
                }
                let options = CreateVolumeOptions {
                    name: name.clone(),
                    labels: labels.clone(),
                    ..Default::default()
                };
                self.client
                    .create_volume(options)
                    .await
                    .map_err(|e| Error::Internal(format!("create volume {name}: {e}")))?;
                debug!(volume = %name, "created data volume");
            }
        }

        self.create_network(pipeline).await?;

        if !pipeline.proxy_envs.is_empty() {
            // The daemon proxy is host-managed; the facade only makes the
            // proxy settings visible to the step containers it creates.
            info!(
                vars = pipeline.proxy_envs.len(),
                "proxy configuration present, will inject into step containers"
            );
        }
        Ok(())
    }

    async fn create_network(&self, pipeline: &PipelineConfig) -> Result<()> {
        let name = &pipeline.network.id;
        if name.is_empty() {
            return Ok(());
        }

        let driver = if pipeline.platform.is_windows() {
            "nat"
        } else {
            "bridge"
        };

        let mut last_err = None;
        for attempt in 0..3u32 {
            if self
                .client
                .inspect_network(name, None::<InspectNetworkOptions<String>>)
                .await
                .is_ok()
            {
                debug!(network = %name, "network already exists");
                return Ok(());
            }

            let options = CreateNetworkOptions {
                name: name.clone(),
                driver: driver.to_string(),
                options: pipeline.network.options.clone(),
                labels: pipeline.network.labels.clone(),
                ..Default::default()
            };
            match self.client.create_network(options).await {
                Ok(_) => {
                    info!(network = %name, driver, "created stage network");
                    return Ok(());
                }
                Err(e) => {
                    warn!(network = %name, attempt, error = %e, "network create failed");
                    last_err = Some(e);
                    tokio::time::sleep(Duration::from_millis(250)).await;
                }
            }
        }
        Err(Error::Internal(format!(
            "create network {name}: {}",
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    /// Run one containerized step to completion (or, for detached steps,
    /// to its start) and stream its output into `out`.
    pub async fn run(
        &self,
        cancel: CancellationToken,
        pipeline: &PipelineConfig,
        step: &StepSpec,
        envs: HashMap<String, String>,
        out: Arc<StepLog>,
    ) -> Result<RunState> {
        self.ensure_image(step).await?;

        let container_id = match self.create_container(pipeline, step, &envs).await {
            Ok(id) => id,
            Err(e) if is_not_found(&e) && step.pull_policy != PullPolicy::Never => {
                // The image vanished between policy check and create.
                self.pull_image(&step.image, step).await?;
                self.create_container(pipeline, step, &envs).await?
            }
            Err(e) => return Err(Error::ExecutionFailed(format!("create container: {e}"))),
        };

        self.containers.lock().push(OwnedContainer {
            id: container_id.clone(),
            name: step.name.clone(),
            soft_stop: step.soft_stop,
        });

        self.start_container(&container_id).await?;

        if step.detach {
            let client = self.client.clone();
            let id = container_id.clone();
            let tty = pipeline.enable_tty;
            tokio::spawn(async move {
                let state = follow_container(&client, &id, tty, &out, &cancel).await;
                debug!(container = %id, ?state, "detached step finished");
                out.close();
            });
            return Ok(RunState::running());
        }

        Ok(follow_container(&self.client, &container_id, pipeline.enable_tty, &out, &cancel).await)
    }

    /// Pull according to policy before the first create.
    async fn ensure_image(&self, step: &StepSpec) -> Result<()> {
        let pull = match step.pull_policy {
            PullPolicy::Always => true,
            PullPolicy::Default => uses_latest_tag(&step.image),
            PullPolicy::IfNotExists | PullPolicy::Never => false,
        };
        if pull {
            self.pull_image(&step.image, step).await?;
        }
        Ok(())
    }

    async fn pull_image(&self, image: &str, step: &StepSpec) -> Result<()> {
        match self.pull_once_with_retry(image, step).await {
            Ok(()) => Ok(()),
            Err(e) => {
                // Overridden-registry fallback: strip the override prefix
                // and try the original reference once.
                if let Ok(prefix) = std::env::var(REGISTRY_OVERRIDE_ENV) {
                    if !prefix.is_empty() && image.starts_with(&prefix) && !is_no_retry(&e) {
                        let original = image
                            .trim_start_matches(&prefix)
                            .trim_start_matches('/')
                            .to_string();
                        warn!(image, original = %original, "falling back to original image");
                        return self.pull_once_with_retry(&original, step).await;
                    }
                }
                Err(e)
            }
        }
    }

    async fn pull_once_with_retry(&self, image: &str, step: &StepSpec) -> Result<()> {
        let credentials = step.auth.as_ref().map(|auth| DockerCredentials {
            username: (!auth.username.is_empty()).then(|| auth.username.clone()),
            password: (!auth.password.is_empty()).then(|| auth.password.clone()),
            auth: (!auth.auth.is_empty()).then(|| auth.auth.clone()),
            serveraddress: (!auth.address.is_empty()).then(|| auth.address.clone()),
            ..Default::default()
        });

        let mut last_err = None;
        for attempt in 1..=MAX_PULL_ATTEMPTS {
            let options = CreateImageOptions {
                from_image: image.to_string(),
                ..Default::default()
            };
            let mut stream = self
                .client
                .create_image(Some(options), None, credentials.clone());

            let mut failed = None;
            while let Some(progress) = stream.next().await {
                match progress {
                    Ok(info) => {
                        if let Some(status) = info.status {
                            debug!(image, status = %status, "pull progress");
                        }
                    }
                    Err(e) => {
                        failed = Some(e);
                        break;
                    }
                }
            }

            match failed {
                None => {
                    info!(image, "image pulled");
                    return Ok(());
                }
                Some(e) => {
                    let err = Error::ExecutionFailed(format!("pull {image}: {e}"));
                    if is_no_retry_bollard(&e) || attempt == MAX_PULL_ATTEMPTS {
                        return Err(err);
                    }
                    warn!(image, attempt, error = %e, "image pull failed, retrying");
                    last_err = Some(err);
                    tokio::time::sleep(PULL_RETRY_DELAY).await;
                }
            }
        }
        Err(last_err.unwrap_or_else(|| Error::ExecutionFailed(format!("pull {image}"))))
    }

    async fn create_container(
        &self,
        pipeline: &PipelineConfig,
        step: &StepSpec,
        envs: &HashMap<String, String>,
    ) -> Result<String> {
        let mut env: Vec<String> = envs.iter().map(|(k, v)| format!("{k}={v}")).collect();
        for (k, v) in &pipeline.proxy_envs {
            env.push(format!("{k}={v}"));
        }

        let host_config = build_host_config(pipeline, step);
        let network = if step.network.is_empty() {
            pipeline.network.id.clone()
        } else {
            step.network.clone()
        };

        let networking_config = if network.is_empty() {
            None
        } else {
            let mut aliases = vec![step.name.clone()];
            aliases.extend(step.network_aliases.iter().cloned());
            let mut endpoints = HashMap::new();
            endpoints.insert(
                network.clone(),
                EndpointSettings {
                    aliases: Some(aliases),
                    ..Default::default()
                },
            );
            Some(NetworkingConfig {
                endpoints_config: endpoints,
            })
        };

        let exposed_ports = if step.port_bindings.is_empty() {
            None
        } else {
            Some(
                step.port_bindings
                    .iter()
                    .map(|p| (format!("{}/tcp", p.container_port), HashMap::new()))
                    .collect(),
            )
        };

        let config = Config {
            image: Some(step.image.clone()),
            labels: (!pipeline.labels.is_empty()).then(|| pipeline.labels.clone()),
            entrypoint: if step.entrypoint.is_empty() {
                None
            } else {
                Some(step.entrypoint.clone())
            },
            cmd: if step.command.is_empty() {
                None
            } else {
                Some(step.command.clone())
            },
            env: Some(env),
            working_dir: if step.working_dir.is_empty() {
                None
            } else {
                Some(step.working_dir.clone())
            },
            user: if step.user.is_empty() {
                None
            } else {
                Some(step.user.clone())
            },
            exposed_ports,
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(pipeline.enable_tty),
            host_config: Some(host_config),
            networking_config,
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: step.name.clone(),
            platform: None,
        };

        let created = self
            .client
            .create_container(Some(options), config)
            .await
            .map_err(map_bollard)?;
        info!(container = %step.name, id = %created.id, "created container");
        Ok(created.id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        let mut last_err = None;
        for attempt in 1..=MAX_START_ATTEMPTS {
            match self
                .client
                .start_container(id, None::<StartContainerOptions<String>>)
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(container = %id, attempt, error = %e, "container start failed");
                    last_err = Some(e);
                    tokio::time::sleep(START_RETRY_DELAY).await;
                }
            }
        }
        Err(Error::ExecutionFailed(format!(
            "start container {id}: {}",
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    /// Tear down everything the stage owns. Every cleanup error is logged
    /// and swallowed; a second call has nothing left to do.
    pub async fn destroy(&self, pipeline: &PipelineConfig) {
        let owned: Vec<OwnedContainer> = std::mem::take(&mut *self.containers.lock());
        for container in owned {
            self.stop_and_remove(&container).await;
        }

        for volume in &pipeline.volumes {
            if volume.is_data_volume() {
                let name = volume.name();
                if let Err(e) = self
                    .client
                    .remove_volume(name, Some(RemoveVolumeOptions { force: true }))
                    .await
                {
                    warn!(volume = %name, error = %e, "volume remove failed");
                }
            }
        }

        if !pipeline.network.id.is_empty() {
            if let Err(e) = self.client.remove_network(&pipeline.network.id).await {
                warn!(network = %pipeline.network.id, error = %e, "network remove failed");
            }
        }
    }

    /// Stateless teardown by label, for recovery after an agent restart.
    pub async fn destroy_by_label(
        &self,
        pipeline: &PipelineConfig,
        labels: &HashMap<String, String>,
    ) {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            labels.iter().map(|(k, v)| format!("{k}={v}")).collect(),
        );
        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };

        match self.client.list_containers(Some(options)).await {
            Ok(found) => {
                for summary in found {
                    let Some(id) = summary.id else { continue };
                    let container = OwnedContainer {
                        id,
                        name: summary
                            .names
                            .and_then(|n| n.first().cloned())
                            .unwrap_or_default(),
                        soft_stop: false,
                    };
                    self.stop_and_remove(&container).await;
                }
            }
            Err(e) => warn!(error = %e, "list containers by label failed"),
        }

        self.destroy(pipeline).await;
    }

    /// Remove exited containers matching the labels. Used when a step
    /// spawns short-lived auxiliary containers.
    pub async fn suspend(&self, labels: &HashMap<String, String>) -> Result<()> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            labels.iter().map(|(k, v)| format!("{k}={v}")).collect(),
        );
        filters.insert("status".to_string(), vec!["exited".to_string()]);
        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };

        let found = self
            .client
            .list_containers(Some(options))
            .await
            .map_err(|e| Error::Internal(format!("list containers: {e}")))?;

        for summary in found {
            let Some(id) = summary.id else { continue };
            if let Err(e) = self
                .client
                .remove_container(
                    &id,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await
            {
                warn!(container = %id, error = %e, "suspend remove failed");
            } else {
                self.containers.lock().retain(|c| c.id != id);
            }
        }
        Ok(())
    }

    async fn stop_and_remove(&self, container: &OwnedContainer) {
        if container.soft_stop {
            self.soft_stop(container).await;
        } else if let Err(e) = self
            .client
            .kill_container(
                &container.id,
                Some(bollard::container::KillContainerOptions {
                    signal: "SIGKILL".to_string(),
                }),
            )
            .await
        {
            debug!(container = %container.id, error = %e, "kill failed (may have exited)");
        }

        if let Err(e) = self
            .client
            .remove_container(
                &container.id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            warn!(container = %container.id, error = %e, "container remove failed");
        } else {
            debug!(container = %container.id, name = %container.name, "container removed");
        }
    }

    /// Graceful stop with a 30s window, then wait out `running`/`removing`
    /// status for up to another 30s before removal proceeds regardless.
    async fn soft_stop(&self, container: &OwnedContainer) {
        if let Err(e) = self
            .client
            .stop_container(
                &container.id,
                Some(StopContainerOptions {
                    t: SOFT_STOP_GRACE.as_secs() as i64,
                }),
            )
            .await
        {
            warn!(container = %container.id, error = %e, "soft stop failed");
            return;
        }

        let deadline = tokio::time::Instant::now() + SOFT_STOP_GRACE;
        while tokio::time::Instant::now() < deadline {
            let status = self
                .client
                .inspect_container(&container.id, None)
                .await
                .ok()
                .and_then(|c| c.state)
                .and_then(|s| s.status);
            match status {
                Some(ContainerStateStatusEnum::RUNNING)
                | Some(ContainerStateStatusEnum::REMOVING) => {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                _ => break,
            }
        }
    }

    /// Stop one owned container by step name without removing it; the
    /// removal still happens at destroy. Timeout-enforcement path.
    pub async fn abort(&self, name: &str, soft: bool) {
        let target = {
            let owned = self.containers.lock();
            owned.iter().find(|c| c.name == name).cloned()
        };
        let Some(container) = target else {
            debug!(container = %name, "abort target not owned");
            return;
        };
        if soft {
            self.soft_stop(&container).await;
        } else if let Err(e) = self
            .client
            .kill_container(
                &container.id,
                Some(bollard::container::KillContainerOptions {
                    signal: "SIGKILL".to_string(),
                }),
            )
            .await
        {
            debug!(container = %container.id, error = %e, "abort kill failed");
        }
    }

    /// Number of containers currently registered to the stage.
    pub fn owned_count(&self) -> usize {
        self.containers.lock().len()
    }
}

/// Drain logs, wait for exit, and report the terminal state.
async fn follow_container(
    client: &Docker,
    id: &str,
    tty: bool,
    out: &StepLog,
    cancel: &CancellationToken,
) -> RunState {
    let options = LogsOptions::<String> {
        follow: true,
        stdout: true,
        stderr: true,
        ..Default::default()
    };
    let mut logs = client.logs(id, Some(options));

    let drain = async {
        while let Some(entry) = logs.next().await {
            match entry {
                // Demuxed stdout/stderr frames, or raw console when TTY.
                Ok(output) => out.write(&output.into_bytes()),
                Err(e) => {
                    warn!(container = %id, error = %e, "log stream error");
                    break;
                }
            }
        }
    };

    tokio::select! {
        _ = drain => {}
        _ = cancel.cancelled() => {
            debug!(container = %id, tty, "log drain cancelled");
            return RunState::running();
        }
    }

    let mut wait = client.wait_container(
        id,
        Some(WaitContainerOptions {
            condition: "not-running",
        }),
    );
    let exit_code = tokio::select! {
        outcome = wait.next() => match outcome {
            Some(Ok(response)) => response.status_code as i32,
            Some(Err(e)) => {
                warn!(container = %id, error = %e, "wait error");
                // The exit code is still available from inspect below.
                -1
            }
            None => -1,
        },
        _ = cancel.cancelled() => return RunState::running(),
    };

    let inspect = client.inspect_container(id, None).await.ok();
    let state = inspect.and_then(|c| c.state);
    let oom_killed = state
        .as_ref()
        .and_then(|s| s.oom_killed)
        .unwrap_or(false);
    let code = state
        .and_then(|s| s.exit_code)
        .map(|c| c as i32)
        .unwrap_or(exit_code);

    RunState {
        exited: true,
        exit_code: code,
        oom_killed,
    }
}

fn uses_latest_tag(image: &str) -> bool {
    match image.rsplit_once(':') {
        // A colon inside a registry host:port is not a tag.
        Some((_, tag)) if !tag.contains('/') => tag == "latest",
        _ => true,
    }
}

fn build_host_config(pipeline: &PipelineConfig, step: &StepSpec) -> HostConfig {
    let mut binds = Vec::new();
    let mut mounts = Vec::new();
    let mut devices = Vec::new();

    for mount in &step.volumes {
        let Some(volume) = pipeline.volume(&mount.name) else {
            warn!(volume = %mount.name, step = %step.id, "step references undeclared volume");
            continue;
        };
        match volume {
            Volume::HostPath {
                path, read_only, ..
            } => {
                if volume.is_device() {
                    devices.push(DeviceMapping {
                        path_on_host: Some(path.clone()),
                        path_in_container: Some(mount.path.clone()),
                        cgroup_permissions: Some("rwm".to_string()),
                    });
                } else if volume.is_named_pipe() {
                    mounts.push(Mount {
                        target: Some(mount.path.clone()),
                        source: Some(path.clone()),
                        typ: Some(MountTypeEnum::NPIPE),
                        read_only: Some(*read_only),
                        ..Default::default()
                    });
                } else {
                    let mode = if *read_only { "ro" } else { "rw" };
                    binds.push(format!("{}:{}:{}", path, mount.path, mode));
                }
            }
            Volume::EmptyDir {
                name, size_limit, ..
            } => {
                if volume.is_tmpfs() {
                    mounts.push(Mount {
                        target: Some(mount.path.clone()),
                        typ: Some(MountTypeEnum::TMPFS),
                        tmpfs_options: Some(MountTmpfsOptions {
                            size_bytes: (*size_limit > 0).then_some(*size_limit as i64),
                            ..Default::default()
                        }),
                        ..Default::default()
                    });
                } else {
                    mounts.push(Mount {
                        target: Some(mount.path.clone()),
                        source: Some(name.clone()),
                        typ: Some(MountTypeEnum::VOLUME),
                        volume_options: Some(MountVolumeOptions::default()),
                        ..Default::default()
                    });
                }
            }
        }
    }

    let port_bindings = if step.port_bindings.is_empty() {
        None
    } else {
        let mut map: HashMap<String, Option<Vec<DockerPortBinding>>> = HashMap::new();
        for binding in &step.port_bindings {
            let host_port = if binding.host_port == 0 {
                binding.container_port
            } else {
                binding.host_port
            };
            map.insert(
                format!("{}/tcp", binding.container_port),
                Some(vec![DockerPortBinding {
                    host_ip: (!binding.host_ip.is_empty()).then(|| binding.host_ip.clone()),
                    host_port: Some(host_port.to_string()),
                }]),
            );
        }
        Some(map)
    };

    let limits = &step.limits;
    HostConfig {
        binds: (!binds.is_empty()).then_some(binds),
        mounts: (!mounts.is_empty()).then_some(mounts),
        devices: (!devices.is_empty()).then_some(devices),
        dns: (!step.dns.is_empty()).then(|| step.dns.clone()),
        extra_hosts: (!step.extra_hosts.is_empty()).then(|| step.extra_hosts.clone()),
        port_bindings,
        privileged: Some(step.privileged),
        cpu_period: (limits.cpu_period > 0).then_some(limits.cpu_period),
        cpu_quota: (limits.cpu_quota > 0).then_some(limits.cpu_quota),
        cpu_shares: (limits.cpu_shares > 0).then_some(limits.cpu_shares),
        cpuset_cpus: (!limits.cpu_set.is_empty()).then(|| limits.cpu_set.join(",")),
        memory: (limits.mem_limit > 0).then_some(limits.mem_limit),
        shm_size: (limits.shm_size > 0).then_some(limits.shm_size),
        network_mode: (!pipeline.network.id.is_empty()).then(|| pipeline.network.id.clone()),
        ..Default::default()
    }
}

fn map_bollard(e: bollard::errors::Error) -> Error {
    Error::ExecutionFailed(e.to_string())
}

fn is_not_found(e: &Error) -> bool {
    matches!(e, Error::ExecutionFailed(msg) if msg.contains("404") || msg.to_lowercase().contains("no such"))
}

/// Failure classes that never warrant a pull retry.
fn is_no_retry_bollard(e: &bollard::errors::Error) -> bool {
    match e {
        bollard::errors::Error::DockerResponseServerError { status_code, .. } => {
            matches!(status_code, 400 | 401 | 403 | 404)
        }
        _ => false,
    }
}

fn is_no_retry(e: &Error) -> bool {
    match e {
        Error::Cancelled | Error::Timeout => true,
        Error::ExecutionFailed(msg) => {
            let msg = msg.to_lowercase();
            msg.contains("404")
                || msg.contains("401")
                || msg.contains("403")
                || msg.contains("400")
                || msg.contains("not found")
                || msg.contains("unauthorized")
                || msg.contains("forbidden")
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagehand_core::pipeline::NetworkSpec;
    use stagehand_core::step::{PortBinding, ResourceLimits};
    use stagehand_core::volume::VolumeMount;

    fn pipeline_with_volumes(volumes: Vec<Volume>) -> PipelineConfig {
        PipelineConfig {
            network: NetworkSpec {
                id: "stage-net".to_string(),
                ..Default::default()
            },
            volumes,
            ..Default::default()
        }
    }

    #[test]
    fn test_latest_tag_detection() {
        assert!(uses_latest_tag("alpine"));
        assert!(uses_latest_tag("alpine:latest"));
        assert!(!uses_latest_tag("alpine:3.20"));
        // Registry port colon is not a tag separator.
        assert!(uses_latest_tag("registry.local:5000/img"));
        assert!(!uses_latest_tag("registry.local:5000/img:v1"));
    }

    #[test]
    fn test_bind_mount_derivation() {
        let pipeline = pipeline_with_volumes(vec![Volume::HostPath {
            id: "v1".to_string(),
            name: "cache".to_string(),
            path: "/var/cache/stage".to_string(),
            read_only: true,
            create: false,
            remove: false,
            labels: HashMap::new(),
        }]);
        let step = StepSpec {
            id: "s1".to_string(),
            volumes: vec![VolumeMount {
                name: "cache".to_string(),
                path: "/cache".to_string(),
            }],
            ..Default::default()
        };

        let hc = build_host_config(&pipeline, &step);
        assert_eq!(
            hc.binds,
            Some(vec!["/var/cache/stage:/cache:ro".to_string()])
        );
        assert!(hc.mounts.is_none());
        assert_eq!(hc.network_mode.as_deref(), Some("stage-net"));
    }

    #[test]
    fn test_device_and_tmpfs_derivation() {
        let pipeline = pipeline_with_volumes(vec![
            Volume::HostPath {
                id: "v1".to_string(),
                name: "kvm".to_string(),
                path: "/dev/kvm".to_string(),
                read_only: false,
                create: false,
                remove: false,
                labels: HashMap::new(),
            },
            Volume::EmptyDir {
                id: "v2".to_string(),
                name: "scratch".to_string(),
                medium: "memory".to_string(),
                size_limit: 1024,
                labels: HashMap::new(),
            },
        ]);
        let step = StepSpec {
            id: "s1".to_string(),
            volumes: vec![
                VolumeMount {
                    name: "kvm".to_string(),
                    path: "/dev/kvm".to_string(),
                },
                VolumeMount {
                    name: "scratch".to_string(),
                    path: "/scratch".to_string(),
                },
            ],
            ..Default::default()
        };

        let hc = build_host_config(&pipeline, &step);
        let devices = hc.devices.unwrap();
        assert_eq!(devices[0].path_on_host.as_deref(), Some("/dev/kvm"));

        let mounts = hc.mounts.unwrap();
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].typ, Some(MountTypeEnum::TMPFS));
        assert_eq!(
            mounts[0].tmpfs_options.as_ref().unwrap().size_bytes,
            Some(1024)
        );
    }

    #[test]
    fn test_data_volume_mount_derivation() {
        let pipeline = pipeline_with_volumes(vec![Volume::EmptyDir {
            id: "v1".to_string(),
            name: "shared".to_string(),
            medium: String::new(),
            size_limit: 0,
            labels: HashMap::new(),
        }]);
        let step = StepSpec {
            id: "s1".to_string(),
            volumes: vec![VolumeMount {
                name: "shared".to_string(),
                path: "/shared".to_string(),
            }],
            ..Default::default()
        };

        let hc = build_host_config(&pipeline, &step);
        let mounts = hc.mounts.unwrap();
        assert_eq!(mounts[0].typ, Some(MountTypeEnum::VOLUME));
        assert_eq!(mounts[0].source.as_deref(), Some("shared"));
    }

    #[test]
    fn test_undeclared_volume_is_skipped() {
        let pipeline = pipeline_with_volumes(vec![]);
        let step = StepSpec {
            id: "s1".to_string(),
            volumes: vec![VolumeMount {
                name: "ghost".to_string(),
                path: "/ghost".to_string(),
            }],
            ..Default::default()
        };
        let hc = build_host_config(&pipeline, &step);
        assert!(hc.binds.is_none());
        assert!(hc.mounts.is_none());
    }

    #[test]
    fn test_resource_limits_pass_through() {
        let pipeline = pipeline_with_volumes(vec![]);
        let step = StepSpec {
            id: "s1".to_string(),
            limits: ResourceLimits {
                cpu_period: 100_000,
                cpu_quota: 50_000,
                cpu_shares: 512,
                cpu_set: vec!["0".to_string(), "1".to_string()],
                mem_limit: 1 << 30,
                shm_size: 1 << 26,
            },
            ..Default::default()
        };
        let hc = build_host_config(&pipeline, &step);
        assert_eq!(hc.cpu_period, Some(100_000));
        assert_eq!(hc.cpu_quota, Some(50_000));
        assert_eq!(hc.cpu_shares, Some(512));
        assert_eq!(hc.cpuset_cpus.as_deref(), Some("0,1"));
        assert_eq!(hc.memory, Some(1 << 30));
        assert_eq!(hc.shm_size, Some(1 << 26));
    }

    #[test]
    fn test_port_binding_defaults_host_port() {
        let pipeline = pipeline_with_volumes(vec![]);
        let step = StepSpec {
            id: "s1".to_string(),
            port_bindings: vec![PortBinding {
                container_port: 8080,
                host_port: 0,
                host_ip: String::new(),
            }],
            ..Default::default()
        };
        let hc = build_host_config(&pipeline, &step);
        let map = hc.port_bindings.unwrap();
        let binding = map.get("8080/tcp").unwrap().as_ref().unwrap();
        assert_eq!(binding[0].host_port.as_deref(), Some("8080"));
    }

    #[test]
    fn test_no_retry_classification() {
        assert!(is_no_retry(&Error::ExecutionFailed(
            "pull nope: status 404 not found".to_string()
        )));
        assert!(is_no_retry(&Error::ExecutionFailed(
            "unauthorized: bad token".to_string()
        )));
        assert!(is_no_retry(&Error::Cancelled));
        assert!(!is_no_retry(&Error::ExecutionFailed(
            "connection reset by peer".to_string()
        )));
    }
}
