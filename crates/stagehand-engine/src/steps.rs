//! Per-step state machine.
//!
//! Start installs a record and spawns an execution task; poll and stream
//! observe without driving execution. Whatever happens to the task, the
//! completion latch fires exactly once, so a poll never hangs forever.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use stagehand_core::step::StepSpec;
use stagehand_core::{Error, Result, RunState};
use stagehand_logs::buffer::{Line, Subscription};
use stagehand_logs::remote::LogSink;
use stagehand_logs::{RemoteLogWriter, Replacer, StepLog, StreamBuffer};

use crate::engine::Engine;
use crate::stage::StageState;

/// Exit code recorded when a step is killed rather than exiting.
const KILLED_EXIT_CODE: i32 = 137;
/// Bound on waiting for execution tasks during destroy.
const DESTROY_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Scratch-directory contract: the env dump scraped for declared output
/// vars, the extra envs a step exports, and the artifact payload.
const ENV_DUMP_FILE: &str = "env.dump";
const EXPORT_ENV_FILE: &str = "export.env";
const ARTIFACT_FILE: &str = "artifact";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepState {
    Pending,
    Running,
    Exited,
}

/// One step's execution record. Frozen once `state == Exited`.
#[derive(Debug, Clone)]
pub struct StepRecord {
    pub state: StepState,
    pub run: RunState,
    pub error: String,
    pub outputs: HashMap<String, String>,
    pub envs: HashMap<String, String>,
    pub artifact: Vec<u8>,
    pub optimization_state: String,
}

impl StepRecord {
    fn pending() -> Self {
        Self {
            state: StepState::Pending,
            run: RunState::running(),
            error: String::new(),
            outputs: HashMap::new(),
            envs: HashMap::new(),
            artifact: Vec::new(),
            optimization_state: String::new(),
        }
    }

    pub fn exited(&self) -> bool {
        self.state == StepState::Exited
    }
}

/// Snapshot plus follow channel returned by stream.
pub struct StreamHandle {
    pub snapshot: Vec<Line>,
    /// First sequence number not included in the snapshot; the follow
    /// channel may replay lines below it.
    pub tail: u64,
    pub sub: Subscription,
}

struct StepEntry {
    record: StepRecord,
    log: Arc<StepLog>,
    latch: watch::Sender<bool>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

/// Owns the stage's step records, buffers, and latches.
pub struct StepExecutor {
    engine: Arc<Engine>,
    entries: Arc<Mutex<HashMap<String, StepEntry>>>,
}

impl StepExecutor {
    pub fn new(engine: Arc<Engine>) -> Arc<Self> {
        Arc::new(Self {
            engine,
            entries: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Install the step and launch its execution task. Returns as soon as
    /// the record is in place; completion is observed through poll.
    pub async fn start(&self, stage: Arc<StageState>, step: StepSpec) -> Result<()> {
        if step.id.is_empty() {
            return Err(Error::BadRequest("step id is required".to_string()));
        }
        if self.entries.lock().contains_key(&step.id) {
            return Err(Error::BadRequest(format!(
                "step {} already started",
                step.id
            )));
        }

        let mut secrets = stage.secrets.clone();
        secrets.extend(step.masked_secrets());
        let replacer = if stage.mask_extra {
            Replacer::with_extra_variants(secrets, &step.envs)
        } else {
            Replacer::new(secrets)
        };
        let buffer = StreamBuffer::new();
        let log = StepLog::new(replacer, buffer);

        let mut remote = None;
        if !step.log_key.is_empty() {
            if let Some(client) = &stage.log_client {
                let sink: Arc<dyn LogSink> = client.clone();
                let mut writer = RemoteLogWriter::new(
                    sink,
                    &step.log_key,
                    stage.log_config.skip_opening_stream,
                );
                writer.open().await?;
                writer.start(log.buffer().subscribe());
                remote = Some(writer);
            }
        }

        let (latch, _) = watch::channel(false);
        let cancel = stage.cancel.child_token();

        {
            let mut entries = self.entries.lock();
            match entries.entry(step.id.clone()) {
                std::collections::hash_map::Entry::Occupied(_) => {
                    return Err(Error::BadRequest(format!(
                        "step {} already started",
                        step.id
                    )));
                }
                std::collections::hash_map::Entry::Vacant(slot) => {
                    slot.insert(StepEntry {
                        record: StepRecord::pending(),
                        log: log.clone(),
                        latch,
                        cancel: cancel.clone(),
                        task: None,
                    });
                }
            }
        }

        let id = step.id.clone();
        let task = tokio::spawn(Self::execute(
            Arc::clone(&self.engine),
            Arc::clone(&self.entries),
            step,
            log,
            remote,
            cancel,
        ));

        // The watchdog fires the latch even if the task itself dies.
        let watch_entries = Arc::clone(&self.entries);
        let watch_id = id.clone();
        let watchdog = tokio::spawn(async move {
            if let Err(e) = task.await {
                warn!(step = %watch_id, error = %e, "step task died");
                finish(
                    &watch_entries,
                    &watch_id,
                    RunState {
                        exited: true,
                        exit_code: 1,
                        oom_killed: false,
                    },
                    "step task failed".to_string(),
                    HashMap::new(),
                    HashMap::new(),
                    Vec::new(),
                );
            }
        });
        if let Some(entry) = self.entries.lock().get_mut(&id) {
            entry.task = Some(watchdog);
        }
        Ok(())
    }

    async fn execute(
        engine: Arc<Engine>,
        entries: Arc<Mutex<HashMap<String, StepEntry>>>,
        step: StepSpec,
        log: Arc<StepLog>,
        remote: Option<RemoteLogWriter>,
        cancel: CancellationToken,
    ) {
        let id = step.id.clone();
        if let Some(entry) = entries.lock().get_mut(&id) {
            entry.record.state = StepState::Running;
        }

        let run_fut = engine.run(cancel.clone(), &step, log.clone());
        tokio::pin!(run_fut);

        let mut timed_out = false;
        let result = if step.timeout > 0 {
            tokio::select! {
                outcome = &mut run_fut => outcome,
                _ = tokio::time::sleep(Duration::from_secs(step.timeout)) => {
                    timed_out = true;
                    debug!(step = %id, "step timed out, aborting");
                    if step.is_host() {
                        cancel.cancel();
                    } else {
                        engine.abort_step(&step).await;
                    }
                    run_fut.await
                }
            }
        } else {
            run_fut.await
        };

        // A detached step that started cleanly parks here: its record
        // stays Running until the stage is destroyed.
        if step.detach && !timed_out {
            if let Ok(state) = &result {
                if !state.exited && !cancel.is_cancelled() {
                    cancel.cancelled().await;
                    log.close();
                    if let Some(mut writer) = remote {
                        writer.close().await;
                    }
                    finish(
                        &entries,
                        &id,
                        RunState {
                            exited: true,
                            exit_code: KILLED_EXIT_CODE,
                            oom_killed: false,
                        },
                        "cancelled".to_string(),
                        HashMap::new(),
                        HashMap::new(),
                        Vec::new(),
                    );
                    return;
                }
            }
        }

        let (run, mut error) = match result {
            Ok(state) if timed_out => (
                RunState {
                    exited: true,
                    exit_code: if state.exited {
                        state.exit_code
                    } else {
                        KILLED_EXIT_CODE
                    },
                    oom_killed: state.oom_killed,
                },
                "timeout".to_string(),
            ),
            Err(_) if timed_out => (
                RunState {
                    exited: true,
                    exit_code: KILLED_EXIT_CODE,
                    oom_killed: false,
                },
                "timeout".to_string(),
            ),
            Ok(state) if cancel.is_cancelled() && !state.exited => (
                RunState {
                    exited: true,
                    exit_code: KILLED_EXIT_CODE,
                    oom_killed: false,
                },
                "cancelled".to_string(),
            ),
            Ok(state) => (state, String::new()),
            Err(Error::Cancelled) => (
                RunState {
                    exited: true,
                    exit_code: KILLED_EXIT_CODE,
                    oom_killed: false,
                },
                "cancelled".to_string(),
            ),
            Err(e) => (
                RunState {
                    exited: true,
                    exit_code: 1,
                    oom_killed: false,
                },
                e.to_string(),
            ),
        };

        let mut outputs = HashMap::new();
        let mut envs = HashMap::new();
        let mut artifact = Vec::new();
        if error.is_empty() {
            match collect_outputs(&step, run.exit_code).await {
                Ok(collected) => outputs = collected,
                Err(e) => error = e.to_string(),
            }
            envs = collect_exported_envs(&step).await;
            artifact = load_artifact(&step).await;
        }

        log.close();
        if let Some(mut writer) = remote {
            writer.close().await;
        }

        finish(&entries, &id, run, error, outputs, envs, artifact);
    }

    /// Wait for the step's completion latch. `timeout` of zero returns
    /// the in-progress indicator immediately; `None` waits until the
    /// latch fires. Idempotent after completion.
    pub async fn poll(&self, id: &str, timeout: Option<Duration>) -> Result<StepRecord> {
        let (mut rx, snapshot) = {
            let entries = self.entries.lock();
            let entry = entries
                .get(id)
                .ok_or_else(|| Error::NotFound(format!("step {id}")))?;
            (entry.latch.subscribe(), entry.record.clone())
        };

        if *rx.borrow() {
            return Ok(snapshot);
        }

        match timeout {
            Some(Duration::ZERO) => Ok(snapshot),
            Some(limit) => match tokio::time::timeout(limit, latch_wait(&mut rx)).await {
                Ok(()) => Ok(self.record(id)?),
                Err(_) => Ok(self.record(id)?),
            },
            None => {
                latch_wait(&mut rx).await;
                Ok(self.record(id)?)
            }
        }
    }

    fn record(&self, id: &str) -> Result<StepRecord> {
        let entries = self.entries.lock();
        entries
            .get(id)
            .map(|e| e.record.clone())
            .ok_or_else(|| Error::NotFound(format!("step {id}")))
    }

    /// Snapshot from `offset` plus a follow subscription. The channel is
    /// already subscribed when the snapshot is taken, so the caller must
    /// skip channel lines below `tail`.
    pub fn stream(&self, id: &str, offset: u64) -> Result<StreamHandle> {
        let buffer = {
            let entries = self.entries.lock();
            let entry = entries
                .get(id)
                .ok_or_else(|| Error::NotFound(format!("step {id}")))?;
            Arc::clone(entry.log.buffer())
        };

        let sub = buffer.subscribe();
        let (lines, tail) = buffer.snapshot();
        let snapshot = lines.into_iter().filter(|l| l.seq >= offset).collect();
        Ok(StreamHandle {
            snapshot,
            tail,
            sub,
        })
    }

    /// Cancel every in-flight step, wait the tasks out, and make sure
    /// each record is terminal with its latch fired.
    pub async fn destroy(&self) {
        let (ids, tasks): (Vec<String>, Vec<JoinHandle<()>>) = {
            let mut entries = self.entries.lock();
            let mut ids = Vec::new();
            let mut tasks = Vec::new();
            for (id, entry) in entries.iter_mut() {
                entry.cancel.cancel();
                ids.push(id.clone());
                if let Some(task) = entry.task.take() {
                    tasks.push(task);
                }
            }
            (ids, tasks)
        };

        for task in tasks {
            if tokio::time::timeout(DESTROY_JOIN_TIMEOUT, task).await.is_err() {
                warn!("step task did not stop within the destroy window");
            }
        }

        // Belt and braces: any record the tasks left open is closed here.
        for id in ids {
            finish(
                &self.entries,
                &id,
                RunState {
                    exited: true,
                    exit_code: KILLED_EXIT_CODE,
                    oom_killed: false,
                },
                "cancelled".to_string(),
                HashMap::new(),
                HashMap::new(),
                Vec::new(),
            );
            if let Some(entry) = self.entries.lock().get(&id) {
                entry.log.close();
            }
        }
    }

    /// Number of installed steps, terminal or not.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

async fn latch_wait(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Freeze the record and fire the latch. No-op when already terminal.
fn finish(
    entries: &Mutex<HashMap<String, StepEntry>>,
    id: &str,
    run: RunState,
    error: String,
    outputs: HashMap<String, String>,
    envs: HashMap<String, String>,
    artifact: Vec<u8>,
) {
    let mut entries = entries.lock();
    let Some(entry) = entries.get_mut(id) else {
        return;
    };
    if entry.record.exited() {
        return;
    }
    entry.record = StepRecord {
        state: StepState::Exited,
        run,
        error,
        outputs,
        envs,
        artifact,
        optimization_state: String::new(),
    };
    // Sending under the lock orders the latch after the final record:
    // whoever sees the latch also sees the frozen fields.
    let _ = entry.latch.send(true);
}

async fn collect_outputs(step: &StepSpec, exit_code: i32) -> Result<HashMap<String, String>> {
    if !step.output_var_file.is_empty() {
        return match tokio::fs::read_to_string(&step.output_var_file).await {
            Ok(content) => Ok(parse_env_lines(&content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // A zero-exit step that wrote nothing has no outputs.
                let _ = exit_code;
                Ok(HashMap::new())
            }
            Err(e) => Err(Error::Internal(format!(
                "read output var file {}: {e}",
                step.output_var_file
            ))),
        };
    }

    if step.output_vars.is_empty() {
        return Ok(HashMap::new());
    }

    let dump = if step.scratch_dir.is_empty() {
        HashMap::new()
    } else {
        let path = Path::new(&step.scratch_dir).join(ENV_DUMP_FILE);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => parse_env_lines(&content),
            Err(_) => HashMap::new(),
        }
    };

    // Missing declared keys are empty strings, not errors.
    Ok(step
        .output_vars
        .iter()
        .map(|key| (key.clone(), dump.get(key).cloned().unwrap_or_default()))
        .collect())
}

/// Extra envs the step exported, plus anything in its secret-var file.
async fn collect_exported_envs(step: &StepSpec) -> HashMap<String, String> {
    let mut envs = HashMap::new();
    if !step.scratch_dir.is_empty() {
        let path = Path::new(&step.scratch_dir).join(EXPORT_ENV_FILE);
        if let Ok(content) = tokio::fs::read_to_string(&path).await {
            envs.extend(parse_env_lines(&content));
        }
    }
    if !step.secret_var_file.is_empty() {
        if let Ok(content) = tokio::fs::read_to_string(&step.secret_var_file).await {
            envs.extend(parse_env_lines(&content));
        }
    }
    envs
}

async fn load_artifact(step: &StepSpec) -> Vec<u8> {
    if step.scratch_dir.is_empty() {
        return Vec::new();
    }
    let path = Path::new(&step.scratch_dir).join(ARTIFACT_FILE);
    tokio::fs::read(&path).await.unwrap_or_default()
}

/// Parse `KEY=VALUE` lines, tolerating `export` prefixes, comments, and
/// quoted values.
fn parse_env_lines(content: &str) -> HashMap<String, String> {
    let mut vars = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim();
            if key.is_empty() {
                continue;
            }
            let value = value.trim().trim_matches('"').trim_matches('\'');
            vars.insert(key.to_string(), value.to_string());
        }
    }
    vars
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::TiConfig;
    use stagehand_core::pipeline::PipelineConfig;
    use stagehand_logs::LogServiceConfig;

    async fn executor() -> (Arc<StepExecutor>, Arc<StageState>) {
        let engine = Engine::new();
        engine
            .setup(PipelineConfig {
                enable_docker_setup: false,
                ..Default::default()
            })
            .await
            .unwrap();
        let stage = StageState::new(
            vec![],
            false,
            LogServiceConfig::default(),
            TiConfig::default(),
        );
        (StepExecutor::new(engine), stage)
    }

    fn shell_step(id: &str, script: &str) -> StepSpec {
        StepSpec {
            id: id.to_string(),
            entrypoint: vec!["sh".to_string(), "-c".to_string()],
            command: vec![script.to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_env_lines() {
        let parsed = parse_env_lines(
            "A=1\nexport B=two\n# comment\n\nC=\"quoted value\"\nD='single'\nbroken line\n=novalue\n",
        );
        assert_eq!(parsed.get("A").unwrap(), "1");
        assert_eq!(parsed.get("B").unwrap(), "two");
        assert_eq!(parsed.get("C").unwrap(), "quoted value");
        assert_eq!(parsed.get("D").unwrap(), "single");
        assert_eq!(parsed.len(), 4);
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_happy_path_host_step() {
        let (executor, stage) = executor().await;
        executor
            .start(stage, shell_step("s1", "echo hi"))
            .await
            .unwrap();

        let record = executor.poll("s1", None).await.unwrap();
        assert!(record.exited());
        assert!(record.run.exited);
        assert_eq!(record.run.exit_code, 0);
        assert!(record.error.is_empty());

        let stream = executor.stream("s1", 0).unwrap();
        assert!(stream.snapshot.iter().any(|l| l.text == "hi"));
    }

    #[tokio::test]
    async fn test_duplicate_step_id_rejected() {
        let (executor, stage) = executor().await;
        executor
            .start(stage.clone(), shell_step("dup", "sleep 1"))
            .await
            .unwrap();
        let result = executor.start(stage, shell_step("dup", "echo again")).await;
        assert!(matches!(result, Err(Error::BadRequest(_))));
    }

    #[tokio::test]
    async fn test_poll_unknown_step_not_found() {
        let (executor, _stage) = executor().await;
        let result = executor.poll("ghost", Some(Duration::ZERO)).await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_stream_unknown_step_not_found() {
        let (executor, _stage) = executor().await;
        assert!(matches!(
            executor.stream("ghost", 0),
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_poll_zero_timeout_returns_in_progress() {
        let (executor, stage) = executor().await;
        executor
            .start(stage, shell_step("slow", "sleep 5"))
            .await
            .unwrap();
        let record = executor.poll("slow", Some(Duration::ZERO)).await.unwrap();
        assert!(!record.run.exited);
        assert!(!record.exited());
        executor.destroy().await;
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_poll_after_completion_is_stable() {
        let (executor, stage) = executor().await;
        executor
            .start(stage, shell_step("stable", "exit 3"))
            .await
            .unwrap();

        let first = executor.poll("stable", None).await.unwrap();
        let second = executor.poll("stable", Some(Duration::ZERO)).await.unwrap();
        assert_eq!(first.run, second.run);
        assert_eq!(first.error, second.error);
        assert_eq!(first.run.exit_code, 3);
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_timeout_kills_step() {
        let (executor, stage) = executor().await;
        let mut step = shell_step("sleepy", "sleep 300");
        step.timeout = 1;
        executor.start(stage, step).await.unwrap();

        let record = executor
            .poll("sleepy", Some(Duration::from_secs(30)))
            .await
            .unwrap();
        assert!(record.run.exited);
        assert_eq!(record.error, "timeout");
        assert_ne!(record.run.exit_code, 0);
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_output_var_file_collection() {
        let dir = tempfile::tempdir().unwrap();
        let out_file = dir.path().join("outputs.env");
        let (executor, stage) = executor().await;

        let mut step = shell_step(
            "outs",
            &format!("printf 'A=1\\nB=2\\n' > {}", out_file.display()),
        );
        step.output_var_file = out_file.to_string_lossy().into_owned();
        executor.start(stage, step).await.unwrap();

        let record = executor.poll("outs", None).await.unwrap();
        assert!(record.error.is_empty());
        assert_eq!(record.outputs.get("A").unwrap(), "1");
        assert_eq!(record.outputs.get("B").unwrap(), "2");
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_missing_output_file_with_zero_exit_is_empty() {
        let (executor, stage) = executor().await;
        let mut step = shell_step("no-outs", "true");
        step.output_var_file = "/nonexistent/outputs.env".to_string();
        executor.start(stage, step).await.unwrap();

        let record = executor.poll("no-outs", None).await.unwrap();
        assert!(record.error.is_empty());
        assert!(record.outputs.is_empty());
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_declared_keys_scraped_from_env_dump() {
        let dir = tempfile::tempdir().unwrap();
        let (executor, stage) = executor().await;

        let mut step = shell_step(
            "scrape",
            &format!(
                "printf 'A=1\\nOTHER=x\\n' > {}/env.dump",
                dir.path().display()
            ),
        );
        step.scratch_dir = dir.path().to_string_lossy().into_owned();
        step.output_vars = vec!["A".to_string(), "MISSING".to_string()];
        executor.start(stage, step).await.unwrap();

        let record = executor.poll("scrape", None).await.unwrap();
        assert_eq!(record.outputs.get("A").unwrap(), "1");
        assert_eq!(record.outputs.get("MISSING").unwrap(), "");
        assert!(!record.outputs.contains_key("OTHER"));
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_exported_envs_and_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let (executor, stage) = executor().await;

        let mut step = shell_step(
            "extras",
            &format!(
                "printf 'NEW_ENV=fresh\\n' > {d}/export.env && printf 'payload' > {d}/artifact",
                d = dir.path().display()
            ),
        );
        step.scratch_dir = dir.path().to_string_lossy().into_owned();
        executor.start(stage, step).await.unwrap();

        let record = executor.poll("extras", None).await.unwrap();
        assert_eq!(record.envs.get("NEW_ENV").unwrap(), "fresh");
        assert_eq!(record.artifact, b"payload");
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_secret_masked_in_stream() {
        let engine = Engine::new();
        engine
            .setup(PipelineConfig {
                enable_docker_setup: false,
                ..Default::default()
            })
            .await
            .unwrap();
        let stage = StageState::new(
            vec![b"topsecret".to_vec()],
            false,
            LogServiceConfig::default(),
            TiConfig::default(),
        );
        let executor = StepExecutor::new(engine);

        executor
            .start(stage, shell_step("mask", "echo topsecret"))
            .await
            .unwrap();
        executor.poll("mask", None).await.unwrap();

        let stream = executor.stream("mask", 0).unwrap();
        let text: String = stream
            .snapshot
            .iter()
            .map(|l| l.text.clone())
            .collect::<Vec<_>>()
            .join("\n");
        assert!(!text.contains("topsecret"));
        assert!(text.contains("**************"));
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_stream_after_completion_closes_immediately() {
        let (executor, stage) = executor().await;
        executor
            .start(stage, shell_step("done", "echo fin"))
            .await
            .unwrap();
        executor.poll("done", None).await.unwrap();

        let mut stream = executor.stream("done", 0).unwrap();
        assert!(stream.snapshot.iter().any(|l| l.text == "fin"));
        // Buffer already closed; follow channel ends without more lines.
        while let Some(batch) = stream.sub.rx.recv().await {
            assert!(batch.iter().all(|l| l.seq < stream.tail));
        }
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_destroy_cancels_detached_step() {
        let (executor, stage) = executor().await;
        let mut step = shell_step("sidecar", "sleep 300");
        step.detach = true;
        executor.start(stage.clone(), step).await.unwrap();

        // Still running: poll gives the in-progress indicator.
        let record = executor.poll("sidecar", Some(Duration::ZERO)).await.unwrap();
        assert!(!record.run.exited);

        stage.teardown();
        executor.destroy().await;

        let record = executor.poll("sidecar", None).await.unwrap();
        assert!(record.run.exited);
        assert_eq!(record.error, "cancelled");
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_destroy_cancels_running_step() {
        let (executor, stage) = executor().await;
        executor
            .start(stage.clone(), shell_step("doomed", "sleep 300"))
            .await
            .unwrap();

        stage.teardown();
        executor.destroy().await;

        let record = executor.poll("doomed", Some(Duration::ZERO)).await.unwrap();
        assert!(record.exited());
        assert_eq!(record.error, "cancelled");
    }

    #[tokio::test]
    async fn test_start_failure_still_fires_latch() {
        let (executor, stage) = executor().await;
        let step = StepSpec {
            id: "bad".to_string(),
            entrypoint: vec!["stagehand-no-such-binary".to_string()],
            ..Default::default()
        };
        executor.start(stage, step).await.unwrap();

        let record = executor
            .poll("bad", Some(Duration::from_secs(30)))
            .await
            .unwrap();
        assert!(record.run.exited);
        assert!(!record.error.is_empty());
        assert_ne!(record.run.exit_code, 0);
    }
}
