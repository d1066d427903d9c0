//! Host subprocess execution for steps without an image.
//!
//! The step command runs in its own process group so that an abort can
//! take the whole tree down: TERM first, KILL after the grace window.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use stagehand_core::step::StepSpec;
use stagehand_core::{Error, Result, RunState};
use stagehand_logs::StepLog;

/// Time between TERM and KILL when aborting a step.
const KILL_GRACE: Duration = Duration::from_secs(60);

/// Runs steps directly on the worker.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostEngine;

impl HostEngine {
    pub fn new() -> Self {
        Self
    }

    /// Spawn the step command, pump its merged stdout/stderr into `out`,
    /// and wait for exit. Cancellation triggers the abort sequence and
    /// surfaces as `Error::Cancelled`.
    pub async fn run(
        &self,
        cancel: CancellationToken,
        step: &StepSpec,
        envs: HashMap<String, String>,
        track_proc_file: &str,
        out: Arc<StepLog>,
    ) -> Result<RunState> {
        let argv = step.argv();
        if argv.is_empty() {
            return Err(Error::BadRequest(format!(
                "step {} has no entrypoint or command",
                step.id
            )));
        }

        let mut command = Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .envs(&envs)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if !step.working_dir.is_empty() {
            command.current_dir(&step.working_dir);
        }
        configure_process_group(&mut command, &step.user);

        let mut child = command
            .spawn()
            .map_err(|e| Error::ExecutionFailed(format!("start {}: {e}", argv[0])))?;
        let pid = child.id();
        info!(step = %step.id, command = %argv[0], pid, "spawned host process");

        if let (Some(pid), false) = (pid, track_proc_file.is_empty()) {
            if let Err(e) = append_tracked_pid(track_proc_file, pid).await {
                warn!(error = %e, "pid tracking write failed");
            }
        }

        // Stdout and stderr share one writer; the replacer and buffer
        // behind it serialize the interleaving.
        let stdout_pump = pump(child.stdout.take(), Arc::clone(&out));
        let stderr_pump = pump(child.stderr.take(), Arc::clone(&out));

        let status = tokio::select! {
            status = child.wait() => {
                status.map_err(|e| Error::ExecutionFailed(format!("wait: {e}")))?
            }
            _ = cancel.cancelled() => {
                abort(&mut child, pid).await;
                let _ = tokio::join!(stdout_pump, stderr_pump);
                return Err(Error::Cancelled);
            }
        };
        let _ = tokio::join!(stdout_pump, stderr_pump);

        let exit_code = exit_code_of(&status);
        debug!(step = %step.id, exit_code, "host process exited");
        Ok(RunState::exited(exit_code))
    }
}

fn pump(
    stream: Option<impl tokio::io::AsyncRead + Unpin + Send + 'static>,
    out: Arc<StepLog>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let Some(mut stream) = stream else { return };
        let mut buf = [0u8; 8192];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => out.write(&buf[..n]),
            }
        }
    })
}

#[cfg(unix)]
fn configure_process_group(command: &mut Command, user: &str) {
    command.process_group(0);
    if let Ok(uid) = user.parse::<u32>() {
        command.uid(uid);
    }
}

#[cfg(windows)]
fn configure_process_group(command: &mut Command, _user: &str) {
    // CREATE_NEW_PROCESS_GROUP
    command.creation_flags(0x0000_0200);
}

/// TERM the process group, escalate to KILL after the grace window.
#[cfg(unix)]
async fn abort(child: &mut Child, pid: Option<u32>) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Some(pid) = pid else {
        let _ = child.kill().await;
        return;
    };
    let group = Pid::from_raw(pid as i32);

    if let Err(e) = killpg(group, Signal::SIGTERM) {
        debug!(pid, error = %e, "TERM failed, process may have exited");
    }
    match tokio::time::timeout(KILL_GRACE, child.wait()).await {
        Ok(_) => {}
        Err(_) => {
            warn!(pid, "process survived TERM, sending KILL");
            let _ = killpg(group, Signal::SIGKILL);
            let _ = child.wait().await;
        }
    }
}

#[cfg(windows)]
async fn abort(child: &mut Child, pid: Option<u32>) {
    let Some(pid) = pid else {
        let _ = child.kill().await;
        return;
    };
    let taskkill = Command::new("taskkill")
        .args(["/t", "/f", "/pid", &pid.to_string()])
        .output()
        .await;
    if let Err(e) = taskkill {
        warn!(pid, error = %e, "taskkill failed");
        let _ = child.kill().await;
    }
    let _ = tokio::time::timeout(KILL_GRACE, child.wait()).await;
}

#[cfg(unix)]
fn exit_code_of(status: &std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code_of(status: &std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

async fn append_tracked_pid(path: &str, pid: u32) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(format!("{pid}\n").as_bytes()).await
}
