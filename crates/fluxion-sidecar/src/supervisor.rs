// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of FluxION.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

//! Child-process supervisor for the managed binary.
//!
//! ```text
//! Stopped --start--> Starting --alive after grace--> Running
//! Starting --spawn error or early exit--> Failed --reset--> Stopped
//! Running --stop--> Stopping --exited--> Stopped
//! Running --exits on its own--> Stopped
//! ```
//!
//! Calls to `start`/`stop`/`restart` are serialised. Output of both pipes is
//! appended to a bounded [`LogBuffer`] by one reader task per pipe, and a
//! monitor task owns the child and waits for it to exit.

use crate::error::SidecarError;
use crate::log_buffer::{DEFAULT_LOG_CAPACITY, LogBuffer};
use chrono::{DateTime, Utc};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const READER_JOIN_TIMEOUT: Duration = Duration::from_secs(1);
const KILL_WAIT_TIMEOUT: Duration = Duration::from_secs(5);
/// Longer output lines are split into chunks of this size
const MAX_LINE_BYTES: u64 = 16 * 1024;

/// Lifecycle of the supervised process
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunState {
    Stopped,
    Starting,
    Running {
        pid: u32,
        port: u16,
        started_at: DateTime<Utc>,
    },
    Stopping,
    Failed {
        reason: String,
    },
}

impl RunState {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running { .. })
    }

    /// States from which `start` is accepted
    pub fn can_start(&self) -> bool {
        matches!(self, Self::Stopped)
    }

    pub fn pid(&self) -> Option<u32> {
        match self {
            Self::Running { pid, .. } => Some(*pid),
            Self::Stopped | Self::Starting | Self::Stopping | Self::Failed { .. } => None,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Starting => write!(f, "starting"),
            Self::Running { pid, port, .. } => write!(f, "running (pid {pid}, port {port})"),
            Self::Stopping => write!(f, "stopping"),
            Self::Failed { reason } => write!(f, "failed: {reason}"),
        }
    }
}

/// Escalation tier that ended the process during `stop`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StopTier {
    /// Exited after SIGTERM
    Graceful,
    /// Exited after SIGINT
    Interrupted,
    /// Needed SIGKILL
    Killed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorTimings {
    /// Time the process must survive after spawn to count as running
    pub startup_grace: Duration,
    pub graceful_timeout: Duration,
    pub interrupt_timeout: Duration,
    pub poll_interval: Duration,
    pub restart_pause: Duration,
}

impl Default for SupervisorTimings {
    fn default() -> Self {
        Self {
            startup_grace: Duration::from_millis(500),
            graceful_timeout: Duration::from_secs(3),
            interrupt_timeout: Duration::from_millis(500),
            poll_interval: Duration::from_millis(100),
            restart_pause: Duration::from_millis(200),
        }
    }
}

#[derive(Debug)]
struct ChildHandle {
    pid: u32,
    generation: u64,
    exited: watch::Receiver<bool>,
    readers: Vec<JoinHandle<()>>,
    monitor: JoinHandle<()>,
}

#[derive(Debug)]
struct Shared {
    state: watch::Sender<RunState>,
    logs: Mutex<LogBuffer>,
    process: Mutex<Option<ChildHandle>>,
}

impl Shared {
    fn set_state(&self, next: RunState) {
        let previous = self.state.send_replace(next.clone());
        debug!(from = %previous, to = %next, "Run state changed");
    }

    /// Running -> Stopped after an exit nobody asked for. Idempotent.
    fn settle_unexpected_exit(&self, generation: u64) {
        let mut process = self.process.lock();
        if process.as_ref().is_none_or(|h| h.generation != generation) {
            return;
        }

        let transitioned = self.state.send_if_modified(|state| {
            if state.is_running() {
                *state = RunState::Stopped;
                true
            } else {
                false
            }
        });

        if transitioned {
            warn!("Managed process terminated unexpectedly");
            // Readers finish on EOF by themselves
            *process = None;
        }
    }
}

#[derive(Debug)]
pub struct ProcessSupervisor {
    shared: Arc<Shared>,
    op_lock: tokio::sync::Mutex<()>,
    timings: SupervisorTimings,
    next_generation: AtomicU64,
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

impl ProcessSupervisor {
    pub fn new(log_capacity: usize) -> Self {
        Self::with_timings(log_capacity, SupervisorTimings::default())
    }

    pub fn with_timings(log_capacity: usize, timings: SupervisorTimings) -> Self {
        let (state, _) = watch::channel(RunState::Stopped);
        Self {
            shared: Arc::new(Shared {
                state,
                logs: Mutex::new(LogBuffer::new(log_capacity)),
                process: Mutex::new(None),
            }),
            op_lock: tokio::sync::Mutex::new(()),
            timings,
            next_generation: AtomicU64::new(0),
        }
    }

    /// Current state snapshot
    pub fn state(&self) -> RunState {
        self.shared.state.borrow().clone()
    }

    /// Receiver notified on every state change
    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.shared.state.subscribe()
    }

    /// Captured output, oldest line first
    pub fn logs(&self) -> Vec<String> {
        self.shared.logs.lock().snapshot()
    }

    /// Lines captured after the first `seen`, and the updated count
    pub fn logs_since(&self, seen: u64) -> (Vec<String>, u64) {
        self.shared.logs.lock().since(seen)
    }

    pub fn is_running(&self) -> bool {
        self.state().is_running()
    }

    pub fn pid(&self) -> Option<u32> {
        self.state().pid()
    }

    /// Launch `binary --port <port> [--config <path>]`.
    ///
    /// Outside `Stopped` this is a no-op. Launch problems end in
    /// `Failed` rather than an error; the resulting state is returned.
    pub async fn start(&self, binary: &Path, port: u16, config_path: Option<&Path>) -> RunState {
        let _op = self.op_lock.lock().await;

        let current = self.state();
        if !current.can_start() {
            info!("Start ignored, process is {current}");
            return current;
        }

        if let Err(e) = check_launchable(binary, port) {
            return self.fail(e.to_string());
        }

        self.shared.set_state(RunState::Starting);
        self.shared.logs.lock().clear();

        let mut command = Command::new(binary);
        command.arg("--port").arg(port.to_string());
        if let Some(config_path) = config_path {
            command.arg("--config").arg(config_path);
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!(binary = %binary.display(), port, "Starting managed process");

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => return self.fail(format!("failed to spawn {}: {e}", binary.display())),
        };
        let Some(pid) = child.id() else {
            return self.fail("process exited before it could be tracked");
        };

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, Arc::clone(&self.shared)));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, Arc::clone(&self.shared)));
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (exited_tx, exited) = watch::channel(false);
        let monitor = tokio::spawn(monitor_exit(
            child,
            pid,
            generation,
            exited_tx,
            Arc::clone(&self.shared),
        ));

        *self.shared.process.lock() = Some(ChildHandle {
            pid,
            generation,
            exited: exited.clone(),
            readers,
            monitor,
        });

        tokio::time::sleep(self.timings.startup_grace).await;

        if *exited.borrow() {
            let handle = self.shared.process.lock().take();
            if let Some(handle) = handle {
                join_readers(handle.readers).await;
            }
            return self.fail("exited immediately after start");
        }

        self.shared.set_state(RunState::Running {
            pid,
            port,
            started_at: Utc::now(),
        });
        info!(pid, port, "Managed process running");

        // An exit between the check above and the transition is settled here
        if *exited.borrow() {
            self.shared.settle_unexpected_exit(generation);
        }

        self.state()
    }

    /// Stop the running process with SIGTERM, then SIGINT, then SIGKILL.
    ///
    /// Returns the tier that ended it, or `None` when nothing was running.
    pub async fn stop(&self) -> Option<StopTier> {
        let _op = self.op_lock.lock().await;

        let current = self.state();
        if !current.is_running() {
            info!("Stop ignored, process is {current}");
            return None;
        }

        self.shared.set_state(RunState::Stopping);
        let handle = self.shared.process.lock().take();
        let Some(mut handle) = handle else {
            self.shared.set_state(RunState::Stopped);
            return None;
        };

        info!(pid = handle.pid, "Stopping managed process");
        let tier = self.terminate(&mut handle).await;

        join_readers(handle.readers).await;
        if tokio::time::timeout(READER_JOIN_TIMEOUT, &mut handle.monitor)
            .await
            .is_err()
        {
            handle.monitor.abort();
        }

        self.shared.set_state(RunState::Stopped);
        info!(pid = handle.pid, tier = ?tier, "Managed process stopped");
        Some(tier)
    }

    /// Clear a `Failed` state so that `start` is accepted again.
    ///
    /// Returns whether there was a failure to clear.
    pub async fn reset(&self) -> bool {
        let _op = self.op_lock.lock().await;

        if !matches!(self.state(), RunState::Failed { .. }) {
            return false;
        }
        self.shared.set_state(RunState::Stopped);
        debug!("Cleared failed state");
        true
    }

    /// `stop`, a short pause, then `start`. Not atomic.
    pub async fn restart(&self, binary: &Path, port: u16, config_path: Option<&Path>) -> RunState {
        info!("Restarting managed process");
        self.stop().await;
        tokio::time::sleep(self.timings.restart_pause).await;
        self.start(binary, port, config_path).await
    }

    async fn terminate(&self, handle: &mut ChildHandle) -> StopTier {
        let pid = nix_pid(handle.pid);

        let tiers = [
            (Signal::SIGTERM, self.timings.graceful_timeout, StopTier::Graceful),
            (Signal::SIGINT, self.timings.interrupt_timeout, StopTier::Interrupted),
        ];
        for (sig, timeout, tier) in tiers {
            if *handle.exited.borrow() {
                return tier;
            }
            send_signal(pid, sig);
            if self.wait_for_exit(&handle.exited, timeout).await {
                return tier;
            }
            warn!(pid = handle.pid, "Process still alive after {sig:?}");
        }

        if !*handle.exited.borrow() {
            send_signal(pid, Signal::SIGKILL);
            if !self.wait_for_exit(&handle.exited, KILL_WAIT_TIMEOUT).await {
                warn!(pid = handle.pid, "Process did not report exit after SIGKILL");
            }
        }
        StopTier::Killed
    }

    async fn wait_for_exit(&self, exited: &watch::Receiver<bool>, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if *exited.borrow() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(self.timings.poll_interval).await;
        }
    }

    fn fail(&self, reason: impl Into<String>) -> RunState {
        let reason = reason.into();
        warn!("Managed process failed to start: {reason}");
        let state = RunState::Failed { reason };
        self.shared.set_state(state.clone());
        state
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        if let Some(handle) = self.shared.process.lock().take()
            && !*handle.exited.borrow()
        {
            send_signal(nix_pid(handle.pid), Signal::SIGKILL);
        }
    }
}

fn check_launchable(binary: &Path, port: u16) -> Result<(), SidecarError> {
    if port == 0 {
        return Err(SidecarError::InvalidPort(0));
    }

    let executable = std::fs::metadata(binary)
        .is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0);
    if !executable {
        return Err(SidecarError::Io(std::io::Error::other(format!(
            "{} is not an executable file",
            binary.display()
        ))));
    }
    Ok(())
}

#[expect(clippy::cast_possible_wrap)]
fn nix_pid(pid: u32) -> Pid {
    Pid::from_raw(pid as i32)
}

fn send_signal(pid: Pid, sig: Signal) {
    match signal::kill(pid, sig) {
        Ok(()) => debug!(pid = pid.as_raw(), "Sent {sig:?}"),
        Err(nix::errno::Errno::ESRCH) => debug!(pid = pid.as_raw(), "Process already gone"),
        Err(e) => warn!(pid = pid.as_raw(), "Failed to send {sig:?}: {e}"),
    }
}

fn spawn_reader<R>(pipe: R, shared: Arc<Shared>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move { pump_lines(pipe, &shared.logs, MAX_LINE_BYTES).await })
}

/// Append `pipe` output to `logs` until EOF, cutting lines at `max_line` bytes.
async fn pump_lines<R>(pipe: R, logs: &Mutex<LogBuffer>, max_line: u64)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(pipe);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match (&mut reader).take(max_line).read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => logs.lock().push_text(&String::from_utf8_lossy(&buf)),
            Err(e) => {
                debug!("Pipe read failed: {e}");
                break;
            }
        }
    }
}

async fn monitor_exit(
    mut child: Child,
    pid: u32,
    generation: u64,
    exited: watch::Sender<bool>,
    shared: Arc<Shared>,
) {
    match child.wait().await {
        Ok(status) => info!(pid, "Managed process exited: {status}"),
        Err(e) => warn!(pid, "Failed to wait for managed process: {e}"),
    }
    let _ = exited.send_replace(true);
    shared.settle_unexpected_exit(generation);
}

async fn join_readers(readers: Vec<JoinHandle<()>>) {
    for reader in readers {
        let abort = reader.abort_handle();
        if tokio::time::timeout(READER_JOIN_TIMEOUT, reader).await.is_err() {
            debug!("Pipe reader did not finish, aborting");
            abort.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_long_lines_are_split() {
        let logs = Mutex::new(LogBuffer::new(10));
        let output = format!("{}\nok\n", "x".repeat(10));

        pump_lines(output.as_bytes(), &logs, 4).await;

        assert_eq!(logs.lock().snapshot(), vec!["xxxx", "xxxx", "xx", "ok"]);
    }

    #[test]
    fn test_run_state_helpers() {
        let running = RunState::Running {
            pid: 42,
            port: 8317,
            started_at: Utc::now(),
        };
        assert!(running.is_running());
        assert!(!running.can_start());
        assert_eq!(running.pid(), Some(42));
        assert_eq!(running.to_string(), "running (pid 42, port 8317)");

        assert!(RunState::Stopped.can_start());
        assert!(!RunState::Failed { reason: "x".into() }.can_start());
        assert!(!RunState::Stopping.can_start());
        assert_eq!(RunState::Starting.pid(), None);
    }

    #[test]
    fn test_check_launchable() {
        assert!(matches!(
            check_launchable(Path::new("/bin/sh"), 0),
            Err(SidecarError::InvalidPort(0))
        ));
        assert!(check_launchable(Path::new("/definitely/missing"), 8317).is_err());
        assert!(check_launchable(Path::new("/bin/sh"), 8317).is_ok());
    }

    #[test]
    fn test_run_state_serializes_tagged() {
        let json = serde_json::to_value(RunState::Failed {
            reason: "boom".into(),
        })
        .unwrap();
        assert_eq!(json["state"], "failed");
        assert_eq!(json["reason"], "boom");
    }

    #[tokio::test]
    async fn test_stop_when_idle_is_noop() {
        let supervisor = ProcessSupervisor::default();
        assert_eq!(supervisor.stop().await, None);
        assert_eq!(supervisor.state(), RunState::Stopped);
    }
}
