// src/runtime/process_manager.rs
//! Process manager for agent and task subprocesses
//!
//! Resolves executables on `PATH` (cached), spawns them with tokio, and keeps
//! a per-task registry of pids so a cancelled task's subprocesses can be
//! released. Releasing is idempotent: pids that already exited are skipped.

use crate::lifecycle::CleanupHook;
use crate::utils::errors::{FleetError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// What to run
#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    /// Program name (looked up on `PATH`) or path
    pub program: String,

    pub args: Vec<String>,

    pub env: Vec<(String, String)>,

    /// Working directory; inherits the current one when `None`
    pub work_dir: Option<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Spawns subprocesses and releases the ones held by tasks
pub struct ProcessManager {
    /// Resolved executables (cached)
    executable_paths: Mutex<HashMap<String, PathBuf>>,

    /// task id → pids started on behalf of that task
    task_pids: DashMap<String, Vec<u32>>,

    /// Wait between SIGTERM and SIGKILL
    kill_grace: Duration,
}

impl ProcessManager {
    pub fn new() -> Self {
        Self {
            executable_paths: Mutex::new(HashMap::new()),
            task_pids: DashMap::new(),
            kill_grace: Duration::from_secs(2),
        }
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    /// Find the executable for `program`
    pub fn find_executable(&self, program: &str) -> Result<PathBuf> {
        if let Some(path) = self.executable_paths.lock().get(program) {
            return Ok(path.clone());
        }

        let path = if program.contains(std::path::MAIN_SEPARATOR) {
            let path = Path::new(program);
            if !path.exists() {
                return Err(FleetError::ProcessFailed(format!(
                    "Executable '{}' does not exist",
                    program
                )));
            }
            path.to_path_buf()
        } else {
            which::which(program).map_err(|e| {
                FleetError::ProcessFailed(format!(
                    "Executable '{}' not found in PATH: {}",
                    program, e
                ))
            })?
        };

        info!("Found {} at {:?}", program, path);
        self.executable_paths
            .lock()
            .insert(program.to_string(), path.clone());
        Ok(path)
    }

    /// Spawn a process. stdin is piped, output is discarded.
    pub fn spawn(&self, spec: &CommandSpec) -> Result<Child> {
        let executable = self.find_executable(&spec.program)?;
        debug!("Spawning {:?} {:?}", executable, spec.args);

        let mut command = Command::new(executable);
        command.args(&spec.args);

        if let Some(work_dir) = &spec.work_dir {
            command.current_dir(work_dir);
        }

        for (key, value) in &spec.env {
            command.env(key, value);
        }

        command
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let child = command.spawn().map_err(|e| {
            FleetError::ProcessFailed(format!("Failed to spawn {}: {}", spec.program, e))
        })?;

        debug!("Process spawned with PID: {:?}", child.id());
        Ok(child)
    }

    /// Spawn a process on behalf of a task and track its pid
    pub fn spawn_for_task(&self, task_id: &str, spec: &CommandSpec) -> Result<Child> {
        let child = self.spawn(spec)?;
        if let Some(pid) = child.id() {
            self.track(task_id, pid);
        }
        Ok(child)
    }

    pub fn track(&self, task_id: &str, pid: u32) {
        self.task_pids
            .entry(task_id.to_string())
            .or_default()
            .push(pid);
    }

    pub fn tracked(&self, task_id: &str) -> Vec<u32> {
        self.task_pids
            .get(task_id)
            .map(|pids| pids.clone())
            .unwrap_or_default()
    }

    /// Send SIGTERM. A pid that is already gone is not an error.
    pub fn terminate(&self, pid: u32) -> Result<()> {
        send(pid, Signal::SIGTERM)
    }

    /// SIGTERM, wait `kill_grace`, then SIGKILL if still alive
    pub async fn kill(&self, pid: u32) -> Result<()> {
        debug!("Sending SIGTERM to PID {}", pid);
        self.terminate(pid)?;

        let deadline = tokio::time::Instant::now() + self.kill_grace;
        while tokio::time::Instant::now() < deadline {
            if !self.is_running(pid) {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        if self.is_running(pid) {
            debug!("Process still alive, sending SIGKILL to PID {}", pid);
            send(pid, Signal::SIGKILL)?;
        }
        Ok(())
    }

    /// Whether a process with `pid` exists
    pub fn is_running(&self, pid: u32) -> bool {
        kill(Pid::from_raw(pid as i32), None).is_ok()
    }

    /// Kill every process tracked for `task_id`. Returns how many were signalled.
    pub async fn release_task(&self, task_id: &str) -> usize {
        let pids = match self.task_pids.remove(task_id) {
            Some((_, pids)) => pids,
            None => return 0,
        };

        let mut released = 0;
        for pid in pids {
            if !self.is_running(pid) {
                continue;
            }
            match self.kill(pid).await {
                Ok(()) => released += 1,
                Err(e) => warn!("Failed to release PID {} of task {}: {}", pid, task_id, e),
            }
        }

        if released > 0 {
            info!("Released {} process(es) of task {}", released, task_id);
        }
        released
    }
}

fn send(pid: u32, signal: Signal) -> Result<()> {
    match kill(Pid::from_raw(pid as i32), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(FleetError::ProcessFailed(format!(
            "Failed to send {:?} to {}: {}",
            signal, pid, e
        ))),
    }
}

impl Default for ProcessManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CleanupHook for ProcessManager {
    async fn cleanup(&self, task_id: &str) -> Result<()> {
        self.release_task(task_id).await;
        Ok(())
    }
}
