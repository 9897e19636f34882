// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Local subprocess worker runtime.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::domain::error::{CoordError, Result};
use crate::domain::worker::{SpawnMode, WorkerCommand, WorkerInstance, WorkerRuntime};

pub struct LocalProcessRuntime {
    children: Mutex<HashMap<u32, Child>>,
}

impl LocalProcessRuntime {
    pub fn new() -> Self {
        Self {
            children: Mutex::new(HashMap::new()),
        }
    }

    async fn reap(&self, pid: u32) {
        if let Some(mut child) = self.children.lock().await.remove(&pid) {
            let _ = child.wait().await;
        }
    }
}

impl Default for LocalProcessRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkerRuntime for LocalProcessRuntime {
    fn mode(&self) -> SpawnMode {
        SpawnMode::Local
    }

    async fn launch(&self, name: &str, command: &WorkerCommand) -> Result<WorkerInstance> {
        let child = Command::new(&command.program)
            .args(&command.args)
            .envs(&command.env)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                CoordError::Backend(format!("failed to spawn worker '{}': {}", name, e))
            })?;
        let pid = child
            .id()
            .ok_or_else(|| CoordError::Backend(format!("worker '{}' exited at spawn", name)))?;
        self.children.lock().await.insert(pid, child);
        info!(worker = name, pid, "spawned subprocess worker");
        Ok(WorkerInstance {
            id: pid.to_string(),
            started_at: Utc::now(),
        })
    }

    async fn is_alive(&self, instance: &WorkerInstance) -> bool {
        let pid: u32 = match instance.id.parse() {
            Ok(pid) => pid,
            Err(_) => return false,
        };
        let mut children = self.children.lock().await;
        if let Some(child) = children.get_mut(&pid) {
            match child.try_wait() {
                Ok(None) => return true,
                Ok(Some(_)) | Err(_) => {
                    children.remove(&pid);
                    return false;
                }
            }
        }
        drop(children);
        process_exists(pid)
    }

    async fn terminate(&self, instance: &WorkerInstance, grace: Duration) -> Result<()> {
        let pid: u32 = instance
            .id
            .parse()
            .map_err(|_| CoordError::Backend(format!("bad pid '{}'", instance.id)))?;

        if !self.is_alive(instance).await {
            self.reap(pid).await;
            return Ok(());
        }

        send_signal(pid, PoliteSignal::Terminate)?;
        let deadline = tokio::time::Instant::now() + grace;
        while tokio::time::Instant::now() < deadline {
            if !self.is_alive(instance).await {
                self.reap(pid).await;
                info!(pid, "worker stopped gracefully");
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }

        warn!(pid, "worker ignored polite stop, killing");
        send_signal(pid, PoliteSignal::Kill)?;
        self.reap(pid).await;
        Ok(())
    }
}

enum PoliteSignal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: PoliteSignal) -> Result<()> {
    let signo = match signal {
        PoliteSignal::Terminate => libc::SIGTERM,
        PoliteSignal::Kill => libc::SIGKILL,
    };
    let rc = unsafe { libc::kill(pid as i32, signo) };
    // ESRCH (no such process) means the worker already exited.
    if rc != 0 && std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH) {
        return Err(CoordError::Backend(format!(
            "failed to signal process {}",
            pid
        )));
    }
    Ok(())
}

#[cfg(not(unix))]
fn send_signal(pid: u32, _signal: PoliteSignal) -> Result<()> {
    let output = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/F"])
        .output()?;
    if !output.status.success() {
        return Err(CoordError::Backend(format!(
            "taskkill failed for process {}",
            pid
        )));
    }
    Ok(())
}

#[cfg(unix)]
fn process_exists(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(not(unix))]
fn process_exists(_pid: u32) -> bool {
    false
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn sleep_command(secs: u32) -> WorkerCommand {
        WorkerCommand {
            program: "sleep".into(),
            args: vec![secs.to_string()],
            env: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_spawn_probe_terminate() {
        let runtime = LocalProcessRuntime::new();
        let instance = runtime
            .launch("probe-worker", &sleep_command(30))
            .await
            .unwrap();
        assert!(runtime.is_alive(&instance).await);

        runtime
            .terminate(&instance, Duration::from_secs(2))
            .await
            .unwrap();
        assert!(!runtime.is_alive(&instance).await);
    }

    #[tokio::test]
    async fn test_dead_worker_reads_dead() {
        let runtime = LocalProcessRuntime::new();
        let instance = runtime
            .launch("short-worker", &sleep_command(0))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!runtime.is_alive(&instance).await);
    }
}
