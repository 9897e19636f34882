// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Process-level worker lifecycle.
//!
//! The spawner starts opaque worker processes (subprocess, container, or a
//! remote engine) configured to register with the KV, claim tasks matching
//! their tags, and exit after `max_tasks`. It only tracks handles; whatever
//! a worker does with a task is not the core's business.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::error::{CoordError, Result};
use crate::domain::worker::{SpawnMode, WorkerCommand, WorkerInstance, WorkerRuntime, WorkerSpec};
use crate::infrastructure::runtime::{DockerRuntime, DockerRuntimeConfig, LocalProcessRuntime};

#[derive(Debug, Clone)]
pub struct SpawnerConfig {
    /// Worker entrypoint: binary for local spawns, command inside the image
    /// for container spawns.
    pub worker_program: String,
    /// Handed to workers so they join the same KV.
    pub redis_url: String,
    /// Container engine settings; enables the docker/cloud modes.
    pub docker: Option<DockerRuntimeConfig>,
}

impl SpawnerConfig {
    pub fn new(worker_program: impl Into<String>, redis_url: impl Into<String>) -> Self {
        Self {
            worker_program: worker_program.into(),
            redis_url: redis_url.into(),
            docker: None,
        }
    }

    pub fn with_docker(mut self, docker: DockerRuntimeConfig) -> Self {
        self.docker = Some(docker);
        self
    }
}

/// Tracking handle for one spawned worker.
#[derive(Clone)]
pub struct WorkerHandle {
    pub worker_id: String,
    pub name: String,
    pub tags: std::collections::BTreeSet<String>,
    pub mode: SpawnMode,
    pub instance: WorkerInstance,
    runtime: Arc<dyn WorkerRuntime>,
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("worker_id", &self.worker_id)
            .field("name", &self.name)
            .field("tags", &self.tags)
            .field("mode", &self.mode)
            .field("instance", &self.instance)
            .finish()
    }
}

impl WorkerHandle {
    /// Pid for local workers, container id otherwise.
    pub fn instance_id(&self) -> &str {
        &self.instance.id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.instance.started_at
    }

    pub async fn is_alive(&self) -> bool {
        self.runtime.is_alive(&self.instance).await
    }

    pub async fn terminate(&self, grace: Duration) -> Result<()> {
        self.runtime.terminate(&self.instance, grace).await
    }
}

#[derive(Debug, Clone)]
pub struct WorkerStats {
    pub total: usize,
    pub alive: usize,
    pub dead: usize,
}

pub struct WorkerSpawner {
    config: SpawnerConfig,
    runtimes: HashMap<SpawnMode, Arc<dyn WorkerRuntime>>,
    workers: Mutex<HashMap<String, WorkerHandle>>,
}

impl WorkerSpawner {
    pub fn new(config: SpawnerConfig) -> Result<Self> {
        let mut runtimes: HashMap<SpawnMode, Arc<dyn WorkerRuntime>> = HashMap::new();
        runtimes.insert(SpawnMode::Local, Arc::new(LocalProcessRuntime::new()));
        if let Some(docker_config) = &config.docker {
            let runtime = Arc::new(DockerRuntime::new(docker_config.clone())?);
            runtimes.insert(runtime.mode(), runtime);
        }
        Ok(Self {
            config,
            runtimes,
            workers: Mutex::new(HashMap::new()),
        })
    }

    /// Install a runtime for a mode the defaults don't cover (e.g. a
    /// platform-specific cloud runtime).
    pub fn register_runtime(&mut self, runtime: Arc<dyn WorkerRuntime>) {
        self.runtimes.insert(runtime.mode(), runtime);
    }

    pub async fn spawn_worker(&self, spec: WorkerSpec) -> Result<WorkerHandle> {
        let runtime = self
            .runtimes
            .get(&spec.mode)
            .ok_or_else(|| {
                CoordError::Backend(format!(
                    "no runtime configured for {} workers",
                    spec.mode.as_str()
                ))
            })?
            .clone();

        let command = self.build_command(&spec);
        let instance = runtime.launch(&spec.name, &command).await?;
        let handle = WorkerHandle {
            worker_id: Uuid::new_v4().to_string()[..8].to_string(),
            name: spec.name.clone(),
            tags: spec.tags,
            mode: spec.mode,
            instance,
            runtime,
        };
        self.workers
            .lock()
            .await
            .insert(handle.worker_id.clone(), handle.clone());
        info!(
            worker = %handle.name,
            worker_id = %handle.worker_id,
            mode = handle.mode.as_str(),
            instance = %handle.instance.id,
            "spawned worker"
        );
        Ok(handle)
    }

    pub async fn list_workers(&self) -> Vec<WorkerHandle> {
        self.workers.lock().await.values().cloned().collect()
    }

    pub async fn get_worker(&self, worker_id: &str) -> Option<WorkerHandle> {
        self.workers.lock().await.get(worker_id).cloned()
    }

    /// Drop handles whose underlying process has exited. Returns how many
    /// were pruned.
    pub async fn gc_dead_workers(&self) -> usize {
        let handles = self.list_workers().await;
        let mut dead = Vec::new();
        for handle in handles {
            if !handle.is_alive().await {
                dead.push(handle.worker_id);
            }
        }
        let mut workers = self.workers.lock().await;
        for worker_id in &dead {
            workers.remove(worker_id);
        }
        dead.len()
    }

    pub async fn terminate_worker(&self, worker_id: &str, grace: Duration) -> Result<()> {
        let handle = self
            .workers
            .lock()
            .await
            .remove(worker_id)
            .ok_or_else(|| CoordError::Backend(format!("unknown worker {}", worker_id)))?;
        handle.terminate(grace).await
    }

    pub async fn terminate_all(&self, grace: Duration) {
        let handles: Vec<WorkerHandle> = self.workers.lock().await.drain().map(|(_, h)| h).collect();
        info!(count = handles.len(), "terminating all workers");
        for handle in handles {
            if let Err(e) = handle.terminate(grace).await {
                warn!(worker = %handle.name, error = %e, "worker termination failed");
            }
        }
    }

    pub async fn worker_stats(&self) -> WorkerStats {
        let handles = self.list_workers().await;
        let mut alive = 0;
        for handle in &handles {
            if handle.is_alive().await {
                alive += 1;
            }
        }
        WorkerStats {
            total: handles.len(),
            alive,
            dead: handles.len() - alive,
        }
    }

    /// The argument contract workers understand.
    fn build_command(&self, spec: &WorkerSpec) -> WorkerCommand {
        let mut args = vec![
            "--name".to_string(),
            spec.name.clone(),
            "--redis-url".to_string(),
            self.config.redis_url.clone(),
            "--poll-interval".to_string(),
            spec.poll_interval_secs.to_string(),
        ];
        if !spec.tags.is_empty() {
            args.push("--tags".to_string());
            args.push(
                spec.tags
                    .iter()
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(","),
            );
        }
        if let Some(max_tasks) = spec.max_tasks {
            args.push("--max-tasks".to_string());
            args.push(max_tasks.to_string());
        }
        let mut env = spec.env.clone();
        env.insert("REDIS_URL".to_string(), self.config.redis_url.clone());
        WorkerCommand {
            program: self.config.worker_program.clone(),
            args,
            env,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_contract() {
        let spawner = WorkerSpawner::new(SpawnerConfig::new(
            "agentcoord-worker",
            "redis://127.0.0.1:6379",
        ))
        .unwrap();
        let spec = WorkerSpec::new("builder-1", SpawnMode::Local)
            .tag("backend")
            .tag("rust")
            .max_tasks(10);
        let command = spawner.build_command(&spec);
        assert_eq!(command.program, "agentcoord-worker");
        let joined = command.args.join(" ");
        assert!(joined.contains("--name builder-1"));
        assert!(joined.contains("--tags backend,rust"));
        assert!(joined.contains("--max-tasks 10"));
        assert_eq!(
            command.env.get("REDIS_URL").map(String::as_str),
            Some("redis://127.0.0.1:6379")
        );
    }

    #[tokio::test]
    async fn test_unknown_mode_fails() {
        let spawner = WorkerSpawner::new(SpawnerConfig::new("worker", "redis://localhost")).unwrap();
        let err = spawner
            .spawn_worker(WorkerSpec::new("w", SpawnMode::Docker))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordError::Backend(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_gc_prunes_exited_workers() {
        // `true` ignores the worker argument contract and exits at once,
        // which is exactly what a dead worker looks like.
        let spawner = WorkerSpawner::new(SpawnerConfig::new("true", "redis://localhost")).unwrap();
        let handle = spawner
            .spawn_worker(WorkerSpec::new("short-lived", SpawnMode::Local))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!handle.is_alive().await);

        let pruned = spawner.gc_dead_workers().await;
        assert_eq!(pruned, 1);
        assert!(spawner.list_workers().await.is_empty());

        let err = spawner
            .terminate_worker(&handle.worker_id, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordError::Backend(_)));
    }
}
