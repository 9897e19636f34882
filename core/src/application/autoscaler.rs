// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Queue-depth driven worker scaling.
//!
//! Every interval the scaler compares outstanding work (ready + leased by
//! its own workers) against capacity and spawns or retires workers to meet
//! `tasks_per_worker` within the `min/max` bounds. A worker holding a lease
//! is never terminated; scale-down only touches workers idle past the grace.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::application::queue::TaskQueue;
use crate::application::registry::AgentRegistry;
use crate::application::spawner::{WorkerHandle, WorkerSpawner};
use crate::domain::error::Result;
use crate::domain::worker::{SpawnMode, WorkerSpec};

#[derive(Debug, Clone)]
pub struct AutoScalerConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    pub tasks_per_worker: usize,
    pub interval: Duration,
    pub idle_grace: Duration,
    pub termination_grace: Duration,
    pub mode: SpawnMode,
    pub tags: BTreeSet<String>,
    pub name_prefix: String,
}

impl Default for AutoScalerConfig {
    fn default() -> Self {
        Self {
            min_workers: 0,
            max_workers: 4,
            tasks_per_worker: 3,
            interval: Duration::from_secs(30),
            idle_grace: Duration::from_secs(120),
            termination_grace: Duration::from_secs(10),
            mode: SpawnMode::Local,
            tags: BTreeSet::new(),
            name_prefix: "scaled".to_string(),
        }
    }
}

impl AutoScalerConfig {
    /// `clamp(ceil(pending / tasks_per_worker), min, max)`
    pub fn desired_workers(&self, outstanding: u64) -> usize {
        let per_worker = self.tasks_per_worker.max(1) as u64;
        let raw = (outstanding + per_worker - 1) / per_worker;
        (raw as usize).clamp(self.min_workers, self.max_workers)
    }
}

pub struct AutoScaler {
    queue: TaskQueue,
    registry: AgentRegistry,
    spawner: Arc<WorkerSpawner>,
    config: AutoScalerConfig,
    idle_since: HashMap<String, Instant>,
}

impl AutoScaler {
    pub fn new(
        queue: TaskQueue,
        registry: AgentRegistry,
        spawner: Arc<WorkerSpawner>,
        config: AutoScalerConfig,
    ) -> Self {
        Self {
            queue,
            registry,
            spawner,
            config,
            idle_since: HashMap::new(),
        }
    }

    /// One scaling step. Safe to call manually; the background loop just
    /// calls this on the interval.
    pub async fn evaluate(&mut self) -> Result<()> {
        self.spawner.gc_dead_workers().await;
        let workers = self.owned_workers().await;
        let busy = self.busy_workers(&workers).await?;

        let leased: u64 = busy.values().map(|n| *n as u64).sum();
        let outstanding = self.queue.pending_count().await? + leased;
        let current = workers.len();
        let desired = self.config.desired_workers(outstanding);

        debug!(
            outstanding,
            current,
            desired,
            "autoscaler evaluation"
        );

        if desired > current {
            for _ in 0..(desired - current) {
                let name = format!(
                    "{}-{}",
                    self.config.name_prefix,
                    &Uuid::new_v4().to_string()[..8]
                );
                let mut spec = WorkerSpec::new(name, self.config.mode);
                spec.tags = self.config.tags.clone();
                match self.spawner.spawn_worker(spec).await {
                    Ok(handle) => info!(worker = %handle.name, "scaled up"),
                    Err(e) => warn!(error = %e, "scale-up spawn failed"),
                }
            }
            return Ok(());
        }

        if desired < current && outstanding == 0 {
            self.retire_one_idle(&workers, &busy).await;
        }
        Ok(())
    }

    pub fn spawn(mut self) -> ScalerHandle {
        let token = CancellationToken::new();
        let loop_token = token.clone();
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(self.config.interval);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        if let Err(e) = self.evaluate().await {
                            warn!(error = %e, "autoscaler evaluation failed");
                        }
                    }
                    _ = loop_token.cancelled() => break,
                }
            }
        });
        ScalerHandle { token, handle }
    }

    async fn owned_workers(&self) -> Vec<WorkerHandle> {
        self.spawner
            .list_workers()
            .await
            .into_iter()
            .filter(|w| w.mode == self.config.mode && w.name.starts_with(&self.config.name_prefix))
            .collect()
    }

    /// Lease counts per worker, matched through the registry by worker name.
    async fn busy_workers(&self, workers: &[WorkerHandle]) -> Result<HashMap<String, usize>> {
        let agents = self.registry.list_agents().await?;
        let mut busy = HashMap::new();
        for worker in workers {
            if let Some(agent) = agents.iter().find(|a| a.name == worker.name) {
                let leases = self.queue.leases(agent.id).await?;
                if !leases.is_empty() {
                    busy.insert(worker.worker_id.clone(), leases.len());
                }
            }
        }
        Ok(busy)
    }

    async fn retire_one_idle(
        &mut self,
        workers: &[WorkerHandle],
        busy: &HashMap<String, usize>,
    ) {
        let now = Instant::now();
        // Refresh idle bookkeeping: busy workers reset their idle clock.
        for worker in workers {
            if busy.contains_key(&worker.worker_id) {
                self.idle_since.remove(&worker.worker_id);
            } else {
                self.idle_since.entry(worker.worker_id.clone()).or_insert(now);
            }
        }
        self.idle_since
            .retain(|id, _| workers.iter().any(|w| &w.worker_id == id));

        let oldest = self
            .idle_since
            .iter()
            .filter(|(_, since)| now.duration_since(**since) >= self.config.idle_grace)
            .min_by_key(|(_, since)| **since)
            .map(|(id, _)| id.clone());

        if let Some(worker_id) = oldest {
            self.idle_since.remove(&worker_id);
            match self
                .spawner
                .terminate_worker(&worker_id, self.config.termination_grace)
                .await
            {
                Ok(()) => info!(worker_id = %worker_id, "scaled down idle worker"),
                Err(e) => warn!(worker_id = %worker_id, error = %e, "scale-down failed"),
            }
        }
    }
}

pub struct ScalerHandle {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl ScalerHandle {
    pub async fn stop(self) {
        self.token.cancel();
        let _ = self.handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(min: usize, max: usize, per_worker: usize) -> AutoScalerConfig {
        AutoScalerConfig {
            min_workers: min,
            max_workers: max,
            tasks_per_worker: per_worker,
            ..Default::default()
        }
    }

    #[test]
    fn test_desired_workers_clamps() {
        let cfg = config(1, 5, 3);
        assert_eq!(cfg.desired_workers(0), 1); // floor at min
        assert_eq!(cfg.desired_workers(1), 1);
        assert_eq!(cfg.desired_workers(3), 1);
        assert_eq!(cfg.desired_workers(4), 2); // ceil
        assert_eq!(cfg.desired_workers(9), 3);
        assert_eq!(cfg.desired_workers(1000), 5); // ceiling at max
    }

    #[test]
    fn test_desired_workers_zero_min() {
        let cfg = config(0, 4, 2);
        assert_eq!(cfg.desired_workers(0), 0);
        assert_eq!(cfg.desired_workers(1), 1);
    }
}
