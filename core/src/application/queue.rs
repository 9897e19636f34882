// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! The task queue: priority ordering, dependency gating, atomic claiming,
//! retry scheduling, and escalation.
//!
//! Storage layout (all under the KV):
//! - `task:{id}`                 task record hash
//! - `tasks:pending`             ready-queue sorted set, scored by priority/FIFO
//! - `tasks:retry`               scheduled retries, scored by due epoch seconds
//! - `tasks:escalated`/`tasks:dlq` supervisor surfaces
//! - `tasks:by_agent:{agent}`    current leases, for reclamation
//! - `tasks:dependents:{id}`     reverse dependency index for fan-out

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::audit::AuditLog;
use crate::application::registry::AgentRegistry;
use crate::domain::agent::AgentId;
use crate::domain::audit::AuditKind;
use crate::domain::error::{CoordError, Result};
use crate::domain::events::EscalationEvent;
use crate::domain::now_iso;
use crate::domain::task::{RetryPolicy, Task, TaskId, TaskSpec, TaskStatus};
use crate::infrastructure::kv::{ClaimRequest, KvBackend};
use crate::keys;

/// Polling bounds for the blocking claim variant.
const CLAIM_BACKOFF_START: Duration = Duration::from_millis(50);
const CLAIM_BACKOFF_CAP: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub tag: Option<String>,
    pub min_priority: Option<i64>,
}

impl TaskFilter {
    pub fn status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn min_priority(mut self, priority: i64) -> Self {
        self.min_priority = Some(priority);
        self
    }

    fn accepts(&self, task: &Task) -> bool {
        if let Some(status) = self.status {
            if task.status != status {
                return false;
            }
        }
        if let Some(tag) = &self.tag {
            if !task.tags.contains(tag) {
                return false;
            }
        }
        if let Some(min) = self.min_priority {
            if task.priority < min {
                return false;
            }
        }
        true
    }
}

/// One node of the dependency graph surface used by UIs.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DependencyNode {
    pub status: TaskStatus,
    pub depends_on: Vec<TaskId>,
    pub dependents: Vec<TaskId>,
}

#[derive(Clone)]
pub struct TaskQueue {
    kv: Arc<dyn KvBackend>,
    audit: AuditLog,
}

impl TaskQueue {
    pub fn new(kv: Arc<dyn KvBackend>, audit: AuditLog) -> Self {
        Self { kv, audit }
    }

    // ── creation and reads ────────────────────────────────────────────────

    /// Tasks with dependencies stay out of the ready queue until the last
    /// dependency completes; completion fans out through the reverse index.
    pub async fn create_task(&self, spec: TaskSpec) -> Result<Task> {
        let task = Task::new(spec);
        self.store_task(&task).await?;
        self.kv
            .sadd(keys::TASKS_INDEX, &task.id.to_string())
            .await?;
        for dep in &task.depends_on {
            self.kv
                .sadd(&keys::tasks_dependents(*dep), &task.id.to_string())
                .await?;
        }
        if self.deps_complete(&task).await? {
            self.kv
                .zadd(keys::TASKS_PENDING, task.pending_score(), &task.id.to_string())
                .await?;
        }
        info!(task_id = %task.id, title = %task.title, priority = task.priority, "created task");
        Ok(task)
    }

    pub async fn get_task(&self, id: TaskId) -> Result<Task> {
        let fields = self.kv.hgetall(&keys::task(id)).await?;
        if fields.is_empty() {
            return Err(CoordError::UnknownTask(id.to_string()));
        }
        Task::from_fields(&fields)
    }

    /// Head of the ready queue, dependency-checked. A read, not a claim.
    pub async fn get_ready_tasks(&self, limit: Option<usize>) -> Result<Vec<Task>> {
        let mut ready = Vec::new();
        for (raw, _) in self.kv.zrange_desc(keys::TASKS_PENDING, None).await? {
            let id = TaskId::parse(&raw)?;
            let task = match self.get_task(id).await {
                Ok(task) => task,
                Err(CoordError::UnknownTask(_)) => continue,
                Err(e) => return Err(e),
            };
            if task.status == TaskStatus::Pending && self.deps_complete(&task).await? {
                ready.push(task);
                if matches!(limit, Some(l) if ready.len() >= l) {
                    break;
                }
            }
        }
        Ok(ready)
    }

    pub async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let mut tasks = Vec::new();
        for raw in self.kv.smembers(keys::TASKS_INDEX).await? {
            let id = TaskId::parse(&raw)?;
            match self.get_task(id).await {
                Ok(task) => {
                    if filter.accepts(&task) {
                        tasks.push(task);
                    }
                }
                Err(CoordError::UnknownTask(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        tasks.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        Ok(tasks)
    }

    pub async fn pending_count(&self) -> Result<u64> {
        self.kv.zcard(keys::TASKS_PENDING).await
    }

    /// Task ids currently leased by an agent.
    pub async fn leases(&self, agent_id: AgentId) -> Result<Vec<TaskId>> {
        self.kv
            .smembers(&keys::tasks_by_agent(agent_id))
            .await?
            .iter()
            .map(|raw| TaskId::parse(raw))
            .collect()
    }

    pub async fn get_dependency_graph(&self) -> Result<HashMap<TaskId, DependencyNode>> {
        let mut graph: HashMap<TaskId, DependencyNode> = HashMap::new();
        for raw in self.kv.smembers(keys::TASKS_INDEX).await? {
            let id = TaskId::parse(&raw)?;
            if let Ok(task) = self.get_task(id).await {
                graph.insert(
                    id,
                    DependencyNode {
                        status: task.status,
                        depends_on: task.depends_on.iter().copied().collect(),
                        dependents: Vec::new(),
                    },
                );
            }
        }
        let edges: Vec<(TaskId, TaskId)> = graph
            .iter()
            .flat_map(|(id, node)| node.depends_on.iter().map(|dep| (*dep, *id)))
            .collect();
        for (dep, dependent) in edges {
            if let Some(node) = graph.get_mut(&dep) {
                node.dependents.push(dependent);
            }
        }
        Ok(graph)
    }

    // ── claiming ──────────────────────────────────────────────────────────

    /// Claim the best ready task this agent is eligible for, or `None`.
    ///
    /// Candidates are scanned in priority-then-FIFO order; the per-candidate
    /// compare-and-claim is a single scripted KV operation, so two competing
    /// agents can never win the same task. Losing a candidate just moves the
    /// scan to the next one.
    pub async fn claim_task(
        &self,
        agent_id: AgentId,
        capabilities: Option<&BTreeSet<String>>,
    ) -> Result<Option<Task>> {
        for (raw, _) in self.kv.zrange_desc(keys::TASKS_PENDING, None).await? {
            let id = TaskId::parse(&raw)?;
            let task = match self.get_task(id).await {
                Ok(task) => task,
                Err(CoordError::UnknownTask(_)) => {
                    // Stale queue entry; drop it.
                    self.kv.zrem(keys::TASKS_PENDING, &raw).await?;
                    continue;
                }
                Err(e) => return Err(e),
            };
            if !task.matches_capabilities(capabilities) {
                continue;
            }
            if !self.deps_complete(&task).await? {
                continue;
            }
            let claimed = self
                .kv
                .claim_pending(&ClaimRequest {
                    pending_key: keys::TASKS_PENDING.to_string(),
                    task_key: keys::task(id),
                    by_agent_key: keys::tasks_by_agent(agent_id),
                    task_id: id.to_string(),
                    agent_id: agent_id.to_string(),
                    now: now_iso(),
                })
                .await?;
            if claimed {
                self.audit
                    .emit(
                        &agent_id.to_string(),
                        AuditKind::TaskClaim,
                        &id.to_string(),
                        &task.title,
                    )
                    .await;
                info!(task_id = %id, agent_id = %agent_id, "claimed task");
                return Ok(Some(self.get_task(id).await?));
            }
            // Someone else won this candidate; keep scanning.
            debug!(task_id = %id, "lost claim race, trying next candidate");
        }
        Ok(None)
    }

    /// Long-polling claim: capped-backoff polling until a task is won or the
    /// deadline passes. Fails `Timeout` without reserving anything.
    pub async fn claim_task_blocking(
        &self,
        agent_id: AgentId,
        capabilities: Option<&BTreeSet<String>>,
        timeout: Duration,
    ) -> Result<Task> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut backoff = CLAIM_BACKOFF_START;
        loop {
            if let Some(task) = self.claim_task(agent_id, capabilities).await? {
                return Ok(task);
            }
            if tokio::time::Instant::now() + backoff > deadline {
                return Err(CoordError::Timeout(format!(
                    "no claimable task within {:?}",
                    timeout
                )));
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(CLAIM_BACKOFF_CAP);
        }
    }

    // ── lifecycle ─────────────────────────────────────────────────────────

    /// Advance `claimed → in_progress` once work actually begins.
    pub async fn start_task(&self, id: TaskId, agent_id: AgentId) -> Result<Task> {
        let mut task = self.get_task(id).await?;
        task.ensure_status(&[TaskStatus::Claimed], "start")?;
        let holder = agent_id.to_string();
        if task.claimed_by.as_deref() != Some(holder.as_str()) {
            return Err(CoordError::IllegalStateTransition(format!(
                "task {} is leased to {}, not {}",
                id,
                task.claimed_by.as_deref().unwrap_or("nobody"),
                agent_id
            )));
        }
        task.status = TaskStatus::InProgress;
        task.updated_at = Utc::now();
        self.store_task(&task).await?;
        Ok(task)
    }

    /// Complete a leased task and promote any dependents that just became
    /// ready. After this returns, every newly-ready dependent is queued.
    pub async fn complete_task(&self, id: TaskId, result: Option<String>) -> Result<Task> {
        let mut task = self.get_task(id).await?;
        task.ensure_status(&[TaskStatus::Claimed, TaskStatus::InProgress], "complete")?;

        task.status = TaskStatus::Completed;
        task.completed_at = Some(now_iso());
        task.updated_at = Utc::now();
        task.result = result;
        self.store_task(&task).await?;
        self.clear_lease(&task).await?;
        self.audit
            .emit(
                task.claimed_by.as_deref().unwrap_or(""),
                AuditKind::TaskCompleted,
                &id.to_string(),
                &task.title,
            )
            .await;

        for raw in self.kv.smembers(&keys::tasks_dependents(id)).await? {
            let dependent = TaskId::parse(&raw)?;
            if self.promote_if_ready(dependent).await? {
                debug!(task_id = %dependent, "dependency satisfied, promoted to pending");
            }
        }
        info!(task_id = %id, "completed task");
        Ok(task)
    }

    /// Record a failure. Within the retry budget this schedules a child
    /// retry task after the policy delay; past it (or with no retry policy)
    /// the record escalates.
    pub async fn fail_task(&self, id: TaskId, error: &str) -> Result<Task> {
        let mut task = self.get_task(id).await?;
        task.ensure_status(&[TaskStatus::Claimed, TaskStatus::InProgress], "fail")?;

        let attempt = task.retry_count + 1;
        task.error = Some(error.to_string());
        task.updated_at = Utc::now();
        self.clear_lease(&task).await?;
        self.audit
            .emit(
                task.claimed_by.as_deref().unwrap_or(""),
                AuditKind::TaskFailed,
                &id.to_string(),
                error,
            )
            .await;

        if task.retry_policy == RetryPolicy::None || attempt > task.max_retries {
            let reason = format!("retries exhausted: {}", error);
            task.push_history(error, "escalated");
            self.escalate_record(&mut task, &reason).await?;
            return Ok(task);
        }

        // The failed record is terminal; the retry is a new record linked by
        // parent_task_id, released by the sweeper once the delay passes.
        task.status = TaskStatus::Failed;
        task.push_history(error, "scheduled_retry");
        self.store_task(&task).await?;

        let delay = task.retry_policy.delay_secs(task.retry_delay_base, attempt);
        let child = task.retry_child(attempt);
        self.store_task(&child).await?;
        self.kv
            .sadd(keys::TASKS_INDEX, &child.id.to_string())
            .await?;
        for dep in &child.depends_on {
            self.kv
                .sadd(&keys::tasks_dependents(*dep), &child.id.to_string())
                .await?;
        }
        let due = Utc::now().timestamp() + delay as i64;
        self.kv
            .zadd(keys::TASKS_RETRY, due as f64, &child.id.to_string())
            .await?;
        info!(
            task_id = %id,
            retry_id = %child.id,
            attempt,
            delay_secs = delay,
            "scheduled retry"
        );
        Ok(task)
    }

    /// Manual escalation by a supervisor or coordinator.
    pub async fn escalate_task(&self, id: TaskId, reason: &str) -> Result<Task> {
        let mut task = self.get_task(id).await?;
        task.ensure_status(
            &[
                TaskStatus::Pending,
                TaskStatus::Claimed,
                TaskStatus::InProgress,
                TaskStatus::Failed,
            ],
            "escalate",
        )?;
        self.kv
            .zrem(keys::TASKS_PENDING, &id.to_string())
            .await?;
        self.clear_lease(&task).await?;
        task.push_history(reason, "manual_escalation");
        self.escalate_record(&mut task, reason).await?;
        Ok(task)
    }

    /// Supervisor retry of an escalated task: a fresh pending record with a
    /// reset retry budget, linked through `parent_task_id`. The escalated
    /// record leaves the surface set but stays terminal.
    pub async fn retry_task(&self, id: TaskId) -> Result<Task> {
        let task = self.get_task(id).await?;
        task.ensure_status(&[TaskStatus::Escalated], "retry")?;
        self.kv
            .zrem(keys::TASKS_ESCALATED, &id.to_string())
            .await?;

        let mut child = task.retry_child(0);
        child.push_history("supervisor retry", "supervisor_retry");
        self.store_task(&child).await?;
        self.kv
            .sadd(keys::TASKS_INDEX, &child.id.to_string())
            .await?;
        for dep in &child.depends_on {
            self.kv
                .sadd(&keys::tasks_dependents(*dep), &child.id.to_string())
                .await?;
        }
        if self.deps_complete(&child).await? {
            self.kv
                .zadd(
                    keys::TASKS_PENDING,
                    child.pending_score(),
                    &child.id.to_string(),
                )
                .await?;
        }
        self.audit
            .emit("", AuditKind::Other("task_retried".into()), &id.to_string(), "")
            .await;
        Ok(child)
    }

    /// Move an escalated task to the dead-letter surface.
    pub async fn archive_task(&self, id: TaskId) -> Result<()> {
        let task = self.get_task(id).await?;
        task.ensure_status(&[TaskStatus::Escalated], "archive")?;
        self.kv
            .zrem(keys::TASKS_ESCALATED, &id.to_string())
            .await?;
        self.kv
            .zadd(
                keys::TASKS_DLQ,
                Utc::now().timestamp() as f64,
                &id.to_string(),
            )
            .await?;
        Ok(())
    }

    // ── sweepers ──────────────────────────────────────────────────────────

    /// Move due retries into the ready queue. Returns how many moved.
    pub async fn sweep_due_retries(&self) -> Result<usize> {
        let now = Utc::now().timestamp() as f64;
        let due = self
            .kv
            .zrange_by_score(keys::TASKS_RETRY, 0.0, now)
            .await?;
        let mut promoted = 0;
        for raw in due {
            self.kv.zrem(keys::TASKS_RETRY, &raw).await?;
            let id = TaskId::parse(&raw)?;
            if self.promote_if_ready(id).await? {
                promoted += 1;
            }
        }
        Ok(promoted)
    }

    /// Return tasks leased by hung agents to the ready queue. At-least-once
    /// delivery: the original worker may have partially executed them.
    pub async fn sweep_hung_leases(&self, registry: &AgentRegistry) -> Result<usize> {
        let stale = registry.stale_agents(registry.hung_threshold()).await?;
        let mut reclaimed = 0;
        for agent_id in stale {
            for task_id in self.leases(agent_id).await? {
                let mut task = match self.get_task(task_id).await {
                    Ok(task) => task,
                    Err(CoordError::UnknownTask(_)) => {
                        self.kv
                            .srem(&keys::tasks_by_agent(agent_id), &task_id.to_string())
                            .await?;
                        continue;
                    }
                    Err(e) => return Err(e),
                };
                if !task.status.is_leased() {
                    self.kv
                        .srem(&keys::tasks_by_agent(agent_id), &task_id.to_string())
                        .await?;
                    continue;
                }
                task.status = TaskStatus::Pending;
                task.claimed_by = None;
                task.claimed_at = None;
                task.updated_at = Utc::now();
                self.store_task(&task).await?;
                self.kv
                    .srem(&keys::tasks_by_agent(agent_id), &task_id.to_string())
                    .await?;
                if self.deps_complete(&task).await? {
                    self.kv
                        .zadd(
                            keys::TASKS_PENDING,
                            task.pending_score(),
                            &task_id.to_string(),
                        )
                        .await?;
                }
                self.audit
                    .emit(
                        &agent_id.to_string(),
                        AuditKind::HungAgent,
                        &task_id.to_string(),
                        "lease reclaimed from hung agent",
                    )
                    .await;
                warn!(task_id = %task_id, agent_id = %agent_id, "reclaimed task from hung agent");
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    /// Background retry + reclamation loop. One per queue handle is enough;
    /// extra sweepers are harmless, just redundant.
    pub fn spawn_sweepers(&self, registry: AgentRegistry, interval: Duration) -> SweeperHandle {
        let queue = self.clone();
        let token = CancellationToken::new();
        let loop_token = token.clone();
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        if let Err(e) = queue.sweep_due_retries().await {
                            warn!(error = %e, "retry sweep failed");
                        }
                        if let Err(e) = queue.sweep_hung_leases(&registry).await {
                            warn!(error = %e, "reclamation sweep failed");
                        }
                    }
                    _ = loop_token.cancelled() => break,
                }
            }
        });
        SweeperHandle { token, handle }
    }

    // ── internals ─────────────────────────────────────────────────────────

    async fn store_task(&self, task: &Task) -> Result<()> {
        self.kv.hset(&keys::task(task.id), &task.to_fields()).await
    }

    async fn clear_lease(&self, task: &Task) -> Result<()> {
        if let Some(holder) = &task.claimed_by {
            if let Ok(agent_id) = AgentId::parse(holder) {
                self.kv
                    .srem(&keys::tasks_by_agent(agent_id), &task.id.to_string())
                    .await?;
            }
        }
        Ok(())
    }

    /// A dependency on an unknown id counts as incomplete.
    async fn deps_complete(&self, task: &Task) -> Result<bool> {
        for dep in &task.depends_on {
            match self.get_task(*dep).await {
                Ok(dep_task) if dep_task.status == TaskStatus::Completed => continue,
                Ok(_) => return Ok(false),
                Err(CoordError::UnknownTask(_)) => return Ok(false),
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    async fn promote_if_ready(&self, id: TaskId) -> Result<bool> {
        let task = match self.get_task(id).await {
            Ok(task) => task,
            Err(CoordError::UnknownTask(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        if task.status != TaskStatus::Pending || !self.deps_complete(&task).await? {
            return Ok(false);
        }
        self.kv
            .zadd(keys::TASKS_PENDING, task.pending_score(), &id.to_string())
            .await?;
        Ok(true)
    }

    async fn escalate_record(&self, task: &mut Task, reason: &str) -> Result<()> {
        task.status = TaskStatus::Escalated;
        task.escalated_at = Some(now_iso());
        task.escalation_reason = Some(reason.to_string());
        task.updated_at = Utc::now();
        self.store_task(task).await?;
        self.kv
            .zadd(
                keys::TASKS_ESCALATED,
                Utc::now().timestamp() as f64,
                &task.id.to_string(),
            )
            .await?;

        let event = EscalationEvent::from_task(task, reason);
        match serde_json::to_string(&event) {
            Ok(payload) => {
                if let Err(e) = self.kv.publish(keys::CHANNEL_ESCALATIONS, &payload).await {
                    warn!(task_id = %task.id, error = %e, "escalation publish failed");
                }
            }
            Err(e) => warn!(task_id = %task.id, error = %e, "escalation event serialization failed"),
        }
        self.audit
            .emit(
                task.claimed_by.as_deref().unwrap_or(""),
                AuditKind::Escalation,
                &task.id.to_string(),
                reason,
            )
            .await;
        warn!(task_id = %task.id, reason, "task escalated");
        Ok(())
    }
}

pub struct SweeperHandle {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl SweeperHandle {
    pub async fn stop(self) {
        self.token.cancel();
        let _ = self.handle.await;
    }
}
