// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! The coordination façade.
//!
//! [`CoordinationClient`] owns the backend handle and vends service handles;
//! [`Session`] layers an agent identity on top: registered on entry, kept
//! alive by a background heartbeat, and cleaned up (heartbeat stopped, held
//! locks released, agent deregistered) on every exit path.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::application::approvals::ApprovalWorkflow;
use crate::application::audit::AuditLog;
use crate::application::board::Board;
use crate::application::budget::LlmBudget;
use crate::application::locks::LockManager;
use crate::application::queue::TaskQueue;
use crate::application::registry::{AgentRegistry, HeartbeatHandle};
use crate::config::CoordConfig;
use crate::domain::agent::{Agent, AgentId};
use crate::domain::audit::AuditKind;
use crate::domain::error::Result;
use crate::domain::lock::LockId;
use crate::infrastructure::kv::{self, KvBackend, KvSubscription};
use crate::keys;

type LockTracker = Arc<Mutex<Vec<(String, LockId)>>>;

/// Entry point: connects to the KV (or its file fallback) and hands out
/// service handles sharing that backend.
#[derive(Clone)]
pub struct CoordinationClient {
    config: CoordConfig,
    kv: Arc<dyn KvBackend>,
    audit: AuditLog,
}

impl CoordinationClient {
    pub async fn connect(config: CoordConfig) -> Result<Self> {
        let kv = kv::connect(&config).await?;
        let audit = AuditLog::new(kv.clone());
        Ok(Self { config, kv, audit })
    }

    /// Which backend this client landed on ("redis" or "file").
    pub fn backend(&self) -> &'static str {
        self.kv.name()
    }

    pub fn config(&self) -> &CoordConfig {
        &self.config
    }

    pub fn kv(&self) -> Arc<dyn KvBackend> {
        self.kv.clone()
    }

    pub fn audit(&self) -> AuditLog {
        self.audit.clone()
    }

    pub fn queue(&self) -> TaskQueue {
        TaskQueue::new(self.kv.clone(), self.audit.clone())
    }

    pub fn registry(&self) -> AgentRegistry {
        AgentRegistry::new(
            self.kv.clone(),
            self.config.heartbeat_interval,
            self.config.hung_threshold,
        )
    }

    pub fn approvals(&self) -> ApprovalWorkflow {
        ApprovalWorkflow::new(self.kv.clone(), self.audit.clone())
    }

    pub fn board(&self) -> Board {
        Board::new(self.kv.clone())
    }

    pub fn budget(&self, max_concurrent: u32) -> LlmBudget {
        LlmBudget::new(self.kv.clone(), max_concurrent)
    }

    /// A lock manager acting as the given agent, outside any session scope.
    pub fn locks_for(&self, agent_id: AgentId) -> LockManager {
        LockManager::new(
            self.kv.clone(),
            self.audit.clone(),
            agent_id,
            self.config.lock_ttl,
        )
    }

    pub async fn subscribe_escalations(&self) -> Result<KvSubscription> {
        self.kv.subscribe(keys::CHANNEL_ESCALATIONS).await
    }

    /// Start the retry/reclamation sweepers on the configured cadence. Any
    /// process holding a queue handle may run one; extras are redundant but
    /// harmless.
    pub fn spawn_sweepers(&self) -> crate::application::queue::SweeperHandle {
        self.queue()
            .spawn_sweepers(self.registry(), self.config.sweep_interval)
    }

    /// Open a scoped session: register the agent and start heartbeating.
    pub async fn session(
        &self,
        role: impl Into<String>,
        name: impl Into<String>,
        working_on: impl Into<String>,
        capabilities: BTreeSet<String>,
    ) -> Result<Session> {
        let registry = self.registry();
        let agent = registry
            .register(role, name, working_on, capabilities)
            .await?;
        let heartbeat = registry.spawn_heartbeat(agent.id);
        info!(agent_id = %agent.id, backend = self.backend(), "session opened");
        Ok(Session {
            client: self.clone(),
            agent,
            heartbeat: Some(heartbeat),
            lock_tracker: Arc::new(Mutex::new(Vec::new())),
            closed: false,
        })
    }
}

/// "Within this scope, I am agent X doing Y."
pub struct Session {
    client: CoordinationClient,
    agent: Agent,
    heartbeat: Option<HeartbeatHandle>,
    lock_tracker: LockTracker,
    closed: bool,
}

impl Session {
    pub fn agent(&self) -> &Agent {
        &self.agent
    }

    pub fn agent_id(&self) -> AgentId {
        self.agent.id
    }

    pub fn client(&self) -> &CoordinationClient {
        &self.client
    }

    pub fn queue(&self) -> TaskQueue {
        self.client.queue()
    }

    pub fn board(&self) -> Board {
        self.client.board()
    }

    pub fn approvals(&self) -> ApprovalWorkflow {
        self.client.approvals()
    }

    pub fn budget(&self, max_concurrent: u32) -> LlmBudget {
        self.client.budget(max_concurrent)
    }

    pub fn audit(&self) -> AuditLog {
        self.client.audit()
    }

    /// Locks taken through this manager are released when the session closes.
    pub fn locks(&self) -> LockManager {
        self.client
            .locks_for(self.agent.id)
            .with_tracker(self.lock_tracker.clone())
    }

    /// Out-of-cadence heartbeat, updating what the agent is working on.
    pub async fn heartbeat_now(&self, working_on: &str) -> Result<()> {
        self.client
            .registry()
            .heartbeat(self.agent.id, Some(working_on))
            .await
    }

    pub async fn log_decision(&self, kind: AuditKind, context: &str, reason: &str) -> Result<()> {
        self.client
            .audit
            .record(&self.agent.id.to_string(), kind, context, reason)
            .await?;
        Ok(())
    }

    /// Orderly teardown: stop the heartbeat, release every lock this session
    /// still holds, deregister the agent.
    pub async fn close(mut self) -> Result<()> {
        self.closed = true;
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.stop().await;
        }
        let locks = self.client.locks_for(self.agent.id);
        let held: Vec<(String, LockId)> = self.lock_tracker.lock().await.drain(..).collect();
        for (path, lock_id) in held {
            if let Err(e) = locks.release_lock(lock_id).await {
                warn!(path = %path, error = %e, "session lock release failed");
            }
        }
        self.client.registry().deregister(self.agent.id).await?;
        info!(agent_id = %self.agent.id, "session closed");
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        // The safety net for sessions dropped without close(): tear down in
        // the background so locks and the registry record don't linger for
        // a full TTL/hung-threshold.
        let client = self.client.clone();
        let agent_id = self.agent.id;
        let tracker = self.lock_tracker.clone();
        let heartbeat = self.heartbeat.take();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Some(heartbeat) = heartbeat {
                    heartbeat.stop().await;
                }
                let locks = client.locks_for(agent_id);
                let held: Vec<(String, LockId)> = tracker.lock().await.drain(..).collect();
                for (_, lock_id) in held {
                    let _ = locks.release_lock(lock_id).await;
                }
                if let Err(e) = client.registry().deregister(agent_id).await {
                    warn!(agent_id = %agent_id, error = %e, "deferred session teardown failed");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::agent::AgentStatus;
    use std::time::Duration;

    async fn client() -> (tempfile::TempDir, CoordinationClient) {
        let dir = tempfile::tempdir().unwrap();
        let config = CoordConfig::default()
            .with_redis_url("redis://127.0.0.1:1") // unreachable, forces fallback
            .with_fallback_dir(dir.path())
            .with_heartbeat_interval(Duration::from_millis(50));
        let client = CoordinationClient::connect(config).await.unwrap();
        (dir, client)
    }

    #[tokio::test]
    async fn test_connect_falls_back_to_files() {
        let (_dir, client) = client().await;
        assert_eq!(client.backend(), "file");
        client.kv().ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let (_dir, client) = client().await;
        let session = client
            .session("engineer", "alice", "api work", BTreeSet::new())
            .await
            .unwrap();
        let agent_id = session.agent_id();

        // Registered and visible.
        let agents = client.registry().list_agents().await.unwrap();
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].status, AgentStatus::Active);

        // A session lock is released by close().
        let guard = session
            .locks()
            .scoped_lock("src/main.rs", "editing")
            .await
            .unwrap();
        // Keep the lock held through close to exercise the sweep.
        std::mem::forget(guard);

        session.close().await.unwrap();

        let registry = client.registry();
        let stored = registry.get_agent(agent_id).await.unwrap();
        assert_eq!(stored.status, AgentStatus::Terminated);

        let locks = client.locks_for(agent_id);
        assert!(locks.list_locks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_session_heartbeats_in_background() {
        let (_dir, client) = client().await;
        let session = client
            .session("engineer", "bob", "", BTreeSet::new())
            .await
            .unwrap();
        let registry = client.registry();
        let before = registry
            .get_agent(session.agent_id())
            .await
            .unwrap()
            .last_heartbeat;
        tokio::time::sleep(Duration::from_millis(200)).await;
        let after = registry
            .get_agent(session.agent_id())
            .await
            .unwrap()
            .last_heartbeat;
        assert!(after > before);
        session.close().await.unwrap();
    }
}
