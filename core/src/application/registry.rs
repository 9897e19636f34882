// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::agent::{Agent, AgentId, AgentStatus};
use crate::domain::error::{CoordError, Result};
use crate::domain::now_iso;
use crate::infrastructure::kv::KvBackend;
use crate::keys;

/// Agent registration and liveness. Records are retained after
/// deregistration (marked `terminated`) so audits can resolve agent ids.
#[derive(Clone)]
pub struct AgentRegistry {
    kv: Arc<dyn KvBackend>,
    heartbeat_interval: Duration,
    hung_threshold: Duration,
}

impl AgentRegistry {
    pub fn new(kv: Arc<dyn KvBackend>, heartbeat_interval: Duration, hung_threshold: Duration) -> Self {
        Self {
            kv,
            heartbeat_interval,
            hung_threshold,
        }
    }

    pub fn hung_threshold(&self) -> Duration {
        self.hung_threshold
    }

    pub async fn register(
        &self,
        role: impl Into<String>,
        name: impl Into<String>,
        working_on: impl Into<String>,
        capabilities: BTreeSet<String>,
    ) -> Result<Agent> {
        let agent = Agent::new(role, name, working_on, capabilities);
        self.save(&agent).await?;
        info!(agent_id = %agent.id, role = %agent.role, name = %agent.name, "registered agent");
        Ok(agent)
    }

    /// Upsert the full record; re-registering the same id is a no-op beyond
    /// refreshing the stored fields.
    pub async fn save(&self, agent: &Agent) -> Result<()> {
        self.kv
            .hset(&keys::agent(agent.id), &agent.to_fields())
            .await?;
        self.kv
            .sadd(keys::AGENTS_INDEX, &agent.id.to_string())
            .await?;
        Ok(())
    }

    pub async fn get_agent(&self, id: AgentId) -> Result<Agent> {
        let fields = self.kv.hgetall(&keys::agent(id)).await?;
        if fields.is_empty() {
            return Err(CoordError::UnknownAgent(id.to_string()));
        }
        Agent::from_fields(&fields)
    }

    pub async fn heartbeat(&self, id: AgentId, working_on: Option<&str>) -> Result<()> {
        // Existence check first so a deregistered agent cannot resurrect
        // itself through a straggling heartbeat loop.
        let stored = self.kv.hget(&keys::agent(id), "id").await?;
        if stored.is_none() {
            return Err(CoordError::UnknownAgent(id.to_string()));
        }
        let mut fields = vec![("last_heartbeat".to_string(), now_iso())];
        if let Some(working_on) = working_on {
            fields.push(("working_on".to_string(), working_on.to_string()));
        }
        self.kv.hset(&keys::agent(id), &fields).await
    }

    /// All known agents with their *computed* status: stale heartbeats read
    /// as hung regardless of what the agent last wrote.
    pub async fn list_agents(&self) -> Result<Vec<Agent>> {
        let now = Utc::now();
        let threshold = chrono::Duration::from_std(self.hung_threshold)
            .unwrap_or_else(|_| chrono::Duration::seconds(300));
        let ids = self.kv.smembers(keys::AGENTS_INDEX).await?;
        let mut agents = Vec::with_capacity(ids.len());
        for raw in ids {
            let id = AgentId::parse(&raw)?;
            let fields = self.kv.hgetall(&keys::agent(id)).await?;
            if fields.is_empty() {
                continue;
            }
            let mut agent = Agent::from_fields(&fields)?;
            agent.status = agent.computed_status(threshold, now);
            agents.push(agent);
        }
        Ok(agents)
    }

    pub async fn detect_hung(&self, threshold: Duration) -> Result<Vec<AgentId>> {
        let now = Utc::now();
        let threshold = chrono::Duration::from_std(threshold)
            .unwrap_or_else(|_| chrono::Duration::seconds(300));
        let mut hung = Vec::new();
        for raw in self.kv.smembers(keys::AGENTS_INDEX).await? {
            let id = AgentId::parse(&raw)?;
            let fields = self.kv.hgetall(&keys::agent(id)).await?;
            if fields.is_empty() {
                continue;
            }
            let agent = Agent::from_fields(&fields)?;
            if agent.is_hung(threshold, now) {
                hung.push(id);
            }
        }
        Ok(hung)
    }

    /// Agents whose heartbeat lapsed, terminated ones included. Reclamation
    /// keys off heartbeat age alone so leases cannot outlive their holder.
    pub async fn stale_agents(&self, threshold: Duration) -> Result<Vec<AgentId>> {
        let now = Utc::now();
        let threshold = chrono::Duration::from_std(threshold)
            .unwrap_or_else(|_| chrono::Duration::seconds(300));
        let mut stale = Vec::new();
        for raw in self.kv.smembers(keys::AGENTS_INDEX).await? {
            let id = AgentId::parse(&raw)?;
            let fields = self.kv.hgetall(&keys::agent(id)).await?;
            if fields.is_empty() {
                continue;
            }
            let agent = Agent::from_fields(&fields)?;
            if agent.status == AgentStatus::Terminated || now - agent.last_heartbeat > threshold {
                stale.push(id);
            }
        }
        Ok(stale)
    }

    pub async fn deregister(&self, id: AgentId) -> Result<()> {
        let stored = self.kv.hget(&keys::agent(id), "id").await?;
        if stored.is_none() {
            return Err(CoordError::UnknownAgent(id.to_string()));
        }
        self.kv
            .hset(
                &keys::agent(id),
                &[("status".to_string(), AgentStatus::Terminated.as_str().to_string())],
            )
            .await?;
        info!(agent_id = %id, "deregistered agent");
        Ok(())
    }

    /// Background heartbeat loop tied to a session. Transient failures are
    /// logged and skipped; the loop never aborts a session on its own.
    pub fn spawn_heartbeat(&self, agent_id: AgentId) -> HeartbeatHandle {
        let registry = self.clone();
        let token = CancellationToken::new();
        let loop_token = token.clone();
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(registry.heartbeat_interval);
            tick.tick().await; // the registration itself was the first beat
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        match registry.heartbeat(agent_id, None).await {
                            Ok(()) => debug!(agent_id = %agent_id, "heartbeat"),
                            Err(CoordError::UnknownAgent(_)) => {
                                warn!(agent_id = %agent_id, "agent record gone, stopping heartbeat");
                                break;
                            }
                            Err(e) => warn!(agent_id = %agent_id, error = %e, "heartbeat failed"),
                        }
                    }
                    _ = loop_token.cancelled() => break,
                }
            }
        });
        HeartbeatHandle { token, handle }
    }
}

pub struct HeartbeatHandle {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl HeartbeatHandle {
    pub async fn stop(self) {
        self.token.cancel();
        let _ = self.handle.await;
    }
}
