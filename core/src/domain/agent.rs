// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::error::{CoordError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentId(pub Uuid);

impl AgentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| CoordError::UnknownAgent(s.to_string()))
    }
}

impl Default for AgentId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Active,
    Idle,
    Hung,
    Terminated,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Active => "active",
            AgentStatus::Idle => "idle",
            AgentStatus::Hung => "hung",
            AgentStatus::Terminated => "terminated",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(AgentStatus::Active),
            "idle" => Ok(AgentStatus::Idle),
            "hung" => Ok(AgentStatus::Hung),
            "terminated" => Ok(AgentStatus::Terminated),
            other => Err(CoordError::Serialization(format!(
                "unknown agent status '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub name: String,
    pub role: String,
    pub working_on: String,
    pub capabilities: BTreeSet<String>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub status: AgentStatus,
}

impl Agent {
    pub fn new(
        role: impl Into<String>,
        name: impl Into<String>,
        working_on: impl Into<String>,
        capabilities: BTreeSet<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: AgentId::new(),
            name: name.into(),
            role: role.into(),
            working_on: working_on.into(),
            capabilities,
            registered_at: now,
            last_heartbeat: now,
            status: AgentStatus::Active,
        }
    }

    /// Status as observed by readers: a stale heartbeat overrides whatever
    /// the agent last wrote about itself, except for terminated agents.
    pub fn computed_status(&self, hung_after: Duration, now: DateTime<Utc>) -> AgentStatus {
        if self.status == AgentStatus::Terminated {
            return AgentStatus::Terminated;
        }
        if now - self.last_heartbeat > hung_after {
            AgentStatus::Hung
        } else {
            self.status
        }
    }

    pub fn is_hung(&self, hung_after: Duration, now: DateTime<Utc>) -> bool {
        self.computed_status(hung_after, now) == AgentStatus::Hung
    }

    pub fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            ("id".into(), self.id.to_string()),
            ("name".into(), self.name.clone()),
            ("role".into(), self.role.clone()),
            ("working_on".into(), self.working_on.clone()),
            (
                "capabilities".into(),
                serde_json::to_string(&self.capabilities).unwrap_or_else(|_| "[]".into()),
            ),
            ("registered_at".into(), self.registered_at.to_rfc3339()),
            ("last_heartbeat".into(), self.last_heartbeat.to_rfc3339()),
            ("status".into(), self.status.as_str().into()),
        ]
    }

    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self> {
        let get = |k: &str| fields.get(k).cloned().unwrap_or_default();
        let parse_ts = |s: &str| {
            DateTime::parse_from_rfc3339(s)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| CoordError::Serialization(format!("bad timestamp '{}': {}", s, e)))
        };
        let caps_raw = get("capabilities");
        let capabilities: BTreeSet<String> = if caps_raw.is_empty() {
            BTreeSet::new()
        } else {
            serde_json::from_str(&caps_raw)?
        };
        Ok(Self {
            id: AgentId::parse(&get("id"))?,
            name: get("name"),
            role: get("role"),
            working_on: get("working_on"),
            capabilities,
            registered_at: parse_ts(&get("registered_at"))?,
            last_heartbeat: parse_ts(&get("last_heartbeat"))?,
            status: AgentStatus::parse(&get("status"))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_agent_is_active() {
        let agent = Agent::new("engineer", "alice", "api work", BTreeSet::new());
        let status = agent.computed_status(Duration::seconds(300), Utc::now());
        assert_eq!(status, AgentStatus::Active);
    }

    #[test]
    fn test_stale_heartbeat_reads_as_hung() {
        let mut agent = Agent::new("engineer", "bob", "", BTreeSet::new());
        agent.last_heartbeat = Utc::now() - Duration::seconds(400);
        assert_eq!(
            agent.computed_status(Duration::seconds(300), Utc::now()),
            AgentStatus::Hung
        );
        // Stored status does not mask staleness.
        agent.status = AgentStatus::Active;
        assert!(agent.is_hung(Duration::seconds(300), Utc::now()));
    }

    #[test]
    fn test_terminated_never_reported_hung() {
        let mut agent = Agent::new("engineer", "carol", "", BTreeSet::new());
        agent.status = AgentStatus::Terminated;
        agent.last_heartbeat = Utc::now() - Duration::seconds(4000);
        assert_eq!(
            agent.computed_status(Duration::seconds(300), Utc::now()),
            AgentStatus::Terminated
        );
    }

    #[test]
    fn test_fields_round_trip() {
        let caps: BTreeSet<String> = ["backend".to_string()].into();
        let agent = Agent::new("cto", "dana", "review", caps);
        let fields: HashMap<String, String> = agent.to_fields().into_iter().collect();
        let restored = Agent::from_fields(&fields).unwrap();
        assert_eq!(restored.id, agent.id);
        assert_eq!(restored.role, "cto");
        assert!(restored.capabilities.contains("backend"));
        assert_eq!(restored.status, AgentStatus::Active);
    }
}
