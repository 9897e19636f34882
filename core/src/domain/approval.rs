// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::agent::AgentId;
use crate::domain::error::{CoordError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ApprovalId(pub Uuid);

impl ApprovalId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| CoordError::UnknownApproval(s.to_string()))
    }
}

impl Default for ApprovalId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ApprovalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
            ApprovalStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(ApprovalStatus::Pending),
            "approved" => Ok(ApprovalStatus::Approved),
            "rejected" => Ok(ApprovalStatus::Rejected),
            "expired" => Ok(ApprovalStatus::Expired),
            other => Err(CoordError::Serialization(format!(
                "unknown approval status '{}'",
                other
            ))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ApprovalStatus::Pending)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: ApprovalId,
    pub requestor: AgentId,
    pub action_type: String,
    pub description: String,
    pub required_roles: BTreeSet<String>,
    pub required_capabilities: BTreeSet<String>,
    pub min_approvals: u32,
    pub approvals: Vec<AgentId>,
    pub rejections: Vec<AgentId>,
    pub status: ApprovalStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl ApprovalRequest {
    pub fn new(
        requestor: AgentId,
        action_type: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: ApprovalId::new(),
            requestor,
            action_type: action_type.into(),
            description: description.into(),
            required_roles: BTreeSet::new(),
            required_capabilities: BTreeSet::new(),
            min_approvals: 1,
            approvals: Vec::new(),
            rejections: Vec::new(),
            status: ApprovalStatus::Pending,
            created_at: Utc::now(),
            expires_at: None,
        }
    }

    /// Record an approval vote. Terminal requests are frozen: the vote is
    /// dropped and the current status returned. Duplicate votes are ignored.
    pub fn record_approval(&mut self, approver: AgentId) -> ApprovalStatus {
        if self.status.is_terminal() {
            return self.status;
        }
        if !self.approvals.contains(&approver) {
            self.approvals.push(approver);
        }
        self.reevaluate();
        self.status
    }

    /// Record a rejection vote. Any single rejection is decisive.
    pub fn record_rejection(&mut self, approver: AgentId) -> ApprovalStatus {
        if self.status.is_terminal() {
            return self.status;
        }
        if !self.rejections.contains(&approver) {
            self.rejections.push(approver);
        }
        self.reevaluate();
        self.status
    }

    fn reevaluate(&mut self) {
        if !self.rejections.is_empty() {
            self.status = ApprovalStatus::Rejected;
        } else if self.approvals.len() as u32 >= self.min_approvals {
            self.status = ApprovalStatus::Approved;
        }
    }

    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(deadline) if now >= deadline)
    }

    pub fn to_fields(&self) -> Vec<(String, String)> {
        let ids = |v: &Vec<AgentId>| {
            let raw: Vec<String> = v.iter().map(|id| id.to_string()).collect();
            serde_json::to_string(&raw).unwrap_or_else(|_| "[]".into())
        };
        vec![
            ("id".into(), self.id.to_string()),
            ("requestor".into(), self.requestor.to_string()),
            ("action_type".into(), self.action_type.clone()),
            ("description".into(), self.description.clone()),
            (
                "required_roles".into(),
                serde_json::to_string(&self.required_roles).unwrap_or_else(|_| "[]".into()),
            ),
            (
                "required_capabilities".into(),
                serde_json::to_string(&self.required_capabilities)
                    .unwrap_or_else(|_| "[]".into()),
            ),
            ("min_approvals".into(), self.min_approvals.to_string()),
            ("approvals".into(), ids(&self.approvals)),
            ("rejections".into(), ids(&self.rejections)),
            ("status".into(), self.status.as_str().into()),
            ("created_at".into(), self.created_at.to_rfc3339()),
            (
                "expires_at".into(),
                self.expires_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
            ),
        ]
    }

    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self> {
        let get = |k: &str| fields.get(k).cloned().unwrap_or_default();
        let parse_ts = |s: &str| {
            DateTime::parse_from_rfc3339(s)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| CoordError::Serialization(format!("bad timestamp '{}': {}", s, e)))
        };
        let parse_ids = |raw: String| -> Result<Vec<AgentId>> {
            let raw = if raw.is_empty() { "[]".to_string() } else { raw };
            let strs: Vec<String> = serde_json::from_str(&raw)?;
            strs.iter().map(|s| AgentId::parse(s)).collect()
        };
        let parse_set = |raw: String| -> Result<BTreeSet<String>> {
            if raw.is_empty() {
                Ok(BTreeSet::new())
            } else {
                Ok(serde_json::from_str(&raw)?)
            }
        };
        let expires_raw = get("expires_at");
        Ok(Self {
            id: ApprovalId::parse(&get("id"))?,
            requestor: AgentId::parse(&get("requestor"))?,
            action_type: get("action_type"),
            description: get("description"),
            required_roles: parse_set(get("required_roles"))?,
            required_capabilities: parse_set(get("required_capabilities"))?,
            min_approvals: get("min_approvals").parse().unwrap_or(1),
            approvals: parse_ids(get("approvals"))?,
            rejections: parse_ids(get("rejections"))?,
            status: ApprovalStatus::parse(&get("status"))?,
            created_at: parse_ts(&get("created_at"))?,
            expires_at: if expires_raw.is_empty() {
                None
            } else {
                Some(parse_ts(&expires_raw)?)
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_approval_resolves() {
        let mut req = ApprovalRequest::new(AgentId::new(), "deploy", "ship v2");
        let status = req.record_approval(AgentId::new());
        assert_eq!(status, ApprovalStatus::Approved);
    }

    #[test]
    fn test_multi_approver_gate() {
        let mut req = ApprovalRequest::new(AgentId::new(), "deploy", "ship v2");
        req.min_approvals = 2;

        assert_eq!(req.record_approval(AgentId::new()), ApprovalStatus::Pending);
        assert_eq!(req.record_approval(AgentId::new()), ApprovalStatus::Approved);
    }

    #[test]
    fn test_any_rejection_is_decisive() {
        let mut req = ApprovalRequest::new(AgentId::new(), "deploy", "ship v2");
        req.min_approvals = 2;
        req.record_approval(AgentId::new());
        assert_eq!(req.record_rejection(AgentId::new()), ApprovalStatus::Rejected);
        // A later approval cannot flip a rejected request.
        assert_eq!(req.record_approval(AgentId::new()), ApprovalStatus::Rejected);
        assert_eq!(req.approvals.len(), 1);
    }

    #[test]
    fn test_duplicate_votes_ignored() {
        let mut req = ApprovalRequest::new(AgentId::new(), "deploy", "ship v2");
        req.min_approvals = 2;
        let x = AgentId::new();
        req.record_approval(x);
        assert_eq!(req.record_approval(x), ApprovalStatus::Pending);
        assert_eq!(req.approvals.len(), 1);
    }

    #[test]
    fn test_fields_round_trip() {
        let mut req = ApprovalRequest::new(AgentId::new(), "spend", "buy GPU hours");
        req.min_approvals = 3;
        req.required_roles.insert("cto".into());
        req.record_approval(AgentId::new());

        let fields: HashMap<String, String> = req.to_fields().into_iter().collect();
        let restored = ApprovalRequest::from_fields(&fields).unwrap();
        assert_eq!(restored.id, req.id);
        assert_eq!(restored.min_approvals, 3);
        assert_eq!(restored.approvals, req.approvals);
        assert!(restored.required_roles.contains("cto"));
        assert_eq!(restored.status, ApprovalStatus::Pending);
    }
}
