// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use serde::{Deserialize, Serialize};

/// The decision kinds the core itself emits. Higher layers may append their
/// own kinds through `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    TaskClaim,
    TaskCompleted,
    TaskFailed,
    Escalation,
    ApprovalGranted,
    ApprovalRejected,
    LockConflict,
    HungAgent,
    Deployment,
    Other(String),
}

impl AuditKind {
    pub fn as_str(&self) -> &str {
        match self {
            AuditKind::TaskClaim => "task_claim",
            AuditKind::TaskCompleted => "task_completed",
            AuditKind::TaskFailed => "task_failed",
            AuditKind::Escalation => "escalation",
            AuditKind::ApprovalGranted => "approval_granted",
            AuditKind::ApprovalRejected => "approval_rejected",
            AuditKind::LockConflict => "lock_conflict",
            AuditKind::HungAgent => "hung_agent",
            AuditKind::Deployment => "deployment",
            AuditKind::Other(s) => s,
        }
    }
}

/// One replayed entry from the audit stream. The sequence id is assigned by
/// the KV and totally orders the log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub seq: String,
    pub timestamp: String,
    pub agent_id: String,
    pub kind: String,
    pub context: String,
    pub reason: String,
}
