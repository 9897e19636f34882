// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::application::audit::AuditLog;
use crate::domain::agent::AgentId;
use crate::domain::approval::{ApprovalId, ApprovalRequest, ApprovalStatus};
use crate::domain::audit::AuditKind;
use crate::domain::error::{CoordError, Result};
use crate::domain::events::ApprovalRequestedEvent;
use crate::domain::now_iso;
use crate::infrastructure::kv::KvBackend;
use crate::keys;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Policy knobs for a new request. The core stores roles/capabilities but is
/// otherwise role-agnostic; enforcement happens through the caller's gate.
#[derive(Debug, Clone)]
pub struct ApprovalSpec {
    pub action_type: String,
    pub description: String,
    pub required_roles: BTreeSet<String>,
    pub required_capabilities: BTreeSet<String>,
    pub min_approvals: u32,
    pub timeout: Option<Duration>,
}

impl ApprovalSpec {
    pub fn new(action_type: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            action_type: action_type.into(),
            description: description.into(),
            required_roles: BTreeSet::new(),
            required_capabilities: BTreeSet::new(),
            min_approvals: 1,
            timeout: None,
        }
    }

    pub fn require_role(mut self, role: impl Into<String>) -> Self {
        self.required_roles.insert(role.into());
        self
    }

    pub fn require_capability(mut self, capability: impl Into<String>) -> Self {
        self.required_capabilities.insert(capability.into());
        self
    }

    pub fn min_approvals(mut self, n: u32) -> Self {
        self.min_approvals = n;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Blocking multi-approver requests with deadline expiry.
#[derive(Clone)]
pub struct ApprovalWorkflow {
    kv: Arc<dyn KvBackend>,
    audit: AuditLog,
}

impl ApprovalWorkflow {
    pub fn new(kv: Arc<dyn KvBackend>, audit: AuditLog) -> Self {
        Self { kv, audit }
    }

    pub async fn create(&self, requestor: AgentId, spec: ApprovalSpec) -> Result<ApprovalRequest> {
        let mut request = ApprovalRequest::new(requestor, spec.action_type, spec.description);
        request.required_roles = spec.required_roles;
        request.required_capabilities = spec.required_capabilities;
        request.min_approvals = spec.min_approvals;
        request.expires_at = spec
            .timeout
            .map(|t| Utc::now() + chrono::Duration::milliseconds(t.as_millis() as i64));

        self.store(&request).await?;
        self.kv
            .sadd(keys::APPROVALS_PENDING, &request.id.to_string())
            .await?;

        let event = ApprovalRequestedEvent {
            event_type: "approval_requested".into(),
            approval_id: request.id.to_string(),
            requestor: requestor.to_string(),
            action_type: request.action_type.clone(),
            description: request.description.clone(),
            timestamp: now_iso(),
        };
        if let Ok(payload) = serde_json::to_string(&event) {
            if let Err(e) = self.kv.publish(keys::CHANNEL_APPROVALS, &payload).await {
                warn!(approval_id = %request.id, error = %e, "approval notification failed");
            }
        }
        info!(approval_id = %request.id, action = %request.action_type, "approval requested");
        Ok(request)
    }

    pub async fn get(&self, id: ApprovalId) -> Result<ApprovalRequest> {
        let fields = self.kv.hgetall(&keys::approval(id)).await?;
        if fields.is_empty() {
            return Err(CoordError::UnknownApproval(id.to_string()));
        }
        ApprovalRequest::from_fields(&fields)
    }

    /// Record an approval vote. Self-approval is allowed here; forbid it in
    /// the gate if the higher layer cares.
    pub async fn approve(&self, id: ApprovalId, approver: AgentId) -> Result<ApprovalStatus> {
        let mut request = self.get(id).await?;
        let before = request.status;
        let status = request.record_approval(approver);
        if before != status || !before.is_terminal() {
            self.store(&request).await?;
        }
        if status == ApprovalStatus::Approved && before == ApprovalStatus::Pending {
            self.kv
                .srem(keys::APPROVALS_PENDING, &id.to_string())
                .await?;
            self.audit
                .emit(
                    &approver.to_string(),
                    AuditKind::ApprovalGranted,
                    &id.to_string(),
                    &request.action_type,
                )
                .await;
        }
        Ok(status)
    }

    /// Approve only if the caller's policy predicate accepts this request
    /// for this approver. The core stays role-agnostic.
    pub async fn approve_gated<F>(
        &self,
        id: ApprovalId,
        approver: AgentId,
        gate: F,
    ) -> Result<ApprovalStatus>
    where
        F: FnOnce(&ApprovalRequest) -> bool,
    {
        let request = self.get(id).await?;
        if !gate(&request) {
            return Err(CoordError::PermissionDenied(format!(
                "agent {} may not approve {} request {}",
                approver, request.action_type, id
            )));
        }
        self.approve(id, approver).await
    }

    pub async fn reject(&self, id: ApprovalId, approver: AgentId) -> Result<ApprovalStatus> {
        let mut request = self.get(id).await?;
        let before = request.status;
        let status = request.record_rejection(approver);
        if before != status || !before.is_terminal() {
            self.store(&request).await?;
        }
        if status == ApprovalStatus::Rejected && before == ApprovalStatus::Pending {
            self.kv
                .srem(keys::APPROVALS_PENDING, &id.to_string())
                .await?;
            self.audit
                .emit(
                    &approver.to_string(),
                    AuditKind::ApprovalRejected,
                    &id.to_string(),
                    &request.action_type,
                )
                .await;
        }
        Ok(status)
    }

    /// Poll until the request goes terminal or the deadline passes. Reaching
    /// the deadline (or the request's own expiry) flips it to `expired`.
    pub async fn wait_for_decision(
        &self,
        id: ApprovalId,
        poll_interval: Option<Duration>,
        timeout: Option<Duration>,
    ) -> Result<ApprovalStatus> {
        let poll = poll_interval.unwrap_or(DEFAULT_POLL_INTERVAL);
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        loop {
            let request = self.get(id).await?;
            if request.status.is_terminal() {
                return Ok(request.status);
            }
            if request.is_past_deadline(Utc::now()) {
                return self.expire(id).await;
            }
            if matches!(deadline, Some(d) if tokio::time::Instant::now() >= d) {
                return self.expire(id).await;
            }
            tokio::time::sleep(poll).await;
        }
    }

    pub async fn list_pending(&self) -> Result<Vec<ApprovalRequest>> {
        let mut pending = Vec::new();
        for raw in self.kv.smembers(keys::APPROVALS_PENDING).await? {
            let id = ApprovalId::parse(&raw)?;
            match self.get(id).await {
                Ok(request) if request.status == ApprovalStatus::Pending => pending.push(request),
                Ok(_) | Err(CoordError::UnknownApproval(_)) => {
                    self.kv.srem(keys::APPROVALS_PENDING, &raw).await?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(pending)
    }

    async fn expire(&self, id: ApprovalId) -> Result<ApprovalStatus> {
        let mut request = self.get(id).await?;
        if request.status.is_terminal() {
            return Ok(request.status);
        }
        request.status = ApprovalStatus::Expired;
        self.store(&request).await?;
        self.kv
            .srem(keys::APPROVALS_PENDING, &id.to_string())
            .await?;
        info!(approval_id = %id, "approval expired");
        Ok(ApprovalStatus::Expired)
    }

    async fn store(&self, request: &ApprovalRequest) -> Result<()> {
        self.kv
            .hset(&keys::approval(request.id), &request.to_fields())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::kv::FileKv;

    fn workflow() -> (tempfile::TempDir, ApprovalWorkflow) {
        let dir = tempfile::tempdir().unwrap();
        let kv: Arc<dyn KvBackend> = Arc::new(FileKv::open(dir.path()).unwrap());
        let audit = AuditLog::new(kv.clone());
        (dir, ApprovalWorkflow::new(kv, audit))
    }

    #[tokio::test]
    async fn test_create_and_list_pending() {
        let (_dir, wf) = workflow();
        let request = wf
            .create(AgentId::new(), ApprovalSpec::new("deploy", "ship v2"))
            .await
            .unwrap();
        let pending = wf.list_pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, request.id);
    }

    #[tokio::test]
    async fn test_approve_removes_from_pending() {
        let (_dir, wf) = workflow();
        let request = wf
            .create(AgentId::new(), ApprovalSpec::new("deploy", "ship v2"))
            .await
            .unwrap();
        let status = wf.approve(request.id, AgentId::new()).await.unwrap();
        assert_eq!(status, ApprovalStatus::Approved);
        assert!(wf.list_pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_gate_denies() {
        let (_dir, wf) = workflow();
        let request = wf
            .create(
                AgentId::new(),
                ApprovalSpec::new("deploy", "ship v2").require_role("cto"),
            )
            .await
            .unwrap();
        let err = wf
            .approve_gated(request.id, AgentId::new(), |req| {
                req.required_roles.is_empty()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CoordError::PermissionDenied(_)));
        // Denied votes leave no trace.
        assert_eq!(wf.get(request.id).await.unwrap().approvals.len(), 0);
    }

    #[tokio::test]
    async fn test_wait_times_out_to_expired() {
        let (_dir, wf) = workflow();
        let request = wf
            .create(AgentId::new(), ApprovalSpec::new("deploy", "ship v2"))
            .await
            .unwrap();
        let status = wf
            .wait_for_decision(
                request.id,
                Some(Duration::from_millis(20)),
                Some(Duration::from_millis(100)),
            )
            .await
            .unwrap();
        assert_eq!(status, ApprovalStatus::Expired);
        assert_eq!(
            wf.get(request.id).await.unwrap().status,
            ApprovalStatus::Expired
        );
        assert!(wf.list_pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_approval() {
        let (_dir, wf) = workflow();
        let err = wf.get(ApprovalId::new()).await.unwrap_err();
        assert!(matches!(err, CoordError::UnknownApproval(_)));
    }
}
