// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Multi-approver gates, terminal freezing, and deadline expiry.

use std::collections::BTreeSet;
use std::time::Duration;

use agentcoord_core::{
    AgentId, ApprovalSpec, ApprovalStatus, CoordConfig, CoordinationClient,
};

async fn client(dir: &tempfile::TempDir) -> CoordinationClient {
    let config = CoordConfig::default()
        .with_redis_url("redis://127.0.0.1:1")
        .with_fallback_dir(dir.path());
    CoordinationClient::connect(config).await.unwrap()
}

#[tokio::test]
async fn test_multi_approver_gate() {
    let dir = tempfile::tempdir().unwrap();
    let client = client(&dir).await;
    let approvals = client.approvals();

    let requestor = AgentId::new();
    let x = AgentId::new();
    let y = AgentId::new();
    let z = AgentId::new();

    // First request: one approval is not enough, one rejection is decisive.
    let request = approvals
        .create(
            requestor,
            ApprovalSpec::new("deploy", "ship v2").min_approvals(2),
        )
        .await
        .unwrap();

    assert_eq!(
        approvals.approve(request.id, x).await.unwrap(),
        ApprovalStatus::Pending
    );
    assert_eq!(
        approvals.reject(request.id, y).await.unwrap(),
        ApprovalStatus::Rejected
    );

    // Terminal: a late approval changes nothing, counts are frozen.
    assert_eq!(
        approvals.approve(request.id, z).await.unwrap(),
        ApprovalStatus::Rejected
    );
    let stored = approvals.get(request.id).await.unwrap();
    assert_eq!(stored.approvals.len(), 1);
    assert_eq!(stored.rejections.len(), 1);

    // Fresh request: two approvals resolve it.
    let request = approvals
        .create(
            requestor,
            ApprovalSpec::new("deploy", "ship v2 again").min_approvals(2),
        )
        .await
        .unwrap();
    assert_eq!(
        approvals.approve(request.id, x).await.unwrap(),
        ApprovalStatus::Pending
    );
    assert_eq!(
        approvals.approve(request.id, z).await.unwrap(),
        ApprovalStatus::Approved
    );
}

#[tokio::test]
async fn test_wait_resolves_on_concurrent_approval() {
    let dir = tempfile::tempdir().unwrap();
    let client = client(&dir).await;
    let approvals = client.approvals();

    let request = approvals
        .create(AgentId::new(), ApprovalSpec::new("spend", "gpu hours"))
        .await
        .unwrap();

    let approver_side = {
        let approvals = approvals.clone();
        let id = request.id;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            approvals.approve(id, AgentId::new()).await.unwrap();
        })
    };

    let status = approvals
        .wait_for_decision(
            request.id,
            Some(Duration::from_millis(25)),
            Some(Duration::from_secs(5)),
        )
        .await
        .unwrap();
    assert_eq!(status, ApprovalStatus::Approved);
    approver_side.await.unwrap();
}

#[tokio::test]
async fn test_wait_shorter_than_any_action_expires() {
    let dir = tempfile::tempdir().unwrap();
    let client = client(&dir).await;
    let approvals = client.approvals();

    let request = approvals
        .create(AgentId::new(), ApprovalSpec::new("deploy", "nobody home"))
        .await
        .unwrap();

    let status = approvals
        .wait_for_decision(
            request.id,
            Some(Duration::from_millis(20)),
            Some(Duration::from_millis(120)),
        )
        .await
        .unwrap();
    assert_eq!(status, ApprovalStatus::Expired);

    // The stored record flipped too, and votes no longer count.
    assert_eq!(
        approvals.get(request.id).await.unwrap().status,
        ApprovalStatus::Expired
    );
    assert_eq!(
        approvals.approve(request.id, AgentId::new()).await.unwrap(),
        ApprovalStatus::Expired
    );
}

#[tokio::test]
async fn test_request_deadline_expires_waiters() {
    let dir = tempfile::tempdir().unwrap();
    let client = client(&dir).await;
    let approvals = client.approvals();

    let request = approvals
        .create(
            AgentId::new(),
            ApprovalSpec::new("deploy", "with deadline")
                .timeout(Duration::from_millis(100)),
        )
        .await
        .unwrap();

    // No waiter timeout given; the request's own expiry fires.
    let status = approvals
        .wait_for_decision(request.id, Some(Duration::from_millis(20)), None)
        .await
        .unwrap();
    assert_eq!(status, ApprovalStatus::Expired);
}

#[tokio::test]
async fn test_role_gate_via_registry() {
    let dir = tempfile::tempdir().unwrap();
    let client = client(&dir).await;
    let approvals = client.approvals();
    let registry = client.registry();

    let cto = registry
        .register("cto", "dana", "", BTreeSet::new())
        .await
        .unwrap();
    let intern = registry
        .register("intern", "sam", "", BTreeSet::new())
        .await
        .unwrap();

    let request = approvals
        .create(
            AgentId::new(),
            ApprovalSpec::new("architectural_change", "rewrite storage layer")
                .require_role("cto"),
        )
        .await
        .unwrap();

    // The gate is the caller's predicate over the stored policy.
    fn gate(
        approver: &agentcoord_core::Agent,
    ) -> impl Fn(&agentcoord_core::ApprovalRequest) -> bool + '_ {
        move |req: &agentcoord_core::ApprovalRequest| {
            req.required_roles.is_empty() || req.required_roles.contains(&approver.role)
        }
    }

    let err = approvals
        .approve_gated(request.id, intern.id, gate(&intern))
        .await
        .unwrap_err();
    assert!(matches!(err, agentcoord_core::CoordError::PermissionDenied(_)));

    let status = approvals
        .approve_gated(request.id, cto.id, gate(&cto))
        .await
        .unwrap();
    assert_eq!(status, ApprovalStatus::Approved);
}
