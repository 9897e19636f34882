// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! End-to-end task queue scenarios against the file-backed fallback.

use std::collections::BTreeSet;
use std::time::Duration;

use agentcoord_core::{
    CoordConfig, CoordinationClient, KvBackend, RetryPolicy, TaskFilter, TaskSpec, TaskStatus,
};

async fn client(dir: &tempfile::TempDir) -> CoordinationClient {
    let config = CoordConfig::default()
        .with_redis_url("redis://127.0.0.1:1") // unreachable, forces the fallback
        .with_fallback_dir(dir.path())
        .with_hung_threshold(Duration::from_secs(1));
    CoordinationClient::connect(config).await.unwrap()
}

fn caps(tags: &[&str]) -> BTreeSet<String> {
    tags.iter().map(|t| t.to_string()).collect()
}

#[tokio::test]
async fn test_dependency_chain_claims_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let client = client(&dir).await;
    let queue = client.queue();
    let registry = client.registry();
    let agent = registry
        .register("worker", "solo", "", BTreeSet::new())
        .await
        .unwrap();

    let t1 = queue
        .create_task(TaskSpec::new("t1").priority(5))
        .await
        .unwrap();
    let t2 = queue
        .create_task(TaskSpec::new("t2").priority(5).depends_on(t1.id))
        .await
        .unwrap();
    let t3 = queue
        .create_task(TaskSpec::new("t3").priority(10).depends_on(t2.id))
        .await
        .unwrap();

    // Highest priority does not beat the dependency gate.
    let first = queue.claim_task(agent.id, None).await.unwrap().unwrap();
    assert_eq!(first.id, t1.id);

    // Nothing else is ready while t1 is in flight.
    assert!(queue.claim_task(agent.id, None).await.unwrap().is_none());

    queue.complete_task(t1.id, None).await.unwrap();
    let second = queue.claim_task(agent.id, None).await.unwrap().unwrap();
    assert_eq!(second.id, t2.id);

    queue.complete_task(t2.id, None).await.unwrap();
    let third = queue.claim_task(agent.id, None).await.unwrap().unwrap();
    assert_eq!(third.id, t3.id);

    queue.complete_task(t3.id, Some("done".into())).await.unwrap();
    let stored = queue.get_task(t3.id).await.unwrap();
    assert_eq!(stored.status, TaskStatus::Completed);
    assert_eq!(stored.result.as_deref(), Some("done"));
}

#[tokio::test]
async fn test_tag_routing_never_crosses() {
    let dir = tempfile::tempdir().unwrap();
    let client = client(&dir).await;
    let queue = client.queue();
    let registry = client.registry();

    let backend_agent = registry
        .register("worker", "be", "", caps(&["backend"]))
        .await
        .unwrap();
    let frontend_agent = registry
        .register("worker", "fe", "", caps(&["frontend"]))
        .await
        .unwrap();

    let t_backend = queue
        .create_task(TaskSpec::new("api endpoint").tag("backend"))
        .await
        .unwrap();
    let t_frontend = queue
        .create_task(TaskSpec::new("landing page").tag("frontend"))
        .await
        .unwrap();

    let be_caps = caps(&["backend"]);
    let fe_caps = caps(&["frontend"]);

    let claimed_be = queue
        .claim_task(backend_agent.id, Some(&be_caps))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed_be.id, t_backend.id);

    let claimed_fe = queue
        .claim_task(frontend_agent.id, Some(&fe_caps))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed_fe.id, t_frontend.id);

    // Nothing left that either agent is eligible for.
    assert!(queue
        .claim_task(backend_agent.id, Some(&be_caps))
        .await
        .unwrap()
        .is_none());
    assert!(queue
        .claim_task(frontend_agent.id, Some(&fe_caps))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_retry_schedule_then_escalation() {
    let dir = tempfile::tempdir().unwrap();
    let client = client(&dir).await;
    let queue = client.queue();
    let registry = client.registry();
    let agent = registry
        .register("worker", "flaky", "", BTreeSet::new())
        .await
        .unwrap();

    let mut escalations = client.subscribe_escalations().await.unwrap();

    let original = queue
        .create_task(
            TaskSpec::new("flaky build")
                .retry_policy(RetryPolicy::Exponential)
                .retry_delay_base(1)
                .max_retries(2),
        )
        .await
        .unwrap();

    // First failure schedules retry #1 after ~1s.
    let claimed = queue.claim_task(agent.id, None).await.unwrap().unwrap();
    assert_eq!(claimed.id, original.id);
    queue.fail_task(original.id, "e1").await.unwrap();
    assert_eq!(
        queue.get_task(original.id).await.unwrap().status,
        TaskStatus::Failed
    );
    assert!(queue.claim_task(agent.id, None).await.unwrap().is_none());

    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(queue.sweep_due_retries().await.unwrap(), 1);

    let retry1 = queue.claim_task(agent.id, None).await.unwrap().unwrap();
    assert_eq!(retry1.parent_task_id, Some(original.id));
    assert_eq!(retry1.retry_count, 1);
    queue.fail_task(retry1.id, "e2").await.unwrap();

    // Second retry is delayed 1 * 2^(2-1) = 2s.
    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(queue.sweep_due_retries().await.unwrap(), 0);
    tokio::time::sleep(Duration::from_millis(1000)).await;
    assert_eq!(queue.sweep_due_retries().await.unwrap(), 1);

    let retry2 = queue.claim_task(agent.id, None).await.unwrap().unwrap();
    assert_eq!(retry2.retry_count, 2);

    // Third failure exhausts max_retries=2 and escalates this record.
    queue.fail_task(retry2.id, "e3").await.unwrap();
    let escalated = queue.get_task(retry2.id).await.unwrap();
    assert_eq!(escalated.status, TaskStatus::Escalated);
    assert!(escalated
        .escalation_reason
        .as_deref()
        .unwrap()
        .contains("e3"));

    // Three records in the tree: failed, failed, escalated.
    let all = queue.list_tasks(&TaskFilter::default()).await.unwrap();
    assert_eq!(all.len(), 3);
    assert_eq!(
        all.iter()
            .filter(|t| t.status == TaskStatus::Failed)
            .count(),
        2
    );

    // The escalation event landed on the channel with the final counts.
    let payload = tokio::time::timeout(Duration::from_secs(1), escalations.recv())
        .await
        .unwrap()
        .unwrap();
    let event: serde_json::Value = serde_json::from_str(&payload).unwrap();
    assert_eq!(event["event_type"], "task_escalated");
    assert_eq!(event["retry_count"], 2);
    assert!(event["reason"].as_str().unwrap().contains("e3"));
}

#[tokio::test]
async fn test_reclaim_after_hang_behaves_like_fresh_claim() {
    let dir = tempfile::tempdir().unwrap();
    let client = client(&dir).await;
    let queue = client.queue();
    let registry = client.registry();

    let hung_agent = registry
        .register("worker", "doomed", "", BTreeSet::new())
        .await
        .unwrap();
    let task = queue.create_task(TaskSpec::new("survivor")).await.unwrap();
    let downstream = queue
        .create_task(TaskSpec::new("downstream").depends_on(task.id))
        .await
        .unwrap();

    queue.claim_task(hung_agent.id, None).await.unwrap().unwrap();

    // No heartbeats; after the threshold a sweep reclaims the lease.
    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(queue.sweep_hung_leases(&registry).await.unwrap(), 1);

    let reclaimed = queue.get_task(task.id).await.unwrap();
    assert_eq!(reclaimed.status, TaskStatus::Pending);
    assert!(reclaimed.claimed_by.is_none());
    assert!(queue.leases(hung_agent.id).await.unwrap().is_empty());

    // A healthy agent picks it up and downstream promotion is unaffected.
    let healthy = registry
        .register("worker", "healthy", "", BTreeSet::new())
        .await
        .unwrap();
    let reclaim = queue.claim_task(healthy.id, None).await.unwrap().unwrap();
    assert_eq!(reclaim.id, task.id);
    queue.complete_task(task.id, None).await.unwrap();

    let next = queue.claim_task(healthy.id, None).await.unwrap().unwrap();
    assert_eq!(next.id, downstream.id);
}

#[tokio::test]
async fn test_supervisor_retry_and_archive() {
    let dir = tempfile::tempdir().unwrap();
    let client = client(&dir).await;
    let queue = client.queue();
    let registry = client.registry();
    let agent = registry
        .register("worker", "w", "", BTreeSet::new())
        .await
        .unwrap();

    let task = queue
        .create_task(TaskSpec::new("hopeless").retry_policy(RetryPolicy::None))
        .await
        .unwrap();
    queue.claim_task(agent.id, None).await.unwrap().unwrap();
    queue.fail_task(task.id, "boom").await.unwrap();

    // retry_policy=none escalates on the first failure.
    assert_eq!(
        queue.get_task(task.id).await.unwrap().status,
        TaskStatus::Escalated
    );

    // Supervisor retry re-enqueues a fresh linked record.
    let child = queue.retry_task(task.id).await.unwrap();
    assert_eq!(child.parent_task_id, Some(task.id));
    assert_eq!(child.retry_count, 0);
    let claimed = queue.claim_task(agent.id, None).await.unwrap().unwrap();
    assert_eq!(claimed.id, child.id);
    queue.fail_task(child.id, "boom again").await.unwrap();

    // Archive moves the escalated child to the dead-letter surface.
    queue.archive_task(child.id).await.unwrap();
    let dlq_score = client
        .kv()
        .zscore("tasks:dlq", &child.id.to_string())
        .await
        .unwrap();
    assert!(dlq_score.is_some());

    // Archiving is only legal from escalated status.
    let fresh = queue.create_task(TaskSpec::new("alive")).await.unwrap();
    assert!(queue.archive_task(fresh.id).await.is_err());
}
