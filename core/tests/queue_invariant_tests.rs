// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Queue invariants: single-winner claims, strict ordering, lifecycle
//! legality. All against the file-backed fallback.

use std::collections::{BTreeSet, HashSet};
use std::time::Duration;

use agentcoord_core::{
    CoordConfig, CoordinationClient, CoordError, TaskId, TaskSpec, TaskStatus,
};

async fn client(dir: &tempfile::TempDir) -> CoordinationClient {
    let config = CoordConfig::default()
        .with_redis_url("redis://127.0.0.1:1")
        .with_fallback_dir(dir.path());
    CoordinationClient::connect(config).await.unwrap()
}

#[tokio::test]
async fn test_no_double_claim_under_contention() {
    let dir = tempfile::tempdir().unwrap();
    let client = client(&dir).await;
    let queue = client.queue();
    let registry = client.registry();

    const TASKS: usize = 12;
    const CLAIMANTS: usize = 4;

    for i in 0..TASKS {
        queue
            .create_task(TaskSpec::new(format!("job {}", i)))
            .await
            .unwrap();
    }

    let mut handles = Vec::new();
    for i in 0..CLAIMANTS {
        let queue = queue.clone();
        let agent = registry
            .register("worker", format!("claimant-{}", i), "", BTreeSet::new())
            .await
            .unwrap();
        handles.push(tokio::spawn(async move {
            let mut won = Vec::new();
            while let Some(task) = queue.claim_task(agent.id, None).await.unwrap() {
                won.push(task.id);
            }
            (agent.id, won)
        }));
    }

    let mut all_claims: Vec<TaskId> = Vec::new();
    let mut per_agent = Vec::new();
    for handle in handles {
        let (agent_id, won) = handle.await.unwrap();
        all_claims.extend(won.iter().copied());
        per_agent.push((agent_id, won));
    }

    // Every task claimed exactly once across all competitors.
    let unique: HashSet<TaskId> = all_claims.iter().copied().collect();
    assert_eq!(all_claims.len(), TASKS);
    assert_eq!(unique.len(), TASKS);

    // Lease bookkeeping matches the claims.
    for (agent_id, won) in per_agent {
        let leases: HashSet<TaskId> = queue.leases(agent_id).await.unwrap().into_iter().collect();
        let expected: HashSet<TaskId> = won.into_iter().collect();
        assert_eq!(leases, expected);
    }
}

#[tokio::test]
async fn test_priority_then_fifo_ordering() {
    let dir = tempfile::tempdir().unwrap();
    let client = client(&dir).await;
    let queue = client.queue();
    let registry = client.registry();
    let agent = registry
        .register("worker", "orderly", "", BTreeSet::new())
        .await
        .unwrap();

    let low_old = queue
        .create_task(TaskSpec::new("low old").priority(1))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let mid_a = queue
        .create_task(TaskSpec::new("mid a").priority(5))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let mid_b = queue
        .create_task(TaskSpec::new("mid b").priority(5))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let high_new = queue
        .create_task(TaskSpec::new("high new").priority(9))
        .await
        .unwrap();

    let mut order = Vec::new();
    while let Some(task) = queue.claim_task(agent.id, None).await.unwrap() {
        order.push(task.id);
        queue.complete_task(task.id, None).await.unwrap();
    }

    // Highest priority first regardless of age; FIFO within a priority.
    assert_eq!(order, vec![high_new.id, mid_a.id, mid_b.id, low_old.id]);
}

#[tokio::test]
async fn test_dependency_gate_beats_priority() {
    let dir = tempfile::tempdir().unwrap();
    let client = client(&dir).await;
    let queue = client.queue();
    let registry = client.registry();
    let agent = registry
        .register("worker", "gated", "", BTreeSet::new())
        .await
        .unwrap();

    let base = queue
        .create_task(TaskSpec::new("base").priority(0))
        .await
        .unwrap();
    let blocked = queue
        .create_task(TaskSpec::new("blocked").priority(100).depends_on(base.id))
        .await
        .unwrap();

    // The gated task is never returned, no matter its priority.
    let claimed = queue.claim_task(agent.id, None).await.unwrap().unwrap();
    assert_eq!(claimed.id, base.id);

    let ready = queue.get_ready_tasks(None).await.unwrap();
    assert!(ready.iter().all(|t| t.id != blocked.id));
}

#[tokio::test]
async fn test_lifecycle_legality() {
    let dir = tempfile::tempdir().unwrap();
    let client = client(&dir).await;
    let queue = client.queue();
    let registry = client.registry();
    let agent = registry
        .register("worker", "lifecycle", "", BTreeSet::new())
        .await
        .unwrap();
    let other = registry
        .register("worker", "other", "", BTreeSet::new())
        .await
        .unwrap();

    let task = queue.create_task(TaskSpec::new("strict")).await.unwrap();

    // Completing an unclaimed task is illegal.
    let err = queue.complete_task(task.id, None).await.unwrap_err();
    assert!(matches!(err, CoordError::IllegalStateTransition(_)));

    queue.claim_task(agent.id, None).await.unwrap().unwrap();

    // Only the lease holder can advance claimed -> in_progress.
    let err = queue.start_task(task.id, other.id).await.unwrap_err();
    assert!(matches!(err, CoordError::IllegalStateTransition(_)));

    let started = queue.start_task(task.id, agent.id).await.unwrap();
    assert_eq!(started.status, TaskStatus::InProgress);

    // Starting twice is illegal; completing from in_progress is fine.
    assert!(queue.start_task(task.id, agent.id).await.is_err());
    queue.complete_task(task.id, None).await.unwrap();

    // Terminal records reject further lifecycle calls.
    assert!(queue.fail_task(task.id, "late").await.is_err());
    assert!(queue.complete_task(task.id, None).await.is_err());
}

#[tokio::test]
async fn test_completion_promotes_all_ready_dependents() {
    let dir = tempfile::tempdir().unwrap();
    let client = client(&dir).await;
    let queue = client.queue();
    let registry = client.registry();
    let agent = registry
        .register("worker", "fanout", "", BTreeSet::new())
        .await
        .unwrap();

    let root = queue.create_task(TaskSpec::new("root")).await.unwrap();
    let mut dependents = Vec::new();
    for i in 0..3 {
        dependents.push(
            queue
                .create_task(TaskSpec::new(format!("child {}", i)).depends_on(root.id))
                .await
                .unwrap(),
        );
    }

    queue.claim_task(agent.id, None).await.unwrap();
    queue.complete_task(root.id, None).await.unwrap();

    // Atomically observed: all three are claimable right after completion.
    let ready = queue.get_ready_tasks(None).await.unwrap();
    let ready_ids: HashSet<TaskId> = ready.iter().map(|t| t.id).collect();
    for dependent in &dependents {
        assert!(ready_ids.contains(&dependent.id));
    }
}

#[tokio::test]
async fn test_blocking_claim_times_out_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let client = client(&dir).await;
    let queue = client.queue();
    let registry = client.registry();
    let agent = registry
        .register("worker", "patient", "", BTreeSet::new())
        .await
        .unwrap();

    let err = queue
        .claim_task_blocking(agent.id, None, Duration::from_millis(300))
        .await
        .unwrap_err();
    assert!(matches!(err, CoordError::Timeout(_)));
    // A timed-out claim reserves nothing.
    assert!(queue.leases(agent.id).await.unwrap().is_empty());

    // With work available it resolves promptly.
    let task = queue.create_task(TaskSpec::new("arrives")).await.unwrap();
    let claimed = queue
        .claim_task_blocking(agent.id, None, Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(claimed.id, task.id);
}
