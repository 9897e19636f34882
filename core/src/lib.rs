// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # agentcoord-core
//!
//! Coordination substrate for multi-agent workloads. Many independent
//! processes (coordinators, workers, CLI tools) link this library and share
//! state through a KV backend: a priority task queue with atomic claiming
//! and dependency gating, TTL'd file locks, an agent registry with hung
//! detection, blocking approval requests, a threaded board, an append-only
//! audit stream, and process-level worker spawning with auto-scaling.
//!
//! When the networked KV is unreachable the library degrades transparently
//! to a file-backed single-host implementation with the same semantics.
//!
//! ```no_run
//! use agentcoord_core::{CoordConfig, CoordinationClient, TaskSpec};
//! use std::collections::BTreeSet;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = CoordinationClient::connect(CoordConfig::from_env()).await?;
//! let session = client
//!     .session("engineer", "worker-7", "", BTreeSet::from(["backend".to_string()]))
//!     .await?;
//!
//! if let Some(task) = session
//!     .queue()
//!     .claim_task(session.agent_id(), Some(session.agent().capabilities.clone()).as_ref())
//!     .await?
//! {
//!     let _guard = session.locks().scoped_lock("src/api.rs", "implement endpoint").await?;
//!     // ... do the work ...
//!     session.queue().complete_task(task.id, Some("done".into())).await?;
//! }
//!
//! session.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod keys;

pub use application::approvals::{ApprovalSpec, ApprovalWorkflow};
pub use application::audit::AuditLog;
pub use application::autoscaler::{AutoScaler, AutoScalerConfig, ScalerHandle};
pub use application::board::Board;
pub use application::budget::{BudgetStats, LlmBudget, SlotGuard};
pub use application::channels::{ChannelAdapter, ChannelFeature, ChannelManager};
pub use application::locks::{LockGuard, LockManager};
pub use application::queue::{DependencyNode, SweeperHandle, TaskFilter, TaskQueue};
pub use application::registry::{AgentRegistry, HeartbeatHandle};
pub use application::session::{CoordinationClient, Session};
pub use application::spawner::{SpawnerConfig, WorkerHandle, WorkerSpawner, WorkerStats};
pub use config::CoordConfig;
pub use domain::agent::{Agent, AgentId, AgentStatus};
pub use domain::approval::{ApprovalId, ApprovalRequest, ApprovalStatus};
pub use domain::audit::{AuditEntry, AuditKind};
pub use domain::board::{BoardThread, Message, MessagePriority, MessageType, Post, ThreadId};
pub use domain::error::{CoordError, Result};
pub use domain::events::EscalationEvent;
pub use domain::lock::{FileLock, LockId};
pub use domain::task::{RetryPolicy, Task, TaskId, TaskSpec, TaskStatus};
pub use domain::worker::{SpawnMode, WorkerRuntime, WorkerSpec};
pub use infrastructure::kv::{
    ClaimRequest, FileKv, KvBackend, KvSubscription, LockWrite, RedisKv, StreamEntry,
};
pub use infrastructure::runtime::{DockerRuntime, DockerRuntimeConfig, LocalProcessRuntime};
