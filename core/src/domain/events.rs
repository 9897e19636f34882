// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use serde::{Deserialize, Serialize};

use crate::domain::now_iso;
use crate::domain::task::Task;

/// Wire event published on `channel:escalations` when a task exhausts its
/// retry budget or is escalated manually.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationEvent {
    pub event_type: String,
    pub task_id: String,
    pub task_title: String,
    pub reason: String,
    pub retry_count: u32,
    pub timestamp: String,
    pub claimed_by: String,
}

impl EscalationEvent {
    pub fn from_task(task: &Task, reason: impl Into<String>) -> Self {
        Self {
            event_type: "task_escalated".into(),
            task_id: task.id.to_string(),
            task_title: task.title.clone(),
            reason: reason.into(),
            retry_count: task.retry_count,
            timestamp: now_iso(),
            claimed_by: task.claimed_by.clone().unwrap_or_default(),
        }
    }
}

/// Published on `channel:approvals` when a blocking request is opened, so
/// listening supervisors can react without polling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequestedEvent {
    pub event_type: String,
    pub approval_id: String,
    pub requestor: String,
    pub action_type: String,
    pub description: String,
    pub timestamp: String,
}

/// Published on the board channel topic when a thread is created or replied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardEvent {
    pub event_type: String,
    pub thread_id: String,
    pub channel: String,
    pub title: String,
    pub author: String,
    pub timestamp: String,
}
