// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! The KV key schema. Everything the library stores lives under these keys,
//! so that external tools (dashboards, scripts) can read the same state.

use crate::domain::agent::AgentId;
use crate::domain::approval::ApprovalId;
use crate::domain::board::ThreadId;
use crate::domain::lock::LockId;
use crate::domain::task::TaskId;

pub const TASKS_PENDING: &str = "tasks:pending";
pub const TASKS_RETRY: &str = "tasks:retry";
pub const TASKS_ESCALATED: &str = "tasks:escalated";
pub const TASKS_DLQ: &str = "tasks:dlq";
pub const TASKS_INDEX: &str = "tasks:index";
pub const AGENTS_INDEX: &str = "agents:index";
pub const APPROVALS_PENDING: &str = "approvals:pending";
pub const LOCKS_INDEX: &str = "locks:index";
pub const BOARD_THREADS_INDEX: &str = "board:threads";
pub const AUDIT_DECISIONS: &str = "audit:decisions";
pub const LLM_SEMAPHORE: &str = "llm:semaphore";
pub const CHANNEL_ESCALATIONS: &str = "channel:escalations";
pub const CHANNEL_APPROVALS: &str = "channel:approvals";

pub fn task(id: TaskId) -> String {
    format!("task:{}", id)
}

pub fn tasks_by_agent(agent: AgentId) -> String {
    format!("tasks:by_agent:{}", agent)
}

pub fn tasks_dependents(id: TaskId) -> String {
    format!("tasks:dependents:{}", id)
}

pub fn agent(id: AgentId) -> String {
    format!("agent:{}", id)
}

pub fn lock(canonical_path: &str) -> String {
    format!("lock:{}", canonical_path)
}

pub fn lock_by_id(id: LockId) -> String {
    format!("lock:byid:{}", id)
}

pub fn approval(id: ApprovalId) -> String {
    format!("approval:{}", id)
}

pub fn board_thread(id: ThreadId) -> String {
    format!("board:thread:{}", id)
}

pub fn board_channel(channel: &str) -> String {
    format!("channel:board:{}", channel)
}

pub fn llm_tokens(model: &str) -> String {
    format!("llm:costs:tokens:{}", model)
}

pub fn llm_dollars(model: &str) -> String {
    format!("llm:costs:dollars:{}", model)
}

pub fn llm_by_agent(agent: AgentId) -> String {
    format!("llm:costs:by_agent:{}", agent)
}
