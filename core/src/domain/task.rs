// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::error::{CoordError, Result};
use crate::domain::{epoch_ms, now_iso};

/// Exponential retry delays are capped at one hour.
pub const MAX_RETRY_DELAY_SECS: u64 = 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| CoordError::UnknownTask(s.to_string()))
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Claimed,
    InProgress,
    Completed,
    Failed,
    Escalated,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Claimed => "claimed",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Escalated => "escalated",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "claimed" => Ok(TaskStatus::Claimed),
            "in_progress" => Ok(TaskStatus::InProgress),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "escalated" => Ok(TaskStatus::Escalated),
            other => Err(CoordError::Serialization(format!(
                "unknown task status '{}'",
                other
            ))),
        }
    }

    /// A task in either of these states is leased to exactly one agent.
    pub fn is_leased(&self) -> bool {
        matches!(self, TaskStatus::Claimed | TaskStatus::InProgress)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Escalated
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPolicy {
    None,
    Linear,
    Exponential,
}

impl RetryPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryPolicy::None => "none",
            RetryPolicy::Linear => "linear",
            RetryPolicy::Exponential => "exponential",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(RetryPolicy::None),
            "linear" => Ok(RetryPolicy::Linear),
            "exponential" => Ok(RetryPolicy::Exponential),
            other => Err(CoordError::Serialization(format!(
                "unknown retry policy '{}'",
                other
            ))),
        }
    }

    /// Delay before the k-th retry (k >= 1), in seconds.
    pub fn delay_secs(&self, base: u64, attempt: u32) -> u64 {
        match self {
            RetryPolicy::None => 0,
            RetryPolicy::Linear => base,
            RetryPolicy::Exponential => {
                let shift = attempt.saturating_sub(1).min(63);
                base.saturating_mul(1u64 << shift).min(MAX_RETRY_DELAY_SECS)
            }
        }
    }
}

/// One entry in a task's escalation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationRecord {
    pub ts: String,
    pub retry_count: u32,
    pub reason: String,
    pub action: String,
}

/// Parameters for creating a task. Everything but the title has a default.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub title: String,
    pub description: String,
    pub priority: i64,
    pub tags: BTreeSet<String>,
    pub depends_on: BTreeSet<TaskId>,
    pub retry_policy: RetryPolicy,
    pub max_retries: u32,
    pub retry_delay_base: u64,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl TaskSpec {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: String::new(),
            priority: 0,
            tags: BTreeSet::new(),
            depends_on: BTreeSet::new(),
            retry_policy: RetryPolicy::Exponential,
            max_retries: 3,
            retry_delay_base: 60,
            metadata: serde_json::Map::new(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn tags(mut self, tags: impl IntoIterator<Item = String>) -> Self {
        self.tags.extend(tags);
        self
    }

    pub fn depends_on(mut self, dep: TaskId) -> Self {
        self.depends_on.insert(dep);
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    pub fn retry_delay_base(mut self, secs: u64) -> Self {
        self.retry_delay_base = secs;
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    pub description: String,
    pub priority: i64,
    pub tags: BTreeSet<String>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<String>,
    pub completed_at: Option<String>,
    pub depends_on: BTreeSet<TaskId>,
    pub result: Option<String>,
    pub error: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub retry_policy: RetryPolicy,
    pub retry_delay_base: u64,
    pub escalated_at: Option<String>,
    pub escalation_reason: Option<String>,
    pub escalation_history: Vec<EscalationRecord>,
    pub parent_task_id: Option<TaskId>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Task {
    pub fn new(spec: TaskSpec) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            title: spec.title,
            description: spec.description,
            priority: spec.priority,
            tags: spec.tags,
            status: TaskStatus::Pending,
            created_at: now,
            updated_at: now,
            claimed_by: None,
            claimed_at: None,
            completed_at: None,
            depends_on: spec.depends_on,
            result: None,
            error: None,
            retry_count: 0,
            max_retries: spec.max_retries,
            retry_policy: spec.retry_policy,
            retry_delay_base: spec.retry_delay_base,
            escalated_at: None,
            escalation_reason: None,
            escalation_history: Vec::new(),
            parent_task_id: None,
            metadata: spec.metadata,
        }
    }

    /// Build the retry child of a failed task: same work, fresh identity,
    /// incremented retry counter, linked back through `parent_task_id`.
    pub fn retry_child(&self, retry_count: u32) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            title: self.title.clone(),
            description: self.description.clone(),
            priority: self.priority,
            tags: self.tags.clone(),
            status: TaskStatus::Pending,
            created_at: now,
            updated_at: now,
            claimed_by: None,
            claimed_at: None,
            completed_at: None,
            depends_on: self.depends_on.clone(),
            result: None,
            error: None,
            retry_count,
            max_retries: self.max_retries,
            retry_policy: self.retry_policy,
            retry_delay_base: self.retry_delay_base,
            escalated_at: None,
            escalation_reason: None,
            escalation_history: self.escalation_history.clone(),
            parent_task_id: Some(self.id),
            metadata: self.metadata.clone(),
        }
    }

    /// Sort key for the pending queue: priority dominates, then FIFO by
    /// creation time (older first when scanned from the high end).
    pub fn pending_score(&self) -> f64 {
        pending_score(self.priority, self.created_at)
    }

    /// Capability matching: `None` matches anything; `Some(caps)` must cover
    /// every tag the task requires. Untagged tasks match every agent.
    pub fn matches_capabilities(&self, caps: Option<&BTreeSet<String>>) -> bool {
        match caps {
            None => true,
            Some(caps) => self.tags.is_subset(caps),
        }
    }

    pub fn ensure_status(&self, allowed: &[TaskStatus], op: &str) -> Result<()> {
        if allowed.contains(&self.status) {
            return Ok(());
        }
        Err(CoordError::IllegalStateTransition(format!(
            "cannot {} task {} in status {}",
            op,
            self.id,
            self.status.as_str()
        )))
    }

    pub fn push_history(&mut self, reason: &str, action: &str) {
        self.escalation_history.push(EscalationRecord {
            ts: now_iso(),
            retry_count: self.retry_count,
            reason: reason.to_string(),
            action: action.to_string(),
        });
    }

    /// Flatten to the KV hash representation. List-valued fields are JSON
    /// strings, absent optionals are empty strings.
    pub fn to_fields(&self) -> Vec<(String, String)> {
        let opt = |v: &Option<String>| v.clone().unwrap_or_default();
        vec![
            ("id".into(), self.id.to_string()),
            ("title".into(), self.title.clone()),
            ("description".into(), self.description.clone()),
            ("priority".into(), self.priority.to_string()),
            ("tags".into(), json_string_set(&self.tags)),
            ("status".into(), self.status.as_str().into()),
            ("created_at".into(), self.created_at.to_rfc3339()),
            ("updated_at".into(), self.updated_at.to_rfc3339()),
            ("claimed_by".into(), opt(&self.claimed_by)),
            ("claimed_at".into(), opt(&self.claimed_at)),
            ("completed_at".into(), opt(&self.completed_at)),
            ("depends_on".into(), json_id_set(&self.depends_on)),
            ("result".into(), opt(&self.result)),
            ("error".into(), opt(&self.error)),
            ("retry_count".into(), self.retry_count.to_string()),
            ("max_retries".into(), self.max_retries.to_string()),
            ("retry_policy".into(), self.retry_policy.as_str().into()),
            ("retry_delay_base".into(), self.retry_delay_base.to_string()),
            ("escalated_at".into(), opt(&self.escalated_at)),
            ("escalation_reason".into(), opt(&self.escalation_reason)),
            (
                "escalation_history".into(),
                serde_json::to_string(&self.escalation_history).unwrap_or_else(|_| "[]".into()),
            ),
            (
                "parent_task_id".into(),
                self.parent_task_id.map(|id| id.to_string()).unwrap_or_default(),
            ),
            (
                "metadata".into(),
                serde_json::to_string(&self.metadata).unwrap_or_else(|_| "{}".into()),
            ),
        ]
    }

    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self> {
        let get = |k: &str| fields.get(k).cloned().unwrap_or_default();
        let opt = |k: &str| {
            let v = get(k);
            if v.is_empty() {
                None
            } else {
                Some(v)
            }
        };

        let id = TaskId::parse(&get("id"))?;
        let created_at = parse_ts(&get("created_at"))?;
        let updated_at = parse_ts(&get("updated_at"))?;

        let tags: BTreeSet<String> = serde_json::from_str(&nonempty(get("tags"), "[]"))?;
        let depends_raw: Vec<String> = serde_json::from_str(&nonempty(get("depends_on"), "[]"))?;
        let mut depends_on = BTreeSet::new();
        for raw in depends_raw {
            depends_on.insert(TaskId::parse(&raw)?);
        }
        let escalation_history: Vec<EscalationRecord> =
            serde_json::from_str(&nonempty(get("escalation_history"), "[]"))?;
        let metadata: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(&nonempty(get("metadata"), "{}"))?;

        Ok(Self {
            id,
            title: get("title"),
            description: get("description"),
            priority: get("priority").parse().unwrap_or(0),
            tags,
            status: TaskStatus::parse(&get("status"))?,
            created_at,
            updated_at,
            claimed_by: opt("claimed_by"),
            claimed_at: opt("claimed_at"),
            completed_at: opt("completed_at"),
            depends_on,
            result: opt("result"),
            error: opt("error"),
            retry_count: get("retry_count").parse().unwrap_or(0),
            max_retries: get("max_retries").parse().unwrap_or(3),
            retry_policy: RetryPolicy::parse(&nonempty(get("retry_policy"), "exponential"))?,
            retry_delay_base: get("retry_delay_base").parse().unwrap_or(60),
            escalated_at: opt("escalated_at"),
            escalation_reason: opt("escalation_reason"),
            escalation_history,
            parent_task_id: match opt("parent_task_id") {
                Some(raw) => Some(TaskId::parse(&raw)?),
                None => None,
            },
            metadata,
        })
    }
}

/// `priority * 1e9 + (2^53 - created_epoch_ms)`: higher priority always wins,
/// and within a priority older tasks score higher (FIFO when scanning from
/// the top of the sorted set).
pub fn pending_score(priority: i64, created_at: DateTime<Utc>) -> f64 {
    const EPOCH_CEILING: f64 = 9_007_199_254_740_992.0; // 2^53
    priority as f64 * 1e9 + (EPOCH_CEILING - epoch_ms(created_at) as f64)
}

fn nonempty(v: String, default: &str) -> String {
    if v.is_empty() {
        default.to_string()
    } else {
        v
    }
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| CoordError::Serialization(format!("bad timestamp '{}': {}", s, e)))
}

fn json_string_set(set: &BTreeSet<String>) -> String {
    serde_json::to_string(set).unwrap_or_else(|_| "[]".into())
}

fn json_id_set(set: &BTreeSet<TaskId>) -> String {
    let raw: Vec<String> = set.iter().map(|id| id.to_string()).collect();
    serde_json::to_string(&raw).unwrap_or_else(|_| "[]".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_status_round_trip() {
        for s in [
            TaskStatus::Pending,
            TaskStatus::Claimed,
            TaskStatus::InProgress,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Escalated,
        ] {
            assert_eq!(TaskStatus::parse(s.as_str()).unwrap(), s);
        }
        assert!(TaskStatus::parse("bogus").is_err());
    }

    #[test]
    fn test_priority_dominates_score() {
        let earlier = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let later = Utc.with_ymd_and_hms(2026, 1, 2, 0, 0, 0).unwrap();
        // Higher priority beats an older low-priority task.
        assert!(pending_score(5, later) > pending_score(4, earlier));
        // Same priority: older task scores higher.
        assert!(pending_score(3, earlier) > pending_score(3, later));
    }

    #[test]
    fn test_exponential_retry_schedule() {
        let p = RetryPolicy::Exponential;
        assert_eq!(p.delay_secs(60, 1), 60);
        assert_eq!(p.delay_secs(60, 2), 120);
        assert_eq!(p.delay_secs(60, 3), 240);
        assert_eq!(p.delay_secs(60, 7), 3600); // capped
        assert_eq!(p.delay_secs(60, 40), 3600); // no overflow
    }

    #[test]
    fn test_linear_retry_schedule() {
        let p = RetryPolicy::Linear;
        assert_eq!(p.delay_secs(60, 1), 60);
        assert_eq!(p.delay_secs(60, 5), 60);
    }

    #[test]
    fn test_capability_matching() {
        let mut task = Task::new(TaskSpec::new("tagged").tag("backend"));
        let backend: BTreeSet<String> = ["backend".to_string(), "rust".to_string()].into();
        let frontend: BTreeSet<String> = ["frontend".to_string()].into();
        let empty: BTreeSet<String> = BTreeSet::new();

        assert!(task.matches_capabilities(None));
        assert!(task.matches_capabilities(Some(&backend)));
        assert!(!task.matches_capabilities(Some(&frontend)));
        assert!(!task.matches_capabilities(Some(&empty)));

        task.tags.clear();
        assert!(task.matches_capabilities(Some(&empty)));
        assert!(task.matches_capabilities(Some(&frontend)));
    }

    #[test]
    fn test_ensure_status() {
        let task = Task::new(TaskSpec::new("t"));
        assert!(task.ensure_status(&[TaskStatus::Pending], "claim").is_ok());
        let err = task
            .ensure_status(&[TaskStatus::Claimed, TaskStatus::InProgress], "complete")
            .unwrap_err();
        assert!(matches!(err, CoordError::IllegalStateTransition(_)));
    }

    #[test]
    fn test_fields_round_trip() {
        let dep = TaskId::new();
        let mut task = Task::new(
            TaskSpec::new("build api")
                .description("implement the endpoint")
                .priority(7)
                .tag("backend")
                .depends_on(dep)
                .max_retries(5)
                .metadata("epic", serde_json::json!("billing")),
        );
        task.push_history("worker died", "scheduled_retry");

        let fields: HashMap<String, String> = task.to_fields().into_iter().collect();
        let restored = Task::from_fields(&fields).unwrap();

        assert_eq!(restored.id, task.id);
        assert_eq!(restored.title, "build api");
        assert_eq!(restored.priority, 7);
        assert_eq!(restored.status, TaskStatus::Pending);
        assert!(restored.tags.contains("backend"));
        assert!(restored.depends_on.contains(&dep));
        assert_eq!(restored.max_retries, 5);
        assert_eq!(restored.escalation_history.len(), 1);
        assert_eq!(restored.metadata["epic"], serde_json::json!("billing"));
    }

    #[test]
    fn test_retry_child_links_parent() {
        let parent = Task::new(TaskSpec::new("flaky").tag("ci"));
        let child = parent.retry_child(2);
        assert_ne!(child.id, parent.id);
        assert_eq!(child.parent_task_id, Some(parent.id));
        assert_eq!(child.retry_count, 2);
        assert_eq!(child.status, TaskStatus::Pending);
        assert_eq!(child.tags, parent.tags);
    }
}
