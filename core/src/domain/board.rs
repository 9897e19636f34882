// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::agent::AgentId;
use crate::domain::error::{CoordError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ThreadId(pub Uuid);

impl ThreadId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| CoordError::UnknownThread(s.to_string()))
    }
}

impl Default for ThreadId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessagePriority {
    Low,
    Normal,
    High,
    Urgent,
}

impl Default for MessagePriority {
    fn default() -> Self {
        MessagePriority::Normal
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Status,
    Error,
    Success,
    Question,
    Announcement,
}

/// One post inside a board thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    pub author: AgentId,
    pub timestamp: DateTime<Utc>,
    pub body: String,
    #[serde(default)]
    pub priority: MessagePriority,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardThread {
    pub id: ThreadId,
    pub channel: String,
    pub title: String,
    pub created_by: AgentId,
    pub created_at: DateTime<Utc>,
    pub posts: Vec<Post>,
    pub pinned: bool,
}

impl BoardThread {
    pub fn new(
        channel: impl Into<String>,
        title: impl Into<String>,
        created_by: AgentId,
    ) -> Self {
        Self {
            id: ThreadId::new(),
            channel: channel.into(),
            title: title.into(),
            created_by,
            created_at: Utc::now(),
            posts: Vec::new(),
            pinned: false,
        }
    }

    pub fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            ("id".into(), self.id.to_string()),
            ("channel".into(), self.channel.clone()),
            ("title".into(), self.title.clone()),
            ("created_by".into(), self.created_by.to_string()),
            ("created_at".into(), self.created_at.to_rfc3339()),
            (
                "posts".into(),
                serde_json::to_string(&self.posts).unwrap_or_else(|_| "[]".into()),
            ),
            ("pinned".into(), if self.pinned { "1" } else { "0" }.into()),
        ]
    }

    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self> {
        let get = |k: &str| fields.get(k).cloned().unwrap_or_default();
        let posts_raw = get("posts");
        let posts: Vec<Post> = if posts_raw.is_empty() {
            Vec::new()
        } else {
            serde_json::from_str(&posts_raw)?
        };
        Ok(Self {
            id: ThreadId::parse(&get("id"))?,
            channel: get("channel"),
            title: get("title"),
            created_by: AgentId::parse(&get("created_by"))?,
            created_at: DateTime::parse_from_rfc3339(&get("created_at"))
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| CoordError::Serialization(e.to_string()))?,
            posts,
            pinned: get("pinned") == "1",
        })
    }
}

/// The structured record channel adapters consume. Core code only builds and
/// routes these; rendering is the adapter's problem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub content: String,
    pub from_agent: AgentId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_agent: Option<AgentId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    pub priority: MessagePriority,
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<ThreadId>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl Message {
    pub fn announcement(from_agent: AgentId, channel: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            from_agent,
            to_agent: None,
            channel: Some(channel.into()),
            priority: MessagePriority::Normal,
            kind: MessageType::Announcement,
            thread_id: None,
            timestamp: Utc::now(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn direct(from_agent: AgentId, to_agent: AgentId, content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            from_agent,
            to_agent: Some(to_agent),
            channel: None,
            priority: MessagePriority::Normal,
            kind: MessageType::Status,
            thread_id: None,
            timestamp: Utc::now(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_kind(mut self, kind: MessageType) -> Self {
        self.kind = kind;
        self
    }

    pub fn in_thread(mut self, thread_id: ThreadId) -> Self {
        self.thread_id = Some(thread_id);
        self
    }
}
