// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::agent::AgentId;
use crate::domain::error::{CoordError, Result};

/// Opaque token returned at acquisition; required to release or extend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockId(pub Uuid);

impl LockId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| CoordError::LockStolen(s.to_string()))
    }
}

impl Default for LockId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for LockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileLock {
    pub path: String,
    pub holder: AgentId,
    pub intent: String,
    pub lock_id: LockId,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl FileLock {
    /// A lock past its expiry is released from every reader's perspective.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            ("path".into(), self.path.clone()),
            ("holder".into(), self.holder.to_string()),
            ("intent".into(), self.intent.clone()),
            ("lock_id".into(), self.lock_id.to_string()),
            ("acquired_at".into(), self.acquired_at.to_rfc3339()),
            ("expires_at".into(), self.expires_at.to_rfc3339()),
        ]
    }

    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self> {
        let get = |k: &str| fields.get(k).cloned().unwrap_or_default();
        let parse_ts = |s: &str| {
            DateTime::parse_from_rfc3339(s)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| CoordError::Serialization(format!("bad timestamp '{}': {}", s, e)))
        };
        Ok(Self {
            path: get("path"),
            holder: AgentId::parse(&get("holder"))?,
            intent: get("intent"),
            lock_id: LockId::parse(&get("lock_id"))?,
            acquired_at: parse_ts(&get("acquired_at"))?,
            expires_at: parse_ts(&get("expires_at"))?,
        })
    }
}

/// Lexically canonicalize a path so that equivalent spellings map to one
/// lock key. Does not touch the filesystem: locked paths may not exist yet.
pub fn canonical_lock_path(raw: &str) -> String {
    let mut out = PathBuf::new();
    for component in Path::new(raw.trim()).components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    let s = out.to_string_lossy().replace('\\', "/");
    if s.is_empty() {
        ".".to_string()
    } else {
        s
    }
}
