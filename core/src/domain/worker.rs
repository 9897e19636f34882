// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::error::{CoordError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpawnMode {
    Local,
    Docker,
    Cloud,
}

impl SpawnMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpawnMode::Local => "local",
            SpawnMode::Docker => "docker",
            SpawnMode::Cloud => "cloud",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "local" => Ok(SpawnMode::Local),
            "docker" => Ok(SpawnMode::Docker),
            "cloud" => Ok(SpawnMode::Cloud),
            other => Err(CoordError::Serialization(format!(
                "unknown spawn mode '{}'",
                other
            ))),
        }
    }
}

/// What the caller wants from a new worker process.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub name: String,
    pub tags: BTreeSet<String>,
    pub mode: SpawnMode,
    pub max_tasks: Option<u32>,
    pub poll_interval_secs: u64,
    pub env: HashMap<String, String>,
}

impl WorkerSpec {
    pub fn new(name: impl Into<String>, mode: SpawnMode) -> Self {
        Self {
            name: name.into(),
            tags: BTreeSet::new(),
            mode,
            max_tasks: None,
            poll_interval_secs: 5,
            env: HashMap::new(),
        }
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn max_tasks(mut self, n: u32) -> Self {
        self.max_tasks = Some(n);
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// The concrete invocation a runtime executes: worker entrypoint plus the
/// argument contract workers understand (`--name`, `--tags`, ...).
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

/// A launched worker as the runtime sees it: pid for local processes,
/// container id for Docker/cloud.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInstance {
    pub id: String,
    pub started_at: DateTime<Utc>,
}

/// Port implemented per spawn mode. The core treats workers as opaque
/// processes; the runtime only starts, probes, and stops them.
#[async_trait]
pub trait WorkerRuntime: Send + Sync {
    fn mode(&self) -> SpawnMode;

    async fn launch(&self, name: &str, command: &WorkerCommand) -> Result<WorkerInstance>;

    async fn is_alive(&self, instance: &WorkerInstance) -> bool;

    /// Graceful-first: polite stop, wait up to `grace`, then force.
    async fn terminate(&self, instance: &WorkerInstance, grace: Duration) -> Result<()>;
}
