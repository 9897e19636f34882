// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Storage backend abstraction.
//!
//! Every piece of cross-process state goes through the [`KvBackend`] trait:
//! a networked Redis implementation for shared deployments and a file-backed
//! implementation for single-host use. Both expose the same atomic
//! primitives, so the services above them cannot tell which one they run on.

pub mod file;
pub mod redis;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::CoordConfig;
use crate::domain::error::{CoordError, Result};

pub use self::file::FileKv;
pub use self::redis::RedisKv;

/// One replayed stream entry.
#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub id: String,
    pub fields: HashMap<String, String>,
}

/// Handle to a pub/sub subscription. Dropping it ends the subscription.
pub struct KvSubscription {
    rx: mpsc::UnboundedReceiver<String>,
}

impl KvSubscription {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<String>) -> Self {
        Self { rx }
    }

    /// Next published payload, or `None` once the backend side is gone.
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<String> {
        self.rx.try_recv().ok()
    }
}

/// Arguments of the scripted compare-and-claim: verify the task is still
/// pending, pull it out of the queue, stamp the claim, and record the lease,
/// all in one atomic step.
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    pub pending_key: String,
    pub task_key: String,
    pub by_agent_key: String,
    pub task_id: String,
    pub agent_id: String,
    pub now: String,
}

/// Arguments of the scripted lock acquisition (`GET` + `SET NX PX` shape).
#[derive(Debug, Clone)]
pub struct LockWrite {
    pub lock_key: String,
    pub index_key: String,
    pub path: String,
    pub holder: String,
    pub intent: String,
    pub lock_id: String,
    pub acquired_at: String,
    pub expires_at: String,
    pub ttl: Duration,
}

#[async_trait]
pub trait KvBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn ping(&self) -> Result<()>;

    // ── strings / counters ────────────────────────────────────────────────

    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    async fn del(&self, key: &str) -> Result<()>;

    /// Conditional set: takes effect only when the stored value matches
    /// `expected` (`None` = key must be absent). Returns whether it took.
    async fn cas_set(&self, key: &str, expected: Option<&str>, new: &str) -> Result<bool>;

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64>;
    async fn incr_by_float(&self, key: &str, delta: f64) -> Result<f64>;
    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;

    async fn incr(&self, key: &str) -> Result<i64> {
        self.incr_by(key, 1).await
    }

    async fn decr(&self, key: &str) -> Result<i64> {
        self.incr_by(key, -1).await
    }

    // ── hashes ────────────────────────────────────────────────────────────

    async fn hset(&self, key: &str, fields: &[(String, String)]) -> Result<()>;
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>>;
    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> Result<i64>;
    async fn hincr_by_float(&self, key: &str, field: &str, delta: f64) -> Result<f64>;

    // ── sets ──────────────────────────────────────────────────────────────

    async fn sadd(&self, key: &str, member: &str) -> Result<bool>;
    async fn srem(&self, key: &str, member: &str) -> Result<bool>;
    async fn smembers(&self, key: &str) -> Result<Vec<String>>;

    // ── sorted sets ───────────────────────────────────────────────────────

    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<()>;
    async fn zrem(&self, key: &str, member: &str) -> Result<bool>;
    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>>;
    async fn zcard(&self, key: &str) -> Result<u64>;

    /// Members ordered high score first; equal scores order by member.
    async fn zrange_desc(&self, key: &str, limit: Option<usize>) -> Result<Vec<(String, f64)>>;

    /// Members with `min <= score <= max`, low score first.
    async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> Result<Vec<String>>;

    async fn zpop_min(&self, key: &str) -> Result<Option<(String, f64)>>;

    // ── streams ───────────────────────────────────────────────────────────

    /// Append an entry; the backend assigns the monotonic id.
    async fn xadd(&self, key: &str, fields: &[(String, String)]) -> Result<String>;

    /// Read entries strictly after `cursor` (empty cursor = from the start).
    async fn xrange_from(&self, key: &str, cursor: &str, count: usize)
        -> Result<Vec<StreamEntry>>;

    // ── pub/sub ───────────────────────────────────────────────────────────

    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;
    async fn subscribe(&self, channel: &str) -> Result<KvSubscription>;

    // ── scripted atomics ──────────────────────────────────────────────────

    async fn claim_pending(&self, req: &ClaimRequest) -> Result<bool>;

    /// Succeeds only when no live lock exists for the key.
    async fn acquire_lock(&self, req: &LockWrite) -> Result<bool>;

    /// Deletes the lock only if the stored token matches.
    async fn release_lock(
        &self,
        lock_key: &str,
        index_key: &str,
        path: &str,
        lock_id: &str,
    ) -> Result<bool>;

    /// Pushes the expiry out only if the stored token matches.
    async fn extend_lock(
        &self,
        lock_key: &str,
        lock_id: &str,
        new_expires_at: &str,
        ttl: Duration,
    ) -> Result<bool>;
}

/// Connect to the configured backend: Redis first, file fallback second.
/// Only when neither is usable does the session fail to start.
pub async fn connect(config: &CoordConfig) -> Result<Arc<dyn KvBackend>> {
    match RedisKv::connect(&config.redis_url).await {
        Ok(kv) => {
            info!(url = %config.redis_url, "connected to redis backend");
            Ok(Arc::new(kv))
        }
        Err(redis_err) => {
            warn!(
                url = %config.redis_url,
                error = %redis_err,
                "redis unreachable, falling back to file backend"
            );
            match FileKv::open(&config.fallback_dir) {
                Ok(kv) => {
                    info!(dir = %config.fallback_dir.display(), "using file-backed fallback");
                    Ok(Arc::new(kv))
                }
                Err(file_err) => Err(CoordError::BackendUnavailable(format!(
                    "redis: {}; fallback: {}",
                    redis_err, file_err
                ))),
            }
        }
    }
}
