// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::application::audit::AuditLog;
use crate::domain::agent::AgentId;
use crate::domain::audit::AuditKind;
use crate::domain::error::{CoordError, Result};
use crate::domain::lock::{canonical_lock_path, FileLock, LockId};
use crate::infrastructure::kv::{KvBackend, LockWrite};
use crate::keys;

/// Retry backoff for [`LockManager::lock_file_with_retry`].
const RETRY_BACKOFF_START: Duration = Duration::from_millis(500);
const RETRY_BACKOFF_CAP: Duration = Duration::from_secs(5);

type LockTracker = Arc<Mutex<Vec<(String, LockId)>>>;

/// Serializes file mutation across agents. Acquisition either takes the lock
/// or fails `LockBusy`; there is no queue. TTLs reap locks whose holders
/// crashed without releasing.
#[derive(Clone)]
pub struct LockManager {
    kv: Arc<dyn KvBackend>,
    audit: AuditLog,
    agent_id: AgentId,
    default_ttl: Duration,
    tracker: Option<LockTracker>,
}

impl LockManager {
    pub fn new(
        kv: Arc<dyn KvBackend>,
        audit: AuditLog,
        agent_id: AgentId,
        default_ttl: Duration,
    ) -> Self {
        Self {
            kv,
            audit,
            agent_id,
            default_ttl,
            tracker: None,
        }
    }

    /// Locks acquired through a tracked manager are released when the owning
    /// session closes.
    pub(crate) fn with_tracker(mut self, tracker: LockTracker) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub async fn lock_file(
        &self,
        path: &str,
        intent: &str,
        ttl: Option<Duration>,
    ) -> Result<FileLock> {
        let ttl = ttl.unwrap_or(self.default_ttl);
        let canonical = canonical_lock_path(path);
        let lock_key = keys::lock(&canonical);
        let now = Utc::now();
        let expires = now + chrono::Duration::milliseconds(ttl.as_millis() as i64);

        let lock = FileLock {
            path: canonical.clone(),
            holder: self.agent_id,
            intent: intent.to_string(),
            lock_id: LockId::new(),
            acquired_at: now,
            expires_at: expires,
        };

        let acquired = self
            .kv
            .acquire_lock(&LockWrite {
                lock_key: lock_key.clone(),
                index_key: keys::LOCKS_INDEX.to_string(),
                path: canonical.clone(),
                holder: lock.holder.to_string(),
                intent: lock.intent.clone(),
                lock_id: lock.lock_id.to_string(),
                acquired_at: lock.acquired_at.to_rfc3339(),
                expires_at: lock.expires_at.to_rfc3339(),
                ttl,
            })
            .await?;

        if !acquired {
            let holder = self
                .kv
                .hget(&lock_key, "holder")
                .await
                .ok()
                .flatten()
                .unwrap_or_else(|| "unknown".to_string());
            self.audit
                .emit(
                    &self.agent_id.to_string(),
                    AuditKind::LockConflict,
                    &canonical,
                    &format!("held by {}", holder),
                )
                .await;
            return Err(CoordError::LockBusy {
                path: canonical,
                holder,
            });
        }

        // Reverse index so extend/release can be keyed by token alone.
        self.kv
            .set(&keys::lock_by_id(lock.lock_id), &canonical)
            .await?;
        self.kv
            .expire(&keys::lock_by_id(lock.lock_id), ttl)
            .await?;

        if let Some(tracker) = &self.tracker {
            tracker.lock().await.push((canonical.clone(), lock.lock_id));
        }
        info!(path = %canonical, agent_id = %self.agent_id, "acquired file lock");
        Ok(lock)
    }

    /// Keep retrying a busy lock with capped exponential backoff until the
    /// deadline. Fails `Timeout` with the current holder named.
    pub async fn lock_file_with_retry(
        &self,
        path: &str,
        intent: &str,
        timeout: Duration,
    ) -> Result<FileLock> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut backoff = RETRY_BACKOFF_START;
        loop {
            match self.lock_file(path, intent, None).await {
                Ok(lock) => return Ok(lock),
                Err(CoordError::LockBusy { path, holder }) => {
                    if tokio::time::Instant::now() + backoff > deadline {
                        return Err(CoordError::Timeout(format!(
                            "could not lock {} within {:?}; held by {}",
                            path, timeout, holder
                        )));
                    }
                    debug!(path = %path, holder = %holder, "lock busy, backing off");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(RETRY_BACKOFF_CAP);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Push the expiry out by `additional`. Fails `LockStolen` when the
    /// stored token no longer matches (TTL lapsed, someone else acquired).
    pub async fn extend_lock(&self, lock_id: LockId, additional: Duration) -> Result<()> {
        let path = self
            .kv
            .get(&keys::lock_by_id(lock_id))
            .await?
            .ok_or_else(|| CoordError::LockStolen(lock_id.to_string()))?;
        let lock_key = keys::lock(&path);

        let current = self.kv.hget(&lock_key, "expires_at").await?;
        let base = current
            .as_deref()
            .and_then(crate::domain::parse_iso)
            .unwrap_or_else(Utc::now);
        let new_expires = base + chrono::Duration::milliseconds(additional.as_millis() as i64);
        let ttl = (new_expires - Utc::now())
            .to_std()
            .map_err(|_| CoordError::LockStolen(path.clone()))?;

        let extended = self
            .kv
            .extend_lock(&lock_key, &lock_id.to_string(), &new_expires.to_rfc3339(), ttl)
            .await?;
        if !extended {
            return Err(CoordError::LockStolen(path));
        }
        self.kv.expire(&keys::lock_by_id(lock_id), ttl).await?;
        Ok(())
    }

    /// Best-effort: releasing an expired or already-released lock is fine.
    pub async fn release_lock(&self, lock_id: LockId) -> Result<()> {
        let path = match self.kv.get(&keys::lock_by_id(lock_id)).await? {
            Some(path) => path,
            None => return Ok(()),
        };
        let released = self
            .kv
            .release_lock(
                &keys::lock(&path),
                keys::LOCKS_INDEX,
                &path,
                &lock_id.to_string(),
            )
            .await?;
        self.kv.del(&keys::lock_by_id(lock_id)).await?;
        if let Some(tracker) = &self.tracker {
            tracker.lock().await.retain(|(_, id)| *id != lock_id);
        }
        if released {
            info!(path = %path, agent_id = %self.agent_id, "released file lock");
        }
        Ok(())
    }

    /// Live locks only; expired entries are reaped from the index on the way.
    pub async fn list_locks(&self) -> Result<Vec<FileLock>> {
        let now = Utc::now();
        let mut live = Vec::new();
        for path in self.kv.smembers(keys::LOCKS_INDEX).await? {
            let fields = self.kv.hgetall(&keys::lock(&path)).await?;
            if fields.is_empty() {
                self.kv.srem(keys::LOCKS_INDEX, &path).await?;
                continue;
            }
            let lock = FileLock::from_fields(&fields)?;
            if lock.is_expired(now) {
                self.kv.srem(keys::LOCKS_INDEX, &path).await?;
                continue;
            }
            live.push(lock);
        }
        Ok(live)
    }

    /// The canonical usage: acquire now, release on every exit path.
    pub async fn scoped_lock(&self, path: &str, intent: &str) -> Result<LockGuard> {
        let lock = self.lock_file(path, intent, None).await?;
        Ok(LockGuard {
            manager: self.clone(),
            lock: Some(lock),
        })
    }
}

/// RAII handle for a held lock. Prefer the explicit [`LockGuard::release`];
/// dropping the guard schedules a background release as the safety net for
/// early returns and panics.
pub struct LockGuard {
    manager: LockManager,
    lock: Option<FileLock>,
}

impl LockGuard {
    pub fn lock(&self) -> &FileLock {
        self.lock.as_ref().expect("guard already released")
    }

    pub fn lock_id(&self) -> LockId {
        self.lock().lock_id
    }

    pub async fn extend(&self, additional: Duration) -> Result<()> {
        self.manager.extend_lock(self.lock_id(), additional).await
    }

    pub async fn release(mut self) -> Result<()> {
        if let Some(lock) = self.lock.take() {
            self.manager.release_lock(lock.lock_id).await?;
        }
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(lock) = self.lock.take() {
            let manager = self.manager.clone();
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        if let Err(e) = manager.release_lock(lock.lock_id).await {
                            warn!(path = %lock.path, error = %e, "deferred lock release failed");
                        }
                    });
                }
                Err(_) => warn!(path = %lock.path, "lock guard dropped outside runtime; TTL will reap"),
            }
        }
    }
}
