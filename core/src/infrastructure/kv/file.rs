// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! File-backed KV fallback for single-host use.
//!
//! Each hash/set/scalar key is one JSON file under a namespace directory;
//! streams are append-only JSONL. A `.lock` sibling file guards every
//! mutation across processes and writes go through a tempfile rename, so
//! readers always see a complete snapshot. Pub/sub is in-process only:
//! the fallback targets a single host, not a fleet.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, Mutex};

use crate::domain::error::{CoordError, Result};
use crate::infrastructure::kv::{ClaimRequest, KvBackend, KvSubscription, LockWrite, StreamEntry};

const GUARD_STALE_AFTER: Duration = Duration::from_secs(30);
const GUARD_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
enum FileRecord {
    Scalar(String),
    Hash(BTreeMap<String, String>),
    Set(BTreeSet<String>),
    SortedSet(BTreeMap<String, f64>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FileEntry {
    record: FileRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_at_ms: Option<i64>,
}

impl FileEntry {
    fn new(record: FileRecord) -> Self {
        Self {
            record,
            expires_at_ms: None,
        }
    }

    fn is_expired(&self, now_ms: i64) -> bool {
        matches!(self.expires_at_ms, Some(t) if t <= now_ms)
    }
}

/// Cross-process mutation guard: a `.lock` sibling created with
/// `create_new`. Guards abandoned by crashed processes are stolen once
/// they age past [`GUARD_STALE_AFTER`].
struct FileGuard {
    lock_path: PathBuf,
}

impl FileGuard {
    async fn acquire(target: &Path) -> Result<Self> {
        let lock_path = guard_path(target);
        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let deadline = std::time::Instant::now() + GUARD_ACQUIRE_TIMEOUT;
        loop {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
            {
                Ok(mut f) => {
                    let _ = write!(f, "{}", std::process::id());
                    return Ok(Self { lock_path });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if let Ok(meta) = std::fs::metadata(&lock_path) {
                        if let Ok(modified) = meta.modified() {
                            if modified.elapsed().unwrap_or_default() > GUARD_STALE_AFTER {
                                let _ = std::fs::remove_file(&lock_path);
                                continue;
                            }
                        }
                    }
                    if std::time::Instant::now() >= deadline {
                        return Err(CoordError::Backend(format!(
                            "could not acquire mutation guard {}",
                            lock_path.display()
                        )));
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Drop for FileGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.lock_path);
    }
}

fn guard_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "entry".to_string());
    name.push_str(".lock");
    target.with_file_name(name)
}

pub struct FileKv {
    root: PathBuf,
    // One mutator at a time within this process; the .lock files only
    // serialize across processes.
    mutate: Mutex<()>,
    subs: StdMutex<HashMap<String, broadcast::Sender<String>>>,
}

impl FileKv {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for sub in [
            "tasks",
            "locks",
            "agents",
            "approvals",
            "board",
            "audit",
            "llm",
            "misc",
        ] {
            std::fs::create_dir_all(root.join(sub))?;
        }
        // Fail at open time, not on the first mutation, if the directory is
        // read-only.
        let probe = root.join(".agentcoord-probe");
        std::fs::write(&probe, b"ok").map_err(|e| {
            CoordError::BackendUnavailable(format!(
                "fallback dir {} not writable: {}",
                root.display(),
                e
            ))
        })?;
        std::fs::remove_file(&probe)?;
        Ok(Self {
            root,
            mutate: Mutex::new(()),
            subs: StdMutex::new(HashMap::new()),
        })
    }

    fn namespace(key: &str) -> &'static str {
        let prefix = key.split(':').next().unwrap_or("");
        match prefix {
            "task" | "tasks" => "tasks",
            "lock" | "locks" => "locks",
            "agent" | "agents" => "agents",
            "approval" | "approvals" => "approvals",
            "board" => "board",
            "audit" => "audit",
            "llm" => "llm",
            _ => "misc",
        }
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.root
            .join(Self::namespace(key))
            .join(format!("{}.json", sanitize(key)))
    }

    fn stream_path(&self, key: &str) -> PathBuf {
        self.root
            .join(Self::namespace(key))
            .join(format!("{}.jsonl", sanitize(key)))
    }

    fn load(&self, key: &str) -> Result<Option<FileEntry>> {
        let path = self.entry_path(key);
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let entry: FileEntry = serde_json::from_slice(&bytes)?;
        if entry.is_expired(Utc::now().timestamp_millis()) {
            return Ok(None);
        }
        Ok(Some(entry))
    }

    fn store(&self, key: &str, entry: &FileEntry) -> Result<()> {
        write_atomic(&self.entry_path(key), &serde_json::to_vec_pretty(entry)?)
    }

    fn remove(&self, key: &str) -> Result<()> {
        match std::fs::remove_file(self.entry_path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Serialize a mutation of one or more keys: in-process mutex first,
    /// then the cross-process guards in sorted order.
    async fn guard_keys(&self, keys: &[&str]) -> Result<Vec<FileGuard>> {
        let mut paths: Vec<PathBuf> = keys.iter().map(|k| self.entry_path(k)).collect();
        paths.sort();
        paths.dedup();
        let mut guards = Vec::with_capacity(paths.len());
        for path in paths {
            guards.push(FileGuard::acquire(&path).await?);
        }
        Ok(guards)
    }

    fn scalar(&self, key: &str) -> Result<Option<String>> {
        match self.load(key)? {
            Some(FileEntry {
                record: FileRecord::Scalar(v),
                ..
            }) => Ok(Some(v)),
            Some(_) => Err(wrong_type(key, "scalar")),
            None => Ok(None),
        }
    }

    fn hash(&self, key: &str) -> Result<Option<BTreeMap<String, String>>> {
        match self.load(key)? {
            Some(FileEntry {
                record: FileRecord::Hash(h),
                ..
            }) => Ok(Some(h)),
            Some(_) => Err(wrong_type(key, "hash")),
            None => Ok(None),
        }
    }

    fn set_members(&self, key: &str) -> Result<BTreeSet<String>> {
        match self.load(key)? {
            Some(FileEntry {
                record: FileRecord::Set(s),
                ..
            }) => Ok(s),
            Some(_) => Err(wrong_type(key, "set")),
            None => Ok(BTreeSet::new()),
        }
    }

    fn zset(&self, key: &str) -> Result<BTreeMap<String, f64>> {
        match self.load(key)? {
            Some(FileEntry {
                record: FileRecord::SortedSet(z),
                ..
            }) => Ok(z),
            Some(_) => Err(wrong_type(key, "sorted set")),
            None => Ok(BTreeMap::new()),
        }
    }

    fn sender_for(&self, channel: &str) -> broadcast::Sender<String> {
        let mut subs = self.subs.lock().expect("pubsub registry poisoned");
        subs.entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(256).0)
            .clone()
    }
}

/// Bijective key-to-filename encoding: distinct keys can never land on the
/// same file. Alphanumerics, `-` and `_` pass through, everything else is
/// `%xx`-escaped.
fn sanitize(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for b in key.bytes() {
        match b {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' => out.push(b as char),
            other => out.push_str(&format!("%{:02x}", other)),
        }
    }
    out
}

fn wrong_type(key: &str, expected: &str) -> CoordError {
    CoordError::Backend(format!("key '{}' does not hold a {}", key, expected))
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| CoordError::Backend(format!("no parent dir for {}", path.display())))?;
    std::fs::create_dir_all(parent)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(bytes)?;
    tmp.persist(path)
        .map_err(|e| CoordError::Backend(format!("atomic write failed: {}", e)))?;
    Ok(())
}

/// Stream ids are `<epoch_ms>-<seq>`, monotonic even if the clock steps back.
fn parse_stream_id(id: &str) -> (i64, u64) {
    let mut parts = id.splitn(2, '-');
    let ms = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    let seq = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    (ms, seq)
}

#[derive(Debug, Serialize, Deserialize)]
struct StreamLine {
    id: String,
    fields: BTreeMap<String, String>,
}

#[async_trait]
impl KvBackend for FileKv {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn ping(&self) -> Result<()> {
        if self.root.is_dir() {
            Ok(())
        } else {
            Err(CoordError::BackendUnavailable(format!(
                "fallback dir {} vanished",
                self.root.display()
            )))
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.scalar(key)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let _m = self.mutate.lock().await;
        let _g = self.guard_keys(&[key]).await?;
        self.store(key, &FileEntry::new(FileRecord::Scalar(value.to_string())))
    }

    async fn del(&self, key: &str) -> Result<()> {
        let _m = self.mutate.lock().await;
        let _g = self.guard_keys(&[key]).await?;
        self.remove(key)
    }

    async fn cas_set(&self, key: &str, expected: Option<&str>, new: &str) -> Result<bool> {
        let _m = self.mutate.lock().await;
        let _g = self.guard_keys(&[key]).await?;
        let current = self.scalar(key)?;
        let matches = match (expected, current.as_deref()) {
            (None, None) => true,
            (Some(e), Some(c)) => e == c,
            _ => false,
        };
        if matches {
            self.store(key, &FileEntry::new(FileRecord::Scalar(new.to_string())))?;
        }
        Ok(matches)
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64> {
        let _m = self.mutate.lock().await;
        let _g = self.guard_keys(&[key]).await?;
        let current: i64 = self
            .scalar(key)?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let next = current + delta;
        self.store(key, &FileEntry::new(FileRecord::Scalar(next.to_string())))?;
        Ok(next)
    }

    async fn incr_by_float(&self, key: &str, delta: f64) -> Result<f64> {
        let _m = self.mutate.lock().await;
        let _g = self.guard_keys(&[key]).await?;
        let current: f64 = self
            .scalar(key)?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0.0);
        let next = current + delta;
        self.store(key, &FileEntry::new(FileRecord::Scalar(next.to_string())))?;
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let _m = self.mutate.lock().await;
        let _g = self.guard_keys(&[key]).await?;
        if let Some(mut entry) = self.load(key)? {
            entry.expires_at_ms = Some(Utc::now().timestamp_millis() + ttl.as_millis() as i64);
            self.store(key, &entry)?;
        }
        Ok(())
    }

    async fn hset(&self, key: &str, fields: &[(String, String)]) -> Result<()> {
        let _m = self.mutate.lock().await;
        let _g = self.guard_keys(&[key]).await?;
        let mut hash = self.hash(key)?.unwrap_or_default();
        for (k, v) in fields {
            hash.insert(k.clone(), v.clone());
        }
        let mut entry = FileEntry::new(FileRecord::Hash(hash));
        // Preserve an existing expiry on update.
        if let Some(prev) = self.load(key)? {
            entry.expires_at_ms = prev.expires_at_ms;
        }
        self.store(key, &entry)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        Ok(self.hash(key)?.and_then(|h| h.get(field).cloned()))
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        Ok(self
            .hash(key)?
            .map(|h| h.into_iter().collect())
            .unwrap_or_default())
    }

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        let _m = self.mutate.lock().await;
        let _g = self.guard_keys(&[key]).await?;
        let mut hash = self.hash(key)?.unwrap_or_default();
        let current: i64 = hash.get(field).and_then(|v| v.parse().ok()).unwrap_or(0);
        let next = current + delta;
        hash.insert(field.to_string(), next.to_string());
        self.store(key, &FileEntry::new(FileRecord::Hash(hash)))?;
        Ok(next)
    }

    async fn hincr_by_float(&self, key: &str, field: &str, delta: f64) -> Result<f64> {
        let _m = self.mutate.lock().await;
        let _g = self.guard_keys(&[key]).await?;
        let mut hash = self.hash(key)?.unwrap_or_default();
        let current: f64 = hash.get(field).and_then(|v| v.parse().ok()).unwrap_or(0.0);
        let next = current + delta;
        hash.insert(field.to_string(), next.to_string());
        self.store(key, &FileEntry::new(FileRecord::Hash(hash)))?;
        Ok(next)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        let _m = self.mutate.lock().await;
        let _g = self.guard_keys(&[key]).await?;
        let mut set = self.set_members(key)?;
        let added = set.insert(member.to_string());
        self.store(key, &FileEntry::new(FileRecord::Set(set)))?;
        Ok(added)
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool> {
        let _m = self.mutate.lock().await;
        let _g = self.guard_keys(&[key]).await?;
        let mut set = self.set_members(key)?;
        let removed = set.remove(member);
        self.store(key, &FileEntry::new(FileRecord::Set(set)))?;
        Ok(removed)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        Ok(self.set_members(key)?.into_iter().collect())
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<()> {
        let _m = self.mutate.lock().await;
        let _g = self.guard_keys(&[key]).await?;
        let mut zset = self.zset(key)?;
        zset.insert(member.to_string(), score);
        self.store(key, &FileEntry::new(FileRecord::SortedSet(zset)))
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        let _m = self.mutate.lock().await;
        let _g = self.guard_keys(&[key]).await?;
        let mut zset = self.zset(key)?;
        let removed = zset.remove(member).is_some();
        self.store(key, &FileEntry::new(FileRecord::SortedSet(zset)))?;
        Ok(removed)
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>> {
        Ok(self.zset(key)?.get(member).copied())
    }

    async fn zcard(&self, key: &str) -> Result<u64> {
        Ok(self.zset(key)?.len() as u64)
    }

    async fn zrange_desc(&self, key: &str, limit: Option<usize>) -> Result<Vec<(String, f64)>> {
        let mut pairs: Vec<(String, f64)> = self.zset(key)?.into_iter().collect();
        // Redis ZREVRANGE order: score descending, ties reverse-lex.
        pairs.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.0.cmp(&a.0))
        });
        if let Some(limit) = limit {
            pairs.truncate(limit);
        }
        Ok(pairs)
    }

    async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> Result<Vec<String>> {
        let mut pairs: Vec<(String, f64)> = self
            .zset(key)?
            .into_iter()
            .filter(|(_, s)| *s >= min && *s <= max)
            .collect();
        pairs.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        Ok(pairs.into_iter().map(|(m, _)| m).collect())
    }

    async fn zpop_min(&self, key: &str) -> Result<Option<(String, f64)>> {
        let _m = self.mutate.lock().await;
        let _g = self.guard_keys(&[key]).await?;
        let mut zset = self.zset(key)?;
        let lowest = zset
            .iter()
            .min_by(|a, b| {
                a.1.partial_cmp(b.1)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.0.cmp(b.0))
            })
            .map(|(m, s)| (m.clone(), *s));
        if let Some((member, score)) = lowest {
            zset.remove(&member);
            self.store(key, &FileEntry::new(FileRecord::SortedSet(zset)))?;
            Ok(Some((member, score)))
        } else {
            Ok(None)
        }
    }

    async fn xadd(&self, key: &str, fields: &[(String, String)]) -> Result<String> {
        let _m = self.mutate.lock().await;
        let path = self.stream_path(key);
        let _g = FileGuard::acquire(&path).await?;

        let seq_path = path.with_extension("jsonl.seq");
        let last = std::fs::read_to_string(&seq_path).unwrap_or_default();
        let (last_ms, last_seq) = parse_stream_id(last.trim());
        let now_ms = Utc::now().timestamp_millis();
        let id = if now_ms > last_ms {
            format!("{}-0", now_ms)
        } else {
            format!("{}-{}", last_ms, last_seq + 1)
        };

        let line = StreamLine {
            id: id.clone(),
            fields: fields.iter().cloned().collect(),
        };
        let mut serialized = serde_json::to_string(&line)?;
        serialized.push('\n');
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        file.write_all(serialized.as_bytes())?;
        write_atomic(&seq_path, id.as_bytes())?;
        Ok(id)
    }

    async fn xrange_from(
        &self,
        key: &str,
        cursor: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        let path = self.stream_path(key);
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let after = if cursor.is_empty() {
            (-1, 0)
        } else {
            parse_stream_id(cursor)
        };
        let mut entries = Vec::new();
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let parsed: StreamLine = serde_json::from_str(line)?;
            if parse_stream_id(&parsed.id) <= after {
                continue;
            }
            entries.push(StreamEntry {
                id: parsed.id,
                fields: parsed.fields.into_iter().collect(),
            });
            if entries.len() >= count {
                break;
            }
        }
        Ok(entries)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        // No receivers is not an error, matching Redis semantics.
        let _ = self.sender_for(channel).send(payload.to_string());
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<KvSubscription> {
        let mut source = self.sender_for(channel).subscribe();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(payload) => {
                        if tx.send(payload).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(KvSubscription::new(rx))
    }

    async fn claim_pending(&self, req: &ClaimRequest) -> Result<bool> {
        let _m = self.mutate.lock().await;
        let _g = self
            .guard_keys(&[
                req.pending_key.as_str(),
                req.task_key.as_str(),
                req.by_agent_key.as_str(),
            ])
            .await?;

        let mut pending = self.zset(&req.pending_key)?;
        if !pending.contains_key(&req.task_id) {
            return Ok(false);
        }
        let mut task = match self.hash(&req.task_key)? {
            Some(h) => h,
            None => {
                pending.remove(&req.task_id);
                self.store(
                    &req.pending_key,
                    &FileEntry::new(FileRecord::SortedSet(pending)),
                )?;
                return Ok(false);
            }
        };
        pending.remove(&req.task_id);
        self.store(
            &req.pending_key,
            &FileEntry::new(FileRecord::SortedSet(pending)),
        )?;
        if task.get("status").map(String::as_str) != Some("pending") {
            return Ok(false);
        }
        task.insert("status".into(), "claimed".into());
        task.insert("claimed_by".into(), req.agent_id.clone());
        task.insert("claimed_at".into(), req.now.clone());
        task.insert("updated_at".into(), req.now.clone());
        self.store(&req.task_key, &FileEntry::new(FileRecord::Hash(task)))?;

        let mut leases = self.set_members(&req.by_agent_key)?;
        leases.insert(req.task_id.clone());
        self.store(&req.by_agent_key, &FileEntry::new(FileRecord::Set(leases)))?;
        Ok(true)
    }

    async fn acquire_lock(&self, req: &LockWrite) -> Result<bool> {
        let _m = self.mutate.lock().await;
        let _g = self
            .guard_keys(&[req.lock_key.as_str(), req.index_key.as_str()])
            .await?;

        // load() treats an expired lock as absent, which is the reap.
        if self.load(&req.lock_key)?.is_some() {
            return Ok(false);
        }
        let mut hash = BTreeMap::new();
        hash.insert("path".to_string(), req.path.clone());
        hash.insert("holder".to_string(), req.holder.clone());
        hash.insert("intent".to_string(), req.intent.clone());
        hash.insert("lock_id".to_string(), req.lock_id.clone());
        hash.insert("acquired_at".to_string(), req.acquired_at.clone());
        hash.insert("expires_at".to_string(), req.expires_at.clone());
        let mut entry = FileEntry::new(FileRecord::Hash(hash));
        entry.expires_at_ms = Some(Utc::now().timestamp_millis() + req.ttl.as_millis() as i64);
        self.store(&req.lock_key, &entry)?;

        let mut index = self.set_members(&req.index_key)?;
        index.insert(req.path.clone());
        self.store(&req.index_key, &FileEntry::new(FileRecord::Set(index)))?;
        Ok(true)
    }

    async fn release_lock(
        &self,
        lock_key: &str,
        index_key: &str,
        path: &str,
        lock_id: &str,
    ) -> Result<bool> {
        let _m = self.mutate.lock().await;
        let _g = self.guard_keys(&[lock_key, index_key]).await?;
        let held = match self.hash(lock_key)? {
            Some(h) => h.get("lock_id").map(String::as_str) == Some(lock_id),
            None => false,
        };
        if held {
            self.remove(lock_key)?;
            let mut index = self.set_members(index_key)?;
            index.remove(path);
            self.store(index_key, &FileEntry::new(FileRecord::Set(index)))?;
        }
        Ok(held)
    }

    async fn extend_lock(
        &self,
        lock_key: &str,
        lock_id: &str,
        new_expires_at: &str,
        ttl: Duration,
    ) -> Result<bool> {
        let _m = self.mutate.lock().await;
        let _g = self.guard_keys(&[lock_key]).await?;
        let mut hash = match self.hash(lock_key)? {
            Some(h) if h.get("lock_id").map(String::as_str) == Some(lock_id) => h,
            _ => return Ok(false),
        };
        hash.insert("expires_at".to_string(), new_expires_at.to_string());
        let mut entry = FileEntry::new(FileRecord::Hash(hash));
        entry.expires_at_ms = Some(Utc::now().timestamp_millis() + ttl.as_millis() as i64);
        self.store(lock_key, &entry)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> (tempfile::TempDir, FileKv) {
        let dir = tempfile::tempdir().unwrap();
        let kv = FileKv::open(dir.path()).unwrap();
        (dir, kv)
    }

    #[tokio::test]
    async fn test_cas_set() {
        let (_dir, kv) = backend();
        assert!(kv.cas_set("misc:x", None, "1").await.unwrap());
        assert!(!kv.cas_set("misc:x", None, "2").await.unwrap());
        assert!(kv.cas_set("misc:x", Some("1"), "2").await.unwrap());
        assert_eq!(kv.get("misc:x").await.unwrap().as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_counters() {
        let (_dir, kv) = backend();
        assert_eq!(kv.incr("misc:n").await.unwrap(), 1);
        assert_eq!(kv.incr_by("misc:n", 5).await.unwrap(), 6);
        assert_eq!(kv.decr("misc:n").await.unwrap(), 5);
        let f = kv.incr_by_float("misc:f", 0.25).await.unwrap();
        assert!((f - 0.25).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_zset_ordering_matches_redis() {
        let (_dir, kv) = backend();
        kv.zadd("misc:z", 2.0, "b").await.unwrap();
        kv.zadd("misc:z", 1.0, "a").await.unwrap();
        kv.zadd("misc:z", 2.0, "c").await.unwrap();

        let desc = kv.zrange_desc("misc:z", None).await.unwrap();
        let members: Vec<&str> = desc.iter().map(|(m, _)| m.as_str()).collect();
        // Ties (b, c at 2.0) come reverse-lex, like ZREVRANGE.
        assert_eq!(members, vec!["c", "b", "a"]);

        let low = kv.zrange_by_score("misc:z", 0.0, 1.5).await.unwrap();
        assert_eq!(low, vec!["a"]);

        let popped = kv.zpop_min("misc:z").await.unwrap().unwrap();
        assert_eq!(popped.0, "a");
        assert_eq!(kv.zcard("misc:z").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_stream_ids_monotonic_and_cursor() {
        let (_dir, kv) = backend();
        let fields = vec![("event".to_string(), "one".to_string())];
        let id1 = kv.xadd("audit:decisions", &fields).await.unwrap();
        let id2 = kv.xadd("audit:decisions", &fields).await.unwrap();
        let id3 = kv.xadd("audit:decisions", &fields).await.unwrap();
        assert!(parse_stream_id(&id1) < parse_stream_id(&id2));
        assert!(parse_stream_id(&id2) < parse_stream_id(&id3));

        let all = kv.xrange_from("audit:decisions", "", 10).await.unwrap();
        assert_eq!(all.len(), 3);

        let after_first = kv.xrange_from("audit:decisions", &id1, 10).await.unwrap();
        assert_eq!(after_first.len(), 2);
        assert_eq!(after_first[0].id, id2);
    }

    #[tokio::test]
    async fn test_lock_acquire_conflict_and_ttl() {
        let (_dir, kv) = backend();
        let write = |lock_id: &str, ttl: Duration| LockWrite {
            lock_key: "lock:src/main.rs".into(),
            index_key: "locks:index".into(),
            path: "src/main.rs".into(),
            holder: "agent-1".into(),
            intent: "edit".into(),
            lock_id: lock_id.into(),
            acquired_at: Utc::now().to_rfc3339(),
            expires_at: Utc::now().to_rfc3339(),
            ttl,
        };

        assert!(kv
            .acquire_lock(&write("tok-1", Duration::from_secs(600)))
            .await
            .unwrap());
        assert!(!kv
            .acquire_lock(&write("tok-2", Duration::from_secs(600)))
            .await
            .unwrap());

        // Wrong token cannot release.
        assert!(!kv
            .release_lock("lock:src/main.rs", "locks:index", "src/main.rs", "tok-2")
            .await
            .unwrap());
        assert!(kv
            .release_lock("lock:src/main.rs", "locks:index", "src/main.rs", "tok-1")
            .await
            .unwrap());

        // Expired locks are reaped on the next acquire.
        assert!(kv
            .acquire_lock(&write("tok-3", Duration::from_millis(20)))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(kv
            .acquire_lock(&write("tok-4", Duration::from_secs(600)))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_hash_preserves_expiry_on_update() {
        let (_dir, kv) = backend();
        kv.hset("misc:h", &[("a".into(), "1".into())]).await.unwrap();
        kv.expire("misc:h", Duration::from_secs(60)).await.unwrap();
        kv.hset("misc:h", &[("b".into(), "2".into())]).await.unwrap();
        let entry = kv.load("misc:h").unwrap().unwrap();
        assert!(entry.expires_at_ms.is_some());
    }

    #[tokio::test]
    async fn test_pubsub_in_process() {
        let (_dir, kv) = backend();
        let mut sub = kv.subscribe("channel:escalations").await.unwrap();
        kv.publish("channel:escalations", "{\"event\":1}")
            .await
            .unwrap();
        let received = tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, "{\"event\":1}");
    }
}
