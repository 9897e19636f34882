// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Networked KV backend over Redis.
//!
//! The two coordination-critical mutations (task claim, lock acquire) run as
//! server-side Lua so competing processes can never interleave inside them.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};
use tokio::sync::mpsc;
use tracing::debug;

use crate::domain::error::Result;
use crate::infrastructure::kv::{ClaimRequest, KvBackend, KvSubscription, LockWrite, StreamEntry};

/// Verify the candidate is still queued and pending, then move it to the
/// claiming agent's lease in one step. Stale queue entries (task hash no
/// longer pending) are dropped on the way.
const CLAIM_SCRIPT: &str = r#"
local score = redis.call('ZSCORE', KEYS[1], ARGV[1])
if not score then
  return 0
end
local status = redis.call('HGET', KEYS[2], 'status')
if status ~= 'pending' then
  redis.call('ZREM', KEYS[1], ARGV[1])
  return 0
end
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('HSET', KEYS[2],
  'status', 'claimed',
  'claimed_by', ARGV[2],
  'claimed_at', ARGV[3],
  'updated_at', ARGV[3])
redis.call('SADD', KEYS[3], ARGV[1])
return 1
"#;

/// GET + SET NX PX equivalent over a hash: acquire only when no live lock
/// exists. Key-level TTL reaps orphans when holders crash.
const ACQUIRE_LOCK_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
  return 0
end
redis.call('HSET', KEYS[1],
  'path', ARGV[1],
  'holder', ARGV[2],
  'intent', ARGV[3],
  'lock_id', ARGV[4],
  'acquired_at', ARGV[5],
  'expires_at', ARGV[6])
redis.call('PEXPIRE', KEYS[1], ARGV[7])
redis.call('SADD', KEYS[2], ARGV[1])
return 1
"#;

const RELEASE_LOCK_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], 'lock_id') == ARGV[1] then
  redis.call('DEL', KEYS[1])
  redis.call('SREM', KEYS[2], ARGV[2])
  return 1
end
return 0
"#;

const EXTEND_LOCK_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], 'lock_id') == ARGV[1] then
  redis.call('HSET', KEYS[1], 'expires_at', ARGV[2])
  redis.call('PEXPIRE', KEYS[1], ARGV[3])
  return 1
end
return 0
"#;

const CAS_SCRIPT: &str = r#"
local cur = redis.call('GET', KEYS[1])
if ARGV[1] == '1' then
  if cur then
    return 0
  end
else
  if cur ~= ARGV[2] then
    return 0
  end
end
redis.call('SET', KEYS[1], ARGV[3])
return 1
"#;

pub struct RedisKv {
    client: redis::Client,
    conn: MultiplexedConnection,
    claim_script: Script,
    acquire_script: Script,
    release_script: Script,
    extend_script: Script,
    cas_script: Script,
}

impl RedisKv {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let mut conn = client.get_multiplexed_async_connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(Self {
            client,
            conn,
            claim_script: Script::new(CLAIM_SCRIPT),
            acquire_script: Script::new(ACQUIRE_LOCK_SCRIPT),
            release_script: Script::new(RELEASE_LOCK_SCRIPT),
            extend_script: Script::new(EXTEND_LOCK_SCRIPT),
            cas_script: Script::new(CAS_SCRIPT),
        })
    }

    fn conn(&self) -> MultiplexedConnection {
        self.conn.clone()
    }
}

#[async_trait]
impl KvBackend for RedisKv {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn();
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn();
        let _: () = conn.set(key, value).await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut conn = self.conn();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn cas_set(&self, key: &str, expected: Option<&str>, new: &str) -> Result<bool> {
        let mut conn = self.conn();
        let took: i64 = self
            .cas_script
            .key(key)
            .arg(if expected.is_none() { "1" } else { "0" })
            .arg(expected.unwrap_or_default())
            .arg(new)
            .invoke_async(&mut conn)
            .await?;
        Ok(took == 1)
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64> {
        let mut conn = self.conn();
        Ok(conn.incr(key, delta).await?)
    }

    async fn incr_by_float(&self, key: &str, delta: f64) -> Result<f64> {
        let mut conn = self.conn();
        Ok(conn.incr(key, delta).await?)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn();
        let _: () = conn.pexpire(key, ttl.as_millis() as i64).await?;
        Ok(())
    }

    async fn hset(&self, key: &str, fields: &[(String, String)]) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn();
        let _: () = conn.hset_multiple(key, fields).await?;
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut conn = self.conn();
        Ok(conn.hget(key, field).await?)
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.conn();
        Ok(conn.hgetall(key).await?)
    }

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        let mut conn = self.conn();
        Ok(conn.hincr(key, field, delta).await?)
    }

    async fn hincr_by_float(&self, key: &str, field: &str, delta: f64) -> Result<f64> {
        let mut conn = self.conn();
        Ok(conn.hincr(key, field, delta).await?)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn();
        let added: i64 = conn.sadd(key, member).await?;
        Ok(added > 0)
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn();
        let removed: i64 = conn.srem(key, member).await?;
        Ok(removed > 0)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn();
        Ok(conn.smembers(key).await?)
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<()> {
        let mut conn = self.conn();
        let _: () = conn.zadd(key, member, score).await?;
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn();
        let removed: i64 = conn.zrem(key, member).await?;
        Ok(removed > 0)
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>> {
        let mut conn = self.conn();
        Ok(conn.zscore(key, member).await?)
    }

    async fn zcard(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn();
        Ok(conn.zcard(key).await?)
    }

    async fn zrange_desc(&self, key: &str, limit: Option<usize>) -> Result<Vec<(String, f64)>> {
        if limit == Some(0) {
            return Ok(Vec::new());
        }
        let stop = limit.map(|l| l as isize - 1).unwrap_or(-1);
        let mut conn = self.conn();
        Ok(conn.zrevrange_withscores(key, 0, stop).await?)
    }

    async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> Result<Vec<String>> {
        let mut conn = self.conn();
        Ok(conn.zrangebyscore(key, min, max).await?)
    }

    async fn zpop_min(&self, key: &str) -> Result<Option<(String, f64)>> {
        let mut conn = self.conn();
        let popped: Vec<(String, f64)> = conn.zpopmin(key, 1).await?;
        Ok(popped.into_iter().next())
    }

    async fn xadd(&self, key: &str, fields: &[(String, String)]) -> Result<String> {
        let mut conn = self.conn();
        Ok(conn.xadd(key, "*", fields).await?)
    }

    async fn xrange_from(
        &self,
        key: &str,
        cursor: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        let mut conn = self.conn();
        // Exclusive start so the cursor entry itself is not replayed.
        let start = if cursor.is_empty() {
            "-".to_string()
        } else {
            format!("({}", cursor)
        };
        let reply: redis::streams::StreamRangeReply =
            conn.xrange_count(key, start, "+", count).await?;
        let mut entries = Vec::with_capacity(reply.ids.len());
        for id in reply.ids {
            let mut fields = HashMap::new();
            for (k, v) in id.map {
                if let Ok(s) = redis::from_redis_value::<String>(&v) {
                    fields.insert(k, s);
                }
            }
            entries.push(StreamEntry { id: id.id, fields });
        }
        Ok(entries)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let mut conn = self.conn();
        let _: i64 = conn.publish(channel, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<KvSubscription> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = channel.to_string();
        tokio::spawn(async move {
            let mut stream = pubsub.into_on_message();
            while let Some(msg) = stream.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(_) => continue,
                };
                if tx.send(payload).is_err() {
                    break;
                }
            }
            debug!(channel = %channel, "pubsub forwarder stopped");
        });
        Ok(KvSubscription::new(rx))
    }

    async fn claim_pending(&self, req: &ClaimRequest) -> Result<bool> {
        let mut conn = self.conn();
        let claimed: i64 = self
            .claim_script
            .key(&req.pending_key)
            .key(&req.task_key)
            .key(&req.by_agent_key)
            .arg(&req.task_id)
            .arg(&req.agent_id)
            .arg(&req.now)
            .invoke_async(&mut conn)
            .await?;
        Ok(claimed == 1)
    }

    async fn acquire_lock(&self, req: &LockWrite) -> Result<bool> {
        let mut conn = self.conn();
        let acquired: i64 = self
            .acquire_script
            .key(&req.lock_key)
            .key(&req.index_key)
            .arg(&req.path)
            .arg(&req.holder)
            .arg(&req.intent)
            .arg(&req.lock_id)
            .arg(&req.acquired_at)
            .arg(&req.expires_at)
            .arg(req.ttl.as_millis() as i64)
            .invoke_async(&mut conn)
            .await?;
        Ok(acquired == 1)
    }

    async fn release_lock(
        &self,
        lock_key: &str,
        index_key: &str,
        path: &str,
        lock_id: &str,
    ) -> Result<bool> {
        let mut conn = self.conn();
        let released: i64 = self
            .release_script
            .key(lock_key)
            .key(index_key)
            .arg(lock_id)
            .arg(path)
            .invoke_async(&mut conn)
            .await?;
        Ok(released == 1)
    }

    async fn extend_lock(
        &self,
        lock_key: &str,
        lock_id: &str,
        new_expires_at: &str,
        ttl: Duration,
    ) -> Result<bool> {
        let mut conn = self.conn();
        let extended: i64 = self
            .extend_script
            .key(lock_key)
            .arg(lock_id)
            .arg(new_expires_at)
            .arg(ttl.as_millis() as i64)
            .invoke_async(&mut conn)
            .await?;
        Ok(extended == 1)
    }
}
