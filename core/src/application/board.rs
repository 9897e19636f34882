// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::domain::agent::AgentId;
use crate::domain::board::{BoardThread, Message, MessagePriority, Post, ThreadId};
use crate::domain::error::{CoordError, Result};
use crate::domain::events::BoardEvent;
use crate::domain::now_iso;
use crate::infrastructure::kv::{KvBackend, KvSubscription};
use crate::keys;

/// Threaded messages over the KV, with pub/sub fan-out per named channel.
#[derive(Clone)]
pub struct Board {
    kv: Arc<dyn KvBackend>,
}

impl Board {
    pub fn new(kv: Arc<dyn KvBackend>) -> Self {
        Self { kv }
    }

    pub async fn create_thread(
        &self,
        channel: &str,
        title: &str,
        author: AgentId,
        body: &str,
    ) -> Result<BoardThread> {
        let mut thread = BoardThread::new(channel, title, author);
        thread.posts.push(Post {
            author,
            timestamp: Utc::now(),
            body: body.to_string(),
            priority: MessagePriority::Normal,
        });
        self.store(&thread).await?;
        self.kv
            .sadd(keys::BOARD_THREADS_INDEX, &thread.id.to_string())
            .await?;
        self.notify(&thread, "thread_created").await;
        info!(thread_id = %thread.id, channel, title, "posted thread");
        Ok(thread)
    }

    pub async fn reply(
        &self,
        thread_id: ThreadId,
        author: AgentId,
        body: &str,
        priority: MessagePriority,
    ) -> Result<BoardThread> {
        let mut thread = self.get_thread(thread_id).await?;
        thread.posts.push(Post {
            author,
            timestamp: Utc::now(),
            body: body.to_string(),
            priority,
        });
        self.store(&thread).await?;
        self.notify(&thread, "thread_reply").await;
        Ok(thread)
    }

    pub async fn pin_thread(&self, thread_id: ThreadId, pinned: bool) -> Result<()> {
        let mut thread = self.get_thread(thread_id).await?;
        thread.pinned = pinned;
        self.store(&thread).await
    }

    pub async fn get_thread(&self, thread_id: ThreadId) -> Result<BoardThread> {
        let fields = self.kv.hgetall(&keys::board_thread(thread_id)).await?;
        if fields.is_empty() {
            return Err(CoordError::UnknownThread(thread_id.to_string()));
        }
        BoardThread::from_fields(&fields)
    }

    /// Newest first; pinned threads float to the top.
    pub async fn list_threads(&self, channel: Option<&str>) -> Result<Vec<BoardThread>> {
        let mut threads = Vec::new();
        for raw in self.kv.smembers(keys::BOARD_THREADS_INDEX).await? {
            let id = ThreadId::parse(&raw)?;
            match self.get_thread(id).await {
                Ok(thread) => {
                    if channel.map_or(true, |c| thread.channel == c) {
                        threads.push(thread);
                    }
                }
                Err(CoordError::UnknownThread(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        threads.sort_by(|a, b| {
            b.pinned
                .cmp(&a.pinned)
                .then_with(|| b.created_at.cmp(&a.created_at))
        });
        Ok(threads)
    }

    /// Fire-and-forget broadcast of a structured message to its channel
    /// topic. Listeners (dashboards, adapters) pick it up via subscribe.
    pub async fn broadcast(&self, message: &Message) -> Result<()> {
        let channel = message
            .channel
            .as_deref()
            .ok_or_else(|| CoordError::Serialization("message has no channel".into()))?;
        let payload = serde_json::to_string(message)?;
        self.kv
            .publish(&keys::board_channel(channel), &payload)
            .await
    }

    pub async fn subscribe_channel(&self, channel: &str) -> Result<KvSubscription> {
        self.kv.subscribe(&keys::board_channel(channel)).await
    }

    async fn store(&self, thread: &BoardThread) -> Result<()> {
        self.kv
            .hset(&keys::board_thread(thread.id), &thread.to_fields())
            .await
    }

    async fn notify(&self, thread: &BoardThread, event_type: &str) {
        let event = BoardEvent {
            event_type: event_type.to_string(),
            thread_id: thread.id.to_string(),
            channel: thread.channel.clone(),
            title: thread.title.clone(),
            author: thread
                .posts
                .last()
                .map(|p| p.author.to_string())
                .unwrap_or_else(|| thread.created_by.to_string()),
            timestamp: now_iso(),
        };
        if let Ok(payload) = serde_json::to_string(&event) {
            if let Err(e) = self
                .kv
                .publish(&keys::board_channel(&thread.channel), &payload)
                .await
            {
                warn!(thread_id = %thread.id, error = %e, "board notify failed");
            }
        }
    }
}
