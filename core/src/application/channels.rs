// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Channel adapter contract and fan-out.
//!
//! Adapters (terminal, file, Slack, Discord, ...) live outside the core and
//! plug in through [`ChannelAdapter`]. A missing or failing adapter never
//! affects core behavior; the manager just reports per-adapter outcomes.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::domain::board::{BoardThread, Message, Post};
use crate::domain::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelFeature {
    Threads,
    DirectMessages,
    Priorities,
}

#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Adapters opt in to features; everything defaults to unsupported and
    /// the manager flattens accordingly.
    fn supports(&self, _feature: ChannelFeature) -> bool {
        false
    }

    async fn post(&self, message: &Message) -> Result<()>;

    /// Direct message. Adapters without DM support get the message as a post.
    async fn dm(&self, message: &Message) -> Result<()> {
        self.post(message).await
    }

    /// Thread creation for adapters that support it; others ignore it and
    /// will see replies flattened into posts.
    async fn create_thread(&self, _thread: &BoardThread) -> Result<()> {
        Ok(())
    }

    async fn reply(&self, thread: &BoardThread, post: &Post) -> Result<()> {
        // Flatten gracefully: a reply becomes an indented post.
        let flattened = Message {
            content: format!("  ↳ [{}] {}", thread.title, post.body),
            from_agent: post.author,
            to_agent: None,
            channel: Some(thread.channel.clone()),
            priority: post.priority,
            kind: crate::domain::board::MessageType::Status,
            thread_id: Some(thread.id),
            timestamp: post.timestamp,
            metadata: serde_json::Value::Null,
        };
        self.post(&flattened).await
    }
}

/// Fans each message out to every enabled adapter, returning per-adapter
/// success so callers can decide whether partial delivery matters.
#[derive(Default)]
pub struct ChannelManager {
    adapters: Vec<Arc<dyn ChannelAdapter>>,
}

impl ChannelManager {
    pub fn new() -> Self {
        Self {
            adapters: Vec::new(),
        }
    }

    pub fn add(&mut self, adapter: Arc<dyn ChannelAdapter>) {
        debug!(adapter = adapter.name(), "registered channel adapter");
        self.adapters.push(adapter);
    }

    pub fn names(&self) -> Vec<String> {
        self.adapters.iter().map(|a| a.name().to_string()).collect()
    }

    pub async fn broadcast(&self, message: &Message) -> Vec<(String, Result<()>)> {
        let mut results = Vec::with_capacity(self.adapters.len());
        for adapter in &self.adapters {
            let outcome = if message.to_agent.is_some()
                && adapter.supports(ChannelFeature::DirectMessages)
            {
                adapter.dm(message).await
            } else {
                adapter.post(message).await
            };
            results.push((adapter.name().to_string(), outcome));
        }
        results
    }

    pub async fn announce_thread(&self, thread: &BoardThread) -> Vec<(String, Result<()>)> {
        let mut results = Vec::with_capacity(self.adapters.len());
        for adapter in &self.adapters {
            let outcome = if adapter.supports(ChannelFeature::Threads) {
                adapter.create_thread(thread).await
            } else if let Some(post) = thread.posts.first() {
                adapter.reply(thread, post).await
            } else {
                Ok(())
            };
            results.push((adapter.name().to_string(), outcome));
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::agent::AgentId;
    use crate::domain::error::CoordError;
    use std::sync::Mutex;

    struct RecordingAdapter {
        name: &'static str,
        posts: Mutex<Vec<String>>,
        dms: Mutex<Vec<String>>,
        threads: bool,
        fail: bool,
    }

    impl RecordingAdapter {
        fn new(name: &'static str) -> Self {
            Self {
                name,
                posts: Mutex::new(Vec::new()),
                dms: Mutex::new(Vec::new()),
                threads: false,
                fail: false,
            }
        }
    }

    #[async_trait]
    impl ChannelAdapter for RecordingAdapter {
        fn name(&self) -> &str {
            self.name
        }

        fn supports(&self, feature: ChannelFeature) -> bool {
            match feature {
                ChannelFeature::Threads => self.threads,
                ChannelFeature::DirectMessages => true,
                ChannelFeature::Priorities => false,
            }
        }

        async fn post(&self, message: &Message) -> Result<()> {
            if self.fail {
                return Err(CoordError::Backend("adapter down".into()));
            }
            self.posts.lock().unwrap().push(message.content.clone());
            Ok(())
        }

        async fn dm(&self, message: &Message) -> Result<()> {
            self.dms.lock().unwrap().push(message.content.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_broadcast_fans_out() {
        let a = Arc::new(RecordingAdapter::new("terminal"));
        let b = Arc::new(RecordingAdapter::new("slack"));
        let mut manager = ChannelManager::new();
        manager.add(a.clone());
        manager.add(b.clone());

        let msg = Message::announcement(AgentId::new(), "general", "hello everyone");
        let results = manager.broadcast(&msg).await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|(_, r)| r.is_ok()));
        assert_eq!(a.posts.lock().unwrap().len(), 1);
        assert_eq!(b.posts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_direct_message_routes_to_dm() {
        let a = Arc::new(RecordingAdapter::new("terminal"));
        let mut manager = ChannelManager::new();
        manager.add(a.clone());

        let msg = Message::direct(AgentId::new(), AgentId::new(), "psst");
        manager.broadcast(&msg).await;
        assert_eq!(a.dms.lock().unwrap().len(), 1);
        assert!(a.posts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failing_adapter_does_not_block_others() {
        let mut bad = RecordingAdapter::new("webhook");
        bad.fail = true;
        let good = Arc::new(RecordingAdapter::new("terminal"));
        let mut manager = ChannelManager::new();
        manager.add(Arc::new(bad));
        manager.add(good.clone());

        let msg = Message::announcement(AgentId::new(), "general", "still delivered");
        let results = manager.broadcast(&msg).await;
        assert!(results[0].1.is_err());
        assert!(results[1].1.is_ok());
        assert_eq!(good.posts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_threadless_adapter_gets_flattened_reply() {
        let a = Arc::new(RecordingAdapter::new("terminal"));
        let mut manager = ChannelManager::new();
        manager.add(a.clone());

        let author = AgentId::new();
        let mut thread = BoardThread::new("general", "release plan", author);
        thread.posts.push(Post {
            author,
            timestamp: chrono::Utc::now(),
            body: "v2 goes out friday".into(),
            priority: crate::domain::board::MessagePriority::Normal,
        });
        manager.announce_thread(&thread).await;
        let posts = a.posts.lock().unwrap();
        assert_eq!(posts.len(), 1);
        assert!(posts[0].contains("release plan"));
        assert!(posts[0].starts_with("  ↳"));
    }
}
