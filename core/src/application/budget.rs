// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Process-wide cap on concurrent LLM calls plus spend accounting.
//!
//! The semaphore is a plain KV counter incremented under the cap with a
//! decrement-on-overshoot double check, so it works on both backends without
//! special primitives. A blown daily budget refuses *new* slots; calls
//! already in flight are never interrupted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::domain::agent::AgentId;
use crate::domain::error::{CoordError, Result};
use crate::infrastructure::kv::KvBackend;
use crate::keys;

const SLOT_POLL: Duration = Duration::from_millis(100);
const MODELS_INDEX: &str = "llm:models";

#[derive(Clone)]
pub struct LlmBudget {
    kv: Arc<dyn KvBackend>,
    max_concurrent: i64,
    daily_budget: Option<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct BudgetStats {
    pub in_flight: i64,
    pub total_tokens: u64,
    pub total_cost: f64,
    pub by_model: HashMap<String, (u64, f64)>,
}

impl LlmBudget {
    pub fn new(kv: Arc<dyn KvBackend>, max_concurrent: u32) -> Self {
        Self {
            kv,
            max_concurrent: max_concurrent as i64,
            daily_budget: None,
        }
    }

    pub fn with_daily_budget(mut self, dollars: f64) -> Self {
        self.daily_budget = Some(dollars);
        self
    }

    /// Take a call slot, blocking up to `timeout` when at capacity. Fails
    /// `BudgetExceeded` immediately when the daily budget is spent.
    pub async fn acquire_slot(&self, timeout: Duration) -> Result<SlotGuard> {
        if let Some(limit) = self.daily_budget {
            let spent = self.total_cost().await?;
            if spent >= limit {
                return Err(CoordError::BudgetExceeded(format!(
                    "daily budget spent: ${:.2} >= ${:.2}",
                    spent, limit
                )));
            }
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let current = self.kv.incr(keys::LLM_SEMAPHORE).await?;
            if current <= self.max_concurrent {
                debug!(in_flight = current, cap = self.max_concurrent, "acquired llm slot");
                return Ok(SlotGuard {
                    kv: self.kv.clone(),
                    released: false,
                });
            }
            // Overshot the cap; undo and wait for a slot to free up.
            self.kv.decr(keys::LLM_SEMAPHORE).await?;
            if tokio::time::Instant::now() + SLOT_POLL > deadline {
                return Err(CoordError::Timeout(format!(
                    "no llm slot within {:?} ({} in flight)",
                    timeout,
                    self.in_flight().await.unwrap_or(self.max_concurrent)
                )));
            }
            tokio::time::sleep(SLOT_POLL).await;
        }
    }

    pub async fn record_usage(
        &self,
        agent_id: AgentId,
        model: &str,
        tokens: u64,
        cost: f64,
    ) -> Result<()> {
        self.kv
            .incr_by(&keys::llm_tokens(model), tokens as i64)
            .await?;
        self.kv
            .incr_by_float(&keys::llm_dollars(model), cost)
            .await?;
        self.kv.sadd(MODELS_INDEX, model).await?;

        let agent_key = keys::llm_by_agent(agent_id);
        self.kv
            .hincr_by(&agent_key, "total_tokens", tokens as i64)
            .await?;
        self.kv
            .hincr_by_float(&agent_key, "total_cost", cost)
            .await?;
        self.kv.hincr_by(&agent_key, "calls", 1).await?;
        debug!(agent_id = %agent_id, model, tokens, cost, "recorded llm usage");
        Ok(())
    }

    pub async fn in_flight(&self) -> Result<i64> {
        Ok(self
            .kv
            .get(keys::LLM_SEMAPHORE)
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }

    pub async fn usage_stats(&self) -> Result<BudgetStats> {
        let mut stats = BudgetStats {
            in_flight: self.in_flight().await?,
            ..Default::default()
        };
        for model in self.kv.smembers(MODELS_INDEX).await? {
            let tokens: u64 = self
                .kv
                .get(&keys::llm_tokens(&model))
                .await?
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            let cost: f64 = self
                .kv
                .get(&keys::llm_dollars(&model))
                .await?
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.0);
            stats.total_tokens += tokens;
            stats.total_cost += cost;
            stats.by_model.insert(model, (tokens, cost));
        }
        Ok(stats)
    }

    /// Zero the spend counters (a daily cron concern). In-flight slots are
    /// left alone.
    pub async fn reset_daily(&self) -> Result<()> {
        for model in self.kv.smembers(MODELS_INDEX).await? {
            self.kv.del(&keys::llm_tokens(&model)).await?;
            self.kv.del(&keys::llm_dollars(&model)).await?;
            self.kv.srem(MODELS_INDEX, &model).await?;
        }
        Ok(())
    }

    async fn total_cost(&self) -> Result<f64> {
        let mut total = 0.0;
        for model in self.kv.smembers(MODELS_INDEX).await? {
            total += self
                .kv
                .get(&keys::llm_dollars(&model))
                .await?
                .and_then(|v| v.parse::<f64>().ok())
                .unwrap_or(0.0);
        }
        Ok(total)
    }
}

/// A held call slot. Release explicitly after the call returns; dropping the
/// guard schedules the release as a safety net.
pub struct SlotGuard {
    kv: Arc<dyn KvBackend>,
    released: bool,
}

impl std::fmt::Debug for SlotGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotGuard")
            .field("released", &self.released)
            .finish()
    }
}

impl SlotGuard {
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        self.kv.decr(keys::LLM_SEMAPHORE).await?;
        Ok(())
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if !self.released {
            let kv = self.kv.clone();
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    if let Err(e) = kv.decr(keys::LLM_SEMAPHORE).await {
                        warn!(error = %e, "deferred llm slot release failed");
                    }
                });
            }
        }
    }
}
