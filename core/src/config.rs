// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use std::path::PathBuf;
use std::time::Duration;

/// Runtime knobs for a coordination session. Loaded from the environment,
/// overridable per-field for tests and embedders.
#[derive(Debug, Clone)]
pub struct CoordConfig {
    /// Connection string for the networked KV.
    pub redis_url: String,
    /// Directory for the file-backed fallback.
    pub fallback_dir: PathBuf,
    /// Cadence of session heartbeats.
    pub heartbeat_interval: Duration,
    /// Heartbeats older than this mark an agent hung.
    pub hung_threshold: Duration,
    /// Default TTL for file locks.
    pub lock_ttl: Duration,
    /// Cadence of the retry and reclamation sweepers.
    pub sweep_interval: Duration,
}

impl Default for CoordConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".into(),
            fallback_dir: default_fallback_dir(),
            heartbeat_interval: Duration::from_secs(30),
            hung_threshold: Duration::from_secs(300),
            lock_ttl: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl CoordConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            redis_url: std::env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            fallback_dir: std::env::var("AGENTCOORD_FALLBACK_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.fallback_dir),
            heartbeat_interval: env_secs("AGENTCOORD_HEARTBEAT_SECONDS")
                .unwrap_or(defaults.heartbeat_interval),
            hung_threshold: env_secs("AGENTCOORD_HUNG_SECONDS")
                .unwrap_or(defaults.hung_threshold),
            lock_ttl: env_secs("AGENTCOORD_LOCK_TTL_SECONDS").unwrap_or(defaults.lock_ttl),
            sweep_interval: env_secs("AGENTCOORD_SWEEP_SECONDS")
                .unwrap_or(defaults.sweep_interval),
        }
    }

    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    pub fn with_fallback_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.fallback_dir = dir.into();
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_hung_threshold(mut self, threshold: Duration) -> Self {
        self.hung_threshold = threshold;
        self
    }

    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}

fn default_fallback_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".agentcoord")
        .join("state")
}

fn env_secs(var: &str) -> Option<Duration> {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = CoordConfig::default();
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(cfg.hung_threshold, Duration::from_secs(300));
        assert_eq!(cfg.lock_ttl, Duration::from_secs(600));
        assert!(cfg.fallback_dir.ends_with(".agentcoord/state"));
    }

    #[test]
    fn test_builder_overrides() {
        let cfg = CoordConfig::default()
            .with_redis_url("redis://kv.internal:6380")
            .with_hung_threshold(Duration::from_secs(5));
        assert_eq!(cfg.redis_url, "redis://kv.internal:6380");
        assert_eq!(cfg.hung_threshold, Duration::from_secs(5));
    }
}
