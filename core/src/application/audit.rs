// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use std::sync::Arc;

use tracing::warn;

use crate::domain::audit::{AuditEntry, AuditKind};
use crate::domain::error::Result;
use crate::domain::now_iso;
use crate::infrastructure::kv::KvBackend;
use crate::keys;

/// Append-only decision log over the KV stream. Entries are never modified
/// or deleted; the stream id totally orders them.
#[derive(Clone)]
pub struct AuditLog {
    kv: Arc<dyn KvBackend>,
}

impl AuditLog {
    pub fn new(kv: Arc<dyn KvBackend>) -> Self {
        Self { kv }
    }

    pub async fn record(
        &self,
        agent_id: &str,
        kind: AuditKind,
        context: &str,
        reason: &str,
    ) -> Result<String> {
        let fields = vec![
            ("agent_id".to_string(), agent_id.to_string()),
            ("kind".to_string(), kind.as_str().to_string()),
            ("context".to_string(), context.to_string()),
            ("reason".to_string(), reason.to_string()),
            ("timestamp".to_string(), now_iso()),
        ];
        self.kv.xadd(keys::AUDIT_DECISIONS, &fields).await
    }

    /// Best-effort emission from inside other operations: a broken audit
    /// stream must never fail the operation it describes.
    pub(crate) async fn emit(&self, agent_id: &str, kind: AuditKind, context: &str, reason: &str) {
        if let Err(e) = self.record(agent_id, kind, context, reason).await {
            warn!(error = %e, context, "audit emission failed");
        }
    }

    /// Replay entries strictly after `cursor` (empty = from the beginning).
    pub async fn read_from(&self, cursor: &str, count: usize) -> Result<Vec<AuditEntry>> {
        let entries = self
            .kv
            .xrange_from(keys::AUDIT_DECISIONS, cursor, count)
            .await?;
        Ok(entries
            .into_iter()
            .map(|e| {
                let get = |k: &str| e.fields.get(k).cloned().unwrap_or_default();
                AuditEntry {
                    seq: e.id,
                    timestamp: get("timestamp"),
                    agent_id: get("agent_id"),
                    kind: get("kind"),
                    context: get("context"),
                    reason: get("reason"),
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::kv::FileKv;

    fn log() -> (tempfile::TempDir, AuditLog) {
        let dir = tempfile::tempdir().unwrap();
        let kv: Arc<dyn KvBackend> = Arc::new(FileKv::open(dir.path()).unwrap());
        (dir, AuditLog::new(kv))
    }

    #[tokio::test]
    async fn test_cursor_excludes_seen_entries() {
        let (_dir, log) = log();
        log.record("agent-1", AuditKind::TaskClaim, "task-a", "claimed")
            .await
            .unwrap();
        log.record("agent-1", AuditKind::TaskCompleted, "task-a", "done")
            .await
            .unwrap();
        log.record("agent-2", AuditKind::LockConflict, "src/main.rs", "held")
            .await
            .unwrap();

        let all = log.read_from("", 10).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].kind, "task_claim");
        assert_eq!(all[1].kind, "task_completed");
        assert_eq!(all[2].kind, "lock_conflict");
        assert_eq!(all[2].agent_id, "agent-2");

        // Strictly after: the cursor entry itself is not replayed.
        let rest = log.read_from(&all[0].seq, 10).await.unwrap();
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[0].seq, all[1].seq);

        let nothing = log.read_from(&all[2].seq, 10).await.unwrap();
        assert!(nothing.is_empty());
    }

    #[tokio::test]
    async fn test_count_bounds_each_page() {
        let (_dir, log) = log();
        for i in 0..5 {
            log.record(
                "agent-1",
                AuditKind::Deployment,
                &format!("release-{}", i),
                "",
            )
            .await
            .unwrap();
        }

        // Page through with count=2 and reassemble the full log in order.
        let mut cursor = String::new();
        let mut replayed = Vec::new();
        loop {
            let page = log.read_from(&cursor, 2).await.unwrap();
            if page.is_empty() {
                break;
            }
            assert!(page.len() <= 2);
            cursor = page.last().unwrap().seq.clone();
            replayed.extend(page);
        }
        assert_eq!(replayed.len(), 5);
        let contexts: Vec<&str> = replayed.iter().map(|e| e.context.as_str()).collect();
        assert_eq!(
            contexts,
            vec!["release-0", "release-1", "release-2", "release-3", "release-4"]
        );
    }
}
