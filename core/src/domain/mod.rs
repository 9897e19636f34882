// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod agent;
pub mod approval;
pub mod audit;
pub mod board;
pub mod error;
pub mod events;
pub mod lock;
pub mod task;
pub mod worker;

use chrono::{DateTime, Utc};

/// Current instant as the ISO-8601 string stored in the KV.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

pub fn parse_iso(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

pub fn epoch_ms(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}
