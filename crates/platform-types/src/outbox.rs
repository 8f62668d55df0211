use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What an outbox row ultimately gets routed to (spec §3 "Outbox entry").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxCategory {
    Command,
    Reply,
    Event,
}

impl OutboxCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            OutboxCategory::Command => "command",
            OutboxCategory::Reply => "reply",
            OutboxCategory::Event => "event",
        }
    }
}

impl std::str::FromStr for OutboxCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "command" => Ok(OutboxCategory::Command),
            "reply" => Ok(OutboxCategory::Reply),
            "event" => Ok(OutboxCategory::Event),
            other => Err(format!("unknown outbox category: {other}")),
        }
    }
}

/// Outbox row status (spec §3). `Published` is terminal; `attempts` is
/// non-decreasing across the row's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    New,
    Claimed,
    Sending,
    Published,
    Failed,
}

impl std::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OutboxStatus::New => "NEW",
            OutboxStatus::Claimed => "CLAIMED",
            OutboxStatus::Sending => "SENDING",
            OutboxStatus::Published => "PUBLISHED",
            OutboxStatus::Failed => "FAILED",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for OutboxStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NEW" => Ok(OutboxStatus::New),
            "CLAIMED" => Ok(OutboxStatus::Claimed),
            "SENDING" => Ok(OutboxStatus::Sending),
            "PUBLISHED" => Ok(OutboxStatus::Published),
            "FAILED" => Ok(OutboxStatus::Failed),
            other => Err(format!("unknown outbox status: {other}")),
        }
    }
}

/// A durable outbox row (spec §3 "Outbox entry").
///
/// `id` is a monotonic 64-bit identity (Postgres `bigserial`), used both as
/// the claim unit and as the natural `created_at`-adjacent ordering key for
/// best-effort per-key ordering within a claimed batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: i64,
    pub category: OutboxCategory,
    pub topic: String,
    pub key: Option<String>,
    pub r#type: String,
    pub payload: Value,
    pub headers: BTreeMap<String, String>,
    pub status: OutboxStatus,
    pub attempts: i32,
    pub next_at: Option<DateTime<Utc>>,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Fields needed to insert a new `NEW` outbox row, co-committed with
/// whatever business-state write produced it (command insert, handler
/// reply, process step issuance).
#[derive(Debug, Clone)]
pub struct NewOutboxEntry {
    pub category: OutboxCategory,
    pub topic: String,
    pub key: Option<String>,
    pub r#type: String,
    pub payload: Value,
    pub headers: BTreeMap<String, String>,
}

/// A row claimed for publishing, returned by `claim_batch` / `claim_if_new`.
/// Distinguished from [`OutboxEntry`] only by intent: callers that hold a
/// `ClaimedOutboxRow` are expected to follow up with `mark_published` or
/// `reschedule`, never to read it for any other purpose.
pub type ClaimedOutboxRow = OutboxEntry;

/// `backoff(attempt) = min(base * 2^attempt, max_backoff)` (spec §8).
/// `attempt` is 0-based: the first retry after an initial failure uses
/// `attempt = 0` and therefore waits exactly `base`.
pub fn exponential_backoff(
    attempt: u32,
    base: std::time::Duration,
    max_backoff: std::time::Duration,
) -> std::time::Duration {
    let scale = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    let candidate = base.as_millis().saturating_mul(scale as u128);
    let capped = candidate.min(max_backoff.as_millis());
    std::time::Duration::from_millis(capped as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn backoff_saturates_at_cap() {
        let base = Duration::from_secs(1);
        let cap = Duration::from_secs(300);
        assert_eq!(exponential_backoff(0, base, cap), Duration::from_secs(1));
        assert_eq!(exponential_backoff(1, base, cap), Duration::from_secs(2));
        assert_eq!(exponential_backoff(8, base, cap), Duration::from_secs(256));
        // 2^9 = 512s > 300s cap.
        assert_eq!(exponential_backoff(9, base, cap), Duration::from_secs(300));
        assert_eq!(exponential_backoff(40, base, cap), Duration::from_secs(300));
    }
}
