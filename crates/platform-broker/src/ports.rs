use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;

/// Send a message to the command queue. Blocking in the sense that a
/// successful return means the broker accepted the message persistently —
/// whatever "persistently" means for the concrete broker (spec §4.2).
#[async_trait]
pub trait CommandQueuePort: Send + Sync {
    async fn send(&self, topic: &str, payload: &Value, headers: &BTreeMap<String, String>)
        -> anyhow::Result<()>;
}

/// Identical contract to [`CommandQueuePort`], kept as a distinct trait
/// because a real deployment may route replies to a different broker
/// cluster/credentials than commands (spec §4.2).
#[async_trait]
pub trait ReplyQueuePort: Send + Sync {
    async fn send(&self, topic: &str, payload: &Value, headers: &BTreeMap<String, String>)
        -> anyhow::Result<()>;
}

/// Publish to an event topic. May batch internally; success means the
/// durability boundary was crossed (spec §4.2).
#[async_trait]
pub trait EventsPort: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: &Value,
        headers: &BTreeMap<String, String>,
    ) -> anyhow::Result<()>;
}

/// Optional best-effort notification channel that wakes a bounded worker
/// pool to publish a specific outbox row ahead of the next scheduled sweep
/// (spec §4.2, §4.5 `publishNow`). Failures here are swallowed by callers —
/// correctness never depends on this path, only latency does.
#[async_trait]
pub trait FastPathPort: Send + Sync {
    async fn notify(&self, outbox_id: i64) -> anyhow::Result<()>;
}
