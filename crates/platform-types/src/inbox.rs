use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Dedup record keyed by `(message_id, handler)` (spec §3 "Inbox record").
///
/// First insert wins. `platform-db`'s `insert_if_absent` relies on a unique
/// constraint over `(message_id, handler)` and treats a constraint
/// violation as "already processed" rather than an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxRecord {
    pub id: i64,
    pub message_id: String,
    pub handler: String,
    pub processed_at: DateTime<Utc>,
}
