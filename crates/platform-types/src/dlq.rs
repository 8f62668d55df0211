use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Immutable parking row for a command that failed permanently or exhausted
/// its retries (spec §3 "Dead-letter record").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqRecord {
    pub id: i64,
    pub command_id: Uuid,
    pub command_name: String,
    pub business_key: Option<String>,
    pub payload: Value,
    pub failed_status: String,
    pub error_class: String,
    pub error_message: String,
    pub attempts: i32,
    pub parked_by: String,
    pub parked_at: DateTime<Utc>,
}

/// Fields needed to park a command.
#[derive(Debug, Clone)]
pub struct NewDlqRecord {
    pub command_id: Uuid,
    pub command_name: String,
    pub business_key: Option<String>,
    pub payload: Value,
    pub failed_status: String,
    pub error_class: String,
    pub error_message: String,
    pub attempts: i32,
    pub parked_by: String,
}
