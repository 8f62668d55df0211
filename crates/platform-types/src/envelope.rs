use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// The four message types that cross the broker boundary (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    CommandRequested,
    CommandCompleted,
    CommandFailed,
    CommandTimedOut,
}

/// Headers carried on every envelope (spec §6, bit-exact shape).
///
/// `parallel_branch` is set only when the command was issued as one branch
/// of a process's parallel fan-out (spec §4.8 `executeStep`); the process
/// manager reads it back off the reply to know which branch completed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvelopeHeaders {
    pub reply_to: Option<String>,
    pub tenant_id: Option<String>,
    pub schema_version: String,
    pub idempotency_key: Option<String>,
    pub parallel_branch: Option<String>,
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, String>,
}

impl EnvelopeHeaders {
    pub fn new() -> Self {
        Self {
            schema_version: "1".to_string(),
            ..Default::default()
        }
    }
}

/// Bit-exact wire envelope (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub message_id: Uuid,
    pub r#type: MessageType,
    pub name: String,
    pub command_id: Uuid,
    pub correlation_id: Uuid,
    pub causation_id: Uuid,
    pub occurred_at: DateTime<Utc>,
    pub key: Option<String>,
    pub headers: EnvelopeHeaders,
    pub payload: Value,
}
