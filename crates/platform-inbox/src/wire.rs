//! Decodes a broker-delivered command message back into the wire
//! [`Envelope`] the inbox-guarded consumer expects.
//!
//! The command bus and process manager encode `correlation_id`,
//! `causation_id`, `command_id` and (for a parallel branch) `parallel_branch`
//! as plain string headers on the outbox row (spec §4.4, §4.8) rather than
//! shipping a full envelope on the command side — `decode_command_envelope`
//! is the inverse of that encoding, the boundary every concrete broker
//! adapter (today: `platform-broker::memory`) must cross before handing a
//! delivery to [`crate::Consumer::consume`].

use std::collections::BTreeMap;

use anyhow::Context;
use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use platform_types::{Envelope, EnvelopeHeaders, MessageType};

pub fn decode_command_envelope(
    name: &str,
    key: Option<&str>,
    payload: Value,
    headers: &BTreeMap<String, String>,
) -> anyhow::Result<Envelope> {
    let command_id: Uuid = headers
        .get("command_id")
        .context("delivered command is missing its command_id header")?
        .parse()
        .context("command_id header is not a valid uuid")?;
    let correlation_id: Uuid = headers
        .get("correlation_id")
        .context("delivered command is missing its correlation_id header")?
        .parse()
        .context("correlation_id header is not a valid uuid")?;
    let causation_id: Uuid = headers
        .get("causation_id")
        .map(|s| s.parse())
        .transpose()
        .context("causation_id header is not a valid uuid")?
        .unwrap_or(command_id);

    let mut extra = headers.clone();
    for known in ["command_id", "correlation_id", "causation_id", "idempotency_key", "parallel_branch"] {
        extra.remove(known);
    }

    Ok(Envelope {
        message_id: Uuid::new_v4(),
        r#type: MessageType::CommandRequested,
        name: name.to_string(),
        command_id,
        correlation_id,
        causation_id,
        occurred_at: Utc::now(),
        key: key.map(str::to_string),
        headers: EnvelopeHeaders {
            reply_to: None,
            tenant_id: None,
            schema_version: "1".to_string(),
            idempotency_key: headers.get("idempotency_key").cloned(),
            parallel_branch: headers.get("parallel_branch").cloned(),
            trace_id: None,
            span_id: None,
            extra,
        },
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_headers_into_the_matching_envelope_fields() {
        let command_id = Uuid::new_v4();
        let correlation_id = Uuid::new_v4();
        let mut headers = BTreeMap::new();
        headers.insert("command_id".to_string(), command_id.to_string());
        headers.insert("correlation_id".to_string(), correlation_id.to_string());
        headers.insert("parallel_branch".to_string(), "BookFx".to_string());

        let envelope =
            decode_command_envelope("BookFx", Some("order-1"), serde_json::json!({"a": 1}), &headers).unwrap();

        assert_eq!(envelope.command_id, command_id);
        assert_eq!(envelope.correlation_id, correlation_id);
        assert_eq!(envelope.causation_id, command_id);
        assert_eq!(envelope.headers.parallel_branch.as_deref(), Some("BookFx"));
        assert_eq!(envelope.key.as_deref(), Some("order-1"));
    }

    #[test]
    fn missing_command_id_header_is_rejected() {
        let headers = BTreeMap::new();
        assert!(decode_command_envelope("BookFx", None, Value::Null, &headers).is_err());
    }
}
