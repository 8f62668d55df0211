use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use platform_db::{commands, dlq, outbox};
use platform_handlers::{HandlerContext, Registry};
use platform_types::{
    Envelope, EnvelopeHeaders, MessageType, NewDlqRecord, NewOutboxEntry, OutboxCategory,
};

use crate::classifier::TransientClassifier;

pub const DEFAULT_REPLY_TOPIC: &str = "APP.CMD.REPLY.Q";

/// What happened to one inbound message (spec §4.6 steps 1-8).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// `inbox.insertIfAbsent` found an existing row — already handled.
    Duplicate,
    /// The command row was already terminal; this delivery is a late
    /// redelivery of a command whose outcome is already durable.
    AlreadyTerminal,
    Succeeded,
    /// Transient failure, retry budget remains: left `RUNNING`, retries
    /// incremented, no reply emitted — the broker will redeliver.
    RetryScheduled,
    /// Permanent failure, or transient failure with retries exhausted:
    /// `CommandFailed` reply emitted, command `FAILED`, parked in the DLQ.
    Failed,
    /// Resolved via registry lookup failure (`UNKNOWN_COMMAND`).
    UnknownCommand,
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub handler_lease: Duration,
    pub max_retries_default: i32,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            handler_lease: Duration::from_secs(30),
            max_retries_default: 3,
        }
    }
}

/// The inbox-guarded consumer (spec §4.6): every inbound message passes
/// through exactly one [`Consumer::consume`] call.
pub struct Consumer {
    pool: PgPool,
    registry: Arc<Registry>,
    classifier: TransientClassifier,
    config: ConsumerConfig,
}

impl Consumer {
    pub fn new(
        pool: PgPool,
        registry: Arc<Registry>,
        classifier: TransientClassifier,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            pool,
            registry,
            classifier,
            config,
        }
    }

    #[tracing::instrument(skip(self, envelope), fields(command_id = %envelope.command_id, name = %envelope.name))]
    pub async fn consume(
        &self,
        message_id: &str,
        handler_name: &str,
        envelope: &Envelope,
    ) -> anyhow::Result<ConsumeOutcome> {
        let first_delivery = platform_db::inbox::insert_if_absent(&self.pool, message_id, handler_name).await?;
        if !first_delivery {
            tracing::debug!("duplicate delivery, acking without re-invoking handler");
            return Ok(ConsumeOutcome::Duplicate);
        }

        let lease_until = Utc::now()
            + chrono::Duration::from_std(self.config.handler_lease)
                .unwrap_or_else(|_| chrono::Duration::seconds(30));
        let promoted = commands::mark_running(&self.pool, envelope.command_id, lease_until).await?;
        if !promoted {
            tracing::debug!("command already terminal, late redelivery ignored");
            return Ok(ConsumeOutcome::AlreadyTerminal);
        }

        let handler = match self.registry.resolve(&envelope.name) {
            Ok(handler) => handler,
            Err(err) => {
                tracing::error!(%err, "no handler registered for command");
                self.fail(envelope, "UNKNOWN_COMMAND", &err.to_string()).await?;
                return Ok(ConsumeOutcome::UnknownCommand);
            }
        };

        let ctx = HandlerContext {
            command_id: envelope.command_id,
            command_name: envelope.name.clone(),
            business_key: envelope.key.clone(),
        };

        match handler.handle(&ctx, envelope.payload.clone()).await {
            Ok(result) => {
                self.succeed(envelope, result).await?;
                Ok(ConsumeOutcome::Succeeded)
            }
            Err(handler_err) => {
                let message = handler_err.0;
                let current = commands::find_by_id(&self.pool, envelope.command_id)
                    .await?
                    .ok_or_else(|| anyhow::anyhow!("command vanished mid-flight"))?;

                let transient = self.classifier.is_transient(&envelope.name, &message);
                if transient && current.retries < self.config.max_retries_default {
                    commands::increment_retries(&self.pool, envelope.command_id).await?;
                    tracing::warn!(%message, retries = current.retries + 1, "transient failure, leaving for redelivery");
                    Ok(ConsumeOutcome::RetryScheduled)
                } else {
                    self.fail(envelope, "HANDLER_ERROR", &message).await?;
                    Ok(ConsumeOutcome::Failed)
                }
            }
        }
    }

    async fn succeed(&self, envelope: &Envelope, result: Value) -> anyhow::Result<()> {
        let reply = reply_envelope(envelope, MessageType::CommandCompleted, result);
        let outbox_entry = reply_outbox_entry(&reply);

        platform_db::with_tx(&self.pool, move |tx| {
            let outbox_entry = outbox_entry.clone();
            async move {
                commands::mark_terminal(&mut **tx, envelope.command_id, platform_types::CommandStatus::Succeeded, None).await?;
                outbox::insert_returning_id(&mut **tx, &outbox_entry).await?;
                anyhow::Ok(())
            }
        })
        .await
    }

    async fn fail(&self, envelope: &Envelope, error_class: &str, error_message: &str) -> anyhow::Result<()> {
        let reply = reply_envelope(
            envelope,
            MessageType::CommandFailed,
            serde_json::json!({"error": error_message}),
        );
        let outbox_entry = reply_outbox_entry(&reply);

        let command_name = envelope.name.clone();
        let business_key = envelope.key.clone();
        let payload = envelope.payload.clone();
        let command_id = envelope.command_id;
        let error_class = error_class.to_string();
        let error_message = error_message.to_string();

        platform_db::with_tx(&self.pool, move |tx| {
            let outbox_entry = outbox_entry.clone();
            let error_class = error_class.clone();
            let error_message = error_message.clone();
            let command_name = command_name.clone();
            let business_key = business_key.clone();
            let payload = payload.clone();
            async move {
                commands::mark_terminal(
                    &mut **tx,
                    command_id,
                    platform_types::CommandStatus::Failed,
                    Some(&error_message),
                )
                .await?;
                let attempts = commands::find_by_id(&mut **tx, command_id)
                    .await
                    .ok()
                    .flatten()
                    .map(|c| c.retries)
                    .unwrap_or_default();
                outbox::insert_returning_id(&mut **tx, &outbox_entry).await?;
                dlq::park(
                    &mut **tx,
                    &NewDlqRecord {
                        command_id,
                        command_name,
                        business_key,
                        payload,
                        failed_status: "FAILED".to_string(),
                        error_class,
                        error_message,
                        attempts,
                        parked_by: "platform-inbox".to_string(),
                    },
                )
                .await?;
                anyhow::Ok(())
            }
        })
        .await
    }
}

fn reply_topic(headers: &EnvelopeHeaders) -> String {
    headers
        .reply_to
        .clone()
        .unwrap_or_else(|| DEFAULT_REPLY_TOPIC.to_string())
}

fn reply_envelope(original: &Envelope, r#type: MessageType, payload: Value) -> Envelope {
    Envelope {
        message_id: Uuid::new_v4(),
        r#type,
        name: original.name.clone(),
        command_id: original.command_id,
        correlation_id: original.correlation_id,
        causation_id: original.command_id,
        occurred_at: Utc::now(),
        key: original.key.clone(),
        headers: original.headers.clone(),
        payload,
    }
}

fn reply_outbox_entry(reply: &Envelope) -> NewOutboxEntry {
    NewOutboxEntry {
        category: OutboxCategory::Reply,
        topic: reply_topic(&reply.headers),
        key: reply.key.clone(),
        r#type: format!("{:?}", reply.r#type),
        payload: serde_json::to_value(reply).unwrap_or(Value::Null),
        headers: Default::default(),
    }
}
