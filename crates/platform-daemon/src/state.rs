//! Shared runtime state for `platform-daemon`.
//!
//! All types here are `Clone`-able (via `Arc`) and handlers receive
//! `State<Arc<AppState>>`, following the teacher's `mqk-daemon::state` split
//! between "what the handlers share" and "how the router wires it".

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

use platform_broker::memory::MemoryBroker;
use platform_config::PlatformConfig;
use platform_execution::CommandBus;
use platform_handlers::Registry;
use platform_inbox::{Consumer, ConsumerConfig, TransientClassifier};
use platform_process::manager::{ProcessManager, ReplyOutcome};
use platform_types::MessageType;

/// Messages broadcast over the internal event bus and surfaced as SSE
/// events (spec §6 `GET /v1/stream`). Grounded in the teacher's `BusMsg`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusMsg {
    Heartbeat { ts_millis: i64 },
    /// A reply (`CommandCompleted` / `CommandFailed` / `CommandTimedOut`)
    /// observed on the default reply topic.
    CommandReply { topic: String, payload: serde_json::Value },
}

/// Static build metadata included in health / status responses.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

/// Point-in-time snapshot returned by `GET /v1/status`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub daemon_uptime_secs: u64,
    pub db_ok: bool,
    pub has_command_table: bool,
}

/// Cloneable (Arc) handle shared across all Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub bus: broadcast::Sender<BusMsg>,
    pub build: BuildInfo,
    pub config: PlatformConfig,
    pub command_bus: Arc<CommandBus<MemoryBroker>>,
    pub process_manager: Arc<ProcessManager<MemoryBroker>>,
}

impl AppState {
    pub fn new(
        pool: PgPool,
        config: PlatformConfig,
        command_bus: Arc<CommandBus<MemoryBroker>>,
        process_manager: Arc<ProcessManager<MemoryBroker>>,
    ) -> Self {
        let (bus, _rx) = broadcast::channel::<BusMsg>(1024);
        Self {
            pool,
            bus,
            build: BuildInfo {
                service: "platform-daemon",
                version: env!("CARGO_PKG_VERSION"),
            },
            config,
            command_bus,
            process_manager,
        }
    }
}

/// Monotonically increasing uptime since first call (process lifetime).
pub fn uptime_secs() -> u64 {
    static START: std::sync::OnceLock<std::time::Instant> = std::sync::OnceLock::new();
    START
        .get_or_init(std::time::Instant::now)
        .elapsed()
        .as_secs()
}

/// Emit a heartbeat SSE every `interval` (spec §6 ambient liveness signal,
/// grounded in `mqk-daemon::state::spawn_heartbeat`).
pub fn spawn_heartbeat(bus: broadcast::Sender<BusMsg>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let ts = chrono::Utc::now().timestamp_millis();
            let _ = bus.send(BusMsg::Heartbeat { ts_millis: ts });
        }
    });
}

/// Bridge replies delivered on the in-process broker's default reply topic
/// two ways: onto the SSE bus (`GET /v1/stream` surfaces command lifecycle
/// events) and into the process manager's `handleReply` (spec §4.8), which
/// is how a process ever advances past its first step — without this, a
/// saga would start but never hear back from the commands it issued.
///
/// A reply's outbox payload is the full wire `Envelope` (see
/// `platform_inbox::consumer::reply_outbox_entry`); `envelope.name` is the
/// step/command name and `envelope.correlation_id` the process id, so a
/// reply that doesn't correlate to any active process (plain HTTP-issued
/// commands have no saga) is simply dropped by `handle_reply` itself.
pub fn spawn_reply_bridge(
    broker: &MemoryBroker,
    bus: broadcast::Sender<BusMsg>,
    process_manager: Arc<ProcessManager<MemoryBroker>>,
    reply_topic: &str,
) {
    let mut rx = broker.subscribe_replies(reply_topic);
    let topic = reply_topic.to_string();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(msg) => {
                    let _ = bus.send(BusMsg::CommandReply {
                        topic: topic.clone(),
                        payload: msg.payload.clone(),
                    });

                    match serde_json::from_value::<platform_types::Envelope>(msg.payload) {
                        Ok(envelope) => {
                            let outcome = match envelope.r#type {
                                MessageType::CommandCompleted => ReplyOutcome::Completed { data: envelope.payload },
                                MessageType::CommandFailed => ReplyOutcome::Failed {
                                    error: envelope
                                        .payload
                                        .get("error")
                                        .and_then(serde_json::Value::as_str)
                                        .unwrap_or("unknown error")
                                        .to_string(),
                                },
                                MessageType::CommandTimedOut => ReplyOutcome::TimedOut,
                                MessageType::CommandRequested => continue,
                            };
                            let branch = envelope.headers.parallel_branch.clone();
                            if let Err(err) = process_manager
                                .handle_reply(
                                    envelope.correlation_id,
                                    envelope.command_id,
                                    &envelope.name,
                                    branch.as_deref(),
                                    outcome,
                                )
                                .await
                            {
                                tracing::error!(%err, "handle_reply failed for delivered reply");
                            }
                        }
                        Err(err) => tracing::warn!(%err, "reply payload did not decode as an Envelope"),
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

/// Subscribe one inbox-guarded consumer loop per registered command type
/// (spec §4.6), deriving each topic from `platform_execution::route`. With
/// no handlers registered (the daemon boots with an empty registry — spec
/// §1 Non-goals: domain handlers register from outside this workspace)
/// this spawns nothing; a deployment that embeds a populated `Registry`
/// gets a live C7 pipeline for free.
///
/// The broker delivers a bare `(topic, payload, headers)` triple with no
/// message-id concept of its own; the inbox dedup key used here is
/// `{command_id}:{retries}`, since a plain `command_id` would be 1:1 with
/// every redelivery of the same command and the inbox's unique
/// `(message_id, handler)` constraint would treat a legitimate retry
/// redelivery as a duplicate of the first, failed attempt.
pub fn spawn_command_consumers(
    pool: PgPool,
    broker: &MemoryBroker,
    registry: Arc<Registry>,
    classifier: TransientClassifier,
    config: ConsumerConfig,
    shutdown: watch::Receiver<bool>,
) {
    for command_type in registry.command_types() {
        let mut rx = broker.subscribe_commands(&platform_execution::route(&command_type));
        let consumer = Consumer::new(pool.clone(), registry.clone(), classifier.clone(), config.clone());
        let dedup_pool = pool.clone();
        let mut shutdown = shutdown.clone();
        let command_type = command_type.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                    received = rx.recv() => {
                        match received {
                            Ok(msg) => {
                                let envelope = match platform_inbox::decode_command_envelope(
                                    &command_type, msg.key.as_deref(), msg.payload, &msg.headers,
                                ) {
                                    Ok(e) => e,
                                    Err(err) => {
                                        tracing::error!(%err, "failed to decode delivered command envelope");
                                        continue;
                                    }
                                };
                                // `{command_id}:{retries}` rather than bare `command_id`: a
                                // redelivery of the same command past a transient failure must
                                // reach the handler again, and the inbox's unique
                                // `(message_id, handler)` constraint would otherwise dedup every
                                // redelivery against the first attempt.
                                let retries = platform_db::commands::find_by_id(&dedup_pool, envelope.command_id)
                                    .await
                                    .ok()
                                    .flatten()
                                    .map(|c| c.retries)
                                    .unwrap_or(0);
                                let message_id = format!("{}:{retries}", envelope.command_id);
                                if let Err(err) = consumer.consume(&message_id, &command_type, &envelope).await {
                                    tracing::error!(%err, "consumer.consume failed");
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(_)) => continue,
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }
        });
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandAcceptedResponse {
    pub command_id: Uuid,
}
