//! Scenario-test harness (spec §13).
//!
//! Grounded in the teacher's `mqk-testkit::Orchestrator`: one struct that
//! owns the whole wiring for a scenario and exposes a handful of `drive_*`
//! methods a test calls explicitly instead of sleeping for a ticker —
//! `Orchestrator` composes the trading engines into a single offline loop;
//! `TestHarness` composes the command bus, relay, inbox consumer and
//! process manager into the same shape, but driven by the caller one hop
//! at a time so a scenario test can assert between each.
//!
//! The harness talks to a real (disposable) Postgres schema — `claim_batch`,
//! `with_tx` and friends are exercised for real, only the broker is the
//! in-process stand-in every other part of this workspace already uses.

pub mod fixtures;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use sqlx::PgPool;
use tokio::sync::broadcast;
use uuid::Uuid;

use platform_broker::memory::{DeliveredMessage, MemoryBroker};
use platform_broker::ports::CommandQueuePort;
use platform_broker::router::BrokerRouter;
use platform_db::Capabilities;
use platform_execution::CommandBus;
use platform_handlers::{Registration, Registry};
use platform_inbox::{ConsumeOutcome, Consumer, ConsumerConfig, TransientClassifier};
use platform_process::manager::{ManagerConfig, ProcessConfiguration, ProcessManager, ReplyOutcome};
use platform_types::{Envelope, MessageType, ProcessInstance, ProcessLogEntry};

/// Counts of work performed by one [`TestHarness::run_round`] — useful for a
/// scenario that wants to assert forward progress without hand-driving
/// every hop.
#[derive(Debug, Clone, Copy, Default)]
pub struct RoundSummary {
    pub published: usize,
    pub consumed: usize,
    pub replies_applied: usize,
}

impl RoundSummary {
    pub fn made_progress(&self) -> bool {
        self.published > 0 || self.consumed > 0 || self.replies_applied > 0
    }
}

/// Wires every component crate against one disposable Postgres schema and
/// one in-process broker (spec §13).
pub struct TestHarness {
    pub pool: PgPool,
    pub broker: Arc<MemoryBroker>,
    pub router: Arc<BrokerRouter<MemoryBroker, MemoryBroker, MemoryBroker>>,
    pub registry: Arc<Registry>,
    pub bus: Arc<CommandBus<MemoryBroker>>,
    pub consumer: Arc<Consumer>,
    pub manager: Arc<ProcessManager<MemoryBroker>>,
    caps: Capabilities,
    relay_config: platform_relay::RelayConfig,
    command_rx: HashMap<String, broadcast::Receiver<DeliveredMessage>>,
    reply_rx: broadcast::Receiver<DeliveredMessage>,
}

impl TestHarness {
    /// Build a fresh harness against `pool`, truncating every table this
    /// workspace owns first so scenario tests never see another test's
    /// leftover rows (mirrors `platform_db::testkit_reset`'s stated
    /// purpose: "only ever called between test cases").
    pub async fn build(
        pool: PgPool,
        registrations: Vec<Registration>,
        process_configurations: Vec<ProcessConfiguration>,
    ) -> anyhow::Result<Self> {
        platform_db::testkit_reset(&pool).await?;

        let broker = Arc::new(MemoryBroker::new());
        let router = Arc::new(BrokerRouter::new(broker.clone(), broker.clone(), broker.clone()));
        let registry = Arc::new(Registry::discover(registrations)?);
        let bus = Arc::new(CommandBus::new(pool.clone(), broker.clone()));
        let classifier = TransientClassifier::default();
        // Consumer-level retry depends on the broker redelivering an unacked
        // message, which only a real broker infrastructure does on its own;
        // `MemoryBroker` never will (spec §1 Non-goals). Disabling it here
        // (`max_retries_default: 0`) means every handler failure reaches the
        // process manager as a terminal reply, so step-retry semantics are
        // always exercised at the `ProcessManager::on_failed` layer, where a
        // scenario test can actually observe them.
        let consumer = Arc::new(Consumer::new(
            pool.clone(),
            registry.clone(),
            classifier.clone(),
            ConsumerConfig {
                max_retries_default: 0,
                ..ConsumerConfig::default()
            },
        ));
        let manager = Arc::new(ProcessManager::new(
            pool.clone(),
            bus.clone(),
            process_configurations,
            classifier,
            ManagerConfig::default(),
        )?);

        // Subscriptions must exist before anything is published — the
        // broker only delivers to receivers already subscribed (spec §4.2),
        // exactly like a real topic.
        let mut command_rx = HashMap::new();
        for command_type in registry.command_types() {
            command_rx.insert(
                command_type.clone(),
                broker.subscribe_commands(&platform_execution::route(&command_type)),
            );
        }
        let reply_rx = broker.subscribe_replies(platform_inbox::DEFAULT_REPLY_TOPIC);

        Ok(Self {
            pool,
            broker,
            router,
            registry,
            bus,
            consumer,
            manager,
            caps: Capabilities::detect_postgres(),
            relay_config: platform_relay::RelayConfig {
                // No ticker in a test — `drive_relay` is called explicitly.
                sweep_interval: Duration::from_secs(3600),
                ..platform_relay::RelayConfig::default()
            },
            command_rx,
            reply_rx,
        })
    }

    /// `accept()` straight through to the command bus (spec §4.4) — the
    /// entry point a scenario test uses exactly like HTTP ingress would.
    pub async fn accept(
        &self,
        name: &str,
        idempotency_key: &str,
        business_key: Option<&str>,
        payload: Value,
    ) -> anyhow::Result<Uuid> {
        self.bus
            .accept(name, idempotency_key, business_key, payload, Default::default())
            .await
    }

    pub async fn start_process(&self, process_type: &str, business_key: &str, initial_data: Value) -> anyhow::Result<Uuid> {
        self.manager.start_process(process_type, business_key, initial_data).await
    }

    pub async fn find_process(&self, process_id: Uuid) -> anyhow::Result<Option<ProcessInstance>> {
        self.manager.find_by_id(process_id).await
    }

    pub async fn process_log(&self, process_id: Uuid) -> anyhow::Result<Vec<ProcessLogEntry>> {
        self.manager.log(process_id, 10_000).await
    }

    /// One claim+publish+settle pass (spec §4.5 steps 1-2), driven on
    /// demand instead of waiting for `RelayWorker`'s ticker. Returns the
    /// number of rows claimed this pass.
    pub async fn drive_relay(&self) -> anyhow::Result<usize> {
        platform_relay::sweep_once(&self.pool, self.caps, &self.router, &self.relay_config).await
    }

    /// `recoverStuck` (spec §4.5 step 3 / C6), driven on demand.
    pub async fn recover_stuck(&self, older_than: Duration) -> anyhow::Result<u64> {
        platform_db::outbox::recover_stuck(&self.pool, older_than).await
    }

    /// Receive and hand the next delivered message for `command_type` to
    /// the inbox-guarded consumer (spec §4.6) — the broker->C7 hop a real
    /// deployment's consumer loop performs continuously. Blocks until a
    /// message arrives; a scenario test only calls this after confirming
    /// (via `drive_relay`) that one was published.
    pub async fn consume_next(&mut self, command_type: &str) -> anyhow::Result<ConsumeOutcome> {
        let rx = self
            .command_rx
            .get_mut(command_type)
            .ok_or_else(|| anyhow::anyhow!("no consumer subscribed for {command_type:?}; was it registered?"))?;
        let msg = rx.recv().await?;
        self.consume_delivered(command_type, msg).await
    }

    /// Decode and hand one delivered message to the consumer, re-publishing
    /// it onto the same command topic when the outcome is
    /// [`ConsumeOutcome::RetryScheduled`]. A real broker redelivers an
    /// unacked message once its visibility timeout lapses; `MemoryBroker`
    /// has no such timer, so the harness plays that part for a transient
    /// failure the way the broker infrastructure would in production.
    ///
    /// The dedup key is `{command_id}:{retries}` rather than bare
    /// `command_id`: the latter is 1:1 with the command's single outbox row
    /// (fine for a command that is only ever delivered once), but a
    /// redelivered retry must reach the handler again, and the inbox's
    /// unique `(message_id, handler)` constraint would otherwise treat every
    /// redelivery of the same command as a duplicate of the first attempt.
    /// `retries` increments exactly once per transient failure, so each
    /// delivery attempt gets a distinct key.
    async fn consume_delivered(&self, command_type: &str, msg: DeliveredMessage) -> anyhow::Result<ConsumeOutcome> {
        let envelope =
            platform_inbox::decode_command_envelope(command_type, msg.key.as_deref(), msg.payload.clone(), &msg.headers)?;
        let retries = platform_db::commands::find_by_id(&self.pool, envelope.command_id)
            .await?
            .map(|c| c.retries)
            .unwrap_or(0);
        let message_id = format!("{}:{retries}", envelope.command_id);
        let outcome = self.consumer.consume(&message_id, command_type, &envelope).await?;
        if outcome == ConsumeOutcome::RetryScheduled {
            self.broker
                .send(&platform_execution::route(command_type), &msg.payload, &msg.headers)
                .await?;
        }
        Ok(outcome)
    }

    /// Drain every currently-delivered message for `command_type` without
    /// blocking — used where a round fans out more than one command at once
    /// (a parallel branch gate issues several siblings in one `executeStep`).
    pub async fn drain_commands(&mut self, command_type: &str) -> anyhow::Result<Vec<ConsumeOutcome>> {
        let mut outcomes = Vec::new();
        loop {
            let msg = {
                let rx = self
                    .command_rx
                    .get_mut(command_type)
                    .ok_or_else(|| anyhow::anyhow!("no consumer subscribed for {command_type:?}"))?;
                match rx.try_recv() {
                    Ok(msg) => msg,
                    Err(broadcast::error::TryRecvError::Empty) => break,
                    Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                    Err(broadcast::error::TryRecvError::Closed) => break,
                }
            };
            outcomes.push(self.consume_delivered(command_type, msg).await?);
        }
        Ok(outcomes)
    }

    /// Drain every reply currently sitting on the reply topic into the
    /// process manager's `handleReply` (spec §4.8) — the same decoding
    /// `platform-daemon::state::spawn_reply_bridge` performs continuously.
    /// Returns the number of replies applied.
    pub async fn pump_replies(&mut self) -> anyhow::Result<usize> {
        let mut n = 0;
        loop {
            let msg = match self.reply_rx.try_recv() {
                Ok(msg) => msg,
                Err(broadcast::error::TryRecvError::Empty) => break,
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Closed) => break,
            };
            let envelope: Envelope = serde_json::from_value(msg.payload)?;
            let outcome = match envelope.r#type {
                MessageType::CommandCompleted => ReplyOutcome::Completed { data: envelope.payload },
                MessageType::CommandFailed => ReplyOutcome::Failed {
                    error: envelope
                        .payload
                        .get("error")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown error")
                        .to_string(),
                },
                MessageType::CommandTimedOut => ReplyOutcome::TimedOut,
                MessageType::CommandRequested => continue,
            };
            let branch = envelope.headers.parallel_branch.clone();
            self.manager
                .handle_reply(envelope.correlation_id, envelope.command_id, &envelope.name, branch.as_deref(), outcome)
                .await?;
            n += 1;
        }
        Ok(n)
    }

    /// Drive relay -> drain every `command_types` consumer -> pump replies,
    /// once. A process-driven scenario calls this in a small fixed-count
    /// loop rather than polling for quiescence, so a wiring bug fails the
    /// test instead of hanging it.
    pub async fn run_round(&mut self, command_types: &[&str]) -> anyhow::Result<RoundSummary> {
        let published = self.drive_relay().await?;
        let mut consumed = 0;
        for command_type in command_types {
            consumed += self.drain_commands(command_type).await?.len();
        }
        let replies_applied = self.pump_replies().await?;
        Ok(RoundSummary {
            published,
            consumed,
            replies_applied,
        })
    }

    pub async fn run_rounds(&mut self, command_types: &[&str], rounds: usize) -> anyhow::Result<()> {
        for _ in 0..rounds {
            self.run_round(command_types).await?;
        }
        Ok(())
    }
}

/// Poll until `process_id` reaches a terminal [`ProcessStatus`] or the
/// round budget is exhausted. Returns the final (possibly non-terminal)
/// instance so a failing assertion names the status it actually stopped at.
pub async fn run_process_to_terminal(
    harness: &mut TestHarness,
    process_id: Uuid,
    command_types: &[&str],
    max_rounds: usize,
) -> anyhow::Result<ProcessInstance> {
    for _ in 0..max_rounds {
        if let Some(instance) = harness.find_process(process_id).await? {
            if instance.status.is_terminal() {
                return Ok(instance);
            }
        }
        harness.run_round(command_types).await?;
    }
    harness
        .find_process(process_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("process {process_id} vanished"))
}

/// Same idea as [`run_process_to_terminal`] but for a plain command, keyed
/// off `CommandStatus` instead.
pub async fn run_command_to_terminal(
    harness: &mut TestHarness,
    command_id: Uuid,
    command_type: &str,
    max_rounds: usize,
) -> anyhow::Result<platform_types::Command> {
    for _ in 0..max_rounds {
        if let Some(cmd) = platform_db::commands::find_by_id(&harness.pool, command_id).await? {
            if cmd.status.is_terminal() {
                return Ok(cmd);
            }
        }
        harness.run_round(&[command_type]).await?;
    }
    platform_db::commands::find_by_id(&harness.pool, command_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("command {command_id} vanished"))
}
