//! Outbox Relay (C5) and Sweeper (C6) — spec §4.5.
//!
//! Grounded in the teacher's heartbeat-ticker pattern
//! (`mqk-daemon::state::spawn_heartbeat`: `tokio::time::interval` inside a
//! spawned task), generalized into two independent tickers that each carry
//! their own `tokio::sync::watch` shutdown signal so tests and daemon
//! shutdown can stop them cleanly instead of leaking a detached loop.

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;

use platform_broker::{BrokerRouter, CommandQueuePort, EventsPort, ReplyQueuePort};
use platform_types::{exponential_backoff, OutboxEntry};

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub sweep_interval: Duration,
    pub batch_size: i64,
    pub claimer: String,
    pub stuck_threshold: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(1),
            batch_size: 500,
            claimer: hostname(),
            stuck_threshold: Duration::from_secs(10),
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(300),
        }
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown-host".to_string())
}

/// Publish a claimed row and settle it: `mark_published` on success,
/// `reschedule` with exponential backoff on a broker error (spec §4.5
/// step 2b/2c). Shared by the scheduled sweep and the fast-path pool so
/// both settle rows identically.
async fn publish_and_settle<Q, R, E>(
    pool: &PgPool,
    router: &BrokerRouter<Q, R, E>,
    entry: OutboxEntry,
    backoff_base: Duration,
    backoff_max: Duration,
) where
    Q: CommandQueuePort,
    R: ReplyQueuePort,
    E: EventsPort,
{
    match router.publish(&entry).await {
        Ok(()) => {
            if let Err(err) = platform_db::outbox::mark_published(pool, entry.id).await {
                tracing::warn!(outbox_id = entry.id, %err, "mark_published failed after successful publish");
            }
        }
        Err(err) => {
            let backoff = exponential_backoff(entry.attempts as u32, backoff_base, backoff_max);
            tracing::warn!(outbox_id = entry.id, %err, ?backoff, "publish failed, rescheduling");
            if let Err(reschedule_err) =
                platform_db::outbox::reschedule(pool, entry.id, backoff, &err.to_string()).await
            {
                tracing::error!(outbox_id = entry.id, %reschedule_err, "reschedule itself failed");
            }
        }
    }
}

/// One claim+publish+settle pass (spec §4.5 steps 1-2), exposed so callers
/// that don't want a ticker — the daemon bootstraps `RelayWorker` below, but
/// a test harness drives this directly instead of sleeping for a tick.
/// Returns the number of rows claimed this pass.
pub async fn sweep_once<Q, R, E>(
    pool: &PgPool,
    caps: platform_db::Capabilities,
    router: &BrokerRouter<Q, R, E>,
    config: &RelayConfig,
) -> anyhow::Result<usize>
where
    Q: CommandQueuePort,
    R: ReplyQueuePort,
    E: EventsPort,
{
    let claimed = platform_db::outbox::claim_batch(
        pool,
        caps,
        config.batch_size,
        &config.claimer,
        config.stuck_threshold,
    )
    .await?;
    let n = claimed.len();
    for entry in claimed {
        publish_and_settle(pool, router, entry, config.backoff_base, config.backoff_max).await;
    }
    Ok(n)
}

/// The scheduled sweep (spec §4.5 steps 1-2): every `sweep_interval`, claim
/// a batch and publish each row outside the claim transaction.
pub struct RelayWorker;

impl RelayWorker {
    pub fn spawn<Q, R, E>(
        pool: PgPool,
        caps: platform_db::Capabilities,
        router: Arc<BrokerRouter<Q, R, E>>,
        config: RelayConfig,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()>
    where
        Q: CommandQueuePort + 'static,
        R: ReplyQueuePort + 'static,
        E: EventsPort + 'static,
    {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.sweep_interval);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            tracing::info!("relay worker stopping");
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        if let Err(err) = sweep_once(&pool, caps, &router, &config).await {
                            tracing::error!(%err, "claim_batch failed, skipping this tick");
                        }
                    }
                }
            }
        })
    }
}

/// The independent stuck-row recovery sweep (spec §4.5 step 3 / C6).
pub struct SweeperWorker;

impl SweeperWorker {
    pub fn spawn(
        pool: PgPool,
        interval: Duration,
        older_than: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            tracing::info!("sweeper worker stopping");
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        match platform_db::outbox::recover_stuck(&pool, older_than).await {
                            Ok(0) => {}
                            Ok(n) => tracing::warn!(recovered = n, "sweeper recovered stuck outbox rows"),
                            Err(err) => tracing::error!(%err, "recover_stuck failed"),
                        }
                    }
                }
            }
        })
    }
}

/// Drains the fast-path notification channel (spec §4.5 `publishNow`),
/// bounded by a semaphore (default 32 permits). A worker that cannot
/// acquire a permit drops the notification silently — the scheduled sweep
/// remains the correctness backstop, this is a latency optimization only.
pub struct FastPathWorkerPool;

impl FastPathWorkerPool {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn<Q, R, E>(
        mut receiver: mpsc::UnboundedReceiver<i64>,
        pool: PgPool,
        router: Arc<BrokerRouter<Q, R, E>>,
        claimer: String,
        permits: usize,
        backoff_base: Duration,
        backoff_max: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()>
    where
        Q: CommandQueuePort + 'static,
        R: ReplyQueuePort + 'static,
        E: EventsPort + 'static,
    {
        tokio::spawn(async move {
            let semaphore = Arc::new(Semaphore::new(permits));
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            tracing::info!("fast-path worker pool stopping");
                            break;
                        }
                    }
                    received = receiver.recv() => {
                        let Some(outbox_id) = received else { break };

                        let permit = match semaphore.clone().try_acquire_owned() {
                            Ok(permit) => permit,
                            Err(_) => {
                                tracing::debug!(outbox_id, "fast-path pool saturated, dropping; scheduled sweep will catch it");
                                continue;
                            }
                        };

                        let pool = pool.clone();
                        let router = router.clone();
                        let claimer = claimer.clone();
                        tokio::spawn(async move {
                            let _permit = permit;
                            match platform_db::outbox::claim_if_new(&pool, outbox_id, &claimer).await {
                                Ok(Some(entry)) => {
                                    publish_and_settle(&pool, &router, entry, backoff_base, backoff_max).await;
                                }
                                Ok(None) => {
                                    // Already claimed by the scheduled sweep or another fast-path
                                    // worker — not an error, just lost the race.
                                }
                                Err(err) => {
                                    tracing::warn!(outbox_id, %err, "fast-path claim_if_new failed");
                                }
                            }
                        });
                    }
                }
            }
        })
    }
}
