use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use platform_db::{commands, dlq, outbox};
use platform_types::{CommandStatus, MessageType, NewDlqRecord, NewOutboxEntry, OutboxCategory};

use crate::consumer::DEFAULT_REPLY_TOPIC;

/// Background watchdog (spec §4.6 step 8): periodically scans for `RUNNING`
/// commands whose lease has lapsed and emits a `CommandTimedOut` reply for
/// each, parking it in the DLQ the same way a permanent handler failure
/// would. Grounded in the teacher's `mqk-daemon::state::spawn_heartbeat`
/// ticker-with-shutdown-watch shape.
pub struct ReaperWorker;

impl ReaperWorker {
    pub fn spawn(
        pool: PgPool,
        interval: Duration,
        batch_size: i64,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = reap_once(&pool, batch_size).await {
                            tracing::error!(%err, "reaper sweep failed");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}

async fn reap_once(pool: &PgPool, batch_size: i64) -> anyhow::Result<()> {
    let expired = commands::find_expired_leases(pool, batch_size).await?;
    for cmd in expired {
        time_out_one(pool, cmd).await?;
    }
    Ok(())
}

async fn time_out_one(pool: &PgPool, cmd: platform_types::Command) -> anyhow::Result<()> {
    let outbox_entry = NewOutboxEntry {
        category: OutboxCategory::Reply,
        topic: DEFAULT_REPLY_TOPIC.to_string(),
        key: cmd.business_key.clone(),
        r#type: format!("{:?}", MessageType::CommandTimedOut),
        payload: serde_json::json!({"commandId": cmd.id, "name": cmd.name}),
        headers: Default::default(),
    };
    let error_message = format!("lease expired at {:?}", cmd.lease_until);

    platform_db::with_tx(pool, move |tx| {
        let outbox_entry = outbox_entry.clone();
        let error_message = error_message.clone();
        let cmd = cmd.clone();
        async move {
            commands::mark_terminal(&mut **tx, cmd.id, CommandStatus::TimedOut, Some(&error_message)).await?;
            outbox::insert_returning_id(&mut **tx, &outbox_entry).await?;
            dlq::park(
                &mut **tx,
                &NewDlqRecord {
                    command_id: cmd.id,
                    command_name: cmd.name.clone(),
                    business_key: cmd.business_key.clone(),
                    payload: cmd.payload.clone(),
                    failed_status: "TIMED_OUT".to_string(),
                    error_class: "LEASE_EXPIRED".to_string(),
                    error_message,
                    attempts: cmd.retries,
                    parked_by: "platform-inbox-reaper".to_string(),
                },
            )
            .await?;
            anyhow::Ok(())
        }
    })
    .await
}
