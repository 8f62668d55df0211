//! Transactional Command Bus (spec §4.4): `accept()` is the single entry
//! point through which every command — HTTP ingress, a process manager step,
//! a CLI replay — enters the system.
//!
//! Grounded in the teacher's gateway/router split
//! (`mqk-execution/src/gateway.rs`): `CommandBus` is the only public surface,
//! and the transaction combinator it drives (`platform_db::with_tx`) plays
//! the role `OrderRouter` plays there — an implementation detail no caller
//! outside this crate ever touches directly.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use platform_broker::FastPathPort;
use platform_db::commands;
use platform_db::outbox as outbox_db;
use platform_types::{NewCommand, NewOutboxEntry, OutboxCategory};

/// Derive the command queue topic for a command name. Matches the wire
/// convention spec §8's acceptance scenario names explicitly:
/// `CreateUser` → `APP.CMD.CREATEUSER.Q`.
pub fn route(name: &str) -> String {
    format!("APP.CMD.{}.Q", name.to_uppercase())
}

/// The transactional command bus (spec §4.4). Generic over the fast-path
/// port so tests can wire a `MemoryBroker` or any other `FastPathPort`
/// implementation without this crate depending on a concrete transport.
pub struct CommandBus<F: FastPathPort> {
    pool: PgPool,
    fastpath: Arc<F>,
}

impl<F: FastPathPort + 'static> CommandBus<F> {
    pub fn new(pool: PgPool, fastpath: Arc<F>) -> Self {
        Self { pool, fastpath }
    }

    /// Accept a command (spec §4.4, six steps):
    /// 1. idempotency check (read, no write)
    /// 2. generate id + insert PENDING command row
    /// 3. insert the matching outbox row, co-committed with step 2
    /// 4. commit
    /// 5. best-effort fast-path notify, strictly after the commit — never
    ///    inside the transaction, so a slow/unavailable fast-path channel
    ///    can never hold the command/outbox write open (§9 open question).
    #[tracing::instrument(skip(self, payload, reply_headers), fields(%name))]
    pub async fn accept(
        &self,
        name: &str,
        idempotency_key: &str,
        business_key: Option<&str>,
        payload: Value,
        reply_headers: BTreeMap<String, String>,
    ) -> anyhow::Result<Uuid> {
        if let Some(existing) = commands::exists_by_idempotency(&self.pool, idempotency_key).await? {
            tracing::debug!(command_id = %existing, "accept: resolved to existing command by idempotency key");
            return Ok(existing);
        }

        let id = Uuid::new_v4();
        let topic = route(name);

        // A caller that already knows its own correlation (the process
        // manager, issuing a step under `correlationId=processId`) wins;
        // only a caller with no opinion (plain HTTP ingress) falls back to
        // the command's own id, matching the §8 acceptance scenario where
        // a directly-issued command is its own correlation root.
        let mut headers = reply_headers;
        headers
            .entry("correlation_id".to_string())
            .or_insert_with(|| id.to_string());
        headers
            .entry("causation_id".to_string())
            .or_insert_with(|| id.to_string());
        headers.insert("idempotency_key".to_string(), idempotency_key.to_string());
        // Authoritative regardless of what correlation_id a process-issued
        // step carries — a consumer decoding the wire envelope needs the
        // accepted command's own id, not whatever root the caller correlates
        // this command under.
        headers.insert("command_id".to_string(), id.to_string());

        let new_command = NewCommand {
            id,
            name: name.to_string(),
            business_key: business_key.map(str::to_string),
            idempotency_key: idempotency_key.to_string(),
            payload: payload.clone(),
        };
        let new_outbox = NewOutboxEntry {
            category: OutboxCategory::Command,
            topic,
            key: business_key.map(str::to_string),
            r#type: name.to_string(),
            payload,
            headers,
        };

        let (committed_id, outbox_id) = platform_db::with_tx(&self.pool, move |tx| {
            let new_command = new_command.clone();
            let new_outbox = new_outbox.clone();
            async move {
                // If a concurrent accept() already won this idempotency key
                // inside this same race window, `insert_pending` resolves to
                // the winner's id rather than raising — that id, not our
                // locally generated `id`, is what this call must return. When
                // that happens this call did not actually create the command
                // row, so it must not create an outbox row for it either —
                // otherwise the winner's command ships twice (§8 S2 "exactly
                // one outbox row created").
                let committed_id = commands::insert_pending(&mut **tx, &new_command).await?;
                let outbox_id = if committed_id == id {
                    Some(outbox_db::insert_returning_id(&mut **tx, &new_outbox).await?)
                } else {
                    None
                };
                anyhow::Ok((committed_id, outbox_id))
            }
        })
        .await?;

        if let Some(outbox_id) = outbox_id {
            let fastpath = self.fastpath.clone();
            tokio::spawn(async move {
                if let Err(err) = fastpath.notify(outbox_id).await {
                    tracing::debug!(%err, outbox_id, "accept: fast-path notify failed, scheduled sweep will pick it up");
                }
            });
        } else {
            tracing::debug!(command_id = %committed_id, "accept: lost idempotency race inside the transaction, skipping duplicate outbox insert");
        }

        Ok(committed_id)
    }
}
