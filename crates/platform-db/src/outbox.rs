use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

use platform_types::{NewOutboxEntry, OutboxEntry};

use crate::capabilities::Capabilities;

/// Atomically claim up to `batch_size` rows eligible for publishing.
///
/// Eligible means: `status = NEW`, OR `status in (CLAIMED, SENDING)` with
/// `claimed_at` older than `stuck_threshold` — AND `next_at` is null or past
/// (spec §4.1). Under concurrent claimers no row is returned twice: with
/// [`Capabilities::skip_locked`] this is `FOR UPDATE SKIP LOCKED`; without it
/// (a dialect that cannot skip-lock) we fall back to select-then-conditional-
/// update, re-checking ownership in the `WHERE` clause of the update so two
/// racing claimers can't both win the same row (spec §4.1 "unique-winner
/// contract").
pub async fn claim_batch(
    pool: &PgPool,
    caps: Capabilities,
    batch_size: i64,
    claimer: &str,
    stuck_threshold: Duration,
) -> Result<Vec<OutboxEntry>> {
    let stuck_before = Utc::now() - chrono::Duration::from_std(stuck_threshold)?;

    if caps.skip_locked {
        claim_batch_skip_locked(pool, batch_size, claimer, stuck_before).await
    } else {
        claim_batch_select_then_update(pool, batch_size, claimer, stuck_before).await
    }
}

async fn claim_batch_skip_locked(
    pool: &PgPool,
    batch_size: i64,
    claimer: &str,
    stuck_before: DateTime<Utc>,
) -> Result<Vec<OutboxEntry>> {
    let rows = sqlx::query(
        r#"
        with to_claim as (
            select id
              from outbox
             where (status = 'NEW'
                    or (status in ('CLAIMED', 'SENDING') and claimed_at < $3))
               and (next_at is null or next_at <= now())
             order by created_at asc
             limit $1
             for update skip locked
        )
        update outbox
           set status     = 'CLAIMED',
               claimed_at = now(),
               claimed_by = $2
         where id in (select id from to_claim)
        returning id, category, topic, key, type, payload, headers, status, attempts,
                  next_at, claimed_by, claimed_at, created_at, published_at, last_error
        "#,
    )
    .bind(batch_size)
    .bind(claimer)
    .bind(stuck_before)
    .fetch_all(pool)
    .await
    .context("claim_batch (skip locked) failed")?;

    rows.into_iter().map(outbox_entry_from_row).collect()
}

/// Select-then-conditional-update fallback (no `SKIP LOCKED` support).
/// Each candidate id is claimed with a `WHERE id = $1 AND status = $2`
/// re-check so a racing claimer's update is a no-op rather than a double
/// claim; a row only appears in the result if *this* call's update won it.
async fn claim_batch_select_then_update(
    pool: &PgPool,
    batch_size: i64,
    claimer: &str,
    stuck_before: DateTime<Utc>,
) -> Result<Vec<OutboxEntry>> {
    let candidates: Vec<(i64, String)> = sqlx::query_as(
        r#"
        select id, status
          from outbox
         where (status = 'NEW'
                or (status in ('CLAIMED', 'SENDING') and claimed_at < $2))
           and (next_at is null or next_at <= now())
         order by created_at asc
         limit $1
        "#,
    )
    .bind(batch_size)
    .bind(stuck_before)
    .fetch_all(pool)
    .await
    .context("claim_batch (select) failed")?;

    let mut claimed = Vec::with_capacity(candidates.len());
    for (id, prior_status) in candidates {
        let row = sqlx::query(
            r#"
            update outbox
               set status = 'CLAIMED', claimed_at = now(), claimed_by = $3
             where id = $1 and status = $2
            returning id, category, topic, key, type, payload, headers, status, attempts,
                      next_at, claimed_by, claimed_at, created_at, published_at, last_error
            "#,
        )
        .bind(id)
        .bind(&prior_status)
        .bind(claimer)
        .fetch_optional(pool)
        .await
        .context("claim_batch (conditional update) failed")?;

        if let Some(row) = row {
            claimed.push(outbox_entry_from_row(row)?);
        }
    }
    Ok(claimed)
}

/// Claim a single row by id, iff it is currently `NEW` — used by the
/// fast-path worker pool (`publishNow`), which races the scheduled sweep
/// for any given row and must not double-publish it.
pub async fn claim_if_new(pool: &PgPool, id: i64, claimer: &str) -> Result<Option<OutboxEntry>> {
    let row = sqlx::query(
        r#"
        update outbox
           set status = 'CLAIMED', claimed_at = now(), claimed_by = $2
         where id = $1 and status = 'NEW'
        returning id, category, topic, key, type, payload, headers, status, attempts,
                  next_at, claimed_by, claimed_at, created_at, published_at, last_error
        "#,
    )
    .bind(id)
    .bind(claimer)
    .fetch_optional(pool)
    .await
    .context("claim_if_new failed")?;

    row.map(outbox_entry_from_row).transpose()
}

/// Reopen `CLAIMED`/`SENDING` rows whose lease is older than `older_than`,
/// resetting them to `NEW` so the next ordinary sweep picks them up (C6
/// Sweeper, spec §4.5 step 3). Returns the number of rows recovered.
pub async fn recover_stuck(pool: &PgPool, older_than: Duration) -> Result<u64> {
    let stuck_before = Utc::now() - chrono::Duration::from_std(older_than)?;
    let result = sqlx::query(
        r#"
        update outbox
           set status = 'NEW', claimed_at = null, claimed_by = null
         where status in ('CLAIMED', 'SENDING')
           and claimed_at < $1
        "#,
    )
    .bind(stuck_before)
    .execute(pool)
    .await
    .context("recover_stuck failed")?;
    Ok(result.rows_affected())
}

/// Insert a new `NEW` outbox row, returning its id. Generic over the
/// executor so callers co-commit this with whatever business-state write
/// produced the message (spec §3 "created by C4/C7/C9 in the same
/// transaction as related state").
pub async fn insert_returning_id<'e, E>(executor: E, entry: &NewOutboxEntry) -> Result<i64>
where
    E: sqlx::PgExecutor<'e>,
{
    let headers = serde_json::to_value(&entry.headers).context("encode outbox headers")?;
    let (id,): (i64,) = sqlx::query_as(
        r#"
        insert into outbox (category, topic, key, type, payload, headers, status)
        values ($1, $2, $3, $4, $5, $6, 'NEW')
        returning id
        "#,
    )
    .bind(entry.category.as_str())
    .bind(&entry.topic)
    .bind(&entry.key)
    .bind(&entry.r#type)
    .bind(&entry.payload)
    .bind(headers)
    .fetch_one(executor)
    .await
    .context("insert_returning_id failed")?;
    Ok(id)
}

/// Mark a `CLAIMED`/`SENDING` row `PUBLISHED`. Terminal — never reverted.
pub async fn mark_published(pool: &PgPool, id: i64) -> Result<()> {
    sqlx::query(
        r#"
        update outbox
           set status = 'PUBLISHED', published_at = now()
         where id = $1
        "#,
    )
    .bind(id)
    .execute(pool)
    .await
    .context("mark_published failed")?;
    Ok(())
}

/// Reschedule a row after a broker publish failure: bump `attempts`, set
/// `next_at` to `now() + backoff`, and return it to `NEW` so the next sweep
/// retries it.
pub async fn reschedule(pool: &PgPool, id: i64, backoff: Duration, error: &str) -> Result<()> {
    let next_at = Utc::now() + chrono::Duration::from_std(backoff)?;
    sqlx::query(
        r#"
        update outbox
           set status     = 'NEW',
               attempts   = attempts + 1,
               next_at    = $2,
               last_error = $3,
               claimed_at = null,
               claimed_by = null
         where id = $1
        "#,
    )
    .bind(id)
    .bind(next_at)
    .bind(error)
    .execute(pool)
    .await
    .context("reschedule failed")?;
    Ok(())
}

/// Mark a row permanently `FAILED` (used when a publish error is classified
/// as non-retryable, or after an operator-defined max-attempts cutoff).
pub async fn mark_failed(pool: &PgPool, id: i64, error: &str) -> Result<()> {
    sqlx::query(
        r#"
        update outbox
           set status = 'FAILED', last_error = $2
         where id = $1
        "#,
    )
    .bind(id)
    .bind(error)
    .execute(pool)
    .await
    .context("mark_failed failed")?;
    Ok(())
}

fn outbox_entry_from_row(row: sqlx::postgres::PgRow) -> Result<OutboxEntry> {
    let category: String = row.try_get("category")?;
    let status: String = row.try_get("status")?;
    let headers_json: serde_json::Value = row.try_get("headers")?;
    let headers: BTreeMap<String, String> =
        serde_json::from_value(headers_json).unwrap_or_default();

    Ok(OutboxEntry {
        id: row.try_get("id")?,
        category: category.parse().map_err(anyhow::Error::msg)?,
        topic: row.try_get("topic")?,
        key: row.try_get("key")?,
        r#type: row.try_get("type")?,
        payload: row.try_get("payload")?,
        headers,
        status: status.parse().map_err(anyhow::Error::msg)?,
        attempts: row.try_get("attempts")?,
        next_at: row.try_get("next_at")?,
        claimed_by: row.try_get("claimed_by")?,
        claimed_at: row.try_get("claimed_at")?,
        created_at: row.try_get("created_at")?,
        published_at: row.try_get("published_at")?,
        last_error: row.try_get("last_error")?,
    })
}
