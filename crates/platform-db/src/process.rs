use anyhow::{Context, Result};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use platform_types::{ProcessEvent, ProcessInstance, ProcessLogEntry, ProcessStatus};

/// Insert a brand-new process instance and append its first log entry
/// (`seq = 1`) atomically. Used only by `startProcess` (C9) — every
/// subsequent mutation goes through [`update`].
pub async fn insert(pool: &PgPool, instance: &ProcessInstance, event: &ProcessEvent) -> Result<()> {
    let mut tx = pool.begin().await.context("process insert: begin tx")?;

    sqlx::query(
        r#"
        insert into process_instance
            (process_id, process_type, business_key, status, current_step, data, retries)
        values ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(instance.process_id)
    .bind(&instance.process_type)
    .bind(&instance.business_key)
    .bind(instance.status.to_string())
    .bind(&instance.current_step)
    .bind(&instance.data)
    .bind(instance.retries)
    .execute(&mut *tx)
    .await
    .context("process insert: instance row")?;

    append_log(&mut tx, instance.process_id, 1, event).await?;

    tx.commit().await.context("process insert: commit")?;
    Ok(())
}

/// Write the instance row and append exactly one log entry, in one commit
/// (spec §3/§4.1 "process_log invariant"). `seq` is computed as
/// `max(seq) + 1` for this `process_id` inside the same transaction that
/// performs the instance update, so two concurrent updaters on different
/// connections cannot both claim the same `seq` — the loser's transaction
/// serializes behind the winner's (or deadlocks and must retry, per spec §5
/// "serialization... by optimistic retry on update conflict").
pub async fn update(pool: &PgPool, instance: &ProcessInstance, event: &ProcessEvent) -> Result<()> {
    let mut tx = pool.begin().await.context("process update: begin tx")?;

    sqlx::query(
        r#"
        update process_instance
           set status = $2, current_step = $3, data = $4, retries = $5, updated_at = now()
         where process_id = $1
        "#,
    )
    .bind(instance.process_id)
    .bind(instance.status.to_string())
    .bind(&instance.current_step)
    .bind(&instance.data)
    .bind(instance.retries)
    .execute(&mut *tx)
    .await
    .context("process update: instance row")?;

    let (next_seq,): (i64,) = sqlx::query_as(
        "select coalesce(max(seq), 0) + 1 from process_log where process_id = $1 for update",
    )
    .bind(instance.process_id)
    .fetch_one(&mut *tx)
    .await
    .context("process update: compute next seq")?;

    append_log(&mut tx, instance.process_id, next_seq, event).await?;

    tx.commit().await.context("process update: commit")?;
    Ok(())
}

async fn append_log(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    process_id: Uuid,
    seq: i64,
    event: &ProcessEvent,
) -> Result<()> {
    let payload = serde_json::to_value(event).context("encode process event")?;
    sqlx::query("insert into process_log (process_id, seq, event) values ($1, $2, $3)")
        .bind(process_id)
        .bind(seq)
        .bind(payload)
        .execute(&mut **tx)
        .await
        .context("process update: log row")?;
    Ok(())
}

pub async fn find_by_id(pool: &PgPool, process_id: Uuid) -> Result<Option<ProcessInstance>> {
    let row = sqlx::query(
        r#"
        select process_id, process_type, business_key, status, current_step, data,
               retries, created_at, updated_at
          from process_instance
         where process_id = $1
        "#,
    )
    .bind(process_id)
    .fetch_optional(pool)
    .await
    .context("process find_by_id failed")?;

    row.map(instance_from_row).transpose()
}

pub async fn find_by_status(
    pool: &PgPool,
    status: ProcessStatus,
    limit: i64,
) -> Result<Vec<ProcessInstance>> {
    let rows = sqlx::query(
        r#"
        select process_id, process_type, business_key, status, current_step, data,
               retries, created_at, updated_at
          from process_instance
         where status = $1
         order by updated_at asc
         limit $2
        "#,
    )
    .bind(status.to_string())
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("process find_by_status failed")?;

    rows.into_iter().map(instance_from_row).collect()
}

pub async fn find_by_business_key(
    pool: &PgPool,
    process_type: &str,
    business_key: &str,
) -> Result<Option<ProcessInstance>> {
    let row = sqlx::query(
        r#"
        select process_id, process_type, business_key, status, current_step, data,
               retries, created_at, updated_at
          from process_instance
         where process_type = $1 and business_key = $2
         order by created_at desc
         limit 1
        "#,
    )
    .bind(process_type)
    .bind(business_key)
    .fetch_optional(pool)
    .await
    .context("process find_by_business_key failed")?;

    row.map(instance_from_row).transpose()
}

pub async fn log(pool: &PgPool, process_id: Uuid, limit: i64) -> Result<Vec<ProcessLogEntry>> {
    let rows = sqlx::query("select process_id, seq, at, event from process_log where process_id = $1 order by seq asc limit $2")
        .bind(process_id)
        .bind(limit)
        .fetch_all(pool)
        .await
        .context("process log failed")?;

    rows.into_iter()
        .map(|row| -> Result<ProcessLogEntry> {
            let event_json: serde_json::Value = row.try_get("event")?;
            Ok(ProcessLogEntry {
                process_id: row.try_get("process_id")?,
                seq: row.try_get("seq")?,
                at: row.try_get("at")?,
                event: serde_json::from_value(event_json).context("decode process event")?,
            })
        })
        .collect()
}

fn instance_from_row(row: sqlx::postgres::PgRow) -> Result<ProcessInstance> {
    let status: String = row.try_get("status")?;
    Ok(ProcessInstance {
        process_id: row.try_get("process_id")?,
        process_type: row.try_get("process_type")?,
        business_key: row.try_get("business_key")?,
        status: status.parse().map_err(anyhow::Error::msg)?,
        current_step: row.try_get("current_step")?,
        data: row.try_get("data")?,
        retries: row.try_get("retries")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
