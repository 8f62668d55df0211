use anyhow::{Context, Result};
use sqlx::{PgPool, Row};

use platform_types::{DlqRecord, NewDlqRecord};

/// Park a command permanently. Immutable once written — no update/delete
/// operation exists for dlq rows (spec §3 "Dead-letter record").
pub async fn park<'e, E>(executor: E, rec: &NewDlqRecord) -> Result<i64>
where
    E: sqlx::PgExecutor<'e>,
{
    let (id,): (i64,) = sqlx::query_as(
        r#"
        insert into dlq (command_id, command_name, business_key, payload, failed_status,
                          error_class, error_message, attempts, parked_by)
        values ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        returning id
        "#,
    )
    .bind(rec.command_id)
    .bind(&rec.command_name)
    .bind(&rec.business_key)
    .bind(&rec.payload)
    .bind(&rec.failed_status)
    .bind(&rec.error_class)
    .bind(&rec.error_message)
    .bind(rec.attempts)
    .bind(&rec.parked_by)
    .fetch_one(executor)
    .await
    .context("dlq park failed")?;
    Ok(id)
}

/// List the most recently parked rows first — the view the ops CLI's
/// `dlq list` subcommand renders.
pub async fn list(pool: &PgPool, limit: i64) -> Result<Vec<DlqRecord>> {
    let rows = sqlx::query(
        r#"
        select id, command_id, command_name, business_key, payload, failed_status,
               error_class, error_message, attempts, parked_by, parked_at
          from dlq
         order by parked_at desc
         limit $1
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("dlq list failed")?;

    rows.into_iter().map(record_from_row).collect()
}

pub async fn find_by_id(pool: &PgPool, id: i64) -> Result<Option<DlqRecord>> {
    let row = sqlx::query(
        r#"
        select id, command_id, command_name, business_key, payload, failed_status,
               error_class, error_message, attempts, parked_by, parked_at
          from dlq
         where id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("dlq find_by_id failed")?;

    row.map(record_from_row).transpose()
}

fn record_from_row(row: sqlx::postgres::PgRow) -> Result<DlqRecord> {
    Ok(DlqRecord {
        id: row.try_get("id")?,
        command_id: row.try_get("command_id")?,
        command_name: row.try_get("command_name")?,
        business_key: row.try_get("business_key")?,
        payload: row.try_get("payload")?,
        failed_status: row.try_get("failed_status")?,
        error_class: row.try_get("error_class")?,
        error_message: row.try_get("error_message")?,
        attempts: row.try_get("attempts")?,
        parked_by: row.try_get("parked_by")?,
        parked_at: row.try_get("parked_at")?,
    })
}
