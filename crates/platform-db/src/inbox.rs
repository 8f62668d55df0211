use anyhow::{Context, Result};

/// Insert `(message_id, handler)` if absent. Returns `true` if this call
/// inserted the row (first delivery), `false` if it already existed
/// (duplicate — caller acknowledges and returns without invoking the
/// handler again). Never raises on the duplicate path (spec §4.1).
pub async fn insert_if_absent<'e, E>(executor: E, message_id: &str, handler: &str) -> Result<bool>
where
    E: sqlx::PgExecutor<'e>,
{
    let row = sqlx::query(
        r#"
        insert into inbox (message_id, handler)
        values ($1, $2)
        on conflict (message_id, handler) do nothing
        returning id
        "#,
    )
    .bind(message_id)
    .bind(handler)
    .fetch_optional(executor)
    .await
    .context("inbox insert_if_absent failed")?;

    Ok(row.is_some())
}
