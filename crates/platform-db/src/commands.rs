use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use platform_types::{Command, CommandStatus, NewCommand};

/// `true` if a command with this idempotency key has already been accepted.
///
/// `accept()` (C4) calls this first and resolves a hit to the existing row
/// instead of inserting a second one — idempotency collisions never surface
/// to the caller as an error (spec §7).
pub async fn exists_by_idempotency<'e, E>(executor: E, idempotency_key: &str) -> Result<Option<Uuid>>
where
    E: sqlx::PgExecutor<'e>,
{
    let row: Option<(Uuid,)> = sqlx::query_as(
        "select id from command where idempotency_key = $1",
    )
    .bind(idempotency_key)
    .fetch_optional(executor)
    .await
    .context("exists_by_idempotency failed")?;
    Ok(row.map(|(id,)| id))
}

/// Insert a new `PENDING` command row.
///
/// Takes a generic executor (a bare `&PgPool` or an open `&mut
/// Transaction`) so `accept()` (C4) can insert the command and its outbox
/// row in one transaction (spec §4.1 "process.update must write... in one
/// commit" applies equally here: command + outbox must land together).
///
/// If a concurrent caller won the race on `idempotency_key`, this returns
/// the winner's id instead of raising a unique-violation — callers never
/// need to retry on conflict.
pub async fn insert_pending<'e, E>(executor: E, cmd: &NewCommand) -> Result<Uuid>
where
    E: sqlx::PgExecutor<'e>,
{
    // `do update set idempotency_key = excluded.idempotency_key` is a
    // vacuous write whose only purpose is to make Postgres fire `returning`
    // on the conflicting row too, so a racing/duplicate accept() always
    // gets the winner's id back in a single round trip instead of needing
    // a follow-up lookup.
    let (id,): (Uuid,) = sqlx::query_as(
        r#"
        insert into command (id, name, business_key, idempotency_key, payload, status)
        values ($1, $2, $3, $4, $5, 'PENDING')
        on conflict (idempotency_key)
            do update set idempotency_key = excluded.idempotency_key
        returning id
        "#,
    )
    .bind(cmd.id)
    .bind(&cmd.name)
    .bind(&cmd.business_key)
    .bind(&cmd.idempotency_key)
    .bind(&cmd.payload)
    .fetch_one(executor)
    .await
    .context("insert_pending failed")?;

    Ok(id)
}

/// Promote a `PENDING` command to `RUNNING` under a lease, returning `false`
/// if the row is already terminal or does not exist (redelivery of a
/// command whose outcome is already durable must be a no-op here).
pub async fn mark_running<'e, E>(executor: E, id: Uuid, lease_until: DateTime<Utc>) -> Result<bool>
where
    E: sqlx::PgExecutor<'e>,
{
    let row: Option<(Uuid,)> = sqlx::query_as(
        r#"
        update command
           set status = 'RUNNING', lease_until = $2, updated_at = now()
         where id = $1
           and status not in ('SUCCEEDED', 'FAILED', 'TIMED_OUT')
        returning id
        "#,
    )
    .bind(id)
    .bind(lease_until)
    .fetch_optional(executor)
    .await
    .context("mark_running failed")?;
    Ok(row.is_some())
}

/// Transition a command to a terminal (or back to `RUNNING`, for
/// transient-retry redelivery) status. Terminal states never transition
/// again — this is enforced by the `status not in (...)` guard, matching
/// the monotonic-status invariant in spec §3.
pub async fn mark_terminal<'e, E>(
    executor: E,
    id: Uuid,
    status: CommandStatus,
    error: Option<&str>,
) -> Result<bool>
where
    E: sqlx::PgExecutor<'e>,
{
    let row: Option<(Uuid,)> = sqlx::query_as(
        r#"
        update command
           set status = $2, last_error = coalesce($3, last_error), updated_at = now()
         where id = $1
           and status not in ('SUCCEEDED', 'FAILED', 'TIMED_OUT')
        returning id
        "#,
    )
    .bind(id)
    .bind(status.to_string())
    .bind(error)
    .fetch_optional(executor)
    .await
    .context("mark_terminal failed")?;
    Ok(row.is_some())
}

/// Increment the retry counter on a command row (used by C7 on transient
/// redelivery and C9 on step retry).
pub async fn increment_retries<'e, E>(executor: E, id: Uuid) -> Result<()>
where
    E: sqlx::PgExecutor<'e>,
{
    sqlx::query("update command set retries = retries + 1, updated_at = now() where id = $1")
        .bind(id)
        .execute(executor)
        .await
        .context("increment_retries failed")?;
    Ok(())
}

/// Commands still `RUNNING` whose lease has expired — candidates for the
/// external watchdog's `CommandTimedOut` reply (spec §4.6 step 8).
pub async fn find_expired_leases(pool: &PgPool, limit: i64) -> Result<Vec<Command>> {
    let rows = sqlx::query(
        r#"
        select id, name, business_key, idempotency_key, payload, status, retries,
               lease_until, last_error, created_at, updated_at
          from command
         where status = 'RUNNING'
           and lease_until is not null
           and lease_until < now()
         order by lease_until asc
         limit $1
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("find_expired_leases failed")?;

    rows.into_iter().map(command_from_row).collect()
}

pub async fn find_by_id<'e, E>(executor: E, id: Uuid) -> Result<Option<Command>>
where
    E: sqlx::PgExecutor<'e>,
{
    let row = sqlx::query(
        r#"
        select id, name, business_key, idempotency_key, payload, status, retries,
               lease_until, last_error, created_at, updated_at
          from command
         where id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(executor)
    .await
    .context("find_by_id failed")?;

    row.map(command_from_row).transpose()
}

fn command_from_row(row: sqlx::postgres::PgRow) -> Result<Command> {
    let status: String = row.try_get("status")?;
    Ok(Command {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        business_key: row.try_get("business_key")?,
        idempotency_key: row.try_get("idempotency_key")?,
        payload: row.try_get("payload")?,
        status: status.parse().map_err(anyhow::Error::msg)?,
        retries: row.try_get("retries")?,
        lease_until: row.try_get("lease_until")?,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
