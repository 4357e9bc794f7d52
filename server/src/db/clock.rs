//! The shared tick counter, kept in `local_system_facts`.
//!
//! Every read goes to the row itself. Incrementing takes the row lock until
//! the surrounding transaction ends, so writers stamping rows are ordered by
//! commit.

use sqlx::PgConnection;
use ward_engine::{Tick, TickTock, TICK_STEP};

/// Key of the counter row.
pub const CURRENT_SYNC_TICK: &str = "currentSyncTick";

/// Atomically add `n` to the counter and return the new value.
pub async fn increment_tick(conn: &mut PgConnection, n: i64) -> Result<Tick, sqlx::Error> {
    let (value,): (i64,) = sqlx::query_as(
        r#"
        UPDATE local_system_facts
        SET value = value + $2
        WHERE key = $1
        RETURNING value
        "#,
    )
    .bind(CURRENT_SYNC_TICK)
    .bind(n)
    .fetch_one(conn)
    .await?;

    Ok(value)
}

/// Read the counter without moving it.
pub async fn current_tick(conn: &mut PgConnection) -> Result<Tick, sqlx::Error> {
    let (value,): (i64,) = sqlx::query_as(r#"SELECT value FROM local_system_facts WHERE key = $1"#)
        .bind(CURRENT_SYNC_TICK)
        .fetch_one(conn)
        .await?;

    Ok(value)
}

/// Take the counter row's lock until the transaction ends and return its
/// value. A writer that reads rows before stamping them holds this from its
/// first read, so no other writer commits in between.
pub async fn lock_clock(conn: &mut PgConnection) -> Result<Tick, sqlx::Error> {
    let (value,): (i64,) =
        sqlx::query_as(r#"SELECT value FROM local_system_facts WHERE key = $1 FOR UPDATE"#)
            .bind(CURRENT_SYNC_TICK)
            .fetch_one(conn)
            .await?;

    Ok(value)
}

/// Move the counter one full step.
pub async fn tick_tock(conn: &mut PgConnection) -> Result<TickTock, sqlx::Error> {
    let tock = increment_tick(conn, TICK_STEP).await?;
    Ok(TickTock {
        tick: tock - 1,
        tock,
    })
}
