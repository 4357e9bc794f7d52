//! Database operations for the `sync_sessions` table.

use sqlx::{PgConnection, Row};
use uuid::Uuid;
use ward_engine::{SyncSession, Tick, Timestamp};

/// A stored session row from the database.
#[derive(Debug)]
pub struct StoredSession {
    pub id: Uuid,
    pub start_time: i64,
    pub last_connection_time: i64,
    pub started_at_tick: i64,
    pub pull_since: Option<i64>,
    pub pull_until: Option<i64>,
    pub snapshot_completed_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub errors: Vec<String>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for StoredSession {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(StoredSession {
            id: row.try_get("id")?,
            start_time: row.try_get("start_time")?,
            last_connection_time: row.try_get("last_connection_time")?,
            started_at_tick: row.try_get("started_at_tick")?,
            pull_since: row.try_get("pull_since")?,
            pull_until: row.try_get("pull_until")?,
            snapshot_completed_at: row.try_get("snapshot_completed_at")?,
            completed_at: row.try_get("completed_at")?,
            errors: row.try_get("errors")?,
        })
    }
}

impl StoredSession {
    /// Convert a database row to an engine session.
    pub fn into_session(self) -> SyncSession {
        SyncSession {
            id: self.id,
            start_time: self.start_time as Timestamp,
            last_connection_time: self.last_connection_time as Timestamp,
            started_at_tick: self.started_at_tick,
            pull_since: self.pull_since,
            pull_until: self.pull_until,
            snapshot_completed_at: self.snapshot_completed_at.map(|t| t as Timestamp),
            completed_at: self.completed_at.map(|t| t as Timestamp),
            errors: self.errors,
        }
    }
}

/// Insert a new session.
pub async fn insert_session(conn: &mut PgConnection, session: &SyncSession) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO sync_sessions (id, start_time, last_connection_time, started_at_tick)
        VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(session.id)
    .bind(session.start_time as i64)
    .bind(session.last_connection_time as i64)
    .bind(session.started_at_tick)
    .execute(conn)
    .await?;

    Ok(())
}

/// Get a session by id.
pub async fn get_session(conn: &mut PgConnection, id: Uuid) -> Result<Option<SyncSession>, sqlx::Error> {
    let stored = sqlx::query_as::<_, StoredSession>(
        r#"
        SELECT id, start_time, last_connection_time, started_at_tick,
               pull_since, pull_until, snapshot_completed_at, completed_at, errors
        FROM sync_sessions
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(conn)
    .await?;

    Ok(stored.map(StoredSession::into_session))
}

/// Refresh a session's connection time.
pub async fn touch_session(conn: &mut PgConnection, id: Uuid, now: Timestamp) -> Result<(), sqlx::Error> {
    sqlx::query(r#"UPDATE sync_sessions SET last_connection_time = $2 WHERE id = $1"#)
        .bind(id)
        .bind(now as i64)
        .execute(conn)
        .await?;

    Ok(())
}

/// Append an error to a session and drop its staged rows.
pub async fn mark_session_errored(
    conn: &mut PgConnection,
    id: Uuid,
    message: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(r#"UPDATE sync_sessions SET errors = array_append(errors, $2) WHERE id = $1"#)
        .bind(id)
        .bind(message)
        .execute(&mut *conn)
        .await?;
    sqlx::query(r#"DELETE FROM sync_snapshot_records WHERE session_id = $1"#)
        .bind(id)
        .execute(&mut *conn)
        .await?;

    Ok(())
}

/// Record the window a completed snapshot covers.
pub async fn set_pull_window(
    conn: &mut PgConnection,
    id: Uuid,
    since: Tick,
    until: Tick,
    now: Timestamp,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE sync_sessions
        SET pull_since = $2, pull_until = $3, snapshot_completed_at = $4
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(since)
    .bind(until)
    .bind(now as i64)
    .execute(conn)
    .await?;

    Ok(())
}

/// Mark a session complete and drop its staged rows. Returns false when the
/// session was already complete.
pub async fn complete_session(
    conn: &mut PgConnection,
    id: Uuid,
    now: Timestamp,
) -> Result<bool, sqlx::Error> {
    let updated = sqlx::query(
        r#"UPDATE sync_sessions SET completed_at = $2 WHERE id = $1 AND completed_at IS NULL"#,
    )
    .bind(id)
    .bind(now as i64)
    .execute(&mut *conn)
    .await?
    .rows_affected();
    sqlx::query(r#"DELETE FROM sync_snapshot_records WHERE session_id = $1"#)
        .bind(id)
        .execute(&mut *conn)
        .await?;

    Ok(updated > 0)
}

/// Delete sessions idle since before `cutoff`. Their staged rows go with
/// them.
pub async fn delete_lapsed_sessions(
    conn: &mut PgConnection,
    cutoff: Timestamp,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(r#"DELETE FROM sync_sessions WHERE last_connection_time < $1"#)
        .bind(cutoff as i64)
        .execute(conn)
        .await?;

    Ok(result.rows_affected())
}
