//! Session lifecycle: start, connect, end, and lapse.

use crate::db;
use crate::error::Result;
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;
use ward_engine::{Error, SyncConfig, SyncSession, Tick, Timestamp};

/// Response for a started session.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionResponse {
    pub session_id: Uuid,
    /// Everything written from here on is ordered after this tick
    pub started_at_tick: Tick,
}

/// Open a session, moving the clock past everything written so far.
pub async fn start_session(pool: &PgPool, now: Timestamp) -> Result<StartSessionResponse> {
    let mut tx = pool.begin().await?;
    let started_at_tick = db::tick_tock(&mut *tx).await?.tock;
    let session = SyncSession {
        id: Uuid::new_v4(),
        start_time: now,
        last_connection_time: now,
        started_at_tick,
        pull_since: None,
        pull_until: None,
        snapshot_completed_at: None,
        completed_at: None,
        errors: Vec::new(),
    };
    db::insert_session(&mut *tx, &session).await?;
    tx.commit().await?;

    tracing::info!(session_id = %session.id, tick = started_at_tick, "sync session started");
    Ok(StartSessionResponse {
        session_id: session.id,
        started_at_tick,
    })
}

/// Check a session can still be used and refresh its connection time.
///
/// A session idle for longer than the session timeout is marked errored
/// here and refused from then on.
pub async fn connect(
    pool: &PgPool,
    config: &SyncConfig,
    id: Uuid,
    now: Timestamp,
) -> Result<SyncSession> {
    let mut conn = pool.acquire().await?;
    let mut session = db::get_session(&mut *conn, id)
        .await?
        .ok_or(Error::SessionNotFound(id))?;

    if let Some(message) = session.errors.first() {
        return Err(Error::SessionErrored {
            id,
            message: message.clone(),
        }
        .into());
    }
    if session.is_completed() {
        return Err(Error::SessionCompleted(id).into());
    }
    if now.saturating_sub(session.last_connection_time) > config.session_timeout_ms {
        let message = "sync session timed out";
        db::mark_session_errored(&mut *conn, id, message).await?;
        tracing::warn!(session_id = %id, "sync session timed out");
        return Err(Error::SessionErrored {
            id,
            message: message.to_string(),
        }
        .into());
    }

    db::touch_session(&mut *conn, id, now).await?;
    session.last_connection_time = now;
    Ok(session)
}

/// Record a failure against a session. Failures to record it are logged, not
/// returned, so the original error reaches the caller.
pub async fn mark_errored(pool: &PgPool, id: Uuid, message: &str) {
    tracing::error!(session_id = %id, error = %message, "sync session errored");
    let result = match pool.acquire().await {
        Ok(mut conn) => db::mark_session_errored(&mut *conn, id, message).await,
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        tracing::error!(session_id = %id, "failed to record session error: {:?}", e);
    }
}

/// Finish a session and drop its staged rows.
pub async fn end_session(pool: &PgPool, id: Uuid, now: Timestamp) -> Result<()> {
    let mut tx = pool.begin().await?;
    let session = db::get_session(&mut *tx, id)
        .await?
        .ok_or(Error::SessionNotFound(id))?;
    if db::complete_session(&mut *tx, id, now).await? {
        tracing::info!(
            session_id = %id,
            duration_ms = now.saturating_sub(session.start_time),
            "sync session ended"
        );
    }
    tx.commit().await?;
    Ok(())
}

/// Drop every session idle for longer than the lapse window, with its
/// staged rows.
pub async fn expire_lapsed(pool: &PgPool, config: &SyncConfig, now: Timestamp) -> Result<u64> {
    let mut conn = pool.acquire().await?;
    let cutoff = now.saturating_sub(config.lapsed_session_ms);
    let dropped = db::delete_lapsed_sessions(&mut *conn, cutoff).await?;
    if dropped > 0 {
        tracing::info!(count = dropped, "dropped lapsed sync sessions");
    }
    Ok(dropped)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_response_shape() {
        let response = StartSessionResponse {
            session_id: Uuid::nil(),
            started_at_tick: 42,
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["startedAtTick"], 42);
        assert_eq!(json["sessionId"], "00000000-0000-0000-0000-000000000000");
    }
}
