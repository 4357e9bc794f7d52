//! Database operations for the `sync_snapshot_records` table.

use sqlx::{PgConnection, Row};
use uuid::Uuid;
use ward_engine::{EntityName, SnapshotDirection, SnapshotRecord, SyncRecord, Tick};

/// A stored snapshot row from the database.
#[derive(Debug)]
pub struct StoredSnapshotRecord {
    pub id: i64,
    pub session_id: Uuid,
    pub direction: String,
    pub is_deleted: bool,
    pub record_type: String,
    pub record_id: String,
    pub saved_at_tick: i64,
    pub data: serde_json::Value,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for StoredSnapshotRecord {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(StoredSnapshotRecord {
            id: row.try_get("id")?,
            session_id: row.try_get("session_id")?,
            direction: row.try_get("direction")?,
            is_deleted: row.try_get("is_deleted")?,
            record_type: row.try_get("record_type")?,
            record_id: row.try_get("record_id")?,
            saved_at_tick: row.try_get("saved_at_tick")?,
            data: row.try_get("data")?,
        })
    }
}

impl StoredSnapshotRecord {
    /// Convert a database row to an engine snapshot record.
    pub fn into_record(self) -> SnapshotRecord {
        let direction = if self.direction == SnapshotDirection::Incoming.as_str() {
            SnapshotDirection::Incoming
        } else {
            SnapshotDirection::Outgoing
        };
        let data = match self.data {
            serde_json::Value::Object(map) => map,
            _ => Default::default(),
        };
        SnapshotRecord {
            id: self.id as u64,
            session_id: self.session_id,
            direction,
            is_deleted: self.is_deleted,
            record_type: self.record_type,
            record_id: self.record_id,
            saved_at_tick: self.saved_at_tick,
            data,
        }
    }
}

/// Stage rows of a snapshot or push.
pub async fn insert_snapshot_records(
    conn: &mut PgConnection,
    records: &[SnapshotRecord],
) -> Result<(), sqlx::Error> {
    for record in records {
        sqlx::query(
            r#"
            INSERT INTO sync_snapshot_records (
                session_id, direction, is_deleted, record_type,
                record_id, saved_at_tick, data
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(record.session_id)
        .bind(record.direction.as_str())
        .bind(record.is_deleted)
        .bind(&record.record_type)
        .bind(&record.record_id)
        .bind(record.saved_at_tick)
        .bind(serde_json::Value::Object(record.data.clone()))
        .execute(&mut *conn)
        .await?;
    }

    Ok(())
}

/// Stage the records of one persisted push, each under its own type.
pub async fn insert_incoming_records(
    conn: &mut PgConnection,
    session_id: Uuid,
    records: &[(EntityName, SyncRecord)],
    tick: Tick,
) -> Result<(), sqlx::Error> {
    let rows: Vec<SnapshotRecord> = records
        .iter()
        .map(|(record_type, record)| SnapshotRecord {
            id: 0,
            session_id,
            direction: SnapshotDirection::Incoming,
            is_deleted: record.is_deleted,
            record_type: record_type.clone(),
            record_id: record.id().unwrap_or_default().to_string(),
            saved_at_tick: tick,
            data: record.data.clone(),
        })
        .collect();
    insert_snapshot_records(conn, &rows).await
}

/// A page of a session's outgoing rows with ids above `from_id`.
pub async fn outgoing_records(
    conn: &mut PgConnection,
    session_id: Uuid,
    from_id: i64,
    limit: i64,
) -> Result<Vec<SnapshotRecord>, sqlx::Error> {
    let rows = sqlx::query_as::<_, StoredSnapshotRecord>(
        r#"
        SELECT id, session_id, direction, is_deleted, record_type,
               record_id, saved_at_tick, data
        FROM sync_snapshot_records
        WHERE session_id = $1 AND direction = 'outgoing' AND id > $2
        ORDER BY id ASC
        LIMIT $3
        "#,
    )
    .bind(session_id)
    .bind(from_id)
    .bind(limit)
    .fetch_all(conn)
    .await?;

    Ok(rows.into_iter().map(StoredSnapshotRecord::into_record).collect())
}

/// Number of outgoing rows staged for a session.
pub async fn count_outgoing(conn: &mut PgConnection, session_id: Uuid) -> Result<u64, sqlx::Error> {
    let (count,): (i64,) = sqlx::query_as(
        r#"
        SELECT COUNT(*) FROM sync_snapshot_records
        WHERE session_id = $1 AND direction = 'outgoing'
        "#,
    )
    .bind(session_id)
    .fetch_one(conn)
    .await?;

    Ok(count as u64)
}

/// Drop outgoing rows for records the same session pushed.
pub async fn remove_echoed_records(
    conn: &mut PgConnection,
    session_id: Uuid,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        DELETE FROM sync_snapshot_records outgoing
        USING sync_snapshot_records incoming
        WHERE outgoing.session_id = $1
          AND outgoing.direction = 'outgoing'
          AND incoming.session_id = $1
          AND incoming.direction = 'incoming'
          AND incoming.record_type = outgoing.record_type
          AND incoming.record_id = outgoing.record_id
        "#,
    )
    .bind(session_id)
    .execute(conn)
    .await?;

    Ok(result.rows_affected())
}

/// Drop a session's outgoing rows before a new snapshot is staged.
pub async fn clear_outgoing(conn: &mut PgConnection, session_id: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"DELETE FROM sync_snapshot_records WHERE session_id = $1 AND direction = 'outgoing'"#,
    )
    .bind(session_id)
    .execute(conn)
    .await?;

    Ok(())
}
