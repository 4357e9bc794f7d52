//! Database operations for the `sync_records` table.

use sqlx::{PgConnection, Postgres, QueryBuilder, Row as _};
use ward_engine::{EntityName, Fields, Row, RowQuery, RowScope, Tick, Timestamp};

/// A stored row from the database.
#[derive(Debug)]
pub struct StoredRow {
    pub record_id: String,
    pub data: serde_json::Value,
    pub updated_at_tick: i64,
    pub deleted_at: Option<i64>,
    pub pulled_at: Option<i64>,
    pub marked_for_push: bool,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for StoredRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(StoredRow {
            record_id: row.try_get("record_id")?,
            data: row.try_get("data")?,
            updated_at_tick: row.try_get("updated_at_tick")?,
            deleted_at: row.try_get("deleted_at")?,
            pulled_at: row.try_get("pulled_at")?,
            marked_for_push: row.try_get("marked_for_push")?,
        })
    }
}

impl StoredRow {
    /// Convert a database row to an engine row.
    pub fn into_row(self) -> Row {
        let fields = match self.data {
            serde_json::Value::Object(map) => map,
            _ => Fields::new(),
        };
        Row {
            id: self.record_id,
            fields,
            updated_at_tick: self.updated_at_tick,
            deleted_at: self.deleted_at.map(|t| t as Timestamp),
            pulled_at: self.pulled_at.map(|t| t as Timestamp),
            marked_for_push: self.marked_for_push,
        }
    }
}

const ROW_COLUMNS: &str =
    "record_id, data, updated_at_tick, deleted_at, pulled_at, marked_for_push";

/// Build the change query for one entity type: rows with
/// `since < updated_at_tick <= until` inside the scope, strictly after the
/// cursor, ordered by `(updated_at_tick, record_id)`.
pub fn changed_rows_query(entity: &str, query: &RowQuery) -> QueryBuilder<'static, Postgres> {
    let mut qb = QueryBuilder::new(format!("SELECT {ROW_COLUMNS} FROM sync_records WHERE entity_type = "));
    qb.push_bind(entity.to_string());
    qb.push(" AND updated_at_tick > ");
    qb.push_bind(query.since);
    if let Some(until) = query.until {
        qb.push(" AND updated_at_tick <= ");
        qb.push_bind(until);
    }
    if let RowScope::Column { column, values } = &query.scope {
        qb.push(" AND data->>");
        qb.push_bind(column.clone());
        qb.push(" = ANY(");
        qb.push_bind(values.clone());
        qb.push(")");
    }
    if let Some(cursor) = &query.after {
        qb.push(" AND (updated_at_tick, record_id) > (");
        qb.push_bind(cursor.tick);
        qb.push(", ");
        qb.push_bind(cursor.id.clone());
        qb.push(")");
    }
    qb.push(" ORDER BY updated_at_tick ASC, record_id ASC");
    if let Some(limit) = query.limit {
        qb.push(" LIMIT ");
        qb.push_bind(limit as i64);
    }
    qb
}

/// Rows of one entity type matching a change query.
pub async fn changed_rows(
    conn: &mut PgConnection,
    entity: &str,
    query: &RowQuery,
) -> Result<Vec<Row>, sqlx::Error> {
    let rows = changed_rows_query(entity, query)
        .build_query_as::<StoredRow>()
        .fetch_all(conn)
        .await?;

    Ok(rows.into_iter().map(StoredRow::into_row).collect())
}

/// Rows of `entity` with one of `ids`, or whose `foreign_key` column holds
/// one of `parent_ids`.
pub async fn load_rows(
    conn: &mut PgConnection,
    entity: &str,
    ids: &[String],
    parent: Option<(&str, &[String])>,
) -> Result<Vec<Row>, sqlx::Error> {
    let rows = match parent {
        Some((foreign_key, parent_ids)) => {
            sqlx::query_as::<_, StoredRow>(&format!(
                "SELECT {ROW_COLUMNS} FROM sync_records \
                 WHERE entity_type = $1 AND (record_id = ANY($2) OR data->>$3 = ANY($4)) \
                 ORDER BY record_id"
            ))
            .bind(entity)
            .bind(ids)
            .bind(foreign_key)
            .bind(parent_ids)
            .fetch_all(conn)
            .await?
        }
        None => {
            sqlx::query_as::<_, StoredRow>(&format!(
                "SELECT {ROW_COLUMNS} FROM sync_records \
                 WHERE entity_type = $1 AND record_id = ANY($2) \
                 ORDER BY record_id"
            ))
            .bind(entity)
            .bind(ids)
            .fetch_all(conn)
            .await?
        }
    };

    Ok(rows.into_iter().map(StoredRow::into_row).collect())
}

/// Write rows produced by an import, all stamped with `tick`.
pub async fn upsert_rows(
    conn: &mut PgConnection,
    writes: &[(EntityName, Row)],
    tick: Tick,
) -> Result<(), sqlx::Error> {
    for (entity, row) in writes {
        sqlx::query(
            r#"
            INSERT INTO sync_records (
                entity_type, record_id, data, updated_at_tick,
                deleted_at, pulled_at, marked_for_push
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (entity_type, record_id) DO UPDATE SET
                data = EXCLUDED.data,
                updated_at_tick = EXCLUDED.updated_at_tick,
                deleted_at = EXCLUDED.deleted_at,
                pulled_at = EXCLUDED.pulled_at,
                marked_for_push = EXCLUDED.marked_for_push
            "#,
        )
        .bind(entity)
        .bind(&row.id)
        .bind(serde_json::Value::Object(row.fields.clone()))
        .bind(tick)
        .bind(row.deleted_at.map(|t| t as i64))
        .bind(row.pulled_at.map(|t| t as i64))
        .bind(row.marked_for_push)
        .execute(&mut *conn)
        .await?;
    }

    Ok(())
}
