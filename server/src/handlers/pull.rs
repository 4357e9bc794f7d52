//! Pull handlers: build a session's outgoing snapshot and page through it.

use super::session::{connect, mark_errored};
use crate::db;
use crate::error::{AppError, Result};
use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool};
use std::collections::HashSet;
use uuid::Uuid;
use ward_engine::{
    row_scope, Error, RecordId, RowQuery, RowScope, Schema, SessionConfig, SnapshotRecord,
    SnapshotRequest, SyncConfig, Tick, Timestamp, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE,
};

/// Request body for building a snapshot.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotParams {
    /// Highest tick the peer has already seen
    pub since: Tick,
    /// Inclusive upper bound; defaults to the tick current when the pass
    /// begins
    #[serde(default)]
    pub until: Option<Tick>,
    #[serde(default)]
    pub patient_ids: Vec<RecordId>,
    #[serde(default)]
    pub facility_id: Option<RecordId>,
    /// Types to include; every outgoing type when absent
    #[serde(default)]
    pub entity_types: Option<Vec<String>>,
    /// Patient-linked types sent in full
    #[serde(default)]
    pub sync_all_types: Vec<String>,
}

impl SnapshotParams {
    /// The engine request for a session.
    pub fn into_request(self, session_id: Uuid, schema: &Schema) -> SnapshotRequest {
        let entity_types = self.entity_types.unwrap_or_else(|| {
            schema
                .outgoing_types()
                .into_iter()
                .map(|e| e.name.clone())
                .collect()
        });
        let mut request = SnapshotRequest::new(session_id, self.since)
            .entity_types(entity_types)
            .patients(self.patient_ids)
            .session_config(SessionConfig {
                sync_all_types: self.sync_all_types,
            });
        if let Some(facility_id) = self.facility_id {
            request = request.facility(facility_id);
        }
        if let Some(until) = self.until {
            request = request.until(until);
        }
        request
    }
}

/// Response for a built snapshot.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotResponse {
    /// Rows waiting to be pulled
    pub count: u64,
    pub pull_until: Tick,
}

/// Query parameters for paging a snapshot.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullQuery {
    /// Id of the last row already received
    #[serde(default)]
    pub from_id: i64,
    pub limit: Option<usize>,
}

/// Response for one page of a snapshot.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResponse {
    pub records: Vec<SnapshotRecord>,
    /// Whether there are more rows to fetch
    pub has_more: bool,
}

/// Build the session's outgoing snapshot.
///
/// A failed pass marks the session errored and keeps nothing.
pub async fn handle_snapshot(
    pool: &PgPool,
    schema: &Schema,
    config: &SyncConfig,
    session_id: Uuid,
    params: SnapshotParams,
    now: Timestamp,
) -> Result<SnapshotResponse> {
    if config.read_only {
        return Ok(SnapshotResponse {
            count: 0,
            pull_until: params.since,
        });
    }
    connect(pool, config, session_id, now).await?;

    let request = params.into_request(session_id, schema);
    match build_snapshot(pool, schema, &request, now).await {
        Ok(response) => {
            tracing::info!(
                session_id = %session_id,
                count = response.count,
                since = request.since,
                until = response.pull_until,
                "snapshot complete"
            );
            Ok(response)
        }
        Err(err) => {
            mark_errored(pool, session_id, &err.to_string()).await;
            Err(err)
        }
    }
}

/// One snapshot pass inside a repeatable-read transaction. Rows are staged
/// in the same transaction, so they become visible only if every type
/// succeeded.
async fn build_snapshot(
    pool: &PgPool,
    schema: &Schema,
    request: &SnapshotRequest,
    now: Timestamp,
) -> Result<SnapshotResponse> {
    let session_id = request.session_id;
    let mut tx = pool.begin().await?;
    sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ")
        .execute(&mut *tx)
        .await?;
    // A concurrent pass for the same session waits here, then fails on the
    // session row update
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
        .bind(session_id.to_string())
        .execute(&mut *tx)
        .await?;

    let until = match request.until {
        Some(until) => until,
        None => db::current_tick(&mut *tx).await?,
    };
    db::clear_outgoing(&mut *tx, session_id).await?;

    let mut seen = HashSet::new();
    for name in &request.entity_types {
        if !seen.insert(name.as_str()) {
            continue;
        }
        let Some(scope) = type_scope(schema, name, request)? else {
            continue;
        };
        let query = RowQuery::since(request.since)
            .until(Some(until))
            .scope(scope);
        let records = snapshot_type(&mut *tx, name, &query, session_id).await?;
        tracing::debug!(
            session_id = %session_id,
            entity = %name,
            count = records.len(),
            "snapshotted type"
        );
        db::insert_snapshot_records(&mut *tx, &records).await?;
    }

    db::set_pull_window(&mut *tx, session_id, request.since, until, now).await?;
    db::remove_echoed_records(&mut *tx, session_id).await?;
    let count = db::count_outgoing(&mut *tx, session_id).await?;
    tx.commit().await?;

    Ok(SnapshotResponse {
        count,
        pull_until: until,
    })
}

/// Row predicate for one requested type, or `None` when the type contributes
/// nothing. Unknown types fail the pass.
fn type_scope(schema: &Schema, name: &str, request: &SnapshotRequest) -> Result<Option<RowScope>> {
    let entity = schema.get(name).ok_or_else(|| Error::IsolationViolation {
        entity: name.to_string(),
        reason: "no such table".to_string(),
    })?;
    if !entity.sync_direction.flows_outward() {
        return Ok(None);
    }
    let scope = row_scope(entity, request);
    if scope.is_none() {
        tracing::debug!(entity = %name, "scope empty, skipping type");
    }
    Ok(scope)
}

async fn snapshot_type(
    conn: &mut PgConnection,
    name: &str,
    query: &RowQuery,
    session_id: Uuid,
) -> Result<Vec<SnapshotRecord>> {
    let rows = db::changed_rows(conn, name, query)
        .await
        .map_err(|e| Error::IsolationViolation {
            entity: name.to_string(),
            reason: e.to_string(),
        })?;
    Ok(rows
        .iter()
        .map(|row| SnapshotRecord::outgoing(session_id, name, row))
        .collect())
}

/// Serve one page of the session's outgoing rows.
pub async fn handle_pull(
    pool: &PgPool,
    config: &SyncConfig,
    session_id: Uuid,
    query: PullQuery,
    now: Timestamp,
) -> Result<PullResponse> {
    let session = connect(pool, config, session_id, now).await?;
    if session.snapshot_completed_at.is_none() {
        return Err(AppError::Engine(Error::SnapshotNotReady(session_id)));
    }

    let limit = query
        .limit
        .map(|l| l.clamp(1, MAX_PAGE_SIZE))
        .unwrap_or(DEFAULT_PAGE_SIZE);

    // Fetch one more than requested to check if there are more
    let mut conn = pool.acquire().await?;
    let mut records =
        db::outgoing_records(&mut *conn, session_id, query.from_id, limit as i64 + 1).await?;
    let has_more = records.len() > limit;
    records.truncate(limit);

    Ok(PullResponse { records, has_more })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ward_schema;
    use ward_engine::INITIAL_SYNC_TICK;

    #[test]
    fn params_default_to_every_outgoing_type() {
        let params: SnapshotParams =
            serde_json::from_value(serde_json::json!({"since": -1, "patientIds": ["p1"]}))
                .unwrap();
        let schema = ward_schema();
        let request = params.into_request(Uuid::nil(), &schema);

        assert_eq!(request.since, INITIAL_SYNC_TICK);
        assert_eq!(request.patient_ids, vec!["p1".to_string()]);
        assert_eq!(request.until, None);
        assert!(request.entity_types.contains(&"patient".to_string()));
        assert!(!request.entity_types.contains(&"reportRequest".to_string()));
    }

    #[test]
    fn params_carry_scope_and_overrides() {
        let params: SnapshotParams = serde_json::from_value(serde_json::json!({
            "since": 10,
            "until": 20,
            "facilityId": "f1",
            "entityTypes": ["labRequest"],
            "syncAllTypes": ["labRequest"],
        }))
        .unwrap();
        let request = params.into_request(Uuid::nil(), &ward_schema());

        assert_eq!(request.until, Some(20));
        assert_eq!(request.facility_id.as_deref(), Some("f1"));
        assert_eq!(request.entity_types, vec!["labRequest".to_string()]);
        assert!(request.session_config.syncs_all("labRequest"));
    }

    #[test]
    fn scope_per_type() {
        let schema = ward_schema();
        let request = SnapshotRequest::new(Uuid::nil(), 0);

        assert_eq!(type_scope(&schema, "patient", &request).unwrap(), Some(RowScope::All));
        assert_eq!(type_scope(&schema, "encounter", &request).unwrap(), None);
        assert_eq!(type_scope(&schema, "reportRequest", &request).unwrap(), None);
        assert!(type_scope(&schema, "nope", &request).is_err());

        let request = request.patients(["p1"]);
        assert_eq!(
            type_scope(&schema, "encounter", &request).unwrap(),
            Some(RowScope::column("patientId", vec!["p1".to_string()]))
        );
    }
}
