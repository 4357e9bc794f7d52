//! Push handler: applies a batch of records sent by a peer.

use super::session::{connect, mark_errored};
use crate::db;
use crate::error::{AppError, Result};
use serde::Deserialize;
use serde_json::Value;
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;
use ward_engine::{
    ChannelRouter, EntityName, Error, ErrorKind, ImportPlan, ImportReport, NestedPlan, Schema,
    StagedRows, SyncConfig, SyncRecord, Timestamp, INITIAL_SYNC_TICK,
};

/// Request body for push sync.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    /// Channel descriptor the records belong to
    pub channel: String,
    pub records: Vec<SyncRecord>,
}

/// Apply one pushed batch in a single transaction.
///
/// A conflict anywhere rejects the whole batch and marks the session
/// errored; malformed records are only reported.
pub async fn handle_push(
    pool: &PgPool,
    schema: &Schema,
    router: &ChannelRouter,
    config: &SyncConfig,
    session_id: Uuid,
    request: PushRequest,
    now: Timestamp,
) -> Result<ImportReport> {
    connect(pool, config, session_id, now).await?;

    let channel = router.resolve(&request.channel)?;
    let plan = ImportPlan::compile(schema, channel)?;
    if !schema.require(&plan.root_type)?.sync_direction.flows_inward() {
        return Err(Error::NotSynced(plan.root_type.clone()).into());
    }

    let mut tx = pool.begin().await?;
    let report = match apply_batch(&mut *tx, schema, &plan, &request.records, config, now).await {
        Ok(report) => report,
        Err(err) => {
            drop(tx);
            if matches!(&err, AppError::Engine(e) if e.kind() == ErrorKind::Conflict) {
                mark_errored(pool, session_id, &err.to_string()).await;
            }
            return Err(err);
        }
    };
    db::insert_incoming_records(
        &mut *tx,
        session_id,
        &incoming_rows(&plan, &request.records),
        report.tick.unwrap_or(INITIAL_SYNC_TICK),
    )
    .await?;
    tx.commit().await?;

    tracing::info!(
        session_id = %session_id,
        channel = %request.channel,
        applied = report.outcomes.len(),
        rejected = report.rejected.len(),
        tick = ?report.tick,
        "persisted incoming changes"
    );
    Ok(report)
}

/// Apply a batch inside the caller's transaction and write the result.
///
/// The clock row is locked before any row is read and stays locked until the
/// transaction ends, so concurrent batches apply one after another, each
/// against the rows the previous one committed.
async fn apply_batch(
    conn: &mut PgConnection,
    schema: &Schema,
    plan: &ImportPlan,
    records: &[SyncRecord],
    config: &SyncConfig,
    now: Timestamp,
) -> Result<ImportReport> {
    db::lock_clock(&mut *conn).await?;
    let mut staged = prefetch(&mut *conn, plan, records).await?;
    let mut report = plan.apply(schema, &mut staged, records, config, now)?;

    if staged.write_count() > 0 {
        let tick = db::tick_tock(&mut *conn).await?.tick;
        db::upsert_rows(&mut *conn, &staged.into_writes(), tick).await?;
        report.tick = Some(tick);
    }
    Ok(report)
}

/// The pushed roots and every child nested inside them, each with its type.
fn incoming_rows(plan: &ImportPlan, records: &[SyncRecord]) -> Vec<(EntityName, SyncRecord)> {
    let mut rows: Vec<(EntityName, SyncRecord)> = records
        .iter()
        .map(|record| (plan.root_type.clone(), record.clone()))
        .collect();
    rows.extend(plan.nested_records(records));
    rows
}

/// One level of the record tree to load before applying.
struct Level<'p> {
    entity: &'p str,
    /// Foreign key and parent ids, for nested levels
    parent: Option<(&'p str, Vec<String>)>,
    nested: &'p [NestedPlan],
    records: Vec<SyncRecord>,
}

/// Load every stored row the batch can touch: the records themselves, and at
/// each nested level both the incoming children and the stored children of
/// their parents.
async fn prefetch(
    conn: &mut PgConnection,
    plan: &ImportPlan,
    records: &[SyncRecord],
) -> Result<StagedRows> {
    let mut staged = StagedRows::new();
    let mut queue = vec![Level {
        entity: plan.root_type.as_str(),
        parent: None,
        nested: &plan.nested_associations,
        records: records.to_vec(),
    }];

    while let Some(level) = queue.pop() {
        let mut ids = record_ids(&level.records);
        let parent = level
            .parent
            .as_ref()
            .map(|(column, parent_ids)| (*column, parent_ids.as_slice()));
        let rows = db::load_rows(&mut *conn, level.entity, &ids, parent).await?;
        for row in rows {
            if !ids.contains(&row.id) {
                ids.push(row.id.clone());
            }
            staged.load(level.entity, row);
        }
        if ids.is_empty() {
            continue;
        }

        for assoc in level.nested {
            queue.push(Level {
                entity: assoc.target.as_str(),
                parent: Some((assoc.foreign_key.as_str(), ids.clone())),
                nested: &assoc.nested,
                records: nested_records(&level.records, &assoc.name),
            });
        }
    }
    Ok(staged)
}

fn record_ids(records: &[SyncRecord]) -> Vec<String> {
    let mut ids: Vec<String> = records
        .iter()
        .filter_map(|r| r.id().map(str::to_string))
        .collect();
    ids.sort();
    ids.dedup();
    ids
}

/// Children carried under `name`. Items that fail to parse are skipped here
/// and rejected when the batch is applied.
fn nested_records(records: &[SyncRecord], name: &str) -> Vec<SyncRecord> {
    records
        .iter()
        .filter_map(|r| r.data.get(name).and_then(Value::as_array))
        .flatten()
        .filter_map(|item| SyncRecord::from_value(item).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ward_schema;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use ward_engine::ImportOutcome;

    fn records(value: Value) -> Vec<SyncRecord> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn request_shape() {
        let request: PushRequest = serde_json::from_value(json!({
            "channel": "patient/p1/encounter",
            "records": [
                {"data": {"id": "e1", "diagnoses": [{"data": {"id": "d1"}}]}},
                {"data": {"id": "e2"}, "isDeleted": true},
            ],
        }))
        .unwrap();
        assert_eq!(request.channel, "patient/p1/encounter");
        assert_eq!(request.records.len(), 2);
        assert!(request.records[1].is_deleted);
    }

    #[test]
    fn ids_and_nested_children() {
        let batch = records(json!([
            {"data": {"id": "e2", "diagnoses": [{"data": {"id": "d1"}}, {"bogus": 1}]}},
            {"data": {"id": "e1", "diagnoses": [{"data": {"id": "d2"}}]}},
            {"data": {"id": "e1"}},
            {"data": {"reason": "no id"}},
        ]));
        assert_eq!(record_ids(&batch), vec!["e1", "e2"]);

        let children = nested_records(&batch, "diagnoses");
        let ids: Vec<&str> = children.iter().filter_map(SyncRecord::id).collect();
        assert_eq!(ids, vec!["d1", "d2"]);
        assert!(nested_records(&batch, "medications").is_empty());
    }

    #[test]
    fn incoming_rows_include_nested_children() {
        let schema = ward_schema();
        let router = ChannelRouter::new(&schema);
        let plan = ImportPlan::compile(&schema, router.resolve("encounter").unwrap()).unwrap();
        let batch = records(json!([
            {"data": {"id": "e1", "diagnoses": [{"data": {"id": "d1"}}]}},
            {"data": {"id": "e2"}, "isDeleted": true},
        ]));

        let rows: Vec<(String, String)> = incoming_rows(&plan, &batch)
            .into_iter()
            .map(|(entity, r)| (entity, r.id().unwrap_or_default().to_string()))
            .collect();
        assert_eq!(
            rows,
            vec![
                ("encounter".to_string(), "e1".to_string()),
                ("encounter".to_string(), "e2".to_string()),
                ("encounterDiagnosis".to_string(), "d1".to_string()),
            ]
        );
    }

    #[tokio::test]
    #[ignore = "requires a PostgreSQL database in DATABASE_URL"]
    async fn concurrent_edit_cannot_revive_a_tombstone() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let pool = db::create_pool(&url, 4).await.unwrap();
        db::run_migrations(&pool).await.unwrap();

        let schema = Arc::new(ward_schema());
        let router = ChannelRouter::new(&schema);
        let plan = Arc::new(ImportPlan::compile(&schema, router.resolve("patient").unwrap()).unwrap());
        let config = SyncConfig::default();
        let id = Uuid::new_v4().to_string();

        let seed = records(json!([{"data": {"id": id, "displayId": "A"}}]));
        let mut tx = pool.begin().await.unwrap();
        apply_batch(&mut *tx, &schema, &plan, &seed, &config, 1).await.unwrap();
        tx.commit().await.unwrap();

        // The first session deletes and keeps its transaction open
        let mut first = pool.begin().await.unwrap();
        let report = apply_batch(
            &mut *first,
            &schema,
            &plan,
            &[SyncRecord::tombstone(id.clone())],
            &config,
            2,
        )
        .await
        .unwrap();
        assert_eq!(report.count(ImportOutcome::Tombstoned), 1);

        // The second session edits the same record meanwhile
        let edit = records(json!([{"data": {"id": id, "displayId": "A", "firstName": "Bea"}}]));
        let second = tokio::spawn({
            let (pool, schema, plan) = (pool.clone(), schema.clone(), plan.clone());
            async move {
                let mut tx = pool.begin().await?;
                let report =
                    apply_batch(&mut *tx, &schema, &plan, &edit, &SyncConfig::default(), 3).await?;
                tx.commit().await?;
                Ok::<_, AppError>(report)
            }
        });
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!second.is_finished(), "second batch read before the first committed");
        first.commit().await.unwrap();

        let err = second.await.unwrap().unwrap_err();
        assert!(matches!(&err, AppError::Engine(e) if e.kind() == ErrorKind::Conflict));

        let mut conn = pool.acquire().await.unwrap();
        let rows = db::load_rows(&mut *conn, "patient", &[id.clone()], None)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].is_deleted());
        assert_eq!(rows[0].column_str("firstName"), None);
    }
}
