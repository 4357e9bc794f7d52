//! Export handler: pages a channel out as wire records.

use crate::db;
use crate::error::{AppError, Result};
use serde::Deserialize;
use sqlx::{PgConnection, PgPool};
use std::collections::HashMap;
use ward_engine::{
    ChannelRouter, Cursor, EntityName, ExportPage, ExportPlan, ExportQuery, NestedPlan, Row,
    RowQuery, RowSource, Schema, Tick, INITIAL_SYNC_TICK,
};

/// Query parameters for export.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportParams {
    /// Channel descriptor
    pub channel: String,
    pub since: Option<Tick>,
    pub until: Option<Tick>,
    pub limit: Option<usize>,
    /// Token returned with the previous page
    pub cursor: Option<String>,
}

impl ExportParams {
    /// The engine query for these parameters.
    pub fn to_query(&self) -> Result<ExportQuery> {
        let cursor = match self.cursor.as_deref() {
            Some("") | None => None,
            Some(token) => Some(token.parse::<Cursor>()?),
        };
        let mut query = ExportQuery::since(self.since.unwrap_or(INITIAL_SYNC_TICK)).cursor(cursor);
        if let Some(until) = self.until {
            query = query.until(until);
        }
        if let Some(limit) = self.limit {
            query = query.limit(limit);
        }
        Ok(query)
    }
}

/// Rows read up front from the database, served to the engine's export
/// logic as a consistent view.
#[derive(Debug, Default)]
pub struct PrefetchedRows {
    tick: Tick,
    rows: HashMap<EntityName, Vec<Row>>,
}

impl PrefetchedRows {
    fn add(&mut self, entity: &str, rows: Vec<Row>) {
        self.rows.entry(entity.to_string()).or_default().extend(rows);
    }
}

impl RowSource for PrefetchedRows {
    fn snapshot_tick(&self) -> Tick {
        self.tick
    }

    fn changed_rows(&self, entity: &str, query: &RowQuery) -> ward_engine::error::Result<Vec<Row>> {
        let mut rows: Vec<Row> = self
            .rows
            .get(entity)
            .into_iter()
            .flatten()
            .filter(|row| query.accepts(row))
            .cloned()
            .collect();
        rows.sort_by(|a, b| (a.updated_at_tick, &a.id).cmp(&(b.updated_at_tick, &b.id)));
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    fn children(
        &self,
        entity: &str,
        foreign_key: &str,
        parent_id: &str,
    ) -> ward_engine::error::Result<Vec<Row>> {
        let mut rows: Vec<Row> = self
            .rows
            .get(entity)
            .into_iter()
            .flatten()
            .filter(|row| row.column_str(foreign_key) == Some(parent_id))
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(rows)
    }
}

/// Export one page of a channel inside a repeatable-read transaction.
pub async fn handle_export(
    pool: &PgPool,
    schema: &Schema,
    router: &ChannelRouter,
    params: ExportParams,
) -> Result<ExportPage> {
    let channel = router.resolve(&params.channel)?;
    let plan = ExportPlan::compile(schema, channel)?;
    let query = params.to_query()?;

    let mut tx = pool.begin().await?;
    sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ")
        .execute(&mut *tx)
        .await?;
    let source = prefetch(&mut *tx, &plan, &query).await?;
    tx.commit().await?;

    plan.execute_in(&source, &query).map_err(AppError::from)
}

/// Load the page's root rows and, level by level, the children of the live
/// rows above them.
async fn prefetch(
    conn: &mut PgConnection,
    plan: &ExportPlan,
    query: &ExportQuery,
) -> Result<PrefetchedRows> {
    let mut source = PrefetchedRows {
        tick: db::current_tick(&mut *conn).await?,
        ..PrefetchedRows::default()
    };
    let row_query = RowQuery::since(query.since)
        .until(query.until)
        .scope(plan.row_scope())
        .after(query.cursor.clone())
        .limit(query.page_size());
    let roots = db::changed_rows(&mut *conn, &plan.root_type, &row_query).await?;

    let mut queue: Vec<(&[NestedPlan], Vec<String>)> =
        vec![(plan.nested_associations.as_slice(), live_ids(&roots))];
    source.add(&plan.root_type, roots);

    while let Some((nested, parent_ids)) = queue.pop() {
        if parent_ids.is_empty() {
            continue;
        }
        for assoc in nested {
            let children = db::load_rows(
                &mut *conn,
                &assoc.target,
                &[],
                Some((assoc.foreign_key.as_str(), parent_ids.as_slice())),
            )
            .await?;
            queue.push((assoc.nested.as_slice(), live_ids(&children)));
            source.add(&assoc.target, children);
        }
    }
    Ok(source)
}

fn live_ids(rows: &[Row]) -> Vec<String> {
    rows.iter()
        .filter(|row| row.is_active())
        .map(|row| row.id.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ward_schema;
    use serde_json::json;
    use ward_engine::Fields;

    fn row(id: &str, tick: Tick, fields: serde_json::Value) -> Row {
        let mut row = Row::new(id, fields.as_object().cloned().unwrap_or_else(Fields::new));
        row.updated_at_tick = tick;
        row
    }

    #[test]
    fn params_to_query() {
        let params = ExportParams {
            channel: "patient".into(),
            since: Some(10),
            until: Some(20),
            limit: Some(5000),
            cursor: Some("12_p1".into()),
        };
        let query = params.to_query().unwrap();
        assert_eq!(query.since, 10);
        assert_eq!(query.until, Some(20));
        assert_eq!(query.page_size(), 1000);
        assert_eq!(query.cursor, Some(Cursor::new(12, "p1")));

        let params = ExportParams {
            channel: "patient".into(),
            since: None,
            until: None,
            limit: None,
            cursor: Some("garbage".into()),
        };
        assert!(params.to_query().is_err());
    }

    #[test]
    fn prefetched_rows_export_with_nesting() {
        let schema = ward_schema();
        let router = ChannelRouter::new(&schema);
        let plan =
            ExportPlan::compile(&schema, router.resolve("patient/p1/encounter").unwrap()).unwrap();

        let mut source = PrefetchedRows {
            tick: 10,
            ..PrefetchedRows::default()
        };
        source.add(
            "encounter",
            vec![row("e1", 4, json!({"patientId": "p1"}))],
        );
        let mut gone = row("d2", 6, json!({"encounterId": "e1"}));
        gone.deleted_at = Some(1);
        source.add(
            "encounterDiagnosis",
            vec![row("d1", 6, json!({"encounterId": "e1", "certainty": "confirmed"})), gone],
        );

        let page = plan.execute_in(&source, &ExportQuery::default()).unwrap();
        assert_eq!(page.records.len(), 1);
        let diagnoses = page.records[0].data["diagnoses"].as_array().unwrap();
        assert_eq!(diagnoses.len(), 1);
        assert_eq!(diagnoses[0]["data"]["id"], "d1");
        assert_eq!(page.records[0].data["medications"], json!([]));
    }
}
