//! Export plans: paging a channel's changes out as wire records.

use crate::channel::ResolvedChannel;
use crate::cursor::Cursor;
use crate::plan::{NestedPlan, Plan};
use crate::record::{Row, SyncRecord};
use crate::schema::Schema;
use crate::store::{RowQuery, RowSource, Store};
use crate::{error::Result, Tick, INITIAL_SYNC_TICK};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::ops::Deref;

/// Page size when the caller does not ask for one.
pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Largest page a caller can ask for.
pub const MAX_PAGE_SIZE: usize = 1000;

fn initial_tick() -> Tick {
    INITIAL_SYNC_TICK
}

/// Parameters of one export page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportQuery {
    /// Exclusive lower tick bound
    #[serde(default = "initial_tick")]
    pub since: Tick,
    /// Inclusive upper tick bound
    #[serde(default)]
    pub until: Option<Tick>,
    #[serde(default)]
    pub limit: Option<usize>,
    /// Position returned with the previous page
    #[serde(default)]
    pub cursor: Option<Cursor>,
}

impl Default for ExportQuery {
    fn default() -> Self {
        Self::since(INITIAL_SYNC_TICK)
    }
}

impl ExportQuery {
    pub fn since(since: Tick) -> Self {
        Self {
            since,
            until: None,
            limit: None,
            cursor: None,
        }
    }

    pub fn until(mut self, until: Tick) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn cursor(mut self, cursor: Option<Cursor>) -> Self {
        self.cursor = cursor;
        self
    }

    /// The effective page size.
    pub fn page_size(&self) -> usize {
        self.limit
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE)
    }
}

/// One page of exported records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportPage {
    pub records: Vec<SyncRecord>,
    /// Where the next page starts; `None` once the result set is exhausted
    pub next_cursor: Option<Cursor>,
}

/// A channel compiled for export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportPlan(Plan);

impl Deref for ExportPlan {
    type Target = Plan;

    fn deref(&self) -> &Plan {
        &self.0
    }
}

impl ExportPlan {
    pub fn compile(schema: &Schema, channel: ResolvedChannel) -> Result<Self> {
        Plan::compile(schema, channel).map(Self)
    }

    /// Export one page in its own short read transaction.
    pub fn execute(&self, store: &Store, query: &ExportQuery) -> Result<ExportPage> {
        let txn = store.begin_read();
        self.execute_in(&txn, query)
    }

    /// Export one page from an existing view.
    pub fn execute_in(&self, source: &impl RowSource, query: &ExportQuery) -> Result<ExportPage> {
        let limit = query.page_size();
        let row_query = RowQuery::since(query.since)
            .until(query.until)
            .scope(self.row_scope())
            .after(query.cursor.clone())
            .limit(limit);

        let rows = source.changed_rows(&self.root_type, &row_query)?;
        let next_cursor = if rows.len() == limit {
            rows.last()
                .map(|row| Cursor::new(row.updated_at_tick, row.id.clone()))
        } else {
            None
        };

        let records = rows
            .iter()
            .map(|row| export_row(source, row, &self.nested_associations))
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!(
            channel = %self.channel.channel,
            count = records.len(),
            since = query.since,
            "exported page"
        );
        Ok(ExportPage {
            records,
            next_cursor,
        })
    }
}

/// A row in wire form with its travelling children attached. Deleted rows
/// carry nothing but their id; deleted children are left out.
pub fn export_row(source: &impl RowSource, row: &Row, nested: &[NestedPlan]) -> Result<SyncRecord> {
    let mut record = row.to_sync_record();
    if record.is_deleted {
        return Ok(record);
    }

    for assoc in nested {
        let mut children = source.children(&assoc.target, &assoc.foreign_key, &row.id)?;
        children.retain(Row::is_active);
        children.sort_by(|a, b| a.id.cmp(&b.id));

        let items = children
            .iter()
            .map(|child| export_row(source, child, &assoc.nested).map(SyncRecord::into_value))
            .collect::<Result<Vec<_>>>()?;
        record.data.insert(assoc.name.clone(), Value::Array(items));
    }
    Ok(record)
}
