//! Import plans: applying a peer's wire records.
//!
//! Each incoming root record, together with everything nested inside it, is
//! one unit of work. Units are staged separately and only merged into the
//! batch once they have applied cleanly, so a malformed record is rejected on
//! its own while its siblings go through. A conflict is different: it aborts
//! the whole batch and nothing is written.

use crate::channel::ResolvedChannel;
use crate::clock::Provenance;
use crate::config::SyncConfig;
use crate::plan::{NestedPlan, Plan};
use crate::record::{Fields, Row, SyncRecord};
use crate::schema::{is_bookkeeping, AssociationKind, EntityType, Schema};
use crate::store::{merge_fields, retain_columns, Store, WriteTxn};
use crate::{error::Result, EntityName, Error, ErrorKind, RecordId, Tick, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::ops::Deref;

/// What happened to one imported record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ImportOutcome {
    Created,
    Updated,
    Tombstoned,
    Revived,
    /// Nothing to write: an identical record, or a delete marker for a row
    /// that is already deleted
    Unchanged,
}

/// Decide the transition for one incoming record.
///
/// An edit without a delete marker against a tombstoned row is a conflict
/// unless the type is revivable, in which case the tombstone is cleared. A
/// delete marker for a row never seen here still leaves a tombstone, so the
/// deletion travels on and later edits to that id are refused.
pub fn decide(
    entity: &str,
    existing: Option<&Row>,
    incoming: &SyncRecord,
    revivable: bool,
) -> Result<ImportOutcome> {
    match (existing, incoming.is_deleted) {
        (None, true) => Ok(ImportOutcome::Tombstoned),
        (None, false) => Ok(ImportOutcome::Created),
        (Some(row), true) if row.is_deleted() => Ok(ImportOutcome::Unchanged),
        (Some(_), true) => Ok(ImportOutcome::Tombstoned),
        (Some(row), false) if row.is_active() => Ok(ImportOutcome::Updated),
        (Some(_), false) if revivable => Ok(ImportOutcome::Revived),
        (Some(row), false) => Err(Error::Conflict {
            entity: entity.to_string(),
            id: row.id.clone(),
        }),
    }
}

/// Somewhere import units can read current rows from and stage writes to.
pub trait ImportTarget {
    fn get(&self, entity: &str, id: &str) -> Result<Option<Row>>;

    /// Rows whose `foreign_key` holds `parent_id`, ordered by id.
    fn children(&self, entity: &str, foreign_key: &str, parent_id: &str) -> Result<Vec<Row>>;

    fn put(&mut self, entity: &str, row: Row) -> Result<()>;
}

impl ImportTarget for WriteTxn<'_> {
    fn get(&self, entity: &str, id: &str) -> Result<Option<Row>> {
        WriteTxn::get(self, entity, id)
    }

    fn children(&self, entity: &str, foreign_key: &str, parent_id: &str) -> Result<Vec<Row>> {
        WriteTxn::children(self, entity, foreign_key, parent_id)
    }

    fn put(&mut self, entity: &str, row: Row) -> Result<()> {
        WriteTxn::put(self, entity, row)
    }
}

/// Rows loaded up front from an external store, plus the writes staged
/// against them. Lets the import logic run against a store that cannot be
/// queried synchronously.
#[derive(Debug, Clone, Default)]
pub struct StagedRows {
    existing: BTreeMap<(EntityName, RecordId), Row>,
    writes: BTreeMap<(EntityName, RecordId), Row>,
}

impl StagedRows {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a row as it currently exists in the backing store.
    pub fn load(&mut self, entity: &str, row: Row) {
        self.existing.insert((entity.to_string(), row.id.clone()), row);
    }

    /// The staged writes, in `(entity, id)` order.
    pub fn into_writes(self) -> Vec<(EntityName, Row)> {
        self.writes
            .into_iter()
            .map(|((entity, _), row)| (entity, row))
            .collect()
    }

    pub fn write_count(&self) -> usize {
        self.writes.len()
    }
}

impl ImportTarget for StagedRows {
    fn get(&self, entity: &str, id: &str) -> Result<Option<Row>> {
        let key = (entity.to_string(), id.to_string());
        Ok(self
            .writes
            .get(&key)
            .or_else(|| self.existing.get(&key))
            .cloned())
    }

    fn children(&self, entity: &str, foreign_key: &str, parent_id: &str) -> Result<Vec<Row>> {
        let mut rows: BTreeMap<&str, &Row> = BTreeMap::new();
        for source in [&self.existing, &self.writes] {
            for ((row_entity, id), row) in source {
                if row_entity == entity {
                    rows.insert(id.as_str(), row);
                }
            }
        }
        Ok(rows
            .into_values()
            .filter(|row| row.column_str(foreign_key) == Some(parent_id))
            .cloned()
            .collect())
    }

    fn put(&mut self, entity: &str, row: Row) -> Result<()> {
        self.writes.insert((entity.to_string(), row.id.clone()), row);
        Ok(())
    }
}

/// Outcome of one root record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordOutcome {
    pub id: RecordId,
    pub outcome: ImportOutcome,
}

/// A record rejected on its own without affecting the batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedRecord {
    /// Position in the incoming batch
    pub index: usize,
    pub id: Option<RecordId>,
    pub reason: String,
}

/// Result of applying one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportReport {
    pub outcomes: Vec<RecordOutcome>,
    pub rejected: Vec<RejectedRecord>,
    /// Tick the batch's writes were stamped with, if anything was written
    pub tick: Option<Tick>,
}

impl ImportReport {
    pub fn count(&self, outcome: ImportOutcome) -> usize {
        self.outcomes.iter().filter(|o| o.outcome == outcome).count()
    }

    pub fn merge(&mut self, other: ImportReport) {
        let offset = self.outcomes.len() + self.rejected.len();
        self.outcomes.extend(other.outcomes);
        self.rejected
            .extend(other.rejected.into_iter().map(|mut r| {
                r.index += offset;
                r
            }));
    }
}

/// A channel compiled for import.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportPlan(Plan);

impl Deref for ImportPlan {
    type Target = Plan;

    fn deref(&self) -> &Plan {
        &self.0
    }
}

impl ImportPlan {
    pub fn compile(schema: &Schema, channel: ResolvedChannel) -> Result<Self> {
        Plan::compile(schema, channel).map(Self)
    }

    /// Apply a batch in its own write transaction.
    pub fn execute(
        &self,
        store: &Store,
        records: &[SyncRecord],
        config: &SyncConfig,
        now: Timestamp,
    ) -> Result<ImportReport> {
        let mut txn = store.begin_write(Provenance::Synced);
        let mut report = self.apply(store.schema(), &mut txn, records, config, now)?;
        report.tick = txn.commit();
        Ok(report)
    }

    /// Every child carried inside `records`, at any depth, with its type.
    /// Items that do not parse are skipped.
    pub fn nested_records(&self, records: &[SyncRecord]) -> Vec<(EntityName, SyncRecord)> {
        let mut found = Vec::new();
        collect_nested(records, &self.nested_associations, &mut found);
        found
    }

    /// Apply a batch to `target` without committing. On error the target may
    /// hold part of the batch and must be discarded.
    pub fn apply<T: ImportTarget>(
        &self,
        schema: &Schema,
        target: &mut T,
        records: &[SyncRecord],
        config: &SyncConfig,
        now: Timestamp,
    ) -> Result<ImportReport> {
        let root = schema.require(&self.root_type)?;
        let mut report = ImportReport::default();

        for (index, record) in records.iter().enumerate() {
            let mut unit = Unit {
                schema,
                config,
                now,
                base: &*target,
                staged: BTreeMap::new(),
            };
            match unit.apply(root, record, self.forced_parent(), &self.nested_associations) {
                Ok(outcome) => {
                    let writes = unit.staged;
                    for ((entity, _), row) in writes {
                        target.put(&entity, row)?;
                    }
                    report.outcomes.push(RecordOutcome {
                        id: record.id().unwrap_or_default().to_string(),
                        outcome,
                    });
                }
                Err(err) if err.kind() == ErrorKind::Validation => {
                    tracing::debug!(entity = %root.name, index, error = %err, "rejected record");
                    report.rejected.push(RejectedRecord {
                        index,
                        id: record.id().map(str::to_string),
                        reason: err.to_string(),
                    });
                }
                Err(err) => {
                    tracing::warn!(entity = %root.name, index, error = %err, "import batch aborted");
                    return Err(err);
                }
            }
        }

        tracing::debug!(
            entity = %root.name,
            applied = report.outcomes.len(),
            rejected = report.rejected.len(),
            "applied import batch"
        );
        Ok(report)
    }
}

/// Writes for one root record and its nested children.
struct Unit<'a, T: ImportTarget> {
    schema: &'a Schema,
    config: &'a SyncConfig,
    now: Timestamp,
    base: &'a T,
    staged: BTreeMap<(EntityName, RecordId), Row>,
}

impl<T: ImportTarget> Unit<'_, T> {
    fn get(&self, entity: &str, id: &str) -> Result<Option<Row>> {
        match self.staged.get(&(entity.to_string(), id.to_string())) {
            Some(row) => Ok(Some(row.clone())),
            None => self.base.get(entity, id),
        }
    }

    fn children(&self, entity: &str, foreign_key: &str, parent_id: &str) -> Result<Vec<Row>> {
        let mut rows: BTreeMap<RecordId, Row> = self
            .base
            .children(entity, foreign_key, parent_id)?
            .into_iter()
            .map(|row| (row.id.clone(), row))
            .collect();
        for ((staged_entity, id), row) in &self.staged {
            if staged_entity != entity {
                continue;
            }
            if row.column_str(foreign_key) == Some(parent_id) {
                rows.insert(id.clone(), row.clone());
            } else {
                rows.remove(id);
            }
        }
        Ok(rows.into_values().collect())
    }

    fn put(&mut self, entity: &EntityType, mut row: Row) {
        if entity.push_tracked {
            row.pulled_at = Some(self.now);
            row.marked_for_push = false;
        }
        self.staged.insert((entity.name.clone(), row.id.clone()), row);
    }

    fn apply(
        &mut self,
        entity: &EntityType,
        record: &SyncRecord,
        parent: Option<(&str, &str)>,
        nested: &[NestedPlan],
    ) -> Result<ImportOutcome> {
        let id = record.id().ok_or(Error::MissingId)?.to_string();
        let existing = self.get(&entity.name, &id)?;
        let outcome = decide(
            &entity.name,
            existing.as_ref(),
            record,
            self.config.is_revivable(&entity.name),
        )?;

        match (outcome, existing) {
            (ImportOutcome::Unchanged, _) => Ok(ImportOutcome::Unchanged),
            (ImportOutcome::Tombstoned, Some(row)) => {
                self.tombstone(entity, row, nested)?;
                Ok(ImportOutcome::Tombstoned)
            }
            (ImportOutcome::Tombstoned, None) => {
                let mut row = Row::new(id, Fields::new());
                merge_fields(&mut row.fields, &incoming_fields(&record.data, nested));
                if let Some((column, parent_id)) = parent {
                    row.fields
                        .insert(column.to_string(), Value::String(parent_id.to_string()));
                }
                self.tombstone(entity, row, nested)?;
                Ok(ImportOutcome::Tombstoned)
            }
            (outcome, existing) => {
                let mut row = existing.unwrap_or_else(|| Row::new(id.clone(), Fields::new()));
                let before = (row.fields.clone(), row.deleted_at);

                merge_fields(&mut row.fields, &incoming_fields(&record.data, nested));
                if let Some((column, parent_id)) = parent {
                    row.fields
                        .insert(column.to_string(), Value::String(parent_id.to_string()));
                }
                if outcome == ImportOutcome::Revived {
                    row.deleted_at = None;
                }
                entity
                    .validate_data(&row.fields)
                    .map_err(|err| Error::InvalidPayload {
                        id: id.clone(),
                        reason: err.to_string(),
                    })?;

                // A row still pending push must be staged to be marked pulled
                let row_changed = outcome != ImportOutcome::Updated
                    || (entity.push_tracked && row.marked_for_push)
                    || before != (row.fields.clone(), row.deleted_at);
                if row_changed {
                    self.put(entity, row);
                }

                let mut children_changed = false;
                for assoc in nested {
                    children_changed |= self.apply_nested(assoc, &id, record.data.get(&assoc.name))?;
                }

                if outcome == ImportOutcome::Updated && !row_changed && !children_changed {
                    Ok(ImportOutcome::Unchanged)
                } else {
                    Ok(outcome)
                }
            }
        }
    }

    /// Upsert one nested collection. Returns whether anything was written.
    fn apply_nested(
        &mut self,
        assoc: &NestedPlan,
        parent_id: &str,
        collection: Option<&Value>,
    ) -> Result<bool> {
        // An absent collection leaves the children alone
        let Some(collection) = collection else {
            return Ok(false);
        };
        let items = collection.as_array().ok_or_else(|| Error::InvalidPayload {
            id: parent_id.to_string(),
            reason: format!("'{}' is not an array", assoc.name),
        })?;
        let schema = self.schema;
        let child_type = schema.require(&assoc.target)?;

        let mut seen = HashSet::new();
        let mut changed = false;
        for item in items {
            let child = SyncRecord::from_value(item)?;
            let child_id = child.id().ok_or(Error::MissingId)?.to_string();
            let outcome = self.apply(
                child_type,
                &child,
                Some((assoc.foreign_key.as_str(), parent_id)),
                &assoc.nested,
            )?;
            changed |= outcome != ImportOutcome::Unchanged;
            seen.insert(child_id);
        }

        if assoc.kind == AssociationKind::ReplacingSet {
            for row in self.children(&assoc.target, &assoc.foreign_key, parent_id)? {
                if row.is_active() && !seen.contains(&row.id) {
                    self.tombstone(child_type, row, &assoc.nested)?;
                    changed = true;
                }
            }
        }
        Ok(changed)
    }

    /// Soft-delete a row, keeping only the columns needed to route the
    /// tombstone, and cascade to its travelling children.
    fn tombstone(&mut self, entity: &EntityType, mut row: Row, nested: &[NestedPlan]) -> Result<()> {
        retain_columns(&mut row.fields, &self.schema.structural_columns(entity));
        row.deleted_at = Some(self.now);
        let id = row.id.clone();
        self.put(entity, row);

        let schema = self.schema;
        for assoc in nested {
            let child_type = schema.require(&assoc.target)?;
            for child in self.children(&assoc.target, &assoc.foreign_key, &id)? {
                if child.is_active() {
                    self.tombstone(child_type, child, &assoc.nested)?;
                }
            }
        }
        Ok(())
    }
}

fn collect_nested(
    records: &[SyncRecord],
    nested: &[NestedPlan],
    found: &mut Vec<(EntityName, SyncRecord)>,
) {
    for assoc in nested {
        let children: Vec<SyncRecord> = records
            .iter()
            .filter_map(|r| r.data.get(&assoc.name).and_then(Value::as_array))
            .flatten()
            .filter_map(|item| SyncRecord::from_value(item).ok())
            .collect();
        collect_nested(&children, &assoc.nested, found);
        found.extend(children.into_iter().map(|child| (assoc.target.clone(), child)));
    }
}

/// Clinical fields of an incoming payload: bookkeeping columns and nested
/// collections are not fields.
fn incoming_fields(data: &Fields, nested: &[NestedPlan]) -> Fields {
    data.iter()
        .filter(|(key, _)| {
            !is_bookkeeping(key) && !nested.iter().any(|assoc| &assoc.name == *key)
        })
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}
