//! Store - the multi-version in-memory record store.
//!
//! Every committed write appends a new version of each row it touches, tagged
//! with a commit sequence number. A read transaction pins the sequence number
//! current when it began and only ever sees versions at or below it, which
//! gives repeatable-read isolation however long the reader runs and however
//! many writers commit meanwhile.
//!
//! Writers are serialized by a single write lock. A commit takes one clock
//! step while holding the state lock, so the set of versions a reader can see
//! and the tick it records as its upper bound always agree: every visible row
//! is stamped at or below the reader's tick, every invisible one above it.

use crate::clock::{Provenance, SharedClock, TickSource};
use crate::cursor::Cursor;
use crate::record::{Fields, Row};
use crate::schema::Schema;
use crate::{error::Result, EntityName, Error, RecordId, Tick, Timestamp};
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

type Seq = u64;

#[derive(Debug, Clone)]
struct Version {
    seq: Seq,
    row: Row,
}

type Table = BTreeMap<RecordId, Vec<Version>>;

#[derive(Debug, Default)]
struct Inner {
    tables: HashMap<EntityName, Table>,
    committed_seq: Seq,
    /// Open readers by pinned sequence
    readers: BTreeMap<Seq, usize>,
}

impl Inner {
    fn table(&self, entity: &str) -> Option<&Table> {
        self.tables.get(entity)
    }

    /// Oldest sequence any open reader, or any reader opened after the
    /// commit at `seq`, may still ask for.
    fn horizon(&self, seq: Seq) -> Seq {
        self.readers.keys().next().copied().unwrap_or(seq).min(seq)
    }
}

fn visible(versions: &[Version], seq: Seq) -> Option<&Row> {
    versions.iter().rev().find(|v| v.seq <= seq).map(|v| &v.row)
}

/// Drop versions no reader can reach: everything older than the newest
/// version at or below `horizon`.
fn prune(versions: &mut Vec<Version>, horizon: Seq) {
    if let Some(keep_from) = versions.iter().rposition(|v| v.seq <= horizon) {
        versions.drain(..keep_from);
    }
}

/// Row predicate applied by a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowScope {
    /// Every row
    All,
    /// Rows whose `column` holds one of `values`
    Column { column: String, values: Vec<String> },
}

impl RowScope {
    pub fn column(column: impl Into<String>, values: Vec<String>) -> Self {
        RowScope::Column {
            column: column.into(),
            values,
        }
    }

    pub fn matches(&self, row: &Row) -> bool {
        match self {
            RowScope::All => true,
            RowScope::Column { column, values } => row
                .column_str(column)
                .is_some_and(|v| values.iter().any(|want| want == v)),
        }
    }
}

/// Parameters of a change query: rows with `since < tick <= until`, inside
/// `scope`, strictly after `after`, ordered by `(tick, id)`.
#[derive(Debug, Clone)]
pub struct RowQuery {
    pub since: Tick,
    pub until: Option<Tick>,
    pub scope: RowScope,
    pub after: Option<Cursor>,
    pub limit: Option<usize>,
}

impl RowQuery {
    pub fn since(since: Tick) -> Self {
        Self {
            since,
            until: None,
            scope: RowScope::All,
            after: None,
            limit: None,
        }
    }

    pub fn until(mut self, until: Option<Tick>) -> Self {
        self.until = until;
        self
    }

    pub fn scope(mut self, scope: RowScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn after(mut self, after: Option<Cursor>) -> Self {
        self.after = after;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn accepts(&self, row: &Row) -> bool {
        row.updated_at_tick > self.since
            && self.until.map_or(true, |until| row.updated_at_tick <= until)
            && self
                .after
                .as_ref()
                .map_or(true, |cursor| cursor.precedes(row.updated_at_tick, &row.id))
            && self.scope.matches(row)
    }
}

/// Read access to a consistent view of the store.
pub trait RowSource {
    /// Highest tick the view can contain.
    fn snapshot_tick(&self) -> Tick;

    /// Rows matching `query`, ordered by `(updated_at_tick, id)`.
    fn changed_rows(&self, entity: &str, query: &RowQuery) -> Result<Vec<Row>>;

    /// Rows of `entity` whose `foreign_key` column holds `parent_id`, live and
    /// deleted, ordered by id.
    fn children(&self, entity: &str, foreign_key: &str, parent_id: &str) -> Result<Vec<Row>>;
}

/// The store. Clones are handles to the same data and clock.
#[derive(Debug, Clone)]
pub struct Store {
    schema: Arc<Schema>,
    clock: SharedClock,
    inner: Arc<RwLock<Inner>>,
    write_lock: Arc<Mutex<()>>,
}

impl Store {
    /// Create an empty store with a clock at zero.
    pub fn new(schema: Schema) -> Self {
        Self::with_clock(schema, SharedClock::new())
    }

    /// Create an empty store on an existing clock.
    pub fn with_clock(schema: Schema, clock: SharedClock) -> Self {
        let tables = schema
            .entities
            .keys()
            .map(|name| (name.clone(), Table::new()))
            .collect();

        Self {
            schema: Arc::new(schema),
            clock,
            inner: Arc::new(RwLock::new(Inner {
                tables,
                ..Inner::default()
            })),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Get the schema.
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Get the clock every commit is stamped from.
    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// Begin a repeatable-read transaction.
    pub fn begin_read(&self) -> ReadTxn<'_> {
        let mut inner = self.inner.write();
        let seq = inner.committed_seq;
        let tick = self.clock.current();
        *inner.readers.entry(seq).or_default() += 1;
        ReadTxn {
            store: self,
            seq,
            tick,
        }
    }

    /// Begin a write transaction, waiting for any other writer to finish.
    ///
    /// Only one write transaction exists at a time; opening a second one on
    /// the same thread deadlocks.
    pub fn begin_write(&self, provenance: Provenance) -> WriteTxn<'_> {
        let guard = self.write_lock.lock();
        WriteTxn {
            store: self,
            provenance,
            staged: BTreeMap::new(),
            _guard: guard,
        }
    }

    /// Latest committed version of a row.
    pub fn get(&self, entity: &str, id: &str) -> Result<Option<Row>> {
        let inner = self.inner.read();
        let table = inner
            .table(entity)
            .ok_or_else(|| Error::UnknownEntity(entity.to_string()))?;
        Ok(table
            .get(id)
            .and_then(|versions| versions.last())
            .map(|v| v.row.clone()))
    }

    /// Create a row locally.
    pub fn insert(&self, entity: &str, id: impl Into<RecordId>, mut fields: Fields) -> Result<Tick> {
        fields.remove("id");
        let mut txn = self.begin_write(Provenance::Local);
        txn.put(entity, Row::new(id, fields))?;
        Ok(txn.finish())
    }

    /// Merge `changes` into an existing row locally.
    pub fn update(&self, entity: &str, id: &str, changes: Fields) -> Result<Tick> {
        let mut txn = self.begin_write(Provenance::Local);
        let mut row = txn.get(entity, id)?.ok_or_else(|| Error::RecordNotFound {
            entity: entity.to_string(),
            id: id.to_string(),
        })?;
        for (key, value) in changes {
            if key != "id" {
                row.fields.insert(key, value);
            }
        }
        txn.put(entity, row)?;
        Ok(txn.finish())
    }

    /// Soft-delete a row locally.
    pub fn soft_delete(&self, entity: &str, id: &str, now: Timestamp) -> Result<Tick> {
        let mut txn = self.begin_write(Provenance::Local);
        let mut row = txn.get(entity, id)?.ok_or_else(|| Error::RecordNotFound {
            entity: entity.to_string(),
            id: id.to_string(),
        })?;
        row.deleted_at = Some(now);
        txn.put(entity, row)?;
        Ok(txn.finish())
    }

    fn apply(&self, provenance: Provenance, staged: BTreeMap<(EntityName, RecordId), Row>) -> Tick {
        let mut inner = self.inner.write();
        let tick = provenance.stamp(self.clock.tick_tock());
        let seq = inner.committed_seq + 1;
        let horizon = inner.horizon(seq);
        let count = staged.len();

        for ((entity, id), mut row) in staged {
            row.updated_at_tick = tick;
            if provenance == Provenance::Local
                && self.schema.get(&entity).is_some_and(|e| e.push_tracked)
            {
                row.marked_for_push = true;
            }
            let versions = inner
                .tables
                .entry(entity)
                .or_default()
                .entry(id)
                .or_default();
            versions.push(Version { seq, row });
            prune(versions, horizon);
        }
        inner.committed_seq = seq;

        tracing::trace!(tick, seq, rows = count, ?provenance, "committed");
        tick
    }
}

/// A repeatable-read view pinned at the moment it began.
#[derive(Debug)]
pub struct ReadTxn<'s> {
    store: &'s Store,
    seq: Seq,
    tick: Tick,
}

impl ReadTxn<'_> {
    /// Get a row as of the view.
    pub fn get(&self, entity: &str, id: &str) -> Result<Option<Row>> {
        let inner = self.store.inner.read();
        let table = inner
            .table(entity)
            .ok_or_else(|| Error::UnknownEntity(entity.to_string()))?;
        Ok(table
            .get(id)
            .and_then(|versions| visible(versions, self.seq))
            .cloned())
    }

    /// Number of rows of a type visible in the view, deleted ones included.
    pub fn count(&self, entity: &str) -> Result<usize> {
        let inner = self.store.inner.read();
        let table = inner
            .table(entity)
            .ok_or_else(|| Error::UnknownEntity(entity.to_string()))?;
        Ok(table
            .values()
            .filter(|versions| visible(versions, self.seq).is_some())
            .count())
    }
}

impl RowSource for ReadTxn<'_> {
    fn snapshot_tick(&self) -> Tick {
        self.tick
    }

    fn changed_rows(&self, entity: &str, query: &RowQuery) -> Result<Vec<Row>> {
        let inner = self.store.inner.read();
        let table = inner
            .table(entity)
            .ok_or_else(|| Error::IsolationViolation {
                entity: entity.to_string(),
                reason: "no such table".to_string(),
            })?;

        let mut rows: Vec<Row> = table
            .values()
            .filter_map(|versions| visible(versions, self.seq))
            .filter(|row| query.accepts(row))
            .cloned()
            .collect();
        rows.sort_by(|a, b| (a.updated_at_tick, &a.id).cmp(&(b.updated_at_tick, &b.id)));
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    fn children(&self, entity: &str, foreign_key: &str, parent_id: &str) -> Result<Vec<Row>> {
        let inner = self.store.inner.read();
        let table = inner
            .table(entity)
            .ok_or_else(|| Error::IsolationViolation {
                entity: entity.to_string(),
                reason: "no such table".to_string(),
            })?;
        Ok(table
            .values()
            .filter_map(|versions| visible(versions, self.seq))
            .filter(|row| row.column_str(foreign_key) == Some(parent_id))
            .cloned()
            .collect())
    }
}

impl Drop for ReadTxn<'_> {
    fn drop(&mut self) {
        let mut inner = self.store.inner.write();
        if let Some(count) = inner.readers.get_mut(&self.seq) {
            *count -= 1;
            if *count == 0 {
                inner.readers.remove(&self.seq);
            }
        }
    }
}

/// A write transaction. Staged rows become visible together at commit, all
/// stamped with the same tick; dropping the transaction discards them.
pub struct WriteTxn<'s> {
    store: &'s Store,
    provenance: Provenance,
    staged: BTreeMap<(EntityName, RecordId), Row>,
    _guard: MutexGuard<'s, ()>,
}

impl WriteTxn<'_> {
    pub fn provenance(&self) -> Provenance {
        self.provenance
    }

    pub fn schema(&self) -> &Schema {
        self.store.schema()
    }

    /// Latest version of a row, staged writes included.
    pub fn get(&self, entity: &str, id: &str) -> Result<Option<Row>> {
        if let Some(row) = self.staged.get(&(entity.to_string(), id.to_string())) {
            return Ok(Some(row.clone()));
        }
        self.store.get(entity, id)
    }

    /// Rows of `entity` whose `foreign_key` holds `parent_id`, staged writes
    /// included, ordered by id.
    pub fn children(&self, entity: &str, foreign_key: &str, parent_id: &str) -> Result<Vec<Row>> {
        let mut rows: BTreeMap<RecordId, Row> = {
            let inner = self.store.inner.read();
            let table = inner
                .table(entity)
                .ok_or_else(|| Error::UnknownEntity(entity.to_string()))?;
            table
                .iter()
                .filter_map(|(id, versions)| versions.last().map(|v| (id.clone(), v.row.clone())))
                .collect()
        };
        for ((staged_entity, id), row) in &self.staged {
            if staged_entity == entity {
                rows.insert(id.clone(), row.clone());
            }
        }
        Ok(rows
            .into_values()
            .filter(|row| row.column_str(foreign_key) == Some(parent_id))
            .collect())
    }

    /// Stage a row.
    pub fn put(&mut self, entity: &str, row: Row) -> Result<()> {
        self.store.schema.require(entity)?;
        self.staged.insert((entity.to_string(), row.id.clone()), row);
        Ok(())
    }

    /// Stage every row of another staging area.
    pub fn put_all(&mut self, rows: impl IntoIterator<Item = (EntityName, Row)>) -> Result<()> {
        for (entity, row) in rows {
            self.put(&entity, row)?;
        }
        Ok(())
    }

    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }

    /// Make staged rows visible. Returns the tick they were stamped with, or
    /// `None` when nothing was staged and the clock was left alone.
    pub fn commit(self) -> Option<Tick> {
        if self.staged.is_empty() {
            return None;
        }
        Some(self.finish())
    }

    fn finish(self) -> Tick {
        let WriteTxn {
            store,
            provenance,
            staged,
            _guard,
        } = self;
        store.apply(provenance, staged)
    }
}

/// Merge an incoming field map into stored fields. Nulls never overwrite.
pub fn merge_fields(target: &mut Fields, incoming: &Fields) {
    for (key, value) in incoming {
        if key == "id" || value.is_null() {
            continue;
        }
        target.insert(key.clone(), value.clone());
    }
}

/// Keep only `columns` of a field map.
pub fn retain_columns(fields: &mut Fields, columns: &[String]) {
    fields.retain(|key, _| columns.iter().any(|c| c == key));
}

/// A field map holding a single string column.
pub fn single_column(column: &str, value: &str) -> Fields {
    let mut fields = Fields::new();
    fields.insert(column.to_string(), Value::String(value.to_string()));
    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{EntityType, FieldDef, FieldType, ScopeRule};
    use serde_json::json;

    fn test_schema() -> Schema {
        Schema::new(1)
            .with_entity(EntityType::new(
                "patient",
                vec![FieldDef::optional("firstName", FieldType::String)],
            ))
            .with_entity(
                EntityType::new("encounter", vec![])
                    .scoped(ScopeRule::patient("patientId"))
                    .push_tracked(),
            )
    }

    fn fields(value: Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    fn versions(store: &Store, entity: &str, id: &str) -> usize {
        store.inner.read().tables[entity].get(id).map_or(0, Vec::len)
    }

    #[test]
    fn local_writes_take_the_even_half() {
        let store = Store::with_clock(test_schema(), SharedClock::starting_at(1000));
        let tick = store.insert("patient", "a", fields(json!({"firstName": "Ana"}))).unwrap();
        assert_eq!(tick, 1002);
        assert_eq!(Provenance::of(tick), Provenance::Local);

        let row = store.get("patient", "a").unwrap().unwrap();
        assert_eq!(row.updated_at_tick, 1002);
        assert_eq!(row.column_str("firstName"), Some("Ana"));
    }

    #[test]
    fn synced_writes_take_the_odd_half() {
        let store = Store::with_clock(test_schema(), SharedClock::starting_at(10));
        let mut txn = store.begin_write(Provenance::Synced);
        txn.put("patient", Row::new("a", Fields::new())).unwrap();
        txn.put("patient", Row::new("b", Fields::new())).unwrap();
        assert_eq!(txn.commit(), Some(11));
        assert_eq!(store.get("patient", "b").unwrap().unwrap().updated_at_tick, 11);
    }

    #[test]
    fn empty_commit_leaves_clock() {
        let store = Store::new(test_schema());
        let txn = store.begin_write(Provenance::Synced);
        assert_eq!(txn.commit(), None);
        assert_eq!(store.clock().current(), 0);
    }

    #[test]
    fn dropped_write_is_discarded() {
        let store = Store::new(test_schema());
        {
            let mut txn = store.begin_write(Provenance::Synced);
            txn.put("patient", Row::new("a", Fields::new())).unwrap();
        }
        assert!(store.get("patient", "a").unwrap().is_none());
    }

    #[test]
    fn ticks_strictly_increase_per_record() {
        let store = Store::new(test_schema());
        let t1 = store.insert("patient", "a", Fields::new()).unwrap();
        let t2 = store.update("patient", "a", fields(json!({"firstName": "B"}))).unwrap();
        let t3 = store.soft_delete("patient", "a", 5).unwrap();
        assert!(t1 < t2 && t2 < t3);
    }

    #[test]
    fn reader_does_not_see_later_commits() {
        let store = Store::new(test_schema());
        store.insert("patient", "a", fields(json!({"firstName": "Ana"}))).unwrap();

        let read = store.begin_read();
        store.insert("patient", "b", Fields::new()).unwrap();
        store.update("patient", "a", fields(json!({"firstName": "Bea"}))).unwrap();

        let rows = read.changed_rows("patient", &RowQuery::since(-1)).unwrap();
        let ids: Vec<_> = rows.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a"]);
        assert_eq!(rows[0].column_str("firstName"), Some("Ana"));
        assert!(rows.iter().all(|r| r.updated_at_tick <= read.snapshot_tick()));

        let fresh = store.begin_read();
        assert_eq!(fresh.count("patient").unwrap(), 2);
        assert_eq!(
            fresh.get("patient", "a").unwrap().unwrap().column_str("firstName"),
            Some("Bea")
        );
    }

    #[test]
    fn old_versions_pruned_once_readers_close() {
        let store = Store::new(test_schema());
        store.insert("patient", "a", Fields::new()).unwrap();

        let read = store.begin_read();
        store.update("patient", "a", fields(json!({"firstName": "x"}))).unwrap();
        store.update("patient", "a", fields(json!({"firstName": "y"}))).unwrap();
        assert_eq!(versions(&store, "patient", "a"), 3);
        drop(read);

        store.update("patient", "a", fields(json!({"firstName": "z"}))).unwrap();
        assert_eq!(versions(&store, "patient", "a"), 1);
    }

    #[test]
    fn query_window_scope_and_cursor() {
        let store = Store::new(test_schema());
        for (id, patient) in [("e1", "p1"), ("e2", "p2"), ("e3", "p1"), ("e4", "p1")] {
            store
                .insert("encounter", id, fields(json!({"patientId": patient})))
                .unwrap();
        }
        let read = store.begin_read();

        let query = RowQuery::since(2)
            .until(Some(8))
            .scope(RowScope::column("patientId", vec!["p1".into()]));
        let ids: Vec<_> = read
            .changed_rows("encounter", &query)
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["e3", "e4"]);

        let after = RowQuery::since(-1)
            .after(Some(Cursor::new(4, "e2")))
            .limit(1);
        let page = read.changed_rows("encounter", &after).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, "e3");
    }

    #[test]
    fn unknown_table_query_fails() {
        let store = Store::new(test_schema());
        let read = store.begin_read();
        let err = read.changed_rows("ghost", &RowQuery::since(0)).unwrap_err();
        assert!(matches!(err, Error::IsolationViolation { .. }));
    }

    #[test]
    fn local_writes_mark_push_tracked_rows() {
        let store = Store::new(test_schema());
        store.insert("encounter", "e1", Fields::new()).unwrap();
        store.insert("patient", "p1", Fields::new()).unwrap();
        assert!(store.get("encounter", "e1").unwrap().unwrap().marked_for_push);
        assert!(!store.get("patient", "p1").unwrap().unwrap().marked_for_push);
    }

    #[test]
    fn write_txn_children_see_staged_rows() {
        let store = Store::new(test_schema());
        store
            .insert("encounter", "e1", fields(json!({"patientId": "p1"})))
            .unwrap();
        let mut txn = store.begin_write(Provenance::Synced);
        let mut staged = Row::new("e2", Fields::new());
        staged.fields.insert("patientId".into(), json!("p1"));
        txn.put("encounter", staged).unwrap();

        let ids: Vec<_> = txn
            .children("encounter", "patientId", "p1")
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["e1", "e2"]);
    }

    #[test]
    fn merge_ignores_nulls() {
        let mut target = fields(json!({"a": 1, "b": 2}));
        merge_fields(&mut target, &fields(json!({"id": "x", "a": null, "b": 3, "c": 4})));
        assert_eq!(Value::Object(target), json!({"a": 1, "b": 3, "c": 4}));
    }

    #[test]
    fn update_missing_row() {
        let store = Store::new(test_schema());
        let err = store.update("patient", "nope", Fields::new()).unwrap_err();
        assert!(matches!(err, Error::RecordNotFound { .. }));
    }
}
