//! Snapshot builder: one session's outgoing changes.
//!
//! A snapshot pass reads every requested entity type through a single
//! repeatable-read view, so the result reflects exactly the state as of the
//! moment the view began. Rows are collected into a staging list and only
//! handed back once every type has been read; if any per-type query fails the
//! whole pass fails and nothing is kept.

use crate::config::{SessionConfig, SyncConfig};
use crate::record::SnapshotRecord;
use crate::schema::{EntityType, Schema, ScopeRule};
use crate::store::{RowQuery, RowScope, RowSource};
use crate::{error::Result, EntityName, Error, RecordId, SessionId, Tick};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Everything a snapshot pass needs to know.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRequest {
    pub session_id: SessionId,
    pub entity_types: Vec<EntityName>,
    /// Exclusive lower bound: the peer's last acknowledged tick
    pub since: Tick,
    /// Inclusive upper bound; the view's own tick when absent
    #[serde(default)]
    pub until: Option<Tick>,
    /// Patients the peer follows
    #[serde(default)]
    pub patient_ids: Vec<RecordId>,
    #[serde(default)]
    pub facility_id: Option<RecordId>,
    #[serde(default)]
    pub session_config: SessionConfig,
}

impl SnapshotRequest {
    pub fn new(session_id: SessionId, since: Tick) -> Self {
        Self {
            session_id,
            entity_types: Vec::new(),
            since,
            until: None,
            patient_ids: Vec::new(),
            facility_id: None,
            session_config: SessionConfig::default(),
        }
    }

    pub fn entity_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<EntityName>,
    {
        self.entity_types = types.into_iter().map(Into::into).collect();
        self
    }

    pub fn patients<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<RecordId>,
    {
        self.patient_ids = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn facility(mut self, facility_id: impl Into<RecordId>) -> Self {
        self.facility_id = Some(facility_id.into());
        self
    }

    pub fn until(mut self, until: Tick) -> Self {
        self.until = Some(until);
        self
    }

    pub fn session_config(mut self, config: SessionConfig) -> Self {
        self.session_config = config;
        self
    }
}

/// Row predicate for one entity type.
///
/// Returns `None` when the type requires a scope the request does not
/// provide: the type then contributes no rows at all. An empty scope never
/// widens to every row.
pub fn row_scope(entity: &EntityType, request: &SnapshotRequest) -> Option<RowScope> {
    match &entity.scope {
        None => Some(RowScope::All),
        Some(ScopeRule::PatientLinked { .. })
            if request.session_config.syncs_all(&entity.name) =>
        {
            Some(RowScope::All)
        }
        Some(ScopeRule::PatientLinked { column }) => {
            if request.patient_ids.is_empty() {
                None
            } else {
                Some(RowScope::column(column.clone(), request.patient_ids.clone()))
            }
        }
        Some(ScopeRule::FacilityLinked { column }) => request
            .facility_id
            .as_ref()
            .map(|facility| RowScope::column(column.clone(), vec![facility.clone()])),
    }
}

/// Rows produced by a completed pass, ready to publish.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotPass {
    pub rows: Vec<SnapshotRecord>,
    pub since: Tick,
    pub until: Tick,
}

impl SnapshotPass {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Builds snapshot passes against a registry.
#[derive(Debug, Clone, Copy)]
pub struct SnapshotBuilder<'a> {
    schema: &'a Schema,
    read_only: bool,
}

impl<'a> SnapshotBuilder<'a> {
    pub fn new(schema: &'a Schema, config: &SyncConfig) -> Self {
        Self {
            schema,
            read_only: config.read_only,
        }
    }

    /// Run one pass through `source`, which must be a single consistent view.
    pub fn build(&self, source: &impl RowSource, request: &SnapshotRequest) -> Result<SnapshotPass> {
        let until = request.until.unwrap_or_else(|| source.snapshot_tick());
        let mut pass = SnapshotPass {
            rows: Vec::new(),
            since: request.since,
            until,
        };
        if self.read_only {
            return Ok(pass);
        }

        let mut seen = HashSet::new();
        for name in &request.entity_types {
            if !seen.insert(name.as_str()) {
                continue;
            }
            // Unknown types are still queried so the failure surfaces
            let scope = match self.schema.get(name) {
                Some(entity) if !entity.sync_direction.flows_outward() => continue,
                Some(entity) => match row_scope(entity, request) {
                    Some(scope) => scope,
                    None => {
                        tracing::debug!(entity = %name, "scope empty, skipping type");
                        continue;
                    }
                },
                None => RowScope::All,
            };

            let query = RowQuery::since(request.since)
                .until(Some(until))
                .scope(scope);
            let rows = source
                .changed_rows(name, &query)
                .map_err(|err| isolation_violation(name, err))?;

            tracing::debug!(
                session_id = %request.session_id,
                entity = %name,
                count = rows.len(),
                "snapshotted type"
            );
            pass.rows.extend(
                rows.iter()
                    .map(|row| SnapshotRecord::outgoing(request.session_id, name, row)),
            );
        }
        Ok(pass)
    }
}

fn isolation_violation(entity: &str, err: Error) -> Error {
    match err {
        Error::IsolationViolation { .. } => err,
        other => Error::IsolationViolation {
            entity: entity.to_string(),
            reason: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SharedClock;
    use crate::record::{Fields, Row};
    use crate::schema::SyncDirection;
    use crate::store::Store;
    use serde_json::{json, Value};

    fn test_schema() -> Schema {
        Schema::new(1)
            .with_entity(EntityType::new("patient", vec![]))
            .with_entity(EntityType::new("encounter", vec![]).scoped(ScopeRule::patient("patientId")))
            .with_entity(EntityType::new("labRequest", vec![]).scoped(ScopeRule::patient("patientId")))
            .with_entity(
                EntityType::new("facilitySetting", vec![]).scoped(ScopeRule::facility("facilityId")),
            )
            .with_entity(EntityType::new("upload", vec![]).direction(SyncDirection::InwardOnly))
    }

    fn fields(value: Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    fn request(since: Tick) -> SnapshotRequest {
        SnapshotRequest::new(SessionId::nil(), since)
            .entity_types(["patient", "encounter", "labRequest", "facilitySetting", "upload"])
    }

    fn ids(pass: &SnapshotPass) -> Vec<&str> {
        pass.rows.iter().map(|r| r.record_id.as_str()).collect()
    }

    struct FailingSource<'a, S> {
        inner: &'a S,
        fail_on: &'a str,
    }

    impl<S: RowSource> RowSource for FailingSource<'_, S> {
        fn snapshot_tick(&self) -> Tick {
            self.inner.snapshot_tick()
        }

        fn changed_rows(&self, entity: &str, query: &RowQuery) -> Result<Vec<Row>> {
            if entity == self.fail_on {
                return Err(Error::UnknownEntity(entity.to_string()));
            }
            self.inner.changed_rows(entity, query)
        }

        fn children(&self, entity: &str, foreign_key: &str, parent_id: &str) -> Result<Vec<Row>> {
            self.inner.children(entity, foreign_key, parent_id)
        }
    }

    #[test]
    fn created_then_deleted_record() {
        let store = Store::with_clock(test_schema(), SharedClock::starting_at(1000));
        let builder = SnapshotBuilder::new(store.schema(), &SyncConfig::default());

        let tick = store
            .insert("patient", "a", fields(json!({"firstName": "Ana"})))
            .unwrap();
        assert_eq!(tick, 1002);
        let pass = builder.build(&store.begin_read(), &request(1000)).unwrap();
        assert_eq!(ids(&pass), vec!["a"]);
        assert!(!pass.rows[0].is_deleted);
        assert_eq!(pass.rows[0].data.get("firstName"), Some(&json!("Ana")));

        let tick = store.soft_delete("patient", "a", 55).unwrap();
        assert_eq!(tick, 1004);
        let pass = builder.build(&store.begin_read(), &request(1002)).unwrap();
        assert_eq!(ids(&pass), vec!["a"]);
        assert!(pass.rows[0].is_deleted);
        assert_eq!(Value::Object(pass.rows[0].data.clone()), json!({"id": "a"}));
        assert_eq!(pass.rows[0].saved_at_tick, 1004);
    }

    #[test]
    fn empty_patient_scope_yields_nothing() {
        let store = Store::new(test_schema());
        store
            .insert("encounter", "e1", fields(json!({"patientId": "p1"})))
            .unwrap();
        let builder = SnapshotBuilder::new(store.schema(), &SyncConfig::default());

        let pass = builder.build(&store.begin_read(), &request(-1)).unwrap();
        assert!(pass.is_empty());

        let pass = builder
            .build(&store.begin_read(), &request(-1).patients(["p1"]))
            .unwrap();
        assert_eq!(ids(&pass), vec!["e1"]);
    }

    #[test]
    fn patient_scope_filters_rows() {
        let store = Store::new(test_schema());
        for (id, patient) in [("e1", "p1"), ("e2", "p2"), ("e3", "p3")] {
            store
                .insert("encounter", id, fields(json!({"patientId": patient})))
                .unwrap();
        }
        let builder = SnapshotBuilder::new(store.schema(), &SyncConfig::default());
        let pass = builder
            .build(&store.begin_read(), &request(-1).patients(["p1", "p3"]))
            .unwrap();
        assert_eq!(ids(&pass), vec!["e1", "e3"]);
    }

    #[test]
    fn sync_all_types_bypass_patient_scope() {
        let store = Store::new(test_schema());
        store
            .insert("labRequest", "l1", fields(json!({"patientId": "p9"})))
            .unwrap();
        let builder = SnapshotBuilder::new(store.schema(), &SyncConfig::default());
        let config = SessionConfig {
            sync_all_types: vec!["labRequest".into()],
        };
        let pass = builder
            .build(&store.begin_read(), &request(-1).session_config(config))
            .unwrap();
        assert_eq!(ids(&pass), vec!["l1"]);
    }

    #[test]
    fn facility_scope() {
        let store = Store::new(test_schema());
        store
            .insert("facilitySetting", "s1", fields(json!({"facilityId": "f1"})))
            .unwrap();
        store
            .insert("facilitySetting", "s2", fields(json!({"facilityId": "f2"})))
            .unwrap();
        let builder = SnapshotBuilder::new(store.schema(), &SyncConfig::default());

        assert!(builder.build(&store.begin_read(), &request(-1)).unwrap().is_empty());
        let pass = builder
            .build(&store.begin_read(), &request(-1).facility("f2"))
            .unwrap();
        assert_eq!(ids(&pass), vec!["s2"]);
    }

    #[test]
    fn inward_only_types_never_flow_out() {
        let store = Store::new(test_schema());
        store.insert("upload", "u1", Fields::new()).unwrap();
        let builder = SnapshotBuilder::new(store.schema(), &SyncConfig::default());
        assert!(builder.build(&store.begin_read(), &request(-1)).unwrap().is_empty());
    }

    #[test]
    fn writes_after_view_began_are_excluded() {
        let store = Store::new(test_schema());
        store.insert("patient", "before", Fields::new()).unwrap();
        let builder = SnapshotBuilder::new(store.schema(), &SyncConfig::default());

        let view = store.begin_read();
        store.insert("patient", "after", Fields::new()).unwrap();
        let pass = builder.build(&view, &request(-1)).unwrap();

        assert_eq!(ids(&pass), vec!["before"]);
        assert_eq!(pass.until, view.snapshot_tick());
    }

    #[test]
    fn read_only_short_circuits() {
        let store = Store::new(test_schema());
        store.insert("patient", "a", Fields::new()).unwrap();
        let config = SyncConfig {
            read_only: true,
            ..SyncConfig::default()
        };
        let pass = SnapshotBuilder::new(store.schema(), &config)
            .build(&store.begin_read(), &request(-1))
            .unwrap();
        assert!(pass.is_empty());
    }

    #[test]
    fn failing_type_aborts_the_pass() {
        let store = Store::new(test_schema());
        store.insert("patient", "a", Fields::new()).unwrap();
        let builder = SnapshotBuilder::new(store.schema(), &SyncConfig::default());
        let view = store.begin_read();
        let source = FailingSource {
            inner: &view,
            fail_on: "labRequest",
        };

        let err = builder
            .build(&source, &request(-1).patients(["p1"]))
            .unwrap_err();
        assert!(matches!(err, Error::IsolationViolation { ref entity, .. } if entity == "labRequest"));
    }

    #[test]
    fn unknown_type_is_an_isolation_violation() {
        let store = Store::new(test_schema());
        let builder = SnapshotBuilder::new(store.schema(), &SyncConfig::default());
        let err = builder
            .build(
                &store.begin_read(),
                &SnapshotRequest::new(SessionId::nil(), -1).entity_types(["ghost"]),
            )
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Isolation);
    }

    #[test]
    fn duplicate_types_are_read_once() {
        let store = Store::new(test_schema());
        store.insert("patient", "a", Fields::new()).unwrap();
        let builder = SnapshotBuilder::new(store.schema(), &SyncConfig::default());
        let pass = builder
            .build(
                &store.begin_read(),
                &SnapshotRequest::new(SessionId::nil(), -1).entity_types(["patient", "patient"]),
            )
            .unwrap();
        assert_eq!(pass.len(), 1);
    }
}
