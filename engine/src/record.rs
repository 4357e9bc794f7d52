//! Record types: stored rows, wire records, and session snapshot rows.

use crate::schema::is_bookkeeping;
use crate::{error::Result, EntityName, Error, RecordId, SessionId, Tick, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A field map as it appears on the wire.
pub type Fields = Map<String, Value>;

/// One stored row of a replicated entity type.
///
/// `fields` holds the clinical payload only; bookkeeping lives in the typed
/// columns next to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Row {
    /// Stable id, portable across stores
    pub id: RecordId,
    pub fields: Fields,
    /// Clock value of the last mutation
    pub updated_at_tick: Tick,
    /// Soft-delete marker (milliseconds since epoch)
    pub deleted_at: Option<Timestamp>,
    /// When the row was last overwritten by an import
    pub pulled_at: Option<Timestamp>,
    /// Local edits not yet pushed to the central store
    pub marked_for_push: bool,
}

impl Row {
    /// Create a live row. The tick is assigned when the write commits.
    pub fn new(id: impl Into<RecordId>, fields: Fields) -> Self {
        Self {
            id: id.into(),
            fields,
            updated_at_tick: 0,
            deleted_at: None,
            pulled_at: None,
            marked_for_push: false,
        }
    }

    /// Check if the row is live (not soft-deleted).
    pub fn is_active(&self) -> bool {
        self.deleted_at.is_none()
    }

    /// Check if the row carries a tombstone.
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Value of a column as a string, for scope and foreign-key matching.
    pub fn column_str(&self, column: &str) -> Option<&str> {
        self.fields.get(column).and_then(Value::as_str)
    }

    /// Outbound payload: the id plus every non-bookkeeping field.
    pub fn project(&self) -> Fields {
        let mut data = Fields::new();
        data.insert("id".to_string(), Value::String(self.id.clone()));
        for (key, value) in &self.fields {
            if key != "id" && !is_bookkeeping(key) {
                data.insert(key.clone(), value.clone());
            }
        }
        data
    }

    /// Outbound payload honouring the tombstone rule: a deleted row travels
    /// as its id and nothing else.
    pub fn to_sync_record(&self) -> SyncRecord {
        if self.is_deleted() {
            SyncRecord::tombstone(self.id.clone())
        } else {
            SyncRecord::new(self.project())
        }
    }
}

/// A record as it travels between stores.
///
/// `data` carries the fields and any nested collections (each an array of
/// wire records).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRecord {
    pub data: Fields,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_deleted: bool,
}

impl SyncRecord {
    pub fn new(data: Fields) -> Self {
        Self {
            data,
            is_deleted: false,
        }
    }

    /// A deletion marker carrying only the id.
    pub fn tombstone(id: impl Into<RecordId>) -> Self {
        let mut data = Fields::new();
        data.insert("id".to_string(), Value::String(id.into()));
        Self {
            data,
            is_deleted: true,
        }
    }

    /// Parse a nested collection item.
    pub fn from_value(value: &Value) -> Result<Self> {
        serde_json::from_value(value.clone()).map_err(|e| Error::InvalidPayload {
            id: value
                .pointer("/data/id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            reason: e.to_string(),
        })
    }

    /// The record as a JSON value, for nesting inside a parent.
    pub fn into_value(self) -> Value {
        let mut object = Map::new();
        object.insert("data".to_string(), Value::Object(self.data));
        if self.is_deleted {
            object.insert("isDeleted".to_string(), Value::Bool(true));
        }
        Value::Object(object)
    }

    /// The stable id, if present and a non-empty string.
    pub fn id(&self) -> Option<&str> {
        self.data
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
    }
}

/// Which side of a session a snapshot row belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotDirection {
    /// Computed by this store for the peer to pull
    Outgoing,
    /// Pushed by the peer, waiting to be persisted
    Incoming,
}

impl SnapshotDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            SnapshotDirection::Outgoing => "outgoing",
            SnapshotDirection::Incoming => "incoming",
        }
    }
}

/// A session-scoped row of a snapshot. Lives only as long as its session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRecord {
    /// Sequential position within the session's buffer, used for paging
    pub id: u64,
    pub session_id: SessionId,
    pub direction: SnapshotDirection,
    pub is_deleted: bool,
    pub record_type: EntityName,
    pub record_id: RecordId,
    /// Tick the source row was stamped with when the snapshot read it, or the
    /// tick an incoming row was persisted at
    pub saved_at_tick: Tick,
    pub data: Fields,
}

impl SnapshotRecord {
    /// Build an outgoing snapshot row from a stored row. The buffer assigns
    /// `id` when the row is published.
    pub fn outgoing(session_id: SessionId, record_type: &str, row: &Row) -> Self {
        let wire = row.to_sync_record();
        Self {
            id: 0,
            session_id,
            direction: SnapshotDirection::Outgoing,
            is_deleted: wire.is_deleted,
            record_type: record_type.to_string(),
            record_id: row.id.clone(),
            saved_at_tick: row.updated_at_tick,
            data: wire.data,
        }
    }

    /// The row in wire form.
    pub fn to_sync_record(&self) -> SyncRecord {
        SyncRecord {
            data: self.data.clone(),
            is_deleted: self.is_deleted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn new_row_is_active() {
        let row = Row::new("p-1", fields(json!({"firstName": "Ana"})));
        assert!(row.is_active());
        assert!(!row.is_deleted());
        assert_eq!(row.column_str("firstName"), Some("Ana"));
    }

    #[test]
    fn project_strips_bookkeeping() {
        let row = Row::new(
            "p-1",
            fields(json!({
                "firstName": "Ana",
                "updatedAtSyncTick": 12,
                "markedForPush": true,
                "createdAt": "2024-01-01"
            })),
        );
        assert_eq!(
            Value::Object(row.project()),
            json!({"id": "p-1", "firstName": "Ana"})
        );
    }

    #[test]
    fn deleted_row_travels_as_tombstone() {
        let mut row = Row::new("p-1", fields(json!({"firstName": "Ana"})));
        row.deleted_at = Some(1000);
        let wire = row.to_sync_record();
        assert!(wire.is_deleted);
        assert_eq!(Value::Object(wire.data), json!({"id": "p-1"}));
    }

    #[test]
    fn sync_record_id() {
        assert_eq!(SyncRecord::tombstone("x").id(), Some("x"));
        assert_eq!(SyncRecord::new(fields(json!({"id": ""}))).id(), None);
        assert_eq!(SyncRecord::new(fields(json!({"id": 3}))).id(), None);
        assert_eq!(SyncRecord::new(Fields::new()).id(), None);
    }

    #[test]
    fn wire_format() {
        let live = SyncRecord::new(fields(json!({"id": "a"})));
        assert_eq!(serde_json::to_value(&live).unwrap(), json!({"data": {"id": "a"}}));

        let dead = SyncRecord::tombstone("a");
        assert_eq!(
            serde_json::to_value(&dead).unwrap(),
            json!({"data": {"id": "a"}, "isDeleted": true})
        );

        let parsed: SyncRecord = serde_json::from_value(json!({"data": {"id": "b"}})).unwrap();
        assert!(!parsed.is_deleted);
    }

    #[test]
    fn nested_value_form() {
        let value = SyncRecord::tombstone("c-1").into_value();
        assert_eq!(value, json!({"data": {"id": "c-1"}, "isDeleted": true}));
        assert_eq!(SyncRecord::from_value(&value).unwrap(), SyncRecord::tombstone("c-1"));

        let err = SyncRecord::from_value(&json!({"data": 3})).unwrap_err();
        assert!(matches!(err, Error::InvalidPayload { .. }));
    }

    #[test]
    fn outgoing_snapshot_row() {
        let mut row = Row::new("e-1", fields(json!({"reason": "cough"})));
        row.updated_at_tick = 1002;
        let session = SessionId::nil();
        let snap = SnapshotRecord::outgoing(session, "encounter", &row);
        assert_eq!(snap.direction, SnapshotDirection::Outgoing);
        assert_eq!(snap.saved_at_tick, 1002);
        assert_eq!(snap.record_type, "encounter");
        assert!(!snap.is_deleted);
        assert_eq!(snap.data.get("reason"), Some(&json!("cough")));
    }
}
