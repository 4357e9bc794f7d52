//! Entity registry.
//!
//! The registry is the engine's only view of the data model: which entity
//! types exist, which way they flow, how they are scoped, and which child
//! collections travel inside a parent's wire record. Everything is declared
//! up front so the shape of every wire record is known without looking at
//! data.

use crate::{error::Result, EntityName, Error, SchemaVersion};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Name of the entity type patient-linked channels hang off.
pub const PATIENT_ENTITY: &str = "patient";

/// Columns that only exist for bookkeeping. They are stripped from every
/// outbound payload and ignored in every inbound one.
pub const BOOKKEEPING_COLUMNS: &[&str] = &[
    "updatedAtTick",
    "updatedAtSyncTick",
    "deletedAt",
    "createdAt",
    "updatedAt",
    "pulledAt",
    "pushedAt",
    "markedForPush",
];

/// Whether a column is bookkeeping.
pub fn is_bookkeeping(column: &str) -> bool {
    BOOKKEEPING_COLUMNS.contains(&column)
}

/// Field types supported in schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Int,
    Float,
    Bool,
    Timestamp,
    /// Arbitrary nested JSON
    Json,
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldType::String => write!(f, "String"),
            FieldType::Int => write!(f, "Int"),
            FieldType::Float => write!(f, "Float"),
            FieldType::Bool => write!(f, "Bool"),
            FieldType::Timestamp => write!(f, "Timestamp"),
            FieldType::Json => write!(f, "Json"),
        }
    }
}

/// Definition of a field in an entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    /// Field name
    pub name: String,
    /// Field type
    pub field_type: FieldType,
    /// Whether this field is required
    pub required: bool,
}

impl FieldDef {
    /// Create a new required field definition.
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: true,
        }
    }

    /// Create a new optional field definition.
    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
        }
    }

    /// Validate a JSON value against this field definition.
    pub fn validate(&self, value: Option<&serde_json::Value>) -> Result<()> {
        match value {
            None if self.required => Err(Error::MissingRequiredField(self.name.clone())),
            None => Ok(()),
            Some(serde_json::Value::Null) if self.required => {
                Err(Error::MissingRequiredField(self.name.clone()))
            }
            Some(serde_json::Value::Null) => Ok(()),
            Some(v) => self.validate_type(v),
        }
    }

    fn validate_type(&self, value: &serde_json::Value) -> Result<()> {
        let valid = match self.field_type {
            FieldType::String => value.is_string(),
            FieldType::Int => value.is_i64() || value.is_u64(),
            FieldType::Float => value.is_f64() || value.is_i64() || value.is_u64(),
            FieldType::Bool => value.is_boolean(),
            // ISO strings and epoch millis both appear on the wire
            FieldType::Timestamp => value.is_u64() || value.is_i64() || value.is_string(),
            FieldType::Json => true,
        };

        if valid {
            Ok(())
        } else {
            Err(Error::TypeMismatch {
                field: self.name.clone(),
                expected: self.field_type.to_string(),
                got: json_type_name(value).to_string(),
            })
        }
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "Null",
        serde_json::Value::Bool(_) => "Bool",
        serde_json::Value::Number(n) if n.is_i64() || n.is_u64() => "Int",
        serde_json::Value::Number(_) => "Float",
        serde_json::Value::String(_) => "String",
        serde_json::Value::Array(_) => "Array",
        serde_json::Value::Object(_) => "Object",
    }
}

/// Which way an entity type replicates, seen from the central store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncDirection {
    Bidirectional,
    /// Central to facilities only (reference data, settings)
    OutwardOnly,
    /// Facilities to central only
    InwardOnly,
    /// Never replicated
    DoNotSync,
}

impl SyncDirection {
    /// Whether rows of this type are snapshotted for peers.
    pub fn flows_outward(self) -> bool {
        matches!(self, SyncDirection::Bidirectional | SyncDirection::OutwardOnly)
    }

    /// Whether rows of this type are accepted from facilities.
    pub fn flows_inward(self) -> bool {
        matches!(self, SyncDirection::Bidirectional | SyncDirection::InwardOnly)
    }

    /// Whether the type replicates at all.
    pub fn is_synced(self) -> bool {
        self != SyncDirection::DoNotSync
    }
}

/// How a child collection relates to its parent on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AssociationKind {
    /// Serialized inside the parent and upserted with it
    TravelsWithParent,
    /// Replicates on its own channel; never nested
    Independent,
    /// Travels with the parent, and local rows missing from the incoming
    /// collection are removed
    ReplacingSet,
}

impl AssociationKind {
    /// Whether the collection is nested inside the parent's wire record.
    pub fn is_nested(self) -> bool {
        !matches!(self, AssociationKind::Independent)
    }
}

/// A declared parent-to-children association.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Association {
    /// Key of the nested collection in the parent's wire record
    pub name: String,
    /// Child entity type
    pub target: EntityName,
    /// Column on the child holding the parent's id
    pub foreign_key: String,
    pub kind: AssociationKind,
}

impl Association {
    pub fn new(
        name: impl Into<String>,
        target: impl Into<EntityName>,
        foreign_key: impl Into<String>,
        kind: AssociationKind,
    ) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            foreign_key: foreign_key.into(),
            kind,
        }
    }
}

/// Declarative scope predicate for an entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ScopeRule {
    /// Row belongs to the patient whose id is in `column`
    PatientLinked { column: String },
    /// Row belongs to the facility whose id is in `column`
    FacilityLinked { column: String },
}

impl ScopeRule {
    pub fn patient(column: impl Into<String>) -> Self {
        ScopeRule::PatientLinked {
            column: column.into(),
        }
    }

    pub fn facility(column: impl Into<String>) -> Self {
        ScopeRule::FacilityLinked {
            column: column.into(),
        }
    }

    /// The column the predicate reads.
    pub fn column(&self) -> &str {
        match self {
            ScopeRule::PatientLinked { column } | ScopeRule::FacilityLinked { column } => column,
        }
    }
}

/// Registry entry for one replicated entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityType {
    pub name: EntityName,
    pub sync_direction: SyncDirection,
    pub fields: Vec<FieldDef>,
    #[serde(default)]
    pub associations: Vec<Association>,
    #[serde(default)]
    pub scope: Option<ScopeRule>,
    /// Rows carry a "pending push" flag and a "pulled" timestamp
    #[serde(default)]
    pub push_tracked: bool,
}

impl EntityType {
    /// Create a bidirectional, unscoped entity type.
    pub fn new(name: impl Into<EntityName>, fields: Vec<FieldDef>) -> Self {
        Self {
            name: name.into(),
            sync_direction: SyncDirection::Bidirectional,
            fields,
            associations: Vec::new(),
            scope: None,
            push_tracked: false,
        }
    }

    pub fn direction(mut self, direction: SyncDirection) -> Self {
        self.sync_direction = direction;
        self
    }

    pub fn association(mut self, association: Association) -> Self {
        self.associations.push(association);
        self
    }

    pub fn scoped(mut self, scope: ScopeRule) -> Self {
        self.scope = Some(scope);
        self
    }

    pub fn push_tracked(mut self) -> Self {
        self.push_tracked = true;
        self
    }

    /// Whether the type declares a patient-scope predicate.
    pub fn is_patient_linked(&self) -> bool {
        matches!(self.scope, Some(ScopeRule::PatientLinked { .. }))
    }

    /// Associations whose rows travel inside this type's wire records.
    pub fn nested_associations(&self) -> impl Iterator<Item = &Association> {
        self.associations.iter().filter(|a| a.kind.is_nested())
    }

    /// Validate an incoming payload. Bookkeeping columns and nested
    /// collections are not fields and are not checked.
    pub fn validate_data(&self, data: &serde_json::Map<String, serde_json::Value>) -> Result<()> {
        for field in &self.fields {
            field.validate(data.get(&field.name))?;
        }
        Ok(())
    }
}

/// The registry for the whole store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    /// Schema version for migrations
    pub version: SchemaVersion,
    /// Entity types by name, ordered for deterministic iteration
    pub entities: BTreeMap<EntityName, EntityType>,
}

impl Schema {
    /// Create a new schema.
    pub fn new(version: SchemaVersion) -> Self {
        Self {
            version,
            entities: BTreeMap::new(),
        }
    }

    /// Add an entity type to the schema.
    pub fn add_entity(&mut self, entity: EntityType) -> &mut Self {
        self.entities.insert(entity.name.clone(), entity);
        self
    }

    /// Builder-style method to add an entity type.
    pub fn with_entity(mut self, entity: EntityType) -> Self {
        self.add_entity(entity);
        self
    }

    /// Get an entity type by name.
    pub fn get(&self, name: &str) -> Option<&EntityType> {
        self.entities.get(name)
    }

    /// Get an entity type by name, failing for unknown names.
    pub fn require(&self, name: &str) -> Result<&EntityType> {
        self.get(name)
            .ok_or_else(|| Error::UnknownEntity(name.to_string()))
    }

    /// Entity types whose rows flow out of this store in snapshots.
    pub fn outgoing_types(&self) -> Vec<&EntityType> {
        self.entities
            .values()
            .filter(|e| e.sync_direction.flows_outward())
            .collect()
    }

    /// Entity types accepted from facilities.
    pub fn incoming_types(&self) -> Vec<&EntityType> {
        self.entities
            .values()
            .filter(|e| e.sync_direction.flows_inward())
            .collect()
    }

    /// Entity types that declare a patient-scope predicate.
    pub fn patient_linked_types(&self) -> Vec<&EntityType> {
        self.entities
            .values()
            .filter(|e| e.is_patient_linked())
            .collect()
    }

    /// Look up a list of names, skipping unknown ones the way a table filter
    /// from a client would.
    pub fn filter_by_name<'a, I, S>(&self, names: I) -> Vec<&EntityType>
    where
        I: IntoIterator<Item = &'a S>,
        S: AsRef<str> + ?Sized + 'a,
    {
        names
            .into_iter()
            .filter_map(|name| self.get(name.as_ref()))
            .collect()
    }

    /// Columns that survive a tombstone: the scope column and every foreign
    /// key pointing at a parent. Without them a tombstone could not be routed
    /// to the peers that hold the row.
    pub fn structural_columns(&self, entity: &EntityType) -> Vec<String> {
        let mut columns: Vec<String> = entity
            .scope
            .iter()
            .map(|s| s.column().to_string())
            .collect();
        for parent in self.entities.values() {
            for assoc in &parent.associations {
                if assoc.target == entity.name && !columns.contains(&assoc.foreign_key) {
                    columns.push(assoc.foreign_key.clone());
                }
            }
        }
        columns
    }
}
