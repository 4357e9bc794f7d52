//! Channel descriptors and routing.
//!
//! A channel names the set of rows exchanged together. Descriptors come in
//! three shapes:
//!
//! - `entity`: every row of a type
//! - `parent/{id}/nested`: rows of `nested` belonging to one parent row
//! - `parent/all/nested`: every row of `nested`, whichever parent it has
//!
//! Descriptors are parsed once into [`Channel`] and resolved against a lookup
//! table built from the registry when the router is created.

use crate::schema::{Schema, ScopeRule, PATIENT_ENTITY};
use crate::{error::Result, EntityName, Error, RecordId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Placeholder parent id meaning "any parent".
pub const ALL_PARENTS: &str = "all";

/// A parsed channel descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Channel {
    Global {
        entity: EntityName,
    },
    ScopedToOne {
        parent: EntityName,
        parent_id: RecordId,
        nested: EntityName,
    },
    ScopedToAllOfType {
        parent: EntityName,
        nested: EntityName,
    },
}

impl Channel {
    pub fn global(entity: impl Into<EntityName>) -> Self {
        Channel::Global {
            entity: entity.into(),
        }
    }

    pub fn scoped(
        parent: impl Into<EntityName>,
        parent_id: impl Into<RecordId>,
        nested: impl Into<EntityName>,
    ) -> Self {
        Channel::ScopedToOne {
            parent: parent.into(),
            parent_id: parent_id.into(),
            nested: nested.into(),
        }
    }

    pub fn all_of(parent: impl Into<EntityName>, nested: impl Into<EntityName>) -> Self {
        Channel::ScopedToAllOfType {
            parent: parent.into(),
            nested: nested.into(),
        }
    }

    /// The entity type whose rows the channel carries.
    pub fn target(&self) -> &str {
        match self {
            Channel::Global { entity } => entity,
            Channel::ScopedToOne { nested, .. } | Channel::ScopedToAllOfType { nested, .. } => {
                nested
            }
        }
    }

    fn route_key(&self) -> RouteKey {
        match self {
            Channel::Global { entity } => RouteKey::Global(entity.clone()),
            Channel::ScopedToOne { parent, nested, .. }
            | Channel::ScopedToAllOfType { parent, nested } => {
                RouteKey::Nested(parent.clone(), nested.clone())
            }
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Global { entity } => write!(f, "{entity}"),
            Channel::ScopedToOne {
                parent,
                parent_id,
                nested,
            } => write!(f, "{parent}/{parent_id}/{nested}"),
            Channel::ScopedToAllOfType { parent, nested } => {
                write!(f, "{parent}/{ALL_PARENTS}/{nested}")
            }
        }
    }
}

impl FromStr for Channel {
    type Err = Error;

    fn from_str(descriptor: &str) -> Result<Self> {
        let segments: Vec<&str> = descriptor.split('/').collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(Error::scope(descriptor, "empty segment"));
        }
        match segments.as_slice() {
            [entity] => Ok(Channel::global(*entity)),
            [parent, parent_id, nested] if *parent_id == ALL_PARENTS => {
                Ok(Channel::all_of(*parent, *nested))
            }
            [parent, parent_id, nested] => Ok(Channel::scoped(*parent, *parent_id, *nested)),
            _ => Err(Error::scope(
                descriptor,
                "expected 'entity', 'entity/{id}/nested' or 'entity/all/nested'",
            )),
        }
    }
}

impl TryFrom<String> for Channel {
    type Error = crate::Error;

    fn try_from(descriptor: String) -> Result<Self> {
        descriptor.parse()
    }
}

impl From<Channel> for String {
    fn from(channel: Channel) -> Self {
        channel.to_string()
    }
}

/// Row predicate a resolved channel applies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ChannelScope {
    /// Every row of the target types
    Unscoped,
    /// Rows whose `column` holds `parent_id`
    Parent { column: String, parent_id: RecordId },
}

impl ChannelScope {
    /// Whether a row's field map falls inside the scope.
    pub fn matches(&self, fields: &serde_json::Map<String, serde_json::Value>) -> bool {
        match self {
            ChannelScope::Unscoped => true,
            ChannelScope::Parent { column, parent_id } => {
                fields.get(column).and_then(|v| v.as_str()) == Some(parent_id.as_str())
            }
        }
    }
}

/// The result of resolving a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedChannel {
    pub channel: Channel,
    pub entity_types: Vec<EntityName>,
    pub scope: ChannelScope,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum RouteKey {
    Global(EntityName),
    Nested(EntityName, EntityName),
}

#[derive(Debug, Clone)]
struct RouteEntry {
    entity_types: Vec<EntityName>,
    /// Column on the nested type holding the parent id (nested routes only)
    parent_column: Option<String>,
}

/// Resolves channel descriptors against a lookup table built once from the
/// registry.
#[derive(Debug, Clone)]
pub struct ChannelRouter {
    routes: HashMap<RouteKey, RouteEntry>,
}

impl ChannelRouter {
    /// Build the routing table.
    ///
    /// - every synced type gets a global route
    /// - every declared association `P -> T` gets the nested route `P/…/T`
    /// - every patient-linked type `T` gets the nested route `patient/…/T`
    pub fn new(schema: &Schema) -> Self {
        let mut routes = HashMap::new();

        for entity in schema.entities.values() {
            if !entity.sync_direction.is_synced() {
                continue;
            }
            routes.insert(
                RouteKey::Global(entity.name.clone()),
                RouteEntry {
                    entity_types: vec![entity.name.clone()],
                    parent_column: None,
                },
            );

            for assoc in &entity.associations {
                routes.insert(
                    RouteKey::Nested(entity.name.clone(), assoc.target.clone()),
                    RouteEntry {
                        entity_types: vec![assoc.target.clone()],
                        parent_column: Some(assoc.foreign_key.clone()),
                    },
                );
            }

            if let Some(ScopeRule::PatientLinked { column }) = &entity.scope {
                routes
                    .entry(RouteKey::Nested(
                        PATIENT_ENTITY.to_string(),
                        entity.name.clone(),
                    ))
                    .or_insert_with(|| RouteEntry {
                        entity_types: vec![entity.name.clone()],
                        parent_column: Some(column.clone()),
                    });
            }
        }

        tracing::debug!(routes = routes.len(), "built channel routing table");
        Self { routes }
    }

    /// Resolve a descriptor string. Unresolvable descriptors are fatal setup
    /// errors.
    pub fn resolve(&self, descriptor: &str) -> Result<ResolvedChannel> {
        let channel: Channel = descriptor.parse()?;
        self.resolve_channel(&channel)
    }

    /// Resolve an already parsed channel.
    pub fn resolve_channel(&self, channel: &Channel) -> Result<ResolvedChannel> {
        let entry = self.routes.get(&channel.route_key()).ok_or_else(|| {
            Error::scope(channel.to_string(), "no route for this entity combination")
        })?;

        let scope = match (channel, &entry.parent_column) {
            (Channel::ScopedToOne { parent_id, .. }, Some(column)) => ChannelScope::Parent {
                column: column.clone(),
                parent_id: parent_id.clone(),
            },
            _ => ChannelScope::Unscoped,
        };

        Ok(ResolvedChannel {
            channel: channel.clone(),
            entity_types: entry.entity_types.clone(),
            scope,
        })
    }

    /// Entity types that declare a patient-scope predicate.
    pub fn discover_patient_scoped_types(schema: &Schema) -> Vec<EntityName> {
        schema
            .patient_linked_types()
            .into_iter()
            .filter(|e| e.sync_direction.is_synced())
            .map(|e| e.name.clone())
            .collect()
    }

    /// The per-patient channels negotiated for one patient.
    pub fn patient_channels(schema: &Schema, patient_id: &str) -> Vec<Channel> {
        Self::discover_patient_scoped_types(schema)
            .into_iter()
            .map(|entity| Channel::scoped(PATIENT_ENTITY, patient_id, entity))
            .collect()
    }
}
