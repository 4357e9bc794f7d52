//! Compiled record shape shared by export and import plans.
//!
//! A plan is the static manifest of one channel's wire records: the root
//! entity type plus, recursively, every association declared to travel with
//! its parent. Independent associations never appear in a plan; they
//! replicate on their own channels.

use crate::channel::{ChannelScope, ResolvedChannel};
use crate::schema::{AssociationKind, EntityType, Schema};
use crate::store::RowScope;
use crate::{error::Result, EntityName, Error};
use serde::{Deserialize, Serialize};

/// One nested collection inside a parent's wire record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NestedPlan {
    /// Key of the collection in the parent's `data`
    pub name: String,
    pub target: EntityName,
    pub foreign_key: String,
    pub kind: AssociationKind,
    pub nested: Vec<NestedPlan>,
}

/// A compiled channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub root_type: EntityName,
    pub nested_associations: Vec<NestedPlan>,
    pub channel: ResolvedChannel,
}

impl Plan {
    pub fn compile(schema: &Schema, channel: ResolvedChannel) -> Result<Self> {
        let root_type = match channel.entity_types.as_slice() {
            [root] => root.clone(),
            _ => {
                return Err(Error::scope(
                    channel.channel.to_string(),
                    "channel must resolve to exactly one root type",
                ))
            }
        };
        let root = schema.require(&root_type)?;
        let mut path = vec![root_type.clone()];
        let nested_associations = compile_nested(schema, root, &mut path)?;

        Ok(Self {
            root_type,
            nested_associations,
            channel,
        })
    }

    /// Predicate the channel applies to root rows.
    pub fn row_scope(&self) -> RowScope {
        match &self.channel.scope {
            ChannelScope::Unscoped => RowScope::All,
            ChannelScope::Parent { column, parent_id } => {
                RowScope::column(column.clone(), vec![parent_id.clone()])
            }
        }
    }

    /// Column and value forced onto every imported root row.
    pub fn forced_parent(&self) -> Option<(&str, &str)> {
        match &self.channel.scope {
            ChannelScope::Unscoped => None,
            ChannelScope::Parent { column, parent_id } => {
                Some((column.as_str(), parent_id.as_str()))
            }
        }
    }

    /// Every entity type a wire record of this plan can touch.
    pub fn entity_types(&self) -> Vec<&str> {
        fn walk<'a>(nested: &'a [NestedPlan], out: &mut Vec<&'a str>) {
            for assoc in nested {
                out.push(&assoc.target);
                walk(&assoc.nested, out);
            }
        }
        let mut out = vec![self.root_type.as_str()];
        walk(&self.nested_associations, &mut out);
        out
    }
}

fn compile_nested(
    schema: &Schema,
    entity: &EntityType,
    path: &mut Vec<EntityName>,
) -> Result<Vec<NestedPlan>> {
    let mut plans = Vec::new();
    for assoc in entity.nested_associations() {
        // A type already on the path would nest forever
        if path.contains(&assoc.target) {
            continue;
        }
        let target = schema.require(&assoc.target)?;
        path.push(assoc.target.clone());
        let nested = compile_nested(schema, target, path)?;
        path.pop();

        plans.push(NestedPlan {
            name: assoc.name.clone(),
            target: assoc.target.clone(),
            foreign_key: assoc.foreign_key.clone(),
            kind: assoc.kind,
            nested,
        });
    }
    Ok(plans)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelRouter;
    use crate::schema::{Association, ScopeRule};

    fn test_schema() -> Schema {
        Schema::new(1)
            .with_entity(EntityType::new("patient", vec![]))
            .with_entity(
                EntityType::new("encounter", vec![])
                    .scoped(ScopeRule::patient("patientId"))
                    .association(Association::new(
                        "diagnoses",
                        "diagnosis",
                        "encounterId",
                        AssociationKind::TravelsWithParent,
                    ))
                    .association(Association::new(
                        "notes",
                        "note",
                        "encounterId",
                        AssociationKind::Independent,
                    )),
            )
            .with_entity(EntityType::new("diagnosis", vec![]).association(Association::new(
                "evidence",
                "evidence",
                "diagnosisId",
                AssociationKind::ReplacingSet,
            )))
            .with_entity(EntityType::new("evidence", vec![]).association(Association::new(
                "loop",
                "diagnosis",
                "evidenceId",
                AssociationKind::TravelsWithParent,
            )))
            .with_entity(EntityType::new("note", vec![]))
    }

    #[test]
    fn compiles_travelling_associations_recursively() {
        let schema = test_schema();
        let router = ChannelRouter::new(&schema);
        let plan = Plan::compile(&schema, router.resolve("encounter").unwrap()).unwrap();

        assert_eq!(plan.root_type, "encounter");
        assert_eq!(plan.nested_associations.len(), 1);
        let diagnoses = &plan.nested_associations[0];
        assert_eq!(diagnoses.name, "diagnoses");
        assert_eq!(diagnoses.nested[0].kind, AssociationKind::ReplacingSet);
        // evidence -> diagnosis would cycle back
        assert!(diagnoses.nested[0].nested.is_empty());
        assert_eq!(plan.entity_types(), vec!["encounter", "diagnosis", "evidence"]);
    }

    #[test]
    fn scoped_plan_forces_parent() {
        let schema = test_schema();
        let router = ChannelRouter::new(&schema);
        let plan = Plan::compile(&schema, router.resolve("patient/p-1/encounter").unwrap()).unwrap();
        assert_eq!(plan.forced_parent(), Some(("patientId", "p-1")));
        assert_eq!(
            plan.row_scope(),
            RowScope::column("patientId", vec!["p-1".to_string()])
        );
    }

    #[test]
    fn plan_is_serializable() {
        let schema = test_schema();
        let router = ChannelRouter::new(&schema);
        let plan = Plan::compile(&schema, router.resolve("encounter").unwrap()).unwrap();
        let json = serde_json::to_value(&plan).unwrap();
        assert_eq!(json["rootType"], "encounter");
        assert_eq!(json["channel"]["channel"], "encounter");
        assert_eq!(json["nestedAssociations"][0]["target"], "diagnosis");
    }
}
