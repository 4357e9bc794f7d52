//! The entity registry this deployment replicates.

use ward_engine::{
    Association, AssociationKind, EntityType, FieldDef, FieldType, Schema, ScopeRule,
    SyncDirection,
};

/// Registry version, bumped whenever an entity type changes shape.
pub const SCHEMA_VERSION: u32 = 1;

/// Build the registry.
pub fn ward_schema() -> Schema {
    Schema::new(SCHEMA_VERSION)
        // Reference data, maintained centrally
        .with_entity(
            EntityType::new(
                "referenceData",
                vec![
                    FieldDef::required("type", FieldType::String),
                    FieldDef::required("code", FieldType::String),
                    FieldDef::optional("name", FieldType::String),
                ],
            )
            .direction(SyncDirection::OutwardOnly),
        )
        .with_entity(
            EntityType::new(
                "user",
                vec![
                    FieldDef::required("email", FieldType::String),
                    FieldDef::optional("displayName", FieldType::String),
                ],
            )
            .direction(SyncDirection::OutwardOnly),
        )
        .with_entity(
            EntityType::new(
                "facility",
                vec![FieldDef::required("name", FieldType::String)],
            )
            .direction(SyncDirection::OutwardOnly),
        )
        .with_entity(
            EntityType::new("setting", vec![FieldDef::required("key", FieldType::String)])
                .direction(SyncDirection::OutwardOnly)
                .scoped(ScopeRule::facility("facilityId")),
        )
        // Patients and everything hanging off them
        .with_entity(
            EntityType::new(
                "patient",
                vec![
                    FieldDef::required("displayId", FieldType::String),
                    FieldDef::optional("firstName", FieldType::String),
                    FieldDef::optional("lastName", FieldType::String),
                    FieldDef::optional("dateOfBirth", FieldType::String),
                ],
            )
            .push_tracked(),
        )
        .with_entity(
            EntityType::new(
                "patientAdditionalData",
                vec![FieldDef::required("patientId", FieldType::String)],
            )
            .scoped(ScopeRule::patient("patientId"))
            .push_tracked(),
        )
        .with_entity(
            EntityType::new(
                "patientAllergy",
                vec![FieldDef::required("patientId", FieldType::String)],
            )
            .scoped(ScopeRule::patient("patientId"))
            .push_tracked(),
        )
        .with_entity(
            EntityType::new(
                "patientIssue",
                vec![FieldDef::required("patientId", FieldType::String)],
            )
            .scoped(ScopeRule::patient("patientId"))
            .push_tracked(),
        )
        .with_entity(
            EntityType::new(
                "encounter",
                vec![
                    FieldDef::required("patientId", FieldType::String),
                    FieldDef::optional("reasonForEncounter", FieldType::String),
                    FieldDef::optional("startDate", FieldType::String),
                ],
            )
            .scoped(ScopeRule::patient("patientId"))
            .push_tracked()
            .association(Association::new(
                "diagnoses",
                "encounterDiagnosis",
                "encounterId",
                AssociationKind::TravelsWithParent,
            ))
            .association(Association::new(
                "medications",
                "encounterMedication",
                "encounterId",
                AssociationKind::TravelsWithParent,
            ))
            .association(Association::new(
                "vitals",
                "vitals",
                "encounterId",
                AssociationKind::Independent,
            )),
        )
        .with_entity(EntityType::new(
            "encounterDiagnosis",
            vec![FieldDef::optional("certainty", FieldType::String)],
        ))
        .with_entity(EntityType::new(
            "encounterMedication",
            vec![FieldDef::optional("prescription", FieldType::String)],
        ))
        .with_entity(EntityType::new("vitals", vec![]))
        .with_entity(
            EntityType::new(
                "labRequest",
                vec![FieldDef::required("patientId", FieldType::String)],
            )
            .scoped(ScopeRule::patient("patientId"))
            .push_tracked()
            .association(Association::new(
                "tests",
                "labTest",
                "labRequestId",
                AssociationKind::TravelsWithParent,
            )),
        )
        .with_entity(EntityType::new(
            "labTest",
            vec![FieldDef::optional("result", FieldType::String)],
        ))
        .with_entity(
            EntityType::new(
                "surveyResponse",
                vec![FieldDef::required("patientId", FieldType::String)],
            )
            .scoped(ScopeRule::patient("patientId"))
            .association(Association::new(
                "answers",
                "surveyResponseAnswer",
                "responseId",
                AssociationKind::ReplacingSet,
            )),
        )
        .with_entity(EntityType::new(
            "surveyResponseAnswer",
            vec![FieldDef::optional("body", FieldType::Json)],
        ))
        // Written by facilities, never sent back out
        .with_entity(
            EntityType::new(
                "reportRequest",
                vec![FieldDef::required("reportType", FieldType::String)],
            )
            .direction(SyncDirection::InwardOnly),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use ward_engine::{ChannelRouter, ExportPlan, ImportPlan};

    #[test]
    fn every_patient_channel_compiles() {
        let schema = ward_schema();
        let router = ChannelRouter::new(&schema);
        let channels = ChannelRouter::patient_channels(&schema, "p-1");
        assert!(!channels.is_empty());
        for channel in channels {
            let resolved = router.resolve_channel(&channel).unwrap();
            ExportPlan::compile(&schema, resolved.clone()).unwrap();
            ImportPlan::compile(&schema, resolved).unwrap();
        }
    }

    #[test]
    fn inward_only_types_are_not_exported() {
        let schema = ward_schema();
        let outgoing: Vec<&str> = schema
            .outgoing_types()
            .into_iter()
            .map(|e| e.name.as_str())
            .collect();
        assert!(!outgoing.contains(&"reportRequest"));
        assert!(outgoing.contains(&"referenceData"));
    }
}
