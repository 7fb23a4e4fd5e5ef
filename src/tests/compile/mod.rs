// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use super::common::TestRegistry;
use crate::compile::Compiler;
use crate::error::MapError;
use crate::mapping::{ModelMapper, TargetType};

use anyhow::Result;

const TEMPLATE: &str = "diagnose.v0";
const ARCHETYPE_ROOT: &str = "diagnose.v0/content[openEHR-EHR-EVALUATION.problem_qualified.v1]";

fn diagnose_mapper() -> Result<ModelMapper> {
    ModelMapper::from_json_str(
        r#"{
            "name": "diagnose",
            "openEhrConfig": { "archetype": "openEHR-EHR-EVALUATION.problem_qualified.v1" },
            "fhirConfig": {
                "resource": "Condition",
                "condition": {
                    "targetRoot": "$resource.code",
                    "targetAttributes": ["coding.code"],
                    "operator": "one of",
                    "criteria": "[C34.1]"
                },
                "multiple": true
            },
            "mappings": [
                {
                    "name": "feststellungsdatum",
                    "with": {
                        "fhir": "$resource.onsetDateTime",
                        "openehr": "$archetype/feststellungsdatum",
                        "type": "DATETIME"
                    }
                }
            ]
        }"#,
    )
}

#[test]
fn selector_condition_narrows_the_limiting_criteria() -> Result<()> {
    let registry = TestRegistry::new();
    let compiler = Compiler::new(&registry, TEMPLATE);
    let compiled = compiler.compile(&diagnose_mapper()?)?;

    assert_eq!(compiled.helpers.len(), 1);
    assert!(compiled.cover_helpers.is_empty());

    let helper = &compiled.helpers[0];
    assert_eq!(
        helper.limiting_criteria,
        "Bundle.entry.resource.ofType(Condition).where(code.where(coding.where(code='C34.1').exists()))"
    );
    assert_eq!(helper.fhir_path, "Condition.onsetDateTime");
    assert_eq!(
        helper.openehr_path,
        format!("{ARCHETYPE_ROOT}/feststellungsdatum")
    );
    assert_eq!(helper.openehr_type, Some(TargetType::DateTime));
    assert!(helper.multiple);
    assert!(helper.children.is_empty());
    Ok(())
}

#[test]
fn compiling_the_same_mapper_twice_yields_identical_helpers() -> Result<()> {
    let registry = TestRegistry::new();
    let compiler = Compiler::new(&registry, TEMPLATE);
    let mapper = diagnose_mapper()?;
    let first = compiler.compile(&mapper)?;
    let second = compiler.compile(&mapper)?;
    assert_eq!(first.helpers, second.helpers);
    assert_eq!(first.cover_helpers, second.cover_helpers);
    Ok(())
}

#[test]
fn followed_by_rules_become_child_helpers() -> Result<()> {
    let mapper = ModelMapper::from_json_str(
        r#"{
            "name": "diagnose",
            "openEhrConfig": { "archetype": "openEHR-EHR-EVALUATION.problem_qualified.v1" },
            "fhirConfig": { "resource": "Condition", "multiple": true },
            "mappings": [
                {
                    "name": "diagnose-group",
                    "with": {
                        "fhir": "$resource",
                        "openehr": "$archetype/diagnose[n]",
                        "type": "NONE"
                    },
                    "followedBy": {
                        "mappings": [
                            {
                                "name": "datum",
                                "with": {
                                    "fhir": "$fhirRoot.onsetDateTime",
                                    "openehr": "feststellungsdatum",
                                    "type": "DATETIME"
                                }
                            }
                        ]
                    }
                }
            ]
        }"#,
    )?;

    let registry = TestRegistry::new();
    let compiled = Compiler::new(&registry, TEMPLATE).compile(&mapper)?;
    assert_eq!(compiled.helpers.len(), 1);

    let parent = &compiled.helpers[0];
    assert_eq!(parent.fhir_path, "Condition");
    assert_eq!(parent.openehr_path, format!("{ARCHETYPE_ROOT}/diagnose[n]"));
    assert_eq!(parent.openehr_type, Some(TargetType::None));
    assert_eq!(parent.children.len(), 1);

    let child = &parent.children[0];
    assert_eq!(child.fhir_path, ".onsetDateTime");
    assert_eq!(
        child.openehr_path,
        format!("{ARCHETYPE_ROOT}/diagnose[n]/feststellungsdatum")
    );
    assert_eq!(child.openehr_type, Some(TargetType::DateTime));
    Ok(())
}

#[test]
fn unknown_slot_archetypes_fail_compilation() -> Result<()> {
    let mapper = ModelMapper::from_json_str(
        r#"{
            "name": "problem",
            "openEhrConfig": { "archetype": "openEHR-EHR-EVALUATION.problem.v1" },
            "fhirConfig": { "resource": "Condition" },
            "mappings": [
                {
                    "name": "staging",
                    "with": { "fhir": "$resource.stage", "openehr": "$archetype/staging" },
                    "slotArchetype": "openEHR-EHR-CLUSTER.tnm.v1"
                }
            ]
        }"#,
    )?;

    let registry = TestRegistry::new();
    let error = Compiler::new(&registry, TEMPLATE)
        .compile(&mapper)
        .unwrap_err();
    match error.downcast_ref::<MapError>() {
        Some(MapError::UnknownSlotArchetype { archetype, rule }) => {
            assert_eq!(archetype, "openEHR-EHR-CLUSTER.tnm.v1");
            assert_eq!(rule, "staging");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    Ok(())
}

#[test]
fn self_referencing_slots_terminate() -> Result<()> {
    let details = r#"{
        "name": "problem",
        "openEhrConfig": { "archetype": "openEHR-EHR-CLUSTER.details.v1" },
        "fhirConfig": { "resource": "Condition" },
        "mappings": [
            {
                "name": "inner",
                "with": { "fhir": "$fhirRoot.code", "openehr": "$openehrRoot/code" },
                "slotArchetype": "openEHR-EHR-CLUSTER.details.v1"
            }
        ]
    }"#;
    let mapper = ModelMapper::from_json_str(
        r#"{
            "name": "problem",
            "openEhrConfig": { "archetype": "openEHR-EHR-EVALUATION.problem.v1" },
            "fhirConfig": { "resource": "Condition" },
            "mappings": [
                {
                    "name": "details",
                    "with": { "fhir": "$resource.evidence", "openehr": "$archetype/details" },
                    "slotArchetype": "openEHR-EHR-CLUSTER.details.v1"
                }
            ]
        }"#,
    )?;

    let registry = TestRegistry::new().slot(
        "openEHR-EHR-CLUSTER.details.v1",
        vec![ModelMapper::from_json_str(details)?],
    );
    let compiled = Compiler::new(&registry, TEMPLATE).compile(&mapper)?;
    assert_eq!(compiled.helpers.len(), 1);
    Ok(())
}

#[test]
fn inapplicable_rules_are_skipped() -> Result<()> {
    let mapper = ModelMapper::from_json_str(
        r#"{
            "name": "observation",
            "openEhrConfig": { "archetype": "openEHR-EHR-OBSERVATION.sample.v1" },
            "fhirConfig": { "resource": "Observation" },
            "mappings": [
                { "name": "to-source-hardcode", "with": { "fhir": "Observation.status", "value": "final" } },
                {
                    "name": "source-only",
                    "with": { "fhir": "$resource.a", "openehr": "$archetype/a" },
                    "unidirectional": "toFhir"
                },
                { "name": "contextual", "with": { "fhir": "$resource.b", "openehr": "$context/setting" } }
            ]
        }"#,
    )?;

    let registry = TestRegistry::new();
    let compiled = Compiler::new(&registry, TEMPLATE).compile(&mapper)?;
    assert!(compiled.helpers.is_empty());
    assert!(compiled.cover_helpers.is_empty());
    Ok(())
}

#[test]
fn foreign_kind_source_paths_become_cover_helpers() -> Result<()> {
    let mapper = ModelMapper::from_json_str(
        r#"{
            "name": "diagnose",
            "openEhrConfig": { "archetype": "openEHR-EHR-EVALUATION.problem_qualified.v1" },
            "fhirConfig": { "resource": "Condition" },
            "mappings": [
                {
                    "name": "person",
                    "with": {
                        "fhir": "Patient.name.given",
                        "openehr": "$archetype/person/name",
                        "type": "STRING"
                    }
                }
            ]
        }"#,
    )?;

    let registry = TestRegistry::new();
    let compiled = Compiler::new(&registry, TEMPLATE).compile(&mapper)?;
    assert!(compiled.helpers.is_empty());
    assert_eq!(compiled.cover_helpers.len(), 1);

    let cover = &compiled.cover_helpers[0];
    assert_eq!(cover.fhir_path, "Patient.name.given");
    assert_eq!(cover.limiting_criteria, "Bundle.entry.resource.ofType(Patient)");
    Ok(())
}

#[test]
fn hardcoded_rules_compile_to_literal_helpers() -> Result<()> {
    let mapper = ModelMapper::from_json_str(
        r#"{
            "name": "diagnose",
            "openEhrConfig": { "archetype": "openEHR-EHR-EVALUATION.problem_qualified.v1" },
            "fhirConfig": { "resource": "Condition" },
            "mappings": [
                {
                    "name": "kategorie",
                    "with": { "openehr": "$archetype/kategorie|code", "value": "at0001" }
                }
            ]
        }"#,
    )?;

    let registry = TestRegistry::new();
    let compiled = Compiler::new(&registry, TEMPLATE).compile(&mapper)?;
    assert_eq!(compiled.helpers.len(), 1);

    let helper = &compiled.helpers[0];
    assert_eq!(helper.hardcoding_value.as_deref(), Some("at0001"));
    assert_eq!(helper.fhir_path, "");
    assert_eq!(helper.openehr_path, format!("{ARCHETYPE_ROOT}/kategorie|code"));
    Ok(())
}
