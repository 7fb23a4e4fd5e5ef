// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::mapping::{ConditionOperator, Direction, ModelMapper, TargetType};

use anyhow::Result;

#[test]
fn parses_a_full_mapper_configuration() -> Result<()> {
    let mapper = ModelMapper::from_json_str(
        r#"{
            "name": "blutdruck",
            "openEhrConfig": { "archetype": "openEHR-EHR-OBSERVATION.blood_pressure.v2" },
            "fhirConfig": {
                "resource": "Observation",
                "condition": {
                    "targetRoot": "$resource.code",
                    "targetAttribute": "coding.code",
                    "operator": "one of",
                    "criteria": "[$loinc.85354-9]"
                },
                "multiple": true
            },
            "mappings": [
                {
                    "name": "systolisch",
                    "with": {
                        "fhir": "$resource.component.value",
                        "openehr": "$archetype/systolisch",
                        "type": "QUANTITY"
                    },
                    "unidirectional": "toOpenEhr"
                }
            ]
        }"#,
    )?;

    assert_eq!(mapper.name, "blutdruck");
    assert_eq!(
        mapper.openehr_config.archetype,
        "openEHR-EHR-OBSERVATION.blood_pressure.v2"
    );
    assert_eq!(mapper.fhir_config.resource, "Observation");
    assert!(mapper.fhir_config.multiple);

    let condition = mapper.fhir_config.condition.as_ref().unwrap();
    assert_eq!(condition.operator, ConditionOperator::OneOf);
    assert_eq!(condition.attributes(), vec!["coding.code"]);

    let rule = &mapper.mappings[0];
    assert_eq!(rule.with.target_type, Some(TargetType::Quantity));
    assert_eq!(rule.unidirectional, Some(Direction::ToOpenEhr));
    Ok(())
}

#[test]
fn accepts_reference_model_type_aliases() -> Result<()> {
    for (spelling, expected) in [
        ("\"DV_QUANTITY\"", TargetType::Quantity),
        ("\"DV_CODED_TEXT\"", TargetType::CodedText),
        ("\"CODED_TEXT\"", TargetType::CodedText),
        ("\"DV_TEXT\"", TargetType::Text),
        ("\"DV_DATE_TIME\"", TargetType::DateTime),
        ("\"BOOLEAN\"", TargetType::Boolean),
    ] {
        let parsed: TargetType = serde_json::from_str(spelling)?;
        assert_eq!(parsed, expected, "for spelling {spelling}");
    }
    Ok(())
}

#[test]
fn accepts_operator_aliases() -> Result<()> {
    for (spelling, expected) in [
        ("\"one of\"", ConditionOperator::OneOf),
        ("\"oneOf\"", ConditionOperator::OneOf),
        ("\"not of\"", ConditionOperator::NotOf),
        ("\"not empty\"", ConditionOperator::NotEmpty),
        ("\"type\"", ConditionOperator::TypeEquals),
    ] {
        let parsed: ConditionOperator = serde_json::from_str(spelling)?;
        assert_eq!(parsed, expected, "for spelling {spelling}");
    }
    Ok(())
}

#[test]
fn type_guard_matching_ignores_the_spelling_family() {
    assert!(TargetType::Quantity.matches("DV_QUANTITY"));
    assert!(TargetType::Quantity.matches("QUANTITY"));
    assert!(TargetType::CodedText.matches("DV_CODED_TEXT"));
    assert!(TargetType::CodedText.matches("CODEABLECONCEPT"));
    assert!(!TargetType::Quantity.matches("DV_CODED_TEXT"));
}

#[cfg(feature = "yaml")]
#[test]
fn parses_a_mapper_from_yaml() -> Result<()> {
    let mapper = ModelMapper::from_yaml_str(
        r#"
name: puls
openEhrConfig:
  archetype: openEHR-EHR-OBSERVATION.pulse.v2
fhirConfig:
  resource: Observation
mappings:
  - name: frequenz
    with:
      fhir: $resource.value
      openehr: $archetype/frequenz
      type: QUANTITY
"#,
    )?;
    assert_eq!(mapper.name, "puls");
    assert_eq!(mapper.mappings.len(), 1);
    assert_eq!(mapper.mappings[0].with.target_type, Some(TargetType::Quantity));
    Ok(())
}
