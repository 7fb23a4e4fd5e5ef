// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use super::common::{coding, concept_of};
use crate::flat::{FlatRecord, FlatValue};
use crate::mapping::TargetType;
use crate::populate::{set_null_flavour, set_value, DATA_ABSENT_REASON_URL};
use crate::value::{Attachment, Extension, Identifier, Quantity, Ratio, Value};

fn quantity_of(value: f64, unit: &str) -> Value {
    Value::from(Quantity {
        value: Some(value),
        unit: Some(unit.to_string()),
        ..Quantity::default()
    })
}

#[test]
fn quantity_splits_into_magnitude_and_unit() {
    let mut flat = FlatRecord::new();
    set_value("v/weight", &quantity_of(72.5, "kg"), Some(TargetType::Quantity), &mut flat);
    assert_eq!(flat.get("v/weight|magnitude"), Some(&FlatValue::Number(72.5)));
    assert_eq!(flat.get_text("v/weight|unit"), Some("kg"));
}

#[test]
fn quantity_accepts_a_numeric_string() {
    let mut flat = FlatRecord::new();
    set_value("v/weight", &Value::string("12.5"), Some(TargetType::Quantity), &mut flat);
    assert_eq!(flat.get("v/weight|magnitude"), Some(&FlatValue::Number(12.5)));

    set_value("v/other", &Value::string("heavy"), Some(TargetType::Quantity), &mut flat);
    assert!(!flat.contains("v/other|magnitude"));
}

#[test]
fn quantity_unwraps_a_ratio_numerator() {
    let ratio = Value::from(Ratio {
        numerator: Some(Quantity {
            value: Some(5.0),
            unit: Some("mg".to_string()),
            ..Quantity::default()
        }),
        denominator: None,
    });
    let mut flat = FlatRecord::new();
    set_value("v/dose", &ratio, Some(TargetType::Quantity), &mut flat);
    assert_eq!(flat.get("v/dose|magnitude"), Some(&FlatValue::Number(5.0)));
    assert_eq!(flat.get_text("v/dose|unit"), Some("mg"));
}

#[test]
fn ordinal_writes_rank_symbol_and_code() {
    let severity = Value::from(Quantity {
        value: Some(2.0),
        unit: Some("Mild".to_string()),
        code: Some("at0005".to_string()),
        system: None,
    });
    let mut flat = FlatRecord::new();
    set_value("v/severity", &severity, Some(TargetType::Ordinal), &mut flat);
    assert_eq!(flat.get_text("v/severity|ordinal"), Some("2"));
    assert_eq!(flat.get_text("v/severity|value"), Some("Mild"));
    assert_eq!(flat.get_text("v/severity|code"), Some("at0005"));
}

#[test]
fn percent_proportion_gets_a_fixed_denominator() {
    let saturation = Value::from(Quantity {
        value: Some(40.0),
        unit: Some("%".to_string()),
        code: Some("%".to_string()),
        system: None,
    });
    let mut flat = FlatRecord::new();
    set_value("v/spo2", &saturation, Some(TargetType::Proportion), &mut flat);
    assert_eq!(flat.get("v/spo2|numerator"), Some(&FlatValue::Number(40.0)));
    assert_eq!(flat.get("v/spo2|denominator"), Some(&FlatValue::Number(100.0)));
    assert_eq!(flat.get_text("v/spo2|type"), Some("2"));
}

#[test]
fn count_truncates_a_quantity_magnitude() {
    let mut flat = FlatRecord::new();
    set_value("v/n", &Value::Integer(3), Some(TargetType::Count), &mut flat);
    assert_eq!(flat.get("v/n"), Some(&FlatValue::Integer(3)));

    set_value("v/m", &quantity_of(2.9, "1"), Some(TargetType::Count), &mut flat);
    assert_eq!(flat.get("v/m"), Some(&FlatValue::Integer(2)));
}

#[test]
fn temporal_types_render_naive_local_representations() {
    let instant = Value::DateTime(
        chrono::DateTime::parse_from_rfc3339("2022-02-03T04:05:06+01:00").unwrap(),
    );
    let mut flat = FlatRecord::new();
    set_value("v/at", &instant, Some(TargetType::DateTime), &mut flat);
    set_value("v/on", &instant, Some(TargetType::Date), &mut flat);
    set_value("v/clock", &instant, Some(TargetType::Time), &mut flat);
    assert_eq!(flat.get_text("v/at"), Some("2022-02-03T04:05:06"));
    assert_eq!(flat.get_text("v/on"), Some("2022-02-03"));
    assert_eq!(flat.get_text("v/clock"), Some("04:05:06"));
}

#[test]
fn coded_text_prefers_concept_text_over_primary_display() {
    let concept = concept_of(
        vec![
            coding("http://snomed.info/sct", "254637007", "NSCLC"),
            coding("http://loinc.org", "56", "Second display"),
        ],
        Some("Non-small cell lung cancer"),
    );
    let mut flat = FlatRecord::new();
    set_value("v/diagnosis", &concept, Some(TargetType::CodedText), &mut flat);
    assert_eq!(flat.get_text("v/diagnosis|code"), Some("254637007"));
    assert_eq!(flat.get_text("v/diagnosis|terminology"), Some("http://snomed.info/sct"));
    assert_eq!(flat.get_text("v/diagnosis|value"), Some("Non-small cell lung cancer"));
}

#[test]
fn secondary_codings_become_term_mappings() {
    let concept = concept_of(
        vec![
            coding("http://snomed.info/sct", "254637007", "NSCLC"),
            coding("http://loinc.org", "56", "Second display"),
        ],
        None,
    );
    let mut flat = FlatRecord::new();
    set_value("v/diagnosis", &concept, Some(TargetType::CodedText), &mut flat);
    assert_eq!(flat.get_text("v/diagnosis/_mapping:0/match"), Some("="));
    assert_eq!(flat.get_text("v/diagnosis/_mapping:0/target|code"), Some("56"));
    assert_eq!(
        flat.get_text("v/diagnosis/_mapping:0/target|terminology"),
        Some("http://loinc.org")
    );
    assert_eq!(
        flat.get_text("v/diagnosis/_mapping:0/target|preferred_term"),
        Some("Second display")
    );
}

#[test]
fn coded_text_accepts_a_bare_coding() {
    let value = Value::from(coding("http://snomed.info/sct", "38341003", "Hypertension"));
    let mut flat = FlatRecord::new();
    set_value("v/dx", &value, Some(TargetType::CodedText), &mut flat);
    assert_eq!(flat.get_text("v/dx|code"), Some("38341003"));
    assert_eq!(flat.get_text("v/dx|value"), Some("Hypertension"));
}

#[test]
fn code_phrase_mirrors_the_code_into_the_value() {
    let mut flat = FlatRecord::new();
    set_value("v/status", &Value::code("at0026"), Some(TargetType::CodePhrase), &mut flat);
    assert_eq!(flat.get_text("v/status|code"), Some("at0026"));
    assert_eq!(flat.get_text("v/status|value"), Some("at0026"));

    let concept = concept_of(vec![coding("local", "at0027", "Resolved")], None);
    set_value("v/next", &concept, Some(TargetType::CodePhrase), &mut flat);
    assert_eq!(flat.get_text("v/next|code"), Some("at0027"));
    assert_eq!(flat.get_text("v/next|terminology"), Some("local"));
}

#[test]
fn identifier_writes_its_id_qualifier() {
    let value = Value::from(Identifier {
        value: Some("id-9".to_string()),
        ..Identifier::default()
    });
    let mut flat = FlatRecord::new();
    set_value("v/ref", &value, Some(TargetType::Identifier), &mut flat);
    assert_eq!(flat.get_text("v/ref|id"), Some("id-9"));
}

#[test]
fn party_identified_maps_identifier_facets() {
    let value = Value::from(Identifier {
        value: Some("12345".to_string()),
        system: Some("http://hospital.example/mrn".to_string()),
        assigner: None,
        kind: Some(crate::value::Concept {
            codings: vec![coding("http://terminology.hl7.org/CodeSystem/v2-0203", "MR", "")],
            text: Some("Medical record number".to_string()),
        }),
    });
    let mut flat = FlatRecord::new();
    set_value("v/subject", &value, Some(TargetType::PartyIdentified), &mut flat);
    assert_eq!(flat.get_text("v/subject|id"), Some("12345"));
    assert_eq!(flat.get_text("v/subject|assigner"), Some("http://hospital.example/mrn"));
    // The coding code wins over the concept text.
    assert_eq!(flat.get_text("v/subject|type"), Some("MR"));
}

#[test]
fn party_proxy_takes_a_plain_name() {
    let mut flat = FlatRecord::new();
    set_value("v/author", &Value::string("Jane Doe"), Some(TargetType::PartyProxy), &mut flat);
    assert_eq!(flat.get_text("v/author|name"), Some("Jane Doe"));
}

#[test]
fn boolean_is_written_as_a_boolean() {
    let mut flat = FlatRecord::new();
    set_value("v/confirmed", &Value::Boolean(true), Some(TargetType::Boolean), &mut flat);
    assert_eq!(flat.get("v/confirmed"), Some(&FlatValue::Boolean(true)));
}

#[test]
fn multimedia_inlines_data_when_no_url_is_present() {
    let value = Value::from(Attachment {
        content_type: Some("image/png".to_string()),
        url: None,
        data: Some(vec![1, 2, 3]),
        size: None,
    });
    let mut flat = FlatRecord::new();
    set_value("v/media", &value, Some(TargetType::Multimedia), &mut flat);
    assert_eq!(flat.get_text("v/media|size"), Some("3"));
    assert_eq!(flat.get_text("v/media|mediatype"), Some("image/png"));
    assert_eq!(flat.get_text("v/media|data"), Some("AQID"));
    assert!(!flat.contains("v/media|url"));
}

#[test]
fn multimedia_prefers_a_url_over_inline_data() {
    let value = Value::from(Attachment {
        content_type: None,
        url: Some("http://pacs.example/img/1".to_string()),
        data: Some(vec![1, 2, 3]),
        size: Some(9000),
    });
    let mut flat = FlatRecord::new();
    set_value("v/media", &value, Some(TargetType::Multimedia), &mut flat);
    assert_eq!(flat.get_text("v/media|size"), Some("9000"));
    assert_eq!(flat.get_text("v/media|url"), Some("http://pacs.example/img/1"));
    assert!(!flat.contains("v/media|data"));
}

#[test]
fn qualified_paths_take_the_primitive_rendering_regardless_of_type() {
    let mut flat = FlatRecord::new();
    set_value("v/w|magnitude", &Value::string("hello"), Some(TargetType::Quantity), &mut flat);
    assert_eq!(flat.get_text("v/w|magnitude"), Some("hello"));
}

#[test]
fn leftover_recurring_markers_land_on_the_zeroth_occurrence() {
    let mut flat = FlatRecord::new();
    set_value("a[n]/b", &Value::string("x"), Some(TargetType::Text), &mut flat);
    assert_eq!(flat.get_text("a:0/b"), Some("x"));
}

#[test]
fn structural_types_write_nothing() {
    let mut flat = FlatRecord::new();
    set_value("a/b", &Value::string("x"), Some(TargetType::None), &mut flat);
    set_value("a/c", &Value::string("x"), Some(TargetType::Cluster), &mut flat);
    assert!(flat.is_empty());
}

#[test]
fn mismatched_shapes_are_dropped() {
    let mut flat = FlatRecord::new();
    set_value("a/b", &Value::string("yes"), Some(TargetType::Boolean), &mut flat);
    set_value("a/c", &Value::Boolean(true), Some(TargetType::Quantity), &mut flat);
    assert!(flat.is_empty());
}

#[test]
fn untyped_rules_dispatch_on_the_value_shape() {
    let mut flat = FlatRecord::new();
    set_value("a/amount", &quantity_of(1.5, "mg"), None, &mut flat);
    assert_eq!(flat.get_text("a/amount"), Some("1.5"));

    set_value("a/code", &Value::from(coding("sys", "x1", "")), None, &mut flat);
    assert_eq!(flat.get_text("a/code|code"), Some("x1"));
    assert_eq!(flat.get_text("a/code|terminology"), Some("sys"));
}

#[test]
fn null_flavour_paths_write_the_triplet() {
    let mut flat = FlatRecord::new();
    set_value("a/b/null_flavour", &Value::code("asked-declined"), None, &mut flat);
    assert_eq!(flat.get_text("a/b/null_flavour|value"), Some("masked"));
    assert_eq!(flat.get_text("a/b/null_flavour|code"), Some("272"));
    assert_eq!(flat.get_text("a/b/null_flavour|terminology"), Some("openehr"));
    assert_eq!(flat.len(), 3);
}

#[test]
fn data_absent_reason_codes_bucket_into_flavours() {
    let mut flat = FlatRecord::new();
    assert!(set_null_flavour("a/nf", &Value::code("temp-unknown"), &mut flat));
    assert_eq!(flat.get_text("a/nf|value"), Some("unknown"));
    assert_eq!(flat.get_text("a/nf|code"), Some("253"));

    assert!(set_null_flavour("b/nf", &Value::code("not-applicable"), &mut flat));
    assert_eq!(flat.get_text("b/nf|code"), Some("273"));

    assert!(set_null_flavour("c/nf", &Value::code("error"), &mut flat));
    assert_eq!(flat.get_text("c/nf|value"), Some("no information"));
    assert_eq!(flat.get_text("c/nf|code"), Some("271"));
}

#[test]
fn data_absent_reason_extension_unwraps_to_its_inner_reason() {
    let extension = Value::from(Extension {
        url: DATA_ABSENT_REASON_URL.to_string(),
        value: Some(Value::code("masked")),
    });
    let mut flat = FlatRecord::new();
    assert!(set_null_flavour("a/nf", &extension, &mut flat));
    assert_eq!(flat.get_text("a/nf|value"), Some("masked"));

    let foreign = Value::from(Extension {
        url: "http://example.org/other".to_string(),
        value: Some(Value::code("masked")),
    });
    assert!(!set_null_flavour("b/nf", &foreign, &mut flat));
    assert!(!flat.contains("b/nf|value"));
}

#[test]
fn codings_from_foreign_systems_carry_no_null_flavour() {
    let recognized = Value::from(coding(
        "http://terminology.hl7.org/CodeSystem/data-absent-reason",
        "temp-unknown",
        "",
    ));
    let foreign = Value::from(coding("http://snomed.info/sct", "temp-unknown", ""));
    let mut flat = FlatRecord::new();
    assert!(set_null_flavour("a/nf", &recognized, &mut flat));
    assert_eq!(flat.get_text("a/nf|code"), Some("253"));
    assert!(!set_null_flavour("b/nf", &foreign, &mut flat));
}
