// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Converts one resolved source value into flat-record entries according
//! to the declared target type. Exactly one typed arm runs per value; a
//! value whose shape does not fit the declared type is dropped with a
//! diagnostic. Rules without a declared type dispatch on the value shape
//! instead.

use crate::flat::{FlatRecord, FlatValue};
use crate::mapping::{TargetType, NULL_FLAVOUR, RECURRING};
use crate::value::{Coding, Value};

use data_encoding::BASE64;
use log::{error, warn};

pub const DATA_ABSENT_REASON_URL: &str =
    "http://hl7.org/fhir/StructureDefinition/data-absent-reason";

const DATA_ABSENT_REASON_SYSTEMS: [&str; 3] = [
    "http://terminology.hl7.org/CodeSystem/data-absent-reason",
    "http://hl7.org/fhir/data-absent-reason",
    "http://terminology.hl7.org/CodeSystem/dataabsentreason",
];

const NULL_FLAVOUR_TERMINOLOGY: &str = "openehr";

/// The four canonical openEHR null flavours.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NullFlavour {
    Unknown,
    NoInformation,
    Masked,
    NotApplicable,
}

impl NullFlavour {
    fn value(&self) -> &'static str {
        match self {
            NullFlavour::Unknown => "unknown",
            NullFlavour::NoInformation => "no information",
            NullFlavour::Masked => "masked",
            NullFlavour::NotApplicable => "not applicable",
        }
    }

    fn code(&self) -> &'static str {
        match self {
            NullFlavour::Unknown => "253",
            NullFlavour::NoInformation => "271",
            NullFlavour::Masked => "272",
            NullFlavour::NotApplicable => "273",
        }
    }
}

/// Writes the extracted value at the given target path.
pub fn set_value(
    openehr_path: &str,
    value: &Value,
    openehr_type: Option<TargetType>,
    flat: &mut FlatRecord,
) {
    if matches!(openehr_type, Some(TargetType::None) | Some(TargetType::Cluster)) {
        warn!("Adding nothing on path {openehr_path} as type is marked as NONE / CLUSTER");
        return;
    }

    // A leftover recurring placeholder means some recurring elements could
    // not be aligned; everything lands on the zeroth occurrence.
    let openehr_path = if openehr_path.contains(RECURRING) {
        openehr_path.replace(RECURRING, ":0")
    } else {
        openehr_path.to_string()
    };

    if openehr_path.contains(NULL_FLAVOUR) && set_null_flavour(&openehr_path, value, flat) {
        return;
    }

    if openehr_path.contains('|') {
        // A qualified path can only take a string, whatever the type says.
        if let Some(primitive) = value.primitive_string() {
            flat.insert_text(&openehr_path, &primitive);
        }
        return;
    }

    let handled = match openehr_type {
        None => {
            add_value_per_shape(value, &openehr_path, flat);
            true
        }
        Some(TargetType::Multimedia) => multimedia(&openehr_path, value, flat),
        Some(TargetType::Quantity) => quantity(&openehr_path, value, flat),
        Some(TargetType::Ordinal) => ordinal(&openehr_path, value, flat),
        Some(TargetType::Proportion) => proportion(&openehr_path, value, flat),
        Some(TargetType::Count) => count(&openehr_path, value, flat),
        Some(TargetType::DateTime) => date_time(&openehr_path, value, flat),
        Some(TargetType::Date) => date(&openehr_path, value, flat),
        Some(TargetType::Time) => time(&openehr_path, value, flat),
        Some(TargetType::CodedText) => coded_text(&openehr_path, value, flat),
        Some(TargetType::Identifier) => identifier(&openehr_path, value, flat),
        Some(TargetType::PartyIdentified) => party_identified(&openehr_path, value, flat),
        Some(TargetType::PartyProxy) => party_proxy(&openehr_path, value, flat),
        Some(TargetType::Boolean) => boolean(&openehr_path, value, flat),
        Some(TargetType::CodePhrase) => code_phrase(&openehr_path, value, flat),
        Some(TargetType::Text) => {
            add_value_per_shape(value, &openehr_path, flat);
            true
        }
        Some(TargetType::None) | Some(TargetType::Cluster) => unreachable!(),
    };
    if !handled {
        warn!(
            "Dropped value for path {openehr_path}: shape does not fit declared type {:?}",
            openehr_type
        );
    }
}

/// Writes the null-flavour triplet for a recognized data-absent-reason
/// value. Returns false when the value carries no recognized reason.
pub fn set_null_flavour(openehr_path: &str, reason: &Value, flat: &mut FlatRecord) -> bool {
    if openehr_path.is_empty() {
        return false;
    }
    let base = openehr_path.split('|').next().unwrap_or(openehr_path);
    let Some(flavour) = resolve_null_flavour(reason) else {
        return false;
    };
    flat.insert_text(&format!("{base}|value"), flavour.value());
    flat.insert_text(&format!("{base}|code"), flavour.code());
    flat.insert_text(&format!("{base}|terminology"), NULL_FLAVOUR_TERMINOLOGY);
    true
}

fn resolve_null_flavour(value: &Value) -> Option<NullFlavour> {
    match value {
        Value::Extension(extension) => {
            if extension.url != DATA_ABSENT_REASON_URL {
                return None;
            }
            extension.value.as_ref().and_then(resolve_null_flavour)
        }
        Value::Concept(concept) => concept
            .codings
            .iter()
            .find_map(null_flavour_from_coding)
            .or_else(|| map_data_absent_reason_code(concept.text.as_deref()?)),
        Value::Coding(coding) => null_flavour_from_coding(coding),
        Value::Code(code) => map_data_absent_reason_code(code),
        Value::String(s) => map_data_absent_reason_code(s),
        other => map_data_absent_reason_code(&other.primitive_string()?),
    }
}

fn null_flavour_from_coding(coding: &Coding) -> Option<NullFlavour> {
    if let Some(system) = coding.system.as_deref() {
        if !system.trim().is_empty() && !DATA_ABSENT_REASON_SYSTEMS.contains(&system) {
            return None;
        }
    }
    map_data_absent_reason_code(coding.code.as_deref()?)
}

fn map_data_absent_reason_code(code: &str) -> Option<NullFlavour> {
    if code.trim().is_empty() {
        return None;
    }
    match code.to_ascii_lowercase().as_str() {
        "unknown" | "asked-unknown" | "temp-unknown" | "not-asked" | "not-a-number"
        | "negative-infinity" | "positive-infinity" | "not-performed" | "other" => {
            Some(NullFlavour::Unknown)
        }
        "asked-declined" | "masked" | "not-permitted" => Some(NullFlavour::Masked),
        "not-applicable" | "unsupported" => Some(NullFlavour::NotApplicable),
        _ => Some(NullFlavour::NoInformation),
    }
}

fn multimedia(path: &str, value: &Value, flat: &mut FlatRecord) -> bool {
    let Value::Attachment(attachment) = value else {
        warn!("Target type is MULTIMEDIA but extracted value is not an attachment");
        return false;
    };
    let size = match attachment.size {
        Some(size) if size > 0 => size,
        _ => attachment.data.as_ref().map(|d| d.len() as u64).unwrap_or(0),
    };
    flat.insert_text(&format!("{path}|size"), &size.to_string());
    if let Some(content_type) = &attachment.content_type {
        flat.insert_text(&format!("{path}|mediatype"), content_type);
    }
    match &attachment.url {
        Some(url) if !url.is_empty() => flat.insert_text(&format!("{path}|url"), url),
        _ => {
            if let Some(data) = &attachment.data {
                flat.insert_text(&format!("{path}|data"), &BASE64.encode(data));
            }
        }
    }
    true
}

fn quantity(path: &str, value: &Value, flat: &mut FlatRecord) -> bool {
    match value {
        Value::Quantity(quantity) => {
            if let Some(magnitude) = quantity.value {
                flat.insert(&format!("{path}|magnitude"), FlatValue::Number(magnitude));
            }
            if let Some(unit) = &quantity.unit {
                flat.insert_text(&format!("{path}|unit"), unit);
            }
            true
        }
        Value::Ratio(ratio) => match &ratio.numerator {
            Some(numerator) => quantity(path, &Value::from(numerator.clone()), flat),
            None => true,
        },
        Value::String(s) => match s.parse::<f64>() {
            Ok(magnitude) => {
                flat.insert(&format!("{path}|magnitude"), FlatValue::Number(magnitude));
                true
            }
            Err(_) => {
                warn!("Target type is QUANTITY but string value {s:?} is not numeric");
                false
            }
        },
        _ => {
            warn!("Target type is QUANTITY but extracted value is not a quantity or ratio");
            false
        }
    }
}

fn ordinal(path: &str, value: &Value, flat: &mut FlatRecord) -> bool {
    let Value::Quantity(quantity) = value else {
        warn!("Target type is ORDINAL but extracted value is not a quantity");
        return false;
    };
    if let Some(ordinal) = quantity.value {
        flat.insert_text(&format!("{path}|ordinal"), &ordinal.to_string());
    }
    if let Some(unit) = &quantity.unit {
        flat.insert_text(&format!("{path}|value"), unit);
    }
    if let Some(code) = &quantity.code {
        flat.insert_text(&format!("{path}|code"), code);
    }
    true
}

fn proportion(path: &str, value: &Value, flat: &mut FlatRecord) -> bool {
    let Value::Quantity(quantity) = value else {
        warn!("Target type is PROPORTION but extracted value is not a quantity");
        return false;
    };
    if quantity.code.as_deref() == Some("%") {
        flat.insert(&format!("{path}|denominator"), FlatValue::Number(100.0));
    }
    if let Some(numerator) = quantity.value {
        flat.insert(&format!("{path}|numerator"), FlatValue::Number(numerator));
    }
    flat.insert_text(&format!("{path}|type"), "2");
    true
}

fn count(path: &str, value: &Value, flat: &mut FlatRecord) -> bool {
    match value {
        Value::Quantity(quantity) => {
            if let Some(magnitude) = quantity.value {
                flat.insert(path, FlatValue::Integer(magnitude as i64));
            }
            true
        }
        Value::Integer(i) => {
            flat.insert(path, FlatValue::Integer(*i));
            true
        }
        _ => {
            warn!("Target type is COUNT but extracted value is not a quantity or integer");
            false
        }
    }
}

fn date_time(path: &str, value: &Value, flat: &mut FlatRecord) -> bool {
    match value {
        Value::DateTime(dt) => {
            flat.insert_text(path, &dt.naive_local().format("%Y-%m-%dT%H:%M:%S").to_string());
            true
        }
        Value::Date(d) => {
            flat.insert_text(path, &d.format("%Y-%m-%d").to_string());
            true
        }
        Value::Time(t) => {
            flat.insert_text(path, &t.format("%H:%M:%S").to_string());
            true
        }
        _ => {
            warn!("Target type is DATETIME but extracted value is not a temporal value");
            false
        }
    }
}

fn date(path: &str, value: &Value, flat: &mut FlatRecord) -> bool {
    match value {
        Value::DateTime(dt) => {
            flat.insert_text(path, &dt.naive_local().format("%Y-%m-%d").to_string());
            true
        }
        Value::Date(d) => {
            flat.insert_text(path, &d.format("%Y-%m-%d").to_string());
            true
        }
        _ => {
            warn!("Target type is DATE but extracted value is not a date");
            false
        }
    }
}

fn time(path: &str, value: &Value, flat: &mut FlatRecord) -> bool {
    match value {
        Value::DateTime(dt) => {
            flat.insert_text(path, &dt.naive_local().format("%H:%M:%S").to_string());
            true
        }
        Value::Time(t) => {
            flat.insert_text(path, &t.format("%H:%M:%S").to_string());
            true
        }
        _ => {
            warn!("Target type is TIME but extracted value is not a time");
            false
        }
    }
}

fn coded_text(path: &str, value: &Value, flat: &mut FlatRecord) -> bool {
    match value {
        Value::Concept(concept) => {
            if let Some(primary) = concept.codings.first() {
                if let Some(code) = &primary.code {
                    flat.insert_text(&format!("{path}|code"), code);
                }
                if let Some(system) = &primary.system {
                    flat.insert_text(&format!("{path}|terminology"), system);
                }
                if let Some(display) = &primary.display {
                    flat.insert_text(&format!("{path}|value"), display);
                }
                add_additional_codings_as_mappings(path, &concept.codings, flat);
            }
            // The concept's own text wins over the primary display.
            if let Some(text) = &concept.text {
                flat.insert_text(&format!("{path}|value"), text);
            }
            true
        }
        Value::Coding(coding) => {
            if let Some(code) = &coding.code {
                flat.insert_text(&format!("{path}|code"), code);
            }
            if let Some(system) = &coding.system {
                flat.insert_text(&format!("{path}|terminology"), system);
            }
            if let Some(display) = &coding.display {
                flat.insert_text(&format!("{path}|value"), display);
            }
            true
        }
        _ => {
            warn!("Target type is CODEABLECONCEPT but extracted value is not a concept or coding");
            false
        }
    }
}

/// Codings beyond the first become secondary term mappings of the coded
/// text, one `_mapping` group per coding.
fn add_additional_codings_as_mappings(path: &str, codings: &[Coding], flat: &mut FlatRecord) {
    for (i, coding) in codings.iter().skip(1).enumerate() {
        let mapping_path = format!("{path}/_mapping:{i}");
        flat.insert_text(&format!("{mapping_path}/match"), "=");
        if let Some(display) = &coding.display {
            flat.insert_text(&format!("{mapping_path}/target|preferred_term"), display);
        }
        if let Some(code) = &coding.code {
            flat.insert_text(&format!("{mapping_path}/target|code"), code);
        }
        if let Some(system) = &coding.system {
            flat.insert_text(&format!("{mapping_path}/target|terminology"), system);
        }
    }
}

fn identifier(path: &str, value: &Value, flat: &mut FlatRecord) -> bool {
    match value {
        Value::Identifier(identifier) => {
            if let Some(id) = &identifier.value {
                flat.insert_text(&format!("{path}|id"), id);
            }
            true
        }
        Value::String(s) | Value::Code(s) => {
            flat.insert_text(&format!("{path}|id"), s);
            true
        }
        _ => {
            warn!("Target type is IDENTIFIER but extracted value is not an identifier");
            false
        }
    }
}

fn party_identified(path: &str, value: &Value, flat: &mut FlatRecord) -> bool {
    match value {
        Value::String(name) => {
            flat.insert_text(&format!("{path}|name"), name);
            true
        }
        Value::Identifier(identifier) => {
            if let Some(id) = &identifier.value {
                flat.insert_text(&format!("{path}|id"), id);
            }
            if let Some(system) = &identifier.system {
                flat.insert_text(&format!("{path}|assigner"), system);
            }
            if let Some(kind) = &identifier.kind {
                if let Some(text) = &kind.text {
                    flat.insert_text(&format!("{path}|type"), text);
                }
                // A coding code on the identifier type overrides its text.
                if let Some(code) = kind.codings.first().and_then(|c| c.code.as_deref()) {
                    flat.insert_text(&format!("{path}|type"), code);
                }
            }
            true
        }
        _ => {
            warn!("Target type is PARTY_IDENTIFIED but extracted value is not a name or identifier");
            false
        }
    }
}

fn party_proxy(path: &str, value: &Value, flat: &mut FlatRecord) -> bool {
    match value {
        Value::String(name) => {
            flat.insert_text(&format!("{path}|name"), name);
            true
        }
        _ => {
            warn!("Target type is PARTY_PROXY but extracted value is not a name");
            false
        }
    }
}

fn boolean(path: &str, value: &Value, flat: &mut FlatRecord) -> bool {
    match value {
        Value::Boolean(b) => {
            flat.insert(path, FlatValue::Boolean(*b));
            true
        }
        _ => {
            warn!("Target type is BOOL but extracted value is not a boolean");
            false
        }
    }
}

fn code_phrase(path: &str, value: &Value, flat: &mut FlatRecord) -> bool {
    match value {
        Value::Coding(coding) => {
            if let Some(code) = &coding.code {
                flat.insert_text(&format!("{path}|code"), code);
                flat.insert_text(&format!("{path}|value"), code);
            }
            if let Some(system) = &coding.system {
                flat.insert_text(&format!("{path}|terminology"), system);
            }
            true
        }
        Value::Extension(extension) => match &extension.value {
            Some(inner) => code_phrase(path, inner, flat),
            None => true,
        },
        Value::Concept(concept) => match concept.codings.first() {
            Some(first) => code_phrase(path, &Value::from(first.clone()), flat),
            None => true,
        },
        Value::Code(code) => {
            flat.insert_text(&format!("{path}|code"), code);
            flat.insert_text(&format!("{path}|value"), code);
            true
        }
        _ => {
            warn!(
                "Target type is CODEPHRASE but extracted value is not a coding, extension, concept or code"
            );
            false
        }
    }
}

/// Dispatch for rules without a declared target type: the value shape
/// decides the rendering.
fn add_value_per_shape(value: &Value, openehr_path: &str, flat: &mut FlatRecord) {
    match value {
        Value::Quantity(quantity) => {
            if let Some(magnitude) = quantity.value {
                flat.insert_text(openehr_path, &magnitude.to_string());
            }
        }
        Value::Coding(_) => {
            code_phrase(openehr_path, value, flat);
        }
        Value::Concept(concept) => {
            if let Some(first) = concept.codings.first() {
                code_phrase(openehr_path, &Value::from(first.clone()), flat);
            }
        }
        Value::Extension(extension) => {
            if let Some(inner) = &extension.value {
                if inner.primitive_string().is_some() {
                    add_value_per_shape(inner, openehr_path, flat);
                }
            }
        }
        other => match other.primitive_string() {
            Some(primitive) => flat.insert_text(openehr_path, &primitive),
            None => error!("Unsupported source value for path {openehr_path}: {other}"),
        },
    }
}
