// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Rewrites raw mapping-configuration subtrees so that relative path tokens
//! are resolved into absolute paths before compilation. Nested mappings
//! inherit their parent's resolved source and target paths; slot mappers
//! additionally inherit the parent's resource selector.
//!
//! Normalization always operates on cloned rules. The registry hands out
//! shared configuration, so a mapper is never mutated in place.

use crate::mapping::{
    FhirConfig, MappingRule, ModelMapper, RuleCondition, ARCHETYPE, COMPOSITION, FHIR_RESOURCE,
    FHIR_ROOT, OPENEHR_ROOT, REFERENCE_TOKEN, RESOLVE,
};
use crate::paths;

/// Prepares the sub-rules of a cross-reference mapping: each child source
/// path is re-anchored below the parent's path with a dereference step, and
/// each child target path is resolved against the position of the
/// `$reference` token in the parent's target path.
pub fn prepare_referenced_mappings(
    parent_fhir_path: &str,
    openehr_path: &str,
    mappings: &mut [MappingRule],
    archetype_root: &str,
) {
    for mapping in mappings.iter_mut() {
        mapping.with.fhir = Some(match mapping.with.fhir.take() {
            Some(child) if !child.is_empty() => format!("{parent_fhir_path}.{RESOLVE}.{child}"),
            _ => format!("{parent_fhir_path}.{RESOLVE}"),
        });

        if openehr_path == REFERENCE_TOKEN || mapping.with.openehr.is_none() {
            continue;
        }
        let openehr = mapping.with.openehr.take().unwrap_or_default();
        if openehr.starts_with(ARCHETYPE) {
            mapping.with.openehr = Some(paths::prepare_openehr_syntax(&openehr, archetype_root));
        } else if openehr_path.starts_with(REFERENCE_TOKEN) {
            let replaced = openehr.replace(ARCHETYPE, "");
            let delimiter = if replaced.is_empty() || replaced.starts_with('.') {
                ""
            } else {
                "."
            };
            mapping.with.openehr = Some(format!(
                "{}{delimiter}{replaced}",
                openehr_path
                    .replace(&format!("{REFERENCE_TOKEN}/"), "")
                    .replace(&format!("{REFERENCE_TOKEN}."), "")
                    .replace('/', ".")
            ));
        } else if openehr_path.ends_with(REFERENCE_TOKEN) {
            let following = openehr.replace(ARCHETYPE, "");
            let suffix = if following.is_empty() {
                String::new()
            } else {
                format!("/{following}")
            };
            mapping.with.openehr = Some(format!(
                "{}{suffix}",
                openehr_path
                    .replace(&format!("/{REFERENCE_TOKEN}"), "")
                    .replace(&format!(".{REFERENCE_TOKEN}"), "")
            ));
        } else if !openehr.starts_with(COMPOSITION) {
            let replaced_parent = openehr_path
                .replace(&format!("{REFERENCE_TOKEN}/"), "/")
                .replace(&format!("/{REFERENCE_TOKEN}"), "/")
                .replace(&format!(".{REFERENCE_TOKEN}"), "/")
                .replace(&format!("{REFERENCE_TOKEN}."), "/");
            let delim = if replaced_parent.ends_with('/') { "" } else { "/" };
            mapping.with.openehr = Some(format!(
                "{replaced_parent}{delim}{}",
                openehr.replace(ARCHETYPE, "")
            ));
        } else {
            mapping.with.openehr = Some(openehr);
        }
    }
}

/// Re-anchors the direct children of a `followedBy` clause below the
/// parent's resolved target path. A child prefixed with `$archetype` or
/// `$composition` declares an absolute intent and is substituted rather
/// than prefixed.
pub fn rebase_followed_by(mappings: &mut [MappingRule], parent_openehr: &str, archetype_root: &str) {
    for mapping in mappings.iter_mut() {
        let Some(openehr) = mapping.with.openehr.clone() else {
            continue;
        };
        if !openehr.starts_with(ARCHETYPE) && !openehr.starts_with(COMPOSITION) {
            let delimiter = if openehr.starts_with('|') { "" } else { "/" };
            mapping.with.openehr = Some(format!(
                "{}{delimiter}{}",
                parent_openehr.replace(&format!("{REFERENCE_TOKEN}/"), ""),
                openehr
                    .replace(&format!("{ARCHETYPE}."), "")
                    .replace(ARCHETYPE, "")
            ));
        } else if openehr == OPENEHR_ROOT {
            mapping.with.openehr = Some(parent_openehr.to_string());
        } else if openehr == ARCHETYPE {
            mapping.with.openehr = Some(archetype_root.to_string());
        } else {
            // An explicit $archetype prefix pins the child to the
            // archetype root rather than the parent path.
            mapping.with.openehr = Some(
                openehr
                    .replace(&format!("{REFERENCE_TOKEN}."), "")
                    .replace(&format!("{ARCHETYPE}."), &format!("{archetype_root}."))
                    .replace(ARCHETYPE, archetype_root),
            );
        }
    }
}

/// Prepares a slot-archetype mapper for inlining at the point of
/// reference: the slot inherits the parent's resource selector, its rules
/// are re-anchored below the parent's resolved paths, and a rule without a
/// target path of its own defaults to the parent's.
///
/// Source paths stay relative here. Slot rules become child helpers that
/// evaluate against the instance their parent already selected, so the
/// parent prefix must not reappear in them.
pub fn prepare_forwarding_slot_mapper(
    slot_mapper: &mut ModelMapper,
    parent_mapper: &ModelMapper,
    openehr_path: &str,
) {
    slot_mapper.fhir_config = FhirConfig {
        resource: parent_mapper.fhir_config.resource.clone(),
        condition: parent_mapper.fhir_config.condition.clone(),
        multiple: false,
    };

    if slot_mapper.mappings.is_empty() {
        return;
    }

    fix_fhir_forwarding_paths(&mut slot_mapper.mappings);
    fix_openehr_forwarding_paths(&mut slot_mapper.mappings, openehr_path);
    fix_forwarding_conditions(&mut slot_mapper.mappings);

    for mapping in slot_mapper.mappings.iter_mut() {
        if mapping.with.openehr.is_none() {
            mapping.with.openehr = Some(openehr_path.to_string());
        }
    }
}

fn fix_fhir_forwarding_paths(mappings: &mut [MappingRule]) {
    for mapping in mappings.iter_mut() {
        let Some(fhir) = mapping.with.fhir.clone() else {
            continue;
        };
        for token in [FHIR_ROOT, FHIR_RESOURCE] {
            if fhir.starts_with(token) {
                let replaced = fhir.replace(token, "");
                let replaced = replaced.strip_prefix('.').unwrap_or(&replaced);
                mapping.with.fhir = Some(replaced.to_string());
            }
        }
    }
}

fn fix_openehr_forwarding_paths(mappings: &mut [MappingRule], openehr_path: &str) {
    for mapping in mappings.iter_mut() {
        let Some(openehr) = mapping.with.openehr.clone() else {
            fix_openehr_forwarding_condition(mapping.openehr_condition.as_mut(), openehr_path);
            continue;
        };
        if openehr == ARCHETYPE {
            mapping.with.openehr = Some(openehr_path.to_string());
        } else if openehr.starts_with(ARCHETYPE) {
            mapping.with.openehr = Some(openehr.replace(ARCHETYPE, openehr_path));
        } else if openehr.starts_with(COMPOSITION) {
            let composition_root = openehr_path.split('/').next().unwrap_or(openehr_path);
            mapping.with.openehr = Some(openehr.replace(COMPOSITION, composition_root));
        } else if openehr.starts_with(REFERENCE_TOKEN) {
            mapping.with.openehr = Some(format!("{openehr}/{openehr_path}"));
        } else {
            let suffix = if openehr.is_empty() {
                String::new()
            } else {
                format!("/{openehr}")
            };
            mapping.with.openehr = Some(format!("{openehr_path}{suffix}"));
        }

        fix_openehr_forwarding_condition(mapping.openehr_condition.as_mut(), openehr_path);

        if let Some(reference) = mapping.reference.as_mut() {
            fix_openehr_forwarding_paths(&mut reference.mappings, openehr_path);
        }
    }
}

fn fix_openehr_forwarding_condition(condition: Option<&mut RuleCondition>, openehr_path: &str) {
    let Some(condition) = condition else {
        return;
    };
    let root = condition.target_root.clone();
    if root == ARCHETYPE {
        condition.target_root = openehr_path.to_string();
    } else if root.starts_with(ARCHETYPE) {
        condition.target_root = root.replace(ARCHETYPE, openehr_path);
    } else if root.starts_with(COMPOSITION) {
        let composition_root = openehr_path.split('/').next().unwrap_or(openehr_path);
        condition.target_root = root.replace(COMPOSITION, composition_root);
    } else {
        let suffix = if root.is_empty() {
            String::new()
        } else {
            format!("/{root}")
        };
        condition.target_root = format!("{openehr_path}{suffix}");
    }
}

fn fix_forwarding_conditions(mappings: &mut [MappingRule]) {
    for mapping in mappings.iter_mut() {
        let Some(condition) = mapping.fhir_condition.as_mut() else {
            continue;
        };
        let target_root = condition.target_root.clone();
        for token in [FHIR_ROOT, FHIR_RESOURCE] {
            if target_root.starts_with(token) {
                let replaced = target_root.replace(token, "");
                let replaced = replaced.strip_prefix('.').unwrap_or(&replaced);
                condition.target_root = replaced.to_string();
            }
        }
    }
}
