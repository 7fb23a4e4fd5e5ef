// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Walks compiled helper trees over a source bundle and fills a flat
//! record. Helpers of one archetype are grouped and their candidate
//! instances selected once per distinct limiting criteria; every candidate
//! is then pushed through each helper of the group, with occurrence
//! indices bound along the way.

use crate::compile::Helper;
use crate::flat::FlatRecord;
use crate::mapping::{TargetType, FHIR_ROOT, NULL_FLAVOUR, RECURRING, RESOLVE};
use crate::value::{Reference, Value};
use crate::{paths, populate};

use anyhow::Result;
use log::{debug, info, warn};

/// Evaluates source-path expressions against source values. Implemented by
/// the caller over whatever path engine backs the source model.
pub trait PathEvaluator {
    /// All values the expression selects on the given instance.
    fn evaluate(&self, instance: &Value, path: &str) -> Result<Vec<Value>>;

    /// The entity a cross-reference points at, when the evaluator can see
    /// it. The default cannot.
    fn resolve_reference(&self, _reference: &Reference) -> Option<Value> {
        None
    }
}

/// Externally registered custom conversion. A rule carrying a conversion
/// code delegates its value write to the hook instead of the populator.
pub trait ConversionHook {
    /// Returns whether the hook handled the write.
    fn apply(
        &self,
        code: &str,
        path: &str,
        value: &Value,
        target_type: Option<TargetType>,
        flat: &mut FlatRecord,
    ) -> bool;
}

pub struct Interpreter<'a> {
    evaluator: &'a dyn PathEvaluator,
    conversion: Option<&'a dyn ConversionHook>,
}

impl<'a> Interpreter<'a> {
    pub fn new(evaluator: &'a dyn PathEvaluator) -> Interpreter<'a> {
        Interpreter {
            evaluator,
            conversion: None,
        }
    }

    pub fn with_conversion_hook(mut self, hook: &'a dyn ConversionHook) -> Interpreter<'a> {
        self.conversion = Some(hook);
        self
    }

    /// Runs every helper against the source. A bundle source goes through
    /// candidate extraction; a bare instance is evaluated directly, its
    /// results spread across occurrence indices.
    pub fn resolve_fhir_paths(
        &self,
        helpers: &[Helper],
        source: &Value,
        flat: &mut FlatRecord,
    ) -> Result<()> {
        let mut groups: Vec<(&str, Vec<&Helper>)> = vec![];
        for helper in helpers {
            match groups.iter_mut().find(|(a, _)| *a == helper.archetype) {
                Some((_, group)) => group.push(helper),
                None => groups.push((helper.archetype.as_str(), vec![helper])),
            }
        }

        let is_bundle = source.kind() == Some("Bundle");
        for (_, group) in groups {
            // Distinct by limiting criteria to avoid duplicated mappings.
            let mut seen: Vec<&str> = vec![];
            for helper in &group {
                let criteria = helper.limiting_criteria.as_str();
                if seen.contains(&criteria) {
                    continue;
                }
                seen.push(criteria);

                if is_bundle {
                    let subset: Vec<&Helper> = group
                        .iter()
                        .filter(|h| h.limiting_criteria == criteria)
                        .copied()
                        .collect();
                    self.handle_bundle_extraction(source, criteria, &subset, flat)?;
                } else {
                    for helper in &group {
                        if helper.type_guard_contradicted() {
                            continue;
                        }
                        let results = self.evaluate_source(source, &helper.fhir_path)?;
                        handle_occurrence_results(
                            &helper.openehr_path,
                            helper.openehr_type,
                            &results,
                            flat,
                        )?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Selects the candidate instances for one helper group and maps each
    /// of them. The occurrence index advances only when a candidate
    /// contributed at least one entry; helpers under a context-like path
    /// never advance it.
    fn handle_bundle_extraction(
        &self,
        bundle: &Value,
        limiting_criteria: &str,
        helpers: &[&Helper],
        flat: &mut FlatRecord,
    ) -> Result<()> {
        let candidates = self.evaluator.evaluate(bundle, limiting_criteria)?;
        if candidates.is_empty() {
            warn!("No relevant resources found for {limiting_criteria}");
            return Ok(());
        }
        info!(
            "Evaluation of {limiting_criteria} returned {} entries that will be used for mapping.",
            candidates.len()
        );

        let mut main_multiple: Option<String> = None;
        let mut occurrence = 0usize;
        for candidate in &candidates {
            let mut something_added = false;
            for helper in helpers {
                if helper.type_guard_contradicted() {
                    continue;
                }
                let mut bound = (*helper).clone();

                if helper.multiple
                    && main_multiple
                        .as_deref()
                        .is_none_or(|prefix| helper.openehr_path.starts_with(prefix))
                {
                    main_multiple = if ignore_multiple_flag(&helper.openehr_path) {
                        None
                    } else {
                        helper
                            .openehr_path
                            .split(RECURRING)
                            .next()
                            .map(str::to_string)
                    };
                    bound.openehr_path =
                        paths::bind_first_recurring(&helper.openehr_path, occurrence);
                    let rebound = bound.openehr_path.clone();
                    fix_all_children_recurring(&mut bound, &rebound);
                }

                let before = flat.len();
                self.add_data_points(&bound, flat, candidate)?;
                something_added = something_added || flat.len() > before;
            }
            if something_added {
                occurrence += 1;
            } else {
                warn!(
                    "Even though an instance matched {limiting_criteria}, nothing was added to the record from it."
                );
            }
        }
        Ok(())
    }

    /// Evaluates one helper against one instance and writes its results,
    /// then recurses into child helpers against each result. Returns false
    /// only when the source path yielded nothing at all.
    fn add_data_points(
        &self,
        helper: &Helper,
        flat: &mut FlatRecord,
        instance: &Value,
    ) -> Result<bool> {
        let fhir_path = helper.fhir_path.as_str();
        let mut results = self.evaluate_source(instance, fhir_path)?;

        if results.is_empty() && fhir_path.ends_with(RESOLVE) {
            let reference_path = fhir_path.replace(&format!(".{RESOLVE}"), "");
            for value in self.evaluate_source(instance, &reference_path)? {
                if let Value::Reference(reference) = &value {
                    if let Some(resolved) = self.evaluator.resolve_reference(reference) {
                        results.push(resolved);
                    }
                }
            }
        }

        if results.is_empty() {
            if self.handle_missing_value(helper, flat, instance) {
                return Ok(true);
            }
            warn!("No results found for FHIRPath {fhir_path}");
            return Ok(false);
        }

        for (index, result) in results.iter().enumerate() {
            let no_more_recurring = !paths::has_recurring(&helper.openehr_path);
            let the_path = if no_more_recurring {
                helper.openehr_path.clone()
            } else {
                paths::replace_last(&helper.openehr_path, RECURRING, &format!(":{index}"))
            };
            debug!("Setting value taken with fhirPath {fhir_path} to {the_path}");

            if let Some(literal) = helper.hardcoding_value.as_deref().filter(|v| !v.is_empty()) {
                flat.insert_text(&the_path, literal);
            } else if let Some(code) = helper.mapping_code.as_deref() {
                match self.conversion {
                    Some(hook) => {
                        if !hook.apply(code, &the_path, result, helper.openehr_type, flat) {
                            warn!("Conversion failed for mapping code {code}");
                        }
                    }
                    None => warn!("No conversion registered for mapping code {code}"),
                }
            } else {
                populate::set_value(&the_path, result, helper.openehr_type, flat);
            }

            let mut evaluated = true;
            for child in &helper.children {
                if child.type_guard_contradicted() {
                    continue;
                }
                let mut bound = child.clone();
                if bound.openehr_path.starts_with(&helper.openehr_path) {
                    let new_one = bound.openehr_path.replace(&helper.openehr_path, &the_path);
                    fix_all_children_recurring(&mut bound, &new_one);
                }
                evaluated = self.add_data_points(&bound, flat, result)?;
            }

            // The proper instance was taken and the path has no remaining
            // recurring slot; further results would overwrite it.
            if evaluated && no_more_recurring {
                break;
            }
        }
        Ok(true)
    }

    fn evaluate_source(&self, instance: &Value, fhir_path: &str) -> Result<Vec<Value>> {
        if fhir_path.is_empty() || fhir_path == FHIR_ROOT {
            debug!("Taking the instance itself as the source path is {fhir_path:?}");
            return Ok(vec![instance.clone()]);
        }
        let trimmed = fhir_path.strip_prefix('.').unwrap_or(fhir_path);
        self.evaluator
            .evaluate(instance, &paths::fix_fhir_path_casting(trimmed))
    }

    /// A missing source value may still carry an absence reason, either as
    /// the data-absent-reason extension or as a dedicated attribute. When
    /// one is found, the target element's null flavour is written instead.
    fn handle_missing_value(
        &self,
        helper: &Helper,
        flat: &mut FlatRecord,
        instance: &Value,
    ) -> bool {
        let Some(null_path) = derive_null_flavour_path(&helper.openehr_path) else {
            return false;
        };
        for reason in self.data_absent_reasons(instance) {
            if populate::set_null_flavour(&null_path, &reason, flat) {
                return true;
            }
        }
        false
    }

    fn data_absent_reasons(&self, instance: &Value) -> Vec<Value> {
        let extension_path =
            format!("extension('{}').value", populate::DATA_ABSENT_REASON_URL);
        match self.evaluator.evaluate(instance, &extension_path) {
            Ok(values) if !values.is_empty() => return values,
            Ok(_) => {}
            Err(e) => debug!("Unable to evaluate data absent reason extension: {e}"),
        }
        match self.evaluator.evaluate(instance, "dataAbsentReason") {
            Ok(values) => values,
            Err(e) => {
                debug!("Unable to evaluate dataAbsentReason attribute: {e}");
                vec![]
            }
        }
    }
}

/// Writes one helper's direct results for a single, already-selected
/// instance: one result binds every recurring slot to the zeroth
/// occurrence, several results spread across the last slot.
pub fn handle_occurrence_results(
    openehr_path: &str,
    openehr_type: Option<TargetType>,
    results: &[Value],
    flat: &mut FlatRecord,
) -> Result<()> {
    let Some(first) = results.first() else {
        return Ok(());
    };
    let zeroth = paths::bind_all_recurring(openehr_path, 0);
    if results.len() == 1 {
        populate::set_value(&zeroth, first, openehr_type, flat);
    } else if !paths::has_recurring(openehr_path) {
        warn!(
            "Found more than one result, yet there's no more recurring options! Only adding the first result."
        );
        populate::set_value(&zeroth, first, openehr_type, flat);
    } else {
        for (i, result) in results.iter().enumerate() {
            let path = paths::replace_last(&zeroth, ":0", &format!(":{i}"));
            populate::set_value(&path, result, openehr_type, flat);
        }
    }
    Ok(())
}

/// Bakes a bound occurrence index into a helper subtree wherever a child
/// path still carries the recurring placeholder the parent just bound.
fn fix_all_children_recurring(helper: &mut Helper, new_one: &str) {
    if paths::child_has_parent_recurring(&helper.openehr_path, new_one) {
        helper.openehr_path = paths::replace_pattern(&helper.openehr_path, new_one);
    }
    for child in helper.children.iter_mut() {
        fix_all_children_recurring(child, new_one);
    }
}

/// Occurrence counting is tied to the entity being mapped; paths under the
/// composition context or participation metadata recur independently.
fn ignore_multiple_flag(openehr_path: &str) -> bool {
    openehr_path.contains("context")
        || openehr_path.contains("other_participations")
        || openehr_path.contains("provider")
}

/// The null-flavour element path for a target path: qualifier dropped,
/// recurring slots bound to the zeroth occurrence.
fn derive_null_flavour_path(openehr_path: &str) -> Option<String> {
    if openehr_path.is_empty() {
        return None;
    }
    let base = openehr_path.split('|').next().unwrap_or(openehr_path);
    let base = base.replace(RECURRING, ":0");
    if base.ends_with(NULL_FLAVOUR) {
        Some(base)
    } else if base.ends_with('/') {
        Some(format!("{base}{NULL_FLAVOUR}"))
    } else {
        Some(format!("{base}/{NULL_FLAVOUR}"))
    }
}
