// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::flat::FlatRecord;
use crate::mapping::{
    ConditionOperator, RuleCondition, ARCHETYPE, COMPOSITION, FHIR_RESOURCE, FHIR_ROOT,
    OPENEHR_ROOT, RECURRING, REFERENCE_TOKEN, RESOLVE,
};

use std::collections::BTreeMap;

use anyhow::Result;
use lazy_static::lazy_static;
use regex::Regex;

pub const WHERE_CLAUSE: &str = ".where(";
pub const FALSE_CLAUSE: &str = "=false";

lazy_static! {
    static ref INDEX: Regex = Regex::new(r":(\d+)").unwrap();
    static ref BRACKET_CONTENT: Regex = Regex::new(r"\[(.*?)\]").unwrap();
    static ref TYPE_ANNOTATION: Regex = Regex::new(r"\[TYPE:[^\]]+\]").unwrap();
    static ref PART_WITH_INDEX: Regex = Regex::new(r"^.*:\d+$").unwrap();
    static ref PART_WITH_BRACKET: Regex = Regex::new(r"^.*\[\d*\]$").unwrap();
}

/// Converts a simplified flat path into a regular expression matching the
/// corresponding entries of a flat record, tolerating interposed occurrence
/// indices and an optional attribute-qualifier suffix.
pub fn simplified_flat_regex(simplified: &str) -> Result<Regex> {
    let parts: Vec<&str> = simplified.split('/').collect();
    let last = parts[parts.len() - 1];
    let pattern = if let Some((last_base, qualifier)) = last.split_once('|') {
        let head = parts[..parts.len() - 1]
            .iter()
            .map(|p| regex::escape(p))
            .collect::<Vec<_>>()
            .join(r"(:\d+)?/");
        format!(
            r"{head}(:\d+)?/{}(:\d+)?\|{}",
            regex::escape(last_base),
            regex::escape(qualifier)
        )
    } else {
        let joined = parts
            .iter()
            .map(|p| regex::escape(p))
            .collect::<Vec<_>>()
            .join(r"(:\d+)?/");
        format!(r"{joined}(:\d+)?(\|.*)?")
    };
    Ok(Regex::new(&pattern)?)
}

/// All flat-record fragments matching the given pattern. A candidate whose
/// remainder after the match begins with a digit is a different element
/// that merely shares a prefix (`klinischer_status2` vs `klinischer_status`)
/// and is rejected.
pub fn matching_entries(pattern: &Regex, flat: &FlatRecord) -> Vec<String> {
    let mut found = vec![];
    for (key, _) in flat.iter() {
        for m in pattern.find_iter(key) {
            if !is_prefix_of_other(key, m.as_str()) {
                found.push(m.as_str().to_string());
            }
        }
    }
    found
}

fn is_prefix_of_other(looking_for: &str, found: &str) -> bool {
    let diff = looking_for.replace(found, "");
    !diff.is_empty() && diff.chars().next().is_some_and(|c| c.is_ascii_digit())
}

/// Groups matched flat paths by their base path so that qualifier siblings
/// (`weight|unit`, `weight|magnitude`) come back as one object.
pub fn join_single_objects(entries: &[String]) -> BTreeMap<String, Vec<String>> {
    let mut joined: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for entry in entries {
        match entry.split_once('|') {
            None => {
                joined.insert(entry.clone(), vec![entry.clone()]);
            }
            Some((root, _)) => {
                joined.entry(root.to_string()).or_default().push(entry.clone());
            }
        }
    }
    joined
}

/// Rewrites a simplified target path into its absolute form: bracketed
/// archetype names keep their slashes protected, `$openehrRoot` is removed
/// and `$archetype` resolves to the archetype root path.
pub fn prepare_openehr_syntax(openehr: &str, archetype_root: &str) -> String {
    let protected = BRACKET_CONTENT.replace_all(openehr, |caps: &regex::Captures| {
        format!("[{}]", caps[1].replace('/', "*"))
    });
    protected
        .replace(&format!("/{OPENEHR_ROOT}"), "")
        .replace(OPENEHR_ROOT, "")
        .replace(ARCHETYPE, archetype_root)
}

/// Archetype names may carry escaped dots in simplified paths; they become
/// plain dots once the path is absolute.
pub fn unescape_dots(path: &str) -> String {
    path.replace("\\.", ".")
}

pub fn replace_last(string: &str, pattern: &str, replacement: &str) -> String {
    match string.rfind(pattern) {
        Some(start) => {
            let mut out = String::with_capacity(string.len());
            out.push_str(&string[..start]);
            out.push_str(replacement);
            out.push_str(&string[start + pattern.len()..]);
            out
        }
        None => string.to_string(),
    }
}

pub fn has_recurring(path: &str) -> bool {
    path.contains(RECURRING)
}

/// Binds the first recurring placeholder to a concrete occurrence index.
pub fn bind_first_recurring(path: &str, index: usize) -> String {
    path.replacen(RECURRING, &format!(":{index}"), 1)
}

pub fn bind_last_recurring(path: &str, index: usize) -> String {
    replace_last(path, RECURRING, &format!(":{index}"))
}

pub fn bind_all_recurring(path: &str, index: usize) -> String {
    path.replace(RECURRING, &format!(":{index}"))
}

/// Replaces the first concrete `:N` index with a new one.
pub fn rebind_first_index(path: &str, index: usize) -> String {
    INDEX.replacen(path, 1, format!(":{index}")).to_string()
}

pub fn first_index(path: &str) -> Option<usize> {
    all_indexes(path).first().copied()
}

pub fn last_index(path: &str) -> Option<usize> {
    all_indexes(path).last().copied()
}

pub fn all_indexes(path: &str) -> Vec<usize> {
    INDEX
        .captures_iter(path)
        .filter_map(|c| c[1].parse().ok())
        .collect()
}

/// Strips `[TYPE:...]` annotations from a target path.
pub fn remove_type_annotations(path: &str) -> String {
    TYPE_ANNOTATION.replace_all(path, "").to_string()
}

/// The last `[TYPE:...]` annotation in a target path, without its brackets.
pub fn last_type_annotation(path: &str) -> Option<String> {
    TYPE_ANNOTATION
        .find_iter(path)
        .last()
        .map(|m| m.as_str().trim_start_matches("[TYPE:").trim_end_matches(']').to_string())
}

/// Whether a target path already ends in a terminal reference-model
/// attribute, in which case the final segment becomes a `|` qualifier.
pub fn ends_with_openehr_type(path: &str) -> Option<&'static str> {
    const TERMINAL_ATTRIBUTES: [&str; 6] = [
        "terminology_id/value",
        "defining_code/code_string",
        "terminology_id",
        "defining_code",
        "code_string",
        "/value",
    ];
    TERMINAL_ATTRIBUTES
        .iter()
        .find(|suffix| path.ends_with(*suffix))
        .copied()
}

/// Resolves the composition and archetype tokens left in a target path
/// after nested rewrites. A `$composition/content`-prefixed path already
/// carries the full content tree and only needs the template root.
pub fn fix_openehr_path(openehr_path: &str, archetype_root: &str) -> String {
    if openehr_path.starts_with(&format!("{COMPOSITION}/content")) {
        let template_root = archetype_root.split('/').next().unwrap_or(archetype_root);
        openehr_path.replace(COMPOSITION, template_root)
    } else {
        openehr_path
            .replace(&format!("{REFERENCE_TOKEN}/"), "")
            .replace(ARCHETYPE, archetype_root)
            .replace(COMPOSITION, archetype_root)
    }
}

/// Amends a source path with a selector condition's predicate, substituting
/// the resource token and anchoring the `where` clause at the condition's
/// target root. Used to build the limiting criteria of a helper group.
pub fn amend_fhir_path(original: &str, condition: Option<&RuleCondition>, resource: &str) -> String {
    let mut fhir_path = original.replace(FHIR_RESOURCE, resource);
    if fhir_path.contains(FHIR_ROOT) {
        fhir_path = fhir_path
            .replace(&format!(".{FHIR_ROOT}"), "")
            .replace(FHIR_ROOT, "");
    }
    let Some(condition) = condition else {
        return fhir_path;
    };
    let Some(attribute) = first_attribute(condition) else {
        return fhir_path;
    };

    let target_root = condition.target_root.replace(FHIR_RESOURCE, resource);
    let base = if target_root.starts_with(&fhir_path) {
        target_root.as_str()
    } else {
        fhir_path.as_str()
    };
    let negate = condition.operator == ConditionOperator::NotOf;
    let codes = codes_from_criteria(condition.criteria.as_deref());
    let joined = join_where_conditions(attribute, &codes);
    let where_clause = wrap_where_clause(&joined, codes.len(), negate, "");

    base.replace(&target_root, &format!("{target_root}{where_clause}"))
        .replace(FHIR_RESOURCE, resource)
}

/// Strips the `$fhirRoot` token from a source path.
pub fn fix_fhir_path(fhir_path: &str) -> String {
    fhir_path
        .replace(&format!(".{FHIR_ROOT}"), "")
        .replace(FHIR_ROOT, "")
}

/// Rewrites model-typed casts (`as(BooleanType)`) into evaluator-friendly
/// spellings and drops a cast immediately preceding `resolve()`, which the
/// evaluation engine does not handle.
pub fn fix_fhir_path_casting(original: &str) -> String {
    let replaced = original
        .replace("as(BooleanType)", "as(Boolean)")
        .replace("as(DateTimeType)", "as(DateTime)")
        .replace("as(TimeType)", "as(Time)")
        .replace("as(StringType)", "as(String)");
    let parts: Vec<&str> = replaced.split('.').collect();
    let mut building: Vec<&str> = vec![];
    let mut i = 0;
    while i < parts.len() {
        let part = parts[i];
        if i + 1 < parts.len() && part.starts_with("as(") && parts[i + 1] == RESOLVE {
            building.push(parts[i + 1]);
            i += 2;
        } else {
            building.push(part);
            i += 1;
        }
    }
    building.join(".")
}

/// Extracts the first (or last) balanced `where(...)` clause from a path.
pub fn extract_where_condition(path: &str, last: bool) -> Option<String> {
    let needle = "where(";
    let start = if last {
        path.rfind(needle)?
    } else {
        path.find(needle)?
    };

    let mut open = 1;
    let bytes = path.as_bytes();
    let mut end = start + needle.len();
    while end < bytes.len() {
        match bytes[end] {
            b'(' => open += 1,
            b')' => {
                open -= 1;
                if open == 0 {
                    break;
                }
            }
            _ => {}
        }
        end += 1;
    }
    if open != 0 {
        return None;
    }
    Some(path[start..=end].to_string())
}

/// Parses a bracketed, comma-separated criteria list into bare codes,
/// stripping terminology prefixes but keeping full URLs.
pub fn codes_from_criteria(criteria: Option<&str>) -> Vec<String> {
    let Some(criteria) = criteria else {
        return vec![];
    };
    if !criteria.starts_with('[') && !criteria.ends_with(']') {
        return vec![criteria.trim().to_string()];
    }
    criteria
        .replace('[', "")
        .replace(']', "")
        .split(',')
        .map(|code| {
            let code = code.trim();
            if code.starts_with("http://") || code.starts_with("https://") {
                code.to_string()
            } else if let Some(bare) = code.strip_prefix("$snomed.") {
                bare.to_string()
            } else if let Some(bare) = code.strip_prefix("$loinc.") {
                bare.to_string()
            } else {
                code.to_string()
            }
        })
        .collect()
}

/// Builds the source-path predicate for a rule condition and merges it into
/// the rule's source path, re-inserting the parent's `where` clauses where
/// the child path shares the parent's segments. Conditions without a
/// constrained attribute and the empty/not-empty operators contribute no
/// predicate of their own.
pub fn fhir_path_with_conditions(
    original: &str,
    condition: Option<&RuleCondition>,
    resource: &str,
    parent_path: Option<&str>,
) -> String {
    let original = original.replace(FHIR_RESOURCE, resource);
    let attribute = condition.and_then(first_attribute);
    match (condition, attribute) {
        (Some(cond), Some(attr))
            if cond.operator != ConditionOperator::Empty
                && cond.operator != ConditionOperator::NotEmpty =>
        {
            construct_fhir_path_with_conditions(&original, parent_path, cond, attr, resource)
        }
        _ => construct_fhir_path_no_conditions(&original, parent_path),
    }
}

fn first_attribute(condition: &RuleCondition) -> Option<&str> {
    condition
        .target_attribute
        .as_deref()
        .or_else(|| condition.target_attributes.as_ref()?.first().map(String::as_str))
}

pub fn construct_fhir_path_no_conditions(original: &str, parent_path: Option<&str>) -> String {
    let Some(parent) = parent_path.filter(|p| !p.is_empty()) else {
        return original.to_string();
    };
    if extract_where_condition(parent, false).is_none() {
        return original.to_string();
    }
    if original.contains(parent) {
        return original.to_string();
    }
    set_parent_where_path(original, parent)
}

fn construct_fhir_path_with_conditions(
    original: &str,
    parent_path: Option<&str>,
    condition: &RuleCondition,
    attribute: &str,
    resource: &str,
) -> String {
    let actual_target_root = condition
        .target_root
        .replace(FHIR_RESOURCE, resource)
        .replace(FHIR_ROOT, "");

    let with_parents_where;
    let remaining_items;
    if original.starts_with(&actual_target_root) {
        let mut merged = set_parent_where_path(&actual_target_root, parent_path.unwrap_or(""));
        let added_where = parent_path
            .and_then(|p| extract_where_condition(p, true))
            .unwrap_or_default();
        let remaining_from_condition =
            actual_target_root.replace(&merged.replace(&format!(".{added_where}"), ""), "");
        if merged != remaining_from_condition {
            merged.push_str(&remaining_from_condition);
        }
        with_parents_where = merged;
        remaining_items = original.replace(&actual_target_root, "");
    } else {
        with_parents_where = set_parent_where_path(original, parent_path.unwrap_or(""));
        remaining_items = String::new();
    }

    let negate = condition.operator == ConditionOperator::NotOf;
    let codes = codes_from_criteria(condition.criteria.as_deref());
    let joined = join_where_conditions(attribute, &codes);

    if actual_target_root.starts_with(resource) && with_parents_where == original {
        // The condition root digs below the rule's own path; the overlap
        // moves inside the where clause.
        let common = set_parent_where_path(original, &actual_target_root);
        let remaining_in_where = actual_target_root
            .replace(&format!("{common}."), "")
            .replace(&common, "");
        let remaining_to_add = if remaining_in_where.trim().is_empty() {
            String::new()
        } else {
            format!("{remaining_in_where}.")
        };
        let where_clause = wrap_where_clause(&joined, codes.len(), negate, &remaining_to_add);
        let remaining_from_parent = original.replace(&common, "");
        format!("{common}{where_clause}{remaining_from_parent}")
    } else {
        let where_clause = wrap_where_clause(&joined, codes.len(), negate, "");
        let tail = if remaining_items.trim().is_empty() {
            String::new()
        } else if remaining_items.starts_with('.') {
            remaining_items
        } else {
            format!(".{remaining_items}")
        };
        format!("{with_parents_where}{where_clause}{tail}")
    }
}

fn join_where_conditions(attribute: &str, codes: &[String]) -> String {
    codes
        .iter()
        .map(|code| {
            if attribute.contains("coding") {
                format!(
                    "{}(code='{code}').exists()",
                    attribute.replace(".code", ".where")
                )
            } else if attribute.contains("url") {
                format!("{attribute}.toString().contains('{code}')")
            } else {
                format!("{attribute}.toString() = '{code}'")
            }
        })
        .collect::<Vec<_>>()
        .join(" or ")
}

fn wrap_where_clause(joined: &str, code_count: usize, negate: bool, prefix: &str) -> String {
    let body = if negate {
        if code_count > 1 {
            format!("({joined}){FALSE_CLAUSE}")
        } else {
            format!("{joined}{FALSE_CLAUSE}")
        }
    } else {
        joined.to_string()
    };
    format!("{WHERE_CLAUSE}{prefix}{body})")
}

/// Re-inserts the parent's `where` clauses into a child path that shares
/// the parent's dotted segments, stopping at the first divergence.
pub fn set_parent_where_path(child: &str, parent: &str) -> String {
    if parent.is_empty() {
        return child.to_string();
    }
    let parents: Vec<&str> = parent.split('.').collect();
    let children: Vec<&str> = child.split('.').collect();

    let mut joined: Vec<String> = vec![];
    let mut parent_index = 0usize;
    for child_path in &children {
        if parent_index >= parents.len() || *child_path == parents[parent_index] {
            joined.push((*child_path).to_string());
            parent_index += 1;
        } else if parents[parent_index].starts_with("where") {
            let offset: usize = parents[..parent_index].iter().map(|p| p.len()).sum();
            match extract_where_condition(&parent[offset..], false) {
                Some(where_condition) => {
                    let dots = where_condition.matches('.').count();
                    joined.push(where_condition);
                    joined.push((*child_path).to_string());
                    parent_index += dots + 2;
                }
                None => joined.push((*child_path).to_string()),
            }
        } else {
            joined.push((*child_path).to_string());
        }
    }

    let constructed = joined.join(".");
    // A trailing where on the parent path that the child did not consume
    // still applies to the child.
    if parent.starts_with(&constructed) {
        let only_where = parent.replace(&constructed, "");
        if let Some(extracted) = extract_where_condition(&only_where, false) {
            if extracted == only_where || format!(".{extracted}") == only_where {
                return format!("{constructed}{only_where}");
            }
        }
    }
    constructed
}

/// Re-inserts a parent's concrete occurrence indices into a child's dotted
/// path wherever the segments match prefix-wise.
pub fn prepare_parent_openehr_path(full_openehr_path: &str, parent_openehr_path: &str) -> String {
    let dotted = full_openehr_path.replace('/', ".");
    let with_indexes: Vec<&str> = parent_openehr_path.split('/').collect();
    let without_indexes: Vec<&str> = dotted.split('.').collect();

    let mut result: Vec<String> = vec![];
    let mut j = 0usize;
    for part in &without_indexes {
        let part = if part.ends_with(RECURRING) {
            part.replace(RECURRING, "")
        } else {
            (*part).to_string()
        };
        if j < with_indexes.len() && with_indexes[j].starts_with(part.as_str()) {
            result.push(with_indexes[j].to_string());
            j += 1;
        } else {
            result.push(part);
        }
    }
    result.join("/")
}

/// Substitutes an index-bound path into a template path segment by
/// segment: a replacement segment carrying `:N` wins, a bracketed segment
/// keeps the template's spelling, and a diverging segment keeps the
/// template's spelling as well.
pub fn replace_pattern(original: &str, replacement: &str) -> String {
    let original_parts: Vec<&str> = original.split('/').collect();
    let replacement_parts: Vec<&str> = replacement.split('/').collect();

    let mut result: Vec<String> = vec![];
    for (i, original_part) in original_parts.iter().enumerate() {
        if i < replacement_parts.len() && PART_WITH_INDEX.is_match(replacement_parts[i]) {
            result.push(replacement_parts[i].to_string());
        } else if i < replacement_parts.len() && PART_WITH_BRACKET.is_match(replacement_parts[i]) {
            result.push((*original_part).to_string());
        } else if i < replacement_parts.len() {
            let orig = if original_part.contains(RECURRING) {
                replace_last(original_part, RECURRING, "")
            } else {
                (*original_part).to_string()
            };
            let repl = if replacement_parts[i].contains(':') {
                let without_colon = replacement_parts[i].replace(':', "");
                match last_index(replacement_parts[i]) {
                    Some(index) => without_colon.replace(&index.to_string(), ""),
                    None => without_colon,
                }
            } else {
                replacement_parts[i].to_string()
            };
            if !orig.starts_with(&repl) {
                result.push((*original_part).to_string());
            } else {
                result.push(replacement_parts[i].to_string());
            }
        } else {
            result.push((*original_part).to_string());
        }
    }
    result.join("/")
}

/// Whether a child flat path is a direct variation of a parent path,
/// qualifier suffixes ignored.
pub fn child_starts_with_parent(child: &str, parent: &str) -> bool {
    let child_split: Vec<&str> = child.split('/').collect();
    let parent_split: Vec<&str> = parent.split('/').collect();

    for (i, segment) in child_split.iter().enumerate() {
        if i >= parent_split.len() {
            return true;
        }
        let child_path = segment.split('|').next().unwrap_or(segment);
        if child_path != parent_split[i] {
            return false;
        }
    }
    true
}

/// Like [`child_starts_with_parent`] but treats a child's `[n]` segment as
/// matching the parent's already-bound `segment:N`.
pub fn child_has_parent_recurring(child: &str, parent: &str) -> bool {
    let child_split: Vec<&str> = child.split('/').collect();
    let parent_split: Vec<&str> = parent.split('/').collect();

    for (i, segment) in child_split.iter().enumerate() {
        if i >= parent_split.len() {
            return true;
        }
        let child_path = segment.split('|').next().unwrap_or(segment);
        let parent_path = parent_split[i];
        if child_path.ends_with(RECURRING) && parent_path.contains(':') {
            let base_child = child_path.replace(RECURRING, "");
            let base_parent = &parent_path[..parent_path.find(':').unwrap_or(parent_path.len())];
            if base_child == base_parent {
                return true;
            }
        }
        if child_path != parent_path {
            return false;
        }
    }
    true
}
