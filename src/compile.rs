// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Compiles normalized model mappers into trees of execution helpers.
//!
//! A helper carries everything the execution engine needs for one rule:
//! the limiting criteria selecting candidate instances, the source path to
//! evaluate, the target-path template (possibly still holding recurring
//! placeholders) and the declared target type. Nested rules become child
//! helpers that evaluate against the value their parent yielded.

use crate::error::MapError;
use crate::mapping::{
    ConditionOperator, Direction, FhirConfig, MappingRule, ModelMapper, RuleCondition, TargetType,
    COMPOSITION, CONTEXT, FHIR_RESOURCE, FHIR_ROOT, REFERENCE_TOKEN,
};
use crate::{normalize, paths};

use anyhow::Result;
use log::warn;

/// Looks up mapping configuration. Implemented by the caller over whatever
/// storage holds the model mappers.
pub trait MapperRegistry {
    /// All mappers declared for a source entity kind.
    fn mappers_for_kind(&self, kind: &str) -> Vec<ModelMapper>;

    /// All mappers implementing the named slot archetype within a template.
    fn mappers_for_archetype(
        &self,
        template_id: &str,
        archetype: &str,
    ) -> Option<Vec<ModelMapper>>;
}

/// One compiled execution node. Helpers are value objects; the engine deep
/// copies a subtree before baking a concrete occurrence index into it, so
/// the compiled tree itself is never mutated during execution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Helper {
    pub archetype: String,
    pub limiting_criteria: String,
    pub fhir_path: String,
    pub openehr_path: String,
    pub openehr_type: Option<TargetType>,
    pub hardcoding_value: Option<String>,
    pub mapping_code: Option<String>,
    pub type_condition: Option<RuleCondition>,
    pub multiple: bool,
    pub children: Vec<Helper>,
}

impl Helper {
    /// Unescapes archetype-name dots throughout a helper tree. Runs once
    /// after compilation, before the first execution.
    pub fn unescape_dots(&mut self) {
        self.openehr_path = paths::unescape_dots(&self.openehr_path);
        for child in self.children.iter_mut() {
            child.unescape_dots();
        }
    }

    /// Whether this helper's type guard contradicts its declared type.
    /// Guarded helpers whose guard cannot hold are skipped at execution.
    pub fn type_guard_contradicted(&self) -> bool {
        let Some(guard) = &self.type_condition else {
            return false;
        };
        let codes = paths::codes_from_criteria(guard.criteria.as_deref());
        if codes.is_empty() {
            return false;
        }
        match self.openehr_type {
            Some(declared) => !codes.iter().any(|code| declared.matches(code)),
            None => true,
        }
    }
}

/// Output of compiling one model mapper: the primary helpers plus the
/// "cover" helpers whose source paths target a different, indirectly
/// referenced entity kind.
#[derive(Debug, Clone, Default)]
pub struct CompiledMapper {
    pub helpers: Vec<Helper>,
    pub cover_helpers: Vec<Helper>,
}

pub struct Compiler<'a> {
    registry: &'a dyn MapperRegistry,
    template_id: &'a str,
}

impl<'a> Compiler<'a> {
    pub fn new(registry: &'a dyn MapperRegistry, template_id: &'a str) -> Compiler<'a> {
        Compiler {
            registry,
            template_id,
        }
    }

    /// Compiles one mapper into its helper trees. The archetype root path
    /// is the template's content entry for the archetype; cluster-only
    /// archetypes sit directly below the template root.
    pub fn compile(&self, mapper: &ModelMapper) -> Result<CompiledMapper> {
        let archetype = mapper.openehr_config.archetype.clone();
        let archetype_root = if !archetype.contains("CLUSTER") {
            format!("{}/content[{archetype}]", self.template_id)
        } else {
            self.template_id.to_string()
        };

        let mut compiled = CompiledMapper::default();
        self.create_helpers(
            &archetype,
            mapper,
            &archetype_root,
            &mapper.mappings,
            None,
            &mut compiled.helpers,
            &mut compiled.cover_helpers,
            mapper.fhir_config.multiple,
            false,
        )?;

        for helper in compiled
            .helpers
            .iter_mut()
            .chain(compiled.cover_helpers.iter_mut())
        {
            helper.unescape_dots();
        }
        Ok(compiled)
    }

    #[allow(clippy::too_many_arguments)]
    fn create_helpers(
        &self,
        archetype: &str,
        mapper: &ModelMapper,
        archetype_root: &str,
        mappings: &[MappingRule],
        parent_condition: Option<&RuleCondition>,
        helpers: &mut Vec<Helper>,
        cover_helpers: &mut Vec<Helper>,
        multiple: bool,
        break_recursion: bool,
    ) -> Result<()> {
        for rule in mappings {
            let mut rule = rule.clone();

            if rule.with.openehr.is_none()
                && rule.with.value.as_deref().is_some_and(|v| !v.is_empty())
            {
                // Hardcoding toward the source model; nothing to do in
                // this direction.
                continue;
            }
            if rule.unidirectional == Some(Direction::ToFhir) {
                continue;
            }
            let Some(openehr) = rule.with.openehr.clone() else {
                warn!(
                    "Skipping rule with no target path for source path {:?}",
                    rule.with.fhir
                );
                continue;
            };
            if openehr.starts_with(CONTEXT) {
                continue;
            }

            let mut helper = Helper {
                archetype: archetype.to_string(),
                limiting_criteria: self.limiting_criteria(&mapper.fhir_config),
                ..Helper::default()
            };

            if let Some(condition) = &rule.openehr_condition {
                if condition.operator == ConditionOperator::TypeEquals {
                    helper.type_condition = Some(condition.clone());
                }
            }

            hardcode_to_target(&mut rule, &mut helper);

            let condition = parent_condition.or(rule.fhir_condition.as_ref());
            let fhir_path = paths::fhir_path_with_conditions(
                rule.with.fhir.as_deref().unwrap_or_default(),
                condition,
                &mapper.fhir_config.resource,
                None,
            );

            // A source path opening with a different entity kind selects
            // instances the mapper's own criteria would never match.
            let is_cover = !fhir_path.is_empty()
                && fhir_path.chars().next().is_some_and(|c| c.is_uppercase())
                && !fhir_path.starts_with(&mapper.fhir_config.resource);

            if openehr.contains(REFERENCE_TOKEN) && rule.reference.is_some() {
                self.create_reference_helpers(
                    &rule,
                    &fhir_path,
                    archetype,
                    mapper,
                    archetype_root,
                    parent_condition,
                    helpers,
                    cover_helpers,
                    multiple,
                    break_recursion,
                )?;
                continue;
            }

            let (resolved_openehr, mut push) = self.apply_main_mapping(
                &rule,
                &mut helper,
                archetype_root,
                &fhir_path,
                multiple,
                &mapper.fhir_config.resource,
            );

            let mut children: Vec<Helper> = vec![];
            if let Some(followed_by) = &rule.followed_by {
                let mut nested = followed_by.mappings.clone();
                normalize::rebase_followed_by(&mut nested, &resolved_openehr, archetype_root);

                helper.openehr_path = paths::fix_openehr_path(&resolved_openehr, archetype_root);
                helper.fhir_path = paths::fix_fhir_path(&fhir_path);
                helper.multiple = multiple;
                fix_cover_limiting_criteria(&mapper.fhir_config.resource, &mut helper);

                self.create_helpers(
                    archetype,
                    mapper,
                    archetype_root,
                    &nested,
                    None,
                    &mut children,
                    cover_helpers,
                    multiple,
                    break_recursion,
                )?;
                push = true;
            }
            if let Some(slot_archetype) = rule.slot_archetype.clone() {
                self.create_slot_helpers(
                    &rule,
                    &slot_archetype,
                    &resolved_openehr,
                    archetype_root,
                    &fhir_path,
                    archetype,
                    mapper,
                    &mut helper,
                    &mut children,
                    cover_helpers,
                    multiple,
                    break_recursion,
                )?;
                push = true;
            }
            helper.children = children;

            if push {
                let target = if is_cover {
                    &mut *cover_helpers
                } else {
                    &mut *helpers
                };
                if !target.contains(&helper) {
                    target.push(helper);
                }
            }
        }
        Ok(())
    }

    /// Resolves the rule's own target path and fills the helper's direct
    /// fields. Returns the resolved path (children rebase against it) and
    /// whether this rule materializes a helper of its own.
    fn apply_main_mapping(
        &self,
        rule: &MappingRule,
        helper: &mut Helper,
        archetype_root: &str,
        fhir_path: &str,
        multiple: bool,
        resource: &str,
    ) -> (String, bool) {
        let raw = rule.with.openehr.as_deref().unwrap_or_default();
        let mut openehr = paths::prepare_openehr_syntax(raw, archetype_root);
        match rule.with.target_type {
            None => {
                // Without a declared type, a path already naming a
                // terminal attribute becomes a qualifier suffix.
                if paths::ends_with_openehr_type(&openehr).is_some() {
                    openehr = paths::replace_last(&openehr, "/", "|");
                }
            }
            Some(target_type) => helper.openehr_type = Some(target_type),
        }

        if rule.with.target_type == Some(TargetType::None) {
            return (openehr, false);
        }

        helper.openehr_path = openehr.replace(COMPOSITION, self.template_id);
        helper.fhir_path = paths::fix_fhir_path(fhir_path);
        helper.mapping_code = rule.with.code.clone();
        helper.multiple = multiple;
        fix_cover_limiting_criteria(resource, helper);
        (openehr, true)
    }

    #[allow(clippy::too_many_arguments)]
    fn create_reference_helpers(
        &self,
        rule: &MappingRule,
        fhir_path: &str,
        archetype: &str,
        mapper: &ModelMapper,
        archetype_root: &str,
        parent_condition: Option<&RuleCondition>,
        helpers: &mut Vec<Helper>,
        cover_helpers: &mut Vec<Helper>,
        multiple: bool,
        break_recursion: bool,
    ) -> Result<()> {
        let Some(reference) = &rule.reference else {
            return Ok(());
        };
        let mut referenced = reference.mappings.clone();
        normalize::prepare_referenced_mappings(
            fhir_path,
            rule.with.openehr.as_deref().unwrap_or_default(),
            &mut referenced,
            archetype_root,
        );
        self.create_helpers(
            archetype,
            mapper,
            archetype_root,
            &referenced,
            parent_condition,
            helpers,
            cover_helpers,
            multiple,
            break_recursion,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn create_slot_helpers(
        &self,
        rule: &MappingRule,
        slot_archetype: &str,
        resolved_openehr: &str,
        archetype_root: &str,
        fhir_path: &str,
        archetype: &str,
        mapper: &ModelMapper,
        helper: &mut Helper,
        children: &mut Vec<Helper>,
        cover_helpers: &mut Vec<Helper>,
        multiple: bool,
        break_recursion: bool,
    ) -> Result<()> {
        let Some(slot_mappers) = self
            .registry
            .mappers_for_archetype(self.template_id, slot_archetype)
        else {
            return Err(MapError::UnknownSlotArchetype {
                archetype: slot_archetype.to_string(),
                rule: rule.name.clone(),
            }
            .into());
        };

        for mut slot_mapper in slot_mappers {
            let possible_recursion = slot_mapper.name == mapper.name;
            if break_recursion {
                warn!(
                    "Breaking possible infinite recursion with mapping: {}",
                    slot_mapper.name
                );
                break;
            }

            let openehr_fixed = resolved_openehr.replace(&format!("/{REFERENCE_TOKEN}"), "");
            normalize::prepare_forwarding_slot_mapper(&mut slot_mapper, mapper, &openehr_fixed);

            helper.openehr_path = paths::fix_openehr_path(resolved_openehr, archetype_root);
            helper.fhir_path = paths::fix_fhir_path(fhir_path);
            fix_cover_limiting_criteria(&mapper.fhir_config.resource, helper);

            let slot_mappings = slot_mapper.mappings.clone();
            self.create_helpers(
                archetype,
                &slot_mapper,
                &openehr_fixed,
                &slot_mappings,
                None,
                children,
                cover_helpers,
                multiple,
                possible_recursion,
            )?;
        }
        Ok(())
    }

    /// The criteria selecting candidate instances for one mapper: every
    /// instance of the entity kind, narrowed by the selector condition
    /// when one is declared.
    fn limiting_criteria(&self, config: &FhirConfig) -> String {
        let resource = &config.resource;
        match &config.condition {
            Some(condition) => {
                let amended = paths::amend_fhir_path(FHIR_RESOURCE, Some(condition), resource);
                if amended.starts_with(resource.as_str()) {
                    let predicate = amended.replace(&format!("{resource}."), "");
                    format!("Bundle.entry.resource.ofType({resource}).where({predicate})")
                } else {
                    amended
                }
            }
            None => format!("Bundle.entry.resource.ofType({resource})"),
        }
    }
}

/// Hardcoded rules have no source path of their own; they evaluate at the
/// root of the instance (or the condition's root) and write their literal.
fn hardcode_to_target(rule: &mut MappingRule, helper: &mut Helper) {
    if rule.with.fhir.is_some() {
        return;
    }
    rule.with.fhir = Some(match &rule.fhir_condition {
        Some(condition) => format!("{FHIR_ROOT}{}", condition.target_root),
        None => FHIR_ROOT.to_string(),
    });
    helper.hardcoding_value = rule.with.value.clone();
}

/// A helper targeting an indirectly referenced entity kind still carries
/// the mapper's criteria; rewrite it to select on that other kind.
fn fix_cover_limiting_criteria(resource: &str, helper: &mut Helper) {
    let fhir_path = &helper.fhir_path;
    if fhir_path.is_empty() {
        return;
    }
    if !fhir_path.starts_with(resource) && fhir_path.chars().next().is_some_and(|c| c.is_uppercase())
    {
        let other_kind = fhir_path.split('.').next().unwrap_or(fhir_path).to_string();
        helper.limiting_criteria = helper.limiting_criteria.replace(resource, &other_kind);
    }
}
