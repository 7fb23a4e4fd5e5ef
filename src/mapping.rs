// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use core::fmt;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Relative-path tokens understood by the normalizer and the path algebra.
pub const FHIR_RESOURCE: &str = "$resource";
pub const FHIR_ROOT: &str = "$fhirRoot";
pub const ARCHETYPE: &str = "$archetype";
pub const COMPOSITION: &str = "$composition";
pub const OPENEHR_ROOT: &str = "$openehrRoot";
pub const REFERENCE_TOKEN: &str = "$reference";
pub const CONTEXT: &str = "$context";

/// Occurrence placeholder in a target-path template.
pub const RECURRING: &str = "[n]";

/// Cross-reference dereference marker in a source-path expression.
pub const RESOLVE: &str = "resolve()";

pub const SNOMED_PREFIX: &str = "$snomed.";
pub const LOINC_PREFIX: &str = "$loinc.";

pub const NULL_FLAVOUR: &str = "null_flavour";

/// One archetype-scoped mapping unit: a resource selector plus the rules
/// that populate the archetype's subtree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelMapper {
    pub name: String,

    #[serde(rename = "openEhrConfig", alias = "openEHRConfig", default)]
    pub openehr_config: OpenEhrConfig,

    #[serde(rename = "fhirConfig", default)]
    pub fhir_config: FhirConfig,

    #[serde(default)]
    pub mappings: Vec<MappingRule>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OpenEhrConfig {
    pub archetype: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FhirConfig {
    #[serde(default)]
    pub resource: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<RuleCondition>,

    #[serde(default)]
    pub multiple: bool,
}

/// One declarative correspondence between a source path and a target path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MappingRule {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub with: With,

    #[serde(rename = "fhirCondition", default, skip_serializing_if = "Option::is_none")]
    pub fhir_condition: Option<RuleCondition>,

    #[serde(rename = "openehrCondition", default, skip_serializing_if = "Option::is_none")]
    pub openehr_condition: Option<RuleCondition>,

    #[serde(rename = "followedBy", default, skip_serializing_if = "Option::is_none")]
    pub followed_by: Option<FollowedBy>,

    #[serde(rename = "slotArchetype", default, skip_serializing_if = "Option::is_none")]
    pub slot_archetype: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<ReferenceRules>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unidirectional: Option<Direction>,

    #[serde(default, alias = "repeatable")]
    pub multiple: bool,
}

/// The `with` clause: where a value comes from and where it goes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct With {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fhir: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub openehr: Option<String>,

    /// Hardcoded literal written instead of an evaluated value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub target_type: Option<TargetType>,

    /// Custom-conversion code delegated to an externally registered hook.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FollowedBy {
    #[serde(default)]
    pub mappings: Vec<MappingRule>,
}

/// Rules applied to the entity a cross-reference points at.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReferenceRules {
    #[serde(rename = "resourceType", default, skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,

    #[serde(default)]
    pub mappings: Vec<MappingRule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleCondition {
    #[serde(rename = "targetRoot", default)]
    pub target_root: String,

    #[serde(rename = "targetAttribute", default, skip_serializing_if = "Option::is_none")]
    pub target_attribute: Option<String>,

    #[serde(rename = "targetAttributes", default, skip_serializing_if = "Option::is_none")]
    pub target_attributes: Option<Vec<String>>,

    pub operator: ConditionOperator,

    /// A bracketed, comma-separated list of codes or URIs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub criteria: Option<String>,
}

impl RuleCondition {
    /// All attributes the condition constrains, whichever field carried them.
    pub fn attributes(&self) -> Vec<&str> {
        match (&self.target_attribute, &self.target_attributes) {
            (Some(single), _) => vec![single.as_str()],
            (None, Some(many)) => many.iter().map(String::as_str).collect(),
            (None, None) => vec![],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionOperator {
    #[serde(rename = "one of", alias = "equals", alias = "oneOf")]
    OneOf,
    #[serde(rename = "not of", alias = "not-one-of", alias = "notOf")]
    NotOf,
    #[serde(rename = "empty")]
    Empty,
    #[serde(rename = "not empty", alias = "notEmpty", alias = "not-empty")]
    NotEmpty,
    #[serde(rename = "type", alias = "type-equals")]
    TypeEquals,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    #[serde(rename = "toFhir", alias = "fhir")]
    ToFhir,
    #[serde(rename = "toOpenEhr", alias = "toOpenEHR", alias = "openehr")]
    ToOpenEhr,
}

/// The declared openEHR target type of a mapping rule. Accepts both the
/// mapping-format spellings and the underlying `DV_` reference-model names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetType {
    #[serde(rename = "MULTIMEDIA", alias = "DV_MULTIMEDIA", alias = "MEDIA")]
    Multimedia,
    #[serde(rename = "QUANTITY", alias = "DV_QUANTITY")]
    Quantity,
    #[serde(rename = "ORDINAL", alias = "DV_ORDINAL")]
    Ordinal,
    #[serde(rename = "PROPORTION", alias = "DV_PROPORTION")]
    Proportion,
    #[serde(rename = "COUNT", alias = "DV_COUNT")]
    Count,
    #[serde(rename = "DATETIME", alias = "DV_DATE_TIME", alias = "DATE_TIME")]
    DateTime,
    #[serde(rename = "DATE", alias = "DV_DATE")]
    Date,
    #[serde(rename = "TIME", alias = "DV_TIME")]
    Time,
    #[serde(rename = "CODEABLECONCEPT", alias = "DV_CODED_TEXT", alias = "CODED_TEXT")]
    CodedText,
    #[serde(rename = "STRING", alias = "DV_TEXT", alias = "TEXT")]
    Text,
    #[serde(rename = "IDENTIFIER", alias = "DV_IDENTIFIER")]
    Identifier,
    #[serde(rename = "PARTY_IDENTIFIED", alias = "PARTYIDENTIFIED")]
    PartyIdentified,
    #[serde(rename = "PARTY_PROXY", alias = "PARTYPROXY")]
    PartyProxy,
    #[serde(rename = "BOOL", alias = "DV_BOOLEAN", alias = "BOOLEAN")]
    Boolean,
    #[serde(rename = "CODEPHRASE", alias = "CODE_PHRASE")]
    CodePhrase,
    #[serde(rename = "NONE")]
    None,
    #[serde(rename = "CLUSTER")]
    Cluster,
}

impl TargetType {
    /// Whether a type-guard criteria string names this type, accepting
    /// either spelling family (`QUANTITY` and `DV_QUANTITY` both match).
    pub fn matches(&self, criteria: &str) -> bool {
        let normalized: String = criteria
            .trim()
            .to_ascii_uppercase()
            .trim_start_matches("DV_")
            .chars()
            .filter(|c| *c != '_')
            .collect();
        let own: String = format!("{self}")
            .trim_start_matches("DV_")
            .chars()
            .filter(|c| *c != '_')
            .collect();
        let aliases: &[&str] = match self {
            TargetType::CodedText => &["CODEABLECONCEPT", "CODEDTEXT"],
            TargetType::Text => &["STRING", "TEXT"],
            TargetType::Boolean => &["BOOL", "BOOLEAN"],
            TargetType::DateTime => &["DATETIME"],
            _ => &[],
        };
        normalized == own || aliases.contains(&normalized.as_str())
    }
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            TargetType::Multimedia => "MULTIMEDIA",
            TargetType::Quantity => "QUANTITY",
            TargetType::Ordinal => "ORDINAL",
            TargetType::Proportion => "PROPORTION",
            TargetType::Count => "COUNT",
            TargetType::DateTime => "DATETIME",
            TargetType::Date => "DATE",
            TargetType::Time => "TIME",
            TargetType::CodedText => "CODEABLECONCEPT",
            TargetType::Text => "STRING",
            TargetType::Identifier => "IDENTIFIER",
            TargetType::PartyIdentified => "PARTY_IDENTIFIED",
            TargetType::PartyProxy => "PARTY_PROXY",
            TargetType::Boolean => "BOOL",
            TargetType::CodePhrase => "CODEPHRASE",
            TargetType::None => "NONE",
            TargetType::Cluster => "CLUSTER",
        };
        write!(f, "{name}")
    }
}

impl ModelMapper {
    pub fn from_json_str(json: &str) -> Result<ModelMapper> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: &str) -> Result<ModelMapper> {
        match std::fs::read_to_string(path) {
            Ok(c) => Self::from_json_str(c.as_str()),
            Err(e) => bail!("Failed to read {path}. {e}"),
        }
    }

    #[cfg(feature = "yaml")]
    pub fn from_yaml_str(yaml: &str) -> Result<ModelMapper> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    #[cfg(feature = "yaml")]
    pub fn from_yaml_file(path: &str) -> Result<ModelMapper> {
        match std::fs::read_to_string(path) {
            Ok(c) => Self::from_yaml_str(c.as_str()),
            Err(e) => bail!("Failed to read {path}. {e}"),
        }
    }
}
