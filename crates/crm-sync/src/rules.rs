//! Data-driven rule catalogue: object rules, benign error table and id prefix table.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;

const OBJECTS_FILE: &str = "objects.yaml";
const BENIGN_FILE: &str = "benign_errors.yaml";
const PREFIXES_FILE: &str = "id_prefixes.yaml";

const EMBEDDED_OBJECTS: &str = include_str!("../../../rules/objects.yaml");
const EMBEDDED_BENIGN: &str = include_str!("../../../rules/benign_errors.yaml");
const EMBEDDED_PREFIXES: &str = include_str!("../../../rules/id_prefixes.yaml");

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {name}: {source}")]
    Parse {
        name: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid rule catalogue: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Catalog {
    pub external_id_field: String,
    #[serde(default = "default_session_user_query")]
    pub session_user_query: String,
    #[serde(default = "default_reference_suffixes")]
    pub reference_suffixes: Vec<String>,
    #[serde(default)]
    pub strip: Vec<String>,
    /// Field name to referenced object type.
    #[serde(default)]
    pub references: BTreeMap<String, String>,
    #[serde(default)]
    pub polymorphic: Vec<String>,
    pub objects: Vec<ObjectRules>,
}

fn default_session_user_query() -> String {
    "SELECT Id FROM User WHERE IsActive = true LIMIT 1".to_string()
}

fn default_reference_suffixes() -> Vec<String> {
    vec!["Id".to_string(), "Id__c".to_string()]
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ObjectRules {
    pub name: String,
    #[serde(default = "default_true")]
    pub upsert: bool,
    #[serde(default)]
    pub strip: Vec<String>,
    #[serde(default)]
    pub rename: BTreeMap<String, String>,
    #[serde(default)]
    pub references: BTreeMap<String, ReferenceSpec>,
    #[serde(default)]
    pub session_user_fields: Vec<String>,
    #[serde(default)]
    pub required_fields: Vec<String>,
    #[serde(default)]
    pub rules: Vec<FieldRule>,
    #[serde(default)]
    pub prerequisites: Vec<Prerequisite>,
    #[serde(default)]
    pub submission: SubmissionPolicy,
    #[serde(default)]
    pub conversion: Option<ConversionRules>,
}

impl ObjectRules {
    pub fn strips(&self, column: &str) -> bool {
        self.strip.iter().any(|c| c == column)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReferenceSpec {
    /// Overrides the global field-name table.
    #[serde(default)]
    pub object: Option<String>,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collision {
    #[default]
    Suffix,
    Reject,
}

fn default_separator() -> String {
    "-".to_string()
}

/// Ordered per-record synthesis rules.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum FieldRule {
    SetIfAbsent {
        field: String,
        value: JsonValue,
    },
    Force {
        field: String,
        value: JsonValue,
    },
    /// `prefix` + first non-empty `from` field, else `prefix` + leading chars of the source id.
    SynthesizeName {
        field: String,
        prefix: String,
        #[serde(default)]
        from: Vec<String>,
        #[serde(default = "default_id_chars")]
        id_chars: usize,
    },
    CopyIfAbsent {
        field: String,
        from: String,
        #[serde(default)]
        default: Option<String>,
    },
    /// Reads both operands from the source row, since derived totals are usually stripped.
    DeriveRatio {
        field: String,
        numerator: String,
        denominator: String,
        #[serde(default)]
        keep_existing: bool,
    },
    Slug {
        field: String,
        from: String,
    },
    Truncate {
        field: String,
        from: String,
        #[serde(default)]
        split_at: Option<String>,
        max_len: usize,
    },
    RequireEmail {
        field: String,
    },
    Unique {
        field: String,
        #[serde(default)]
        on_collision: Collision,
        #[serde(default = "default_separator")]
        separator: String,
        #[serde(default)]
        case_insensitive: bool,
        #[serde(default)]
        seed_queries: Vec<String>,
    },
}

fn default_id_chars() -> usize {
    8
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrerequisiteFailure {
    SkipType,
    #[default]
    Continue,
}

fn default_unit_price() -> f64 {
    100.0
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum Prerequisite {
    /// Find-or-create a container record and stamp its id on every record.
    DefaultParent {
        field: String,
        #[serde(default)]
        object: Option<String>,
        lookup: String,
        #[serde(default)]
        create: Option<BTreeMap<String, JsonValue>>,
        #[serde(default)]
        overwrite: bool,
        #[serde(default)]
        on_failure: PrerequisiteFailure,
    },
    /// One empty target record per distinct source id in `field`, mapped under `object`.
    VisitorRecords { field: String, object: String },
    /// Standard-pricebook entries for products placed in custom pricebooks.
    StandardPricebookEntries {
        #[serde(default)]
        unit_price: f64,
    },
    /// Entries for every order pricebook and item product pair.
    OrderPricebookEntries {
        #[serde(default = "default_unit_price")]
        default_unit_price: f64,
    },
}

impl Prerequisite {
    /// Object type whose mappings this pre-pass produces, if any.
    pub fn produces(&self) -> Option<&str> {
        match self {
            Self::VisitorRecords { object, .. } => Some(object),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionMode {
    #[default]
    Serial,
    Concurrent,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Fallback {
    #[default]
    None,
    RecordByRecord,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubmissionPolicy {
    #[serde(default)]
    pub chunk_size: Option<usize>,
    #[serde(default)]
    pub mode: SubmissionMode,
    #[serde(default)]
    pub fallback: Fallback,
}

fn default_converted_status() -> String {
    "Closed - Converted".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConversionRules {
    #[serde(default = "default_converted_status")]
    pub converted_status: String,
    #[serde(default = "ConversionRules::default_flag")]
    pub flag_field: String,
    #[serde(default = "ConversionRules::default_account")]
    pub account_field: String,
    #[serde(default = "ConversionRules::default_contact")]
    pub contact_field: String,
    #[serde(default = "ConversionRules::default_opportunity")]
    pub opportunity_field: String,
}

impl ConversionRules {
    fn default_flag() -> String {
        "IsConverted".to_string()
    }
    fn default_account() -> String {
        "ConvertedAccountId".to_string()
    }
    fn default_contact() -> String {
        "ConvertedContactId".to_string()
    }
    fn default_opportunity() -> String {
        "ConvertedOpportunityId".to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum Recovery {
    /// Look up the pre-existing target record by this field and map the source id onto it.
    NaturalKey { field: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BenignRule {
    pub object: String,
    pub code: String,
    #[serde(default)]
    pub message_contains: Vec<String>,
    pub reason: String,
    #[serde(default)]
    pub recovery: Option<Recovery>,
}

impl BenignRule {
    pub fn matches(&self, object: &str, code: &str, message: &str) -> bool {
        (self.object == "*" || self.object == object)
            && self.code == code
            && (self.message_contains.is_empty()
                || self.message_contains.iter().any(|m| message.contains(m.as_str())))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BenignTable {
    #[serde(default)]
    pub rules: Vec<BenignRule>,
}

/// Source id prefix to object type, for polymorphic references.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PrefixTable {
    #[serde(default)]
    pub prefixes: BTreeMap<String, String>,
}

impl PrefixTable {
    /// Longest matching prefix wins.
    pub fn object_for(&self, raw_id: &str) -> Option<&str> {
        self.prefixes
            .iter()
            .filter(|(prefix, _)| raw_id.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, object)| object.as_str())
    }

    pub fn objects(&self) -> impl Iterator<Item = &str> {
        self.prefixes.values().map(String::as_str)
    }
}

#[derive(Debug, Clone)]
pub struct RuleSet {
    pub catalog: Catalog,
    pub benign: BenignTable,
    pub prefixes: PrefixTable,
}

fn parse<T: for<'de> Deserialize<'de>>(name: &str, text: &str) -> Result<T, RuleError> {
    serde_yaml::from_str(text).map_err(|source| RuleError::Parse {
        name: name.to_string(),
        source,
    })
}

fn read(path: &Path) -> Result<String, RuleError> {
    std::fs::read_to_string(path).map_err(|source| RuleError::Read {
        path: path.to_path_buf(),
        source,
    })
}

impl RuleSet {
    /// Rules compiled into the binary from the workspace `rules/` directory.
    pub fn embedded() -> Result<Self, RuleError> {
        Self::from_texts(EMBEDDED_OBJECTS, EMBEDDED_BENIGN, EMBEDDED_PREFIXES)
    }

    pub fn from_dir(dir: &Path) -> Result<Self, RuleError> {
        let objects = read(&dir.join(OBJECTS_FILE))?;
        let benign = read(&dir.join(BENIGN_FILE))?;
        let prefixes = read(&dir.join(PREFIXES_FILE))?;
        Self::from_texts(&objects, &benign, &prefixes)
    }

    pub fn load(dir: Option<&Path>) -> Result<Self, RuleError> {
        match dir {
            Some(dir) => Self::from_dir(dir),
            None => Self::embedded(),
        }
    }

    pub fn from_texts(objects: &str, benign: &str, prefixes: &str) -> Result<Self, RuleError> {
        let rules = Self {
            catalog: parse(OBJECTS_FILE, objects)?,
            benign: parse(BENIGN_FILE, benign)?,
            prefixes: parse(PREFIXES_FILE, prefixes)?,
        };
        rules.validate()?;
        Ok(rules)
    }

    fn validate(&self) -> Result<(), RuleError> {
        let mut seen = HashSet::new();
        for object in &self.catalog.objects {
            if !seen.insert(object.name.as_str()) {
                return Err(RuleError::Invalid(format!(
                    "object {} declared twice",
                    object.name
                )));
            }
            for rule in &object.rules {
                if let FieldRule::Truncate { max_len: 0, field, .. } = rule {
                    return Err(RuleError::Invalid(format!(
                        "{}.{field}: truncate max_len must be positive",
                        object.name
                    )));
                }
            }
            if object.submission.chunk_size == Some(0) {
                return Err(RuleError::Invalid(format!(
                    "{}: chunk_size must be positive",
                    object.name
                )));
            }
        }
        Ok(())
    }

    pub fn object(&self, name: &str) -> Option<&ObjectRules> {
        self.catalog.objects.iter().find(|o| o.name == name)
    }

    pub fn object_names(&self) -> impl Iterator<Item = &str> {
        self.catalog.objects.iter().map(|o| o.name.as_str())
    }

    pub fn external_id_field(&self) -> &str {
        &self.catalog.external_id_field
    }
}
