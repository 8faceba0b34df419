//! Per-record field transformation: cleaning, stripping, reference substitution and synthesis.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::OnceLock;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use crm_core::{value_as_string, SourceRow, TransformedRecord, SOURCE_ID_COLUMN};
use regex::Regex;
use serde_json::{json, Value as JsonValue};

use crate::resolver::{ReferenceResolver, UnresolvedReference};
use crate::rules::{Collision, FieldRule, ObjectRules, RuleSet};

const SLUG_MAX_LEN: usize = 80;

fn email_pattern() -> &'static Regex {
    static EMAIL: OnceLock<Regex> = OnceLock::new();
    EMAIL.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}$").expect("valid regex")
    })
}

/// Value set on every record of a type by a prerequisite pre-pass.
#[derive(Debug, Clone, PartialEq)]
pub struct StampedField {
    pub field: String,
    pub value: JsonValue,
    pub overwrite: bool,
}

/// Why a source row never reaches the target system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    MissingSourceId,
    UnresolvedReference(UnresolvedReference),
    MissingRequiredField(String),
    InvalidEmail { field: String, value: String },
    DuplicateKey { field: String, value: String },
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingSourceId => write!(f, "source row has no {SOURCE_ID_COLUMN}"),
            Self::UnresolvedReference(r) => write!(
                f,
                "{} references {} {} which is not mapped",
                r.field, r.target, r.source_value
            ),
            Self::MissingRequiredField(field) => write!(f, "required field {field} is missing"),
            Self::InvalidEmail { field, value } => write!(f, "{field} {value:?} is not an email"),
            Self::DuplicateKey { field, value } => write!(f, "{field} {value:?} is already taken"),
        }
    }
}

/// Unique-key values already claimed in the target or earlier in the run.
#[derive(Debug, Default)]
pub struct UniqueKeys {
    taken: HashMap<String, HashSet<String>>,
}

impl UniqueKeys {
    fn normalise(value: &str, case_insensitive: bool) -> String {
        if case_insensitive {
            value.to_lowercase()
        } else {
            value.to_string()
        }
    }

    pub fn seed<I>(&mut self, field: &str, values: I, case_insensitive: bool)
    where
        I: IntoIterator<Item = String>,
    {
        let taken = self.taken.entry(field.to_string()).or_default();
        taken.extend(values.into_iter().map(|v| Self::normalise(&v, case_insensitive)));
    }

    /// Claims `value` or a suffixed variant; `None` when the value collides and must be rejected.
    pub fn claim(
        &mut self,
        field: &str,
        value: &str,
        collision: Collision,
        separator: &str,
        case_insensitive: bool,
    ) -> Option<String> {
        let taken = self.taken.entry(field.to_string()).or_default();
        if taken.insert(Self::normalise(value, case_insensitive)) {
            return Some(value.to_string());
        }
        if collision == Collision::Reject {
            return None;
        }
        let mut n = 1usize;
        loop {
            let candidate = format!("{value}{separator}{n}");
            if taken.insert(Self::normalise(&candidate, case_insensitive)) {
                return Some(candidate);
            }
            n += 1;
        }
    }
}

pub fn is_boolean_field(name: &str) -> bool {
    name.strip_prefix("Is")
        .and_then(|rest| rest.chars().next())
        .is_some_and(|c| c.is_ascii_uppercase())
}

fn is_datetime_field(name: &str) -> bool {
    name.contains("Date") || name.contains("Time")
}

fn coerce_bool(value: &JsonValue) -> Option<bool> {
    match value {
        JsonValue::Bool(b) => Some(*b),
        JsonValue::Number(n) => n.as_f64().map(|v| v != 0.0),
        JsonValue::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "y" | "1" => Some(true),
            "false" | "no" | "n" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn normalise_datetime(raw: &str) -> Option<String> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(
            parsed
                .with_timezone(&Utc)
                .to_rfc3339_opts(SecondsFormat::Millis, true),
        );
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc().to_rfc3339_opts(SecondsFormat::Millis, true));
        }
    }
    None
}

/// Cleans one non-reference value; `None` drops the field.
pub fn clean_value(column: &str, value: &JsonValue) -> Option<JsonValue> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) if s.trim().is_empty() => None,
        _ if is_boolean_field(column) => {
            Some(coerce_bool(value).map_or_else(|| value.clone(), JsonValue::Bool))
        }
        JsonValue::String(s) if is_datetime_field(column) => {
            Some(JsonValue::String(normalise_datetime(s.trim()).unwrap_or_else(|| s.clone())))
        }
        other => Some(other.clone()),
    }
}

fn as_number(value: Option<&JsonValue>) -> Option<f64> {
    match value? {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn slugify(raw: &str) -> Option<String> {
    let mut slug = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c);
        } else if !slug.ends_with('_') {
            slug.push('_');
        }
    }
    let mut slug = slug.trim_matches('_').to_string();
    if slug.is_empty() {
        return None;
    }
    if slug.starts_with(|c: char| c.is_ascii_digit()) {
        slug.insert(0, 'X');
    }
    slug.truncate(SLUG_MAX_LEN);
    Some(slug.trim_end_matches('_').to_string())
}

pub struct FieldTransformer<'a> {
    rules: &'a RuleSet,
    object: &'a ObjectRules,
    resolver: ReferenceResolver<'a>,
    external_id_field: Option<&'a str>,
    stamped: &'a [StampedField],
}

impl<'a> FieldTransformer<'a> {
    /// `external_id_field` is `None` when records of this type are inserted rather than upserted.
    pub fn new(
        rules: &'a RuleSet,
        object: &'a ObjectRules,
        resolver: ReferenceResolver<'a>,
        external_id_field: Option<&'a str>,
        stamped: &'a [StampedField],
    ) -> Self {
        Self {
            rules,
            object,
            resolver,
            external_id_field,
            stamped,
        }
    }

    fn skips(&self, column: &str) -> bool {
        column == SOURCE_ID_COLUMN
            || column == self.rules.catalog.external_id_field
            || self.rules.catalog.strip.iter().any(|c| c == column)
            || self.object.strips(column)
    }

    pub fn transform(
        &self,
        row: &SourceRow,
        keys: &mut UniqueKeys,
    ) -> Result<TransformedRecord, RejectReason> {
        let source_id = row.source_id();
        if self.external_id_field.is_some() && source_id.is_none() {
            return Err(RejectReason::MissingSourceId);
        }

        let mut record = TransformedRecord::new(source_id.clone());
        for (column, value) in row.columns() {
            let column = self
                .object
                .rename
                .get(column)
                .map(String::as_str)
                .unwrap_or(column);
            if self.skips(column) {
                continue;
            }

            if self.resolver.is_reference(self.object, column) {
                let Some(raw) = value_as_string(value) else {
                    continue;
                };
                match self.resolver.resolve(self.object, column, &raw) {
                    Ok(Some(target_id)) => {
                        record.fields.insert(column.to_string(), json!(target_id));
                    }
                    Ok(None) => {}
                    Err(unresolved) => return Err(RejectReason::UnresolvedReference(unresolved)),
                }
                continue;
            }

            if let Some(clean) = clean_value(column, value) {
                record.fields.insert(column.to_string(), clean);
            }
        }

        if let (Some(field), Some(id)) = (self.external_id_field, &source_id) {
            record.fields.insert(field.to_string(), json!(id));
        }

        for stamp in self.stamped {
            if stamp.overwrite || !record.has(&stamp.field) {
                record.fields.insert(stamp.field.clone(), stamp.value.clone());
            }
        }

        for rule in &self.object.rules {
            self.apply(rule, row, &mut record)?;
        }

        for field in &self.object.required_fields {
            if !record.has(field) {
                return Err(RejectReason::MissingRequiredField(field.clone()));
            }
        }
        for (field, spec) in &self.object.references {
            if spec.required && !record.has(field) {
                return Err(RejectReason::MissingRequiredField(field.clone()));
            }
        }

        self.claim_unique_keys(&mut record, keys)?;
        Ok(record)
    }

    fn lookup(&self, record: &TransformedRecord, row: &SourceRow, field: &str) -> Option<String> {
        record.get_str(field).or_else(|| row.get_str(field))
    }

    fn apply(
        &self,
        rule: &FieldRule,
        row: &SourceRow,
        record: &mut TransformedRecord,
    ) -> Result<(), RejectReason> {
        match rule {
            FieldRule::SetIfAbsent { field, value } => {
                if !record.has(field) {
                    record.fields.insert(field.clone(), value.clone());
                }
            }
            FieldRule::Force { field, value } => {
                record.fields.insert(field.clone(), value.clone());
            }
            FieldRule::SynthesizeName {
                field,
                prefix,
                from,
                id_chars,
            } => {
                if !record.has(field) {
                    let name = from
                        .iter()
                        .find_map(|f| self.lookup(record, row, f))
                        .or_else(|| {
                            record
                                .source_id
                                .as_ref()
                                .map(|id| id.chars().take(*id_chars).collect())
                        })
                        .map(|suffix| format!("{prefix}{suffix}"))
                        .unwrap_or_else(|| {
                            prefix.trim_end_matches(['-', '_', ' ']).to_string()
                        });
                    record.fields.insert(field.clone(), json!(name));
                }
            }
            FieldRule::CopyIfAbsent {
                field,
                from,
                default,
            } => {
                if !record.has(field) {
                    let value = self.lookup(record, row, from).or_else(|| default.clone());
                    if let Some(value) = value {
                        record.fields.insert(field.clone(), json!(value));
                    }
                }
            }
            FieldRule::DeriveRatio {
                field,
                numerator,
                denominator,
                keep_existing,
            } => {
                if *keep_existing && record.has(field) {
                    return Ok(());
                }
                let numerator = as_number(row.get(numerator));
                let denominator = as_number(row.get(denominator));
                if let (Some(n), Some(d)) = (numerator, denominator) {
                    if d != 0.0 {
                        record.fields.insert(field.clone(), json!(n / d));
                    }
                }
            }
            FieldRule::Slug { field, from } => {
                if !record.has(field) {
                    if let Some(slug) = self.lookup(record, row, from).and_then(|v| slugify(&v)) {
                        record.fields.insert(field.clone(), json!(slug));
                    }
                }
            }
            FieldRule::Truncate {
                field,
                from,
                split_at,
                max_len,
            } => {
                let base = record.get_str(field).or_else(|| {
                    self.lookup(record, row, from).map(|v| match split_at {
                        Some(sep) => v.split(sep.as_str()).next().unwrap_or_default().to_string(),
                        None => v,
                    })
                });
                if let Some(base) = base {
                    let truncated: String = base.chars().take(*max_len).collect();
                    if !truncated.is_empty() {
                        record.fields.insert(field.clone(), json!(truncated));
                    }
                }
            }
            FieldRule::RequireEmail { field } => match record.get_str(field) {
                Some(value) if email_pattern().is_match(value.trim()) => {}
                Some(value) => {
                    return Err(RejectReason::InvalidEmail {
                        field: field.clone(),
                        value,
                    })
                }
                None => return Err(RejectReason::MissingRequiredField(field.clone())),
            },
            FieldRule::Unique { .. } => {}
        }
        Ok(())
    }

    fn claim_unique_keys(
        &self,
        record: &mut TransformedRecord,
        keys: &mut UniqueKeys,
    ) -> Result<(), RejectReason> {
        for rule in &self.object.rules {
            let FieldRule::Unique {
                field,
                on_collision,
                separator,
                case_insensitive,
                ..
            } = rule
            else {
                continue;
            };
            let Some(value) = record.get_str(field) else {
                continue;
            };
            match keys.claim(field, &value, *on_collision, separator, *case_insensitive) {
                Some(claimed) => {
                    record.fields.insert(field.clone(), json!(claimed));
                }
                None => {
                    return Err(RejectReason::DuplicateKey {
                        field: field.clone(),
                        value,
                    })
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::MappingLookup;
    use std::collections::HashMap;

    #[derive(Default)]
    struct Mappings(HashMap<(String, String), String>);

    impl MappingLookup for Mappings {
        fn lookup(&self, object_type: &str, source_id: &str) -> Option<String> {
            self.0
                .get(&(object_type.to_string(), source_id.to_string()))
                .cloned()
        }
    }

    fn row(pairs: &[(&str, JsonValue)]) -> SourceRow {
        SourceRow::from_pairs(pairs.iter().cloned())
    }

    fn transform_one(
        rules: &RuleSet,
        mappings: &Mappings,
        object: &str,
        external_id: Option<&str>,
        source: &SourceRow,
    ) -> Result<TransformedRecord, RejectReason> {
        let object = rules.object(object).expect("object");
        let resolver = ReferenceResolver::new(rules, mappings, None);
        let transformer = FieldTransformer::new(rules, object, resolver, external_id, &[]);
        transformer.transform(source, &mut UniqueKeys::default())
    }

    #[test]
    fn identity_column_becomes_the_external_id() {
        let rules = RuleSet::embedded().expect("rules");
        let mappings = Mappings::default();
        let source = row(&[
            ("Id", json!("001S1")),
            ("Name", json!("Acme")),
            ("CreatedDate", json!("2024-01-01T00:00:00Z")),
            ("RecordTypeId", json!("012S1")),
            ("Description", json!("")),
        ]);

        let upsert = transform_one(&rules, &mappings, "Account", Some("OriginalId__c"), &source)
            .expect("upsert record");
        assert_eq!(upsert.source_id.as_deref(), Some("001S1"));
        assert_eq!(upsert.fields.get("OriginalId__c"), Some(&json!("001S1")));
        assert!(!upsert.fields.contains_key("Id"));
        assert!(!upsert.fields.contains_key("CreatedDate"));
        assert!(!upsert.fields.contains_key("RecordTypeId"));
        assert!(!upsert.fields.contains_key("Description"));

        let insert = transform_one(&rules, &mappings, "Account", None, &source).expect("insert");
        assert!(!insert.fields.contains_key("OriginalId__c"));
        assert_eq!(insert.source_id.as_deref(), Some("001S1"));
    }

    #[test]
    fn account_names_are_synthesized_when_absent() {
        let rules = RuleSet::embedded().expect("rules");
        let mappings = Mappings::default();

        let with_phone = row(&[("Id", json!("001S1234567")), ("Phone", json!("555-0100"))]);
        let record = transform_one(&rules, &mappings, "Account", None, &with_phone).expect("rec");
        assert_eq!(record.fields.get("Name"), Some(&json!("Account-555-0100")));

        let bare = row(&[("Id", json!("001S1234567"))]);
        let record = transform_one(&rules, &mappings, "Account", None, &bare).expect("rec");
        assert_eq!(record.fields.get("Name"), Some(&json!("Account-001S1234")));
    }

    #[test]
    fn boolean_like_fields_are_coerced() {
        let rules = RuleSet::embedded().expect("rules");
        let mappings = Mappings::default();
        let source = row(&[
            ("Id", json!("01tS1")),
            ("Name", json!("Widget")),
            ("IsActive", json!("yes")),
            ("IsArchived", json!(0)),
            ("Isolation", json!("1")),
        ]);
        let record = transform_one(&rules, &mappings, "Product2", None, &source).expect("rec");
        assert_eq!(record.fields.get("IsActive"), Some(&json!(true)));
        assert_eq!(record.fields.get("IsArchived"), Some(&json!(false)));
        assert_eq!(record.fields.get("Isolation"), Some(&json!("1")));
    }

    #[test]
    fn datetimes_are_normalised_to_utc() {
        assert_eq!(
            clean_value("CloseDate__c", &json!("2024-03-01T10:00:00+02:00")),
            Some(json!("2024-03-01T08:00:00.000Z"))
        );
        assert_eq!(
            clean_value("ActivityDate", &json!("2024-03-01")),
            Some(json!("2024-03-01"))
        );
    }

    #[test]
    fn unmapped_required_references_reject_the_row() {
        let rules = RuleSet::embedded().expect("rules");
        let mappings = Mappings::default();
        let source = row(&[
            ("Id", json!("01uS1")),
            ("Pricebook2Id", json!("01sS1")),
            ("Product2Id", json!("01tS1")),
            ("UnitPrice", json!(10)),
        ]);
        let err = transform_one(&rules, &mappings, "PricebookEntry", Some("OriginalId__c"), &source)
            .expect_err("rejected");
        assert!(matches!(err, RejectReason::UnresolvedReference(_)));

        let missing = row(&[("Id", json!("01uS2")), ("UnitPrice", json!(10))]);
        let err = transform_one(&rules, &mappings, "PricebookEntry", None, &missing)
            .expect_err("rejected");
        assert!(matches!(err, RejectReason::MissingRequiredField(_)));
    }

    #[test]
    fn line_item_unit_price_is_derived_from_total() {
        let rules = RuleSet::embedded().expect("rules");
        let mut mappings = Mappings::default();
        mappings
            .0
            .insert(("Opportunity".into(), "006S1".into()), "006T1".into());
        let source = row(&[
            ("Id", json!("00kS1")),
            ("OpportunityId", json!("006S1")),
            ("Quantity", json!(4)),
            ("TotalPrice", json!(100.0)),
        ]);
        let record =
            transform_one(&rules, &mappings, "OpportunityLineItem", None, &source).expect("rec");
        assert_eq!(record.fields.get("UnitPrice"), Some(&json!(25.0)));
        assert_eq!(record.fields.get("OpportunityId"), Some(&json!("006T1")));
        assert!(!record.fields.contains_key("TotalPrice"));
    }

    #[test]
    fn order_status_is_forced_to_draft_and_columns_renamed() {
        let rules = RuleSet::embedded().expect("rules");
        let mut mappings = Mappings::default();
        mappings.0.insert(("Account".into(), "001S1".into()), "001T1".into());
        mappings.0.insert(("Order".into(), "801S1".into()), "801T1".into());
        mappings
            .0
            .insert(("PricebookEntry".into(), "01uS1".into()), "01uT1".into());

        let order = row(&[
            ("Id", json!("801S1")),
            ("AccountId", json!("001S1")),
            ("Status", json!("Activated")),
        ]);
        let record = transform_one(&rules, &mappings, "Order", None, &order).expect("order");
        assert_eq!(record.fields.get("Status"), Some(&json!("Draft")));

        let item = row(&[
            ("Id", json!("802S1")),
            ("OrderId", json!("801S1")),
            ("PriceBookEntryId", json!("01uS1")),
        ]);
        let record = transform_one(&rules, &mappings, "OrderItem", None, &item).expect("item");
        assert_eq!(record.fields.get("PricebookEntryId"), Some(&json!("01uT1")));
        assert!(!record.fields.contains_key("PriceBookEntryId"));
    }

    #[test]
    fn users_get_defaults_and_unique_usernames() {
        let rules = RuleSet::embedded().expect("rules");
        let mappings = Mappings::default();
        let object = rules.object("User").expect("user");
        let resolver = ReferenceResolver::new(&rules, &mappings, None);
        let transformer = FieldTransformer::new(&rules, object, resolver, None, &[]);
        let mut keys = UniqueKeys::default();
        keys.seed("Username", ["TAKEN@example.com".to_string()], true);

        let ok = row(&[("Id", json!("005S1")), ("Email", json!("ada.lovelace@example.com"))]);
        let record = transformer.transform(&ok, &mut keys).expect("user");
        assert_eq!(record.fields.get("Username"), Some(&json!("ada.lovelace@example.com")));
        assert_eq!(record.fields.get("Alias"), Some(&json!("ada.love")));
        assert_eq!(record.fields.get("LastName"), Some(&json!("User")));
        assert_eq!(record.fields.get("TimeZoneSidKey"), Some(&json!("America/New_York")));

        let taken = row(&[("Id", json!("005S2")), ("Email", json!("taken@example.com"))]);
        assert!(matches!(
            transformer.transform(&taken, &mut keys),
            Err(RejectReason::DuplicateKey { .. })
        ));

        let invalid = row(&[("Id", json!("005S3")), ("Email", json!("not-an-email"))]);
        assert!(matches!(
            transformer.transform(&invalid, &mut keys),
            Err(RejectReason::InvalidEmail { .. })
        ));
    }

    #[test]
    fn colliding_developer_names_get_suffixes() {
        let rules = RuleSet::embedded().expect("rules");
        let mappings = Mappings::default();
        let object = rules.object("Territory2").expect("territory");
        let resolver = ReferenceResolver::new(&rules, &mappings, None);
        let stamped = vec![StampedField {
            field: "Territory2ModelId".into(),
            value: json!("0MAT1"),
            overwrite: true,
        }];
        let transformer = FieldTransformer::new(&rules, object, resolver, None, &stamped);
        let mut keys = UniqueKeys::default();

        let first = row(&[("Id", json!("0MIS1")), ("Name", json!("North East"))]);
        let second = row(&[
            ("Id", json!("0MIS2")),
            ("Name", json!("North-East")),
            ("Territory2ModelId", json!("0MAS9")),
        ]);
        let a = transformer.transform(&first, &mut keys).expect("first");
        let b = transformer.transform(&second, &mut keys).expect("second");

        assert_eq!(a.fields.get("DeveloperName"), Some(&json!("North_East")));
        assert_eq!(b.fields.get("DeveloperName"), Some(&json!("North_East_1")));
        assert_eq!(b.fields.get("Territory2ModelId"), Some(&json!("0MAT1")));
    }

    #[test]
    fn slugs_start_with_a_letter() {
        assert_eq!(slugify("  42 Main St. "), Some("X42_Main_St".to_string()));
        assert_eq!(slugify("!!!"), None);
    }
}
