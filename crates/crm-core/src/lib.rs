//! Core domain model for the CRM data migration pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub const CRATE_NAME: &str = "crm-core";

/// Column name carrying the source-system primary key.
pub const SOURCE_ID_COLUMN: &str = "Id";

/// Field map of a record as sent to the target system.
pub type FieldMap = serde_json::Map<String, JsonValue>;

/// One row of the source snapshot, columns kept in source order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SourceRow {
    columns: Vec<(String, JsonValue)>,
}

impl SourceRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, K>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, JsonValue)>,
        K: Into<String>,
    {
        Self {
            columns: pairs.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    pub fn push(&mut self, column: impl Into<String>, value: JsonValue) {
        self.columns.push((column.into(), value));
    }

    pub fn get(&self, column: &str) -> Option<&JsonValue> {
        self.columns
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }

    /// Non-null value of `column` rendered as a string.
    pub fn get_str(&self, column: &str) -> Option<String> {
        self.get(column).and_then(value_as_string)
    }

    pub fn source_id(&self) -> Option<String> {
        self.get_str(SOURCE_ID_COLUMN)
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, &JsonValue)> {
        self.columns.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// Renders scalar JSON values as strings; null and blank strings yield `None`.
pub fn value_as_string(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) if s.trim().is_empty() => None,
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        other => Some(other.to_string()),
    }
}

/// Record produced by the field transformer, ready for submission.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TransformedRecord {
    pub source_id: Option<String>,
    pub fields: FieldMap,
}

impl TransformedRecord {
    pub fn new(source_id: Option<String>) -> Self {
        Self {
            source_id,
            fields: FieldMap::new(),
        }
    }

    pub fn get_str(&self, field: &str) -> Option<String> {
        self.fields.get(field).and_then(value_as_string)
    }

    pub fn has(&self, field: &str) -> bool {
        self.fields.get(field).is_some_and(|v| !v.is_null())
    }
}

/// Per-record result of a submission, positionally aligned with the submitted batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub success: bool,
    pub target_id: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    #[serde(default)]
    pub error_fields: Vec<String>,
}

impl BatchOutcome {
    pub fn created(target_id: impl Into<String>) -> Self {
        Self {
            success: true,
            target_id: Some(target_id.into()),
            error_code: None,
            error_message: None,
            error_fields: Vec::new(),
        }
    }

    pub fn failed(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            target_id: None,
            error_code: Some(code.into()),
            error_message: Some(message.into()),
            error_fields: Vec::new(),
        }
    }

    pub fn with_fields(mut self, fields: Vec<String>) -> Self {
        self.error_fields = fields;
        self
    }

    pub fn code(&self) -> &str {
        self.error_code.as_deref().unwrap_or("UNKNOWN_ERROR")
    }

    pub fn message(&self) -> &str {
        self.error_message.as_deref().unwrap_or_default()
    }
}

/// Whether a mapped target record was created by the migration or already existed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingOrigin {
    #[default]
    Created,
    Adopted,
}

impl MappingOrigin {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Adopted => "adopted",
        }
    }

    /// Unknown values read back as `Created`.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "adopted" => Self::Adopted,
            _ => Self::Created,
        }
    }
}

/// Durable `(object_type, source_id) -> target_id` correspondence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingRecord {
    pub object_type: String,
    pub source_id: String,
    pub target_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub origin: MappingOrigin,
}

/// How records of one object type are addressed in the target system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AddressingMode {
    Upsert { external_id_field: String },
    Insert,
}

impl AddressingMode {
    pub fn external_id_field(&self) -> Option<&str> {
        match self {
            Self::Upsert { external_id_field } => Some(external_id_field),
            Self::Insert => None,
        }
    }
}

/// Lifecycle of one object type within an upload run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ObjectState {
    Pending,
    Prepared,
    Submitted,
    Reconciled,
    Done,
    Skipped,
}

impl ObjectState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Skipped)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectSummary {
    pub object: String,
    pub state: ObjectState,
    pub mode: Option<AddressingMode>,
    pub source_rows: usize,
    pub rejected: usize,
    pub already_mapped: usize,
    pub submitted: usize,
    pub uploaded: usize,
    pub benign: usize,
    pub recovered: usize,
    pub errors: usize,
    pub mapped: usize,
    pub note: Option<String>,
}

impl ObjectSummary {
    pub fn pending(object: impl Into<String>) -> Self {
        Self {
            object: object.into(),
            state: ObjectState::Pending,
            mode: None,
            source_rows: 0,
            rejected: 0,
            already_mapped: 0,
            submitted: 0,
            uploaded: 0,
            benign: 0,
            recovered: 0,
            errors: 0,
            mapped: 0,
            note: None,
        }
    }

    pub fn skipped(object: impl Into<String>, note: impl Into<String>) -> Self {
        let mut summary = Self::pending(object);
        summary.state = ObjectState::Skipped;
        summary.note = Some(note.into());
        summary
    }

    /// Pre-validation rejections plus benign target failures.
    pub fn skipped_count(&self) -> usize {
        self.rejected + self.benign
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionSummary {
    pub candidates: usize,
    pub converted: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub objects: Vec<ObjectSummary>,
    pub conversion: Option<ConversionSummary>,
}

impl UploadRunSummary {
    pub fn total_uploaded(&self) -> usize {
        self.objects.iter().map(|o| o.uploaded).sum()
    }

    pub fn total_errors(&self) -> usize {
        self.objects.iter().map(|o| o.errors).sum()
    }

    pub fn total_skipped(&self) -> usize {
        self.objects.iter().map(ObjectSummary::skipped_count).sum()
    }

    pub fn object(&self, name: &str) -> Option<&ObjectSummary> {
        self.objects.iter().find(|o| o.object == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn source_row_keeps_column_order_and_reads_ids() {
        let row = SourceRow::from_pairs([
            ("Id", json!("001A")),
            ("Name", json!("Acme")),
            ("Phone", JsonValue::Null),
        ]);
        let names: Vec<_> = row.columns().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["Id", "Name", "Phone"]);
        assert_eq!(row.source_id().as_deref(), Some("001A"));
        assert_eq!(row.get_str("Phone"), None);
    }

    #[test]
    fn numeric_ids_render_as_strings() {
        let row = SourceRow::from_pairs([("Id", json!(42))]);
        assert_eq!(row.source_id().as_deref(), Some("42"));
    }

    #[test]
    fn skipped_count_combines_rejections_and_benign_failures() {
        let mut summary = ObjectSummary::pending("Account");
        summary.rejected = 2;
        summary.benign = 3;
        summary.errors = 7;
        assert_eq!(summary.skipped_count(), 5);
    }
}
