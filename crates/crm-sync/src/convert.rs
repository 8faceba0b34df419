//! Post-pass that converts leads once their accounts, contacts and opportunities exist.

use anyhow::{Context, Result};
use crm_adapters::{LeadConversion, TargetSystem};
use crm_core::{ConversionSummary, SourceRow};
use crm_storage::{IdMappingStore, SourceStore};
use serde_json::Value as JsonValue;
use tracing::{info, warn};

use crate::rules::{ConversionRules, ObjectRules};
use crate::transform::clean_value;

pub struct LeadConverter<'a> {
    source: &'a dyn SourceStore,
    target: &'a dyn TargetSystem,
    mappings: &'a IdMappingStore,
    log_limit: usize,
}

impl<'a> LeadConverter<'a> {
    pub fn new(
        source: &'a dyn SourceStore,
        target: &'a dyn TargetSystem,
        mappings: &'a IdMappingStore,
        log_limit: usize,
    ) -> Self {
        Self {
            source,
            target,
            mappings,
            log_limit,
        }
    }

    fn is_converted(row: &SourceRow, rules: &ConversionRules) -> bool {
        row.get(&rules.flag_field)
            .and_then(|value| clean_value(&rules.flag_field, value))
            == Some(JsonValue::Bool(true))
    }

    /// Builds the conversion request, or names the first id that is not mapped.
    fn conversion_for(
        &self,
        object: &ObjectRules,
        rules: &ConversionRules,
        row: &SourceRow,
    ) -> std::result::Result<LeadConversion, String> {
        let mapped = |target: &str, field: &str| -> std::result::Result<String, String> {
            let raw = row
                .get_str(field)
                .ok_or_else(|| format!("{field} is empty"))?;
            self.mappings
                .get(target, &raw)
                .ok_or_else(|| format!("{field} {raw} is not mapped"))
        };
        let source_id = row
            .source_id()
            .ok_or_else(|| "row has no source id".to_string())?;
        let lead_id = self
            .mappings
            .get(&object.name, &source_id)
            .ok_or_else(|| format!("{} {source_id} is not mapped", object.name))?;

        Ok(LeadConversion {
            lead_id,
            converted_status: rules.converted_status.clone(),
            account_id: mapped("Account", &rules.account_field)?,
            contact_id: mapped("Contact", &rules.contact_field)?,
            opportunity_id: mapped("Opportunity", &rules.opportunity_field).ok(),
        })
    }

    pub async fn convert(
        &self,
        object: &ObjectRules,
        rules: &ConversionRules,
    ) -> Result<ConversionSummary> {
        let rows = self
            .source
            .rows(&object.name)
            .await
            .with_context(|| format!("reading {} rows for conversion", object.name))?;

        let mut summary = ConversionSummary::default();
        for row in rows.iter().filter(|row| Self::is_converted(row, rules)) {
            summary.candidates += 1;
            let source_id = row.source_id().unwrap_or_default();

            let conversion = match self.conversion_for(object, rules, row) {
                Ok(conversion) => conversion,
                Err(reason) => {
                    summary.errors += 1;
                    if summary.errors <= self.log_limit {
                        warn!(%source_id, %reason, "lead not converted");
                    }
                    continue;
                }
            };

            match self.target.convert_lead(&conversion).await {
                Ok(()) => summary.converted += 1,
                Err(err) => {
                    summary.errors += 1;
                    if summary.errors <= self.log_limit {
                        warn!(
                            %source_id,
                            lead_id = %conversion.lead_id,
                            error = %err,
                            "lead conversion failed"
                        );
                    }
                }
            }
        }

        info!(
            candidates = summary.candidates,
            converted = summary.converted,
            errors = summary.errors,
            "lead conversion finished"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rules() -> ConversionRules {
        serde_yaml::from_str("converted_status: Closed - Converted").expect("rules")
    }

    #[test]
    fn converted_flag_accepts_boolean_like_values() {
        let rules = rules();
        for value in [json!(true), json!(1), json!("true"), json!("yes")] {
            let row = SourceRow::from_pairs([("IsConverted", value)]);
            assert!(LeadConverter::is_converted(&row, &rules));
        }
        for value in [json!(false), json!(0), json!(""), JsonValue::Null] {
            let row = SourceRow::from_pairs([("IsConverted", value)]);
            assert!(!LeadConverter::is_converted(&row, &rules));
        }
        assert!(!LeadConverter::is_converted(&SourceRow::new(), &rules));
        assert_eq!(rules.account_field, "ConvertedAccountId");
    }
}
