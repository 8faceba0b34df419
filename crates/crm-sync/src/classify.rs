//! Classifies failed batch outcomes into benign conditions and genuine errors.

use std::collections::BTreeMap;

use crm_core::BatchOutcome;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::rules::{BenignRule, BenignTable, Recovery};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification<'a> {
    Benign(&'a BenignRule),
    Error,
}

impl Classification<'_> {
    pub fn recovery(&self) -> Option<&Recovery> {
        match self {
            Self::Benign(rule) => rule.recovery.as_ref(),
            Self::Error => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ResultClassifier<'a> {
    table: &'a BenignTable,
}

impl<'a> ResultClassifier<'a> {
    pub fn new(table: &'a BenignTable) -> Self {
        Self { table }
    }

    pub fn classify(&self, object: &str, outcome: &BatchOutcome) -> Classification<'a> {
        if outcome.success {
            return Classification::Error;
        }
        self.classify_failure(object, outcome.code(), outcome.message())
    }

    pub fn classify_failure(&self, object: &str, code: &str, message: &str) -> Classification<'a> {
        self.table
            .rules
            .iter()
            .find(|rule| rule.matches(object, code, message))
            .map_or(Classification::Error, Classification::Benign)
    }
}

/// Per-object failure counts with bounded logging.
#[derive(Debug, Clone, Serialize)]
pub struct FailureTally {
    pub object: String,
    pub benign: usize,
    pub recovered: usize,
    pub errors: usize,
    pub benign_reasons: BTreeMap<String, usize>,
    pub error_codes: BTreeMap<String, usize>,
    #[serde(skip)]
    log_limit: usize,
}

impl FailureTally {
    pub fn new(object: impl Into<String>, log_limit: usize) -> Self {
        Self {
            object: object.into(),
            benign: 0,
            recovered: 0,
            errors: 0,
            benign_reasons: BTreeMap::new(),
            error_codes: BTreeMap::new(),
            log_limit,
        }
    }

    pub fn record_benign(&mut self, rule: &BenignRule, source_id: Option<&str>) {
        self.benign += 1;
        *self.benign_reasons.entry(rule.reason.clone()).or_default() += 1;
        if self.benign <= self.log_limit {
            info!(
                object = %self.object,
                source_id = source_id.unwrap_or("-"),
                code = %rule.code,
                reason = %rule.reason,
                "skipping record"
            );
        } else {
            debug!(object = %self.object, code = %rule.code, "skipping record");
        }
    }

    pub fn record_recovered(&mut self, rule: &BenignRule, source_id: &str, target_id: &str) {
        self.record_benign(rule, Some(source_id));
        self.recovered += 1;
        debug!(object = %self.object, source_id, target_id, "mapped onto existing record");
    }

    pub fn record_error(&mut self, outcome: &BatchOutcome, source_id: Option<&str>) {
        self.errors += 1;
        *self.error_codes.entry(outcome.code().to_string()).or_default() += 1;
        if self.errors <= self.log_limit {
            warn!(
                object = %self.object,
                source_id = source_id.unwrap_or("-"),
                code = outcome.code(),
                message = outcome.message(),
                fields = ?outcome.error_fields,
                "record failed"
            );
        } else if self.errors == self.log_limit + 1 {
            warn!(object = %self.object, "suppressing further record errors");
        }
    }
}
