//! Dependency-ordered upload of every object type.
//!
//! Each type moves through `PENDING -> PREPARED -> SUBMITTED -> RECONCILED -> DONE`
//! (or `SKIPPED`). Rows are transformed and submitted in waves so self references
//! resolve against rows mapped by earlier waves of the same type.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use crm_adapters::{
    ensure_positional, soql_quote, TargetError, TargetSystem, PROTOCOL_ERROR_CODE,
};
use crm_core::{
    value_as_string, AddressingMode, BatchOutcome, ConversionSummary, MappingOrigin, ObjectState,
    ObjectSummary, SourceRow, TransformedRecord, UploadRunSummary,
};
use crm_storage::{IdMappingStore, SourceStore};
use futures::stream::{self, StreamExt};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::classify::{Classification, FailureTally, ResultClassifier};
use crate::config::UploadOptions;
use crate::convert::LeadConverter;
use crate::graph::{DependencyGraph, GraphError};
use crate::prereq::PrerequisiteRunner;
use crate::resolver::ReferenceResolver;
use crate::rules::{Fallback, ObjectRules, Recovery, RuleSet, SubmissionMode};
use crate::transform::{FieldTransformer, UniqueKeys};

/// Per-run state threaded through every object pass.
struct RunContext {
    states: HashMap<String, ObjectState>,
    session_user: Option<Option<String>>,
}

impl RunContext {
    fn new() -> Self {
        Self {
            states: HashMap::new(),
            session_user: None,
        }
    }

    fn is_finished(&self, object: &str) -> bool {
        self.states.get(object).is_some_and(|s| s.is_terminal())
    }

    /// Queried once per run, on first use.
    async fn session_user(&mut self, target: &dyn TargetSystem, soql: &str) -> Option<String> {
        if self.session_user.is_none() {
            let user = match target.query(soql).await {
                Ok(rows) => rows
                    .first()
                    .and_then(|row| row.get("Id"))
                    .and_then(value_as_string),
                Err(err) => {
                    warn!(error = %err, "session user lookup failed");
                    None
                }
            };
            debug!(user = user.as_deref().unwrap_or("-"), "resolved session user");
            self.session_user = Some(user);
        }
        self.session_user.clone().flatten()
    }
}

/// Outcome code for rows the insert path left out because they are already mapped.
pub const ALREADY_MAPPED_CODE: &str = "ALREADY_MAPPED";

fn skip(mut summary: ObjectSummary, note: impl Into<String>) -> ObjectSummary {
    summary.state = ObjectState::Skipped;
    summary.note = Some(note.into());
    summary
}

/// True when an upsert was refused because the external id field cannot be used.
fn external_id_unavailable(err: &TargetError, field: &str) -> bool {
    let TargetError::Api { code, message, .. } = err else {
        return false;
    };
    let message = message.to_ascii_lowercase();
    let names_field = message.contains(&field.to_ascii_lowercase());
    (code == "NOT_FOUND" && names_field)
        || (names_field && message.contains("not accessible"))
        || message.contains("external id field")
}

struct Submitter<'a> {
    target: &'a dyn TargetSystem,
    mappings: &'a IdMappingStore,
    object: &'a str,
    external_id_field: Option<&'a str>,
    fallback: Fallback,
    concurrency: usize,
    downgraded: AtomicBool,
}

impl Submitter<'_> {
    fn inserting(&self) -> bool {
        self.external_id_field.is_none() || self.downgraded.load(Ordering::SeqCst)
    }

    /// Always returns one outcome per record, in submission order.
    async fn submit(&self, records: &[TransformedRecord]) -> Vec<BatchOutcome> {
        match self.submit_batch(records).await {
            Ok(outcomes) => outcomes,
            Err(err) if self.fallback == Fallback::RecordByRecord && records.len() > 1 => {
                warn!(
                    object = self.object,
                    error = %err,
                    "batch rejected, submitting record by record"
                );
                self.record_by_record(records).await
            }
            Err(err) => {
                warn!(object = self.object, count = records.len(), error = %err, "chunk failed");
                err.to_outcomes(records.len())
            }
        }
    }

    async fn submit_batch(
        &self,
        records: &[TransformedRecord],
    ) -> Result<Vec<BatchOutcome>, TargetError> {
        if let (Some(field), false) = (self.external_id_field, self.inserting()) {
            match self.target.upsert_batch(self.object, field, records).await {
                Ok(outcomes) => return ensure_positional(records.len(), outcomes),
                Err(err) if external_id_unavailable(&err, field) => {
                    if !self.downgraded.swap(true, Ordering::SeqCst) {
                        warn!(
                            object = self.object,
                            field,
                            "external id field unavailable, inserting instead"
                        );
                    }
                }
                Err(err) => return Err(err),
            }
        }

        self.insert_unmapped(records).await
    }

    /// Inserts have no external id to match on, so rows mapped by an earlier run
    /// are answered with `ALREADY_MAPPED` instead of being created again.
    async fn insert_unmapped(
        &self,
        records: &[TransformedRecord],
    ) -> Result<Vec<BatchOutcome>, TargetError> {
        let mut outcomes: Vec<Option<BatchOutcome>> = records
            .iter()
            .map(|record| {
                record
                    .source_id
                    .as_deref()
                    .filter(|id| self.mappings.contains(self.object, id))
                    .map(|_| BatchOutcome::failed(ALREADY_MAPPED_CODE, "source id already mapped"))
            })
            .collect();
        let fresh: Vec<TransformedRecord> = records
            .iter()
            .zip(&outcomes)
            .filter(|(_, outcome)| outcome.is_none())
            .map(|(record, _)| {
                let mut record = record.clone();
                if let Some(field) = self.external_id_field {
                    record.fields.remove(field);
                }
                record
            })
            .collect();

        if !fresh.is_empty() {
            let inserted = self.target.insert_batch(self.object, &fresh).await?;
            let mut inserted = ensure_positional(fresh.len(), inserted)?.into_iter();
            for slot in outcomes.iter_mut().filter(|slot| slot.is_none()) {
                *slot = inserted.next();
            }
        }
        Ok(outcomes
            .into_iter()
            .map(|outcome| {
                outcome.unwrap_or_else(|| {
                    BatchOutcome::failed(PROTOCOL_ERROR_CODE, "missing outcome")
                })
            })
            .collect())
    }

    async fn record_by_record(&self, records: &[TransformedRecord]) -> Vec<BatchOutcome> {
        stream::iter(records)
            .map(|record| async move {
                match self.submit_batch(std::slice::from_ref(record)).await {
                    Ok(mut outcomes) => outcomes.pop().unwrap_or_else(|| {
                        BatchOutcome::failed(PROTOCOL_ERROR_CODE, "empty response")
                    }),
                    Err(err) => BatchOutcome::failed(err.code(), err.to_string()),
                }
            })
            .buffered(self.concurrency.max(1))
            .collect()
            .await
    }
}

pub struct UploadPipeline {
    rules: Arc<RuleSet>,
    graph: DependencyGraph,
    source: Arc<dyn SourceStore>,
    target: Arc<dyn TargetSystem>,
    mappings: Arc<IdMappingStore>,
    options: UploadOptions,
}

impl UploadPipeline {
    pub fn new(
        rules: RuleSet,
        source: Arc<dyn SourceStore>,
        target: Arc<dyn TargetSystem>,
        mappings: Arc<IdMappingStore>,
        options: UploadOptions,
    ) -> Result<Self, GraphError> {
        let graph = DependencyGraph::build(&rules)?;
        Ok(Self {
            rules: Arc::new(rules),
            graph,
            source,
            target,
            mappings,
            options,
        })
    }

    pub fn upload_order(&self) -> &[String] {
        self.graph.order()
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    pub fn mappings(&self) -> &IdMappingStore {
        &self.mappings
    }

    pub async fn run(&self) -> Result<UploadRunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("upload_run", %run_id, dry_run = self.options.dry_run);
        self.run_with_id(run_id).instrument(span).await
    }

    async fn run_with_id(&self, run_id: Uuid) -> Result<UploadRunSummary> {
        let started_at = Utc::now();
        let mut ctx = RunContext::new();
        let mut objects = Vec::new();
        info!(objects = self.graph.order().len(), "upload started");

        for name in self.graph.order() {
            let Some(object) = self.rules.object(name) else {
                continue;
            };
            if !self.options.selects(name) {
                ctx.states.insert(name.clone(), ObjectState::Skipped);
                continue;
            }
            for target in self.graph.required_targets(name) {
                if !ctx.is_finished(target) {
                    bail!("{name} reached submission before its dependency {target} finished");
                }
            }

            let summary = self
                .upload_object(&mut ctx, object)
                .instrument(info_span!("object", object = %name))
                .await?;
            info!(
                object = %name,
                state = ?summary.state,
                uploaded = summary.uploaded,
                skipped = summary.skipped_count(),
                errors = summary.errors,
                note = summary.note.as_deref().unwrap_or(""),
                "object finished"
            );
            ctx.states.insert(name.clone(), summary.state);
            objects.push(summary);
        }

        let conversion = self.convert_leads(&ctx).await?;
        let summary = UploadRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            dry_run: self.options.dry_run,
            objects,
            conversion,
        };
        info!(
            uploaded = summary.total_uploaded(),
            skipped = summary.total_skipped(),
            errors = summary.total_errors(),
            "upload finished"
        );
        Ok(summary)
    }

    async fn convert_leads(&self, ctx: &RunContext) -> Result<Option<ConversionSummary>> {
        if !self.options.convert_leads || self.options.dry_run {
            return Ok(None);
        }
        let converter = LeadConverter::new(
            self.source.as_ref(),
            self.target.as_ref(),
            self.mappings.as_ref(),
            self.options.error_log_limit,
        );

        let mut total: Option<ConversionSummary> = None;
        for object in &self.rules.catalog.objects {
            let Some(conversion) = &object.conversion else {
                continue;
            };
            if ctx.states.get(&object.name) != Some(&ObjectState::Done) {
                continue;
            }
            let result = converter
                .convert(object, conversion)
                .instrument(info_span!("conversion", object = %object.name))
                .await?;
            let acc = total.get_or_insert_with(ConversionSummary::default);
            acc.candidates += result.candidates;
            acc.converted += result.converted;
            acc.errors += result.errors;
        }
        Ok(total)
    }

    /// Runs one object type through its whole state machine.
    async fn upload_object(
        &self,
        ctx: &mut RunContext,
        object: &ObjectRules,
    ) -> Result<ObjectSummary> {
        let name = object.name.as_str();
        let mut summary = ObjectSummary::pending(name);

        let mut rows = self
            .source
            .rows(name)
            .await
            .with_context(|| format!("reading {name} rows"))?;
        if let Some(limit) = self.options.limit_per_object {
            rows.truncate(limit);
        }
        summary.source_rows = rows.len();
        if rows.is_empty() {
            return Ok(skip(summary, "no source rows"));
        }
        if self.options.dry_run {
            return Ok(self.dry_run_object(object, &rows, summary));
        }

        let description = match self.target.describe(name).await {
            Ok(description) if description.exists => description,
            Ok(_) => return Ok(skip(summary, "object type not available in target")),
            Err(err) => {
                warn!(object = name, error = %err, "describe failed");
                return Ok(skip(summary, format!("describe failed: {err}")));
            }
        };
        let external_id_field = self.rules.external_id_field();
        let mode = if object.upsert && description.has_field(external_id_field) {
            AddressingMode::Upsert {
                external_id_field: external_id_field.to_string(),
            }
        } else {
            AddressingMode::Insert
        };
        summary.mode = Some(mode.clone());

        let runner = PrerequisiteRunner::new(
            self.target.as_ref(),
            self.source.as_ref(),
            self.mappings.as_ref(),
        );
        let preparation = runner.prepare(object, &rows).await?;
        if let Some(reason) = preparation.skip {
            return Ok(skip(summary, reason));
        }
        let mut keys = UniqueKeys::default();
        runner.seed_unique_keys(object, &mut keys).await;
        let session_user = if object.session_user_fields.is_empty() {
            None
        } else {
            ctx.session_user(self.target.as_ref(), &self.rules.catalog.session_user_query)
                .await
        };
        summary.state = ObjectState::Prepared;
        debug!(object = name, mode = ?mode, "prepared");

        let resolver =
            ReferenceResolver::new(&self.rules, self.mappings.as_ref(), session_user.as_deref());
        let transformer = FieldTransformer::new(
            &self.rules,
            object,
            resolver,
            mode.external_id_field(),
            &preparation.stamped,
        );
        let submitter = Submitter {
            target: self.target.as_ref(),
            mappings: self.mappings.as_ref(),
            object: name,
            external_id_field: mode.external_id_field(),
            fallback: object.submission.fallback,
            concurrency: self.options.concurrency,
            downgraded: AtomicBool::new(false),
        };
        let chunk_size = object
            .submission
            .chunk_size
            .unwrap_or(self.options.chunk_size)
            .max(1);
        let parallel = match object.submission.mode {
            SubmissionMode::Serial => 1,
            SubmissionMode::Concurrent => self.options.concurrency.max(1),
        };
        let classifier = ResultClassifier::new(&self.rules.benign);
        let mut tally = FailureTally::new(name, self.options.error_log_limit);

        for wave in rows.chunks(chunk_size * parallel) {
            let mut records = Vec::with_capacity(wave.len());
            for row in wave {
                if submitter.inserting() {
                    if let Some(id) = row.source_id() {
                        if self.mappings.contains(name, &id) {
                            summary.already_mapped += 1;
                            continue;
                        }
                    }
                }
                match transformer.transform(row, &mut keys) {
                    Ok(mut record) => {
                        if self.options.prune_unknown_fields {
                            record.fields.retain(|field, _| description.has_field(field));
                        }
                        records.push(record);
                    }
                    Err(reason) => {
                        summary.rejected += 1;
                        if summary.rejected <= self.options.error_log_limit {
                            info!(
                                object = name,
                                source_id = row.source_id().as_deref().unwrap_or("-"),
                                %reason,
                                "record rejected before submission"
                            );
                        } else {
                            debug!(object = name, %reason, "record rejected before submission");
                        }
                    }
                }
            }
            if records.is_empty() {
                continue;
            }

            let chunks: Vec<&[TransformedRecord]> = records.chunks(chunk_size).collect();
            summary.state = ObjectState::Submitted;
            let results: Vec<Vec<BatchOutcome>> = stream::iter(chunks.iter().copied())
                .map(|chunk| submitter.submit(chunk))
                .buffered(parallel)
                .collect()
                .await;

            for (chunk, outcomes) in chunks.iter().zip(&results) {
                self.reconcile(name, chunk, outcomes, &classifier, &mut tally, &mut summary)
                    .await?;
            }
        }

        summary.state = ObjectState::Reconciled;
        summary.benign = tally.benign;
        summary.recovered = tally.recovered;
        summary.errors = tally.errors;
        if !tally.error_codes.is_empty() {
            debug!(object = name, codes = ?tally.error_codes, "error codes");
        }
        summary.state = ObjectState::Done;
        Ok(summary)
    }

    /// Writes mappings for successes and classifies failures; a mapping write failure aborts.
    /// Recovered records are mapped as adopted so cleanup leaves them alone.
    async fn reconcile(
        &self,
        object: &str,
        records: &[TransformedRecord],
        outcomes: &[BatchOutcome],
        classifier: &ResultClassifier<'_>,
        tally: &mut FailureTally,
        summary: &mut ObjectSummary,
    ) -> Result<()> {
        let mut pairs = Vec::with_capacity(records.len());
        let mut adopted = Vec::new();
        for (record, outcome) in records.iter().zip(outcomes) {
            let source_id = record.source_id.as_deref();
            if !outcome.success && outcome.code() == ALREADY_MAPPED_CODE {
                summary.already_mapped += 1;
                continue;
            }
            summary.submitted += 1;
            if outcome.success {
                summary.uploaded += 1;
                if let (Some(source), Some(target)) = (source_id, outcome.target_id.as_deref()) {
                    pairs.push((source.to_string(), target.to_string()));
                }
                continue;
            }

            match classifier.classify(object, outcome) {
                Classification::Benign(rule) => match (&rule.recovery, source_id) {
                    (Some(Recovery::NaturalKey { field }), Some(source)) => {
                        match self.recover(object, field, record).await {
                            Some(target) => {
                                tally.record_recovered(rule, source, &target);
                                adopted.push((source.to_string(), target));
                            }
                            None => tally.record_error(outcome, source_id),
                        }
                    }
                    _ => tally.record_benign(rule, source_id),
                },
                Classification::Error => tally.record_error(outcome, source_id),
            }
        }

        let written = self
            .mappings
            .put_batch(object, &pairs)
            .await
            .with_context(|| format!("writing {object} mappings"))?;
        summary.mapped += written;
        if !adopted.is_empty() {
            summary.mapped += self
                .mappings
                .put_batch_as(object, &adopted, MappingOrigin::Adopted)
                .await
                .with_context(|| format!("writing adopted {object} mappings"))?;
        }
        Ok(())
    }

    /// Finds the pre-existing target record by a natural key field.
    async fn recover(
        &self,
        object: &str,
        field: &str,
        record: &TransformedRecord,
    ) -> Option<String> {
        let value = record.get_str(field)?;
        let soql = format!(
            "SELECT Id FROM {object} WHERE {field} = {} LIMIT 1",
            soql_quote(&value)
        );
        match self.target.query(&soql).await {
            Ok(rows) => rows
                .first()
                .and_then(|row| row.get("Id"))
                .and_then(value_as_string),
            Err(err) => {
                debug!(object, field, error = %err, "natural key lookup failed");
                None
            }
        }
    }

    fn dry_run_object(
        &self,
        object: &ObjectRules,
        rows: &[SourceRow],
        mut summary: ObjectSummary,
    ) -> ObjectSummary {
        let mode = if object.upsert {
            AddressingMode::Upsert {
                external_id_field: self.rules.external_id_field().to_string(),
            }
        } else {
            AddressingMode::Insert
        };
        let resolver = ReferenceResolver::new(&self.rules, self.mappings.as_ref(), None);
        let transformer =
            FieldTransformer::new(&self.rules, object, resolver, mode.external_id_field(), &[]);
        let mut keys = UniqueKeys::default();
        for row in rows {
            match transformer.transform(row, &mut keys) {
                Ok(_) => summary.submitted += 1,
                Err(reason) => {
                    summary.rejected += 1;
                    debug!(object = %object.name, %reason, "record rejected before submission");
                }
            }
        }
        info!(
            object = %object.name,
            would_submit = summary.submitted,
            rejected = summary.rejected,
            "dry run"
        );
        summary.mode = Some(mode);
        summary.state = ObjectState::Done;
        summary.note = Some("dry run: nothing submitted".to_string());
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api(code: &str, message: &str) -> TargetError {
        TargetError::Api {
            status: 404,
            code: code.to_string(),
            message: message.to_string(),
        }
    }

    #[test]
    fn inaccessible_external_id_errors_trigger_a_downgrade() {
        assert!(external_id_unavailable(
            &api(
                "NOT_FOUND",
                "Provided external ID field does not exist or is not accessible: OriginalId__c"
            ),
            "OriginalId__c"
        ));
        assert!(!external_id_unavailable(
            &api("NOT_FOUND", "The requested resource does not exist"),
            "OriginalId__c"
        ));
        assert!(!external_id_unavailable(
            &TargetError::Protocol("OriginalId__c".into()),
            "OriginalId__c"
        ));
    }
}
