//! Upload orchestration: rule catalogue, dependency ordering, record transformation,
//! submission, reconciliation and the lead-conversion and cleanup passes.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use crm_adapters::{SalesforceClient, SessionCredentials};
use crm_core::UploadRunSummary;
use crm_storage::{IdMappingStore, SqliteSourceStore};
use tracing::info;

pub mod classify;
pub mod cleanup;
pub mod config;
pub mod convert;
pub mod graph;
pub mod pipeline;
pub mod prereq;
pub mod report;
pub mod resolver;
pub mod rules;
pub mod transform;

pub use cleanup::{delete_mapped_records, CleanupOptions, CleanupReport};
pub use config::{OrgType, UploadConfig, UploadOptions};
pub use graph::{DependencyGraph, GraphError};
pub use pipeline::UploadPipeline;
pub use report::write_run_report;
pub use rules::{RuleError, RuleSet};

pub const CRATE_NAME: &str = "crm-sync";

/// Builds the REST client for the configured org from `{prefix}_INSTANCE_URL`
/// and `{prefix}_ACCESS_TOKEN`.
pub fn connect(config: &UploadConfig) -> Result<SalesforceClient> {
    let prefix = config.org.credential_prefix();
    let credentials = SessionCredentials::from_env(prefix)
        .with_context(|| format!("loading {} org credentials", config.org))?;
    SalesforceClient::new(credentials, &config.api_version, &config.http)
}

#[derive(Debug, Clone)]
pub struct UploadRun {
    pub summary: UploadRunSummary,
    pub report_dir: PathBuf,
}

pub async fn run_upload(config: &UploadConfig, clear_mappings: bool) -> Result<UploadRun> {
    let rules = RuleSet::load(config.rules_dir.as_deref()).context("loading rule catalogue")?;
    let source = SqliteSourceStore::open(&config.source_db)
        .await
        .with_context(|| format!("opening source snapshot {}", config.source_db.display()))?;
    let target = connect(config)?;
    let mappings = IdMappingStore::open(&config.mapping_db)
        .await
        .with_context(|| format!("opening mapping store {}", config.mapping_db.display()))?;
    if clear_mappings {
        let removed = mappings.clear(None).await.context("clearing mappings")?;
        info!(removed, "cleared id mappings");
    }

    let pipeline = UploadPipeline::new(
        rules,
        Arc::new(source),
        Arc::new(target),
        Arc::new(mappings),
        config.options.clone(),
    )?;
    let summary = pipeline.run().await?;
    let report_dir = write_run_report(&config.reports_dir, &summary).await?;
    Ok(UploadRun {
        summary,
        report_dir,
    })
}

pub async fn run_upload_from_env(org: OrgType) -> Result<UploadRun> {
    let config = UploadConfig::from_env(org);
    run_upload(&config, false).await
}
