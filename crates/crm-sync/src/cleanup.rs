//! Deletes target records recorded in the mapping store, dependants first.
//! Records the migration adopted rather than created are left in place.

use anyhow::{Context, Result};
use crm_adapters::TargetSystem;
use crm_core::MappingOrigin;
use crm_storage::IdMappingStore;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{info, warn};

/// Error codes meaning the record is already gone from the target.
const ALREADY_GONE: &[&str] = &["ENTITY_IS_DELETED", "INVALID_CROSS_REFERENCE_KEY", "NOT_FOUND"];

#[derive(Debug, Clone)]
pub struct CleanupOptions {
    /// Without confirmation nothing is deleted; the report lists what would be.
    pub confirm: bool,
    pub object: Option<String>,
    pub concurrency: usize,
    pub error_log_limit: usize,
}

impl Default for CleanupOptions {
    fn default() -> Self {
        Self {
            confirm: false,
            object: None,
            concurrency: 4,
            error_log_limit: 5,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupObjectReport {
    pub object: String,
    pub mapped: usize,
    /// Pre-existing records the migration mapped but did not create.
    pub adopted: usize,
    pub deleted: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub confirmed: bool,
    pub objects: Vec<CleanupObjectReport>,
}

impl CleanupReport {
    pub fn total_mapped(&self) -> usize {
        self.objects.iter().map(|o| o.mapped).sum()
    }

    pub fn total_adopted(&self) -> usize {
        self.objects.iter().map(|o| o.adopted).sum()
    }

    pub fn total_deleted(&self) -> usize {
        self.objects.iter().map(|o| o.deleted).sum()
    }

    pub fn total_failed(&self) -> usize {
        self.objects.iter().map(|o| o.failed).sum()
    }
}

/// Reverse upload order, then any mapped types the catalogue does not upload directly.
pub fn cleanup_order<I>(upload_order: &[String], mapped_types: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut order: Vec<String> = upload_order.iter().rev().cloned().collect();
    for object in mapped_types {
        if !order.contains(&object) {
            order.push(object);
        }
    }
    order
}

pub async fn delete_mapped_records(
    upload_order: &[String],
    target: &dyn TargetSystem,
    mappings: &IdMappingStore,
    options: &CleanupOptions,
) -> Result<CleanupReport> {
    let counts = mappings.counts();
    let mut report = CleanupReport {
        confirmed: options.confirm,
        objects: Vec::new(),
    };

    for object in cleanup_order(upload_order, counts.keys().cloned()) {
        if options.object.as_ref().is_some_and(|only| *only != object) {
            continue;
        }
        let mapped = counts.get(&object).copied().unwrap_or_default();
        if mapped == 0 {
            continue;
        }
        let (created, adopted): (Vec<_>, Vec<_>) = mappings
            .mappings_for(&object)
            .await
            .with_context(|| format!("reading {object} mappings"))?
            .into_iter()
            .partition(|record| record.origin == MappingOrigin::Created);
        let mut entry = CleanupObjectReport {
            object: object.clone(),
            mapped,
            adopted: adopted.len(),
            ..CleanupObjectReport::default()
        };
        if !options.confirm {
            info!(
                object = %object,
                would_delete = created.len(),
                adopted = entry.adopted,
                "would delete"
            );
            report.objects.push(entry);
            continue;
        }

        let results: Vec<_> = stream::iter(created)
            .map(|record| async move {
                let result = target.delete(&record.object_type, &record.target_id).await;
                (record, result)
            })
            .buffer_unordered(options.concurrency.max(1))
            .collect()
            .await;

        let mut removed = Vec::with_capacity(results.len());
        for (record, result) in results {
            match result {
                Ok(()) => removed.push(record.source_id),
                Err(err)
                    if err.status() == Some(404)
                        || ALREADY_GONE.iter().any(|code| *code == err.code()) =>
                {
                    removed.push(record.source_id)
                }
                Err(err) => {
                    entry.failed += 1;
                    if entry.failed <= options.error_log_limit {
                        warn!(
                            object = %object,
                            target_id = %record.target_id,
                            error = %err,
                            "delete failed"
                        );
                    }
                }
            }
        }
        entry.deleted = removed.len();
        mappings
            .remove_batch(&object, &removed)
            .await
            .with_context(|| format!("removing {object} mappings"))?;
        info!(
            object = %object,
            deleted = entry.deleted,
            failed = entry.failed,
            kept = entry.adopted,
            "deleted records"
        );
        report.objects.push(entry);
    }
    Ok(report)
}
