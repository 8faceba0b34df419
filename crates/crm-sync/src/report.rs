//! Run reports written under `reports/<run_id>/`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use crm_core::{AddressingMode, UploadRunSummary};
use tokio::fs;
use tracing::info;

pub const SUMMARY_JSON: &str = "upload_summary.json";
pub const SUMMARY_MARKDOWN: &str = "upload_summary.md";

fn mode_label(mode: Option<&AddressingMode>) -> String {
    match mode {
        Some(AddressingMode::Upsert { external_id_field }) => {
            format!("upsert ({external_id_field})")
        }
        Some(AddressingMode::Insert) => "insert".to_string(),
        None => "-".to_string(),
    }
}

pub fn render_markdown(summary: &UploadRunSummary) -> String {
    let mut lines = vec![
        "# CRM Upload Summary".to_string(),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
        format!("- Started: {}", summary.started_at),
        format!("- Finished: {}", summary.finished_at),
        format!("- Dry run: {}", summary.dry_run),
        format!("- Uploaded: {}", summary.total_uploaded()),
        format!("- Skipped: {}", summary.total_skipped()),
        format!("- Errors: {}", summary.total_errors()),
        String::new(),
        "## Objects".to_string(),
        String::new(),
        "| object | state | mode | rows | uploaded | skipped | errors | mapped | note |".to_string(),
        "|---|---|---|---:|---:|---:|---:|---:|---|".to_string(),
    ];
    for object in &summary.objects {
        lines.push(format!(
            "| {} | {:?} | {} | {} | {} | {} | {} | {} | {} |",
            object.object,
            object.state,
            mode_label(object.mode.as_ref()),
            object.source_rows,
            object.uploaded,
            object.skipped_count(),
            object.errors,
            object.mapped,
            object.note.as_deref().unwrap_or("")
        ));
    }

    if let Some(conversion) = &summary.conversion {
        lines.push(String::new());
        lines.push("## Lead Conversion".to_string());
        lines.push(String::new());
        lines.push(format!("- Candidates: {}", conversion.candidates));
        lines.push(format!("- Converted: {}", conversion.converted));
        lines.push(format!("- Errors: {}", conversion.errors));
    }
    lines.push(String::new());
    lines.join("\n")
}

/// Writes the JSON and Markdown summaries and returns the run's report directory.
pub async fn write_run_report(reports_root: &Path, summary: &UploadRunSummary) -> Result<PathBuf> {
    let reports_dir = reports_root.join(summary.run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing upload summary")?;
    fs::write(reports_dir.join(SUMMARY_JSON), json)
        .await
        .with_context(|| format!("writing {SUMMARY_JSON}"))?;
    fs::write(reports_dir.join(SUMMARY_MARKDOWN), render_markdown(summary))
        .await
        .with_context(|| format!("writing {SUMMARY_MARKDOWN}"))?;

    info!(dir = %reports_dir.display(), "wrote run report");
    Ok(reports_dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crm_core::{ObjectState, ObjectSummary};
    use uuid::Uuid;

    fn summary() -> UploadRunSummary {
        let mut account = ObjectSummary::pending("Account");
        account.state = ObjectState::Done;
        account.mode = Some(AddressingMode::Upsert {
            external_id_field: "OriginalId__c".into(),
        });
        account.source_rows = 3;
        account.uploaded = 2;
        account.errors = 1;
        account.mapped = 2;
        UploadRunSummary {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            dry_run: false,
            objects: vec![
                account,
                ObjectSummary::skipped("LiveChatTranscript", "object type not available in target"),
            ],
            conversion: None,
        }
    }

    #[test]
    fn markdown_lists_every_object() {
        let text = render_markdown(&summary());
        assert!(text.contains("| Account | Done | upsert (OriginalId__c) | 3 | 2 | 0 | 1 | 2 |  |"));
        assert!(text.contains("| LiveChatTranscript | Skipped | - |"));
        assert!(text.contains("- Uploaded: 2"));
        assert!(!text.contains("Lead Conversion"));
    }

    #[tokio::test]
    async fn reports_land_in_a_run_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let summary = summary();

        let written = write_run_report(dir.path(), &summary).await.expect("write");
        assert_eq!(written, dir.path().join(summary.run_id.to_string()));

        let json = std::fs::read_to_string(written.join(SUMMARY_JSON)).expect("json");
        let parsed: UploadRunSummary = serde_json::from_str(&json).expect("parse");
        assert_eq!(parsed.objects.len(), 2);
        assert!(written.join(SUMMARY_MARKDOWN).exists());
    }
}
