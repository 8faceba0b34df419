use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use crm_adapters::TargetSystem;
use crm_core::UploadRunSummary;
use crm_storage::IdMappingStore;
use crm_sync::{
    connect, delete_mapped_records, run_upload, CleanupOptions, DependencyGraph, OrgType, RuleSet,
    UploadConfig,
};
use tracing::info;
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "crm-cli")]
#[command(about = "CRM data migration command-line interface")]
struct Cli {
    /// Target org: original, b2b or b2c.
    #[arg(long, global = true, default_value = "original")]
    org: OrgType,

    /// Also write log output to this file.
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Upload every object type in dependency order.
    Upload(UploadArgs),
    /// Inspect or reset the id mapping store.
    Mappings {
        #[command(subcommand)]
        action: MappingsAction,
    },
    /// Delete target records recorded in the mapping store.
    Cleanup {
        #[arg(long)]
        confirm: bool,
        #[arg(long)]
        object: Option<String>,
    },
    /// Print the derived upload order.
    Order,
    TestConnection,
}

#[derive(Debug, Default, clap::Args)]
struct UploadArgs {
    #[arg(long)]
    dry_run: bool,
    /// Maximum rows per object type.
    #[arg(long)]
    limit: Option<usize>,
    #[arg(long, value_delimiter = ',')]
    only: Vec<String>,
    #[arg(long, value_delimiter = ',')]
    skip: Vec<String>,
    /// Start from an empty mapping store.
    #[arg(long)]
    clear_mappings: bool,
    #[arg(long)]
    prune_unknown_fields: bool,
    #[arg(long)]
    no_convert_leads: bool,
}

#[derive(Debug, Subcommand)]
enum MappingsAction {
    Show {
        #[arg(long)]
        object: Option<String>,
    },
    Clear {
        #[arg(long)]
        object: Option<String>,
    },
}

fn setup_logging(verbose: bool, log_file: Option<&PathBuf>) -> Result<()> {
    let level = if verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
    let writer = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent).context("creating log directory")?;
            }
            let file = fs::File::create(path)
                .with_context(|| format!("creating log file {}", path.display()))?;
            BoxMakeWriter::new(std::io::stderr.and(Arc::new(file)))
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };

    tracing_subscriber::fmt()
        .with_writer(writer)
        .with_ansi(false)
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .init();
    Ok(())
}

fn print_summary(summary: &UploadRunSummary) {
    for object in &summary.objects {
        println!(
            "{:<28} {:<10} uploaded={} skipped={} errors={} mapped={}{}",
            object.object,
            format!("{:?}", object.state),
            object.uploaded,
            object.skipped_count(),
            object.errors,
            object.mapped,
            object
                .note
                .as_deref()
                .map(|note| format!(" ({note})"))
                .unwrap_or_default()
        );
    }
    if let Some(conversion) = &summary.conversion {
        println!(
            "lead conversion: candidates={} converted={} errors={}",
            conversion.candidates, conversion.converted, conversion.errors
        );
    }
    println!(
        "upload complete: run_id={} uploaded={} skipped={} errors={} dry_run={}",
        summary.run_id,
        summary.total_uploaded(),
        summary.total_skipped(),
        summary.total_errors(),
        summary.dry_run
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose, cli.log_file.as_ref())?;
    let mut config = UploadConfig::from_env(cli.org);
    info!(org = %cli.org, source = %config.source_db.display(), "configuration loaded");

    match cli.command.unwrap_or(Commands::Upload(UploadArgs::default())) {
        Commands::Upload(args) => {
            config.options.dry_run = args.dry_run;
            config.options.limit_per_object = args.limit;
            config.options.only = args.only;
            config.options.skip = args.skip;
            config.options.prune_unknown_fields = args.prune_unknown_fields;
            config.options.convert_leads = !args.no_convert_leads;

            let run = run_upload(&config, args.clear_mappings).await?;
            print_summary(&run.summary);
            println!("report: {}", run.report_dir.display());
        }
        Commands::Mappings { action } => {
            let store = IdMappingStore::open(&config.mapping_db)
                .await
                .with_context(|| format!("opening mapping store {}", config.mapping_db.display()))?;
            match action {
                MappingsAction::Show { object } => {
                    let counts = store.counts();
                    for (object_type, count) in counts
                        .iter()
                        .filter(|(name, _)| object.as_deref().map_or(true, |o| o == name.as_str()))
                    {
                        println!("{object_type:<28} {count}");
                    }
                    println!("total: {}", store.count(object.as_deref()));
                }
                MappingsAction::Clear { object } => {
                    let removed = store.clear(object.as_deref()).await?;
                    println!(
                        "cleared {removed} mappings ({})",
                        object.as_deref().unwrap_or("all object types")
                    );
                }
            }
            store.close().await;
        }
        Commands::Cleanup { confirm, object } => {
            let rules = RuleSet::load(config.rules_dir.as_deref())?;
            let graph = DependencyGraph::build(&rules)?;
            let target = connect(&config)?;
            let store = IdMappingStore::open(&config.mapping_db)
                .await
                .with_context(|| format!("opening mapping store {}", config.mapping_db.display()))?;
            let options = CleanupOptions {
                confirm,
                object,
                concurrency: config.options.concurrency,
                error_log_limit: config.options.error_log_limit,
            };
            let report = delete_mapped_records(graph.order(), &target, &store, &options).await?;
            for entry in &report.objects {
                println!(
                    "{:<28} mapped={} adopted={} deleted={} failed={}",
                    entry.object, entry.mapped, entry.adopted, entry.deleted, entry.failed
                );
            }
            if report.confirmed {
                println!(
                    "cleanup complete: deleted={} failed={} kept={}",
                    report.total_deleted(),
                    report.total_failed(),
                    report.total_adopted()
                );
            } else {
                println!(
                    "would delete {} records (keeping {} adopted); rerun with --confirm",
                    report.total_mapped() - report.total_adopted(),
                    report.total_adopted()
                );
            }
            store.close().await;
        }
        Commands::Order => {
            let rules = RuleSet::load(config.rules_dir.as_deref())?;
            let graph = DependencyGraph::build(&rules)?;
            for (position, object) in graph.order().iter().enumerate() {
                let required: Vec<&str> = graph.required_targets(object).into_iter().collect();
                if required.is_empty() {
                    println!("{:>3}. {object}", position + 1);
                } else {
                    println!("{:>3}. {object} (after {})", position + 1, required.join(", "));
                }
            }
        }
        Commands::TestConnection => {
            let target = connect(&config)?;
            let rows = target
                .query("SELECT Id FROM User LIMIT 1")
                .await
                .context("querying target org")?;
            println!("connection ok: org={} rows={}", cli.org, rows.len());
        }
    }

    Ok(())
}
