use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use matchfeed_core::{FixtureRecord, MatchRecord, SourceStatus};
use matchfeed_storage::ArtifactStore;
use matchfeed_sync::{
    load_source_registry, AdapterFactory, FixtureAggregator, HtmlAdapterFactory, JobOrchestrator, OrchestratorConfig,
    PlannedAction, ProgressLine, Reconciler, ScrapeOptions, ScrapeWorker, SelfExecLauncher, SourceConfig,
    StatusBroadcaster, SyncConfig, SyncRecord,
};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "matchfeed")]
#[command(about = "Match statistics ingestion pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run an ingestion job: one worker per enabled source, then fixtures.
    Run {
        /// Only this source; skips the fixtures step.
        #[arg(long)]
        source: Option<String>,
    },
    /// Scrape one source. Prints the progress protocol on stdout.
    Scrape {
        source: String,
        #[arg(long)]
        last_round: bool,
        #[arg(long)]
        skip_analysis: bool,
        /// Save the batch as an artifact instead of syncing it.
        #[arg(long)]
        skip_sync: bool,
        #[arg(long)]
        force_rescrape: bool,
        #[arg(long, num_args = 1..)]
        match_urls: Vec<String>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Fetch and reconcile fixtures for every enabled source.
    Fixtures {
        #[arg(long)]
        source: Option<String>,
    },
    /// Reconcile a saved batch file.
    Sync {
        file: PathBuf,
        #[arg(long, value_enum, default_value_t = Table::Matches)]
        table: Table,
        /// Print the plan without writing.
        #[arg(long)]
        dry_run: bool,
    },
    Serve,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Table {
    Matches,
    Fixtures,
}

/// Logs go to stderr; stdout carries the worker progress protocol.
fn init_tracing() {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = fmt::layer().with_target(false).with_writer(std::io::stderr);
    let _ = tracing_subscriber::registry().with(filter).with(fmt_layer.compact()).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command {
        Commands::Run { source } => run_job(&config, source).await,
        Commands::Scrape {
            source,
            last_round,
            skip_analysis,
            skip_sync,
            force_rescrape,
            match_urls,
            limit,
        } => {
            let options = ScrapeOptions {
                last_round,
                skip_analysis,
                skip_sync,
                force_rescrape,
                match_urls,
                limit,
            };
            scrape(&config, &source, &options).await
        }
        Commands::Fixtures { source } => fixtures(&config, source.as_deref()).await,
        Commands::Sync { file, table, dry_run } => {
            let reconciler = config.reconciler()?;
            match table {
                Table::Matches => {
                    let records: Vec<MatchRecord> = ArtifactStore::load_json(&file).await?;
                    sync_batch(&reconciler, &records, dry_run).await
                }
                Table::Fixtures => {
                    let records: Vec<FixtureRecord> = ArtifactStore::load_json(&file).await?;
                    sync_batch(&reconciler, &records, dry_run).await
                }
            }
        }
        Commands::Serve => matchfeed_web::serve_from_env().await,
    }
}

async fn run_job(config: &SyncConfig, source: Option<String>) -> Result<()> {
    config.connect_store()?;
    let registry = load_source_registry(&config.workspace_root).await?;
    let orchestrator = JobOrchestrator::new(
        Arc::new(SelfExecLauncher::current_exe()?),
        StatusBroadcaster::new(),
        registry.enabled().map(|s| s.source_id.clone()).collect(),
        OrchestratorConfig::from_sync_config(config),
    )?;

    let job = orchestrator.run(source).await?;
    println!(
        "job {} finished: succeeded={} failed={} pending={} stopped={}",
        job.job_id,
        job.count(SourceStatus::Success),
        job.count(SourceStatus::Failed),
        job.count(SourceStatus::Pending),
        job.stopped
    );
    Ok(())
}

async fn scrape(config: &SyncConfig, source_id: &str, options: &ScrapeOptions) -> Result<()> {
    let registry = load_source_registry(&config.workspace_root).await?;
    let source = registry
        .get(source_id)
        .cloned()
        .with_context(|| format!("unknown source `{source_id}`"))?;
    let reconciler = if options.skip_sync {
        None
    } else {
        Some(config.reconciler()?)
    };

    let adapter = HtmlAdapterFactory::new(config)?.adapter_for(&source);
    let worker = ScrapeWorker::new(
        source,
        adapter,
        config.analysis_caller()?,
        reconciler,
        ArtifactStore::new(config.artifacts_dir.clone()),
    );
    let report = worker.run(options, &mut std::io::stdout()).await?;
    info!(
        source = source_id,
        found = report.found,
        scraped = report.scraped,
        failed = report.failed_extractions,
        "worker done"
    );
    Ok(())
}

async fn fixtures(config: &SyncConfig, only: Option<&str>) -> Result<()> {
    let reconciler = config.reconciler()?;
    let registry = load_source_registry(&config.workspace_root).await?;
    let sources: Vec<SourceConfig> = registry
        .enabled()
        .filter(|s| only.is_none_or(|id| s.source_id == id))
        .cloned()
        .collect();
    if let Some(id) = only {
        if sources.is_empty() {
            bail!("unknown or disabled source `{id}`");
        }
    }

    let adapters = HtmlAdapterFactory::new(config)?;
    let report = FixtureAggregator::new(reconciler)
        .run(&sources, &adapters, Utc::now(), &mut std::io::stdout())
        .await?;
    info!(
        fetched = report.fetched,
        failed_sources = report.failed_sources.len(),
        "fixtures done"
    );
    Ok(())
}

async fn sync_batch<R: SyncRecord>(reconciler: &Reconciler, records: &[R], dry_run: bool) -> Result<()> {
    if !dry_run {
        let summary = reconciler.sync(records).await?;
        println!("{}", ProgressLine::Persisted(summary));
        return Ok(());
    }

    let plan = reconciler.plan(records).await?;
    for entry in &plan.entries {
        match &entry.action {
            PlannedAction::New { .. } => println!("NEW        {}", entry.identity),
            PlannedAction::Changed { patch, .. } => {
                let fields = patch.keys().map(String::as_str).collect::<Vec<_>>().join(",");
                println!("CHANGED    {} [{fields}]", entry.identity);
            }
            PlannedAction::Unchanged { .. } => println!("UNCHANGED  {}", entry.identity),
            PlannedAction::Invalid { reason } => println!("INVALID    {}: {reason}", entry.identity),
        }
    }
    println!(
        "plan for {}: new={} changed={} unchanged={} invalid={} superseded={}",
        plan.table,
        plan.count(|a| matches!(a, PlannedAction::New { .. })),
        plan.count(|a| matches!(a, PlannedAction::Changed { .. })),
        plan.count(|a| matches!(a, PlannedAction::Unchanged { .. })),
        plan.count(|a| matches!(a, PlannedAction::Invalid { .. })),
        plan.superseded
    );
    Ok(())
}
