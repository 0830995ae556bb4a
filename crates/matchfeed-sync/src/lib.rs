//! Ingestion pipeline: source registry, reconciliation, the scrape worker,
//! fixture aggregation and the job orchestrator that supervises workers.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use matchfeed_adapters::{
    AnalysisCaller, DisabledAnalysis, HtmlSourceAdapter, HttpAnalysisCaller, HttpAnalysisConfig, SourceAdapter,
};
use matchfeed_storage::{HttpClientConfig, HttpFetcher, RemoteStore, RestStore, StoreConfig};
use serde::Deserialize;
use tokio::fs;

pub mod fixtures;
pub mod orchestrator;
pub mod progress;
pub mod reconcile;
pub mod status;
pub mod worker;

pub use fixtures::{FixtureAggregator, FixturesReport};
pub use orchestrator::{
    maybe_build_scheduler, write_job_report, JobHandle, JobOrchestrator, OrchestratorConfig, OrchestratorError,
    SelfExecLauncher, WorkerLauncher,
};
pub use progress::{overall_progress, ProgressClassifier, ProgressEvent, ProgressLine, ProgressTracker};
pub use reconcile::{PlannedAction, Reconciler, SyncPlan, SyncRecord, SyncSummary, FIXTURES_TABLE, MATCHES_TABLE};
pub use status::StatusBroadcaster;
pub use worker::{ScrapeOptions, ScrapeReport, ScrapeWorker};

pub const CRATE_NAME: &str = "matchfeed-sync";

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

impl SourceRegistry {
    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }

    pub fn get(&self, source_id: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.source_id == source_id)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    /// League label written to the store.
    pub league: String,
    pub enabled: bool,
    pub results_url: String,
    #[serde(default)]
    pub fixtures_url: Option<String>,
    /// The source publishes no commentary worth analysing.
    #[serde(default)]
    pub skip_commentary: bool,
}

pub async fn load_source_registry(workspace_root: &Path) -> Result<SourceRegistry> {
    let path = workspace_root.join("sources.yaml");
    let text = fs::read_to_string(&path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub page_size: usize,
    pub source_pause_secs: u64,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub web_port: u16,
    pub analysis_api_key: Option<String>,
    pub analysis_model: String,
    pub artifacts_dir: PathBuf,
    pub workspace_root: PathBuf,
}

fn env_parse<T: std::str::FromStr>(var: &str, default: T) -> T {
    std::env::var(var)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            page_size: env_parse("MATCHFEED_PAGE_SIZE", 1000),
            source_pause_secs: env_parse("MATCHFEED_SOURCE_PAUSE_SECS", 5),
            scheduler_enabled: std::env::var("MATCHFEED_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("MATCHFEED_SYNC_CRON").unwrap_or_else(|_| "0 0 0 * * *".to_string()),
            user_agent: std::env::var("MATCHFEED_USER_AGENT").unwrap_or_else(|_| "matchfeed-bot/0.1".to_string()),
            http_timeout_secs: env_parse("MATCHFEED_HTTP_TIMEOUT_SECS", 20),
            web_port: env_parse("MATCHFEED_WEB_PORT", 8000),
            analysis_api_key: std::env::var("ANALYSIS_API_KEY").ok().filter(|k| !k.trim().is_empty()),
            analysis_model: std::env::var("ANALYSIS_MODEL").unwrap_or_else(|_| "gemini-2.5-flash".to_string()),
            artifacts_dir: std::env::var("ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./artifacts")),
            workspace_root: PathBuf::from("."),
        }
    }

    pub fn source_pause(&self) -> Duration {
        Duration::from_secs(self.source_pause_secs)
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.workspace_root.join("reports")
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..HttpClientConfig::default()
        }
    }

    /// Fails when `STORE_URL`/`STORE_KEY` are absent; nothing can be reconciled without them.
    pub fn connect_store(&self) -> Result<Arc<dyn RemoteStore>> {
        let config = StoreConfig::from_env().context("remote store is not configured")?;
        let store = RestStore::new(config).context("building store client")?;
        Ok(Arc::new(store))
    }

    pub fn reconciler(&self) -> Result<Reconciler> {
        Ok(Reconciler::new(self.connect_store()?, self.page_size))
    }

    pub fn analysis_caller(&self) -> Result<Arc<dyn AnalysisCaller>> {
        match &self.analysis_api_key {
            Some(key) => {
                let caller = HttpAnalysisCaller::new(HttpAnalysisConfig::new(key.clone(), self.analysis_model.clone()))?;
                Ok(Arc::new(caller))
            }
            None => Ok(Arc::new(DisabledAnalysis)),
        }
    }
}

/// Builds the adapter serving a source.
pub trait AdapterFactory: Send + Sync {
    fn adapter_for(&self, source: &SourceConfig) -> Arc<dyn SourceAdapter>;
}

#[derive(Debug, Clone)]
pub struct HtmlAdapterFactory {
    http: HttpFetcher,
}

impl HtmlAdapterFactory {
    pub fn new(config: &SyncConfig) -> Result<Self> {
        Ok(Self {
            http: HttpFetcher::new(config.http_client_config())?,
        })
    }
}

impl AdapterFactory for HtmlAdapterFactory {
    fn adapter_for(&self, source: &SourceConfig) -> Arc<dyn SourceAdapter> {
        Arc::new(HtmlSourceAdapter::new(source.source_id.clone(), self.http.clone()))
    }
}
