//! Body of the per-source scrape subprocess. Progress goes to the supplied
//! writer as [`ProgressLine`]s; diagnostics go through `tracing`.

use std::collections::HashSet;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use matchfeed_adapters::{
    analyze_with_backoff, build_match_record, coerce_stats, AnalysisCaller, AnalysisRequest, ExtractedPage,
    ListedMatch, SourceAdapter, PLACEHOLDER_ROUND,
};
use matchfeed_core::{AnalysisOutcome, MatchRecord};
use matchfeed_storage::{ArtifactStore, BackoffPolicy};
use serde::Serialize;
use tracing::{info, warn};

use crate::progress::ProgressLine;
use crate::reconcile::{Reconciler, SyncSummary};
use crate::SourceConfig;

#[derive(Debug, Clone, Default)]
pub struct ScrapeOptions {
    pub last_round: bool,
    pub skip_analysis: bool,
    pub skip_sync: bool,
    pub force_rescrape: bool,
    pub match_urls: Vec<String>,
    pub limit: Option<usize>,
}

impl ScrapeOptions {
    /// Explicitly listed URLs are always scraped again.
    pub fn rescrapes_stored(&self) -> bool {
        self.force_rescrape || !self.match_urls.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ScrapeReport {
    pub found: usize,
    pub scraped: usize,
    pub skipped_existing: usize,
    pub failed_extractions: usize,
    pub summary: Option<SyncSummary>,
    pub artifact: Option<PathBuf>,
}

pub struct ScrapeWorker {
    source: SourceConfig,
    adapter: Arc<dyn SourceAdapter>,
    analysis: Arc<dyn AnalysisCaller>,
    analysis_backoff: BackoffPolicy,
    reconciler: Option<Reconciler>,
    artifacts: ArtifactStore,
}

fn emit(out: &mut (dyn Write + Send), line: impl std::fmt::Display) -> Result<()> {
    writeln!(out, "{line}").context("writing progress line")?;
    out.flush().context("flushing progress line")
}

impl ScrapeWorker {
    /// `reconciler` is `None` when the batch is only saved, never synced.
    pub fn new(
        source: SourceConfig,
        adapter: Arc<dyn SourceAdapter>,
        analysis: Arc<dyn AnalysisCaller>,
        reconciler: Option<Reconciler>,
        artifacts: ArtifactStore,
    ) -> Self {
        Self {
            source,
            adapter,
            analysis,
            analysis_backoff: BackoffPolicy::default(),
            reconciler,
            artifacts,
        }
    }

    pub fn with_analysis_backoff(mut self, policy: BackoffPolicy) -> Self {
        self.analysis_backoff = policy;
        self
    }

    pub async fn run(&self, options: &ScrapeOptions, out: &mut (dyn Write + Send)) -> Result<ScrapeReport> {
        let source_id = self.source.source_id.as_str();
        let mut report = ScrapeReport::default();
        let reconciler = if options.skip_sync { None } else { self.reconciler.as_ref() };

        let stored = match reconciler {
            Some(reconciler) if !options.rescrapes_stored() => self.stored_urls(reconciler).await?,
            _ => HashSet::new(),
        };

        let listed: Vec<ListedMatch> = if options.match_urls.is_empty() {
            self.adapter
                .fetch_listing(&self.source.results_url, options.last_round)
                .await
                .with_context(|| format!("listing matches for {source_id}"))?
        } else {
            options
                .match_urls
                .iter()
                .map(|url| ListedMatch {
                    url: url.clone(),
                    round_label: PLACEHOLDER_ROUND.to_string(),
                })
                .collect()
        };
        report.found = listed.len();
        emit(out, ProgressLine::Found { total: listed.len() })?;

        let mut records: Vec<MatchRecord> = Vec::new();
        for (i, listed_match) in listed.iter().enumerate() {
            if options.limit.is_some_and(|limit| records.len() >= limit) {
                info!(source = source_id, limit = ?options.limit, "record limit reached");
                break;
            }
            emit(
                out,
                ProgressLine::Item {
                    index: i + 1,
                    total: listed.len(),
                },
            )?;

            if !options.rescrapes_stored() && stored.contains(&listed_match.url) {
                report.skipped_existing += 1;
                continue;
            }

            let page = match self.adapter.fetch_detail(&listed_match.url).await {
                Ok(page) => page,
                Err(err) => {
                    warn!(source = source_id, url = %listed_match.url, error = %err, "extraction failed; skipping");
                    report.failed_extractions += 1;
                    continue;
                }
            };

            let analysis = self.analyse(options, &page).await;
            records.push(build_match_record(&self.source.league, listed_match, &page, analysis));
        }
        report.scraped = records.len();

        match reconciler {
            Some(reconciler) => {
                emit(out, ProgressLine::FinalSync { records: records.len() })?;
                let summary = match reconciler.sync(&records).await {
                    Ok(summary) => summary,
                    Err(err) => {
                        // Replayable with `matchfeed sync <file>`.
                        match self.save_batch(&records).await {
                            Ok(path) => {
                                warn!(source = source_id, path = %path.display(), "sync failed; batch saved for replay")
                            }
                            Err(save_err) => {
                                warn!(source = source_id, error = %save_err, "sync failed and batch could not be saved")
                            }
                        }
                        return Err(err).with_context(|| format!("syncing {source_id}"));
                    }
                };
                emit(out, ProgressLine::Persisted(summary))?;
                report.summary = Some(summary);
            }
            None => {
                let path = self.save_batch(&records).await?;
                emit(out, format_args!("Saved {} records to {}", records.len(), path.display()))?;
                report.artifact = Some(path);
            }
        }

        info!(
            source = source_id,
            found = report.found,
            scraped = report.scraped,
            skipped = report.skipped_existing,
            failed = report.failed_extractions,
            "scrape finished"
        );
        Ok(report)
    }

    async fn save_batch(&self, records: &[MatchRecord]) -> Result<PathBuf> {
        let source_id = self.source.source_id.as_str();
        let stored = self
            .artifacts
            .store_json(Utc::now(), source_id, &records)
            .await
            .with_context(|| format!("saving batch for {source_id}"))?;
        Ok(stored.absolute_path)
    }

    async fn stored_urls(&self, reconciler: &Reconciler) -> Result<HashSet<String>> {
        match reconciler.stored_urls().await {
            Ok(urls) => Ok(urls),
            Err(err) if err.is_recoverable() => {
                warn!(source = %self.source.source_id, error = %err, "stored URLs unavailable; scraping everything");
                Ok(HashSet::new())
            }
            Err(err) => Err(err).context("reading stored match URLs"),
        }
    }

    async fn analyse(&self, options: &ScrapeOptions, page: &ExtractedPage) -> Option<AnalysisOutcome> {
        if options.skip_analysis || self.source.skip_commentary {
            return None;
        }
        let request = AnalysisRequest {
            home_team: page.home_team.clone(),
            away_team: page.away_team.clone(),
            commentary: page.commentary.clone(),
            stats: coerce_stats(&page.stats),
        };
        Some(analyze_with_backoff(self.analysis.as_ref(), &self.analysis_backoff, &request).await)
    }
}
