//! Calendar aggregation across sources, run as the last step of a job.

use std::io::Write;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use matchfeed_core::FixtureRecord;
use serde::Serialize;
use tracing::{info, warn};

use crate::progress::ProgressLine;
use crate::reconcile::{Reconciler, SyncSummary};
use crate::{AdapterFactory, SourceConfig};

const UPCOMING_PREVIEW: usize = 5;

#[derive(Debug, Clone, Default, Serialize)]
pub struct FixturesReport {
    pub fetched: usize,
    pub summary: SyncSummary,
    pub failed_sources: Vec<String>,
}

pub struct FixtureAggregator {
    reconciler: Reconciler,
}

impl FixtureAggregator {
    pub fn new(reconciler: Reconciler) -> Self {
        Self { reconciler }
    }

    /// Each source is fetched and reconciled on its own; one failing source
    /// is recorded and the rest still run.
    pub async fn run(
        &self,
        sources: &[SourceConfig],
        adapters: &dyn AdapterFactory,
        now: DateTime<Utc>,
        out: &mut (dyn Write + Send),
    ) -> Result<FixturesReport> {
        let mut report = FixturesReport::default();
        let mut upcoming: Vec<FixtureRecord> = Vec::new();

        for (i, source) in sources.iter().enumerate() {
            writeln!(out, "{}", ProgressLine::Item { index: i + 1, total: sources.len() })
                .context("writing progress line")?;

            let Some(fixtures_url) = source.fixtures_url.as_deref() else {
                info!(source = %source.source_id, "no fixtures page configured");
                continue;
            };
            let adapter = adapters.adapter_for(source);
            let fixtures = match adapter.fetch_fixtures(fixtures_url, &source.league).await {
                Ok(fixtures) => fixtures,
                Err(err) => {
                    warn!(source = %source.source_id, error = %err, "fixtures fetch failed");
                    report.failed_sources.push(source.source_id.clone());
                    continue;
                }
            };
            report.fetched += fixtures.len();

            match self.reconciler.sync(&fixtures).await {
                Ok(summary) => report.summary.merge(summary),
                Err(err) => {
                    warn!(source = %source.source_id, error = %err, "fixtures sync failed");
                    report.summary.failed += fixtures.len();
                    report.failed_sources.push(source.source_id.clone());
                }
            }
            upcoming.extend(fixtures.into_iter().filter(|f| f.match_date.is_some_and(|d| d >= now)));
        }

        upcoming.sort_by_key(|f| f.match_date);
        for fixture in upcoming.iter().take(UPCOMING_PREVIEW) {
            info!(
                league = %fixture.league,
                home = %fixture.home_team,
                away = %fixture.away_team,
                round = fixture.round,
                date = ?fixture.match_date,
                "upcoming fixture"
            );
        }

        writeln!(out, "{}", ProgressLine::Persisted(report.summary)).context("writing progress line")?;
        out.flush().context("flushing progress line")?;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::TimeZone;
    use matchfeed_adapters::{AdapterError, ExtractedPage, ListedMatch, SourceAdapter};
    use matchfeed_core::FixtureStatus;
    use matchfeed_storage::MemoryStore;

    use crate::reconcile::FIXTURES_TABLE;

    struct CalendarAdapter {
        broken: bool,
    }

    #[async_trait]
    impl SourceAdapter for CalendarAdapter {
        fn source_id(&self) -> &str {
            "calendar"
        }

        async fn fetch_listing(&self, _url: &str, _last: bool) -> Result<Vec<ListedMatch>, AdapterError> {
            Ok(Vec::new())
        }

        async fn fetch_detail(&self, url: &str) -> Result<ExtractedPage, AdapterError> {
            Err(AdapterError::Message(format!("no detail for {url}")))
        }

        async fn fetch_fixtures(&self, _url: &str, league: &str) -> Result<Vec<FixtureRecord>, AdapterError> {
            if self.broken {
                return Err(AdapterError::Message("calendar unavailable".into()));
            }
            Ok(vec![
                FixtureRecord {
                    home_team: format!("{league} Home"),
                    away_team: format!("{league} Away"),
                    round: 20,
                    match_date: Utc.with_ymd_and_hms(2026, 1, 18, 14, 30, 0).single(),
                    status: FixtureStatus::Scheduled,
                    league: league.to_string(),
                },
                FixtureRecord {
                    home_team: format!("{league} Late"),
                    away_team: format!("{league} Early"),
                    round: 20,
                    match_date: None,
                    status: FixtureStatus::Postponed,
                    league: league.to_string(),
                },
            ])
        }
    }

    struct Factory;

    impl AdapterFactory for Factory {
        fn adapter_for(&self, source: &SourceConfig) -> Arc<dyn SourceAdapter> {
            Arc::new(CalendarAdapter {
                broken: source.source_id == "broken",
            })
        }
    }

    fn source(id: &str, league: &str) -> SourceConfig {
        SourceConfig {
            source_id: id.into(),
            display_name: league.into(),
            league: league.into(),
            enabled: true,
            results_url: format!("https://x.test/{id}/results"),
            fixtures_url: Some(format!("https://x.test/{id}/fixtures")),
            skip_commentary: false,
        }
    }

    #[tokio::test]
    async fn failing_source_does_not_stop_the_others() {
        let store = Arc::new(MemoryStore::new());
        let aggregator = FixtureAggregator::new(Reconciler::new(store.clone(), 1000));
        let sources = vec![
            source("eredivisie", "Eredivisie"),
            source("broken", "Broken"),
            source("serie-a", "Serie A"),
        ];
        let now = Utc.with_ymd_and_hms(2026, 1, 10, 0, 0, 0).unwrap();
        let mut out: Vec<u8> = Vec::new();

        let report = aggregator.run(&sources, &Factory, now, &mut out).await.unwrap();

        assert_eq!(report.fetched, 4);
        assert_eq!(report.summary.inserted, 4);
        assert_eq!(report.failed_sources, vec!["broken".to_string()]);
        assert_eq!(store.rows(FIXTURES_TABLE).await.len(), 4);

        let again = aggregator.run(&sources, &Factory, now, &mut Vec::<u8>::new()).await.unwrap();
        assert_eq!(again.summary.unchanged, 4);
        assert_eq!(again.summary.writes(), 0);
    }
}
