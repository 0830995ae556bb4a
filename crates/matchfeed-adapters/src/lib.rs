//! Source adapter contracts, the HTML results/fixtures adapter, stat coercion
//! and the analysis caller.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use matchfeed_core::{parse_round, AnalysisOutcome, FixtureRecord, FixtureStatus, MatchRecord};
use matchfeed_storage::{CallError, FetchError, HttpFetcher};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub mod analysis;
pub mod coerce;

pub use analysis::{
    analyze_with_backoff, AnalysisCaller, AnalysisError, AnalysisRequest, DisabledAnalysis, HttpAnalysisCaller,
    HttpAnalysisConfig,
};
pub use coerce::{coerce, coerce_stats, lookup_field, FractionPolicy, NumberKind, RawStatPair, STAT_FIELDS};

pub const CRATE_NAME: &str = "matchfeed-adapters";

/// Round label for matches given explicitly instead of discovered on a listing.
/// It carries no number, so such records resolve by URL only and never patch `round`.
pub const PLACEHOLDER_ROUND: &str = "Round ?";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListedMatch {
    pub url: String,
    pub round_label: String,
}

/// Everything a match detail page yields before coercion.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExtractedPage {
    pub home_team: String,
    pub away_team: String,
    pub home_score: Option<i64>,
    pub away_score: Option<i64>,
    pub stats: Vec<RawStatPair>,
    pub commentary: Vec<String>,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] CallError<FetchError>),
    #[error("invalid selector `{selector}`: {message}")]
    Selector { selector: &'static str, message: String },
    #[error("{field} not found on {url}")]
    MissingField { field: &'static str, url: String },
    #[error("{0}")]
    Message(String),
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;

    async fn fetch_listing(&self, results_url: &str, last_round_only: bool) -> Result<Vec<ListedMatch>, AdapterError>;

    async fn fetch_detail(&self, url: &str) -> Result<ExtractedPage, AdapterError>;

    async fn fetch_fixtures(&self, fixtures_url: &str, league: &str) -> Result<Vec<FixtureRecord>, AdapterError>;
}

/// Adapter for the results/fixtures/live-table page family.
#[derive(Debug, Clone)]
pub struct HtmlSourceAdapter {
    source_id: String,
    http: HttpFetcher,
}

impl HtmlSourceAdapter {
    pub fn new(source_id: impl Into<String>, http: HttpFetcher) -> Self {
        Self {
            source_id: source_id.into(),
            http,
        }
    }
}

#[async_trait]
impl SourceAdapter for HtmlSourceAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch_listing(&self, results_url: &str, last_round_only: bool) -> Result<Vec<ListedMatch>, AdapterError> {
        let page = self.http.fetch_text(&self.source_id, results_url).await?;
        parse_listing(&page.body, &page.final_url, last_round_only)
    }

    async fn fetch_detail(&self, url: &str) -> Result<ExtractedPage, AdapterError> {
        let page = self.http.fetch_text(&self.source_id, url).await?;
        parse_detail(&page.body, url)
    }

    async fn fetch_fixtures(&self, fixtures_url: &str, league: &str) -> Result<Vec<FixtureRecord>, AdapterError> {
        let page = self.http.fetch_text(&self.source_id, fixtures_url).await?;
        parse_fixtures(&page.body, league, Utc::now().date_naive())
    }
}

fn selector(css: &'static str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Selector {
        selector: css,
        message: e.to_string(),
    })
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn element_text(element: ElementRef<'_>) -> Option<String> {
    text_or_none(element.text().collect::<String>())
}

fn first_text(scope: ElementRef<'_>, sel: &Selector) -> Option<String> {
    scope.select(sel).next().and_then(element_text)
}

fn has_class(element: ElementRef<'_>, class: &str) -> bool {
    element.value().classes().any(|c| c == class)
}

fn absolutize(base: &str, href: &str) -> Option<String> {
    match reqwest::Url::parse(href) {
        Ok(url) => Some(url.to_string()),
        Err(_) => reqwest::Url::parse(base)
            .and_then(|base| base.join(href))
            .ok()
            .map(|url| url.to_string()),
    }
}

/// Round headers and match links in document order. With `last_round_only`
/// parsing stops at the second round header.
pub fn parse_listing(html: &str, base_url: &str, last_round_only: bool) -> Result<Vec<ListedMatch>, AdapterError> {
    let document = Html::parse_document(html);
    let rows = selector("div.event__round, div.event__match a.eventRowLink")?;

    let mut current_round = String::from("Unknown");
    let mut rounds_seen = 0usize;
    let mut seen = HashSet::new();
    let mut out = Vec::new();

    for row in document.select(&rows) {
        if has_class(row, "event__round") {
            rounds_seen += 1;
            if last_round_only && rounds_seen > 1 {
                break;
            }
            current_round = element_text(row).unwrap_or_else(|| "Unknown".to_string());
            continue;
        }
        let Some(href) = row.value().attr("href") else {
            continue;
        };
        let Some(url) = absolutize(base_url, href) else {
            debug!(href, "skipping unresolvable match link");
            continue;
        };
        if seen.insert(url.clone()) {
            out.push(ListedMatch {
                url,
                round_label: current_round.clone(),
            });
        }
    }
    Ok(out)
}

pub fn parse_detail(html: &str, url: &str) -> Result<ExtractedPage, AdapterError> {
    let document = Html::parse_document(html);
    let root = document.root_element();

    let home_sel = selector(".duelParticipant__home .participant__participantName")?;
    let away_sel = selector(".duelParticipant__away .participant__participantName")?;
    let score_sel = selector(".detailScore__wrapper span")?;
    let stat_row_sel = selector("div[data-testid=\"wcl-statistics\"]")?;
    let category_sel = selector("[data-testid=\"wcl-statistics-category\"]")?;
    let value_sel = selector("[data-testid=\"wcl-statistics-value\"]")?;
    let commentary_sel = selector("[data-testid=\"wcl-commentary-text\"]")?;

    let home_team = first_text(root, &home_sel).ok_or_else(|| AdapterError::MissingField {
        field: "home_team",
        url: url.to_string(),
    })?;
    let away_team = first_text(root, &away_sel).ok_or_else(|| AdapterError::MissingField {
        field: "away_team",
        url: url.to_string(),
    })?;

    let goals: Vec<i64> = document
        .select(&score_sel)
        .filter_map(element_text)
        .filter_map(|t| t.parse().ok())
        .collect();

    let stats = document
        .select(&stat_row_sel)
        .filter_map(|row| {
            let label = first_text(row, &category_sel)?;
            let mut values = row.select(&value_sel).filter_map(element_text);
            let home = values.next()?;
            let away = values.next()?;
            Some(RawStatPair { label, home, away })
        })
        .collect();

    let commentary = document.select(&commentary_sel).filter_map(element_text).collect();

    Ok(ExtractedPage {
        home_team,
        away_team,
        home_score: goals.first().copied(),
        away_score: goals.get(1).copied(),
        stats,
        commentary,
    })
}

/// Calendar rows. A row with both teams but no kickoff time is `POSTPONED`;
/// a row whose kickoff text is not a real date is skipped.
pub fn parse_fixtures(html: &str, league: &str, today: NaiveDate) -> Result<Vec<FixtureRecord>, AdapterError> {
    let document = Html::parse_document(html);
    let rows = selector("div.event__round, div.event__match")?;
    let home_sel = selector(".event__participant--home")?;
    let away_sel = selector(".event__participant--away")?;
    let time_sel = selector(".event__time")?;

    let mut current_round = 0u32;
    let mut out = Vec::new();
    for row in document.select(&rows) {
        if has_class(row, "event__round") {
            current_round = element_text(row).as_deref().and_then(parse_round).unwrap_or(0);
            continue;
        }
        let (Some(home_team), Some(away_team)) = (first_text(row, &home_sel), first_text(row, &away_sel)) else {
            continue;
        };
        let (match_date, status) = match first_text(row, &time_sel) {
            None => (None, FixtureStatus::Postponed),
            Some(text) => match parse_fixture_date(&text, today) {
                Some(date) => (Some(date), FixtureStatus::Scheduled),
                None => {
                    warn!(league, home = %home_team, away = %away_team, time = %text, "unparseable kickoff time; skipping fixture");
                    continue;
                }
            },
        };
        out.push(FixtureRecord {
            home_team,
            away_team,
            round: current_round,
            match_date,
            status,
            league: league.to_string(),
        });
    }
    Ok(out)
}

/// Parses `"DD.MM. HH:MM"`. The year is `today`'s, or the next one when the
/// month lies more than six months behind.
pub fn parse_fixture_date(text: &str, today: NaiveDate) -> Option<DateTime<Utc>> {
    let mut parts = text.split_whitespace();
    let date_part = parts.next()?;
    let time_part = parts.next()?;

    let mut dm = date_part.split('.').filter(|s| !s.is_empty());
    let day: u32 = dm.next()?.parse().ok()?;
    let month: u32 = dm.next()?.parse().ok()?;
    let (hour, minute) = time_part.split_once(':')?;
    let hour: u32 = hour.parse().ok()?;
    let minute: u32 = minute.parse().ok()?;

    let mut year = today.year();
    if month < today.month() && today.month() - month > 6 {
        year += 1;
    }
    Utc.with_ymd_and_hms(year, month, day, hour, minute, 0).single()
}

/// Assembles a record from an extracted page; coercion drops values that fail to parse.
pub fn build_match_record(
    league: &str,
    listed: &ListedMatch,
    page: &ExtractedPage,
    analysis: Option<AnalysisOutcome>,
) -> MatchRecord {
    MatchRecord {
        league: league.to_string(),
        home_team: page.home_team.clone(),
        away_team: page.away_team.clone(),
        round_label: listed.round_label.clone(),
        source_url: Some(listed.url.clone()),
        home_goals: page.home_score,
        away_goals: page.away_score,
        stats: coerce_stats(&page.stats),
        analysis,
    }
}
