//! Core domain model for matchfeed: match and fixture records, identity keys,
//! ingestion job bookkeeping and the shared status snapshot.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "matchfeed-core";

/// A coerced statistic value. Counts stay integral so they persist into integer columns.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StatValue {
    Int(i64),
    Float(f64),
}

impl StatValue {
    pub fn as_f64(self) -> f64 {
        match self {
            StatValue::Int(v) => v as f64,
            StatValue::Float(v) => v,
        }
    }
}

/// Home/away values of one statistic. A side is `None` when its raw value did not coerce.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct StatPair {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub home: Option<StatValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub away: Option<StatValue>,
}

/// Raw, uncoerced home/away strings as they appeared on the page.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RawPair {
    pub home: String,
    pub away: String,
}

/// Closed set of statistics the pipeline persists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatKind {
    Corners,
    Fouls,
    YellowCards,
    RedCards,
    Shots,
    ShotsOnTarget,
    BlockedShots,
    Possession,
    Xg,
    Xgot,
    BigChances,
    BoxTouches,
    Crosses,
    Tackles,
    GoalkeeperSaves,
    Interceptions,
}

impl StatKind {
    pub const ALL: [StatKind; 16] = [
        StatKind::Corners,
        StatKind::Fouls,
        StatKind::YellowCards,
        StatKind::RedCards,
        StatKind::Shots,
        StatKind::ShotsOnTarget,
        StatKind::BlockedShots,
        StatKind::Possession,
        StatKind::Xg,
        StatKind::Xgot,
        StatKind::BigChances,
        StatKind::BoxTouches,
        StatKind::Crosses,
        StatKind::Tackles,
        StatKind::GoalkeeperSaves,
        StatKind::Interceptions,
    ];

    /// Column suffix in the store; columns are `home_<suffix>` / `away_<suffix>`.
    pub fn column(self) -> &'static str {
        match self {
            StatKind::Corners => "corners",
            StatKind::Fouls => "fouls",
            StatKind::YellowCards => "yellow_cards",
            StatKind::RedCards => "red_cards",
            StatKind::Shots => "shots",
            StatKind::ShotsOnTarget => "shots_on_target",
            StatKind::BlockedShots => "blocked_shots",
            StatKind::Possession => "possession",
            StatKind::Xg => "xg",
            StatKind::Xgot => "xgot",
            StatKind::BigChances => "big_chances",
            StatKind::BoxTouches => "box_touches",
            StatKind::Crosses => "crosses",
            StatKind::Tackles => "tackles",
            StatKind::GoalkeeperSaves => "goalkeeper_saves",
            StatKind::Interceptions => "interceptions",
        }
    }
}

/// Typed statistics of one match plus the labels the field table did not recognise.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MatchStats {
    #[serde(default)]
    pub known: BTreeMap<StatKind, StatPair>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub unmapped: BTreeMap<String, RawPair>,
}

impl MatchStats {
    pub fn get(&self, kind: StatKind) -> Option<&StatPair> {
        self.known.get(&kind)
    }

    /// Later values for the same kind win, so a locale alias can refine an earlier label.
    pub fn insert(&mut self, kind: StatKind, pair: StatPair) {
        let entry = self.known.entry(kind).or_default();
        if pair.home.is_some() {
            entry.home = pair.home;
        }
        if pair.away.is_some() {
            entry.away = pair.away;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchAnalysis {
    pub detailed_summary: String,
    pub tldr: String,
}

/// Result of the commentary analysis step, kept on the record either way.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AnalysisOutcome {
    Completed(MatchAnalysis),
    Failed { error: String },
}

impl AnalysisOutcome {
    pub fn completed(&self) -> Option<&MatchAnalysis> {
        match self {
            AnalysisOutcome::Completed(analysis) => Some(analysis),
            AnalysisOutcome::Failed { .. } => None,
        }
    }
}

/// One played fixture as observed by a scrape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchRecord {
    pub league: String,
    pub home_team: String,
    pub away_team: String,
    /// Round label as published by the source, e.g. "Giornata 14".
    pub round_label: String,
    #[serde(default)]
    pub source_url: Option<String>,
    #[serde(default)]
    pub home_goals: Option<i64>,
    #[serde(default)]
    pub away_goals: Option<i64>,
    #[serde(default)]
    pub stats: MatchStats,
    #[serde(default)]
    pub analysis: Option<AnalysisOutcome>,
}

impl MatchRecord {
    pub fn composite_key(&self) -> CompositeKey {
        normalize(&self.home_team, &self.away_team, &self.round_label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FixtureStatus {
    Scheduled,
    Postponed,
    Played,
}

impl FixtureStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FixtureStatus::Scheduled => "SCHEDULED",
            FixtureStatus::Postponed => "POSTPONED",
            FixtureStatus::Played => "PLAYED",
        }
    }
}

/// A scheduled or postponed match from a league calendar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixtureRecord {
    pub home_team: String,
    pub away_team: String,
    pub round: u32,
    pub match_date: Option<DateTime<Utc>>,
    pub status: FixtureStatus,
    pub league: String,
}

impl FixtureRecord {
    pub fn composite_key(&self) -> CompositeKey {
        CompositeKey {
            home: normalize_team(&self.home_team),
            away: normalize_team(&self.away_team),
            round: Some(self.round),
        }
    }
}

/// Identity derived from normalized team names and round number.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CompositeKey {
    pub home: String,
    pub away: String,
    /// `None` when the round label carried no number.
    pub round: Option<u32>,
}

impl fmt::Display for CompositeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.round {
            Some(round) => write!(f, "{}:{}:{}", self.home, self.away, round),
            None => write!(f, "{}:{}:unknown", self.home, self.away),
        }
    }
}

/// Lower-cases, trims and joins whitespace-separated words with `_`.
pub fn normalize_team(name: &str) -> String {
    name.split_whitespace()
        .map(|word| word.to_lowercase())
        .collect::<Vec<_>>()
        .join("_")
}

/// Pulls the round number out of labels like "Round 13", "Giornata 14" or "13".
pub fn parse_round(label: &str) -> Option<u32> {
    let digits: String = label
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

pub fn normalize(home: &str, away: &str, round_label: &str) -> CompositeKey {
    CompositeKey {
        home: normalize_team(home),
        away: normalize_team(away),
        round: parse_round(round_label),
    }
}

/// Source URLs are already stable across scrapes and are used verbatim.
pub fn normalize_url(url: &str) -> &str {
    url
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SourceStatus {
    Pending,
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceOutcome {
    pub source_id: String,
    pub status: SourceStatus,
    pub exit_code: Option<i32>,
    pub output_lines: usize,
}

/// One orchestrator run over an ordered list of sources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionJob {
    pub job_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub current_index: usize,
    pub outcomes: Vec<SourceOutcome>,
    pub aggregation: Option<SourceOutcome>,
    pub overall_progress: u8,
    pub stopped: bool,
}

impl IngestionJob {
    pub fn new(sources: impl IntoIterator<Item = String>) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            current_index: 0,
            outcomes: sources
                .into_iter()
                .map(|source_id| SourceOutcome {
                    source_id,
                    status: SourceStatus::Pending,
                    exit_code: None,
                    output_lines: 0,
                })
                .collect(),
            aggregation: None,
            overall_progress: 0,
            stopped: false,
        }
    }

    pub fn sources(&self) -> impl Iterator<Item = &str> {
        self.outcomes.iter().map(|o| o.source_id.as_str())
    }

    pub fn record(&mut self, index: usize, status: SourceStatus, exit_code: Option<i32>, output_lines: usize) {
        if let Some(outcome) = self.outcomes.get_mut(index) {
            outcome.status = status;
            outcome.exit_code = exit_code;
            outcome.output_lines = output_lines;
        }
        self.current_index = index + 1;
    }

    pub fn count(&self, status: SourceStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }

    /// Terminal once every source was attempted or the job was stopped.
    pub fn is_terminal(&self) -> bool {
        self.finished_at.is_some()
            && (self.stopped || self.count(SourceStatus::Pending) == 0)
    }
}

/// Advisory progress of the current ingestion run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub is_running: bool,
    pub message: String,
    pub progress: u8,
    pub overall_progress: u8,
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self {
            is_running: false,
            message: "Idle".to_string(),
            progress: 0,
            overall_progress: 0,
        }
    }
}

/// Partial update; only the supplied fields change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusUpdate {
    pub is_running: Option<bool>,
    pub message: Option<String>,
    pub progress: Option<u8>,
    pub overall_progress: Option<u8>,
}

impl StatusUpdate {
    pub fn running(mut self, is_running: bool) -> Self {
        self.is_running = Some(is_running);
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn overall(mut self, overall_progress: u8) -> Self {
        self.overall_progress = Some(overall_progress);
        self
    }

    pub fn apply_to(self, snapshot: &mut StatusSnapshot) {
        if let Some(is_running) = self.is_running {
            snapshot.is_running = is_running;
        }
        if let Some(message) = self.message {
            snapshot.message = message;
        }
        if let Some(progress) = self.progress {
            snapshot.progress = progress.min(100);
        }
        if let Some(overall) = self.overall_progress {
            snapshot.overall_progress = overall.min(100);
        }
    }
}
