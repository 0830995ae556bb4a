//! Reconciliation of freshly scraped records against the remote store.
//!
//! The whole table is read first (paginated), then every incoming record is
//! resolved by URL and, failing that, by composite key. Unresolved records are
//! inserted in one batch; resolved ones are updated one at a time with only
//! the columns that differ. A stored value is never replaced by a missing one.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat};
use matchfeed_core::{
    normalize, normalize_team, normalize_url, AnalysisOutcome, CompositeKey, FixtureRecord, MatchRecord, StatKind,
    StatValue,
};
use matchfeed_storage::{fetch_all, RemoteStore, Row, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};

pub const MATCHES_TABLE: &str = "matches";
pub const FIXTURES_TABLE: &str = "fixtures";

/// A record type the reconciler can persist.
pub trait SyncRecord {
    const TABLE: &'static str;
    /// Columns an insert cannot do without.
    const INSERT_REQUIRED: &'static [&'static str];

    fn source_url(&self) -> Option<&str>;
    fn composite_key(&self) -> CompositeKey;
    /// Every column this record supplies. Unknown values are left out.
    fn payload(&self) -> Row;
}

impl SyncRecord for MatchRecord {
    const TABLE: &'static str = MATCHES_TABLE;
    const INSERT_REQUIRED: &'static [&'static str] = &["home_team", "away_team", "round", "league"];

    fn source_url(&self) -> Option<&str> {
        self.source_url.as_deref().map(normalize_url)
    }

    fn composite_key(&self) -> CompositeKey {
        MatchRecord::composite_key(self)
    }

    fn payload(&self) -> Row {
        let mut row = Row::new();
        row.insert("home_team".into(), Value::from(self.home_team.trim()));
        row.insert("away_team".into(), Value::from(self.away_team.trim()));
        if let Some(round) = self.composite_key().round {
            row.insert("round".into(), Value::from(round));
        }
        if let Some(url) = self.source_url() {
            row.insert("url".into(), Value::from(url));
        }
        if !self.league.trim().is_empty() {
            row.insert("league".into(), Value::from(self.league.trim()));
        }
        if let Some(goals) = self.home_goals {
            row.insert("home_goals".into(), Value::from(goals));
        }
        if let Some(goals) = self.away_goals {
            row.insert("away_goals".into(), Value::from(goals));
        }
        for kind in StatKind::ALL {
            let Some(pair) = self.stats.get(kind) else {
                continue;
            };
            if let Some(value) = pair.home.and_then(stat_json) {
                row.insert(format!("home_{}", kind.column()), value);
            }
            if let Some(value) = pair.away.and_then(stat_json) {
                row.insert(format!("away_{}", kind.column()), value);
            }
        }
        if let Some(AnalysisOutcome::Completed(analysis)) = &self.analysis {
            row.insert("analysis_detailed".into(), Value::from(analysis.detailed_summary.clone()));
            row.insert("analysis_tldr".into(), Value::from(analysis.tldr.clone()));
        }
        row
    }
}

impl SyncRecord for FixtureRecord {
    const TABLE: &'static str = FIXTURES_TABLE;
    const INSERT_REQUIRED: &'static [&'static str] = &["home_team", "away_team", "round", "league"];

    fn source_url(&self) -> Option<&str> {
        None
    }

    fn composite_key(&self) -> CompositeKey {
        FixtureRecord::composite_key(self)
    }

    fn payload(&self) -> Row {
        let mut row = Row::new();
        row.insert("home_team".into(), Value::from(self.home_team.trim()));
        row.insert("away_team".into(), Value::from(self.away_team.trim()));
        row.insert("round".into(), Value::from(self.round));
        if let Some(date) = self.match_date {
            row.insert(
                "match_date".into(),
                Value::from(date.to_rfc3339_opts(SecondsFormat::Secs, true)),
            );
        }
        row.insert("status".into(), Value::from(self.status.as_str()));
        if !self.league.trim().is_empty() {
            row.insert("league".into(), Value::from(self.league.trim()));
        }
        row
    }
}

fn stat_json(value: StatValue) -> Option<Value> {
    match value {
        StatValue::Int(v) => Some(Value::from(v)),
        StatValue::Float(v) => serde_json::Number::from_f64(v).map(Value::Number),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSummary {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub failed: usize,
}

impl SyncSummary {
    pub fn merge(&mut self, other: SyncSummary) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.unchanged += other.unchanged;
        self.failed += other.failed;
    }

    pub fn writes(&self) -> usize {
        self.inserted + self.updated
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlannedAction {
    New { row: Row },
    Changed { id: Value, patch: Row },
    Unchanged { id: Value },
    /// New, but missing a column an insert requires.
    Invalid { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanEntry {
    pub identity: String,
    #[serde(flatten)]
    pub action: PlannedAction,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncPlan {
    pub table: &'static str,
    /// Incoming records folded into a later one with the same identity.
    pub superseded: usize,
    pub entries: Vec<PlanEntry>,
}

impl SyncPlan {
    pub fn count(&self, f: impl Fn(&PlannedAction) -> bool) -> usize {
        self.entries.iter().filter(|e| f(&e.action)).count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum BatchKey {
    Url(String),
    Key(CompositeKey),
}

fn batch_keys<R: SyncRecord>(record: &R) -> Vec<BatchKey> {
    let mut keys = Vec::with_capacity(2);
    if let Some(url) = record.source_url() {
        keys.push(BatchKey::Url(url.to_string()));
    }
    let key = record.composite_key();
    if key.round.is_some() {
        keys.push(BatchKey::Key(key));
    }
    keys
}

/// Last write wins among incoming records that share a URL or composite key.
/// A record matching several earlier survivors replaces all of them and takes
/// the earliest position among them.
pub fn dedupe_batch<R: SyncRecord>(incoming: &[R]) -> (Vec<&R>, usize) {
    let mut slots: Vec<Option<&R>> = Vec::with_capacity(incoming.len());
    let mut index: HashMap<BatchKey, usize> = HashMap::new();
    let mut superseded = 0;

    for record in incoming {
        let keys = batch_keys(record);
        let mut hits: Vec<usize> = keys.iter().filter_map(|k| index.get(k).copied()).collect();
        hits.sort_unstable();
        hits.dedup();

        let slot = match hits.first() {
            Some(&first) => {
                superseded += hits.len();
                for &other in &hits[1..] {
                    slots[other] = None;
                }
                for target in index.values_mut() {
                    if hits.contains(target) {
                        *target = first;
                    }
                }
                slots[first] = Some(record);
                first
            }
            None => {
                slots.push(Some(record));
                slots.len() - 1
            }
        };
        for key in keys {
            index.insert(key, slot);
        }
    }
    (slots.into_iter().flatten().collect(), superseded)
}

/// Lookup tables over the stored rows.
#[derive(Debug, Default)]
struct StoredIndex {
    rows: Vec<Row>,
    by_url: HashMap<String, usize>,
    by_key: HashMap<CompositeKey, usize>,
}

impl StoredIndex {
    fn build(rows: Vec<Row>) -> Self {
        let mut by_url = HashMap::new();
        let mut by_key = HashMap::new();
        for (i, row) in rows.iter().enumerate() {
            if !row.contains_key("id") {
                continue;
            }
            if let Some(url) = row.get("url").and_then(Value::as_str) {
                by_url.entry(normalize_url(url).to_string()).or_insert(i);
            }
            let home = row.get("home_team").and_then(Value::as_str);
            let away = row.get("away_team").and_then(Value::as_str);
            if let (Some(home), Some(away)) = (home, away) {
                let round = row.get("round").map(value_text).unwrap_or_default();
                let key = normalize(home, away, &round);
                if key.round.is_some() {
                    by_key.entry(key).or_insert(i);
                }
            }
        }
        Self { rows, by_url, by_key }
    }

    fn resolve(&self, url: Option<&str>, key: &CompositeKey) -> Option<&Row> {
        let by_url = url.and_then(|u| self.by_url.get(u));
        let by_key = || key.round.is_some().then(|| self.by_key.get(key)).flatten();
        by_url.or_else(by_key).map(|&i| &self.rows[i])
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Equality the way the store sees it: numbers by value, timestamps by
/// instant and team names by their normalized form.
fn same_value(column: &str, stored: &Value, incoming: &Value) -> bool {
    match (stored, incoming) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => a == b,
        },
        (Value::String(a), Value::String(b)) => {
            if a == b {
                return true;
            }
            if column == "home_team" || column == "away_team" {
                return normalize_team(a) == normalize_team(b);
            }
            match (DateTime::parse_from_rfc3339(a), DateTime::parse_from_rfc3339(b)) {
                (Ok(a), Ok(b)) => a == b,
                _ => false,
            }
        }
        (Value::String(a), Value::Number(b)) | (Value::Number(b), Value::String(a)) => {
            match (a.trim().parse::<f64>(), b.as_f64()) {
                (Ok(a), Some(b)) => a == b,
                _ => false,
            }
        }
        _ => stored == incoming,
    }
}

/// Columns of `payload` that are absent, null or different on `stored`.
fn diff(stored: &Row, payload: &Row) -> Row {
    payload
        .iter()
        .filter(|(column, incoming)| {
            !incoming.is_null()
                && match stored.get(column.as_str()) {
                    None | Some(Value::Null) => true,
                    Some(current) => !same_value(column, current, incoming),
                }
        })
        .map(|(column, value)| (column.clone(), value.clone()))
        .collect()
}

fn missing_required(row: &Row, required: &[&str]) -> Option<String> {
    let missing: Vec<&str> = required
        .iter()
        .copied()
        .filter(|column| match row.get(*column) {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => s.trim().is_empty(),
            Some(_) => false,
        })
        .collect();
    (!missing.is_empty()).then(|| format!("missing {}", missing.join(", ")))
}

fn identity_label<R: SyncRecord>(record: &R) -> String {
    match record.source_url() {
        Some(url) => url.to_string(),
        None => record.composite_key().to_string(),
    }
}

#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn RemoteStore>,
    page_size: usize,
}

impl Reconciler {
    pub fn new(store: Arc<dyn RemoteStore>, page_size: usize) -> Self {
        Self {
            store,
            page_size: page_size.max(1),
        }
    }

    pub fn store(&self) -> &Arc<dyn RemoteStore> {
        &self.store
    }

    /// Reads the whole table and classifies each incoming record without writing.
    pub async fn plan<R: SyncRecord>(&self, incoming: &[R]) -> Result<SyncPlan, StoreError> {
        let stored = fetch_all(self.store.as_ref(), R::TABLE, self.page_size).await?;
        let index = StoredIndex::build(stored);
        let (records, superseded) = dedupe_batch(incoming);

        let entries = records
            .into_iter()
            .map(|record| {
                let payload = record.payload();
                let action = match index.resolve(record.source_url(), &record.composite_key()) {
                    Some(row) => {
                        let id = row.get("id").cloned().unwrap_or(Value::Null);
                        let patch = diff(row, &payload);
                        if patch.is_empty() {
                            PlannedAction::Unchanged { id }
                        } else {
                            PlannedAction::Changed { id, patch }
                        }
                    }
                    None => match missing_required(&payload, R::INSERT_REQUIRED) {
                        Some(reason) => PlannedAction::Invalid { reason },
                        None => PlannedAction::New { row: payload },
                    },
                };
                PlanEntry {
                    identity: identity_label(record),
                    action,
                }
            })
            .collect();

        Ok(SyncPlan {
            table: R::TABLE,
            superseded,
            entries,
        })
    }

    /// Plans and applies. A missing table or column is logged and every
    /// record counted as failed; other read failures are returned.
    pub async fn sync<R: SyncRecord>(&self, incoming: &[R]) -> Result<SyncSummary, StoreError> {
        if incoming.is_empty() {
            return Ok(SyncSummary::default());
        }
        let plan = match self.plan(incoming).await {
            Ok(plan) => plan,
            Err(err) if err.is_recoverable() => {
                warn!(table = R::TABLE, error = %err, "skipping sync against unavailable table");
                return Ok(SyncSummary {
                    failed: dedupe_batch(incoming).0.len(),
                    ..SyncSummary::default()
                });
            }
            Err(err) => return Err(err),
        };
        Ok(self.apply(&plan).await)
    }

    pub async fn apply(&self, plan: &SyncPlan) -> SyncSummary {
        let mut summary = SyncSummary::default();
        let mut inserts: Vec<(&str, &Row)> = Vec::new();

        for entry in &plan.entries {
            match &entry.action {
                PlannedAction::New { row } => inserts.push((entry.identity.as_str(), row)),
                PlannedAction::Unchanged { .. } => summary.unchanged += 1,
                PlannedAction::Invalid { reason } => {
                    warn!(table = plan.table, record = %entry.identity, %reason, "record cannot be inserted");
                    summary.failed += 1;
                }
                PlannedAction::Changed { .. } => {}
            }
        }

        self.insert_batch(plan.table, &inserts, &mut summary).await;

        for entry in &plan.entries {
            let PlannedAction::Changed { id, patch } = &entry.action else {
                continue;
            };
            match self.store.update_by_id(plan.table, id, patch).await {
                Ok(()) => summary.updated += 1,
                Err(err) => {
                    warn!(table = plan.table, record = %entry.identity, %id, error = %err, "update failed");
                    summary.failed += 1;
                }
            }
        }

        info!(
            table = plan.table,
            inserted = summary.inserted,
            updated = summary.updated,
            unchanged = summary.unchanged,
            failed = summary.failed,
            "reconciliation finished"
        );
        summary
    }

    /// One call for the whole batch; on failure, row by row so only the
    /// offending rows count as failed.
    async fn insert_batch(&self, table: &str, inserts: &[(&str, &Row)], summary: &mut SyncSummary) {
        if inserts.is_empty() {
            return;
        }
        let rows: Vec<Row> = inserts.iter().map(|(_, row)| (*row).clone()).collect();
        let err = match self.store.insert(table, &rows).await {
            Ok(()) => {
                summary.inserted += rows.len();
                return;
            }
            Err(err) => err,
        };

        if err.is_recoverable() {
            warn!(table, error = %err, rows = rows.len(), "insert skipped");
            summary.failed += rows.len();
            return;
        }

        warn!(table, error = %err, rows = rows.len(), "batch insert failed; retrying row by row");
        for (identity, row) in inserts {
            match self.store.insert(table, std::slice::from_ref(*row)).await {
                Ok(()) => summary.inserted += 1,
                Err(err) => {
                    error!(table, record = %identity, error = %err, "insert failed");
                    summary.failed += 1;
                }
            }
        }
    }

    /// URLs already present in the matches table.
    pub async fn stored_urls(&self) -> Result<std::collections::HashSet<String>, StoreError> {
        let rows = fetch_all(self.store.as_ref(), MATCHES_TABLE, self.page_size).await?;
        Ok(rows
            .iter()
            .filter_map(|row| row.get("url").and_then(Value::as_str))
            .map(|url| normalize_url(url).to_string())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use matchfeed_core::{FixtureStatus, MatchAnalysis, MatchStats, StatPair};
    use matchfeed_storage::MemoryStore;
    use serde_json::json;

    fn record(home: &str, away: &str, round: &str, url: Option<&str>, corners: Option<i64>) -> MatchRecord {
        let mut stats = MatchStats::default();
        if let Some(corners) = corners {
            stats.insert(
                StatKind::Corners,
                StatPair {
                    home: Some(StatValue::Int(corners)),
                    away: Some(StatValue::Int(2)),
                },
            );
        }
        MatchRecord {
            league: "Eredivisie".into(),
            home_team: home.into(),
            away_team: away.into(),
            round_label: round.into(),
            source_url: url.map(str::to_string),
            home_goals: Some(1),
            away_goals: Some(0),
            stats,
            analysis: None,
        }
    }

    fn obj(value: Value) -> Row {
        let Value::Object(map) = value else {
            panic!("expected object")
        };
        map
    }

    fn reconciler(store: &Arc<MemoryStore>) -> Reconciler {
        Reconciler::new(store.clone(), 1000)
    }

    #[test]
    fn batch_duplicates_keep_the_last_write() {
        let batch = vec![
            record("FC Twente", "Ajax", "Round 3", Some("https://x.test/m/1"), Some(6)),
            record("PSV", "AZ", "Round 3", Some("https://x.test/m/2"), Some(4)),
            record("fc twente", "ajax", "Round 3", None, Some(9)),
        ];
        let (survivors, superseded) = dedupe_batch(&batch);
        assert_eq!(superseded, 1);
        assert_eq!(survivors.len(), 2);
        assert_eq!(survivors[0].source_url.as_deref(), None);
        assert_eq!(survivors[1].home_team, "PSV");
    }

    #[test]
    fn record_bridging_two_identities_replaces_both() {
        let batch = vec![
            record("FC Twente", "Ajax", "Round 3", Some("https://x.test/m/1"), Some(6)),
            record("PSV", "AZ", "Round 3", Some("https://x.test/m/2"), Some(4)),
            record("PSV", "AZ", "Round 3", Some("https://x.test/m/1"), Some(7)),
            record("PSV", "AZ", "Round 3", Some("https://x.test/m/2"), Some(8)),
        ];
        let (survivors, superseded) = dedupe_batch(&batch);
        assert_eq!(survivors.len(), 1);
        assert_eq!(superseded, 3);
        assert_eq!(survivors[0].source_url.as_deref(), Some("https://x.test/m/2"));
    }

    #[tokio::test]
    async fn second_sync_of_same_batch_is_a_no_op() {
        let store = Arc::new(MemoryStore::new());
        let batch = vec![
            record("FC Twente", "Ajax", "Round 3", Some("https://x.test/m/1"), Some(6)),
            record("PSV", "AZ", "Round 3", Some("https://x.test/m/2"), Some(4)),
            record("Feyenoord", "NEC", "Round 3", None, None),
        ];
        let sync = reconciler(&store);

        let first = sync.sync(&batch).await.unwrap();
        assert_eq!(first.inserted, 3);

        let writes_before = store.write_calls();
        let second = sync.sync(&batch).await.unwrap();
        assert_eq!(second, SyncSummary { unchanged: 3, ..SyncSummary::default() });
        assert_eq!(store.write_calls(), writes_before);
    }

    #[tokio::test]
    async fn url_match_survives_team_spelling_changes() {
        let store = Arc::new(MemoryStore::new().with_rows(
            MATCHES_TABLE,
            [obj(json!({
                "home_team": "FC Twente", "away_team": "Ajax", "round": 7,
                "url": "https://x.test/m/9", "league": "Eredivisie",
                "home_goals": 1, "away_goals": 0,
            }))],
        ));
        let incoming = vec![record("fc   twente", "ajax", "Giornata 8", Some("https://x.test/m/9"), None)];

        let plan = reconciler(&store).plan(&incoming).await.unwrap();
        match &plan.entries[0].action {
            PlannedAction::Changed { id, patch } => {
                assert_eq!(id, &json!(1));
                assert_eq!(patch.keys().collect::<Vec<_>>(), vec!["round"]);
            }
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn composite_key_fallback_resolves_without_url() {
        let store = Arc::new(MemoryStore::new().with_rows(
            MATCHES_TABLE,
            [obj(json!({
                "home_team": "Go Ahead Eagles", "away_team": "PSV", "round": "13",
                "league": "Eredivisie", "home_goals": 1, "away_goals": 0,
            }))],
        ));
        let incoming = vec![record("go ahead  eagles", "PSV", "Round 13", None, None)];

        let summary = reconciler(&store).sync(&incoming).await.unwrap();
        assert_eq!(summary.unchanged, 1);
        assert_eq!(summary.inserted, 0);
    }

    #[tokio::test]
    async fn one_bad_round_does_not_block_the_batch() {
        let store = Arc::new(MemoryStore::new());
        let batch: Vec<_> = (1..=5)
            .map(|i| {
                let round = if i == 3 { "Play-offs".to_string() } else { format!("Round {i}") };
                record(&format!("Home {i}"), &format!("Away {i}"), &round, None, Some(i))
            })
            .collect();

        let summary = reconciler(&store).sync(&batch).await.unwrap();
        assert_eq!(summary.inserted, 4);
        assert_eq!(summary.failed, 1);
        assert_eq!(store.rows(MATCHES_TABLE).await.len(), 4);
    }

    #[tokio::test]
    async fn rejected_row_falls_back_to_row_by_row_insert() {
        let store = Arc::new(MemoryStore::new().rejecting("home_team", json!("Broken FC")));
        let batch = vec![
            record("Ajax", "PSV", "Round 1", None, Some(1)),
            record("Broken FC", "AZ", "Round 1", None, Some(1)),
            record("NEC", "Utrecht", "Round 1", None, Some(1)),
        ];

        let summary = reconciler(&store).sync(&batch).await.unwrap();
        assert_eq!(summary.inserted, 2);
        assert_eq!(summary.failed, 1);
    }

    #[tokio::test]
    async fn later_duplicate_in_batch_wins() {
        let store = Arc::new(MemoryStore::new());
        let batch = vec![
            record("Ajax", "PSV", "Round 2", Some("https://x.test/m/5"), Some(3)),
            record("AJAX", "psv", "2", Some("https://x.test/m/5"), Some(8)),
        ];

        let summary = reconciler(&store).sync(&batch).await.unwrap();
        assert_eq!(summary.inserted, 1);
        let rows = store.rows(MATCHES_TABLE).await;
        assert_eq!(rows[0]["home_corners"], json!(8));
    }

    #[tokio::test]
    async fn missing_values_never_overwrite_stored_ones() {
        let store = Arc::new(MemoryStore::new().with_rows(
            MATCHES_TABLE,
            [obj(json!({
                "home_team": "Ajax", "away_team": "PSV", "round": 2, "url": "https://x.test/m/5",
                "league": null, "home_goals": 1, "away_goals": 0, "home_corners": 5.0, "away_corners": 2,
                "analysis_tldr": "kept",
            }))],
        ));
        let mut incoming = record("Ajax", "PSV", "Round 2", Some("https://x.test/m/5"), Some(5));
        incoming.analysis = Some(AnalysisOutcome::Failed { error: "quota".into() });

        let plan = reconciler(&store).plan(&[incoming]).await.unwrap();
        let PlannedAction::Changed { patch, .. } = &plan.entries[0].action else {
            panic!("league must be filled in");
        };
        assert_eq!(patch.keys().collect::<Vec<_>>(), vec!["league"]);
    }

    #[tokio::test]
    async fn completed_analysis_is_persisted() {
        let store = Arc::new(MemoryStore::new());
        let mut incoming = record("Ajax", "PSV", "Round 2", Some("https://x.test/m/5"), None);
        incoming.analysis = Some(AnalysisOutcome::Completed(MatchAnalysis {
            detailed_summary: "Ajax pressed.".into(),
            tldr: "Pressure.".into(),
        }));

        reconciler(&store).sync(&[incoming]).await.unwrap();
        let rows = store.rows(MATCHES_TABLE).await;
        assert_eq!(rows[0]["analysis_tldr"], json!("Pressure."));
    }

    #[tokio::test]
    async fn missing_table_counts_everything_failed() {
        let store = Arc::new(MemoryStore::new().with_missing_table(FIXTURES_TABLE));
        let fixtures = vec![FixtureRecord {
            home_team: "PSV".into(),
            away_team: "Feyenoord".into(),
            round: 15,
            match_date: None,
            status: FixtureStatus::Postponed,
            league: "Eredivisie".into(),
        }];

        let summary = reconciler(&store).sync(&fixtures).await.unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(store.write_calls(), 0);
    }

    #[tokio::test]
    async fn fixture_date_change_updates_in_place() {
        let store = Arc::new(MemoryStore::new().with_rows(
            FIXTURES_TABLE,
            [obj(json!({
                "home_team": "PSV", "away_team": "Feyenoord", "round": 15,
                "match_date": "2025-11-29T20:00:00+00:00", "status": "SCHEDULED", "league": "Eredivisie",
            }))],
        ));
        let unchanged = FixtureRecord {
            home_team: "psv".into(),
            away_team: "feyenoord".into(),
            round: 15,
            match_date: Utc.with_ymd_and_hms(2025, 11, 29, 20, 0, 0).single(),
            status: FixtureStatus::Scheduled,
            league: "Eredivisie".into(),
        };
        let moved = FixtureRecord {
            match_date: Utc.with_ymd_and_hms(2025, 11, 30, 14, 30, 0).single(),
            ..unchanged.clone()
        };
        let sync = reconciler(&store);

        assert_eq!(sync.sync(&[unchanged]).await.unwrap().unchanged, 1);
        assert_eq!(sync.sync(&[moved]).await.unwrap().updated, 1);
        let rows = store.rows(FIXTURES_TABLE).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["match_date"], json!("2025-11-30T14:30:00Z"));
    }
}
