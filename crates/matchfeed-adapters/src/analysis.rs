//! Commentary analysis contract and the generative-language HTTP caller.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use matchfeed_core::{AnalysisOutcome, MatchAnalysis, MatchStats};
use matchfeed_storage::{call_with_backoff, BackoffPolicy, RetryDisposition, Throttled};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{info, warn};

const TLDR_MAX_CHARS: usize = 200;
const DEFAULT_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta/models";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub home_team: String,
    pub away_team: String,
    pub commentary: Vec<String>,
    pub stats: MatchStats,
}

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("no commentary available for analysis")]
    NoCommentary,
    #[error("analysis skipped: no API key configured")]
    NotConfigured,
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status}: {body}")]
    Http { status: u16, body: String },
    #[error("malformed analysis response: {0}")]
    Malformed(String),
}

impl Throttled for AnalysisError {
    fn disposition(&self) -> RetryDisposition {
        match self {
            AnalysisError::RateLimited(_) => RetryDisposition::Retryable,
            _ => RetryDisposition::NonRetryable,
        }
    }
}

#[async_trait]
pub trait AnalysisCaller: Send + Sync {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<MatchAnalysis, AnalysisError>;
}

/// Runs the caller under the backoff policy and folds every failure into a
/// tagged outcome so the record keeps flowing.
pub async fn analyze_with_backoff(
    caller: &dyn AnalysisCaller,
    policy: &BackoffPolicy,
    request: &AnalysisRequest,
) -> AnalysisOutcome {
    if request.commentary.is_empty() {
        return AnalysisOutcome::Failed {
            error: AnalysisError::NoCommentary.to_string(),
        };
    }
    match call_with_backoff(policy, |_attempt| caller.analyze(request)).await {
        Ok(analysis) => AnalysisOutcome::Completed(analysis),
        Err(err) => {
            warn!(home = %request.home_team, away = %request.away_team, error = %err, "analysis failed");
            AnalysisOutcome::Failed { error: err.to_string() }
        }
    }
}

/// Stand-in used when no API key is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledAnalysis;

#[async_trait]
impl AnalysisCaller for DisabledAnalysis {
    async fn analyze(&self, _request: &AnalysisRequest) -> Result<MatchAnalysis, AnalysisError> {
        Err(AnalysisError::NotConfigured)
    }
}

#[derive(Debug, Clone)]
pub struct HttpAnalysisConfig {
    pub api_key: String,
    pub model: String,
    pub endpoint: String,
    pub timeout: Duration,
}

impl HttpAnalysisConfig {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpAnalysisCaller {
    client: reqwest::Client,
    config: HttpAnalysisConfig,
}

impl HttpAnalysisCaller {
    pub fn new(config: HttpAnalysisConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("building analysis client")?;
        Ok(Self { client, config })
    }

    fn url(&self) -> String {
        format!(
            "{}/{}:generateContent",
            self.config.endpoint.trim_end_matches('/'),
            self.config.model
        )
    }
}

#[async_trait]
impl AnalysisCaller for HttpAnalysisCaller {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<MatchAnalysis, AnalysisError> {
        if request.commentary.is_empty() {
            return Err(AnalysisError::NoCommentary);
        }
        info!(home = %request.home_team, away = %request.away_team, "requesting match analysis");

        let body = json!({
            "contents": [{ "parts": [{ "text": build_prompt(request) }] }],
            "generationConfig": { "responseMimeType": "application/json" },
        });
        let resp = self
            .client
            .post(self.url())
            .query(&[("key", self.config.api_key.as_str())])
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(classify_failure(status.as_u16(), text));
        }

        let envelope: JsonValue =
            serde_json::from_str(&text).map_err(|e| AnalysisError::Malformed(e.to_string()))?;
        let answer = envelope
            .pointer("/candidates/0/content/parts/0/text")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| AnalysisError::Malformed("response carried no text part".to_string()))?;
        parse_analysis(answer)
    }
}

fn classify_failure(status: u16, body: String) -> AnalysisError {
    let lowered = body.to_lowercase();
    if status == 429 || lowered.contains("quota") || lowered.contains("resource_exhausted") {
        AnalysisError::RateLimited(body)
    } else {
        AnalysisError::Http { status, body }
    }
}

fn build_prompt(request: &AnalysisRequest) -> String {
    let mut prompt = format!(
        "Analyse the commentary of {} (home) vs {} (away). Reply with a JSON object with keys \
         \"detailed_summary\" and \"tldr\".\n",
        request.home_team, request.away_team
    );
    if let Ok(stats) = serde_json::to_string(&request.stats.known) {
        prompt.push_str("Official statistics: ");
        prompt.push_str(&stats);
        prompt.push('\n');
    }
    prompt.push_str("Commentary:\n");
    for line in &request.commentary {
        prompt.push_str(line);
        prompt.push('\n');
    }
    prompt
}

#[derive(Debug, Deserialize)]
struct RawAnalysis {
    detailed_summary: Option<String>,
    tldr: Option<String>,
}

/// Parses the model's JSON answer, deriving `tldr` from the summary when absent.
pub fn parse_analysis(answer: &str) -> Result<MatchAnalysis, AnalysisError> {
    let trimmed = answer
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    let raw: RawAnalysis = serde_json::from_str(trimmed).map_err(|e| AnalysisError::Malformed(e.to_string()))?;
    let detailed_summary = raw
        .detailed_summary
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| AnalysisError::Malformed("missing detailed_summary".to_string()))?;
    let tldr = match raw.tldr.filter(|s| !s.trim().is_empty()) {
        Some(tldr) => tldr,
        None => fallback_tldr(&detailed_summary),
    };
    Ok(MatchAnalysis { detailed_summary, tldr })
}

/// First two sentences of the summary, capped at 200 characters.
pub fn fallback_tldr(summary: &str) -> String {
    let sentences: Vec<&str> = summary
        .split_inclusive(['.', '!', '?'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .take(2)
        .collect();
    let joined = sentences.join(" ");
    if joined.chars().count() <= TLDR_MAX_CHARS {
        return joined;
    }
    let mut cut: String = joined.chars().take(TLDR_MAX_CHARS - 3).collect();
    cut.push_str("...");
    cut
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyCaller {
        calls: AtomicU32,
        fail_first: u32,
    }

    #[async_trait]
    impl AnalysisCaller for FlakyCaller {
        async fn analyze(&self, _request: &AnalysisRequest) -> Result<MatchAnalysis, AnalysisError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.fail_first {
                Err(AnalysisError::RateLimited("quota".into()))
            } else {
                Ok(MatchAnalysis {
                    detailed_summary: "Home pressed late.".into(),
                    tldr: "Late pressure.".into(),
                })
            }
        }
    }

    fn request(commentary: &[&str]) -> AnalysisRequest {
        AnalysisRequest {
            home_team: "Ajax".into(),
            away_team: "PSV".into(),
            commentary: commentary.iter().map(|s| s.to_string()).collect(),
            stats: MatchStats::default(),
        }
    }

    fn fast_policy() -> BackoffPolicy {
        BackoffPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    #[test]
    fn missing_tldr_falls_back_to_first_two_sentences() {
        let parsed = parse_analysis(
            r#"{"detailed_summary": "Ajax dominated. PSV only countered. Corners came late."}"#,
        )
        .expect("parse");
        assert_eq!(parsed.tldr, "Ajax dominated. PSV only countered.");
    }

    #[test]
    fn fallback_tldr_is_capped() {
        let long = format!("{}. Second.", "a".repeat(400));
        let tldr = fallback_tldr(&long);
        assert_eq!(tldr.chars().count(), 200);
        assert!(tldr.ends_with("..."));
    }

    #[test]
    fn fenced_json_answers_parse() {
        let parsed = parse_analysis("```json\n{\"detailed_summary\": \"x.\", \"tldr\": \"y\"}\n```").expect("parse");
        assert_eq!(parsed.tldr, "y");
    }

    #[test]
    fn quota_messages_are_rate_limits() {
        assert!(matches!(classify_failure(429, String::new()), AnalysisError::RateLimited(_)));
        assert!(matches!(
            classify_failure(400, "Quota exceeded for metric".into()),
            AnalysisError::RateLimited(_)
        ));
        assert!(matches!(classify_failure(500, "boom".into()), AnalysisError::Http { status: 500, .. }));
    }

    #[tokio::test]
    async fn rate_limits_are_retried_until_success() {
        let caller = FlakyCaller {
            calls: AtomicU32::new(0),
            fail_first: 2,
        };
        let outcome = analyze_with_backoff(&caller, &fast_policy(), &request(&["12' corner"])).await;
        assert_eq!(outcome.completed().map(|a| a.tldr.as_str()), Some("Late pressure."));
        assert_eq!(caller.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_become_a_tagged_failure() {
        let caller = FlakyCaller {
            calls: AtomicU32::new(0),
            fail_first: 10,
        };
        let outcome = analyze_with_backoff(&caller, &fast_policy(), &request(&["12' corner"])).await;
        assert!(matches!(outcome, AnalysisOutcome::Failed { .. }));
        assert_eq!(caller.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn empty_commentary_never_calls_out() {
        let caller = FlakyCaller {
            calls: AtomicU32::new(0),
            fail_first: 0,
        };
        let outcome = analyze_with_backoff(&caller, &fast_policy(), &request(&[])).await;
        assert!(matches!(outcome, AnalysisOutcome::Failed { .. }));
        assert_eq!(caller.calls.load(Ordering::SeqCst), 0);
    }
}
