//! Store access, throttling-aware calls, page fetching and immutable batch artifacts.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info_span, Instrument};
use uuid::Uuid;

pub mod backoff;
pub mod remote;

pub use backoff::{
    call_with_backoff, call_with_backoff_using, classify_status, BackoffPolicy, CallError, RetryDisposition,
    Throttled,
};
pub use remote::{fetch_all, ConfigError, MemoryStore, RemoteStore, RestStore, Row, StoreConfig, StoreError};

pub const CRATE_NAME: &str = "matchfeed-storage";

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Content-addressed directory of scraped batches awaiting (or kept after) sync.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn batch_relative_path(&self, captured_at: DateTime<Utc>, source_id: &str, content_hash: &str) -> PathBuf {
        PathBuf::from(captured_at.format("%Y%m%d_%H%M%S").to_string())
            .join(source_id)
            .join(format!("{content_hash}.json"))
    }

    /// Serializes `value` as pretty JSON and writes it under its content hash.
    pub async fn store_json<T: Serialize>(
        &self,
        captured_at: DateTime<Utc>,
        source_id: &str,
        value: &T,
    ) -> anyhow::Result<StoredArtifact> {
        let bytes = serde_json::to_vec_pretty(value).context("serializing batch artifact")?;
        let content_hash = Self::sha256_hex(&bytes);
        let relative_path = self.batch_relative_path(captured_at, source_id, &content_hash);
        let absolute_path = self.root.join(&relative_path);

        let deduplicated = write_atomically(&absolute_path, &bytes).await?;
        Ok(StoredArtifact {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated,
        })
    }

    pub async fn load_json<T: DeserializeOwned>(path: impl AsRef<Path>) -> anyhow::Result<T> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

/// Writes through a temp file and renames into place. Returns `true` when
/// identical content already existed at `path`.
async fn write_atomically(path: &Path, bytes: &[u8]) -> anyhow::Result<bool> {
    let parent = path
        .parent()
        .with_context(|| format!("artifact path {} has no parent", path.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating artifact directory {}", parent.display()))?;

    if fs::try_exists(path)
        .await
        .with_context(|| format!("checking artifact path {}", path.display()))?
    {
        return Ok(true);
    }

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp artifact file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp artifact file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp artifact file {}", temp_path.display()))?;
    drop(file);

    match fs::rename(&temp_path, path).await {
        Ok(()) => Ok(false),
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
            let _ = fs::remove_file(&temp_path).await;
            Ok(true)
        }
        Err(err) => {
            let _ = fs::remove_file(&temp_path).await;
            Err(err).with_context(|| format!("renaming {} -> {}", temp_path.display(), path.display()))
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy {
                max_attempts: 3,
                base_delay: Duration::from_secs(2),
                max_delay: Duration::from_secs(30),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub final_url: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl Throttled for FetchError {
    fn disposition(&self) -> RetryDisposition {
        match self {
            FetchError::HttpStatus { status, .. } => reqwest::StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            FetchError::Request(_) => RetryDisposition::NonRetryable,
        }
    }
}

/// Page fetcher for source sites; backs off only when the origin throttles.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn fetch_text(&self, source_id: &str, url: &str) -> Result<FetchedPage, CallError<FetchError>> {
        let span = info_span!("http_fetch", source_id, url);
        call_with_backoff(&self.backoff, |_attempt| self.fetch_once(url))
            .instrument(span)
            .await
    }

    async fn fetch_once(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }
        let body = resp.text().await?;
        Ok(FetchedPage { final_url, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn artifact_hashing_is_stable() {
        let hash = ArtifactStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn identical_batches_deduplicate_by_hash_path() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());
        let captured_at = DateTime::parse_from_rfc3339("2026-02-24T12:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);
        let batch = json!([{ "home_team": "Ajax", "away_team": "PSV" }]);

        let first = store.store_json(captured_at, "eredivisie", &batch).await.expect("first");
        let second = store.store_json(captured_at, "eredivisie", &batch).await.expect("second");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.absolute_path.exists());

        let loaded: serde_json::Value = ArtifactStore::load_json(&first.absolute_path).await.expect("load");
        assert_eq!(loaded, batch);
    }

    #[test]
    fn throttled_page_fetch_is_retryable() {
        let throttled = FetchError::HttpStatus {
            status: 429,
            url: "https://example.test".into(),
        };
        let missing = FetchError::HttpStatus {
            status: 404,
            url: "https://example.test".into(),
        };
        assert_eq!(throttled.disposition(), RetryDisposition::Retryable);
        assert_eq!(missing.disposition(), RetryDisposition::NonRetryable);
    }
}
