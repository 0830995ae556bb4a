//! Remote store contract, a PostgREST-style client and an in-memory store.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Response, StatusCode};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

/// One store row as a JSON object.
pub type Row = serde_json::Map<String, Value>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("relation `{table}` does not exist")]
    MissingRelation { table: String },
    #[error("unknown column on `{table}`: {message}")]
    MissingColumn { table: String, message: String },
    #[error("call on `{table}` timed out after {after:?}")]
    Timeout { table: String, after: Duration },
    #[error("http {status} from `{table}`: {body}")]
    Http { table: String, status: u16, body: String },
    #[error("row rejected by `{table}`: {reason}")]
    Rejected { table: String, reason: String },
    #[error("store request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("malformed store response: {0}")]
    Decode(String),
}

impl StoreError {
    /// Schema problems are logged and the operation skipped rather than aborting a run.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, StoreError::MissingRelation { .. } | StoreError::MissingColumn { .. })
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingVar(&'static str),
    #[error("invalid value for {var}: {value}")]
    InvalidValue { var: &'static str, value: String },
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn select_range(&self, table: &str, offset: usize, limit: usize) -> Result<Vec<Row>, StoreError>;
    async fn insert(&self, table: &str, rows: &[Row]) -> Result<(), StoreError>;
    async fn update_by_id(&self, table: &str, id: &Value, patch: &Row) -> Result<(), StoreError>;
}

/// Reads a whole table page by page; a short page marks the end of the data.
pub async fn fetch_all(store: &dyn RemoteStore, table: &str, page_size: usize) -> Result<Vec<Row>, StoreError> {
    let page_size = page_size.max(1);
    let mut rows = Vec::new();
    let mut pages = 0usize;
    loop {
        let page = store.select_range(table, rows.len(), page_size).await?;
        pages += 1;
        let short = page.len() < page_size;
        rows.extend(page);
        if short {
            break;
        }
    }
    debug!(table, pages, rows = rows.len(), "fetched table");
    Ok(rows)
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
}

impl StoreConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let base_url = required_var("STORE_URL")?;
        let api_key = required_var("STORE_KEY")?;
        let timeout = match std::env::var("MATCHFEED_STORE_TIMEOUT_SECS") {
            Ok(raw) => Duration::from_secs(raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
                var: "MATCHFEED_STORE_TIMEOUT_SECS",
                value: raw.clone(),
            })?),
            Err(_) => Duration::from_secs(30),
        };
        Ok(Self {
            base_url,
            api_key,
            timeout,
        })
    }
}

fn required_var(var: &'static str) -> Result<String, ConfigError> {
    match std::env::var(var) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ConfigError::MissingVar(var)),
    }
}

/// Client for a PostgREST-compatible endpoint (`/rest/v1/<table>`).
#[derive(Debug, Clone)]
pub struct RestStore {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl RestStore {
    pub fn new(config: StoreConfig) -> Result<Self, StoreError> {
        let mut headers = HeaderMap::new();
        let key = HeaderValue::from_str(&config.api_key)
            .map_err(|e| StoreError::Decode(format!("invalid api key header: {e}")))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", config.api_key))
            .map_err(|e| StoreError::Decode(format!("invalid api key header: {e}")))?;
        headers.insert("apikey", key);
        headers.insert(AUTHORIZATION, bearer);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .default_headers(headers)
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            timeout: config.timeout,
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn send_error(&self, table: &str, err: reqwest::Error) -> StoreError {
        if err.is_timeout() {
            StoreError::Timeout {
                table: table.to_string(),
                after: self.timeout,
            }
        } else {
            StoreError::Request(err)
        }
    }

    async fn checked(&self, table: &str, resp: Response) -> Result<Response, StoreError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(classify_failure(table, status, body))
    }
}

fn classify_failure(table: &str, status: StatusCode, body: String) -> StoreError {
    if status == StatusCode::NOT_FOUND || body.contains("42P01") {
        StoreError::MissingRelation {
            table: table.to_string(),
        }
    } else if body.contains("42703") || body.contains("PGRST204") {
        StoreError::MissingColumn {
            table: table.to_string(),
            message: body,
        }
    } else {
        StoreError::Http {
            table: table.to_string(),
            status: status.as_u16(),
            body,
        }
    }
}

fn id_filter(id: &Value) -> String {
    match id {
        Value::String(s) => format!("eq.{s}"),
        other => format!("eq.{other}"),
    }
}

#[async_trait]
impl RemoteStore for RestStore {
    async fn select_range(&self, table: &str, offset: usize, limit: usize) -> Result<Vec<Row>, StoreError> {
        let resp = self
            .client
            .get(self.table_url(table))
            .query(&[
                ("select", "*".to_string()),
                ("order", "id.asc".to_string()),
                ("offset", offset.to_string()),
                ("limit", limit.to_string()),
            ])
            .send()
            .await
            .map_err(|e| self.send_error(table, e))?;
        let resp = self.checked(table, resp).await?;
        resp.json::<Vec<Row>>()
            .await
            .map_err(|e| self.send_error(table, e))
    }

    async fn insert(&self, table: &str, rows: &[Row]) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }
        let resp = self
            .client
            .post(self.table_url(table))
            .header("Prefer", "return=minimal")
            .json(rows)
            .send()
            .await
            .map_err(|e| self.send_error(table, e))?;
        self.checked(table, resp).await?;
        Ok(())
    }

    async fn update_by_id(&self, table: &str, id: &Value, patch: &Row) -> Result<(), StoreError> {
        let resp = self
            .client
            .patch(self.table_url(table))
            .query(&[("id", id_filter(id))])
            .header("Prefer", "return=minimal")
            .json(patch)
            .send()
            .await
            .map_err(|e| self.send_error(table, e))?;
        self.checked(table, resp).await?;
        Ok(())
    }
}

/// In-process [`RemoteStore`] with sequential integer ids. Batch inserts are
/// all-or-nothing, like a single SQL statement.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<HashMap<String, Vec<Row>>>,
    missing: HashSet<String>,
    rejected: Vec<(String, Value)>,
    next_id: AtomicU64,
    select_calls: AtomicUsize,
    write_calls: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds rows, assigning ids to rows that have none.
    pub fn with_rows(mut self, table: &str, rows: impl IntoIterator<Item = Row>) -> Self {
        let mut seeded = Vec::new();
        for mut row in rows {
            if !row.contains_key("id") {
                let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
                row.insert("id".into(), Value::from(id));
            }
            seeded.push(row);
        }
        self.tables
            .get_mut()
            .entry(table.to_string())
            .or_default()
            .extend(seeded);
        self
    }

    /// Any table named here answers like a relation that does not exist.
    pub fn with_missing_table(mut self, table: &str) -> Self {
        self.missing.insert(table.to_string());
        self
    }

    /// Rows or patches carrying `column == value` are rejected.
    pub fn rejecting(mut self, column: &str, value: Value) -> Self {
        self.rejected.push((column.to_string(), value));
        self
    }

    pub async fn rows(&self, table: &str) -> Vec<Row> {
        self.tables.lock().await.get(table).cloned().unwrap_or_default()
    }

    pub fn select_calls(&self) -> usize {
        self.select_calls.load(Ordering::SeqCst)
    }

    pub fn write_calls(&self) -> usize {
        self.write_calls.load(Ordering::SeqCst)
    }

    fn check_table(&self, table: &str) -> Result<(), StoreError> {
        if self.missing.contains(table) {
            return Err(StoreError::MissingRelation {
                table: table.to_string(),
            });
        }
        Ok(())
    }

    fn check_row(&self, table: &str, row: &Row) -> Result<(), StoreError> {
        for (column, value) in &self.rejected {
            if row.get(column) == Some(value) {
                return Err(StoreError::Rejected {
                    table: table.to_string(),
                    reason: format!("{column} = {value}"),
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn select_range(&self, table: &str, offset: usize, limit: usize) -> Result<Vec<Row>, StoreError> {
        self.select_calls.fetch_add(1, Ordering::SeqCst);
        self.check_table(table)?;
        let tables = self.tables.lock().await;
        Ok(tables
            .get(table)
            .map(|rows| rows.iter().skip(offset).take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn insert(&self, table: &str, rows: &[Row]) -> Result<(), StoreError> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        self.check_table(table)?;
        for row in rows {
            self.check_row(table, row)?;
        }
        let mut tables = self.tables.lock().await;
        let target = tables.entry(table.to_string()).or_default();
        for row in rows {
            let mut row = row.clone();
            let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
            row.insert("id".into(), Value::from(id));
            target.push(row);
        }
        Ok(())
    }

    async fn update_by_id(&self, table: &str, id: &Value, patch: &Row) -> Result<(), StoreError> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        self.check_table(table)?;
        self.check_row(table, patch)?;
        let mut tables = self.tables.lock().await;
        let row = tables
            .get_mut(table)
            .and_then(|rows| rows.iter_mut().find(|r| r.get("id") == Some(id)))
            .ok_or_else(|| StoreError::Rejected {
                table: table.to_string(),
                reason: format!("no row with id {id}"),
            })?;
        for (column, value) in patch {
            row.insert(column.clone(), value.clone());
        }
        Ok(())
    }
}
