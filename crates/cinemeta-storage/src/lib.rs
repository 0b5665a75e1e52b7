//! HTTP fetch-with-backoff, CSV tables and checkpoint persistence for cinemeta.

use std::collections::HashSet;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use cinemeta_core::EnrichmentRecord;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cinemeta-storage";

/// Cell values read as "no value" in addition to the empty string.
pub const MISSING_MARKERS: &[&str] = &["nan", "na", "null", "none"];

/// Write bytes to `path` through a sibling temp file and an atomic rename.
///
/// Parent directories are created as needed; an existing file is replaced.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Success,
    /// 429: retry, honouring `Retry-After` when the server sends one.
    RateLimited,
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_success() {
        RetryDisposition::Success
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::RateLimited
    } else if status.is_server_error() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Transport-level failures, including a body cut off mid-read, are retryable.
pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() || err.is_decode()
    {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Longest wait a server-provided `Retry-After` can impose.
pub const RETRY_AFTER_CEILING: Duration = Duration::from_secs(60 * 60);

/// `Retry-After` as whole seconds. HTTP-date values are not supported.
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Added on top of a server-provided `Retry-After`.
    pub retry_after_margin: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            retry_after_margin: Duration::from_secs(1),
        }
    }
}

impl BackoffPolicy {
    /// A policy that never retries.
    pub fn single_attempt() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("gave up on {url} after {attempts} attempts: {last_failure}")]
    RetriesExhausted {
        attempts: usize,
        url: String,
        last_failure: String,
    },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Drive `send` until it yields a decodable success or the policy says stop.
///
/// Success returns the decoded body untouched. 429 and 5xx responses and
/// transport failures sleep and retry; any other status fails on the spot.
/// There is no sleep after the final attempt.
pub async fn fetch_with_backoff<T, F, Fut>(
    policy: &BackoffPolicy,
    url: &str,
    mut send: F,
) -> Result<T, FetchError>
where
    T: DeserializeOwned,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<reqwest::Response, reqwest::Error>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut last_failure = String::new();

    for attempt in 0..max_attempts {
        let backoff = policy.delay_for_attempt(attempt);

        let wait = match send().await {
            Ok(resp) => {
                let status = resp.status();
                match classify_status(status) {
                    RetryDisposition::Success => match resp.bytes().await {
                        Ok(body) => return decode_json(&body, url),
                        Err(err) => {
                            let err = err.without_url();
                            if classify_reqwest_error(&err) == RetryDisposition::NonRetryable {
                                return Err(FetchError::Request(err));
                            }
                            last_failure = format!("reading body: {err}");
                            backoff
                        }
                    },
                    RetryDisposition::RateLimited => {
                        last_failure = format!("http status {status}");
                        retry_after(resp.headers())
                            .map(|d| {
                                d.saturating_add(policy.retry_after_margin)
                                    .min(RETRY_AFTER_CEILING)
                            })
                            .unwrap_or(backoff)
                    }
                    RetryDisposition::Retryable => {
                        last_failure = format!("http status {status}");
                        backoff
                    }
                    RetryDisposition::NonRetryable => {
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: url.to_string(),
                        });
                    }
                }
            }
            Err(err) => {
                // The query string carries the API key.
                let err = err.without_url();
                if classify_reqwest_error(&err) == RetryDisposition::NonRetryable {
                    return Err(FetchError::Request(err));
                }
                last_failure = err.to_string();
                backoff
            }
        };

        if attempt + 1 == max_attempts {
            break;
        }
        warn!(
            url,
            attempt = attempt + 1,
            wait_ms = wait.as_millis() as u64,
            reason = %last_failure,
            "retrying request"
        );
        tokio::time::sleep(wait).await;
    }

    Err(FetchError::RetriesExhausted {
        attempts: max_attempts,
        url: url.to_string(),
        last_failure,
    })
}

fn decode_json<T: DeserializeOwned>(body: &[u8], url: &str) -> Result<T, FetchError> {
    serde_json::from_slice(body).map_err(|source| FetchError::Decode {
        url: url.to_string(),
        source,
    })
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: None,
            global_concurrency: 16,
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
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
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
        })
    }

    pub async fn fetch_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
        policy: &BackoffPolicy,
    ) -> Result<T, FetchError> {
        let _permit = self
            .global_limit
            .acquire()
            .await
            .expect("semaphore not closed");
        fetch_with_backoff(policy, url, || self.client.get(url).query(query).send()).await
    }

    /// Like [`HttpFetcher::fetch_json`], but a failure is logged and becomes `None`.
    pub async fn try_fetch_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
        policy: &BackoffPolicy,
    ) -> Option<T> {
        match self.fetch_json(url, query, policy).await {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(url, error = %err, "no result");
                None
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum TableError {
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("missing required column `{0}`")]
    MissingColumn(String),
}

pub fn is_missing(cell: &str) -> bool {
    let cell = cell.trim();
    cell.is_empty() || MISSING_MARKERS.iter().any(|m| cell.eq_ignore_ascii_case(m))
}

/// Integer id from a cell, accepting the `42.0` form float columns produce.
pub fn parse_id(cell: &str) -> Option<i64> {
    let cell = cell.trim();
    if let Ok(id) = cell.parse::<i64>() {
        return Some(id);
    }
    match cell.parse::<f64>() {
        Ok(v) if v.is_finite() && v.fract() == 0.0 && v.abs() < i64::MAX as f64 => Some(v as i64),
        _ => None,
    }
}

pub fn parse_number(cell: &str) -> Option<f64> {
    if is_missing(cell) {
        return None;
    }
    cell.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

pub fn format_number(value: f64) -> String {
    format!("{value}")
}

/// String-typed CSV table with a header row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new(headers: Vec<String>) -> Self {
        Self {
            headers,
            rows: Vec::new(),
        }
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    pub fn require_column(&self, name: &str) -> Result<usize, TableError> {
        self.column_index(name)
            .ok_or_else(|| TableError::MissingColumn(name.to_string()))
    }

    /// Index of `name`, appending an all-empty column when it does not exist yet.
    pub fn ensure_column(&mut self, name: &str) -> usize {
        if let Some(idx) = self.column_index(name) {
            return idx;
        }
        self.headers.push(name.to_string());
        for row in &mut self.rows {
            row.push(String::new());
        }
        self.headers.len() - 1
    }

    /// Rows shorter than the header are padded with empty cells, longer ones truncated.
    pub fn push_row(&mut self, mut row: Vec<String>) {
        row.resize(self.headers.len(), String::new());
        self.rows.push(row);
    }

    /// Present (non-missing) cell value.
    pub fn cell(&self, row: usize, col: usize) -> Option<&str> {
        self.rows
            .get(row)
            .and_then(|r| r.get(col))
            .map(String::as_str)
            .filter(|c| !is_missing(c))
    }

    pub fn set_cell(&mut self, row: usize, col: usize, value: Option<String>) {
        if let Some(cell) = self.rows.get_mut(row).and_then(|r| r.get_mut(col)) {
            *cell = value.unwrap_or_default();
        }
    }

    /// Set the cell only when it is currently missing. Returns whether it changed.
    pub fn fill_missing(&mut self, row: usize, col: usize, value: Option<String>) -> bool {
        let Some(value) = value.filter(|v| !is_missing(v)) else {
            return false;
        };
        if self.cell(row, col).is_some() {
            return false;
        }
        let before = self.rows.get(row).map_or(0, Vec::len);
        if col >= before {
            return false;
        }
        self.set_cell(row, col, Some(value));
        true
    }

    pub fn number(&self, row: usize, col: usize) -> Option<f64> {
        self.cell(row, col).and_then(parse_number)
    }

    pub fn id_at(&self, row: usize, col: usize) -> Option<i64> {
        self.cell(row, col).and_then(parse_id)
    }

    pub fn into_rows(self) -> (Vec<String>, Vec<Vec<String>>) {
        (self.headers, self.rows)
    }

    pub fn from_csv_reader<R: io::Read>(reader: R) -> Result<Self, TableError> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_reader(reader);
        let headers = reader
            .headers()?
            .iter()
            .map(|h| h.trim().to_string())
            .collect::<Vec<_>>();
        let mut table = Table::new(headers);
        for record in reader.records() {
            let record = record?;
            table.push_row(record.iter().map(str::to_string).collect());
        }
        Ok(table)
    }

    pub fn to_csv_bytes(&self) -> Result<Vec<u8>, TableError> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        if !self.headers.is_empty() {
            writer.write_record(&self.headers)?;
        }
        for row in &self.rows {
            writer.write_record(row)?;
        }
        writer.into_inner().map_err(|e| TableError::Io(e.into_error()))
    }
}

pub async fn load_table(path: &Path) -> anyhow::Result<Table> {
    let bytes = fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    Table::from_csv_reader(bytes.as_slice()).with_context(|| format!("parsing {}", path.display()))
}

pub async fn save_table(path: &Path, table: &Table) -> anyhow::Result<()> {
    let bytes = table
        .to_csv_bytes()
        .with_context(|| format!("serializing {}", path.display()))?;
    write_atomic(path, &bytes).await
}

const CHECKPOINT_HEADERS: [&str; 5] = ["id", "budget", "revenue", "director", "avg_cast_popularity"];

/// Whole-file snapshot of the enrichment records produced so far.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records from a previous run; empty when no checkpoint exists yet.
    pub async fn load(&self) -> anyhow::Result<Vec<EnrichmentRecord>> {
        if !fs::try_exists(&self.path)
            .await
            .with_context(|| format!("checking checkpoint {}", self.path.display()))?
        {
            return Ok(Vec::new());
        }
        let bytes = fs::read(&self.path)
            .await
            .with_context(|| format!("reading checkpoint {}", self.path.display()))?;
        let mut reader = csv::Reader::from_reader(bytes.as_slice());
        let records = reader
            .deserialize::<EnrichmentRecord>()
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("parsing checkpoint {}", self.path.display()))?;
        debug!(path = %self.path.display(), records = records.len(), "loaded checkpoint");
        Ok(records)
    }

    pub async fn save(&self, records: &[EnrichmentRecord]) -> anyhow::Result<()> {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(Vec::new());
        writer
            .write_record(CHECKPOINT_HEADERS)
            .context("writing checkpoint header")?;
        for record in records {
            writer
                .serialize(record)
                .with_context(|| format!("serializing checkpoint record {}", record.id))?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|e| e.into_error())
            .context("flushing checkpoint buffer")?;
        write_atomic(&self.path, &bytes).await?;
        debug!(path = %self.path.display(), records = records.len(), "checkpoint written");
        Ok(())
    }

    pub async fn completed_ids(&self) -> anyhow::Result<HashSet<i64>> {
        Ok(self.load().await?.into_iter().map(|r| r.id).collect())
    }
}
