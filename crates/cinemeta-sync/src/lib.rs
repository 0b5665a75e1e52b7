//! Discovery + enrichment pipelines, keyed merge and snapshot export.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use arrow_array::{ArrayRef, Float64Array, Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use cinemeta_adapters::{MovieSource, TmdbClient, TmdbClientConfig};
use cinemeta_core::{
    log1p_positive, profit_ratio, DiscoveredMovie, DiscoveredMovieRow, EnrichmentRecord,
    AVG_CAST_POPULARITY_COLUMN, BUDGET_COLUMN, BUDGET_LOG_COLUMN, DIRECTOR_COLUMN,
    DISCOVERED_MOVIE_COLUMNS, ID_COLUMN, PROFIT_RATIO_COLUMN, REVENUE_COLUMN, REVENUE_LOG_COLUMN,
};
use cinemeta_storage::{
    format_number, is_missing, load_table, parse_id, save_table, write_atomic, BackoffPolicy,
    CheckpointStore, HttpClientConfig, Table, TableError,
};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cinemeta-sync";

/// Columns written as floats in the parquet snapshot; everything else but `id` stays text.
const NUMERIC_COLUMNS: &[&str] = &[
    BUDGET_COLUMN,
    REVENUE_COLUMN,
    AVG_CAST_POPULARITY_COLUMN,
    BUDGET_LOG_COLUMN,
    REVENUE_LOG_COLUMN,
    PROFIT_RATIO_COLUMN,
    "popularity",
    "vote_average",
    "vote_count",
];

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub api_key: String,
    pub api_base_url: String,
    pub language: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub data_dir: PathBuf,
    pub settings_path: PathBuf,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            api_key: std::env::var("TMDB_API_KEY").unwrap_or_default(),
            api_base_url: std::env::var("TMDB_BASE_URL")
                .unwrap_or_else(|_| cinemeta_adapters::DEFAULT_BASE_URL.to_string()),
            language: std::env::var("TMDB_LANGUAGE")
                .unwrap_or_else(|_| cinemeta_adapters::DEFAULT_LANGUAGE.to_string()),
            user_agent: std::env::var("CINEMETA_USER_AGENT")
                .unwrap_or_else(|_| "cinemeta/0.1".to_string()),
            http_timeout_secs: std::env::var("CINEMETA_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            data_dir: std::env::var("CINEMETA_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data_cleaned")),
            settings_path: std::env::var("CINEMETA_SETTINGS")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("cinemeta.yaml")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoverySettings {
    pub start_year: i32,
    pub end_year: i32,
    pub max_pages: u32,
    pub page_delay_ms: u64,
    pub sort_by: String,
    pub max_attempts: usize,
    pub output_file: String,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            start_year: 2015,
            end_year: 2023,
            max_pages: 200,
            page_delay_ms: 100,
            sort_by: cinemeta_adapters::DEFAULT_SORT_BY.to_string(),
            max_attempts: 1,
            output_file: "tmdb_api_movies.csv".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrichmentSettings {
    pub workers: usize,
    pub checkpoint_every: usize,
    pub call_delay_ms: u64,
    pub max_attempts: usize,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub retry_after_margin_ms: u64,
    pub input_file: String,
    pub checkpoint_file: String,
    pub output_file: String,
    pub parquet_snapshot: bool,
}

impl Default for EnrichmentSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            checkpoint_every: 200,
            call_delay_ms: 250,
            max_attempts: 5,
            base_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
            retry_after_margin_ms: 1_000,
            input_file: "movies_cleaned.csv".to_string(),
            checkpoint_file: "tmdb_enrichment_checkpoint.csv".to_string(),
            output_file: "movies_enriched.csv".to_string(),
            parquet_snapshot: false,
        }
    }
}

impl EnrichmentSettings {
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_backoff_ms),
            max_delay: Duration::from_millis(self.max_backoff_ms),
            retry_after_margin: Duration::from_millis(self.retry_after_margin_ms),
        }
    }
}

/// Tunables read from the optional settings file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub discovery: DiscoverySettings,
    pub enrichment: EnrichmentSettings,
}

impl PipelineSettings {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let settings: Self = if text.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(text).context("parsing pipeline settings")?
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Defaults when `path` does not exist.
    pub async fn load(path: &Path) -> Result<Self> {
        if !fs::try_exists(path)
            .await
            .with_context(|| format!("checking {}", path.display()))?
        {
            debug!(path = %path.display(), "no settings file; using defaults");
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        let d = &self.discovery;
        ensure!(
            d.start_year <= d.end_year,
            "discovery.start_year {} is after discovery.end_year {}",
            d.start_year,
            d.end_year
        );
        ensure!(d.max_pages >= 1, "discovery.max_pages must be at least 1");
        ensure!(d.max_attempts >= 1, "discovery.max_attempts must be at least 1");
        let e = &self.enrichment;
        ensure!(e.workers >= 1, "enrichment.workers must be at least 1");
        ensure!(
            e.checkpoint_every >= 1,
            "enrichment.checkpoint_every must be at least 1"
        );
        ensure!(e.max_attempts >= 1, "enrichment.max_attempts must be at least 1");
        Ok(())
    }
}

pub fn tmdb_client_config(config: &SyncConfig, settings: &PipelineSettings) -> TmdbClientConfig {
    let lookup_policy = settings.enrichment.backoff_policy();
    TmdbClientConfig {
        api_key: config.api_key.clone(),
        base_url: config.api_base_url.clone(),
        language: config.language.clone(),
        sort_by: settings.discovery.sort_by.clone(),
        discover_policy: BackoffPolicy {
            max_attempts: settings.discovery.max_attempts,
            ..lookup_policy
        },
        lookup_policy,
        http: HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        },
    }
}

#[derive(Debug, Clone)]
pub struct DiscoveryJob {
    pub start_year: i32,
    pub end_year: i32,
    pub max_pages: u32,
    pub page_delay: Duration,
    pub output_path: PathBuf,
}

impl DiscoveryJob {
    pub fn from_settings(config: &SyncConfig, settings: &DiscoverySettings) -> Self {
        Self {
            start_year: settings.start_year,
            end_year: settings.end_year,
            max_pages: settings.max_pages,
            page_delay: Duration::from_millis(settings.page_delay_ms),
            output_path: config.data_dir.join(&settings.output_file),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EnrichmentJob {
    pub input_path: PathBuf,
    pub checkpoint_path: PathBuf,
    pub output_path: PathBuf,
    pub workers: usize,
    pub checkpoint_every: usize,
    pub call_delay: Duration,
    pub parquet_snapshot: bool,
}

impl EnrichmentJob {
    pub fn from_settings(config: &SyncConfig, settings: &EnrichmentSettings) -> Self {
        Self {
            input_path: config.data_dir.join(&settings.input_file),
            checkpoint_path: config.data_dir.join(&settings.checkpoint_file),
            output_path: config.data_dir.join(&settings.output_file),
            workers: settings.workers,
            checkpoint_every: settings.checkpoint_every,
            call_delay: Duration::from_millis(settings.call_delay_ms),
            parquet_snapshot: settings.parquet_snapshot,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DiscoverySummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub years: usize,
    pub pages_requested: usize,
    pub pages_failed: usize,
    pub movies: usize,
    pub output_path: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnrichmentSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub input_rows: usize,
    pub resumed_records: usize,
    pub pending: usize,
    pub enriched: usize,
    pub discarded: usize,
    pub checkpoint_writes: usize,
    pub merged_rows: usize,
    pub output_path: String,
    pub parquet_manifest: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MergeSummary {
    pub input_rows: usize,
    pub checkpoint_records: usize,
    pub merged_rows: usize,
    pub output_path: String,
    pub parquet_manifest: Option<String>,
}

pub struct DiscoveryPipeline {
    source: Arc<dyn MovieSource>,
    job: DiscoveryJob,
}

impl DiscoveryPipeline {
    pub fn new(source: Arc<dyn MovieSource>, job: DiscoveryJob) -> Self {
        Self { source, job }
    }

    /// Walk every year and page, then write all results once.
    ///
    /// A failed page contributes nothing; there is no resume.
    pub async fn run(&self) -> Result<DiscoverySummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("discovery_run", %run_id);
        self.run_inner(run_id).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid) -> Result<DiscoverySummary> {
        let started_at = Utc::now();
        let mut movies: Vec<DiscoveredMovie> = Vec::new();
        let mut pages_requested = 0usize;
        let mut pages_failed = 0usize;

        for year in self.job.start_year..=self.job.end_year {
            info!(year, "fetching movies for year");

            pages_requested += 1;
            let total_pages = match self.source.discover_page(year, 1).await {
                Some(first) => {
                    let total = first.total_pages.clamp(1, self.job.max_pages.max(1));
                    movies.extend(first.results);
                    total
                }
                None => {
                    pages_failed += 1;
                    warn!(year, page = 1, "discover page failed");
                    1
                }
            };

            for page in 2..=total_pages {
                pages_requested += 1;
                match self.source.discover_page(year, page).await {
                    Some(data) => movies.extend(data.results),
                    None => {
                        pages_failed += 1;
                        warn!(year, page, "discover page failed");
                    }
                }
                info!(year, page, total_pages, "page fetched");
                tokio::time::sleep(self.job.page_delay).await;
            }
        }

        write_discovered_movies(&self.job.output_path, &movies).await?;
        info!(
            movies = movies.len(),
            output = %self.job.output_path.display(),
            "discovery output written"
        );

        Ok(DiscoverySummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            years: (self.job.start_year..=self.job.end_year).count(),
            pages_requested,
            pages_failed,
            movies: movies.len(),
            output_path: self.job.output_path.display().to_string(),
        })
    }
}

pub async fn write_discovered_movies(path: &Path, movies: &[DiscoveredMovie]) -> Result<()> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    writer
        .write_record(DISCOVERED_MOVIE_COLUMNS)
        .context("writing discovery header")?;
    for movie in movies {
        writer
            .serialize(DiscoveredMovieRow::from(movie))
            .with_context(|| format!("serializing discovered movie {}", movie.id))?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| e.into_error())
        .context("flushing discovery buffer")?;
    write_atomic(path, &bytes).await
}

/// Fetch details then credits for one movie.
///
/// `None` unless both calls produced a payload. Credits are not requested
/// when details already failed.
pub async fn enrich_movie(
    source: &dyn MovieSource,
    movie_id: i64,
    call_delay: Duration,
) -> Option<EnrichmentRecord> {
    let Some(details) = source.movie_details(movie_id).await else {
        warn!(movie_id, "details unavailable; skipping movie");
        return None;
    };
    tokio::time::sleep(call_delay).await;

    let credits = source.movie_credits(movie_id).await;
    tokio::time::sleep(call_delay).await;

    match credits {
        Some(credits) => Some(EnrichmentRecord::from_payloads(movie_id, &details, &credits)),
        None => {
            // Details are dropped too; a record needs both payloads.
            warn!(movie_id, "credits unavailable; discarding fetched details");
            None
        }
    }
}

/// Ids of rows lacking budget or revenue, in table order, minus `completed`.
pub fn pending_ids(table: &Table, completed: &HashSet<i64>) -> Result<Vec<i64>, TableError> {
    let id_col = table.require_column(ID_COLUMN)?;
    let budget_col = table.require_column(BUDGET_COLUMN)?;
    let revenue_col = table.require_column(REVENUE_COLUMN)?;

    let mut seen = HashSet::new();
    let mut pending = Vec::new();
    for row in 0..table.len() {
        if table.number(row, budget_col).is_some() && table.number(row, revenue_col).is_some() {
            continue;
        }
        let Some(id) = table.id_at(row, id_col) else {
            warn!(row, "row without a usable id; skipping");
            continue;
        };
        if completed.contains(&id) || !seen.insert(id) {
            continue;
        }
        pending.push(id);
    }
    Ok(pending)
}

/// Union `table` with `records` by id.
///
/// Existing cells win; a record only fills cells that are missing. Ids only
/// present in `records` become new rows. Duplicate ids collapse into their
/// first row. Derived columns are recomputed afterwards.
pub fn merge_enrichment(table: Table, records: &[EnrichmentRecord]) -> Result<Table, TableError> {
    let id_col = table.require_column(ID_COLUMN)?;
    let mut merged = Table::new(table.headers().to_vec());
    let budget_col = merged.ensure_column(BUDGET_COLUMN);
    let revenue_col = merged.ensure_column(REVENUE_COLUMN);
    let director_col = merged.ensure_column(DIRECTOR_COLUMN);
    let popularity_col = merged.ensure_column(AVG_CAST_POPULARITY_COLUMN);

    let mut row_by_id: HashMap<i64, usize> = HashMap::new();
    let (_, rows) = table.into_rows();
    for row in rows {
        let id = row
            .get(id_col)
            .filter(|c| !is_missing(c))
            .and_then(|c| parse_id(c));
        match id.and_then(|id| row_by_id.get(&id).copied()) {
            Some(existing) => {
                for (col, value) in row.into_iter().enumerate() {
                    merged.fill_missing(existing, col, Some(value));
                }
            }
            None => {
                merged.push_row(row);
                if let Some(id) = id {
                    row_by_id.insert(id, merged.len() - 1);
                }
            }
        }
    }

    for record in records {
        let row = match row_by_id.get(&record.id) {
            Some(&row) => row,
            None => {
                let mut fresh = vec![String::new(); merged.headers().len()];
                fresh[id_col] = record.id.to_string();
                merged.push_row(fresh);
                row_by_id.insert(record.id, merged.len() - 1);
                merged.len() - 1
            }
        };
        merged.fill_missing(row, budget_col, record.budget.map(format_number));
        merged.fill_missing(row, revenue_col, record.revenue.map(format_number));
        merged.fill_missing(row, director_col, record.director.clone());
        merged.fill_missing(
            row,
            popularity_col,
            record.avg_cast_popularity.map(format_number),
        );
    }

    recompute_derived_columns(&mut merged);
    Ok(merged)
}

/// Rewrite `budget_log`, `revenue_log` and `profit_ratio` from the monetary columns.
pub fn recompute_derived_columns(table: &mut Table) {
    let budget_col = table.ensure_column(BUDGET_COLUMN);
    let revenue_col = table.ensure_column(REVENUE_COLUMN);
    let budget_log_col = table.ensure_column(BUDGET_LOG_COLUMN);
    let revenue_log_col = table.ensure_column(REVENUE_LOG_COLUMN);
    let ratio_col = table.ensure_column(PROFIT_RATIO_COLUMN);

    for row in 0..table.len() {
        let budget = table.number(row, budget_col);
        let revenue = table.number(row, revenue_col);
        table.set_cell(row, budget_log_col, log1p_positive(budget).map(format_number));
        table.set_cell(row, revenue_log_col, log1p_positive(revenue).map(format_number));
        table.set_cell(row, ratio_col, profit_ratio(budget, revenue).map(format_number));
    }
}

/// Results gathered by the workers, plus the periodic checkpoint trigger.
struct ResultAccumulator {
    records: Vec<EnrichmentRecord>,
    enriched: usize,
    discarded: usize,
    checkpoint: CheckpointStore,
    checkpoint_every: usize,
    checkpoint_writes: usize,
}

impl ResultAccumulator {
    fn new(prior: Vec<EnrichmentRecord>, checkpoint: CheckpointStore, checkpoint_every: usize) -> Self {
        Self {
            records: prior,
            enriched: 0,
            discarded: 0,
            checkpoint,
            checkpoint_every: checkpoint_every.max(1),
            checkpoint_writes: 0,
        }
    }

    async fn push(&mut self, record: EnrichmentRecord) -> Result<()> {
        self.records.push(record);
        self.enriched += 1;
        if self.enriched % self.checkpoint_every == 0 {
            self.checkpoint.save(&self.records).await?;
            self.checkpoint_writes += 1;
            info!(
                enriched = self.enriched,
                total = self.records.len(),
                "checkpoint saved"
            );
        }
        Ok(())
    }
}

struct EnrichmentOutcome {
    records: Vec<EnrichmentRecord>,
    enriched: usize,
    discarded: usize,
    checkpoint_writes: usize,
}

pub struct EnrichmentPipeline {
    source: Arc<dyn MovieSource>,
    job: EnrichmentJob,
    checkpoint: CheckpointStore,
}

impl EnrichmentPipeline {
    pub fn new(source: Arc<dyn MovieSource>, job: EnrichmentJob) -> Self {
        let checkpoint = CheckpointStore::new(job.checkpoint_path.clone());
        Self {
            source,
            job,
            checkpoint,
        }
    }

    pub async fn run(&self) -> Result<EnrichmentSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("enrichment_run", %run_id);
        self.run_inner(run_id).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid) -> Result<EnrichmentSummary> {
        let started_at = Utc::now();
        let table = load_table(&self.job.input_path).await?;
        let input_rows = table.len();

        let prior = self.checkpoint.load().await?;
        let resumed_records = prior.len();
        let completed: HashSet<i64> = prior.iter().map(|r| r.id).collect();
        let pending = pending_ids(&table, &completed)
            .with_context(|| format!("selecting work from {}", self.job.input_path.display()))?;
        info!(
            input_rows,
            resumed_records,
            pending = pending.len(),
            workers = self.job.workers,
            "starting enrichment"
        );
        let pending_count = pending.len();

        let outcome = self.enrich_all(pending, prior).await?;
        self.checkpoint.save(&outcome.records).await?;

        let (merged_rows, parquet_manifest) =
            write_merged_output(&self.job, table, &outcome.records).await?;

        Ok(EnrichmentSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            input_rows,
            resumed_records,
            pending: pending_count,
            enriched: outcome.enriched,
            discarded: outcome.discarded,
            checkpoint_writes: outcome.checkpoint_writes,
            merged_rows,
            output_path: self.job.output_path.display().to_string(),
            parquet_manifest,
        })
    }

    /// Fan `pending` out over a fixed set of workers fed by a bounded queue.
    async fn enrich_all(
        &self,
        pending: Vec<i64>,
        prior: Vec<EnrichmentRecord>,
    ) -> Result<EnrichmentOutcome> {
        let workers = self.job.workers.max(1);
        let accumulator = Arc::new(Mutex::new(ResultAccumulator::new(
            prior,
            self.checkpoint.clone(),
            self.job.checkpoint_every,
        )));
        let (tx, rx) = mpsc::channel::<i64>(workers * 2);
        let rx = Arc::new(Mutex::new(rx));

        let mut join_set = JoinSet::new();
        for worker_id in 0..workers {
            let rx = Arc::clone(&rx);
            let source = Arc::clone(&self.source);
            let accumulator = Arc::clone(&accumulator);
            let call_delay = self.job.call_delay;

            join_set.spawn(
                async move {
                    loop {
                        let next = rx.lock().await.recv().await;
                        let Some(movie_id) = next else {
                            break;
                        };
                        match enrich_movie(source.as_ref(), movie_id, call_delay).await {
                            Some(record) => accumulator.lock().await.push(record).await?,
                            None => accumulator.lock().await.discarded += 1,
                        }
                    }
                    debug!("queue drained");
                    Ok::<(), anyhow::Error>(())
                }
                .instrument(info_span!("enrichment_worker", worker_id)),
            );
        }

        for movie_id in pending {
            if tx.send(movie_id).await.is_err() {
                // Every worker has exited; the join below reports why.
                break;
            }
        }
        drop(tx);

        while let Some(joined) = join_set.join_next().await {
            if let Err(err) = joined.context("enrichment worker panicked")? {
                join_set.abort_all();
                return Err(err);
            }
        }

        let mut acc = accumulator.lock().await;
        Ok(EnrichmentOutcome {
            records: std::mem::take(&mut acc.records),
            enriched: acc.enriched,
            discarded: acc.discarded,
            checkpoint_writes: acc.checkpoint_writes,
        })
    }
}

async fn write_merged_output(
    job: &EnrichmentJob,
    table: Table,
    records: &[EnrichmentRecord],
) -> Result<(usize, Option<String>)> {
    let merged = merge_enrichment(table, records)
        .with_context(|| format!("merging into {}", job.input_path.display()))?;
    save_table(&job.output_path, &merged).await?;
    info!(
        rows = merged.len(),
        output = %job.output_path.display(),
        "merged table written"
    );

    let manifest = if job.parquet_snapshot {
        let path = export_parquet_snapshot(&job.output_path, &merged).await?;
        Some(path.display().to_string())
    } else {
        None
    };
    Ok((merged.len(), manifest))
}

/// Merge an existing checkpoint into the input table without fetching anything.
pub async fn merge_from_checkpoint(job: &EnrichmentJob) -> Result<MergeSummary> {
    let table = load_table(&job.input_path).await?;
    let input_rows = table.len();
    let records = CheckpointStore::new(job.checkpoint_path.clone()).load().await?;
    let (merged_rows, parquet_manifest) = write_merged_output(job, table, &records).await?;
    Ok(MergeSummary {
        input_rows,
        checkpoint_records: records.len(),
        merged_rows,
        output_path: job.output_path.display().to_string(),
        parquet_manifest,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub generated_at: DateTime<Utc>,
    pub files: Vec<SnapshotManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotManifestFile {
    pub name: String,
    pub path: String,
    pub rows: usize,
    pub sha256: String,
    pub bytes: u64,
}

/// Write `table` as parquet under `snapshots/` next to `output_path`, plus a manifest.
///
/// Returns the manifest path.
pub async fn export_parquet_snapshot(output_path: &Path, table: &Table) -> Result<PathBuf> {
    let base_dir = output_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let snapshot_dir = base_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let stem = output_path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "movies".to_string());
    let parquet_path = snapshot_dir.join(format!("{stem}.parquet"));
    write_table_parquet(&parquet_path, table)?;

    let manifest = SnapshotManifest {
        schema_version: 1,
        generated_at: Utc::now(),
        files: vec![manifest_entry(&stem, &snapshot_dir, &parquet_path, table.len())?],
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing snapshot manifest")?;
    write_atomic(&manifest_path, &bytes).await?;
    Ok(manifest_path)
}

fn write_table_parquet(path: &Path, table: &Table) -> Result<()> {
    ensure!(
        !table.headers().is_empty(),
        "cannot snapshot a table without columns"
    );

    let mut fields = Vec::with_capacity(table.headers().len());
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(table.headers().len());
    for (col, name) in table.headers().iter().enumerate() {
        if name == ID_COLUMN {
            fields.push(ArrowField::new(name, DataType::Int64, true));
            columns.push(Arc::new(Int64Array::from(
                (0..table.len())
                    .map(|row| table.id_at(row, col))
                    .collect::<Vec<_>>(),
            )));
        } else if NUMERIC_COLUMNS.contains(&name.as_str()) {
            fields.push(ArrowField::new(name, DataType::Float64, true));
            columns.push(Arc::new(Float64Array::from(
                (0..table.len())
                    .map(|row| table.number(row, col))
                    .collect::<Vec<_>>(),
            )));
        } else {
            fields.push(ArrowField::new(name, DataType::Utf8, true));
            columns.push(Arc::new(StringArray::from(
                (0..table.len())
                    .map(|row| table.cell(row, col))
                    .collect::<Vec<_>>(),
            )));
        }
    }

    let batch = RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)
        .context("building snapshot record batch")?;
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn manifest_entry(
    name: &str,
    snapshot_dir: &Path,
    path: &Path,
    rows: usize,
) -> Result<SnapshotManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path
        .strip_prefix(snapshot_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(SnapshotManifestFile {
        name: name.to_string(),
        path: rel,
        rows,
        sha256,
        bytes: bytes.len() as u64,
    })
}

async fn load_config_and_settings() -> Result<(SyncConfig, PipelineSettings)> {
    let config = SyncConfig::from_env();
    let settings = PipelineSettings::load(&config.settings_path).await?;
    Ok((config, settings))
}

fn tmdb_source(config: &SyncConfig, settings: &PipelineSettings) -> Result<Arc<dyn MovieSource>> {
    let client = TmdbClient::new(tmdb_client_config(config, settings))
        .context("building TMDB client")?;
    Ok(Arc::new(client))
}

pub async fn run_discovery_from_env() -> Result<DiscoverySummary> {
    let (config, settings) = load_config_and_settings().await?;
    let source = tmdb_source(&config, &settings)?;
    let job = DiscoveryJob::from_settings(&config, &settings.discovery);
    DiscoveryPipeline::new(source, job).run().await
}

pub async fn run_enrichment_from_env() -> Result<EnrichmentSummary> {
    let (config, settings) = load_config_and_settings().await?;
    let source = tmdb_source(&config, &settings)?;
    let job = EnrichmentJob::from_settings(&config, &settings.enrichment);
    EnrichmentPipeline::new(source, job).run().await
}

pub async fn run_merge_from_env() -> Result<MergeSummary> {
    let (config, settings) = load_config_and_settings().await?;
    let job = EnrichmentJob::from_settings(&config, &settings.enrichment);
    merge_from_checkpoint(&job).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn table(csv: &str) -> Table {
        Table::from_csv_reader(csv.as_bytes()).unwrap()
    }

    fn record(id: i64, budget: Option<f64>, revenue: Option<f64>) -> EnrichmentRecord {
        EnrichmentRecord {
            id,
            budget,
            revenue,
            director: None,
            avg_cast_popularity: None,
        }
    }

    fn value<'a>(t: &'a Table, row: usize, column: &str) -> Option<&'a str> {
        t.cell(row, t.column_index(column).unwrap())
    }

    #[test]
    fn merge_fills_missing_budget_and_recomputes_columns() {
        let input = table("id,title,budget,revenue\n42,Example,NaN,1000\n");
        let merged = merge_enrichment(input, &[record(42, Some(500.0), None)]).unwrap();

        assert_eq!(merged.len(), 1);
        assert_eq!(value(&merged, 0, "budget"), Some("500"));
        assert_eq!(value(&merged, 0, "revenue"), Some("1000"));
        let budget_log_col = merged.column_index("budget_log").unwrap();
        assert_eq!(merged.number(0, budget_log_col), Some(500f64.ln_1p()));
        let ratio_col = merged.column_index("profit_ratio").unwrap();
        assert_eq!(merged.number(0, ratio_col), Some(2.0));
    }

    #[test]
    fn merge_keeps_existing_values_over_supplement() {
        let input = table("id,budget,revenue,director\n1,100,,Original\n");
        let supplement = EnrichmentRecord {
            id: 1,
            budget: Some(999.0),
            revenue: Some(300.0),
            director: Some("Replacement".into()),
            avg_cast_popularity: Some(7.5),
        };
        let merged = merge_enrichment(input, &[supplement]).unwrap();
        assert_eq!(value(&merged, 0, "budget"), Some("100"));
        assert_eq!(value(&merged, 0, "revenue"), Some("300"));
        assert_eq!(value(&merged, 0, "director"), Some("Original"));
        assert_eq!(value(&merged, 0, "avg_cast_popularity"), Some("7.5"));
        assert_eq!(value(&merged, 0, "profit_ratio"), Some("3"));
    }

    #[test]
    fn merge_collapses_duplicate_ids_and_appends_new_ones() {
        let input = table("id,budget,revenue\n1,,10\n1,5,\n2,7,14\n");
        let records = vec![
            record(1, Some(50.0), Some(500.0)),
            record(1, Some(60.0), None),
            record(3, Some(20.0), Some(10.0)),
        ];
        let merged = merge_enrichment(input, &records).unwrap();

        let id_col = merged.column_index("id").unwrap();
        let ids = (0..merged.len())
            .map(|row| merged.id_at(row, id_col).unwrap())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(value(&merged, 0, "budget"), Some("5"));
        assert_eq!(value(&merged, 0, "revenue"), Some("10"));
        assert_eq!(value(&merged, 2, "profit_ratio"), Some("0.5"));
    }

    #[test]
    fn derived_columns_absent_for_missing_or_non_positive_values() {
        let mut t = table("id,budget,revenue,budget_log,profit_ratio\n1,0,100,stale,stale\n2,,50,,\n3,-5,,,\n");
        recompute_derived_columns(&mut t);
        for row in 0..3 {
            assert_eq!(value(&t, row, "budget_log"), None);
            assert_eq!(value(&t, row, "profit_ratio"), None);
        }
        let revenue_log_col = t.column_index("revenue_log").unwrap();
        assert_eq!(t.number(0, revenue_log_col), Some(100f64.ln_1p()));
        assert_eq!(value(&t, 2, "revenue_log"), None);
    }

    #[test]
    fn merge_requires_an_id_column() {
        let input = table("title,budget\nx,1\n");
        assert!(matches!(
            merge_enrichment(input, &[]),
            Err(TableError::MissingColumn(_))
        ));
    }

    #[test]
    fn pending_ids_skip_complete_rows_and_checkpointed_ids() {
        let t = table("id,budget,revenue\n1,10,20\n2,,20\n3,10,nan\n4,,\n2,,\nx,,\n5.0,,\n");
        let completed = HashSet::from([4]);
        assert_eq!(pending_ids(&t, &completed).unwrap(), vec![2, 3, 5]);
    }

    #[test]
    fn pending_ids_require_monetary_columns() {
        let t = table("id,budget\n1,\n");
        assert!(matches!(
            pending_ids(&t, &HashSet::new()),
            Err(TableError::MissingColumn(name)) if name == "revenue"
        ));
    }

    #[test]
    fn settings_default_when_empty_and_merge_partial_yaml() {
        assert_eq!(
            PipelineSettings::from_yaml_str("").unwrap(),
            PipelineSettings::default()
        );
        let settings = PipelineSettings::from_yaml_str(
            "discovery:\n  start_year: 2020\n  end_year: 2021\nenrichment:\n  workers: 8\n",
        )
        .unwrap();
        assert_eq!(settings.discovery.start_year, 2020);
        assert_eq!(settings.discovery.max_pages, 200);
        assert_eq!(settings.enrichment.workers, 8);
        assert_eq!(settings.enrichment.checkpoint_every, 200);
    }

    #[test]
    fn settings_reject_inverted_years_and_zero_workers() {
        assert!(PipelineSettings::from_yaml_str(
            "discovery:\n  start_year: 2024\n  end_year: 2020\n"
        )
        .is_err());
        assert!(PipelineSettings::from_yaml_str("enrichment:\n  workers: 0\n").is_err());
        assert!(PipelineSettings::from_yaml_str("enrichment:\n  checkpoint_every: 0\n").is_err());
    }

    #[test]
    fn client_config_uses_discovery_attempts_and_enrichment_backoff() {
        let config = SyncConfig {
            api_key: "k".into(),
            api_base_url: "http://localhost:9".into(),
            language: "en-US".into(),
            user_agent: "test".into(),
            http_timeout_secs: 3,
            data_dir: PathBuf::from("data"),
            settings_path: PathBuf::from("cinemeta.yaml"),
        };
        let settings = PipelineSettings::default();
        let client = tmdb_client_config(&config, &settings);
        assert_eq!(client.discover_policy.max_attempts, 1);
        assert_eq!(client.lookup_policy.max_attempts, 5);
        assert_eq!(client.discover_policy.base_delay, Duration::from_secs(1));
        assert_eq!(client.http.timeout, Duration::from_secs(3));

        let job = EnrichmentJob::from_settings(&config, &settings.enrichment);
        assert_eq!(job.input_path, PathBuf::from("data/movies_cleaned.csv"));
        assert_eq!(job.workers, 4);
    }

    #[tokio::test]
    async fn parquet_snapshot_writes_file_and_manifest() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("movies_enriched.csv");
        let t = merge_enrichment(
            table("id,title,budget,revenue\n1,A,100,250\n2,B,,\n"),
            &[record(2, Some(10.0), Some(5.0))],
        )
        .unwrap();

        let manifest_path = export_parquet_snapshot(&output, &t).await.unwrap();
        let parquet_path = dir.path().join("snapshots").join("movies_enriched.parquet");
        assert!(parquet_path.exists());

        let manifest: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&manifest_path).unwrap()).unwrap();
        assert_eq!(manifest["files"][0]["rows"], 2);
        assert_eq!(
            manifest["files"][0]["bytes"],
            std::fs::metadata(&parquet_path).unwrap().len()
        );

        let reader = parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder::try_new(
            File::open(&parquet_path).unwrap(),
        )
        .unwrap()
        .build()
        .unwrap();
        let rows: usize = reader.map(|batch| batch.unwrap().num_rows()).sum();
        assert_eq!(rows, 2);
    }
}
