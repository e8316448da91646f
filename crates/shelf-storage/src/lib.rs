//! Immutable artifact storage, HTTP fetch utilities and the append-only snapshot history.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use shelf_core::{
    Category, CollectionRun, NormalizedSnapshot, RunStatus, StockStatus, VariantRecord,
    VariantType,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{Mutex, Semaphore};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "shelf-storage";

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// `<stamp>/<kind>/<sha256>.<ext>`, e.g. `20260224_090000/raw/ab12….json`.
    pub fn artifact_relative_path(
        &self,
        captured_at: DateTime<Utc>,
        kind: &str,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let stamp = captured_at.format("%Y%m%d_%H%M%S").to_string();
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from(stamp)
            .join(kind)
            .join(format!("{content_hash}.{ext}"))
    }

    /// Writes via temp file + rename. Identical bytes for the same stamp and kind are stored once.
    pub async fn store_bytes(
        &self,
        captured_at: DateTime<Utc>,
        kind: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredArtifact> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.artifact_relative_path(captured_at, kind, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating artifact directory {}", parent.display()))?;

        let stored = |deduplicated| StoredArtifact {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking artifact path {}", absolute_path.display()))?
        {
            return Ok(stored(true));
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

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(stored(false)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(stored(true))
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "renaming temp artifact {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }

    pub async fn store_json<T: serde::Serialize + ?Sized>(
        &self,
        captured_at: DateTime<Utc>,
        kind: &str,
        value: &T,
    ) -> anyhow::Result<StoredArtifact> {
        let bytes = serde_json::to_vec_pretty(value).context("serializing artifact json")?;
        self.store_bytes(captured_at, kind, "json", &bytes).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            concurrency: 5,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Shared GET client for listing pages: bounded in-flight requests plus retry on transient failures.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("fetcher is shut down")]
    Closed,
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
            limit: Arc::new(Semaphore::new(config.concurrency.max(1))),
            backoff: config.backoff,
        })
    }

    pub async fn fetch_bytes(&self, run_id: Uuid, url: &str) -> Result<FetchedResponse, FetchError> {
        let _permit = self.limit.acquire().await.map_err(|_| FetchError::Closed)?;
        let span = info_span!("http_fetch", %run_id, url);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            let retries_left = attempt < self.backoff.max_retries;
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable && retries_left {
                        warn!(attempt, status = status.as_u16(), "retrying listing fetch");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable && retries_left {
                        warn!(attempt, error = %err, "retrying listing fetch");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("history file io: {0}")]
    Io(#[from] std::io::Error),
    #[error("history record encoding: {0}")]
    Json(#[from] serde_json::Error),
    #[error("database: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt history record: {0}")]
    Corrupt(String),
}

/// Append-only record sink with a full-history query.
///
/// `append` is atomic per snapshot: a failed append leaves no trace of that snapshot, and
/// concurrent readers see either the whole record or none of it.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn append(&self, snapshot: &NormalizedSnapshot) -> Result<(), StoreError>;
    async fn query_all(&self) -> Result<Vec<NormalizedSnapshot>, StoreError>;
    /// Inserts or replaces the run record with the same id.
    async fn record_run(&self, run: &CollectionRun) -> Result<(), StoreError>;
    async fn latest_run(&self) -> Result<Option<CollectionRun>, StoreError>;
}

#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    snapshots: Mutex<Vec<NormalizedSnapshot>>,
    runs: Mutex<Vec<CollectionRun>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshots(snapshots: Vec<NormalizedSnapshot>) -> Self {
        Self {
            snapshots: Mutex::new(snapshots),
            runs: Mutex::new(Vec::new()),
        }
    }

    pub async fn runs(&self) -> Vec<CollectionRun> {
        self.runs.lock().await.clone()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn append(&self, snapshot: &NormalizedSnapshot) -> Result<(), StoreError> {
        self.snapshots.lock().await.push(snapshot.clone());
        Ok(())
    }

    async fn query_all(&self) -> Result<Vec<NormalizedSnapshot>, StoreError> {
        Ok(self.snapshots.lock().await.clone())
    }

    async fn record_run(&self, run: &CollectionRun) -> Result<(), StoreError> {
        let mut runs = self.runs.lock().await;
        match runs.iter_mut().find(|existing| existing.id == run.id) {
            Some(existing) => *existing = run.clone(),
            None => runs.push(run.clone()),
        }
        Ok(())
    }

    async fn latest_run(&self) -> Result<Option<CollectionRun>, StoreError> {
        Ok(self
            .runs
            .lock()
            .await
            .iter()
            .max_by_key(|run| run.started_at)
            .cloned())
    }
}

/// History kept as JSON lines under one directory: `snapshots.jsonl` and `runs.jsonl`.
///
/// Every record is a single newline-terminated line written with one `write_all` on an
/// `O_APPEND` handle. Readers only trust content up to the last newline.
#[derive(Debug)]
pub struct JsonlSnapshotStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlSnapshotStore {
    pub const SNAPSHOTS_FILE: &'static str = "snapshots.jsonl";
    pub const RUNS_FILE: &'static str = "runs.jsonl";

    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    async fn append_line(&self, file_name: &str, record: &impl serde::Serialize) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        fs::create_dir_all(&self.root).await?;
        let path = self.root.join(file_name);
        let mut file = fs::OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .await?;

        let clean_len = repair_torn_tail(&mut file, &path).await?;
        if let Err(err) = write_record(&mut file, &line).await {
            // drop whatever part of the record reached the file
            let _ = file.set_len(clean_len).await;
            return Err(StoreError::Io(err));
        }
        Ok(())
    }

    async fn read_records<T: serde::de::DeserializeOwned>(
        &self,
        file_name: &str,
    ) -> Result<Vec<T>, StoreError> {
        let path = self.root.join(file_name);
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        parse_complete_lines(&text)
    }
}

async fn write_record(file: &mut fs::File, line: &[u8]) -> std::io::Result<()> {
    file.write_all(line).await?;
    file.flush().await?;
    file.sync_data().await
}

/// Truncates a trailing line left without its newline by an interrupted writer.
async fn repair_torn_tail(file: &mut fs::File, path: &Path) -> std::io::Result<u64> {
    let len = file.metadata().await?.len();
    if len == 0 {
        return Ok(0);
    }

    let mut last = [0u8; 1];
    file.seek(SeekFrom::Start(len - 1)).await?;
    file.read_exact(&mut last).await?;
    if last[0] == b'\n' {
        return Ok(len);
    }

    let mut contents = Vec::with_capacity(len as usize);
    file.seek(SeekFrom::Start(0)).await?;
    file.read_to_end(&mut contents).await?;
    let keep = contents
        .iter()
        .rposition(|b| *b == b'\n')
        .map(|idx| idx as u64 + 1)
        .unwrap_or(0);
    warn!(path = %path.display(), dropped_bytes = len - keep, "truncating partial history record");
    file.set_len(keep).await?;
    Ok(keep)
}

fn parse_complete_lines<T: serde::de::DeserializeOwned>(text: &str) -> Result<Vec<T>, StoreError> {
    let complete = match text.rfind('\n') {
        Some(idx) => &text[..idx],
        None => "",
    };
    complete
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).map_err(StoreError::from))
        .collect()
}

#[async_trait]
impl SnapshotStore for JsonlSnapshotStore {
    async fn append(&self, snapshot: &NormalizedSnapshot) -> Result<(), StoreError> {
        self.append_line(Self::SNAPSHOTS_FILE, snapshot).await
    }

    async fn query_all(&self) -> Result<Vec<NormalizedSnapshot>, StoreError> {
        self.read_records(Self::SNAPSHOTS_FILE).await
    }

    async fn record_run(&self, run: &CollectionRun) -> Result<(), StoreError> {
        self.append_line(Self::RUNS_FILE, run).await
    }

    async fn latest_run(&self) -> Result<Option<CollectionRun>, StoreError> {
        let records: Vec<CollectionRun> = self.read_records(Self::RUNS_FILE).await?;
        // later lines for the same id supersede earlier ones
        let mut by_id: HashMap<Uuid, CollectionRun> = HashMap::new();
        for run in records {
            by_id.insert(run.id, run);
        }
        Ok(by_id.into_values().max_by_key(|run| run.started_at))
    }
}

#[derive(Debug, Clone)]
pub struct PgSnapshotStore {
    pool: PgPool,
}

impl PgSnapshotStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn to_i32(value: usize) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn to_usize(value: i32) -> usize {
    usize::try_from(value).unwrap_or(0)
}

fn variant_type_tokens<'a>(types: impl IntoIterator<Item = &'a VariantType>) -> Vec<String> {
    types.into_iter().map(|t| t.as_str().to_string()).collect()
}

fn parse_variant_types(tokens: Vec<String>) -> Result<std::collections::BTreeSet<VariantType>, StoreError> {
    tokens
        .iter()
        .map(|token| {
            VariantType::from_str_opt(token)
                .ok_or_else(|| StoreError::Corrupt(format!("unknown variant type `{token}`")))
        })
        .collect()
}

fn run_from_row(row: &PgRow) -> Result<CollectionRun, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(CollectionRun {
        id: row.try_get("id")?,
        started_at: row.try_get("started_at")?,
        ended_at: row.try_get("ended_at")?,
        attempted_count: to_usize(row.try_get("attempted_count")?),
        succeeded_count: to_usize(row.try_get("succeeded_count")?),
        status: RunStatus::from_str_opt(&status)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown run status `{status}`")))?,
        error_summary: row.try_get("error_summary")?,
    })
}

#[async_trait]
impl SnapshotStore for PgSnapshotStore {
    async fn append(&self, snapshot: &NormalizedSnapshot) -> Result<(), StoreError> {
        // dropping the transaction on any error rolls back this product only
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO snapshots (
                id, product_url, title, description, price, category, stock_status,
                variant_count, variant_types, image_count, first_image_url, processing_timestamp
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(snapshot.id)
        .bind(&snapshot.product_url)
        .bind(&snapshot.title)
        .bind(&snapshot.description)
        .bind(snapshot.price)
        .bind(snapshot.category.as_str())
        .bind(snapshot.stock_status.as_str())
        .bind(to_i32(snapshot.variant_count))
        .bind(variant_type_tokens(&snapshot.variant_types))
        .bind(to_i32(snapshot.image_count))
        .bind(&snapshot.first_image_url)
        .bind(snapshot.processing_timestamp)
        .execute(&mut *tx)
        .await?;

        for (position, url) in snapshot.image_urls.iter().enumerate() {
            sqlx::query("INSERT INTO snapshot_images (snapshot_id, position, url) VALUES ($1, $2, $3)")
                .bind(snapshot.id)
                .bind(to_i32(position))
                .bind(url)
                .execute(&mut *tx)
                .await?;
        }

        for (position, variant) in snapshot.variants.iter().enumerate() {
            sqlx::query(
                "INSERT INTO snapshot_variants (snapshot_id, position, name, variant_types) VALUES ($1, $2, $3, $4)",
            )
            .bind(snapshot.id)
            .bind(to_i32(position))
            .bind(&variant.name)
            .bind(variant_type_tokens(&variant.types))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn query_all(&self) -> Result<Vec<NormalizedSnapshot>, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .execute(&mut *tx)
            .await?;

        let mut images: HashMap<Uuid, Vec<String>> = HashMap::new();
        for row in sqlx::query("SELECT snapshot_id, url FROM snapshot_images ORDER BY snapshot_id, position")
            .fetch_all(&mut *tx)
            .await?
        {
            images
                .entry(row.try_get("snapshot_id")?)
                .or_default()
                .push(row.try_get("url")?);
        }

        let mut variants: HashMap<Uuid, Vec<VariantRecord>> = HashMap::new();
        for row in sqlx::query(
            "SELECT snapshot_id, name, variant_types FROM snapshot_variants ORDER BY snapshot_id, position",
        )
        .fetch_all(&mut *tx)
        .await?
        {
            variants
                .entry(row.try_get("snapshot_id")?)
                .or_default()
                .push(VariantRecord {
                    name: row.try_get("name")?,
                    types: parse_variant_types(row.try_get("variant_types")?)?,
                });
        }

        let rows = sqlx::query(
            r#"
            SELECT id, product_url, title, description, price, category, stock_status,
                   variant_count, variant_types, image_count, first_image_url, processing_timestamp
            FROM snapshots
            ORDER BY processing_timestamp, id
            "#,
        )
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;

        rows.iter()
            .map(|row| -> Result<NormalizedSnapshot, StoreError> {
                let id: Uuid = row.try_get("id")?;
                let category: String = row.try_get("category")?;
                let stock: String = row.try_get("stock_status")?;
                Ok(NormalizedSnapshot {
                    id,
                    product_url: row.try_get("product_url")?,
                    title: row.try_get("title")?,
                    description: row.try_get("description")?,
                    price: row.try_get("price")?,
                    category: Category::from_str_opt(&category).unwrap_or_default(),
                    stock_status: StockStatus::from_str_opt(&stock).unwrap_or_default(),
                    variants: variants.remove(&id).unwrap_or_default(),
                    variant_count: to_usize(row.try_get("variant_count")?),
                    variant_types: parse_variant_types(row.try_get("variant_types")?)?,
                    image_urls: images.remove(&id).unwrap_or_default(),
                    image_count: to_usize(row.try_get("image_count")?),
                    first_image_url: row.try_get("first_image_url")?,
                    processing_timestamp: row.try_get("processing_timestamp")?,
                })
            })
            .collect()
    }

    async fn record_run(&self, run: &CollectionRun) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO collection_runs (
                id, started_at, ended_at, attempted_count, succeeded_count, status, error_summary
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE SET
                ended_at = EXCLUDED.ended_at,
                attempted_count = EXCLUDED.attempted_count,
                succeeded_count = EXCLUDED.succeeded_count,
                status = EXCLUDED.status,
                error_summary = EXCLUDED.error_summary
            "#,
        )
        .bind(run.id)
        .bind(run.started_at)
        .bind(run.ended_at)
        .bind(to_i32(run.attempted_count))
        .bind(to_i32(run.succeeded_count))
        .bind(run.status.as_str())
        .bind(&run.error_summary)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_run(&self) -> Result<Option<CollectionRun>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, started_at, ended_at, attempted_count, succeeded_count, status, error_summary
            FROM collection_runs
            ORDER BY started_at DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(run_from_row).transpose()
    }
}

/// Opens the history named by `location`: a `postgres://` URL, `memory`, or a directory path.
pub async fn open_store(location: &str) -> anyhow::Result<Arc<dyn SnapshotStore>> {
    if location.starts_with("postgres://") || location.starts_with("postgresql://") {
        let store = PgSnapshotStore::connect(location)
            .await
            .context("connecting to snapshot database")?;
        store.migrate().await.context("running snapshot migrations")?;
        info!(backend = "postgres", "snapshot store ready");
        return Ok(Arc::new(store));
    }

    if location == "memory" {
        info!(backend = "memory", "snapshot store ready");
        return Ok(Arc::new(MemorySnapshotStore::new()));
    }

    info!(backend = "jsonl", path = location, "snapshot store ready");
    Ok(Arc::new(JsonlSnapshotStore::new(location)))
}
