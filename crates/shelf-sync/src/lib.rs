//! Sync pipeline orchestration: collect, normalize into history, archive, report, export.

pub mod collect;
pub mod export;
pub mod normalize;

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use shelf_adapters::{
    FixtureSite, HttpListingFetcher, HttpPageRenderer, ListingFetcher, PageRenderer, RenderError,
    RendererConfig,
};
use shelf_core::{Category, CollectionRun, NormalizedSnapshot, RawSnapshot, RunStatus};
use shelf_storage::{open_store, ArtifactStore, HttpClientConfig, HttpFetcher, SnapshotStore, StoreError};
use tokio::fs;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};

pub use collect::{
    CollectionEngine, CollectionPolicy, ProductError, ProductFailure, ProductSink, RunSetupError,
    RunSummary,
};
pub use export::{export_parquet_snapshots, ParquetManifest, ParquetManifestFile};
pub use normalize::{
    clean_price, normalize_stock_token, CategoryRule, CategoryRules, Normalizer, NormalizerRules,
    VariantRules,
};

pub const CRATE_NAME: &str = "shelf-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub base_url: String,
    pub store_url: String,
    pub artifacts_dir: PathBuf,
    pub workspace_root: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub policy: CollectionPolicy,
    pub fixtures_dir: Option<PathBuf>,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub bucket_minutes: i64,
    pub web_port: u16,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_url: "https://agilite.co.il/collections/all".to_string(),
            store_url: "./data/history".to_string(),
            artifacts_dir: PathBuf::from("./artifacts"),
            workspace_root: PathBuf::from("."),
            user_agent: "shelf-watch/0.1".to_string(),
            http_timeout_secs: 30,
            policy: CollectionPolicy::default(),
            fixtures_dir: None,
            scheduler_enabled: false,
            sync_cron: "0 0 */6 * * *".to_string(),
            bucket_minutes: 60,
            web_port: 8080,
        }
    }
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True" | "yes"))
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

fn env_millis(name: &str) -> Option<Duration> {
    env_parse::<u64>(name).map(Duration::from_millis)
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let mut policy = defaults.policy.clone();
        policy.nav_attempts = env_parse("SHELF_NAV_ATTEMPTS").unwrap_or(policy.nav_attempts);
        policy.verify_attempts = env_parse("SHELF_VERIFY_ATTEMPTS").unwrap_or(policy.verify_attempts);
        policy.nav_backoff = env_millis("SHELF_NAV_BACKOFF_MS").unwrap_or(policy.nav_backoff);
        policy.verify_settle = env_millis("SHELF_VERIFY_SETTLE_MS").unwrap_or(policy.verify_settle);
        policy.reload_settle = env_millis("SHELF_RELOAD_SETTLE_MS").unwrap_or(policy.reload_settle);
        policy.cooldown = env_millis("SHELF_COOLDOWN_MS").unwrap_or(policy.cooldown);
        policy.ready_timeout = env_parse::<u64>("SHELF_READY_TIMEOUT_SECS")
            .map(Duration::from_secs)
            .unwrap_or(policy.ready_timeout);
        policy.listing_workers = env_parse("SHELF_LISTING_WORKERS").unwrap_or(policy.listing_workers);
        policy.max_products = env_parse("SHELF_MAX_PRODUCTS");
        policy.first_page_only = env_flag("SHELF_FIRST_PAGE_ONLY").unwrap_or(false);
        if env_flag("SHELF_TEST_MODE").unwrap_or(false) {
            policy.first_page_only = true;
            policy.max_products = policy.max_products.or(Some(3));
        }

        Self {
            base_url: std::env::var("SHELF_BASE_URL").unwrap_or(defaults.base_url),
            store_url: std::env::var("SHELF_STORE_URL").unwrap_or(defaults.store_url),
            artifacts_dir: std::env::var("ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.artifacts_dir),
            workspace_root: std::env::var("SHELF_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root),
            user_agent: std::env::var("SHELF_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_parse("SHELF_HTTP_TIMEOUT_SECS").unwrap_or(defaults.http_timeout_secs),
            policy,
            fixtures_dir: std::env::var("SHELF_FIXTURES_DIR").ok().map(PathBuf::from),
            scheduler_enabled: env_flag("SHELF_SCHEDULER_ENABLED").unwrap_or(false),
            sync_cron: std::env::var("SHELF_SYNC_CRON").unwrap_or(defaults.sync_cron),
            bucket_minutes: env_parse("SHELF_BUCKET_MINUTES").unwrap_or(defaults.bucket_minutes),
            web_port: env_parse("SHELF_WEB_PORT").unwrap_or(defaults.web_port),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run: CollectionRun,
    pub failures: Vec<ProductFailure>,
    pub stored_snapshots: usize,
    pub raw_artifact: Option<String>,
    pub reports_dir: String,
    pub parquet_manifest: String,
}

enum CatalogSource {
    Live {
        listings: HttpListingFetcher,
        renderer: RendererConfig,
    },
    Fixture(Arc<FixtureSite>),
}

impl CatalogSource {
    fn listings(&self) -> &dyn ListingFetcher {
        match self {
            Self::Live { listings, .. } => listings,
            Self::Fixture(site) => &**site,
        }
    }

    fn open_renderer(&self) -> Result<Box<dyn PageRenderer>, RenderError> {
        match self {
            Self::Live { renderer, .. } => Ok(Box::new(HttpPageRenderer::new(renderer.clone())?)),
            Self::Fixture(site) => Ok(Box::new(site.renderer())),
        }
    }

    fn base_url<'a>(&'a self, configured: &'a str) -> &'a str {
        match self {
            Self::Live { .. } => configured,
            Self::Fixture(site) => site.base_url(),
        }
    }
}

/// Normalizes each accepted product straight into history and keeps the run's batch.
struct HistorySink<'a> {
    store: &'a dyn SnapshotStore,
    normalizer: &'a Normalizer,
    attempted: usize,
    raw: Vec<RawSnapshot>,
    written: Vec<NormalizedSnapshot>,
}

#[async_trait]
impl<'a> ProductSink for HistorySink<'a> {
    fn begin(&mut self, _url: &str) {
        self.attempted += 1;
    }

    async fn accept(&mut self, raw: &RawSnapshot) -> Result<(), StoreError> {
        self.raw.push(raw.clone());
        let snapshot = self.normalizer.normalize(raw, Utc::now());
        self.store.append(&snapshot).await?;
        self.written.push(snapshot);
        Ok(())
    }
}

pub struct SyncPipeline {
    config: SyncConfig,
    store: Arc<dyn SnapshotStore>,
    artifacts: ArtifactStore,
    normalizer: Normalizer,
    source: CatalogSource,
    run_lock: Mutex<()>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig, store: Arc<dyn SnapshotStore>) -> Result<Self> {
        let rules = NormalizerRules::from_workspace_root(&config.workspace_root)?;
        let source = match &config.fixtures_dir {
            Some(dir) => {
                let site = FixtureSite::load(dir)
                    .with_context(|| format!("loading fixture site {}", dir.display()))?;
                info!(base_url = site.base_url(), "serving catalog from fixtures");
                CatalogSource::Fixture(Arc::new(site))
            }
            None => {
                let timeout = Duration::from_secs(config.http_timeout_secs);
                let http = HttpFetcher::new(HttpClientConfig {
                    timeout,
                    user_agent: Some(config.user_agent.clone()),
                    concurrency: config.policy.listing_workers.max(1),
                    ..Default::default()
                })?;
                CatalogSource::Live {
                    listings: HttpListingFetcher::new(Arc::new(http)),
                    renderer: RendererConfig {
                        timeout,
                        user_agent: Some(config.user_agent.clone()),
                    },
                }
            }
        };
        Ok(Self {
            artifacts: ArtifactStore::new(config.artifacts_dir.clone()),
            normalizer: Normalizer::new(rules),
            config,
            store,
            source,
            run_lock: Mutex::new(()),
        })
    }

    pub async fn from_config(config: SyncConfig) -> Result<Self> {
        let store = open_store(&config.store_url).await?;
        Self::new(config, store)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn SnapshotStore> {
        Arc::clone(&self.store)
    }

    /// One full cycle; Ctrl-C aborts it and the run is recorded as failed.
    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "ctrl-c handler unavailable; run cannot be interrupted");
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    pub async fn run_until<F>(&self, shutdown: F) -> Result<SyncRunSummary>
    where
        F: Future<Output = ()> + Send,
    {
        let _guard = self
            .run_lock
            .try_lock()
            .map_err(|_| anyhow!("a collection run is already in progress"))?;
        let run = CollectionRun::start(Utc::now());
        self.store.record_run(&run).await.context("recording run start")?;
        let span = info_span!("collection_run", run_id = %run.id);
        self.execute(run, shutdown).instrument(span).await
    }

    async fn execute<F>(&self, run: CollectionRun, shutdown: F) -> Result<SyncRunSummary>
    where
        F: Future<Output = ()> + Send,
    {
        let mut renderer = match self.source.open_renderer() {
            Ok(renderer) => renderer,
            Err(err) => return self.fail_run(&run, RunSetupError::Renderer(err), 0, 0).await,
        };
        let engine = CollectionEngine::new(self.source.listings(), self.config.policy.clone(), run.id);
        let base_url = self.source.base_url(&self.config.base_url);
        let mut sink = HistorySink {
            store: self.store.as_ref(),
            normalizer: &self.normalizer,
            attempted: 0,
            raw: Vec::new(),
            written: Vec::new(),
        };
        info!(base_url, "collection run started");

        let outcome = tokio::select! {
            biased;
            _ = shutdown => Err(RunSetupError::Aborted),
            result = engine.collect_with(base_url, &mut *renderer, &mut sink) => result,
        };
        if let Err(err) = renderer.shutdown().await {
            warn!(error = %err, "renderer shutdown failed");
        }
        let summary = match outcome {
            Ok(summary) => summary,
            Err(err) => {
                return self
                    .fail_run(&run, err, sink.attempted, sink.written.len())
                    .await
            }
        };

        let raw_artifact = match self.artifacts.store_json(run.started_at, "raw", &sink.raw).await {
            Ok(stored) => Some(stored.relative_path.display().to_string()),
            Err(err) => {
                warn!(error = %err, "raw batch archive failed; history is unaffected");
                None
            }
        };

        let finished = run.finish(
            summary.ended_at,
            summary.attempted,
            summary.succeeded,
            summary.status,
            summary.error_summary(),
        );
        self.store
            .record_run(&finished)
            .await
            .context("recording finished run")?;

        let reports_dir = self
            .write_reports(&finished, &summary, &sink.written, raw_artifact.as_deref())
            .await?;
        let manifest_path = export_parquet_snapshots(&reports_dir, &sink.written).await?;

        info!(
            attempted = summary.attempted,
            succeeded = summary.succeeded,
            status = finished.status.as_str(),
            "collection run finished"
        );
        Ok(SyncRunSummary {
            run: finished,
            failures: summary.failures,
            stored_snapshots: sink.written.len(),
            raw_artifact,
            reports_dir: reports_dir.display().to_string(),
            parquet_manifest: manifest_path.display().to_string(),
        })
    }

    async fn fail_run(
        &self,
        run: &CollectionRun,
        err: RunSetupError,
        attempted: usize,
        stored: usize,
    ) -> Result<SyncRunSummary> {
        error!(error = %err, attempted, stored, "collection run failed");
        let failed = run.finish(
            Utc::now(),
            attempted,
            stored,
            RunStatus::Failed,
            Some(err.to_string()),
        );
        self.store
            .record_run(&failed)
            .await
            .context("recording failed run")?;
        Err(anyhow::Error::new(err))
    }

    async fn write_reports(
        &self,
        run: &CollectionRun,
        summary: &RunSummary,
        written: &[NormalizedSnapshot],
        raw_artifact: Option<&str>,
    ) -> Result<PathBuf> {
        let reports_dir = self.config.workspace_root.join("reports").join(run.id.to_string());
        fs::create_dir_all(&reports_dir)
            .await
            .with_context(|| format!("creating {}", reports_dir.display()))?;

        let mut category_counts: BTreeMap<Category, usize> = BTreeMap::new();
        for snapshot in written {
            *category_counts.entry(snapshot.category).or_default() += 1;
        }

        let brief = format!(
            "# Shelf Watch Daily Brief\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Duration: {}\n- Status: {}\n- Attempted: {}\n- Succeeded: {}\n- Failed: {}\n\n## Category Counts\n{}\n\n## Failures\n{}\n",
            run.id,
            run.started_at,
            summary.ended_at,
            run.duration_seconds()
                .map(|secs| format!("{secs:.1}s"))
                .unwrap_or_else(|| "n/a".to_string()),
            run.status.as_str(),
            summary.attempted,
            summary.succeeded,
            summary.failures.len(),
            category_counts
                .iter()
                .map(|(category, count)| format!("- {}: {}", category.label(), count))
                .collect::<Vec<_>>()
                .join("\n"),
            if summary.failures.is_empty() {
                "- none".to_string()
            } else {
                summary
                    .failures
                    .iter()
                    .map(|f| format!("- {} ({}): {}", f.url, f.kind, f.reason))
                    .collect::<Vec<_>>()
                    .join("\n")
            }
        );
        fs::write(reports_dir.join("daily_brief.md"), brief)
            .await
            .context("writing daily_brief.md")?;

        let run_json = serde_json::to_vec_pretty(&serde_json::json!({
            "run": run,
            "failures": summary.failures,
            "raw_artifact": raw_artifact,
        }))
        .context("serializing run report")?;
        fs::write(reports_dir.join("run.json"), run_json)
            .await
            .context("writing run.json")?;

        Ok(reports_dir)
    }

    /// Cron-driven cycles, only when enabled in config. Each trigger runs one full cycle.
    pub async fn maybe_build_scheduler(self: Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.sync_cron.clone();
        let pipeline = Arc::clone(&self);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                match pipeline.run_once().await {
                    Ok(summary) => info!(
                        run_id = %summary.run.id,
                        status = summary.run.status.as_str(),
                        "scheduled collection run finished"
                    ),
                    Err(err) => warn!(error = %err, "scheduled collection run failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let pipeline = SyncPipeline::from_config(SyncConfig::from_env()).await?;
    pipeline.run_once().await
}

/// Markdown digest of the most recent `runs` report directories, newest first.
pub fn report_markdown(runs: usize, workspace_root: &Path) -> Result<String> {
    let reports_root = workspace_root.join("reports");
    let mut dirs = std::fs::read_dir(&reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .filter(|entry| entry.path().join("run.json").exists())
        .map(|entry| -> Result<(PathBuf, serde_json::Value)> {
            let path = entry.path();
            let report: serde_json::Value = serde_json::from_str(
                &std::fs::read_to_string(path.join("run.json"))
                    .with_context(|| format!("reading {}", path.join("run.json").display()))?,
            )
            .with_context(|| format!("parsing {}", path.join("run.json").display()))?;
            Ok((path, report))
        })
        .collect::<Result<Vec<_>>>()?;
    dirs.sort_by(|(_, a), (_, b)| {
        let started = |v: &serde_json::Value| {
            v.pointer("/run/started_at")
                .and_then(|s| s.as_str())
                .map(str::to_string)
        };
        started(b).cmp(&started(a))
    });

    let mut lines = vec!["# Shelf Watch Report".to_string(), String::new()];
    for (path, report) in dirs.into_iter().take(runs.max(1)) {
        let field = |pointer: &str| {
            report
                .pointer(pointer)
                .map(|v| match v {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_else(|| "unknown".to_string())
        };
        let failures = report
            .get("failures")
            .and_then(|v| v.as_array())
            .map(|a| a.len())
            .unwrap_or(0);

        lines.push(format!("## Run `{}`", field("/run/id")));
        lines.push(format!("- started: {}", field("/run/started_at")));
        lines.push(format!("- status: {}", field("/run/status")));
        lines.push(format!(
            "- succeeded: {} / {}",
            field("/run/succeeded_count"),
            field("/run/attempted_count")
        ));
        lines.push(format!("- failures: {failures}"));
        let manifest_path = path.join("snapshots").join("manifest.json");
        if manifest_path.exists() {
            lines.push(format!("- parquet manifest: `{}`", manifest_path.display()));
        }
        lines.push(format!("- daily brief: `{}`", path.join("daily_brief.md").display()));
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use shelf_storage::{JsonlSnapshotStore, MemorySnapshotStore};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::{tempdir, TempDir};
    use tokio::sync::Notify;

    fn fixture_config(dir: &TempDir) -> SyncConfig {
        SyncConfig {
            store_url: dir.path().join("history").display().to_string(),
            artifacts_dir: dir.path().join("artifacts"),
            workspace_root: dir.path().to_path_buf(),
            fixtures_dir: Some(
                Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/sample-catalog"),
            ),
            policy: CollectionPolicy::default().without_delays(),
            ..SyncConfig::default()
        }
    }

    fn pipeline(dir: &TempDir) -> SyncPipeline {
        let store = Arc::new(JsonlSnapshotStore::new(dir.path().join("history")));
        SyncPipeline::new(fixture_config(dir), store).expect("pipeline")
    }

    #[tokio::test]
    async fn repeated_runs_append_history() {
        let dir = tempdir().unwrap();
        let pipeline = pipeline(&dir);

        let first = pipeline.run_until(std::future::pending()).await.unwrap();
        let second = pipeline.run_until(std::future::pending()).await.unwrap();

        assert_ne!(first.run.id, second.run.id);
        assert_eq!(first.run.attempted_count, 7);
        assert_eq!(first.run.succeeded_count, 5);
        assert_eq!(first.run.status, RunStatus::CompletedWithErrors);
        assert!(first.run.error_summary.as_deref().unwrap_or_default().contains("stale-redirect"));

        let history = pipeline.store().query_all().await.unwrap();
        assert_eq!(history.len(), 10);
        let ranger_rows = history
            .iter()
            .filter(|s| s.product_url.ends_with("/ranger-plate-carrier"))
            .count();
        assert_eq!(ranger_rows, 2);

        let latest = pipeline.store().latest_run().await.unwrap().unwrap();
        assert_eq!(latest.id, second.run.id);
        assert!(latest.ended_at.is_some());
    }

    #[tokio::test]
    async fn run_writes_reports_archive_and_parquet() {
        let dir = tempdir().unwrap();
        let pipeline = pipeline(&dir);

        let summary = pipeline.run_until(std::future::pending()).await.unwrap();

        let reports = PathBuf::from(&summary.reports_dir);
        let brief = std::fs::read_to_string(reports.join("daily_brief.md")).unwrap();
        assert!(brief.contains("- Status: completed_with_errors"));
        assert!(brief.contains("- Duration: "));
        assert!(!brief.contains("- Duration: n/a"));
        assert!(brief.contains("- Plate Carriers: 1"));
        assert!(reports.join("run.json").exists());
        assert!(PathBuf::from(&summary.parquet_manifest).exists());

        let raw_path = dir.path().join("artifacts").join(summary.raw_artifact.unwrap());
        let archived: Vec<RawSnapshot> =
            serde_json::from_slice(&std::fs::read(raw_path).unwrap()).unwrap();
        assert_eq!(archived.len(), 5);

        let digest = report_markdown(5, dir.path()).unwrap();
        assert!(digest.contains(&summary.run.id.to_string()));
        assert!(digest.contains("- succeeded: 5 / 7"));
    }

    #[tokio::test]
    async fn aborted_run_is_recorded_as_failed() {
        let dir = tempdir().unwrap();
        let pipeline = pipeline(&dir);

        let err = pipeline.run_until(async {}).await.expect_err("aborted");

        assert!(matches!(
            err.downcast_ref::<RunSetupError>(),
            Some(RunSetupError::Aborted)
        ));
        let latest = pipeline.store().latest_run().await.unwrap().unwrap();
        assert_eq!(latest.status, RunStatus::Failed);
        assert!(pipeline.store().query_all().await.unwrap().is_empty());
    }

    /// Forwards to a memory store and signals once `limit` snapshots are appended.
    struct SignallingStore {
        inner: MemorySnapshotStore,
        appended: AtomicUsize,
        limit: usize,
        reached: Arc<Notify>,
    }

    #[async_trait]
    impl SnapshotStore for SignallingStore {
        async fn append(&self, snapshot: &NormalizedSnapshot) -> Result<(), StoreError> {
            self.inner.append(snapshot).await?;
            if self.appended.fetch_add(1, Ordering::SeqCst) + 1 == self.limit {
                self.reached.notify_one();
            }
            Ok(())
        }

        async fn query_all(&self) -> Result<Vec<NormalizedSnapshot>, StoreError> {
            self.inner.query_all().await
        }

        async fn record_run(&self, run: &CollectionRun) -> Result<(), StoreError> {
            self.inner.record_run(run).await
        }

        async fn latest_run(&self) -> Result<Option<CollectionRun>, StoreError> {
            self.inner.latest_run().await
        }
    }

    #[tokio::test]
    async fn abort_mid_run_keeps_attempted_and_stored_counts() {
        let dir = tempdir().unwrap();
        let reached = Arc::new(Notify::new());
        let store = Arc::new(SignallingStore {
            inner: MemorySnapshotStore::default(),
            appended: AtomicUsize::new(0),
            limit: 2,
            reached: reached.clone(),
        });
        let mut config = fixture_config(&dir);
        config.policy.cooldown = Duration::from_millis(20);
        let pipeline = SyncPipeline::new(config, store).unwrap();

        let err = pipeline
            .run_until(async move { reached.notified().await })
            .await
            .expect_err("aborted");

        assert!(matches!(
            err.downcast_ref::<RunSetupError>(),
            Some(RunSetupError::Aborted)
        ));
        let latest = pipeline.store().latest_run().await.unwrap().unwrap();
        assert_eq!(latest.status, RunStatus::Failed);
        assert_eq!(latest.succeeded_count, 2);
        assert!(latest.attempted_count >= 2 && latest.attempted_count < 7);
        assert_eq!(pipeline.store().query_all().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn overlapping_runs_are_refused() {
        let dir = tempdir().unwrap();
        let pipeline = pipeline(&dir);
        let _held = pipeline.run_lock.try_lock().unwrap();

        let err = pipeline.run_until(std::future::pending()).await.expect_err("busy");

        assert!(err.to_string().contains("already in progress"));
        assert!(pipeline.store().latest_run().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn scheduler_is_off_by_default() {
        let dir = tempdir().unwrap();
        let pipeline = Arc::new(pipeline(&dir));
        assert!(pipeline.maybe_build_scheduler().await.unwrap().is_none());
    }

    #[test]
    fn default_config_matches_documented_values() {
        let config = SyncConfig::default();
        assert_eq!(config.sync_cron, "0 0 */6 * * *");
        assert_eq!(config.policy.nav_attempts, 3);
        assert_eq!(config.policy.listing_workers, 5);
        assert_eq!(config.bucket_minutes, 60);
        assert!(config.fixtures_dir.is_none());
    }
}
