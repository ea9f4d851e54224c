//! Ingestion orchestration: page-by-page discovery, concurrent fetch and parse,
//! the stop heuristic, and the replace-all refresh.

use std::collections::HashSet;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use spx_adapters::{ColumnMapping, FileOutcome, ListingDiscoverer, ReportParser, DEFAULT_CUTOFF_YEAR};
use spx_storage::{
    open_trade_store, staged_file_name, HttpClientConfig, HttpFetcher, StagingArea, TradeStore,
};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use url::Url;
use uuid::Uuid;

pub const CRATE_NAME: &str = "spx-sync";

pub const DEFAULT_LISTING_URL: &str = "https://spimex.com/markets/oil_products/trades/results/?page=page-{page}&bxajaxid=d609bce6ada86eff0b6f7e49e6bae904";
pub const DEFAULT_REPORT_BASE_URL: &str = "https://spimex.com/";
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 12_3_1) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/15.4 Safari/605.1.15";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub staging_dir: PathBuf,
    pub listing_url: String,
    pub report_base_url: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub max_concurrent_downloads: usize,
    pub cutoff_year: i32,
    pub stop_threshold: usize,
    pub max_pages: Option<usize>,
    pub stop_count_non_stale: bool,
    pub column_mapping_path: Option<PathBuf>,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|v| !v.trim().is_empty()),
            staging_dir: std::env::var("SPX_STAGING_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./trades_file")),
            listing_url: std::env::var("SPX_LISTING_URL")
                .unwrap_or_else(|_| DEFAULT_LISTING_URL.to_string()),
            report_base_url: std::env::var("SPX_REPORT_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_REPORT_BASE_URL.to_string()),
            user_agent: std::env::var("SPX_USER_AGENT")
                .unwrap_or_else(|_| DEFAULT_USER_AGENT.to_string()),
            http_timeout_secs: env_parse("SPX_HTTP_TIMEOUT_SECS").unwrap_or(60),
            max_concurrent_downloads: env_parse("SPX_MAX_CONCURRENT_DOWNLOADS").unwrap_or(16),
            cutoff_year: env_parse("SPX_CUTOFF_YEAR").unwrap_or(DEFAULT_CUTOFF_YEAR),
            stop_threshold: env_parse("SPX_STOP_THRESHOLD").unwrap_or(15),
            max_pages: env_parse("SPX_MAX_PAGES"),
            stop_count_non_stale: env_flag("SPX_STOP_COUNT_NON_STALE", true),
            column_mapping_path: std::env::var("SPX_COLUMN_MAPPING").ok().map(PathBuf::from),
            scheduler_enabled: env_flag("SPX_SCHEDULER_ENABLED", false),
            sync_cron: std::env::var("SPX_SYNC_CRON")
                .unwrap_or_else(|_| "0 0 14 * * Mon-Fri".to_string()),
        }
    }

    pub fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            max_concurrent_downloads: self.max_concurrent_downloads,
            ..Default::default()
        }
    }

    pub fn stop_policy(&self) -> StopPolicy {
        StopPolicy {
            threshold: self.stop_threshold,
            max_pages: self.max_pages,
            count_non_stale: self.stop_count_non_stale,
        }
    }

    pub fn column_mapping(&self) -> Result<ColumnMapping> {
        match &self.column_mapping_path {
            Some(path) => ColumnMapping::from_yaml_file(path),
            None => Ok(ColumnMapping::builtin()),
        }
    }
}

/// When to stop walking listing pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopPolicy {
    /// Cumulative not-stored files (and empty pages) that end the run.
    pub threshold: usize,
    pub max_pages: Option<usize>,
    /// Whether rejected and store-failed files advance the counter like stale ones.
    pub count_non_stale: bool,
}

impl Default for StopPolicy {
    fn default() -> Self {
        Self {
            threshold: 15,
            max_pages: None,
            count_non_stale: true,
        }
    }
}

impl StopPolicy {
    pub fn page_in_bounds(&self, page: usize) -> bool {
        self.max_pages.map_or(true, |max| page < max)
    }

    /// Empty pages only feed the counter when nothing else bounds the walk.
    pub fn counts_empty_page(&self) -> bool {
        self.max_pages.is_none()
    }

    pub fn counts(&self, outcome: &FileOutcome) -> bool {
        match outcome {
            FileOutcome::Stored { .. } => false,
            FileOutcome::Stale { .. } => true,
            FileOutcome::Rejected(_) | FileOutcome::StoreFailed(_) => self.count_non_stale,
        }
    }

    pub fn reached(&self, counter: usize) -> bool {
        counter >= self.threshold
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Threshold,
    PageLimit,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestionReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub pages_visited: usize,
    pub empty_pages: usize,
    pub links_discovered: usize,
    /// Links skipped because an earlier link on the same page stages under the same name.
    pub duplicate_links: usize,
    pub downloads_failed: usize,
    pub files_stored: usize,
    pub files_stale: usize,
    pub files_rejected: usize,
    pub files_store_failed: usize,
    pub records_stored: u64,
    pub stop_counter: usize,
    pub stop_reason: StopReason,
}

#[derive(Debug, Default)]
struct Tally {
    pages_visited: usize,
    empty_pages: usize,
    links_discovered: usize,
    duplicate_links: usize,
    downloads_failed: usize,
    files_stored: usize,
    files_stale: usize,
    files_rejected: usize,
    files_store_failed: usize,
    records_stored: u64,
    stop_counter: usize,
}

impl Tally {
    fn record(&mut self, outcome: &FileOutcome) {
        match outcome {
            FileOutcome::Stored { records } => {
                self.files_stored += 1;
                self.records_stored += records;
            }
            FileOutcome::Stale { .. } => self.files_stale += 1,
            FileOutcome::Rejected(_) => self.files_rejected += 1,
            FileOutcome::StoreFailed(_) => self.files_store_failed += 1,
        }
    }
}

/// Walks listing pages, downloads and parses each page's reports concurrently,
/// and stops per the [`StopPolicy`].
pub struct IngestionOrchestrator {
    discoverer: ListingDiscoverer,
    http: Arc<HttpFetcher>,
    staging: StagingArea,
    parser: ReportParser,
    store: Arc<dyn TradeStore>,
    policy: StopPolicy,
}

impl IngestionOrchestrator {
    pub fn new(config: &SyncConfig, store: Arc<dyn TradeStore>) -> Result<Self> {
        let http = Arc::new(HttpFetcher::new(config.http_config())?);
        let report_base = Url::parse(&config.report_base_url)
            .with_context(|| format!("invalid report base url {}", config.report_base_url))?;
        anyhow::ensure!(
            config.listing_url.contains("{page}"),
            "listing url {} has no {{page}} placeholder",
            config.listing_url
        );
        let discoverer = ListingDiscoverer::new(Arc::clone(&http), config.listing_url.clone(), report_base);
        let parser = ReportParser::new(config.column_mapping()?, config.cutoff_year);
        Ok(Self {
            discoverer,
            http,
            staging: StagingArea::new(config.staging_dir.clone()),
            parser,
            store,
            policy: config.stop_policy(),
        })
    }

    /// Runs until the stop counter reaches the threshold or the page bound is hit.
    /// A listing page that cannot be fetched aborts the run.
    pub async fn run(&self) -> Result<IngestionReport> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let mut tally = Tally::default();

        let stop_reason = async {
            let mut page = 0usize;
            loop {
                if !self.policy.page_in_bounds(page) {
                    break Ok::<_, anyhow::Error>(StopReason::PageLimit);
                }
                self.ingest_page(page, &mut tally)
                    .instrument(info_span!("ingest_page", page))
                    .await?;
                if self.policy.reached(tally.stop_counter) {
                    break Ok(StopReason::Threshold);
                }
                page += 1;
            }
        }
        .instrument(info_span!("ingestion_run", %run_id))
        .await?;

        let report = IngestionReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            pages_visited: tally.pages_visited,
            empty_pages: tally.empty_pages,
            links_discovered: tally.links_discovered,
            duplicate_links: tally.duplicate_links,
            downloads_failed: tally.downloads_failed,
            files_stored: tally.files_stored,
            files_stale: tally.files_stale,
            files_rejected: tally.files_rejected,
            files_store_failed: tally.files_store_failed,
            records_stored: tally.records_stored,
            stop_counter: tally.stop_counter,
            stop_reason,
        };
        info!(
            %run_id,
            pages = report.pages_visited,
            records = report.records_stored,
            stale = report.files_stale,
            rejected = report.files_rejected,
            store_failed = report.files_store_failed,
            downloads_failed = report.downloads_failed,
            stop_reason = ?report.stop_reason,
            "ingestion finished"
        );
        Ok(report)
    }

    async fn ingest_page(&self, page: usize, tally: &mut Tally) -> Result<()> {
        let links = self
            .discoverer
            .discover(page)
            .await
            .with_context(|| format!("discovering reports on listing page {page}"))?;
        tally.pages_visited += 1;
        tally.links_discovered += links.len();

        if links.is_empty() {
            tally.empty_pages += 1;
            if self.policy.counts_empty_page() {
                tally.stop_counter += 1;
            }
            info!(stop_counter = tally.stop_counter, "listing page has no reports");
            return Ok(());
        }

        let mut names = HashSet::new();
        let mut unique = Vec::with_capacity(links.len());
        for url in &links {
            if names.insert(staged_file_name(url)) {
                unique.push(url.as_str());
            } else {
                tally.duplicate_links += 1;
                warn!(url = %url, "another link on this page stages under the same name; skipping");
            }
        }

        let downloads = join_all(
            unique
                .iter()
                .map(|url| self.http.download_to_staging(url, &self.staging)),
        )
        .await;

        let mut staged = Vec::with_capacity(downloads.len());
        for (url, result) in unique.iter().zip(downloads) {
            match result {
                Ok(file) => staged.push(file),
                Err(err) => {
                    tally.downloads_failed += 1;
                    warn!(url = %url, error = %err, "report download failed");
                }
            }
        }

        let outcomes = join_all(
            staged
                .into_iter()
                .map(|file| self.parser.parse_and_store(file, self.store.as_ref())),
        )
        .await;

        for outcome in &outcomes {
            tally.record(outcome);
            if self.policy.counts(outcome) {
                tally.stop_counter += 1;
                if !outcome.is_stale() {
                    warn!(
                        stop_counter = tally.stop_counter,
                        "non-stale failure advanced the stop counter"
                    );
                }
            }
        }

        info!(
            links = links.len(),
            stored = outcomes.iter().filter(|o| o.stored()).count(),
            stop_counter = tally.stop_counter,
            "listing page ingested"
        );
        Ok(())
    }
}

/// Notified after every full refresh, whether or not ingestion succeeded.
pub trait RefreshHook: Send + Sync {
    fn after_refresh(&self);
}

#[derive(Default)]
pub struct NoopRefreshHook;

impl RefreshHook for NoopRefreshHook {
    fn after_refresh(&self) {}
}

/// Replace-all refresh: truncate the store, re-ingest everything, notify hooks.
pub struct SyncPipeline {
    config: SyncConfig,
    store: Arc<dyn TradeStore>,
    orchestrator: IngestionOrchestrator,
    refresh_lock: Mutex<()>,
    hooks: Vec<Arc<dyn RefreshHook>>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig, store: Arc<dyn TradeStore>) -> Result<Self> {
        let orchestrator = IngestionOrchestrator::new(&config, Arc::clone(&store))?;
        Ok(Self {
            config,
            store,
            orchestrator,
            refresh_lock: Mutex::new(()),
            hooks: Vec::new(),
        })
    }

    pub fn with_refresh_hook(mut self, hook: Arc<dyn RefreshHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn TradeStore> {
        Arc::clone(&self.store)
    }

    /// Overlapping refreshes queue behind each other.
    pub async fn run_full_refresh(&self) -> Result<IngestionReport> {
        let _guard = self.refresh_lock.lock().await;
        self.store.truncate().await.context("truncating trade store")?;
        let result = self.orchestrator.run().await;
        for hook in &self.hooks {
            hook.after_refresh();
        }
        result
    }

    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let pipeline = Arc::clone(self);
        let cron = self.config.sync_cron.as_str();
        let job = Job::new_async(cron, move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                match pipeline.run_full_refresh().await {
                    Ok(report) => info!(
                        run_id = %report.run_id,
                        records = report.records_stored,
                        "scheduled refresh finished"
                    ),
                    Err(err) => error!(error = %format!("{err:#}"), "scheduled refresh failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

pub async fn run_sync_once_from_env() -> Result<IngestionReport> {
    let config = SyncConfig::from_env();
    let store = open_trade_store(config.database_url.as_deref()).await?;
    let pipeline = SyncPipeline::new(config, store)?;
    pipeline.run_full_refresh().await
}
