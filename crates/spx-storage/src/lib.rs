//! Report staging, HTTP fetch utilities and the trade store for the ingestion service.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use reqwest::header::{HeaderValue, ACCEPT};
use reqwest::StatusCode;
use spx_core::{DynamicsQuery, StoredTrade, TradeFilter, TradeRecord};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "spx-storage";

/// Write buffer size used while streaming report bodies to disk.
pub const DOWNLOAD_CHUNK_BYTES: usize = 8 * 1024;

const FALLBACK_FILE_NAME: &str = "downloaded_file.xls";

/// Local directory holding downloaded reports until they are parsed.
#[derive(Debug, Clone)]
pub struct StagingArea {
    root: PathBuf,
}

impl StagingArea {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for_url(&self, url: &str) -> PathBuf {
        self.root.join(staged_file_name(url))
    }
}

/// Last path segment of a report URL, ignoring query and fragment.
pub fn staged_file_name(url: &str) -> String {
    let path = match reqwest::Url::parse(url) {
        Ok(parsed) => parsed.path().to_string(),
        Err(_) => url.split(['?', '#']).next().unwrap_or_default().to_string(),
    };
    path.rsplit('/')
        .next()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .unwrap_or(FALLBACK_FILE_NAME)
        .to_string()
}

/// A downloaded report on disk. Whoever holds it must call [`StagedFile::discard`].
#[derive(Debug)]
pub struct StagedFile {
    path: PathBuf,
    source_url: String,
}

impl StagedFile {
    pub fn new(path: impl Into<PathBuf>, source_url: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            source_url: source_url.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
    }

    pub fn source_url(&self) -> &str {
        &self.source_url
    }

    /// Removes the file from staging. A file that is already gone is not an error.
    pub async fn discard(self) {
        match fs::remove_file(&self.path).await {
            Ok(()) => debug!(path = %self.path.display(), "staged file removed"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = %self.path.display(), error = %err, "failed to remove staged file"),
        }
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
    if err.is_timeout() || err.is_connect() {
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
            max_retries: 2,
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
    /// `Accept` header sent with listing page requests.
    pub listing_accept: String,
    pub max_concurrent_downloads: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
            listing_accept: "text/html".to_string(),
            max_concurrent_downloads: 16,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("staging io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("download limiter closed")]
    LimiterClosed,
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> FetchError + '_ {
    move |source| FetchError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    listing_accept: HeaderValue,
    download_limit: Arc<Semaphore>,
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
        let listing_accept = HeaderValue::from_str(&config.listing_accept)
            .with_context(|| format!("invalid accept header {:?}", config.listing_accept))?;

        Ok(Self {
            client,
            listing_accept,
            download_limit: Arc::new(Semaphore::new(config.max_concurrent_downloads.max(1))),
            backoff: config.backoff,
        })
    }

    /// Single-attempt GET of a listing page.
    pub async fn fetch_html(&self, url: &str) -> Result<String, FetchError> {
        let resp = self
            .client
            .get(url)
            .header(ACCEPT, self.listing_accept.clone())
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }
        Ok(resp.text().await?)
    }

    /// Streams a report into the staging area under a name derived from the URL.
    /// The body is written to a temp file and renamed into place once complete.
    pub async fn download_to_staging(
        &self,
        url: &str,
        staging: &StagingArea,
    ) -> Result<StagedFile, FetchError> {
        let _permit = self
            .download_limit
            .acquire()
            .await
            .map_err(|_| FetchError::LimiterClosed)?;

        fs::create_dir_all(staging.root())
            .await
            .map_err(io_error(staging.root()))?;

        let mut resp = self.send_with_retry(url).await?;

        let target = staging.path_for_url(url);
        let temp_path = staging.root().join(format!(".{}.part", Uuid::new_v4()));
        let file = fs::File::create(&temp_path)
            .await
            .map_err(io_error(&temp_path))?;
        let mut writer = BufWriter::with_capacity(DOWNLOAD_CHUNK_BYTES, file);

        let written: Result<u64, FetchError> = async {
            let mut bytes = 0u64;
            while let Some(chunk) = resp.chunk().await? {
                writer
                    .write_all(&chunk)
                    .await
                    .map_err(io_error(&temp_path))?;
                bytes += chunk.len() as u64;
            }
            writer.flush().await.map_err(io_error(&temp_path))?;
            Ok(bytes)
        }
        .await;
        drop(writer);

        let bytes = match written {
            Ok(bytes) => bytes,
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                return Err(err);
            }
        };

        if let Err(err) = fs::rename(&temp_path, &target).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(io_error(&target)(err));
        }

        info!(url, path = %target.display(), bytes, "report downloaded");
        Ok(StagedFile::new(target, url))
    }

    async fn send_with_retry(&self, url: &str) -> Result<reqwest::Response, FetchError> {
        let mut attempt = 0usize;
        loop {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp);
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(url, status = status.as_u16(), attempt, "retrying download");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: resp.url().to_string(),
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(url, error = %err, attempt, "retrying download");
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
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// Durable table of trade records.
#[async_trait]
pub trait TradeStore: Send + Sync {
    /// Removes every row and resets identity.
    async fn truncate(&self) -> Result<(), StoreError>;

    /// Inserts all records in a single transaction, stamping creation time.
    async fn insert_batch(&self, records: &[TradeRecord]) -> Result<u64, StoreError>;

    /// Distinct trade dates, newest first.
    async fn last_trading_dates(&self, limit: usize) -> Result<Vec<NaiveDate>, StoreError>;

    async fn trading_dynamics(&self, query: &DynamicsQuery) -> Result<Vec<StoredTrade>, StoreError>;

    /// Trades on the most recent trade date, empty when the store is empty.
    async fn last_trading_results(&self, filter: &TradeFilter) -> Result<Vec<StoredTrade>, StoreError>;

    async fn count(&self) -> Result<u64, StoreError>;
}

#[derive(Debug, Default)]
struct MemoryTable {
    rows: Vec<StoredTrade>,
    next_id: i64,
}

/// Process-local store used in tests and when no database is configured.
#[derive(Debug, Default)]
pub struct MemoryTradeStore {
    table: RwLock<MemoryTable>,
}

impl MemoryTradeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> Vec<StoredTrade> {
        self.table.read().await.rows.clone()
    }
}

#[async_trait]
impl TradeStore for MemoryTradeStore {
    async fn truncate(&self) -> Result<(), StoreError> {
        let mut table = self.table.write().await;
        table.rows.clear();
        table.next_id = 0;
        Ok(())
    }

    async fn insert_batch(&self, records: &[TradeRecord]) -> Result<u64, StoreError> {
        let now = Utc::now();
        let mut table = self.table.write().await;
        for record in records {
            table.next_id += 1;
            let id = table.next_id;
            table.rows.push(StoredTrade {
                id,
                record: record.clone(),
                created_at: now,
                updated_at: now,
            });
        }
        Ok(records.len() as u64)
    }

    async fn last_trading_dates(&self, limit: usize) -> Result<Vec<NaiveDate>, StoreError> {
        let table = self.table.read().await;
        let mut dates = table
            .rows
            .iter()
            .map(|r| r.record.trade_date)
            .collect::<Vec<_>>();
        dates.sort_unstable_by(|a, b| b.cmp(a));
        dates.dedup();
        dates.truncate(limit);
        Ok(dates)
    }

    async fn trading_dynamics(&self, query: &DynamicsQuery) -> Result<Vec<StoredTrade>, StoreError> {
        let table = self.table.read().await;
        let mut rows = table
            .rows
            .iter()
            .filter(|r| query.matches(&r.record))
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by_key(|r| (r.record.trade_date, r.id));
        Ok(rows)
    }

    async fn last_trading_results(&self, filter: &TradeFilter) -> Result<Vec<StoredTrade>, StoreError> {
        let table = self.table.read().await;
        let Some(max_date) = table.rows.iter().map(|r| r.record.trade_date).max() else {
            return Ok(Vec::new());
        };
        Ok(table
            .rows
            .iter()
            .filter(|r| r.record.trade_date == max_date && filter.matches(&r.record))
            .cloned()
            .collect())
    }

    async fn count(&self) -> Result<u64, StoreError> {
        Ok(self.table.read().await.rows.len() as u64)
    }
}

const TRADES_TABLE: &str = "spimex_trading_results";
const SELECT_COLUMNS: &str = "id, exchange_product_id, exchange_product_name, oil_id, \
     delivery_basis_id, delivery_basis_name, delivery_type_id, volume, total, count, \
     date, created_on, updated_on";

// 12 binds per row keeps each statement well under the postgres limit of 65535.
const INSERT_CHUNK_ROWS: usize = 1000;

#[derive(Debug, Clone)]
pub struct PgTradeStore {
    pool: PgPool,
}

impl PgTradeStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn push_filter(builder: &mut QueryBuilder<'static, Postgres>, filter: &TradeFilter) {
    if let Some(oil_id) = &filter.oil_id {
        builder.push(" AND oil_id = ").push_bind(oil_id.clone());
    }
    if let Some(delivery_type_id) = &filter.delivery_type_id {
        builder
            .push(" AND delivery_type_id = ")
            .push_bind(delivery_type_id.clone());
    }
    if let Some(delivery_basis_id) = &filter.delivery_basis_id {
        builder
            .push(" AND delivery_basis_id = ")
            .push_bind(delivery_basis_id.clone());
    }
}

fn dynamics_query(query: &DynamicsQuery) -> QueryBuilder<'static, Postgres> {
    let mut builder = QueryBuilder::new(format!(
        "SELECT {SELECT_COLUMNS} FROM {TRADES_TABLE} WHERE date >= "
    ));
    builder.push_bind(query.start_date);
    builder.push(" AND date <= ").push_bind(query.end_date);
    push_filter(&mut builder, &query.filter);
    builder.push(" ORDER BY date, id");
    builder
}

fn day_results_query(date: NaiveDate, filter: &TradeFilter) -> QueryBuilder<'static, Postgres> {
    let mut builder = QueryBuilder::new(format!(
        "SELECT {SELECT_COLUMNS} FROM {TRADES_TABLE} WHERE date = "
    ));
    builder.push_bind(date);
    push_filter(&mut builder, filter);
    builder.push(" ORDER BY id");
    builder
}

fn row_to_trade(row: &PgRow) -> Result<StoredTrade, sqlx::Error> {
    let id: i32 = row.try_get("id")?;
    Ok(StoredTrade {
        id: i64::from(id),
        record: TradeRecord {
            exchange_product_id: row.try_get("exchange_product_id")?,
            exchange_product_name: row.try_get("exchange_product_name")?,
            oil_id: row.try_get("oil_id")?,
            delivery_basis_id: row.try_get("delivery_basis_id")?,
            delivery_basis_name: row.try_get("delivery_basis_name")?,
            delivery_type_id: row.try_get("delivery_type_id")?,
            volume: row.try_get("volume")?,
            total: row.try_get("total")?,
            count: row.try_get("count")?,
            trade_date: row.try_get("date")?,
        },
        created_at: row.try_get("created_on")?,
        updated_at: row.try_get("updated_on")?,
    })
}

#[async_trait]
impl TradeStore for PgTradeStore {
    async fn truncate(&self) -> Result<(), StoreError> {
        sqlx::query(&format!("TRUNCATE TABLE {TRADES_TABLE} RESTART IDENTITY CASCADE"))
            .execute(&self.pool)
            .await?;
        info!(table = TRADES_TABLE, "trade table truncated");
        Ok(())
    }

    async fn insert_batch(&self, records: &[TradeRecord]) -> Result<u64, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;
        for chunk in records.chunks(INSERT_CHUNK_ROWS) {
            let mut builder: QueryBuilder<'static, Postgres> = QueryBuilder::new(format!(
                "INSERT INTO {TRADES_TABLE} (exchange_product_id, exchange_product_name, oil_id, \
                 delivery_basis_id, delivery_basis_name, delivery_type_id, volume, total, count, \
                 date, created_on, updated_on) "
            ));
            builder.push_values(chunk, |mut row, r| {
                row.push_bind(r.exchange_product_id.clone())
                    .push_bind(r.exchange_product_name.clone())
                    .push_bind(r.oil_id.clone())
                    .push_bind(r.delivery_basis_id.clone())
                    .push_bind(r.delivery_basis_name.clone())
                    .push_bind(r.delivery_type_id.clone())
                    .push_bind(r.volume)
                    .push_bind(r.total)
                    .push_bind(r.count)
                    .push_bind(r.trade_date)
                    .push_bind(now)
                    .push_bind(now);
            });
            inserted += builder.build().execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn last_trading_dates(&self, limit: usize) -> Result<Vec<NaiveDate>, StoreError> {
        let dates = sqlx::query_scalar::<_, NaiveDate>(&format!(
            "SELECT DISTINCT date FROM {TRADES_TABLE} ORDER BY date DESC LIMIT $1"
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(dates)
    }

    async fn trading_dynamics(&self, query: &DynamicsQuery) -> Result<Vec<StoredTrade>, StoreError> {
        let rows = dynamics_query(query).build().fetch_all(&self.pool).await?;
        Ok(rows.iter().map(row_to_trade).collect::<Result<Vec<_>, _>>()?)
    }

    async fn last_trading_results(&self, filter: &TradeFilter) -> Result<Vec<StoredTrade>, StoreError> {
        let max_date = sqlx::query_scalar::<_, Option<NaiveDate>>(&format!(
            "SELECT MAX(date) FROM {TRADES_TABLE}"
        ))
        .fetch_one(&self.pool)
        .await?;
        let Some(max_date) = max_date else {
            return Ok(Vec::new());
        };
        let rows = day_results_query(max_date, filter)
            .build()
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(row_to_trade).collect::<Result<Vec<_>, _>>()?)
    }

    async fn count(&self) -> Result<u64, StoreError> {
        let count = sqlx::query_scalar::<_, i64>(&format!("SELECT COUNT(*) FROM {TRADES_TABLE}"))
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }
}

/// Connects and migrates postgres when a URL is configured, otherwise falls back
/// to an in-memory store.
pub async fn open_trade_store(database_url: Option<&str>) -> anyhow::Result<Arc<dyn TradeStore>> {
    match database_url {
        Some(url) => {
            let store = PgTradeStore::connect(url)
                .await
                .context("connecting to trade database")?;
            store.migrate().await.context("applying trade schema")?;
            Ok(Arc::new(store))
        }
        None => {
            warn!("DATABASE_URL not set; using in-memory trade store");
            Ok(Arc::new(MemoryTradeStore::new()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::extract::State;
    use axum::response::{IntoResponse, Response};
    use axum::routing::get;
    use axum::Router;
    use tempfile::tempdir;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn record(code: &str, date: NaiveDate) -> TradeRecord {
        TradeRecord::new(code, "Test Product", "Test Basis", 100.0, 500_000, 10, date)
    }

    async fn seeded_store() -> MemoryTradeStore {
        let store = MemoryTradeStore::new();
        store
            .insert_batch(&[
                record("A100000E", day(2023, 1, 1)),
                record("A200001T", day(2023, 1, 2)),
                record("A100001E", day(2023, 1, 1)),
            ])
            .await
            .expect("seed");
        store
    }

    #[test]
    fn staged_names_come_from_the_url_path() {
        assert_eq!(
            staged_file_name("https://spimex.com/upload/reports/oil_xls/oil_xls_20240301162000.xls?r=1"),
            "oil_xls_20240301162000.xls"
        );
        assert_eq!(staged_file_name("https://spimex.com/"), FALLBACK_FILE_NAME);
        assert_eq!(staged_file_name("not a url/oil_xls_1.xls"), "oil_xls_1.xls");
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn only_server_side_statuses_are_retried() {
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
    }

    #[tokio::test]
    async fn discard_removes_the_staged_file_and_tolerates_missing_files() {
        let dir = tempdir().expect("tempdir");
        let staging = StagingArea::new(dir.path());
        let path = staging.path_for_url("https://example.test/oil_xls_20240301000000.xls");
        std::fs::write(&path, b"payload").expect("write");

        let staged = StagedFile::new(&path, "https://example.test/oil_xls_20240301000000.xls");
        assert_eq!(staged.file_name(), "oil_xls_20240301000000.xls");
        staged.discard().await;
        assert!(!path.exists());

        StagedFile::new(&path, "again").discard().await;
    }

    #[derive(Clone)]
    struct FlakyServer {
        hits: Arc<AtomicUsize>,
        failures_before_success: usize,
        failure: axum::http::StatusCode,
    }

    async fn flaky_report(State(server): State<FlakyServer>) -> Response {
        let hit = server.hits.fetch_add(1, Ordering::SeqCst);
        if hit < server.failures_before_success {
            server.failure.into_response()
        } else {
            b"report body".to_vec().into_response()
        }
    }

    async fn spawn_flaky(server: FlakyServer) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new()
            .route("/files/{name}", get(flaky_report))
            .with_state(server);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn fast_retry_fetcher() -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(5),
            backoff: BackoffPolicy {
                max_retries: 1,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
            ..HttpClientConfig::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn server_errors_are_retried_before_the_download_succeeds() {
        let hits = Arc::new(AtomicUsize::new(0));
        let addr = spawn_flaky(FlakyServer {
            hits: Arc::clone(&hits),
            failures_before_success: 1,
            failure: axum::http::StatusCode::SERVICE_UNAVAILABLE,
        })
        .await;
        let dir = tempdir().unwrap();
        let staging = StagingArea::new(dir.path());

        let url = format!("http://{addr}/files/oil_xls_20240301162000.xls");
        let staged = fast_retry_fetcher()
            .download_to_staging(&url, &staging)
            .await
            .unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(staged.file_name(), "oil_xls_20240301162000.xls");
        assert_eq!(std::fs::read(staged.path()).unwrap(), b"report body");
    }

    #[tokio::test]
    async fn missing_reports_are_not_retried() {
        let hits = Arc::new(AtomicUsize::new(0));
        let addr = spawn_flaky(FlakyServer {
            hits: Arc::clone(&hits),
            failures_before_success: usize::MAX,
            failure: axum::http::StatusCode::NOT_FOUND,
        })
        .await;
        let dir = tempdir().unwrap();
        let staging = StagingArea::new(dir.path());

        let url = format!("http://{addr}/files/oil_xls_20240301162000.xls");
        let err = fast_retry_fetcher()
            .download_to_staging(&url, &staging)
            .await
            .unwrap_err();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(matches!(err, FetchError::HttpStatus { status: 404, .. }));
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn last_trading_dates_are_distinct_and_descending() {
        let store = seeded_store().await;
        let dates = store.last_trading_dates(2).await.expect("dates");
        assert_eq!(dates, vec![day(2023, 1, 2), day(2023, 1, 1)]);
        assert_eq!(store.last_trading_dates(1).await.expect("dates"), vec![day(2023, 1, 2)]);
    }

    #[tokio::test]
    async fn dynamics_filters_by_range_and_instrument() {
        let store = seeded_store().await;
        let rows = store
            .trading_dynamics(&DynamicsQuery {
                start_date: day(2023, 1, 1),
                end_date: day(2023, 1, 1),
                filter: TradeFilter {
                    oil_id: Some("A100".into()),
                    ..Default::default()
                },
            })
            .await
            .expect("dynamics");
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.record.oil_id == "A100"));

        let all = store
            .trading_dynamics(&DynamicsQuery {
                start_date: day(2023, 1, 1),
                end_date: day(2023, 1, 2),
                filter: TradeFilter::default(),
            })
            .await
            .expect("dynamics");
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn last_results_use_the_most_recent_day() {
        let store = seeded_store().await;
        let rows = store
            .last_trading_results(&TradeFilter::default())
            .await
            .expect("results");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].record.trade_date, day(2023, 1, 2));

        let filtered = store
            .last_trading_results(&TradeFilter {
                oil_id: Some("A100".into()),
                ..Default::default()
            })
            .await
            .expect("results");
        assert!(filtered.is_empty());

        assert!(MemoryTradeStore::new()
            .last_trading_results(&TradeFilter::default())
            .await
            .expect("empty")
            .is_empty());
    }

    #[tokio::test]
    async fn truncate_clears_rows_and_restarts_identity() {
        let store = seeded_store().await;
        assert_eq!(store.count().await.expect("count"), 3);
        store.truncate().await.expect("truncate");
        assert_eq!(store.count().await.expect("count"), 0);

        store
            .insert_batch(&[record("A100000E", day(2024, 1, 1))])
            .await
            .expect("insert");
        let rows = store.snapshot().await;
        assert_eq!(rows[0].id, 1);
        assert_eq!(rows[0].created_at, rows[0].updated_at);
    }

    #[test]
    fn dynamics_sql_binds_only_present_filters() {
        let query = DynamicsQuery {
            start_date: day(2023, 1, 1),
            end_date: day(2023, 1, 2),
            filter: TradeFilter {
                delivery_type_id: Some("E".into()),
                ..Default::default()
            },
        };
        let builder = dynamics_query(&query);
        let sql = builder.sql();
        assert!(sql.contains("date >= $1 AND date <= $2"));
        assert!(sql.contains("AND delivery_type_id = $3"));
        assert!(!sql.contains("oil_id ="));
        assert!(sql.ends_with("ORDER BY date, id"));
    }
}
