//! Axum query API over the trade store, with a daily-expiring response cache
//! and the manual refresh endpoint.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::{StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{delete, get},
    Json, Router,
};
use chrono::{Local, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use spx_core::{DynamicsQuery, StoredTrade, TradeFilter};
use spx_storage::{open_trade_store, TradeStore};
use spx_sync::{RefreshHook, SyncConfig, SyncPipeline};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info};

pub const CRATE_NAME: &str = "spx-web";

pub const DEFAULT_DATES_LIMIT: i64 = 10;
pub const MAX_DATES_LIMIT: i64 = 100;

fn default_flush_at() -> NaiveTime {
    NaiveTime::from_hms_opt(14, 11, 0).unwrap_or_default()
}

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub port: u16,
    /// Local wall-clock time at which cached responses expire every day.
    pub cache_flush_at: NaiveTime,
}

impl WebConfig {
    pub fn from_env() -> Self {
        Self {
            port: std::env::var("SPX_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
            cache_flush_at: std::env::var("SPX_CACHE_FLUSH_AT")
                .ok()
                .and_then(|v| NaiveTime::parse_from_str(v.trim(), "%H:%M").ok())
                .unwrap_or_else(default_flush_at),
        }
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

/// Local time of the host.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// The next occurrence of `at` strictly after `now`.
pub fn next_daily_instant(now: NaiveDateTime, at: NaiveTime) -> NaiveDateTime {
    let today = now.date().and_time(at);
    if today > now {
        today
    } else {
        today + chrono::Duration::days(1)
    }
}

pub fn wait_until_next(now: NaiveDateTime, at: NaiveTime) -> Duration {
    (next_daily_instant(now, at) - now).to_std().unwrap_or_default()
}

/// Cache key: path without trailing slash plus the query pairs in sorted order.
pub fn cache_key(path: &str, query: Option<&str>) -> String {
    let path = match path.trim_end_matches('/') {
        "" => "/",
        trimmed => trimmed,
    };
    let mut pairs = query
        .unwrap_or_default()
        .split('&')
        .filter(|pair| !pair.is_empty())
        .collect::<Vec<_>>();
    if pairs.is_empty() {
        return path.to_string();
    }
    pairs.sort_unstable();
    format!("{path}?{}", pairs.join("&"))
}

#[derive(Debug, Clone)]
struct CacheEntry {
    body: Value,
    expires_at: NaiveDateTime,
}

/// JSON responses keyed by request, all expiring at the next daily flush instant.
///
/// Every flush bumps a generation. A body computed before a flush carries the
/// older generation and is not stored.
pub struct ResponseCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    clock: Arc<dyn Clock>,
    flush_at: NaiveTime,
    generation: AtomicU64,
}

impl ResponseCache {
    pub fn new(clock: Arc<dyn Clock>, flush_at: NaiveTime) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
            flush_at,
            generation: AtomicU64::new(0),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let now = self.clock.now();
        let mut entries = self.entries();
        match entries.get(key) {
            Some(entry) if entry.expires_at > now => Some(entry.body.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Generation to pass back to [`ResponseCache::put`] once the body is computed.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Stores `body` unless the cache was flushed after `generation` was read.
    pub fn put(&self, key: impl Into<String>, body: Value, generation: u64) -> bool {
        let expires_at = next_daily_instant(self.clock.now(), self.flush_at);
        let mut entries = self.entries();
        if self.generation.load(Ordering::SeqCst) != generation {
            return false;
        }
        entries.insert(key.into(), CacheEntry { body, expires_at });
        true
    }

    pub fn flush(&self) {
        let dropped = {
            let mut entries = self.entries();
            let n = entries.len();
            entries.clear();
            self.generation.fetch_add(1, Ordering::SeqCst);
            n
        };
        info!(dropped, "response cache flushed");
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RefreshHook for ResponseCache {
    fn after_refresh(&self) {
        self.flush();
    }
}

/// Sleeps until the next daily instant, flushes the cache, repeats.
pub struct DailyCacheFlusher {
    cache: Arc<ResponseCache>,
    clock: Arc<dyn Clock>,
    at: NaiveTime,
}

impl DailyCacheFlusher {
    pub fn new(cache: Arc<ResponseCache>, clock: Arc<dyn Clock>, at: NaiveTime) -> Self {
        Self { cache, clock, at }
    }

    pub async fn run(self) {
        loop {
            let wait = wait_until_next(self.clock.now(), self.at);
            debug!(secs = wait.as_secs(), "next cache flush scheduled");
            tokio::time::sleep(wait).await;
            self.cache.flush();
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn TradeStore>,
    pub pipeline: Arc<SyncPipeline>,
    pub cache: Arc<ResponseCache>,
}

impl AppState {
    pub fn new(pipeline: Arc<SyncPipeline>, cache: Arc<ResponseCache>) -> Self {
        Self {
            store: pipeline.store(),
            pipeline,
            cache,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TradeResponse {
    pub exchange_product_id: String,
    pub exchange_product_name: String,
    pub oil_id: String,
    pub delivery_basis_id: String,
    pub delivery_basis_name: String,
    pub delivery_type_id: String,
    pub volume: f64,
    pub total: i64,
    pub count: i64,
    pub date: NaiveDate,
}

impl From<StoredTrade> for TradeResponse {
    fn from(trade: StoredTrade) -> Self {
        let r = trade.record;
        Self {
            exchange_product_id: r.exchange_product_id,
            exchange_product_name: r.exchange_product_name,
            oil_id: r.oil_id,
            delivery_basis_id: r.delivery_basis_id,
            delivery_basis_name: r.delivery_basis_name,
            delivery_type_id: r.delivery_type_id,
            volume: r.volume,
            total: r.total,
            count: r.count,
            date: r.trade_date,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DatesResponse {
    pub dates: Vec<NaiveDate>,
}

#[derive(Debug, Deserialize, Default)]
struct DatesParams {
    limit: Option<i64>,
}

#[derive(Debug, Deserialize, Default)]
struct FilterParams {
    oil_id: Option<String>,
    delivery_type_id: Option<String>,
    delivery_basis_id: Option<String>,
}

impl FilterParams {
    fn into_filter(self) -> TradeFilter {
        let present = |v: Option<String>| v.filter(|s| !s.trim().is_empty());
        TradeFilter {
            oil_id: present(self.oil_id),
            delivery_type_id: present(self.delivery_type_id),
            delivery_basis_id: present(self.delivery_basis_id),
        }
    }
}

#[derive(Debug, Deserialize)]
struct DynamicsParams {
    start_date: NaiveDate,
    end_date: NaiveDate,
    oil_id: Option<String>,
    delivery_type_id: Option<String>,
    delivery_basis_id: Option<String>,
}

#[derive(Debug)]
enum ApiError {
    BadRequest(String),
    NotFound(String),
    Unprocessable(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match self {
            ApiError::BadRequest(d) => (StatusCode::BAD_REQUEST, d),
            ApiError::NotFound(d) => (StatusCode::NOT_FOUND, d),
            ApiError::Unprocessable(d) => (StatusCode::UNPROCESSABLE_ENTITY, d),
            ApiError::Internal(d) => (StatusCode::INTERNAL_SERVER_ERROR, d),
        };
        (status, Json(json!({ "detail": detail }))).into_response()
    }
}

fn store_error(err: impl std::fmt::Display) -> ApiError {
    error!(error = %err, "trade store query failed");
    ApiError::Internal(format!("failed to load trading data: {err}"))
}

fn trades_json(trades: Vec<StoredTrade>) -> Result<Value, ApiError> {
    let body = trades.into_iter().map(TradeResponse::from).collect::<Vec<_>>();
    serde_json::to_value(body).map_err(|e| ApiError::Internal(e.to_string()))
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/trades/dates", get(dates_handler))
        .route("/trades/dates/", get(dates_handler))
        .route("/trades/dynamics", get(dynamics_handler))
        .route("/trades/dynamics/", get(dynamics_handler))
        .route("/trades/results", get(results_handler))
        .route("/trades/results/", get(results_handler))
        .route("/refresh", delete(refresh_handler))
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let web = WebConfig::from_env();
    let sync = SyncConfig::from_env();
    let store = open_trade_store(sync.database_url.as_deref()).await?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let cache = Arc::new(ResponseCache::new(Arc::clone(&clock), web.cache_flush_at));
    let pipeline = Arc::new(SyncPipeline::new(sync, store)?.with_refresh_hook(cache.clone()));

    let scheduler = pipeline.maybe_build_scheduler().await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting refresh scheduler")?;
        info!(cron = %pipeline.config().sync_cron, "scheduled refresh enabled");
    }

    tokio::spawn(DailyCacheFlusher::new(cache.clone(), clock, web.cache_flush_at).run());

    let listener = TcpListener::bind(("0.0.0.0", web.port))
        .await
        .with_context(|| format!("binding port {}", web.port))?;
    info!(port = web.port, "trade api listening");
    axum::serve(listener, app(AppState::new(pipeline, cache))).await?;
    Ok(())
}

/// Serves a cached body when present, otherwise computes and caches a successful one.
async fn respond_cached<F, Fut>(state: &AppState, uri: &Uri, compute: F) -> Response
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Value, ApiError>>,
{
    let key = cache_key(uri.path(), uri.query());
    if let Some(body) = state.cache.get(&key) {
        debug!(key = %key, "cache hit");
        return Json(body).into_response();
    }
    let generation = state.cache.generation();
    match compute().await {
        Ok(body) => {
            if !state.cache.put(key.as_str(), body.clone(), generation) {
                debug!(key = %key, "cache flushed while computing; response not cached");
            }
            Json(body).into_response()
        }
        Err(err) => err.into_response(),
    }
}

async fn dates_handler(
    State(state): State<Arc<AppState>>,
    uri: Uri,
    Query(params): Query<DatesParams>,
) -> Response {
    respond_cached(&state, &uri, || async {
        let limit = params.limit.unwrap_or(DEFAULT_DATES_LIMIT);
        if !(1..=MAX_DATES_LIMIT).contains(&limit) {
            return Err(ApiError::Unprocessable(format!(
                "limit must be between 1 and {MAX_DATES_LIMIT}"
            )));
        }
        let dates = state
            .store
            .last_trading_dates(limit as usize)
            .await
            .map_err(store_error)?;
        serde_json::to_value(DatesResponse { dates }).map_err(|e| ApiError::Internal(e.to_string()))
    })
    .await
}

async fn dynamics_handler(
    State(state): State<Arc<AppState>>,
    uri: Uri,
    Query(params): Query<DynamicsParams>,
) -> Response {
    respond_cached(&state, &uri, || async {
        if params.start_date > params.end_date {
            return Err(ApiError::BadRequest(
                "start_date must not be after end_date".to_string(),
            ));
        }
        let query = DynamicsQuery {
            start_date: params.start_date,
            end_date: params.end_date,
            filter: FilterParams {
                oil_id: params.oil_id,
                delivery_type_id: params.delivery_type_id,
                delivery_basis_id: params.delivery_basis_id,
            }
            .into_filter(),
        };
        let trades = state.store.trading_dynamics(&query).await.map_err(store_error)?;
        if trades.is_empty() {
            return Err(ApiError::NotFound("no trades found for the requested period".to_string()));
        }
        trades_json(trades)
    })
    .await
}

async fn results_handler(
    State(state): State<Arc<AppState>>,
    uri: Uri,
    Query(params): Query<FilterParams>,
) -> Response {
    respond_cached(&state, &uri, || async {
        let trades = state
            .store
            .last_trading_results(&params.into_filter())
            .await
            .map_err(store_error)?;
        if trades.is_empty() {
            return Err(ApiError::NotFound("no trades found for the last trading day".to_string()));
        }
        trades_json(trades)
    })
    .await
}

async fn refresh_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.pipeline.run_full_refresh().await {
        Ok(report) => {
            info!(
                run_id = %report.run_id,
                records = report.records_stored,
                pages = report.pages_visited,
                "manual refresh finished"
            );
            Json(json!({ "msg": "success" })).into_response()
        }
        Err(err) => {
            error!(error = %format!("{err:#}"), "manual refresh failed");
            ApiError::Internal(format!("refresh failed: {err:#}")).into_response()
        }
    }
}
