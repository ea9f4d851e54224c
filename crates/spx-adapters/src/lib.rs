//! Exchange-site adapters: listing page link discovery and daily report parsing.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use calamine::{open_workbook_auto, Data, Reader};
use chrono::{Datelike, NaiveDate};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use spx_core::TradeRecord;
use spx_storage::{FetchError, HttpFetcher, StagedFile, StoreError, TradeStore};
use thiserror::Error;
use tracing::{error, info, warn};
use url::Url;

pub const CRATE_NAME: &str = "spx-adapters";

/// Result links on the listing page: accordion item titles carrying the `xls` class.
pub const REPORT_LINK_SELECTOR: &str = ".accordeon-inner__item-title.link.xls";

/// Banner rows above the table that are never scanned for the header.
pub const PREAMBLE_ROWS: usize = 6;

/// Reports dated in or before this year are outside the tracked horizon.
pub const DEFAULT_CUTOFF_YEAR: i32 = 2023;

/// Instrument-code prefixes of subtotal, section and unit rows.
pub const AGGREGATE_MARKERS: &[&str] = &[
    "Итого",
    "Итого по секции",
    "Секция Биржи: «Нефтепродукты» АО «СПбМТСБ»",
    "Единица измерения: Метрическая тонна",
];

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("fetching listing page {page} ({url}): {source}")]
    Fetch {
        page: usize,
        url: String,
        #[source]
        source: FetchError,
    },
    #[error("invalid selector {selector}: {message}")]
    Selector { selector: String, message: String },
}

/// Fetches paginated listing pages and extracts report download links.
#[derive(Debug, Clone)]
pub struct ListingDiscoverer {
    http: Arc<HttpFetcher>,
    listing_url_template: String,
    report_base: Url,
}

impl ListingDiscoverer {
    /// `listing_url_template` must contain a `{page}` placeholder.
    pub fn new(http: Arc<HttpFetcher>, listing_url_template: impl Into<String>, report_base: Url) -> Self {
        Self {
            http,
            listing_url_template: listing_url_template.into(),
            report_base,
        }
    }

    pub fn listing_url(&self, page: usize) -> String {
        self.listing_url_template.replace("{page}", &page.to_string())
    }

    /// Absolute report URLs found on `page`. An empty vector marks the end of pagination.
    pub async fn discover(&self, page: usize) -> Result<Vec<String>, DiscoveryError> {
        let url = self.listing_url(page);
        let html = self
            .http
            .fetch_html(&url)
            .await
            .map_err(|source| DiscoveryError::Fetch {
                page,
                url: url.clone(),
                source,
            })?;
        let links = extract_report_links(&html)?
            .into_iter()
            .filter_map(|href| match resolve_report_url(&self.report_base, &href) {
                Some(absolute) => Some(absolute),
                None => {
                    warn!(page, href = %href, "skipping unresolvable report link");
                    None
                }
            })
            .collect::<Vec<_>>();
        info!(page, links = links.len(), "listing page discovered");
        Ok(links)
    }
}

/// `href` values of every report link in a listing page, in document order.
pub fn extract_report_links(html: &str) -> Result<Vec<String>, DiscoveryError> {
    let selector = Selector::parse(REPORT_LINK_SELECTOR).map_err(|e| DiscoveryError::Selector {
        selector: REPORT_LINK_SELECTOR.to_string(),
        message: e.to_string(),
    })?;
    let document = Html::parse_document(html);
    Ok(document
        .select(&selector)
        .filter_map(|link| link.value().attr("href"))
        .map(str::trim)
        .filter(|href| !href.is_empty())
        .map(ToString::to_string)
        .collect())
}

pub fn resolve_report_url(base: &Url, href: &str) -> Option<String> {
    base.join(href).ok().map(|u| u.to_string())
}

/// Trade fields fed from spreadsheet columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeField {
    ExchangeProductId,
    ExchangeProductName,
    DeliveryBasisName,
    Volume,
    Total,
    Count,
}

impl TradeField {
    pub const ALL: [TradeField; 6] = [
        TradeField::ExchangeProductId,
        TradeField::ExchangeProductName,
        TradeField::DeliveryBasisName,
        TradeField::Volume,
        TradeField::Total,
        TradeField::Count,
    ];
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnRule {
    pub field: TradeField,
    pub label: String,
}

/// Versioned table from source header labels to trade fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMapping {
    pub version: u32,
    /// Text identifying the header row.
    pub header_token: String,
    pub columns: Vec<ColumnRule>,
}

impl ColumnMapping {
    pub fn builtin() -> Self {
        let rule = |field, label: &str| ColumnRule {
            field,
            label: label.to_string(),
        };
        Self {
            version: 1,
            header_token: "Код\nИнструмента".to_string(),
            columns: vec![
                rule(TradeField::ExchangeProductId, "Код\nИнструмента"),
                rule(TradeField::ExchangeProductName, "Наименование\nИнструмента"),
                rule(TradeField::DeliveryBasisName, "Базис\nпоставки"),
                rule(TradeField::Volume, "Объем\nДоговоров\nв единицах\nизмерения"),
                rule(TradeField::Total, "Обьем\nДоговоров,\nруб."),
                rule(TradeField::Count, "Количество\nДоговоров,\nшт."),
            ],
        }
    }

    pub fn from_yaml_str(text: &str) -> anyhow::Result<Self> {
        let mapping: ColumnMapping = serde_yaml::from_str(text).context("parsing column mapping")?;
        mapping.validate()?;
        Ok(mapping)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    /// Every trade field must be mapped exactly once.
    pub fn validate(&self) -> anyhow::Result<()> {
        for field in TradeField::ALL {
            let n = self.columns.iter().filter(|c| c.field == field).count();
            anyhow::ensure!(n == 1, "mapping v{} maps {field:?} {n} times", self.version);
        }
        anyhow::ensure!(
            !normalize_label(&self.header_token).is_empty(),
            "mapping v{} has an empty header token",
            self.version
        );
        Ok(())
    }

    fn resolve(&self, header: &[Cell]) -> Result<ColumnIndex, ParseError> {
        let labels = header
            .iter()
            .map(|c| normalize_label(&c.as_text()))
            .collect::<Vec<_>>();
        let mut positions = HashMap::new();
        let mut missing = Vec::new();
        for rule in &self.columns {
            let wanted = normalize_label(&rule.label);
            match labels.iter().position(|l| *l == wanted) {
                Some(idx) => {
                    positions.insert(rule.field, idx);
                }
                None => missing.push(wanted),
            }
        }
        if !missing.is_empty() {
            return Err(ParseError::MissingColumns {
                version: self.version,
                missing,
            });
        }
        Ok(ColumnIndex { positions })
    }
}

impl Default for ColumnMapping {
    fn default() -> Self {
        Self::builtin()
    }
}

#[derive(Debug)]
struct ColumnIndex {
    positions: HashMap<TradeField, usize>,
}

impl ColumnIndex {
    fn cell<'a>(&self, row: &'a [Cell], field: TradeField) -> &'a Cell {
        self.positions
            .get(&field)
            .and_then(|idx| row.get(*idx))
            .unwrap_or(&Cell::Empty)
    }
}

fn normalize_label(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Spreadsheet cell reduced to what normalization needs.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Empty,
    Text(String),
    Number(f64),
}

impl Cell {
    pub fn text(value: impl Into<String>) -> Self {
        Cell::Text(value.into())
    }

    pub fn as_text(&self) -> String {
        match self {
            Cell::Empty => String::new(),
            Cell::Text(s) => s.trim().to_string(),
            Cell::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => format!("{}", *n as i64),
            Cell::Number(n) => n.to_string(),
        }
    }

    /// Numeric value with the `-` "no trades" placeholder read as zero.
    pub fn as_number(&self) -> Option<f64> {
        let value = match self {
            Cell::Empty => return None,
            Cell::Number(n) => *n,
            Cell::Text(s) => {
                let s = s.trim();
                if s == "-" {
                    0.0
                } else {
                    s.parse::<f64>().ok()?
                }
            }
        };
        value.is_finite().then_some(value)
    }
}

impl From<&Data> for Cell {
    fn from(value: &Data) -> Self {
        match value {
            Data::Int(i) => Cell::Number(*i as f64),
            Data::Float(f) => Cell::Number(*f),
            Data::String(s) => Cell::Text(s.clone()),
            Data::Bool(b) => Cell::Text(b.to_string()),
            Data::DateTime(dt) => Cell::Number(dt.as_f64()),
            Data::DateTimeIso(s) | Data::DurationIso(s) => Cell::Text(s.clone()),
            Data::Error(_) | Data::Empty => Cell::Empty,
        }
    }
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("file name {0:?} does not embed a yyyymmdd trade date")]
    BadFileName(String),
    #[error("reading workbook {path}: {message}")]
    Workbook { path: PathBuf, message: String },
    #[error("workbook {0} has no worksheets")]
    NoWorksheet(PathBuf),
    #[error("header row containing {token:?} not found")]
    HeaderNotFound { token: String },
    #[error("column mapping v{version}: labels not found in header: {missing:?}")]
    MissingColumns { version: u32, missing: Vec<String> },
    #[error("spreadsheet task failed: {0}")]
    Task(String),
}

/// What happened to one staged report.
#[derive(Debug)]
pub enum FileOutcome {
    Stored { records: u64 },
    Stale { year: i32 },
    Rejected(ParseError),
    StoreFailed(StoreError),
}

impl FileOutcome {
    pub fn stored(&self) -> bool {
        matches!(self, FileOutcome::Stored { .. })
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, FileOutcome::Stale { .. })
    }
}

/// Year embedded at chars 8..12 of names like `oil_xls_20240301162000.xls`.
pub fn embedded_year(file_name: &str) -> Option<i32> {
    let year = file_name.get(8..12)?;
    if !year.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    year.parse().ok()
}

pub fn trade_date_from_file_name(file_name: &str) -> Result<NaiveDate, ParseError> {
    let bad = || ParseError::BadFileName(file_name.to_string());
    let year = embedded_year(file_name).ok_or_else(bad)?;
    let two_digits = |range: std::ops::Range<usize>| -> Option<u32> {
        let s = file_name.get(range)?;
        if s.bytes().all(|b| b.is_ascii_digit()) {
            s.parse().ok()
        } else {
            None
        }
    };
    let month = two_digits(12..14).ok_or_else(bad)?;
    let day = two_digits(14..16).ok_or_else(bad)?;
    NaiveDate::from_ymd_opt(year, month, day).ok_or_else(bad)
}

/// First worksheet as a grid addressed by absolute sheet row and column.
pub fn read_first_sheet(path: &Path) -> Result<Vec<Vec<Cell>>, ParseError> {
    let workbook_error = |message: String| ParseError::Workbook {
        path: path.to_path_buf(),
        message,
    };
    let mut workbook = open_workbook_auto(path).map_err(|e| workbook_error(e.to_string()))?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| ParseError::NoWorksheet(path.to_path_buf()))?
        .map_err(|e| workbook_error(e.to_string()))?;

    let (first_row, first_col) = range.start().unwrap_or((0, 0));
    let mut grid = vec![Vec::new(); first_row as usize];
    for row in range.rows() {
        let mut cells = vec![Cell::Empty; first_col as usize];
        cells.extend(row.iter().map(Cell::from));
        grid.push(cells);
    }
    Ok(grid)
}

fn is_excluded_code(code: &str) -> bool {
    code.is_empty()
        || code.eq_ignore_ascii_case("nan")
        || AGGREGATE_MARKERS.iter().any(|marker| code.starts_with(marker))
}

/// Locates the header row below the preamble and maps the data rows beneath it.
/// Rows with a non-positive or missing count, aggregate codes, or uncoercible
/// volume/total are dropped.
pub fn normalize_rows(
    grid: &[Vec<Cell>],
    mapping: &ColumnMapping,
    trade_date: NaiveDate,
) -> Result<Vec<TradeRecord>, ParseError> {
    let token = normalize_label(&mapping.header_token);
    let start = PREAMBLE_ROWS.min(grid.len());
    let header_idx = grid[start..]
        .iter()
        .position(|row| {
            row.iter()
                .any(|cell| normalize_label(&cell.as_text()).contains(&token))
        })
        .map(|offset| start + offset)
        .ok_or_else(|| ParseError::HeaderNotFound {
            token: mapping.header_token.clone(),
        })?;
    let columns = mapping.resolve(&grid[header_idx])?;

    let mut records = Vec::new();
    for row in &grid[header_idx + 1..] {
        let Some(count) = columns.cell(row, TradeField::Count).as_number() else {
            continue;
        };
        let count = count.trunc() as i64;
        if count <= 0 {
            continue;
        }

        let code = columns.cell(row, TradeField::ExchangeProductId).as_text();
        if is_excluded_code(&code) {
            continue;
        }

        let (Some(volume), Some(total)) = (
            columns.cell(row, TradeField::Volume).as_number(),
            columns.cell(row, TradeField::Total).as_number(),
        ) else {
            continue;
        };

        records.push(TradeRecord::new(
            code,
            columns.cell(row, TradeField::ExchangeProductName).as_text(),
            columns.cell(row, TradeField::DeliveryBasisName).as_text(),
            volume,
            total.trunc() as i64,
            count,
            trade_date,
        ));
    }
    Ok(records)
}

/// Turns staged daily reports into stored trade records.
#[derive(Debug, Clone)]
pub struct ReportParser {
    mapping: Arc<ColumnMapping>,
    cutoff_year: i32,
}

impl ReportParser {
    pub fn new(mapping: ColumnMapping, cutoff_year: i32) -> Self {
        Self {
            mapping: Arc::new(mapping),
            cutoff_year,
        }
    }

    /// Parses the report, stores its rows in one transaction and removes the
    /// staged file whatever the outcome.
    pub async fn parse_and_store(&self, staged: StagedFile, store: &dyn TradeStore) -> FileOutcome {
        let outcome = self.process(&staged, store).await;
        let file = staged.file_name().to_string();
        let url = staged.source_url().to_string();
        staged.discard().await;

        match &outcome {
            FileOutcome::Stored { records } => info!(file = %file, records, "report stored"),
            FileOutcome::Stale { year } => {
                info!(file = %file, year, cutoff_year = self.cutoff_year, "report predates horizon")
            }
            FileOutcome::Rejected(err) => warn!(file = %file, url = %url, error = %err, "report rejected"),
            FileOutcome::StoreFailed(err) => {
                error!(file = %file, url = %url, error = %err, "storing report failed")
            }
        }
        outcome
    }

    async fn process(&self, staged: &StagedFile, store: &dyn TradeStore) -> FileOutcome {
        let file_name = staged.file_name();
        if let Some(year) = embedded_year(file_name) {
            if year <= self.cutoff_year {
                return FileOutcome::Stale { year };
            }
        }
        let trade_date = match trade_date_from_file_name(file_name) {
            Ok(date) => date,
            Err(err) => return FileOutcome::Rejected(err),
        };
        debug_assert!(trade_date.year() > self.cutoff_year);

        let records = match self.read_records(staged.path(), trade_date).await {
            Ok(records) => records,
            Err(err) => return FileOutcome::Rejected(err),
        };

        match store.insert_batch(&records).await {
            Ok(records) => FileOutcome::Stored { records },
            Err(err) => FileOutcome::StoreFailed(err),
        }
    }

    async fn read_records(&self, path: &Path, trade_date: NaiveDate) -> Result<Vec<TradeRecord>, ParseError> {
        let path = path.to_path_buf();
        let mapping = Arc::clone(&self.mapping);
        tokio::task::spawn_blocking(move || {
            let grid = read_first_sheet(&path)?;
            normalize_rows(&grid, &mapping, trade_date)
        })
        .await
        .map_err(|e| ParseError::Task(e.to_string()))?
    }
}
