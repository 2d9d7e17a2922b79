//! Axum + Askama dashboard over the collected snapshots. Read-only.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use askama::Template;
use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use bidwatch_core::{
    QueryDefinition, Record, BACK_DATE_FIELD, NAME_FIELD, PUBLISH_DATE_FIELD, REGION_FIELD,
    SALE_DEADLINE_FIELD,
};
use bidwatch_storage::SnapshotStore;
use bidwatch_sync::{BidwatchConfig, QueryRegistry, TIMESTAMP_FORMAT};
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Timelike};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpListener;
use tracing::info;

pub const CRATE_NAME: &str = "bidwatch-web";

/// Notices published before this date are historical noise and kept out of
/// every chart and the table.
pub const HISTORY_CUTOFF: &str = "2024-01-01";

pub const WEEKDAYS: [&str; 7] = [
    "Monday",
    "Tuesday",
    "Wednesday",
    "Thursday",
    "Friday",
    "Saturday",
    "Sunday",
];

const INDEX_TABLE_LIMIT: usize = 200;

const DATE_TIME_FORMATS: &[&str] = &[
    TIMESTAMP_FORMAT,
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y/%m/%d %H:%M:%S",
    "%Y/%m/%d %H:%M",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%Y%m%d"];

// Fewer digits than this is a compact date, not an epoch.
const MIN_EPOCH_DIGITS: usize = 10;

/// Parses the publish-date shapes upstream has been seen to send: local
/// date-time strings, bare dates (including compact `YYYYMMDD`), and epoch
/// seconds or milliseconds.
pub fn parse_publish_date(value: &Value, timezone: Tz) -> Option<NaiveDateTime> {
    match value {
        Value::String(text) => {
            let text = text.trim();
            if text.len() >= MIN_EPOCH_DIGITS && text.chars().all(|c| c.is_ascii_digit()) {
                return text.parse().ok().and_then(|n| from_epoch(n, timezone));
            }
            DATE_TIME_FORMATS
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
                .or_else(|| {
                    DATE_FORMATS
                        .iter()
                        .find_map(|fmt| NaiveDate::parse_from_str(text, fmt).ok())
                        .and_then(|date| date.and_hms_opt(0, 0, 0))
                })
        }
        Value::Number(n) => n.as_i64().and_then(|n| from_epoch(n, timezone)),
        _ => None,
    }
}

fn from_epoch(n: i64, timezone: Tz) -> Option<NaiveDateTime> {
    // Anything past year 5138 in seconds is really milliseconds.
    let utc = if n.abs() >= 100_000_000_000 {
        DateTime::from_timestamp_millis(n)?
    } else {
        DateTime::from_timestamp(n, 0)?
    };
    Some(utc.with_timezone(&timezone).naive_local())
}

fn history_cutoff() -> Option<NaiveDateTime> {
    NaiveDate::parse_from_str(HISTORY_CUTOFF, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

/// Splits records into the ones worth showing and a count of historical ones.
/// Records without a parseable date are kept; they only drop out of the charts.
fn current_records(records: &[Record], timezone: Tz) -> (Vec<(&Record, Option<NaiveDateTime>)>, usize) {
    let cutoff = history_cutoff();
    let mut kept = Vec::with_capacity(records.len());
    let mut historical = 0;
    for record in records {
        let published = record
            .get(PUBLISH_DATE_FIELD)
            .and_then(|v| parse_publish_date(v, timezone));
        match (published, cutoff) {
            (Some(at), Some(cutoff)) if at < cutoff => historical += 1,
            _ => kept.push((record, published)),
        }
    }
    (kept, historical)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DailyCount {
    pub date: String,
    pub weekday: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Analytics {
    pub total: usize,
    pub historical_filtered: usize,
    pub undated: usize,
    pub daily: Vec<DailyCount>,
    /// Index is the hour of day.
    pub hourly: Vec<usize>,
    /// Rows Monday..Sunday, columns hour 0..23, zero-filled.
    pub heatmap: Vec<Vec<usize>>,
}

impl Analytics {
    pub fn compute(records: &[Record], timezone: Tz) -> Self {
        let (kept, historical_filtered) = current_records(records, timezone);
        let mut daily = BTreeMap::<NaiveDate, usize>::new();
        let mut hourly = vec![0usize; 24];
        let mut heatmap = vec![vec![0usize; 24]; 7];
        let mut undated = 0;

        for (_, published) in &kept {
            let Some(at) = published else {
                undated += 1;
                continue;
            };
            *daily.entry(at.date()).or_default() += 1;
            let hour = at.hour() as usize;
            hourly[hour] += 1;
            heatmap[at.weekday().num_days_from_monday() as usize][hour] += 1;
        }

        Self {
            total: records.len(),
            historical_filtered,
            undated,
            daily: daily
                .into_iter()
                .map(|(date, count)| DailyCount {
                    date: date.format("%Y-%m-%d").to_string(),
                    weekday: WEEKDAYS[date.weekday().num_days_from_monday() as usize].to_string(),
                    count,
                })
                .collect(),
            hourly,
            heatmap,
        }
    }

    /// Plotly figures for the three charts, keyed by chart name.
    pub fn to_plotly(&self, dataset_name: &str) -> Value {
        let dates = self.daily.iter().map(|d| d.date.clone()).collect::<Vec<_>>();
        let counts = self.daily.iter().map(|d| d.count).collect::<Vec<_>>();
        let weekdays = self.daily.iter().map(|d| d.weekday.clone()).collect::<Vec<_>>();
        let hours = (0..24).collect::<Vec<_>>();
        serde_json::json!({
            "daily": {
                "data": [{
                    "type": "bar",
                    "x": dates,
                    "y": counts,
                    "text": weekdays,
                    "marker": {"color": "#0ea5e9"}
                }],
                "layout": {"title": format!("{dataset_name}: notices per day")}
            },
            "hourly": {
                "data": [{
                    "type": "bar",
                    "x": hours,
                    "y": self.hourly,
                    "marker": {"color": "#6366f1"}
                }],
                "layout": {"title": "Publish hour", "xaxis": {"dtick": 1}}
            },
            "heatmap": {
                "data": [{
                    "type": "heatmap",
                    "z": self.heatmap,
                    "x": hours,
                    "y": WEEKDAYS,
                    "colorscale": "Blues"
                }],
                "layout": {"title": "Hour × weekday"}
            }
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortColumn {
    #[default]
    #[serde(alias = "publishDate")]
    PublishDate,
    #[serde(alias = "companyTypeName")]
    Region,
    Name,
    #[serde(alias = "tenderSaleDeadline")]
    SaleDeadline,
    #[serde(alias = "backDate")]
    BackDate,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TableQuery {
    pub sort: Option<SortColumn>,
    pub order: Option<SortOrder>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableRow {
    pub publish_date: String,
    pub region: String,
    pub name: String,
    pub sale_deadline: String,
    pub back_date: String,
    #[serde(skip)]
    published_at: Option<NaiveDateTime>,
}

impl TableRow {
    fn from_record(record: &Record, published_at: Option<NaiveDateTime>) -> Self {
        let text = |field: &str| record.text(field).unwrap_or_default();
        Self {
            publish_date: published_at
                .map(|at| at.format(TIMESTAMP_FORMAT).to_string())
                .unwrap_or_else(|| text(PUBLISH_DATE_FIELD)),
            region: text(REGION_FIELD),
            name: text(NAME_FIELD),
            sale_deadline: text(SALE_DEADLINE_FIELD),
            back_date: text(BACK_DATE_FIELD),
            published_at,
        }
    }

    fn compare(&self, other: &Self, column: SortColumn) -> Ordering {
        match column {
            SortColumn::PublishDate => self
                .published_at
                .cmp(&other.published_at)
                .then_with(|| self.publish_date.cmp(&other.publish_date)),
            SortColumn::Region => self.region.cmp(&other.region),
            SortColumn::Name => self.name.cmp(&other.name),
            SortColumn::SaleDeadline => self.sale_deadline.cmp(&other.sale_deadline),
            SortColumn::BackDate => self.back_date.cmp(&other.back_date),
        }
    }
}

pub fn table_rows(records: &[Record], timezone: Tz, column: SortColumn, order: SortOrder) -> Vec<TableRow> {
    let (kept, _) = current_records(records, timezone);
    let mut rows = kept
        .into_iter()
        .map(|(record, published)| TableRow::from_record(record, published))
        .collect::<Vec<_>>();
    rows.sort_by(|a, b| match order {
        SortOrder::Asc => a.compare(b, column),
        SortOrder::Desc => b.compare(a, column),
    });
    rows
}

#[derive(Debug, Clone, Serialize)]
pub struct DatasetSummary {
    pub key: String,
    pub name: String,
    pub diff_monitored: bool,
    pub collected_at: Option<String>,
    pub record_count: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct Dataset {
    pub query: QueryDefinition,
    pub collected_at: Option<String>,
    /// `None` until the first successful collection.
    pub records: Option<Vec<Record>>,
}

impl Dataset {
    fn summary(&self) -> DatasetSummary {
        DatasetSummary {
            key: self.query.key.clone(),
            name: self.query.name.clone(),
            diff_monitored: self.query.is_diff_monitored(),
            collected_at: self.collected_at.clone(),
            record_count: self.records.as_ref().map(Vec::len),
        }
    }

    fn records(&self) -> &[Record] {
        self.records.as_deref().unwrap_or_default()
    }
}

/// Loads snapshots and the metadata map for the registry's queries.
#[derive(Debug, Clone)]
pub struct DashboardReader {
    snapshots: SnapshotStore,
    registry: QueryRegistry,
    timezone: Tz,
}

impl DashboardReader {
    pub fn new(output_dir: impl Into<PathBuf>, registry: QueryRegistry) -> Self {
        Self {
            snapshots: SnapshotStore::new(output_dir),
            registry,
            timezone: chrono_tz::Asia::Shanghai,
        }
    }

    pub fn with_timezone(mut self, timezone: Tz) -> Self {
        self.timezone = timezone;
        self
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    pub async fn datasets(&self) -> Vec<Dataset> {
        let metadata = self.snapshots.read_metadata().await;
        let mut out = Vec::with_capacity(self.registry.queries.len());
        for query in &self.registry.queries {
            out.push(Dataset {
                collected_at: metadata.get(&query.name).cloned(),
                records: self.snapshots.read_snapshot(&query.name).await,
                query: query.clone(),
            });
        }
        out
    }

    pub async fn dataset(&self, key: &str) -> Option<Dataset> {
        let query = self.registry.get(key)?.clone();
        let metadata = self.snapshots.read_metadata().await;
        Some(Dataset {
            collected_at: metadata.get(&query.name).cloned(),
            records: self.snapshots.read_snapshot(&query.name).await,
            query,
        })
    }
}

#[derive(Clone)]
pub struct AppState {
    pub reader: DashboardReader,
}

impl AppState {
    pub fn new(reader: DashboardReader) -> Self {
        Self { reader }
    }
}

#[derive(Debug, Clone)]
struct DatasetCard {
    key: String,
    name: String,
    collected_at: String,
    record_count: String,
    selected: bool,
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    datasets: Vec<DatasetCard>,
    has_selection: bool,
    selected_key: String,
    selected_name: String,
    collected_at: String,
    total: usize,
    historical_filtered: usize,
    shown_rows: usize,
    rows: Vec<TableRow>,
}

#[derive(Debug, Deserialize, Default)]
struct IndexQuery {
    dataset: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/datasets", get(datasets_handler))
        .route("/datasets/{key}", get(dataset_handler))
        .route("/datasets/{key}/chart", get(chart_handler))
        .route("/datasets/{key}/table", get(table_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = BidwatchConfig::from_env();
    let registry = config.load_registry()?;
    let port: u16 = std::env::var("BIDWATCH_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let reader = DashboardReader::new(config.output_dir.clone(), registry).with_timezone(config.timezone);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, output_dir = %config.output_dir.display(), "dashboard listening");
    axum::serve(listener, app(AppState::new(reader))).await?;
    Ok(())
}

async fn index_handler(State(state): State<Arc<AppState>>, Query(query): Query<IndexQuery>) -> Response {
    let datasets = state.reader.datasets().await;
    let selected = match &query.dataset {
        Some(key) => datasets.iter().find(|d| &d.query.key == key),
        None => datasets.iter().find(|d| d.records.is_some()),
    };

    let cards = datasets
        .iter()
        .map(|d| DatasetCard {
            key: d.query.key.clone(),
            name: d.query.name.clone(),
            collected_at: d.collected_at.clone().unwrap_or_else(|| "never".to_string()),
            record_count: d
                .records
                .as_ref()
                .map(|r| r.len().to_string())
                .unwrap_or_else(|| "n/a".to_string()),
            selected: selected.is_some_and(|s| s.query.key == d.query.key),
        })
        .collect();

    let tpl = match selected {
        Some(dataset) => {
            let timezone = state.reader.timezone();
            let analytics = Analytics::compute(dataset.records(), timezone);
            let rows = table_rows(dataset.records(), timezone, SortColumn::default(), SortOrder::default());
            IndexTemplate {
                datasets: cards,
                has_selection: true,
                selected_key: dataset.query.key.clone(),
                selected_name: dataset.query.name.clone(),
                collected_at: dataset.collected_at.clone().unwrap_or_else(|| "never".to_string()),
                total: analytics.total,
                historical_filtered: analytics.historical_filtered,
                shown_rows: rows.len(),
                rows: rows.into_iter().take(INDEX_TABLE_LIMIT).collect(),
            }
        }
        None => IndexTemplate {
            datasets: cards,
            has_selection: false,
            selected_key: String::new(),
            selected_name: String::new(),
            collected_at: String::new(),
            total: 0,
            historical_filtered: 0,
            shown_rows: 0,
            rows: vec![],
        },
    };
    render_html(tpl)
}

async fn datasets_handler(State(state): State<Arc<AppState>>) -> Response {
    let summaries = state
        .reader
        .datasets()
        .await
        .iter()
        .map(Dataset::summary)
        .collect::<Vec<_>>();
    Json(summaries).into_response()
}

async fn dataset_handler(State(state): State<Arc<AppState>>, AxumPath(key): AxumPath<String>) -> Response {
    let Some(dataset) = state.reader.dataset(&key).await else {
        return not_found(&key);
    };
    let analytics = Analytics::compute(dataset.records(), state.reader.timezone());
    Json(serde_json::json!({
        "dataset": dataset.summary(),
        "analytics": analytics,
    }))
    .into_response()
}

async fn chart_handler(State(state): State<Arc<AppState>>, AxumPath(key): AxumPath<String>) -> Response {
    let Some(dataset) = state.reader.dataset(&key).await else {
        return not_found(&key);
    };
    let analytics = Analytics::compute(dataset.records(), state.reader.timezone());
    Json(analytics.to_plotly(&dataset.query.name)).into_response()
}

async fn table_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(key): AxumPath<String>,
    Query(query): Query<TableQuery>,
) -> Response {
    let Some(dataset) = state.reader.dataset(&key).await else {
        return not_found(&key);
    };
    let rows = table_rows(
        dataset.records(),
        state.reader.timezone(),
        query.sort.unwrap_or_default(),
        query.order.unwrap_or_default(),
    );
    Json(rows).into_response()
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn not_found(key: &str) -> Response {
    (StatusCode::NOT_FOUND, Html(format!("Unknown dataset {key}"))).into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {}", err)),
    )
        .into_response()
}
