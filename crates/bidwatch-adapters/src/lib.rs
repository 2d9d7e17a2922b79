//! Upstream procurement endpoint: page payloads, request shaping and pagination.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bidwatch_core::{QueryDefinition, Record, ResultSet};
use bidwatch_storage::FetchError;
use rand::seq::SliceRandom;
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE, ORIGIN, REFERER, USER_AGENT};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "bidwatch-adapters";

pub const DEFAULT_ENDPOINT: &str =
    "https://b2b.10086.cn/api-b2b/api-sync-es/white_list_api/b2b/publish/queryList";
pub const DEFAULT_ORIGIN: &str = "https://b2b.10086.cn";
pub const DEFAULT_PAGE_SIZE: u32 = 100;

pub const PAGE_SIZE_FIELD: &str = "size";
pub const PAGE_NUMBER_FIELD: &str = "current";

pub const BROWSER_USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/18.6 Safari/605.1.15",
    "Mozilla/5.0 (Windows NT 6.1; WOW64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/39.0.2171.95 Safari/537.36 OPR/26.0.1656.60",
    "Mozilla/5.0 (Windows NT 6.1; WOW64; Trident/7.0; rv:11.0) like Gecko",
    "Mozilla/5.0 (compatible; MSIE 9.0; Windows Phone OS 7.5; Trident/5.0; IEMobile/9.0; HTC; Titan)",
    "MQQBrowser/26 Mozilla/5.0 (Linux; U; Android 2.3.7; zh-cn; MB200 Build/GRJ22; CyanogenMod-7) AppleWebKit/533.1 (KHTML, like Gecko) Version/4.0 Mobile Safari/533.1",
    "Mozilla/5.0 (Windows NT 6.1; WOW64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/38.0.2125.122 UBrowser/4.0.3214.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
];

/// Filters every query request carries unless a query overrides them.
pub fn default_base_filters() -> Map<String, Value> {
    let mut base = Map::new();
    base.insert("companyType".into(), Value::from(""));
    base.insert("name".into(), Value::from(""));
    base.insert("publishType".into(), Value::from("PROCUREMENT"));
    base.insert("publishOneType".into(), Value::from("PROCUREMENT"));
    base.insert("homePageQueryType".into(), Value::from(""));
    base.insert("sfactApplColumn5".into(), Value::from("PC"));
    base
}

/// Request body for one query, minus the page number.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryPayload {
    fields: Map<String, Value>,
    page_size: u32,
}

impl QueryPayload {
    pub fn new(base_filters: &Map<String, Value>, query: &QueryDefinition, page_size: u32) -> Self {
        let page_size = page_size.max(1);
        let mut fields = base_filters.clone();
        for (key, value) in &query.filters {
            fields.insert(key.clone(), value.clone());
        }
        fields.insert(PAGE_SIZE_FIELD.into(), Value::from(page_size));
        Self { fields, page_size }
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn for_page(&self, page: u32) -> Value {
        let mut fields = self.fields.clone();
        fields.insert(PAGE_NUMBER_FIELD.into(), Value::from(page));
        Value::Object(fields)
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    data: Option<EnvelopeData>,
}

#[derive(Debug, Deserialize)]
struct EnvelopeData {
    #[serde(default)]
    content: Option<Vec<Record>>,
}

/// Extract `data.content` from a response body. A missing `data` or `content`
/// reads as an empty page; anything that does not parse is malformed.
pub fn parse_page(url: &str, body: &[u8]) -> Result<Vec<Record>, FetchError> {
    let envelope: Envelope = serde_json::from_slice(body).map_err(|e| FetchError::Malformed {
        url: url.to_string(),
        detail: e.to_string(),
    })?;
    Ok(envelope
        .data
        .and_then(|d| d.content)
        .unwrap_or_default())
}

/// Per-request variation: headers to send and how long to wait before the next page.
pub trait RequestShaper: Send + Sync {
    fn next_headers(&self) -> HeaderMap;
    fn next_delay(&self) -> Duration;
}

fn base_headers(origin: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("application/json, text/plain, */*"));
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if let Ok(value) = HeaderValue::from_str(origin) {
        headers.insert(ORIGIN, value);
    }
    if let Ok(value) = HeaderValue::from_str(&format!("{}/", origin.trim_end_matches('/'))) {
        headers.insert(REFERER, value);
    }
    headers
}

#[derive(Debug, Clone)]
pub struct RandomizedShaper {
    origin: String,
    user_agents: Vec<String>,
    min_delay: Duration,
    max_delay: Duration,
}

impl RandomizedShaper {
    pub fn new(origin: impl Into<String>, min_delay: Duration, max_delay: Duration) -> Self {
        Self {
            origin: origin.into(),
            user_agents: BROWSER_USER_AGENTS.iter().map(ToString::to_string).collect(),
            min_delay,
            max_delay,
        }
    }

    pub fn with_user_agents(mut self, user_agents: Vec<String>) -> Self {
        self.user_agents = user_agents;
        self
    }
}

impl RequestShaper for RandomizedShaper {
    fn next_headers(&self) -> HeaderMap {
        let mut headers = base_headers(&self.origin);
        let user_agent = self.user_agents.choose(&mut rand::thread_rng());
        if let Some(value) = user_agent.and_then(|ua| HeaderValue::from_str(ua).ok()) {
            headers.insert(USER_AGENT, value);
        }
        headers
    }

    fn next_delay(&self) -> Duration {
        if self.max_delay <= self.min_delay {
            return self.min_delay;
        }
        rand::thread_rng().gen_range(self.min_delay..=self.max_delay)
    }
}

/// Deterministic shaping for replays and tests.
#[derive(Debug, Clone)]
pub struct FixedShaper {
    headers: HeaderMap,
    delay: Duration,
}

impl FixedShaper {
    pub fn new(headers: HeaderMap, delay: Duration) -> Self {
        Self { headers, delay }
    }

    pub fn immediate() -> Self {
        Self::new(base_headers(DEFAULT_ORIGIN), Duration::ZERO)
    }
}

impl RequestShaper for FixedShaper {
    fn next_headers(&self) -> HeaderMap {
        self.headers.clone()
    }

    fn next_delay(&self) -> Duration {
        self.delay
    }
}

#[async_trait]
pub trait PageSource: Send + Sync {
    fn describe(&self) -> String;

    async fn fetch_page(&self, payload: &Value, headers: HeaderMap) -> Result<Vec<Record>, FetchError>;
}

/// POSTs page requests to the live query endpoint.
#[derive(Debug, Clone)]
pub struct HttpPageSource {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpPageSource {
    pub fn new(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl PageSource for HttpPageSource {
    fn describe(&self) -> String {
        self.endpoint.clone()
    }

    async fn fetch_page(&self, payload: &Value, headers: HeaderMap) -> Result<Vec<Record>, FetchError> {
        let transport = |source| FetchError::Transport {
            url: self.endpoint.clone(),
            source,
        };
        let resp = self
            .client
            .post(&self.endpoint)
            .headers(headers)
            .json(payload)
            .send()
            .await
            .map_err(transport)?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: self.endpoint.clone(),
            });
        }

        let body = resp.bytes().await.map_err(transport)?;
        parse_page(&self.endpoint, &body)
    }
}

/// Serves captured pages from memory; page `n` of the request maps to index `n - 1`.
#[derive(Debug, Default)]
pub struct FixturePageSource {
    label: String,
    pages: Vec<Vec<Record>>,
    fail_on_page: Option<u32>,
    requested: Mutex<Vec<u32>>,
}

impl FixturePageSource {
    pub fn from_pages(pages: Vec<Vec<Record>>) -> Self {
        Self {
            label: "fixture://memory".to_string(),
            pages,
            ..Default::default()
        }
    }

    /// Load a JSON array of pages, each page an array of records.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let pages: Vec<Vec<Record>> =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Self {
            label: format!("fixture://{}", path.display()),
            pages,
            ..Default::default()
        })
    }

    pub fn failing_on_page(mut self, page: u32) -> Self {
        self.fail_on_page = Some(page);
        self
    }

    pub fn requested_pages(&self) -> Vec<u32> {
        self.requested
            .lock()
            .map(|pages| pages.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl PageSource for FixturePageSource {
    fn describe(&self) -> String {
        self.label.clone()
    }

    async fn fetch_page(&self, payload: &Value, _headers: HeaderMap) -> Result<Vec<Record>, FetchError> {
        let page = payload
            .get(PAGE_NUMBER_FIELD)
            .and_then(Value::as_u64)
            .and_then(|p| u32::try_from(p).ok())
            .ok_or_else(|| FetchError::Malformed {
                url: self.label.clone(),
                detail: "request without a page number".to_string(),
            })?;
        if let Ok(mut requested) = self.requested.lock() {
            requested.push(page);
        }
        if self.fail_on_page == Some(page) {
            return Err(FetchError::HttpStatus {
                status: 503,
                url: self.label.clone(),
            });
        }
        let index = page.saturating_sub(1) as usize;
        Ok(self.pages.get(index).cloned().unwrap_or_default())
    }
}

#[derive(Debug)]
pub enum FetchOutcome {
    Complete {
        records: ResultSet,
        pages_requested: u32,
    },
    /// Whatever arrived before the failing page. Never to be persisted.
    Failed {
        partial: ResultSet,
        pages_requested: u32,
        error: FetchError,
    },
}

impl FetchOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, FetchOutcome::Complete { .. })
    }

    pub fn records(&self) -> &[Record] {
        match self {
            FetchOutcome::Complete { records, .. } => records,
            FetchOutcome::Failed { partial, .. } => partial,
        }
    }

    pub fn pages_requested(&self) -> u32 {
        match self {
            FetchOutcome::Complete { pages_requested, .. }
            | FetchOutcome::Failed { pages_requested, .. } => *pages_requested,
        }
    }
}

/// Walks pages sequentially from page 1 until an empty page, a short page or
/// the first failure. There is no retry: a failed page fails the whole fetch.
#[derive(Clone)]
pub struct PaginatedFetcher {
    source: Arc<dyn PageSource>,
    shaper: Arc<dyn RequestShaper>,
}

impl PaginatedFetcher {
    pub fn new(source: Arc<dyn PageSource>, shaper: Arc<dyn RequestShaper>) -> Self {
        Self { source, shaper }
    }

    pub fn describe(&self) -> String {
        self.source.describe()
    }

    pub async fn fetch_all(&self, query_name: &str, payload: &QueryPayload) -> FetchOutcome {
        let page_size = payload.page_size() as usize;
        let mut records = Vec::new();
        let mut page = 1u32;

        loop {
            let span = info_span!("fetch_page", query = query_name, page);
            let result = self
                .source
                .fetch_page(&payload.for_page(page), self.shaper.next_headers())
                .instrument(span)
                .await;

            let batch = match result {
                Ok(batch) => batch,
                Err(error) => {
                    warn!(query = query_name, page, kind = ?error.kind(), %error, "page request failed; aborting fetch");
                    return FetchOutcome::Failed {
                        partial: records,
                        pages_requested: page,
                        error,
                    };
                }
            };

            let count = batch.len();
            if count == 0 {
                info!(query = query_name, page, total = records.len(), "empty page; fetch complete");
                break;
            }
            records.extend(batch);
            if count < page_size {
                info!(query = query_name, page, total = records.len(), "short page; fetch complete");
                break;
            }

            page += 1;
            tokio::time::sleep(self.shaper.next_delay()).await;
        }

        FetchOutcome::Complete {
            records,
            pages_requested: page,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn page(start: usize, len: usize) -> Vec<Record> {
        (start..start + len)
            .map(|i| Record::from_value(json!({"publishId": i.to_string(), "name": format!("notice {i}")})).unwrap())
            .collect()
    }

    fn pages(sizes: &[usize]) -> Vec<Vec<Record>> {
        let mut start = 0;
        sizes
            .iter()
            .map(|&n| {
                let p = page(start, n);
                start += n;
                p
            })
            .collect()
    }

    fn query(filters: Value) -> QueryDefinition {
        QueryDefinition {
            key: "TASK_3".into(),
            name: "bj".into(),
            filters: filters.as_object().cloned().unwrap_or_default(),
            diff: None,
        }
    }

    fn fetcher(source: Arc<FixturePageSource>) -> PaginatedFetcher {
        PaginatedFetcher::new(source, Arc::new(FixedShaper::immediate()))
    }

    fn payload() -> QueryPayload {
        QueryPayload::new(&default_base_filters(), &query(json!({})), 100)
    }

    #[tokio::test]
    async fn short_last_page_stops_without_extra_request() {
        let source = Arc::new(FixturePageSource::from_pages(pages(&[100, 100, 47])));
        let outcome = fetcher(source.clone()).fetch_all("bj", &payload()).await;

        assert!(outcome.is_success());
        assert_eq!(outcome.records().len(), 247);
        assert_eq!(outcome.pages_requested(), 3);
        assert_eq!(source.requested_pages(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn empty_page_terminates_and_is_discarded() {
        let source = Arc::new(FixturePageSource::from_pages(pages(&[100, 100, 100, 0])));
        let outcome = fetcher(source.clone()).fetch_all("bj", &payload()).await;

        assert!(outcome.is_success());
        assert_eq!(outcome.records().len(), 300);
        assert_eq!(source.requested_pages(), vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn failure_mid_fetch_reports_partial_records() {
        let source = Arc::new(
            FixturePageSource::from_pages(pages(&[100, 100, 100, 100, 10])).failing_on_page(2),
        );
        let outcome = fetcher(source.clone()).fetch_all("bj", &payload()).await;

        match outcome {
            FetchOutcome::Failed {
                partial,
                pages_requested,
                error,
            } => {
                assert_eq!(partial.len(), 100);
                assert_eq!(pages_requested, 2);
                assert!(matches!(error, FetchError::HttpStatus { status: 503, .. }));
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(source.requested_pages(), vec![1, 2]);
    }

    #[tokio::test]
    async fn first_page_empty_is_a_clean_empty_result() {
        let source = Arc::new(FixturePageSource::from_pages(vec![]));
        let outcome = fetcher(source).fetch_all("bj", &payload()).await;
        assert!(outcome.is_success());
        assert!(outcome.records().is_empty());
        assert_eq!(outcome.pages_requested(), 1);
    }

    #[test]
    fn payload_merges_query_filters_over_base() {
        let q = query(json!({"homePageQueryType": "Bidding", "companyType": "BJ"}));
        let payload = QueryPayload::new(&default_base_filters(), &q, 100);
        let body = payload.for_page(3);

        assert_eq!(body["size"], json!(100));
        assert_eq!(body["current"], json!(3));
        assert_eq!(body["homePageQueryType"], json!("Bidding"));
        assert_eq!(body["companyType"], json!("BJ"));
        assert_eq!(body["publishType"], json!("PROCUREMENT"));
        assert_eq!(body["sfactApplColumn5"], json!("PC"));
    }

    #[test]
    fn zero_page_size_is_clamped() {
        let payload = QueryPayload::new(&Map::new(), &query(json!({})), 0);
        assert_eq!(payload.page_size(), 1);
    }

    #[test]
    fn envelope_parsing_distinguishes_empty_from_malformed() {
        let ok = parse_page("u", br#"{"data": {"content": [{"publishId": "1"}]}}"#).unwrap();
        assert_eq!(ok.len(), 1);

        assert!(parse_page("u", br#"{"code": 0}"#).unwrap().is_empty());
        assert!(parse_page("u", br#"{"data": {"content": null}}"#).unwrap().is_empty());

        let bad_bodies: [&[u8]; 3] = [
            b"<html>busy</html>",
            br#"{"data": {"content": "x"}}"#,
            br#"{"data": {"content": [1]}}"#,
        ];
        for bad in bad_bodies {
            let err = parse_page("u", bad).unwrap_err();
            assert_eq!(err.kind(), bidwatch_storage::FetchErrorKind::MalformedResponse);
        }
    }

    #[test]
    fn randomized_shaper_stays_within_bounds() {
        let shaper = RandomizedShaper::new(
            DEFAULT_ORIGIN,
            Duration::from_millis(2000),
            Duration::from_millis(5000),
        );
        for _ in 0..50 {
            let delay = shaper.next_delay();
            assert!(delay >= Duration::from_millis(2000) && delay <= Duration::from_millis(5000));
        }
        let headers = shaper.next_headers();
        let ua = headers.get(USER_AGENT).unwrap().to_str().unwrap();
        assert!(BROWSER_USER_AGENTS.contains(&ua));
        assert_eq!(headers.get(REFERER).unwrap(), "https://b2b.10086.cn/");
        assert_eq!(headers.get(ORIGIN).unwrap(), "https://b2b.10086.cn");
    }

    #[test]
    fn degenerate_delay_range_returns_minimum() {
        let shaper = RandomizedShaper::new(DEFAULT_ORIGIN, Duration::from_secs(3), Duration::from_secs(1));
        assert_eq!(shaper.next_delay(), Duration::from_secs(3));
    }

    #[test]
    fn fixture_pages_load_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pages.json");
        std::fs::write(&path, serde_json::to_vec(&pages(&[2, 1])).unwrap()).unwrap();
        let source = FixturePageSource::load(&path).unwrap();
        assert!(source.describe().starts_with("fixture://"));
        assert_eq!(source.pages.len(), 2);
    }
}
