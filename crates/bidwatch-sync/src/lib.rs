//! Collection jobs: fetch → diff against prior state → notify → commit → snapshot.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bidwatch_adapters::{
    default_base_filters, FetchOutcome, FixedShaper, FixturePageSource, HttpPageSource, PageSource,
    PaginatedFetcher, QueryPayload, RandomizedShaper, RequestShaper, DEFAULT_ENDPOINT,
    DEFAULT_ORIGIN, DEFAULT_PAGE_SIZE,
};
use bidwatch_core::{
    DetailLinkTemplate, DiffSettings, QueryDefinition, Record, RecordDiff, RecordId,
    BACK_DATE_FIELD, DEFAULT_DETAIL_LINK_TEMPLATE, SALE_DEADLINE_FIELD,
};
use bidwatch_storage::{
    build_http_client, GithubContentsBackend, GithubStateConfig, HttpClientConfig,
    LocalStateBackend, SnapshotStore, StateBackend, StateStore, METADATA_FILE,
};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "bidwatch-sync";

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown task key {key:?} (known: {known})")]
    UnknownTaskKey { key: String, known: String },
    #[error("diff monitoring is not configured: missing {0}")]
    DiffMonitorUnconfigured(String),
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("reading {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing query registry: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("query registry has no queries")]
    Empty,
    #[error("page_size must be positive")]
    ZeroPageSize,
    #[error("duplicate query key {0:?}")]
    DuplicateKey(String),
    #[error("duplicate query name {0:?}")]
    DuplicateName(String),
    #[error("state path {0:?} is shared by more than one monitored query")]
    DuplicateStatePath(String),
    #[error("query name {0:?} cannot be used as a snapshot file name")]
    InvalidName(String),
}

fn default_page_size() -> u32 {
    DEFAULT_PAGE_SIZE
}

/// The monitored datasets. Loaded once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRegistry {
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_base_filters")]
    pub base_filters: Map<String, Value>,
    pub queries: Vec<QueryDefinition>,
}

impl QueryRegistry {
    pub fn builtin() -> Self {
        let query = |key: &str, name: &str, filters: Value, diff: Option<&str>| QueryDefinition {
            key: key.to_string(),
            name: name.to_string(),
            filters: filters.as_object().cloned().unwrap_or_default(),
            diff: diff.map(|state_path| DiffSettings {
                state_path: state_path.to_string(),
            }),
        };
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            base_filters: default_base_filters(),
            queries: vec![
                query("TASK_1", "所有招采", serde_json::json!({}), None),
                query(
                    "TASK_2",
                    "所有招采_正在招标",
                    serde_json::json!({"homePageQueryType": "Bidding"}),
                    None,
                ),
                query(
                    "TASK_3",
                    "所有招采_正在招标_北京",
                    serde_json::json!({"homePageQueryType": "Bidding", "companyType": "BJ"}),
                    Some("task_3_state.json"),
                ),
            ],
        }
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, RegistryError> {
        let registry: Self = serde_yaml::from_str(text)?;
        registry.validate()?;
        Ok(registry)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| RegistryError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn validate(&self) -> Result<(), RegistryError> {
        if self.queries.is_empty() {
            return Err(RegistryError::Empty);
        }
        if self.page_size == 0 {
            return Err(RegistryError::ZeroPageSize);
        }
        let metadata_stem = METADATA_FILE.trim_end_matches(".json");
        let mut keys = HashSet::new();
        let mut names = HashSet::new();
        let mut state_paths = HashSet::new();
        for query in &self.queries {
            if !keys.insert(query.key.as_str()) {
                return Err(RegistryError::DuplicateKey(query.key.clone()));
            }
            if !names.insert(query.name.as_str()) {
                return Err(RegistryError::DuplicateName(query.name.clone()));
            }
            if let Some(diff) = &query.diff {
                if !state_paths.insert(diff.state_path.trim_start_matches("./")) {
                    return Err(RegistryError::DuplicateStatePath(diff.state_path.clone()));
                }
            }
            let name = query.name.trim();
            if name.is_empty()
                || name == metadata_stem
                || name.starts_with('.')
                || query.name.contains(['/', '\\'])
            {
                return Err(RegistryError::InvalidName(query.name.clone()));
            }
        }
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&QueryDefinition> {
        self.queries.iter().find(|q| q.key == key)
    }

    pub fn require(&self, key: &str) -> Result<&QueryDefinition, ConfigError> {
        self.get(key).ok_or_else(|| ConfigError::UnknownTaskKey {
            key: key.to_string(),
            known: self.keys().join(", "),
        })
    }

    pub fn keys(&self) -> Vec<&str> {
        self.queries.iter().map(|q| q.key.as_str()).collect()
    }

    pub fn has_monitored_queries(&self) -> bool {
        self.queries.iter().any(QueryDefinition::is_diff_monitored)
    }

    pub fn payload_for(&self, query: &QueryDefinition) -> QueryPayload {
        QueryPayload::new(&self.base_filters, query, self.page_size)
    }
}

#[derive(Debug, Clone)]
pub enum StateBackendConfig {
    Github(GithubStateConfig),
    LocalDir(PathBuf),
    Unconfigured,
}

#[derive(Debug, Clone)]
pub struct BidwatchConfig {
    pub endpoint: String,
    pub origin: String,
    pub output_dir: PathBuf,
    pub queries_path: Option<PathBuf>,
    pub http_timeout_secs: u64,
    pub page_delay_min_ms: u64,
    pub page_delay_max_ms: u64,
    pub accept_invalid_certs: bool,
    pub timezone: Tz,
    pub replay_fixture: Option<PathBuf>,
    pub allow_empty_results: bool,
    pub push_url: Option<String>,
    pub state_backend: StateBackendConfig,
    pub detail_link_template: String,
    pub run_log_url: Option<String>,
}

impl BidwatchConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Blank values count as unset; CI runners export empty strings for missing secrets.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let number = |key: &str, default: u64| {
            var(key)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(default)
        };
        let flag = |key: &str| {
            var(key)
                .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false)
        };

        let timezone = var("BIDWATCH_TIMEZONE")
            .and_then(|name| match name.trim().parse::<Tz>() {
                Ok(tz) => Some(tz),
                Err(_) => {
                    warn!(timezone = %name, "unknown timezone; falling back to Asia/Shanghai");
                    None
                }
            })
            .unwrap_or(chrono_tz::Asia::Shanghai);

        let token = var("BIDWATCH_GITHUB_TOKEN").or_else(|| var("CLOUDFLARE_WORKER"));
        let state_backend = match (token, var("GITHUB_OWNER"), var("GITHUB_REPO")) {
            (Some(token), Some(owner), Some(repo)) => {
                let mut github = GithubStateConfig::new(owner, repo, token);
                if let Some(api_base) = var("BIDWATCH_GITHUB_API") {
                    github.api_base = api_base;
                }
                github.branch = var("BIDWATCH_STATE_BRANCH");
                StateBackendConfig::Github(github)
            }
            _ => match var("BIDWATCH_STATE_DIR") {
                Some(dir) => StateBackendConfig::LocalDir(PathBuf::from(dir)),
                None => StateBackendConfig::Unconfigured,
            },
        };

        let run_log_url = match (
            var("GITHUB_SERVER_URL"),
            var("GITHUB_REPOSITORY"),
            var("GITHUB_RUN_ID"),
        ) {
            (Some(server), Some(repo), Some(run_id)) => Some(format!(
                "{}/{}/actions/runs/{}",
                server.trim_end_matches('/'),
                repo,
                run_id
            )),
            _ => None,
        };

        Self {
            endpoint: var("BIDWATCH_ENDPOINT").unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
            origin: var("BIDWATCH_ORIGIN").unwrap_or_else(|| DEFAULT_ORIGIN.to_string()),
            output_dir: var("BIDWATCH_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./zgyd")),
            queries_path: var("BIDWATCH_QUERIES").map(PathBuf::from),
            http_timeout_secs: number("BIDWATCH_HTTP_TIMEOUT_SECS", 15),
            page_delay_min_ms: number("BIDWATCH_PAGE_DELAY_MIN_MS", 2000),
            page_delay_max_ms: number("BIDWATCH_PAGE_DELAY_MAX_MS", 5000),
            accept_invalid_certs: flag("BIDWATCH_ACCEPT_INVALID_CERTS"),
            timezone,
            replay_fixture: var("BIDWATCH_REPLAY_FIXTURE").map(PathBuf::from),
            allow_empty_results: flag("BIDWATCH_ALLOW_EMPTY_RESULTS"),
            push_url: var("WECHAT_WEBHOOK_URL"),
            state_backend,
            detail_link_template: var("BIDWATCH_DETAIL_LINK_TEMPLATE")
                .unwrap_or_else(|| DEFAULT_DETAIL_LINK_TEMPLATE.to_string()),
            run_log_url,
        }
    }

    pub fn load_registry(&self) -> Result<QueryRegistry, RegistryError> {
        match &self.queries_path {
            Some(path) => QueryRegistry::load(path),
            None => Ok(QueryRegistry::builtin()),
        }
    }

    /// Client settings for the upstream portal only.
    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs.max(1)),
            user_agent: None,
            accept_invalid_certs: self.accept_invalid_certs,
        }
    }

    /// Client settings for requests carrying credentials (state backend, push
    /// channel). Certificates are always verified here.
    pub fn credentialed_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            accept_invalid_certs: false,
            ..self.http_client_config()
        }
    }
}

/// Set difference by record identity. Records without an id never take part.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiffEngine;

impl DiffEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn diff(&self, current: &[Record], prior: &[Record]) -> RecordDiff {
        let (current_order, current_by_id) = index_by_id(current);
        let (prior_order, prior_by_id) = index_by_id(prior);

        let added = current_order
            .iter()
            .filter(|id| !prior_by_id.contains_key(*id))
            .map(|id| current_by_id[id].clone())
            .collect();
        let removed = prior_order
            .iter()
            .filter(|id| !current_by_id.contains_key(*id))
            .map(|id| prior_by_id[id].clone())
            .collect();

        RecordDiff { added, removed }
    }
}

/// First-seen id order plus id → record, where a repeated id keeps its last record.
fn index_by_id(records: &[Record]) -> (Vec<RecordId>, HashMap<RecordId, &Record>) {
    let mut order = Vec::new();
    let mut by_id = HashMap::new();
    for record in records {
        if let Some(id) = record.id() {
            if by_id.insert(id.clone(), record).is_none() {
                order.push(id);
            }
        }
    }
    (order, by_id)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub title: String,
    pub body: String,
}

#[derive(Debug, Clone, Default)]
pub struct ReportFormatter {
    link_template: DetailLinkTemplate,
    run_log_url: Option<String>,
}

impl ReportFormatter {
    pub fn new(link_template: DetailLinkTemplate, run_log_url: Option<String>) -> Self {
        Self {
            link_template,
            run_log_url,
        }
    }

    /// Markdown change report: header with counts, then one block per record.
    pub fn render(&self, query_name: &str, diff: &RecordDiff, generated_at: &str) -> Report {
        let title = format!("{query_name} change report");
        let mut body = format!(
            "## {title}\n**Time:** {generated_at}\n**Changes:** {} ({} added, {} removed)\n\n",
            diff.total_changes(),
            diff.added.len(),
            diff.removed.len()
        );

        if !diff.added.is_empty() {
            body.push_str(&format!("### Added ({})\n", diff.added.len()));
            for record in &diff.added {
                body.push_str(&self.record_block(record, true));
            }
        }
        if !diff.removed.is_empty() {
            body.push_str(&format!("### Removed ({})\n", diff.removed.len()));
            for record in &diff.removed {
                body.push_str(&self.record_block(record, false));
            }
        }
        if let Some(url) = &self.run_log_url {
            body.push_str(&format!("\n---\n[Full run log]({url})\n"));
        }

        Report { title, body }
    }

    fn record_block(&self, record: &Record, with_link: bool) -> String {
        let mut lines = vec![
            format!("> - **Title:** {}", record.name().unwrap_or("N/A")),
            format!("> - **Published:** {}", record.publish_date().unwrap_or("N/A")),
        ];
        for (label, field) in [("Sale deadline", SALE_DEADLINE_FIELD), ("Return deadline", BACK_DATE_FIELD)] {
            if let Some(value) = record.text(field).filter(|v| !v.trim().is_empty()) {
                lines.push(format!("> - **{label}:** {value}"));
            }
        }
        if with_link {
            lines.push(format!(
                "> - **Link:** [details]({})",
                self.link_template.render(record)
            ));
        }
        format!("{}\n\n", lines.join("\n"))
    }
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("push request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("push endpoint returned http status {0}")]
    HttpStatus(u16),
    #[error("push endpoint rejected the message (code {code}): {message}")]
    Rejected { code: i64, message: String },
    #[error("push endpoint returned an unreadable body: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait PushChannel: Send + Sync {
    fn name(&self) -> &'static str;

    async fn push(&self, title: &str, markdown: &str) -> Result<(), DeliveryError>;
}

/// Server Chan (WeChat) push: form POST of `title` + `desp`, success iff `code == 0`.
#[derive(Debug, Clone)]
pub struct ServerChanChannel {
    client: reqwest::Client,
    url: String,
}

#[derive(Debug, Deserialize)]
struct PushResponse {
    code: Option<i64>,
    #[serde(default)]
    message: Option<String>,
}

impl ServerChanChannel {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl PushChannel for ServerChanChannel {
    fn name(&self) -> &'static str {
        "server-chan"
    }

    async fn push(&self, title: &str, markdown: &str) -> Result<(), DeliveryError> {
        let resp = self
            .client
            .post(&self.url)
            .timeout(Duration::from_secs(10))
            .form(&[("title", title), ("desp", markdown)])
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(DeliveryError::HttpStatus(status.as_u16()));
        }
        let text = resp.text().await?;
        let parsed: PushResponse =
            serde_json::from_str(&text).map_err(|e| DeliveryError::Malformed(e.to_string()))?;
        match parsed.code {
            Some(0) => Ok(()),
            Some(code) => Err(DeliveryError::Rejected {
                code,
                message: parsed.message.unwrap_or_default(),
            }),
            None => Err(DeliveryError::Malformed("response without code".to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum NotifyOutcome {
    Delivered,
    Skipped,
    Failed(String),
}

/// Best-effort delivery: at most one attempt, failures are logged and returned,
/// never raised.
#[derive(Clone, Default)]
pub struct Notifier {
    channel: Option<Arc<dyn PushChannel>>,
    formatter: ReportFormatter,
}

impl Notifier {
    pub fn new(channel: Option<Arc<dyn PushChannel>>, formatter: ReportFormatter) -> Self {
        Self { channel, formatter }
    }

    pub fn is_configured(&self) -> bool {
        self.channel.is_some()
    }

    pub async fn notify(&self, query_name: &str, diff: &RecordDiff, generated_at: &str) -> NotifyOutcome {
        let Some(channel) = &self.channel else {
            info!(query = query_name, "push endpoint not configured; skipping notification");
            return NotifyOutcome::Skipped;
        };
        let report = self.formatter.render(query_name, diff, generated_at);
        match channel.push(&report.title, &report.body).await {
            Ok(()) => {
                info!(query = query_name, channel = channel.name(), "change report delivered");
                NotifyOutcome::Delivered
            }
            Err(err) => {
                warn!(query = query_name, channel = channel.name(), error = %err, "change report delivery failed");
                NotifyOutcome::Failed(err.to_string())
            }
        }
    }
}

/// Everything the diff branch needs: somewhere durable for prior state and a
/// way to announce changes.
#[derive(Clone)]
pub struct DiffMonitor {
    backend: Arc<dyn StateBackend>,
    notifier: Notifier,
}

impl DiffMonitor {
    pub fn new(backend: Arc<dyn StateBackend>, notifier: Notifier) -> Self {
        Self { backend, notifier }
    }

    pub fn from_config(config: &BidwatchConfig, client: reqwest::Client) -> Result<Self, ConfigError> {
        let backend: Option<Arc<dyn StateBackend>> = match &config.state_backend {
            StateBackendConfig::Github(github) => {
                Some(Arc::new(GithubContentsBackend::new(client.clone(), github.clone())))
            }
            StateBackendConfig::LocalDir(dir) => Some(Arc::new(LocalStateBackend::new(dir.clone()))),
            StateBackendConfig::Unconfigured => None,
        };

        let (backend, push_url) = match (backend, &config.push_url) {
            (Some(backend), Some(url)) => (backend, url.clone()),
            (None, Some(_)) => {
                return Err(ConfigError::DiffMonitorUnconfigured(
                    "a state backend (GitHub credentials or BIDWATCH_STATE_DIR)".to_string(),
                ))
            }
            (Some(_), None) => {
                return Err(ConfigError::DiffMonitorUnconfigured("WECHAT_WEBHOOK_URL".to_string()))
            }
            (None, None) => {
                return Err(ConfigError::DiffMonitorUnconfigured(
                    "WECHAT_WEBHOOK_URL and a state backend".to_string(),
                ))
            }
        };

        let formatter = ReportFormatter::new(
            DetailLinkTemplate::new(config.detail_link_template.clone()),
            config.run_log_url.clone(),
        );
        let channel: Arc<dyn PushChannel> = Arc::new(ServerChanChannel::new(client, push_url));
        Ok(Self::new(backend, Notifier::new(Some(channel), formatter)))
    }

    pub fn state_store(&self, settings: &DiffSettings) -> StateStore {
        StateStore::new(self.backend.clone(), settings.state_path.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStage {
    Start,
    Fetching,
    FetchOk,
    FetchFailed,
    Aborted,
    Diffing,
    DiffEmpty,
    DiffNonempty,
    DiffSkipped,
    Notify,
    WriteState,
    WriteSnapshot,
    WriteMetadata,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Done,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DiffSummary {
    pub added: usize,
    pub removed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub run_id: Uuid,
    pub query_key: String,
    pub query_name: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: JobStatus,
    pub stages: Vec<JobStage>,
    pub records: usize,
    pub pages_requested: u32,
    pub diff: Option<DiffSummary>,
    pub notify: Option<NotifyOutcome>,
    pub snapshot_hash: Option<String>,
    pub errors: Vec<String>,
}

impl JobReport {
    fn start(query: &QueryDefinition) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            query_key: query.key.clone(),
            query_name: query.name.clone(),
            started_at: now,
            finished_at: now,
            status: JobStatus::Aborted,
            stages: vec![JobStage::Start],
            records: 0,
            pages_requested: 0,
            diff: None,
            notify: None,
            snapshot_hash: None,
            errors: Vec::new(),
        }
    }

    pub fn visited(&self, stage: JobStage) -> bool {
        self.stages.contains(&stage)
    }

    pub fn is_done(&self) -> bool {
        self.status == JobStatus::Done
    }

    fn finish(mut self, status: JobStatus) -> Self {
        self.stages.push(match status {
            JobStatus::Done => JobStage::Done,
            JobStatus::Aborted => JobStage::Aborted,
        });
        self.status = status;
        self.finished_at = Utc::now();
        self
    }
}

/// Runs one collection job per query, sequentially, never letting one job's
/// failure stop the next.
pub struct JobRunner {
    registry: QueryRegistry,
    fetcher: PaginatedFetcher,
    snapshots: SnapshotStore,
    monitor: Option<DiffMonitor>,
    diff_engine: DiffEngine,
    timezone: Tz,
    allow_empty_results: bool,
}

impl JobRunner {
    pub fn new(
        registry: QueryRegistry,
        fetcher: PaginatedFetcher,
        snapshots: SnapshotStore,
        timezone: Tz,
    ) -> Self {
        Self {
            registry,
            fetcher,
            snapshots,
            monitor: None,
            diff_engine: DiffEngine::new(),
            timezone,
            allow_empty_results: false,
        }
    }

    pub fn with_monitor(mut self, monitor: DiffMonitor) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn allow_empty_results(mut self, allow: bool) -> Self {
        self.allow_empty_results = allow;
        self
    }

    pub fn from_config(config: &BidwatchConfig, registry: QueryRegistry) -> anyhow::Result<Self> {
        let upstream = build_http_client(&config.http_client_config())?;

        let (source, shaper): (Arc<dyn PageSource>, Arc<dyn RequestShaper>) =
            match &config.replay_fixture {
                Some(path) => (
                    Arc::new(FixturePageSource::load(path).context("loading replay fixture")?),
                    Arc::new(FixedShaper::immediate()),
                ),
                None => (
                    Arc::new(HttpPageSource::new(upstream, config.endpoint.clone())),
                    Arc::new(RandomizedShaper::new(
                        config.origin.clone(),
                        Duration::from_millis(config.page_delay_min_ms),
                        Duration::from_millis(config.page_delay_max_ms),
                    )),
                ),
            };

        let credentialed = build_http_client(&config.credentialed_client_config())?;
        let monitor = match DiffMonitor::from_config(config, credentialed) {
            Ok(monitor) => Some(monitor),
            Err(err) => {
                if registry.has_monitored_queries() {
                    warn!(error = %err, "change notifications disabled; snapshots are still written");
                }
                None
            }
        };

        let mut runner = Self::new(
            registry,
            PaginatedFetcher::new(source, shaper),
            SnapshotStore::new(config.output_dir.clone()),
            config.timezone,
        )
        .allow_empty_results(config.allow_empty_results);
        if let Some(monitor) = monitor {
            runner = runner.with_monitor(monitor);
        }
        Ok(runner)
    }

    pub fn registry(&self) -> &QueryRegistry {
        &self.registry
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    pub async fn run_key(&self, key: &str) -> Result<JobReport, ConfigError> {
        let query = self.registry.require(key)?;
        Ok(self.run_job(query).await)
    }

    /// Every key is validated before any job starts.
    pub async fn run_keys(&self, keys: &[String]) -> Result<Vec<JobReport>, ConfigError> {
        let queries = keys
            .iter()
            .map(|key| self.registry.require(key))
            .collect::<Result<Vec<_>, _>>()?;
        let mut reports = Vec::with_capacity(queries.len());
        for query in queries {
            reports.push(self.run_job(query).await);
        }
        Ok(reports)
    }

    pub async fn run_all(&self) -> Vec<JobReport> {
        let mut reports = Vec::with_capacity(self.registry.queries.len());
        for query in &self.registry.queries {
            reports.push(self.run_job(query).await);
        }
        reports
    }

    pub async fn run_job(&self, query: &QueryDefinition) -> JobReport {
        let report = JobReport::start(query);
        let span = info_span!("query_job", run_id = %report.run_id, query = %query.key);
        self.run_job_inner(query, report).instrument(span).await
    }

    async fn run_job_inner(&self, query: &QueryDefinition, mut report: JobReport) -> JobReport {
        info!(name = %query.name, source = %self.fetcher.describe(), "starting collection");
        report.stages.push(JobStage::Fetching);

        let outcome = self
            .fetcher
            .fetch_all(&query.name, &self.registry.payload_for(query))
            .await;
        report.pages_requested = outcome.pages_requested();

        let records = match outcome {
            FetchOutcome::Complete { records, .. } if records.is_empty() && !self.allow_empty_results => {
                warn!("fetch returned no records; treating as failed, nothing written");
                report.errors.push("empty result rejected".to_string());
                report.stages.push(JobStage::FetchFailed);
                return report.finish(JobStatus::Aborted);
            }
            FetchOutcome::Complete { records, .. } => records,
            FetchOutcome::Failed { partial, error, .. } => {
                warn!(partial = partial.len(), %error, "fetch failed; nothing written");
                report.errors.push(error.to_string());
                report.stages.push(JobStage::FetchFailed);
                return report.finish(JobStatus::Aborted);
            }
        };
        report.stages.push(JobStage::FetchOk);
        report.records = records.len();

        let stamp = Utc::now()
            .with_timezone(&self.timezone)
            .format(TIMESTAMP_FORMAT)
            .to_string();

        if let Some(settings) = &query.diff {
            self.run_diff_branch(query, settings, &records, &stamp, &mut report)
                .await;
        }

        report.stages.push(JobStage::WriteSnapshot);
        match self.snapshots.write_snapshot(&query.name, &records).await {
            Ok(stored) => {
                info!(
                    path = %stored.path.display(),
                    records = stored.record_count,
                    content_hash = %stored.content_hash,
                    "snapshot written"
                );
                report.snapshot_hash = Some(stored.content_hash);
                report.stages.push(JobStage::WriteMetadata);
                if let Err(err) = self.snapshots.record_collection(&query.name, &stamp).await {
                    error!(error = %format!("{err:#}"), "metadata write failed");
                    report.errors.push(format!("{err:#}"));
                }
            }
            Err(err) => {
                error!(error = %format!("{err:#}"), "snapshot write failed; metadata left untouched");
                report.errors.push(format!("{err:#}"));
            }
        }

        info!(records = report.records, errors = report.errors.len(), "collection finished");
        report.finish(JobStatus::Done)
    }

    async fn run_diff_branch(
        &self,
        query: &QueryDefinition,
        settings: &DiffSettings,
        records: &[Record],
        stamp: &str,
        report: &mut JobReport,
    ) {
        let Some(monitor) = &self.monitor else {
            warn!("diff monitoring not configured; skipping notify and state commit");
            report.errors.push(
                ConfigError::DiffMonitorUnconfigured("push endpoint or state backend".to_string())
                    .to_string(),
            );
            report.stages.push(JobStage::DiffSkipped);
            return;
        };

        report.stages.push(JobStage::Diffing);
        let state = monitor.state_store(settings);
        let prior = match state.read().await {
            Ok(Some(prior)) => prior,
            Ok(None) => {
                info!(state = %state.describe(), "no prior state; treating as first run");
                Vec::new()
            }
            Err(err) => {
                warn!(state = %state.describe(), error = %err, "prior state unavailable; skipping diff this cycle");
                report.errors.push(err.to_string());
                report.stages.push(JobStage::DiffSkipped);
                return;
            }
        };

        let diff = self.diff_engine.diff(records, &prior);
        report.diff = Some(DiffSummary {
            added: diff.added.len(),
            removed: diff.removed.len(),
        });
        if diff.is_empty() {
            info!("no changes against prior state");
            report.stages.push(JobStage::DiffEmpty);
            return;
        }

        info!(added = diff.added.len(), removed = diff.removed.len(), "changes detected");
        report.stages.push(JobStage::DiffNonempty);
        report.stages.push(JobStage::Notify);
        report.notify = Some(monitor.notifier.notify(&query.name, &diff, stamp).await);

        report.stages.push(JobStage::WriteState);
        let message = format!("[scheduler] update {} state: {}", query.key, stamp);
        match state.commit(records, &message).await {
            Ok(()) => info!(state = %state.describe(), "prior state committed"),
            Err(err) => {
                error!(state = %state.describe(), error = %err, "prior state commit failed");
                report.errors.push(err.to_string());
            }
        }
    }
}
