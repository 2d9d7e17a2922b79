use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bidwatch_adapters::{FixedShaper, FixturePageSource, PaginatedFetcher};
use bidwatch_core::{DetailLinkTemplate, Record};
use bidwatch_storage::{LocalStateBackend, SnapshotStore, StateBackend, StateError};
use bidwatch_sync::{
    BidwatchConfig, DeliveryError, DiffMonitor, JobRunner, JobStage, JobStatus, Notifier,
    NotifyOutcome, PushChannel, QueryRegistry, ReportFormatter,
};
use serde_json::json;
use tempfile::tempdir;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const BJ_KEY: &str = "TASK_3";
const BJ_NAME: &str = "所有招采_正在招标_北京";
const STATE_FILE: &str = "task_3_state.json";

#[derive(Default)]
struct RecordingChannel {
    sent: Mutex<Vec<(String, String)>>,
    reject: bool,
}

impl RecordingChannel {
    fn rejecting() -> Self {
        Self {
            reject: true,
            ..Default::default()
        }
    }

    fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl PushChannel for RecordingChannel {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn push(&self, title: &str, markdown: &str) -> Result<(), DeliveryError> {
        self.sent
            .lock()
            .unwrap()
            .push((title.to_string(), markdown.to_string()));
        if self.reject {
            return Err(DeliveryError::Rejected {
                code: 40001,
                message: "bad key".to_string(),
            });
        }
        Ok(())
    }
}

struct UnreachableBackend;

#[async_trait]
impl StateBackend for UnreachableBackend {
    fn describe(&self) -> String {
        "unreachable://".to_string()
    }

    async fn get(&self, _path: &str) -> Result<Option<Vec<u8>>, StateError> {
        Err(StateError::Malformed("connection reset".to_string()))
    }

    async fn put(&self, _path: &str, _contents: &[u8], _message: &str) -> Result<(), StateError> {
        panic!("state must not be written when it could not be read");
    }
}

fn record(id: &str) -> Record {
    Record::from_value(json!({
        "publishId": id,
        "publishUuid": format!("uuid-{id}"),
        "publishType": "PROCUREMENT",
        "publishOneType": "PROCUREMENT",
        "name": format!("采购公告 {id}"),
        "publishDate": "2025-06-01 10:00:00",
    }))
    .unwrap()
}

fn page(ids: &[&str]) -> Vec<Record> {
    ids.iter().map(|id| record(id)).collect()
}

fn small_registry(page_size: u32) -> QueryRegistry {
    let mut registry = QueryRegistry::builtin();
    registry.page_size = page_size;
    registry
}

fn runner(
    output: &Path,
    registry: QueryRegistry,
    source: Arc<FixturePageSource>,
) -> JobRunner {
    JobRunner::new(
        registry,
        PaginatedFetcher::new(source, Arc::new(FixedShaper::immediate())),
        SnapshotStore::new(output),
        chrono_tz::Asia::Shanghai,
    )
}

fn monitor(state: Arc<dyn StateBackend>, channel: Arc<RecordingChannel>) -> DiffMonitor {
    let notifier = Notifier::new(
        Some(channel),
        ReportFormatter::new(DetailLinkTemplate::default(), None),
    );
    DiffMonitor::new(state, notifier)
}

async fn seed_state(dir: &Path, ids: &[&str]) {
    let bytes = serde_json::to_vec_pretty(&page(ids)).unwrap();
    tokio::fs::write(dir.join(STATE_FILE), bytes).await.unwrap();
}

async fn state_ids(dir: &Path) -> Vec<String> {
    let bytes = tokio::fs::read(dir.join(STATE_FILE)).await.unwrap();
    let records: Vec<Record> = serde_json::from_slice(&bytes).unwrap();
    records
        .iter()
        .map(|r| r.id().unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn failed_page_aborts_without_any_write_or_push() {
    let output = tempdir().unwrap();
    let state_dir = tempdir().unwrap();
    seed_state(state_dir.path(), &["old"]).await;

    let source = Arc::new(
        FixturePageSource::from_pages(vec![
            page(&["a", "b"]),
            page(&["c", "d"]),
            page(&["e", "f"]),
            page(&["g", "h"]),
            page(&["i"]),
        ])
        .failing_on_page(2),
    );
    let channel = Arc::new(RecordingChannel::default());
    let runner = runner(output.path(), small_registry(2), source.clone()).with_monitor(monitor(
        Arc::new(LocalStateBackend::new(state_dir.path())),
        channel.clone(),
    ));

    let report = runner.run_key(BJ_KEY).await.unwrap();

    assert_eq!(report.status, JobStatus::Aborted);
    assert!(report.visited(JobStage::FetchFailed));
    assert!(!report.visited(JobStage::Diffing));
    assert_eq!(source.requested_pages(), vec![1, 2]);
    assert!(channel.sent().is_empty());
    assert_eq!(state_ids(state_dir.path()).await, vec!["old"]);
    assert!(!output.path().join(format!("{BJ_NAME}.json")).exists());
    assert!(!output.path().join("metadata.json").exists());
}

#[tokio::test]
async fn first_run_reports_everything_as_added_and_commits_state() {
    let output = tempdir().unwrap();
    let state_dir = tempdir().unwrap();
    let source = Arc::new(FixturePageSource::from_pages(vec![
        page(&["1", "2"]),
        page(&["3"]),
    ]));
    let channel = Arc::new(RecordingChannel::default());
    let runner = runner(output.path(), small_registry(2), source).with_monitor(monitor(
        Arc::new(LocalStateBackend::new(state_dir.path())),
        channel.clone(),
    ));

    let report = runner.run_key(BJ_KEY).await.unwrap();

    assert!(report.is_done());
    assert_eq!(report.records, 3);
    assert_eq!(report.pages_requested, 2);
    assert_eq!(report.diff.map(|d| (d.added, d.removed)), Some((3, 0)));
    assert_eq!(report.notify, Some(NotifyOutcome::Delivered));
    let order: Vec<JobStage> = report
        .stages
        .iter()
        .copied()
        .filter(|s| {
            matches!(
                s,
                JobStage::Notify
                    | JobStage::WriteState
                    | JobStage::WriteSnapshot
                    | JobStage::WriteMetadata
            )
        })
        .collect();
    assert_eq!(
        order,
        vec![
            JobStage::Notify,
            JobStage::WriteState,
            JobStage::WriteSnapshot,
            JobStage::WriteMetadata
        ]
    );

    let sent = channel.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, format!("{BJ_NAME} change report"));
    assert!(sent[0].1.contains("### Added (3)"));
    assert_eq!(state_ids(state_dir.path()).await, vec!["1", "2", "3"]);

    let snapshot = runner.snapshots().read_snapshot(BJ_NAME).await.unwrap();
    assert_eq!(snapshot.len(), 3);
    let metadata = runner.snapshots().read_metadata().await;
    assert!(metadata.contains_key(BJ_NAME));
}

#[tokio::test]
async fn unchanged_result_leaves_state_untouched_and_stays_silent() {
    let output = tempdir().unwrap();
    let state_dir = tempdir().unwrap();
    seed_state(state_dir.path(), &["1", "2"]).await;
    let state_before = tokio::fs::read(state_dir.path().join(STATE_FILE)).await.unwrap();

    let source = Arc::new(FixturePageSource::from_pages(vec![page(&["2", "1"])]));
    let channel = Arc::new(RecordingChannel::default());
    let runner = runner(output.path(), small_registry(100), source).with_monitor(monitor(
        Arc::new(LocalStateBackend::new(state_dir.path())),
        channel.clone(),
    ));

    let report = runner.run_key(BJ_KEY).await.unwrap();

    assert!(report.is_done());
    assert!(report.visited(JobStage::DiffEmpty));
    assert!(!report.visited(JobStage::Notify));
    assert!(!report.visited(JobStage::WriteState));
    assert!(report.visited(JobStage::WriteSnapshot));
    assert!(report.visited(JobStage::WriteMetadata));
    assert!(channel.sent().is_empty());
    let state_after = tokio::fs::read(state_dir.path().join(STATE_FILE)).await.unwrap();
    assert_eq!(state_before, state_after);
    assert!(output.path().join(format!("{BJ_NAME}.json")).exists());
}

#[tokio::test]
async fn changes_push_once_and_rerun_is_quiet() {
    let output = tempdir().unwrap();
    let state_dir = tempdir().unwrap();
    seed_state(state_dir.path(), &["1", "2"]).await;

    let source = Arc::new(FixturePageSource::from_pages(vec![page(&["2", "3"])]));
    let channel = Arc::new(RecordingChannel::default());
    let runner = runner(output.path(), small_registry(100), source).with_monitor(monitor(
        Arc::new(LocalStateBackend::new(state_dir.path())),
        channel.clone(),
    ));

    let first = runner.run_key(BJ_KEY).await.unwrap();
    assert_eq!(first.diff.map(|d| (d.added, d.removed)), Some((1, 1)));
    let sent = channel.sent();
    assert_eq!(sent.len(), 1);
    let body = &sent[0].1;
    assert!(body.contains("采购公告 3"));
    assert!(body.contains("publishId=3&publishUuid=uuid-3"));
    assert!(body.contains("### Removed (1)"));
    assert_eq!(state_ids(state_dir.path()).await, vec!["2", "3"]);

    let second = runner.run_key(BJ_KEY).await.unwrap();
    assert!(second.visited(JobStage::DiffEmpty));
    assert_eq!(channel.sent().len(), 1);
}

#[tokio::test]
async fn delivery_failure_still_commits_state() {
    let output = tempdir().unwrap();
    let state_dir = tempdir().unwrap();
    let source = Arc::new(FixturePageSource::from_pages(vec![page(&["9"])]));
    let channel = Arc::new(RecordingChannel::rejecting());
    let runner = runner(output.path(), small_registry(100), source).with_monitor(monitor(
        Arc::new(LocalStateBackend::new(state_dir.path())),
        channel.clone(),
    ));

    let report = runner.run_key(BJ_KEY).await.unwrap();

    assert!(report.is_done());
    assert!(matches!(report.notify, Some(NotifyOutcome::Failed(_))));
    assert_eq!(state_ids(state_dir.path()).await, vec!["9"]);
}

#[tokio::test]
async fn unreadable_state_skips_the_diff_branch_for_this_cycle() {
    let output = tempdir().unwrap();
    let source = Arc::new(FixturePageSource::from_pages(vec![page(&["1"])]));
    let channel = Arc::new(RecordingChannel::default());
    let runner = runner(output.path(), small_registry(100), source)
        .with_monitor(monitor(Arc::new(UnreachableBackend), channel.clone()));

    let report = runner.run_key(BJ_KEY).await.unwrap();

    assert!(report.is_done());
    assert!(report.visited(JobStage::DiffSkipped));
    assert!(channel.sent().is_empty());
    assert!(report.visited(JobStage::WriteSnapshot));
}

#[tokio::test]
async fn unmonitored_query_only_writes_snapshot_and_metadata() {
    let output = tempdir().unwrap();
    let state_dir = tempdir().unwrap();
    let source = Arc::new(FixturePageSource::from_pages(vec![page(&["1", "2"])]));
    let channel = Arc::new(RecordingChannel::default());
    let runner = runner(output.path(), small_registry(100), source).with_monitor(monitor(
        Arc::new(LocalStateBackend::new(state_dir.path())),
        channel.clone(),
    ));

    let report = runner.run_key("TASK_2").await.unwrap();

    assert!(report.is_done());
    assert!(report.diff.is_none());
    assert!(!report.visited(JobStage::Diffing));
    assert!(channel.sent().is_empty());
    assert!(!state_dir.path().join(STATE_FILE).exists());
    assert!(output.path().join("所有招采_正在招标.json").exists());
}

#[tokio::test]
async fn missing_monitor_still_writes_the_snapshot() {
    let output = tempdir().unwrap();
    let source = Arc::new(FixturePageSource::from_pages(vec![page(&["1"])]));
    let runner = runner(output.path(), small_registry(100), source);

    let report = runner.run_key(BJ_KEY).await.unwrap();

    assert!(report.is_done());
    assert!(report.visited(JobStage::DiffSkipped));
    assert_eq!(report.errors.len(), 1);
    assert!(output.path().join(format!("{BJ_NAME}.json")).exists());
}

#[tokio::test]
async fn empty_result_is_rejected_unless_allowed() {
    let output = tempdir().unwrap();
    let source = Arc::new(FixturePageSource::from_pages(vec![]));
    let strict = runner(output.path(), small_registry(100), source.clone());

    let report = strict.run_key("TASK_1").await.unwrap();
    assert_eq!(report.status, JobStatus::Aborted);
    assert!(!output.path().join("所有招采.json").exists());

    let lenient = runner(output.path(), small_registry(100), source).allow_empty_results(true);
    let report = lenient.run_key("TASK_1").await.unwrap();
    assert!(report.is_done());
    let snapshot = lenient.snapshots().read_snapshot("所有招采").await.unwrap();
    assert!(snapshot.is_empty());
}

#[tokio::test]
async fn metadata_accumulates_one_entry_per_query() {
    let output = tempdir().unwrap();
    let source = Arc::new(FixturePageSource::from_pages(vec![page(&["1"])]));
    let runner = runner(output.path(), small_registry(100), source);

    let reports = runner.run_all().await;

    assert_eq!(reports.len(), 3);
    let metadata = runner.snapshots().read_metadata().await;
    let keys: Vec<&str> = metadata.keys().map(String::as_str).collect();
    assert_eq!(keys.len(), 3);
    for name in ["所有招采", "所有招采_正在招标", BJ_NAME] {
        let stamp = &metadata[name];
        assert_eq!(stamp.len(), "2025-06-01 10:00:00".len(), "bad stamp {stamp}");
    }
}

#[tokio::test]
async fn unknown_key_fails_before_any_job_runs() {
    let output = tempdir().unwrap();
    let source = Arc::new(FixturePageSource::from_pages(vec![page(&["1"])]));
    let runner = runner(output.path(), small_registry(100), source.clone());

    let err = runner
        .run_keys(&["TASK_1".to_string(), "TASK_404".to_string()])
        .await
        .unwrap_err();

    assert!(err.to_string().contains("TASK_404"));
    assert!(source.requested_pages().is_empty());
    assert!(!output.path().join("metadata.json").exists());
}

fn bundled_fixture() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/bidding-bj/pages.json")
}

fn config_from(vars: &[(&str, String)]) -> BidwatchConfig {
    let vars: HashMap<String, String> = vars
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect();
    BidwatchConfig::from_lookup(|k| vars.get(k).cloned())
}

#[tokio::test]
async fn replay_without_push_url_writes_snapshot_and_skips_diff() {
    let output = tempdir().unwrap();
    let state_dir = tempdir().unwrap();
    let config = config_from(&[
        ("BIDWATCH_REPLAY_FIXTURE", bundled_fixture().display().to_string()),
        ("BIDWATCH_OUTPUT_DIR", output.path().display().to_string()),
        ("BIDWATCH_STATE_DIR", state_dir.path().display().to_string()),
    ]);
    let runner = JobRunner::from_config(&config, config.load_registry().unwrap()).unwrap();

    let report = runner.run_key(BJ_KEY).await.unwrap();

    assert!(report.is_done());
    assert_eq!(report.records, 6);
    assert!(report.visited(JobStage::DiffSkipped));
    assert!(!report.visited(JobStage::Diffing));
    assert!(!state_dir.path().join(STATE_FILE).exists());
    let snapshot = runner.snapshots().read_snapshot(BJ_NAME).await.unwrap();
    assert_eq!(snapshot.len(), 6);
    assert!(runner.snapshots().read_metadata().await.contains_key(BJ_NAME));
}

#[tokio::test]
async fn replay_with_push_url_and_state_dir_notifies_and_commits() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/SCT-test.send"))
        .and(body_string_contains("desp="))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"code": 0})))
        .expect(1)
        .mount(&server)
        .await;

    let output = tempdir().unwrap();
    let state_dir = tempdir().unwrap();
    let config = config_from(&[
        ("BIDWATCH_REPLAY_FIXTURE", bundled_fixture().display().to_string()),
        ("BIDWATCH_OUTPUT_DIR", output.path().display().to_string()),
        ("BIDWATCH_STATE_DIR", state_dir.path().display().to_string()),
        ("WECHAT_WEBHOOK_URL", format!("{}/SCT-test.send", server.uri())),
    ]);
    let runner = JobRunner::from_config(&config, config.load_registry().unwrap()).unwrap();

    let report = runner.run_key(BJ_KEY).await.unwrap();

    assert!(report.is_done());
    assert_eq!(report.diff.map(|d| (d.added, d.removed)), Some((6, 0)));
    assert_eq!(report.notify, Some(NotifyOutcome::Delivered));
    assert_eq!(state_ids(state_dir.path()).await.len(), 6);
}
