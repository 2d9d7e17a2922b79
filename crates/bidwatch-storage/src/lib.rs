//! Snapshot, metadata and prior-state persistence + HTTP client utilities for bidwatch.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bidwatch_core::{Record, ResultSet};
use reqwest::header::{ACCEPT, AUTHORIZATION, USER_AGENT};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "bidwatch-storage";

pub const METADATA_FILE: &str = "metadata.json";

/// Query display name → last successful collection time.
pub type MetadataMap = BTreeMap<String, String>;

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// The procurement portal has served broken certificate chains before.
    pub accept_invalid_certs: bool,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            user_agent: None,
            accept_invalid_certs: false,
        }
    }
}

pub fn build_http_client(config: &HttpClientConfig) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .gzip(true)
        .brotli(true)
        .timeout(config.timeout);

    if let Some(user_agent) = &config.user_agent {
        builder = builder.user_agent(user_agent.clone());
    }
    if config.accept_invalid_certs {
        builder = builder.danger_accept_invalid_certs(true);
    }

    builder.build().context("building reqwest client")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    TransientNetwork,
    MalformedResponse,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("malformed response from {url}: {detail}")]
    Malformed { url: String, detail: String },
}

impl FetchError {
    pub fn kind(&self) -> FetchErrorKind {
        match self {
            FetchError::Transport { .. } | FetchError::HttpStatus { .. } => {
                FetchErrorKind::TransientNetwork
            }
            FetchError::Malformed { .. } => FetchErrorKind::MalformedResponse,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, FetchError::Transport { source, .. } if source.is_timeout())
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Pretty JSON with a 4-space indent; non-ASCII text is written as-is.
pub fn to_pretty_json<T: Serialize + ?Sized>(value: &T) -> serde_json::Result<Vec<u8>> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
    value.serialize(&mut ser)?;
    Ok(buf)
}

/// Replace `path` wholesale via a sibling temp file and rename, so readers never
/// observe a half-written document.
pub async fn write_atomically(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent).await?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await?;
    let written = async {
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await
    }
    .await;
    drop(file);

    if let Err(err) = written {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err);
    }

    match fs::rename(&temp_path, path).await {
        Ok(()) => Ok(()),
        Err(err) => {
            let _ = fs::remove_file(&temp_path).await;
            Err(err)
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoredSnapshot {
    pub path: PathBuf,
    pub content_hash: String,
    pub record_count: usize,
    pub byte_size: usize,
}

/// Latest full result per query plus the collection-time metadata map, laid out
/// as `{output_dir}/{query name}.json` and `{output_dir}/metadata.json`.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn snapshot_path(&self, query_name: &str) -> PathBuf {
        self.root.join(format!("{query_name}.json"))
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.root.join(METADATA_FILE)
    }

    pub async fn write_snapshot(
        &self,
        query_name: &str,
        records: &[Record],
    ) -> anyhow::Result<StoredSnapshot> {
        let path = self.snapshot_path(query_name);
        let bytes = to_pretty_json(records)
            .with_context(|| format!("serializing snapshot for {query_name}"))?;
        write_atomically(&path, &bytes)
            .await
            .with_context(|| format!("writing snapshot {}", path.display()))?;

        Ok(StoredSnapshot {
            content_hash: sha256_hex(&bytes),
            record_count: records.len(),
            byte_size: bytes.len(),
            path,
        })
    }

    /// Last written result, or `None` when the file is missing or unreadable.
    pub async fn read_snapshot(&self, query_name: &str) -> Option<ResultSet> {
        read_json_or_absent(&self.snapshot_path(query_name)).await
    }

    pub async fn read_metadata(&self) -> MetadataMap {
        read_json_or_absent(&self.metadata_path())
            .await
            .unwrap_or_default()
    }

    pub async fn write_metadata(&self, metadata: &MetadataMap) -> anyhow::Result<()> {
        let path = self.metadata_path();
        let bytes = to_pretty_json(metadata).context("serializing metadata")?;
        write_atomically(&path, &bytes)
            .await
            .with_context(|| format!("writing metadata {}", path.display()))
    }

    /// Read-modify-write of a single metadata entry. Concurrent writers race;
    /// the last one wins.
    pub async fn record_collection(
        &self,
        query_name: &str,
        collected_at: &str,
    ) -> anyhow::Result<MetadataMap> {
        let mut metadata = self.read_metadata().await;
        metadata.insert(query_name.to_string(), collected_at.to_string());
        self.write_metadata(&metadata).await?;
        Ok(metadata)
    }
}

async fn read_json_or_absent<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "unreadable document treated as absent");
            return None;
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "corrupt document treated as absent");
            None
        }
    }
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state path {0:?} is not a relative path inside the store")]
    InvalidPath(String),
    #[error("state io on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("state request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("state backend returned http status {status} for {url}: {body}")]
    HttpStatus {
        status: u16,
        url: String,
        body: String,
    },
    #[error("state backend returned an unexpected payload: {0}")]
    Malformed(String),
    #[error("serializing state: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Key-by-path document store whose writes outlive the process.
#[async_trait]
pub trait StateBackend: Send + Sync {
    fn describe(&self) -> String;

    /// `Ok(None)` when nothing is stored at `path`.
    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>, StateError>;

    /// Create or replace the document at `path`.
    async fn put(&self, path: &str, contents: &[u8], message: &str) -> Result<(), StateError>;
}

/// State kept in a local directory, for runners with a persistent disk.
#[derive(Debug, Clone)]
pub struct LocalStateBackend {
    root: PathBuf,
}

impl LocalStateBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, StateError> {
        let rel = Path::new(path);
        let clean = !path.is_empty()
            && rel
                .components()
                .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !clean {
            return Err(StateError::InvalidPath(path.to_string()));
        }
        Ok(self.root.join(rel))
    }
}

#[async_trait]
impl StateBackend for LocalStateBackend {
    fn describe(&self) -> String {
        format!("local:{}", self.root.display())
    }

    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>, StateError> {
        let full = self.resolve(path)?;
        match fs::read(&full).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StateError::Io {
                path: full.display().to_string(),
                source,
            }),
        }
    }

    async fn put(&self, path: &str, contents: &[u8], message: &str) -> Result<(), StateError> {
        let full = self.resolve(path)?;
        write_atomically(&full, contents)
            .await
            .map_err(|source| StateError::Io {
                path: full.display().to_string(),
                source,
            })?;
        debug!(path = %full.display(), message, "local state written");
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct GithubStateConfig {
    pub api_base: String,
    pub owner: String,
    pub repo: String,
    pub branch: Option<String>,
    pub token: String,
    pub committer_name: String,
    pub committer_email: String,
}

impl GithubStateConfig {
    pub fn new(owner: impl Into<String>, repo: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            api_base: "https://api.github.com".to_string(),
            owner: owner.into(),
            repo: repo.into(),
            branch: None,
            token: token.into(),
            committer_name: "github-actions[bot]".to_string(),
            committer_email: "41898282+github-actions[bot]@users.noreply.github.com".to_string(),
        }
    }
}

/// State committed into a GitHub repository through the contents API, so the
/// next workflow run (on a fresh machine) sees it.
#[derive(Debug, Clone)]
pub struct GithubContentsBackend {
    client: reqwest::Client,
    config: GithubStateConfig,
}

#[derive(Debug, Deserialize)]
struct ContentsEntry {
    sha: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    encoding: Option<String>,
}

impl GithubContentsBackend {
    pub fn new(client: reqwest::Client, config: GithubStateConfig) -> Self {
        Self { client, config }
    }

    fn contents_url(&self, path: &str) -> String {
        format!(
            "{}/repos/{}/{}/contents/{}",
            self.config.api_base.trim_end_matches('/'),
            self.config.owner,
            self.config.repo,
            path.trim_start_matches('/')
        )
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        self.request_accepting(method, url, "application/vnd.github+json")
    }

    fn request_accepting(
        &self,
        method: reqwest::Method,
        url: &str,
        accept: &'static str,
    ) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .header(AUTHORIZATION, format!("Bearer {}", self.config.token))
            .header(ACCEPT, accept)
            .header(USER_AGENT, "bidwatch-state")
            .header("X-GitHub-Api-Version", "2022-11-28")
    }

    async fn fetch_entry(&self, path: &str) -> Result<Option<ContentsEntry>, StateError> {
        let url = self.contents_url(path);
        let mut req = self.request(reqwest::Method::GET, &url);
        if let Some(branch) = &self.config.branch {
            req = req.query(&[("ref", branch.as_str())]);
        }
        let resp = req.send().await?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(StateError::HttpStatus {
                status: status.as_u16(),
                url,
                body,
            });
        }
        let text = resp.text().await?;
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| StateError::Malformed(format!("contents entry for {path}: {e}")))
    }

    /// Raw blob bytes. The contents API leaves `content` empty (`encoding: none`)
    /// for files over 1 MB.
    async fn fetch_blob(&self, sha: &str) -> Result<Vec<u8>, StateError> {
        let url = format!(
            "{}/repos/{}/{}/git/blobs/{}",
            self.config.api_base.trim_end_matches('/'),
            self.config.owner,
            self.config.repo,
            sha
        );
        let resp = self
            .request_accepting(reqwest::Method::GET, &url, "application/vnd.github.raw+json")
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(StateError::HttpStatus {
                status: status.as_u16(),
                url,
                body,
            });
        }
        Ok(resp.bytes().await?.to_vec())
    }
}

fn decode_contents(entry: &ContentsEntry) -> Result<Vec<u8>, StateError> {
    match (entry.encoding.as_deref(), entry.content.as_deref()) {
        (Some("base64"), Some(content)) => {
            let compact: String = content.chars().filter(|c| !c.is_whitespace()).collect();
            BASE64
                .decode(compact)
                .map_err(|e| StateError::Malformed(format!("invalid base64 content: {e}")))
        }
        (encoding, _) => Err(StateError::Malformed(format!(
            "unsupported contents encoding {encoding:?}"
        ))),
    }
}

#[async_trait]
impl StateBackend for GithubContentsBackend {
    fn describe(&self) -> String {
        format!("github:{}/{}", self.config.owner, self.config.repo)
    }

    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>, StateError> {
        let Some(entry) = self.fetch_entry(path).await? else {
            return Ok(None);
        };
        if entry.encoding.as_deref() == Some("none") {
            debug!(path, sha = %entry.sha, "large state document; reading blob");
            return self.fetch_blob(&entry.sha).await.map(Some);
        }
        decode_contents(&entry).map(Some)
    }

    async fn put(&self, path: &str, contents: &[u8], message: &str) -> Result<(), StateError> {
        let existing = self.fetch_entry(path).await?;
        let mut body = serde_json::json!({
            "message": message,
            "content": BASE64.encode(contents),
            "committer": {
                "name": self.config.committer_name,
                "email": self.config.committer_email,
            },
        });
        if let Some(entry) = &existing {
            body["sha"] = serde_json::Value::String(entry.sha.clone());
        }
        if let Some(branch) = &self.config.branch {
            body["branch"] = serde_json::Value::String(branch.clone());
        }

        let url = self.contents_url(path);
        let resp = self
            .request(reqwest::Method::PUT, &url)
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(StateError::HttpStatus {
                status: status.as_u16(),
                url,
                body,
            });
        }
        debug!(path, created = existing.is_none(), "github state committed");
        Ok(())
    }
}

/// Prior state of one diff-monitored query, stored as a JSON array of records.
#[derive(Clone)]
pub struct StateStore {
    backend: Arc<dyn StateBackend>,
    path: String,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("backend", &self.backend.describe())
            .field("path", &self.path)
            .finish()
    }
}

impl StateStore {
    pub fn new(backend: Arc<dyn StateBackend>, path: impl Into<String>) -> Self {
        Self {
            backend,
            path: path.into(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn describe(&self) -> String {
        format!("{}/{}", self.backend.describe(), self.path)
    }

    /// Corrupt content reads as `Ok(None)`, same as a missing document. Backend
    /// failures are returned so the caller can tell "empty" from "unknown".
    pub async fn read(&self) -> Result<Option<ResultSet>, StateError> {
        let Some(bytes) = self.backend.get(&self.path).await? else {
            return Ok(None);
        };
        match serde_json::from_slice::<ResultSet>(&bytes) {
            Ok(records) => Ok(Some(records)),
            Err(err) => {
                warn!(path = %self.path, error = %err, "corrupt prior state treated as absent");
                Ok(None)
            }
        }
    }

    pub async fn commit(&self, records: &[Record], message: &str) -> Result<(), StateError> {
        let bytes = to_pretty_json(records)?;
        self.backend.put(&self.path, &bytes, message).await
    }
}
