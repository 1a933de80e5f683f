//! Retry/backoff engine, key-value + blob storage, and photo fetch utilities.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "mls-storage";

/// Bounded retry policy: `base_delay * 2^attempt + uniform[0, jitter)` between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub jitter: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::listing_write()
    }
}

impl BackoffPolicy {
    pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1000);
    pub const DEFAULT_JITTER: Duration = Duration::from_millis(1000);

    pub const fn listing_write() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Self::DEFAULT_BASE_DELAY,
            jitter: Self::DEFAULT_JITTER,
        }
    }

    pub const fn photo() -> Self {
        Self {
            max_attempts: 2,
            base_delay: Self::DEFAULT_BASE_DELAY,
            jitter: Self::DEFAULT_JITTER,
        }
    }

    pub fn with_timing(mut self, base_delay: Duration, jitter: Duration) -> Self {
        self.base_delay = base_delay;
        self.jitter = jitter;
        self
    }

    pub fn base_delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.base_delay_for_attempt(attempt)
            .saturating_add(self.sample_jitter())
    }

    fn sample_jitter(&self) -> Duration {
        let max_ms = self.jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..max_ms))
    }
}

#[derive(Debug, Error)]
#[error("gave up after {attempts} attempt(s): {last_error}")]
pub struct RetryExhausted<E> {
    pub attempts: u32,
    pub last_error: E,
}

/// Runs `action` (given the 0-based attempt index) until it succeeds or `max_attempts` calls
/// have failed. No sleep follows the final attempt.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &BackoffPolicy,
    label: &str,
    mut action: F,
) -> Result<T, RetryExhausted<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        match action(attempt).await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(label, attempts = attempt + 1, "succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if attempt + 1 < max_attempts => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    label,
                    attempt = attempt + 1,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "attempt failed; backing off"
                );
                drop(err);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                warn!(label, attempts = max_attempts, error = %err, "retries exhausted");
                return Err(RetryExhausted {
                    attempts: attempt + 1,
                    last_error: err,
                });
            }
        }
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Writes `bytes` to `path` through a temp file + rename so readers never see a partial file.
async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).await?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    drop(file);

    match fs::rename(&temp_path, path).await {
        Ok(()) => Ok(()),
        Err(err) => {
            let _ = fs::remove_file(&temp_path).await;
            Err(err)
        }
    }
}

/// Joins a relative `key` under `root`, rejecting absolute paths and `..` segments.
fn contained_path(root: &Path, key: &str) -> Option<PathBuf> {
    let rel = Path::new(key);
    if key.trim().is_empty() {
        return None;
    }
    if rel
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return None;
    }
    Some(root.join(rel))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredItem {
    pub partition_key: String,
    pub sort_key: String,
    pub record_type: String,
    pub data: JsonValue,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("item {partition_key}/{sort_key} not found")]
    NotFound {
        partition_key: String,
        sort_key: String,
    },
    #[error("store io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Durable key-value collaborator. Writes to distinct keys are safe to run concurrently.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Inserts the item, replacing any existing item under the same key.
    async fn create(
        &self,
        partition_key: &str,
        sort_key: &str,
        record_type: &str,
        data: JsonValue,
    ) -> Result<StoredItem, StoreError>;

    async fn get(&self, partition_key: &str, sort_key: &str)
        -> Result<Option<StoredItem>, StoreError>;

    /// Shallow-merges top-level object fields of `data` into the existing item.
    async fn update(
        &self,
        partition_key: &str,
        sort_key: &str,
        data: JsonValue,
    ) -> Result<StoredItem, StoreError>;

    async fn delete(&self, partition_key: &str, sort_key: &str) -> Result<bool, StoreError>;

    /// Ordered by sort key.
    async fn query(
        &self,
        partition_key: &str,
        sort_key_prefix: &str,
    ) -> Result<Vec<StoredItem>, StoreError>;
}

fn merge_data(existing: &mut JsonValue, patch: JsonValue) {
    match (existing, patch) {
        (JsonValue::Object(current), JsonValue::Object(patch)) => {
            for (key, value) in patch {
                current.insert(key, value);
            }
        }
        (slot, patch) => *slot = patch,
    }
}

fn new_item(partition_key: &str, sort_key: &str, record_type: &str, data: JsonValue) -> StoredItem {
    let now = Utc::now();
    StoredItem {
        partition_key: partition_key.to_string(),
        sort_key: sort_key.to_string(),
        record_type: record_type.to_string(),
        data,
        created_at: now,
        updated_at: now,
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    items: Mutex<BTreeMap<(String, String), StoredItem>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn create(
        &self,
        partition_key: &str,
        sort_key: &str,
        record_type: &str,
        data: JsonValue,
    ) -> Result<StoredItem, StoreError> {
        let item = new_item(partition_key, sort_key, record_type, data);
        self.items.lock().await.insert(
            (partition_key.to_string(), sort_key.to_string()),
            item.clone(),
        );
        Ok(item)
    }

    async fn get(
        &self,
        partition_key: &str,
        sort_key: &str,
    ) -> Result<Option<StoredItem>, StoreError> {
        Ok(self
            .items
            .lock()
            .await
            .get(&(partition_key.to_string(), sort_key.to_string()))
            .cloned())
    }

    async fn update(
        &self,
        partition_key: &str,
        sort_key: &str,
        data: JsonValue,
    ) -> Result<StoredItem, StoreError> {
        let mut items = self.items.lock().await;
        let item = items
            .get_mut(&(partition_key.to_string(), sort_key.to_string()))
            .ok_or_else(|| StoreError::NotFound {
                partition_key: partition_key.to_string(),
                sort_key: sort_key.to_string(),
            })?;
        merge_data(&mut item.data, data);
        item.updated_at = Utc::now();
        Ok(item.clone())
    }

    async fn delete(&self, partition_key: &str, sort_key: &str) -> Result<bool, StoreError> {
        Ok(self
            .items
            .lock()
            .await
            .remove(&(partition_key.to_string(), sort_key.to_string()))
            .is_some())
    }

    async fn query(
        &self,
        partition_key: &str,
        sort_key_prefix: &str,
    ) -> Result<Vec<StoredItem>, StoreError> {
        Ok(self
            .items
            .lock()
            .await
            .values()
            .filter(|item| {
                item.partition_key == partition_key && item.sort_key.starts_with(sort_key_prefix)
            })
            .cloned()
            .collect())
    }
}

/// One JSON document per key under `root/<hex(pk)>/<hex(sk)>.json`.
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    update_lock: Mutex<()>,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            update_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn partition_dir(&self, partition_key: &str) -> PathBuf {
        self.root.join(hex::encode(partition_key.as_bytes()))
    }

    fn item_path(&self, partition_key: &str, sort_key: &str) -> PathBuf {
        self.partition_dir(partition_key)
            .join(format!("{}.json", hex::encode(sort_key.as_bytes())))
    }

    async fn read_item(&self, path: &Path) -> Result<Option<StoredItem>, StoreError> {
        match fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::Io {
                path: path.display().to_string(),
                source,
            }),
        }
    }

    async fn write_item(&self, item: &StoredItem) -> Result<(), StoreError> {
        let path = self.item_path(&item.partition_key, &item.sort_key);
        let bytes = serde_json::to_vec_pretty(item)?;
        write_atomic(&path, &bytes)
            .await
            .map_err(|source| StoreError::Io {
                path: path.display().to_string(),
                source,
            })
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn create(
        &self,
        partition_key: &str,
        sort_key: &str,
        record_type: &str,
        data: JsonValue,
    ) -> Result<StoredItem, StoreError> {
        let item = new_item(partition_key, sort_key, record_type, data);
        self.write_item(&item).await?;
        Ok(item)
    }

    async fn get(
        &self,
        partition_key: &str,
        sort_key: &str,
    ) -> Result<Option<StoredItem>, StoreError> {
        self.read_item(&self.item_path(partition_key, sort_key)).await
    }

    async fn update(
        &self,
        partition_key: &str,
        sort_key: &str,
        data: JsonValue,
    ) -> Result<StoredItem, StoreError> {
        let _guard = self.update_lock.lock().await;
        let path = self.item_path(partition_key, sort_key);
        let mut item = self
            .read_item(&path)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                partition_key: partition_key.to_string(),
                sort_key: sort_key.to_string(),
            })?;
        merge_data(&mut item.data, data);
        item.updated_at = Utc::now();
        self.write_item(&item).await?;
        Ok(item)
    }

    async fn delete(&self, partition_key: &str, sort_key: &str) -> Result<bool, StoreError> {
        let path = self.item_path(partition_key, sort_key);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(StoreError::Io {
                path: path.display().to_string(),
                source,
            }),
        }
    }

    async fn query(
        &self,
        partition_key: &str,
        sort_key_prefix: &str,
    ) -> Result<Vec<StoredItem>, StoreError> {
        let dir = self.partition_dir(partition_key);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StoreError::Io {
                    path: dir.display().to_string(),
                    source,
                })
            }
        };

        let mut items = Vec::new();
        loop {
            let entry = entries.next_entry().await.map_err(|source| StoreError::Io {
                path: dir.display().to_string(),
                source,
            })?;
            let Some(entry) = entry else { break };
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(item) = self.read_item(&path).await? {
                if item.sort_key.starts_with(sort_key_prefix) {
                    items.push(item);
                }
            }
        }
        items.sort_by(|a, b| a.sort_key.cmp(&b.sort_key));
        Ok(items)
    }
}

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("invalid blob key {0:?}")]
    InvalidKey(String),
    #[error("blob io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("blob metadata serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn upload(
        &self,
        key: &str,
        bytes: &[u8],
        content_type: &str,
        metadata: &BTreeMap<String, String>,
    ) -> Result<String, BlobError>;
}

#[derive(Debug, Serialize)]
struct BlobSidecar<'a> {
    key: &'a str,
    content_type: &'a str,
    sha256: String,
    byte_size: usize,
    uploaded_at: DateTime<Utc>,
    metadata: &'a BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
    public_base_url: String,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>, public_base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            public_base_url: public_base_url.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn url_for_key(&self, key: &str) -> String {
        format!("{}/{}", self.public_base_url.trim_end_matches('/'), key)
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn upload(
        &self,
        key: &str,
        bytes: &[u8],
        content_type: &str,
        metadata: &BTreeMap<String, String>,
    ) -> Result<String, BlobError> {
        let path =
            contained_path(&self.root, key).ok_or_else(|| BlobError::InvalidKey(key.to_string()))?;

        write_atomic(&path, bytes)
            .await
            .map_err(|source| BlobError::Io {
                path: path.display().to_string(),
                source,
            })?;

        let sidecar = BlobSidecar {
            key,
            content_type,
            sha256: sha256_hex(bytes),
            byte_size: bytes.len(),
            uploaded_at: Utc::now(),
            metadata,
        };
        let sidecar_path = path.with_file_name(format!(
            "{}.meta.json",
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        ));
        write_atomic(&sidecar_path, &serde_json::to_vec_pretty(&sidecar)?)
            .await
            .map_err(|source| BlobError::Io {
                path: sidecar_path.display().to_string(),
                source,
            })?;

        Ok(self.url_for_key(key))
    }
}

pub fn content_type_for_extension(extension: &str) -> &'static str {
    match extension.trim_start_matches('.').to_ascii_lowercase().as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "heic" => "image/heic",
        _ => "application/octet-stream",
    }
}

pub fn extension_for_content_type(content_type: &str) -> &'static str {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    match essence.as_str() {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/png" => "png",
        "image/webp" => "webp",
        "image/gif" => "gif",
        "image/heic" => "heic",
        _ => "bin",
    }
}

fn extension_of(url: &str) -> &str {
    let path = url.split(['?', '#']).next().unwrap_or_default();
    let file = path.rsplit('/').next().unwrap_or_default();
    match file.rsplit_once('.') {
        Some((_, ext)) => ext,
        None => "",
    }
}

#[derive(Debug, Clone)]
pub struct FetchedPhoto {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid url {0}")]
    InvalidUrl(String),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("fetcher unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait PhotoFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedPhoto, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_host_concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            per_host_concurrency: 4,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

/// Concurrency-limited HTTP client. Each call issues exactly one request.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_host_limit: usize,
    per_host: Mutex<HashMap<String, Arc<Semaphore>>>,
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
        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_host_limit: config.per_host_concurrency.max(1),
            per_host: Mutex::new(HashMap::new()),
        })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    async fn per_host_semaphore(&self, host: &str) -> Arc<Semaphore> {
        let mut map = self.per_host.lock().await;
        map.entry(host.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_host_limit)))
            .clone()
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let parsed = reqwest::Url::parse(url).map_err(|_| FetchError::InvalidUrl(url.to_string()))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| FetchError::InvalidUrl(url.to_string()))?
            .to_string();

        // Host permit first so requests queued on one busy host don't hold global permits.
        let per_host = self.per_host_semaphore(&host).await;
        let _host = per_host
            .acquire()
            .await
            .map_err(|e| FetchError::Unavailable(e.to_string()))?;
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|e| FetchError::Unavailable(e.to_string()))?;

        let span = info_span!("http_fetch", host = %host, url);
        async {
            let resp = self.client.get(parsed).send().await?;
            let status = resp.status();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: resp.url().to_string(),
                });
            }
            let content_type = resp
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(ToString::to_string);
            let body = resp.bytes().await?.to_vec();
            Ok(FetchedResponse {
                content_type,
                body,
            })
        }
        .instrument(span)
        .await
    }
}

#[async_trait]
impl PhotoFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPhoto, FetchError> {
        let resp = self.fetch_bytes(url).await?;
        let content_type = resp
            .content_type
            .filter(|ct| ct.starts_with("image/"))
            .unwrap_or_else(|| content_type_for_extension(extension_of(url)).to_string());
        Ok(FetchedPhoto {
            bytes: resp.body,
            content_type,
        })
    }
}

#[derive(Debug, Clone)]
pub struct LocalPhotoFetcher {
    root: PathBuf,
}

impl LocalPhotoFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl PhotoFetcher for LocalPhotoFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPhoto, FetchError> {
        let rel = url.strip_prefix("file://").unwrap_or(url);
        let path =
            contained_path(&self.root, rel).ok_or_else(|| FetchError::InvalidUrl(url.to_string()))?;
        let bytes = fs::read(&path).await.map_err(|source| FetchError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(FetchedPhoto {
            bytes,
            content_type: content_type_for_extension(extension_of(rel)).to_string(),
        })
    }
}
