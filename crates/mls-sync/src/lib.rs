//! MLS import orchestration: configuration, connection registry, runs, reports, scheduling.

mod pipeline;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use mls_adapters::{FixtureListingSource, HttpListingSource, ListingSource, SourceContext};
use mls_core::{Credentials, ImportJob, ImportResult, ListingRecord};
use mls_storage::{
    BackoffPolicy, BlobStore, FileStore, FsBlobStore, HttpClientConfig, HttpFetcher,
    KeyValueStore, LocalPhotoFetcher, PhotoFetcher,
};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

pub use pipeline::{list_imported_listings, ImportError, ImportPipeline, PhotoError};

pub const CRATE_NAME: &str = "mls-sync";

#[derive(Debug, Clone)]
pub struct ImportConfig {
    pub data_dir: PathBuf,
    pub blob_dir: PathBuf,
    pub blob_base_url: String,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub retry_base_delay_ms: u64,
    pub retry_jitter_ms: u64,
    pub workspace_root: PathBuf,
}

impl ImportConfig {
    pub fn from_env() -> Self {
        let blob_dir = std::env::var("MLS_BLOB_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data/blobs"));
        Self {
            data_dir: std::env::var("MLS_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/store")),
            blob_base_url: std::env::var("MLS_BLOB_BASE_URL")
                .unwrap_or_else(|_| file_url_for(&blob_dir)),
            blob_dir,
            scheduler_enabled: std::env::var("MLS_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("MLS_SYNC_CRON").unwrap_or_else(|_| "0 */6 * * *".to_string()),
            user_agent: std::env::var("MLS_USER_AGENT")
                .unwrap_or_else(|_| "mls-import/0.1".to_string()),
            http_timeout_secs: env_u64("MLS_HTTP_TIMEOUT_SECS", 20),
            retry_base_delay_ms: env_u64("MLS_RETRY_BASE_DELAY_MS", 1000),
            retry_jitter_ms: env_u64("MLS_RETRY_JITTER_MS", 1000),
            workspace_root: PathBuf::from("."),
        }
    }

    pub fn listing_policy(&self) -> BackoffPolicy {
        BackoffPolicy::listing_write().with_timing(
            Duration::from_millis(self.retry_base_delay_ms),
            Duration::from_millis(self.retry_jitter_ms),
        )
    }

    pub fn photo_policy(&self) -> BackoffPolicy {
        BackoffPolicy::photo().with_timing(
            Duration::from_millis(self.retry_base_delay_ms),
            Duration::from_millis(self.retry_jitter_ms),
        )
    }
}

/// `file:///` URL for `dir`, resolved against the working directory when relative.
fn file_url_for(dir: &Path) -> String {
    let absolute = std::path::absolute(dir).unwrap_or_else(|_| dir.to_path_buf());
    format!("file://{}", absolute.display())
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMode {
    Fixture,
    Http,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionRegistry {
    pub connections: Vec<ConnectionConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    pub connection_id: String,
    pub display_name: String,
    pub enabled: bool,
    pub mode: ConnectionMode,
    pub provider: String,
    pub agent_id: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub client_id_env: Option<String>,
    #[serde(default)]
    pub client_secret_env: Option<String>,
}

impl ConnectionConfig {
    fn source_context(&self) -> SourceContext {
        SourceContext {
            connection_id: self.connection_id.clone(),
            provider: self.provider.clone(),
            agent_id: self.agent_id.clone(),
        }
    }

    /// Reads credentials from the configured env vars. Fixture connections fall back to
    /// placeholder credentials so they run without any setup.
    pub fn credentials_from_env(&self) -> Result<Credentials> {
        let read = |var: &Option<String>| var.as_deref().and_then(|v| std::env::var(v).ok());
        match (read(&self.client_id_env), read(&self.client_secret_env), self.mode) {
            (Some(client_id), Some(client_secret), _) => Ok(Credentials {
                client_id,
                client_secret,
            }),
            (_, _, ConnectionMode::Fixture) => Ok(Credentials {
                client_id: format!("fixture-{}", self.connection_id),
                client_secret: "fixture".to_string(),
            }),
            _ => bail!(
                "credentials for connection {} not set (expected env {} / {})",
                self.connection_id,
                self.client_id_env.as_deref().unwrap_or("<unset>"),
                self.client_secret_env.as_deref().unwrap_or("<unset>")
            ),
        }
    }
}

pub async fn load_connection_registry(workspace_root: &Path) -> Result<ConnectionRegistry> {
    let path = workspace_root.join("connections.yaml");
    let text = fs::read_to_string(&path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Long-lived collaborators shared by every run.
pub struct ImportEnvironment {
    pub store: Arc<dyn KeyValueStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub http: Arc<HttpFetcher>,
}

impl ImportEnvironment {
    pub fn from_config(config: &ImportConfig) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        Ok(Self {
            store: Arc::new(FileStore::new(config.data_dir.clone())),
            blobs: Arc::new(FsBlobStore::new(
                config.blob_dir.clone(),
                config.blob_base_url.clone(),
            )),
            http: Arc::new(http),
        })
    }
}

pub fn build_source(
    config: &ImportConfig,
    connection: &ConnectionConfig,
    http: &Arc<HttpFetcher>,
) -> Result<(Arc<dyn ListingSource>, Arc<dyn PhotoFetcher>)> {
    match connection.mode {
        ConnectionMode::Fixture => {
            let fixture_dir = config
                .workspace_root
                .join("fixtures")
                .join(&connection.connection_id);
            let source: Arc<dyn ListingSource> = Arc::new(FixtureListingSource::new(
                connection.source_context(),
                fixture_dir.join("listings.json"),
            ));
            let photos: Arc<dyn PhotoFetcher> = Arc::new(LocalPhotoFetcher::new(fixture_dir));
            Ok((source, photos))
        }
        ConnectionMode::Http => {
            let base_url = connection
                .base_url
                .clone()
                .with_context(|| format!("connection {} has no base_url", connection.connection_id))?;
            let source: Arc<dyn ListingSource> = Arc::new(HttpListingSource::new(
                connection.source_context(),
                base_url,
                http.client().clone(),
            ));
            let photos: Arc<dyn PhotoFetcher> = http.clone();
            Ok((source, photos))
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportRunSummary {
    pub job: ImportJob,
    pub finished_at: DateTime<Utc>,
    pub result: ImportResult,
    pub reports_dir: String,
}

pub async fn import_connection(
    config: &ImportConfig,
    connection: &ConnectionConfig,
    env: &ImportEnvironment,
) -> Result<ImportRunSummary> {
    let job = ImportJob::new(connection.connection_id.clone());
    info!(job_id = %job.job_id, connection_id = %connection.connection_id, "import triggered");

    let (source, photos) = build_source(config, connection, &env.http)?;
    let credentials = connection.credentials_from_env()?;
    let handle = source
        .authenticate(&credentials)
        .await
        .with_context(|| format!("authenticating connection {}", connection.connection_id))?;

    let pipeline = ImportPipeline::new(source, env.store.clone(), env.blobs.clone(), photos)
        .with_policies(config.listing_policy(), config.photo_policy());
    let result = pipeline
        .run_job(&job, &handle)
        .await
        .with_context(|| format!("importing connection {}", connection.connection_id))?;

    let finished_at = Utc::now();
    let reports_dir = write_reports(&config.workspace_root, &job, finished_at, &result).await?;
    Ok(ImportRunSummary {
        job,
        finished_at,
        result,
        reports_dir: reports_dir.display().to_string(),
    })
}

/// Imports every enabled connection in turn. A failed connection is logged and skipped.
pub async fn run_imports_from_config(config: &ImportConfig) -> Result<Vec<ImportRunSummary>> {
    let registry = load_connection_registry(&config.workspace_root).await?;
    let env = ImportEnvironment::from_config(config)?;

    let mut summaries = Vec::new();
    for connection in registry.connections.iter().filter(|c| c.enabled) {
        match import_connection(config, connection, &env).await {
            Ok(summary) => summaries.push(summary),
            Err(err) => error!(
                connection_id = %connection.connection_id,
                error = %format!("{err:#}"),
                "connection import failed"
            ),
        }
    }
    Ok(summaries)
}

pub async fn run_import_once_from_env(connection_id: &str) -> Result<ImportRunSummary> {
    let config = ImportConfig::from_env();
    let registry = load_connection_registry(&config.workspace_root).await?;
    let connection = registry
        .connections
        .iter()
        .find(|c| c.connection_id == connection_id)
        .with_context(|| format!("no connection named {connection_id} in connections.yaml"))?;
    let env = ImportEnvironment::from_config(&config)?;
    import_connection(&config, connection, &env).await
}

pub async fn run_all_imports_from_env() -> Result<Vec<ImportRunSummary>> {
    run_imports_from_config(&ImportConfig::from_env()).await
}

pub async fn list_listings_from_env(agent_id: &str) -> Result<Vec<ListingRecord>> {
    let config = ImportConfig::from_env();
    let store = FileStore::new(config.data_dir);
    list_imported_listings(&store, agent_id)
        .await
        .with_context(|| format!("listing imported records for {agent_id}"))
}

pub async fn maybe_build_scheduler(config: &ImportConfig) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job_config = config.clone();
    let job = Job::new_async(config.sync_cron.as_str(), move |_uuid, _l| {
        let config = job_config.clone();
        Box::pin(async move {
            match run_imports_from_config(&config).await {
                Ok(summaries) => info!(runs = summaries.len(), "scheduled import finished"),
                Err(err) => error!(error = %format!("{err:#}"), "scheduled import failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {}", config.sync_cron))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

async fn write_reports(
    workspace_root: &Path,
    job: &ImportJob,
    finished_at: DateTime<Utc>,
    result: &ImportResult,
) -> Result<PathBuf> {
    let reports_dir = workspace_root.join("reports").join(job.job_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let json = serde_json::to_vec_pretty(&serde_json::json!({
        "job": job,
        "finished_at": finished_at,
        "result": result,
    }))
    .context("serializing import result")?;
    fs::write(reports_dir.join("import_result.json"), json)
        .await
        .context("writing import_result.json")?;

    let mut brief = format!(
        "# MLS Import Brief\n\n- Job ID: `{}`\n- Connection: {}\n- Requested: {}\n- Finished: {}\n- Listings: {} total, {} imported, {} failed\n- Photos: {} stored, {} using source URL\n",
        job.job_id,
        job.external_connection_id,
        job.requested_at,
        finished_at,
        result.total_listings,
        result.successful_imports,
        result.failed_imports,
        result.photos_stored,
        result.photos_degraded,
    );
    if !result.errors.is_empty() {
        brief.push_str("\n## Failed Listings\n");
        for failure in &result.errors {
            brief.push_str(&format!(
                "- {} after {} attempt(s): {}\n",
                failure.mls_number, failure.attempts_made, failure.error
            ));
        }
    }
    fs::write(reports_dir.join("import_brief.md"), brief)
        .await
        .context("writing import_brief.md")?;

    Ok(reports_dir)
}

#[derive(Debug, Deserialize)]
struct StoredReport {
    job: ImportJob,
    result: ImportResult,
}

pub fn report_recent_markdown(runs: usize, workspace_root: Option<PathBuf>) -> Result<String> {
    let root = workspace_root.unwrap_or_else(|| PathBuf::from("."));
    let reports_root = root.join("reports");
    let mut reports = std::fs::read_dir(&reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .filter_map(|entry| {
            let path = entry.path().join("import_result.json");
            let text = std::fs::read_to_string(&path).ok()?;
            serde_json::from_str::<StoredReport>(&text)
                .ok()
                .map(|report| (report, path))
        })
        .collect::<Vec<_>>();
    reports.sort_by_key(|(report, _)| report.job.requested_at);
    reports.reverse();

    let mut lines = vec!["# MLS Import Runs".to_string(), String::new()];
    for (report, path) in reports.into_iter().take(runs.max(1)) {
        lines.push(format!("## Job `{}`", report.job.job_id));
        lines.push(format!("- connection: {}", report.job.external_connection_id));
        lines.push(format!("- requested: {}", report.job.requested_at));
        lines.push(format!(
            "- listings: {} total / {} imported / {} failed",
            report.result.total_listings,
            report.result.successful_imports,
            report.result.failed_imports
        ));
        for failure in &report.result.errors {
            lines.push(format!("  - failed `{}`: {}", failure.mls_number, failure.error));
        }
        lines.push(format!("- result: `{}`", path.display()));
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}
