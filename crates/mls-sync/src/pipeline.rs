//! Listing import pipeline: fetch a batch, store photos, persist records.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use mls_adapters::{ListingSource, SourceError};
use mls_core::{
    connection_sort_key, listing_partition_key, listing_sort_key, photo_blob_key,
    ConnectionHandle, ImportFailure, ImportJob, ImportResult, ListingRecord, PhotoRecord,
    CONNECTION_RECORD_TYPE, LISTING_RECORD_TYPE, LISTING_SORT_PREFIX,
};
use mls_storage::{
    extension_for_content_type, retry_with_backoff, BackoffPolicy, BlobError, BlobStore,
    FetchError, KeyValueStore, PhotoFetcher, StoreError,
};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Run-aborting failures. Per-listing and per-photo failures are returned as data instead.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("connection {connection_id} is expired or no longer authorized")]
    AuthExpired { connection_id: String },
    #[error("external listing source for {connection_id} is unreachable: {reason}")]
    ExternalSourceUnreachable {
        connection_id: String,
        reason: String,
    },
}

#[derive(Debug, Error)]
pub enum PhotoError {
    #[error("fetching photo: {0}")]
    Fetch(#[from] FetchError),
    #[error("uploading photo: {0}")]
    Upload(#[from] BlobError),
}

#[derive(Debug, Default)]
struct ListingOutcome {
    photos_stored: usize,
    photos_degraded: usize,
    failure: Option<ImportFailure>,
}

pub struct ImportPipeline {
    source: Arc<dyn ListingSource>,
    store: Arc<dyn KeyValueStore>,
    blobs: Arc<dyn BlobStore>,
    photos: Arc<dyn PhotoFetcher>,
    listing_policy: BackoffPolicy,
    photo_policy: BackoffPolicy,
}

impl ImportPipeline {
    pub fn new(
        source: Arc<dyn ListingSource>,
        store: Arc<dyn KeyValueStore>,
        blobs: Arc<dyn BlobStore>,
        photos: Arc<dyn PhotoFetcher>,
    ) -> Self {
        Self {
            source,
            store,
            blobs,
            photos,
            listing_policy: BackoffPolicy::listing_write(),
            photo_policy: BackoffPolicy::photo(),
        }
    }

    pub fn with_policies(mut self, listing_policy: BackoffPolicy, photo_policy: BackoffPolicy) -> Self {
        self.listing_policy = listing_policy;
        self.photo_policy = photo_policy;
        self
    }

    pub async fn import_listings(
        &self,
        handle: &ConnectionHandle,
    ) -> Result<ImportResult, ImportError> {
        let job = ImportJob::new(handle.connection_id.clone());
        self.run_job(&job, handle).await
    }

    pub async fn run_job(
        &self,
        job: &ImportJob,
        handle: &ConnectionHandle,
    ) -> Result<ImportResult, ImportError> {
        let span = info_span!(
            "mls_import",
            job_id = %job.job_id,
            connection_id = %job.external_connection_id,
            provider = %self.source.provider(),
            agent_id = %handle.agent_id
        );
        self.run_job_inner(job, handle).instrument(span).await
    }

    async fn run_job_inner(
        &self,
        job: &ImportJob,
        handle: &ConnectionHandle,
    ) -> Result<ImportResult, ImportError> {
        if handle.is_expired_at(Utc::now()) {
            warn!(expires_at = %handle.expires_at, "connection handle expired; aborting import");
            return Err(ImportError::AuthExpired {
                connection_id: handle.connection_id.clone(),
            });
        }

        let listings = self
            .source
            .fetch_listings(handle, &handle.agent_id)
            .await
            .map_err(|err| match err {
                SourceError::AuthExpired | SourceError::Authentication(_) => {
                    ImportError::AuthExpired {
                        connection_id: handle.connection_id.clone(),
                    }
                }
                other => ImportError::ExternalSourceUnreachable {
                    connection_id: handle.connection_id.clone(),
                    reason: other.to_string(),
                },
            })?;
        info!(listings = listings.len(), "fetched listing batch");
        let listings = dedupe_batch(listings);

        let outcomes = join_all(
            listings
                .into_iter()
                .map(|listing| self.import_one(&handle.agent_id, listing)),
        )
        .await;

        let mut result = ImportResult {
            total_listings: outcomes.len(),
            ..ImportResult::default()
        };
        for outcome in outcomes {
            result.photos_stored += outcome.photos_stored;
            result.photos_degraded += outcome.photos_degraded;
            match outcome.failure {
                Some(failure) => {
                    result.failed_imports += 1;
                    result.errors.push(failure);
                }
                None => result.successful_imports += 1,
            }
        }

        info!(
            total = result.total_listings,
            succeeded = result.successful_imports,
            failed = result.failed_imports,
            photos_degraded = result.photos_degraded,
            "import finished"
        );

        if let Err(err) = self.record_sync_status(job, handle, &result).await {
            warn!(error = %err, "failed to record connection sync status");
        }
        Ok(result)
    }

    async fn import_one(&self, agent_id: &str, listing: ListingRecord) -> ListingOutcome {
        let mut record = listing;
        let listing_id = record.listing_id;
        let mls_number = record.mls_number.clone();

        let photos = std::mem::take(&mut record.photos);
        record.photos = join_all(
            photos
                .into_iter()
                .map(|photo| self.store_photo(agent_id, listing_id, &mls_number, photo)),
        )
        .await;

        let photos_stored = record
            .photos
            .iter()
            .filter(|p| p.stored_url.is_some())
            .count();
        let mut outcome = ListingOutcome {
            photos_stored,
            photos_degraded: record.photos.len() - photos_stored,
            failure: None,
        };

        record.synced_at = Some(Utc::now());
        let data = match serde_json::to_value(&record) {
            Ok(data) => data,
            Err(err) => {
                warn!(mls_number = %mls_number, error = %err, "listing could not be serialized");
                outcome.failure = Some(ImportFailure {
                    mls_number,
                    error: err.to_string(),
                    attempts_made: 0,
                });
                return outcome;
            }
        };

        let partition_key = listing_partition_key(agent_id);
        let sort_key = listing_sort_key(listing_id);
        let written = retry_with_backoff(&self.listing_policy, "listing_write", |_| {
            let data = data.clone();
            let (pk, sk) = (partition_key.as_str(), sort_key.as_str());
            async move { self.store.create(pk, sk, LISTING_RECORD_TYPE, data).await }
        })
        .await;

        match written {
            Ok(_) => debug!(mls_number = %mls_number, "listing persisted"),
            Err(exhausted) => {
                warn!(
                    mls_number = %mls_number,
                    attempts = exhausted.attempts,
                    error = %exhausted.last_error,
                    "listing write failed"
                );
                outcome.failure = Some(ImportFailure {
                    mls_number,
                    error: exhausted.last_error.to_string(),
                    attempts_made: exhausted.attempts,
                });
            }
        }
        outcome
    }

    /// One attempt = fresh download + upload. Exhaustion leaves `stored_url` unset.
    async fn store_photo(
        &self,
        agent_id: &str,
        listing_id: Uuid,
        mls_number: &str,
        photo: PhotoRecord,
    ) -> PhotoRecord {
        let stored = retry_with_backoff(&self.photo_policy, "photo_store", |_| {
            let photo = &photo;
            async move {
                let fetched = self.photos.fetch(&photo.source_url).await?;
                let key = photo_blob_key(
                    agent_id,
                    listing_id,
                    photo.order,
                    extension_for_content_type(&fetched.content_type),
                );
                let metadata = BTreeMap::from([
                    ("listing_id".to_string(), listing_id.to_string()),
                    ("mls_number".to_string(), mls_number.to_string()),
                    ("order".to_string(), photo.order.to_string()),
                    ("source_url".to_string(), photo.source_url.clone()),
                ]);
                let url = self
                    .blobs
                    .upload(&key, &fetched.bytes, &fetched.content_type, &metadata)
                    .await?;
                Ok::<_, PhotoError>(url)
            }
        })
        .await;

        match stored {
            Ok(url) => PhotoRecord {
                stored_url: Some(url),
                ..photo
            },
            Err(exhausted) => {
                warn!(
                    mls_number,
                    source_url = %photo.source_url,
                    attempts = exhausted.attempts,
                    error = %exhausted.last_error,
                    "photo storage failed; falling back to source url"
                );
                PhotoRecord {
                    stored_url: None,
                    ..photo
                }
            }
        }
    }

    async fn record_sync_status(
        &self,
        job: &ImportJob,
        handle: &ConnectionHandle,
        result: &ImportResult,
    ) -> Result<(), StoreError> {
        let partition_key = listing_partition_key(&handle.agent_id);
        let sort_key = connection_sort_key(&handle.connection_id);
        let status = serde_json::json!({
            "connection_id": handle.connection_id,
            "provider": handle.provider,
            "last_job_id": job.job_id,
            "last_sync_at": Utc::now(),
            "total_listings": result.total_listings,
            "successful_imports": result.successful_imports,
            "failed_imports": result.failed_imports,
        });

        if self.store.get(&partition_key, &sort_key).await?.is_some() {
            self.store.update(&partition_key, &sort_key, status).await?;
        } else {
            self.store
                .create(&partition_key, &sort_key, CONNECTION_RECORD_TYPE, status)
                .await?;
        }
        Ok(())
    }
}

/// Keeps the last occurrence of each `listing_id` so no key is written twice in one run.
fn dedupe_batch(listings: Vec<ListingRecord>) -> Vec<ListingRecord> {
    let mut seen = HashSet::new();
    let mut unique = Vec::with_capacity(listings.len());
    for listing in listings.into_iter().rev() {
        if seen.insert(listing.listing_id) {
            unique.push(listing);
        } else {
            warn!(
                mls_number = %listing.mls_number,
                listing_id = %listing.listing_id,
                "duplicate listing in batch; keeping the later copy"
            );
        }
    }
    unique.reverse();
    unique
}

/// Listings previously imported for `agent_id`, ordered by sort key.
pub async fn list_imported_listings(
    store: &dyn KeyValueStore,
    agent_id: &str,
) -> Result<Vec<ListingRecord>, StoreError> {
    store
        .query(&listing_partition_key(agent_id), LISTING_SORT_PREFIX)
        .await?
        .into_iter()
        .map(|item| serde_json::from_value(item.data).map_err(StoreError::from))
        .collect()
}
