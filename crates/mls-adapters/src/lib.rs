//! External listing source contracts + fixture and HTTP implementations.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use mls_core::{
    Address, ConnectionHandle, Credentials, ListingRecord, ListingStatus, PhotoRecord,
    PropertyFacts,
};
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "mls-adapters";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("connection token expired or revoked")]
    AuthExpired,
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid listing payload: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceContext {
    pub connection_id: String,
    pub provider: String,
    pub agent_id: String,
}

#[async_trait]
pub trait ListingSource: Send + Sync {
    fn provider(&self) -> &str;

    async fn authenticate(&self, credentials: &Credentials)
        -> Result<ConnectionHandle, SourceError>;

    async fn fetch_listings(
        &self,
        handle: &ConnectionHandle,
        agent_id: &str,
    ) -> Result<Vec<ListingRecord>, SourceError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceListing {
    pub mls_id: String,
    pub mls_number: String,
    pub address: Address,
    pub list_price: f64,
    #[serde(default)]
    pub property_type: Option<String>,
    #[serde(default)]
    pub bedrooms: Option<u32>,
    #[serde(default)]
    pub bathrooms: Option<f64>,
    #[serde(default)]
    pub square_feet: Option<u32>,
    #[serde(default)]
    pub lot_size_acres: Option<f64>,
    #[serde(default)]
    pub year_built: Option<u16>,
    pub status: String,
    #[serde(default)]
    pub public_remarks: Option<String>,
    #[serde(default)]
    pub photos: Vec<SourcePhoto>,
    #[serde(default)]
    pub listed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourcePhoto {
    pub url: String,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub order: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
struct ListingsEnvelope {
    listings: Vec<SourceListing>,
}

fn text_or_none(value: Option<String>) -> Option<String> {
    let trimmed = value?.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

/// Normalizes a provider payload into the canonical record. Photos are ordered by their
/// declared order (falling back to feed position) and renumbered densely from zero.
pub fn source_listing_to_record(provider: &str, listing: SourceListing) -> ListingRecord {
    let mut photos = listing
        .photos
        .into_iter()
        .enumerate()
        .filter(|(_, p)| !p.url.trim().is_empty())
        .map(|(idx, p)| (p.order.unwrap_or(idx as u32), idx, p))
        .collect::<Vec<_>>();
    photos.sort_by_key(|(order, idx, _)| (*order, *idx));

    let photos = photos
        .into_iter()
        .enumerate()
        .map(|(position, (_, _, p))| PhotoRecord {
            source_url: p.url.trim().to_string(),
            stored_url: None,
            caption: text_or_none(p.caption),
            order: position as u32,
        })
        .collect();

    ListingRecord {
        listing_id: ListingRecord::deterministic_id(provider, &listing.mls_id),
        provider: provider.to_string(),
        mls_id: listing.mls_id,
        mls_number: listing.mls_number,
        address: listing.address,
        price: listing.list_price,
        facts: PropertyFacts {
            property_type: text_or_none(listing.property_type),
            bedrooms: listing.bedrooms,
            bathrooms: listing.bathrooms,
            square_feet: listing.square_feet,
            lot_size_acres: listing.lot_size_acres,
            year_built: listing.year_built,
        },
        status: ListingStatus::normalize(&listing.status),
        description: text_or_none(listing.public_remarks),
        photos,
        listed_at: listing.listed_at,
        synced_at: None,
    }
}

fn ensure_handle_usable(handle: &ConnectionHandle, ctx: &SourceContext) -> Result<(), SourceError> {
    if handle.connection_id != ctx.connection_id {
        return Err(SourceError::Authentication(format!(
            "handle for {} used against connection {}",
            handle.connection_id, ctx.connection_id
        )));
    }
    if handle.is_expired_at(Utc::now()) {
        return Err(SourceError::AuthExpired);
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureBundle {
    pub fixture_id: String,
    pub provider: String,
    pub captured_at: DateTime<Utc>,
    #[serde(default)]
    pub notes: Option<String>,
    pub listings: Vec<SourceListing>,
}

pub fn load_fixture_bundle(path: impl AsRef<Path>) -> Result<FixtureBundle> {
    read_json_file(path)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

#[derive(Debug, Clone)]
pub struct FixtureListingSource {
    ctx: SourceContext,
    bundle_path: PathBuf,
    token_ttl: Duration,
}

impl FixtureListingSource {
    pub fn new(ctx: SourceContext, bundle_path: impl Into<PathBuf>) -> Self {
        Self {
            ctx,
            bundle_path: bundle_path.into(),
            token_ttl: Duration::hours(1),
        }
    }

    pub fn with_token_ttl(mut self, ttl: Duration) -> Self {
        self.token_ttl = ttl;
        self
    }
}

#[async_trait]
impl ListingSource for FixtureListingSource {
    fn provider(&self) -> &str {
        &self.ctx.provider
    }

    async fn authenticate(
        &self,
        credentials: &Credentials,
    ) -> Result<ConnectionHandle, SourceError> {
        if credentials.client_id.trim().is_empty() || credentials.client_secret.is_empty() {
            return Err(SourceError::Authentication(
                "client id and secret are required".to_string(),
            ));
        }
        let now = Utc::now();
        Ok(ConnectionHandle {
            connection_id: self.ctx.connection_id.clone(),
            provider: self.ctx.provider.clone(),
            agent_id: self.ctx.agent_id.clone(),
            access_token: format!("fixture:{}:{}", self.ctx.connection_id, now.timestamp()),
            expires_at: now + self.token_ttl,
        })
    }

    async fn fetch_listings(
        &self,
        handle: &ConnectionHandle,
        agent_id: &str,
    ) -> Result<Vec<ListingRecord>, SourceError> {
        ensure_handle_usable(handle, &self.ctx)?;
        let bundle = load_fixture_bundle(&self.bundle_path)
            .map_err(|e| SourceError::Network(format!("{e:#}")))?;
        debug!(
            fixture_id = %bundle.fixture_id,
            agent_id,
            listings = bundle.listings.len(),
            "loaded fixture bundle"
        );
        Ok(bundle
            .listings
            .into_iter()
            .map(|l| source_listing_to_record(&self.ctx.provider, l))
            .collect())
    }
}

#[derive(Debug, Serialize)]
struct TokenRequest<'a> {
    grant_type: &'static str,
    client_id: &'a str,
    client_secret: &'a str,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

pub fn classify_auth_status(status: StatusCode) -> SourceError {
    if status.is_client_error() {
        SourceError::Authentication(format!("token endpoint returned {status}"))
    } else {
        SourceError::Network(format!("token endpoint returned {status}"))
    }
}

pub fn classify_fetch_status(status: StatusCode) -> SourceError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SourceError::AuthExpired,
        _ => SourceError::Network(format!("listings endpoint returned {status}")),
    }
}

/// Client-credentials JSON feed: `POST {base}/oauth/token`, `GET {base}/agents/{agent}/listings`.
#[derive(Debug, Clone)]
pub struct HttpListingSource {
    ctx: SourceContext,
    base_url: String,
    client: reqwest::Client,
}

impl HttpListingSource {
    pub fn new(ctx: SourceContext, base_url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            ctx,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

#[async_trait]
impl ListingSource for HttpListingSource {
    fn provider(&self) -> &str {
        &self.ctx.provider
    }

    async fn authenticate(
        &self,
        credentials: &Credentials,
    ) -> Result<ConnectionHandle, SourceError> {
        let resp = self
            .client
            .post(self.url("oauth/token"))
            .json(&TokenRequest {
                grant_type: "client_credentials",
                client_id: &credentials.client_id,
                client_secret: &credentials.client_secret,
            })
            .send()
            .await
            .map_err(|e| SourceError::Network(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(classify_auth_status(status));
        }
        let token: TokenResponse = resp
            .json()
            .await
            .map_err(|e| SourceError::Decode(e.to_string()))?;

        info!(
            connection_id = %self.ctx.connection_id,
            expires_in = token.expires_in,
            "authenticated listing source"
        );
        Ok(ConnectionHandle {
            connection_id: self.ctx.connection_id.clone(),
            provider: self.ctx.provider.clone(),
            agent_id: self.ctx.agent_id.clone(),
            access_token: token.access_token,
            expires_at: Utc::now() + Duration::seconds(token.expires_in.max(0)),
        })
    }

    async fn fetch_listings(
        &self,
        handle: &ConnectionHandle,
        agent_id: &str,
    ) -> Result<Vec<ListingRecord>, SourceError> {
        ensure_handle_usable(handle, &self.ctx)?;
        let resp = self
            .client
            .get(self.url(&format!("agents/{agent_id}/listings")))
            .bearer_auth(&handle.access_token)
            .send()
            .await
            .map_err(|e| SourceError::Network(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(classify_fetch_status(status));
        }
        let envelope: ListingsEnvelope = resp
            .json()
            .await
            .map_err(|e| SourceError::Decode(e.to_string()))?;

        Ok(envelope
            .listings
            .into_iter()
            .map(|l| source_listing_to_record(&self.ctx.provider, l))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> SourceContext {
        SourceContext {
            connection_id: "demo-mls".into(),
            provider: "demo".into(),
            agent_id: "agent-1".into(),
        }
    }

    fn listing_json() -> serde_json::Value {
        serde_json::json!({
            "mls_id": "X-100",
            "mls_number": "MLS100",
            "address": {
                "street": "12 Elm St",
                "city": "Portland",
                "state": "OR",
                "postal_code": "97201"
            },
            "list_price": 525000.0,
            "bedrooms": 3,
            "status": "Active Under Contract",
            "public_remarks": "   ",
            "photos": [
                {"url": "photos/b.jpg", "order": 2},
                {"url": "photos/a.jpg", "caption": " Front ", "order": 1},
                {"url": "  "},
                {"url": "photos/c.jpg"}
            ]
        })
    }

    #[test]
    fn normalizes_payload_into_record() {
        let listing: SourceListing = serde_json::from_value(listing_json()).unwrap();
        let record = source_listing_to_record("demo", listing);

        assert_eq!(record.listing_id, ListingRecord::deterministic_id("demo", "X-100"));
        assert_eq!(record.status, ListingStatus::Pending);
        assert_eq!(record.description, None);
        assert_eq!(record.address.country, "US");
        assert_eq!(record.facts.bedrooms, Some(3));
        assert!(record.synced_at.is_none());

        let urls: Vec<_> = record.photos.iter().map(|p| p.source_url.as_str()).collect();
        assert_eq!(urls, vec!["photos/a.jpg", "photos/b.jpg", "photos/c.jpg"]);
        let orders: Vec<_> = record.photos.iter().map(|p| p.order).collect();
        assert_eq!(orders, vec![0, 1, 2]);
        assert_eq!(record.photos[0].caption.as_deref(), Some("Front"));
        assert!(record.photos.iter().all(|p| p.stored_url.is_none()));
    }

    #[test]
    fn status_codes_map_to_error_taxonomy() {
        assert!(matches!(
            classify_fetch_status(StatusCode::UNAUTHORIZED),
            SourceError::AuthExpired
        ));
        assert!(matches!(
            classify_fetch_status(StatusCode::BAD_GATEWAY),
            SourceError::Network(_)
        ));
        assert!(matches!(
            classify_auth_status(StatusCode::UNAUTHORIZED),
            SourceError::Authentication(_)
        ));
        assert!(matches!(
            classify_auth_status(StatusCode::SERVICE_UNAVAILABLE),
            SourceError::Network(_)
        ));
    }

    #[tokio::test]
    async fn fixture_source_rejects_missing_credentials() {
        let source = FixtureListingSource::new(ctx(), "does-not-matter.json");
        let err = source
            .authenticate(&Credentials {
                client_id: "".into(),
                client_secret: "s".into(),
            })
            .await
            .expect_err("empty client id");
        assert!(matches!(err, SourceError::Authentication(_)));
    }

    #[tokio::test]
    async fn fixture_source_round_trip_and_expiry() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("listings.json");
        let bundle = serde_json::json!({
            "fixture_id": "t",
            "provider": "demo",
            "captured_at": "2026-10-01T12:00:00Z",
            "listings": [listing_json()]
        });
        std::fs::write(&path, serde_json::to_vec(&bundle).unwrap()).unwrap();

        let source = FixtureListingSource::new(ctx(), &path);
        let creds = Credentials {
            client_id: "id".into(),
            client_secret: "secret".into(),
        };
        let handle = source.authenticate(&creds).await.expect("auth");
        assert_eq!(handle.agent_id, "agent-1");
        let listings = source.fetch_listings(&handle, "agent-1").await.expect("fetch");
        assert_eq!(listings.len(), 1);

        let expired = FixtureListingSource::new(ctx(), &path).with_token_ttl(Duration::zero());
        let stale = expired.authenticate(&creds).await.expect("auth");
        assert!(matches!(
            expired.fetch_listings(&stale, "agent-1").await,
            Err(SourceError::AuthExpired)
        ));
    }

    #[tokio::test]
    async fn fixture_source_reports_missing_bundle_as_network_error() {
        let source = FixtureListingSource::new(ctx(), "/nonexistent/listings.json");
        let handle = source
            .authenticate(&Credentials {
                client_id: "id".into(),
                client_secret: "secret".into(),
            })
            .await
            .unwrap();
        assert!(matches!(
            source.fetch_listings(&handle, "agent-1").await,
            Err(SourceError::Network(_))
        ));
    }

    async fn serve(app: axum::Router) -> String {
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0))
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });
        format!("http://{addr}")
    }

    fn feed_server() -> axum::Router {
        use axum::extract::Path as UrlPath;
        use axum::http::{header::AUTHORIZATION, HeaderMap};
        use axum::routing::{get, post};
        use axum::Json;

        axum::Router::new()
            .route(
                "/oauth/token",
                post(|Json(body): Json<serde_json::Value>| async move {
                    if body["grant_type"] != "client_credentials"
                        || body["client_id"] != "id"
                        || body["client_secret"] != "secret"
                    {
                        return (StatusCode::BAD_REQUEST, Json(serde_json::json!({})));
                    }
                    (
                        StatusCode::OK,
                        Json(serde_json::json!({"access_token": "tok-1", "expires_in": 3600})),
                    )
                }),
            )
            .route(
                "/denied/oauth/token",
                post(|| async { StatusCode::UNAUTHORIZED }),
            )
            .route(
                "/agents/{agent}/listings",
                get(|UrlPath(agent): UrlPath<String>, headers: HeaderMap| async move {
                    let bearer = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());
                    match (agent.as_str(), bearer) {
                        (_, bearer) if bearer != Some("Bearer tok-1") => {
                            (StatusCode::UNAUTHORIZED, "revoked".to_string())
                        }
                        ("agent-1", _) => (
                            StatusCode::OK,
                            serde_json::json!({ "listings": [listing_json()] }).to_string(),
                        ),
                        ("garbled", _) => (StatusCode::OK, "{\"listings\": 7".to_string()),
                        _ => (StatusCode::SERVICE_UNAVAILABLE, "maintenance".to_string()),
                    }
                }),
            )
    }

    fn creds() -> Credentials {
        Credentials {
            client_id: "id".into(),
            client_secret: "secret".into(),
        }
    }

    fn handle_with_token(token: &str) -> ConnectionHandle {
        ConnectionHandle {
            connection_id: "demo-mls".into(),
            provider: "demo".into(),
            agent_id: "agent-1".into(),
            access_token: token.into(),
            expires_at: Utc::now() + Duration::hours(1),
        }
    }

    #[tokio::test]
    async fn http_source_exchanges_credentials_and_reads_listing_envelope() {
        let base = serve(feed_server()).await;
        let source = HttpListingSource::new(ctx(), format!("{base}/"), reqwest::Client::new());

        let before = Utc::now();
        let handle = source.authenticate(&creds()).await.expect("token");
        assert_eq!(handle.access_token, "tok-1");
        assert_eq!(handle.connection_id, "demo-mls");
        assert!(handle.expires_at >= before + Duration::seconds(3600));
        assert!(handle.expires_at <= Utc::now() + Duration::seconds(3600));

        let listings = source.fetch_listings(&handle, "agent-1").await.expect("listings");
        assert_eq!(listings.len(), 1);
        assert_eq!(listings[0].listing_id, ListingRecord::deterministic_id("demo", "X-100"));
        assert_eq!(listings[0].provider, "demo");
        assert_eq!(listings[0].photos.len(), 3);
    }

    #[tokio::test]
    async fn http_source_maps_endpoint_failures() {
        let base = serve(feed_server()).await;

        let denied = HttpListingSource::new(ctx(), format!("{base}/denied"), reqwest::Client::new());
        assert!(matches!(
            denied.authenticate(&creds()).await,
            Err(SourceError::Authentication(_))
        ));

        let source = HttpListingSource::new(ctx(), base, reqwest::Client::new());
        assert!(matches!(
            source.fetch_listings(&handle_with_token("stale"), "agent-1").await,
            Err(SourceError::AuthExpired)
        ));
        assert!(matches!(
            source.fetch_listings(&handle_with_token("tok-1"), "agent-2").await,
            Err(SourceError::Network(ref msg)) if msg.contains("503")
        ));
        assert!(matches!(
            source.fetch_listings(&handle_with_token("tok-1"), "garbled").await,
            Err(SourceError::Decode(_))
        ));
    }
}
