//! Core domain model for MLS listing import.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "mls-core";

pub const LISTING_RECORD_TYPE: &str = "Listing";
pub const CONNECTION_RECORD_TYPE: &str = "MLSConnection";

/// One triggered import run. Lives only for the duration of the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportJob {
    pub job_id: Uuid,
    pub external_connection_id: String,
    pub requested_at: DateTime<Utc>,
}

impl ImportJob {
    pub fn new(external_connection_id: impl Into<String>) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            external_connection_id: external_connection_id.into(),
            requested_at: Utc::now(),
        }
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub client_id: String,
    pub client_secret: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

/// Authenticated session against an external listing source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionHandle {
    pub connection_id: String,
    pub provider: String,
    pub agent_id: String,
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
}

impl ConnectionHandle {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Address {
    pub street: String,
    #[serde(default)]
    pub unit: Option<String>,
    pub city: String,
    pub state: String,
    pub postal_code: String,
    #[serde(default = "default_country")]
    pub country: String,
}

fn default_country() -> String {
    "US".to_string()
}

impl Address {
    pub fn one_line(&self) -> String {
        let street = match &self.unit {
            Some(unit) => format!("{} {}", self.street, unit),
            None => self.street.clone(),
        };
        format!("{}, {}, {} {}", street, self.city, self.state, self.postal_code)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PropertyFacts {
    pub property_type: Option<String>,
    pub bedrooms: Option<u32>,
    pub bathrooms: Option<f64>,
    pub square_feet: Option<u32>,
    pub lot_size_acres: Option<f64>,
    pub year_built: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingStatus {
    Active,
    ComingSoon,
    Pending,
    Sold,
    Expired,
    Withdrawn,
    Unknown,
}

impl ListingStatus {
    /// Maps provider status vocabulary onto the canonical set.
    pub fn normalize(raw: &str) -> Self {
        let lower = raw.trim().to_ascii_lowercase().replace(['_', '-'], " ");
        match lower.as_str() {
            "active" | "new" | "for sale" => Self::Active,
            "coming soon" => Self::ComingSoon,
            "pending" | "active under contract" | "under contract" | "contingent" => Self::Pending,
            "sold" | "closed" => Self::Sold,
            "expired" => Self::Expired,
            "withdrawn" | "canceled" | "cancelled" | "off market" => Self::Withdrawn,
            _ => Self::Unknown,
        }
    }
}

/// A photo attached to a listing. `stored_url` is `None` when local storage failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhotoRecord {
    pub source_url: String,
    pub stored_url: Option<String>,
    pub caption: Option<String>,
    pub order: u32,
}

impl PhotoRecord {
    pub fn display_url(&self) -> &str {
        self.stored_url.as_deref().unwrap_or(&self.source_url)
    }
}

/// Canonical imported listing as persisted in the key-value store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingRecord {
    pub listing_id: Uuid,
    pub provider: String,
    pub mls_id: String,
    pub mls_number: String,
    pub address: Address,
    pub price: f64,
    pub facts: PropertyFacts,
    pub status: ListingStatus,
    pub description: Option<String>,
    pub photos: Vec<PhotoRecord>,
    pub listed_at: Option<DateTime<Utc>>,
    pub synced_at: Option<DateTime<Utc>>,
}

impl ListingRecord {
    /// Stable id for a listing so re-imports overwrite the same item.
    pub fn deterministic_id(provider: &str, mls_id: &str) -> Uuid {
        Uuid::new_v5(&Uuid::NAMESPACE_URL, format!("mls:{provider}:{mls_id}").as_bytes())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportFailure {
    pub mls_number: String,
    pub error: String,
    pub attempts_made: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ImportResult {
    pub total_listings: usize,
    pub successful_imports: usize,
    pub failed_imports: usize,
    pub photos_stored: usize,
    pub photos_degraded: usize,
    pub errors: Vec<ImportFailure>,
}

pub fn listing_partition_key(agent_id: &str) -> String {
    format!("USER#{agent_id}")
}

pub fn listing_sort_key(listing_id: Uuid) -> String {
    format!("LISTING#{listing_id}")
}

pub const LISTING_SORT_PREFIX: &str = "LISTING#";

pub fn connection_sort_key(connection_id: &str) -> String {
    format!("MLS_CONNECTION#{connection_id}")
}

pub fn photo_blob_key(agent_id: &str, listing_id: Uuid, order: u32, extension: &str) -> String {
    let ext = extension.trim_start_matches('.').trim();
    let ext = if ext.is_empty() { "bin" } else { ext };
    format!("listings/{agent_id}/{listing_id}/photos/{order}.{ext}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn status_normalization_covers_provider_vocabulary() {
        assert_eq!(ListingStatus::normalize("Active"), ListingStatus::Active);
        assert_eq!(
            ListingStatus::normalize("Active Under Contract"),
            ListingStatus::Pending
        );
        assert_eq!(ListingStatus::normalize("CLOSED"), ListingStatus::Sold);
        assert_eq!(ListingStatus::normalize("coming_soon"), ListingStatus::ComingSoon);
        assert_eq!(ListingStatus::normalize("Canceled"), ListingStatus::Withdrawn);
        assert_eq!(ListingStatus::normalize("auction"), ListingStatus::Unknown);
    }

    #[test]
    fn photo_falls_back_to_source_url() {
        let mut photo = PhotoRecord {
            source_url: "https://mls.example/p/1.jpg".into(),
            stored_url: None,
            caption: None,
            order: 0,
        };
        assert_eq!(photo.display_url(), "https://mls.example/p/1.jpg");
        photo.stored_url = Some("https://cdn.example/listings/1.jpg".into());
        assert_eq!(photo.display_url(), "https://cdn.example/listings/1.jpg");
    }

    #[test]
    fn handle_expiry_is_inclusive() {
        let now = Utc::now();
        let handle = ConnectionHandle {
            connection_id: "c1".into(),
            provider: "demo".into(),
            agent_id: "agent-1".into(),
            access_token: "t".into(),
            expires_at: now,
        };
        assert!(handle.is_expired_at(now));
        assert!(!handle.is_expired_at(now - Duration::seconds(1)));
    }

    #[test]
    fn deterministic_ids_are_stable_per_provider() {
        let a = ListingRecord::deterministic_id("demo", "123");
        let b = ListingRecord::deterministic_id("demo", "123");
        let c = ListingRecord::deterministic_id("other", "123");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn keys_follow_partition_layout() {
        let id = Uuid::nil();
        assert_eq!(listing_partition_key("a1"), "USER#a1");
        assert!(listing_sort_key(id).starts_with(LISTING_SORT_PREFIX));
        assert_eq!(connection_sort_key("c1"), "MLS_CONNECTION#c1");
        assert_eq!(
            photo_blob_key("a1", id, 2, ".jpg"),
            format!("listings/a1/{id}/photos/2.jpg")
        );
        assert_eq!(
            photo_blob_key("a1", id, 0, ""),
            format!("listings/a1/{id}/photos/0.bin")
        );
    }

    #[test]
    fn credentials_debug_redacts_secret() {
        let creds = Credentials {
            client_id: "id".into(),
            client_secret: "hunter2".into(),
        };
        let rendered = format!("{creds:?}");
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn listing_status_serializes_snake_case() {
        let json = serde_json::to_string(&ListingStatus::ComingSoon).unwrap();
        assert_eq!(json, "\"coming_soon\"");
    }
}
