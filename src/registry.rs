//! Registry client
//!
//! Resolves a package id to its on-chain listing in two phases:
//! 1. Fetch the listing record (owning account, metadata URI and hash).
//!    Failure here means the package does not exist for us.
//! 2. Fetch the metadata document and check it hashes to the published
//!    metadata hash. Failure here degrades the listing to `metadata = None`.
//!
//! Resolved listings are cached per package with a TTL.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::digest::{hashes_match, sha256_hex};
use crate::types::{AppListing, PackageId, PackageMetadata};

/// The on-chain part of a listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingRecord {
    pub package_id: PackageId,
    pub owning_account: String,
    pub metadata_uri: String,
    pub metadata_hash: String,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RegistryError {
    #[error("package {0} not found")]
    NotFound(PackageId),

    #[error("registry unavailable: {0}")]
    Unavailable(String),

    #[error("metadata fetch failed: {0}")]
    Metadata(String),
}

/// Source of listing records and metadata documents
#[async_trait]
pub trait ChainSource: Send + Sync {
    /// The listing record for a package, `None` if it is not on-chain
    async fn listing_record(
        &self,
        package_id: &PackageId,
    ) -> Result<Option<ListingRecord>, RegistryError>;

    /// Every package id the chain currently lists
    async fn known_packages(&self) -> Result<Vec<PackageId>, RegistryError>;

    /// Raw bytes of the metadata document at `uri`
    async fn fetch_metadata(&self, uri: &str) -> Result<Vec<u8>, RegistryError>;
}

struct CachedListing {
    listing: AppListing,
    fetched_at: Instant,
}

/// Caching resolver over a [`ChainSource`]
pub struct RegistryClient {
    source: Arc<dyn ChainSource>,
    cache: DashMap<PackageId, CachedListing>,
    ttl: Duration,
}

impl RegistryClient {
    pub fn new(source: Arc<dyn ChainSource>, ttl: Duration) -> Self {
        Self {
            source,
            cache: DashMap::new(),
            ttl,
        }
    }

    /// Resolve a package to its listing
    pub async fn resolve(&self, package_id: &PackageId) -> Result<AppListing, RegistryError> {
        if let Some(listing) = self.cached(package_id) {
            return Ok(listing);
        }

        let record = match self.source.listing_record(package_id).await {
            Ok(Some(record)) => record,
            Ok(None) => return Err(RegistryError::NotFound(package_id.clone())),
            Err(e) => {
                warn!(package = %package_id, error = %e, "Listing record lookup failed");
                return Err(RegistryError::NotFound(package_id.clone()));
            }
        };

        let metadata = match self.fetch_verified_metadata(&record).await {
            Ok(metadata) => Some(metadata),
            Err(e) => {
                warn!(package = %package_id, error = %e, "Metadata unavailable, listing degraded");
                None
            }
        };

        let listing = AppListing {
            package_id: record.package_id,
            owning_account: record.owning_account,
            metadata_uri: record.metadata_uri,
            metadata_hash: record.metadata_hash,
            metadata,
            auto_update: false,
        };

        self.cache.insert(
            package_id.clone(),
            CachedListing {
                listing: listing.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(listing)
    }

    /// Resolve every package the chain knows about
    pub async fn list(&self) -> Result<BTreeMap<PackageId, AppListing>, RegistryError> {
        let known = self.source.known_packages().await?;
        let mut listings = BTreeMap::new();
        for package_id in known {
            match self.resolve(&package_id).await {
                Ok(listing) => {
                    listings.insert(package_id, listing);
                }
                Err(RegistryError::NotFound(_)) => {
                    debug!(package = %package_id, "Listed package no longer resolves, skipping");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(listings)
    }

    pub fn invalidate(&self, package_id: &PackageId) {
        self.cache.remove(package_id);
    }

    /// Drop the whole cache (re-index)
    pub fn invalidate_all(&self) {
        let dropped = self.cache.len();
        self.cache.clear();
        info!("Registry cache cleared ({} entries)", dropped);
    }

    fn cached(&self, package_id: &PackageId) -> Option<AppListing> {
        let entry = self.cache.get(package_id)?;
        if entry.fetched_at.elapsed() < self.ttl {
            return Some(entry.listing.clone());
        }
        drop(entry);
        self.cache.remove(package_id);
        None
    }

    async fn fetch_verified_metadata(
        &self,
        record: &ListingRecord,
    ) -> Result<PackageMetadata, RegistryError> {
        if record.metadata_uri.is_empty() {
            return Err(RegistryError::Metadata("empty metadata uri".to_string()));
        }
        let bytes = self.source.fetch_metadata(&record.metadata_uri).await?;
        let actual = sha256_hex(&bytes);
        if !hashes_match(&actual, &record.metadata_hash) {
            return Err(RegistryError::Metadata(format!(
                "metadata hash mismatch: published {}, fetched {}",
                record.metadata_hash, actual
            )));
        }
        serde_json::from_slice(&bytes).map_err(|e| RegistryError::Metadata(e.to_string()))
    }
}

/// [`ChainSource`] backed by a chain indexer's HTTP API
pub struct HttpChainSource {
    client: reqwest::Client,
    indexer_url: String,
    timeout: Duration,
}

impl HttpChainSource {
    pub fn new(indexer_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            indexer_url: indexer_url.into().trim_end_matches('/').to_string(),
            timeout,
        }
    }
}

#[async_trait]
impl ChainSource for HttpChainSource {
    async fn listing_record(
        &self,
        package_id: &PackageId,
    ) -> Result<Option<ListingRecord>, RegistryError> {
        let url = format!("{}/api/listings/{}", self.indexer_url, package_id);
        let response = self
            .client
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| RegistryError::Unavailable(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(RegistryError::Unavailable(format!(
                "HTTP {}",
                response.status()
            )));
        }
        let record = response
            .json::<ListingRecord>()
            .await
            .map_err(|e| RegistryError::Unavailable(e.to_string()))?;
        Ok(Some(record))
    }

    async fn known_packages(&self) -> Result<Vec<PackageId>, RegistryError> {
        let url = format!("{}/api/listings", self.indexer_url);
        let response = self
            .client
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| RegistryError::Unavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(RegistryError::Unavailable(format!(
                "HTTP {}",
                response.status()
            )));
        }
        let records = response
            .json::<Vec<ListingRecord>>()
            .await
            .map_err(|e| RegistryError::Unavailable(e.to_string()))?;
        Ok(records.into_iter().map(|r| r.package_id).collect())
    }

    async fn fetch_metadata(&self, uri: &str) -> Result<Vec<u8>, RegistryError> {
        let response = self
            .client
            .get(uri)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| RegistryError::Metadata(e.to_string()))?;

        if !response.status().is_success() {
            return Err(RegistryError::Metadata(format!("HTTP {}", response.status())));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| RegistryError::Metadata(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}
