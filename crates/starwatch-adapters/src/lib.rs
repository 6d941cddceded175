//! Snapshot sources (resolve the published data location, fetch the raw table) and the
//! record normalizer.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use starwatch_storage::{Deadline, FetchError, HttpFetcher};
use tracing::{debug, info};

pub mod normalize;

pub use normalize::{normalize, FieldMapping, NormalizeError, NormalizedBatch};

pub const CRATE_NAME: &str = "starwatch-adapters";

/// Metastore item for the CMS nursing home "Provider Information" dataset.
pub const CMS_PROVIDER_INFO_METADATA_URL: &str =
    "https://data.cms.gov/provider-data/api/1/metastore/schemas/dataset/items/4pq5-n9py";

/// Where the currently published snapshot lives and the date it was published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotLocation {
    pub uri: String,
    pub published_on: NaiveDate,
    pub title: Option<String>,
}

/// Raw table bytes as retrieved, stamped with the source's publication date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSnapshot {
    pub source_id: String,
    pub location: String,
    pub published_on: NaiveDate,
    pub fetched_at: DateTime<Utc>,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

/// Subset of the DCAT metadata document CMS publishes for each dataset.
#[derive(Debug, Clone, Deserialize)]
pub struct DatasetMetadata {
    pub title: Option<String>,
    pub modified: Option<String>,
    pub issued: Option<String>,
    #[serde(default)]
    pub distribution: Vec<Distribution>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Distribution {
    #[serde(rename = "mediaType")]
    pub media_type: Option<String>,
    #[serde(rename = "downloadURL")]
    pub download_url: Option<String>,
    pub format: Option<String>,
}

impl Distribution {
    fn is_csv(&self) -> bool {
        self.media_type
            .as_deref()
            .is_some_and(|m| m.eq_ignore_ascii_case("text/csv"))
            || self
                .format
                .as_deref()
                .is_some_and(|f| f.eq_ignore_ascii_case("csv"))
    }
}

/// Accepts `YYYY-MM-DD`, RFC 3339, or anything starting with a `YYYY-MM-DD` prefix.
pub fn parse_publication_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(date);
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.date_naive());
    }
    raw.get(..10)
        .and_then(|prefix| NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok())
}

impl DatasetMetadata {
    /// Pick the CSV distribution and publication date, or explain why the metadata is unusable.
    pub fn snapshot_location(&self) -> Result<SnapshotLocation, String> {
        let uri = self
            .distribution
            .iter()
            .filter(|d| d.is_csv())
            .find_map(|d| d.download_url.clone())
            .ok_or_else(|| "metadata has no text/csv distribution with a downloadURL".to_string())?;

        let published_on = self
            .modified
            .as_deref()
            .and_then(parse_publication_date)
            .or_else(|| self.issued.as_deref().and_then(parse_publication_date))
            .ok_or_else(|| "metadata has no readable publication date".to_string())?;

        Ok(SnapshotLocation {
            uri,
            published_on,
            title: self.title.clone(),
        })
    }

    pub fn parse(url: &str, body: &[u8]) -> Result<Self, FetchError> {
        serde_json::from_slice(body).map_err(|err| FetchError::Permanent {
            url: url.to_string(),
            attempts: 1,
            reason: format!("malformed dataset metadata: {err}"),
        })
    }
}

#[async_trait]
pub trait SnapshotSource: Send + Sync {
    fn source_id(&self) -> &str;

    /// Look up where the current snapshot is published. The location moves between
    /// releases, so it is never hardcoded.
    async fn resolve_snapshot_location(
        &self,
        deadline: Deadline,
    ) -> Result<SnapshotLocation, FetchError>;

    async fn fetch_snapshot(
        &self,
        location: &SnapshotLocation,
        deadline: Deadline,
    ) -> Result<RawSnapshot, FetchError>;
}

/// Live CMS Provider Data Catalog source.
#[derive(Debug, Clone)]
pub struct CmsProviderDataSource {
    metadata_url: String,
    http: Arc<HttpFetcher>,
}

impl CmsProviderDataSource {
    pub fn new(metadata_url: impl Into<String>, http: Arc<HttpFetcher>) -> Self {
        Self {
            metadata_url: metadata_url.into(),
            http,
        }
    }

    pub fn metadata_url(&self) -> &str {
        &self.metadata_url
    }
}

#[async_trait]
impl SnapshotSource for CmsProviderDataSource {
    fn source_id(&self) -> &str {
        "cms-provider-info"
    }

    async fn resolve_snapshot_location(
        &self,
        deadline: Deadline,
    ) -> Result<SnapshotLocation, FetchError> {
        let resp = self.http.fetch_bytes(&self.metadata_url, deadline).await?;
        let metadata = DatasetMetadata::parse(&resp.final_url, &resp.body)?;
        let location = metadata
            .snapshot_location()
            .map_err(|reason| FetchError::Permanent {
                url: resp.final_url.clone(),
                attempts: resp.attempts,
                reason,
            })?;
        info!(
            uri = %location.uri,
            published_on = %location.published_on,
            attempts = resp.attempts,
            "resolved snapshot location"
        );
        Ok(location)
    }

    async fn fetch_snapshot(
        &self,
        location: &SnapshotLocation,
        deadline: Deadline,
    ) -> Result<RawSnapshot, FetchError> {
        let resp = self.http.fetch_bytes(&location.uri, deadline).await?;
        info!(
            uri = %resp.final_url,
            bytes = resp.body.len(),
            attempts = resp.attempts,
            "fetched snapshot"
        );
        Ok(RawSnapshot {
            source_id: self.source_id().to_string(),
            location: resp.final_url,
            published_on: location.published_on,
            fetched_at: Utc::now(),
            content_type: resp.content_type,
            body: resp.body,
        })
    }
}

/// Offline source backed by a metadata JSON file whose `downloadURL` points at a CSV
/// relative to the metadata file. Used for fixture runs and tests.
#[derive(Debug, Clone)]
pub struct FixtureSnapshotSource {
    metadata_path: PathBuf,
}

impl FixtureSnapshotSource {
    pub fn new(metadata_path: impl Into<PathBuf>) -> Self {
        Self {
            metadata_path: metadata_path.into(),
        }
    }

    pub fn metadata_path(&self) -> &Path {
        &self.metadata_path
    }

    fn resolve_path(&self, uri: &str) -> PathBuf {
        let trimmed = uri.strip_prefix("file://").unwrap_or(uri);
        let path = Path::new(trimmed);
        if path.is_absolute() {
            return path.to_path_buf();
        }
        self.metadata_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(path)
    }

    async fn read(path: &Path) -> Result<Vec<u8>, FetchError> {
        tokio::fs::read(path)
            .await
            .map_err(|err| FetchError::Permanent {
                url: path.display().to_string(),
                attempts: 1,
                reason: err.to_string(),
            })
    }
}

#[async_trait]
impl SnapshotSource for FixtureSnapshotSource {
    fn source_id(&self) -> &str {
        "fixture-provider-info"
    }

    async fn resolve_snapshot_location(
        &self,
        _deadline: Deadline,
    ) -> Result<SnapshotLocation, FetchError> {
        let url = self.metadata_path.display().to_string();
        let body = Self::read(&self.metadata_path).await?;
        let metadata = DatasetMetadata::parse(&url, &body)?;
        let mut location = metadata
            .snapshot_location()
            .map_err(|reason| FetchError::Permanent {
                url: url.clone(),
                attempts: 1,
                reason,
            })?;
        location.uri = self.resolve_path(&location.uri).display().to_string();
        debug!(uri = %location.uri, published_on = %location.published_on, "resolved fixture snapshot");
        Ok(location)
    }

    async fn fetch_snapshot(
        &self,
        location: &SnapshotLocation,
        _deadline: Deadline,
    ) -> Result<RawSnapshot, FetchError> {
        let body = Self::read(Path::new(&location.uri)).await?;
        Ok(RawSnapshot {
            source_id: self.source_id().to_string(),
            location: location.uri.clone(),
            published_on: location.published_on,
            fetched_at: Utc::now(),
            content_type: Some("text/csv".to_string()),
            body,
        })
    }
}
