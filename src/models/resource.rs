//! Represents a downloadable resource backed by an object in the object store.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::BTreeMap;
use uuid::Uuid;

/// A published resource (slide deck, CV, archive...) and the state of its
/// current signed download link.
///
/// `signed_url` and `url_expires_at` are written only by the URL lifecycle
/// manager; `download_count` only by the download path.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct ResourceRecord {
    /// Primary key, assigned at upload time.
    pub id: Uuid,

    /// Human readable title shown in listings.
    pub title: String,

    /// Optional longer description.
    pub description: Option<String>,

    /// Free-form grouping used by the stats endpoint (e.g. "cv", "talks").
    pub category: String,

    /// Object store key. Immutable after creation.
    pub object_key: String,

    /// Original filename of the uploaded file.
    pub file_name: String,

    /// Content type (MIME type) captured at upload.
    pub content_type: Option<String>,

    /// Size in bytes.
    pub size_bytes: i64,

    /// Current time-limited download URL, `None` until first signed.
    pub signed_url: Option<String>,

    /// Instant the current `signed_url` stops working.
    pub url_expires_at: Option<DateTime<Utc>>,

    /// When `signed_url` was last written.
    pub last_refreshed_at: Option<DateTime<Utc>>,

    /// Number of successful downloads.
    pub download_count: i64,

    /// Soft-delete flag.
    pub is_active: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ResourceRecord {
    /// Build a fresh, unsigned record for an object that was just written.
    pub fn new(
        title: impl Into<String>,
        category: impl Into<String>,
        object_key: impl Into<String>,
        content_type: Option<String>,
        size_bytes: i64,
    ) -> Self {
        let object_key = object_key.into();
        let file_name = object_key
            .rsplit('/')
            .next()
            .unwrap_or(&object_key)
            .to_string();
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            description: None,
            category: category.into(),
            object_key,
            file_name,
            content_type,
            size_bytes,
            signed_url: None,
            url_expires_at: None,
            last_refreshed_at: None,
            download_count: 0,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    /// True when the URL is missing or expires within `buffer` of `now`.
    pub fn is_stale(&self, now: DateTime<Utc>, buffer: Duration) -> bool {
        match (&self.signed_url, self.url_expires_at) {
            (Some(_), Some(expires_at)) => now >= expires_at - buffer,
            _ => true,
        }
    }

    /// The current URL if it has not expired yet, ignoring the refresh buffer.
    pub fn usable_url(&self, now: DateTime<Utc>) -> Option<SignedUrl> {
        match (&self.signed_url, self.url_expires_at) {
            (Some(url), Some(expires_at)) if expires_at > now => Some(SignedUrl {
                url: url.clone(),
                expires_at,
            }),
            _ => None,
        }
    }

    /// Overwrite the URL fields with a newly signed link.
    pub fn apply_signed(&mut self, signed: &SignedUrl, refreshed_at: DateTime<Utc>) {
        self.signed_url = Some(signed.url.clone());
        self.url_expires_at = Some(signed.expires_at);
        self.last_refreshed_at = Some(refreshed_at);
        self.updated_at = refreshed_at;
    }
}

/// A signed link handed out by the object store.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SignedUrl {
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

/// Editable descriptive fields. URL and counter fields cannot be edited.
#[derive(Deserialize, Clone, Debug, Default)]
pub struct ResourcePatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub category: Option<String>,
    pub is_active: Option<bool>,
}

/// Per-category aggregate in [`ResourceStats`].
#[derive(Serialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct CategoryStats {
    pub resources: u64,
    pub downloads: i64,
}

/// Aggregate counters over all stored resources.
#[derive(Serialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct ResourceStats {
    pub total_resources: u64,
    pub active_resources: u64,
    pub total_downloads: i64,
    pub by_category: BTreeMap<String, CategoryStats>,
}

impl ResourceStats {
    /// Fold a set of records into totals.
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a ResourceRecord>) -> Self {
        let mut stats = Self::default();
        for record in records {
            stats.total_resources += 1;
            if record.is_active {
                stats.active_resources += 1;
            }
            stats.total_downloads += record.download_count;
            let entry = stats.by_category.entry(record.category.clone()).or_default();
            entry.resources += 1;
            entry.downloads += record.download_count;
        }
        stats
    }
}
