//! src/services/resource_service.rs
//!
//! ResourceService — the operations behind the `/api/resources` and
//! `/admin/resources` routes. Reads never trigger link refreshes; only
//! `download` and `force_refresh_all` go through the lifecycle manager.

use crate::{
    models::resource::{ResourcePatch, ResourceRecord, ResourceStats, SignedUrl},
    services::{
        object_gateway::{GatewayError, ObjectStoreGateway},
        resource_store::{ResourceStore, StoreError},
        url_lifecycle::{LifecycleError, UrlLifecycleManager},
    },
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("resource `{0}` not found")]
    NotFound(Uuid),
    #[error("no download link available: {0}")]
    SigningFailed(String),
    #[error("storage failure: {0}")]
    PersistenceFailed(String),
    #[error("object key `{0}` is already registered")]
    AlreadyExists(String),
    #[error("{0}")]
    InvalidInput(String),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

pub type ResourceResult<T> = Result<T, ResourceError>;

impl From<StoreError> for ResourceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => ResourceError::NotFound(id),
            StoreError::DuplicateKey(key) => ResourceError::AlreadyExists(key),
            StoreError::Sqlx(err) => ResourceError::PersistenceFailed(err.to_string()),
            StoreError::Migrate(err) => ResourceError::PersistenceFailed(err.to_string()),
        }
    }
}

impl From<LifecycleError> for ResourceError {
    fn from(err: LifecycleError) -> Self {
        match err {
            LifecycleError::NotFound(id) => ResourceError::NotFound(id),
            err @ LifecycleError::SigningFailed { .. } => {
                ResourceError::SigningFailed(err.to_string())
            }
            err @ LifecycleError::PersistenceFailed { .. } => {
                ResourceError::PersistenceFailed(err.to_string())
            }
        }
    }
}

/// Response of a successful download request.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DownloadLink {
    pub url: String,
    pub expires_at: DateTime<Utc>,
    /// New counter value; `None` if the increment could not be recorded.
    pub download_count: Option<i64>,
}

/// Summary of an administrative refresh.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RefreshSummary {
    pub examined: usize,
    pub refreshed: usize,
    pub failed: usize,
}

/// Descriptive fields supplied with an upload.
#[derive(Debug, Clone)]
pub struct NewResource {
    pub title: String,
    pub category: String,
    pub description: Option<String>,
    pub object_key: String,
    pub content_type: Option<String>,
    pub size_bytes: i64,
}

#[derive(Clone)]
pub struct ResourceService {
    store: Arc<dyn ResourceStore>,
    gateway: Arc<dyn ObjectStoreGateway>,
    lifecycle: UrlLifecycleManager,
    page_size: usize,
}

impl ResourceService {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        gateway: Arc<dyn ObjectStoreGateway>,
        lifecycle: UrlLifecycleManager,
    ) -> Self {
        let page_size = lifecycle.config().sweep_batch_size.max(1);
        Self {
            store,
            gateway,
            lifecycle,
            page_size,
        }
    }

    pub fn lifecycle(&self) -> &UrlLifecycleManager {
        &self.lifecycle
    }

    /// All records, or only active ones. Does not touch links; links minted
    /// but not yet persisted are shown, as in [`get`](Self::get).
    pub async fn list(&self, active_only: bool) -> ResourceResult<Vec<ResourceRecord>> {
        let records = self.store.list(active_only).await?;
        Ok(records
            .into_iter()
            .map(|record| self.lifecycle.overlay_unsaved(record))
            .collect())
    }

    /// Content type recorded for the resource stored under `object_key`.
    pub async fn content_type_for(&self, object_key: &str) -> ResourceResult<Option<String>> {
        Ok(self
            .store
            .load_by_key(object_key)
            .await?
            .and_then(|record| record.content_type))
    }

    /// The record as stored; link freshness is not checked.
    pub async fn get(&self, id: Uuid) -> ResourceResult<ResourceRecord> {
        Ok(self.lifecycle.overlay_unsaved(self.store.load(id).await?))
    }

    /// Hand out a usable link and count the download.
    ///
    /// The counter increment is best effort: once a link was obtained the
    /// download succeeds even if the increment fails.
    pub async fn download(&self, id: Uuid) -> ResourceResult<DownloadLink> {
        let record = self.store.load(id).await?;
        if !record.is_active {
            return Err(ResourceError::NotFound(id));
        }

        let SignedUrl { url, expires_at } = self.lifecycle.get_fresh_url(&record).await?;

        let download_count = match self.store.increment_download_count(id).await {
            Ok(count) => Some(count),
            Err(err) => {
                warn!(resource_id = %id, error = %err, "recording download failed");
                None
            }
        };
        debug!(resource_id = %id, ?download_count, "download link issued");

        Ok(DownloadLink {
            url,
            expires_at,
            download_count,
        })
    }

    /// Aggregate counters over every record.
    pub async fn stats(&self) -> ResourceResult<ResourceStats> {
        let records = self.store.list(false).await?;
        Ok(ResourceStats::from_records(&records))
    }

    /// Sweep every active record now, page by page.
    pub async fn force_refresh_all(&self) -> ResourceResult<RefreshSummary> {
        let mut summary = RefreshSummary {
            examined: 0,
            refreshed: 0,
            failed: 0,
        };
        let mut offset = 0;
        loop {
            let page = self.store.load_active_batch(self.page_size, offset).await?;
            let report = self.lifecycle.sweep_stale(&page).await;
            summary.examined += page.len();
            summary.refreshed += report.refreshed.len();
            summary.failed += report.failed.len();
            if page.len() < self.page_size {
                break;
            }
            offset += page.len();
        }
        info!(
            examined = summary.examined,
            refreshed = summary.refreshed,
            failed = summary.failed,
            "forced link refresh finished"
        );
        Ok(summary)
    }

    /// Register an uploaded object and sign its first link.
    ///
    /// The row is inserted first and `publish` (which makes the payload visible
    /// under its key) runs only once the insert succeeded. A second upload of
    /// a registered key therefore fails before it can replace or remove the
    /// first one's payload. When `publish` fails the row is removed again.
    ///
    /// A signing failure is logged, not returned: the record keeps a null link,
    /// which counts as stale, so the scheduler picks it up.
    pub async fn register_upload<F>(
        &self,
        new: NewResource,
        publish: F,
    ) -> ResourceResult<ResourceRecord>
    where
        F: Future<Output = Result<(), GatewayError>> + Send,
    {
        let title = new.title.trim();
        let category = new.category.trim();
        if title.is_empty() {
            return Err(ResourceError::InvalidInput("title must not be empty".into()));
        }
        if category.is_empty() {
            return Err(ResourceError::InvalidInput(
                "category must not be empty".into(),
            ));
        }

        let mut record = ResourceRecord::new(
            title,
            category,
            new.object_key,
            new.content_type,
            new.size_bytes,
        );
        record.description = new.description.filter(|d| !d.trim().is_empty());
        self.store.save(&record).await?;

        if let Err(err) = publish.await {
            if let Err(cleanup) = self.store.remove(record.id).await {
                warn!(resource_id = %record.id, error = %cleanup, "removing unpublished resource failed");
            }
            return Err(err.into());
        }
        info!(resource_id = %record.id, object_key = %record.object_key, "resource registered");

        match self.lifecycle.refresh(&record).await {
            Ok(signed) => record.apply_signed(&signed, Utc::now()),
            Err(err) => warn!(resource_id = %record.id, error = %err, "initial signing failed"),
        }
        Ok(record)
    }

    /// Edit descriptive fields and the active flag. Link fields are untouched.
    pub async fn update(&self, id: Uuid, patch: ResourcePatch) -> ResourceResult<ResourceRecord> {
        let mut record = self.store.load(id).await?;
        if let Some(title) = patch.title {
            if title.trim().is_empty() {
                return Err(ResourceError::InvalidInput("title must not be empty".into()));
            }
            record.title = title.trim().to_string();
        }
        if let Some(category) = patch.category {
            if category.trim().is_empty() {
                return Err(ResourceError::InvalidInput(
                    "category must not be empty".into(),
                ));
            }
            record.category = category.trim().to_string();
        }
        if let Some(description) = patch.description {
            record.description = Some(description).filter(|d| !d.trim().is_empty());
        }
        if let Some(is_active) = patch.is_active {
            record.is_active = is_active;
        }
        record.updated_at = Utc::now();
        self.store.update_details(&record).await?;
        Ok(self.lifecycle.overlay_unsaved(record))
    }

    /// Soft delete: hide from public listings, keep history.
    pub async fn deactivate(&self, id: Uuid) -> ResourceResult<ResourceRecord> {
        self.update(
            id,
            ResourcePatch {
                is_active: Some(false),
                ..ResourcePatch::default()
            },
        )
        .await
    }

    /// Delete the stored object, then the row. An object that is already gone
    /// does not block row removal.
    pub async fn purge(&self, id: Uuid) -> ResourceResult<()> {
        let record = self.store.load(id).await?;
        match self.gateway.delete(&record.object_key).await {
            Ok(()) => {}
            Err(GatewayError::ObjectNotFound(key)) => {
                debug!(object_key = %key, "object already missing, removing row");
            }
            Err(err) => return Err(err.into()),
        }
        self.store.remove(id).await?;
        info!(resource_id = %id, object_key = %record.object_key, "resource purged");
        Ok(())
    }
}
