//! src/services/resource_store.rs
//!
//! Durable row storage for resource metadata. The lifecycle manager and the
//! resource service depend on the `ResourceStore` trait; `SqliteResourceStore`
//! backs it with the `resources` table.

use crate::models::resource::{ResourceRecord, SignedUrl};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{SqlitePool, migrate::Migrator};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const RESOURCE_COLUMNS: &str = "id, title, description, category, object_key, file_name, \
     content_type, size_bytes, signed_url, url_expires_at, last_refreshed_at, \
     download_count, is_active, created_at, updated_at";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("resource `{0}` not found")]
    NotFound(Uuid),
    #[error("object key `{0}` is already registered")]
    DuplicateKey(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn load(&self, id: Uuid) -> StoreResult<ResourceRecord>;

    /// Active records ordered by `(created_at, id)`, so offsets are stable.
    /// The record registered for `object_key`, if any.
    async fn load_by_key(&self, object_key: &str) -> StoreResult<Option<ResourceRecord>>;

    async fn load_active_batch(&self, limit: usize, offset: usize)
    -> StoreResult<Vec<ResourceRecord>>;

    async fn list(&self, active_only: bool) -> StoreResult<Vec<ResourceRecord>>;

    /// Upsert every column of `record`.
    async fn save(&self, record: &ResourceRecord) -> StoreResult<()>;

    /// Write only the URL columns. Used by the refresh path.
    async fn save_signed_url(
        &self,
        id: Uuid,
        signed: &SignedUrl,
        refreshed_at: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// Write only the descriptive columns and `is_active`.
    async fn update_details(&self, record: &ResourceRecord) -> StoreResult<()>;

    /// Atomically bump the download counter, returning the new value.
    async fn increment_download_count(&self, id: Uuid) -> StoreResult<i64>;

    async fn remove(&self, id: Uuid) -> StoreResult<()>;
}

#[derive(Clone)]
pub struct SqliteResourceStore {
    pub db: Arc<SqlitePool>,
}

impl SqliteResourceStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Apply pending migrations from `migrations/`, embedded at build time.
    /// Already-applied versions are skipped.
    pub async fn migrate(db: &SqlitePool) -> StoreResult<()> {
        tracing::info!("Running {} known migrations...", MIGRATOR.iter().count());
        MIGRATOR.run(db).await?;
        Ok(())
    }
}

#[async_trait]
impl ResourceStore for SqliteResourceStore {
    async fn load(&self, id: Uuid) -> StoreResult<ResourceRecord> {
        sqlx::query_as::<_, ResourceRecord>(&format!(
            "SELECT {RESOURCE_COLUMNS} FROM resources WHERE id = ?"
        ))
        .bind(id)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => StoreError::NotFound(id),
            other => StoreError::Sqlx(other),
        })
    }

    async fn load_by_key(&self, object_key: &str) -> StoreResult<Option<ResourceRecord>> {
        let row = sqlx::query_as::<_, ResourceRecord>(&format!(
            "SELECT {RESOURCE_COLUMNS} FROM resources WHERE object_key = ?"
        ))
        .bind(object_key)
        .fetch_optional(&*self.db)
        .await?;
        Ok(row)
    }

    async fn load_active_batch(
        &self,
        limit: usize,
        offset: usize,
    ) -> StoreResult<Vec<ResourceRecord>> {
        let rows = sqlx::query_as::<_, ResourceRecord>(&format!(
            "SELECT {RESOURCE_COLUMNS} FROM resources
             WHERE is_active = 1
             ORDER BY created_at ASC, id ASC
             LIMIT ? OFFSET ?"
        ))
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&*self.db)
        .await?;
        Ok(rows)
    }

    async fn list(&self, active_only: bool) -> StoreResult<Vec<ResourceRecord>> {
        let filter = if active_only { "WHERE is_active = 1" } else { "" };
        let rows = sqlx::query_as::<_, ResourceRecord>(&format!(
            "SELECT {RESOURCE_COLUMNS} FROM resources {filter} ORDER BY created_at DESC, id ASC"
        ))
        .fetch_all(&*self.db)
        .await?;
        Ok(rows)
    }

    async fn save(&self, record: &ResourceRecord) -> StoreResult<()> {
        let result = sqlx::query(&format!(
            "INSERT INTO resources ({RESOURCE_COLUMNS})
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                description = excluded.description,
                category = excluded.category,
                content_type = excluded.content_type,
                size_bytes = excluded.size_bytes,
                signed_url = excluded.signed_url,
                url_expires_at = excluded.url_expires_at,
                last_refreshed_at = excluded.last_refreshed_at,
                download_count = excluded.download_count,
                is_active = excluded.is_active,
                updated_at = excluded.updated_at"
        ))
        .bind(record.id)
        .bind(&record.title)
        .bind(&record.description)
        .bind(&record.category)
        .bind(&record.object_key)
        .bind(&record.file_name)
        .bind(&record.content_type)
        .bind(record.size_bytes)
        .bind(&record.signed_url)
        .bind(record.url_expires_at)
        .bind(record.last_refreshed_at)
        .bind(record.download_count)
        .bind(record.is_active)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&*self.db)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => {
                Err(StoreError::DuplicateKey(record.object_key.clone()))
            }
            Err(err) => Err(StoreError::Sqlx(err)),
        }
    }

    async fn save_signed_url(
        &self,
        id: Uuid,
        signed: &SignedUrl,
        refreshed_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE resources
             SET signed_url = ?, url_expires_at = ?, last_refreshed_at = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(&signed.url)
        .bind(signed.expires_at)
        .bind(refreshed_at)
        .bind(refreshed_at)
        .bind(id)
        .execute(&*self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn update_details(&self, record: &ResourceRecord) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE resources
             SET title = ?, description = ?, category = ?, is_active = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(&record.title)
        .bind(&record.description)
        .bind(&record.category)
        .bind(record.is_active)
        .bind(record.updated_at)
        .bind(record.id)
        .execute(&*self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(record.id));
        }
        Ok(())
    }

    async fn increment_download_count(&self, id: Uuid) -> StoreResult<i64> {
        sqlx::query_scalar::<_, i64>(
            "UPDATE resources SET download_count = download_count + 1
             WHERE id = ?
             RETURNING download_count",
        )
        .bind(id)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => StoreError::NotFound(id),
            other => StoreError::Sqlx(other),
        })
    }

    async fn remove(&self, id: Uuid) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM resources WHERE id = ?")
            .bind(id)
            .execute(&*self.db)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn store() -> SqliteResourceStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        SqliteResourceStore::migrate(&pool).await.unwrap();
        SqliteResourceStore::new(Arc::new(pool))
    }

    fn record(key: &str, created_offset_secs: i64) -> ResourceRecord {
        let mut record = ResourceRecord::new(key, "talks", key, Some("application/pdf".into()), 42);
        record.created_at = record.created_at + Duration::seconds(created_offset_secs);
        record
    }

    #[tokio::test]
    async fn save_and_load_round_trip() {
        let store = store().await;
        let mut original = record("deck.pdf", 0);
        original.description = Some("slides".into());
        store.save(&original).await.unwrap();

        let loaded = store.load(original.id).await.unwrap();
        assert_eq!(loaded.object_key, "deck.pdf");
        assert_eq!(loaded.description.as_deref(), Some("slides"));
        assert!(loaded.signed_url.is_none());
        assert!(loaded.is_active);

        let missing = Uuid::new_v4();
        assert!(matches!(
            store.load(missing).await,
            Err(StoreError::NotFound(id)) if id == missing
        ));
    }

    #[tokio::test]
    async fn lookup_by_object_key() {
        let store = store().await;
        let saved = record("talks/keynote.pdf", 0);
        store.save(&saved).await.unwrap();

        let found = store.load_by_key("talks/keynote.pdf").await.unwrap().unwrap();
        assert_eq!(found.id, saved.id);
        assert_eq!(found.content_type.as_deref(), Some("application/pdf"));
        assert!(store.load_by_key("talks/other.pdf").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn migrating_twice_is_harmless() {
        let store = store().await;
        SqliteResourceStore::migrate(&store.db).await.unwrap();
        store.save(&record("a.pdf", 0)).await.unwrap();
        assert_eq!(store.list(false).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_object_key_is_rejected() {
        let store = store().await;
        store.save(&record("deck.pdf", 0)).await.unwrap();
        let err = store.save(&record("deck.pdf", 1)).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey(key) if key == "deck.pdf"));
    }

    #[tokio::test]
    async fn active_batches_are_paged_in_creation_order() {
        let store = store().await;
        let mut ids = Vec::new();
        for i in 0..5 {
            let rec = record(&format!("file-{i}.pdf"), i);
            ids.push(rec.id);
            store.save(&rec).await.unwrap();
        }
        let mut inactive = record("hidden.pdf", 10);
        inactive.is_active = false;
        store.save(&inactive).await.unwrap();

        let first = store.load_active_batch(2, 0).await.unwrap();
        let second = store.load_active_batch(2, 2).await.unwrap();
        let third = store.load_active_batch(2, 4).await.unwrap();
        let paged: Vec<Uuid> = first.iter().chain(&second).chain(&third).map(|r| r.id).collect();
        assert_eq!(paged, ids);
        assert_eq!(third.len(), 1);

        assert_eq!(store.list(true).await.unwrap().len(), 5);
        assert_eq!(store.list(false).await.unwrap().len(), 6);
    }

    #[tokio::test]
    async fn signed_url_write_leaves_counter_alone() {
        let store = store().await;
        let rec = record("deck.pdf", 0);
        store.save(&rec).await.unwrap();

        assert_eq!(store.increment_download_count(rec.id).await.unwrap(), 1);
        assert_eq!(store.increment_download_count(rec.id).await.unwrap(), 2);

        let refreshed_at = Utc::now();
        let signed = SignedUrl {
            url: "http://files/deck.pdf?sig".into(),
            expires_at: refreshed_at + Duration::hours(1),
        };
        store
            .save_signed_url(rec.id, &signed, refreshed_at)
            .await
            .unwrap();

        let loaded = store.load(rec.id).await.unwrap();
        assert_eq!(loaded.download_count, 2);
        assert_eq!(loaded.signed_url.as_deref(), Some(signed.url.as_str()));
        assert_eq!(loaded.url_expires_at, Some(signed.expires_at));
    }

    #[tokio::test]
    async fn update_details_and_remove() {
        let store = store().await;
        let mut rec = record("deck.pdf", 0);
        store.save(&rec).await.unwrap();

        rec.title = "Renamed".into();
        rec.is_active = false;
        store.update_details(&rec).await.unwrap();
        let loaded = store.load(rec.id).await.unwrap();
        assert_eq!(loaded.title, "Renamed");
        assert!(!loaded.is_active);

        store.remove(rec.id).await.unwrap();
        assert!(matches!(store.remove(rec.id).await, Err(StoreError::NotFound(_))));
        assert!(matches!(
            store.increment_download_count(rec.id).await,
            Err(StoreError::NotFound(_))
        ));
    }
}
