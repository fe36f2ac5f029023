//! In-memory doubles for the gateway and the store, shared by unit tests.

use crate::{
    models::resource::{ResourceRecord, SignedUrl},
    services::{
        object_gateway::{GatewayError, GatewayResult, ObjectStoreGateway},
        resource_store::{ResourceStore, StoreError, StoreResult},
    },
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::{
    collections::HashSet,
    sync::{
        Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration as StdDuration,
};
use uuid::Uuid;

/// Gateway that counts signing calls and can be told to fail per key.
#[derive(Default)]
pub struct MockGateway {
    pub sign_calls: AtomicUsize,
    pub delete_calls: AtomicUsize,
    failing_keys: Mutex<HashSet<String>>,
    sign_delay: Mutex<Option<StdDuration>>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_key(&self, key: &str) {
        self.failing_keys.lock().unwrap().insert(key.to_string());
    }

    pub fn heal_key(&self, key: &str) {
        self.failing_keys.lock().unwrap().remove(key);
    }

    pub fn set_sign_delay(&self, delay: StdDuration) {
        *self.sign_delay.lock().unwrap() = Some(delay);
    }

    pub fn signs(&self) -> usize {
        self.sign_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStoreGateway for MockGateway {
    async fn sign(&self, key: &str, ttl: Duration) -> GatewayResult<SignedUrl> {
        let n = self.sign_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = *self.sign_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing_keys.lock().unwrap().contains(key) {
            return Err(GatewayError::Signing {
                key: key.to_string(),
                reason: "object store unavailable".into(),
            });
        }
        Ok(SignedUrl {
            url: format!("https://objects.test/{key}?v={n}"),
            expires_at: Utc::now() + ttl,
        })
    }

    async fn delete(&self, key: &str) -> GatewayResult<()> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_keys.lock().unwrap().contains(key) {
            return Err(GatewayError::ObjectNotFound(key.to_string()));
        }
        Ok(())
    }
}

/// Vec-backed store preserving insertion order, with failure switches.
#[derive(Default)]
pub struct MemoryResourceStore {
    records: Mutex<Vec<ResourceRecord>>,
    pub fail_url_writes: AtomicBool,
    pub fail_increments: AtomicBool,
    pub fail_batches: AtomicBool,
}

impl MemoryResourceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Vec<ResourceRecord>) -> Self {
        Self {
            records: Mutex::new(records),
            ..Self::default()
        }
    }

    pub fn get(&self, id: Uuid) -> ResourceRecord {
        self.records
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .expect("record present")
    }

    fn update<T>(&self, id: Uuid, f: impl FnOnce(&mut ResourceRecord) -> T) -> StoreResult<T> {
        let mut records = self.records.lock().unwrap();
        records
            .iter_mut()
            .find(|r| r.id == id)
            .map(f)
            .ok_or(StoreError::NotFound(id))
    }
}

fn unavailable() -> StoreError {
    StoreError::Sqlx(sqlx::Error::PoolTimedOut)
}

#[async_trait]
impl ResourceStore for MemoryResourceStore {
    async fn load(&self, id: Uuid) -> StoreResult<ResourceRecord> {
        self.update(id, |r| r.clone())
    }

    async fn load_by_key(&self, object_key: &str) -> StoreResult<Option<ResourceRecord>> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.object_key == object_key)
            .cloned())
    }

    async fn load_active_batch(
        &self,
        limit: usize,
        offset: usize,
    ) -> StoreResult<Vec<ResourceRecord>> {
        if self.fail_batches.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.is_active)
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn list(&self, active_only: bool) -> StoreResult<Vec<ResourceRecord>> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.is_active || !active_only)
            .cloned()
            .collect())
    }

    async fn save(&self, record: &ResourceRecord) -> StoreResult<()> {
        let mut records = self.records.lock().unwrap();
        if records
            .iter()
            .any(|r| r.object_key == record.object_key && r.id != record.id)
        {
            return Err(StoreError::DuplicateKey(record.object_key.clone()));
        }
        match records.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => *existing = record.clone(),
            None => records.push(record.clone()),
        }
        Ok(())
    }

    async fn save_signed_url(
        &self,
        id: Uuid,
        signed: &SignedUrl,
        refreshed_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        if self.fail_url_writes.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        self.update(id, |r| r.apply_signed(signed, refreshed_at))
    }

    async fn update_details(&self, record: &ResourceRecord) -> StoreResult<()> {
        self.update(record.id, |r| {
            r.title = record.title.clone();
            r.description = record.description.clone();
            r.category = record.category.clone();
            r.is_active = record.is_active;
            r.updated_at = record.updated_at;
        })
    }

    async fn increment_download_count(&self, id: Uuid) -> StoreResult<i64> {
        if self.fail_increments.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        self.update(id, |r| {
            r.download_count += 1;
            r.download_count
        })
    }

    async fn remove(&self, id: Uuid) -> StoreResult<()> {
        let mut records = self.records.lock().unwrap();
        let before = records.len();
        records.retain(|r| r.id != id);
        if records.len() == before {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }
}

/// A record whose URL expires `expires_in` from now.
pub fn signed_record(key: &str, expires_in: Duration) -> ResourceRecord {
    let now = Utc::now();
    let mut record = ResourceRecord::new(key, "docs", key, None, 1);
    record.apply_signed(
        &SignedUrl {
            url: format!("https://objects.test/{key}?v=0"),
            expires_at: now + expires_in,
        },
        now - Duration::hours(1),
    );
    record
}
