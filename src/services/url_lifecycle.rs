//! src/services/url_lifecycle.rs
//!
//! UrlLifecycleManager decides whether a record's signed link is usable and is
//! the only code that writes `signed_url` / `url_expires_at`.
//!
//! Refreshes are single-flight per object key: the first caller spawns the
//! refresh as its own task and publishes a shared handle in `in_flight`; every
//! caller arriving while it runs awaits that same handle. The task removes its
//! entry when it finishes, whatever the outcome, so a caller that gives up
//! (timeout, dropped request) never strands the key.

use crate::{
    config::LifecycleConfig,
    models::resource::{ResourceRecord, SignedUrl},
    services::{
        object_gateway::ObjectStoreGateway,
        resource_store::{ResourceStore, StoreError},
    },
};
use chrono::{DateTime, Utc};
use futures::{
    FutureExt, StreamExt,
    future::{self, BoxFuture, Shared},
    stream,
};
use std::{
    collections::{BTreeSet, HashMap},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Refreshes a sweep runs at once.
const SWEEP_CONCURRENCY: usize = 4;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("resource `{0}` not found")]
    NotFound(Uuid),
    #[error("signing `{key}` failed: {reason}")]
    SigningFailed { key: String, reason: String },
    #[error("persisting link for `{id}` failed: {reason}")]
    PersistenceFailed { id: Uuid, reason: String },
}

pub type LinkResult = Result<SignedUrl, LifecycleError>;

/// What a single refresh flight ended up doing.
#[derive(Debug, Clone, PartialEq, Eq)]
enum RefreshOutcome {
    /// A new link was signed.
    Renewed(SignedUrl),
    /// The stored link was already outside the refresh buffer.
    AlreadyFresh(SignedUrl),
    /// The record was deactivated after the caller loaded it.
    Inactive,
}

type FlightResult = Result<RefreshOutcome, LifecycleError>;
type Flight = Shared<BoxFuture<'static, FlightResult>>;

/// A signed link that was minted but could not be written to the store yet.
#[derive(Debug, Clone)]
struct UnsavedLink {
    signed: SignedUrl,
    refreshed_at: DateTime<Utc>,
}

/// Outcome of one sweep.
#[derive(Debug, Default)]
pub struct SweepReport {
    /// Records that received a new link during this sweep.
    pub refreshed: BTreeSet<Uuid>,
    /// Records that were examined and still fresh, including ones renewed by
    /// another caller while the sweep ran.
    pub fresh: usize,
    /// Records deactivated since the batch was loaded.
    pub skipped: usize,
    /// Held-over links written to the store at the start of the sweep.
    pub persisted: usize,
    /// Per-record failures. They never abort the sweep.
    pub failed: Vec<(Uuid, LifecycleError)>,
    /// The stop signal fired before every stale record was visited.
    pub cancelled: bool,
}

#[derive(Clone)]
pub struct UrlLifecycleManager {
    gateway: Arc<dyn ObjectStoreGateway>,
    store: Arc<dyn ResourceStore>,
    config: LifecycleConfig,
    in_flight: Arc<Mutex<HashMap<String, (u64, Flight)>>>,
    unsaved: Arc<Mutex<HashMap<Uuid, UnsavedLink>>>,
    next_flight: Arc<AtomicU64>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes a flight's map entry when the refresh task ends, including on panic.
struct FlightGuard {
    in_flight: Arc<Mutex<HashMap<String, (u64, Flight)>>>,
    key: String,
    id: u64,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        let mut in_flight = lock(&self.in_flight);
        if in_flight.get(&self.key).is_some_and(|(id, _)| *id == self.id) {
            in_flight.remove(&self.key);
        }
    }
}

impl UrlLifecycleManager {
    pub fn new(
        gateway: Arc<dyn ObjectStoreGateway>,
        store: Arc<dyn ResourceStore>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            gateway,
            store,
            config,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            unsaved: Arc::new(Mutex::new(HashMap::new())),
            next_flight: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Number of keys with a refresh currently running.
    pub fn in_flight_count(&self) -> usize {
        lock(&self.in_flight).len()
    }

    /// Number of minted links still waiting to be persisted.
    pub fn unsaved_count(&self) -> usize {
        lock(&self.unsaved).len()
    }

    /// Layer any newer not-yet-persisted link over a stored record.
    pub fn overlay_unsaved(&self, mut record: ResourceRecord) -> ResourceRecord {
        if let Some(link) = lock(&self.unsaved).get(&record.id) {
            if record
                .url_expires_at
                .is_none_or(|stored| stored < link.signed.expires_at)
            {
                record.apply_signed(&link.signed, link.refreshed_at);
            }
        }
        record
    }

    /// Return a link for `record` that is outside the refresh buffer, refreshing
    /// if needed.
    ///
    /// When the refresh fails and the cached link has not actually expired yet,
    /// the cached link is returned instead of the error.
    pub async fn get_fresh_url(&self, record: &ResourceRecord) -> LinkResult {
        let record = self.overlay_unsaved(record.clone());
        let now = Utc::now();
        if !record.is_stale(now, self.config.refresh_buffer) {
            if let Some(url) = record.usable_url(now) {
                return Ok(url);
            }
        }

        match self.join_or_start(&record, false).await {
            Ok(RefreshOutcome::Renewed(url) | RefreshOutcome::AlreadyFresh(url)) => Ok(url),
            Ok(RefreshOutcome::Inactive) => Err(LifecycleError::NotFound(record.id)),
            Err(err @ LifecycleError::NotFound(_)) => Err(err),
            Err(err) => match self.overlay_unsaved(record).usable_url(Utc::now()) {
                Some(url) => {
                    warn!(error = %err, "refresh failed, serving cached link until it expires");
                    Ok(url)
                }
                None => Err(err),
            },
        }
    }

    /// Sign a new link for `record` unconditionally and persist it.
    ///
    /// Joins a refresh already running for the same object key instead of
    /// signing twice.
    pub async fn refresh(&self, record: &ResourceRecord) -> LinkResult {
        match self.join_or_start(record, true).await? {
            RefreshOutcome::Renewed(url) | RefreshOutcome::AlreadyFresh(url) => Ok(url),
            RefreshOutcome::Inactive => Err(LifecycleError::NotFound(record.id)),
        }
    }

    /// Refresh every active, stale record in `records`.
    pub async fn sweep_stale(&self, records: &[ResourceRecord]) -> SweepReport {
        self.sweep(records, None).await
    }

    /// As [`sweep_stale`](Self::sweep_stale), checking `stop` before each record.
    /// Records already being refreshed when `stop` fires run to completion.
    pub async fn sweep_stale_until(
        &self,
        records: &[ResourceRecord],
        stop: &watch::Receiver<bool>,
    ) -> SweepReport {
        self.sweep(records, Some(stop)).await
    }

    async fn sweep(
        &self,
        records: &[ResourceRecord],
        stop: Option<&watch::Receiver<bool>>,
    ) -> SweepReport {
        let mut report = SweepReport::default();
        self.flush_unsaved(&mut report).await;

        let now = Utc::now();
        let stale: Vec<ResourceRecord> = records
            .iter()
            .filter(|r| r.is_active)
            .map(|r| self.overlay_unsaved(r.clone()))
            .filter(|r| {
                let stale = r.is_stale(now, self.config.refresh_buffer);
                if !stale {
                    report.fresh += 1;
                }
                stale
            })
            .collect();

        let stop = stop.cloned();
        let total = stale.len();
        let outcomes: Vec<(Uuid, FlightResult)> = stream::iter(stale)
            .take_while(move |_| future::ready(!stop.as_ref().is_some_and(|rx| *rx.borrow())))
            .map(|record| {
                let this = self.clone();
                async move {
                    let outcome = this.join_or_start(&record, false).await;
                    (record.id, outcome)
                }
            })
            .buffer_unordered(SWEEP_CONCURRENCY)
            .collect()
            .await;

        report.cancelled = outcomes.len() < total;
        for (id, outcome) in outcomes {
            match outcome {
                Ok(RefreshOutcome::Renewed(_)) => {
                    report.refreshed.insert(id);
                }
                Ok(RefreshOutcome::AlreadyFresh(_)) => report.fresh += 1,
                Ok(RefreshOutcome::Inactive) => report.skipped += 1,
                Err(err) => {
                    warn!(resource_id = %id, error = %err, "refresh failed during sweep");
                    report.failed.push((id, err));
                }
            }
        }
        report
    }

    /// Retry writing links that were minted while the store was unavailable.
    async fn flush_unsaved(&self, report: &mut SweepReport) {
        let pending: Vec<(Uuid, UnsavedLink)> = lock(&self.unsaved)
            .iter()
            .map(|(id, link)| (*id, link.clone()))
            .collect();

        for (id, link) in pending {
            match self
                .store
                .save_signed_url(id, &link.signed, link.refreshed_at)
                .await
            {
                Ok(()) => {
                    self.forget_unsaved(id, &link.signed);
                    report.persisted += 1;
                }
                Err(StoreError::NotFound(_)) => {
                    self.forget_unsaved(id, &link.signed);
                }
                Err(err) => {
                    report.failed.push((
                        id,
                        LifecycleError::PersistenceFailed {
                            id,
                            reason: err.to_string(),
                        },
                    ));
                }
            }
        }
    }

    /// Drop the held link for `id` unless a newer one replaced it meanwhile.
    fn forget_unsaved(&self, id: Uuid, signed: &SignedUrl) {
        let mut unsaved = lock(&self.unsaved);
        if unsaved.get(&id).is_some_and(|link| link.signed == *signed) {
            unsaved.remove(&id);
        }
    }

    async fn join_or_start(&self, record: &ResourceRecord, force: bool) -> FlightResult {
        let flight = {
            let mut in_flight = lock(&self.in_flight);
            match in_flight.get(&record.object_key) {
                Some((_, flight)) => {
                    debug!(object_key = %record.object_key, "joining in-flight refresh");
                    flight.clone()
                }
                None => {
                    let id = self.next_flight.fetch_add(1, Ordering::Relaxed);
                    let guard = FlightGuard {
                        in_flight: self.in_flight.clone(),
                        key: record.object_key.clone(),
                        id,
                    };
                    let this = self.clone();
                    let snapshot = record.clone();
                    let task = tokio::spawn(async move {
                        let _guard = guard;
                        this.perform_refresh(snapshot, force).await
                    });
                    let key = record.object_key.clone();
                    let flight = async move {
                        task.await.unwrap_or_else(|err| {
                            Err(LifecycleError::SigningFailed {
                                key,
                                reason: format!("refresh task aborted: {err}"),
                            })
                        })
                    }
                    .boxed()
                    .shared();
                    in_flight.insert(record.object_key.clone(), (id, flight.clone()));
                    flight
                }
            }
        };
        flight.await
    }

    /// Body of a flight. Runs at most once per key at a time.
    async fn perform_refresh(&self, snapshot: ResourceRecord, force: bool) -> FlightResult {
        // The store is ground truth; an earlier flight may already have renewed it.
        let current = match self.store.load(snapshot.id).await {
            Ok(record) => self.overlay_unsaved(record),
            Err(StoreError::NotFound(id)) => return Err(LifecycleError::NotFound(id)),
            Err(err) => {
                warn!(resource_id = %snapshot.id, error = %err, "could not reload record, using caller's copy");
                snapshot
            }
        };

        if !force && !current.is_active {
            debug!(resource_id = %current.id, "record deactivated, not renewing");
            return Ok(RefreshOutcome::Inactive);
        }

        let now = Utc::now();
        if !force && !current.is_stale(now, self.config.refresh_buffer) {
            if let Some(url) = current.usable_url(now) {
                debug!(resource_id = %current.id, "link already renewed");
                return Ok(RefreshOutcome::AlreadyFresh(url));
            }
        }

        let signed = self
            .gateway
            .sign(&current.object_key, self.config.sign_ttl)
            .await
            .map_err(|err| LifecycleError::SigningFailed {
                key: current.object_key.clone(),
                reason: err.to_string(),
            })?;

        let refreshed_at = Utc::now();
        if signed.expires_at <= refreshed_at {
            return Err(LifecycleError::SigningFailed {
                key: current.object_key.clone(),
                reason: "object store returned an already expired link".into(),
            });
        }

        match self
            .store
            .save_signed_url(current.id, &signed, refreshed_at)
            .await
        {
            Ok(()) => {
                lock(&self.unsaved).remove(&current.id);
                info!(
                    resource_id = %current.id,
                    object_key = %current.object_key,
                    expires_at = %signed.expires_at,
                    "refreshed signed link"
                );
            }
            Err(StoreError::NotFound(id)) => return Err(LifecycleError::NotFound(id)),
            Err(err) => {
                warn!(
                    resource_id = %current.id,
                    error = %err,
                    "persisting refreshed link failed, holding it until the next sweep"
                );
                lock(&self.unsaved).insert(
                    current.id,
                    UnsavedLink {
                        signed: signed.clone(),
                        refreshed_at,
                    },
                );
            }
        }

        Ok(RefreshOutcome::Renewed(signed))
    }
}
