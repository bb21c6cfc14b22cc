//! # Sync Orchestrator
//!
//! Runs sync passes against the remote catalog, one at a time.
//!
//! ## Pass
//!
//! 1. Gates: single-flight, staleness window, minimum retry interval
//! 2. `Checking`: connectivity monitor, then the source resolver. Without
//!    backend access or a source the pass fails softly and the UI keeps
//!    serving the cache.
//! 3. `Syncing`: GET the catalog, upsert its settings row back to the
//!    backend, then replace the cache in one transaction
//! 4. `Succeeded`: stamp the sync time, clear errors and any notice
//! 5. `Failed`: classify, count, repair when possible and re-attempt once,
//!    then decide whether the failure deserves a user-visible notice
//!
//! Retry scheduling is left to the [`Scheduler`](crate::scheduler::Scheduler),
//! which owns every timer.
//!
//! The single-flight claim is held by a drop guard. A caller that drops the
//! `sync` future mid-pass (timeout, aborted task) releases it and leaves the
//! engine `Idle`.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let outcome = orchestrator.sync(SyncRequest::manual(true)).await;
//! match outcome {
//!     Ok(SyncOutcome::Completed { counts, .. }) => println!("{} channels", counts.channels),
//!     Ok(other) => println!("{other:?}"),
//!     Err(record) => println!("failed: {record}"),
//! }
//! ```

use crate::backoff::MinIntervalGate;
use crate::classifier::classify;
use crate::connectivity::ConnectivityMonitor;
use crate::fetch::CatalogFetcher;
use crate::repair::{RepairContext, RepairEngine, RepairOutcome};
use crate::resolver::RemoteSourceResolver;
use crate::state::{ErrorKind, ErrorRecord, SyncState, SyncStatus};
use crate::SyncError;
use bridge_traits::{BackendClient, BridgeError, Clock};
use chrono::{DateTime, Utc};
use core_cache::{CachedEntity, CatalogSnapshot, EntityCounts, LocalCache};
use core_runtime::config::{NoticePolicy, SyncTimings};
use core_runtime::events::{CoreEvent, EventBus, SyncEvent};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

// ============================================================================
// Requests and outcomes
// ============================================================================

/// What asked for a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncTrigger {
    /// A person asked (pull to refresh, retry button)
    Manual,
    Periodic,
    /// The platform reported the network is back
    Reconnect,
    /// The backend reported a change
    Realtime,
    /// Backoff retry after a failure
    Retry,
    /// Re-run of a forced request that arrived during a pass
    Queued,
}

impl SyncTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncTrigger::Manual => "manual",
            SyncTrigger::Periodic => "periodic",
            SyncTrigger::Reconnect => "reconnect",
            SyncTrigger::Realtime => "realtime",
            SyncTrigger::Retry => "retry",
            SyncTrigger::Queued => "queued",
        }
    }
}

impl fmt::Display for SyncTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncRequest {
    /// Bypass the staleness window
    pub force: bool,
    pub trigger: SyncTrigger,
}

impl SyncRequest {
    pub fn manual(force: bool) -> Self {
        Self {
            force,
            trigger: SyncTrigger::Manual,
        }
    }

    pub fn periodic() -> Self {
        Self {
            force: false,
            trigger: SyncTrigger::Periodic,
        }
    }

    pub fn reconnect() -> Self {
        Self {
            force: false,
            trigger: SyncTrigger::Reconnect,
        }
    }

    pub fn realtime() -> Self {
        Self {
            force: false,
            trigger: SyncTrigger::Realtime,
        }
    }

    /// Retries bypass the staleness window; the last pass failed.
    pub fn retry() -> Self {
        Self {
            force: true,
            trigger: SyncTrigger::Retry,
        }
    }

    pub fn queued() -> Self {
        Self {
            force: true,
            trigger: SyncTrigger::Queued,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Another pass holds the single-flight lock
    InFlight,
    /// The last success is inside the staleness window
    Fresh,
    /// A manual pass started less than the minimum interval after the last
    /// manual or retry pass
    TooSoon,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The cache now holds a fresh snapshot.
    Completed { pass_id: String, counts: EntityCounts },
    /// A pass was in flight; this request runs once it finishes.
    Queued,
    Skipped(SkipReason),
}

/// Point-in-time view of the engine state for the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStateSnapshot {
    pub status: SyncStatus,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_error: Option<ErrorRecord>,
    pub in_flight: bool,
    pub notice_active: bool,
    /// The cache is older than the staleness window, or the last pass failed.
    pub is_stale: bool,
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Everything a pass talks to.
pub struct SyncComponents {
    pub connectivity: Arc<ConnectivityMonitor>,
    pub resolver: Arc<RemoteSourceResolver>,
    pub fetcher: CatalogFetcher,
    pub repair: RepairEngine,
    pub backend: Arc<dyn BackendClient>,
    pub cache: Arc<dyn LocalCache>,
    pub events: EventBus,
    pub clock: Arc<dyn Clock>,
}

/// Mutable bookkeeping guarded by one lock.
struct Book {
    state: SyncState,
    queued_force: bool,
    notice_active: bool,
    /// Thresholds already surfaced in the current failure streak
    fired_thresholds: Vec<u32>,
    /// Soft failures since the last hard failure or success
    soft_failures: u32,
    retry_gate: MinIntervalGate,
}

pub struct SyncOrchestrator {
    connectivity: Arc<ConnectivityMonitor>,
    resolver: Arc<RemoteSourceResolver>,
    fetcher: CatalogFetcher,
    repair: RepairEngine,
    backend: Arc<dyn BackendClient>,
    cache: Arc<dyn LocalCache>,
    events: EventBus,
    clock: Arc<dyn Clock>,
    staleness_window: Duration,
    write_timeout: Duration,
    notice_thresholds: Vec<u32>,
    book: Mutex<Book>,
    refire: Arc<Notify>,
}

impl SyncOrchestrator {
    pub fn new(components: SyncComponents, timings: &SyncTimings, notices: &NoticePolicy) -> Self {
        Self {
            connectivity: components.connectivity,
            resolver: components.resolver,
            fetcher: components.fetcher,
            repair: components.repair,
            backend: components.backend,
            cache: components.cache,
            events: components.events,
            clock: components.clock,
            staleness_window: timings.staleness_window,
            write_timeout: timings.fetch_timeout,
            notice_thresholds: notices.thresholds.clone(),
            book: Mutex::new(Book {
                state: SyncState::new(),
                queued_force: false,
                notice_active: false,
                fired_thresholds: Vec::new(),
                soft_failures: 0,
                retry_gate: MinIntervalGate::new(timings.min_manual_retry_interval),
            }),
            refire: Arc::new(Notify::new()),
        }
    }

    /// Run one pass, or explain why not.
    ///
    /// `Err` carries the error record of a failed pass after any automatic
    /// repair and re-attempt.
    #[instrument(skip(self), fields(trigger = %request.trigger, force = request.force))]
    pub async fn sync(&self, request: SyncRequest) -> Result<SyncOutcome, ErrorRecord> {
        let now = self.clock.now();

        {
            let mut book = self.book();

            if book.state.in_flight {
                if request.force || request.trigger == SyncTrigger::Manual {
                    book.queued_force = true;
                    debug!("Pass in flight, queued a forced re-run");
                    return Ok(SyncOutcome::Queued);
                }
                return Ok(SyncOutcome::Skipped(SkipReason::InFlight));
            }

            if !request.force && self.within_staleness(book.state.last_sync_at, now) {
                debug!("Cache is fresh, skipping");
                return Ok(SyncOutcome::Skipped(SkipReason::Fresh));
            }

            if request.trigger == SyncTrigger::Manual && !book.retry_gate.allows(now) {
                debug!("Manual pass requested too soon after the previous retry");
                return Ok(SyncOutcome::Skipped(SkipReason::TooSoon));
            }

            if matches!(request.trigger, SyncTrigger::Manual | SyncTrigger::Retry) {
                book.retry_gate.record(now);
            }
            book.state.in_flight = true;
            transition(&mut book, SyncStatus::Checking);
        }

        let flight = FlightGuard::new(self);
        let pass_id = Uuid::new_v4().to_string();
        self.emit(SyncEvent::Started {
            pass_id: pass_id.clone(),
            forced: request.force,
            trigger: request.trigger.to_string(),
        });

        let result = self.run_pass(&pass_id).await;
        self.finish_pass().await;
        flight.disarm();
        result
    }

    /// Wipe the cache and every piece of failure bookkeeping.
    ///
    /// Holds the single-flight claim for the duration, so no pass can
    /// interleave with the wipe. Returns `Ok(false)` without touching
    /// anything when a pass is already in flight.
    #[instrument(skip(self))]
    pub async fn reset(&self) -> crate::Result<bool> {
        {
            let mut book = self.book();
            if book.state.in_flight {
                return Ok(false);
            }
            book.state.in_flight = true;
        }
        let flight = FlightGuard::new(self);

        let wiped = self.cache.reset().await;
        let notice_was_active = match &wiped {
            Ok(()) => {
                let mut book = self.book();
                book.state = SyncState::new();
                book.state.in_flight = true;
                book.fired_thresholds.clear();
                book.soft_failures = 0;
                std::mem::replace(&mut book.notice_active, false)
            }
            Err(_) => false,
        };

        self.release_flight();
        flight.disarm();

        if notice_was_active {
            self.emit(SyncEvent::NoticeCleared);
        }
        wiped?;
        info!("Local cache reset");
        Ok(true)
    }

    pub async fn state(&self) -> SyncStateSnapshot {
        let now = self.clock.now();
        let book = self.book();
        let is_stale = !self.within_staleness(book.state.last_sync_at, now)
            || book.state.last_error.is_some();

        SyncStateSnapshot {
            status: book.state.status,
            last_sync_at: book.state.last_sync_at,
            last_error: book.state.last_error.clone(),
            in_flight: book.state.in_flight,
            notice_active: book.notice_active,
            is_stale,
        }
    }

    pub async fn last_sync_time(&self) -> Option<DateTime<Utc>> {
        self.book().state.last_sync_at
    }

    /// Hide the current notice. The failure streak keeps counting; the next
    /// threshold crossing raises it again.
    pub async fn dismiss_notice(&self) -> bool {
        let was_active = {
            let mut book = self.book();
            std::mem::replace(&mut book.notice_active, false)
        };

        if was_active {
            self.emit(SyncEvent::NoticeCleared);
        }
        was_active
    }

    /// Startup recovery: load persisted bookkeeping and clear an in-progress
    /// flag left by a pass that never finished. Returns whether one was found.
    pub async fn recover_interrupted(&self) -> crate::Result<bool> {
        let metadata = self.cache.get_sync_metadata().await?;

        let last_error = metadata.last_error.as_deref().and_then(|raw| {
            ErrorRecord::from_json(raw)
                .map_err(|e| warn!(error = %e, "Discarding unreadable persisted error record"))
                .ok()
        });

        {
            let mut book = self.book();
            book.state.last_sync_at = metadata.last_sync_at;
            book.state.last_error = last_error;
        }

        if metadata.in_progress {
            warn!("Previous sync pass was interrupted, clearing its in-progress flag");
            self.cache.set_in_progress(false).await?;
        }

        Ok(metadata.in_progress)
    }

    /// Notified once after a pass that had a forced request queued behind it.
    pub fn refire_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.refire)
    }

    // ------------------------------------------------------------------
    // Pass stages
    // ------------------------------------------------------------------

    async fn run_pass(&self, pass_id: &str) -> Result<SyncOutcome, ErrorRecord> {
        let connectivity = self.connectivity.check().await;
        if !connectivity.has_backend_access {
            return Err(self.soft_fail(pass_id, "backend unreachable").await);
        }

        let Some(source) = self.resolver.resolve().await else {
            return Err(self.soft_fail(pass_id, "no remote source available").await);
        };

        self.set_status(SyncStatus::Syncing).await;
        if let Err(e) = self.cache.set_in_progress(true).await {
            warn!(error = %e, "Failed to persist in-progress flag");
        }

        match self.attempt(&source.url).await {
            Ok(counts) => Ok(self.succeed(pass_id, counts).await),
            Err(error) => self.recover(pass_id, &source.url, error).await,
        }
    }

    async fn attempt(&self, url: &str) -> crate::Result<EntityCounts> {
        let snapshot = self.fetcher.fetch(url).await?;
        self.write_back_settings(&snapshot).await?;
        Ok(self.cache.replace_snapshot(&snapshot).await?)
    }

    /// Upsert the fetched settings row so the backend holds exactly the row
    /// the cache is about to store. A duplicate-key answer here is what the
    /// settings repair resolves.
    async fn write_back_settings(&self, snapshot: &CatalogSnapshot) -> crate::Result<()> {
        let Some(settings) = snapshot.settings.iter().find_map(|entity| match entity {
            CachedEntity::Settings(settings) => Some(settings),
            _ => None,
        }) else {
            return Ok(());
        };

        let rows = [settings.to_row()];
        let written = tokio::time::timeout(
            self.write_timeout,
            self.backend.upsert_rows("settings", &rows),
        )
        .await
        .map_err(|_| BridgeError::Timeout("settings write-back".to_string()))??;

        debug!(id = %settings.id, written, "Settings row written back");
        Ok(())
    }

    async fn succeed(&self, pass_id: &str, counts: EntityCounts) -> SyncOutcome {
        let now = self.clock.now();

        if let Err(e) = self.cache.set_last_sync_at(now).await {
            warn!(error = %e, "Failed to persist last sync time");
        }
        if let Err(e) = self.cache.set_last_error(None).await {
            warn!(error = %e, "Failed to clear persisted error");
        }

        let notice_was_active = {
            let mut book = self.book();
            book.state.last_sync_at = Some(now);
            book.state.last_error = None;
            book.soft_failures = 0;
            book.fired_thresholds.clear();
            transition(&mut book, SyncStatus::Succeeded);
            std::mem::replace(&mut book.notice_active, false)
        };

        if notice_was_active {
            self.emit(SyncEvent::NoticeCleared);
        }

        info!(
            pass_id,
            channels = counts.channels,
            categories = counts.categories,
            countries = counts.countries,
            settings = counts.settings,
            "Sync pass succeeded"
        );
        self.emit(SyncEvent::EntitiesUpdated {
            pass_id: pass_id.to_string(),
            channels: counts.channels,
            categories: counts.categories,
            countries: counts.countries,
            settings: counts.settings,
        });

        SyncOutcome::Completed {
            pass_id: pass_id.to_string(),
            counts,
        }
    }

    /// Classify, repair when possible, re-attempt at most once.
    async fn recover(
        &self,
        pass_id: &str,
        url: &str,
        error: SyncError,
    ) -> Result<SyncOutcome, ErrorRecord> {
        let kind = classify(&error);
        let mut record = self.record_failure(pass_id, kind, &error).await;

        if matches!(
            kind,
            ErrorKind::DuplicateKey | ErrorKind::Connection | ErrorKind::Network
        ) {
            let outcome = self
                .repair
                .repair(kind, &RepairContext::new(error.message()))
                .await;

            if outcome.is_success(kind) {
                if let RepairOutcome::Repaired { detail } = &outcome {
                    self.emit(SyncEvent::Repaired {
                        kind: kind.to_string(),
                        detail: detail.clone(),
                    });
                }

                self.set_status(SyncStatus::Syncing).await;
                match self.attempt(url).await {
                    Ok(counts) => return Ok(self.succeed(pass_id, counts).await),
                    Err(retry_error) => {
                        record = self
                            .record_reattempt_failure(pass_id, &record, &retry_error)
                            .await;
                    }
                }
            } else {
                debug!(kind = %kind, outcome = ?outcome, "No re-attempt after repair");
            }
        }

        self.maybe_raise_notice(&record).await;
        Err(record)
    }

    async fn record_failure(&self, pass_id: &str, kind: ErrorKind, error: &SyncError) -> ErrorRecord {
        let now = self.clock.now();
        let record = {
            let mut book = self.book();
            let record =
                ErrorRecord::advance(book.state.last_error.as_ref(), kind, error.message(), now);
            book.soft_failures = 0;
            self.store_record(&mut book, &record);
            record
        };

        info!(pass_id, kind = %kind, count = record.consecutive_count, error = %error, "Sync pass failed");
        self.publish_failure(pass_id, &record).await;
        record
    }

    async fn record_reattempt_failure(
        &self,
        pass_id: &str,
        previous: &ErrorRecord,
        error: &SyncError,
    ) -> ErrorRecord {
        let kind = classify(error);
        let record = previous.supersede(kind, error.message(), self.clock.now());
        {
            let mut book = self.book();
            self.store_record(&mut book, &record);
        }

        info!(pass_id, kind = %kind, error = %error, "Re-attempt after repair failed");
        self.publish_failure(pass_id, &record).await;
        record
    }

    /// Connectivity or source problem before any fetch. Counts every second
    /// occurrence so a flaky network escalates slower than real failures.
    async fn soft_fail(&self, pass_id: &str, reason: &str) -> ErrorRecord {
        let now = self.clock.now();
        self.emit(SyncEvent::ServingCache {
            reason: reason.to_string(),
        });

        let record = {
            let mut book = self.book();
            book.soft_failures += 1;
            let escalate = book.soft_failures % 2 == 0;

            let record = match &book.state.last_error {
                Some(previous) if previous.kind == ErrorKind::Connection => {
                    let mut record = previous.supersede(ErrorKind::Connection, reason, now);
                    if escalate {
                        record.consecutive_count = record.consecutive_count.saturating_add(1);
                    }
                    record
                }
                _ => ErrorRecord::new(ErrorKind::Connection, reason, now),
            };
            self.store_record(&mut book, &record);
            record
        };

        debug!(pass_id, reason, count = record.consecutive_count, "Serving cache");
        self.publish_failure(pass_id, &record).await;
        self.maybe_raise_notice(&record).await;
        record
    }

    fn store_record(&self, book: &mut Book, record: &ErrorRecord) {
        if record.consecutive_count == 1 {
            book.fired_thresholds.clear();
        }
        book.state.last_error = Some(record.clone());
        transition(book, SyncStatus::Failed);
    }

    async fn publish_failure(&self, pass_id: &str, record: &ErrorRecord) {
        match record.to_json() {
            Ok(json) => {
                if let Err(e) = self.cache.set_last_error(Some(json)).await {
                    warn!(error = %e, "Failed to persist error record");
                }
            }
            Err(e) => warn!(error = %e, "Failed to serialize error record"),
        }

        self.emit(SyncEvent::Failed {
            pass_id: pass_id.to_string(),
            kind: record.kind.to_string(),
            message: record.message.clone(),
            consecutive_count: record.consecutive_count,
            recoverable: record.recoverable,
        });
    }

    async fn maybe_raise_notice(&self, record: &ErrorRecord) {
        let raise = {
            let mut book = self.book();

            let due = if record.kind.surfaces_immediately() {
                true
            } else {
                let crossed: Vec<u32> = self
                    .notice_thresholds
                    .iter()
                    .copied()
                    .filter(|t| record.consecutive_count >= *t && !book.fired_thresholds.contains(t))
                    .collect();
                book.fired_thresholds.extend(&crossed);
                !crossed.is_empty()
            };

            if due && !book.notice_active {
                book.notice_active = true;
                true
            } else {
                false
            }
        };

        if raise {
            warn!(
                kind = %record.kind,
                count = record.consecutive_count,
                message = %record.message,
                "Surfacing sync problem to the user"
            );
            self.emit(SyncEvent::NoticeRaised {
                kind: record.kind.to_string(),
                message: record.message.clone(),
                consecutive_count: record.consecutive_count,
            });
        }
    }

    async fn finish_pass(&self) {
        if let Err(e) = self.cache.set_in_progress(false).await {
            warn!(error = %e, "Failed to clear in-progress flag");
        }

        transition(&mut self.book(), SyncStatus::Idle);
        self.release_flight();
    }

    /// Drop the single-flight claim and wake the scheduler when a forced
    /// request queued behind it.
    fn release_flight(&self) {
        let refire = {
            let mut book = self.book();
            book.state.in_flight = false;
            std::mem::replace(&mut book.queued_force, false)
        };

        if refire {
            debug!("Releasing queued forced pass");
            self.refire.notify_one();
        }
    }

    /// Runs from [`FlightGuard`]'s drop, so it cannot await. The persisted
    /// in-progress flag is cleared on a spawned task when a runtime is
    /// available; otherwise startup recovery clears it.
    fn abandon_flight(&self) {
        warn!("Sync pass dropped before completion, releasing single-flight lock");
        self.book().state.abandon();
        self.release_flight();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let cache = Arc::clone(&self.cache);
                handle.spawn(async move {
                    if let Err(e) = cache.set_in_progress(false).await {
                        warn!(error = %e, "Failed to clear in-progress flag");
                    }
                });
            }
            Err(_) => debug!("No runtime available, leaving in-progress flag to startup recovery"),
        }
    }

    async fn set_status(&self, to: SyncStatus) {
        transition(&mut self.book(), to);
    }

    fn book(&self) -> MutexGuard<'_, Book> {
        self.book.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn within_staleness(&self, last_sync_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        last_sync_at
            .and_then(|at| (now - at).to_std().ok())
            .map_or(false, |age| age < self.staleness_window)
    }

    fn emit(&self, event: SyncEvent) {
        self.events.emit(CoreEvent::Sync(event)).ok();
    }
}

/// Holds the single-flight claim taken by `sync` or `reset`. Dropped while
/// still armed, it hands the claim back through
/// [`SyncOrchestrator::abandon_flight`].
struct FlightGuard<'a> {
    orchestrator: &'a SyncOrchestrator,
    armed: bool,
}

impl<'a> FlightGuard<'a> {
    fn new(orchestrator: &'a SyncOrchestrator) -> Self {
        Self {
            orchestrator,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.orchestrator.abandon_flight();
        }
    }
}

fn transition(book: &mut Book, to: SyncStatus) {
    if let Err(e) = book.state.transition(to) {
        warn!(error = %e, "Rejected sync state transition");
    }
}
