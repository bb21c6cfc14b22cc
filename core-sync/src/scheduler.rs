//! # Scheduler
//!
//! Owns every timer of the engine: the jittered periodic loop, the single
//! pending backoff retry and the re-fire of forced requests that arrived
//! while a pass was running. All entry points funnel into
//! [`SyncOrchestrator::sync`].

use crate::backoff::{periodic_delay, Backoff};
use crate::connectivity::{ConnectivityListener, ConnectivityStatus};
use crate::coordinator::{SyncOrchestrator, SyncOutcome, SyncRequest};
use crate::state::ErrorRecord;
use async_trait::async_trait;
use core_runtime::config::{FeatureFlags, RetryPolicy, SyncTimings};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

type PassResult = std::result::Result<SyncOutcome, ErrorRecord>;

#[derive(Default)]
struct RetrySlot {
    generation: u64,
    pending: Option<JoinHandle<()>>,
}

struct SchedulerInner {
    orchestrator: Arc<SyncOrchestrator>,
    retry_policy: RetryPolicy,
    timings: SyncTimings,
    features: FeatureFlags,
    retry: Mutex<RetrySlot>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

/// Cheap to clone; clones share timers.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new(
        orchestrator: Arc<SyncOrchestrator>,
        retry_policy: RetryPolicy,
        timings: SyncTimings,
        features: FeatureFlags,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                orchestrator,
                retry_policy,
                timings,
                features,
                retry: Mutex::new(RetrySlot::default()),
                loops: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn orchestrator(&self) -> &Arc<SyncOrchestrator> {
        &self.inner.orchestrator
    }

    /// Manual trigger.
    pub async fn trigger_now(&self, force: bool) -> PassResult {
        self.run(SyncRequest::manual(force)).await
    }

    pub async fn trigger_periodic(&self) -> PassResult {
        self.run(SyncRequest::periodic()).await
    }

    pub async fn trigger_on_reconnect(&self) -> PassResult {
        self.run(SyncRequest::reconnect()).await
    }

    /// Non-forced; the change payload is only a hint.
    pub async fn trigger_realtime(&self) -> PassResult {
        self.run(SyncRequest::realtime()).await
    }

    /// Replace the pending retry with one firing after `delay`.
    pub fn schedule_retry(&self, delay: Duration) {
        let mut slot = lock(&self.inner.retry);
        slot.generation += 1;
        let generation = slot.generation;

        if let Some(previous) = slot.pending.take() {
            previous.abort();
        }

        debug!(delay_ms = delay.as_millis() as u64, "Retry scheduled");
        let scheduler = self.clone();
        slot.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Leave the slot before running so a newer retry never aborts this pass.
            scheduler.release_retry_slot(generation);
            let _ = scheduler.run(SyncRequest::retry()).await;
        }));
    }

    /// Drop the pending retry, if any.
    pub fn cancel_retry(&self) {
        if let Some(pending) = lock(&self.inner.retry).pending.take() {
            pending.abort();
            debug!("Pending retry cancelled");
        }
    }

    pub fn has_pending_retry(&self) -> bool {
        lock(&self.inner.retry).pending.is_some()
    }

    /// Spawn the background loops. They stop when `token` is cancelled.
    pub fn start(&self, token: CancellationToken) {
        let mut loops = lock(&self.inner.loops);

        if self.inner.features.enable_periodic_sync {
            loops.push(self.spawn_periodic(token.clone()));
        }
        loops.push(self.spawn_refire(token));

        info!(
            periodic = self.inner.features.enable_periodic_sync,
            "Sync scheduler started"
        );
    }

    /// Drop the pending retry and wait for the loops to finish. Cancel the
    /// token passed to [`start`](Self::start) first; a pass already running
    /// completes.
    pub async fn stop(&self) {
        self.cancel_retry();

        let loops: Vec<JoinHandle<()>> = lock(&self.inner.loops).drain(..).collect();
        for handle in loops {
            let _ = handle.await;
        }
        debug!("Sync scheduler stopped");
    }

    async fn run(&self, request: SyncRequest) -> PassResult {
        let result = self.inner.orchestrator.sync(request).await;

        match &result {
            Ok(SyncOutcome::Completed { .. }) => self.cancel_retry(),
            Err(record) if record.recoverable => {
                let policy = &self.inner.retry_policy;
                if record.consecutive_count >= policy.max_attempts {
                    info!(
                        count = record.consecutive_count,
                        max_attempts = policy.max_attempts,
                        "Retry budget exhausted, waiting for the next trigger"
                    );
                    self.cancel_retry();
                } else {
                    self.schedule_retry(self.retry_delay(record));
                }
            }
            Err(record) => {
                debug!(kind = %record.kind, "Failure is not retried automatically");
            }
            Ok(_) => {}
        }

        result
    }

    /// Backoff delay for the next attempt, never shorter than the minimum
    /// spacing a manual retry has to respect.
    fn retry_delay(&self, record: &ErrorRecord) -> Duration {
        let attempt = record.consecutive_count.saturating_sub(1);
        self.inner
            .retry_policy
            .delay_for(attempt)
            .max(self.inner.timings.min_manual_retry_interval)
    }

    fn release_retry_slot(&self, generation: u64) {
        let mut slot = lock(&self.inner.retry);
        if slot.generation == generation {
            slot.pending = None;
        }
    }

    fn spawn_periodic(&self, token: CancellationToken) -> JoinHandle<()> {
        let scheduler = self.clone();

        tokio::spawn(async move {
            let timings = &scheduler.inner.timings;
            loop {
                // Recomputed per tick so engines started together drift apart.
                let delay = {
                    let mut rng = rand::thread_rng();
                    periodic_delay(
                        timings.periodic_interval,
                        timings.periodic_jitter_min,
                        timings.periodic_jitter_max,
                        &mut rng,
                    )
                };
                debug!(delay_secs = delay.as_secs(), "Next periodic sync");

                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {
                        let _ = scheduler.trigger_periodic().await;
                    }
                }
            }
            debug!("Periodic sync loop stopped");
        })
    }

    fn spawn_refire(&self, token: CancellationToken) -> JoinHandle<()> {
        let scheduler = self.clone();
        let refire = self.inner.orchestrator.refire_signal();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = refire.notified() => {
                        let _ = scheduler.run(SyncRequest::queued()).await;
                    }
                }
            }
            debug!("Queued sync loop stopped");
        })
    }
}

#[async_trait]
impl ConnectivityListener for Scheduler {
    async fn on_online(&self, status: &ConnectivityStatus) {
        if !status.has_backend_access {
            return;
        }
        // Detached so the network watcher is not held for a whole pass.
        let scheduler = self.clone();
        tokio::spawn(async move {
            let _ = scheduler.trigger_on_reconnect().await;
        });
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
