//! # Connectivity Monitor
//!
//! Decides whether the device has network and whether the backend is likely
//! reachable by probing a set of well-known endpoints concurrently.
//!
//! - Any HTTP response counts as a successful probe, whatever its status.
//! - `has_network` means at least one probe answered; `has_backend_access`
//!   means at least half did.
//! - Results are reused for the validity window.
//! - A probe-only drop to [`ConnectionClass::None`] is not applied. The
//!   previous class is kept until [`ConnectivityMonitor::mark_offline`] is
//!   called, so a single lossy round of probes does not flap the UI.

use async_trait::async_trait;
use bridge_traits::{Clock, HttpClient, HttpRequest, NetworkMonitor, NetworkStatus};
use chrono::{DateTime, Utc};
use core_cache::LocalCache;
use core_runtime::events::{ConnectivityEvent, CoreEvent, EventBus};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Coarse connection quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionClass {
    /// The backend is likely reachable
    Full,
    /// Some network, but too many probes failed
    Limited,
    None,
}

impl ConnectionClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionClass::Full => "full",
            ConnectionClass::Limited => "limited",
            ConnectionClass::None => "none",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "full" => Some(ConnectionClass::Full),
            "limited" => Some(ConnectionClass::Limited),
            "none" => Some(ConnectionClass::None),
            _ => None,
        }
    }

    fn from_success_rate(rate: f64) -> Self {
        if rate >= 0.5 {
            ConnectionClass::Full
        } else if rate > 0.0 {
            ConnectionClass::Limited
        } else {
            ConnectionClass::None
        }
    }
}

impl fmt::Display for ConnectionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectivityStatus {
    pub has_network: bool,
    pub has_backend_access: bool,
    pub connection_class: ConnectionClass,
    pub last_checked_at: DateTime<Utc>,
}

impl ConnectivityStatus {
    fn offline(at: DateTime<Utc>) -> Self {
        Self {
            has_network: false,
            has_backend_access: false,
            connection_class: ConnectionClass::None,
            last_checked_at: at,
        }
    }
}

/// Reacts to network transitions reported by the platform.
#[async_trait]
pub trait ConnectivityListener: Send + Sync {
    /// The platform reported the network is back. `status` is a fresh probe.
    async fn on_online(&self, status: &ConnectivityStatus);

    /// The platform reported the network is gone.
    async fn on_offline(&self) {}
}

#[derive(Default)]
struct MonitorState {
    cached: Option<ConnectivityStatus>,
    class: Option<ConnectionClass>,
    offline_signaled: bool,
}

/// Probe-based connectivity monitor.
pub struct ConnectivityMonitor {
    http: Arc<dyn HttpClient>,
    endpoints: Vec<String>,
    probe_timeout: Duration,
    validity: Duration,
    clock: Arc<dyn Clock>,
    cache: Arc<dyn LocalCache>,
    events: EventBus,
    state: Mutex<MonitorState>,
    /// Held while a checking round runs so concurrent `check` calls share it
    round: Mutex<()>,
}

impl ConnectivityMonitor {
    pub fn new(
        http: Arc<dyn HttpClient>,
        endpoints: Vec<String>,
        probe_timeout: Duration,
        validity: Duration,
        clock: Arc<dyn Clock>,
        cache: Arc<dyn LocalCache>,
        events: EventBus,
    ) -> Self {
        Self {
            http,
            endpoints,
            probe_timeout,
            validity,
            clock,
            cache,
            events,
            state: Mutex::new(MonitorState::default()),
            round: Mutex::new(()),
        }
    }

    /// Seed the current class from the value persisted by a previous run, so
    /// the first probe after startup does not report a spurious change.
    pub async fn restore_previous_class(&self) {
        match self.cache.get_sync_metadata().await {
            Ok(metadata) => {
                let restored = metadata
                    .previous_connection_class
                    .as_deref()
                    .and_then(ConnectionClass::parse);
                if restored.is_some() {
                    self.state.lock().await.class = restored;
                }
            }
            Err(e) => warn!(error = %e, "Could not read previous connection class"),
        }
    }

    /// Connectivity status, reusing the last result within the validity window.
    pub async fn check(&self) -> ConnectivityStatus {
        if let Some(cached) = self.cached_status().await {
            return cached;
        }

        // Callers that queued behind a running round pick up its result.
        let _round = self.round.lock().await;
        if let Some(cached) = self.cached_status().await {
            return cached;
        }

        self.check_fresh().await
    }

    async fn cached_status(&self) -> Option<ConnectivityStatus> {
        let state = self.state.lock().await;
        state
            .cached
            .as_ref()
            .filter(|cached| self.is_fresh(cached))
            .cloned()
    }

    /// Probe now, ignoring the validity window.
    pub async fn check_fresh(&self) -> ConnectivityStatus {
        let rate = self.probe_success_rate().await;
        let computed = ConnectionClass::from_success_rate(rate);
        let now = self.clock.now();

        let (status, change) = {
            let mut state = self.state.lock().await;
            let previous = state.class;

            let status = match (computed, previous) {
                (ConnectionClass::None, Some(kept @ (ConnectionClass::Full | ConnectionClass::Limited)))
                    if !state.offline_signaled =>
                {
                    debug!(kept = %kept, "All probes failed, holding class until offline is signaled");
                    ConnectivityStatus {
                        has_network: true,
                        has_backend_access: false,
                        connection_class: kept,
                        last_checked_at: now,
                    }
                }
                _ => {
                    if computed != ConnectionClass::None {
                        state.offline_signaled = false;
                    }
                    ConnectivityStatus {
                        has_network: rate > 0.0,
                        has_backend_access: rate >= 0.5,
                        connection_class: computed,
                        last_checked_at: now,
                    }
                }
            };

            state.cached = Some(status.clone());
            let change = apply_class(&mut state, status.connection_class);
            (status, change)
        };

        if let Some(from) = change {
            self.announce_change(from, &status).await;
        }

        status
    }

    /// Explicit offline signal from the platform or host. Applies `None`
    /// immediately and caches it for the validity window.
    pub async fn mark_offline(&self) {
        let status = ConnectivityStatus::offline(self.clock.now());

        let change = {
            let mut state = self.state.lock().await;
            state.offline_signaled = true;
            state.cached = Some(status.clone());
            apply_class(&mut state, ConnectionClass::None)
        };

        if let Some(from) = change {
            self.announce_change(from, &status).await;
        }
    }

    /// The network came back. Drops the cached status so the next check probes.
    pub async fn mark_online(&self) {
        let mut state = self.state.lock().await;
        state.offline_signaled = false;
        state.cached = None;
    }

    /// Last applied class, if any check ran (or was restored).
    pub async fn current_class(&self) -> Option<ConnectionClass> {
        self.state.lock().await.class
    }

    /// Follow platform network changes until `token` is cancelled.
    ///
    /// `Disconnected` marks the monitor offline and notifies listeners;
    /// `Connected` marks it online, probes and notifies listeners in order.
    pub fn watch_network(
        self: &Arc<Self>,
        network: Arc<dyn NetworkMonitor>,
        listeners: Vec<Arc<dyn ConnectivityListener>>,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let monitor = Arc::clone(self);

        tokio::spawn(async move {
            let mut changes = match network.subscribe_changes().await {
                Ok(changes) => changes,
                Err(e) => {
                    warn!(error = %e, "Network change subscription unavailable");
                    return;
                }
            };

            loop {
                let info = tokio::select! {
                    _ = token.cancelled() => break,
                    info = changes.next() => match info {
                        Some(info) => info,
                        None => break,
                    },
                };

                match info.status {
                    NetworkStatus::Disconnected => {
                        monitor.mark_offline().await;
                        for listener in &listeners {
                            listener.on_offline().await;
                        }
                    }
                    NetworkStatus::Connected => {
                        monitor.mark_online().await;
                        let status = monitor.check_fresh().await;
                        for listener in &listeners {
                            listener.on_online(&status).await;
                        }
                    }
                    NetworkStatus::Indeterminate => {}
                }
            }

            debug!("Network watcher stopped");
        })
    }

    fn is_fresh(&self, status: &ConnectivityStatus) -> bool {
        match (self.clock.now() - status.last_checked_at).to_std() {
            Ok(age) => age < self.validity,
            Err(_) => false,
        }
    }

    async fn probe_success_rate(&self) -> f64 {
        if self.endpoints.is_empty() {
            return 0.0;
        }

        let cache_buster = self.clock.unix_timestamp_millis();
        let probes = self.endpoints.iter().map(|endpoint| {
            let request = HttpRequest::head(endpoint.as_str())
                .cache_busted(cache_buster)
                .timeout(self.probe_timeout);
            let http = Arc::clone(&self.http);
            async move {
                match tokio::time::timeout(self.probe_timeout, http.execute(request)).await {
                    Ok(Ok(_)) => true,
                    Ok(Err(e)) => {
                        debug!(endpoint = %endpoint, error = %e, "Probe failed");
                        false
                    }
                    Err(_) => {
                        debug!(endpoint = %endpoint, "Probe timed out");
                        false
                    }
                }
            }
        });

        let results = join_all(probes).await;
        let successes = results.iter().filter(|ok| **ok).count();
        successes as f64 / results.len() as f64
    }

    async fn announce_change(&self, from: Option<ConnectionClass>, status: &ConnectivityStatus) {
        let from = from.map(|c| c.as_str()).unwrap_or("unknown");
        let to = status.connection_class.as_str();
        info!(
            from,
            to,
            has_network = status.has_network,
            has_backend_access = status.has_backend_access,
            "Connection class changed"
        );

        self.events
            .emit(CoreEvent::Connectivity(ConnectivityEvent::ClassChanged {
                from: from.to_string(),
                to: to.to_string(),
                has_network: status.has_network,
                has_backend_access: status.has_backend_access,
            }))
            .ok();

        if let Err(e) = self.cache.set_previous_connection_class(to).await {
            warn!(error = %e, "Failed to persist connection class");
        }
    }
}

/// Record `class` as current. Returns the previous class when it changed.
fn apply_class(
    state: &mut MonitorState,
    class: ConnectionClass,
) -> Option<Option<ConnectionClass>> {
    if state.class == Some(class) {
        return None;
    }
    let previous = state.class;
    state.class = Some(class);
    Some(previous)
}
