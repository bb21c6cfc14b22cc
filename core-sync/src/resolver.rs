//! # Remote Source Resolver
//!
//! Picks the first reachable catalog source in priority order. A resolved
//! source is reused for the cache TTL; reconnects call
//! [`RemoteSourceResolver::invalidate`] so a stale choice never outlives a
//! network change.

use crate::connectivity::{ConnectivityListener, ConnectivityStatus};
use async_trait::async_trait;
use bridge_traits::{Clock, HttpClient, HttpRequest};
use chrono::{DateTime, Utc};
use core_runtime::config::RemoteSourceConfig;
use core_runtime::events::{ConnectivityEvent, CoreEvent, EventBus};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

/// Upper bound on a single availability probe.
const MAX_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSourceCandidate {
    pub url: String,
    pub priority: u32,
    pub last_known_available: Option<DateTime<Utc>>,
}

impl From<&RemoteSourceConfig> for RemoteSourceCandidate {
    fn from(config: &RemoteSourceConfig) -> Self {
        Self {
            url: config.url.clone(),
            priority: config.priority,
            last_known_available: None,
        }
    }
}

struct ResolverState {
    candidates: Vec<RemoteSourceCandidate>,
    /// Index into `candidates` and when it was resolved.
    resolved: Option<(usize, DateTime<Utc>)>,
}

pub struct RemoteSourceResolver {
    http: Arc<dyn HttpClient>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    probe_timeout: Duration,
    ttl: Duration,
    state: Mutex<ResolverState>,
}

impl RemoteSourceResolver {
    pub fn new(
        http: Arc<dyn HttpClient>,
        sources: &[RemoteSourceConfig],
        probe_timeout: Duration,
        ttl: Duration,
        clock: Arc<dyn Clock>,
        events: EventBus,
    ) -> Self {
        let mut candidates: Vec<RemoteSourceCandidate> =
            sources.iter().map(RemoteSourceCandidate::from).collect();
        // Stable: equal priorities keep configuration order.
        candidates.sort_by_key(|c| c.priority);

        Self {
            http,
            clock,
            events,
            probe_timeout: probe_timeout.min(MAX_PROBE_TIMEOUT),
            ttl,
            state: Mutex::new(ResolverState {
                candidates,
                resolved: None,
            }),
        }
    }

    /// First available candidate, reusing a resolution younger than the TTL.
    pub async fn resolve(&self) -> Option<RemoteSourceCandidate> {
        {
            let state = self.state.lock().await;
            if let Some((index, at)) = state.resolved {
                let fresh = (self.clock.now() - at)
                    .to_std()
                    .map(|age| age < self.ttl)
                    .unwrap_or(false);
                if fresh {
                    return state.candidates.get(index).cloned();
                }
            }
        }

        self.revalidate().await
    }

    /// Probe every candidate in priority order, ignoring any cached result.
    #[instrument(skip(self))]
    pub async fn revalidate(&self) -> Option<RemoteSourceCandidate> {
        let candidates = self.state.lock().await.candidates.clone();

        for (index, candidate) in candidates.iter().enumerate() {
            if !self.probe(&candidate.url).await {
                continue;
            }

            let now = self.clock.now();
            let resolved = {
                let mut state = self.state.lock().await;
                state.resolved = Some((index, now));
                let entry = &mut state.candidates[index];
                entry.last_known_available = Some(now);
                entry.clone()
            };

            info!(url = %resolved.url, priority = resolved.priority, "Remote source resolved");
            self.events
                .emit(CoreEvent::Connectivity(ConnectivityEvent::SourceResolved {
                    url: resolved.url.clone(),
                }))
                .ok();
            return Some(resolved);
        }

        self.state.lock().await.resolved = None;
        warn!(candidates = candidates.len(), "No remote source available");
        self.events
            .emit(CoreEvent::Connectivity(ConnectivityEvent::SourceUnavailable))
            .ok();
        None
    }

    /// Forget the cached resolution.
    pub async fn invalidate(&self) {
        self.state.lock().await.resolved = None;
        debug!("Remote source resolution invalidated");
    }

    /// Candidates in probe order, with their availability stamps.
    pub async fn candidates(&self) -> Vec<RemoteSourceCandidate> {
        self.state.lock().await.candidates.clone()
    }

    async fn probe(&self, url: &str) -> bool {
        let request = HttpRequest::head(url)
            .cache_busted(self.clock.unix_timestamp_millis())
            .timeout(self.probe_timeout);

        match tokio::time::timeout(self.probe_timeout, self.http.execute(request)).await {
            Ok(Ok(response)) if response.is_success() || response.is_redirect() => true,
            Ok(Ok(response)) => {
                debug!(url, status = response.status, "Source answered but is not available");
                false
            }
            Ok(Err(e)) => {
                debug!(url, error = %e, "Source probe failed");
                false
            }
            Err(_) => {
                debug!(url, "Source probe timed out");
                false
            }
        }
    }
}

#[async_trait]
impl ConnectivityListener for RemoteSourceResolver {
    async fn on_online(&self, _status: &ConnectivityStatus) {
        self.invalidate().await;
    }
}
