//! Core service façade and bootstrap.
//!
//! [`SyncEngine`] wires host-provided bridges (HTTP, backend, network
//! monitor, clock) into the cache, the sync orchestrator and its scheduler.
//! Desktop hosts typically enable the `desktop-shims` feature, which supplies
//! a reqwest-backed HTTP client when none is configured and re-exports the
//! `bridge-desktop` adapters.
//!
//! ```ignore
//! use core_runtime::config::{EngineConfig, RemoteSourceConfig};
//! use core_service::SyncEngine;
//!
//! let config = EngineConfig::builder()
//!     .database_path("catalog.db")
//!     .backend_client(backend)
//!     .remote_source(RemoteSourceConfig::new("https://cdn.example.com/catalog.json", 0))
//!     .build()?;
//!
//! let engine = SyncEngine::bootstrap(config).await?;
//! engine.start().await;
//! let _updates = engine.subscribe_to_updates(|counts| println!("{} channels", counts.channels));
//! ```

pub mod error;

pub use error::{CoreError, Result};

#[cfg(all(feature = "desktop-shims", not(target_arch = "wasm32")))]
pub use bridge_desktop::{DesktopNetworkMonitor, PostgrestBackendClient, ReqwestHttpClient};

use bridge_traits::NetworkMonitor;
use chrono::{DateTime, Utc};
use core_cache::{
    create_pool, CachedEntity, DatabaseConfig, EntityCounts, EntityKind, LocalCache,
    SqliteLocalCache,
};
use core_runtime::config::{DatabaseLocation, EngineConfig, FeatureFlags};
use core_runtime::events::{CoreEvent, EventBus, EventStream, SyncEvent};
use core_sync::{
    CatalogFetcher, ConnectivityListener, ConnectivityMonitor, ConnectivityStatus, ErrorRecord,
    RealtimeListener, RemoteSourceResolver, RepairEngine, Scheduler, Subscription,
    SyncComponents, SyncOrchestrator, SyncOutcome, SyncStateSnapshot,
};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 256;

/// Explicit acknowledgement required by [`SyncEngine::reset_cache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetConfirmation {
    _private: (),
}

impl ResetConfirmation {
    /// The caller has confirmed that every cached entity and all sync
    /// bookkeeping may be deleted.
    pub fn confirmed() -> Self {
        Self { _private: () }
    }
}

/// Handle returned by [`SyncEngine::subscribe_to_updates`]. Dropping it
/// unsubscribes as well.
pub struct UpdateSubscription {
    forwarder: JoinHandle<()>,
}

impl UpdateSubscription {
    pub fn unsubscribe(self) {
        self.forwarder.abort();
    }
}

impl Drop for UpdateSubscription {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

/// Background tasks owned between `start` and `shutdown`.
struct Background {
    token: CancellationToken,
    watcher: Option<JoinHandle<()>>,
    realtime: Option<Subscription>,
}

/// Primary façade exposed to host applications.
pub struct SyncEngine {
    cache: Arc<dyn LocalCache>,
    connectivity: Arc<ConnectivityMonitor>,
    resolver: Arc<RemoteSourceResolver>,
    orchestrator: Arc<SyncOrchestrator>,
    scheduler: Scheduler,
    realtime: Arc<RealtimeListener>,
    network_monitor: Option<Arc<dyn NetworkMonitor>>,
    features: FeatureFlags,
    events: EventBus,
    background: Mutex<Option<Background>>,
}

impl SyncEngine {
    /// Open the cache and build every component.
    ///
    /// Recovers from a pass interrupted by a previous crash and restores the
    /// last known connection class. No background work starts until
    /// [`start`](Self::start).
    pub async fn bootstrap(config: EngineConfig) -> Result<Self> {
        config.validate()?;

        let db_config = match &config.database {
            DatabaseLocation::File(path) => DatabaseConfig::new(path.clone()),
            DatabaseLocation::InMemory => DatabaseConfig::in_memory(),
        };
        let pool = create_pool(db_config).await?;
        let cache: Arc<dyn LocalCache> = Arc::new(SqliteLocalCache::new(pool));

        let events = EventBus::new(EVENT_CAPACITY);
        let clock = Arc::clone(&config.clock);
        let http = Arc::clone(&config.http_client);
        let timings = &config.timings;

        let connectivity = Arc::new(ConnectivityMonitor::new(
            Arc::clone(&http),
            config.probe_endpoints.clone(),
            timings.probe_timeout,
            timings.connectivity_validity,
            Arc::clone(&clock),
            Arc::clone(&cache),
            events.clone(),
        ));
        let resolver = Arc::new(RemoteSourceResolver::new(
            Arc::clone(&http),
            &config.remote_sources,
            timings.probe_timeout,
            timings.source_cache_ttl,
            Arc::clone(&clock),
            events.clone(),
        ));

        let orchestrator = Arc::new(SyncOrchestrator::new(
            SyncComponents {
                connectivity: Arc::clone(&connectivity),
                resolver: Arc::clone(&resolver),
                fetcher: CatalogFetcher::new(http, Arc::clone(&clock), timings.fetch_timeout),
                repair: RepairEngine::new(
                    Arc::clone(&config.backend_client),
                    Arc::clone(&cache),
                    timings.probe_timeout,
                ),
                backend: Arc::clone(&config.backend_client),
                cache: Arc::clone(&cache),
                events: events.clone(),
                clock,
            },
            timings,
            &config.notices,
        ));

        if orchestrator.recover_interrupted().await? {
            warn!("Recovered from an interrupted sync pass");
        }
        connectivity.restore_previous_class().await;

        let scheduler = Scheduler::new(
            Arc::clone(&orchestrator),
            config.retry,
            config.timings.clone(),
            config.features,
        );
        let realtime = Arc::new(RealtimeListener::new(
            Arc::clone(&config.backend_client),
            events.clone(),
        ));

        info!(
            sources = config.remote_sources.len(),
            database = ?config.database,
            "Sync engine ready"
        );

        Ok(Self {
            cache,
            connectivity,
            resolver,
            orchestrator,
            scheduler,
            realtime,
            network_monitor: config.network_monitor,
            features: config.features,
            events,
            background: Mutex::new(None),
        })
    }

    /// Start the scheduler loops, the network watcher and, when enabled, the
    /// realtime listener. Runs one non-forced pass right away. Calling it
    /// again while started does nothing.
    pub async fn start(&self) {
        let mut background = self.background.lock().await;
        if background.is_some() {
            debug!("Sync engine already started");
            return;
        }

        let token = CancellationToken::new();
        self.scheduler.start(token.child_token());

        let realtime = self.start_realtime().await;

        let watcher = self.network_monitor.as_ref().map(|network| {
            let mut listeners: Vec<Arc<dyn ConnectivityListener>> = vec![
                Arc::clone(&self.resolver) as Arc<dyn ConnectivityListener>,
                Arc::new(self.scheduler.clone()) as Arc<dyn ConnectivityListener>,
            ];
            if realtime.is_some() {
                listeners.push(Arc::clone(&self.realtime) as Arc<dyn ConnectivityListener>);
            }
            self.connectivity
                .watch_network(Arc::clone(network), listeners, token.child_token())
        });

        let scheduler = self.scheduler.clone();
        tokio::spawn(async move {
            let _ = scheduler.trigger_periodic().await;
        });

        *background = Some(Background {
            token,
            watcher,
            realtime,
        });
        info!(
            periodic = self.features.enable_periodic_sync,
            realtime = self.features.enable_realtime,
            "Sync engine started"
        );
    }

    /// Stop every background task and drop a pending retry. A pass already
    /// running completes.
    pub async fn shutdown(&self) {
        if let Some(background) = self.background.lock().await.take() {
            background.token.cancel();
            if let Some(subscription) = background.realtime {
                subscription.unsubscribe().await;
            }
            if let Some(watcher) = background.watcher {
                let _ = watcher.await;
            }
            info!("Sync engine stopped");
        }

        self.scheduler.stop().await;
    }

    pub async fn check_connectivity(&self) -> ConnectivityStatus {
        self.connectivity.check().await
    }

    /// Manual pass. A recoverable failure schedules a backoff retry.
    pub async fn sync(&self, force: bool) -> std::result::Result<SyncOutcome, ErrorRecord> {
        self.scheduler.trigger_now(force).await
    }

    pub async fn get_last_sync_time(&self) -> Option<DateTime<Utc>> {
        self.orchestrator.last_sync_time().await
    }

    /// Call `on_update` with the entity counts after every successful pass.
    pub fn subscribe_to_updates<F>(&self, on_update: F) -> UpdateSubscription
    where
        F: Fn(EntityCounts) + Send + Sync + 'static,
    {
        let mut receiver = self.events.subscribe();

        let forwarder = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(CoreEvent::Sync(SyncEvent::EntitiesUpdated {
                        channels,
                        categories,
                        countries,
                        settings,
                        ..
                    })) => on_update(EntityCounts {
                        channels,
                        categories,
                        countries,
                        settings,
                    }),
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Update subscriber lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        UpdateSubscription { forwarder }
    }

    pub async fn resolve_available_source(&self) -> Option<String> {
        self.resolver.resolve().await.map(|candidate| candidate.url)
    }

    pub async fn state(&self) -> SyncStateSnapshot {
        self.orchestrator.state().await
    }

    pub async fn read_entities(&self, kind: EntityKind) -> Result<Vec<CachedEntity>> {
        Ok(self.cache.read_all(kind).await?)
    }

    /// Admin write-back. Not paused during a pass; the last completed write
    /// wins.
    pub async fn upsert_entity(&self, entity: &CachedEntity) -> Result<()> {
        Ok(self.cache.upsert_entity(entity).await?)
    }

    pub async fn delete_entity(&self, kind: EntityKind, id: &str) -> Result<bool> {
        Ok(self.cache.delete_entity(kind, id).await?)
    }

    /// Delete every cached entity and all sync bookkeeping.
    ///
    /// # Errors
    ///
    /// `SyncInProgress` while a pass is running.
    pub async fn reset_cache(&self, _confirm: ResetConfirmation) -> Result<()> {
        if !self.orchestrator.reset().await? {
            return Err(CoreError::SyncInProgress);
        }

        warn!("Local catalog cache reset");
        Ok(())
    }

    pub async fn dismiss_notice(&self) -> bool {
        self.orchestrator.dismiss_notice().await
    }

    /// Explicit offline signal from the host.
    pub async fn mark_offline(&self) {
        self.connectivity.mark_offline().await;
        self.realtime.teardown().await;
    }

    /// Explicit online signal from the host. Probes, then runs the same
    /// reconnect handling as the network watcher.
    pub async fn mark_online(&self) {
        self.connectivity.mark_online().await;
        let status = self.connectivity.check_fresh().await;

        self.resolver.on_online(&status).await;
        self.scheduler.on_online(&status).await;
        self.realtime.on_connectivity(&status).await;
    }

    /// Raw event stream.
    pub fn events(&self) -> EventStream {
        EventStream::new(self.events.subscribe())
    }

    #[cfg(feature = "realtime")]
    async fn start_realtime(&self) -> Option<Subscription> {
        if !self.features.enable_realtime {
            return None;
        }

        let scheduler = self.scheduler.clone();
        let subscription = self.realtime.subscribe(Arc::new(move |table: String| {
            debug!(table = %table, "Change hint, requesting a pass");
            let scheduler = scheduler.clone();
            tokio::spawn(async move {
                let _ = scheduler.trigger_realtime().await;
            });
        }));

        let status = self.connectivity.check().await;
        self.realtime.on_connectivity(&status).await;
        Some(subscription)
    }

    #[cfg(not(feature = "realtime"))]
    async fn start_realtime(&self) -> Option<Subscription> {
        if self.features.enable_realtime {
            warn!("Realtime requested but the `realtime` feature is not compiled in");
        }
        None
    }
}
