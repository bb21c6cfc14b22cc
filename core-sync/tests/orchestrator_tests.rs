//! End-to-end sync passes against in-memory fakes and a real SQLite cache.

use async_trait::async_trait;
use bridge_traits::backend::row_id;
use bridge_traits::{
    BackendClient, BridgeError, ChangeFeed, Clock, FixedClock, HttpClient, HttpMethod, HttpRequest,
    HttpResponse,
};
use bytes::Bytes;
use chrono::{Duration as ChronoDuration, Utc};
use core_cache::{create_test_pool, EntityKind, LocalCache, SqliteLocalCache};
use core_runtime::config::{FeatureFlags, NoticePolicy, RemoteSourceConfig, RetryPolicy, SyncTimings};
use core_runtime::events::{CoreEvent, EventBus, SyncEvent};
use core_sync::{
    CatalogFetcher, ConnectivityMonitor, ErrorKind, RemoteSourceResolver, RepairEngine, Scheduler,
    SkipReason, SyncComponents, SyncOrchestrator, SyncOutcome, SyncRequest, SyncStatus,
};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast::Receiver;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

const PROBE: &str = "https://probe.test/health";
const SOURCE: &str = "https://catalog.test/catalog.json";

// ============================================================================
// Fakes
// ============================================================================

struct FetchHold {
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

/// Probes answer while `online`; the source answers HEAD while `online` and
/// GET from the script, falling back to the default catalog.
struct FakeHttp {
    online: AtomicBool,
    get_script: Mutex<VecDeque<bridge_traits::error::Result<HttpResponse>>>,
    get_failure: Mutex<Option<String>>,
    hold: Mutex<Option<FetchHold>>,
}

impl FakeHttp {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            online: AtomicBool::new(true),
            get_script: Mutex::new(VecDeque::new()),
            get_failure: Mutex::new(None),
            hold: Mutex::new(None),
        })
    }

    fn script_get(&self, response: bridge_traits::error::Result<HttpResponse>) {
        self.get_script.lock().unwrap().push_back(response);
    }

    fn fail_gets(&self, message: Option<&str>) {
        *self.get_failure.lock().unwrap() = message.map(str::to_string);
    }

    /// The next GET signals `entered` and waits for `release`.
    fn hold_next_get(&self) -> (Arc<Notify>, Arc<Notify>) {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        *self.hold.lock().unwrap() = Some(FetchHold {
            entered: entered.clone(),
            release: release.clone(),
        });
        (entered, release)
    }
}

fn json_response(status: u16, body: Value) -> HttpResponse {
    HttpResponse {
        status,
        headers: HashMap::new(),
        body: Bytes::from(serde_json::to_vec(&body).unwrap()),
    }
}

fn empty_response(status: u16) -> HttpResponse {
    HttpResponse {
        status,
        headers: HashMap::new(),
        body: Bytes::new(),
    }
}

fn catalog() -> Value {
    json!({
        "channels": [
            { "id": 1, "name": "News 24", "streamUrl": "https://stream.test/1.m3u8", "category": "news", "country": "fr" },
            { "id": "2", "name": "Sport Live", "stream_url": "https://stream.test/2.m3u8" }
        ],
        "categories": [{ "id": "news", "name": "News" }],
        "countries": [{ "id": "fr", "name": "France", "flag": "fr.png" }],
        "settings": { "id": 1, "theme": "dark" }
    })
}

#[async_trait]
impl HttpClient for FakeHttp {
    async fn execute(&self, request: HttpRequest) -> bridge_traits::error::Result<HttpResponse> {
        let online = self.online.load(Ordering::SeqCst);

        if request.url.starts_with(PROBE) {
            return if online {
                Ok(empty_response(204))
            } else {
                Err(BridgeError::OperationFailed("Connection failed".into()))
            };
        }

        if !request.url.starts_with(SOURCE) {
            return Err(BridgeError::OperationFailed(format!("unknown url {}", request.url)));
        }

        if matches!(request.method, HttpMethod::Head) {
            return if online {
                Ok(empty_response(200))
            } else {
                Err(BridgeError::OperationFailed("Connection failed".into()))
            };
        }

        let hold = self.hold.lock().unwrap().take();
        if let Some(hold) = hold {
            hold.entered.notify_one();
            hold.release.notified().await;
        }

        if let Some(message) = self.get_failure.lock().unwrap().clone() {
            return Err(BridgeError::OperationFailed(message));
        }

        let scripted = self.get_script.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| Ok(json_response(200, catalog())))
    }
}

/// Holds the backend `settings` table. Upserts fail with a unique violation
/// while it holds more than one row, as the real table does once a second
/// row slipped in under a different key.
struct FakeBackend {
    reachable: AtomicBool,
    settings: Mutex<Vec<Value>>,
    upserts: AtomicUsize,
    /// `(code, message)` returned by every upsert while set
    upsert_failure: Mutex<Option<(String, String)>>,
}

impl FakeBackend {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            reachable: AtomicBool::new(true),
            settings: Mutex::new(vec![json!({ "id": 1, "theme": "dark" })]),
            upserts: AtomicUsize::new(0),
            upsert_failure: Mutex::new(None),
        })
    }

    fn fail_upserts(&self, code: &str, message: &str) {
        *self.upsert_failure.lock().unwrap() = Some((code.to_string(), message.to_string()));
    }
}

#[async_trait]
impl BackendClient for FakeBackend {
    async fn ping(&self) -> bridge_traits::error::Result<()> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BridgeError::OperationFailed("Connection refused".into()))
        }
    }

    async fn list_rows(&self, _table: &str) -> bridge_traits::error::Result<Vec<Value>> {
        Ok(self.settings.lock().unwrap().clone())
    }

    async fn upsert_rows(&self, _table: &str, rows: &[Value]) -> bridge_traits::error::Result<u64> {
        self.upserts.fetch_add(1, Ordering::SeqCst);
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(BridgeError::OperationFailed("Connection refused".into()));
        }
        if let Some((code, message)) = self.upsert_failure.lock().unwrap().clone() {
            return Err(BridgeError::Backend {
                code: Some(code),
                message,
            });
        }

        let mut table = self.settings.lock().unwrap();
        if table.len() > 1 {
            return Err(BridgeError::Backend {
                code: Some("23505".into()),
                message: "duplicate key value violates unique constraint \"settings_pkey\" (Key (id)=(1) already exists.)".into(),
            });
        }
        for row in rows {
            let id = row_id(row);
            table.retain(|existing| row_id(existing) != id);
            table.push(row.clone());
        }
        Ok(rows.len() as u64)
    }

    async fn delete_rows(&self, _table: &str, ids: &[String]) -> bridge_traits::error::Result<u64> {
        let mut rows = self.settings.lock().unwrap();
        let before = rows.len();
        rows.retain(|row| row_id(row).map_or(true, |id| !ids.contains(&id)));
        Ok((before - rows.len()) as u64)
    }

    async fn subscribe_changes(&self) -> bridge_traits::error::Result<Box<dyn ChangeFeed>> {
        Err(BridgeError::NotAvailable("realtime".into()))
    }
}

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    orchestrator: Arc<SyncOrchestrator>,
    http: Arc<FakeHttp>,
    backend: Arc<FakeBackend>,
    cache: Arc<SqliteLocalCache>,
    clock: Arc<FixedClock>,
    events: Receiver<CoreEvent>,
}

impl Harness {
    async fn new() -> Self {
        let http = FakeHttp::new();
        let backend = FakeBackend::new();
        let cache = Arc::new(SqliteLocalCache::new(create_test_pool().await.unwrap()));
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let bus = EventBus::new(256);
        let events = bus.subscribe();
        let timings = SyncTimings::default();

        let components = SyncComponents {
            connectivity: Arc::new(ConnectivityMonitor::new(
                http.clone(),
                vec![PROBE.to_string()],
                timings.probe_timeout,
                timings.connectivity_validity,
                clock.clone(),
                cache.clone(),
                bus.clone(),
            )),
            resolver: Arc::new(RemoteSourceResolver::new(
                http.clone(),
                &[RemoteSourceConfig::new(SOURCE, 0)],
                timings.probe_timeout,
                timings.source_cache_ttl,
                clock.clone(),
                bus.clone(),
            )),
            fetcher: CatalogFetcher::new(http.clone(), clock.clone(), timings.fetch_timeout),
            repair: RepairEngine::new(backend.clone(), cache.clone(), timings.probe_timeout),
            backend: backend.clone(),
            cache: cache.clone(),
            events: bus,
            clock: clock.clone(),
        };

        let orchestrator = Arc::new(SyncOrchestrator::new(
            components,
            &timings,
            &NoticePolicy::default(),
        ));

        Self {
            orchestrator,
            http,
            backend,
            cache,
            clock,
            events,
        }
    }

    /// Step past the manual minimum interval.
    fn tick(&self) {
        self.clock.advance(ChronoDuration::seconds(4));
    }

    fn sync_events(&mut self) -> Vec<SyncEvent> {
        let mut seen = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            if let CoreEvent::Sync(event) = event {
                seen.push(event);
            }
        }
        seen
    }
}

fn notices_raised(events: &[SyncEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, SyncEvent::NoticeRaised { .. }))
        .count()
}

// ============================================================================
// Gates
// ============================================================================

#[tokio::test]
async fn test_single_flight_queues_forced_and_skips_others() {
    let h = Harness::new().await;
    let (entered, release) = h.http.hold_next_get();
    let refire = h.orchestrator.refire_signal();

    let orchestrator = h.orchestrator.clone();
    let first = tokio::spawn(async move { orchestrator.sync(SyncRequest::manual(true)).await });
    entered.notified().await;

    assert!(h.orchestrator.state().await.in_flight);
    assert_eq!(
        h.orchestrator.sync(SyncRequest::periodic()).await,
        Ok(SyncOutcome::Skipped(SkipReason::InFlight))
    );
    assert_eq!(
        h.orchestrator.sync(SyncRequest::realtime()).await,
        Ok(SyncOutcome::Skipped(SkipReason::InFlight))
    );
    assert_eq!(
        h.orchestrator.sync(SyncRequest::manual(true)).await,
        Ok(SyncOutcome::Queued)
    );
    assert_eq!(
        h.orchestrator.sync(SyncRequest::manual(false)).await,
        Ok(SyncOutcome::Queued)
    );

    release.notify_one();
    let outcome = first.await.unwrap();
    assert!(matches!(outcome, Ok(SyncOutcome::Completed { .. })));
    assert!(!h.orchestrator.state().await.in_flight);

    // Two queued requests, one re-fire.
    tokio::time::timeout(Duration::from_secs(1), refire.notified())
        .await
        .expect("queued pass released");
    assert!(
        tokio::time::timeout(Duration::from_millis(50), refire.notified())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn test_staleness_and_manual_interval_gates() {
    let h = Harness::new().await;

    assert!(matches!(
        h.orchestrator.sync(SyncRequest::manual(false)).await,
        Ok(SyncOutcome::Completed { .. })
    ));

    // Fresh cache: non-forced triggers are skipped.
    h.tick();
    assert_eq!(
        h.orchestrator.sync(SyncRequest::periodic()).await,
        Ok(SyncOutcome::Skipped(SkipReason::Fresh))
    );

    // Forced but too soon after the previous manual start.
    h.clock.advance(ChronoDuration::seconds(-3));
    assert_eq!(
        h.orchestrator.sync(SyncRequest::manual(true)).await,
        Ok(SyncOutcome::Skipped(SkipReason::TooSoon))
    );

    h.tick();
    assert!(matches!(
        h.orchestrator.sync(SyncRequest::manual(true)).await,
        Ok(SyncOutcome::Completed { .. })
    ));

    // Past the staleness window a periodic pass runs again.
    h.clock.advance(ChronoDuration::minutes(4));
    assert!(h.orchestrator.state().await.is_stale);
    assert!(matches!(
        h.orchestrator.sync(SyncRequest::periodic()).await,
        Ok(SyncOutcome::Completed { .. })
    ));
}

#[tokio::test]
async fn test_periodic_pass_does_not_delay_manual_retry() {
    let h = Harness::new().await;

    assert!(matches!(
        h.orchestrator.sync(SyncRequest::periodic()).await,
        Ok(SyncOutcome::Completed { .. })
    ));
    // Same instant: only manual and retry starts count towards the spacing.
    assert!(matches!(
        h.orchestrator.sync(SyncRequest::manual(true)).await,
        Ok(SyncOutcome::Completed { .. })
    ));
    assert_eq!(
        h.orchestrator.sync(SyncRequest::manual(true)).await,
        Ok(SyncOutcome::Skipped(SkipReason::TooSoon))
    );
}

#[tokio::test]
async fn test_dropped_pass_releases_single_flight() {
    let h = Harness::new().await;
    let (entered, _release) = h.http.hold_next_get();

    let orchestrator = h.orchestrator.clone();
    let pass = tokio::spawn(async move { orchestrator.sync(SyncRequest::manual(true)).await });
    entered.notified().await;
    assert!(h.orchestrator.state().await.in_flight);

    pass.abort();
    assert!(pass.await.unwrap_err().is_cancelled());

    let state = h.orchestrator.state().await;
    assert!(!state.in_flight);
    assert_eq!(state.status, SyncStatus::Idle);

    h.tick();
    assert!(matches!(
        h.orchestrator.sync(SyncRequest::manual(true)).await,
        Ok(SyncOutcome::Completed { .. })
    ));
    assert_eq!(
        h.orchestrator.sync(SyncRequest::periodic()).await,
        Ok(SyncOutcome::Skipped(SkipReason::Fresh))
    );
    assert!(!h.cache.get_sync_metadata().await.unwrap().in_progress);
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_first_sync_populates_cache() {
    let mut h = Harness::new().await;
    assert!(h.orchestrator.last_sync_time().await.is_none());
    assert!(h.orchestrator.state().await.is_stale);

    let outcome = h.orchestrator.sync(SyncRequest::manual(false)).await.unwrap();

    let SyncOutcome::Completed { counts, .. } = outcome else {
        panic!("expected a completed pass, got {outcome:?}");
    };
    assert_eq!(
        (counts.channels, counts.categories, counts.countries, counts.settings),
        (2, 1, 1, 1)
    );
    assert_eq!(h.orchestrator.last_sync_time().await, Some(h.clock.now()));
    assert_eq!(h.cache.count(EntityKind::Channel).await.unwrap(), 2);
    assert_eq!(h.cache.count(EntityKind::Settings).await.unwrap(), 1);

    let metadata = h.cache.get_sync_metadata().await.unwrap();
    assert_eq!(metadata.last_sync_at, Some(h.clock.now()));
    assert!(!metadata.in_progress);

    let state = h.orchestrator.state().await;
    assert_eq!(state.status, SyncStatus::Idle);
    assert!(!state.is_stale);
    assert!(state.last_error.is_none());

    let events = h.sync_events();
    assert!(matches!(events.first(), Some(SyncEvent::Started { forced: false, .. })));
    assert!(events.iter().any(|e| matches!(
        e,
        SyncEvent::EntitiesUpdated { channels: 2, categories: 1, countries: 1, settings: 1, .. }
    )));
}

#[tokio::test]
async fn test_duplicate_settings_repaired_and_reattempted() {
    let mut h = Harness::new().await;
    h.backend
        .settings
        .lock()
        .unwrap()
        .push(json!({ "id": 2, "theme": "light" }));

    let outcome = h.orchestrator.sync(SyncRequest::manual(true)).await;

    assert!(matches!(outcome, Ok(SyncOutcome::Completed { .. })));
    // The rejected write-back, then the one after the repair.
    assert_eq!(h.backend.upserts.load(Ordering::SeqCst), 2);
    assert_eq!(h.backend.settings.lock().unwrap().len(), 1);
    assert_eq!(h.cache.count(EntityKind::Settings).await.unwrap(), 1);
    assert!(h.orchestrator.state().await.last_error.is_none());
    assert!(h.cache.get_sync_metadata().await.unwrap().last_error.is_none());

    let events = h.sync_events();
    assert_eq!(notices_raised(&events), 0);
    assert!(events.iter().any(|e| matches!(e, SyncEvent::Repaired { kind, .. } if kind == "DuplicateKey")));
    assert!(events.iter().any(|e| matches!(e, SyncEvent::EntitiesUpdated { .. })));
}

#[tokio::test]
async fn test_offline_mid_sync_keeps_cache() {
    let mut h = Harness::new().await;
    h.orchestrator.sync(SyncRequest::manual(true)).await.unwrap();
    let before = h.cache.read_all(EntityKind::Channel).await.unwrap();
    h.sync_events();

    h.tick();
    h.http.fail_gets(Some("Connection failed"));
    h.backend.reachable.store(false, Ordering::SeqCst);

    let record = h
        .orchestrator
        .sync(SyncRequest::manual(true))
        .await
        .unwrap_err();

    assert_eq!(record.kind, ErrorKind::Connection);
    assert!(record.recoverable);

    let state = h.orchestrator.state().await;
    assert!(!state.in_flight);
    assert!(state.is_stale);
    assert_eq!(state.last_error.as_ref().map(|e| e.kind), Some(ErrorKind::Connection));
    assert_eq!(h.cache.read_all(EntityKind::Channel).await.unwrap(), before);
    assert!(!h.cache.get_sync_metadata().await.unwrap().in_progress);

    let events = h.sync_events();
    assert!(events.iter().any(|e| matches!(e, SyncEvent::Failed { kind, .. } if kind == "Connection")));
    assert!(!events.iter().any(|e| matches!(e, SyncEvent::Repaired { .. })));
}

#[tokio::test]
async fn test_repeated_network_failures_raise_one_notice() {
    let mut h = Harness::new().await;
    h.http.fail_gets(Some("network is unreachable"));
    h.backend.reachable.store(false, Ordering::SeqCst);

    let mut last = None;
    for _ in 0..5 {
        let record = h
            .orchestrator
            .sync(SyncRequest::manual(true))
            .await
            .unwrap_err();
        assert_eq!(record.kind, ErrorKind::Network);
        last = Some(record);
        h.tick();
    }

    assert_eq!(last.map(|r| r.consecutive_count), Some(5));
    let events = h.sync_events();
    assert_eq!(notices_raised(&events), 1);
    assert!(h.orchestrator.state().await.notice_active);

    // Manual retry once the network is back.
    h.http.fail_gets(None);
    h.backend.reachable.store(true, Ordering::SeqCst);
    let outcome = h.orchestrator.sync(SyncRequest::manual(true)).await;

    assert!(matches!(outcome, Ok(SyncOutcome::Completed { .. })));
    let state = h.orchestrator.state().await;
    assert!(!state.notice_active);
    assert!(state.last_error.is_none());
    assert!(h
        .sync_events()
        .iter()
        .any(|e| matches!(e, SyncEvent::NoticeCleared)));
}

// ============================================================================
// Other paths
// ============================================================================

#[tokio::test]
async fn test_auth_failure_surfaces_immediately() {
    let mut h = Harness::new().await;
    h.http.script_get(Ok(json_response(
        401,
        json!({ "code": "PGRST301", "message": "JWT expired" }),
    )));

    let record = h
        .orchestrator
        .sync(SyncRequest::manual(true))
        .await
        .unwrap_err();

    assert_eq!(record.kind, ErrorKind::Authentication);
    assert!(!record.recoverable);
    assert_eq!(record.consecutive_count, 1);
    assert_eq!(notices_raised(&h.sync_events()), 1);

    assert!(h.orchestrator.dismiss_notice().await);
    assert!(!h.orchestrator.dismiss_notice().await);
    assert!(h
        .sync_events()
        .iter()
        .any(|e| matches!(e, SyncEvent::NoticeCleared)));
}

#[tokio::test]
async fn test_unreachable_backend_serves_cache() {
    let mut h = Harness::new().await;
    h.http.online.store(false, Ordering::SeqCst);

    let mut counts = Vec::new();
    for _ in 0..3 {
        let record = h
            .orchestrator
            .sync(SyncRequest::manual(true))
            .await
            .unwrap_err();
        assert_eq!(record.kind, ErrorKind::Connection);
        counts.push(record.consecutive_count);
        h.tick();
    }

    // Soft failures count every second occurrence.
    assert_eq!(counts, vec![1, 2, 2]);
    let events = h.sync_events();
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, SyncEvent::ServingCache { .. }))
            .count(),
        3
    );
    assert_eq!(notices_raised(&events), 0);
    assert!(h.orchestrator.state().await.is_stale);
}

#[tokio::test]
async fn test_invalid_payload_leaves_cache_untouched() {
    let h = Harness::new().await;
    h.orchestrator.sync(SyncRequest::manual(true)).await.unwrap();
    h.tick();

    h.http.script_get(Ok(HttpResponse {
        status: 200,
        headers: HashMap::new(),
        body: Bytes::from_static(br#"{"channels": [{"id": 1"#),
    }));

    let record = h
        .orchestrator
        .sync(SyncRequest::manual(true))
        .await
        .unwrap_err();

    assert_eq!(record.kind, ErrorKind::Unknown);
    assert_eq!(h.cache.count(EntityKind::Channel).await.unwrap(), 2);
}

#[tokio::test]
async fn test_rejected_settings_write_surfaces_and_keeps_cache() {
    let mut h = Harness::new().await;
    h.orchestrator.sync(SyncRequest::manual(true)).await.unwrap();
    let before = h.cache.read_all(EntityKind::Settings).await.unwrap();
    h.sync_events();
    h.tick();

    h.backend.fail_upserts(
        "23514",
        "new row for relation \"settings\" violates check constraint \"settings_theme_check\"",
    );
    let record = h
        .orchestrator
        .sync(SyncRequest::manual(true))
        .await
        .unwrap_err();

    assert_eq!(record.kind, ErrorKind::ConstraintViolation);
    assert!(!record.recoverable);
    assert_eq!(h.cache.read_all(EntityKind::Settings).await.unwrap(), before);
    assert_eq!(h.cache.count(EntityKind::Channel).await.unwrap(), 2);

    let events = h.sync_events();
    assert_eq!(notices_raised(&events), 1);
    assert!(!events.iter().any(|e| matches!(e, SyncEvent::Repaired { .. })));
}

#[tokio::test]
async fn test_reset_refused_while_pass_in_flight() {
    let h = Harness::new().await;
    h.orchestrator.sync(SyncRequest::manual(true)).await.unwrap();
    h.tick();

    let (entered, release) = h.http.hold_next_get();
    let orchestrator = h.orchestrator.clone();
    let pass = tokio::spawn(async move { orchestrator.sync(SyncRequest::manual(true)).await });
    entered.notified().await;

    assert!(!h.orchestrator.reset().await.unwrap());
    assert_eq!(h.cache.count(EntityKind::Channel).await.unwrap(), 2);

    release.notify_one();
    assert!(matches!(pass.await.unwrap(), Ok(SyncOutcome::Completed { .. })));

    assert!(h.orchestrator.reset().await.unwrap());
    assert_eq!(h.cache.count(EntityKind::Channel).await.unwrap(), 0);
    let state = h.orchestrator.state().await;
    assert!(!state.in_flight);
    assert!(state.last_sync_at.is_none());
    assert!(state.is_stale);
}

#[tokio::test]
async fn test_reset_clears_failure_bookkeeping() {
    let mut h = Harness::new().await;
    h.http.script_get(Ok(json_response(
        401,
        json!({ "code": "PGRST301", "message": "JWT expired" }),
    )));
    h.orchestrator
        .sync(SyncRequest::manual(true))
        .await
        .unwrap_err();
    assert!(h.orchestrator.state().await.notice_active);
    h.sync_events();

    assert!(h.orchestrator.reset().await.unwrap());

    let state = h.orchestrator.state().await;
    assert!(!state.notice_active);
    assert!(state.last_error.is_none());
    assert_eq!(state.status, SyncStatus::Idle);
    assert!(h.cache.get_sync_metadata().await.unwrap().last_error.is_none());
    assert!(h
        .sync_events()
        .iter()
        .any(|e| matches!(e, SyncEvent::NoticeCleared)));

    // A fresh streak: the next hard failure is counted from one again.
    h.tick();
    h.http.fail_gets(Some("network is unreachable"));
    h.backend.reachable.store(false, Ordering::SeqCst);
    let record = h
        .orchestrator
        .sync(SyncRequest::manual(true))
        .await
        .unwrap_err();
    assert_eq!(record.consecutive_count, 1);
    assert_eq!(notices_raised(&h.sync_events()), 0);
}

#[tokio::test]
async fn test_recover_interrupted_clears_flag_and_loads_metadata() {
    let h = Harness::new().await;
    let at = h.clock.now() - ChronoDuration::minutes(1);
    h.cache.set_last_sync_at(at).await.unwrap();
    h.cache.set_in_progress(true).await.unwrap();

    assert!(h.orchestrator.recover_interrupted().await.unwrap());
    assert!(!h.cache.get_sync_metadata().await.unwrap().in_progress);
    assert_eq!(h.orchestrator.last_sync_time().await, Some(at));

    // Inside the staleness window the restored time gates non-forced passes.
    assert_eq!(
        h.orchestrator.sync(SyncRequest::periodic()).await,
        Ok(SyncOutcome::Skipped(SkipReason::Fresh))
    );
    assert!(!h.orchestrator.recover_interrupted().await.unwrap());
}

// ============================================================================
// Scheduler
// ============================================================================

fn scheduler(h: &Harness) -> Scheduler {
    scheduler_with(h, RetryPolicy::default(), SyncTimings::default())
}

fn scheduler_with(h: &Harness, policy: RetryPolicy, timings: SyncTimings) -> Scheduler {
    Scheduler::new(
        h.orchestrator.clone(),
        policy,
        timings,
        FeatureFlags {
            enable_realtime: false,
            enable_periodic_sync: false,
        },
    )
}

fn started(events: &[SyncEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, SyncEvent::Started { .. }))
        .count()
}

#[tokio::test]
async fn test_scheduler_retries_recoverable_failure() {
    let h = Harness::new().await;
    let scheduler = scheduler(&h);
    h.http.fail_gets(Some("network is unreachable"));
    h.backend.reachable.store(false, Ordering::SeqCst);

    assert!(scheduler.trigger_now(true).await.is_err());
    assert!(scheduler.has_pending_retry());

    h.http.fail_gets(None);
    h.backend.reachable.store(true, Ordering::SeqCst);
    tokio::time::timeout(Duration::from_secs(10), async {
        while h.orchestrator.last_sync_time().await.is_none() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("retry pass ran");

    assert!(!scheduler.has_pending_retry());
    assert!(h.orchestrator.state().await.last_error.is_none());
}

#[tokio::test]
async fn test_scheduler_spaces_retries_by_minimum_interval() {
    let mut h = Harness::new().await;
    let policy = RetryPolicy {
        base_delay: Duration::from_millis(20),
        max_delay: Duration::from_millis(40),
        ..RetryPolicy::default()
    };
    let timings = SyncTimings {
        min_manual_retry_interval: Duration::from_millis(400),
        ..SyncTimings::default()
    };
    let scheduler = scheduler_with(&h, policy, timings);
    h.http.fail_gets(Some("network is unreachable"));
    h.backend.reachable.store(false, Ordering::SeqCst);

    let first_failed_at = std::time::Instant::now();
    assert!(scheduler.trigger_now(true).await.is_err());
    assert_eq!(started(&h.sync_events()), 1);

    tokio::time::timeout(Duration::from_secs(5), async {
        while started(&h.sync_events()) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("retry pass ran");

    assert!(first_failed_at.elapsed() >= Duration::from_millis(400));
    scheduler.cancel_retry();
}

#[tokio::test]
async fn test_scheduler_stops_after_max_attempts() {
    let mut h = Harness::new().await;
    let policy = RetryPolicy {
        base_delay: Duration::from_millis(20),
        max_delay: Duration::from_millis(20),
        max_attempts: 3,
        ..RetryPolicy::default()
    };
    let timings = SyncTimings {
        min_manual_retry_interval: Duration::from_millis(50),
        ..SyncTimings::default()
    };
    let scheduler = scheduler_with(&h, policy, timings);
    h.http.fail_gets(Some("network is unreachable"));
    h.backend.reachable.store(false, Ordering::SeqCst);

    assert!(scheduler.trigger_now(true).await.is_err());

    let mut passes = 0;
    tokio::time::timeout(Duration::from_secs(5), async {
        while passes < 3 {
            passes += started(&h.sync_events());
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("retries ran");

    // Well past another retry delay: the chain has stopped.
    tokio::time::sleep(Duration::from_millis(300)).await;
    passes += started(&h.sync_events());
    assert_eq!(passes, 3);
    assert!(!scheduler.has_pending_retry());
    let record = h.orchestrator.state().await.last_error.unwrap();
    assert_eq!(record.consecutive_count, 3);
}

#[tokio::test]
async fn test_scheduler_does_not_retry_auth_failure() {
    let h = Harness::new().await;
    let scheduler = scheduler(&h);
    h.http.script_get(Ok(json_response(
        403,
        json!({ "message": "permission denied for table channels" }),
    )));

    let record = scheduler.trigger_now(true).await.unwrap_err();

    assert_eq!(record.kind, ErrorKind::Authentication);
    assert!(!scheduler.has_pending_retry());
}

#[tokio::test]
async fn test_scheduler_keeps_a_single_pending_retry() {
    let h = Harness::new().await;
    let scheduler = scheduler(&h);

    scheduler.schedule_retry(Duration::from_secs(60));
    scheduler.schedule_retry(Duration::from_secs(60));
    assert!(scheduler.has_pending_retry());

    scheduler.cancel_retry();
    assert!(!scheduler.has_pending_retry());
}

#[tokio::test]
async fn test_scheduler_refires_queued_forced_request() {
    let mut h = Harness::new().await;
    let scheduler = scheduler(&h);
    let token = CancellationToken::new();
    scheduler.start(token.clone());

    let (entered, release) = h.http.hold_next_get();
    let first = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.trigger_now(true).await })
    };
    entered.notified().await;

    assert_eq!(scheduler.trigger_now(true).await, Ok(SyncOutcome::Queued));
    release.notify_one();
    assert!(matches!(first.await.unwrap(), Ok(SyncOutcome::Completed { .. })));

    let mut completed = 0;
    tokio::time::timeout(Duration::from_secs(5), async {
        while completed < 2 {
            completed += h
                .sync_events()
                .iter()
                .filter(|e| matches!(e, SyncEvent::EntitiesUpdated { .. }))
                .count();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("queued pass ran");

    token.cancel();
    scheduler.stop().await;
}
