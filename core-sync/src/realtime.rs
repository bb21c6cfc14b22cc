//! # Realtime Change Listener
//!
//! Keeps a backend change subscription open while the backend is reachable
//! and forwards the changed table name to a handler. Notifications are
//! hints; the usual handler asks for a non-forced pass.

use crate::connectivity::{ConnectivityListener, ConnectivityStatus};
use async_trait::async_trait;
use bridge_traits::BackendClient;
use core_runtime::events::{CoreEvent, EventBus, RealtimeEvent};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Called with the table name of each change.
pub type ChangeHandler = Arc<dyn Fn(String) + Send + Sync>;

pub struct RealtimeListener {
    backend: Arc<dyn BackendClient>,
    events: EventBus,
    handler: RwLock<Option<ChangeHandler>>,
    enabled: AtomicBool,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl RealtimeListener {
    pub fn new(backend: Arc<dyn BackendClient>, events: EventBus) -> Self {
        Self {
            backend,
            events,
            handler: RwLock::new(None),
            enabled: AtomicBool::new(false),
            pump: Mutex::new(None),
        }
    }

    /// Register `on_change`. The feed opens on the next
    /// [`on_connectivity`](Self::on_connectivity) reporting backend access.
    pub fn subscribe(self: &Arc<Self>, on_change: ChangeHandler) -> Subscription {
        if let Ok(mut handler) = self.handler.write() {
            *handler = Some(on_change);
        }
        self.enabled.store(true, Ordering::SeqCst);
        Subscription {
            listener: Arc::clone(self),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Whether a feed is open and pumping.
    pub async fn is_subscribed(&self) -> bool {
        self.pump
            .lock()
            .await
            .as_ref()
            .is_some_and(|pump| !pump.is_finished())
    }

    /// Open the feed unless it is already open. A feed the backend closed is
    /// reopened.
    pub async fn ensure_subscribed(&self) -> bool {
        let Some(handler) = self.current_handler() else {
            return false;
        };

        let mut pump = self.pump.lock().await;
        if pump.as_ref().is_some_and(|p| !p.is_finished()) {
            return true;
        }

        let mut feed = match self.backend.subscribe_changes().await {
            Ok(feed) => feed,
            Err(e) => {
                warn!(error = %e, "Could not open realtime subscription");
                *pump = None;
                return false;
            }
        };

        let events = self.events.clone();
        *pump = Some(tokio::spawn(async move {
            while let Some(change) = feed.next().await {
                debug!(table = %change.table, kind = ?change.kind, "Backend change received");
                events
                    .emit(CoreEvent::Realtime(RealtimeEvent::ChangeReceived {
                        table: change.table.clone(),
                    }))
                    .ok();
                handler(change.table);
            }
            debug!("Realtime feed closed");
        }));

        info!("Realtime subscription opened");
        self.events
            .emit(CoreEvent::Realtime(RealtimeEvent::Subscribed))
            .ok();
        true
    }

    /// Close the feed if open.
    pub async fn teardown(&self) {
        let Some(pump) = self.pump.lock().await.take() else {
            return;
        };
        pump.abort();

        info!("Realtime subscription closed");
        self.events
            .emit(CoreEvent::Realtime(RealtimeEvent::Unsubscribed))
            .ok();
    }

    pub async fn on_connectivity(&self, status: &ConnectivityStatus) {
        if status.has_backend_access && self.is_enabled() {
            self.ensure_subscribed().await;
        } else {
            self.teardown().await;
        }
    }

    fn current_handler(&self) -> Option<ChangeHandler> {
        self.handler.read().ok().and_then(|handler| handler.clone())
    }
}

#[async_trait]
impl ConnectivityListener for RealtimeListener {
    async fn on_online(&self, status: &ConnectivityStatus) {
        self.on_connectivity(status).await;
    }

    async fn on_offline(&self) {
        self.teardown().await;
    }
}

/// Handle returned by [`RealtimeListener::subscribe`].
pub struct Subscription {
    listener: Arc<RealtimeListener>,
}

impl Subscription {
    /// Stop listening and close the feed.
    pub async fn unsubscribe(self) {
        self.listener.enabled.store(false, Ordering::SeqCst);
        if let Ok(mut handler) = self.listener.handler.write() {
            *handler = None;
        }
        self.listener.teardown().await;
    }
}
