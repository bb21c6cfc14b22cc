//! # Event Bus System
//!
//! Provides an event-driven architecture for the sync engine using `tokio::sync::broadcast`.
//! This module replaces ambient global notifications with an explicit, typed channel
//! that UI layers and background tasks subscribe to.
//!
//! ## Overview
//!
//! The event bus system consists of:
//! - **Event Types**: Strongly-typed enum hierarchies for each concern
//! - **EventBus**: Central broadcast channel for publishing events
//! - **EventStream**: Wrapper for consuming events with filtering
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐   emit    ┌───────────┐
//! │ Sync Orchestrator├──────────>│           │
//! └──────────────────┘           │           │   subscribe   ┌────────────┐
//! ┌──────────────────┐   emit    │ EventBus  ├──────────────>│ UI caches  │
//! │ Connectivity Mon.├──────────>│ (broadcast│               └────────────┘
//! └──────────────────┘           │  channel) │   subscribe   ┌────────────┐
//! ┌──────────────────┐   emit    │           ├──────────────>│ Notices    │
//! │ Realtime Listener├──────────>│           │               └────────────┘
//! └──────────────────┘           └───────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use core_runtime::events::{CoreEvent, EventBus, EventStream, SyncEvent};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let bus = EventBus::new(100);
//! let mut updates = EventStream::new(bus.subscribe())
//!     .filter(|event| matches!(event, CoreEvent::Sync(SyncEvent::EntitiesUpdated { .. })));
//!
//! bus.emit(CoreEvent::Sync(SyncEvent::NoticeCleared)).ok();
//! bus.emit(CoreEvent::Sync(SyncEvent::EntitiesUpdated {
//!     pass_id: "pass-1".to_string(),
//!     channels: 10,
//!     categories: 2,
//!     countries: 3,
//!     settings: 1,
//! }))
//! .ok();
//!
//! let event = updates.recv().await.unwrap();
//! assert!(matches!(event, CoreEvent::Sync(SyncEvent::EntitiesUpdated { channels: 10, .. })));
//! # }
//! ```
//!
//! ## Error Handling
//!
//! - **`RecvError::Lagged(n)`**: Subscriber was too slow and missed `n` events.
//!   This is non-fatal; the subscriber can continue receiving new events.
//! - **`RecvError::Closed`**: All senders have been dropped. This indicates shutdown.
//!
//! Emitting with no subscribers returns an error that publishers ignore.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

// Re-export commonly used types
pub use tokio::sync::broadcast::error::{RecvError, SendError};
pub use tokio::sync::broadcast::Receiver;

/// Default buffer size for the event bus channel.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 100;

// ============================================================================
// Core Event Types
// ============================================================================

/// Top-level event enum encompassing all event categories.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    /// Sync pass lifecycle, failures and notices
    Sync(SyncEvent),
    /// Reachability and source resolution
    Connectivity(ConnectivityEvent),
    /// Backend change subscription
    Realtime(RealtimeEvent),
}

impl CoreEvent {
    /// Returns a human-readable description of the event.
    pub fn description(&self) -> &str {
        match self {
            CoreEvent::Sync(e) => e.description(),
            CoreEvent::Connectivity(e) => e.description(),
            CoreEvent::Realtime(e) => e.description(),
        }
    }

    /// Returns the severity level of the event.
    pub fn severity(&self) -> EventSeverity {
        match self {
            CoreEvent::Sync(SyncEvent::NoticeRaised { .. }) => EventSeverity::Error,
            CoreEvent::Sync(SyncEvent::Failed { .. }) => EventSeverity::Warning,
            CoreEvent::Sync(SyncEvent::ServingCache { .. }) => EventSeverity::Warning,
            CoreEvent::Connectivity(ConnectivityEvent::SourceUnavailable) => {
                EventSeverity::Warning
            }
            CoreEvent::Sync(SyncEvent::EntitiesUpdated { .. }) => EventSeverity::Info,
            CoreEvent::Sync(SyncEvent::Repaired { .. }) => EventSeverity::Info,
            CoreEvent::Sync(SyncEvent::NoticeCleared) => EventSeverity::Info,
            CoreEvent::Connectivity(ConnectivityEvent::ClassChanged { .. }) => EventSeverity::Info,
            _ => EventSeverity::Debug,
        }
    }
}

/// Event severity levels for filtering and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventSeverity {
    /// Debug-level events (verbose)
    Debug,
    /// Informational events
    Info,
    /// Warning events
    Warning,
    /// Error events
    Error,
}

// ============================================================================
// Sync Events
// ============================================================================

/// Events emitted by the sync orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum SyncEvent {
    /// A pass moved past its gates and started checking.
    Started {
        /// Unique identifier for this pass.
        pass_id: String,
        /// Whether the staleness gate was bypassed.
        forced: bool,
        /// What requested the pass (`manual`, `periodic`, ...).
        trigger: String,
    },
    /// The cache was replaced with a fresh snapshot. UI caches should refetch.
    EntitiesUpdated {
        pass_id: String,
        channels: u64,
        categories: u64,
        countries: u64,
        settings: u64,
    },
    /// A pass failed. Carries the current error record fields.
    Failed {
        pass_id: String,
        /// Classified error kind (`Connection`, `DuplicateKey`, ...).
        kind: String,
        message: String,
        consecutive_count: u32,
        recoverable: bool,
    },
    /// An automatic repair succeeded.
    Repaired {
        kind: String,
        /// What the repair did, e.g. "removed 2 duplicate settings rows".
        detail: String,
    },
    /// A user-visible, dismissible notice should be shown.
    NoticeRaised {
        kind: String,
        message: String,
        consecutive_count: u32,
    },
    /// Any active notice should be hidden.
    NoticeCleared,
    /// The backend is unreachable; the UI is showing cached data.
    ServingCache {
        reason: String,
    },
}

impl SyncEvent {
    fn description(&self) -> &str {
        match self {
            SyncEvent::Started { .. } => "Sync pass started",
            SyncEvent::EntitiesUpdated { .. } => "Entities updated",
            SyncEvent::Failed { .. } => "Sync pass failed",
            SyncEvent::Repaired { .. } => "Automatic repair applied",
            SyncEvent::NoticeRaised { .. } => "Sync problem notice raised",
            SyncEvent::NoticeCleared => "Sync problem notice cleared",
            SyncEvent::ServingCache { .. } => "Serving cached data",
        }
    }
}

// ============================================================================
// Connectivity Events
// ============================================================================

/// Events emitted by the connectivity monitor and source resolver.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum ConnectivityEvent {
    /// The connection class actually changed. Never emitted for no-op transitions.
    ClassChanged {
        from: String,
        to: String,
        has_network: bool,
        has_backend_access: bool,
    },
    /// A remote source answered its availability probe.
    SourceResolved { url: String },
    /// No remote source answered.
    SourceUnavailable,
}

impl ConnectivityEvent {
    fn description(&self) -> &str {
        match self {
            ConnectivityEvent::ClassChanged { .. } => "Connection class changed",
            ConnectivityEvent::SourceResolved { .. } => "Remote source resolved",
            ConnectivityEvent::SourceUnavailable => "No remote source available",
        }
    }
}

// ============================================================================
// Realtime Events
// ============================================================================

/// Events emitted by the realtime change listener.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum RealtimeEvent {
    Subscribed,
    Unsubscribed,
    ChangeReceived { table: String },
}

impl RealtimeEvent {
    fn description(&self) -> &str {
        match self {
            RealtimeEvent::Subscribed => "Realtime subscription opened",
            RealtimeEvent::Unsubscribed => "Realtime subscription closed",
            RealtimeEvent::ChangeReceived { .. } => "Realtime change received",
        }
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// Central event bus for publishing and subscribing to engine events.
///
/// Cloning is cheap; all clones share the same channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    /// Creates a new event bus with the specified buffer size.
    ///
    /// # Arguments
    ///
    /// * `capacity` - Maximum number of events to buffer per subscriber.
    ///   When a subscriber falls behind by more than this amount, it will
    ///   receive a `RecvError::Lagged` error.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publishes an event to all subscribers.
    ///
    /// Returns the number of subscribers that received the event.
    /// Returns an error if there are no active subscribers.
    pub fn emit(&self, event: CoreEvent) -> Result<usize, SendError<CoreEvent>> {
        self.sender.send(event)
    }

    /// Creates a new subscriber to receive events.
    ///
    /// Each call creates an independent receiver that will receive all future events.
    /// Past events are not replayed.
    pub fn subscribe(&self) -> Receiver<CoreEvent> {
        self.sender.subscribe()
    }

    /// Returns the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

// ============================================================================
// Event Stream Wrapper
// ============================================================================

/// Type alias for event filter functions.
type EventFilter = Box<dyn Fn(&CoreEvent) -> bool + Send + Sync>;

/// A wrapper around `broadcast::Receiver` with filtering.
pub struct EventStream {
    receiver: Receiver<CoreEvent>,
    filter: Option<EventFilter>,
}

impl EventStream {
    /// Creates a new event stream from a receiver.
    pub fn new(receiver: Receiver<CoreEvent>) -> Self {
        Self {
            receiver,
            filter: None,
        }
    }

    /// Adds a filter function to this stream.
    ///
    /// Only events that match the filter will be returned by `recv()`.
    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&CoreEvent) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Box::new(predicate));
        self
    }

    fn accepts(&self, event: &CoreEvent) -> bool {
        self.filter.as_ref().map_or(true, |filter| filter(event))
    }

    /// Receives the next event that passes the filter (if any).
    ///
    /// # Errors
    ///
    /// Returns `RecvError::Lagged(n)` if the subscriber fell behind by `n` events.
    /// Returns `RecvError::Closed` if all senders have been dropped.
    pub async fn recv(&mut self) -> Result<CoreEvent, RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.accepts(&event) {
                return Ok(event);
            }
        }
    }

    /// Attempts to receive an event without blocking.
    ///
    /// Returns `None` if no matching events are currently available.
    pub fn try_recv(&mut self) -> Option<Result<CoreEvent, RecvError>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    if self.accepts(&event) {
                        return Some(Ok(event));
                    }
                }
                Err(broadcast::error::TryRecvError::Empty) => return None,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    return Some(Err(RecvError::Lagged(n)))
                }
                Err(broadcast::error::TryRecvError::Closed) => return Some(Err(RecvError::Closed)),
            }
        }
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("has_filter", &self.filter.is_some())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
