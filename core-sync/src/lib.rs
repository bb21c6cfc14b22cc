//! # Catalog Sync Module
//!
//! Keeps the local catalog cache in step with the remote catalog.
//!
//! ## Overview
//!
//! A sync pass checks connectivity, resolves a reachable remote source,
//! fetches the catalog and replaces the cache atomically. Failures are
//! classified, repaired when a repair exists, retried with backoff and
//! surfaced to the user only past a threshold.
//!
//! ## Components
//!
//! - **Connectivity Monitor** (`connectivity`): Probe-based connection class with debounce
//! - **Source Resolver** (`resolver`): First reachable catalog source by priority
//! - **Fetcher** (`fetch`): Catalog GET and payload parsing
//! - **Classifier** (`classifier`): Maps backend errors to an [`ErrorKind`]
//! - **Repair Engine** (`repair`): Corrective actions for repairable kinds
//! - **Sync Orchestrator** (`coordinator`): Single-flight pass state machine
//! - **Scheduler** (`scheduler`): Periodic, retry and re-fire timers
//! - **Realtime Listener** (`realtime`): Backend change subscription

pub mod backoff;
pub mod classifier;
pub mod connectivity;
pub mod coordinator;
pub mod error;
pub mod fetch;
pub mod realtime;
pub mod repair;
pub mod resolver;
pub mod scheduler;
pub mod state;

pub use backoff::{periodic_delay, Backoff, MinIntervalGate};
pub use classifier::{classify, classify_parts, extract_table};
pub use connectivity::{
    ConnectionClass, ConnectivityListener, ConnectivityMonitor, ConnectivityStatus,
};
pub use coordinator::{
    SkipReason, SyncComponents, SyncOrchestrator, SyncOutcome, SyncRequest, SyncStateSnapshot,
    SyncTrigger,
};
pub use error::{Result, SyncError};
pub use fetch::{parse_catalog, CatalogFetcher};
pub use realtime::{ChangeHandler, RealtimeListener, Subscription};
pub use repair::{RepairContext, RepairEngine, RepairOutcome};
pub use resolver::{RemoteSourceCandidate, RemoteSourceResolver};
pub use scheduler::Scheduler;
pub use state::{ErrorKind, ErrorRecord, SyncState, SyncStatus};
