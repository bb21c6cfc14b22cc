//! # Host Bridge Traits
//!
//! Capability traits the sync engine needs from its host.
//!
//! ## Overview
//!
//! This crate defines the contract between the engine core and host-specific
//! implementations. Each trait represents a capability the core requires but
//! that is provided differently per platform or deployment.
//!
//! ## Traits
//!
//! ### Networking
//! - [`HttpClient`](http::HttpClient) - Async HTTP for availability probes and catalog fetches
//! - [`NetworkMonitor`](network::NetworkMonitor) - Explicit online/offline signals
//!
//! ### Backend
//! - [`BackendClient`](backend::BackendClient) - Row listing/deletion for repair, connection ping
//! - [`ChangeFeed`](backend::ChangeFeed) - Realtime change notifications
//!
//! ### Utilities
//! - [`Clock`](time::Clock) - Time source for deterministic testing
//! - [`LoggerSink`](time::LoggerSink) - Forward structured logs to host logging
//!
//! ## Fail-Fast Strategy
//!
//! The core fails fast with descriptive errors when a required capability is missing:
//!
//! ```ignore
//! use core_runtime::error::Error;
//!
//! let backend = builder.backend_client
//!     .ok_or_else(|| Error::CapabilityMissing {
//!         capability: "BackendClient".to_string(),
//!         message: "No backend client provided. \
//!                   Desktop: use PostgrestBackendClient. \
//!                   Tests: inject a fake.".to_string(),
//!     })?;
//! ```
//!
//! ## Error Handling
//!
//! All bridge traits use [`BridgeError`](error::BridgeError). Backend failures
//! carry the structured code the backend reported so the engine can classify
//! them without parsing messages.
//!
//! ## Thread Safety
//!
//! All bridge traits require `Send + Sync` so implementations can be shared
//! across tokio tasks behind an `Arc`.

pub mod backend;
pub mod error;
pub mod http;
pub mod network;
pub mod time;

pub use error::BridgeError;

// Re-export commonly used types
pub use backend::{BackendClient, ChangeFeed, ChangeKind, ChangeNotification};
pub use http::{HttpClient, HttpMethod, HttpRequest, HttpResponse};
pub use network::{NetworkChangeStream, NetworkInfo, NetworkMonitor, NetworkStatus, NetworkType};
pub use time::{Clock, FixedClock, LogEntry, LogLevel, LoggerSink, SystemClock};
