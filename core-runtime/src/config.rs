//! # Engine Configuration Module
//!
//! Provides configuration management for the catalog sync engine.
//!
//! ## Overview
//!
//! The configuration system uses a builder pattern to construct an
//! `EngineConfig` holding every bridge and tuning knob the engine needs.
//! It enforces fail-fast validation so that a misconfigured engine never
//! starts.
//!
//! ## Required Dependencies
//!
//! - `BackendClient` - Row access for repair and the realtime change feed
//!
//! ## Optional Dependencies (with platform defaults)
//!
//! - `HttpClient` - Probes and catalog fetches (desktop default: reqwest)
//! - `NetworkMonitor` - Explicit online/offline signals (optional)
//! - `Clock` - Time source (default: system clock)
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::config::{EngineConfig, RemoteSourceConfig};
//! use std::sync::Arc;
//!
//! let config = EngineConfig::builder()
//!     .database_path("/var/lib/app/catalog.db")
//!     .backend_client(Arc::new(backend))
//!     .remote_source(RemoteSourceConfig::new("https://cdn.example.com/catalog.json", 0))
//!     .remote_source(RemoteSourceConfig::new("https://mirror.example.com/catalog.json", 1))
//!     .enable_realtime(true)
//!     .build()?;
//! ```

use crate::error::{Error, Result};
use bridge_traits::{BackendClient, Clock, HttpClient, NetworkMonitor, SystemClock};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Well-known endpoints probed by the connectivity monitor.
pub const DEFAULT_PROBE_ENDPOINTS: [&str; 3] = [
    "https://www.gstatic.com/generate_204",
    "https://cloudflare.com/cdn-cgi/trace",
    "https://www.apple.com/library/test/success.html",
];

/// Where the local cache lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseLocation {
    File(PathBuf),
    InMemory,
}

/// A configured remote catalog source. Lower priority is tried first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSourceConfig {
    pub url: String,
    pub priority: u32,
}

impl RemoteSourceConfig {
    pub fn new(url: impl Into<String>, priority: u32) -> Self {
        Self {
            url: url.into(),
            priority,
        }
    }
}

/// Timeouts, windows and intervals used across the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncTimings {
    /// Per-probe timeout for connectivity and source probes
    pub probe_timeout: Duration,
    /// Timeout for the catalog GET
    pub fetch_timeout: Duration,
    /// How long a connectivity result is reused without probing
    pub connectivity_validity: Duration,
    /// How long a resolved source is reused without probing
    pub source_cache_ttl: Duration,
    /// Minimum age of the last success before a non-forced sync runs
    pub staleness_window: Duration,
    /// Base interval of the periodic sync
    pub periodic_interval: Duration,
    /// Lower bound of the jitter added to each periodic tick
    pub periodic_jitter_min: Duration,
    /// Upper bound (inclusive) of the jitter added to each periodic tick
    pub periodic_jitter_max: Duration,
    /// Minimum spacing between manual passes
    pub min_manual_retry_interval: Duration,
}

impl Default for SyncTimings {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(5),
            fetch_timeout: Duration::from_secs(8),
            connectivity_validity: Duration::from_secs(60),
            source_cache_ttl: Duration::from_secs(5 * 60),
            staleness_window: Duration::from_secs(3 * 60),
            periodic_interval: Duration::from_secs(15 * 60),
            periodic_jitter_min: Duration::from_secs(30),
            periodic_jitter_max: Duration::from_secs(180),
            min_manual_retry_interval: Duration::from_secs(3),
        }
    }
}

/// Exponential backoff parameters for failed passes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    /// Consecutive failures after which automatic retries stop. Manual,
    /// periodic and reconnect passes still run.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
            factor: 2.0,
            max_attempts: 5,
        }
    }
}

/// Consecutive-failure counts at which a user-visible notice is raised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoticePolicy {
    pub thresholds: Vec<u32>,
}

impl Default for NoticePolicy {
    fn default() -> Self {
        Self {
            thresholds: vec![3, 5],
        }
    }
}

/// Feature flags control optional background behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureFlags {
    /// Subscribe to backend change notifications while reachable
    pub enable_realtime: bool,

    /// Run the jittered periodic sync loop
    pub enable_periodic_sync: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            enable_realtime: false,
            enable_periodic_sync: true,
        }
    }
}

/// Engine configuration.
///
/// This struct holds all dependencies and settings required to bootstrap the
/// sync engine. Use [`EngineConfigBuilder`] to construct instances.
#[derive(Clone)]
pub struct EngineConfig {
    /// Local cache location
    pub database: DatabaseLocation,

    /// HTTP client for probes and fetches
    pub http_client: Arc<dyn HttpClient>,

    /// Backend access for repair and realtime (required)
    pub backend_client: Arc<dyn BackendClient>,

    /// Network connectivity monitor (optional)
    pub network_monitor: Option<Arc<dyn NetworkMonitor>>,

    /// Time source
    pub clock: Arc<dyn Clock>,

    /// Catalog sources, in any order; the resolver sorts by priority
    pub remote_sources: Vec<RemoteSourceConfig>,

    /// Endpoints probed by the connectivity monitor
    pub probe_endpoints: Vec<String>,

    pub timings: SyncTimings,
    pub retry: RetryPolicy,
    pub notices: NoticePolicy,
    pub features: FeatureFlags,
}

impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConfig")
            .field("database", &self.database)
            .field("http_client", &"HttpClient { ... }")
            .field("backend_client", &"BackendClient { ... }")
            .field(
                "network_monitor",
                &self
                    .network_monitor
                    .as_ref()
                    .map(|_| "NetworkMonitor { ... }"),
            )
            .field("remote_sources", &self.remote_sources)
            .field("probe_endpoints", &self.probe_endpoints)
            .field("timings", &self.timings)
            .field("retry", &self.retry)
            .field("notices", &self.notices)
            .field("features", &self.features)
            .finish()
    }
}

fn is_http_url(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    (lower.starts_with("http://") && lower.len() > "http://".len())
        || (lower.starts_with("https://") && lower.len() > "https://".len())
}

impl EngineConfig {
    /// Creates a new builder for constructing an `EngineConfig`.
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Validates the configuration and returns an error if invalid.
    ///
    /// This checks:
    /// - At least one remote source, all http(s)
    /// - At least one probe endpoint, all http(s)
    /// - Probe timeout within 1..=10s and fetch timeout within 3..=8s
    /// - Retry base delay not above the cap, factor at least 1, at least
    ///   one attempt
    /// - Jitter range ordered
    /// - Notice thresholds non-empty, positive, strictly ascending
    pub fn validate(&self) -> Result<()> {
        if let DatabaseLocation::File(path) = &self.database {
            if path.as_os_str().is_empty() {
                return Err(Error::Config("Database path cannot be empty".to_string()));
            }
        }

        if self.remote_sources.is_empty() {
            return Err(Error::Config(
                "At least one remote source is required. Use .remote_source() to add one."
                    .to_string(),
            ));
        }

        if let Some(bad) = self.remote_sources.iter().find(|s| !is_http_url(&s.url)) {
            return Err(Error::Config(format!(
                "Remote source URL must be http(s): {}",
                bad.url
            )));
        }

        if self.probe_endpoints.is_empty() {
            return Err(Error::Config(
                "At least one probe endpoint is required".to_string(),
            ));
        }

        if let Some(bad) = self.probe_endpoints.iter().find(|u| !is_http_url(u)) {
            return Err(Error::Config(format!(
                "Probe endpoint must be http(s): {}",
                bad
            )));
        }

        let t = &self.timings;
        if t.probe_timeout < Duration::from_secs(1) || t.probe_timeout > Duration::from_secs(10) {
            return Err(Error::Config(format!(
                "Probe timeout must be between 1s and 10s, got {:?}",
                t.probe_timeout
            )));
        }

        if t.fetch_timeout < Duration::from_secs(3) || t.fetch_timeout > Duration::from_secs(8) {
            return Err(Error::Config(format!(
                "Fetch timeout must be between 3s and 8s, got {:?}",
                t.fetch_timeout
            )));
        }

        if t.periodic_jitter_min > t.periodic_jitter_max {
            return Err(Error::Config(
                "Periodic jitter minimum exceeds maximum".to_string(),
            ));
        }

        if t.periodic_interval.is_zero() {
            return Err(Error::Config(
                "Periodic interval must be greater than zero".to_string(),
            ));
        }

        if self.retry.base_delay > self.retry.max_delay {
            return Err(Error::Config(format!(
                "Retry base delay {:?} exceeds cap {:?}",
                self.retry.base_delay, self.retry.max_delay
            )));
        }

        if !(self.retry.factor >= 1.0) {
            return Err(Error::Config(
                "Retry factor must be at least 1.0".to_string(),
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(Error::Config(
                "Retry max attempts must be at least 1".to_string(),
            ));
        }

        let thresholds = &self.notices.thresholds;
        if thresholds.is_empty() || thresholds[0] == 0 {
            return Err(Error::Config(
                "Notice thresholds must be non-empty and start above zero".to_string(),
            ));
        }

        if thresholds.windows(2).any(|w| w[0] >= w[1]) {
            return Err(Error::Config(format!(
                "Notice thresholds must be strictly ascending, got {:?}",
                thresholds
            )));
        }

        Ok(())
    }
}

#[cfg(not(feature = "desktop-shims"))]
fn http_client_missing_error() -> Error {
    Error::CapabilityMissing {
        capability: "HttpClient".to_string(),
        message: "HttpClient implementation is required for probes and catalog fetches. \
                 Desktop: ensure the 'desktop-shims' feature is enabled to use the default ReqwestHttpClient. \
                 Other hosts: inject a platform-native HTTP adapter."
            .to_string(),
    }
}

#[cfg(feature = "desktop-shims")]
fn provide_default_http_client() -> Result<Arc<dyn HttpClient>> {
    use bridge_desktop::ReqwestHttpClient;

    let client: Arc<dyn HttpClient> = Arc::new(ReqwestHttpClient::new()?);
    Ok(client)
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_http_client() -> Result<Arc<dyn HttpClient>> {
    Err(http_client_missing_error())
}

fn backend_client_missing_error() -> Error {
    Error::CapabilityMissing {
        capability: "BackendClient".to_string(),
        message: "BackendClient implementation is required for repair and realtime updates. \
                 Desktop: construct bridge_desktop::PostgrestBackendClient. \
                 Tests: inject a fake implementation."
            .to_string(),
    }
}

/// Builder for constructing [`EngineConfig`] instances.
///
/// Call [`build()`](EngineConfigBuilder::build) to validate and produce the
/// final config.
#[derive(Default)]
pub struct EngineConfigBuilder {
    database: Option<DatabaseLocation>,
    http_client: Option<Arc<dyn HttpClient>>,
    backend_client: Option<Arc<dyn BackendClient>>,
    network_monitor: Option<Arc<dyn NetworkMonitor>>,
    clock: Option<Arc<dyn Clock>>,
    remote_sources: Vec<RemoteSourceConfig>,
    probe_endpoints: Option<Vec<String>>,
    timings: Option<SyncTimings>,
    retry: Option<RetryPolicy>,
    notices: Option<NoticePolicy>,
    features: FeatureFlags,
}

impl EngineConfigBuilder {
    /// Sets the SQLite database file path.
    pub fn database_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.database = Some(DatabaseLocation::File(path.into()));
        self
    }

    /// Keeps the cache in memory. Intended for tests and ephemeral hosts.
    pub fn in_memory_database(mut self) -> Self {
        self.database = Some(DatabaseLocation::InMemory);
        self
    }

    /// Sets the HTTP client implementation.
    ///
    /// If not provided, the desktop default (reqwest-based) will be used when
    /// the `desktop-shims` feature is enabled.
    pub fn http_client(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.http_client = Some(client);
        self
    }

    /// Sets the backend client implementation (required).
    pub fn backend_client(mut self, client: Arc<dyn BackendClient>) -> Self {
        self.backend_client = Some(client);
        self
    }

    /// Sets the network monitor implementation (optional).
    ///
    /// Without one, the connection class is only downgraded to `None` when
    /// the host calls `mark_offline` explicitly.
    pub fn network_monitor(mut self, monitor: Arc<dyn NetworkMonitor>) -> Self {
        self.network_monitor = Some(monitor);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Adds a remote catalog source.
    pub fn remote_source(mut self, source: RemoteSourceConfig) -> Self {
        self.remote_sources.push(source);
        self
    }

    /// Replaces all remote sources.
    pub fn remote_sources(mut self, sources: Vec<RemoteSourceConfig>) -> Self {
        self.remote_sources = sources;
        self
    }

    /// Overrides the connectivity probe endpoints.
    pub fn probe_endpoints(mut self, endpoints: Vec<String>) -> Self {
        self.probe_endpoints = Some(endpoints);
        self
    }

    pub fn timings(mut self, timings: SyncTimings) -> Self {
        self.timings = Some(timings);
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn notice_policy(mut self, policy: NoticePolicy) -> Self {
        self.notices = Some(policy);
        self
    }

    /// Enables or disables the realtime change listener.
    ///
    /// Default: false
    pub fn enable_realtime(mut self, enabled: bool) -> Self {
        self.features.enable_realtime = enabled;
        self
    }

    /// Enables or disables the periodic sync loop.
    ///
    /// Default: true
    pub fn enable_periodic_sync(mut self, enabled: bool) -> Self {
        self.features.enable_periodic_sync = enabled;
        self
    }

    /// Sets all feature flags at once.
    pub fn features(mut self, features: FeatureFlags) -> Self {
        self.features = features;
        self
    }

    /// Builds the final `EngineConfig` instance.
    ///
    /// Returns an error if:
    /// - No database location was chosen
    /// - The backend client is missing, or the HTTP client is missing without
    ///   the `desktop-shims` default
    /// - Any value fails [`EngineConfig::validate`]
    pub fn build(self) -> Result<EngineConfig> {
        let database = self.database.ok_or_else(|| {
            Error::Config(
                "Database location is required. Use .database_path() or .in_memory_database()."
                    .to_string(),
            )
        })?;

        let backend_client = self
            .backend_client
            .ok_or_else(backend_client_missing_error)?;

        let http_client = match self.http_client {
            Some(client) => client,
            None => provide_default_http_client()?,
        };

        let config = EngineConfig {
            database,
            http_client,
            backend_client,
            network_monitor: self.network_monitor,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            remote_sources: self.remote_sources,
            probe_endpoints: self.probe_endpoints.unwrap_or_else(|| {
                DEFAULT_PROBE_ENDPOINTS
                    .iter()
                    .map(|u| u.to_string())
                    .collect()
            }),
            timings: self.timings.unwrap_or_default(),
            retry: self.retry.unwrap_or_default(),
            notices: self.notices.unwrap_or_default(),
            features: self.features,
        };

        config.validate()?;

        Ok(config)
    }
}
