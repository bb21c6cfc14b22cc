//! Network Monitoring Implementation

use async_trait::async_trait;
use bridge_traits::{
    error::Result,
    network::{NetworkChangeStream, NetworkInfo, NetworkMonitor, NetworkStatus, NetworkType},
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

const DEFAULT_REACHABILITY_ADDR: &str = "1.1.1.1:53";
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Desktop network monitor implementation
///
/// Detects connectivity with a TCP connect to a well-known resolver. The
/// change stream polls and only yields when the status actually flips, which
/// is what lets the engine treat a `Disconnected` item as an explicit
/// offline signal.
pub struct DesktopNetworkMonitor {
    reachability_addr: String,
    poll_interval: Duration,
    cached_info: Arc<Mutex<Option<NetworkInfo>>>,
}

impl DesktopNetworkMonitor {
    /// Create a new network monitor
    pub fn new() -> Self {
        Self::with_target(DEFAULT_REACHABILITY_ADDR, DEFAULT_POLL_INTERVAL)
    }

    /// Create a monitor probing `addr` (host:port) every `poll_interval`.
    pub fn with_target(addr: impl Into<String>, poll_interval: Duration) -> Self {
        Self {
            reachability_addr: addr.into(),
            poll_interval,
            cached_info: Arc::new(Mutex::new(None)),
        }
    }

    async fn check_connectivity(&self) -> NetworkStatus {
        match tokio::time::timeout(
            CONNECT_TIMEOUT,
            tokio::net::TcpStream::connect(self.reachability_addr.as_str()),
        )
        .await
        {
            Ok(Ok(_)) => NetworkStatus::Connected,
            Ok(Err(_)) | Err(_) => NetworkStatus::Disconnected,
        }
    }

    fn fork(&self) -> Self {
        Self::with_target(self.reachability_addr.clone(), self.poll_interval)
    }
}

impl Default for DesktopNetworkMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NetworkMonitor for DesktopNetworkMonitor {
    async fn get_network_info(&self) -> Result<NetworkInfo> {
        let mut cached = self.cached_info.lock().await;

        let status = self.check_connectivity().await;
        let info = match status {
            // Desktop can't tell Ethernet from WiFi without platform APIs
            NetworkStatus::Connected => NetworkInfo::connected(NetworkType::Other),
            _ => NetworkInfo::disconnected(),
        };

        *cached = Some(info.clone());
        debug!(status = ?status, addr = %self.reachability_addr, "Network info updated");

        Ok(info)
    }

    async fn subscribe_changes(&self) -> Result<Box<dyn NetworkChangeStream>> {
        Ok(Box::new(DesktopNetworkChangeStream {
            monitor: self.fork(),
            last_status: None,
        }))
    }
}

/// Network change stream that polls for changes
struct DesktopNetworkChangeStream {
    monitor: DesktopNetworkMonitor,
    last_status: Option<NetworkStatus>,
}

#[async_trait]
impl NetworkChangeStream for DesktopNetworkChangeStream {
    async fn next(&mut self) -> Option<NetworkInfo> {
        loop {
            if let Ok(info) = self.monitor.get_network_info().await {
                if self.last_status != Some(info.status) {
                    let first = self.last_status.is_none();
                    self.last_status = Some(info.status);
                    // The baseline reading is not a change.
                    if !first {
                        return Some(info);
                    }
                }
            }

            tokio::time::sleep(self.monitor.poll_interval).await;
        }
    }
}
