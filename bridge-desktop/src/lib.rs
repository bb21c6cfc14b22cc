//! # Desktop Bridge Implementations
//!
//! Default implementations of bridge traits for desktop hosts
//! (macOS, Windows, Linux).
//!
//! ## Overview
//!
//! - `HttpClient` using `reqwest` with rustls
//! - `NetworkMonitor` using TCP reachability polling
//! - `BackendClient` for PostgREST-compatible REST backends, with a polling
//!   change feed
//!
//! ## Usage
//!
//! ```ignore
//! use bridge_desktop::{PostgrestBackendClient, ReqwestHttpClient};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> bridge_traits::error::Result<()> {
//!     let http = Arc::new(ReqwestHttpClient::new()?);
//!     let backend = PostgrestBackendClient::new(http.clone(), "https://db.example.com/rest/v1", "anon-key");
//!
//!     // Hand both to EngineConfig::builder()
//!     Ok(())
//! }
//! ```

mod backend;
mod http;
mod network;

pub use backend::PostgrestBackendClient;
pub use http::ReqwestHttpClient;
pub use network::DesktopNetworkMonitor;
