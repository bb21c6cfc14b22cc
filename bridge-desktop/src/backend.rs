//! PostgREST Backend Client
//!
//! Talks to a PostgREST-compatible REST endpoint (`/rest/v1` style) through
//! the injected [`HttpClient`]. The change feed polls watched tables and
//! reports a change whenever a table's fingerprint moves.

use async_trait::async_trait;
use bridge_traits::{
    backend::{error_from_response, BackendClient, ChangeFeed, ChangeKind, ChangeNotification},
    error::{BridgeError, Result},
    http::{HttpClient, HttpMethod, HttpRequest, HttpResponse},
};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(15);

/// PostgREST-backed [`BackendClient`].
#[derive(Clone)]
pub struct PostgrestBackendClient {
    http: Arc<dyn HttpClient>,
    base_url: String,
    api_key: String,
    request_timeout: Duration,
    poll_interval: Duration,
    watched_tables: Vec<String>,
}

impl PostgrestBackendClient {
    /// Create a client for `base_url` (e.g. `https://xyz.example.co/rest/v1`).
    pub fn new(
        http: Arc<dyn HttpClient>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            watched_tables: ["channels", "categories", "countries", "settings"]
                .iter()
                .map(|t| t.to_string())
                .collect(),
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_watched_tables(mut self, tables: Vec<String>) -> Self {
        self.watched_tables = tables;
        self
    }

    fn request(&self, method: HttpMethod, path: &str) -> HttpRequest {
        HttpRequest::new(method, format!("{}/{}", self.base_url, path))
            .header("apikey", self.api_key.clone())
            .bearer_token(self.api_key.clone())
            .header("Accept", "application/json")
            .timeout(self.request_timeout)
    }

    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let response = self.http.execute(request).await?;
        if response.is_success() {
            Ok(response)
        } else {
            Err(error_from_response(&response))
        }
    }
}

#[async_trait]
impl BackendClient for PostgrestBackendClient {
    async fn ping(&self) -> Result<()> {
        let table = self
            .watched_tables
            .first()
            .map(String::as_str)
            .unwrap_or("settings");
        self.send(self.request(HttpMethod::Get, &format!("{}?select=id&limit=1", table)))
            .await?;
        Ok(())
    }

    async fn list_rows(&self, table: &str) -> Result<Vec<serde_json::Value>> {
        let response = self
            .send(self.request(HttpMethod::Get, &format!("{}?select=*", table)))
            .await?;
        response.json()
    }

    async fn upsert_rows(&self, table: &str, rows: &[serde_json::Value]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }

        let body = serde_json::to_vec(rows).map_err(|e| {
            BridgeError::OperationFailed(format!("JSON serialization failed: {}", e))
        })?;
        let request = self
            .request(HttpMethod::Post, table)
            .header("Content-Type", "application/json")
            .header("Prefer", "resolution=merge-duplicates,return=representation")
            .body(body.into());

        let response = self.send(request).await?;
        let written: Vec<serde_json::Value> = response.json()?;
        debug!(table, written = written.len(), "Upserted backend rows");

        Ok(written.len() as u64)
    }

    async fn delete_rows(&self, table: &str, ids: &[String]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let filter = ids
            .iter()
            .map(|id| format!("\"{}\"", id.replace('"', "")))
            .collect::<Vec<_>>()
            .join(",");
        let request = self
            .request(HttpMethod::Delete, &format!("{}?id=in.({})", table, filter))
            .header("Prefer", "return=representation");

        let response = self.send(request).await?;
        let deleted: Vec<serde_json::Value> = response.json()?;
        debug!(table, deleted = deleted.len(), "Deleted backend rows");

        Ok(deleted.len() as u64)
    }

    async fn subscribe_changes(&self) -> Result<Box<dyn ChangeFeed>> {
        // Surface an unreachable backend at subscribe time rather than on
        // the first poll.
        self.ping().await?;

        Ok(Box::new(PollingChangeFeed {
            client: self.clone(),
            fingerprints: HashMap::new(),
            pending: Vec::new(),
        }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TableFingerprint {
    rows: usize,
    digest: u64,
}

fn fingerprint(rows: &[serde_json::Value]) -> TableFingerprint {
    let mut hasher = DefaultHasher::new();
    for row in rows {
        row.to_string().hash(&mut hasher);
    }
    TableFingerprint {
        rows: rows.len(),
        digest: hasher.finish(),
    }
}

/// Change feed that polls the watched tables.
struct PollingChangeFeed {
    client: PostgrestBackendClient,
    fingerprints: HashMap<String, TableFingerprint>,
    pending: Vec<ChangeNotification>,
}

impl PollingChangeFeed {
    /// Poll every watched table once, queueing a notification per moved table.
    async fn poll(&mut self) -> Result<()> {
        for table in self.client.watched_tables.clone() {
            let rows = self.client.list_rows(&table).await?;
            let current = fingerprint(&rows);

            if let Some(previous) = self.fingerprints.insert(table.clone(), current) {
                if previous != current {
                    let kind = if current.rows > previous.rows {
                        ChangeKind::Insert
                    } else if current.rows < previous.rows {
                        ChangeKind::Delete
                    } else {
                        ChangeKind::Update
                    };
                    self.pending.push(ChangeNotification::new(table, kind));
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ChangeFeed for PollingChangeFeed {
    async fn next(&mut self) -> Option<ChangeNotification> {
        loop {
            if !self.pending.is_empty() {
                return Some(self.pending.remove(0));
            }

            if let Err(e) = self.poll().await {
                warn!(error = %e, "Change feed poll failed, closing feed");
                return None;
            }

            if self.pending.is_empty() {
                tokio::time::sleep(self.client.poll_interval).await;
            }
        }
    }
}
