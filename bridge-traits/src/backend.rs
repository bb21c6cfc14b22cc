//! Backend Access Abstraction
//!
//! The authoritative backend the engine repairs against and listens to for
//! realtime changes. Catalog reads go through the resolved remote source via
//! [`HttpClient`](crate::http::HttpClient); this trait covers the settings
//! write-back, the row-level operations the repair engine needs and the push
//! channel.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};
use crate::http::HttpResponse;

/// Kind of row change reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A single change notification.
///
/// Push delivery is best-effort, so the payload is only a hint about which
/// table moved. Consumers re-sync rather than apply it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeNotification {
    pub table: String,
    pub kind: ChangeKind,
}

impl ChangeNotification {
    pub fn new(table: impl Into<String>, kind: ChangeKind) -> Self {
        Self {
            table: table.into(),
            kind,
        }
    }
}

/// Stream of backend change notifications.
#[async_trait]
pub trait ChangeFeed: Send {
    /// Wait for the next change.
    ///
    /// Returns `None` once the feed is closed (connection dropped or the
    /// backend ended the subscription).
    async fn next(&mut self) -> Option<ChangeNotification>;
}

/// Backend client trait
///
/// Errors must be reported as [`BridgeError::Backend`](crate::error::BridgeError::Backend)
/// carrying the backend's structured code when one is available (SQLSTATE
/// such as `23505`, PostgREST codes such as `PGRST301`, or an HTTP status).
///
/// # Example
///
/// ```ignore
/// use bridge_traits::backend::BackendClient;
///
/// async fn collapse_settings(backend: &dyn BackendClient) -> Result<u64> {
///     let rows = backend.list_rows("settings").await?;
///     let extra: Vec<String> = rows.iter().skip(1).filter_map(row_id).collect();
///     backend.delete_rows("settings", &extra).await
/// }
/// ```
#[async_trait]
pub trait BackendClient: Send + Sync {
    /// Cheap metadata query used to re-validate the connection.
    async fn ping(&self) -> Result<()>;

    /// List every row of `table` in the backend's natural order.
    async fn list_rows(&self, table: &str) -> Result<Vec<serde_json::Value>>;

    /// Insert `rows` into `table`, updating rows whose `id` already exists.
    ///
    /// Returns the number of rows written. A table that already holds
    /// conflicting duplicates reports the backend's unique-violation code.
    async fn upsert_rows(&self, table: &str, rows: &[serde_json::Value]) -> Result<u64>;

    /// Delete the rows of `table` whose `id` is in `ids`.
    ///
    /// Returns the number of rows removed.
    async fn delete_rows(&self, table: &str, ids: &[String]) -> Result<u64>;

    /// Open a realtime change subscription.
    async fn subscribe_changes(&self) -> Result<Box<dyn ChangeFeed>>;
}

/// Normalize a row's `id` field to a string. Numeric ids are common in
/// relational backends; string ids are common in document stores.
pub fn row_id(row: &serde_json::Value) -> Option<String> {
    match row.get("id")? {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// REST error body (`{code, message, details, hint}`) as sent by PostgREST
/// and compatible gateways.
#[derive(Debug, Deserialize)]
struct RestErrorBody {
    code: Option<String>,
    message: Option<String>,
    details: Option<String>,
    hint: Option<String>,
}

/// Longest plain-text body kept in an error message.
const MAX_ERROR_TEXT: usize = 200;

/// Turn a non-2xx response into [`BridgeError::Backend`].
///
/// The REST body carries SQLSTATE-style codes. When the body is not in that
/// shape the HTTP status becomes the code, so 401/403/409 still classify.
pub fn error_from_response(response: &HttpResponse) -> BridgeError {
    match response.json::<RestErrorBody>() {
        Ok(body) => {
            let mut message = body
                .message
                .unwrap_or_else(|| format!("HTTP {}", response.status));
            if let Some(details) = body.details.filter(|d| !d.is_empty()) {
                message = format!("{} ({})", message, details);
            }
            if let Some(hint) = body.hint.filter(|h| !h.is_empty()) {
                message = format!("{}; hint: {}", message, hint);
            }
            BridgeError::Backend {
                code: body.code.or_else(|| Some(response.status.to_string())),
                message,
            }
        }
        Err(_) => {
            let text = String::from_utf8_lossy(&response.body);
            let text: String = text.trim().chars().take(MAX_ERROR_TEXT).collect();
            BridgeError::Backend {
                code: Some(response.status.to_string()),
                message: if text.is_empty() {
                    format!("HTTP {}", response.status)
                } else {
                    text
                },
            }
        }
    }
}
