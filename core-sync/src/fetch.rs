//! Catalog fetch and payload parsing.
//!
//! Two payload shapes are accepted:
//!
//! ```json
//! { "channels": [...], "categories": [...], "countries": [...], "settings": [...] | {...} }
//! [ { "type": "channel", "id": 1, ... }, { "type": "settings", ... } ]
//! ```
//!
//! Ids may be strings or numbers and are normalized to strings. A record
//! without an id makes the whole payload invalid.

use crate::{Result, SyncError};
use bridge_traits::backend::{error_from_response, row_id};
use bridge_traits::{Clock, HttpClient, HttpRequest};
use core_cache::{CachedEntity, CatalogSnapshot, Category, Channel, Country, EntityKind, Settings};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Text fields that some sources send as numbers.
const SCALAR_TEXT_FIELDS: &[&str] = &[
    "name",
    "stream_url",
    "streamUrl",
    "logo",
    "category",
    "country",
    "flag",
    "image",
];

/// GETs the catalog from a resolved source.
pub struct CatalogFetcher {
    http: Arc<dyn HttpClient>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl CatalogFetcher {
    pub fn new(http: Arc<dyn HttpClient>, clock: Arc<dyn Clock>, timeout: Duration) -> Self {
        Self {
            http,
            clock,
            timeout,
        }
    }

    /// Fetch and parse the catalog at `url`.
    ///
    /// # Errors
    ///
    /// - `Timeout` when no complete response arrives within the fetch timeout
    /// - `Backend` for non-2xx answers, with the backend's error code when present
    /// - `InvalidPayload` when the body is not a catalog
    pub async fn fetch(&self, url: &str) -> Result<CatalogSnapshot> {
        let request = HttpRequest::get(url)
            .header("Accept", "application/json")
            .cache_busted(self.clock.unix_timestamp_millis())
            .timeout(self.timeout);

        let response = tokio::time::timeout(self.timeout, self.http.execute(request))
            .await
            .map_err(|_| SyncError::Timeout(format!("GET {url} after {:?}", self.timeout)))??;

        if !response.is_success() {
            return Err(error_from_response(&response).into());
        }

        let snapshot = parse_catalog(&response.body)?;
        debug!(
            url,
            bytes = response.body.len(),
            channels = snapshot.channels.len(),
            "Catalog fetched"
        );
        Ok(snapshot)
    }
}

/// Parse a catalog body into a snapshot.
pub fn parse_catalog(body: &[u8]) -> Result<CatalogSnapshot> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| SyncError::InvalidPayload(format!("malformed JSON: {e}")))?;

    let mut snapshot = CatalogSnapshot::default();

    match value {
        Value::Object(mut collections) => {
            let mut found = false;
            for kind in EntityKind::ALL {
                let Some(section) = collections.remove(kind.table_name()) else {
                    continue;
                };
                found = true;
                match section {
                    Value::Array(records) => {
                        for record in records {
                            snapshot.push(parse_record(kind, record)?);
                        }
                    }
                    // A lone settings object is the singleton itself.
                    record @ Value::Object(_) if kind == EntityKind::Settings => {
                        snapshot.push(parse_record(kind, record)?);
                    }
                    Value::Null => {}
                    _ => {
                        return Err(SyncError::InvalidPayload(format!(
                            "`{}` is not an array",
                            kind.table_name()
                        )))
                    }
                }
            }
            if !found {
                return Err(SyncError::InvalidPayload(
                    "no catalog collections in payload".to_string(),
                ));
            }
        }
        Value::Array(records) => {
            for record in records {
                let kind = record
                    .get("type")
                    .and_then(Value::as_str)
                    .and_then(EntityKind::parse)
                    .ok_or_else(|| {
                        SyncError::InvalidPayload("record without a known `type`".to_string())
                    })?;
                snapshot.push(parse_record(kind, record)?);
            }
        }
        _ => {
            return Err(SyncError::InvalidPayload(
                "payload must be an object or an array".to_string(),
            ))
        }
    }

    Ok(snapshot)
}

fn parse_record(kind: EntityKind, record: Value) -> Result<CachedEntity> {
    let id = row_id(&record)
        .ok_or_else(|| SyncError::InvalidPayload(format!("{kind} record without an id")))?;

    let Value::Object(mut fields) = record else {
        return Err(SyncError::InvalidPayload(format!("{kind} record is not an object")));
    };
    fields.remove("type");
    fields.insert("id".to_string(), Value::String(id.clone()));

    let invalid = |e: serde_json::Error| SyncError::InvalidPayload(format!("{kind} {id}: {e}"));

    Ok(match kind {
        EntityKind::Channel => {
            CachedEntity::Channel(serde_json::from_value::<Channel>(normalized(fields)).map_err(invalid)?)
        }
        EntityKind::Category => {
            CachedEntity::Category(serde_json::from_value::<Category>(normalized(fields)).map_err(invalid)?)
        }
        EntityKind::Country => {
            CachedEntity::Country(serde_json::from_value::<Country>(normalized(fields)).map_err(invalid)?)
        }
        EntityKind::Settings => {
            fields.remove("id");
            CachedEntity::Settings(Settings::new(id, Value::Object(fields)))
        }
    })
}

fn normalized(mut fields: Map<String, Value>) -> Value {
    for key in SCALAR_TEXT_FIELDS {
        if let Some(value) = fields.get_mut(*key) {
            match value {
                Value::Number(n) => *value = Value::String(n.to_string()),
                Value::Bool(b) => *value = Value::String(b.to_string()),
                _ => {}
            }
        }
    }
    // Both spellings present: the snake_case one wins.
    if fields.contains_key("stream_url") {
        fields.remove("streamUrl");
    }
    Value::Object(fields)
}
