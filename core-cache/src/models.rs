//! Catalog entity models
//!
//! Entities are stored one table per kind. Unknown JSON fields from the remote
//! payload are kept in `extra` so a round trip through the cache does not lose
//! data the engine does not understand.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

// =============================================================================
// Bookkeeping keys
// =============================================================================

pub const KEY_LAST_SYNC_AT: &str = "sync.last_sync_at";
pub const KEY_LAST_ERROR: &str = "sync.last_error";
pub const KEY_IN_PROGRESS: &str = "sync.in_progress";
pub const KEY_PREVIOUS_CONNECTION_CLASS: &str = "sync.previous_connection_class";

/// Prefix shared by every engine bookkeeping key.
pub const SYNC_KEY_PREFIX: &str = "sync.";

// =============================================================================
// Entity kinds
// =============================================================================

/// The four catalog entity types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Channel,
    Category,
    Country,
    Settings,
}

impl EntityKind {
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Channel,
        EntityKind::Category,
        EntityKind::Country,
        EntityKind::Settings,
    ];

    /// Local (and remote) table holding this kind.
    pub fn table_name(&self) -> &'static str {
        match self {
            EntityKind::Channel => "channels",
            EntityKind::Category => "categories",
            EntityKind::Country => "countries",
            EntityKind::Settings => "settings",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Channel => "channel",
            EntityKind::Category => "category",
            EntityKind::Country => "country",
            EntityKind::Settings => "settings",
        }
    }

    /// Parse a payload discriminator or table name.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "channel" | "channels" => Some(EntityKind::Channel),
            "category" | "categories" => Some(EntityKind::Category),
            "country" | "countries" => Some(EntityKind::Country),
            "settings" | "setting" => Some(EntityKind::Settings),
            _ => None,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Entities
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, alias = "streamUrl")]
    pub stream_url: Option<String>,
    #[serde(default)]
    pub logo: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Channel {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            stream_url: None,
            logo: None,
            category: None,
            country: None,
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Category {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            image: None,
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Country {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub flag: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Country {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            flag: None,
            extra: Map::new(),
        }
    }
}

/// Application settings. Logically a singleton.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub id: String,
    /// Everything except the id, kept as an opaque object.
    pub values: Value,
}

impl Settings {
    pub fn new(id: impl Into<String>, values: Value) -> Self {
        Self {
            id: id.into(),
            values,
        }
    }

    /// Backend row shape: the values object with `id` merged back in.
    pub fn to_row(&self) -> Value {
        let mut row = match &self.values {
            Value::Object(fields) => fields.clone(),
            Value::Null => Map::new(),
            other => {
                let mut fields = Map::new();
                fields.insert("values".to_string(), other.clone());
                fields
            }
        };
        row.insert("id".to_string(), Value::String(self.id.clone()));
        Value::Object(row)
    }
}

/// Any cached catalog row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CachedEntity {
    Channel(Channel),
    Category(Category),
    Country(Country),
    Settings(Settings),
}

impl CachedEntity {
    pub fn id(&self) -> &str {
        match self {
            CachedEntity::Channel(c) => &c.id,
            CachedEntity::Category(c) => &c.id,
            CachedEntity::Country(c) => &c.id,
            CachedEntity::Settings(s) => &s.id,
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            CachedEntity::Channel(_) => EntityKind::Channel,
            CachedEntity::Category(_) => EntityKind::Category,
            CachedEntity::Country(_) => EntityKind::Country,
            CachedEntity::Settings(_) => EntityKind::Settings,
        }
    }
}

// =============================================================================
// Snapshot
// =============================================================================

/// A full catalog as fetched in one pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CatalogSnapshot {
    pub channels: Vec<CachedEntity>,
    pub categories: Vec<CachedEntity>,
    pub countries: Vec<CachedEntity>,
    pub settings: Vec<CachedEntity>,
}

/// Row counts per kind, as reported in `EntitiesUpdated`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityCounts {
    pub channels: u64,
    pub categories: u64,
    pub countries: u64,
    pub settings: u64,
}

impl CatalogSnapshot {
    pub fn entities(&self, kind: EntityKind) -> &[CachedEntity] {
        match kind {
            EntityKind::Channel => &self.channels,
            EntityKind::Category => &self.categories,
            EntityKind::Country => &self.countries,
            EntityKind::Settings => &self.settings,
        }
    }

    /// Append an entity to the list for its kind.
    pub fn push(&mut self, entity: CachedEntity) {
        match entity.kind() {
            EntityKind::Channel => self.channels.push(entity),
            EntityKind::Category => self.categories.push(entity),
            EntityKind::Country => self.countries.push(entity),
            EntityKind::Settings => self.settings.push(entity),
        }
    }

    /// Raw list lengths, before deduplication.
    pub fn counts(&self) -> EntityCounts {
        EntityCounts {
            channels: self.channels.len() as u64,
            categories: self.categories.len() as u64,
            countries: self.countries.len() as u64,
            settings: self.settings.len() as u64,
        }
    }
}

// =============================================================================
// Sync metadata
// =============================================================================

/// Persisted engine bookkeeping.
///
/// `last_error` is the serialized error record; this crate does not interpret it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncMetadata {
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub in_progress: bool,
    pub previous_connection_class: Option<String>,
}
