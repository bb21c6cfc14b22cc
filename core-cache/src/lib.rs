//! # Core Cache
//!
//! Local SQLite store for catalog entities and the engine's `sync.*`
//! bookkeeping keys.
//!
//! - [`db`]: pool creation and schema
//! - [`models`]: entity types and the per-pass [`CatalogSnapshot`]
//! - [`store`]: the [`LocalCache`] contract and its SQLite implementation

pub mod db;
pub mod error;
pub mod models;
pub mod store;

pub use db::{create_pool, create_test_pool, DatabaseConfig};
pub use error::{CacheError, Result};
pub use models::{
    CachedEntity, CatalogSnapshot, Category, Channel, Country, EntityCounts, EntityKind, Settings,
    SyncMetadata,
};
pub use store::{LocalCache, SqliteLocalCache};
