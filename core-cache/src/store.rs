//! Local cache and sync bookkeeping store.
//!
//! Every bulk write runs inside one SQLite transaction. A failure anywhere in
//! the write drops the transaction, which rolls it back and leaves the
//! previous rows visible.

use crate::models::{
    CachedEntity, CatalogSnapshot, Category, Channel, Country, EntityCounts, EntityKind, Settings,
    SyncMetadata, KEY_IN_PROGRESS, KEY_LAST_ERROR, KEY_LAST_SYNC_AT,
    KEY_PREVIOUS_CONNECTION_CLASS, SYNC_KEY_PREFIX,
};
use crate::{CacheError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::{FromRow, SqliteConnection, SqlitePool};
use std::collections::HashMap;
use tracing::{debug, instrument, warn};

/// Storage contract for cached catalog entities and engine bookkeeping.
#[async_trait]
pub trait LocalCache: Send + Sync {
    /// All rows of `kind` in remote order.
    async fn read_all(&self, kind: EntityKind) -> Result<Vec<CachedEntity>>;

    /// Replace every row of `kind`. Duplicate ids collapse to one row holding
    /// the last occurrence's data. Returns the number of rows stored.
    async fn replace_all(&self, kind: EntityKind, entities: Vec<CachedEntity>) -> Result<u64>;

    /// Replace all four kinds in a single transaction.
    async fn replace_snapshot(&self, snapshot: &CatalogSnapshot) -> Result<EntityCounts>;

    async fn count(&self, kind: EntityKind) -> Result<u64>;

    /// Insert or overwrite one row. New rows are appended after existing ones.
    async fn upsert_entity(&self, entity: &CachedEntity) -> Result<()>;

    /// Returns `false` when no row matched.
    async fn delete_entity(&self, kind: EntityKind, id: &str) -> Result<bool>;

    async fn get_sync_metadata(&self) -> Result<SyncMetadata>;

    async fn set_last_sync_at(&self, at: DateTime<Utc>) -> Result<()>;

    /// Store the serialized error record, or clear it with `None`.
    async fn set_last_error(&self, error: Option<String>) -> Result<()>;

    async fn set_in_progress(&self, in_progress: bool) -> Result<()>;

    async fn set_previous_connection_class(&self, class: &str) -> Result<()>;

    /// Keep only the first settings row. Returns how many rows were removed.
    async fn collapse_settings(&self) -> Result<usize>;

    /// Drop every cached entity and every `sync.` key.
    async fn reset(&self) -> Result<()>;
}

/// SQLite implementation of [`LocalCache`].
pub struct SqliteLocalCache {
    pool: SqlitePool,
}

impl SqliteLocalCache {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_metadata (key, value, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn clear_meta(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM sync_metadata WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// =============================================================================
// Row mapping
// =============================================================================

#[derive(FromRow)]
struct ChannelRow {
    id: String,
    name: String,
    stream_url: Option<String>,
    logo: Option<String>,
    category: Option<String>,
    country: Option<String>,
    extra: String,
}

#[derive(FromRow)]
struct CategoryRow {
    id: String,
    name: String,
    image: Option<String>,
    extra: String,
}

#[derive(FromRow)]
struct CountryRow {
    id: String,
    name: String,
    flag: Option<String>,
    extra: String,
}

#[derive(FromRow)]
struct SettingsRow {
    id: String,
    values: String,
}

fn parse_extra(raw: &str) -> Result<Map<String, Value>> {
    Ok(serde_json::from_str(raw)?)
}

impl TryFrom<ChannelRow> for CachedEntity {
    type Error = CacheError;

    fn try_from(row: ChannelRow) -> Result<Self> {
        Ok(CachedEntity::Channel(Channel {
            extra: parse_extra(&row.extra)?,
            id: row.id,
            name: row.name,
            stream_url: row.stream_url,
            logo: row.logo,
            category: row.category,
            country: row.country,
        }))
    }
}

impl TryFrom<CategoryRow> for CachedEntity {
    type Error = CacheError;

    fn try_from(row: CategoryRow) -> Result<Self> {
        Ok(CachedEntity::Category(Category {
            extra: parse_extra(&row.extra)?,
            id: row.id,
            name: row.name,
            image: row.image,
        }))
    }
}

impl TryFrom<CountryRow> for CachedEntity {
    type Error = CacheError;

    fn try_from(row: CountryRow) -> Result<Self> {
        Ok(CachedEntity::Country(Country {
            extra: parse_extra(&row.extra)?,
            id: row.id,
            name: row.name,
            flag: row.flag,
        }))
    }
}

impl TryFrom<SettingsRow> for CachedEntity {
    type Error = CacheError;

    fn try_from(row: SettingsRow) -> Result<Self> {
        Ok(CachedEntity::Settings(Settings {
            values: serde_json::from_str(&row.values)?,
            id: row.id,
        }))
    }
}

/// Data columns per kind, in bind order after `id` and `position`.
fn data_columns(kind: EntityKind) -> &'static [&'static str] {
    match kind {
        EntityKind::Channel => &["name", "stream_url", "logo", "category", "country", "extra"],
        EntityKind::Category => &["name", "image", "extra"],
        EntityKind::Country => &["name", "flag", "extra"],
        EntityKind::Settings => &["values"],
    }
}

fn data_values(entity: &CachedEntity) -> Result<Vec<Option<String>>> {
    let extra = |m: &Map<String, Value>| serde_json::to_string(m);

    Ok(match entity {
        CachedEntity::Channel(c) => vec![
            Some(c.name.clone()),
            c.stream_url.clone(),
            c.logo.clone(),
            c.category.clone(),
            c.country.clone(),
            Some(extra(&c.extra)?),
        ],
        CachedEntity::Category(c) => {
            vec![Some(c.name.clone()), c.image.clone(), Some(extra(&c.extra)?)]
        }
        CachedEntity::Country(c) => {
            vec![Some(c.name.clone()), c.flag.clone(), Some(extra(&c.extra)?)]
        }
        CachedEntity::Settings(s) => vec![Some(serde_json::to_string(&s.values)?)],
    })
}

/// Insert one row. With `position == None` the row is upserted and appended
/// after the current last position when new.
async fn write_row(
    conn: &mut SqliteConnection,
    entity: &CachedEntity,
    position: Option<i64>,
) -> Result<()> {
    let kind = entity.kind();
    if entity.id().trim().is_empty() {
        return Err(CacheError::InvalidInput {
            field: "id".to_string(),
            message: format!("{kind} without an id"),
        });
    }

    let table = kind.table_name();
    let columns = data_columns(kind);
    let column_list = columns
        .iter()
        .map(|c| format!("\"{c}\""))
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = vec!["?"; columns.len()].join(", ");

    let sql = match position {
        Some(_) => format!(
            "INSERT INTO {table} (id, position, {column_list}) VALUES (?, ?, {placeholders})"
        ),
        None => {
            let updates = columns
                .iter()
                .map(|c| format!("\"{c}\" = excluded.\"{c}\""))
                .collect::<Vec<_>>()
                .join(", ");
            format!(
                "INSERT INTO {table} (id, position, {column_list}) \
                 VALUES (?, (SELECT COALESCE(MAX(position), -1) + 1 FROM {table}), {placeholders}) \
                 ON CONFLICT(id) DO UPDATE SET {updates}"
            )
        }
    };

    let mut query = sqlx::query(&sql).bind(entity.id().to_string());
    if let Some(position) = position {
        query = query.bind(position);
    }
    for value in data_values(entity)? {
        query = query.bind(value);
    }
    query.execute(&mut *conn).await?;

    Ok(())
}

/// Collapse duplicate ids: the first occurrence keeps its slot, the last
/// occurrence supplies the data.
fn dedupe(entities: &[CachedEntity]) -> Vec<&CachedEntity> {
    let mut slots: HashMap<&str, usize> = HashMap::new();
    let mut ordered: Vec<&CachedEntity> = Vec::with_capacity(entities.len());

    for entity in entities {
        match slots.get(entity.id()) {
            Some(&slot) => ordered[slot] = entity,
            None => {
                slots.insert(entity.id(), ordered.len());
                ordered.push(entity);
            }
        }
    }

    ordered
}

async fn write_kind(
    conn: &mut SqliteConnection,
    kind: EntityKind,
    entities: &[CachedEntity],
) -> Result<u64> {
    sqlx::query(&format!("DELETE FROM {}", kind.table_name()))
        .execute(&mut *conn)
        .await?;

    let rows = dedupe(entities);
    if rows.len() < entities.len() {
        debug!(
            kind = %kind,
            duplicates = entities.len() - rows.len(),
            "Collapsed duplicate ids in payload"
        );
    }

    for (position, entity) in rows.iter().enumerate() {
        if entity.kind() != kind {
            return Err(CacheError::InvalidInput {
                field: "kind".to_string(),
                message: format!("{} row in {} list", entity.kind(), kind),
            });
        }
        write_row(conn, entity, Some(position as i64)).await?;
    }

    Ok(rows.len() as u64)
}

#[async_trait]
impl LocalCache for SqliteLocalCache {
    #[instrument(skip(self))]
    async fn read_all(&self, kind: EntityKind) -> Result<Vec<CachedEntity>> {
        let entities = match kind {
            EntityKind::Channel => sqlx::query_as::<_, ChannelRow>(
                "SELECT id, name, stream_url, logo, category, country, extra \
                 FROM channels ORDER BY position, id",
            )
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(CachedEntity::try_from)
            .collect::<Result<Vec<_>>>()?,
            EntityKind::Category => sqlx::query_as::<_, CategoryRow>(
                "SELECT id, name, image, extra FROM categories ORDER BY position, id",
            )
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(CachedEntity::try_from)
            .collect::<Result<Vec<_>>>()?,
            EntityKind::Country => sqlx::query_as::<_, CountryRow>(
                "SELECT id, name, flag, extra FROM countries ORDER BY position, id",
            )
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(CachedEntity::try_from)
            .collect::<Result<Vec<_>>>()?,
            EntityKind::Settings => sqlx::query_as::<_, SettingsRow>(
                "SELECT id, \"values\" FROM settings ORDER BY position, id",
            )
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(CachedEntity::try_from)
            .collect::<Result<Vec<_>>>()?,
        };

        Ok(entities)
    }

    #[instrument(skip(self, entities), fields(rows = entities.len()))]
    async fn replace_all(&self, kind: EntityKind, entities: Vec<CachedEntity>) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let stored = write_kind(&mut tx, kind, &entities).await?;
        tx.commit().await?;

        debug!(kind = %kind, stored, "Replaced cached rows");
        Ok(stored)
    }

    #[instrument(skip(self, snapshot))]
    async fn replace_snapshot(&self, snapshot: &CatalogSnapshot) -> Result<EntityCounts> {
        let mut tx = self.pool.begin().await?;

        let counts = EntityCounts {
            channels: write_kind(&mut tx, EntityKind::Channel, &snapshot.channels).await?,
            categories: write_kind(&mut tx, EntityKind::Category, &snapshot.categories).await?,
            countries: write_kind(&mut tx, EntityKind::Country, &snapshot.countries).await?,
            settings: write_kind(&mut tx, EntityKind::Settings, &snapshot.settings).await?,
        };

        tx.commit().await?;

        debug!(
            channels = counts.channels,
            categories = counts.categories,
            countries = counts.countries,
            settings = counts.settings,
            "Snapshot committed"
        );
        Ok(counts)
    }

    async fn count(&self, kind: EntityKind) -> Result<u64> {
        let (count,): (i64,) =
            sqlx::query_as(&format!("SELECT COUNT(*) FROM {}", kind.table_name()))
                .fetch_one(&self.pool)
                .await?;
        Ok(count as u64)
    }

    #[instrument(skip(self, entity), fields(kind = %entity.kind(), id = %entity.id()))]
    async fn upsert_entity(&self, entity: &CachedEntity) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        write_row(&mut conn, entity, None).await
    }

    #[instrument(skip(self))]
    async fn delete_entity(&self, kind: EntityKind, id: &str) -> Result<bool> {
        let result = sqlx::query(&format!("DELETE FROM {} WHERE id = ?", kind.table_name()))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_sync_metadata(&self) -> Result<SyncMetadata> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT key, value FROM sync_metadata WHERE key LIKE 'sync.%'")
                .fetch_all(&self.pool)
                .await?;

        let mut metadata = SyncMetadata::default();
        for (key, value) in rows {
            match key.as_str() {
                KEY_LAST_SYNC_AT => match DateTime::parse_from_rfc3339(&value) {
                    Ok(at) => metadata.last_sync_at = Some(at.with_timezone(&Utc)),
                    Err(e) => warn!(error = %e, value = %value, "Ignoring unreadable last sync time"),
                },
                KEY_LAST_ERROR => metadata.last_error = Some(value),
                KEY_IN_PROGRESS => metadata.in_progress = value == "true",
                KEY_PREVIOUS_CONNECTION_CLASS => metadata.previous_connection_class = Some(value),
                _ => {}
            }
        }

        Ok(metadata)
    }

    async fn set_last_sync_at(&self, at: DateTime<Utc>) -> Result<()> {
        self.set_meta(KEY_LAST_SYNC_AT, &at.to_rfc3339()).await
    }

    async fn set_last_error(&self, error: Option<String>) -> Result<()> {
        match error {
            Some(error) => self.set_meta(KEY_LAST_ERROR, &error).await,
            None => self.clear_meta(KEY_LAST_ERROR).await,
        }
    }

    async fn set_in_progress(&self, in_progress: bool) -> Result<()> {
        self.set_meta(KEY_IN_PROGRESS, if in_progress { "true" } else { "false" })
            .await
    }

    async fn set_previous_connection_class(&self, class: &str) -> Result<()> {
        self.set_meta(KEY_PREVIOUS_CONNECTION_CLASS, class).await
    }

    #[instrument(skip(self))]
    async fn collapse_settings(&self) -> Result<usize> {
        let mut tx = self.pool.begin().await?;

        let keep: Option<(String,)> =
            sqlx::query_as("SELECT id FROM settings ORDER BY position, id LIMIT 1")
                .fetch_optional(&mut *tx)
                .await?;

        let removed = match keep {
            Some((id,)) => sqlx::query("DELETE FROM settings WHERE id != ?")
                .bind(&id)
                .execute(&mut *tx)
                .await?
                .rows_affected() as usize,
            None => 0,
        };

        tx.commit().await?;

        if removed > 0 {
            debug!(removed, "Collapsed local settings to a single row");
        }
        Ok(removed)
    }

    #[instrument(skip(self))]
    async fn reset(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for kind in EntityKind::ALL {
            sqlx::query(&format!("DELETE FROM {}", kind.table_name()))
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query("DELETE FROM sync_metadata WHERE key LIKE ?")
            .bind(format!("{SYNC_KEY_PREFIX}%"))
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        warn!("Local cache reset");
        Ok(())
    }
}
