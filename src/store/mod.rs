//! Persistent local store: durable collections with secondary indexes.
//!
//! - `schema`: collection names, key paths and declared indexes.
//! - `repo`: SQL-only functions over the SQLite pool.
//!
//! [`LocalStore`] is the typed facade used by the queue, cache, sync manager
//! and gateway. Every operation is durable on return; the only failure mode is
//! [`Error::StorageFault`].

pub mod repo;
pub mod schema;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, instrument};

pub use schema::{Collection, CollectionSchema, IndexSpec};

use crate::error::{Error, Result};
use crate::model::MetadataEntry;
use repo::Pool;

#[derive(Clone, Debug)]
pub struct LocalStore {
    pool: Pool,
}

impl LocalStore {
    /// Open (or create) a file-backed store, run migrations and register the
    /// declared collection schema.
    pub async fn open(database_url: &str) -> Result<Self> {
        let pool = repo::init_pool(database_url).await?;
        Self::from_pool(pool).await
    }

    pub async fn open_in_memory() -> Result<Self> {
        let pool = repo::init_memory_pool().await?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: Pool) -> Result<Self> {
        repo::run_migrations(&pool).await?;
        let schemas: Vec<&CollectionSchema> =
            Collection::ALL.iter().map(Collection::schema).collect();
        repo::register_schema(&pool, &schemas).await?;
        info!("local store ready");
        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Insert or replace a value; its key comes from the collection key path.
    #[instrument(skip_all, fields(collection = collection.name()))]
    pub async fn put<T: Serialize>(&self, collection: Collection, value: &T) -> Result<String> {
        let schema = collection.schema();
        let value = serde_json::to_value(value)?;
        let key = schema::key_of(&value, schema.key_path).ok_or_else(|| {
            Error::storage(format!(
                "value for '{}' has no string '{}' key",
                schema.name, schema.key_path
            ))
        })?;
        repo::upsert_entry(&self.pool, schema, &key, &value).await?;
        Ok(key)
    }

    pub async fn get<T: DeserializeOwned>(
        &self,
        collection: Collection,
        key: &str,
    ) -> Result<Option<T>> {
        repo::fetch_entry(&self.pool, collection.name(), key)
            .await?
            .map(|raw| decode(&raw))
            .transpose()
    }

    /// All values of a collection in insertion order.
    pub async fn get_all<T: DeserializeOwned>(&self, collection: Collection) -> Result<Vec<T>> {
        repo::fetch_all(&self.pool, collection.name())
            .await?
            .iter()
            .map(|raw| decode(raw))
            .collect()
    }

    pub async fn get_all_by_index<T: DeserializeOwned>(
        &self,
        collection: Collection,
        index: &str,
        value: &Value,
    ) -> Result<Vec<T>> {
        let schema = collection.schema();
        let spec = schema.index(index).ok_or_else(|| {
            Error::InvalidRequest(format!(
                "collection '{}' declares no index '{}'",
                schema.name, index
            ))
        })?;
        let Some(needle) = schema::index_text(value) else {
            return Ok(Vec::new());
        };
        repo::fetch_by_index(&self.pool, schema.name, spec.name, &needle)
            .await?
            .iter()
            .map(|raw| decode(raw))
            .collect()
    }

    /// Returns whether a value was removed.
    pub async fn delete(&self, collection: Collection, key: &str) -> Result<bool> {
        repo::delete_entry(&self.pool, collection.name(), key).await
    }

    pub async fn count(&self, collection: Collection) -> Result<u64> {
        let count = repo::count_entries(&self.pool, collection.name()).await?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    pub async fn get_metadata<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let Some(entry) = self
            .get::<MetadataEntry>(Collection::Metadata, key)
            .await?
        else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_value(entry.value)?))
    }

    pub async fn get_metadata_entry(&self, key: &str) -> Result<Option<MetadataEntry>> {
        self.get(Collection::Metadata, key).await
    }

    pub async fn set_metadata<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let entry = MetadataEntry {
            key: key.to_string(),
            value: serde_json::to_value(value)?,
            updated_at: Utc::now(),
        };
        self.put(Collection::Metadata, &entry).await?;
        Ok(())
    }

    pub async fn delete_metadata(&self, key: &str) -> Result<bool> {
        self.delete(Collection::Metadata, key).await
    }
}

fn decode<T: DeserializeOwned>(raw: &str) -> Result<T> {
    Ok(serde_json::from_str(raw)?)
}
