//! SQL-only functions backing [`LocalStore`](super::LocalStore).
//!
//! Every write runs inside a transaction and is committed before returning.

use std::str::FromStr;

use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tracing::{info, instrument};

use super::schema::{index_value, CollectionSchema, IndexSpec};
use crate::error::{Error, Result};

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    if normalized.starts_with("sqlite::memory") {
        return init_memory_pool().await;
    }
    let options = SqliteConnectOptions::from_str(&normalized)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full);
    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// A single-connection in-memory pool; the database lives as long as the pool.
pub async fn init_memory_pool() -> Result<Pool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// Expand a leading `~/` in file-backed SQLite URLs and make sure the parent
/// directory exists. In-memory and non-sqlite URLs pass through.
fn prepare_sqlite_url(url: &str) -> String {
    let Some(rest) = url.strip_prefix("sqlite:") else {
        return url.to_string();
    };
    if rest.starts_with(":memory") {
        return url.to_string();
    }
    let rest = rest.strip_prefix("//").unwrap_or(rest);
    let (path, query) = match rest.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (rest, None),
    };
    if path.is_empty() {
        return url.to_string();
    }

    let path = match (path.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(tail), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), tail),
        _ => path.to_string(),
    };
    if let Some(parent) = std::path::Path::new(&path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    match query {
        Some(q) => format!("sqlite://{path}?{q}"),
        None => format!("sqlite://{path}"),
    }
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Reconcile the declared logical schema with the one persisted in
/// `store_schema`. New indexes are backfilled; persisted entries that are no
/// longer declared (or changed key path) need a migration and fail the open.
#[instrument(skip_all)]
pub async fn register_schema(pool: &Pool, schemas: &[&CollectionSchema]) -> Result<()> {
    let mut tx = pool.begin().await?;
    let persisted: Vec<(String, String, String)> =
        sqlx::query_as("SELECT collection, index_name, key_path FROM store_schema")
            .fetch_all(&mut *tx)
            .await?;

    for (collection, index_name, key_path) in &persisted {
        let declared = schemas.iter().find(|s| s.name == collection);
        let expected = declared.and_then(|schema| {
            if index_name.is_empty() {
                Some(schema.key_path)
            } else {
                schema.index(index_name).map(|index| index.key_path)
            }
        });
        if expected != Some(key_path.as_str()) {
            let what = if index_name.is_empty() {
                format!("collection '{collection}'")
            } else {
                format!("index '{collection}.{index_name}'")
            };
            return Err(Error::storage(format!(
                "persisted {what} (key path '{key_path}') does not match the declared schema; a migration is required"
            )));
        }
    }

    let known = |collection: &str, index_name: &str| {
        persisted
            .iter()
            .any(|(c, i, _)| c == collection && i == index_name)
    };

    for schema in schemas {
        if !known(schema.name, "") {
            insert_schema_row(&mut tx, schema.name, "", schema.key_path).await?;
        }
        for index in schema.indexes {
            if known(schema.name, index.name) {
                continue;
            }
            insert_schema_row(&mut tx, schema.name, index.name, index.key_path).await?;
            let rows = backfill_index(&mut tx, schema, index).await?;
            info!(
                collection = schema.name,
                index = index.name,
                rows,
                "registered secondary index"
            );
        }
    }

    tx.commit().await?;
    Ok(())
}

async fn insert_schema_row(
    tx: &mut Transaction<'_, Sqlite>,
    collection: &str,
    index_name: &str,
    key_path: &str,
) -> Result<()> {
    sqlx::query("INSERT INTO store_schema (collection, index_name, key_path) VALUES (?, ?, ?)")
        .bind(collection)
        .bind(index_name)
        .bind(key_path)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

async fn backfill_index(
    tx: &mut Transaction<'_, Sqlite>,
    schema: &CollectionSchema,
    index: &IndexSpec,
) -> Result<u64> {
    let rows = sqlx::query("SELECT key, value FROM store_entries WHERE collection = ?")
        .bind(schema.name)
        .fetch_all(&mut **tx)
        .await?;

    let mut indexed = 0;
    for row in rows {
        let key: String = row.get("key");
        let raw: String = row.get("value");
        let value: Value = serde_json::from_str(&raw)?;
        if let Some(index_value) = index_value(&value, index.key_path) {
            insert_index_row(tx, schema.name, index.name, &index_value, &key).await?;
            indexed += 1;
        }
    }
    Ok(indexed)
}

async fn insert_index_row(
    tx: &mut Transaction<'_, Sqlite>,
    collection: &str,
    index_name: &str,
    index_value: &str,
    key: &str,
) -> Result<()> {
    sqlx::query(
        "INSERT OR REPLACE INTO store_index (collection, index_name, index_value, key) VALUES (?, ?, ?, ?)",
    )
    .bind(collection)
    .bind(index_name)
    .bind(index_value)
    .bind(key)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Insert or replace `value` under `key`. An existing key keeps its insertion
/// position.
#[instrument(skip_all, fields(collection = schema.name))]
pub async fn upsert_entry(
    pool: &Pool,
    schema: &CollectionSchema,
    key: &str,
    value: &Value,
) -> Result<()> {
    let body = serde_json::to_string(value)?;
    let mut tx = pool.begin().await?;
    sqlx::query(
        "INSERT INTO store_entries (collection, key, value, updated_at) VALUES (?, ?, ?, CURRENT_TIMESTAMP) \
         ON CONFLICT(collection, key) DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP",
    )
    .bind(schema.name)
    .bind(key)
    .bind(&body)
    .execute(&mut *tx)
    .await?;

    sqlx::query("DELETE FROM store_index WHERE collection = ? AND key = ?")
        .bind(schema.name)
        .bind(key)
        .execute(&mut *tx)
        .await?;
    for index in schema.indexes {
        if let Some(index_value) = index_value(value, index.key_path) {
            insert_index_row(&mut tx, schema.name, index.name, &index_value, key).await?;
        }
    }

    tx.commit().await?;
    Ok(())
}

pub async fn fetch_entry(pool: &Pool, collection: &str, key: &str) -> Result<Option<String>> {
    let value = sqlx::query_scalar::<_, String>(
        "SELECT value FROM store_entries WHERE collection = ? AND key = ?",
    )
    .bind(collection)
    .bind(key)
    .fetch_optional(pool)
    .await?;
    Ok(value)
}

pub async fn fetch_all(pool: &Pool, collection: &str) -> Result<Vec<String>> {
    let values = sqlx::query_scalar::<_, String>(
        "SELECT value FROM store_entries WHERE collection = ? ORDER BY seq ASC",
    )
    .bind(collection)
    .fetch_all(pool)
    .await?;
    Ok(values)
}

pub async fn fetch_by_index(
    pool: &Pool,
    collection: &str,
    index_name: &str,
    index_value: &str,
) -> Result<Vec<String>> {
    let values = sqlx::query_scalar::<_, String>(
        "SELECT e.value FROM store_entries e \
         JOIN store_index i ON i.collection = e.collection AND i.key = e.key \
         WHERE i.collection = ? AND i.index_name = ? AND i.index_value = ? \
         ORDER BY e.seq ASC",
    )
    .bind(collection)
    .bind(index_name)
    .bind(index_value)
    .fetch_all(pool)
    .await?;
    Ok(values)
}

/// Returns whether a row was removed.
#[instrument(skip_all, fields(collection = %collection))]
pub async fn delete_entry(pool: &Pool, collection: &str, key: &str) -> Result<bool> {
    let mut tx = pool.begin().await?;
    let removed = sqlx::query("DELETE FROM store_entries WHERE collection = ? AND key = ?")
        .bind(collection)
        .bind(key)
        .execute(&mut *tx)
        .await?
        .rows_affected();
    sqlx::query("DELETE FROM store_index WHERE collection = ? AND key = ?")
        .bind(collection)
        .bind(key)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(removed > 0)
}

pub async fn count_entries(pool: &Pool, collection: &str) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM store_entries WHERE collection = ?")
        .bind(collection)
        .fetch_one(pool)
        .await?;
    Ok(count)
}
