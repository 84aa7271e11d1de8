//! Two-tier response cache for idempotent reads.
//!
//! The in-memory tier expires entries after a TTL, checked on every lookup
//! and by a periodic sweep. The durable tier lives in the store's `metadata`
//! collection under `cache:<signature>` and is only consulted while offline,
//! where stale data beats no data.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use crate::error::Result;
use crate::model::MetadataEntry;
use crate::store::{Collection, LocalStore};

pub const DEFAULT_TTL: Duration = Duration::from_secs(300);
const DURABLE_PREFIX: &str = "cache:";

/// Deterministic cache key: `"<METHOD> <url>"`, plus the canonical JSON body
/// when one is present.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestSignature(String);

impl RequestSignature {
    pub fn new(method: &str, url: &str, body: Option<&Value>) -> Self {
        let method = method.to_ascii_uppercase();
        match body.filter(|b| !b.is_null()) {
            Some(body) => Self(format!("{method} {url} {}", canonical_json(body))),
            None => Self(format!("{method} {url}")),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn durable_key(&self) -> String {
        format!("{DURABLE_PREFIX}{}", self.0)
    }
}

/// Compact JSON with object keys sorted at every level, independent of the
/// map ordering serde_json was built with.
fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|key| format!("{}:{}", Value::String(key.clone()), canonical_json(&map[key])))
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let items: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", items.join(","))
        }
        other => other.to_string(),
    }
}

impl fmt::Display for RequestSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub key: String,
    pub url: String,
    pub value: Value,
    pub stored_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn is_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        now.signed_duration_since(self.stored_at)
            .to_std()
            .map(|age| age > ttl)
            .unwrap_or(false)
    }

    fn matches_path(&self, prefix: &str) -> bool {
        let path = self.url.split('?').next().unwrap_or_default();
        path == prefix || path.starts_with(&format!("{}/", prefix.trim_end_matches('/')))
    }
}

#[derive(Clone)]
pub struct ResponseCache {
    entries: Arc<RwLock<HashMap<RequestSignature, CacheEntry>>>,
    store: LocalStore,
    ttl: Duration,
}

impl fmt::Debug for ResponseCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseCache")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl ResponseCache {
    pub fn new(store: LocalStore) -> Self {
        Self::with_ttl(store, DEFAULT_TTL)
    }

    pub fn with_ttl(store: LocalStore, ttl: Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            store,
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Fresh in-memory value for `signature`. Expired entries are dropped
    /// here even if the sweeper has not reached them yet.
    pub async fn get(&self, signature: &RequestSignature) -> Option<Value> {
        let now = Utc::now();
        {
            let entries = self.entries.read().await;
            match entries.get(signature) {
                None => return None,
                Some(entry) if !entry.is_expired(now, self.ttl) => {
                    return Some(entry.value.clone())
                }
                Some(_) => {}
            }
        }
        let mut entries = self.entries.write().await;
        if entries
            .get(signature)
            .is_some_and(|entry| entry.is_expired(now, self.ttl))
        {
            entries.remove(signature);
            debug!(%signature, "evicted expired cache entry");
        }
        None
    }

    /// Store `value` in both tiers.
    #[instrument(skip_all, fields(signature = %signature))]
    pub async fn put(&self, signature: &RequestSignature, url: &str, value: &Value) -> Result<()> {
        let entry = CacheEntry {
            key: signature.as_str().to_string(),
            url: url.to_string(),
            value: value.clone(),
            stored_at: Utc::now(),
        };
        self.store
            .set_metadata(&signature.durable_key(), &entry)
            .await?;
        self.entries.write().await.insert(signature.clone(), entry);
        Ok(())
    }

    /// Last value persisted for `signature`, regardless of age.
    pub async fn get_durable(&self, signature: &RequestSignature) -> Result<Option<Value>> {
        let entry: Option<CacheEntry> = self.store.get_metadata(&signature.durable_key()).await?;
        Ok(entry.map(|entry| entry.value))
    }

    /// Drop expired in-memory entries. Returns how many were removed.
    pub async fn sweep(&self) -> usize {
        let now = Utc::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now, self.ttl));
        before - entries.len()
    }

    pub fn spawn_sweeper(&self, period: Duration) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let removed = cache.sweep().await;
                if removed > 0 {
                    debug!(removed, "swept expired cache entries");
                }
            }
        })
    }

    /// Drop every entry, in both tiers, whose URL path is `prefix` or lies
    /// beneath it.
    #[instrument(skip_all, fields(prefix = %prefix))]
    pub async fn invalidate_path(&self, prefix: &str) -> Result<usize> {
        let mut removed = {
            let mut entries = self.entries.write().await;
            let before = entries.len();
            entries.retain(|_, entry| !entry.matches_path(prefix));
            before - entries.len()
        };

        let metadata: Vec<MetadataEntry> = self.store.get_all(Collection::Metadata).await?;
        for meta in metadata {
            if !meta.key.starts_with(DURABLE_PREFIX) {
                continue;
            }
            let entry: CacheEntry = match serde_json::from_value(meta.value) {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(key = %meta.key, %err, "dropping unreadable durable cache entry");
                    self.store.delete_metadata(&meta.key).await?;
                    continue;
                }
            };
            if entry.matches_path(prefix) && self.store.delete_metadata(&meta.key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Forget all in-memory entries. The durable tier is left alone.
    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
