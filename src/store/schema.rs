//! Logical schema of the local store: collection names, key paths and
//! secondary indexes. Part of the durable contract; changing a name or dropping
//! an index needs a migration.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Collection {
    Records,
    Notifications,
    MutationQueue,
    Metadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexSpec {
    pub name: &'static str,
    pub key_path: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectionSchema {
    pub name: &'static str,
    pub key_path: &'static str,
    pub indexes: &'static [IndexSpec],
}

impl CollectionSchema {
    pub fn index(&self, name: &str) -> Option<&'static IndexSpec> {
        self.indexes.iter().find(|index| index.name == name)
    }
}

const fn index(name: &'static str) -> IndexSpec {
    IndexSpec {
        name,
        key_path: name,
    }
}

const RECORDS: CollectionSchema = CollectionSchema {
    name: "records",
    key_path: "id",
    indexes: &[
        index("synced"),
        index("status"),
        index("serverId"),
        index("localOnly"),
    ],
};

const NOTIFICATIONS: CollectionSchema = CollectionSchema {
    name: "notifications",
    key_path: "id",
    indexes: &[index("synced"), index("serverId"), index("read")],
};

const MUTATION_QUEUE: CollectionSchema = CollectionSchema {
    name: "mutation-queue",
    key_path: "id",
    indexes: &[index("entity"), index("entityId"), index("enqueuedAt")],
};

const METADATA: CollectionSchema = CollectionSchema {
    name: "metadata",
    key_path: "key",
    indexes: &[],
};

impl Collection {
    pub const ALL: [Collection; 4] = [
        Self::Records,
        Self::Notifications,
        Self::MutationQueue,
        Self::Metadata,
    ];

    pub fn name(&self) -> &'static str {
        self.schema().name
    }

    pub fn schema(&self) -> &'static CollectionSchema {
        match self {
            Collection::Records => &RECORDS,
            Collection::Notifications => &NOTIFICATIONS,
            Collection::MutationQueue => &MUTATION_QUEUE,
            Collection::Metadata => &METADATA,
        }
    }
}

/// Primary key of `value` under `key_path`. Only non-empty strings qualify.
pub fn key_of(value: &Value, key_path: &str) -> Option<String> {
    match value.get(key_path)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

/// Text form of an indexable field; `null` and missing fields are not indexed.
pub fn index_value(value: &Value, key_path: &str) -> Option<String> {
    value.get(key_path).and_then(index_text)
}

/// Text form used for both stored index entries and lookups.
pub fn index_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
