use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::store::Collection;

/// Metadata key of the signed-in user's document.
pub const CURRENT_USER_KEY: &str = "current_user";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Referral,
    Notification,
    User,
}

impl EntityKind {
    pub const ALL: [EntityKind; 3] = [Self::Referral, Self::Notification, Self::User];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Referral => "referral",
            EntityKind::Notification => "notification",
            EntityKind::User => "user",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "referral" => Some(EntityKind::Referral),
            "notification" => Some(EntityKind::Notification),
            "user" => Some(EntityKind::User),
            _ => None,
        }
    }

    /// Remote collection path segment, e.g. `referrals` for `POST /referrals`.
    pub fn remote_collection(&self) -> &'static str {
        match self {
            EntityKind::Referral => "referrals",
            EntityKind::Notification => "notifications",
            EntityKind::User => "users",
        }
    }

    pub fn from_remote_collection(segment: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.remote_collection() == segment)
    }

    /// Local collection holding records of this entity. Users live in the
    /// `current_user` metadata document instead.
    pub fn local_collection(&self) -> Option<Collection> {
        match self {
            EntityKind::Referral => Some(Collection::Records),
            EntityKind::Notification => Some(Collection::Notifications),
            EntityKind::User => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MutationAction {
    Create,
    Update,
    Delete,
}

impl MutationAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationAction::Create => "create",
            MutationAction::Update => "update",
            MutationAction::Delete => "delete",
        }
    }
}

/// A locally persisted entity plus its sync bookkeeping. Domain fields are
/// kept as an open JSON map so the store does not need to know every shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub id: String,
    #[serde(default)]
    pub synced: bool,
    #[serde(default)]
    pub local_only: bool,
    #[serde(default)]
    pub server_id: Option<String>,
    #[serde(default)]
    pub last_sync_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pending_delete: bool,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// Keys owned by [`Record`] itself; never copied into `fields`.
const RECORD_KEYS: [&str; 7] = [
    "id",
    "synced",
    "localOnly",
    "serverId",
    "lastSyncAt",
    "pendingDelete",
    "isOffline",
];

impl Record {
    /// A record created optimistically while offline.
    pub fn local(payload: &Value) -> Self {
        Self {
            id: format!("local-{}", Uuid::new_v4()),
            synced: false,
            local_only: true,
            server_id: None,
            last_sync_at: None,
            pending_delete: false,
            fields: domain_fields(payload),
        }
    }

    /// A record as received from the remote authority. Returns `None` when the
    /// payload carries no identifier.
    pub fn from_remote(payload: &Value) -> Option<Self> {
        let server_id = remote_id(payload)?;
        Some(Self {
            id: server_id.clone(),
            synced: true,
            local_only: false,
            server_id: Some(server_id),
            last_sync_at: Some(Utc::now()),
            pending_delete: false,
            fields: domain_fields(payload),
        })
    }

    /// Overlay domain fields from `payload`, leaving sync metadata alone.
    pub fn merge_fields(&mut self, payload: &Value) {
        for (key, value) in domain_fields(payload) {
            self.fields.insert(key, value);
        }
    }

    /// Stamp the record as acknowledged by the remote authority.
    pub fn mark_synced(&mut self, server_id: Option<String>, remote: Option<&Value>) {
        if let Some(remote) = remote {
            self.merge_fields(remote);
        }
        if let Some(server_id) = server_id {
            self.server_id = Some(server_id);
        }
        self.synced = true;
        self.local_only = false;
        self.last_sync_at = Some(Utc::now());
    }

    /// The identifier to use against the remote authority.
    pub fn remote_id(&self) -> &str {
        self.server_id.as_deref().unwrap_or(&self.id)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

fn domain_fields(payload: &Value) -> Map<String, Value> {
    match payload {
        Value::Object(map) => map
            .iter()
            .filter(|(key, _)| !RECORD_KEYS.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect(),
        _ => Map::new(),
    }
}

/// Extract the authoritative identifier from a remote payload. Numeric ids are
/// rendered as their decimal text.
pub fn remote_id(payload: &Value) -> Option<String> {
    match payload.get("id")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// A pending write not yet acknowledged by the remote authority.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MutationQueueItem {
    pub id: String,
    pub action: MutationAction,
    pub entity: EntityKind,
    #[serde(default)]
    pub entity_id: Option<String>,
    #[serde(default)]
    pub payload: Value,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl MutationQueueItem {
    pub fn new(
        action: MutationAction,
        entity: EntityKind,
        entity_id: Option<String>,
        payload: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            action,
            entity,
            entity_id,
            payload,
            enqueued_at: Utc::now(),
            retry_count: 0,
            last_error: None,
        }
    }
}

/// A mutation that could not be reconciled after exhausting its retries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    #[serde(flatten)]
    pub item: MutationQueueItem,
    pub failed_at: DateTime<Utc>,
}

/// Singleton document stored in the `metadata` collection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetadataEntry {
    pub key: String,
    pub value: Value,
    pub updated_at: DateTime<Utc>,
}
