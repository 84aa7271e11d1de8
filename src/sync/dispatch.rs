//! Per-item remote calls and the local bookkeeping that follows a success.

use serde_json::{json, Value};

use crate::error::Result;
use crate::model::{
    remote_id, EntityKind, MutationAction, MutationQueueItem, Record, CURRENT_USER_KEY,
};
use crate::queue::MutationQueue;
use crate::remote::{RemoteRequest, RemoteService, TransportError};
use crate::store::LocalStore;

pub(super) type Outcome = std::result::Result<Value, TransportError>;

/// Issue the remote call for `item`. The outer error is a local storage
/// fault; the inner one is the attempt failing.
pub(super) async fn send(
    store: &LocalStore,
    remote: &dyn RemoteService,
    item: &MutationQueueItem,
) -> Result<Outcome> {
    let request = match item.action {
        MutationAction::Create => {
            let mut body = item.payload.clone();
            if let (Value::Object(map), Some(local_id)) = (&mut body, &item.entity_id) {
                map.insert("clientId".into(), json!(local_id));
            }
            let key = item.entity_id.clone().unwrap_or_else(|| item.id.clone());
            RemoteRequest::post(collection_path(item.entity), body).with_idempotency_key(key)
        }
        MutationAction::Update => {
            RemoteRequest::patch(resource_path(store, item).await?, item.payload.clone())
        }
        MutationAction::Delete => RemoteRequest::delete(resource_path(store, item).await?),
    };

    let outcome = match remote.send(request).await {
        // Already gone is what a delete wants.
        Err(TransportError::Status { code: 404, .. }) if item.action == MutationAction::Delete => {
            Ok(Value::Null)
        }
        Ok(value)
            if item.action == MutationAction::Create
                && item.entity.local_collection().is_some()
                && remote_id(&value).is_none() =>
        {
            Err(TransportError::Decode(
                "create response carries no identifier".into(),
            ))
        }
        other => other,
    };
    Ok(outcome)
}

/// Reflect an acknowledged mutation in the local store. Must run after the
/// item left the queue so later writes for the same entity are visible.
pub(super) async fn apply_success(
    store: &LocalStore,
    queue: &MutationQueue,
    item: &MutationQueueItem,
    response: &Value,
) -> Result<()> {
    let Some(collection) = item.entity.local_collection() else {
        return apply_user(store, item, response).await;
    };
    let Some(local_id) = item.entity_id.as_deref() else {
        return Ok(());
    };

    if item.action == MutationAction::Delete {
        store.delete(collection, local_id).await?;
        return Ok(());
    }

    let Some(mut record) = store.get::<Record>(collection, local_id).await? else {
        return Ok(());
    };
    let server_id = match item.action {
        MutationAction::Create => remote_id(response),
        _ => None,
    };
    record.mark_synced(server_id, response.is_object().then_some(response));
    if !queue.pending_for_entity(item.entity, local_id).await?.is_empty() {
        record.synced = false;
    }
    store.put(collection, &record).await?;
    Ok(())
}

/// Only writes through `/me` (no entity id) touch the current-user document.
async fn apply_user(store: &LocalStore, item: &MutationQueueItem, response: &Value) -> Result<()> {
    if item.entity_id.is_some() || item.action == MutationAction::Create {
        return Ok(());
    }
    if item.action == MutationAction::Delete {
        store.delete_metadata(CURRENT_USER_KEY).await?;
        return Ok(());
    }
    let Value::Object(fields) = response else {
        return Ok(());
    };
    let mut current = match store.get_metadata::<Value>(CURRENT_USER_KEY).await? {
        Some(Value::Object(map)) => map,
        _ => Default::default(),
    };
    for (key, value) in fields {
        current.insert(key.clone(), value.clone());
    }
    store
        .set_metadata(CURRENT_USER_KEY, &Value::Object(current))
        .await
}

pub(super) fn collection_path(entity: EntityKind) -> String {
    format!("/{}", entity.remote_collection())
}

async fn resource_path(store: &LocalStore, item: &MutationQueueItem) -> Result<String> {
    let Some(local_id) = item.entity_id.as_deref() else {
        return Ok(match item.entity {
            EntityKind::User => "/me".to_string(),
            other => collection_path(other),
        });
    };
    let id = resolve_remote_id(store, item.entity, local_id).await?;
    Ok(format!("{}/{}", collection_path(item.entity), id))
}

/// The identifier the authority knows: `serverId` when the local record has
/// one, otherwise the id the mutation was queued with.
pub(super) async fn resolve_remote_id(
    store: &LocalStore,
    entity: EntityKind,
    local_id: &str,
) -> Result<String> {
    let Some(collection) = entity.local_collection() else {
        return Ok(local_id.to_string());
    };
    Ok(store
        .get::<Record>(collection, local_id)
        .await?
        .map(|record| record.remote_id().to_string())
        .unwrap_or_else(|| local_id.to_string()))
}
