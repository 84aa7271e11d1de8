//! Durable, ordered log of writes not yet acknowledged by the remote authority.

use serde_json::json;
use tracing::{debug, instrument};

use crate::error::Result;
use crate::model::{EntityKind, MutationQueueItem};
use crate::store::{Collection, LocalStore};

#[derive(Clone, Debug)]
pub struct MutationQueue {
    store: LocalStore,
}

impl MutationQueue {
    pub fn new(store: LocalStore) -> Self {
        Self { store }
    }

    /// Append `item` durably. Items are never merged; two writes to the same
    /// entity are both replayed in order.
    #[instrument(skip_all, fields(action = item.action.as_str(), entity = item.entity.as_str()))]
    pub async fn enqueue(&self, item: &MutationQueueItem) -> Result<()> {
        self.store.put(Collection::MutationQueue, item).await?;
        debug!(id = %item.id, entity_id = ?item.entity_id, "mutation enqueued");
        Ok(())
    }

    /// Pending items oldest first. Equal timestamps keep insertion order.
    pub async fn list_pending(&self) -> Result<Vec<MutationQueueItem>> {
        let mut items: Vec<MutationQueueItem> =
            self.store.get_all(Collection::MutationQueue).await?;
        items.sort_by_key(|item| item.enqueued_at);
        Ok(items)
    }

    /// Rewrite an item in place, keeping its queue position.
    pub async fn update(&self, item: &MutationQueueItem) -> Result<()> {
        self.store.put(Collection::MutationQueue, item).await?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<MutationQueueItem>> {
        self.store.get(Collection::MutationQueue, id).await
    }

    #[instrument(skip_all, fields(id = %id))]
    pub async fn remove(&self, id: &str) -> Result<bool> {
        self.store.delete(Collection::MutationQueue, id).await
    }

    pub async fn count(&self) -> Result<u64> {
        self.store.count(Collection::MutationQueue).await
    }

    /// Pending items targeting one entity instance, oldest first.
    pub async fn pending_for_entity(
        &self,
        entity: EntityKind,
        entity_id: &str,
    ) -> Result<Vec<MutationQueueItem>> {
        let mut items: Vec<MutationQueueItem> = self
            .store
            .get_all_by_index(Collection::MutationQueue, "entityId", &json!(entity_id))
            .await?;
        items.retain(|item| item.entity == entity);
        items.sort_by_key(|item| item.enqueued_at);
        Ok(items)
    }
}
