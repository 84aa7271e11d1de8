//! Single entry point for callers. Per request, decides between network,
//! cache and queue, and synthesizes an answer while offline.
//!
//! Reads go to the network when online, are cached when the endpoint is on the
//! cacheable list, and are persisted into the local store. Without
//! connectivity they are reconstructed from the store or the durable cache.
//!
//! Writes go to the network when online. On a connectivity failure (or while
//! offline) writes to queueable entities are applied optimistically to the
//! local store, queued, and answered with `is_offline = true`.

mod route;

pub use route::{Route, Target};

use std::sync::Arc;

use regex::Regex;
use reqwest::Method;
use serde_json::{json, Value};
use tracing::{debug, instrument, warn};

use crate::cache::{RequestSignature, ResponseCache};
use crate::config::{CacheSettings, GatewaySettings};
use crate::error::{Error, Result};
use crate::model::{
    EntityKind, MutationAction, MutationQueueItem, Record, CURRENT_USER_KEY,
};
use crate::queue::MutationQueue;
use crate::remote::{RemoteRequest, RemoteService};
use crate::store::{Collection, LocalStore};
use crate::sync::SyncManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestOptions {
    /// Bypass cache, queue and offline synthesis entirely.
    pub skip_offline_handling: bool,
    /// Fail with `Offline` instead of falling back to cache or queue.
    pub force_online: bool,
    /// Answer from a fresh cache entry before trying the network.
    pub prefer_cache: bool,
    /// Queue a write that failed for lack of connectivity.
    pub persist_if_offline: bool,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            skip_offline_handling: false,
            force_online: false,
            prefer_cache: false,
            persist_if_offline: true,
        }
    }
}

impl RequestOptions {
    pub fn prefer_cache() -> Self {
        Self {
            prefer_cache: true,
            ..Self::default()
        }
    }

    pub fn force_online() -> Self {
        Self {
            force_online: true,
            ..Self::default()
        }
    }

    pub fn passthrough() -> Self {
        Self {
            skip_offline_handling: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GatewayResponse {
    pub data: Value,
    pub from_cache: bool,
    pub is_offline: bool,
}

impl GatewayResponse {
    fn network(data: Value) -> Self {
        Self {
            data,
            from_cache: false,
            is_offline: false,
        }
    }
}

/// Which endpoints may be cached and which entities may be queued.
#[derive(Debug, Clone)]
pub struct EndpointPolicy {
    cacheable: Vec<Regex>,
    queueable: Vec<EntityKind>,
}

impl EndpointPolicy {
    pub fn new(cacheable: &[String], queueable: &[EntityKind]) -> Result<Self> {
        let cacheable = cacheable
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|err| {
                    Error::InvalidRequest(format!("bad cacheable pattern '{pattern}': {err}"))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            cacheable,
            queueable: queueable.to_vec(),
        })
    }

    pub fn from_config(cache: &CacheSettings, gateway: &GatewaySettings) -> Result<Self> {
        Self::new(&cache.cacheable, &gateway.queueable)
    }

    pub fn is_cacheable(&self, path: &str) -> bool {
        self.cacheable.iter().any(|re| re.is_match(path))
    }

    pub fn is_queueable(&self, entity: EntityKind) -> bool {
        self.queueable.contains(&entity)
    }
}

impl Default for EndpointPolicy {
    fn default() -> Self {
        let defaults = CacheSettings::default();
        let cacheable = defaults
            .cacheable
            .iter()
            .filter_map(|pattern| Regex::new(pattern).ok())
            .collect();
        Self {
            cacheable,
            queueable: GatewaySettings::default().queueable,
        }
    }
}

#[derive(Clone)]
pub struct RequestGateway {
    store: LocalStore,
    cache: ResponseCache,
    queue: MutationQueue,
    sync: SyncManager,
    remote: Arc<dyn RemoteService>,
    policy: EndpointPolicy,
}

impl std::fmt::Debug for RequestGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestGateway")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl RequestGateway {
    pub fn new(
        store: LocalStore,
        cache: ResponseCache,
        sync: SyncManager,
        remote: Arc<dyn RemoteService>,
        policy: EndpointPolicy,
    ) -> Self {
        Self {
            queue: sync.queue().clone(),
            store,
            cache,
            sync,
            remote,
            policy,
        }
    }

    pub fn sync(&self) -> &SyncManager {
        &self.sync
    }

    #[instrument(skip_all, fields(method = %method, url = %url))]
    pub async fn execute(
        &self,
        method: Method,
        url: &str,
        body: Option<Value>,
        options: RequestOptions,
    ) -> Result<GatewayResponse> {
        if options.skip_offline_handling {
            let data = self
                .remote
                .send(RemoteRequest::new(method, url, body))
                .await?;
            return Ok(GatewayResponse::network(data));
        }

        let route = Route::parse(url);
        match method {
            Method::GET => self.read(&route, url, options).await,
            Method::POST => {
                self.write(MutationAction::Create, method, &route, url, body, options)
                    .await
            }
            Method::PATCH | Method::PUT => {
                self.write(MutationAction::Update, method, &route, url, body, options)
                    .await
            }
            Method::DELETE => {
                self.write(MutationAction::Delete, method, &route, url, body, options)
                    .await
            }
            other => Err(Error::InvalidRequest(format!(
                "unsupported method {other}"
            ))),
        }
    }

    pub async fn get(&self, url: &str, options: RequestOptions) -> Result<GatewayResponse> {
        self.execute(Method::GET, url, None, options).await
    }

    pub async fn post(&self, url: &str, body: Value, options: RequestOptions) -> Result<GatewayResponse> {
        self.execute(Method::POST, url, Some(body), options).await
    }

    pub async fn patch(&self, url: &str, body: Value, options: RequestOptions) -> Result<GatewayResponse> {
        self.execute(Method::PATCH, url, Some(body), options).await
    }

    pub async fn delete(&self, url: &str, options: RequestOptions) -> Result<GatewayResponse> {
        self.execute(Method::DELETE, url, None, options).await
    }

    async fn read(&self, route: &Route, url: &str, options: RequestOptions) -> Result<GatewayResponse> {
        let signature = RequestSignature::new("GET", url, None);
        let cacheable = self.policy.is_cacheable(&route.path);

        if options.prefer_cache && cacheable {
            if let Some(data) = self.cache.get(&signature).await {
                debug!("served from cache");
                return Ok(GatewayResponse {
                    data,
                    from_cache: true,
                    is_offline: false,
                });
            }
        }

        if self.sync.is_online().await {
            match self.remote.send(RemoteRequest::get(url)).await {
                Ok(data) => {
                    if cacheable {
                        self.cache.put(&signature, url, &data).await?;
                    }
                    self.persist_read(route, &data).await?;
                    return Ok(GatewayResponse::network(data));
                }
                Err(err) if err.is_connectivity() => {
                    warn!(%err, "read failed; falling back to local data");
                }
                Err(err) => return Err(err.into()),
            }
        }

        if options.force_online {
            return Err(Error::Offline(format!("GET {url} requires connectivity")));
        }
        if cacheable {
            if let Some(data) = self.cache.get(&signature).await {
                return Ok(offline_answer(data));
            }
        }
        match self.reconstruct(route, &signature).await? {
            Some(data) => Ok(offline_answer(data)),
            None => Err(Error::Offline(format!("no local data for GET {url}"))),
        }
    }

    async fn write(
        &self,
        action: MutationAction,
        method: Method,
        route: &Route,
        url: &str,
        body: Option<Value>,
        options: RequestOptions,
    ) -> Result<GatewayResponse> {
        let target = self.write_target(action, route).await?;
        let queueable = options.persist_if_offline
            && target
                .as_ref()
                .is_some_and(|t| self.policy.is_queueable(t.entity));

        let behind_pending = match &target {
            Some(target) if queueable => self.has_pending(target).await?,
            _ => false,
        };

        if self.sync.is_online().await && (options.force_online || !behind_pending) {
            let request = RemoteRequest::new(method, url, body.clone());
            match self.remote.send(request).await {
                Ok(data) => {
                    if let Some(target) = &target {
                        self.reflect_online_write(action, target, &data).await?;
                    }
                    return Ok(GatewayResponse::network(data));
                }
                Err(err) if err.is_connectivity() && options.force_online => {
                    return Err(Error::Offline(err.to_string()));
                }
                Err(err) if err.is_connectivity() && queueable => {
                    warn!(%err, "write failed; queueing for later");
                }
                Err(err) => return Err(err.into()),
            }
        } else if options.force_online {
            return Err(Error::Offline(format!(
                "{} {url} requires connectivity",
                action.as_str()
            )));
        }

        match target {
            Some(target) if queueable => {
                let payload = body.unwrap_or(Value::Null);
                self.queue_write(action, target, payload).await
            }
            _ => Err(Error::Offline(format!(
                "{} {url} cannot be queued",
                action.as_str()
            ))),
        }
    }

    /// Resolve what a write applies to; `None` when the URL does not address a
    /// known entity in a way this action understands.
    async fn write_target(&self, action: MutationAction, route: &Route) -> Result<Option<WriteTarget>> {
        let target = match (&route.target, action) {
            (Target::Collection(entity), MutationAction::Create) => Some(WriteTarget {
                entity: *entity,
                entity_id: None,
                record: None,
                current_user: false,
            }),
            (Target::Resource(entity, id), MutationAction::Update | MutationAction::Delete) => {
                let record = self.find_local(*entity, id).await?;
                Some(WriteTarget {
                    entity: *entity,
                    entity_id: Some(record.as_ref().map_or_else(|| id.clone(), |r| r.id.clone())),
                    record,
                    current_user: false,
                })
            }
            (Target::CurrentUser, MutationAction::Update | MutationAction::Delete) => {
                Some(WriteTarget {
                    entity: EntityKind::User,
                    entity_id: None,
                    record: None,
                    current_user: true,
                })
            }
            _ => None,
        };
        Ok(target)
    }

    async fn has_pending(&self, target: &WriteTarget) -> Result<bool> {
        match &target.entity_id {
            Some(id) => Ok(!self
                .queue
                .pending_for_entity(target.entity, id)
                .await?
                .is_empty()
                || self.sync.has_conflicted_create(target.entity, id).await),
            None if target.current_user => Ok(self
                .queue
                .list_pending()
                .await?
                .iter()
                .any(|item| item.entity == EntityKind::User && item.entity_id.is_none())),
            None => Ok(false),
        }
    }

    /// Apply a write locally, queue it, and answer optimistically.
    #[instrument(skip_all, fields(action = action.as_str(), entity = target.entity.as_str()))]
    async fn queue_write(
        &self,
        action: MutationAction,
        target: WriteTarget,
        payload: Value,
    ) -> Result<GatewayResponse> {
        let collection = target.entity.local_collection();
        let (entity_id, data) = match (action, collection) {
            (MutationAction::Create, Some(collection)) => {
                let record = Record::local(&payload);
                self.store.put(collection, &record).await?;
                (Some(record.id.clone()), record.to_value())
            }
            (MutationAction::Update, Some(collection)) => match target.record {
                Some(mut record) => {
                    record.merge_fields(&payload);
                    record.synced = false;
                    self.store.put(collection, &record).await?;
                    (Some(record.id.clone()), record.to_value())
                }
                None => (target.entity_id.clone(), with_id(&payload, target.entity_id.as_deref())),
            },
            (MutationAction::Delete, Some(collection)) => {
                if let Some(mut record) = target.record {
                    record.pending_delete = true;
                    record.synced = false;
                    self.store.put(collection, &record).await?;
                }
                let id = target.entity_id.clone();
                (id.clone(), json!({ "id": id, "deleted": true }))
            }
            (MutationAction::Delete, None) => {
                if target.current_user {
                    self.store.delete_metadata(CURRENT_USER_KEY).await?;
                }
                (target.entity_id.clone(), json!({ "id": target.entity_id, "deleted": true }))
            }
            (MutationAction::Update, None) if target.current_user => {
                (None, self.merge_current_user(&payload).await?)
            }
            (MutationAction::Create | MutationAction::Update, None) => {
                (target.entity_id.clone(), with_id(&payload, target.entity_id.as_deref()))
            }
        };

        // Cached reads no longer reflect the optimistic local state.
        self.cache
            .invalidate_path(&collection_path(target.entity))
            .await?;
        if target.current_user {
            self.cache.invalidate_path("/me").await?;
        }

        let item = MutationQueueItem::new(action, target.entity, entity_id, payload);
        self.queue.enqueue(&item).await?;
        self.sync.notify_enqueued();
        debug!(id = %item.id, "write queued");
        Ok(queued_answer(data))
    }

    async fn merge_current_user(&self, payload: &Value) -> Result<Value> {
        let mut user = match self.store.get_metadata::<Value>(CURRENT_USER_KEY).await? {
            Some(Value::Object(map)) => map,
            _ => Default::default(),
        };
        if let Value::Object(fields) = payload {
            for (key, value) in fields {
                user.insert(key.clone(), value.clone());
            }
        }
        let user = Value::Object(user);
        self.store.set_metadata(CURRENT_USER_KEY, &user).await?;
        Ok(user)
    }

    async fn reflect_online_write(
        &self,
        action: MutationAction,
        target: &WriteTarget,
        data: &Value,
    ) -> Result<()> {
        self.cache
            .invalidate_path(&collection_path(target.entity))
            .await?;
        match (action, target.entity.local_collection()) {
            (MutationAction::Delete, Some(collection)) => {
                if let Some(record) = &target.record {
                    self.store.delete(collection, &record.id).await?;
                }
            }
            (_, Some(collection)) => {
                self.upsert_remote(collection, data).await?;
            }
            // Writes to other users never touch the signed-in user's document.
            (_, None) if !target.current_user => {}
            (MutationAction::Delete, None) => {
                self.cache.invalidate_path("/me").await?;
                self.store.delete_metadata(CURRENT_USER_KEY).await?;
            }
            (_, None) => {
                self.cache.invalidate_path("/me").await?;
                if data.is_object() {
                    self.store.set_metadata(CURRENT_USER_KEY, data).await?;
                }
            }
        }
        Ok(())
    }

    /// Persist a successful read so it survives going offline.
    async fn persist_read(&self, route: &Route, data: &Value) -> Result<()> {
        match &route.target {
            Target::Collection(entity) => {
                let (Some(collection), Value::Array(items)) = (entity.local_collection(), data) else {
                    return Ok(());
                };
                for item in items {
                    self.upsert_remote(collection, item).await?;
                }
            }
            Target::Resource(entity, _) => {
                if let Some(collection) = entity.local_collection() {
                    self.upsert_remote(collection, data).await?;
                }
            }
            Target::CurrentUser => {
                let pending_user = self
                    .queue
                    .list_pending()
                    .await?
                    .iter()
                    .any(|item| item.entity == EntityKind::User);
                if data.is_object() && !pending_user {
                    self.store.set_metadata(CURRENT_USER_KEY, data).await?;
                }
            }
            Target::Other => {}
        }
        Ok(())
    }

    /// Store a record received from the authority without clobbering local
    /// changes that have not synced yet.
    async fn upsert_remote(&self, collection: Collection, value: &Value) -> Result<()> {
        let Some(remote) = Record::from_remote(value) else {
            return Ok(());
        };
        let existing = self.find_local_in(collection, remote.remote_id()).await?;
        match existing {
            Some(local) if !local.synced || local.pending_delete => {
                debug!(id = %local.id, "keeping unsynced local record");
            }
            Some(mut local) => {
                local.mark_synced(remote.server_id.clone(), Some(value));
                self.store.put(collection, &local).await?;
            }
            None => {
                self.store.put(collection, &remote).await?;
            }
        }
        Ok(())
    }

    async fn find_local(&self, entity: EntityKind, id: &str) -> Result<Option<Record>> {
        match entity.local_collection() {
            Some(collection) => self.find_local_in(collection, id).await,
            None => Ok(None),
        }
    }

    /// Look a record up by local id, then by server id.
    async fn find_local_in(&self, collection: Collection, id: &str) -> Result<Option<Record>> {
        if let Some(record) = self.store.get::<Record>(collection, id).await? {
            return Ok(Some(record));
        }
        let mut matches: Vec<Record> = self
            .store
            .get_all_by_index(collection, "serverId", &json!(id))
            .await?;
        Ok(if matches.is_empty() {
            None
        } else {
            Some(matches.remove(0))
        })
    }

    /// Best-effort answer for a read from local data alone.
    async fn reconstruct(&self, route: &Route, signature: &RequestSignature) -> Result<Option<Value>> {
        match &route.target {
            Target::Collection(entity) => {
                if let Some(collection) = entity.local_collection() {
                    let records: Vec<Record> = self.store.get_all(collection).await?;
                    let visible = records
                        .iter()
                        .filter(|r| !r.pending_delete)
                        .map(Record::to_value)
                        .collect();
                    return Ok(Some(Value::Array(visible)));
                }
            }
            Target::Resource(entity, id) => {
                if let Some(record) = self.find_local(*entity, id).await? {
                    if record.pending_delete {
                        return Ok(None);
                    }
                    return Ok(Some(record.to_value()));
                }
            }
            Target::CurrentUser => {
                if let Some(user) = self.store.get_metadata::<Value>(CURRENT_USER_KEY).await? {
                    return Ok(Some(user));
                }
            }
            Target::Other => {}
        }
        self.cache.get_durable(signature).await
    }
}

/// What a write applies to.
#[derive(Debug, Clone)]
struct WriteTarget {
    entity: EntityKind,
    /// Local id the mutation is queued under; `None` for creates and `/me`.
    entity_id: Option<String>,
    /// Local copy of the addressed record, if any.
    record: Option<Record>,
    /// The write addresses `/me`.
    current_user: bool,
}

fn collection_path(entity: EntityKind) -> String {
    format!("/{}", entity.remote_collection())
}

fn with_id(payload: &Value, id: Option<&str>) -> Value {
    match (payload, id) {
        (Value::Object(map), Some(id)) => {
            let mut map = map.clone();
            map.insert("id".into(), json!(id));
            Value::Object(map)
        }
        _ => payload.clone(),
    }
}

fn offline_answer(data: Value) -> GatewayResponse {
    GatewayResponse {
        data,
        from_cache: true,
        is_offline: true,
    }
}

fn queued_answer(data: Value) -> GatewayResponse {
    GatewayResponse {
        data,
        from_cache: false,
        is_offline: true,
    }
}
