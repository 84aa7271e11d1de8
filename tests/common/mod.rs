#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use partner_offline::cache::ResponseCache;
use partner_offline::gateway::{EndpointPolicy, RequestGateway};
use partner_offline::remote::{RemoteRequest, RemoteService, TransportError};
use partner_offline::store::LocalStore;
use partner_offline::sync::{SyncManager, SyncOptions};

#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub method: String,
    pub path: String,
    pub body: Option<Value>,
    pub idempotency_key: Option<String>,
}

impl Call {
    pub fn line(&self) -> String {
        format!("{} {}", self.method, self.path)
    }
}

#[derive(Default)]
struct Authority {
    collections: BTreeMap<String, Vec<Value>>,
    by_client_id: HashMap<String, Value>,
    me: Option<Value>,
    next_id: u64,
}

impl Authority {
    fn handle(&mut self, request: &RemoteRequest) -> Result<Value, TransportError> {
        let path = request.path.split('?').next().unwrap_or_default();
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let method = request.method.as_str();
        match (method, segments.as_slice()) {
            ("GET", ["me"]) => Ok(self.me.clone().unwrap_or(Value::Null)),
            ("PATCH", ["me"]) => {
                let mut me = self.me.clone().unwrap_or_else(|| json!({}));
                merge(&mut me, request.body.as_ref());
                self.me = Some(me.clone());
                Ok(me)
            }
            ("GET", ["lookups", rest @ ..]) => Ok(json!({
                "lookup": rest.join("/"),
                "values": ["north", "south"],
            })),
            ("GET", [collection]) => Ok(Value::Array(
                self.collections.get(*collection).cloned().unwrap_or_default(),
            )),
            ("GET", [collection, id]) => self.find(collection, id).cloned().ok_or_else(not_found),
            ("POST", [collection]) => {
                let client_id = request
                    .body
                    .as_ref()
                    .and_then(|b| b.get("clientId"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                if let Some(existing) = client_id.as_ref().and_then(|c| self.by_client_id.get(c)) {
                    return Ok(existing.clone());
                }
                self.next_id += 1;
                let mut created = json!({ "id": format!("srv-{}", self.next_id) });
                merge(&mut created, request.body.as_ref());
                self.collections
                    .entry(collection.to_string())
                    .or_default()
                    .push(created.clone());
                if let Some(client_id) = client_id {
                    self.by_client_id.insert(client_id, created.clone());
                }
                Ok(created)
            }
            ("PATCH" | "PUT", [collection, id]) => {
                let record = self.find_mut(collection, id).ok_or_else(not_found)?;
                merge(record, request.body.as_ref());
                Ok(record.clone())
            }
            ("DELETE", [collection, id]) => {
                let items = self.collections.get_mut(*collection).ok_or_else(not_found)?;
                let before = items.len();
                items.retain(|item| item["id"] != json!(id));
                if items.len() == before {
                    return Err(not_found());
                }
                Ok(Value::Null)
            }
            _ => Err(TransportError::Status {
                code: 405,
                body: format!("{method} {path} not supported"),
            }),
        }
    }

    fn find(&self, collection: &str, id: &str) -> Option<&Value> {
        self.collections
            .get(collection)?
            .iter()
            .find(|item| item["id"] == json!(id))
    }

    fn find_mut(&mut self, collection: &str, id: &str) -> Option<&mut Value> {
        self.collections
            .get_mut(collection)?
            .iter_mut()
            .find(|item| item["id"] == json!(id))
    }
}

fn merge(target: &mut Value, patch: Option<&Value>) {
    if let (Value::Object(target), Some(Value::Object(patch))) = (target, patch) {
        for (key, value) in patch {
            target.insert(key.clone(), value.clone());
        }
    }
}

fn not_found() -> TransportError {
    TransportError::Status {
        code: 404,
        body: "not found".into(),
    }
}

/// In-memory remote authority, idempotent by `clientId`, with scripted
/// failures and a call log.
#[derive(Clone, Default)]
pub struct FakeRemote {
    authority: Arc<Mutex<Authority>>,
    calls: Arc<Mutex<Vec<Call>>>,
    failures: Arc<Mutex<VecDeque<TransportError>>>,
    always_fail: Arc<Mutex<Option<TransportError>>>,
    lost_responses: Arc<Mutex<usize>>,
    unreachable: Arc<Mutex<bool>>,
    disconnect: Arc<Mutex<Option<SyncManager>>>,
}

impl FakeRemote {
    pub async fn seed(&self, collection: &str, value: Value) {
        self.authority
            .lock()
            .await
            .collections
            .entry(collection.to_string())
            .or_default()
            .push(value);
    }

    pub async fn seed_me(&self, value: Value) {
        self.authority.lock().await.me = Some(value);
    }

    pub async fn records(&self, collection: &str) -> Vec<Value> {
        self.authority
            .lock()
            .await
            .collections
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn me(&self) -> Option<Value> {
        self.authority.lock().await.me.clone()
    }

    /// Fail the next calls with these errors, in order.
    pub async fn fail_next(&self, errors: Vec<TransportError>) {
        self.failures.lock().await.extend(errors);
    }

    pub async fn fail_always(&self, error: Option<TransportError>) {
        *self.always_fail.lock().await = error;
    }

    /// Apply the next `n` calls but answer them with a timeout.
    pub async fn lose_responses(&self, n: usize) {
        *self.lost_responses.lock().await = n;
    }

    pub async fn set_reachable(&self, reachable: bool) {
        *self.unreachable.lock().await = !reachable;
    }

    /// Tell `sync` connectivity is gone while the next call is in flight.
    /// The call itself still succeeds.
    pub async fn disconnect_during_next_call(&self, sync: SyncManager) {
        *self.disconnect.lock().await = Some(sync);
    }

    pub async fn calls(&self) -> Vec<Call> {
        self.calls.lock().await.clone()
    }

    pub async fn call_lines(&self) -> Vec<String> {
        self.calls.lock().await.iter().map(Call::line).collect()
    }

    pub async fn clear_calls(&self) {
        self.calls.lock().await.clear();
    }
}

#[async_trait]
impl RemoteService for FakeRemote {
    async fn send(&self, request: RemoteRequest) -> Result<Value, TransportError> {
        self.calls.lock().await.push(Call {
            method: request.method.to_string(),
            path: request.path.clone(),
            body: request.body.clone(),
            idempotency_key: request.idempotency_key.clone(),
        });

        if *self.unreachable.lock().await {
            return Err(TransportError::Network("connection refused".into()));
        }
        if let Some(err) = self.failures.lock().await.pop_front() {
            return Err(err);
        }
        if let Some(err) = self.always_fail.lock().await.clone() {
            return Err(err);
        }

        let result = self.authority.lock().await.handle(&request);
        let disconnect = self.disconnect.lock().await.take();
        if let Some(sync) = disconnect {
            sync.set_online(false).await;
        }
        let mut lost = self.lost_responses.lock().await;
        if *lost > 0 && result.is_ok() {
            *lost -= 1;
            return Err(TransportError::Timeout);
        }
        result
    }

    async fn probe(&self) -> bool {
        !*self.unreachable.lock().await
    }
}

pub fn test_options() -> SyncOptions {
    SyncOptions {
        interval: Duration::from_secs(3600),
        base_backoff: Duration::from_millis(20),
        max_backoff: Duration::from_millis(200),
        max_retries: 3,
        client_errors_to_conflicts: true,
    }
}

pub struct Harness {
    pub store: LocalStore,
    pub cache: ResponseCache,
    pub sync: SyncManager,
    pub gateway: RequestGateway,
    pub remote: FakeRemote,
}

pub async fn harness() -> Harness {
    harness_with(test_options(), Duration::from_secs(300), EndpointPolicy::default()).await
}

pub async fn harness_with(
    options: SyncOptions,
    ttl: Duration,
    policy: EndpointPolicy,
) -> Harness {
    let store = LocalStore::open_in_memory().await.unwrap();
    let cache = ResponseCache::with_ttl(store.clone(), ttl);
    let remote = FakeRemote::default();
    let shared: Arc<dyn RemoteService> = Arc::new(remote.clone());
    let sync = SyncManager::new(store.clone(), cache.clone(), shared.clone(), options)
        .await
        .unwrap();
    let gateway = RequestGateway::new(store.clone(), cache.clone(), sync.clone(), shared, policy);
    Harness {
        store,
        cache,
        sync,
        gateway,
        remote,
    }
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

pub fn object(value: &Value) -> &Map<String, Value> {
    value.as_object().expect("object")
}
