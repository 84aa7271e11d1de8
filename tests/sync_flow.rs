mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use common::{eventually, harness, harness_with, test_options, Harness};
use partner_offline::gateway::{EndpointPolicy, RequestOptions};
use partner_offline::model::{EntityKind, MutationAction, MutationQueueItem, Record};
use partner_offline::remote::{RemoteService, TransportError};
use partner_offline::store::Collection;
use partner_offline::sync::{SyncEvent, SyncManager, SyncState, LAST_SYNC_ERROR_KEY};

/// Create a referral while offline and return its local id.
async fn offline_referral(h: &Harness, name: &str) -> String {
    h.sync.set_online(false).await;
    let resp = h
        .gateway
        .post(
            "/referrals",
            json!({ "businessName": name }),
            RequestOptions::default(),
        )
        .await
        .unwrap();
    assert!(resp.is_offline);
    resp.data["id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn queued_writes_reach_the_authority_in_order() {
    let h = harness().await;
    let id = offline_referral(&h, "Acme").await;
    let url = format!("/referrals/{id}");
    for status in ["contacted", "won"] {
        h.gateway
            .patch(&url, json!({ "status": status }), RequestOptions::default())
            .await
            .unwrap();
    }
    assert_eq!(h.sync.queue().count().await.unwrap(), 3);

    h.sync.set_online(true).await;
    h.remote.fail_next(vec![TransportError::Timeout]).await;

    let first = h.sync.sync_now().await.unwrap();
    assert_eq!(first.attempted, 1);
    assert_eq!(first.failed, 1);
    assert_eq!(first.skipped, 2);
    assert_eq!(h.sync.queue().count().await.unwrap(), 3);

    let second = h.sync.sync_now().await.unwrap();
    assert_eq!(second.succeeded, 3);
    assert_eq!(
        h.remote.call_lines().await,
        vec![
            "POST /referrals",
            "POST /referrals",
            "PATCH /referrals/srv-1",
            "PATCH /referrals/srv-1",
        ]
    );

    let server = h.remote.records("referrals").await;
    assert_eq!(server.len(), 1);
    assert_eq!(server[0]["status"], "won");

    let local: Record = h.store.get(Collection::Records, &id).await.unwrap().unwrap();
    assert!(local.synced);
    assert_eq!(local.server_id.as_deref(), Some("srv-1"));
    assert_eq!(local.fields["status"], "won");
    assert_eq!(h.sync.status().await.unwrap().state, SyncState::Idle);
}

#[tokio::test]
async fn lost_create_response_does_not_duplicate() {
    let h = harness().await;
    let id = offline_referral(&h, "Initech").await;
    h.sync.set_online(true).await;
    h.remote.lose_responses(1).await;

    let first = h.sync.sync_now().await.unwrap();
    assert_eq!(first.failed, 1);
    let second = h.sync.sync_now().await.unwrap();
    assert_eq!(second.succeeded, 1);

    assert_eq!(h.remote.records("referrals").await.len(), 1);
    let calls = h.remote.calls().await;
    assert_eq!(calls.len(), 2);
    for call in &calls {
        assert_eq!(call.idempotency_key.as_deref(), Some(id.as_str()));
        assert_eq!(call.body.as_ref().unwrap()["clientId"], json!(id));
    }

    let local: Record = h.store.get(Collection::Records, &id).await.unwrap().unwrap();
    assert_eq!(local.server_id.as_deref(), Some("srv-1"));
    assert!(!local.local_only);
}

#[tokio::test]
async fn retries_are_bounded_then_conflicted() {
    let h = harness().await;
    offline_referral(&h, "Hooli").await;
    h.sync.set_online(true).await;
    h.remote
        .fail_always(Some(TransportError::Network("connection reset".into())))
        .await;
    let mut events = h.sync.subscribe();

    for attempt in 1..=2u32 {
        let report = h.sync.sync_now().await.unwrap();
        assert_eq!(report.conflicts, 0);
        let pending = h.sync.queue().list_pending().await.unwrap();
        assert_eq!(pending[0].retry_count, attempt);
    }
    let last = h.sync.sync_now().await.unwrap();
    assert_eq!(last.conflicts, 1);
    assert_eq!(last.retry_in, None);

    assert_eq!(h.remote.calls().await.len(), 3);
    assert_eq!(h.sync.queue().count().await.unwrap(), 0);
    let conflicts = h.sync.conflicts().await;
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].item.retry_count, 3);
    assert!(conflicts[0]
        .item
        .last_error
        .as_deref()
        .unwrap()
        .contains("connection reset"));

    let mut raised = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, SyncEvent::ConflictRaised(_)) {
            raised += 1;
        }
    }
    assert_eq!(raised, 1);

    // Nothing left to send.
    h.sync.sync_now().await.unwrap();
    assert_eq!(h.remote.calls().await.len(), 3);
}

#[tokio::test]
async fn backoff_doubles_and_resets_after_success() {
    let mut options = test_options();
    options.max_retries = 10;
    let h = harness_with(options, Duration::from_secs(300), EndpointPolicy::default()).await;
    offline_referral(&h, "Umbrella").await;
    h.sync.set_online(true).await;
    h.remote.fail_always(Some(TransportError::Timeout)).await;

    let mut delays = Vec::new();
    for _ in 0..3 {
        delays.push(h.sync.sync_now().await.unwrap().retry_in.unwrap());
    }
    assert_eq!(
        delays,
        vec![
            Duration::from_millis(20),
            Duration::from_millis(40),
            Duration::from_millis(80),
        ]
    );
    let status = h.sync.status().await.unwrap();
    assert_eq!(status.state, SyncState::WaitingToRetry);
    assert_eq!(status.backoff, Duration::from_millis(160));

    h.remote.fail_always(None).await;
    let report = h.sync.sync_now().await.unwrap();
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.retry_in, None);

    let status = h.sync.status().await.unwrap();
    assert_eq!(status.state, SyncState::Idle);
    assert_eq!(status.backoff, Duration::from_millis(20));
    assert_eq!(status.last_error, None);
    assert!(status.last_sync_at.is_some());
}

#[tokio::test]
async fn backoff_never_exceeds_max() {
    let mut options = test_options();
    options.max_retries = 20;
    let h = harness_with(options, Duration::from_secs(300), EndpointPolicy::default()).await;
    offline_referral(&h, "Stark").await;
    h.sync.set_online(true).await;
    h.remote.fail_always(Some(TransportError::Timeout)).await;

    for _ in 0..8 {
        let delay = h.sync.sync_now().await.unwrap().retry_in.unwrap();
        assert!(delay <= Duration::from_millis(200));
    }
    assert_eq!(
        h.sync.status().await.unwrap().backoff,
        Duration::from_millis(200)
    );
}

#[tokio::test]
async fn last_error_survives_a_restart() {
    let h = harness().await;
    offline_referral(&h, "Wayne").await;
    h.sync.set_online(true).await;
    h.remote.fail_next(vec![TransportError::Timeout]).await;
    h.sync.sync_now().await.unwrap();

    let persisted: Option<String> = h.store.get_metadata(LAST_SYNC_ERROR_KEY).await.unwrap();
    assert!(persisted.unwrap().contains("timed out"));

    let remote: Arc<dyn RemoteService> = Arc::new(h.remote.clone());
    let restarted = SyncManager::new(h.store.clone(), h.cache.clone(), remote, test_options())
        .await
        .unwrap();
    let status = restarted.status().await.unwrap();
    assert!(status.last_error.unwrap().contains("timed out"));
    assert!(status.last_sync_at.is_some());
    assert_eq!(status.pending_count, 1);
}

#[tokio::test]
async fn storage_fault_aborts_the_pass() {
    let h = harness().await;
    let mut events = h.sync.subscribe();
    h.store.close().await;

    let err = h.sync.sync_now().await.unwrap_err();
    assert!(err.is_storage_fault());
    assert!(h.remote.calls().await.is_empty());

    let mut saw_error = false;
    while let Ok(event) = events.try_recv() {
        saw_error |= matches!(event, SyncEvent::SyncError { .. });
    }
    assert!(saw_error);
}

#[tokio::test]
async fn idle_scheduler_makes_no_calls() {
    let mut options = test_options();
    options.interval = Duration::from_millis(25);
    let h = harness_with(options, Duration::from_secs(300), EndpointPolicy::default()).await;
    let mut events = h.sync.subscribe();

    h.sync.start().await;
    tokio::time::sleep(Duration::from_millis(150)).await;
    h.sync.close().await;

    assert!(h.remote.calls().await.is_empty());
    assert_eq!(h.sync.status().await.unwrap().state, SyncState::Idle);
    while let Ok(event) = events.try_recv() {
        assert!(
            !matches!(event, SyncEvent::PassCompleted(_)),
            "unexpected {event:?}"
        );
    }
}

#[tokio::test]
async fn scheduler_drains_queue_when_connectivity_returns() {
    let h = harness().await;
    offline_referral(&h, "Cyberdyne").await;
    h.sync.start().await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(h.remote.calls().await.is_empty());

    h.sync.set_online(true).await;
    let queue = h.sync.queue().clone();
    assert!(eventually(|| async { queue.count().await.unwrap() == 0 }).await);
    assert_eq!(h.remote.records("referrals").await.len(), 1);
    h.sync.close().await;
}

#[tokio::test]
async fn scheduler_retries_after_backoff() {
    let h = harness().await;
    h.sync.start().await;
    h.remote
        .fail_next(vec![
            TransportError::Network("refused".into()),
            TransportError::Network("refused".into()),
        ])
        .await;

    // The online write fails, is queued, and the enqueue trigger's pass fails
    // too; the retry timer finishes the job.
    let resp = h
        .gateway
        .post(
            "/referrals",
            json!({ "businessName": "Tyrell" }),
            RequestOptions::default(),
        )
        .await
        .unwrap();
    assert!(resp.is_offline);

    let queue = h.sync.queue().clone();
    assert!(eventually(|| async { queue.count().await.unwrap() == 0 }).await);
    assert_eq!(h.remote.calls().await.len(), 3);
    assert_eq!(h.remote.records("referrals").await.len(), 1);
    h.sync.close().await;
}

#[tokio::test]
async fn closed_scheduler_ignores_triggers() {
    let h = harness().await;
    offline_referral(&h, "Soylent").await;
    h.sync.start().await;
    h.sync.close().await;

    h.sync.set_online(true).await;
    h.sync.request_sync();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.remote.calls().await.is_empty());
    assert_eq!(h.sync.queue().count().await.unwrap(), 1);
}

#[tokio::test]
async fn retried_conflict_syncs_with_new_payload() {
    let h = harness().await;
    let id = offline_referral(&h, "Oscorp").await;
    h.sync.set_online(true).await;
    h.remote
        .fail_next(vec![TransportError::Status {
            code: 422,
            body: "businessName taken".into(),
        }])
        .await;

    let report = h.sync.sync_now().await.unwrap();
    assert_eq!(report.conflicts, 1);
    let conflict = h.sync.conflicts().await.remove(0);
    assert_eq!(conflict.item.entity_id.as_deref(), Some(id.as_str()));

    h.sync
        .replace_conflict(&conflict.item.id, json!({ "businessName": "Oscorp Ltd" }))
        .await
        .unwrap();
    let report = h.sync.sync_now().await.unwrap();
    assert_eq!(report.succeeded, 1);
    assert_eq!(
        h.remote.records("referrals").await[0]["businessName"],
        "Oscorp Ltd"
    );
}

fn status_update(entity_id: &str, status: &str) -> MutationQueueItem {
    MutationQueueItem::new(
        MutationAction::Update,
        EntityKind::Referral,
        Some(entity_id.into()),
        json!({ "status": status }),
    )
}

#[tokio::test]
async fn scheduler_honours_backoff_armed_by_a_direct_pass() {
    let h = harness().await;
    h.remote.seed("referrals", json!({ "id": "r1", "status": "new" })).await;
    h.sync.start().await;

    // Enqueued behind the scheduler's back, so only the retry timer can drain it.
    h.sync.queue().enqueue(&status_update("r1", "won")).await.unwrap();
    h.remote.fail_next(vec![TransportError::Timeout]).await;

    let report = h.sync.sync_now().await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.retry_in, Some(Duration::from_millis(20)));

    let queue = h.sync.queue().clone();
    assert!(eventually(|| async { queue.count().await.unwrap() == 0 }).await);
    assert_eq!(h.remote.calls().await.len(), 2);
    assert_eq!(h.remote.records("referrals").await[0]["status"], "won");
    let sync = h.sync.clone();
    assert!(eventually(|| async { sync.status().await.unwrap().state == SyncState::Idle }).await);
    h.sync.close().await;
}

#[tokio::test]
async fn foregrounding_drains_the_queue() {
    let h = harness().await;
    h.remote.seed("referrals", json!({ "id": "r1", "status": "new" })).await;
    h.sync.start().await;
    h.sync.queue().enqueue(&status_update("r1", "contacted")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(h.remote.calls().await.is_empty());

    h.sync.app_foregrounded();
    let queue = h.sync.queue().clone();
    assert!(eventually(|| async { queue.count().await.unwrap() == 0 }).await);
    assert_eq!(h.remote.call_lines().await, vec!["PATCH /referrals/r1"]);
    h.sync.close().await;
}

#[tokio::test]
async fn losing_connectivity_mid_pass_stops_dispatch() {
    let h = harness().await;
    offline_referral(&h, "Initech").await;
    offline_referral(&h, "Hooli").await;
    h.sync.set_online(true).await;
    h.remote.disconnect_during_next_call(h.sync.clone()).await;

    let report = h.sync.sync_now().await.unwrap();
    assert!(report.interrupted);
    assert_eq!(report.attempted, 1);
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.retry_in, None);
    assert_eq!(h.remote.call_lines().await, vec!["POST /referrals"]);

    let status = h.sync.status().await.unwrap();
    assert!(!status.online);
    assert_eq!(status.state, SyncState::Idle);
    assert_eq!(status.pending_count, 1);
}

#[tokio::test]
async fn conflicted_create_holds_later_writes_for_the_record() {
    let h = harness().await;
    let id = offline_referral(&h, "Massive Dynamic").await;
    let url = format!("/referrals/{id}");
    h.gateway
        .patch(&url, json!({ "status": "contacted" }), RequestOptions::default())
        .await
        .unwrap();
    h.sync.set_online(true).await;
    h.remote
        .fail_next(vec![TransportError::Status {
            code: 422,
            body: "missing contact".into(),
        }])
        .await;

    let report = h.sync.sync_now().await.unwrap();
    assert_eq!(report.conflicts, 1);
    assert_eq!(report.held, 1);
    assert_eq!(report.retry_in, None);
    assert_eq!(h.remote.call_lines().await, vec!["POST /referrals"]);
    assert_eq!(h.sync.status().await.unwrap().state, SyncState::Idle);

    let report = h.sync.sync_now().await.unwrap();
    assert_eq!(report.held, 1);
    assert_eq!(report.attempted, 0);
    assert_eq!(h.remote.calls().await.len(), 1);

    // Online writes for the record queue up behind the conflict too.
    let resp = h
        .gateway
        .patch(&url, json!({ "status": "won" }), RequestOptions::default())
        .await
        .unwrap();
    assert!(resp.is_offline);
    assert_eq!(h.sync.queue().count().await.unwrap(), 2);
    assert_eq!(h.remote.calls().await.len(), 1);

    let conflict = h.sync.conflicts().await.remove(0);
    h.sync.retry_conflict(&conflict.item.id).await.unwrap();
    let report = h.sync.sync_now().await.unwrap();
    assert_eq!(report.succeeded, 3);
    assert_eq!(
        h.remote.call_lines().await,
        vec![
            "POST /referrals",
            "POST /referrals",
            "PATCH /referrals/srv-1",
            "PATCH /referrals/srv-1",
        ]
    );
    assert_eq!(h.remote.records("referrals").await[0]["status"], "won");
    assert!(h.sync.conflicts().await.is_empty());
}
