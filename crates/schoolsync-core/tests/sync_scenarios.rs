//! End-to-end sync scenarios against a scripted remote

mod common;

use std::sync::Arc;

use chrono::Duration;
use common::{fast_config, redb_coordinator, ScriptedRemote};
use schoolsync_core::{
    ConflictResolver, ConflictStrategy, OfflineCoordinator, OfflineEvent, Priority, RecordFilter,
    SyncAction, Winner,
};
use serde_json::json;
use tokio::sync::Semaphore;

// ============================================================================
// Offline → online
// ============================================================================

#[tokio::test]
async fn offline_store_then_sync_pushes_decompressed_payload() {
    let remote = ScriptedRemote::new();
    let (coordinator, _dir) = redb_coordinator(fast_config().with_start_online(false), remote.clone());

    let payload = json!({"studentId": "ZM-0042", "present": true, "date": "2024-03-11"});
    let key = coordinator
        .store_offline_data("attendance", payload.clone(), Priority::Normal)
        .await
        .unwrap();
    assert_eq!(remote.call_count(), 0);

    let summary = coordinator.handle_connectivity_change(true).await.unwrap();
    assert_eq!(summary.synced_items, 1);
    assert_eq!(summary.failed_items, 0);
    assert_eq!(summary.total_items, 1);

    let requests = remote.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].action, SyncAction::Store);
    assert_eq!(requests[0].record_key, key);
    assert_eq!(requests[0].payload, Some(payload));

    let record = coordinator.get_record(key.as_str()).await.unwrap().unwrap();
    assert!(record.synced);
    assert!(coordinator.pending_items().unwrap().is_empty());
}

#[tokio::test]
async fn drain_order_is_priority_then_fifo() {
    let remote = ScriptedRemote::new();
    let (coordinator, _dir) = redb_coordinator(fast_config().with_start_online(false), remote.clone());

    let low = coordinator
        .store_offline_data("grades", json!({"score": 40}), Priority::Low)
        .await
        .unwrap();
    let normal_a = coordinator
        .store_offline_data("attendance", json!({"present": true}), Priority::Normal)
        .await
        .unwrap();
    let high = coordinator
        .store_offline_data("student_data", json!({"name": "Mwila"}), Priority::High)
        .await
        .unwrap();
    let normal_b = coordinator
        .store_offline_data("attendance", json!({"present": false}), Priority::Normal)
        .await
        .unwrap();

    coordinator.handle_connectivity_change(true).await.unwrap();

    let order: Vec<_> = remote.requests().into_iter().map(|r| r.record_key).collect();
    assert_eq!(order, vec![high, normal_a, normal_b, low]);
}

#[tokio::test]
async fn drain_emits_progress_events() {
    let remote = ScriptedRemote::new();
    let (coordinator, _dir) = redb_coordinator(fast_config(), remote);
    let mut events = coordinator.subscribe();

    for n in 0..2 {
        coordinator
            .store_offline_data("attendance", json!({"n": n}), Priority::Normal)
            .await
            .unwrap();
    }
    coordinator.synchronize_offline_data().await.unwrap();

    assert_eq!(events.recv().await.unwrap(), OfflineEvent::SyncStarted { pending: 2 });
    assert_eq!(
        events.recv().await.unwrap(),
        OfflineEvent::SyncProgress { processed: 1, total: 2 }
    );
    assert_eq!(
        events.recv().await.unwrap(),
        OfflineEvent::SyncProgress { processed: 2, total: 2 }
    );
    match events.recv().await.unwrap() {
        OfflineEvent::SyncCompleted(summary) => assert_eq!(summary.synced_items, 2),
        other => panic!("expected completion, got {:?}", other),
    }
}

// ============================================================================
// Failure handling
// ============================================================================

#[tokio::test]
async fn item_is_dropped_on_fourth_failure() {
    let remote = ScriptedRemote::new();
    remote.fail_times(10);
    let (coordinator, _dir) = redb_coordinator(fast_config().with_max_retries(3), remote.clone());

    let key = coordinator
        .store_offline_data("grades", json!({"score": 88}), Priority::Normal)
        .await
        .unwrap();

    for attempt in 1..=3 {
        let summary = coordinator.synchronize_offline_data().await.unwrap();
        assert_eq!(summary.retried_items, 1, "attempt {}", attempt);
        assert_eq!(summary.failed_items, 0);
    }

    let summary = coordinator.synchronize_offline_data().await.unwrap();
    assert_eq!(summary.failed_items, 1);
    assert_eq!(remote.call_count(), 4);
    assert!(coordinator.pending_items().unwrap().is_empty());

    let failed = coordinator.failed_items().unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].item.record_key, key);
    assert!(failed[0].reason.contains("link down"));

    // Nothing left to push
    let summary = coordinator.synchronize_offline_data().await.unwrap();
    assert_eq!(summary.total_items, 0);
    assert_eq!(remote.call_count(), 4);

    // The local record survives and can be requeued
    assert!(coordinator.get_record(key.as_str()).await.unwrap().is_some());
    let requeued = coordinator
        .retry_failed_item(&failed[0].item.id)
        .unwrap()
        .unwrap();
    assert_eq!(requeued.retry_count, 0);
    assert!(coordinator.failed_items().unwrap().is_empty());

    let summary = coordinator.synchronize_offline_data().await.unwrap();
    assert_eq!(summary.synced_items, 0);
    assert_eq!(summary.retried_items, 1);
}

#[tokio::test]
async fn concurrent_sync_returns_already_running() {
    let gate = Arc::new(Semaphore::new(0));
    let remote = ScriptedRemote::gated(gate.clone());
    let (coordinator, _dir) = redb_coordinator(fast_config(), remote.clone());
    coordinator
        .store_offline_data("attendance", json!({"present": true}), Priority::Normal)
        .await
        .unwrap();

    let first = coordinator.synchronize_offline_data();
    let second = async {
        tokio::task::yield_now().await;
        assert!(coordinator.is_syncing());
        let summary = coordinator.synchronize_offline_data().await;
        gate.add_permits(1);
        summary
    };
    let (first, second) = futures::join!(first, second);

    let first = first.unwrap();
    let second = second.unwrap();
    assert_eq!(first.synced_items, 1);
    assert!(second.already_running);
    assert_eq!(second.total_items, 0);
    assert_eq!(remote.call_count(), 1);
    assert!(!coordinator.is_syncing());
}

#[tokio::test]
async fn losing_connectivity_stops_the_drain() {
    let gate = Arc::new(Semaphore::new(0));
    let remote = ScriptedRemote::gated(gate.clone());
    let (coordinator, _dir) = redb_coordinator(fast_config(), remote.clone());
    for n in 0..3 {
        coordinator
            .store_offline_data("attendance", json!({"n": n}), Priority::Normal)
            .await
            .unwrap();
    }

    let drain = coordinator.synchronize_offline_data();
    let cut = async {
        tokio::task::yield_now().await;
        coordinator.handle_connectivity_change(false).await;
        gate.add_permits(3);
    };
    let (summary, ()) = futures::join!(drain, cut);
    let summary = summary.unwrap();

    assert!(summary.aborted);
    assert_eq!(summary.synced_items, 1);
    assert_eq!(remote.call_count(), 1);
    assert_eq!(coordinator.pending_items().unwrap().len(), 2);
}

// ============================================================================
// Conflicts
// ============================================================================

#[tokio::test]
async fn newer_remote_copy_wins_timestamp_conflict() {
    let remote = ScriptedRemote::new();
    let (coordinator, _dir) = redb_coordinator(fast_config(), remote.clone());
    let key = coordinator
        .store_offline_data("student_data", json!({"name": "Natasha", "grade": 5}), Priority::Normal)
        .await
        .unwrap();

    let mut theirs = coordinator.get_record(key.as_str()).await.unwrap().unwrap();
    theirs.payload = json!({"name": "Natasha", "grade": 6});
    theirs.version = 3;
    theirs.timestamp = theirs.timestamp + Duration::hours(1);
    remote.conflict_with(theirs);

    let summary = coordinator.synchronize_offline_data().await.unwrap();
    assert_eq!(summary.conflicts, 1);
    assert_eq!(summary.synced_items, 0);

    let stored = coordinator
        .get_offline_data("student_data", &RecordFilter::default())
        .await
        .unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].payload, json!({"name": "Natasha", "grade": 6}));
    assert_eq!(stored[0].version, 3);
    assert!(stored[0].synced);
    assert!(coordinator.pending_items().unwrap().is_empty());
}

#[tokio::test]
async fn user_priority_keeps_local_edit_over_remote() {
    let remote = ScriptedRemote::new();
    let (coordinator, _dir) = redb_coordinator(
        fast_config()
            .with_start_online(false)
            .with_conflict_strategy(ConflictStrategy::UserPriority),
        remote.clone(),
    );
    let key = coordinator
        .store_offline_data("grades", json!({"score": 50}), Priority::Normal)
        .await
        .unwrap();
    for score in [55, 60] {
        coordinator
            .update_offline_data("grades", key.as_str(), json!({"score": score}), None)
            .await
            .unwrap();
    }

    let local = coordinator.get_record(key.as_str()).await.unwrap().unwrap();
    assert_eq!(local.version, 3);
    let mut theirs = local.clone();
    theirs.payload = json!({"score": 20});
    theirs.version = 2;
    theirs.user_initiated = false;
    theirs.timestamp = local.timestamp + Duration::minutes(10);

    let resolution = ConflictResolver::new(ConflictStrategy::UserPriority).resolve(&local, &theirs, None);
    assert_eq!(resolution.winner(), Some(Winner::Local));
    let winner = resolution.record().unwrap();
    assert_eq!(winner.version, 3);
    assert_eq!(winner.payload, json!({"score": 60}));

    // Through the drain the local copy is re-queued above both versions
    remote.conflict_with(theirs);
    let summary = coordinator.handle_connectivity_change(true).await.unwrap();
    assert_eq!(summary.conflicts, 1);

    let stored = coordinator.get_record(key.as_str()).await.unwrap().unwrap();
    assert_eq!(stored.payload, json!({"score": 60}));
    assert_eq!(stored.version, 4);
    assert!(!stored.synced);

    let pending = coordinator.pending_items().unwrap();
    assert_eq!(pending.last().unwrap().record_version, 4);
    assert_eq!(pending.last().unwrap().action, SyncAction::Update);
}

#[tokio::test]
async fn stale_remote_winner_does_not_lower_the_version() {
    let remote = ScriptedRemote::new();
    let (coordinator, _dir) = redb_coordinator(fast_config().with_start_online(false), remote.clone());
    let key = coordinator
        .store_offline_data("grades", json!({"score": 50}), Priority::Normal)
        .await
        .unwrap();
    for score in [55, 60] {
        coordinator
            .update_offline_data("grades", key.as_str(), json!({"score": score}), None)
            .await
            .unwrap();
    }

    let local = coordinator.get_record(key.as_str()).await.unwrap().unwrap();
    assert_eq!(local.version, 3);
    let mut theirs = local.clone();
    theirs.payload = json!({"score": 99});
    theirs.version = 1;
    theirs.timestamp = local.timestamp + Duration::hours(1);
    remote.conflict_with(theirs);

    let summary = coordinator.handle_connectivity_change(true).await.unwrap();
    assert_eq!(summary.conflicts, 1);

    let stored = coordinator.get_record(key.as_str()).await.unwrap().unwrap();
    assert_eq!(stored.payload, json!({"score": 99}));
    assert!(stored.version >= 3);
    assert!(stored.synced);
}

#[tokio::test]
async fn remote_win_discards_queued_local_updates() {
    let remote = ScriptedRemote::new();
    let (coordinator, _dir) = redb_coordinator(fast_config().with_start_online(false), remote.clone());
    let key = coordinator
        .store_offline_data("grades", json!({"score": 50}), Priority::Normal)
        .await
        .unwrap();
    for score in [55, 60] {
        coordinator
            .update_offline_data("grades", key.as_str(), json!({"score": score}), None)
            .await
            .unwrap();
    }
    assert_eq!(coordinator.pending_items().unwrap().len(), 3);

    let local = coordinator.get_record(key.as_str()).await.unwrap().unwrap();
    let mut theirs = local.clone();
    theirs.payload = json!({"score": 99});
    theirs.version = 3;
    theirs.timestamp = local.timestamp + Duration::hours(1);
    remote.conflict_with(theirs);

    coordinator.handle_connectivity_change(true).await.unwrap();

    // Only the first push went out; the superseded updates never did
    let requests = remote.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].action, SyncAction::Store);
    assert!(coordinator.pending_items().unwrap().is_empty());

    let stored = coordinator.get_record(key.as_str()).await.unwrap().unwrap();
    assert_eq!(stored.payload, json!({"score": 99}));
    assert!(stored.synced);

    // A later drain has nothing stale to replay
    let summary = coordinator.synchronize_offline_data().await.unwrap();
    assert_eq!(summary.total_items, 0);
    assert_eq!(remote.call_count(), 1);
}

// ============================================================================
// Deletes
// ============================================================================

#[tokio::test]
async fn deleting_a_never_sent_record_sends_nothing() {
    let remote = ScriptedRemote::new();
    let (coordinator, _dir) = redb_coordinator(fast_config().with_start_online(false), remote.clone());
    let key = coordinator
        .store_offline_data("attendance", json!({"present": true}), Priority::Normal)
        .await
        .unwrap();
    assert!(coordinator
        .delete_offline_data("attendance", key.as_str())
        .await
        .unwrap());

    let summary = coordinator.handle_connectivity_change(true).await.unwrap();
    assert_eq!(summary.total_items, 0);
    assert_eq!(remote.call_count(), 0);
    assert!(coordinator.get_record(key.as_str()).await.unwrap().is_none());
}

#[tokio::test]
async fn delete_is_sent_after_the_record_reached_the_remote() {
    let remote = ScriptedRemote::new();
    let (coordinator, _dir) = redb_coordinator(fast_config(), remote.clone());
    let key = coordinator
        .store_offline_data("grades", json!({"score": 70}), Priority::Low)
        .await
        .unwrap();
    coordinator.synchronize_offline_data().await.unwrap();

    coordinator
        .update_offline_data("grades", key.as_str(), json!({"score": 75}), None)
        .await
        .unwrap();
    coordinator
        .delete_offline_data("grades", key.as_str())
        .await
        .unwrap();
    coordinator.synchronize_offline_data().await.unwrap();

    let actions: Vec<_> = remote.requests().into_iter().map(|r| r.action).collect();
    assert_eq!(actions, vec![SyncAction::Store, SyncAction::Delete]);
    assert!(coordinator.pending_items().unwrap().is_empty());
}

#[tokio::test]
async fn delete_follows_a_failed_store_attempt() {
    let remote = ScriptedRemote::new();
    remote.fail_times(1);
    let (coordinator, _dir) = redb_coordinator(fast_config(), remote.clone());
    let key = coordinator
        .store_offline_data("grades", json!({"score": 70}), Priority::Low)
        .await
        .unwrap();
    let first = coordinator.synchronize_offline_data().await.unwrap();
    assert_eq!(first.retried_items, 1);

    // The failed push may still have landed remotely
    coordinator
        .delete_offline_data("grades", key.as_str())
        .await
        .unwrap();
    coordinator.synchronize_offline_data().await.unwrap();

    let actions: Vec<_> = remote.requests().into_iter().map(|r| r.action).collect();
    assert_eq!(actions, vec![SyncAction::Store, SyncAction::Delete]);
    assert!(coordinator.pending_items().unwrap().is_empty());
}

#[tokio::test]
async fn in_memory_and_redb_coordinators_agree() {
    let remote = ScriptedRemote::new();
    let memory = OfflineCoordinator::in_memory(fast_config(), remote.clone()).unwrap();
    let (disk, _dir) = redb_coordinator(fast_config(), remote);

    for coordinator in [&memory, &disk] {
        let key = coordinator
            .store_offline_data("attendance", json!({"present": true}), Priority::High)
            .await
            .unwrap();
        let summary = coordinator.synchronize_offline_data().await.unwrap();
        assert_eq!(summary.synced_items, 1);
        assert!(coordinator.get_record(key.as_str()).await.unwrap().unwrap().synced);
    }
}
