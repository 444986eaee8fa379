//! Pull-path scenarios: remote changes, conflict resolution and convergence
//! between devices sharing one server.

mod common;

use std::time::Duration;

use common::{foreign_mutation, DeviceBuilder, FakeServer, Mode};
use offsync_core::{now_millis, EntityVersion, Operation};
use offsync_sync::checksum::checksum_value;
use offsync_sync::protocol::{BatchResponse, ItemErrorKind, ServerConflict};
use offsync_sync::{ConflictKind, LocalStore, Settled, SyncEvent, Winner};
use serde_json::{json, Value};

fn local_version(entity_id: &str, value: Value, timestamp: u64) -> EntityVersion {
    EntityVersion {
        entity_id: entity_id.into(),
        checksum: checksum_value(&value),
        value,
        timestamp,
        deleted: false,
        device_id: None,
    }
}

fn resolutions(
    rx: &mut tokio::sync::broadcast::Receiver<SyncEvent>,
) -> Vec<(ConflictKind, Winner, bool)> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let SyncEvent::ConflictResolved {
            kind,
            winner,
            requeued,
            ..
        } = event
        {
            out.push((kind, winner, requeued));
        }
    }
    out
}

#[tokio::test]
async fn concurrent_goal_edits_converge_on_the_more_complete_record() {
    let server = FakeServer::new();
    let a = DeviceBuilder::new("device-a").build(&server);
    let b = DeviceBuilder::new("device-b").build(&server);
    let mut a_events = a.coordinator.subscribe();
    let mut b_events = b.coordinator.subscribe();

    let complete = json!({
        "name": "Emergency fund",
        "target_amount": 5000,
        "current_amount": 100,
        "deadline": "2027-01-01",
        "category": "savings",
    });
    let sparse = json!({"name": "Emergency fund", "current_amount": 150});

    a.coordinator
        .queue_mutation(Operation::Update, "goal", "7", complete.clone())
        .await
        .unwrap();
    b.coordinator
        .queue_mutation(Operation::Update, "goal", "7", sparse)
        .await
        .unwrap();

    // B lands first; A then sees B's edit as a concurrent modification
    b.coordinator.run_full_sync().await;
    let report = a.coordinator.run_full_sync().await;
    assert_eq!(report.conflicts, 1);
    assert_eq!(
        resolutions(&mut a_events),
        vec![(ConflictKind::ConcurrentModification, Winner::Local, true)]
    );
    assert_eq!(a.coordinator.queue().size(), 1);

    // The losing device picks up the winner on its next incremental sync
    let report = b.coordinator.run_incremental_sync().await;
    assert_eq!(report.conflicts, 1);
    assert_eq!(
        resolutions(&mut b_events),
        vec![(ConflictKind::ConcurrentModification, Winner::Remote, false)]
    );
    assert_eq!(
        b.store.get("goal", "7").await.unwrap().unwrap().value,
        complete
    );

    // A pushes its re-queued winner; B sees it as already applied
    a.coordinator.run_full_sync().await;
    assert!(a.coordinator.queue().is_empty());
    let report = b.coordinator.run_incremental_sync().await;
    assert_eq!(report.conflicts, 0);
    assert_eq!(report.applied, 0);

    assert_eq!(server.value("goal", "7"), Some(complete.clone()));
    assert_eq!(
        a.store.get("goal", "7").await.unwrap().unwrap().value,
        complete
    );
    assert_eq!(a.coordinator.stats().conflicts_resolved, 1);
    assert_eq!(b.coordinator.stats().conflicts_resolved, 1);
}

#[tokio::test]
async fn newer_remote_version_applies_without_conflict() {
    let server = FakeServer::new();
    let device = DeviceBuilder::new("phone").build(&server);
    let now = now_millis();
    device
        .store
        .put("note", local_version("n1", json!({"text": "old"}), now - 60_000))
        .await
        .unwrap();

    let settled = device
        .coordinator
        .handle_remote_update(foreign_mutation("tablet", "note", "n1", json!({"text": "new"}), now))
        .await
        .unwrap();

    assert_eq!(settled, Settled::Applied);
    assert_eq!(
        device.store.get("note", "n1").await.unwrap().unwrap().value,
        json!({"text": "new"})
    );
    assert!(device.coordinator.queue().is_empty());
}

#[tokio::test]
async fn unknown_entity_is_created_from_remote() {
    let server = FakeServer::new();
    let device = DeviceBuilder::new("phone").build(&server);

    let settled = device
        .coordinator
        .handle_remote_update(foreign_mutation("tablet", "note", "fresh", json!({"text": "hi"}), 1))
        .await
        .unwrap();

    assert_eq!(settled, Settled::Applied);
    assert!(device.store.get("note", "fresh").await.unwrap().is_some());
}

#[tokio::test]
async fn stale_remote_loses_to_newer_local_and_is_pushed_back() {
    let server = FakeServer::new();
    let device = DeviceBuilder::new("phone").build(&server);
    let mut events = device.coordinator.subscribe();
    let now = now_millis();
    device
        .store
        .put("note", local_version("n1", json!({"text": "mine"}), now))
        .await
        .unwrap();

    let settled = device
        .coordinator
        .handle_remote_update(foreign_mutation(
            "tablet",
            "note",
            "n1",
            json!({"text": "theirs"}),
            now - 60_000,
        ))
        .await
        .unwrap();

    assert_eq!(settled, Settled::Resolved);
    assert_eq!(
        resolutions(&mut events),
        vec![(ConflictKind::StaleOverwrite, Winner::Local, true)]
    );
    assert_eq!(
        device.store.get("note", "n1").await.unwrap().unwrap().value,
        json!({"text": "mine"})
    );
    assert_eq!(device.coordinator.queue().size(), 1);
}

#[tokio::test]
async fn identical_content_is_up_to_date() {
    let server = FakeServer::new();
    let device = DeviceBuilder::new("phone").build(&server);
    let value = json!({"text": "same"});
    let now = now_millis();
    device
        .store
        .put("note", local_version("n1", value.clone(), now))
        .await
        .unwrap();

    let settled = device
        .coordinator
        .handle_remote_update(foreign_mutation("tablet", "note", "n1", value, now + 10))
        .await
        .unwrap();
    assert_eq!(settled, Settled::UpToDate);
}

#[tokio::test]
async fn tampered_payload_is_rejected() {
    let server = FakeServer::new();
    let device = DeviceBuilder::new("phone").build(&server);
    let mut events = device.coordinator.subscribe();

    let mut mutation = foreign_mutation("tablet", "note", "n1", json!({"text": "hi"}), 1);
    mutation.payload[0] ^= 0xff;
    let settled = device.coordinator.handle_remote_update(mutation).await.unwrap();

    assert_eq!(settled, Settled::Rejected);
    assert!(device.store.get("note", "n1").await.unwrap().is_none());
    let rejected = std::iter::from_fn(|| events.try_recv().ok())
        .any(|e| matches!(e, SyncEvent::RemoteRejected { .. }));
    assert!(rejected);
}

#[tokio::test]
async fn own_echo_is_ignored() {
    let server = FakeServer::new();
    let device = DeviceBuilder::new("phone").build(&server);
    let own = device.coordinator.client_info().device_id.clone();

    let settled = device
        .coordinator
        .handle_remote_update(foreign_mutation(&own, "note", "n1", json!({"text": "hi"}), 1))
        .await
        .unwrap();

    assert_eq!(settled, Settled::Echo);
    assert!(device.store.get("note", "n1").await.unwrap().is_none());
}

#[tokio::test]
async fn remote_tombstone_deletes_the_local_copy() {
    let server = FakeServer::new();
    let device = DeviceBuilder::new("phone").build(&server);
    let now = now_millis();
    device
        .store
        .put("note", local_version("n1", json!({"text": "bye"}), now - 60_000))
        .await
        .unwrap();

    let mut mutation = foreign_mutation("tablet", "note", "n1", Value::Null, now);
    mutation.operation = Operation::Delete;
    let settled = device.coordinator.handle_remote_update(mutation).await.unwrap();

    assert_eq!(settled, Settled::Applied);
    assert!(device.store.get("note", "n1").await.unwrap().is_none());
}

#[tokio::test]
async fn server_conflict_in_batch_response_goes_through_resolution() {
    let server = FakeServer::new();
    let device = DeviceBuilder::new("phone").build(&server);

    let id = device
        .coordinator
        .queue_mutation(Operation::Update, "note", "n1", json!({"text": "mine"}))
        .await
        .unwrap();
    // Concurrent and newer on the server side: last write wins picks it
    let remote = foreign_mutation(
        "tablet",
        "note",
        "n1",
        json!({"text": "theirs"}),
        now_millis() + 1_000,
    );
    server.script(BatchResponse {
        conflicts: vec![ServerConflict {
            item_id: id,
            remote,
        }],
        ..BatchResponse::default()
    });

    let report = device.coordinator.run_full_sync().await;

    assert_eq!(report.conflicts, 1);
    assert!(device.coordinator.queue().is_empty());
    assert_eq!(
        device.store.get("note", "n1").await.unwrap().unwrap().value,
        json!({"text": "theirs"})
    );
}

#[tokio::test]
async fn unverifiable_server_conflict_keeps_the_local_edit_queued() {
    let server = FakeServer::new();
    let device = DeviceBuilder::new("phone")
        .settings(|s| s.retry_base_delay = Duration::ZERO)
        .build(&server);
    let mut events = device.coordinator.subscribe();

    let id = device
        .coordinator
        .queue_mutation(Operation::Update, "note", "n1", json!({"text": "mine"}))
        .await
        .unwrap();
    let mut remote = foreign_mutation("tablet", "note", "n1", json!({"text": "theirs"}), now_millis());
    remote.checksum = "deadbeef".into();
    server.script(BatchResponse {
        conflicts: vec![ServerConflict {
            item_id: id.clone(),
            remote,
        }],
        ..BatchResponse::default()
    });

    let report = device.coordinator.run_full_sync().await;
    assert_eq!(report.conflicts, 0);
    assert_eq!(report.retried, 1);
    assert_eq!(device.coordinator.queue().size(), 1);
    assert_eq!(device.coordinator.queue().get(&id).unwrap().attempt, 1);
    assert_eq!(
        device.store.get("note", "n1").await.unwrap().unwrap().value,
        json!({"text": "mine"})
    );

    let mut rejected = false;
    while let Ok(event) = events.try_recv() {
        match event {
            SyncEvent::RemoteRejected { .. } => rejected = true,
            SyncEvent::ItemDropped { .. } => panic!("local edit was dropped"),
            _ => {}
        }
    }
    assert!(rejected);

    // The next round delivers the edit normally
    let report = device.coordinator.run_full_sync().await;
    assert_eq!(report.acknowledged, 1);
    assert!(device.coordinator.queue().is_empty());
    assert_eq!(server.value("note", "n1"), Some(json!({"text": "mine"})));
}

#[tokio::test]
async fn incremental_sync_pushes_only_recent_items() {
    let server = FakeServer::new();
    server.set_mode(Mode::Reject(ItemErrorKind::Validation));
    let device = DeviceBuilder::new("phone")
        .settings(|s| s.retry_base_delay = Duration::ZERO)
        .build(&server);

    let old = device
        .coordinator
        .queue_mutation(Operation::Create, "transaction", "old", json!({"amount": 1}))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    device.coordinator.run_full_sync().await;
    assert!(device.coordinator.last_sync_time() > 0);

    tokio::time::sleep(Duration::from_millis(20)).await;
    server.set_mode(Mode::Accept);
    let recent = device
        .coordinator
        .queue_mutation(Operation::Create, "transaction", "recent", json!({"amount": 2}))
        .await
        .unwrap();

    let report = device.coordinator.run_incremental_sync().await;
    assert_eq!(report.acknowledged, 1);
    assert!(device.coordinator.queue().get(&recent).is_none());
    assert!(device.coordinator.queue().get(&old).is_some());

    let report = device.coordinator.run_full_sync().await;
    assert_eq!(report.acknowledged, 1);
    assert!(device.coordinator.queue().is_empty());
}
