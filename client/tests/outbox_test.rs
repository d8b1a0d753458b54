//! Integration tests for eventual saves and deletes.

use stash_client::{
    Client, ClientConfig, Error, FieldOperation, InMemoryRemote, MemoryStorage, ObjectState,
    OutboxAction, Pointer, Query, SyncEvent, Value, OUTBOX_PIN,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn open_on(storage: &Arc<MemoryStorage>, remote: &Arc<InMemoryRemote>) -> Client {
    init_tracing();
    Client::open(ClientConfig::default(), storage.clone(), remote.clone())
        .await
        .unwrap()
}

fn drain(events: &mut broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

#[cfg(test)]
mod delivery_tests {
    use super::*;

    #[tokio::test]
    async fn test_entries_for_one_object_arrive_in_order() {
        let storage = Arc::new(MemoryStorage::new());
        let remote = Arc::new(InMemoryRemote::new());
        let client = open_on(&storage, &remote).await;

        let obj = client.create("GameScore").unwrap();
        obj.set("score", 1).unwrap();
        let first = client.save_eventually(&obj).await.unwrap();
        obj.set("score", 2).unwrap();
        let second = client.save_eventually(&obj).await.unwrap();
        assert!(first < second);
        assert_eq!(client.outbox().pending_count(), 2);

        let report = client.sync_now().await;
        assert_eq!(report.confirmed, 2);
        assert_eq!(client.outbox().pending_count(), 0);

        let log = remote.save_log();
        assert_eq!(log.len(), 2);
        assert!(log[0].0.id.server_id().is_none());
        assert_eq!(log[1].0.id.server_id(), obj.object_id().as_deref());

        let id = obj.object_id().unwrap();
        assert_eq!(
            remote
                .record("GameScore", &id)
                .and_then(|r| r.get("score").cloned()),
            Some(Value::from(2))
        );
        assert!(!obj.is_dirty());
        // The outbox pin is released once nothing is queued
        assert!(!client.labels(&obj).await.unwrap().contains(OUTBOX_PIN));
    }

    #[tokio::test]
    async fn test_connectivity_failure_retries_in_place() {
        let storage = Arc::new(MemoryStorage::new());
        let remote = Arc::new(InMemoryRemote::new());
        let client = open_on(&storage, &remote).await;
        let mut events = client.subscribe();

        let obj = client.create("GameScore").unwrap();
        obj.set("score", 1).unwrap();
        let seq = client.save_eventually(&obj).await.unwrap();
        remote.push_failure(Error::Connectivity("offline".into()));

        let report = client.sync_now().await;
        assert_eq!(report.retried, 1);
        assert_eq!(report.confirmed, 0);
        assert_eq!(client.outbox().pending_count(), 1);
        assert!(matches!(
            drain(&mut events).as_slice(),
            [SyncEvent::Retrying { seq: s, attempts: 1, .. }] if *s == seq
        ));

        // Backing off: nothing is dispatched until connectivity returns
        assert_eq!(client.sync_now().await.dispatched, 0);

        client.notify_connectivity();
        let report = client.sync_now().await;
        assert_eq!(report.confirmed, 1);
        assert!(obj.is_saved());
        assert!(matches!(
            drain(&mut events).as_slice(),
            [SyncEvent::Confirmed { seq: s, .. }] if *s == seq
        ));
    }

    #[tokio::test]
    async fn test_rejection_skips_entry_and_drops_its_edits() {
        let storage = Arc::new(MemoryStorage::new());
        let remote = Arc::new(InMemoryRemote::new());
        let client = open_on(&storage, &remote).await;
        let mut events = client.subscribe();

        let obj = client.create("GameScore").unwrap();
        obj.set("bad", 1).unwrap();
        let rejected = client.save_eventually(&obj).await.unwrap();
        obj.set("good", 2).unwrap();
        client.save_eventually(&obj).await.unwrap();
        remote.push_failure(Error::ServerRejected("invalid field".into()));

        let report = client.sync_now().await;
        assert_eq!(report.rejected, 1);
        assert_eq!(report.confirmed, 1);

        let id = obj.object_id().unwrap();
        let stored = remote.record("GameScore", &id).unwrap();
        assert!(stored.get("good").is_some());
        assert!(stored.get("bad").is_none());

        assert!(obj.get("bad").is_none());
        assert!(!obj.is_dirty());
        assert!(drain(&mut events).iter().any(|e| matches!(
            e,
            SyncEvent::Rejected { seq, error: Error::ServerRejected(_), .. } if *seq == rejected
        )));
    }

    #[tokio::test]
    async fn test_rejected_edit_does_not_override_later_edit() {
        let storage = Arc::new(MemoryStorage::new());
        let remote = Arc::new(InMemoryRemote::new());
        let client = open_on(&storage, &remote).await;

        let obj = client.create("GameScore").unwrap();
        obj.set("score", 0).unwrap();
        client.save(&obj).await.unwrap();
        client.pin(&obj).await.unwrap();
        let id = obj.object_id().unwrap();

        obj.set("score", 1).unwrap();
        client.save_eventually(&obj).await.unwrap();
        obj.set("score", 2).unwrap();
        client.save_eventually(&obj).await.unwrap();
        remote.push_failure(Error::ServerRejected("score locked".into()));

        let report = client.sync_now().await;
        assert_eq!(report.rejected, 1);
        assert_eq!(report.confirmed, 1);

        assert_eq!(
            remote
                .record("GameScore", &id)
                .and_then(|r| r.get("score").cloned()),
            Some(Value::from(2))
        );
        assert_eq!(obj.get_f64("score"), Some(2.0));
        assert!(!obj.is_dirty());

        let stored = client
            .datastore()
            .get_record(&obj.identity())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.state().get("score"), Some(&Value::from(2)));
        assert!(stored.snapshot.committed.is_none());
    }

    #[tokio::test]
    async fn test_retried_saves_keep_queue_order() {
        let storage = Arc::new(MemoryStorage::new());
        let remote = Arc::new(InMemoryRemote::new());
        let client = open_on(&storage, &remote).await;

        let obj = client.create("GameScore").unwrap();
        for score in 1..=3 {
            obj.set("score", score).unwrap();
            client.save_eventually(&obj).await.unwrap();
        }
        remote.push_failure(Error::Connectivity("offline".into()));

        let report = client.sync_now().await;
        assert_eq!(report.retried, 1);
        assert_eq!(report.confirmed, 0);
        assert_eq!(client.outbox().pending_count(), 3);

        client.notify_connectivity();
        assert_eq!(client.sync_now().await.confirmed, 3);

        let sent: Vec<_> = remote
            .save_log()
            .iter()
            .map(|(_, ops)| ops.get("score").cloned())
            .collect();
        assert_eq!(
            sent,
            (1..=3)
                .map(|score| Some(FieldOperation::Set {
                    value: Value::from(score)
                }))
                .collect::<Vec<_>>()
        );
        assert_eq!(
            remote
                .record("GameScore", &obj.object_id().unwrap())
                .and_then(|r| r.get("score").cloned()),
            Some(Value::from(3))
        );
        assert_eq!(obj.get_f64("score"), Some(3.0));
        assert!(!obj.is_dirty());
    }

    #[tokio::test]
    async fn test_pointer_to_unsaved_object_waits_for_its_save() {
        let storage = Arc::new(MemoryStorage::new());
        let remote = Arc::new(InMemoryRemote::new());
        let client = open_on(&storage, &remote).await;

        let child = client.create("Child").unwrap();
        child.set("name", "leaf").unwrap();
        let parent = client.create("Parent").unwrap();
        parent.set("child", child.pointer()).unwrap();

        client.save_eventually(&parent).await.unwrap();
        assert_eq!(client.outbox().pending_count(), 2);

        let report = client.sync_now().await;
        assert_eq!(report.confirmed, 2);
        assert_eq!(report.rejected, 0);

        let stored = remote
            .record("Parent", &parent.object_id().unwrap())
            .unwrap();
        assert_eq!(
            stored.get("child"),
            Some(&Value::Pointer(Pointer::server(
                "Child",
                child.object_id().unwrap()
            )))
        );
    }

    #[tokio::test]
    async fn test_pointer_to_rejected_object_is_rejected() {
        let storage = Arc::new(MemoryStorage::new());
        let remote = Arc::new(InMemoryRemote::new());
        let client = open_on(&storage, &remote).await;
        let mut events = client.subscribe();

        let child = client.create("Child").unwrap();
        child.set("name", "leaf").unwrap();
        let parent = client.create("Parent").unwrap();
        parent.set("child", child.pointer()).unwrap();
        let parent_seq = client.save_eventually(&parent).await.unwrap();
        assert_eq!(client.outbox().pending_count(), 2);

        // The child's create is dispatched first and refused
        remote.push_failure(Error::ServerRejected("invalid child".into()));
        let report = client.sync_now().await;
        assert_eq!(report.rejected, 2);
        assert_eq!(report.confirmed, 0);
        assert_eq!(client.outbox().pending_count(), 0);
        assert!(!child.is_saved());
        assert!(!parent.is_saved());
        assert!(remote.is_empty());

        assert!(drain(&mut events).iter().any(|e| matches!(
            e,
            SyncEvent::Rejected { seq, error: Error::State(_), .. } if *seq == parent_seq
        )));
        assert!(!client.labels(&parent).await.unwrap().contains(OUTBOX_PIN));
    }

    #[tokio::test]
    async fn test_persistence_failure_keeps_edits() {
        let storage = Arc::new(MemoryStorage::new());
        let remote = Arc::new(InMemoryRemote::new());
        let client = open_on(&storage, &remote).await;

        let obj = client.create("GameScore").unwrap();
        obj.set("score", 3).unwrap();
        storage.set_fail_writes(true);

        assert!(matches!(
            client.save_eventually(&obj).await,
            Err(Error::Io(_))
        ));
        assert_eq!(client.outbox().pending_count(), 0);
        assert!(obj.is_key_dirty("score"));

        storage.set_fail_writes(false);
        client.save_eventually(&obj).await.unwrap();
        assert_eq!(client.sync_now().await.confirmed, 1);
    }

    #[tokio::test]
    async fn test_background_sync_delivers() {
        let storage = Arc::new(MemoryStorage::new());
        let remote = Arc::new(InMemoryRemote::new());
        init_tracing();
        let config = ClientConfig::default().with_sync_interval(Duration::from_millis(20));
        let client = Client::open(config, storage.clone(), remote.clone())
            .await
            .unwrap();
        let mut events = client.subscribe();
        client.start_sync();

        let obj = client.create("GameScore").unwrap();
        obj.set("score", 1).unwrap();
        client.save_eventually(&obj).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, SyncEvent::Confirmed { .. }));
        assert!(obj.is_saved());

        client.close().await;
    }
}

#[cfg(test)]
mod delete_tests {
    use super::*;

    #[tokio::test]
    async fn test_delete_of_unsaved_object_cancels_queued_saves() {
        let storage = Arc::new(MemoryStorage::new());
        let remote = Arc::new(InMemoryRemote::new());
        let client = open_on(&storage, &remote).await;

        let obj = client.create("GameScore").unwrap();
        obj.set("score", 1).unwrap();
        client.save_eventually(&obj).await.unwrap();

        assert_eq!(client.delete_eventually(&obj).await.unwrap(), None);
        assert_eq!(client.outbox().pending_count(), 0);
        assert!(obj.is_deleted());
        assert!(!obj.is_dirty());

        assert_eq!(client.sync_now().await.dispatched, 0);
        assert_eq!(remote.call_count(), 0);
        assert!(matches!(
            client.save_eventually(&obj).await,
            Err(Error::State(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_of_saved_object_reaches_server() {
        let storage = Arc::new(MemoryStorage::new());
        let remote = Arc::new(InMemoryRemote::new());
        remote
            .insert(
                ObjectState::from_fields("GameScore", [("score", 1)])
                    .unwrap()
                    .with_object_id("s1"),
            )
            .unwrap();
        let client = open_on(&storage, &remote).await;

        let obj = client.object("GameScore", "s1").unwrap();
        obj.set("score", 5).unwrap();
        client.save_eventually(&obj).await.unwrap();
        let seq = client.delete_eventually(&obj).await.unwrap();
        assert!(seq.is_some());

        let entries = client.outbox().entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, OutboxAction::Delete);

        client.sync_now().await;
        assert!(remote.save_log().is_empty());
        assert_eq!(remote.delete_log().len(), 1);
        assert!(remote.record("GameScore", "s1").is_none());
        assert!(client
            .datastore()
            .get(&obj.identity())
            .await
            .unwrap()
            .is_none());
    }
}

#[cfg(test)]
mod restart_tests {
    use super::*;

    #[tokio::test]
    async fn test_queued_entries_survive_restart() {
        let storage = Arc::new(MemoryStorage::new());
        let remote = Arc::new(InMemoryRemote::new());
        remote.set_offline(true);
        {
            let client = open_on(&storage, &remote).await;
            let obj = client.create("GameScore").unwrap();
            obj.set("player", "Sean").unwrap();
            client.save_eventually(&obj).await.unwrap();
            obj.set("score", 1337).unwrap();
            client.save_eventually(&obj).await.unwrap();

            assert_eq!(client.sync_now().await.confirmed, 0);
            client.close().await;
        }
        assert_eq!(storage.keys_with_prefix("outbox:").len(), 2);

        remote.set_offline(false);
        let client = open_on(&storage, &remote).await;
        assert_eq!(client.outbox().pending_count(), 2);

        // Queued edits are visible locally before delivery
        let local = client
            .find_from(
                &Query::new("GameScore"),
                &stash_client::Source::LocalDatastore,
            )
            .await
            .unwrap();
        assert_eq!(local.len(), 1);
        assert_eq!(local[0].get_f64("score"), Some(1337.0));

        assert_eq!(client.sync_now().await.confirmed, 2);
        let found = client.find(&Query::new("GameScore")).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].get_str("player").as_deref(), Some("Sean"));
        assert_eq!(found[0].get_f64("score"), Some(1337.0));
        assert!(Arc::ptr_eq(&found[0], &local[0]));
    }

    #[tokio::test]
    async fn test_restart_after_partial_delivery() {
        let storage = Arc::new(MemoryStorage::new());
        let remote = Arc::new(InMemoryRemote::new());
        let id = {
            let client = open_on(&storage, &remote).await;
            let obj = client.create("GameScore").unwrap();
            obj.set("score", 1).unwrap();
            client.save_eventually(&obj).await.unwrap();
            obj.increment("score", 10.0).unwrap();
            client.save_eventually(&obj).await.unwrap();

            // Deliver only the create
            assert_eq!(client.outbox().sync_once().await.confirmed, 1);
            client.close().await;
            obj.object_id().unwrap()
        };

        let client = open_on(&storage, &remote).await;
        assert_eq!(client.outbox().pending_count(), 1);
        assert_eq!(client.sync_now().await.confirmed, 1);
        assert_eq!(
            remote
                .record("GameScore", &id)
                .and_then(|r| r.get("score").cloned()),
            Some(Value::from(11))
        );
        assert_eq!(remote.save_log().len(), 2);
    }
}
