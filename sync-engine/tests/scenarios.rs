//! End-to-end sync scenarios with running queue workers.

use crm_sync_engine::config::{CleanupConfig, Config, QueueConfig};
use crm_sync_engine::store::LogFilter;
use crm_sync_engine::{ErrorKind, InboundEvent, Page, PollTarget, SyncEngine, SyncNotification};
use std::sync::Arc;
use std::time::Duration;
use sync_client::{MockRemote, RemoteError};
use sync_types::{
    now_millis, Company, Contact, Direction, Entity, EntityData, EntityId, EntityType,
    FieldChoice, FieldChoices, Fields, LogStatus, RemoteId, RemoteRecord, ResolutionType,
    SyncAction, SyncLog, SyncStatus,
};

struct Harness {
    engine: Arc<SyncEngine>,
    remote: MockRemote,
}

impl Harness {
    async fn start() -> Self {
        let mut config = Config {
            queues: QueueConfig {
                attempts: 1,
                ..QueueConfig::default()
            },
            cleanup: CleanupConfig {
                enabled: false,
                ..CleanupConfig::default()
            },
            ..Config::default()
        };
        config.storage.database = ":memory:".into();
        let store = SyncEngine::open_store(&config.storage).await.unwrap();

        let remote = MockRemote::new();
        let engine = Arc::new(SyncEngine::new(config, store, Arc::new(remote.clone())).unwrap());
        engine.start();
        Self { engine, remote }
    }

    async fn settle(&self) {
        tokio::time::timeout(
            Duration::from_secs(5),
            self.engine.wait_idle(Duration::from_millis(5)),
        )
        .await
        .expect("queues did not drain");
    }

    async fn entity(&self, id: EntityId) -> Entity {
        self.engine.get_entity(id).await.unwrap()
    }

    async fn logs(&self) -> Vec<SyncLog> {
        self.engine
            .list_logs(&LogFilter::default(), Page::new(1, 100))
            .await
            .unwrap()
            .items
    }
}

fn ada() -> EntityData {
    EntityData::Contact(Contact::new("ada@example.com").with_name("Ada", "Lovelace"))
}

fn first_name(data: &EntityData) -> Option<&str> {
    match data {
        EntityData::Contact(c) => c.first_name.as_deref(),
        EntityData::Company(_) => None,
    }
}

fn rename(name: &str) -> Fields {
    let mut edits = Fields::new();
    edits.insert("first_name".into(), name.into());
    edits
}

/// Creates a contact locally and waits for the first push. Returns its id
/// and the time of that sync.
async fn synced_ada(h: &Harness) -> (EntityId, i64) {
    let created = h.engine.create_local(ada()).await.unwrap();
    h.settle().await;
    let entity = h.entity(created.id).await;
    assert_eq!(entity.envelope.sync_status, SyncStatus::Synced);
    (created.id, entity.envelope.last_synced_at.unwrap())
}

/// Local and remote both change `first_name` after the last sync.
async fn diverge(h: &Harness, id: EntityId, synced_at: i64) {
    let remote_id = h.entity(id).await.remote_id.unwrap();
    assert!(h.remote.edit_remote(&remote_id, synced_at + 20, |data| {
        if let EntityData::Contact(c) = data {
            c.first_name = Some("Remote".into());
        }
    }));
    tokio::time::sleep(Duration::from_millis(5)).await;
    h.engine.update_local(id, &rename("Local")).await.unwrap();
    h.settle().await;
}

#[tokio::test]
async fn new_local_entity_is_created_remotely() {
    let h = Harness::start().await;
    let created = h.engine.create_local(ada()).await.unwrap();
    assert!(created.remote_id.is_none());
    assert_eq!(created.envelope.sync_status, SyncStatus::Pending);

    h.settle().await;

    let entity = h.entity(created.id).await;
    assert_eq!(entity.remote_id, Some(RemoteId::new("1001")));
    assert_eq!(entity.envelope.sync_status, SyncStatus::Synced);
    assert!(h.remote.record(&RemoteId::new("1001")).is_some());

    let logs = h.logs().await;
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, LogStatus::Success);
    assert_eq!(logs[0].direction, Direction::ToRemote);
    assert_eq!(logs[0].action, SyncAction::Create);

    let metrics = h.engine.metrics();
    assert_eq!(metrics.syncs_succeeded, 1);
    assert_eq!(metrics.jobs_completed, 1);
}

#[tokio::test]
async fn divergent_edits_become_one_pending_conflict() {
    let h = Harness::start().await;
    let (id, synced_at) = synced_ada(&h).await;

    diverge(&h, id, synced_at).await;

    let entity = h.entity(id).await;
    assert_eq!(entity.envelope.sync_status, SyncStatus::Conflict);
    assert_eq!(first_name(&entity.data), Some("Local"));

    let pending = h
        .engine
        .list_unresolved(None, Page::default())
        .await
        .unwrap();
    assert_eq!(pending.total, 1);
    let conflict = &pending.items[0];
    assert_eq!(conflict.entity_id, id);
    assert_eq!(conflict.conflicting_fields, vec!["first_name".to_string()]);
    assert_eq!(conflict.resolution_type, ResolutionType::Pending);

    let logs = h.logs().await;
    let outbound_failure = logs
        .iter()
        .find(|l| l.direction == Direction::ToRemote && l.status == LogStatus::Failed)
        .unwrap();
    assert_eq!(
        outbound_failure.error_message.as_deref(),
        Some("Conflict detected")
    );

    // The remote keeps its own edit until someone decides.
    let record = h.remote.record(&entity.remote_id.unwrap()).unwrap();
    assert_eq!(first_name(&record.data), Some("Remote"));
}

#[tokio::test]
async fn merged_resolution_writes_through_once() {
    let h = Harness::start().await;
    let (id, synced_at) = synced_ada(&h).await;
    diverge(&h, id, synced_at).await;
    let mut events = h.engine.subscribe();

    let conflict_id = h
        .engine
        .list_unresolved(Some(EntityType::Contact), Page::default())
        .await
        .unwrap()
        .items[0]
        .id;
    let mut choices = FieldChoices::new();
    choices.insert("first_name".into(), FieldChoice::Remote);

    let resolved = h
        .engine
        .resolve_conflict(
            conflict_id,
            ResolutionType::Merged,
            Some(choices.clone()),
            "ops@example.com",
        )
        .await
        .unwrap();
    assert_eq!(first_name(&resolved.data), Some("Remote"));
    assert_eq!(resolved.envelope.sync_status, SyncStatus::Pending);

    let err = h
        .engine
        .resolve_conflict(
            conflict_id,
            ResolutionType::Merged,
            Some(choices),
            "ops@example.com",
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    h.settle().await;

    let entity = h.entity(id).await;
    assert_eq!(entity.envelope.sync_status, SyncStatus::Synced);
    // Non-chosen fields keep the local values.
    match &entity.data {
        EntityData::Contact(c) => assert_eq!(c.last_name.as_deref(), Some("Lovelace")),
        other => panic!("unexpected {:?}", other),
    }
    let record = h.remote.record(&entity.remote_id.unwrap()).unwrap();
    assert_eq!(first_name(&record.data), Some("Remote"));

    let conflict = h.engine.get_conflict(conflict_id).await.unwrap();
    assert_eq!(conflict.resolution_type, ResolutionType::Merged);
    assert_eq!(conflict.resolved_by.as_deref(), Some("ops@example.com"));
    let counts = h.engine.conflict_counts().await.unwrap();
    assert_eq!((counts.pending, counts.resolved), (0, 1));

    match events.recv().await.unwrap() {
        SyncNotification::ConflictResolved {
            conflict_id: notified,
            resolution_type,
            ..
        } => {
            assert_eq!(notified, conflict_id);
            assert_eq!(resolution_type, ResolutionType::Merged);
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn repeated_inbound_sync_is_idempotent() {
    let h = Harness::start().await;
    h.remote.insert(RemoteRecord {
        remote_id: RemoteId::new("77"),
        data: ada(),
        last_modified: now_millis(),
    });

    h.engine
        .enqueue_inbound(EntityType::Contact, RemoteId::new("77"), InboundEvent::Create)
        .unwrap();
    h.settle().await;
    h.engine
        .enqueue_inbound(EntityType::Contact, RemoteId::new("77"), InboundEvent::Update)
        .unwrap();
    h.settle().await;

    let stats = h.engine.sync_stats().await.unwrap();
    assert_eq!(stats.entities[&EntityType::Contact].synced, 1);
    assert_eq!(stats.logs_last_24h.success, 2);
    assert_eq!(h.engine.conflict_counts().await.unwrap().pending, 0);

    // Remote archive arrives as a delete event.
    h.engine
        .enqueue_inbound(EntityType::Contact, RemoteId::new("77"), InboundEvent::Delete)
        .unwrap();
    h.settle().await;
    let stats = h.engine.sync_stats().await.unwrap();
    assert_eq!(stats.entities[&EntityType::Contact].total(), 0);
}

#[tokio::test]
async fn batch_poll_imports_every_type() {
    let h = Harness::start().await;
    let now = now_millis();
    h.remote.insert(RemoteRecord {
        remote_id: RemoteId::new("c-1"),
        data: ada(),
        last_modified: now,
    });
    h.remote.insert(RemoteRecord {
        remote_id: RemoteId::new("c-2"),
        data: EntityData::Contact(Contact::new("grace@example.com")),
        last_modified: now,
    });
    h.remote.insert(RemoteRecord {
        remote_id: RemoteId::new("co-1"),
        data: EntityData::Company(Company::new("Analytical Engines")),
        last_modified: now,
    });
    let mut events = h.engine.subscribe();

    h.engine.enqueue_batch_poll(PollTarget::All).unwrap();
    h.settle().await;

    let stats = h.engine.sync_stats().await.unwrap();
    assert_eq!(stats.entities[&EntityType::Contact].synced, 2);
    assert_eq!(stats.entities[&EntityType::Company].synced, 1);

    loop {
        match events.recv().await.unwrap() {
            SyncNotification::BatchPollCompleted { counts } => {
                assert_eq!(counts[&EntityType::Contact].synced, 2);
                assert_eq!(counts[&EntityType::Company].synced, 1);
                assert_eq!(counts[&EntityType::Contact].errors, 0);
                break;
            }
            SyncNotification::SyncCompleted { .. } => continue,
            other => panic!("unexpected {:?}", other),
        }
    }
}

#[tokio::test]
async fn failed_attempt_can_be_retried() {
    let h = Harness::start().await;
    h.remote.fail_next(RemoteError::Status {
        code: 400,
        message: "email rejected".into(),
    });

    let created = h.engine.create_local(ada()).await.unwrap();
    h.settle().await;

    let entity = h.entity(created.id).await;
    assert_eq!(entity.envelope.sync_status, SyncStatus::Error);
    let failed = h.logs().await.remove(0);
    assert_eq!(failed.status, LogStatus::Failed);
    assert_eq!(h.engine.queue_stats().outbound.failed, 1);

    h.engine.retry_log(failed.id).await.unwrap();
    h.settle().await;

    let entity = h.entity(created.id).await;
    assert_eq!(entity.envelope.sync_status, SyncStatus::Synced);
    assert_eq!(entity.remote_id, Some(RemoteId::new("1001")));

    let logs = h.logs().await;
    assert_eq!(logs.len(), 2);
    let retried = logs.iter().find(|l| l.id == failed.id).unwrap();
    assert_eq!(retried.status, LogStatus::Retrying);
    assert_eq!(retried.retry_count, 1);
    assert!(logs
        .iter()
        .any(|l| l.id != failed.id && l.status == LogStatus::Success));

    // Only failed attempts are retryable.
    let err = h.engine.retry_log(failed.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn exhausted_job_is_announced_to_subscribers() {
    let h = Harness::start().await;
    let mut events = h.engine.subscribe();
    h.remote.fail_next(RemoteError::Status {
        code: 400,
        message: "email rejected".into(),
    });

    let created = h.engine.create_local(ada()).await.unwrap();
    let failure = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let SyncNotification::JobFailed {
                queue,
                entity_type,
                entity_id,
                remote_id,
                reason,
            } = events.recv().await.unwrap()
            {
                return (queue, entity_type, entity_id, remote_id, reason);
            }
        }
    })
    .await
    .expect("no job failure announced");

    assert_eq!(failure.0, "outbound-sync");
    assert_eq!(failure.1, Some(EntityType::Contact));
    assert_eq!(failure.2, Some(created.id));
    assert_eq!(failure.3, None);
    assert!(failure.4.contains("email rejected"), "{}", failure.4);
    assert_eq!(h.engine.queue_stats().outbound.failed, 1);
}

#[tokio::test]
async fn local_delete_archives_remote_record() {
    let h = Harness::start().await;
    let (id, _) = synced_ada(&h).await;

    h.engine.delete_local(id).await.unwrap();
    h.settle().await;

    let entity = h.entity(id).await;
    assert!(entity.is_deleted);
    assert_eq!(entity.envelope.sync_status, SyncStatus::Synced);
    assert!(h.remote.is_archived(&RemoteId::new("1001")));
    assert!(h.engine.pending_entities(None, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn paused_queues_hold_work() {
    let h = Harness::start().await;
    h.engine.pause_all();

    let created = h.engine.create_local(ada()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.engine.queue_stats().outbound.waiting, 1);
    assert_eq!(h.remote.call_count(), 0);

    h.engine.resume_all();
    h.settle().await;
    assert_eq!(
        h.entity(created.id).await.envelope.sync_status,
        SyncStatus::Synced
    );
    h.engine.shutdown();
}
