use time::macros::datetime;

use super::fakes::*;
use crate::storage::Backend;
use crate::sync::engine::EngineError;
use crate::sync::queue::{OpPayload, PendingOpKind};
use crate::sync::task_store::{NewTask, TaskPatch, TaskStore};

fn kinds(ops: &[crate::sync::queue::PendingOp]) -> Vec<PendingOpKind> {
    ops.iter().map(|op| op.kind).collect()
}

#[tokio::test]
async fn created_task_is_queued_for_its_backend() {
    let h = harness().await;
    let scheduled = h
        .store
        .add(NewTask {
            title: "Meeting".into(),
            start: Some(datetime!(2025-03-03 09:00 UTC)),
            ..NewTask::default()
        })
        .await
        .unwrap();
    let inbox = h
        .store
        .add(NewTask {
            title: "Someday".into(),
            ..NewTask::default()
        })
        .await
        .unwrap();

    h.engine.on_task_created(scheduled.id).await.unwrap();
    h.engine.on_task_created(inbox.id).await.unwrap();

    assert_eq!(
        kinds(&h.store.ops_for_task(scheduled.id).await.unwrap()),
        vec![PendingOpKind::GcalCreate]
    );
    assert_eq!(
        kinds(&h.store.ops_for_task(inbox.id).await.unwrap()),
        vec![PendingOpKind::GtasksCreate]
    );
    assert!(h.store.get_mapping(inbox.id).await.unwrap().unwrap().dirty);
    assert!(h.store.get_mapping(scheduled.id).await.unwrap().is_none());
}

#[tokio::test]
async fn scheduling_a_task_drops_its_tasks_link() {
    let h = harness().await;
    let task = h
        .store
        .add(NewTask {
            title: "Write draft".into(),
            gtasks_id: Some("g1".into()),
            ..NewTask::default()
        })
        .await
        .unwrap();
    h.store
        .upsert_mapping(task.id, "g1", "list-1", Some("etag"), datetime!(2025-03-01 09:00 UTC))
        .await
        .unwrap();
    h.store
        .update(
            task.id,
            TaskPatch {
                start: Some(Some(datetime!(2025-03-03 09:00 UTC))),
                ..TaskPatch::edited()
            },
        )
        .await
        .unwrap();

    h.engine.on_task_updated(task.id).await.unwrap();

    let after = h.store.get(task.id).await.unwrap().unwrap();
    assert_eq!(after.gtasks_id, None);
    assert!(h.store.get_mapping(task.id).await.unwrap().is_none());
    let ops = h.store.ops_for_task(task.id).await.unwrap();
    assert_eq!(
        kinds(&ops),
        vec![PendingOpKind::GtasksDelete, PendingOpKind::GcalCreate]
    );
    assert_eq!(
        ops[0].decode_payload().unwrap(),
        OpPayload::gtask(Some("g1"), Some("list-1"))
    );
}

#[tokio::test]
async fn unscheduling_a_task_drops_its_calendar_link() {
    let h = harness().await;
    let task = h
        .store
        .add(NewTask {
            title: "Call bank".into(),
            start: Some(datetime!(2025-03-03 09:00 UTC)),
            gcal_event_id: Some("e1".into()),
            gcal_etag: Some("etag".into()),
            ..NewTask::default()
        })
        .await
        .unwrap();
    h.store
        .update(
            task.id,
            TaskPatch {
                start: Some(None),
                ..TaskPatch::edited()
            },
        )
        .await
        .unwrap();

    h.engine.on_task_updated(task.id).await.unwrap();

    let after = h.store.get(task.id).await.unwrap().unwrap();
    assert_eq!(after.gcal_event_id, None);
    assert_eq!(after.gcal_etag, None);
    let ops = h.store.ops_for_task(task.id).await.unwrap();
    assert_eq!(
        kinds(&ops),
        vec![PendingOpKind::GcalDelete, PendingOpKind::GtasksCreate]
    );
    assert_eq!(ops[0].payload, r#"{"eventId":"e1"}"#);
    assert!(h.store.get_mapping(task.id).await.unwrap().unwrap().dirty);
}

#[tokio::test]
async fn deleted_task_queues_remote_deletes_from_its_links() {
    let h = harness().await;
    let task = h
        .store
        .add(NewTask {
            title: "Gone".into(),
            gtasks_id: Some("g1".into()),
            ..NewTask::default()
        })
        .await
        .unwrap();
    h.store
        .upsert_mapping(task.id, "g1", "list-1", None, datetime!(2025-03-01 09:00 UTC))
        .await
        .unwrap();
    h.store.delete(task.id).await.unwrap();

    h.engine.on_task_deleted(&task).await.unwrap();

    let ops = h.store.ops_for_task(task.id).await.unwrap();
    assert_eq!(kinds(&ops), vec![PendingOpKind::GtasksDelete]);
    assert!(h.store.get_mapping(task.id).await.unwrap().is_none());

    let report = h.engine.push_queue_worker(10).await.unwrap();
    assert_eq!(report.succeeded, 1);
    assert_eq!(h.tasks.deletes.lock().unwrap().as_slice(), ["g1"]);
    assert_eq!(h.store.count_pending().await.unwrap(), 0);
}

#[tokio::test]
async fn full_resync_clears_cursors_and_queues_every_task() {
    let h = harness().await;
    h.engine.cursors.set(Backend::Calendar, "tok").await.unwrap();
    h.engine.cursors.set(Backend::Tasks, "2025-03-01T00:00:00Z").await.unwrap();
    for (title, start) in [
        ("Scheduled", Some(datetime!(2025-03-03 09:00 UTC))),
        ("Inbox", None),
    ] {
        h.store
            .add(NewTask {
                title: title.into(),
                start,
                ..NewTask::default()
            })
            .await
            .unwrap();
    }

    let report = h.engine.force_full_resync().await.unwrap();

    assert_eq!(report.queued, 2);
    assert!(report.warnings.is_empty());
    assert_eq!(h.engine.cursors.get(Backend::Calendar).await.unwrap(), None);
    assert_eq!(h.engine.cursors.get(Backend::Tasks).await.unwrap(), None);
    assert_eq!(h.store.count_pending().await.unwrap(), 2);
    let config = h.blobs.get(crate::sync::metadata::CONFIG_BLOB).unwrap();
    assert!(config["last_full_sync"].is_string());
}

#[tokio::test]
async fn catch_up_skips_tasks_with_live_operations() {
    let h = harness().await;
    let queued = h
        .store
        .add(NewTask {
            title: "Already queued".into(),
            ..NewTask::default()
        })
        .await
        .unwrap();
    let offline = h
        .store
        .add(NewTask {
            title: "Edited offline".into(),
            ..NewTask::default()
        })
        .await
        .unwrap();
    h.engine.on_task_created(queued.id).await.unwrap();

    let count = h.engine.enqueue_changes_since_last_push().await.unwrap();

    assert_eq!(count, 1);
    assert_eq!(h.store.ops_for_task(queued.id).await.unwrap().len(), 1);
    assert_eq!(
        kinds(&h.store.ops_for_task(offline.id).await.unwrap()),
        vec![PendingOpKind::GtasksCreate]
    );
}

#[tokio::test]
async fn sync_pass_is_single_flight() {
    let h = harness().await;
    let guard = h.engine.try_begin().unwrap();
    assert!(h.engine.try_begin().is_none());
    assert!(matches!(h.engine.sync_once().await, Err(EngineError::Busy)));
    assert!(matches!(h.engine.push_pending().await, Err(EngineError::Busy)));
    assert!(h.engine.status().await.unwrap().running);
    drop(guard);

    let report = h.engine.sync_once().await.unwrap();
    assert_eq!(report.push.processed, 0);
    assert!(!h.engine.is_running());
}
