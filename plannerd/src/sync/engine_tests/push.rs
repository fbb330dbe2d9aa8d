use planner_core::{GoogleError, StatusCode};
use time::macros::datetime;
use time::Duration;

use super::fakes::*;
use crate::sync::clock;
use crate::sync::engine::{EngineError, SyncSettings};
use crate::sync::marker;
use crate::sync::metadata::INDEX_BLOB;
use crate::sync::queue::{OpPayload, PendingOpKind};
use crate::sync::task_store::{NewTask, Task, TaskStatus, TaskStore};

async fn scheduled_task(h: &Harness, title: &str, event_id: Option<&str>) -> Task {
    h.store
        .add(NewTask {
            title: title.into(),
            start: Some(datetime!(2025-03-03 09:00 UTC)),
            duration_minutes: Some(30),
            gcal_event_id: event_id.map(str::to_string),
            gcal_etag: event_id.map(|id| format!("etag-{id}")),
            updated_at: Some(datetime!(2025-03-01 10:00 UTC)),
            ..NewTask::default()
        })
        .await
        .unwrap()
}

#[tokio::test]
async fn delete_of_missing_event_still_clears_link() {
    let h = harness().await;
    for n in 1..=4 {
        h.store
            .add(NewTask {
                title: format!("filler {n}"),
                ..NewTask::default()
            })
            .await
            .unwrap();
    }
    let task = scheduled_task(&h, "Five", Some("e1")).await;
    assert_eq!(task.id, 5);
    h.store
        .enqueue_raw("gcal_delete", 5, r#"{"eventId":"e1"}"#)
        .await
        .unwrap();
    *h.calendar.fail_delete.lock().unwrap() = Some(api_error(StatusCode::NOT_FOUND));

    let report = h.engine.push_queue_worker(10).await.unwrap();

    assert_eq!(report.succeeded, 1);
    assert_eq!(h.store.count_pending().await.unwrap(), 0);
    assert_eq!(h.store.get(5).await.unwrap().unwrap().gcal_event_id, None);
}

#[tokio::test]
async fn repeated_delete_is_idempotent() {
    let h = harness().await;
    let task = h
        .store
        .add(NewTask {
            title: "Inbox".into(),
            gtasks_id: Some("g1".into()),
            ..NewTask::default()
        })
        .await
        .unwrap();
    h.tasks.put(remote_task("g1", "Inbox", "2025-03-01T08:00:00Z"));
    let payload = OpPayload::gtask(Some("g1"), Some("list-1"));
    h.store
        .enqueue(PendingOpKind::GtasksDelete, task.id, &payload)
        .await
        .unwrap();
    h.store
        .enqueue(PendingOpKind::GtasksDelete, task.id, &payload)
        .await
        .unwrap();

    let report = h.engine.push_queue_worker(10).await.unwrap();

    assert_eq!(report.succeeded, 2);
    assert_eq!(report.requeued, 0);
    assert!(h.tasks.item("g1").is_none());
    assert!(h.store.get_mapping(task.id).await.unwrap().is_none());
    assert_eq!(h.store.get(task.id).await.unwrap().unwrap().gtasks_id, None);
}

#[tokio::test]
async fn create_records_event_link_and_marker() {
    let h = harness().await;
    let task = scheduled_task(&h, "Plan sprint", None).await;
    h.engine.on_task_created(task.id).await.unwrap();

    let report = h.engine.push_queue_worker(10).await.unwrap();

    assert_eq!(report.succeeded, 1);
    let task = h.store.get(task.id).await.unwrap().unwrap();
    let event_id = task.gcal_event_id.clone().unwrap();
    let event = h.calendar.event(&event_id).unwrap();
    assert_eq!(event.summary.as_deref(), Some("Plan sprint"));
    assert_eq!(marker::find_marker(event.description.as_deref().unwrap()), Some(task.id));
    assert_eq!(
        event.end.unwrap().date_time.as_deref(),
        Some("2025-03-03T09:30:00Z")
    );
    assert_eq!(task.gcal_etag, event.etag);
    assert!(h.engine.cursors.last_push_at().await.unwrap().is_some());

    // The pushed revision is already known to the next pull.
    let pull = h.engine.pull_calendar().await.unwrap();
    assert_eq!(pull.mutations(), 0);
}

#[tokio::test]
async fn create_for_linked_task_becomes_update() {
    let h = harness().await;
    let task = scheduled_task(&h, "Linked", Some("e1")).await;
    h.calendar.put(timed_event(
        "e1",
        "Old",
        "2025-03-03T09:00:00Z",
        "2025-03-03T09:30:00Z",
        "2025-03-01T08:00:00Z",
    ));
    h.store
        .enqueue(PendingOpKind::GcalCreate, task.id, &OpPayload::default())
        .await
        .unwrap();

    h.engine.push_queue_worker(10).await.unwrap();

    assert!(h.calendar.inserts.lock().unwrap().is_empty());
    assert_eq!(h.calendar.event("e1").unwrap().summary.as_deref(), Some("Linked"));
}

#[tokio::test]
async fn conflict_with_newer_remote_applies_remote_and_drops_push() {
    let h = harness().await;
    let task = scheduled_task(&h, "Local title", Some("e1")).await;
    let mut remote = timed_event(
        "e1",
        "Remote title",
        "2025-03-03T11:00:00Z",
        "2025-03-03T12:00:00Z",
        "2025-03-01T11:00:00Z",
    );
    remote.etag = Some("etag-new".into());
    h.calendar.put(remote);
    *h.calendar.fail_patch.lock().unwrap() = Some(api_error(StatusCode::PRECONDITION_FAILED));
    h.store
        .enqueue(PendingOpKind::GcalUpdate, task.id, &OpPayload::event(Some("e1")))
        .await
        .unwrap();

    let report = h.engine.push_queue_worker(10).await.unwrap();

    assert_eq!(report.dropped, 1);
    assert_eq!(h.store.count_pending().await.unwrap(), 0);
    let task = h.store.get(task.id).await.unwrap().unwrap();
    assert_eq!(task.title, "Remote title");
    assert_eq!(task.start, Some(datetime!(2025-03-03 11:00 UTC)));
    assert_eq!(task.gcal_etag.as_deref(), Some("etag-new"));
    assert_eq!(h.calendar.patches.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn conflict_with_older_remote_overwrites_with_fresh_precondition() {
    let h = harness().await;
    let task = scheduled_task(&h, "Local title", Some("e1")).await;
    let mut remote = timed_event(
        "e1",
        "Remote title",
        "2025-03-03T11:00:00Z",
        "2025-03-03T12:00:00Z",
        "2025-03-01T09:00:00Z",
    );
    remote.etag = Some("etag-new".into());
    h.calendar.put(remote);
    *h.calendar.fail_patch.lock().unwrap() = Some(api_error(StatusCode::PRECONDITION_FAILED));
    h.store
        .enqueue(PendingOpKind::GcalUpdate, task.id, &OpPayload::event(Some("e1")))
        .await
        .unwrap();

    let report = h.engine.push_queue_worker(10).await.unwrap();

    assert_eq!(report.succeeded, 1);
    let patches = h.calendar.patches.lock().unwrap().clone();
    assert_eq!(patches.len(), 2);
    assert_eq!(patches[0].2.as_deref(), Some("etag-e1"));
    assert_eq!(patches[1].2.as_deref(), Some("etag-new"));
    assert_eq!(
        h.calendar.event("e1").unwrap().summary.as_deref(),
        Some("Local title")
    );
}

#[tokio::test]
async fn update_of_vanished_event_recreates_it() {
    let h = harness().await;
    let task = scheduled_task(&h, "Orphan", Some("gone")).await;
    h.store
        .enqueue(PendingOpKind::GcalUpdate, task.id, &OpPayload::event(Some("gone")))
        .await
        .unwrap();

    let report = h.engine.push_queue_worker(10).await.unwrap();

    assert_eq!(report.succeeded, 1);
    let task = h.store.get(task.id).await.unwrap().unwrap();
    assert_ne!(task.gcal_event_id.as_deref(), Some("gone"));
    assert!(h.calendar.event(task.gcal_event_id.as_deref().unwrap()).is_some());
}

#[tokio::test]
async fn transient_failure_is_requeued_with_backoff() {
    let h = harness().await;
    let task = scheduled_task(&h, "Flaky", None).await;
    h.engine.on_task_created(task.id).await.unwrap();
    *h.calendar.fail_insert.lock().unwrap() = Some(api_error(StatusCode::SERVICE_UNAVAILABLE));
    let before = clock::now_utc();

    let report = h.engine.push_queue_worker(10).await.unwrap();

    assert_eq!(report.requeued, 1);
    let op = &h.store.ops_for_task(task.id).await.unwrap()[0];
    assert_eq!(op.attempts, 1);
    assert!(op.next_try_at >= before + Duration::seconds(2));
    assert!(op.last_error.as_deref().unwrap().contains("503"));
    assert!(h.store.due(10).await.unwrap().is_empty());
    assert!(h.engine.cursors.last_push_at().await.unwrap().is_none());
}

#[tokio::test]
async fn retry_after_postpones_the_next_attempt() {
    let h = harness().await;
    let task = scheduled_task(&h, "Throttled", None).await;
    h.engine.on_task_created(task.id).await.unwrap();
    *h.calendar.fail_insert.lock().unwrap() = Some(GoogleError::Api {
        status: StatusCode::TOO_MANY_REQUESTS,
        body: "slow down".into(),
        retry_after: Some(120),
    });
    let before = clock::now_utc();

    h.engine.push_queue_worker(10).await.unwrap();

    let op = &h.store.ops_for_task(task.id).await.unwrap()[0];
    assert!(op.next_try_at >= before + Duration::seconds(120));
}

#[tokio::test]
async fn permanent_failure_is_dead_lettered_when_enabled() {
    let h = harness_with(
        SyncSettings {
            max_attempts: 1,
            ..SyncSettings::default()
        },
        "test-token",
    )
    .await;
    let task = scheduled_task(&h, "Rejected", None).await;
    h.engine.on_task_created(task.id).await.unwrap();
    *h.calendar.fail_insert.lock().unwrap() = Some(api_error(StatusCode::BAD_REQUEST));

    let report = h.engine.push_queue_worker(10).await.unwrap();

    assert_eq!(report.dead_lettered, 1);
    assert_eq!(h.store.count_dead().await.unwrap(), 1);
    assert_eq!(h.store.count_pending().await.unwrap(), 0);
    let dead = h.store.list_dead_letters().await.unwrap();
    assert!(dead[0].last_error.as_deref().unwrap().contains("400"));
}

#[tokio::test]
async fn permanent_failure_is_retried_by_default() {
    let h = harness().await;
    let task = scheduled_task(&h, "Rejected", None).await;
    h.engine.on_task_created(task.id).await.unwrap();
    *h.calendar.fail_insert.lock().unwrap() = Some(api_error(StatusCode::BAD_REQUEST));

    let report = h.engine.push_queue_worker(10).await.unwrap();

    assert_eq!(report.requeued, 1);
    assert_eq!(h.store.count_dead().await.unwrap(), 0);
    assert_eq!(h.store.count_pending().await.unwrap(), 1);
}

#[tokio::test]
async fn malformed_payload_stays_in_queue() {
    let h = harness().await;
    let task = scheduled_task(&h, "Broken", Some("e1")).await;
    let op_id = h
        .store
        .enqueue_raw("gcal_delete", task.id, "{not json")
        .await
        .unwrap();

    let report = h.engine.push_queue_worker(10).await.unwrap();

    assert_eq!(report.requeued, 1);
    let op = h.store.get_op(op_id).await.unwrap().unwrap();
    assert_eq!(op.attempts, 1);
    assert!(op.last_error.unwrap().starts_with("invalid payload"));
    assert!(h.calendar.deletes.lock().unwrap().is_empty());
}

#[tokio::test]
async fn missing_credentials_leave_queue_untouched() {
    let h = harness_with(SyncSettings::default(), "").await;
    let task = scheduled_task(&h, "Offline", None).await;
    h.engine.on_task_created(task.id).await.unwrap();

    let err = h.engine.push_queue_worker(10).await.unwrap_err();

    assert!(err.is_credential_failure());
    let op = &h.store.ops_for_task(task.id).await.unwrap()[0];
    assert_eq!(op.attempts, 0);
    assert!(h.calendar.inserts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn rejected_token_stops_the_batch_without_counting_attempts() {
    let h = harness().await;
    let task = scheduled_task(&h, "Unauthorized", None).await;
    h.engine.on_task_created(task.id).await.unwrap();
    *h.calendar.fail_insert.lock().unwrap() = Some(api_error(StatusCode::UNAUTHORIZED));

    let err = h.engine.push_queue_worker(10).await.unwrap_err();

    assert!(matches!(err, EngineError::Remote(_)));
    assert!(err.is_credential_failure());
    assert_eq!(h.store.ops_for_task(task.id).await.unwrap()[0].attempts, 0);
}

#[tokio::test]
async fn superseded_operation_is_dropped() {
    let h = harness().await;
    let task = h
        .store
        .add(NewTask {
            title: "Moved to calendar".into(),
            start: Some(datetime!(2025-03-03 09:00 UTC)),
            ..NewTask::default()
        })
        .await
        .unwrap();
    h.store
        .enqueue(PendingOpKind::GtasksUpdate, task.id, &OpPayload::default())
        .await
        .unwrap();

    let report = h.engine.push_queue_worker(10).await.unwrap();

    assert_eq!(report.dropped, 1);
    assert!(h.tasks.inserts.lock().unwrap().is_empty());
    assert_eq!(h.store.count_pending().await.unwrap(), 0);
}

#[tokio::test]
async fn tasks_push_links_item_publishes_metadata_and_clears_dirty() {
    let h = harness().await;
    let task = h
        .store
        .add(NewTask {
            title: "Inbox item".into(),
            notes: Some("details".into()),
            priority: 2,
            status: TaskStatus::Done,
            ..NewTask::default()
        })
        .await
        .unwrap();
    h.engine.on_task_created(task.id).await.unwrap();

    let report = h.engine.push_queue_worker(10).await.unwrap();

    assert_eq!(report.succeeded, 1);
    let task = h.store.get(task.id).await.unwrap().unwrap();
    let gtask_id = task.gtasks_id.clone().unwrap();
    let body = h.tasks.inserts.lock().unwrap()[0].clone();
    assert_eq!(body.status.as_deref(), Some("completed"));
    assert!(matches!(body.completed, Some(Some(_))));
    assert_eq!(body.notes, Some(Some("details".into())));
    let mapping = h.store.get_mapping(task.id).await.unwrap().unwrap();
    assert!(!mapping.dirty);
    assert_eq!(mapping.gtask_id.as_deref(), Some(gtask_id.as_str()));
    let index = h.blobs.get(INDEX_BLOB).unwrap();
    assert_eq!(index["tasks"][gtask_id.as_str()]["priority"], 2);
    assert_eq!(index["tasks"][gtask_id.as_str()]["status"], "done");
}

#[tokio::test]
async fn reopened_task_clears_remote_completion() {
    let h = harness().await;
    let task = h
        .store
        .add(NewTask {
            title: "Reopened".into(),
            gtasks_id: Some("g1".into()),
            ..NewTask::default()
        })
        .await
        .unwrap();
    h.tasks.put(planner_core::RemoteTask {
        status: Some("completed".into()),
        completed: Some("2025-03-01T08:00:00Z".into()),
        ..remote_task("g1", "Reopened", "2025-03-01T08:00:00Z")
    });
    h.engine.on_task_updated(task.id).await.unwrap();

    h.engine.push_queue_worker(10).await.unwrap();

    let (id, body, _) = h.tasks.patches.lock().unwrap()[0].clone();
    assert_eq!(id, "g1");
    assert_eq!(body.status.as_deref(), Some("needsAction"));
    assert_eq!(body.completed, Some(None));
    let item = h.tasks.item("g1").unwrap();
    assert_eq!(item.completed, None);
}

#[tokio::test]
async fn legacy_notes_metadata_is_written_when_enabled() {
    let h = harness_with(
        SyncSettings {
            notes_metadata: true,
            ..SyncSettings::default()
        },
        "test-token",
    )
    .await;
    let task = h
        .store
        .add(NewTask {
            title: "Legacy".into(),
            notes: Some("body".into()),
            priority: 1,
            ..NewTask::default()
        })
        .await
        .unwrap();
    h.engine.on_task_created(task.id).await.unwrap();

    h.engine.push_queue_worker(10).await.unwrap();

    let body = h.tasks.inserts.lock().unwrap()[0].clone();
    let notes = body.notes.flatten().unwrap();
    let (meta, rest) = marker::split_notes(Some(&notes));
    let meta = meta.unwrap();
    assert_eq!(meta.task_id, Some(task.id));
    assert_eq!(meta.priority, Some(1));
    assert_eq!(meta.device_id.as_deref(), Some(DEVICE));
    assert_eq!(rest, "body");
}

#[tokio::test]
async fn local_edit_wins_end_to_end_after_deferred_pull() {
    let h = harness().await;
    let task = scheduled_task(&h, "Mine", Some("e1")).await;
    h.store
        .update(
            task.id,
            crate::sync::task_store::TaskPatch {
                gcal_updated: Some(Some(datetime!(2025-03-01 08:00 UTC))),
                updated_at: Some(datetime!(2025-03-01 12:00 UTC)),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    h.calendar.put(timed_event(
        "e1",
        "Theirs",
        "2025-03-03T09:00:00Z",
        "2025-03-03T09:30:00Z",
        "2025-03-01T10:00:00Z",
    ));

    let report = h.engine.sync_once().await.unwrap();

    assert_eq!(report.calendar.deferred, 1);
    assert_eq!(report.push.succeeded, 1);
    assert_eq!(h.calendar.event("e1").unwrap().summary.as_deref(), Some("Mine"));
    assert_eq!(h.store.get(task.id).await.unwrap().unwrap().title, "Mine");
}
