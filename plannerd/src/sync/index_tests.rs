use std::time::Duration as StdDuration;

use sqlx::SqlitePool;
use time::macros::{date, datetime};
use time::Duration;

use super::*;
use crate::sync::queue::{OpPayload, PendingOpKind};
use crate::sync::task_store::{NewTask, TaskPatch, TaskStatus, TaskStore};

async fn make_store() -> IndexStore {
    let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
    let store = IndexStore::from_pool(pool);
    store.init().await.unwrap();
    store
}

fn new_task(title: &str) -> NewTask {
    NewTask {
        title: title.into(),
        ..NewTask::default()
    }
}

#[tokio::test]
async fn add_and_get_task() {
    let store = make_store().await;
    let created = store
        .add(NewTask {
            title: "Write report".into(),
            notes: Some("draft".into()),
            start: Some(datetime!(2025-03-01 09:00 UTC)),
            duration_minutes: Some(45),
            priority: 7,
            ..NewTask::default()
        })
        .await
        .unwrap();

    let fetched = store.get(created.id).await.unwrap().unwrap();
    assert_eq!(fetched, created);
    assert_eq!(fetched.priority, 3);
    assert_eq!(fetched.status, TaskStatus::Todo);
    assert!(fetched.is_scheduled());
}

#[tokio::test]
async fn update_applies_only_given_fields() {
    let store = make_store().await;
    let task = store.add(new_task("A")).await.unwrap();
    let stamp = datetime!(2025-03-01 12:00 UTC);

    let updated = store
        .update(
            task.id,
            TaskPatch {
                notes: Some(Some("n".into())),
                status: Some(TaskStatus::Done),
                updated_at: Some(stamp),
                ..TaskPatch::default()
            },
        )
        .await
        .unwrap()
        .unwrap();

    assert_eq!(updated.title, "A");
    assert_eq!(updated.notes.as_deref(), Some("n"));
    assert_eq!(updated.status, TaskStatus::Done);
    assert_eq!(updated.updated_at, stamp);
    assert_eq!(store.get(task.id).await.unwrap().unwrap(), updated);
}

#[tokio::test]
async fn update_of_missing_task_returns_none() {
    let store = make_store().await;
    assert!(store.update(99, TaskPatch::edited()).await.unwrap().is_none());
}

#[tokio::test]
async fn lists_split_scheduled_and_unscheduled() {
    let store = make_store().await;
    let day = store
        .add(NewTask {
            title: "morning".into(),
            start: Some(datetime!(2025-03-01 08:00 UTC)),
            ..NewTask::default()
        })
        .await
        .unwrap();
    store
        .add(NewTask {
            title: "next day".into(),
            start: Some(datetime!(2025-03-02 08:00 UTC)),
            ..NewTask::default()
        })
        .await
        .unwrap();
    let old = store
        .add(NewTask {
            title: "old".into(),
            updated_at: Some(datetime!(2025-01-01 00:00 UTC)),
            ..NewTask::default()
        })
        .await
        .unwrap();
    let fresh = store
        .add(NewTask {
            title: "fresh".into(),
            updated_at: Some(datetime!(2025-03-01 00:00 UTC)),
            ..NewTask::default()
        })
        .await
        .unwrap();

    let for_day = store
        .list_scheduled_for_day(date!(2025 - 03 - 01))
        .await
        .unwrap();
    assert_eq!(for_day.iter().map(|t| t.id).collect::<Vec<_>>(), vec![day.id]);
    assert_eq!(store.list_scheduled().await.unwrap().len(), 2);
    assert_eq!(store.list_unscheduled().await.unwrap().len(), 2);

    let since = store
        .list_unscheduled_updated_since(datetime!(2025-02-01 00:00 UTC))
        .await
        .unwrap();
    assert_eq!(since.iter().map(|t| t.id).collect::<Vec<_>>(), vec![fresh.id]);
    assert_ne!(old.id, fresh.id);
}

#[tokio::test]
async fn finds_tasks_by_remote_ids() {
    let store = make_store().await;
    let task = store
        .add(NewTask {
            title: "linked".into(),
            gcal_event_id: Some("e1".into()),
            ..NewTask::default()
        })
        .await
        .unwrap();
    store
        .update(
            task.id,
            TaskPatch {
                gtasks_id: Some(Some("g1".into())),
                ..TaskPatch::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(store.find_by_event_id("e1").await.unwrap().unwrap().id, task.id);
    assert_eq!(store.find_by_gtasks_id("g1").await.unwrap().unwrap().id, task.id);
    assert!(store.find_by_event_id("nope").await.unwrap().is_none());
}

#[tokio::test]
async fn enqueue_rejects_unknown_operation() {
    let store = make_store().await;
    let err = store.enqueue_raw("gcal_move", 1, "{}").await.unwrap_err();
    assert!(matches!(err, IndexError::InvalidOperationKind(kind) if kind == "gcal_move"));
    assert_eq!(store.count_pending().await.unwrap(), 0);
}

#[tokio::test]
async fn enqueue_never_deduplicates() {
    let store = make_store().await;
    store
        .enqueue(PendingOpKind::GcalUpdate, 1, &OpPayload::default())
        .await
        .unwrap();
    store
        .enqueue(PendingOpKind::GcalUpdate, 1, &OpPayload::default())
        .await
        .unwrap();
    assert_eq!(store.ops_for_task(1).await.unwrap().len(), 2);
}

#[tokio::test]
async fn due_returns_oldest_due_first() {
    let store = make_store().await;
    let first = store
        .enqueue(PendingOpKind::GtasksCreate, 1, &OpPayload::default())
        .await
        .unwrap();
    let second = store
        .enqueue(PendingOpKind::GtasksCreate, 2, &OpPayload::default())
        .await
        .unwrap();
    let now = clock::now_utc();
    // Push the first one into the future: only the second is due.
    store.requeue_at(first, "boom", now, None).await.unwrap();

    let due = store.due_at(10, now).await.unwrap();
    assert_eq!(due.iter().map(|op| op.id).collect::<Vec<_>>(), vec![second]);

    let later = store.due_at(10, now + Duration::minutes(5)).await.unwrap();
    assert_eq!(later.iter().map(|op| op.id).collect::<Vec<_>>(), vec![second, first]);

    let limited = store.due_at(1, now + Duration::minutes(5)).await.unwrap();
    assert_eq!(limited.len(), 1);
}

#[tokio::test]
async fn requeue_backoff_is_capped_exponential() {
    let store = make_store().await;
    let op = store
        .enqueue(PendingOpKind::GcalCreate, 1, &OpPayload::default())
        .await
        .unwrap();
    let now = datetime!(2025-03-01 00:00 UTC);

    let mut delays = Vec::new();
    for _ in 0..7 {
        let next = store.requeue_at(op, "timeout", now, None).await.unwrap();
        delays.push((next - now).whole_seconds());
    }
    assert_eq!(delays, vec![2, 4, 8, 16, 30, 30, 30]);
    assert!(delays.windows(2).all(|w| w[0] <= w[1]));

    let stored = store.get_op(op).await.unwrap().unwrap();
    assert_eq!(stored.attempts, 7);
    assert_eq!(stored.last_error.as_deref(), Some("timeout"));
}

#[tokio::test]
async fn requeue_truncates_errors_and_honours_retry_after() {
    let store = make_store().await;
    let op = store
        .enqueue(PendingOpKind::GcalCreate, 1, &OpPayload::default())
        .await
        .unwrap();
    let now = datetime!(2025-03-01 00:00 UTC);
    let long = "x".repeat(5000);

    let next = store
        .requeue_at(op, &long, now, Some(StdDuration::from_secs(120)))
        .await
        .unwrap();

    assert_eq!((next - now).whole_seconds(), 120);
    let stored = store.get_op(op).await.unwrap().unwrap();
    assert_eq!(stored.last_error.unwrap().len(), 1000);
}

#[tokio::test]
async fn dead_letters_leave_due_but_stay_listed() {
    let store = make_store().await;
    let op = store
        .enqueue(PendingOpKind::GtasksUpdate, 4, &OpPayload::default())
        .await
        .unwrap();
    store.mark_dead(op, "bad request").await.unwrap();

    assert!(store.due(10).await.unwrap().is_empty());
    assert_eq!(store.count_pending().await.unwrap(), 0);
    assert_eq!(store.count_dead().await.unwrap(), 1);
    assert_eq!(store.list_dead_letters().await.unwrap()[0].id, op);
}

#[tokio::test]
async fn remove_deletes_operation() {
    let store = make_store().await;
    let op = store
        .enqueue(
            PendingOpKind::GcalDelete,
            5,
            &OpPayload {
                event_id: Some("e1".into()),
                ..OpPayload::default()
            },
        )
        .await
        .unwrap();
    let stored = store.get_op(op).await.unwrap().unwrap();
    assert_eq!(stored.payload, r#"{"eventId":"e1"}"#);

    store.remove(op).await.unwrap();
    assert!(store.get_op(op).await.unwrap().is_none());
}

#[tokio::test]
async fn mapping_upsert_and_lookups() {
    let store = make_store().await;
    let at = datetime!(2025-03-01 00:00 UTC);
    store
        .upsert_mapping(1, "g1", "inbox", Some("etag-1"), at)
        .await
        .unwrap();
    store
        .upsert_mapping(1, "g1", "inbox", Some("etag-2"), at)
        .await
        .unwrap();

    let mapping = store.get_mapping(1).await.unwrap().unwrap();
    assert_eq!(mapping.revision.as_deref(), Some("etag-2"));
    assert!(!mapping.dirty);
    assert_eq!(
        store.get_mapping_by_remote("g1").await.unwrap().unwrap().task_id,
        1
    );

    store.delete_mapping(1).await.unwrap();
    assert!(store.get_mapping(1).await.unwrap().is_none());
}

#[tokio::test]
async fn mark_dirty_creates_row_lazily_and_upsert_clears_it() {
    let store = make_store().await;
    store.mark_dirty(7).await.unwrap();
    let mapping = store.get_mapping(7).await.unwrap().unwrap();
    assert!(mapping.dirty);
    assert!(mapping.gtask_id.is_none());

    store
        .upsert_mapping(7, "g7", "inbox", None, clock::now_utc())
        .await
        .unwrap();
    assert!(!store.get_mapping(7).await.unwrap().unwrap().dirty);
}

#[tokio::test]
async fn oversized_duration_falls_back_to_default_end() {
    let store = make_store().await;
    let task = store
        .add(NewTask {
            title: "Marathon".into(),
            start: Some(datetime!(2025-03-01 09:00 UTC)),
            duration_minutes: Some(i64::MAX),
            ..NewTask::default()
        })
        .await
        .unwrap();

    assert_eq!(task.end(30), Some(datetime!(2025-03-01 09:30 UTC)));
}
