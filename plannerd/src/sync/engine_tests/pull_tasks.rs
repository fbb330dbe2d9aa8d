use planner_core::{RemoteTask, TaskList};
use serde_json::json;
use time::macros::datetime;

use super::fakes::*;
use crate::storage::Backend;
use crate::sync::metadata::INDEX_BLOB;
use crate::sync::queue::PendingOpKind;
use crate::sync::task_store::{NewTask, TaskStatus, TaskStore};

fn seed_list(h: &Harness) {
    h.tasks.lists.lock().unwrap().push(TaskList {
        id: "list-1".into(),
        title: "planner inbox".into(),
        updated: None,
    });
}

#[tokio::test]
async fn new_item_becomes_unscheduled_task_with_mapping() {
    let h = harness().await;
    seed_list(&h);
    let mut item = remote_task("g1", "Buy milk", "2025-03-01T08:00:00Z");
    item.notes = Some("2 litres".into());
    h.tasks.put(item);

    let report = h.engine.pull_tasks().await.unwrap();

    assert_eq!(report.created, 1);
    let task = h.store.find_by_gtasks_id("g1").await.unwrap().unwrap();
    assert_eq!(task.title, "Buy milk");
    assert_eq!(task.notes.as_deref(), Some("2 litres"));
    assert_eq!(task.start, None);
    assert_eq!(task.status, TaskStatus::Todo);
    let mapping = h.store.get_mapping(task.id).await.unwrap().unwrap();
    assert_eq!(mapping.gtask_id.as_deref(), Some("g1"));
    assert_eq!(mapping.tasklist_id.as_deref(), Some("list-1"));
    assert!(!mapping.dirty);

    let index = h.blobs.get(INDEX_BLOB).unwrap();
    assert_eq!(index["tasks"]["g1"]["task_id"], json!(task.id));
    assert_eq!(index["tasks"]["g1"]["device_id"], json!(DEVICE));
    assert_eq!(index["tasklist_id"], json!("list-1"));
}

#[tokio::test]
async fn missing_tasklist_is_created_by_title() {
    let h = harness().await;

    h.engine.pull_tasks().await.unwrap();

    let lists = h.tasks.lists.lock().unwrap().clone();
    assert_eq!(lists.len(), 1);
    assert_eq!(lists[0].title, "Planner Inbox");
}

#[tokio::test]
async fn notes_metadata_links_remote_item_to_existing_task() {
    let h = harness().await;
    seed_list(&h);
    let task = h
        .store
        .add(NewTask {
            title: "A".into(),
            updated_at: Some(datetime!(2025-03-01 10:00 UTC)),
            ..NewTask::default()
        })
        .await
        .unwrap();
    let mut item = remote_task("g1", "A2", "2025-03-01T11:00:00Z");
    item.notes = Some(format!(
        "{{\"priority\":2,\"status\":\"doing\",\"task_id\":{}}}\n\nbody text",
        task.id
    ));
    h.tasks.put(item);

    let report = h.engine.pull_tasks().await.unwrap();

    assert_eq!(report.updated, 1);
    assert_eq!(report.created, 0);
    let task = h.store.get(task.id).await.unwrap().unwrap();
    assert_eq!(task.title, "A2");
    assert_eq!(task.gtasks_id.as_deref(), Some("g1"));
    assert_eq!(task.notes.as_deref(), Some("body text"));
    assert_eq!(task.priority, 2);
    assert_eq!(task.status, TaskStatus::Doing);
}

#[tokio::test]
async fn metadata_from_another_device_does_not_claim_local_ids() {
    let h = harness().await;
    seed_list(&h);
    let unrelated = h.store.add(NewTask {
        title: "Unrelated".into(),
        ..NewTask::default()
    })
    .await
    .unwrap();
    h.blobs.put(
        INDEX_BLOB,
        json!({
            "version": 1,
            "tasks": {
                "g1": {"task_id": unrelated.id, "priority": 3, "status": "doing",
                       "updated_at": "2025-03-01T09:00:00Z", "device_id": "OTHER"}
            }
        }),
    );
    h.tasks.put(remote_task("g1", "From phone", "2025-03-01T11:00:00Z"));

    let report = h.engine.pull_tasks().await.unwrap();

    assert_eq!(report.created, 1);
    assert_eq!(h.store.get(unrelated.id).await.unwrap().unwrap().title, "Unrelated");
    let created = h.store.find_by_gtasks_id("g1").await.unwrap().unwrap();
    assert_eq!(created.priority, 3);
    assert_eq!(created.status, TaskStatus::Doing);
}

#[tokio::test]
async fn second_pull_without_remote_changes_is_a_no_op() {
    let h = harness().await;
    seed_list(&h);
    h.tasks.put(remote_task("g1", "Buy milk", "2025-03-01T08:00:00Z"));
    h.engine.pull_tasks().await.unwrap();
    let before = h.store.find_by_gtasks_id("g1").await.unwrap().unwrap();

    let report = h.engine.pull_tasks().await.unwrap();

    assert_eq!(report.mutations(), 0);
    assert_eq!(h.store.get(before.id).await.unwrap().unwrap(), before);
    assert_eq!(h.store.count_pending().await.unwrap(), 0);
    let queries = h.tasks.queries.lock().unwrap().clone();
    assert!(queries[0].updated_min.is_none());
    assert!(queries[1].updated_min.is_some());
    assert!(queries[1].show_deleted && queries[1].show_completed);
    assert!(h.engine.cursors.get(Backend::Tasks).await.unwrap().is_some());
}

#[tokio::test]
async fn dirty_mapping_suppresses_merge() {
    let h = harness().await;
    seed_list(&h);
    let task = h
        .store
        .add(NewTask {
            title: "Local edit".into(),
            gtasks_id: Some("g1".into()),
            updated_at: Some(datetime!(2025-03-01 09:00 UTC)),
            ..NewTask::default()
        })
        .await
        .unwrap();
    h.store
        .upsert_mapping(task.id, "g1", "list-1", None, datetime!(2025-03-01 09:00 UTC))
        .await
        .unwrap();
    h.store.mark_dirty(task.id).await.unwrap();
    h.tasks.put(remote_task("g1", "Remote edit", "2025-03-01T12:00:00Z"));

    let report = h.engine.pull_tasks().await.unwrap();

    assert_eq!(report.mutations(), 0);
    assert_eq!(h.store.get(task.id).await.unwrap().unwrap().title, "Local edit");
}

#[tokio::test]
async fn newer_local_task_is_kept_and_push_queued() {
    let h = harness().await;
    seed_list(&h);
    let task = h
        .store
        .add(NewTask {
            title: "Local".into(),
            gtasks_id: Some("g1".into()),
            gtasks_updated: Some(datetime!(2025-03-01 08:00 UTC)),
            updated_at: Some(datetime!(2025-03-01 12:00 UTC)),
            ..NewTask::default()
        })
        .await
        .unwrap();
    h.tasks.put(remote_task("g1", "Remote", "2025-03-01T10:00:00Z"));

    let report = h.engine.pull_tasks().await.unwrap();

    assert_eq!(report.deferred, 1);
    let after = h.store.get(task.id).await.unwrap().unwrap();
    assert_eq!(after.title, "Local");
    assert_eq!(after.updated_at, task.updated_at);
    let ops = h.store.ops_for_task(task.id).await.unwrap();
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].kind, PendingOpKind::GtasksUpdate);
    assert!(h.store.get_mapping(task.id).await.unwrap().unwrap().dirty);
}

#[tokio::test]
async fn deleted_item_unlinks_but_keeps_task() {
    let h = harness().await;
    seed_list(&h);
    let task = h
        .store
        .add(NewTask {
            title: "Keep me".into(),
            gtasks_id: Some("g1".into()),
            ..NewTask::default()
        })
        .await
        .unwrap();
    h.store
        .upsert_mapping(task.id, "g1", "list-1", None, datetime!(2025-03-01 09:00 UTC))
        .await
        .unwrap();
    h.tasks.put(RemoteTask {
        deleted: Some(true),
        ..remote_task("g1", "Keep me", "2025-03-02T09:00:00Z")
    });

    let report = h.engine.pull_tasks().await.unwrap();

    assert_eq!(report.unlinked, 1);
    let after = h.store.get(task.id).await.unwrap().unwrap();
    assert_eq!(after.title, "Keep me");
    assert_eq!(after.gtasks_id, None);
    assert!(h.store.get_mapping(task.id).await.unwrap().is_none());

    let again = h.engine.pull_tasks().await.unwrap();
    assert_eq!(again.mutations(), 0);
}

#[tokio::test]
async fn subtasks_are_ignored() {
    let h = harness().await;
    seed_list(&h);
    h.tasks.put(RemoteTask {
        parent: Some("g0".into()),
        ..remote_task("g2", "Step", "2025-03-01T08:00:00Z")
    });

    let report = h.engine.pull_tasks().await.unwrap();

    assert_eq!(report.skipped, 1);
    assert!(h.store.list_unscheduled().await.unwrap().is_empty());
}

#[tokio::test]
async fn completed_item_marks_task_done() {
    let h = harness().await;
    seed_list(&h);
    h.tasks.put(RemoteTask {
        status: Some("completed".into()),
        completed: Some("2025-03-01T08:00:00Z".into()),
        ..remote_task("g1", "Done remotely", "2025-03-01T08:00:00Z")
    });

    h.engine.pull_tasks().await.unwrap();

    let task = h.store.find_by_gtasks_id("g1").await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Done);
}

#[tokio::test]
async fn scheduled_task_is_never_merged_from_tasks_backend() {
    let h = harness().await;
    seed_list(&h);
    let task = h
        .store
        .add(NewTask {
            title: "On calendar".into(),
            start: Some(datetime!(2025-03-03 09:00 UTC)),
            gtasks_id: Some("g1".into()),
            ..NewTask::default()
        })
        .await
        .unwrap();
    h.tasks.put(remote_task("g1", "Stale copy", "2025-03-05T08:00:00Z"));

    let report = h.engine.pull_tasks().await.unwrap();

    assert_eq!(report.skipped, 1);
    assert_eq!(h.store.get(task.id).await.unwrap().unwrap().title, "On calendar");
}
