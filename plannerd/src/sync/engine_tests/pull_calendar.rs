use planner_core::{EventDateTime, StatusCode};
use time::macros::datetime;
use time::Duration;

use super::fakes::*;
use crate::storage::Backend;
use crate::sync::clock;
use crate::sync::engine::{EngineError, SyncWarning};
use crate::sync::marker;
use crate::sync::queue::PendingOpKind;
use crate::sync::task_store::{NewTask, TaskStore};

#[tokio::test]
async fn new_event_creates_task_and_writes_marker() {
    let h = harness().await;
    h.calendar.put(timed_event(
        "e1",
        "Standup",
        "2025-03-03T09:00:00Z",
        "2025-03-03T09:45:00Z",
        "2025-03-01T08:00:00Z",
    ));

    let report = h.engine.pull_calendar().await.unwrap();

    assert_eq!(report.created, 1);
    assert!(report.full_resync);
    let task = h.store.find_by_event_id("e1").await.unwrap().unwrap();
    assert_eq!(task.title, "Standup");
    assert_eq!(task.start, Some(datetime!(2025-03-03 09:00 UTC)));
    assert_eq!(task.duration_minutes, Some(45));
    assert_eq!(task.updated_at, datetime!(2025-03-01 08:00 UTC));

    let remote = h.calendar.event("e1").unwrap();
    assert_eq!(
        marker::find_marker(remote.description.as_deref().unwrap()),
        Some(task.id)
    );
    assert_eq!(task.gcal_etag, remote.etag);

    let query = h.calendar.queries.lock().unwrap()[0].clone();
    assert!(query.sync_token.is_none());
    assert!(query.show_deleted);
    let time_min = clock::parse_rfc3339(query.time_min.as_deref().unwrap()).unwrap();
    assert!(time_min >= clock::now_utc() - Duration::days(91));
    assert!(time_min <= clock::now_utc() - Duration::days(89));
}

#[tokio::test]
async fn second_pull_without_remote_changes_is_a_no_op() {
    let h = harness().await;
    h.calendar.put(timed_event(
        "e1",
        "Standup",
        "2025-03-03T09:00:00Z",
        "2025-03-03T09:30:00Z",
        "2025-03-01T08:00:00Z",
    ));
    h.engine.pull_calendar().await.unwrap();
    let before = h.store.find_by_event_id("e1").await.unwrap().unwrap();
    let patches = h.calendar.patches.lock().unwrap().len();

    let report = h.engine.pull_calendar().await.unwrap();

    assert_eq!(report.mutations(), 0);
    assert_eq!(report.skipped, 1);
    assert!(!report.full_resync);
    let after = h.store.get(before.id).await.unwrap().unwrap();
    assert_eq!(before, after);
    assert_eq!(h.calendar.patches.lock().unwrap().len(), patches);
    assert_eq!(h.store.count_pending().await.unwrap(), 0);
    let second = h.calendar.queries.lock().unwrap()[1].clone();
    assert!(second.sync_token.is_some());
    assert!(second.time_min.is_none());
}

#[tokio::test]
async fn newer_remote_event_overwrites_local_fields() {
    let h = harness().await;
    let task = h
        .store
        .add(NewTask {
            title: "Local".into(),
            start: Some(datetime!(2025-03-03 09:00 UTC)),
            duration_minutes: Some(30),
            gcal_event_id: Some("e1".into()),
            gcal_updated: Some(datetime!(2025-03-01 09:00 UTC)),
            updated_at: Some(datetime!(2025-03-01 10:00 UTC)),
            ..NewTask::default()
        })
        .await
        .unwrap();
    let mut event = timed_event(
        "e1",
        "Remote",
        "2025-03-04T14:00:00Z",
        "2025-03-04T15:00:00Z",
        "2025-03-01T11:00:00Z",
    );
    event.description = Some(format!("agenda\n{}", marker::marker_for(task.id)));
    h.calendar.put(event);

    let report = h.engine.pull_calendar().await.unwrap();

    assert_eq!(report.updated, 1);
    let task = h.store.get(task.id).await.unwrap().unwrap();
    assert_eq!(task.title, "Remote");
    assert_eq!(task.notes.as_deref(), Some("agenda"));
    assert_eq!(task.start, Some(datetime!(2025-03-04 14:00 UTC)));
    assert_eq!(task.duration_minutes, Some(60));
    assert_eq!(task.gcal_updated, Some(datetime!(2025-03-01 11:00 UTC)));
    assert!(h.calendar.patches.lock().unwrap().is_empty());
    assert_eq!(h.store.count_pending().await.unwrap(), 0);
}

#[tokio::test]
async fn newer_local_task_is_kept_and_push_queued() {
    let h = harness().await;
    let task = h
        .store
        .add(NewTask {
            title: "Local wins".into(),
            start: Some(datetime!(2025-03-03 09:00 UTC)),
            gcal_event_id: Some("e1".into()),
            gcal_updated: Some(datetime!(2025-03-01 09:00 UTC)),
            updated_at: Some(datetime!(2025-03-01 12:00 UTC)),
            ..NewTask::default()
        })
        .await
        .unwrap();
    h.calendar.put(timed_event(
        "e1",
        "Remote edit",
        "2025-03-03T10:00:00Z",
        "2025-03-03T10:30:00Z",
        "2025-03-01T11:00:00Z",
    ));

    let report = h.engine.pull_calendar().await.unwrap();

    assert_eq!(report.deferred, 1);
    let after = h.store.get(task.id).await.unwrap().unwrap();
    assert_eq!(after.title, "Local wins");
    assert_eq!(after.start, task.start);
    assert_eq!(after.updated_at, task.updated_at);
    assert_eq!(after.gcal_updated, Some(datetime!(2025-03-01 11:00 UTC)));
    let ops = h.store.ops_for_task(task.id).await.unwrap();
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].kind, PendingOpKind::GcalUpdate);
    assert_eq!(ops[0].payload, r#"{"eventId":"e1"}"#);

    // The seen revision is recorded, so the next pull does not queue again.
    let again = h.engine.pull_calendar().await.unwrap();
    assert_eq!(again.mutations(), 0);
    assert_eq!(h.store.ops_for_task(task.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn cancelled_event_unschedules_but_keeps_task() {
    let h = harness().await;
    let task = h
        .store
        .add(NewTask {
            title: "Dentist".into(),
            start: Some(datetime!(2025-03-03 09:00 UTC)),
            duration_minutes: Some(30),
            gcal_event_id: Some("e1".into()),
            gcal_etag: Some("etag".into()),
            ..NewTask::default()
        })
        .await
        .unwrap();
    let mut event = timed_event(
        "e1",
        "Dentist",
        "2025-03-03T09:00:00Z",
        "2025-03-03T09:30:00Z",
        "2025-03-02T08:00:00Z",
    );
    event.status = Some("cancelled".into());
    h.calendar.put(event);

    let report = h.engine.pull_calendar().await.unwrap();

    assert_eq!(report.unlinked, 1);
    let after = h.store.get(task.id).await.unwrap().unwrap();
    assert_eq!(after.title, "Dentist");
    assert_eq!(after.start, None);
    assert_eq!(after.gcal_event_id, None);
    assert_eq!(after.gcal_etag, None);

    let again = h.engine.pull_calendar().await.unwrap();
    assert_eq!(again.mutations(), 0);
}

#[tokio::test]
async fn expired_token_runs_exactly_one_bounded_resync() {
    let h = harness().await;
    h.engine
        .cursors
        .set(Backend::Calendar, "stale-token")
        .await
        .unwrap();
    *h.calendar.expire_tokens.lock().unwrap() = 1;
    h.calendar.put(timed_event(
        "e1",
        "Review",
        "2025-03-03T09:00:00Z",
        "2025-03-03T09:30:00Z",
        "2025-03-01T08:00:00Z",
    ));

    let report = h.engine.pull_calendar().await.unwrap();

    assert!(report.full_resync);
    assert_eq!(report.created, 1);
    let queries = h.calendar.queries.lock().unwrap().clone();
    assert_eq!(queries.len(), 2);
    assert_eq!(queries[0].sync_token.as_deref(), Some("stale-token"));
    assert!(queries[1].sync_token.is_none());
    assert!(queries[1].time_min.is_some());
    let cursor = h.engine.cursors.get(Backend::Calendar).await.unwrap();
    assert!(cursor.is_some_and(|token| token.starts_with("tok-")));
}

#[tokio::test]
async fn expiry_during_resync_is_not_retried_again() {
    let h = harness().await;
    h.engine
        .cursors
        .set(Backend::Calendar, "stale-token")
        .await
        .unwrap();
    *h.calendar.expire_always.lock().unwrap() = true;

    let err = h.engine.pull_calendar().await.unwrap_err();

    assert!(matches!(err, EngineError::CursorExpiredAfterResync));
    assert_eq!(h.calendar.queries.lock().unwrap().len(), 2);
    assert_eq!(h.engine.cursors.get(Backend::Calendar).await.unwrap(), None);
}

#[tokio::test]
async fn cursor_is_kept_when_a_later_page_fails() {
    let h = harness().await;
    *h.calendar.page_size.lock().unwrap() = 1;
    *h.calendar.fail_page.lock().unwrap() = Some(1);
    for (id, hour) in [("e1", "09"), ("e2", "11")] {
        h.calendar.put(timed_event(
            id,
            "Block",
            &format!("2025-03-03T{hour}:00:00Z"),
            &format!("2025-03-03T{hour}:30:00Z"),
            "2025-03-01T08:00:00Z",
        ));
    }

    let err = h.engine.pull_calendar().await.unwrap_err();

    assert!(matches!(err, EngineError::Remote(_)));
    assert_eq!(h.engine.cursors.get(Backend::Calendar).await.unwrap(), None);
    assert_eq!(h.engine.cursors.last_pull_at(Backend::Calendar).await.unwrap(), None);

    // The next attempt starts from the bounded window again and picks up both pages.
    *h.calendar.fail_page.lock().unwrap() = None;
    let report = h.engine.pull_calendar().await.unwrap();
    assert!(report.full_resync);
    assert_eq!(report.created, 1);
    assert!(h.store.find_by_event_id("e2").await.unwrap().is_some());
}

#[tokio::test]
async fn marker_write_failure_is_reported_as_warning() {
    let h = harness().await;
    *h.calendar.fail_patch.lock().unwrap() = Some(api_error(StatusCode::INTERNAL_SERVER_ERROR));
    h.calendar.put(timed_event(
        "e1",
        "Lunch",
        "2025-03-03T12:00:00Z",
        "2025-03-03T13:00:00Z",
        "2025-03-01T08:00:00Z",
    ));

    let report = h.engine.pull_calendar().await.unwrap();

    assert_eq!(report.created, 1);
    let task = h.store.find_by_event_id("e1").await.unwrap().unwrap();
    assert!(matches!(
        report.warnings.as_slice(),
        [SyncWarning::MarkerWriteFailed { task_id, event_id, .. }]
            if *task_id == task.id && event_id == "e1"
    ));
}

#[tokio::test]
async fn all_day_event_spans_the_whole_day() {
    let h = harness().await;
    let mut event = timed_event("e1", "Holiday", "", "", "2025-03-01T08:00:00Z");
    event.start = Some(EventDateTime {
        date: Some("2025-03-05".into()),
        ..EventDateTime::default()
    });
    event.end = Some(EventDateTime {
        date: Some("2025-03-06".into()),
        ..EventDateTime::default()
    });
    h.calendar.put(event);

    h.engine.pull_calendar().await.unwrap();

    let task = h.store.find_by_event_id("e1").await.unwrap().unwrap();
    assert_eq!(task.start, Some(datetime!(2025-03-05 00:00 UTC)));
    assert_eq!(task.duration_minutes, Some(24 * 60));
}

#[tokio::test]
async fn marker_links_event_to_task_whose_link_was_never_recorded() {
    let h = harness().await;
    let task = h
        .store
        .add(NewTask {
            title: "Planned".into(),
            start: Some(datetime!(2025-03-03 09:00 UTC)),
            updated_at: Some(datetime!(2025-03-01 07:00 UTC)),
            ..NewTask::default()
        })
        .await
        .unwrap();
    let mut event = timed_event(
        "e7",
        "Planned",
        "2025-03-03T09:00:00Z",
        "2025-03-03T09:30:00Z",
        "2025-03-01T08:00:00Z",
    );
    event.description = Some(marker::marker_for(task.id));
    h.calendar.put(event);

    let report = h.engine.pull_calendar().await.unwrap();

    assert_eq!(report.created, 0);
    assert_eq!(report.updated, 1);
    let task = h.store.get(task.id).await.unwrap().unwrap();
    assert_eq!(task.gcal_event_id.as_deref(), Some("e7"));
    assert_eq!(h.store.list_scheduled().await.unwrap().len(), 1);
}
