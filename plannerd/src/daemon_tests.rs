use std::collections::HashMap;

use super::*;
use crate::storage::CursorSnapshot;
use crate::sync::task_store::TaskStore;
use planner_core::{CredentialError, GoogleError, StatusCode};
use serde_json::json;
use tempfile::tempdir;
use time::macros::datetime;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config_from(vars: &HashMap<&str, String>, default_data_dir: &Path) -> DaemonConfig {
    DaemonConfig::from_lookup(
        |name| vars.get(name).cloned(),
        Path::new("/tmp/home-user"),
        default_data_dir.to_path_buf(),
    )
}

async fn runtime_against(server: &MockServer, data_dir: &Path) -> DaemonRuntime {
    let vars = HashMap::from([
        ("PLANNER_API_BASE", server.uri()),
        ("PLANNER_ACCESS_TOKEN", "test-token".to_string()),
        ("PLANNER_USE_APPDATA", "false".to_string()),
        ("PLANNER_DEVICE_ID", "DEVICEA".to_string()),
        ("PLANNER_DATA_DIR", data_dir.display().to_string()),
    ]);
    DaemonRuntime::bootstrap(config_from(&vars, Path::new("/nonexistent")))
        .await
        .unwrap()
}

#[test]
fn expands_tilde_to_home_data_dir() {
    let home = PathBuf::from("/tmp/home-user");
    assert_eq!(
        expand_with_home("~/planner", &home),
        PathBuf::from("/tmp/home-user/planner")
    );
    assert_eq!(expand_with_home("~", &home), home);
    assert_eq!(expand_with_home("/var/lib/planner", &home), PathBuf::from("/var/lib/planner"));
}

#[test]
fn config_defaults_live_under_data_dir() {
    let config = config_from(&HashMap::new(), Path::new("/data/planner"));

    assert_eq!(config.db_path, PathBuf::from("/data/planner/planner.db"));
    assert_eq!(config.cursor_path, PathBuf::from("/data/planner/sync_cursor.json"));
    assert_eq!(config.pull_interval, Duration::from_secs(60));
    assert_eq!(config.push_interval, Duration::from_secs(15));
    assert_eq!(config.pause_after_failures, 3);
    assert!(config.use_appdata);
    assert!(config.access_token.is_none());
    assert_eq!(config.settings.calendar_id, "primary");
    assert_eq!(config.settings.tasklist_title, "Planner Inbox");
    assert_eq!(config.settings.max_attempts, 0);
    assert!(!config.settings.notes_metadata);
}

#[test]
fn config_reads_overrides() {
    let vars = HashMap::from([
        ("PLANNER_DATA_DIR", "~/plans".to_string()),
        ("PLANNER_CURSOR_PATH", "/tmp/cursor.json".to_string()),
        ("PLANNER_CALENDAR_ID", "work@group.calendar".to_string()),
        ("PLANNER_PULL_SECS", "0".to_string()),
        ("PLANNER_PUSH_SECS", "5".to_string()),
        ("PLANNER_MAX_ATTEMPTS", "8".to_string()),
        ("PLANNER_NOTES_METADATA", "yes".to_string()),
        ("PLANNER_USE_APPDATA", "off".to_string()),
        ("PLANNER_LOOKBACK_DAYS", "nonsense".to_string()),
        ("PLANNER_ACCESS_TOKEN", "  ".to_string()),
    ]);
    let config = config_from(&vars, Path::new("/data/planner"));

    assert_eq!(config.data_dir, PathBuf::from("/tmp/home-user/plans"));
    assert_eq!(config.db_path, PathBuf::from("/tmp/home-user/plans/planner.db"));
    assert_eq!(config.cursor_path, PathBuf::from("/tmp/cursor.json"));
    assert_eq!(config.settings.calendar_id, "work@group.calendar");
    assert_eq!(config.pull_interval, Duration::from_secs(60));
    assert_eq!(config.push_interval, Duration::from_secs(5));
    assert_eq!(config.settings.max_attempts, 8);
    assert_eq!(config.settings.lookback_days, 90);
    assert!(config.settings.notes_metadata);
    assert!(!config.use_appdata);
    assert!(config.access_token.is_none());
}

#[test]
fn config_caps_oversized_window_values() {
    let vars = HashMap::from([
        ("PLANNER_LOOKBACK_DAYS", u64::MAX.to_string()),
        ("PLANNER_DEFAULT_DURATION_MIN", i64::MAX.to_string()),
    ]);
    let config = config_from(&vars, Path::new("/data/planner"));

    assert_eq!(config.settings.lookback_days, MAX_LOOKBACK_DAYS);
    assert_eq!(config.settings.default_duration_min, MAX_DEFAULT_DURATION_MIN);

    let vars = HashMap::from([
        ("PLANNER_LOOKBACK_DAYS", "-5".to_string()),
        ("PLANNER_DEFAULT_DURATION_MIN", "45".to_string()),
    ]);
    let config = config_from(&vars, Path::new("/data/planner"));

    assert_eq!(config.settings.lookback_days, 90);
    assert_eq!(config.settings.default_duration_min, 45);
}

#[test]
fn health_pauses_after_repeated_failures() {
    let mut health = SyncHealth::new(3);
    let now = Instant::now();
    let err = EngineError::Remote(GoogleError::api(StatusCode::SERVICE_UNAVAILABLE, "down"));

    assert_eq!(health.record_failure(&err, now), None);
    assert_eq!(health.record_failure(&err, now), None);
    assert!(!health.is_paused(now));

    let pause = health.record_failure(&err, now).unwrap();
    assert!(pause >= Duration::from_secs(PAUSE_BASE_SECS / 2));
    assert!(pause <= Duration::from_secs(PAUSE_BASE_SECS));
    assert!(health.is_paused(now));
    assert!(!health.is_paused(now + pause));

    health.record_success();
    assert!(!health.is_paused(now));
    assert_eq!(health.record_failure(&err, now), None);
}

#[test]
fn health_pauses_at_once_on_credential_failure() {
    let mut health = SyncHealth::new(3);
    let now = Instant::now();

    let pause = health.record_failure(&EngineError::Credentials(CredentialError::Missing), now);

    assert!(pause.is_some());
    assert!(health.is_paused(now));
}

#[test]
fn busy_ticks_are_not_failures() {
    let mut health = SyncHealth::new(1);
    let now = Instant::now();
    assert_eq!(health.record_failure(&EngineError::Busy, now), None);
    assert!(!health.is_paused(now));
}

#[test]
fn status_lists_timestamps_and_queue_depth() {
    let status = SyncStatus {
        cursors: CursorSnapshot {
            calendar_token: Some("tok".into()),
            calendar_last_pull_at: Some(datetime!(2025-03-01 10:00 UTC)),
            ..CursorSnapshot::default()
        },
        pending: 2,
        dead: 1,
        running: false,
    };

    let text = format_status(&status);

    assert!(text.contains("calendar last pull: 2025-03-01T10:00:00Z"));
    assert!(text.contains("last push:          never"));
    assert!(text.contains("calendar cursor:    set"));
    assert!(text.contains("pending operations: 2"));
    assert!(text.contains("dead letters:       1"));
    assert!(!text.contains("running"));
}

#[tokio::test]
async fn run_once_pulls_both_backends_over_http() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();

    Mock::given(method("GET"))
        .and(path("/calendar/v3/calendars/primary/events"))
        .and(header("Authorization", "Bearer test-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [{
                "id": "e1",
                "status": "confirmed",
                "summary": "Standup",
                "start": { "dateTime": "2025-03-03T09:00:00Z" },
                "end": { "dateTime": "2025-03-03T09:15:00Z" },
                "updated": "2025-03-01T08:00:00.000Z",
                "etag": "\"p1\""
            }],
            "nextSyncToken": "sync-1"
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .and(path("/calendar/v3/calendars/primary/events/e1"))
        .and(header("If-Match", "\"p1\""))
        .and(body_string_contains("planner_task_id:1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "e1",
            "status": "confirmed",
            "summary": "Standup",
            "description": "planner_task_id:1",
            "start": { "dateTime": "2025-03-03T09:00:00Z" },
            "end": { "dateTime": "2025-03-03T09:15:00Z" },
            "updated": "2025-03-01T08:00:05.000Z",
            "etag": "\"p2\""
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/tasks/v1/users/@me/lists"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [{ "id": "inbox", "title": "Planner Inbox" }]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/tasks/v1/lists/inbox/tasks"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [{
                "id": "g1",
                "title": "Buy milk",
                "status": "needsAction",
                "updated": "2025-03-01T07:00:00.000Z",
                "etag": "\"t1\""
            }]
        })))
        .mount(&server)
        .await;

    let runtime = runtime_against(&server, dir.path()).await;
    let report = runtime.run_once().await.unwrap();

    assert_eq!(report.calendar.created, 1);
    assert!(report.calendar.warnings.is_empty());
    assert_eq!(report.tasks.created, 1);
    assert_eq!(report.push.processed, 0);

    let index = runtime.engine().index();
    let meeting = index.find_by_event_id("e1").await.unwrap().unwrap();
    assert_eq!(meeting.title, "Standup");
    assert_eq!(meeting.start, Some(datetime!(2025-03-03 09:00 UTC)));
    assert_eq!(meeting.duration_minutes, Some(15));
    assert_eq!(meeting.gcal_etag.as_deref(), Some("\"p2\""));
    let inbox = index.find_by_gtasks_id("g1").await.unwrap().unwrap();
    assert_eq!(inbox.title, "Buy milk");
    assert_eq!(inbox.start, None);

    let status = runtime.status().await.unwrap();
    assert_eq!(status.cursors.calendar_token.as_deref(), Some("sync-1"));
    assert!(status.cursors.tasks_last_pull_at.is_some());
    assert_eq!(status.pending, 0);
    assert!(dir.path().join("planner.db").exists());
}

#[tokio::test]
async fn rejected_token_surfaces_as_credential_failure() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();

    Mock::given(method("GET"))
        .and(path("/calendar/v3/calendars/primary/events"))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid credentials"))
        .mount(&server)
        .await;

    let runtime = runtime_against(&server, dir.path()).await;
    let err = runtime.run_once().await.unwrap_err();

    let engine_err = err.downcast_ref::<EngineError>().unwrap();
    assert!(engine_err.is_credential_failure());
    assert!(!runtime.engine().is_running());
}
