use std::sync::Arc;

use planner_core::{GoogleClient, StaticCredentials, TaskBody, TaskQuery, TasksService};
use serde_json::json;
use wiremock::matchers::{body_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client(server: &MockServer) -> GoogleClient {
    GoogleClient::with_base_url(&server.uri(), Arc::new(StaticCredentials::new("test-token")))
        .unwrap()
}

#[tokio::test]
async fn find_or_create_matches_title_case_insensitively() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/tasks/v1/users/@me/lists"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [
                { "id": "default", "title": "My Tasks" },
                { "id": "inbox", "title": "planner inbox" }
            ]
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/tasks/v1/users/@me/lists"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;

    let list = client(&server)
        .find_or_create_tasklist("Planner Inbox")
        .await
        .unwrap();
    assert_eq!(list.id, "inbox");
}

#[tokio::test]
async fn find_or_create_creates_missing_list() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/tasks/v1/users/@me/lists"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "items": [] })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/tasks/v1/users/@me/lists"))
        .and(body_json(json!({ "title": "Planner Inbox" })))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "id": "new-list", "title": "Planner Inbox" })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let list = client(&server)
        .find_or_create_tasklist("Planner Inbox")
        .await
        .unwrap();
    assert_eq!(list.id, "new-list");
}

#[tokio::test]
async fn list_tasks_passes_watermark_and_visibility_flags() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/tasks/v1/lists/inbox/tasks"))
        .and(query_param("updatedMin", "2025-03-01T00:00:00Z"))
        .and(query_param("showDeleted", "true"))
        .and(query_param("showCompleted", "true"))
        .and(query_param("showHidden", "true"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [
                { "id": "g1", "title": "A2", "status": "needsAction", "updated": "2025-03-02T00:00:00.000Z" },
                { "id": "g2", "title": "child", "parent": "g1" },
                { "id": "g3", "deleted": true }
            ],
            "nextPageToken": "p2"
        })))
        .mount(&server)
        .await;

    let query = TaskQuery {
        updated_min: Some("2025-03-01T00:00:00Z".into()),
        show_completed: true,
        show_deleted: true,
        show_hidden: true,
        ..TaskQuery::default()
    };
    let page = client(&server).list_tasks("inbox", &query).await.unwrap();

    assert_eq!(page.items.len(), 3);
    assert!(!page.items[0].is_completed());
    assert!(page.items[1].is_subtask());
    assert!(page.items[2].is_deleted());
    assert_eq!(page.next_page_token.as_deref(), Some("p2"));
}

#[tokio::test]
async fn patch_task_clears_completion_with_null() {
    let server = MockServer::start().await;

    Mock::given(method("PATCH"))
        .and(path("/tasks/v1/lists/inbox/tasks/g1"))
        .and(body_json(json!({
            "title": "Again",
            "status": "needsAction",
            "completed": null
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "g1",
            "title": "Again",
            "status": "needsAction"
        })))
        .mount(&server)
        .await;

    let body = TaskBody {
        title: Some("Again".into()),
        status: Some("needsAction".into()),
        completed: Some(None),
        ..TaskBody::default()
    };
    let task = client(&server)
        .patch_task("inbox", "g1", &body, None)
        .await
        .unwrap();
    assert_eq!(task.title.as_deref(), Some("Again"));
}

#[tokio::test]
async fn stale_etag_is_a_precondition_failure() {
    let server = MockServer::start().await;

    Mock::given(method("PATCH"))
        .and(path("/tasks/v1/lists/inbox/tasks/g1"))
        .respond_with(ResponseTemplate::new(412))
        .mount(&server)
        .await;

    let err = client(&server)
        .patch_task("inbox", "g1", &TaskBody::default(), Some("old"))
        .await
        .unwrap_err();
    assert_eq!(
        err.classification(),
        Some(planner_core::ApiErrorClass::PreconditionFailed)
    );
}
