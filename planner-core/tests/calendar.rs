use std::sync::Arc;

use planner_core::{
    ApiErrorClass, CalendarService, EventBody, EventDateTime, EventQuery, GoogleClient,
    StaticCredentials,
};
use serde_json::json;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client(server: &MockServer) -> GoogleClient {
    GoogleClient::with_base_url(&server.uri(), Arc::new(StaticCredentials::new("test-token")))
        .unwrap()
}

#[tokio::test]
async fn list_events_uses_sync_token_and_bearer_header() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/calendar/v3/calendars/primary/events"))
        .and(header("authorization", "Bearer test-token"))
        .and(query_param("syncToken", "tok-1"))
        .and(query_param("showDeleted", "true"))
        .and(query_param("singleEvents", "true"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [
                {
                    "id": "e1",
                    "status": "confirmed",
                    "summary": "Write report",
                    "description": "planner_task_id:1",
                    "start": { "dateTime": "2025-03-01T09:00:00Z" },
                    "end": { "dateTime": "2025-03-01T10:00:00Z" },
                    "updated": "2025-03-01T08:00:00.000Z"
                },
                { "id": "e2", "status": "cancelled" }
            ],
            "nextSyncToken": "tok-2"
        })))
        .mount(&server)
        .await;

    let query = EventQuery {
        sync_token: Some("tok-1".into()),
        time_min: Some("2025-01-01T00:00:00Z".into()),
        show_deleted: true,
        ..EventQuery::default()
    };
    let page = client(&server).list_events("primary", &query).await.unwrap();

    assert_eq!(page.items.len(), 2);
    assert_eq!(page.items[0].summary.as_deref(), Some("Write report"));
    assert!(page.items[1].is_cancelled());
    assert_eq!(page.next_sync_token.as_deref(), Some("tok-2"));
    assert!(page.next_page_token.is_none());
}

#[tokio::test]
async fn expired_sync_token_is_classified_as_gone() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/calendar/v3/calendars/primary/events"))
        .respond_with(ResponseTemplate::new(410).set_body_string("fullSyncRequired"))
        .mount(&server)
        .await;

    let query = EventQuery {
        sync_token: Some("stale".into()),
        ..EventQuery::default()
    };
    let err = client(&server)
        .list_events("primary", &query)
        .await
        .unwrap_err();

    assert_eq!(err.classification(), Some(ApiErrorClass::Gone));
}

#[tokio::test]
async fn patch_event_sends_if_match() {
    let server = MockServer::start().await;

    Mock::given(method("PATCH"))
        .and(path("/calendar/v3/calendars/primary/events/e1"))
        .and(header("if-match", "\"etag-1\""))
        .and(body_json(json!({
            "summary": "Renamed",
            "start": { "dateTime": "2025-03-01T09:00:00Z" },
            "end": { "dateTime": "2025-03-01T09:30:00Z" }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "e1",
            "summary": "Renamed",
            "updated": "2025-03-01T09:05:00.000Z",
            "etag": "\"etag-2\""
        })))
        .mount(&server)
        .await;

    let body = EventBody {
        summary: Some("Renamed".into()),
        start: Some(EventDateTime::at("2025-03-01T09:00:00Z")),
        end: Some(EventDateTime::at("2025-03-01T09:30:00Z")),
        ..EventBody::default()
    };
    let event = client(&server)
        .patch_event("primary", "e1", &body, Some("\"etag-1\""))
        .await
        .unwrap();

    assert_eq!(event.etag.as_deref(), Some("\"etag-2\""));
}

#[tokio::test]
async fn deleting_a_missing_event_succeeds() {
    let server = MockServer::start().await;

    Mock::given(method("DELETE"))
        .and(path("/calendar/v3/calendars/primary/events/gone"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    client(&server)
        .delete_event("primary", "gone")
        .await
        .unwrap();
}

#[tokio::test]
async fn rate_limit_carries_retry_after() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/calendar/v3/calendars/primary/events"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "12"))
        .mount(&server)
        .await;

    let err = client(&server)
        .insert_event("primary", &EventBody::default())
        .await
        .unwrap_err();

    assert!(err.is_retryable());
    assert_eq!(err.retry_after_secs(), Some(12));
}
