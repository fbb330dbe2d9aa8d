use std::sync::Arc;

use planner_core::{ApiErrorClass, BlobStore, GoogleClient, StaticCredentials};
use serde_json::json;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client(server: &MockServer) -> GoogleClient {
    GoogleClient::with_base_url(&server.uri(), Arc::new(StaticCredentials::new("test-token")))
        .unwrap()
}

#[tokio::test]
async fn read_returns_none_when_file_is_absent() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/drive/v3/files"))
        .and(query_param("spaces", "appDataFolder"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "files": [] })))
        .mount(&server)
        .await;

    let blob = client(&server).read("gtasks_index.json").await.unwrap();
    assert!(blob.is_none());
}

#[tokio::test]
async fn read_downloads_content_with_etag() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/drive/v3/files"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "files": [{ "id": "f1", "name": "gtasks_index.json", "version": "3" }]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/drive/v3/files/f1"))
        .and(query_param("alt", "media"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("ETag", "\"rev-3\"")
                .set_body_json(json!({ "version": 1, "tasks": {} })),
        )
        .mount(&server)
        .await;

    let blob = client(&server)
        .read("gtasks_index.json")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(blob.value["version"], 1);
    assert_eq!(blob.revision.as_deref(), Some("\"rev-3\""));
}

#[tokio::test]
async fn write_uploads_with_if_match() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/drive/v3/files"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "files": [{ "id": "f1", "name": "planner_config.json" }]
        })))
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .and(path("/upload/drive/v3/files/f1"))
        .and(query_param("uploadType", "media"))
        .and(header("if-match", "\"rev-3\""))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "f1", "version": "4" })))
        .mount(&server)
        .await;

    let revision = client(&server)
        .write("planner_config.json", &json!({ "a": 1 }), Some("\"rev-3\""))
        .await
        .unwrap();
    assert_eq!(revision, "4");
}

#[tokio::test]
async fn write_creates_file_then_reports_conflicts() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/drive/v3/files"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "files": [] })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/drive/v3/files"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "f9" })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .and(path("/upload/drive/v3/files/f9"))
        .respond_with(ResponseTemplate::new(412))
        .mount(&server)
        .await;

    let err = client(&server)
        .write("gtasks_index.json", &json!({}), Some("stale"))
        .await
        .unwrap_err();
    assert_eq!(err.classification(), Some(ApiErrorClass::PreconditionFailed));
}
