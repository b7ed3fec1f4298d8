use serde_json::json;
use todoist_core::{ApiErrorClass, NewTask, TaskUpdate, TodoistClient, TodoistError};
use wiremock::matchers::{body_json, body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn get_task_sends_bearer_token() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/rest/v2/tasks/42"))
        .and(header("authorization", "Bearer test-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "42",
            "content": "Buy milk",
            "description": "",
            "project_id": "p1",
            "labels": ["home"],
            "priority": 2,
            "is_completed": false,
            "url": "https://todoist.com/showTask?id=42"
        })))
        .mount(&server)
        .await;

    let client = TodoistClient::with_base_url(&server.uri(), "test-token").unwrap();
    let task = client.get_task("42").await.unwrap();

    assert_eq!(task.content, "Buy milk");
    assert_eq!(task.priority, 2);
    assert_eq!(task.labels, vec!["home".to_string()]);
    assert_eq!(
        task.extra.get("url"),
        Some(&json!("https://todoist.com/showTask?id=42"))
    );
}

#[tokio::test]
async fn missing_task_is_not_found() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/rest/v2/tasks/missing"))
        .respond_with(ResponseTemplate::new(404).set_body_string("Task not found"))
        .mount(&server)
        .await;

    let client = TodoistClient::with_base_url(&server.uri(), "test-token").unwrap();
    let err = client.get_task("missing").await.unwrap_err();

    assert!(err.is_not_found());
    assert_eq!(err.classification(), Some(ApiErrorClass::Permanent));
}

#[tokio::test]
async fn create_task_forwards_request_id() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/rest/v2/tasks"))
        .and(header("x-request-id", "req-1"))
        .and(body_json(json!({
            "content": "Buy milk",
            "labels": ["home"],
            "priority": 3,
            "due_date": "2024-05-01"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "100",
            "content": "Buy milk",
            "labels": ["home"],
            "priority": 3,
            "due": { "date": "2024-05-01", "is_recurring": false, "string": "May 1" }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = TodoistClient::with_base_url(&server.uri(), "test-token").unwrap();
    let task = client
        .create_task(
            &NewTask {
                content: "Buy milk".into(),
                labels: vec!["home".into()],
                priority: 3,
                due_date: Some("2024-05-01".into()),
                ..NewTask::default()
            },
            Some("req-1"),
        )
        .await
        .unwrap();

    assert_eq!(task.id, "100");
    assert_eq!(task.due.unwrap().date, "2024-05-01");
}

#[tokio::test]
async fn update_task_sends_clear_due_marker() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/rest/v2/tasks/7"))
        .and(body_string_contains("\"due_string\":\"no date\""))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "7",
            "content": "Call mom",
            "priority": 1
        })))
        .mount(&server)
        .await;

    let client = TodoistClient::with_base_url(&server.uri(), "test-token").unwrap();
    let task = client
        .update_task(
            "7",
            &TaskUpdate {
                content: "Call mom".into(),
                priority: 1,
                due_string: Some("no date".into()),
                ..TaskUpdate::default()
            },
        )
        .await
        .unwrap();

    assert!(task.due.is_none());
}

#[tokio::test]
async fn close_and_delete_accept_no_content() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/rest/v2/tasks/7/close"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/rest/v2/tasks/7"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let client = TodoistClient::with_base_url(&server.uri(), "test-token").unwrap();
    client.close_task("7").await.unwrap();
    client.delete_task("7").await.unwrap();
}

#[tokio::test]
async fn full_sync_returns_items_and_projects() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/sync/v9/sync"))
        .and(body_string_contains("sync_token=*"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "sync_token": "tok-1",
            "full_sync": true,
            "items": [
                {
                    "id": "1",
                    "content": "Water plants",
                    "project_id": "p1",
                    "priority": 4,
                    "checked": true,
                    "is_deleted": false,
                    "updated_at": "2024-03-01T10:00:00Z"
                }
            ],
            "projects": [{ "id": "p1", "name": "Home" }]
        })))
        .mount(&server)
        .await;

    let client = TodoistClient::with_base_url(&server.uri(), "test-token").unwrap();
    let response = client.sync("*", &["items", "projects"]).await.unwrap();

    assert_eq!(response.sync_token, "tok-1");
    assert!(response.full_sync);
    assert_eq!(response.items.len(), 1);
    assert!(response.items[0].completed());
    assert_eq!(
        response.items[0].last_modified(),
        Some("2024-03-01T10:00:00Z")
    );
    assert_eq!(response.projects[0].name, "Home");
}

#[tokio::test]
async fn move_task_reports_failed_command() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/sync/v9/sync"))
        .and(body_string_contains("item_move"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "sync_status": { "cmd-1": { "error": "Invalid project" } }
        })))
        .mount(&server)
        .await;

    let client = TodoistClient::with_base_url(&server.uri(), "test-token").unwrap();
    let err = client.move_task("7", "p9", "cmd-1").await.unwrap_err();

    assert!(matches!(err, TodoistError::CommandFailed { ref uuid, .. } if uuid == "cmd-1"));
}

#[tokio::test]
async fn server_errors_are_retryable() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/rest/v2/projects"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let client = TodoistClient::with_base_url(&server.uri(), "test-token").unwrap();
    let err = client.list_projects().await.unwrap_err();

    assert!(err.is_retryable());
    assert_eq!(err.classification(), Some(ApiErrorClass::Transient));
}
