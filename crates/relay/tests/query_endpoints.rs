mod support;

use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use easel_relay::app::build_router;
use easel_relay::auth::jwt::JwtCredentialVerifier;
use easel_relay::broker::MemoryBroker;
use easel_relay::collab::CollabHub;
use easel_relay::ws::{HistoryDepthResponse, RoomLocksResponse};
use serde_json::{json, Value};
use support::{identity, instance, lock, perform, ROOM};
use tower::ServiceExt;

const SECRET: &str = "easel_test_secret_that_is_definitely_long_enough";

async fn setup() -> (Router, CollabHub, String) {
    let verifier = Arc::new(JwtCredentialVerifier::new(SECRET).expect("verifier"));
    let token = verifier.issue_token(&identity("ops"), 3_600).expect("token");
    let hub = instance("query-test", &MemoryBroker::new()).await;
    (build_router(hub.clone(), verifier), hub, token)
}

async fn get(router: Router, uri: &str, token: Option<&str>) -> (StatusCode, Value) {
    let mut builder = Request::builder().uri(uri);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    let response = router
        .oneshot(builder.body(Body::empty()).expect("request should build"))
        .await
        .expect("request should succeed");
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.expect("body");
    (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
}

#[tokio::test]
async fn lock_snapshot_lists_current_holders() {
    let (router, hub, token) = setup().await;
    let (a, _a_out) = hub.connect(identity("A")).await;
    hub.handle_message(a, lock(ROOM, "shape-2"), 10).await;
    hub.handle_message(a, lock(ROOM, "shape-1"), 11).await;

    let (status, body) = get(router, "/v1/rooms/doc-1/locks", Some(&token)).await;
    assert_eq!(status, StatusCode::OK);
    let snapshot: RoomLocksResponse = serde_json::from_value(body).expect("lock snapshot");
    assert_eq!(snapshot.room_id, ROOM);
    let elements: Vec<&str> = snapshot.locks.iter().map(|lock| lock.element_id.as_str()).collect();
    assert_eq!(elements, vec!["shape-1", "shape-2"]);
    assert!(snapshot.locks.iter().all(|lock| lock.owner_user_id == "A"));
}

#[tokio::test]
async fn unknown_rooms_have_no_locks() {
    let (router, _hub, token) = setup().await;
    let (status, body) = get(router, "/v1/rooms/nowhere/locks", Some(&token)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"room_id": "nowhere", "locks": []}));
}

#[tokio::test]
async fn history_depth_reports_both_stacks() {
    let (router, hub, token) = setup().await;
    let (a, _a_out) = hub.connect(identity("A")).await;
    hub.handle_message(a, perform(ROOM, "shape-1", json!({"x": 1})), 1_000).await;
    hub.handle_message(a, perform(ROOM, "shape-1", json!({"x": 2})), 2_000).await;
    hub.handle_message(
        a,
        easel_common::protocol::ws::ClientMessage::UndoAction { room: ROOM.into() },
        3_000,
    )
    .await;

    let (status, body) = get(router, "/v1/rooms/doc-1/history/A", Some(&token)).await;
    assert_eq!(status, StatusCode::OK);
    let depth: HistoryDepthResponse = serde_json::from_value(body).expect("history depth");
    assert_eq!(
        depth,
        HistoryDepthResponse {
            room_id: ROOM.into(),
            user_id: "A".into(),
            undo_depth: 1,
            redo_depth: 1,
        }
    );
}

#[tokio::test]
async fn queries_require_a_bearer_token() {
    let (router, _hub, _token) = setup().await;

    let (status, body) = get(router.clone(), "/v1/rooms/doc-1/locks", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "AUTH_INVALID_TOKEN");

    let (status, _body) = get(router, "/v1/rooms/doc-1/history/A", Some("garbage")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn malformed_room_ids_fail_validation() {
    let (router, _hub, token) = setup().await;

    let (status, body) = get(router.clone(), "/v1/rooms/%20%20/locks", Some(&token)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "VALIDATION_FAILED");
    assert_eq!(body["error"]["retryable"], false);

    let long = "r".repeat(129);
    let (status, body) =
        get(router, &format!("/v1/rooms/{long}/history/A"), Some(&token)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "VALIDATION_FAILED");
}
