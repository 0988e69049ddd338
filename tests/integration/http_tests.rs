//! HTTP front end: login redirect, admin listing and delete, error statuses.

use std::net::SocketAddr;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use nbhydra::http::{router, run_until};
use nbhydra::AppError;
use tower::ServiceExt;

use super::test_helpers::harness;

fn login_request(username: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/login")
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(format!("username={username}")))
        .expect("request")
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json body")
}

#[tokio::test]
async fn health_returns_ok() {
    let h = harness(9500, 9510).await;
    let response = router(h.manager.clone())
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&bytes[..], b"ok");
}

#[tokio::test]
async fn login_redirects_to_user_port() {
    let h = harness(9500, 9510).await;
    let response = router(h.manager.clone())
        .oneshot(login_request("alice"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(
        response.headers().get(header::LOCATION).unwrap(),
        "http://nb.test:9500"
    );
    assert_eq!(h.processes.spawn_count(), 1);
}

#[tokio::test]
async fn login_rejects_non_alphanumeric_username() {
    let h = harness(9500, 9510).await;
    let response = router(h.manager.clone())
        .oneshot(login_request("bad%2Fname"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert!(body["error"].as_str().unwrap().starts_with("invalid user:"));
    assert_eq!(h.processes.spawn_count(), 0);
}

#[tokio::test]
async fn exhausted_pool_is_service_unavailable() {
    let h = harness(9500, 9501).await;
    let app = router(h.manager.clone());

    let first = app.clone().oneshot(login_request("alice")).await.unwrap();
    assert_eq!(first.status(), StatusCode::SEE_OTHER);

    let second = app.oneshot(login_request("bob")).await.unwrap();
    assert_eq!(second.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn spawn_failure_is_bad_gateway() {
    let h = harness(9500, 9510).await;
    h.processes.set_fail_spawn(true);

    let response = router(h.manager.clone())
        .oneshot(login_request("alice"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn admin_lists_sessions() {
    let h = harness(9500, 9510).await;
    h.manager.ensure_session("alice").await.unwrap();

    let response = router(h.manager.clone())
        .oneshot(Request::get("/admin/sessions").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    let sessions = body.as_array().expect("array");
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0]["user_id"], "alice");
    assert_eq!(sessions[0]["port"], 9500);
    assert_eq!(sessions[0]["alive"], true);
}

#[tokio::test]
async fn admin_delete_removes_user() {
    let h = harness(9500, 9510).await;
    h.manager.ensure_session("alice").await.unwrap();
    let app = router(h.manager.clone());

    let delete = |user: &str| {
        Request::delete(format!("/admin/users/{user}"))
            .body(Body::empty())
            .unwrap()
    };

    let response = app.clone().oneshot(delete("alice")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(h.repo.find("alice").await.unwrap().is_none());

    let response = app.oneshot(delete("alice")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn occupied_port_ends_run_with_error() {
    let h = harness(9500, 9510).await;
    let taken = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let bind: SocketAddr = taken.local_addr().expect("addr");

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        run_until(h.manager.clone(), bind, std::future::pending()),
    )
    .await
    .expect("run must return instead of waiting for shutdown");

    assert!(matches!(result, Err(AppError::Io(_))), "{result:?}");
}

#[tokio::test]
async fn shutdown_stops_run_cleanly() {
    let h = harness(9500, 9510).await;
    let bind: SocketAddr = "127.0.0.1:0".parse().expect("addr");

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        run_until(h.manager.clone(), bind, async {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }),
    )
    .await
    .expect("graceful shutdown");

    assert!(result.is_ok(), "{result:?}");
}
