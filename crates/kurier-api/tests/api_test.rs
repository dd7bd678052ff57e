//! Router-level tests for the HTTP surface.
//!
//! Drives the real router with in-process requests against an isolated
//! database, asserting the status mapping of the error taxonomy and the
//! idempotent-replay contract.

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use kurier_api::{create_router, Config};
use kurier_testing::TestEnv;
use serde_json::{json, Value};
use tower::ServiceExt;

async fn router(env: &TestEnv) -> Router {
    create_router(env.storage(), &Config::default())
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body readable");
    serde_json::from_slice(&bytes).expect("body is JSON")
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("request builds")
}

#[tokio::test]
async fn create_user_topup_and_balance_flow() {
    let env = TestEnv::new().await.expect("test environment setup failed");
    let app = router(&env).await;

    let response = app
        .clone()
        .oneshot(post_json("/users", json!({"name": "acme"})))
        .await
        .expect("request handled");
    assert_eq!(response.status(), StatusCode::CREATED);
    let created = body_json(response).await;
    let user_id = created["id"].as_str().expect("id in response").to_string();

    let response = app
        .clone()
        .oneshot(post_json(&format!("/users/{user_id}/topup"), json!({"amount": 100})))
        .await
        .expect("request handled");
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/users/{user_id}/balance"))
                .body(Body::empty())
                .expect("request builds"),
        )
        .await
        .expect("request handled");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["balance"], 100);
}

#[tokio::test]
async fn invalid_topup_amount_is_rejected() {
    let env = TestEnv::new().await.expect("test environment setup failed");
    let user = env.create_user("acme").await.unwrap();
    let app = router(&env).await;

    let response = app
        .oneshot(post_json(&format!("/users/{user}/topup"), json!({"amount": 0})))
        .await
        .expect("request handled");

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"], "invalid_amount");
}

#[tokio::test]
async fn message_without_user_header_is_rejected() {
    let env = TestEnv::new().await.expect("test environment setup failed");
    let app = router(&env).await;

    let response = app
        .oneshot(post_json("/messages", json!({"to": "+49", "body": "hi"})))
        .await
        .expect("request handled");

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"], "user_id_required");
}

#[tokio::test]
async fn unfunded_message_answers_payment_required() {
    let env = TestEnv::new().await.expect("test environment setup failed");
    let user = env.create_user("acme").await.unwrap();
    let app = router(&env).await;

    let mut request = post_json("/messages", json!({"to": "+49", "body": "hi"}));
    request.headers_mut().insert("x-user-id", user.to_string().parse().unwrap());

    let response = app.oneshot(request).await.expect("request handled");

    assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body_json(response).await["error"], "insufficient_balance");
}

#[tokio::test]
async fn idempotent_replay_answers_ok_with_same_id() {
    let env = TestEnv::new().await.expect("test environment setup failed");
    let user = env.create_user("acme").await.unwrap();
    env.top_up(user, 10).await.unwrap();
    let app = router(&env).await;

    let build = || {
        let mut request = post_json("/messages", json!({"to": "+49", "body": "hi"}));
        request.headers_mut().insert("x-user-id", user.to_string().parse().unwrap());
        request.headers_mut().insert("idempotency-key", "key-1".parse().unwrap());
        request
    };

    let first = app.clone().oneshot(build()).await.expect("request handled");
    assert_eq!(first.status(), StatusCode::ACCEPTED);
    let first_id = body_json(first).await["id"].as_str().unwrap().to_string();

    let replay = app.oneshot(build()).await.expect("request handled");
    assert_eq!(replay.status(), StatusCode::OK);
    let replay_id = body_json(replay).await["id"].as_str().unwrap().to_string();

    assert_eq!(first_id, replay_id);
    assert_eq!(env.balance(user).await.unwrap(), 9);
}

#[tokio::test]
async fn list_and_get_scope_to_the_owner() {
    let env = TestEnv::new().await.expect("test environment setup failed");
    let owner = env.create_user("owner").await.unwrap();
    let stranger = env.create_user("stranger").await.unwrap();
    env.top_up(owner, 1).await.unwrap();
    let message_id = env.enqueue(owner, "+49", "private", None).await.unwrap();
    let app = router(&env).await;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/messages?user_id={owner}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .expect("request handled");
    assert_eq!(response.status(), StatusCode::OK);
    let listing = body_json(response).await;
    assert_eq!(listing["items"].as_array().unwrap().len(), 1);
    assert_eq!(listing["limit"], 50);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/messages/{message_id}?user_id={owner}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .expect("request handled");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["body"], "private");

    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/messages/{message_id}?user_id={stranger}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .expect("request handled");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn health_and_readiness_answer_ok() {
    let env = TestEnv::new().await.expect("test environment setup failed");
    let app = router(&env).await;

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .expect("request handled");
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
        .await
        .expect("request handled");
    assert_eq!(response.status(), StatusCode::OK);
}
