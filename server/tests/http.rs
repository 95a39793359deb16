//! HTTP surface tests driven through the router with `tower::oneshot`.

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use http_body_util::BodyExt;
use server::AppState;
use server::config::{AllowList, Config, SafetyRetryMode};
use server::queue::MemoryBroker;
use server::store::LocalChatStore;
use shared::models::{Chat, Message, MessageState};
use std::sync::Arc;
use tower::ServiceExt;
use uuid::Uuid;

fn app_with(config: Config) -> (Router, AppState) {
    let state = AppState::new(
        Arc::new(LocalChatStore::new()),
        Arc::new(MemoryBroker::new()),
        Arc::new(config),
    );
    (server::init(Router::new(), state.clone()), state)
}

fn app() -> (Router, AppState) {
    app_with(Config::for_tests())
}

fn authed(method: &str, uri: &str, user: &str, body: Option<serde_json::Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {user}"));
    match body {
        Some(json) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn json_body<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_needs_no_auth() {
    let (app, _) = app();
    let response = app
        .oneshot(Request::get("/api/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn missing_bearer_is_unauthorized() {
    let (app, _) = app();
    let response = app
        .oneshot(Request::post("/chats").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn signed_tokens_are_enforced_when_secret_is_set() {
    let mut config = Config::for_tests();
    config.auth_secret = Some("s3cret".into());
    let (app, _) = app_with(config);

    let response = app
        .clone()
        .oneshot(authed("POST", "/chats", "alice.deadbeef", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let token = server::handlers::sign_user_token("s3cret", "alice");
    let response = app
        .oneshot(authed("POST", "/chats", &token, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let chat: Chat = json_body(response).await;
    assert_eq!(chat.user_id, "alice");
}

#[tokio::test]
async fn chats_are_scoped_to_their_owner() {
    let (app, _) = app();
    let response = app
        .clone()
        .oneshot(authed("POST", "/chats", "u1", None))
        .await
        .unwrap();
    let chat: Chat = json_body(response).await;

    let response = app
        .clone()
        .oneshot(authed("GET", &format!("/chats/{}", chat.id), "u2", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .oneshot(authed("GET", &format!("/chats/{}", chat.id), "u1", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn full_message_round_trip_over_http() {
    let (app, state) = app();
    let response = app
        .clone()
        .oneshot(authed("POST", "/chats", "u1", None))
        .await
        .unwrap();
    let chat: Chat = json_body(response).await;

    let response = app
        .clone()
        .oneshot(authed(
            "POST",
            &format!("/chats/{}/prompter_message", chat.id),
            "u1",
            Some(serde_json::json!({"content": "hi"})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let prompter: Message = json_body(response).await;
    assert_eq!(prompter.state, MessageState::Manual);

    let response = app
        .clone()
        .oneshot(authed(
            "POST",
            &format!("/chats/{}/assistant_message", chat.id),
            "u1",
            Some(serde_json::json!({
                "parent_id": prompter.id,
                "model_config_name": "m1",
            })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let assistant: Message = json_body(response).await;
    assert_eq!(assistant.state, MessageState::Pending);

    // The work landed on the queue keyed by the compat hash.
    let hash = assistant.worker_compat_hash.clone().unwrap();
    let popped = state
        .coordinator
        .work_queue(&hash)
        .pop(std::time::Duration::from_millis(100))
        .await
        .unwrap();
    assert_eq!(popped, Some(assistant.id));

    // A second reply to the same prompter while one is active is rejected.
    let response = app
        .oneshot(authed(
            "POST",
            &format!("/chats/{}/assistant_message", chat.id),
            "u1",
            Some(serde_json::json!({
                "parent_id": prompter.id,
                "model_config_name": "m1",
            })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn disallowed_model_is_rejected() {
    let mut config = Config::for_tests();
    config.allowed_model_configs = AllowList::parse("m1");
    let (app, state) = app_with(config);

    let chat = state.store.create_chat("u1").await.unwrap();
    let prompter = state
        .store
        .add_prompter_message(chat.id, None, "hi")
        .await
        .unwrap();

    let response = app
        .oneshot(authed(
            "POST",
            &format!("/chats/{}/assistant_message", chat.id),
            "u1",
            Some(serde_json::json!({
                "parent_id": prompter.id,
                "model_config_name": "m2",
            })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = json_body(response).await;
    assert_eq!(body["error"], "model_not_allowed");
}

#[tokio::test]
async fn vote_validates_score() {
    let (app, state) = app();
    let chat = state.store.create_chat("u1").await.unwrap();
    let prompter = state
        .store
        .add_prompter_message(chat.id, None, "hi")
        .await
        .unwrap();

    let uri = format!("/chats/{}/messages/{}/vote", chat.id, prompter.id);
    let response = app
        .clone()
        .oneshot(authed("POST", &uri, "u1", Some(serde_json::json!({"score": 5}))))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .oneshot(authed("POST", &uri, "u1", Some(serde_json::json!({"score": 1}))))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    let voted = state.store.get_message(prompter.id).await.unwrap();
    assert_eq!(voted.score, 1);
}

#[tokio::test]
async fn events_for_a_prompter_message_is_not_found() {
    let (app, state) = app();
    let chat = state.store.create_chat("u1").await.unwrap();
    let prompter = state
        .store
        .add_prompter_message(chat.id, None, "hi")
        .await
        .unwrap();

    let response = app
        .oneshot(authed(
            "GET",
            &format!("/chats/{}/messages/{}/events", chat.id, prompter.id),
            "u1",
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn events_replay_a_finished_message() {
    let (app, state) = app();
    let chat = state.store.create_chat("u1").await.unwrap();
    let prompter = state
        .store
        .add_prompter_message(chat.id, None, "hi")
        .await
        .unwrap();
    let assistant = state
        .store
        .initiate_assistant_message(
            prompter.id,
            shared::models::WorkParameters::for_model("m1"),
        )
        .await
        .unwrap();
    let worker_id = Uuid::new_v4();
    state
        .store
        .append_content(assistant.id, worker_id, "the answer")
        .await
        .unwrap();
    state
        .store
        .finalize_message(assistant.id, MessageState::Complete, None)
        .await
        .unwrap();

    let response = app
        .oneshot(authed(
            "GET",
            &format!("/chats/{}/messages/{}/events", chat.id, assistant.id),
            "u1",
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let body = String::from_utf8(body.to_vec()).unwrap();
    assert!(body.contains("event: message"), "body was: {body}");
    assert!(body.contains("the answer"));
}

#[tokio::test]
async fn seamless_safety_rewrite_stays_on_one_stream() {
    let mut config = Config::for_tests();
    config.safety_retry = SafetyRetryMode::Seamless;
    let (app, state) = app_with(config);

    let chat = state.store.create_chat("u1").await.unwrap();
    let prompter = state
        .store
        .add_prompter_message(chat.id, None, "something unwise")
        .await
        .unwrap();
    let assistant = state
        .store
        .initiate_assistant_message(
            prompter.id,
            shared::models::WorkParameters::for_model("m1"),
        )
        .await
        .unwrap();
    state.coordinator.enqueue_assistant(&assistant).await.unwrap();

    let response = app
        .oneshot(authed(
            "GET",
            &format!("/chats/{}/messages/{}/events", chat.id, assistant.id),
            "u1",
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    // Collect concurrently so the stream attaches while the message is
    // still pending.
    let collect = tokio::spawn(async move {
        response.into_body().collect().await.unwrap().to_bytes()
    });
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    // The worker side: pick the message up, hit the safety rewrite, then
    // stream the retry to completion.
    let hash = assistant.worker_compat_hash.clone().unwrap();
    let popped = state
        .coordinator
        .work_queue(&hash)
        .pop(std::time::Duration::from_millis(100))
        .await
        .unwrap();
    assert_eq!(popped, Some(assistant.id));
    let queue = state.coordinator.token_queue(assistant.id);
    let retry = state
        .coordinator
        .resolve_safe_prompt(&queue, assistant.id, "something wiser")
        .await
        .unwrap();
    state
        .coordinator
        .finish_stream(
            &queue,
            assistant.id,
            shared::protocol::EndReason::Error,
            Some("safety_rewrite"),
        )
        .await
        .unwrap();
    let popped = state
        .coordinator
        .work_queue(&hash)
        .pop(std::time::Duration::from_millis(100))
        .await
        .unwrap();
    assert_eq!(popped, Some(retry.id));
    let retry_queue = state.coordinator.token_queue(retry.id);
    state
        .coordinator
        .relay_token(&retry_queue, retry.id, Uuid::new_v4(), "a better answer", None, None)
        .await
        .unwrap();
    state
        .coordinator
        .finish_stream(&retry_queue, retry.id, shared::protocol::EndReason::Success, None)
        .await
        .unwrap();

    let body = tokio::time::timeout(std::time::Duration::from_secs(5), collect)
        .await
        .expect("stream should close after the retry finishes")
        .unwrap();
    let body = String::from_utf8(body.to_vec()).unwrap();
    assert!(body.contains("event: safe_prompt"), "body was: {body}");
    assert!(body.contains("something wiser"));
    assert!(body.contains("a better answer"));
    assert!(body.contains("event: message"));
}
