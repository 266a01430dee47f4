use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
};
use chatbridge_core::testing::{OfflineResolver, ScriptedReply, ScriptedSurface, SurfaceCall};
use chatbridge_core::{BridgeSettings, ChatBridge, ChatMode, RESET_CONFIRMATION, Selectors};
use chatbridge_server::build_router;
use http_body_util::BodyExt;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

fn app(mode: ChatMode, surface: Arc<ScriptedSurface>) -> Router {
    let settings = BridgeSettings {
        mode,
        ..BridgeSettings::default()
    };
    build_router(Arc::new(ChatBridge::new(
        settings,
        surface,
        Arc::new(OfflineResolver),
    )))
}

fn post(body: impl Into<Body>) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header(header::CONTENT_TYPE, "application/json")
        .body(body.into())
        .unwrap()
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    serde_json::from_str(&body_text(response).await).unwrap()
}

fn replying(frames: &[&str]) -> Arc<ScriptedSurface> {
    Arc::new(
        ScriptedSurface::new(Selectors::default())
            .with_temp_chat(true)
            .with_reply(ScriptedReply::new(frames.iter().copied())),
    )
}

#[tokio::test(start_paused = true)]
async fn buffered_raw_reply() {
    let app = app(ChatMode::Temporary, replying(&["Hello", "Hello there"]));

    let response = app
        .oneshot(post(
            r#"{"messages":[{"role":"user","content":"hi"}], "stream": false, "clean_json": false}"#,
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["model"], "gemini-web-agent");
    assert!(body["id"].as_str().unwrap().starts_with("chatcmpl-"));
    assert_eq!(body["choices"][0]["index"], 0);
    assert_eq!(body["choices"][0]["message"]["role"], "assistant");
    assert_eq!(body["choices"][0]["message"]["content"], "Hello there");
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
}

#[tokio::test(start_paused = true)]
async fn buffered_reply_is_json_repaired_by_default() {
    let app = app(
        ChatMode::Temporary,
        replying(&["prefix ```json\n{\"a\":1}\n``` suffix"]),
    );

    let response = app
        .oneshot(post(r#"{"messages":[{"role":"user","content":"give json"}]}"#))
        .await
        .unwrap();

    let body = body_json(response).await;
    assert_eq!(body["choices"][0]["message"]["content"], r#"{"a": 1}"#);
}

#[tokio::test(start_paused = true)]
async fn streaming_reply_frames() {
    let app = app(ChatMode::Temporary, replying(&["Hel", "Hello", "Hello there"]));

    let response = app
        .oneshot(post(
            r#"{"messages":[{"role":"user","content":"hi"}], "stream": true}"#,
        ))
        .await
        .unwrap();

    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    assert!(content_type.contains("text/event-stream"));

    let text = body_text(response).await;
    let frames: Vec<&str> = text
        .split("\n\n")
        .filter(|frame| !frame.is_empty())
        .map(|frame| frame.strip_prefix("data: ").unwrap())
        .collect();

    assert_eq!(frames.last(), Some(&"[DONE]"));
    let chunks: Vec<Value> = frames[..frames.len() - 1]
        .iter()
        .map(|frame| serde_json::from_str(frame).unwrap())
        .collect();
    let (finish, deltas) = chunks.split_last().unwrap();

    let reassembled: String = deltas
        .iter()
        .map(|chunk| {
            assert_eq!(chunk["object"], "chat.completion.chunk");
            assert_eq!(chunk["choices"][0]["finish_reason"], Value::Null);
            chunk["choices"][0]["delta"]["content"].as_str().unwrap().to_string()
        })
        .collect();
    assert_eq!(reassembled, "Hello there");
    assert_eq!(finish["choices"][0]["delta"], json!({}));
    assert_eq!(finish["choices"][0]["finish_reason"], "stop");
}

#[tokio::test(start_paused = true)]
async fn streaming_failure_is_an_error_frame() {
    let surface = Arc::new(
        ScriptedSurface::new(Selectors::default())
            .with_temp_chat(true)
            .with_upstream_error("出现了点问题"),
    );
    let app = app(ChatMode::Temporary, surface);

    let response = app
        .oneshot(post(
            r#"{"messages":[{"role":"user","content":"hi"}], "stream": true}"#,
        ))
        .await
        .unwrap();

    let text = body_text(response).await;
    assert_eq!(
        text,
        "data: {\"error\":\"Upstream error: 出现了点问题\"}\n\n"
    );
}

#[tokio::test(start_paused = true)]
async fn reset_in_persistent_mode_skips_the_turn() {
    let surface = Arc::new(ScriptedSurface::new(Selectors::default()));
    let app = app(ChatMode::Persistent, surface.clone());

    let response = app
        .oneshot(post(r#"{"messages":[{"role":"user","content":"/reset"}]}"#))
        .await
        .unwrap();

    let body = body_json(response).await;
    assert_eq!(body["choices"][0]["message"]["content"], RESET_CONFIRMATION);
    let calls = surface.calls();
    assert!(!calls.iter().any(|call| matches!(
        call,
        SurfaceCall::Navigate(_) | SurfaceCall::Reload | SurfaceCall::Type(_) | SurfaceCall::Enter
    )));
    assert!(!calls.contains(&SurfaceCall::Click(Selectors::default().send_button)));
}

#[tokio::test(start_paused = true)]
async fn second_request_is_busy_while_session_is_held() {
    let app = app(ChatMode::Temporary, replying(&["slow"]));

    // Headers arrive before the body is polled, so the first turn keeps the session.
    let held = app
        .clone()
        .oneshot(post(
            r#"{"messages":[{"role":"user","content":"first"}], "stream": true}"#,
        ))
        .await
        .unwrap();

    let started = tokio::time::Instant::now();
    let response = app
        .clone()
        .oneshot(post(r#"{"messages":[{"role":"user","content":"second"}]}"#))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!({"error": "Browser Busy"}));
    assert!(started.elapsed() >= Duration::from_secs(300));

    drop(held);
    let health = app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(body_json(health).await["busy"], false);
}

#[tokio::test]
async fn malformed_bodies_get_in_band_errors() {
    let app = app(ChatMode::Temporary, replying(&["unused"]));

    let response = app.clone().oneshot(post("{not json")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!({"error": "Invalid JSON body"}));

    let response = app.clone().oneshot(post(r#"{"messages": []}"#)).await.unwrap();
    assert_eq!(body_json(response).await, json!({"error": "No messages"}));

    let response = app.clone().oneshot(post(r#"{"stream": true}"#)).await.unwrap();
    assert_eq!(body_json(response).await, json!({"error": "No messages"}));

    let response = app.oneshot(post(r#"{"messages": null}"#)).await.unwrap();
    assert_eq!(body_json(response).await, json!({"error": "No messages"}));
}

#[tokio::test]
async fn models_and_health() {
    let app = app(ChatMode::Temporary, replying(&["unused"]));

    let models = app
        .clone()
        .oneshot(Request::get("/v1/models").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let models = body_json(models).await;
    assert_eq!(models["object"], "list");
    assert_eq!(models["data"][0]["id"], "gemini-web-agent");

    let health = app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let health = body_json(health).await;
    assert_eq!(health["busy"], false);
    assert!(health["status"].is_string());
}
