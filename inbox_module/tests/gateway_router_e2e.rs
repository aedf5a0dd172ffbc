mod test_support;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use inbox_module::service::build_router;
use inbox_module::Platform;
use serde_json::Value;
use test_support::*;
use tower::ServiceExt;

fn router(harness: &Harness) -> Router {
    build_router(harness.state.clone(), 64 * 1024)
}

async fn read_body(response: axum::response::Response) -> Vec<u8> {
    to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body")
        .to_vec()
}

async fn read_json(response: axum::response::Response) -> Value {
    serde_json::from_slice(&read_body(response).await).expect("json body")
}

fn signed_whatsapp_post(body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/webhooks/whatsapp")
        .header("content-type", "application/json")
        .header("x-hub-signature-256", sign_sha256(WHATSAPP_SECRET, body))
        .body(Body::from(body.to_string()))
        .expect("request")
}

#[tokio::test]
async fn health_endpoints_answer_ok() {
    let harness = Harness::start(base_config(UNREACHABLE_API));
    for path in ["/", "/health"] {
        let response = router(&harness)
            .oneshot(Request::get(path).body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(read_body(response).await, b"ok");
    }
}

#[tokio::test]
async fn subscription_challenge_is_echoed() {
    let harness = Harness::start(base_config(UNREACHABLE_API));
    let uri = format!(
        "/webhooks/whatsapp?hub.mode=subscribe&hub.verify_token={}&hub.challenge=1158201444",
        WHATSAPP_VERIFY_TOKEN
    );
    let response = router(&harness)
        .oneshot(Request::get(uri).body(Body::empty()).expect("request"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(read_body(response).await, b"1158201444");
}

#[tokio::test]
async fn wrong_verify_token_is_forbidden() {
    let harness = Harness::start(base_config(UNREACHABLE_API));
    let response = router(&harness)
        .oneshot(
            Request::get("/webhooks/whatsapp?hub.mode=subscribe&hub.verify_token=nope&hub.challenge=1")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(read_body(response).await, b"token_mismatch");
}

#[tokio::test]
async fn challenge_for_unknown_platform_is_not_found() {
    let harness = Harness::start(base_config(UNREACHABLE_API));
    let response = router(&harness)
        .oneshot(
            Request::get("/webhooks/pager?hub.challenge=1")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn signed_webhook_is_accepted() {
    let harness = Harness::start(base_config(UNREACHABLE_API));
    let body = whatsapp_text("15553330000", "wamid.HTTP1", "Are you open today?");
    let response = router(&harness)
        .oneshot(signed_whatsapp_post(&body))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let ack = read_json(response).await;
    assert_eq!(ack["status"], "accepted");
    assert_eq!(ack["message"], "accepted=1 duplicate=0 echo=0");

    let conversation = harness.only_conversation(Platform::WhatsApp, "15553330000");
    assert_eq!(harness.generator.requests().len(), 1);
    assert!(!harness.thread(&conversation.id).is_empty());
}

#[tokio::test]
async fn bad_signature_is_unauthorized() {
    let harness = Harness::start(base_config(UNREACHABLE_API));
    let body = whatsapp_text("15553330001", "wamid.HTTP2", "hi");
    let request = Request::builder()
        .method("POST")
        .uri("/webhooks/whatsapp")
        .header("x-hub-signature-256", sign_sha256("wrong-secret", &body))
        .body(Body::from(body))
        .expect("request");
    let response = router(&harness).oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let ack = read_json(response).await;
    assert_eq!(ack["status"], "unauthorized");
    assert_eq!(ack["message"], "invalid_signature");
    assert!(harness
        .conversations(Platform::WhatsApp, "15553330001")
        .is_empty());
}

#[tokio::test]
async fn post_for_unknown_platform_is_acknowledged_and_ignored() {
    let harness = Harness::start(base_config(UNREACHABLE_API));
    let request = Request::builder()
        .method("POST")
        .uri("/webhooks/carrier-pigeon")
        .body(Body::from("{}"))
        .expect("request");
    let response = router(&harness).oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let ack = read_json(response).await;
    assert_eq!(ack["status"], "ignored");
    assert_eq!(ack["message"], "unknown_platform");
}

#[tokio::test]
async fn malformed_payload_is_acknowledged_and_ignored() {
    let harness = Harness::start(base_config(UNREACHABLE_API));
    let response = router(&harness)
        .oneshot(signed_whatsapp_post("[1, 2, 3"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(read_json(response).await["status"], "ignored");
}

#[tokio::test]
async fn oversized_bodies_are_rejected() {
    let harness = Harness::start(base_config(UNREACHABLE_API));
    let body = "x".repeat(2048);
    let response = build_router(harness.state.clone(), 1024)
        .oneshot(signed_whatsapp_post(&body))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}
