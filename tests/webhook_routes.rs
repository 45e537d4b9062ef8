//! Integration tests for the inbound `/webhooks/{account}` route.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Method, Request, Response, StatusCode};
use chrono::Utc;
use firehydrant_webhooks::delivery_log::DeliveryLog;
use firehydrant_webhooks::dispatch::{ChannelSink, PendingEvent};
use firehydrant_webhooks::http_server::{router, ServerState};
use firehydrant_webhooks::store::{JsonStore, RegistrationStore};
use firehydrant_webhooks::types::{
    DeliveryStatus, FilterConfig, Registration, SubscriberConfig, SubscriptionScope,
};
use firehydrant_webhooks::verification::{compute_signature, SIGNATURE_HEADER};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tower::ServiceExt;

const SECRET: &str = "s3cret";

struct TestApp {
    state: ServerState,
    events: mpsc::UnboundedReceiver<PendingEvent>,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// One registration for `acme` with a SEV1-only subscriber attached.
fn build_test_app() -> TestApp {
    let store = JsonStore::in_memory();
    let registration = Registration {
        account: "acme".into(),
        webhook_id: "wh-1".into(),
        url: "https://hooks.example.com/webhooks/acme".into(),
        secret: SECRET.into(),
        scope: SubscriptionScope::incidents(),
        subscribers: ["sev1".to_string()].into(),
        version: 0,
        updated_at: Utc::now(),
    };
    store.compare_and_swap(registration, None).unwrap();
    store
        .put_subscriber(SubscriberConfig {
            id: "sev1".into(),
            account: "acme".into(),
            scope: SubscriptionScope::incidents(),
            filter: FilterConfig {
                severities: Some(["SEV1".to_string()].into()),
                ..Default::default()
            },
            created_at: Utc::now(),
        })
        .unwrap();

    let (tx, events) = mpsc::unbounded_channel();
    let state = ServerState {
        store: Arc::new(store),
        sink: Arc::new(ChannelSink::new(tx)),
        deliveries: Arc::new(DeliveryLog::default()),
    };
    TestApp { state, events }
}

async fn post(app: &TestApp, account: &str, signature: Option<&str>, body: &[u8]) -> Response<Body> {
    let mut builder = Request::builder()
        .method(Method::POST)
        .uri(format!("/webhooks/{account}"))
        .header("content-type", "application/json");
    if let Some(sig) = signature {
        builder = builder.header(SIGNATURE_HEADER, sig);
    }
    router(app.state.clone())
        .oneshot(builder.body(Body::from(body.to_vec())).unwrap())
        .await
        .unwrap()
}

async fn post_signed(app: &TestApp, body: &[u8]) -> Response<Body> {
    let sig = compute_signature(SECRET.as_bytes(), body).unwrap();
    post(app, "acme", Some(&sig), body).await
}

async fn body_json(response: Response<Body>) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn incident_body(severity: &str, milestone: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "data": {
            "incident": {
                "id": "inc-1",
                "name": "Checkout is down",
                "severity": { "slug": severity, "description": "Critical" },
                "current_milestone": milestone,
            }
        },
        "event": { "operation": "CREATED", "resource_type": "incident" }
    }))
    .unwrap()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn signed_sev1_incident_is_emitted() {
    let mut app = build_test_app();
    let response = post_signed(&app, &incident_body("SEV1", "started")).await;
    assert_eq!(response.status(), StatusCode::OK);

    let pending = app.events.try_recv().unwrap();
    assert_eq!(pending.subscriber_id, "sev1");
    assert_eq!(pending.event.event_type, "firehydrant.incident.created");
    assert_eq!(pending.event.payload["incident"]["severity"], "SEV1");
    assert_eq!(pending.event.payload["incident"]["name"], "Checkout is down");
    assert!(app.events.try_recv().is_err());

    let recent = app.state.deliveries.recent("acme");
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].status, DeliveryStatus::Processed);
    assert_eq!(recent[0].emitted_to, vec!["sev1"]);
}

#[tokio::test]
async fn non_matching_severity_is_acknowledged_without_events() {
    let mut app = build_test_app();
    let response = post_signed(&app, &incident_body("SEV3", "started")).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert!(app.events.try_recv().is_err());
    assert!(app.state.deliveries.recent("acme")[0].emitted_to.is_empty());
}

#[tokio::test]
async fn bad_signature_is_forbidden() {
    let mut app = build_test_app();
    let response = post(&app, "acme", Some("deadbeef"), &incident_body("SEV1", "started")).await;

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let json = body_json(response).await;
    assert_eq!(json["code"], "FORBIDDEN");
    assert!(app.events.try_recv().is_err());
    assert_eq!(
        app.state.deliveries.recent("acme")[0].status,
        DeliveryStatus::VerificationFailed
    );
}

#[tokio::test]
async fn missing_signature_is_forbidden() {
    let app = build_test_app();
    let response = post(&app, "acme", None, &incident_body("SEV1", "started")).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn malformed_body_is_bad_request() {
    let app = build_test_app();
    let response = post_signed(&app, b"{not json").await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["code"], "BAD_REQUEST");
    assert_eq!(
        app.state.deliveries.recent("acme")[0].status,
        DeliveryStatus::Malformed
    );
}

#[tokio::test]
async fn unknown_account_is_not_found() {
    let app = build_test_app();
    let response = post(&app, "globex", None, b"{}").await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let json = body_json(response).await;
    assert_eq!(json["code"], "NOT_FOUND");
    assert!(app.state.deliveries.recent("globex").is_empty());
}

#[tokio::test]
async fn get_is_not_allowed() {
    let app = build_test_app();
    let response = router(app.state.clone())
        .oneshot(
            Request::builder()
                .uri("/webhooks/acme")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
}
