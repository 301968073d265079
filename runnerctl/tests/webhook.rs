mod common;

use axum::body::Body;
use axum::http::Request;

use runnerctl::instance::{ResourceKind, UID_LEN};
use runnerctl::providers::fake::FakeProvider;
use runnerctl::signature;

use common::{completed, context, queued, send, signed, with_signature, WEBHOOK_SECRET};

#[tokio::test]
async fn queued_job_with_target_label_provisions_one_runner() {
    let fake = FakeProvider::new();

    let (status, message) = send(context(&fake), signed(&queued(&["nested-virt"]))).await;

    assert_eq!(status, 200, "{message}");
    let instances: Vec<_> = fake
        .create_calls()
        .into_iter()
        .filter(|c| c.descriptor.id.kind == ResourceKind::Instance)
        .map(|c| c.descriptor.id.name)
        .collect();
    assert_eq!(instances.len(), 1);
    let uid = instances[0].strip_prefix("builder-").unwrap();
    assert_eq!(uid.len(), UID_LEN);
    assert!(uid.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit()));
    assert!(message.contains(&instances[0]), "{message}");
}

#[tokio::test]
async fn queued_job_for_another_pool_is_acknowledged_and_ignored() {
    let fake = FakeProvider::new();

    let (status, message) = send(context(&fake), signed(&queued(&["unrelated"]))).await;

    assert_eq!(status, 200);
    assert!(message.contains("unrelated"), "{message}");
    assert!(fake.create_calls().is_empty());
}

#[tokio::test]
async fn completed_job_for_another_pool_is_acknowledged_and_ignored() {
    let fake = FakeProvider::new().with_existing(["builder-ab12cd"]);

    let (status, message) =
        send(context(&fake), signed(&completed(&["unrelated"], "builder-ab12cd"))).await;

    assert_eq!(status, 200);
    assert!(message.contains("unrelated"), "{message}");
    assert!(fake.delete_calls().is_empty());
    assert!(fake.existing().contains("builder-ab12cd"));
}

#[tokio::test]
async fn completed_job_reclaims_runner_with_missing_dependents() {
    // Only the instance exists, so every dependent delete reports not-found.
    let fake = FakeProvider::new().with_existing(["builder-ab12cd"]);

    let (status, message) =
        send(context(&fake), signed(&completed(&["nested-virt"], "builder-ab12cd"))).await;

    assert_eq!(status, 200, "{message}");
    let calls = fake.delete_calls();
    assert_eq!(calls.len(), 6);
    assert_eq!(calls[0].resource.name, "builder-ab12cd");
    assert!(fake.existing().is_empty());
}

#[tokio::test]
async fn bad_signature_is_unauthorized() {
    let fake = FakeProvider::new();

    let (status, message) = send(
        context(&fake),
        with_signature(&queued(&["nested-virt"]), "sha256=deadbeef"),
    )
    .await;

    assert_eq!(status, 401);
    assert_eq!(message, "unauthorized: signature mismatch");
    assert!(fake.create_calls().is_empty());
}

#[tokio::test]
async fn missing_signature_is_unauthorized() {
    let body = queued(&["nested-virt"]);
    let request = Request::builder()
        .method("POST")
        .uri("/webhook")
        .body(Body::from(body))
        .unwrap();

    let (status, message) = send(context(&FakeProvider::new()), request).await;

    assert_eq!(status, 401);
    assert!(message.contains("not set"), "{message}");
}

#[tokio::test]
async fn missing_action_is_bad_request() {
    let (status, message) =
        send(context(&FakeProvider::new()), signed(r#"{"workflow_job":{"labels":[]}}"#)).await;

    assert_eq!(status, 400);
    assert!(message.contains("missing action"), "{message}");
}

#[tokio::test]
async fn ping_is_answered() {
    let body = r#"{"zen":"Keep it logically awesome.","hook_id":1}"#;
    let request = Request::builder()
        .method("POST")
        .uri("/")
        .header("x-github-event", "ping")
        .header("x-hub-signature-256", signature::sign(WEBHOOK_SECRET, body.as_bytes()))
        .body(Body::from(body))
        .unwrap();

    let (status, message) = send(context(&FakeProvider::new()), request).await;

    assert_eq!(status, 200);
    assert_eq!(message, "pong");
}

#[tokio::test]
async fn provisioning_failure_is_bad_request_with_provider_message() {
    let fake = FakeProvider::new().on_create(
        ResourceKind::Instance,
        runnerctl::providers::fake::CreateBehavior::Reject("QuotaExceeded: cores".into()),
    );

    let (status, message) = send(context(&fake), signed(&queued(&["nested-virt"]))).await;

    assert_eq!(status, 400);
    assert!(message.contains("QuotaExceeded: cores"), "{message}");
    assert!(message.contains("needs cleanup"), "{message}");
}

#[tokio::test]
async fn healthz() {
    let request = Request::builder().uri("/healthz").body(Body::empty()).unwrap();

    let (status, message) = send(context(&FakeProvider::new()), request).await;

    assert_eq!(status, 200);
    assert_eq!(message, "ok");
}
