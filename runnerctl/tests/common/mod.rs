#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, Response};
use tower::ServiceExt;

use runnerctl::bootstrap::BootstrapSource;
use runnerctl::controller::{ControllerContext, ControllerSettings};
use runnerctl::providers::fake::FakeProvider;
use runnerctl::providers::provider::Provider;
use runnerctl::secrets::SecretStore;
use runnerctl::server;
use runnerctl::signature;

pub const WEBHOOK_SECRET: &str = "It's a Secret to Everybody";

pub fn context(fake: &FakeProvider) -> Arc<ControllerContext> {
    context_with_timeout(fake, Duration::from_secs(300))
}

pub fn context_with_timeout(fake: &FakeProvider, timeout: Duration) -> Arc<ControllerContext> {
    Arc::new(ControllerContext {
        provider: Provider::Fake(fake.clone()),
        secrets: SecretStore::from_map(HashMap::from([
            ("WEBHOOK_TOKEN".to_string(), WEBHOOK_SECRET.to_string()),
            ("SSH_PUBLIC_KEY".to_string(), "ssh-ed25519 AAAAC3Nza runner@ci".to_string()),
        ])),
        bootstrap: BootstrapSource::Inline("#cloud-config\nruncmd:\n  - ./run.sh\n".into()),
        settings: ControllerSettings {
            operation_timeout: timeout,
            ..Default::default()
        },
    })
}

pub fn queued(labels: &[&str]) -> String {
    serde_json::json!({
        "action": "queued",
        "workflow_job": { "id": 1, "run_id": 10, "labels": labels, "runner_name": null },
    })
    .to_string()
}

pub fn completed(labels: &[&str], runner_name: &str) -> String {
    serde_json::json!({
        "action": "completed",
        "workflow_job": { "id": 1, "run_id": 10, "labels": labels, "runner_name": runner_name },
    })
    .to_string()
}

/// A POST to `/` carrying `body`, signed with [`WEBHOOK_SECRET`].
pub fn signed(body: &str) -> Request<Body> {
    with_signature(body, &signature::sign(WEBHOOK_SECRET, body.as_bytes()))
}

pub fn with_signature(body: &str, signature: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/")
        .header("content-type", "application/json")
        .header("x-github-event", "workflow_job")
        .header("x-hub-signature-256", signature)
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub async fn send(ctx: Arc<ControllerContext>, request: Request<Body>) -> (u16, String) {
    let response: Response<Body> = server::router(ctx).oneshot(request).await.unwrap();
    let status = response.status().as_u16();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, String::from_utf8(bytes.to_vec()).unwrap())
}
