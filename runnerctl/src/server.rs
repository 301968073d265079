use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use tracing::{Instrument, error, info, info_span, warn};

use crate::controller::{self, ControllerContext, HandleError};
use crate::event::Delivery;
use crate::signature::SIGNATURE_HEADER;

pub const EVENT_HEADER: &str = "x-github-event";
pub const DELIVERY_HEADER: &str = "x-github-delivery";

impl IntoResponse for HandleError {
    fn into_response(self) -> Response {
        let status = match self {
            HandleError::Authentication(_) => StatusCode::UNAUTHORIZED,
            HandleError::MalformedRequest(_)
            | HandleError::Provisioning(_)
            | HandleError::Reclamation(_) => StatusCode::BAD_REQUEST,
        };
        (status, self.to_string()).into_response()
    }
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

async fn webhook(
    State(ctx): State<Arc<ControllerContext>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let delivery = Delivery {
        raw_body: body,
        signature: header(&headers, SIGNATURE_HEADER),
        event_name: header(&headers, EVENT_HEADER),
        delivery_id: header(&headers, DELIVERY_HEADER),
    };
    let delivery_id = delivery
        .delivery_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let span = info_span!("webhook", delivery = %delivery_id, event = ?delivery.event_name);

    // Runs to completion even if the client hangs up mid-provisioning.
    let task = tokio::spawn(
        async move {
            let result = controller::handle_delivery(&ctx, &delivery).await;
            match &result {
                Ok(outcome) => info!(%outcome, "delivery handled"),
                Err(HandleError::Authentication(reason)) => warn!(%reason, "delivery rejected"),
                Err(error) => error!(%error, "delivery failed"),
            }
            result
        }
        .instrument(span),
    );

    match task.await {
        Ok(Ok(outcome)) => (StatusCode::OK, outcome.to_string()).into_response(),
        Ok(Err(error)) => error.into_response(),
        Err(join_error) => {
            error!(%join_error, delivery = %delivery_id, "delivery handler panicked");
            (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
        }
    }
}

async fn healthz() -> &'static str {
    "ok"
}

pub fn router(ctx: Arc<ControllerContext>) -> Router {
    Router::new()
        .route("/", post(webhook))
        .route("/webhook", post(webhook))
        .route("/healthz", get(healthz))
        .with_state(ctx)
}
