use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use issueflow_core::ingress::{self, DELIVERY_HEADER, EVENT_HEADER, SIGNATURE_HEADER};

use crate::error::AppError;
use crate::state::AppState;

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// POST /api/webhooks/github: authenticate and handle one delivery.
///
/// Everything except a bad signature answers 200 so GitHub does not pile up
/// redeliveries; the outcome is reported in the body and the action log.
pub async fn github_webhook(
    State(app): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, AppError> {
    let event = header(&headers, EVENT_HEADER).unwrap_or_default();
    let delivery = header(&headers, DELIVERY_HEADER);
    let signature = header(&headers, SIGNATURE_HEADER);

    let handling = app.orchestrator.handle_delivery(
        &event,
        delivery.as_deref(),
        &body,
        signature.as_deref(),
        &app.webhook_secret,
    );
    match tokio::time::timeout(app.request_timeout, handling).await {
        Ok(Ok(outcome)) => Ok(Json(serde_json::json!({
            "status": "ok",
            "outcome": outcome,
        }))),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => {
            let delivery_id = delivery.unwrap_or_else(|| ingress::body_digest(&body));
            let limit_ms = u64::try_from(app.request_timeout.as_millis()).unwrap_or(u64::MAX);
            tracing::warn!(delivery = %delivery_id, event = %event, limit_ms, "delivery timed out");
            if let Err(e) = app
                .orchestrator
                .record_timeout(&delivery_id, app.request_timeout)
                .await
            {
                tracing::error!(delivery = %delivery_id, error = %e, "could not record timeout");
            }
            Ok(Json(serde_json::json!({
                "status": "ok",
                "outcome": { "kind": "timed_out", "limit_ms": limit_ms },
            })))
        }
    }
}
