use axum::extract::State;
use axum::Json;
use chrono::Utc;

use crate::state::AppState;

/// GET /api/health: store reachability and collaborator configuration.
///
/// Always 200; `status` is `degraded` when any component is not usable.
pub async fn health(State(app): State<AppState>) -> Json<serde_json::Value> {
    let store = match app.store().ping().await {
        Ok(()) => serde_json::json!({ "status": "healthy" }),
        Err(e) => {
            tracing::warn!(error = %e, "store health check failed");
            serde_json::json!({ "status": "unhealthy", "error": e.to_string() })
        }
    };
    let store_ok = store["status"] == "healthy";
    let llm = app.orchestrator.llm_configured();
    let github = app.orchestrator.tracker_configured();
    let webhook = !app.webhook_secret.trim().is_empty();

    let healthy = store_ok && llm && github && webhook;
    Json(serde_json::json!({
        "status": if healthy { "healthy" } else { "degraded" },
        "service": "issueflow",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": Utc::now(),
        "uptime_secs": (Utc::now() - app.started_at).num_seconds(),
        "components": {
            "store": store,
            "llm": { "configured": llm },
            "github": { "configured": github },
            "webhook": { "configured": webhook },
        },
    }))
}

/// GET /api/health/ping
pub async fn ping() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "message": "pong", "timestamp": Utc::now() }))
}
