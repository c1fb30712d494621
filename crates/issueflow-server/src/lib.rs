pub mod agents;
pub mod error;
pub mod github;
pub mod routes;
pub mod state;

use axum::routing::{get, post};
use axum::Router;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

pub use state::AppState;

/// Build the axum Router with all API routes and middleware.
pub fn build_router(app_state: AppState) -> Router {
    // The webhook route enforces its own limit so a timed-out delivery is
    // still recorded; the other routes get a plain transport timeout.
    let api = Router::new()
        .route("/api/health", get(routes::health::health))
        .route("/api/health/ping", get(routes::health::ping))
        .route(
            "/api/conversations",
            get(routes::conversations::list_conversations),
        )
        .route(
            "/api/conversations/{owner}/{repo}/{issue}",
            get(routes::conversations::get_workflow_status),
        )
        .route("/api/actions", get(routes::actions::list_actions))
        .route("/api/reconcile", get(routes::reconcile::reconcile))
        .route(
            "/api/pull-requests/{owner}/{repo}/{pr}/sync",
            post(routes::pull_requests::sync_pull_request),
        )
        .layer(TimeoutLayer::new(app_state.request_timeout));

    Router::new()
        .route(
            "/api/webhooks/github",
            post(routes::webhooks::github_webhook),
        )
        .merge(api)
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}

/// Serve on a pre-bound listener.
///
/// The caller binds first and can read the actual port (useful when
/// `port = 0` and the OS picks a free port).
pub async fn serve_on(listener: tokio::net::TcpListener, state: AppState) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    if state.webhook_secret.trim().is_empty() {
        tracing::warn!("webhook secret is empty; every delivery will be rejected");
    }
    tracing::info!(%addr, "issueflow listening");

    axum::serve(listener, build_router(state)).await?;
    Ok(())
}
