use axum::extract::State;
use axum::Json;

use crate::error::AppError;
use crate::state::AppState;

/// GET /api/reconcile: decisions logged without a committed transition.
/// Read-only; nothing is repaired.
pub async fn reconcile(State(app): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    let cases = app.orchestrator.reconcile().await?;
    Ok(Json(serde_json::json!({
        "count": cases.len(),
        "cases": cases,
    })))
}
