use axum::extract::{Path, State};
use axum::Json;

use crate::error::AppError;
use crate::state::AppState;

/// POST /api/pull-requests/{owner}/{repo}/{pr}/sync: poll GitHub for the
/// pull request and apply a merge or close whose webhook never arrived.
pub async fn sync_pull_request(
    State(app): State<AppState>,
    Path((owner, repo, pr)): Path<(String, String, u64)>,
) -> Result<Json<serde_json::Value>, AppError> {
    let repo = format!("{owner}/{repo}");
    let outcome = app.orchestrator.sync_pull_request(&repo, pr).await?;
    tracing::info!(repo = %repo, pr, "pull request synced");
    Ok(Json(serde_json::json!({
        "status": "ok",
        "outcome": outcome,
    })))
}
