use axum::extract::{Path, State};
use axum::Json;

use crate::error::AppError;
use crate::state::AppState;

/// GET /api/conversations: every tracked issue, most recently updated first.
pub async fn list_conversations(
    State(app): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    let conversations = app.store().list_conversations().await?;
    let list: Vec<serde_json::Value> = conversations
        .iter()
        .map(|c| {
            serde_json::json!({
                "id": c.id,
                "repo_full_name": c.repo_full_name,
                "issue_number": c.issue_number,
                "status": c.status,
                "version": c.version,
                "turn_count": c.turns.len(),
                "updated_at": c.updated_at,
            })
        })
        .collect();
    Ok(Json(serde_json::json!(list)))
}

/// GET /api/conversations/{owner}/{repo}/{issue}: workflow status of one issue.
pub async fn get_workflow_status(
    State(app): State<AppState>,
    Path((owner, repo, issue)): Path<(String, String, u64)>,
) -> Result<Json<serde_json::Value>, AppError> {
    let status = app
        .orchestrator
        .workflow_status(&format!("{owner}/{repo}"), issue)
        .await?;
    Ok(Json(serde_json::to_value(status)?))
}
