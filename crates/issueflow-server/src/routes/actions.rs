use axum::extract::{Query, State};
use axum::Json;
use issueflow_core::store::ActionQuery;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 500;

#[derive(Debug, Deserialize)]
pub struct ActionsParams {
    pub conversation_id: Option<Uuid>,
    pub action_type: Option<String>,
    pub limit: Option<usize>,
}

/// GET /api/actions: most recent agent actions, oldest first.
pub async fn list_actions(
    State(app): State<AppState>,
    Query(params): Query<ActionsParams>,
) -> Result<Json<serde_json::Value>, AppError> {
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT);
    if limit == 0 || limit > MAX_LIMIT {
        return Err(AppError::bad_request(format!(
            "limit must be between 1 and {MAX_LIMIT}"
        )));
    }
    let actions = app
        .store()
        .list_actions(ActionQuery {
            conversation_id: params.conversation_id,
            action_type: params.action_type.filter(|t| !t.trim().is_empty()),
            limit: Some(limit),
        })
        .await?;
    Ok(Json(serde_json::to_value(actions)?))
}
