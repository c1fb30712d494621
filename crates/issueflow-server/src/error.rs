use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use issueflow_core::FlowError;

// ---------------------------------------------------------------------------
// Internal sentinels
// ---------------------------------------------------------------------------

/// Carries an explicit 400 through the `anyhow::Error` chain.
#[derive(Debug)]
struct BadRequestError(String);

impl std::fmt::Display for BadRequestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for BadRequestError {}

// ---------------------------------------------------------------------------
// AppError: unified error type for HTTP responses
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl AppError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self(BadRequestError(msg.into()).into())
    }
}

fn status_for(e: &FlowError) -> StatusCode {
    match e {
        FlowError::Authentication(_) => StatusCode::UNAUTHORIZED,
        FlowError::MalformedPayload(_) | FlowError::InvalidStatus(_) => StatusCode::BAD_REQUEST,
        FlowError::ConversationNotFound(_) | FlowError::GenerationNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        FlowError::ConcurrencyConflict { .. } | FlowError::GenerationInFlight { .. } => {
            StatusCode::CONFLICT
        }
        FlowError::InvalidTransition { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        FlowError::Collaborator(_) => StatusCode::BAD_GATEWAY,
        FlowError::SchemaDrift(_)
        | FlowError::Storage(_)
        | FlowError::Config(_)
        | FlowError::Io(_)
        | FlowError::Yaml(_)
        | FlowError::Json(_)
        | FlowError::Sqlite(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if let Some(b) = self.0.downcast_ref::<BadRequestError>() {
            let body = serde_json::json!({ "error": b.0.clone() });
            return (StatusCode::BAD_REQUEST, axum::Json(body)).into_response();
        }

        let status = self
            .0
            .downcast_ref::<FlowError>()
            .map(status_for)
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        }

        let body = serde_json::json!({ "error": self.0.to_string() });
        (status, axum::Json(body)).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
