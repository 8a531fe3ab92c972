use thiserror::Error;

/// Error taxonomy per the core's error handling design.
///
/// Request handlers translate this into the external `{success, data?,
/// message?}` envelope; background tasks log and move on to the next unit
/// of work rather than propagating.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AppError {
    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Invariant(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// Translates the error taxonomy into the `{success, data?, message?}`
/// envelope described in spec.md §6, with the status-code mapping from
/// §7. Invariant violations are logged as critical before being reported,
/// per the propagation rule in §7.
impl axum::response::IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        if let AppError::Invariant(ref msg) = self {
            tracing::error!(target: "invariant", message = %msg, "invariant violation");
        }

        let status = self.status_code();
        let body = serde_json::json!({
            "success": false,
            "message": self.to_string(),
        });
        (status, axum::Json(body)).into_response()
    }
}
