use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("permission denied")]
    PermissionDenied,
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),
    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),
    #[error("upstream error: {0}")]
    Upstream(String),
}

impl BillingError {
    pub fn invalid(message: impl Into<String>) -> Self {
        BillingError::InvalidArgument(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        BillingError::NotFound(message.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            BillingError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            BillingError::NotFound(_) => StatusCode::NOT_FOUND,
            BillingError::PermissionDenied => StatusCode::FORBIDDEN,
            BillingError::FailedPrecondition(_) => StatusCode::PRECONDITION_FAILED,
            BillingError::Upstream(_) => StatusCode::BAD_GATEWAY,
            BillingError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for BillingError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(?self);
        } else {
            tracing::debug!(?self, "request rejected");
        }
        (status, self.to_string()).into_response()
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
