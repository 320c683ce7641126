use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::store::{StoreError, TransactionError};

use super::error_payload::ErrorPayload;

/// Application error types
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// A request that can never succeed as issued, e.g. following yourself.
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Concurrent writers kept invalidating the transaction until its retry
    /// budget ran out.
    #[error("Transaction conflict after {0} attempts, please try again")]
    TransactionConflict(u32),

    #[error("An error occurred while accessing the document store: {0}")]
    StoreUnavailable(String),

    #[error("Internal server error: {0}")]
    InternalServerError(String),
}

impl AppError {
    pub fn code(&self) -> StatusCode {
        match self {
            AppError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::InvalidOperation(_) => StatusCode::BAD_REQUEST,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::TransactionConflict(_) => StatusCode::CONFLICT,
            AppError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::InternalServerError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_type(&self) -> String {
        match self {
            AppError::Unauthenticated(_) => "UNAUTHENTICATED",
            AppError::Forbidden(_) => "FORBIDDEN",
            AppError::InvalidOperation(_) => "INVALID_OPERATION",
            AppError::BadRequest(_) => "BAD_REQUEST",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::TransactionConflict(_) => "TRANSACTION_CONFLICT",
            AppError::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            AppError::InternalServerError(_) => "INTERNAL_SERVER_ERROR",
        }
        .to_string()
    }

    /// Transient failures the caller may retry as a whole.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::TransactionConflict(_) | AppError::StoreUnavailable(_)
        )
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(message) => AppError::StoreUnavailable(message),
            StoreError::Conflict => AppError::TransactionConflict(1),
            StoreError::NotFound(path) => AppError::NotFound(format!("Document {}", path)),
            StoreError::InvalidPath(path) => {
                AppError::BadRequest(format!("Invalid identifier: {}", path))
            }
            err @ (StoreError::ReadAfterWrite | StoreError::Serialization(_)) => {
                AppError::InternalServerError(err.to_string())
            }
        }
    }
}

impl From<TransactionError<StoreError>> for AppError {
    fn from(err: TransactionError<StoreError>) -> Self {
        match err {
            TransactionError::Aborted(err) | TransactionError::Store(err) => err.into(),
            TransactionError::Exhausted { attempts } => AppError::TransactionConflict(attempts),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.code();
        let error_response = ErrorPayload {
            message: self.to_string(),
            code: status.as_u16(),
            r#type: self.error_type(),
            retryable: self.is_retryable(),
        };

        (status, Json(error_response)).into_response()
    }
}
