//! Error types for the request surface.

use gapwatch_core::GapError;

use crate::request::{ApiResponse, Method};

/// Request handling error.
#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    /// Error raised by a core service.
    #[error(transparent)]
    Core(#[from] GapError),

    /// Parameters or body could not be interpreted.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// The route exists but not for this method.
    #[error("Unsupported request method {0}")]
    MethodNotAllowed(Method),

    /// No such route.
    #[error("Unknown route {0}")]
    UnknownRoute(String),
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::Core(GapError::Json(err))
    }
}

impl ApiError {
    /// Shorthand for a [`ApiError::BadRequest`].
    pub fn bad_request(message: impl Into<String>) -> Self {
        ApiError::BadRequest(message.into())
    }

    /// Status code for this error.
    pub fn status(&self) -> u16 {
        match self {
            ApiError::BadRequest(_) => 400,
            ApiError::MethodNotAllowed(_) => 405,
            ApiError::UnknownRoute(_) => 404,
            ApiError::Core(err) => match err {
                GapError::Validation(_) | GapError::NotRegistered(_) => 400,
                GapError::NotFound(_) => 404,
                GapError::ConcurrencyConflict(_) => 409,
                GapError::BackfillTooLarge { .. } => 413,
                GapError::DownstreamUnavailable(_) => 503,
                _ => 500,
            },
        }
    }

    /// Converts the error into a `{"message": ...}` response.
    pub fn into_response(self) -> ApiResponse {
        ApiResponse::message(self.status(), self.to_string())
    }
}

/// Type alias for Result with ApiError.
pub type Result<T> = std::result::Result<T, ApiError>;
