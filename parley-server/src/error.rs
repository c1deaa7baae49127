//! Error taxonomy surfaced to callers of the message service.
//!
//! Every failure a client can observe maps onto one [`ChatError`] variant,
//! which in turn maps onto a wire [`ErrorCode`] for socket clients and an
//! HTTP status for the request/response API.

use parley_proto::event::ErrorCode;
use parley_proto::message::ValidationError;

use crate::auth::AuthError;
use crate::registry::RegistryError;
use crate::store::StoreError;

/// Errors returned by the message service and the gateway.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    /// Malformed or oversized input, rejected before any persistence.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The actor is not a participant of the message or thread.
    #[error("not authorized: {0}")]
    Authorization(String),

    /// The identity token was rejected.
    #[error("authentication failed: {0}")]
    Authentication(#[from] AuthError),

    /// The referenced message or thread does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The store failed; nothing was partially written.
    #[error("persistence failed: {0}")]
    Persistence(String),
}

impl ChatError {
    /// Wire error category for this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Validation(_) => ErrorCode::Validation,
            Self::Authorization(_) => ErrorCode::Authorization,
            Self::Authentication(_) => ErrorCode::Authentication,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::Persistence(_) => ErrorCode::Internal,
        }
    }
}

impl From<ValidationError> for ChatError {
    fn from(err: ValidationError) -> Self {
        Self::Validation(err.to_string())
    }
}

impl From<RegistryError> for ChatError {
    fn from(err: RegistryError) -> Self {
        Self::Validation(err.to_string())
    }
}

impl From<StoreError> for ChatError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => Self::NotFound(format!("message {id}")),
            other => Self::Persistence(other.to_string()),
        }
    }
}
