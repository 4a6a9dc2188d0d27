//! Relay error taxonomy and its HTTP mapping.

use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Literal body of a filter denial.
pub const BLOCKED_BODY: &str = "blocked";

/// Errors surfaced to the original caller of a relayed request.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RelayError {
    /// Missing or unknown broker token.
    #[error("unauthorized")]
    Unauthorized,

    /// No filter rule allows the request.
    #[error("request blocked by filter")]
    FilterDenied,

    /// No response arrived before the deadline.
    #[error("no response within {0:?}")]
    Timeout(Duration),

    /// The tunnel closed while the request was pending.
    #[error("tunnel channel lost")]
    ChannelLost,

    /// The client could not reach the private service.
    #[error("local dispatch failed: {0}")]
    LocalDispatch(String),

    #[error("request body exceeds {0} bytes")]
    PayloadTooLarge(usize),

    /// The peer broke the relay protocol.
    #[error("protocol violation: {0}")]
    Protocol(String),
}

/// Result type for relay operations.
pub type RelayResult<T> = Result<T, RelayError>;

impl RelayError {
    pub fn status(&self) -> StatusCode {
        match self {
            RelayError::Unauthorized | RelayError::FilterDenied => StatusCode::UNAUTHORIZED,
            RelayError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            RelayError::ChannelLost | RelayError::LocalDispatch(_) | RelayError::Protocol(_) => {
                StatusCode::BAD_GATEWAY
            }
            RelayError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
        }
    }

    /// Short label used for metrics.
    pub fn outcome(&self) -> &'static str {
        match self {
            RelayError::Unauthorized => "unauthorized",
            RelayError::FilterDenied => "blocked",
            RelayError::Timeout(_) => "timeout",
            RelayError::ChannelLost => "channel_lost",
            RelayError::LocalDispatch(_) => "dispatch_error",
            RelayError::PayloadTooLarge(_) => "too_large",
            RelayError::Protocol(_) => "protocol_error",
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status();
        match self {
            RelayError::Unauthorized => status.into_response(),
            RelayError::FilterDenied => (status, BLOCKED_BODY).into_response(),
            other => (status, other.to_string()).into_response(),
        }
    }
}
