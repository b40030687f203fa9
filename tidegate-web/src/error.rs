//! HTTP error mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tidegate_core::{GatewayError, LookupError, StreamError, TorrentError};

/// Status used when the client went away before the response was ready.
pub const CLIENT_CLOSED_REQUEST: u16 = 499;

/// Errors returned by handlers. Bodies are plain text.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    /// Info not known yet and the client asked not to wait
    #[error("info not ready")]
    NotReady,

    #[error("request canceled")]
    ClientCancelled,

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::NotReady => StatusCode::ACCEPTED,
            Self::ClientCancelled => {
                StatusCode::from_u16(CLIENT_CLOSED_REQUEST).unwrap_or(StatusCode::BAD_REQUEST)
            }
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        match &self {
            Self::Internal(message) => tracing::error!("Request failed: {}", message),
            Self::ClientCancelled => tracing::debug!("Client cancelled request"),
            _ => tracing::debug!("Request rejected with {}: {}", status, self),
        }
        (status, format!("{self}\n")).into_response()
    }
}

impl From<TorrentError> for ApiError {
    fn from(error: TorrentError) -> Self {
        match error {
            TorrentError::InvalidInfoHash { .. }
            | TorrentError::InvalidTorrentFile { .. }
            | TorrentError::InvalidMagnetLink { .. }
            | TorrentError::InfoHashMismatch { .. } => Self::BadRequest(error.to_string()),
            TorrentError::InfoNotReady { .. } => Self::NotReady,
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<StreamError> for ApiError {
    fn from(error: StreamError) -> Self {
        match error {
            StreamError::Cancelled => Self::ClientCancelled,
            StreamError::NotReady { .. } => Self::NotReady,
            StreamError::FileNotFound { .. } => Self::NotFound("file not found".to_string()),
            StreamError::Torrent(e) => e.into(),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<LookupError> for ApiError {
    fn from(error: LookupError) -> Self {
        match error {
            LookupError::InvalidTarget { reason } => Self::BadRequest(reason),
            LookupError::NotFound => Self::NotFound("not found".to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<GatewayError> for ApiError {
    fn from(error: GatewayError) -> Self {
        match error {
            GatewayError::Torrent(e) => e.into(),
            GatewayError::Stream(e) => e.into(),
            GatewayError::Lookup(e) => e.into(),
            other if other.is_user_error() => Self::BadRequest(other.to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
