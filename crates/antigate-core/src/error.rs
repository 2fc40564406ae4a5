use http::StatusCode;
use serde_json::Value as JsonValue;

use antigate_pool::PoolError;
use antigate_storage::StorageError;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("api key not configured")]
    AuthMissing,
    #[error("invalid api key")]
    AuthInvalid,
    #[error("no credential available")]
    NoCredentialAvailable,
    #[error("credential not found")]
    CredentialNotFound,
    #[error("auth exchange failed: {0}")]
    AuthExchangeFailed(String),
    #[error("project id missing")]
    ProjectIdMissing,
    /// Upstream answered with a non-success status that is not retryable
    /// (or retries ran out).
    #[error("upstream error ({status}): {message}")]
    Upstream { status: u16, message: String },
    #[error("upstream transport: {0}")]
    Transport(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::BadRequest(_) | GatewayError::ProjectIdMissing => {
                StatusCode::BAD_REQUEST
            }
            GatewayError::AuthMissing => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::AuthInvalid => StatusCode::UNAUTHORIZED,
            GatewayError::NoCredentialAvailable => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::CredentialNotFound => StatusCode::NOT_FOUND,
            GatewayError::AuthExchangeFailed(_) | GatewayError::Storage(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            GatewayError::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
            GatewayError::Transport(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn body(&self) -> JsonValue {
        serde_json::json!({ "error": { "message": self.to_string() } })
    }
}

impl From<PoolError> for GatewayError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::NoCredentialAvailable => GatewayError::NoCredentialAvailable,
            PoolError::CredentialNotFound => GatewayError::CredentialNotFound,
            PoolError::Storage(err) => GatewayError::Storage(err),
        }
    }
}
