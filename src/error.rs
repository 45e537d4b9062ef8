use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Signature check failures on an inbound delivery.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerifyError {
    #[error("missing signature")]
    MissingSignature,

    #[error("signature mismatch")]
    SignatureMismatch,

    #[error("secret cannot be used as an HMAC key")]
    InvalidKey,
}

/// A subscription config that could not be decoded into a scope.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid subscription config: {0}")]
pub struct ScopeError(pub String);

/// Errors talking to the provider's webhook resource.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("provider returned HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error("provider API key is not configured")]
    MissingApiKey,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("registration for account {account} changed concurrently (expected version {expected:?}, found {found:?})")]
    Conflict {
        account: String,
        expected: Option<u64>,
        found: Option<u64>,
    },

    #[error("failed to access store file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode or decode store file: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Failures while setting up or tearing down a subscriber.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Scope(#[from] ScopeError),

    #[error("upstream webhook call failed: {0}")]
    Upstream(#[from] UpstreamError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("gave up on account {account} after {attempts} conflicting writes")]
    Conflict { account: String, attempts: u32 },

    #[error("subscriber not found: {0}")]
    UnknownSubscriber(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EmitError {
    #[error("event sink is closed")]
    Closed,
}

/// Outcome of an inbound delivery that was not acknowledged.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("no registration for account {0}")]
    UnknownAccount(String),

    #[error("invalid signature: {0}")]
    Verification(#[from] VerifyError),

    #[error("error parsing request body: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("error emitting event: {0}")]
    Emit(#[from] EmitError),

    #[error("error loading registration: {0}")]
    Store(#[from] StoreError),
}

impl DeliveryError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::UnknownAccount(_) => StatusCode::NOT_FOUND,
            Self::Verification(_) => StatusCode::FORBIDDEN,
            Self::Malformed(_) => StatusCode::BAD_REQUEST,
            Self::Emit(_) | Self::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::UnknownAccount(_) => "NOT_FOUND",
            Self::Verification(_) => "FORBIDDEN",
            Self::Malformed(_) => "BAD_REQUEST",
            Self::Emit(_) | Self::Store(_) => "INTERNAL_ERROR",
        }
    }
}

impl IntoResponse for DeliveryError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Delivery handling failed");
        } else {
            tracing::warn!(error = %self, "Delivery rejected");
        }
        let body = json!({
            "error": self.to_string(),
            "code": self.code(),
        });
        (status, axum::Json(body)).into_response()
    }
}
