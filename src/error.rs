use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("{0}")]
    Validation(String),

    #[error("no credentials supplied; pass them via `Authorization: Bearer k1,k2` or `x-goog-api-key`")]
    AuthMissing,

    #[error("unknown path")]
    NotFound,

    #[error("method not allowed")]
    MethodNotAllowed,

    #[error("upstream rate limited")]
    RateLimited { body: String },

    #[error("no credential available; all credentials are cooling down")]
    NoCredentialAvailable,

    #[error("{0}")]
    ServiceUnavailable(String),

    #[error("upstream returned status {code}")]
    UpstreamStatus { code: u16, body: String },

    #[error("upstream call exceeded its time budget")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("malformed upstream response: {0}")]
    Parse(String),

    #[error("format conversion failed: {0}")]
    FormatConversion(String),
}

pub type GatewayResult<T> = Result<T, GatewayError>;

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::AuthMissing => StatusCode::UNAUTHORIZED,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::NoCredentialAvailable | Self::ServiceUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            // Mirror the upstream status; anything that is not a valid error
            // status collapses to 502.
            Self::UpstreamStatus { code, .. } => {
                StatusCode::from_u16(*code).ok().filter(|s| s.is_client_error() || s.is_server_error())
                    .unwrap_or(StatusCode::BAD_GATEWAY)
            }
            Self::Timeout => StatusCode::GATEWAY_TIMEOUT,
            Self::Network(_) | Self::Parse(_) | Self::FormatConversion(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn kind(&self) -> (&'static str, &'static str) {
        match self {
            Self::Validation(_) => ("invalid_request_error", "validation_error"),
            Self::AuthMissing => ("authentication_error", "auth_missing"),
            Self::NotFound => ("invalid_request_error", "not_found"),
            Self::MethodNotAllowed => ("invalid_request_error", "method_not_allowed"),
            Self::RateLimited { .. } => ("rate_limit_error", "rate_limited"),
            Self::NoCredentialAvailable => ("unavailable_error", "no_credential_available"),
            Self::ServiceUnavailable(_) => ("unavailable_error", "service_unavailable"),
            Self::UpstreamStatus { .. } => ("upstream_error", "upstream_status"),
            Self::Timeout => ("upstream_error", "timeout"),
            Self::Network(_) => ("upstream_error", "network"),
            Self::Parse(_) => ("upstream_error", "parse"),
            Self::FormatConversion(_) => ("internal_error", "format_conversion"),
        }
    }

    fn details(&self) -> Option<Value> {
        let body = match self {
            Self::RateLimited { body } | Self::UpstreamStatus { body, .. } => body,
            _ => return None,
        };
        if body.is_empty() {
            return None;
        }
        // Pass the upstream body through verbatim, parsed when it is JSON.
        Some(serde_json::from_str(body).unwrap_or_else(|_| Value::String(body.clone())))
    }

    pub fn to_document(&self) -> Value {
        let (error_type, code) = self.kind();
        let mut error = json!({
            "message": self.to_string(),
            "type": error_type,
            "code": code,
        });
        if let Some(details) = self.details() {
            error["details"] = details;
        }
        json!({ "error": error })
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.to_document())).into_response()
    }
}
