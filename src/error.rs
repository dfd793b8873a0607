//! Error taxonomy and JSON error responses for the gateway

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE, RETRY_AFTER};
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Response type produced by every gateway handler
pub type GatewayResponse = Response<Full<Bytes>>;

/// Header carrying the machine-readable error code
pub const X_GATEWAY_ERROR: &str = "x-gateway-error";

/// Error codes for gateway failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Unknown correlation id, process or route
    NotFound,
    /// Method/path not declared by the backend's spec
    ValidationRejected,
    /// Backend unreachable, spec fetch failed or health probe failed
    UpstreamUnavailable,
    /// Per-client quota exhausted
    RateLimited,
    /// Storage or OS call failure
    Infrastructure,
    /// Anything unclassified
    Internal,
    /// Malformed request body or parameters
    BadRequest,
    /// Known route, unsupported method
    MethodNotAllowed,
}

impl ErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::ValidationRejected => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorCode::UpstreamUnavailable => StatusCode::BAD_GATEWAY,
            ErrorCode::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::Infrastructure => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            ErrorCode::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
        }
    }

    /// Get the error code as a string for the X-Gateway-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::ValidationRejected => "VALIDATION_REJECTED",
            ErrorCode::UpstreamUnavailable => "UPSTREAM_UNAVAILABLE",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::Infrastructure => "INFRASTRUCTURE",
            ErrorCode::Internal => "INTERNAL",
            ErrorCode::BadRequest => "BAD_REQUEST",
            ErrorCode::MethodNotAllowed => "METHOD_NOT_ALLOWED",
        }
    }
}

/// A classified failure, translated to a status code at the HTTP boundary
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct GatewayError {
    pub code: ErrorCode,
    pub message: String,
    /// Seconds the caller should wait before retrying (rate limiting only)
    pub retry_after: Option<u64>,
}

impl GatewayError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationRejected, message)
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::UpstreamUnavailable, message)
    }

    pub fn rate_limited(retry_after_secs: u64) -> Self {
        Self {
            code: ErrorCode::RateLimited,
            message: "Rate limit exceeded".to_string(),
            retry_after: Some(retry_after_secs),
        }
    }

    pub fn infrastructure(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Infrastructure, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadRequest, message)
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn status_code(&self) -> StatusCode {
        self.code.status_code()
    }

    /// Render as a JSON error response
    pub fn into_response(self) -> GatewayResponse {
        let mut response = json_error_response(self.code, self.message);
        if let Some(secs) = self.retry_after {
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

impl From<crate::db::RegistryError> for GatewayError {
    fn from(err: crate::db::RegistryError) -> Self {
        Self::infrastructure(err.to_string())
    }
}

impl From<crate::spec_cache::SpecError> for GatewayError {
    fn from(err: crate::spec_cache::SpecError) -> Self {
        Self::upstream(err.to_string())
    }
}

impl From<crate::validator::ValidationError> for GatewayError {
    fn from(err: crate::validator::ValidationError) -> Self {
        Self::rejected(err.to_string())
    }
}

impl From<crate::supervisor::SupervisorError> for GatewayError {
    fn from(err: crate::supervisor::SupervisorError) -> Self {
        match err {
            crate::supervisor::SupervisorError::HealthCheckFailed { .. } => {
                Self::upstream(err.to_string())
            }
            crate::supervisor::SupervisorError::Os(_) => Self::infrastructure(err.to_string()),
        }
    }
}

impl From<crate::provision::ProvisionError> for GatewayError {
    fn from(err: crate::provision::ProvisionError) -> Self {
        Self::internal(err.diagnostic())
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: ErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Gateway-Error header
pub fn json_error_response(code: ErrorCode, message: impl Into<String>) -> GatewayResponse {
    let error = ErrorResponse::new(code, message);
    Response::builder()
        .status(code.status_code())
        .header(CONTENT_TYPE, "application/json")
        .header(X_GATEWAY_ERROR, code.as_header_value())
        .body(Full::new(Bytes::from(error.to_json())))
        .expect("valid response with StatusCode enum and static headers")
}

/// Create a JSON success response
pub fn json_response(status: StatusCode, body: impl Into<Bytes>) -> GatewayResponse {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}
