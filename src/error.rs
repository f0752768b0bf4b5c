use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

/// Application-wide error types with appropriate HTTP status codes.
///
/// # Connection Errors
///
/// RPC connection problems are split into specific variants so the requester
/// can decide when a reconnect is worth attempting:
///
/// - `ConnectionFailed` - Initial connection or reconnection failed
/// - `Disconnected` - Lost connection during operation (triggers reconnection)
///
/// # Upstream Errors
///
/// Failures talking to the reservation service over HTTP (edge side) map to
/// gateway status codes: `Upstream` is a 502, `OperationTimeout` a 504.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Failed to connect to RPC endpoint: {0}")]
    ConnectionFailed(String),

    #[error("Disconnected from RPC endpoint: {0}")]
    Disconnected(String),

    #[error("RPC protocol violation: {0}")]
    Protocol(String),

    #[error("RPC request failed ({code}): {message}")]
    Remote { code: String, message: String },

    #[error("Upstream request failed: {0}")]
    Upstream(String),

    #[error("Circuit breaker open: {0}")]
    CircuitOpen(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Operation timed out: {0}")]
    OperationTimeout(String),
}

impl AppError {
    /// Whether the error means the RPC connection is gone and a reconnect may help.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            AppError::ConnectionFailed(_) | AppError::Disconnected(_)
        )
    }
}

impl From<std::io::Error> for AppError {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;

        match e.kind() {
            ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe => AppError::Disconnected(e.to_string()),
            ErrorKind::ConnectionRefused | ErrorKind::NotFound => {
                AppError::ConnectionFailed(e.to_string())
            }
            _ => AppError::Internal(e.to_string()),
        }
    }
}

/// Error response body for API endpoints.
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        // Log the full error details server-side for debugging
        // but only expose sanitized messages to clients
        tracing::error!(error = %self, "Request failed");

        let (status, error_type, message) = match &self {
            // Service availability errors - don't leak connection details
            AppError::ConnectionFailed(_) | AppError::Disconnected(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "rpc_unavailable",
                "Greetings service is temporarily unavailable. Please try again later.",
            ),
            AppError::CircuitOpen(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "circuit_open",
                "Upstream service is temporarily unavailable. Please try again later.",
            ),

            // Bad gateway - the upstream answered, but not usefully
            AppError::Upstream(_) => (
                StatusCode::BAD_GATEWAY,
                "bad_gateway",
                "Upstream service request failed.",
            ),
            AppError::Protocol(_) => (
                StatusCode::BAD_GATEWAY,
                "protocol_error",
                "Upstream service sent an invalid response.",
            ),
            AppError::Remote { code, .. } if code == "REJECTED" => (
                StatusCode::UNAUTHORIZED,
                "rejected",
                "Upstream service rejected the credentials.",
            ),
            AppError::Remote { code, .. } if code == "INVALID_DATA" => (
                StatusCode::BAD_REQUEST,
                "invalid_data",
                "Upstream service rejected the request data.",
            ),
            AppError::Remote { .. } => (
                StatusCode::BAD_GATEWAY,
                "remote_error",
                "Upstream service reported an error.",
            ),

            // Internal errors - never expose internal details to clients
            AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "An internal error occurred. Please contact support if the issue persists.",
            ),
            AppError::ConfigError(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "config_error",
                "Service configuration error. Please contact support.",
            ),

            // Timeout errors - client can retry
            AppError::OperationTimeout(_) => (
                StatusCode::GATEWAY_TIMEOUT,
                "timeout",
                "Operation timed out. Please try again.",
            ),

            // Client errors - safe to show the message as it's user-facing
            AppError::SerializationError(e) => {
                // Serde errors can be helpful for clients debugging their payload
                // but sanitize to avoid leaking internal type names
                let sanitized = sanitize_serde_error(e);
                return (
                    StatusCode::BAD_REQUEST,
                    axum::Json(ErrorResponse {
                        error: "serialization_error".to_string(),
                        message: sanitized,
                        details: None,
                    }),
                )
                    .into_response();
            }
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.as_str()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.as_str()),
            AppError::Unauthorized(msg) => {
                (StatusCode::UNAUTHORIZED, "unauthorized", msg.as_str())
            }
        };

        let body = ErrorResponse {
            error: error_type.to_string(),
            message: message.to_string(),
            details: None, // Never expose internal details to clients
        };

        (status, axum::Json(body)).into_response()
    }
}

/// Sanitize serde error messages to avoid leaking internal type information.
///
/// Serde errors can contain internal struct/field names which shouldn't be
/// exposed to external clients. This function extracts the useful parts.
fn sanitize_serde_error(e: &serde_json::Error) -> String {
    let msg = e.to_string();

    if let Some(field) = backticked(&msg, "missing field") {
        return format!("Missing required field: {field}");
    }

    if let Some(field) = backticked(&msg, "unknown field") {
        return format!("Unknown field: {field}");
    }

    if msg.contains("invalid type") {
        return "Invalid data type in request body".to_string();
    }

    if msg.contains("EOF while parsing") || msg.contains("expected") {
        return "Malformed JSON in request body".to_string();
    }

    // Generic fallback that doesn't leak internal details
    "Invalid request format".to_string()
}

/// First backticked token of `msg` when it contains `marker`.
fn backticked<'a>(msg: &'a str, marker: &str) -> Option<&'a str> {
    if !msg.contains(marker) {
        return None;
    }
    let start = msg.find('`')? + 1;
    let end = msg.get(start..)?.find('`')?;
    msg.get(start..start + end)
}

/// Convenience type alias for Results with AppError.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn status_of(err: AppError) -> StatusCode {
        err.into_response().status()
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_of(AppError::NotFound("x".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(AppError::BadRequest("x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(AppError::Upstream("x".into())),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_of(AppError::OperationTimeout("x".into())),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            status_of(AppError::Disconnected("x".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_of(AppError::Remote {
                code: "REJECTED".into(),
                message: "bad creds".into()
            }),
            StatusCode::UNAUTHORIZED
        );
    }

    #[test]
    fn test_io_errors_classify_as_connection_errors() {
        let eof = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        assert!(matches!(AppError::from(eof), AppError::Disconnected(_)));

        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = AppError::from(refused);
        assert!(err.is_connection_error());

        let other = std::io::Error::other("boom");
        assert!(!AppError::from(other).is_connection_error());
    }

    #[test]
    fn test_sanitize_missing_field() {
        let err = serde_json::from_str::<crate::models::NewReservation>("{}").unwrap_err();
        assert_eq!(sanitize_serde_error(&err), "Missing required field: name");
    }

    #[test]
    fn test_sanitize_malformed_json() {
        let err = serde_json::from_str::<crate::models::NewReservation>("{\"name\":").unwrap_err();
        assert_eq!(sanitize_serde_error(&err), "Malformed JSON in request body");
    }
}
