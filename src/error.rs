//! Error handling and JSON error responses for the panel API

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Error codes reported by the panel API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PanelErrorCode {
    /// Missing or wrong API token
    Unauthorized,
    /// Unknown route or resource
    NotFound,
    /// Malformed or invalid request body
    BadRequest,
    /// Resource already exists or is in use
    Conflict,
    /// The container engine rejected or failed the call
    EngineError,
    /// nginx rejected the generated configuration
    ProxyConfigInvalid,
    /// An external command (nginx, certbot) failed
    CommandFailed,
    /// Internal panel error
    InternalError,
}

impl PanelErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            PanelErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            PanelErrorCode::NotFound => StatusCode::NOT_FOUND,
            PanelErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            PanelErrorCode::Conflict => StatusCode::CONFLICT,
            PanelErrorCode::EngineError => StatusCode::BAD_GATEWAY,
            PanelErrorCode::ProxyConfigInvalid => StatusCode::UNPROCESSABLE_ENTITY,
            PanelErrorCode::CommandFailed => StatusCode::INTERNAL_SERVER_ERROR,
            PanelErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Panel-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            PanelErrorCode::Unauthorized => "UNAUTHORIZED",
            PanelErrorCode::NotFound => "NOT_FOUND",
            PanelErrorCode::BadRequest => "BAD_REQUEST",
            PanelErrorCode::Conflict => "CONFLICT",
            PanelErrorCode::EngineError => "ENGINE_ERROR",
            PanelErrorCode::ProxyConfigInvalid => "PROXY_CONFIG_INVALID",
            PanelErrorCode::CommandFailed => "COMMAND_FAILED",
            PanelErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// Typed failure of a panel operation
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Engine(String),

    #[error("nginx rejected the configuration: {0}")]
    ProxyConfigInvalid(String),

    #[error("{0}")]
    CommandFailed(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn code(&self) -> PanelErrorCode {
        match self {
            ApiError::NotFound(_) => PanelErrorCode::NotFound,
            ApiError::BadRequest(_) => PanelErrorCode::BadRequest,
            ApiError::Conflict(_) => PanelErrorCode::Conflict,
            ApiError::Engine(_) => PanelErrorCode::EngineError,
            ApiError::ProxyConfigInvalid(_) => PanelErrorCode::ProxyConfigInvalid,
            ApiError::CommandFailed(_) => PanelErrorCode::CommandFailed,
            ApiError::Internal(_) => PanelErrorCode::InternalError,
        }
    }

    pub fn into_response(self) -> Response<BoxBody<Bytes, hyper::Error>> {
        json_error_response(self.code(), format!("{:#}", self))
    }
}

impl From<bollard::errors::Error> for ApiError {
    fn from(err: bollard::errors::Error) -> Self {
        match err {
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                message,
            } => ApiError::NotFound(message),
            bollard::errors::Error::DockerResponseServerError {
                status_code: 409,
                message,
            } => ApiError::Conflict(message),
            bollard::errors::Error::DockerResponseServerError {
                status_code: 400,
                message,
            } => ApiError::BadRequest(message),
            other => ApiError::Engine(other.to_string()),
        }
    }
}

impl From<crate::logsource::LogSourceError> for ApiError {
    fn from(err: crate::logsource::LogSourceError) -> Self {
        use crate::logsource::LogSourceError;
        match err {
            LogSourceError::NotFound(_) => ApiError::NotFound(err.to_string()),
            other => ApiError::Engine(other.to_string()),
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Always false, matches the success envelope
    pub success: bool,
    /// The error code
    pub code: PanelErrorCode,
    /// Human-readable error message
    pub error: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    /// Create a new error response
    pub fn new(code: PanelErrorCode, message: impl Into<String>) -> Self {
        Self {
            success: false,
            status: code.status_code().as_u16(),
            code,
            error: message.into(),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"success":false,"code":"{}","error":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.error.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Panel-Error header
pub fn json_error_response(
    code: PanelErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    let mut response = Response::new(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed());
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    response.headers_mut().insert(
        "x-panel-error",
        hyper::header::HeaderValue::from_static(code.as_header_value()),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(
            PanelErrorCode::Unauthorized.status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(PanelErrorCode::NotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(PanelErrorCode::Conflict.status_code(), StatusCode::CONFLICT);
        assert_eq!(
            PanelErrorCode::EngineError.status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            PanelErrorCode::ProxyConfigInvalid.status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
    }

    #[test]
    fn test_error_response_json() {
        let error = ErrorResponse::new(PanelErrorCode::NotFound, "No such container: web");
        let json = error.to_json();

        assert!(json.contains("\"success\":false"));
        assert!(json.contains("\"code\":\"NOT_FOUND\""));
        assert!(json.contains("\"error\":\"No such container: web\""));
        assert!(json.contains("\"status\":404"));
    }

    #[test]
    fn test_json_error_response() {
        let response = json_error_response(PanelErrorCode::Conflict, "network in use");

        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
        assert_eq!(response.headers().get("X-Panel-Error").unwrap(), "CONFLICT");
    }

    #[test]
    fn test_engine_errors_map_to_codes() {
        let not_found: ApiError = bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message: "No such network: lan".to_string(),
        }
        .into();
        assert_eq!(not_found.code(), PanelErrorCode::NotFound);

        let conflict: ApiError = bollard::errors::Error::DockerResponseServerError {
            status_code: 409,
            message: "volume is in use".to_string(),
        }
        .into();
        assert_eq!(conflict.code(), PanelErrorCode::Conflict);

        let server: ApiError = bollard::errors::Error::DockerResponseServerError {
            status_code: 500,
            message: "boom".to_string(),
        }
        .into();
        assert_eq!(server.code(), PanelErrorCode::EngineError);
    }

    #[test]
    fn test_log_source_not_found_maps_to_404() {
        let err: ApiError = crate::logsource::LogSourceError::NotFound("web".to_string()).into();
        assert_eq!(err.code(), PanelErrorCode::NotFound);
        assert_eq!(err.to_string(), "No such container: web");
    }
}
