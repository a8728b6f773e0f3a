//! Controller errors and their plain-text HTTP rendering

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use thiserror::Error;

/// Result type for controller operations
pub type Result<T> = std::result::Result<T, ControllerError>;

/// Errors surfaced to the proxy in the reply body
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Missing or unparseable query parameter
    #[error("{reason}, service name = `{name}`, timeout = `{timeout}`")]
    ParameterInvalid {
        reason: String,
        name: String,
        timeout: String,
    },

    /// Docker engine unreachable or the list call failed
    #[error("container engine unavailable: {0}")]
    BackendUnavailable(String),

    /// Discovery found no container for the service
    #[error("no containers found, service name = `{name}`, host = `{host}`, path = `{path}`")]
    NoMatches {
        name: String,
        host: String,
        path: String,
    },

    /// The engine refused to start a container
    #[error("failed to start container {id}: {reason}")]
    StartFailed { id: String, reason: String },

    /// The engine refused to stop a container
    #[error("failed to stop container {id}: {reason}")]
    StopFailed { id: String, reason: String },
}

impl ControllerError {
    /// Get the HTTP status code used when strict status codes are enabled
    pub fn status_code(&self) -> StatusCode {
        match self {
            ControllerError::ParameterInvalid { .. } => StatusCode::BAD_REQUEST,
            ControllerError::BackendUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ControllerError::NoMatches { .. } => StatusCode::NOT_FOUND,
            ControllerError::StartFailed { .. } => StatusCode::BAD_GATEWAY,
            ControllerError::StopFailed { .. } => StatusCode::BAD_GATEWAY,
        }
    }

    /// Get the error code for the X-Controller-Error header
    pub fn code(&self) -> &'static str {
        match self {
            ControllerError::ParameterInvalid { .. } => "PARAMETER_INVALID",
            ControllerError::BackendUnavailable(_) => "BACKEND_UNAVAILABLE",
            ControllerError::NoMatches { .. } => "NO_MATCHES",
            ControllerError::StartFailed { .. } => "START_FAILED",
            ControllerError::StopFailed { .. } => "STOP_FAILED",
        }
    }

    /// Reply body sent to the proxy
    pub fn reply(&self) -> String {
        format!("error: {}", self)
    }
}

impl From<bollard::errors::Error> for ControllerError {
    fn from(err: bollard::errors::Error) -> Self {
        ControllerError::BackendUnavailable(err.to_string())
    }
}

/// Build a plain-text error response.
///
/// The proxy in front of the controller historically treats every non-200 as
/// a hard failure, so the status stays 200 unless `strict` is set.
pub fn error_response(err: &ControllerError, strict: bool) -> Response<Full<Bytes>> {
    let status = if strict {
        err.status_code()
    } else {
        StatusCode::OK
    };

    Response::builder()
        .status(status)
        .header("Content-Type", "text/plain; charset=utf-8")
        .header("X-Controller-Error", err.code())
        .body(Full::new(Bytes::from(err.reply())))
        .expect("valid response with StatusCode enum and static headers")
}
