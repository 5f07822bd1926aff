//! Gateway error taxonomy and its HTTP envelope.
//!
//! Every per-request failure is converted into
//! `{"error": {"message", "type", "code"?, "suggestions"?}}` with a stable
//! status code. Internal failures are logged and reported generically.

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// The config source could not be read, parsed or validated.
    #[error("Invalid model config: {0}")]
    ConfigInvalid(String),

    #[error("Unknown model: {requested}")]
    ModelNotFound {
        requested: String,
        known: Vec<String>,
    },

    /// The resolved descriptor does not support the requested operation.
    #[error("Model {model} does not support {operation}")]
    CapabilityUnsupported { model: String, operation: String },

    #[error("{0}")]
    Unauthorized(String),

    /// Connection refused, timeout or other transport failure talking to a backend.
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The backend answered with a body that is not valid JSON.
    #[error("Backend returned an invalid response: {0}")]
    BackendProtocolError(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, GatewayError>;

#[derive(Debug, Serialize)]
struct ErrorEnvelope<'a> {
    error: ErrorBody<'a>,
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    message: String,
    #[serde(rename = "type")]
    error_type: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    suggestions: Option<&'a [String]>,
}

impl GatewayError {
    /// Stable `type` discriminant exposed to clients.
    pub fn error_type(&self) -> &'static str {
        match self {
            GatewayError::ConfigInvalid(_)
            | GatewayError::CapabilityUnsupported { .. }
            | GatewayError::Unauthorized(_)
            | GatewayError::BadRequest(_) => "invalid_request_error",
            GatewayError::ModelNotFound { .. } => "not_found_error",
            GatewayError::BackendUnavailable(_) | GatewayError::BackendProtocolError(_) => {
                "backend_error"
            }
            GatewayError::Internal(_) => "internal_error",
        }
    }

    fn code(&self) -> Option<&'static str> {
        match self {
            GatewayError::ConfigInvalid(_) => Some("config_invalid"),
            GatewayError::ModelNotFound { .. } => Some("model_not_found"),
            GatewayError::CapabilityUnsupported { .. } => Some("capability_unsupported"),
            GatewayError::Unauthorized(_) => Some("unauthorized"),
            GatewayError::BackendUnavailable(_) => Some("backend_unavailable"),
            GatewayError::BackendProtocolError(_) => Some("backend_protocol_error"),
            GatewayError::BadRequest(_) | GatewayError::Internal(_) => None,
        }
    }

    fn public_message(&self) -> String {
        match self {
            GatewayError::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

impl ResponseError for GatewayError {
    fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::ConfigInvalid(_)
            | GatewayError::CapabilityUnsupported { .. }
            | GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            GatewayError::ModelNotFound { .. } => StatusCode::NOT_FOUND,
            GatewayError::BackendUnavailable(_) | GatewayError::BackendProtocolError(_) => {
                StatusCode::BAD_GATEWAY
            }
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        if let GatewayError::Internal(detail) = self {
            tracing::error!(error = %detail, "unhandled gateway error");
        }
        let suggestions = match self {
            GatewayError::ModelNotFound { known, .. } => Some(known.as_slice()),
            _ => None,
        };
        let envelope = ErrorEnvelope {
            error: ErrorBody {
                message: self.public_message(),
                error_type: self.error_type(),
                code: self.code(),
                suggestions,
            },
        };
        HttpResponse::build(self.status_code()).json(envelope)
    }
}
