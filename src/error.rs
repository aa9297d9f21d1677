use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("No image data")]
    MissingImageData,
    #[error("No text provided")]
    MissingText,
    #[error("field '{field}' must be a string, got {found}")]
    InvalidField {
        field: &'static str,
        found: &'static str,
    },
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("image decoding failed: {0}")]
    Image(#[from] image::ImageError),
    #[error("tokenizer error: {0}")]
    Tokenizer(String),
    #[error("model execution failed: {0}")]
    Inference(String),
    #[error("generation timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("other: {0}")]
    Other(String),
}

impl ServiceError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServiceError::MissingImageData | ServiceError::MissingText => StatusCode::BAD_REQUEST,
            ServiceError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ServiceError::InvalidField { .. }
            | ServiceError::Base64(_)
            | ServiceError::Image(_)
            | ServiceError::Tokenizer(_)
            | ServiceError::Inference(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServiceError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServiceError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(%status, error = %self, "request failed");
        }

        let body = serde_json::json!({
            "error": self.to_string(),
        });

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_carry_fixed_messages() {
        assert_eq!(ServiceError::MissingImageData.to_string(), "No image data");
        assert_eq!(ServiceError::MissingText.to_string(), "No text provided");
        assert_eq!(
            ServiceError::MissingText.status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn timeout_maps_to_gateway_timeout() {
        let err = ServiceError::Timeout(Duration::from_secs(30));
        assert_eq!(err.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(err.to_string(), "generation timed out after 30s");
    }

    #[test]
    fn mistyped_field_is_a_server_error() {
        let err = ServiceError::InvalidField {
            field: "text",
            found: "null",
        };
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.to_string(), "field 'text' must be a string, got null");
    }

    #[test]
    fn processing_errors_are_server_errors() {
        let err = ServiceError::Inference("out of memory".into());
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.to_string(), "model execution failed: out of memory");
    }
}
