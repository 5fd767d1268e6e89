use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use tracing::warn;

use crate::{relay::RelayError, upstream::UpstreamError};

#[derive(Debug, Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub code: Option<&'static str>,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            code: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
            code: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
            code: Some("NOT_FOUND"),
        }
    }

    fn with_code(mut self, code: &'static str) -> Self {
        self.code = Some(code);
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            success: false,
            error: self.message,
            code: self.code,
        });

        (self.status, body).into_response()
    }
}

impl From<RelayError> for ApiError {
    fn from(error: RelayError) -> Self {
        match error {
            RelayError::UnsupportedContent => ApiError::bad_request(
                "This post is an image album and cannot be downloaded as a single file.",
            )
            .with_code("UNSUPPORTED_CONTENT"),
            RelayError::Transport(error) => {
                warn!("Media relay fetch failed: {error}");
                Self {
                    status: StatusCode::BAD_GATEWAY,
                    message: "Could not fetch the requested media.".to_string(),
                    code: Some("RELAY_FAILED"),
                }
            }
            RelayError::Conversion(reason) => {
                warn!("Image conversion failed: {reason}");
                ApiError::internal("Error converting image").with_code("CONVERSION_FAILED")
            }
        }
    }
}

impl From<UpstreamError> for ApiError {
    fn from(error: UpstreamError) -> Self {
        warn!("Aggregation API call failed: {error}");
        match error {
            UpstreamError::MissingCredential => {
                ApiError::bad_request("No API key is configured. Save one in the settings first.")
                    .with_code("MISSING_API_KEY")
            }
            UpstreamError::Status(status) => {
                ApiError::bad_request(format!("Aggregation API error (HTTP {status})."))
                    .with_code("UPSTREAM_ERROR")
            }
            UpstreamError::Transport(error) => ApiError::internal(error.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_errors_map_to_distinct_statuses() {
        let unsupported = ApiError::from(RelayError::UnsupportedContent);
        assert_eq!(unsupported.status, StatusCode::BAD_REQUEST);
        assert_eq!(unsupported.code, Some("UNSUPPORTED_CONTENT"));

        let conversion = ApiError::from(RelayError::Conversion("bad magic".to_string()));
        assert_eq!(conversion.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(conversion.code, Some("CONVERSION_FAILED"));
    }

    #[test]
    fn upstream_status_is_a_client_error() {
        let error = ApiError::from(UpstreamError::Status(StatusCode::UNAUTHORIZED));
        assert_eq!(error.status, StatusCode::BAD_REQUEST);
        assert_eq!(error.code, Some("UPSTREAM_ERROR"));
    }
}
