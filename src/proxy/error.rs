use super::image::ImageNotSupportedError;
use super::models::openai::ErrorBody;
use super::upstream::{AuthError, UpstreamError};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Server is already running")]
    AlreadyRunning,

    #[error("Server is not running")]
    NotRunning,

    #[error("Failed to bind address: {0}")]
    BindFailed(String),

    #[error("Timed out waiting for the server to stop")]
    StopTimeout,

    #[error("{0}")]
    InvalidRequest(String),

    #[error("Request body exceeds the limit of {0} bytes")]
    PayloadTooLarge(usize),

    #[error("The model `{0}` does not exist")]
    ModelNotFound(String),

    #[error(transparent)]
    ImageNotSupported(#[from] ImageNotSupportedError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Upstream(UpstreamError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<UpstreamError> for ProxyError {
    fn from(error: UpstreamError) -> Self {
        match error {
            UpstreamError::Auth(auth) => ProxyError::Auth(auth),
            other => ProxyError::Upstream(other),
        }
    }
}

impl ProxyError {
    /// HTTP 状态码（上游状态码透传时可能与此不同）
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::AlreadyRunning => StatusCode::CONFLICT,
            ProxyError::NotRunning => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::BindFailed(_) | ProxyError::StopTimeout | ProxyError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ProxyError::InvalidRequest(_) | ProxyError::ImageNotSupported(_) => {
                StatusCode::BAD_REQUEST
            }
            ProxyError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ProxyError::ModelNotFound(_) => StatusCode::NOT_FOUND,
            ProxyError::Auth(_) => StatusCode::UNAUTHORIZED,
            ProxyError::Upstream(UpstreamError::Status { status, .. }) => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            ProxyError::Upstream(_) => StatusCode::BAD_GATEWAY,
        }
    }

    fn error_body(&self) -> ErrorBody {
        let message = self.to_string();
        match self {
            ProxyError::InvalidRequest(_) => ErrorBody::new(message, "invalid_request_error", None),
            ProxyError::PayloadTooLarge(_) => {
                ErrorBody::new(message, "invalid_request_error", Some("payload_too_large"))
            }
            ProxyError::ModelNotFound(_) => {
                ErrorBody::new(message, "invalid_request_error", Some("model_not_found"))
            }
            ProxyError::ImageNotSupported(_) => {
                ErrorBody::new(message, "invalid_request_error", Some("image_not_supported"))
            }
            ProxyError::Auth(_) => {
                ErrorBody::new(message, "authentication_error", Some("invalid_api_key"))
            }
            ProxyError::Upstream(UpstreamError::Model(_)) => {
                ErrorBody::new(message, "server_error", Some("upstream_model_error"))
            }
            ProxyError::Upstream(_) => ErrorBody::new(message, "server_error", Some("upstream_error")),
            _ => ErrorBody::new(message, "server_error", None),
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        if let ProxyError::Upstream(UpstreamError::Status {
            status: upstream_status,
            body,
        }) = &self
        {
            // 上游返回 JSON 时直接透传，否则包装为错误消息
            let error_body = serde_json::from_str::<serde_json::Value>(body)
                .ok()
                .filter(|v| v.is_object())
                .unwrap_or_else(|| {
                    let message = if body.trim().is_empty() {
                        format!("Upstream error (status {upstream_status})")
                    } else {
                        body.clone()
                    };
                    json!({
                        "error": {
                            "message": message,
                            "type": "upstream_error",
                            "code": null,
                        }
                    })
                });
            return (status, Json(error_body)).into_response();
        }

        (status, Json(self.error_body())).into_response()
    }
}
