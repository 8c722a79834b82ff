use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("failed to launch inference process: {0}")]
    ProcessLaunch(String),
    #[error("inference process did not become ready in time")]
    StartupTimeout,
    #[error("inference server unreachable at {0}")]
    UpstreamUnavailable(String),
    #[error("inference server returned {status}: {body}")]
    UpstreamStatus { status: u16, body: String },
    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),
    #[error("invalid request: {0}")]
    BadRequest(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("other: {0}")]
    Other(String),
}

impl ServiceError {
    /// Maps a reqwest failure, singling out refused connections.
    pub(crate) fn from_upstream(err: reqwest::Error, base_url: &str) -> Self {
        if err.is_connect() {
            ServiceError::UpstreamUnavailable(base_url.to_string())
        } else {
            ServiceError::Upstream(err)
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = match self {
            ServiceError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServiceError::StartupTimeout => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::ProcessLaunch(_)
            | ServiceError::UpstreamUnavailable(_)
            | ServiceError::UpstreamStatus { .. }
            | ServiceError::Upstream(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServiceError::Config(_) | ServiceError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServiceError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

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
    fn bad_request_maps_to_400() {
        let response = ServiceError::BadRequest("missing message".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn upstream_status_maps_to_500() {
        let response = ServiceError::UpstreamStatus {
            status: 502,
            body: "bad gateway".into(),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
