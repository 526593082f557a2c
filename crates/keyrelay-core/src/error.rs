use bytes::Bytes;
use http::StatusCode;

use keyrelay_protocol::openai::ErrorResponse;
use keyrelay_provider_core::RotationError;
use keyrelay_storage::StorageError;

/// Error rendered on the OpenAI-compatible surface as `{"error": {"message", "type"}}`.
#[derive(Debug)]
pub struct ProxyError {
    pub status: StatusCode,
    pub body: Bytes,
}

impl ProxyError {
    pub fn openai(status: StatusCode, message: &str, kind: &str) -> Self {
        let body = serde_json::to_vec(&ErrorResponse::new(message, kind))
            .map(Bytes::from)
            .unwrap_or_default();
        Self { status, body }
    }

    pub fn missing_credentials() -> Self {
        Self::openai(
            StatusCode::UNAUTHORIZED,
            "missing credentials",
            "invalid_request_error",
        )
    }

    pub fn invalid_token() -> Self {
        Self::openai(
            StatusCode::UNAUTHORIZED,
            "invalid API key",
            "invalid_request_error",
        )
    }

    pub fn bad_request(message: &str) -> Self {
        Self::openai(StatusCode::BAD_REQUEST, message, "invalid_request_error")
    }

    pub fn quota_exhausted() -> Self {
        Self::openai(
            StatusCode::TOO_MANY_REQUESTS,
            "quota exceeded on all API keys",
            "insufficient_quota",
        )
    }

    pub fn upstream_transport() -> Self {
        Self::openai(
            StatusCode::INTERNAL_SERVER_ERROR,
            "upstream request failed",
            "api_error",
        )
    }

    pub fn internal(message: &str) -> Self {
        Self::openai(StatusCode::INTERNAL_SERVER_ERROR, message, "api_error")
    }

    pub fn from_rotation(err: RotationError) -> Self {
        match err {
            RotationError::NoKeysConfigured | RotationError::NoHealthyKey => Self::openai(
                StatusCode::SERVICE_UNAVAILABLE,
                &err.to_string(),
                "configuration_error",
            ),
            RotationError::NoAlternativeKey => Self::quota_exhausted(),
        }
    }
}

impl From<StorageError> for ProxyError {
    fn from(err: StorageError) -> Self {
        tracing::error!(event = "storage_error", error = %err);
        Self::internal("internal error")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body_json(err: &ProxyError) -> serde_json::Value {
        serde_json::from_slice(&err.body).unwrap()
    }

    #[test]
    fn rotation_errors_map_to_service_unavailable() {
        let err = ProxyError::from_rotation(RotationError::NoKeysConfigured);
        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_json(&err)["error"]["message"], "no API keys configured");

        let err = ProxyError::from_rotation(RotationError::NoAlternativeKey);
        assert_eq!(err.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body_json(&err)["error"]["type"], "insufficient_quota");
    }
}
