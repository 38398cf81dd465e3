use std::time::Duration;

/// Typed error hierarchy for completion-provider calls.
#[derive(Clone, Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("server error {status}: {body}")]
    ServerError { status: u16, body: String },
    #[error("network error: {0}")]
    NetworkError(String),
    #[error("stream interrupted: {0}")]
    StreamInterrupted(String),
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
}

impl GatewayError {
    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::AuthenticationFailed(_) => "authentication_failed",
            Self::InvalidRequest(_) => "invalid_request",
            Self::RateLimited { .. } => "rate_limited",
            Self::ServerError { .. } => "server_error",
            Self::NetworkError(_) => "network_error",
            Self::StreamInterrupted(_) => "stream_interrupted",
            Self::MalformedResponse(_) => "malformed_response",
            Self::Timeout(_) => "timeout",
        }
    }

    /// Classify an HTTP status code into the appropriate error variant.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => Self::AuthenticationFailed(body),
            400 | 404 => Self::InvalidRequest(body),
            429 => Self::RateLimited { retry_after: None },
            500..=599 => Self::ServerError { status, body },
            _ => Self::InvalidRequest(format!("unexpected status {status}: {body}")),
        }
    }

    /// Classify a provider error code (as carried in an error payload).
    pub fn from_code(code: &str, message: String) -> Self {
        match code {
            "InvalidApiKey" | "Unauthorized" | "AccessDenied" => Self::AuthenticationFailed(message),
            "Throttling" | "Throttling.RateQuota" | "Throttling.AllocationQuota" => {
                Self::RateLimited { retry_after: None }
            }
            "InvalidParameter" | "DataInspectionFailed" | "BadRequest.EmptyInput" => {
                Self::InvalidRequest(message)
            }
            _ => Self::ServerError {
                status: 500,
                body: format!("{code}: {message}"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_status_mapping() {
        assert!(matches!(
            GatewayError::from_status(401, "unauthorized".into()),
            GatewayError::AuthenticationFailed(_)
        ));
        assert!(matches!(
            GatewayError::from_status(403, "forbidden".into()),
            GatewayError::AuthenticationFailed(_)
        ));
        assert!(matches!(
            GatewayError::from_status(400, "bad".into()),
            GatewayError::InvalidRequest(_)
        ));
        assert!(matches!(
            GatewayError::from_status(429, "slow down".into()),
            GatewayError::RateLimited { .. }
        ));
        assert!(matches!(
            GatewayError::from_status(502, "bad gateway".into()),
            GatewayError::ServerError { status: 502, .. }
        ));
        assert!(matches!(
            GatewayError::from_status(302, "moved".into()),
            GatewayError::InvalidRequest(msg) if msg.contains("302")
        ));
    }

    #[test]
    fn from_code_mapping() {
        assert_eq!(
            GatewayError::from_code("InvalidApiKey", "Invalid API-key provided.".into()).error_kind(),
            "authentication_failed"
        );
        assert_eq!(
            GatewayError::from_code("Throttling.RateQuota", "too fast".into()).error_kind(),
            "rate_limited"
        );
        assert_eq!(
            GatewayError::from_code("InvalidParameter", "bad model".into()).error_kind(),
            "invalid_request"
        );
        let other = GatewayError::from_code("InternalError", "boom".into());
        assert!(other.to_string().contains("InternalError: boom"));
    }

    #[test]
    fn error_kind_strings() {
        assert_eq!(GatewayError::Timeout(Duration::from_secs(1)).error_kind(), "timeout");
        assert_eq!(
            GatewayError::StreamInterrupted("eof".into()).error_kind(),
            "stream_interrupted"
        );
        assert_eq!(
            GatewayError::MalformedResponse("not json".into()).error_kind(),
            "malformed_response"
        );
    }

    #[test]
    fn display_is_human_readable() {
        let err = GatewayError::AuthenticationFailed("no API key configured".into());
        assert_eq!(err.to_string(), "authentication failed: no API key configured");
    }
}
