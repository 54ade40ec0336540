use std::time::Duration;

/// Initial backoff after a 420 from the streaming endpoint.
pub const RATE_LIMIT_BACKOFF: Duration = Duration::from_secs(60);

/// Typed error hierarchy for the upstream stream connection.
/// Classifies errors as fatal (don't retry), retryable, or operational.
#[derive(Clone, Debug, thiserror::Error)]
pub enum UpstreamError {
    // Fatal, never retried
    #[error("upstream rejected credential: {0}")]
    Unauthorized(String),
    #[error("upstream rejected request: {status}: {body}")]
    Rejected { status: u16, body: String },

    // Retryable
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("server error {status}: {body}")]
    ServerError { status: u16, body: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("stream interrupted: {0}")]
    Interrupted(String),

    // Operational
    #[error("no response from upstream within {0:?}")]
    OpenTimeout(Duration),
    #[error("upstream stalled: no data for {0:?}")]
    Stalled(Duration),
}

impl UpstreamError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::ServerError { .. }
                | Self::Network(_)
                | Self::Interrupted(_)
                | Self::OpenTimeout(_)
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unauthorized(_) | Self::Rejected { .. })
    }

    pub fn suggested_delay(&self) -> Option<Duration> {
        if let Self::RateLimited { retry_after } = self {
            *retry_after
        } else {
            None
        }
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "unauthorized",
            Self::Rejected { .. } => "rejected",
            Self::RateLimited { .. } => "rate_limited",
            Self::ServerError { .. } => "server_error",
            Self::Network(_) => "network_error",
            Self::Interrupted(_) => "stream_interrupted",
            Self::OpenTimeout(_) => "open_timeout",
            Self::Stalled(_) => "stalled",
        }
    }

    /// Apply a `Retry-After` hint to a rate-limit error. The longer of the
    /// hint and any default backoff wins; other errors pass through.
    pub fn with_retry_after(self, hint: Option<Duration>) -> Self {
        match (self, hint) {
            (Self::RateLimited { retry_after }, Some(hint)) => Self::RateLimited {
                retry_after: Some(retry_after.map_or(hint, |current| current.max(hint))),
            },
            (other, _) => other,
        }
    }

    /// Classify an HTTP status code from the streaming endpoint.
    /// 420 is the legacy "enhance your calm" rate limit status.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => Self::Unauthorized(body),
            420 => Self::RateLimited {
                retry_after: Some(RATE_LIMIT_BACKOFF),
            },
            429 => Self::RateLimited { retry_after: None },
            500..=599 => Self::ServerError { status, body },
            _ => Self::Rejected { status, body },
        }
    }
}
