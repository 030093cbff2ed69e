use thiserror::Error;

/// Errors produced by the instance provisioning API client.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The API refused the request (4xx other than 429). Retrying will not help.
    #[error("instance API rejected {operation} with HTTP {status}: {detail}")]
    Rejected {
        operation: &'static str,
        status: u16,
        detail: String,
    },
    /// Server-side failure or throttling (5xx, 429).
    #[error("instance API failed during {operation} with HTTP {status}: {detail}")]
    Server {
        operation: &'static str,
        status: u16,
        detail: String,
    },
    /// The request never produced a response.
    #[error("instance API request for {operation} failed: {source}")]
    Transport {
        operation: &'static str,
        #[source]
        source: reqwest::Error,
    },
    /// A 2xx response whose body could not be understood.
    #[error("instance API returned a malformed {operation} response: {reason}")]
    Malformed { operation: &'static str, reason: String },
    #[error("no API key found; set PHALA_API_KEY or CVMSTEP_API_KEY, or store one in the OS keyring")]
    MissingApiKey,
    #[error("API key contains characters not allowed in an HTTP header")]
    InvalidApiKey,
    #[error("invalid API base URL '{base}': {reason}")]
    InvalidBaseUrl { base: String, reason: String },
}

impl ApiError {
    /// Classify a non-success status code.
    pub fn from_status(operation: &'static str, status: u16, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        if status >= 500 || status == 429 {
            Self::Server {
                operation,
                status,
                detail,
            }
        } else {
            Self::Rejected {
                operation,
                status,
                detail,
            }
        }
    }

    pub fn malformed(operation: &'static str, reason: impl Into<String>) -> Self {
        Self::Malformed {
            operation,
            reason: reason.into(),
        }
    }

    pub fn invalid_base(base: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidBaseUrl {
            base: base.into(),
            reason: reason.into(),
        }
    }

    /// True for infrastructure failures (server errors, throttling, transport).
    ///
    /// Everything else is a provisioning error and must not be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Server { .. } | Self::Transport { .. })
    }

    /// HTTP status attached to the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Rejected { status, .. } | Self::Server { status, .. } => Some(*status),
            Self::Transport { source, .. } => source.status().map(|status| status.as_u16()),
            _ => None,
        }
    }
}
