use thiserror::Error;

/// Errors surfaced by object store operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Local filesystem failure.
    #[error("storage I/O error for '{key}': {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
    /// The HTTP request never produced a response.
    #[error("storage request for '{key}' failed: {source}")]
    Transport {
        key: String,
        #[source]
        source: reqwest::Error,
    },
    /// The remote store answered with an unexpected status.
    #[error("storage returned HTTP {status} for '{key}'")]
    Status { key: String, status: u16 },
    /// Keys must be relative, non-empty and free of `..` segments.
    #[error("invalid storage key '{0}'")]
    InvalidKey(String),
    #[error("invalid storage location '{location}': {reason}")]
    InvalidLocation { location: String, reason: String },
}

impl StorageError {
    pub fn io(key: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io { key: key.into(), source }
    }

    pub fn transport(key: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Transport { key: key.into(), source }
    }

    pub fn invalid_location(location: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidLocation {
            location: location.into(),
            reason: reason.into(),
        }
    }

    /// Whether repeating the same call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Io { .. } | Self::Transport { .. } => true,
            Self::Status { status, .. } => *status >= 500 || *status == 429,
            Self::InvalidKey(_) | Self::InvalidLocation { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_are_transient_client_errors_are_not() {
        let server = StorageError::Status {
            key: "k".into(),
            status: 503,
        };
        let throttled = StorageError::Status {
            key: "k".into(),
            status: 429,
        };
        let forbidden = StorageError::Status {
            key: "k".into(),
            status: 403,
        };
        assert!(server.is_transient());
        assert!(throttled.is_transient());
        assert!(!forbidden.is_transient());
        assert!(!StorageError::InvalidKey("../x".into()).is_transient());
    }
}
