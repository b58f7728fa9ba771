use thiserror::Error;

/// Typed cache/download errors enabling retry classification.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("HTTP error {status} downloading {url}")]
    HttpStatus { status: u16, url: String },

    #[error("incomplete download of {url} ({received}/{expected} bytes)")]
    Incomplete {
        url: String,
        received: u64,
        expected: u64,
    },

    #[error("network error downloading {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("disk error: {0}")]
    Disk(#[from] std::io::Error),
}

impl CacheError {
    /// Whether this error is transient and worth retrying.
    ///
    /// Incomplete transfers usually mean the connection dropped, not that
    /// the object is bad. Disk errors are never retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            CacheError::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            CacheError::Incomplete { .. } => true,
            CacheError::Network { .. } => true,
            CacheError::Disk(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors_are_permanent() {
        let e = CacheError::HttpStatus {
            status: 404,
            url: "u".into(),
        };
        assert!(!e.is_retryable());
    }

    #[test]
    fn rate_limit_and_server_errors_are_transient() {
        for status in [429, 500, 503] {
            let e = CacheError::HttpStatus {
                status,
                url: "u".into(),
            };
            assert!(e.is_retryable(), "status {}", status);
        }
    }

    #[test]
    fn truncated_transfer_is_transient() {
        let e = CacheError::Incomplete {
            url: "u".into(),
            received: 10,
            expected: 20,
        };
        assert!(e.is_retryable());
    }

    #[test]
    fn disk_errors_are_permanent() {
        let e = CacheError::Disk(std::io::Error::other("disk full"));
        assert!(!e.is_retryable());
    }
}
