//! Network layer error types

use std::time::Duration;

/// Result type alias using [`NetError`]
pub type Result<T, E = NetError> = std::result::Result<T, E>;

/// Network layer error.
///
/// Cloneable so one completed fetch can be shared between every waiter of an
/// in-flight request.
#[derive(Debug, Clone, thiserror::Error)]
pub enum NetError {
    /// The request could not be sent or the response body could not be read
    #[error("request failed: {0}")]
    Request(String),

    /// The server answered with a non-success status
    #[error("HTTP status {status} for {url}")]
    Status {
        /// Response status code
        status: u16,
        /// Requested URL
        url: String,
    },

    /// The transfer did not complete within the configured timeout
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// A redirect would have downgraded to a less secure scheme
    #[error("insecure redirect from {from} to {to}")]
    InsecureRedirect {
        /// Redirecting URL
        from: String,
        /// Redirect target
        to: String,
    },

    /// The redirect chain exceeded the configured hop limit
    #[error("too many redirects for {0}")]
    TooManyRedirects(String),

    /// The response body was rejected by the registered content validator
    #[error("response body rejected by validator for {url}")]
    RejectedBody {
        /// Requested URL
        url: String,
    },

    /// The cache store failed
    #[error("cache error: {0}")]
    Cache(String),

    /// The URL could not be parsed
    #[error("invalid URL '{url}': {message}")]
    InvalidUrl {
        /// Offending URL
        url: String,
        /// Parse error message
        message: String,
    },
}

impl From<std::io::Error> for NetError {
    fn from(err: std::io::Error) -> Self {
        Self::Cache(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = NetError::Status {
            status: 404,
            url: "http://x/script.js".into(),
        };
        assert_eq!(err.to_string(), "HTTP status 404 for http://x/script.js");

        let err = NetError::InsecureRedirect {
            from: "https://a/".into(),
            to: "http://a/".into(),
        };
        assert!(err.to_string().contains("insecure redirect"));
    }

    #[test]
    fn test_from_io_error() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: NetError = io.into();
        assert!(matches!(err, NetError::Cache(_)));
    }
}
