//! Error Module
//!
//! Defines error types and result types used throughout the media range proxy.

use hyper::StatusCode;
use thiserror::Error;

/// Main error type for the media range proxy
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProxyError {
    /// Client supplied a Range header that could not be parsed
    #[error("Malformed range: {0}")]
    MalformedRange(String),

    /// Range start lies at or beyond the end of the resource
    #[error("Range not satisfiable for resource of {total} bytes")]
    RangeNotSatisfiable { total: u64 },

    /// Upstream cannot locate or stream the requested media ID
    #[error("Unresolved media: {0}")]
    UnresolvedMedia(String),

    /// Upstream has the media but no variant matching the encoding constraint
    #[error("Format unavailable: {0}")]
    FormatUnavailable(String),

    /// Upstream connection failed or errored mid-transfer
    #[error("Upstream fetch error: {0}")]
    UpstreamFetch(String),

    /// Upstream produced a different number of bytes than the served range
    #[error("Length mismatch: expected {expected} bytes, upstream produced {actual}")]
    LengthMismatch { expected: u64, actual: u64 },

    #[error("IO error: {0}")]
    IoError(String),

    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Timeout error: {0}")]
    TimeoutError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("System error: {0}")]
    SystemError(String),
}

impl ProxyError {
    /// HTTP status returned to the client for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::MalformedRange(_) | ProxyError::InvalidRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            ProxyError::RangeNotSatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            ProxyError::UnresolvedMedia(_) | ProxyError::FormatUnavailable(_) => {
                StatusCode::NOT_FOUND
            }
            ProxyError::TimeoutError(_) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::UpstreamFetch(_)
            | ProxyError::ConnectionError(_)
            | ProxyError::TlsError(_)
            | ProxyError::HttpError(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable error code used in client-facing error bodies
    pub fn code(&self) -> &'static str {
        match self {
            ProxyError::MalformedRange(_) => "MalformedRange",
            ProxyError::RangeNotSatisfiable { .. } => "RangeNotSatisfiable",
            ProxyError::UnresolvedMedia(_) => "UnresolvedMedia",
            ProxyError::FormatUnavailable(_) => "FormatUnavailable",
            ProxyError::InvalidRequest(_) => "InvalidRequest",
            ProxyError::TimeoutError(_) => "UpstreamTimeout",
            ProxyError::UpstreamFetch(_)
            | ProxyError::ConnectionError(_)
            | ProxyError::TlsError(_)
            | ProxyError::HttpError(_) => "UpstreamFetchFailed",
            _ => "InternalError",
        }
    }

    /// Client-facing message. Never carries upstream error detail.
    pub fn public_message(&self) -> String {
        match self {
            ProxyError::MalformedRange(_) => {
                "The Range header must have the form bytes=<start>-<end>".to_string()
            }
            ProxyError::RangeNotSatisfiable { total } => {
                format!("The requested range starts beyond the {} byte resource", total)
            }
            ProxyError::UnresolvedMedia(_) => "The requested media could not be found".to_string(),
            ProxyError::FormatUnavailable(_) => {
                "No stream matching the requested encoding is available".to_string()
            }
            ProxyError::InvalidRequest(_) => "The request is invalid".to_string(),
            ProxyError::TimeoutError(_) => "The upstream media provider timed out".to_string(),
            ProxyError::UpstreamFetch(_)
            | ProxyError::ConnectionError(_)
            | ProxyError::TlsError(_)
            | ProxyError::HttpError(_) => {
                "The upstream media provider failed to deliver the stream".to_string()
            }
            _ => "Internal server error".to_string(),
        }
    }
}

impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        ProxyError::IoError(err.to_string())
    }
}

impl From<hyper::Error> for ProxyError {
    fn from(err: hyper::Error) -> Self {
        ProxyError::HttpError(err.to_string())
    }
}

impl From<serde_json::Error> for ProxyError {
    fn from(err: serde_json::Error) -> Self {
        ProxyError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for ProxyError {
    fn from(err: serde_yaml::Error) -> Self {
        ProxyError::SerializationError(err.to_string())
    }
}

/// Result type alias for the media range proxy
pub type Result<T> = std::result::Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            ProxyError::MalformedRange("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ProxyError::RangeNotSatisfiable { total: 10 }.status_code(),
            StatusCode::RANGE_NOT_SATISFIABLE
        );
        assert_eq!(
            ProxyError::UnresolvedMedia("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert!(ProxyError::UpstreamFetch("x".into())
            .status_code()
            .is_server_error());
        assert!(ProxyError::LengthMismatch {
            expected: 1,
            actual: 2
        }
        .status_code()
        .is_server_error());
    }

    #[test]
    fn test_public_message_hides_upstream_detail() {
        let err = ProxyError::UpstreamFetch("connect to 10.0.0.7:443 refused".to_string());
        assert!(!err.public_message().contains("10.0.0.7"));
    }
}
