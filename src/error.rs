//! Error types for frame codecs and the traffic pipeline.

use thiserror::Error;

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Failures raised while parsing or building a single frame.
///
/// These are always local to one frame: handlers drop the offending frame
/// and keep running.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("{codec}: truncated buffer, need {needed} bytes but only {available} available")]
    Truncated {
        codec: &'static str,
        needed: usize,
        available: usize,
    },

    #[error("{codec}: invalid length: {reason}")]
    InvalidLength { codec: &'static str, reason: String },

    #[error("Invalid field value: {0}")]
    InvalidFieldValue(String),

    #[error("{codec}: invalid protocol version {version}")]
    InvalidProtocolVersion { codec: &'static str, version: u8 },

    #[error("Invalid header format: {0}")]
    InvalidHeaderFormat(String),

    #[error("Unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    #[error("DNS name compression loop at offset {0}")]
    CompressionLoop(usize),

    #[error("Frame of {length} bytes exceeds MTU {mtu} and has the don't-fragment flag set")]
    DontFragment { length: usize, mtu: usize },
}

impl FrameError {
    /// Checks that `bytes` holds at least `needed` bytes.
    pub(crate) fn ensure(codec: &'static str, bytes: &[u8], needed: usize) -> std::result::Result<(), FrameError> {
        if bytes.len() < needed {
            return Err(FrameError::Truncated {
                codec,
                needed,
                available: bytes.len(),
            });
        }
        Ok(())
    }

    pub(crate) fn invalid_length<S: Into<String>>(codec: &'static str, reason: S) -> Self {
        FrameError::InvalidLength {
            codec,
            reason: reason.into(),
        }
    }
}

/// Main error type of the crate.
#[derive(Debug, Error)]
pub enum Error {
    /// Parse or build failure of a single frame
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    /// Device or file I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Lifecycle misuse, e.g. starting a running handler
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Invalid or unreadable configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Routing failure (no route, unknown interface)
    #[error("Routing error: {0}")]
    Routing(String),

    /// Failure raised by a handler's processing code
    #[error("Handler '{handler}' failed: {message}")]
    Handler { handler: String, message: String },
}

impl Error {
    pub fn invalid_operation<S: Into<String>>(msg: S) -> Self {
        Error::InvalidOperation(msg.into())
    }

    pub fn routing<S: Into<String>>(msg: S) -> Self {
        Error::Routing(msg.into())
    }

    pub fn handler<S: Into<String>, M: Into<String>>(handler: S, message: M) -> Self {
        Error::Handler {
            handler: handler.into(),
            message: message.into(),
        }
    }

    /// True for errors caused by a malformed frame rather than by the handler.
    pub fn is_parse_error(&self) -> bool {
        matches!(self, Error::Frame(_))
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_reports_sizes() {
        let err = FrameError::ensure("ethernet", &[0u8; 10], 14).unwrap_err();
        assert_eq!(
            err,
            FrameError::Truncated {
                codec: "ethernet",
                needed: 14,
                available: 10
            }
        );
        assert!(FrameError::ensure("ethernet", &[0u8; 14], 14).is_ok());
    }

    #[test]
    fn test_parse_error_classification() {
        let err: Error = FrameError::InvalidFieldValue("x".into()).into();
        assert!(err.is_parse_error());
        assert!(!Error::invalid_operation("already running").is_parse_error());
    }
}
