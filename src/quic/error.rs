use std::fmt;

use thiserror::Error;

use super::frame::FrameType;

/// Transport error codes raised by the migration subsystem (RFC 9000 Section 20.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportErrorCode {
    NoError,
    InternalError,
    ConnectionIdLimitError,
    ProtocolViolation,
    FrameEncodingError,
    TransportParameterError,
}

impl TransportErrorCode {
    /// Wire value carried in a CONNECTION_CLOSE frame
    pub fn code(self) -> u64 {
        match self {
            TransportErrorCode::NoError => 0x00,
            TransportErrorCode::InternalError => 0x01,
            TransportErrorCode::ConnectionIdLimitError => 0x09,
            TransportErrorCode::ProtocolViolation => 0x0a,
            TransportErrorCode::FrameEncodingError => 0x07,
            TransportErrorCode::TransportParameterError => 0x08,
        }
    }
}

impl fmt::Display for TransportErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportErrorCode::NoError => "NO_ERROR",
            TransportErrorCode::InternalError => "INTERNAL_ERROR",
            TransportErrorCode::ConnectionIdLimitError => "CONNECTION_ID_LIMIT_ERROR",
            TransportErrorCode::ProtocolViolation => "PROTOCOL_VIOLATION",
            TransportErrorCode::FrameEncodingError => "FRAME_ENCODING_ERROR",
            TransportErrorCode::TransportParameterError => "TRANSPORT_PARAMETER_ERROR",
        };
        f.write_str(name)
    }
}

/// Connection-level error. The owner of the connection turns this into a
/// CONNECTION_CLOSE; nothing in this crate closes connections itself.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{code} ({frame_type:?}): {reason}")]
pub struct ConnectionError {
    pub code: TransportErrorCode,
    pub frame_type: Option<FrameType>,
    pub reason: String,
}

impl ConnectionError {
    pub fn new(code: TransportErrorCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            frame_type: None,
            reason: reason.into(),
        }
    }

    pub fn protocol_violation(frame_type: FrameType, reason: impl Into<String>) -> Self {
        Self {
            code: TransportErrorCode::ProtocolViolation,
            frame_type: Some(frame_type),
            reason: reason.into(),
        }
    }

    pub fn frame_encoding(reason: impl Into<String>) -> Self {
        Self::new(TransportErrorCode::FrameEncodingError, reason)
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::new(TransportErrorCode::InternalError, reason)
    }

    pub fn with_frame_type(mut self, frame_type: FrameType) -> Self {
        self.frame_type = Some(frame_type);
        self
    }
}

/// Frame decoding errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid frame format: {0}")]
    InvalidFrameFormat(String),

    #[error("Unknown frame type: {0:#x}")]
    UnknownFrameType(u64),

    #[error("Invalid connection ID length: {0}")]
    InvalidConnectionIdLength(usize),

    #[error("Truncated input: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },
}

#[derive(Error, Debug, Clone)]
pub enum CryptoError {
    #[error("Random number generation failed")]
    Randomness,

    #[error("Buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },
}

#[derive(Error, Debug, Clone)]
pub enum QuicError {
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Cryptographic error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(String), // String instead of std::io::Error for Clone
}

impl From<std::io::Error> for QuicError {
    fn from(err: std::io::Error) -> Self {
        QuicError::Io(err.to_string())
    }
}

impl From<ring::error::Unspecified> for CryptoError {
    fn from(_: ring::error::Unspecified) -> Self {
        CryptoError::Randomness
    }
}

impl QuicError {
    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            QuicError::Connection(err) if err.code == TransportErrorCode::ProtocolViolation => {
                ErrorSeverity::Critical
            }
            QuicError::Connection(_) => ErrorSeverity::High,
            QuicError::Crypto(_) => ErrorSeverity::High,
            QuicError::Protocol(_) => ErrorSeverity::Medium,
            QuicError::Config(_) => ErrorSeverity::Medium,
            QuicError::Io(_) => ErrorSeverity::Low,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

pub type Result<T> = std::result::Result<T, QuicError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_match_wire_values() {
        assert_eq!(TransportErrorCode::ProtocolViolation.code(), 0x0a);
        assert_eq!(TransportErrorCode::FrameEncodingError.code(), 0x07);
        assert_eq!(TransportErrorCode::ConnectionIdLimitError.code(), 0x09);
    }

    #[test]
    fn test_protocol_violation_is_critical() {
        let err: QuicError =
            ConnectionError::protocol_violation(FrameType::RetireConnectionId, "retired in-use cid").into();
        assert_eq!(err.severity(), ErrorSeverity::Critical);

        let err: QuicError = ProtocolError::UnknownFrameType(0x42).into();
        assert_eq!(err.severity(), ErrorSeverity::Medium);
    }

    #[test]
    fn test_connection_error_display() {
        let err = ConnectionError::protocol_violation(FrameType::NewConnectionId, "zero-length cid");
        let text = err.to_string();
        assert!(text.contains("PROTOCOL_VIOLATION"));
        assert!(text.contains("zero-length cid"));
    }
}
