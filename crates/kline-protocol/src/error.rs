//! K-Line Error Types

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Handshake step that an ECU can reject during fast init
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandshakeStep {
    /// Start Communication (0x81)
    StartCommunication,
    /// Start Diagnostic Session (0x10 0x80)
    StartDiagnosticSession,
}

impl fmt::Display for HandshakeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeStep::StartCommunication => write!(f, "Start Communication"),
            HandshakeStep::StartDiagnosticSession => write!(f, "Start Diagnostic Session"),
        }
    }
}

/// Errors that can occur during K-line communication
#[derive(Debug, Clone, Error)]
pub enum KlineError {
    /// No complete, addressed, valid frame arrived in time
    #[error("Timeout waiting for ECU response after {0}ms of silence")]
    Timeout(u64),

    /// A frame addressed to us failed checksum validation
    #[error("Checksum mismatch: expected {expected:02X}, got {actual:02X}")]
    ChecksumMismatch { expected: u8, actual: u8 },

    /// ECU answered a handshake step with something other than the expected bytes
    #[error("ECU rejected {step}: {detail}")]
    HandshakeRejected { step: HandshakeStep, detail: String },

    /// Response did not echo the request
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    /// ECU sent a negative response (0x7F)
    #[error("ECU refused service {service:02X} with response code {code:02X}")]
    NegativeResponse { service: u8, code: u8 },

    /// Frame is larger than the fixed frame budget
    #[error("Frame overflow: {len} bytes exceeds capacity of {capacity}")]
    FrameOverflow { len: usize, capacity: usize },

    /// Request payload cannot be framed
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Serial port or line driver error
    #[error("Serial port error: {0}")]
    SerialError(String),

    /// Rejected configuration value
    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    /// The worker thread owning the link has exited
    #[error("K-line worker stopped")]
    WorkerStopped,
}

impl KlineError {
    /// Stable numeric code reported through `last_error`
    pub fn code(&self) -> ErrorCode {
        match self {
            KlineError::Timeout(_) => ErrorCode::Timeout,
            KlineError::ChecksumMismatch { .. } => ErrorCode::ChecksumMismatch,
            KlineError::HandshakeRejected {
                step: HandshakeStep::StartCommunication,
                ..
            } => ErrorCode::StartCommunicationRejected,
            KlineError::HandshakeRejected {
                step: HandshakeStep::StartDiagnosticSession,
                ..
            } => ErrorCode::StartDiagnosticSessionRejected,
            KlineError::UnexpectedResponse(_) => ErrorCode::UnexpectedResponse,
            KlineError::NegativeResponse { .. } => ErrorCode::NegativeResponse,
            KlineError::FrameOverflow { .. } => ErrorCode::FrameOverflow,
            KlineError::InvalidRequest(_) => ErrorCode::InvalidRequest,
            KlineError::SerialError(_) => ErrorCode::Serial,
            KlineError::ConfigError(_) => ErrorCode::Config,
            KlineError::WorkerStopped => ErrorCode::WorkerStopped,
        }
    }
}

impl From<std::io::Error> for KlineError {
    fn from(err: std::io::Error) -> Self {
        KlineError::SerialError(err.to_string())
    }
}

/// Last-error codes kept by the client.
///
/// The numeric values are part of the public contract: 0 is success, -1 a receive
/// timeout, 1 and 2 the two handshake steps. The remaining codes are stable too.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ErrorCode {
    #[default]
    Ok = 0,
    Timeout = -1,
    StartCommunicationRejected = 1,
    StartDiagnosticSessionRejected = 2,
    ChecksumMismatch = 3,
    UnexpectedResponse = 4,
    NegativeResponse = 5,
    FrameOverflow = 6,
    InvalidRequest = 7,
    Serial = 8,
    Config = 9,
    WorkerStopped = 10,
    Unknown = -99,
}

impl ErrorCode {
    /// Raw integer value
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Whether this code means the last operation succeeded
    pub fn is_ok(self) -> bool {
        self == ErrorCode::Ok
    }
}

impl From<i32> for ErrorCode {
    fn from(code: i32) -> Self {
        match code {
            0 => Self::Ok,
            -1 => Self::Timeout,
            1 => Self::StartCommunicationRejected,
            2 => Self::StartDiagnosticSessionRejected,
            3 => Self::ChecksumMismatch,
            4 => Self::UnexpectedResponse,
            5 => Self::NegativeResponse,
            6 => Self::FrameOverflow,
            7 => Self::InvalidRequest,
            8 => Self::Serial,
            9 => Self::Config,
            10 => Self::WorkerStopped,
            _ => Self::Unknown,
        }
    }
}

impl From<ErrorCode> for i32 {
    fn from(code: ErrorCode) -> Self {
        code.as_i32()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_conversion() {
        assert_eq!(ErrorCode::from(0), ErrorCode::Ok);
        assert_eq!(ErrorCode::from(-1), ErrorCode::Timeout);
        assert_eq!(ErrorCode::from(2), ErrorCode::StartDiagnosticSessionRejected);
        assert_eq!(ErrorCode::from(-999), ErrorCode::Unknown);
        assert_eq!(i32::from(ErrorCode::ChecksumMismatch), 3);
    }

    #[test]
    fn test_handshake_codes_follow_step() {
        let first = KlineError::HandshakeRejected {
            step: HandshakeStep::StartCommunication,
            detail: "no reply".to_string(),
        };
        let second = KlineError::HandshakeRejected {
            step: HandshakeStep::StartDiagnosticSession,
            detail: "no reply".to_string(),
        };
        assert_eq!(first.code().as_i32(), 1);
        assert_eq!(second.code().as_i32(), 2);
        assert_eq!(KlineError::Timeout(5000).code().as_i32(), -1);
    }

    #[test]
    fn test_io_error_maps_to_serial() {
        let err: KlineError = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone").into();
        assert_eq!(err.code(), ErrorCode::Serial);
    }
}
