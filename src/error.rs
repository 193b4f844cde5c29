//! Error handling module
//!
//! Defines the error types shared by the zone server protocol core.

use std::io;

use thiserror::Error;

use crate::net::session::SessionId;

/// Main error type for the zone server
#[derive(Error, Debug)]
pub enum ZoneError {
    /// Network-related errors
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// Wire protocol errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Broadcast routing errors
    #[error("Router error: {0}")]
    Router(#[from] RouterError),

    /// Packet table construction errors
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Network-specific errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Write buffer full")]
    WriteBufferFull,

    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("Too many sessions (limit {0})")]
    TooManySessions(usize),
}

/// Wire protocol errors raised while encoding, decoding or dispatching packets
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Unknown opcode: 0x{opcode:04x}")]
    UnknownOpcode { opcode: u16 },

    #[error("Invalid declared length {length} for opcode 0x{opcode:04x}")]
    InvalidLength { opcode: u16, length: usize },

    #[error("Length mismatch for opcode 0x{opcode:04x}: expected {expected}, got {actual}")]
    LengthMismatch {
        opcode: u16,
        expected: usize,
        actual: usize,
    },

    #[error("Truncated packet 0x{opcode:04x}: need {needed} bytes, have {available}")]
    Truncated {
        opcode: u16,
        needed: usize,
        available: usize,
    },

    #[error("Value out of range for field '{field}'")]
    FieldOutOfRange { field: &'static str },

    #[error("String too long for field '{field}' (width {width})")]
    StringTooLong { field: &'static str, width: usize },

    #[error("Missing value for field '{field}'")]
    MissingField { field: &'static str },

    #[error("Wrong value type for field '{field}'")]
    TypeMismatch { field: &'static str },

    #[error("Buffer overflow: requested {requested} bytes, {remaining} remaining")]
    BufferOverflow { requested: usize, remaining: usize },

    #[error("Session closed")]
    SessionClosed,
}

/// Errors raised by the broadcast router
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouterError {
    #[error("Send target requires an origin entity")]
    MissingOrigin,

    #[error("Unknown send target code: {0}")]
    UnknownTarget(u8),

    #[error("Invalid payload length: {0}")]
    InvalidPayload(usize),

    #[error("Delivery to session {session_id} failed: {source}")]
    Delivery {
        session_id: SessionId,
        #[source]
        source: NetworkError,
    },
}

/// Errors raised while building the packet table
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Opcode 0x{0:04x} registered twice")]
    DuplicateOpcode(u16),

    #[error("Opcode 0x{opcode:04x} declares {count} field offsets (max {max})")]
    TooManyFields {
        opcode: u16,
        count: usize,
        max: usize,
    },

    #[error("Opcode 0x{opcode:04x} length {declared} disagrees with layout length {layout}")]
    LengthMismatch {
        opcode: u16,
        declared: usize,
        layout: usize,
    },

    #[error("Field offset {offset} out of bounds for opcode 0x{opcode:04x}")]
    OffsetOutOfBounds { opcode: u16, offset: usize },

    #[error("No layout for packet '{packet}' at version {version}")]
    NoLayoutForVersion { packet: &'static str, version: u32 },
}

/// Result type alias for zone server operations
pub type Result<T> = std::result::Result<T, ZoneError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = NetworkError::ConnectionClosed;
        assert_eq!(err.to_string(), "Connection closed");

        let err = ProtocolError::UnknownOpcode { opcode: 0x87 };
        assert_eq!(err.to_string(), "Unknown opcode: 0x0087");

        let err = ProtocolError::LengthMismatch {
            opcode: 0x0087,
            expected: 8,
            actual: 10,
        };
        assert_eq!(
            err.to_string(),
            "Length mismatch for opcode 0x0087: expected 8, got 10"
        );
    }

    #[test]
    fn test_router_error_conversion() {
        let err: ZoneError = RouterError::UnknownTarget(99).into();
        assert!(matches!(err, ZoneError::Router(RouterError::UnknownTarget(99))));

        let err = RouterError::Delivery {
            session_id: 7,
            source: NetworkError::WriteBufferFull,
        };
        assert_eq!(
            err.to_string(),
            "Delivery to session 7 failed: Write buffer full"
        );
    }
}
