use std::fmt;
use std::io;

/// Classifies every failure the toolkit can report. Callers branch on the
/// kind; the message is diagnostic only.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    InvalidParameter,
    ConnectionClosed,
    Timeout,
    WouldBlock,
    InvalidMessage,
    EntityNotFound,
    HashCollision,
    TypeMismatch,
    UnknownProperty,
    ResourceLimitExceeded,
    SchemaValidationFailed,
    SchemaAlreadyExists,
    SchemaNotFound,
    SchemaIncompatible,
    HandshakeFailed,
    NetworkError,
}

impl ErrorKind {
    /// Stable wire ordinal used by `Error` frames. Appending kinds is
    /// allowed; renumbering is a protocol break.
    pub fn code(self) -> u16 {
        match self {
            ErrorKind::InvalidParameter => 0,
            ErrorKind::ConnectionClosed => 1,
            ErrorKind::Timeout => 2,
            ErrorKind::WouldBlock => 3,
            ErrorKind::InvalidMessage => 4,
            ErrorKind::EntityNotFound => 5,
            ErrorKind::HashCollision => 6,
            ErrorKind::TypeMismatch => 7,
            ErrorKind::UnknownProperty => 8,
            ErrorKind::ResourceLimitExceeded => 9,
            ErrorKind::SchemaValidationFailed => 10,
            ErrorKind::SchemaAlreadyExists => 11,
            ErrorKind::SchemaNotFound => 12,
            ErrorKind::SchemaIncompatible => 13,
            ErrorKind::HandshakeFailed => 14,
            ErrorKind::NetworkError => 15,
        }
    }

    pub fn from_code(code: u16) -> Option<ErrorKind> {
        Some(match code {
            0 => ErrorKind::InvalidParameter,
            1 => ErrorKind::ConnectionClosed,
            2 => ErrorKind::Timeout,
            3 => ErrorKind::WouldBlock,
            4 => ErrorKind::InvalidMessage,
            5 => ErrorKind::EntityNotFound,
            6 => ErrorKind::HashCollision,
            7 => ErrorKind::TypeMismatch,
            8 => ErrorKind::UnknownProperty,
            9 => ErrorKind::ResourceLimitExceeded,
            10 => ErrorKind::SchemaValidationFailed,
            11 => ErrorKind::SchemaAlreadyExists,
            12 => ErrorKind::SchemaNotFound,
            13 => ErrorKind::SchemaIncompatible,
            14 => ErrorKind::HandshakeFailed,
            15 => ErrorKind::NetworkError,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InvalidParameter => "invalid parameter",
            ErrorKind::ConnectionClosed => "connection closed",
            ErrorKind::Timeout => "timeout",
            ErrorKind::WouldBlock => "would block",
            ErrorKind::InvalidMessage => "invalid message",
            ErrorKind::EntityNotFound => "entity not found",
            ErrorKind::HashCollision => "hash collision",
            ErrorKind::TypeMismatch => "type mismatch",
            ErrorKind::UnknownProperty => "unknown property",
            ErrorKind::ResourceLimitExceeded => "resource limit exceeded",
            ErrorKind::SchemaValidationFailed => "schema validation failed",
            ErrorKind::SchemaAlreadyExists => "schema already exists",
            ErrorKind::SchemaNotFound => "schema not found",
            ErrorKind::SchemaIncompatible => "schema incompatible",
            ErrorKind::HandshakeFailed => "handshake failed",
            ErrorKind::NetworkError => "network error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error value returned by every fallible operation: a kind plus a
/// human-readable message. Never thrown across API boundaries.
#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Error {
    pub kind: ErrorKind,
    pub message: String,
}

impl Error {
    #[inline]
    pub fn new<S: Into<String>>(kind: ErrorKind, message: S) -> Error {
        Error {
            kind,
            message: message.into(),
        }
    }

    #[inline]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn invalid_parameter<S: Into<String>>(message: S) -> Error {
        Error::new(ErrorKind::InvalidParameter, message)
    }

    pub fn connection_closed<S: Into<String>>(message: S) -> Error {
        Error::new(ErrorKind::ConnectionClosed, message)
    }

    pub fn timeout<S: Into<String>>(message: S) -> Error {
        Error::new(ErrorKind::Timeout, message)
    }

    pub fn would_block<S: Into<String>>(message: S) -> Error {
        Error::new(ErrorKind::WouldBlock, message)
    }

    pub fn invalid_message<S: Into<String>>(message: S) -> Error {
        Error::new(ErrorKind::InvalidMessage, message)
    }

    pub fn network<S: Into<String>>(message: S) -> Error {
        Error::new(ErrorKind::NetworkError, message)
    }

    pub fn handshake_failed<S: Into<String>>(message: S) -> Error {
        Error::new(ErrorKind::HandshakeFailed, message)
    }
}

impl From<io::Error> for Error {
    fn from(io_error: io::Error) -> Self {
        let kind = match io_error.kind() {
            io::ErrorKind::WouldBlock => ErrorKind::WouldBlock,
            io::ErrorKind::TimedOut => ErrorKind::Timeout,
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => ErrorKind::ConnectionClosed,
            _ => ErrorKind::NetworkError,
        };
        Error::new(kind, io_error.to_string())
    }
}

pub type NetResult<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_contains_kind_and_message() {
        let err = Error::timeout("Send timeout");
        assert_eq!(err.to_string(), "timeout: Send timeout");
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[test]
    fn test_from_io_error_maps_kinds() {
        let err: Error = io::Error::from(io::ErrorKind::WouldBlock).into();
        assert_eq!(err.kind(), ErrorKind::WouldBlock);

        let err: Error = io::Error::from(io::ErrorKind::BrokenPipe).into();
        assert_eq!(err.kind(), ErrorKind::ConnectionClosed);

        let err: Error = io::Error::from(io::ErrorKind::Other).into();
        assert_eq!(err.kind(), ErrorKind::NetworkError);
    }
}
