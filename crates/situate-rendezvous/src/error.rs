use situate_core::{UnknownEndpointKind, UnknownTransportKind};

/// Rendezvous failures. Everything except `Io` is a protocol violation and
/// fatal for the session that owns the connection.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("rendezvous io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("rendezvous protocol mismatch: expected {expected}, got {actual}")]
    ProtocolMismatch { expected: i16, actual: i16 },
    #[error("unexpected rendezvous action: {0}")]
    UnexpectedAction(u8),
    #[error(transparent)]
    UnknownEndpoint(#[from] UnknownEndpointKind),
    #[error(transparent)]
    UnknownTransport(#[from] UnknownTransportKind),
    #[error("invalid port: {0}")]
    InvalidPort(i32),
    #[error("invalid {what} count: {count}")]
    InvalidCount { what: &'static str, count: i32 },
    #[error("string of {0} bytes exceeds the limit")]
    StringTooLong(usize),
    #[error("string is not valid utf-8")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("rendezvous connection failed: {0}")]
    ConnectFailed(String),
    #[error("rendezvous client is not connected")]
    NotConnected,
    #[error("rendezvous connection closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, Error>;
