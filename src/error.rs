//! Crate-wide error type

use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Failure kinds surfaced by the client.
///
/// Low-level codec and I/O failures disconnect the affected connection and
/// surface through any in-flight read, write, or wait on it. Orchestrators
/// translate them into the domain variants (`TransferRejected`, `UserOffline`)
/// before handing them to callers.
#[derive(Debug, Error)]
pub enum Error {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("operation cancelled")]
    Cancelled,

    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("connection closed by remote")]
    ConnectionClosed,

    #[error("write dropped: {0}")]
    WriteDropped(String),

    #[error("proxy error: {0}")]
    Proxy(String),

    #[error("opcode mismatch: expected {expected}, got {actual}")]
    OpcodeMismatch { expected: u32, actual: u32 },

    #[error("zlib error: {0}")]
    Compression(String),

    #[error("message read past end: needed {needed} bytes, {remaining} remaining")]
    MessageRead { needed: usize, remaining: usize },

    #[error("malformed message: {0}")]
    MessageFormat(String),

    #[error("transfer rejected: {0}")]
    TransferRejected(String),

    #[error("user {0} is offline")]
    UserOffline(String),

    #[error("remote queue is full")]
    QueueFull,

    #[error("connection superseded by a newer one")]
    Superseded,

    #[error("login rejected: {0}")]
    LoginRejected(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid option: {0}")]
    InvalidOption(String),

    #[error("listener failed to bind port {port}: {source}")]
    Listener { port: u16, source: std::io::Error },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the failure is one the caller may retry at a higher layer.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_) | Error::Connect { .. } | Error::ConnectionClosed | Error::Io(_)
        )
    }

    /// Clones enough of the error to fan it out to several waiters.
    ///
    /// `std::io::Error` is not `Clone`, so the io-carrying variants degrade
    /// to a copy that preserves kind and text.
    pub fn duplicate(&self) -> Error {
        match self {
            Error::Timeout(d) => Error::Timeout(*d),
            Error::Cancelled => Error::Cancelled,
            Error::Connect { addr, source } => Error::Connect {
                addr: *addr,
                source: std::io::Error::new(source.kind(), source.to_string()),
            },
            Error::ConnectionClosed => Error::ConnectionClosed,
            Error::WriteDropped(s) => Error::WriteDropped(s.clone()),
            Error::Proxy(s) => Error::Proxy(s.clone()),
            Error::OpcodeMismatch { expected, actual } => Error::OpcodeMismatch {
                expected: *expected,
                actual: *actual,
            },
            Error::Compression(s) => Error::Compression(s.clone()),
            Error::MessageRead { needed, remaining } => Error::MessageRead {
                needed: *needed,
                remaining: *remaining,
            },
            Error::MessageFormat(s) => Error::MessageFormat(s.clone()),
            Error::TransferRejected(s) => Error::TransferRejected(s.clone()),
            Error::UserOffline(s) => Error::UserOffline(s.clone()),
            Error::QueueFull => Error::QueueFull,
            Error::Superseded => Error::Superseded,
            Error::LoginRejected(s) => Error::LoginRejected(s.clone()),
            Error::InvalidState(s) => Error::InvalidState(s.clone()),
            Error::InvalidOption(s) => Error::InvalidOption(s.clone()),
            Error::Listener { port, source } => Error::Listener {
                port: *port,
                source: std::io::Error::new(source.kind(), source.to_string()),
            },
            Error::Io(e) => Error::Io(std::io::Error::new(e.kind(), e.to_string())),
        }
    }
}
