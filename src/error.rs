//! Crate-wide error type

use thiserror::Error;

/// Errors surfaced during startup and by the database layer.
///
/// Per-connection I/O failures never become this type; they are confined to
/// the connection that produced them and handled inside the reactor.
#[derive(Debug, Error)]
pub enum Error {
    /// Socket setup, poll registration, or worker spawn failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Failure talking to the user database.
    #[error("database error: {0}")]
    Database(#[from] mysql::Error),
    /// The configured listen address could not be parsed.
    #[error("invalid listen address: {0}")]
    Address(#[from] std::net::AddrParseError),
    /// The database pool was configured with zero handles.
    #[error("database pool must hold at least one connection")]
    EmptyPool,
}

/// Result whose Err variant is [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
