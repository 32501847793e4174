//! Error types for the router

use std::io;

use thiserror::Error;

use crate::connection_id::ConnectionId;

/// Errors surfaced by the router.
///
/// Construction-time variants (`Resolve`, `Io`, `Config`, `Rng`, and engine
/// errors raised while building the engine configuration) abort instance
/// startup. The remaining variants are returned by per-session operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The bind/connect address did not resolve to any socket address
    #[error("failed to resolve {0}")]
    Resolve(String),

    /// Socket creation, bind, connect or I/O failure
    #[error("socket error: {0}")]
    Io(#[from] io::Error),

    /// The QUIC engine rejected an operation
    #[error("quic engine error: {0}")]
    Engine(#[from] quiche::Error),

    /// Invalid configuration value
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The system random number generator failed
    #[error("failed to generate random connection ID")]
    Rng,

    /// A live session already uses this connection ID
    #[error("connection {0} is already registered")]
    DuplicateConnectionId(ConnectionId),

    /// No live session uses this connection ID
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),

    /// A stream callback asked to stop processing
    #[error("stream callback failed: {0}")]
    Callback(String),
}

/// Crate result alias
pub type Result<T> = std::result::Result<T, Error>;
