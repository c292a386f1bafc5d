use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Failure taxonomy surfaced by the public API.
#[derive(Debug, Error)]
pub enum Error {
    /// A caller-supplied argument was rejected.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// The operation requires a broker connection that is not established.
    #[error("not ready: {0}")]
    NotReady(&'static str),

    /// An OS-level failure while handling sockets, threads or ciphers.
    #[error("system error: {0}")]
    System(#[from] io::Error),

    /// The broker client rejected or dropped a request.
    #[error("broker error: {0}")]
    Broker(String),

    /// A message was missing data the operation depends on.
    #[error("no data: {0}")]
    NoData(&'static str),

    /// A synchronous wait ran out of time.
    #[error("operation timed out")]
    TimedOut,
}
