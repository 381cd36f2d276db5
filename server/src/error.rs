//! Error types for the cerver

use crate::connection::SockFd;
use thiserror::Error;

/// Errors surfaced by the cerver to the application.
///
/// Errors local to a single connection (bad packets, failed auth, peer
/// resets) are handled inside the multiplexer and never reach this type
/// unless the application itself was sending on that connection.
#[derive(Error, Debug)]
pub enum CerverError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] shared::ProtocolError),

    #[error("Framing error: {0}")]
    Frame(#[from] shared::FrameError),

    #[error("Job queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Connection {0} is closed")]
    ConnectionClosed(SockFd),

    #[error("Connection {0} is busy with another send")]
    SendBusy(SockFd),

    #[error("Timed out writing to connection {0}")]
    SendTimeout(SockFd),

    #[error("Blocking send called from inside the async runtime")]
    BlockingInRuntime,

    #[error("No async runtime available to drive the send")]
    NoRuntime,

    #[error("Cerver is not running")]
    NotRunning,

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Cerver {0} is already running")]
    AlreadyRunning(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("job queue is full ({capacity} jobs)")]
    Full { capacity: usize },

    #[error("timed out after {timeout_ms}ms waiting for job queue space")]
    Timeout { timeout_ms: u64 },

    #[error("job queue is closed")]
    Closed,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("on hold connections limit reached ({max})")]
    OnHoldFull { max: usize },

    #[error("active connections limit reached ({max})")]
    ActiveFull { max: usize },

    #[error("socket {0} is already registered")]
    Duplicate(SockFd),

    #[error("socket {0} is not on hold")]
    NotOnHold(SockFd),

    #[error("session {0} belongs to another client")]
    SessionTaken(String),
}
