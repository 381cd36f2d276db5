use shared::{ErrorType, FrameError, PacketType, ProtocolError};
use std::io;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("framing error: {0}")]
    Frame(#[from] FrameError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("connection closed by the cerver")]
    Closed,

    #[error("no packet within {0:?}")]
    Timeout(Duration),

    #[error("unexpected {0} packet")]
    Unexpected(PacketType),

    #[error("cerver error {error_type:?}: {message}")]
    Server { error_type: ErrorType, message: String },
}
