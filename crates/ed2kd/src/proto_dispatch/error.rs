//! Handler error types. Every handler error closes the connection.

use ed2kd_proto::error::{ErrorKind, ProtoError};

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("bad request: {0}")]
    BadMessage(#[from] ProtoError),

    #[error("message rate limit exceeded")]
    RateLimited,

    /// The client is not draining its outbound queue.
    #[error("outbound queue full or closed")]
    OutboundUnavailable,
}

impl HandlerError {
    pub fn rate_limited() -> Self {
        Self::RateLimited
    }

    /// Protocol category of the failure, if it came from the wire.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::BadMessage(e) => Some(e.kind()),
            Self::RateLimited | Self::OutboundUnavailable => None,
        }
    }
}

/// Convenient Result type for handlers.
pub type HandlerResult = Result<(), HandlerError>;
