use thiserror::Error;

/// Coarse classification of a [`ProtoError`].
///
/// The server decides what to tear down from this alone: everything is fatal
/// on the primary connection, while on the port-check link every kind just
/// fails the check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Framing,
    Decompression,
    Malformed,
    HandshakeMismatch,
}

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("unknown protocol marker {0:#04x}")]
    UnknownProtocol(u8),
    #[error("empty frame (no opcode)")]
    EmptyFrame,
    #[error("frame too large: {0}")]
    FrameTooLarge(usize),

    #[error("decompression failed: {0}")]
    Decompress(String),
    #[error("compression failed: {0}")]
    Compress(String),

    #[error("buffer too short: need {needed}, have {remaining}")]
    TooShort { needed: usize, remaining: usize },
    #[error("extended tag type {0:#04x} not allowed here")]
    ExtendedTag(u8),
    #[error("unknown tag type {0:#04x}")]
    UnknownTagType(u8),
    #[error("tag {name} has unexpected type {tag_type:#04x}")]
    UnexpectedTagType { name: String, tag_type: u8 },
    #[error("unknown tag name {0}")]
    UnknownTagName(String),
    #[error("unsupported protocol version {0:#x}")]
    UnsupportedVersion(u32),
    #[error("too many files offered: {0}")]
    TooManyFiles(u32),
    #[error("unknown opcode {0:#04x}")]
    UnknownOpcode(u8),
    #[error("bad hash size {0}")]
    BadHashSize(u8),

    #[error("hello answer hash mismatch")]
    HashMismatch,
}

impl ProtoError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProtoError::UnknownProtocol(_) | ProtoError::EmptyFrame | ProtoError::FrameTooLarge(_) => {
                ErrorKind::Framing
            }
            ProtoError::Decompress(_) | ProtoError::Compress(_) => ErrorKind::Decompression,
            ProtoError::HashMismatch => ErrorKind::HandshakeMismatch,
            _ => ErrorKind::Malformed,
        }
    }
}
