//! Error types for Veles.

use std::io;

use thiserror::Error;

/// Result type alias for Veles operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Veles.
#[derive(Error, Debug)]
pub enum Error {
    // Wire-level errors
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The underlying stream ended in the middle of a frame.
    #[error("short read: stream ended mid-frame")]
    ShortRead,

    // Routing errors
    #[error("no writer known for path {0}")]
    PathUnavailable(u8),

    #[error("no usable paths")]
    NoAvailablePaths,

    // Session-level errors
    #[error("upstream server failure: {0}")]
    UpstreamFailure(String),

    // Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // General errors
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Frame parsing and handling errors.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("invalid direction byte: {0}")]
    InvalidDirection(i8),

    #[error("fragment total mismatch for seq {seq}: expected {expected}, got {got}")]
    FragmentMismatch { seq: u64, expected: u16, got: u16 },

    #[error("fragment id {frag_id} out of range (total {frag_total})")]
    FragmentOutOfRange { frag_id: u16, frag_total: u16 },

    #[error("unknown protocol family: {0}")]
    UnknownFamily(u16),
}

impl Error {
    /// True when the error only ends the session cleanly (peer went away).
    pub fn is_clean_close(&self) -> bool {
        match self {
            Error::ShortRead => true,
            Error::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }

    /// True when the error is fatal for the path that produced it but not
    /// for the session as a whole.
    pub fn is_path_fatal(&self) -> bool {
        matches!(self, Error::Protocol(_) | Error::PathUnavailable(_))
    }
}
