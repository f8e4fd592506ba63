use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// All error kinds surfaced by the library. OS errors pass through as `Io`.
#[derive(Debug, Error)]
pub enum Error {
    // tarball construction / addressing
    #[error("bad path: '{0}'")]
    BadPath(String),

    #[error("duplicate path: '{0}'")]
    DuplicatePaths(String),

    #[error("missing local path for '{0}'")]
    MissingLocalPath(String),

    #[error("local paths may only reference files, not directories: '{0}'")]
    FilesOnly(String),

    #[error("non-regular file not supported in compat mode: '{0}'")]
    CompatViolation(String),

    #[error("expected 0x00 padding byte at stream offset {0}")]
    BadPaddingByte(i64),

    #[error("offset out of range: {start}..{end_ex} (size {size})")]
    OutOfRange { start: i64, end_ex: i64, size: i64 },

    #[error("nil buffer")]
    NilBuffer,

    // interval set
    #[error("ack/nak out of range: {start}..{end_ex} (size {size})")]
    AckOutOfRange { start: i64, end_ex: i64, size: i64 },

    // wire codec
    #[error("message too short")]
    MessageTooShort,

    #[error("wrong protocol version {0}")]
    WrongProtocolVersion(u8),

    #[error("unknown opcode {0}")]
    UnknownOpcode(u8),

    #[error("metadata is malformed")]
    BadMetadata,

    // transport
    /// The socket's send buffer is full (ENOBUFS). Recoverable: callers back
    /// off or reduce their send rate.
    #[error("send buffer full")]
    BufferFull,

    #[error(transparent)]
    Io(#[from] io::Error),
}
