//! Protocol-level errors.

use thiserror::Error;

/// Errors produced while framing or parsing IRC lines.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A line contained no command token.
    #[error("empty message")]
    EmptyMessage,

    /// A single line grew past the flood bound without a terminator.
    ///
    /// The 512-byte IRC limit is advisory; this is the hard cap that keeps a
    /// misbehaving peer from growing the read buffer forever.
    #[error("line too long: {actual} bytes (flood bound {limit})")]
    LineTooLong { actual: usize, limit: usize },

    /// Underlying transport error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
