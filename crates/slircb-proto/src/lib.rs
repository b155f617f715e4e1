//! Wire-protocol layer for the slircb IRC bouncer.
//!
//! This crate knows nothing about sessions or users; it is the line-level
//! vocabulary both sides of the bouncer speak:
//!
//! - [`Message`] — parse and format RFC-1459-family lines
//!   (`[:prefix] COMMAND params... [:trailing]`).
//! - [`Hostmask`] — the `nick!user@host` source form.
//! - [`Isupport`] / [`PrefixMap`] — `005` capability tokens and the
//!   positional `PREFIX=(modes)prefixes` map.
//! - [`LineCodec`] — a tokio codec framing CRLF/LF-terminated lines.

mod error;
mod hostmask;
mod isupport;
mod line;
mod message;

pub use self::error::ProtocolError;
pub use self::hostmask::Hostmask;
pub use self::isupport::{mode_to_prefix, prefix_to_mode, Isupport, PrefixMap};
pub use self::line::LineCodec;
pub use self::message::Message;

/// Advisory maximum IRC line length in bytes, including CRLF.
///
/// Overlong lines are transmitted as-is; the peer gets to reject them.
pub const MAX_LINE_LEN: usize = 512;
