//! IRC message parsing and formatting.
//!
//! A message is `[":" prefix SPACE] command [params]` where the first
//! parameter token that begins with `:` starts the trailing parameter, which
//! consumes the rest of the line. Commands are matched case-insensitively by
//! the protocol; this layer leaves them untouched and callers normalise.

use std::fmt;
use std::str::FromStr;

use crate::error::ProtocolError;

/// A parsed IRC message.
///
/// # Example
///
/// ```
/// use slircb_proto::Message;
///
/// let msg: Message = ":nick!u@h PRIVMSG #c :hi there".parse().unwrap();
/// assert_eq!(msg.prefix.as_deref(), Some("nick!u@h"));
/// assert_eq!(msg.command, "PRIVMSG");
/// assert_eq!(msg.params, vec!["#c", "hi there"]);
/// assert_eq!(msg.to_string(), ":nick!u@h PRIVMSG #c :hi there");
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    /// Message source, verbatim (without the leading `:`).
    pub prefix: Option<String>,
    /// The command or three-digit numeric, as it appeared on the wire.
    pub command: String,
    /// Parameters; only the last may contain spaces or be empty.
    pub params: Vec<String>,
}

impl Message {
    /// Build a message from raw components.
    pub fn new<C, P>(prefix: Option<&str>, command: C, params: P) -> Message
    where
        C: Into<String>,
        P: IntoIterator,
        P::Item: Into<String>,
    {
        Message {
            prefix: prefix.map(str::to_owned),
            command: command.into(),
            params: params.into_iter().map(Into::into).collect(),
        }
    }

    /// Parse one line with CR/LF already stripped.
    ///
    /// Splits on single spaces: a leading `:token` is the prefix, the first
    /// later token beginning with `:` opens the trailing parameter, which
    /// swallows the remainder of the line rejoined with single spaces.
    pub fn parse(line: &str) -> Result<Message, ProtocolError> {
        let mut prefix = None;
        let mut params: Vec<String> = Vec::new();
        let mut trailing: Option<String> = None;
        let mut first = true;

        for token in line.split(' ') {
            if first {
                first = false;
                if let Some(rest) = token.strip_prefix(':') {
                    prefix = Some(rest.to_owned());
                    continue;
                }
            }

            match trailing {
                Some(ref mut t) => {
                    t.push(' ');
                    t.push_str(token);
                }
                None => {
                    if let Some(rest) = token.strip_prefix(':') {
                        trailing = Some(rest.to_owned());
                    } else {
                        params.push(token.to_owned());
                    }
                }
            }
        }

        if let Some(t) = trailing {
            params.push(t);
        }

        if params.is_empty() || params[0].is_empty() {
            return Err(ProtocolError::EmptyMessage);
        }

        let command = params.remove(0);

        Ok(Message {
            prefix,
            command,
            params,
        })
    }
}

impl FromStr for Message {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Message, ProtocolError> {
        Message::parse(s)
    }
}

impl fmt::Display for Message {
    /// Format for the wire, without the trailing CRLF.
    ///
    /// The last parameter gets the `:` marker when it contains a space, is
    /// empty, or itself starts with `:` — anything else would not survive a
    /// parse round-trip.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref prefix) = self.prefix {
            write!(f, ":{} ", prefix)?;
        }

        f.write_str(&self.command)?;

        if let Some((last, middle)) = self.params.split_last() {
            for param in middle {
                write!(f, " {}", param)?;
            }

            if last.is_empty() || last.contains(' ') || last.starts_with(':') {
                write!(f, " :{}", last)?;
            } else {
                write!(f, " {}", last)?;
            }
        }

        Ok(())
    }
}
