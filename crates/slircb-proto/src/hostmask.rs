//! Hostmask (`nick!user@host`) parsing.

use std::fmt;

/// The canonical IRC source form, `nick!user@host`.
///
/// A prefix without both separators is treated as a bare nick (which is also
/// how server names arrive); `user` and `host` are then absent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Hostmask {
    pub nick: String,
    pub user: Option<String>,
    pub host: Option<String>,
}

impl Hostmask {
    /// Split a hostmask into its components.
    ///
    /// The split happens at the last `@` and, before it, the last `!` — the
    /// same grouping the `^(.*)!(.*)@(.*)$` form produces. Anything that
    /// doesn't match becomes all nick.
    pub fn parse(s: &str) -> Hostmask {
        if let Some(at) = s.rfind('@') {
            if let Some(bang) = s[..at].rfind('!') {
                return Hostmask {
                    nick: s[..bang].to_owned(),
                    user: Some(s[bang + 1..at].to_owned()),
                    host: Some(s[at + 1..].to_owned()),
                };
            }
        }

        Hostmask {
            nick: s.to_owned(),
            user: None,
            host: None,
        }
    }
}

impl fmt::Display for Hostmask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.user, &self.host) {
            (Some(user), Some(host)) => write!(f, "{}!{}@{}", self.nick, user, host),
            _ => f.write_str(&self.nick),
        }
    }
}
