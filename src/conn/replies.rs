//! Numeric replies the downstream side sends to clients.

use super::Conn;

/// Named numeric replies with their canned trailing text.
///
/// Replies whose text is supplied per call (332, 333, 353) are formatted at
/// the call site instead.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(dead_code)] // the full table is kept for plugin use
pub enum Reply {
    RplWelcome,
    RplIsupport,
    RplNoTopic,
    RplEndOfNames,
    RplMotdStart,
    RplMotd,
    RplEndOfMotd,
    ErrNoTextToSend,
    ErrUnknownCommand,
    ErrNoMotd,
    ErrNoNicknameGiven,
    ErrErroneusNickname,
    ErrNeedMoreParams,
    ErrAlreadyRegistred,
}

impl Reply {
    /// `(numeric, trailing-text template)`; `%s` is the format slot.
    pub fn parts(self) -> (u16, &'static str) {
        match self {
            Reply::RplWelcome => (1, "Welcome to the Internet Relay Network %s"),
            Reply::RplIsupport => (5, "are supported by this server"),
            Reply::RplNoTopic => (331, "No topic is set"),
            Reply::RplEndOfNames => (366, "End of NAMES list"),
            Reply::RplMotdStart => (375, "- %s Message of the day -"),
            Reply::RplMotd => (372, "- %s"),
            Reply::RplEndOfMotd => (376, "End of MOTD command"),
            Reply::ErrNoTextToSend => (412, "No text to send"),
            Reply::ErrUnknownCommand => (421, "Unknown command"),
            Reply::ErrNoMotd => (422, "MOTD File is missing"),
            Reply::ErrNoNicknameGiven => (431, "No nickname given"),
            Reply::ErrErroneusNickname => (432, "Erroneous nickname"),
            Reply::ErrNeedMoreParams => (461, "Not enough parameters."),
            Reply::ErrAlreadyRegistred => (462, "Unauthorized command (already registered)"),
        }
    }
}

/// Send a numeric reply: `:<server> <nnn> <nick> <params...> :<text>`.
///
/// The client's nick is `*` until it has one; `format_arg` fills the
/// template's `%s` slot.
pub fn send_reply(conn: &Conn, reply: Reply, params: &[&str], format_arg: Option<&str>) {
    let (numeric, template) = reply.parts();
    let text = match format_arg {
        Some(arg) => template.replacen("%s", arg, 1),
        None => template.to_owned(),
    };

    send_numeric(conn, numeric, params, &text);
}

/// Send a numeric with caller-supplied trailing text (332/333/353 family).
pub fn send_numeric(conn: &Conn, numeric: u16, params: &[&str], text: &str) {
    let me = conn.me();
    let nick = me.borrow().nick.clone().unwrap_or_else(|| "*".to_owned());

    let server = conn.server();
    let prefix = server.borrow().nick.clone();

    let code = format!("{:03}", numeric);

    let mut all_params: Vec<&str> = Vec::with_capacity(params.len() + 2);
    all_params.push(&nick);
    all_params.extend_from_slice(params);
    all_params.push(text);

    conn.send_message(&code, &all_params, prefix.as_deref());
}
