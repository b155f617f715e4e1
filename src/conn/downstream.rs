//! The downstream role: the bouncer acting as an IRC server towards a
//! user's client.
//!
//! Registration is gated on NICK+USER+PASS: once all three are in, the
//! `authentication` event decides ownership. On success the client gets the
//! welcome burst, then the VERSION and MOTD lines are replayed internally so
//! the client sees the upstream's ISUPPORT and MOTD (mirrored into this
//! connection by the owning session's registration observers).

use std::net::IpAddr;
use std::rc::Rc;
use std::time::Duration;

use hickory_resolver::TokioResolver;
use hickory_resolver::config::ResolverConfig;
use hickory_resolver::name_server::TokioConnectionProvider;
use tracing::debug;

use crate::event::{Outcome, Phase, listener};

use super::replies::{send_numeric, send_reply};
use super::{AuthArgs, CommandArgs, ConnEvents, ConnRef, Reply};

/// The server name this bouncer presents to attached clients.
pub const SERVER_NAME: &str = "server.slircb.local";

const RDNS_TIMEOUT: Duration = Duration::from_secs(3);

/// Reply lines longer than this are split into several numerics.
const REPLY_PACK_BUDGET: usize = 300;

pub(super) fn register_builtins(events: &Rc<ConnEvents>) {
    events
        .command_received
        .add_listener(listener(handle_command), Phase::Handler, None, false);
}

/// Greet the client and kick off best-effort reverse DNS.
pub(super) async fn on_connection_made(conn: &ConnRef) {
    conn.start_registration_timer();

    conn.send_message(
        "NOTICE",
        &["AUTH", "*** slircb 0.1 - Straylight IRC Bouncer"],
        None,
    );
    conn.send_message("NOTICE", &["AUTH", "*** Looking up your hostname"], None);

    let resolved = match conn.peer_ip() {
        Some(ip) => reverse_dns(ip).await,
        None => None,
    };

    match resolved {
        Some(hostname) => {
            conn.me().borrow_mut().host = Some(hostname.clone());
            conn.send_message(
                "NOTICE",
                &["AUTH", &format!("*** Found your hostname ({})", hostname)],
                None,
            );
        }
        None => {
            let fallback = conn
                .me()
                .borrow()
                .host
                .clone()
                .unwrap_or_else(|| "unknown".to_owned());
            conn.send_message(
                "NOTICE",
                &[
                    "AUTH",
                    &format!(
                        "*** Couldn't look up your hostname, using your IP address instead ({})",
                        fallback
                    ),
                ],
                None,
            );
        }
    }
}

async fn reverse_dns(ip: IpAddr) -> Option<String> {
    let resolver = TokioResolver::builder_tokio()
        .map(|b| b.build())
        .unwrap_or_else(|_| {
            TokioResolver::builder_with_config(
                ResolverConfig::default(),
                TokioConnectionProvider::default(),
            )
            .build()
        });

    match tokio::time::timeout(RDNS_TIMEOUT, resolver.reverse_lookup(ip)).await {
        Ok(Ok(names)) => names
            .iter()
            .next()
            .map(|ptr| ptr.to_string().trim_end_matches('.').to_owned()),
        _ => {
            debug!(ip = %ip, "reverse lookup failed");
            None
        }
    }
}

/// Try to complete registration; called whenever USER, NICK or PASS arrives.
pub(super) fn register_user(conn: &ConnRef) {
    if conn.is_registered() {
        return;
    }

    let me = conn.me();
    let (nick, user) = {
        let me = me.borrow();
        (me.nick.clone(), me.user.clone())
    };

    let (Some(_), Some(username)) = (nick, user) else {
        return;
    };

    let Some(password) = conn.client_password() else {
        conn.send_message(
            "NOTICE",
            &[
                "AUTH",
                "*** Your client did not send a password, please use /QUOTE PASS <password> to send one now.",
            ],
            None,
        );
        return;
    };

    conn.events().authentication.dispatch(&AuthArgs {
        conn: conn.clone(),
        username,
        password,
    });

    if conn.owner().is_none() {
        conn.close(Some("Authentication failed: Invalid user credentials."));
        return;
    }

    conn.clear_client_password();
    conn.complete_registration();

    let mask = me.borrow().to_string();
    send_reply(conn, Reply::RplWelcome, &[], Some(&mask));

    // Replayed internally so the client sees the mirrored upstream state.
    conn.process_line("VERSION");
    conn.process_line("MOTD");
}

fn handle_command(args: &CommandArgs) -> Outcome {
    match args.command.as_str() {
        "USER" => on_user(args),
        "NICK" => on_nick(args),
        "PASS" => on_pass(args),
        "QUIT" => {
            args.conn.close(Some("Goodbye."));
            Outcome::HANDLED
        }
        "VERSION" => on_version(args),
        "MOTD" => on_motd(args),
        "NAMES" => on_names(args),
        "TOPIC" => on_topic(args),
        _ => Outcome::CONTINUE,
    }
}

fn on_user(args: &CommandArgs) -> Outcome {
    let conn = &args.conn;

    if args.params.len() < 4 {
        send_reply(conn, Reply::ErrNeedMoreParams, &["USER"], None);
        return Outcome::HANDLED;
    }
    if conn.is_registered() {
        send_reply(conn, Reply::ErrAlreadyRegistred, &[], None);
        return Outcome::HANDLED;
    }

    {
        let me = conn.me();
        let mut me = me.borrow_mut();
        me.user = Some(args.params[0].clone());
        me.realname = Some(args.params[3].clone());
    }

    register_user(conn);
    Outcome::HANDLED
}

fn on_nick(args: &CommandArgs) -> Outcome {
    let conn = &args.conn;

    let Some(nick) = args.params.first() else {
        send_reply(conn, Reply::ErrNoNicknameGiven, &["NICK"], None);
        return Outcome::HANDLED;
    };

    if conn.me().borrow().nick.as_deref() == Some(nick.as_str()) {
        return Outcome::HANDLED;
    }

    if nick.contains(' ') {
        send_reply(conn, Reply::ErrErroneusNickname, &[nick], None);
        return Outcome::HANDLED;
    }

    if !conn.is_registered() {
        conn.me().borrow_mut().nick = Some(nick.clone());
        register_user(conn);
        return Outcome::HANDLED;
    }

    // Echo the change under the old identity, then let the forwarding
    // handler pass the NICK through to the upstream.
    let old_mask = conn.me().borrow().to_string();
    conn.send_message("NICK", &[nick], Some(&old_mask));
    conn.me().borrow_mut().nick = Some(nick.clone());
    Outcome::CONTINUE
}

fn on_pass(args: &CommandArgs) -> Outcome {
    let conn = &args.conn;

    let Some(password) = args.params.first() else {
        send_reply(conn, Reply::ErrNeedMoreParams, &["PASS"], None);
        return Outcome::HANDLED;
    };
    if conn.is_registered() {
        send_reply(conn, Reply::ErrAlreadyRegistred, &[], None);
        return Outcome::HANDLED;
    }

    conn.set_client_password(password);
    register_user(conn);
    Outcome::HANDLED
}

fn on_version(args: &CommandArgs) -> Outcome {
    let conn = &args.conn;

    if !conn.is_registered() || !args.params.is_empty() {
        return Outcome::CONTINUE;
    }

    let isupport = conn.isupport();
    let tokens: Vec<String> = isupport.borrow().tokens().collect();

    let mut chunk: Vec<String> = Vec::new();
    let mut length = 0;

    for token in tokens {
        // Flush before appending so the over-budget token lands in the next
        // reply instead of being dropped.
        if length > REPLY_PACK_BUDGET {
            flush_isupport(conn, &chunk);
            chunk.clear();
            length = 0;
        }

        length += token.len();
        chunk.push(token);
    }

    if !chunk.is_empty() {
        flush_isupport(conn, &chunk);
    }

    Outcome::HANDLED
}

fn flush_isupport(conn: &ConnRef, tokens: &[String]) {
    let refs: Vec<&str> = tokens.iter().map(String::as_str).collect();
    send_reply(conn, Reply::RplIsupport, &refs, None);
}

fn on_motd(args: &CommandArgs) -> Outcome {
    let conn = &args.conn;

    if !conn.is_registered() {
        return Outcome::CONTINUE;
    }

    let motd = conn.motd();
    let motd = motd.borrow();

    if motd.is_empty() {
        send_reply(conn, Reply::ErrNoMotd, &[], None);
        return Outcome::HANDLED;
    }

    let server_name = conn.server().borrow().to_string();
    send_reply(conn, Reply::RplMotdStart, &[], Some(&server_name));
    for line in motd.iter() {
        send_reply(conn, Reply::RplMotd, &[], Some(line));
    }
    send_reply(conn, Reply::RplEndOfMotd, &[], None);

    Outcome::HANDLED
}

fn on_names(args: &CommandArgs) -> Outcome {
    let conn = &args.conn;

    if !conn.is_registered() || args.params.len() != 1 || args.params[0].contains(',') {
        return Outcome::CONTINUE;
    }

    let channel_name = &args.params[0];
    let prefix_map = conn.isupport().borrow().prefix_map();

    let channels = conn.channels();
    let channels = channels.borrow();

    if let Some(chan) = channels.get(channel_name) {
        let chantype = if chan.has_mode('s') {
            "@"
        } else if chan.has_mode('p') {
            "*"
        } else {
            "="
        };

        let mut chunk: Vec<String> = Vec::new();
        let mut length = 0;

        for membership in chan.members() {
            let Some(nickname) = membership.nickname() else {
                continue;
            };

            let mut token = String::new();
            if let Some(map) = &prefix_map {
                for mode in membership.modes.chars() {
                    if let Some(prefix) = map.mode_to_prefix(mode) {
                        token.push(prefix);
                    }
                }
            }
            token.push_str(&nickname);

            if length > REPLY_PACK_BUDGET {
                send_numeric(conn, 353, &[chantype, channel_name], &chunk.join(" "));
                chunk.clear();
                length = 0;
            }

            length += token.len();
            chunk.push(token);
        }

        if !chunk.is_empty() {
            send_numeric(conn, 353, &[chantype, channel_name], &chunk.join(" "));
        }
    }

    send_reply(conn, Reply::RplEndOfNames, &[channel_name], None);
    Outcome::HANDLED
}

fn on_topic(args: &CommandArgs) -> Outcome {
    let conn = &args.conn;

    if !conn.is_registered() || args.params.len() != 1 {
        return Outcome::CONTINUE;
    }

    let channel_name = &args.params[0];
    let channels = conn.channels();
    let channels = channels.borrow();

    match channels.get(channel_name).and_then(|c| {
        c.topic_text
            .as_ref()
            .map(|text| (text.clone(), c.topic_nick.clone(), c.topic_time))
    }) {
        Some((text, topic_nick, topic_time)) => {
            send_numeric(conn, 332, &[channel_name], &text);

            if let (Some(who), Some(time)) = (topic_nick, topic_time) {
                let seconds = time.timestamp().to_string();
                send_numeric(conn, 333, &[channel_name, &who], &seconds);
            }
        }
        None => {
            send_reply(conn, Reply::RplNoTopic, &[channel_name], None);
        }
    }

    Outcome::HANDLED
}

#[cfg(test)]
mod tests {
    use super::super::{ConnKind, ConnRef, ConnectionFactory, Endpoint};
    use super::*;
    use crate::state::Channel;

    fn downstream_conn() -> ConnRef {
        let factory = ConnectionFactory::new(ConnKind::Downstream);
        factory
            .create(None, Endpoint::Incoming("127.0.0.1:50000".parse().unwrap()))
            .unwrap()
    }

    /// A downstream that skipped authentication (no owner involved).
    fn registered_conn() -> ConnRef {
        let conn = downstream_conn();
        {
            let me = conn.me();
            let mut me = me.borrow_mut();
            me.nick = Some("alice".to_owned());
            me.user = Some("alice".to_owned());
        }
        conn.complete_registration();
        conn
    }

    #[test]
    fn user_needs_four_params() {
        let conn = downstream_conn();
        conn.process_line("USER onlyone");
        let out = conn.drain_outbound();
        assert_eq!(out.len(), 1);
        assert!(out[0].contains(" 461 * USER :Not enough parameters."));
    }

    #[test]
    fn nick_without_argument() {
        let conn = downstream_conn();
        conn.process_line("NICK");
        let out = conn.drain_outbound();
        assert!(out[0].contains(" 431 * NICK :No nickname given"));
    }

    #[test]
    fn nick_with_space_is_erroneous() {
        let conn = downstream_conn();
        conn.process_line("NICK :bad nick");
        let out = conn.drain_outbound();
        assert!(out[0].contains(" 432 * bad nick :Erroneous nickname"));
    }

    #[test]
    fn pass_after_registration_is_rejected() {
        let conn = registered_conn();
        conn.process_line("PASS whatever");
        let out = conn.drain_outbound();
        assert!(out[0].contains(" 462 alice :Unauthorized command (already registered)"));
    }

    #[test]
    fn missing_password_prompts_for_one() {
        let conn = downstream_conn();
        conn.process_line("NICK alice");
        conn.process_line("USER alice 0 * :Alice");

        let out = conn.drain_outbound();
        assert!(
            out.iter()
                .any(|l| l.contains("did not send a password")),
            "expected password prompt, got {:?}",
            out
        );
        assert!(!conn.is_registered());
        assert!(!conn.is_closed());
    }

    #[test]
    fn unauthenticated_registration_closes_with_error() {
        // no authentication handler is registered, so ownership never gets set
        let conn = downstream_conn();
        conn.process_line("PASS s3cret");
        conn.process_line("NICK alice");
        conn.process_line("USER alice 0 * :Alice");

        let out = conn.drain_outbound();
        assert!(
            out.iter()
                .any(|l| l == "ERROR :Authentication failed: Invalid user credentials.")
        );
        assert!(conn.is_closed());
        assert!(!conn.is_registered());
    }

    #[test]
    fn quit_closes_with_goodbye() {
        let conn = registered_conn();
        conn.process_line("QUIT");
        assert!(conn.is_closed());
        let out = conn.drain_outbound();
        assert_eq!(out, vec!["ERROR Goodbye."]);
    }

    #[test]
    fn unknown_command_gets_421() {
        let conn = registered_conn();
        conn.process_line("FROBNICATE x");
        let out = conn.drain_outbound();
        assert!(out[0].contains(" 421 alice FROBNICATE :Unknown command"));
    }

    #[test]
    fn motd_replies_from_mirror() {
        let conn = registered_conn();
        conn.motd().borrow_mut().push("line one".to_owned());
        conn.motd().borrow_mut().push("line two".to_owned());

        conn.process_line("MOTD");
        let out = conn.drain_outbound();
        assert!(out[0].contains(" 375 alice :- "));
        assert!(out[1].contains(" 372 alice :- line one"));
        assert!(out[2].contains(" 372 alice :- line two"));
        assert!(out[3].contains(" 376 alice :End of MOTD command"));
    }

    #[test]
    fn empty_motd_gives_422() {
        let conn = registered_conn();
        conn.process_line("MOTD");
        let out = conn.drain_outbound();
        assert!(out[0].contains(" 422 alice :MOTD File is missing"));
    }

    #[test]
    fn version_packs_isupport_tokens() {
        let conn = registered_conn();
        {
            let isupport = conn.isupport();
            let mut isupport = isupport.borrow_mut();
            for i in 0..40 {
                isupport.set(&format!("KEY{:02}", i), "valuevaluevalue");
            }
        }

        conn.process_line("VERSION");
        let out = conn.drain_outbound();

        assert!(out.len() >= 2, "expected several 005 lines, got {:?}", out);
        for line in &out {
            assert!(line.contains(" 005 alice "));
            assert!(line.ends_with(":are supported by this server"));
            assert!(line.len() + 2 <= 400, "overlong reply: {}", line);
        }

        // every token appears exactly once across the replies
        let all: String = out.join(" ");
        for i in 0..40 {
            let token = format!("KEY{:02}=valuevaluevalue", i);
            assert_eq!(
                all.matches(&token).count(),
                1,
                "token {} lost or duplicated",
                token
            );
        }
    }

    #[test]
    fn names_lists_members_with_prefixes() {
        let conn = registered_conn();
        {
            let channels = conn.channels();
            let mut channels = channels.borrow_mut();
            let chan = channels
                .entry("#chan".to_owned())
                .or_insert_with(|| Channel::new("#chan"));
            chan.add_member(crate::state::Nick::from_hostmask(
                &slircb_proto::Hostmask::parse("op!o@h"),
            ))
            .modes = "o".to_owned();
            chan.add_member(crate::state::Nick::from_hostmask(
                &slircb_proto::Hostmask::parse("voiced!v@h"),
            ))
            .modes = "v".to_owned();
            chan.add_member(crate::state::Nick::from_hostmask(
                &slircb_proto::Hostmask::parse("plain!p@h"),
            ));
        }

        conn.process_line("NAMES #chan");
        let out = conn.drain_outbound();
        assert!(out[0].contains(" 353 alice = #chan :@op +voiced plain"));
        assert!(out[1].contains(" 366 alice #chan :End of NAMES list"));
    }

    #[test]
    fn names_on_unknown_channel_just_ends() {
        let conn = registered_conn();
        conn.process_line("NAMES #nowhere");
        let out = conn.drain_outbound();
        assert_eq!(out.len(), 1);
        assert!(out[0].contains(" 366 alice #nowhere :End of NAMES list"));
    }

    #[test]
    fn names_with_comma_falls_through() {
        let conn = registered_conn();
        conn.process_line("NAMES #a,#b");
        let out = conn.drain_outbound();
        // no forwarding handler in this test, so the fallback answers
        assert!(out[0].contains(" 421 alice NAMES :Unknown command"));
    }

    #[test]
    fn topic_reports_cached_topic() {
        let conn = registered_conn();
        {
            let channels = conn.channels();
            let mut channels = channels.borrow_mut();
            let chan = channels
                .entry("#chan".to_owned())
                .or_insert_with(|| Channel::new("#chan"));
            chan.topic_text = Some("hello".to_owned());
            chan.topic_nick = Some("op".to_owned());
            chan.topic_time = chrono::TimeZone::timestamp_opt(&chrono::Utc, 1_700_000_000, 0).single();
        }

        conn.process_line("TOPIC #chan");
        let out = conn.drain_outbound();
        assert!(out[0].contains(" 332 alice #chan :hello"));
        assert!(out[1].contains(" 333 alice #chan op 1700000000"));
    }

    #[test]
    fn topic_without_one_reports_331() {
        let conn = registered_conn();
        {
            let channels = conn.channels();
            channels
                .borrow_mut()
                .insert("#chan".to_owned(), Channel::new("#chan"));
        }

        conn.process_line("TOPIC #chan");
        let out = conn.drain_outbound();
        assert!(out[0].contains(" 331 alice #chan :No topic is set"));
    }

    #[test]
    fn registered_nick_change_echoes_old_identity() {
        let conn = registered_conn();
        conn.me().borrow_mut().host = Some("example.org".to_owned());
        conn.process_line("NICK alicia");

        let out = conn.drain_outbound();
        assert!(out.iter().any(|l| l.starts_with(":alice!alice@example.org NICK alicia")));
        assert_eq!(conn.me().borrow().nick.as_deref(), Some("alicia"));
    }
}
