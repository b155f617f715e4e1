//! The upstream role: the bouncer acting as a client towards an IRC server.
//!
//! State tracking (001/005, MOTD, channels, names, topics) runs as a
//! pre-observer so sessions and plugins always see already-updated state;
//! only PING and ERROR claim their dispatches outright.

use std::rc::Rc;

use chrono::{TimeZone, Utc};
use tracing::{debug, warn};

use crate::event::{listener, Outcome, Phase};

use super::{CommandArgs, ConnEvents, ConnRef};

pub(super) fn register_builtins(events: &Rc<ConnEvents>) {
    events.command_received.add_listener(
        listener(handle_ping_error),
        Phase::Handler,
        None,
        false,
    );

    events.command_received.add_listener(
        listener(|args: &CommandArgs| {
            track_state(args);
            Outcome::CONTINUE
        }),
        Phase::PreObserver,
        None,
        false,
    );
}

/// Send the registration burst once the socket is up.
pub(super) fn on_connection_made(conn: &ConnRef) {
    conn.start_registration_timer();

    let (nickname, username, realname, password) = {
        let reg = conn.reg();
        (
            reg.nickname.clone(),
            reg.username.clone(),
            reg.realname.clone(),
            reg.password.clone(),
        )
    };

    let (Some(nickname), Some(username), Some(realname)) = (nickname, username, realname) else {
        warn!(peer = %conn.peer(), "upstream connection without registration identity");
        conn.close(None);
        return;
    };

    if let Some(password) = password {
        conn.send_message("PASS", &[&password], None);
    }

    conn.send_message("USER", &[&username, "0", "*", &realname], None);
    conn.send_message("NICK", &[&nickname], None);
}

fn handle_ping_error(args: &CommandArgs) -> Outcome {
    match args.command.as_str() {
        "PING" => {
            let Some(token) = args.params.first() else {
                return Outcome::CONTINUE;
            };
            args.conn.send_line(&format!("PONG :{}", token));
            Outcome::HANDLED
        }
        "ERROR" => {
            debug!(peer = %args.conn.peer(), "server sent ERROR");
            args.conn.close(None);
            Outcome::HANDLED
        }
        _ => Outcome::CONTINUE,
    }
}

fn track_state(args: &CommandArgs) {
    match args.command.as_str() {
        "001" => on_welcome(args),
        "005" => on_isupport(args),
        "375" => args.conn.motd().borrow_mut().clear(),
        "372" => on_motd_line(args),
        "NICK" => on_nick(args),
        "JOIN" => on_join(args),
        "PART" => on_part(args),
        "KICK" => on_kick(args),
        "QUIT" => on_quit(args),
        "353" => on_names_reply(args),
        "366" => on_end_of_names(args),
        "433" => on_nick_in_use(args),
        "331" => on_no_topic(args),
        "332" => on_topic_text(args),
        "333" => on_topic_whotime(args),
        "TOPIC" => on_topic_change(args),
        "329" => on_creation_time(args),
        "305" => args.conn.me().borrow_mut().away = false,
        "306" => args.conn.me().borrow_mut().away = true,
        _ => {}
    }
}

// :server 001 nick :Welcome to the ExampleNet IRC Network, nick
fn on_welcome(args: &CommandArgs) {
    let conn = &args.conn;

    if let Some(nickname) = conn.reg().nickname.clone() {
        conn.me().borrow_mut().nick = Some(nickname);
    }

    if let Some(sender) = &args.nick {
        conn.set_server(sender.clone());
    }

    conn.complete_registration();
}

// :server 005 nick SILENCE=15 MODES=6 NICKLEN=15 :are supported by this server
fn on_isupport(args: &CommandArgs) {
    if args.params.len() < 3 {
        return;
    }

    let isupport = args.conn.isupport();
    let mut isupport = isupport.borrow_mut();

    for token in &args.params[1..args.params.len() - 1] {
        match token.split_once('=') {
            Some((key, value)) => isupport.set(key, value),
            None => isupport.set(token, ""),
        }
    }
}

// :server 372 nick :- Welcome to this server
fn on_motd_line(args: &CommandArgs) {
    if args.params.len() < 2 {
        return;
    }

    let line = &args.params[args.params.len() - 1];
    let line = line.strip_prefix("- ").unwrap_or(line);
    args.conn.motd().borrow_mut().push(line.to_owned());
}

// :old!u@h NICK :new
fn on_nick(args: &CommandArgs) {
    let (Some(nickobj), Some(new)) = (&args.nick, args.params.first()) else {
        return;
    };

    let old = {
        let mut nick = nickobj.borrow_mut();
        let old = nick.nick.clone();
        nick.nick = Some(new.clone());
        old
    };

    if let Some(old) = old {
        args.conn.nicks().rename(&old, new);
    }
}

// :nick!u@h JOIN #chan
fn on_join(args: &CommandArgs) {
    let (Some(nickobj), Some(channel)) = (&args.nick, args.params.first()) else {
        return;
    };

    let conn = &args.conn;
    let channels = conn.channels();
    let mut channels = channels.borrow_mut();

    if Rc::ptr_eq(nickobj, &conn.me()) {
        channels.insert(channel.clone(), crate::state::Channel::new(channel));
    }

    let Some(chan) = channels.get_mut(channel) else {
        return;
    };

    chan.add_member(nickobj.clone());
}

// :nick!u@h PART #chan
fn on_part(args: &CommandArgs) {
    let (Some(nickobj), Some(channel)) = (&args.nick, args.params.first()) else {
        return;
    };

    let conn = &args.conn;
    let channels = conn.channels();
    let mut channels = channels.borrow_mut();

    if !channels.contains_key(channel) {
        return;
    }

    if Rc::ptr_eq(nickobj, &conn.me()) {
        channels.remove(channel);
    } else if let Some(chan) = channels.get_mut(channel) {
        if let Some(name) = nickobj.borrow().nick.clone() {
            chan.remove_member(&name);
        }
    }
}

// :nick!u@h KICK #chan victim :reason
fn on_kick(args: &CommandArgs) {
    if args.params.len() < 2 {
        return;
    }

    let conn = &args.conn;
    let channel = &args.params[0];
    let victim = &args.params[1];

    let channels = conn.channels();
    let mut channels = channels.borrow_mut();

    if !channels.contains_key(channel) {
        return;
    }

    let me_nick = conn.me().borrow().nick.clone();
    if me_nick.as_deref() == Some(victim.as_str()) {
        channels.remove(channel);
    } else if let Some(chan) = channels.get_mut(channel) {
        chan.remove_member(victim);
    }
}

// :nick!u@h QUIT :reason
fn on_quit(args: &CommandArgs) {
    let Some(nickobj) = &args.nick else {
        return;
    };
    let Some(name) = nickobj.borrow().nick.clone() else {
        return;
    };

    let channels = args.conn.channels();
    for chan in channels.borrow_mut().values_mut() {
        chan.remove_member(&name);
    }
}

// :server 353 nick = #chan :@op +voiced plain
fn on_names_reply(args: &CommandArgs) {
    if args.params.len() < 4 {
        return;
    }

    let conn = &args.conn;
    let channel = &args.params[2];
    let prefix_map = conn.isupport().borrow().prefix_map();

    let channels = conn.channels();
    let mut channels = channels.borrow_mut();

    let Some(chan) = channels.get_mut(channel) else {
        return;
    };

    for token in args.params[3].split_whitespace() {
        let mut rest = token;
        let mut modes = String::new();

        if let Some(map) = &prefix_map {
            while let Some(c) = rest.chars().next() {
                match map.prefix_to_mode(c) {
                    Some(mode) => {
                        modes.push(mode);
                        rest = &rest[c.len_utf8()..];
                    }
                    None => break,
                }
            }
        }

        if rest.is_empty() {
            continue;
        }

        let nickobj = conn.get_nick(rest);
        chan.add_member(nickobj).modes = modes;
    }
}

// :server 366 nick #chan :End of /NAMES list.
fn on_end_of_names(args: &CommandArgs) {
    if args.params.len() < 2 {
        return;
    }

    let channels = args.conn.channels();
    if let Some(chan) = channels.borrow_mut().get_mut(&args.params[1]) {
        chan.has_names = true;
    }
}

// :server 433 * nick :Nickname is already in use.
fn on_nick_in_use(args: &CommandArgs) {
    let conn = &args.conn;
    if conn.is_registered() {
        return;
    }

    let mut reg = conn.reg();
    let Some(nickname) = reg.nickname.as_mut() else {
        return;
    };

    nickname.push('_');
    let retry = nickname.clone();
    drop(reg);

    debug!(peer = %conn.peer(), nick = %retry, "nick in use, retrying");
    conn.send_message("NICK", &[&retry], None);
}

// :server 331 nick #chan :No topic is set
fn on_no_topic(args: &CommandArgs) {
    if args.params.len() < 2 {
        return;
    }

    let channels = args.conn.channels();
    if let Some(chan) = channels.borrow_mut().get_mut(&args.params[1]) {
        chan.topic_text = None;
        chan.topic_nick = None;
        chan.topic_time = None;
        chan.has_topic = true;
    }
}

// :server 332 nick #chan :the topic
fn on_topic_text(args: &CommandArgs) {
    if args.params.len() < 3 {
        return;
    }

    let channels = args.conn.channels();
    if let Some(chan) = channels.borrow_mut().get_mut(&args.params[1]) {
        chan.topic_text = Some(args.params[2].clone());
        if chan.topic_nick.is_some() {
            chan.has_topic = true;
        }
    }
}

// :server 333 nick #chan who 1700000000
fn on_topic_whotime(args: &CommandArgs) {
    if args.params.len() < 4 {
        return;
    }

    let Ok(seconds) = args.params[3].parse::<i64>() else {
        return;
    };

    let channels = args.conn.channels();
    if let Some(chan) = channels.borrow_mut().get_mut(&args.params[1]) {
        chan.topic_nick = Some(args.params[2].clone());
        chan.topic_time = Utc.timestamp_opt(seconds, 0).single();
        if chan.topic_text.is_some() {
            chan.has_topic = true;
        }
    }
}

// :nick!u@h TOPIC #chan :new topic
fn on_topic_change(args: &CommandArgs) {
    let Some(nickobj) = &args.nick else {
        return;
    };
    if args.params.len() < 2 {
        return;
    }

    let channels = args.conn.channels();
    if let Some(chan) = channels.borrow_mut().get_mut(&args.params[0]) {
        chan.topic_text = Some(args.params[1].clone());
        chan.topic_nick = Some(nickobj.borrow().to_string());
        chan.topic_time = Some(Utc::now());
        chan.has_topic = true;
    }
}

// :server 329 nick #chan 1600000000
fn on_creation_time(args: &CommandArgs) {
    if args.params.len() < 3 {
        return;
    }

    let Ok(seconds) = args.params[2].parse::<i64>() else {
        return;
    };

    let channels = args.conn.channels();
    if let Some(chan) = channels.borrow_mut().get_mut(&args.params[1]) {
        chan.created = Utc.timestamp_opt(seconds, 0).single();
    }
}
