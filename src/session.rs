//! Per-user session: one optional upstream, any number of attached clients.
//!
//! The session mirrors upstream state into each downstream as it attaches,
//! replays the channel view (JOIN/TOPIC/NAMES) so a fresh client catches up,
//! and forwards commands between the two sides. The Proxy routes the
//! class-level connection events here through each connection's owner slot.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;
use tracing::{debug, info};

use crate::config::ConfigNode;
use crate::conn::{
    send_numeric, CommandArgs, ConnRef, ConnectionFactory, Endpoint,
};
use crate::event::Outcome;
use crate::state::new_channel_map;
use crate::timer::Timer;

const DISCONNECT_KICK_REASON: &str = "You were disconnected from the IRC server.";

/// One bouncer user: configuration, upstream link, attached clients.
pub struct ProxyUser {
    name: String,
    config: Rc<ConfigNode>,
    upstream_factory: Rc<ConnectionFactory>,
    upstream: RefCell<Option<ConnRef>>,
    downstreams: RefCell<Vec<ConnRef>>,
    last_reconnect: Cell<Option<DateTime<Utc>>>,
}

impl ProxyUser {
    pub fn new(
        name: &str,
        config: Rc<ConfigNode>,
        upstream_factory: Rc<ConnectionFactory>,
    ) -> Rc<ProxyUser> {
        let last_reconnect = config
            .get_i64("last_reconnect")
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single());

        Rc::new(ProxyUser {
            name: name.to_owned(),
            config,
            upstream_factory,
            upstream: RefCell::new(None),
            downstreams: RefCell::new(Vec::new()),
            last_reconnect: Cell::new(last_reconnect),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &Rc<ConfigNode> {
        &self.config
    }

    pub fn upstream(&self) -> Option<ConnRef> {
        self.upstream.borrow().clone()
    }

    pub fn downstreams(&self) -> Vec<ConnRef> {
        self.downstreams.borrow().clone()
    }

    pub fn last_reconnect(&self) -> Option<DateTime<Utc>> {
        self.last_reconnect.get()
    }

    pub fn server_address(&self) -> Option<(String, u16)> {
        self.config.get_addr("server_address")
    }

    /// Plaintext comparison against the stored password attribute. An unset
    /// or empty password never matches.
    pub fn check_password(&self, password: &str) -> bool {
        match self.config.get_str("password") {
            Some(stored) => !stored.is_empty() && stored == password,
            None => false,
        }
    }

    /// Record a reconnect attempt.
    pub fn stamp_reconnect(&self, now: DateTime<Utc>) {
        self.last_reconnect.set(Some(now));
        self.config.set("last_reconnect", json!(now.timestamp()));
    }

    /// Take ownership of an upstream connection (does not start it).
    pub fn adopt_upstream(self: &Rc<Self>, conn: &ConnRef) {
        conn.set_owner(self);
        *self.upstream.borrow_mut() = Some(conn.clone());
    }

    /// Open a fresh upstream connection from config. Returns `false` when no
    /// `server_address` is configured (silent skip) or creation was vetoed.
    pub fn reconnect_to_irc(self: &Rc<Self>) -> bool {
        let Some((host, port)) = self.server_address() else {
            return false;
        };

        if let Some(existing) = self.upstream.borrow_mut().take() {
            existing.close(Some("Reconnecting."));
        }

        let Some(conn) = self
            .upstream_factory
            .create(None, Endpoint::Outgoing(host, port))
        else {
            return false;
        };

        {
            let mut reg = conn.reg();
            reg.nickname = Some(
                self.config
                    .get_str("nick")
                    .unwrap_or_else(|| self.name.clone()),
            );
            reg.username = Some(
                self.config
                    .get_str("username")
                    .unwrap_or_else(|| self.name.clone()),
            );
            reg.realname = Some(
                self.config
                    .get_str("realname")
                    .unwrap_or_else(|| "slircb user".to_owned()),
            );
            reg.password = self.config.get_str("server_password");
        }

        self.adopt_upstream(&conn);
        self.stamp_reconnect(Utc::now());

        info!(user = %self.name, peer = %conn.peer(), "reconnecting to irc");
        conn.start();
        true
    }

    /// Downstream registration pre-observer: adopt the client, line up its
    /// nick with the upstream, and mirror the upstream's state handles.
    pub fn attach(self: &Rc<Self>, client: &ConnRef) {
        self.downstreams.borrow_mut().push(client.clone());
        info!(user = %self.name, peer = %client.peer(), "client attached");

        let Some(upstream) = self.upstream() else {
            return;
        };

        if upstream.is_registered() {
            let up_nick = upstream.me().borrow().nick.clone();
            let down_nick = client.me().borrow().nick.clone();

            if let Some(up_nick) = up_nick {
                if down_nick.as_deref() != Some(up_nick.as_str()) {
                    let old_mask = client.me().borrow().to_string();
                    client.send_message("NICK", &[&up_nick], Some(&old_mask));
                    client.me().borrow_mut().nick = Some(up_nick.clone());

                    upstream.send_message("NICK", &[&up_nick], None);
                }
            }
        }

        client.set_motd(upstream.motd());
        client.set_isupport(upstream.isupport());
        client.set_channels(upstream.channels());
        client.set_nicks(upstream.nicks());
    }

    /// Downstream registration post-observer: defer the channel replay past
    /// the welcome burst the registration path is still emitting.
    pub fn schedule_replay(self: &Rc<Self>, client: &ConnRef) {
        let session = self.clone();
        let client = client.clone();
        Timer::once(Duration::ZERO, move || session.replay(&client));
    }

    /// Synthesize JOIN/TOPIC/NAMES for every channel the upstream holds, so
    /// the freshly attached client sees the bouncer's channel view.
    fn replay(&self, client: &ConnRef) {
        let Some(upstream) = self.upstream() else {
            return;
        };

        let up_mask = upstream.me().borrow().to_string();

        for channel in upstream.channel_names() {
            client.send_message("JOIN", &[&channel], Some(&up_mask));
            client.process_line(&format!("TOPIC {}", channel));
            client.process_line(&format!("NAMES {}", channel));
        }

        if upstream.me().borrow().away {
            send_numeric(client, 306, &[], "You have been marked as being away");
        }
    }

    /// Upstream registration observer: force attached clients onto the nick
    /// the server accepted.
    pub fn on_irc_registered(&self, upstream: &ConnRef) {
        let Some(up_nick) = upstream.me().borrow().nick.clone() else {
            return;
        };

        for client in self.downstreams.borrow().iter() {
            let down_nick = client.me().borrow().nick.clone();
            if down_nick.as_deref() == Some(up_nick.as_str()) {
                continue;
            }

            let old_mask = client.me().borrow().to_string();
            client.send_message("NICK", &[&up_nick], Some(&old_mask));
            client.me().borrow_mut().nick = Some(up_nick.clone());
        }
    }

    /// Downstream `connection_closed`: drop the client from the session.
    pub fn detach(&self, client: &ConnRef) {
        self.downstreams
            .borrow_mut()
            .retain(|c| !Rc::ptr_eq(c, client));
        info!(user = %self.name, peer = %client.peer(), "client detached");
    }

    /// Client → upstream forwarding (handler phase, appended last so plugins
    /// get first crack).
    pub fn forward_client_command(&self, args: &CommandArgs) -> Outcome {
        if !args.conn.is_registered() {
            return Outcome::CONTINUE;
        }

        if matches!(args.command.as_str(), "PASS" | "USER" | "QUIT") {
            return Outcome::CONTINUE;
        }

        let Some(upstream) = self.upstream() else {
            return Outcome::CONTINUE;
        };

        if !upstream.is_registered() && args.command != "NICK" {
            return Outcome::CONTINUE;
        }

        let prefix = args.nick.as_ref().map(|n| n.borrow().to_string());
        let params: Vec<&str> = args.params.iter().map(String::as_str).collect();
        upstream.send_message(&args.command, &params, prefix.as_deref());

        Outcome::HANDLED
    }

    /// Upstream → clients forwarding (handler phase, appended last).
    pub fn forward_irc_command(&self, args: &CommandArgs) -> Outcome {
        let Some(upstream) = self.upstream() else {
            return Outcome::CONTINUE;
        };
        if !Rc::ptr_eq(&upstream, &args.conn) {
            // late line from a replaced connection
            return Outcome::CONTINUE;
        }

        if !upstream.is_registered() || args.command == "ERROR" {
            return Outcome::CONTINUE;
        }

        let params: Vec<&str> = args.params.iter().map(String::as_str).collect();

        for client in self.downstreams.borrow().iter() {
            if !client.is_registered() {
                continue;
            }

            let prefix = args.nick.as_ref().map(|sender| {
                if Rc::ptr_eq(sender, &upstream.server()) {
                    client.server().borrow().to_string()
                } else {
                    sender.borrow().to_string()
                }
            });

            client.send_message(&args.command, &params, prefix.as_deref());
        }

        Outcome::HANDLED
    }

    /// Upstream `connection_closed`: kick every client out of its mirrored
    /// channels and drop the upstream.
    pub fn on_irc_closed(&self, conn: &ConnRef) {
        {
            let current = self.upstream.borrow();
            match current.as_ref() {
                Some(upstream) if Rc::ptr_eq(upstream, conn) => {}
                _ => return,
            }
        }

        debug!(user = %self.name, "upstream connection lost");

        for client in self.downstreams.borrow().iter() {
            let me_nick = client
                .me()
                .borrow()
                .nick
                .clone()
                .unwrap_or_else(|| "*".to_owned());
            let server_name = client.server().borrow().to_string();

            for channel in client.channel_names() {
                client.send_message(
                    "KICK",
                    &[&channel, &me_nick, DISCONNECT_KICK_REASON],
                    Some(&server_name),
                );
            }

            client.set_channels(new_channel_map());
        }

        *self.upstream.borrow_mut() = None;
    }

    /// Close both sides of the session.
    pub fn shutdown(&self, message: &str) {
        if let Some(upstream) = self.upstream.borrow_mut().take() {
            upstream.close(Some(message));
        }
        for client in self.downstreams.borrow().iter() {
            client.close(Some(message));
        }
    }
}
