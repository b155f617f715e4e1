//! The global proxy: user table, both connection factories, high-level
//! events, authentication, and the reconnect policy.
//!
//! Plugins consume only the high-level events exposed here; each is bound to
//! the corresponding class-level factory event filtered by factory identity,
//! so the class-level layer stays an implementation detail.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::config::ConfigNode;
use crate::conn::{
    AuthArgs, CommandArgs, ConnArgs, ConnKind, ConnectionFactory,
};
use crate::event::{filter, listener, Event, Outcome, Phase};
use crate::session::ProxyUser;
use crate::timer::{Timer, TimerHandle};

/// Minimum spacing between any two reconnect attempts, bouncer-wide.
const GLOBAL_RECONNECT_SPACING_SECS: i64 = 60;
/// Minimum spacing between two reconnect attempts for the same user.
const USER_RECONNECT_SPACING_SECS: i64 = 120;
/// Cadence of the reconnect scan.
const RECONNECT_TICK: Duration = Duration::from_secs(10);

pub struct Proxy {
    config_root: Rc<ConfigNode>,
    pub upstream_factory: Rc<ConnectionFactory>,
    pub downstream_factory: Rc<ConnectionFactory>,
    users: RefCell<BTreeMap<String, Rc<ProxyUser>>>,
    last_global_reconnect: Cell<Option<DateTime<Utc>>>,

    /// High-level events for plugins, bound to the factory class events.
    pub client_registration: Rc<Event<ConnArgs>>,
    pub irc_registration: Rc<Event<ConnArgs>>,
    pub client_command_received: Rc<Event<CommandArgs>>,
    pub irc_command_received: Rc<Event<CommandArgs>>,
    pub client_connection_closed: Rc<Event<ConnArgs>>,
    pub irc_connection_closed: Rc<Event<ConnArgs>>,
}

impl Proxy {
    pub fn new(config_root: Rc<ConfigNode>) -> Rc<Proxy> {
        let upstream_factory = ConnectionFactory::new(ConnKind::Upstream);
        let downstream_factory = ConnectionFactory::new(ConnKind::Downstream);

        let proxy = Rc::new(Proxy {
            config_root,
            upstream_factory,
            downstream_factory,
            users: RefCell::new(BTreeMap::new()),
            last_global_reconnect: Cell::new(None),
            client_registration: Event::new("proxy.client_registration"),
            irc_registration: Event::new("proxy.irc_registration"),
            client_command_received: Event::new("proxy.client_command_received"),
            irc_command_received: Event::new("proxy.irc_command_received"),
            client_connection_closed: Event::new("proxy.client_connection_closed"),
            irc_connection_closed: Event::new("proxy.irc_connection_closed"),
        });

        proxy.bind_high_level_events();
        proxy.install_handlers();
        proxy.load_users();

        proxy
    }

    pub fn config_root(&self) -> &Rc<ConfigNode> {
        &self.config_root
    }

    pub fn user(&self, name: &str) -> Option<Rc<ProxyUser>> {
        self.users.borrow().get(name).cloned()
    }

    pub fn user_names(&self) -> Vec<String> {
        self.users.borrow().keys().cloned().collect()
    }

    /// Create a session (and its config subtree) for a new user.
    pub fn create_user(&self, name: &str) -> Rc<ProxyUser> {
        if let Some(existing) = self.user(name) {
            return existing;
        }

        let config = self.config_root.child("users").child(name);
        let session = ProxyUser::new(name, config, self.upstream_factory.clone());
        self.users
            .borrow_mut()
            .insert(name.to_owned(), session.clone());

        info!(user = %name, "user created");
        session
    }

    /// Drop a session: close both sides and remove its config subtree.
    pub fn remove_user(&self, name: &str) {
        let Some(session) = self.users.borrow_mut().remove(name) else {
            return;
        };

        session.shutdown("User removed.");
        self.config_root.child("users").remove_child(name);
        info!(user = %name, "user removed");
    }

    fn load_users(&self) {
        let users_node = self.config_root.child("users");
        for name in users_node.child_names() {
            let config = users_node.child(&name);
            let session = ProxyUser::new(&name, config, self.upstream_factory.clone());
            self.users.borrow_mut().insert(name, session);
        }

        let count = self.users.borrow().len();
        if count > 0 {
            info!(count, "users loaded");
        }
    }

    /// The next user the reconnect timer would pick at `now`: no upstream,
    /// outside the per-user spacing, and actually configured with a server.
    pub fn reconnect_candidate(&self, now: DateTime<Utc>) -> Option<Rc<ProxyUser>> {
        for session in self.users.borrow().values() {
            if session.upstream().is_some() {
                continue;
            }

            if session.last_reconnect().is_some_and(|last| {
                (now - last).num_seconds() < USER_RECONNECT_SPACING_SECS
            }) {
                continue;
            }

            if session.server_address().is_none() {
                continue;
            }

            return Some(session.clone());
        }

        None
    }

    /// One pass of the reconnect timer: honor the global spacing, then
    /// reconnect the first eligible user.
    pub fn reconnect_tick(&self, now: DateTime<Utc>) {
        if self.last_global_reconnect.get().is_some_and(|last| {
            (now - last).num_seconds() < GLOBAL_RECONNECT_SPACING_SECS
        }) {
            return;
        }

        let Some(session) = self.reconnect_candidate(now) else {
            return;
        };

        self.last_global_reconnect.set(Some(now));
        session.reconnect_to_irc();
    }

    /// Start the 10-second repeating reconnect scan.
    pub fn start_reconnect_timer(self: &Rc<Self>) -> TimerHandle {
        let proxy = Rc::downgrade(self);
        Timer::repeating(RECONNECT_TICK, move || match proxy.upgrade() {
            Some(proxy) => {
                proxy.reconnect_tick(Utc::now());
                true
            }
            None => false,
        })
    }

    fn bind_high_level_events(self: &Rc<Self>) {
        let up_id = self.upstream_factory.id();
        let down_id = self.downstream_factory.id();

        self.client_registration.bind(
            self.downstream_factory.events.registration.clone(),
            filter(move |a: &ConnArgs| a.conn.factory_id() == down_id),
        );
        self.client_command_received.bind(
            self.downstream_factory.events.command_received.clone(),
            filter(move |a: &CommandArgs| a.conn.factory_id() == down_id),
        );
        self.client_connection_closed.bind(
            self.downstream_factory.events.connection_closed.clone(),
            filter(move |a: &ConnArgs| a.conn.factory_id() == down_id),
        );

        self.irc_registration.bind(
            self.upstream_factory.events.registration.clone(),
            filter(move |a: &ConnArgs| a.conn.factory_id() == up_id),
        );
        self.irc_command_received.bind(
            self.upstream_factory.events.command_received.clone(),
            filter(move |a: &CommandArgs| a.conn.factory_id() == up_id),
        );
        self.irc_connection_closed.bind(
            self.upstream_factory.events.connection_closed.clone(),
            filter(move |a: &ConnArgs| a.conn.factory_id() == up_id),
        );
    }

    fn install_handlers(self: &Rc<Self>) {
        let down = &self.downstream_factory.events;
        let up = &self.upstream_factory.events;

        // Authentication: gate ownership on the user table.
        {
            let proxy = Rc::downgrade(self);
            let down_id = self.downstream_factory.id();
            down.authentication.add_listener(
                listener(move |args: &AuthArgs| {
                    let Some(proxy) = proxy.upgrade() else {
                        return Outcome::CONTINUE;
                    };
                    let Some(session) = proxy.user(&args.username) else {
                        return Outcome::CONTINUE;
                    };
                    if !session.check_password(&args.password) {
                        return Outcome::CONTINUE;
                    }

                    args.conn.set_owner(&session);
                    Outcome::HANDLED
                }),
                Phase::Handler,
                Some(filter(move |a: &AuthArgs| a.conn.factory_id() == down_id)),
                false,
            );
        }

        // Session routing: everything below resolves through the owner the
        // authentication handler installed.
        down.registration.add_listener(
            listener(|args: &ConnArgs| {
                if let Some(session) = args.conn.owner() {
                    session.attach(&args.conn);
                }
                Outcome::CONTINUE
            }),
            Phase::PreObserver,
            None,
            true,
        );

        down.registration.add_listener(
            listener(|args: &ConnArgs| {
                if let Some(session) = args.conn.owner() {
                    session.schedule_replay(&args.conn);
                }
                Outcome::CONTINUE
            }),
            Phase::PostObserver,
            None,
            true,
        );

        down.connection_closed.add_listener(
            listener(|args: &ConnArgs| {
                if let Some(session) = args.conn.owner() {
                    session.detach(&args.conn);
                }
                Outcome::CONTINUE
            }),
            Phase::PreObserver,
            None,
            true,
        );

        down.command_received.add_listener(
            listener(|args: &CommandArgs| match args.conn.owner() {
                Some(session) => session.forward_client_command(args),
                None => Outcome::CONTINUE,
            }),
            Phase::Handler,
            None,
            true, // plugins get first crack
        );

        up.command_received.add_listener(
            listener(|args: &CommandArgs| match args.conn.owner() {
                Some(session) => session.forward_irc_command(args),
                None => Outcome::CONTINUE,
            }),
            Phase::Handler,
            None,
            true,
        );

        up.registration.add_listener(
            listener(|args: &ConnArgs| {
                if let Some(session) = args.conn.owner() {
                    session.on_irc_registered(&args.conn);
                }
                Outcome::CONTINUE
            }),
            Phase::PostObserver,
            None,
            true,
        );

        up.connection_closed.add_listener(
            listener(|args: &ConnArgs| {
                if let Some(session) = args.conn.owner() {
                    session.on_irc_closed(&args.conn);
                }
                Outcome::CONTINUE
            }),
            Phase::PreObserver,
            None,
            true,
        );
    }
}
