//! Connection core shared by both sides of the bouncer.
//!
//! A [`Conn`] is a line-oriented duplex channel plus the IRC state machine
//! bolted onto it: nick/channel tracking, registration, and command dispatch
//! into the event bus. The upstream and downstream roles differ only in
//! their built-in handlers ([`upstream`], [`downstream`]) and greeting.
//!
//! Each started connection owns two tasks: the read loop (parse a line,
//! dispatch, repeat) and the outbound writer draining a FIFO queue. Closing
//! pushes a sentinel through the queue so the writer shuts the socket down,
//! and `connection_closed` fires exactly once after the read loop exits.

pub mod downstream;
pub mod factory;
mod replies;
pub mod upstream;

pub use factory::ConnectionFactory;
pub use replies::{send_numeric, send_reply, Reply};

use std::cell::{Cell, RefCell};
use std::fmt;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use slircb_proto::{Hostmask, Isupport, LineCodec, Message};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio::task::spawn_local;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, trace, warn};

use crate::event::Event;
use crate::session::ProxyUser;
use crate::state::{new_channel_map, ChannelMap, Nick, NickRef, NickTable};
use crate::timer::{Timer, TimerHandle};

/// Time a connection gets to complete registration before it is dropped.
const UPSTREAM_REGISTRATION_TIMEOUT: Duration = Duration::from_secs(30);
const DOWNSTREAM_REGISTRATION_TIMEOUT: Duration = Duration::from_secs(60);

const REGISTRATION_TIMEOUT_MESSAGE: &str = "Registration timeout detected.";

/// Which side of the bouncer a connection belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnKind {
    /// The bouncer acting as a client towards a real IRC network.
    Upstream,
    /// A user's IRC client attached to the bouncer.
    Downstream,
}

/// Where a connection's socket comes from.
pub enum Endpoint {
    /// Accepted by the listener.
    Incoming(SocketAddr),
    /// To be established by the connection task.
    Outgoing(String, u16),
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Incoming(addr) => write!(f, "{}", addr),
            Endpoint::Outgoing(host, port) => write!(f, "{}:{}", host, port),
        }
    }
}

/// Arguments carried by `command_received`.
pub struct CommandArgs {
    pub conn: ConnRef,
    /// The resolved prefix nick, when the line carried a prefix.
    pub nick: Option<NickRef>,
    /// Uppercased command or numeric.
    pub command: String,
    pub params: Vec<String>,
}

/// Arguments carried by connection-scoped events.
pub struct ConnArgs {
    pub conn: ConnRef,
}

/// Arguments carried by the downstream `authentication` event.
pub struct AuthArgs {
    pub conn: ConnRef,
    pub username: String,
    pub password: String,
}

/// Class-level events shared by every connection created by one factory.
pub struct ConnEvents {
    pub new_connection: Rc<Event<ConnArgs>>,
    pub command_received: Rc<Event<CommandArgs>>,
    pub connection_closed: Rc<Event<ConnArgs>>,
    pub registration: Rc<Event<ConnArgs>>,
    /// Only dispatched by downstream connections.
    pub authentication: Rc<Event<AuthArgs>>,
}

impl ConnEvents {
    fn new(kind: ConnKind) -> Rc<ConnEvents> {
        let events = match kind {
            ConnKind::Upstream => ConnEvents {
                new_connection: Event::new("upstream.new_connection"),
                command_received: Event::new("upstream.command_received"),
                connection_closed: Event::new("upstream.connection_closed"),
                registration: Event::new("upstream.registration"),
                authentication: Event::new("upstream.authentication"),
            },
            ConnKind::Downstream => ConnEvents {
                new_connection: Event::new("downstream.new_connection"),
                command_received: Event::new("downstream.command_received"),
                connection_closed: Event::new("downstream.connection_closed"),
                registration: Event::new("downstream.registration"),
                authentication: Event::new("downstream.authentication"),
            },
        };
        Rc::new(events)
    }
}

/// Registration identity an upstream connection introduces itself with.
#[derive(Default)]
pub struct RegInfo {
    pub nickname: Option<String>,
    pub username: Option<String>,
    pub realname: Option<String>,
    pub password: Option<String>,
}

enum WriterCmd {
    Line(String),
    Shutdown,
}

pub type ConnRef = Rc<Conn>;

/// A single IRC connection, either side.
pub struct Conn {
    kind: ConnKind,
    factory_id: u64,
    endpoint: Endpoint,
    events: Rc<ConnEvents>,

    me: NickRef,
    server: RefCell<NickRef>,
    registered: Cell<bool>,

    isupport: RefCell<Rc<RefCell<Isupport>>>,
    motd: RefCell<Rc<RefCell<Vec<String>>>>,
    channels: RefCell<ChannelMap>,
    nicks: RefCell<Rc<NickTable>>,

    owner: RefCell<Weak<ProxyUser>>,

    /// Upstream registration identity.
    reg: RefCell<RegInfo>,
    /// Downstream PASS argument, held until authentication.
    client_password: RefCell<Option<String>>,

    socket: RefCell<Option<TcpStream>>,
    out_tx: mpsc::UnboundedSender<WriterCmd>,
    out_rx: RefCell<Option<mpsc::UnboundedReceiver<WriterCmd>>>,

    closed: Cell<bool>,
    closed_fired: Cell<bool>,
    close_notify: Notify,
    registration_timer: RefCell<Option<TimerHandle>>,
}

impl Conn {
    fn new(
        kind: ConnKind,
        factory_id: u64,
        events: Rc<ConnEvents>,
        endpoint: Endpoint,
        socket: Option<TcpStream>,
    ) -> ConnRef {
        let (out_tx, out_rx) = mpsc::unbounded_channel();

        let me = Nick::empty();
        let server = Nick::empty();

        match (&kind, &endpoint) {
            (ConnKind::Downstream, Endpoint::Incoming(addr)) => {
                me.borrow_mut().host = Some(addr.ip().to_string());
                server.borrow_mut().nick = Some(downstream::SERVER_NAME.to_owned());
            }
            _ => {}
        }

        Rc::new(Conn {
            kind,
            factory_id,
            endpoint,
            events,
            me,
            server: RefCell::new(server),
            registered: Cell::new(false),
            isupport: RefCell::new(Rc::new(RefCell::new(Isupport::default()))),
            motd: RefCell::new(Rc::new(RefCell::new(Vec::new()))),
            channels: RefCell::new(new_channel_map()),
            nicks: RefCell::new(NickTable::new()),
            owner: RefCell::new(Weak::new()),
            reg: RefCell::new(RegInfo::default()),
            client_password: RefCell::new(None),
            socket: RefCell::new(socket),
            out_tx,
            out_rx: RefCell::new(Some(out_rx)),
            closed: Cell::new(false),
            closed_fired: Cell::new(false),
            close_notify: Notify::new(),
            registration_timer: RefCell::new(None),
        })
    }

    pub fn kind(&self) -> ConnKind {
        self.kind
    }

    pub fn factory_id(&self) -> u64 {
        self.factory_id
    }

    pub fn peer(&self) -> String {
        self.endpoint.to_string()
    }

    /// The remote IP for incoming connections.
    pub fn peer_ip(&self) -> Option<std::net::IpAddr> {
        match self.endpoint {
            Endpoint::Incoming(addr) => Some(addr.ip()),
            Endpoint::Outgoing(..) => None,
        }
    }

    pub fn events(&self) -> &Rc<ConnEvents> {
        &self.events
    }

    pub fn me(&self) -> NickRef {
        self.me.clone()
    }

    pub fn server(&self) -> NickRef {
        self.server.borrow().clone()
    }

    pub fn set_server(&self, nick: NickRef) {
        *self.server.borrow_mut() = nick;
    }

    pub fn is_registered(&self) -> bool {
        self.registered.get()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }

    pub fn isupport(&self) -> Rc<RefCell<Isupport>> {
        self.isupport.borrow().clone()
    }

    pub fn set_isupport(&self, isupport: Rc<RefCell<Isupport>>) {
        *self.isupport.borrow_mut() = isupport;
    }

    pub fn motd(&self) -> Rc<RefCell<Vec<String>>> {
        self.motd.borrow().clone()
    }

    pub fn set_motd(&self, motd: Rc<RefCell<Vec<String>>>) {
        *self.motd.borrow_mut() = motd;
    }

    pub fn channels(&self) -> ChannelMap {
        self.channels.borrow().clone()
    }

    pub fn set_channels(&self, channels: ChannelMap) {
        *self.channels.borrow_mut() = channels;
    }

    /// Channel names, sorted for deterministic iteration.
    pub fn channel_names(&self) -> Vec<String> {
        let channels = self.channels();
        let mut names: Vec<String> = channels.borrow().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn nicks(&self) -> Rc<NickTable> {
        self.nicks.borrow().clone()
    }

    pub fn set_nicks(&self, nicks: Rc<NickTable>) {
        *self.nicks.borrow_mut() = nicks;
    }

    pub fn owner(&self) -> Option<Rc<ProxyUser>> {
        self.owner.borrow().upgrade()
    }

    pub fn set_owner(&self, owner: &Rc<ProxyUser>) {
        *self.owner.borrow_mut() = Rc::downgrade(owner);
    }

    pub fn reg(&self) -> std::cell::RefMut<'_, RegInfo> {
        self.reg.borrow_mut()
    }

    pub(crate) fn client_password(&self) -> Option<String> {
        self.client_password.borrow().clone()
    }

    pub(crate) fn set_client_password(&self, password: &str) {
        *self.client_password.borrow_mut() = Some(password.to_owned());
    }

    pub(crate) fn clear_client_password(&self) {
        *self.client_password.borrow_mut() = None;
    }

    /// Resolve a hostmask to a nick object.
    ///
    /// `me` and `server` are matched by nickname; anything else is interned
    /// in the weak nick table. Every call upgrades cached user/host fields
    /// from the hostmask.
    pub fn get_nick(&self, hostmask: &str) -> NickRef {
        let parsed = Hostmask::parse(hostmask);

        let nickobj = if self
            .me
            .borrow()
            .nick
            .as_deref()
            .is_some_and(|n| n == parsed.nick)
        {
            self.me.clone()
        } else if self
            .server
            .borrow()
            .borrow()
            .nick
            .as_deref()
            .is_some_and(|n| n == parsed.nick)
        {
            self.server()
        } else {
            let table = self.nicks();
            match table.get(&parsed.nick) {
                Some(existing) => existing,
                None => {
                    let fresh = Nick::from_hostmask(&parsed);
                    table.insert(&parsed.nick, &fresh);
                    fresh
                }
            }
        };

        nickobj.borrow_mut().update_hostmask(&parsed);
        nickobj
    }

    /// Enqueue a raw line for the outbound writer. Never blocks.
    pub fn send_line(&self, line: &str) {
        if self.closed.get() {
            return;
        }
        trace!(peer = %self.peer(), line, "send");
        let _ = self.out_tx.send(WriterCmd::Line(line.to_owned()));
    }

    /// Format and enqueue a message.
    pub fn send_message(&self, command: &str, params: &[&str], prefix: Option<&str>) {
        let msg = Message::new(prefix, command, params.iter().copied());
        self.send_line(&msg.to_string());
    }

    /// Parse one inbound line and run it through the event bus.
    pub fn process_line(self: &Rc<Self>, line: &str) {
        let Ok(msg) = Message::parse(line) else {
            return;
        };

        let nickobj = msg.prefix.as_deref().map(|p| self.get_nick(p));
        let command = msg.command.to_uppercase();

        trace!(peer = %self.peer(), line, "recv");

        let args = CommandArgs {
            conn: self.clone(),
            nick: nickobj.clone(),
            command: command.clone(),
            params: msg.params,
        };

        if !self.events.command_received.dispatch(&args) {
            self.handle_unknown_command(nickobj, &command, &args.params);
        }
    }

    fn handle_unknown_command(&self, _nick: Option<NickRef>, command: &str, _params: &[String]) {
        match self.kind {
            ConnKind::Upstream => {
                debug!(peer = %self.peer(), command, "unhandled upstream command");
            }
            ConnKind::Downstream => {
                replies::send_reply(self, Reply::ErrUnknownCommand, &[command], None);
            }
        }
    }

    /// Mark the connection registered: cancel the registration timer and
    /// fire the `registration` event. Idempotent.
    pub fn complete_registration(self: &Rc<Self>) {
        if self.registered.get() {
            return;
        }
        self.registered.set(true);
        self.cancel_registration_timer();

        self.events.registration.dispatch(&ConnArgs { conn: self.clone() });
    }

    fn start_registration_timer(self: &Rc<Self>) {
        let timeout = match self.kind {
            ConnKind::Upstream => UPSTREAM_REGISTRATION_TIMEOUT,
            ConnKind::Downstream => DOWNSTREAM_REGISTRATION_TIMEOUT,
        };

        let conn = Rc::downgrade(self);
        let handle = Timer::once(timeout, move || {
            if let Some(conn) = conn.upgrade() {
                warn!(peer = %conn.peer(), "registration timeout");
                conn.close(Some(REGISTRATION_TIMEOUT_MESSAGE));
            }
        });

        *self.registration_timer.borrow_mut() = Some(handle);
    }

    fn cancel_registration_timer(&self) {
        if let Some(handle) = self.registration_timer.borrow_mut().take() {
            handle.cancel();
        }
    }

    /// Close the connection, sending the side's farewell first (QUIT for
    /// upstream, ERROR for downstream) when a message is given. Idempotent;
    /// the read loop observes the shutdown and `connection_closed` follows.
    pub fn close(&self, message: Option<&str>) {
        if self.closed.get() {
            return;
        }

        if let Some(message) = message {
            match self.kind {
                ConnKind::Upstream => self.send_message("QUIT", &[message], None),
                ConnKind::Downstream => self.send_message("ERROR", &[message], None),
            }
        }

        self.closed.set(true);
        self.cancel_registration_timer();
        let _ = self.out_tx.send(WriterCmd::Shutdown);
        self.close_notify.notify_one();
    }

    /// Spawn the connection task: connect if needed, run the read loop, and
    /// guarantee `connection_closed` fires exactly once afterwards.
    pub fn start(self: &Rc<Self>) {
        let conn = self.clone();
        spawn_local(async move {
            if let Err(e) = run_io(&conn).await {
                debug!(peer = %conn.peer(), error = %e, "connection i/o ended");
            }
            conn.finish_close();
        });
    }

    fn finish_close(self: &Rc<Self>) {
        if !self.closed.get() {
            self.closed.set(true);
            self.cancel_registration_timer();
        }
        let _ = self.out_tx.send(WriterCmd::Shutdown);

        if !self.closed_fired.get() {
            self.closed_fired.set(true);
            info!(peer = %self.peer(), kind = ?self.kind, "connection closed");
            self.events
                .connection_closed
                .dispatch(&ConnArgs { conn: self.clone() });
        }
    }

    /// Take the outbound queue receiver (the writer task does this once).
    fn take_out_rx(&self) -> Option<mpsc::UnboundedReceiver<WriterCmd>> {
        self.out_rx.borrow_mut().take()
    }

    /// Drain enqueued outbound lines without a writer task. Test hook.
    #[cfg(test)]
    pub(crate) fn drain_outbound(&self) -> Vec<String> {
        let mut lines = Vec::new();
        let mut rx = self.out_rx.borrow_mut();
        if let Some(rx) = rx.as_mut() {
            while let Ok(cmd) = rx.try_recv() {
                if let WriterCmd::Line(line) = cmd {
                    lines.push(line);
                }
            }
        }
        lines
    }
}

async fn run_io(conn: &ConnRef) -> std::io::Result<()> {
    let stream = match conn.socket.borrow_mut().take() {
        Some(stream) => stream,
        None => match &conn.endpoint {
            Endpoint::Outgoing(host, port) => {
                info!(peer = %conn.peer(), "connecting");
                TcpStream::connect((host.as_str(), *port)).await?
            }
            Endpoint::Incoming(_) => {
                return Err(std::io::Error::other("incoming connection without socket"));
            }
        },
    };

    let (read_half, write_half) = stream.into_split();

    if let Some(rx) = conn.take_out_rx() {
        spawn_local(writer_task(write_half, rx));
    }

    match conn.kind {
        ConnKind::Upstream => upstream::on_connection_made(conn),
        ConnKind::Downstream => downstream::on_connection_made(conn).await,
    }

    let mut lines = FramedRead::new(read_half, LineCodec::new());

    loop {
        if conn.is_closed() {
            break;
        }

        tokio::select! {
            _ = conn.close_notify.notified() => break,
            item = lines.next() => match item {
                Some(Ok(line)) => {
                    if !line.is_empty() {
                        conn.process_line(&line);
                    }
                }
                Some(Err(e)) => {
                    warn!(peer = %conn.peer(), error = %e, "read error");
                    break;
                }
                None => break,
            },
        }
    }

    Ok(())
}

async fn writer_task(
    write_half: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<WriterCmd>,
) {
    let mut sink = FramedWrite::new(write_half, LineCodec::new());

    while let Some(cmd) = rx.recv().await {
        match cmd {
            WriterCmd::Line(line) => {
                if sink.send(line).await.is_err() {
                    break;
                }
            }
            WriterCmd::Shutdown => break,
        }
    }

    let _ = sink.get_mut().shutdown().await;
}
