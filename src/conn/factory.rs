//! Typed connection factories.
//!
//! A factory owns the class-level event set for its connection kind and
//! registers the side's built-in handlers once. `create` runs the
//! `new_connection` event; a handler that claims it vetoes the connection.

use std::cell::Cell;
use std::rc::Rc;

use tokio::net::TcpStream;
use tracing::debug;

use super::{downstream, upstream, Conn, ConnArgs, ConnEvents, ConnKind, ConnRef, Endpoint};

thread_local! {
    static NEXT_FACTORY_ID: Cell<u64> = const { Cell::new(1) };
}

pub struct ConnectionFactory {
    id: u64,
    kind: ConnKind,
    pub events: Rc<ConnEvents>,
}

impl ConnectionFactory {
    pub fn new(kind: ConnKind) -> Rc<ConnectionFactory> {
        let id = NEXT_FACTORY_ID.with(|next| {
            let id = next.get();
            next.set(id + 1);
            id
        });

        let events = ConnEvents::new(kind);

        match kind {
            ConnKind::Upstream => upstream::register_builtins(&events),
            ConnKind::Downstream => downstream::register_builtins(&events),
        }

        Rc::new(ConnectionFactory { id, kind, events })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> ConnKind {
        self.kind
    }

    /// Create a connection, firing `new_connection` scoped to this factory.
    /// Returns `None` when a handler vetoed it.
    pub fn create(&self, socket: Option<TcpStream>, endpoint: Endpoint) -> Option<ConnRef> {
        let conn = Conn::new(self.kind, self.id, self.events.clone(), endpoint, socket);

        let vetoed = self
            .events
            .new_connection
            .dispatch(&ConnArgs { conn: conn.clone() });

        if vetoed {
            debug!(peer = %conn.peer(), "connection vetoed");
            conn.close(None);
            return None;
        }

        Some(conn)
    }
}
