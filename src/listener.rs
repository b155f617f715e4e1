//! TCP listener handing accepted clients to the downstream factory.

use std::rc::Rc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::conn::{ConnectionFactory, Endpoint};

/// Accept loop: every socket becomes a downstream connection.
pub async fn run(listener: TcpListener, factory: Rc<ConnectionFactory>) {
    loop {
        match listener.accept().await {
            Ok((socket, addr)) => {
                info!(peer = %addr, "client connection accepted");
                if let Some(conn) = factory.create(Some(socket), Endpoint::Incoming(addr)) {
                    conn.start();
                }
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}
