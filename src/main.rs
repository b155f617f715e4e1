//! slircb - Straylight IRC Bouncer.
//!
//! A persistent IRC proxy: it keeps one connection per user to the real
//! network and lets that user's clients attach and detach at will, replaying
//! channel state on every attach.
//!
//! The whole engine runs as cooperative tasks on a single-threaded runtime;
//! shared state is `Rc`/`RefCell` and invariants only need to hold across
//! `.await` points.

mod config;
mod conn;
mod event;
mod listener;
mod plugins;
mod proxy;
mod session;
mod state;
mod timer;

use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::config::ConfigStore;
use crate::proxy::Proxy;
use crate::timer::Timer;

/// How often dirty config state is flushed to disk.
const CONFIG_WRITEBACK_INTERVAL: Duration = Duration::from_secs(30);

/// The only CLI surface the bouncer has: where its config tree lives.
/// `-c <path>`, `--config <path>`, or a bare path; `slircb.json` otherwise.
fn config_path_from_args() -> PathBuf {
    let mut path = PathBuf::from("slircb.json");
    let mut args = std::env::args_os().skip(1);

    while let Some(arg) = args.next() {
        if arg == "-c" || arg == "--config" {
            match args.next() {
                Some(value) => path = PathBuf::from(value),
                None => {
                    eprintln!("usage: slircb [-c <config.json>]");
                    std::process::exit(2);
                }
            }
        } else {
            path = PathBuf::from(arg);
        }
    }

    path
}

fn main() -> anyhow::Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .init();

    // Single-threaded cooperative scheduler: every connection and timer is a
    // local task, core state is unsynchronized Rc/RefCell.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let local = tokio::task::LocalSet::new();
    runtime.block_on(local.run_until(run()))
}

async fn run() -> anyhow::Result<()> {
    let config_path = config_path_from_args();
    let store = Rc::new(ConfigStore::open(&config_path)?);
    let root = store.root();

    let proxy = Proxy::new(root.clone());

    for plugin in plugins::load_builtin(&proxy) {
        info!(plugin = plugin.name(), "plugin loaded");
    }

    let addr_value = root.get_or("listener_address", json!(["0.0.0.0", 9000]));
    let (host, port) = root
        .get_addr("listener_address")
        .unwrap_or_else(|| ("0.0.0.0".to_owned(), 9000));
    if root.get_addr("listener_address").is_none() {
        warn!(value = %addr_value, "malformed listener_address, using default");
    }

    let tcp = TcpListener::bind((host.as_str(), port)).await?;
    info!(%host, port, users = proxy.user_names().len(), "slircb listening");

    // Reconnect policy: scan every 10 s, plus one immediate pass so
    // configured users come up right after start.
    let _reconnect_timer = proxy.start_reconnect_timer();
    proxy.reconnect_tick(Utc::now());

    {
        let store = store.clone();
        Timer::repeating(CONFIG_WRITEBACK_INTERVAL, move || {
            if let Err(e) = store.save_if_dirty() {
                warn!(error = %e, "config writeback failed");
            }
            true
        });
    }

    // The accept loop never returns; a signal is the only way out, and it
    // must still flush the config below.
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        _ = listener::run(tcp, proxy.downstream_factory.clone()) => {}
        _ = tokio::signal::ctrl_c() => info!("interrupted, saving state"),
        _ = sigterm.recv() => info!("terminated, saving state"),
    }

    store.save_if_dirty()?;
    Ok(())
}
