//! Marks the user away on the network while no client is attached.
//!
//! When a client registers, any server-side AWAY is cleared; when the last
//! client detaches and the user's `away` config attribute is non-empty, that
//! message is set as the away reason.

use std::rc::Rc;

use crate::conn::ConnArgs;
use crate::event::{listener, Outcome, Phase};
use crate::plugins::Plugin;
use crate::proxy::Proxy;

pub struct AwayPlugin;

impl AwayPlugin {
    pub fn load(proxy: &Rc<Proxy>) -> Rc<AwayPlugin> {
        proxy.client_registration.add_listener(
            listener(|args: &ConnArgs| {
                if let Some(session) = args.conn.owner() {
                    if let Some(upstream) = session.upstream() {
                        if upstream.is_registered() {
                            upstream.send_message("AWAY", &[], None);
                        }
                    }
                }
                Outcome::CONTINUE
            }),
            Phase::PostObserver,
            None,
            true,
        );

        // The session detaches the client in a pre-observer, so by now the
        // downstream list reflects the departure.
        proxy.client_connection_closed.add_listener(
            listener(|args: &ConnArgs| {
                let Some(session) = args.conn.owner() else {
                    return Outcome::CONTINUE;
                };
                let Some(upstream) = session.upstream() else {
                    return Outcome::CONTINUE;
                };
                if !upstream.is_registered() {
                    return Outcome::CONTINUE;
                }

                let Some(message) = session.config().get_str("away") else {
                    return Outcome::CONTINUE;
                };
                if message.is_empty() {
                    return Outcome::CONTINUE;
                }

                if session.downstreams().is_empty() {
                    upstream.send_message("AWAY", &[&message], None);
                }
                Outcome::CONTINUE
            }),
            Phase::PostObserver,
            None,
            true,
        );

        Rc::new(AwayPlugin)
    }
}

impl Plugin for AwayPlugin {
    fn name(&self) -> &'static str {
        "away"
    }

    fn description(&self) -> &'static str {
        "Marks the user away while no client is attached."
    }
}
