//! Connection-scoped IRC state: nicks, channels, memberships.

mod channel;
mod nick;

pub use channel::{Channel, ChannelMembership};
pub use nick::{Nick, NickRef, NickTable};

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// The channel table a connection holds, keyed by channel name.
///
/// Shared by handle: a freshly attached downstream mirrors its upstream's
/// table by cloning the `Rc`, so later upstream updates are visible to both.
pub type ChannelMap = Rc<RefCell<HashMap<String, Channel>>>;

pub fn new_channel_map() -> ChannelMap {
    Rc::new(RefCell::new(HashMap::new()))
}
