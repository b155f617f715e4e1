//! Nicks and the weakly-held per-connection nick index.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};

use chrono::{DateTime, Utc};
use slircb_proto::Hostmask;

/// Shared handle to a [`Nick`]. Strong references live in channel
/// memberships and `me`/`server` slots; the index holds only weak ones.
pub type NickRef = Rc<RefCell<Nick>>;

/// A user visible on a connection.
///
/// Identity is the `(nick, user, host)` triple; two `Nick`s with the same
/// triple refer to the same user even across connections.
pub struct Nick {
    pub nick: Option<String>,
    pub user: Option<String>,
    pub host: Option<String>,
    pub realname: Option<String>,
    pub away: bool,
    pub opered: bool,
    pub created: DateTime<Utc>,
}

impl Nick {
    pub fn empty() -> NickRef {
        Rc::new(RefCell::new(Nick {
            nick: None,
            user: None,
            host: None,
            realname: None,
            away: false,
            opered: false,
            created: Utc::now(),
        }))
    }

    pub fn from_hostmask(hostmask: &Hostmask) -> NickRef {
        let nick = Nick::empty();
        nick.borrow_mut().nick = Some(hostmask.nick.clone());
        nick.borrow_mut().user = hostmask.user.clone();
        nick.borrow_mut().host = hostmask.host.clone();
        nick
    }

    /// Upgrade cached user/host fields from a fuller hostmask.
    pub fn update_hostmask(&mut self, hostmask: &Hostmask) {
        if hostmask.user.is_some() && self.user != hostmask.user {
            self.user = hostmask.user.clone();
        }
        if hostmask.host.is_some() && self.host != hostmask.host {
            self.host = hostmask.host.clone();
        }
    }

    /// Equality by the `(nick, user, host)` triple.
    pub fn same_identity(&self, other: &Nick) -> bool {
        self.nick == other.nick && self.user == other.user && self.host == other.host
    }
}

impl fmt::Display for Nick {
    /// The hostmask form when user and host are known, the bare nick
    /// otherwise. An unset nick renders as `*`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let nick = self.nick.as_deref().unwrap_or("*");
        match (&self.user, &self.host) {
            (Some(user), Some(host)) => write!(f, "{}!{}@{}", nick, user, host),
            _ => f.write_str(nick),
        }
    }
}

/// Weakly-held index of nicks by nickname.
///
/// A nick stays alive for as long as some membership or handler frame holds
/// a strong reference; dead entries are evicted lazily on lookup and by
/// [`NickTable::prune`].
pub struct NickTable {
    index: RefCell<HashMap<String, Weak<RefCell<Nick>>>>,
}

impl NickTable {
    pub fn new() -> Rc<NickTable> {
        Rc::new(NickTable {
            index: RefCell::new(HashMap::new()),
        })
    }

    pub fn get(&self, nickname: &str) -> Option<NickRef> {
        let mut index = self.index.borrow_mut();
        match index.get(nickname) {
            Some(weak) => match weak.upgrade() {
                Some(strong) => Some(strong),
                None => {
                    index.remove(nickname);
                    None
                }
            },
            None => None,
        }
    }

    pub fn insert(&self, nickname: &str, nick: &NickRef) {
        self.index
            .borrow_mut()
            .insert(nickname.to_owned(), Rc::downgrade(nick));
    }

    pub fn remove(&self, nickname: &str) {
        self.index.borrow_mut().remove(nickname);
    }

    /// Re-key an entry after a nick change.
    pub fn rename(&self, old: &str, new: &str) {
        let mut index = self.index.borrow_mut();
        if let Some(weak) = index.remove(old) {
            index.insert(new.to_owned(), weak);
        }
    }

    /// Drop entries whose nick has been released.
    pub fn prune(&self) {
        self.index.borrow_mut().retain(|_, weak| weak.strong_count() > 0);
    }

    pub fn len(&self) -> usize {
        self.index.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.borrow().is_empty()
    }
}
