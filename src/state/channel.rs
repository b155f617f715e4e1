//! Channels and channel memberships.

use chrono::{DateTime, Utc};

use super::nick::NickRef;

/// One nick's presence in one channel.
pub struct ChannelMembership {
    /// The channel this membership belongs to, by name.
    pub channel: String,
    pub nick: NickRef,
    /// Concatenated membership mode letters (`o`, `v`, ...), derived from
    /// the ISUPPORT PREFIX map.
    pub modes: String,
    pub join_time: DateTime<Utc>,
    pub idle_since: DateTime<Utc>,
}

impl ChannelMembership {
    pub fn has_mode(&self, mode: char) -> bool {
        self.modes.contains(mode)
    }

    pub fn is_opped(&self) -> bool {
        self.has_mode('o')
    }

    pub fn is_voiced(&self) -> bool {
        self.has_mode('v')
    }

    /// The member's current nickname.
    pub fn nickname(&self) -> Option<String> {
        self.nick.borrow().nick.clone()
    }
}

/// A channel as seen by one connection.
///
/// Memberships are kept in join order; NAMES replies come out the way the
/// server introduced the members.
pub struct Channel {
    pub name: String,
    pub created: Option<DateTime<Utc>>,
    pub topic_text: Option<String>,
    pub topic_nick: Option<String>,
    pub topic_time: Option<DateTime<Utc>>,
    pub has_names: bool,
    pub has_topic: bool,
    pub has_modes: bool,
    pub modes: String,
    pub bans: Vec<String>,
    memberships: Vec<ChannelMembership>,
}

impl Channel {
    pub fn new(name: &str) -> Channel {
        Channel {
            name: name.to_owned(),
            created: None,
            topic_text: None,
            topic_nick: None,
            topic_time: None,
            has_names: false,
            has_topic: false,
            has_modes: false,
            modes: String::new(),
            bans: Vec::new(),
            memberships: Vec::new(),
        }
    }

    /// Add a member, returning its membership. Re-adding an existing nick
    /// returns the membership already present.
    pub fn add_member(&mut self, nick: NickRef) -> &mut ChannelMembership {
        let name = nick.borrow().nick.clone();
        if let Some(idx) = self.position(name.as_deref().unwrap_or_default()) {
            return &mut self.memberships[idx];
        }

        let now = Utc::now();
        self.memberships.push(ChannelMembership {
            channel: self.name.clone(),
            nick,
            modes: String::new(),
            join_time: now,
            idle_since: now,
        });
        self.memberships.last_mut().expect("just pushed")
    }

    pub fn remove_member(&mut self, nickname: &str) -> bool {
        match self.position(nickname) {
            Some(idx) => {
                self.memberships.remove(idx);
                true
            }
            None => false,
        }
    }

    pub fn member(&self, nickname: &str) -> Option<&ChannelMembership> {
        self.position(nickname).map(|idx| &self.memberships[idx])
    }

    pub fn member_mut(&mut self, nickname: &str) -> Option<&mut ChannelMembership> {
        self.position(nickname)
            .map(move |idx| &mut self.memberships[idx])
    }

    pub fn has_member(&self, nickname: &str) -> bool {
        self.position(nickname).is_some()
    }

    /// Members in join order.
    pub fn members(&self) -> impl Iterator<Item = &ChannelMembership> {
        self.memberships.iter()
    }

    pub fn member_count(&self) -> usize {
        self.memberships.len()
    }

    pub fn has_mode(&self, mode: char) -> bool {
        self.modes.contains(mode)
    }

    fn position(&self, nickname: &str) -> Option<usize> {
        if nickname.is_empty() {
            return None;
        }
        self.memberships
            .iter()
            .position(|m| m.nick.borrow().nick.as_deref() == Some(nickname))
    }
}
