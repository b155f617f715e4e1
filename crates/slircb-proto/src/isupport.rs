//! ISUPPORT (`005`) tokens and the PREFIX mode/prefix map.

/// Server capability tokens, insertion-ordered.
///
/// Order matters for re-emitting the tokens to a client: replies come out in
/// the order the keys were first learned.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Isupport {
    entries: Vec<(String, String)>,
}

impl Isupport {
    /// An empty token set.
    pub fn new() -> Isupport {
        Isupport {
            entries: Vec::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Insert or update a token, keeping its original position on update.
    pub fn set(&mut self, key: &str, value: &str) {
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = value.to_owned(),
            None => self.entries.push((key.to_owned(), value.to_owned())),
        }
    }

    /// Iterate tokens formatted for the wire: `KEY=VALUE`, or `KEY` when the
    /// value is empty.
    pub fn tokens(&self) -> impl Iterator<Item = String> + '_ {
        self.entries.iter().map(|(k, v)| {
            if v.is_empty() {
                k.clone()
            } else {
                format!("{}={}", k, v)
            }
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The PREFIX map, if the `PREFIX` token is present and well-formed.
    pub fn prefix_map(&self) -> Option<PrefixMap> {
        PrefixMap::parse(self.get("PREFIX")?)
    }
}

impl Default for Isupport {
    /// The assumptions made before a server has sent `005`.
    fn default() -> Isupport {
        let mut isupport = Isupport::new();
        isupport.set("CHANMODES", "bIe,k,l");
        isupport.set("CHANTYPES", "#&+");
        isupport.set("PREFIX", "(ov)@+");
        isupport.set("NAMESX", "");
        isupport
    }
}

/// Positional correspondence between membership mode letters and their
/// visible prefix characters, decoded from `PREFIX=(modes)prefixes`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PrefixMap {
    modes: Vec<char>,
    prefixes: Vec<char>,
}

impl PrefixMap {
    /// Decode `(modes)prefixes`, e.g. `(ov)@+`. Returns `None` when the
    /// value is empty or not of that shape.
    pub fn parse(value: &str) -> Option<PrefixMap> {
        let inner = value.strip_prefix('(')?;
        let (modes, prefixes) = inner.split_once(')')?;

        Some(PrefixMap {
            modes: modes.chars().collect(),
            prefixes: prefixes.chars().collect(),
        })
    }

    /// `@` → `o` under `(ov)@+`.
    pub fn prefix_to_mode(&self, prefix: char) -> Option<char> {
        let idx = self.prefixes.iter().position(|&c| c == prefix)?;
        self.modes.get(idx).copied()
    }

    /// `v` → `+` under `(ov)@+`.
    pub fn mode_to_prefix(&self, mode: char) -> Option<char> {
        let idx = self.modes.iter().position(|&c| c == mode)?;
        self.prefixes.get(idx).copied()
    }
}

/// One-shot [`PrefixMap::prefix_to_mode`] over a raw ISUPPORT value.
pub fn prefix_to_mode(value: &str, prefix: char) -> Option<char> {
    PrefixMap::parse(value)?.prefix_to_mode(prefix)
}

/// One-shot [`PrefixMap::mode_to_prefix`] over a raw ISUPPORT value.
pub fn mode_to_prefix(value: &str, mode: char) -> Option<char> {
    PrefixMap::parse(value)?.mode_to_prefix(mode)
}
