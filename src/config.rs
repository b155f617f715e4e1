//! The user/config store: a tree of named nodes carrying JSON-valued
//! attributes.
//!
//! Nodes are created on first access, attributes keep their insertion order,
//! and the whole tree persists as a single JSON document. Mutations mark the
//! store dirty; the bootstrap runs a periodic writeback plus a final save on
//! shutdown.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::rc::{Rc, Weak};

use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("malformed config document {path}: {source}")]
    Malformed {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// One node in the config tree.
pub struct ConfigNode {
    name: String,
    parent: RefCell<Weak<ConfigNode>>,
    attributes: RefCell<Vec<(String, Value)>>,
    children: RefCell<BTreeMap<String, Rc<ConfigNode>>>,
    dirty: Rc<Cell<bool>>,
}

impl ConfigNode {
    fn new(name: &str, dirty: Rc<Cell<bool>>) -> Rc<ConfigNode> {
        Rc::new(ConfigNode {
            name: name.to_owned(),
            parent: RefCell::new(Weak::new()),
            attributes: RefCell::new(Vec::new()),
            children: RefCell::new(BTreeMap::new()),
            dirty,
        })
    }

    /// A detached root node (not backed by a store).
    pub fn root() -> Rc<ConfigNode> {
        ConfigNode::new("root", Rc::new(Cell::new(false)))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<Rc<ConfigNode>> {
        self.parent.borrow().upgrade()
    }

    /// Retrieve the named child node, creating it on demand.
    pub fn child(self: &Rc<Self>, name: &str) -> Rc<ConfigNode> {
        if let Some(existing) = self.children.borrow().get(name) {
            return existing.clone();
        }

        let node = ConfigNode::new(name, self.dirty.clone());
        *node.parent.borrow_mut() = Rc::downgrade(self);
        self.children
            .borrow_mut()
            .insert(name.to_owned(), node.clone());
        self.dirty.set(true);
        node
    }

    pub fn has_child(&self, name: &str) -> bool {
        self.children.borrow().contains_key(name)
    }

    pub fn remove_child(&self, name: &str) {
        if self.children.borrow_mut().remove(name).is_some() {
            self.dirty.set(true);
        }
    }

    pub fn child_names(&self) -> Vec<String> {
        self.children.borrow().keys().cloned().collect()
    }

    /// The value associated with `key`, if present.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.attributes
            .borrow()
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }

    /// The value associated with `key`; stores and returns `default` when
    /// the attribute is missing.
    pub fn get_or(&self, key: &str, default: Value) -> Value {
        if let Some(value) = self.get(key) {
            return value;
        }

        self.set(key, default.clone());
        default
    }

    pub fn get_str(&self, key: &str) -> Option<String> {
        self.get(key).and_then(|v| v.as_str().map(str::to_owned))
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(|v| v.as_bool())
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(|v| v.as_i64())
    }

    /// A `[host, port]` attribute, e.g. `server_address`.
    pub fn get_addr(&self, key: &str) -> Option<(String, u16)> {
        let value = self.get(key)?;
        let items = value.as_array()?;
        let host = items.first()?.as_str()?.to_owned();
        let port = u16::try_from(items.get(1)?.as_u64()?).ok()?;
        Some((host, port))
    }

    /// Set an attribute, replacing an existing value in place.
    pub fn set(&self, key: &str, value: Value) {
        let mut attributes = self.attributes.borrow_mut();
        match attributes.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = value,
            None => attributes.push((key.to_owned(), value)),
        }
        self.dirty.set(true);
    }

    pub fn unset(&self, key: &str) {
        let mut attributes = self.attributes.borrow_mut();
        let before = attributes.len();
        attributes.retain(|(k, _)| k != key);
        if attributes.len() != before {
            self.dirty.set(true);
        }
    }

    /// Store `value` under a freshly generated key, returning the key.
    pub fn append(&self, value: Value) -> String {
        let key = Uuid::new_v4().to_string();
        self.set(&key, value);
        key
    }

    /// Remove all attributes (children are kept).
    pub fn clear(&self) {
        let mut attributes = self.attributes.borrow_mut();
        if !attributes.is_empty() {
            attributes.clear();
            self.dirty.set(true);
        }
    }

    /// Attributes in insertion order.
    pub fn attributes(&self) -> Vec<(String, Value)> {
        self.attributes.borrow().clone()
    }

    fn to_json(&self) -> Value {
        let attributes: Vec<Value> = self
            .attributes
            .borrow()
            .iter()
            .map(|(k, v)| json!([k, v]))
            .collect();

        let children: serde_json::Map<String, Value> = self
            .children
            .borrow()
            .iter()
            .map(|(name, node)| (name.clone(), node.to_json()))
            .collect();

        json!({
            "attributes": attributes,
            "children": children,
        })
    }

    fn load_json(self: &Rc<Self>, value: &Value) {
        if let Some(attributes) = value.get("attributes").and_then(Value::as_array) {
            let mut out = self.attributes.borrow_mut();
            for pair in attributes {
                if let (Some(key), Some(val)) = (
                    pair.as_array().and_then(|p| p.first()).and_then(Value::as_str),
                    pair.as_array().and_then(|p| p.get(1)),
                ) {
                    out.push((key.to_owned(), val.clone()));
                }
            }
        }

        if let Some(children) = value.get("children").and_then(Value::as_object) {
            for (name, child_value) in children {
                let node = ConfigNode::new(name, self.dirty.clone());
                *node.parent.borrow_mut() = Rc::downgrade(self);
                node.load_json(child_value);
                self.children.borrow_mut().insert(name.clone(), node);
            }
        }
    }
}

/// The persistent tree, bound to a file path.
pub struct ConfigStore {
    path: PathBuf,
    root: Rc<ConfigNode>,
    dirty: Rc<Cell<bool>>,
}

impl ConfigStore {
    /// Load the tree from `path`, or start empty when the file is missing.
    pub fn open(path: &Path) -> Result<ConfigStore, ConfigError> {
        let dirty = Rc::new(Cell::new(false));
        let root = ConfigNode::new("root", dirty.clone());

        match std::fs::read_to_string(path) {
            Ok(text) => {
                let doc: Value =
                    serde_json::from_str(&text).map_err(|source| ConfigError::Malformed {
                        path: path.to_owned(),
                        source,
                    })?;
                root.load_json(&doc);
                info!(path = %path.display(), "Config loaded");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "No config file, starting empty");
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_owned(),
                    source,
                });
            }
        }

        dirty.set(false);

        Ok(ConfigStore {
            path: path.to_owned(),
            root,
            dirty,
        })
    }

    pub fn root(&self) -> Rc<ConfigNode> {
        self.root.clone()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.get()
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        let doc = self.root.to_json();
        let text = serde_json::to_string_pretty(&doc).expect("config tree is valid json");

        std::fs::write(&self.path, text).map_err(|source| ConfigError::Write {
            path: self.path.clone(),
            source,
        })?;

        self.dirty.set(false);
        debug!(path = %self.path.display(), "Config saved");
        Ok(())
    }

    /// Save only when something changed since the last save.
    pub fn save_if_dirty(&self) -> Result<(), ConfigError> {
        if self.is_dirty() {
            self.save()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_created_on_demand() {
        let root = ConfigNode::root();
        assert!(!root.has_child("users"));

        let users = root.child("users");
        assert!(root.has_child("users"));
        assert!(Rc::ptr_eq(&users, &root.child("users")));
        assert!(users.parent().is_some());
    }

    #[test]
    fn attributes_keep_insertion_order() {
        let root = ConfigNode::root();
        root.set("b", json!(1));
        root.set("a", json!(2));
        root.set("b", json!(3));

        let attrs = root.attributes();
        assert_eq!(attrs[0].0, "b");
        assert_eq!(attrs[0].1, json!(3));
        assert_eq!(attrs[1].0, "a");
    }

    #[test]
    fn get_or_stores_default() {
        let root = ConfigNode::root();
        assert_eq!(root.get("nick"), None);
        assert_eq!(root.get_or("nick", json!("alice")), json!("alice"));
        assert_eq!(root.get("nick"), Some(json!("alice")));
    }

    #[test]
    fn append_generates_unique_keys() {
        let root = ConfigNode::root();
        let k1 = root.append(json!("one"));
        let k2 = root.append(json!("two"));

        assert_ne!(k1, k2);
        assert_eq!(root.get(&k1), Some(json!("one")));
        assert_eq!(root.attributes().len(), 2);
    }

    #[test]
    fn clear_removes_attributes_not_children() {
        let root = ConfigNode::root();
        root.set("x", json!(1));
        root.child("sub").set("y", json!(2));

        root.clear();
        assert_eq!(root.attributes().len(), 0);
        assert!(root.has_child("sub"));
        assert_eq!(root.child("sub").get("y"), Some(json!(2)));
    }

    #[test]
    fn addr_attribute_round_trip() {
        let root = ConfigNode::root();
        root.set("server_address", json!(["irc.example.org", 6667]));
        assert_eq!(
            root.get_addr("server_address"),
            Some(("irc.example.org".to_owned(), 6667))
        );
        assert_eq!(root.get_addr("missing"), None);
    }

    #[test]
    fn store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slircb.json");

        {
            let store = ConfigStore::open(&path).unwrap();
            let root = store.root();
            root.set("listener_address", json!(["0.0.0.0", 9000]));
            let alice = root.child("users").child("alice");
            alice.set("password", json!("s3cret"));
            alice.set("server_address", json!(["irc.example.org", 6667]));
            assert!(store.is_dirty());
            store.save().unwrap();
            assert!(!store.is_dirty());
        }

        let store = ConfigStore::open(&path).unwrap();
        let root = store.root();
        assert!(!store.is_dirty());
        assert_eq!(
            root.get_addr("listener_address"),
            Some(("0.0.0.0".to_owned(), 9000))
        );
        let alice = root.child("users").child("alice");
        assert_eq!(alice.get_str("password").as_deref(), Some("s3cret"));
        assert_eq!(root.child("users").child_names(), vec!["alice"]);
    }

    #[test]
    fn missing_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::open(&dir.path().join("nope.json")).unwrap();
        assert!(store.root().child_names().is_empty());
        assert!(!store.is_dirty());
    }
}
