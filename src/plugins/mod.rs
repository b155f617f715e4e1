//! Plugin surface.
//!
//! Plugins extend the bouncer exclusively through the [`Proxy`]'s high-level
//! events; the class-level connection events stay internal. A plugin is an
//! object that subscribes in its loader and describes itself for the admin
//! surface.

pub mod away;

use std::rc::Rc;

use crate::proxy::Proxy;

pub trait Plugin {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
}

/// Instantiate the built-in plugins against a proxy.
pub fn load_builtin(proxy: &Rc<Proxy>) -> Vec<Rc<dyn Plugin>> {
    vec![away::AwayPlugin::load(proxy)]
}
