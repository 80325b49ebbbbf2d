//! Keep-alive set: proxies rooted because native code holds extra references

use crate::lifetime::proxy::ObjectProxy;
use std::collections::HashMap;
use std::rc::Rc;

/// Root set of strongly held proxies, keyed by native address
#[derive(Debug, Default)]
pub struct KeepAliveSet {
    roots: HashMap<usize, Rc<ObjectProxy>>,
}

impl KeepAliveSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Root a proxy; false if it was already rooted
    pub fn insert(&mut self, proxy: Rc<ObjectProxy>) -> bool {
        let address = proxy.address();
        if self.roots.contains_key(&address) {
            return false;
        }
        self.roots.insert(address, proxy);
        true
    }

    /// Unroot a proxy; the caller decides when the handle is dropped
    pub fn remove(&mut self, address: usize) -> Option<Rc<ObjectProxy>> {
        self.roots.remove(&address)
    }

    pub fn contains(&self, address: usize) -> bool {
        self.roots.contains_key(&address)
    }

    /// Proxies the collector must treat as roots
    pub fn roots(&self) -> impl Iterator<Item = &Rc<ObjectProxy>> {
        self.roots.values()
    }

    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Take every root out of the set
    pub fn drain(&mut self) -> Vec<Rc<ObjectProxy>> {
        self.roots.drain().map(|(_, proxy)| proxy).collect()
    }
}
