//! Scripting-side proxies for native refcounted objects

use crate::ffi::types::{ObjectClass, ToggleNotifyFn};
use crate::lifetime::bridge::BridgeState;
use std::cell::Cell;
use std::ffi::c_void;
use std::fmt;
use std::rc::Weak;
use std::sync::Arc;

/// Rooting state of a proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    /// Only the proxy's toggle reference keeps the native object alive;
    /// the proxy itself is collectible
    Weak,
    /// Native code holds further references; the proxy is rooted
    Strong,
}

/// Script handle wrapping one native object
///
/// At most one associated proxy exists per native pointer. An associated
/// proxy owns one toggle reference on the native object, removed when the
/// proxy is dropped or disassociated.
pub struct ObjectProxy {
    address: Cell<usize>,
    class: Arc<ObjectClass>,
    state: Cell<ProxyState>,
    associated: Cell<bool>,
    bridge: Weak<BridgeState>,
    toggle_data: *mut c_void,
    notify: ToggleNotifyFn,
}

impl ObjectProxy {
    pub(crate) fn new(
        address: usize,
        class: Arc<ObjectClass>,
        bridge: Weak<BridgeState>,
        toggle_data: *mut c_void,
        notify: ToggleNotifyFn,
    ) -> Self {
        Self {
            address: Cell::new(address),
            class,
            state: Cell::new(ProxyState::Strong),
            associated: Cell::new(false),
            bridge,
            toggle_data,
            notify,
        }
    }

    pub fn class(&self) -> &Arc<ObjectClass> {
        &self.class
    }

    /// Native address, or 0 once disassociated
    pub fn address(&self) -> usize {
        self.address.get()
    }

    /// Native pointer while the proxy is bound to its object
    pub fn native_ptr(&self) -> Option<*mut c_void> {
        if self.associated.get() && self.address.get() != 0 {
            Some(self.address.get() as *mut c_void)
        } else {
            None
        }
    }

    pub fn state(&self) -> ProxyState {
        self.state.get()
    }

    pub fn is_associated(&self) -> bool {
        self.associated.get()
    }

    pub(crate) fn set_state(&self, state: ProxyState) {
        self.state.set(state);
    }

    /// Install the toggle reference
    ///
    /// # Safety
    ///
    /// The address must point to a live object of `class`.
    pub(crate) unsafe fn attach(&self) {
        self.associated.set(true);
        (self.class.ops.add_toggle_ref)(self.address() as *mut c_void, self.notify, self.toggle_data);
    }

    /// Remove the toggle reference and forget the native object
    ///
    /// Returns the former address when the proxy was associated.
    pub(crate) fn detach(&self) -> Option<usize> {
        if !self.associated.replace(false) {
            return None;
        }
        let address = self.address.replace(0);
        self.state.set(ProxyState::Weak);
        tracing::debug!(object = address, class = %self.class.name, "proxy disassociated");
        // SAFETY: the toggle reference installed by attach keeps the object alive until here
        unsafe {
            (self.class.ops.remove_toggle_ref)(address as *mut c_void, self.notify, self.toggle_data);
        }
        Some(address)
    }
}

impl fmt::Debug for ObjectProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectProxy")
            .field("class", &self.class.name)
            .field("address", &format_args!("{:#x}", self.address()))
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for ObjectProxy {
    fn drop(&mut self) {
        if !self.associated.get() {
            return;
        }
        let address = self.address();
        // Toggles can still arrive until the toggle reference is gone
        self.detach();
        if let Some(bridge) = self.bridge.upgrade() {
            bridge.forget(address, self as *const ObjectProxy);
        }
    }
}
