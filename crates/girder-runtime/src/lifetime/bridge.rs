//! Object lifetime bridge
//!
//! Reconciles the script side's ownership of proxies with the native
//! refcount of the wrapped objects. Each associated proxy holds a toggle
//! reference. When that is the only native reference the proxy is `Weak`
//! (collectible); when any other reference exists it is `Strong` and rooted
//! in the keep-alive set.
//!
//! Toggle notifications arriving on the home thread are applied at once.
//! Notifications from other threads go through `ToggleShared` and are
//! applied by `drain_pending` on the home thread.

use crate::error::ProtocolViolation;
use crate::ffi::types::ObjectClass;
use crate::lifetime::keep_alive::KeepAliveSet;
use crate::lifetime::proxy::{ObjectProxy, ProxyState};
use crate::lifetime::toggle::{PendingToggleOp, ToggleDirection, ToggleShared};
use crate::runtime::PendingCounters;
use girder_config::ViolationPolicy;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::ffi::{c_int, c_void};
use std::rc::{Rc, Weak};
use std::sync::Arc;

/// Context handed to native code with every toggle reference
struct ToggleContext {
    shared: Arc<ToggleShared>,
    home: *const BridgeState,
}

// SAFETY: other threads only touch `shared`; `home` is dereferenced only
// after checking that the caller is on the home thread.
unsafe impl Send for ToggleContext {}
unsafe impl Sync for ToggleContext {}

/// Home-thread state of the bridge
pub struct BridgeState {
    identity: RefCell<HashMap<usize, Weak<ObjectProxy>>>,
    keep_alive: RefCell<KeepAliveSet>,
    context: Box<ToggleContext>,
    shut_down: Cell<bool>,
    self_ref: Weak<BridgeState>,
}

impl BridgeState {
    fn shared(&self) -> &ToggleShared {
        &self.context.shared
    }

    fn toggle_data(&self) -> *mut c_void {
        &*self.context as *const ToggleContext as *mut c_void
    }

    fn lookup(&self, address: usize) -> Option<Rc<ObjectProxy>> {
        self.identity.borrow().get(&address).and_then(Weak::upgrade)
    }

    /// Clear the identity entry of a dropping proxy and cancel its queued ops
    pub(crate) fn forget(&self, address: usize, proxy: *const ObjectProxy) {
        {
            let mut identity = self.identity.borrow_mut();
            if identity.get(&address).map(Weak::as_ptr) == Some(proxy) {
                identity.remove(&address);
            }
        }
        let cancelled = self.shared().cancel(address);
        if cancelled > 0 {
            tracing::trace!(object = address, cancelled, "cancelled toggle ops of collected proxy");
        }
    }

    fn apply(&self, op: PendingToggleOp) {
        let Some(proxy) = self.lookup(op.object) else {
            tracing::trace!(object = op.object, direction = %op.direction, "toggle for unknown object ignored");
            return;
        };
        tracing::trace!(object = op.object, direction = %op.direction, "toggle applied");

        match (op.direction, proxy.state()) {
            (ToggleDirection::Up, ProxyState::Weak) => {
                proxy.set_state(ProxyState::Strong);
                self.keep_alive.borrow_mut().insert(Rc::clone(&proxy));
            }
            (ToggleDirection::Down, ProxyState::Strong) => {
                proxy.set_state(ProxyState::Weak);
                let root = self.keep_alive.borrow_mut().remove(op.object);
                // Unrooting may drop the last handle; that runs outside the borrow
                drop(root);
            }
            (direction, state) => {
                tracing::warn!(
                    object = op.object,
                    direction = %direction,
                    state = ?state,
                    "redundant toggle notification"
                );
            }
        }
    }
}

/// Native-pointer to proxy bridge, owned by the home thread
#[derive(Clone)]
pub struct ObjectLifetimeBridge {
    state: Rc<BridgeState>,
}

impl ObjectLifetimeBridge {
    pub fn new(policy: ViolationPolicy) -> Self {
        Self::with_counters(policy, Arc::new(PendingCounters::default()))
    }

    pub fn with_counters(policy: ViolationPolicy, counters: Arc<PendingCounters>) -> Self {
        let state = Rc::new_cyclic(|weak: &Weak<BridgeState>| BridgeState {
            identity: RefCell::new(HashMap::new()),
            keep_alive: RefCell::new(KeepAliveSet::new()),
            context: Box::new(ToggleContext {
                shared: Arc::new(ToggleShared::new(policy, counters)),
                home: weak.as_ptr(),
            }),
            shut_down: Cell::new(false),
            self_ref: weak.clone(),
        });
        Self { state }
    }

    pub fn policy(&self) -> ViolationPolicy {
        self.state.shared().policy()
    }

    pub fn is_shut_down(&self) -> bool {
        self.state.shut_down.get()
    }

    /// Proxy for `ptr`, creating and associating one if none exists
    ///
    /// Returns `None` after shutdown.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a live native object of `class` (or a subclass).
    pub unsafe fn wrap(&self, ptr: *mut c_void, class: &Arc<ObjectClass>) -> Option<Rc<ObjectProxy>> {
        if self.is_shut_down() || ptr.is_null() {
            return None;
        }
        if let Some(existing) = self.lookup(ptr) {
            return Some(existing);
        }
        let proxy = self.new_proxy(ptr, class);
        self.associate(&proxy).ok()?;
        Some(proxy)
    }

    /// Unassociated proxy for `ptr`
    pub fn new_proxy(&self, ptr: *mut c_void, class: &Arc<ObjectClass>) -> Rc<ObjectProxy> {
        Rc::new(ObjectProxy::new(
            ptr as usize,
            Arc::clone(class),
            self.state.self_ref.clone(),
            self.state.toggle_data(),
            toggle_notify_entry,
        ))
    }

    /// Register `proxy` as the identity of its native pointer
    ///
    /// The proxy starts `Strong`: after its toggle reference is added the
    /// native object has at least two references. A pointer that already has
    /// a live proxy is rejected.
    ///
    /// # Safety
    ///
    /// The proxy's address must point to a live native object of its class.
    pub unsafe fn associate(&self, proxy: &Rc<ObjectProxy>) -> Result<(), ProtocolViolation> {
        let address = proxy.address();
        if self.is_shut_down() || address == 0 || proxy.is_associated() {
            return Err(ProtocolViolation::DuplicateProxy { object: address });
        }
        {
            let mut identity = self.state.identity.borrow_mut();
            if identity.get(&address).and_then(Weak::upgrade).is_some() {
                return Err(ProtocolViolation::DuplicateProxy { object: address });
            }
            identity.insert(address, Rc::downgrade(proxy));
        }

        proxy.set_state(ProxyState::Strong);
        self.state.keep_alive.borrow_mut().insert(Rc::clone(proxy));
        proxy.attach();
        tracing::debug!(object = address, class = %proxy.class().name, "proxy associated");
        Ok(())
    }

    pub fn lookup(&self, ptr: *mut c_void) -> Option<Rc<ObjectProxy>> {
        self.state.lookup(ptr as usize)
    }

    pub fn is_rooted(&self, ptr: *mut c_void) -> bool {
        self.state.keep_alive.borrow().contains(ptr as usize)
    }

    pub fn rooted_count(&self) -> usize {
        self.state.keep_alive.borrow().len()
    }

    /// Number of live associated proxies
    pub fn live_count(&self) -> usize {
        self.state
            .identity
            .borrow()
            .values()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    pub fn has_pending(&self, ptr: *mut c_void) -> bool {
        self.state.shared().has_pending(ptr as usize)
    }

    /// Apply queued toggle ops; must run on the home thread
    pub fn drain_pending(&self) -> usize {
        let mut applied = 0;
        while let Some(op) = self.state.shared().pop() {
            self.state.apply(op);
            applied += 1;
        }
        if applied > 0 {
            tracing::debug!(applied, "drained toggle queue");
        }
        applied
    }

    /// Disassociate every proxy; later toggles and wraps are ignored
    pub fn shutdown(&self) {
        if self.state.shut_down.replace(true) {
            return;
        }
        let dropped = self.state.shared().shut_down();

        let proxies: Vec<Rc<ObjectProxy>> = self
            .state
            .identity
            .borrow_mut()
            .drain()
            .filter_map(|(_, weak)| weak.upgrade())
            .collect();
        let count = proxies.len();
        for proxy in &proxies {
            proxy.detach();
        }

        let roots = self.state.keep_alive.borrow_mut().drain();
        drop(roots);
        drop(proxies);
        tracing::debug!(disassociated = count, dropped_toggles = dropped, "lifetime bridge shut down");
    }
}

impl Drop for BridgeState {
    fn drop(&mut self) {
        if !self.shut_down.get() {
            // Proxies still alive hold no strong reference to us; detach them
            // so native code stops calling into the freed context
            let proxies: Vec<Rc<ObjectProxy>> = self
                .identity
                .get_mut()
                .drain()
                .filter_map(|(_, weak)| weak.upgrade())
                .collect();
            for proxy in &proxies {
                proxy.detach();
            }
            self.shared().shut_down();
        }
    }
}

/// Toggle notification entry point, callable from any thread
unsafe extern "C" fn toggle_notify_entry(data: *mut c_void, object: *mut c_void, is_last_ref: c_int) {
    if data.is_null() {
        return;
    }
    let context = &*(data as *const ToggleContext);
    let shared = &context.shared;
    if shared.is_shut_down() {
        return;
    }
    let op = PendingToggleOp {
        object: object as usize,
        direction: ToggleDirection::from_is_last_ref(is_last_ref != 0),
    };

    if shared.is_home_thread() && !shared.has_pending(op.object) {
        // SAFETY: on the home thread the state outlives every toggle reference
        let state = &*context.home;
        state.apply(op);
        return;
    }

    // A violation is already logged; under Report the op is dropped
    let _ = shared.enqueue(op);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ffi::types::ObjectOps;
    use std::sync::atomic::{AtomicIsize, Ordering};

    // Minimal refcounted native object with one toggle reference
    #[repr(C)]
    struct Node {
        refs: AtomicIsize,
        notify: Option<crate::ffi::types::ToggleNotifyFn>,
        data: *mut c_void,
    }

    unsafe extern "C" fn node_ref(obj: *mut c_void) -> *mut c_void {
        let node = &mut *(obj as *mut Node);
        let old = node.refs.fetch_add(1, Ordering::SeqCst);
        if old == 1 {
            if let Some(notify) = node.notify {
                notify(node.data, obj, 0);
            }
        }
        obj
    }

    unsafe extern "C" fn node_unref(obj: *mut c_void) {
        let node = &mut *(obj as *mut Node);
        let old = node.refs.fetch_sub(1, Ordering::SeqCst);
        if old == 2 {
            if let Some(notify) = node.notify {
                notify(node.data, obj, 1);
            }
        }
    }

    unsafe extern "C" fn node_add_toggle(
        obj: *mut c_void,
        notify: crate::ffi::types::ToggleNotifyFn,
        data: *mut c_void,
    ) {
        let node = &mut *(obj as *mut Node);
        node.notify = Some(notify);
        node.data = data;
        node.refs.fetch_add(1, Ordering::SeqCst);
    }

    unsafe extern "C" fn node_remove_toggle(
        obj: *mut c_void,
        _notify: crate::ffi::types::ToggleNotifyFn,
        _data: *mut c_void,
    ) {
        let node = &mut *(obj as *mut Node);
        node.notify = None;
        node.refs.fetch_sub(1, Ordering::SeqCst);
    }

    fn node_class() -> Arc<ObjectClass> {
        Arc::new(ObjectClass::new(
            "Node",
            ObjectOps {
                ref_object: node_ref,
                unref_object: node_unref,
                add_toggle_ref: node_add_toggle,
                remove_toggle_ref: node_remove_toggle,
            },
        ))
    }

    fn new_node() -> Box<Node> {
        Box::new(Node {
            refs: AtomicIsize::new(1),
            notify: None,
            data: std::ptr::null_mut(),
        })
    }

    #[test]
    fn test_wrap_is_identity_preserving() {
        let bridge = ObjectLifetimeBridge::new(ViolationPolicy::Report);
        let class = node_class();
        let mut node = new_node();
        let ptr = &mut *node as *mut Node as *mut c_void;

        let a = unsafe { bridge.wrap(ptr, &class) }.unwrap();
        let b = unsafe { bridge.wrap(ptr, &class) }.unwrap();
        assert!(Rc::ptr_eq(&a, &b));
        assert_eq!(node.refs.load(Ordering::SeqCst), 2);
        bridge.shutdown();
    }

    #[test]
    fn test_last_ref_drop_unroots() {
        let bridge = ObjectLifetimeBridge::new(ViolationPolicy::Report);
        let class = node_class();
        let mut node = new_node();
        let ptr = &mut *node as *mut Node as *mut c_void;

        let proxy = unsafe { bridge.wrap(ptr, &class) }.unwrap();
        assert!(bridge.is_rooted(ptr));

        unsafe { node_unref(ptr) };
        assert_eq!(proxy.state(), ProxyState::Weak);
        assert!(!bridge.is_rooted(ptr));

        unsafe { node_ref(ptr) };
        assert_eq!(proxy.state(), ProxyState::Strong);
        assert!(bridge.is_rooted(ptr));
        bridge.shutdown();
    }

    #[test]
    fn test_collecting_weak_proxy_removes_toggle_ref() {
        let bridge = ObjectLifetimeBridge::new(ViolationPolicy::Report);
        let class = node_class();
        let mut node = new_node();
        let ptr = &mut *node as *mut Node as *mut c_void;

        let proxy = unsafe { bridge.wrap(ptr, &class) }.unwrap();
        unsafe { node_unref(ptr) };
        assert_eq!(node.refs.load(Ordering::SeqCst), 1);

        drop(proxy);
        assert_eq!(node.refs.load(Ordering::SeqCst), 0);
        assert!(bridge.lookup(ptr).is_none());
    }

    // Native side that reports a last toggle from a worker while the toggle
    // reference is being removed
    unsafe extern "C" fn node_remove_toggle_late_notify(
        obj: *mut c_void,
        notify: crate::ffi::types::ToggleNotifyFn,
        data: *mut c_void,
    ) {
        let (object, context) = (obj as usize, data as usize);
        std::thread::spawn(move || unsafe { notify(context as *mut c_void, object as *mut c_void, 0) })
            .join()
            .unwrap();
        node_remove_toggle(obj, notify, data);
    }

    #[test]
    fn test_toggle_during_collection_is_not_left_queued() {
        let bridge = ObjectLifetimeBridge::new(ViolationPolicy::Report);
        let mut ops = node_class().ops;
        ops.remove_toggle_ref = node_remove_toggle_late_notify;
        let class = Arc::new(ObjectClass::new("LateNode", ops));
        let mut node = new_node();
        let ptr = &mut *node as *mut Node as *mut c_void;

        let proxy = unsafe { bridge.wrap(ptr, &class) }.unwrap();
        unsafe { node_unref(ptr) };
        drop(proxy);

        assert!(!bridge.has_pending(ptr));
        assert_eq!(bridge.drain_pending(), 0);
    }

    #[test]
    fn test_associate_rejects_second_proxy() {
        let bridge = ObjectLifetimeBridge::new(ViolationPolicy::Report);
        let class = node_class();
        let mut node = new_node();
        let ptr = &mut *node as *mut Node as *mut c_void;

        let first = bridge.new_proxy(ptr, &class);
        let second = bridge.new_proxy(ptr, &class);
        unsafe { bridge.associate(&first) }.unwrap();
        assert_eq!(
            unsafe { bridge.associate(&second) },
            Err(ProtocolViolation::DuplicateProxy { object: ptr as usize })
        );
        drop(second);
        assert!(Rc::ptr_eq(&bridge.lookup(ptr).unwrap(), &first));
        bridge.shutdown();
    }

    #[test]
    fn test_shutdown_disassociates() {
        let bridge = ObjectLifetimeBridge::new(ViolationPolicy::Report);
        let class = node_class();
        let mut node = new_node();
        let ptr = &mut *node as *mut Node as *mut c_void;

        let proxy = unsafe { bridge.wrap(ptr, &class) }.unwrap();
        bridge.shutdown();
        assert!(proxy.native_ptr().is_none());
        assert_eq!(bridge.rooted_count(), 0);
        assert_eq!(node.refs.load(Ordering::SeqCst), 1);
        assert!(unsafe { bridge.wrap(ptr, &class) }.is_none());
    }
}
