//! Bridge runtime: state scoped to one scripting runtime
//!
//! Owns the object lifetime bridge, the deferred-free queue of finished
//! async trampolines, and the counters of pending cross-thread work.

use crate::ffi::callbacks::DeferredFreeQueue;
use crate::ffi::marshal::ArgumentMarshaler;
use crate::lifetime::bridge::ObjectLifetimeBridge;
use girder_config::{BridgeConfig, ViolationPolicy};
use std::cell::Cell;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Counters of pending deferred work, updated from any thread
#[derive(Debug, Default)]
pub struct PendingCounters {
    toggles: AtomicUsize,
    deferred_trampolines: AtomicUsize,
}

impl PendingCounters {
    pub fn toggle_queued(&self) {
        self.toggles.fetch_add(1, Ordering::AcqRel);
    }

    pub fn toggle_done(&self, count: usize) {
        self.toggles.fetch_sub(count, Ordering::AcqRel);
    }

    pub fn trampoline_deferred(&self) {
        self.deferred_trampolines.fetch_add(1, Ordering::AcqRel);
    }

    pub fn trampolines_freed(&self, count: usize) {
        self.deferred_trampolines.fetch_sub(count, Ordering::AcqRel);
    }

    pub fn snapshot(&self) -> PendingCounts {
        PendingCounts {
            toggles: self.toggles.load(Ordering::Acquire),
            deferred_trampolines: self.deferred_trampolines.load(Ordering::Acquire),
        }
    }
}

/// Point-in-time view of `PendingCounters`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingCounts {
    pub toggles: usize,
    pub deferred_trampolines: usize,
}

pub(crate) struct RuntimeInner {
    config: BridgeConfig,
    counters: Arc<PendingCounters>,
    bridge: ObjectLifetimeBridge,
    deferred: DeferredFreeQueue,
    shut_down: Cell<bool>,
}

impl RuntimeInner {
    pub(crate) fn bridge(&self) -> &ObjectLifetimeBridge {
        &self.bridge
    }

    pub(crate) fn deferred(&self) -> &DeferredFreeQueue {
        &self.deferred
    }

    pub(crate) fn policy(&self) -> ViolationPolicy {
        self.config.protocol_violation()
    }

    fn shutdown(&self) {
        if self.shut_down.replace(true) {
            return;
        }
        let freed = self.deferred.drain();
        self.bridge.shutdown();
        tracing::debug!(freed_trampolines = freed, "bridge runtime shut down");
    }
}

impl Drop for RuntimeInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Handle to the bridge state of one scripting runtime
///
/// Lives on the home thread. Clones share the same state.
///
/// # Examples
///
/// ```
/// use girder_config::{BridgeConfig, ViolationPolicy};
/// use girder_runtime::BridgeRuntime;
///
/// let config = BridgeConfig::default().with_protocol_violation(ViolationPolicy::Report);
/// let runtime = BridgeRuntime::new(&config);
/// assert_eq!(runtime.pending().toggles, 0);
/// runtime.shutdown();
/// ```
#[derive(Clone)]
pub struct BridgeRuntime {
    inner: Rc<RuntimeInner>,
}

impl BridgeRuntime {
    pub fn new(config: &BridgeConfig) -> Self {
        let counters = Arc::new(PendingCounters::default());
        let policy = config.protocol_violation();
        let inner = RuntimeInner {
            config: config.clone(),
            counters: Arc::clone(&counters),
            bridge: ObjectLifetimeBridge::with_counters(policy, Arc::clone(&counters)),
            deferred: DeferredFreeQueue::new(counters),
            shut_down: Cell::new(false),
        };
        Self {
            inner: Rc::new(inner),
        }
    }

    pub(crate) fn downgrade(&self) -> Weak<RuntimeInner> {
        Rc::downgrade(&self.inner)
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    pub fn policy(&self) -> ViolationPolicy {
        self.inner.policy()
    }

    pub fn warn_extra_arguments(&self) -> bool {
        self.inner.config.warn_extra_arguments()
    }

    pub fn bridge(&self) -> &ObjectLifetimeBridge {
        &self.inner.bridge
    }

    pub fn marshaler(&self) -> ArgumentMarshaler<'_> {
        ArgumentMarshaler::new(&self.inner.bridge)
    }

    pub(crate) fn deferred(&self) -> &DeferredFreeQueue {
        &self.inner.deferred
    }

    /// Free async trampolines that completed since the last drain
    pub fn drain_deferred(&self) -> usize {
        self.inner.deferred.drain()
    }

    /// Idle-time work on the home thread: apply queued toggle ops
    pub fn run_idle(&self) -> usize {
        self.inner.bridge.drain_pending()
    }

    pub fn pending(&self) -> PendingCounts {
        self.inner.counters.snapshot()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.get()
    }

    /// Tear down the lifetime bridge before the scripting runtime goes away
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}
