//! Shared test fixtures
//!
//! A fake refcounted native object type with the toggle-reference ABI, plus
//! helpers for building runtimes and invokers.

#![allow(dead_code)]

use girder_config::{BridgeConfig, ViolationPolicy};
use girder_runtime::ffi::{ObjectClass, ObjectOps, ToggleNotifyFn};
use girder_runtime::{BridgeRuntime, CallInvoker, CallableInfo};
use std::ffi::c_void;
use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};
use std::sync::Arc;

pub use pretty_assertions::{assert_eq, assert_ne};

/// Runtime that reports protocol violations instead of aborting
pub fn runtime() -> BridgeRuntime {
    BridgeRuntime::new(&BridgeConfig::default().with_protocol_violation(ViolationPolicy::Report))
}

/// Invoker for a test function compiled into this binary
pub fn invoker(info: CallableInfo, function: *const c_void) -> CallInvoker {
    // SAFETY: every caller passes an extern "C" fn matching `info`
    unsafe { CallInvoker::new(Arc::new(info), function) }.expect("valid signature")
}

/// Number of widgets freed so far, across all tests in a binary
pub static WIDGETS_FREED: AtomicUsize = AtomicUsize::new(0);

/// Refcounted native object supporting one toggle reference
#[repr(C)]
pub struct Widget {
    pub refs: AtomicIsize,
    pub label: u32,
    notify: Option<ToggleNotifyFn>,
    data: *mut c_void,
}

impl Widget {
    /// Heap widget holding one reference, owned by the caller
    pub fn create(label: u32) -> *mut c_void {
        Box::into_raw(Box::new(Widget {
            refs: AtomicIsize::new(1),
            label,
            notify: None,
            data: std::ptr::null_mut(),
        })) as *mut c_void
    }

    /// # Safety
    ///
    /// `ptr` must be a live widget.
    pub unsafe fn refs(ptr: *mut c_void) -> isize {
        (*(ptr as *const Widget)).refs.load(Ordering::SeqCst)
    }

    /// # Safety
    ///
    /// `ptr` must be a live widget.
    pub unsafe fn has_toggle(ptr: *mut c_void) -> bool {
        (*(ptr as *const Widget)).notify.is_some()
    }

    /// Fire the toggle notify without touching the refcount
    ///
    /// # Safety
    ///
    /// `ptr` must be a live widget.
    pub unsafe fn notify(ptr: *mut c_void, is_last_ref: bool) {
        let widget = &*(ptr as *const Widget);
        if let Some(notify) = widget.notify {
            notify(widget.data, ptr, is_last_ref as std::os::raw::c_int);
        }
    }
}

pub unsafe extern "C" fn widget_ref(obj: *mut c_void) -> *mut c_void {
    let widget = &*(obj as *const Widget);
    let old = widget.refs.fetch_add(1, Ordering::SeqCst);
    if old == 1 {
        if let Some(notify) = widget.notify {
            notify(widget.data, obj, 0);
        }
    }
    obj
}

pub unsafe extern "C" fn widget_unref(obj: *mut c_void) {
    let widget = &*(obj as *const Widget);
    let old = widget.refs.fetch_sub(1, Ordering::SeqCst);
    match old {
        1 => {
            drop(Box::from_raw(obj as *mut Widget));
            WIDGETS_FREED.fetch_add(1, Ordering::SeqCst);
        }
        2 => {
            if let Some(notify) = widget.notify {
                notify(widget.data, obj, 1);
            }
        }
        _ => {}
    }
}

unsafe extern "C" fn widget_add_toggle(obj: *mut c_void, notify: ToggleNotifyFn, data: *mut c_void) {
    let widget = &mut *(obj as *mut Widget);
    widget.notify = Some(notify);
    widget.data = data;
    widget.refs.fetch_add(1, Ordering::SeqCst);
}

unsafe extern "C" fn widget_remove_toggle(obj: *mut c_void, _notify: ToggleNotifyFn, _data: *mut c_void) {
    {
        let widget = &mut *(obj as *mut Widget);
        widget.notify = None;
        widget.data = std::ptr::null_mut();
    }
    widget_unref(obj);
}

pub fn widget_class() -> Arc<ObjectClass> {
    Arc::new(ObjectClass::new(
        "Widget",
        ObjectOps {
            ref_object: widget_ref,
            unref_object: widget_unref,
            add_toggle_ref: widget_add_toggle,
            remove_toggle_ref: widget_remove_toggle,
        },
    ))
}
