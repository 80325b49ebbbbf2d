//! Scripting-owned copies of native structs and unions

use crate::ffi::types::StructInfo;
use std::ffi::c_void;
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

/// Copy a native struct into a new allocation owned by the caller
///
/// Registered boxed types use their `copy` function; plain structs are
/// copied byte for byte into a C allocation.
///
/// # Safety
///
/// `ptr` must point to a valid value of the type described by `info`.
pub unsafe fn copy_native(ptr: *const c_void, info: &StructInfo) -> Option<NonNull<c_void>> {
    match info.copy {
        Some(copy) => NonNull::new(copy(ptr)),
        None => {
            let raw = libc::malloc(info.size.max(1));
            if !raw.is_null() {
                std::ptr::copy_nonoverlapping(ptr as *const u8, raw as *mut u8, info.size);
            }
            NonNull::new(raw)
        }
    }
}

/// Release a native struct allocation
///
/// # Safety
///
/// `ptr` must be null or an allocation matching `info` (made by its `copy`
/// function, or by the C allocator for plain structs).
pub unsafe fn free_native_struct(ptr: *mut c_void, info: &StructInfo) {
    if ptr.is_null() {
        return;
    }
    match info.free {
        Some(free) => free(ptr),
        None => libc::free(ptr),
    }
}

/// Struct or union value owned by the scripting side
///
/// The backing memory is released when the last `Rc<BoxedValue>` drops,
/// through the allocator that produced it.
pub struct BoxedValue {
    ptr: NonNull<c_void>,
    info: Arc<StructInfo>,
    /// Allocated here with `calloc` rather than by the type's `copy`
    c_allocated: bool,
}

impl BoxedValue {
    /// Zero-initialised value of a plain struct
    pub fn zeroed(info: &Arc<StructInfo>) -> Option<Self> {
        // SAFETY: calloc has no preconditions
        let raw = unsafe { libc::calloc(info.size.max(1), 1) };
        NonNull::new(raw).map(|ptr| Self {
            ptr,
            info: Arc::clone(info),
            c_allocated: true,
        })
    }

    /// Value initialised from raw bytes of exactly `info.size` length
    pub fn from_bytes(info: &Arc<StructInfo>, bytes: &[u8]) -> Option<Self> {
        if bytes.len() != info.size {
            return None;
        }
        let boxed = Self::zeroed(info)?;
        boxed.write_bytes(0, bytes);
        Some(boxed)
    }

    /// Copy of a native value; the source is not taken over
    ///
    /// # Safety
    ///
    /// `ptr` must point to a valid value of the type described by `info`.
    pub unsafe fn copy_from(ptr: *const c_void, info: &Arc<StructInfo>) -> Option<Self> {
        copy_native(ptr, info).map(|ptr| Self {
            ptr,
            info: Arc::clone(info),
            c_allocated: false,
        })
    }

    pub fn info(&self) -> &Arc<StructInfo> {
        &self.info
    }

    /// Pointer to the value, valid while `self` lives
    pub fn as_ptr(&self) -> *mut c_void {
        self.ptr.as_ptr()
    }

    /// Snapshot of the value's bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.info.size];
        // SAFETY: the allocation holds info.size bytes
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.as_ptr() as *const u8, out.as_mut_ptr(), out.len());
        }
        out
    }

    /// Overwrite bytes starting at `offset`; false if out of bounds
    pub fn write_bytes(&self, offset: usize, bytes: &[u8]) -> bool {
        match offset.checked_add(bytes.len()) {
            Some(end) if end <= self.info.size => {
                // SAFETY: bounds checked against the allocation size
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        bytes.as_ptr(),
                        (self.ptr.as_ptr() as *mut u8).add(offset),
                        bytes.len(),
                    );
                }
                true
            }
            _ => false,
        }
    }

    /// Independent copy for native code to own
    pub fn duplicate_for_native(&self) -> Option<NonNull<c_void>> {
        // SAFETY: self.ptr is a valid value of self.info
        unsafe { copy_native(self.ptr.as_ptr(), &self.info) }
    }
}

impl fmt::Debug for BoxedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoxedValue")
            .field("type", &self.info.name)
            .field("ptr", &self.ptr)
            .finish()
    }
}

impl Drop for BoxedValue {
    fn drop(&mut self) {
        // SAFETY: the allocation is owned by this value
        unsafe {
            if self.c_allocated {
                libc::free(self.ptr.as_ptr())
            } else {
                free_native_struct(self.ptr.as_ptr(), &self.info)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn point_info() -> Arc<StructInfo> {
        Arc::new(StructInfo::plain("Point", 8))
    }

    #[test]
    fn test_from_bytes_checks_size() {
        let info = point_info();
        assert!(BoxedValue::from_bytes(&info, &[0u8; 4]).is_none());
        let boxed = BoxedValue::from_bytes(&info, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        assert_eq!(boxed.to_bytes(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_duplicate_is_independent() {
        let info = point_info();
        let boxed = BoxedValue::from_bytes(&info, &[9u8; 8]).unwrap();
        let copy = boxed.duplicate_for_native().unwrap();

        boxed.write_bytes(0, &[0u8; 8]);
        let copied = unsafe { std::slice::from_raw_parts(copy.as_ptr() as *const u8, 8) };
        assert_eq!(copied, &[9u8; 8]);

        unsafe { free_native_struct(copy.as_ptr(), &info) };
    }

    static COPIES: AtomicUsize = AtomicUsize::new(0);
    static FREES: AtomicUsize = AtomicUsize::new(0);

    unsafe extern "C" fn counted_copy(ptr: *const c_void) -> *mut c_void {
        COPIES.fetch_add(1, Ordering::SeqCst);
        let raw = libc::malloc(8);
        std::ptr::copy_nonoverlapping(ptr as *const u8, raw as *mut u8, 8);
        raw
    }

    unsafe extern "C" fn counted_free(ptr: *mut c_void) {
        FREES.fetch_add(1, Ordering::SeqCst);
        libc::free(ptr);
    }

    #[test]
    fn test_registered_free_only_for_registered_copies() {
        let info = Arc::new(StructInfo::boxed("Counted", 8, counted_copy, counted_free));
        let frees = FREES.load(Ordering::SeqCst);

        let local = BoxedValue::from_bytes(&info, &[4u8; 8]).unwrap();
        let copied = unsafe { BoxedValue::copy_from(local.as_ptr(), &info) }.unwrap();
        assert_eq!(copied.to_bytes(), vec![4u8; 8]);
        assert!(COPIES.load(Ordering::SeqCst) >= 1);

        drop(local);
        assert_eq!(FREES.load(Ordering::SeqCst), frees);
        drop(copied);
        assert_eq!(FREES.load(Ordering::SeqCst), frees + 1);
    }

    #[test]
    fn test_write_out_of_bounds() {
        let boxed = BoxedValue::zeroed(&point_info()).unwrap();
        assert!(!boxed.write_bytes(6, &[0u8; 4]));
        assert!(boxed.write_bytes(4, &[1u8; 4]));
    }
}
