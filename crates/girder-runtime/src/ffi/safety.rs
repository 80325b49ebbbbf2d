//! Safe wrappers for native allocations
//!
//! Everything that may be handed to native code is allocated with the C
//! allocator, so native code can free what it takes ownership of.

use crate::value::NativeError;
use std::ffi::{c_void, CStr, CString, NulError};
use std::os::raw::{c_char, c_int};
use std::ptr::NonNull;

/// RAII wrapper for a zeroed C allocation
///
/// Frees the allocation on drop unless ownership is taken with
/// [`NativeBuffer::into_raw`].
pub struct NativeBuffer {
    ptr: NonNull<u8>,
    len: usize,
}

impl NativeBuffer {
    /// Allocate `len` zeroed bytes; `None` if the allocator fails
    ///
    /// Zero-length requests still allocate one byte so the pointer is unique.
    pub fn zeroed(len: usize) -> Option<Self> {
        // SAFETY: calloc has no preconditions
        let raw = unsafe { libc::calloc(len.max(1), 1) } as *mut u8;
        NonNull::new(raw).map(|ptr| Self { ptr, len })
    }

    pub fn as_ptr(&self) -> *mut c_void {
        self.ptr.as_ptr() as *mut c_void
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the allocation holds `len` initialised bytes
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Release ownership of the allocation to the caller
    pub fn into_raw(self) -> *mut c_void {
        let ptr = self.as_ptr();
        std::mem::forget(self);
        ptr
    }
}

impl Drop for NativeBuffer {
    fn drop(&mut self) {
        // SAFETY: allocated with calloc and not yet released
        unsafe { libc::free(self.ptr.as_ptr() as *mut c_void) }
    }
}

/// Native string allocation failure
#[derive(Debug)]
pub enum NativeStringError {
    InteriorNul(NulError),
    AllocationFailed,
}

/// Duplicate `s` into a NUL-terminated C allocation
///
/// The result must be released with [`free_native`].
pub fn dup_native_string(s: &str) -> Result<*mut c_char, NativeStringError> {
    let owned = CString::new(s).map_err(NativeStringError::InteriorNul)?;
    let bytes = owned.as_bytes_with_nul();
    // SAFETY: malloc has no preconditions; the copy stays inside the allocation
    unsafe {
        let ptr = libc::malloc(bytes.len()) as *mut c_char;
        if ptr.is_null() {
            return Err(NativeStringError::AllocationFailed);
        }
        std::ptr::copy_nonoverlapping(bytes.as_ptr() as *const c_char, ptr, bytes.len());
        Ok(ptr)
    }
}

/// Copy a NUL-terminated native string
///
/// # Safety
///
/// `ptr` must be non-null and point to a NUL-terminated string.
pub unsafe fn read_native_string(ptr: *const c_char) -> Result<String, std::str::Utf8Error> {
    CStr::from_ptr(ptr).to_str().map(str::to_owned)
}

/// Release memory obtained from the C allocator
///
/// # Safety
///
/// `ptr` must be null or a live allocation from malloc/calloc.
pub unsafe fn free_native(ptr: *mut c_void) {
    if !ptr.is_null() {
        libc::free(ptr);
    }
}

/// Native error record as laid out in C
#[repr(C)]
#[derive(Debug)]
pub struct RawNativeError {
    pub domain: u32,
    pub code: c_int,
    pub message: *mut c_char,
}

impl RawNativeError {
    /// Allocate a native error record; `None` if the allocator fails
    pub fn allocate(error: &NativeError) -> Option<*mut RawNativeError> {
        let message = dup_native_string(&error.message.replace('\0', " ")).ok()?;
        // SAFETY: malloc has no preconditions; the record is fully written
        unsafe {
            let raw = libc::malloc(std::mem::size_of::<RawNativeError>()) as *mut RawNativeError;
            if raw.is_null() {
                free_native(message as *mut c_void);
                return None;
            }
            raw.write(RawNativeError {
                domain: error.domain,
                code: error.code,
                message,
            });
            Some(raw)
        }
    }

    /// Copy a native error record into a `NativeError`
    ///
    /// # Safety
    ///
    /// `raw` must point to a valid record.
    pub unsafe fn read(raw: *const RawNativeError) -> NativeError {
        let record = &*raw;
        let message = if record.message.is_null() {
            String::new()
        } else {
            CStr::from_ptr(record.message).to_string_lossy().into_owned()
        };
        NativeError {
            domain: record.domain,
            code: record.code,
            message,
        }
    }

    /// Release a record and its message
    ///
    /// # Safety
    ///
    /// `raw` must be null or a record allocated with the C allocator.
    pub unsafe fn free(raw: *mut RawNativeError) {
        if raw.is_null() {
            return;
        }
        free_native((*raw).message as *mut c_void);
        libc::free(raw as *mut c_void);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_buffer_is_zeroed() {
        let buf = NativeBuffer::zeroed(16).unwrap();
        assert_eq!(buf.len(), 16);
        assert!(buf.as_slice().iter().all(|b| *b == 0));
    }

    #[test]
    fn test_native_buffer_into_raw() {
        let buf = NativeBuffer::zeroed(4).unwrap();
        let raw = buf.into_raw();
        assert!(!raw.is_null());
        unsafe { free_native(raw) };
    }

    #[test]
    fn test_string_dup_round_trip() {
        let ptr = dup_native_string("héllo").unwrap();
        let back = unsafe { read_native_string(ptr) }.unwrap();
        assert_eq!(back, "héllo");
        unsafe { free_native(ptr as *mut c_void) };
    }

    #[test]
    fn test_string_with_nul_rejected() {
        assert!(matches!(
            dup_native_string("a\0b"),
            Err(NativeStringError::InteriorNul(_))
        ));
    }

    #[test]
    fn test_raw_error_round_trip() {
        let err = NativeError::new(12, -3, "file not found");
        let raw = RawNativeError::allocate(&err).unwrap();
        let back = unsafe { RawNativeError::read(raw) };
        unsafe { RawNativeError::free(raw) };
        assert_eq!(back, err);
    }
}
