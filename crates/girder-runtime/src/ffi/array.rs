//! C-style array marshaling
//!
//! A native array is a `(pointer, length)` pair. The length is carried by a
//! sibling argument, a fixed size, or a zero terminator, as the
//! `ArrayInfo` says. Element conversions go through `ArgumentMarshaler`.

use crate::ffi::marshal::{element_transfer, ArgumentMarshaler, MarshalError, MarshalRole, Ownership, SlotOrigin};
use crate::ffi::safety::{free_native, NativeBuffer};
use crate::ffi::types::{ArrayInfo, NativeArg, Transfer, TypeTag};
use crate::value::Value;
use std::ffi::c_void;

/// Marshaled array: the data slot plus the element count for the sibling
#[derive(Debug, Clone, Copy)]
pub struct NativeArray {
    pub data: NativeArg,
    pub length: usize,
}

impl NativeArray {
    pub fn null() -> Self {
        Self {
            data: NativeArg::zeroed(),
            length: 0,
        }
    }
}

/// Array conversions layered on an [`ArgumentMarshaler`]
pub struct ArrayMarshaler<'m, 'a> {
    marshaler: &'m ArgumentMarshaler<'a>,
}

impl<'m, 'a> ArrayMarshaler<'m, 'a> {
    pub fn new(marshaler: &'m ArgumentMarshaler<'a>) -> Self {
        Self { marshaler }
    }

    /// Marshal a scripting sequence into a C-allocated array
    ///
    /// `uint8`/`int8` arrays also accept a string, taken as its UTF-8 bytes.
    /// Zero-terminated arrays get one extra zeroed element.
    pub fn to_native(
        &self,
        value: &Value,
        info: &ArrayInfo,
        role: &MarshalRole,
        transfer: Transfer,
        may_be_null: bool,
    ) -> Result<NativeArray, MarshalError> {
        match value {
            v if v.is_nullish() => {
                if may_be_null {
                    Ok(NativeArray::null())
                } else {
                    Err(MarshalError::NullNotAllowed { role: role.clone() })
                }
            }
            Value::String(s) if matches!(info.element, TypeTag::UInt8 | TypeTag::Int8) => {
                self.bytes_to_native(s.as_bytes(), info, role)
            }
            Value::Array(items) => self.items_to_native(items.as_slice(), info, role, transfer),
            other => Err(MarshalError::TypeMismatch {
                role: role.clone(),
                expected: format!("array of {}", info.element),
                got: other.type_name().to_string(),
            }),
        }
    }

    fn check_fixed_size(&self, len: usize, info: &ArrayInfo, role: &MarshalRole) -> Result<(), MarshalError> {
        match info.fixed_size {
            Some(size) if size != len => Err(MarshalError::TypeMismatch {
                role: role.clone(),
                expected: format!("array of length {}", size),
                got: format!("array of length {}", len),
            }),
            _ => Ok(()),
        }
    }

    fn allocate(&self, len: usize, info: &ArrayInfo, role: &MarshalRole) -> Result<NativeBuffer, MarshalError> {
        let size = info.element.native_size();
        if size == 0 {
            return Err(MarshalError::Unsupported {
                role: role.clone(),
                what: format!("array of {}", info.element),
            });
        }
        let capacity = len + usize::from(info.zero_terminated);
        capacity
            .checked_mul(size)
            .and_then(NativeBuffer::zeroed)
            .ok_or_else(|| MarshalError::AllocationFailed { role: role.clone() })
    }

    fn bytes_to_native(&self, bytes: &[u8], info: &ArrayInfo, role: &MarshalRole) -> Result<NativeArray, MarshalError> {
        self.check_fixed_size(bytes.len(), info, role)?;
        let buf = self.allocate(bytes.len(), info, role)?;
        // SAFETY: the buffer holds at least bytes.len() one-byte elements
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), buf.as_ptr() as *mut u8, bytes.len());
        }
        Ok(NativeArray {
            data: NativeArg::from_pointer(buf.into_raw()),
            length: bytes.len(),
        })
    }

    fn items_to_native(
        &self,
        items: &[Value],
        info: &ArrayInfo,
        role: &MarshalRole,
        transfer: Transfer,
    ) -> Result<NativeArray, MarshalError> {
        self.check_fixed_size(items.len(), info, role)?;
        let buf = self.allocate(items.len(), info, role)?;
        let elem = &info.element;
        let size = elem.native_size();
        let elem_transfer = element_transfer(transfer);

        for (i, item) in items.iter().enumerate() {
            match self
                .marshaler
                .to_native(item, elem, &MarshalRole::Element(i), elem_transfer, false)
            {
                // SAFETY: element i lies inside the buffer
                Ok(slot) => unsafe { slot.write_to(element_ptr(buf.as_ptr(), i, size), size) },
                Err(e) => {
                    for j in 0..i {
                        // SAFETY: elements 0..i were written above
                        unsafe {
                            let done = NativeArg::read_from(element_ptr(buf.as_ptr(), j, size), size);
                            self.marshaler.rollback(&done, elem, elem_transfer);
                        }
                    }
                    return Err(e);
                }
            }
        }

        tracing::trace!(role = %role, length = items.len(), "array to_native");
        Ok(NativeArray {
            data: NativeArg::from_pointer(buf.into_raw()),
            length: items.len(),
        })
    }

    /// Copy a native array into a scripting sequence
    ///
    /// `length` comes from the sibling argument; without one the fixed size
    /// or the terminator decides. A null pointer is `null`, except that a
    /// null pointer with an explicit length of zero is an empty sequence.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or point to an array matching `info` and `length`.
    pub unsafe fn from_native(
        &self,
        ptr: *mut c_void,
        info: &ArrayInfo,
        length: Option<usize>,
        role: &MarshalRole,
    ) -> Result<Value, MarshalError> {
        if ptr.is_null() {
            return Ok(match length {
                Some(0) => Value::array(Vec::new()),
                _ => Value::Null,
            });
        }

        let elem = &info.element;
        let size = elem.native_size();
        let count = element_count(ptr, info, length);
        let mut items = Vec::with_capacity(count);
        for i in 0..count {
            let slot = NativeArg::read_from(element_ptr(ptr, i, size), size);
            items.push(self.marshaler.from_native(&slot, elem, &MarshalRole::Element(i))?);
        }
        tracing::trace!(role = %role, length = count, "array from_native");
        Ok(Value::array(items))
    }

    /// Release an array this side owns part of
    ///
    /// # Safety
    ///
    /// Same contract as [`ArgumentMarshaler::release`].
    pub unsafe fn release(
        &self,
        ptr: *mut c_void,
        info: &ArrayInfo,
        length: Option<usize>,
        transfer: Transfer,
        origin: SlotOrigin,
    ) {
        self.free_array(ptr, info, length, Ownership::after(transfer, origin));
    }

    /// Release an array produced by `to_native` that native code never saw
    ///
    /// # Safety
    ///
    /// `ptr` must come from `to_native` with the same `info` and `transfer`.
    pub unsafe fn rollback(&self, ptr: *mut c_void, info: &ArrayInfo, length: Option<usize>, transfer: Transfer) {
        // Elements were marshaled with the element transfer, not the array's
        self.free_array(ptr, info, length, Ownership::unsent(element_transfer(transfer)));
    }

    pub(crate) unsafe fn free_array(
        &self,
        ptr: *mut c_void,
        info: &ArrayInfo,
        length: Option<usize>,
        owned: Ownership,
    ) {
        if ptr.is_null() {
            return;
        }
        if owned.contents && info.element.is_pointer() {
            let size = info.element.native_size();
            let elem_owned = owned.element();
            for i in 0..element_count(ptr, info, length) {
                let slot = NativeArg::read_from(element_ptr(ptr, i, size), size);
                self.marshaler.free_slot(&slot, &info.element, elem_owned);
            }
        }
        if owned.container {
            free_native(ptr);
        }
    }

    /// Slot for the length sibling, range-checked for its integer type
    pub fn length_to_native(&self, length: usize, ty: &TypeTag, role: &MarshalRole) -> Result<NativeArg, MarshalError> {
        let (_, max) = ty.integer_range().ok_or_else(|| MarshalError::Unsupported {
            role: role.clone(),
            what: format!("array length of type {}", ty),
        })?;
        if length as i128 > max {
            return Err(MarshalError::NumberOutOfRange {
                role: role.clone(),
                value: length.to_string(),
                target: ty.display_name(),
            });
        }
        Ok(NativeArg::from_integer(ty, length as i128))
    }

    /// Element count held by a length sibling; negative counts read as zero
    pub fn length_from_native(&self, slot: &NativeArg, ty: &TypeTag) -> usize {
        slot.to_integer(ty)
            .map(|n| usize::try_from(n).unwrap_or(0))
            .unwrap_or(0)
    }
}

fn element_ptr(base: *mut c_void, index: usize, size: usize) -> *mut c_void {
    (base as *mut u8).wrapping_add(index * size) as *mut c_void
}

/// Number of elements: explicit length, fixed size, or position of the terminator
unsafe fn element_count(ptr: *mut c_void, info: &ArrayInfo, length: Option<usize>) -> usize {
    if let Some(n) = length.or(info.fixed_size) {
        return n;
    }
    if !info.zero_terminated {
        return 0;
    }
    let size = info.element.native_size();
    let mut count = 0;
    while !NativeArg::read_from(element_ptr(ptr, count, size), size).is_zero(size) {
        count += 1;
    }
    count
}
