//! libffi call interfaces
//!
//! A `NativeCif` describes the native ABI of one callable: an implicit
//! receiver pointer first when it is a method, then every declared
//! argument, then a trailing error out-pointer when it can throw. Output
//! arguments, structs and callbacks travel as pointers.

use crate::error::SetupError;
use crate::ffi::callable::{ArgInfo, CallableInfo};
use crate::ffi::types::{EnumStorage, NativeArg, TypeTag};
use libffi::low::{ffi_abi_FFI_DEFAULT_ABI, ffi_cif, ffi_type, prep_cif, types};
use std::ffi::c_void;
use std::ptr::addr_of_mut;

/// Register-width integer libffi uses for narrow integral returns
pub(crate) type FfiArg = usize;

/// Prepared libffi call interface
pub struct NativeCif {
    cif: Box<ffi_cif>,
    // prep_cif keeps a pointer into this buffer
    _arg_types: Vec<*mut ffi_type>,
    arg_count: usize,
}

impl NativeCif {
    /// Call interface matching the native ABI of `info`
    pub fn for_callable(info: &CallableInfo) -> Result<Self, SetupError> {
        let mut arg_types = Vec::with_capacity(info.args.len() + 2);
        if info.is_method() {
            arg_types.push(pointer_type());
        }
        arg_types.extend(info.args.iter().map(arg_ffi_type));
        if info.can_throw {
            arg_types.push(pointer_type());
        }

        Self::new(arg_types, value_ffi_type(&info.return_type)).map_err(|reason| {
            SetupError::CallInterface {
                callable: info.name.clone(),
                reason,
            }
        })
    }

    fn new(mut arg_types: Vec<*mut ffi_type>, return_type: *mut ffi_type) -> Result<Self, String> {
        let arg_count = arg_types.len();
        // SAFETY: an all-zero ffi_cif is the documented pre-prep state
        let mut cif: Box<ffi_cif> = Box::new(unsafe { std::mem::zeroed() });
        let atypes = if arg_count > 0 {
            arg_types.as_mut_ptr()
        } else {
            std::ptr::null_mut()
        };

        // SAFETY: cif and atypes are heap-pinned for the lifetime of self
        unsafe {
            prep_cif(&mut *cif, ffi_abi_FFI_DEFAULT_ABI, arg_count, return_type, atypes)
                .map_err(|e| format!("{:?}", e))?;
        }

        Ok(Self {
            cif,
            _arg_types: arg_types,
            arg_count,
        })
    }

    pub fn as_raw_ptr(&self) -> *mut ffi_cif {
        &*self.cif as *const ffi_cif as *mut ffi_cif
    }

    /// Number of native arguments, including receiver and error slot
    pub fn arg_count(&self) -> usize {
        self.arg_count
    }

    /// Perform the call
    ///
    /// # Safety
    ///
    /// `fn_ptr` must be a function with exactly this ABI, and `args` must hold
    /// `arg_count()` pointers to valid argument storage.
    pub unsafe fn call(&self, fn_ptr: *const c_void, ret: &mut NativeArg, args: &mut [*mut c_void]) {
        debug_assert_eq!(args.len(), self.arg_count);
        let target: unsafe extern "C" fn() = std::mem::transmute(fn_ptr);
        let avalue = if args.is_empty() {
            std::ptr::null_mut()
        } else {
            args.as_mut_ptr()
        };
        libffi::raw::ffi_call(self.as_raw_ptr(), Some(target), ret.as_mut_ptr(), avalue);
    }
}

fn pointer_type() -> *mut ffi_type {
    // SAFETY: libffi's builtin type descriptors are never written through
    unsafe { addr_of_mut!(types::pointer) }
}

/// Native type of an argument as it appears in the call
pub(crate) fn arg_ffi_type(arg: &ArgInfo) -> *mut ffi_type {
    if arg.direction.is_output() {
        pointer_type()
    } else {
        value_ffi_type(&arg.ty)
    }
}

/// Native type of a value of `ty`
pub(crate) fn value_ffi_type(ty: &TypeTag) -> *mut ffi_type {
    // SAFETY: libffi's builtin type descriptors are never written through
    unsafe {
        match ty {
            TypeTag::Void => addr_of_mut!(types::void),
            TypeTag::Boolean | TypeTag::Int32 => addr_of_mut!(types::sint32),
            TypeTag::Int8 => addr_of_mut!(types::sint8),
            TypeTag::UInt8 => addr_of_mut!(types::uint8),
            TypeTag::Int16 => addr_of_mut!(types::sint16),
            TypeTag::UInt16 => addr_of_mut!(types::uint16),
            TypeTag::UInt32 | TypeTag::Unichar => addr_of_mut!(types::uint32),
            TypeTag::Int64 => addr_of_mut!(types::sint64),
            TypeTag::UInt64 => addr_of_mut!(types::uint64),
            TypeTag::Float => addr_of_mut!(types::float),
            TypeTag::Double => addr_of_mut!(types::double),
            TypeTag::Enum(info) | TypeTag::Flags(info) => match info.storage {
                EnumStorage::Int32 => addr_of_mut!(types::sint32),
                EnumStorage::UInt32 => addr_of_mut!(types::uint32),
            },
            _ => addr_of_mut!(types::pointer),
        }
    }
}

/// Narrow a libffi return buffer to the slot layout of `ty`
///
/// libffi widens integral returns smaller than a register to `ffi_arg`.
pub(crate) fn narrow_return(raw: &NativeArg, ty: &TypeTag) -> NativeArg {
    if needs_widening(ty) {
        // SAFETY: libffi wrote a full ffi_arg at the start of the buffer
        let wide = unsafe { std::ptr::read(raw as *const NativeArg as *const FfiArg) };
        NativeArg::from_integer(ty, wide as isize as i128)
    } else {
        *raw
    }
}

/// Write a closure return value, widened as libffi expects
///
/// # Safety
///
/// `ret` must be libffi's closure return buffer for a value of `ty`.
pub(crate) unsafe fn write_return(ret: *mut c_void, slot: &NativeArg, ty: &TypeTag) {
    if matches!(ty, TypeTag::Void) {
        return;
    }
    if needs_widening(ty) {
        let value = slot.to_integer(ty).unwrap_or(0);
        // Sign-extend signed types, zero-extend the rest
        let wide = value as i64 as FfiArg;
        std::ptr::write_unaligned(ret as *mut FfiArg, wide);
    } else {
        slot.write_to(ret, ty.native_size());
    }
}

fn needs_widening(ty: &TypeTag) -> bool {
    let integral = ty.integer_range().is_some() || matches!(ty, TypeTag::Boolean | TypeTag::Unichar);
    integral && ty.native_size() < std::mem::size_of::<FfiArg>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ffi::types::{Direction, Transfer};

    #[test]
    fn test_cif_counts_receiver_and_error_slot() {
        let info = CallableInfo::new("method")
            .method(crate::ffi::callable::ReceiverInfo::Error)
            .arg(ArgInfo::new("a", TypeTag::Int32))
            .throws();
        let cif = NativeCif::for_callable(&info).unwrap();
        assert_eq!(cif.arg_count(), 3);
    }

    #[test]
    fn test_out_args_are_pointers() {
        let arg = ArgInfo::out("x", TypeTag::Double);
        assert_eq!(arg.direction, Direction::Out);
        assert_eq!(arg_ffi_type(&arg), pointer_type());
    }

    #[test]
    fn test_narrow_signed_return() {
        // libffi leaves a sign-extended register value for int8 returns
        let mut raw = NativeArg::zeroed();
        unsafe { std::ptr::write(&mut raw as *mut NativeArg as *mut FfiArg, -5i64 as FfiArg) };
        let slot = narrow_return(&raw, &TypeTag::Int8);
        assert_eq!(slot.to_integer(&TypeTag::Int8), Some(-5));
    }

    #[test]
    fn test_write_return_widens() {
        let mut buf: FfiArg = 0;
        let slot = NativeArg::from_integer(&TypeTag::Int16, -2);
        unsafe { write_return(&mut buf as *mut FfiArg as *mut c_void, &slot, &TypeTag::Int16) };
        assert_eq!(buf as isize, -2);

        let info = CallableInfo::new("f").returns(TypeTag::UInt8, Transfer::Nothing);
        assert!(NativeCif::for_callable(&info).is_ok());
    }
}
