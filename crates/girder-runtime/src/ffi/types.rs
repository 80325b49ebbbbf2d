//! Type descriptors - the runtime shape of native values
//!
//! Defines:
//! - `TypeTag`: closed set of native type tags a descriptor can carry
//! - `Direction`, `Transfer`, `Scope`: per-argument passing conventions
//! - `StructInfo`, `EnumInfo`, `ObjectClass`: per-kind metadata
//! - `NativeArg`: one native argument slot
//!
//! Type mapping:
//! - Boolean → c_int (0 or 1)
//! - Int8..UInt64 → fixed-width integers
//! - Float / Double → f32 / f64
//! - Unichar → u32 unicode scalar
//! - Utf8 → *mut c_char (NUL-terminated)
//! - Struct / Union / Object / Error / Array / Callback → pointer
//! - Enum / Flags → i32 / u32 storage

use crate::ffi::callable::CallableInfo;
use std::ffi::c_void;
use std::fmt;
use std::os::raw::{c_char, c_int};
use std::sync::Arc;

/// Argument passing direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Direction {
    #[default]
    In,
    Out,
    InOut,
}

impl Direction {
    /// Carries a value from the caller into the callee
    pub fn is_input(self) -> bool {
        matches!(self, Direction::In | Direction::InOut)
    }

    /// Carries a value from the callee back to the caller
    pub fn is_output(self) -> bool {
        matches!(self, Direction::Out | Direction::InOut)
    }
}

/// Ownership transfer rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Transfer {
    /// Both sides keep their own view
    #[default]
    Nothing,
    /// Only the outer container changes hands
    Container,
    /// The container and every element change hands
    Everything,
}

/// Callback lifetime category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Scope {
    /// Valid only during the native call it was passed to
    #[default]
    Call,
    /// Valid until invoked exactly once
    Async,
    /// Valid until a native destroy-notify fires
    Notified,
}

/// `copy` function of a registered boxed type
pub type CopyFn = unsafe extern "C" fn(*const c_void) -> *mut c_void;
/// `free` function of a registered boxed type
pub type FreeFn = unsafe extern "C" fn(*mut c_void);

/// Layout of a struct or union
///
/// Boxed types register `copy` and `free`; plain structs are copied with
/// `memcpy` into a C allocation and released with `free`.
#[derive(Debug, Clone)]
pub struct StructInfo {
    pub name: String,
    pub size: usize,
    pub copy: Option<CopyFn>,
    pub free: Option<FreeFn>,
}

impl StructInfo {
    pub fn plain(name: impl Into<String>, size: usize) -> Self {
        Self {
            name: name.into(),
            size,
            copy: None,
            free: None,
        }
    }

    pub fn boxed(name: impl Into<String>, size: usize, copy: CopyFn, free: FreeFn) -> Self {
        Self {
            name: name.into(),
            size,
            copy: Some(copy),
            free: Some(free),
        }
    }
}

impl PartialEq for StructInfo {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.size == other.size
    }
}

/// Storage width of an enum or flags type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnumStorage {
    Int32,
    UInt32,
}

/// Enum or flags type with its declared members
#[derive(Debug, Clone, PartialEq)]
pub struct EnumInfo {
    pub name: String,
    pub storage: EnumStorage,
    pub values: Vec<(String, i64)>,
}

impl EnumInfo {
    pub fn new(name: impl Into<String>, storage: EnumStorage, values: &[(&str, i64)]) -> Self {
        Self {
            name: name.into(),
            storage,
            values: values
                .iter()
                .map(|(n, v)| (n.to_string(), *v))
                .collect(),
        }
    }

    pub fn contains(&self, value: i64) -> bool {
        self.values.iter().any(|(_, v)| *v == value)
    }

    /// Union of every declared flag bit
    pub fn flag_mask(&self) -> i64 {
        self.values.iter().fold(0, |mask, (_, v)| mask | v)
    }
}

/// Native toggle-notify callback: `(data, object, is_last_ref)`
pub type ToggleNotifyFn =
    unsafe extern "C" fn(data: *mut c_void, object: *mut c_void, is_last_ref: c_int);

/// Refcounting entry points of an object type system
#[derive(Debug, Clone, Copy)]
pub struct ObjectOps {
    pub ref_object: unsafe extern "C" fn(*mut c_void) -> *mut c_void,
    pub unref_object: unsafe extern "C" fn(*mut c_void),
    pub add_toggle_ref: unsafe extern "C" fn(*mut c_void, ToggleNotifyFn, *mut c_void),
    pub remove_toggle_ref: unsafe extern "C" fn(*mut c_void, ToggleNotifyFn, *mut c_void),
}

/// Class of a refcounted native object
#[derive(Debug, Clone)]
pub struct ObjectClass {
    pub name: String,
    pub parent: Option<Arc<ObjectClass>>,
    /// Native class-structure pointer, passed for class receivers
    pub class_struct: usize,
    pub ops: ObjectOps,
}

impl ObjectClass {
    pub fn new(name: impl Into<String>, ops: ObjectOps) -> Self {
        Self {
            name: name.into(),
            parent: None,
            class_struct: 0,
            ops,
        }
    }

    /// Derive a subclass sharing this class's refcounting ops
    pub fn subclass(parent: &Arc<ObjectClass>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parent: Some(Arc::clone(parent)),
            class_struct: 0,
            ops: parent.ops,
        }
    }

    /// Whether this class is `ancestor` or derives from it
    pub fn is_a(&self, ancestor: &ObjectClass) -> bool {
        let mut current = Some(self);
        while let Some(class) = current {
            if class.name == ancestor.name {
                return true;
            }
            current = class.parent.as_deref();
        }
        false
    }
}

impl PartialEq for ObjectClass {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

/// C-style array shape
///
/// Exactly how the element count is found: a sibling length argument, a
/// fixed size, or a zero terminator. A descriptor with none of them is
/// rejected when the call descriptor is built.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayInfo {
    pub element: TypeTag,
    pub length_arg: Option<usize>,
    pub fixed_size: Option<usize>,
    pub zero_terminated: bool,
}

impl ArrayInfo {
    pub fn with_length_arg(element: TypeTag, length_arg: usize) -> Self {
        Self {
            element,
            length_arg: Some(length_arg),
            fixed_size: None,
            zero_terminated: false,
        }
    }

    pub fn fixed(element: TypeTag, size: usize) -> Self {
        Self {
            element,
            length_arg: None,
            fixed_size: Some(size),
            zero_terminated: false,
        }
    }

    pub fn zero_terminated(element: TypeTag) -> Self {
        Self {
            element,
            length_arg: None,
            fixed_size: None,
            zero_terminated: true,
        }
    }

    /// The element count can be found without a sibling argument
    pub fn is_self_sized(&self) -> bool {
        self.fixed_size.is_some() || self.zero_terminated
    }
}

/// Native type tag
#[derive(Debug, Clone, PartialEq)]
pub enum TypeTag {
    Void,
    Boolean,
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float,
    Double,
    Unichar,
    Utf8,
    /// Untyped pointer; only `null` crosses from script
    Pointer,
    Array(Box<ArrayInfo>),
    Struct(Arc<StructInfo>),
    Union(Arc<StructInfo>),
    Object(Arc<ObjectClass>),
    Enum(Arc<EnumInfo>),
    Flags(Arc<EnumInfo>),
    Callback(Arc<CallableInfo>),
    Error,
}

impl TypeTag {
    /// Size of the value as stored in an array element or a struct field
    pub fn native_size(&self) -> usize {
        match self {
            TypeTag::Void => 0,
            TypeTag::Int8 | TypeTag::UInt8 => 1,
            TypeTag::Int16 | TypeTag::UInt16 => 2,
            TypeTag::Boolean
            | TypeTag::Int32
            | TypeTag::UInt32
            | TypeTag::Float
            | TypeTag::Unichar
            | TypeTag::Enum(_)
            | TypeTag::Flags(_) => 4,
            TypeTag::Int64 | TypeTag::UInt64 | TypeTag::Double => 8,
            TypeTag::Utf8
            | TypeTag::Pointer
            | TypeTag::Array(_)
            | TypeTag::Struct(_)
            | TypeTag::Union(_)
            | TypeTag::Object(_)
            | TypeTag::Callback(_)
            | TypeTag::Error => std::mem::size_of::<*mut c_void>(),
        }
    }

    /// Inclusive range of an integer-like tag
    pub fn integer_range(&self) -> Option<(i128, i128)> {
        let range = match self {
            TypeTag::Int8 => (i8::MIN as i128, i8::MAX as i128),
            TypeTag::UInt8 => (0, u8::MAX as i128),
            TypeTag::Int16 => (i16::MIN as i128, i16::MAX as i128),
            TypeTag::UInt16 => (0, u16::MAX as i128),
            TypeTag::Int32 => (i32::MIN as i128, i32::MAX as i128),
            TypeTag::UInt32 => (0, u32::MAX as i128),
            TypeTag::Int64 => (i64::MIN as i128, i64::MAX as i128),
            TypeTag::UInt64 => (0, u64::MAX as i128),
            TypeTag::Enum(info) | TypeTag::Flags(info) => match info.storage {
                EnumStorage::Int32 => (i32::MIN as i128, i32::MAX as i128),
                EnumStorage::UInt32 => (0, u32::MAX as i128),
            },
            _ => return None,
        };
        Some(range)
    }

    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            TypeTag::Int8
                | TypeTag::UInt8
                | TypeTag::Int16
                | TypeTag::UInt16
                | TypeTag::Int32
                | TypeTag::UInt32
                | TypeTag::Int64
                | TypeTag::UInt64
        )
    }

    /// Passed as a pointer in the native slot
    pub fn is_pointer(&self) -> bool {
        matches!(
            self,
            TypeTag::Utf8
                | TypeTag::Pointer
                | TypeTag::Array(_)
                | TypeTag::Struct(_)
                | TypeTag::Union(_)
                | TypeTag::Object(_)
                | TypeTag::Callback(_)
                | TypeTag::Error
        )
    }

    pub fn display_name(&self) -> String {
        match self {
            TypeTag::Void => "void".to_string(),
            TypeTag::Boolean => "boolean".to_string(),
            TypeTag::Int8 => "int8".to_string(),
            TypeTag::UInt8 => "uint8".to_string(),
            TypeTag::Int16 => "int16".to_string(),
            TypeTag::UInt16 => "uint16".to_string(),
            TypeTag::Int32 => "int32".to_string(),
            TypeTag::UInt32 => "uint32".to_string(),
            TypeTag::Int64 => "int64".to_string(),
            TypeTag::UInt64 => "uint64".to_string(),
            TypeTag::Float => "float".to_string(),
            TypeTag::Double => "double".to_string(),
            TypeTag::Unichar => "unichar".to_string(),
            TypeTag::Utf8 => "utf8".to_string(),
            TypeTag::Pointer => "pointer".to_string(),
            TypeTag::Array(info) => format!("{}[]", info.element.display_name()),
            TypeTag::Struct(info) | TypeTag::Union(info) => info.name.clone(),
            TypeTag::Object(class) => class.name.clone(),
            TypeTag::Enum(info) | TypeTag::Flags(info) => info.name.clone(),
            TypeTag::Callback(info) => format!("callback {}", info.name),
            TypeTag::Error => "error".to_string(),
        }
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display_name())
    }
}

/// One native argument slot
///
/// Every field starts at offset 0, so the first `native_size()` bytes of a
/// slot are exactly the native value regardless of byte order.
#[repr(C)]
#[derive(Clone, Copy)]
pub union NativeArg {
    pub v_boolean: c_int,
    pub v_int8: i8,
    pub v_uint8: u8,
    pub v_int16: i16,
    pub v_uint16: u16,
    pub v_int32: i32,
    pub v_uint32: u32,
    pub v_int64: i64,
    pub v_uint64: u64,
    pub v_float: f32,
    pub v_double: f64,
    pub v_pointer: *mut c_void,
}

impl NativeArg {
    pub const fn zeroed() -> Self {
        NativeArg { v_uint64: 0 }
    }

    pub fn from_pointer(ptr: *mut c_void) -> Self {
        let mut arg = Self::zeroed();
        arg.v_pointer = ptr;
        arg
    }

    pub fn pointer(&self) -> *mut c_void {
        // SAFETY: slots are always fully initialised from zeroed()
        unsafe { self.v_pointer }
    }

    pub fn string_ptr(&self) -> *mut c_char {
        self.pointer() as *mut c_char
    }

    /// Address of the slot itself, as passed for out parameters
    pub fn as_mut_ptr(&mut self) -> *mut c_void {
        self as *mut NativeArg as *mut c_void
    }

    /// Integer slot holding `value` in the width of `tag`
    ///
    /// The value must already be range-checked; it is truncated otherwise.
    pub fn from_integer(tag: &TypeTag, value: i128) -> Self {
        let mut arg = Self::zeroed();
        match tag {
            TypeTag::Boolean => arg.v_boolean = (value != 0) as c_int,
            TypeTag::Int8 => arg.v_int8 = value as i8,
            TypeTag::UInt8 => arg.v_uint8 = value as u8,
            TypeTag::Int16 => arg.v_int16 = value as i16,
            TypeTag::UInt16 => arg.v_uint16 = value as u16,
            TypeTag::Int32 => arg.v_int32 = value as i32,
            TypeTag::UInt32 | TypeTag::Unichar => arg.v_uint32 = value as u32,
            TypeTag::Int64 => arg.v_int64 = value as i64,
            TypeTag::UInt64 => arg.v_uint64 = value as u64,
            TypeTag::Enum(info) | TypeTag::Flags(info) => match info.storage {
                EnumStorage::Int32 => arg.v_int32 = value as i32,
                EnumStorage::UInt32 => arg.v_uint32 = value as u32,
            },
            _ => arg.v_uint64 = value as u64,
        }
        arg
    }

    /// Integer held by an integer-like slot
    pub fn to_integer(&self, tag: &TypeTag) -> Option<i128> {
        // SAFETY: every field is plain data and the slot is fully initialised
        unsafe {
            let value = match tag {
                TypeTag::Boolean => self.v_boolean as i128,
                TypeTag::Int8 => self.v_int8 as i128,
                TypeTag::UInt8 => self.v_uint8 as i128,
                TypeTag::Int16 => self.v_int16 as i128,
                TypeTag::UInt16 => self.v_uint16 as i128,
                TypeTag::Int32 => self.v_int32 as i128,
                TypeTag::UInt32 | TypeTag::Unichar => self.v_uint32 as i128,
                TypeTag::Int64 => self.v_int64 as i128,
                TypeTag::UInt64 => self.v_uint64 as i128,
                TypeTag::Enum(info) | TypeTag::Flags(info) => match info.storage {
                    EnumStorage::Int32 => self.v_int32 as i128,
                    EnumStorage::UInt32 => self.v_uint32 as i128,
                },
                _ => return None,
            };
            Some(value)
        }
    }

    /// Read `size` bytes from native memory into a fresh slot
    ///
    /// # Safety
    ///
    /// `src` must be valid for reads of `size` bytes and `size <= 8`.
    pub unsafe fn read_from(src: *const c_void, size: usize) -> Self {
        let mut arg = Self::zeroed();
        std::ptr::copy_nonoverlapping(
            src as *const u8,
            &mut arg as *mut NativeArg as *mut u8,
            size.min(std::mem::size_of::<NativeArg>()),
        );
        arg
    }

    /// Write the first `size` bytes of the slot to native memory
    ///
    /// # Safety
    ///
    /// `dst` must be valid for writes of `size` bytes and `size <= 8`.
    pub unsafe fn write_to(&self, dst: *mut c_void, size: usize) {
        std::ptr::copy_nonoverlapping(
            self as *const NativeArg as *const u8,
            dst as *mut u8,
            size.min(std::mem::size_of::<NativeArg>()),
        );
    }

    /// Whether the first `size` bytes are all zero (array terminator)
    pub fn is_zero(&self, size: usize) -> bool {
        // SAFETY: the slot is 8 initialised bytes
        let bytes: [u8; 8] = unsafe { std::mem::transmute(*self) };
        bytes[..size.min(8)].iter().all(|b| *b == 0)
    }
}

impl Default for NativeArg {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl fmt::Debug for NativeArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // SAFETY: every bit pattern is a valid u64
        write!(f, "NativeArg({:#018x})", unsafe { self.v_uint64 })
    }
}
