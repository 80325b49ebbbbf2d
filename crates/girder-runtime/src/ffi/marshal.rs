//! Argument marshaling - scripting values ↔ native argument slots
//!
//! Provides one conversion per direction plus an explicit release:
//! - `ArgumentMarshaler::to_native()`: scripting value → `NativeArg`
//! - `ArgumentMarshaler::from_native()`: `NativeArg` → scripting value (copying)
//! - `ArgumentMarshaler::release()`: free what this side owns of a slot
//!
//! # Memory Safety
//!
//! - Conversions never free anything; release is always a separate step
//! - `from_native` copies strings, arrays, structs and errors, and takes a
//!   new toggle reference on objects, so the slot stays releasable
//! - Numeric conversions are range-checked per width, never truncated

use crate::ffi::array::ArrayMarshaler;
use crate::ffi::boxed::{free_native_struct, BoxedValue};
use crate::ffi::safety::{
    dup_native_string, free_native, read_native_string, NativeStringError, RawNativeError,
};
use crate::ffi::types::{NativeArg, Transfer, TypeTag};
use crate::lifetime::bridge::ObjectLifetimeBridge;
use crate::value::Value;
use std::ffi::c_void;
use std::fmt;
use std::rc::Rc;
use thiserror::Error;

/// Where a value sits in a call, for error messages
#[derive(Debug, Clone, PartialEq)]
pub enum MarshalRole {
    Argument(String),
    Receiver,
    ReturnValue,
    Field(String),
    Element(usize),
}

impl fmt::Display for MarshalRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarshalRole::Argument(name) => write!(f, "argument '{}'", name),
            MarshalRole::Receiver => write!(f, "receiver"),
            MarshalRole::ReturnValue => write!(f, "return value"),
            MarshalRole::Field(name) => write!(f, "field '{}'", name),
            MarshalRole::Element(index) => write!(f, "element {}", index),
        }
    }
}

/// Marshal error types
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MarshalError {
    #[error("{role}: expected {expected}, got {got}")]
    TypeMismatch {
        role: MarshalRole,
        expected: String,
        got: String,
    },

    #[error("{role}: {value} is out of range for {target}")]
    NumberOutOfRange {
        role: MarshalRole,
        value: String,
        target: String,
    },

    #[error("{role}: {value} is not an integer")]
    NotAnInteger { role: MarshalRole, value: f64 },

    #[error("{role}: null is not allowed")]
    NullNotAllowed { role: MarshalRole },

    #[error("{role}: invalid string: {reason}")]
    InvalidString { role: MarshalRole, reason: String },

    #[error("{role}: {value:#x} is not a unicode scalar value")]
    InvalidUnichar { role: MarshalRole, value: u32 },

    #[error("{role}: {value} is not a valid {target} value")]
    InvalidEnumValue {
        role: MarshalRole,
        value: i128,
        target: String,
    },

    #[error("{role}: {class} object has been disposed")]
    DisposedObject { role: MarshalRole, class: String },

    #[error("{role}: cannot marshal {what}")]
    Unsupported { role: MarshalRole, what: String },

    #[error("{role}: has {found} elements but an array sharing its length has {expected}")]
    SharedLengthMismatch {
        role: MarshalRole,
        expected: usize,
        found: usize,
    },

    #[error("{role}: native allocation failed")]
    AllocationFailed { role: MarshalRole },

    #[error("{role}: object bridge has been shut down")]
    BridgeShutDown { role: MarshalRole },
}

/// Who produced a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotOrigin {
    /// Produced by `to_native` from a scripting value
    Marshaled,
    /// Produced by native code (return values, out arguments)
    Received,
}

/// What this side owns of a slot after a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Ownership {
    pub container: bool,
    pub contents: bool,
    /// Object references and boxed copies are ours to drop
    pub refs: bool,
}

impl Ownership {
    pub(crate) fn after(transfer: Transfer, origin: SlotOrigin) -> Self {
        let (container, contents) = match (origin, transfer) {
            (SlotOrigin::Marshaled, Transfer::Nothing) => (true, true),
            (SlotOrigin::Marshaled, Transfer::Container) => (false, true),
            (SlotOrigin::Marshaled, Transfer::Everything) => (false, false),
            (SlotOrigin::Received, Transfer::Nothing) => (false, false),
            (SlotOrigin::Received, Transfer::Container) => (true, false),
            (SlotOrigin::Received, Transfer::Everything) => (true, true),
        };
        Self {
            container,
            contents,
            refs: origin == SlotOrigin::Received,
        }
    }

    /// Everything `to_native` created, for slots never handed over
    pub(crate) fn unsent(transfer: Transfer) -> Self {
        Self {
            container: true,
            contents: true,
            refs: transfer != Transfer::Nothing,
        }
    }

    /// Ownership of each element given ownership of the array
    pub(crate) fn element(self) -> Self {
        Self {
            container: self.contents,
            contents: self.contents,
            refs: self.refs,
        }
    }
}

/// Transfer applied to the elements of a container
pub(crate) fn element_transfer(transfer: Transfer) -> Transfer {
    match transfer {
        Transfer::Everything => Transfer::Everything,
        _ => Transfer::Nothing,
    }
}

/// Converts single values between scripting and native representation
///
/// Objects are resolved through the lifetime bridge so a native pointer
/// always maps back to the same proxy.
pub struct ArgumentMarshaler<'a> {
    bridge: &'a ObjectLifetimeBridge,
}

impl<'a> ArgumentMarshaler<'a> {
    pub fn new(bridge: &'a ObjectLifetimeBridge) -> Self {
        Self { bridge }
    }

    pub fn bridge(&self) -> &'a ObjectLifetimeBridge {
        self.bridge
    }

    /// Array conversions built on this marshaler
    pub fn arrays(&self) -> ArrayMarshaler<'_, 'a> {
        ArrayMarshaler::new(self)
    }

    /// Marshal a scripting value into a native slot
    ///
    /// `transfer = Everything` hands native code an independently owned
    /// copy (duplicated string/struct, extra object reference). Nothing is
    /// written anywhere on failure.
    pub fn to_native(
        &self,
        value: &Value,
        ty: &TypeTag,
        role: &MarshalRole,
        transfer: Transfer,
        may_be_null: bool,
    ) -> Result<NativeArg, MarshalError> {
        tracing::trace!(role = %role, ty = %ty, transfer = ?transfer, "to_native");

        if value.is_nullish() && ty.is_pointer() {
            return if may_be_null {
                Ok(NativeArg::zeroed())
            } else {
                Err(MarshalError::NullNotAllowed { role: role.clone() })
            };
        }

        match ty {
            TypeTag::Void => Err(MarshalError::Unsupported {
                role: role.clone(),
                what: "a value of type void".to_string(),
            }),

            TypeTag::Boolean => match value {
                Value::Bool(b) => Ok(NativeArg::from_integer(ty, *b as i128)),
                other => Err(mismatch(role, ty, other)),
            },

            TypeTag::Int8
            | TypeTag::UInt8
            | TypeTag::Int16
            | TypeTag::UInt16
            | TypeTag::Int32
            | TypeTag::UInt32
            | TypeTag::Int64
            | TypeTag::UInt64 => {
                let n = integer_from_value(value, ty, role)?;
                Ok(NativeArg::from_integer(ty, n))
            }

            TypeTag::Enum(info) => {
                let n = integer_from_value(value, ty, role)?;
                let valid = i64::try_from(n).map(|v| info.contains(v)).unwrap_or(false);
                if !valid {
                    return Err(MarshalError::InvalidEnumValue {
                        role: role.clone(),
                        value: n,
                        target: info.name.clone(),
                    });
                }
                Ok(NativeArg::from_integer(ty, n))
            }

            TypeTag::Flags(info) => {
                let n = integer_from_value(value, ty, role)?;
                let valid = i64::try_from(n)
                    .map(|v| v & !info.flag_mask() == 0)
                    .unwrap_or(false);
                if !valid {
                    return Err(MarshalError::InvalidEnumValue {
                        role: role.clone(),
                        value: n,
                        target: info.name.clone(),
                    });
                }
                Ok(NativeArg::from_integer(ty, n))
            }

            TypeTag::Float => {
                let n = float_from_value(value, ty, role)?;
                if n.is_finite() && n.abs() > f32::MAX as f64 {
                    return Err(MarshalError::NumberOutOfRange {
                        role: role.clone(),
                        value: n.to_string(),
                        target: "float".to_string(),
                    });
                }
                let mut slot = NativeArg::zeroed();
                slot.v_float = n as f32;
                Ok(slot)
            }

            TypeTag::Double => {
                let mut slot = NativeArg::zeroed();
                slot.v_double = float_from_value(value, ty, role)?;
                Ok(slot)
            }

            TypeTag::Unichar => match value {
                Value::String(s) => {
                    let mut chars = s.chars();
                    let scalar = match (chars.next(), chars.next()) {
                        (None, _) => 0,
                        (Some(c), None) => c as u32,
                        (Some(_), Some(_)) => {
                            return Err(MarshalError::InvalidString {
                                role: role.clone(),
                                reason: "expected a single character".to_string(),
                            })
                        }
                    };
                    Ok(NativeArg::from_integer(ty, scalar as i128))
                }
                other => Err(mismatch(role, ty, other)),
            },

            TypeTag::Utf8 => match value {
                Value::String(s) => {
                    let ptr = dup_native_string(s).map_err(|e| match e {
                        NativeStringError::InteriorNul(nul) => MarshalError::InvalidString {
                            role: role.clone(),
                            reason: nul.to_string(),
                        },
                        NativeStringError::AllocationFailed => {
                            MarshalError::AllocationFailed { role: role.clone() }
                        }
                    })?;
                    Ok(NativeArg::from_pointer(ptr as *mut c_void))
                }
                other => Err(mismatch(role, ty, other)),
            },

            TypeTag::Pointer => Err(MarshalError::Unsupported {
                role: role.clone(),
                what: format!("{} as an opaque pointer", value.type_name()),
            }),

            TypeTag::Struct(info) | TypeTag::Union(info) => match value {
                // A boxed value is its own container, so Container hands over a copy too
                Value::Boxed(boxed) if boxed.info().as_ref() == info.as_ref() => {
                    if transfer != Transfer::Nothing {
                        let copy = boxed
                            .duplicate_for_native()
                            .ok_or_else(|| MarshalError::AllocationFailed { role: role.clone() })?;
                        Ok(NativeArg::from_pointer(copy.as_ptr()))
                    } else {
                        Ok(NativeArg::from_pointer(boxed.as_ptr()))
                    }
                }
                other => Err(mismatch(role, ty, other)),
            },

            TypeTag::Object(class) => match value {
                Value::Object(proxy) if proxy.class().is_a(class) => {
                    let ptr = proxy.native_ptr().ok_or_else(|| MarshalError::DisposedObject {
                        role: role.clone(),
                        class: proxy.class().name.clone(),
                    })?;
                    if transfer != Transfer::Nothing {
                        // SAFETY: ptr is a live object held by the proxy's toggle ref
                        unsafe { (class.ops.ref_object)(ptr) };
                    }
                    Ok(NativeArg::from_pointer(ptr))
                }
                other => Err(mismatch(role, ty, other)),
            },

            TypeTag::Error => match value {
                Value::Error(err) => {
                    let raw = RawNativeError::allocate(err)
                        .ok_or_else(|| MarshalError::AllocationFailed { role: role.clone() })?;
                    Ok(NativeArg::from_pointer(raw as *mut c_void))
                }
                other => Err(mismatch(role, ty, other)),
            },

            TypeTag::Array(info) if info.is_self_sized() => self
                .arrays()
                .to_native(value, info, role, transfer, may_be_null)
                .map(|array| array.data),

            TypeTag::Array(_) => Err(MarshalError::Unsupported {
                role: role.clone(),
                what: "an array whose length lives in another argument".to_string(),
            }),

            TypeTag::Callback(_) => Err(MarshalError::Unsupported {
                role: role.clone(),
                what: "a callback outside a call".to_string(),
            }),
        }
    }

    /// Convert a native slot into a scripting value
    ///
    /// Never takes ownership of the slot's referent; release it separately.
    ///
    /// # Safety
    ///
    /// Pointer slots must be null or point to a valid value of type `ty`.
    pub unsafe fn from_native(
        &self,
        slot: &NativeArg,
        ty: &TypeTag,
        role: &MarshalRole,
    ) -> Result<Value, MarshalError> {
        tracing::trace!(role = %role, ty = %ty, "from_native");

        if ty.is_pointer() && slot.pointer().is_null() {
            return match ty {
                TypeTag::Array(info) if info.is_self_sized() => Ok(Value::Null),
                TypeTag::Array(_) | TypeTag::Callback(_) => Err(MarshalError::Unsupported {
                    role: role.clone(),
                    what: format!("{} outside a call", ty),
                }),
                _ => Ok(Value::Null),
            };
        }

        match ty {
            TypeTag::Void => Ok(Value::Undefined),
            TypeTag::Boolean => Ok(Value::Bool(slot.v_boolean != 0)),
            TypeTag::Float => Ok(Value::Number(slot.v_float as f64)),
            TypeTag::Double => Ok(Value::Number(slot.v_double)),

            TypeTag::Unichar => {
                let scalar = slot.v_uint32;
                if scalar == 0 {
                    return Ok(Value::string(""));
                }
                char::from_u32(scalar)
                    .map(|c| Value::string(c.to_string()))
                    .ok_or_else(|| MarshalError::InvalidUnichar {
                        role: role.clone(),
                        value: scalar,
                    })
            }

            TypeTag::Utf8 => read_native_string(slot.string_ptr())
                .map(Value::string)
                .map_err(|e| MarshalError::InvalidString {
                    role: role.clone(),
                    reason: e.to_string(),
                }),

            TypeTag::Pointer => Ok(Value::integer(slot.pointer() as usize as i128)),

            TypeTag::Struct(info) | TypeTag::Union(info) => {
                BoxedValue::copy_from(slot.pointer(), info)
                    .map(|boxed| Value::Boxed(Rc::new(boxed)))
                    .ok_or_else(|| MarshalError::AllocationFailed { role: role.clone() })
            }

            TypeTag::Object(class) => self
                .bridge
                .wrap(slot.pointer(), class)
                .map(Value::Object)
                .ok_or_else(|| MarshalError::BridgeShutDown { role: role.clone() }),

            TypeTag::Error => Ok(Value::Error(RawNativeError::read(
                slot.pointer() as *const RawNativeError,
            ))),

            TypeTag::Array(info) if info.is_self_sized() => {
                self.arrays().from_native(slot.pointer(), info, None, role)
            }

            TypeTag::Array(_) | TypeTag::Callback(_) => Err(MarshalError::Unsupported {
                role: role.clone(),
                what: format!("{} outside a call", ty),
            }),

            // Integers, enums and flags
            _ => slot
                .to_integer(ty)
                .map(Value::integer)
                .ok_or_else(|| MarshalError::Unsupported {
                    role: role.clone(),
                    what: ty.to_string(),
                }),
        }
    }

    /// Free whatever this side owns of `slot` once it has been consumed
    ///
    /// For `Marshaled` slots this side owns the complement of `transfer`;
    /// for `Received` slots it owns what `transfer` handed over.
    ///
    /// # Safety
    ///
    /// `slot` must come from `to_native` (for `Marshaled`) or from native
    /// code honouring `transfer` (for `Received`), and must not be released
    /// twice.
    pub unsafe fn release(&self, slot: &NativeArg, ty: &TypeTag, transfer: Transfer, origin: SlotOrigin) {
        self.free_slot(slot, ty, Ownership::after(transfer, origin));
    }

    /// Free a `to_native` slot that was never handed to native code
    ///
    /// # Safety
    ///
    /// `slot` must come from `to_native` with the same `ty` and `transfer`.
    pub unsafe fn rollback(&self, slot: &NativeArg, ty: &TypeTag, transfer: Transfer) {
        match ty {
            TypeTag::Array(info) if info.is_self_sized() => {
                self.arrays().rollback(slot.pointer(), info, None, transfer)
            }
            _ => self.free_slot(slot, ty, Ownership::unsent(transfer)),
        }
    }

    pub(crate) unsafe fn free_slot(&self, slot: &NativeArg, ty: &TypeTag, owned: Ownership) {
        let ptr = slot.pointer();
        if !ty.is_pointer() || ptr.is_null() {
            return;
        }

        match ty {
            TypeTag::Utf8 if owned.container => free_native(ptr),
            TypeTag::Error if owned.container => RawNativeError::free(ptr as *mut RawNativeError),
            TypeTag::Struct(info) | TypeTag::Union(info) if owned.container && owned.refs => {
                free_native_struct(ptr, info)
            }
            TypeTag::Object(class) if owned.container && owned.refs => {
                (class.ops.unref_object)(ptr)
            }
            TypeTag::Array(info) if info.is_self_sized() => {
                self.arrays().free_array(ptr, info, None, owned)
            }
            _ => {}
        }
    }
}

fn mismatch(role: &MarshalRole, ty: &TypeTag, got: &Value) -> MarshalError {
    MarshalError::TypeMismatch {
        role: role.clone(),
        expected: ty.display_name(),
        got: got.type_name().to_string(),
    }
}

/// Exact integer carried by a scripting value, range-checked for `ty`
fn integer_from_value(value: &Value, ty: &TypeTag, role: &MarshalRole) -> Result<i128, MarshalError> {
    let n = match value {
        Value::Number(n) => {
            if !n.is_finite() || n.fract() != 0.0 {
                return Err(MarshalError::NotAnInteger {
                    role: role.clone(),
                    value: *n,
                });
            }
            *n as i128
        }
        Value::BigInt(n) => *n,
        other => return Err(mismatch(role, ty, other)),
    };

    let (min, max) = ty.integer_range().ok_or_else(|| mismatch(role, ty, value))?;
    if n < min || n > max {
        return Err(MarshalError::NumberOutOfRange {
            role: role.clone(),
            value: value.to_string(),
            target: ty.display_name(),
        });
    }
    Ok(n)
}

fn float_from_value(value: &Value, ty: &TypeTag, role: &MarshalRole) -> Result<f64, MarshalError> {
    match value {
        Value::Number(n) => Ok(*n),
        Value::BigInt(n) => Ok(*n as f64),
        other => Err(mismatch(role, ty, other)),
    }
}
