//! Marshaling tests through the public `ArgumentMarshaler`

mod common;

use common::*;
use common::{assert_eq, assert_ne};
use girder_runtime::ffi::boxed::free_native_struct;
use girder_runtime::ffi::{ArrayInfo, BoxedValue, EnumInfo, EnumStorage, SlotOrigin, StructInfo, Transfer};
use girder_runtime::{MarshalError, MarshalRole, TypeTag, Value};
use proptest::prelude::*;
use rstest::rstest;
use std::rc::Rc;
use std::sync::Arc;

fn role() -> MarshalRole {
    MarshalRole::Argument("value".to_string())
}

fn round_trip(value: &Value, ty: &TypeTag) -> Result<Value, MarshalError> {
    let rt = runtime();
    let marshaler = rt.marshaler();
    let slot = marshaler.to_native(value, ty, &role(), Transfer::Nothing, false)?;
    let back = unsafe { marshaler.from_native(&slot, ty, &role()) };
    unsafe { marshaler.release(&slot, ty, Transfer::Nothing, SlotOrigin::Marshaled) };
    back
}

// ===== Integer ranges =====

#[rstest]
#[case(TypeTag::Int8, -128.0, true)]
#[case(TypeTag::Int8, 128.0, false)]
#[case(TypeTag::UInt8, -1.0, false)]
#[case(TypeTag::UInt16, 65535.0, true)]
#[case(TypeTag::Int32, 2147483648.0, false)]
#[case(TypeTag::UInt32, 4294967295.0, true)]
fn test_integer_bounds(#[case] ty: TypeTag, #[case] n: f64, #[case] fits: bool) {
    let result = round_trip(&Value::Number(n), &ty);
    if fits {
        assert_eq!(result.unwrap(), Value::Number(n));
    } else {
        assert!(matches!(result, Err(MarshalError::NumberOutOfRange { .. })));
    }
}

#[test]
fn test_int64_bigint_round_trip() {
    let value = Value::BigInt(i64::MIN as i128);
    assert_eq!(round_trip(&value, &TypeTag::Int64).unwrap(), value);
}

#[test]
fn test_error_names_the_argument() {
    let err = round_trip(&Value::Number(1.5), &TypeTag::Int32).unwrap_err();
    assert!(err.to_string().starts_with("argument 'value'"), "{}", err);
}

// ===== Enums =====

#[test]
fn test_enum_rejects_unknown_member() {
    let info = Arc::new(EnumInfo::new(
        "Mode",
        EnumStorage::Int32,
        &[("read", 0), ("write", 1)],
    ));
    let ty = TypeTag::Enum(info);
    assert_eq!(round_trip(&Value::Number(1.0), &ty).unwrap(), Value::Number(1.0));
    assert!(matches!(
        round_trip(&Value::Number(5.0), &ty),
        Err(MarshalError::InvalidEnumValue { .. })
    ));
}

// ===== Self-sized arrays =====

#[test]
fn test_zero_terminated_string_array() {
    let ty = TypeTag::Array(Box::new(ArrayInfo::zero_terminated(TypeTag::Utf8)));
    let value = Value::array(vec![Value::string("a"), Value::string("bc")]);
    assert_eq!(round_trip(&value, &ty).unwrap(), value);
}

#[test]
fn test_fixed_array_length_checked() {
    let ty = TypeTag::Array(Box::new(ArrayInfo::fixed(TypeTag::Int16, 3)));
    let short = Value::array(vec![Value::Number(1.0)]);
    assert!(matches!(
        round_trip(&short, &ty),
        Err(MarshalError::TypeMismatch { .. })
    ));

    let exact = Value::array(vec![Value::Number(1.0), Value::Number(-2.0), Value::Number(3.0)]);
    assert_eq!(round_trip(&exact, &ty).unwrap(), exact);
}

#[test]
fn test_byte_array_accepts_string() {
    let ty = TypeTag::Array(Box::new(ArrayInfo::fixed(TypeTag::UInt8, 2)));
    assert_eq!(
        round_trip(&Value::string("hi"), &ty).unwrap(),
        Value::array(vec![Value::Number(104.0), Value::Number(105.0)])
    );
}

// ===== Properties =====

proptest! {
    #[test]
    fn prop_int32_round_trips(n in any::<i32>()) {
        let value = Value::Number(n as f64);
        prop_assert_eq!(round_trip(&value, &TypeTag::Int32).unwrap(), value);
    }

    #[test]
    fn prop_strings_round_trip(s in "[a-zA-Z0-9 éü_-]{0,64}") {
        let value = Value::string(&s);
        prop_assert_eq!(round_trip(&value, &TypeTag::Utf8).unwrap(), value);
    }

    #[test]
    fn prop_doubles_survive(x in any::<f64>().prop_filter("finite", |x| x.is_finite())) {
        prop_assert_eq!(round_trip(&Value::Number(x), &TypeTag::Double).unwrap(), Value::Number(x));
    }
}

// ===== Container transfer of self-contained pointers =====

#[test]
fn test_container_transfer_gives_native_its_own_object_ref() {
    let rt = runtime();
    let class = widget_class();
    let ptr = Widget::create(5);
    let proxy = unsafe { rt.bridge().wrap(ptr, &class) }.unwrap();
    let before = unsafe { Widget::refs(ptr) };

    let marshaler = rt.marshaler();
    let ty = TypeTag::Object(Arc::clone(&class));
    let slot = marshaler
        .to_native(&Value::Object(Rc::clone(&proxy)), &ty, &role(), Transfer::Container, false)
        .unwrap();
    assert_eq!(unsafe { Widget::refs(ptr) }, before + 1);

    // The callee consumed what it was given; our own view is untouched
    unsafe { marshaler.release(&slot, &ty, Transfer::Container, SlotOrigin::Marshaled) };
    unsafe { widget_unref(slot.pointer()) };
    assert_eq!(unsafe { Widget::refs(ptr) }, before);

    unsafe { widget_unref(ptr) };
    drop(proxy);
    assert_eq!(rt.bridge().live_count(), 0);
}

#[test]
fn test_container_transfer_copies_boxed_value() {
    let rt = runtime();
    let info = Arc::new(StructInfo::plain("Pair", 4));
    let boxed = Rc::new(BoxedValue::from_bytes(&info, &[1, 2, 3, 4]).unwrap());
    let ty = TypeTag::Struct(Arc::clone(&info));

    let marshaler = rt.marshaler();
    let slot = marshaler
        .to_native(&Value::Boxed(Rc::clone(&boxed)), &ty, &role(), Transfer::Container, false)
        .unwrap();
    assert_ne!(slot.pointer(), boxed.as_ptr());

    unsafe { marshaler.release(&slot, &ty, Transfer::Container, SlotOrigin::Marshaled) };
    boxed.write_bytes(0, &[0, 0, 0, 0]);
    let handed = unsafe { std::slice::from_raw_parts(slot.pointer() as *const u8, 4) };
    assert_eq!(handed, &[1, 2, 3, 4]);
    unsafe { free_native_struct(slot.pointer(), &info) };
}
