//! Marshaling stability fuzzer
//!
//! Feeds arbitrary scripting values into `to_native` for every scalar and
//! self-sized array type, then converts back and releases.
//!
//! Stability contract:
//! - Marshaling never panics; bad values come back as `MarshalError`
//! - Every slot produced by `to_native` is released exactly once
//! - A value that marshals also unmarshals

#![no_main]

use libfuzzer_sys::fuzz_target;

use girder_config::{BridgeConfig, ViolationPolicy};
use girder_runtime::ffi::{ArrayInfo, SlotOrigin, Transfer};
use girder_runtime::{BridgeRuntime, MarshalRole, TypeTag, Value};

fn type_for(selector: u8) -> TypeTag {
    match selector % 16 {
        0 => TypeTag::Boolean,
        1 => TypeTag::Int8,
        2 => TypeTag::UInt8,
        3 => TypeTag::Int16,
        4 => TypeTag::UInt16,
        5 => TypeTag::Int32,
        6 => TypeTag::UInt32,
        7 => TypeTag::Int64,
        8 => TypeTag::UInt64,
        9 => TypeTag::Float,
        10 => TypeTag::Double,
        11 => TypeTag::Unichar,
        12 => TypeTag::Utf8,
        13 => TypeTag::Array(Box::new(ArrayInfo::zero_terminated(TypeTag::Utf8))),
        14 => TypeTag::Array(Box::new(ArrayInfo::fixed(TypeTag::UInt8, 4))),
        _ => TypeTag::Array(Box::new(ArrayInfo::zero_terminated(TypeTag::Int32))),
    }
}

fn value_for(selector: u8, rest: &[u8]) -> Value {
    let mut word = [0u8; 8];
    let n = rest.len().min(8);
    word[..n].copy_from_slice(&rest[..n]);
    let text = String::from_utf8_lossy(rest).into_owned();

    match selector % 7 {
        0 => Value::Number(f64::from_le_bytes(word)),
        1 => Value::BigInt(i64::from_le_bytes(word) as i128),
        2 => Value::string(text),
        3 => Value::Bool(word[0] & 1 == 1),
        4 => Value::Null,
        5 => Value::array(text.split(' ').map(Value::string).collect()),
        _ => Value::array(rest.iter().map(|b| Value::Number(*b as f64)).collect()),
    }
}

fuzz_target!(|data: &[u8]| {
    let [ty_sel, value_sel, flags, rest @ ..] = data else {
        return;
    };
    let ty = type_for(*ty_sel);
    let value = value_for(*value_sel, rest);
    let transfer = if flags & 1 == 1 {
        Transfer::Everything
    } else {
        Transfer::Nothing
    };
    let nullable = flags & 2 == 2;

    let rt = BridgeRuntime::new(&BridgeConfig::default().with_protocol_violation(ViolationPolicy::Report));
    let marshaler = rt.marshaler();
    let role = MarshalRole::Argument("fuzz".to_string());

    let Ok(slot) = marshaler.to_native(&value, &ty, &role, transfer, nullable) else {
        return;
    };
    // SAFETY: the slot came from to_native with this type
    let back = unsafe { marshaler.from_native(&slot, &ty, &role) };
    assert!(back.is_ok(), "marshaled {} as {} but could not read it back", value, ty);
    unsafe { marshaler.rollback(&slot, &ty, transfer) };
});
