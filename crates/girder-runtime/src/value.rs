//! Scripting value interface
//!
//! The bridge never sees the scripting engine directly; it sees `Value`.
//! Primitive variants are plain data. Reference variants (`Function`,
//! `Object`, `Boxed`) are `Rc` handles owned by the home thread.
//!
//! Arrays use copy-on-write semantics: cloning a `ValueArray` shares the
//! backing storage until one side mutates it.

use crate::ffi::boxed::BoxedValue;
use crate::lifetime::proxy::ObjectProxy;
use std::cell::Cell;
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use thiserror::Error;

/// Largest integer magnitude a `Value::Number` represents exactly (2^53)
pub const MAX_SAFE_INTEGER: i128 = 1 << 53;

/// Copy-on-write array of values
///
/// Cloning is O(1). The first mutation through a shared clone copies the
/// elements, so the other clones keep their view.
#[derive(Clone, Debug, Default)]
pub struct ValueArray(Rc<Vec<Value>>);

impl ValueArray {
    pub fn new() -> Self {
        ValueArray(Rc::new(Vec::new()))
    }

    pub fn from_vec(v: Vec<Value>) -> Self {
        ValueArray(Rc::new(v))
    }

    pub fn as_slice(&self) -> &[Value] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Value> {
        self.0.iter()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.0.get(index)
    }

    /// Mutable access, copying the elements first if they are shared
    pub fn make_mut(&mut self) -> &mut Vec<Value> {
        Rc::make_mut(&mut self.0)
    }

    pub fn push(&mut self, value: Value) {
        self.make_mut().push(value);
    }

    pub fn is_exclusively_owned(&self) -> bool {
        Rc::strong_count(&self.0) == 1
    }
}

impl From<Vec<Value>> for ValueArray {
    fn from(v: Vec<Value>) -> Self {
        ValueArray::from_vec(v)
    }
}

impl PartialEq for ValueArray {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_slice() == other.0.as_slice()
    }
}

/// Native error carried across the boundary
///
/// Mirrors the native `{domain, code, message}` error record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeError {
    pub domain: u32,
    pub code: i32,
    pub message: String,
}

impl NativeError {
    pub fn new(domain: u32, code: i32, message: impl Into<String>) -> Self {
        Self {
            domain,
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for NativeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (domain {}, code {})", self.message, self.domain, self.code)
    }
}

impl std::error::Error for NativeError {}

/// Exception raised by a scripting function
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScriptError {
    /// The function threw a value
    #[error("uncaught exception: {0}")]
    Thrown(Value),
    /// The engine reported a failure without a thrown value
    #[error("{0}")]
    Message(String),
}

impl ScriptError {
    pub fn message(msg: impl Into<String>) -> Self {
        ScriptError::Message(msg.into())
    }

    /// Convert into the native error reported through an error out-slot
    pub fn to_native_error(&self) -> NativeError {
        match self {
            ScriptError::Thrown(Value::Error(e)) => e.clone(),
            other => NativeError::new(0, 0, other.to_string()),
        }
    }
}

/// Body of a scripting function: `(this, args) -> result`
pub type ScriptFn = dyn Fn(&Value, &[Value]) -> Result<Value, ScriptError>;

struct FunctionInner {
    name: String,
    body: Box<ScriptFn>,
    pins: Cell<usize>,
}

/// Handle to a scripting function
///
/// Clones share the same function. `pin()` marks the function as a
/// collector root for as long as the returned guard lives.
#[derive(Clone)]
pub struct FunctionRef {
    inner: Rc<FunctionInner>,
}

impl FunctionRef {
    pub fn new<F>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&Value, &[Value]) -> Result<Value, ScriptError> + 'static,
    {
        Self {
            inner: Rc::new(FunctionInner {
                name: name.into(),
                body: Box::new(body),
                pins: Cell::new(0),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Call the function with an explicit `this`
    pub fn call(&self, this: &Value, args: &[Value]) -> Result<Value, ScriptError> {
        (self.inner.body)(this, args)
    }

    /// Pin the function against collection
    pub fn pin(&self) -> PinnedFunction {
        self.inner.pins.set(self.inner.pins.get() + 1);
        PinnedFunction {
            function: self.clone(),
        }
    }

    pub fn is_pinned(&self) -> bool {
        self.inner.pins.get() > 0
    }

    pub fn pin_count(&self) -> usize {
        self.inner.pins.get()
    }

    /// Non-owning handle that does not keep the function alive
    pub fn downgrade(&self) -> WeakFunctionRef {
        WeakFunctionRef {
            inner: Rc::downgrade(&self.inner),
        }
    }

    pub fn ptr_eq(&self, other: &FunctionRef) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for FunctionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<fn {}>", self.inner.name)
    }
}

/// Pin guard returned by [`FunctionRef::pin`]; unpins on drop
pub struct PinnedFunction {
    function: FunctionRef,
}

impl PinnedFunction {
    pub fn function(&self) -> &FunctionRef {
        &self.function
    }
}

impl Drop for PinnedFunction {
    fn drop(&mut self) {
        let pins = &self.function.inner.pins;
        pins.set(pins.get().saturating_sub(1));
    }
}

/// Weak function handle, used for non-rooted virtual-function overrides
#[derive(Clone)]
pub struct WeakFunctionRef {
    inner: Weak<FunctionInner>,
}

impl WeakFunctionRef {
    pub fn upgrade(&self) -> Option<FunctionRef> {
        self.inner.upgrade().map(|inner| FunctionRef { inner })
    }
}

/// Scripting value
#[derive(Clone, Debug, Default)]
pub enum Value {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    /// IEEE-754 double; integers are exact up to 2^53
    Number(f64),
    /// Integer outside the exact range of `Number`
    BigInt(i128),
    String(Arc<str>),
    Array(ValueArray),
    Function(FunctionRef),
    /// Proxy for a refcounted native object
    Object(Rc<ObjectProxy>),
    /// Scripting-owned copy of a native struct or union
    Boxed(Rc<BoxedValue>),
    /// Native error object
    Error(NativeError),
}

impl Value {
    pub fn string(s: impl AsRef<str>) -> Self {
        Value::String(Arc::from(s.as_ref()))
    }

    pub fn array(items: Vec<Value>) -> Self {
        Value::Array(ValueArray::from_vec(items))
    }

    /// Integer value, as `Number` when exactly representable
    pub fn integer(n: i128) -> Self {
        if (-MAX_SAFE_INTEGER..=MAX_SAFE_INTEGER).contains(&n) {
            Value::Number(n as f64)
        } else {
            Value::BigInt(n)
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::BigInt(_) => "bigint",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Function(_) => "function",
            Value::Object(_) => "object",
            Value::Boxed(_) => "boxed",
            Value::Error(_) => "error",
        }
    }

    /// `null` or `undefined`
    pub fn is_nullish(&self) -> bool {
        matches!(self, Value::Null | Value::Undefined)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&ValueArray> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) => true,
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::BigInt(a), Value::BigInt(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Function(a), Value::Function(b)) => a.ptr_eq(b),
            (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b),
            (Value::Boxed(a), Value::Boxed(b)) => Rc::ptr_eq(a, b),
            (Value::Error(a), Value::Error(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => write!(f, "undefined"),
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) => {
                if n.fract() == 0.0 && n.is_finite() {
                    write!(f, "{:.0}", n)
                } else {
                    write!(f, "{}", n)
                }
            }
            Value::BigInt(n) => write!(f, "{}n", n),
            Value::String(s) => write!(f, "{}", s.as_ref()),
            Value::Array(arr) => {
                let elements: Vec<String> = arr.iter().map(|v| v.to_string()).collect();
                write!(f, "[{}]", elements.join(", "))
            }
            Value::Function(func) => write!(f, "<fn {}>", func.name()),
            Value::Object(proxy) => write!(f, "<{} {:#x}>", proxy.class().name, proxy.address()),
            Value::Boxed(boxed) => write!(f, "<{}>", boxed.info().name),
            Value::Error(err) => write!(f, "{}", err),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::string(s)
    }
}
