//! Girder Runtime - dynamic foreign-function bridge
//!
//! This library lets a scripting engine call native libraries whose
//! signatures are only known at run time, and be called back from them:
//! - Argument and return marshaling driven by type descriptors
//! - Native call invocation through libffi, with multi-output aggregation
//!   and native error propagation
//! - Callback trampolines bound to scripting functions
//! - An object lifetime bridge between script-side proxies and native
//!   reference counts

/// Girder runtime version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// Public API modules
pub mod error;
pub mod ffi;
pub mod lifetime;
pub mod logging;
pub mod runtime;
pub mod value;

// Re-export commonly used types
pub use error::{BridgeError, BridgeResult, InvocationError, ProtocolViolation, SetupError};
pub use ffi::{
    ArgInfo, ArgumentMarshaler, CallDescriptor, CallDescriptorBuilder, CallInvoker,
    CallableInfo, CallbackTrampoline, MarshalError, MarshalRole, NativeArg, ParamRole,
    ReceiverInfo, SlotOrigin, SymbolResolver, TypeTag,
};
pub use lifetime::{ObjectLifetimeBridge, ObjectProxy, ProxyState};
pub use runtime::{BridgeRuntime, PendingCounts};
pub use value::{FunctionRef, NativeError, ScriptError, Value, ValueArray};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_smoke() {
        assert_eq!(VERSION, "0.1.0");
    }
}
