//! Foreign Function Interface (FFI) infrastructure
//!
//! - Type descriptors for callables, structs, enums and object classes
//! - Argument marshaling (scripting values ↔ native slots)
//! - Call descriptors and libffi call interfaces
//! - Native invocation and callback trampolines
//! - Symbol resolution in shared libraries
//!
//! # Safety
//!
//! FFI operations involve `unsafe` code and careful memory management.
//! Native allocations go through the C allocator so ownership can cross
//! the boundary in either direction.

pub mod array;
pub mod boxed;
pub mod callable;
pub mod callbacks;
pub mod caller;
pub mod cif;
pub mod descriptor;
pub mod loader;
pub mod marshal;
pub mod safety;
pub mod types;

pub use array::{ArrayMarshaler, NativeArray};
pub use boxed::BoxedValue;
pub use callable::{ArgInfo, CallableInfo, ReceiverInfo};
pub use callbacks::{CallbackTrampoline, DeferredFreeQueue, TrampolineKind};
pub use caller::CallInvoker;
pub use cif::NativeCif;
pub use descriptor::{CallDescriptor, CallDescriptorBuilder, LengthOwner, ParamRole, SkipReason};
pub use loader::{LoadError, ResolvedSymbol, SymbolResolver};
pub use marshal::{ArgumentMarshaler, MarshalError, MarshalRole, SlotOrigin};
pub use types::{
    ArrayInfo, Direction, EnumInfo, EnumStorage, NativeArg, ObjectClass, ObjectOps, Scope,
    StructInfo, ToggleNotifyFn, Transfer, TypeTag,
};
