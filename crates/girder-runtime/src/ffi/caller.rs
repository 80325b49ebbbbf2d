//! Native function invocation through libffi
//!
//! A `CallInvoker` is built once per callable: the argument roles are
//! classified and the libffi call interface is prepared up front, so a
//! malformed signature fails at setup rather than at call time.
//!
//! Each `invoke`:
//! 1. frees async trampolines that finished since the last call
//! 2. marshals the receiver and the visible arguments, left to right
//! 3. fills side channels (array lengths, callback user data and destroy notify)
//! 4. appends the native error out-slot when the callable can throw
//! 5. performs the call
//! 6. on a native error, raises it without unmarshaling any output
//! 7. otherwise unmarshals the return value and every output, in order
//! 8. releases every input slot, whatever happened in 5-7

use crate::error::{BridgeError, BridgeResult, InvocationError, SetupError};
use crate::ffi::array::NativeArray;
use crate::ffi::boxed::BoxedValue;
use crate::ffi::callable::{ArgInfo, CallableInfo, ReceiverInfo};
use crate::ffi::callbacks::{trampoline_destroy_notify, CallbackTrampoline};
use crate::ffi::cif::{narrow_return, NativeCif};
use crate::ffi::descriptor::{CallDescriptor, CallDescriptorBuilder, ParamRole};
use crate::ffi::loader::SymbolResolver;
use crate::ffi::marshal::{ArgumentMarshaler, MarshalError, MarshalRole, SlotOrigin};
use crate::ffi::safety::{NativeBuffer, RawNativeError};
use crate::ffi::types::{Direction, NativeArg, Scope, Transfer, TypeTag};
use crate::logging::{log_marshaled, log_native_call, log_native_return};
use crate::runtime::BridgeRuntime;
use crate::value::Value;
use libloading::Library;
use std::ffi::c_void;
use std::rc::Rc;
use std::sync::Arc;

/// Per-argument storage for one call
#[derive(Default)]
struct ArgState {
    /// Value passed to native code; for outputs, a pointer to `out_slot`
    in_slot: NativeArg,
    out_slot: NativeArg,
    /// Slot produced by `to_native`, released after the call
    input: Option<NativeArg>,
    /// Element count of a marshaled input array
    array_length: Option<usize>,
    /// Caller-allocated struct storage
    buffer: Option<NativeBuffer>,
    trampoline: Option<Rc<CallbackTrampoline>>,
    /// Passed as a null pointer instead of the address of `out_slot`
    suppressed: bool,
}

struct MarshaledReceiver {
    slot: NativeArg,
    ty: TypeTag,
    transfer: Transfer,
}

/// Reusable invoker for one native callable
pub struct CallInvoker {
    info: Arc<CallableInfo>,
    descriptor: CallDescriptor,
    cif: NativeCif,
    fn_ptr: *const c_void,
    _library: Option<Arc<Library>>,
}

impl CallInvoker {
    /// Invoker for the function at `fn_ptr`
    ///
    /// # Safety
    ///
    /// `fn_ptr` must be a function whose native signature is exactly the one
    /// `info` describes, and it must stay valid while the invoker exists.
    pub unsafe fn new(info: Arc<CallableInfo>, fn_ptr: *const c_void) -> Result<Self, SetupError> {
        Self::build(info, fn_ptr, None)
    }

    /// Invoker for the symbol `info` declares, looked up in `library`
    ///
    /// The library stays loaded while the invoker exists. The declared
    /// signature is trusted to match the exported symbol.
    pub fn from_symbol(
        info: Arc<CallableInfo>,
        resolver: &mut SymbolResolver,
        library: &str,
    ) -> Result<Self, SetupError> {
        let resolved = resolver.resolve(library, &info.name, info.symbol.as_deref())?;
        Self::build(info, resolved.address(), Some(Arc::clone(resolved.library())))
    }

    fn build(
        info: Arc<CallableInfo>,
        fn_ptr: *const c_void,
        library: Option<Arc<Library>>,
    ) -> Result<Self, SetupError> {
        let descriptor = CallDescriptorBuilder::for_invoker(&info).build()?;
        let cif = NativeCif::for_callable(&info)?;
        Ok(Self {
            info,
            descriptor,
            cif,
            fn_ptr,
            _library: library,
        })
    }

    pub fn info(&self) -> &Arc<CallableInfo> {
        &self.info
    }

    pub fn descriptor(&self) -> &CallDescriptor {
        &self.descriptor
    }

    /// Call the native function with scripting arguments
    ///
    /// Returns `undefined` when nothing is produced, the single value when
    /// exactly one is, and otherwise a sequence: the return value first,
    /// then outputs in declaration order.
    pub fn invoke(&self, runtime: &BridgeRuntime, receiver: Option<&Value>, args: &[Value]) -> BridgeResult<Value> {
        runtime.drain_deferred();
        self.check_arity(runtime, args)?;

        let marshaler = runtime.marshaler();
        let receiver = self.marshal_receiver(&marshaler, receiver)?;
        let mut states: Vec<ArgState> = (0..self.info.args.len()).map(|_| ArgState::default()).collect();

        if let Err(e) = self.marshal_inputs(runtime, &marshaler, &mut states, args) {
            // SAFETY: nothing was handed to native code yet
            unsafe { self.rollback(&marshaler, receiver.as_ref(), &mut states) };
            return Err(e);
        }

        // SAFETY: the call interface matches fn_ptr (guaranteed at construction)
        // and every argument pointer refers to storage alive for the call
        let result = unsafe { self.call(&marshaler, receiver.as_ref(), &mut states) };

        // SAFETY: inputs were produced by to_native and are released once
        unsafe { self.release_inputs(&marshaler, receiver.as_ref(), &mut states) };
        drop(states);
        result
    }

    fn check_arity(&self, runtime: &BridgeRuntime, args: &[Value]) -> Result<(), InvocationError> {
        let expected = self.descriptor.script_arg_count();
        if args.len() < expected {
            return Err(InvocationError::TooFewArguments {
                function: self.info.name.clone(),
                expected,
                got: args.len(),
            });
        }
        if args.len() > expected && runtime.warn_extra_arguments() {
            tracing::warn!(
                function = %self.info.name,
                expected,
                got = args.len(),
                "too many arguments; extras ignored"
            );
        }
        Ok(())
    }

    fn marshal_receiver(
        &self,
        marshaler: &ArgumentMarshaler<'_>,
        receiver: Option<&Value>,
    ) -> BridgeResult<Option<MarshaledReceiver>> {
        let Some(kind) = &self.info.receiver else {
            return Ok(None);
        };
        let missing = || InvocationError::MissingReceiver {
            function: self.info.name.clone(),
        };

        let (ty, transfer) = match kind {
            ReceiverInfo::Struct { info, transfer } => (TypeTag::Struct(Arc::clone(info)), *transfer),
            ReceiverInfo::Object { class, transfer } => (TypeTag::Object(Arc::clone(class)), *transfer),
            ReceiverInfo::Error => (TypeTag::Error, Transfer::Nothing),
            ReceiverInfo::Class(class) => {
                // The class-structure pointer; no value conversion involved
                return Ok(Some(MarshaledReceiver {
                    slot: NativeArg::from_pointer(class.class_struct as *mut c_void),
                    ty: TypeTag::Pointer,
                    transfer: Transfer::Nothing,
                }));
            }
        };

        let value = receiver.filter(|v| !v.is_nullish()).ok_or_else(missing)?;
        let slot = marshaler.to_native(value, &ty, &MarshalRole::Receiver, transfer, false)?;
        Ok(Some(MarshaledReceiver { slot, ty, transfer }))
    }

    fn marshal_inputs(
        &self,
        runtime: &BridgeRuntime,
        marshaler: &ArgumentMarshaler<'_>,
        states: &mut [ArgState],
        args: &[Value],
    ) -> BridgeResult<()> {
        let mut next = args.iter();

        for (index, arg) in self.info.args.iter().enumerate() {
            let role = self.descriptor.role(index);
            if matches!(role, ParamRole::Skipped(_)) || !arg.direction.is_input() {
                if arg.caller_allocates {
                    self.allocate_out(arg, &mut states[index])?;
                }
                continue;
            }

            let value = next.next().cloned().unwrap_or_default();
            let marshal_role = MarshalRole::Argument(arg.name.clone());

            let slot = match (role, &arg.ty) {
                (ParamRole::Array { length }, TypeTag::Array(_))
                    if arg.direction == Direction::InOut && value.is_nullish() && arg.nullable =>
                {
                    // A null in-out array drops its length side channel entirely
                    states[index].suppressed = true;
                    states[length].suppressed = true;
                    continue;
                }
                (ParamRole::Array { length }, TypeTag::Array(info)) => {
                    let NativeArray { data, length: count } =
                        marshaler
                            .arrays()
                            .to_native(&value, info, &marshal_role, arg.transfer, arg.nullable)?;
                    states[index].input = Some(data);
                    states[index].array_length = Some(count);
                    if let Some(expected) = self.shared_length(states, index, length) {
                        if expected != count {
                            return Err(MarshalError::SharedLengthMismatch {
                                role: marshal_role,
                                expected,
                                found: count,
                            }
                            .into());
                        }
                    }

                    let partner = &self.info.args[length];
                    let count_slot = marshaler
                        .arrays()
                        .length_to_native(count, &partner.ty, &marshal_role)?;
                    if partner.direction == Direction::In {
                        states[length].in_slot = count_slot;
                    } else {
                        states[length].out_slot = count_slot;
                    }
                    data
                }
                (ParamRole::Callback { closure, destroy }, TypeTag::Callback(signature)) => {
                    let slot = self.make_callback(runtime, arg, signature, &value, &marshal_role, &mut states[index])?;
                    if let Some(user_data) = states[index].trampoline.as_ref().map(|t| t.user_data()) {
                        if let Some(closure) = closure {
                            states[closure].in_slot = NativeArg::from_pointer(user_data);
                        }
                        if let (Some(destroy), Scope::Notified) = (destroy, arg.scope) {
                            states[destroy].in_slot =
                                NativeArg::from_pointer(trampoline_destroy_notify as *const () as *mut c_void);
                        }
                    }
                    slot
                }
                _ => {
                    let slot = marshaler.to_native(&value, &arg.ty, &marshal_role, arg.transfer, arg.nullable)?;
                    states[index].input = Some(slot);
                    slot
                }
            };
            log_marshaled(&self.info.name, &marshal_role, &arg.ty);

            if arg.direction == Direction::InOut {
                states[index].out_slot = slot;
            } else {
                states[index].in_slot = slot;
            }
        }
        Ok(())
    }

    /// Length already given by an earlier array using the same length argument
    fn shared_length(&self, states: &[ArgState], index: usize, length: usize) -> Option<usize> {
        (0..index).find_map(|earlier| match self.descriptor.role(earlier) {
            ParamRole::Array { length: l } if l == length => states[earlier].array_length,
            _ => None,
        })
    }

        fn allocate_out(&self, arg: &ArgInfo, state: &mut ArgState) -> Result<(), MarshalError> {
        let size = match &arg.ty {
            TypeTag::Struct(info) | TypeTag::Union(info) => info.size,
            _ => 0,
        };
        let buffer = NativeBuffer::zeroed(size).ok_or_else(|| MarshalError::AllocationFailed {
            role: MarshalRole::Argument(arg.name.clone()),
        })?;
        state.buffer = Some(buffer);
        Ok(())
    }

    fn make_callback(
        &self,
        runtime: &BridgeRuntime,
        arg: &ArgInfo,
        signature: &Arc<CallableInfo>,
        value: &Value,
        role: &MarshalRole,
        state: &mut ArgState,
    ) -> BridgeResult<NativeArg> {
        match value {
            Value::Function(function) => {
                let trampoline = CallbackTrampoline::new(runtime, function, Arc::clone(signature), arg.scope)?;
                let slot = NativeArg::from_pointer(trampoline.code_ptr());
                state.trampoline = Some(trampoline);
                Ok(slot)
            }
            v if v.is_nullish() && arg.nullable => Ok(NativeArg::zeroed()),
            v if v.is_nullish() => Err(MarshalError::NullNotAllowed { role: role.clone() }.into()),
            other => Err(MarshalError::TypeMismatch {
                role: role.clone(),
                expected: "function".to_string(),
                got: other.type_name().to_string(),
            }
            .into()),
        }
    }

    unsafe fn call(
        &self,
        marshaler: &ArgumentMarshaler<'_>,
        receiver: Option<&MarshaledReceiver>,
        states: &mut [ArgState],
    ) -> BridgeResult<Value> {
        let mut receiver_slot = receiver.map(|r| r.slot).unwrap_or_default();
        let mut error: *mut RawNativeError = std::ptr::null_mut();
        let mut error_slot = NativeArg::from_pointer(&mut error as *mut *mut RawNativeError as *mut c_void);

        for (arg, state) in self.info.args.iter().zip(states.iter_mut()) {
            if state.suppressed {
                state.in_slot = NativeArg::zeroed();
            } else if arg.direction.is_output() {
                let target = match &state.buffer {
                    Some(buffer) => buffer.as_ptr(),
                    None => state.out_slot.as_mut_ptr(),
                };
                state.in_slot = NativeArg::from_pointer(target);
            }
        }

        let mut avalues: Vec<*mut c_void> = Vec::with_capacity(self.cif.arg_count());
        if self.info.is_method() {
            avalues.push(receiver_slot.as_mut_ptr());
        }
        avalues.extend(states.iter_mut().map(|state| state.in_slot.as_mut_ptr()));
        if self.info.can_throw {
            avalues.push(error_slot.as_mut_ptr());
        }

        log_native_call(&self.info.name, avalues.len());
        let mut raw_return = NativeArg::zeroed();
        self.cif.call(self.fn_ptr, &mut raw_return, &mut avalues);
        let ret = narrow_return(&raw_return, &self.info.return_type);
        log_native_return(&self.info.name, !error.is_null());

        for state in states.iter_mut() {
            // Call-scoped trampolines die with the call; the others are held by native code
            state.trampoline = None;
        }

        if !error.is_null() {
            let native = RawNativeError::read(error);
            RawNativeError::free(error);
            tracing::debug!(function = %self.info.name, error = %native, "native call raised");
            return Err(InvocationError::Native(native).into());
        }

        self.collect_outputs(marshaler, &ret, states)
    }

    unsafe fn collect_outputs(
        &self,
        marshaler: &ArgumentMarshaler<'_>,
        ret: &NativeArg,
        states: &mut [ArgState],
    ) -> BridgeResult<Value> {
        let mut values = Vec::with_capacity(self.descriptor.output_count());
        let mut failure: Option<MarshalError> = None;

        if !matches!(self.info.return_type, TypeTag::Void) {
            let length = self.descriptor.return_length().map(|i| self.received_length(marshaler, i, states));
            let value = self.take_received(
                marshaler,
                ret,
                &self.info.return_type,
                length,
                self.info.return_transfer,
                &MarshalRole::ReturnValue,
                self.info.has_return_value() && failure.is_none(),
            );
            match value {
                Some(Ok(v)) => values.push(v),
                Some(Err(e)) => failure = Some(e),
                None => {}
            }
        }

        for (index, arg) in self.info.args.iter().enumerate() {
            if !arg.direction.is_output() || self.descriptor.is_skipped(index) {
                continue;
            }
            let role = MarshalRole::Argument(arg.name.clone());

            if states[index].suppressed {
                values.push(Value::Null);
                continue;
            }

            if let Some(buffer) = states[index].buffer.take() {
                if failure.is_none() {
                    let copied = match &arg.ty {
                        TypeTag::Struct(info) | TypeTag::Union(info) => {
                            // SAFETY: the buffer holds info.size bytes the callee filled in
                            unsafe { BoxedValue::copy_from(buffer.as_ptr(), info) }
                        }
                        _ => None,
                    };
                    match copied {
                        Some(boxed) => values.push(Value::Boxed(Rc::new(boxed))),
                        None => failure = Some(MarshalError::AllocationFailed { role }),
                    }
                }
                continue;
            }

            let length = match self.descriptor.role(index) {
                ParamRole::Array { length } => Some(self.received_length(marshaler, length, states)),
                _ => None,
            };
            let slot = states[index].out_slot;
            match self.take_received(marshaler, &slot, &arg.ty, length, arg.transfer, &role, failure.is_none()) {
                Some(Ok(v)) => values.push(v),
                Some(Err(e)) => failure = Some(e),
                None => {}
            }
        }

        if let Some(e) = failure {
            return Err(BridgeError::Marshal(e));
        }
        Ok(match values.len() {
            0 => Value::Undefined,
            1 => values.pop().unwrap_or_default(),
            _ => Value::array(values),
        })
    }

    /// Unmarshal a received slot (when `wanted`) and release what we own of it
    #[allow(clippy::too_many_arguments)]
    unsafe fn take_received(
        &self,
        marshaler: &ArgumentMarshaler<'_>,
        slot: &NativeArg,
        ty: &TypeTag,
        length: Option<usize>,
        transfer: Transfer,
        role: &MarshalRole,
        wanted: bool,
    ) -> Option<Result<Value, MarshalError>> {
        match (ty, length) {
            (TypeTag::Array(info), Some(count)) => {
                let value = wanted.then(|| marshaler.arrays().from_native(slot.pointer(), info, Some(count), role));
                marshaler
                    .arrays()
                    .release(slot.pointer(), info, Some(count), transfer, SlotOrigin::Received);
                value
            }
            _ => {
                let value = wanted.then(|| marshaler.from_native(slot, ty, role));
                marshaler.release(slot, ty, transfer, SlotOrigin::Received);
                value
            }
        }
    }

    fn received_length(&self, marshaler: &ArgumentMarshaler<'_>, partner: usize, states: &[ArgState]) -> usize {
        let arg = &self.info.args[partner];
        let slot = if arg.direction.is_output() {
            &states[partner].out_slot
        } else {
            &states[partner].in_slot
        };
        marshaler.arrays().length_from_native(slot, &arg.ty)
    }

    unsafe fn release_inputs(
        &self,
        marshaler: &ArgumentMarshaler<'_>,
        receiver: Option<&MarshaledReceiver>,
        states: &mut [ArgState],
    ) {
        self.free_inputs(marshaler, receiver, states, false);
    }

    /// Undo marshaling after a failure before the call
    unsafe fn rollback(
        &self,
        marshaler: &ArgumentMarshaler<'_>,
        receiver: Option<&MarshaledReceiver>,
        states: &mut [ArgState],
    ) {
        for state in states.iter_mut() {
            if let Some(trampoline) = state.trampoline.take() {
                trampoline.abandon();
            }
        }
        self.free_inputs(marshaler, receiver, states, true);
    }

    unsafe fn free_inputs(
        &self,
        marshaler: &ArgumentMarshaler<'_>,
        receiver: Option<&MarshaledReceiver>,
        states: &mut [ArgState],
        unsent: bool,
    ) {
        if let Some(r) = receiver {
            if unsent {
                marshaler.rollback(&r.slot, &r.ty, r.transfer);
            } else {
                marshaler.release(&r.slot, &r.ty, r.transfer, SlotOrigin::Marshaled);
            }
        }

        for (index, (arg, state)) in self.info.args.iter().zip(states.iter_mut()).enumerate() {
            let Some(slot) = state.input.take() else {
                continue;
            };
            match (self.descriptor.role(index), &arg.ty) {
                (ParamRole::Array { .. }, TypeTag::Array(info)) if unsent => {
                    marshaler
                        .arrays()
                        .rollback(slot.pointer(), info, state.array_length, arg.transfer)
                }
                (ParamRole::Array { .. }, TypeTag::Array(info)) => marshaler.arrays().release(
                    slot.pointer(),
                    info,
                    state.array_length,
                    arg.transfer,
                    SlotOrigin::Marshaled,
                ),
                (_, ty) if unsent => marshaler.rollback(&slot, ty, arg.transfer),
                (_, ty) => marshaler.release(&slot, ty, arg.transfer, SlotOrigin::Marshaled),
            }
        }
    }
}
