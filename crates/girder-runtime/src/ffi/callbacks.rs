//! FFI Callbacks - native code calling back into script
//!
//! A `CallbackTrampoline` owns a libffi closure whose entry point marshals
//! the native arguments, calls the bound scripting function, and writes the
//! results back into the native out-slots and return buffer.
//!
//! Lifetime by scope:
//! - `Call`: owned by the invoker for the duration of one native call
//! - `Async`: holds a self-reference for native code, moved to the
//!   `DeferredFreeQueue` after its single invocation
//! - `Notified`: holds a self-reference until native code calls the destroy
//!   notify passed alongside it
//!
//! A trampoline is never freed inside its own invocation frame.

use crate::error::{BridgeError, ProtocolViolation, SetupError};
use crate::ffi::callable::{ArgInfo, CallableInfo, ReceiverInfo};
use crate::ffi::cif::{write_return, FfiArg, NativeCif};
use crate::ffi::descriptor::{CallDescriptor, CallDescriptorBuilder, ParamRole};
use crate::ffi::marshal::{ArgumentMarshaler, MarshalError, MarshalRole, SlotOrigin};
use crate::ffi::safety::RawNativeError;
use crate::ffi::types::{Direction, NativeArg, Scope, Transfer, TypeTag};
use crate::lifetime::bridge::ObjectLifetimeBridge;
use crate::runtime::{BridgeRuntime, PendingCounters, RuntimeInner};
use crate::value::{FunctionRef, PinnedFunction, ScriptError, Value, WeakFunctionRef};
use girder_config::ViolationPolicy;
use libffi::low::{closure_alloc, closure_free, ffi_cif, ffi_closure, prep_closure};
use std::cell::{Cell, RefCell};
use std::ffi::c_void;
use std::rc::{Rc, Weak};
use std::sync::Arc;

/// What the trampoline stands in for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrampolineKind {
    /// Callback argument of a native function
    Callback,
    /// Virtual method implemented in script; the first native argument is
    /// the receiver and becomes `this`
    VirtualFunction,
}

enum Target {
    Pinned(PinnedFunction),
    Weak(WeakFunctionRef),
}

impl Target {
    fn function(&self) -> Option<FunctionRef> {
        match self {
            Target::Pinned(pinned) => Some(pinned.function().clone()),
            Target::Weak(weak) => weak.upgrade(),
        }
    }
}

/// Failure inside one native-to-script dispatch
enum DispatchError {
    Script(ScriptError),
    Bridge(BridgeError),
}

impl From<MarshalError> for DispatchError {
    fn from(e: MarshalError) -> Self {
        DispatchError::Bridge(e.into())
    }
}

impl From<ProtocolViolation> for DispatchError {
    fn from(e: ProtocolViolation) -> Self {
        DispatchError::Bridge(e.into())
    }
}

/// Natively callable closure bound to a scripting function
pub struct CallbackTrampoline {
    runtime: Weak<RuntimeInner>,
    bridge: ObjectLifetimeBridge,
    policy: ViolationPolicy,
    info: Arc<CallableInfo>,
    descriptor: CallDescriptor,
    cif: NativeCif,
    closure: Cell<*mut ffi_closure>,
    code: Cell<*mut c_void>,
    target: Target,
    scope: Scope,
    kind: TrampolineKind,
    /// Reference held on behalf of native code (Async and Notified)
    native_ref: RefCell<Option<Rc<CallbackTrampoline>>>,
    completed: Cell<bool>,
    destroyed: Cell<bool>,
    release_after_call: Cell<bool>,
    in_flight: Cell<usize>,
    /// Transfer-nothing results handed to native code by the last
    /// invocation, freed when the next outermost one starts
    retained: RefCell<Vec<(NativeArg, TypeTag, Value)>>,
}

impl CallbackTrampoline {
    /// Trampoline for a callback argument
    ///
    /// The function stays pinned for the trampoline's lifetime.
    pub fn new(
        runtime: &BridgeRuntime,
        function: &FunctionRef,
        info: Arc<CallableInfo>,
        scope: Scope,
    ) -> Result<Rc<Self>, SetupError> {
        Self::build(
            runtime,
            Target::Pinned(function.pin()),
            info,
            scope,
            TrampolineKind::Callback,
        )
    }

    /// Trampoline for a virtual method; the function is not pinned
    pub fn new_vfunc(
        runtime: &BridgeRuntime,
        function: &FunctionRef,
        info: Arc<CallableInfo>,
    ) -> Result<Rc<Self>, SetupError> {
        Self::build(
            runtime,
            Target::Weak(function.downgrade()),
            info,
            Scope::Call,
            TrampolineKind::VirtualFunction,
        )
    }

    fn build(
        runtime: &BridgeRuntime,
        target: Target,
        info: Arc<CallableInfo>,
        scope: Scope,
        kind: TrampolineKind,
    ) -> Result<Rc<Self>, SetupError> {
        let descriptor = CallDescriptorBuilder::for_trampoline(&info).build()?;
        let cif = NativeCif::for_callable(&info)?;

        let trampoline = Rc::new(Self {
            runtime: runtime.downgrade(),
            bridge: runtime.bridge().clone(),
            policy: runtime.policy(),
            info,
            descriptor,
            cif,
            closure: Cell::new(std::ptr::null_mut()),
            code: Cell::new(std::ptr::null_mut()),
            target,
            scope,
            kind,
            native_ref: RefCell::new(None),
            completed: Cell::new(false),
            destroyed: Cell::new(false),
            release_after_call: Cell::new(false),
            in_flight: Cell::new(0),
            retained: RefCell::new(Vec::new()),
        });

        let (closure, code) = closure_alloc();
        let code_ptr = code.0;
        if closure.is_null() {
            return Err(SetupError::CallInterface {
                callable: trampoline.info.name.clone(),
                reason: "closure allocation failed".to_string(),
            });
        }
        trampoline.closure.set(closure);

        // SAFETY: closure, cif and userdata all live as long as the trampoline
        unsafe {
            prep_closure(
                closure,
                trampoline.cif.as_raw_ptr(),
                trampoline_entry,
                Rc::as_ptr(&trampoline),
                code,
            )
        }
        .map_err(|e| SetupError::CallInterface {
            callable: trampoline.info.name.clone(),
            reason: format!("{:?}", e),
        })?;
        trampoline.code.set(code_ptr);

        if matches!(scope, Scope::Async | Scope::Notified) {
            *trampoline.native_ref.borrow_mut() = Some(Rc::clone(&trampoline));
        }

        tracing::debug!(
            callback = %trampoline.info.name,
            scope = ?scope,
            kind = ?kind,
            "trampoline created"
        );
        Ok(trampoline)
    }

    /// Native function pointer to hand to native code
    pub fn code_ptr(&self) -> *mut c_void {
        self.code.get()
    }

    /// User data to pass alongside `code_ptr` for async and notified scopes
    pub fn user_data(self: &Rc<Self>) -> *mut c_void {
        Rc::as_ptr(self) as *mut c_void
    }

    pub fn info(&self) -> &Arc<CallableInfo> {
        &self.info
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn kind(&self) -> TrampolineKind {
        self.kind
    }

    /// Whether native code still holds its reference
    pub fn is_held_by_native(&self) -> bool {
        self.native_ref.borrow().is_some()
    }

    pub fn is_completed(&self) -> bool {
        self.completed.get()
    }

    /// Marshal a native invocation into script and write back the results
    ///
    /// Any failure is logged and leaves a zero default in the return slot;
    /// for throwing signatures script exceptions go to the error slot.
    ///
    /// # Safety
    ///
    /// `args` and `ret` must be the argument array and return buffer libffi
    /// passes to a closure with this trampoline's call interface.
    pub unsafe fn invoke_from_native(&self, args: *const *const c_void, ret: *mut c_void) {
        if self.scope == Scope::Async && self.completed.get() {
            let violation = ProtocolViolation::AsyncCalledTwice {
                callback: self.info.name.clone(),
            };
            violation.enforce(self.policy);
            self.write_default(ret);
            return;
        }
        if self.destroyed.get() && self.in_flight.get() == 0 {
            let violation = ProtocolViolation::DestroyedContext {
                callback: self.info.name.clone(),
            };
            violation.enforce(self.policy);
            self.write_default(ret);
            return;
        }

        if self.in_flight.get() == 0 {
            self.release_retained();
        }
        self.in_flight.set(self.in_flight.get() + 1);
        let result = self.dispatch(args, ret);
        self.in_flight.set(self.in_flight.get() - 1);

        if let Err(failure) = result {
            self.report_failure(failure, args);
            self.write_default(ret);
        }

        if self.scope == Scope::Async && !self.completed.replace(true) {
            self.complete_async();
        }
        if self.release_after_call.get() && self.in_flight.get() == 0 {
            self.release_after_call.set(false);
            self.release_native_ref();
        }
    }

    unsafe fn dispatch(&self, args: *const *const c_void, ret: *mut c_void) -> Result<(), DispatchError> {
        let marshaler = ArgumentMarshaler::new(&self.bridge);
        let native_args: &[*const c_void] = if self.cif.arg_count() == 0 {
            &[]
        } else {
            std::slice::from_raw_parts(args, self.cif.arg_count())
        };
        let offset = usize::from(self.info.is_method());

        let this = match (self.kind, &self.info.receiver) {
            (TrampolineKind::VirtualFunction, Some(receiver)) => {
                let slot = NativeArg::read_from(native_args[0], std::mem::size_of::<*mut c_void>());
                receiver_value(&marshaler, &slot, receiver)?
            }
            _ => Value::Undefined,
        };

        let script_args = self.collect_inputs(&marshaler, &native_args[offset..])?;

        let function = self.target.function().ok_or_else(|| ProtocolViolation::DestroyedContext {
            callback: self.info.name.clone(),
        })?;
        tracing::trace!(callback = %self.info.name, args = script_args.len(), "entering script callback");
        let result = function.call(&this, &script_args).map_err(DispatchError::Script)?;

        self.write_outputs(&marshaler, &native_args[offset..], ret, result)
    }

    /// Scripting arguments for the visible inputs, in declaration order
    unsafe fn collect_inputs(
        &self,
        marshaler: &ArgumentMarshaler<'_>,
        native_args: &[*const c_void],
    ) -> Result<Vec<Value>, DispatchError> {
        let mut values = Vec::with_capacity(self.descriptor.script_arg_count());
        for (index, arg) in self.info.args.iter().enumerate() {
            if !arg.direction.is_input() || self.descriptor.is_skipped(index) {
                continue;
            }
            let role = MarshalRole::Argument(arg.name.clone());
            let slot = read_arg(arg, native_args[index]);

            let value = match (self.descriptor.role(index), &arg.ty) {
                (ParamRole::Array { length }, TypeTag::Array(info)) => {
                    let partner = &self.info.args[length];
                    let count = marshaler
                        .arrays()
                        .length_from_native(&read_arg(partner, native_args[length]), &partner.ty);
                    let value = marshaler.arrays().from_native(slot.pointer(), info, Some(count), &role)?;
                    if arg.direction == Direction::In {
                        marshaler.arrays().release(
                            slot.pointer(),
                            info,
                            Some(count),
                            arg.transfer,
                            SlotOrigin::Received,
                        );
                    }
                    value
                }
                _ => {
                    let value = marshaler.from_native(&slot, &arg.ty, &role)?;
                    if arg.direction == Direction::In {
                        marshaler.release(&slot, &arg.ty, arg.transfer, SlotOrigin::Received);
                    }
                    value
                }
            };
            values.push(value);
        }
        Ok(values)
    }

    unsafe fn write_outputs(
        &self,
        marshaler: &ArgumentMarshaler<'_>,
        native_args: &[*const c_void],
        ret: *mut c_void,
        result: Value,
    ) -> Result<(), DispatchError> {
        let mut written = Vec::new();
        let outcome = self.write_each_output(marshaler, native_args, ret, result, &mut written);
        if outcome.is_err() {
            for output in written {
                output.unwrite(marshaler);
            }
        }
        outcome
    }

    unsafe fn write_each_output(
        &self,
        marshaler: &ArgumentMarshaler<'_>,
        native_args: &[*const c_void],
        ret: *mut c_void,
        result: Value,
        written: &mut Vec<WrittenOutput>,
    ) -> Result<(), DispatchError> {
        let outputs: Vec<usize> = (0..self.info.args.len())
            .filter(|i| self.info.args[*i].direction.is_output() && !self.descriptor.is_skipped(*i))
            .collect();
        let expected = self.descriptor.output_count();

        let values: Vec<Value> = match expected {
            0 => Vec::new(),
            1 => vec![result],
            n => match result {
                Value::Array(items) if items.len() == n => items.iter().cloned().collect(),
                other => {
                    return Err(MarshalError::TypeMismatch {
                        role: MarshalRole::ReturnValue,
                        expected: format!("sequence of {} values", n),
                        got: other.type_name().to_string(),
                    }
                    .into())
                }
            },
        };
        let mut values = values.into_iter();

        if self.info.has_return_value() {
            let value = values.next().unwrap_or_default();
            let (slot, length) = self.output_slot(
                marshaler,
                native_args,
                &value,
                &self.info.return_type,
                self.descriptor.return_length(),
                MarshalRole::ReturnValue,
                self.info.return_transfer,
                self.info.return_nullable,
            )?;
            write_return(ret, &slot, &self.info.return_type);
            // The return slot is overwritten with a default on failure
            written.push(WrittenOutput {
                slot,
                ty: self.info.return_type.clone(),
                transfer: self.info.return_transfer,
                length,
                out: std::ptr::null_mut(),
            });
        } else if !matches!(self.info.return_type, TypeTag::Void) {
            self.write_default(ret);
        }

        for index in outputs {
            let arg = &self.info.args[index];
            let value = values.next().unwrap_or_default();
            let out = *(native_args[index] as *const *mut c_void);
            if out.is_null() {
                continue;
            }
            if arg.caller_allocates {
                write_caller_allocated(out, arg, &value)?;
                continue;
            }
            let length = match self.descriptor.role(index) {
                ParamRole::Array { length } => Some(length),
                _ => None,
            };
            let (slot, length) = self.output_slot(
                marshaler,
                native_args,
                &value,
                &arg.ty,
                length,
                MarshalRole::Argument(arg.name.clone()),
                arg.transfer,
                arg.nullable,
            )?;
            slot.write_to(out, arg.ty.native_size());
            written.push(WrittenOutput {
                slot,
                ty: arg.ty.clone(),
                transfer: arg.transfer,
                length,
                out,
            });
        }
        Ok(())
    }

    /// Native slot for one result, writing an array's length to its partner
    #[allow(clippy::too_many_arguments)]
    unsafe fn output_slot(
        &self,
        marshaler: &ArgumentMarshaler<'_>,
        native_args: &[*const c_void],
        value: &Value,
        ty: &TypeTag,
        length_arg: Option<usize>,
        role: MarshalRole,
        transfer: Transfer,
        nullable: bool,
    ) -> Result<(NativeArg, Option<usize>), DispatchError> {
        let (slot, count) = match (ty, length_arg) {
            (TypeTag::Array(info), Some(length)) => {
                let array = marshaler.arrays().to_native(value, info, &role, transfer, nullable)?;
                let partner = &self.info.args[length];
                let count = marshaler.arrays().length_to_native(array.length, &partner.ty, &role);
                let count = match count {
                    Ok(count) => count,
                    Err(e) => {
                        marshaler.arrays().rollback(array.data.pointer(), info, Some(array.length), transfer);
                        return Err(e.into());
                    }
                };
                let out = *(native_args[length] as *const *mut c_void);
                if !out.is_null() {
                    count.write_to(out, partner.ty.native_size());
                }
                (array.data, Some(array.length))
            }
            _ => (marshaler.to_native(value, ty, &role, transfer, nullable)?, None),
        };

        if transfer == Transfer::Nothing && ty.is_pointer() && !slot.pointer().is_null() {
            self.retained.borrow_mut().push((slot, ty.clone(), value.clone()));
        }
        Ok((slot, count))
    }

    unsafe fn report_failure(&self, failure: DispatchError, args: *const *const c_void) {
        match failure {
            DispatchError::Script(error) if self.info.can_throw => {
                tracing::warn!(
                    callback = %self.info.name,
                    error = %error,
                    "script callback raised; reporting through error slot"
                );
                let native_args = std::slice::from_raw_parts(args, self.cif.arg_count());
                if let Some(last) = native_args.last() {
                    let error_out = *(*last as *const *mut *mut RawNativeError);
                    if !error_out.is_null() && (*error_out).is_null() {
                        if let Some(raw) = RawNativeError::allocate(&error.to_native_error()) {
                            *error_out = raw;
                        }
                    }
                }
            }
            DispatchError::Script(error) => {
                tracing::error!(
                    callback = %self.info.name,
                    error = %error,
                    "exception in script callback cannot be reported to native caller"
                );
            }
            DispatchError::Bridge(error) => {
                tracing::warn!(
                    callback = %self.info.name,
                    error = %error,
                    "callback marshaling failed"
                );
            }
        }
    }

    unsafe fn write_default(&self, ret: *mut c_void) {
        if !ret.is_null() {
            write_return(ret, &NativeArg::zeroed(), &self.info.return_type);
        }
    }

    fn complete_async(&self) {
        let Some(held) = self.native_ref.borrow_mut().take() else {
            return;
        };
        match self.runtime.upgrade() {
            Some(runtime) => runtime.deferred().push(held),
            // Without a runtime the queue is gone; the temporary reference of
            // the running invocation still keeps us alive past this frame
            None => drop(held),
        }
    }

    /// Destroy notify from native code
    fn destroy_notified(&self) {
        if self.destroyed.replace(true) {
            let violation = ProtocolViolation::DestroyedContext {
                callback: self.info.name.clone(),
            };
            violation.enforce(self.policy);
            return;
        }
        tracing::debug!(callback = %self.info.name, "trampoline destroy notify");
        if self.in_flight.get() > 0 {
            self.release_after_call.set(true);
        } else {
            self.release_native_ref();
        }
    }

    /// Drop native code's reference when the code pointer was never handed over
    pub(crate) fn abandon(&self) {
        self.completed.set(true);
        self.destroyed.set(true);
        self.release_native_ref();
    }

    /// Number of transfer-nothing results still held for native code
    pub fn retained_count(&self) -> usize {
        self.retained.borrow().len()
    }

    fn release_retained(&self) {
        let previous = std::mem::take(&mut *self.retained.borrow_mut());
        let marshaler = ArgumentMarshaler::new(&self.bridge);
        for (slot, ty, _value) in previous {
            // SAFETY: retained slots came from to_native with Transfer::Nothing
            unsafe { marshaler.rollback(&slot, &ty, Transfer::Nothing) };
        }
    }

    fn release_native_ref(&self) {
        let held = self.native_ref.borrow_mut().take();
        drop(held);
    }

    /// Drop the invocation's temporary reference without freeing in-frame
    fn release_temporary(this: Rc<Self>) {
        if Rc::strong_count(&this) > 1 {
            return;
        }
        match this.runtime.upgrade() {
            Some(runtime) => runtime.deferred().push(this),
            None => {
                tracing::warn!(callback = %this.info.name, "leaking trampoline outliving its runtime");
                std::mem::forget(this);
            }
        }
    }
}

impl Drop for CallbackTrampoline {
    fn drop(&mut self) {
        self.release_retained();
        let closure = self.closure.get();
        if !closure.is_null() {
            // SAFETY: allocated by closure_alloc and no invocation is running
            unsafe { closure_free(closure) };
        }
        tracing::debug!(callback = %self.info.name, "trampoline freed");
    }
}

/// libffi closure entry point
unsafe extern "C" fn trampoline_entry(
    _cif: &ffi_cif,
    result: &mut FfiArg,
    args: *const *const c_void,
    userdata: &CallbackTrampoline,
) {
    let ptr = userdata as *const CallbackTrampoline;
    // Temporary reference for the duration of the invocation
    Rc::increment_strong_count(ptr);
    let this = Rc::from_raw(ptr);
    this.invoke_from_native(args, result as *mut FfiArg as *mut c_void);
    CallbackTrampoline::release_temporary(this);
}

/// Destroy notify handed to native code next to a notified callback
pub(crate) unsafe extern "C" fn trampoline_destroy_notify(data: *mut c_void) {
    if data.is_null() {
        return;
    }
    let ptr = data as *const CallbackTrampoline;
    Rc::increment_strong_count(ptr);
    let this = Rc::from_raw(ptr);
    this.destroy_notified();
    drop(this);
}

unsafe fn read_arg(arg: &ArgInfo, storage: *const c_void) -> NativeArg {
    if arg.direction.is_output() {
        let target = *(storage as *const *const c_void);
        if target.is_null() {
            return NativeArg::zeroed();
        }
        NativeArg::read_from(target, arg.ty.native_size())
    } else {
        NativeArg::read_from(storage, arg.ty.native_size())
    }
}

unsafe fn receiver_value(
    marshaler: &ArgumentMarshaler<'_>,
    slot: &NativeArg,
    receiver: &ReceiverInfo,
) -> Result<Value, MarshalError> {
    match receiver {
        ReceiverInfo::Object { class, .. } => {
            marshaler.from_native(slot, &TypeTag::Object(Arc::clone(class)), &MarshalRole::Receiver)
        }
        ReceiverInfo::Struct { info, .. } => {
            marshaler.from_native(slot, &TypeTag::Struct(Arc::clone(info)), &MarshalRole::Receiver)
        }
        ReceiverInfo::Class(_) | ReceiverInfo::Error => Ok(Value::Undefined),
    }
}

/// Copy a boxed result into caller-provided struct storage
/// A result already handed to native code during one invocation
struct WrittenOutput {
    slot: NativeArg,
    ty: TypeTag,
    transfer: Transfer,
    length: Option<usize>,
    /// Out location the slot was written to; null for the return value
    out: *mut c_void,
}

impl WrittenOutput {
    /// Take back a result when a later output fails to marshal
    ///
    /// Transfer-nothing results stay with the trampoline's retained set.
    unsafe fn unwrite(self, marshaler: &ArgumentMarshaler<'_>) {
        if self.transfer == Transfer::Nothing {
            return;
        }
        match (&self.ty, self.length) {
            (TypeTag::Array(info), Some(length)) => {
                marshaler.arrays().rollback(self.slot.pointer(), info, Some(length), self.transfer)
            }
            (ty, _) => marshaler.rollback(&self.slot, ty, self.transfer),
        }
        if !self.out.is_null() {
            NativeArg::zeroed().write_to(self.out, self.ty.native_size());
        }
    }
}

unsafe fn write_caller_allocated(out: *mut c_void, arg: &ArgInfo, value: &Value) -> Result<(), MarshalError> {
    let role = MarshalRole::Argument(arg.name.clone());
    match (&arg.ty, value) {
        (TypeTag::Struct(info) | TypeTag::Union(info), Value::Boxed(boxed)) if boxed.info() == info => {
            std::ptr::copy_nonoverlapping(boxed.as_ptr() as *const u8, out as *mut u8, info.size);
            Ok(())
        }
        (ty, other) => Err(MarshalError::TypeMismatch {
            role,
            expected: ty.display_name(),
            got: other.type_name().to_string(),
        }),
    }
}

/// Finished async trampolines awaiting release at the next invocation
pub struct DeferredFreeQueue {
    pending: RefCell<Vec<Rc<CallbackTrampoline>>>,
    counters: Arc<PendingCounters>,
}

impl DeferredFreeQueue {
    pub fn new(counters: Arc<PendingCounters>) -> Self {
        Self {
            pending: RefCell::new(Vec::new()),
            counters,
        }
    }

    pub fn push(&self, trampoline: Rc<CallbackTrampoline>) {
        tracing::debug!(callback = %trampoline.info.name, "trampoline deferred");
        self.pending.borrow_mut().push(trampoline);
        self.counters.trampoline_deferred();
    }

    /// Release every queued trampoline; never call from inside a trampoline
    pub fn drain(&self) -> usize {
        let drained = std::mem::take(&mut *self.pending.borrow_mut());
        let count = drained.len();
        if count > 0 {
            self.counters.trampolines_freed(count);
            tracing::debug!(count, "draining deferred trampolines");
        }
        drop(drained);
        count
    }

    pub fn len(&self) -> usize {
        self.pending.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.borrow().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ffi::types::Scope;
    use girder_config::BridgeConfig;

    fn runtime() -> BridgeRuntime {
        BridgeRuntime::new(&BridgeConfig::default().with_protocol_violation(ViolationPolicy::Report))
    }

    fn add_signature() -> Arc<CallableInfo> {
        Arc::new(
            CallableInfo::new("BinaryOp")
                .arg(ArgInfo::new("a", TypeTag::Int32))
                .arg(ArgInfo::new("b", TypeTag::Int32))
                .returns(TypeTag::Int32, Transfer::Nothing),
        )
    }

    fn call_binary(code: *mut c_void, a: i32, b: i32) -> i32 {
        let f: extern "C" fn(i32, i32) -> i32 = unsafe { std::mem::transmute(code) };
        f(a, b)
    }

    #[test]
    fn test_call_scope_round_trip() {
        let rt = runtime();
        let add = FunctionRef::new("add", |_this, args| {
            let a = args[0].as_number().unwrap_or(0.0);
            let b = args[1].as_number().unwrap_or(0.0);
            Ok(Value::Number(a + b))
        });
        let trampoline = CallbackTrampoline::new(&rt, &add, add_signature(), Scope::Call).unwrap();
        assert!(add.is_pinned());
        assert_eq!(call_binary(trampoline.code_ptr(), 2, 40), 42);
        drop(trampoline);
        assert!(!add.is_pinned());
    }

    #[test]
    fn test_script_exception_yields_default() {
        let rt = runtime();
        let fail = FunctionRef::new("fail", |_this, _args| Err(ScriptError::message("boom")));
        let trampoline = CallbackTrampoline::new(&rt, &fail, add_signature(), Scope::Call).unwrap();
        assert_eq!(call_binary(trampoline.code_ptr(), 1, 2), 0);
    }

    #[test]
    fn test_wrong_return_type_yields_default() {
        let rt = runtime();
        let wrong = FunctionRef::new("wrong", |_this, _args| Ok(Value::string("nope")));
        let trampoline = CallbackTrampoline::new(&rt, &wrong, add_signature(), Scope::Call).unwrap();
        assert_eq!(call_binary(trampoline.code_ptr(), 1, 2), 0);
    }

    #[test]
    fn test_async_moves_to_deferred_queue() {
        let rt = runtime();
        let add = FunctionRef::new("add", |_this, _args| Ok(Value::Number(1.0)));
        let trampoline = CallbackTrampoline::new(&rt, &add, add_signature(), Scope::Async).unwrap();
        let code = trampoline.code_ptr();
        drop(trampoline);

        assert_eq!(call_binary(code, 0, 0), 1);
        assert_eq!(rt.pending().deferred_trampolines, 1);
        assert!(add.is_pinned());

        assert_eq!(rt.drain_deferred(), 1);
        assert_eq!(rt.pending().deferred_trampolines, 0);
        assert!(!add.is_pinned());
    }

    #[test]
    fn test_notified_freed_by_destroy_notify() {
        let rt = runtime();
        let add = FunctionRef::new("add", |_this, _args| Ok(Value::Number(3.0)));
        let trampoline = CallbackTrampoline::new(&rt, &add, add_signature(), Scope::Notified).unwrap();
        let code = trampoline.code_ptr();
        let data = trampoline.user_data();
        drop(trampoline);

        assert_eq!(call_binary(code, 0, 0), 3);
        assert_eq!(call_binary(code, 0, 0), 3);
        assert!(add.is_pinned());

        unsafe { trampoline_destroy_notify(data) };
        assert!(!add.is_pinned());
    }

    #[test]
    fn test_vfunc_does_not_pin() {
        let rt = runtime();
        let f = FunctionRef::new("vfunc", |_this, _args| Ok(Value::Number(5.0)));
        let trampoline = CallbackTrampoline::new_vfunc(&rt, &f, add_signature()).unwrap();
        assert!(!f.is_pinned());
        assert_eq!(trampoline.kind(), TrampolineKind::VirtualFunction);
        assert_eq!(call_binary(trampoline.code_ptr(), 0, 0), 5);
    }

    #[test]
    fn test_borrowed_string_result_outlives_the_call() {
        let rt = runtime();
        let greet = FunctionRef::new("greet", |_this, _args| Ok(Value::string("hello")));
        let signature = Arc::new(CallableInfo::new("Greeter").returns(TypeTag::Utf8, Transfer::Nothing));
        let trampoline = CallbackTrampoline::new(&rt, &greet, signature, Scope::Call).unwrap();
        let f: extern "C" fn() -> *const std::os::raw::c_char =
            unsafe { std::mem::transmute(trampoline.code_ptr()) };

        let result = f();
        // Readable until the next invocation starts
        assert_eq!(unsafe { std::ffi::CStr::from_ptr(result) }.to_str(), Ok("hello"));
        assert_eq!(trampoline.retained_count(), 1);
    }

    #[test]
    fn test_retained_results_do_not_accumulate() {
        let rt = runtime();
        let greet = FunctionRef::new("greet", |_this, _args| Ok(Value::string("hello")));
        let signature = Arc::new(CallableInfo::new("Greeter").returns(TypeTag::Utf8, Transfer::Nothing));
        let trampoline = CallbackTrampoline::new(&rt, &greet, signature, Scope::Call).unwrap();
        let f: extern "C" fn() -> *const std::os::raw::c_char =
            unsafe { std::mem::transmute(trampoline.code_ptr()) };

        for _ in 0..1000 {
            f();
        }
        assert_eq!(trampoline.retained_count(), 1);
    }

    #[test]
    fn test_deferred_queue_counts() {
        let counters = Arc::new(PendingCounters::default());
        let queue = DeferredFreeQueue::new(Arc::clone(&counters));
        assert!(queue.is_empty());
        assert_eq!(queue.drain(), 0);
        assert_eq!(counters.snapshot().deferred_trampolines, 0);
    }
}
