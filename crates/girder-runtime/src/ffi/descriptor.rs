//! Call descriptors - per-callable argument role classification
//!
//! Built once per callable and reused for every invocation. Each argument is
//! classified as:
//! - `Normal`: marshaled on its own
//! - `Skipped`: a side channel (array length, callback user data, destroy
//!   notify) absorbed by exactly one owning argument
//! - `Array`: paired with a skipped length argument
//! - `Callback`: paired with optional user-data and destroy-notify arguments

use crate::error::SetupError;
use crate::ffi::callable::{ArgInfo, CallableInfo};
use crate::ffi::types::{Direction, Scope, TypeTag};

/// Owner of a skipped array length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthOwner {
    Param(usize),
    Return,
}

/// Why an argument is hidden from script
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    ArrayLength(LengthOwner),
    ClosureData { callback: usize },
    DestroyNotify { callback: usize },
    /// Untyped pointer in a callback signature; script never sees it
    OpaquePointer,
}

/// Classification of one argument
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamRole {
    Normal,
    Skipped(SkipReason),
    Array { length: usize },
    Callback {
        closure: Option<usize>,
        destroy: Option<usize>,
    },
}

/// Whether the descriptor drives a native call or a native-to-script callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorKind {
    Invoker,
    Trampoline,
}

/// Cached classification of a callable's arguments
#[derive(Debug, Clone, PartialEq)]
pub struct CallDescriptor {
    roles: Vec<ParamRole>,
    return_length: Option<usize>,
    script_arg_count: usize,
    output_count: usize,
}

impl CallDescriptor {
    pub fn roles(&self) -> &[ParamRole] {
        &self.roles
    }

    pub fn role(&self, index: usize) -> ParamRole {
        self.roles[index]
    }

    /// Length argument of an array return value
    pub fn return_length(&self) -> Option<usize> {
        self.return_length
    }

    /// Number of scripting arguments the callable consumes
    pub fn script_arg_count(&self) -> usize {
        self.script_arg_count
    }

    /// Number of values produced for script: return value plus outputs
    pub fn output_count(&self) -> usize {
        self.output_count
    }

    pub fn is_skipped(&self, index: usize) -> bool {
        matches!(self.roles[index], ParamRole::Skipped(_))
    }
}

/// Builds a [`CallDescriptor`], rejecting malformed signatures
pub struct CallDescriptorBuilder<'a> {
    info: &'a CallableInfo,
    kind: DescriptorKind,
}

impl<'a> CallDescriptorBuilder<'a> {
    pub fn for_invoker(info: &'a CallableInfo) -> Self {
        Self {
            info,
            kind: DescriptorKind::Invoker,
        }
    }

    pub fn for_trampoline(info: &'a CallableInfo) -> Self {
        Self {
            info,
            kind: DescriptorKind::Trampoline,
        }
    }

    pub fn build(self) -> Result<CallDescriptor, SetupError> {
        let args = &self.info.args;
        let mut claims: Vec<Option<SkipReason>> = vec![None; args.len()];

        // Side channels first, so role assignment below sees every claim
        let return_length = match &self.info.return_type {
            TypeTag::Array(array) => match array.length_arg {
                Some(partner) => {
                    self.check_length_partner("return value", partner, Direction::Out)?;
                    self.claim(&mut claims, partner, SkipReason::ArrayLength(LengthOwner::Return))?;
                    Some(partner)
                }
                None if array.is_self_sized() => None,
                None => {
                    return Err(SetupError::UnsizedArray {
                        callable: self.info.name.clone(),
                        arg: "return value".to_string(),
                    })
                }
            },
            _ => None,
        };

        for (index, arg) in args.iter().enumerate() {
            match &arg.ty {
                TypeTag::Array(array) => match array.length_arg {
                    Some(partner) => {
                        self.check_length_partner(&describe(arg), partner, arg.direction)?;
                        self.claim(
                            &mut claims,
                            partner,
                            SkipReason::ArrayLength(LengthOwner::Param(index)),
                        )?;
                    }
                    None if array.is_self_sized() => {}
                    None => {
                        return Err(SetupError::UnsizedArray {
                            callable: self.info.name.clone(),
                            arg: describe(arg),
                        })
                    }
                },
                TypeTag::Callback(signature) => {
                    self.check_callback(arg, signature.args.iter().any(is_callback))?;
                    if let Some(closure) = arg.closure {
                        self.check_partner(arg, closure)?;
                        self.claim(&mut claims, closure, SkipReason::ClosureData { callback: index })?;
                    }
                    if let Some(destroy) = arg.destroy {
                        self.check_partner(arg, destroy)?;
                        self.claim(&mut claims, destroy, SkipReason::DestroyNotify { callback: index })?;
                    }
                }
                _ => {}
            }

            if arg.caller_allocates
                && !(arg.direction == Direction::Out
                    && matches!(arg.ty, TypeTag::Struct(_) | TypeTag::Union(_)))
            {
                return Err(SetupError::InvalidCallerAllocates {
                    callable: self.info.name.clone(),
                    arg: describe(arg),
                });
            }
        }

        let roles: Vec<ParamRole> = args
            .iter()
            .zip(claims.iter())
            .map(|(arg, claim)| match (claim, &arg.ty) {
                (Some(reason), _) => ParamRole::Skipped(*reason),
                (None, TypeTag::Array(array)) => match array.length_arg {
                    Some(length) => ParamRole::Array { length },
                    None => ParamRole::Normal,
                },
                (None, TypeTag::Callback(_)) => ParamRole::Callback {
                    closure: arg.closure,
                    destroy: arg.destroy,
                },
                (None, TypeTag::Pointer) if self.kind == DescriptorKind::Trampoline => {
                    ParamRole::Skipped(SkipReason::OpaquePointer)
                }
                (None, _) => ParamRole::Normal,
            })
            .collect();

        let visible = |i: &usize| !matches!(roles[*i], ParamRole::Skipped(_));
        let script_arg_count = (0..args.len())
            .filter(visible)
            .filter(|i| args[*i].direction.is_input())
            .count();
        let output_count = usize::from(self.info.has_return_value())
            + (0..args.len())
                .filter(visible)
                .filter(|i| args[*i].direction.is_output())
                .count();

        Ok(CallDescriptor {
            roles,
            return_length,
            script_arg_count,
            output_count,
        })
    }

    fn check_length_partner(&self, owner: &str, partner: usize, expected: Direction) -> Result<(), SetupError> {
        let callable = self.info.name.clone();
        let Some(length) = self.info.args.get(partner) else {
            return Err(SetupError::LengthPartnerOutOfRange {
                callable,
                arg: owner.to_string(),
                partner,
            });
        };
        if !length.ty.is_integer() {
            return Err(SetupError::LengthNotInteger {
                callable,
                arg: owner.to_string(),
                partner,
            });
        }
        if length.direction != expected {
            return Err(SetupError::LengthDirectionMismatch {
                callable,
                arg: owner.to_string(),
                partner,
                expected,
                found: length.direction,
            });
        }
        Ok(())
    }

    fn check_callback(&self, arg: &ArgInfo, takes_callback: bool) -> Result<(), SetupError> {
        let callable = self.info.name.clone();
        // A trampoline has no way to build a callback for native code to call
        if takes_callback || self.kind == DescriptorKind::Trampoline {
            return Err(SetupError::CallbackTakesCallback {
                callable,
                arg: describe(arg),
            });
        }
        if arg.destroy.is_some() && arg.closure.is_none() {
            return Err(SetupError::DestroyWithoutClosure {
                callable,
                arg: describe(arg),
            });
        }
        if arg.scope == Scope::Notified && arg.destroy.is_none() {
            return Err(SetupError::NotifiedWithoutDestroy {
                callable,
                arg: describe(arg),
            });
        }
        Ok(())
    }

    fn check_partner(&self, arg: &ArgInfo, partner: usize) -> Result<(), SetupError> {
        if partner >= self.info.args.len() {
            return Err(SetupError::CallbackPartnerOutOfRange {
                callable: self.info.name.clone(),
                arg: describe(arg),
                partner,
            });
        }
        Ok(())
    }

    fn claim(
        &self,
        claims: &mut [Option<SkipReason>],
        index: usize,
        reason: SkipReason,
    ) -> Result<(), SetupError> {
        // Several arrays may share one length argument
        if let (Some(SkipReason::ArrayLength(_)), SkipReason::ArrayLength(_)) = (claims[index], reason) {
            return Ok(());
        }
        if claims[index].is_some() {
            return Err(SetupError::PartnerClaimedTwice {
                callable: self.info.name.clone(),
                index,
            });
        }
        claims[index] = Some(reason);
        Ok(())
    }
}

fn describe(arg: &ArgInfo) -> String {
    format!("argument '{}'", arg.name)
}

fn is_callback(arg: &ArgInfo) -> bool {
    matches!(arg.ty, TypeTag::Callback(_))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ffi::types::{ArrayInfo, Transfer};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn int_array(length: usize) -> TypeTag {
        TypeTag::Array(Box::new(ArrayInfo::with_length_arg(TypeTag::Int32, length)))
    }

    fn callback() -> TypeTag {
        TypeTag::Callback(Arc::new(
            CallableInfo::new("Visitor").arg(ArgInfo::new("item", TypeTag::Int32)),
        ))
    }

    #[test]
    fn test_array_with_length_partner() {
        let info = CallableInfo::new("sum")
            .arg(ArgInfo::new("values", int_array(1)))
            .arg(ArgInfo::new("n_values", TypeTag::UInt32))
            .returns(TypeTag::Int64, Transfer::Nothing);

        let desc = CallDescriptorBuilder::for_invoker(&info).build().unwrap();
        assert_eq!(
            desc.roles(),
            &[
                ParamRole::Array { length: 1 },
                ParamRole::Skipped(SkipReason::ArrayLength(LengthOwner::Param(0))),
            ]
        );
        assert_eq!(desc.script_arg_count(), 1);
        assert_eq!(desc.output_count(), 1);
    }

    #[test]
    fn test_callback_with_side_channels() {
        let info = CallableInfo::new("foreach")
            .arg(
                ArgInfo::new("func", callback())
                    .scope(Scope::Notified)
                    .closure(1)
                    .destroy(2),
            )
            .arg(ArgInfo::new("user_data", TypeTag::Pointer))
            .arg(ArgInfo::new("notify", TypeTag::Pointer));

        let desc = CallDescriptorBuilder::for_invoker(&info).build().unwrap();
        assert_eq!(
            desc.roles(),
            &[
                ParamRole::Callback {
                    closure: Some(1),
                    destroy: Some(2)
                },
                ParamRole::Skipped(SkipReason::ClosureData { callback: 0 }),
                ParamRole::Skipped(SkipReason::DestroyNotify { callback: 0 }),
            ]
        );
        assert_eq!(desc.script_arg_count(), 1);
        assert_eq!(desc.output_count(), 0);
    }

    #[test]
    fn test_length_direction_mismatch() {
        let info = CallableInfo::new("fill")
            .arg(ArgInfo::out("values", int_array(1)))
            .arg(ArgInfo::new("n_values", TypeTag::UInt32));

        let err = CallDescriptorBuilder::for_invoker(&info).build().unwrap_err();
        assert!(matches!(err, SetupError::LengthDirectionMismatch { .. }));
    }

    #[test]
    fn test_length_must_be_integer() {
        let info = CallableInfo::new("bad")
            .arg(ArgInfo::new("values", int_array(1)))
            .arg(ArgInfo::new("n", TypeTag::Utf8));

        let err = CallDescriptorBuilder::for_invoker(&info).build().unwrap_err();
        assert!(matches!(err, SetupError::LengthNotInteger { .. }));
    }

    #[test]
    fn test_callback_taking_callback_rejected() {
        let nested = TypeTag::Callback(Arc::new(
            CallableInfo::new("Outer").arg(ArgInfo::new("inner", callback())),
        ));
        let info = CallableInfo::new("register").arg(ArgInfo::new("cb", nested));

        let err = CallDescriptorBuilder::for_invoker(&info).build().unwrap_err();
        assert!(matches!(err, SetupError::CallbackTakesCallback { .. }));
    }

    #[test]
    fn test_destroy_without_closure_rejected() {
        let info = CallableInfo::new("watch")
            .arg(ArgInfo::new("cb", callback()).scope(Scope::Notified).destroy(1))
            .arg(ArgInfo::new("notify", TypeTag::Pointer));

        let err = CallDescriptorBuilder::for_invoker(&info).build().unwrap_err();
        assert!(matches!(err, SetupError::DestroyWithoutClosure { .. }));
    }

    #[test]
    fn test_notified_without_destroy_rejected() {
        let info = CallableInfo::new("watch")
            .arg(ArgInfo::new("cb", callback()).scope(Scope::Notified).closure(1))
            .arg(ArgInfo::new("data", TypeTag::Pointer));

        let err = CallDescriptorBuilder::for_invoker(&info).build().unwrap_err();
        assert!(matches!(err, SetupError::NotifiedWithoutDestroy { .. }));
    }

    #[test]
    fn test_arrays_may_share_a_length() {
        let info = CallableInfo::new("pair")
            .arg(ArgInfo::new("a", int_array(2)))
            .arg(ArgInfo::new("b", int_array(2)))
            .arg(ArgInfo::new("n", TypeTag::Int32));

        let descriptor = CallDescriptorBuilder::for_invoker(&info).build().unwrap();
        assert_eq!(descriptor.role(0), ParamRole::Array { length: 2 });
        assert_eq!(descriptor.role(1), ParamRole::Array { length: 2 });
        assert_eq!(descriptor.role(2), ParamRole::Skipped(SkipReason::ArrayLength(LengthOwner::Param(0))));
        assert_eq!(descriptor.script_arg_count(), 2);
    }

    #[test]
    fn test_length_and_closure_on_same_partner() {
        let info = CallableInfo::new("mixed")
            .arg(ArgInfo::new("a", int_array(2)))
            .arg(ArgInfo::new("visit", callback()).closure(2))
            .arg(ArgInfo::new("n", TypeTag::Int32));

        let err = CallDescriptorBuilder::for_invoker(&info).build().unwrap_err();
        assert!(matches!(err, SetupError::PartnerClaimedTwice { index: 2, .. }));
    }

    #[test]
    fn test_unsized_array_rejected() {
        let unsized_array = TypeTag::Array(Box::new(ArrayInfo {
            element: TypeTag::Int32,
            length_arg: None,
            fixed_size: None,
            zero_terminated: false,
        }));
        let info = CallableInfo::new("mystery").arg(ArgInfo::new("values", unsized_array));

        let err = CallDescriptorBuilder::for_invoker(&info).build().unwrap_err();
        assert!(matches!(err, SetupError::UnsizedArray { .. }));
    }

    #[test]
    fn test_return_array_length_is_out_param() {
        let ret = TypeTag::Array(Box::new(ArrayInfo::with_length_arg(TypeTag::Int32, 0)));
        let info = CallableInfo::new("list")
            .arg(ArgInfo::out("n_items", TypeTag::UInt32))
            .returns(ret, Transfer::Everything);

        let desc = CallDescriptorBuilder::for_invoker(&info).build().unwrap();
        assert_eq!(desc.return_length(), Some(0));
        assert_eq!(
            desc.role(0),
            ParamRole::Skipped(SkipReason::ArrayLength(LengthOwner::Return))
        );
        assert_eq!(desc.output_count(), 1);
    }

    #[test]
    fn test_trampoline_hides_opaque_pointers() {
        let info = CallableInfo::new("Visitor")
            .arg(ArgInfo::new("item", TypeTag::Int32))
            .arg(ArgInfo::new("user_data", TypeTag::Pointer));

        let desc = CallDescriptorBuilder::for_trampoline(&info).build().unwrap();
        assert_eq!(desc.role(1), ParamRole::Skipped(SkipReason::OpaquePointer));
        assert_eq!(desc.script_arg_count(), 1);
    }

    #[test]
    fn test_caller_allocates_requires_out_struct() {
        let info = CallableInfo::new("bad").arg(ArgInfo::new("x", TypeTag::Int32).caller_allocates());
        let err = CallDescriptorBuilder::for_invoker(&info).build().unwrap_err();
        assert!(matches!(err, SetupError::InvalidCallerAllocates { .. }));
    }
}
