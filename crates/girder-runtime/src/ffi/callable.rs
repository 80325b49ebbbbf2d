//! Callable descriptors
//!
//! `CallableInfo` is the per-callable view of the type-description
//! repository: ordered arguments, return type, error reporting and the
//! optional implicit receiver. It is immutable once built and shared by the
//! invokers and trampolines created from it.

use crate::ffi::types::{Direction, ObjectClass, Scope, StructInfo, Transfer, TypeTag};
use std::sync::Arc;

/// One declared argument
#[derive(Debug, Clone, PartialEq)]
pub struct ArgInfo {
    pub name: String,
    pub direction: Direction,
    pub ty: TypeTag,
    pub transfer: Transfer,
    pub nullable: bool,
    /// Out struct whose storage the caller supplies
    pub caller_allocates: bool,
    /// Lifetime of a callback argument
    pub scope: Scope,
    /// Index of the user-data argument of a callback
    pub closure: Option<usize>,
    /// Index of the destroy-notify argument of a callback
    pub destroy: Option<usize>,
}

impl ArgInfo {
    pub fn new(name: impl Into<String>, ty: TypeTag) -> Self {
        Self {
            name: name.into(),
            direction: Direction::In,
            ty,
            transfer: Transfer::Nothing,
            nullable: false,
            caller_allocates: false,
            scope: Scope::Call,
            closure: None,
            destroy: None,
        }
    }

    pub fn out(name: impl Into<String>, ty: TypeTag) -> Self {
        Self {
            direction: Direction::Out,
            ..Self::new(name, ty)
        }
    }

    pub fn inout(name: impl Into<String>, ty: TypeTag) -> Self {
        Self {
            direction: Direction::InOut,
            ..Self::new(name, ty)
        }
    }

    pub fn transfer(mut self, transfer: Transfer) -> Self {
        self.transfer = transfer;
        self
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn caller_allocates(mut self) -> Self {
        self.caller_allocates = true;
        self
    }

    pub fn scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    pub fn closure(mut self, index: usize) -> Self {
        self.closure = Some(index);
        self
    }

    pub fn destroy(mut self, index: usize) -> Self {
        self.destroy = Some(index);
        self
    }
}

/// Kind of implicit receiver passed before the declared arguments
#[derive(Debug, Clone, PartialEq)]
pub enum ReceiverInfo {
    /// Struct method; the receiver is passed by pointer
    Struct {
        info: Arc<StructInfo>,
        transfer: Transfer,
    },
    /// Object method
    Object {
        class: Arc<ObjectClass>,
        transfer: Transfer,
    },
    /// Class method; the class-structure pointer is passed
    Class(Arc<ObjectClass>),
    /// Method on the native error type
    Error,
}

/// Function, virtual method or callback signature
#[derive(Debug, Clone, PartialEq)]
pub struct CallableInfo {
    pub name: String,
    /// Exported symbol, when the callable is a library function
    pub symbol: Option<String>,
    pub args: Vec<ArgInfo>,
    pub return_type: TypeTag,
    pub return_transfer: Transfer,
    pub return_nullable: bool,
    /// Return value carries no information for script (e.g. a status flag)
    pub skip_return: bool,
    /// A trailing native error out-slot follows the declared arguments
    pub can_throw: bool,
    pub receiver: Option<ReceiverInfo>,
}

impl CallableInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            symbol: None,
            args: Vec::new(),
            return_type: TypeTag::Void,
            return_transfer: Transfer::Nothing,
            return_nullable: false,
            skip_return: false,
            can_throw: false,
            receiver: None,
        }
    }

    pub fn symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = Some(symbol.into());
        self
    }

    pub fn arg(mut self, arg: ArgInfo) -> Self {
        self.args.push(arg);
        self
    }

    pub fn returns(mut self, ty: TypeTag, transfer: Transfer) -> Self {
        self.return_type = ty;
        self.return_transfer = transfer;
        self
    }

    pub fn return_nullable(mut self) -> Self {
        self.return_nullable = true;
        self
    }

    pub fn skip_return(mut self) -> Self {
        self.skip_return = true;
        self
    }

    pub fn throws(mut self) -> Self {
        self.can_throw = true;
        self
    }

    pub fn method(mut self, receiver: ReceiverInfo) -> Self {
        self.receiver = Some(receiver);
        self
    }

    pub fn is_method(&self) -> bool {
        self.receiver.is_some()
    }

    /// The return value is visible to script
    pub fn has_return_value(&self) -> bool {
        self.return_type != TypeTag::Void && !self.skip_return
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let info = CallableInfo::new("concat")
            .symbol("girder_concat")
            .arg(ArgInfo::new("a", TypeTag::Utf8))
            .arg(ArgInfo::out("b", TypeTag::Int32).nullable())
            .returns(TypeTag::Utf8, Transfer::Everything)
            .throws();

        assert_eq!(info.args.len(), 2);
        assert_eq!(info.args[1].direction, Direction::Out);
        assert!(info.args[1].nullable);
        assert!(info.can_throw);
        assert!(!info.is_method());
        assert!(info.has_return_value());
    }

    #[test]
    fn test_skipped_return_is_not_visible() {
        let info = CallableInfo::new("status")
            .returns(TypeTag::Boolean, Transfer::Nothing)
            .skip_return();
        assert!(!info.has_return_value());
    }
}
