//! Bridge error taxonomy
//!
//! - `SetupError`: malformed signature, fatal to one wrapper
//! - `MarshalError` (in `ffi::marshal`): one value failed to convert
//! - `InvocationError`: the call itself failed or reported a native error
//! - `ProtocolViolation`: a broken refcount or trampoline invariant

use crate::ffi::marshal::MarshalError;
use crate::ffi::types::Direction;
use crate::lifetime::toggle::ToggleDirection;
use crate::value::{NativeError, Value};
use girder_config::ViolationPolicy;
use thiserror::Error;

/// Malformed callable signature, detected when a wrapper is built
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SetupError {
    #[error("{callable}: {arg} names length argument {partner}, which does not exist")]
    LengthPartnerOutOfRange {
        callable: String,
        arg: String,
        partner: usize,
    },

    #[error("{callable}: length argument {partner} of {arg} is not an integer")]
    LengthNotInteger {
        callable: String,
        arg: String,
        partner: usize,
    },

    #[error(
        "{callable}: length argument {partner} of {arg} must have direction {expected:?}, found {found:?}"
    )]
    LengthDirectionMismatch {
        callable: String,
        arg: String,
        partner: usize,
        expected: Direction,
        found: Direction,
    },

    #[error("{callable}: argument {index} is claimed as a side channel more than once")]
    PartnerClaimedTwice { callable: String, index: usize },

    #[error("{callable}: {arg} has no length argument, fixed size or terminator")]
    UnsizedArray { callable: String, arg: String },

    #[error("{callable}: callback {arg} takes a callback argument, which is not supported")]
    CallbackTakesCallback { callable: String, arg: String },

    #[error("{callable}: callback {arg} has a destroy notify but no user data argument")]
    DestroyWithoutClosure { callable: String, arg: String },

    #[error("{callable}: callback {arg} is scope notified but has no destroy notify")]
    NotifiedWithoutDestroy { callable: String, arg: String },

    #[error("{callable}: {arg} references side channel {partner}, which does not exist")]
    CallbackPartnerOutOfRange {
        callable: String,
        arg: String,
        partner: usize,
    },

    #[error("{callable}: caller-allocates argument {arg} must be an out struct or union")]
    InvalidCallerAllocates { callable: String, arg: String },

    #[error("{callable}: cannot prepare native call interface: {reason}")]
    CallInterface { callable: String, reason: String },

    #[error("{callable}: {reason}")]
    SymbolNotFound { callable: String, reason: String },
}

/// Failure of the call itself
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InvocationError {
    #[error("{function}: too few arguments (expected {expected}, got {got})")]
    TooFewArguments {
        function: String,
        expected: usize,
        got: usize,
    },

    #[error("{function}: method called without a receiver")]
    MissingReceiver { function: String },

    /// Error reported through the native error out-slot
    #[error("{0}")]
    Native(NativeError),
}

/// Broken refcount or trampoline protocol
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolViolation {
    #[error("toggle {direction} for object {object:#x} is already pending")]
    DuplicateToggle {
        object: usize,
        direction: ToggleDirection,
    },

    #[error("callback {callback} invoked after its context was destroyed")]
    DestroyedContext { callback: String },

    #[error("async callback {callback} invoked more than once")]
    AsyncCalledTwice { callback: String },

    #[error("native pointer {object:#x} already has a proxy")]
    DuplicateProxy { object: usize },
}

impl ProtocolViolation {
    /// Log the violation and apply `policy`
    ///
    /// Under `Abort` this does not return.
    pub fn enforce(self, policy: ViolationPolicy) -> Self {
        tracing::error!(event = "protocol_violation", policy = %policy, "{}", self);
        if policy == ViolationPolicy::Abort {
            std::process::abort();
        }
        self
    }
}

/// Any error a bridge operation can return
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Setup(#[from] SetupError),

    #[error(transparent)]
    Marshal(#[from] MarshalError),

    #[error(transparent)]
    Invocation(#[from] InvocationError),

    #[error(transparent)]
    Protocol(#[from] ProtocolViolation),
}

impl BridgeError {
    /// Scripting exception value for this error
    ///
    /// Native errors keep their domain and code; everything else becomes a
    /// message string.
    pub fn to_exception(&self) -> Value {
        match self {
            BridgeError::Invocation(InvocationError::Native(e)) => Value::Error(e.clone()),
            other => Value::string(other.to_string()),
        }
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;
