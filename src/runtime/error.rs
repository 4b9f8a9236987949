//! Error taxonomy for the bridge.
//!
//! [`DispatchError`] covers contract violations (reentrant calls, double
//! settles, calls from the wrong thread). [`ScriptError`] is what script code
//! observes at a call site or what a rejected promise carries. [`BridgeError`]
//! is the top-level error returned by host-facing entry points.

use crate::runtime::handle_table::{ForeignHandle, FrameHandle, PromiseId};
use crate::runtime::value::Value;
use std::fmt;
use thiserror::Error;

/// Contract violations between the interpreter, the bridge, and the host.
///
/// These are never retried. Every construction site also logs at `error!`.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DispatchError {
    #[error("foreign call issued while another foreign call is still in flight")]
    ReentrantCall,
    #[error("async foreign function '{0}' called outside of a running promise")]
    AsyncOutsidePromise(String),
    #[error("frame {0} is not awaiting a settle (settled twice, stale, or cancelled)")]
    DoubleSettle(FrameHandle),
    #[error("no foreign function registered for handle {0}")]
    UnknownFunction(ForeignHandle),
    #[error("foreign function '{0}' is already registered")]
    DuplicateFunction(String),
    #[error("no promise with id {0}")]
    UnknownPromise(PromiseId),
    #[error("idle pump invoked while interpreter frames are active on the host thread")]
    PumpWhileEvaluating,
    #[error("interpreter is active on another thread")]
    InterpreterBusy,
    #[error("operation must run on the host thread")]
    NotOnHostThread,
    #[error("bridge has been shut down")]
    Shutdown,
}

/// Category of a [`ScriptError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Raised by the script itself.
    Raised,
    /// A foreign function rejected.
    Foreign,
    /// The in-flight call was cancelled.
    Cancelled,
    /// A contract violation surfaced to script code.
    Dispatch,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Raised => "raised",
            ErrorKind::Foreign => "foreign",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Dispatch => "dispatch",
        };
        f.write_str(name)
    }
}

/// Failure observed by script code, or carried by a rejected promise.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind} error: {message}")]
pub struct ScriptError {
    pub kind: ErrorKind,
    pub message: String,
    /// Payload supplied by whoever raised the error.
    pub value: Value,
}

impl ScriptError {
    pub fn raised(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            kind: ErrorKind::Raised,
            value: Value::String(message.clone()),
            message,
        }
    }

    /// Rejection coming from a foreign function, keeping its payload intact.
    pub fn foreign(name: &str, value: Value) -> Self {
        Self {
            kind: ErrorKind::Foreign,
            message: format!("{} rejected: {}", name, value),
            value,
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Cancelled,
            message: message.into(),
            value: Value::Null,
        }
    }

    pub fn dispatch(err: &DispatchError) -> Self {
        Self {
            kind: ErrorKind::Dispatch,
            message: err.to_string(),
            value: Value::Null,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == ErrorKind::Cancelled
    }
}

impl From<DispatchError> for ScriptError {
    fn from(err: DispatchError) -> Self {
        ScriptError::dispatch(&err)
    }
}

/// Top-level error for host-facing operations.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Script(#[from] ScriptError),
    #[error("{0} promise(s) still outstanding; drain or cancel them before shutdown")]
    OutstandingPromises(usize),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("failed to spawn thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("host channel closed")]
    ChannelClosed,
}

/// Final result of a promise, handed to the host when it is retired.
#[derive(Debug, Clone, PartialEq)]
pub enum PromiseOutcome {
    Resolved(Value),
    Rejected(ScriptError),
}

impl PromiseOutcome {
    pub fn is_resolved(&self) -> bool {
        matches!(self, PromiseOutcome::Resolved(_))
    }

    pub fn into_result(self) -> Result<Value, ScriptError> {
        match self {
            PromiseOutcome::Resolved(value) => Ok(value),
            PromiseOutcome::Rejected(err) => Err(err),
        }
    }
}

impl From<Result<Value, ScriptError>> for PromiseOutcome {
    fn from(result: Result<Value, ScriptError>) -> Self {
        match result {
            Ok(value) => PromiseOutcome::Resolved(value),
            Err(err) => PromiseOutcome::Rejected(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_foreign_rejection_keeps_payload() {
        let err = ScriptError::foreign("fetch", Value::from("boom"));
        assert_eq!(err.kind, ErrorKind::Foreign);
        assert_eq!(err.value, Value::from("boom"));
        assert!(err.to_string().contains("fetch rejected: boom"));
    }

    #[test]
    fn test_dispatch_error_converts_to_script_error() {
        let err: ScriptError = DispatchError::ReentrantCall.into();
        assert_eq!(err.kind, ErrorKind::Dispatch);
        assert!(!err.is_cancelled());
    }

    #[test]
    fn test_outcome_round_trip() {
        let outcome: PromiseOutcome = Err(ScriptError::cancelled("stop")).into();
        assert!(!outcome.is_resolved());
        assert!(outcome.into_result().unwrap_err().is_cancelled());
    }
}
