//! Seam between the bridge and the script interpreter it serializes.
//!
//! The interpreter itself (parsing, evaluation, garbage collection) lives
//! outside this crate. It only has to evaluate code, expose foreign functions
//! under a name, and report collection of those functions through a
//! [`Finalizer`].

use crate::runtime::error::ScriptError;
use crate::runtime::handle_table::{ForeignHandle, PromiseId};
use crate::runtime::ops::Finalizer;
use crate::runtime::value::Value;

/// A single-threaded, non-reentrant script interpreter.
///
/// The bridge guarantees that `evaluate` is active on at most one thread at a
/// time. A thread parked waiting for a foreign call to settle does not count
/// as active, so a nested evaluation may start on another thread (or on the
/// same thread, in the cooperative model) while it waits.
pub trait Interpreter: Send + Sync + 'static {
    /// Evaluate `code`, calling back through `ctx` for foreign functions.
    fn evaluate(&self, code: &str, ctx: &mut dyn CallContext) -> Result<Value, ScriptError>;

    /// Make the foreign function `handle` callable from scripts as `name`.
    fn define_foreign(&self, name: &str, handle: ForeignHandle);

    /// Attach a finalizer to the script-side action for `handle`. The
    /// interpreter runs it when its collector destroys that action; it may
    /// do so from any thread.
    fn register_finalizer(&self, handle: ForeignHandle, finalizer: Finalizer);

    /// Consume a pending halt request (for example an interrupt key).
    fn take_halt_signal(&self) -> bool {
        false
    }
}

/// Calls available to script code while it is being evaluated.
pub trait CallContext {
    /// Invoke a foreign function and logically block until it settles.
    ///
    /// A foreign rejection or a cancellation comes back as the error.
    fn call_foreign(&mut self, handle: ForeignHandle, args: Vec<Value>)
        -> Result<Value, ScriptError>;

    /// Cooperative signal check. Consumes a pending cancellation request.
    fn check_signals(&mut self) -> Result<(), ScriptError>;

    /// The promise being evaluated, if any.
    fn promise(&self) -> Option<PromiseId>;
}
