//! Foreign function table.
//!
//! Host-implemented functions are registered here and exposed to scripts by
//! handle. The table is owned by the host thread; removals requested from any
//! other thread (an interpreter finalizer running on the worker, say) are
//! queued and applied by the next idle pump.

use crate::runtime::bridge::Settler;
use crate::runtime::conversion::{json_to_value, value_to_json};
use crate::runtime::dispatch::SettleKind;
use crate::runtime::error::{BridgeError, DispatchError};
use crate::runtime::handle_table::{ForeignHandle, FrameHandle, SlotMap};
use crate::runtime::host::IdlePump;
use crate::runtime::value::Value;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Handler that settles before returning. `Err` carries the rejection value.
pub type SyncHandler = Arc<dyn Fn(&[Value]) -> Result<Value, Value> + Send + Sync>;

/// Handler that settles later through the [`ForeignInvocation`] it receives.
pub type AsyncHandler = Arc<dyn Fn(ForeignInvocation) + Send + Sync>;

/// Host-side callable behind a foreign function handle.
#[derive(Clone)]
pub enum ForeignCallable {
    Sync(SyncHandler),
    Async(AsyncHandler),
}

impl ForeignCallable {
    pub fn sync<F>(handler: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Value, Value> + Send + Sync + 'static,
    {
        ForeignCallable::Sync(Arc::new(handler))
    }

    pub fn asynchronous<F>(handler: F) -> Self
    where
        F: Fn(ForeignInvocation) + Send + Sync + 'static,
    {
        ForeignCallable::Async(Arc::new(handler))
    }

    /// Wrap a JSON-in/JSON-out handler.
    ///
    /// Arguments that cannot be expressed as JSON, and handler errors, become
    /// rejections carrying the error message.
    pub fn json<F>(handler: F) -> Self
    where
        F: Fn(Vec<serde_json::Value>) -> Result<serde_json::Value, String> + Send + Sync + 'static,
    {
        ForeignCallable::sync(move |args: &[Value]| {
            let json_args = args
                .iter()
                .map(value_to_json)
                .collect::<Result<Vec<_>, _>>()
                .map_err(Value::String)?;
            let result = handler(json_args).map_err(Value::String)?;
            json_to_value(&result).map_err(Value::String)
        })
    }

    pub fn is_async(&self) -> bool {
        matches!(self, ForeignCallable::Async(_))
    }
}

impl fmt::Debug for ForeignCallable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForeignCallable::Sync(_) => f.write_str("ForeignCallable::Sync"),
            ForeignCallable::Async(_) => f.write_str("ForeignCallable::Async"),
        }
    }
}

/// A registered foreign function.
#[derive(Clone, Debug)]
pub struct ForeignFunction {
    pub name: String,
    pub callable: ForeignCallable,
}

/// Table of foreign functions keyed by generation-checked handle.
#[derive(Default)]
pub struct ForeignFunctionTable {
    functions: SlotMap<ForeignHandle, ForeignFunction>,
    by_name: HashMap<String, ForeignHandle>,
}

impl ForeignFunctionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new function.
    ///
    /// Fails if a live function already uses `name`.
    pub fn register(
        &mut self,
        name: String,
        callable: ForeignCallable,
    ) -> Result<ForeignHandle, DispatchError> {
        if self.by_name.contains_key(&name) {
            return Err(DispatchError::DuplicateFunction(name));
        }

        let handle = self.functions.insert(ForeignFunction {
            name: name.clone(),
            callable,
        });
        self.by_name.insert(name, handle);
        Ok(handle)
    }

    pub fn unregister(&mut self, handle: ForeignHandle) -> Result<ForeignFunction, DispatchError> {
        let function = self
            .functions
            .remove(handle)
            .ok_or(DispatchError::UnknownFunction(handle))?;
        self.by_name.remove(&function.name);
        Ok(function)
    }

    pub fn get(&self, handle: ForeignHandle) -> Option<&ForeignFunction> {
        self.functions.get(handle)
    }

    pub fn lookup(&self, name: &str) -> Option<ForeignHandle> {
        self.by_name.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Drop every entry, returning how many were still registered.
    pub fn discard(&mut self) -> usize {
        self.by_name.clear();
        self.functions.drain().len()
    }
}

/// Removal requests waiting for the host thread.
#[derive(Clone, Default)]
pub(crate) struct RemovalQueue {
    pending: Arc<Mutex<Vec<ForeignHandle>>>,
}

impl RemovalQueue {
    pub(crate) fn push(&self, handle: ForeignHandle) {
        self.pending.lock().push(handle);
    }

    pub(crate) fn take(&self) -> Vec<ForeignHandle> {
        std::mem::take(&mut *self.pending.lock())
    }
}

/// Removes a foreign function once its script-side action is collected.
///
/// Safe to run from any thread: the removal is queued and the host is asked
/// to pump, which applies it on the host thread.
pub struct Finalizer {
    handle: ForeignHandle,
    removals: RemovalQueue,
    pump: IdlePump,
}

impl Finalizer {
    pub(crate) fn new(handle: ForeignHandle, removals: RemovalQueue, pump: IdlePump) -> Self {
        Self {
            handle,
            removals,
            pump,
        }
    }

    pub fn handle(&self) -> ForeignHandle {
        self.handle
    }

    pub fn run(self) {
        debug!(handle = %self.handle, "foreign function collected; removal queued");
        self.removals.push(self.handle);
        self.pump.schedule();
    }
}

impl fmt::Debug for Finalizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Finalizer")
            .field("handle", &self.handle)
            .finish()
    }
}

/// One call to an asynchronous foreign function, delivered on the host thread.
///
/// The invocation must eventually be settled with [`resolve`](Self::resolve),
/// [`reject`](Self::reject) or [`complete`](Self::complete), from the host
/// thread. The script frame that made the call stays blocked until then.
pub struct ForeignInvocation {
    frame: FrameHandle,
    function: ForeignHandle,
    name: String,
    args: Vec<Value>,
    settler: Settler,
}

impl ForeignInvocation {
    pub(crate) fn new(
        frame: FrameHandle,
        function: ForeignHandle,
        name: String,
        args: Vec<Value>,
        settler: Settler,
    ) -> Self {
        Self {
            frame,
            function,
            name,
            args,
            settler,
        }
    }

    pub fn frame(&self) -> FrameHandle {
        self.frame
    }

    pub fn function(&self) -> ForeignHandle {
        self.function
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    /// A detached settler, for hosts that want to keep only the frame handle.
    pub fn settler(&self) -> Settler {
        self.settler.clone()
    }

    pub fn resolve(self, value: Value) -> Result<(), BridgeError> {
        self.settler.settle(self.frame, SettleKind::Ok, value)
    }

    pub fn reject(self, value: Value) -> Result<(), BridgeError> {
        self.settler.settle(self.frame, SettleKind::Error, value)
    }

    pub fn complete(self, result: Result<Value, Value>) -> Result<(), BridgeError> {
        match result {
            Ok(value) => self.resolve(value),
            Err(value) => self.reject(value),
        }
    }
}

impl fmt::Debug for ForeignInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForeignInvocation")
            .field("frame", &self.frame)
            .field("function", &self.name)
            .field("args", &self.args)
            .finish()
    }
}
