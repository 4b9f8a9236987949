//! The dispatch coordinator and its host-facing handle.
//!
//! One [`Coordinator`] owns the promise stack, the foreign call slot, the
//! foreign function table and the scheduler. [`Bridge`] is a cheap cloneable
//! handle to it; nothing here is process-global, so several interpreters can
//! each have their own bridge.

use crate::runtime::config::BridgeConfig;
use crate::runtime::dispatch::{
    new_scheduler, DispatchStats, ForeignCallState, InterpreterGate, Scheduler, SettleChannel,
    SettleKind,
};
use crate::runtime::error::{BridgeError, DispatchError, ScriptError};
use crate::runtime::handle_table::{ForeignHandle, FrameHandle, PromiseId};
use crate::runtime::host::{HostHooks, IdlePump};
use crate::runtime::interpreter::{CallContext, Interpreter};
use crate::runtime::ops::{
    Finalizer, ForeignCallable, ForeignFunctionTable, ForeignInvocation, RemovalQueue,
};
use crate::runtime::promise::{PromiseChannel, PromiseState};
use crate::runtime::value::Value;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use tracing::{debug, error, trace, warn};

/// Snapshot of a bridge's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub dispatch: DispatchStats,
    pub pending_promises: usize,
    pub registered_functions: usize,
}

/// A registration the interpreter has not been told about yet.
struct Binding {
    name: String,
    handle: ForeignHandle,
    finalizer: Finalizer,
}

pub(crate) struct Coordinator {
    config: BridgeConfig,
    host_thread: ThreadId,
    hooks: Arc<dyn HostHooks>,
    interpreter: Arc<dyn Interpreter>,
    scheduler: Box<dyn Scheduler>,
    promises: Arc<PromiseChannel>,
    pub(crate) settle: SettleChannel,
    gate: InterpreterGate,
    functions: Mutex<ForeignFunctionTable>,
    removals: RemovalQueue,
    bindings: Mutex<Vec<Binding>>,
    cancel_requested: AtomicBool,
    shut_down: AtomicBool,
    self_ref: Weak<Coordinator>,
}

impl Coordinator {
    pub(crate) fn hooks(&self) -> &dyn HostHooks {
        self.hooks.as_ref()
    }

    fn is_host_thread(&self) -> bool {
        thread::current().id() == self.host_thread
    }

    fn ensure_host_thread(&self) -> Result<(), DispatchError> {
        if self.is_host_thread() {
            Ok(())
        } else {
            Err(dispatch_failure(DispatchError::NotOnHostThread))
        }
    }

    fn ensure_running(&self) -> Result<(), DispatchError> {
        if self.shut_down.load(Ordering::Acquire) {
            Err(DispatchError::Shutdown)
        } else {
            Ok(())
        }
    }

    pub(crate) fn schedule_idle(&self) {
        self.hooks.schedule_idle(IdlePump::new(self.self_ref.clone()));
    }

    fn submit_promise(&self, code: String) -> Result<PromiseId, BridgeError> {
        self.ensure_host_thread()?;
        self.ensure_running()?;
        let id = self.promises.with_stack(|stack| stack.push(code));
        debug!(promise = %id, "promise queued");
        self.schedule_idle();
        Ok(id)
    }

    pub(crate) fn idle_pump(&self) -> Result<(), BridgeError> {
        self.ensure_host_thread()?;
        if self.gate.is_active_here() {
            return Err(dispatch_failure(DispatchError::PumpWhileEvaluating).into());
        }

        self.drain_removals();
        self.checkpoint_cancellation();

        if let Some(request) = self.settle.take_request() {
            self.invoke_on_host(request.frame, request.function, request.args);
        }

        let head = self.promises.with_stack(|stack| stack.head());
        if let Some((id, PromiseState::Queueing)) = head {
            trace!(promise = %id, "driving head promise");
            self.scheduler.drive(self)?;
        }

        if let Some((id, outcome)) = self.promises.with_stack(|stack| stack.retire_head()) {
            debug!(promise = %id, resolved = outcome.is_resolved(), "promise retired");
            self.hooks.promise_settled(id, outcome);
            if !self.promises.with_stack(|stack| stack.is_empty()) {
                self.schedule_idle();
            }
        }
        Ok(())
    }

    /// Start the head promise if it is queueing and evaluate it to
    /// completion. Runs on whichever thread owns the interpreter.
    pub(crate) fn run_head_step(&self) {
        let Some((id, code)) = self.promises.with_stack(|stack| stack.start_head()) else {
            return;
        };
        debug!(promise = %id, "promise running");

        // The host thread never blocks on the interpreter.
        let result = match self.gate.enter(!self.is_host_thread()) {
            Ok(_guard) => {
                self.apply_bindings();
                let mut site = CallSite {
                    coordinator: self,
                    promise: Some(id),
                };
                self.interpreter.evaluate(&code, &mut site)
            }
            Err(err) => Err(dispatch_failure(err).into()),
        };

        match &result {
            Ok(value) => trace!(promise = %id, %value, "promise resolved"),
            Err(err) => trace!(promise = %id, %err, "promise rejected"),
        }
        if let Err(err) = self.promises.with_stack(|stack| stack.complete(id, result)) {
            dispatch_failure(err);
        }
    }

    fn apply_bindings(&self) {
        let pending = std::mem::take(&mut *self.bindings.lock());
        for binding in pending {
            trace!(name = %binding.name, handle = %binding.handle, "binding foreign function");
            self.interpreter.define_foreign(&binding.name, binding.handle);
            self.interpreter
                .register_finalizer(binding.handle, binding.finalizer);
        }
    }

    fn drain_removals(&self) {
        for handle in self.removals.take() {
            match self.functions.lock().unregister(handle) {
                Ok(function) => debug!(name = %function.name, %handle, "foreign function removed"),
                Err(err) => {
                    dispatch_failure(err);
                }
            }
        }
    }

    /// Consume a pending cancellation (or halt) request. Returns `true` if
    /// it cancelled an in-flight foreign call.
    ///
    /// A request that finds nothing in flight is spent here too; it never
    /// carries over to a later call.
    pub(crate) fn checkpoint_cancellation(&self) -> bool {
        let halted = self.interpreter.take_halt_signal();
        if halted {
            debug!("halt signal received");
        }
        let requested = self.cancel_requested.swap(false, Ordering::SeqCst);
        if !halted && !requested {
            return false;
        }
        match self.settle.cancel_in_flight() {
            Some(frame) => {
                debug!(frame = %frame, "in-flight foreign call cancelled");
                true
            }
            None => {
                debug!("cancellation found no foreign call in flight");
                false
            }
        }
    }

    fn call_foreign(
        &self,
        promise: Option<PromiseId>,
        handle: ForeignHandle,
        args: Vec<Value>,
    ) -> Result<Value, ScriptError> {
        let (name, is_async) = {
            let functions = self.functions.lock();
            match functions.get(handle) {
                Some(function) => (function.name.clone(), function.callable.is_async()),
                None => return Err(dispatch_failure(DispatchError::UnknownFunction(handle)).into()),
            }
        };
        if is_async && promise.is_none() {
            return Err(dispatch_failure(DispatchError::AsyncOutsidePromise(name)).into());
        }

        let on_host = self.is_host_thread();
        let (frame, direct_args) = if on_host {
            (self.settle.begin(handle, None), Some(args))
        } else {
            (self.settle.begin(handle, Some(args)), None)
        };
        let frame = frame.map_err(dispatch_failure)?;
        trace!(frame = %frame, function = %name, on_host, "foreign call dispatched");

        if is_async {
            self.set_promise_state(promise, PromiseState::Awaiting);
        }

        match direct_args {
            Some(args) => {
                self.invoke_on_host(frame, handle, args);
                if !self.settle.is_settled(frame) {
                    let _suspended = self.gate.suspend();
                    self.scheduler.wait_for_settle(self, frame, is_async);
                }
            }
            None => {
                self.schedule_idle();
                let _suspended = self.gate.suspend();
                self.scheduler.wait_for_settle(self, frame, is_async);
            }
        }

        let settlement = self.settle.finish(frame);
        if is_async {
            self.set_promise_state(promise, PromiseState::Running);
        }
        match settlement {
            Some(settlement) => {
                trace!(frame = %frame, kind = ?settlement.kind, "foreign call completed");
                settlement.into_result(&name)
            }
            None => Err(ScriptError::raised(format!(
                "call to {} returned without settling",
                name
            ))),
        }
    }

    fn set_promise_state(&self, promise: Option<PromiseId>, state: PromiseState) {
        if let Some(id) = promise {
            if let Err(err) = self.promises.with_stack(|stack| stack.set_state(id, state)) {
                dispatch_failure(err);
            }
        }
    }

    /// Run a foreign function on the host thread.
    fn invoke_on_host(&self, frame: FrameHandle, handle: ForeignHandle, args: Vec<Value>) {
        let function = self
            .functions
            .lock()
            .get(handle)
            .map(|function| (function.name.clone(), function.callable.clone()));

        let Some((name, callable)) = function else {
            // Removed between dispatch and delivery.
            let err = dispatch_failure(DispatchError::UnknownFunction(handle));
            let _ = self
                .settle
                .settle(frame, SettleKind::Error, Value::String(err.to_string()));
            return;
        };

        trace!(frame = %frame, function = %name, "invoking foreign function");
        match callable {
            ForeignCallable::Sync(handler) => {
                let (kind, value) = match handler(&args) {
                    Ok(value) => (SettleKind::Ok, value),
                    Err(value) => (SettleKind::Error, value),
                };
                if let Err(err) = self.settle.settle(frame, kind, value) {
                    warn!(frame = %frame, function = %name, %err, "result of synchronous foreign call dropped");
                }
            }
            ForeignCallable::Async(handler) => {
                let settler = Settler {
                    coordinator: self.self_ref.clone(),
                };
                handler(ForeignInvocation::new(frame, handle, name, args, settler));
            }
        }
    }

    fn settle(&self, frame: FrameHandle, kind: SettleKind, value: Value) -> Result<(), BridgeError> {
        self.ensure_host_thread()?;
        self.settle
            .settle(frame, kind, value)
            .map_err(dispatch_failure)?;
        trace!(frame = %frame, ?kind, "foreign call settled");
        Ok(())
    }

    fn cancel(&self) {
        debug!("cancellation requested");
        self.cancel_requested.store(true, Ordering::SeqCst);
        self.schedule_idle();
    }

    fn take_cancel_signal(&self) -> bool {
        self.cancel_requested.swap(false, Ordering::SeqCst)
    }

    fn evaluate_on_host(&self, code: &str) -> Result<Value, BridgeError> {
        self.ensure_host_thread()?;
        self.ensure_running()?;
        let _guard = self.gate.enter(false).map_err(dispatch_failure)?;
        self.apply_bindings();
        let mut site = CallSite {
            coordinator: self,
            promise: None,
        };
        Ok(self.interpreter.evaluate(code, &mut site)?)
    }

    fn register_foreign_function(
        &self,
        name: &str,
        callable: ForeignCallable,
    ) -> Result<ForeignHandle, BridgeError> {
        self.ensure_host_thread()?;
        self.ensure_running()?;
        let is_async = callable.is_async();
        let handle = self
            .functions
            .lock()
            .register(name.to_string(), callable)
            .map_err(dispatch_failure)?;
        self.bindings.lock().push(Binding {
            name: name.to_string(),
            handle,
            finalizer: self.finalizer(handle),
        });
        debug!(name, %handle, is_async, "foreign function registered");
        Ok(handle)
    }

    fn unregister_foreign_function(&self, handle: ForeignHandle) -> Result<(), BridgeError> {
        self.ensure_host_thread()?;
        let function = self
            .functions
            .lock()
            .unregister(handle)
            .map_err(dispatch_failure)?;
        self.bindings
            .lock()
            .retain(|binding| binding.handle != handle);
        debug!(name = %function.name, %handle, "foreign function unregistered");
        Ok(())
    }

    fn finalizer(&self, handle: ForeignHandle) -> Finalizer {
        Finalizer::new(
            handle,
            self.removals.clone(),
            IdlePump::new(self.self_ref.clone()),
        )
    }

    fn reject_queued(&self) -> Result<usize, BridgeError> {
        self.ensure_host_thread()?;
        let rejected = self.promises.with_stack(|stack| stack.reject_queued());
        if rejected > 0 {
            debug!(rejected, "queued promises cancelled");
            self.schedule_idle();
        }
        Ok(rejected)
    }

    fn shutdown(&self) -> Result<(), BridgeError> {
        self.ensure_host_thread()?;
        if self.shut_down.load(Ordering::Acquire) {
            return Ok(());
        }

        let outstanding = self.promises.with_stack(|stack| stack.len());
        if outstanding > 0 {
            return Err(BridgeError::OutstandingPromises(outstanding));
        }

        let leaked = self.functions.lock().discard();
        if leaked > 0 {
            warn!(leaked, "foreign functions still registered at shutdown; discarding");
        }
        self.bindings.lock().clear();
        self.removals.take();

        self.shut_down.store(true, Ordering::Release);
        self.scheduler.shutdown();
        debug!(model = ?self.scheduler.model(), "bridge shut down");
        Ok(())
    }

    fn stats(&self) -> BridgeStats {
        BridgeStats {
            dispatch: self.settle.stats(),
            pending_promises: self.promises.with_stack(|stack| stack.len()),
            registered_functions: self.functions.lock().len(),
        }
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        let outstanding = self.promises.with_stack(|stack| stack.len());
        if outstanding > 0 {
            warn!(outstanding, "bridge dropped with promises outstanding");
        }
        if self.settle.state() != ForeignCallState::None {
            warn!("bridge dropped with a foreign call in flight");
        }
    }
}

/// Log a contract violation and hand it back for propagation.
fn dispatch_failure(err: DispatchError) -> DispatchError {
    error!(%err, "dispatch error");
    err
}

/// [`CallContext`] handed to the interpreter for one evaluation.
struct CallSite<'a> {
    coordinator: &'a Coordinator,
    promise: Option<PromiseId>,
}

impl CallContext for CallSite<'_> {
    fn call_foreign(
        &mut self,
        handle: ForeignHandle,
        args: Vec<Value>,
    ) -> Result<Value, ScriptError> {
        self.coordinator.call_foreign(self.promise, handle, args)
    }

    fn check_signals(&mut self) -> Result<(), ScriptError> {
        if self.coordinator.take_cancel_signal() {
            return Err(ScriptError::cancelled("evaluation cancelled"));
        }
        Ok(())
    }

    fn promise(&self) -> Option<PromiseId> {
        self.promise
    }
}

/// Settles foreign call frames from the host thread.
#[derive(Clone)]
pub struct Settler {
    coordinator: Weak<Coordinator>,
}

impl Settler {
    pub fn settle(&self, frame: FrameHandle, kind: SettleKind, value: Value) -> Result<(), BridgeError> {
        let coordinator = self
            .coordinator
            .upgrade()
            .ok_or(DispatchError::Shutdown)?;
        coordinator.settle(frame, kind, value)
    }
}

/// Host-facing handle to a bridge.
///
/// Everything except [`cancel`](Self::cancel) and [`stats`](Self::stats) must
/// be called on the thread that created the bridge (the host thread).
#[derive(Clone)]
pub struct Bridge {
    coordinator: Arc<Coordinator>,
}

impl Bridge {
    /// Create a bridge and start its scheduler.
    ///
    /// The calling thread becomes the host thread.
    pub fn new(
        config: BridgeConfig,
        interpreter: Arc<dyn Interpreter>,
        hooks: Arc<dyn HostHooks>,
    ) -> Result<Self, BridgeError> {
        config.validate()?;

        let promises = Arc::new(PromiseChannel::new());
        let scheduler = new_scheduler(&config, promises.clone());
        let coordinator = Arc::new_cyclic(|self_ref| Coordinator {
            config,
            host_thread: thread::current().id(),
            hooks,
            interpreter,
            scheduler,
            promises,
            settle: SettleChannel::new(),
            gate: InterpreterGate::new(),
            functions: Mutex::new(ForeignFunctionTable::new()),
            removals: RemovalQueue::default(),
            bindings: Mutex::new(Vec::new()),
            cancel_requested: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            self_ref: self_ref.clone(),
        });

        coordinator
            .scheduler
            .start(Arc::downgrade(&coordinator))?;
        debug!(model = ?coordinator.config.model, "bridge started");
        Ok(Self { coordinator })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.coordinator.config
    }

    /// Queue `code` as a new promise and schedule an idle pump.
    ///
    /// Never evaluates anything before returning.
    pub fn submit_promise(&self, code: impl Into<String>) -> Result<PromiseId, BridgeError> {
        self.coordinator.submit_promise(code.into())
    }

    /// Advance the bridge by one step.
    ///
    /// Must only be called when the host has no interpreter frames on its own
    /// stack.
    pub fn idle_pump(&self) -> Result<(), BridgeError> {
        self.coordinator.idle_pump()
    }

    pub fn register_foreign_function(
        &self,
        name: &str,
        callable: ForeignCallable,
    ) -> Result<ForeignHandle, BridgeError> {
        self.coordinator.register_foreign_function(name, callable)
    }

    pub fn unregister_foreign_function(&self, handle: ForeignHandle) -> Result<(), BridgeError> {
        self.coordinator.unregister_foreign_function(handle)
    }

    /// A finalizer that removes `handle` from any thread.
    pub fn finalizer(&self, handle: ForeignHandle) -> Finalizer {
        self.coordinator.finalizer(handle)
    }

    /// Supply the result of the outstanding foreign call `frame`.
    pub fn settle(&self, frame: FrameHandle, kind: SettleKind, value: Value) -> Result<(), BridgeError> {
        self.coordinator.settle(frame, kind, value)
    }

    /// Request cooperative cancellation of the in-flight foreign call.
    ///
    /// The call is rejected with kind `cancelled` at the next checkpoint. If
    /// nothing is in flight by then, the request is dropped. Safe to call
    /// from any thread.
    pub fn cancel(&self) {
        self.coordinator.cancel();
    }

    /// Evaluate `code` synchronously on the host thread, outside any promise.
    pub fn evaluate_on_host(&self, code: &str) -> Result<Value, BridgeError> {
        self.coordinator.evaluate_on_host(code)
    }

    /// Reject every promise that has not started yet.
    pub fn reject_queued(&self) -> Result<usize, BridgeError> {
        self.coordinator.reject_queued()
    }

    /// Stop the bridge. Fails while promises are outstanding.
    pub fn shutdown(&self) -> Result<(), BridgeError> {
        self.coordinator.shutdown()
    }

    pub fn is_shutdown(&self) -> bool {
        self.coordinator.shut_down.load(Ordering::Acquire)
    }

    pub fn foreign_call_state(&self) -> ForeignCallState {
        self.coordinator.settle.state()
    }

    pub fn stats(&self) -> BridgeStats {
        self.coordinator.stats()
    }
}
