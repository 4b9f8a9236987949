//! Foreign call dispatch: the single in-flight call slot, the interpreter
//! gate, and the two scheduling models.
//!
//! Both schedulers share the promise stack and the coordinator. They differ
//! only in how the head promise is driven and how a script frame waits for
//! its foreign call to settle.

mod cooperative;
mod gate;
mod settle;
mod threaded;

pub(crate) use cooperative::CooperativeScheduler;
pub(crate) use gate::InterpreterGate;
pub(crate) use settle::SettleChannel;
pub(crate) use threaded::ThreadedScheduler;

use crate::runtime::bridge::Coordinator;
use crate::runtime::config::{BridgeConfig, SchedulingModel};
use crate::runtime::error::{BridgeError, ScriptError};
use crate::runtime::handle_table::FrameHandle;
use crate::runtime::promise::PromiseChannel;
use crate::runtime::value::Value;
use std::sync::{Arc, Weak};

/// State of the single foreign call slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForeignCallState {
    None,
    Running,
    Resolved,
    Rejected,
}

/// How a foreign call settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleKind {
    Ok,
    Error,
    Cancelled,
}

/// Contents of the result mailbox.
#[derive(Debug, Clone, PartialEq)]
pub struct Settlement {
    pub kind: SettleKind,
    pub value: Value,
}

impl Settlement {
    /// Turn the mailbox into what the calling script frame observes.
    pub fn into_result(self, function: &str) -> Result<Value, ScriptError> {
        match self.kind {
            SettleKind::Ok => Ok(self.value),
            SettleKind::Error => Err(ScriptError::foreign(function, self.value)),
            SettleKind::Cancelled => Err(ScriptError::cancelled(format!(
                "call to {} was cancelled",
                function
            ))),
        }
    }
}

/// Counters over foreign call dispatch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Calls currently between dispatch and settle (0 or 1)
    pub in_flight: usize,
    /// Highest `in_flight` ever observed
    pub max_in_flight: usize,
    pub total_dispatched: u64,
    pub total_settled: u64,
    pub total_cancelled: u64,
}

/// Drives promises and waits for foreign calls.
pub(crate) trait Scheduler: Send + Sync {
    fn model(&self) -> SchedulingModel;

    /// Called once the coordinator exists.
    fn start(&self, coordinator: Weak<Coordinator>) -> Result<(), BridgeError>;

    /// Get a QUEUEING head promise running. Called from the idle pump.
    fn drive(&self, coordinator: &Coordinator) -> Result<(), BridgeError>;

    /// Return once `frame` has settled (or been cancelled).
    ///
    /// `awaiting` is set when the calling promise is AWAITING an async call;
    /// only then may a newer promise run nested inside the wait.
    fn wait_for_settle(&self, coordinator: &Coordinator, frame: FrameHandle, awaiting: bool);

    fn shutdown(&self);
}

pub(crate) fn new_scheduler(
    config: &BridgeConfig,
    promises: Arc<PromiseChannel>,
) -> Box<dyn Scheduler> {
    match config.model {
        SchedulingModel::Threaded => Box::new(ThreadedScheduler::new(
            config.worker_thread_name.clone(),
            promises,
        )),
        SchedulingModel::Cooperative => Box::new(CooperativeScheduler::new(config.poll_interval)),
    }
}
