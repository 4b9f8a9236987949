//! LIFO stack of submitted promises and the channel guarding it.
//!
//! The newest promise is always the head, and only the head is ever started.
//! A promise submitted while another is awaiting a foreign call therefore
//! runs (nested) before the outer one resumes. There is no fairness between
//! promises: a steady stream of new submissions can starve an older one.

use crate::runtime::error::{DispatchError, PromiseOutcome, ScriptError};
use crate::runtime::handle_table::{PromiseId, SlotMap};
use crate::runtime::value::Value;
use parking_lot::{Condvar, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromiseState {
    Queueing,
    Running,
    Awaiting,
    Resolved,
    Rejected,
}

impl PromiseState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PromiseState::Resolved | PromiseState::Rejected)
    }
}

struct PromiseEntry {
    state: PromiseState,
    /// Taken when the promise starts running.
    code: Option<String>,
    outcome: Option<PromiseOutcome>,
}

#[derive(Default)]
pub(crate) struct PromiseStack {
    entries: SlotMap<PromiseId, PromiseEntry>,
    /// Push order; the last element is the head.
    order: Vec<PromiseId>,
}

impl PromiseStack {
    pub(crate) fn push(&mut self, code: String) -> PromiseId {
        let id = self.entries.insert(PromiseEntry {
            state: PromiseState::Queueing,
            code: Some(code),
            outcome: None,
        });
        self.order.push(id);
        id
    }

    pub(crate) fn head(&self) -> Option<(PromiseId, PromiseState)> {
        let id = *self.order.last()?;
        self.entries.get(id).map(|entry| (id, entry.state))
    }

    pub(crate) fn state(&self, id: PromiseId) -> Option<PromiseState> {
        self.entries.get(id).map(|entry| entry.state)
    }

    /// Move a queueing head to RUNNING and hand out its code.
    pub(crate) fn start_head(&mut self) -> Option<(PromiseId, String)> {
        let id = *self.order.last()?;
        let entry = self.entries.get_mut(id)?;
        if entry.state != PromiseState::Queueing {
            return None;
        }
        entry.state = PromiseState::Running;
        let code = entry.code.take().unwrap_or_default();
        Some((id, code))
    }

    pub(crate) fn set_state(
        &mut self,
        id: PromiseId,
        state: PromiseState,
    ) -> Result<(), DispatchError> {
        let entry = self
            .entries
            .get_mut(id)
            .ok_or(DispatchError::UnknownPromise(id))?;
        entry.state = state;
        Ok(())
    }

    pub(crate) fn complete(
        &mut self,
        id: PromiseId,
        result: Result<Value, ScriptError>,
    ) -> Result<(), DispatchError> {
        let entry = self
            .entries
            .get_mut(id)
            .ok_or(DispatchError::UnknownPromise(id))?;
        entry.state = if result.is_ok() {
            PromiseState::Resolved
        } else {
            PromiseState::Rejected
        };
        entry.outcome = Some(result.into());
        Ok(())
    }

    /// Pop the head if it has reached a terminal state.
    pub(crate) fn retire_head(&mut self) -> Option<(PromiseId, PromiseOutcome)> {
        let (id, state) = self.head()?;
        if !state.is_terminal() {
            return None;
        }
        self.order.pop();
        let entry = self.entries.remove(id)?;
        let outcome = entry.outcome.unwrap_or_else(|| {
            PromiseOutcome::Rejected(ScriptError::raised("promise settled without a result"))
        });
        Some((id, outcome))
    }

    /// Reject every promise that has not started yet.
    pub(crate) fn reject_queued(&mut self) -> usize {
        let mut rejected = 0;
        for id in &self.order {
            if let Some(entry) = self.entries.get_mut(*id) {
                if entry.state == PromiseState::Queueing {
                    entry.state = PromiseState::Rejected;
                    entry.code = None;
                    entry.outcome = Some(PromiseOutcome::Rejected(ScriptError::cancelled(
                        "promise cancelled before it started",
                    )));
                    rejected += 1;
                }
            }
        }
        rejected
    }

    pub(crate) fn len(&self) -> usize {
        self.order.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Outcome of asking the worker to run the head promise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunRequest {
    /// The worker was idle and will pick up the head.
    Queued,
    /// The worker is inside a run (possibly parked in a settle wait).
    WorkerBusy,
    Closed,
}

struct ChannelState {
    stack: PromiseStack,
    run_requested: bool,
    worker_busy: bool,
    closed: bool,
}

/// Promise stack plus the condition variable the worker waits on for work.
pub(crate) struct PromiseChannel {
    state: Mutex<ChannelState>,
    ready: Condvar,
}

impl PromiseChannel {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(ChannelState {
                stack: PromiseStack::default(),
                run_requested: false,
                worker_busy: false,
                closed: false,
            }),
            ready: Condvar::new(),
        }
    }

    /// Run `f` against the stack. `f` must not call back into the bridge.
    pub(crate) fn with_stack<R>(&self, f: impl FnOnce(&mut PromiseStack) -> R) -> R {
        f(&mut self.state.lock().stack)
    }

    pub(crate) fn request_run(&self) -> RunRequest {
        let mut state = self.state.lock();
        if state.closed {
            return RunRequest::Closed;
        }
        if state.worker_busy {
            return RunRequest::WorkerBusy;
        }
        state.run_requested = true;
        self.ready.notify_one();
        RunRequest::Queued
    }

    /// Block until a run is requested. Returns `false` once closed.
    pub(crate) fn wait_for_run(&self) -> bool {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return false;
            }
            if state.run_requested {
                state.run_requested = false;
                state.worker_busy = true;
                return true;
            }
            self.ready.wait(&mut state);
        }
    }

    pub(crate) fn mark_idle(&self) {
        self.state.lock().worker_busy = false;
    }

    pub(crate) fn close(&self) {
        self.state.lock().closed = true;
        self.ready.notify_all();
    }
}
