//! Keeps interpreter code active on at most one thread at a time.
//!
//! A thread holds the gate while it evaluates. Re-entering on the same thread
//! nests. A frame parked in a settle wait suspends its thread's hold so a
//! nested evaluation can run elsewhere, and re-acquires it before resuming.

use crate::runtime::error::DispatchError;
use parking_lot::{Condvar, Mutex};
use std::thread::{self, ThreadId};

struct GateState {
    owner: Option<ThreadId>,
    depth: usize,
}

pub(crate) struct InterpreterGate {
    state: Mutex<GateState>,
    released: Condvar,
}

impl InterpreterGate {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(GateState {
                owner: None,
                depth: 0,
            }),
            released: Condvar::new(),
        }
    }

    /// Acquire the gate for the current thread.
    ///
    /// When another thread is active, `blocking` waits for it to release or
    /// suspend; otherwise this fails with `InterpreterBusy`.
    pub(crate) fn enter(&self, blocking: bool) -> Result<GateGuard<'_>, DispatchError> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        loop {
            match state.owner {
                None => {
                    state.owner = Some(me);
                    state.depth = 1;
                    break;
                }
                Some(owner) if owner == me => {
                    state.depth += 1;
                    break;
                }
                Some(_) if blocking => self.released.wait(&mut state),
                Some(_) => return Err(DispatchError::InterpreterBusy),
            }
        }
        Ok(GateGuard { gate: self })
    }

    /// Release the current thread's hold until the guard drops.
    pub(crate) fn suspend(&self) -> SuspendGuard<'_> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        let saved = if state.owner == Some(me) {
            let depth = state.depth;
            state.owner = None;
            state.depth = 0;
            self.released.notify_all();
            depth
        } else {
            0
        };
        SuspendGuard { gate: self, saved }
    }

    pub(crate) fn is_active_here(&self) -> bool {
        self.state.lock().owner == Some(thread::current().id())
    }
}

pub(crate) struct GateGuard<'a> {
    gate: &'a InterpreterGate,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.gate.state.lock();
        state.depth = state.depth.saturating_sub(1);
        if state.depth == 0 {
            state.owner = None;
            self.gate.released.notify_all();
        }
    }
}

pub(crate) struct SuspendGuard<'a> {
    gate: &'a InterpreterGate,
    saved: usize,
}

impl Drop for SuspendGuard<'_> {
    fn drop(&mut self) {
        if self.saved == 0 {
            return;
        }
        let me = thread::current().id();
        let mut state = self.gate.state.lock();
        loop {
            match state.owner {
                None => {
                    state.owner = Some(me);
                    state.depth = self.saved;
                    return;
                }
                Some(owner) if owner == me => {
                    state.depth += self.saved;
                    return;
                }
                Some(_) => self.gate.released.wait(&mut state),
            }
        }
    }
}
