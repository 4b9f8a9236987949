//! Minimal single-threaded event loop for cooperative hosts.
//!
//! Tasks and timers are posted from anywhere and run on whichever thread
//! drives the loop. The loop lock is never held while a task runs, so a task
//! may drive the loop again (the cooperative scheduler does exactly that when
//! it yields between settle polls).

use crate::runtime::error::PromiseOutcome;
use crate::runtime::handle_table::PromiseId;
use crate::runtime::host::{HostHooks, IdlePump};
use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::error;

type Task = Box<dyn FnOnce() + Send>;

struct Timer {
    due: Instant,
    seq: u64,
    task: Task,
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Timer {}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timer {
    // Reversed so the earliest timer sits on top of the max-heap.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct LoopState {
    ready: VecDeque<Task>,
    timers: BinaryHeap<Timer>,
    next_seq: u64,
}

impl LoopState {
    fn promote_due_timers(&mut self, now: Instant) {
        while self.timers.peek().is_some_and(|timer| timer.due <= now) {
            if let Some(timer) = self.timers.pop() {
                self.ready.push_back(timer.task);
            }
        }
    }
}

#[derive(Default)]
struct LoopInner {
    state: Mutex<LoopState>,
    wakeup: Condvar,
}

#[derive(Clone, Default)]
pub struct EventLoop {
    inner: Arc<LoopInner>,
}

impl EventLoop {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn post(&self, task: impl FnOnce() + Send + 'static) {
        self.inner.state.lock().ready.push_back(Box::new(task));
        self.inner.wakeup.notify_all();
    }

    pub fn post_after(&self, delay: Duration, task: impl FnOnce() + Send + 'static) {
        let mut state = self.inner.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.timers.push(Timer {
            due: Instant::now() + delay,
            seq,
            task: Box::new(task),
        });
        drop(state);
        self.inner.wakeup.notify_all();
    }

    /// Run at most one task, waiting up to `max_wait` for one to become
    /// ready. Returns `true` if a task ran.
    pub fn run_once(&self, max_wait: Duration) -> bool {
        let deadline = Instant::now() + max_wait;
        let task = {
            let mut state = self.inner.state.lock();
            loop {
                let now = Instant::now();
                state.promote_due_timers(now);
                if let Some(task) = state.ready.pop_front() {
                    break task;
                }
                if now >= deadline {
                    return false;
                }
                let wake_at = state
                    .timers
                    .peek()
                    .map_or(deadline, |timer| timer.due.min(deadline));
                self.inner.wakeup.wait_until(&mut state, wake_at);
            }
        };
        task();
        true
    }

    /// Run tasks for `duration`.
    pub fn run_for(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            self.run_once(deadline - now);
        }
    }

    /// Run tasks until `done` returns `true` or `timeout` elapses.
    pub fn run_until(&self, timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if done() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.run_once((deadline - now).min(Duration::from_millis(10)));
        }
    }

    pub fn is_idle(&self) -> bool {
        let state = self.inner.state.lock();
        state.ready.is_empty() && state.timers.is_empty()
    }
}

/// [`HostHooks`] backed by an [`EventLoop`].
///
/// Idle pumps become loop tasks, and retired promises are recorded in the
/// order they were retired.
pub struct LoopHost {
    event_loop: EventLoop,
    outcomes: Mutex<Vec<(PromiseId, PromiseOutcome)>>,
}

impl LoopHost {
    pub fn new(event_loop: EventLoop) -> Self {
        Self {
            event_loop,
            outcomes: Mutex::new(Vec::new()),
        }
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.event_loop
    }

    pub fn outcome(&self, id: PromiseId) -> Option<PromiseOutcome> {
        self.outcomes
            .lock()
            .iter()
            .find(|(settled, _)| *settled == id)
            .map(|(_, outcome)| outcome.clone())
    }

    /// Every retired promise so far, in retirement order.
    pub fn outcomes(&self) -> Vec<(PromiseId, PromiseOutcome)> {
        self.outcomes.lock().clone()
    }

    pub fn settled_count(&self) -> usize {
        self.outcomes.lock().len()
    }
}

impl HostHooks for LoopHost {
    fn schedule_idle(&self, pump: IdlePump) {
        self.event_loop.post(move || {
            if let Err(err) = pump.run() {
                error!(%err, "idle pump failed");
            }
        });
    }

    fn promise_settled(&self, id: PromiseId, outcome: PromiseOutcome) {
        self.outcomes.lock().push((id, outcome));
    }

    fn yield_for(&self, interval: Duration) {
        self.event_loop.run_for(interval);
    }
}
