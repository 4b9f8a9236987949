//! Threaded scheduling: a dedicated interpreter-owner thread.
//!
//! The worker sleeps on the promise channel until the idle pump asks it to
//! run the head promise. While a script frame waits for a foreign call the
//! worker blocks on the settle channel; if a newer promise is submitted in
//! the meantime the host sets the preempt flag, and the worker runs it nested
//! inside that wait when the frame is awaiting an async call. Otherwise the
//! newer promise stays queued until the worker goes idle.

use super::Scheduler;
use crate::runtime::bridge::Coordinator;
use crate::runtime::config::SchedulingModel;
use crate::runtime::error::{BridgeError, DispatchError};
use crate::runtime::handle_table::FrameHandle;
use crate::runtime::promise::{PromiseChannel, RunRequest};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use tracing::{debug, trace, warn};

pub(crate) struct ThreadedScheduler {
    worker_name: String,
    promises: Arc<PromiseChannel>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadedScheduler {
    pub(crate) fn new(worker_name: String, promises: Arc<PromiseChannel>) -> Self {
        Self {
            worker_name,
            promises,
            worker: Mutex::new(None),
        }
    }
}

fn worker_loop(promises: Arc<PromiseChannel>, coordinator: Weak<Coordinator>) {
    debug!("interpreter worker started");
    while promises.wait_for_run() {
        let Some(coordinator) = coordinator.upgrade() else {
            break;
        };
        coordinator.settle.clear_preempt();
        coordinator.run_head_step();
        promises.mark_idle();
        // The head may have finished; let the host retire it.
        coordinator.schedule_idle();
    }
    debug!("interpreter worker stopped");
}

impl Scheduler for ThreadedScheduler {
    fn model(&self) -> SchedulingModel {
        SchedulingModel::Threaded
    }

    fn start(&self, coordinator: Weak<Coordinator>) -> Result<(), BridgeError> {
        let promises = self.promises.clone();
        let handle = thread::Builder::new()
            .name(self.worker_name.clone())
            .spawn(move || worker_loop(promises, coordinator))?;
        *self.worker.lock() = Some(handle);
        Ok(())
    }

    fn drive(&self, coordinator: &Coordinator) -> Result<(), BridgeError> {
        match self.promises.request_run() {
            RunRequest::Queued => trace!("worker woken for head promise"),
            RunRequest::WorkerBusy => {
                trace!("worker busy; requesting preempt");
                coordinator.settle.request_preempt();
            }
            RunRequest::Closed => return Err(DispatchError::Shutdown.into()),
        }
        Ok(())
    }

    fn wait_for_settle(&self, coordinator: &Coordinator, frame: FrameHandle, awaiting: bool) {
        coordinator.settle.wait(frame, awaiting, || {
            trace!(frame = %frame, "running newer promise inside settle wait");
            coordinator.run_head_step();
            coordinator.schedule_idle();
        });
    }

    fn shutdown(&self) {
        self.promises.close();
        if let Some(handle) = self.worker.lock().take() {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                warn!("interpreter worker panicked");
            }
        }
    }
}

impl Drop for ThreadedScheduler {
    fn drop(&mut self) {
        // Never join here: the last coordinator reference may be released on
        // the worker itself.
        self.promises.close();
    }
}
