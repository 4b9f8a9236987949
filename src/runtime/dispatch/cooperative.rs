//! Cooperative scheduling for hosts without threads.
//!
//! Everything runs on the host thread. The head promise is driven inline from
//! the idle pump, and a frame waiting on a foreign call polls the call slot,
//! yielding to the host event loop between polls. Host callbacks (timers,
//! I/O completions, nested idle pumps) run during those yields.

use super::Scheduler;
use crate::runtime::bridge::Coordinator;
use crate::runtime::config::SchedulingModel;
use crate::runtime::error::BridgeError;
use crate::runtime::handle_table::FrameHandle;
use std::sync::Weak;
use std::time::Duration;
use tracing::trace;

pub(crate) struct CooperativeScheduler {
    poll_interval: Duration,
}

impl CooperativeScheduler {
    pub(crate) fn new(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }
}

impl Scheduler for CooperativeScheduler {
    fn model(&self) -> SchedulingModel {
        SchedulingModel::Cooperative
    }

    fn start(&self, _coordinator: Weak<Coordinator>) -> Result<(), BridgeError> {
        Ok(())
    }

    fn drive(&self, coordinator: &Coordinator) -> Result<(), BridgeError> {
        coordinator.run_head_step();
        Ok(())
    }

    fn wait_for_settle(&self, coordinator: &Coordinator, frame: FrameHandle, _awaiting: bool) {
        let mut polls: u64 = 0;
        loop {
            if coordinator.settle.is_settled(frame) {
                break;
            }
            // Cancellation and halt are observed at every poll.
            if coordinator.checkpoint_cancellation() {
                continue;
            }
            coordinator.hooks().yield_for(self.poll_interval);
            polls += 1;
        }
        trace!(frame = %frame, polls, "foreign call settled");
    }

    fn shutdown(&self) {}
}
