//! Hooks the bridge uses to reach back into the host environment.

use crate::runtime::bridge::Coordinator;
use crate::runtime::error::{BridgeError, PromiseOutcome};
use crate::runtime::handle_table::PromiseId;
use std::sync::Weak;
use std::time::Duration;

/// Services a host environment provides to a bridge.
///
/// Every method may be called from either the host thread or the
/// interpreter-owner thread, so implementations must only enqueue work.
pub trait HostHooks: Send + Sync + 'static {
    /// Arrange for `pump.run()` to be called on the host thread at the next
    /// opportunity, with no interpreter frames on the host's stack.
    fn schedule_idle(&self, pump: IdlePump);

    /// A promise reached a terminal state and was retired from the stack.
    fn promise_settled(&self, id: PromiseId, outcome: PromiseOutcome);

    /// Give the host event loop a chance to run for roughly `interval`.
    ///
    /// Only the cooperative scheduler calls this, between settle polls. An
    /// async call under that model can only be settled by callbacks run here,
    /// so a cooperative host must actually turn its loop.
    fn yield_for(&self, interval: Duration);
}

/// Deferred entry into [`crate::Bridge::idle_pump`].
///
/// Holds the coordinator weakly; running a pump after the bridge is gone is a
/// no-op.
#[derive(Clone)]
pub struct IdlePump {
    coordinator: Weak<Coordinator>,
}

impl IdlePump {
    pub(crate) fn new(coordinator: Weak<Coordinator>) -> Self {
        Self { coordinator }
    }

    pub fn run(&self) -> Result<(), BridgeError> {
        match self.coordinator.upgrade() {
            Some(coordinator) => coordinator.idle_pump(),
            None => Ok(()),
        }
    }

    /// Ask the host to run this pump again.
    pub(crate) fn schedule(&self) {
        if let Some(coordinator) = self.coordinator.upgrade() {
            coordinator.schedule_idle();
        }
    }
}
