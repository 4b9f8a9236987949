//! The single foreign-call slot, its result mailbox, and the settle signal.
//!
//! `slot` guards the call state, the mailbox and the pending host request;
//! `settled` is signalled whenever the slot changes in a way a waiter cares
//! about. `armed` is a separate lock recording which frame may still be
//! settled. A frame is armed before its request becomes visible to the host,
//! and a settle disarms it before writing the mailbox, so a settle that lands
//! before the waiter blocks is never lost and a frame is never settled twice.
//! The two locks are never held at the same time.

use super::{DispatchStats, ForeignCallState, SettleKind, Settlement};
use crate::runtime::error::DispatchError;
use crate::runtime::handle_table::{ForeignHandle, FrameHandle};
use crate::runtime::value::Value;
use parking_lot::{Condvar, Mutex, MutexGuard};

/// A foreign call waiting to be delivered to the host thread.
#[derive(Debug)]
pub(crate) struct ForeignRequest {
    pub(crate) frame: FrameHandle,
    pub(crate) function: ForeignHandle,
    pub(crate) args: Vec<Value>,
}

struct CallSlot {
    state: ForeignCallState,
    frame: Option<FrameHandle>,
    mailbox: Option<Settlement>,
    request: Option<ForeignRequest>,
    /// Set by the host when a newer promise should run inside the current wait.
    preempt: bool,
    last_frame: u64,
    stats: DispatchStats,
}

pub(crate) struct SettleChannel {
    slot: Mutex<CallSlot>,
    settled: Condvar,
    armed: Mutex<Option<FrameHandle>>,
}

impl SettleChannel {
    pub(crate) fn new() -> Self {
        Self {
            slot: Mutex::new(CallSlot {
                state: ForeignCallState::None,
                frame: None,
                mailbox: None,
                request: None,
                preempt: false,
                last_frame: 0,
                stats: DispatchStats::default(),
            }),
            settled: Condvar::new(),
            armed: Mutex::new(None),
        }
    }

    /// Move the slot to RUNNING and arm it for a new frame.
    ///
    /// With `handoff`, a request carrying the arguments is posted for the
    /// host to pick up; it is only posted after the frame is armed.
    pub(crate) fn begin(
        &self,
        function: ForeignHandle,
        handoff: Option<Vec<Value>>,
    ) -> Result<FrameHandle, DispatchError> {
        let frame = {
            let mut slot = self.slot.lock();
            if slot.state != ForeignCallState::None {
                return Err(DispatchError::ReentrantCall);
            }
            slot.last_frame += 1;
            let frame = FrameHandle::new(slot.last_frame);
            slot.state = ForeignCallState::Running;
            slot.frame = Some(frame);
            slot.mailbox = None;
            slot.stats.in_flight += 1;
            slot.stats.max_in_flight = slot.stats.max_in_flight.max(slot.stats.in_flight);
            slot.stats.total_dispatched += 1;
            frame
        };

        *self.armed.lock() = Some(frame);

        if let Some(args) = handoff {
            self.slot.lock().request = Some(ForeignRequest {
                frame,
                function,
                args,
            });
        }
        Ok(frame)
    }

    pub(crate) fn take_request(&self) -> Option<ForeignRequest> {
        self.slot.lock().request.take()
    }

    pub(crate) fn settle(
        &self,
        frame: FrameHandle,
        kind: SettleKind,
        value: Value,
    ) -> Result<(), DispatchError> {
        {
            let mut armed = self.armed.lock();
            if *armed != Some(frame) {
                return Err(DispatchError::DoubleSettle(frame));
            }
            *armed = None;
        }
        self.store(kind, value);
        Ok(())
    }

    /// Force the in-flight call, if any, to REJECTED with kind `cancelled`.
    pub(crate) fn cancel_in_flight(&self) -> Option<FrameHandle> {
        let frame = self.armed.lock().take()?;
        self.store(SettleKind::Cancelled, Value::Null);
        Some(frame)
    }

    fn store(&self, kind: SettleKind, value: Value) {
        let mut slot = self.slot.lock();
        slot.state = match kind {
            SettleKind::Ok => ForeignCallState::Resolved,
            SettleKind::Error | SettleKind::Cancelled => ForeignCallState::Rejected,
        };
        slot.mailbox = Some(Settlement { kind, value });
        // A cancelled call may not have been delivered yet.
        slot.request = None;
        slot.stats.in_flight = slot.stats.in_flight.saturating_sub(1);
        if kind == SettleKind::Cancelled {
            slot.stats.total_cancelled += 1;
        } else {
            slot.stats.total_settled += 1;
        }
        drop(slot);
        self.settled.notify_all();
    }

    /// Block until `frame` settles.
    ///
    /// With `preemptible` (the caller's promise is awaiting an async call), a
    /// preempt request takes priority over an already settled frame: the
    /// newer promise runs first, which keeps promise order LIFO. A sync wait
    /// leaves the request pending.
    pub(crate) fn wait(&self, frame: FrameHandle, preemptible: bool, mut on_preempt: impl FnMut()) {
        let mut slot = self.slot.lock();
        loop {
            if preemptible && slot.preempt {
                slot.preempt = false;
                MutexGuard::unlocked(&mut slot, || on_preempt());
                continue;
            }
            if Self::is_settled_locked(&slot, frame) || slot.frame != Some(frame) {
                return;
            }
            self.settled.wait(&mut slot);
        }
    }

    pub(crate) fn is_settled(&self, frame: FrameHandle) -> bool {
        Self::is_settled_locked(&self.slot.lock(), frame)
    }

    fn is_settled_locked(slot: &CallSlot, frame: FrameHandle) -> bool {
        slot.frame == Some(frame)
            && matches!(
                slot.state,
                ForeignCallState::Resolved | ForeignCallState::Rejected
            )
    }

    /// Drain the mailbox and return the slot to NONE.
    pub(crate) fn finish(&self, frame: FrameHandle) -> Option<Settlement> {
        let mut slot = self.slot.lock();
        if !Self::is_settled_locked(&slot, frame) {
            return None;
        }
        slot.state = ForeignCallState::None;
        slot.frame = None;
        slot.mailbox.take()
    }

    pub(crate) fn request_preempt(&self) {
        self.slot.lock().preempt = true;
        self.settled.notify_all();
    }

    pub(crate) fn clear_preempt(&self) {
        self.slot.lock().preempt = false;
    }

    pub(crate) fn state(&self) -> ForeignCallState {
        self.slot.lock().state
    }

    pub(crate) fn stats(&self) -> DispatchStats {
        self.slot.lock().stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn function() -> ForeignHandle {
        ForeignHandle::from_u64((1 << 32) | 7)
    }

    #[test]
    fn test_second_begin_is_reentrant() {
        let channel = SettleChannel::new();
        channel.begin(function(), None).unwrap();
        assert_eq!(
            channel.begin(function(), None).unwrap_err(),
            DispatchError::ReentrantCall
        );
        assert_eq!(channel.state(), ForeignCallState::Running);
    }

    #[test]
    fn test_mailbox_must_be_drained_before_next_call() {
        let channel = SettleChannel::new();
        let frame = channel.begin(function(), None).unwrap();
        channel.settle(frame, SettleKind::Ok, Value::Int(1)).unwrap();

        // Settled but not drained.
        assert!(channel.begin(function(), None).is_err());

        let settlement = channel.finish(frame).unwrap();
        assert_eq!(settlement.value, Value::Int(1));
        assert_eq!(channel.state(), ForeignCallState::None);

        let next = channel.begin(function(), None).unwrap();
        assert_ne!(next, frame);
    }

    #[test]
    fn test_settle_before_wait_is_observed() {
        let channel = Arc::new(SettleChannel::new());
        let frame = channel.begin(function(), Some(vec![Value::Int(2)])).unwrap();

        let host = channel.clone();
        thread::spawn(move || {
            let request = host.take_request().unwrap();
            host.settle(request.frame, SettleKind::Ok, Value::Int(4))
                .unwrap();
        })
        .join()
        .unwrap();

        // The settle landed before anyone waited; this must not block.
        channel.wait(frame, true, || panic!("no preempt requested"));
        assert_eq!(channel.finish(frame).unwrap().value, Value::Int(4));
    }

    #[test]
    fn test_wait_wakes_on_late_settle() {
        let channel = Arc::new(SettleChannel::new());
        let frame = channel.begin(function(), None).unwrap();

        let host = channel.clone();
        let settler = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            host.settle(frame, SettleKind::Error, Value::from("nope"))
                .unwrap();
        });

        channel.wait(frame, true, || {});
        settler.join().unwrap();

        let settlement = channel.finish(frame).unwrap();
        assert_eq!(settlement.kind, SettleKind::Error);
    }

    #[test]
    fn test_double_settle_rejected() {
        let channel = SettleChannel::new();
        let frame = channel.begin(function(), None).unwrap();

        channel.settle(frame, SettleKind::Ok, Value::Null).unwrap();
        assert_eq!(
            channel.settle(frame, SettleKind::Ok, Value::Null),
            Err(DispatchError::DoubleSettle(frame))
        );

        let stale = FrameHandle::from_u64(frame.as_u64() + 10);
        assert!(channel.settle(stale, SettleKind::Ok, Value::Null).is_err());
    }

    #[test]
    fn test_cancel_drops_request_and_blocks_late_settle() {
        let channel = SettleChannel::new();
        let frame = channel.begin(function(), Some(vec![])).unwrap();

        assert_eq!(channel.cancel_in_flight(), Some(frame));
        assert!(channel.take_request().is_none());
        assert_eq!(
            channel.settle(frame, SettleKind::Ok, Value::Null),
            Err(DispatchError::DoubleSettle(frame))
        );
        assert_eq!(channel.finish(frame).unwrap().kind, SettleKind::Cancelled);

        // Nothing left to cancel.
        assert_eq!(channel.cancel_in_flight(), None);

        let stats = channel.stats();
        assert_eq!(stats.total_cancelled, 1);
        assert_eq!(stats.total_settled, 0);
        assert_eq!(stats.in_flight, 0);
    }

    #[test]
    fn test_preempt_runs_before_resuming_wait() {
        let channel = Arc::new(SettleChannel::new());
        let frame = channel.begin(function(), None).unwrap();
        let preempts = Arc::new(AtomicUsize::new(0));

        channel.request_preempt();

        let host = channel.clone();
        let seen = preempts.clone();
        channel.wait(frame, true, move || {
            seen.fetch_add(1, Ordering::SeqCst);
            // The settle arrives while the nested work runs.
            host.settle(frame, SettleKind::Ok, Value::Int(1)).unwrap();
        });

        assert_eq!(preempts.load(Ordering::SeqCst), 1);
        assert!(channel.is_settled(frame));
    }

    #[test]
    fn test_sync_wait_leaves_preempt_pending() {
        let channel = Arc::new(SettleChannel::new());
        let frame = channel.begin(function(), None).unwrap();
        channel.request_preempt();

        let host = channel.clone();
        let settler = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            host.settle(frame, SettleKind::Ok, Value::Int(2)).unwrap();
        });

        channel.wait(frame, false, || panic!("sync wait must not run nested work"));
        settler.join().unwrap();
        assert_eq!(channel.finish(frame).unwrap().value, Value::Int(2));

        // Still pending for the next async wait.
        let next = channel.begin(function(), None).unwrap();
        let preempts = Arc::new(AtomicUsize::new(0));
        let seen = preempts.clone();
        let host = channel.clone();
        channel.wait(next, true, move || {
            seen.fetch_add(1, Ordering::SeqCst);
            host.settle(next, SettleKind::Ok, Value::Null).unwrap();
        });
        assert_eq!(preempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_in_flight_never_exceeds_one() {
        let channel = SettleChannel::new();
        for i in 0..5 {
            let frame = channel.begin(function(), None).unwrap();
            assert!(channel.begin(function(), None).is_err());
            channel.settle(frame, SettleKind::Ok, Value::Int(i)).unwrap();
            channel.finish(frame).unwrap();
        }

        let stats = channel.stats();
        assert_eq!(stats.max_in_flight, 1);
        assert_eq!(stats.total_dispatched, 5);
        assert_eq!(stats.total_settled, 5);
    }
}
