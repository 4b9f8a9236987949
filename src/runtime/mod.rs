//! Asynchronous foreign-call bridge between a non-reentrant interpreter and an
//! event-loop host.
//!
//! Scripts run as promises on a LIFO stack. A script frame that calls a host
//! function is suspended until the host settles that call, and at most one
//! foreign call is in flight per bridge. Where interpreter code runs depends
//! on the [`SchedulingModel`]: on a dedicated worker thread, or inline on the
//! host thread with cooperative polling.

pub mod bridge;
pub mod config;
pub(crate) mod conversion;
pub mod dispatch;
pub mod error;
pub mod event_loop;
pub mod handle;
pub mod handle_table;
pub mod host;
pub mod interpreter;
pub mod ops;
pub mod promise;
pub mod runner;
pub mod value;

#[cfg(test)]
pub(crate) mod testing;

// Re-export key types for convenience
pub use bridge::{Bridge, BridgeStats, Settler};
pub use config::{BridgeConfig, SchedulingModel};
pub use dispatch::{DispatchStats, ForeignCallState, SettleKind};
pub use error::{BridgeError, DispatchError, ErrorKind, PromiseOutcome, ScriptError};
pub use event_loop::{EventLoop, LoopHost};
pub use handle::HostHandle;
pub use handle_table::{ForeignHandle, FrameHandle, PromiseId};
pub use host::{HostHooks, IdlePump};
pub use interpreter::{CallContext, Interpreter};
pub use ops::{Finalizer, ForeignCallable, ForeignInvocation};
pub use promise::PromiseState;
pub use runner::HostFuture;
pub use value::Value;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::testing::{double, MiniScript, MODELS};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_bridge_lifecycle() {
        for model in MODELS {
            let host = Arc::new(LoopHost::new(EventLoop::new()));
            let bridge = Bridge::new(
                BridgeConfig::new().with_model(model),
                MiniScript::new(),
                host.clone(),
            )
            .unwrap();
            assert!(!bridge.is_shutdown());
            assert_eq!(bridge.config().model, model);

            let id = bridge.submit_promise("40 + 2").unwrap();
            let settled = host
                .event_loop()
                .run_until(Duration::from_secs(5), || host.settled_count() == 1);
            assert!(settled);
            assert_eq!(
                host.outcome(id),
                Some(PromiseOutcome::Resolved(Value::Int(42)))
            );

            bridge.shutdown().unwrap();
            assert!(bridge.is_shutdown());
        }
    }

    #[test]
    fn test_bridges_are_independent() {
        let host = Arc::new(LoopHost::new(EventLoop::new()));
        let bridges: Vec<_> = MODELS
            .iter()
            .map(|model| {
                Bridge::new(
                    BridgeConfig::new().with_model(*model),
                    MiniScript::new(),
                    host.clone(),
                )
                .unwrap()
            })
            .collect();

        bridges[0]
            .register_foreign_function("double", double())
            .unwrap();
        assert_eq!(bridges[0].stats().registered_functions, 1);
        assert_eq!(bridges[1].stats().registered_functions, 0);
        assert!(bridges[1].evaluate_on_host("double(1)").is_err());

        for (i, bridge) in bridges.iter().enumerate() {
            bridge.submit_promise(format!("{} * 2", i)).unwrap();
        }
        assert!(host
            .event_loop()
            .run_until(Duration::from_secs(5), || host.settled_count() == 2));
        for bridge in &bridges {
            bridge.shutdown().unwrap();
        }
    }

    #[test]
    fn test_concurrent_hosts() {
        let mut threads = vec![];
        for i in 0..3 {
            threads.push(thread::spawn(move || {
                let mut handle =
                    HostHandle::spawn(BridgeConfig::new(), MiniScript::new()).unwrap();
                let result = handle.submit_sync(&format!("{} + 100", i)).unwrap();
                assert_eq!(result, Value::Int(i + 100));
                handle.close().unwrap();
            }));
        }
        for t in threads {
            t.join().unwrap();
        }
    }
}
