//! Host thread backed by a Tokio current-thread runtime.
//!
//! The bridge's host role is played by a dedicated OS thread running a
//! single-threaded Tokio runtime inside a [`LocalSet`]. Commands from other
//! threads are forwarded through [`HostCommand`] and executed sequentially on
//! that thread, and idle pumps requested by the bridge travel through the same
//! channel, so they always run with no interpreter frames on the host stack.

use crate::runtime::bridge::{Bridge, BridgeStats};
use crate::runtime::config::{BridgeConfig, SchedulingModel};
use crate::runtime::error::{BridgeError, PromiseOutcome};
use crate::runtime::handle_table::{ForeignHandle, PromiseId};
use crate::runtime::host::{HostHooks, IdlePump};
use crate::runtime::interpreter::Interpreter;
use crate::runtime::ops::{ForeignCallable, ForeignInvocation};
use crate::runtime::value::Value;
use futures::future::LocalBoxFuture;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::mpsc::Receiver as StdReceiver;
use std::sync::mpsc::Sender as StdSender;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::LocalSet;
use tracing::{debug, error, trace, warn};

type InitSignalChannel = (
    StdSender<Result<(), BridgeError>>,
    StdReceiver<Result<(), BridgeError>>,
);

/// Future produced by an asynchronous host function.
///
/// It runs on the host thread, so it does not need to be `Send`.
pub type HostFuture = LocalBoxFuture<'static, Result<Value, Value>>;

/// Commands sent to the host thread.
pub enum HostCommand {
    Submit {
        code: String,
        responder: oneshot::Sender<Result<PromiseOutcome, BridgeError>>,
    },
    Eval {
        code: String,
        responder: Sender<Result<Value, BridgeError>>,
    },
    Register {
        name: String,
        callable: ForeignCallable,
        responder: Sender<Result<ForeignHandle, BridgeError>>,
    },
    Unregister {
        handle: ForeignHandle,
        responder: Sender<Result<(), BridgeError>>,
    },
    Cancel,
    Idle(IdlePump),
    Stats {
        responder: Sender<BridgeStats>,
    },
    Shutdown {
        responder: Sender<Result<(), BridgeError>>,
    },
}

/// [`HostHooks`] that feed idle pumps back into the host command channel.
struct ChannelHooks {
    tx: mpsc::WeakUnboundedSender<HostCommand>,
    waiters: Mutex<HashMap<PromiseId, oneshot::Sender<Result<PromiseOutcome, BridgeError>>>>,
}

impl ChannelHooks {
    fn wait_for(
        &self,
        id: PromiseId,
        responder: oneshot::Sender<Result<PromiseOutcome, BridgeError>>,
    ) {
        self.waiters.lock().insert(id, responder);
    }
}

impl HostHooks for ChannelHooks {
    fn schedule_idle(&self, pump: IdlePump) {
        // Once every handle is gone the host loop is winding down.
        let Some(tx) = self.tx.upgrade() else {
            trace!("idle pump dropped; host channel closed");
            return;
        };
        if tx.send(HostCommand::Idle(pump)).is_err() {
            trace!("idle pump dropped; host loop stopped");
        }
    }

    fn promise_settled(&self, id: PromiseId, outcome: PromiseOutcome) {
        match self.waiters.lock().remove(&id) {
            Some(responder) => {
                let _ = responder.send(Ok(outcome));
            }
            None => debug!(promise = %id, "settled promise had no waiter"),
        }
    }

    // The Tokio host only runs the threaded model, which never polls.
    fn yield_for(&self, interval: Duration) {
        trace!(?interval, "yield requested on threaded host");
        std::thread::sleep(interval);
    }
}

/// Wrap an async host function so each invocation is spawned on the host's
/// `LocalSet` and settled when its future completes.
pub fn async_callable<F>(handler: F) -> ForeignCallable
where
    F: Fn(Vec<Value>) -> HostFuture + Send + Sync + 'static,
{
    ForeignCallable::asynchronous(move |invocation: ForeignInvocation| {
        let future = handler(invocation.args().to_vec());
        tokio::task::spawn_local(async move {
            let result = future.await;
            let frame = invocation.frame();
            if let Err(err) = invocation.complete(result) {
                warn!(frame = %frame, %err, "late settle of async host function ignored");
            }
        });
    })
}

pub fn spawn_host_thread(
    config: BridgeConfig,
    interpreter: Arc<dyn Interpreter>,
) -> Result<mpsc::UnboundedSender<HostCommand>, BridgeError> {
    // The host loop cannot be re-entered from inside a poll, so only the
    // threaded scheduler works here.
    if config.model != SchedulingModel::Threaded {
        return Err(BridgeError::Config(
            "the tokio host requires the threaded scheduling model".to_string(),
        ));
    }
    config.validate()?;

    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<HostCommand>();
    let (init_tx, init_rx): InitSignalChannel = std::sync::mpsc::channel();
    let weak_tx = cmd_tx.downgrade();

    std::thread::Builder::new()
        .name(config.host_thread_name.clone())
        .spawn(move || {
            let tokio_rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(err) => {
                    let _ = init_tx.send(Err(BridgeError::Spawn(err)));
                    return;
                }
            };

            let hooks = Arc::new(ChannelHooks {
                tx: weak_tx,
                waiters: Mutex::new(HashMap::new()),
            });
            let mut core = match HostCore::new(config, interpreter, hooks) {
                Ok(core) => {
                    let _ = init_tx.send(Ok(()));
                    core
                }
                Err(err) => {
                    let _ = init_tx.send(Err(err));
                    return;
                }
            };

            let local = LocalSet::new();
            local.block_on(&tokio_rt, async move {
                core.run(cmd_rx).await;
            });
        })?;

    match init_rx.recv() {
        Ok(Ok(())) => Ok(cmd_tx),
        Ok(Err(err)) => Err(err),
        Err(_) => Err(BridgeError::ChannelClosed),
    }
}

struct HostCore {
    bridge: Bridge,
    hooks: Arc<ChannelHooks>,
}

impl HostCore {
    fn new(
        config: BridgeConfig,
        interpreter: Arc<dyn Interpreter>,
        hooks: Arc<ChannelHooks>,
    ) -> Result<Self, BridgeError> {
        let bridge = Bridge::new(config, interpreter, hooks.clone())?;
        Ok(Self { bridge, hooks })
    }

    async fn run(&mut self, mut rx: mpsc::UnboundedReceiver<HostCommand>) {
        debug!("host loop started");
        while let Some(cmd) = rx.recv().await {
            match cmd {
                HostCommand::Submit { code, responder } => match self.bridge.submit_promise(code) {
                    Ok(id) => self.hooks.wait_for(id, responder),
                    Err(err) => {
                        let _ = responder.send(Err(err));
                    }
                },
                HostCommand::Eval { code, responder } => {
                    let _ = responder.send(self.bridge.evaluate_on_host(&code));
                }
                HostCommand::Register {
                    name,
                    callable,
                    responder,
                } => {
                    let result = self.bridge.register_foreign_function(&name, callable);
                    let _ = responder.send(result);
                }
                HostCommand::Unregister { handle, responder } => {
                    let _ = responder.send(self.bridge.unregister_foreign_function(handle));
                }
                HostCommand::Cancel => self.bridge.cancel(),
                HostCommand::Idle(pump) => {
                    if let Err(err) = pump.run() {
                        error!(%err, "idle pump failed");
                    }
                }
                HostCommand::Stats { responder } => {
                    let _ = responder.send(self.bridge.stats());
                }
                HostCommand::Shutdown { responder } => {
                    let result = self.bridge.shutdown();
                    let stopped = result.is_ok();
                    let _ = responder.send(result);
                    if stopped {
                        break;
                    }
                }
            }
        }

        let abandoned = self.hooks.waiters.lock().len();
        if abandoned > 0 {
            warn!(abandoned, "host loop stopped with promise waiters outstanding");
        }
        debug!("host loop stopped");
    }
}
