//! Thread-safe handle for driving a bridge hosted on its own thread.

use crate::runtime::bridge::BridgeStats;
use crate::runtime::config::BridgeConfig;
use crate::runtime::error::{BridgeError, DispatchError};
use crate::runtime::handle_table::ForeignHandle;
use crate::runtime::interpreter::Interpreter;
use crate::runtime::ops::ForeignCallable;
use crate::runtime::runner::{async_callable, spawn_host_thread, HostCommand, HostFuture};
use crate::runtime::value::Value;
use parking_lot::Mutex;
use std::sync::mpsc;
use std::sync::Arc;
use tokio::sync::mpsc as async_mpsc;
use tokio::sync::oneshot;

/// Cloneable handle to a bridge whose host role is played by a dedicated
/// Tokio thread.
///
/// The blocking methods must not be called from inside a host function: they
/// wait on the host thread that is running that function.
#[derive(Clone)]
pub struct HostHandle {
    tx: Option<async_mpsc::UnboundedSender<HostCommand>>,
    shutdown: Arc<Mutex<bool>>,
}

impl HostHandle {
    pub fn spawn(config: BridgeConfig, interpreter: Arc<dyn Interpreter>) -> Result<Self, BridgeError> {
        let tx = spawn_host_thread(config, interpreter)?;
        Ok(Self {
            tx: Some(tx),
            shutdown: Arc::new(Mutex::new(false)),
        })
    }

    fn sender(&self) -> Result<&async_mpsc::UnboundedSender<HostCommand>, BridgeError> {
        if *self.shutdown.lock() {
            return Err(DispatchError::Shutdown.into());
        }
        self.tx
            .as_ref()
            .ok_or_else(|| DispatchError::Shutdown.into())
    }

    fn request<T>(
        &self,
        command: impl FnOnce(mpsc::Sender<T>) -> HostCommand,
    ) -> Result<T, BridgeError> {
        let sender = self.sender()?.clone();
        let (result_tx, result_rx) = mpsc::channel();
        sender
            .send(command(result_tx))
            .map_err(|_| BridgeError::ChannelClosed)?;
        result_rx.recv().map_err(|_| BridgeError::ChannelClosed)
    }

    /// Submit `code` as a promise and wait for it to settle.
    pub async fn submit_async(&self, code: &str) -> Result<Value, BridgeError> {
        let sender = self.sender()?.clone();
        let (result_tx, result_rx) = oneshot::channel();

        sender
            .send(HostCommand::Submit {
                code: code.to_string(),
                responder: result_tx,
            })
            .map_err(|_| BridgeError::ChannelClosed)?;

        let outcome = result_rx.await.map_err(|_| BridgeError::ChannelClosed)??;
        Ok(outcome.into_result()?)
    }

    pub fn submit_sync(&self, code: &str) -> Result<Value, BridgeError> {
        futures::executor::block_on(self.submit_async(code))
    }

    /// Evaluate `code` on the host thread outside any promise.
    pub fn eval_sync(&self, code: &str) -> Result<Value, BridgeError> {
        self.request(|responder| HostCommand::Eval {
            code: code.to_string(),
            responder,
        })?
    }

    pub fn register(
        &self,
        name: &str,
        callable: ForeignCallable,
    ) -> Result<ForeignHandle, BridgeError> {
        self.request(|responder| HostCommand::Register {
            name: name.to_string(),
            callable,
            responder,
        })?
    }

    pub fn register_sync<F>(&self, name: &str, handler: F) -> Result<ForeignHandle, BridgeError>
    where
        F: Fn(&[Value]) -> Result<Value, Value> + Send + Sync + 'static,
    {
        self.register(name, ForeignCallable::sync(handler))
    }

    /// Register a handler over JSON values.
    pub fn register_json<F>(&self, name: &str, handler: F) -> Result<ForeignHandle, BridgeError>
    where
        F: Fn(Vec<serde_json::Value>) -> Result<serde_json::Value, String> + Send + Sync + 'static,
    {
        self.register(name, ForeignCallable::json(handler))
    }

    /// Register a handler whose future runs on the host thread.
    pub fn register_async<F>(&self, name: &str, handler: F) -> Result<ForeignHandle, BridgeError>
    where
        F: Fn(Vec<Value>) -> HostFuture + Send + Sync + 'static,
    {
        self.register(name, async_callable(handler))
    }

    pub fn unregister(&self, handle: ForeignHandle) -> Result<(), BridgeError> {
        self.request(|responder| HostCommand::Unregister { handle, responder })?
    }

    /// Cancel the in-flight foreign call, if any.
    pub fn cancel(&self) -> Result<(), BridgeError> {
        self.sender()?
            .send(HostCommand::Cancel)
            .map_err(|_| BridgeError::ChannelClosed)
    }

    pub fn stats(&self) -> Result<BridgeStats, BridgeError> {
        self.request(|responder| HostCommand::Stats { responder })
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown.lock()
    }

    /// Shut the bridge down and stop the host thread.
    ///
    /// Fails while promises are outstanding; the handle stays usable then.
    pub fn close(&mut self) -> Result<(), BridgeError> {
        let mut shutdown_guard = self.shutdown.lock();
        if *shutdown_guard {
            return Ok(());
        }

        if let Some(tx) = self.tx.as_ref() {
            let (result_tx, result_rx) = mpsc::channel();
            tx.send(HostCommand::Shutdown {
                responder: result_tx,
            })
            .map_err(|_| BridgeError::ChannelClosed)?;

            result_rx.recv().map_err(|_| BridgeError::ChannelClosed)??;
            self.tx = None;
            *shutdown_guard = true;
        }

        Ok(())
    }
}
