//! Run-until-signalled contract for long-lived tasks.
//!
//! A [`Runner`] receives a signal channel and a readiness channel. It sends
//! on `ready` exactly once when it is up, then keeps running until a signal
//! arrives or it fails.

use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{Error, Result};

/// Capacity of the signal channel created by [`Process::spawn`].
const SIGNAL_BUFFER: usize = 4;

/// Shutdown request delivered to a runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Interactive interrupt.
    Interrupt,
    /// Orderly termination.
    Terminate,
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Interrupt => f.write_str("interrupt"),
            Self::Terminate => f.write_str("terminate"),
        }
    }
}

/// Incoming shutdown signals.
pub type Signals = mpsc::Receiver<Signal>;

/// One-shot readiness notification.
pub type Ready = oneshot::Sender<()>;

/// A task that runs until signalled.
pub trait Runner: Send {
    /// Runs the task to completion.
    fn run(self: Box<Self>, signals: Signals, ready: Ready) -> BoxFuture<'static, Result<()>>;
}

struct FnRunner<F>(F);

impl<F> Runner for FnRunner<F>
where
    F: FnOnce(Signals, Ready) -> BoxFuture<'static, Result<()>> + Send,
{
    fn run(self: Box<Self>, signals: Signals, ready: Ready) -> BoxFuture<'static, Result<()>> {
        (self.0)(signals, ready)
    }
}

/// Wraps a closure as a [`Runner`].
pub fn run_fn<F>(f: F) -> Box<dyn Runner>
where
    F: FnOnce(Signals, Ready) -> BoxFuture<'static, Result<()>> + Send + 'static,
{
    Box::new(FnRunner(f))
}

/// A runner spawned on the tokio runtime.
#[derive(Debug)]
pub struct Process {
    signals: mpsc::Sender<Signal>,
    ready: Option<oneshot::Receiver<()>>,
    handle: JoinHandle<Result<()>>,
}

impl Process {
    /// Spawns `runner` as a tokio task.
    pub fn spawn(runner: Box<dyn Runner>) -> Self {
        let (signal_tx, signal_rx) = mpsc::channel(SIGNAL_BUFFER);
        let (ready_tx, ready_rx) = oneshot::channel();
        let handle = tokio::spawn(runner.run(signal_rx, ready_tx));

        Self {
            signals: signal_tx,
            ready: Some(ready_rx),
            handle,
        }
    }

    /// Waits for readiness.
    ///
    /// Returns `false` if the runner exited without becoming ready, or if
    /// readiness was already awaited.
    pub async fn ready(&mut self) -> bool {
        match self.ready.take() {
            Some(rx) => rx.await.is_ok(),
            None => false,
        }
    }

    /// Delivers a signal. A runner that already exited ignores it.
    pub async fn signal(&self, signal: Signal) {
        if self.signals.send(signal).await.is_err() {
            debug!(%signal, "runner already exited");
        }
    }

    /// Waits for the runner to exit and returns its result.
    ///
    /// # Errors
    ///
    /// Returns the runner's error, or [`Error::Runner`] if the task panicked
    /// or was cancelled.
    pub async fn wait(self) -> Result<()> {
        let Self {
            signals, handle, ..
        } = self;
        // Keep the channel open so the runner only sees explicit signals.
        let result = handle
            .await
            .map_err(|e| Error::Runner(format!("runner task failed: {e}")))?;
        drop(signals);
        result
    }
}
