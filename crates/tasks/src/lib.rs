//! Critical task spawning and shutdown propagation.
//!
//! The process owns one [`TaskManager`]; long-running workers are spawned
//! through its [`TaskExecutor`] and watched.  A critical task that errors or
//! panics takes the process down through [`TaskManager::monitor`]; a
//! shutdown request (signal or RPC) flips the shared flag that workers poll
//! at their cancellation points.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures_util::FutureExt;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tracing::*;

#[derive(Debug, Error)]
#[error("critical task {name} exited: {message}")]
pub struct TaskError {
    name: &'static str,
    message: String,
}

/// Sending half of the shutdown flag.
#[derive(Clone)]
pub struct ShutdownSignal(watch::Sender<bool>);

impl ShutdownSignal {
    pub fn send(&self) {
        let _ = self.0.send(true);
    }
}

/// Receiving half of the shutdown flag, polled by workers at their
/// cancellation points.
#[derive(Clone)]
pub struct ShutdownGuard(watch::Receiver<bool>);

impl ShutdownGuard {
    pub fn should_shutdown(&self) -> bool {
        *self.0.borrow()
    }

    pub async fn wait_for_shutdown(&mut self) {
        let _ = self.0.wait_for(|set| *set).await;
    }
}

pub struct TaskManager {
    handle: Handle,
    shutdown_tx: watch::Sender<bool>,
    critical_tx: mpsc::UnboundedSender<TaskError>,
    critical_rx: mpsc::UnboundedReceiver<TaskError>,
}

impl TaskManager {
    pub fn new(handle: Handle) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let (critical_tx, critical_rx) = mpsc::unbounded_channel();
        Self {
            handle,
            shutdown_tx,
            critical_tx,
            critical_rx,
        }
    }

    pub fn executor(&self) -> TaskExecutor {
        TaskExecutor {
            handle: self.handle.clone(),
            shutdown_tx: self.shutdown_tx.clone(),
            critical_tx: self.critical_tx.clone(),
        }
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        ShutdownSignal(self.shutdown_tx.clone())
    }

    /// Flips the shutdown flag on SIGINT.
    pub fn start_signal_listeners(&self) {
        let signal = self.shutdown_signal();
        self.handle.spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("received interrupt, shutting down");
                signal.send();
            }
        });
    }

    /// Blocks the calling thread until either a critical task dies (error)
    /// or shutdown is signalled (ok), then waits out the grace period so
    /// in-flight work can wind down.
    pub fn monitor(mut self, grace: Option<Duration>) -> anyhow::Result<()> {
        let handle = self.handle.clone();
        let shutdown_tx = self.shutdown_tx.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let res: anyhow::Result<()> = handle.block_on(async move {
            tokio::select! {
                Some(err) = self.critical_rx.recv() => {
                    error!(%err, "critical task failed, shutting down");
                    let _ = shutdown_tx.send(true);
                    Err(err.into())
                }
                _ = shutdown_rx.wait_for(|set| *set) => Ok(()),
            }
        });

        if let Some(grace) = grace {
            handle.block_on(tokio::time::sleep(grace));
        }
        res
    }
}

#[derive(Clone)]
pub struct TaskExecutor {
    handle: Handle,
    shutdown_tx: watch::Sender<bool>,
    critical_tx: mpsc::UnboundedSender<TaskError>,
}

impl TaskExecutor {
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn shutdown_guard(&self) -> ShutdownGuard {
        ShutdownGuard(self.shutdown_tx.subscribe())
    }

    /// Spawns a task whose failure (error return or panic) is fatal to the
    /// process via [`TaskManager::monitor`].
    pub fn spawn_critical_async(
        &self,
        name: &'static str,
        fut: impl Future<Output = anyhow::Result<()>> + Send + 'static,
    ) {
        let tx = self.critical_tx.clone();
        self.handle.spawn(async move {
            match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(Ok(())) => debug!(%name, "critical task finished"),
                Ok(Err(e)) => {
                    let _ = tx.send(TaskError {
                        name,
                        message: e.to_string(),
                    });
                }
                Err(_) => {
                    let _ = tx.send(TaskError {
                        name,
                        message: "task panicked".to_owned(),
                    });
                }
            }
        });
    }
}
