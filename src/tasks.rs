//! Background task bookkeeping and cooperative shutdown.
//!
//! Every periodic loop holds a [`ShutdownSignal`]. Calling
//! [`BackgroundTasks::shutdown`] flips the signal and waits for each loop to
//! finish its current iteration. Dropping [`BackgroundTasks`] without calling
//! `shutdown` leaves the loops running for the life of the runtime.

use std::future::Future;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Receiving side of the shutdown signal.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// True once shutdown has been requested.
    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown is requested. Cancel-safe.
    ///
    /// Never resolves if the sending side is dropped without signalling.
    pub async fn wait(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Handles to the engine's periodic loops.
#[derive(Debug)]
pub struct BackgroundTasks {
    tx: watch::Sender<bool>,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl BackgroundTasks {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx, handles: Vec::new() }
    }

    pub(crate) fn signal(&self) -> ShutdownSignal {
        ShutdownSignal { rx: self.tx.subscribe() }
    }

    pub(crate) fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        info!(target: "floodgate::tasks", task = name, "starting background task");
        self.handles.push((name, tokio::spawn(task)));
    }

    /// Names of the running loops, in start order.
    pub fn names(&self) -> Vec<&'static str> {
        self.handles.iter().map(|(name, _)| *name).collect()
    }

    /// Number of running loops.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// True if no loop was started.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Signal every loop to stop and wait for all of them.
    pub async fn shutdown(self) {
        let _ = self.tx.send(true);
        for (name, handle) in self.handles {
            match handle.await {
                Ok(()) => info!(target: "floodgate::tasks", task = name, "background task stopped"),
                Err(e) => warn!(target: "floodgate::tasks", task = name, error = %e, "background task failed"),
            }
        }
    }
}
