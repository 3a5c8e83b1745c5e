//! Cooperative shutdown
//!
//! `ShutdownCoordinator` broadcasts a single shutdown flag to every
//! controller task. `TaskShutdown` tracks the spawned tasks and waits for
//! them to return, aborting the ones that overrun the grace period.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Broadcasts the shutdown signal
#[derive(Clone)]
pub struct ShutdownCoordinator {
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
    is_shutting_down: Arc<AtomicBool>,
    timeout: Duration,
}

impl ShutdownCoordinator {
    /// Coordinator with a 30s grace period
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(30))
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
            is_shutting_down: Arc::new(AtomicBool::new(false)),
            timeout,
        }
    }

    /// Receiver that flips to `true` once shutdown starts
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.is_shutting_down.load(Ordering::SeqCst)
    }

    /// Start shutdown, later calls are no-ops
    pub fn shutdown(&self) {
        if self.is_shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("Initiating shutdown");
        let _ = self.shutdown_tx.send(true);
    }

    /// Wait for SIGTERM, SIGINT or SIGQUIT (Ctrl+C elsewhere) and start shutdown
    pub async fn wait_for_signal(&self) {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let handlers = (
                signal(SignalKind::terminate()),
                signal(SignalKind::interrupt()),
                signal(SignalKind::quit()),
            );

            match handlers {
                (Ok(mut sigterm), Ok(mut sigint), Ok(mut sigquit)) => {
                    tokio::select! {
                        _ = sigterm.recv() => info!("Received SIGTERM"),
                        _ = sigint.recv() => info!("Received SIGINT"),
                        _ = sigquit.recv() => info!("Received SIGQUIT"),
                    }
                }
                _ => {
                    error!("Failed to register signal handlers, falling back to Ctrl+C");
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        error!(error = %e, "Failed to listen for Ctrl+C");
                    }
                }
            }
        }

        #[cfg(not(unix))]
        {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for Ctrl+C");
            } else {
                info!("Received Ctrl+C");
            }
        }

        self.shutdown();
    }

    /// Grace period for tasks to return after shutdown starts
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawned tasks to stop on shutdown
pub struct TaskShutdown {
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl TaskShutdown {
    pub fn new() -> Self {
        Self { tasks: Vec::new() }
    }

    pub fn register(&mut self, name: &'static str, handle: JoinHandle<()>) {
        self.tasks.push((name, handle));
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Wait for every task to return, aborting those still running after `timeout`
    pub async fn wait_all(&mut self, timeout: Duration) {
        info!(tasks = self.tasks.len(), "Waiting for background tasks");

        let deadline = tokio::time::Instant::now() + timeout;

        for (name, mut handle) in self.tasks.drain(..) {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => info!(task = name, "Task stopped"),
                Ok(Err(e)) => warn!(task = name, error = %e, "Task failed"),
                Err(_) => {
                    warn!(task = name, "Task did not stop within timeout, aborting");
                    handle.abort();
                }
            }
        }
    }

    /// Abort every task without waiting for it to return on its own
    pub async fn abort_all(&mut self, timeout: Duration) {
        info!(tasks = self.tasks.len(), "Aborting background tasks");

        for (name, handle) in self.tasks.drain(..) {
            handle.abort();

            match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(())) => info!(task = name, "Task stopped"),
                Ok(Err(e)) if e.is_cancelled() => info!(task = name, "Task cancelled"),
                Ok(Err(e)) => warn!(task = name, error = %e, "Task failed"),
                Err(_) => warn!(task = name, "Task did not stop within timeout"),
            }
        }
    }
}

impl Default for TaskShutdown {
    fn default() -> Self {
        Self::new()
    }
}
