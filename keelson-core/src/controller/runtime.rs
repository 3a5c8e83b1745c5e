//! Controller runtime
//!
//! Spawns one task per registered controller and restarts a controller
//! from scratch, with exponential backoff, whenever a pass fails.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{error, info};

use keelson_common::ResourceKind;

use super::{wait_for_shutdown, Controller, ControllerContext};
use crate::shutdown::{ShutdownCoordinator, TaskShutdown};
use crate::store::Store;

/// Restart backoff of failed controllers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
        }
    }
}

impl RestartPolicy {
    /// Delay before restart number `attempt` (0-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);

        self.initial.saturating_mul(factor).min(self.max)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("controller {0} is already registered")]
    DuplicateName(&'static str),

    #[error("controller {controller} cannot own {kind}, already owned by {owner}")]
    OutputConflict {
        kind: ResourceKind,
        owner: &'static str,
        controller: &'static str,
    },
}

/// Runs registered controllers against one store
pub struct ControllerRuntime {
    store: Arc<dyn Store>,
    policy: RestartPolicy,
    controllers: Vec<Arc<dyn Controller>>,
    owners: HashMap<ResourceKind, &'static str>,
}

impl ControllerRuntime {
    pub fn new(store: Arc<dyn Store>, policy: RestartPolicy) -> Self {
        Self {
            store,
            policy,
            controllers: Vec::new(),
            owners: HashMap::new(),
        }
    }

    /// Register a controller, names and output kinds must be unique
    pub fn register(&mut self, controller: Arc<dyn Controller>) -> Result<(), RuntimeError> {
        let name = controller.name();

        if self.controllers.iter().any(|c| c.name() == name) {
            return Err(RuntimeError::DuplicateName(name));
        }

        let outputs = controller.outputs();

        for output in &outputs {
            if let Some(owner) = self.owners.get(&output.kind) {
                return Err(RuntimeError::OutputConflict {
                    kind: output.kind,
                    owner: *owner,
                    controller: name,
                });
            }
        }

        for output in outputs {
            self.owners.insert(output.kind, name);
        }

        info!(controller = name, "Registered controller");
        self.controllers.push(controller);

        Ok(())
    }

    /// Names of registered controllers, in registration order
    pub fn controllers(&self) -> Vec<&'static str> {
        self.controllers.iter().map(|c| c.name()).collect()
    }

    /// Spawn every controller, they stop when `shutdown` fires
    pub fn start(self, shutdown: &ShutdownCoordinator) -> TaskShutdown {
        let mut tasks = TaskShutdown::new();

        for controller in self.controllers {
            let name = controller.name();
            let handle = tokio::spawn(supervise(
                controller,
                self.store.clone(),
                self.policy,
                shutdown.subscribe(),
            ));

            tasks.register(name, handle);
        }

        tasks
    }
}

async fn supervise(
    controller: Arc<dyn Controller>,
    store: Arc<dyn Store>,
    policy: RestartPolicy,
    mut shutdown: watch::Receiver<bool>,
) {
    let name = controller.name();
    let mut failures = 0u32;

    loop {
        let mut ctx = ControllerContext::new(controller.as_ref(), store.clone(), shutdown.clone());
        let started = Instant::now();

        info!(controller = name, "Starting controller");

        let err = match controller.run(&mut ctx).await {
            Ok(()) => {
                info!(controller = name, "Controller stopped");
                return;
            }
            Err(e) => e,
        };

        if *shutdown.borrow() {
            info!(controller = name, error = %err, "Controller failed during shutdown");
            return;
        }

        // a long healthy run starts the backoff over
        if started.elapsed() > policy.max {
            failures = 0;
        }

        let delay = policy.backoff(failures);
        failures = failures.saturating_add(1);

        error!(controller = name, error = %err, restart_in = ?delay, "Controller failed");

        tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
