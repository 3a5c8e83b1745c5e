//! Continuous reconciliation engine
//!
//! Controllers declare the resources they read (inputs) and exclusively
//! write (outputs), then run a long-lived loop:
//! - block until an input changes, a timer fires or shutdown starts
//! - re-read every input in full and recompute derived state
//! - commit outputs with an atomic modify-or-create write
//!
//! A failed pass returns an error and the runtime restarts the controller
//! from scratch, so passes must be safe to re-run.

pub mod control_plane;
pub mod runtime;

pub use control_plane::ControlPlaneStatusController;
pub use runtime::{ControllerRuntime, RestartPolicy, RuntimeError};

use async_trait::async_trait;
use keelson_common::{Namespace, RawResource, Resource, ResourceKind, ResourceSpec};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, watch};
use tracing::debug;

use crate::error::{ControllerError, StoreError, StoreResult};
use crate::store::{typed_mutator, LabelQuery, Reader, Store, StoreEvent};

/// How an input relates to the controller's writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputStrength {
    /// Wake on change, no ordering guarantees
    Weak,
    /// Outputs are not written while the input has no resources
    Strong,
}

/// Declared controller input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Input {
    pub namespace: Namespace,
    pub kind: ResourceKind,
    pub strength: InputStrength,
}

impl Input {
    pub const fn weak(namespace: Namespace, kind: ResourceKind) -> Self {
        Self {
            namespace,
            kind,
            strength: InputStrength::Weak,
        }
    }

    pub const fn strong(namespace: Namespace, kind: ResourceKind) -> Self {
        Self {
            namespace,
            kind,
            strength: InputStrength::Strong,
        }
    }
}

/// Declared controller output, owned exclusively by one controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Output {
    pub kind: ResourceKind,
}

impl Output {
    pub const fn exclusive(kind: ResourceKind) -> Self {
        Self { kind }
    }
}

/// Reconciliation controller
#[async_trait]
pub trait Controller: Send + Sync {
    /// Unique controller name
    fn name(&self) -> &'static str;

    fn inputs(&self) -> Vec<Input>;

    fn outputs(&self) -> Vec<Output>;

    /// Run until shutdown (`Ok`) or until a pass fails (`Err`)
    async fn run(&self, ctx: &mut ControllerContext) -> Result<(), ControllerError>;
}

/// Why a controller woke up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    /// An input changed (or the controller just started)
    Event,
    /// The requeue period elapsed
    Timer,
    Shutdown,
}

/// Per-run view of the store, restricted to the controller's declarations
pub struct ControllerContext {
    name: &'static str,
    inputs: Vec<Input>,
    outputs: Vec<Output>,
    store: Arc<dyn Store>,
    events: broadcast::Receiver<StoreEvent>,
    shutdown: watch::Receiver<bool>,
    initial_wake: bool,
}

impl ControllerContext {
    pub fn new(
        controller: &dyn Controller,
        store: Arc<dyn Store>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let events = store.watch();

        Self {
            name: controller.name(),
            inputs: controller.inputs(),
            outputs: controller.outputs(),
            store,
            events,
            shutdown,
            initial_wake: true,
        }
    }

    pub fn controller_name(&self) -> &'static str {
        self.name
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Block until an input changes or shutdown starts
    pub async fn next_event(&mut self) -> Wake {
        self.wait(None).await
    }

    /// Block until an input changes, `period` elapses or shutdown starts
    pub async fn next_event_or(&mut self, period: Duration) -> Wake {
        self.wait(Some(period)).await
    }

    /// Sleep between passes, returns false when shutdown interrupted the sleep
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        if self.is_shutting_down() {
            return false;
        }

        tokio::select! {
            _ = wait_for_shutdown(&mut self.shutdown) => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    async fn wait(&mut self, period: Option<Duration>) -> Wake {
        if self.is_shutting_down() {
            return Wake::Shutdown;
        }

        if self.initial_wake {
            self.initial_wake = false;
            return Wake::Event;
        }

        let timer = async {
            match period {
                Some(period) => tokio::time::sleep(period).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(timer);

        loop {
            tokio::select! {
                _ = wait_for_shutdown(&mut self.shutdown) => return Wake::Shutdown,
                _ = &mut timer => return Wake::Timer,
                received = self.events.recv() => match received {
                    Ok(event) if self.watches(&event) => {
                        debug!(controller = self.name, kind = %event.kind, id = %event.id, "Input changed");
                        self.drain_events();
                        return Wake::Event;
                    }
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(controller = self.name, skipped = skipped, "Event receiver lagged");
                        self.drain_events();
                        return Wake::Event;
                    }
                    Err(RecvError::Closed) => return Wake::Shutdown,
                },
            }
        }
    }

    /// Coalesce a burst of changes into a single wake
    fn drain_events(&mut self) {
        loop {
            match self.events.try_recv() {
                Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
    }

    fn watches(&self, event: &StoreEvent) -> bool {
        self.inputs
            .iter()
            .any(|input| input.namespace == event.namespace && input.kind == event.kind)
    }

    fn can_read(&self, namespace: Namespace, kind: ResourceKind) -> bool {
        self.inputs
            .iter()
            .any(|input| input.namespace == namespace && input.kind == kind)
            || self.owns(kind)
    }

    fn owns(&self, kind: ResourceKind) -> bool {
        self.outputs.iter().any(|output| output.kind == kind)
    }

    fn check_read(&self, namespace: Namespace, kind: ResourceKind) -> StoreResult<()> {
        if self.can_read(namespace, kind) {
            Ok(())
        } else {
            Err(StoreError::UndeclaredInput {
                controller: self.name,
                kind,
            })
        }
    }

    async fn check_write(&self, kind: ResourceKind) -> StoreResult<()> {
        if !self.owns(kind) {
            return Err(StoreError::UndeclaredOutput {
                controller: self.name,
                kind,
            });
        }

        for input in self.inputs.iter().filter(|i| i.strength == InputStrength::Strong) {
            let present = self
                .store
                .list_raw(input.namespace, input.kind, &LabelQuery::all())
                .await?;

            if present.is_empty() {
                return Err(StoreError::StrongInputMissing {
                    controller: self.name,
                    kind: input.kind,
                });
            }
        }

        Ok(())
    }

    /// Fetch-or-create an owned output, mutate it and commit atomically
    pub async fn modify<S, F>(&self, namespace: Namespace, id: &str, mutate: F) -> StoreResult<Resource<S>>
    where
        S: ResourceSpec,
        F: FnOnce(&mut Resource<S>) -> StoreResult<()> + Send,
    {
        self.check_write(S::KIND).await?;

        let raw = self
            .store
            .modify_raw(namespace, S::KIND, id, typed_mutator(mutate))
            .await?;

        Ok(Resource::from_raw(raw)?)
    }

    /// Destroy an owned output
    pub async fn destroy<S: ResourceSpec>(&self, namespace: Namespace, id: &str) -> StoreResult<()> {
        self.check_write(S::KIND).await?;
        self.store.destroy_raw(namespace, S::KIND, id).await
    }
}

#[async_trait]
impl Reader for ControllerContext {
    async fn get_raw(
        &self,
        namespace: Namespace,
        kind: ResourceKind,
        id: &str,
    ) -> StoreResult<RawResource> {
        self.check_read(namespace, kind)?;
        self.store.get_raw(namespace, kind, id).await
    }

    async fn list_raw(
        &self,
        namespace: Namespace,
        kind: ResourceKind,
        query: &LabelQuery,
    ) -> StoreResult<Vec<RawResource>> {
        self.check_read(namespace, kind)?;
        self.store.list_raw(namespace, kind, query).await
    }
}

/// Resolves once the shutdown flag is set or its sender is gone
pub(crate) async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
