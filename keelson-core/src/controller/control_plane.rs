//! Control plane status controller
//!
//! Periodically checks etcd health for every control plane machine set and
//! records the outcome in a `ControlPlaneStatus` resource of the same ID.

use async_trait::async_trait;
use chrono::Utc;
use keelson_common::labels::{LABEL_CLUSTER, LABEL_CONTROL_PLANE_ROLE};
use keelson_common::{
    ConditionReason, ControlPlaneStatusSpec, MachineSetSpec, Namespace, Resource, ResourceKind,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::{Controller, ControllerContext, Input, Output, Wake};
use crate::check::{check_etcd, etcd_status, Condition, EtcdCheckOptions, EtcdStatusError};
use crate::error::ControllerError;
use crate::store::{LabelQuery, ReaderExt};
use crate::transport::ClientFactory;

pub struct ControlPlaneStatusController {
    factory: Arc<dyn ClientFactory>,
    options: EtcdCheckOptions,
    interval: Duration,
    min_interval: Duration,
}

impl ControlPlaneStatusController {
    pub fn new(factory: Arc<dyn ClientFactory>) -> Self {
        Self {
            factory,
            options: EtcdCheckOptions::default(),
            interval: Duration::from_secs(60),
            min_interval: Duration::from_secs(10),
        }
    }

    pub fn with_options(mut self, options: EtcdCheckOptions) -> Self {
        self.options = options;
        self
    }

    /// Re-check every `interval`, never more often than `min_interval`
    pub fn with_intervals(mut self, interval: Duration, min_interval: Duration) -> Self {
        self.interval = interval;
        self.min_interval = min_interval;
        self
    }

    async fn reconcile(&self, ctx: &ControllerContext) -> Result<(), ControllerError> {
        let machine_sets = ctx
            .list::<MachineSetSpec>(
                Namespace::Default,
                &LabelQuery::all().exists(LABEL_CONTROL_PLANE_ROLE),
            )
            .await?;

        let mut checked = BTreeSet::new();

        for machine_set in &machine_sets {
            let Some(cluster) = machine_set.label(LABEL_CLUSTER) else {
                warn!(machine_set = machine_set.id(), "Control plane machine set has no cluster label");
                continue;
            };

            self.check_machine_set(ctx, machine_set, cluster).await?;
            checked.insert(machine_set.id().to_string());
        }

        let existing = ctx
            .list::<ControlPlaneStatusSpec>(Namespace::Ephemeral, &LabelQuery::all())
            .await?;

        for status in existing.iter().filter(|s| !checked.contains(s.id())) {
            info!(machine_set = status.id(), "Removing stale control plane status");

            match ctx
                .destroy::<ControlPlaneStatusSpec>(Namespace::Ephemeral, status.id())
                .await
            {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }

        Ok(())
    }

    async fn check_machine_set(
        &self,
        ctx: &ControllerContext,
        machine_set: &Resource<MachineSetSpec>,
        cluster: &str,
    ) -> Result<(), ControllerError> {
        let factory = self.factory.as_ref();
        let mut conditions = Vec::new();

        if let Some(condition) = check_etcd(ctx, factory, cluster, &self.options).await {
            conditions.push(condition);
        }

        let (members, healthy) = match etcd_status(ctx, factory, machine_set, &self.options).await {
            Ok(status) => (status.members.len(), status.healthy_members),
            Err(EtcdStatusError::Store(e)) => return Err(e.into()),
            Err(e) => {
                conditions.push(Condition::error(
                    ConditionReason::EtcdStatusUnavailable,
                    format!("Failed to read etcd status: {}", e),
                ));
                (0, 0)
            }
        };

        if conditions.is_empty() {
            debug!(cluster = cluster, members = members, healthy = healthy, "Control plane is healthy");
        } else {
            for condition in &conditions {
                warn!(
                    cluster = cluster,
                    severity = ?condition.severity(),
                    reason = ?condition.reason(),
                    "{}",
                    condition
                );
            }
        }

        let records: Vec<_> = conditions.iter().map(Condition::to_record).collect();
        let cluster = cluster.to_string();

        ctx.modify::<ControlPlaneStatusSpec, _>(Namespace::Ephemeral, machine_set.id(), move |res| {
            res.metadata.labels.insert(LABEL_CLUSTER.to_string(), cluster);
            res.spec.conditions = records;
            res.spec.etcd_members = u32::try_from(members).unwrap_or(u32::MAX);
            res.spec.etcd_healthy_members = u32::try_from(healthy).unwrap_or(u32::MAX);
            res.spec.last_check = Some(Utc::now());
            Ok(())
        })
        .await?;

        Ok(())
    }
}

#[async_trait]
impl Controller for ControlPlaneStatusController {
    fn name(&self) -> &'static str {
        "ControlPlaneStatusController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![
            Input::weak(Namespace::Default, ResourceKind::MachineSet),
            Input::weak(Namespace::Default, ResourceKind::MachineStatus),
            Input::weak(Namespace::Default, ResourceKind::MachineIdentity),
            Input::weak(Namespace::Default, ResourceKind::TransportConfig),
        ]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive(ResourceKind::ControlPlaneStatus)]
    }

    async fn run(&self, ctx: &mut ControllerContext) -> Result<(), ControllerError> {
        loop {
            if ctx.next_event_or(self.interval).await == Wake::Shutdown {
                return Ok(());
            }

            let started = Instant::now();
            self.reconcile(ctx).await?;
            crate::log_pass!(self.name(), started);

            if !ctx.sleep(self.min_interval).await {
                return Ok(());
            }
        }
    }
}
