//! Fleet machine metrics
//!
//! `MachineStatusMetricsController` counts machines on every input change
//! (at most once per interval) and publishes the counts two ways:
//! - the `MachineStatusMetrics` resource in the ephemeral namespace
//! - `FleetMetrics`, a Prometheus collector read on scrape
//!
//! The per-version histogram is an immutable snapshot swapped under a lock,
//! scrapes only clone the pointer.

use async_trait::async_trait;
use keelson_common::labels::LABEL_PENDING_ACCEPT;
use keelson_common::{
    InfraMachineSpec, MachineStatusMetricsSpec, MachineStatusSpec, Namespace, Resource,
    ResourceKind, MACHINE_STATUS_METRICS_ID,
};
use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;
use prometheus::{IntGauge, IntGaugeVec, Opts, Registry};
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::controller::{Controller, ControllerContext, Input, Output, Wake};
use crate::error::ControllerError;
use crate::store::{LabelQuery, ReaderExt};

const VERSION_LABEL: &str = "version";

/// Machine counts of one scan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FleetCounts {
    pub registered: u32,
    pub connected: u32,
    /// Machines assigned to a cluster
    pub allocated: u32,
    /// Infra machines waiting for acceptance
    pub pending: u32,
    pub versions: BTreeMap<String, u32>,
}

impl FleetCounts {
    pub fn tally(machines: &[Resource<MachineStatusSpec>], pending: usize) -> Self {
        let mut counts = FleetCounts {
            pending: u32::try_from(pending).unwrap_or(u32::MAX),
            ..Default::default()
        };

        for machine in machines {
            counts.registered += 1;

            if machine.spec.connected {
                counts.connected += 1;
            }

            if !machine.spec.cluster.is_empty() {
                counts.allocated += 1;
            }

            if !machine.spec.version.is_empty() {
                *counts.versions.entry(machine.spec.version.clone()).or_default() += 1;
            }
        }

        counts
    }

    pub fn to_spec(&self) -> MachineStatusMetricsSpec {
        MachineStatusMetricsSpec {
            registered_machines_count: self.registered,
            connected_machines_count: self.connected,
            allocated_machines_count: self.allocated,
            pending_machines_count: self.pending,
            versions: self.versions.clone(),
        }
    }
}

type VersionSnapshot = Arc<BTreeMap<String, u32>>;

/// Scrape-side view of the latest fleet counts
#[derive(Clone)]
pub struct FleetMetrics {
    machines: IntGauge,
    connected: IntGauge,
    allocated: IntGauge,
    pending: IntGauge,
    /// Only describes the per-version family, values come from `versions`
    versions_template: IntGaugeVec,
    versions: Arc<RwLock<VersionSnapshot>>,
}

impl FleetMetrics {
    pub fn new() -> prometheus::Result<Self> {
        Ok(Self {
            machines: IntGauge::new("keelson_machines", "Number of registered machines")?,
            connected: IntGauge::new(
                "keelson_connected_machines",
                "Number of registered machines that are connected",
            )?,
            allocated: IntGauge::new(
                "keelson_allocated_machines",
                "Number of machines allocated to a cluster",
            )?,
            pending: IntGauge::new(
                "keelson_pending_machines",
                "Number of infrastructure machines pending acceptance",
            )?,
            versions_template: Self::version_gauges()?,
            versions: Arc::new(RwLock::new(Arc::new(BTreeMap::new()))),
        })
    }

    fn version_gauges() -> prometheus::Result<IntGaugeVec> {
        IntGaugeVec::new(
            Opts::new("keelson_machines_version", "Number of machines by installed version"),
            &[VERSION_LABEL],
        )
    }

    /// Publish the counts of a finished scan
    pub fn publish(&self, counts: &FleetCounts) {
        self.machines.set(i64::from(counts.registered));
        self.connected.set(i64::from(counts.connected));
        self.allocated.set(i64::from(counts.allocated));
        self.pending.set(i64::from(counts.pending));

        let snapshot = Arc::new(counts.versions.clone());
        *self.versions.write().unwrap_or_else(PoisonError::into_inner) = snapshot;
    }

    /// Latest per-version counts
    pub fn versions(&self) -> VersionSnapshot {
        self.versions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn register(&self, registry: &Registry) -> prometheus::Result<()> {
        registry.register(Box::new(self.clone()))
    }
}

impl Collector for FleetMetrics {
    fn desc(&self) -> Vec<&Desc> {
        let mut descs = Vec::new();
        descs.extend(self.machines.desc());
        descs.extend(self.connected.desc());
        descs.extend(self.allocated.desc());
        descs.extend(self.pending.desc());
        descs.extend(self.versions_template.desc());
        descs
    }

    fn collect(&self) -> Vec<MetricFamily> {
        let mut families = Vec::new();
        families.extend(self.machines.collect());
        families.extend(self.connected.collect());
        families.extend(self.allocated.collect());
        families.extend(self.pending.collect());

        let snapshot = self.versions();

        match Self::version_gauges() {
            Ok(gauges) => {
                for (version, count) in snapshot.iter() {
                    gauges
                        .with_label_values(&[version.as_str()])
                        .set(i64::from(*count));
                }
                families.extend(gauges.collect());
            }
            Err(e) => warn!(error = %e, "Failed to build version gauges"),
        }

        families
    }
}

/// Keeps fleet counts up to date
pub struct MachineStatusMetricsController {
    metrics: FleetMetrics,
    interval: Duration,
}

impl MachineStatusMetricsController {
    pub fn new(metrics: FleetMetrics) -> Self {
        Self {
            metrics,
            interval: Duration::from_secs(10),
        }
    }

    /// Minimum time between two scans
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn metrics(&self) -> &FleetMetrics {
        &self.metrics
    }

    async fn reconcile(&self, ctx: &ControllerContext) -> Result<(), ControllerError> {
        let pending = ctx
            .list::<InfraMachineSpec>(
                Namespace::InfraProvider,
                &LabelQuery::all().exists(LABEL_PENDING_ACCEPT),
            )
            .await?
            .len();

        let machines = ctx
            .list::<MachineStatusSpec>(Namespace::Default, &LabelQuery::all())
            .await?;

        let counts = FleetCounts::tally(&machines, pending);
        self.metrics.publish(&counts);

        debug!(
            registered = counts.registered,
            connected = counts.connected,
            allocated = counts.allocated,
            pending = counts.pending,
            versions = counts.versions.len(),
            "Updated machine metrics"
        );

        let spec = counts.to_spec();
        ctx.modify::<MachineStatusMetricsSpec, _>(Namespace::Ephemeral, MACHINE_STATUS_METRICS_ID, move |res| {
            res.spec = spec;
            Ok(())
        })
        .await?;

        Ok(())
    }
}

#[async_trait]
impl Controller for MachineStatusMetricsController {
    fn name(&self) -> &'static str {
        "MachineStatusMetricsController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![
            Input::weak(Namespace::Default, ResourceKind::MachineStatus),
            Input::weak(Namespace::InfraProvider, ResourceKind::InfraMachine),
        ]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive(ResourceKind::MachineStatusMetrics)]
    }

    async fn run(&self, ctx: &mut ControllerContext) -> Result<(), ControllerError> {
        loop {
            if ctx.next_event().await == Wake::Shutdown {
                return Ok(());
            }

            let started = Instant::now();
            self.reconcile(ctx).await?;
            crate::log_pass!(self.name(), started);

            // scrapes are infrequent, so are scans
            if !ctx.sleep(self.interval).await {
                return Ok(());
            }
        }
    }
}
