//! Keelson control plane health
//!
//! Continuously evaluates the etcd control plane of managed clusters:
//! membership coherence across nodes, per-member health, and whether a
//! control plane machine can be removed without breaking quorum. Fleet-wide
//! machine counts are published as a resource and as Prometheus metrics.

// Core modules
pub mod config;
pub mod error;
pub mod logging;
pub mod shutdown;

// Resource store and reconciliation
pub mod controller;
pub mod store;

// Machine access and checks
pub mod check;
pub mod transport;

// Monitoring
pub mod metrics;

pub use config::KeelsonConfig;
pub use error::{ControllerError, StoreError, StoreResult, TransportError};
pub use metrics::{FleetMetrics, MachineStatusMetricsController};
