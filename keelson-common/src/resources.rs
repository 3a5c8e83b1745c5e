//! Resource specs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{ResourceKind, ResourceSpec};

/// ID of the singleton fleet metrics resource
pub const MACHINE_STATUS_METRICS_ID: &str = "machine-status-metrics";

/// Machine state as reported by the machine monitor
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MachineStatusSpec {
    /// Address the machine API is reachable on, `unix://` for a local socket
    pub management_address: String,
    pub connected: bool,
    /// Cluster the machine is allocated to, empty when unallocated
    pub cluster: String,
    /// Installed OS version
    pub version: String,
    pub removed: bool,
}

impl ResourceSpec for MachineStatusSpec {
    const KIND: ResourceKind = ResourceKind::MachineStatus;
}

/// Machine to etcd member mapping
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MachineIdentitySpec {
    /// 0 until the machine has joined etcd
    pub etcd_member_id: u64,
    pub node_name: String,
}

impl ResourceSpec for MachineIdentitySpec {
    const KIND: ResourceKind = ResourceKind::MachineIdentity;
}

/// Group of machines sharing a role within a cluster
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MachineSetSpec {
    pub machine_count: u32,
}

impl ResourceSpec for MachineSetSpec {
    const KIND: ResourceKind = ResourceKind::MachineSet;
}

/// Client credentials for a cluster's machine API
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransportConfigSpec {
    /// PEM encoded CA certificate
    pub ca: String,
    /// PEM encoded client certificate
    pub crt: String,
    /// PEM encoded client key
    pub key: String,
}

impl ResourceSpec for TransportConfigSpec {
    const KIND: ResourceKind = ResourceKind::TransportConfig;
}

/// Machine provided by an infrastructure provider
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InfraMachineSpec {
    pub provider_id: String,
}

impl ResourceSpec for InfraMachineSpec {
    const KIND: ResourceKind = ResourceKind::InfraMachine;
}

/// Fleet-wide machine counters
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MachineStatusMetricsSpec {
    pub registered_machines_count: u32,
    pub connected_machines_count: u32,
    pub allocated_machines_count: u32,
    pub pending_machines_count: u32,
    /// Machine count per installed version
    pub versions: BTreeMap<String, u32>,
}

impl ResourceSpec for MachineStatusMetricsSpec {
    const KIND: ResourceKind = ResourceKind::MachineStatusMetrics;
}

/// Condition status
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConditionStatus {
    #[default]
    NotReady,
    Ready,
}

/// Condition severity
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

/// Why a control plane check reported a condition
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ConditionReason {
    /// Listing the control plane machines failed
    MachineListFailed,
    /// No usable endpoint or credentials for a node
    ClientNotReady,
    /// Connecting to a node failed
    ConnectFailed,
    /// A node reported etcd member errors
    EtcdStatusFailed,
    /// A node failed to return the etcd member list
    MemberListFailed,
    /// Nodes disagree on the etcd member list
    MembersDiverged,
    /// Member count equals the minimum quorum
    MinimumQuorum,
    /// Member count is not the optimal odd number
    SuboptimalMemberCount,
    /// Per-member health could not be evaluated
    EtcdStatusUnavailable,
}

/// Persisted form of a check condition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConditionRecord {
    pub reason: ConditionReason,
    pub status: ConditionStatus,
    pub severity: Severity,
    pub interrupt: bool,
    pub message: String,
}

/// Control plane health for one control plane machine set
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ControlPlaneStatusSpec {
    pub conditions: Vec<ConditionRecord>,
    pub etcd_members: u32,
    pub etcd_healthy_members: u32,
    pub last_check: Option<DateTime<Utc>>,
}

impl ResourceSpec for ControlPlaneStatusSpec {
    const KIND: ResourceKind = ResourceKind::ControlPlaneStatus;
}

impl ControlPlaneStatusSpec {
    /// True when no condition was reported
    pub fn is_ready(&self) -> bool {
        self.conditions.is_empty()
    }
}
