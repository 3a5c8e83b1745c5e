//! etcd membership and quorum evaluation
//!
//! - `etcd_status`: per-member health of a control plane machine set,
//!   correlated against the live member list
//! - `can_scale_down`: whether removing one machine keeps quorum
//! - `check_etcd`: periodic condition check that every control plane node
//!   agrees on membership and the member count is sound

use keelson_common::labels::{LABEL_CLUSTER, LABEL_CONTROL_PLANE_ROLE, LABEL_MACHINE_SET};
use keelson_common::{
    ConditionReason, MachineIdentitySpec, MachineSetSpec, MachineStatusSpec, Namespace, Resource,
    TransportConfigSpec,
};
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::Condition;
use crate::error::{StoreError, TransportError};
use crate::store::{LabelQuery, Reader, ReaderExt};
use crate::transport::{
    build_client, connect_single, format_member_id, load_credentials, members_by_id, ClientFactory,
};

/// Service name queried for member health
pub const ETCD_SERVICE: &str = "etcd";

/// Member error of a machine that cannot be reached
pub const UNREACHABLE_ERROR: &str = "the machine is unreachable";

/// Healthy members required for writes
pub fn quorum(members: usize) -> usize {
    members / 2 + 1
}

/// Largest member count a quorum size is optimal for
pub fn optimal_members(quorum: usize) -> usize {
    (quorum * 2).saturating_sub(1)
}

/// Timeouts of the remote calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EtcdCheckOptions {
    /// Bound for connecting to one node and reading its etcd service
    pub node_timeout: Duration,
    /// Bound for member list and status calls
    pub member_list_timeout: Duration,
}

impl Default for EtcdCheckOptions {
    fn default() -> Self {
        Self {
            node_timeout: Duration::from_secs(5),
            member_list_timeout: Duration::from_secs(60),
        }
    }
}

/// Health of one etcd member
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EtcdMemberStatus {
    pub healthy: bool,
    pub error: Option<String>,
}

impl EtcdMemberStatus {
    fn unreachable() -> Self {
        Self {
            healthy: false,
            error: Some(UNREACHABLE_ERROR.to_string()),
        }
    }
}

/// Current etcd state of a control plane, recomputed on every call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EtcdStatusResult {
    /// Members keyed by machine ID, machines still joining are absent
    pub members: BTreeMap<String, EtcdMemberStatus>,
    pub healthy_members: usize,
}

#[derive(Debug, Error)]
pub enum EtcdStatusError {
    #[error("the machine set is not a control plane machine set")]
    NotControlPlane,

    #[error("machine set doesn't have the {} label", LABEL_CLUSTER)]
    MissingClusterLabel,

    #[error("failed to get transport config for the cluster {cluster:?}: {source}")]
    TransportConfig {
        cluster: String,
        source: TransportError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Live members no machine claims
    #[error("couldn't map etcd members to machines: {:?}", .members.join(", "))]
    UnmatchedMembers { members: Vec<String> },
}

/// Why a machine may not be removed
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ScaleDownDenied {
    #[error("removing machine {machine:?} is not possible, etcd doesn't have quorum")]
    NoQuorum { machine: String },

    #[error("removing machine {machine:?} will break etcd quorum")]
    WouldBreakQuorum { machine: String },
}

async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T, TransportError>
where
    F: Future<Output = Result<T, TransportError>>,
{
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| TransportError::Timeout(limit))?
}

async fn with_deadline<T, F>(deadline: Instant, limit: Duration, call: F) -> Result<T, TransportError>
where
    F: Future<Output = Result<T, TransportError>>,
{
    tokio::time::timeout_at(deadline, call)
        .await
        .map_err(|_| TransportError::Timeout(limit))?
}

/// Read the health of every etcd member of a control plane machine set
pub async fn etcd_status(
    reader: &dyn Reader,
    factory: &dyn ClientFactory,
    machine_set: &Resource<MachineSetSpec>,
    options: &EtcdCheckOptions,
) -> Result<EtcdStatusResult, EtcdStatusError> {
    if !machine_set.has_label(LABEL_CONTROL_PLANE_ROLE) {
        return Err(EtcdStatusError::NotControlPlane);
    }

    let cluster = machine_set
        .label(LABEL_CLUSTER)
        .ok_or(EtcdStatusError::MissingClusterLabel)?;

    let credentials = load_credentials(reader, cluster)
        .await
        .map_err(|source| EtcdStatusError::TransportConfig {
            cluster: cluster.to_string(),
            source,
        })?;

    let statuses = reader
        .list::<MachineStatusSpec>(
            Namespace::Default,
            &LabelQuery::all().equal(LABEL_MACHINE_SET, machine_set.id()),
        )
        .await?;

    let canonical = async {
        let client = build_client(reader, factory, cluster, &statuses).await?;
        client.etcd_member_list().await
    };
    let mut unmatched = members_by_id(&with_timeout(options.member_list_timeout, canonical).await?);

    let mut result = EtcdStatusResult::default();

    for status in &statuses {
        let Some(identity) = reader
            .get_optional::<MachineIdentitySpec>(Namespace::Default, status.id())
            .await?
        else {
            debug!(machine = status.id(), "Machine has no identity yet, skipping");
            continue;
        };

        let member_id = identity.spec.etcd_member_id;
        if member_id == 0 || unmatched.remove(&member_id).is_none() {
            debug!(machine = status.id(), member_id = member_id, "Machine is not an etcd member yet, skipping");
            continue;
        }

        let member = member_state(factory, cluster, &credentials, status, options).await;
        if member.healthy {
            result.healthy_members += 1;
        }

        result.members.insert(status.id().to_string(), member);
    }

    if !unmatched.is_empty() {
        return Err(EtcdStatusError::UnmatchedMembers {
            members: unmatched.keys().map(|id| format_member_id(*id)).collect(),
        });
    }

    debug!(
        cluster = cluster,
        members = result.members.len(),
        healthy = result.healthy_members,
        "Evaluated etcd status"
    );

    Ok(result)
}

async fn member_state(
    factory: &dyn ClientFactory,
    cluster: &str,
    credentials: &TransportConfigSpec,
    status: &Resource<MachineStatusSpec>,
    options: &EtcdCheckOptions,
) -> EtcdMemberStatus {
    let address = &status.spec.management_address;

    if !status.spec.connected || address.is_empty() {
        return EtcdMemberStatus::unreachable();
    }

    let query = async {
        let client = connect_single(factory, cluster, credentials, address).await?;
        client.service_info(ETCD_SERVICE).await
    };

    let services = match with_timeout(options.node_timeout, query).await {
        Ok(services) => services,
        Err(e) => {
            warn!(machine = status.id(), error = %e, "Failed to read etcd service health");
            return EtcdMemberStatus {
                healthy: false,
                error: Some(e.to_string()),
            };
        }
    };

    let mut member = EtcdMemberStatus::default();

    for info in services {
        if let Some(error) = info.metadata_error.filter(|e| !e.is_empty()) {
            return EtcdMemberStatus {
                healthy: false,
                error: Some(error),
            };
        }

        member.healthy = info.healthy;
    }

    member
}

/// Check that removing `machine_id` keeps etcd quorum
pub fn can_scale_down(status: &EtcdStatusResult, machine_id: &str) -> Result<(), ScaleDownDenied> {
    let Some(member) = status.members.get(machine_id) else {
        return Ok(());
    };

    let mut total = status.members.len();
    let mut healthy = status.healthy_members;

    if healthy < quorum(total) {
        return Err(ScaleDownDenied::NoQuorum {
            machine: machine_id.to_string(),
        });
    }

    total -= 1;
    if member.healthy {
        healthy = healthy.saturating_sub(1);
    }

    if healthy < quorum(total) {
        return Err(ScaleDownDenied::WouldBreakQuorum {
            machine: machine_id.to_string(),
        });
    }

    Ok(())
}

/// Check that etcd responds on every control plane node, all nodes agree
/// on membership and the member count tolerates failures
pub async fn check_etcd(
    reader: &dyn Reader,
    factory: &dyn ClientFactory,
    cluster: &str,
    options: &EtcdCheckOptions,
) -> Option<Condition> {
    let query = LabelQuery::all()
        .equal(LABEL_CLUSTER, cluster)
        .exists(LABEL_CONTROL_PLANE_ROLE);

    let machines = match reader.list::<MachineStatusSpec>(Namespace::Default, &query).await {
        Ok(machines) => machines,
        Err(e) => {
            return Some(Condition::error(
                ConditionReason::MachineListFailed,
                format!("Failed to get the list of machines {}", e),
            ))
        }
    };

    let mut reference: Option<(&str, BTreeMap<u64, String>)> = None;

    for machine in &machines {
        let members = match node_members(reader, factory, cluster, machine, options).await {
            Ok(members) => members,
            Err(condition) => return Some(condition),
        };

        let Some((first, expected)) = &reference else {
            reference = Some((machine.id(), members));
            continue;
        };

        if *expected != members {
            return Some(Condition::error(
                ConditionReason::MembersDiverged,
                format!("Etcd members don't match on nodes {} and {}", first, machine.id()),
            ));
        }
    }

    let count = reference.map(|(_, members)| members.len()).unwrap_or(0);

    topology_condition(count)
}

/// Warn about member counts that tolerate fewer failures than they could
pub fn topology_condition(members: usize) -> Option<Condition> {
    let quorum = quorum(members);
    let optimal = optimal_members(quorum);

    if members == 2 {
        return Some(Condition::warning(
            ConditionReason::MinimumQuorum,
            format!(
                "Etcd members count is equal to the minimum quorum {}. The cluster cannot tolerate the loss of any members",
                quorum
            ),
        ));
    }

    if members != optimal {
        return Some(Condition::warning(
            ConditionReason::SuboptimalMemberCount,
            format!(
                "Etcd members count {} is not optimal. Recommended count is {}",
                members, optimal
            ),
        ));
    }

    None
}

/// One node's view of the member list, after checking its etcd status
async fn node_members(
    reader: &dyn Reader,
    factory: &dyn ClientFactory,
    cluster: &str,
    machine: &Resource<MachineStatusSpec>,
    options: &EtcdCheckOptions,
) -> Result<BTreeMap<u64, String>, Condition> {
    let not_ready = || {
        Condition::error(
            ConditionReason::ClientNotReady,
            format!("Machine client is not ready on node {}", machine.id()),
        )
    };

    let limit = options.member_list_timeout;
    let deadline = Instant::now() + limit;

    let connect = build_client(reader, factory, cluster, std::slice::from_ref(machine));
    let client = match with_deadline(deadline, limit, connect).await {
        Ok(client) => client,
        Err(e) if e.is_not_ready() => return Err(not_ready()),
        Err(e) => {
            return Err(Condition::error(
                ConditionReason::ConnectFailed,
                format!("Failed to connect to node {}: {}", machine.id(), e),
            ))
        }
    };

    match with_deadline(deadline, limit, client.etcd_status()).await {
        Ok(reports) => {
            if let Some(report) = reports.iter().find(|r| !r.errors.is_empty()) {
                return Err(Condition::error(
                    ConditionReason::EtcdStatusFailed,
                    format!(
                        "Etcd status check failed: etcd member {:?} has errors: {}",
                        format_member_id(report.member_id),
                        report.errors.join(", ")
                    ),
                ));
            }
        }
        Err(e) if e.is_not_ready() => return Err(not_ready()),
        Err(e) => {
            return Err(Condition::error(
                ConditionReason::EtcdStatusFailed,
                format!("Etcd status check failed: {}", e),
            ))
        }
    }

    match with_deadline(deadline, limit, client.etcd_member_list()).await {
        Ok(nodes) => Ok(members_by_id(&nodes)),
        Err(e) if e.is_not_ready() => Err(not_ready()),
        Err(e) => Err(Condition::error(
            ConditionReason::MemberListFailed,
            format!("Failed to get etcd members: {}", e),
        )),
    }
}
