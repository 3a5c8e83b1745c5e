//! Machine API transport
//!
//! Builds short-lived authenticated clients against a cluster's machines.
//! A machine that exposes a local socket (`unix://` management address) is
//! used exclusively, otherwise every usable network address becomes an
//! endpoint of the client.

pub mod fixture;

pub use fixture::{FixtureFactory, FixtureNode};

use async_trait::async_trait;
use keelson_common::{MachineStatusSpec, Namespace, Resource, TransportConfigSpec};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Deref;
use std::path::PathBuf;
use tracing::debug;

use crate::error::TransportError;
use crate::store::{Reader, ReaderExt};

/// Management address prefix of the local socket fast path
pub const SOCKET_PREFIX: &str = "unix://";

/// Where a client connects to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoints {
    /// Local socket, no network endpoints are used
    Socket(PathBuf),
    Network(Vec<String>),
}

impl fmt::Display for Endpoints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoints::Socket(path) => write!(f, "{}{}", SOCKET_PREFIX, path.display()),
            Endpoints::Network(addresses) => write!(f, "{}", addresses.join(",")),
        }
    }
}

/// Everything needed to open a client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub cluster: String,
    pub credentials: TransportConfigSpec,
    pub endpoints: Endpoints,
}

/// etcd member as reported by a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EtcdMember {
    pub id: u64,
    pub hostname: String,
}

impl EtcdMember {
    pub fn new(id: u64, hostname: impl Into<String>) -> Self {
        Self {
            id,
            hostname: hostname.into(),
        }
    }
}

/// One node's answer to a member list request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeMembers {
    pub node: String,
    pub members: Vec<EtcdMember>,
}

/// One node's answer to an etcd status request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EtcdMemberStatusReport {
    pub node: String,
    pub member_id: u64,
    pub errors: Vec<String>,
}

/// Service state as reported by a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub id: String,
    pub healthy: bool,
    /// Node-side error attached to the response
    pub metadata_error: Option<String>,
}

/// Machine control protocol
#[async_trait]
pub trait MachineClient: Send + Sync {
    async fn etcd_member_list(&self) -> Result<Vec<NodeMembers>, TransportError>;

    async fn etcd_status(&self) -> Result<Vec<EtcdMemberStatusReport>, TransportError>;

    async fn service_info(&self, service: &str) -> Result<Vec<ServiceInfo>, TransportError>;
}

/// Opens machine clients
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn connect(&self, config: ClientConfig) -> Result<Box<dyn MachineClient>, TransportError>;
}

/// Client released when dropped
pub struct ScopedClient {
    inner: Box<dyn MachineClient>,
    cluster: String,
    endpoints: Endpoints,
}

impl ScopedClient {
    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }
}

impl Deref for ScopedClient {
    type Target = dyn MachineClient;

    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

impl Drop for ScopedClient {
    fn drop(&mut self) {
        debug!(cluster = %self.cluster, endpoints = %self.endpoints, "Released machine client");
    }
}

/// Socket path of a `unix://` management address
pub fn socket_path(address: &str) -> Option<PathBuf> {
    address
        .strip_prefix(SOCKET_PREFIX)
        .filter(|path| !path.is_empty())
        .map(PathBuf::from)
}

/// Pick client endpoints from candidate machines, in order
pub fn select_endpoints(statuses: &[Resource<MachineStatusSpec>]) -> Result<Endpoints, TransportError> {
    let mut addresses = Vec::with_capacity(statuses.len());

    for status in statuses {
        let address = &status.spec.management_address;

        if address.is_empty() || status.spec.removed {
            continue;
        }

        if let Some(path) = socket_path(address) {
            return Ok(Endpoints::Socket(path));
        }

        addresses.push(address.clone());
    }

    if addresses.is_empty() {
        return Err(TransportError::NotReady(
            "no management addresses found on machine statuses".to_string(),
        ));
    }

    Ok(Endpoints::Network(addresses))
}

/// Load a cluster's credentials, a missing config means the cluster is not ready yet
pub async fn load_credentials(
    reader: &dyn Reader,
    cluster: &str,
) -> Result<TransportConfigSpec, TransportError> {
    match reader
        .get_optional::<TransportConfigSpec>(Namespace::Default, cluster)
        .await?
    {
        Some(config) => Ok(config.spec),
        None => Err(TransportError::NotReady(format!(
            "transport config for cluster {} not found",
            cluster
        ))),
    }
}

/// Build one client against the given machines of a cluster
pub async fn build_client(
    reader: &dyn Reader,
    factory: &dyn ClientFactory,
    cluster: &str,
    statuses: &[Resource<MachineStatusSpec>],
) -> Result<ScopedClient, TransportError> {
    let credentials = load_credentials(reader, cluster).await?;
    let endpoints = select_endpoints(statuses)?;

    open(factory, cluster, credentials, endpoints).await
}

/// Build a client against a single management address
pub async fn connect_single(
    factory: &dyn ClientFactory,
    cluster: &str,
    credentials: &TransportConfigSpec,
    address: &str,
) -> Result<ScopedClient, TransportError> {
    let endpoints = match socket_path(address) {
        Some(path) => Endpoints::Socket(path),
        None => Endpoints::Network(vec![address.to_string()]),
    };

    open(factory, cluster, credentials.clone(), endpoints).await
}

async fn open(
    factory: &dyn ClientFactory,
    cluster: &str,
    credentials: TransportConfigSpec,
    endpoints: Endpoints,
) -> Result<ScopedClient, TransportError> {
    debug!(cluster = cluster, endpoints = %endpoints, "Opening machine client");

    let inner = factory
        .connect(ClientConfig {
            cluster: cluster.to_string(),
            credentials,
            endpoints: endpoints.clone(),
        })
        .await?;

    Ok(ScopedClient {
        inner,
        cluster: cluster.to_string(),
        endpoints,
    })
}

/// Flatten member list answers into member ID to hostname
pub fn members_by_id(nodes: &[NodeMembers]) -> BTreeMap<u64, String> {
    nodes
        .iter()
        .flat_map(|node| node.members.iter())
        .map(|member| (member.id, member.hostname.clone()))
        .collect()
}

/// etcd's textual member ID form
pub fn format_member_id(id: u64) -> String {
    format!("{:016x}", id)
}
