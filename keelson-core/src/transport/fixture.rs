//! Scripted machine clients
//!
//! `FixtureFactory` answers machine API calls from per-address `FixtureNode`
//! scripts and counts open clients, so callers can check that every client
//! they opened was released.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use super::{
    ClientConfig, ClientFactory, EtcdMember, EtcdMemberStatusReport, Endpoints, MachineClient,
    NodeMembers, ServiceInfo,
};
use crate::error::TransportError;

/// Scripted behavior of one machine
#[derive(Debug, Clone, Default)]
pub struct FixtureNode {
    hostname: String,
    member_id: u64,
    members: Vec<EtcdMember>,
    etcd_healthy: bool,
    member_errors: Vec<String>,
    service_error: Option<String>,
    metadata_error: Option<String>,
    member_list_error: Option<String>,
    unreachable: bool,
    hanging: bool,
    hanging_connect: bool,
}

impl FixtureNode {
    /// Node running a healthy etcd member that sees `members`
    pub fn healthy(hostname: impl Into<String>, member_id: u64, members: &[EtcdMember]) -> Self {
        Self {
            hostname: hostname.into(),
            member_id,
            members: members.to_vec(),
            etcd_healthy: true,
            ..Default::default()
        }
    }

    /// etcd service reports itself unhealthy
    pub fn unhealthy(mut self) -> Self {
        self.etcd_healthy = false;
        self
    }

    /// Service info request fails
    pub fn with_service_error(mut self, error: impl Into<String>) -> Self {
        self.service_error = Some(error.into());
        self
    }

    /// Service info succeeds but carries a node-side error
    pub fn with_metadata_error(mut self, error: impl Into<String>) -> Self {
        self.metadata_error = Some(error.into());
        self
    }

    /// etcd status reports member errors
    pub fn with_member_errors(mut self, errors: &[&str]) -> Self {
        self.member_errors = errors.iter().map(|e| e.to_string()).collect();
        self
    }

    /// Member list request fails
    pub fn with_member_list_error(mut self, error: impl Into<String>) -> Self {
        self.member_list_error = Some(error.into());
        self
    }

    /// Connecting to the node fails
    pub fn unreachable(mut self) -> Self {
        self.unreachable = true;
        self
    }

    /// Requests never complete
    pub fn hanging(mut self) -> Self {
        self.hanging = true;
        self
    }

    /// Connecting to the node never completes
    pub fn hanging_connect(mut self) -> Self {
        self.hanging_connect = true;
        self
    }
}

#[derive(Default)]
struct FixtureState {
    nodes: RwLock<HashMap<String, FixtureNode>>,
    open: AtomicUsize,
    connects: AtomicUsize,
    connections: Mutex<Vec<Endpoints>>,
}

/// Client factory answering from scripted nodes
#[derive(Clone, Default)]
pub struct FixtureFactory {
    state: Arc<FixtureState>,
}

impl FixtureFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the node behind a management address
    pub fn set_node(&self, address: impl Into<String>, node: FixtureNode) {
        let mut nodes = self.state.nodes.write().unwrap_or_else(|e| e.into_inner());
        nodes.insert(address.into(), node);
    }

    /// Clients opened and not yet dropped
    pub fn open_clients(&self) -> usize {
        self.state.open.load(Ordering::SeqCst)
    }

    /// Successful connects so far
    pub fn total_connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Endpoints of every successful connect, in order
    pub fn connections(&self) -> Vec<Endpoints> {
        self.state
            .connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn resolve(&self, endpoints: &Endpoints) -> Option<(String, FixtureNode)> {
        let nodes = self.state.nodes.read().unwrap_or_else(|e| e.into_inner());

        let candidates = match endpoints {
            Endpoints::Socket(_) => vec![endpoints.to_string()],
            Endpoints::Network(addresses) => addresses.clone(),
        };

        candidates
            .into_iter()
            .find_map(|address| nodes.get(&address).cloned().map(|node| (address, node)))
    }
}

#[async_trait]
impl ClientFactory for FixtureFactory {
    async fn connect(&self, config: ClientConfig) -> Result<Box<dyn MachineClient>, TransportError> {
        let (address, node) = self
            .resolve(&config.endpoints)
            .ok_or_else(|| TransportError::Connect(format!("no route to {}", config.endpoints)))?;

        if node.hanging_connect {
            std::future::pending::<()>().await;
        }

        if node.unreachable {
            return Err(TransportError::Connect(format!(
                "dial {}: connection refused",
                address
            )));
        }

        self.state.open.fetch_add(1, Ordering::SeqCst);
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        self.state
            .connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(config.endpoints);

        Ok(Box::new(FixtureClient {
            node,
            state: self.state.clone(),
        }))
    }
}

struct FixtureClient {
    node: FixtureNode,
    state: Arc<FixtureState>,
}

impl FixtureClient {
    async fn respond(&self) {
        if self.node.hanging {
            std::future::pending::<()>().await;
        }
    }
}

impl Drop for FixtureClient {
    fn drop(&mut self) {
        self.state.open.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl MachineClient for FixtureClient {
    async fn etcd_member_list(&self) -> Result<Vec<NodeMembers>, TransportError> {
        self.respond().await;

        if let Some(error) = &self.node.member_list_error {
            return Err(TransportError::Rpc(error.clone()));
        }

        Ok(vec![NodeMembers {
            node: self.node.hostname.clone(),
            members: self.node.members.clone(),
        }])
    }

    async fn etcd_status(&self) -> Result<Vec<EtcdMemberStatusReport>, TransportError> {
        self.respond().await;

        Ok(vec![EtcdMemberStatusReport {
            node: self.node.hostname.clone(),
            member_id: self.node.member_id,
            errors: self.node.member_errors.clone(),
        }])
    }

    async fn service_info(&self, service: &str) -> Result<Vec<ServiceInfo>, TransportError> {
        self.respond().await;

        if let Some(error) = &self.node.service_error {
            return Err(TransportError::Rpc(error.clone()));
        }

        Ok(vec![ServiceInfo {
            id: service.to_string(),
            healthy: self.node.etcd_healthy,
            metadata_error: self.node.metadata_error.clone(),
        }])
    }
}
