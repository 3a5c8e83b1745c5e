//! Common test utilities and helpers

#![allow(dead_code)]

use keelson_common::labels::{LABEL_CLUSTER, LABEL_CONTROL_PLANE_ROLE, LABEL_MACHINE_SET};
use keelson_common::{
    MachineIdentitySpec, MachineSetSpec, MachineStatusSpec, Namespace, Resource,
    TransportConfigSpec,
};
use keelson_core::store::{MemoryStore, StoreExt};
use keelson_core::transport::{EtcdMember, FixtureFactory, FixtureNode};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Poll `check` until it holds, gives up after about two seconds
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    false
}

/// Management address of a test machine
pub fn address(machine: &str) -> String {
    format!("{}.cluster.local:50000", machine)
}

/// Member list entries for `(member_id, hostname)` pairs
pub fn members(pairs: &[(u64, &str)]) -> Vec<EtcdMember> {
    pairs
        .iter()
        .map(|(id, hostname)| EtcdMember::new(*id, *hostname))
        .collect()
}

/// One control plane machine set of a cluster, backed by a memory store
/// and scripted machine clients
pub struct ClusterFixture {
    pub store: Arc<MemoryStore>,
    pub factory: FixtureFactory,
    pub cluster: String,
    pub machine_set: Resource<MachineSetSpec>,
}

impl ClusterFixture {
    pub async fn new(cluster: &str) -> Self {
        let store = Arc::new(MemoryStore::new());
        let machine_set_id = format!("{}-control-planes", cluster);
        let owned = cluster.to_string();

        let machine_set = store
            .modify::<MachineSetSpec, _>(Namespace::Default, &machine_set_id, move |res| {
                res.metadata.labels.insert(LABEL_CLUSTER.to_string(), owned);
                res.metadata
                    .labels
                    .insert(LABEL_CONTROL_PLANE_ROLE.to_string(), String::new());
                res.spec.machine_count = 3;
                Ok(())
            })
            .await
            .unwrap();

        store
            .modify::<TransportConfigSpec, _>(Namespace::Default, cluster, |res| {
                res.spec.ca = "ca".to_string();
                res.spec.crt = "crt".to_string();
                res.spec.key = "key".to_string();
                Ok(())
            })
            .await
            .unwrap();

        Self {
            store,
            factory: FixtureFactory::new(),
            cluster: cluster.to_string(),
            machine_set,
        }
    }

    /// Add a connected control plane machine that joined etcd as `member_id`
    pub async fn add_machine(&self, machine: &str, member_id: u64, node: FixtureNode) {
        self.add_machine_status(machine, &address(machine), true).await;
        self.set_identity(machine, member_id).await;
        self.factory.set_node(address(machine), node);
    }

    pub async fn add_machine_status(&self, machine: &str, management_address: &str, connected: bool) {
        let cluster = self.cluster.clone();
        let machine_set = self.machine_set.id().to_string();
        let management_address = management_address.to_string();

        self.store
            .modify::<MachineStatusSpec, _>(Namespace::Default, machine, move |res| {
                res.metadata.labels.insert(LABEL_CLUSTER.to_string(), cluster.clone());
                res.metadata.labels.insert(LABEL_MACHINE_SET.to_string(), machine_set);
                res.metadata
                    .labels
                    .insert(LABEL_CONTROL_PLANE_ROLE.to_string(), String::new());
                res.spec.management_address = management_address;
                res.spec.connected = connected;
                res.spec.cluster = cluster;
                res.spec.version = "v1.8.0".to_string();
                Ok(())
            })
            .await
            .unwrap();
    }

    pub async fn set_identity(&self, machine: &str, member_id: u64) {
        let node_name = machine.to_string();

        self.store
            .modify::<MachineIdentitySpec, _>(Namespace::Default, machine, move |res| {
                res.spec.etcd_member_id = member_id;
                res.spec.node_name = node_name;
                Ok(())
            })
            .await
            .unwrap();
    }

    /// Three healthy members that agree on membership
    pub async fn healthy_three(cluster: &str) -> Self {
        let fixture = Self::new(cluster).await;
        let all = members(&[(1, "cp-1"), (2, "cp-2"), (3, "cp-3")]);

        for (i, machine) in ["cp-1", "cp-2", "cp-3"].iter().enumerate() {
            let id = i as u64 + 1;
            fixture
                .add_machine(machine, id, FixtureNode::healthy(*machine, id, &all))
                .await;
        }

        fixture
    }
}
