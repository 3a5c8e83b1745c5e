//! etcd Evaluation Tests
//! Member health, quorum-safe scale down and the periodic etcd condition check

mod common;

use common::{address, members, ClusterFixture};
use keelson_common::labels::{LABEL_CLUSTER, LABEL_CONTROL_PLANE_ROLE};
use keelson_common::{ConditionReason, MachineSetSpec, Namespace, Resource, Severity, TransportConfigSpec};
use keelson_core::check::{
    can_scale_down, check_etcd, etcd_status, EtcdCheckOptions, EtcdStatusError, ScaleDownDenied,
};
use keelson_core::error::TransportError;
use keelson_core::store::StoreExt;
use keelson_core::transport::{Endpoints, FixtureNode};
use std::path::PathBuf;

fn options() -> EtcdCheckOptions {
    EtcdCheckOptions::default()
}

// ============== etcd_status ==============

#[tokio::test]
async fn test_status_all_healthy() {
    let fixture = ClusterFixture::healthy_three("prod").await;

    let status = etcd_status(
        fixture.store.as_ref(),
        &fixture.factory,
        &fixture.machine_set,
        &options(),
    )
    .await
    .unwrap();

    assert_eq!(status.members.len(), 3);
    assert_eq!(status.healthy_members, 3);
    assert!(status.members.values().all(|m| m.healthy && m.error.is_none()));

    // one cluster client plus one per node, all released
    assert_eq!(fixture.factory.total_connects(), 4);
    assert_eq!(fixture.factory.open_clients(), 0);
}

#[tokio::test]
async fn test_scenario_a_remove_healthy_from_healthy_three() {
    let fixture = ClusterFixture::healthy_three("prod").await;

    let status = etcd_status(fixture.store.as_ref(), &fixture.factory, &fixture.machine_set, &options())
        .await
        .unwrap();

    assert!(can_scale_down(&status, "cp-1").is_ok());
}

#[tokio::test]
async fn test_scenarios_b_and_c_one_unhealthy_member() {
    let fixture = ClusterFixture::new("prod").await;
    let all = members(&[(1, "cp-1"), (2, "cp-2"), (3, "cp-3")]);

    fixture.add_machine("cp-1", 1, FixtureNode::healthy("cp-1", 1, &all)).await;
    fixture.add_machine("cp-2", 2, FixtureNode::healthy("cp-2", 2, &all)).await;
    fixture
        .add_machine("cp-3", 3, FixtureNode::healthy("cp-3", 3, &all).unhealthy())
        .await;

    let status = etcd_status(fixture.store.as_ref(), &fixture.factory, &fixture.machine_set, &options())
        .await
        .unwrap();

    assert_eq!(status.members.len(), 3);
    assert_eq!(status.healthy_members, 2);

    // B: removing the unhealthy member keeps 2 of 2
    assert!(can_scale_down(&status, "cp-3").is_ok());

    // C: removing a healthy member leaves 1 of 2
    assert_eq!(
        can_scale_down(&status, "cp-1"),
        Err(ScaleDownDenied::WouldBreakQuorum {
            machine: "cp-1".to_string()
        })
    );
}

#[tokio::test]
async fn test_scenario_d_already_below_quorum() {
    let fixture = ClusterFixture::new("prod").await;
    let all = members(&[(1, "cp-1"), (2, "cp-2")]);

    fixture.add_machine("cp-1", 1, FixtureNode::healthy("cp-1", 1, &all)).await;
    fixture
        .add_machine("cp-2", 2, FixtureNode::healthy("cp-2", 2, &all).unhealthy())
        .await;

    let status = etcd_status(fixture.store.as_ref(), &fixture.factory, &fixture.machine_set, &options())
        .await
        .unwrap();

    for machine in ["cp-1", "cp-2"] {
        let err = can_scale_down(&status, machine).unwrap_err();
        assert!(matches!(err, ScaleDownDenied::NoQuorum { .. }));
        assert!(err.to_string().contains("etcd doesn't have quorum"));
    }
}

#[tokio::test]
async fn test_disconnected_machine_is_unreachable_member() {
    let fixture = ClusterFixture::new("prod").await;
    let all = members(&[(1, "cp-1"), (2, "cp-2"), (3, "cp-3")]);

    fixture.add_machine("cp-1", 1, FixtureNode::healthy("cp-1", 1, &all)).await;
    fixture.add_machine("cp-2", 2, FixtureNode::healthy("cp-2", 2, &all)).await;
    fixture.add_machine_status("cp-3", &address("cp-3"), false).await;
    fixture.set_identity("cp-3", 3).await;

    let status = etcd_status(fixture.store.as_ref(), &fixture.factory, &fixture.machine_set, &options())
        .await
        .unwrap();

    let member = &status.members["cp-3"];
    assert!(!member.healthy);
    assert_eq!(member.error.as_deref(), Some("the machine is unreachable"));
    assert_eq!(status.healthy_members, 2);

    // no per-node call for the disconnected machine
    assert_eq!(fixture.factory.total_connects(), 3);
}

#[tokio::test]
async fn test_joining_machines_are_excluded() {
    let fixture = ClusterFixture::new("prod").await;
    let all = members(&[(1, "cp-1")]);

    fixture.add_machine("cp-1", 1, FixtureNode::healthy("cp-1", 1, &all)).await;

    // identity without a member ID yet
    fixture.add_machine("cp-2", 0, FixtureNode::healthy("cp-2", 0, &all)).await;

    // no identity at all
    fixture.add_machine_status("cp-3", &address("cp-3"), true).await;

    // member ID not in the live member list
    fixture.add_machine("cp-4", 4, FixtureNode::healthy("cp-4", 4, &all)).await;

    let status = etcd_status(fixture.store.as_ref(), &fixture.factory, &fixture.machine_set, &options())
        .await
        .unwrap();

    assert_eq!(status.members.keys().collect::<Vec<_>>(), vec!["cp-1"]);
    assert_eq!(status.healthy_members, 1);

    // joining machines can always be removed
    assert!(can_scale_down(&status, "cp-2").is_ok());
    assert!(can_scale_down(&status, "cp-3").is_ok());
}

#[tokio::test]
async fn test_unmatched_live_member_fails() {
    let fixture = ClusterFixture::new("prod").await;
    let all = members(&[(1, "cp-1"), (2, "cp-2"), (0xdead, "ghost")]);

    fixture.add_machine("cp-1", 1, FixtureNode::healthy("cp-1", 1, &all)).await;
    fixture.add_machine("cp-2", 2, FixtureNode::healthy("cp-2", 2, &all)).await;

    let err = etcd_status(fixture.store.as_ref(), &fixture.factory, &fixture.machine_set, &options())
        .await
        .unwrap_err();

    match err {
        EtcdStatusError::UnmatchedMembers { members } => {
            assert_eq!(members, vec!["000000000000dead".to_string()]);
        }
        other => panic!("unexpected error: {}", other),
    }

    assert_eq!(fixture.factory.open_clients(), 0);
}

#[tokio::test]
async fn test_machine_set_preconditions() {
    let fixture = ClusterFixture::healthy_three("prod").await;

    let workers = Resource::<MachineSetSpec>::new(Namespace::Default, "prod-workers").with_label(LABEL_CLUSTER, "prod");
    let err = etcd_status(fixture.store.as_ref(), &fixture.factory, &workers, &options())
        .await
        .unwrap_err();
    assert!(matches!(err, EtcdStatusError::NotControlPlane));

    let unlabeled = Resource::<MachineSetSpec>::new(Namespace::Default, "orphan").with_label(LABEL_CONTROL_PLANE_ROLE, "");
    let err = etcd_status(fixture.store.as_ref(), &fixture.factory, &unlabeled, &options())
        .await
        .unwrap_err();
    assert!(matches!(err, EtcdStatusError::MissingClusterLabel));

    assert_eq!(fixture.factory.total_connects(), 0);
}

#[tokio::test]
async fn test_missing_transport_config() {
    let fixture = ClusterFixture::healthy_three("prod").await;
    fixture
        .store
        .destroy::<TransportConfigSpec>(Namespace::Default, "prod")
        .await
        .unwrap();

    let err = etcd_status(fixture.store.as_ref(), &fixture.factory, &fixture.machine_set, &options())
        .await
        .unwrap_err();

    match err {
        EtcdStatusError::TransportConfig { cluster, source } => {
            assert_eq!(cluster, "prod");
            assert!(source.is_not_ready());
        }
        other => panic!("unexpected error: {}", other),
    }
}

#[tokio::test]
async fn test_node_errors_are_recorded_per_member() {
    let fixture = ClusterFixture::new("prod").await;
    let all = members(&[(1, "cp-1"), (2, "cp-2"), (3, "cp-3")]);

    fixture.add_machine("cp-1", 1, FixtureNode::healthy("cp-1", 1, &all)).await;
    fixture
        .add_machine(
            "cp-2",
            2,
            FixtureNode::healthy("cp-2", 2, &all).with_metadata_error("service etcd is not running"),
        )
        .await;
    fixture
        .add_machine("cp-3", 3, FixtureNode::healthy("cp-3", 3, &all).unreachable())
        .await;

    let status = etcd_status(fixture.store.as_ref(), &fixture.factory, &fixture.machine_set, &options())
        .await
        .unwrap();

    assert_eq!(status.healthy_members, 1);
    assert_eq!(
        status.members["cp-2"].error.as_deref(),
        Some("service etcd is not running")
    );

    let unreachable = status.members["cp-3"].error.as_deref().unwrap();
    assert!(unreachable.contains("connection refused"));
    assert_eq!(fixture.factory.open_clients(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_hanging_node_times_out() {
    let fixture = ClusterFixture::new("prod").await;
    let all = members(&[(1, "cp-1"), (2, "cp-2"), (3, "cp-3")]);

    fixture.add_machine("cp-1", 1, FixtureNode::healthy("cp-1", 1, &all)).await;
    fixture.add_machine("cp-2", 2, FixtureNode::healthy("cp-2", 2, &all)).await;
    fixture
        .add_machine("cp-3", 3, FixtureNode::healthy("cp-3", 3, &all).hanging())
        .await;

    let status = etcd_status(fixture.store.as_ref(), &fixture.factory, &fixture.machine_set, &options())
        .await
        .unwrap();

    let member = &status.members["cp-3"];
    assert!(!member.healthy);
    assert!(member.error.as_deref().unwrap().contains("timed out"));
    assert_eq!(status.healthy_members, 2);
    assert_eq!(fixture.factory.open_clients(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_status_stalled_cluster_connect_times_out() {
    let fixture = ClusterFixture::new("prod").await;
    let all = members(&[(1, "cp-1"), (2, "cp-2"), (3, "cp-3")]);

    fixture
        .add_machine("cp-1", 1, FixtureNode::healthy("cp-1", 1, &all).hanging_connect())
        .await;
    fixture.add_machine("cp-2", 2, FixtureNode::healthy("cp-2", 2, &all)).await;
    fixture.add_machine("cp-3", 3, FixtureNode::healthy("cp-3", 3, &all)).await;

    let err = etcd_status(fixture.store.as_ref(), &fixture.factory, &fixture.machine_set, &options())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        EtcdStatusError::Transport(TransportError::Timeout(limit)) if limit == options().member_list_timeout
    ));
    assert_eq!(fixture.factory.open_clients(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_status_stalled_node_connect_is_a_member_error() {
    let fixture = ClusterFixture::new("prod").await;
    let all = members(&[(1, "cp-1"), (2, "cp-2"), (3, "cp-3")]);

    fixture.add_machine("cp-1", 1, FixtureNode::healthy("cp-1", 1, &all)).await;
    fixture.add_machine("cp-2", 2, FixtureNode::healthy("cp-2", 2, &all)).await;
    fixture
        .add_machine("cp-3", 3, FixtureNode::healthy("cp-3", 3, &all).hanging_connect())
        .await;

    let status = etcd_status(fixture.store.as_ref(), &fixture.factory, &fixture.machine_set, &options())
        .await
        .unwrap();

    let member = &status.members["cp-3"];
    assert!(!member.healthy);
    assert!(member.error.as_deref().unwrap().contains("timed out"));
    assert_eq!(status.healthy_members, 2);
}

#[tokio::test]
async fn test_socket_fast_path_is_used_exclusively() {
    let fixture = ClusterFixture::new("prod").await;
    let socket = "unix:///run/keelson/machine.sock";
    let all = members(&[(1, "cp-1"), (2, "cp-2"), (3, "cp-3")]);

    fixture.add_machine("cp-1", 1, FixtureNode::healthy("cp-1", 1, &all)).await;
    fixture.add_machine_status("cp-2", socket, true).await;
    fixture.set_identity("cp-2", 2).await;
    fixture.factory.set_node(socket, FixtureNode::healthy("cp-2", 2, &all));
    fixture.add_machine("cp-3", 3, FixtureNode::healthy("cp-3", 3, &all)).await;

    let status = etcd_status(fixture.store.as_ref(), &fixture.factory, &fixture.machine_set, &options())
        .await
        .unwrap();

    assert_eq!(status.healthy_members, 3);
    assert_eq!(
        fixture.factory.connections()[0],
        Endpoints::Socket(PathBuf::from("/run/keelson/machine.sock"))
    );
}

// ============== check_etcd ==============

#[tokio::test]
async fn test_check_healthy_three_is_ready() {
    let fixture = ClusterFixture::healthy_three("prod").await;

    let condition = check_etcd(fixture.store.as_ref(), &fixture.factory, "prod", &options()).await;

    assert!(condition.is_none());
    assert_eq!(fixture.factory.open_clients(), 0);
}

#[tokio::test]
async fn test_check_two_members_warns() {
    let fixture = ClusterFixture::new("prod").await;
    let all = members(&[(1, "cp-1"), (2, "cp-2")]);

    fixture.add_machine("cp-1", 1, FixtureNode::healthy("cp-1", 1, &all)).await;
    fixture.add_machine("cp-2", 2, FixtureNode::healthy("cp-2", 2, &all)).await;

    let condition = check_etcd(fixture.store.as_ref(), &fixture.factory, "prod", &options())
        .await
        .unwrap();

    assert_eq!(condition.severity(), Severity::Warning);
    assert_eq!(condition.reason(), ConditionReason::MinimumQuorum);
    assert_eq!(
        condition.message(),
        "Etcd members count is equal to the minimum quorum 2. The cluster cannot tolerate the loss of any members"
    );
}

#[tokio::test]
async fn test_check_four_members_is_not_optimal() {
    let fixture = ClusterFixture::new("prod").await;
    let all = members(&[(1, "cp-1"), (2, "cp-2"), (3, "cp-3"), (4, "cp-4")]);

    for id in 1..=4u64 {
        let machine = format!("cp-{}", id);
        fixture
            .add_machine(&machine, id, FixtureNode::healthy(machine.as_str(), id, &all))
            .await;
    }

    let condition = check_etcd(fixture.store.as_ref(), &fixture.factory, "prod", &options())
        .await
        .unwrap();

    assert_eq!(condition.reason(), ConditionReason::SuboptimalMemberCount);
    assert_eq!(
        condition.message(),
        "Etcd members count 4 is not optimal. Recommended count is 5"
    );
}

#[tokio::test]
async fn test_check_divergent_views() {
    let fixture = ClusterFixture::new("prod").await;

    fixture
        .add_machine("cp-a", 1, FixtureNode::healthy("cp-a", 1, &members(&[(1, "h1"), (2, "h2")])))
        .await;
    fixture
        .add_machine("cp-b", 2, FixtureNode::healthy("cp-b", 2, &members(&[(1, "h1"), (2, "h3")])))
        .await;

    let condition = check_etcd(fixture.store.as_ref(), &fixture.factory, "prod", &options())
        .await
        .unwrap();

    assert_eq!(condition.severity(), Severity::Error);
    assert_eq!(condition.reason(), ConditionReason::MembersDiverged);
    assert!(!condition.interrupt());
    assert_eq!(
        condition.message(),
        "Etcd members don't match on nodes cp-a and cp-b"
    );
    assert_eq!(fixture.factory.open_clients(), 0);
}

#[tokio::test]
async fn test_check_member_errors() {
    let fixture = ClusterFixture::new("prod").await;
    let all = members(&[(1, "cp-1")]);

    fixture
        .add_machine(
            "cp-1",
            1,
            FixtureNode::healthy("cp-1", 1, &all).with_member_errors(&["NOSPACE", "CORRUPT"]),
        )
        .await;

    let condition = check_etcd(fixture.store.as_ref(), &fixture.factory, "prod", &options())
        .await
        .unwrap();

    assert_eq!(condition.reason(), ConditionReason::EtcdStatusFailed);
    assert!(condition.message().starts_with("Etcd status check failed"));
    assert!(condition.message().contains("NOSPACE, CORRUPT"));
}

#[tokio::test]
async fn test_check_member_list_failure() {
    let fixture = ClusterFixture::new("prod").await;

    fixture
        .add_machine(
            "cp-1",
            1,
            FixtureNode::healthy("cp-1", 1, &[]).with_member_list_error("etcd is not running"),
        )
        .await;

    let condition = check_etcd(fixture.store.as_ref(), &fixture.factory, "prod", &options())
        .await
        .unwrap();

    assert_eq!(condition.reason(), ConditionReason::MemberListFailed);
    assert!(condition.message().contains("etcd is not running"));
}

#[tokio::test]
async fn test_check_client_not_ready() {
    let fixture = ClusterFixture::new("prod").await;
    fixture.add_machine_status("cp-1", "", true).await;

    let condition = check_etcd(fixture.store.as_ref(), &fixture.factory, "prod", &options())
        .await
        .unwrap();

    assert_eq!(condition.reason(), ConditionReason::ClientNotReady);
    assert_eq!(condition.message(), "Machine client is not ready on node cp-1");
}

#[tokio::test]
async fn test_check_missing_transport_config_is_not_ready() {
    let fixture = ClusterFixture::healthy_three("prod").await;
    fixture
        .store
        .destroy::<TransportConfigSpec>(Namespace::Default, "prod")
        .await
        .unwrap();

    let condition = check_etcd(fixture.store.as_ref(), &fixture.factory, "prod", &options())
        .await
        .unwrap();

    assert_eq!(condition.reason(), ConditionReason::ClientNotReady);
    assert_eq!(fixture.factory.total_connects(), 0);
}

#[tokio::test]
async fn test_check_unreachable_node() {
    let fixture = ClusterFixture::new("prod").await;
    let all = members(&[(1, "cp-1"), (2, "cp-2"), (3, "cp-3")]);

    fixture.add_machine("cp-1", 1, FixtureNode::healthy("cp-1", 1, &all)).await;
    fixture
        .add_machine("cp-2", 2, FixtureNode::healthy("cp-2", 2, &all).unreachable())
        .await;
    fixture.add_machine("cp-3", 3, FixtureNode::healthy("cp-3", 3, &all)).await;

    let condition = check_etcd(fixture.store.as_ref(), &fixture.factory, "prod", &options())
        .await
        .unwrap();

    assert_eq!(condition.reason(), ConditionReason::ConnectFailed);
    assert!(condition.message().starts_with("Failed to connect to node cp-2"));
    assert_eq!(fixture.factory.open_clients(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_check_stalled_connect_reports_connect_failure() {
    let fixture = ClusterFixture::new("prod").await;
    let all = members(&[(1, "cp-1"), (2, "cp-2"), (3, "cp-3")]);

    fixture.add_machine("cp-1", 1, FixtureNode::healthy("cp-1", 1, &all)).await;
    fixture
        .add_machine("cp-2", 2, FixtureNode::healthy("cp-2", 2, &all).hanging_connect())
        .await;
    fixture.add_machine("cp-3", 3, FixtureNode::healthy("cp-3", 3, &all)).await;

    let condition = check_etcd(fixture.store.as_ref(), &fixture.factory, "prod", &options())
        .await
        .unwrap();

    assert_eq!(condition.reason(), ConditionReason::ConnectFailed);
    assert!(condition.message().starts_with("Failed to connect to node cp-2"));
    assert!(condition.message().contains("timed out"));
    assert_eq!(fixture.factory.open_clients(), 0);
}

#[tokio::test]
async fn test_check_without_control_plane_machines() {
    let fixture = ClusterFixture::new("empty").await;

    let condition = check_etcd(fixture.store.as_ref(), &fixture.factory, "empty", &options())
        .await
        .unwrap();

    assert_eq!(condition.reason(), ConditionReason::SuboptimalMemberCount);
    assert_eq!(
        condition.message(),
        "Etcd members count 0 is not optimal. Recommended count is 1"
    );
}
