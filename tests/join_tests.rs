//! Joiner onboarding: snapshot state transfer and membership broadcast.


use std::time::Duration;

use test_harness::{
    assert_eventually, replica_addr, sample_report, test_server_config, TestCluster, TestReplica,
};
use vigil::client::SubmitOutcome;
use vigil::store::Tier;

/// A fresh replica joins a running cluster and ends up with the leader's
/// full table; everyone learns the grown membership.
#[tokio::test]
async fn test_joiner_receives_full_state() {
    let cluster = TestCluster::new(2, 50510).await;
    let client = cluster.client();

    for i in 0..20 {
        let outcome = client
            .submit(sample_report(
                &format!("P{}", i % 4),
                10_000 + i,
                0.45,
                Tier::Amber,
            ))
            .await;
        assert!(matches!(outcome, SubmitOutcome::Sent { .. }));
    }
    assert_eq!(cluster.get(1).store_count().await, 20);

    // Start id 3 with an empty store, configured with the full membership.
    let joiner_port = 50512;
    let all_ports = [50510, 50511, joiner_port];
    let joiner = TestReplica::start(test_server_config(3, joiner_port, &all_ports, false)).await;

    assert_eventually(
        || async { joiner.store_count().await == 20 },
        Duration::from_secs(10),
        "joiner should receive the leader's full table",
    )
    .await;

    // Row-for-row equality per patient against the leader.
    for patient in ["P0", "P1", "P2", "P3"] {
        let on_leader = cluster
            .get(1)
            .node
            .store()
            .list_by_patient(patient.to_string(), 0)
            .await
            .unwrap();
        let on_joiner = joiner
            .node
            .store()
            .list_by_patient(patient.to_string(), 0)
            .await
            .unwrap();
        assert_eq!(on_leader, on_joiner, "patient {patient} history differs");
    }

    // Membership broadcast reached the original follower too.
    assert_eventually(
        || async {
            let state = cluster.get(2).node.state.read().await;
            state.replicas.contains(&replica_addr(joiner_port))
        },
        Duration::from_secs(3),
        "follower should learn the grown membership",
    )
    .await;

    // New writes now replicate to the joiner as well.
    let outcome = client
        .submit(sample_report("P9", 99_000, 0.7, Tier::Red))
        .await;
    assert!(matches!(outcome, SubmitOutcome::Sent { .. }));
    assert_eventually(
        || async { joiner.has_report("P9", 99_000).await },
        Duration::from_secs(3),
        "joiner should receive post-join writes",
    )
    .await;
}

/// A joiner that starts before any leader is reachable keeps retrying with
/// backoff and eventually transfers state.
#[tokio::test]
async fn test_joiner_retries_until_leader_appears() {
    // The joiner comes up first, pointing at a cluster that does not exist
    // yet.
    let base = 50520;
    let all_ports = [base, base + 1];
    let joiner = TestReplica::start(test_server_config(2, base + 1, &all_ports, false)).await;

    tokio::time::sleep(Duration::from_millis(300)).await;

    // Now the leader arrives with data already committed.
    let leader = TestReplica::start(test_server_config(1, base, &all_ports, true)).await;
    let report = sample_report("P1", 1234, 0.5, Tier::Amber);
    leader.node.store().append(report).await.unwrap();

    assert_eventually(
        || async { joiner.has_report("P1", 1234).await },
        Duration::from_secs(10),
        "joiner should transfer state once the leader is reachable",
    )
    .await;
}
