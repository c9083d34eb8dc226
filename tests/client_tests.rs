//! Client runtime against a live cluster: discovery through fallbacks,
//! retry queueing, and the background heartbeat.


use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use test_harness::{assert_eventually, sample_report, TestCluster};
use vigil::client::SubmitOutcome;
use vigil::store::Tier;

/// A client whose preferred address is dead finds the leader by probing the
/// fallback list.
#[tokio::test]
async fn test_discovery_through_fallbacks() {
    let cluster = TestCluster::new(3, 50610).await;

    // Preferred address points at a port nobody listens on.
    let client = cluster.client_preferring("127.0.0.1:50609");
    let leader = client.locate_leader().await.unwrap();
    assert_eq!(leader, cluster.addr_of(1));

    let outcome = client
        .submit(sample_report("P1", 1000, 0.5, Tier::Amber))
        .await;
    assert!(matches!(outcome, SubmitOutcome::Sent { .. }));
}

/// Reports submitted while no leader is reachable are queued and delivered
/// once the cluster recovers.
#[tokio::test]
async fn test_queue_drains_after_failover() {
    let mut cluster = TestCluster::new(3, 50620).await;
    let client = cluster.client();

    cluster.kill(1);

    // Submit immediately; the survivors need a full lease to notice, so this
    // may land in the queue.
    let outcome = client
        .submit(sample_report("P2", 2000, 0.7, Tier::Red))
        .await;

    if matches!(outcome, SubmitOutcome::Queued) {
        assert_eq!(client.queued().await, 1);
        assert_eventually(
            || async { cluster.get(2).is_leader().await },
            Duration::from_secs(5),
            "id 2 should take over",
        )
        .await;
        assert_eventually(
            || async {
                client.flush().await;
                client.queued().await == 0
            },
            Duration::from_secs(5),
            "queue should drain to the new leader",
        )
        .await;
    }

    assert!(
        cluster
            .wait_for_report_on(&[2, 3], "P2", 2000, Duration::from_secs(5))
            .await,
        "report should land on both survivors"
    );
}

/// The background heartbeat keeps leader knowledge fresh and drains the
/// queue without explicit flush calls.
#[tokio::test]
async fn test_background_heartbeat_flushes_queue() {
    let mut cluster = TestCluster::new(3, 50630).await;
    let client = Arc::new(cluster.client());

    let cancel = CancellationToken::new();
    let runner = tokio::spawn(client.clone().run(cancel.clone()));

    cluster.kill(1);
    let outcome = client
        .submit(sample_report("P3", 3000, 0.4, Tier::Amber))
        .await;

    if matches!(outcome, SubmitOutcome::Queued) {
        assert_eventually(
            || async { client.queued().await == 0 },
            Duration::from_secs(10),
            "background loop should deliver the queued report",
        )
        .await;
    }

    assert!(
        cluster
            .wait_for_report_on(&[2, 3], "P3", 3000, Duration::from_secs(5))
            .await
    );

    cancel.cancel();
    let _ = runner.await;
}

/// Queries are served from the leader with newest-first ordering.
#[tokio::test]
async fn test_list_reports_newest_first() {
    let cluster = TestCluster::new(1, 50640).await;
    let client = cluster.client();

    for ts in [1000, 3000, 2000] {
        let outcome = client
            .submit(sample_report("P4", ts, 0.5, Tier::Amber))
            .await;
        assert!(matches!(outcome, SubmitOutcome::Sent { .. }));
    }

    let all = client.list_reports("P4", 0).await.unwrap();
    let timestamps: Vec<i64> = all.iter().map(|r| r.timestamp).collect();
    assert_eq!(timestamps, vec![3000, 2000, 1000]);

    let limited = client.list_reports("P4", 2).await.unwrap();
    assert_eq!(limited.len(), 2);
    assert_eq!(limited[0].timestamp, 3000);
}
