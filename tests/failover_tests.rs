//! Failover tests: lease expiry, lowest-id election, and post-failover
//! writes.


use std::time::Duration;

use test_harness::{assert_eventually, sample_report, TestCluster};
use vigil::client::SubmitOutcome;
use vigil::store::Tier;

/// Killing the leader promotes the lowest surviving id within the lease
/// plus the election window.
#[tokio::test]
async fn test_lowest_survivor_takes_over() {
    let mut cluster = TestCluster::new(3, 50410).await;
    assert_eq!(cluster.wait_for_leader(Duration::from_secs(2)).await, Some(1));

    assert!(cluster.kill(1));

    assert_eventually(
        || async { cluster.get(2).is_leader().await },
        Duration::from_secs(5),
        "id 2 should take over after the lease expires",
    )
    .await;

    // Id 3 saw id 2 answer its probe and stayed a follower.
    assert!(!cluster.get(3).is_leader().await);
    assert_eq!(cluster.count_leaders().await, 1);
}

/// The cluster keeps accepting writes after failover.
#[tokio::test]
async fn test_writes_succeed_after_failover() {
    let mut cluster = TestCluster::new(3, 50420).await;
    assert_eq!(cluster.wait_for_leader(Duration::from_secs(2)).await, Some(1));

    let client = cluster.client();
    assert!(matches!(
        client.submit(sample_report("P4", 3500, 0.4, Tier::Amber)).await,
        SubmitOutcome::Sent { .. }
    ));

    cluster.kill(1);
    assert_eventually(
        || async { cluster.get(2).is_leader().await },
        Duration::from_secs(5),
        "id 2 should take over",
    )
    .await;

    // The client still points at the dead leader; discovery must recover.
    let outcome = client
        .submit(sample_report("P4", 4000, 0.8, Tier::Red))
        .await;
    match outcome {
        SubmitOutcome::Sent { alert_sent } => assert!(alert_sent),
        // A submit raced the election; the queue must deliver it instead.
        SubmitOutcome::Queued => {
            assert_eventually(
                || async { client.flush().await > 0 || client.queued().await == 0 },
                Duration::from_secs(5),
                "queued report should flush to the new leader",
            )
            .await;
        }
        SubmitOutcome::Rejected(e) => panic!("rejected: {e}"),
    }

    assert!(
        cluster
            .wait_for_report_on(&[2, 3], "P4", 4000, Duration::from_secs(3))
            .await,
        "post-failover write should reach both survivors"
    );
}

/// A follower that outlives a higher-ranked peer still defers to it.
#[tokio::test]
async fn test_middle_replica_defers_to_live_lower_id() {
    let mut cluster = TestCluster::new(3, 50430).await;
    assert_eq!(cluster.wait_for_leader(Duration::from_secs(2)).await, Some(1));

    // Kill a follower; the leader must not change.
    cluster.kill(3);
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert!(cluster.get(1).is_leader().await);
    assert!(!cluster.get(2).is_leader().await);
    assert_eq!(cluster.count_leaders().await, 1);
}
