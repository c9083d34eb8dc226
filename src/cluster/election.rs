//! Lowest-id election.
//!
//! A follower that loses its lease probes every peer ranked below it. Any
//! answer means a better candidate is alive, so the follower stands down and
//! waits for that candidate's heartbeats. Silence from all of them means the
//! probing replica is the lowest survivor and takes over.

use std::time::Duration;

use futures::future::join_all;
use tokio::time::{timeout, Instant};

use crate::cluster::node::ReplicaNode;
use crate::proto::ElectionRequest;

/// Per-probe deadline; a dead peer must not stall the election.
const ELECTION_DEADLINE: Duration = Duration::from_secs(1);

impl ReplicaNode {
    /// Run one election round. Called by the lease watchdog.
    pub(super) async fn start_election(&self) {
        let lower_peers = {
            let state = self.state.read().await;
            if state.is_leader() {
                return;
            }
            state.lower_peers()
        };
        let lease_observed = *self.last_heartbeat.read().await;

        if lower_peers.is_empty() {
            self.assume_leadership().await;
            return;
        }

        tracing::info!(
            node_id = self.id,
            probes = lower_peers.len(),
            "leader lost, probing lower-id peers"
        );

        let responses = join_all(lower_peers.iter().map(|addr| self.probe_peer(addr))).await;
        let any_alive = responses.into_iter().any(|alive| alive);

        // A heartbeat or a lower-id candidacy may have landed while we were
        // probing; both void this candidacy.
        let lease_renewed = *self.last_heartbeat.read().await > lease_observed;

        if any_alive || lease_renewed {
            tracing::info!(
                node_id = self.id,
                any_alive,
                lease_renewed,
                "abandoning candidacy, deferring to lower-id replica"
            );
            *self.last_heartbeat.write().await = Instant::now();
            return;
        }

        self.assume_leadership().await;
    }

    async fn assume_leadership(&self) {
        let epoch = {
            let mut state = self.state.write().await;
            if state.is_leader() {
                return;
            }
            state.become_leader();
            state.epoch
        };
        *self.last_heartbeat.write().await = Instant::now();

        tracing::info!(node_id = self.id, epoch, "assuming leadership");
        self.send_heartbeats().await;
    }

    /// True if the peer answered the probe at all; the vote value is
    /// irrelevant by design.
    async fn probe_peer(&self, addr: &str) -> bool {
        let mut client = match self.client_for(addr).await {
            Ok(client) => client,
            Err(e) => {
                tracing::debug!(peer = %addr, error = %e, "election probe skipped");
                return false;
            }
        };
        let request = ElectionRequest {
            candidate_id: self.id,
        };
        match timeout(ELECTION_DEADLINE, client.election(request)).await {
            Ok(Ok(_)) => true,
            Ok(Err(status)) => {
                tracing::debug!(peer = %addr, error = %status, "election probe failed");
                false
            }
            Err(_) => {
                tracing::debug!(peer = %addr, "election probe timed out");
                false
            }
        }
    }
}
