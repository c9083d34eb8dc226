//! Cluster onboarding: snapshot hand-off on the leader, backoff-retried
//! state transfer on the joiner.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use crate::cluster::node::ReplicaNode;
use crate::cluster::replicate::Operation;
use crate::error::{Result, VigilError};
use crate::proto::monitor_client::MonitorClient as MonitorRpcClient;
use crate::proto::{GetLeaderInfoRequest, JoinClusterRequest};
use crate::store::RiskReport;

/// Snapshot transfer is full-state and may be large.
const JOIN_DEADLINE: Duration = Duration::from_secs(30);

/// Per-peer deadline while the joiner looks for the leader.
const DISCOVERY_DEADLINE: Duration = Duration::from_secs(1);

const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

impl ReplicaNode {
    /// Leader side of `JoinCluster`: admit the joiner, hand it a snapshot,
    /// and broadcast the grown membership to everyone.
    pub async fn handle_join(&self, new_address: String) -> Result<String> {
        let (added, replicas, leader_address) = {
            let mut state = self.state.write().await;
            if !state.is_leader() {
                return Err(VigilError::NotLeader(state.leader_address.clone()));
            }
            let added = state.add_replica(&new_address);
            (
                added,
                state.replicas.clone(),
                state
                    .leader_address
                    .clone()
                    .unwrap_or_else(|| self.address.clone()),
            )
        };

        if added {
            tracing::info!(node_id = self.id, joiner = %new_address, "replica admitted to cluster");
        } else {
            tracing::info!(node_id = self.id, joiner = %new_address, "known replica re-joining");
        }

        let snapshot = self.store.snapshot().await?;
        let state_json = serde_json::to_string(&snapshot)
            .map_err(|e| VigilError::Internal(format!("encoding snapshot: {e}")))?;

        self.broadcast_membership(replicas, leader_address).await;

        Ok(state_json)
    }

    /// Best-effort `membership_update` to every member; the joiner itself
    /// learns the list the same way.
    pub(super) async fn broadcast_membership(&self, replicas: Vec<String>, leader_address: String) {
        let op = Operation::MembershipUpdate {
            replicas: replicas.clone(),
            leader_address,
        };
        let request = match op.to_wire() {
            Ok(request) => request,
            Err(e) => {
                tracing::error!(node_id = self.id, error = %e, "unencodable membership payload");
                return;
            }
        };

        for addr in replicas.into_iter().filter(|addr| *addr != self.address) {
            let client = self.client_for(&addr).await;
            let request = request.clone();
            tokio::spawn(async move {
                let mut client = match client {
                    Ok(client) => client,
                    Err(e) => {
                        tracing::debug!(peer = %addr, error = %e, "membership broadcast skipped");
                        return;
                    }
                };
                if let Err(status) = timeout(
                    super::node::REPLICATION_DEADLINE,
                    client.replicate_operation(request),
                )
                .await
                .map_err(|_| tonic::Status::deadline_exceeded("membership broadcast"))
                .and_then(|result| result)
                {
                    tracing::debug!(peer = %addr, error = %status, "membership broadcast failed");
                }
            });
        }
    }

    /// Joiner side: once a leader is known and the local store is empty,
    /// request a snapshot with exponential backoff until it lands.
    pub async fn run_joiner(self: Arc<Self>, cancel: CancellationToken) {
        if self.config.initial_leader {
            return;
        }

        // Learn who leads: the first heartbeat reveals it when the leader
        // already lists us; a brand-new replica has to ask the configured
        // members directly.
        loop {
            if self.discover_leader().await.is_some() {
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = sleep(Duration::from_millis(200)) => {}
            }
        }

        match self.store.is_empty().await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(node_id = self.id, "store not empty, skipping state transfer");
                return;
            }
            Err(e) => {
                tracing::error!(node_id = self.id, error = %e, "cannot inspect store before join");
                return;
            }
        }

        let mut backoff = BACKOFF_INITIAL;
        loop {
            let attempt = match self.discover_leader().await {
                Some(addr) if addr != self.address => self.try_join(&addr).await,
                _ => Err(VigilError::NotLeader(None)),
            };

            match attempt {
                Ok(count) => {
                    tracing::info!(node_id = self.id, reports = count, "state transfer complete");
                    return;
                }
                Err(e) => {
                    tracing::warn!(
                        node_id = self.id,
                        error = %e,
                        retry_in_ms = backoff.as_millis(),
                        "join attempt failed"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(BACKOFF_CAP);
                }
            }
        }
    }

    /// The leader this replica should join: whatever heartbeats have
    /// installed, else the first leader any configured member reports.
    async fn discover_leader(&self) -> Option<String> {
        let (known, peers) = {
            let state = self.state.read().await;
            (state.leader_address.clone(), state.follower_addresses())
        };
        if known.is_some() {
            return known;
        }

        for addr in peers {
            let endpoint = match tonic::transport::Endpoint::from_shared(format!("http://{addr}")) {
                Ok(endpoint) => endpoint,
                Err(_) => continue,
            };
            let mut client = MonitorRpcClient::new(endpoint.connect_lazy());
            let response = match timeout(
                DISCOVERY_DEADLINE,
                client.get_leader_info(GetLeaderInfoRequest {}),
            )
            .await
            {
                Ok(Ok(response)) => response.into_inner(),
                _ => continue,
            };
            if response.success && !response.leader_address.is_empty() {
                return Some(response.leader_address);
            }
        }
        None
    }

    async fn try_join(&self, leader: &str) -> Result<usize> {
        let mut client = self.client_for(leader).await?;
        let request = JoinClusterRequest {
            new_address: self.address.clone(),
        };

        let response = timeout(JOIN_DEADLINE, client.join_cluster(request))
            .await
            .map_err(|_| VigilError::DeadlineExpired)??
            .into_inner();

        if !response.success {
            return Err(VigilError::Snapshot(response.message));
        }

        let reports: Vec<RiskReport> = serde_json::from_str(&response.state)
            .map_err(|e| VigilError::Snapshot(format!("decoding snapshot: {e}")))?;
        let count = reports.len();
        self.store.load_snapshot(reports).await?;
        Ok(count)
    }
}
