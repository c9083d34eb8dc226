//! The replica node: failure detection, heartbeat emission, write
//! replication, and the RPC entry points the transport delegates to.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, Endpoint};

use crate::alert::AlertSink;
use crate::cluster::replicate::Operation;
use crate::cluster::state::{ClusterState, HeartbeatOutcome, Role};
use crate::config::ServerConfig;
use crate::error::{Result, VigilError};
use crate::proto::replica_client::ReplicaClient;
use crate::proto::{ElectionRequest, ElectionResponse, HeartbeatRequest, HeartbeatResponse};
use crate::store::{RiskReport, Store, Tier};

/// Per-call deadline for a replication fan-out leg.
pub(super) const REPLICATION_DEADLINE: Duration = Duration::from_secs(5);

/// One replica process's coordination core. Shared as `Arc` between the
/// gRPC services and the background loops.
pub struct ReplicaNode {
    pub(super) id: u64,
    pub(super) address: String,
    pub(super) config: ServerConfig,
    pub state: Arc<RwLock<ClusterState>>,
    pub(super) last_heartbeat: Arc<RwLock<Instant>>,
    pub(super) peers: Mutex<HashMap<String, ReplicaClient<Channel>>>,
    pub(super) store: Arc<Store>,
    pub(super) alert_sink: Arc<dyn AlertSink>,
}

impl ReplicaNode {
    pub fn new(config: ServerConfig, store: Arc<Store>, alert_sink: Arc<dyn AlertSink>) -> Self {
        let state = ClusterState::new(
            config.self_id,
            config.self_address(),
            config.initial_replicas(),
            config.initial_leader,
        );
        Self {
            id: config.self_id,
            address: config.self_address(),
            state: Arc::new(RwLock::new(state)),
            last_heartbeat: Arc::new(RwLock::new(Instant::now())),
            peers: Mutex::new(HashMap::new()),
            store,
            alert_sink,
            config,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub async fn is_leader(&self) -> bool {
        self.state.read().await.is_leader()
    }

    pub async fn leader_address(&self) -> Option<String> {
        self.state.read().await.leader_address.clone()
    }

    /// Main loop: heartbeat emitter while leading, lease watchdog while
    /// following. Runs until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let heartbeat_interval = self.config.heartbeat_interval();
        let lease_timeout = self.config.lease_timeout();

        if self.config.initial_leader {
            self.send_heartbeats().await;
        }

        loop {
            let role = self.state.read().await.role;

            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!(node_id = self.id, "cluster loop stopping");
                    break;
                }

                _ = sleep(heartbeat_interval), if role == Role::Leader => {
                    self.send_heartbeats().await;
                }

                _ = sleep(heartbeat_interval), if role == Role::Follower => {
                    let elapsed = self.last_heartbeat.read().await.elapsed();
                    if elapsed > lease_timeout {
                        tracing::warn!(
                            node_id = self.id,
                            silent_ms = elapsed.as_millis(),
                            "leader lease expired"
                        );
                        self.start_election().await;
                    }
                }
            }
        }
    }

    /// Fan a heartbeat out to every other member, fire-and-forget. Failures
    /// are logged and never demote the leader.
    pub(super) async fn send_heartbeats(&self) {
        let (followers, epoch) = {
            let state = self.state.read().await;
            if !state.is_leader() {
                return;
            }
            (state.follower_addresses(), state.epoch)
        };

        let request = HeartbeatRequest {
            leader_id: self.id,
            leader_address: self.address.clone(),
            epoch,
            sent_at_ms: chrono::Utc::now().timestamp_millis(),
        };

        let deadline = self.config.heartbeat_interval();
        for addr in followers {
            let client = self.client_for(&addr).await;
            let request = request.clone();
            tokio::spawn(async move {
                let mut client = match client {
                    Ok(client) => client,
                    Err(e) => {
                        tracing::debug!(peer = %addr, error = %e, "heartbeat skipped");
                        return;
                    }
                };
                match timeout(deadline, client.heartbeat(request)).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(status)) => {
                        tracing::trace!(peer = %addr, error = %status, "heartbeat rejected");
                    }
                    Err(_) => {
                        tracing::trace!(peer = %addr, "heartbeat timed out");
                    }
                }
            });
        }
    }

    /// Incoming heartbeat from a leader.
    pub async fn handle_heartbeat(&self, req: HeartbeatRequest) -> HeartbeatResponse {
        let outcome = self
            .state
            .write()
            .await
            .observe_heartbeat(req.leader_id, &req.leader_address, req.epoch);

        match outcome {
            HeartbeatOutcome::Accepted => {
                *self.last_heartbeat.write().await = Instant::now();
                HeartbeatResponse { success: true }
            }
            HeartbeatOutcome::SteppedDown => {
                tracing::info!(
                    node_id = self.id,
                    leader_id = req.leader_id,
                    epoch = req.epoch,
                    "stepping down to follower"
                );
                *self.last_heartbeat.write().await = Instant::now();
                HeartbeatResponse { success: true }
            }
            HeartbeatOutcome::Stale => {
                tracing::debug!(
                    node_id = self.id,
                    leader_id = req.leader_id,
                    epoch = req.epoch,
                    "ignoring stale heartbeat"
                );
                HeartbeatResponse { success: false }
            }
        }
    }

    /// Incoming election probe. Votes are granted unconditionally; the
    /// protocol is decided by who answers, not by counting.
    pub async fn handle_election(&self, req: ElectionRequest) -> ElectionResponse {
        tracing::info!(
            node_id = self.id,
            candidate = req.candidate_id,
            "election probe received"
        );
        if req.candidate_id < self.id {
            // A better-ranked candidate is live; hold our own candidacy back
            // until its heartbeats arrive.
            *self.last_heartbeat.write().await = Instant::now();
        }
        ElectionResponse { vote_granted: true }
    }

    /// Apply a replicated operation (follower path).
    pub async fn handle_replicate(&self, operation_type: &str, data: &str) -> Result<()> {
        match Operation::from_wire(operation_type, data)? {
            Operation::RiskReport(report) => {
                let appended = self.store.append(report).await?;
                if !appended.inserted {
                    tracing::debug!(node_id = self.id, "duplicate replicated report skipped");
                }
                Ok(())
            }
            Operation::MembershipUpdate {
                replicas,
                leader_address,
            } => {
                tracing::info!(
                    node_id = self.id,
                    members = replicas.len(),
                    leader = %leader_address,
                    "membership updated"
                );
                self.state
                    .write()
                    .await
                    .replace_replicas(replicas, Some(leader_address));
                Ok(())
            }
        }
    }

    /// Leader write path for a client report. Returns whether an alert went
    /// out for it.
    pub async fn submit_report(&self, mut report: RiskReport) -> Result<bool> {
        {
            let state = self.state.read().await;
            if !state.is_leader() {
                return Err(VigilError::NotLeader(state.leader_address.clone()));
            }
        }

        if report.tier == Tier::Green {
            return Err(VigilError::InvalidTier(Tier::Green.to_string()));
        }
        report.validate()?;
        // The alert flag is owned by the committing leader.
        report.alert_sent = false;

        let appended = self.store.append(report.clone()).await?;
        if !appended.inserted {
            // Retried write: already committed and possibly already alerted.
            tracing::debug!(
                node_id = self.id,
                patient_id = %report.patient_id,
                timestamp = report.timestamp,
                "duplicate report, returning committed state"
            );
            return Ok(appended.alert_sent);
        }

        let followers = self.state.read().await.follower_addresses();
        if !followers.is_empty() {
            let acks = self
                .replicate_to_followers(&Operation::RiskReport(report.clone()), &followers)
                .await;
            if acks == 0 {
                tracing::warn!(
                    node_id = self.id,
                    followers = followers.len(),
                    "no follower acknowledged write, relying on local durability"
                );
            }
        }

        let mut alert_sent = false;
        if report.tier == Tier::Red {
            match self.alert_sink.notify(&report).await {
                Ok(()) => {
                    alert_sent = true;
                    if let Err(e) = self.store.mark_alert_sent(appended.local_id).await {
                        tracing::error!(node_id = self.id, error = %e, "failed to record alert flag");
                    }
                }
                Err(e) => {
                    tracing::warn!(node_id = self.id, error = %e, "alert sink rejected notification");
                }
            }
        }

        tracing::info!(
            node_id = self.id,
            patient_id = %report.patient_id,
            tier = %report.tier,
            probability = report.probability,
            alert_sent,
            "risk report committed"
        );
        Ok(alert_sent)
    }

    /// Send `op` to every follower in parallel and return once at least one
    /// has acknowledged (or all have failed). Stragglers keep delivering in
    /// the background.
    pub(super) async fn replicate_to_followers(
        &self,
        op: &Operation,
        followers: &[String],
    ) -> usize {
        let request = match op.to_wire() {
            Ok(request) => request,
            Err(e) => {
                tracing::error!(node_id = self.id, error = %e, "unencodable replication payload");
                return 0;
            }
        };

        let (tx, mut rx) = mpsc::channel(followers.len());
        for addr in followers {
            let addr = addr.clone();
            let client = self.client_for(&addr).await;
            let request = request.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let acked = match client {
                    Ok(mut client) => {
                        match timeout(REPLICATION_DEADLINE, client.replicate_operation(request))
                            .await
                        {
                            Ok(Ok(response)) => response.into_inner().success,
                            Ok(Err(status)) => {
                                tracing::debug!(peer = %addr, error = %status, "replication rejected");
                                false
                            }
                            Err(_) => {
                                tracing::debug!(peer = %addr, "replication timed out");
                                false
                            }
                        }
                    }
                    Err(e) => {
                        tracing::debug!(peer = %addr, error = %e, "replication skipped");
                        false
                    }
                };
                let _ = tx.send(acked).await;
            });
        }
        drop(tx);

        let mut acks = 0;
        while let Some(acked) = rx.recv().await {
            if acked {
                acks += 1;
                break;
            }
        }
        acks
    }

    /// Lazily connected client for a peer, cached per address.
    pub(super) async fn client_for(&self, addr: &str) -> Result<ReplicaClient<Channel>> {
        let mut peers = self.peers.lock().await;
        if let Some(client) = peers.get(addr) {
            return Ok(client.clone());
        }
        let endpoint = Endpoint::from_shared(format!("http://{addr}"))
            .map_err(|_| VigilError::InvalidAddress(addr.to_string()))?;
        let client = ReplicaClient::new(endpoint.connect_lazy());
        peers.insert(addr.to_string(), client.clone());
        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::LogAlertSink;
    use std::path::PathBuf;

    fn node(self_id: u64, replicas: Vec<String>, leader: bool) -> Arc<ReplicaNode> {
        let config = ServerConfig {
            self_id,
            self_host: "127.0.0.1".to_string(),
            self_port: 50050 + self_id as u16,
            initial_replica_addresses: replicas,
            db_path: PathBuf::from(":memory:"),
            heartbeat_interval_s: 0.1,
            lease_timeout_s: 0.3,
            initial_leader: leader,
        };
        let store = Store::open_in_memory().unwrap();
        Arc::new(ReplicaNode::new(config, store, Arc::new(LogAlertSink)))
    }

    fn sample_report(tier: Tier) -> RiskReport {
        RiskReport {
            patient_id: "P1".to_string(),
            timestamp: 1000,
            age: 60.0,
            serum_sodium: 140.0,
            serum_creatinine: 1.1,
            ejection_fraction: 45.0,
            day: 1,
            probability: 0.7,
            tier,
            alert_sent: false,
        }
    }

    #[tokio::test]
    async fn test_follower_rejects_client_write() {
        let node = node(2, Vec::new(), false);
        let err = node.submit_report(sample_report(Tier::Red)).await.unwrap_err();
        assert!(matches!(err, VigilError::NotLeader(_)));
        assert!(node.store().is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_leader_rejects_green_tier() {
        let node = node(1, Vec::new(), true);
        let err = node
            .submit_report(sample_report(Tier::Green))
            .await
            .unwrap_err();
        assert!(matches!(err, VigilError::InvalidTier(_)));
        assert!(node.store().is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_standalone_leader_commits_and_alerts() {
        let node = node(1, Vec::new(), true);
        let alert_sent = node.submit_report(sample_report(Tier::Red)).await.unwrap();
        assert!(alert_sent);

        let rows = node
            .store()
            .list_by_patient("P1".to_string(), 0)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].alert_sent);
    }

    #[tokio::test]
    async fn test_duplicate_submit_alerts_once() {
        let node = node(1, Vec::new(), true);
        let first = node.submit_report(sample_report(Tier::Red)).await.unwrap();
        let second = node.submit_report(sample_report(Tier::Red)).await.unwrap();

        assert!(first);
        // The duplicate reports the committed alert state without re-firing.
        assert!(second);
        assert_eq!(node.store().count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_replicated_report_applies_idempotently() {
        let node = node(2, Vec::new(), false);
        let wire = Operation::RiskReport(sample_report(Tier::Amber))
            .to_wire()
            .unwrap();

        node.handle_replicate(&wire.operation_type, &wire.data)
            .await
            .unwrap();
        node.handle_replicate(&wire.operation_type, &wire.data)
            .await
            .unwrap();

        assert_eq!(node.store().count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_membership_update_replaces_view() {
        let node = node(2, Vec::new(), false);
        let wire = Operation::MembershipUpdate {
            replicas: vec![
                "127.0.0.1:50051".to_string(),
                "127.0.0.1:50052".to_string(),
                "127.0.0.1:50099".to_string(),
            ],
            leader_address: "127.0.0.1:50051".to_string(),
        }
        .to_wire()
        .unwrap();

        node.handle_replicate(&wire.operation_type, &wire.data)
            .await
            .unwrap();

        let state = node.state.read().await;
        assert_eq!(state.replicas.len(), 3);
        assert_eq!(state.leader_address.as_deref(), Some("127.0.0.1:50051"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lone_follower_promotes_itself_after_lease() {
        // No lower-id peers: the election window collapses and the follower
        // assumes leadership as soon as the lease expires.
        let node = node(1, Vec::new(), false);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(node.clone().run(cancel.clone()));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(node.is_leader().await);
        assert_eq!(node.state.read().await.epoch, 1);

        cancel.cancel();
        let _ = handle.await;
    }
}
