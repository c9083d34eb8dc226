//! Per-process wiring: one store, one replica node, one transport binding.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::alert::{AlertSink, LogAlertSink};
use crate::cluster::ReplicaNode;
use crate::config::ServerConfig;
use crate::error::{Result, VigilError};
use crate::grpc::GrpcServer;
use crate::store::Store;

pub struct Node {
    config: ServerConfig,
    replica: Arc<ReplicaNode>,
}

impl Node {
    /// Build a node from config: validates, opens the store, and assembles
    /// the replica core with the default alert sink.
    pub fn new(config: ServerConfig) -> Result<Self> {
        Self::with_alert_sink(config, Arc::new(LogAlertSink))
    }

    pub fn with_alert_sink(config: ServerConfig, alert_sink: Arc<dyn AlertSink>) -> Result<Self> {
        config.validate()?;
        let store = Store::open(&config.db_path)?;
        let replica = Arc::new(ReplicaNode::new(config.clone(), store, alert_sink));
        Ok(Self { config, replica })
    }

    pub fn replica(&self) -> &Arc<ReplicaNode> {
        &self.replica
    }

    /// Run the node until `cancel` fires:
    /// 1. the cluster loop (heartbeats as leader, lease watchdog as follower),
    /// 2. the joiner (state transfer for an empty follower),
    /// 3. the gRPC server (blocking; its exit ends the node).
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let listen_addr: SocketAddr = format!("0.0.0.0:{}", self.config.self_port)
            .parse()
            .map_err(|_| VigilError::InvalidAddress(self.config.self_address()))?;

        tracing::info!(
            node_id = self.config.self_id,
            addr = %listen_addr,
            initial_leader = self.config.initial_leader,
            members = self.config.initial_replicas().len(),
            "starting replica"
        );

        let cluster = self.replica.clone();
        let cluster_cancel = cancel.clone();
        tokio::spawn(async move {
            cluster.run(cluster_cancel).await;
        });

        let joiner = self.replica.clone();
        let joiner_cancel = cancel.clone();
        tokio::spawn(async move {
            joiner.run_joiner(joiner_cancel).await;
        });

        let server = GrpcServer::new(listen_addr, self.replica.clone());
        server.run(cancel).await?;

        tracing::info!(node_id = self.config.self_id, "replica stopped");
        Ok(())
    }
}
