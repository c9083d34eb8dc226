use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tonic::transport::Server;

use crate::cluster::ReplicaNode;
use crate::grpc::monitor_service::MonitorService;
use crate::grpc::replica_service::ReplicaService;
use crate::proto::monitor_server::MonitorServer;
use crate::proto::replica_server::ReplicaServer;

pub struct GrpcServer {
    addr: SocketAddr,
    node: Arc<ReplicaNode>,
}

impl GrpcServer {
    pub fn new(addr: SocketAddr, node: Arc<ReplicaNode>) -> Self {
        Self { addr, node }
    }

    pub async fn run(self, cancel: CancellationToken) -> Result<(), tonic::transport::Error> {
        let monitor_service = MonitorService::new(self.node.clone());
        let replica_service = ReplicaService::new(self.node.clone());

        tracing::info!(addr = %self.addr, "starting gRPC server");

        Server::builder()
            .add_service(MonitorServer::new(monitor_service))
            .add_service(ReplicaServer::new(replica_service))
            .serve_with_shutdown(self.addr, cancel.cancelled_owned())
            .await
    }
}
