//! Intra-cluster API: thin handlers delegating to the replica node.

use std::sync::Arc;

use tonic::{Request, Response, Status};

use crate::cluster::ReplicaNode;
use crate::error::VigilError;
use crate::proto::replica_server::Replica;
use crate::proto::{
    ElectionRequest, ElectionResponse, HeartbeatRequest, HeartbeatResponse, JoinClusterRequest,
    JoinClusterResponse, ReplicateOperationRequest, ReplicateOperationResponse,
};

pub struct ReplicaService {
    node: Arc<ReplicaNode>,
}

impl ReplicaService {
    pub fn new(node: Arc<ReplicaNode>) -> Self {
        Self { node }
    }
}

#[tonic::async_trait]
impl Replica for ReplicaService {
    async fn heartbeat(
        &self,
        request: Request<HeartbeatRequest>,
    ) -> Result<Response<HeartbeatResponse>, Status> {
        let response = self.node.handle_heartbeat(request.into_inner()).await;
        Ok(Response::new(response))
    }

    async fn election(
        &self,
        request: Request<ElectionRequest>,
    ) -> Result<Response<ElectionResponse>, Status> {
        let response = self.node.handle_election(request.into_inner()).await;
        Ok(Response::new(response))
    }

    async fn replicate_operation(
        &self,
        request: Request<ReplicateOperationRequest>,
    ) -> Result<Response<ReplicateOperationResponse>, Status> {
        let req = request.into_inner();
        match self
            .node
            .handle_replicate(&req.operation_type, &req.data)
            .await
        {
            Ok(()) => Ok(Response::new(ReplicateOperationResponse {
                success: true,
                message: String::new(),
            })),
            Err(e @ VigilError::MalformedInput(_)) => {
                // A bad payload will never apply; tell the leader not to retry.
                Err(Status::invalid_argument(e.to_string()))
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to apply replicated operation");
                Ok(Response::new(ReplicateOperationResponse {
                    success: false,
                    message: e.to_string(),
                }))
            }
        }
    }

    async fn join_cluster(
        &self,
        request: Request<JoinClusterRequest>,
    ) -> Result<Response<JoinClusterResponse>, Status> {
        let req = request.into_inner();
        if req.new_address.is_empty() {
            return Err(Status::invalid_argument("new_address is required"));
        }

        match self.node.handle_join(req.new_address).await {
            Ok(state) => Ok(Response::new(JoinClusterResponse {
                success: true,
                message: String::new(),
                state,
            })),
            Err(e @ VigilError::NotLeader(_)) => Ok(Response::new(JoinClusterResponse {
                success: false,
                message: e.to_string(),
                state: String::new(),
            })),
            Err(e) => {
                tracing::error!(error = %e, "join failed");
                Ok(Response::new(JoinClusterResponse {
                    success: false,
                    message: e.to_string(),
                    state: String::new(),
                }))
            }
        }
    }
}
