use std::sync::Arc;

use ravel_consensus::ConsensusEngine;
use ravel_proto::v1::{
    admin_service_server::AdminService, AddVoterRequest, AddVoterResponse, ClusterStatusRequest,
    ClusterStatusResponse, RemoveServerRequest, RemoveServerResponse, ResponseHeader,
    SnapshotRequest, SnapshotResponse,
};
use ravel_storage::StateMachine;
use tonic::{Request, Response, Status};

use crate::convert::{header, members_to_proto, ravel_to_status};
use crate::gateway::Gateway;

pub struct AdminServiceImpl<E> {
    gateway: Arc<Gateway<E>>,
}

impl<E: ConsensusEngine> AdminServiceImpl<E> {
    pub fn new(gateway: Arc<Gateway<E>>) -> Self {
        AdminServiceImpl { gateway }
    }

    async fn header(&self) -> ResponseHeader {
        let node_id = self.gateway.engine().status().node_id;
        header(&node_id, self.gateway.state_machine().last_applied().await)
    }
}

#[tonic::async_trait]
impl<E: ConsensusEngine> AdminService for AdminServiceImpl<E> {
    async fn add_voter(
        &self,
        request: Request<AddVoterRequest>,
    ) -> Result<Response<AddVoterResponse>, Status> {
        let req = request.into_inner();
        tracing::info!(id = %req.id, address = %req.address, "add voter requested");
        let index = self
            .gateway
            .handle_add_voter(req.id, req.address)
            .await
            .map_err(ravel_to_status)?;
        Ok(Response::new(AddVoterResponse { header: Some(self.header().await), index }))
    }

    async fn remove_server(
        &self,
        request: Request<RemoveServerRequest>,
    ) -> Result<Response<RemoveServerResponse>, Status> {
        let req = request.into_inner();
        tracing::info!(id = %req.id, "remove server requested");
        let index = self.gateway.handle_remove_server(req.id).await.map_err(ravel_to_status)?;
        Ok(Response::new(RemoveServerResponse { header: Some(self.header().await), index }))
    }

    async fn snapshot(
        &self,
        _request: Request<SnapshotRequest>,
    ) -> Result<Response<SnapshotResponse>, Status> {
        let meta = self.gateway.handle_snapshot_trigger().await.map_err(ravel_to_status)?;
        Ok(Response::new(SnapshotResponse {
            header: Some(self.header().await),
            snapshot_id: meta.snapshot_id,
            last_log_index: meta.last_log_index,
            last_log_term: meta.last_log_term,
        }))
    }

    async fn cluster_status(
        &self,
        _request: Request<ClusterStatusRequest>,
    ) -> Result<Response<ClusterStatusResponse>, Status> {
        let status = self.gateway.engine().status();
        let fsm = self.gateway.state_machine();
        Ok(Response::new(ClusterStatusResponse {
            header: Some(header(&status.node_id, fsm.last_applied().await)),
            role: status.role.as_str().to_string(),
            leader_hint: status.role.leader_hint().unwrap_or_default().to_string(),
            term: status.term,
            last_log_index: status.last_log_index,
            last_snapshot_index: status.last_snapshot_index,
            members: members_to_proto(&status.membership),
            skipped_entries: fsm.skipped_entries(),
            halted: fsm.is_halted(),
        }))
    }
}
