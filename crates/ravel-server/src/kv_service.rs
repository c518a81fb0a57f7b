use std::sync::Arc;

use ravel_consensus::ConsensusEngine;
use ravel_proto::v1::{
    kv_service_server::KvService, DeleteRequest, DeleteResponse, GetRequest, GetResponse,
    PutRequest, PutResponse, ResponseHeader,
};
use tonic::{Request, Response, Status};

use crate::convert::{header, ravel_to_status};
use crate::gateway::Gateway;

pub struct KvServiceImpl<E> {
    gateway: Arc<Gateway<E>>,
}

impl<E: ConsensusEngine> KvServiceImpl<E> {
    pub fn new(gateway: Arc<Gateway<E>>) -> Self {
        KvServiceImpl { gateway }
    }

    async fn header(&self) -> ResponseHeader {
        let node_id = self.gateway.engine().status().node_id;
        header(&node_id, self.gateway.state_machine().last_applied().await)
    }
}

#[tonic::async_trait]
impl<E: ConsensusEngine> KvService for KvServiceImpl<E> {
    async fn get(&self, request: Request<GetRequest>) -> Result<Response<GetResponse>, Status> {
        let req = request.into_inner();
        let value = self.gateway.handle_get(&req.key).await.map_err(ravel_to_status)?;

        match value {
            None => Err(Status::not_found(format!("key '{}' not found", req.key))),
            Some(value) => Ok(Response::new(GetResponse {
                header: Some(self.header().await),
                value,
            })),
        }
    }

    async fn put(&self, request: Request<PutRequest>) -> Result<Response<PutResponse>, Status> {
        let req = request.into_inner();
        let index = self
            .gateway
            .handle_set(req.key, req.value)
            .await
            .map_err(ravel_to_status)?;
        Ok(Response::new(PutResponse { header: Some(self.header().await), index }))
    }

    async fn delete(
        &self,
        request: Request<DeleteRequest>,
    ) -> Result<Response<DeleteResponse>, Status> {
        let req = request.into_inner();
        let index = self.gateway.handle_delete(req.key).await.map_err(ravel_to_status)?;
        Ok(Response::new(DeleteResponse { header: Some(self.header().await), index }))
    }
}
