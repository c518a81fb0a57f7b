mod admin_service;
mod convert;
mod gateway;
mod kv_service;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use ravel_consensus::ConsensusEngine;
use ravel_proto::v1::{admin_service_server::AdminServiceServer, kv_service_server::KvServiceServer};
use tonic_reflection::server::Builder as ReflectionBuilder;

use admin_service::AdminServiceImpl;
use kv_service::KvServiceImpl;

pub use convert::LEADER_ADDR_KEY;
pub use gateway::{Gateway, GatewayConfig};

/// Serve `KvService` until `shutdown` resolves.
pub async fn serve_client<E: ConsensusEngine>(
    addr: SocketAddr,
    gateway: Arc<Gateway<E>>,
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<()> {
    let reflection = ReflectionBuilder::configure()
        .register_encoded_file_descriptor_set(ravel_proto::FILE_DESCRIPTOR_SET)
        .build_v1()?;
    tracing::info!(%addr, "client gRPC server starting");
    tonic::transport::Server::builder()
        .add_service(KvServiceServer::new(KvServiceImpl::new(gateway)))
        .add_service(reflection)
        .serve_with_shutdown(addr, shutdown)
        .await
        .map_err(Into::into)
}

/// Serve the operator-facing `AdminService` until `shutdown` resolves.
pub async fn serve_cluster<E: ConsensusEngine>(
    addr: SocketAddr,
    gateway: Arc<Gateway<E>>,
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<()> {
    let reflection = ReflectionBuilder::configure()
        .register_encoded_file_descriptor_set(ravel_proto::FILE_DESCRIPTOR_SET)
        .build_v1()?;
    tracing::info!(%addr, "cluster gRPC server starting");
    tonic::transport::Server::builder()
        .add_service(AdminServiceServer::new(AdminServiceImpl::new(gateway)))
        .add_service(reflection)
        .serve_with_shutdown(addr, shutdown)
        .await
        .map_err(Into::into)
}
