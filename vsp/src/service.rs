//! gRPC surface: one service struct implementing all four RPC contracts,
//! delegating to [`VspDaemon`] and mapping daemon errors to RPC status
//! codes.

use std::collections::HashMap;
use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::info;

use crate::daemon::{DaemonError, VspDaemon};
use crate::dataplane::DataplaneError;
use crate::proto::bridge_port_service_server::BridgePortService;
use crate::proto::device_service_server::DeviceService;
use crate::proto::life_cycle_service_server::LifeCycleService;
use crate::proto::network_function_service_server::NetworkFunctionService;
use crate::proto::{
    BridgePort, BridgePortStatus, CreateBridgePortRequest, DeleteBridgePortRequest, Device,
    DeviceListResponse, Empty, InitRequest, IpPort, NfRequest, VfCount,
};
use crate::registry::RegistryError;
use crate::vf::VfError;

#[derive(Clone)]
pub struct VspService {
    daemon: Arc<VspDaemon>,
}

impl VspService {
    pub fn new(daemon: Arc<VspDaemon>) -> Self {
        Self { daemon }
    }
}

fn err_to_status(err: DaemonError) -> Status {
    match &err {
        DaemonError::Vf(VfError::NoMatch(_)) => Status::invalid_argument(err.to_string()),
        DaemonError::Vf(VfError::MappedVfNotFound) => Status::not_found(err.to_string()),
        DaemonError::Registry(RegistryError::DeviceStoreEmpty) => {
            Status::failed_precondition(err.to_string())
        }
        DaemonError::Dataplane(
            DataplaneError::BridgeNotFound(_) | DataplaneError::PortNotAttached { .. },
        ) => Status::not_found(err.to_string()),
        DaemonError::SetNumVfsInDpuMode => Status::failed_precondition(err.to_string()),
        DaemonError::InvalidVfCount(_) => Status::invalid_argument(err.to_string()),
        DaemonError::PciAddressNotFound => Status::not_found(err.to_string()),
        _ => Status::internal(err.to_string()),
    }
}

#[tonic::async_trait]
impl LifeCycleService for VspService {
    async fn init(&self, request: Request<InitRequest>) -> Result<Response<IpPort>, Status> {
        let req = request.into_inner();
        let endpoint = self
            .daemon
            .init(req.dpu_mode)
            .await
            .map_err(err_to_status)?;
        Ok(Response::new(IpPort {
            ip: endpoint.ip,
            port: i32::from(endpoint.port),
        }))
    }
}

#[tonic::async_trait]
impl DeviceService for VspService {
    async fn get_devices(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<DeviceListResponse>, Status> {
        let devices = self.daemon.get_devices().await.map_err(err_to_status)?;
        let devices: HashMap<String, Device> = devices
            .into_iter()
            .map(|(id, health)| {
                let device = Device {
                    id: id.clone(),
                    health: health.as_str().to_string(),
                };
                (id, device)
            })
            .collect();
        Ok(Response::new(DeviceListResponse { devices }))
    }

    async fn set_num_vfs(&self, request: Request<VfCount>) -> Result<Response<VfCount>, Status> {
        let req = request.into_inner();
        let vf_cnt = self
            .daemon
            .set_num_vfs(req.vf_cnt)
            .await
            .map_err(err_to_status)?;
        Ok(Response::new(VfCount { vf_cnt }))
    }
}

#[tonic::async_trait]
impl NetworkFunctionService for VspService {
    async fn create_network_function(
        &self,
        request: Request<NfRequest>,
    ) -> Result<Response<Empty>, Status> {
        let req = request.into_inner();
        info!(input = %req.input, output = %req.output, "CreateNetworkFunction");
        Ok(Response::new(Empty {}))
    }

    async fn delete_network_function(
        &self,
        request: Request<NfRequest>,
    ) -> Result<Response<Empty>, Status> {
        let req = request.into_inner();
        info!(input = %req.input, output = %req.output, "DeleteNetworkFunction");
        Ok(Response::new(Empty {}))
    }
}

#[tonic::async_trait]
impl BridgePortService for VspService {
    async fn create_bridge_port(
        &self,
        request: Request<CreateBridgePortRequest>,
    ) -> Result<Response<BridgePort>, Status> {
        let bridge_port = request
            .into_inner()
            .bridge_port
            .ok_or_else(|| Status::invalid_argument("bridge_port is required"))?;
        let name = self
            .daemon
            .create_bridge_port(&bridge_port.name)
            .await
            .map_err(err_to_status)?;
        Ok(Response::new(BridgePort {
            name,
            spec: bridge_port.spec,
            status: Some(BridgePortStatus::default()),
        }))
    }

    async fn delete_bridge_port(
        &self,
        request: Request<DeleteBridgePortRequest>,
    ) -> Result<Response<Empty>, Status> {
        let req = request.into_inner();
        self.daemon
            .delete_bridge_port(&req.name, req.allow_missing)
            .await
            .map_err(err_to_status)?;
        Ok(Response::new(Empty {}))
    }
}
