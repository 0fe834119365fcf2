//! The VSP daemon: owns the RPC server, the device registry and the
//! dataplane driver, and implements the start/serve/stop state machine.
//!
//! Shutdown has two independent entry points, the transport loop exiting
//! on its own and an external `stop()`, which converge on a single-slot
//! completion signal. The signal is posted at most once per daemon
//! lifetime; whoever is blocked in `serve()` consumes it, performs the
//! final server shutdown and releases the quiesced gate that `stop()`
//! waits on.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use thiserror::Error;
use tokio::net::UnixListener;
use tokio::sync::{Mutex, Notify, oneshot, watch};
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;
use tracing::{debug, error, info, warn};

use crate::comm::{CommChannelResolver, CommError, Endpoint};
use crate::config::VspConfig;
use crate::dataplane::{self, DataplaneDriver, DataplaneError};
use crate::links::{LinksError, PortPairManager};
use crate::netdev::{IpCommandOps, NetOps};
use crate::platform::{Platform, PlatformError, SysfsPlatform};
use crate::proto::bridge_port_service_server::BridgePortServiceServer;
use crate::proto::device_service_server::DeviceServiceServer;
use crate::proto::life_cycle_service_server::LifeCycleServiceServer;
use crate::proto::network_function_service_server::NetworkFunctionServiceServer;
use crate::registry::{DeviceRegistry, Health, RegistryError};
use crate::service::VspService;
use crate::vf::{VfError, VfMapper};

/// Daemon errors.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error(transparent)]
    Comm(#[from] CommError),

    #[error(transparent)]
    Links(#[from] LinksError),

    #[error(transparent)]
    Dataplane(#[from] DataplaneError),

    #[error(transparent)]
    Vf(#[from] VfError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SetNumVfs is not supported in DPU mode")]
    SetNumVfsInDpuMode,

    #[error("invalid VF count: {0}")]
    InvalidVfCount(i32),

    #[error("PCI address not found")]
    PciAddressNotFound,

    #[error("failed to reset sriov_numvfs to 0: {0}")]
    VfCountReset(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("server already running")]
    AlreadyServed,

    #[error("teardown failed: {}", .0.join("; "))]
    Teardown(Vec<String>),
}

/// Server lifecycle. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    NotStarted,
    Listening,
    Serving,
    Stopping,
    Stopped,
}

pub struct VspDaemon {
    config: VspConfig,
    socket_path: PathBuf,
    registry: Arc<DeviceRegistry>,
    links: PortPairManager,
    driver: Arc<dyn DataplaneDriver>,
    mapper: VfMapper,
    comm: CommChannelResolver,
    platform: Arc<dyn Platform>,
    dpu_mode: AtomicBool,
    state: StdMutex<LifecycleState>,
    /// Serializes driver mutations; the backend gives no reentrancy
    /// guarantees for calls touching the same bridge.
    dp_lock: Mutex<()>,
    done_tx: StdMutex<Option<oneshot::Sender<Option<DaemonError>>>>,
    done_rx: StdMutex<Option<oneshot::Receiver<Option<DaemonError>>>>,
    shutdown: Notify,
    quiesced_tx: watch::Sender<bool>,
    serve_started: AtomicBool,
}

impl VspDaemon {
    /// Construct a daemon wired to the real platform and kernel tooling.
    pub fn new(config: VspConfig, socket_path: PathBuf) -> Arc<Self> {
        let platform: Arc<dyn Platform> = Arc::new(SysfsPlatform::new());
        let ops: Arc<dyn NetOps> = Arc::new(IpCommandOps::new());
        let driver = dataplane::new_driver(config.dataplane);
        Self::with_parts(config, socket_path, platform, ops, driver)
    }

    /// Construct a daemon from explicit parts; used by tests to inject
    /// fakes.
    pub fn with_parts(
        config: VspConfig,
        socket_path: PathBuf,
        platform: Arc<dyn Platform>,
        ops: Arc<dyn NetOps>,
        driver: Arc<dyn DataplaneDriver>,
    ) -> Arc<Self> {
        let registry = Arc::new(DeviceRegistry::new());
        let links = PortPairManager::new(
            ops.clone(),
            registry.clone(),
            config.port_type,
            config.port_pairs,
        );
        let mapper = VfMapper::new(
            platform.clone(),
            config.vendor_id.clone(),
            config.dpu_device_id.clone(),
            config.num_pfs,
            config.pf_index,
            config.dpdk_mode,
        );
        let comm = CommChannelResolver::new(ops, platform.clone(), &config);
        let (done_tx, done_rx) = oneshot::channel();
        let (quiesced_tx, _) = watch::channel(false);
        Arc::new(Self {
            config,
            socket_path,
            registry,
            links,
            driver,
            mapper,
            comm,
            platform,
            dpu_mode: AtomicBool::new(false),
            state: StdMutex::new(LifecycleState::NotStarted),
            dp_lock: Mutex::new(()),
            done_tx: StdMutex::new(Some(done_tx)),
            done_rx: StdMutex::new(Some(done_rx)),
            shutdown: Notify::new(),
            quiesced_tx,
            serve_started: AtomicBool::new(false),
        })
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock().unwrap()
    }

    // ========== Lifecycle ==========

    /// Resolve the comm channel and, in DPU mode, provision local
    /// resources. Returns the endpoint the opposite side must dial.
    pub async fn init(&self, dpu_mode: bool) -> Result<Endpoint, DaemonError> {
        info!(dpu_mode, "Init requested");
        self.dpu_mode.store(dpu_mode, Ordering::SeqCst);

        let endpoint = self.comm.resolve(dpu_mode).await?;

        if dpu_mode {
            self.registry.init_if_absent().await;

            if let Err(e) = self.links.provision().await {
                error!(error = %e, "Failed to provision port pairs");
                self.abort_init().await;
                return Err(e.into());
            }

            let result = {
                let _guard = self.dp_lock.lock().await;
                self.driver
                    .init_dataplane(&self.config.bridge_name)
                    .await
            };
            if let Err(e) = result {
                error!(error = %e, "Failed to initialize dataplane");
                self.abort_init().await;
                return Err(e.into());
            }
        }
        Ok(endpoint)
    }

    /// Internal stop-and-cleanup for `Init` failures. Runs inside an RPC
    /// handler, so it must not wait for the server to quiesce.
    async fn abort_init(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if matches!(*state, LifecycleState::Stopping | LifecycleState::Stopped) {
                return;
            }
            *state = LifecycleState::Stopping;
        }
        let failures = self.teardown_resources().await;
        if !failures.is_empty() {
            warn!(failures = failures.len(), "Teardown errors during init abort");
        }
        self.shutdown.notify_one();
        self.post_completion(None);
    }

    // ========== Bridge ports ==========

    /// Resolve the VF behind a bridge-port name and attach it to the
    /// forwarding domain. Returns the qualified bridge-port name.
    pub async fn create_bridge_port(&self, name: &str) -> Result<String, DaemonError> {
        info!(name = %name, "CreateBridgePort requested");
        let resolved = self.mapper.resolve(name)?;
        {
            let _guard = self.dp_lock.lock().await;
            self.driver
                .add_port(
                    &self.config.bridge_name,
                    &resolved.vf_name,
                    &resolved.pci_address,
                    self.config.dpdk_mode,
                )
                .await?;
        }
        info!(port = %resolved.vf_name, pci = %resolved.pci_address, "Port added to bridge");
        self.log_port_diagnostics().await;
        Ok(format!("bridge_port/{name}"))
    }

    /// Detach the VF behind a bridge-port name from the forwarding domain.
    pub async fn delete_bridge_port(
        &self,
        name: &str,
        allow_missing: bool,
    ) -> Result<(), DaemonError> {
        info!(name = %name, allow_missing, "DeleteBridgePort requested");
        let resolved = match self.mapper.resolve(name) {
            Ok(r) => r,
            Err(VfError::MappedVfNotFound) if allow_missing => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let result = {
            let _guard = self.dp_lock.lock().await;
            self.driver
                .delete_port(&self.config.bridge_name, &resolved.vf_name)
                .await
        };
        match result {
            Ok(()) => {}
            Err(DataplaneError::PortNotAttached { .. }) if allow_missing => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        info!(port = %resolved.vf_name, "Port deleted from bridge");
        self.log_port_diagnostics().await;
        Ok(())
    }

    async fn log_port_diagnostics(&self) {
        match self.driver.read_all_ports(&self.config.bridge_name).await {
            Ok(listing) => {
                debug!(bridge = %self.config.bridge_name, ports = %listing, "Attached ports")
            }
            Err(e) => warn!(error = %e, "Could not read port listing"),
        }
    }

    // ========== Devices ==========

    /// Snapshot of provisioned interfaces with freshly computed health.
    pub async fn get_devices(&self) -> Result<Vec<(String, Health)>, DaemonError> {
        let entries = self.registry.snapshot().await?;
        let mut devices = Vec::with_capacity(entries.len());
        for info in entries {
            let health = self.links.health(&info.nf_interface).await;
            devices.push((info.nf_interface, health));
        }
        Ok(devices)
    }

    /// Program the host PF's virtual-function count. Host mode only.
    pub async fn set_num_vfs(&self, count: i32) -> Result<i32, DaemonError> {
        info!(count, "SetNumVfs requested");
        if self.dpu_mode.load(Ordering::SeqCst) {
            return Err(DaemonError::SetNumVfsInDpuMode);
        }
        if count < 0 {
            return Err(DaemonError::InvalidVfCount(count));
        }
        let pci = self
            .platform
            .pci_by_device_id(&self.config.vendor_id, &self.config.host_device_id)
            .map_err(|_| DaemonError::PciAddressNotFound)?;
        if pci.is_empty() {
            return Err(DaemonError::PciAddressNotFound);
        }
        // sriov_numvfs only accepts transitions from zero, so reset first.
        self.platform
            .set_sriov_numvfs(&pci, 0)
            .map_err(|e| DaemonError::VfCountReset(e.to_string()))?;
        self.platform.set_sriov_numvfs(&pci, count as u32)?;
        Ok(count)
    }

    // ========== Serving ==========

    /// Bind the RPC socket.
    pub async fn listen(&self) -> Result<UnixListener, DaemonError> {
        if let Some(dir) = self.socket_path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        match tokio::fs::remove_file(&self.socket_path).await {
            Ok(()) => warn!(path = %self.socket_path.display(), "Removed stale socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let listener = UnixListener::bind(&self.socket_path)?;
        *self.state.lock().unwrap() = LifecycleState::Listening;
        info!(path = %self.socket_path.display(), "Listening on vendor plugin socket");
        Ok(listener)
    }

    /// Run the RPC transport until it exits or an external stop fires,
    /// then perform the final server shutdown. Blocks the calling task.
    pub async fn serve(self: Arc<Self>, listener: UnixListener) -> Result<(), DaemonError> {
        let done_rx = self
            .done_rx
            .lock()
            .unwrap()
            .take()
            .ok_or(DaemonError::AlreadyServed)?;
        self.serve_started.store(true, Ordering::SeqCst);

        let incoming = UnixListenerStream::new(listener);
        let shutdown = {
            let daemon = self.clone();
            async move { daemon.shutdown.notified().await }
        };
        let service = VspService::new(self.clone());
        let server = Server::builder()
            .add_service(LifeCycleServiceServer::new(service.clone()))
            .add_service(DeviceServiceServer::new(service.clone()))
            .add_service(NetworkFunctionServiceServer::new(service.clone()))
            .add_service(BridgePortServiceServer::new(service))
            .serve_with_incoming_shutdown(incoming, shutdown);

        *self.state.lock().unwrap() = LifecycleState::Serving;
        info!(version = env!("CARGO_PKG_VERSION"), "VSP server serving");

        let daemon = self.clone();
        let transport = tokio::spawn(async move {
            let outcome = match server.await {
                Ok(()) => None,
                Err(e) => Some(DaemonError::Transport(e.to_string())),
            };
            daemon.post_completion(outcome);
        });

        // Block until the transport loop reports its outcome or an
        // external stop posts one.
        let outcome = done_rx.await.unwrap_or(None);

        // Final server shutdown; harmless if the transport already exited.
        self.shutdown.notify_one();
        let _ = transport.await;

        *self.state.lock().unwrap() = LifecycleState::Stopped;
        let _ = self.quiesced_tx.send(true);
        info!("VSP server stopped");

        match outcome {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// External stop: tear down all provisioned resources, stop the RPC
    /// server and wait for the daemon to fully quiesce. Safe to call
    /// whether or not the server ever reached `Serving`, and safe to call
    /// more than once.
    pub async fn stop(&self) -> Result<(), DaemonError> {
        let proceed = {
            let mut state = self.state.lock().unwrap();
            match *state {
                LifecycleState::Stopped => return Ok(()),
                LifecycleState::Stopping => false,
                _ => {
                    *state = LifecycleState::Stopping;
                    true
                }
            }
        };

        let mut failures = Vec::new();
        if proceed {
            failures = self.teardown_resources().await;
            self.shutdown.notify_one();
            self.post_completion(None);
        }

        if self.serve_started.load(Ordering::SeqCst) {
            // The serve waiter owns the final shutdown; wait until it has
            // released the gate.
            let mut quiesced = self.quiesced_tx.subscribe();
            while !*quiesced.borrow_and_update() {
                if quiesced.changed().await.is_err() {
                    break;
                }
            }
        } else {
            *self.state.lock().unwrap() = LifecycleState::Stopped;
            let _ = self.quiesced_tx.send(true);
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(DaemonError::Teardown(failures))
        }
    }

    /// Tear down the forwarding domain, then the virtual-link pairs.
    /// Collects failures instead of short-circuiting.
    async fn teardown_resources(&self) -> Vec<String> {
        let mut failures = Vec::new();
        {
            let _guard = self.dp_lock.lock().await;
            if let Err(e) = self.driver.delete_dataplane(&self.config.bridge_name).await {
                error!(error = %e, "Failed to delete dataplane");
                failures.push(e.to_string());
            }
        }
        if let Err(e) = self.links.cleanup().await {
            error!(error = %e, "Failed to clean up veth pairs");
            failures.push(e.to_string());
        }
        failures
    }

    /// Post the completion outcome. The slot holds exactly one value per
    /// daemon lifetime; later posts are dropped.
    fn post_completion(&self, outcome: Option<DaemonError>) {
        match self.done_tx.lock().unwrap().take() {
            Some(tx) => {
                let _ = tx.send(outcome);
            }
            None => debug!("Completion already posted"),
        }
    }
}
