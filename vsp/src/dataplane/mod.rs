//! Pluggable packet-forwarding backend.
//!
//! The daemon never talks to the forwarding engine directly; everything
//! goes through [`DataplaneDriver`]. Two backends exist: the real OVS
//! driver and a debug driver that records calls in memory so the daemon
//! can run without hardware.

pub mod debug;
pub mod ovs;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

use crate::config::DataplaneKind;

pub use debug::DebugDriver;
pub use ovs::OvsDriver;

/// Driver errors.
#[derive(Debug, Error)]
pub enum DataplaneError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("dataplane backend failed during {operation}: {message}")]
    Backend { operation: String, message: String },

    #[error("bridge not found: {0}")]
    BridgeNotFound(String),

    #[error("port {port} not attached to bridge {bridge}")]
    PortNotAttached { bridge: String, port: String },
}

pub type Result<T> = std::result::Result<T, DataplaneError>;

/// Contract implemented identically by every backend.
#[async_trait]
pub trait DataplaneDriver: Send + Sync {
    /// Idempotently create the named forwarding domain.
    async fn init_dataplane(&self, bridge: &str) -> Result<()>;

    /// Attach a resolved VF to the domain; by interface name, or by PCI
    /// devargs when `dpdk` is set.
    async fn add_port(&self, bridge: &str, port: &str, vf_pci: &str, dpdk: bool) -> Result<()>;

    /// Detach a port; fails if it is not attached.
    async fn delete_port(&self, bridge: &str, port: &str) -> Result<()>;

    /// Backend-defined listing of attached ports, for diagnostics.
    async fn read_all_ports(&self, bridge: &str) -> Result<String>;

    /// Idempotently tear down the domain.
    async fn delete_dataplane(&self, bridge: &str) -> Result<()>;
}

/// Construct the configured backend.
pub fn new_driver(kind: DataplaneKind) -> Arc<dyn DataplaneDriver> {
    match kind {
        DataplaneKind::Ovs => Arc::new(OvsDriver::new()),
        DataplaneKind::Debug => Arc::new(DebugDriver::new()),
    }
}
