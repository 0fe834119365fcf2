//! Virtual-link pair provisioning.
//!
//! In DPU mode `Init` provisions a fixed number of veth pairs named
//! `nf_interface<i>` / `dp_interface<i>` and records them in the device
//! registry. Teardown deletes whatever the registry still holds and keeps
//! going past individual failures.

use std::sync::Arc;

use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::PortType;
use crate::netdev::{NetOps, NetdevError};
use crate::registry::{DeviceInfo, DeviceRegistry, Health};

/// Provisioning errors.
#[derive(Debug, Error)]
pub enum LinksError {
    #[error(transparent)]
    Netdev(#[from] NetdevError),

    #[error("currently only veth pairs are supported")]
    UnsupportedPortType,

    #[error("cleanup failed: {}", .0.join("; "))]
    Cleanup(Vec<String>),
}

pub type Result<T> = std::result::Result<T, LinksError>;

fn nf_name(index: u32) -> String {
    format!("nf_interface{index}")
}

fn dp_name(index: u32) -> String {
    format!("dp_interface{index}")
}

/// Owns the veth pairs backing the daemon's network-function interfaces.
pub struct PortPairManager {
    ops: Arc<dyn NetOps>,
    registry: Arc<DeviceRegistry>,
    port_type: PortType,
    port_pairs: u32,
}

impl PortPairManager {
    pub fn new(
        ops: Arc<dyn NetOps>,
        registry: Arc<DeviceRegistry>,
        port_type: PortType,
        port_pairs: u32,
    ) -> Self {
        Self {
            ops,
            registry,
            port_type,
            port_pairs,
        }
    }

    /// Provision the configured pairs. If any pair fails, the already
    /// created ones are cleaned up best-effort and the error is returned.
    pub async fn provision(&self) -> Result<()> {
        match self.port_type {
            PortType::Veth => {
                info!(pairs = self.port_pairs, "Creating veth pairs");
                for index in 0..self.port_pairs {
                    if let Err(e) = self.create_pair(index).await {
                        error!(index, error = %e, "Failed to create veth pair");
                        if let Err(cleanup_err) = self.cleanup().await {
                            warn!(error = %cleanup_err, "Rollback after failed provisioning");
                        }
                        return Err(e);
                    }
                }
                Ok(())
            }
            PortType::Hwlbk => {
                warn!("Hardware loopback ports are not implemented");
                Err(LinksError::UnsupportedPortType)
            }
        }
    }

    async fn create_pair(&self, index: u32) -> Result<()> {
        let nf = nf_name(index);
        let dp = dp_name(index);
        self.ops.create_veth(&nf, &dp).await?;

        // From here on the pair exists; drop it again if a later step fails
        // so a retry does not hit a name collision.
        let result = async {
            self.ops.set_link_up(&nf).await?;
            self.ops.set_link_up(&dp).await?;
            self.ops.mac_address(&dp).await
        }
        .await;

        let dp_mac = match result {
            Ok(mac) => mac,
            Err(e) => {
                if let Err(del_err) = self.ops.delete_link(&nf).await {
                    warn!(link = %nf, error = %del_err, "Failed to remove half-configured pair");
                }
                return Err(e.into());
            }
        };

        info!(nf = %nf, dp = %dp, dp_mac = %dp_mac, "Provisioned veth pair");
        self.registry
            .insert(DeviceInfo {
                nf_interface: nf,
                dp_interface: dp,
                dp_mac,
            })
            .await;
        Ok(())
    }

    /// Delete all pairs the registry knows about, aggregating individual
    /// failures instead of stopping at the first one. Idempotent: once the
    /// registry has been drained this does nothing.
    pub async fn cleanup(&self) -> Result<()> {
        let entries = self.registry.take_all().await;
        let mut failures = Vec::new();
        for info in entries {
            match self.ops.delete_link(&info.nf_interface).await {
                Ok(()) => info!(link = %info.nf_interface, "Deleted veth pair"),
                Err(e) => {
                    error!(link = %info.nf_interface, error = %e, "Failed to delete veth pair");
                    failures.push(format!("{}: {e}", info.nf_interface));
                }
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(LinksError::Cleanup(failures))
        }
    }

    /// Current health of a network-function interface.
    pub async fn health(&self, nf_interface: &str) -> Health {
        match self.port_type {
            PortType::Veth => match self.ops.link_is_up(nf_interface).await {
                Ok(true) => Health::Healthy,
                Ok(false) | Err(_) => Health::Unhealthy,
            },
            // Loopback ports have no kernel link to inspect.
            PortType::Hwlbk => Health::Healthy,
        }
    }
}
