//! OVS backend driven through `ovs-vsctl`.

use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use super::{DataplaneDriver, DataplaneError, Result};

/// Upper bound for any single `ovs-vsctl` invocation.
const OVS_TIMEOUT: Duration = Duration::from_secs(15);

pub struct OvsDriver;

impl OvsDriver {
    pub fn new() -> Self {
        Self
    }

    async fn vsctl(&self, args: &[&str]) -> Result<String> {
        let rendered = format!("ovs-vsctl {}", args.join(" "));
        debug!(command = %rendered, "Running");
        let fut = Command::new("ovs-vsctl").args(args).output();
        let output = tokio::time::timeout(OVS_TIMEOUT, fut)
            .await
            .map_err(|_| DataplaneError::Backend {
                operation: rendered.clone(),
                message: "timed out".to_string(),
            })??;
        if !output.status.success() {
            return Err(DataplaneError::Backend {
                operation: rendered,
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

impl Default for OvsDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DataplaneDriver for OvsDriver {
    async fn init_dataplane(&self, bridge: &str) -> Result<()> {
        self.vsctl(&["--may-exist", "add-br", bridge]).await?;
        info!(bridge = %bridge, "Initialized OVS bridge");
        Ok(())
    }

    async fn add_port(&self, bridge: &str, port: &str, vf_pci: &str, dpdk: bool) -> Result<()> {
        if dpdk {
            let devargs = format!("options:dpdk-devargs={vf_pci}");
            self.vsctl(&[
                "add-port", bridge, port, "--", "set", "Interface", port, "type=dpdk", &devargs,
            ])
            .await?;
        } else {
            self.vsctl(&["add-port", bridge, port]).await?;
        }
        info!(bridge = %bridge, port = %port, dpdk, "Added port to OVS bridge");
        Ok(())
    }

    async fn delete_port(&self, bridge: &str, port: &str) -> Result<()> {
        self.vsctl(&["del-port", bridge, port]).await?;
        info!(bridge = %bridge, port = %port, "Deleted port from OVS bridge");
        Ok(())
    }

    async fn read_all_ports(&self, bridge: &str) -> Result<String> {
        self.vsctl(&["list-ports", bridge]).await
    }

    async fn delete_dataplane(&self, bridge: &str) -> Result<()> {
        self.vsctl(&["--if-exists", "del-br", bridge]).await?;
        info!(bridge = %bridge, "Deleted OVS bridge");
        Ok(())
    }
}
