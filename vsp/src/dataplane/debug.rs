//! Debug backend: records calls in memory and enforces the same error
//! contract as the real driver, so the daemon can be exercised end to end
//! without a forwarding engine.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::info;

use super::{DataplaneDriver, DataplaneError, Result};

pub struct DebugDriver {
    bridges: Mutex<HashMap<String, Vec<String>>>,
}

impl DebugDriver {
    pub fn new() -> Self {
        Self {
            bridges: Mutex::new(HashMap::new()),
        }
    }

    /// Ports currently attached to a bridge, or `None` if the bridge does
    /// not exist. Inspection hook for tests and diagnostics.
    pub fn ports(&self, bridge: &str) -> Option<Vec<String>> {
        self.bridges.lock().unwrap().get(bridge).cloned()
    }
}

impl Default for DebugDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DataplaneDriver for DebugDriver {
    async fn init_dataplane(&self, bridge: &str) -> Result<()> {
        let mut bridges = self.bridges.lock().unwrap();
        bridges.entry(bridge.to_string()).or_default();
        info!(bridge = %bridge, "debug-dp: init dataplane");
        Ok(())
    }

    async fn add_port(&self, bridge: &str, port: &str, vf_pci: &str, dpdk: bool) -> Result<()> {
        let mut bridges = self.bridges.lock().unwrap();
        let ports = bridges
            .get_mut(bridge)
            .ok_or_else(|| DataplaneError::BridgeNotFound(bridge.to_string()))?;
        ports.push(port.to_string());
        info!(bridge = %bridge, port = %port, vf_pci = %vf_pci, dpdk, "debug-dp: add port");
        Ok(())
    }

    async fn delete_port(&self, bridge: &str, port: &str) -> Result<()> {
        let mut bridges = self.bridges.lock().unwrap();
        let ports = bridges
            .get_mut(bridge)
            .ok_or_else(|| DataplaneError::BridgeNotFound(bridge.to_string()))?;
        let index =
            ports
                .iter()
                .position(|p| p == port)
                .ok_or_else(|| DataplaneError::PortNotAttached {
                    bridge: bridge.to_string(),
                    port: port.to_string(),
                })?;
        ports.remove(index);
        info!(bridge = %bridge, port = %port, "debug-dp: delete port");
        Ok(())
    }

    async fn read_all_ports(&self, bridge: &str) -> Result<String> {
        let bridges = self.bridges.lock().unwrap();
        let ports = bridges
            .get(bridge)
            .ok_or_else(|| DataplaneError::BridgeNotFound(bridge.to_string()))?;
        Ok(ports.join("\n"))
    }

    async fn delete_dataplane(&self, bridge: &str) -> Result<()> {
        self.bridges.lock().unwrap().remove(bridge);
        info!(bridge = %bridge, "debug-dp: delete dataplane");
        Ok(())
    }
}
