//! Daemon configuration.
//!
//! Every fixed value the daemon depends on (device identifiers, link-local
//! literals, pair counts) lives here with a default matching the shipped
//! platform, and can be overridden from a JSON config file.

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

/// Config errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Which packet-forwarding backend the daemon drives.
///
/// Chosen once at construction time; the debug backend records calls without
/// touching hardware so the rest of the daemon can be exercised anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DataplaneKind {
    Ovs,
    Debug,
}

/// Flavor of the port pairs provisioned at Init.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortType {
    Veth,
    Hwlbk,
}

/// Daemon configuration, set once at startup and immutable afterwards.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VspConfig {
    /// PCI vendor of both the host- and DPU-side physical functions.
    pub vendor_id: String,
    /// PCI device id of the accelerator-side physical function.
    pub dpu_device_id: String,
    /// PCI device id of the host-side physical function.
    pub host_device_id: String,
    /// Port the RPC service is reachable on over the comm channel.
    pub default_port: u16,
    /// Port pair flavor.
    pub port_type: PortType,
    /// Number of port pairs provisioned in DPU mode.
    pub port_pairs: u32,
    /// Name of the forwarding domain.
    pub bridge_name: String,
    /// Physical-function count used for VF mapping.
    pub num_pfs: u32,
    /// Physical-function index used for VF mapping.
    pub pf_index: u32,
    /// Attach VFs by PCI devargs instead of kernel interface name.
    pub dpdk_mode: bool,
    /// Fixed link-local address assigned on the accelerator side.
    pub dpu_link_local: String,
    /// Fixed link-local address assigned on the host side.
    pub host_link_local: String,
    /// Forwarding backend.
    pub dataplane: DataplaneKind,
}

impl Default for VspConfig {
    fn default() -> Self {
        Self {
            vendor_id: "177d".to_string(),
            dpu_device_id: "a0f7".to_string(),
            host_device_id: "b900".to_string(),
            default_port: 8085,
            port_type: PortType::Veth,
            port_pairs: 2,
            bridge_name: "br-mrv0".to_string(),
            num_pfs: 1,
            pf_index: 0,
            dpdk_mode: false,
            dpu_link_local: "fe80::1".to_string(),
            host_link_local: "fe80::2".to_string(),
            dataplane: DataplaneKind::Debug,
        }
    }
}

impl VspConfig {
    /// Load configuration from a JSON file. Missing fields fall back to
    /// their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}
