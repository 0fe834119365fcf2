//! Bridge-port name parsing and virtual-function resolution.
//!
//! Bridge-port names carry the hardware coordinates of the VF they attach:
//! `host<N>-<M>` where `N` is the host (PF) index and `M` the VF index.
//! The name is the only persistent identity of a bridge port; both create
//! and delete re-derive the VF from it.

use std::str::FromStr;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::platform::{Platform, PlatformError};

/// VF resolution errors.
#[derive(Debug, Error)]
pub enum VfError {
    #[error("no VF match found in bridge port name {0:?}")]
    NoMatch(String),

    #[error("mapped VF not found")]
    MappedVfNotFound,

    #[error(transparent)]
    Platform(#[from] PlatformError),
}

pub type Result<T> = std::result::Result<T, VfError>;

/// Parsed bridge-port name: `host<N>-<M>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgePortName {
    pub host: u32,
    pub vf: u32,
}

impl FromStr for BridgePortName {
    type Err = VfError;

    fn from_str(s: &str) -> Result<Self> {
        let no_match = || VfError::NoMatch(s.to_string());
        let rest = s.strip_prefix("host").ok_or_else(no_match)?;
        let (host, vf) = rest.split_once('-').ok_or_else(no_match)?;
        Ok(Self {
            host: host.parse().map_err(|_| no_match())?,
            vf: vf.parse().map_err(|_| no_match())?,
        })
    }
}

/// A VF resolved from a bridge-port name.
#[derive(Debug, Clone)]
pub struct ResolvedVf {
    /// Kernel interface name, or DPDK-style identifier in dpdk mode.
    pub vf_name: String,
    pub pci_address: String,
}

/// Maps bridge-port names to physical VF resources.
pub struct VfMapper {
    platform: Arc<dyn Platform>,
    vendor_id: String,
    device_id: String,
    num_pfs: u32,
    pf_index: u32,
    dpdk_mode: bool,
}

impl VfMapper {
    pub fn new(
        platform: Arc<dyn Platform>,
        vendor_id: String,
        device_id: String,
        num_pfs: u32,
        pf_index: u32,
        dpdk_mode: bool,
    ) -> Self {
        Self {
            platform,
            vendor_id,
            device_id,
            num_pfs,
            pf_index,
            dpdk_mode,
        }
    }

    /// Resolve a bridge-port name to a VF interface name and PCI address.
    pub fn resolve(&self, bridge_port_name: &str) -> Result<ResolvedVf> {
        let name: BridgePortName = bridge_port_name.parse()?;
        debug!(
            pf = name.host,
            vf = name.vf,
            num_pfs = self.num_pfs,
            "Mapping VF"
        );

        let pf_pci = self
            .platform
            .pci_by_device_id(&self.vendor_id, &self.device_id)?;
        let pci_address = self
            .platform
            .vf_pci_address(&pf_pci, self.pf_index + name.vf * self.num_pfs)
            .map_err(|_| VfError::MappedVfNotFound)?;
        if pci_address.is_empty() {
            return Err(VfError::MappedVfNotFound);
        }

        let vf_name = if self.dpdk_mode {
            format!("vf{}-{}", name.host, name.vf)
        } else {
            self.platform.netdev_for_pci(&pci_address)?
        };
        debug!(vf_name = %vf_name, pci = %pci_address, "Resolved VF");
        Ok(ResolvedVf {
            vf_name,
            pci_address,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::FakePlatform;

    fn mapper(platform: Arc<FakePlatform>, dpdk: bool) -> VfMapper {
        VfMapper::new(
            platform,
            "177d".to_string(),
            "a0f7".to_string(),
            1,
            0,
            dpdk,
        )
    }

    #[test]
    fn parses_host_and_vf_indices() {
        let name: BridgePortName = "host0-1".parse().unwrap();
        assert_eq!(name, BridgePortName { host: 0, vf: 1 });

        let name: BridgePortName = "host12-34".parse().unwrap();
        assert_eq!(name, BridgePortName { host: 12, vf: 34 });
    }

    #[test]
    fn rejects_malformed_names() {
        for bad in ["", "host1", "host-1", "hosta-1", "host1-b", "guest1-2"] {
            assert!(
                matches!(bad.parse::<BridgePortName>(), Err(VfError::NoMatch(_))),
                "{bad:?} should not parse"
            );
        }
    }

    #[test]
    fn resolves_kernel_interface_name() {
        let platform = Arc::new(FakePlatform::new());
        platform.add_device("177d", "a0f7", "0000:01:00.0");
        platform.add_virtfn("0000:01:00.0", 1, "0000:01:02.1");
        platform.add_netdev("0000:01:02.1", "eth_vf1");

        let resolved = mapper(platform, false).resolve("host0-1").unwrap();
        assert_eq!(resolved.vf_name, "eth_vf1");
        assert_eq!(resolved.pci_address, "0000:01:02.1");
    }

    #[test]
    fn resolves_dpdk_identifier() {
        let platform = Arc::new(FakePlatform::new());
        platform.add_device("177d", "a0f7", "0000:01:00.0");
        platform.add_virtfn("0000:01:00.0", 1, "0000:01:02.1");

        let resolved = mapper(platform, true).resolve("host0-1").unwrap();
        assert_eq!(resolved.vf_name, "vf0-1");
    }

    #[test]
    fn missing_virtfn_is_mapped_vf_not_found() {
        let platform = Arc::new(FakePlatform::new());
        platform.add_device("177d", "a0f7", "0000:01:00.0");

        assert!(matches!(
            mapper(platform, false).resolve("host0-1"),
            Err(VfError::MappedVfNotFound)
        ));
    }
}
