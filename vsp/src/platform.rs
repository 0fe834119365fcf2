//! PCI device enumeration and SR-IOV control via sysfs.
//!
//! The daemon resolves its physical functions by a fixed vendor/device
//! identifier pair and maps virtual functions through the `virtfn<N>`
//! symlinks the kernel exposes per PF. Everything goes through the
//! [`Platform`] trait so policy checks can be tested without `/sys`.

use std::path::PathBuf;

use thiserror::Error;
use tracing::debug;

/// Platform errors.
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no PCI device found for {vendor}:{device}")]
    DeviceNotFound { vendor: String, device: String },

    #[error("no network interface for PCI device {0}")]
    NoNetdev(String),

    #[error("no virtual function {index} under PCI device {pci}")]
    VirtfnMissing { pci: String, index: u32 },
}

pub type Result<T> = std::result::Result<T, PlatformError>;

/// Access to the platform's PCI tree and SR-IOV controls.
pub trait Platform: Send + Sync {
    /// Resolve the first PCI address matching a vendor/device pair.
    fn pci_by_device_id(&self, vendor: &str, device: &str) -> Result<String>;

    /// Resolve the kernel network interface backed by a PCI device.
    fn netdev_for_pci(&self, pci: &str) -> Result<String>;

    /// Resolve the PCI address of a PF's virtual function by index.
    fn vf_pci_address(&self, pf_pci: &str, vf_index: u32) -> Result<String>;

    /// Write the per-device virtual-function count control.
    fn set_sriov_numvfs(&self, pci: &str, count: u32) -> Result<()>;

    /// Resolve the kernel network interface for a vendor/device pair.
    fn netdev_by_device_id(&self, vendor: &str, device: &str) -> Result<String> {
        let pci = self.pci_by_device_id(vendor, device)?;
        self.netdev_for_pci(&pci)
    }
}

/// Real platform rooted at `/sys/bus/pci/devices`.
pub struct SysfsPlatform {
    devices_root: PathBuf,
}

impl SysfsPlatform {
    pub fn new() -> Self {
        Self {
            devices_root: PathBuf::from("/sys/bus/pci/devices"),
        }
    }

    /// Root override for tests running against a scratch tree.
    pub fn with_root(devices_root: PathBuf) -> Self {
        Self { devices_root }
    }

    fn read_id(&self, pci: &str, file: &str) -> Result<String> {
        let raw = std::fs::read_to_string(self.devices_root.join(pci).join(file))?;
        // sysfs reports ids as 0x-prefixed hex with a trailing newline
        Ok(raw.trim().trim_start_matches("0x").to_string())
    }
}

impl Default for SysfsPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for SysfsPlatform {
    fn pci_by_device_id(&self, vendor: &str, device: &str) -> Result<String> {
        for entry in std::fs::read_dir(&self.devices_root)? {
            let entry = entry?;
            let pci = entry.file_name().to_string_lossy().to_string();
            let Ok(dev_vendor) = self.read_id(&pci, "vendor") else {
                continue;
            };
            let Ok(dev_device) = self.read_id(&pci, "device") else {
                continue;
            };
            if dev_vendor.eq_ignore_ascii_case(vendor) && dev_device.eq_ignore_ascii_case(device) {
                debug!(pci = %pci, vendor = %vendor, device = %device, "Resolved PCI device");
                return Ok(pci);
            }
        }
        Err(PlatformError::DeviceNotFound {
            vendor: vendor.to_string(),
            device: device.to_string(),
        })
    }

    fn netdev_for_pci(&self, pci: &str) -> Result<String> {
        let net_dir = self.devices_root.join(pci).join("net");
        let mut names: Vec<String> = std::fs::read_dir(&net_dir)
            .map_err(|_| PlatformError::NoNetdev(pci.to_string()))?
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
            .into_iter()
            .next()
            .ok_or_else(|| PlatformError::NoNetdev(pci.to_string()))
    }

    fn vf_pci_address(&self, pf_pci: &str, vf_index: u32) -> Result<String> {
        let link = self
            .devices_root
            .join(pf_pci)
            .join(format!("virtfn{vf_index}"));
        let target = std::fs::read_link(&link).map_err(|_| PlatformError::VirtfnMissing {
            pci: pf_pci.to_string(),
            index: vf_index,
        })?;
        let addr = target
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        Ok(addr)
    }

    fn set_sriov_numvfs(&self, pci: &str, count: u32) -> Result<()> {
        let control = self.devices_root.join(pci).join("sriov_numvfs");
        std::fs::write(&control, count.to_string())?;
        debug!(pci = %pci, count, "Wrote sriov_numvfs");
        Ok(())
    }
}
