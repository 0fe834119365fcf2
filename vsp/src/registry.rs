//! In-memory table of provisioned network-interface pairs.
//!
//! The registry starts uninitialized; `Init` in DPU mode creates the empty
//! table before provisioning fills it. Health is never stored here, it is
//! recomputed on demand from the live link state. All access goes through
//! one mutex because RPC handlers run concurrently.

use std::collections::HashMap;

use thiserror::Error;
use tokio::sync::Mutex;

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("device store is empty")]
    DeviceStoreEmpty,
}

pub type Result<T> = std::result::Result<T, RegistryError>;

/// Health of a provisioned interface pair, recomputed on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Healthy,
    Unhealthy,
}

impl Health {
    pub fn as_str(&self) -> &'static str {
        match self {
            Health::Healthy => "Healthy",
            Health::Unhealthy => "Unhealthy",
        }
    }
}

/// One provisioned interface pair. `nf_interface` faces the network
/// function, `dp_interface` faces the dataplane.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub nf_interface: String,
    pub dp_interface: String,
    pub dp_mac: String,
}

/// Shared device table, keyed by the dataplane-facing peer's MAC address
/// (unique per pair).
pub struct DeviceRegistry {
    devices: Mutex<Option<HashMap<String, DeviceInfo>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self {
            devices: Mutex::new(None),
        }
    }

    /// Create the empty table if it does not exist yet.
    pub async fn init_if_absent(&self) {
        let mut guard = self.devices.lock().await;
        if guard.is_none() {
            *guard = Some(HashMap::new());
        }
    }

    /// Insert a pair, keyed by its dataplane-side MAC. Initializes the
    /// table if needed.
    pub async fn insert(&self, info: DeviceInfo) {
        let mut guard = self.devices.lock().await;
        guard
            .get_or_insert_with(HashMap::new)
            .insert(info.dp_mac.clone(), info);
    }

    /// Snapshot of all entries; fails if the table was never initialized.
    pub async fn snapshot(&self) -> Result<Vec<DeviceInfo>> {
        let guard = self.devices.lock().await;
        match guard.as_ref() {
            Some(map) => Ok(map.values().cloned().collect()),
            None => Err(RegistryError::DeviceStoreEmpty),
        }
    }

    /// Empty the table and hand its entries to the caller for cleanup.
    /// A second call yields nothing, which makes cleanup idempotent.
    pub async fn take_all(&self) -> Vec<DeviceInfo> {
        let mut guard = self.devices.lock().await;
        guard
            .take()
            .map(|map| map.into_values().collect())
            .unwrap_or_default()
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn snapshot_fails_before_init() {
        let registry = DeviceRegistry::new();
        assert!(matches!(
            registry.snapshot().await,
            Err(RegistryError::DeviceStoreEmpty)
        ));
    }

    #[tokio::test]
    async fn snapshot_empty_after_init() {
        let registry = DeviceRegistry::new();
        registry.init_if_absent().await;
        assert!(registry.snapshot().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn mac_key_is_unique() {
        let registry = DeviceRegistry::new();
        for _ in 0..2 {
            registry
                .insert(DeviceInfo {
                    nf_interface: "nf_interface0".to_string(),
                    dp_interface: "dp_interface0".to_string(),
                    dp_mac: "52:54:00:00:00:01".to_string(),
                })
                .await;
        }
        assert_eq!(registry.snapshot().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn take_all_empties_the_table() {
        let registry = DeviceRegistry::new();
        registry
            .insert(DeviceInfo {
                nf_interface: "nf_interface0".to_string(),
                dp_interface: "dp_interface0".to_string(),
                dp_mac: "52:54:00:00:00:01".to_string(),
            })
            .await;
        assert_eq!(registry.take_all().await.len(), 1);
        assert!(registry.take_all().await.is_empty());
        // table is gone entirely, not just empty
        assert!(registry.snapshot().await.is_err());
    }
}
