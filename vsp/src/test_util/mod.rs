//! Test doubles for the platform and kernel-link layers.
//!
//! Exported so integration tests can exercise the whole daemon without
//! hardware, sysfs, or root privileges.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv6Addr};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;

use crate::netdev::{NetOps, NetdevError, Result as NetResult};
use crate::platform::{Platform, PlatformError, Result as PlatformResult};

/// In-memory stand-in for the kernel link layer.
pub struct FakeNetOps {
    links: Mutex<HashMap<String, FakeLink>>,
    addrs: Mutex<HashMap<String, Vec<IpAddr>>>,
    neighbors: Mutex<Vec<Ipv6Addr>>,
    calls: Mutex<Vec<String>>,
    fail_create: Mutex<Option<String>>,
    fail_link_up: AtomicBool,
    fail_link_manager: AtomicBool,
    mac_counter: AtomicU32,
}

#[derive(Debug, Clone)]
struct FakeLink {
    peer: Option<String>,
    mac: String,
    up: bool,
}

impl FakeNetOps {
    pub fn new() -> Self {
        Self {
            links: Mutex::new(HashMap::new()),
            addrs: Mutex::new(HashMap::new()),
            neighbors: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            fail_create: Mutex::new(None),
            fail_link_up: AtomicBool::new(false),
            fail_link_manager: AtomicBool::new(false),
            mac_counter: AtomicU32::new(0),
        }
    }

    /// Pre-create a link so non-veth interfaces (e.g. the comm-channel PF)
    /// resolve.
    pub fn add_link(&self, name: &str) {
        let mac = self.next_mac();
        self.links.lock().unwrap().insert(
            name.to_string(),
            FakeLink {
                peer: None,
                mac,
                up: false,
            },
        );
    }

    pub fn set_interface_addrs(&self, name: &str, addrs: Vec<IpAddr>) {
        self.addrs.lock().unwrap().insert(name.to_string(), addrs);
    }

    pub fn set_neighbors(&self, neighbors: Vec<Ipv6Addr>) {
        *self.neighbors.lock().unwrap() = neighbors;
    }

    /// Make `create_veth` fail for the named link.
    pub fn fail_create_of(&self, name: &str) {
        *self.fail_create.lock().unwrap() = Some(name.to_string());
    }

    pub fn fail_link_up(&self, fail: bool) {
        self.fail_link_up.store(fail, Ordering::SeqCst);
    }

    pub fn fail_link_manager(&self, fail: bool) {
        self.fail_link_manager.store(fail, Ordering::SeqCst);
    }

    pub fn set_link_state(&self, name: &str, up: bool) {
        if let Some(link) = self.links.lock().unwrap().get_mut(name) {
            link.up = up;
        }
    }

    pub fn link_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.links.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn next_mac(&self) -> String {
        let n = self.mac_counter.fetch_add(1, Ordering::SeqCst);
        format!("52:54:00:00:{:02x}:{:02x}", n >> 8, n & 0xff)
    }

    fn failed(&self, command: &str) -> NetdevError {
        NetdevError::CommandFailed {
            command: command.to_string(),
            stderr: "injected failure".to_string(),
        }
    }
}

impl Default for FakeNetOps {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NetOps for FakeNetOps {
    async fn create_veth(&self, name: &str, peer: &str) -> NetResult<()> {
        self.record(format!("create_veth {name} {peer}"));
        if self.fail_create.lock().unwrap().as_deref() == Some(name) {
            return Err(self.failed("create_veth"));
        }
        let name_mac = self.next_mac();
        let peer_mac = self.next_mac();
        let mut links = self.links.lock().unwrap();
        links.insert(
            name.to_string(),
            FakeLink {
                peer: Some(peer.to_string()),
                mac: name_mac,
                up: false,
            },
        );
        links.insert(
            peer.to_string(),
            FakeLink {
                peer: Some(name.to_string()),
                mac: peer_mac,
                up: false,
            },
        );
        Ok(())
    }

    async fn set_link_up(&self, name: &str) -> NetResult<()> {
        self.record(format!("set_link_up {name}"));
        if self.fail_link_up.load(Ordering::SeqCst) {
            return Err(self.failed("set_link_up"));
        }
        let mut links = self.links.lock().unwrap();
        let link = links
            .get_mut(name)
            .ok_or_else(|| NetdevError::LinkNotFound(name.to_string()))?;
        link.up = true;
        Ok(())
    }

    async fn set_link_down(&self, name: &str) -> NetResult<()> {
        self.record(format!("set_link_down {name}"));
        let mut links = self.links.lock().unwrap();
        let link = links
            .get_mut(name)
            .ok_or_else(|| NetdevError::LinkNotFound(name.to_string()))?;
        link.up = false;
        Ok(())
    }

    async fn delete_link(&self, name: &str) -> NetResult<()> {
        self.record(format!("delete_link {name}"));
        let mut links = self.links.lock().unwrap();
        let link = links
            .remove(name)
            .ok_or_else(|| NetdevError::LinkNotFound(name.to_string()))?;
        if let Some(peer) = link.peer {
            links.remove(&peer);
        }
        Ok(())
    }

    async fn mac_address(&self, name: &str) -> NetResult<String> {
        let links = self.links.lock().unwrap();
        links
            .get(name)
            .map(|l| l.mac.clone())
            .ok_or_else(|| NetdevError::LinkNotFound(name.to_string()))
    }

    async fn link_is_up(&self, name: &str) -> NetResult<bool> {
        let links = self.links.lock().unwrap();
        links
            .get(name)
            .map(|l| l.up)
            .ok_or_else(|| NetdevError::LinkNotFound(name.to_string()))
    }

    async fn disengage_link_manager(&self, name: &str) -> NetResult<()> {
        self.record(format!("disengage_link_manager {name}"));
        if self.fail_link_manager.load(Ordering::SeqCst) {
            return Err(self.failed("disengage_link_manager"));
        }
        Ok(())
    }

    async fn set_addrgen_eui64(&self, name: &str) -> NetResult<()> {
        self.record(format!("set_addrgen_eui64 {name}"));
        Ok(())
    }

    async fn replace_address(&self, name: &str, addr: &str) -> NetResult<()> {
        self.record(format!("replace_address {name} {addr}"));
        if !self.links.lock().unwrap().contains_key(name) {
            return Err(NetdevError::LinkNotFound(name.to_string()));
        }
        Ok(())
    }

    async fn probe_multicast(&self, name: &str) -> NetResult<()> {
        self.record(format!("probe_multicast {name}"));
        Ok(())
    }

    async fn interface_addrs(&self, name: &str) -> NetResult<Vec<IpAddr>> {
        Ok(self
            .addrs
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .unwrap_or_default())
    }

    async fn neighbor_addrs(&self, _name: &str) -> NetResult<Vec<Ipv6Addr>> {
        Ok(self.neighbors.lock().unwrap().clone())
    }
}

/// In-memory stand-in for the PCI/sysfs layer. Records `sriov_numvfs`
/// writes so tests can assert the control file was (not) touched.
pub struct FakePlatform {
    devices: Mutex<HashMap<(String, String), String>>,
    netdevs: Mutex<HashMap<String, String>>,
    virtfns: Mutex<HashMap<(String, u32), String>>,
    numvfs_writes: Mutex<Vec<(String, u32)>>,
}

impl FakePlatform {
    pub fn new() -> Self {
        Self {
            devices: Mutex::new(HashMap::new()),
            netdevs: Mutex::new(HashMap::new()),
            virtfns: Mutex::new(HashMap::new()),
            numvfs_writes: Mutex::new(Vec::new()),
        }
    }

    pub fn add_device(&self, vendor: &str, device: &str, pci: &str) {
        self.devices
            .lock()
            .unwrap()
            .insert((vendor.to_string(), device.to_string()), pci.to_string());
    }

    pub fn add_netdev(&self, pci: &str, name: &str) {
        self.netdevs
            .lock()
            .unwrap()
            .insert(pci.to_string(), name.to_string());
    }

    pub fn add_virtfn(&self, pf_pci: &str, index: u32, vf_pci: &str) {
        self.virtfns
            .lock()
            .unwrap()
            .insert((pf_pci.to_string(), index), vf_pci.to_string());
    }

    pub fn numvfs_writes(&self) -> Vec<(String, u32)> {
        self.numvfs_writes.lock().unwrap().clone()
    }
}

impl Default for FakePlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for FakePlatform {
    fn pci_by_device_id(&self, vendor: &str, device: &str) -> PlatformResult<String> {
        self.devices
            .lock()
            .unwrap()
            .get(&(vendor.to_string(), device.to_string()))
            .cloned()
            .ok_or_else(|| PlatformError::DeviceNotFound {
                vendor: vendor.to_string(),
                device: device.to_string(),
            })
    }

    fn netdev_for_pci(&self, pci: &str) -> PlatformResult<String> {
        self.netdevs
            .lock()
            .unwrap()
            .get(pci)
            .cloned()
            .ok_or_else(|| PlatformError::NoNetdev(pci.to_string()))
    }

    fn vf_pci_address(&self, pf_pci: &str, vf_index: u32) -> PlatformResult<String> {
        self.virtfns
            .lock()
            .unwrap()
            .get(&(pf_pci.to_string(), vf_index))
            .cloned()
            .ok_or_else(|| PlatformError::VirtfnMissing {
                pci: pf_pci.to_string(),
                index: vf_index,
            })
    }

    fn set_sriov_numvfs(&self, pci: &str, count: u32) -> PlatformResult<()> {
        self.numvfs_writes
            .lock()
            .unwrap()
            .push((pci.to_string(), count));
        Ok(())
    }
}
