//! Comm-channel endpoint resolution.
//!
//! Runs once during `Init` and determines the address the opposite side
//! must dial to reach this daemon's RPC service. Both sides bring up
//! link-local addressing on their designated physical function; the DPU
//! side then reads back its own address while the host side discovers the
//! DPU's address from the neighbor cache populated by the probe burst.
//! Resolution is single-shot: if the peer has not come up yet it fails
//! fast rather than retrying.

use std::net::IpAddr;
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use crate::config::VspConfig;
use crate::netdev::{NetOps, NetdevError};
use crate::platform::{Platform, PlatformError};

/// Comm-channel resolution errors.
#[derive(Debug, Error)]
pub enum CommError {
    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error(transparent)]
    Netdev(#[from] NetdevError),

    #[error("there is no IPv6 address")]
    NoIpv6Address,

    #[error("neighbour list is empty")]
    NeighbourListEmpty,

    #[error("no link-local neighbour found")]
    NoLinkLocalPeer,
}

pub type Result<T> = std::result::Result<T, CommError>;

/// The rendezvous point returned from `Init`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub ip: String,
    pub port: u16,
}

/// Resolves the comm-channel endpoint for either side.
pub struct CommChannelResolver {
    ops: Arc<dyn NetOps>,
    platform: Arc<dyn Platform>,
    vendor_id: String,
    dpu_device_id: String,
    host_device_id: String,
    dpu_link_local: String,
    host_link_local: String,
    default_port: u16,
}

impl CommChannelResolver {
    pub fn new(ops: Arc<dyn NetOps>, platform: Arc<dyn Platform>, config: &VspConfig) -> Self {
        Self {
            ops,
            platform,
            vendor_id: config.vendor_id.clone(),
            dpu_device_id: config.dpu_device_id.clone(),
            host_device_id: config.host_device_id.clone(),
            dpu_link_local: config.dpu_link_local.clone(),
            host_link_local: config.host_link_local.clone(),
            default_port: config.default_port,
        }
    }

    /// Resolve the endpoint for this side of the comm channel.
    pub async fn resolve(&self, dpu_mode: bool) -> Result<Endpoint> {
        if dpu_mode {
            self.dpu_endpoint().await
        } else {
            self.host_endpoint().await
        }
    }

    async fn dpu_endpoint(&self) -> Result<Endpoint> {
        let ifname = self
            .platform
            .netdev_by_device_id(&self.vendor_id, &self.dpu_device_id)?;
        info!(interface = %ifname, "Resolved DPU-side comm interface");

        self.enable_link_local(&ifname, &self.dpu_link_local).await?;

        // The interface's own address is deterministically derived, so the
        // DPU side can simply read it back.
        let addrs = self.ops.interface_addrs(&ifname).await?;
        let addr = addrs
            .iter()
            .find_map(|a| match a {
                IpAddr::V6(v6) => Some(*v6),
                IpAddr::V4(_) => None,
            })
            .ok_or(CommError::NoIpv6Address)?;

        let ip = format!("[{addr}%{ifname}]");
        info!(ip = %ip, port = self.default_port, "DPU comm-channel endpoint");
        Ok(Endpoint {
            ip,
            port: self.default_port,
        })
    }

    async fn host_endpoint(&self) -> Result<Endpoint> {
        let ifname = self
            .platform
            .netdev_by_device_id(&self.vendor_id, &self.host_device_id)?;
        info!(interface = %ifname, "Resolved host-side comm interface");

        self.enable_link_local(&ifname, &self.host_link_local)
            .await?;

        // The host has no a priori knowledge of the DPU's address; the
        // probe burst above populated the neighbor cache for us to query.
        let neighbors = self.ops.neighbor_addrs(&ifname).await?;
        if neighbors.is_empty() {
            return Err(CommError::NeighbourListEmpty);
        }
        let addr = neighbors
            .iter()
            .find(|a| a.to_string().starts_with("fe80::"))
            .ok_or(CommError::NoLinkLocalPeer)?;

        // %25 is the URL-encoded zone separator; callers embed this in a
        // dial target.
        let ip = format!("[{addr}%25{ifname}]");
        info!(ip = %ip, port = self.default_port, "Host comm-channel endpoint");
        Ok(Endpoint {
            ip,
            port: self.default_port,
        })
    }

    /// Bring up link-local addressing on the interface. Steps marked
    /// best-effort log and continue on failure; the rest are fatal.
    async fn enable_link_local(&self, ifname: &str, addr: &str) -> Result<()> {
        // Best-effort: the host may not run a link manager at all.
        if let Err(e) = self.ops.disengage_link_manager(ifname).await {
            warn!(interface = %ifname, error = %e, "Could not disengage link manager");
        }

        // Best-effort: cycle the link to regenerate its link-local address
        // under the stable EUI-64 scheme.
        if let Err(e) = self.ops.set_addrgen_eui64(ifname).await {
            warn!(interface = %ifname, error = %e, "Could not set addrgenmode");
        }
        if let Err(e) = self.ops.set_link_down(ifname).await {
            warn!(interface = %ifname, error = %e, "Could not set link down");
        }

        // Fatal: without a live link there is no comm channel.
        self.ops.set_link_up(ifname).await?;

        // Fatal: the fixed literal is the rendezvous address.
        self.ops
            .replace_address(ifname, &format!("{addr}/64"))
            .await?;

        // Best-effort: populate the neighbor cache for the host side.
        if let Err(e) = self.ops.probe_multicast(ifname).await {
            warn!(interface = %ifname, error = %e, "Multicast probe failed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{FakeNetOps, FakePlatform};
    use std::net::Ipv6Addr;

    const IFNAME: &str = "enP2p3s0";

    fn setup(device_id: &str) -> (Arc<FakeNetOps>, Arc<FakePlatform>) {
        let ops = Arc::new(FakeNetOps::new());
        ops.add_link(IFNAME);
        let platform = Arc::new(FakePlatform::new());
        platform.add_device("177d", device_id, "0000:01:00.0");
        platform.add_netdev("0000:01:00.0", IFNAME);
        (ops, platform)
    }

    fn resolver(ops: Arc<FakeNetOps>, platform: Arc<FakePlatform>) -> CommChannelResolver {
        CommChannelResolver::new(ops, platform, &VspConfig::default())
    }

    #[tokio::test]
    async fn dpu_side_returns_fixed_literal_and_default_port() {
        let (ops, platform) = setup("a0f7");
        ops.set_interface_addrs(IFNAME, vec!["fe80::1".parse().unwrap()]);

        let endpoint = resolver(ops, platform).resolve(true).await.unwrap();
        assert_eq!(endpoint.ip, format!("[fe80::1%{IFNAME}]"));
        assert_eq!(endpoint.port, 8085);
    }

    #[tokio::test]
    async fn dpu_side_skips_ipv4_addresses() {
        let (ops, platform) = setup("a0f7");
        ops.set_interface_addrs(
            IFNAME,
            vec!["10.0.0.5".parse().unwrap(), "fe80::1".parse().unwrap()],
        );

        let endpoint = resolver(ops, platform).resolve(true).await.unwrap();
        assert_eq!(endpoint.ip, format!("[fe80::1%{IFNAME}]"));
    }

    #[tokio::test]
    async fn dpu_side_without_ipv6_fails() {
        let (ops, platform) = setup("a0f7");
        ops.set_interface_addrs(IFNAME, vec!["10.0.0.5".parse().unwrap()]);

        assert!(matches!(
            resolver(ops, platform).resolve(true).await,
            Err(CommError::NoIpv6Address)
        ));
    }

    #[tokio::test]
    async fn host_side_discovers_peer_via_neighbors() {
        let (ops, platform) = setup("b900");
        ops.set_neighbors(vec!["fe80::1".parse::<Ipv6Addr>().unwrap()]);

        let endpoint = resolver(ops, platform).resolve(false).await.unwrap();
        assert_eq!(endpoint.ip, format!("[fe80::1%25{IFNAME}]"));
        assert_eq!(endpoint.port, 8085);
    }

    #[tokio::test]
    async fn host_side_with_empty_cache_fails_fast() {
        let (ops, platform) = setup("b900");

        assert!(matches!(
            resolver(ops, platform).resolve(false).await,
            Err(CommError::NeighbourListEmpty)
        ));
    }

    #[tokio::test]
    async fn host_side_ignores_non_link_local_neighbors() {
        let (ops, platform) = setup("b900");
        ops.set_neighbors(vec!["2001:db8::1".parse::<Ipv6Addr>().unwrap()]);

        assert!(matches!(
            resolver(ops, platform).resolve(false).await,
            Err(CommError::NoLinkLocalPeer)
        ));
    }

    #[tokio::test]
    async fn link_manager_failure_is_best_effort() {
        let (ops, platform) = setup("a0f7");
        ops.fail_link_manager(true);
        ops.set_interface_addrs(IFNAME, vec!["fe80::1".parse().unwrap()]);

        assert!(resolver(ops, platform).resolve(true).await.is_ok());
    }

    #[tokio::test]
    async fn link_up_failure_is_fatal() {
        let (ops, platform) = setup("a0f7");
        ops.fail_link_up(true);
        ops.set_interface_addrs(IFNAME, vec!["fe80::1".parse().unwrap()]);

        assert!(matches!(
            resolver(ops, platform).resolve(true).await,
            Err(CommError::Netdev(_))
        ));
    }

    #[tokio::test]
    async fn missing_device_is_fatal() {
        let ops = Arc::new(FakeNetOps::new());
        let platform = Arc::new(FakePlatform::new());

        assert!(matches!(
            resolver(ops, platform).resolve(true).await,
            Err(CommError::Platform(_))
        ));
    }
}
