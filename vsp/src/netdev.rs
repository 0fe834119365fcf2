//! Kernel network-link operations.
//!
//! Wraps the external tooling (`ip`, `ping6`, `nmcli`) and sysfs reads the
//! daemon needs for veth provisioning and comm-channel bootstrap. All
//! command invocations are bounded by a timeout so a wedged tool cannot
//! hang an RPC path. Which steps are best-effort is decided by callers,
//! not here.

use std::net::{IpAddr, Ipv6Addr};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Upper bound for any single external command.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Link-operation errors.
#[derive(Debug, Error)]
pub enum NetdevError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("`{command}` failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("`{command}` timed out")]
    CommandTimeout { command: String },

    #[error("link not found: {0}")]
    LinkNotFound(String),
}

pub type Result<T> = std::result::Result<T, NetdevError>;

/// Kernel link operations used by veth provisioning and the comm-channel
/// resolver. Implemented by [`IpCommandOps`] in production and by a fake in
/// tests.
#[async_trait]
pub trait NetOps: Send + Sync {
    /// Create a veth pair `name` <-> `peer`.
    async fn create_veth(&self, name: &str, peer: &str) -> Result<()>;

    async fn set_link_up(&self, name: &str) -> Result<()>;

    async fn set_link_down(&self, name: &str) -> Result<()>;

    /// Delete a link; deleting one end of a veth pair removes both.
    async fn delete_link(&self, name: &str) -> Result<()>;

    /// Hardware address of a link, lowercase colon-separated.
    async fn mac_address(&self, name: &str) -> Result<String>;

    /// Whether the link is administratively up.
    async fn link_is_up(&self, name: &str) -> Result<bool>;

    /// Ask the host's link manager to stop managing the interface so manual
    /// address configuration sticks.
    async fn disengage_link_manager(&self, name: &str) -> Result<()>;

    /// Switch address generation to the stable EUI-64 scheme.
    async fn set_addrgen_eui64(&self, name: &str) -> Result<()>;

    /// Replace/assign an address literal (with prefix length) on the link.
    async fn replace_address(&self, name: &str, addr: &str) -> Result<()>;

    /// Send a short multicast probe burst to populate the neighbor cache.
    async fn probe_multicast(&self, name: &str) -> Result<()>;

    /// All addresses currently assigned to the interface.
    async fn interface_addrs(&self, name: &str) -> Result<Vec<IpAddr>>;

    /// IPv6 neighbor-cache entries for the interface.
    async fn neighbor_addrs(&self, name: &str) -> Result<Vec<Ipv6Addr>>;
}

/// Production implementation shelling out to `ip`, `ping6` and `nmcli`.
pub struct IpCommandOps;

impl IpCommandOps {
    pub fn new() -> Self {
        Self
    }

    async fn run(&self, program: &str, args: &[&str]) -> Result<String> {
        let rendered = format!("{} {}", program, args.join(" "));
        debug!(command = %rendered, "Running");
        let fut = Command::new(program).args(args).output();
        let output = tokio::time::timeout(COMMAND_TIMEOUT, fut)
            .await
            .map_err(|_| NetdevError::CommandTimeout {
                command: rendered.clone(),
            })??;
        if !output.status.success() {
            return Err(NetdevError::CommandFailed {
                command: rendered,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

impl Default for IpCommandOps {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NetOps for IpCommandOps {
    async fn create_veth(&self, name: &str, peer: &str) -> Result<()> {
        self.run(
            "ip",
            &["link", "add", name, "type", "veth", "peer", "name", peer],
        )
        .await?;
        Ok(())
    }

    async fn set_link_up(&self, name: &str) -> Result<()> {
        self.run("ip", &["link", "set", name, "up"]).await?;
        Ok(())
    }

    async fn set_link_down(&self, name: &str) -> Result<()> {
        self.run("ip", &["link", "set", name, "down"]).await?;
        Ok(())
    }

    async fn delete_link(&self, name: &str) -> Result<()> {
        self.run("ip", &["link", "del", name]).await?;
        Ok(())
    }

    async fn mac_address(&self, name: &str) -> Result<String> {
        let path = format!("/sys/class/net/{name}/address");
        let raw = tokio::fs::read_to_string(&path)
            .await
            .map_err(|_| NetdevError::LinkNotFound(name.to_string()))?;
        Ok(raw.trim().to_ascii_lowercase())
    }

    async fn link_is_up(&self, name: &str) -> Result<bool> {
        const IFF_UP: u32 = 0x1;
        let path = format!("/sys/class/net/{name}/flags");
        let raw = tokio::fs::read_to_string(&path)
            .await
            .map_err(|_| NetdevError::LinkNotFound(name.to_string()))?;
        let flags = u32::from_str_radix(raw.trim().trim_start_matches("0x"), 16).unwrap_or(0);
        Ok(flags & IFF_UP != 0)
    }

    async fn disengage_link_manager(&self, name: &str) -> Result<()> {
        // The link manager lives in the root namespaces, the daemon may not.
        self.run(
            "nsenter",
            &[
                "-t", "1", "-m", "-u", "-n", "-i", "--", "nmcli", "device", "set", name,
                "managed", "no",
            ],
        )
        .await?;
        Ok(())
    }

    async fn set_addrgen_eui64(&self, name: &str) -> Result<()> {
        self.run("ip", &["link", "set", name, "addrgenmode", "eui64"])
            .await?;
        Ok(())
    }

    async fn replace_address(&self, name: &str, addr: &str) -> Result<()> {
        self.run("ip", &["addr", "replace", addr, "dev", name])
            .await?;
        Ok(())
    }

    async fn probe_multicast(&self, name: &str) -> Result<()> {
        self.run("ping6", &["-c", "2", "-I", name, "ff02::1"])
            .await?;
        Ok(())
    }

    async fn interface_addrs(&self, name: &str) -> Result<Vec<IpAddr>> {
        let addrs = nix::ifaddrs::getifaddrs().map_err(std::io::Error::from)?;
        let mut out = Vec::new();
        for ifaddr in addrs {
            if ifaddr.interface_name != name {
                continue;
            }
            let Some(storage) = ifaddr.address else {
                continue;
            };
            if let Some(sin) = storage.as_sockaddr_in() {
                out.push(IpAddr::V4(sin.ip()));
            } else if let Some(sin6) = storage.as_sockaddr_in6() {
                out.push(IpAddr::V6(sin6.ip()));
            }
        }
        Ok(out)
    }

    async fn neighbor_addrs(&self, name: &str) -> Result<Vec<Ipv6Addr>> {
        let listing = self
            .run("ip", &["-6", "neighbor", "show", "dev", name])
            .await?;
        Ok(parse_neighbor_listing(&listing))
    }
}

/// Parse `ip -6 neighbor show` output; one entry per line, address first.
fn parse_neighbor_listing(listing: &str) -> Vec<Ipv6Addr> {
    listing
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .filter_map(|token| token.parse().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_neighbor_listing() {
        let listing = "\
fe80::b226:28ff:fe3f:f2a5 lladdr b0:26:28:3f:f2:a5 router STALE
fe80::1 lladdr 00:11:22:33:44:55 REACHABLE
garbage line without address
";
        let addrs = parse_neighbor_listing(listing);
        assert_eq!(addrs.len(), 2);
        assert_eq!(addrs[1], "fe80::1".parse::<Ipv6Addr>().unwrap());
    }

    #[test]
    fn parses_empty_listing() {
        assert!(parse_neighbor_listing("").is_empty());
    }
}
