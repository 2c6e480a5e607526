use anyhow::{anyhow, bail, Context, Result};
use nix::ifaddrs::getifaddrs;
use std::net::{Ipv4Addr, SocketAddrV4};
use tracing::debug;

#[cfg(target_os = "freebsd")]
pub const LOOPBACK_INTERFACE: &str = "lo0";
#[cfg(not(target_os = "freebsd"))]
pub const LOOPBACK_INTERFACE: &str = "lo";

/// First IPv4 address of a network interface together with its network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceAddress {
    pub ip: Ipv4Addr,
    pub prefix: u8,
}

impl InterfaceAddress {
    /// Network in CIDR notation, host bits cleared.
    #[must_use]
    pub fn network(&self) -> String {
        let mask = prefix_mask(self.prefix);
        let network = Ipv4Addr::from(u32::from(self.ip) & mask);
        format!("{network}/{}", self.prefix)
    }
}

fn prefix_mask(prefix: u8) -> u32 {
    match prefix {
        0 => 0,
        p if p >= 32 => u32::MAX,
        p => u32::MAX << (32 - u32::from(p)),
    }
}

/// Resolve the first IPv4 address bound to `name`.
///
/// # Errors
/// Returns an error if the interfaces cannot be listed or `name` has no IPv4 address.
pub fn resolve(name: &str) -> Result<InterfaceAddress> {
    let addrs = getifaddrs().context("cannot list network interfaces")?;

    for ifaddr in addrs.filter(|ifaddr| ifaddr.interface_name == name) {
        let Some(ip) = ifaddr
            .address
            .as_ref()
            .and_then(|a| a.as_sockaddr_in())
            .map(|sin| *SocketAddrV4::from(*sin).ip())
        else {
            continue;
        };

        let prefix = ifaddr
            .netmask
            .as_ref()
            .and_then(|m| m.as_sockaddr_in())
            .map_or(32, |sin| {
                let mask = u32::from(*SocketAddrV4::from(*sin).ip());
                u8::try_from(mask.count_ones()).unwrap_or(32)
            });

        debug!(interface = name, %ip, prefix, "resolved interface address");

        return Ok(InterfaceAddress { ip, prefix });
    }

    Err(anyhow!("no IPv4 address found for interface {name}"))
}

/// Validate an IPv4 CIDR such as `10.0.0.0/8`.
///
/// # Errors
/// Returns an error if `cidr` is not `a.b.c.d/n` with `n <= 32`.
pub fn validate_cidr(cidr: &str) -> Result<()> {
    let Some((ip, prefix)) = cidr.split_once('/') else {
        bail!("{cidr} is not an IPv4 CIDR");
    };

    ip.parse::<Ipv4Addr>()
        .with_context(|| format!("{cidr} has an invalid address"))?;

    match prefix.parse::<u8>() {
        Ok(p) if p <= 32 => Ok(()),
        _ => bail!("{cidr} has an invalid prefix length"),
    }
}
