//! Kernel TUN device acquisition and interface configuration.

use anyhow::{bail, Context, Result};
use std::net::Ipv4Addr;
use std::process::Command;
use tokio_tun::{Tun, TunBuilder};
use tracing::{info, warn};

/// A kernel-backed TUN device.
///
/// Created down; `configure_address` assigns the local address and brings
/// the link up.
pub struct KernelTun {
    tun: Tun,
    name: String,
    mtu: u16,
}

impl KernelTun {
    /// Open the kernel cloning device and reserve `name`
    pub fn create(name: &str, mtu: u16) -> Result<Self> {
        let tun = TunBuilder::new()
            .name(name)
            .mtu(mtu as i32)
            .try_build()
            .context("creating TUN device")?;

        let name = tun.name().to_string();
        info!(name = %name, mtu, "TUN device created");

        Ok(Self { tun, name, mtu })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    pub fn into_inner(self) -> Tun {
        self.tun
    }

    /// Assign the local address and bring the interface up
    pub fn configure_address(&self, addr: Ipv4Addr, netmask: Ipv4Addr) -> Result<()> {
        let addr_cidr = format!("{}/{}", addr, netmask_to_cidr(netmask));
        let status = Command::new("ip")
            .args(["addr", "add", &addr_cidr, "dev", &self.name])
            .status()
            .context("running ip addr add")?;

        if !status.success() {
            warn!(
                name = %self.name,
                addr = %addr_cidr,
                "ip addr add failed (may already be configured)"
            );
        }

        let status = Command::new("ip")
            .args(["link", "set", &self.name, "up"])
            .status()
            .context("running ip link set up")?;

        if !status.success() {
            bail!("failed to bring up interface {}", self.name);
        }

        info!(name = %self.name, addr = %addr, netmask = %netmask, "TUN interface configured");
        Ok(())
    }
}

/// Convert a netmask to its CIDR prefix length
pub(crate) fn netmask_to_cidr(netmask: Ipv4Addr) -> u8 {
    u32::from(netmask).count_ones() as u8
}
