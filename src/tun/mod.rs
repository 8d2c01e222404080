//! TUN interface capability.
//!
//! Two variants behind one surface: a kernel-backed device for production
//! and an in-memory mock for tests. Code above this module never branches
//! on the variant; it reads whole IP datagrams from the read half and
//! writes whole datagrams to the write half.

mod device;
pub mod nat;

pub use device::KernelTun;
pub use nat::{enable_ip_forwarding, setup_nat, teardown_nat, RoutingState};

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use std::net::Ipv4Addr;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Queue depth for the mock variant's packet channels
const MOCK_CHANNEL_DEPTH: usize = 256;

/// A layer-3 tunnel interface.
///
/// `read` yields the next outbound datagram from the host (internet to
/// client direction); `write` pushes a client datagram toward the host.
pub enum TunIf {
    Kernel(KernelTun),
    Mock {
        read_rx: mpsc::Receiver<Bytes>,
        write_tx: mpsc::Sender<Bytes>,
    },
}

/// Test-side controls for a mock interface: inject packets for the router
/// to read, observe packets the router wrote.
pub struct MockTunHandle {
    pub inject: mpsc::Sender<Bytes>,
    pub written: mpsc::Receiver<Bytes>,
}

impl TunIf {
    /// Acquire a kernel TUN device with a stable interface name
    pub fn kernel(name: &str, mtu: u16) -> Result<Self> {
        Ok(TunIf::Kernel(KernelTun::create(name, mtu)?))
    }

    /// Create a purely in-memory interface for tests
    pub fn mock() -> (Self, MockTunHandle) {
        let (inject_tx, inject_rx) = mpsc::channel(MOCK_CHANNEL_DEPTH);
        let (written_tx, written_rx) = mpsc::channel(MOCK_CHANNEL_DEPTH);
        (
            TunIf::Mock {
                read_rx: inject_rx,
                write_tx: written_tx,
            },
            MockTunHandle {
                inject: inject_tx,
                written: written_rx,
            },
        )
    }

    /// Interface name as the kernel knows it
    pub fn name(&self) -> &str {
        match self {
            TunIf::Kernel(tun) => tun.name(),
            TunIf::Mock { .. } => "mock0",
        }
    }

    /// Set the local address, bring the interface up, and prepare egress.
    ///
    /// On the kernel variant this also enables IPv4 forwarding and installs
    /// NAT masquerading for the tunnel subnet out of `outbound_iface` (or
    /// the detected default interface). Forwarding and NAT failures are
    /// soft: inside a container without NET_ADMIN the host is expected to
    /// have configured them externally, so the server logs and continues.
    pub fn assign_ip(
        &mut self,
        addr: Ipv4Addr,
        netmask: Ipv4Addr,
        outbound_iface: Option<&str>,
        routing: &mut RoutingState,
    ) -> Result<()> {
        let TunIf::Kernel(tun) = self else {
            return Ok(());
        };

        tun.configure_address(addr, netmask)
            .context("configuring TUN address")?;

        if let Err(e) = enable_ip_forwarding() {
            warn!(%e, "could not enable IP forwarding, relying on host configuration");
        }

        let outbound = outbound_iface
            .map(str::to_string)
            .or_else(crate::server::detect_default_iface);
        match outbound {
            Some(iface) => {
                if let Err(e) = setup_nat(tun.name(), &iface, routing) {
                    warn!(%e, outbound = %iface, "NAT setup failed, relying on host configuration");
                } else {
                    info!(tun = %tun.name(), outbound = %iface, "NAT masquerading configured");
                }
            }
            None => warn!("no outbound interface detected, NAT not configured"),
        }

        Ok(())
    }

    /// Split into independently owned read and write halves
    pub fn split(self) -> (TunReader, TunWriter) {
        match self {
            TunIf::Kernel(tun) => {
                let mtu = tun.mtu();
                let (read, write) = tokio::io::split(tun.into_inner());
                (
                    TunReader::Kernel { inner: read, mtu },
                    TunWriter::Kernel(write),
                )
            }
            TunIf::Mock { read_rx, write_tx } => {
                (TunReader::Mock { rx: read_rx }, TunWriter::Mock(write_tx))
            }
        }
    }
}

/// Tear down routes and NAT rules this process installed.
///
/// The device handle itself is released when the read and write halves
/// drop.
pub fn destroy(routing: &mut RoutingState) {
    if let Err(e) = teardown_nat(routing) {
        warn!(%e, "NAT teardown incomplete");
    }
}

/// Read half of a tunnel interface
pub enum TunReader {
    Kernel {
        inner: ReadHalf<tokio_tun::Tun>,
        mtu: u16,
    },
    Mock {
        rx: mpsc::Receiver<Bytes>,
    },
}

impl TunReader {
    /// Read the next IP datagram; blocks until one is available or the
    /// interface is closed
    pub async fn read_packet(&mut self) -> Result<Bytes> {
        match self {
            TunReader::Kernel { inner, mtu } => {
                let mut buf = vec![0u8; *mtu as usize + 4];
                let n = inner.read(&mut buf).await.context("reading TUN device")?;
                if n == 0 {
                    return Err(anyhow!("TUN device closed"));
                }
                Ok(Bytes::copy_from_slice(&buf[..n]))
            }
            TunReader::Mock { rx } => rx.recv().await.ok_or_else(|| anyhow!("mock TUN closed")),
        }
    }
}

/// Write half of a tunnel interface
pub enum TunWriter {
    Kernel(WriteHalf<tokio_tun::Tun>),
    Mock(mpsc::Sender<Bytes>),
}

impl TunWriter {
    /// Write one IP datagram toward the host kernel
    pub async fn write_packet(&mut self, packet: &[u8]) -> Result<()> {
        match self {
            TunWriter::Kernel(inner) => {
                inner.write_all(packet).await.context("writing TUN device")
            }
            TunWriter::Mock(tx) => tx
                .send(Bytes::copy_from_slice(packet))
                .await
                .map_err(|_| anyhow!("mock TUN closed")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_write_is_observable() {
        let (tun, mut handle) = TunIf::mock();
        let (_reader, mut writer) = tun.split();

        writer.write_packet(b"datagram").await.unwrap();
        let seen = handle.written.recv().await.unwrap();
        assert_eq!(&seen[..], b"datagram");
    }

    #[tokio::test]
    async fn mock_read_returns_injected_packets() {
        let (tun, handle) = TunIf::mock();
        let (mut reader, _writer) = tun.split();

        handle.inject.send(Bytes::from_static(b"inbound")).await.unwrap();
        let pkt = reader.read_packet().await.unwrap();
        assert_eq!(&pkt[..], b"inbound");
    }

    #[tokio::test]
    async fn mock_read_fails_after_close() {
        let (tun, handle) = TunIf::mock();
        let (mut reader, _writer) = tun.split();
        drop(handle);
        assert!(reader.read_packet().await.is_err());
    }

    #[tokio::test]
    async fn mock_assign_ip_is_a_no_op() {
        let (mut tun, _handle) = TunIf::mock();
        let mut routing = RoutingState::new();
        tun.assign_ip(
            Ipv4Addr::new(10, 8, 0, 1),
            Ipv4Addr::new(255, 255, 255, 0),
            None,
            &mut routing,
        )
        .unwrap();
        assert!(routing.rules().is_empty());
    }
}
