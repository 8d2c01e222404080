//! Packet router between the TUN interface and live sessions.
//!
//! Internet-to-client: read datagrams off the TUN device, look the IPv4
//! destination up in the registry's IP index, and push the packet into the
//! owning session's channel. Client-to-internet: drain packets emitted by
//! sessions and write them to the TUN device.
//!
//! The router never owns sessions. Packets with no matching session are
//! dropped silently: stray broadcasts and raced disconnects are expected.

use super::registry::SessionRegistry;
use crate::tun::{TunReader, TunWriter};
use bytes::Bytes;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

/// Minimum length of a forwardable datagram (one IPv4 header)
pub const IPV4_HEADER_LEN: usize = 20;

/// A packet emitted by a session: the session's assigned source address
/// and the raw datagram
pub type OutboundPacket = (Ipv4Addr, Bytes);

/// IPv4 destination address (header bytes 16..20)
pub fn ipv4_destination(packet: &[u8]) -> Option<Ipv4Addr> {
    if packet.len() < IPV4_HEADER_LEN || packet[0] >> 4 != 4 {
        return None;
    }
    Some(Ipv4Addr::new(
        packet[16], packet[17], packet[18], packet[19],
    ))
}

/// IPv4 source address (header bytes 12..16)
pub fn ipv4_source(packet: &[u8]) -> Option<Ipv4Addr> {
    if packet.len() < IPV4_HEADER_LEN || packet[0] >> 4 != 4 {
        return None;
    }
    Some(Ipv4Addr::new(
        packet[12], packet[13], packet[14], packet[15],
    ))
}

/// Read datagrams from the TUN device and route them to sessions by
/// destination address.
///
/// Runs until the interface closes.
pub async fn tun_reader_task(mut reader: TunReader, registry: Arc<SessionRegistry>) {
    loop {
        let packet = match reader.read_packet().await {
            Ok(packet) => packet,
            Err(e) => {
                error!(%e, "TUN read failed, router stopping");
                break;
            }
        };

        let Some(dst) = ipv4_destination(&packet) else {
            trace!(len = packet.len(), "non-IPv4 or runt packet from TUN dropped");
            continue;
        };

        match registry.lookup_by_ip(dst).await {
            Some(session) => {
                if session.data_tx.send(packet).await.is_err() {
                    // Session is tearing down; the raced packet is dropped
                    debug!(session = %session.id, "session channel closed, packet dropped");
                }
            }
            None => trace!("packet for unknown client dropped"),
        }
    }
    debug!("TUN reader task ended");
}

/// Drain session-emitted packets into the TUN device.
///
/// With anti-spoof enabled, a packet whose IPv4 source does not match the
/// emitting session's assigned address is dropped.
pub async fn tun_writer_task(
    mut writer: TunWriter,
    mut rx: mpsc::Receiver<OutboundPacket>,
    anti_spoof: bool,
) {
    while let Some((session_ip, packet)) = rx.recv().await {
        let Some(src) = ipv4_source(&packet) else {
            trace!(len = packet.len(), "non-IPv4 or runt packet from session dropped");
            continue;
        };

        if anti_spoof && src != session_ip {
            warn!(%session_ip, spoofed = %src, "spoofed source address, packet dropped");
            continue;
        }

        if let Err(e) = writer.write_packet(&packet).await {
            error!(%e, "TUN write failed, router stopping");
            break;
        }
    }
    debug!("TUN writer task ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::registry::SessionHandle;
    use crate::tun::TunIf;
    use tokio::time::{timeout, Duration};

    fn ipv4_packet(src: [u8; 4], dst: [u8; 4], len: usize) -> Bytes {
        let mut pkt = vec![0u8; len.max(IPV4_HEADER_LEN)];
        pkt[0] = 0x45;
        pkt[12..16].copy_from_slice(&src);
        pkt[16..20].copy_from_slice(&dst);
        Bytes::from(pkt)
    }

    #[test]
    fn address_extraction() {
        let pkt = ipv4_packet([10, 8, 0, 2], [8, 8, 8, 8], 40);
        assert_eq!(ipv4_source(&pkt), Some(Ipv4Addr::new(10, 8, 0, 2)));
        assert_eq!(ipv4_destination(&pkt), Some(Ipv4Addr::new(8, 8, 8, 8)));
    }

    #[test]
    fn runt_packets_have_no_addresses() {
        assert_eq!(ipv4_destination(&[0x45u8; 19]), None);
        assert_eq!(ipv4_source(&[]), None);
    }

    #[test]
    fn non_ipv4_packets_have_no_addresses() {
        let mut pkt = vec![0u8; 40];
        pkt[0] = 0x60; // IPv6
        assert_eq!(ipv4_destination(&pkt), None);
    }

    #[tokio::test]
    async fn reader_routes_by_destination() {
        let registry = Arc::new(SessionRegistry::new());
        let (tx, mut session_rx) = mpsc::channel(8);
        let handle = Arc::new(SessionHandle::new("s1".into(), "peer".into(), tx));
        registry.register(handle).await;
        registry
            .bind_ip("s1", Ipv4Addr::new(10, 8, 0, 2))
            .await
            .unwrap();

        let (tun, mock) = TunIf::mock();
        let (reader, _writer) = tun.split();
        let task = tokio::spawn(tun_reader_task(reader, registry));

        // One packet for the session, one for an unknown address
        mock.inject
            .send(ipv4_packet([8, 8, 8, 8], [10, 8, 0, 2], 200))
            .await
            .unwrap();
        mock.inject
            .send(ipv4_packet([8, 8, 8, 8], [10, 8, 0, 99], 200))
            .await
            .unwrap();

        let delivered = timeout(Duration::from_secs(1), session_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ipv4_destination(&delivered), Some(Ipv4Addr::new(10, 8, 0, 2)));
        assert_eq!(delivered.len(), 200);

        // The unknown-destination packet must not arrive
        assert!(
            timeout(Duration::from_millis(50), session_rx.recv())
                .await
                .is_err()
        );

        drop(mock.inject);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn writer_forwards_session_packets() {
        let (tun, mut mock) = TunIf::mock();
        let (_reader, writer) = tun.split();
        let (tx, rx) = mpsc::channel(8);
        let task = tokio::spawn(tun_writer_task(writer, rx, false));

        let pkt = ipv4_packet([10, 8, 0, 2], [1, 1, 1, 1], 60);
        tx.send((Ipv4Addr::new(10, 8, 0, 2), pkt.clone()))
            .await
            .unwrap();

        let written = timeout(Duration::from_secs(1), mock.written.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(written, pkt);

        drop(tx);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn writer_drops_runts() {
        let (tun, mut mock) = TunIf::mock();
        let (_reader, writer) = tun.split();
        let (tx, rx) = mpsc::channel(8);
        let task = tokio::spawn(tun_writer_task(writer, rx, false));

        tx.send((Ipv4Addr::new(10, 8, 0, 2), Bytes::from_static(&[0x45; 10])))
            .await
            .unwrap();
        tx.send((
            Ipv4Addr::new(10, 8, 0, 2),
            ipv4_packet([10, 8, 0, 2], [1, 1, 1, 1], 40),
        ))
        .await
        .unwrap();

        // Only the well-formed packet reaches the device
        let written = timeout(Duration::from_secs(1), mock.written.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(written.len(), 40);

        drop(tx);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn anti_spoof_drops_mismatched_source() {
        let (tun, mut mock) = TunIf::mock();
        let (_reader, writer) = tun.split();
        let (tx, rx) = mpsc::channel(8);
        let task = tokio::spawn(tun_writer_task(writer, rx, true));

        // Source claims .3 but the session owns .2
        tx.send((
            Ipv4Addr::new(10, 8, 0, 2),
            ipv4_packet([10, 8, 0, 3], [1, 1, 1, 1], 40),
        ))
        .await
        .unwrap();
        tx.send((
            Ipv4Addr::new(10, 8, 0, 2),
            ipv4_packet([10, 8, 0, 2], [1, 1, 1, 1], 40),
        ))
        .await
        .unwrap();

        let written = timeout(Duration::from_secs(1), mock.written.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ipv4_source(&written), Some(Ipv4Addr::new(10, 8, 0, 2)));

        drop(tx);
        task.await.unwrap();
    }
}
