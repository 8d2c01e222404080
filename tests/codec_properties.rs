//! Property tests for the frame codec and the IP pool.

use bytes::BytesMut;
use proptest::prelude::*;
use std::net::Ipv4Addr;
use traverse_core::protocol::{
    decode_all, decode_one, encode, Decoded, FrameBuffer, MessageType, HEADER_LEN, MAX_PAYLOAD,
};
use traverse_core::server::IpPool;

const KNOWN_TAGS: [MessageType; 8] = [
    MessageType::AuthRequest,
    MessageType::AuthResponse,
    MessageType::ConfigPush,
    MessageType::Keepalive,
    MessageType::KeepaliveAck,
    MessageType::Disconnect,
    MessageType::Error,
    MessageType::DataPacket,
];

fn arb_message() -> impl Strategy<Value = (MessageType, Vec<u8>)> {
    (0..KNOWN_TAGS.len(), prop::collection::vec(any::<u8>(), 0..512))
        .prop_map(|(idx, payload)| (KNOWN_TAGS[idx], payload))
}

proptest! {
    /// encode ∘ decode_one is the identity on well-formed messages
    #[test]
    fn encode_decode_identity(message in arb_message()) {
        let (kind, payload) = message;
        let wire = encode(kind, &payload).unwrap();
        prop_assert_eq!(wire.len(), HEADER_LEN + payload.len());

        match decode_one(&wire, MAX_PAYLOAD).unwrap() {
            Decoded::Frame(msg, consumed) => {
                prop_assert_eq!(consumed, wire.len());
                prop_assert_eq!(msg.kind(), Some(kind));
                prop_assert_eq!(&msg.payload[..], &payload[..]);
            }
            Decoded::NeedMore(_) => prop_assert!(false, "complete frame reported incomplete"),
        }
    }

    /// Any fragmentation of a frame stream yields the same messages in
    /// order, with the trailing partial frame left as residual
    #[test]
    fn fragmentation_is_transparent(
        messages in prop::collection::vec(arb_message(), 0..8),
        splits in prop::collection::vec(any::<prop::sample::Index>(), 0..12),
        partial in arb_message(),
        partial_keep in any::<prop::sample::Index>(),
    ) {
        let mut stream = Vec::new();
        for (kind, payload) in &messages {
            stream.extend_from_slice(&encode(*kind, payload).unwrap());
        }

        // Residual: a strict prefix of one more valid frame
        let partial_wire = encode(partial.0, &partial.1).unwrap();
        let keep = partial_keep.index(partial_wire.len().max(1)).min(partial_wire.len().saturating_sub(1));
        stream.extend_from_slice(&partial_wire[..keep]);

        // Fragment boundaries anywhere in the byte stream
        let mut cuts: Vec<usize> = splits.iter().map(|i| i.index(stream.len() + 1)).collect();
        cuts.push(0);
        cuts.push(stream.len());
        cuts.sort_unstable();
        cuts.dedup();

        let mut buffer = FrameBuffer::new(MAX_PAYLOAD);
        let mut decoded = Vec::new();
        for pair in cuts.windows(2) {
            buffer.extend(&stream[pair[0]..pair[1]]);
            decoded.extend(buffer.drain().unwrap());
        }

        prop_assert_eq!(decoded.len(), messages.len());
        for (msg, (kind, payload)) in decoded.iter().zip(&messages) {
            prop_assert_eq!(msg.kind(), Some(*kind));
            prop_assert_eq!(&msg.payload[..], &payload[..]);
        }
        prop_assert_eq!(buffer.residual_len(), keep);
    }

    /// decode_all never leaves a complete frame in the buffer
    #[test]
    fn decode_all_is_exhaustive(messages in prop::collection::vec(arb_message(), 1..6)) {
        let mut buf = BytesMut::new();
        for (kind, payload) in &messages {
            buf.extend_from_slice(&encode(*kind, payload).unwrap());
        }

        let decoded = decode_all(&mut buf, MAX_PAYLOAD).unwrap();
        prop_assert_eq!(decoded.len(), messages.len());
        prop_assert_eq!(buf.len(), 0);
    }

    /// Pool invariant: no interleaving of allocate/release leases the
    /// network, broadcast, or gateway address, or exceeds capacity
    #[test]
    fn pool_never_leases_reserved_addresses(
        ops in prop::collection::vec(any::<(bool, prop::sample::Index)>(), 1..200),
    ) {
        let network: ipnetwork::Ipv4Network = "10.8.0.0/26".parse().unwrap();
        let mut pool = IpPool::new(network);
        let capacity = pool.stats().capacity; // 62 hosts, gateway included
        let mut leased = Vec::new();

        for (is_alloc, pick) in ops {
            if is_alloc {
                if let Some(ip) = pool.allocate() {
                    prop_assert_ne!(ip, Ipv4Addr::new(10, 8, 0, 0), "network leased");
                    prop_assert_ne!(ip, Ipv4Addr::new(10, 8, 0, 63), "broadcast leased");
                    prop_assert_ne!(ip, Ipv4Addr::new(10, 8, 0, 1), "gateway leased");
                    prop_assert!(!leased.contains(&ip), "address double-leased");
                    leased.push(ip);
                }
            } else if !leased.is_empty() {
                let ip = leased.remove(pick.index(leased.len()));
                pool.release(ip);
            }

            // Client leases never exceed capacity minus the gateway
            prop_assert!(leased.len() <= capacity - 1);
            prop_assert_eq!(pool.stats().used, leased.len() + 1);
        }
    }

    /// Released addresses become allocatable again, lowest-first
    #[test]
    fn pool_allocation_is_deterministic(count in 1usize..30) {
        let network: ipnetwork::Ipv4Network = "10.8.0.0/24".parse().unwrap();
        let mut pool = IpPool::new(network);

        let first: Vec<_> = (0..count).map(|_| pool.allocate().unwrap()).collect();
        for ip in &first {
            pool.release(*ip);
        }
        let second: Vec<_> = (0..count).map(|_| pool.allocate().unwrap()).collect();

        prop_assert_eq!(first, second);
    }
}
