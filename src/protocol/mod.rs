//! Wire protocol for the tunnel.
//!
//! Every message on the wire is `type(1) || length_be(4) || payload`.
//! Control payloads (tags 0x01–0x0F) are UTF-8 JSON with the structures
//! below; `DATA_PACKET` carries one raw IPv4 datagram. `KEEPALIVE`,
//! `KEEPALIVE_ACK` and `DISCONNECT` have empty payloads.

mod codec;

pub use codec::{Decoded, FrameBuffer, FrameError, decode_all, decode_one, encode};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};

/// Wire frame header size: type byte plus big-endian u32 payload length
pub const HEADER_LEN: usize = 5;

/// Maximum accepted payload size (64 KiB)
pub const MAX_PAYLOAD: usize = 64 * 1024;

/// Known message type tags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    AuthRequest = 0x01,
    AuthResponse = 0x02,
    ConfigPush = 0x03,
    Keepalive = 0x04,
    KeepaliveAck = 0x05,
    Disconnect = 0x06,
    Error = 0x0F,
    DataPacket = 0x10,
}

impl MessageType {
    /// Map a raw tag to a known message type
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0x01 => Some(MessageType::AuthRequest),
            0x02 => Some(MessageType::AuthResponse),
            0x03 => Some(MessageType::ConfigPush),
            0x04 => Some(MessageType::Keepalive),
            0x05 => Some(MessageType::KeepaliveAck),
            0x06 => Some(MessageType::Disconnect),
            0x0F => Some(MessageType::Error),
            0x10 => Some(MessageType::DataPacket),
            _ => None,
        }
    }

    /// Whether a raw tag falls in the control range (0x01–0x0F)
    pub fn is_control_tag(tag: u8) -> bool {
        (0x01..=0x0F).contains(&tag)
    }
}

/// One decoded wire message.
///
/// The raw tag is preserved so that frames with tags outside the known set
/// can be consumed and skipped by policy instead of killing the stream.
#[derive(Debug, Clone)]
pub struct Message {
    pub tag: u8,
    pub payload: Bytes,
}

impl Message {
    /// Known message type for this tag, if any
    pub fn kind(&self) -> Option<MessageType> {
        MessageType::from_tag(self.tag)
    }

    /// Total on-wire size of this message (header + payload)
    pub fn wire_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }
}

/// `AUTH_REQUEST` payload: in-band credentials plus client metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthRequest {
    pub username: String,
    pub password: String,
    pub client_version: String,
    /// One of "ios", "android", "macos", "windows"
    pub platform: String,
}

/// `AUTH_RESPONSE` payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
}

impl AuthResponse {
    pub fn granted(token: impl Into<String>) -> Self {
        Self {
            success: true,
            error_message: None,
            session_token: Some(token.into()),
        }
    }

    pub fn denied(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error_message: Some(message.into()),
            session_token: None,
        }
    }
}

/// `CONFIG_PUSH` payload: tunnel parameters handed to an authenticated client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigPush {
    #[serde(rename = "assignedIP")]
    pub assigned_ip: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub dns: Vec<IpAddr>,
    pub mtu: u16,
    /// Seconds between client keepalive probes
    pub keepalive_interval: u64,
}

/// `ERROR` payload (server to client only)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: u16,
    pub message: String,
}

/// Error codes carried in `ERROR` payloads
pub mod error_code {
    pub const INVALID_CREDENTIALS: u16 = 1001;
    pub const ACCOUNT_DISABLED: u16 = 1002;
    pub const MAX_CONNECTIONS: u16 = 1003;
    pub const IP_POOL_EXHAUSTED: u16 = 1004;
    pub const INTERNAL_ERROR: u16 = 1005;
    pub const SESSION_TIMEOUT: u16 = 1006;
}
