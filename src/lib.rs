//! # Traverse Core
//!
//! Server-side tunnel runtime for the Traverse VPN. Clients connect over
//! TLS-wrapped TCP, authenticate in-band against a relational user store,
//! receive a private IPv4 address, and exchange raw IP datagrams with a
//! host TUN interface so their traffic egresses from the server.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      VPN Server                          │
//! │                                                          │
//! │  TLS accept ──▶ Session ──▶ Auth ──▶ IP pool             │
//! │                    │                    │                │
//! │                    ▼                    ▼                │
//! │              Frame codec         Session registry        │
//! │                    │                    │                │
//! │                    └──── Packet router ─┘                │
//! │                              │                           │
//! │                         TUN device ──▶ NAT ──▶ internet  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! The wire protocol is a 5-byte framed stream: one type byte, a big-endian
//! `u32` payload length, then the payload. Control payloads are JSON;
//! `DATA_PACKET` frames carry raw IPv4 datagrams.

/// Authentication service: credentials, concurrency caps, session tokens
pub mod auth;
/// Process configuration (environment variables + CLI flags)
pub mod config;
/// Wire protocol: message types, control payloads, frame codec
pub mod protocol;
/// Server runtime: sessions, registry, IP pool, router, listener
pub mod server;
/// Relational store repository (users, sessions, connection logs)
pub mod store;
/// TUN interface capability (kernel and mock variants)
pub mod tun;

pub use config::Config;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
