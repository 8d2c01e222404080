//! VPN server runtime.
//!
//! Components:
//! - IP pool (per-client address leases)
//! - Session registry (live sessions by id and by assigned IP)
//! - Session (per-connection state machine)
//! - Packet router (TUN <-> session forwarding)
//! - Listener/supervisor (TLS accept, sweeper, shutdown)

pub mod ip_pool;
pub mod listener;
pub mod registry;
pub mod router;
pub mod session;
pub mod tls;

pub use ip_pool::{IpPool, PoolStats};
pub use listener::VpnServer;
pub use registry::{SessionHandle, SessionRegistry, SessionState, SessionStats};
pub use router::{tun_reader_task, tun_writer_task, OutboundPacket};
pub use session::Session;

use crate::auth::AuthService;
use crate::config::Config;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

/// Cadence of the per-session idle check
pub const KEEPALIVE_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Idle time after which the server probes the client with a KEEPALIVE
pub const KEEPALIVE_PROBE_AFTER: Duration = Duration::from_secs(30);

/// Idle time after which a session is disconnected
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// How long shutdown waits for sessions to drain before hard-closing
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Cadence of the stale-session sweeper
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Persisted sessions idle beyond this many minutes are swept
pub const STALE_SESSION_MINUTES: i64 = 5;

/// Depth of each session's inbound packet channel
pub const SESSION_CHANNEL_DEPTH: usize = 256;

/// Depth of the shared session-to-TUN channel
pub const TO_TUN_CHANNEL_DEPTH: usize = 4096;

/// Shared server state handed to every session task
pub struct ServerState {
    pub config: Arc<Config>,
    pub pool: Mutex<IpPool>,
    pub registry: Arc<SessionRegistry>,
    pub auth: AuthService,
    pub to_tun: mpsc::Sender<OutboundPacket>,
}

impl ServerState {
    pub fn new(
        config: Arc<Config>,
        auth: AuthService,
        to_tun: mpsc::Sender<OutboundPacket>,
    ) -> Self {
        Self {
            pool: Mutex::new(IpPool::new(config.subnet)),
            registry: Arc::new(SessionRegistry::new()),
            config,
            auth,
            to_tun,
        }
    }
}

/// Generate a unique session identifier (hex timestamp plus randomness)
pub fn generate_session_id() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let random: u64 = rand::random();
    format!("{timestamp:x}{random:016x}")
}

/// Detect the default outbound interface from the system routing table
pub fn detect_default_iface() -> Option<String> {
    use std::process::Command;
    let output = Command::new("ip")
        .args(["route", "show", "default"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    for line in stdout.lines() {
        let mut parts = line.split_whitespace();
        while let Some(tok) = parts.next() {
            if tok == "dev" {
                if let Some(iface) = parts.next() {
                    return Some(iface.to_string());
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_are_unique() {
        let a = generate_session_id();
        let b = generate_session_id();
        assert_ne!(a, b);
        assert!(a.len() > 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
