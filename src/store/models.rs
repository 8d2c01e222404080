//! Row types for the relational store.

use chrono::{DateTime, Utc};

/// A user account (read-only to the tunnel runtime)
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub username: String,
    /// Argon2 PHC-string verifier
    pub password_hash: String,
    pub is_active: bool,
    /// Maximum simultaneous sessions for this account
    pub max_connections: i32,
}

/// A persisted VPN session row: created at authentication, updated on
/// activity, removed at termination
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SessionRecord {
    pub id: String,
    pub user_id: i64,
    pub assigned_ip: String,
    pub peer_addr: String,
    pub platform: String,
    pub client_version: String,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub bytes_sent: i64,
    pub bytes_received: i64,
}

/// Connection-log event classes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Connect,
    Disconnect,
    AuthFail,
    Error,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Connect => "connect",
            EventType::Disconnect => "disconnect",
            EventType::AuthFail => "auth_fail",
            EventType::Error => "error",
        }
    }
}

/// One connection-log row to append
#[derive(Debug, Clone)]
pub struct NewEvent<'a> {
    pub user_id: Option<i64>,
    pub event: EventType,
    pub peer_addr: &'a str,
    pub platform: Option<&'a str>,
    pub details: Option<&'a str>,
}
