//! Authentication service.
//!
//! Stateless facade over the user repository: verifies credentials,
//! enforces the per-user concurrency cap, mints signed session tokens,
//! and owns the persisted-session row lifecycle. Every authentication
//! outcome, including failures, is appended to the connection log.

mod password;
mod token;

pub use password::{hash as hash_password, verify as verify_password};
pub use token::{TokenClaims, TokenSigner, TOKEN_TTL_SECS};

use crate::store::{EventType, NewEvent, SessionRecord, Store};
use anyhow::Result;
use chrono::Utc;
use std::net::Ipv4Addr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, warn};

/// Authentication failure, with the client-facing message as its display
/// form.
///
/// Absent users and wrong passwords both surface as `InvalidCredentials`;
/// the distinction only reaches the connection log.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("Invalid credentials")]
    InvalidCredentials,
    #[error("Account is disabled")]
    AccountDisabled,
    #[error("Maximum connections reached")]
    MaxConnections,
    #[error("Internal server error")]
    Internal,
}

impl AuthError {
    /// Protocol error code for this failure
    pub fn code(&self) -> u16 {
        use crate::protocol::error_code;
        match self {
            AuthError::InvalidCredentials => error_code::INVALID_CREDENTIALS,
            AuthError::AccountDisabled => error_code::ACCOUNT_DISABLED,
            AuthError::MaxConnections => error_code::MAX_CONNECTIONS,
            AuthError::Internal => error_code::INTERNAL_ERROR,
        }
    }
}

/// Successful authentication result
#[derive(Debug, Clone)]
pub struct AuthGrant {
    pub user_id: i64,
    pub token: String,
}

/// The authentication facade
pub struct AuthService {
    store: Arc<dyn Store>,
    tokens: TokenSigner,
}

impl AuthService {
    pub fn new(store: Arc<dyn Store>, token_secret: &str) -> Self {
        Self {
            store,
            tokens: TokenSigner::new(token_secret),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Verify credentials and mint a session token.
    ///
    /// Fails closed on repository errors: a database outage reads as an
    /// internal error, never as a successful login.
    pub async fn authenticate(
        &self,
        username: &str,
        password: &str,
        platform: &str,
        peer_addr: &str,
    ) -> Result<AuthGrant, AuthError> {
        let user = match self.store.user_by_username(username).await {
            Ok(user) => user,
            Err(e) => {
                error!(%e, "user lookup failed");
                self.log_auth_fail(None, peer_addr, platform, "Database error")
                    .await;
                return Err(AuthError::Internal);
            }
        };

        let Some(user) = user else {
            self.log_auth_fail(None, peer_addr, platform, "User not found")
                .await;
            return Err(AuthError::InvalidCredentials);
        };

        if !verify_password(&user.password_hash, password) {
            self.log_auth_fail(Some(user.id), peer_addr, platform, "Wrong password")
                .await;
            return Err(AuthError::InvalidCredentials);
        }

        if !user.is_active {
            self.log_auth_fail(Some(user.id), peer_addr, platform, "Account disabled")
                .await;
            return Err(AuthError::AccountDisabled);
        }

        match self.store.active_session_count(user.id).await {
            Ok(count) if count >= user.max_connections as u32 => {
                self.log_auth_fail(Some(user.id), peer_addr, platform, "Max connections")
                    .await;
                return Err(AuthError::MaxConnections);
            }
            Ok(_) => {}
            Err(e) => {
                error!(%e, "session count lookup failed");
                self.log_auth_fail(Some(user.id), peer_addr, platform, "Database error")
                    .await;
                return Err(AuthError::Internal);
            }
        }

        let token = match self.tokens.issue(user.id, &user.username, platform) {
            Ok(token) => token,
            Err(e) => {
                error!(%e, "token signing failed");
                return Err(AuthError::Internal);
            }
        };

        self.log_event(NewEvent {
            user_id: Some(user.id),
            event: EventType::Connect,
            peer_addr,
            platform: Some(platform),
            details: None,
        })
        .await;

        Ok(AuthGrant {
            user_id: user.id,
            token,
        })
    }

    /// Persist a new session row; returns its id
    pub async fn create_session(
        &self,
        user_id: i64,
        assigned_ip: Ipv4Addr,
        platform: &str,
        peer_addr: &str,
        client_version: &str,
    ) -> Result<String> {
        let now = Utc::now();
        let record = SessionRecord {
            id: crate::server::generate_session_id(),
            user_id,
            assigned_ip: assigned_ip.to_string(),
            peer_addr: peer_addr.to_string(),
            platform: platform.to_string(),
            client_version: client_version.to_string(),
            connected_at: now,
            last_activity: now,
            bytes_sent: 0,
            bytes_received: 0,
        };
        self.store.insert_session(&record).await?;
        Ok(record.id)
    }

    /// Bump a session row's last-activity timestamp
    pub async fn update_session_activity(&self, id: &str) -> Result<()> {
        self.store.touch_session(id).await
    }

    /// Add byte counters to a session row
    pub async fn update_session_stats(&self, id: &str, sent: u64, received: u64) -> Result<()> {
        self.store.add_session_stats(id, sent, received).await
    }

    /// Remove a session row and append a disconnect event
    pub async fn end_session(&self, id: &str) -> Result<()> {
        if let Some(record) = self.store.remove_session(id).await? {
            self.log_event(NewEvent {
                user_id: Some(record.user_id),
                event: EventType::Disconnect,
                peer_addr: &record.peer_addr,
                platform: Some(&record.platform),
                details: None,
            })
            .await;
        }
        Ok(())
    }

    /// Drop session rows idle beyond the threshold; returns the count
    pub async fn cleanup_stale_sessions(&self, max_idle_minutes: i64) -> Result<u64> {
        self.store.remove_stale_sessions(max_idle_minutes).await
    }

    /// Append an error event (IP exhaustion, internal faults)
    pub async fn record_error(
        &self,
        user_id: Option<i64>,
        peer_addr: &str,
        platform: Option<&str>,
        details: &str,
    ) {
        self.log_event(NewEvent {
            user_id,
            event: EventType::Error,
            peer_addr,
            platform,
            details: Some(details),
        })
        .await;
    }

    async fn log_auth_fail(
        &self,
        user_id: Option<i64>,
        peer_addr: &str,
        platform: &str,
        details: &str,
    ) {
        self.log_event(NewEvent {
            user_id,
            event: EventType::AuthFail,
            peer_addr,
            platform: Some(platform),
            details: Some(details),
        })
        .await;
    }

    /// Event logging is best-effort; a failed insert must not fail the
    /// operation being logged
    async fn log_event(&self, event: NewEvent<'_>) {
        if let Err(e) = self.store.append_event(event).await {
            warn!(%e, "connection log append failed");
        }
    }
}
