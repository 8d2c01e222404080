//! Live-session registry.
//!
//! Two indices over the same handles: by session id (every live session)
//! and by assigned IPv4 (active sessions only). The packet router resolves
//! reverse-path lookups through the IP index, so a session must be removed
//! here before its receive channel is dropped.

use anyhow::{bail, Result};
use bytes::Bytes;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;

/// Session lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Authenticating,
    Authenticated,
    Active,
    Disconnecting,
    Disconnected,
}

/// Tunnel byte counters and activity clock for one session.
///
/// Counters measure full wire bytes (frame headers included) in the
/// server-to-client and client-to-server directions. Both are monotonic.
#[derive(Debug)]
pub struct SessionStats {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    connected_at: Instant,
    last_activity: Mutex<Instant>,
}

impl SessionStats {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            connected_at: now,
            last_activity: Mutex::new(now),
        }
    }

    pub fn add_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn add_received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    /// Reset the idle clock (inbound traffic observed)
    pub fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    /// Time since the last inbound activity
    pub fn idle(&self) -> std::time::Duration {
        self.last_activity.lock().unwrap().elapsed()
    }
}

impl Default for SessionStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared view of one live session.
///
/// The session task owns the TLS stream; everything else (the router, the
/// supervisor, admin snapshots) goes through this handle. Packets pushed
/// into `data_tx` are framed and written by the session task, which keeps
/// the stream single-writer.
#[derive(Debug)]
pub struct SessionHandle {
    pub id: String,
    pub peer_addr: String,
    pub data_tx: mpsc::Sender<Bytes>,
    pub stats: SessionStats,
    state: Mutex<SessionState>,
    assigned_ip: Mutex<Option<Ipv4Addr>>,
    record_id: Mutex<Option<String>>,
}

impl SessionHandle {
    pub fn new(id: String, peer_addr: String, data_tx: mpsc::Sender<Bytes>) -> Self {
        Self {
            id,
            peer_addr,
            data_tx,
            stats: SessionStats::new(),
            state: Mutex::new(SessionState::Connected),
            assigned_ip: Mutex::new(None),
            record_id: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    pub fn set_state(&self, state: SessionState) {
        *self.state.lock().unwrap() = state;
    }

    pub fn assigned_ip(&self) -> Option<Ipv4Addr> {
        *self.assigned_ip.lock().unwrap()
    }

    pub fn set_assigned_ip(&self, ip: Option<Ipv4Addr>) {
        *self.assigned_ip.lock().unwrap() = ip;
    }

    /// Persisted session row id, once authentication has created one
    pub fn record_id(&self) -> Option<String> {
        self.record_id.lock().unwrap().clone()
    }

    pub fn set_record_id(&self, id: Option<String>) {
        *self.record_id.lock().unwrap() = id;
    }
}

#[derive(Debug, Default)]
struct Indices {
    by_id: HashMap<String, Arc<SessionHandle>>,
    by_ip: HashMap<Ipv4Addr, Arc<SessionHandle>>,
}

/// Registry of live sessions, serialized behind one lock.
///
/// Lookups return cloned `Arc` handles; the lock is never held across
/// session I/O.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    inner: RwLock<Indices>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index a freshly accepted session by id
    pub async fn register(&self, handle: Arc<SessionHandle>) {
        self.inner
            .write()
            .await
            .by_id
            .insert(handle.id.clone(), handle);
    }

    /// Add an authenticated session to the IP index and mark it active.
    ///
    /// Fails on an address collision, which would mean the pool leased one
    /// address twice.
    pub async fn bind_ip(&self, id: &str, ip: Ipv4Addr) -> Result<()> {
        let mut inner = self.inner.write().await;
        let Some(handle) = inner.by_id.get(id).cloned() else {
            bail!("session {id} is not registered");
        };
        if let Some(existing) = inner.by_ip.get(&ip) {
            bail!("address {ip} already bound to session {}", existing.id);
        }
        handle.set_assigned_ip(Some(ip));
        handle.set_state(SessionState::Active);
        inner.by_ip.insert(ip, handle);
        Ok(())
    }

    /// Remove a session from both indices
    pub async fn unregister(&self, id: &str) -> Option<Arc<SessionHandle>> {
        let mut inner = self.inner.write().await;
        let handle = inner.by_id.remove(id)?;
        if let Some(ip) = handle.assigned_ip() {
            // Only drop the IP entry if it still points at this session;
            // the address may have been re-leased to a newer one.
            if inner.by_ip.get(&ip).is_some_and(|h| h.id == handle.id) {
                inner.by_ip.remove(&ip);
            }
        }
        Some(handle)
    }

    pub async fn lookup_by_id(&self, id: &str) -> Option<Arc<SessionHandle>> {
        self.inner.read().await.by_id.get(id).cloned()
    }

    pub async fn lookup_by_ip(&self, ip: Ipv4Addr) -> Option<Arc<SessionHandle>> {
        self.inner.read().await.by_ip.get(&ip).cloned()
    }

    /// Snapshot of every live session
    pub async fn all(&self) -> Vec<Arc<SessionHandle>> {
        self.inner.read().await.by_id.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.by_id.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.by_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(id: &str) -> Arc<SessionHandle> {
        let (tx, _rx) = mpsc::channel(1);
        Arc::new(SessionHandle::new(id.into(), "127.0.0.1:5000".into(), tx))
    }

    #[tokio::test]
    async fn register_then_bind_then_unregister() {
        let registry = SessionRegistry::new();
        let h = handle("s1");
        let ip = Ipv4Addr::new(10, 8, 0, 2);

        registry.register(h.clone()).await;
        assert!(registry.lookup_by_id("s1").await.is_some());
        assert!(registry.lookup_by_ip(ip).await.is_none());

        registry.bind_ip("s1", ip).await.unwrap();
        let found = registry.lookup_by_ip(ip).await.unwrap();
        assert_eq!(found.id, "s1");
        assert_eq!(found.state(), SessionState::Active);
        assert_eq!(found.assigned_ip(), Some(ip));

        let removed = registry.unregister("s1").await.unwrap();
        assert_eq!(removed.id, "s1");
        assert!(registry.lookup_by_id("s1").await.is_none());
        assert!(registry.lookup_by_ip(ip).await.is_none());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn bind_rejects_address_collision() {
        let registry = SessionRegistry::new();
        let ip = Ipv4Addr::new(10, 8, 0, 2);

        registry.register(handle("a")).await;
        registry.register(handle("b")).await;
        registry.bind_ip("a", ip).await.unwrap();
        assert!(registry.bind_ip("b", ip).await.is_err());
    }

    #[tokio::test]
    async fn bind_requires_registration() {
        let registry = SessionRegistry::new();
        assert!(registry
            .bind_ip("ghost", Ipv4Addr::new(10, 8, 0, 2))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn unregister_keeps_reassigned_address() {
        let registry = SessionRegistry::new();
        let ip = Ipv4Addr::new(10, 8, 0, 2);

        let old = handle("old");
        registry.register(old.clone()).await;
        registry.bind_ip("old", ip).await.unwrap();

        // The address is released and re-leased before the old session's
        // teardown reaches the registry.
        registry.inner.write().await.by_ip.remove(&ip);
        let fresh = handle("fresh");
        registry.register(fresh.clone()).await;
        registry.bind_ip("fresh", ip).await.unwrap();

        registry.unregister("old").await;
        let found = registry.lookup_by_ip(ip).await.unwrap();
        assert_eq!(found.id, "fresh");
    }

    #[test]
    fn stats_are_monotonic() {
        let stats = SessionStats::new();
        stats.add_sent(205);
        stats.add_sent(5);
        stats.add_received(100);
        assert_eq!(stats.bytes_sent(), 210);
        assert_eq!(stats.bytes_received(), 100);
    }
}
