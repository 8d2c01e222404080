//! In-memory repository for tests.
//!
//! Mirrors the Postgres behavior over HashMaps. Also records every
//! appended connection-log row so tests can assert on event history.

use super::models::{EventType, NewEvent, SessionRecord, User};
use super::Store;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;

/// Owned copy of a logged event
#[derive(Debug, Clone)]
pub struct LoggedEvent {
    pub user_id: Option<i64>,
    pub event: EventType,
    pub peer_addr: String,
    pub platform: Option<String>,
    pub details: Option<String>,
}

#[derive(Debug, Default)]
struct Tables {
    users: HashMap<String, User>,
    sessions: HashMap<String, SessionRecord>,
    events: Vec<LoggedEvent>,
    next_user_id: i64,
}

/// In-memory store implementation
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a user with a pre-computed password verifier; returns the id
    pub async fn add_user(
        &self,
        username: &str,
        password_hash: &str,
        is_active: bool,
        max_connections: i32,
    ) -> i64 {
        let mut tables = self.tables.lock().await;
        tables.next_user_id += 1;
        let id = tables.next_user_id;
        tables.users.insert(
            username.to_string(),
            User {
                id,
                username: username.to_string(),
                password_hash: password_hash.to_string(),
                is_active,
                max_connections,
            },
        );
        id
    }

    /// Snapshot of every logged event, in append order
    pub async fn events(&self) -> Vec<LoggedEvent> {
        self.tables.lock().await.events.clone()
    }

    /// Snapshot of one session row
    pub async fn session(&self, id: &str) -> Option<SessionRecord> {
        self.tables.lock().await.sessions.get(id).cloned()
    }

    /// Number of persisted session rows
    pub async fn session_count(&self) -> usize {
        self.tables.lock().await.sessions.len()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn user_by_username(&self, username: &str) -> Result<Option<User>> {
        Ok(self.tables.lock().await.users.get(username).cloned())
    }

    async fn active_session_count(&self, user_id: i64) -> Result<u32> {
        let tables = self.tables.lock().await;
        Ok(tables
            .sessions
            .values()
            .filter(|s| s.user_id == user_id)
            .count() as u32)
    }

    async fn insert_session(&self, record: &SessionRecord) -> Result<()> {
        self.tables
            .lock()
            .await
            .sessions
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn touch_session(&self, id: &str) -> Result<()> {
        if let Some(session) = self.tables.lock().await.sessions.get_mut(id) {
            session.last_activity = Utc::now();
        }
        Ok(())
    }

    async fn add_session_stats(&self, id: &str, sent: u64, received: u64) -> Result<()> {
        if let Some(session) = self.tables.lock().await.sessions.get_mut(id) {
            session.bytes_sent += sent as i64;
            session.bytes_received += received as i64;
        }
        Ok(())
    }

    async fn remove_session(&self, id: &str) -> Result<Option<SessionRecord>> {
        Ok(self.tables.lock().await.sessions.remove(id))
    }

    async fn remove_stale_sessions(&self, max_idle_minutes: i64) -> Result<u64> {
        let cutoff = Utc::now() - Duration::minutes(max_idle_minutes);
        let mut tables = self.tables.lock().await;
        let stale: Vec<String> = tables
            .sessions
            .iter()
            .filter(|(_, s)| s.last_activity < cutoff)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            tables.sessions.remove(id);
        }
        Ok(stale.len() as u64)
    }

    async fn append_event(&self, event: NewEvent<'_>) -> Result<()> {
        self.tables.lock().await.events.push(LoggedEvent {
            user_id: event.user_id,
            event: event.event,
            peer_addr: event.peer_addr.to_string(),
            platform: event.platform.map(str::to_string),
            details: event.details.map(str::to_string),
        });
        Ok(())
    }
}
