//! Narrow repository interface to the relational store.
//!
//! The tunnel runtime only ever sees this trait. Production wires in the
//! Postgres implementation; tests use the in-memory one.

mod memory;
mod models;
mod postgres;

pub use memory::{LoggedEvent, MemoryStore};
pub use models::{EventType, NewEvent, SessionRecord, User};
pub use postgres::PgStore;

use anyhow::Result;
use async_trait::async_trait;

/// Repository surface required by the tunnel runtime
#[async_trait]
pub trait Store: Send + Sync {
    /// Load a user by unique username
    async fn user_by_username(&self, username: &str) -> Result<Option<User>>;

    /// Count persisted sessions currently owned by a user
    async fn active_session_count(&self, user_id: i64) -> Result<u32>;

    /// Insert a freshly created session row
    async fn insert_session(&self, record: &SessionRecord) -> Result<()>;

    /// Bump a session's last-activity timestamp
    async fn touch_session(&self, id: &str) -> Result<()>;

    /// Atomically add byte counters to a session row
    async fn add_session_stats(&self, id: &str, sent: u64, received: u64) -> Result<()>;

    /// Delete a session row, returning it if present
    async fn remove_session(&self, id: &str) -> Result<Option<SessionRecord>>;

    /// Delete sessions idle longer than `max_idle_minutes`; returns the count
    async fn remove_stale_sessions(&self, max_idle_minutes: i64) -> Result<u64>;

    /// Append a connection-log row
    async fn append_event(&self, event: NewEvent<'_>) -> Result<()>;
}
