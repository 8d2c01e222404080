//! Postgres implementation of the repository.

use super::models::{NewEvent, SessionRecord, User};
use super::Store;
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};

/// Repository backed by a pooled Postgres connection
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect with a bounded pool
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .context("connecting to database")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Close all pooled connections; part of orderly shutdown
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl Store for PgStore {
    async fn user_by_username(&self, username: &str) -> Result<Option<User>> {
        sqlx::query_as::<_, User>(
            "SELECT id, username, password_hash, is_active, max_connections \
             FROM users WHERE username = $1",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await
        .context("loading user")
    }

    async fn active_session_count(&self, user_id: i64) -> Result<u32> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sessions WHERE user_id = $1")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await
            .context("counting sessions")?;
        Ok(count as u32)
    }

    async fn insert_session(&self, record: &SessionRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO sessions \
             (id, user_id, assigned_ip, peer_addr, platform, client_version, \
              connected_at, last_activity, bytes_sent, bytes_received) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(&record.id)
        .bind(record.user_id)
        .bind(&record.assigned_ip)
        .bind(&record.peer_addr)
        .bind(&record.platform)
        .bind(&record.client_version)
        .bind(record.connected_at)
        .bind(record.last_activity)
        .bind(record.bytes_sent)
        .bind(record.bytes_received)
        .execute(&self.pool)
        .await
        .context("inserting session")?;
        Ok(())
    }

    async fn touch_session(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE sessions SET last_activity = NOW() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("updating session activity")?;
        Ok(())
    }

    async fn add_session_stats(&self, id: &str, sent: u64, received: u64) -> Result<()> {
        sqlx::query(
            "UPDATE sessions SET bytes_sent = bytes_sent + $2, \
             bytes_received = bytes_received + $3 WHERE id = $1",
        )
        .bind(id)
        .bind(sent as i64)
        .bind(received as i64)
        .execute(&self.pool)
        .await
        .context("updating session stats")?;
        Ok(())
    }

    async fn remove_session(&self, id: &str) -> Result<Option<SessionRecord>> {
        sqlx::query_as::<_, SessionRecord>(
            "DELETE FROM sessions WHERE id = $1 \
             RETURNING id, user_id, assigned_ip, peer_addr, platform, client_version, \
                       connected_at, last_activity, bytes_sent, bytes_received",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("removing session")
    }

    async fn remove_stale_sessions(&self, max_idle_minutes: i64) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM sessions WHERE last_activity < NOW() - ($1 * INTERVAL '1 minute')")
                .bind(max_idle_minutes)
                .execute(&self.pool)
                .await
                .context("removing stale sessions")?;
        Ok(result.rows_affected())
    }

    async fn append_event(&self, event: NewEvent<'_>) -> Result<()> {
        sqlx::query(
            "INSERT INTO connection_logs (user_id, event_type, peer_addr, platform, details) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(event.user_id)
        .bind(event.event.as_str())
        .bind(event.peer_addr)
        .bind(event.platform)
        .bind(event.details)
        .execute(&self.pool)
        .await
        .context("appending connection log")?;
        Ok(())
    }
}